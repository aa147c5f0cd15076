mod exec;
mod serve;

pub use exec::{ExecArgs, run_exec};
pub use serve::{ServeArgs, run_serve};
