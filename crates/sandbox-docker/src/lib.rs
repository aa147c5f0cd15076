mod config;
mod prerequisites;
mod runtime;

pub use config::{DEFAULT_TMP_SIZE_MB, DockerConfig};
pub use prerequisites::check_prerequisites;
pub use runtime::DockerRuntime;
