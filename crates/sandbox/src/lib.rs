mod archive;
mod config;
mod engine;
mod error;
pub mod labels;
mod language;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
mod pool;
mod runtime;
mod types;

pub use config::{
    DEFAULT_COMPILED_TIMEOUT, DEFAULT_INTERPRETED_TIMEOUT, DEFAULT_OUTPUT_LIMIT_BYTES,
    MountBinding, ResourceLimits, SYSTEM_MAX_TIMEOUT, SandboxConfig, Ulimit, WORKSPACE_DIR,
};
pub use engine::ExecutionEngine;
pub use error::{Result, SandboxError};
pub use language::{LanguageDescriptor, LanguageRegistry};
pub use pool::{
    ContainerState, HealthReport, Lease, PoolConfig, PoolManager, PoolStats, PooledContainer,
    WarmUpReport,
};
pub use runtime::{
    ContainerRuntime, ContainerSpec, ContainerStatus, ContainerSummary, ExecAttachment, ExecSpec,
    ExecStatus, InputSink, OutputChunk, OutputStream, short_id,
};
pub use types::{Classification, ExecutionResult, TIMEOUT_EXIT_CODE, UNKNOWN_EXIT_CODE};
