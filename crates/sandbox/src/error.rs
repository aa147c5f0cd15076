#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("backend not available: {0}")]
    BackendNotAvailable(String),

    /// Unknown language or malformed language/config input. Never retried.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// No idle pooled container for the image.
    #[error("no idle container available for image {image}")]
    NoCapacity { image: String },

    /// Host files could not be read or transferred into the container.
    #[error("staging failed: {0}")]
    Staging(String),

    /// The container runtime rejected or failed an operation.
    #[error("runtime {op} failed: {reason}")]
    Runtime { op: &'static str, reason: String },

    #[error("container not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    pub fn runtime(op: &'static str, reason: impl ToString) -> Self {
        Self::Runtime {
            op,
            reason: reason.to_string(),
        }
    }

    /// Only capacity exhaustion is worth retrying at the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NoCapacity { .. })
    }

    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_capacity_is_retryable() {
        assert!(
            SandboxError::NoCapacity {
                image: "python:3.12".into()
            }
            .is_retryable()
        );
        assert!(!SandboxError::Config("x".into()).is_retryable());
        assert!(!SandboxError::runtime("exec", "boom").is_retryable());
        assert!(!SandboxError::Staging("x".into()).is_retryable());
    }

    #[test]
    fn runtime_error_names_operation() {
        let err = SandboxError::runtime("create_exec", "daemon unreachable");
        assert_eq!(
            err.to_string(),
            "runtime create_exec failed: daemon unreachable"
        );
    }

    #[test]
    fn config_is_client_error() {
        assert!(SandboxError::Config("unsupported language: cobol".into()).is_client_error());
        assert!(
            !SandboxError::NoCapacity {
                image: "node".into()
            }
            .is_client_error()
        );
    }
}
