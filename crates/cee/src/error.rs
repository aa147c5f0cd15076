use sandbox::SandboxError;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("config error: {0}")]
    Config(String),

    /// Malformed request that never reached the sandbox.
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServiceError {
    /// Whether the caller, not the service, is at fault.
    pub fn is_client_error(&self) -> bool {
        match self {
            Self::BadRequest(_) => true,
            Self::Sandbox(e) => e.is_client_error(),
            _ => false,
        }
    }

    /// Whether the request failed only for lack of a free container.
    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::Sandbox(e) if e.is_retryable())
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;
