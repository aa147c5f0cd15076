use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sandbox::{
    ExecutionEngine, ExecutionResult, LanguageRegistry, Lease, PoolManager, SandboxConfig,
    SandboxError,
};
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::OnExhausted;
use crate::error::{ServiceError, ServiceResult};
use crate::staging::{self, StagedFiles};

/// One code submission, as received at the boundary.
#[derive(Debug, Clone, Default)]
pub struct ExecutionRequest {
    pub language: String,
    pub code: String,
    pub stdin: String,
    /// Caller-requested timeout. `None` uses the language default.
    pub timeout: Option<Duration>,
}

/// Configuration for request orchestration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub staging_dir: Option<PathBuf>,
    /// Caller timeouts above this are clamped down to it.
    pub max_timeout: Duration,
    pub acquire_wait: Duration,
    pub on_exhausted: OnExhausted,
}

/// Drives a request through staging, the pool and the engine.
pub struct Executor {
    registry: Arc<LanguageRegistry>,
    pool: Arc<PoolManager>,
    engine: ExecutionEngine,
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(
        registry: Arc<LanguageRegistry>,
        pool: Arc<PoolManager>,
        config: ExecutorConfig,
    ) -> Self {
        let engine = ExecutionEngine::new(Arc::clone(pool.runtime()));
        Self {
            registry,
            pool,
            engine,
            config,
        }
    }

    pub fn pool(&self) -> &Arc<PoolManager> {
        &self.pool
    }

    /// Execute a request end to end.
    ///
    /// Unknown languages fail before anything is written to disk. The
    /// request's timeout runs from the moment it arrives, so staging and
    /// waiting for a container are part of it. Once a container is borrowed
    /// the run finishes on its own task: a caller that stops waiting cannot
    /// skip the kill, the workdir cleanup or the release.
    pub async fn execute(&self, request: ExecutionRequest) -> ServiceResult<ExecutionResult> {
        let received = Instant::now();
        let descriptor = self.registry.lookup(&request.language)?;
        let timeout = request.timeout.map(|t| t.min(self.config.max_timeout));

        let staged = staging::stage(
            self.config.staging_dir.as_deref(),
            &request.code,
            &request.stdin,
            &descriptor.extension,
        )
        .await?;
        let result = self
            .run_staged(&request.language, staged, timeout, received)
            .await;

        match &result {
            Ok(r) => info!(
                language = %request.language,
                status = ?r.classification,
                exit_code = r.exit_code,
                duration_ms = r.duration.as_millis() as u64,
                "execution finished"
            ),
            Err(e) if e.is_client_error() || e.is_capacity() => {
                warn!(language = %request.language, error = %e, "execution rejected")
            }
            Err(e) => error!(language = %request.language, error = %e, "execution failed"),
        }
        result
    }

    async fn run_staged(
        &self,
        language: &str,
        staged: StagedFiles,
        timeout: Option<Duration>,
        received: Instant,
    ) -> ServiceResult<ExecutionResult> {
        let config = SandboxConfig::build(
            &self.registry,
            language,
            staged.code_path(),
            staged.stdin_path(),
            timeout,
        )?;
        let deadline = received + config.timeout;

        let lease = match self.acquire(&config.image, deadline).await {
            Ok(lease) => Some(lease),
            Err(e) if e.is_retryable() && self.config.on_exhausted == OnExhausted::Ephemeral => {
                info!(image = %config.image, "pool exhausted, running in ephemeral container");
                None
            }
            Err(e) => return Err(e.into()),
        };

        let engine = self.engine.clone();
        let pool = Arc::clone(&self.pool);
        let run = tokio::spawn(async move {
            let result = match lease {
                Some(lease) => {
                    let result = engine.run(&lease, &config, Some(deadline)).await;
                    pool.release(lease);
                    result
                }
                None => engine.run_ephemeral(&config, Some(deadline)).await,
            };
            staged.cleanup();
            result
        });

        match run.await {
            Ok(result) => Ok(result?),
            Err(e) => Err(ServiceError::Internal(format!("execution task failed: {e}"))),
        }
    }

    /// Borrow a container, waiting for a release at most `acquire_wait` and
    /// never past the request deadline.
    async fn acquire(&self, image: &str, deadline: Instant) -> Result<Lease, SandboxError> {
        let wait = self
            .config
            .acquire_wait
            .min(deadline.saturating_duration_since(Instant::now()));
        if wait.is_zero() {
            self.pool.acquire(image)
        } else {
            self.pool.acquire_within(image, wait).await
        }
    }
}
