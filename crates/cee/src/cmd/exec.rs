use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use sandbox::{ContainerRuntime, LanguageRegistry, PoolConfig, PoolManager};
use sandbox_docker::DockerRuntime;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::config::{self, OnExhausted};
use crate::error::{ServiceError, ServiceResult};
use crate::executor::{ExecutionRequest, Executor, ExecutorConfig};

#[derive(Args)]
pub struct ExecArgs {
    /// Path to the cee.yaml config file
    #[arg(long, short)]
    config: PathBuf,
    /// Language id from the registry
    #[arg(long, short)]
    language: String,
    /// Source file to run
    #[arg(long, short)]
    file: PathBuf,
    /// File fed to the program's stdin
    #[arg(long)]
    stdin: Option<PathBuf>,
    /// Timeout in seconds (language default when omitted)
    #[arg(long)]
    timeout: Option<u64>,
}

/// Run one file in a dedicated container and mirror its output and exit code.
pub async fn run_exec(args: ExecArgs) -> ServiceResult<ExitCode> {
    let cee_config = config::load(&args.config).await?;
    let registry = Arc::new(LanguageRegistry::load(&cee_config.languages).await?);

    let code = read_input(&args.file).await?;
    let stdin = match &args.stdin {
        Some(path) => read_input(path).await?,
        None => String::new(),
    };

    let docker_config = cee_config.docker_config();
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::connect(docker_config)?);
    runtime.ping().await?;

    // No warm-up: every run falls through to a one-off container.
    let pool = Arc::new(PoolManager::new(runtime, PoolConfig::default()));
    let executor = Executor::new(
        registry,
        Arc::clone(&pool),
        ExecutorConfig {
            staging_dir: cee_config.staging_dir.clone(),
            max_timeout: sandbox::SYSTEM_MAX_TIMEOUT,
            acquire_wait: Duration::ZERO,
            on_exhausted: OnExhausted::Ephemeral,
        },
    );

    let result = executor
        .execute(ExecutionRequest {
            language: args.language,
            code,
            stdin,
            timeout: args.timeout.filter(|s| *s > 0).map(Duration::from_secs),
        })
        .await;
    pool.shutdown().await;
    let result = result?;

    let mut out = tokio::io::stdout();
    out.write_all(&result.stdout).await?;
    out.flush().await?;
    let mut err = tokio::io::stderr();
    err.write_all(&result.stderr).await?;
    err.flush().await?;

    if result.truncated {
        warn!("output was truncated");
    }
    Ok(ExitCode::from(exit_status(result.exit_code)))
}

async fn read_input(path: &std::path::Path) -> ServiceResult<String> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| ServiceError::BadRequest(format!("read {}: {e}", path.display())))
}

/// Exit statuses outside 0..=255 (including the unknown sentinel) become 1.
fn exit_status(code: i64) -> u8 {
    u8::try_from(code).unwrap_or(1)
}
