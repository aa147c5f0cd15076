use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use sandbox::{ContainerRuntime, LanguageRegistry, PoolManager};
use sandbox_docker::DockerRuntime;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{self, OnExhausted};
use crate::error::{ServiceError, ServiceResult};
use crate::executor::{Executor, ExecutorConfig};
use crate::http;

#[derive(Args)]
pub struct ServeArgs {
    /// Path to the cee.yaml config file
    #[arg(long, short)]
    config: PathBuf,
    /// Address to listen on (overrides config)
    #[arg(long, env = "CEE_LISTEN")]
    listen: Option<String>,
}

/// Bring up the pool and serve HTTP until SIGINT or SIGTERM.
pub async fn run_serve(args: ServeArgs) -> ServiceResult<()> {
    let mut cee_config = config::load(&args.config).await?;
    if let Some(listen) = args.listen {
        cee_config.server.listen = listen;
    }

    let registry = Arc::new(LanguageRegistry::load(&cee_config.languages).await?);
    info!(languages = registry.len(), "language registry loaded");

    if let Some(dir) = &cee_config.staging_dir {
        tokio::fs::create_dir_all(dir).await.map_err(|e| {
            ServiceError::Config(format!("create staging_dir {}: {e}", dir.display()))
        })?;
    }

    let docker_config = cee_config.docker_config();
    let runtime: Arc<dyn ContainerRuntime> =
        Arc::new(DockerRuntime::connect(docker_config.clone())?);
    sandbox_docker::check_prerequisites(runtime.as_ref(), &docker_config, &registry.images())
        .await?;

    let pool = Arc::new(PoolManager::new(Arc::clone(&runtime), cee_config.pool_config()));
    if let Err(e) = pool.reap_orphans().await {
        warn!(error = %e, "orphan cleanup failed");
    }
    let report = pool.warm_up(&registry).await?;
    if report.created == 0 && cee_config.pool.on_exhausted == OnExhausted::Reject {
        return Err(ServiceError::Internal(
            "pool warm-up created no containers".into(),
        ));
    }

    let cancel = CancellationToken::new();
    let maintenance = pool.spawn_maintenance(cancel.clone());

    let executor = Arc::new(Executor::new(
        registry,
        Arc::clone(&pool),
        ExecutorConfig {
            staging_dir: cee_config.staging_dir.clone(),
            max_timeout: cee_config.max_timeout(),
            acquire_wait: cee_config.acquire_wait(),
            on_exhausted: cee_config.pool.on_exhausted,
        },
    ));
    let app = http::router(executor, &cee_config.server.cors_origins);

    let listener = TcpListener::bind(&cee_config.server.listen)
        .await
        .map_err(|e| ServiceError::Config(format!("bind {}: {e}", cee_config.server.listen)))?;
    info!(
        listen = %cee_config.server.listen,
        runtime = runtime.name(),
        pool = pool.stats().total(),
        "cee started"
    );

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    cancel.cancel();
    if let Err(e) = maintenance.await {
        error!(error = %e, "pool maintenance task panicked");
    }
    pool.shutdown().await;
    info!("cee stopped");

    served.map_err(ServiceError::from)
}

async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate()).ok();
    let mut sigint = signal(SignalKind::interrupt()).ok();

    tokio::select! {
        _ = recv_signal(&mut sigterm) => {
            info!("received SIGTERM, shutting down");
        }
        _ = recv_signal(&mut sigint) => {
            info!("received SIGINT, shutting down");
        }
    }
}

async fn recv_signal(sig: &mut Option<tokio::signal::unix::Signal>) {
    match sig {
        Some(s) => {
            s.recv().await;
        }
        None => std::future::pending().await,
    }
}
