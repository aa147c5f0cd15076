use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::archive::build_archive;
use crate::config::{SandboxConfig, WORKSPACE_DIR};
use crate::error::{Result, SandboxError};
use crate::labels;
use crate::pool::Lease;
use crate::runtime::{
    ContainerRuntime, ContainerSpec, ExecAttachment, ExecSpec, OutputChunk, short_id,
};
use crate::types::{Classification, ExecutionResult, TIMEOUT_EXIT_CODE, UNKNOWN_EXIT_CODE};

/// Budget for killing a timed-out program before falling back to killing
/// the whole container.
const KILL_TIMEOUT: Duration = Duration::from_secs(2);
/// Budget for removing the per-run directory afterwards.
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(5);
/// Output has ended; the exec normally reports its exit code within a few polls.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(25);
const EXIT_POLL_ATTEMPTS: u32 = 40;
/// Ephemeral containers outlive their run by this much before exiting on
/// their own.
const EPHEMERAL_GRACE: Duration = Duration::from_secs(30);

/// Runs one program inside a container and collects its result.
#[derive(Clone)]
pub struct ExecutionEngine {
    runtime: Arc<dyn ContainerRuntime>,
}

/// Captured output, bounded per stream.
#[derive(Debug, Default)]
struct Capture {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl Capture {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    fn push(&mut self, chunk: OutputChunk) {
        let (buf, bytes) = match chunk {
            OutputChunk::Stdout(bytes) => (&mut self.stdout, bytes),
            OutputChunk::Stderr(bytes) => (&mut self.stderr, bytes),
        };
        let room = self.limit.saturating_sub(buf.len());
        if bytes.len() > room {
            self.truncated = true;
        }
        buf.extend_from_slice(bytes.get(..room.min(bytes.len())).unwrap_or_default());
    }
}

/// How the program session ended.
enum SessionEnd {
    Exited(i64),
    DeadlineReached,
}

impl ExecutionEngine {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }

    /// Run `config.command` in the leased container.
    ///
    /// The effective deadline is the earlier of `config.timeout` from now and
    /// `deadline`. Reaching it kills the program, taints the lease and yields
    /// a `TimedOut` result with whatever output was captured so far. The
    /// per-run directory is removed afterwards on every path.
    pub async fn run(
        &self,
        lease: &Lease,
        config: &SandboxConfig,
        deadline: Option<Instant>,
    ) -> Result<ExecutionResult> {
        let started = Instant::now();
        let id = lease.id();

        let (code, stdin) = read_inputs(config).await?;
        self.stage(id, config, &code, &stdin).await?;

        let result = self.execute(id, config, stdin, started, deadline).await;
        if result.as_ref().is_ok_and(ExecutionResult::timed_out) {
            lease.mark_tainted();
        }

        let cleanup = ExecSpec::helper(["rm", "-rf", config.workdir.as_str()]);
        if let Err(e) = self.run_helper(id, &cleanup, CLEANUP_TIMEOUT).await {
            debug!(id = %short_id(id), error = %e, "workdir cleanup failed");
        }

        result
    }

    /// Run in a dedicated container created for this request and removed
    /// right after. Used when the pool has no idle container to lend.
    ///
    /// The staging directory is bind-mounted read-only instead of copied.
    /// The keepalive exits on its own shortly after the deadline, so a
    /// container leaked by a crash ends up exited and gets swept.
    pub async fn run_ephemeral(
        &self,
        config: &SandboxConfig,
        deadline: Option<Instant>,
    ) -> Result<ExecutionResult> {
        let started = Instant::now();
        let (_, stdin) = read_inputs(config).await?;

        self.runtime.ensure_image(&config.image).await?;
        let keepalive_secs = (config.timeout + EPHEMERAL_GRACE).as_secs().max(1);
        let spec = ContainerSpec {
            image: config.image.clone(),
            command: vec!["sleep".into(), keepalive_secs.to_string()],
            labels: labels::ephemeral(),
            workdir: Some(WORKSPACE_DIR.to_string()),
            resources: config.resources.clone(),
            network_disabled: config.network_disabled,
            scratch_volume: None,
            binds: config.mounts.clone(),
        };
        let id = self.runtime.create_container(&spec).await?;
        info!(id = %short_id(&id), image = %config.image, "created ephemeral container");

        let result = match self.runtime.start_container(&id).await {
            Ok(()) => self.execute(&id, config, stdin, started, deadline).await,
            Err(e) => Err(e),
        };

        if let Err(e) = self.runtime.remove_container(&id).await {
            warn!(id = %short_id(&id), error = %e, "failed to remove ephemeral container, leaving it to the sweep");
        }
        result
    }

    /// Copy the source and stdin files into `/workspace/<run dir>`.
    async fn stage(
        &self,
        id: &str,
        config: &SandboxConfig,
        code: &[u8],
        stdin: &[u8],
    ) -> Result<()> {
        let run_dir = last_segment(&config.workdir);
        let archive = build_archive(
            run_dir,
            &[
                (last_segment(&config.code_path), code),
                (last_segment(&config.stdin_path), stdin),
            ],
        )?;
        self.runtime
            .copy_archive(id, WORKSPACE_DIR, archive)
            .await
            .map_err(|e| SandboxError::Staging(format!("copy into {}: {e}", short_id(id))))?;
        debug!(id = %short_id(id), workdir = %config.workdir, "staged files");
        Ok(())
    }

    async fn execute(
        &self,
        id: &str,
        config: &SandboxConfig,
        stdin: Vec<u8>,
        started: Instant,
        caller_deadline: Option<Instant>,
    ) -> Result<ExecutionResult> {
        let limit = started + config.timeout;
        let deadline = caller_deadline.map_or(limit, |d| d.min(limit));

        let mut capture = Capture::new(config.output_limit_bytes);
        // Exec creation and attach count against the deadline too: a stalled
        // daemon must not stretch the run past it.
        let session = async {
            let exec_id = self
                .runtime
                .create_exec(
                    id,
                    &ExecSpec {
                        command: config.command.clone(),
                        workdir: Some(config.workdir.clone()),
                        attach_stdin: true,
                    },
                )
                .await?;
            let ExecAttachment {
                mut output,
                mut input,
            } = self.runtime.start_exec(&exec_id).await?;
            debug!(id = %short_id(id), language = %config.language_id, "exec started");

            let feed = async {
                if !stdin.is_empty()
                    && let Err(e) = input.write_all(&stdin).await
                {
                    // The program may exit without reading its input.
                    debug!(error = %e, "stdin write failed");
                }
                if let Err(e) = input.shutdown().await {
                    debug!(error = %e, "stdin close failed");
                }
            };
            let drain = async {
                while let Some(chunk) = output.next().await {
                    capture.push(chunk?);
                }
                Ok::<_, SandboxError>(())
            };
            let ((), drained) = tokio::join!(feed, drain);
            drained?;
            Ok::<_, SandboxError>(exec_id)
        };

        let end = match tokio::time::timeout_at(deadline, session).await {
            Ok(exec_id) => SessionEnd::Exited(self.wait_exit(&exec_id?).await?),
            Err(_) => SessionEnd::DeadlineReached,
        };

        let Capture {
            stdout,
            mut stderr,
            truncated,
            ..
        } = capture;
        let duration = started.elapsed();

        let (exit_code, classification) = match end {
            SessionEnd::Exited(code) => {
                if code != 0 && stderr.is_empty() {
                    stderr = format!("process exited with code {code}").into_bytes();
                }
                (code, Classification::from_exit_code(code))
            }
            SessionEnd::DeadlineReached => {
                let budget = deadline.saturating_duration_since(started);
                warn!(
                    id = %short_id(id),
                    timeout_ms = budget.as_millis() as u64,
                    "execution deadline reached, killing"
                );
                self.kill_processes(id).await;
                if stderr.is_empty() {
                    stderr = format!("execution timed out after {}ms", budget.as_millis())
                        .into_bytes();
                }
                (TIMEOUT_EXIT_CODE, Classification::TimedOut)
            }
        };

        info!(
            id = %short_id(id),
            language = %config.language_id,
            exit_code,
            status = ?classification,
            duration_ms = duration.as_millis() as u64,
            truncated,
            "execution finished"
        );
        Ok(ExecutionResult {
            stdout,
            stderr,
            exit_code,
            classification,
            duration,
            truncated,
        })
    }

    /// Poll the exec until it reports an exit code.
    async fn wait_exit(&self, exec_id: &str) -> Result<i64> {
        for _ in 0..EXIT_POLL_ATTEMPTS {
            let status = self.runtime.inspect_exec(exec_id).await?;
            if !status.running {
                return Ok(status.exit_code.unwrap_or(UNKNOWN_EXIT_CODE));
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
        warn!(exec_id = %exec_id, "exec still running after output closed");
        Ok(UNKNOWN_EXIT_CODE)
    }

    /// Kill every process in the container except its init. If that is not
    /// possible, kill the container itself; the health checker replaces it.
    async fn kill_processes(&self, id: &str) {
        let kill = ExecSpec::helper(["kill", "-9", "-1"]);
        match self.run_helper(id, &kill, KILL_TIMEOUT).await {
            Ok(()) => debug!(id = %short_id(id), "killed container processes"),
            Err(e) => {
                warn!(id = %short_id(id), error = %e, "in-container kill failed, killing container");
                if let Err(e) = self.runtime.kill_container(id, "SIGKILL").await {
                    warn!(id = %short_id(id), error = %e, "failed to kill container");
                }
            }
        }
    }

    /// Run a short helper command and wait for its output to close.
    async fn run_helper(&self, id: &str, spec: &ExecSpec, budget: Duration) -> Result<()> {
        let helper = async {
            let exec_id = self.runtime.create_exec(id, spec).await?;
            let mut attachment = self.runtime.start_exec(&exec_id).await?;
            while let Some(chunk) = attachment.output.next().await {
                chunk?;
            }
            Ok::<_, SandboxError>(())
        };
        tokio::time::timeout(budget, helper)
            .await
            .map_err(|_| SandboxError::runtime("exec", format!("{:?} timed out", spec.command)))?
    }
}

async fn read_inputs(config: &SandboxConfig) -> Result<(Vec<u8>, Vec<u8>)> {
    let code = tokio::fs::read(&config.host_code_path).await.map_err(|e| {
        SandboxError::Staging(format!("read {}: {e}", config.host_code_path.display()))
    })?;
    let stdin = tokio::fs::read(&config.host_stdin_path).await.map_err(|e| {
        SandboxError::Staging(format!("read {}: {e}", config.host_stdin_path.display()))
    })?;
    Ok((code, stdin))
}

fn last_segment(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
