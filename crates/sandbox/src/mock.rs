//! In-memory [`ContainerRuntime`] with scriptable behavior, for tests that
//! must not depend on a container daemon.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SandboxError};
use crate::runtime::{
    ContainerRuntime, ContainerSpec, ContainerStatus, ContainerSummary, ExecAttachment, ExecSpec,
    ExecStatus, OutputChunk,
};

/// What a program exec (one with stdin attached) does when started.
#[derive(Debug, Clone, Default)]
pub struct ExecBehavior {
    /// Frames emitted in order.
    pub output: Vec<OutputChunk>,
    pub exit_code: i64,
    /// Keep the output stream open until the container's processes are killed.
    pub hang: bool,
    /// Read stdin to EOF and emit it on stdout after `output`.
    pub echo_stdin: bool,
    /// Report the exec as still running even after its output ends.
    pub never_exits: bool,
    /// Deliver output through a channel of capacity one, so every frame
    /// waits for the reader. Stdin is only read once all of `output` has
    /// been consumed.
    pub backpressure: bool,
}

/// Frames buffered per exec when `backpressure` is off.
const OUTPUT_BUFFER: usize = 1024;

#[derive(Debug)]
struct MockContainer {
    image: String,
    labels: HashMap<String, String>,
    state: String,
    kill: CancellationToken,
}

#[derive(Debug)]
struct MockExec {
    container: String,
    spec: ExecSpec,
    running: bool,
    exit_code: Option<i64>,
}

#[derive(Debug, Default)]
struct MockState {
    containers: HashMap<String, MockContainer>,
    execs: HashMap<String, MockExec>,
    next_id: u64,
    created: usize,
    last_spec: Option<ContainerSpec>,
    fail_creates: usize,
    failed_images: HashSet<String>,
    hung_inspect: HashSet<String>,
    fail_copy: bool,
    fail_kill_exec: bool,
    fail_program_exec: bool,
    stall_program_exec: bool,
    behavior: ExecBehavior,
    copies: Vec<(String, String, Bytes)>,
    killed_containers: Vec<String>,
}

#[derive(Debug, Default)]
pub struct MockRuntime {
    state: Arc<Mutex<MockState>>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        lock_state(&self.state)
    }

    fn next_id(state: &mut MockState, prefix: &str) -> String {
        state.next_id += 1;
        format!("{prefix}{:016x}{:016x}", state.next_id, state.next_id)
    }

    // -- scripting --

    pub fn script(&self, behavior: ExecBehavior) {
        self.lock().behavior = behavior;
    }

    pub fn fail_next_creates(&self, count: usize) {
        self.lock().fail_creates = count;
    }

    pub fn fail_image(&self, image: &str) {
        self.lock().failed_images.insert(image.to_string());
    }

    pub fn hang_inspect(&self, id: &str) {
        self.lock().hung_inspect.insert(id.to_string());
    }

    pub fn fail_copy(&self, fail: bool) {
        self.lock().fail_copy = fail;
    }

    pub fn fail_kill_exec(&self, fail: bool) {
        self.lock().fail_kill_exec = fail;
    }

    pub fn fail_program_exec(&self, fail: bool) {
        self.lock().fail_program_exec = fail;
    }

    /// Make starting a program exec hang, as a stalled daemon would.
    pub fn stall_program_exec(&self, stall: bool) {
        self.lock().stall_program_exec = stall;
    }

    /// Simulate the container's main process dying.
    pub fn crash(&self, id: &str) {
        if let Some(container) = self.lock().containers.get_mut(id) {
            container.state = "exited".into();
            container.kill.cancel();
        }
    }

    /// Register a container this runtime did not create through the trait.
    pub fn add_foreign(&self, labels: HashMap<String, String>, state: &str) -> String {
        let mut guard = self.lock();
        let id = Self::next_id(&mut guard, "f");
        guard.containers.insert(
            id.clone(),
            MockContainer {
                image: "foreign".into(),
                labels,
                state: state.to_string(),
                kill: CancellationToken::new(),
            },
        );
        id
    }

    // -- observation --

    pub fn exists(&self, id: &str) -> bool {
        self.lock().containers.contains_key(id)
    }

    pub fn live_count(&self) -> usize {
        self.lock().containers.len()
    }

    pub fn running_count(&self) -> usize {
        self.lock()
            .containers
            .values()
            .filter(|c| c.state == "running")
            .count()
    }

    pub fn created_count(&self) -> usize {
        self.lock().created
    }

    pub fn last_spec(&self) -> Option<ContainerSpec> {
        self.lock().last_spec.clone()
    }

    pub fn copies(&self) -> Vec<(String, String, Bytes)> {
        self.lock().copies.clone()
    }

    /// Commands of every exec created so far, in creation order.
    pub fn exec_commands(&self) -> Vec<Vec<String>> {
        let guard = self.lock();
        let mut execs: Vec<_> = guard.execs.iter().collect();
        execs.sort_by(|a, b| a.0.cmp(b.0));
        execs
            .into_iter()
            .map(|(_, exec)| exec.spec.command.clone())
            .collect()
    }

    pub fn killed_containers(&self) -> Vec<String> {
        self.lock().killed_containers.clone()
    }

    fn missing(id: &str) -> SandboxError {
        SandboxError::NotFound(id.to_string())
    }
}

fn lock_state(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn finish_exec(state: &Mutex<MockState>, exec_id: &str, exit_code: i64) {
    if let Some(exec) = lock_state(state).execs.get_mut(exec_id) {
        exec.running = false;
        exec.exit_code = Some(exit_code);
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    fn name(&self) -> &str {
        "mock"
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.lock().failed_images.contains(image) {
            return Err(SandboxError::runtime("ensure_image", format!("pull {image} denied")));
        }
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let mut guard = self.lock();
        if guard.fail_creates > 0 {
            guard.fail_creates -= 1;
            return Err(SandboxError::runtime("create_container", "injected failure"));
        }
        if guard.failed_images.contains(&spec.image) {
            return Err(SandboxError::runtime("create_container", "no such image"));
        }
        let id = Self::next_id(&mut guard, "c");
        guard.created += 1;
        guard.last_spec = Some(spec.clone());
        guard.containers.insert(
            id.clone(),
            MockContainer {
                image: spec.image.clone(),
                labels: spec.labels.clone(),
                state: "created".into(),
                kill: CancellationToken::new(),
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        let mut guard = self.lock();
        let container = guard.containers.get_mut(id).ok_or_else(|| Self::missing(id))?;
        container.state = "running".into();
        Ok(())
    }

    async fn stop_container(&self, id: &str, _grace: Duration) -> Result<()> {
        let mut guard = self.lock();
        let container = guard.containers.get_mut(id).ok_or_else(|| Self::missing(id))?;
        container.state = "exited".into();
        container.kill.cancel();
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let removed = self.lock().containers.remove(id);
        match removed {
            Some(container) => {
                container.kill.cancel();
                Ok(())
            }
            None => Err(Self::missing(id)),
        }
    }

    async fn kill_container(&self, id: &str, _signal: &str) -> Result<()> {
        let mut guard = self.lock();
        let container = guard.containers.get_mut(id).ok_or_else(|| Self::missing(id))?;
        container.state = "exited".into();
        container.kill.cancel();
        guard.killed_containers.push(id.to_string());
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerStatus> {
        let status = {
            let guard = self.lock();
            if guard.hung_inspect.contains(id) {
                None
            } else {
                let container = guard.containers.get(id).ok_or_else(|| Self::missing(id))?;
                Some(ContainerStatus {
                    running: container.state == "running",
                    state: container.state.clone(),
                })
            }
        };
        match status {
            Some(status) => Ok(status),
            None => std::future::pending().await,
        }
    }

    async fn list_containers(&self, labels: &[(&str, &str)]) -> Result<Vec<ContainerSummary>> {
        let guard = self.lock();
        Ok(guard
            .containers
            .iter()
            .filter(|(_, c)| {
                labels
                    .iter()
                    .all(|(k, v)| c.labels.get(*k).is_some_and(|value| value == v))
            })
            .map(|(id, c)| ContainerSummary {
                id: id.clone(),
                image: c.image.clone(),
                labels: c.labels.clone(),
                state: c.state.clone(),
            })
            .collect())
    }

    async fn copy_archive(&self, id: &str, dest_dir: &str, archive: Bytes) -> Result<()> {
        let mut guard = self.lock();
        if guard.fail_copy {
            return Err(SandboxError::runtime("copy_archive", "injected failure"));
        }
        if !guard.containers.contains_key(id) {
            return Err(Self::missing(id));
        }
        guard
            .copies
            .push((id.to_string(), dest_dir.to_string(), archive));
        Ok(())
    }

    async fn create_exec(&self, id: &str, spec: &ExecSpec) -> Result<String> {
        let mut guard = self.lock();
        let running = guard
            .containers
            .get(id)
            .ok_or_else(|| Self::missing(id))?
            .state
            == "running";
        if !running {
            return Err(SandboxError::runtime("create_exec", "container is not running"));
        }
        let is_kill = spec.command.first().is_some_and(|p| p == "kill");
        if (is_kill && guard.fail_kill_exec) || (spec.attach_stdin && guard.fail_program_exec) {
            return Err(SandboxError::runtime("create_exec", "injected failure"));
        }
        let exec_id = Self::next_id(&mut guard, "e");
        guard.execs.insert(
            exec_id.clone(),
            MockExec {
                container: id.to_string(),
                spec: spec.clone(),
                running: false,
                exit_code: None,
            },
        );
        Ok(exec_id)
    }

    async fn start_exec(&self, exec_id: &str) -> Result<ExecAttachment> {
        let (spec, kill, behavior, stalled) = {
            let mut guard = self.lock();
            let stalled = guard.stall_program_exec;
            let behavior = guard.behavior.clone();
            let exec = guard
                .execs
                .get_mut(exec_id)
                .ok_or_else(|| Self::missing(exec_id))?;
            exec.running = true;
            let spec = exec.spec.clone();
            let container = exec.container.clone();
            let kill = guard
                .containers
                .get(&container)
                .map(|c| c.kill.clone())
                .ok_or_else(|| Self::missing(&container))?;
            if spec.command.first().is_some_and(|p| p == "kill") {
                kill.cancel();
                if let Some(c) = guard.containers.get_mut(&container) {
                    c.kill = CancellationToken::new();
                }
            }
            (spec, kill, behavior, stalled)
        };
        if stalled && spec.attach_stdin {
            return std::future::pending().await;
        }

        let capacity = if behavior.backpressure { 1 } else { OUTPUT_BUFFER };
        let (tx, rx) = mpsc::channel::<OutputChunk>(capacity);
        let (client, mut server) = tokio::io::duplex(64 * 1024);

        if !spec.attach_stdin {
            drop(tx);
            drop(server);
            finish_exec(&self.state, exec_id, 0);
        } else {
            let state = Arc::clone(&self.state);
            let exec_id = exec_id.to_string();
            tokio::spawn(async move {
                for chunk in behavior.output {
                    tokio::select! {
                        sent = tx.send(chunk) => {
                            if sent.is_err() {
                                break;
                            }
                        }
                        _ = kill.cancelled() => break,
                    }
                }
                if behavior.echo_stdin {
                    let mut input = Vec::new();
                    tokio::select! {
                        _ = server.read_to_end(&mut input) => {
                            let _ = tx.send(OutputChunk::Stdout(Bytes::from(input))).await;
                        }
                        _ = kill.cancelled() => {}
                    }
                }
                let killed = if behavior.hang {
                    kill.cancelled().await;
                    true
                } else {
                    kill.is_cancelled()
                };
                if killed || !behavior.never_exits {
                    finish_exec(&state, &exec_id, if killed { 137 } else { behavior.exit_code });
                }
                drop(server);
                drop(tx);
            });
        }

        let output = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|chunk| (Ok(chunk), rx))
        });
        Ok(ExecAttachment {
            output: Box::pin(output),
            input: Box::pin(client),
        })
    }

    async fn inspect_exec(&self, exec_id: &str) -> Result<ExecStatus> {
        let guard = self.lock();
        let exec = guard
            .execs
            .get(exec_id)
            .ok_or_else(|| Self::missing(exec_id))?;
        Ok(ExecStatus {
            running: exec.running,
            exit_code: exec.exit_code,
        })
    }
}
