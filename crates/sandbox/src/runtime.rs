use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use tokio::io::AsyncWrite;

use crate::config::{MountBinding, ResourceLimits};
use crate::error::Result;

/// One demultiplexed frame of process output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChunk {
    Stdout(Bytes),
    Stderr(Bytes),
}

pub type OutputStream = Pin<Box<dyn Stream<Item = Result<OutputChunk>> + Send>>;
pub type InputSink = Pin<Box<dyn AsyncWrite + Send>>;

/// Live handles to a started exec: its output stream and its stdin.
pub struct ExecAttachment {
    pub output: OutputStream,
    pub input: InputSink,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecSpec {
    pub command: Vec<String>,
    pub workdir: Option<String>,
    pub attach_stdin: bool,
}

impl ExecSpec {
    /// Fire-and-forget helper command (cleanup, kill), no stdin.
    pub fn helper<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            workdir: None,
            attach_stdin: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecStatus {
    pub running: bool,
    pub exit_code: Option<i64>,
}

/// Parameters for creating a container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub image: String,
    pub command: Vec<String>,
    pub labels: HashMap<String, String>,
    pub workdir: Option<String>,
    pub resources: ResourceLimits,
    pub network_disabled: bool,
    /// Anonymous writable volume mounted at this path, so archives can be
    /// copied in even when the root filesystem is read-only.
    pub scratch_volume: Option<String>,
    pub binds: Vec<MountBinding>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerStatus {
    pub running: bool,
    /// Runtime state name (`running`, `exited`, `dead`, ...).
    pub state: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    pub image: String,
    pub labels: HashMap<String, String>,
    pub state: String,
}

impl ContainerSummary {
    pub fn has_label(&self, key: &str, value: &str) -> bool {
        self.labels.get(key).is_some_and(|v| v == value)
    }
}

/// Abstract container operations used by the pool manager and the engine.
///
/// Abstracted as a trait so tests can script container behavior instead of
/// talking to a daemon.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Human-readable backend name (e.g. "docker").
    fn name(&self) -> &str;

    async fn ping(&self) -> Result<()>;
    /// Pull the image if the runtime does not have it yet.
    async fn ensure_image(&self, image: &str) -> Result<()>;

    // -- container lifecycle --
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;
    async fn start_container(&self, id: &str) -> Result<()>;
    async fn stop_container(&self, id: &str, grace: Duration) -> Result<()>;
    /// Force-remove, including anonymous volumes.
    async fn remove_container(&self, id: &str) -> Result<()>;
    async fn kill_container(&self, id: &str, signal: &str) -> Result<()>;
    async fn inspect_container(&self, id: &str) -> Result<ContainerStatus>;
    /// All containers (any state) carrying every `key=value` label given.
    async fn list_containers(&self, labels: &[(&str, &str)]) -> Result<Vec<ContainerSummary>>;

    /// Extract a tar archive into `dest_dir` inside the container.
    async fn copy_archive(&self, id: &str, dest_dir: &str, archive: Bytes) -> Result<()>;

    // -- exec --
    async fn create_exec(&self, id: &str, spec: &ExecSpec) -> Result<String>;
    async fn start_exec(&self, exec_id: &str) -> Result<ExecAttachment>;
    async fn inspect_exec(&self, exec_id: &str) -> Result<ExecStatus>;
}

/// First 12 characters of a container id, as the docker CLI prints it.
pub fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_id_truncates_long_ids() {
        assert_eq!(short_id("0123456789abcdef0123"), "0123456789ab");
        assert_eq!(short_id("abc"), "abc");
    }

    #[test]
    fn helper_exec_has_no_stdin() {
        let spec = ExecSpec::helper(["rm", "-rf", "/workspace/x"]);
        assert_eq!(spec.command, vec!["rm", "-rf", "/workspace/x"]);
        assert!(!spec.attach_stdin);
        assert!(spec.workdir.is_none());
    }

    #[test]
    fn summary_label_match() {
        let summary = ContainerSummary {
            id: "c1".into(),
            image: "alpine".into(),
            labels: HashMap::from([("cee.pool".to_string(), "true".to_string())]),
            state: "exited".into(),
        };
        assert!(summary.has_label("cee.pool", "true"));
        assert!(!summary.has_label("cee.pool", "false"));
        assert!(!summary.has_label("cee.managed", "true"));
    }
}
