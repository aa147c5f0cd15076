use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::LogOutput;
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::models::{
    ContainerCreateBody, HostConfig, Mount, MountTypeEnum, ResourcesUlimits,
};
use bollard::query_parameters::{
    CreateContainerOptions, CreateImageOptionsBuilder, InspectContainerOptions,
    KillContainerOptionsBuilder, ListContainersOptionsBuilder, RemoveContainerOptionsBuilder,
    StartContainerOptions, StopContainerOptionsBuilder, UploadToContainerOptionsBuilder,
};
use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt};
use sandbox::{
    ContainerRuntime, ContainerSpec, ContainerStatus, ContainerSummary, ExecAttachment, ExecSpec,
    ExecStatus, OutputChunk, Result, SandboxError, short_id,
};
use tracing::{debug, info};

use crate::config::DockerConfig;

/// Seconds to wait for the daemon on a request.
const CLIENT_TIMEOUT_SECS: u64 = 120;

/// [`ContainerRuntime`] backed by the Docker Engine API.
pub struct DockerRuntime {
    docker: Docker,
    config: DockerConfig,
}

impl DockerRuntime {
    pub fn connect(config: DockerConfig) -> Result<Self> {
        let docker = match &config.socket {
            Some(socket) => {
                Docker::connect_with_unix(socket, CLIENT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
            }
            None => Docker::connect_with_local_defaults(),
        }
        .map_err(|e| SandboxError::BackendNotAvailable(format!("connect to docker: {e}")))?;
        Ok(Self { docker, config })
    }

    fn host_config(&self, spec: &ContainerSpec) -> HostConfig {
        let limits = &spec.resources;
        let mut mounts: Vec<Mount> = spec
            .binds
            .iter()
            .map(|bind| Mount {
                target: Some(bind.container_path.clone()),
                source: Some(bind.host_path.to_string_lossy().into_owned()),
                typ: Some(MountTypeEnum::BIND),
                read_only: Some(bind.read_only),
                ..Mount::default()
            })
            .collect();
        if let Some(scratch) = &spec.scratch_volume {
            mounts.push(Mount {
                target: Some(scratch.clone()),
                typ: Some(MountTypeEnum::VOLUME),
                read_only: Some(false),
                ..Mount::default()
            });
        }

        let tmpfs = limits.readonly_rootfs.then(|| {
            HashMap::from([(
                "/tmp".to_string(),
                format!("rw,nosuid,nodev,size={}m", self.config.tmp_size_mb),
            )])
        });

        HostConfig {
            memory: Some(limits.memory_bytes),
            // Same as memory: no swap.
            memory_swap: Some(limits.memory_bytes),
            nano_cpus: Some(limits.nano_cpus),
            pids_limit: Some(limits.pids_limit),
            ulimits: Some(
                limits
                    .ulimits
                    .iter()
                    .map(|u| ResourcesUlimits {
                        name: Some(u.name.to_string()),
                        soft: Some(u.soft),
                        hard: Some(u.hard),
                    })
                    .collect(),
            ),
            readonly_rootfs: Some(limits.readonly_rootfs),
            network_mode: spec.network_disabled.then(|| "none".to_string()),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            mounts: Some(mounts),
            tmpfs,
            ..HostConfig::default()
        }
    }
}

/// Map a daemon error, keeping 404s distinguishable.
fn map_err(op: &'static str, target: &str, e: BollardError) -> SandboxError {
    match e {
        BollardError::DockerResponseServerError {
            status_code: 404, ..
        } => SandboxError::NotFound(target.to_string()),
        e => SandboxError::runtime(op, e),
    }
}

/// Split `repo[:tag]`, ignoring a `:port` inside the registry host.
fn split_image_tag(image: &str) -> (&str, &str) {
    match image.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => (repo, tag),
        _ => (image, "latest"),
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn name(&self) -> &str {
        "docker"
    }

    async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| SandboxError::BackendNotAvailable(format!("docker ping: {e}")))
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }
        if !self.config.pull_missing {
            return Err(SandboxError::Config(format!(
                "image {image} not present and pulling is disabled"
            )));
        }

        let (repo, tag) = split_image_tag(image);
        info!(image = %image, "pulling image");
        self.docker
            .create_image(
                Some(CreateImageOptionsBuilder::new().from_image(repo).tag(tag).build()),
                None,
                None,
            )
            .try_collect::<Vec<_>>()
            .await
            .map_err(|e| map_err("pull_image", image, e))?;
        info!(image = %image, "image pulled");
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            labels: Some(spec.labels.clone()),
            working_dir: spec.workdir.clone(),
            network_disabled: Some(spec.network_disabled),
            host_config: Some(self.host_config(spec)),
            ..ContainerCreateBody::default()
        };
        let response = self
            .docker
            .create_container(None::<CreateContainerOptions>, body)
            .await
            .map_err(|e| map_err("create_container", &spec.image, e))?;
        for warning in &response.warnings {
            debug!(id = %short_id(&response.id), warning = %warning, "docker create warning");
        }
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions>)
            .await
            .map_err(|e| map_err("start_container", id, e))
    }

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<()> {
        let secs = i32::try_from(grace.as_secs()).unwrap_or(i32::MAX);
        self.docker
            .stop_container(id, Some(StopContainerOptionsBuilder::new().t(secs).build()))
            .await
            .map_err(|e| map_err("stop_container", id, e))
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        self.docker
            .remove_container(
                id,
                Some(
                    RemoveContainerOptionsBuilder::new()
                        .force(true)
                        .v(true)
                        .link(false)
                        .build(),
                ),
            )
            .await
            .map_err(|e| map_err("remove_container", id, e))
    }

    async fn kill_container(&self, id: &str, signal: &str) -> Result<()> {
        self.docker
            .kill_container(id, Some(KillContainerOptionsBuilder::new().signal(signal).build()))
            .await
            .map_err(|e| map_err("kill_container", id, e))
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerStatus> {
        let response = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| map_err("inspect_container", id, e))?;
        let state = response.state.unwrap_or_default();
        Ok(ContainerStatus {
            running: state.running.unwrap_or(false),
            state: state
                .status
                .map(|s| s.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        })
    }

    async fn list_containers(&self, labels: &[(&str, &str)]) -> Result<Vec<ContainerSummary>> {
        let filters: HashMap<String, Vec<String>> = HashMap::from([(
            "label".to_string(),
            labels.iter().map(|(k, v)| format!("{k}={v}")).collect(),
        )]);
        let containers = self
            .docker
            .list_containers(Some(
                ListContainersOptionsBuilder::new()
                    .all(true)
                    .filters(&filters)
                    .build(),
            ))
            .await
            .map_err(|e| SandboxError::runtime("list_containers", e))?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                Some(ContainerSummary {
                    id: c.id?,
                    image: c.image.unwrap_or_default(),
                    labels: c.labels.unwrap_or_default(),
                    state: c.state.map(|s| s.to_string()).unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn copy_archive(&self, id: &str, dest_dir: &str, archive: Bytes) -> Result<()> {
        self.docker
            .upload_to_container(
                id,
                Some(UploadToContainerOptionsBuilder::new().path(dest_dir).build()),
                bollard::body_full(archive),
            )
            .await
            .map_err(|e| map_err("copy_archive", id, e))
    }

    async fn create_exec(&self, id: &str, spec: &ExecSpec) -> Result<String> {
        let options = CreateExecOptions::<String> {
            cmd: Some(spec.command.clone()),
            working_dir: spec.workdir.clone(),
            attach_stdin: Some(spec.attach_stdin),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            ..Default::default()
        };
        let created = self
            .docker
            .create_exec(id, options)
            .await
            .map_err(|e| map_err("create_exec", id, e))?;
        Ok(created.id)
    }

    async fn start_exec(&self, exec_id: &str) -> Result<ExecAttachment> {
        let started = self
            .docker
            .start_exec(exec_id, None::<StartExecOptions>)
            .await
            .map_err(|e| map_err("start_exec", exec_id, e))?;
        match started {
            StartExecResults::Attached { output, input } => {
                // Only stdout and stderr frames matter; console frames only
                // appear with a tty, which is never allocated.
                let output = output.filter_map(|frame| async move {
                    match frame {
                        Ok(LogOutput::StdOut { message }) => Some(Ok(OutputChunk::Stdout(message))),
                        Ok(LogOutput::StdErr { message }) => Some(Ok(OutputChunk::Stderr(message))),
                        Ok(LogOutput::Console { message }) => {
                            Some(Ok(OutputChunk::Stdout(message)))
                        }
                        Ok(LogOutput::StdIn { .. }) => None,
                        Err(e) => Some(Err(SandboxError::runtime("exec_output", e))),
                    }
                });
                Ok(ExecAttachment {
                    output: Box::pin(output),
                    input,
                })
            }
            StartExecResults::Detached => Err(SandboxError::runtime(
                "start_exec",
                "exec started detached, no streams attached",
            )),
        }
    }

    async fn inspect_exec(&self, exec_id: &str) -> Result<ExecStatus> {
        let response = self
            .docker
            .inspect_exec(exec_id)
            .await
            .map_err(|e| map_err("inspect_exec", exec_id, e))?;
        Ok(ExecStatus {
            running: response.running.unwrap_or(false),
            exit_code: response.exit_code,
        })
    }
}

#[cfg(test)]
mod tests {
    use sandbox::{MountBinding, ResourceLimits, Ulimit};

    use super::*;

    fn runtime() -> DockerRuntime {
        // Connecting is lazy; no daemon is contacted until a request is made.
        DockerRuntime::connect(DockerConfig {
            socket: Some("/nonexistent/docker.sock".into()),
            ..DockerConfig::default()
        })
        .unwrap()
    }

    fn spec(readonly: bool) -> ContainerSpec {
        ContainerSpec {
            image: "python:3.12-slim".into(),
            command: vec!["tail".into(), "-f".into(), "/dev/null".into()],
            labels: HashMap::new(),
            workdir: Some("/workspace".into()),
            resources: ResourceLimits {
                memory_bytes: 512 * 1024 * 1024,
                nano_cpus: 500_000_000,
                pids_limit: 64,
                ulimits: vec![Ulimit {
                    name: "nofile",
                    soft: 256,
                    hard: 256,
                }],
                readonly_rootfs: readonly,
            },
            network_disabled: true,
            scratch_volume: Some("/workspace".into()),
            binds: vec![MountBinding {
                host_path: "/tmp/cee/run-1".into(),
                container_path: "/workspace/run-1".into(),
                read_only: true,
            }],
        }
    }

    #[test]
    fn split_image_tag_cases() {
        assert_eq!(split_image_tag("python:3.12-slim"), ("python", "3.12-slim"));
        assert_eq!(split_image_tag("python"), ("python", "latest"));
        assert_eq!(
            split_image_tag("registry.local:5000/team/node"),
            ("registry.local:5000/team/node", "latest")
        );
        assert_eq!(
            split_image_tag("registry.local:5000/team/node:20"),
            ("registry.local:5000/team/node", "20")
        );
    }

    #[tokio::test]
    async fn host_config_applies_limits_and_isolation() {
        let host = runtime().host_config(&spec(true));
        assert_eq!(host.memory, Some(512 * 1024 * 1024));
        assert_eq!(host.memory_swap, host.memory);
        assert_eq!(host.nano_cpus, Some(500_000_000));
        assert_eq!(host.pids_limit, Some(64));
        assert_eq!(host.readonly_rootfs, Some(true));
        assert_eq!(host.network_mode.as_deref(), Some("none"));
        assert!(host.tmpfs.is_some_and(|t| t.contains_key("/tmp")));

        let ulimits = host.ulimits.unwrap();
        assert_eq!(ulimits.len(), 1);
        assert_eq!(ulimits[0].name.as_deref(), Some("nofile"));

        let mounts = host.mounts.unwrap();
        assert_eq!(mounts.len(), 2);
        assert_eq!(mounts[0].typ, Some(MountTypeEnum::BIND));
        assert_eq!(mounts[0].read_only, Some(true));
        assert_eq!(mounts[1].typ, Some(MountTypeEnum::VOLUME));
        assert_eq!(mounts[1].target.as_deref(), Some("/workspace"));
    }

    #[tokio::test]
    async fn writable_root_gets_no_tmpfs() {
        let host = runtime().host_config(&spec(false));
        assert_eq!(host.readonly_rootfs, Some(false));
        assert!(host.tmpfs.is_none());
    }

    #[test]
    fn not_found_is_distinguished() {
        let err = map_err(
            "inspect_container",
            "abc",
            BollardError::DockerResponseServerError {
                status_code: 404,
                message: "no such container".into(),
            },
        );
        assert!(matches!(err, SandboxError::NotFound(ref id) if id == "abc"));

        let err = map_err(
            "inspect_container",
            "abc",
            BollardError::DockerResponseServerError {
                status_code: 500,
                message: "boom".into(),
            },
        );
        assert!(matches!(err, SandboxError::Runtime { op: "inspect_container", .. }));
    }
}
