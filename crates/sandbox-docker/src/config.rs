/// Size of the tmpfs mounted on `/tmp` when the root filesystem is read-only.
pub const DEFAULT_TMP_SIZE_MB: u64 = 64;

#[derive(Debug, Clone)]
pub struct DockerConfig {
    /// Unix socket path. `None` uses the local defaults (`DOCKER_HOST` or
    /// `/var/run/docker.sock`).
    pub socket: Option<String>,
    /// Pull images the daemon does not have yet.
    pub pull_missing: bool,
    pub tmp_size_mb: u64,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            socket: None,
            pull_missing: true,
            tmp_size_mb: DEFAULT_TMP_SIZE_MB,
        }
    }
}
