use std::path::Path;

use sandbox::{ContainerRuntime, SandboxError};

use crate::config::DockerConfig;

/// Verify the daemon is reachable and every language image is available
/// before the pool is warmed.
///
/// Collects all failures and returns them in a single `BackendNotAvailable` error.
pub async fn check_prerequisites(
    runtime: &dyn ContainerRuntime,
    config: &DockerConfig,
    images: &[String],
) -> Result<(), SandboxError> {
    let mut errors = Vec::new();

    if let Some(socket) = &config.socket {
        check_socket_exists(Path::new(socket), &mut errors);
    }
    if let Err(e) = runtime.ping().await {
        errors.push(e.to_string());
        // Nothing else can be checked without a daemon.
        return Err(SandboxError::BackendNotAvailable(errors.join("; ")));
    }
    for image in images {
        check_image(runtime, image, &mut errors).await;
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(SandboxError::BackendNotAvailable(errors.join("; ")))
    }
}

fn check_socket_exists(path: &Path, errors: &mut Vec<String>) {
    if !path.exists() {
        errors.push(format!("docker socket not found: {}", path.display()));
    }
}

async fn check_image(runtime: &dyn ContainerRuntime, image: &str, errors: &mut Vec<String>) {
    if let Err(e) = runtime.ensure_image(image).await {
        errors.push(format!("image {image} unavailable: {e}"));
    }
}

#[cfg(test)]
mod tests {
    use sandbox::mock::MockRuntime;

    use super::*;

    #[tokio::test]
    async fn passes_when_daemon_and_images_are_ready() {
        let runtime = MockRuntime::new();
        let images = vec!["python:3.12-slim".to_string(), "node:20-slim".to_string()];
        check_prerequisites(&runtime, &DockerConfig::default(), &images)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn collects_every_missing_image() {
        let runtime = MockRuntime::new();
        runtime.fail_image("golang:1.22");
        runtime.fail_image("rust:1.80");
        let images = vec![
            "python:3.12-slim".to_string(),
            "golang:1.22".to_string(),
            "rust:1.80".to_string(),
        ];
        let err = check_prerequisites(&runtime, &DockerConfig::default(), &images)
            .await
            .unwrap_err();
        let SandboxError::BackendNotAvailable(msg) = err else {
            panic!("unexpected error: {err}");
        };
        assert!(msg.contains("golang:1.22"));
        assert!(msg.contains("rust:1.80"));
        assert!(!msg.contains("python"));
    }

    #[tokio::test]
    async fn missing_socket_is_reported() {
        let runtime = MockRuntime::new();
        let config = DockerConfig {
            socket: Some("/nonexistent/docker.sock".into()),
            ..DockerConfig::default()
        };
        let err = check_prerequisites(&runtime, &config, &[])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("docker socket not found"));
    }
}
