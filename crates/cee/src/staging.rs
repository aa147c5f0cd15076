use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use sandbox::SandboxError;
use tempfile::TempDir;
use tracing::warn;

use crate::error::ServiceResult;

pub(crate) const CODE_STEM: &str = "main";
pub(crate) const STDIN_FILE: &str = "stdin.txt";
const DIR_PREFIX: &str = "cee-";

/// Code and stdin written to a private per-request directory.
#[derive(Debug)]
pub struct StagedFiles {
    dir: TempDir,
    code_path: PathBuf,
    stdin_path: PathBuf,
}

impl StagedFiles {
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn code_path(&self) -> &Path {
        &self.code_path
    }

    pub fn stdin_path(&self) -> &Path {
        &self.stdin_path
    }

    /// Remove the directory. Failures are logged, never returned.
    pub fn cleanup(self) {
        let path = self.dir().to_path_buf();
        if let Err(e) = self.dir.close() {
            warn!(dir = %path.display(), error = %e, "failed to remove staging directory");
        }
    }
}

/// Write `main<extension>` and `stdin.txt` into a fresh directory under
/// `base_dir` (system temp dir when `None`).
pub async fn stage(
    base_dir: Option<&Path>,
    code: &str,
    stdin: &str,
    extension: &str,
) -> ServiceResult<StagedFiles> {
    let mut builder = tempfile::Builder::new();
    builder.prefix(DIR_PREFIX);
    let dir = match base_dir {
        Some(base) => builder.tempdir_in(base),
        None => builder.tempdir(),
    }
    .map_err(|e| staging_error("create staging directory", e))?;
    // Readable by the container user when bind-mounted.
    tokio::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o755))
        .await
        .map_err(|e| staging_error("chmod staging directory", e))?;

    let code_path = dir.path().join(format!("{CODE_STEM}{extension}"));
    let stdin_path = dir.path().join(STDIN_FILE);
    tokio::fs::write(&code_path, code)
        .await
        .map_err(|e| staging_error("write code", e))?;
    tokio::fs::write(&stdin_path, stdin)
        .await
        .map_err(|e| staging_error("write stdin", e))?;

    Ok(StagedFiles {
        dir,
        code_path,
        stdin_path,
    })
}

fn staging_error(what: &str, e: std::io::Error) -> SandboxError {
    SandboxError::Staging(format!("{what}: {e}"))
}
