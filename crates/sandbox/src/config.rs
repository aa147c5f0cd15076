use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, SandboxError};
use crate::language::{
    CODE_PLACEHOLDER, LanguageDescriptor, LanguageRegistry, STDIN_PLACEHOLDER, WORKDIR_PLACEHOLDER,
};

/// Root of the writable scratch area inside every pooled container.
pub const WORKSPACE_DIR: &str = "/workspace";

/// Hard upper bound on any single execution, whatever the caller asks for.
pub const SYSTEM_MAX_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_INTERPRETED_TIMEOUT: Duration = Duration::from_secs(20);
pub const DEFAULT_COMPILED_TIMEOUT: Duration = Duration::from_secs(40);

pub const DEFAULT_MEMORY_MB: u64 = 512;
const INTERPRETED_CPUS: f64 = 0.5;
const COMPILED_CPUS: f64 = 1.0;
const NANO_CPUS_PER_CPU: f64 = 1_000_000_000.0;

const INTERPRETED_NPROC: i64 = 64;
/// Toolchains fan out into many short-lived processes while building.
const COMPILED_NPROC: i64 = 256;
const NOFILE: i64 = 256;
const FSIZE_BYTES: i64 = 10 * 1024 * 1024;

/// Captured bytes per stream; anything beyond is dropped and flagged.
pub const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ulimit {
    pub name: &'static str,
    pub soft: i64,
    pub hard: i64,
}

impl Ulimit {
    fn fixed(name: &'static str, value: i64) -> Self {
        Self {
            name,
            soft: value,
            hard: value,
        }
    }
}

/// Resource envelope applied when a container is created.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceLimits {
    pub memory_bytes: i64,
    pub nano_cpus: i64,
    /// Cgroup cap on tasks in the container. This is what stops fork bombs:
    /// execs run as root in the init user namespace, which the kernel exempts
    /// from the `nproc` ulimit. That ulimit only binds images whose default
    /// user is unprivileged.
    pub pids_limit: i64,
    pub ulimits: Vec<Ulimit>,
    pub readonly_rootfs: bool,
}

impl ResourceLimits {
    pub fn for_descriptor(descriptor: &LanguageDescriptor) -> Self {
        let memory_mb = descriptor.memory_mb.unwrap_or(DEFAULT_MEMORY_MB);
        let cpus = descriptor.cpus.unwrap_or(if descriptor.compiled {
            COMPILED_CPUS
        } else {
            INTERPRETED_CPUS
        });
        let nproc = if descriptor.compiled {
            COMPILED_NPROC
        } else {
            INTERPRETED_NPROC
        };
        let memory_bytes = i64::try_from(memory_mb.saturating_mul(1024 * 1024)).unwrap_or(i64::MAX);

        Self {
            memory_bytes,
            nano_cpus: (cpus * NANO_CPUS_PER_CPU).round() as i64,
            pids_limit: nproc,
            ulimits: vec![
                Ulimit::fixed("nproc", nproc),
                Ulimit::fixed("nofile", NOFILE),
                Ulimit::fixed("core", 0),
                Ulimit::fixed("fsize", FSIZE_BYTES),
            ],
            readonly_rootfs: !descriptor.compiled,
        }
    }
}

/// A host path exposed inside a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountBinding {
    pub host_path: PathBuf,
    pub container_path: String,
    pub read_only: bool,
}

/// Everything needed to run one submission. Built per request, never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxConfig {
    pub language_id: String,
    pub image: String,
    pub command: Vec<String>,
    /// Per-run directory inside the container, `/workspace/<run dir>`.
    pub workdir: String,
    pub code_path: String,
    pub stdin_path: String,
    pub host_code_path: PathBuf,
    pub host_stdin_path: PathBuf,
    pub resources: ResourceLimits,
    /// Binds used when the run gets its own container instead of a pooled one.
    pub mounts: Vec<MountBinding>,
    pub network_disabled: bool,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl SandboxConfig {
    /// Derive the sandbox description for one run.
    ///
    /// Pure: touches neither the filesystem nor the runtime. A `None` or zero
    /// `caller_timeout` selects the language profile's default; anything else
    /// is clamped to [`SYSTEM_MAX_TIMEOUT`].
    pub fn build(
        registry: &LanguageRegistry,
        language_id: &str,
        host_code_path: &Path,
        host_stdin_path: &Path,
        caller_timeout: Option<Duration>,
    ) -> Result<Self> {
        let descriptor = registry.lookup(language_id)?;

        let code_name = file_name(host_code_path, "code")?;
        let stdin_name = file_name(host_stdin_path, "stdin")?;
        let host_dir = host_code_path.parent().ok_or_else(|| {
            SandboxError::Config(format!(
                "code path has no parent directory: {}",
                host_code_path.display()
            ))
        })?;
        let run_dir = file_name(host_dir, "staging directory")?;

        let workdir = format!("{WORKSPACE_DIR}/{run_dir}");
        let code_path = format!("{workdir}/{code_name}");
        let stdin_path = format!("{workdir}/{stdin_name}");

        let command = descriptor
            .entry
            .iter()
            .map(|arg| {
                arg.replace(CODE_PLACEHOLDER, &code_path)
                    .replace(STDIN_PLACEHOLDER, &stdin_path)
                    .replace(WORKDIR_PLACEHOLDER, &workdir)
            })
            .collect();

        let mut mounts = vec![MountBinding {
            host_path: host_dir.to_path_buf(),
            container_path: workdir.clone(),
            read_only: true,
        }];
        if host_stdin_path.parent() != Some(host_dir) {
            mounts.push(MountBinding {
                host_path: host_stdin_path.to_path_buf(),
                container_path: stdin_path.clone(),
                read_only: true,
            });
        }

        Ok(Self {
            language_id: descriptor.id.clone(),
            image: descriptor.image.clone(),
            command,
            workdir,
            code_path,
            stdin_path,
            host_code_path: host_code_path.to_path_buf(),
            host_stdin_path: host_stdin_path.to_path_buf(),
            resources: ResourceLimits::for_descriptor(descriptor),
            mounts,
            network_disabled: true,
            timeout: effective_timeout(descriptor, caller_timeout),
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
        })
    }
}

fn effective_timeout(descriptor: &LanguageDescriptor, caller: Option<Duration>) -> Duration {
    let default = descriptor
        .timeout_secs
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
        .unwrap_or(if descriptor.compiled {
            DEFAULT_COMPILED_TIMEOUT
        } else {
            DEFAULT_INTERPRETED_TIMEOUT
        });
    caller
        .filter(|t| !t.is_zero())
        .unwrap_or(default)
        .min(SYSTEM_MAX_TIMEOUT)
}

fn file_name(path: &Path, label: &str) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| SandboxError::Config(format!("invalid {label} path: {}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> LanguageRegistry {
        LanguageRegistry::from_json(
            r#"{
                "python": { "image": "python:3.12-slim", "extension": ".py", "entry": "python3" },
                "go": {
                    "image": "golang:1.22-alpine",
                    "extension": ".go",
                    "entry": ["go", "run", "{code}"],
                    "compiled": true
                },
                "cat": {
                    "image": "alpine",
                    "extension": ".txt",
                    "entry": ["sh", "-c", "cat {code} < {stdin}"],
                    "memory_mb": 64,
                    "cpus": 0.25,
                    "timeout_secs": 5
                }
            }"#,
        )
        .unwrap()
    }

    fn build(lang: &str, timeout: Option<Duration>) -> Result<SandboxConfig> {
        SandboxConfig::build(
            &registry(),
            lang,
            Path::new("/tmp/cee/run-1/main.py"),
            Path::new("/tmp/cee/run-1/stdin.txt"),
            timeout,
        )
    }

    #[test]
    fn interpreted_profile() {
        let config = build("python", None).unwrap();
        assert_eq!(config.image, "python:3.12-slim");
        assert_eq!(config.workdir, "/workspace/run-1");
        assert_eq!(config.code_path, "/workspace/run-1/main.py");
        assert_eq!(config.stdin_path, "/workspace/run-1/stdin.txt");
        assert_eq!(config.command, vec!["python3", "/workspace/run-1/main.py"]);
        assert_eq!(config.timeout, DEFAULT_INTERPRETED_TIMEOUT);
        assert!(config.resources.readonly_rootfs);
        assert!(config.network_disabled);
        assert_eq!(config.resources.memory_bytes, 512 * 1024 * 1024);
        assert_eq!(config.resources.nano_cpus, 500_000_000);
    }

    #[test]
    fn compiled_profile_is_writable_with_longer_timeout() {
        let config = build("go", None).unwrap();
        assert!(!config.resources.readonly_rootfs);
        assert_eq!(config.timeout, DEFAULT_COMPILED_TIMEOUT);
        assert_eq!(config.resources.nano_cpus, 1_000_000_000);
        assert_eq!(config.command, vec!["go", "run", "/workspace/run-1/main.py"]);
    }

    #[test]
    fn descriptor_overrides_and_placeholders() {
        let config = build("cat", None).unwrap();
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.resources.memory_bytes, 64 * 1024 * 1024);
        assert_eq!(config.resources.nano_cpus, 250_000_000);
        assert_eq!(
            config.command,
            vec![
                "sh",
                "-c",
                "cat /workspace/run-1/main.py < /workspace/run-1/stdin.txt"
            ]
        );
    }

    #[test]
    fn timeout_is_clamped() {
        assert_eq!(
            build("python", Some(Duration::from_secs(3))).unwrap().timeout,
            Duration::from_secs(3)
        );
        assert_eq!(
            build("python", Some(Duration::from_secs(3600))).unwrap().timeout,
            SYSTEM_MAX_TIMEOUT
        );
        assert_eq!(
            build("python", Some(Duration::ZERO)).unwrap().timeout,
            DEFAULT_INTERPRETED_TIMEOUT
        );
    }

    #[test]
    fn timeout_always_within_bounds() {
        for secs in [0, 1, 19, 20, 59, 60, 61, u64::MAX / 2] {
            for lang in ["python", "go", "cat"] {
                let t = build(lang, Some(Duration::from_secs(secs))).unwrap().timeout;
                assert!(!t.is_zero());
                assert!(t <= SYSTEM_MAX_TIMEOUT);
            }
        }
    }

    #[test]
    fn ulimits_are_applied() {
        let config = build("python", None).unwrap();
        let names: Vec<_> = config.resources.ulimits.iter().map(|u| u.name).collect();
        assert_eq!(names, vec!["nproc", "nofile", "core", "fsize"]);
        let core = config
            .resources
            .ulimits
            .iter()
            .find(|u| u.name == "core")
            .unwrap();
        assert_eq!((core.soft, core.hard), (0, 0));
        assert_eq!(config.resources.pids_limit, 64);
    }

    #[test]
    fn every_profile_caps_process_count() {
        for lang in ["python", "go", "cat"] {
            let resources = build(lang, None).unwrap().resources;
            let nproc = resources
                .ulimits
                .iter()
                .find(|u| u.name == "nproc")
                .unwrap();
            assert!(resources.pids_limit > 0, "{lang}");
            assert_eq!(resources.pids_limit, nproc.hard, "{lang}");
        }
    }

    #[test]
    fn mounts_staging_dir_read_only() {
        let config = build("python", None).unwrap();
        assert_eq!(
            config.mounts,
            vec![MountBinding {
                host_path: PathBuf::from("/tmp/cee/run-1"),
                container_path: "/workspace/run-1".into(),
                read_only: true,
            }]
        );

        let split = SandboxConfig::build(
            &registry(),
            "python",
            Path::new("/tmp/cee/run-1/main.py"),
            Path::new("/tmp/other/input.txt"),
            None,
        )
        .unwrap();
        assert_eq!(split.mounts.len(), 2);
        assert_eq!(split.stdin_path, "/workspace/run-1/input.txt");
    }

    #[test]
    fn unknown_language_fails() {
        assert!(matches!(
            build("brainfuck", None),
            Err(SandboxError::Config(_))
        ));
    }

    #[test]
    fn rejects_paths_without_file_names() {
        let err = SandboxConfig::build(
            &registry(),
            "python",
            Path::new("/"),
            Path::new("/tmp/stdin.txt"),
            None,
        );
        assert!(matches!(err, Err(SandboxError::Config(_))));
    }
}
