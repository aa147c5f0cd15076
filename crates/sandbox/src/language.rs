use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::Deserialize;

use crate::error::{Result, SandboxError};

/// Placeholder replaced with the in-container path of the staged source file.
pub const CODE_PLACEHOLDER: &str = "{code}";
/// Placeholder replaced with the in-container path of the staged stdin file.
pub const STDIN_PLACEHOLDER: &str = "{stdin}";
/// Placeholder replaced with the per-run working directory.
pub const WORKDIR_PLACEHOLDER: &str = "{workdir}";

/// How a language is launched.
///
/// A bare program name (`"python3"`) runs as `python3 {code}`; a list is
/// used as a template and must mention `{code}` somewhere.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
enum EntrySpec {
    Program(String),
    Template(Vec<String>),
}

impl EntrySpec {
    fn into_template(self) -> Vec<String> {
        match self {
            Self::Program(program) => vec![program, CODE_PLACEHOLDER.to_string()],
            Self::Template(template) => template,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawDescriptor {
    image: String,
    extension: String,
    entry: EntrySpec,
    #[serde(default)]
    compiled: bool,
    memory_mb: Option<u64>,
    cpus: Option<f64>,
    timeout_secs: Option<u64>,
}

/// One entry of the language registry.
#[derive(Debug, Clone, PartialEq)]
pub struct LanguageDescriptor {
    pub id: String,
    pub image: String,
    /// Source file extension, always with a leading `.`.
    pub extension: String,
    pub entry: Vec<String>,
    /// Compiled toolchains write build artifacts, so they get a writable
    /// root filesystem and a longer default timeout.
    pub compiled: bool,
    pub memory_mb: Option<u64>,
    pub cpus: Option<f64>,
    pub timeout_secs: Option<u64>,
}

impl LanguageDescriptor {
    /// File name the source is staged under (`main.py`, `main.go`, ...).
    pub fn source_file_name(&self) -> String {
        format!("main{}", self.extension)
    }

    fn from_raw(id: String, raw: RawDescriptor) -> Result<Self> {
        if raw.image.trim().is_empty() {
            return Err(SandboxError::Config(format!("language {id}: empty image")));
        }
        let entry = raw.entry.into_template();
        if entry.first().is_none_or(|program| program.trim().is_empty()) {
            return Err(SandboxError::Config(format!("language {id}: empty entry")));
        }
        if !entry.iter().any(|arg| arg.contains(CODE_PLACEHOLDER)) {
            return Err(SandboxError::Config(format!(
                "language {id}: entry never references {CODE_PLACEHOLDER}"
            )));
        }
        if let Some(cpus) = raw.cpus
            && !(cpus > 0.0 && cpus.is_finite())
        {
            return Err(SandboxError::Config(format!(
                "language {id}: cpus must be positive, got {cpus}"
            )));
        }
        let extension = match raw.extension.trim() {
            "" => String::new(),
            ext if ext.starts_with('.') => ext.to_string(),
            ext => format!(".{ext}"),
        };
        Ok(Self {
            id,
            image: raw.image,
            extension,
            entry,
            compiled: raw.compiled,
            memory_mb: raw.memory_mb,
            cpus: raw.cpus,
            timeout_secs: raw.timeout_secs,
        })
    }
}

/// Immutable language table, loaded once at startup and shared by `Arc`.
#[derive(Debug, Clone, Default)]
pub struct LanguageRegistry {
    languages: BTreeMap<String, LanguageDescriptor>,
}

impl LanguageRegistry {
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: BTreeMap<String, RawDescriptor> = serde_json::from_str(json)
            .map_err(|e| SandboxError::Config(format!("parse language registry: {e}")))?;
        if raw.is_empty() {
            return Err(SandboxError::Config("language registry is empty".into()));
        }
        let languages = raw
            .into_iter()
            .map(|(id, raw)| LanguageDescriptor::from_raw(id.clone(), raw).map(|d| (id, d)))
            .collect::<Result<_>>()?;
        Ok(Self { languages })
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let json = tokio::fs::read_to_string(path).await.map_err(|e| {
            SandboxError::Config(format!("read language registry {}: {e}", path.display()))
        })?;
        Self::from_json(&json)
    }

    pub fn lookup(&self, id: &str) -> Result<&LanguageDescriptor> {
        self.languages
            .get(id)
            .ok_or_else(|| SandboxError::Config(format!("unsupported language: {id}")))
    }

    pub fn iter(&self) -> impl Iterator<Item = &LanguageDescriptor> {
        self.languages.values()
    }

    /// Distinct images referenced by the registry, sorted.
    pub fn images(&self) -> Vec<String> {
        self.languages
            .values()
            .map(|d| d.image.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.languages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.languages.is_empty()
    }
}
