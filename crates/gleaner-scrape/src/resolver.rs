//! Resolution of configuration names into [`FetchConfig`]s.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, warn};

use crate::{FetchConfig, ScrapeError};

/// Resolves a job's opaque configuration reference into fetch parameters.
#[async_trait]
pub trait ConfigResolver: Send + Sync {
    /// Load and validate the named configuration.
    ///
    /// Returns [`ScrapeError::ConfigNotFound`] when nothing exists under `name`.
    async fn resolve(&self, name: &str) -> Result<FetchConfig, ScrapeError>;

    /// Whether a configuration exists under `name`, valid or not.
    async fn contains(&self, name: &str) -> bool {
        !matches!(
            self.resolve(name).await,
            Err(ScrapeError::ConfigNotFound(_))
        )
    }
}

/// Resolver backed by a directory of `<name>.yaml` files.
#[derive(Debug, Clone)]
pub struct DirConfigResolver {
    dir: PathBuf,
}

impl DirConfigResolver {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Names of every configuration file in the directory, sorted.
    pub async fn list(&self) -> Result<Vec<String>, ScrapeError> {
        let mut names = Vec::new();
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_yaml = matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("yaml" | "yml")
            );
            if let (true, Some(stem)) = (is_yaml, path.file_stem().and_then(|s| s.to_str())) {
                names.push(stem.to_string());
            }
        }

        names.sort();
        names.dedup();
        Ok(names)
    }

    /// Find the file backing `name`, preferring `.yaml` over `.yml`.
    async fn locate(&self, name: &str) -> Result<Option<PathBuf>, ScrapeError> {
        let base = config_base_name(name)?;
        for ext in ["yaml", "yml"] {
            let path = self.dir.join(format!("{base}.{ext}"));
            if fs::try_exists(&path).await? {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl ConfigResolver for DirConfigResolver {
    async fn resolve(&self, name: &str) -> Result<FetchConfig, ScrapeError> {
        let Some(path) = self.locate(name).await? else {
            return Err(ScrapeError::ConfigNotFound(name.to_string()));
        };

        let content = fs::read_to_string(&path).await?;
        let config = FetchConfig::from_yaml(&content).inspect_err(|e| {
            warn!(path = %path.display(), error = %e, "invalid configuration file");
        })?;

        debug!(name, path = %path.display(), "resolved configuration");
        Ok(config)
    }

    async fn contains(&self, name: &str) -> bool {
        matches!(self.locate(name).await, Ok(Some(_)))
    }
}

/// In-memory resolver, for embedding and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticConfigResolver {
    configs: HashMap<String, FetchConfig>,
}

impl StaticConfigResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, name: impl Into<String>, config: FetchConfig) -> Self {
        self.configs.insert(name.into(), config);
        self
    }
}

#[async_trait]
impl ConfigResolver for StaticConfigResolver {
    async fn resolve(&self, name: &str) -> Result<FetchConfig, ScrapeError> {
        self.configs
            .get(name)
            .cloned()
            .ok_or_else(|| ScrapeError::ConfigNotFound(name.to_string()))
    }
}

/// Strip a YAML extension and reject names that would escape the directory.
fn config_base_name(name: &str) -> Result<&str, ScrapeError> {
    let base = name
        .strip_suffix(".yaml")
        .or_else(|| name.strip_suffix(".yml"))
        .unwrap_or(name);

    let valid = !base.is_empty()
        && !base.starts_with('.')
        && base
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));

    if valid {
        Ok(base)
    } else {
        Err(ScrapeError::InvalidConfig(format!(
            "invalid configuration name: '{name}'"
        )))
    }
}
