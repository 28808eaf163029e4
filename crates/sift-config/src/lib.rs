//! Configuration management for sift.
//!
//! Configuration is layered, lowest priority first:
//! 1. Built-in defaults
//! 2. `~/.config/sift/config.toml`
//! 3. `<project>/.sift.toml`
//! 4. `SIFT__SECTION__KEY` environment variables

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Project-level config file name.
pub const PROJECT_CONFIG_FILE: &str = ".sift.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "SIFT";

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to expand path {path}: {reason}")]
    PathExpansion { path: String, reason: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Which vector store backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Single-tenant SQLite store inside the index directory
    #[default]
    Embedded,
    /// Multi-tenant Qdrant collection
    Qdrant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding one sub-directory per indexed project.
    pub index_root: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            index_root: "~/.sift/indices".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: BackendKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QdrantConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub collection: String,
    /// Tenant (organisation) every point is scoped to.
    pub org_id: Option<String>,
    /// Repository id within the tenant; defaults to the project directory name.
    pub repo_id: Option<String>,
    pub branch: Option<String>,
    pub commit: Option<String>,
}

impl Default for QdrantConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:6334".to_string(),
            api_key: None,
            collection: "sift-chunks".to_string(),
            org_id: None,
            repo_id: None,
            branch: None,
            commit: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// OpenAI-compatible embeddings endpoint.
    pub base_url: String,
    pub model: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    pub dimensions: usize,
    pub batch_size: usize,
    /// Maximum embedding requests in flight.
    pub concurrency: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434/v1/embeddings".to_string(),
            model: "nomic-embed-text".to_string(),
            api_key_env: "SIFT_EMBEDDINGS_API_KEY".to_string(),
            dimensions: 768,
            batch_size: 32,
            concurrency: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexingConfig {
    /// Concurrent `stat` calls during mtime change detection.
    pub stat_concurrency: usize,
    /// Files processed concurrently by the indexing pipeline.
    pub file_concurrency: usize,
    pub chunk_lines: usize,
    pub chunk_overlap: usize,
    pub extensions: Vec<String>,
    pub exclude_dirs: Vec<String>,
    pub respect_gitignore: bool,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            stat_concurrency: 32,
            file_concurrency: 8,
            chunk_lines: 75,
            chunk_overlap: 10,
            extensions: [
                "rs", "py", "js", "jsx", "ts", "tsx", "go", "java", "kt", "rb", "php", "c", "h",
                "cpp", "hpp", "cs", "swift", "scala", "vue", "md", "mdx",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            exclude_dirs: [
                "node_modules",
                "target",
                "dist",
                "build",
                "vendor",
                "__pycache__",
                ".git",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            respect_gitignore: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub debounce_ms: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self { debounce_ms: 500 }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SiftConfig {
    pub storage: StorageConfig,
    pub backend: BackendConfig,
    pub qdrant: QdrantConfig,
    pub embeddings: EmbeddingConfig,
    pub indexing: IndexingConfig,
    pub watcher: WatcherConfig,
}

impl SiftConfig {
    /// Load configuration for a project rooted at `project_root`.
    pub fn load(project_root: &Path) -> Result<Self, ConfigError> {
        Self::load_from(user_config_path().as_deref(), project_root)
    }

    /// Load configuration with an explicit user config file location.
    pub fn load_from(user_file: Option<&Path>, project_root: &Path) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();

        if let Some(user_file) = user_file {
            builder = builder.add_source(config::File::from(user_file.to_path_buf()).required(false));
        }

        builder = builder
            .add_source(
                config::File::from(project_root.join(PROJECT_CONFIG_FILE)).required(false),
            )
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );

        let loaded: SiftConfig = builder.build()?.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.indexing.stat_concurrency == 0 || self.indexing.file_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "indexing concurrency must be at least 1".to_string(),
            ));
        }
        if self.embeddings.concurrency == 0 || self.embeddings.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "embedding batch size and concurrency must be at least 1".to_string(),
            ));
        }
        if self.indexing.chunk_lines == 0
            || self.indexing.chunk_overlap >= self.indexing.chunk_lines
        {
            return Err(ConfigError::Invalid(format!(
                "chunk_overlap ({}) must be smaller than chunk_lines ({})",
                self.indexing.chunk_overlap, self.indexing.chunk_lines
            )));
        }
        if self.backend.kind == BackendKind::Qdrant
            && self.qdrant.org_id.as_deref().map_or(true, |s| s.trim().is_empty())
        {
            return Err(ConfigError::Invalid(
                "qdrant backend requires qdrant.org_id".to_string(),
            ));
        }
        Ok(())
    }

    /// The index root with `~` and environment variables expanded.
    pub fn index_root(&self) -> Result<PathBuf, ConfigError> {
        expand_path(&self.storage.index_root)
    }

    /// Write this configuration as a project config file.
    pub fn write_project_file(&self, project_root: &Path) -> Result<PathBuf, ConfigError> {
        let path = project_root.join(PROJECT_CONFIG_FILE);
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;
        Ok(path)
    }
}

/// Default location of the user-level config file.
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("sift").join("config.toml"))
}

/// Expand `~` and `$VAR` references in a configured path.
pub fn expand_path(raw: &str) -> Result<PathBuf, ConfigError> {
    let expanded = shellexpand::full(raw).map_err(|e| ConfigError::PathExpansion {
        path: raw.to_string(),
        reason: e.to_string(),
    })?;
    Ok(PathBuf::from(expanded.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_are_valid() {
        let config = SiftConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.backend.kind, BackendKind::Embedded);
        assert_eq!(config.indexing.chunk_lines, 75);
        assert_eq!(config.watcher.debounce_ms, 500);
    }

    #[test]
    fn test_project_file_overrides_defaults() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(PROJECT_CONFIG_FILE),
            r#"
[indexing]
file_concurrency = 2
chunk_lines = 40
chunk_overlap = 5

[watcher]
debounce_ms = 100
"#,
        )
        .unwrap();

        let config = SiftConfig::load_from(None, dir.path()).unwrap();
        assert_eq!(config.indexing.file_concurrency, 2);
        assert_eq!(config.indexing.chunk_lines, 40);
        assert_eq!(config.watcher.debounce_ms, 100);
        // Untouched sections keep their defaults
        assert_eq!(config.indexing.stat_concurrency, 32);
        assert_eq!(config.qdrant.collection, "sift-chunks");
    }

    #[test]
    fn test_missing_files_yield_defaults() {
        let dir = tempdir().unwrap();
        let missing_user = dir.path().join("nope.toml");
        let config = SiftConfig::load_from(Some(&missing_user), dir.path()).unwrap();
        assert_eq!(config.embeddings.batch_size, 32);
    }

    #[test]
    fn test_rejects_overlap_not_smaller_than_window() {
        let mut config = SiftConfig::default();
        config.indexing.chunk_overlap = config.indexing.chunk_lines;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_zero_concurrency() {
        let mut config = SiftConfig::default();
        config.indexing.stat_concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_qdrant_requires_org() {
        let mut config = SiftConfig::default();
        config.backend.kind = BackendKind::Qdrant;
        assert!(config.validate().is_err());

        config.qdrant.org_id = Some("acme".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_write_project_file_roundtrip() {
        let dir = tempdir().unwrap();
        let mut config = SiftConfig::default();
        config.backend.kind = BackendKind::Qdrant;
        config.qdrant.org_id = Some("acme".to_string());

        let path = config.write_project_file(dir.path()).unwrap();
        assert!(path.exists());

        let loaded = SiftConfig::load_from(None, dir.path()).unwrap();
        assert_eq!(loaded.backend.kind, BackendKind::Qdrant);
        assert_eq!(loaded.qdrant.org_id.as_deref(), Some("acme"));
    }

    #[test]
    fn test_expand_path_plain() {
        let path = expand_path("/tmp/sift").unwrap();
        assert_eq!(path, PathBuf::from("/tmp/sift"));
    }
}
