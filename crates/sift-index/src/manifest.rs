//! Index manifest: the durable record of what is indexed.
//!
//! The manifest is a single JSON document per project, rewritten wholesale
//! on every transaction. Transactions are serialized through an async mutex
//! and persisted with write-new-then-rename, so a failed write leaves the
//! previous document on disk untouched.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Manifest file name inside the project index directory.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Current on-disk format. Documents with another version are ignored.
pub const MANIFEST_FORMAT_VERSION: u32 = 2;

/// State of one indexed file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    /// Modification time in milliseconds since the Unix epoch
    pub last_modified: u64,
    /// SHA256 of the content, absent when the file was recorded without hashing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    /// Number of chunks stored for this file
    pub chunk_count: usize,
}

/// Last-seen repository state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitState {
    pub branch: String,
    pub commit: String,
    pub timestamp: DateTime<Utc>,
}

impl GitState {
    pub fn new(branch: impl Into<String>, commit: impl Into<String>) -> Self {
        Self {
            branch: branch.into(),
            commit: commit.into(),
            timestamp: Utc::now(),
        }
    }

    /// Same branch and commit, ignoring when it was observed.
    pub fn same_revision(&self, other: &GitState) -> bool {
        self.branch == other.branch && self.commit == other.commit
    }
}

/// Manifest document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexManifest {
    pub format_version: u32,
    pub tool_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_indexed: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_state: Option<GitState>,
    /// Root-relative path -> entry
    #[serde(default)]
    pub files: BTreeMap<String, FileEntry>,
}

impl Default for IndexManifest {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexManifest {
    pub fn new() -> Self {
        Self {
            format_version: MANIFEST_FORMAT_VERSION,
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            last_indexed: None,
            git_state: None,
            files: BTreeMap::new(),
        }
    }

    /// Total chunks across all files.
    pub fn total_chunks(&self) -> usize {
        self.files.values().map(|e| e.chunk_count).sum()
    }
}

/// Errors that can occur when working with manifests.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("Manifest IO error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse manifest {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize manifest: {0}")]
    Serialize(#[source] serde_json::Error),
}

/// Transactional access to a project's manifest file.
pub struct ManifestStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ManifestStore {
    /// Store for the manifest inside `index_dir`.
    pub fn new(index_dir: &Path) -> Self {
        Self {
            path: index_dir.join(MANIFEST_FILE),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        self.path.with_extension("json.tmp")
    }

    /// Load the manifest, `None` if absent or written by another format version.
    pub async fn load(&self) -> Result<Option<IndexManifest>, ManifestError> {
        let _guard = self.lock.lock().await;
        self.read_from_disk().await
    }

    /// Apply `mutator` to the current manifest and persist the result.
    ///
    /// Creates an empty manifest when none exists. Transactions queue behind
    /// each other; the mutator must not perform I/O.
    pub async fn transaction<T, F>(&self, mutator: F) -> Result<T, ManifestError>
    where
        F: FnOnce(&mut IndexManifest) -> T,
    {
        let _guard = self.lock.lock().await;

        let mut manifest = self.read_from_disk().await?.unwrap_or_default();
        let result = mutator(&mut manifest);
        manifest.last_indexed = Some(Utc::now());
        self.write_atomic(&manifest).await?;

        Ok(result)
    }

    /// Like [`transaction`](Self::transaction) but a no-op when no manifest exists.
    async fn transaction_if_exists<F>(&self, mutator: F) -> Result<bool, ManifestError>
    where
        F: FnOnce(&mut IndexManifest),
    {
        let _guard = self.lock.lock().await;

        let Some(mut manifest) = self.read_from_disk().await? else {
            debug!("No manifest at {:?}, nothing to update", self.path);
            return Ok(false);
        };
        mutator(&mut manifest);
        manifest.last_indexed = Some(Utc::now());
        self.write_atomic(&manifest).await?;
        Ok(true)
    }

    pub async fn update_file(&self, path: &str, entry: FileEntry) -> Result<(), ManifestError> {
        let path = path.to_string();
        self.transaction(move |m| {
            m.files.insert(path, entry);
        })
        .await
    }

    /// Record several files in a single transaction.
    pub async fn update_files(
        &self,
        entries: Vec<(String, FileEntry)>,
    ) -> Result<(), ManifestError> {
        if entries.is_empty() {
            return Ok(());
        }
        self.transaction(move |m| {
            m.files.extend(entries);
        })
        .await
    }

    /// Record `entries` and drop `removed` in one transaction.
    pub async fn apply_batch(
        &self,
        entries: Vec<(String, FileEntry)>,
        removed: Vec<String>,
    ) -> Result<(), ManifestError> {
        if entries.is_empty() && removed.is_empty() {
            return Ok(());
        }
        self.transaction(move |m| {
            m.files.extend(entries);
            for path in &removed {
                m.files.remove(path);
            }
        })
        .await
    }

    pub async fn remove_file(&self, path: &str) -> Result<(), ManifestError> {
        self.transaction_if_exists(|m| {
            m.files.remove(path);
        })
        .await
        .map(|_| ())
    }

    pub async fn remove_files(&self, paths: &[String]) -> Result<(), ManifestError> {
        if paths.is_empty() {
            return Ok(());
        }
        self.transaction_if_exists(|m| {
            for path in paths {
                m.files.remove(path);
            }
        })
        .await
        .map(|_| ())
    }

    /// Record repository state. Creates the manifest if it does not exist yet.
    pub async fn update_git_state(&self, state: GitState) -> Result<(), ManifestError> {
        self.transaction(move |m| {
            m.git_state = Some(state);
        })
        .await
    }

    /// Replace the manifest with an empty one. The old document is never
    /// read, so this also recovers from a corrupt file.
    pub async fn clear(&self) -> Result<(), ManifestError> {
        let _guard = self.lock.lock().await;
        let mut manifest = IndexManifest::new();
        manifest.last_indexed = Some(Utc::now());
        self.write_atomic(&manifest).await
    }

    /// Paths currently recorded in the manifest.
    pub async fn get_indexed_files(&self) -> Result<Vec<String>, ManifestError> {
        Ok(self
            .load()
            .await?
            .map(|m| m.files.into_keys().collect())
            .unwrap_or_default())
    }

    pub async fn file_entry(&self, path: &str) -> Result<Option<FileEntry>, ManifestError> {
        Ok(self.load().await?.and_then(|mut m| m.files.remove(path)))
    }

    async fn read_from_disk(&self) -> Result<Option<IndexManifest>, ManifestError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(ManifestError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let manifest: IndexManifest =
            serde_json::from_slice(&bytes).map_err(|source| ManifestError::Parse {
                path: self.path.clone(),
                source,
            })?;

        if manifest.format_version != MANIFEST_FORMAT_VERSION {
            warn!(
                "Ignoring manifest {:?} with format version {} (expected {})",
                self.path, manifest.format_version, MANIFEST_FORMAT_VERSION
            );
            return Ok(None);
        }

        Ok(Some(manifest))
    }

    async fn write_atomic(&self, manifest: &IndexManifest) -> Result<(), ManifestError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| ManifestError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let bytes = serde_json::to_vec_pretty(manifest).map_err(ManifestError::Serialize)?;
        let tmp = self.tmp_path();

        let written = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(&bytes).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&tmp, &self.path).await
        }
        .await;

        if let Err(source) = written {
            // Best effort: never leave a stray temp file next to the manifest
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(ManifestError::Io {
                path: self.path.clone(),
                source,
            });
        }

        debug!(
            "Persisted manifest {:?} ({} files)",
            self.path,
            manifest.files.len()
        );
        Ok(())
    }
}
