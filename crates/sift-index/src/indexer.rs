//! Indexing pipeline.
//!
//! Ties change detection, chunking, embedding, the vector store and the
//! manifest together. File reads, hashing and embedding calls all happen
//! outside manifest transactions; only the final bookkeeping runs inside one.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::changes::{file_mtime_ms, ChangeDetectionResult, ChangeDetector, ChangeReason};
use crate::chunk::{Chunker, LineChunker};
use crate::coordinator::{ReindexCoordinator, ReindexState};
use crate::embeddings::EmbeddingProvider;
use crate::error::{IndexError, Result};
use crate::git::{GitCli, VersionControl};
use crate::manifest::{FileEntry, GitState, ManifestStore};
use crate::paths::normalize_to_relative;
use crate::scanner::{FileDiscovery, WalkScanner};
use crate::vector_store::VectorStore;

/// A file that could not be processed, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileFailure {
    pub path: String,
    pub error: String,
}

/// Per-file results of one batch. Failures never abort sibling files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    /// Re-chunked and re-embedded
    pub indexed: Vec<String>,
    /// Content unchanged, only the modification time was updated
    pub refreshed: Vec<String>,
    pub removed: Vec<String>,
    pub failed: Vec<FileFailure>,
    /// Chunks written to the vector store
    pub chunks: usize,
}

impl BatchOutcome {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    fn merge(&mut self, other: BatchOutcome) {
        self.indexed.extend(other.indexed);
        self.refreshed.extend(other.refreshed);
        self.removed.extend(other.removed);
        self.failed.extend(other.failed);
        self.chunks += other.chunks;
    }
}

/// Summary of one detection cycle.
#[derive(Debug, Clone, Serialize)]
pub struct IndexReport {
    pub reason: ChangeReason,
    pub added: usize,
    pub modified: usize,
    pub deleted: usize,
    pub outcome: BatchOutcome,
    pub duration_ms: u64,
}

/// Snapshot for `status` style queries.
#[derive(Debug, Clone, Serialize)]
pub struct IndexStatus {
    pub root: PathBuf,
    pub backend: &'static str,
    pub indexed_files: usize,
    pub manifest_chunks: usize,
    pub stored_chunks: usize,
    pub last_indexed: Option<DateTime<Utc>>,
    pub git_state: Option<GitState>,
    pub reindex: ReindexState,
}

enum FileWork {
    Indexed { entry: FileEntry, chunks: usize },
    Refreshed { entry: FileEntry },
    /// The store write failed after old vectors may have been deleted.
    Invalidated { error: IndexError },
}

fn hash_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub struct Indexer {
    root: PathBuf,
    manifest: Arc<ManifestStore>,
    detector: ChangeDetector,
    discovery: Arc<dyn FileDiscovery>,
    store: Arc<dyn VectorStore>,
    embeddings: Arc<dyn EmbeddingProvider>,
    chunker: Arc<dyn Chunker>,
    vcs: Arc<dyn VersionControl>,
    coordinator: Arc<ReindexCoordinator>,
    file_concurrency: usize,
}

/// Assembles an [`Indexer`]; collaborators not supplied fall back to defaults
/// derived from the indexing config.
pub struct IndexerBuilder {
    root: PathBuf,
    manifest: Arc<ManifestStore>,
    store: Arc<dyn VectorStore>,
    embeddings: Arc<dyn EmbeddingProvider>,
    config: sift_config::IndexingConfig,
    chunker: Option<Arc<dyn Chunker>>,
    discovery: Option<Arc<dyn FileDiscovery>>,
    vcs: Option<Arc<dyn VersionControl>>,
    coordinator: Option<Arc<ReindexCoordinator>>,
}

impl IndexerBuilder {
    pub fn config(mut self, config: &sift_config::IndexingConfig) -> Self {
        self.config = config.clone();
        self
    }

    pub fn chunker(mut self, chunker: Arc<dyn Chunker>) -> Self {
        self.chunker = Some(chunker);
        self
    }

    pub fn discovery(mut self, discovery: Arc<dyn FileDiscovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    pub fn vcs(mut self, vcs: Arc<dyn VersionControl>) -> Self {
        self.vcs = Some(vcs);
        self
    }

    pub fn coordinator(mut self, coordinator: Arc<ReindexCoordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    pub fn build(self) -> Indexer {
        let config = self.config;
        let chunker = self.chunker.unwrap_or_else(|| {
            Arc::new(LineChunker::new(config.chunk_lines, config.chunk_overlap))
        });
        let discovery = self
            .discovery
            .unwrap_or_else(|| Arc::new(WalkScanner::from_config(&config)));
        let vcs = self.vcs.unwrap_or_else(|| Arc::new(GitCli::new()));
        let coordinator = self.coordinator.unwrap_or_default();

        let detector = ChangeDetector::new(
            self.manifest.clone(),
            discovery.clone(),
            vcs.clone(),
            config.stat_concurrency,
        );

        Indexer {
            root: self.root,
            manifest: self.manifest,
            detector,
            discovery,
            store: self.store,
            embeddings: self.embeddings,
            chunker,
            vcs,
            coordinator,
            file_concurrency: config.file_concurrency.max(1),
        }
    }
}

impl Indexer {
    pub fn builder(
        root: impl Into<PathBuf>,
        manifest: Arc<ManifestStore>,
        store: Arc<dyn VectorStore>,
        embeddings: Arc<dyn EmbeddingProvider>,
    ) -> IndexerBuilder {
        IndexerBuilder {
            root: root.into(),
            manifest,
            store,
            embeddings,
            config: sift_config::IndexingConfig::default(),
            chunker: None,
            discovery: None,
            vcs: None,
            coordinator: None,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest(&self) -> &Arc<ManifestStore> {
        &self.manifest
    }

    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    pub fn coordinator(&self) -> &Arc<ReindexCoordinator> {
        &self.coordinator
    }

    /// Whether `relative` is a file this indexer would pick up.
    pub fn accepts(&self, relative: &str) -> bool {
        self.discovery.accepts(relative)
    }

    pub async fn detect_changes(&self) -> Result<ChangeDetectionResult> {
        self.detector.detect_changes(&self.root).await
    }

    /// One full detection cycle: detect, remove, index, record git state.
    pub async fn run(&self) -> Result<IndexReport> {
        let started = Instant::now();
        let changes = self.detect_changes().await?;
        info!(
            "Changes in {:?} ({}): {} added, {} modified, {} deleted",
            self.root,
            changes.reason,
            changes.added.len(),
            changes.modified.len(),
            changes.deleted.len()
        );

        let touched: Vec<String> = changes
            .to_index()
            .into_iter()
            .chain(changes.deleted.iter().cloned())
            .collect();
        self.coordinator.start(&touched);

        let result = self.apply(&changes).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let outcome = match result {
            Ok(outcome) => {
                if !touched.is_empty() {
                    self.coordinator.complete(duration_ms);
                }
                outcome
            }
            Err(e) => {
                if !touched.is_empty() {
                    self.coordinator.fail();
                }
                return Err(e);
            }
        };

        info!(
            "Index cycle done in {}ms: {} indexed, {} refreshed, {} removed, {} failed",
            duration_ms,
            outcome.indexed.len(),
            outcome.refreshed.len(),
            outcome.removed.len(),
            outcome.failed.len()
        );

        Ok(IndexReport {
            reason: changes.reason,
            added: changes.added.len(),
            modified: changes.modified.len(),
            deleted: changes.deleted.len(),
            outcome,
            duration_ms,
        })
    }

    async fn apply(&self, changes: &ChangeDetectionResult) -> Result<BatchOutcome> {
        let mut outcome = self.remove_files(&changes.deleted).await?;
        outcome.merge(self.index_files(&changes.to_index()).await?);

        match GitState::capture(self.vcs.as_ref(), &self.root).await {
            Some(state) => self.manifest.update_git_state(state).await?,
            // Make sure the next cycle sees a manifest even for an empty tree
            None => self.manifest.transaction(|_| ()).await?,
        }
        Ok(outcome)
    }

    /// Index `paths` (root-relative) with bounded concurrency.
    ///
    /// Files whose content hash is unchanged only get their modification
    /// time refreshed. Only successful files are written to the manifest; a
    /// file whose old vectors may already be gone loses its entry instead.
    pub async fn index_files(&self, paths: &[String]) -> Result<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        if paths.is_empty() {
            return Ok(outcome);
        }

        let known: BTreeMap<String, FileEntry> = self
            .manifest
            .load()
            .await?
            .map(|m| m.files)
            .unwrap_or_default();
        let known = &known;

        let mut results: Vec<(String, Result<FileWork>)> = stream::iter(paths.iter().cloned())
            .map(|path| async move {
                let work = self.process_file(&path, known.get(&path)).await;
                (path, work)
            })
            .buffer_unordered(self.file_concurrency)
            .collect()
            .await;
        results.sort_by(|a, b| a.0.cmp(&b.0));

        let mut entries = Vec::new();
        let mut invalidated = Vec::new();
        for (path, work) in results {
            match work {
                Ok(FileWork::Indexed { entry, chunks }) => {
                    outcome.chunks += chunks;
                    outcome.indexed.push(path.clone());
                    entries.push((path, entry));
                }
                Ok(FileWork::Refreshed { entry }) => {
                    outcome.refreshed.push(path.clone());
                    entries.push((path, entry));
                }
                Ok(FileWork::Invalidated { error }) => {
                    warn!("Failed to store {}, dropping its manifest entry: {}", path, error);
                    outcome.failed.push(FileFailure {
                        path: path.clone(),
                        error: error.to_string(),
                    });
                    invalidated.push(path);
                }
                Err(e) => {
                    warn!("Failed to index {}: {}", path, e);
                    outcome.failed.push(FileFailure {
                        path,
                        error: e.to_string(),
                    });
                }
            }
        }

        self.manifest.apply_batch(entries, invalidated).await?;
        Ok(outcome)
    }

    async fn process_file(&self, path: &str, previous: Option<&FileEntry>) -> Result<FileWork> {
        let absolute = self.root.join(path);
        let bytes = tokio::fs::read(&absolute)
            .await
            .map_err(|source| IndexError::Io {
                path: absolute.clone(),
                source,
            })?;
        let last_modified = file_mtime_ms(&absolute)
            .await
            .map_err(|source| IndexError::Io {
                path: absolute.clone(),
                source,
            })?;
        let content_hash = hash_bytes(&bytes);

        if let Some(previous) = previous {
            if previous.content_hash.as_deref() == Some(content_hash.as_str()) {
                debug!("{} unchanged, refreshing mtime", path);
                return Ok(FileWork::Refreshed {
                    entry: FileEntry {
                        last_modified,
                        content_hash: Some(content_hash),
                        chunk_count: previous.chunk_count,
                    },
                });
            }
        }

        let content = String::from_utf8_lossy(&bytes);
        let chunks = self
            .chunker
            .chunk(path, &content)
            .map_err(|source| IndexError::Chunking {
                path: path.to_string(),
                source,
            })?;

        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let vectors = if texts.is_empty() {
            Vec::new()
        } else {
            self.embeddings
                .embed_batch(&texts)
                .await
                .map_err(IndexError::Embedding)?
        };
        if vectors.len() != texts.len() {
            return Err(IndexError::EmbeddingCount {
                expected: texts.len(),
                got: vectors.len(),
            });
        }

        let (metadatas, contents): (Vec<_>, Vec<_>) =
            chunks.into_iter().map(|c| (c.metadata, c.content)).unzip();

        let stored = async {
            self.store.delete_by_file(path).await?;
            self.store.insert_batch(vectors, metadatas, contents).await
        };
        let written = match stored.await {
            Ok(written) => written,
            Err(e) => return Ok(FileWork::Invalidated { error: e.into() }),
        };
        debug!("Indexed {} ({} chunks)", path, written);

        Ok(FileWork::Indexed {
            entry: FileEntry {
                last_modified,
                content_hash: Some(content_hash),
                chunk_count: written,
            },
            chunks: written,
        })
    }

    /// Delete vectors, then manifest entries, for `paths`.
    pub async fn remove_files(&self, paths: &[String]) -> Result<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        if paths.is_empty() {
            return Ok(outcome);
        }

        for path in paths {
            match self.store.delete_by_file(path).await {
                Ok(()) => outcome.removed.push(path.clone()),
                Err(e) => {
                    warn!("Failed to delete vectors for {}: {}", path, e);
                    outcome.failed.push(FileFailure {
                        path: path.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        self.manifest.remove_files(&outcome.removed).await?;
        Ok(outcome)
    }

    /// Reindex specific paths, e.g. from the file watcher.
    ///
    /// Paths may be absolute or root-relative. Missing files are removed,
    /// present ones indexed when discovery would accept them. The work is tracked by the coordinator.
    pub async fn reindex_paths<P: AsRef<Path>>(&self, paths: &[P]) -> Result<BatchOutcome> {
        let mut seen = HashSet::new();
        let mut normalized = Vec::new();
        for path in paths {
            let relative = normalize_to_relative(path.as_ref(), &self.root);
            if relative.starts_with('/') || relative.starts_with("../") {
                warn!("Ignoring {} outside {:?}", relative, self.root);
                continue;
            }
            if !relative.is_empty() && seen.insert(relative.clone()) {
                normalized.push(relative);
            }
        }
        if normalized.is_empty() {
            return Ok(BatchOutcome::default());
        }

        let mut present = Vec::new();
        let mut absent = Vec::new();
        for path in normalized.iter() {
            match tokio::fs::metadata(self.root.join(path)).await {
                Ok(meta) if meta.is_file() => {
                    if self.accepts(path) {
                        present.push(path.clone());
                    } else {
                        debug!("Skipping {}, not an indexable file", path);
                    }
                }
                Ok(_) => {}
                Err(_) => absent.push(path.clone()),
            }
        }

        let started = Instant::now();
        self.coordinator.start(&normalized);
        let result = async {
            let mut outcome = self.remove_files(&absent).await?;
            outcome.merge(self.index_files(&present).await?);
            Ok::<_, IndexError>(outcome)
        }
        .await;

        match result {
            Ok(outcome) => {
                self.coordinator
                    .complete(started.elapsed().as_millis() as u64);
                Ok(outcome)
            }
            Err(e) => {
                self.coordinator.fail();
                Err(e)
            }
        }
    }

    /// Drop every chunk and manifest entry, then re-initialize the store.
    ///
    /// Works on a store that failed `initialize` and on an unreadable
    /// manifest, which makes it the recovery path for both.
    pub async fn clear(&self) -> Result<()> {
        self.store.clear().await?;
        self.manifest.clear().await?;
        self.store.initialize().await?;
        info!("Cleared index for {:?}", self.root);
        Ok(())
    }

    pub async fn status(&self) -> Result<IndexStatus> {
        let manifest = self.manifest.load().await?;
        let stored_chunks = self.store.count().await?;
        Ok(IndexStatus {
            root: self.root.clone(),
            backend: self.store.backend_name(),
            indexed_files: manifest.as_ref().map(|m| m.files.len()).unwrap_or(0),
            manifest_chunks: manifest.as_ref().map(|m| m.total_chunks()).unwrap_or(0),
            stored_chunks,
            last_indexed: manifest.as_ref().and_then(|m| m.last_indexed),
            git_state: manifest.and_then(|m| m.git_state),
            reindex: self.coordinator.snapshot(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_bytes_is_sha256_hex() {
        let hash = hash_bytes(b"test content\n");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, hash_bytes(b"test content\n"));
        assert_ne!(hash, hash_bytes(b"other"));
    }

    #[test]
    fn test_batch_outcome_merge() {
        let mut a = BatchOutcome {
            indexed: vec!["a.rs".to_string()],
            chunks: 2,
            ..Default::default()
        };
        a.merge(BatchOutcome {
            removed: vec!["b.rs".to_string()],
            failed: vec![FileFailure {
                path: "c.rs".to_string(),
                error: "boom".to_string(),
            }],
            chunks: 1,
            ..Default::default()
        });
        assert_eq!(a.chunks, 3);
        assert_eq!(a.removed, vec!["b.rs"]);
        assert!(!a.is_clean());
    }
}
