//! Change detection between the manifest and the live file set.
//!
//! Strategies, cheapest correct one first:
//! 1. no manifest: every file is added (`full`)
//! 2. saved git state differs from the current one: git diff (`git-state-changed`)
//! 3. otherwise: compare modification times (`mtime`)

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{IndexError, Result};
use crate::git::VersionControl;
use crate::manifest::{FileEntry, GitState, IndexManifest, ManifestStore};
use crate::paths::normalize_to_relative;
use crate::scanner::FileDiscovery;

/// Which strategy produced a diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChangeReason {
    Mtime,
    Full,
    GitStateChanged,
}

impl ChangeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeReason::Mtime => "mtime",
            ChangeReason::Full => "full",
            ChangeReason::GitStateChanged => "git-state-changed",
        }
    }
}

impl std::fmt::Display for ChangeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Categorised diff, recomputed every cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeDetectionResult {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub deleted: Vec<String>,
    pub reason: ChangeReason,
}

impl ChangeDetectionResult {
    fn new(reason: ChangeReason) -> Self {
        Self {
            added: Vec::new(),
            modified: Vec::new(),
            deleted: Vec::new(),
            reason,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    /// Paths that need (re)indexing: added then modified.
    pub fn to_index(&self) -> Vec<String> {
        self.added.iter().chain(self.modified.iter()).cloned().collect()
    }

    fn sort(mut self) -> Self {
        self.added.sort();
        self.modified.sort();
        self.deleted.sort();
        self
    }
}

/// Modification time in milliseconds since the Unix epoch.
pub async fn file_mtime_ms(path: &Path) -> std::io::Result<u64> {
    let modified = tokio::fs::metadata(path).await?.modified()?;
    Ok(modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0))
}

pub struct ChangeDetector {
    manifest: Arc<ManifestStore>,
    discovery: Arc<dyn FileDiscovery>,
    vcs: Arc<dyn VersionControl>,
    stat_concurrency: usize,
}

impl ChangeDetector {
    pub fn new(
        manifest: Arc<ManifestStore>,
        discovery: Arc<dyn FileDiscovery>,
        vcs: Arc<dyn VersionControl>,
        stat_concurrency: usize,
    ) -> Self {
        Self {
            manifest,
            discovery,
            vcs,
            stat_concurrency: stat_concurrency.max(1),
        }
    }

    /// Current indexable files under `root`, normalised.
    pub async fn discover(&self, root: &Path) -> Result<Vec<String>> {
        let discovery = self.discovery.clone();
        let root_buf = root.to_path_buf();
        tokio::task::spawn_blocking(move || discovery.discover(&root_buf))
            .await?
            .map_err(IndexError::Discovery)
    }

    pub async fn detect_changes(&self, root: &Path) -> Result<ChangeDetectionResult> {
        let current = self.discover(root).await?;

        let Some(manifest) = self.manifest.load().await? else {
            info!("No manifest for {:?}, full index of {} files", root, current.len());
            let mut result = ChangeDetectionResult::new(ChangeReason::Full);
            result.added = current;
            return Ok(result.sort());
        };

        let indexed = normalized_entries(&manifest, root);

        if let Some(saved) = manifest.git_state.as_ref() {
            if let Some(now) = GitState::capture(self.vcs.as_ref(), root).await {
                if !saved.same_revision(&now) {
                    info!(
                        "Git state changed {}@{} -> {}@{}",
                        saved.branch, saved.commit, now.branch, now.commit
                    );
                    return Ok(self
                        .detect_from_git(root, saved, &now, &current, &indexed)
                        .await);
                }
            }
        }

        Ok(self.detect_from_mtime(root, &current, &indexed).await)
    }

    async fn detect_from_git(
        &self,
        root: &Path,
        saved: &GitState,
        now: &GitState,
        current: &[String],
        indexed: &HashMap<String, FileEntry>,
    ) -> ChangeDetectionResult {
        let mut result = ChangeDetectionResult::new(ChangeReason::GitStateChanged);
        let current_set: HashSet<&str> = current.iter().map(String::as_str).collect();
        result.deleted = deleted_paths(indexed, &current_set);

        let changed = match self
            .vcs
            .changed_files(root, &saved.commit, &now.commit)
            .await
        {
            Ok(changed) => changed,
            Err(e) => {
                warn!("git diff failed ({}), falling back to full reindex", e);
                result.added = current.to_vec();
                return result.sort();
            }
        };

        let changed: HashSet<String> = changed
            .iter()
            .map(|p| normalize_to_relative(p, root))
            .collect();

        for path in &changed {
            if !current_set.contains(path.as_str()) {
                continue;
            }
            if indexed.contains_key(path) {
                result.modified.push(path.clone());
            } else {
                result.added.push(path.clone());
            }
        }

        // Files git does not track still need indexing
        for path in current {
            if !indexed.contains_key(path) && !changed.contains(path) {
                result.added.push(path.clone());
            }
        }

        debug!(
            "git strategy: {} added, {} modified, {} deleted",
            result.added.len(),
            result.modified.len(),
            result.deleted.len()
        );
        result.sort()
    }

    async fn detect_from_mtime(
        &self,
        root: &Path,
        current: &[String],
        indexed: &HashMap<String, FileEntry>,
    ) -> ChangeDetectionResult {
        let mut result = ChangeDetectionResult::new(ChangeReason::Mtime);

        let stats: Vec<(String, Option<u64>)> = stream::iter(current.iter().cloned())
            .map(|path| {
                let abs: PathBuf = root.join(&path);
                async move {
                    let mtime = file_mtime_ms(&abs).await.ok();
                    (path, mtime)
                }
            })
            .buffer_unordered(self.stat_concurrency)
            .collect()
            .await;

        let mut live: HashSet<&str> = HashSet::with_capacity(stats.len());
        for (path, mtime) in &stats {
            let Some(mtime) = mtime else {
                // Vanished between discovery and stat
                debug!("Could not stat {}, treating as absent", path);
                continue;
            };
            live.insert(path.as_str());
            match indexed.get(path) {
                None => result.added.push(path.clone()),
                Some(entry) if entry.last_modified < *mtime => result.modified.push(path.clone()),
                Some(_) => {}
            }
        }

        result.deleted = deleted_paths(indexed, &live);
        debug!(
            "mtime strategy: {} added, {} modified, {} deleted",
            result.added.len(),
            result.modified.len(),
            result.deleted.len()
        );
        result.sort()
    }
}

fn normalized_entries(manifest: &IndexManifest, root: &Path) -> HashMap<String, FileEntry> {
    manifest
        .files
        .iter()
        .map(|(path, entry)| (normalize_to_relative(path, root), entry.clone()))
        .collect()
}

fn deleted_paths(indexed: &HashMap<String, FileEntry>, live: &HashSet<&str>) -> Vec<String> {
    indexed
        .keys()
        .filter(|p| !live.contains(p.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_serializes_kebab_case() {
        assert_eq!(
            serde_json::to_string(&ChangeReason::GitStateChanged).unwrap(),
            "\"git-state-changed\""
        );
        assert_eq!(ChangeReason::Mtime.to_string(), "mtime");
    }

    #[test]
    fn test_to_index_orders_added_before_modified() {
        let result = ChangeDetectionResult {
            added: vec!["b.rs".to_string()],
            modified: vec!["a.rs".to_string()],
            deleted: vec![],
            reason: ChangeReason::Mtime,
        };
        assert_eq!(result.to_index(), vec!["b.rs".to_string(), "a.rs".to_string()]);
        assert!(!result.is_empty());
    }

    #[test]
    fn test_absolute_manifest_keys_are_normalized() {
        let mut manifest = IndexManifest::new();
        manifest.files.insert(
            "/repo/src/a.rs".to_string(),
            FileEntry {
                last_modified: 1,
                content_hash: None,
                chunk_count: 1,
            },
        );
        let entries = normalized_entries(&manifest, Path::new("/repo"));
        assert!(entries.contains_key("src/a.rs"));
    }
}
