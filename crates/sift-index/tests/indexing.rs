//! End-to-end tests of the indexing pipeline over an embedded store.
//!
//! Embeddings and version control are faked so nothing needs the network or
//! a git checkout.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tempfile::TempDir;

use sift_index::{
    ChangeReason, ChunkMetadata, EmbeddedStore, EmbeddingProvider, Indexer, ManifestStore,
    ReindexCoordinator, RelevanceRanker, ScanFilter, SearchResult, Searcher, SymbolQuery,
    VectorStore, VectorStoreError, VersionControl,
};

const DIMS: usize = 16;

/// Bag-of-words vectors: identical text gives identical vectors.
/// Text containing `EXPLODE` fails to embed.
struct FakeEmbeddings;

fn bag_of_words(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; DIMS];
    v[0] = 1.0;
    for word in text.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()) {
        let bucket = word.bytes().fold(7usize, |h, b| h.wrapping_mul(31).wrapping_add(b as usize));
        v[1 + bucket % (DIMS - 1)] += 1.0;
    }
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    v.iter().map(|x| x / norm).collect()
}

#[async_trait]
impl EmbeddingProvider for FakeEmbeddings {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(bag_of_words(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.iter().any(|t| t.contains("EXPLODE")) {
            return Err(anyhow!("embedding service rejected input"));
        }
        Ok(texts.iter().map(|t| bag_of_words(t)).collect())
    }

    fn dimensions(&self) -> usize {
        DIMS
    }

    fn model_name(&self) -> &str {
        "fake"
    }
}

/// Version control whose revision and diff output are set by the test.
#[derive(Default)]
struct ScriptedVcs {
    revision: Mutex<Option<(String, String)>>,
    diff: Mutex<Option<Vec<String>>>,
}

impl ScriptedVcs {
    fn at(&self, branch: &str, commit: &str) {
        *self.revision.lock().unwrap() = Some((branch.to_string(), commit.to_string()));
    }

    /// `None` makes the diff fail.
    fn diff(&self, files: Option<&[&str]>) {
        *self.diff.lock().unwrap() = files.map(|f| f.iter().map(|s| s.to_string()).collect());
    }
}

#[async_trait]
impl VersionControl for ScriptedVcs {
    async fn is_available(&self) -> bool {
        true
    }

    async fn is_repo(&self, _root: &Path) -> bool {
        self.revision.lock().unwrap().is_some()
    }

    async fn current_branch(&self, _root: &Path) -> Result<String> {
        self.revision
            .lock()
            .unwrap()
            .as_ref()
            .map(|(b, _)| b.clone())
            .ok_or_else(|| anyhow!("not a repository"))
    }

    async fn current_commit(&self, _root: &Path) -> Result<String> {
        self.revision
            .lock()
            .unwrap()
            .as_ref()
            .map(|(_, c)| c.clone())
            .ok_or_else(|| anyhow!("not a repository"))
    }

    async fn changed_files(&self, _root: &Path, _from: &str, _to: &str) -> Result<Vec<String>> {
        self.diff
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| anyhow!("fatal: bad revision"))
    }
}

/// Embedded store whose writes can be made to fail after deletion succeeds.
struct FlakyStore {
    inner: EmbeddedStore,
    fail_inserts: AtomicBool,
}

impl FlakyStore {
    fn fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl VectorStore for FlakyStore {
    async fn initialize(&self) -> Result<(), VectorStoreError> {
        self.inner.initialize().await
    }

    async fn insert_batch(
        &self,
        vectors: Vec<Vec<f32>>,
        metadatas: Vec<ChunkMetadata>,
        contents: Vec<String>,
    ) -> Result<usize, VectorStoreError> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(VectorStoreError::Backend("disk I/O error".to_string()));
        }
        self.inner.insert_batch(vectors, metadatas, contents).await
    }

    async fn delete_by_file(&self, file: &str) -> Result<(), VectorStoreError> {
        self.inner.delete_by_file(file).await
    }

    async fn search(
        &self,
        query: &[f32],
        limit: usize,
        query_text: Option<&str>,
    ) -> Result<Vec<SearchResult>, VectorStoreError> {
        self.inner.search(query, limit, query_text).await
    }

    async fn scan_with_filter(
        &self,
        filter: &ScanFilter,
    ) -> Result<Vec<SearchResult>, VectorStoreError> {
        self.inner.scan_with_filter(filter).await
    }

    async fn query_symbols(
        &self,
        query: &SymbolQuery,
    ) -> Result<Vec<SearchResult>, VectorStoreError> {
        self.inner.query_symbols(query).await
    }

    async fn clear(&self) -> Result<(), VectorStoreError> {
        self.inner.clear().await
    }

    async fn count(&self) -> Result<usize, VectorStoreError> {
        self.inner.count().await
    }

    fn backend_name(&self) -> &'static str {
        self.inner.backend_name()
    }
}

struct Fixture {
    project: TempDir,
    index: TempDir,
    vcs: Arc<ScriptedVcs>,
    indexer: Arc<Indexer>,
    store: Arc<FlakyStore>,
}

impl Fixture {
    async fn new() -> Self {
        Self::with_coordinator(Arc::new(ReindexCoordinator::new())).await
    }

    async fn with_coordinator(coordinator: Arc<ReindexCoordinator>) -> Self {
        let project = tempfile::Builder::new().prefix("sift-project").tempdir().unwrap();
        let index = tempfile::Builder::new().prefix("sift-index").tempdir().unwrap();
        let vcs = Arc::new(ScriptedVcs::default());
        let store = Arc::new(FlakyStore {
            inner: EmbeddedStore::open(index.path(), DIMS, Arc::new(RelevanceRanker::new()))
                .unwrap(),
            fail_inserts: AtomicBool::new(false),
        });
        store.initialize().await.unwrap();
        let manifest = Arc::new(ManifestStore::new(index.path()));

        let indexer = Indexer::builder(project.path(), manifest, store.clone(), Arc::new(FakeEmbeddings))
            .vcs(vcs.clone())
            .coordinator(coordinator)
            .build();

        Self {
            project,
            index,
            vcs,
            indexer: Arc::new(indexer),
            store,
        }
    }

    fn root(&self) -> &Path {
        self.project.path()
    }

    fn write(&self, relative: &str, content: &str) -> PathBuf {
        let path = self.root().join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        path
    }

    /// Push the mtime forward so the mtime strategy notices the file.
    fn touch(&self, relative: &str) {
        let file = fs::File::options()
            .write(true)
            .open(self.root().join(relative))
            .unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(60))
            .unwrap();
    }

    async fn manifest_files(&self) -> Vec<String> {
        self.indexer.manifest().get_indexed_files().await.unwrap()
    }

    async fn stored_files(&self, files: &[&str]) -> Vec<String> {
        let filter = ScanFilter::for_files(files.iter().map(|f| f.to_string()).collect());
        self.store
            .scan_with_filter(&filter)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.metadata.file)
            .collect()
    }
}

#[tokio::test]
async fn test_full_index_records_every_file() {
    let fx = Fixture::new().await;
    fx.write("src/lib.rs", "pub fn add(a: i32, b: i32) -> i32 { a + b }\n");
    fx.write("src/util.py", "def helper():\n    return 42\n");
    fx.write("README.md", "# Demo\n\nA small project.\n");

    let report = fx.indexer.run().await.unwrap();
    assert_eq!(report.reason, ChangeReason::Full);
    assert_eq!(report.added, 3);
    assert!(report.outcome.is_clean());

    let manifest = fx.indexer.manifest().load().await.unwrap().unwrap();
    assert_eq!(
        manifest.files.keys().cloned().collect::<Vec<_>>(),
        vec!["README.md", "src/lib.rs", "src/util.py"]
    );
    assert!(manifest.files.values().all(|e| e.content_hash.is_some()));
    assert_eq!(fx.store.count().await.unwrap(), manifest.total_chunks());
    assert!(manifest.last_indexed.is_some());
}

#[tokio::test]
async fn test_second_run_without_changes_is_empty() {
    let fx = Fixture::new().await;
    fx.write("src/lib.rs", "pub fn one() {}\n");
    fx.write("src/two.rs", "pub fn two() {}\n");
    fx.indexer.run().await.unwrap();

    let changes = fx.indexer.detect_changes().await.unwrap();
    assert_eq!(changes.reason, ChangeReason::Mtime);
    assert!(changes.is_empty());

    let report = fx.indexer.run().await.unwrap();
    assert!(report.outcome.indexed.is_empty());
    assert!(report.outcome.removed.is_empty());
    assert!(!fx.indexer.coordinator().is_in_progress());
}

#[tokio::test]
async fn test_touched_file_with_same_content_is_only_refreshed() {
    let fx = Fixture::new().await;
    fx.write("src/lib.rs", "pub fn one() {}\n");
    fx.indexer.run().await.unwrap();
    let chunks_before = fx.store.count().await.unwrap();
    let before = fx.indexer.manifest().file_entry("src/lib.rs").await.unwrap().unwrap();

    fx.touch("src/lib.rs");
    let report = fx.indexer.run().await.unwrap();
    assert_eq!(report.modified, 1);
    assert_eq!(report.outcome.refreshed, vec!["src/lib.rs"]);
    assert!(report.outcome.indexed.is_empty());

    let after = fx.indexer.manifest().file_entry("src/lib.rs").await.unwrap().unwrap();
    assert!(after.last_modified > before.last_modified);
    assert_eq!(after.content_hash, before.content_hash);
    assert_eq!(fx.store.count().await.unwrap(), chunks_before);

    // Refreshed mtime means the next cycle sees nothing
    assert!(fx.indexer.detect_changes().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_mtime_strategy_modifies_and_deletes() {
    let fx = Fixture::new().await;
    fx.write("src/a.rs", "pub fn a() {}\n");
    fx.write("src/b.rs", "pub fn b() {}\n");
    fx.indexer.run().await.unwrap();

    fx.write("src/b.rs", "pub fn b() { println!(\"changed\"); }\n");
    fx.touch("src/b.rs");
    fs::remove_file(fx.root().join("src/a.rs")).unwrap();

    let changes = fx.indexer.detect_changes().await.unwrap();
    assert_eq!(changes.reason, ChangeReason::Mtime);
    assert_eq!(changes.modified, vec!["src/b.rs"]);
    assert_eq!(changes.deleted, vec!["src/a.rs"]);

    let report = fx.indexer.run().await.unwrap();
    assert_eq!(report.outcome.indexed, vec!["src/b.rs"]);
    assert_eq!(report.outcome.removed, vec!["src/a.rs"]);

    assert_eq!(fx.manifest_files().await, vec!["src/b.rs"]);
    assert!(fx.stored_files(&["src/a.rs"]).await.is_empty());
    let b = fx.store.scan_with_filter(&ScanFilter::for_files(vec!["src/b.rs".into()])).await.unwrap();
    assert!(b.iter().any(|r| r.content.contains("changed")));
}

#[tokio::test]
async fn test_git_strategy_uses_diff_and_computes_deletions() {
    let fx = Fixture::new().await;
    fx.vcs.at("main", "c1");
    fx.write("src/lib.rs", "pub fn v1() {}\n");
    fx.write("src/old.rs", "pub fn old() {}\n");
    fx.write("src/same.rs", "pub fn same() {}\n");
    fx.indexer.run().await.unwrap();

    let manifest = fx.indexer.manifest().load().await.unwrap().unwrap();
    assert_eq!(manifest.git_state.as_ref().unwrap().commit, "c1");

    fx.write("src/lib.rs", "pub fn v2() {}\n");
    fs::remove_file(fx.root().join("src/old.rs")).unwrap();
    fx.write("src/new.rs", "pub fn new() {}\n");
    fx.vcs.at("main", "c2");
    fx.vcs.diff(Some(&["src/lib.rs", "src/old.rs", "src/new.rs"]));

    let changes = fx.indexer.detect_changes().await.unwrap();
    assert_eq!(changes.reason, ChangeReason::GitStateChanged);
    assert_eq!(changes.added, vec!["src/new.rs"]);
    assert_eq!(changes.modified, vec!["src/lib.rs"]);
    assert_eq!(changes.deleted, vec!["src/old.rs"]);

    fx.indexer.run().await.unwrap();
    assert_eq!(fx.manifest_files().await, vec!["src/lib.rs", "src/new.rs", "src/same.rs"]);
    assert!(fx.stored_files(&["src/old.rs"]).await.is_empty());

    let manifest = fx.indexer.manifest().load().await.unwrap().unwrap();
    assert_eq!(manifest.git_state.unwrap().commit, "c2");
}

#[tokio::test]
async fn test_git_diff_failure_falls_back_to_every_file() {
    let fx = Fixture::new().await;
    fx.vcs.at("main", "c1");
    fx.write("src/a.rs", "pub fn a() {}\n");
    fx.write("src/b.rs", "pub fn b() {}\n");
    fx.indexer.run().await.unwrap();

    fs::remove_file(fx.root().join("src/b.rs")).unwrap();
    fx.vcs.at("feature", "c9");
    fx.vcs.diff(None);

    let changes = fx.indexer.detect_changes().await.unwrap();
    assert_eq!(changes.reason, ChangeReason::GitStateChanged);
    assert_eq!(changes.added, vec!["src/a.rs"]);
    assert_eq!(changes.deleted, vec!["src/b.rs"]);

    // Unchanged content is refreshed, not re-embedded
    let report = fx.indexer.run().await.unwrap();
    assert_eq!(report.outcome.refreshed, vec!["src/a.rs"]);
    assert_eq!(report.outcome.removed, vec!["src/b.rs"]);
}

#[tokio::test]
async fn test_failed_file_does_not_block_the_rest() {
    let fx = Fixture::new().await;
    fx.write("src/good.rs", "pub fn good() {}\n");
    fx.write("src/bad.rs", "pub fn bad() { EXPLODE }\n");

    let report = fx.indexer.run().await.unwrap();
    assert_eq!(report.outcome.indexed, vec!["src/good.rs"]);
    assert_eq!(report.outcome.failed.len(), 1);
    assert_eq!(report.outcome.failed[0].path, "src/bad.rs");

    assert_eq!(fx.manifest_files().await, vec!["src/good.rs"]);
    assert!(fx.stored_files(&["src/bad.rs"]).await.is_empty());

    // Never recorded, so it is retried next cycle
    let changes = fx.indexer.detect_changes().await.unwrap();
    assert_eq!(changes.added, vec!["src/bad.rs"]);
}

#[tokio::test]
async fn test_reindex_paths_splits_present_and_deleted() {
    let fx = Fixture::new().await;
    fx.write("src/a.rs", "pub fn a() {}\n");
    fx.write("src/b.rs", "pub fn b() {}\n");
    fx.indexer.run().await.unwrap();

    let a = fx.write("src/a.rs", "pub fn a() { let changed = 1; }\n");
    let b = fx.root().join("src/b.rs");
    fs::remove_file(&b).unwrap();

    let outcome = fx.indexer.reindex_paths(&[a, b, PathBuf::from("src/a.rs")]).await.unwrap();
    assert_eq!(outcome.indexed, vec!["src/a.rs"]);
    assert_eq!(outcome.removed, vec!["src/b.rs"]);
    assert_eq!(fx.manifest_files().await, vec!["src/a.rs"]);

    let state = fx.indexer.coordinator().snapshot();
    assert!(!state.in_progress);
    assert!(state.pending_files.is_empty());
    assert!(state.last_reindex_duration_ms.is_some());
}

#[tokio::test]
async fn test_shared_coordinator_stays_busy_until_every_operation_ends() {
    let coordinator = Arc::new(ReindexCoordinator::new());
    let fx = Fixture::with_coordinator(coordinator.clone()).await;
    fx.write("src/a.rs", "pub fn a() {}\n");

    // Another caller holds an operation open
    coordinator.start(&["docs/guide.md"]);
    fx.indexer.reindex_paths(&["src/a.rs"]).await.unwrap();

    let state = coordinator.snapshot();
    assert!(state.in_progress);
    assert_eq!(state.pending_files, vec!["docs/guide.md", "src/a.rs"]);

    coordinator.complete(5);
    let state = coordinator.snapshot();
    assert!(!state.in_progress);
    assert!(state.pending_files.is_empty());
    assert_eq!(state.last_reindex_duration_ms, Some(5));
}

#[tokio::test]
async fn test_search_boosts_filename_match() {
    let fx = Fixture::new().await;
    let body = "export function start() { listen(8080); }\n";
    fx.write("src/config/server-config.ts", body);
    fx.write("src/mcp/server.ts", body);
    fx.indexer.run().await.unwrap();

    let searcher = Searcher::new(fx.store.clone(), Arc::new(FakeEmbeddings));
    let results = searcher.search("where is the server", 2).await.unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].metadata.file, "src/mcp/server.ts");
    assert!(results[0].score < results[1].score);

    let similar = searcher.similar(body, 2).await.unwrap();
    assert_eq!(similar.len(), 2);
    assert!((similar[0].score - similar[1].score).abs() < 1e-5);

    let files = searcher.files(&["./src/mcp/server.ts"]).await.unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].metadata.file, "src/mcp/server.ts");
}

#[tokio::test]
async fn test_clear_then_status() {
    let fx = Fixture::new().await;
    fx.write("src/a.rs", "pub fn a() {}\n");
    fx.indexer.run().await.unwrap();

    let status = fx.indexer.status().await.unwrap();
    assert_eq!(status.backend, "embedded");
    assert_eq!(status.indexed_files, 1);
    assert_eq!(status.stored_chunks, status.manifest_chunks);

    fx.indexer.clear().await.unwrap();
    let status = fx.indexer.status().await.unwrap();
    assert_eq!(status.indexed_files, 0);
    assert_eq!(status.stored_chunks, 0);
}

#[tokio::test]
async fn test_git_strategy_adds_untracked_file_missing_from_diff() {
    let fx = Fixture::new().await;
    fx.vcs.at("main", "c1");
    fx.write("src/lib.rs", "pub fn v1() {}\n");
    fx.indexer.run().await.unwrap();

    fx.write("src/lib.rs", "pub fn v2() {}\n");
    fx.write("src/untracked.rs", "pub fn scratch() {}\n");
    fx.vcs.at("main", "c2");
    fx.vcs.diff(Some(&["src/lib.rs"]));

    let changes = fx.indexer.detect_changes().await.unwrap();
    assert_eq!(changes.reason, ChangeReason::GitStateChanged);
    assert_eq!(changes.added, vec!["src/untracked.rs"]);
    assert_eq!(changes.modified, vec!["src/lib.rs"]);
    assert!(changes.deleted.is_empty());

    fx.indexer.run().await.unwrap();
    assert_eq!(fx.manifest_files().await, vec!["src/lib.rs", "src/untracked.rs"]);
}

#[tokio::test]
async fn test_failed_store_write_drops_manifest_entry() {
    let fx = Fixture::new().await;
    let original = "pub fn a() {}\n";
    fx.write("src/a.rs", original);
    fx.write("src/b.rs", "pub fn b() {}\n");
    fx.indexer.run().await.unwrap();

    fx.write("src/a.rs", "pub fn a() { let edited = true; }\n");
    fx.touch("src/a.rs");
    fx.store.fail_inserts(true);
    let report = fx.indexer.run().await.unwrap();
    assert_eq!(report.outcome.failed.len(), 1);
    assert_eq!(report.outcome.failed[0].path, "src/a.rs");

    // Old vectors are gone, so the entry must not survive
    assert!(fx.stored_files(&["src/a.rs"]).await.is_empty());
    assert_eq!(fx.manifest_files().await, vec!["src/b.rs"]);

    // Reverting to the previously indexed content still re-embeds
    fx.store.fail_inserts(false);
    fx.write("src/a.rs", original);
    fx.touch("src/a.rs");
    let changes = fx.indexer.detect_changes().await.unwrap();
    assert_eq!(changes.added, vec!["src/a.rs"]);

    let report = fx.indexer.run().await.unwrap();
    assert_eq!(report.outcome.indexed, vec!["src/a.rs"]);
    assert!(report.outcome.refreshed.is_empty());

    let manifest = fx.indexer.manifest().load().await.unwrap().unwrap();
    assert_eq!(fx.store.count().await.unwrap(), manifest.total_chunks());
    assert!(!fx.stored_files(&["src/a.rs"]).await.is_empty());
}

#[tokio::test]
async fn test_clear_recovers_from_corrupt_manifest() {
    let fx = Fixture::new().await;
    fx.write("src/a.rs", "pub fn a() {}\n");
    fx.indexer.run().await.unwrap();

    fs::write(fx.indexer.manifest().path(), b"{ 1: broken").unwrap();
    assert!(fx.indexer.run().await.is_err());

    fx.indexer.clear().await.unwrap();
    assert_eq!(fx.store.count().await.unwrap(), 0);

    let report = fx.indexer.run().await.unwrap();
    assert_eq!(report.outcome.indexed, vec!["src/a.rs"]);
    assert_eq!(fx.manifest_files().await, vec!["src/a.rs"]);
}

#[tokio::test]
async fn test_clear_rebuilds_store_with_new_dimensions() {
    let fx = Fixture::new().await;
    fx.write("src/a.rs", "pub fn a() {}\n");
    fx.indexer.run().await.unwrap();

    // Same index directory, different embedding size
    let resized: Arc<dyn VectorStore> = Arc::new(
        EmbeddedStore::open(fx.index.path(), DIMS * 2, Arc::new(RelevanceRanker::new())).unwrap(),
    );
    assert!(resized.initialize().await.unwrap_err().needs_rebuild());

    let manifest = Arc::new(ManifestStore::new(fx.index.path()));
    let indexer = Indexer::builder(fx.root(), manifest, resized.clone(), Arc::new(FakeEmbeddings))
        .build();
    indexer.clear().await.unwrap();

    assert_eq!(resized.count().await.unwrap(), 0);
    resized.initialize().await.unwrap();
    assert!(indexer.manifest().get_indexed_files().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_reindex_paths_skips_files_discovery_rejects() {
    let fx = Fixture::new().await;
    fx.write("src/a.rs", "pub fn a() {}\n");
    fx.indexer.run().await.unwrap();

    fx.write("notes.txt", "scratch notes\n");
    fx.write("node_modules/dep/index.ts", "export const x = 1;\n");
    fx.write("src/b.rs", "pub fn b() {}\n");

    let outcome = fx
        .indexer
        .reindex_paths(&["notes.txt", "node_modules/dep/index.ts", "src/b.rs"])
        .await
        .unwrap();
    assert_eq!(outcome.indexed, vec!["src/b.rs"]);
    assert!(outcome.failed.is_empty());
    assert_eq!(fx.manifest_files().await, vec!["src/a.rs", "src/b.rs"]);
    assert!(fx.stored_files(&["notes.txt", "node_modules/dep/index.ts"]).await.is_empty());

    // Nothing stray for the next mtime cycle to delete
    assert!(fx.indexer.detect_changes().await.unwrap().is_empty());
}
