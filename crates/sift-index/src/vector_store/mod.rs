//! Storage engine abstraction over the embedded and Qdrant backends.

pub mod embedded;
pub mod predicate;
pub mod qdrant;
pub mod symbols;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chunk::ChunkMetadata;
use crate::relevance::RelevanceRanker;

pub use embedded::EmbeddedStore;
pub use qdrant::{QdrantStore, TenantScope};

/// Extra candidates fetched per requested result when boosting may reorder them.
pub const RERANK_POOL_FACTOR: usize = 3;

#[derive(Error, Debug)]
pub enum VectorStoreError {
    #[error("{backend} backend unavailable: {message}")]
    Unavailable {
        backend: &'static str,
        message: String,
    },

    #[error("Index is corrupted: {0}")]
    Corrupted(String),

    #[error("Vector dimension mismatch: index holds {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error(
        "Batch length mismatch: {vectors} vectors, {metadatas} metadatas, {contents} contents"
    )]
    BatchLengthMismatch {
        vectors: usize,
        metadatas: usize,
        contents: usize,
    },

    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    #[error("Vector store error: {0}")]
    Backend(String),
}

impl VectorStoreError {
    /// The stored index cannot be used as-is and must be rebuilt from scratch.
    pub fn needs_rebuild(&self) -> bool {
        matches!(
            self,
            VectorStoreError::Corrupted(_) | VectorStoreError::DimensionMismatch { .. }
        )
    }

    /// Retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, VectorStoreError::Unavailable { .. })
    }
}

/// Display bucket derived from a distance score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relevance {
    HighlyRelevant,
    Relevant,
    LooselyRelated,
    NotRelevant,
}

impl Relevance {
    pub fn from_score(score: f32) -> Self {
        if score < 1.0 {
            Relevance::HighlyRelevant
        } else if score < 1.3 {
            Relevance::Relevant
        } else if score < 1.5 {
            Relevance::LooselyRelated
        } else {
            Relevance::NotRelevant
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Relevance::HighlyRelevant => "highly_relevant",
            Relevance::Relevant => "relevant",
            Relevance::LooselyRelated => "loosely_related",
            Relevance::NotRelevant => "not_relevant",
        }
    }
}

/// A retrieved chunk. `score` is a distance: lower is better.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub content: String,
    pub metadata: ChunkMetadata,
    pub score: f32,
    pub relevance: Relevance,
}

impl SearchResult {
    pub fn new(content: String, metadata: ChunkMetadata, score: f32) -> Self {
        Self {
            content,
            metadata,
            score,
            relevance: Relevance::from_score(score),
        }
    }
}

/// Unranked attribute filter. Every matching chunk is returned up to `limit`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanFilter {
    /// Exact file set, matched with an IN predicate
    pub files: Option<Vec<String>>,
    pub file: Option<String>,
    pub language: Option<String>,
    /// Regex matched against chunk content
    pub pattern: Option<String>,
    pub symbol_type: Option<String>,
    pub limit: Option<usize>,
}

impl ScanFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_files(files: Vec<String>) -> Self {
        Self {
            files: Some(files),
            ..Self::default()
        }
    }

    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    pub fn with_symbol_type(mut self, symbol_type: impl Into<String>) -> Self {
        self.symbol_type = Some(symbol_type.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Reject blank values and compile the content pattern.
    pub fn validate(&self) -> Result<Option<Regex>, VectorStoreError> {
        if let Some(files) = &self.files {
            for file in files {
                predicate::require_value("files", file)?;
            }
        }
        for (field, value) in [
            ("file", &self.file),
            ("language", &self.language),
            ("symbol_type", &self.symbol_type),
        ] {
            if let Some(value) = value {
                predicate::require_value(field, value)?;
            }
        }
        compile_pattern("pattern", self.pattern.as_deref())
    }

    /// An explicit but empty file set matches nothing.
    pub fn matches_nothing(&self) -> bool {
        matches!(&self.files, Some(files) if files.is_empty()) || self.limit == Some(0)
    }
}

/// Symbol lookup by kind, resolved through [`symbols::compatible_kinds`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SymbolQuery {
    /// Regex matched against the symbol name
    pub pattern: Option<String>,
    pub symbol_type: Option<String>,
    pub language: Option<String>,
    pub limit: Option<usize>,
}

impl SymbolQuery {
    pub fn validate(&self) -> Result<Option<Regex>, VectorStoreError> {
        if let Some(kind) = &self.symbol_type {
            predicate::require_value("symbol_type", kind)?;
        }
        if let Some(language) = &self.language {
            predicate::require_value("language", language)?;
        }
        compile_pattern("pattern", self.pattern.as_deref())
    }

    /// Stored kinds to match, `None` for any symbol.
    pub fn kinds(&self) -> Option<Vec<String>> {
        self.symbol_type.as_deref().map(symbols::compatible_kinds)
    }
}

fn compile_pattern(field: &str, pattern: Option<&str>) -> Result<Option<Regex>, VectorStoreError> {
    let Some(pattern) = pattern else {
        return Ok(None);
    };
    predicate::require_value(field, pattern)?;
    Regex::new(pattern)
        .map(Some)
        .map_err(|e| VectorStoreError::InvalidFilter(format!("bad {} regex: {}", field, e)))
}

/// Three parallel arrays of one insert must have the same length.
pub fn validate_batch(
    vectors: &[Vec<f32>],
    metadatas: &[ChunkMetadata],
    contents: &[String],
) -> Result<(), VectorStoreError> {
    if vectors.len() != metadatas.len() || vectors.len() != contents.len() {
        return Err(VectorStoreError::BatchLengthMismatch {
            vectors: vectors.len(),
            metadatas: metadatas.len(),
            contents: contents.len(),
        });
    }
    Ok(())
}

pub fn validate_dimensions(expected: usize, vectors: &[Vec<f32>]) -> Result<(), VectorStoreError> {
    match vectors.iter().find(|v| v.len() != expected) {
        Some(v) => Err(VectorStoreError::DimensionMismatch {
            expected,
            actual: v.len(),
        }),
        None => Ok(()),
    }
}

/// Euclidean distance between unit vectors with the given cosine similarity.
pub fn distance_from_cosine(similarity: f32) -> f32 {
    (2.0 * (1.0 - similarity)).max(0.0).sqrt()
}

pub(crate) fn candidate_pool(limit: usize, query_text: Option<&str>) -> usize {
    match query_text {
        Some(q) if !q.trim().is_empty() => limit.saturating_mul(RERANK_POOL_FACTOR),
        _ => limit,
    }
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Create tables/collections and indexes. Safe to call repeatedly.
    async fn initialize(&self) -> Result<(), VectorStoreError>;

    /// Store parallel arrays of vectors, metadata and content.
    ///
    /// Unequal lengths fail before the backend is touched.
    async fn insert_batch(
        &self,
        vectors: Vec<Vec<f32>>,
        metadatas: Vec<ChunkMetadata>,
        contents: Vec<String>,
    ) -> Result<usize, VectorStoreError>;

    async fn delete_by_file(&self, file: &str) -> Result<(), VectorStoreError>;

    /// Nearest chunks to `query`, boosted by `query_text` when present.
    async fn search(
        &self,
        query: &[f32],
        limit: usize,
        query_text: Option<&str>,
    ) -> Result<Vec<SearchResult>, VectorStoreError>;

    /// Exhaustive filter-only scan.
    async fn scan_with_filter(
        &self,
        filter: &ScanFilter,
    ) -> Result<Vec<SearchResult>, VectorStoreError>;

    async fn query_symbols(
        &self,
        query: &SymbolQuery,
    ) -> Result<Vec<SearchResult>, VectorStoreError>;

    /// Remove every chunk this store owns.
    async fn clear(&self) -> Result<(), VectorStoreError>;

    async fn count(&self) -> Result<usize, VectorStoreError>;

    fn backend_name(&self) -> &'static str;
}

/// Open the backend selected in `config` for the project at `root`.
pub async fn open_store(
    config: &sift_config::SiftConfig,
    root: &Path,
    index_dir: &Path,
    ranker: Arc<RelevanceRanker>,
) -> Result<Arc<dyn VectorStore>, VectorStoreError> {
    let store = connect_store(config, root, index_dir, ranker)?;
    store.initialize().await?;
    Ok(store)
}

/// Like [`open_store`] but skips `initialize`, so a store whose recorded
/// dimensions no longer match the configuration can still be cleared.
pub fn connect_store(
    config: &sift_config::SiftConfig,
    root: &Path,
    index_dir: &Path,
    ranker: Arc<RelevanceRanker>,
) -> Result<Arc<dyn VectorStore>, VectorStoreError> {
    let dimensions = config.embeddings.dimensions;
    let store: Arc<dyn VectorStore> = match config.backend.kind {
        sift_config::BackendKind::Embedded => {
            Arc::new(EmbeddedStore::open(index_dir, dimensions, ranker)?)
        }
        sift_config::BackendKind::Qdrant => {
            let tenant = TenantScope::from_config(&config.qdrant, root);
            Arc::new(QdrantStore::connect(&config.qdrant, dimensions, tenant, ranker)?)
        }
    };
    Ok(store)
}
