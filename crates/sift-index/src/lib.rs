//! Incremental codebase indexing and semantic search for sift.
//!
//! This crate provides:
//! - A durable JSON manifest of indexed files with atomic transactions
//! - Change detection by git revision, file mtime, or full scan
//! - Embedded (SQLite) and multi-tenant Qdrant vector stores
//! - Intent-aware relevance boosting of search results
//! - Background file watching for auto-indexing

pub mod changes;
pub mod chunk;
pub mod coordinator;
pub mod embeddings;
pub mod error;
pub mod git;
pub mod indexer;
pub mod manifest;
pub mod paths;
pub mod relevance;
pub mod scanner;
pub mod search;
pub mod vector_store;
pub mod watcher;

// Re-exports
pub use changes::{ChangeDetectionResult, ChangeDetector, ChangeReason};
pub use chunk::{CallSite, ChunkMetadata, Chunker, CodeChunk, LineChunker};
pub use coordinator::{ReindexCoordinator, ReindexState};
pub use embeddings::{EmbeddingProvider, HttpEmbeddings};
pub use error::{IndexError, Result};
pub use git::{GitCli, VersionControl};
pub use indexer::{BatchOutcome, FileFailure, IndexReport, IndexStatus, Indexer, IndexerBuilder};
pub use manifest::{FileEntry, GitState, IndexManifest, ManifestError, ManifestStore};
pub use relevance::{QueryIntent, RelevanceRanker};
pub use scanner::{FileDiscovery, WalkScanner};
pub use search::Searcher;
pub use vector_store::{
    connect_store, open_store, EmbeddedStore, QdrantStore, Relevance, ScanFilter, SearchResult,
    SymbolQuery, TenantScope, VectorStore, VectorStoreError,
};
pub use watcher::{FileEvent, FileWatcher, IndexingService, WatcherError};
