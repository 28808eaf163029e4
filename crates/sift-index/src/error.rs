use std::path::PathBuf;

use thiserror::Error;

use crate::manifest::ManifestError;
use crate::vector_store::VectorStoreError;

pub type Result<T> = std::result::Result<T, IndexError>;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    VectorStore(#[from] VectorStoreError),

    #[error("File discovery failed: {0}")]
    Discovery(#[source] anyhow::Error),

    #[error("Embedding failed: {0}")]
    Embedding(#[source] anyhow::Error),

    #[error("Chunking {path} failed: {source}")]
    Chunking {
        path: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("IO error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Embedding provider returned {got} vectors for {expected} inputs")]
    EmbeddingCount { expected: usize, got: usize },

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Config(#[from] sift_config::ConfigError),
}
