//! Query facade over a vector store and an embedding provider.

use std::sync::Arc;

use tracing::debug;

use crate::embeddings::EmbeddingProvider;
use crate::error::{IndexError, Result};
use crate::paths::normalize_relative_str;
use crate::vector_store::{ScanFilter, SearchResult, SymbolQuery, VectorStore};

pub struct Searcher {
    store: Arc<dyn VectorStore>,
    embeddings: Arc<dyn EmbeddingProvider>,
}

impl Searcher {
    pub fn new(store: Arc<dyn VectorStore>, embeddings: Arc<dyn EmbeddingProvider>) -> Self {
        Self { store, embeddings }
    }

    /// Natural-language search with intent-aware boosting.
    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>> {
        let vector = self.embed(query).await?;
        let results = self.store.search(&vector, limit, Some(query)).await?;
        debug!("Query {:?} returned {} results", query, results.len());
        Ok(results)
    }

    /// Chunks closest to a code snippet, ranked by raw distance.
    pub async fn similar(&self, code: &str, limit: usize) -> Result<Vec<SearchResult>> {
        let vector = self.embed(code).await?;
        Ok(self.store.search(&vector, limit, None).await?)
    }

    /// Every stored chunk for the given files, in file and line order.
    pub async fn files<S: AsRef<str>>(&self, paths: &[S]) -> Result<Vec<SearchResult>> {
        let files = paths
            .iter()
            .map(|p| normalize_relative_str(p.as_ref()))
            .filter(|p| !p.is_empty())
            .collect();
        Ok(self.store.scan_with_filter(&ScanFilter::for_files(files)).await?)
    }

    pub async fn symbols(&self, query: &SymbolQuery) -> Result<Vec<SearchResult>> {
        Ok(self.store.query_symbols(query).await?)
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embeddings.embed(text).await.map_err(IndexError::Embedding)
    }
}
