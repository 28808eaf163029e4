//! Query relevance layer.
//!
//! Classifies the intent of a query and re-scores raw similarity distances
//! through the boosting pipeline for that intent. Pipelines are built once
//! by [`RelevanceRanker::new`] and shared by the vector stores through an `Arc`.

pub mod intent;
pub mod strategies;

use std::cmp::Ordering;

use tracing::debug;

use crate::vector_store::{Relevance, SearchResult};

pub use intent::{classify_intent, IntentClassifier, QueryIntent};
pub use strategies::{
    BoostPipeline, BoostingStrategy, FileTypeStrategy, FilenameStrategy, PathTokenStrategy,
    QueryTerms,
};

pub struct RelevanceRanker {
    classifier: IntentClassifier,
    location: BoostPipeline,
    conceptual: BoostPipeline,
    implementation: BoostPipeline,
}

impl Default for RelevanceRanker {
    fn default() -> Self {
        Self::new()
    }
}

impl RelevanceRanker {
    pub fn new() -> Self {
        Self {
            classifier: IntentClassifier::new(),
            location: BoostPipeline::for_intent(QueryIntent::Location),
            conceptual: BoostPipeline::for_intent(QueryIntent::Conceptual),
            implementation: BoostPipeline::for_intent(QueryIntent::Implementation),
        }
    }

    pub fn classify(&self, query: &str) -> QueryIntent {
        self.classifier.classify(query)
    }

    pub fn pipeline(&self, intent: QueryIntent) -> &BoostPipeline {
        match intent {
            QueryIntent::Location => &self.location,
            QueryIntent::Conceptual => &self.conceptual,
            QueryIntent::Implementation => &self.implementation,
        }
    }

    /// Sort `results` best first and keep `limit` of them.
    ///
    /// With query text each score is boosted by the pipeline for the query's
    /// intent; without it the raw distances are used unchanged.
    pub fn rank(
        &self,
        mut results: Vec<SearchResult>,
        query_text: Option<&str>,
        limit: usize,
    ) -> Vec<SearchResult> {
        if let Some(query) = query_text.map(str::trim).filter(|q| !q.is_empty()) {
            let intent = self.classify(query);
            let terms = QueryTerms::parse(query);
            let pipeline = self.pipeline(intent);
            debug!("Boosting {} results as {} ({:?})", results.len(), intent, terms.tokens());

            for result in &mut results {
                result.score = pipeline.apply(&terms, &result.metadata.file, result.score);
                result.relevance = Relevance::from_score(result.score);
            }
        }

        results.sort_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(Ordering::Equal));
        results.truncate(limit);
        results
    }
}
