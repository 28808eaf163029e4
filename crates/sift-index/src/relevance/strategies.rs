//! Score adjustments from single path signals.
//!
//! Scores are distances, so a multiplier below 1.0 rewards and above 1.0
//! penalises. Every strategy reports `base * (multiplier - 1)` so deltas from
//! different strategies add up instead of compounding.

use super::intent::QueryIntent;

const PATH_MATCH_MULTIPLIER: f32 = 0.90;
const FILENAME_EXACT_MULTIPLIER: f32 = 0.70;
const FILENAME_PARTIAL_MULTIPLIER: f32 = 0.80;
const LOCATION_TEST_PENALTY: f32 = 1.10;
const CONCEPTUAL_README_MULTIPLIER: f32 = 0.50;
const CONCEPTUAL_DOC_MULTIPLIER: f32 = 0.65;
const CONCEPTUAL_UTILITY_PENALTY: f32 = 1.05;
const IMPLEMENTATION_CODE_MULTIPLIER: f32 = 0.90;

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "are", "does", "how", "what", "where", "which", "with", "from", "that",
    "this", "into", "find", "locate", "file", "code", "work", "works", "explain", "implemented",
    "implementation", "source", "can",
];

const DOC_EXTENSIONS: &[&str] = &["md", "mdx", "markdown", "rst", "adoc", "txt"];

/// Query tokens that can meaningfully match a path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryTerms {
    tokens: Vec<String>,
}

impl QueryTerms {
    pub fn parse(query: &str) -> Self {
        let mut tokens: Vec<String> = Vec::new();
        for token in query
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.len() > 2 && !STOPWORDS.contains(t))
        {
            if !tokens.iter().any(|t| t == token) {
                tokens.push(token.to_string());
            }
        }
        Self { tokens }
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// One signal's contribution to a result's score.
pub trait BoostingStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Delta to add to `base` for the chunk stored under `path`.
    fn delta(&self, terms: &QueryTerms, path: &str, base: f32) -> f32;
}

fn delta_for(base: f32, multiplier: f32) -> f32 {
    base * (multiplier - 1.0)
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn stem(path: &str) -> String {
    let name = basename(path);
    name.split('.').next().unwrap_or(name).to_lowercase()
}

fn path_segments(path: &str) -> Vec<String> {
    path.to_lowercase()
        .split(|c: char| matches!(c, '/' | '.' | '-' | '_'))
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Rewards query tokens appearing anywhere in the path.
pub struct PathTokenStrategy;

impl BoostingStrategy for PathTokenStrategy {
    fn name(&self) -> &'static str {
        "path"
    }

    fn delta(&self, terms: &QueryTerms, path: &str, base: f32) -> f32 {
        let segments = path_segments(path);
        let matches = terms
            .tokens()
            .iter()
            .filter(|t| segments.iter().any(|s| s == *t))
            .count();
        if matches == 0 {
            return 0.0;
        }
        delta_for(base, PATH_MATCH_MULTIPLIER.powi(matches as i32))
    }
}

/// Rewards a query token naming the file itself. Stronger than [`PathTokenStrategy`].
pub struct FilenameStrategy;

impl BoostingStrategy for FilenameStrategy {
    fn name(&self) -> &'static str {
        "filename"
    }

    fn delta(&self, terms: &QueryTerms, path: &str, base: f32) -> f32 {
        let stem = stem(path);
        if stem.is_empty() {
            return 0.0;
        }
        if terms.tokens().iter().any(|t| *t == stem) {
            delta_for(base, FILENAME_EXACT_MULTIPLIER)
        } else if terms.tokens().iter().any(|t| stem.contains(t.as_str())) {
            delta_for(base, FILENAME_PARTIAL_MULTIPLIER)
        } else {
            0.0
        }
    }
}

pub fn is_test_file(path: &str) -> bool {
    let lower = path.to_lowercase();
    let name = basename(&lower);
    lower.split('/').any(|s| matches!(s, "test" | "tests" | "__tests__" | "spec"))
        || name.contains(".test.")
        || name.contains(".spec.")
        || name.contains("_test.")
        || name.starts_with("test_")
}

pub fn is_doc_file(path: &str) -> bool {
    let lower = path.to_lowercase();
    let ext = basename(&lower).rsplit_once('.').map(|(_, e)| e.to_string());
    ext.map(|e| DOC_EXTENSIONS.contains(&e.as_str())).unwrap_or(false)
        || lower.split('/').any(|s| s == "docs" || s == "doc")
}

/// README and architecture/design write-ups.
pub fn is_overview_doc(path: &str) -> bool {
    let lower = path.to_lowercase();
    let name = basename(&lower);
    name.starts_with("readme") || lower.contains("architecture") || name.starts_with("design")
}

pub fn is_utility_file(path: &str) -> bool {
    let lower = path.to_lowercase();
    let name = stem(&lower);
    lower
        .split('/')
        .any(|s| matches!(s, "util" | "utils" | "helpers" | "helper"))
        || name.starts_with("util")
        || name.starts_with("helper")
}

/// Intent-specific preference for kinds of files.
pub struct FileTypeStrategy {
    intent: QueryIntent,
}

impl FileTypeStrategy {
    pub fn new(intent: QueryIntent) -> Self {
        Self { intent }
    }

    fn multiplier(&self, path: &str) -> f32 {
        match self.intent {
            QueryIntent::Location => {
                if is_test_file(path) {
                    LOCATION_TEST_PENALTY
                } else {
                    1.0
                }
            }
            QueryIntent::Conceptual => {
                if is_doc_file(path) && is_overview_doc(path) {
                    CONCEPTUAL_README_MULTIPLIER
                } else if is_doc_file(path) {
                    CONCEPTUAL_DOC_MULTIPLIER
                } else if is_utility_file(path) {
                    CONCEPTUAL_UTILITY_PENALTY
                } else {
                    1.0
                }
            }
            // Tests show real usage, so they get the same reward as source
            QueryIntent::Implementation => {
                if is_doc_file(path) {
                    1.0
                } else {
                    IMPLEMENTATION_CODE_MULTIPLIER
                }
            }
        }
    }
}

impl BoostingStrategy for FileTypeStrategy {
    fn name(&self) -> &'static str {
        "file-type"
    }

    fn delta(&self, _terms: &QueryTerms, path: &str, base: f32) -> f32 {
        delta_for(base, self.multiplier(path))
    }
}

/// Strategies applied in a fixed order; deltas are summed onto the base score.
pub struct BoostPipeline {
    strategies: Vec<Box<dyn BoostingStrategy>>,
}

impl BoostPipeline {
    pub fn new(strategies: Vec<Box<dyn BoostingStrategy>>) -> Self {
        Self { strategies }
    }

    pub fn for_intent(intent: QueryIntent) -> Self {
        Self::new(vec![
            Box::new(PathTokenStrategy),
            Box::new(FilenameStrategy),
            Box::new(FileTypeStrategy::new(intent)),
        ])
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    pub fn apply(&self, terms: &QueryTerms, path: &str, base: f32) -> f32 {
        let total: f32 = self
            .strategies
            .iter()
            .map(|s| s.delta(terms, path, base))
            .sum();
        (base + total).max(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_terms_drop_stopwords_and_short_tokens() {
        let terms = QueryTerms::parse("Where is the Server? the server");
        assert_eq!(terms.tokens(), &["server".to_string()]);
        assert!(QueryTerms::parse("is it a").is_empty());
    }

    #[test]
    fn test_filename_exact_beats_partial() {
        let terms = QueryTerms::parse("server");
        let exact = FilenameStrategy.delta(&terms, "src/mcp/server.ts", 1.0);
        let partial = FilenameStrategy.delta(&terms, "src/config/server-config.ts", 1.0);
        assert!(exact < partial);
        assert!(partial < 0.0);
        assert_eq!(FilenameStrategy.delta(&terms, "src/main.rs", 1.0), 0.0);
    }

    #[test]
    fn test_path_strategy_counts_segment_matches() {
        let terms = QueryTerms::parse("config loader");
        let one = PathTokenStrategy.delta(&terms, "src/config/mod.rs", 1.0);
        let two = PathTokenStrategy.delta(&terms, "src/config/loader.rs", 1.0);
        assert!(two < one);
        assert!(one < 0.0);
    }

    #[test]
    fn test_file_classification() {
        assert!(is_test_file("src/__tests__/server.test.ts"));
        assert!(is_test_file("tests/integration.rs"));
        assert!(!is_test_file("src/latest.rs"));
        assert!(is_doc_file("docs/guide.md"));
        assert!(is_overview_doc("README.md"));
        assert!(is_utility_file("src/utils/strings.ts"));
    }

    #[test]
    fn test_intent_file_type_adjustments() {
        let terms = QueryTerms::default();
        let location = FileTypeStrategy::new(QueryIntent::Location);
        assert!(location.delta(&terms, "src/server.test.ts", 1.0) > 0.0);
        assert_eq!(location.delta(&terms, "src/server.ts", 1.0), 0.0);

        let conceptual = FileTypeStrategy::new(QueryIntent::Conceptual);
        let readme = conceptual.delta(&terms, "README.md", 1.0);
        let doc = conceptual.delta(&terms, "docs/guide.md", 1.0);
        assert!(readme < doc && doc < 0.0);
        assert!(conceptual.delta(&terms, "src/utils/strings.ts", 1.0) > 0.0);

        let implementation = FileTypeStrategy::new(QueryIntent::Implementation);
        assert_eq!(
            implementation.delta(&terms, "src/server.ts", 1.0),
            implementation.delta(&terms, "src/server.test.ts", 1.0)
        );
    }

    #[test]
    fn test_pipeline_sums_deltas_and_clamps() {
        let pipeline = BoostPipeline::for_intent(QueryIntent::Location);
        assert_eq!(pipeline.strategy_names(), vec!["path", "filename", "file-type"]);

        let terms = QueryTerms::parse("server");
        let boosted = pipeline.apply(&terms, "src/mcp/server.ts", 1.0);
        // path 0.9 and exact filename 0.7 each contribute from the same base
        assert!((boosted - 0.6).abs() < 1e-6);
        assert!(pipeline.apply(&terms, "src/mcp/server.ts", 0.0) >= 0.0);
    }
}
