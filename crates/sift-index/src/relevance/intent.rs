//! Rule-based query intent classification.

use regex::Regex;
use serde::{Deserialize, Serialize};

/// What a free-text query is looking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryIntent {
    /// "where is the auth middleware"
    Location,
    /// "how does indexing work"
    Conceptual,
    /// "how is the cache implemented", and anything unclassified
    Implementation,
}

impl std::fmt::Display for QueryIntent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryIntent::Location => write!(f, "LOCATION"),
            QueryIntent::Conceptual => write!(f, "CONCEPTUAL"),
            QueryIntent::Implementation => write!(f, "IMPLEMENTATION"),
        }
    }
}

/// Compiled lexical cues per intent.
pub struct IntentClassifier {
    location: Vec<Regex>,
    implementation: Vec<Regex>,
    conceptual: Vec<Regex>,
}

impl Default for IntentClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl IntentClassifier {
    pub fn new() -> Self {
        Self {
            location: compile(&[
                r"(?i)\bwhere\s+(is|are|does|do|can\s+i\s+find)\b",
                r"(?i)\bfind\s+the\b",
                r"(?i)\blocate\b",
                r"(?i)\bwhich\s+file\b",
            ]),
            implementation: compile(&[
                r"(?i)\bhow\s+(is|are)\b.*\b(implemented|built|coded|written)\b",
                r"(?i)\bimplementation\s+of\b",
                r"(?i)\bsource\s+code\s+for\b",
            ]),
            conceptual: compile(&[
                r"(?i)\bhow\s+does\b.*\bwork",
                r"(?i)\bwhat\s+(is|are|does)\b",
                r"(?i)\bexplain\b",
                r"(?i)\bunderstand\b",
                r"(?i)\b(process|workflow|architecture|overview)\b",
            ]),
        }
    }

    /// Location cues win, then explicit implementation cues, then conceptual.
    pub fn classify(&self, query: &str) -> QueryIntent {
        let query = query.trim();
        if matches_any(&self.location, query) {
            QueryIntent::Location
        } else if matches_any(&self.implementation, query) {
            QueryIntent::Implementation
        } else if matches_any(&self.conceptual, query) {
            QueryIntent::Conceptual
        } else {
            QueryIntent::Implementation
        }
    }
}

/// One-off classification. Long-lived callers should keep an [`IntentClassifier`].
pub fn classify_intent(query: &str) -> QueryIntent {
    IntentClassifier::new().classify(query)
}

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns.iter().filter_map(|p| Regex::new(p).ok()).collect()
}

fn matches_any(patterns: &[Regex], text: &str) -> bool {
    patterns.iter().any(|re| re.is_match(text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_queries() {
        let c = IntentClassifier::new();
        assert_eq!(c.classify("where is the server"), QueryIntent::Location);
        assert_eq!(c.classify("Where are the route handlers?"), QueryIntent::Location);
        assert_eq!(c.classify("locate config loading"), QueryIntent::Location);
        assert_eq!(c.classify("which file defines the schema"), QueryIntent::Location);
    }

    #[test]
    fn test_conceptual_queries() {
        let c = IntentClassifier::new();
        assert_eq!(c.classify("how does change detection work"), QueryIntent::Conceptual);
        assert_eq!(c.classify("what is the manifest"), QueryIntent::Conceptual);
        assert_eq!(c.classify("explain the indexing workflow"), QueryIntent::Conceptual);
    }

    #[test]
    fn test_implementation_queries_and_default() {
        let c = IntentClassifier::new();
        assert_eq!(c.classify("how is the cache implemented"), QueryIntent::Implementation);
        assert_eq!(c.classify("what is the implementation of retry"), QueryIntent::Implementation);
        assert_eq!(c.classify("parse json config"), QueryIntent::Implementation);
        assert_eq!(c.classify(""), QueryIntent::Implementation);
    }

    #[test]
    fn test_free_function_matches_classifier() {
        assert_eq!(classify_intent("where is main"), QueryIntent::Location);
    }
}
