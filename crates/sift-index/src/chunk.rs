//! Chunk records and the chunking collaborator interface.
//!
//! Segmentation policy lives outside this crate; the indexing pipeline only
//! needs something that turns a file into an ordered list of [`CodeChunk`]s.
//! [`LineChunker`] is the minimal default: overlapping line windows with the
//! language inferred from the extension.

use serde::{Deserialize, Serialize};

/// A call made from inside a chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSite {
    pub symbol: String,
    pub line: usize,
}

/// Metadata attached to every stored chunk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMetadata {
    /// Root-relative path of the source file
    pub file: String,
    /// First line of the chunk (1-indexed)
    pub start_line: usize,
    /// Last line of the chunk (1-indexed, inclusive)
    pub end_line: usize,
    pub language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol_name: Option<String>,
    /// "function", "method", "class", "interface", ...
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complexity: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub imports: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exports: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub call_sites: Vec<CallSite>,
}

/// A unit of indexed content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeChunk {
    pub content: String,
    pub metadata: ChunkMetadata,
}

/// Turns file content into chunks.
pub trait Chunker: Send + Sync {
    /// Split `content` of the file at root-relative `path`.
    fn chunk(&self, path: &str, content: &str) -> anyhow::Result<Vec<CodeChunk>>;
}

/// Fixed-size overlapping line windows.
#[derive(Debug, Clone)]
pub struct LineChunker {
    chunk_lines: usize,
    overlap: usize,
}

impl LineChunker {
    pub fn new(chunk_lines: usize, overlap: usize) -> Self {
        let chunk_lines = chunk_lines.max(1);
        Self {
            chunk_lines,
            overlap: overlap.min(chunk_lines - 1),
        }
    }
}

impl Default for LineChunker {
    fn default() -> Self {
        Self::new(75, 10)
    }
}

impl Chunker for LineChunker {
    fn chunk(&self, path: &str, content: &str) -> anyhow::Result<Vec<CodeChunk>> {
        let lines: Vec<&str> = content.lines().collect();
        if lines.iter().all(|l| l.trim().is_empty()) {
            return Ok(Vec::new());
        }

        let language = detect_language(path).to_string();
        let step = self.chunk_lines - self.overlap;
        let mut chunks = Vec::new();
        let mut start = 0usize;

        while start < lines.len() {
            let end = (start + self.chunk_lines).min(lines.len());
            let body = lines[start..end].join("\n");

            if !body.trim().is_empty() {
                chunks.push(CodeChunk {
                    content: body,
                    metadata: ChunkMetadata {
                        file: path.to_string(),
                        start_line: start + 1,
                        end_line: end,
                        language: language.clone(),
                        ..Default::default()
                    },
                });
            }

            if end == lines.len() {
                break;
            }
            start += step;
        }

        Ok(chunks)
    }
}

/// Language name for a path, based on its extension.
pub fn detect_language(path: &str) -> &'static str {
    let ext = path.rsplit_once('.').map(|(_, e)| e).unwrap_or("");
    match ext.to_ascii_lowercase().as_str() {
        "rs" => "rust",
        "py" => "python",
        "js" | "jsx" | "mjs" | "cjs" => "javascript",
        "ts" | "tsx" | "mts" | "cts" => "typescript",
        "go" => "go",
        "java" => "java",
        "kt" | "kts" => "kotlin",
        "rb" => "ruby",
        "php" => "php",
        "c" | "h" => "c",
        "cc" | "cpp" | "cxx" | "hpp" | "hh" => "cpp",
        "cs" => "csharp",
        "swift" => "swift",
        "scala" => "scala",
        "vue" => "vue",
        "md" | "mdx" => "markdown",
        _ => "unknown",
    }
}
