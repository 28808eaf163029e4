//! Single-tenant store in a SQLite file inside the index directory.
//!
//! Vectors are little-endian f32 blobs; similarity search is an exhaustive
//! cosine scan, which is fine at single-repository scale.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use tracing::{debug, info};

use super::{
    candidate_pool, distance_from_cosine, predicate, validate_batch, validate_dimensions,
    ScanFilter, SearchResult, SymbolQuery, VectorStore, VectorStoreError,
};
use crate::chunk::ChunkMetadata;
use crate::relevance::RelevanceRanker;

pub const DB_FILE: &str = "vectors.db";

const BACKEND: &str = "embedded";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS chunks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    file TEXT NOT NULL,
    content TEXT NOT NULL,
    start_line INTEGER NOT NULL,
    end_line INTEGER NOT NULL,
    language TEXT NOT NULL,
    symbol_name TEXT,
    symbol_type TEXT,
    metadata TEXT NOT NULL,
    vector BLOB NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_chunks_file ON chunks(file);
CREATE TABLE IF NOT EXISTS store_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

impl From<rusqlite::Error> for VectorStoreError {
    fn from(e: rusqlite::Error) -> Self {
        match e.sqlite_error_code() {
            Some(ErrorCode::DatabaseCorrupt) | Some(ErrorCode::NotADatabase) => {
                VectorStoreError::Corrupted(e.to_string())
            }
            Some(ErrorCode::DatabaseBusy)
            | Some(ErrorCode::DatabaseLocked)
            | Some(ErrorCode::CannotOpen) => VectorStoreError::Unavailable {
                backend: BACKEND,
                message: e.to_string(),
            },
            _ => VectorStoreError::Backend(e.to_string()),
        }
    }
}

pub struct EmbeddedStore {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
    dimensions: usize,
    ranker: Arc<RelevanceRanker>,
}

impl EmbeddedStore {
    /// Open (or create) `vectors.db` in `index_dir`.
    pub fn open(
        index_dir: &Path,
        dimensions: usize,
        ranker: Arc<RelevanceRanker>,
    ) -> Result<Self, VectorStoreError> {
        std::fs::create_dir_all(index_dir).map_err(|e| VectorStoreError::Unavailable {
            backend: BACKEND,
            message: format!("cannot create {:?}: {}", index_dir, e),
        })?;
        let path = index_dir.join(DB_FILE);
        let conn = Connection::open(&path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        info!("Opened embedded vector store at {:?}", path);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path),
            dimensions,
            ranker,
        })
    }

    pub fn in_memory(
        dimensions: usize,
        ranker: Arc<RelevanceRanker>,
    ) -> Result<Self, VectorStoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
            dimensions,
            ranker,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, VectorStoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, VectorStoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            f(&mut guard)
        })
        .await
        .map_err(|e| VectorStoreError::Backend(format!("blocking task failed: {}", e)))?
    }
}

fn vector_to_bytes(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn bytes_to_vector(bytes: &[u8]) -> Result<Vec<f32>, VectorStoreError> {
    if bytes.len() % 4 != 0 {
        return Err(VectorStoreError::Corrupted(format!(
            "vector blob of {} bytes",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 {
        0.0
    } else {
        dot / denom
    }
}

fn decode_metadata(raw: &str) -> Result<ChunkMetadata, VectorStoreError> {
    serde_json::from_str(raw)
        .map_err(|e| VectorStoreError::Corrupted(format!("unreadable chunk metadata: {}", e)))
}

/// Run a `SELECT content, metadata ...` and keep rows accepted by `keep`.
fn scan_rows<F>(
    conn: &Connection,
    sql: &str,
    limit: Option<usize>,
    keep: F,
) -> Result<Vec<SearchResult>, VectorStoreError>
where
    F: Fn(&str, &ChunkMetadata) -> bool,
{
    debug!("embedded scan: {}", sql);
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query([])?;
    let mut results = Vec::new();
    while let Some(row) = rows.next()? {
        let content: String = row.get(0)?;
        let raw: String = row.get(1)?;
        let metadata = decode_metadata(&raw)?;
        if !keep(&content, &metadata) {
            continue;
        }
        results.push(SearchResult::new(content, metadata, 0.0));
        if limit.is_some_and(|l| results.len() >= l) {
            break;
        }
    }
    Ok(results)
}

fn select_sql(clauses: &[String]) -> String {
    match predicate::and(clauses) {
        Some(predicate) => format!(
            "SELECT content, metadata FROM chunks WHERE {} ORDER BY file, start_line",
            predicate
        ),
        None => "SELECT content, metadata FROM chunks ORDER BY file, start_line".to_string(),
    }
}

#[async_trait]
impl VectorStore for EmbeddedStore {
    async fn initialize(&self) -> Result<(), VectorStoreError> {
        let dimensions = self.dimensions;
        self.with_conn(move |conn| {
            conn.execute_batch(SCHEMA)?;
            let stored: Option<String> = conn
                .query_row(
                    "SELECT value FROM store_meta WHERE key = 'dimensions'",
                    [],
                    |row| row.get(0),
                )
                .optional()?;
            match stored {
                Some(value) => {
                    let expected: usize = value.parse().map_err(|_| {
                        VectorStoreError::Corrupted(format!("bad stored dimensions '{}'", value))
                    })?;
                    if expected != dimensions {
                        return Err(VectorStoreError::DimensionMismatch {
                            expected,
                            actual: dimensions,
                        });
                    }
                }
                None => {
                    conn.execute(
                        "INSERT INTO store_meta (key, value) VALUES ('dimensions', ?1)",
                        params![dimensions.to_string()],
                    )?;
                }
            }
            Ok(())
        })
        .await
    }

    async fn insert_batch(
        &self,
        vectors: Vec<Vec<f32>>,
        metadatas: Vec<ChunkMetadata>,
        contents: Vec<String>,
    ) -> Result<usize, VectorStoreError> {
        validate_batch(&vectors, &metadatas, &contents)?;
        validate_dimensions(self.dimensions, &vectors)?;
        if vectors.is_empty() {
            return Ok(0);
        }

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut inserted = 0;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO chunks (file, content, start_line, end_line, language, \
                     symbol_name, symbol_type, metadata, vector) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                )?;
                for ((vector, metadata), content) in
                    vectors.iter().zip(metadatas.iter()).zip(contents.iter())
                {
                    let json = serde_json::to_string(metadata)
                        .map_err(|e| VectorStoreError::Backend(e.to_string()))?;
                    stmt.execute(params![
                        metadata.file,
                        content,
                        metadata.start_line as i64,
                        metadata.end_line as i64,
                        metadata.language,
                        metadata.symbol_name,
                        metadata.symbol_type,
                        json,
                        vector_to_bytes(vector),
                    ])?;
                    inserted += 1;
                }
            }
            tx.commit()?;
            Ok(inserted)
        })
        .await
    }

    async fn delete_by_file(&self, file: &str) -> Result<(), VectorStoreError> {
        let sql = format!("DELETE FROM chunks WHERE {}", predicate::eq("file", file)?);
        self.with_conn(move |conn| {
            let removed = conn.execute(&sql, [])?;
            debug!("Deleted {} chunks ({})", removed, sql);
            Ok(())
        })
        .await
    }

    async fn search(
        &self,
        query: &[f32],
        limit: usize,
        query_text: Option<&str>,
    ) -> Result<Vec<SearchResult>, VectorStoreError> {
        if query.len() != self.dimensions {
            return Err(VectorStoreError::DimensionMismatch {
                expected: self.dimensions,
                actual: query.len(),
            });
        }
        if limit == 0 {
            return Ok(Vec::new());
        }

        let pool = candidate_pool(limit, query_text);
        let query = query.to_vec();
        let candidates = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare("SELECT content, metadata, vector FROM chunks")?;
                let mut rows = stmt.query([])?;
                let mut scored = Vec::new();
                while let Some(row) = rows.next()? {
                    let content: String = row.get(0)?;
                    let raw: String = row.get(1)?;
                    let blob: Vec<u8> = row.get(2)?;
                    let vector = bytes_to_vector(&blob)?;
                    let score = distance_from_cosine(cosine_similarity(&query, &vector));
                    scored.push(SearchResult::new(content, decode_metadata(&raw)?, score));
                }
                scored.sort_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(Ordering::Equal));
                scored.truncate(pool);
                Ok(scored)
            })
            .await?;

        Ok(self.ranker.rank(candidates, query_text, limit))
    }

    async fn scan_with_filter(
        &self,
        filter: &ScanFilter,
    ) -> Result<Vec<SearchResult>, VectorStoreError> {
        let pattern: Option<Regex> = filter.validate()?;
        if filter.matches_nothing() {
            return Ok(Vec::new());
        }

        let mut clauses = Vec::new();
        if let Some(files) = &filter.files {
            clauses.push(predicate::in_list("file", files)?);
        }
        if let Some(file) = &filter.file {
            clauses.push(predicate::eq("file", file)?);
        }
        if let Some(language) = &filter.language {
            clauses.push(predicate::eq("language", language)?);
        }
        if let Some(symbol_type) = &filter.symbol_type {
            clauses.push(predicate::eq("symbol_type", symbol_type)?);
        }
        let sql = select_sql(&clauses);
        let limit = filter.limit;

        self.with_conn(move |conn| {
            scan_rows(conn, &sql, limit, |content, _| {
                pattern.as_ref().map_or(true, |re| re.is_match(content))
            })
        })
        .await
    }

    async fn query_symbols(
        &self,
        query: &SymbolQuery,
    ) -> Result<Vec<SearchResult>, VectorStoreError> {
        let pattern = query.validate()?;
        if query.limit == Some(0) {
            return Ok(Vec::new());
        }

        let mut clauses = vec!["symbol_name IS NOT NULL".to_string()];
        if let Some(kinds) = query.kinds() {
            clauses.push(predicate::in_list("symbol_type", &kinds)?);
        }
        if let Some(language) = &query.language {
            clauses.push(predicate::eq("language", language)?);
        }
        let sql = select_sql(&clauses);
        let limit = query.limit;

        self.with_conn(move |conn| {
            scan_rows(conn, &sql, limit, |_, metadata| match (&pattern, &metadata.symbol_name) {
                (Some(re), Some(name)) => re.is_match(name),
                (None, _) => true,
                (Some(_), None) => false,
            })
        })
        .await
    }

    /// Drop every chunk and forget the recorded dimensions, so the next
    /// `initialize` adopts the configured ones.
    async fn clear(&self) -> Result<(), VectorStoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM chunks", [])?;
            tx.execute("DELETE FROM store_meta WHERE key = 'dimensions'", [])?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn count(&self) -> Result<usize, VectorStoreError> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))?;
            Ok(count as usize)
        })
        .await
    }

    fn backend_name(&self) -> &'static str {
        BACKEND
    }
}
