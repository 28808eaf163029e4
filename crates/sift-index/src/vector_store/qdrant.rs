//! Multi-tenant store on a shared Qdrant collection.
//!
//! Every point carries `org_id`, `repo_id`, `branch` and `commit_sha`; every
//! read, scan and delete is scoped to the configured tenant.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use qdrant_client::qdrant::{
    value::Kind, vectors_config, Condition, CountPointsBuilder, CreateCollectionBuilder,
    CreateFieldIndexCollectionBuilder, DeletePointsBuilder, Distance, FieldType, Filter,
    GetCollectionInfoResponse, PointId, PointStruct, QuantizationType, ScalarQuantizationBuilder,
    ScrollPointsBuilder, SearchPointsBuilder, UpsertPointsBuilder, Value, VectorParamsBuilder,
};
use qdrant_client::{Qdrant, QdrantError};
use tracing::{debug, info};

use super::{
    candidate_pool, distance_from_cosine, predicate, validate_batch, validate_dimensions,
    ScanFilter, SearchResult, SymbolQuery, VectorStore, VectorStoreError,
};
use crate::chunk::{CallSite, ChunkMetadata};
use crate::relevance::RelevanceRanker;

const BACKEND: &str = "qdrant";

/// Page size for scroll-based scans.
const SCROLL_PAGE: u32 = 256;

const UPSERT_BATCH: usize = 256;

/// Payload fields with keyword indexes.
pub const INDEXED_FIELDS: &[&str] = &["file", "org_id", "repo_id", "branch", "language", "symbol_type"];

/// Which tenant a store reads and writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantScope {
    pub org_id: String,
    pub repo_id: String,
    /// Reads are scoped to this branch when set
    pub branch: Option<String>,
    pub commit_sha: Option<String>,
}

impl TenantScope {
    pub fn new(org_id: impl Into<String>, repo_id: impl Into<String>) -> Self {
        Self {
            org_id: org_id.into(),
            repo_id: repo_id.into(),
            branch: None,
            commit_sha: None,
        }
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn with_commit(mut self, commit: impl Into<String>) -> Self {
        self.commit_sha = Some(commit.into());
        self
    }

    /// `repo_id` defaults to the project directory name.
    pub fn from_config(config: &sift_config::QdrantConfig, root: &Path) -> Self {
        let repo_id = config.repo_id.clone().unwrap_or_else(|| {
            root.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "default".to_string())
        });
        Self {
            org_id: config.org_id.clone().unwrap_or_else(|| "default".to_string()),
            repo_id,
            branch: config.branch.clone(),
            commit_sha: config.commit.clone(),
        }
    }

    fn conditions(&self) -> Vec<Condition> {
        let mut conditions = vec![
            Condition::matches("org_id", self.org_id.clone()),
            Condition::matches("repo_id", self.repo_id.clone()),
        ];
        if let Some(branch) = &self.branch {
            conditions.push(Condition::matches("branch", branch.clone()));
        }
        conditions
    }

    fn filter_with(&self, extra: Vec<Condition>) -> Filter {
        let mut conditions = self.conditions();
        conditions.extend(extra);
        Filter::must(conditions)
    }
}

pub struct QdrantStore {
    client: Qdrant,
    collection: String,
    dimensions: usize,
    tenant: TenantScope,
    ranker: Arc<RelevanceRanker>,
}

fn request_err(operation: &str, e: QdrantError) -> VectorStoreError {
    VectorStoreError::Unavailable {
        backend: BACKEND,
        message: format!("{} failed: {}", operation, e),
    }
}

impl QdrantStore {
    /// Build a client. No request is made until the first operation.
    pub fn connect(
        config: &sift_config::QdrantConfig,
        dimensions: usize,
        tenant: TenantScope,
        ranker: Arc<RelevanceRanker>,
    ) -> Result<Self, VectorStoreError> {
        let mut builder = Qdrant::from_url(&config.url).skip_compatibility_check();
        if let Some(api_key) = &config.api_key {
            builder = builder.api_key(api_key.clone());
        }
        let client = builder.build().map_err(|e| request_err("connect", e))?;
        info!(
            "Qdrant store at {} (collection {}, tenant {}/{})",
            config.url, config.collection, tenant.org_id, tenant.repo_id
        );

        Ok(Self {
            client,
            collection: config.collection.clone(),
            dimensions,
            tenant,
            ranker,
        })
    }

    pub fn tenant(&self) -> &TenantScope {
        &self.tenant
    }

    async fn collection_exists(&self) -> Result<bool, VectorStoreError> {
        let collections = self
            .client
            .list_collections()
            .await
            .map_err(|e| request_err("list collections", e))?;
        Ok(collections
            .collections
            .iter()
            .any(|c| c.name == self.collection))
    }

    async fn ensure_collection(&self) -> Result<(), VectorStoreError> {
        if self.collection_exists().await? {
            let info = self
                .client
                .collection_info(&self.collection)
                .await
                .map_err(|e| request_err("collection info", e))?;
            if let Some(size) = collection_dimensions(&info) {
                if size as usize != self.dimensions {
                    return Err(VectorStoreError::DimensionMismatch {
                        expected: size as usize,
                        actual: self.dimensions,
                    });
                }
            }
            debug!("Collection {} already exists", self.collection);
            return Ok(());
        }

        info!(
            "Creating collection {} with {} dimensions",
            self.collection, self.dimensions
        );
        self.client
            .create_collection(
                CreateCollectionBuilder::new(&self.collection)
                    .vectors_config(VectorParamsBuilder::new(
                        self.dimensions as u64,
                        Distance::Cosine,
                    ))
                    .quantization_config(
                        ScalarQuantizationBuilder::default()
                            .r#type(QuantizationType::Int8.into())
                            .quantile(0.99)
                            .always_ram(true),
                    ),
            )
            .await
            .map_err(|e| request_err("create collection", e))?;
        Ok(())
    }

    /// Page through every point matching `filter`, keeping those accepted by `keep`.
    async fn scroll_all<F>(
        &self,
        filter: Filter,
        limit: Option<usize>,
        keep: F,
    ) -> Result<Vec<SearchResult>, VectorStoreError>
    where
        F: Fn(&str, &ChunkMetadata) -> bool,
    {
        let mut results = Vec::new();
        let mut offset: Option<PointId> = None;

        loop {
            let mut builder = ScrollPointsBuilder::new(&self.collection)
                .filter(filter.clone())
                .limit(SCROLL_PAGE)
                .with_payload(true)
                .with_vectors(false);
            if let Some(next) = offset.take() {
                builder = builder.offset(next);
            }

            let page = self
                .client
                .scroll(builder)
                .await
                .map_err(|e| request_err("scroll", e))?;

            for point in page.result {
                let (content, metadata) = payload_to_chunk(&point.payload);
                if !keep(&content, &metadata) {
                    continue;
                }
                results.push(SearchResult::new(content, metadata, 0.0));
                if limit.is_some_and(|l| results.len() >= l) {
                    return Ok(results);
                }
            }

            match page.next_page_offset {
                Some(next) => offset = Some(next),
                None => break,
            }
        }

        debug!("Scroll returned {} points", results.len());
        Ok(results)
    }
}

fn collection_dimensions(info: &GetCollectionInfoResponse) -> Option<u64> {
    let params = info.result.as_ref()?.config.as_ref()?.params.as_ref()?;
    match params.vectors_config.as_ref()?.config.as_ref()? {
        vectors_config::Config::Params(p) => Some(p.size),
        vectors_config::Config::ParamsMap(_) => None,
    }
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn initialize(&self) -> Result<(), VectorStoreError> {
        self.ensure_collection().await?;
        for field in INDEXED_FIELDS {
            self.client
                .create_field_index(CreateFieldIndexCollectionBuilder::new(
                    &self.collection,
                    *field,
                    FieldType::Keyword,
                ))
                .await
                .map_err(|e| request_err("create payload index", e))?;
        }
        Ok(())
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

        let total = vectors.len();
        let points: Vec<PointStruct> = vectors
            .into_iter()
            .zip(metadatas.iter().zip(contents.iter()))
            .map(|(vector, (metadata, content))| {
                PointStruct::new(
                    uuid::Uuid::new_v4().to_string(),
                    vector,
                    chunk_to_payload(metadata, content, &self.tenant),
                )
            })
            .collect();

        for batch in points.chunks(UPSERT_BATCH) {
            self.client
                .upsert_points(UpsertPointsBuilder::new(&self.collection, batch.to_vec()).wait(true))
                .await
                .map_err(|e| request_err("upsert", e))?;
        }
        debug!("Upserted {} points", total);
        Ok(total)
    }

    async fn delete_by_file(&self, file: &str) -> Result<(), VectorStoreError> {
        let file = predicate::require_value("file", file)?;
        let filter = self
            .tenant
            .filter_with(vec![Condition::matches("file", file.to_string())]);
        self.client
            .delete_points(
                DeletePointsBuilder::new(&self.collection)
                    .points(filter)
                    .wait(true),
            )
            .await
            .map_err(|e| request_err("delete", e))?;
        Ok(())
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
        let response = self
            .client
            .search_points(
                SearchPointsBuilder::new(&self.collection, query.to_vec(), pool as u64)
                    .filter(self.tenant.filter_with(Vec::new()))
                    .with_payload(true),
            )
            .await
            .map_err(|e| request_err("search", e))?;

        let candidates: Vec<SearchResult> = response
            .result
            .into_iter()
            .map(|point| {
                let (content, metadata) = payload_to_chunk(&point.payload);
                SearchResult::new(content, metadata, distance_from_cosine(point.score))
            })
            .collect();

        Ok(self.ranker.rank(candidates, query_text, limit))
    }

    async fn scan_with_filter(
        &self,
        filter: &ScanFilter,
    ) -> Result<Vec<SearchResult>, VectorStoreError> {
        let pattern = filter.validate()?;
        if filter.matches_nothing() {
            return Ok(Vec::new());
        }

        let mut conditions = Vec::new();
        if let Some(files) = &filter.files {
            conditions.push(Condition::matches("file", files.clone()));
        }
        if let Some(file) = &filter.file {
            conditions.push(Condition::matches("file", file.clone()));
        }
        if let Some(language) = &filter.language {
            conditions.push(Condition::matches("language", language.clone()));
        }
        if let Some(symbol_type) = &filter.symbol_type {
            conditions.push(Condition::matches("symbol_type", symbol_type.clone()));
        }

        self.scroll_all(self.tenant.filter_with(conditions), filter.limit, |content, _| {
            pattern.as_ref().map_or(true, |re| re.is_match(content))
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

        let mut conditions = Vec::new();
        if let Some(kinds) = query.kinds() {
            conditions.push(Condition::matches("symbol_type", kinds));
        }
        if let Some(language) = &query.language {
            conditions.push(Condition::matches("language", language.clone()));
        }

        self.scroll_all(self.tenant.filter_with(conditions), query.limit, |_, metadata| {
            match (&pattern, &metadata.symbol_name) {
                (_, None) => false,
                (Some(re), Some(name)) => re.is_match(name),
                (None, Some(_)) => true,
            }
        })
        .await
    }

    /// Remove this tenant's points. The shared collection and its vector
    /// size are left alone.
    async fn clear(&self) -> Result<(), VectorStoreError> {
        if !self.collection_exists().await? {
            debug!("Collection {} does not exist, nothing to clear", self.collection);
            return Ok(());
        }
        info!(
            "Clearing tenant {}/{} from {}",
            self.tenant.org_id, self.tenant.repo_id, self.collection
        );
        self.client
            .delete_points(
                DeletePointsBuilder::new(&self.collection)
                    .points(self.tenant.filter_with(Vec::new()))
                    .wait(true),
            )
            .await
            .map_err(|e| request_err("clear", e))?;
        Ok(())
    }

    async fn count(&self) -> Result<usize, VectorStoreError> {
        let response = self
            .client
            .count(
                CountPointsBuilder::new(&self.collection)
                    .filter(self.tenant.filter_with(Vec::new()))
                    .exact(true),
            )
            .await
            .map_err(|e| request_err("count", e))?;
        Ok(response.result.map(|r| r.count as usize).unwrap_or(0))
    }

    fn backend_name(&self) -> &'static str {
        BACKEND
    }
}

/// Flatten a chunk into a Qdrant payload, list fields as JSON strings.
fn chunk_to_payload(
    metadata: &ChunkMetadata,
    content: &str,
    tenant: &TenantScope,
) -> HashMap<String, Value> {
    let mut map = HashMap::new();

    map.insert("content".to_string(), Value::from(content.to_string()));
    map.insert("file".to_string(), Value::from(metadata.file.clone()));
    map.insert("start_line".to_string(), Value::from(metadata.start_line as i64));
    map.insert("end_line".to_string(), Value::from(metadata.end_line as i64));
    map.insert("language".to_string(), Value::from(metadata.language.clone()));
    map.insert("org_id".to_string(), Value::from(tenant.org_id.clone()));
    map.insert("repo_id".to_string(), Value::from(tenant.repo_id.clone()));

    if let Some(branch) = &tenant.branch {
        map.insert("branch".to_string(), Value::from(branch.clone()));
    }
    if let Some(commit) = &tenant.commit_sha {
        map.insert("commit_sha".to_string(), Value::from(commit.clone()));
    }
    if let Some(name) = &metadata.symbol_name {
        map.insert("symbol_name".to_string(), Value::from(name.clone()));
    }
    if let Some(kind) = &metadata.symbol_type {
        map.insert("symbol_type".to_string(), Value::from(kind.clone()));
    }
    if let Some(parent) = &metadata.parent_class {
        map.insert("parent_class".to_string(), Value::from(parent.clone()));
    }
    if let Some(complexity) = metadata.complexity {
        map.insert("complexity".to_string(), Value::from(complexity as i64));
    }
    if !metadata.imports.is_empty() {
        map.insert("imports".to_string(), json_value(&metadata.imports));
    }
    if !metadata.exports.is_empty() {
        map.insert("exports".to_string(), json_value(&metadata.exports));
    }
    if !metadata.call_sites.is_empty() {
        map.insert("call_sites".to_string(), json_value(&metadata.call_sites));
    }

    map
}

fn json_value<T: serde::Serialize>(value: &T) -> Value {
    Value::from(serde_json::to_string(value).unwrap_or_default())
}

fn payload_to_chunk(map: &HashMap<String, Value>) -> (String, ChunkMetadata) {
    let metadata = ChunkMetadata {
        file: extract_string(map.get("file")),
        start_line: extract_integer(map.get("start_line")) as usize,
        end_line: extract_integer(map.get("end_line")) as usize,
        language: extract_string(map.get("language")),
        symbol_name: map.get("symbol_name").and_then(extract_string_opt),
        symbol_type: map.get("symbol_type").and_then(extract_string_opt),
        parent_class: map.get("parent_class").and_then(extract_string_opt),
        complexity: map
            .get("complexity")
            .map(|v| extract_integer(Some(v)) as u32),
        imports: extract_json(map.get("imports")),
        exports: extract_json(map.get("exports")),
        call_sites: extract_json::<Vec<CallSite>>(map.get("call_sites")),
    };
    (extract_string(map.get("content")), metadata)
}

fn extract_string(value: Option<&Value>) -> String {
    value.and_then(extract_string_opt).unwrap_or_default()
}

fn extract_string_opt(value: &Value) -> Option<String> {
    if let Some(Kind::StringValue(s)) = &value.kind {
        Some(s.clone())
    } else {
        None
    }
}

fn extract_integer(value: Option<&Value>) -> i64 {
    value
        .and_then(|v| {
            if let Some(Kind::IntegerValue(i)) = &v.kind {
                Some(*i)
            } else {
                None
            }
        })
        .unwrap_or(0)
}

fn extract_json<T: serde::de::DeserializeOwned + Default>(value: Option<&Value>) -> T {
    value
        .and_then(extract_string_opt)
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}
