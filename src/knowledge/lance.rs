//! LanceDB Vector Store - 컬렉션별 ANN 검색
//!
//! 컬렉션 하나 = LanceDB 테이블 하나. 컬렉션 선언(차원, metric)은
//! `<path>/collections.json` 레지스트리에 저장되며, 검색 시 선언된 metric을
//! 명시적으로 지정합니다 (LanceDB 기본값 L2에 의존하지 않음).
//! ref: https://lancedb.github.io/lancedb/

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow_array::{
    Array, FixedSizeListArray, Float32Array, RecordBatch, RecordBatchIterator, StringArray,
};
use arrow_schema::{DataType, Field, Schema};
use async_trait::async_trait;
use futures::TryStreamExt;
use lancedb::connection::Connection;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::DistanceType;
use tokio::sync::Mutex;

use crate::error::{RetrievalError, RetrievalResult};

use super::model::{CandidatePassage, Metadata};
use super::vector::{
    ensure_same_spec, normalize_in_place, sort_by_distance, CollectionSpec, DistanceMetric,
    VectorRecord, VectorStore, MAX_TOP_K,
};

const BACKEND: &str = "LanceDB";
const REGISTRY_FILE: &str = "collections.json";

// ============================================================================
// LanceVectorStore
// ============================================================================

/// LanceDB 벡터 저장소 구현
pub struct LanceVectorStore {
    db: Connection,
    registry_path: PathBuf,
    registry: Mutex<BTreeMap<String, CollectionSpec>>,
}

impl LanceVectorStore {
    /// LanceDB 저장소 열기
    ///
    /// # Arguments
    /// * `path` - .lance 디렉토리 경로
    pub async fn open(path: &Path) -> RetrievalResult<Self> {
        if !path.exists() {
            tokio::fs::create_dir_all(path)
                .await
                .map_err(|e| RetrievalError::store(BACKEND, format!("create dir: {}", e)))?;
        }

        let path_str = path
            .to_str()
            .ok_or_else(|| RetrievalError::store(BACKEND, "Invalid path encoding"))?;

        let db = lancedb::connect(path_str)
            .execute()
            .await
            .map_err(|e| RetrievalError::store(BACKEND, format!("connect: {}", e)))?;

        let registry_path = path.join(REGISTRY_FILE);
        let registry = if registry_path.exists() {
            let raw = tokio::fs::read_to_string(&registry_path)
                .await
                .map_err(|e| RetrievalError::store(BACKEND, format!("read registry: {}", e)))?;
            serde_json::from_str(&raw)
                .map_err(|e| RetrievalError::store(BACKEND, format!("parse registry: {}", e)))?
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            db,
            registry_path,
            registry: Mutex::new(registry),
        })
    }

    /// 컬렉션 테이블 스키마
    fn create_schema(dimension: usize) -> RetrievalResult<Schema> {
        let size = i32::try_from(dimension)
            .map_err(|_| RetrievalError::Config(format!("dimension too large: {}", dimension)))?;
        Ok(Schema::new(vec![
            Field::new("chunk_id", DataType::Utf8, false),
            Field::new("document_id", DataType::Utf8, false),
            Field::new("text", DataType::Utf8, false),
            Field::new("metadata", DataType::Utf8, false),
            Field::new(
                "embedding",
                DataType::FixedSizeList(Arc::new(Field::new("item", DataType::Float32, true)), size),
                false,
            ),
        ]))
    }

    /// 엔트리들을 Arrow RecordBatch로 변환
    fn records_to_batch(spec: &CollectionSpec, records: &[VectorRecord]) -> RetrievalResult<RecordBatch> {
        let schema = Arc::new(Self::create_schema(spec.dimension)?);

        let chunk_ids: Vec<&str> = records.iter().map(|r| r.chunk_id.as_str()).collect();
        let document_ids: Vec<&str> = records.iter().map(|r| r.document_id.as_str()).collect();
        let texts: Vec<&str> = records.iter().map(|r| r.text.as_str()).collect();
        let metadata: Vec<String> = records
            .iter()
            .map(|r| serde_json::to_string(&r.metadata).unwrap_or_else(|_| "{}".to_string()))
            .collect();

        let embeddings_flat: Vec<f32> = records
            .iter()
            .flat_map(|r| r.embedding.iter().copied())
            .collect();

        let values = Float32Array::from(embeddings_flat);
        let field = Arc::new(Field::new("item", DataType::Float32, true));
        let embeddings_list = FixedSizeListArray::try_new(
            field,
            spec.dimension as i32,
            Arc::new(values) as Arc<dyn Array>,
            None,
        )
        .map_err(|e| RetrievalError::store(BACKEND, format!("embedding array: {}", e)))?;

        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(chunk_ids)),
                Arc::new(StringArray::from(document_ids)),
                Arc::new(StringArray::from(texts)),
                Arc::new(StringArray::from(metadata)),
                Arc::new(embeddings_list),
            ],
        )
        .map_err(|e| RetrievalError::store(BACKEND, format!("record batch: {}", e)))
    }

    async fn table_exists(&self, name: &str) -> bool {
        self.db
            .table_names()
            .execute()
            .await
            .map(|names| names.iter().any(|n| n == name))
            .unwrap_or(false)
    }

    async fn open_table(&self, name: &str) -> RetrievalResult<lancedb::table::Table> {
        self.db
            .open_table(name)
            .execute()
            .await
            .map_err(|e| RetrievalError::store(BACKEND, format!("open table '{}': {}", name, e)))
    }

    async fn spec(&self, name: &str) -> RetrievalResult<CollectionSpec> {
        self.registry
            .lock()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| {
                RetrievalError::store(BACKEND, format!("collection '{}' does not exist", name))
            })
    }

    async fn save_registry(&self, registry: &BTreeMap<String, CollectionSpec>) -> RetrievalResult<()> {
        let raw = serde_json::to_string_pretty(registry)
            .map_err(|e| RetrievalError::store(BACKEND, format!("encode registry: {}", e)))?;
        tokio::fs::write(&self.registry_path, raw)
            .await
            .map_err(|e| RetrievalError::store(BACKEND, format!("write registry: {}", e)))
    }
}

#[async_trait]
impl VectorStore for LanceVectorStore {
    async fn create_collection(&self, spec: &CollectionSpec) -> RetrievalResult<()> {
        let mut registry = self.registry.lock().await;
        if let Some(existing) = registry.get(&spec.name) {
            return ensure_same_spec(existing, spec);
        }

        if !self.table_exists(&spec.name).await {
            let schema = Arc::new(Self::create_schema(spec.dimension)?);
            self.db
                .create_empty_table(&spec.name, schema)
                .execute()
                .await
                .map_err(|e| RetrievalError::store(BACKEND, format!("create table: {}", e)))?;
        }

        registry.insert(spec.name.clone(), spec.clone());
        self.save_registry(&registry).await?;
        tracing::info!(
            collection = %spec.name,
            dimension = spec.dimension,
            metric = spec.metric.as_str(),
            "Created vector collection"
        );
        Ok(())
    }

    async fn collection(&self, name: &str) -> RetrievalResult<Option<CollectionSpec>> {
        Ok(self.registry.lock().await.get(name).cloned())
    }

    async fn list_collections(&self) -> RetrievalResult<Vec<CollectionSpec>> {
        Ok(self.registry.lock().await.values().cloned().collect())
    }

    async fn upsert(&self, collection: &str, records: &[VectorRecord]) -> RetrievalResult<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        let spec = self.spec(collection).await?;
        for record in records {
            spec.check_dimension(record.embedding.len())?;
        }

        let mut prepared = records.to_vec();
        if spec.metric == DistanceMetric::Cosine {
            for record in &mut prepared {
                normalize_in_place(&mut record.embedding, &record.chunk_id)?;
            }
        }

        let table = self.open_table(collection).await?;

        // chunk_id 기준 upsert: 기존 행 삭제 후 추가
        let id_list = prepared
            .iter()
            .map(|r| format!("'{}'", escape_literal(&r.chunk_id)))
            .collect::<Vec<_>>()
            .join(", ");
        table
            .delete(&format!("chunk_id IN ({})", id_list))
            .await
            .map_err(|e| RetrievalError::store(BACKEND, format!("delete before upsert: {}", e)))?;

        let batch = Self::records_to_batch(&spec, &prepared)?;
        let schema = batch.schema();
        let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);
        table
            .add(batches)
            .execute()
            .await
            .map_err(|e| RetrievalError::store(BACKEND, format!("add vectors: {}", e)))?;

        Ok(prepared.len())
    }

    async fn search(
        &self,
        collection: &str,
        query: &[f32],
        top_k: usize,
    ) -> RetrievalResult<Vec<CandidatePassage>> {
        let spec = self.spec(collection).await?;
        spec.check_dimension(query.len())?;

        let mut query = query.to_vec();
        let distance_type = match spec.metric {
            DistanceMetric::Cosine => {
                normalize_in_place(&mut query, "query")?;
                DistanceType::Cosine
            }
            DistanceMetric::L2 => DistanceType::L2,
        };

        let table = self.open_table(collection).await?;
        let stream = table
            .vector_search(query)
            .map_err(|e| RetrievalError::store(BACKEND, format!("vector search: {}", e)))?
            .distance_type(distance_type)
            .limit(top_k.clamp(1, MAX_TOP_K))
            .execute()
            .await
            .map_err(|e| RetrievalError::store(BACKEND, format!("execute search: {}", e)))?;

        let batches: Vec<RecordBatch> = stream
            .try_collect()
            .await
            .map_err(|e| RetrievalError::store(BACKEND, format!("collect results: {}", e)))?;

        let mut hits = Vec::new();
        for batch in batches {
            let column = |name: &str| {
                batch
                    .column_by_name(name)
                    .and_then(|c| c.as_any().downcast_ref::<StringArray>())
                    .ok_or_else(|| RetrievalError::store(BACKEND, format!("Missing {} column", name)))
            };
            let chunk_ids = column("chunk_id")?;
            let document_ids = column("document_id")?;
            let texts = column("text")?;
            let metadata = column("metadata")?;

            // _distance 컬럼 (LanceDB가 자동 추가)
            let distances = batch
                .column_by_name("_distance")
                .and_then(|c| c.as_any().downcast_ref::<Float32Array>())
                .ok_or_else(|| RetrievalError::store(BACKEND, "Missing _distance column"))?;

            for i in 0..batch.num_rows() {
                let metadata: Metadata = serde_json::from_str(metadata.value(i)).unwrap_or_default();
                hits.push(CandidatePassage {
                    chunk_id: chunk_ids.value(i).to_string(),
                    document_id: document_ids.value(i).to_string(),
                    collection: spec.name.clone(),
                    text: texts.value(i).to_string(),
                    metadata,
                    distance: distances.value(i),
                    relevance: None,
                    score_source: None,
                });
            }
        }

        sort_by_distance(&mut hits);
        Ok(hits)
    }

    async fn delete_by_document(
        &self,
        collection: &str,
        document_id: &str,
    ) -> RetrievalResult<usize> {
        self.spec(collection).await?;
        let table = self.open_table(collection).await?;

        let filter = format!("document_id = '{}'", escape_literal(document_id));
        let before = table
            .count_rows(Some(filter.clone()))
            .await
            .map_err(|e| RetrievalError::store(BACKEND, format!("count rows: {}", e)))?;
        table
            .delete(&filter)
            .await
            .map_err(|e| RetrievalError::store(BACKEND, format!("delete vectors: {}", e)))?;
        Ok(before)
    }

    async fn count(&self, collection: &str) -> RetrievalResult<usize> {
        if self.registry.lock().await.get(collection).is_none() {
            return Ok(0);
        }
        let table = self.open_table(collection).await?;
        table
            .count_rows(None)
            .await
            .map_err(|e| RetrievalError::store(BACKEND, format!("count rows: {}", e)))
    }
}

/// SQL 문자열 리터럴 이스케이프 (작은따옴표 이중화)
fn escape_literal(value: &str) -> String {
    value.replace('\'', "''")
}

// ============================================================================
// Tests
// ============================================================================
