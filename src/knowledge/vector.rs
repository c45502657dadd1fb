//! Vector Store - 벡터 검색 트레이트 및 유틸리티
//!
//! 컬렉션마다 차원과 거리 metric을 생성 시점에 선언하고 고정합니다.
//! 모든 검색 결과는 선언된 metric 기준 거리 오름차순(가까울수록 앞)입니다.
//!
//! `similarity = 1 - distance` 변환은 단위 벡터 코사인 거리에서만 성립하므로
//! [`DistanceMetric::similarity`]는 L2 컬렉션에 대해 `None`을 반환합니다.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{RetrievalError, RetrievalResult};

use super::model::{CandidatePassage, Metadata};

/// 벡터 임베딩 기본 차원 (Gemini gemini-embedding-001 기본값)
/// source: https://ai.google.dev/gemini-api/docs/embeddings
pub const EMBEDDING_DIMENSION: usize = 768;

/// 요청 top_k 상한
pub const MAX_TOP_K: usize = 100;

// ============================================================================
// Types
// ============================================================================

/// 컬렉션 거리 metric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    /// 코사인 거리 (1 - cos). 저장/쿼리 벡터는 단위 벡터로 정규화됨
    #[default]
    Cosine,
    /// 유클리드(L2) 거리
    L2,
}

impl DistanceMetric {
    /// 두 벡터 간 거리 (길이가 같다고 가정)
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            DistanceMetric::Cosine => 1.0 - cosine_similarity(a, b),
            DistanceMetric::L2 => a
                .iter()
                .zip(b.iter())
                .map(|(x, y)| (x - y) * (x - y))
                .sum::<f32>()
                .sqrt(),
        }
    }

    /// 거리 → 유사도 변환 (코사인에서만 유효)
    pub fn similarity(&self, distance: f32) -> Option<f32> {
        match self {
            DistanceMetric::Cosine => Some((1.0 - distance).clamp(-1.0, 1.0)),
            DistanceMetric::L2 => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DistanceMetric::Cosine => "cosine",
            DistanceMetric::L2 => "l2",
        }
    }
}

/// 컬렉션 선언
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSpec {
    pub name: String,
    pub dimension: usize,
    pub metric: DistanceMetric,
}

impl CollectionSpec {
    pub fn new(name: impl Into<String>, dimension: usize, metric: DistanceMetric) -> Self {
        Self {
            name: name.into(),
            dimension,
            metric,
        }
    }

    pub fn cosine(name: impl Into<String>, dimension: usize) -> Self {
        Self::new(name, dimension, DistanceMetric::Cosine)
    }

    /// 벡터 길이가 선언 차원과 같은지 확인 (다르면 DimensionMismatch)
    pub fn check_dimension(&self, actual: usize) -> RetrievalResult<()> {
        if actual != self.dimension {
            return Err(RetrievalError::DimensionMismatch {
                collection: self.name.clone(),
                expected: self.dimension,
                actual,
            });
        }
        Ok(())
    }
}

/// 벡터 엔트리 (저장용, 청크와 1:1)
#[derive(Debug, Clone, PartialEq)]
pub struct VectorRecord {
    pub chunk_id: String,
    pub document_id: String,
    pub text: String,
    pub metadata: Metadata,
    pub embedding: Vec<f32>,
}

// ============================================================================
// VectorStore Trait
// ============================================================================

/// VectorStore 트레이트 (async)
///
/// 벡터 유사도 서비스의 공통 인터페이스입니다.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// 컬렉션 생성 (이미 있으면 선언이 같은지 확인)
    async fn create_collection(&self, spec: &CollectionSpec) -> RetrievalResult<()>;

    /// 컬렉션 선언 조회
    async fn collection(&self, name: &str) -> RetrievalResult<Option<CollectionSpec>>;

    /// 모든 컬렉션 선언
    async fn list_collections(&self) -> RetrievalResult<Vec<CollectionSpec>>;

    /// 벡터 upsert (chunk_id 기준). 차원이 다르면 DimensionMismatch
    async fn upsert(&self, collection: &str, records: &[VectorRecord]) -> RetrievalResult<usize>;

    /// ANN 검색 - 거리 오름차순
    async fn search(
        &self,
        collection: &str,
        query: &[f32],
        top_k: usize,
    ) -> RetrievalResult<Vec<CandidatePassage>>;

    /// 문서 ID로 벡터 삭제
    async fn delete_by_document(&self, collection: &str, document_id: &str)
        -> RetrievalResult<usize>;

    /// 벡터 개수
    async fn count(&self, collection: &str) -> RetrievalResult<usize>;
}

// ============================================================================
// Multi-collection search
// ============================================================================

/// 여러 컬렉션을 동시에 검색하고 거리 기준으로 재정렬
///
/// 모든 컬렉션은 같은 metric이어야 합니다 (다른 metric의 거리는 비교 불가).
/// 일부 컬렉션만 실패하면 경고 후 나머지 결과를 사용하고,
/// 모두 실패하면 첫 번째 에러를 반환합니다.
pub async fn search_collections(
    store: &dyn VectorStore,
    collections: &[String],
    query: &[f32],
    top_k: usize,
) -> RetrievalResult<Vec<CandidatePassage>> {
    if collections.is_empty() {
        return Ok(vec![]);
    }
    let top_k = top_k.clamp(1, MAX_TOP_K);

    let mut metric: Option<DistanceMetric> = None;
    for name in collections {
        let spec = store.collection(name).await?.ok_or_else(|| {
            RetrievalError::Config(format!("vector collection '{}' does not exist", name))
        })?;
        match metric {
            None => metric = Some(spec.metric),
            Some(m) if m != spec.metric => {
                return Err(RetrievalError::Config(format!(
                    "cannot merge collections with different metrics ({} vs {} in '{}')",
                    m.as_str(),
                    spec.metric.as_str(),
                    name
                )));
            }
            Some(_) => {}
        }
    }

    let searches = collections
        .iter()
        .map(|name| store.search(name, query, top_k));
    let outcomes = join_all(searches).await;

    let mut merged = Vec::new();
    let mut first_error = None;
    let mut failures = 0;

    for (name, outcome) in collections.iter().zip(outcomes) {
        match outcome {
            Ok(hits) => merged.extend(hits),
            Err(e) if e.is_systemic() => return Err(e),
            Err(e) => {
                tracing::warn!(collection = %name, error = %e, "Vector collection search failed");
                failures += 1;
                first_error.get_or_insert(e);
            }
        }
    }

    if failures == collections.len() {
        if let Some(e) = first_error {
            return Err(e);
        }
    }

    sort_by_distance(&mut merged);
    merged.truncate(top_k);
    Ok(merged)
}

/// 거리 오름차순, 동점은 chunk_id 순 (결정적 순서)
pub fn sort_by_distance(candidates: &mut [CandidatePassage]) {
    candidates.sort_by(|a, b| {
        a.distance
            .partial_cmp(&b.distance)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
}

// ============================================================================
// InMemoryVectorStore
// ============================================================================

/// 인메모리 벡터 저장소 (테스트 및 소규모 용도)
///
/// 컬렉션 이름 → (선언, chunk_id → 엔트리). 전수 비교로 검색합니다.
#[derive(Debug, Default)]
pub struct InMemoryVectorStore {
    collections: RwLock<HashMap<String, (CollectionSpec, HashMap<String, VectorRecord>)>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn missing(collection: &str) -> RetrievalError {
        RetrievalError::store("InMemory", format!("collection '{}' does not exist", collection))
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn create_collection(&self, spec: &CollectionSpec) -> RetrievalResult<()> {
        let mut collections = self.collections.write().await;
        if let Some((existing, _)) = collections.get(&spec.name) {
            return ensure_same_spec(existing, spec);
        }
        collections.insert(spec.name.clone(), (spec.clone(), HashMap::new()));
        Ok(())
    }

    async fn collection(&self, name: &str) -> RetrievalResult<Option<CollectionSpec>> {
        let collections = self.collections.read().await;
        Ok(collections.get(name).map(|(spec, _)| spec.clone()))
    }

    async fn list_collections(&self) -> RetrievalResult<Vec<CollectionSpec>> {
        let collections = self.collections.read().await;
        let mut specs: Vec<CollectionSpec> =
            collections.values().map(|(spec, _)| spec.clone()).collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(specs)
    }

    async fn upsert(&self, collection: &str, records: &[VectorRecord]) -> RetrievalResult<usize> {
        let mut collections = self.collections.write().await;
        let (spec, entries) = collections
            .get_mut(collection)
            .ok_or_else(|| Self::missing(collection))?;

        // 하나라도 차원이 다르면 아무것도 넣지 않음
        for record in records {
            spec.check_dimension(record.embedding.len())?;
        }

        let mut prepared = Vec::with_capacity(records.len());
        for record in records {
            let mut record = record.clone();
            if spec.metric == DistanceMetric::Cosine {
                normalize_in_place(&mut record.embedding, &record.chunk_id)?;
            }
            prepared.push(record);
        }

        let count = prepared.len();
        for record in prepared {
            entries.insert(record.chunk_id.clone(), record);
        }
        Ok(count)
    }

    async fn search(
        &self,
        collection: &str,
        query: &[f32],
        top_k: usize,
    ) -> RetrievalResult<Vec<CandidatePassage>> {
        let collections = self.collections.read().await;
        let (spec, entries) = collections
            .get(collection)
            .ok_or_else(|| Self::missing(collection))?;
        spec.check_dimension(query.len())?;

        let mut query = query.to_vec();
        if spec.metric == DistanceMetric::Cosine {
            normalize_in_place(&mut query, "query")?;
        }

        let mut hits: Vec<CandidatePassage> = entries
            .values()
            .map(|record| CandidatePassage {
                chunk_id: record.chunk_id.clone(),
                document_id: record.document_id.clone(),
                collection: spec.name.clone(),
                text: record.text.clone(),
                metadata: record.metadata.clone(),
                distance: spec.metric.distance(&record.embedding, &query),
                relevance: None,
                score_source: None,
            })
            .collect();

        sort_by_distance(&mut hits);
        hits.truncate(top_k.min(MAX_TOP_K));
        Ok(hits)
    }

    async fn delete_by_document(
        &self,
        collection: &str,
        document_id: &str,
    ) -> RetrievalResult<usize> {
        let mut collections = self.collections.write().await;
        let (_, entries) = collections
            .get_mut(collection)
            .ok_or_else(|| Self::missing(collection))?;
        let before = entries.len();
        entries.retain(|_, r| r.document_id != document_id);
        Ok(before - entries.len())
    }

    async fn count(&self, collection: &str) -> RetrievalResult<usize> {
        let collections = self.collections.read().await;
        Ok(collections.get(collection).map(|(_, e)| e.len()).unwrap_or(0))
    }
}

// ============================================================================
// Utility Functions
// ============================================================================

/// 기존 컬렉션 선언과 요청 선언이 같은지 확인
pub(crate) fn ensure_same_spec(
    existing: &CollectionSpec,
    requested: &CollectionSpec,
) -> RetrievalResult<()> {
    if existing.dimension != requested.dimension {
        return Err(RetrievalError::DimensionMismatch {
            collection: existing.name.clone(),
            expected: existing.dimension,
            actual: requested.dimension,
        });
    }
    if existing.metric != requested.metric {
        return Err(RetrievalError::Config(format!(
            "collection '{}' is declared with metric {}, requested {}",
            existing.name,
            existing.metric.as_str(),
            requested.metric.as_str()
        )));
    }
    Ok(())
}

/// 단위 벡터로 정규화 (영벡터는 에러)
pub fn normalize_in_place(v: &mut [f32], label: &str) -> RetrievalResult<()> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return Err(RetrievalError::EmbeddingFailure {
            provider: "vector-store".to_string(),
            message: format!("zero-norm or non-finite vector for '{}'", label),
        });
    }
    for x in v.iter_mut() {
        *x /= norm;
    }
    Ok(())
}

/// 코사인 유사도 계산
///
/// 결과는 -1.0 ~ 1.0 범위입니다. 길이가 다르거나 영벡터면 0.0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, doc: &str, embedding: Vec<f32>) -> VectorRecord {
        VectorRecord {
            chunk_id: id.to_string(),
            document_id: doc.to_string(),
            text: format!("text of {}", id),
            metadata: Metadata::new(),
            embedding,
        }
    }

    async fn store_with(spec: CollectionSpec, records: Vec<VectorRecord>) -> InMemoryVectorStore {
        let store = InMemoryVectorStore::new();
        store.create_collection(&spec).await.unwrap();
        store.upsert(&spec.name, &records).await.unwrap();
        store
    }

    #[test]
    fn test_cosine_similarity_basic() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-4);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-4);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-4);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn test_similarity_only_for_cosine() {
        assert_eq!(DistanceMetric::Cosine.similarity(0.25), Some(0.75));
        assert_eq!(DistanceMetric::L2.similarity(0.25), None);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_rejected() {
        let store = InMemoryVectorStore::new();
        store.create_collection(&CollectionSpec::cosine("policy", 3)).await.unwrap();

        let err = store
            .upsert("policy", &[record("a", "d1", vec![1.0, 0.0])])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RetrievalError::DimensionMismatch { expected: 3, actual: 2, .. }
        ));
        assert_eq!(store.count("policy").await.unwrap(), 0);

        let err = store.search("policy", &[1.0, 0.0, 0.0, 0.0], 5).await.unwrap_err();
        assert!(matches!(err, RetrievalError::DimensionMismatch { .. }));
    }

    #[tokio::test]
    async fn test_redeclare_with_other_dimension_fails() {
        let store = InMemoryVectorStore::new();
        store.create_collection(&CollectionSpec::cosine("odb", 3)).await.unwrap();
        assert!(store.create_collection(&CollectionSpec::cosine("odb", 3)).await.is_ok());
        assert!(store.create_collection(&CollectionSpec::cosine("odb", 4)).await.is_err());
    }

    #[tokio::test]
    async fn test_search_ascending_distance() {
        let store = store_with(
            CollectionSpec::cosine("policy", 2),
            vec![
                record("far", "d1", vec![0.0, 1.0]),
                record("near", "d1", vec![1.0, 0.1]),
                record("mid", "d2", vec![1.0, 1.0]),
            ],
        )
        .await;

        let hits = store.search("policy", &[1.0, 0.0], 10).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["near", "mid", "far"]);
        assert!(hits.windows(2).all(|w| w[0].distance <= w[1].distance));
    }

    #[tokio::test]
    async fn test_zero_vector_rejected_for_cosine() {
        let store = InMemoryVectorStore::new();
        store.create_collection(&CollectionSpec::cosine("c", 2)).await.unwrap();
        let err = store.upsert("c", &[record("z", "d", vec![0.0, 0.0])]).await.unwrap_err();
        assert!(matches!(err, RetrievalError::EmbeddingFailure { .. }));
    }

    #[tokio::test]
    async fn test_search_collections_merges_by_distance() {
        let store = InMemoryVectorStore::new();
        for name in ["cpso", "cep"] {
            store.create_collection(&CollectionSpec::cosine(name, 2)).await.unwrap();
        }
        store.upsert("cpso", &[record("a", "d1", vec![0.0, 1.0])]).await.unwrap();
        store.upsert("cep", &[record("b", "d2", vec![1.0, 0.0])]).await.unwrap();

        let names = vec!["cpso".to_string(), "cep".to_string()];
        let hits = search_collections(&store, &names, &[1.0, 0.0], 10).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk_id, "b");
        assert_eq!(hits[0].collection, "cep");
    }

    #[tokio::test]
    async fn test_search_collections_rejects_mixed_metrics() {
        let store = InMemoryVectorStore::new();
        store.create_collection(&CollectionSpec::cosine("a", 2)).await.unwrap();
        store
            .create_collection(&CollectionSpec::new("b", 2, DistanceMetric::L2))
            .await
            .unwrap();
        let names = vec!["a".to_string(), "b".to_string()];
        let err = search_collections(&store, &names, &[1.0, 0.0], 5).await.unwrap_err();
        assert!(matches!(err, RetrievalError::Config(_)));
    }

    #[tokio::test]
    async fn test_delete_by_document() {
        let store = store_with(
            CollectionSpec::new("l2", 2, DistanceMetric::L2),
            vec![
                record("a", "d1", vec![1.0, 0.0]),
                record("b", "d1", vec![0.0, 1.0]),
                record("c", "d2", vec![1.0, 1.0]),
            ],
        )
        .await;
        assert_eq!(store.delete_by_document("l2", "d1").await.unwrap(), 2);
        assert_eq!(store.count("l2").await.unwrap(), 1);
    }
}
