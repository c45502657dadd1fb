//! 하이브리드 검색 통합 테스트
//!
//! structured / vector / embedding / scoring 서비스를 프로세스 내 가짜로 대체하여
//! 오케스트레이터의 병렬 실행, 경로 실패 처리, 충돌 표면화를 검증합니다.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;
use tempfile::TempDir;

use medguide_rag::config::RetrievalConfig;
use medguide_rag::embedding::{EmbedTask, EmbeddingProvider};
use medguide_rag::error::{RetrievalError, RetrievalResult};
use medguide_rag::knowledge::{
    meta, CandidatePassage, Chunk, ChunkLevel, CollectionSpec, Document, DocumentType, EntityKind,
    InMemoryVectorStore, KnowledgeStore, MatchKind, Metadata, Relation, RowBody, SourceRef,
    SqliteStructuredStore, StructuredEntity, StructuredFilters, StructuredQuery, StructuredRow,
    StructuredStore, VectorRecord, VectorStore,
};
use medguide_rag::retrieval::{
    EnvelopeStatus, FactOrigin, HybridRetriever, LlmReranker, Provenance, RetrievalRequest,
};
use medguide_rag::scoring::LlmScorer;

const DIMENSION: usize = 16;
const COLLECTION: &str = "ohip";

// ============================================================================
// Fakes
// ============================================================================

/// 단어 해시 기반 결정적 임베딩
struct BagOfWords {
    fail: Option<RetrievalError>,
}

fn bag_of_words(text: &str) -> Vec<f32> {
    let mut v = vec![0.01; DIMENSION];
    for word in text.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()) {
        let bucket = word.to_lowercase().bytes().map(usize::from).sum::<usize>() % DIMENSION;
        v[bucket] += 1.0;
    }
    v
}

#[async_trait]
impl EmbeddingProvider for BagOfWords {
    async fn embed_batch(&self, texts: &[String], _task: EmbedTask) -> RetrievalResult<Vec<Vec<f32>>> {
        match &self.fail {
            Some(RetrievalError::Provider { provider, message }) => Err(RetrievalError::Provider {
                provider: provider.clone(),
                message: message.clone(),
            }),
            Some(_) => Err(RetrievalError::EmbeddingFailure {
                provider: "fake".to_string(),
                message: "503 Service Unavailable".to_string(),
            }),
            None => Ok(texts.iter().map(|t| bag_of_words(t)).collect()),
        }
    }

    fn dimension(&self) -> usize {
        DIMENSION
    }

    fn model(&self) -> &str {
        "bag-of-words"
    }
}

/// 본문에 C122가 있으면 높은 점수
struct KeywordScorer;

#[async_trait]
impl LlmScorer for KeywordScorer {
    async fn complete(&self, prompt: &str) -> RetrievalResult<String> {
        let passage = prompt.split("Passage:").nth(1).unwrap_or_default();
        Ok(if passage.contains("C122") { "9" } else { "2" }.to_string())
    }

    fn model(&self) -> &str {
        "keyword"
    }
}

/// 지연/실패를 주입할 수 있는 structured 저장소
struct FakeStructured {
    entities: Vec<StructuredEntity>,
    sections: Vec<StructuredRow>,
    delay: Duration,
    fail: bool,
}

impl FakeStructured {
    fn row(&self, entity: &StructuredEntity) -> StructuredRow {
        StructuredRow {
            natural_key: entity.natural_key.clone(),
            description: entity.description.clone(),
            source_document_id: entity.source.document_id.clone(),
            section_ref: entity.source.section_ref.clone(),
            match_kind: MatchKind::ExactKey,
            body: RowBody::Entity(entity.clone()),
            document: Some(schedule_document()),
        }
    }

    async fn wait(&self) -> RetrievalResult<()> {
        tokio::time::sleep(self.delay).await;
        if self.fail {
            return Err(RetrievalError::store("sqlite", "database is locked"));
        }
        Ok(())
    }
}

fn org_allowed(filters: &StructuredFilters, org: &str) -> bool {
    filters.source_orgs.is_empty() || filters.source_orgs.iter().any(|o| o.eq_ignore_ascii_case(org))
}

#[async_trait]
impl StructuredStore for FakeStructured {
    /// 힌트 키의 엔티티 + 섹션 (기관 필터 적용)
    async fn search(&self, query: &StructuredQuery) -> RetrievalResult<Vec<StructuredRow>> {
        self.wait().await?;
        if !org_allowed(&query.filters, &schedule_document().source_org) {
            return Ok(Vec::new());
        }
        let mut rows: Vec<StructuredRow> = self
            .entities
            .iter()
            .filter(|e| query.key_hints.iter().any(|k| k.eq_ignore_ascii_case(&e.natural_key)))
            .map(|e| self.row(e))
            .collect();
        rows.extend(self.sections.iter().cloned());
        Ok(rows)
    }

    async fn get_by_key(&self, key: &str) -> RetrievalResult<Option<StructuredRow>> {
        self.wait().await?;
        Ok(self
            .entities
            .iter()
            .find(|e| e.natural_key.eq_ignore_ascii_case(key))
            .map(|e| self.row(e)))
    }

    async fn get_related(&self, _key: &str, _relation: Relation) -> RetrievalResult<Vec<StructuredRow>> {
        self.wait().await?;
        Ok(Vec::new())
    }
}

/// 검색 지연을 주입하는 벡터 저장소
struct SlowVector {
    inner: InMemoryVectorStore,
    delay: Duration,
}

#[async_trait]
impl VectorStore for SlowVector {
    async fn create_collection(&self, spec: &CollectionSpec) -> RetrievalResult<()> {
        self.inner.create_collection(spec).await
    }

    async fn collection(&self, name: &str) -> RetrievalResult<Option<CollectionSpec>> {
        self.inner.collection(name).await
    }

    async fn list_collections(&self) -> RetrievalResult<Vec<CollectionSpec>> {
        self.inner.list_collections().await
    }

    async fn upsert(&self, collection: &str, records: &[VectorRecord]) -> RetrievalResult<usize> {
        self.inner.upsert(collection, records).await
    }

    async fn search(
        &self,
        collection: &str,
        query: &[f32],
        top_k: usize,
    ) -> RetrievalResult<Vec<CandidatePassage>> {
        tokio::time::sleep(self.delay).await;
        self.inner.search(collection, query, top_k).await
    }

    async fn delete_by_document(&self, collection: &str, document_id: &str) -> RetrievalResult<usize> {
        self.inner.delete_by_document(collection, document_id).await
    }

    async fn count(&self, collection: &str) -> RetrievalResult<usize> {
        self.inner.count(collection).await
    }
}

// ============================================================================
// Fixtures
// ============================================================================

const C122_PASSAGE: &str = "C122 Subsequent visit by the Most Responsible Physician on the day \
    following the hospital admission assessment. Documentation is required in the patient chart.";
const RECORDS_PASSAGE: &str = "Medical records must be retained for at least ten years from the \
    date of the last entry in the record.";

fn schedule_document() -> Document {
    Document {
        id: "ohip-sob".to_string(),
        title: "Schedule of Benefits".to_string(),
        source_org: "OHIP".to_string(),
        doc_type: DocumentType::Policy,
        effective_date: None,
        topics: Default::default(),
        source_url: Some("https://example.org/sob.pdf".to_string()),
        superseded: false,
    }
}

fn c122(documentation_required: bool) -> StructuredEntity {
    StructuredEntity {
        kind: EntityKind::FeeCode,
        natural_key: "C122".to_string(),
        description: "Subsequent visit - day following hospital admission assessment".to_string(),
        amounts: BTreeMap::from([("fee".to_string(), Some(61.15))]),
        flags: BTreeMap::from([("documentation_required".to_string(), documentation_required)]),
        notes: None,
        effective_date: None,
        source: SourceRef {
            document_id: "ohip-sob".to_string(),
            section_ref: Some("A.3".to_string()),
            page: Some(42),
        },
    }
}

fn section_row() -> StructuredRow {
    let chunk = Chunk {
        id: "sob-hospital".to_string(),
        document_id: "ohip-sob".to_string(),
        heading: Some("Hospital Visits".to_string()),
        text: "Hospital in-patient services are billed per day of admission.".to_string(),
        index: 3,
        level: ChunkLevel::Parent,
        parent_id: None,
        start: 0,
        end: 62,
        metadata: Metadata::new(),
    };
    StructuredRow {
        natural_key: chunk.id.clone(),
        description: "Hospital Visits".to_string(),
        source_document_id: chunk.document_id.clone(),
        section_ref: None,
        match_kind: MatchKind::ParentSection,
        body: RowBody::Section(chunk),
        document: Some(schedule_document()),
    }
}

fn record(chunk_id: &str, document_id: &str, text: &str, org: &str, keys: &[&str]) -> VectorRecord {
    let mut metadata = Metadata::new();
    metadata.insert(meta::TITLE.to_string(), json!(format!("{} guidance", org)));
    metadata.insert(meta::SOURCE_ORG.to_string(), json!(org));
    metadata.insert(meta::DOCUMENT_TYPE.to_string(), json!("policy"));
    metadata.insert(meta::PAGE.to_string(), json!(7));
    if !keys.is_empty() {
        metadata.insert(meta::ENTITY_KEYS.to_string(), json!(keys));
    }
    VectorRecord {
        chunk_id: chunk_id.to_string(),
        document_id: document_id.to_string(),
        text: text.to_string(),
        metadata,
        embedding: bag_of_words(text),
    }
}

struct Setup {
    entities: Vec<StructuredEntity>,
    sections: Vec<StructuredRow>,
    structured_delay: Duration,
    structured_fail: bool,
    vector_delay: Duration,
    embed_fail: Option<RetrievalError>,
    config: RetrievalConfig,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            entities: vec![c122(true)],
            sections: vec![section_row()],
            structured_delay: Duration::ZERO,
            structured_fail: false,
            vector_delay: Duration::ZERO,
            embed_fail: None,
            config: RetrievalConfig {
                structured_timeout_ms: 1_000,
                ..Default::default()
            },
        }
    }
}

fn default_records() -> Vec<VectorRecord> {
    vec![
        record("ohip-c122", "ohip-bulletin", C122_PASSAGE, "OHIP", &["C122"]),
        record("cpso-records", "cpso-records", RECORDS_PASSAGE, "CPSO", &[]),
    ]
}

async fn vector_store(records: &[VectorRecord], delay: Duration) -> SlowVector {
    let inner = InMemoryVectorStore::new();
    inner
        .create_collection(&CollectionSpec::cosine(COLLECTION, DIMENSION))
        .await
        .unwrap();
    inner.upsert(COLLECTION, records).await.unwrap();
    SlowVector { inner, delay }
}

async fn retriever(setup: Setup) -> HybridRetriever {
    let structured = Arc::new(FakeStructured {
        entities: setup.entities.clone(),
        sections: setup.sections.clone(),
        delay: setup.structured_delay,
        fail: setup.structured_fail,
    });
    let vector = vector_store(&default_records(), setup.vector_delay).await;
    build(structured, vector, setup)
}

fn build(structured: Arc<dyn StructuredStore>, vector: SlowVector, setup: Setup) -> HybridRetriever {
    HybridRetriever::builder()
        .structured_store(structured)
        .vector_store(Arc::new(vector))
        .embedder(Arc::new(BagOfWords { fail: setup.embed_fail }))
        .reranker(Arc::new(LlmReranker::new(Arc::new(KeywordScorer), &setup.config)))
        .config(setup.config)
        .build()
        .unwrap()
}

const QUERY: &str = "Can I bill C122 the day after hospital admission?";

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_paths_run_in_parallel() {
    let retriever = retriever(Setup {
        structured_delay: Duration::from_millis(300),
        vector_delay: Duration::from_millis(500),
        ..Default::default()
    })
    .await;

    let started = Instant::now();
    let envelope = retriever.retrieve(&RetrievalRequest::new(QUERY)).await.unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed < Duration::from_millis(750), "took {:?}", elapsed);
    assert_eq!(envelope.status, EnvelopeStatus::Complete);
    assert!(envelope.has_provenance(Provenance::Sql));
    assert!(envelope.has_provenance(Provenance::Vector));
}

#[tokio::test]
async fn test_billing_code_in_query_puts_record_first() {
    let retriever = retriever(Setup::default()).await;
    let envelope = retriever.retrieve(&RetrievalRequest::new(QUERY)).await.unwrap();

    let top3: Vec<&str> = envelope.sections.iter().take(3).map(|s| s.id.as_str()).collect();
    assert!(top3.contains(&"C122"), "top sections: {:?}", top3);
    assert_eq!(envelope.sections[0].id, "C122");

    assert!(envelope.confidence >= 0.6, "confidence {}", envelope.confidence);
    assert!(envelope.conflicts.is_empty());
    assert_eq!(
        envelope.query_interpretation.as_deref(),
        Some("billing codes: C122")
    );

    assert!(!envelope.highlights.is_empty());
    for highlight in &envelope.highlights {
        assert!(!highlight.citations.is_empty());
    }
    let citation = &envelope.highlights[0].citations[0];
    assert_eq!(citation.source, "Schedule of Benefits");
    assert_eq!(citation.source_org.as_deref(), Some("OHIP"));
    assert!(citation.location.contains("p. 42"));

    // 재순위: C122 구절이 벡터 섹션 중 첫 번째
    let first_vector = envelope
        .sections
        .iter()
        .find(|s| s.origin == Provenance::Vector)
        .unwrap();
    assert_eq!(first_vector.id, "ohip-c122");
    assert_eq!(first_vector.relevance, Some(9.0));
}

#[tokio::test]
async fn test_structured_timeout_degrades() {
    let baseline = retriever(Setup {
        entities: vec![],
        sections: vec![],
        ..Default::default()
    })
    .await
    .retrieve(&RetrievalRequest::new(QUERY))
    .await
    .unwrap();

    let degraded = retriever(Setup {
        structured_delay: Duration::from_secs(5),
        config: RetrievalConfig {
            structured_timeout_ms: 200,
            ..Default::default()
        },
        ..Default::default()
    })
    .await
    .retrieve(&RetrievalRequest::new(QUERY))
    .await
    .unwrap();

    assert_eq!(baseline.status, EnvelopeStatus::Complete);
    assert_eq!(degraded.status, EnvelopeStatus::Degraded);
    assert!(!degraded.has_provenance(Provenance::Sql));
    assert!(degraded.has_provenance(Provenance::Vector));
    assert_eq!(degraded.failed_paths, vec!["structured"]);
    assert!(degraded.error.as_deref().unwrap().contains("timed out"));
    assert_eq!(degraded.sections.len(), baseline.sections.len());
    assert!(degraded.confidence < baseline.confidence);
}

#[tokio::test]
async fn test_conflict_surfaced_with_penalty() {
    let agreeing = retriever(Setup::default())
        .await
        .retrieve(&RetrievalRequest::new(QUERY))
        .await
        .unwrap();

    let conflicting = retriever(Setup {
        entities: vec![c122(false)],
        ..Default::default()
    })
    .await
    .retrieve(&RetrievalRequest::new(QUERY))
    .await
    .unwrap();

    assert_eq!(conflicting.conflicts.len(), 1);
    let conflict = &conflicting.conflicts[0];
    assert_eq!(conflict.entity_key, "C122");
    assert_eq!(conflict.field, "documentation_required");
    assert_eq!(conflict.value_a.to_string(), "false");
    assert_eq!(conflict.value_b.to_string(), "true");
    assert_eq!(conflict.source_b, "ohip-c122");
    assert_eq!(conflict.resolution.preferred, FactOrigin::Structured);

    assert!(conflicting.confidence < agreeing.confidence);
}

#[tokio::test]
async fn test_both_paths_failed_returns_explicit_envelope() {
    let retriever = retriever(Setup {
        structured_fail: true,
        embed_fail: Some(RetrievalError::EmbeddingFailure {
            provider: "fake".to_string(),
            message: "503".to_string(),
        }),
        ..Default::default()
    })
    .await;

    let envelope = retriever.retrieve(&RetrievalRequest::new(QUERY)).await.unwrap();
    assert_eq!(envelope.status, EnvelopeStatus::Failed);
    assert!(envelope.sections.is_empty());
    assert!(envelope.highlights.is_empty());
    assert_eq!(envelope.confidence, 0.30);
    assert!(matches!(
        envelope.into_result(),
        Err(RetrievalError::AllPathsFailed { .. })
    ));
}

#[tokio::test]
async fn test_provider_auth_failure_propagates() {
    let retriever = retriever(Setup {
        embed_fail: Some(RetrievalError::Provider {
            provider: "gemini".to_string(),
            message: "401 Unauthorized".to_string(),
        }),
        ..Default::default()
    })
    .await;

    let err = retriever.retrieve(&RetrievalRequest::new(QUERY)).await.unwrap_err();
    assert!(matches!(err, RetrievalError::Provider { .. }));
}

#[tokio::test]
async fn test_metadata_filter_and_empty_result() {
    let retriever = retriever(Setup {
        entities: vec![],
        sections: vec![],
        ..Default::default()
    })
    .await;

    let mut request = RetrievalRequest::new("retention of records");
    request.metadata_filter.document_types = vec![DocumentType::Guideline];
    let envelope = retriever.retrieve(&request).await.unwrap();

    assert_eq!(envelope.status, EnvelopeStatus::Empty);
    assert!(envelope.sections.is_empty());
    assert!(envelope.provenance.is_empty());
    assert_eq!(envelope.confidence, 0.30);
    assert_eq!(envelope.query_interpretation.as_deref(), Some("free-text query"));
}

#[tokio::test]
async fn test_admission_scenario_vector_only() {
    let mut c122 = record("bulletin-c122", "ohip-bulletin-4567", C122_PASSAGE, "OHIP", &["C122"]);
    c122.metadata.insert(meta::TITLE.to_string(), json!("OHIP INFOBulletin 4567"));
    c122.metadata.insert(meta::URL.to_string(), json!("https://example.org/bulletin-4567"));
    let records = vec![
        record(
            "sob-a007",
            "ohip-sob",
            "A007 Intermediate assessment of a patient in the office, billed once per visit.",
            "OHIP",
            &["A007"],
        ),
        c122,
        record(
            "sob-e080",
            "ohip-sob",
            "E080 Premium for a hospital admission assessment performed after hours.",
            "OHIP",
            &["E080"],
        ),
        record("cpso-records", "cpso-records", RECORDS_PASSAGE, "CPSO", &[]),
    ];

    let retriever = build(
        Arc::new(FakeStructured {
            entities: vec![],
            sections: vec![],
            delay: Duration::ZERO,
            fail: false,
        }),
        vector_store(&records, Duration::ZERO).await,
        Setup::default(),
    );
    let envelope = retriever
        .retrieve(&RetrievalRequest::new("day following hospital admission"))
        .await
        .unwrap();

    assert_eq!(envelope.status, EnvelopeStatus::Complete);
    assert!(!envelope.has_provenance(Provenance::Sql));
    assert!(envelope.has_provenance(Provenance::Vector));

    let top3: Vec<&str> = envelope.sections.iter().take(3).map(|s| s.id.as_str()).collect();
    assert!(top3.contains(&"bulletin-c122"), "top sections: {:?}", top3);
    assert!(envelope.confidence >= 0.6, "confidence {}", envelope.confidence);

    let position = envelope
        .sections
        .iter()
        .position(|s| s.id == "bulletin-c122")
        .unwrap();
    assert_eq!(envelope.sections[position].document_id, "ohip-bulletin-4567");
    let citation = envelope
        .highlights
        .iter()
        .flat_map(|h| &h.citations)
        .find(|c| c.source == "OHIP INFOBulletin 4567")
        .expect("citation for the C122 bulletin");
    assert_eq!(citation.source_org.as_deref(), Some("OHIP"));
    assert_eq!(citation.url.as_deref(), Some("https://example.org/bulletin-4567"));
    assert!(envelope.documents.iter().any(|d| d.id == "ohip-bulletin-4567"));
}

#[tokio::test]
async fn test_structured_filters_apply_to_hinted_keys() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("structured.db");
    let store = KnowledgeStore::open(&db).unwrap();
    store.upsert_document(&schedule_document()).unwrap();
    store.upsert_entities(&[c122(true)]).unwrap();

    let structured = Arc::new(SqliteStructuredStore::new(&db, 2, Duration::from_secs(1)));
    let retriever = build(
        structured,
        vector_store(&default_records(), Duration::ZERO).await,
        Setup::default(),
    );

    let unfiltered = retriever.retrieve(&RetrievalRequest::new(QUERY)).await.unwrap();
    assert!(unfiltered.has_provenance(Provenance::Sql));
    assert_eq!(unfiltered.sections[0].id, "C122");

    let mut request = RetrievalRequest::new(QUERY);
    request.structured_filters.source_orgs = vec!["CPSO".to_string()];
    let filtered = retriever.retrieve(&request).await.unwrap();
    assert!(!filtered.has_provenance(Provenance::Sql));
    assert!(filtered
        .sections
        .iter()
        .all(|s| s.origin == Provenance::Vector));

    let mut request = RetrievalRequest::new(QUERY);
    request.structured_filters.doc_types = vec![DocumentType::Guideline];
    let filtered = retriever.retrieve(&request).await.unwrap();
    assert!(!filtered.has_provenance(Provenance::Sql));
}
