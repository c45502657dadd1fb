//! 하이브리드 검색 오케스트레이터
//!
//! 쿼리 하나에 대한 단일 패스 상태 머신:
//!
//! 1. Dispatch - structured / vector 경로를 동시에 시작 (`tokio::join!`)
//! 2. Vector 후처리 - Rerank → Metadata Filter
//! 3. Merge - (문서 ID, 섹션 ID) 기준 중복 제거. structured 결과가 앞
//! 4. Score & resolve - 신뢰도 계산, 충돌 감지
//! 5. Assemble - 섹션, 문서, 하이라이트(인용 포함), 충돌, 출처 태그
//!
//! 종료 상태: 성공 / 한 경로 실패(degraded, 신뢰도 감점) / 두 경로 모두 실패(빈 봉투 + 에러).
//! 시스템 단위 에러(차원 불일치, 인증 실패, 설정 오류)는 봉투로 감추지 않고 그대로 반환합니다.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{NaiveDate, Utc};
use tracing::Instrument;
use uuid::Uuid;

use crate::config::{EngineConfig, RetrievalConfig};
use crate::embedding::{create_embedder, EmbeddingProvider};
use crate::error::{RetrievalError, RetrievalPath, RetrievalResult};
use crate::knowledge::{
    meta, search_collections, sort_by_distance, CandidatePassage, DocumentType, KnowledgeStore,
    LanceVectorStore, RowBody, SqliteStructuredStore, StructuredFilters, StructuredQuery,
    StructuredRow, StructuredStore, VectorStore,
};
use crate::scoring::GeminiScorer;

use super::confidence::{ConfidenceConfig, ConfidenceInputs, ConfidenceScorer};
use super::conflict::{ConflictResolver, ResolutionPolicy};
use super::envelope::{
    Citation, DocumentRef, EnvelopeStatus, Highlight, Provenance, ResultEnvelope, Section,
};
use super::filter::MetadataFilter;
use super::query::{interpret_query, QueryInterpretation};
use super::rerank::{LlmReranker, Reranker};

// ============================================================================
// Types
// ============================================================================

/// 검색 요청
#[derive(Debug, Clone, Default)]
pub struct RetrievalRequest {
    pub query: String,
    /// structured 저장소 필터
    pub structured_filters: StructuredFilters,
    /// 벡터 후보 사후 필터
    pub metadata_filter: MetadataFilter,
    /// 검색할 벡터 컬렉션 (비어 있으면 검색기 기본값)
    pub collections: Vec<String>,
    /// 재순위 후 유지 개수 (없으면 설정값)
    pub keep_top_k: Option<usize>,
}

impl RetrievalRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }
}

/// 경로별 결과 (태그로 구분)
#[derive(Debug)]
pub enum PathResult {
    Structured(Vec<StructuredRow>),
    Vector(Vec<CandidatePassage>),
    Failed {
        path: RetrievalPath,
        error: RetrievalError,
    },
}

// ============================================================================
// HybridRetriever
// ============================================================================

/// 하이브리드 검색기
///
/// 모든 서비스 핸들은 생성 시 주입되며 동시 쿼리 간에 읽기 전용으로 공유됩니다.
pub struct HybridRetriever {
    structured: Arc<dyn StructuredStore>,
    vector: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    reranker: Arc<dyn Reranker>,
    collections: Vec<String>,
    config: RetrievalConfig,
    confidence: ConfidenceScorer,
    resolver: ConflictResolver,
}

impl HybridRetriever {
    pub fn builder() -> HybridRetrieverBuilder {
        HybridRetrieverBuilder::default()
    }

    /// 설정에 따라 SQLite / LanceDB / Gemini 핸들을 구성
    ///
    /// structured DB가 없으면 빈 스키마로 생성합니다.
    pub async fn open(config: &EngineConfig) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.data_dir).context("Failed to create data directory")?;

        // 스키마 보장 후 쓰기 연결은 닫음
        let db_path = config.structured_db_path();
        KnowledgeStore::open(&db_path).context("Failed to open structured store")?;

        let structured = SqliteStructuredStore::new(
            db_path,
            config.retrieval.structured_workers,
            Duration::from_millis(config.retrieval.structured_timeout_ms),
        );
        let vector = LanceVectorStore::open(&config.vector_path())
            .await
            .context("Failed to open vector store")?;
        let embedder = create_embedder(&config.embedding)?;
        let scorer = GeminiScorer::from_env(
            config.retrieval.scoring_model.clone(),
            Duration::from_millis(config.retrieval.scoring_timeout_ms),
        )
        .context("Failed to create scorer")?;

        let retriever = Self::builder()
            .structured_store(Arc::new(structured))
            .vector_store(Arc::new(vector))
            .embedder(Arc::new(embedder))
            .reranker(Arc::new(LlmReranker::new(Arc::new(scorer), &config.retrieval)))
            .config(config.retrieval.clone())
            .confidence(config.confidence.clone())
            .conflict_policy(config.conflict_policy)
            .build()?;

        Ok(retriever)
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// 하이브리드 검색 실행
    pub async fn retrieve(&self, request: &RetrievalRequest) -> RetrievalResult<ResultEnvelope> {
        let span = tracing::info_span!("retrieve", request_id = %Uuid::new_v4());
        self.retrieve_inner(request).instrument(span).await
    }

    async fn retrieve_inner(&self, request: &RetrievalRequest) -> RetrievalResult<ResultEnvelope> {
        let started = Instant::now();
        let interpretation = interpret_query(&request.query);
        tracing::info!(query = %request.query, hints = %interpretation, "Hybrid retrieval started");

        // 1. Dispatch (fan-out / fan-in)
        let (structured, vector) = tokio::join!(
            self.structured_path(request, &interpretation),
            self.vector_path(request),
        );
        tracing::debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Both retrieval paths returned"
        );

        let mut rows = None;
        let mut candidates = None;
        let mut failures: Vec<(RetrievalPath, RetrievalError)> = Vec::new();

        for outcome in [structured, vector] {
            match outcome {
                PathResult::Structured(r) => rows = Some(r),
                PathResult::Vector(c) => candidates = Some(c),
                PathResult::Failed { path, error } => {
                    if error.is_systemic() {
                        tracing::error!(path = %path, error = %error, "Systemic retrieval failure");
                        return Err(error);
                    }
                    tracing::warn!(path = %path, error = %error, "Retrieval path failed");
                    failures.push((path, error));
                }
            }
        }

        // 두 경로 모두 실패
        if rows.is_none() && candidates.is_none() {
            let message = |p: RetrievalPath| {
                failures
                    .iter()
                    .find(|(path, _)| *path == p)
                    .map(|(_, e)| e.to_string())
                    .unwrap_or_default()
            };
            let mut envelope = ResultEnvelope::failed(
                self.confidence.floor(),
                message(RetrievalPath::Structured),
                message(RetrievalPath::Vector),
            );
            envelope.query_interpretation = Some(interpretation.to_string());
            tracing::error!("All retrieval paths failed");
            return Ok(envelope);
        }

        let envelope = self.assemble(
            &interpretation,
            rows.unwrap_or_default(),
            candidates.unwrap_or_default(),
            &failures,
        );

        tracing::info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            sections = envelope.sections.len(),
            conflicts = envelope.conflicts.len(),
            confidence = envelope.confidence,
            status = ?envelope.status,
            "Hybrid retrieval finished"
        );
        Ok(envelope)
    }

    // ========================================================================
    // Paths
    // ========================================================================

    /// structured 경로: 키워드 검색 + 자연키 힌트를 한 번의 필터 검색으로 시간 예산 안에서 실행
    async fn structured_path(
        &self,
        request: &RetrievalRequest,
        interpretation: &QueryInterpretation,
    ) -> PathResult {
        let budget = Duration::from_millis(self.config.structured_timeout_ms);
        let query = StructuredQuery {
            text: request.query.clone(),
            filters: request.structured_filters.clone(),
            limit: self.config.structured_limit,
            key_hints: interpretation.key_hints(),
        };
        let work = self.structured.search(&query);

        match tokio::time::timeout(budget, work).await {
            Ok(Ok(rows)) => PathResult::Structured(order_rows(rows, &request.structured_filters)),
            Ok(Err(error)) => PathResult::Failed {
                path: RetrievalPath::Structured,
                error,
            },
            Err(_) => PathResult::Failed {
                path: RetrievalPath::Structured,
                error: RetrievalError::StoreTimeout {
                    path: RetrievalPath::Structured,
                    budget_ms: self.config.structured_timeout_ms,
                },
            },
        }
    }

    /// vector 경로: 임베딩 → 다중 컬렉션 검색 → 재순위 → 필터
    async fn vector_path(&self, request: &RetrievalRequest) -> PathResult {
        let failed = |error: RetrievalError| PathResult::Failed {
            path: RetrievalPath::Vector,
            error,
        };

        let collections = match self.resolve_collections(request).await {
            Ok(c) => c,
            Err(e) => return failed(e),
        };
        if collections.is_empty() {
            tracing::warn!("No vector collections to search");
            return PathResult::Vector(Vec::new());
        }

        let query_vector = match self.embedder.embed_query(&request.query).await {
            Ok(v) => v,
            Err(e) => return failed(e),
        };

        let candidates = match search_collections(
            self.vector.as_ref(),
            &collections,
            &query_vector,
            self.config.recall_top_k,
        )
        .await
        {
            Ok(c) => c,
            Err(e) => return failed(e),
        };
        tracing::debug!(recalled = candidates.len(), "Vector recall complete");

        let keep = request.keep_top_k.unwrap_or(self.config.keep_top_k);
        let reranked = match self
            .reranker
            .rerank(&request.query, candidates.clone(), keep)
            .await
        {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "Reranking failed, using distance order");
                let mut fallback = candidates;
                sort_by_distance(&mut fallback);
                fallback.truncate(keep);
                fallback
            }
        };

        PathResult::Vector(request.metadata_filter.apply(reranked))
    }

    async fn resolve_collections(&self, request: &RetrievalRequest) -> RetrievalResult<Vec<String>> {
        if !request.collections.is_empty() {
            return Ok(request.collections.clone());
        }
        if !self.collections.is_empty() {
            return Ok(self.collections.clone());
        }
        let specs = self.vector.list_collections().await?;
        Ok(specs.into_iter().map(|s| s.name).collect())
    }

    // ========================================================================
    // Assemble
    // ========================================================================

    fn assemble(
        &self,
        interpretation: &QueryInterpretation,
        rows: Vec<StructuredRow>,
        candidates: Vec<CandidatePassage>,
        failures: &[(RetrievalPath, RetrievalError)],
    ) -> ResultEnvelope {
        // 3. Merge
        let mut seen: HashSet<(String, String)> = HashSet::new();
        let mut sections = Vec::new();
        let mut documents: Vec<DocumentRef> = Vec::new();

        for row in &rows {
            if seen.insert((row.source_document_id.clone(), row.natural_key.clone())) {
                sections.push(section_from_row(row));
                push_document(&mut documents, document_from_row(row));
            }
        }
        for candidate in &candidates {
            if seen.insert((candidate.document_id.clone(), candidate.chunk_id.clone())) {
                sections.push(section_from_candidate(candidate));
                push_document(&mut documents, document_from_candidate(candidate));
            }
        }

        // 4. Score & resolve
        let conflicts = self.resolver.detect(&rows, &candidates);
        let degraded = !failures.is_empty();

        let confidence = if sections.is_empty() {
            self.confidence.floor()
        } else {
            let sources: Vec<String> = documents.iter().filter_map(|d| d.source_org.clone()).collect();
            let doc_types: Vec<DocumentType> = documents
                .iter()
                .filter_map(|d| d.doc_type.as_deref().and_then(|t| t.parse().ok()))
                .collect();
            let today = Utc::now().date_naive();
            let recency_days = documents
                .iter()
                .filter_map(|d| d.effective_date)
                .max()
                .map(|newest: NaiveDate| (today - newest).num_days().max(0));

            self.confidence.score(&ConfidenceInputs {
                sql_hits: rows.len(),
                vector_matches: candidates.len(),
                sources: &sources,
                doc_types: &doc_types,
                has_conflict: !conflicts.is_empty(),
                recency_days,
                degraded,
            })
        };

        // 5. Assemble
        let highlights = sections
            .iter()
            .take(self.config.highlight_count)
            .filter_map(|section| highlight_for(section, &documents))
            .collect();

        let mut provenance = Vec::new();
        if !rows.is_empty() {
            provenance.push(Provenance::Sql);
        }
        if !candidates.is_empty() {
            provenance.push(Provenance::Vector);
        }

        let status = if degraded {
            EnvelopeStatus::Degraded
        } else if sections.is_empty() {
            EnvelopeStatus::Empty
        } else {
            EnvelopeStatus::Complete
        };

        ResultEnvelope {
            sections,
            documents,
            confidence,
            highlights,
            conflicts,
            provenance,
            query_interpretation: Some(interpretation.to_string()),
            status,
            failed_paths: failures.iter().map(|(p, _)| p.to_string()).collect(),
            error: (!failures.is_empty()).then(|| {
                failures
                    .iter()
                    .map(|(p, e)| format!("{}: {}", p, e))
                    .collect::<Vec<_>>()
                    .join("; ")
            }),
        }
    }
}

// ============================================================================
// Builder
// ============================================================================

/// [`HybridRetriever`] 빌더
#[derive(Default)]
pub struct HybridRetrieverBuilder {
    structured: Option<Arc<dyn StructuredStore>>,
    vector: Option<Arc<dyn VectorStore>>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    reranker: Option<Arc<dyn Reranker>>,
    collections: Vec<String>,
    config: Option<RetrievalConfig>,
    confidence: Option<ConfidenceConfig>,
    policy: Option<ResolutionPolicy>,
}

impl HybridRetrieverBuilder {
    pub fn structured_store(mut self, store: Arc<dyn StructuredStore>) -> Self {
        self.structured = Some(store);
        self
    }

    pub fn vector_store(mut self, store: Arc<dyn VectorStore>) -> Self {
        self.vector = Some(store);
        self
    }

    pub fn embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    /// 기본 검색 컬렉션 (없으면 등록된 전체)
    pub fn collections(mut self, collections: Vec<String>) -> Self {
        self.collections = collections;
        self
    }

    pub fn config(mut self, config: RetrievalConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn confidence(mut self, config: ConfidenceConfig) -> Self {
        self.confidence = Some(config);
        self
    }

    pub fn conflict_policy(mut self, policy: ResolutionPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// 필수 핸들이 빠지면 Config 에러
    pub fn build(self) -> RetrievalResult<HybridRetriever> {
        let missing = |name: &str| RetrievalError::Config(format!("{} is required", name));

        let config = self.config.unwrap_or_default();
        if config.keep_top_k == 0 || config.recall_top_k == 0 {
            return Err(RetrievalError::Config(
                "recall_top_k and keep_top_k must be greater than zero".to_string(),
            ));
        }

        Ok(HybridRetriever {
            structured: self.structured.ok_or_else(|| missing("structured_store"))?,
            vector: self.vector.ok_or_else(|| missing("vector_store"))?,
            embedder: self.embedder.ok_or_else(|| missing("embedder"))?,
            reranker: self.reranker.ok_or_else(|| missing("reranker"))?,
            collections: self.collections,
            config,
            confidence: ConfidenceScorer::new(self.confidence.unwrap_or_default()),
            resolver: ConflictResolver::new(self.policy.unwrap_or_default()),
        })
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// structured 행 정렬: 매칭 종류 우선 (같은 종류 안에서는 어댑터 순서 유지)
///
/// 어댑터가 필터를 적용하지만 대체된 문서 제외는 여기서 한 번 더 확인합니다.
fn order_rows(rows: Vec<StructuredRow>, filters: &StructuredFilters) -> Vec<StructuredRow> {
    let mut seen = HashSet::new();
    let mut rows: Vec<StructuredRow> = rows
        .into_iter()
        .filter(|r| {
            filters.include_superseded || !r.document.as_ref().is_some_and(|d| d.superseded)
        })
        .filter(|r| seen.insert((r.source_document_id.clone(), r.natural_key.clone())))
        .collect();
    rows.sort_by_key(|r| r.match_kind);
    rows
}

fn section_from_row(row: &StructuredRow) -> Section {
    let (heading, page, metadata) = match &row.body {
        RowBody::Section(chunk) => (
            chunk.heading.clone(),
            chunk
                .metadata
                .get(meta::PAGE)
                .and_then(|v| v.as_u64())
                .map(|p| p as u32),
            chunk.metadata.clone(),
        ),
        RowBody::Entity(entity) => (
            Some(format!("{} {}", entity.kind, entity.natural_key)),
            entity.source.page,
            Default::default(),
        ),
    };

    Section {
        id: row.natural_key.clone(),
        document_id: row.source_document_id.clone(),
        heading,
        text: row.text(),
        origin: Provenance::Sql,
        match_kind: Some(row.match_kind),
        relevance: None,
        score_source: None,
        distance: None,
        page,
        metadata,
    }
}

fn section_from_candidate(candidate: &CandidatePassage) -> Section {
    Section {
        id: candidate.chunk_id.clone(),
        document_id: candidate.document_id.clone(),
        heading: candidate.meta_str(meta::SECTION).map(str::to_string),
        text: candidate.text.clone(),
        origin: Provenance::Vector,
        match_kind: None,
        relevance: candidate.relevance,
        score_source: candidate.score_source,
        distance: Some(candidate.distance),
        page: candidate
            .metadata
            .get(meta::PAGE)
            .and_then(|v| v.as_u64())
            .map(|p| p as u32),
        metadata: candidate.metadata.clone(),
    }
}

fn document_from_row(row: &StructuredRow) -> DocumentRef {
    match &row.document {
        Some(doc) => DocumentRef {
            id: doc.id.clone(),
            title: Some(doc.title.clone()),
            source_org: Some(doc.source_org.clone()),
            doc_type: Some(doc.doc_type.as_str().to_string()),
            effective_date: doc.effective_date,
            url: doc.source_url.clone(),
        },
        None => DocumentRef {
            id: row.source_document_id.clone(),
            title: None,
            source_org: None,
            doc_type: None,
            effective_date: None,
            url: None,
        },
    }
}

fn document_from_candidate(candidate: &CandidatePassage) -> DocumentRef {
    let text = |key: &str| candidate.meta_str(key).map(str::to_string);
    DocumentRef {
        id: candidate.document_id.clone(),
        title: text(meta::TITLE),
        source_org: text(meta::SOURCE_ORG),
        doc_type: text(meta::DOCUMENT_TYPE),
        effective_date: candidate.meta_str(meta::EFFECTIVE_DATE).and_then(|s| {
            NaiveDate::parse_from_str(&s.chars().take(10).collect::<String>(), "%Y-%m-%d").ok()
        }),
        url: text(meta::URL),
    }
}

/// 같은 문서가 이미 있으면 비어 있는 필드만 채움
fn push_document(documents: &mut Vec<DocumentRef>, doc: DocumentRef) {
    match documents.iter_mut().find(|d| d.id == doc.id) {
        Some(existing) => {
            existing.title = existing.title.take().or(doc.title);
            existing.source_org = existing.source_org.take().or(doc.source_org);
            existing.doc_type = existing.doc_type.take().or(doc.doc_type);
            existing.effective_date = existing.effective_date.or(doc.effective_date);
            existing.url = existing.url.take().or(doc.url);
        }
        None => documents.push(doc),
    }
}

/// 섹션 → 하이라이트 (요점 = 첫 문장, 인용 = 출처 문서 + 위치)
fn highlight_for(section: &Section, documents: &[DocumentRef]) -> Option<Highlight> {
    let point = first_sentence(&section.text, 240);
    if point.is_empty() {
        return None;
    }

    let doc = documents.iter().find(|d| d.id == section.document_id);
    let location = match (section.page, &section.heading) {
        (Some(page), Some(heading)) => format!("{}, p. {}", heading, page),
        (Some(page), None) => format!("p. {}", page),
        (None, Some(heading)) => heading.clone(),
        (None, None) => format!("section {}", section.id),
    };

    Some(Highlight {
        point,
        citations: vec![Citation {
            source: doc
                .and_then(|d| d.title.clone())
                .unwrap_or_else(|| section.document_id.clone()),
            source_org: doc.and_then(|d| d.source_org.clone()),
            location,
            url: doc.and_then(|d| d.url.clone()),
        }],
    })
}

/// 첫 문장 (없으면 앞부분 max_chars)
fn first_sentence(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    let end = trimmed
        .char_indices()
        .find(|(i, c)| {
            matches!(c, '.' | '?' | '!')
                && trimmed[i + c.len_utf8()..]
                    .chars()
                    .next()
                    .map_or(true, char::is_whitespace)
        })
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(trimmed.len());

    trimmed[..end].chars().take(max_chars).collect::<String>().trim().to_string()
}

// ============================================================================
// Tests
// ============================================================================
