//! 수집 파이프라인 - 문서/엔티티를 두 저장소에 적재
//!
//! 문서 한 건의 흐름:
//!
//! 1. 컬렉션 선언 확인 (없으면 임베딩 차원으로 생성, 있으면 차원 검증)
//! 2. 하위 청크 임베딩 (배치, 실패 항목은 건너뜀)
//! 3. SQLite에 문서 + 섹션(상위/하위 청크) 저장
//! 4. 벡터 저장소의 기존 엔트리를 지우고 새로 upsert
//! 5. `supersedes`가 있으면 이전 문서에 대체 표시하고 그 벡터를 제거
//!
//! 임베딩이 에러로 끝나면 아무것도 쓰지 않으므로 이전 수집 결과가 그대로 남습니다.
//! 같은 입력을 다시 수집하면 같은 청크 ID가 나오므로 결과가 바뀌지 않습니다.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use sha2::{Digest, Sha256};
use url::Url;

use crate::collector::{CollectedFile, CollectionStats, CollectorConfig, FileCollector};
use crate::config::EngineConfig;
use crate::embedding::{create_embedder, embed_all, validate_dimension, EmbedTask, EmbeddingProvider};
pub use crate::extractor::PageText;
use crate::extractor::extract_pages;
use crate::knowledge::{
    hierarchical_chunker, meta, Chunk, ChunkLevel, Chunker, CollectionSpec, Document,
    DocumentType, KnowledgeStore, LanceVectorStore, Metadata, StructuredEntity, VectorRecord,
    VectorStore,
};

// ============================================================================
// Types
// ============================================================================

/// 수집할 문서
#[derive(Debug, Clone)]
pub struct IngestDocument {
    pub document: Document,
    pub pages: Vec<PageText>,
    /// 벡터 컬렉션 이름
    pub collection: String,
    /// 이 문서가 대체하는 이전 문서 ID
    pub supersedes: Option<String>,
    /// 모든 청크에 붙일 추가 메타데이터 (policy_level, entity_keys 등)
    pub extra_metadata: Metadata,
}

impl IngestDocument {
    /// 페이지 구분 없는 본문으로 생성
    pub fn from_text(document: Document, text: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            document,
            pages: vec![PageText::unpaged(text)],
            collection: collection.into(),
            supersedes: None,
            extra_metadata: Metadata::new(),
        }
    }
}

/// 문서 한 건의 수집 결과
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestReport {
    pub document_id: String,
    /// 저장된 섹션 수 (상위 + 하위)
    pub sections: usize,
    /// 저장된 벡터 수
    pub embedded: usize,
    /// 임베딩 실패로 건너뛴 청크 수
    pub skipped: usize,
    pub superseded: Option<String>,
}

/// 파일 수집 시 붙일 태그
#[derive(Debug, Clone)]
pub struct FileTags {
    pub source_org: String,
    pub doc_type: DocumentType,
    pub collection: String,
    pub effective_date: Option<NaiveDate>,
    pub source_url: Option<String>,
    pub supersedes: Option<String>,
    pub policy_level: Option<String>,
}

/// 하이브리드 저장소 통계
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HybridStats {
    pub documents: usize,
    pub sections: usize,
    pub entities: usize,
    /// 컬렉션별 벡터 수
    pub vectors: BTreeMap<String, usize>,
}

impl HybridStats {
    pub fn total_vectors(&self) -> usize {
        self.vectors.values().sum()
    }
}

// ============================================================================
// Ingestor
// ============================================================================

/// 수집기 (SQLite + 벡터 저장소 + 임베딩)
pub struct Ingestor {
    store: KnowledgeStore,
    vector: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    chunker: Box<dyn Chunker>,
    batch_size: usize,
}

impl Ingestor {
    pub fn new(
        store: KnowledgeStore,
        vector: Arc<dyn VectorStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        chunker: Box<dyn Chunker>,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            vector,
            embedder,
            chunker,
            batch_size: batch_size.max(1),
        }
    }

    /// 설정에 따라 SQLite / LanceDB / Gemini로 구성
    pub async fn open(config: &EngineConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir).context("Failed to create data directory")?;

        let store = KnowledgeStore::open(&config.structured_db_path())
            .context("Failed to open structured store")?;
        let vector = LanceVectorStore::open(&config.vector_path())
            .await
            .context("Failed to open vector store")?;
        let embedder = create_embedder(&config.embedding)?;

        Ok(Self::new(
            store,
            Arc::new(vector),
            Arc::new(embedder),
            hierarchical_chunker(config.chunking.clone()),
            config.embedding.batch_size,
        ))
    }

    pub fn store(&self) -> &KnowledgeStore {
        &self.store
    }

    /// 문서 수집
    pub async fn ingest_document(&self, input: IngestDocument) -> Result<IngestReport> {
        let doc = &input.document;
        if doc.id.trim().is_empty() {
            anyhow::bail!("Document id must not be empty");
        }
        if let Some(url) = &doc.source_url {
            Url::parse(url).with_context(|| format!("Invalid source url for {}: {}", doc.id, url))?;
        }
        if input.supersedes.as_deref() == Some(doc.id.as_str()) {
            anyhow::bail!("Document {} cannot supersede itself", doc.id);
        }

        // 1. 컬렉션 선언
        let spec = self.ensure_collection(&input.collection).await?;

        // 2. 청킹 + 임베딩 (하위 청크만, 어떤 저장보다 먼저)
        let chunks = self.chunk_pages(&input);
        let targets: Vec<&Chunk> = chunks.iter().filter(|c| c.level == ChunkLevel::Child).collect();
        let texts: Vec<String> = targets.iter().map(|c| c.text.clone()).collect();
        let embeddings = if texts.is_empty() {
            Vec::new()
        } else {
            embed_all(self.embedder.as_ref(), &texts, self.batch_size, EmbedTask::Document)
                .await
                .with_context(|| format!("Failed to embed {}", doc.id))?
        };

        let mut records = Vec::with_capacity(targets.len());
        let mut skipped = 0;
        for (chunk, embedding) in targets.iter().zip(embeddings) {
            match embedding.into_vector() {
                Some(vector) => {
                    spec.check_dimension(vector.len())?;
                    records.push(vector_record(chunk, vector));
                }
                None => skipped += 1,
            }
        }
        if skipped > 0 {
            tracing::warn!(document = %doc.id, skipped, "Some chunks were not embedded");
        }

        // 3. 문서 + 섹션
        self.store.upsert_document(doc)?;
        let sections = self
            .store
            .replace_sections(&doc.id, &chunks)
            .with_context(|| format!("Failed to store sections for {}", doc.id))?;

        // 4. 벡터 교체
        self.vector.delete_by_document(&spec.name, &doc.id).await?;
        let embedded = if records.is_empty() {
            0
        } else {
            self.vector.upsert(&spec.name, &records).await?
        };

        // 5. 대체 표시 + 이전 문서 벡터 제거 (대체된 구절은 벡터 경로에 나오지 않음)
        let superseded = match &input.supersedes {
            Some(old) => {
                if !self.store.mark_superseded(old)? {
                    tracing::warn!(document = %doc.id, supersedes = %old, "Superseded document not found");
                }
                let removed = self.delete_vectors(old).await?;
                tracing::info!(document = %old, removed, "Removed vectors of superseded document");
                Some(old.clone())
            }
            None => None,
        };

        tracing::info!(
            document = %doc.id,
            collection = %spec.name,
            sections,
            embedded,
            "Ingested document"
        );

        Ok(IngestReport {
            document_id: doc.id.clone(),
            sections,
            embedded,
            skipped,
            superseded,
        })
    }

    /// 파일/폴더 수집
    pub async fn ingest_path(&self, path: &Path, tags: &FileTags) -> Result<Vec<IngestReport>> {
        let collector = FileCollector::new(CollectorConfig::default());
        let files = if path.is_dir() {
            collector.collect_directory(path)?
        } else {
            collector.collect_file(path)?.into_iter().collect()
        };

        let stats = CollectionStats::from_files(&files);
        tracing::info!(
            files = stats.total_files,
            text = stats.text_files,
            pdf = stats.pdf_files,
            sidecars = stats.with_sidecar,
            "Collected files"
        );

        let mut reports = Vec::with_capacity(files.len());

        for file in files {
            let pages = match extract_pages(&file).await {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!("Skipping {:?}: {:#}", file.path, e);
                    continue;
                }
            };

            let input = file_document(&file, pages, tags);
            if input.pages.iter().all(|p| p.text.trim().is_empty()) {
                tracing::warn!("No text extracted from {:?}", file.path);
                continue;
            }
            reports.push(self.ingest_document(input).await?);
        }

        Ok(reports)
    }

    /// JSON-lines 엔티티 파일 적재
    pub fn ingest_entities(&self, path: &Path) -> Result<usize> {
        let entities = load_entities_jsonl(path)?;
        self.store.upsert_entities(&entities)
    }

    /// 문서 삭제 (SQLite + 모든 컬렉션의 벡터)
    pub async fn delete_document(&self, document_id: &str) -> Result<bool> {
        self.delete_vectors(document_id).await?;
        self.store.delete_document(document_id)
    }

    /// 모든 컬렉션에서 문서의 벡터 제거
    async fn delete_vectors(&self, document_id: &str) -> Result<usize> {
        let mut removed = 0;
        for spec in self.vector.list_collections().await? {
            removed += self.vector.delete_by_document(&spec.name, document_id).await?;
        }
        Ok(removed)
    }

    /// 통계
    pub async fn stats(&self) -> Result<HybridStats> {
        let store_stats = self.store.stats()?;
        let mut vectors = BTreeMap::new();
        for spec in self.vector.list_collections().await? {
            let count = self.vector.count(&spec.name).await?;
            vectors.insert(spec.name, count);
        }

        Ok(HybridStats {
            documents: store_stats.document_count,
            sections: store_stats.section_count,
            entities: store_stats.entity_count,
            vectors,
        })
    }

    async fn ensure_collection(&self, name: &str) -> Result<CollectionSpec> {
        if name.trim().is_empty() {
            anyhow::bail!("Collection name must not be empty");
        }
        match self.vector.collection(name).await? {
            Some(spec) => {
                validate_dimension(self.embedder.as_ref(), &spec)?;
                Ok(spec)
            }
            None => {
                let spec = CollectionSpec::cosine(name, self.embedder.dimension());
                self.vector.create_collection(&spec).await?;
                tracing::info!(collection = %name, dimension = spec.dimension, "Created collection");
                Ok(spec)
            }
        }
    }

    /// 페이지를 이어 붙여 한 번에 청킹하고, 청크 시작 위치로 페이지 번호를 붙임
    fn chunk_pages(&self, input: &IngestDocument) -> Vec<Chunk> {
        let mut text = String::new();
        let mut page_starts: Vec<(usize, Option<u32>)> = Vec::new();
        for page in &input.pages {
            if page.text.trim().is_empty() {
                continue;
            }
            if !text.is_empty() {
                text.push_str("\n\n");
            }
            page_starts.push((text.len(), page.page));
            text.push_str(page.text.trim());
        }

        let metadata = document_metadata(&input.document, &input.extra_metadata);
        let mut chunks = self.chunker.chunk(&input.document.id, &text, &metadata);

        for chunk in &mut chunks {
            let page = page_starts
                .iter()
                .take_while(|(start, _)| *start <= chunk.start)
                .last()
                .and_then(|(_, page)| *page);
            if let Some(page) = page {
                chunk.metadata.insert(meta::PAGE.to_string(), page.into());
            }
            if let Some(heading) = &chunk.heading {
                chunk.metadata.insert(meta::SECTION.to_string(), heading.clone().into());
            }
        }
        chunks
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// 문서 속성 → 청크 메타데이터
fn document_metadata(doc: &Document, extra: &Metadata) -> Metadata {
    let mut metadata = extra.clone();
    metadata.insert(meta::TITLE.to_string(), doc.title.clone().into());
    metadata.insert(meta::SOURCE_ORG.to_string(), doc.source_org.clone().into());
    metadata.insert(meta::DOCUMENT_TYPE.to_string(), doc.doc_type.as_str().into());
    if let Some(date) = doc.effective_date {
        metadata.insert(meta::EFFECTIVE_DATE.to_string(), date.to_string().into());
    }
    if let Some(url) = &doc.source_url {
        metadata.insert(meta::URL.to_string(), url.clone().into());
    }
    metadata
}

fn vector_record(chunk: &Chunk, embedding: Vec<f32>) -> VectorRecord {
    VectorRecord {
        chunk_id: chunk.id.clone(),
        document_id: chunk.document_id.clone(),
        text: chunk.text.clone(),
        metadata: chunk.metadata.clone(),
        embedding,
    }
}

/// 파일 경로 기반 안정 문서 ID
pub fn document_id_for_path(path: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.to_string_lossy().as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().take(8).map(|b| format!("{:02x}", b)).collect();
    format!("doc-{}", hex)
}

/// 추출 결과 → 수집 문서 (사이드카 속성이 명령행 태그보다 우선)
fn file_document(file: &CollectedFile, pages: Vec<PageText>, tags: &FileTags) -> IngestDocument {
    let sidecar = file.sidecar.clone().unwrap_or_default();

    let title = sidecar
        .title
        .or_else(|| {
            pages
                .iter()
                .flat_map(|p| p.text.lines())
                .find_map(|line| line.trim().strip_prefix("# ").map(|t| t.trim().to_string()))
        })
        .or_else(|| file.path.file_stem().map(|s| s.to_string_lossy().to_string()))
        .unwrap_or_else(|| "untitled".to_string());

    let mut extra_metadata = Metadata::new();
    if let Some(level) = sidecar.policy_level.or_else(|| tags.policy_level.clone()) {
        extra_metadata.insert(meta::POLICY_LEVEL.to_string(), level.into());
    }
    if !sidecar.entity_keys.is_empty() {
        extra_metadata.insert(meta::ENTITY_KEYS.to_string(), sidecar.entity_keys.into());
    }

    IngestDocument {
        document: Document {
            id: document_id_for_path(&file.path),
            title,
            source_org: sidecar.source_org.unwrap_or_else(|| tags.source_org.clone()),
            doc_type: sidecar.doc_type.unwrap_or(tags.doc_type),
            effective_date: sidecar.effective_date.or(tags.effective_date),
            topics: Default::default(),
            source_url: sidecar.source_url.or_else(|| tags.source_url.clone()),
            superseded: false,
        },
        pages,
        collection: tags.collection.clone(),
        supersedes: sidecar.supersedes.or_else(|| tags.supersedes.clone()),
        extra_metadata,
    }
}

/// JSON-lines 엔티티 파일 파싱 (빈 줄 무시, 불변식 위반 시 줄 번호와 함께 에러)
pub fn load_entities_jsonl(path: &Path) -> Result<Vec<StructuredEntity>> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read entities: {:?}", path))?;
    parse_entities_jsonl(&content)
}

pub fn parse_entities_jsonl(content: &str) -> Result<Vec<StructuredEntity>> {
    let mut entities = Vec::new();
    for (i, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let entity: StructuredEntity =
            serde_json::from_str(line).with_context(|| format!("Invalid entity on line {}", i + 1))?;
        entity
            .validate()
            .map_err(anyhow::Error::msg)
            .with_context(|| format!("Rejected entity on line {}", i + 1))?;
        entities.push(entity);
    }
    Ok(entities)
}

// ============================================================================
// Tests
// ============================================================================
