//! medguide-rag - 의료 규정/청구 문서 하이브리드 검색 엔진
//!
//! SQLite(정규화 엔티티 + FTS5 섹션)와 LanceDB(벡터)를 병렬로 조회하고,
//! 벡터 후보는 LLM 관련성 점수로 재순위한 뒤 structured 결과와 병합합니다.
//! 결과는 신뢰도, 인용, 출처 간 충돌을 담은 결과 봉투로 반환됩니다.

pub mod cli;
pub mod collector;
pub mod config;
pub mod embedding;
pub mod error;
pub mod extractor;
pub mod ingest;
pub mod knowledge;
pub mod retrieval;
pub mod scoring;

// Re-exports
pub use config::{EmbeddingConfig, EngineConfig, RetrievalConfig};
pub use embedding::{
    embed_all, get_api_key, has_api_key, EmbedTask, Embedding, EmbeddingProvider, GeminiEmbedding,
};
pub use error::{RetrievalError, RetrievalPath, RetrievalResult};
pub use ingest::{FileTags, HybridStats, IngestDocument, IngestReport, Ingestor, PageText};
pub use knowledge::{
    default_chunker, get_data_dir, CandidatePassage, Chunk, ChunkConfig, Chunker, CollectionSpec,
    DistanceMetric, Document, DocumentType, EntityKind, InMemoryVectorStore, KnowledgeStore,
    LanceVectorStore, SqliteStructuredStore, StructuredEntity, StructuredFilters, StructuredQuery,
    StructuredRow, StructuredStore, VectorRecord, VectorStore,
};
pub use retrieval::{
    ConfidenceScorer, ConflictResolver, EnvelopeStatus, HybridRetriever, LlmReranker,
    MetadataFilter, NoOpReranker, Provenance, Reranker, ResultEnvelope, RetrievalRequest,
};
pub use scoring::{GeminiScorer, LlmScorer};
