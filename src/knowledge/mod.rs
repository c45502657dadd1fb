//! Knowledge 모듈 - 하이브리드 검색용 지식 저장소
//!
//! - Model: 문서/청크/구조화 엔티티/검색 후보
//! - SQLite: 정규화 데이터 저장 + FTS5 키워드 검색
//! - LanceDB: 벡터 검색 (ANN, 컬렉션별 metric 선언)
//! - Chunker: 토큰 윈도우 + Markdown 계층 분할

mod model;
mod store;
mod vector;
mod lance;
mod chunker;

// Re-exports
pub use model::{
    meta, metadata_keys, CandidatePassage, Chunk, ChunkLevel, Document, DocumentType, EntityKind,
    Metadata, ScoreSource, SourceRef, StructuredEntity,
};
pub use store::{
    get_data_dir, KnowledgeStore, MatchKind, Relation, RowBody, SqliteStructuredStore,
    StoreStats, StructuredFilters, StructuredQuery, StructuredRow, StructuredStore,
};
pub use vector::{
    cosine_similarity, normalize_in_place, search_collections, sort_by_distance, CollectionSpec,
    DistanceMetric, InMemoryVectorStore, VectorRecord, VectorStore, EMBEDDING_DIMENSION, MAX_TOP_K,
};
pub use lance::LanceVectorStore;
pub use chunker::{
    chunk_text, default_chunker, hierarchical_chunker, stable_chunk_id, ChunkConfig, Chunker,
    HierarchicalChunker, TokenChunker,
};
