//! Retrieval 모듈 - 하이브리드 검색 파이프라인
//!
//! structured 저장소와 벡터 저장소를 병렬로 조회하고,
//! 벡터 후보는 Rerank → Filter를 거친 뒤 structured 결과와 병합합니다.
//! 병합 결과에 대해 신뢰도와 출처 간 충돌을 계산하여 결과 봉투를 만듭니다.
//!
//! - Rerank: LLM 관련성 점수 (0~10), 실패 시 거리 기반 대체 점수
//! - Filter: 문서 유형 / 정책 수준 / 날짜 사후 필터
//! - Confidence: 근거 양, 출처 권위, 최신성, 충돌 여부 → [0.30, 0.99]
//! - Conflict: structured vs vector 사실 불일치 감지 및 해소 정책
//! - Hybrid: 오케스트레이터 (fan-out / fan-in)

mod confidence;
mod conflict;
mod envelope;
mod filter;
mod hybrid;
mod query;
mod rerank;

// Re-exports
pub use confidence::{ConfidenceConfig, ConfidenceInputs, ConfidenceScorer};
pub use conflict::{
    extract_facts, Conflict, ConflictResolver, Fact, FactOrigin, FactValue, Resolution,
    ResolutionPolicy,
};
pub use envelope::{
    Citation, DocumentRef, EnvelopeStatus, Highlight, Provenance, ResultEnvelope, Section,
};
pub use filter::MetadataFilter;
pub use hybrid::{HybridRetriever, HybridRetrieverBuilder, PathResult, RetrievalRequest};
pub use query::{interpret_query, QueryInterpretation};
pub use rerank::{fallback_score, parse_score, LlmReranker, NoOpReranker, Reranker};
