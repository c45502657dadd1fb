//! 에러 분류 - 검색 엔진 코어의 명시적 실패 타입
//!
//! 컴포넌트 단위 실패(후보 하나, 저장소 경로 하나)는 호출자가 흡수하여
//! 신뢰도/출처를 낮추고, 시스템 단위 실패(두 경로 모두 실패, 차원 불일치,
//! 프로바이더 인증 실패)는 이 타입으로 그대로 전파합니다.
//!
//! 충돌(conflict)과 빈 근거(empty evidence)는 에러가 아니라
//! 결과 봉투(`ResultEnvelope`)의 데이터로 표현됩니다.

use std::fmt;

use thiserror::Error;

/// 검색 경로 식별자 (structured / vector)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetrievalPath {
    Structured,
    Vector,
}

impl fmt::Display for RetrievalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetrievalPath::Structured => write!(f, "structured"),
            RetrievalPath::Vector => write!(f, "vector"),
        }
    }
}

/// 검색 엔진 에러
#[derive(Debug, Error)]
pub enum RetrievalError {
    /// 저장소 쿼리가 시간 예산을 초과함
    #[error("{path} store timed out after {budget_ms}ms")]
    StoreTimeout { path: RetrievalPath, budget_ms: u64 },

    /// 임베딩 프로바이더 배치 실패
    #[error("Embedding error ({provider}): {message}")]
    EmbeddingFailure { provider: String, message: String },

    /// 개별 재순위 점수 호출 실패 또는 파싱 불가 응답
    #[error("Scoring error: {message}")]
    ScoringFailure { message: String },

    /// 벡터 길이가 컬렉션 선언 차원과 다름 (로컬 복구 불가)
    #[error("Dimension mismatch in collection '{collection}': expected {expected}, got {actual}")]
    DimensionMismatch {
        collection: String,
        expected: usize,
        actual: usize,
    },

    /// 저장소 백엔드 에러 (SQLite, LanceDB 등)
    #[error("Store error ({backend}): {message}")]
    Store { backend: String, message: String },

    /// 외부 프로바이더의 시스템 단위 실패 (인증, 전체 장애)
    #[error("Provider error ({provider}): {message}")]
    Provider { provider: String, message: String },

    /// 설정 검증 실패
    #[error("Configuration error: {0}")]
    Config(String),

    /// structured / vector 두 경로가 모두 실패함
    #[error("All retrieval paths failed (structured: {structured}; vector: {vector})")]
    AllPathsFailed { structured: String, vector: String },
}

impl RetrievalError {
    /// 저장소 에러 생성 헬퍼
    pub fn store(backend: impl Into<String>, message: impl fmt::Display) -> Self {
        RetrievalError::Store {
            backend: backend.into(),
            message: message.to_string(),
        }
    }

    /// 로컬에서 흡수할 수 없는 시스템 단위 실패인지 여부
    ///
    /// 오케스트레이터는 이 에러를 "경로 실패"로 강등하지 않고 즉시 전파합니다.
    pub fn is_systemic(&self) -> bool {
        matches!(
            self,
            RetrievalError::DimensionMismatch { .. }
                | RetrievalError::Provider { .. }
                | RetrievalError::Config(_)
                | RetrievalError::AllPathsFailed { .. }
        )
    }
}

/// 검색 엔진 결과 타입
pub type RetrievalResult<T> = std::result::Result<T, RetrievalError>;
