//! 결과 봉투 - 하이브리드 검색 한 번의 최종 출력
//!
//! 대화 계층에 넘겨지는 구조입니다. 저장되지 않습니다.
//! 하이라이트마다 최소 하나의 인용이 붙으며, 인용 없는 하이라이트는 만들지 않습니다.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::RetrievalError;
use crate::knowledge::{MatchKind, Metadata, ScoreSource};

use super::conflict::Conflict;

/// 결과에 기여한 하위 시스템
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Provenance {
    #[serde(rename = "sql")]
    Sql,
    #[serde(rename = "vector")]
    Vector,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provenance::Sql => "sql",
            Provenance::Vector => "vector",
        }
    }
}

/// 봉투 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeStatus {
    /// 두 경로 모두 성공
    Complete,
    /// 한 경로가 실패/타임아웃, 남은 경로로 생성
    Degraded,
    /// 경로는 성공했으나 근거 없음
    Empty,
    /// 두 경로 모두 실패
    Failed,
}

/// 결과 섹션 (structured 행 또는 벡터 후보)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    /// 섹션/청크 ID 또는 엔티티 자연키
    pub id: String,
    pub document_id: String,
    pub heading: Option<String>,
    pub text: String,
    pub origin: Provenance,
    /// structured 매칭 종류
    pub match_kind: Option<MatchKind>,
    /// 재순위 점수 (벡터 섹션)
    pub relevance: Option<f32>,
    pub score_source: Option<ScoreSource>,
    pub distance: Option<f32>,
    pub page: Option<u32>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// 중복 제거된 문서 참조
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRef {
    pub id: String,
    pub title: Option<String>,
    pub source_org: Option<String>,
    pub doc_type: Option<String>,
    pub effective_date: Option<NaiveDate>,
    pub url: Option<String>,
}

/// 인용
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    /// 문서 제목 (없으면 문서 ID)
    pub source: String,
    pub source_org: Option<String>,
    /// 섹션/페이지 위치
    pub location: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// 하이라이트 (요점 + 근거 인용)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Highlight {
    pub point: String,
    pub citations: Vec<Citation>,
}

/// 하이브리드 검색 결과 봉투
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub sections: Vec<Section>,
    pub documents: Vec<DocumentRef>,
    pub confidence: f32,
    pub highlights: Vec<Highlight>,
    pub conflicts: Vec<Conflict>,
    pub provenance: Vec<Provenance>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_interpretation: Option<String>,
    pub status: EnvelopeStatus,
    /// 실패한 경로 (structured / vector)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_paths: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResultEnvelope {
    /// 두 경로 모두 실패한 경우의 명시적 빈 봉투
    pub fn failed(confidence_floor: f32, structured_error: String, vector_error: String) -> Self {
        Self {
            sections: Vec::new(),
            documents: Vec::new(),
            confidence: confidence_floor,
            highlights: Vec::new(),
            conflicts: Vec::new(),
            provenance: Vec::new(),
            query_interpretation: None,
            status: EnvelopeStatus::Failed,
            failed_paths: vec!["structured".to_string(), "vector".to_string()],
            error: Some(format!("structured: {}; vector: {}", structured_error, vector_error)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    pub fn has_provenance(&self, provenance: Provenance) -> bool {
        self.provenance.contains(&provenance)
    }

    /// 실패 봉투를 에러로 변환 (예외 방식을 원하는 호출자용)
    pub fn into_result(self) -> Result<Self, RetrievalError> {
        if self.status != EnvelopeStatus::Failed {
            return Ok(self);
        }
        let (structured, vector) = self
            .error
            .as_deref()
            .and_then(|e| e.split_once("; vector: "))
            .map(|(s, v)| (s.trim_start_matches("structured: ").to_string(), v.to_string()))
            .unwrap_or_else(|| ("unknown".to_string(), "unknown".to_string()));
        Err(RetrievalError::AllPathsFailed { structured, vector })
    }
}

// ============================================================================
// Tests
// ============================================================================
