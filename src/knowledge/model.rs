//! 데이터 모델 - 문서, 청크, 구조화 엔티티, 검색 후보
//!
//! 문서(Document)와 청크(Chunk)는 수집 시 생성되어 이후 변경되지 않습니다.
//! 예외는 `superseded` 플래그뿐이며, 새 문서가 이전 문서를 대체할 때 설정됩니다.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// 청크/후보에 붙는 임의의 키-값 메타데이터
///
/// 순서가 결정적이어야 청크 ID와 직렬화 결과가 재현 가능하므로 BTreeMap을 사용합니다.
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// 메타데이터 키 규약
pub mod meta {
    pub const TITLE: &str = "title";
    pub const DOCUMENT_TYPE: &str = "document_type";
    pub const SOURCE_ORG: &str = "source_org";
    pub const POLICY_LEVEL: &str = "policy_level";
    pub const EFFECTIVE_DATE: &str = "effective_date";
    pub const SECTION: &str = "section";
    pub const PAGE: &str = "page";
    pub const URL: &str = "url";
    /// 청크와 연관된 자연키 목록 (청구 코드, DIN 등)
    pub const ENTITY_KEYS: &str = "entity_keys";
}

// ============================================================================
// Document
// ============================================================================

/// 문서 유형
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentType {
    Policy,
    Standard,
    Guideline,
    Advice,
    Tool,
    Statement,
}

impl DocumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Policy => "policy",
            DocumentType::Standard => "standard",
            DocumentType::Guideline => "guideline",
            DocumentType::Advice => "advice",
            DocumentType::Tool => "tool",
            DocumentType::Statement => "statement",
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "policy" => Ok(DocumentType::Policy),
            "standard" => Ok(DocumentType::Standard),
            "guideline" => Ok(DocumentType::Guideline),
            "advice" => Ok(DocumentType::Advice),
            "tool" => Ok(DocumentType::Tool),
            "statement" => Ok(DocumentType::Statement),
            other => Err(format!("Unknown document type: {}", other)),
        }
    }
}

/// 최상위 원천 문서 (정책 PDF, 처방집 추출본, 규정 등)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub title: String,
    /// 발행 기관 태그 (CPSO, ODB, OHIP 등 - 엔진은 불투명 문자열로 취급)
    pub source_org: String,
    pub doc_type: DocumentType,
    pub effective_date: Option<NaiveDate>,
    #[serde(default)]
    pub topics: BTreeSet<String>,
    pub source_url: Option<String>,
    #[serde(default)]
    pub superseded: bool,
}

// ============================================================================
// Chunk
// ============================================================================

/// 계층 검색용 청크 레벨
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkLevel {
    /// 섹션 단위 상위 청크
    Parent,
    /// 임베딩 대상 하위 청크
    Child,
}

impl ChunkLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkLevel::Parent => "parent",
            ChunkLevel::Child => "child",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "parent" => Some(ChunkLevel::Parent),
            "child" => Some(ChunkLevel::Child),
            _ => None,
        }
    }
}

/// 문서에서 추출한 연속 텍스트 구간 (검색의 최소 단위)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// 내용 + 순번 해시에서 파생된 안정 ID
    pub id: String,
    /// 소유 문서 ID (빈 문자열이면 아직 문서에 귀속되지 않음)
    pub document_id: String,
    pub heading: Option<String>,
    pub text: String,
    /// 문서 내 순번
    pub index: usize,
    pub level: ChunkLevel,
    /// 하위 청크의 상위 청크 참조 (조회 전용)
    pub parent_id: Option<String>,
    /// 원문 내 시작 바이트 오프셋
    pub start: usize,
    /// 원문 내 끝 바이트 오프셋 (exclusive)
    pub end: usize,
    #[serde(default)]
    pub metadata: Metadata,
}

// ============================================================================
// Structured Entity
// ============================================================================

/// 구조화 엔티티 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntityKind {
    FeeCode,
    DrugRecord,
    DeviceRule,
    PolicyRule,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::FeeCode => "fee-code",
            EntityKind::DrugRecord => "drug-record",
            EntityKind::DeviceRule => "device-rule",
            EntityKind::PolicyRule => "policy-rule",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "fee-code" => Ok(EntityKind::FeeCode),
            "drug-record" => Ok(EntityKind::DrugRecord),
            "device-rule" => Ok(EntityKind::DeviceRule),
            "policy-rule" => Ok(EntityKind::PolicyRule),
            other => Err(format!("Unknown entity kind: {}", other)),
        }
    }
}

/// 엔티티 출처 포인터
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SourceRef {
    pub document_id: String,
    pub section_ref: Option<String>,
    pub page: Option<u32>,
}

/// 자연키를 가진 정규화 사실 행 (청구 코드, 약품 레코드, 기기 규칙, 정책 규칙)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredEntity {
    pub kind: EntityKind,
    pub natural_key: String,
    pub description: String,
    /// 금액/수치 필드 (음수 금지, 미상이면 None)
    #[serde(default)]
    pub amounts: BTreeMap<String, Option<f64>>,
    /// 자격/요건 플래그
    #[serde(default)]
    pub flags: BTreeMap<String, bool>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub effective_date: Option<NaiveDate>,
    pub source: SourceRef,
}

impl StructuredEntity {
    /// 불변식 검증: 자연키 존재, 금액은 유한한 0 이상 값
    pub fn validate(&self) -> Result<(), String> {
        if self.natural_key.trim().is_empty() {
            return Err(format!("{} entity has an empty natural key", self.kind));
        }
        for (field, value) in &self.amounts {
            if let Some(v) = value {
                if !v.is_finite() || *v < 0.0 {
                    return Err(format!(
                        "{} {}: amount field '{}' must be non-negative, got {}",
                        self.kind, self.natural_key, field, v
                    ));
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// Candidate Passage
// ============================================================================

/// 재순위 점수의 출처
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreSource {
    /// LLM이 매긴 점수
    Llm,
    /// 점수 호출 실패 시 거리 기반 대체 점수
    DistanceFallback,
    /// 점수 상한 밖의 후보 (기본 최소 점수)
    Default,
}

/// 검색 시점의 후보 구절 (쿼리 한 번 동안만 존재)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidatePassage {
    pub chunk_id: String,
    pub document_id: String,
    pub collection: String,
    pub text: String,
    #[serde(default)]
    pub metadata: Metadata,
    /// 컬렉션 선언 metric 기준 거리 (작을수록 유사)
    pub distance: f32,
    /// 재순위 점수 (0~10)
    pub relevance: Option<f32>,
    pub score_source: Option<ScoreSource>,
}

impl CandidatePassage {
    /// 문자열 메타데이터 조회
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }

    pub fn title(&self) -> Option<&str> {
        self.meta_str(meta::TITLE)
    }

    /// 연관 자연키 목록 (문자열 또는 문자열 배열 모두 허용)
    pub fn entity_keys(&self) -> Vec<String> {
        metadata_keys(&self.metadata)
    }
}

/// 메타데이터에서 연관 자연키 목록 추출
pub fn metadata_keys(metadata: &Metadata) -> Vec<String> {
    match metadata.get(meta::ENTITY_KEYS) {
        Some(serde_json::Value::String(s)) => s
            .split(',')
            .map(|k| k.trim().to_uppercase())
            .filter(|k| !k.is_empty())
            .collect(),
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(|k| k.trim().to_uppercase())
            .filter(|k| !k.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entity(amount: Option<f64>) -> StructuredEntity {
        StructuredEntity {
            kind: EntityKind::FeeCode,
            natural_key: "C122".to_string(),
            description: "Subsequent visit - day following hospital admission".to_string(),
            amounts: BTreeMap::from([("fee".to_string(), amount)]),
            flags: BTreeMap::new(),
            notes: None,
            effective_date: None,
            source: SourceRef::default(),
        }
    }

    #[test]
    fn test_entity_amount_invariant() {
        assert!(entity(Some(61.15)).validate().is_ok());
        assert!(entity(None).validate().is_ok());
        assert!(entity(Some(-1.0)).validate().is_err());
        assert!(entity(Some(f64::NAN)).validate().is_err());
    }

    #[test]
    fn test_enum_round_trip_strings() {
        assert_eq!("Guideline".parse::<DocumentType>(), Ok(DocumentType::Guideline));
        assert_eq!("drug_record".parse::<EntityKind>(), Ok(EntityKind::DrugRecord));
        assert!("memo".parse::<DocumentType>().is_err());
        assert_eq!(ChunkLevel::parse("child"), Some(ChunkLevel::Child));
    }

    #[test]
    fn test_metadata_keys_accepts_string_or_array() {
        let mut metadata = Metadata::new();
        metadata.insert(meta::ENTITY_KEYS.to_string(), json!("c122, C123"));
        assert_eq!(metadata_keys(&metadata), vec!["C122", "C123"]);

        metadata.insert(meta::ENTITY_KEYS.to_string(), json!(["a001"]));
        assert_eq!(metadata_keys(&metadata), vec!["A001"]);
    }
}
