//! 충돌 감지 - structured 사실과 벡터 텍스트 사이의 불일치
//!
//! structured 엔티티의 플래그/금액과, 같은 엔티티를 언급하는 벡터 구절에서
//! 추출한 사실을 같은 (엔티티, 필드) 기준으로 비교합니다.
//! 비교는 structured 결과에 실제로 등장한 엔티티와 필드에 대해서만 수행합니다.
//!
//! 해소 정책은 명시적으로 기록되며, 채택되지 않은 값도 결과에 그대로 남깁니다.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::OnceLock;

use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::knowledge::{meta, CandidatePassage, RowBody, StructuredRow};

/// 문서 요구 여부 필드 이름
pub const DOCUMENTATION_REQUIRED: &str = "documentation_required";
/// 금액 필드 이름
pub const FEE: &str = "fee";

// ============================================================================
// Types
// ============================================================================

/// 사실의 출처 경로
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactOrigin {
    Structured,
    Vector,
}

/// 사실 값
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FactValue {
    Flag(bool),
    Amount(f64),
    Text(String),
}

impl FactValue {
    /// 실질적으로 다른 값인지
    fn differs(&self, other: &FactValue) -> bool {
        match (self, other) {
            (FactValue::Flag(a), FactValue::Flag(b)) => a != b,
            (FactValue::Amount(a), FactValue::Amount(b)) => (a - b).abs() > 0.005,
            (FactValue::Text(a), FactValue::Text(b)) => !a.trim().eq_ignore_ascii_case(b.trim()),
            _ => false,
        }
    }

    fn is_textual(&self) -> bool {
        matches!(self, FactValue::Text(_))
    }
}

impl fmt::Display for FactValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FactValue::Flag(v) => write!(f, "{}", v),
            FactValue::Amount(v) => write!(f, "{:.2}", v),
            FactValue::Text(v) => f.write_str(v),
        }
    }
}

/// 엔티티 하나에 대한 사실 하나
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub entity_key: String,
    pub field: String,
    pub value: FactValue,
    pub origin: FactOrigin,
    /// 근거 위치 (structured 자연키 또는 chunk ID)
    pub source: String,
    /// 근거 원문 (표시용)
    pub evidence: String,
    pub effective_date: Option<NaiveDate>,
}

/// 해소 정책
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionPolicy {
    /// 시행일이 더 최근인 쪽 (모르면 structured)
    PreferNewer,
    /// 수치/플래그는 structured, 자유 텍스트 단서는 vector
    #[default]
    PreferStructuredForNumeric,
}

impl ResolutionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionPolicy::PreferNewer => "prefer_newer",
            ResolutionPolicy::PreferStructuredForNumeric => "prefer_structured_for_numeric",
        }
    }
}

/// 해소 결과
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub policy: ResolutionPolicy,
    pub preferred: FactOrigin,
    pub reason: String,
}

/// 감지된 충돌 (양쪽 값 모두 유지)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub entity_key: String,
    pub field: String,
    /// structured 값
    pub value_a: FactValue,
    /// vector 값
    pub value_b: FactValue,
    pub source_a: String,
    pub source_b: String,
    pub evidence_b: String,
    pub resolution: Resolution,
}

// ============================================================================
// Fact Extraction
// ============================================================================

struct Patterns {
    doc_not_required: Regex,
    doc_required: Regex,
    amount: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        doc_not_required: Regex::new(
            r"(?i)\b(?:no\s+(?:special\s+|additional\s+|prior\s+)?(?:documentation|authorization|paperwork|forms?)\s+(?:is\s+|are\s+)?required|(?:documentation|authorization)\s+(?:is\s+)?not\s+required|without\s+(?:prior\s+)?(?:authorization|documentation))\b",
        )
        .expect("Invalid regex"),
        doc_required: Regex::new(
            r"(?i)\b(?:(?:prior\s+authorization|special\s+authorization|documentation|(?:\w+\s+)?forms?)\s+(?:is\s+|are\s+|must\s+be\s+)?(?:required|submitted)|requires?\s+(?:a\s+|an\s+|the\s+)?(?:prior\s+authorization|documentation|(?:\w+\s+)?form))\b",
        )
        .expect("Invalid regex"),
        amount: Regex::new(r"\$\s?(\d{1,3}(?:,\d{3})*(?:\.\d{1,2})?|\d+(?:\.\d{1,2})?)").expect("Invalid regex"),
    })
}

/// 텍스트에서 정규화된 사실 추출 (structured 메모와 벡터 구절에 같은 규칙 적용)
pub fn extract_facts(text: &str) -> Vec<(String, FactValue, String)> {
    let p = patterns();
    let mut facts = Vec::new();

    // 부정 표현을 먼저 확인 ("no documentation required"는 "documentation required"도 포함)
    if let Some(m) = p.doc_not_required.find(text) {
        facts.push((DOCUMENTATION_REQUIRED.to_string(), FactValue::Flag(false), m.as_str().to_string()));
    } else if let Some(m) = p.doc_required.find(text) {
        facts.push((DOCUMENTATION_REQUIRED.to_string(), FactValue::Flag(true), m.as_str().to_string()));
    }

    if let Some(caps) = p.amount.captures(text) {
        if let Some(raw) = caps.get(1) {
            if let Ok(value) = raw.as_str().replace(',', "").parse::<f64>() {
                facts.push((FEE.to_string(), FactValue::Amount(value), caps[0].to_string()));
            }
        }
    }

    facts
}

/// structured 행 → 사실 (명시 필드 우선, 없으면 설명/메모에서 추출)
fn structured_facts(row: &StructuredRow) -> Vec<Fact> {
    let RowBody::Entity(entity) = &row.body else {
        return Vec::new();
    };

    let make = |field: &str, value: FactValue, evidence: String| Fact {
        entity_key: entity.natural_key.to_uppercase(),
        field: field.to_string(),
        value,
        origin: FactOrigin::Structured,
        source: entity.natural_key.clone(),
        evidence,
        effective_date: entity.effective_date,
    };

    let mut facts: Vec<Fact> = Vec::new();
    for (field, flag) in &entity.flags {
        facts.push(make(field, FactValue::Flag(*flag), format!("{} = {}", field, flag)));
    }
    for (field, amount) in &entity.amounts {
        if let Some(v) = amount {
            facts.push(make(field, FactValue::Amount(*v), format!("{} = {:.2}", field, v)));
        }
    }

    let text = match &entity.notes {
        Some(notes) => format!("{} {}", entity.description, notes),
        None => entity.description.clone(),
    };
    for (field, value, evidence) in extract_facts(&text) {
        if !facts.iter().any(|f| f.field == field) {
            facts.push(make(&field, value, evidence));
        }
    }

    facts
}

/// 벡터 후보 → 사실 (후보가 가리키는 엔티티 중 관심 대상만)
fn vector_facts(candidate: &CandidatePassage, wanted: &BTreeSet<String>) -> Vec<Fact> {
    let mut keys: BTreeSet<String> = candidate
        .entity_keys()
        .into_iter()
        .filter(|k| wanted.contains(k))
        .collect();

    // 메타데이터에 없더라도 본문이 자연키를 직접 언급하면 대상
    let upper = candidate.text.to_uppercase();
    for key in wanted {
        if contains_token(&upper, key) {
            keys.insert(key.clone());
        }
    }

    if keys.is_empty() {
        return Vec::new();
    }

    let extracted = extract_facts(&candidate.text);
    if extracted.is_empty() {
        return Vec::new();
    }

    let effective_date = candidate
        .meta_str(meta::EFFECTIVE_DATE)
        .and_then(|s| NaiveDate::parse_from_str(&s.chars().take(10).collect::<String>(), "%Y-%m-%d").ok());

    keys.iter()
        .flat_map(|key| {
            extracted.iter().map(move |(field, value, evidence)| Fact {
                entity_key: key.clone(),
                field: field.clone(),
                value: value.clone(),
                origin: FactOrigin::Vector,
                source: candidate.chunk_id.clone(),
                evidence: evidence.clone(),
                effective_date,
            })
        })
        .collect()
}

/// 단어 경계 기준 포함 여부 (C122가 C1220에 매칭되지 않도록)
fn contains_token(haystack: &str, token: &str) -> bool {
    haystack.match_indices(token).any(|(i, _)| {
        let before = haystack[..i].chars().next_back();
        let after = haystack[i + token.len()..].chars().next();
        !before.is_some_and(|c| c.is_alphanumeric()) && !after.is_some_and(|c| c.is_alphanumeric())
    })
}

// ============================================================================
// ConflictResolver
// ============================================================================

/// 충돌 감지/해소기
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver {
    policy: ResolutionPolicy,
}

impl ConflictResolver {
    pub fn new(policy: ResolutionPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> ResolutionPolicy {
        self.policy
    }

    /// structured 행과 벡터 후보 사이의 충돌 감지
    pub fn detect(&self, rows: &[StructuredRow], candidates: &[CandidatePassage]) -> Vec<Conflict> {
        let structured: Vec<Fact> = rows.iter().flat_map(structured_facts).collect();
        if structured.is_empty() || candidates.is_empty() {
            return Vec::new();
        }

        let wanted: BTreeSet<String> = structured.iter().map(|f| f.entity_key.clone()).collect();
        let vector: Vec<Fact> = candidates.iter().flat_map(|c| vector_facts(c, &wanted)).collect();

        self.detect_and_resolve(&structured, &vector)
    }

    /// 사실 목록 비교 → 충돌 목록
    pub fn detect_and_resolve(&self, structured: &[Fact], vector: &[Fact]) -> Vec<Conflict> {
        let mut by_field: BTreeMap<(&str, &str), Vec<&Fact>> = BTreeMap::new();
        for fact in structured {
            by_field
                .entry((fact.entity_key.as_str(), fact.field.as_str()))
                .or_default()
                .push(fact);
        }

        let mut conflicts = Vec::new();
        let mut seen = BTreeSet::new();

        for v in vector {
            let Some(candidates) = by_field.get(&(v.entity_key.as_str(), v.field.as_str())) else {
                continue;
            };
            for s in candidates {
                if !s.value.differs(&v.value) {
                    continue;
                }
                let key = (
                    s.entity_key.clone(),
                    s.field.clone(),
                    s.value.to_string(),
                    v.value.to_string(),
                );
                if !seen.insert(key) {
                    continue;
                }

                let resolution = self.resolve(s, v);
                tracing::warn!(
                    entity = %s.entity_key,
                    field = %s.field,
                    structured = %s.value,
                    vector = %v.value,
                    policy = resolution.policy.as_str(),
                    preferred = ?resolution.preferred,
                    "Conflicting evidence detected"
                );

                conflicts.push(Conflict {
                    entity_key: s.entity_key.clone(),
                    field: s.field.clone(),
                    value_a: s.value.clone(),
                    value_b: v.value.clone(),
                    source_a: s.source.clone(),
                    source_b: v.source.clone(),
                    evidence_b: v.evidence.clone(),
                    resolution,
                });
            }
        }

        conflicts
    }

    fn resolve(&self, structured: &Fact, vector: &Fact) -> Resolution {
        match self.policy {
            ResolutionPolicy::PreferStructuredForNumeric => {
                if structured.value.is_textual() && vector.value.is_textual() {
                    Resolution {
                        policy: self.policy,
                        preferred: FactOrigin::Vector,
                        reason: "free-text caveat taken from passage".to_string(),
                    }
                } else {
                    Resolution {
                        policy: self.policy,
                        preferred: FactOrigin::Structured,
                        reason: "numeric/flag field taken from structured record".to_string(),
                    }
                }
            }
            ResolutionPolicy::PreferNewer => match (structured.effective_date, vector.effective_date) {
                (Some(a), Some(b)) if b > a => Resolution {
                    policy: self.policy,
                    preferred: FactOrigin::Vector,
                    reason: format!("passage effective {} is newer than record {}", b, a),
                },
                (Some(a), Some(b)) if a > b => Resolution {
                    policy: self.policy,
                    preferred: FactOrigin::Structured,
                    reason: format!("record effective {} is newer than passage {}", a, b),
                },
                _ => Resolution {
                    policy: self.policy,
                    preferred: FactOrigin::Structured,
                    reason: "effective dates equal or unknown, kept structured record".to_string(),
                },
            },
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
