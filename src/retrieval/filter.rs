//! 메타데이터 사후 필터
//!
//! 재순위된 후보에 문서 유형 / 정책 수준 / 날짜 제약을 적용합니다. 순서는 보존됩니다.
//!
//! - 문자열 제약은 후보 메타데이터와 정확히 일치해야 하며, 메타데이터가 없으면 제외
//! - 날짜 제약은 날짜가 있고 기준보다 이전인 후보만 제외 (날짜 없는 문서는 통과)

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::knowledge::{meta, CandidatePassage, DocumentType};

/// 후보 메타데이터 필터 (모든 제약은 선택)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataFilter {
    /// 허용 문서 유형 (비어 있으면 제한 없음)
    #[serde(default)]
    pub document_types: Vec<DocumentType>,
    pub policy_level: Option<String>,
    pub after_date: Option<NaiveDate>,
}

impl MetadataFilter {
    pub fn is_empty(&self) -> bool {
        self.document_types.is_empty() && self.policy_level.is_none() && self.after_date.is_none()
    }

    /// 필터 적용 (순서 보존)
    pub fn apply(&self, candidates: Vec<CandidatePassage>) -> Vec<CandidatePassage> {
        if self.is_empty() {
            return candidates;
        }

        let before = candidates.len();
        let kept: Vec<CandidatePassage> = candidates.into_iter().filter(|c| self.matches(c)).collect();

        if kept.len() < before {
            tracing::debug!(
                removed = before - kept.len(),
                kept = kept.len(),
                "Metadata filter applied"
            );
        }
        kept
    }

    /// 후보 하나가 모든 제약을 만족하는지
    pub fn matches(&self, candidate: &CandidatePassage) -> bool {
        if !self.document_types.is_empty() {
            let Some(doc_type) = candidate.meta_str(meta::DOCUMENT_TYPE) else {
                return false;
            };
            if !self.document_types.iter().any(|t| t.as_str() == doc_type) {
                return false;
            }
        }

        if let Some(level) = &self.policy_level {
            if candidate.meta_str(meta::POLICY_LEVEL) != Some(level.as_str()) {
                return false;
            }
        }

        if let Some(after) = self.after_date {
            if let Some(raw) = candidate.meta_str(meta::EFFECTIVE_DATE) {
                if is_before(raw, after) {
                    return false;
                }
            }
        }

        true
    }
}

/// 날짜 문자열이 기준보다 이전인지
///
/// `YYYY-MM-DD` 접두사를 날짜로 읽고, 읽을 수 없으면 ISO 문자열로 사전순 비교합니다.
/// 빈 문자열은 날짜 없음으로 취급합니다.
fn is_before(raw: &str, threshold: NaiveDate) -> bool {
    let raw = raw.trim();
    if raw.is_empty() {
        return false;
    }

    let prefix: String = raw.chars().take(10).collect();
    match NaiveDate::parse_from_str(&prefix, "%Y-%m-%d") {
        Ok(date) => date < threshold,
        Err(_) => raw < threshold.format("%Y-%m-%d").to_string().as_str(),
    }
}

// ============================================================================
// Tests
// ============================================================================
