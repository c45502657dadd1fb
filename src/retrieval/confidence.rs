//! 신뢰도 계산 - 근거 양, 출처 권위, 문서 유형, 최신성, 충돌 여부
//!
//! ```text
//! base      = sql_hits > 0 ? 0.85 : 0.60
//! + min((sql_hits - 1) * 0.03, 0.09)
//! + min(vector_matches * 0.05, 0.15)
//! × max(authority) × max(doc_type_weight) × recency
//! - conflict_penalty (0.15) - degraded_penalty (0.10)
//! → clamp [0.30, 0.99]
//! ```
//!
//! 여러 출처/유형이 섞이면 평균이 아니라 최댓값을 씁니다.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::knowledge::DocumentType;

/// 신뢰도 상수
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceConfig {
    /// structured 근거가 있을 때의 기본값
    pub sql_base: f64,
    /// 벡터 근거만 있을 때의 기본값
    pub vector_base: f64,
    /// 첫 번째 이후 structured 행당 가산
    pub extra_sql_bonus: f64,
    pub extra_sql_cap: f64,
    /// 벡터 매치당 가산
    pub vector_bonus: f64,
    pub vector_cap: f64,
    pub conflict_penalty: f64,
    /// 한 경로가 실패/타임아웃된 경우 감점
    pub degraded_penalty: f64,
    pub floor: f64,
    pub ceiling: f64,
    /// 발행 기관 → 권위 가중치 (0, 1]
    pub authority: BTreeMap<String, f64>,
    /// 표에 없는 기관의 가중치
    pub default_authority: f64,
    /// 문서 유형 → 가중치
    pub doc_type_weights: BTreeMap<DocumentType, f64>,
    pub default_doc_type_weight: f64,
    /// (최대 경과 일수, 배수) 오름차순. 모두 넘으면 `stale_multiplier`
    pub recency_steps: Vec<(i64, f64)>,
    pub stale_multiplier: f64,
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        let authority = [
            ("CPSO", 1.0),
            ("OHIP", 1.0),
            ("MOH", 1.0),
            ("ODB", 1.0),
            ("ADP", 0.95),
            ("CEP", 0.9),
            ("OMA", 0.85),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        let doc_type_weights = BTreeMap::from([
            (DocumentType::Policy, 1.0),
            (DocumentType::Standard, 1.0),
            (DocumentType::Statement, 0.95),
            (DocumentType::Guideline, 0.95),
            (DocumentType::Advice, 0.9),
            (DocumentType::Tool, 0.85),
        ]);

        Self {
            sql_base: 0.85,
            vector_base: 0.60,
            extra_sql_bonus: 0.03,
            extra_sql_cap: 0.09,
            vector_bonus: 0.05,
            vector_cap: 0.15,
            conflict_penalty: 0.15,
            degraded_penalty: 0.10,
            floor: 0.30,
            ceiling: 0.99,
            authority,
            default_authority: 0.8,
            doc_type_weights,
            default_doc_type_weight: 0.9,
            recency_steps: vec![(90, 1.0), (365, 0.95), (730, 0.85)],
            stale_multiplier: 0.75,
        }
    }
}

/// 신뢰도 입력
#[derive(Debug, Clone, Default)]
pub struct ConfidenceInputs<'a> {
    pub sql_hits: usize,
    pub vector_matches: usize,
    /// 근거에 등장한 발행 기관
    pub sources: &'a [String],
    pub doc_types: &'a [DocumentType],
    pub has_conflict: bool,
    /// 가장 최근 근거의 경과 일수 (모르면 None → 감점 없음)
    pub recency_days: Option<i64>,
    /// structured / vector 중 한 경로가 실패함
    pub degraded: bool,
}

/// 신뢰도 계산기
#[derive(Debug, Clone, Default)]
pub struct ConfidenceScorer {
    config: ConfidenceConfig,
}

impl ConfidenceScorer {
    pub fn new(config: ConfidenceConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ConfidenceConfig {
        &self.config
    }

    /// 근거가 전혀 없을 때의 값
    pub fn floor(&self) -> f32 {
        self.config.floor as f32
    }

    /// 신뢰도 계산 (항상 [floor, ceiling])
    pub fn score(&self, inputs: &ConfidenceInputs<'_>) -> f32 {
        let c = &self.config;

        let mut value = if inputs.sql_hits > 0 { c.sql_base } else { c.vector_base };

        if inputs.sql_hits > 1 {
            value += ((inputs.sql_hits - 1) as f64 * c.extra_sql_bonus).min(c.extra_sql_cap);
        }
        value += (inputs.vector_matches as f64 * c.vector_bonus).min(c.vector_cap);

        value *= self.authority(inputs.sources);
        value *= self.doc_type_weight(inputs.doc_types);
        value *= self.recency(inputs.recency_days);

        if inputs.has_conflict {
            value -= c.conflict_penalty;
        }
        if inputs.degraded {
            value -= c.degraded_penalty;
        }

        if !value.is_finite() {
            return self.floor();
        }
        value.clamp(c.floor, c.ceiling) as f32
    }

    /// 가장 권위 있는 출처의 가중치
    fn authority(&self, sources: &[String]) -> f64 {
        sources
            .iter()
            .map(|s| {
                self.config
                    .authority
                    .get(s.trim())
                    .or_else(|| self.config.authority.get(&s.trim().to_uppercase()))
                    .copied()
                    .unwrap_or(self.config.default_authority)
            })
            .fold(None, |best: Option<f64>, w| Some(best.map_or(w, |b| b.max(w))))
            .unwrap_or(self.config.default_authority)
    }

    /// 가장 무거운 문서 유형의 가중치
    fn doc_type_weight(&self, doc_types: &[DocumentType]) -> f64 {
        doc_types
            .iter()
            .map(|t| {
                self.config
                    .doc_type_weights
                    .get(t)
                    .copied()
                    .unwrap_or(self.config.default_doc_type_weight)
            })
            .fold(None, |best: Option<f64>, w| Some(best.map_or(w, |b| b.max(w))))
            .unwrap_or(self.config.default_doc_type_weight)
    }

    fn recency(&self, days: Option<i64>) -> f64 {
        let Some(days) = days else {
            return 1.0;
        };
        self.config
            .recency_steps
            .iter()
            .find(|(limit, _)| days < *limit)
            .map(|(_, m)| *m)
            .unwrap_or(self.config.stale_multiplier)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn score(sql: usize, vector: usize, conflict: bool) -> f32 {
        let sources = vec!["CPSO".to_string()];
        let types = vec![DocumentType::Policy];
        ConfidenceScorer::default().score(&ConfidenceInputs {
            sql_hits: sql,
            vector_matches: vector,
            sources: &sources,
            doc_types: &types,
            has_conflict: conflict,
            recency_days: Some(10),
            degraded: false,
        })
    }

    #[test]
    fn test_confidence_ordering() {
        assert!(score(1, 0, false) < score(1, 2, false));
        assert!(score(1, 2, false) < score(2, 2, false));
        assert!(score(1, 2, true) < score(1, 2, false));
        assert!(score(0, 1, false) < score(1, 0, false));
    }

    #[test]
    fn test_vector_bonus_capped() {
        assert_eq!(score(0, 3, false), score(0, 30, false));
    }

    #[test]
    fn test_max_authority_not_average() {
        let scorer = ConfidenceScorer::default();
        let one = vec!["CPSO".to_string()];
        let mixed = vec!["CPSO".to_string(), "unknown".to_string(), "OMA".to_string()];
        let a = scorer.score(&ConfidenceInputs {
            sql_hits: 1,
            sources: &one,
            ..Default::default()
        });
        let b = scorer.score(&ConfidenceInputs {
            sql_hits: 1,
            sources: &mixed,
            ..Default::default()
        });
        assert_eq!(a, b);
    }

    #[test]
    fn test_recency_steps() {
        let scorer = ConfidenceScorer::default();
        assert_eq!(scorer.recency(None), 1.0);
        assert_eq!(scorer.recency(Some(30)), 1.0);
        assert_eq!(scorer.recency(Some(200)), 0.95);
        assert_eq!(scorer.recency(Some(400)), 0.85);
        assert_eq!(scorer.recency(Some(5000)), 0.75);
    }

    #[test]
    fn test_degraded_is_strictly_lower() {
        let scorer = ConfidenceScorer::default();
        let sources = vec!["OHIP".to_string()];
        let full = ConfidenceInputs {
            vector_matches: 2,
            sources: &sources,
            ..Default::default()
        };
        let degraded = ConfidenceInputs {
            degraded: true,
            ..full.clone()
        };
        assert!(scorer.score(&degraded) < scorer.score(&full));
    }

    proptest! {
        #[test]
        fn prop_confidence_bounds(
            sql in 0usize..1000,
            vector in 0usize..1000,
            conflict in any::<bool>(),
            degraded in any::<bool>(),
            days in proptest::option::of(-100i64..100_000),
        ) {
            let sources = vec!["CEP".to_string(), "nowhere".to_string()];
            let types = vec![DocumentType::Tool];
            let value = ConfidenceScorer::default().score(&ConfidenceInputs {
                sql_hits: sql,
                vector_matches: vector,
                sources: &sources,
                doc_types: &types,
                has_conflict: conflict,
                recency_days: days,
                degraded,
            });
            prop_assert!((0.30..=0.99).contains(&value));
        }
    }
}
