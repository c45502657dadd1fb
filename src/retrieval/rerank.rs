//! 관련성 재순위 - LLM 점수 기반 2단계 검색 (Vector → Rerank → Filter)
//!
//! 1. 점수 호출 대상은 상한(ceiling)까지만. 상한 밖 후보는 0.0 기본 점수로 남김
//! 2. 상한 안 후보는 서로 독립적으로 병렬 채점 (후보별 타임아웃)
//! 3. 점수 내림차순, 동점은 원래 거리 오름차순
//! 4. keep_top_k로 절단
//!
//! 후보 하나의 채점 실패는 그 후보만 거리 기반 대체 점수로 처리하고,
//! 모든 채점이 실패하면 재순위를 건너뛰고 거리 순서를 그대로 반환합니다.
//!
//! ref: https://www.pinecone.io/learn/series/rag/rerankers/

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use regex::Regex;
use tokio::sync::Semaphore;

use crate::config::RetrievalConfig;
use crate::error::{RetrievalError, RetrievalResult};
use crate::knowledge::{meta, sort_by_distance, CandidatePassage, ScoreSource};
use crate::scoring::LlmScorer;

/// 점수 범위
pub const MIN_SCORE: f32 = 0.0;
pub const MAX_SCORE: f32 = 10.0;

// ============================================================================
// Reranker Trait
// ============================================================================

/// 후보 재순위 인터페이스
#[async_trait]
pub trait Reranker: Send + Sync {
    /// 후보를 재채점/재정렬하여 상위 `keep_top_k`개 반환
    async fn rerank(
        &self,
        query: &str,
        candidates: Vec<CandidatePassage>,
        keep_top_k: usize,
    ) -> RetrievalResult<Vec<CandidatePassage>>;
}

/// 재순위 없이 거리 순서를 유지하는 구현
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpReranker;

#[async_trait]
impl Reranker for NoOpReranker {
    async fn rerank(
        &self,
        _query: &str,
        mut candidates: Vec<CandidatePassage>,
        keep_top_k: usize,
    ) -> RetrievalResult<Vec<CandidatePassage>> {
        sort_by_distance(&mut candidates);
        candidates.truncate(keep_top_k);
        Ok(candidates)
    }
}

// ============================================================================
// LlmReranker
// ============================================================================

/// LLM 점수 기반 재순위기
pub struct LlmReranker {
    scorer: Arc<dyn LlmScorer>,
    ceiling: usize,
    excerpt_chars: usize,
    timeout: Duration,
    permits: Arc<Semaphore>,
}

/// 후보 하나의 채점 결과
enum ScoreOutcome {
    Scored(f32),
    Failed(RetrievalError),
}

impl LlmReranker {
    pub fn new(scorer: Arc<dyn LlmScorer>, config: &RetrievalConfig) -> Self {
        Self {
            scorer,
            ceiling: config.rerank_ceiling,
            excerpt_chars: config.excerpt_chars,
            timeout: Duration::from_millis(config.scoring_timeout_ms),
            permits: Arc::new(Semaphore::new(config.scoring_concurrency.max(1))),
        }
    }

    /// 점수 프롬프트 구성
    fn prompt(&self, query: &str, candidate: &CandidatePassage) -> String {
        let field = |key: &str| candidate.meta_str(key).unwrap_or("unknown");
        let excerpt: String = candidate.text.chars().take(self.excerpt_chars).collect();

        format!(
            "Rate how relevant the passage is to the question on a scale from 0 to 10.\n\
             Respond with a single number only.\n\n\
             Question: {query}\n\n\
             Title: {title}\n\
             Type: {doc_type}\n\
             Source: {source}\n\
             Section: {section}\n\
             Passage:\n{excerpt}\n\n\
             Score:",
            query = query,
            title = field(meta::TITLE),
            doc_type = field(meta::DOCUMENT_TYPE),
            source = field(meta::SOURCE_ORG),
            section = field(meta::SECTION),
            excerpt = excerpt,
        )
    }

    /// 후보 하나 채점 (동시성 제한 + 타임아웃)
    async fn score_one(&self, query: &str, candidate: &CandidatePassage) -> ScoreOutcome {
        let prompt = self.prompt(query, candidate);

        let _permit = match self.permits.acquire().await {
            Ok(permit) => permit,
            Err(e) => {
                return ScoreOutcome::Failed(RetrievalError::ScoringFailure {
                    message: format!("scoring pool closed: {}", e),
                })
            }
        };

        let response = match tokio::time::timeout(self.timeout, self.scorer.complete(&prompt)).await {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => return ScoreOutcome::Failed(e),
            Err(_) => {
                return ScoreOutcome::Failed(RetrievalError::ScoringFailure {
                    message: format!("timed out after {}ms", self.timeout.as_millis()),
                })
            }
        };

        match parse_score(&response) {
            Some(score) => ScoreOutcome::Scored(score),
            None => ScoreOutcome::Failed(RetrievalError::ScoringFailure {
                message: format!("unparseable score response: {:?}", truncate(&response, 40)),
            }),
        }
    }
}

#[async_trait]
impl Reranker for LlmReranker {
    async fn rerank(
        &self,
        query: &str,
        mut candidates: Vec<CandidatePassage>,
        keep_top_k: usize,
    ) -> RetrievalResult<Vec<CandidatePassage>> {
        if candidates.is_empty() {
            return Ok(candidates);
        }

        sort_by_distance(&mut candidates);
        let ceiling = self.ceiling.min(candidates.len());

        // join_all은 입력 순서대로 결과를 돌려주므로 완료 순서와 무관
        let outcomes = join_all(
            candidates[..ceiling]
                .iter()
                .map(|candidate| self.score_one(query, candidate)),
        )
        .await;

        let mut llm_scored = 0;
        let mut failures = 0;

        for (candidate, outcome) in candidates.iter_mut().zip(outcomes) {
            match outcome {
                ScoreOutcome::Scored(score) => {
                    candidate.relevance = Some(score);
                    candidate.score_source = Some(ScoreSource::Llm);
                    llm_scored += 1;
                }
                ScoreOutcome::Failed(e) => {
                    tracing::debug!(chunk_id = %candidate.chunk_id, error = %e, "Candidate scoring failed");
                    candidate.relevance = Some(fallback_score(candidate.distance));
                    candidate.score_source = Some(ScoreSource::DistanceFallback);
                    failures += 1;
                }
            }
        }

        for candidate in candidates.iter_mut().skip(ceiling) {
            candidate.relevance = Some(MIN_SCORE);
            candidate.score_source = Some(ScoreSource::Default);
        }

        if llm_scored == 0 {
            tracing::warn!(
                failures,
                "All rerank scoring calls failed, keeping distance order"
            );
            candidates.truncate(keep_top_k);
            return Ok(candidates);
        }

        if failures > 0 {
            tracing::warn!(llm_scored, failures, "Some rerank scoring calls failed");
        }

        sort_by_relevance(&mut candidates);
        candidates.truncate(keep_top_k);

        tracing::debug!(
            scored = llm_scored,
            kept = candidates.len(),
            "Reranked vector candidates"
        );
        Ok(candidates)
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// 점수 내림차순 → 거리 오름차순 → chunk_id
fn sort_by_relevance(candidates: &mut [CandidatePassage]) {
    candidates.sort_by(|a, b| {
        let sa = a.relevance.unwrap_or(MIN_SCORE);
        let sb = b.relevance.unwrap_or(MIN_SCORE);
        sb.partial_cmp(&sa)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                a.distance
                    .partial_cmp(&b.distance)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
}

/// 모델 응답에서 첫 숫자를 읽어 [0, 10]으로 클램프
///
/// 숫자가 없으면 `None` (호출자가 대체 점수 사용)
pub fn parse_score(response: &str) -> Option<f32> {
    static NUMBER: OnceLock<Regex> = OnceLock::new();
    let re = NUMBER.get_or_init(|| Regex::new(r"-?\d+(?:\.\d+)?").expect("Invalid regex"));

    let value: f32 = re.find(response)?.as_str().parse().ok()?;
    if !value.is_finite() {
        return None;
    }
    Some(value.clamp(MIN_SCORE, MAX_SCORE))
}

/// 거리 기반 대체 점수 (거리가 가까울수록 높음, 상수 아님)
///
/// 모든 metric에서 단조 감소하도록 `10 / (1 + d)`를 사용합니다.
pub fn fallback_score(distance: f32) -> f32 {
    let d = if distance.is_finite() { distance.max(0.0) } else { f32::MAX };
    MAX_SCORE / (1.0 + d)
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::Metadata;
    use std::collections::HashMap;

    /// 프롬프트에 포함된 chunk 텍스트로 점수를 정하는 가짜 점수 모델
    struct TableScorer {
        scores: HashMap<String, Result<String, ()>>,
        delay: Duration,
    }

    #[async_trait]
    impl LlmScorer for TableScorer {
        async fn complete(&self, prompt: &str) -> RetrievalResult<String> {
            tokio::time::sleep(self.delay).await;
            for (needle, result) in &self.scores {
                if prompt.contains(needle.as_str()) {
                    return result.clone().map_err(|_| RetrievalError::ScoringFailure {
                        message: "503".to_string(),
                    });
                }
            }
            Err(RetrievalError::ScoringFailure {
                message: "no entry".to_string(),
            })
        }

        fn model(&self) -> &str {
            "table"
        }
    }

    fn candidate(id: &str, distance: f32) -> CandidatePassage {
        CandidatePassage {
            chunk_id: id.to_string(),
            document_id: format!("doc-{}", id),
            collection: "policy".to_string(),
            text: format!("passage {}", id),
            metadata: Metadata::new(),
            distance,
            relevance: None,
            score_source: None,
        }
    }

    fn config(ceiling: usize) -> RetrievalConfig {
        RetrievalConfig {
            rerank_ceiling: ceiling,
            scoring_timeout_ms: 200,
            ..Default::default()
        }
    }

    fn reranker(entries: &[(&str, Result<&str, ()>)], ceiling: usize) -> LlmReranker {
        let scores = entries
            .iter()
            .map(|(k, v)| (format!("passage {}", k), v.map(|s| s.to_string())))
            .collect();
        LlmReranker::new(
            Arc::new(TableScorer {
                scores,
                delay: Duration::from_millis(1),
            }),
            &config(ceiling),
        )
    }

    #[test]
    fn test_parse_score() {
        assert_eq!(parse_score("7"), Some(7.0));
        assert_eq!(parse_score("Score: 8.5/10"), Some(8.5));
        assert_eq!(parse_score("15"), Some(10.0));
        assert_eq!(parse_score("-3"), Some(0.0));
        assert_eq!(parse_score("very relevant"), None);
    }

    #[test]
    fn test_fallback_score_monotonic() {
        let distances = [0.0, 0.1, 0.5, 1.0, 2.0, 40.0];
        let scores: Vec<f32> = distances.iter().map(|d| fallback_score(*d)).collect();
        assert!(scores.windows(2).all(|w| w[0] > w[1]));
        assert_eq!(fallback_score(0.0), MAX_SCORE);
    }

    #[tokio::test]
    async fn test_rerank_orders_by_llm_score() {
        let r = reranker(&[("a", Ok("2")), ("b", Ok("9")), ("c", Ok("5"))], 30);
        let out = r
            .rerank("q", vec![candidate("a", 0.1), candidate("b", 0.3), candidate("c", 0.2)], 10)
            .await
            .unwrap();
        let ids: Vec<&str> = out.iter().map(|c| c.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
        assert!(out.iter().all(|c| c.score_source == Some(ScoreSource::Llm)));
    }

    #[tokio::test]
    async fn test_ties_break_by_distance() {
        let r = reranker(&[("a", Ok("6")), ("b", Ok("6"))], 30);
        let out = r
            .rerank("q", vec![candidate("b", 0.4), candidate("a", 0.2)], 10)
            .await
            .unwrap();
        assert_eq!(out[0].chunk_id, "a");
    }

    #[tokio::test]
    async fn test_beyond_ceiling_kept_with_default_score() {
        let r = reranker(&[("a", Ok("1")), ("b", Ok("1"))], 2);
        let out = r
            .rerank(
                "q",
                vec![candidate("a", 0.1), candidate("b", 0.2), candidate("c", 0.3)],
                10,
            )
            .await
            .unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out[2].chunk_id, "c");
        assert_eq!(out[2].relevance, Some(0.0));
        assert_eq!(out[2].score_source, Some(ScoreSource::Default));
    }

    #[tokio::test]
    async fn test_single_failure_isolated() {
        let r = reranker(&[("a", Err(())), ("b", Ok("3"))], 30);
        let out = r
            .rerank("q", vec![candidate("a", 0.05), candidate("b", 0.5)], 10)
            .await
            .unwrap();
        let a = out.iter().find(|c| c.chunk_id == "a").unwrap();
        assert_eq!(a.score_source, Some(ScoreSource::DistanceFallback));
        assert!(a.relevance.unwrap() > 0.0);
        let b = out.iter().find(|c| c.chunk_id == "b").unwrap();
        assert_eq!(b.relevance, Some(3.0));
    }

    #[tokio::test]
    async fn test_total_failure_keeps_distance_order() {
        let r = reranker(&[], 30);
        let out = r
            .rerank(
                "q",
                vec![candidate("far", 0.9), candidate("near", 0.1), candidate("mid", 0.4)],
                2,
            )
            .await
            .unwrap();
        let ids: Vec<&str> = out.iter().map(|c| c.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["near", "mid"]);
        assert!(out[0].relevance >= out[1].relevance);
    }

    #[tokio::test]
    async fn test_slow_scorer_times_out_per_candidate() {
        let scorer = TableScorer {
            scores: HashMap::from([("passage a".to_string(), Ok("9".to_string()))]),
            delay: Duration::from_millis(500),
        };
        let r = LlmReranker::new(Arc::new(scorer), &config(30));
        let started = std::time::Instant::now();
        let out = r.rerank("q", vec![candidate("a", 0.1)], 10).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(450));
        assert_eq!(out[0].score_source, Some(ScoreSource::DistanceFallback));
    }

    #[tokio::test]
    async fn test_noop_reranker_sorts_and_truncates() {
        let out = NoOpReranker
            .rerank("q", vec![candidate("b", 0.5), candidate("a", 0.1)], 1)
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].chunk_id, "a");
    }
}
