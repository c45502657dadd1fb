//! 임베딩 모듈 - Gemini API를 통한 텍스트 벡터화
//!
//! 텍스트를 고정 크기 배치로 묶어 임베딩하고, 입력과 같은 순서/길이의 결과를 돌려줍니다.
//! 실패한 배치의 항목은 영벡터가 아니라 [`Embedding::Failed`]로 표시되어,
//! 호출자가 "임베딩 없음"과 "유효한 벡터"를 구분할 수 있습니다.
//!
//! ## 사용법
//! ```rust,ignore
//! let embedder = GeminiEmbedding::from_env(&EmbeddingConfig::default())?;
//! let results = embed_all(&embedder, &texts, 100, EmbedTask::Document).await?;
//! ```

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::EmbeddingConfig;
use crate::error::{RetrievalError, RetrievalResult};
use crate::knowledge::CollectionSpec;

// ============================================================================
// Types
// ============================================================================

/// 임베딩 결과 - 벡터 또는 실패 표시
#[derive(Debug, Clone, PartialEq)]
pub enum Embedding {
    Vector(Vec<f32>),
    Failed { reason: String },
}

impl Embedding {
    pub fn as_vector(&self) -> Option<&[f32]> {
        match self {
            Embedding::Vector(v) => Some(v),
            Embedding::Failed { .. } => None,
        }
    }

    pub fn into_vector(self) -> Option<Vec<f32>> {
        match self {
            Embedding::Vector(v) => Some(v),
            Embedding::Failed { .. } => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Embedding::Failed { .. })
    }
}

/// 임베딩 용도 (Gemini taskType)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedTask {
    Document,
    Query,
}

impl EmbedTask {
    fn as_gemini(&self) -> &'static str {
        match self {
            EmbedTask::Document => "RETRIEVAL_DOCUMENT",
            EmbedTask::Query => "RETRIEVAL_QUERY",
        }
    }

    /// 호출 간격 조절 대상 여부 (쿼리는 간격 없이 보내고 429는 재시도로 처리)
    fn paced(&self) -> bool {
        matches!(self, EmbedTask::Document)
    }
}

// ============================================================================
// EmbeddingProvider Trait
// ============================================================================

/// 임베딩 프로바이더 트레이트
///
/// 한 번의 호출이 한 배치입니다. 반환 벡터 수는 입력 수와 같아야 합니다.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// 배치 임베딩
    async fn embed_batch(&self, texts: &[String], task: EmbedTask) -> RetrievalResult<Vec<Vec<f32>>>;

    /// 단일 쿼리 임베딩
    async fn embed_query(&self, text: &str) -> RetrievalResult<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()], EmbedTask::Query).await?;
        vectors.pop().ok_or_else(|| RetrievalError::EmbeddingFailure {
            provider: self.model().to_string(),
            message: "provider returned no vector for query".to_string(),
        })
    }

    /// 임베딩 차원 수
    fn dimension(&self) -> usize;

    /// 모델 식별자 (수집/쿼리 모두 같은 값)
    fn model(&self) -> &str;
}

// ============================================================================
// Batch Embedding
// ============================================================================

/// 텍스트 전체를 배치 단위로 임베딩
///
/// - 결과는 입력과 같은 순서, 같은 길이
/// - 배치 실패 시 해당 배치 항목만 `Failed`로 표시하고 계속 진행
/// - 빈 텍스트는 호출 없이 `Failed`
/// - 모든 배치가 실패하거나, 시스템 단위 에러(인증 등)면 에러 반환
/// - 벡터 길이가 선언 차원과 다르면 `DimensionMismatch`
pub async fn embed_all(
    provider: &dyn EmbeddingProvider,
    texts: &[String],
    batch_size: usize,
    task: EmbedTask,
) -> RetrievalResult<Vec<Embedding>> {
    let mut results: Vec<Embedding> = texts
        .iter()
        .map(|_| Embedding::Failed {
            reason: "empty text".to_string(),
        })
        .collect();

    // 비어 있지 않은 텍스트의 원래 위치
    let positions: Vec<usize> = texts
        .iter()
        .enumerate()
        .filter(|(_, t)| !t.trim().is_empty())
        .map(|(i, _)| i)
        .collect();

    if positions.is_empty() {
        return Ok(results);
    }

    let batch_size = batch_size.max(1);
    let total_batches = positions.len().div_ceil(batch_size);
    let mut failed_batches = 0;
    let mut last_error: Option<RetrievalError> = None;

    for (batch_no, batch) in positions.chunks(batch_size).enumerate() {
        let batch_texts: Vec<String> = batch.iter().map(|&i| texts[i].clone()).collect();
        tracing::debug!("Embedding batch {}/{} ({} texts)", batch_no + 1, total_batches, batch.len());

        match provider.embed_batch(&batch_texts, task).await {
            Ok(vectors) if vectors.len() == batch.len() => {
                for (&i, vector) in batch.iter().zip(vectors) {
                    if vector.len() != provider.dimension() {
                        return Err(RetrievalError::DimensionMismatch {
                            collection: provider.model().to_string(),
                            expected: provider.dimension(),
                            actual: vector.len(),
                        });
                    }
                    results[i] = Embedding::Vector(vector);
                }
            }
            Ok(vectors) => {
                let reason = format!("provider returned {} vectors for {} texts", vectors.len(), batch.len());
                tracing::warn!("Embedding batch {} malformed: {}", batch_no + 1, reason);
                mark_failed(&mut results, batch, &reason);
                failed_batches += 1;
            }
            Err(e) if e.is_systemic() => return Err(e),
            Err(e) => {
                tracing::warn!("Embedding batch {} failed: {}", batch_no + 1, e);
                mark_failed(&mut results, batch, &e.to_string());
                failed_batches += 1;
                last_error = Some(e);
            }
        }
    }

    if failed_batches == total_batches {
        return Err(RetrievalError::Provider {
            provider: provider.model().to_string(),
            message: format!(
                "all {} embedding batches failed{}",
                total_batches,
                last_error.map(|e| format!(": {}", e)).unwrap_or_default()
            ),
        });
    }

    Ok(results)
}

fn mark_failed(results: &mut [Embedding], positions: &[usize], reason: &str) {
    for &i in positions {
        results[i] = Embedding::Failed {
            reason: reason.to_string(),
        };
    }
}

/// 프로바이더 차원과 컬렉션 선언 차원이 같은지 확인
pub fn validate_dimension(provider: &dyn EmbeddingProvider, spec: &CollectionSpec) -> RetrievalResult<()> {
    spec.check_dimension(provider.dimension())
}

// ============================================================================
// Google Gemini Embedding
// ============================================================================

/// Gemini 배치 임베딩 API 엔드포인트
/// source: https://ai.google.dev/api/embeddings#method:-models.batchembedcontents
const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// 배치 호출 간격 (무료 티어 60 RPM)
const REQUEST_INTERVAL: Duration = Duration::from_secs(1);
/// 재시도 시 첫 백오프, 이후 두 배씩
const INITIAL_BACKOFF: Duration = Duration::from_secs(2);

/// Google Gemini 임베딩 구현체
///
/// source: https://ai.google.dev/gemini-api/docs/embeddings
#[derive(Debug)]
pub struct GeminiEmbedding {
    api_key: String,
    client: reqwest::Client,
    model: String,
    dimension: usize,
    max_attempts: u32,
    pacer: Pacer,
}

/// 호출 간격 조절
///
/// 호출자마다 다음 슬롯을 예약하고 잠금을 푼 뒤 그 시각까지 잠듭니다.
/// 동시에 들어온 배치도 `interval` 간격으로 줄을 섭니다.
#[derive(Debug)]
struct Pacer {
    interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl Pacer {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_slot: Mutex::new(None),
        }
    }

    async fn wait(&self) {
        let slot = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = next.map_or(now, |n| n.max(now));
            *next = Some(slot + self.interval);
            slot
        };

        let now = Instant::now();
        if slot > now {
            tracing::debug!(wait_ms = (slot - now).as_millis() as u64, "Pacing embedding request");
            tokio::time::sleep_until(slot.into()).await;
        }
    }
}

impl GeminiEmbedding {
    /// 새 Gemini 임베딩 인스턴스 생성
    ///
    /// # Arguments
    /// * `api_key` - Google AI API 키
    /// * `config` - 모델/차원/시도 횟수
    pub fn new(api_key: String, config: &EmbeddingConfig) -> Result<Self> {
        // gemini-embedding-001 MRL 지원 차원
        if ![768, 1536, 3072].contains(&config.dimension) {
            anyhow::bail!(
                "Invalid dimension: {}. Must be 768, 1536, or 3072",
                config.dimension
            );
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            api_key,
            client,
            model: config.model.clone(),
            dimension: config.dimension,
            max_attempts: config.max_attempts.max(1),
            pacer: Pacer::new(REQUEST_INTERVAL),
        })
    }

    /// 환경변수에서 API 키를 읽어 생성
    ///
    /// 우선순위: GEMINI_API_KEY > GOOGLE_AI_API_KEY
    pub fn from_env(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = get_api_key()?;
        Self::new(api_key, config)
    }

    fn endpoint(&self) -> String {
        format!("{}/{}:batchEmbedContents", GEMINI_API_BASE, self.model)
    }

    fn failure(&self, message: impl Into<String>) -> RetrievalError {
        RetrievalError::EmbeddingFailure {
            provider: self.model.clone(),
            message: message.into(),
        }
    }
}

/// Gemini 배치 요청 본문
/// source: https://ai.google.dev/api/embeddings#method:-models.batchembedcontents
#[derive(Debug, Serialize)]
struct BatchEmbedRequest {
    requests: Vec<EmbedRequest>,
}

#[derive(Debug, Serialize)]
struct EmbedRequest {
    model: String,
    content: EmbedContent,
    #[serde(rename = "taskType")]
    task_type: &'static str,
    #[serde(rename = "outputDimensionality")]
    output_dimensionality: usize,
}

#[derive(Debug, Serialize)]
struct EmbedContent {
    parts: Vec<EmbedPart>,
}

#[derive(Debug, Serialize)]
struct EmbedPart {
    text: String,
}

/// Gemini 배치 응답
#[derive(Debug, Deserialize)]
struct BatchEmbedResponse {
    #[serde(default)]
    embeddings: Vec<EmbeddingValues>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingValues {
    values: Vec<f32>,
}

/// Gemini API 에러 응답
#[derive(Debug, Deserialize)]
pub(crate) struct GeminiError {
    pub(crate) error: GeminiErrorDetail,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GeminiErrorDetail {
    pub(crate) message: String,
    #[serde(default)]
    pub(crate) status: String,
}

/// 에러 응답 본문에서 메시지 추출
pub(crate) fn gemini_error_message(status: reqwest::StatusCode, body: &str) -> String {
    match serde_json::from_str::<GeminiError>(body) {
        Ok(error) => format!("{} ({})", error.error.message, error.error.status),
        Err(_) => format!("HTTP {}: {}", status, body.chars().take(200).collect::<String>()),
    }
}

#[async_trait]
impl EmbeddingProvider for GeminiEmbedding {
    async fn embed_batch(&self, texts: &[String], task: EmbedTask) -> RetrievalResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let model_ref = format!("models/{}", self.model);
        let request = BatchEmbedRequest {
            requests: texts
                .iter()
                .map(|text| EmbedRequest {
                    model: model_ref.clone(),
                    content: EmbedContent {
                        parts: vec![EmbedPart { text: text.clone() }],
                    },
                    task_type: task.as_gemini(),
                    output_dimensionality: self.dimension,
                })
                .collect(),
        };

        let mut last_error: Option<RetrievalError> = None;

        // 재시도 루프 (429/5xx/네트워크 에러 시 지수 백오프)
        for attempt in 0..self.max_attempts {
            if attempt > 0 {
                let backoff = INITIAL_BACKOFF * 2u32.pow(attempt - 1);
                tracing::warn!(
                    "Retrying embedding batch in {:?} (attempt {}/{})",
                    backoff,
                    attempt + 1,
                    self.max_attempts
                );
                tokio::time::sleep(backoff).await;
            }

            if task.paced() {
                self.pacer.wait().await;
            }

            // API 키는 URL이 아닌 헤더로 전송
            let response = match self
                .client
                .post(self.endpoint())
                .header("x-goog-api-key", &self.api_key)
                .json(&request)
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(e) => {
                    last_error = Some(self.failure(format!("request failed: {}", e)));
                    continue;
                }
            };

            let status = response.status();
            let body = response
                .text()
                .await
                .map_err(|e| self.failure(format!("failed to read response body: {}", e)))?;

            if status.is_success() {
                let parsed: BatchEmbedResponse = serde_json::from_str(&body)
                    .map_err(|e| self.failure(format!("failed to parse response: {}", e)))?;
                return Ok(parsed.embeddings.into_iter().map(|e| e.values).collect());
            }

            let message = gemini_error_message(status, &body);
            match status.as_u16() {
                // 인증/권한 실패는 재시도해도 복구 불가
                401 | 403 => {
                    return Err(RetrievalError::Provider {
                        provider: self.model.clone(),
                        message,
                    });
                }
                429 | 500..=599 => {
                    tracing::warn!("Embedding provider returned {}: {}", status, message);
                    last_error = Some(self.failure(message));
                }
                _ => return Err(self.failure(message)),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            self.failure(format!("embedding failed after {} attempts", self.max_attempts))
        }))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model(&self) -> &str {
        &self.model
    }
}

// ============================================================================
// API Key Management
// ============================================================================

/// API 키 로드 (환경변수에서)
///
/// 우선순위:
/// 1. `GEMINI_API_KEY` 환경변수
/// 2. `GOOGLE_AI_API_KEY` 환경변수
pub fn get_api_key() -> Result<String> {
    for var in ["GEMINI_API_KEY", "GOOGLE_AI_API_KEY"] {
        if let Ok(key) = std::env::var(var) {
            if !key.is_empty() {
                tracing::debug!("Using API key from {}", var);
                return Ok(key);
            }
        }
    }

    anyhow::bail!(
        "API key not found. Set GEMINI_API_KEY or GOOGLE_AI_API_KEY environment variable.\n\
         Get your API key at: https://aistudio.google.com/app/apikey"
    )
}

/// API 키 존재 여부 확인
pub fn has_api_key() -> bool {
    ["GEMINI_API_KEY", "GOOGLE_AI_API_KEY"]
        .iter()
        .any(|var| std::env::var(var).map(|k| !k.is_empty()).unwrap_or(false))
}

// ============================================================================
// Factory Function
// ============================================================================

/// 임베딩 프로바이더 생성 (Gemini API)
pub fn create_embedder(config: &EmbeddingConfig) -> Result<GeminiEmbedding> {
    if !has_api_key() {
        anyhow::bail!(
            "GEMINI_API_KEY or GOOGLE_AI_API_KEY not set.\n\
             Set: export GEMINI_API_KEY=your-api-key\n\
             Get your API key at: https://aistudio.google.com/app/apikey"
        );
    }

    let embedder = GeminiEmbedding::from_env(config)?;
    tracing::info!(
        "Using Gemini embedding model {} (dimension: {})",
        embedder.model(),
        embedder.dimension()
    );
    Ok(embedder)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 지정한 배치 번호에서 실패하는 가짜 프로바이더
    struct FlakyProvider {
        dimension: usize,
        fail_batches: Vec<usize>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for FlakyProvider {
        async fn embed_batch(&self, texts: &[String], _task: EmbedTask) -> RetrievalResult<Vec<Vec<f32>>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_batches.contains(&call) {
                return Err(RetrievalError::EmbeddingFailure {
                    provider: "fake".to_string(),
                    message: "503".to_string(),
                });
            }
            Ok(texts
                .iter()
                .map(|t| {
                    let mut v = vec![0.0; self.dimension];
                    v[0] = t.len() as f32;
                    v
                })
                .collect())
        }

        fn dimension(&self) -> usize {
            self.dimension
        }

        fn model(&self) -> &str {
            "fake"
        }
    }

    fn provider(fail_batches: Vec<usize>) -> FlakyProvider {
        FlakyProvider {
            dimension: 4,
            fail_batches,
            calls: AtomicUsize::new(0),
        }
    }

    #[tokio::test]
    async fn test_embed_all_preserves_order_and_marks_failed_batch() {
        let texts: Vec<String> = (1..=5).map(|n| "x".repeat(n)).collect();
        let results = embed_all(&provider(vec![1]), &texts, 2, EmbedTask::Document)
            .await
            .unwrap();

        assert_eq!(results.len(), 5);
        assert_eq!(results[0].as_vector().map(|v| v[0]), Some(1.0));
        assert_eq!(results[1].as_vector().map(|v| v[0]), Some(2.0));
        assert!(results[2].is_failed());
        assert!(results[3].is_failed());
        assert_eq!(results[4].as_vector().map(|v| v[0]), Some(5.0));
    }

    #[tokio::test]
    async fn test_embed_all_blank_text_is_failed_without_call() {
        let p = provider(vec![]);
        let texts = vec!["  ".to_string(), "abc".to_string()];
        let results = embed_all(&p, &texts, 10, EmbedTask::Document).await.unwrap();
        assert!(results[0].is_failed());
        assert!(!results[1].is_failed());
        assert_eq!(p.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_embed_all_total_failure_is_systemic() {
        let texts = vec!["a".to_string(), "b".to_string()];
        let err = embed_all(&provider(vec![0]), &texts, 10, EmbedTask::Document)
            .await
            .unwrap_err();
        assert!(err.is_systemic());
    }

    #[tokio::test]
    async fn test_validate_dimension() {
        let p = provider(vec![]);
        assert!(validate_dimension(&p, &CollectionSpec::cosine("c", 4)).is_ok());
        assert!(matches!(
            validate_dimension(&p, &CollectionSpec::cosine("c", 768)),
            Err(RetrievalError::DimensionMismatch { expected: 768, actual: 4, .. })
        ));
    }

    #[test]
    fn test_invalid_dimension() {
        let config = EmbeddingConfig {
            dimension: 999,
            ..Default::default()
        };
        let err = GeminiEmbedding::new("fake_key".to_string(), &config).unwrap_err();
        assert!(err.to_string().contains("Invalid dimension"));
    }

    #[test]
    fn test_valid_dimensions() {
        for dimension in [768, 1536, 3072] {
            let config = EmbeddingConfig {
                dimension,
                ..Default::default()
            };
            assert!(GeminiEmbedding::new("fake_key".to_string(), &config).is_ok());
        }
    }

    #[test]
    fn test_only_document_batches_are_paced() {
        assert!(EmbedTask::Document.paced());
        assert!(!EmbedTask::Query.paced());
    }

    #[tokio::test]
    async fn test_pacer_spaces_requests() {
        let pacer = Pacer::new(Duration::from_millis(40));
        let started = Instant::now();
        for _ in 0..3 {
            pacer.wait().await;
        }
        // 첫 호출은 바로, 이후 두 번은 간격만큼
        assert!(started.elapsed() >= Duration::from_millis(80));
    }

    #[test]
    fn test_gemini_error_message() {
        let body = r#"{"error":{"message":"API key not valid","status":"INVALID_ARGUMENT"}}"#;
        let msg = gemini_error_message(reqwest::StatusCode::BAD_REQUEST, body);
        assert_eq!(msg, "API key not valid (INVALID_ARGUMENT)");
    }
}
