//! 점수 모듈 - LLM 관련성 점수 호출
//!
//! 재순위기가 후보 하나마다 프롬프트를 보내고 텍스트 응답을 받습니다.
//! 응답 해석(숫자 파싱/클램프)은 재순위기의 몫이고, 여기서는 전송만 담당합니다.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::embedding::{gemini_error_message, get_api_key};
use crate::error::{RetrievalError, RetrievalResult};

/// Gemini generateContent 엔드포인트
/// source: https://ai.google.dev/api/generate-content
const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";

// ============================================================================
// LlmScorer Trait
// ============================================================================

/// 점수 모델 인터페이스
#[async_trait]
pub trait LlmScorer: Send + Sync {
    /// 프롬프트를 보내고 모델의 텍스트 응답을 반환
    async fn complete(&self, prompt: &str) -> RetrievalResult<String>;

    /// 모델 식별자
    fn model(&self) -> &str;
}

// ============================================================================
// Gemini Scorer
// ============================================================================

/// Gemini 기반 점수 모델
#[derive(Debug)]
pub struct GeminiScorer {
    api_key: String,
    client: reqwest::Client,
    model: String,
}

impl GeminiScorer {
    /// # Arguments
    /// * `api_key` - Google AI API 키
    /// * `model` - 모델 식별자 (예: gemini-2.0-flash)
    /// * `timeout` - HTTP 요청 타임아웃
    pub fn new(api_key: String, model: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            api_key,
            client,
            model: model.into(),
        })
    }

    /// 환경변수에서 API 키를 읽어 생성
    pub fn from_env(model: impl Into<String>, timeout: Duration) -> Result<Self> {
        Self::new(get_api_key()?, model, timeout)
    }

    fn failure(&self, message: impl Into<String>) -> RetrievalError {
        RetrievalError::ScoringFailure {
            message: format!("{}: {}", self.model, message.into()),
        }
    }
}

#[async_trait]
impl LlmScorer for GeminiScorer {
    async fn complete(&self, prompt: &str) -> RetrievalResult<String> {
        let request = GenerateRequest {
            contents: vec![Content {
                parts: vec![Part {
                    text: prompt.to_string(),
                }],
            }],
            generation_config: GenerationConfig {
                temperature: 0.0,
                max_output_tokens: 16,
            },
        };

        let url = format!("{}/{}:generateContent", GEMINI_API_BASE, self.model);
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.failure(format!("request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| self.failure(format!("failed to read body: {}", e)))?;

        if !status.is_success() {
            let message = gemini_error_message(status, &body);
            // 인증 실패는 후보 단위로 흡수할 수 없음
            if matches!(status.as_u16(), 401 | 403) {
                return Err(RetrievalError::Provider {
                    provider: self.model.clone(),
                    message,
                });
            }
            return Err(self.failure(message));
        }

        let parsed: GenerateResponse = serde_json::from_str(&body)
            .map_err(|e| self.failure(format!("failed to parse response: {}", e)))?;

        parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content.parts.into_iter().next())
            .map(|p| p.text)
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| self.failure("empty response"))
    }

    fn model(&self) -> &str {
        &self.model
    }
}

// ============================================================================
// API Types
// ============================================================================

#[derive(Debug, Serialize)]
struct GenerateRequest {
    contents: Vec<Content>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    temperature: f32,
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Content,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_shape() {
        let request = GenerateRequest {
            contents: vec![Content {
                parts: vec![Part {
                    text: "score".to_string(),
                }],
            }],
            generation_config: GenerationConfig {
                temperature: 0.0,
                max_output_tokens: 16,
            },
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["contents"][0]["parts"][0]["text"], "score");
        assert_eq!(json["generationConfig"]["maxOutputTokens"], 16);
    }

    #[test]
    fn test_response_parsing_tolerates_missing_parts() {
        let body = r#"{"candidates":[{"content":{"role":"model"}}]}"#;
        let parsed: GenerateResponse = serde_json::from_str(body).unwrap();
        assert!(parsed.candidates[0].content.parts.is_empty());

        let body = r#"{"candidates":[{"content":{"parts":[{"text":"7"}]}}]}"#;
        let parsed: GenerateResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.candidates[0].content.parts[0].text, "7");
    }
}
