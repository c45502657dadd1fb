//! 엔진 설정
//!
//! 기본값 → JSON 설정 파일 → 환경변수 순서로 덮어씁니다.
//!
//! - `MEDGUIDE_CONFIG`: 설정 파일 경로 (없으면 `<data_dir>/config.json`)
//! - `MEDGUIDE_DATA_DIR`: 데이터 디렉토리
//! - `MEDGUIDE_EMBEDDING_MODEL`, `MEDGUIDE_SCORING_MODEL`: 모델 식별자

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::RetrievalError;
use crate::knowledge::{get_data_dir, ChunkConfig};
use crate::retrieval::{ConfidenceConfig, ResolutionPolicy};

// ============================================================================
// Sections
// ============================================================================

/// 임베딩 설정
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// 모든 호출에 동일하게 사용하는 모델 식별자
    pub model: String,
    /// 모델 출력 차원 (컬렉션 선언 차원과 일치해야 함)
    pub dimension: usize,
    /// 프로바이더 호출당 텍스트 수
    pub batch_size: usize,
    /// 배치당 최대 시도 횟수
    pub max_attempts: u32,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: "gemini-embedding-001".to_string(),
            dimension: 768,
            batch_size: 100,
            max_attempts: 3,
        }
    }
}

/// 검색/재순위 설정
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrievalConfig {
    /// 벡터 검색 recall 폭 (컬렉션당 top_k)
    pub recall_top_k: usize,
    /// LLM 점수를 매기는 후보 상한
    pub rerank_ceiling: usize,
    /// 재순위 후 유지하는 후보 수
    pub keep_top_k: usize,
    /// 점수 프롬프트에 넣는 본문 발췌 길이 (문자)
    pub excerpt_chars: usize,
    /// 후보 하나의 점수 호출 제한 시간
    pub scoring_timeout_ms: u64,
    /// 동시에 진행하는 점수 호출 수
    pub scoring_concurrency: usize,
    /// 점수 모델 식별자
    pub scoring_model: String,
    /// structured 저장소 쿼리 제한 시간
    pub structured_timeout_ms: u64,
    /// structured 저장소 동시 작업자 수
    pub structured_workers: usize,
    /// structured 검색 최대 행 수
    pub structured_limit: usize,
    /// 하이라이트로 뽑는 상위 섹션 수
    pub highlight_count: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            recall_top_k: 50,
            rerank_ceiling: 30,
            keep_top_k: 10,
            excerpt_chars: 500,
            scoring_timeout_ms: 8_000,
            scoring_concurrency: 30,
            scoring_model: "gemini-2.0-flash".to_string(),
            structured_timeout_ms: 500,
            structured_workers: 5,
            structured_limit: 20,
            highlight_count: 3,
        }
    }
}

// ============================================================================
// EngineConfig
// ============================================================================

/// 엔진 전체 설정
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    pub embedding: EmbeddingConfig,
    pub chunking: ChunkConfig,
    pub retrieval: RetrievalConfig,
    pub confidence: ConfidenceConfig,
    pub conflict_policy: ResolutionPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: get_data_dir(),
            embedding: EmbeddingConfig::default(),
            chunking: ChunkConfig::for_retrieval(),
            retrieval: RetrievalConfig::default(),
            confidence: ConfidenceConfig::default(),
            conflict_policy: ResolutionPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// 기본값 + 설정 파일 + 환경변수로 설정 로드
    pub fn load() -> Result<Self> {
        let data_dir = std::env::var("MEDGUIDE_DATA_DIR")
            .ok()
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        let file_path = std::env::var("MEDGUIDE_CONFIG")
            .ok()
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                data_dir
                    .clone()
                    .unwrap_or_else(get_data_dir)
                    .join("config.json")
            });

        let mut config = if file_path.exists() {
            Self::from_file(&file_path)?
        } else {
            Self::default()
        };

        if let Some(dir) = data_dir {
            config.data_dir = dir;
        }
        if let Ok(model) = std::env::var("MEDGUIDE_EMBEDDING_MODEL") {
            if !model.is_empty() {
                config.embedding.model = model;
            }
        }
        if let Ok(model) = std::env::var("MEDGUIDE_SCORING_MODEL") {
            if !model.is_empty() {
                config.retrieval.scoring_model = model;
            }
        }

        config.validate()?;
        tracing::debug!("Loaded engine config (data_dir={:?})", config.data_dir);
        Ok(config)
    }

    /// JSON 파일에서 설정 읽기 (누락 필드는 기본값)
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        Ok(config)
    }

    /// 설정 일관성 검증
    pub fn validate(&self) -> Result<(), RetrievalError> {
        if self.chunking.overlap_tokens >= self.chunking.target_tokens {
            return Err(RetrievalError::Config(format!(
                "chunk overlap ({}) must be less than chunk target ({})",
                self.chunking.overlap_tokens, self.chunking.target_tokens
            )));
        }
        if self.chunking.chars_per_token == 0 {
            return Err(RetrievalError::Config(
                "chars_per_token must be greater than zero".to_string(),
            ));
        }
        if self.embedding.batch_size == 0 {
            return Err(RetrievalError::Config(
                "embedding batch_size must be greater than zero".to_string(),
            ));
        }
        if self.embedding.dimension == 0 {
            return Err(RetrievalError::Config(
                "embedding dimension must be greater than zero".to_string(),
            ));
        }
        if self.retrieval.recall_top_k == 0 || self.retrieval.keep_top_k == 0 {
            return Err(RetrievalError::Config(
                "recall_top_k and keep_top_k must be greater than zero".to_string(),
            ));
        }
        if self.retrieval.structured_workers == 0 || self.retrieval.scoring_concurrency == 0 {
            return Err(RetrievalError::Config(
                "worker counts must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// structured DB 경로
    pub fn structured_db_path(&self) -> PathBuf {
        self.data_dir.join("structured.db")
    }

    /// LanceDB 디렉토리 경로
    pub fn vector_path(&self) -> PathBuf {
        self.data_dir.join("vectors.lance")
    }
}

// ============================================================================
// Tests
// ============================================================================
