//! Text Chunking Module
//!
//! 긴 문서를 겹치는 고정 크기 구간으로 나눕니다.
//!
//! - 크기/오버랩은 토큰 단위이며 고정 문자/토큰 비율로 근사합니다.
//! - 창 안에서 문장 끝(마침표, 물음표, 문단 경계)을 우선 경계로 사용하고,
//!   없으면 목표 크기에서 강제로 자릅니다.
//! - 청크 ID는 (네임스페이스, 레벨, 순번, 내용)의 SHA-256에서 파생되므로
//!   같은 입력을 다시 처리하면 같은 ID가 나옵니다 (멱등 재수집).

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

use super::model::{Chunk, ChunkLevel, Metadata};

// ============================================================================
// Chunk Configuration
// ============================================================================

/// 청킹 설정 (토큰 단위)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkConfig {
    /// 목표 청크 크기 (토큰)
    pub target_tokens: usize,
    /// 청크 간 오버랩 (토큰, target_tokens 미만)
    pub overlap_tokens: usize,
    /// 토큰당 문자 수 근사치
    pub chars_per_token: usize,
    /// 계층 청킹 시 상위 청크 크기 (토큰)
    pub parent_target_tokens: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self::for_retrieval()
    }
}

impl ChunkConfig {
    /// 임베딩 검색용 설정
    pub fn for_retrieval() -> Self {
        Self {
            target_tokens: 300,
            overlap_tokens: 40,
            chars_per_token: 4,
            parent_target_tokens: 1500,
        }
    }

    /// LLM 정규화기에 넣는 대형 규정 문서용 설정 (컨텍스트 상한 6000 토큰)
    pub fn for_llm_normalizer() -> Self {
        Self {
            target_tokens: 6000,
            overlap_tokens: 200,
            chars_per_token: 4,
            parent_target_tokens: 6000,
        }
    }

    /// 목표 크기 (바이트 근사)
    pub fn target_chars(&self) -> usize {
        (self.target_tokens * self.chars_per_token.max(1)).max(1)
    }

    /// 오버랩 크기 (바이트 근사, 항상 target_chars 미만)
    pub fn overlap_chars(&self) -> usize {
        let overlap = self.overlap_tokens * self.chars_per_token.max(1);
        overlap.min(self.target_chars().saturating_sub(1))
    }

    fn parent_config(&self) -> ChunkConfig {
        ChunkConfig {
            target_tokens: self.parent_target_tokens.max(self.target_tokens),
            overlap_tokens: 0,
            chars_per_token: self.chars_per_token,
            parent_target_tokens: self.parent_target_tokens,
        }
    }
}

// ============================================================================
// Chunker Trait
// ============================================================================

/// 텍스트 청킹 전략 트레이트
pub trait Chunker: Send + Sync {
    /// 텍스트를 청크로 분할
    ///
    /// `document_id`는 청크 ID 네임스페이스와 소유 문서 참조로 쓰이며,
    /// `metadata`는 모든 청크에 그대로 복사됩니다.
    fn chunk(&self, document_id: &str, text: &str, metadata: &Metadata) -> Vec<Chunk>;

    /// 청커 이름
    fn name(&self) -> &'static str;
}

// ============================================================================
// TokenChunker
// ============================================================================

/// 문장 경계 우선, 고정 크기 + 오버랩 청커
pub struct TokenChunker {
    config: ChunkConfig,
}

impl TokenChunker {
    pub fn new(config: ChunkConfig) -> Self {
        Self { config }
    }

    pub fn with_defaults() -> Self {
        Self::new(ChunkConfig::default())
    }

    /// 텍스트를 (start, end) 바이트 구간으로 분할
    ///
    /// 연속 구간은 항상 이전 구간의 끝 이하에서 시작하므로 빈틈이 없고,
    /// 시작점이 매번 증가하므로 반드시 종료합니다.
    fn spans(&self, text: &str) -> Vec<(usize, usize)> {
        let len = text.len();
        let target = self.config.target_chars();
        let overlap = self.config.overlap_chars();

        let mut spans = Vec::new();
        let mut start = 0;

        while start < len {
            let mut hard_end = floor_char_boundary(text, start + target);
            if hard_end <= start {
                // 목표 크기보다 긴 단일 문자
                hard_end = ceil_char_boundary(text, start + 1);
            }

            let end = if hard_end >= len {
                len
            } else {
                let min_end = start + target / 2;
                find_sentence_end(text, start, hard_end, min_end).unwrap_or(hard_end)
            };

            spans.push((start, end));

            if end >= len {
                break;
            }

            let next = floor_char_boundary(text, end.saturating_sub(overlap));
            start = if next > start { next } else { end };
        }

        spans
    }

    /// 레벨/순번 오프셋을 지정하여 청크 생성 (계층 청커에서 재사용)
    fn build_chunks(
        &self,
        document_id: &str,
        text: &str,
        base_offset: usize,
        level: ChunkLevel,
        first_index: usize,
        metadata: &Metadata,
    ) -> Vec<Chunk> {
        self.spans(text)
            .into_iter()
            .filter(|(s, e)| !text[*s..*e].trim().is_empty())
            .enumerate()
            .map(|(i, (s, e))| {
                let index = first_index + i;
                let body = &text[s..e];
                Chunk {
                    id: stable_chunk_id(document_id, level, index, body),
                    document_id: document_id.to_string(),
                    heading: None,
                    text: body.to_string(),
                    index,
                    level,
                    parent_id: None,
                    start: base_offset + s,
                    end: base_offset + e,
                    metadata: metadata.clone(),
                }
            })
            .collect()
    }
}

impl Chunker for TokenChunker {
    fn chunk(&self, document_id: &str, text: &str, metadata: &Metadata) -> Vec<Chunk> {
        if text.trim().is_empty() {
            return vec![];
        }
        self.build_chunks(document_id, text, 0, ChunkLevel::Child, 0, metadata)
    }

    fn name(&self) -> &'static str {
        "TokenChunker"
    }
}

// ============================================================================
// HierarchicalChunker
// ============================================================================

/// 계층 청커
///
/// Markdown 헤더 경계로 상위(parent) 청크를 만들고, 각 상위 청크를
/// 다시 하위(child) 청크로 나눕니다. 하위 청크는 `parent_id`로
/// 상위 청크를 참조합니다. 결과 순서: 상위, 그 하위들, 다음 상위 ...
pub struct HierarchicalChunker {
    parents: TokenChunker,
    children: TokenChunker,
}

impl HierarchicalChunker {
    pub fn new(config: ChunkConfig) -> Self {
        Self {
            parents: TokenChunker::new(config.parent_config()),
            children: TokenChunker::new(config),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ChunkConfig::default())
    }
}

impl Chunker for HierarchicalChunker {
    fn chunk(&self, document_id: &str, text: &str, metadata: &Metadata) -> Vec<Chunk> {
        if text.trim().is_empty() {
            return vec![];
        }

        let mut out = Vec::new();
        let mut parent_index = 0;
        let mut child_index = 0;

        for (section_start, section_end) in split_sections(text) {
            let section = &text[section_start..section_end];
            let heading = section_heading(section);

            let parents = self.parents.build_chunks(
                document_id,
                section,
                section_start,
                ChunkLevel::Parent,
                parent_index,
                metadata,
            );
            parent_index += parents.len();

            for mut parent in parents {
                parent.heading = heading.clone();

                let local_start = parent.start - section_start;
                let local_end = parent.end - section_start;
                let mut children = self.children.build_chunks(
                    document_id,
                    &section[local_start..local_end],
                    parent.start,
                    ChunkLevel::Child,
                    child_index,
                    metadata,
                );
                child_index += children.len();

                for child in &mut children {
                    child.parent_id = Some(parent.id.clone());
                    child.heading = heading.clone();
                }

                out.push(parent);
                out.extend(children);
            }
        }

        out
    }

    fn name(&self) -> &'static str {
        "HierarchicalChunker"
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// 청크 계약 함수: `chunk(text, target_size, overlap, metadata)`
///
/// 오버랩이 목표 크기 이상이면 진행을 보장할 수 없으므로 빈 결과 대신
/// 오버랩을 목표 크기 - 1 로 낮춥니다.
pub fn chunk_text(
    text: &str,
    target_tokens: usize,
    overlap_tokens: usize,
    metadata: &Metadata,
) -> Vec<Chunk> {
    let config = ChunkConfig {
        target_tokens: target_tokens.max(1),
        overlap_tokens: overlap_tokens.min(target_tokens.saturating_sub(1)),
        ..ChunkConfig::for_retrieval()
    };
    TokenChunker::new(config).chunk("", text, metadata)
}

/// 결정적 청크 ID
pub fn stable_chunk_id(namespace: &str, level: ChunkLevel, index: usize, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(namespace.as_bytes());
    hasher.update([0u8]);
    hasher.update(level.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(index.to_le_bytes());
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();

    let hex: String = digest[..16].iter().map(|b| format!("{:02x}", b)).collect();
    format!("chk_{}", hex)
}

/// [min_end, hard_end] 구간에서 마지막 문장 끝 위치 찾기
///
/// 문장 끝 = 종결 부호 뒤 공백, 또는 문단 경계(빈 줄). 반환값은 공백 직전 위치.
fn find_sentence_end(text: &str, start: usize, hard_end: usize, min_end: usize) -> Option<usize> {
    let window = &text[start..hard_end];
    let bytes = text.as_bytes();
    let mut best = None;

    for (i, c) in window.char_indices() {
        let pos = start + i;
        let after = pos + c.len_utf8();
        if after < min_end || after > hard_end {
            continue;
        }
        let next_is_space = bytes
            .get(after)
            .map(|b| b.is_ascii_whitespace())
            .unwrap_or(true);

        let is_terminal = matches!(c, '.' | '!' | '?' | ';' | '。') && next_is_space;
        let is_paragraph = c == '\n' && bytes.get(after) == Some(&b'\n');

        if is_terminal || is_paragraph {
            best = Some(after);
        }
    }

    best
}

/// Markdown 헤더 기준 섹션 구간 (코드 블록 내부 헤더는 무시)
fn split_sections(text: &str) -> Vec<(usize, usize)> {
    static HEADER_RE: OnceLock<Regex> = OnceLock::new();
    let header_re =
        HEADER_RE.get_or_init(|| Regex::new(r"^(#{1,6})\s+\S").expect("Invalid regex"));

    let mut sections = Vec::new();
    let mut section_start = 0;
    let mut offset = 0;
    let mut in_code_block = false;

    for line in text.split_inclusive('\n') {
        if line.trim_start().starts_with("```") {
            in_code_block = !in_code_block;
        }

        if !in_code_block
            && header_re.is_match(line)
            && offset > section_start
            && !text[section_start..offset].trim().is_empty()
        {
            sections.push((section_start, offset));
            section_start = offset;
        }

        offset += line.len();
    }

    if section_start < text.len() {
        sections.push((section_start, text.len()));
    }

    sections
}

/// 섹션 첫 줄이 헤더면 제목으로 사용
fn section_heading(section: &str) -> Option<String> {
    let first = section.trim_start().lines().next()?;
    let trimmed = first.trim_start();
    if trimmed.starts_with('#') {
        let heading = trimmed.trim_start_matches('#').trim();
        if !heading.is_empty() {
            return Some(heading.to_string());
        }
    }
    None
}

/// UTF-8 경계 조정 (인덱스 이하로)
#[inline]
fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        s.len()
    } else {
        let mut i = index;
        while i > 0 && !s.is_char_boundary(i) {
            i -= 1;
        }
        i
    }
}

/// UTF-8 경계 조정 (인덱스 이상으로)
#[inline]
fn ceil_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        s.len()
    } else {
        let mut i = index;
        while i < s.len() && !s.is_char_boundary(i) {
            i += 1;
        }
        i
    }
}

// ============================================================================
// Factory Functions
// ============================================================================

/// 기본 청커 생성 (계층)
pub fn default_chunker() -> Box<dyn Chunker> {
    Box::new(HierarchicalChunker::with_defaults())
}

/// 설정 지정 계층 청커 생성
pub fn hierarchical_chunker(config: ChunkConfig) -> Box<dyn Chunker> {
    Box::new(HierarchicalChunker::new(config))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn small_config() -> ChunkConfig {
        ChunkConfig {
            target_tokens: 10,
            overlap_tokens: 2,
            chars_per_token: 4,
            parent_target_tokens: 40,
        }
    }

    #[test]
    fn test_chunker_empty() {
        let chunker = TokenChunker::with_defaults();
        assert!(chunker.chunk("doc", "", &Metadata::new()).is_empty());
        assert!(chunker.chunk("doc", "   \n  ", &Metadata::new()).is_empty());
    }

    #[test]
    fn test_small_text_single_chunk() {
        let chunker = TokenChunker::with_defaults();
        let chunks = chunker.chunk("doc", "Short paragraph.", &Metadata::new());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].start, 0);
        assert_eq!(chunks[0].end, "Short paragraph.".len());
        assert_eq!(chunks[0].index, 0);
    }

    #[test]
    fn test_prefers_sentence_boundary() {
        let chunker = TokenChunker::new(small_config());
        // target 40 bytes; a sentence ends at byte 30
        let text = "The first sentence is right here. Then another sentence follows on.";
        let chunks = chunker.chunk("doc", text, &Metadata::new());
        assert!(chunks.len() >= 2);
        assert!(chunks[0].text.ends_with('.'));
    }

    #[test]
    fn test_hard_cut_without_punctuation() {
        let chunker = TokenChunker::new(small_config());
        let text = "x".repeat(100);
        let chunks = chunker.chunk("doc", &text, &Metadata::new());
        assert!(chunks.len() >= 3);
        assert_eq!(chunks[0].text.len(), 40);
        assert_eq!(chunks.last().map(|c| c.end), Some(100));
    }

    #[test]
    fn test_metadata_attached_verbatim() {
        let mut metadata = Metadata::new();
        metadata.insert("page".to_string(), json!(7));
        let chunker = TokenChunker::new(small_config());
        let chunks = chunker.chunk("doc", &"word ".repeat(40), &metadata);
        assert!(chunks.iter().all(|c| c.metadata == metadata));
    }

    #[test]
    fn test_multibyte_text_does_not_panic() {
        let chunker = TokenChunker::new(ChunkConfig {
            target_tokens: 1,
            overlap_tokens: 0,
            chars_per_token: 1,
            parent_target_tokens: 1,
        });
        let chunks = chunker.chunk("doc", "안녕하세요 세계", &Metadata::new());
        assert!(!chunks.is_empty());
        for c in &chunks {
            assert!(!c.text.is_empty());
        }
    }

    #[test]
    fn test_hierarchical_parent_child_links() {
        let chunker = HierarchicalChunker::new(small_config());
        let text = "# Admission\n\nThe day following admission is billed once. Documentation is kept.\n\n# Discharge\n\nDischarge day services are billed separately from visits.";
        let chunks = chunker.chunk("doc-1", text, &Metadata::new());

        let parents: Vec<&Chunk> = chunks.iter().filter(|c| c.level == ChunkLevel::Parent).collect();
        let children: Vec<&Chunk> = chunks.iter().filter(|c| c.level == ChunkLevel::Child).collect();

        assert_eq!(parents.len(), 2);
        assert_eq!(parents[0].heading.as_deref(), Some("Admission"));
        assert!(!children.is_empty());
        for child in children {
            let parent_id = child.parent_id.as_ref().unwrap();
            let parent = parents.iter().find(|p| &p.id == parent_id).unwrap();
            assert!(child.start >= parent.start && child.end <= parent.end);
            assert_eq!(&text[child.start..child.end], child.text);
            assert_eq!(child.document_id, "doc-1");
        }
    }

    #[test]
    fn test_headers_inside_code_block_ignored() {
        let text = "# Intro\n\ntext\n\n```\n# not a header\n```\n\nmore";
        let sections = split_sections(text);
        assert_eq!(sections.len(), 1);
    }

    #[test]
    fn test_llm_normalizer_preset() {
        let config = ChunkConfig::for_llm_normalizer();
        assert_eq!(config.target_tokens, 6000);
        assert_eq!(config.overlap_tokens, 200);
        assert!(config.overlap_chars() < config.target_chars());
    }

    #[test]
    fn test_chunk_text_contract_clamps_overlap() {
        let chunks = chunk_text(&"abc ".repeat(50), 5, 50, &Metadata::new());
        assert!(!chunks.is_empty());
    }

    #[test]
    fn test_floor_char_boundary() {
        let s = "Hello, 세계!";
        assert_eq!(floor_char_boundary(s, 5), 5);
        assert_eq!(floor_char_boundary(s, 100), s.len());
        assert_eq!(floor_char_boundary("", 0), 0);
        assert_eq!(floor_char_boundary(s, 8), 7);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn chunking_is_idempotent(text in "[a-zA-Z .,!?\n]{0,600}", target in 2usize..40, overlap in 0usize..10) {
            let config = ChunkConfig {
                target_tokens: target,
                overlap_tokens: overlap.min(target - 1),
                chars_per_token: 2,
                parent_target_tokens: target * 3,
            };
            let chunker = HierarchicalChunker::new(config);
            let first = chunker.chunk("doc", &text, &Metadata::new());
            let second = chunker.chunk("doc", &text, &Metadata::new());
            prop_assert_eq!(first, second);
        }

        #[test]
        fn chunks_cover_all_content(text in "[a-z .\n]{1,600}", target in 2usize..40, overlap in 0usize..10) {
            let config = ChunkConfig {
                target_tokens: target,
                overlap_tokens: overlap.min(target - 1),
                chars_per_token: 2,
                parent_target_tokens: target * 3,
            };
            let chunks = TokenChunker::new(config).chunk("doc", &text, &Metadata::new());

            for (i, b) in text.bytes().enumerate() {
                if b.is_ascii_whitespace() {
                    continue;
                }
                prop_assert!(
                    chunks.iter().any(|c| c.start <= i && i < c.end),
                    "byte {} not covered", i
                );
            }
            for c in &chunks {
                prop_assert_eq!(&text[c.start..c.end], c.text.as_str());
            }
        }
    }
}
