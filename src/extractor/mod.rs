//! 본문 추출
//!
//! 수집된 파일을 페이지 단위 본문으로 바꿉니다. 텍스트 파일은 페이지 번호 없는
//! 한 덩어리, PDF는 페이지마다 하나씩이며 그 번호가 인용 위치로 이어집니다.

pub mod pdf;

use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use regex::Regex;

use crate::collector::{CollectedFile, FileType};

/// 페이지 단위 본문 (페이지 번호를 모르면 None)
#[derive(Debug, Clone, PartialEq)]
pub struct PageText {
    pub page: Option<u32>,
    pub text: String,
}

impl PageText {
    pub fn unpaged(text: impl Into<String>) -> Self {
        Self {
            page: None,
            text: text.into(),
        }
    }
}

/// 파일 하나의 본문 추출
pub async fn extract_pages(file: &CollectedFile) -> Result<Vec<PageText>> {
    match file.file_type {
        FileType::Text => {
            let raw = tokio::fs::read_to_string(&file.path)
                .await
                .with_context(|| format!("Failed to read {:?}", file.path))?;
            Ok(vec![PageText::unpaged(normalize_text(&raw, is_html(&file.path)))])
        }
        FileType::Pdf => {
            // pdf-extract는 동기 + CPU 바운드
            let path = file.path.clone();
            let pages = tokio::task::spawn_blocking(move || pdf::extract_text_from_pdf(&path))
                .await
                .context("PDF extraction task panicked")??;
            tracing::debug!(path = ?file.path, pages = pages.len(), "Extracted PDF pages");

            Ok(pages
                .into_iter()
                .map(|(page, text)| PageText {
                    page: u32::try_from(page).ok(),
                    text,
                })
                .collect())
        }
    }
}

fn is_html(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("html") || e.eq_ignore_ascii_case("htm"))
}

/// BOM/CRLF 정리, HTML 저장본이면 태그 제거
fn normalize_text(raw: &str, html: bool) -> String {
    let text = raw.trim_start_matches('\u{feff}').replace("\r\n", "\n");
    if !html {
        return text;
    }

    static SCRIPT: OnceLock<Regex> = OnceLock::new();
    static BLOCK: OnceLock<Regex> = OnceLock::new();
    static TAG: OnceLock<Regex> = OnceLock::new();
    static BLANKS: OnceLock<Regex> = OnceLock::new();

    let script = SCRIPT.get_or_init(|| {
        Regex::new(r"(?is)<(script|style|head)\b.*?</(script|style|head)>").expect("Invalid regex")
    });
    let block = BLOCK.get_or_init(|| {
        Regex::new(r"(?i)</?(p|div|br|li|tr|h[1-6]|section|article)\b[^>]*>").expect("Invalid regex")
    });
    let tag = TAG.get_or_init(|| Regex::new(r"<[^>]+>").expect("Invalid regex"));
    let blanks = BLANKS.get_or_init(|| Regex::new(r"\n[ \t]*(\n[ \t]*)+").expect("Invalid regex"));

    let text = script.replace_all(&text, "");
    let text = block.replace_all(&text, "\n");
    let text = tag.replace_all(&text, "");
    let text = text
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
    blanks.replace_all(text.trim(), "\n\n").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn collected(path: std::path::PathBuf) -> CollectedFile {
        CollectedFile {
            file_type: FileType::of(&path).unwrap(),
            size: std::fs::metadata(&path).unwrap().len(),
            path,
            sidecar: None,
        }
    }

    #[tokio::test]
    async fn test_text_file_is_one_unpaged_block() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("policy.md");
        std::fs::write(&path, "\u{feff}# Medical Records\r\n\r\nKeep records for ten years.").unwrap();

        let pages = extract_pages(&collected(path)).await.unwrap();
        assert_eq!(pages, vec![PageText::unpaged("# Medical Records\n\nKeep records for ten years.")]);
    }

    #[tokio::test]
    async fn test_html_tags_removed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bulletin.html");
        std::fs::write(
            &path,
            "<html><head><title>x</title></head><body><h1>ADP Bulletin</h1>\
             <script>var a = 1;</script><p>Forms &amp; claims are due in 30 days.</p></body></html>",
        )
        .unwrap();

        let pages = extract_pages(&collected(path)).await.unwrap();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].text, "ADP Bulletin\n\nForms & claims are due in 30 days.");
    }
}
