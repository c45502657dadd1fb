//! PDF 텍스트 추출
//!
//! 페이지 번호는 인용 위치("p. N")로 쓰이므로 가능한 한 원본 페이지를 유지합니다.

use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use regex::Regex;

/// PDF에서 (페이지 번호, 텍스트) 목록 추출. 페이지 번호는 1부터
pub fn extract_text_from_pdf(path: &Path) -> Result<Vec<(usize, String)>> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read PDF: {:?}", path))?;
    let text = pdf_extract::extract_text_from_mem(&bytes)
        .with_context(|| format!("Failed to extract text from PDF: {:?}", path))?;

    if text.trim().is_empty() {
        tracing::warn!("No text extracted from PDF: {:?} (scanned document?)", path);
        return Ok(vec![]);
    }

    Ok(split_pages(&text)
        .into_iter()
        .enumerate()
        .map(|(i, page)| (i + 1, strip_page_footer(&page)))
        .filter(|(_, page)| !page.is_empty())
        .collect())
}

/// 폼피드 → "--- Page N ---" 구분자 순으로 시도, 실패하면 한 페이지
///
/// 빈 페이지도 자리를 유지해야 이후 페이지 번호가 밀리지 않습니다.
fn split_pages(text: &str) -> Vec<String> {
    if text.contains('\x0c') {
        let mut pages: Vec<String> = text.split('\x0c').map(|s| s.trim().to_string()).collect();
        while pages.last().is_some_and(|p| p.is_empty()) {
            pages.pop();
        }
        return pages;
    }

    static MARKER: OnceLock<Regex> = OnceLock::new();
    let marker = MARKER.get_or_init(|| {
        Regex::new(r"(?m)^\s*[-=]+\s*(?:Page\s*)?\d+\s*[-=]+\s*$").expect("Invalid regex")
    });
    let pages: Vec<String> = marker
        .split(text)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    if pages.len() > 1 {
        pages
    } else {
        vec![text.trim().to_string()]
    }
}

/// "Page 3 of 120" 같은 쪽번호 줄 제거
fn strip_page_footer(page: &str) -> String {
    static FOOTER: OnceLock<Regex> = OnceLock::new();
    let footer = FOOTER.get_or_init(|| {
        Regex::new(r"(?i)^\s*(?:page\s+)?\d+\s*(?:(?:of|/)\s*\d+)?\s*$").expect("Invalid regex")
    });
    page.lines()
        .filter(|line| !footer.is_match(line))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_pages_keeps_empty_page_slots() {
        let pages = split_pages("Eligibility\x0c\x0cBilling rules\x0c");
        assert_eq!(pages, vec!["Eligibility", "", "Billing rules"]);
    }

    #[test]
    fn test_split_pages_with_markers() {
        let pages = split_pages("Intro\n--- Page 2 ---\nFees\n--- Page 3 ---\nClaims");
        assert_eq!(pages, vec!["Intro", "Fees", "Claims"]);
    }

    #[test]
    fn test_split_pages_single() {
        assert_eq!(split_pages("  just text  "), vec!["just text"]);
    }

    #[test]
    fn test_strip_page_footer() {
        let page = "C122 Subsequent visit\n61.15\nPage 3 of 120\n17";
        assert_eq!(strip_page_footer(page), "C122 Subsequent visit\n61.15");
    }
}
