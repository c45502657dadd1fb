//! 문서 파일 수집
//!
//! 정책/청구 문서 파일과 폴더를 모아 수집 파이프라인에 넘깁니다.
//! .gitignore 패턴을 존중하며, 파일 옆에 `<파일명>.meta.json` 사이드카가 있으면
//! 그 파일에만 적용되는 문서 속성(기관, 유형, 시행일 등)으로 읽어 둡니다.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use ignore::WalkBuilder;
use serde::Deserialize;

use crate::knowledge::DocumentType;

const SIDECAR_SUFFIX: &str = ".meta.json";

// ============================================================================
// File Types
// ============================================================================

/// 수집 가능한 문서 형식
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// 마크다운, 일반 텍스트, HTML 저장본
    Text,
    /// 페이지 번호를 유지하는 PDF
    Pdf,
}

impl FileType {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "md" | "markdown" | "txt" | "text" | "rst" | "html" | "htm" => Some(Self::Text),
            "pdf" => Some(Self::Pdf),
            _ => None,
        }
    }

    pub fn of(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?;
        Self::from_extension(ext)
    }
}

// ============================================================================
// Sidecar
// ============================================================================

/// 파일별 문서 속성 (지정한 항목만 명령행 태그를 덮어씀)
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SidecarMeta {
    pub title: Option<String>,
    pub source_org: Option<String>,
    pub doc_type: Option<DocumentType>,
    pub effective_date: Option<NaiveDate>,
    pub source_url: Option<String>,
    pub supersedes: Option<String>,
    pub policy_level: Option<String>,
    /// 문서가 다루는 청구 코드/DIN
    #[serde(default)]
    pub entity_keys: Vec<String>,
}

fn sidecar_path(path: &Path) -> Option<PathBuf> {
    let name = path.file_name()?.to_str()?;
    Some(path.with_file_name(format!("{}{}", name, SIDECAR_SUFFIX)))
}

fn read_sidecar(path: &Path) -> Result<Option<SidecarMeta>> {
    let Some(sidecar) = sidecar_path(path).filter(|p| p.is_file()) else {
        return Ok(None);
    };
    let raw = std::fs::read_to_string(&sidecar)
        .with_context(|| format!("Failed to read sidecar: {:?}", sidecar))?;
    let meta = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid sidecar: {:?}", sidecar))?;
    Ok(Some(meta))
}

// ============================================================================
// Collected File
// ============================================================================

/// 수집 대상 문서 파일
#[derive(Debug, Clone)]
pub struct CollectedFile {
    /// 절대 경로 (문서 ID 도출에 사용)
    pub path: PathBuf,
    pub file_type: FileType,
    pub size: u64,
    pub sidecar: Option<SidecarMeta>,
}

impl CollectedFile {
    /// 지원 형식이 아니거나 일반 파일이 아니면 None
    pub fn inspect(path: PathBuf) -> Result<Option<Self>> {
        let Some(file_type) = FileType::of(&path) else {
            return Ok(None);
        };
        let stat = std::fs::metadata(&path).with_context(|| format!("Failed to stat {:?}", path))?;
        if !stat.is_file() {
            return Ok(None);
        }

        let sidecar = read_sidecar(&path)?;
        Ok(Some(Self {
            path,
            file_type,
            size: stat.len(),
            sidecar,
        }))
    }
}

// ============================================================================
// File Collector
// ============================================================================

/// 수집 규칙
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub respect_gitignore: bool,
    pub include_hidden: bool,
    /// 바이트 단위 상한 (0이면 무제한)
    pub max_file_size: u64,
    pub skip_pdfs: bool,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            respect_gitignore: true,
            include_hidden: false,
            // 처방집 PDF는 수십 MB
            max_file_size: 50 * 1024 * 1024,
            skip_pdfs: false,
        }
    }
}

pub struct FileCollector {
    config: CollectorConfig,
}

impl FileCollector {
    pub fn new(config: CollectorConfig) -> Self {
        Self { config }
    }

    /// 파일 하나 (형식이 맞지 않거나 규칙에 걸리면 None)
    pub fn collect_file(&self, path: &Path) -> Result<Option<CollectedFile>> {
        let path = absolute(path)?;
        if !path.is_file() {
            anyhow::bail!("File not found: {:?}", path);
        }
        Ok(CollectedFile::inspect(path)?.filter(|f| self.accepts(f)))
    }

    /// 폴더 재귀 수집 (경로 순)
    ///
    /// 읽을 수 없는 항목과 잘못된 사이드카는 경고 후 건너뜁니다.
    pub fn collect_directory(&self, path: &Path) -> Result<Vec<CollectedFile>> {
        let root = absolute(path)?;
        if !root.is_dir() {
            anyhow::bail!("Directory not found: {:?}", root);
        }

        let gitignore = self.config.respect_gitignore;
        let mut files: Vec<CollectedFile> = WalkBuilder::new(&root)
            .hidden(!self.config.include_hidden)
            .git_ignore(gitignore)
            .git_global(gitignore)
            .git_exclude(gitignore)
            .build()
            .filter_map(|entry| match entry {
                Ok(entry) if entry.file_type().is_some_and(|t| t.is_file()) => Some(entry.into_path()),
                Ok(_) => None,
                Err(e) => {
                    tracing::warn!("Unreadable entry under {:?}: {}", root, e);
                    None
                }
            })
            .filter_map(|path| match CollectedFile::inspect(path) {
                Ok(file) => file,
                Err(e) => {
                    tracing::warn!("Skipping file: {:#}", e);
                    None
                }
            })
            .filter(|f| self.accepts(f))
            .collect();

        files.sort_by(|a, b| a.path.cmp(&b.path));
        tracing::info!(files = files.len(), root = ?root, "Collected document files");
        Ok(files)
    }

    fn accepts(&self, file: &CollectedFile) -> bool {
        let limit = self.config.max_file_size;
        if limit > 0 && file.size > limit {
            tracing::debug!(path = ?file.path, size = file.size, "File exceeds size limit");
            return false;
        }
        !(self.config.skip_pdfs && file.file_type == FileType::Pdf)
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    Ok(std::env::current_dir()
        .context("Failed to resolve current directory")?
        .join(path))
}

// ============================================================================
// Statistics
// ============================================================================

/// 수집 결과 요약
#[derive(Debug, Default, PartialEq)]
pub struct CollectionStats {
    pub total_files: usize,
    pub text_files: usize,
    pub pdf_files: usize,
    pub with_sidecar: usize,
    pub total_size: u64,
}

impl CollectionStats {
    pub fn from_files(files: &[CollectedFile]) -> Self {
        files.iter().fold(Self::default(), |mut stats, file| {
            stats.total_files += 1;
            stats.total_size += file.size;
            stats.with_sidecar += usize::from(file.sidecar.is_some());
            match file.file_type {
                FileType::Text => stats.text_files += 1,
                FileType::Pdf => stats.pdf_files += 1,
            }
            stats
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_supported_formats() {
        assert_eq!(FileType::from_extension("Markdown"), Some(FileType::Text));
        assert_eq!(FileType::from_extension("PDF"), Some(FileType::Pdf));
        assert_eq!(FileType::from_extension("png"), None);
        assert_eq!(FileType::of(Path::new("sob.meta.json")), None);
    }

    #[test]
    fn test_collect_directory_filters_and_sorts() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("b_policy.md"), "# Policy").unwrap();
        std::fs::write(dir.path().join("a_notes.txt"), "notes").unwrap();
        std::fs::write(dir.path().join("scan.png"), [0u8; 4]).unwrap();

        let files = FileCollector::new(CollectorConfig::default())
            .collect_directory(dir.path())
            .unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|f| f.path.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a_notes.txt", "b_policy.md"]);

        let stats = CollectionStats::from_files(&files);
        assert_eq!(stats.text_files, 2);
        assert_eq!(stats.with_sidecar, 0);
    }

    #[test]
    fn test_sidecar_is_attached() {
        let dir = TempDir::new().unwrap();
        let doc = dir.path().join("sob.md");
        std::fs::write(&doc, "# Schedule of Benefits").unwrap();
        std::fs::write(
            dir.path().join("sob.md.meta.json"),
            r#"{"source_org":"OHIP","doc_type":"policy","effective_date":"2024-07-01","entity_keys":["C122"]}"#,
        )
        .unwrap();

        let file = FileCollector::new(CollectorConfig::default())
            .collect_file(&doc)
            .unwrap()
            .unwrap();
        let sidecar = file.sidecar.unwrap();
        assert_eq!(sidecar.source_org.as_deref(), Some("OHIP"));
        assert_eq!(sidecar.doc_type, Some(DocumentType::Policy));
        assert_eq!(sidecar.effective_date, NaiveDate::from_ymd_opt(2024, 7, 1));
        assert_eq!(sidecar.entity_keys, vec!["C122"]);
    }

    #[test]
    fn test_invalid_sidecar_is_an_error_for_single_file() {
        let dir = TempDir::new().unwrap();
        let doc = dir.path().join("odb.txt");
        std::fs::write(&doc, "formulary").unwrap();
        std::fs::write(dir.path().join("odb.txt.meta.json"), r#"{"org":"ODB"}"#).unwrap();

        let collector = FileCollector::new(CollectorConfig::default());
        assert!(collector.collect_file(&doc).is_err());
        assert!(collector.collect_directory(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_missing_file_fails() {
        let dir = TempDir::new().unwrap();
        let collector = FileCollector::new(CollectorConfig::default());
        assert!(collector.collect_file(&dir.path().join("missing.md")).is_err());
    }
}
