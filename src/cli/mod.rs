//! CLI 모듈
//!
//! medguide-rag 명령어 정의 및 구현

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};

use crate::config::EngineConfig;
use crate::embedding::has_api_key;
use crate::ingest::{FileTags, Ingestor};
use crate::knowledge::{DocumentType, KnowledgeStore, StructuredFilters};
use crate::retrieval::{
    EnvelopeStatus, HybridRetriever, MetadataFilter, Provenance, ResultEnvelope, RetrievalRequest,
};

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Parser)]
#[command(name = "medguide-rag")]
#[command(version, about = "의료 규정/청구 문서 하이브리드 검색 엔진", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// 파일 또는 폴더를 수집 (텍스트, PDF)
    Ingest {
        /// 수집할 파일/폴더 경로
        path: PathBuf,

        /// 발행 기관 (CPSO, OHIP, ODB ...)
        #[arg(short, long)]
        org: String,

        /// 문서 유형 (policy, standard, guideline, advice, tool, statement)
        #[arg(short = 't', long, default_value = "policy")]
        doc_type: DocumentType,

        /// 벡터 컬렉션 이름
        #[arg(short, long)]
        collection: String,

        /// 시행일 (YYYY-MM-DD)
        #[arg(long)]
        effective: Option<NaiveDate>,

        /// 원문 URL
        #[arg(long)]
        url: Option<String>,

        /// 이 문서가 대체하는 이전 문서 ID
        #[arg(long)]
        supersedes: Option<String>,

        /// 정책 수준 메타데이터
        #[arg(long)]
        policy_level: Option<String>,
    },

    /// JSON-lines 구조화 엔티티 적재 (청구 코드, 약품 레코드 등)
    Entities {
        /// JSON-lines 파일
        file: PathBuf,
    },

    /// 하이브리드 검색
    Query {
        /// 검색 쿼리
        query: String,

        /// 검색할 컬렉션 (반복 지정 가능, 없으면 전체)
        #[arg(short, long)]
        collection: Vec<String>,

        /// 발행 기관 필터 (structured)
        #[arg(short, long)]
        org: Vec<String>,

        /// 문서 유형 필터
        #[arg(short = 't', long)]
        doc_type: Vec<DocumentType>,

        /// 이 날짜 이후 시행 문서만
        #[arg(long)]
        after: Option<NaiveDate>,

        /// 유지할 결과 수
        #[arg(short, long)]
        keep: Option<usize>,

        /// 대체된 문서 포함
        #[arg(long)]
        include_superseded: bool,

        /// 결과 봉투를 JSON으로 출력
        #[arg(long)]
        json: bool,
    },

    /// 저장된 문서 목록
    List {
        /// 발행 기관 필터
        #[arg(short, long)]
        org: Option<String>,

        /// 결과 개수 제한
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// 문서 삭제 (SQLite + 벡터)
    Delete {
        /// 삭제할 문서 ID
        id: String,
    },

    /// 상태 확인
    Status,
}

// ============================================================================
// CLI Runner
// ============================================================================

/// CLI 명령어 실행
pub async fn run(cli: Cli) -> Result<()> {
    let config = EngineConfig::load().context("설정 로드 실패")?;

    match cli.command {
        Commands::Ingest {
            path,
            org,
            doc_type,
            collection,
            effective,
            url,
            supersedes,
            policy_level,
        } => {
            let tags = FileTags {
                source_org: org,
                doc_type,
                collection,
                effective_date: effective,
                source_url: url,
                supersedes,
                policy_level,
            };
            cmd_ingest(&config, path, tags).await
        }
        Commands::Entities { file } => cmd_entities(&config, file),
        Commands::Query {
            query,
            collection,
            org,
            doc_type,
            after,
            keep,
            include_superseded,
            json,
        } => {
            let request = RetrievalRequest {
                query,
                structured_filters: StructuredFilters {
                    source_orgs: org,
                    doc_types: doc_type.clone(),
                    topic: None,
                    after_date: after,
                    include_superseded,
                },
                metadata_filter: MetadataFilter {
                    document_types: doc_type,
                    policy_level: None,
                    after_date: after,
                },
                collections: collection,
                keep_top_k: keep,
            };
            cmd_query(&config, request, json).await
        }
        Commands::List { org, limit } => cmd_list(&config, org, limit),
        Commands::Delete { id } => cmd_delete(&config, &id).await,
        Commands::Status => cmd_status(&config).await,
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

fn require_api_key() -> Result<()> {
    if !has_api_key() {
        bail!(
            "API 키가 설정되지 않았습니다.\n\n\
             설정 방법:\n  \
             export GEMINI_API_KEY=your-api-key\n  \
             또는\n  \
             export GOOGLE_AI_API_KEY=your-api-key\n\n\
             API 키 발급: https://aistudio.google.com/app/apikey"
        );
    }
    Ok(())
}

/// 문서 수집 명령어 (ingest)
async fn cmd_ingest(config: &EngineConfig, path: PathBuf, tags: FileTags) -> Result<()> {
    require_api_key()?;

    println!("[*] 수집 중: {} → 컬렉션 '{}'", path.display(), tags.collection);
    let ingestor = Ingestor::open(config).await.context("Ingestor 초기화 실패")?;
    let reports = ingestor.ingest_path(&path, &tags).await.context("수집 실패")?;

    if reports.is_empty() {
        println!("[!] 수집할 파일이 없습니다.");
        return Ok(());
    }

    for report in &reports {
        println!(
            "  {} | 섹션 {} | 벡터 {} | 건너뜀 {}",
            report.document_id, report.sections, report.embedded, report.skipped
        );
        if let Some(old) = &report.superseded {
            println!("    대체됨: {}", old);
        }
    }
    println!();
    println!("[OK] 문서 {} 건 수집 완료", reports.len());
    Ok(())
}

/// 엔티티 적재 명령어 (entities)
fn cmd_entities(config: &EngineConfig, file: PathBuf) -> Result<()> {
    std::fs::create_dir_all(&config.data_dir).context("데이터 디렉토리 생성 실패")?;
    let store = KnowledgeStore::open(&config.structured_db_path()).context("KnowledgeStore 열기 실패")?;

    let entities = crate::ingest::load_entities_jsonl(&file)?;
    let count = store.upsert_entities(&entities).context("엔티티 저장 실패")?;
    println!("[OK] 엔티티 {} 건 적재 완료", count);
    Ok(())
}

/// 검색 명령어 (query)
async fn cmd_query(config: &EngineConfig, request: RetrievalRequest, json: bool) -> Result<()> {
    require_api_key()?;

    let retriever = HybridRetriever::open(config)
        .await
        .context("HybridRetriever 초기화 실패")?;
    let envelope = retriever.retrieve(&request).await.context("검색 실패")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&envelope)?);
    } else {
        println!("[*] 검색: \"{}\"\n", request.query);
        print_envelope(&envelope);
    }

    if envelope.status == EnvelopeStatus::Failed {
        bail!("모든 검색 경로가 실패했습니다");
    }
    Ok(())
}

/// 목록 명령어 (list)
fn cmd_list(config: &EngineConfig, org: Option<String>, limit: usize) -> Result<()> {
    let store = KnowledgeStore::open(&config.structured_db_path()).context("KnowledgeStore 열기 실패")?;
    let docs = store.list_documents(limit, org.as_deref()).context("문서 목록 조회 실패")?;

    if docs.is_empty() {
        println!("[!] 저장된 문서가 없습니다.");
        return Ok(());
    }

    println!("[OK] 저장된 문서 ({} 건):\n", docs.len());
    for doc in docs {
        let date = doc
            .effective_date
            .map(|d| d.to_string())
            .unwrap_or_else(|| "-".to_string());
        let flag = if doc.superseded { " (대체됨)" } else { "" };
        println!("  {} [{}/{}] {}{}", doc.id, doc.source_org, doc.doc_type, truncate_text(&doc.title, 50), flag);
        println!("        시행일: {}", date);
        if let Some(url) = &doc.source_url {
            println!("        URL: {}", url);
        }
    }
    Ok(())
}

/// 삭제 명령어 (delete)
async fn cmd_delete(config: &EngineConfig, id: &str) -> Result<()> {
    require_api_key()?;

    let ingestor = Ingestor::open(config).await.context("Ingestor 초기화 실패")?;
    if ingestor.delete_document(id).await.context("문서 삭제 실패")? {
        println!("[OK] 문서 {} 삭제됨", id);
    } else {
        println!("[!] 문서 {}를 찾을 수 없습니다", id);
    }
    Ok(())
}

/// 상태 명령어 (status)
async fn cmd_status(config: &EngineConfig) -> Result<()> {
    println!("medguide-rag v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("[*] 데이터 디렉토리: {}", config.data_dir.display());
    println!("[*] 임베딩 모델: {} ({}차원)", config.embedding.model, config.embedding.dimension);
    println!("[*] 점수 모델: {}", config.retrieval.scoring_model);

    if !has_api_key() {
        println!("[!] API 키: 미설정");
        println!("    설정: export GEMINI_API_KEY=your-key");
        match KnowledgeStore::open(&config.structured_db_path()).and_then(|s| s.stats()) {
            Ok(stats) => println!(
                "[OK] 문서 {} | 섹션 {} | 엔티티 {}",
                stats.document_count, stats.section_count, stats.entity_count
            ),
            Err(e) => println!("[!] 통계 조회 실패: {}", e),
        }
        return Ok(());
    }

    println!("[OK] API 키: 설정됨");
    match Ingestor::open(config).await {
        Ok(ingestor) => match ingestor.stats().await {
            Ok(stats) => {
                println!(
                    "[OK] 문서 {} | 섹션 {} | 엔티티 {}",
                    stats.documents, stats.sections, stats.entities
                );
                println!("[OK] 벡터 {} 건", stats.total_vectors());
                for (collection, count) in &stats.vectors {
                    println!("     {}: {}", collection, count);
                }
            }
            Err(e) => println!("[!] 통계 조회 실패: {}", e),
        },
        Err(e) => {
            tracing::debug!("Ingestor 초기화 실패: {:#}", e);
            println!("[!] 저장소 열기 실패: {}", e);
        }
    }
    Ok(())
}

// ============================================================================
// Output
// ============================================================================

fn print_envelope(envelope: &ResultEnvelope) {
    let sources: Vec<&str> = envelope.provenance.iter().map(Provenance::as_str).collect();
    println!(
        "[OK] 상태: {:?} | 신뢰도: {:.2} | 출처: {}",
        envelope.status,
        envelope.confidence,
        if sources.is_empty() { "-".to_string() } else { sources.join("+") }
    );
    if let Some(interpretation) = &envelope.query_interpretation {
        println!("     해석: {}", interpretation);
    }
    if let Some(error) = &envelope.error {
        println!("[!] {}", error);
    }
    println!();

    if envelope.is_empty() {
        println!("[!] 근거를 찾지 못했습니다.");
        return;
    }

    if !envelope.highlights.is_empty() {
        println!("핵심:");
        for highlight in &envelope.highlights {
            println!("  - {}", truncate_text(&highlight.point, 160));
            for citation in &highlight.citations {
                let org = citation.source_org.as_deref().unwrap_or("-");
                println!("      [{}] {} ({})", org, citation.source, citation.location);
            }
        }
        println!();
    }

    if !envelope.conflicts.is_empty() {
        println!("[!] 충돌:");
        for conflict in &envelope.conflicts {
            println!(
                "  {} {}: {} ({}) vs {} ({})",
                conflict.entity_key,
                conflict.field,
                conflict.value_a,
                conflict.source_a,
                conflict.value_b,
                conflict.source_b
            );
            println!("      → {}", conflict.resolution.reason);
        }
        println!();
    }

    println!("섹션 ({} 건):", envelope.sections.len());
    for (i, section) in envelope.sections.iter().enumerate() {
        let score = section
            .relevance
            .map(|r| format!(" [점수 {:.1}]", r))
            .unwrap_or_default();
        println!(
            "{}. [{}]{} {} / {}",
            i + 1,
            section.origin.as_str().to_uppercase(),
            score,
            section.document_id,
            section.heading.as_deref().unwrap_or(&section.id)
        );
        println!("   {}", truncate_text(&section.text, 200));
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// 텍스트 자르기 (UTF-8 안전)
fn truncate_text(text: &str, max_chars: usize) -> String {
    let cleaned = text.replace('\n', " ").replace('\r', "");
    let cleaned = cleaned.trim();

    if cleaned.chars().count() <= max_chars {
        cleaned.to_string()
    } else {
        let truncated: String = cleaned.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_text() {
        assert_eq!(truncate_text("hello", 10), "hello");
        assert_eq!(truncate_text("hello world", 5), "hello...");
        assert_eq!(truncate_text("hello\nworld", 20), "hello world");
    }

    #[test]
    fn test_truncate_unicode() {
        assert_eq!(truncate_text("안녕하세요 세계", 5), "안녕하세요...");
    }

    #[test]
    fn test_parse_query_command() {
        let cli = Cli::try_parse_from([
            "medguide-rag",
            "query",
            "Can I bill C122?",
            "-c",
            "ohip",
            "-t",
            "policy",
            "--after",
            "2024-01-01",
            "--json",
        ])
        .unwrap();

        match cli.command {
            Commands::Query {
                query,
                collection,
                doc_type,
                after,
                json,
                ..
            } => {
                assert_eq!(query, "Can I bill C122?");
                assert_eq!(collection, vec!["ohip"]);
                assert_eq!(doc_type, vec![DocumentType::Policy]);
                assert_eq!(after, NaiveDate::from_ymd_opt(2024, 1, 1));
                assert!(json);
            }
            _ => panic!("expected query command"),
        }
    }

    #[test]
    fn test_ingest_requires_org_and_collection() {
        assert!(Cli::try_parse_from(["medguide-rag", "ingest", "docs/"]).is_err());
        assert!(Cli::try_parse_from(["medguide-rag", "ingest", "docs/", "-o", "CPSO", "-c", "cpso"]).is_ok());
    }
}
