//! Structured Store - rusqlite 기반 정규화 저장소
//!
//! 문서/섹션/구조화 엔티티를 저장하고, 필터가 명시된 키워드 검색을 제공합니다.
//! 저장 위치: ~/.medguide-rag/structured.db
//!
//! - [`KnowledgeStore`]: 수집(쓰기) 경로. 단일 연결을 Mutex로 보호
//! - [`SqliteStructuredStore`]: 쿼리 경로. 쿼리마다 읽기 전용 연결을 새로 열고,
//!   작업자 수를 세마포어로 제한하며, 시간 예산 초과 시 SQLite 실행을 중단시킵니다.
//!
//! 텍스트 검색은 부분 문자열/키워드 기반입니다 (시맨틱 아님).
//! 청구 코드나 약품명처럼 임베딩 유사도가 놓치기 쉬운 정확한 용어를 잡기 위함입니다.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use rusqlite::{params, params_from_iter, Connection, OpenFlags, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::error::{RetrievalError, RetrievalPath, RetrievalResult};

use super::model::{Chunk, ChunkLevel, Document, DocumentType, EntityKind, SourceRef, StructuredEntity};

const BACKEND: &str = "SQLite";

// ============================================================================
// Data Directory
// ============================================================================

/// 데이터 디렉토리 경로 (~/.medguide-rag/)
pub fn get_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".medguide-rag")
}

// ============================================================================
// Types
// ============================================================================

/// 지원하는 필터 차원 (열거된 집합만 허용, 사용자 텍스트가 SQL로 가지 않음)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuredFilters {
    /// 발행 기관 (비어 있으면 제한 없음)
    #[serde(default)]
    pub source_orgs: Vec<String>,
    /// 문서 유형 (비어 있으면 제한 없음)
    #[serde(default)]
    pub doc_types: Vec<DocumentType>,
    pub topic: Option<String>,
    /// 이 날짜 이전 문서 제외 (날짜 없는 문서는 유지)
    pub after_date: Option<NaiveDate>,
    #[serde(default)]
    pub include_superseded: bool,
}

/// structured 검색 요청
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StructuredQuery {
    pub text: String,
    pub filters: StructuredFilters,
    pub limit: usize,
    /// 정확 일치로 조회할 자연키 후보 (쿼리 해석 결과)
    pub key_hints: Vec<String>,
}

/// 행 매칭 종류 - 정렬 우선순위 순서
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    /// 자연키 정확 일치
    ExactKey,
    /// 엔티티 설명/메모 키워드 일치
    EntityKeyword,
    /// 상위 섹션 일치
    ParentSection,
    /// 하위 섹션 일치
    ChildSection,
}

/// 행 본문 (엔티티 또는 섹션)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RowBody {
    Entity(StructuredEntity),
    Section(Chunk),
}

/// structured 저장소 결과 행
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredRow {
    /// 엔티티 자연키 또는 섹션 ID
    pub natural_key: String,
    pub description: String,
    pub source_document_id: String,
    pub section_ref: Option<String>,
    pub match_kind: MatchKind,
    pub body: RowBody,
    pub document: Option<Document>,
}

impl StructuredRow {
    fn section_index(&self) -> usize {
        match &self.body {
            RowBody::Section(chunk) => chunk.index,
            RowBody::Entity(_) => 0,
        }
    }

    /// 근거 텍스트 (섹션 본문 또는 엔티티 설명 + 메모)
    pub fn text(&self) -> String {
        match &self.body {
            RowBody::Section(chunk) => chunk.text.clone(),
            RowBody::Entity(entity) => match &entity.notes {
                Some(notes) if !notes.is_empty() => format!("{}. {}", entity.description, notes),
                _ => entity.description.clone(),
            },
        }
    }
}

/// 관계 조회 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    /// 엔티티 출처 문서의 상위 섹션
    SourceSections,
    /// 같은 출처 문서의 다른 엔티티
    SameDocument,
    /// 섹션의 하위 섹션
    Children,
}

/// 저장소 통계
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub document_count: usize,
    pub section_count: usize,
    pub entity_count: usize,
    pub db_path: PathBuf,
}

// ============================================================================
// StructuredStore Trait
// ============================================================================

/// structured 질의 서비스 인터페이스
#[async_trait]
pub trait StructuredStore: Send + Sync {
    /// 키워드 + 필터 검색 (정렬된 결과)
    async fn search(&self, query: &StructuredQuery) -> RetrievalResult<Vec<StructuredRow>>;

    /// 자연키(또는 섹션 ID)로 단건 조회
    async fn get_by_key(&self, key: &str) -> RetrievalResult<Option<StructuredRow>>;

    /// 관계 조회
    async fn get_related(&self, key: &str, relation: Relation) -> RetrievalResult<Vec<StructuredRow>>;
}

// ============================================================================
// KnowledgeStore (ingestion side)
// ============================================================================

/// Knowledge Store - 수집용 동기 저장소
pub struct KnowledgeStore {
    conn: Arc<Mutex<Connection>>,
    db_path: PathBuf,
}

impl KnowledgeStore {
    /// 저장소 열기 (없으면 생성)
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).context("Failed to create database directory")?;
            }
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .context("Failed to open SQLite database")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: path.to_path_buf(),
        };

        store.initialize()?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| anyhow::anyhow!("Lock error: {}", e))
    }

    /// 스키마 초기화
    fn initialize(&self) -> Result<()> {
        let conn = self.lock()?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;

             CREATE TABLE IF NOT EXISTS documents (
                 id TEXT PRIMARY KEY,
                 title TEXT NOT NULL,
                 source_org TEXT NOT NULL,
                 doc_type TEXT NOT NULL,
                 effective_date TEXT,
                 topics TEXT NOT NULL DEFAULT '[]',
                 source_url TEXT,
                 superseded INTEGER NOT NULL DEFAULT 0,
                 created_at TEXT NOT NULL
             );

             CREATE TABLE IF NOT EXISTS sections (
                 id TEXT PRIMARY KEY,
                 document_id TEXT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
                 heading TEXT,
                 text TEXT NOT NULL,
                 idx INTEGER NOT NULL,
                 level TEXT NOT NULL,
                 parent_id TEXT,
                 start_offset INTEGER NOT NULL,
                 end_offset INTEGER NOT NULL,
                 metadata TEXT NOT NULL DEFAULT '{}'
             );

             CREATE TABLE IF NOT EXISTS entities (
                 kind TEXT NOT NULL,
                 natural_key TEXT NOT NULL,
                 description TEXT NOT NULL,
                 amounts TEXT NOT NULL DEFAULT '{}',
                 flags TEXT NOT NULL DEFAULT '{}',
                 notes TEXT,
                 effective_date TEXT,
                 document_id TEXT NOT NULL,
                 section_ref TEXT,
                 page INTEGER,
                 PRIMARY KEY (kind, natural_key)
             );

             CREATE INDEX IF NOT EXISTS idx_sections_document ON sections(document_id, idx);
             CREATE INDEX IF NOT EXISTS idx_sections_parent ON sections(parent_id);
             CREATE INDEX IF NOT EXISTS idx_entities_key ON entities(natural_key);
             CREATE INDEX IF NOT EXISTS idx_entities_document ON entities(document_id);
             CREATE INDEX IF NOT EXISTS idx_documents_org ON documents(source_org);",
        )
        .context("Failed to create schema")?;

        // FTS5 가상 테이블 (섹션 키워드 검색용)
        // source: https://www.sqlite.org/fts5.html
        let fts_result = conn.execute(
            "CREATE VIRTUAL TABLE IF NOT EXISTS sections_fts USING fts5(
                heading,
                text,
                content=sections,
                content_rowid=rowid
            )",
            [],
        );

        if let Err(e) = fts_result {
            tracing::warn!("FTS5 not available (falling back to LIKE): {}", e);
        } else {
            conn.execute_batch(
                r#"
                CREATE TRIGGER IF NOT EXISTS sections_ai AFTER INSERT ON sections BEGIN
                    INSERT INTO sections_fts(rowid, heading, text)
                    VALUES (new.rowid, new.heading, new.text);
                END;

                CREATE TRIGGER IF NOT EXISTS sections_ad AFTER DELETE ON sections BEGIN
                    INSERT INTO sections_fts(sections_fts, rowid, heading, text)
                    VALUES('delete', old.rowid, old.heading, old.text);
                END;
                "#,
            )
            .context("Failed to create FTS triggers")?;
        }

        tracing::debug!("Structured store initialized at {:?}", self.db_path);
        Ok(())
    }

    /// 문서 저장 (같은 ID면 통째로 교체, 기존 섹션은 삭제됨)
    pub fn upsert_document(&self, doc: &Document) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        tx.execute("DELETE FROM sections WHERE document_id = ?1", params![doc.id])?;
        tx.execute(
            "INSERT INTO documents
                 (id, title, source_org, doc_type, effective_date, topics, source_url, superseded, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                 title = excluded.title,
                 source_org = excluded.source_org,
                 doc_type = excluded.doc_type,
                 effective_date = excluded.effective_date,
                 topics = excluded.topics,
                 source_url = excluded.source_url,
                 superseded = excluded.superseded",
            params![
                doc.id,
                doc.title,
                doc.source_org,
                doc.doc_type.as_str(),
                doc.effective_date.map(|d| d.to_string()),
                serde_json::to_string(&doc.topics)?,
                doc.source_url,
                doc.superseded,
                Utc::now().to_rfc3339(),
            ],
        )
        .context("Failed to upsert document")?;

        tx.commit()?;
        tracing::info!("Stored document: {} ({})", doc.id, doc.title);
        Ok(())
    }

    /// 문서의 섹션을 통째로 교체
    ///
    /// 모든 청크는 같은 문서를 참조해야 하며, 문서가 먼저 저장되어 있어야 합니다.
    pub fn replace_sections(&self, document_id: &str, chunks: &[Chunk]) -> Result<usize> {
        if let Some(stray) = chunks.iter().find(|c| c.document_id != document_id) {
            anyhow::bail!(
                "Chunk {} belongs to document '{}', expected '{}'",
                stray.id,
                stray.document_id,
                document_id
            );
        }

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let exists: bool = tx
            .query_row("SELECT 1 FROM documents WHERE id = ?1", params![document_id], |_| Ok(true))
            .optional()?
            .unwrap_or(false);
        if !exists {
            anyhow::bail!("Document '{}' does not exist", document_id);
        }

        tx.execute("DELETE FROM sections WHERE document_id = ?1", params![document_id])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO sections
                     (id, document_id, heading, text, idx, level, parent_id, start_offset, end_offset, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            for chunk in chunks {
                stmt.execute(params![
                    chunk.id,
                    chunk.document_id,
                    chunk.heading,
                    chunk.text,
                    chunk.index as i64,
                    chunk.level.as_str(),
                    chunk.parent_id,
                    chunk.start as i64,
                    chunk.end as i64,
                    serde_json::to_string(&chunk.metadata)?,
                ])
                .with_context(|| format!("Failed to insert section {}", chunk.id))?;
            }
        }
        tx.commit()?;

        Ok(chunks.len())
    }

    /// 대체된 문서 표시
    pub fn mark_superseded(&self, document_id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let rows = conn.execute(
            "UPDATE documents SET superseded = 1 WHERE id = ?1",
            params![document_id],
        )?;
        if rows > 0 {
            tracing::info!("Marked document {} as superseded", document_id);
        }
        Ok(rows > 0)
    }

    /// 엔티티 upsert ((kind, natural_key) 기준 통째로 교체)
    pub fn upsert_entities(&self, entities: &[StructuredEntity]) -> Result<usize> {
        for entity in entities {
            entity.validate().map_err(anyhow::Error::msg)?;
        }

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO entities
                     (kind, natural_key, description, amounts, flags, notes, effective_date, document_id, section_ref, page)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            for entity in entities {
                stmt.execute(params![
                    entity.kind.as_str(),
                    entity.natural_key.trim().to_uppercase(),
                    entity.description,
                    serde_json::to_string(&entity.amounts)?,
                    serde_json::to_string(&entity.flags)?,
                    entity.notes,
                    entity.effective_date.map(|d| d.to_string()),
                    entity.source.document_id,
                    entity.source.section_ref,
                    entity.source.page,
                ])?;
            }
        }
        tx.commit()?;

        tracing::info!("Upserted {} structured entities", entities.len());
        Ok(entities.len())
    }

    /// ID로 문서 조회
    pub fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let conn = self.lock()?;
        let doc = conn
            .query_row(
                &format!("SELECT {} FROM documents d WHERE d.id = ?1", DOCUMENT_COLUMNS),
                params![id],
                row_to_document,
            )
            .optional()?;
        Ok(doc)
    }

    /// 문서 목록 조회
    pub fn list_documents(&self, limit: usize, source_org: Option<&str>) -> Result<Vec<Document>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM documents d
             WHERE (?1 IS NULL OR d.source_org = ?1)
             ORDER BY d.created_at DESC, d.id
             LIMIT ?2",
            DOCUMENT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let docs = stmt
            .query_map(params![source_org, limit as i64], row_to_document)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(docs)
    }

    /// 문서 삭제 (섹션은 cascade)
    pub fn delete_document(&self, id: &str) -> Result<bool> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM sections WHERE document_id = ?1", params![id])?;
        let rows = conn.execute("DELETE FROM documents WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    /// 저장소 통계
    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.lock()?;
        let count = |table: &str| -> Result<usize> {
            let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))?;
            Ok(n as usize)
        };

        Ok(StoreStats {
            document_count: count("documents")?,
            section_count: count("sections")?,
            entity_count: count("entities")?,
            db_path: self.db_path.clone(),
        })
    }
}

// ============================================================================
// SqliteStructuredStore (query side)
// ============================================================================

/// 블로킹 작업 중단 상태 (예산 초과 쪽과 작업 쪽이 공유)
#[derive(Default)]
struct Interrupt {
    cancelled: bool,
    handle: Option<rusqlite::InterruptHandle>,
}

/// 쿼리 경로 structured 저장소
///
/// SQLite 연결은 동시 재사용에 안전하지 않으므로 쿼리마다 읽기 전용 연결을
/// 새로 열어 해당 쿼리 범위 안에서만 사용합니다.
pub struct SqliteStructuredStore {
    db_path: PathBuf,
    permits: Arc<Semaphore>,
    timeout: Duration,
}

impl SqliteStructuredStore {
    /// # Arguments
    /// * `db_path` - [`KnowledgeStore`]가 만든 DB 파일
    /// * `workers` - 동시 작업자 수
    /// * `timeout` - 쿼리당 시간 예산 (대기 시간 포함)
    pub fn new(db_path: impl Into<PathBuf>, workers: usize, timeout: Duration) -> Self {
        Self {
            db_path: db_path.into(),
            permits: Arc::new(Semaphore::new(workers.max(1))),
            timeout,
        }
    }

    /// 작업자 풀에서 읽기 전용 연결로 작업 실행
    ///
    /// 시간 예산을 넘기면 SQLite 실행을 interrupt하고 StoreTimeout을 반환합니다.
    /// 작업자 허가는 블로킹 작업이 실제로 끝날 때 반환됩니다.
    async fn run<T, F>(&self, job: F) -> RetrievalResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let started = Instant::now();
        let interrupt = Arc::new(Mutex::new(Interrupt::default()));
        let slot = Arc::clone(&interrupt);
        let db_path = self.db_path.clone();
        let permits = Arc::clone(&self.permits);

        let work = async move {
            let permit = permits
                .acquire_owned()
                .await
                .map_err(|e| RetrievalError::store(BACKEND, format!("worker pool closed: {}", e)))?;

            tokio::task::spawn_blocking(move || {
                let _permit = permit;
                let conn = Connection::open_with_flags(
                    &db_path,
                    OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
                )
                .map_err(|e| RetrievalError::store(BACKEND, format!("open: {}", e)))?;

                if let Ok(mut guard) = slot.lock() {
                    // 시작 전에 예산이 끝났으면 실행하지 않음
                    if guard.cancelled {
                        return Err(RetrievalError::store(BACKEND, "cancelled before start"));
                    }
                    guard.handle = Some(conn.get_interrupt_handle());
                }

                job(&conn).map_err(|e| RetrievalError::store(BACKEND, e))
            })
            .await
            .map_err(|e| RetrievalError::store(BACKEND, format!("worker task failed: {}", e)))?
        };

        match tokio::time::timeout(self.timeout, work).await {
            Ok(result) => {
                tracing::debug!(elapsed_ms = started.elapsed().as_millis() as u64, "Structured query done");
                result
            }
            Err(_) => {
                if let Ok(mut guard) = interrupt.lock() {
                    guard.cancelled = true;
                    if let Some(handle) = guard.handle.take() {
                        handle.interrupt();
                    }
                }
                tracing::warn!(
                    budget_ms = self.timeout.as_millis() as u64,
                    "Structured query timed out"
                );
                Err(RetrievalError::StoreTimeout {
                    path: RetrievalPath::Structured,
                    budget_ms: self.timeout.as_millis() as u64,
                })
            }
        }
    }
}

#[async_trait]
impl StructuredStore for SqliteStructuredStore {
    async fn search(&self, query: &StructuredQuery) -> RetrievalResult<Vec<StructuredRow>> {
        let query = query.clone();
        self.run(move |conn| search_rows(conn, &query)).await
    }

    async fn get_by_key(&self, key: &str) -> RetrievalResult<Option<StructuredRow>> {
        let key = key.to_string();
        self.run(move |conn| lookup_key(conn, &key)).await
    }

    async fn get_related(&self, key: &str, relation: Relation) -> RetrievalResult<Vec<StructuredRow>> {
        let key = key.to_string();
        self.run(move |conn| related_rows(conn, &key, relation)).await
    }
}

// ============================================================================
// Query implementation (shared by both sides)
// ============================================================================

const DOCUMENT_COLUMNS: &str =
    "d.id, d.title, d.source_org, d.doc_type, d.effective_date, d.topics, d.source_url, d.superseded";

const SECTION_COLUMNS: &str =
    "s.id, s.document_id, s.heading, s.text, s.idx, s.level, s.parent_id, s.start_offset, s.end_offset, s.metadata";

const ENTITY_COLUMNS: &str =
    "e.kind, e.natural_key, e.description, e.amounts, e.flags, e.notes, e.effective_date, e.document_id, e.section_ref, e.page";

/// 문서 필터 WHERE 절 (d 별칭 기준) + 바인딩 값
fn document_filter_clause(filters: &StructuredFilters) -> (String, Vec<rusqlite::types::Value>) {
    use rusqlite::types::Value;

    let mut clauses = Vec::new();
    let mut values = Vec::new();

    if !filters.include_superseded {
        clauses.push("d.superseded = 0".to_string());
    }
    if !filters.source_orgs.is_empty() {
        let marks = vec!["?"; filters.source_orgs.len()].join(", ");
        clauses.push(format!("d.source_org IN ({})", marks));
        values.extend(filters.source_orgs.iter().map(|o| Value::Text(o.clone())));
    }
    if !filters.doc_types.is_empty() {
        let marks = vec!["?"; filters.doc_types.len()].join(", ");
        clauses.push(format!("d.doc_type IN ({})", marks));
        values.extend(filters.doc_types.iter().map(|t| Value::Text(t.as_str().to_string())));
    }
    if let Some(topic) = &filters.topic {
        clauses.push("EXISTS (SELECT 1 FROM json_each(d.topics) WHERE json_each.value = ?)".to_string());
        values.push(Value::Text(topic.clone()));
    }
    if let Some(after) = filters.after_date {
        clauses.push("(d.effective_date IS NULL OR d.effective_date >= ?)".to_string());
        values.push(Value::Text(after.to_string()));
    }

    if clauses.is_empty() {
        ("1 = 1".to_string(), values)
    } else {
        (clauses.join(" AND "), values)
    }
}

/// 키워드 + 필터 검색
fn search_rows(conn: &Connection, query: &StructuredQuery) -> rusqlite::Result<Vec<StructuredRow>> {
    use rusqlite::types::Value;

    let limit = query.limit.max(1);
    let (filter_sql, filter_values) = document_filter_clause(&query.filters);
    let mut rows: Vec<StructuredRow> = Vec::new();

    // 1. 자연키 정확 일치
    let mut keys: Vec<String> = query.key_hints.iter().map(|k| k.trim().to_uppercase()).collect();
    let trimmed = query.text.trim();
    if !trimmed.is_empty() && !trimmed.contains(char::is_whitespace) {
        keys.push(trimmed.to_uppercase());
    }
    keys.sort();
    keys.dedup();

    for key in &keys {
        let sql = format!(
            "SELECT {}, {} FROM entities e
             LEFT JOIN documents d ON d.id = e.document_id
             WHERE e.natural_key = ? AND (d.id IS NULL OR ({}))
             ORDER BY e.kind",
            ENTITY_COLUMNS, DOCUMENT_COLUMNS, filter_sql
        );
        let mut values = vec![Value::Text(key.clone())];
        values.extend(filter_values.iter().cloned());
        let mut stmt = conn.prepare(&sql)?;
        let found = stmt
            .query_map(params_from_iter(values), |r| entity_row(r, MatchKind::ExactKey))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.extend(found);
    }

    let terms = keyword_terms(&query.text);

    // 2. 엔티티 설명/메모 키워드 (LIKE)
    if !terms.is_empty() {
        let like_clauses = vec!["(LOWER(e.description) LIKE ? OR LOWER(COALESCE(e.notes, '')) LIKE ?)"; terms.len()]
            .join(" OR ");
        let sql = format!(
            "SELECT {}, {} FROM entities e
             LEFT JOIN documents d ON d.id = e.document_id
             WHERE ({}) AND (d.id IS NULL OR ({}))
             ORDER BY e.kind, e.natural_key
             LIMIT ?",
            ENTITY_COLUMNS, DOCUMENT_COLUMNS, like_clauses, filter_sql
        );
        let mut values = Vec::new();
        for term in &terms {
            let pattern = format!("%{}%", term);
            values.push(Value::Text(pattern.clone()));
            values.push(Value::Text(pattern));
        }
        values.extend(filter_values.iter().cloned());
        values.push(Value::Integer(limit as i64));

        let mut stmt = conn.prepare(&sql)?;
        let found = stmt
            .query_map(params_from_iter(values), |r| entity_row(r, MatchKind::EntityKeyword))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.extend(found);
    }

    // 3. 섹션 FTS5 (없으면 LIKE)
    let fts_query = escape_fts5_query(&query.text);
    if !fts_query.is_empty() {
        let section_rows = if fts_available(conn) {
            let sql = format!(
                "SELECT {}, {} FROM sections_fts
                 JOIN sections s ON s.rowid = sections_fts.rowid
                 JOIN documents d ON d.id = s.document_id
                 WHERE sections_fts MATCH ? AND {}
                 ORDER BY bm25(sections_fts)
                 LIMIT ?",
                SECTION_COLUMNS, DOCUMENT_COLUMNS, filter_sql
            );
            let mut values = vec![Value::Text(fts_query)];
            values.extend(filter_values.iter().cloned());
            values.push(Value::Integer(limit as i64));
            let mut stmt = conn.prepare(&sql)?;
            let found = stmt
                .query_map(params_from_iter(values), section_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            found
        } else {
            search_sections_like(conn, &terms, &filter_sql, &filter_values, limit)?
        };
        rows.extend(section_rows);
    }

    dedup_rows(&mut rows);
    sort_rows(&mut rows);
    rows.truncate(limit);
    Ok(rows)
}

/// FTS5 사용 불가 시 LIKE 폴백
fn search_sections_like(
    conn: &Connection,
    terms: &[String],
    filter_sql: &str,
    filter_values: &[rusqlite::types::Value],
    limit: usize,
) -> rusqlite::Result<Vec<StructuredRow>> {
    use rusqlite::types::Value;

    if terms.is_empty() {
        return Ok(vec![]);
    }
    let like = vec!["LOWER(s.text) LIKE ?"; terms.len()].join(" OR ");
    let sql = format!(
        "SELECT {}, {} FROM sections s
         JOIN documents d ON d.id = s.document_id
         WHERE ({}) AND {}
         ORDER BY s.document_id, s.idx
         LIMIT ?",
        SECTION_COLUMNS, DOCUMENT_COLUMNS, like, filter_sql
    );
    let mut values: Vec<Value> = terms.iter().map(|t| Value::Text(format!("%{}%", t))).collect();
    values.extend(filter_values.iter().cloned());
    values.push(Value::Integer(limit as i64));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(values), section_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// 자연키 또는 섹션 ID 단건 조회
fn lookup_key(conn: &Connection, key: &str) -> rusqlite::Result<Option<StructuredRow>> {
    let sql = format!(
        "SELECT {}, {} FROM entities e
         LEFT JOIN documents d ON d.id = e.document_id
         WHERE e.natural_key = ?1
         ORDER BY e.kind
         LIMIT 1",
        ENTITY_COLUMNS, DOCUMENT_COLUMNS
    );
    let entity = conn
        .query_row(&sql, params![key.trim().to_uppercase()], |r| entity_row(r, MatchKind::ExactKey))
        .optional()?;
    if entity.is_some() {
        return Ok(entity);
    }

    let sql = format!(
        "SELECT {}, {} FROM sections s JOIN documents d ON d.id = s.document_id WHERE s.id = ?1",
        SECTION_COLUMNS, DOCUMENT_COLUMNS
    );
    conn.query_row(&sql, params![key], section_row).optional()
}

/// 관계 조회
fn related_rows(conn: &Connection, key: &str, relation: Relation) -> rusqlite::Result<Vec<StructuredRow>> {
    let rows = match relation {
        Relation::SourceSections => {
            let Some(anchor) = lookup_key(conn, key)? else {
                return Ok(vec![]);
            };
            let sql = format!(
                "SELECT {}, {} FROM sections s
                 JOIN documents d ON d.id = s.document_id
                 WHERE s.document_id = ?1 AND s.level = 'parent'
                   AND (?2 IS NULL OR s.heading = ?2)
                 ORDER BY s.idx",
                SECTION_COLUMNS, DOCUMENT_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let found = stmt
                .query_map(params![anchor.source_document_id, anchor.section_ref], section_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            found
        }
        Relation::SameDocument => {
            let Some(anchor) = lookup_key(conn, key)? else {
                return Ok(vec![]);
            };
            let sql = format!(
                "SELECT {}, {} FROM entities e
                 LEFT JOIN documents d ON d.id = e.document_id
                 WHERE e.document_id = ?1 AND e.natural_key != ?2
                 ORDER BY e.kind, e.natural_key",
                ENTITY_COLUMNS, DOCUMENT_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let found = stmt
                .query_map(params![anchor.source_document_id, anchor.natural_key], |r| {
                    entity_row(r, MatchKind::EntityKeyword)
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            found
        }
        Relation::Children => {
            let sql = format!(
                "SELECT {}, {} FROM sections s
                 JOIN documents d ON d.id = s.document_id
                 WHERE s.parent_id = ?1
                 ORDER BY s.idx",
                SECTION_COLUMNS, DOCUMENT_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let found = stmt
                .query_map(params![key], section_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            found
        }
    };
    Ok(rows)
}

fn fts_available(conn: &Connection) -> bool {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'sections_fts'",
        [],
        |_| Ok(()),
    )
    .is_ok()
}

/// (본문 종류, 키) 중복 제거 - 우선순위가 높은 매칭을 유지
fn dedup_rows(rows: &mut Vec<StructuredRow>) {
    sort_rows(rows);
    let mut seen = std::collections::HashSet::new();
    rows.retain(|r| {
        let tag = match r.body {
            RowBody::Entity(ref e) => format!("entity:{}:{}", e.kind, e.natural_key),
            RowBody::Section(ref c) => format!("section:{}", c.id),
        };
        seen.insert(tag)
    });
}

/// 매칭 종류 → 문서 → 섹션 순번 → 키
fn sort_rows(rows: &mut [StructuredRow]) {
    rows.sort_by(|a, b| {
        a.match_kind
            .cmp(&b.match_kind)
            .then_with(|| a.source_document_id.cmp(&b.source_document_id))
            .then_with(|| a.section_index().cmp(&b.section_index()))
            .then_with(|| a.natural_key.cmp(&b.natural_key))
    });
}

// ============================================================================
// Row mapping
// ============================================================================

fn parse_date(value: Option<String>) -> Option<NaiveDate> {
    value.and_then(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok())
}

fn json_column<T: serde::de::DeserializeOwned + Default>(raw: String) -> T {
    serde_json::from_str(&raw).unwrap_or_default()
}

/// documents 컬럼(offset부터 8개) → Document
fn document_at(row: &Row<'_>, offset: usize) -> rusqlite::Result<Option<Document>> {
    let id: Option<String> = row.get(offset)?;
    let Some(id) = id else {
        return Ok(None);
    };
    let doc_type: String = row.get(offset + 3)?;
    Ok(Some(Document {
        id,
        title: row.get(offset + 1)?,
        source_org: row.get(offset + 2)?,
        doc_type: doc_type.parse().unwrap_or(DocumentType::Advice),
        effective_date: parse_date(row.get(offset + 4)?),
        topics: json_column(row.get(offset + 5)?),
        source_url: row.get(offset + 6)?,
        superseded: row.get(offset + 7)?,
    }))
}

fn row_to_document(row: &Row<'_>) -> rusqlite::Result<Document> {
    document_at(row, 0)?.ok_or(rusqlite::Error::QueryReturnedNoRows)
}

fn entity_row(row: &Row<'_>, match_kind: MatchKind) -> rusqlite::Result<StructuredRow> {
    let kind: String = row.get(0)?;
    let page: Option<i64> = row.get(9)?;
    let entity = StructuredEntity {
        kind: kind.parse().unwrap_or(EntityKind::PolicyRule),
        natural_key: row.get(1)?,
        description: row.get(2)?,
        amounts: json_column(row.get(3)?),
        flags: json_column(row.get(4)?),
        notes: row.get(5)?,
        effective_date: parse_date(row.get(6)?),
        source: SourceRef {
            document_id: row.get(7)?,
            section_ref: row.get(8)?,
            page: page.map(|p| p as u32),
        },
    };
    let document = document_at(row, 10)?;

    Ok(StructuredRow {
        natural_key: entity.natural_key.clone(),
        description: entity.description.clone(),
        source_document_id: entity.source.document_id.clone(),
        section_ref: entity.source.section_ref.clone(),
        match_kind,
        body: RowBody::Entity(entity),
        document,
    })
}

fn section_row(row: &Row<'_>) -> rusqlite::Result<StructuredRow> {
    let level: String = row.get(5)?;
    let level = ChunkLevel::parse(&level).unwrap_or(ChunkLevel::Child);
    let idx: i64 = row.get(4)?;
    let start: i64 = row.get(7)?;
    let end: i64 = row.get(8)?;
    let chunk = Chunk {
        id: row.get(0)?,
        document_id: row.get(1)?,
        heading: row.get(2)?,
        text: row.get(3)?,
        index: idx as usize,
        level,
        parent_id: row.get(6)?,
        start: start as usize,
        end: end as usize,
        metadata: json_column(row.get(9)?),
    };
    let document = document_at(row, 10)?;

    let match_kind = match level {
        ChunkLevel::Parent => MatchKind::ParentSection,
        ChunkLevel::Child => MatchKind::ChildSection,
    };
    let description = chunk
        .heading
        .clone()
        .unwrap_or_else(|| chunk.text.chars().take(120).collect());

    Ok(StructuredRow {
        natural_key: chunk.id.clone(),
        description,
        source_document_id: chunk.document_id.clone(),
        section_ref: chunk.heading.clone(),
        match_kind,
        body: RowBody::Section(chunk),
        document,
    })
}

// ============================================================================
// Helper Functions
// ============================================================================

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "what", "when", "which", "does", "are", "how", "can", "from",
    "that", "this", "following", "about", "into", "under",
];

/// LIKE 검색용 키워드 (소문자, 3자 이상, 불용어 제외)
fn keyword_terms(query: &str) -> Vec<String> {
    let mut terms: Vec<String> = query
        .split_whitespace()
        .map(|w| {
            w.chars()
                .filter(|c| c.is_alphanumeric() || *c == '-')
                .collect::<String>()
                .to_lowercase()
        })
        .filter(|w| w.chars().count() >= 3 && !STOPWORDS.contains(&w.as_str()))
        .collect();
    terms.dedup();
    terms
}

/// FTS5 쿼리 이스케이프
///
/// 특수 문자를 제거하고 단어를 큰따옴표로 감싼 뒤 OR로 연결합니다.
/// source: https://www.sqlite.org/fts5.html#full_text_query_syntax
fn escape_fts5_query(query: &str) -> String {
    let trimmed = query.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    trimmed
        .split_whitespace()
        .map(|w| {
            w.chars()
                .filter(|c| c.is_alphanumeric() || *c == '_')
                .collect::<String>()
        })
        .filter(|w| !w.is_empty())
        .map(|w| format!("\"{}\"", w))
        .collect::<Vec<_>>()
        .join(" OR ")
}

// ============================================================================
// Tests
// ============================================================================
