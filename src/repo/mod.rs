//! Request repository
//!
//! On-disk store of sessions, captured exchanges, and bookmarks, backed by
//! SQLite in WAL mode. All writes go through a single connection guarded
//! by a mutex; readers share the same connection. The schema is migrated
//! monotonically (see [`migrations`]); queries go through the filter
//! algebra in [`filter`].
//!
//! Body bytes are stored post-decoding; the `*_body_truncated` flags are
//! authoritative for completeness. Bookmarked rows (`saved = 1`) are
//! immune to both eviction and [`RequestRepository::clear_requests`].

pub mod filter;
pub mod migrations;
pub mod types;

pub use filter::{ListQuery, RegexCache, RequestFilter, Side};
pub use types::{
    CapturedRequest, InterceptionType, JsonQueryRow, NewRequest, ReplayInitiator, RequestSummary,
    ResponseUpdate, Session, SessionAuth, SessionInfo,
};

use crate::error::Result;
use anyhow::Context;
use chrono::Utc;
use filter::SqlFilter;
use parking_lot::Mutex;
use rusqlite::functions::FunctionFlags;
use rusqlite::{params, Connection, OptionalExtension, ToSql};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Inserts between amortized eviction checks.
const EVICTION_CHECK_INTERVAL: u64 = 100;

/// Compiled-regex cache size for ad-hoc URL filters.
const REGEX_CACHE_SIZE: usize = 64;

/// Default page size for listings.
const DEFAULT_LIMIT: u32 = 100;

/// Body-search query envelope.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BodySearch {
    pub query: String,
    #[serde(default)]
    pub target: Side,
    pub limit: Option<u32>,
}

/// JSON-path query envelope.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonBodyQuery {
    pub path: String,
    /// Optional equality filter on the extracted value.
    pub value: Option<serde_json::Value>,
    #[serde(default)]
    pub target: Side,
    pub limit: Option<u32>,
}

/// The repository. Cheap to share behind an `Arc`.
pub struct RequestRepository {
    conn: Mutex<Connection>,
    max_stored_requests: u64,
    inserts_since_check: AtomicU64,
    regex_cache: Arc<RegexCache>,
}

const REQUEST_COLUMNS: &str = "id, session_id, timestamp, duration_ms, method, url, host, path, \
     request_headers, request_body, request_body_truncated, request_content_type, \
     response_status, response_headers, response_body, response_body_truncated, \
     response_content_type, label, source, intercepted_by, interception_type, \
     replayed_from_id, replay_initiator, saved";

const SUMMARY_COLUMNS: &str = "id, session_id, timestamp, duration_ms, method, url, host, path, \
     request_content_type, length(coalesce(request_body, x'')), request_body_truncated, \
     response_status, response_content_type, length(coalesce(response_body, x'')), \
     response_body_truncated, label, source, intercepted_by, interception_type, \
     replayed_from_id, replay_initiator, saved";

impl RequestRepository {
    /// Open (or create) the repository at `path` and bring the schema up
    /// to date. A migration failure leaves the database untouched and the
    /// open fails.
    pub fn open(path: &Path, max_stored_requests: u64) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database {}", path.display()))?;
        Self::init(conn, max_stored_requests)
    }

    /// In-memory repository for tests.
    pub fn open_in_memory(max_stored_requests: u64) -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::init(conn, max_stored_requests)
    }

    fn init(mut conn: Connection, max_stored_requests: u64) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let regex_cache = Arc::new(RegexCache::new(REGEX_CACHE_SIZE));
        register_regexp(&conn, regex_cache.clone())?;

        migrations::migrate(&mut conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            max_stored_requests,
            inserts_since_check: AtomicU64::new(0),
            regex_cache,
        })
    }

    // -- Sessions -----------------------------------------------------------

    /// Create a new session with a fresh id and internal token.
    pub fn register_session(
        &self,
        label: Option<&str>,
        pid: u32,
        source: Option<&str>,
    ) -> Result<Session> {
        let session = Session {
            id: uuid::Uuid::new_v4().to_string(),
            label: label.map(str::to_string),
            source: source.map(str::to_string),
            pid,
            started_at: now_ms(),
            internal_token: Some(random_token()),
        };
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sessions (id, label, source, pid, started_at, internal_token)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                session.id,
                session.label,
                session.source,
                session.pid,
                session.started_at,
                session.internal_token,
            ],
        )?;
        Ok(session)
    }

    /// Idempotently create a session with a fixed id. Returns the existing
    /// session when present; sessions are never mutated after creation.
    pub fn ensure_session(
        &self,
        id: &str,
        label: Option<&str>,
        pid: u32,
        source: Option<&str>,
    ) -> Result<Session> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO sessions (id, label, source, pid, started_at, internal_token)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id, label, source, pid, now_ms(), Option::<String>::None],
        )?;
        let session = conn
            .query_row(
                "SELECT id, label, source, pid, started_at, internal_token
                 FROM sessions WHERE id = ?1",
                [id],
                row_to_session,
            )
            .context("Session vanished after ensure")?;
        Ok(session)
    }

    /// Source attribution iff `token` matches the session's internal token.
    pub fn get_session_auth(&self, id: &str, token: &str) -> Result<Option<SessionAuth>> {
        let conn = self.conn.lock();
        let row: Option<(Option<String>, Option<String>)> = conn
            .query_row(
                "SELECT internal_token, source FROM sessions WHERE id = ?1",
                [id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(match row {
            Some((Some(stored), source)) if stored == token => Some(SessionAuth { source }),
            _ => None,
        })
    }

    /// All sessions with their request counts. Tokens are blanked.
    pub fn list_sessions(&self) -> Result<Vec<SessionInfo>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT s.id, s.label, s.source, s.pid, s.started_at,
                    (SELECT COUNT(*) FROM requests r WHERE r.session_id = s.id)
             FROM sessions s ORDER BY s.started_at ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(SessionInfo {
                session: Session {
                    id: row.get(0)?,
                    label: row.get(1)?,
                    source: row.get(2)?,
                    pid: row.get(3)?,
                    started_at: row.get(4)?,
                    internal_token: None,
                },
                request_count: row.get::<_, i64>(5)? as u64,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    // -- Writes -------------------------------------------------------------

    /// Insert the request phase of an exchange. Response fields stay null
    /// until [`update_request_response`](Self::update_request_response).
    pub fn save_request(&self, req: &NewRequest) -> Result<String> {
        let headers_json = serde_json::to_string(&req.request_headers)?;
        let (is_text, is_json) =
            types::classify_content_type(req.request_content_type.as_deref());
        {
            let conn = self.conn.lock();
            conn.execute(
                "INSERT INTO requests (
                     id, session_id, timestamp, method, url, host, path,
                     request_headers, request_body, request_body_truncated,
                     request_content_type, request_is_text, request_is_json,
                     label, source
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    req.id,
                    req.session_id,
                    req.timestamp,
                    req.method,
                    req.url,
                    req.host,
                    req.path,
                    headers_json,
                    req.request_body,
                    req.request_body_truncated,
                    req.request_content_type,
                    is_text,
                    is_json,
                    req.label,
                    req.source,
                ],
            )?;
        }

        let inserts = self.inserts_since_check.fetch_add(1, Ordering::Relaxed) + 1;
        if inserts % EVICTION_CHECK_INTERVAL == 0 {
            self.evict_if_needed()?;
        }
        Ok(req.id.clone())
    }

    /// Write the response phase. Response fields are set exactly once;
    /// a second call for the same id is a no-op and returns `false`.
    pub fn update_request_response(&self, id: &str, update: &ResponseUpdate) -> Result<bool> {
        let headers_json = serde_json::to_string(&update.headers)?;
        let (is_text, is_json) = types::classify_content_type(update.content_type.as_deref());
        let conn = self.conn.lock();
        let affected = conn.execute(
            "UPDATE requests SET
                 response_status = ?2, response_headers = ?3, response_body = ?4,
                 response_body_truncated = ?5, response_content_type = ?6,
                 response_is_text = ?7, response_is_json = ?8, duration_ms = ?9
             WHERE id = ?1 AND response_status IS NULL",
            params![
                id,
                update.status,
                headers_json,
                update.body,
                update.response_body_truncated,
                update.content_type,
                is_text,
                is_json,
                update.duration_ms,
            ],
        )?;
        Ok(affected > 0)
    }

    /// Record which interceptor touched the exchange and how.
    pub fn update_request_interception(
        &self,
        id: &str,
        intercepted_by: &str,
        interception_type: Option<InterceptionType>,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let affected = conn.execute(
            "UPDATE requests SET intercepted_by = ?2, interception_type = ?3 WHERE id = ?1",
            params![id, intercepted_by, interception_type.map(|t| t.as_str())],
        )?;
        Ok(affected > 0)
    }

    /// Link a replayed exchange back to its origin.
    pub fn update_request_replay(
        &self,
        id: &str,
        replayed_from_id: &str,
        initiator: ReplayInitiator,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let affected = conn.execute(
            "UPDATE requests SET replayed_from_id = ?2, replay_initiator = ?3 WHERE id = ?1",
            params![id, replayed_from_id, initiator.as_str()],
        )?;
        Ok(affected > 0)
    }

    /// Bookmark a row, protecting it from eviction and `clear_requests`.
    pub fn bookmark_request(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let affected = conn.execute("UPDATE requests SET saved = 1 WHERE id = ?1", [id])?;
        Ok(affected > 0)
    }

    pub fn unbookmark_request(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let affected = conn.execute("UPDATE requests SET saved = 0 WHERE id = ?1", [id])?;
        Ok(affected > 0)
    }

    /// Delete all non-bookmarked rows. Returns the number deleted.
    pub fn clear_requests(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let affected = conn.execute("DELETE FROM requests WHERE saved = 0", [])?;
        Ok(affected as u64)
    }

    /// Truncate the WAL and reclaim space. Shutdown-path only.
    pub fn compact(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE); VACUUM;")?;
        Ok(())
    }

    // -- Queries ------------------------------------------------------------

    pub fn get_request(&self, id: &str) -> Result<Option<CapturedRequest>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!("SELECT {REQUEST_COLUMNS} FROM requests WHERE id = ?1"),
                [id],
                row_to_request,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_requests(&self, query: &ListQuery) -> Result<Vec<CapturedRequest>> {
        let sql_filter = self.build_filter(query)?;
        let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
        let offset = query.offset.unwrap_or(0);
        let sql = format!(
            "SELECT {REQUEST_COLUMNS} FROM requests{} ORDER BY timestamp DESC, rowid DESC LIMIT {limit} OFFSET {offset}",
            sql_filter.where_sql()
        );
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(bound(&sql_filter), row_to_request)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn list_requests_summary(&self, query: &ListQuery) -> Result<Vec<RequestSummary>> {
        let sql_filter = self.build_filter(query)?;
        let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
        let offset = query.offset.unwrap_or(0);
        let sql = format!(
            "SELECT {SUMMARY_COLUMNS} FROM requests{} ORDER BY timestamp DESC, rowid DESC LIMIT {limit} OFFSET {offset}",
            sql_filter.where_sql()
        );
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(bound(&sql_filter), row_to_summary)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn count_requests(&self, query: &ListQuery) -> Result<u64> {
        let sql_filter = self.build_filter(query)?;
        let sql = format!(
            "SELECT COUNT(*) FROM requests{}",
            sql_filter.where_sql()
        );
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(&sql, bound(&sql_filter), |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Substring search over stored bodies. Only rows whose corresponding
    /// content type classifies as text are matched; rows with an unknown
    /// content type are searched so legacy data stays visible.
    pub fn search_bodies(&self, search: &BodySearch) -> Result<Vec<RequestSummary>> {
        let pattern = format!("%{}%", filter::escape_like(&search.query));
        let mut sides = Vec::new();
        let mut params: Vec<Box<dyn ToSql + Send>> = Vec::new();
        if search.target.includes_request() {
            sides.push(
                "(request_body IS NOT NULL AND request_is_text IS NOT 0 \
                 AND CAST(request_body AS TEXT) LIKE ? ESCAPE '\\')",
            );
            params.push(Box::new(pattern.clone()));
        }
        if search.target.includes_response() {
            sides.push(
                "(response_body IS NOT NULL AND response_is_text IS NOT 0 \
                 AND CAST(response_body AS TEXT) LIKE ? ESCAPE '\\')",
            );
            params.push(Box::new(pattern.clone()));
        }
        let limit = search.limit.unwrap_or(DEFAULT_LIMIT);
        let sql = format!(
            "SELECT {SUMMARY_COLUMNS} FROM requests WHERE ({}) ORDER BY timestamp DESC, rowid DESC LIMIT {limit}",
            sides.join(" OR ")
        );
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(params.iter().map(|p| p.as_ref() as &dyn ToSql)),
            row_to_summary,
        )?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Run a JSON path against stored JSON bodies, optionally filtering by
    /// equality with `value`. With `target = both` the request body's
    /// extraction is preferred for the returned value.
    pub fn query_json_bodies(&self, query: &JsonBodyQuery) -> Result<Vec<JsonQueryRow>> {
        let mut sides = Vec::new();
        if query.target.includes_request() {
            sides.push("(request_body IS NOT NULL AND request_is_json = 1)");
        }
        if query.target.includes_response() {
            sides.push("(response_body IS NOT NULL AND response_is_json = 1)");
        }
        let sql = format!(
            "SELECT {REQUEST_COLUMNS} FROM requests WHERE ({}) ORDER BY timestamp DESC, rowid DESC",
            sides.join(" OR ")
        );
        let limit = query.limit.unwrap_or(DEFAULT_LIMIT) as usize;

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_request)?;

        let mut out = Vec::new();
        for row in rows {
            let request = row?;
            let extracted = extract_for_row(&request, query);
            let Some(extracted) = extracted else { continue };
            if let Some(expected) = &query.value {
                if &extracted != expected {
                    continue;
                }
            }
            out.push(JsonQueryRow {
                summary: summarize(&request),
                extracted_value: extracted,
            });
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    // -- Internals ----------------------------------------------------------

    fn build_filter(&self, query: &ListQuery) -> Result<SqlFilter> {
        let mut sql = SqlFilter::new();
        if let Some(session_id) = &query.session_id {
            sql.push("session_id = ?");
            sql.bind(session_id.clone());
        }
        if let Some(label) = &query.label {
            sql.push("label = ?");
            sql.bind(label.clone());
        }
        if let Some(filter) = &query.filter {
            filter.apply(&mut sql, &self.regex_cache)?;
        }
        Ok(sql)
    }

    fn evict_if_needed(&self) -> Result<()> {
        let conn = self.conn.lock();
        let unsaved: i64 =
            conn.query_row("SELECT COUNT(*) FROM requests WHERE saved = 0", [], |row| {
                row.get(0)
            })?;
        let overflow = unsaved - self.max_stored_requests as i64;
        if overflow > 0 {
            let deleted = conn.execute(
                "DELETE FROM requests WHERE id IN (
                     SELECT id FROM requests WHERE saved = 0
                     ORDER BY timestamp ASC, id ASC LIMIT ?1
                 )",
                [overflow],
            )?;
            tracing::debug!(deleted, "Evicted oldest unsaved requests");
        }
        Ok(())
    }
}

fn bound<'a>(
    sql: &'a SqlFilter,
) -> rusqlite::ParamsFromIter<impl Iterator<Item = &'a dyn ToSql> + 'a> {
    rusqlite::params_from_iter(sql.params.iter().map(|p| p.as_ref() as &dyn ToSql))
}

fn register_regexp(conn: &Connection, cache: Arc<RegexCache>) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        "regexp",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        move |ctx| {
            let pattern: String = ctx.get(0)?;
            let text: Option<String> = ctx.get(1)?;
            let Some(text) = text else {
                return Ok(false);
            };
            let regex = cache
                .get(&pattern, "")
                .map_err(|e| rusqlite::Error::UserFunctionError(Box::new(e)))?;
            Ok(regex.is_match(&text))
        },
    )
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// 128-bit random hex token.
fn random_token() -> String {
    let bytes: [u8; 16] = rand::random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        label: row.get(1)?,
        source: row.get(2)?,
        pid: row.get(3)?,
        started_at: row.get(4)?,
        internal_token: row.get(5)?,
    })
}

/// Corrupt stored header JSON parses back to the empty map rather than
/// failing the query.
fn parse_headers(raw: Option<String>) -> HashMap<String, String> {
    raw.and_then(|json| serde_json::from_str(&json).ok())
        .unwrap_or_default()
}

fn row_to_request(row: &rusqlite::Row<'_>) -> rusqlite::Result<CapturedRequest> {
    let response_status: Option<u16> = row.get(12)?;
    let response_headers_raw: Option<String> = row.get(13)?;
    Ok(CapturedRequest {
        id: row.get(0)?,
        session_id: row.get(1)?,
        timestamp: row.get(2)?,
        duration_ms: row.get(3)?,
        method: row.get(4)?,
        url: row.get(5)?,
        host: row.get(6)?,
        path: row.get(7)?,
        request_headers: parse_headers(row.get(8)?),
        request_body: row.get(9)?,
        request_body_truncated: row.get(10)?,
        request_content_type: row.get(11)?,
        response_status,
        response_headers: response_status.map(|_| parse_headers(response_headers_raw)),
        response_body: row.get(14)?,
        response_body_truncated: row.get(15)?,
        response_content_type: row.get(16)?,
        label: row.get(17)?,
        source: row.get(18)?,
        intercepted_by: row.get(19)?,
        interception_type: row
            .get::<_, Option<String>>(20)?
            .as_deref()
            .and_then(InterceptionType::parse),
        replayed_from_id: row.get(21)?,
        replay_initiator: row
            .get::<_, Option<String>>(22)?
            .as_deref()
            .and_then(ReplayInitiator::parse),
        saved: row.get(23)?,
    })
}

fn row_to_summary(row: &rusqlite::Row<'_>) -> rusqlite::Result<RequestSummary> {
    Ok(RequestSummary {
        id: row.get(0)?,
        session_id: row.get(1)?,
        timestamp: row.get(2)?,
        duration_ms: row.get(3)?,
        method: row.get(4)?,
        url: row.get(5)?,
        host: row.get(6)?,
        path: row.get(7)?,
        request_content_type: row.get(8)?,
        request_body_size: row.get::<_, i64>(9)? as u64,
        request_body_truncated: row.get(10)?,
        response_status: row.get(11)?,
        response_content_type: row.get(12)?,
        response_body_size: row.get::<_, i64>(13)? as u64,
        response_body_truncated: row.get(14)?,
        label: row.get(15)?,
        source: row.get(16)?,
        intercepted_by: row.get(17)?,
        interception_type: row
            .get::<_, Option<String>>(18)?
            .as_deref()
            .and_then(InterceptionType::parse),
        replayed_from_id: row.get(19)?,
        replay_initiator: row
            .get::<_, Option<String>>(20)?
            .as_deref()
            .and_then(ReplayInitiator::parse),
        saved: row.get(21)?,
    })
}

fn summarize(request: &CapturedRequest) -> RequestSummary {
    RequestSummary {
        id: request.id.clone(),
        session_id: request.session_id.clone(),
        timestamp: request.timestamp,
        duration_ms: request.duration_ms,
        method: request.method.clone(),
        url: request.url.clone(),
        host: request.host.clone(),
        path: request.path.clone(),
        request_content_type: request.request_content_type.clone(),
        request_body_size: request.request_body.as_ref().map_or(0, |b| b.len() as u64),
        request_body_truncated: request.request_body_truncated,
        response_status: request.response_status,
        response_content_type: request.response_content_type.clone(),
        response_body_size: request.response_body.as_ref().map_or(0, |b| b.len() as u64),
        response_body_truncated: request.response_body_truncated,
        label: request.label.clone(),
        source: request.source.clone(),
        intercepted_by: request.intercepted_by.clone(),
        interception_type: request.interception_type,
        replayed_from_id: request.replayed_from_id.clone(),
        replay_initiator: request.replay_initiator,
        saved: request.saved,
    }
}

fn extract_for_row(
    request: &CapturedRequest,
    query: &JsonBodyQuery,
) -> Option<serde_json::Value> {
    let from_request = if query.target.includes_request() {
        request
            .request_body
            .as_deref()
            .and_then(|b| serde_json::from_slice::<serde_json::Value>(b).ok())
            .and_then(|v| json_path_extract(&v, &query.path))
    } else {
        None
    };
    // Request-body extraction is preferred for target = both.
    if from_request.is_some() {
        return from_request;
    }
    if query.target.includes_response() {
        return request
            .response_body
            .as_deref()
            .and_then(|b| serde_json::from_slice::<serde_json::Value>(b).ok())
            .and_then(|v| json_path_extract(&v, &query.path));
    }
    None
}

/// Evaluate a dotted JSON path (`$.items[0].name` or `items[0].name`)
/// against a value.
pub(crate) fn json_path_extract(value: &serde_json::Value, path: &str) -> Option<serde_json::Value> {
    let path = path.strip_prefix('$').unwrap_or(path);
    let path = path.strip_prefix('.').unwrap_or(path);
    if path.is_empty() {
        return Some(value.clone());
    }

    let mut current = value;
    for segment in path.split('.') {
        let (key, indexes) = parse_segment(segment)?;
        if !key.is_empty() {
            current = current.get(key)?;
        }
        for index in indexes {
            current = current.get(index)?;
        }
    }
    Some(current.clone())
}

/// Split `items[0][1]` into `("items", [0, 1])`.
fn parse_segment(segment: &str) -> Option<(&str, Vec<usize>)> {
    let bracket = match segment.find('[') {
        Some(pos) => pos,
        None => return Some((segment, Vec::new())),
    };
    let key = &segment[..bracket];
    let mut indexes = Vec::new();
    let mut rest = &segment[bracket..];
    while let Some(stripped) = rest.strip_prefix('[') {
        let close = stripped.find(']')?;
        indexes.push(stripped[..close].parse().ok()?);
        rest = &stripped[close + 1..];
    }
    if rest.is_empty() {
        Some((key, indexes))
    } else {
        None
    }
}
