//! Request filter algebra
//!
//! [`RequestFilter`] combines its fields conjunctively; absent fields are
//! wildcards. Filters compile to SQL `WHERE` clauses with bound
//! parameters. URL regex filters run through a `regexp` UDF backed by a
//! bounded LRU of compiled expressions so ad-hoc control-plane queries
//! cannot grow memory without bound.

use crate::error::{ProcsiError, Result};
use parking_lot::Mutex;
use regex::Regex;
use rusqlite::ToSql;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Which side of the exchange a header or body predicate inspects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Request,
    Response,
    #[default]
    Both,
}

impl Side {
    pub fn includes_request(self) -> bool {
        matches!(self, Side::Request | Side::Both)
    }

    pub fn includes_response(self) -> bool {
        matches!(self, Side::Response | Side::Both)
    }
}

/// Conjunctive filter over captured requests. Every populated field must
/// hold for a row to match.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RequestFilter {
    /// IN-set of HTTP methods.
    pub methods: Option<Vec<String>>,
    /// `"2xx"`, `"404"`, or `"500-503"`. Unrecognized forms are ignored.
    pub status_range: Option<String>,
    /// Whitespace-split terms, each a substring of url or path.
    pub search: Option<String>,
    /// Regular expression matched against the full URL. Supports the
    /// `/pattern/flags` literal form.
    pub regex: Option<String>,
    pub regex_flags: Option<String>,
    /// Exact host, or suffix match when the value begins with `.`.
    pub host: Option<String>,
    pub path_prefix: Option<String>,
    /// Inclusive lower bound, ms since epoch.
    pub since: Option<i64>,
    /// Exclusive upper bound, ms since epoch.
    pub before: Option<i64>,
    /// Header name (lowercased); without a value this is an existence
    /// check.
    pub header_name: Option<String>,
    pub header_value: Option<String>,
    pub header_target: Option<Side>,
    pub intercepted_by: Option<String>,
    pub saved: Option<bool>,
    pub source: Option<String>,
}

/// Query envelope for request listings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListQuery {
    pub session_id: Option<String>,
    pub label: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    pub filter: Option<RequestFilter>,
}

/// Compiled WHERE fragment: clauses joined with AND, parameters bound in
/// clause order.
pub(crate) struct SqlFilter {
    pub clauses: Vec<String>,
    pub params: Vec<Box<dyn ToSql + Send>>,
}

impl SqlFilter {
    pub(crate) fn new() -> Self {
        Self {
            clauses: Vec::new(),
            params: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, clause: impl Into<String>) {
        self.clauses.push(clause.into());
    }

    pub(crate) fn bind<T: ToSql + Send + 'static>(&mut self, value: T) {
        self.params.push(Box::new(value));
    }

    pub(crate) fn where_sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }
}

/// Status-range forms accepted by [`RequestFilter::status_range`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StatusClause {
    Exact(u16),
    /// `[lo, hi)` half-open, from the `Nxx` form.
    HalfOpen(u16, u16),
    /// `[lo, hi]` inclusive, from the `lo-hi` form.
    Inclusive(u16, u16),
}

/// Parse a status-range string. Unrecognized forms yield `None` and are
/// silently dropped at the repository layer.
pub(crate) fn parse_status_range(raw: &str) -> Option<StatusClause> {
    let raw = raw.trim();

    if let Some(prefix) = raw.strip_suffix("xx") {
        if prefix.len() == 1 {
            let n: u16 = prefix.parse().ok()?;
            if (1..=5).contains(&n) {
                return Some(StatusClause::HalfOpen(n * 100, (n + 1) * 100));
            }
        }
        return None;
    }

    if let Some((lo_str, hi_str)) = raw.split_once('-') {
        let lo: u16 = lo_str.trim().parse().ok()?;
        let hi: u16 = hi_str.trim().parse().ok()?;
        if valid_status(lo) && valid_status(hi) && lo <= hi {
            return Some(StatusClause::Inclusive(lo, hi));
        }
        return None;
    }

    let code: u16 = raw.parse().ok()?;
    if valid_status(code) {
        return Some(StatusClause::Exact(code));
    }
    None
}

fn valid_status(code: u16) -> bool {
    (100..=599).contains(&code)
}

/// Escape `%`, `_` and the escape character itself for a LIKE pattern
/// using `ESCAPE '\'`.
pub(crate) fn escape_like(term: &str) -> String {
    let mut out = String::with_capacity(term.len());
    for ch in term.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

/// Normalize a regex filter into `(pattern, flags)`, unwrapping the
/// `/pattern/flags` literal form when present. Explicit flags win over
/// literal flags.
pub(crate) fn normalize_regex(pattern: &str, flags: Option<&str>) -> (String, String) {
    if let Some(stripped) = pattern.strip_prefix('/') {
        if let Some(slash) = stripped.rfind('/') {
            let literal_flags = &stripped[slash + 1..];
            if literal_flags.chars().all(|c| c.is_ascii_alphabetic()) {
                let inner = &stripped[..slash];
                let flags = match flags {
                    Some(f) if !f.is_empty() => f.to_string(),
                    _ => literal_flags.to_string(),
                };
                return (inner.to_string(), flags);
            }
        }
    }
    (pattern.to_string(), flags.unwrap_or("").to_string())
}

/// Translate JS-style flags into an inline `(?...)` group. Unsupported
/// flags (`g`, `u`, `y`) are dropped.
fn combine_pattern(pattern: &str, flags: &str) -> String {
    let inline: String = flags
        .chars()
        .filter(|c| matches!(c, 'i' | 'm' | 's' | 'x'))
        .collect();
    if inline.is_empty() {
        pattern.to_string()
    } else {
        format!("(?{inline}){pattern}")
    }
}

struct CacheEntry {
    regex: Arc<Regex>,
    tick: u64,
}

/// Bounded LRU of compiled regexes keyed by `flags\0pattern`.
pub struct RegexCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
}

struct CacheInner {
    map: HashMap<String, CacheEntry>,
    tick: u64,
}

impl RegexCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(CacheInner {
                map: HashMap::new(),
                tick: 0,
            }),
        }
    }

    /// Fetch or compile `(pattern, flags)`. Compilation errors propagate
    /// to the caller as query validation errors.
    pub fn get(&self, pattern: &str, flags: &str) -> std::result::Result<Arc<Regex>, regex::Error> {
        let key = format!("{flags}\0{pattern}");
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;

        if let Some(entry) = inner.map.get_mut(&key) {
            entry.tick = tick;
            return Ok(entry.regex.clone());
        }

        let regex = Arc::new(Regex::new(&combine_pattern(pattern, flags))?);
        if inner.map.len() >= self.capacity {
            if let Some(oldest) = inner
                .map
                .iter()
                .min_by_key(|(_, e)| e.tick)
                .map(|(k, _)| k.clone())
            {
                inner.map.remove(&oldest);
            }
        }
        inner.map.insert(key, CacheEntry { regex: regex.clone(), tick });
        Ok(regex)
    }
}

impl RequestFilter {
    /// Compile the filter into WHERE clauses. Regex validation failures
    /// surface here; every other malformed field degrades to a wildcard.
    pub(crate) fn apply(&self, sql: &mut SqlFilter, cache: &RegexCache) -> Result<()> {
        if let Some(methods) = &self.methods {
            if !methods.is_empty() {
                let placeholders = vec!["?"; methods.len()].join(", ");
                sql.push(format!("method IN ({placeholders})"));
                for method in methods {
                    sql.bind(method.to_uppercase());
                }
            }
        }

        if let Some(range) = &self.status_range {
            match parse_status_range(range) {
                Some(StatusClause::Exact(code)) => {
                    sql.push("response_status = ?");
                    sql.bind(code as i64);
                }
                Some(StatusClause::HalfOpen(lo, hi)) => {
                    sql.push("response_status >= ? AND response_status < ?");
                    sql.bind(lo as i64);
                    sql.bind(hi as i64);
                }
                Some(StatusClause::Inclusive(lo, hi)) => {
                    sql.push("response_status BETWEEN ? AND ?");
                    sql.bind(lo as i64);
                    sql.bind(hi as i64);
                }
                None => {
                    tracing::debug!(range = %range, "Ignoring unrecognized statusRange");
                }
            }
        }

        if let Some(search) = &self.search {
            for term in search.split_whitespace() {
                let pattern = format!("%{}%", escape_like(term));
                sql.push("(url LIKE ? ESCAPE '\\' OR path LIKE ? ESCAPE '\\')");
                sql.bind(pattern.clone());
                sql.bind(pattern);
            }
        }

        if let Some(regex) = &self.regex {
            let (pattern, flags) = normalize_regex(regex, self.regex_flags.as_deref());
            // Compile now so a bad pattern fails the query instead of
            // erroring row-by-row inside the UDF.
            cache
                .get(&pattern, &flags)
                .map_err(|e| ProcsiError::Validation(format!("Invalid regex filter: {e}")))?;
            sql.push("url REGEXP ?");
            sql.bind(combine_pattern(&pattern, &flags));
        }

        if let Some(host) = &self.host {
            if let Some(_suffix) = host.strip_prefix('.') {
                sql.push("host LIKE ? ESCAPE '\\'");
                sql.bind(format!("%{}", escape_like(host)));
            } else {
                sql.push("host = ?");
                sql.bind(host.clone());
            }
        }

        if let Some(prefix) = &self.path_prefix {
            sql.push("path LIKE ? ESCAPE '\\'");
            sql.bind(format!("{}%", escape_like(prefix)));
        }

        if let Some(since) = self.since {
            sql.push("timestamp >= ?");
            sql.bind(since);
        }

        if let Some(before) = self.before {
            sql.push("timestamp < ?");
            sql.bind(before);
        }

        if let Some(name) = &self.header_name {
            let name = name.to_lowercase();
            let path = format!("$.\"{}\"", name.replace('"', "\\\""));
            let target = self.header_target.unwrap_or_default();
            let mut sides = Vec::new();
            if target.includes_request() {
                sides.push("json_extract(request_headers, ?)");
            }
            if target.includes_response() {
                sides.push("json_extract(coalesce(response_headers, '{}'), ?)");
            }

            match &self.header_value {
                Some(value) => {
                    let parts: Vec<String> =
                        sides.iter().map(|s| format!("{s} = ?")).collect();
                    sql.push(format!("({})", parts.join(" OR ")));
                    for _ in 0..parts.len() {
                        sql.bind(path.clone());
                        sql.bind(value.clone());
                    }
                }
                None => {
                    let parts: Vec<String> =
                        sides.iter().map(|s| format!("{s} IS NOT NULL")).collect();
                    sql.push(format!("({})", parts.join(" OR ")));
                    for _ in 0..parts.len() {
                        sql.bind(path.clone());
                    }
                }
            }
        }

        if let Some(name) = &self.intercepted_by {
            sql.push("intercepted_by = ?");
            sql.bind(name.clone());
        }

        if let Some(saved) = self.saved {
            sql.push("saved = ?");
            sql.bind(saved as i64);
        }

        if let Some(source) = &self.source {
            sql.push("source = ?");
            sql.bind(source.clone());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_range_forms() {
        assert_eq!(parse_status_range("2xx"), Some(StatusClause::HalfOpen(200, 300)));
        assert_eq!(parse_status_range("404"), Some(StatusClause::Exact(404)));
        assert_eq!(
            parse_status_range("500-503"),
            Some(StatusClause::Inclusive(500, 503))
        );
        assert_eq!(parse_status_range("999"), None);
        assert_eq!(parse_status_range("9xx"), None);
        assert_eq!(parse_status_range("503-500"), None);
        assert_eq!(parse_status_range("banana"), None);
        assert_eq!(parse_status_range("42"), None);
    }

    #[test]
    fn test_escape_like_escapes_wildcards() {
        assert_eq!(escape_like("100%_done\\"), "100\\%\\_done\\\\");
        assert_eq!(escape_like("plain"), "plain");
    }

    #[test]
    fn test_normalize_regex_literal_form() {
        assert_eq!(
            normalize_regex("/api\\/v1/i", None),
            ("api\\/v1".to_string(), "i".to_string())
        );
        assert_eq!(
            normalize_regex("plain.*pattern", Some("im")),
            ("plain.*pattern".to_string(), "im".to_string())
        );
        // Explicit flags win over literal flags.
        assert_eq!(
            normalize_regex("/x/g", Some("i")),
            ("x".to_string(), "i".to_string())
        );
    }

    #[test]
    fn test_combine_pattern_drops_unsupported_flags() {
        assert_eq!(combine_pattern("abc", "gi"), "(?i)abc");
        assert_eq!(combine_pattern("abc", "g"), "abc");
        assert_eq!(combine_pattern("abc", ""), "abc");
    }

    #[test]
    fn test_regex_cache_reuses_and_bounds() {
        let cache = RegexCache::new(2);
        let a1 = cache.get("foo", "i").unwrap();
        let a2 = cache.get("foo", "i").unwrap();
        assert!(Arc::ptr_eq(&a1, &a2));

        cache.get("bar", "").unwrap();
        cache.get("baz", "").unwrap();
        // "foo" may have been evicted, but the cache still answers.
        assert!(cache.get("foo", "i").is_ok());
        assert!(cache.get("(", "").is_err());
    }

    #[test]
    fn test_filter_builds_conjunctive_sql() {
        let cache = RegexCache::new(8);
        let filter = RequestFilter {
            methods: Some(vec!["get".into(), "POST".into()]),
            status_range: Some("2xx".into()),
            search: Some("users admin".into()),
            host: Some(".example.com".into()),
            saved: Some(true),
            ..Default::default()
        };
        let mut sql = SqlFilter::new();
        filter.apply(&mut sql, &cache).unwrap();
        let where_sql = sql.where_sql();
        assert!(where_sql.contains("method IN (?, ?)"));
        assert!(where_sql.contains("response_status >= ? AND response_status < ?"));
        assert!(where_sql.contains("host LIKE ? ESCAPE '\\'"));
        // Two search terms, each matching url or path.
        assert_eq!(where_sql.matches("url LIKE").count(), 2);
        assert_eq!(sql.params.len(), 2 + 2 + 4 + 1 + 1);
    }

    #[test]
    fn test_invalid_regex_is_a_validation_error() {
        let cache = RegexCache::new(8);
        let filter = RequestFilter {
            regex: Some("(unclosed".into()),
            ..Default::default()
        };
        let mut sql = SqlFilter::new();
        let err = filter.apply(&mut sql, &cache).unwrap_err();
        assert!(err.to_string().contains("Invalid regex"));
    }

    #[test]
    fn test_unrecognized_status_range_is_ignored() {
        let cache = RegexCache::new(8);
        let filter = RequestFilter {
            status_range: Some("999".into()),
            ..Default::default()
        };
        let mut sql = SqlFilter::new();
        filter.apply(&mut sql, &cache).unwrap();
        assert!(sql.where_sql().is_empty());
    }

    #[test]
    fn test_side_defaults_to_both() {
        let side: Side = serde_json::from_str("\"request\"").unwrap();
        assert!(side.includes_request());
        assert!(!side.includes_response());
        assert_eq!(Side::default(), Side::Both);
    }
}
