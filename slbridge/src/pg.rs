// pg.rs

//! The backend session: one [`Session`] per pooled connection, owning the
//! prepared-statement name cache and the short-TTL query result cache that
//! sit between a logical statement and the wire.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use fnv::FnvHasher;
use std::hash::Hasher;

use crate::native::NativeConnection;
use crate::value::{Type, Value};
use crate::Error;

const PREPARED_NAME_CACHE_CAPACITY: usize = 256;

/// Lets a [`Value`] be bound directly as a query parameter. Type checking
/// is deliberately bypassed (`accepts` always answers `true`): by the time
/// a value reaches here it has already been through the typed `bind_*`
/// entry points, and the backend itself is the final authority on whether
/// the bytes fit the column.
impl postgres::types::ToSql for Value {
    fn to_sql(
        &self,
        ty: &postgres::types::Type,
        out: &mut bytes::BytesMut,
    ) -> Result<postgres::types::IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self {
            Value::Null => Ok(postgres::types::IsNull::Yes),
            Value::Integer(i) => i.to_sql(ty, out),
            Value::Float(f) => f.to_sql(ty, out),
            Value::Text(s) => s.to_sql(ty, out),
            Value::Blob(b) => b.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &postgres::types::Type) -> bool {
        true
    }

    postgres::types::to_sql_checked!();
}

/// One column of a result set, as reported by the backend.
#[derive(Debug, Clone)]
pub struct ColumnMeta {
    pub name: String,
    pub decl_type: Type,
}

/// The full result of running one statement.
#[derive(Debug, Clone)]
pub struct QueryOutcome {
    pub columns: Vec<ColumnMeta>,
    pub rows: Vec<Vec<Value>>,
    pub rows_affected: u64,
}

/// Whether `sql` can return rows the caller wants decoded — a `SELECT`/
/// `WITH`/`EXPLAIN`/`VALUES` statement, or any statement carrying its own
/// `RETURNING` clause. Anything else (a plain `UPDATE`/`DELETE`/`INSERT`
/// with no `RETURNING`) is run through `Client::execute` instead, which is
/// the only way the backend's command-tag row count survives: `query`
/// silently reports zero rows for a statement that returns none, which
/// would otherwise starve `changes`/`changes64`.
fn statement_returns_rows(sql: &str) -> bool {
    let head = sql
        .trim_start()
        .split(|c: char| c.is_whitespace() || c == '(')
        .find(|w| !w.is_empty())
        .unwrap_or("")
        .to_ascii_uppercase();
    if matches!(head.as_str(), "SELECT" | "WITH" | "EXPLAIN" | "VALUES") {
        return true;
    }
    sql.to_ascii_uppercase().contains("RETURNING")
}

/// Runs `sql` against a live `postgres::Client`, decoding every returned
/// cell into our own [`Value`] by its reported OID.
///
/// `numeric` columns decode as `f64`; precision beyond what a double can
/// hold is not preserved.
pub(crate) fn run_query(
    client: &mut postgres::Client,
    sql: &str,
    params: &[Value],
) -> Result<QueryOutcome, Error> {
    let bound: Vec<&(dyn postgres::types::ToSql + Sync)> = params
        .iter()
        .map(|v| v as &(dyn postgres::types::ToSql + Sync))
        .collect();

    if !statement_returns_rows(sql) {
        let rows_affected = client.execute(sql, &bound)?;
        return Ok(QueryOutcome {
            columns: Vec::new(),
            rows: Vec::new(),
            rows_affected,
        });
    }

    let rows = client.query(sql, &bound)?;
    let rows_affected = rows.len() as u64;

    let columns: Vec<ColumnMeta> = rows
        .get(0)
        .map(|r| {
            r.columns()
                .iter()
                .map(|c| ColumnMeta {
                    name: c.name().to_string(),
                    decl_type: Type::from_pg_oid(c.type_().oid()),
                })
                .collect()
        })
        .unwrap_or_default();

    let mut decoded_rows = Vec::with_capacity(rows.len());
    for row in &rows {
        let mut values = Vec::with_capacity(row.columns().len());
        for (i, col) in row.columns().iter().enumerate() {
            values.push(decode_cell(row, i, col.type_().oid()));
        }
        decoded_rows.push(values);
    }

    Ok(QueryOutcome {
        columns,
        rows: decoded_rows,
        rows_affected,
    })
}

fn decode_cell(row: &postgres::Row, idx: usize, oid: u32) -> Value {
    match oid {
        16 => row
            .get::<_, Option<bool>>(idx)
            .map(Value::bool_text)
            .unwrap_or(Value::Null),
        21 => row
            .get::<_, Option<i16>>(idx)
            .map(|v| Value::Integer(v as i64))
            .unwrap_or(Value::Null),
        23 | 26 => row
            .get::<_, Option<i32>>(idx)
            .map(|v| Value::Integer(v as i64))
            .unwrap_or(Value::Null),
        20 => row
            .get::<_, Option<i64>>(idx)
            .map(Value::Integer)
            .unwrap_or(Value::Null),
        700 => row
            .get::<_, Option<f32>>(idx)
            .map(|v| Value::Float(v as f64))
            .unwrap_or(Value::Null),
        701 | 1700 => row
            .get::<_, Option<f64>>(idx)
            .map(Value::Float)
            .unwrap_or(Value::Null),
        17 => row
            .get::<_, Option<Vec<u8>>>(idx)
            .map(|b| Value::bytea_text(&b))
            .unwrap_or(Value::Null),
        _ => row
            .get::<_, Option<String>>(idx)
            .map(Value::Text)
            .unwrap_or(Value::Null),
    }
}

/// FNV-1a over the translated SQL plus NUL-separated parameter text, used
/// both as the short-TTL result-cache key and as the deterministic source
/// of a prepared-statement name.
fn fnv1a(sql: &str, params: &[Value]) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(sql.as_bytes());
    for p in params {
        hasher.write(&[0]);
        hasher.write(p.to_text().as_bytes());
    }
    hasher.finish()
}

struct CachedResult {
    outcome: QueryOutcome,
    expires_at: Instant,
    refcount: usize,
}

/// A short-TTL cache of query results, keyed by a hash of the translated
/// SQL and its bound parameters. This is a latency optimization only: a
/// miss always falls through to a live query, and nothing downstream may
/// treat a cache hit as more authoritative than a live result would have
/// been.
struct QueryCache {
    ttl: Duration,
    entries: HashMap<u64, CachedResult>,
}

impl QueryCache {
    fn new(ttl: Duration) -> Self {
        QueryCache {
            ttl,
            entries: HashMap::new(),
        }
    }

    fn get(&mut self, key: u64) -> Option<QueryOutcome> {
        if self.ttl.is_zero() {
            return None;
        }
        match self.entries.get(&key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.outcome.clone()),
            Some(_) => {
                self.entries.remove(&key);
                None
            }
            None => None,
        }
    }

    fn put(&mut self, key: u64, outcome: QueryOutcome) {
        if self.ttl.is_zero() {
            return;
        }
        self.entries.insert(
            key,
            CachedResult {
                outcome,
                expires_at: Instant::now() + self.ttl,
                refcount: 0,
            },
        );
    }

    fn evict_expired(&mut self) {
        let now = Instant::now();
        self.entries
            .retain(|_, entry| entry.refcount > 0 || entry.expires_at > now);
    }
}

/// One backend connection plus the caches layered on top of it.
pub struct Session {
    connection: Box<dyn NativeConnection>,
    prepared_names: HashMap<u64, String>,
    prepared_order: Vec<u64>,
    cache: QueryCache,
    poisoned: bool,
}

impl Session {
    pub fn new(connection: Box<dyn NativeConnection>, cache_ttl: Duration) -> Self {
        Session {
            connection,
            prepared_names: HashMap::new(),
            prepared_order: Vec::new(),
            cache: QueryCache::new(cache_ttl),
            poisoned: false,
        }
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    pub fn mark_poisoned(&mut self) {
        self.poisoned = true;
    }

    pub fn is_healthy(&mut self) -> bool {
        !self.poisoned && self.connection.is_healthy()
    }

    /// Returns the remote prepared-statement name for `sql`, assigning and
    /// caching a new deterministic one (`slb_<hash>`) on first use. Evicts
    /// the oldest entry once the cache is full, matching the eviction the
    /// pool slot leaving `Ready` state also triggers (see
    /// [`Session::clear_prepared_cache`]).
    pub fn prepared_name(&mut self, sql: &str) -> String {
        let key = fnv1a(sql, &[]);
        if let Some(name) = self.prepared_names.get(&key) {
            return name.clone();
        }
        if self.prepared_order.len() >= PREPARED_NAME_CACHE_CAPACITY {
            if let Some(oldest) = self.prepared_order.first().copied() {
                self.prepared_names.remove(&oldest);
                self.prepared_order.remove(0);
            }
        }
        let name = format!("slb_{:016x}", key);
        self.prepared_names.insert(key, name.clone());
        self.prepared_order.push(key);
        name
    }

    /// Invalidated whenever the owning pool slot leaves the `Ready` state:
    /// a reconnect means the remote session (and with it, every prepared
    /// name it ever issued) no longer exists.
    pub fn clear_prepared_cache(&mut self) {
        self.prepared_names.clear();
        self.prepared_order.clear();
    }

    /// Runs `sql`, consulting and refreshing the query cache around the
    /// live call. A cache hit never reaches [`NativeConnection::execute`].
    pub fn execute(&mut self, sql: &str, params: &[Value]) -> Result<QueryOutcome, Error> {
        let key = fnv1a(sql, params);
        if let Some(hit) = self.cache.get(key) {
            return Ok(hit);
        }

        let outcome = match self.connection.execute(sql, params) {
            Ok(o) => o,
            Err(e) => {
                if is_connection_fatal(&e) {
                    self.poisoned = true;
                } else {
                    // Best-effort: drain whatever implicit transaction the
                    // failing statement left open. A session already this
                    // broken won't mind an extra failing command.
                    let _ = self.connection.execute("ROLLBACK", &[]);
                }
                return Err(e);
            }
        };

        self.cache.put(key, outcome.clone());
        self.cache.evict_expired();
        Ok(outcome)
    }
}

/// Classifies an error as connection-fatal (the pool slot must reconnect)
/// versus statement-local (the connection is still good for the next
/// statement).
fn is_connection_fatal(err: &Error) -> bool {
    match err {
        Error::Remote(e) => e.is_closed() || e.as_db_error().is_none(),
        Error::Session(_) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::tests::FakeEngine;
    use crate::native::NativeEngine;

    fn session_with_cache(ttl_secs: u64) -> Session {
        let engine = FakeEngine::new();
        let conn = engine.connect().unwrap();
        Session::new(conn, Duration::from_secs(ttl_secs))
    }

    #[test]
    fn statement_returns_rows_recognizes_selects_and_returning_clauses() {
        assert!(statement_returns_rows("SELECT 1"));
        assert!(statement_returns_rows("  with t as (select 1) select * from t"));
        assert!(statement_returns_rows(
            "INSERT INTO t(a) VALUES(1) RETURNING id"
        ));
        assert!(!statement_returns_rows("UPDATE t SET a = 1 WHERE id = 1"));
        assert!(!statement_returns_rows("DELETE FROM t WHERE id = 1"));
    }

    #[test]
    fn prepared_names_are_deterministic_and_stable_per_sql() {
        let mut session = session_with_cache(0);
        let a = session.prepared_name("SELECT 1");
        let b = session.prepared_name("SELECT 1");
        let c = session.prepared_name("SELECT 2");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn clearing_prepared_cache_forgets_every_name() {
        let mut session = session_with_cache(0);
        let first = session.prepared_name("SELECT 1");
        session.clear_prepared_cache();
        let second = session.prepared_name("SELECT 1");
        // Same SQL still yields the same deterministic name; what's gone is
        // the cache entry, not the name's derivation.
        assert_eq!(first, second);
    }

    #[test]
    fn zero_ttl_disables_the_result_cache() {
        let mut session = session_with_cache(0);
        let first = session.execute("SELECT 1", &[]).unwrap();
        let second = session.execute("SELECT 1", &[]).unwrap();
        assert_eq!(first.rows, second.rows);
        assert!(session.cache.entries.is_empty());
    }

    #[test]
    fn positive_ttl_populates_the_result_cache() {
        let mut session = session_with_cache(30);
        session.execute("SELECT 1", &[]).unwrap();
        assert_eq!(session.cache.entries.len(), 1);
    }

    #[test]
    fn a_non_fatal_statement_failure_issues_a_best_effort_rollback() {
        use crate::native::tests::ROLLBACK_CALLS;
        use std::sync::atomic::Ordering;

        ROLLBACK_CALLS.store(false, Ordering::SeqCst);
        let mut session = session_with_cache(0);
        assert!(session.execute("FAIL_NOT_FATAL", &[]).is_err());
        assert!(ROLLBACK_CALLS.load(Ordering::SeqCst));
    }
}
