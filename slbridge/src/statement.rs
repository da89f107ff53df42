// statement.rs

//! The statement lifecycle: prepare, bind, step, reset, clear bindings,
//! finalize.
//!
//! A [`Statement`] owns its translated SQL and its parameter vector, but
//! nothing network-facing — every operation that actually talks to the
//! backend takes a [`PoolLease`] explicitly, so the statement itself stays
//! `Send` and cheap to hold even while its owning thread is between calls.
//!
//! Query execution is deferred to the first [`Statement::step`] call, or to
//! the first metadata accessor (`column_count`/`column_name`/
//! `column_decltype`) if the host asks for shape before it asks for rows —
//! either way the statement runs at most once, and a later `step` after a
//! metadata-triggered run reuses the same result set rather than
//! re-executing.

use crate::guard;
use crate::pg::{ColumnMeta, QueryOutcome};
use crate::pool::PoolLease;
use crate::translator::{self, Translation};
use crate::upsert::ConflictRegistry;
use crate::value::{Type, Value};
use crate::Error;

/// Whether `PREPARE` flags asked the backend to hold on to this statement's
/// plan past a single use (`SQLITE_PREPARE_PERSISTENT`'s analogue).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct PrepareFlags {
    pub persistent: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepResult {
    Row,
    Done,
}

/// One prepared statement, from `prepare` through `finalize` (`finalize` is
/// simply dropping the value: there is no separate teardown call).
pub struct Statement {
    original_sql: String,
    translated_sql: String,
    param_count: usize,
    param_names: Vec<String>,
    params: Vec<Value>,
    outcome: Option<QueryOutcome>,
    current_row: i64,
    skip: bool,
    flags: PrepareFlags,
}

impl Statement {
    pub fn prepare(sql: &str, registry: &ConflictRegistry) -> Result<Statement, Error> {
        Self::prepare_with_flags(sql, registry, PrepareFlags::default())
    }

    /// Prepares `sql`, translating it against `registry`'s upsert
    /// conflict-key overrides.
    ///
    /// Guarded by a thread-local recursion depth counter and a stack-use
    /// estimate (see [`crate::guard`]): a host callback that prepares a
    /// statement from inside another prepare/step call — a trigger body,
    /// a recursive CTE driving further prepares — gets a benign
    /// `Error::ResourcePressure` once the call chain is judged too deep,
    /// rather than running this thread's stack out.
    pub fn prepare_with_flags(
        sql: &str,
        registry: &ConflictRegistry,
        flags: PrepareFlags,
    ) -> Result<Statement, Error> {
        let _guard = guard::enter()?;

        if translator::is_skip_pattern(sql) {
            return Ok(Statement {
                original_sql: sql.to_string(),
                translated_sql: String::new(),
                param_count: 0,
                param_names: Vec::new(),
                params: Vec::new(),
                outcome: None,
                current_row: -1,
                skip: true,
                flags,
            });
        }

        let Translation {
            sql: translated_sql,
            param_count,
            param_names,
            ..
        } = translator::translate(sql, registry);

        Ok(Statement {
            original_sql: sql.to_string(),
            translated_sql,
            param_count,
            param_names,
            params: vec![Value::Null; param_count],
            outcome: None,
            current_row: -1,
            skip: false,
            flags,
        })
    }

    /// Like [`Statement::prepare`], but for the no-statement `exec` path:
    /// a bare `INSERT` gets `RETURNING id` appended so [`Statement::
    /// last_inserted_id`] has something to read without a follow-up
    /// `lastval()` round trip.
    pub fn prepare_for_exec(sql: &str, registry: &ConflictRegistry) -> Result<Statement, Error> {
        let mut stmt = Self::prepare(sql, registry)?;
        if !stmt.skip {
            stmt.translated_sql = translator::ensure_insert_returning_id(&stmt.translated_sql);
        }
        Ok(stmt)
    }

    pub fn is_skip(&self) -> bool {
        self.skip
    }

    pub fn is_persistent(&self) -> bool {
        self.flags.persistent
    }

    pub fn sql(&self) -> &str {
        &self.original_sql
    }

    pub fn param_count(&self) -> usize {
        self.param_count
    }

    pub fn param_name(&self, index: usize) -> Option<&str> {
        self.param_names.get(index.checked_sub(1)?).map(|s| s.as_str())
    }

    /// `sqlite3_bind_parameter_index`'s analogue: the 1-based position of a
    /// named placeholder (`:name`, `@name`, `$name`), or `0` if `name` does
    /// not appear in this statement — matching the embedded engine's own
    /// "not found" return rather than an error.
    pub fn param_index(&self, name: &str) -> usize {
        self.param_names
            .iter()
            .position(|n| n == name)
            .map(|i| i + 1)
            .unwrap_or(0)
    }

    /// Binds a 1-based parameter index, growing the parameter vector if the
    /// translator under-counted (e.g. a placeholder only reachable through
    /// a branch the translator's static pass could not see).
    pub fn bind(&mut self, index: usize, value: Value) -> Result<(), Error> {
        if index == 0 {
            return Err(Error::Misuse("parameter indices are 1-based".to_string()));
        }
        let idx = index - 1;
        if idx >= self.params.len() {
            self.params.resize(idx + 1, Value::Null);
        }
        self.params[idx] = value;
        Ok(())
    }

    pub fn clear_bindings(&mut self) {
        for p in self.params.iter_mut() {
            *p = Value::Null;
        }
    }

    /// Returns the statement to its pre-first-step state, keeping its
    /// bindings (matching the embedded engine's own `reset` contract:
    /// bindings survive a reset and are cleared only by `clear_bindings`).
    pub fn reset(&mut self) {
        self.outcome = None;
        self.current_row = -1;
    }

    fn ensure_executed(&mut self, lease: &PoolLease<'_>) -> Result<(), Error> {
        if self.outcome.is_some() || self.skip {
            return Ok(());
        }
        if self.flags.persistent {
            lease.with_session(|s| {
                s.prepared_name(&self.translated_sql);
            });
        }
        let outcome = lease.with_session(|s| s.execute(&self.translated_sql, &self.params))?;
        self.outcome = Some(outcome);
        self.current_row = -1;
        Ok(())
    }

    pub fn step(&mut self, lease: &PoolLease<'_>) -> Result<StepResult, Error> {
        if self.skip {
            return Ok(StepResult::Done);
        }
        self.ensure_executed(lease)?;
        let len = self.outcome.as_ref().map(|o| o.rows.len()).unwrap_or(0) as i64;
        if self.current_row + 1 < len {
            self.current_row += 1;
            Ok(StepResult::Row)
        } else {
            self.current_row = len;
            Ok(StepResult::Done)
        }
    }

    pub fn rows_affected(&self) -> u64 {
        self.outcome.as_ref().map(|o| o.rows_affected).unwrap_or(0)
    }

    /// The value of an `id` column in the first returned row, if the
    /// statement's result set has one — populated by an upsert's own
    /// `RETURNING id` or by [`Statement::prepare_for_exec`]'s appended one.
    /// `None` means this statement's execution defined no sequence value,
    /// which [`crate::registry::Runtime`] reports as `last_insert_rowid`
    /// staying at its previous value rather than resetting to zero.
    pub fn last_inserted_id(&self) -> Option<i64> {
        let outcome = self.outcome.as_ref()?;
        let idx = outcome.columns.iter().position(|c| c.name == "id")?;
        outcome.rows.first()?.get(idx).map(|v| v.to_i64())
    }

    pub fn column_count(&mut self, lease: &PoolLease<'_>) -> Result<usize, Error> {
        self.ensure_executed(lease)?;
        Ok(self.outcome.as_ref().map(|o| o.columns.len()).unwrap_or(0))
    }

    fn column(&self, index: usize) -> Option<&ColumnMeta> {
        self.outcome.as_ref().and_then(|o| o.columns.get(index))
    }

    pub fn column_name(&mut self, lease: &PoolLease<'_>, index: usize) -> Result<String, Error> {
        self.ensure_executed(lease)?;
        Ok(self.column(index).map(|c| c.name.clone()).unwrap_or_default())
    }

    pub fn column_decltype(&mut self, lease: &PoolLease<'_>, index: usize) -> Result<Type, Error> {
        self.ensure_executed(lease)?;
        Ok(self.column(index).map(|c| c.decl_type).unwrap_or(Type::Text))
    }

    /// The type code `column_type`/a synthetic value handle's `value_type`
    /// reports for `index`: `Null` for a NULL cell regardless of the
    /// column's declared type, otherwise the column's own declared type —
    /// never the current value's own Rust representation, which can
    /// differ (a hex-bytea column decodes to `Value::Text` internally, but
    /// still reports `Type::Blob`).
    pub fn column_type(&self, index: usize) -> Type {
        let value = self.current_value(index);
        if value.is_null() {
            return Type::Null;
        }
        self.column(index).map(|c| c.decl_type).unwrap_or(Type::Text)
    }

    /// The value at `index` in the current row, or `Value::Null` before the
    /// first `step`, after the last, or for an out-of-range index — the
    /// same forgiving contract the embedded engine's own column getters
    /// have when called outside their documented window.
    pub fn current_value(&self, index: usize) -> Value {
        if self.current_row < 0 {
            log::warn!("column accessor called before the first step; returning NULL");
            return Value::Null;
        }
        let value = self
            .outcome
            .as_ref()
            .and_then(|o| o.rows.get(self.current_row as usize))
            .and_then(|row| row.get(index))
            .cloned();
        if value.is_none() {
            log::warn!("column index {} out of range; returning NULL", index);
        }
        value.unwrap_or(Value::Null)
    }

    pub fn current_row_index(&self) -> i64 {
        self.current_row
    }

    /// `sqlite3_data_count`'s analogue: the column count while a row is
    /// live, `0` before the first `step` and after the last one.
    pub fn data_count(&self) -> usize {
        let row_count = self.outcome.as_ref().map(|o| o.rows.len()).unwrap_or(0);
        let mid_stream = self.current_row >= 0 && (self.current_row as usize) < row_count;
        if mid_stream {
            self.outcome.as_ref().map(|o| o.columns.len()).unwrap_or(0)
        } else {
            0
        }
    }

    /// `sqlite3_stmt_readonly`'s analogue: whether this statement's
    /// translated SQL can only read, never write. A skip-pattern statement
    /// (a local `PRAGMA` and the like) counts as read-only: it never
    /// touches the backend at all.
    pub fn is_readonly(&self) -> bool {
        if self.skip {
            return true;
        }
        let head = self
            .translated_sql
            .trim_start()
            .split(|c: char| c.is_whitespace() || c == '(')
            .find(|w| !w.is_empty())
            .unwrap_or("")
            .to_ascii_uppercase();
        matches!(head.as_str(), "SELECT" | "WITH" | "EXPLAIN" | "VALUES")
    }

    /// Renders the statement with every bound parameter substituted
    /// textually, for diagnostics (`sqlite3_expanded_sql`'s analogue).
    pub fn expanded_sql(&self) -> String {
        let mut out = self.translated_sql.clone();
        for (i, value) in self.params.iter().enumerate() {
            let placeholder = format!("${}", i + 1);
            out = out.replace(&placeholder, &value.to_sql_literal());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::tests::FakeEngine;
    use crate::pool::ConnectionPool;

    #[test]
    fn skip_pattern_statements_finish_immediately_without_a_result_set() {
        let registry = ConflictRegistry::with_defaults();
        let mut stmt = Statement::prepare("PRAGMA journal_mode = WAL;", &registry).unwrap();
        let pool = ConnectionPool::new(1);
        let native = FakeEngine::new();
        let lease = pool.acquire(&native).unwrap();
        assert_eq!(stmt.step(&lease).unwrap(), StepResult::Done);
        assert_eq!(stmt.column_count(&lease).unwrap(), 0);
    }

    #[test]
    fn bind_grows_parameter_vector_past_the_translator_estimate() {
        let registry = ConflictRegistry::with_defaults();
        let mut stmt = Statement::prepare("SELECT 1", &registry).unwrap();
        stmt.bind(3, Value::Integer(7)).unwrap();
        assert_eq!(stmt.param_count, 0);
        assert_eq!(stmt.params.len(), 3);
    }

    #[test]
    fn reset_clears_the_result_but_keeps_bindings() {
        let registry = ConflictRegistry::with_defaults();
        let mut stmt = Statement::prepare("SELECT 1", &registry).unwrap();
        stmt.bind(1, Value::Integer(5)).unwrap();
        let pool = ConnectionPool::new(1);
        let native = FakeEngine::new();
        let lease = pool.acquire(&native).unwrap();
        let _ = stmt.step(&lease).unwrap();
        stmt.reset();
        assert_eq!(stmt.current_row_index(), -1);
        assert_eq!(stmt.params[0], Value::Integer(5));
    }

    #[test]
    fn expanded_sql_substitutes_bound_parameters() {
        let registry = ConflictRegistry::with_defaults();
        let mut stmt = Statement::prepare("SELECT * FROM t WHERE id = ?", &registry).unwrap();
        stmt.bind(1, Value::Integer(42)).unwrap();
        assert_eq!(stmt.expanded_sql(), "SELECT * FROM t WHERE id = 42");
    }

    #[test]
    fn exec_prepared_insert_picks_up_the_appended_returning_id() {
        let registry = ConflictRegistry::with_defaults();
        let mut stmt = Statement::prepare_for_exec("INSERT INTO t(a) VALUES(1)", &registry).unwrap();
        let pool = ConnectionPool::new(1);
        let native = FakeEngine::new();
        let lease = pool.acquire(&native).unwrap();
        assert_eq!(stmt.step(&lease).unwrap(), StepResult::Done);
        assert_eq!(stmt.last_inserted_id(), Some(42));
    }

    #[test]
    fn last_inserted_id_is_none_without_an_id_column() {
        let registry = ConflictRegistry::with_defaults();
        let mut stmt = Statement::prepare("SELECT 1", &registry).unwrap();
        let pool = ConnectionPool::new(1);
        let native = FakeEngine::new();
        let lease = pool.acquire(&native).unwrap();
        let _ = stmt.step(&lease).unwrap();
        assert_eq!(stmt.last_inserted_id(), None);
    }

    #[test]
    fn metadata_access_before_first_step_does_not_force_a_second_execution() {
        let registry = ConflictRegistry::with_defaults();
        let mut stmt = Statement::prepare("SELECT 1", &registry).unwrap();
        let pool = ConnectionPool::new(1);
        let native = FakeEngine::new();
        let lease = pool.acquire(&native).unwrap();
        assert_eq!(stmt.column_count(&lease).unwrap(), 1);
        assert_eq!(stmt.step(&lease).unwrap(), StepResult::Row);
        assert_eq!(stmt.current_value(0), Value::Integer(1));
    }

    #[test]
    fn param_index_resolves_named_placeholders() {
        let registry = ConflictRegistry::with_defaults();
        let stmt = Statement::prepare("SELECT * FROM t WHERE a = :x OR b = :y", &registry).unwrap();
        assert_eq!(stmt.param_index("x"), 1);
        assert_eq!(stmt.param_index("y"), 2);
        assert_eq!(stmt.param_index("nope"), 0);
    }

    #[test]
    fn readonly_distinguishes_select_from_write_statements() {
        let registry = ConflictRegistry::with_defaults();
        assert!(Statement::prepare("SELECT 1", &registry).unwrap().is_readonly());
        assert!(!Statement::prepare("INSERT INTO t(a) VALUES(1)", &registry)
            .unwrap()
            .is_readonly());
        assert!(Statement::prepare("PRAGMA journal_mode = WAL;", &registry)
            .unwrap()
            .is_readonly());
    }

    #[test]
    fn data_count_is_zero_outside_the_row_window() {
        let registry = ConflictRegistry::with_defaults();
        let mut stmt = Statement::prepare("SELECT 1", &registry).unwrap();
        let pool = ConnectionPool::new(1);
        let native = FakeEngine::new();
        let lease = pool.acquire(&native).unwrap();
        assert_eq!(stmt.data_count(), 0);
        assert_eq!(stmt.step(&lease).unwrap(), StepResult::Row);
        assert_eq!(stmt.data_count(), 1);
        assert_eq!(stmt.step(&lease).unwrap(), StepResult::Done);
        assert_eq!(stmt.data_count(), 0);
    }
}
