// native.rs

//! The seam between the core and the actual backend engine.
//!
//! Symbol interposition — making the host's calls into the embedded engine
//! land here in the first place — is out of scope for this crate; by the
//! time control reaches [`crate::pool`] and [`crate::pg`], that question is
//! already answered. What those modules still need is something to connect
//! *to*, and that is what [`NativeEngine`] and [`NativeConnection`]
//! abstract: a production adapter backed by the real client library, and a
//! test fake that never opens a socket.

use crate::config::Config;
use crate::pg::QueryOutcome;
use crate::value::Value;
use crate::Error;

/// Produces connections to the backend engine. One instance is shared by
/// every slot in a [`crate::pool::ConnectionPool`].
pub trait NativeEngine: Send + Sync {
    fn connect(&self) -> Result<Box<dyn NativeConnection>, Error>;
}

/// One live connection to the backend engine.
pub trait NativeConnection: Send {
    /// Executes one statement with the given already-positional-bound
    /// parameters and returns its result set (empty for DDL/DML with no
    /// `RETURNING`).
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<QueryOutcome, Error>;

    /// Best-effort liveness probe; consulted when deciding whether a pool
    /// slot should be recycled rather than reused.
    fn is_healthy(&mut self) -> bool;
}

/// The production adapter, backed by a real `postgres::Client`.
pub struct PgNativeEngine {
    config: Config,
}

impl PgNativeEngine {
    pub fn new(config: Config) -> Self {
        PgNativeEngine { config }
    }

    fn connection_string(&self) -> String {
        let mut s = format!(
            "host={} port={} dbname={} user={}",
            self.config.get_host(),
            self.config.get_port(),
            self.config.get_database(),
            self.config.get_user()
        );
        if let Some(password) = self.config.get_password() {
            s.push_str(&format!(" password={}", password));
        }
        s
    }
}

impl NativeEngine for PgNativeEngine {
    fn connect(&self) -> Result<Box<dyn NativeConnection>, Error> {
        let mut client = postgres::Client::connect(&self.connection_string(), postgres::NoTls)?;
        client.simple_query(&format!(
            "SET search_path TO {}",
            quote_ident(self.config.get_schema())
        ))?;
        Ok(Box::new(PgConnection { client }))
    }
}

/// Double-quotes an identifier for use in a `SET search_path` statement,
/// doubling any embedded quote the way the translator's own identifier
/// requoting does.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

struct PgConnection {
    client: postgres::Client,
}

impl NativeConnection for PgConnection {
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<QueryOutcome, Error> {
        crate::pg::run_query(&mut self.client, sql, params)
    }

    fn is_healthy(&mut self) -> bool {
        self.client.simple_query("SELECT 1").is_ok()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::pg::ColumnMeta;
    use crate::value::Type;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// An in-memory stand-in for the backend, used by every test in this
    /// crate that needs a connection but not a database.
    pub struct FakeEngine {
        healthy: AtomicBool,
    }

    impl FakeEngine {
        pub fn new() -> Self {
            FakeEngine {
                healthy: AtomicBool::new(true),
            }
        }

        pub fn mark_unhealthy(&self) {
            self.healthy.store(false, Ordering::SeqCst);
        }
    }

    impl NativeEngine for FakeEngine {
        fn connect(&self) -> Result<Box<dyn NativeConnection>, Error> {
            if !self.healthy.load(Ordering::SeqCst) {
                return Err(Error::Session("fake backend is down".to_string()));
            }
            Ok(Box::new(FakeConnection { poisoned: false }))
        }
    }

    /// Bumped every time a [`FakeConnection`] executes a `ROLLBACK`, so
    /// tests can assert the best-effort rollback-on-failure behavior
    /// without a real backend to observe transaction state on.
    pub static ROLLBACK_CALLS: AtomicBool = AtomicBool::new(false);

    pub struct FakeConnection {
        poisoned: bool,
    }

    impl NativeConnection for FakeConnection {
        fn execute(&mut self, sql: &str, _params: &[Value]) -> Result<QueryOutcome, Error> {
            if sql.trim() == "ROLLBACK" {
                ROLLBACK_CALLS.store(true, Ordering::SeqCst);
                return Ok(QueryOutcome {
                    columns: Vec::new(),
                    rows: Vec::new(),
                    rows_affected: 0,
                });
            }
            if sql.trim() == "FAIL_NOT_FATAL" {
                return Err(Error::Misuse("simulated statement failure".to_string()));
            }
            if sql.trim_start().to_ascii_uppercase().starts_with("SELECT 1") {
                return Ok(QueryOutcome {
                    columns: vec![ColumnMeta {
                        name: "?column?".to_string(),
                        decl_type: Type::Integer,
                    }],
                    rows: vec![vec![Value::Integer(1)]],
                    rows_affected: 0,
                });
            }
            if sql.to_ascii_uppercase().contains("RETURNING ID") {
                return Ok(QueryOutcome {
                    columns: vec![ColumnMeta {
                        name: "id".to_string(),
                        decl_type: Type::Integer,
                    }],
                    rows: vec![vec![Value::Integer(42)]],
                    rows_affected: 1,
                });
            }
            Ok(QueryOutcome {
                columns: Vec::new(),
                rows: Vec::new(),
                rows_affected: 0,
            })
        }

        fn is_healthy(&mut self) -> bool {
            !self.poisoned
        }
    }
}
