// lib.rs

//! `slbridge` makes a process written against an embedded, single-file SQL
//! engine run instead against a client/server SQL backend, without
//! recompiling the process.
//!
//! This crate is the *core*: the per-statement translation and execution
//! pipeline that runs once the host's calls into the embedded engine have
//! already been redirected here. It does not itself perform that
//! redirection — see [`native::NativeEngine`] for the seam a host adapter
//! plugs into — and it does not load configuration from disk or environment;
//! it only consumes the already-parsed [`config::Config`] record.
//!
//! Four subsystems cooperate:
//!
//! - [`translator`] rewrites the host's SQL dialect into the backend's.
//! - [`statement`] emulates prepare/bind/step/reset/finalize on top of the
//!   backend's prepared-statement protocol.
//! - [`accessor`] serves the typed column and value getters, including the
//!   synthetic value-handle ring `column_value` relies on.
//! - [`pool`] leases pooled backend sessions to logical database handles,
//!   with thread affinity and health-driven reconnection.
//!
//! # Example
//!
//! ```no_run
//! use slbridge::config::Config;
//! use slbridge::registry::Runtime;
//!
//! fn main() -> slbridge::Result<()> {
//!     let config = Config::new("localhost", 5432, "app", "app");
//!     let runtime = Runtime::start(config);
//!
//!     let handle = runtime.open("/var/data/app.db")?;
//!     let stmt = runtime.prepare(handle, "SELECT 1;")?;
//!
//!     runtime.finalize(stmt)?;
//!     runtime.close(handle)?;
//!
//!     Ok(())
//! }
//! ```

use std::fmt;

pub use slbridge_abi as abi;

pub mod accessor;
pub mod config;
pub mod native;
pub mod pg;
pub mod pool;
pub mod registry;
pub mod statement;
pub mod translator;
pub mod upsert;
pub mod value;

mod guard;
mod ring;

/// Everything that can go wrong inside the core, grouped the way the host's
/// error surface distinguishes them (see `errmsg`/`errcode` in
/// [`registry::Runtime`]).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The translator could not rewrite a construct it does not recognize.
    #[error("translation failed: {0}")]
    Translation(String),

    /// The backend rejected a command that was sent to it.
    #[error("remote command failed: {0}")]
    Remote(#[from] postgres::Error),

    /// The pooled session backing a logical handle is unusable.
    #[error("session unavailable: {0}")]
    Session(String),

    /// Stack, ring, or pool capacity was exhausted; always recoverable.
    #[error("resource exhausted: {0}")]
    ResourcePressure(String),

    /// The host called the core in a way its own contract forbids
    /// (out-of-range column, use-after-finalize, and the like).
    #[error("misuse: {0}")]
    Misuse(String),
}

impl Error {
    /// Maps this error onto the embedded engine's status-code space, for
    /// `errcode`/`extended_errcode`.
    pub fn status_code(&self) -> abi::status_t {
        use abi::status_code::*;
        match self {
            Error::Translation(_) => ERROR,
            Error::Remote(_) => ERROR,
            Error::Session(_) => ERROR,
            Error::ResourcePressure(_) => NOMEM,
            Error::Misuse(_) => MISUSE,
        }
    }
}

/// Result type used throughout the core.
pub type Result<T> = std::result::Result<T, Error>;

/// Outcome of executing a statement that the translator recognized as a
/// *skip pattern* (a construct with no remote equivalent, e.g. a local
/// `PRAGMA`): it always succeeds without reaching the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    /// The statement was sent to, and executed by, the backend.
    Executed,
    /// The statement was recognized as locally meaningless and skipped.
    Skipped,
}

impl fmt::Display for ExecOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecOutcome::Executed => write!(f, "executed"),
            ExecOutcome::Skipped => write!(f, "skipped"),
        }
    }
}
