// native.rs

//! Raw function-pointer shapes for the entry points a production adapter
//! resolves against the host's own copy of the embedded engine.
//!
//! These are declarations only: no symbol here is defined by this crate.
//! A platform adapter (out of scope for this repository) is expected to
//! resolve each one — by whatever interposition mechanism the host
//! platform supports — and hand the resulting function pointers to a
//! `slbridge::native::NativeEngine` implementation.

use std::os::raw::{c_char, c_double, c_int, c_void};

/// Opaque handle to a host-owned database connection.
pub type db_handle_t = *mut c_void;

/// Opaque handle to a host-owned prepared statement.
pub type stmt_handle_t = *mut c_void;

/// Opaque handle returned from `column_value`; may be either a genuine
/// engine-native value or a synthetic handle tagged with
/// [`crate::VALUE_HANDLE_MAGIC`].
pub type value_handle_t = *mut c_void;

pub type OpenFn =
    unsafe extern "C" fn(path: *const c_char, out_db: *mut db_handle_t) -> c_int;
pub type CloseFn = unsafe extern "C" fn(db: db_handle_t) -> c_int;
pub type PrepareFn = unsafe extern "C" fn(
    db: db_handle_t,
    sql: *const c_char,
    sql_len: c_int,
    out_stmt: *mut stmt_handle_t,
    out_tail: *mut *const c_char,
) -> c_int;
pub type StepFn = unsafe extern "C" fn(stmt: stmt_handle_t) -> c_int;
pub type ResetFn = unsafe extern "C" fn(stmt: stmt_handle_t) -> c_int;
pub type FinalizeFn = unsafe extern "C" fn(stmt: stmt_handle_t) -> c_int;
pub type ClearBindingsFn = unsafe extern "C" fn(stmt: stmt_handle_t) -> c_int;

pub type BindIntFn = unsafe extern "C" fn(stmt: stmt_handle_t, idx: c_int, val: c_int) -> c_int;
pub type BindInt64Fn = unsafe extern "C" fn(stmt: stmt_handle_t, idx: c_int, val: i64) -> c_int;
pub type BindDoubleFn =
    unsafe extern "C" fn(stmt: stmt_handle_t, idx: c_int, val: c_double) -> c_int;
pub type BindTextFn = unsafe extern "C" fn(
    stmt: stmt_handle_t,
    idx: c_int,
    val: *const c_char,
    len: c_int,
) -> c_int;
pub type BindBlobFn = unsafe extern "C" fn(
    stmt: stmt_handle_t,
    idx: c_int,
    val: *const c_void,
    len: c_int,
) -> c_int;
pub type BindNullFn = unsafe extern "C" fn(stmt: stmt_handle_t, idx: c_int) -> c_int;

pub type ColumnCountFn = unsafe extern "C" fn(stmt: stmt_handle_t) -> c_int;
pub type ColumnTypeFn = unsafe extern "C" fn(stmt: stmt_handle_t, col: c_int) -> c_int;
pub type ColumnIntFn = unsafe extern "C" fn(stmt: stmt_handle_t, col: c_int) -> c_int;
pub type ColumnInt64Fn = unsafe extern "C" fn(stmt: stmt_handle_t, col: c_int) -> i64;
pub type ColumnDoubleFn = unsafe extern "C" fn(stmt: stmt_handle_t, col: c_int) -> c_double;
pub type ColumnTextFn = unsafe extern "C" fn(stmt: stmt_handle_t, col: c_int) -> *const c_char;
pub type ColumnBlobFn = unsafe extern "C" fn(stmt: stmt_handle_t, col: c_int) -> *const c_void;
pub type ColumnBytesFn = unsafe extern "C" fn(stmt: stmt_handle_t, col: c_int) -> c_int;
pub type ColumnNameFn = unsafe extern "C" fn(stmt: stmt_handle_t, col: c_int) -> *const c_char;
pub type ColumnValueFn = unsafe extern "C" fn(stmt: stmt_handle_t, col: c_int) -> value_handle_t;

pub type ErrmsgFn = unsafe extern "C" fn(db: db_handle_t) -> *const c_char;
pub type ErrcodeFn = unsafe extern "C" fn(db: db_handle_t) -> c_int;

pub type ChangesFn = unsafe extern "C" fn(db: db_handle_t) -> c_int;
pub type LastInsertRowidFn = unsafe extern "C" fn(db: db_handle_t) -> i64;
