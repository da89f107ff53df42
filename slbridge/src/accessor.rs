// accessor.rs

//! The column/value accessor layer.
//!
//! Two concerns live here, both about giving the host something it can
//! hold onto across a call boundary without this crate owning unbounded
//! memory: a ring of synthetic [`ValueHandle`]s standing in for
//! `column_value`'s protean return type, and a ring of scratch buffers
//! backing the text/blob getters so a pointer the host reads stays valid
//! longer than the backend client's own guarantee.
//!
//! Both rings are thread-local: accessor calls always happen on the thread
//! that owns the statement, and keeping the rings per-thread means no
//! locking is needed to hand out a handle or a buffer.

use std::cell::RefCell;

use slbridge_abi::{VALUE_HANDLE_MAGIC, VALUE_HANDLE_RING_SIZE, TEXT_BUFFER_MAX_LEN, TEXT_BUFFER_RING_SIZE};

use crate::ring::Ring;
use crate::value::{Type, Value};

thread_local! {
    static VALUE_RING: RefCell<Ring<(Value, Type)>> =
        RefCell::new(Ring::new(VALUE_HANDLE_RING_SIZE, (Value::Null, Type::Null)));
    static TEXT_RING: RefCell<Ring<Vec<u8>>> =
        RefCell::new(Ring::new(TEXT_BUFFER_RING_SIZE, Vec::new()));
}

fn handle_mask() -> u64 {
    (VALUE_HANDLE_RING_SIZE as u64) - 1
}

/// Publishes `value` (paired with its declared column type, since the two
/// can differ — a hex-bytea column decodes to `Value::Text` but still
/// reports `Type::Blob`) into this thread's value-handle ring and returns
/// an opaque handle encoding a magic tag plus the ring index. The handle
/// is only ever compared against the tag on [`resolve_value_handle`]; it
/// is never dereferenced as a pointer by this crate.
pub fn make_value_handle(value: Value, decl_type: Type) -> u64 {
    let idx = VALUE_RING.with(|r| r.borrow_mut().push((value, decl_type)));
    (VALUE_HANDLE_MAGIC & !handle_mask()) | (idx as u64 & handle_mask())
}

/// Recovers the value and declared type behind a handle returned by
/// [`make_value_handle`]. Returns `None` if the tag bits don't match —
/// either a handle from a stale generation (vanishingly unlikely, see
/// module docs on the false positive bound) or a value the caller never
/// obtained from this ring.
pub fn resolve_value_handle(handle: u64) -> Option<(Value, Type)> {
    let tag_bits = VALUE_HANDLE_MAGIC & !handle_mask();
    if handle & !handle_mask() != tag_bits {
        return None;
    }
    let idx = (handle & handle_mask()) as usize;
    VALUE_RING.with(|r| Some(r.borrow().get(idx).clone()))
}

/// Copies `bytes` (truncated to [`TEXT_BUFFER_MAX_LEN`]) into this thread's
/// scratch ring and returns the slot's contents. The returned `Vec` is a
/// clone of what now lives in the ring slot; callers that need the pointer
/// behind it (the FFI-facing layer) take the address of that clone's
/// buffer and keep the `Vec` alive for as long as the ring slot is
/// expected to stay valid.
pub fn scratch_copy(bytes: &[u8]) -> Vec<u8> {
    let truncated = if bytes.len() > TEXT_BUFFER_MAX_LEN {
        &bytes[..TEXT_BUFFER_MAX_LEN]
    } else {
        bytes
    };
    TEXT_RING.with(|r| {
        r.borrow_mut().push(truncated.to_vec());
    });
    truncated.to_vec()
}

/// A typed view over one statement's current row, built fresh per access
/// from [`crate::statement::Statement::current_value`]. Getters never
/// panic on an out-of-range index or a type mismatch; they fall back to
/// the same zero/empty/NULL values the embedded engine's own loosely
/// typed column getters return.
pub struct ColumnAccessor;

impl ColumnAccessor {
    pub fn int(value: &Value) -> i64 {
        value.to_i64()
    }

    pub fn int64(value: &Value) -> i64 {
        value.to_i64()
    }

    pub fn double(value: &Value) -> f64 {
        value.to_f64()
    }

    pub fn text(value: &Value) -> Vec<u8> {
        scratch_copy(value.to_text().as_bytes())
    }

    pub fn blob(value: &Value) -> Vec<u8> {
        scratch_copy(&value.to_blob())
    }

    /// `sqlite3_column_bytes`'s analogue: for a blob (or a hex-bytea `Text`
    /// decoded the way a `bytea` column arrives over text protocol), this
    /// is the *decoded* length, not the length of the hex text itself.
    pub fn bytes(value: &Value) -> usize {
        match value {
            Value::Blob(b) => b.len(),
            Value::Text(s) if s.starts_with("\\x") => value.to_blob().len(),
            other => other.to_text().len(),
        }
    }

    /// Boxes `value` as a synthetic handle for `column_value`/`value_dup`.
    pub fn value_handle(value: &Value, decl_type: Type) -> u64 {
        make_value_handle(value.clone(), decl_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_handles_round_trip_through_the_ring() {
        let handle = make_value_handle(Value::Integer(99), Type::Integer);
        assert_eq!(
            resolve_value_handle(handle),
            Some((Value::Integer(99), Type::Integer))
        );
    }

    #[test]
    fn garbage_handle_does_not_resolve() {
        assert_eq!(resolve_value_handle(0xDEAD_BEEF), None);
    }

    #[test]
    fn handles_wrap_around_the_ring_without_growing() {
        for i in 0..(VALUE_HANDLE_RING_SIZE as i64 * 2) {
            make_value_handle(Value::Integer(i), Type::Integer);
        }
        // The ring never grows past its configured capacity; this would
        // hang or OOM if it did.
    }

    #[test]
    fn text_scratch_truncates_oversized_payloads() {
        let big = vec![b'x'; TEXT_BUFFER_MAX_LEN + 10];
        let copy = scratch_copy(&big);
        assert_eq!(copy.len(), TEXT_BUFFER_MAX_LEN);
    }

    #[test]
    fn bytes_reports_blob_length_not_text_length() {
        let v = Value::Blob(vec![1, 2, 3]);
        assert_eq!(ColumnAccessor::bytes(&v), 3);
    }

    #[test]
    fn int_accessor_coerces_postgres_boolean_text() {
        assert_eq!(ColumnAccessor::int(&Value::Text("t".into())), 1);
    }

    #[test]
    fn bytes_reports_decoded_length_for_hex_bytea_text() {
        let v = Value::bytea_text(&[1, 2, 3]);
        assert_eq!(ColumnAccessor::bytes(&v), 3);
        assert_eq!(ColumnAccessor::blob(&v), vec![1, 2, 3]);
    }
}
