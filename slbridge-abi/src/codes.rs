// codes.rs

//! Status and type codes mirrored from the embedded engine's C ABI.

pub mod status_code {
    pub type Type = i32;
    pub const OK: Type = 0;
    pub const ROW: Type = 100;
    pub const DONE: Type = 101;
    pub const ERROR: Type = 1;
    pub const MISUSE: Type = 21;
    pub const NOMEM: Type = 7;
    pub const CONSTRAINT: Type = 19;
}

pub use self::status_code::Type as status_t;

/// Column/value type codes, in the embedded engine's numbering.
pub mod column_type {
    pub type Type = i32;
    pub const NULL: Type = 5;
    pub const INTEGER: Type = 1;
    pub const FLOAT: Type = 2;
    pub const TEXT: Type = 3;
    pub const BLOB: Type = 4;
}

pub use self::column_type::Type as column_type_t;

/// Bit pattern tagging a synthetic value handle returned from `column_value`.
///
/// A real engine-native handle is a heap pointer and, on every platform this
/// shim targets, is at minimum 8-byte aligned; the sentinel's low bit is set,
/// so it can never collide with a native pointer while still surviving a
/// round trip through an untyped `*mut c_void`.
pub const VALUE_HANDLE_MAGIC: u64 = 0x5342_4452_4447_4501;

/// Number of slots in the per-process synthetic value-handle ring.
///
/// Must be a power of two; see the ring's wraparound arithmetic in
/// `slbridge::accessor`.
pub const VALUE_HANDLE_RING_SIZE: usize = 256;

/// Number of per-thread text/blob scratch buffers kept alive for accessor
/// pointer stability, and the maximum size of each.
pub const TEXT_BUFFER_RING_SIZE: usize = 256;
pub const TEXT_BUFFER_MAX_LEN: usize = 16 * 1024;
