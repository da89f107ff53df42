// value.rs

//! Typed SQL values.
//!
//! [`Value`] is what a bound parameter or a decoded column becomes on its
//! way between the host's typed getters/setters and the backend's
//! text-protocol wire format. [`Type`] is the embedded engine's own type
//! tag, which the accessor layer reports through `column_type`.
//!
//! Any Rust type that can be bound as a parameter implements [`ToValue`];
//! this mirrors the teacher library's `ToValue` trait, which is implemented
//! for the common scalar types so callers can pass `&1i64` or `&"hello"`
//! directly to an execute call instead of constructing a `Value` by hand.

use slbridge_abi::column_type;

/// The embedded engine's column/value type tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Type {
    Null,
    Integer,
    Float,
    Text,
    Blob,
}

impl Type {
    pub fn to_code(self) -> slbridge_abi::column_type_t {
        match self {
            Type::Null => column_type::NULL,
            Type::Integer => column_type::INTEGER,
            Type::Float => column_type::FLOAT,
            Type::Text => column_type::TEXT,
            Type::Blob => column_type::BLOB,
        }
    }

    /// Maps a backend column OID onto the embedded engine's type space.
    ///
    /// int2/int4/int8/bool/oid map to `Integer`; float4/float8/numeric map
    /// to `Float`; bytea maps to `Blob`; everything else is `Text`. A NULL
    /// value in any column reports `Null` regardless of its declared type,
    /// which callers apply themselves before falling back to this mapping.
    pub fn from_pg_oid(oid: u32) -> Type {
        match oid {
            // bool, int2, int4, oid, int8
            16 | 21 | 23 | 26 | 20 => Type::Integer,
            // float4, float8, numeric
            700 | 701 | 1700 => Type::Float,
            // bytea
            17 => Type::Blob,
            _ => Type::Text,
        }
    }
}

/// A decoded SQL value, scalar and self-contained (never borrows from a
/// result set). Row-scoped values held by [`crate::accessor`] are decoded
/// into this shape once per row and cached there.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    /// Builds the `Value` a `bytea` column decodes to: text in the same
    /// `\x4142...` shape Postgres's own text-protocol wire format uses, so
    /// the blob getter's hex decode ([`Value::to_blob`]) and the rest of
    /// the text-coercion machinery see exactly what they'd see over text
    /// protocol, regardless of which wire format actually produced the
    /// bytes.
    pub fn bytea_text(bytes: &[u8]) -> Value {
        Value::Text(format!("\\x{}", hex_encode(bytes)))
    }

    /// Builds the `Value` a boolean column decodes to: Postgres's own
    /// text-protocol boolean literal (`'t'`/`'f'`), so `column_text` and
    /// the boolean-text coercion in [`Value::to_i64`]/[`Value::to_f64`]
    /// both see the same representation they would over text protocol.
    pub fn bool_text(value: bool) -> Value {
        Value::Text(if value { "t" } else { "f" }.to_string())
    }

    pub fn value_type(&self) -> Type {
        match self {
            Value::Null => Type::Null,
            Value::Integer(_) => Type::Integer,
            Value::Float(_) => Type::Float,
            Value::Text(_) => Type::Text,
            Value::Blob(_) => Type::Blob,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Converts to a 64-bit integer, the way the embedded engine's loosely
    /// typed getters do: numeric parse, with Postgres's text-mode boolean
    /// literals (`'t'`/`'f'`) special-cased before the generic parse.
    pub fn to_i64(&self) -> i64 {
        match self {
            Value::Null => 0,
            Value::Integer(i) => *i,
            Value::Float(f) => *f as i64,
            Value::Text(s) => match s.as_str() {
                "t" => 1,
                "f" => 0,
                _ => s.trim().parse().unwrap_or(0),
            },
            Value::Blob(_) => 0,
        }
    }

    pub fn to_f64(&self) -> f64 {
        match self {
            Value::Null => 0.0,
            Value::Integer(i) => *i as f64,
            Value::Float(f) => *f,
            Value::Text(s) => match s.as_str() {
                "t" => 1.0,
                "f" => 0.0,
                _ => s.trim().parse().unwrap_or(0.0),
            },
            Value::Blob(_) => 0.0,
        }
    }

    pub fn to_text(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Integer(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Text(s) => s.clone(),
            Value::Blob(b) => String::from_utf8_lossy(b).into_owned(),
        }
    }

    /// Decodes the value as a blob. A `Text` value in Postgres's hex-bytea
    /// shape (`\x4142...`) is decoded as hex, matching what the blob getter
    /// sees when a `bytea` column arrives in text form; any other text is
    /// its raw UTF-8 bytes.
    pub fn to_blob(&self) -> Vec<u8> {
        match self {
            Value::Blob(b) => b.clone(),
            Value::Text(s) if s.starts_with("\\x") => decode_hex_bytea(s),
            Value::Text(s) => s.as_bytes().to_vec(),
            Value::Null => Vec::new(),
            Value::Integer(i) => i.to_string().into_bytes(),
            Value::Float(f) => f.to_string().into_bytes(),
        }
    }

    /// Renders the value the way `expanded_sql` substitutes it into a `$N`
    /// placeholder: quoted text/blob, bare numeric, bare `NULL`.
    pub fn to_sql_literal(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Integer(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
            Value::Blob(b) => format!("'\\x{}'", hex_encode(b)),
        }
    }
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// Decodes a Postgres hex-text `bytea` payload (`\x4142...`) into raw bytes.
///
/// Invalid hex is not an error to the caller: it returns an empty buffer
/// and lets the accessor layer report it as NULL, matching the embedded
/// engine's blob-getter's NULL-on-failure contract.
pub fn decode_hex_bytea(text: &str) -> Vec<u8> {
    let digits = text.strip_prefix("\\x").unwrap_or(text);
    if digits.len() % 2 != 0 {
        return Vec::new();
    }

    let mut out = Vec::with_capacity(digits.len() / 2);
    let bytes = digits.as_bytes();
    for pair in bytes.chunks(2) {
        match (hex_nibble(pair[0]), hex_nibble(pair[1])) {
            (Some(hi), Some(lo)) => out.push((hi << 4) | lo),
            _ => return Vec::new(),
        }
    }
    out
}

fn hex_nibble(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Implemented by any Rust type that can be bound as a statement parameter.
///
/// This mirrors the teacher library's sealed-in-practice `ToValue` trait:
/// callers pass `&1i64`, `&"hello"`, or `&Some(3.5)` directly to
/// [`crate::statement::Statement::bind`] instead of constructing a [`Value`]
/// by hand.
pub trait ToValue {
    fn to_value(&self) -> Value;
}

impl ToValue for Value {
    fn to_value(&self) -> Value {
        self.clone()
    }
}

impl ToValue for bool {
    fn to_value(&self) -> Value {
        Value::Integer(if *self { 1 } else { 0 })
    }
}

macro_rules! impl_to_value_int {
    ($($t:ty),*) => {
        $(impl ToValue for $t {
            fn to_value(&self) -> Value {
                Value::Integer(*self as i64)
            }
        })*
    };
}

impl_to_value_int!(i8, i16, i32, i64, u8, u16, u32);

macro_rules! impl_to_value_float {
    ($($t:ty),*) => {
        $(impl ToValue for $t {
            fn to_value(&self) -> Value {
                Value::Float(*self as f64)
            }
        })*
    };
}

impl_to_value_float!(f32, f64);

impl ToValue for str {
    fn to_value(&self) -> Value {
        Value::Text(self.to_string())
    }
}

impl ToValue for String {
    fn to_value(&self) -> Value {
        Value::Text(self.clone())
    }
}

impl ToValue for [u8] {
    fn to_value(&self) -> Value {
        Value::Blob(self.to_vec())
    }
}

impl<T: ToValue> ToValue for Option<T> {
    fn to_value(&self) -> Value {
        match self {
            Some(v) => v.to_value(),
            None => Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boolean_text_coerces_before_numeric_parse() {
        assert_eq!(Value::Text("t".into()).to_i64(), 1);
        assert_eq!(Value::Text("f".into()).to_i64(), 0);
        assert_eq!(Value::Text("t".into()).to_f64(), 1.0);
    }

    #[test]
    fn hex_bytea_round_trips() {
        let bytes = vec![0xDE, 0xAD, 0xBE, 0xEF];
        let literal = Value::Blob(bytes.clone()).to_sql_literal();
        let encoded = literal.trim_matches('\'');
        assert_eq!(decode_hex_bytea(encoded), bytes);
    }

    #[test]
    fn invalid_hex_decodes_empty() {
        assert_eq!(decode_hex_bytea("\\xzz"), Vec::<u8>::new());
    }

    #[test]
    fn bytea_text_round_trips_through_to_blob() {
        let bytes = vec![0xDE, 0xAD, 0xBE, 0xEF];
        let value = Value::bytea_text(&bytes);
        assert_eq!(value.to_blob(), bytes);
    }

    #[test]
    fn bool_text_satisfies_every_getter_coercion() {
        let value = Value::bool_text(true);
        assert_eq!(value.to_text(), "t");
        assert_eq!(value.to_i64(), 1);
        assert_eq!(value.to_f64(), 1.0);
    }

    #[test]
    fn type_from_oid_maps_known_families() {
        assert_eq!(Type::from_pg_oid(23), Type::Integer); // int4
        assert_eq!(Type::from_pg_oid(701), Type::Float); // float8
        assert_eq!(Type::from_pg_oid(17), Type::Blob); // bytea
        assert_eq!(Type::from_pg_oid(25), Type::Text); // text
    }
}
