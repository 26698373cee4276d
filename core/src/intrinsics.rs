/*
 * Copyright (c) 2026 Mohamad Al-Zawahreh (dba Sovereign Systems).
 *
 * Intrinsic Library: string, array and object primitives.
 *
 * Everything here works on whole host values and never touches transport
 * or storage state. Container mutation goes through the bridge so that
 * guest-visible identity is kept; the index policy it applies lives here.
 *
 * LICENSE: DUAL-LICENSED (AGPLv3 or COMMERCIAL).
 */

use crate::json::{self, JsonError};
use crate::schema::{self, Schema, SchemaError};
use crate::value::{equal, Kind, Value};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IntrinsicError {
    #[error("{op}: expected {expected}, got {found}")]
    TypeMismatch {
        op: &'static str,
        expected: &'static str,
        found: Kind,
    },
    #[error("{op}: index {index} out of range for length {len}")]
    IndexOutOfRange {
        op: &'static str,
        index: i64,
        len: usize,
    },
    #[error("{op}: negative length {len}")]
    NegativeLength { op: &'static str, len: i64 },
    #[error("{op}: length {len} exceeds the {MAX_ARRAY_LEN} element limit")]
    TooLarge { op: &'static str, len: u64 },
    #[error("{op}: {source}")]
    Json {
        op: &'static str,
        #[source]
        source: JsonError,
    },
    #[error("{op}: {source}")]
    Schema {
        op: &'static str,
        #[source]
        source: SchemaError,
    },
}

/// Largest array a guest may allocate in one call.
pub const MAX_ARRAY_LEN: u64 = 1 << 24;

fn mismatch(op: &'static str, expected: &'static str, v: &Value) -> IntrinsicError {
    IntrinsicError::TypeMismatch {
        op,
        expected,
        found: v.kind(),
    }
}

// =============================================================================
// Scalars
// =============================================================================

/// Integer, or a Float truncated toward zero.
pub fn to_i64(op: &'static str, v: &Value) -> Result<i64, IntrinsicError> {
    match v {
        Value::Integer(n) => Ok(*n),
        Value::Float(x) => Ok(*x as i64),
        _ => Err(mismatch(op, "number", v)),
    }
}

pub fn to_f64(op: &'static str, v: &Value) -> Result<f64, IntrinsicError> {
    v.as_f64().ok_or_else(|| mismatch(op, "number", v))
}

pub fn to_bool(op: &'static str, v: &Value) -> Result<bool, IntrinsicError> {
    match v {
        Value::Boolean(b) => Ok(*b),
        _ => Err(mismatch(op, "boolean", v)),
    }
}

pub fn expect_str<'a>(op: &'static str, v: &'a Value) -> Result<&'a str, IntrinsicError> {
    v.as_str().ok_or_else(|| mismatch(op, "string", v))
}

// =============================================================================
// Strings
// =============================================================================

/// Concatenates the display text of both operands.
pub fn str_concat(a: &Value, b: &Value) -> Value {
    let mut out = a.to_display_string();
    out.push_str(&b.to_display_string());
    Value::String(out)
}

pub fn str_eq(a: &Value, b: &Value) -> Result<bool, IntrinsicError> {
    Ok(expect_str("str_eq", a)? == expect_str("str_eq", b)?)
}

/// Length in Unicode scalar values.
pub fn str_len(v: &Value) -> Result<i64, IntrinsicError> {
    Ok(expect_str("str_len", v)?.chars().count() as i64)
}

/// Longest prefix of `text` that fits in `cap` bytes without splitting a
/// UTF-8 sequence.
pub fn utf8_prefix(text: &str, cap: usize) -> &[u8] {
    if text.len() <= cap {
        return text.as_bytes();
    }
    let mut end = cap;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text.as_bytes()[..end]
}

// =============================================================================
// Arrays
// =============================================================================

/// Resolves a guest index against a length. `None` when out of range.
pub fn array_slot(len: usize, index: i64) -> Option<usize> {
    usize::try_from(index).ok().filter(|&i| i < len)
}

/// Like [`array_slot`] but out-of-range is an error, for writes.
pub fn array_slot_mut(op: &'static str, len: usize, index: i64) -> Result<usize, IntrinsicError> {
    array_slot(len, index).ok_or(IntrinsicError::IndexOutOfRange { op, index, len })
}

pub fn arr_join(items: &Value, sep: &Value) -> Result<Value, IntrinsicError> {
    let items = items
        .as_array()
        .ok_or_else(|| mismatch("arr_join", "array", items))?;
    let sep = expect_str("arr_join", sep)?;
    let parts: Vec<String> = items.iter().map(Value::to_display_string).collect();
    Ok(Value::String(parts.join(sep)))
}

/// Checks a guest-requested element count against [`MAX_ARRAY_LEN`].
pub fn array_len(op: &'static str, len: i64) -> Result<usize, IntrinsicError> {
    let len = u64::try_from(len).map_err(|_| IntrinsicError::NegativeLength { op, len })?;
    if len > MAX_ARRAY_LEN {
        return Err(IntrinsicError::TooLarge { op, len });
    }
    Ok(len as usize)
}

/// Integers `start..end`; empty when `end <= start`.
pub fn arr_range(start: i64, end: i64) -> Result<Value, IntrinsicError> {
    if end <= start {
        return Ok(Value::Array(Vec::new()));
    }
    let span = end.checked_sub(start).ok_or(IntrinsicError::TooLarge {
        op: "arr_range",
        len: u64::MAX,
    })?;
    let span = array_len("arr_range", span)?;
    let mut items = Vec::with_capacity(span);
    items.extend((start..end).map(Value::Integer));
    Ok(Value::Array(items))
}

// =============================================================================
// Objects
// =============================================================================

pub fn obj_key<'a>(op: &'static str, key: &'a Value) -> Result<&'a str, IntrinsicError> {
    expect_str(op, key)
}

pub fn keys_value(keys: Vec<String>) -> Value {
    Value::Array(keys.into_iter().map(Value::String).collect())
}

// =============================================================================
// Values
// =============================================================================

pub fn val_eq(a: &Value, b: &Value) -> bool {
    equal(a, b)
}

pub fn val_to_string(v: &Value) -> Value {
    Value::String(v.to_display_string())
}

// =============================================================================
// JSON
// =============================================================================

pub fn json_stringify(v: &Value) -> Result<Value, IntrinsicError> {
    json::stringify(v)
        .map(Value::String)
        .map_err(|source| IntrinsicError::Json {
            op: "json_stringify",
            source,
        })
}

/// Bad input text is a catchable error value, not a trap.
pub fn json_parse(text: &Value) -> Result<Value, IntrinsicError> {
    let text = expect_str("json_parse", text)?;
    Ok(match json::parse(text) {
        Ok(v) => v,
        Err(e) => Value::error(e.to_string(), None),
    })
}

/// A malformed schema description is a codegen bug and traps; a document
/// that fails validation is a catchable error value.
pub fn json_decode(text: &Value, schema_text: &Value) -> Result<Value, IntrinsicError> {
    let text = expect_str("json_decode", text)?;
    let schema_text = expect_str("json_decode", schema_text)?;
    let schema = Schema::parse(schema_text).map_err(|source| IntrinsicError::Schema {
        op: "json_decode",
        source,
    })?;
    Ok(schema::decode(text, &schema))
}

// =============================================================================
// Tests
// =============================================================================
