/*
 * Copyright (c) 2026 Mohamad Al-Zawahreh (dba Sovereign Systems).
 *
 * JSON encode/decode for Sable values.
 *
 * LICENSE: DUAL-LICENSED (AGPLv3 or COMMERCIAL).
 */

use crate::value::{Object, Value};
use serde_json::{Map, Number};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum JsonError {
    #[error("cannot serialize non-finite float {0}")]
    NonFiniteFloat(f64),
    #[error("JSON parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Serializes a value to compact JSON text.
///
/// Object keys keep insertion order and keys holding `Undefined` are
/// omitted. Array slots are always written; an `Undefined` slot becomes
/// `null`. Fails only on NaN or infinite floats.
pub fn stringify(value: &Value) -> Result<String, JsonError> {
    let json = to_json(value)?;
    Ok(serde_json::to_string(&json)?)
}

pub fn to_json(value: &Value) -> Result<serde_json::Value, JsonError> {
    Ok(match value {
        Value::Undefined | Value::Null => serde_json::Value::Null,
        Value::Boolean(b) => serde_json::Value::Bool(*b),
        Value::Integer(n) => serde_json::Value::Number((*n).into()),
        Value::Float(x) => {
            serde_json::Value::Number(Number::from_f64(*x).ok_or(JsonError::NonFiniteFloat(*x))?)
        }
        Value::String(s) => serde_json::Value::String(s.clone()),
        Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(to_json).collect::<Result<_, _>>()?)
        }
        Value::Object(obj) => {
            let mut map = Map::with_capacity(obj.len());
            for (key, v) in obj.iter() {
                if v.is_undefined() {
                    continue;
                }
                map.insert(key.to_string(), to_json(v)?);
            }
            serde_json::Value::Object(map)
        }
    })
}

/// Strict parse of a single JSON document. Trailing non-whitespace is
/// rejected.
pub fn parse(text: &str) -> Result<Value, JsonError> {
    let json: serde_json::Value = serde_json::from_str(text)?;
    Ok(from_json(json))
}

/// Converts parsed JSON into a value. Integral literals that fit in i64
/// become `Integer`; everything else numeric becomes `Float`. Object keys
/// are sorted.
pub fn from_json(json: serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Boolean(b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Integer(i),
            None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        serde_json::Value::String(s) => Value::String(s),
        serde_json::Value::Array(items) => Value::Array(items.into_iter().map(from_json).collect()),
        serde_json::Value::Object(map) => {
            let mut obj: Object = map.into_iter().map(|(k, v)| (k, from_json(v))).collect();
            obj.sort_keys();
            Value::Object(obj)
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
