/*
 * Copyright (c) 2026 Mohamad Al-Zawahreh (dba Sovereign Systems).
 *
 * Schema-validating JSON decoder.
 *
 * The compiler describes the expected shape of decoded JSON with a small
 * recursive grammar and the host validates parsed input against it. Every
 * failure comes back as a catchable `{type: "error", message, path}` value.
 *
 * LICENSE: DUAL-LICENSED (AGPLv3 or COMMERCIAL).
 */

use crate::json;
use crate::value::{Object, Value};
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("invalid schema description: {0}")]
    Invalid(#[from] serde_json::Error),
}

/// A schema node. Parsed from `{"type": "...", ...}` JSON.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Schema {
    Json,
    Undefined,
    Null,
    String {
        #[serde(default)]
        literal: Option<String>,
    },
    Boolean {
        #[serde(default)]
        literal: Option<bool>,
    },
    Integer {
        #[serde(default)]
        literal: Option<i64>,
    },
    Number {
        #[serde(default)]
        literal: Option<f64>,
    },
    Array {
        items: Box<Schema>,
    },
    Tuple {
        items: Vec<Schema>,
    },
    Object {
        #[serde(default)]
        fields: Vec<Field>,
        #[serde(default)]
        index: Option<Box<Schema>>,
    },
    Union {
        variants: Vec<Schema>,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Field {
    pub name: String,
    pub schema: Schema,
}

impl Schema {
    pub fn parse(description: &str) -> Result<Schema, SchemaError> {
        Ok(serde_json::from_str(description)?)
    }

    /// Whether a missing object field may satisfy this schema.
    pub fn accepts_undefined(&self) -> bool {
        match self {
            Schema::Undefined => true,
            Schema::Union { variants } => variants.iter().any(Schema::accepts_undefined),
            _ => false,
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            Schema::Json => "json",
            Schema::Undefined => "undefined",
            Schema::Null => "null",
            Schema::String { .. } => "string",
            Schema::Boolean { .. } => "boolean",
            Schema::Integer { .. } => "integer",
            Schema::Number { .. } => "number",
            Schema::Array { .. } => "array",
            Schema::Tuple { .. } => "tuple",
            Schema::Object { .. } => "object",
            Schema::Union { .. } => "union",
        }
    }
}

/// A failed validation: what went wrong and where.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeError {
    pub message: String,
    pub path: String,
}

impl DecodeError {
    pub fn into_value(self) -> Value {
        Value::error(self.message, Some(&self.path))
    }
}

/// Parses `text` and validates it against `schema`. Returns the decoded
/// value or an error value; never panics or traps on bad input.
pub fn decode(text: &str, schema: &Schema) -> Value {
    let parsed = match json::parse(text) {
        Ok(v) => v,
        Err(e) => return Value::error(e.to_string(), Some("$")),
    };
    match validate(&parsed, schema, &mut Path::root()) {
        Ok(v) => v,
        Err(e) => e.into_value(),
    }
}

// =============================================================================
// Accessor Path
// =============================================================================

/// `$`-rooted accessor built incrementally while descending.
struct Path {
    text: String,
}

impl Path {
    fn root() -> Self {
        Path {
            text: "$".to_string(),
        }
    }

    fn with_field<T>(&mut self, name: &str, f: impl FnOnce(&mut Path) -> T) -> T {
        let mark = self.text.len();
        self.text.push('.');
        self.text.push_str(name);
        let out = f(self);
        self.text.truncate(mark);
        out
    }

    fn with_index<T>(&mut self, index: usize, f: impl FnOnce(&mut Path) -> T) -> T {
        let mark = self.text.len();
        self.text.push('[');
        self.text.push_str(&index.to_string());
        self.text.push(']');
        let out = f(self);
        self.text.truncate(mark);
        out
    }

    fn fail(&self, message: impl Into<String>) -> DecodeError {
        DecodeError {
            message: message.into(),
            path: self.text.clone(),
        }
    }
}

// =============================================================================
// Validation
// =============================================================================

fn mismatch(path: &Path, schema: &Schema, got: &Value) -> DecodeError {
    path.fail(format!("expected {}, got {}", schema.describe(), got.kind()))
}

fn validate(value: &Value, schema: &Schema, path: &mut Path) -> Result<Value, DecodeError> {
    match schema {
        Schema::Json => match value {
            Value::Undefined => Err(mismatch(path, schema, value)),
            _ => Ok(value.clone()),
        },
        Schema::Undefined => match value {
            Value::Undefined => Ok(Value::Undefined),
            _ => Err(mismatch(path, schema, value)),
        },
        Schema::Null => match value {
            Value::Null => Ok(Value::Null),
            _ => Err(mismatch(path, schema, value)),
        },
        Schema::String { literal } => match value {
            Value::String(s) => match literal {
                Some(lit) if lit != s => Err(path.fail(format!("expected literal \"{}\"", lit))),
                _ => Ok(value.clone()),
            },
            _ => Err(mismatch(path, schema, value)),
        },
        Schema::Boolean { literal } => match value {
            Value::Boolean(b) => match literal {
                Some(lit) if lit != b => Err(path.fail(format!("expected literal {}", lit))),
                _ => Ok(value.clone()),
            },
            _ => Err(mismatch(path, schema, value)),
        },
        Schema::Integer { literal } => {
            let n = match value {
                Value::Integer(n) => *n,
                Value::Float(x) if x.fract() == 0.0 && x.abs() < 9.007_199_254_740_992e15 => {
                    *x as i64
                }
                _ => return Err(mismatch(path, schema, value)),
            };
            match literal {
                Some(lit) if *lit != n => Err(path.fail(format!("expected literal {}", lit))),
                _ => Ok(Value::Integer(n)),
            }
        }
        Schema::Number { literal } => {
            let x = value.as_f64().ok_or_else(|| mismatch(path, schema, value))?;
            match literal {
                Some(lit) if *lit != x => Err(path.fail(format!("expected literal {}", lit))),
                _ => Ok(Value::Float(x)),
            }
        }
        Schema::Array { items } => {
            let elems = value.as_array().ok_or_else(|| mismatch(path, schema, value))?;
            let mut out = Vec::with_capacity(elems.len());
            for (i, elem) in elems.iter().enumerate() {
                out.push(path.with_index(i, |p| validate(elem, items, p))?);
            }
            Ok(Value::Array(out))
        }
        Schema::Tuple { items } => {
            let elems = value.as_array().ok_or_else(|| mismatch(path, schema, value))?;
            if elems.len() != items.len() {
                return Err(path.fail(format!(
                    "expected tuple of length {}, got length {}",
                    items.len(),
                    elems.len()
                )));
            }
            let mut out = Vec::with_capacity(elems.len());
            for (i, (elem, item)) in elems.iter().zip(items).enumerate() {
                out.push(path.with_index(i, |p| validate(elem, item, p))?);
            }
            Ok(Value::Array(out))
        }
        Schema::Object { fields, index } => {
            let obj = value.as_object().ok_or_else(|| mismatch(path, schema, value))?;
            validate_object(obj, fields, index.as_deref(), path)
        }
        Schema::Union { variants } => {
            let mut last = None;
            for variant in variants {
                match validate(value, variant, path) {
                    Ok(v) => return Ok(v),
                    Err(e) => last = Some(e),
                }
            }
            Err(last.unwrap_or_else(|| path.fail("union has no variants")))
        }
    }
}

fn validate_object(
    obj: &Object,
    fields: &[Field],
    index: Option<&Schema>,
    path: &mut Path,
) -> Result<Value, DecodeError> {
    let mut out = Object::with_capacity(obj.len());
    for field in fields {
        match obj.get(&field.name) {
            Some(v) => {
                let decoded = path.with_field(&field.name, |p| validate(v, &field.schema, p))?;
                out.insert(field.name.clone(), decoded);
            }
            None if field.schema.accepts_undefined() => {}
            None => {
                return Err(path.with_field(&field.name, |p| p.fail("missing required field")));
            }
        }
    }
    // Undeclared keys survive only through an index signature.
    if let Some(index) = index {
        for (key, v) in obj.iter() {
            if fields.iter().any(|f| f.name == key) {
                continue;
            }
            let decoded = path.with_field(key, |p| validate(v, index, p))?;
            out.insert(key, decoded);
        }
    }
    Ok(Value::Object(out))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(text: &str) -> Schema {
        Schema::parse(text).expect("schema should parse")
    }

    fn error_parts(v: &Value) -> (String, String) {
        assert!(v.is_error(), "expected an error value, got {}", v);
        let o = v.as_object().unwrap();
        (
            o.get("message").unwrap().as_str().unwrap().to_string(),
            o.get("path").unwrap().as_str().unwrap().to_string(),
        )
    }

    #[test]
    fn test_union_first_match_prefers_declared_order() {
        let s = schema(r#"{"type":"union","variants":[{"type":"integer"},{"type":"string"}]}"#);
        assert_eq!(decode(r#""5""#, &s), Value::from("5"));
        assert_eq!(decode("5", &s), Value::Integer(5));
    }

    #[test]
    fn test_union_reports_last_branch_error() {
        let s = schema(r#"{"type":"union","variants":[{"type":"integer"},{"type":"string"}]}"#);
        let (message, path) = error_parts(&decode("true", &s));
        assert_eq!(message, "expected string, got boolean");
        assert_eq!(path, "$");
    }

    #[test]
    fn test_nested_error_path() {
        let s = schema(
            r#"{"type":"object","fields":[
                {"name":"items","schema":{"type":"array","items":
                    {"type":"object","fields":[{"name":"name","schema":{"type":"string"}}]}}}
            ]}"#,
        );
        let input = r#"{"items":[{"name":"a"},{"name":"b"},{"name":3}]}"#;
        let (message, path) = error_parts(&decode(input, &s));
        assert_eq!(path, "$.items[2].name");
        assert_eq!(message, "expected string, got integer");
    }

    #[test]
    fn test_missing_field_requires_undefined() {
        let required = schema(
            r#"{"type":"object","fields":[{"name":"a","schema":{"type":"integer"}}]}"#,
        );
        let (message, path) = error_parts(&decode("{}", &required));
        assert_eq!(message, "missing required field");
        assert_eq!(path, "$.a");

        let optional = schema(
            r#"{"type":"object","fields":[{"name":"a","schema":
                {"type":"union","variants":[{"type":"integer"},{"type":"undefined"}]}}]}"#,
        );
        let decoded = decode("{}", &optional);
        assert!(!decoded.is_error());
        assert!(decoded.as_object().unwrap().is_empty());
    }

    #[test]
    fn test_extra_keys_dropped_without_index() {
        let s = schema(r#"{"type":"object","fields":[{"name":"a","schema":{"type":"json"}}]}"#);
        let decoded = decode(r#"{"a":1,"b":2}"#, &s);
        let o = decoded.as_object().unwrap();
        assert_eq!(o.keys().collect::<Vec<_>>(), vec!["a"]);
    }

    #[test]
    fn test_index_signature_validates_extra_keys() {
        let s = schema(
            r#"{"type":"object","fields":[{"name":"id","schema":{"type":"integer"}}],
                "index":{"type":"string"}}"#,
        );
        let decoded = decode(r#"{"id":1,"x":"y"}"#, &s);
        assert_eq!(
            decoded.as_object().unwrap().get("x"),
            Some(&Value::from("y"))
        );
        let (_, path) = error_parts(&decode(r#"{"id":1,"x":2}"#, &s));
        assert_eq!(path, "$.x");
    }

    #[test]
    fn test_literal_refinement() {
        let s = schema(r#"{"type":"string","literal":"ok"}"#);
        assert_eq!(decode(r#""ok""#, &s), Value::from("ok"));
        let (message, _) = error_parts(&decode(r#""no""#, &s));
        assert_eq!(message, "expected literal \"ok\"");
    }

    #[test]
    fn test_tuple_length_and_items() {
        let s = schema(r#"{"type":"tuple","items":[{"type":"integer"},{"type":"boolean"}]}"#);
        assert_eq!(
            decode("[1,true]", &s),
            Value::from(vec![Value::from(1), Value::from(true)])
        );
        let (message, _) = error_parts(&decode("[1]", &s));
        assert!(message.contains("length 2"), "got: {}", message);
        let (_, path) = error_parts(&decode("[1,2]", &s));
        assert_eq!(path, "$[1]");
    }

    #[test]
    fn test_number_accepts_integers_as_float() {
        let s = schema(r#"{"type":"number"}"#);
        assert_eq!(decode("3", &s), Value::Float(3.0));
        assert_eq!(decode("2.5", &s), Value::Float(2.5));
    }

    #[test]
    fn test_integer_accepts_integral_float() {
        let s = schema(r#"{"type":"integer"}"#);
        assert_eq!(decode("4.0", &s), Value::Integer(4));
        assert!(decode("4.5", &s).is_error());
    }

    #[test]
    fn test_bad_json_input_is_catchable() {
        let s = schema(r#"{"type":"json"}"#);
        let (_, path) = error_parts(&decode("{", &s));
        assert_eq!(path, "$");
    }

    #[test]
    fn test_invalid_schema_rejected() {
        assert!(Schema::parse(r#"{"type":"wat"}"#).is_err());
        assert!(Schema::parse(r#"{"type":"array"}"#).is_err());
    }
}
