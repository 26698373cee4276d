/*
 * Copyright (c) 2026 Mohamad Al-Zawahreh (dba Sovereign Systems).
 *
 * Handle encoding: an append-only value table indexed by i32.
 *
 * Handles 0 and 1 are the Undefined and Null singletons. Nothing is freed
 * before the table itself is dropped at the end of the execution.
 *
 * LICENSE: DUAL-LICENSED (AGPLv3 or COMMERCIAL).
 */

use super::{BridgeError, Cx, Encoding, ValueBridge, MAX_DEPTH};
use crate::value::{Kind, Object, Value};
use indexmap::IndexMap;
use std::collections::HashMap;

#[derive(Debug, Clone)]
enum Slot {
    Undefined,
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Array(Vec<i32>),
    Object(IndexMap<String, i32>),
}

impl Slot {
    fn kind(&self) -> Kind {
        match self {
            Slot::Undefined => Kind::Undefined,
            Slot::Null => Kind::Null,
            Slot::Boolean(_) => Kind::Boolean,
            Slot::Integer(_) => Kind::Integer,
            Slot::Float(_) => Kind::Float,
            Slot::String(_) => Kind::String,
            Slot::Array(_) => Kind::Array,
            Slot::Object(_) => Kind::Object,
        }
    }
}

#[derive(Debug)]
pub struct HandleTable {
    slots: Vec<Slot>,
    interned: HashMap<(u32, u32), i32>,
}

impl HandleTable {
    pub const UNDEFINED: i32 = 0;
    pub const NULL: i32 = 1;

    pub fn new() -> Self {
        HandleTable {
            slots: vec![Slot::Undefined, Slot::Null],
            interned: HashMap::new(),
        }
    }

    /// Number of live handles, singletons included.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn slot(&self, handle: i32) -> Result<&Slot, BridgeError> {
        usize::try_from(handle)
            .ok()
            .and_then(|i| self.slots.get(i))
            .ok_or(BridgeError::BadHandle(handle))
    }

    fn slot_mut(&mut self, handle: i32) -> Result<&mut Slot, BridgeError> {
        usize::try_from(handle)
            .ok()
            .and_then(|i| self.slots.get_mut(i))
            .ok_or(BridgeError::BadHandle(handle))
    }

    fn push(&mut self, slot: Slot) -> Result<i32, BridgeError> {
        let handle = i32::try_from(self.slots.len()).map_err(|_| BridgeError::Exhausted)?;
        self.slots.push(slot);
        Ok(handle)
    }

    pub fn kind_of(&self, handle: i32) -> Result<Kind, BridgeError> {
        Ok(self.slot(handle)?.kind())
    }

    /// Copies a host value into the table.
    pub fn alloc(&mut self, value: &Value) -> Result<i32, BridgeError> {
        self.alloc_at(value, 0)
    }

    fn alloc_at(&mut self, value: &Value, depth: usize) -> Result<i32, BridgeError> {
        if depth > MAX_DEPTH {
            return Err(BridgeError::TooDeep);
        }
        let slot = match value {
            Value::Undefined => return Ok(Self::UNDEFINED),
            Value::Null => return Ok(Self::NULL),
            Value::Boolean(b) => Slot::Boolean(*b),
            Value::Integer(n) => Slot::Integer(*n),
            Value::Float(x) => Slot::Float(*x),
            Value::String(s) => Slot::String(s.clone()),
            Value::Array(items) => {
                let mut handles = Vec::with_capacity(items.len());
                for item in items {
                    handles.push(self.alloc_at(item, depth + 1)?);
                }
                Slot::Array(handles)
            }
            Value::Object(obj) => {
                let mut entries = IndexMap::with_capacity(obj.len());
                for (key, item) in obj.iter() {
                    entries.insert(key.to_string(), self.alloc_at(item, depth + 1)?);
                }
                Slot::Object(entries)
            }
        };
        self.push(slot)
    }

    /// Reads a handle back out as an owned host value.
    pub fn read(&self, handle: i32) -> Result<Value, BridgeError> {
        self.read_at(handle, 0)
    }

    fn read_at(&self, handle: i32, depth: usize) -> Result<Value, BridgeError> {
        if depth > MAX_DEPTH {
            return Err(BridgeError::TooDeep);
        }
        Ok(match self.slot(handle)? {
            Slot::Undefined => Value::Undefined,
            Slot::Null => Value::Null,
            Slot::Boolean(b) => Value::Boolean(*b),
            Slot::Integer(n) => Value::Integer(*n),
            Slot::Float(x) => Value::Float(*x),
            Slot::String(s) => Value::String(s.clone()),
            Slot::Array(handles) => Value::Array(
                handles
                    .iter()
                    .map(|h| self.read_at(*h, depth + 1))
                    .collect::<Result<_, _>>()?,
            ),
            Slot::Object(entries) => {
                let mut obj = Object::with_capacity(entries.len());
                for (key, h) in entries {
                    obj.insert(key.clone(), self.read_at(*h, depth + 1)?);
                }
                Value::Object(obj)
            }
        })
    }

    fn array(&self, handle: i32) -> Result<&Vec<i32>, BridgeError> {
        match self.slot(handle)? {
            Slot::Array(items) => Ok(items),
            other => Err(BridgeError::WrongKind {
                expected: Kind::Array,
                found: other.kind(),
            }),
        }
    }

    fn object(&self, handle: i32) -> Result<&IndexMap<String, i32>, BridgeError> {
        match self.slot(handle)? {
            Slot::Object(entries) => Ok(entries),
            other => Err(BridgeError::WrongKind {
                expected: Kind::Object,
                found: other.kind(),
            }),
        }
    }

    pub fn array_set(&mut self, array: i32, index: usize, item: i32) -> Result<(), BridgeError> {
        self.slot(item)?;
        match self.slot_mut(array)? {
            Slot::Array(items) => {
                let len = items.len();
                let slot = items
                    .get_mut(index)
                    .ok_or(BridgeError::IndexOutOfRange { index, len })?;
                *slot = item;
                Ok(())
            }
            other => Err(BridgeError::WrongKind {
                expected: Kind::Array,
                found: other.kind(),
            }),
        }
    }

    pub fn object_set(&mut self, object: i32, key: String, item: i32) -> Result<(), BridgeError> {
        self.slot(item)?;
        match self.slot_mut(object)? {
            Slot::Object(entries) => {
                entries.insert(key, item);
                Ok(())
            }
            other => Err(BridgeError::WrongKind {
                expected: Kind::Object,
                found: other.kind(),
            }),
        }
    }

    pub fn intern(&mut self, origin: (u32, u32), text: &str) -> Result<i32, BridgeError> {
        if let Some(handle) = self.interned.get(&origin) {
            return Ok(*handle);
        }
        let handle = self.push(Slot::String(text.to_string()))?;
        self.interned.insert(origin, handle);
        Ok(handle)
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ValueBridge for HandleTable {
    type Guest = i32;

    const ENCODING: Encoding = Encoding::Handle;

    fn new() -> Self {
        HandleTable::new()
    }

    fn to_guest(cx: &mut Cx<'_, Self>, value: &Value) -> Result<i32, BridgeError> {
        cx.data_mut().bridge.alloc(value)
    }

    fn to_host(cx: &mut Cx<'_, Self>, guest: i32) -> Result<Value, BridgeError> {
        cx.data().bridge.read(guest)
    }

    fn kind(cx: &mut Cx<'_, Self>, guest: i32) -> Result<Kind, BridgeError> {
        cx.data().bridge.kind_of(guest)
    }

    fn new_array(cx: &mut Cx<'_, Self>, len: usize) -> Result<i32, BridgeError> {
        cx.data_mut()
            .bridge
            .push(Slot::Array(vec![Self::UNDEFINED; len]))
    }

    fn array_len(cx: &mut Cx<'_, Self>, array: i32) -> Result<usize, BridgeError> {
        Ok(cx.data().bridge.array(array)?.len())
    }

    fn array_get(cx: &mut Cx<'_, Self>, array: i32, index: usize) -> Result<i32, BridgeError> {
        let items = cx.data().bridge.array(array)?;
        items
            .get(index)
            .copied()
            .ok_or(BridgeError::IndexOutOfRange {
                index,
                len: items.len(),
            })
    }

    fn array_set(
        cx: &mut Cx<'_, Self>,
        array: i32,
        index: usize,
        item: i32,
    ) -> Result<(), BridgeError> {
        cx.data_mut().bridge.array_set(array, index, item)
    }

    fn new_object(cx: &mut Cx<'_, Self>) -> Result<i32, BridgeError> {
        cx.data_mut().bridge.push(Slot::Object(IndexMap::new()))
    }

    fn object_get(
        cx: &mut Cx<'_, Self>,
        object: i32,
        key: &str,
    ) -> Result<Option<i32>, BridgeError> {
        Ok(cx.data().bridge.object(object)?.get(key).copied())
    }

    fn object_set(
        cx: &mut Cx<'_, Self>,
        object: i32,
        key: String,
        item: i32,
    ) -> Result<(), BridgeError> {
        cx.data_mut().bridge.object_set(object, key, item)
    }

    fn object_keys(cx: &mut Cx<'_, Self>, object: i32) -> Result<Vec<String>, BridgeError> {
        Ok(cx.data().bridge.object(object)?.keys().cloned().collect())
    }

    fn intern(cx: &mut Cx<'_, Self>, origin: (u32, u32), text: &str) -> Result<i32, BridgeError> {
        cx.data_mut().bridge.intern(origin, text)
    }

    fn undefined(_cx: &mut Cx<'_, Self>) -> Result<i32, BridgeError> {
        Ok(Self::UNDEFINED)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_singletons_are_fixed_handles() {
        let mut table = HandleTable::new();
        assert_eq!(table.alloc(&Value::Null).unwrap(), HandleTable::NULL);
        assert_eq!(table.alloc(&Value::Null).unwrap(), HandleTable::NULL);
        assert_eq!(table.alloc(&Value::Undefined).unwrap(), HandleTable::UNDEFINED);
        assert_eq!(table.len(), 2, "singletons never allocate");
    }

    #[test]
    fn test_bad_handles_are_errors() {
        let table = HandleTable::new();
        assert!(matches!(table.read(2), Err(BridgeError::BadHandle(2))));
        assert!(matches!(table.read(-1), Err(BridgeError::BadHandle(-1))));
        assert!(matches!(table.kind_of(99), Err(BridgeError::BadHandle(99))));
    }

    #[test]
    fn test_set_rejects_dangling_item() {
        let mut table = HandleTable::new();
        let arr = table.alloc(&Value::from(vec![Value::Null])).unwrap();
        assert!(matches!(
            table.array_set(arr, 0, 500),
            Err(BridgeError::BadHandle(500))
        ));
    }

    #[test]
    fn test_intern_reuses_handle_per_origin() {
        let mut table = HandleTable::new();
        let a = table.intern((16, 5), "hello").unwrap();
        let b = table.intern((16, 5), "hello").unwrap();
        let c = table.intern((32, 5), "hello").unwrap();
        assert_eq!(a, b, "same origin, same handle");
        assert_ne!(a, c, "different origin, fresh handle");
        assert_eq!(table.read(c).unwrap(), Value::from("hello"));
    }

    #[test]
    fn test_object_set_keeps_position() {
        let mut table = HandleTable::new();
        let mut obj = Object::new();
        obj.insert("b", Value::Integer(1));
        obj.insert("a", Value::Integer(2));
        let h = table.alloc(&Value::Object(obj)).unwrap();
        let three = table.alloc(&Value::Integer(3)).unwrap();
        table.object_set(h, "b".to_string(), three).unwrap();
        let back = table.read(h).unwrap();
        let keys: Vec<_> = back.as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["b", "a"]);
        assert_eq!(back.as_object().unwrap().get("b"), Some(&Value::Integer(3)));
    }
}
