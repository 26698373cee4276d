/*
 * Copyright (c) 2026 Mohamad Al-Zawahreh (dba Sovereign Systems).
 *
 * Reference encoding: guest values are externrefs wrapping host nodes.
 *
 * Each externref carries a `RefNode`, a shared pointer into a host-side
 * node graph. Containers hold child nodes, not externrefs, so a child is
 * wrapped in a fresh externref each time it is handed to the guest. A
 * null externref from the guest reads as Null.
 *
 * LICENSE: DUAL-LICENSED (AGPLv3 or COMMERCIAL).
 */

use super::{BridgeError, Cx, Encoding, ValueBridge, MAX_DEPTH};
use crate::value::{Kind, Object, Value};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use wasmtime::{AsContext, ExternRef, Rooted};

/// Host payload of every externref this bridge creates.
#[derive(Debug, Clone)]
pub struct RefNode(pub Arc<Node>);

#[derive(Debug)]
pub enum Node {
    Undefined,
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Array(Mutex<Vec<Arc<Node>>>),
    Object(Mutex<IndexMap<String, Arc<Node>>>),
}

impl Node {
    pub fn kind(&self) -> Kind {
        match self {
            Node::Undefined => Kind::Undefined,
            Node::Null => Kind::Null,
            Node::Boolean(_) => Kind::Boolean,
            Node::Integer(_) => Kind::Integer,
            Node::Float(_) => Kind::Float,
            Node::String(_) => Kind::String,
            Node::Array(_) => Kind::Array,
            Node::Object(_) => Kind::Object,
        }
    }

    fn to_value(&self, depth: usize) -> Result<Value, BridgeError> {
        if depth > MAX_DEPTH {
            return Err(BridgeError::TooDeep);
        }
        Ok(match self {
            Node::Undefined => Value::Undefined,
            Node::Null => Value::Null,
            Node::Boolean(b) => Value::Boolean(*b),
            Node::Integer(n) => Value::Integer(*n),
            Node::Float(x) => Value::Float(*x),
            Node::String(s) => Value::String(s.clone()),
            Node::Array(items) => {
                // Snapshot so the lock is not held across the recursion;
                // a self-referencing array would otherwise deadlock.
                let items: Vec<Arc<Node>> = items.lock().clone();
                Value::Array(
                    items
                        .iter()
                        .map(|n| n.to_value(depth + 1))
                        .collect::<Result<_, _>>()?,
                )
            }
            Node::Object(entries) => {
                let entries: Vec<(String, Arc<Node>)> = entries
                    .lock()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                let mut obj = Object::with_capacity(entries.len());
                for (key, node) in entries {
                    obj.insert(key, node.to_value(depth + 1)?);
                }
                Value::Object(obj)
            }
        })
    }
}

#[derive(Debug)]
pub struct ReferenceBridge {
    undefined: Arc<Node>,
    null: Arc<Node>,
    interned: HashMap<(u32, u32), Arc<Node>>,
}

impl ReferenceBridge {
    pub fn new() -> Self {
        ReferenceBridge {
            undefined: Arc::new(Node::Undefined),
            null: Arc::new(Node::Null),
            interned: HashMap::new(),
        }
    }

    /// Builds the host node graph for a value. Null and Undefined share
    /// the bridge's singletons.
    pub fn node(&self, value: &Value) -> Result<Arc<Node>, BridgeError> {
        self.node_at(value, 0)
    }

    fn node_at(&self, value: &Value, depth: usize) -> Result<Arc<Node>, BridgeError> {
        if depth > MAX_DEPTH {
            return Err(BridgeError::TooDeep);
        }
        Ok(match value {
            Value::Undefined => self.undefined.clone(),
            Value::Null => self.null.clone(),
            Value::Boolean(b) => Arc::new(Node::Boolean(*b)),
            Value::Integer(n) => Arc::new(Node::Integer(*n)),
            Value::Float(x) => Arc::new(Node::Float(*x)),
            Value::String(s) => Arc::new(Node::String(s.clone())),
            Value::Array(items) => {
                let nodes = items
                    .iter()
                    .map(|item| self.node_at(item, depth + 1))
                    .collect::<Result<Vec<_>, _>>()?;
                Arc::new(Node::Array(Mutex::new(nodes)))
            }
            Value::Object(obj) => {
                let mut entries = IndexMap::with_capacity(obj.len());
                for (key, item) in obj.iter() {
                    entries.insert(key.to_string(), self.node_at(item, depth + 1)?);
                }
                Arc::new(Node::Object(Mutex::new(entries)))
            }
        })
    }

    pub fn is_singleton(&self, node: &Arc<Node>) -> bool {
        Arc::ptr_eq(node, &self.null) || Arc::ptr_eq(node, &self.undefined)
    }
}

impl Default for ReferenceBridge {
    fn default() -> Self {
        Self::new()
    }
}

type Guest = Option<Rooted<ExternRef>>;

fn engine_err(e: impl std::fmt::Display) -> BridgeError {
    BridgeError::Engine(e.to_string())
}

/// Resolves a guest reference to its host node.
fn node_of(cx: &mut Cx<'_, ReferenceBridge>, guest: Guest) -> Result<Arc<Node>, BridgeError> {
    let Some(r) = guest else {
        return Ok(cx.data().bridge.null.clone());
    };
    let data = r.data(cx.as_context()).map_err(engine_err)?;
    let node = data
        .and_then(|any| any.downcast_ref::<RefNode>())
        .ok_or(BridgeError::ForeignReference)?;
    Ok(node.0.clone())
}

fn wrap(cx: &mut Cx<'_, ReferenceBridge>, node: Arc<Node>) -> Result<Guest, BridgeError> {
    let r = ExternRef::new(&mut *cx, RefNode(node)).map_err(engine_err)?;
    Ok(Some(r))
}

fn wrong(expected: Kind, node: &Node) -> BridgeError {
    BridgeError::WrongKind {
        expected,
        found: node.kind(),
    }
}

impl ValueBridge for ReferenceBridge {
    type Guest = Guest;

    const ENCODING: Encoding = Encoding::Reference;

    fn new() -> Self {
        ReferenceBridge::new()
    }

    fn to_guest(cx: &mut Cx<'_, Self>, value: &Value) -> Result<Guest, BridgeError> {
        let node = cx.data().bridge.node(value)?;
        wrap(cx, node)
    }

    fn to_host(cx: &mut Cx<'_, Self>, guest: Guest) -> Result<Value, BridgeError> {
        node_of(cx, guest)?.to_value(0)
    }

    fn kind(cx: &mut Cx<'_, Self>, guest: Guest) -> Result<Kind, BridgeError> {
        Ok(node_of(cx, guest)?.kind())
    }

    fn new_array(cx: &mut Cx<'_, Self>, len: usize) -> Result<Guest, BridgeError> {
        let undefined = cx.data().bridge.undefined.clone();
        let node = Arc::new(Node::Array(Mutex::new(vec![undefined; len])));
        wrap(cx, node)
    }

    fn array_len(cx: &mut Cx<'_, Self>, array: Guest) -> Result<usize, BridgeError> {
        match &*node_of(cx, array)? {
            Node::Array(items) => Ok(items.lock().len()),
            other => Err(wrong(Kind::Array, other)),
        }
    }

    fn array_get(cx: &mut Cx<'_, Self>, array: Guest, index: usize) -> Result<Guest, BridgeError> {
        let child = match &*node_of(cx, array)? {
            Node::Array(items) => {
                let items = items.lock();
                items
                    .get(index)
                    .cloned()
                    .ok_or(BridgeError::IndexOutOfRange {
                        index,
                        len: items.len(),
                    })?
            }
            other => return Err(wrong(Kind::Array, other)),
        };
        wrap(cx, child)
    }

    fn array_set(
        cx: &mut Cx<'_, Self>,
        array: Guest,
        index: usize,
        item: Guest,
    ) -> Result<(), BridgeError> {
        let item = node_of(cx, item)?;
        match &*node_of(cx, array)? {
            Node::Array(items) => {
                let mut items = items.lock();
                let len = items.len();
                let slot = items
                    .get_mut(index)
                    .ok_or(BridgeError::IndexOutOfRange { index, len })?;
                *slot = item;
                Ok(())
            }
            other => Err(wrong(Kind::Array, other)),
        }
    }

    fn new_object(cx: &mut Cx<'_, Self>) -> Result<Guest, BridgeError> {
        wrap(cx, Arc::new(Node::Object(Mutex::new(IndexMap::new()))))
    }

    fn object_get(
        cx: &mut Cx<'_, Self>,
        object: Guest,
        key: &str,
    ) -> Result<Option<Guest>, BridgeError> {
        let child = match &*node_of(cx, object)? {
            Node::Object(entries) => entries.lock().get(key).cloned(),
            other => return Err(wrong(Kind::Object, other)),
        };
        match child {
            Some(node) => Ok(Some(wrap(cx, node)?)),
            None => Ok(None),
        }
    }

    fn object_set(
        cx: &mut Cx<'_, Self>,
        object: Guest,
        key: String,
        item: Guest,
    ) -> Result<(), BridgeError> {
        let item = node_of(cx, item)?;
        match &*node_of(cx, object)? {
            Node::Object(entries) => {
                entries.lock().insert(key, item);
                Ok(())
            }
            other => Err(wrong(Kind::Object, other)),
        }
    }

    fn object_keys(cx: &mut Cx<'_, Self>, object: Guest) -> Result<Vec<String>, BridgeError> {
        match &*node_of(cx, object)? {
            Node::Object(entries) => Ok(entries.lock().keys().cloned().collect()),
            other => Err(wrong(Kind::Object, other)),
        }
    }

    fn intern(cx: &mut Cx<'_, Self>, origin: (u32, u32), text: &str) -> Result<Guest, BridgeError> {
        let bridge = &mut cx.data_mut().bridge;
        let node = bridge
            .interned
            .entry(origin)
            .or_insert_with(|| Arc::new(Node::String(text.to_string())))
            .clone();
        wrap(cx, node)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::tests::store;
    use wasmtime::{AsContextMut, RootScope};

    #[test]
    fn test_null_reference_reads_as_null() {
        let mut store = store::<ReferenceBridge>();
        let mut scope = RootScope::new(&mut store);
        let mut cx = scope.as_context_mut();
        assert_eq!(ReferenceBridge::kind(&mut cx, None).unwrap(), Kind::Null);
        assert_eq!(ReferenceBridge::to_host(&mut cx, None).unwrap(), Value::Null);
    }

    #[test]
    fn test_singleton_nodes_shared() {
        let bridge = ReferenceBridge::new();
        let a = bridge.node(&Value::Null).unwrap();
        let b = bridge.node(&Value::Null).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(bridge.is_singleton(&a));
        let u = bridge.node(&Value::Undefined).unwrap();
        assert!(bridge.is_singleton(&u));
        assert!(!Arc::ptr_eq(&a, &u));
    }

    #[test]
    fn test_intern_shares_node_per_origin() {
        let mut store = store::<ReferenceBridge>();
        {
            let mut scope = RootScope::new(&mut store);
            let mut cx = scope.as_context_mut();
            let first = ReferenceBridge::intern(&mut cx, (8, 3), "abc").unwrap();
            let second = ReferenceBridge::intern(&mut cx, (8, 3), "abc").unwrap();
            let a = node_of(&mut cx, first).unwrap();
            let b = node_of(&mut cx, second).unwrap();
            assert!(Arc::ptr_eq(&a, &b), "same origin resolves to one node");
        }
        assert_eq!(store.data().bridge.interned.len(), 1);
    }

    #[test]
    fn test_foreign_externref_rejected() {
        let mut store = store::<ReferenceBridge>();
        let mut scope = RootScope::new(&mut store);
        let mut cx = scope.as_context_mut();
        let foreign = ExternRef::new(&mut cx, 42u32).unwrap();
        assert!(matches!(
            ReferenceBridge::to_host(&mut cx, Some(foreign)),
            Err(BridgeError::ForeignReference)
        ));
    }
}
