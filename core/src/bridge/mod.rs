/*
 * Copyright (c) 2026 Mohamad Al-Zawahreh (dba Sovereign Systems).
 *
 * ABI Bridge: how values cross the guest boundary.
 *
 * A compiled module uses exactly one of two encodings:
 *   - handle:    guest holds i32 indices into a host-owned table
 *   - reference: guest holds externrefs wrapping host nodes
 *
 * Everything above this module (intrinsics, store, serving) is written
 * against `ValueBridge` and never sees the concrete encoding.
 *
 * LICENSE: DUAL-LICENSED (AGPLv3 or COMMERCIAL).
 */

pub mod handle;
pub mod reference;

pub use handle::HandleTable;
pub use reference::ReferenceBridge;

use crate::host::HostState;
use crate::value::{Kind, Value};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use wasmtime::{StoreContextMut, WasmTy};

/// Deepest container nesting either bridge will convert. Guests can build
/// cycles through `arr_set`/`obj_set`; this bounds the walk.
pub const MAX_DEPTH: usize = 512;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("handle {0} does not resolve")]
    BadHandle(i32),
    #[error("expected {expected}, got {found}")]
    WrongKind { expected: Kind, found: Kind },
    #[error("index {index} out of range for length {len}")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("value nesting exceeds {MAX_DEPTH} levels")]
    TooDeep,
    #[error("value table is full")]
    Exhausted,
    #[error("reference does not carry a host value")]
    ForeignReference,
    #[error("engine error: {0}")]
    Engine(String),
}

/// Which encoding a compiled module was generated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    Handle,
    Reference,
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Encoding::Handle => write!(f, "handle"),
            Encoding::Reference => write!(f, "reference"),
        }
    }
}

/// Store context every bridge operation runs against.
pub type Cx<'a, B> = StoreContextMut<'a, HostState<B>>;

/// One physical representation of the value model.
///
/// Containers have reference semantics on the guest side: `array_get`
/// returns the element itself, so a later `array_set` on that element is
/// visible through the parent. `to_host`/`to_guest` are deep copies.
pub trait ValueBridge: Sized + Send + 'static {
    /// The guest-side value type carried in imports and exports.
    type Guest: WasmTy + Copy;

    const ENCODING: Encoding;

    fn new() -> Self;

    fn to_guest(cx: &mut Cx<'_, Self>, value: &Value) -> Result<Self::Guest, BridgeError>;

    fn to_host(cx: &mut Cx<'_, Self>, guest: Self::Guest) -> Result<Value, BridgeError>;

    fn kind(cx: &mut Cx<'_, Self>, guest: Self::Guest) -> Result<Kind, BridgeError>;

    /// New array of `len` Undefined slots.
    fn new_array(cx: &mut Cx<'_, Self>, len: usize) -> Result<Self::Guest, BridgeError>;

    fn array_len(cx: &mut Cx<'_, Self>, array: Self::Guest) -> Result<usize, BridgeError>;

    fn array_get(
        cx: &mut Cx<'_, Self>,
        array: Self::Guest,
        index: usize,
    ) -> Result<Self::Guest, BridgeError>;

    fn array_set(
        cx: &mut Cx<'_, Self>,
        array: Self::Guest,
        index: usize,
        item: Self::Guest,
    ) -> Result<(), BridgeError>;

    fn new_object(cx: &mut Cx<'_, Self>) -> Result<Self::Guest, BridgeError>;

    fn object_get(
        cx: &mut Cx<'_, Self>,
        object: Self::Guest,
        key: &str,
    ) -> Result<Option<Self::Guest>, BridgeError>;

    fn object_set(
        cx: &mut Cx<'_, Self>,
        object: Self::Guest,
        key: String,
        item: Self::Guest,
    ) -> Result<(), BridgeError>;

    fn object_keys(cx: &mut Cx<'_, Self>, object: Self::Guest) -> Result<Vec<String>, BridgeError>;

    /// String literal conversion cached by its (ptr, len) origin in guest
    /// memory for the rest of the execution.
    fn intern(
        cx: &mut Cx<'_, Self>,
        origin: (u32, u32),
        text: &str,
    ) -> Result<Self::Guest, BridgeError>;

    fn undefined(cx: &mut Cx<'_, Self>) -> Result<Self::Guest, BridgeError> {
        Self::to_guest(cx, &Value::Undefined)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::value::Object;
    use wasmtime::{AsContextMut, Config, Engine, RootScope, Store};

    pub(crate) fn engine() -> Engine {
        let mut config = Config::new();
        config.wasm_reference_types(true);
        config.wasm_function_references(true);
        config.wasm_gc(true);
        Engine::new(&config).expect("engine")
    }

    pub(crate) fn store<B: ValueBridge>() -> Store<HostState<B>> {
        Store::new(&engine(), HostState::new(crate::host::HostOptions::capture()))
    }

    /// Every kind, nested, with non-sorted key order.
    pub(crate) fn sample() -> Value {
        let mut inner = Object::new();
        inner.insert("z", Value::Float(1.5));
        inner.insert("a", Value::Null);
        inner.insert("u", Value::Undefined);
        let mut outer = Object::new();
        outer.insert("name", Value::from("sable"));
        outer.insert("count", Value::Integer(-3));
        outer.insert("flag", Value::Boolean(true));
        outer.insert(
            "list",
            Value::from(vec![
                Value::Integer(1),
                Value::Object(inner),
                Value::from(vec![Value::Null]),
                Value::Undefined,
            ]),
        );
        Value::Object(outer)
    }

    fn assert_round_trip<B: ValueBridge>() {
        let mut store = store::<B>();
        let mut scope = RootScope::new(&mut store);
        let mut cx = scope.as_context_mut();
        for v in [
            Value::Undefined,
            Value::Null,
            Value::Boolean(false),
            Value::Integer(i64::MIN),
            Value::Float(-0.25),
            Value::from(""),
            Value::from(Vec::new()),
            Value::Object(Object::new()),
            sample(),
        ] {
            let g = B::to_guest(&mut cx, &v).expect("to_guest");
            assert_eq!(B::kind(&mut cx, g).unwrap(), v.kind());
            let back = B::to_host(&mut cx, g).expect("to_host");
            assert!(
                crate::value::equal(&back, &v),
                "{} round trip changed {} into {}",
                B::ENCODING,
                v,
                back
            );
            if let Value::Object(obj) = &v {
                let keys: Vec<_> = back.as_object().unwrap().keys().collect();
                assert_eq!(keys, obj.keys().collect::<Vec<_>>(), "key order kept");
            }
        }
    }

    fn assert_container_aliasing<B: ValueBridge>() {
        let mut store = store::<B>();
        let mut scope = RootScope::new(&mut store);
        let mut cx = scope.as_context_mut();
        let outer = B::new_array(&mut cx, 1).unwrap();
        let inner = B::new_object(&mut cx).unwrap();
        B::array_set(&mut cx, outer, 0, inner).unwrap();
        let one = B::to_guest(&mut cx, &Value::Integer(1)).unwrap();
        let fetched = B::array_get(&mut cx, outer, 0).unwrap();
        B::object_set(&mut cx, fetched, "k".to_string(), one).unwrap();
        let host = B::to_host(&mut cx, outer).unwrap();
        let mut expected = Object::new();
        expected.insert("k", Value::Integer(1));
        assert_eq!(host, Value::from(vec![Value::Object(expected)]));
    }

    fn assert_cycle_is_bounded<B: ValueBridge>() {
        let mut store = store::<B>();
        let mut scope = RootScope::new(&mut store);
        let mut cx = scope.as_context_mut();
        let arr = B::new_array(&mut cx, 1).unwrap();
        B::array_set(&mut cx, arr, 0, arr).unwrap();
        assert!(matches!(B::to_host(&mut cx, arr), Err(BridgeError::TooDeep)));
    }

    fn assert_array_bounds<B: ValueBridge>() {
        let mut store = store::<B>();
        let mut scope = RootScope::new(&mut store);
        let mut cx = scope.as_context_mut();
        let arr = B::new_array(&mut cx, 2).unwrap();
        assert_eq!(B::array_len(&mut cx, arr).unwrap(), 2);
        let slot = B::array_get(&mut cx, arr, 1).unwrap();
        assert_eq!(B::kind(&mut cx, slot).unwrap(), Kind::Undefined);
        let v = B::to_guest(&mut cx, &Value::Null).unwrap();
        assert!(matches!(
            B::array_set(&mut cx, arr, 2, v),
            Err(BridgeError::IndexOutOfRange { index: 2, len: 2 })
        ));
        let not_array = B::to_guest(&mut cx, &Value::from("x")).unwrap();
        assert!(matches!(
            B::array_len(&mut cx, not_array),
            Err(BridgeError::WrongKind { .. })
        ));
    }

    #[test]
    fn test_round_trip_handle_encoding() {
        assert_round_trip::<HandleTable>();
    }

    #[test]
    fn test_round_trip_reference_encoding() {
        assert_round_trip::<ReferenceBridge>();
    }

    #[test]
    fn test_containers_alias_in_both_encodings() {
        assert_container_aliasing::<HandleTable>();
        assert_container_aliasing::<ReferenceBridge>();
    }

    #[test]
    fn test_cycles_hit_depth_limit() {
        assert_cycle_is_bounded::<HandleTable>();
        assert_cycle_is_bounded::<ReferenceBridge>();
    }

    #[test]
    fn test_array_bounds_in_both_encodings() {
        assert_array_bounds::<HandleTable>();
        assert_array_bounds::<ReferenceBridge>();
    }
}
