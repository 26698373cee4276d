/*
 * Copyright (c) 2026 Mohamad Al-Zawahreh (dba Sovereign Systems).
 *
 * Sable Host Runtime.
 *
 * Executes compiled guest modules under wasmtime: the dynamic value model
 * and its two guest encodings, the intrinsic library, a relational store,
 * and an HTTP serving lifecycle that reenters the guest per request.
 *
 * LICENSE: DUAL-LICENSED (AGPLv3 or COMMERCIAL).
 */

pub mod bridge;
pub mod config;
pub mod gc;
pub mod host;
pub mod intrinsics;
pub mod json;
pub mod logging;
pub mod router;
pub mod runner;
pub mod schema;
pub mod server;
pub mod store;
pub mod value;

#[cfg(test)]
mod test_guest;

pub use bridge::{Encoding, HandleTable, ReferenceBridge, ValueBridge};
pub use config::RuntimeConfig;
pub use runner::{run_module, run_sandboxed, RunError, SandboxResult};
pub use value::{Kind, Object, Value};
