/*
 * Copyright (c) 2026 Mohamad Al-Zawahreh (dba Sovereign Systems).
 *
 * Host Imports for Compiled Guest Modules.
 *
 * Registers every `env` import a compiled module may declare, plus the two
 * WASI preview1 functions guests use for raw output and exit. All imports
 * are generic over the value bridge, so the same table links handle- and
 * reference-encoded modules.
 *
 * A host function that returns `Err` traps the guest; its message names
 * the import. Catchable failures are returned as error values instead.
 *
 * LICENSE: DUAL-LICENSED (AGPLv3 or COMMERCIAL).
 */

use crate::bridge::ValueBridge;
use crate::config::RuntimeConfig;
use crate::gc::{self, GcPolicy, GcThresholds, GcTrigger};
use crate::intrinsics;
use crate::server::{self, HttpRegistry};
use crate::store::{Database, StoreError};
use crate::value::Value;
use std::fmt;
use std::io::Write;
use thiserror::Error;
use tracing::info;
use wasmtime::{AsContextMut, Caller, Extern, Linker, Memory};

const ENV: &str = "env";
const WASI: &str = "wasi_snapshot_preview1";

pub const STDOUT_FD: i32 = 1;
pub const LOG_FD: i32 = 2;
pub const HTML_FD: i32 = 3;

const ERRNO_SUCCESS: i32 = 0;
const ERRNO_BADF: i32 = 8;
const ERRNO_FAULT: i32 = 21;
const ERRNO_IO: i32 = 29;

/// Raised by `proc_exit`; the runner turns it into an exit code.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("guest exited with code {code}")]
pub struct GuestExit {
    pub code: i32,
}

// =============================================================================
// Output Channels
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Buffer stdout for the caller (sandbox, tests).
    Capture,
    /// Pass stdout through to the process.
    Inherit,
}

/// fd 1 stdout, fd 2 the log, fd 3 the HTML capture.
#[derive(Debug)]
pub struct Output {
    mode: OutputMode,
    stdout: Vec<u8>,
    html: Vec<u8>,
    log_pending: Vec<u8>,
}

impl Output {
    pub fn new(mode: OutputMode) -> Self {
        Output {
            mode,
            stdout: Vec::new(),
            html: Vec::new(),
            log_pending: Vec::new(),
        }
    }

    /// Errors are WASI errno values.
    pub fn write(&mut self, fd: i32, bytes: &[u8]) -> Result<(), i32> {
        match fd {
            STDOUT_FD => match self.mode {
                OutputMode::Capture => {
                    self.stdout.extend_from_slice(bytes);
                    Ok(())
                }
                OutputMode::Inherit => {
                    let mut out = std::io::stdout().lock();
                    out.write_all(bytes)
                        .and_then(|_| out.flush())
                        .map_err(|_| ERRNO_IO)
                }
            },
            LOG_FD => {
                self.forward_log(bytes);
                Ok(())
            }
            HTML_FD => {
                self.html.extend_from_slice(bytes);
                Ok(())
            }
            _ => Err(ERRNO_BADF),
        }
    }

    // One log event per complete line.
    fn forward_log(&mut self, bytes: &[u8]) {
        self.log_pending.extend_from_slice(bytes);
        while let Some(pos) = self.log_pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.log_pending.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..pos]);
            info!(target: "sable::guest", "{}", text.trim_end_matches('\r'));
        }
    }

    /// Emits a trailing partial log line, if any.
    pub fn flush_log(&mut self) {
        if !self.log_pending.is_empty() {
            let text = String::from_utf8_lossy(&self.log_pending).into_owned();
            info!(target: "sable::guest", "{}", text);
            self.log_pending.clear();
        }
    }

    pub fn stdout(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn html(&self) -> String {
        String::from_utf8_lossy(&self.html).into_owned()
    }
}

// =============================================================================
// Host State
// =============================================================================

#[derive(Debug, Clone)]
pub struct HostOptions {
    pub output: OutputMode,
    pub args: Vec<String>,
    pub gc: GcThresholds,
}

impl HostOptions {
    pub fn capture() -> Self {
        HostOptions {
            output: OutputMode::Capture,
            args: Vec::new(),
            gc: GcThresholds::default(),
        }
    }

    pub fn inherit() -> Self {
        HostOptions {
            output: OutputMode::Inherit,
            ..Self::capture()
        }
    }

    pub fn from_config(config: &RuntimeConfig, output: OutputMode) -> Self {
        HostOptions {
            output,
            args: config.args.clone(),
            gc: config.gc_thresholds(),
        }
    }
}

/// Per-execution state owned by the wasmtime store.
pub struct HostState<B: ValueBridge> {
    pub bridge: B,
    pub output: Output,
    pub db: Database,
    pub http: HttpRegistry,
    pub args: Vec<String>,
    pub gc: GcPolicy,
    pub exit_code: Option<i32>,
}

impl<B: ValueBridge> HostState<B> {
    pub fn new(options: HostOptions) -> Self {
        HostState {
            bridge: B::new(),
            output: Output::new(options.output),
            db: Database::new(),
            http: HttpRegistry::new(),
            args: options.args,
            gc: GcPolicy::new(options.gc),
            exit_code: None,
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn trap(op: &str, e: impl fmt::Display) -> wasmtime::Error {
    wasmtime::Error::msg(format!("{}: {}", op, e))
}

// Intrinsic errors already carry the op name.
fn fatal(e: intrinsics::IntrinsicError) -> wasmtime::Error {
    wasmtime::Error::msg(e.to_string())
}

fn host<B: ValueBridge>(
    caller: &mut Caller<'_, HostState<B>>,
    op: &'static str,
    guest: B::Guest,
) -> wasmtime::Result<Value> {
    B::to_host(&mut caller.as_context_mut(), guest).map_err(|e| trap(op, e))
}

fn guest<B: ValueBridge>(
    caller: &mut Caller<'_, HostState<B>>,
    op: &'static str,
    value: &Value,
) -> wasmtime::Result<B::Guest> {
    B::to_guest(&mut caller.as_context_mut(), value).map_err(|e| trap(op, e))
}

fn text<B: ValueBridge>(
    caller: &mut Caller<'_, HostState<B>>,
    op: &'static str,
    g: B::Guest,
) -> wasmtime::Result<String> {
    let v = host(caller, op, g)?;
    intrinsics::expect_str(op, &v).map(str::to_string).map_err(fatal)
}

fn memory<B: ValueBridge>(caller: &mut Caller<'_, HostState<B>>, op: &str) -> wasmtime::Result<Memory> {
    match caller.get_export("memory") {
        Some(Extern::Memory(mem)) => Ok(mem),
        _ => Err(trap(op, "guest exports no memory")),
    }
}

fn read_bytes<B: ValueBridge>(
    caller: &mut Caller<'_, HostState<B>>,
    op: &str,
    ptr: i32,
    len: i32,
) -> wasmtime::Result<Vec<u8>> {
    let mem = memory(caller, op)?;
    let (start, len) = (ptr as u32 as usize, len as u32 as usize);
    if start.saturating_add(len) > mem.data_size(&*caller) {
        return Err(trap(op, format!("range {}+{} outside guest memory", start, len)));
    }
    let mut buf = vec![0u8; len];
    mem.read(&*caller, start, &mut buf).map_err(|e| trap(op, e))?;
    Ok(buf)
}

fn read_text<B: ValueBridge>(
    caller: &mut Caller<'_, HostState<B>>,
    op: &str,
    ptr: i32,
    len: i32,
) -> wasmtime::Result<String> {
    let bytes = read_bytes(caller, op, ptr, len)?;
    String::from_utf8(bytes).map_err(|_| trap(op, "invalid UTF-8"))
}

fn count(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

// =============================================================================
// Linking
// =============================================================================

/// Registers the full import surface on `linker`.
pub fn link_host_imports<B: ValueBridge>(linker: &mut Linker<HostState<B>>) -> wasmtime::Result<()> {
    link_values(linker)?;
    link_strings(linker)?;
    link_arrays(linker)?;
    link_objects(linker)?;
    link_json(linker)?;
    link_sql(linker)?;
    link_http(linker)?;
    link_environment(linker)?;
    link_wasi(linker)?;
    Ok(())
}

fn link_values<B: ValueBridge>(linker: &mut Linker<HostState<B>>) -> wasmtime::Result<()> {
    linker.func_wrap(
        ENV,
        "val_undefined",
        |mut caller: Caller<'_, HostState<B>>| -> wasmtime::Result<B::Guest> {
            B::undefined(&mut caller.as_context_mut()).map_err(|e| trap("val_undefined", e))
        },
    )?;
    linker.func_wrap(
        ENV,
        "val_null",
        |mut caller: Caller<'_, HostState<B>>| -> wasmtime::Result<B::Guest> {
            guest(&mut caller, "val_null", &Value::Null)
        },
    )?;
    linker.func_wrap(
        ENV,
        "val_from_i64",
        |mut caller: Caller<'_, HostState<B>>, n: i64| -> wasmtime::Result<B::Guest> {
            guest(&mut caller, "val_from_i64", &Value::Integer(n))
        },
    )?;
    linker.func_wrap(
        ENV,
        "val_from_f64",
        |mut caller: Caller<'_, HostState<B>>, x: f64| -> wasmtime::Result<B::Guest> {
            guest(&mut caller, "val_from_f64", &Value::Float(x))
        },
    )?;
    linker.func_wrap(
        ENV,
        "val_from_bool",
        |mut caller: Caller<'_, HostState<B>>, b: i32| -> wasmtime::Result<B::Guest> {
            guest(&mut caller, "val_from_bool", &Value::Boolean(b != 0))
        },
    )?;
    linker.func_wrap(
        ENV,
        "val_to_i64",
        |mut caller: Caller<'_, HostState<B>>, v: B::Guest| -> wasmtime::Result<i64> {
            let v = host(&mut caller, "val_to_i64", v)?;
            intrinsics::to_i64("val_to_i64", &v).map_err(fatal)
        },
    )?;
    linker.func_wrap(
        ENV,
        "val_to_f64",
        |mut caller: Caller<'_, HostState<B>>, v: B::Guest| -> wasmtime::Result<f64> {
            let v = host(&mut caller, "val_to_f64", v)?;
            intrinsics::to_f64("val_to_f64", &v).map_err(fatal)
        },
    )?;
    linker.func_wrap(
        ENV,
        "val_to_bool",
        |mut caller: Caller<'_, HostState<B>>, v: B::Guest| -> wasmtime::Result<i32> {
            let v = host(&mut caller, "val_to_bool", v)?;
            intrinsics::to_bool("val_to_bool", &v)
                .map(i32::from)
                .map_err(fatal)
        },
    )?;
    linker.func_wrap(
        ENV,
        "val_kind",
        |mut caller: Caller<'_, HostState<B>>, v: B::Guest| -> wasmtime::Result<i32> {
            B::kind(&mut caller.as_context_mut(), v)
                .map(|k| k.code())
                .map_err(|e| trap("val_kind", e))
        },
    )?;
    linker.func_wrap(
        ENV,
        "val_eq",
        |mut caller: Caller<'_, HostState<B>>, a: B::Guest, b: B::Guest| -> wasmtime::Result<i32> {
            let a = host(&mut caller, "val_eq", a)?;
            let b = host(&mut caller, "val_eq", b)?;
            Ok(i32::from(intrinsics::val_eq(&a, &b)))
        },
    )?;
    linker.func_wrap(
        ENV,
        "val_to_string",
        |mut caller: Caller<'_, HostState<B>>, v: B::Guest| -> wasmtime::Result<B::Guest> {
            let v = host(&mut caller, "val_to_string", v)?;
            guest(&mut caller, "val_to_string", &intrinsics::val_to_string(&v))
        },
    )?;
    linker.func_wrap(
        ENV,
        "val_is_error",
        |mut caller: Caller<'_, HostState<B>>, v: B::Guest| -> wasmtime::Result<i32> {
            let v = host(&mut caller, "val_is_error", v)?;
            Ok(i32::from(v.is_error()))
        },
    )?;
    Ok(())
}

fn link_strings<B: ValueBridge>(linker: &mut Linker<HostState<B>>) -> wasmtime::Result<()> {
    linker.func_wrap(
        ENV,
        "str_from_utf8",
        |mut caller: Caller<'_, HostState<B>>, ptr: i32, len: i32| -> wasmtime::Result<B::Guest> {
            let s = read_text(&mut caller, "str_from_utf8", ptr, len)?;
            guest(&mut caller, "str_from_utf8", &Value::String(s))
        },
    )?;
    linker.func_wrap(
        ENV,
        "intern_string",
        |mut caller: Caller<'_, HostState<B>>, ptr: i32, len: i32| -> wasmtime::Result<B::Guest> {
            let s = read_text(&mut caller, "intern_string", ptr, len)?;
            B::intern(&mut caller.as_context_mut(), (ptr as u32, len as u32), &s)
                .map_err(|e| trap("intern_string", e))
        },
    )?;
    linker.func_wrap(
        ENV,
        "str_concat",
        |mut caller: Caller<'_, HostState<B>>, a: B::Guest, b: B::Guest| -> wasmtime::Result<B::Guest> {
            let a = host(&mut caller, "str_concat", a)?;
            let b = host(&mut caller, "str_concat", b)?;
            guest(&mut caller, "str_concat", &intrinsics::str_concat(&a, &b))
        },
    )?;
    linker.func_wrap(
        ENV,
        "str_eq",
        |mut caller: Caller<'_, HostState<B>>, a: B::Guest, b: B::Guest| -> wasmtime::Result<i32> {
            let a = host(&mut caller, "str_eq", a)?;
            let b = host(&mut caller, "str_eq", b)?;
            intrinsics::str_eq(&a, &b).map(i32::from).map_err(fatal)
        },
    )?;
    linker.func_wrap(
        ENV,
        "str_len",
        |mut caller: Caller<'_, HostState<B>>, s: B::Guest| -> wasmtime::Result<i32> {
            let s = host(&mut caller, "str_len", s)?;
            intrinsics::str_len(&s)
                .map(|n| i32::try_from(n).unwrap_or(i32::MAX))
                .map_err(fatal)
        },
    )?;
    linker.func_wrap(
        ENV,
        "str_write",
        |mut caller: Caller<'_, HostState<B>>, s: B::Guest, ptr: i32, cap: i32| -> wasmtime::Result<i32> {
            let s = text(&mut caller, "str_write", s)?;
            let bytes = intrinsics::utf8_prefix(&s, cap.max(0) as usize);
            let mem = memory(&mut caller, "str_write")?;
            mem.write(&mut caller, ptr as u32 as usize, bytes)
                .map_err(|e| trap("str_write", e))?;
            Ok(count(bytes.len()))
        },
    )?;
    Ok(())
}

fn link_arrays<B: ValueBridge>(linker: &mut Linker<HostState<B>>) -> wasmtime::Result<()> {
    linker.func_wrap(
        ENV,
        "arr_new",
        |mut caller: Caller<'_, HostState<B>>, len: i32| -> wasmtime::Result<B::Guest> {
            let len = intrinsics::array_len("arr_new", i64::from(len)).map_err(fatal)?;
            B::new_array(&mut caller.as_context_mut(), len).map_err(|e| trap("arr_new", e))
        },
    )?;
    linker.func_wrap(
        ENV,
        "arr_get",
        |mut caller: Caller<'_, HostState<B>>, arr: B::Guest, index: i32| -> wasmtime::Result<B::Guest> {
            let mut cx = caller.as_context_mut();
            let len = B::array_len(&mut cx, arr).map_err(|e| trap("arr_get", e))?;
            match intrinsics::array_slot(len, i64::from(index)) {
                Some(i) => B::array_get(&mut cx, arr, i),
                None => B::undefined(&mut cx),
            }
            .map_err(|e| trap("arr_get", e))
        },
    )?;
    linker.func_wrap(
        ENV,
        "arr_set",
        |mut caller: Caller<'_, HostState<B>>, arr: B::Guest, index: i32, item: B::Guest| -> wasmtime::Result<()> {
            let mut cx = caller.as_context_mut();
            let len = B::array_len(&mut cx, arr).map_err(|e| trap("arr_set", e))?;
            let slot = intrinsics::array_slot_mut("arr_set", len, i64::from(index)).map_err(fatal)?;
            B::array_set(&mut cx, arr, slot, item).map_err(|e| trap("arr_set", e))
        },
    )?;
    linker.func_wrap(
        ENV,
        "arr_len",
        |mut caller: Caller<'_, HostState<B>>, arr: B::Guest| -> wasmtime::Result<i32> {
            B::array_len(&mut caller.as_context_mut(), arr)
                .map(count)
                .map_err(|e| trap("arr_len", e))
        },
    )?;
    linker.func_wrap(
        ENV,
        "arr_join",
        |mut caller: Caller<'_, HostState<B>>, arr: B::Guest, sep: B::Guest| -> wasmtime::Result<B::Guest> {
            let arr = host(&mut caller, "arr_join", arr)?;
            let sep = host(&mut caller, "arr_join", sep)?;
            let joined = intrinsics::arr_join(&arr, &sep).map_err(fatal)?;
            guest(&mut caller, "arr_join", &joined)
        },
    )?;
    linker.func_wrap(
        ENV,
        "arr_range",
        |mut caller: Caller<'_, HostState<B>>, start: i64, end: i64| -> wasmtime::Result<B::Guest> {
            let range = intrinsics::arr_range(start, end).map_err(fatal)?;
            guest(&mut caller, "arr_range", &range)
        },
    )?;
    Ok(())
}

fn link_objects<B: ValueBridge>(linker: &mut Linker<HostState<B>>) -> wasmtime::Result<()> {
    linker.func_wrap(
        ENV,
        "obj_new",
        |mut caller: Caller<'_, HostState<B>>| -> wasmtime::Result<B::Guest> {
            B::new_object(&mut caller.as_context_mut()).map_err(|e| trap("obj_new", e))
        },
    )?;
    linker.func_wrap(
        ENV,
        "obj_get",
        |mut caller: Caller<'_, HostState<B>>, obj: B::Guest, key: B::Guest| -> wasmtime::Result<B::Guest> {
            let key = text(&mut caller, "obj_get", key)?;
            object_field(&mut caller, "obj_get", obj, &key)
        },
    )?;
    linker.func_wrap(
        ENV,
        "obj_set",
        |mut caller: Caller<'_, HostState<B>>, obj: B::Guest, key: B::Guest, item: B::Guest| -> wasmtime::Result<()> {
            let key = text(&mut caller, "obj_set", key)?;
            B::object_set(&mut caller.as_context_mut(), obj, key, item).map_err(|e| trap("obj_set", e))
        },
    )?;
    linker.func_wrap(
        ENV,
        "obj_keys",
        |mut caller: Caller<'_, HostState<B>>, obj: B::Guest| -> wasmtime::Result<B::Guest> {
            let keys = B::object_keys(&mut caller.as_context_mut(), obj).map_err(|e| trap("obj_keys", e))?;
            guest(&mut caller, "obj_keys", &intrinsics::keys_value(keys))
        },
    )?;
    linker.func_wrap(
        ENV,
        "obj_has",
        |mut caller: Caller<'_, HostState<B>>, obj: B::Guest, key: B::Guest| -> wasmtime::Result<i32> {
            let key = text(&mut caller, "obj_has", key)?;
            B::object_get(&mut caller.as_context_mut(), obj, &key)
                .map(|found| i32::from(found.is_some()))
                .map_err(|e| trap("obj_has", e))
        },
    )?;
    Ok(())
}

/// Member of a guest object, or Undefined when absent.
fn object_field<B: ValueBridge>(
    caller: &mut Caller<'_, HostState<B>>,
    op: &'static str,
    obj: B::Guest,
    key: &str,
) -> wasmtime::Result<B::Guest> {
    let mut cx = caller.as_context_mut();
    match B::object_get(&mut cx, obj, key).map_err(|e| trap(op, e))? {
        Some(item) => Ok(item),
        None => B::undefined(&mut cx).map_err(|e| trap(op, e)),
    }
}

fn link_json<B: ValueBridge>(linker: &mut Linker<HostState<B>>) -> wasmtime::Result<()> {
    linker.func_wrap(
        ENV,
        "json_stringify",
        |mut caller: Caller<'_, HostState<B>>, v: B::Guest| -> wasmtime::Result<B::Guest> {
            let v = host(&mut caller, "json_stringify", v)?;
            let s = intrinsics::json_stringify(&v).map_err(fatal)?;
            guest(&mut caller, "json_stringify", &s)
        },
    )?;
    linker.func_wrap(
        ENV,
        "json_parse",
        |mut caller: Caller<'_, HostState<B>>, s: B::Guest| -> wasmtime::Result<B::Guest> {
            let s = host(&mut caller, "json_parse", s)?;
            let parsed = intrinsics::json_parse(&s).map_err(fatal)?;
            guest(&mut caller, "json_parse", &parsed)
        },
    )?;
    linker.func_wrap(
        ENV,
        "json_decode",
        |mut caller: Caller<'_, HostState<B>>, s: B::Guest, schema: B::Guest| -> wasmtime::Result<B::Guest> {
            let s = host(&mut caller, "json_decode", s)?;
            let schema = host(&mut caller, "json_decode", schema)?;
            let decoded = intrinsics::json_decode(&s, &schema).map_err(fatal)?;
            guest(&mut caller, "json_decode", &decoded)
        },
    )?;
    Ok(())
}

// =============================================================================
// Store
// =============================================================================

type SqlOp = fn(&Database, &str, &Value) -> Result<Value, StoreError>;

fn link_sql<B: ValueBridge>(linker: &mut Linker<HostState<B>>) -> wasmtime::Result<()> {
    linker.func_wrap(
        ENV,
        "db_open",
        |mut caller: Caller<'_, HostState<B>>, path: B::Guest| -> wasmtime::Result<B::Guest> {
            let path = text(&mut caller, "db_open", path)?;
            let result = match caller.data_mut().db.open(&path) {
                Ok(()) => Value::Null,
                Err(e) if e.is_fatal() => return Err(trap("db_open", e)),
                Err(e) => Value::error(e.to_string(), None),
            };
            guest(&mut caller, "db_open", &result)
        },
    )?;
    linker.func_wrap(
        ENV,
        "register_tables",
        |mut caller: Caller<'_, HostState<B>>, batch: B::Guest| -> wasmtime::Result<B::Guest> {
            let batch = text(&mut caller, "register_tables", batch)?;
            let result = match caller.data_mut().db.register_tables(&batch) {
                Ok(()) => Value::Null,
                Err(e @ StoreError::Batch(_)) => return Err(trap("register_tables", e)),
                Err(e) if e.is_fatal() => return Err(trap("register_tables", e)),
                Err(e) => Value::error(e.to_string(), None),
            };
            guest(&mut caller, "register_tables", &result)
        },
    )?;
    link_sql_call(linker, "sql_exec", Database::exec)?;
    link_sql_call(linker, "sql_query", Database::query)?;
    link_sql_call(linker, "sql_fetch_one", Database::fetch_one)?;
    link_sql_call(linker, "sql_fetch_optional", Database::fetch_optional)?;
    link_sql_call(linker, "sql_execute", Database::execute)?;
    Ok(())
}

/// SQL failures come back to the guest as error values.
fn link_sql_call<B: ValueBridge>(
    linker: &mut Linker<HostState<B>>,
    name: &'static str,
    op: SqlOp,
) -> wasmtime::Result<()> {
    linker.func_wrap(
        ENV,
        name,
        move |mut caller: Caller<'_, HostState<B>>, sql: B::Guest, params: B::Guest| -> wasmtime::Result<B::Guest> {
            let sql = text(&mut caller, name, sql)?;
            let params = host(&mut caller, name, params)?;
            let result = op(&caller.data().db, &sql, &params)
                .unwrap_or_else(|e| Value::error(e.to_string(), None));
            guest(&mut caller, name, &result)
        },
    )?;
    Ok(())
}

// =============================================================================
// HTTP
// =============================================================================

fn link_http<B: ValueBridge>(linker: &mut Linker<HostState<B>>) -> wasmtime::Result<()> {
    linker.func_wrap(
        ENV,
        "http_create_server",
        |mut caller: Caller<'_, HostState<B>>| -> i32 { caller.data_mut().http.create_server() },
    )?;
    linker.func_wrap(
        ENV,
        "http_add_route",
        |mut caller: Caller<'_, HostState<B>>,
         server: i32,
         method: B::Guest,
         pattern: B::Guest,
         handler: B::Guest|
         -> wasmtime::Result<()> {
            let method = text(&mut caller, "http_add_route", method)?;
            let pattern = text(&mut caller, "http_add_route", pattern)?;
            let handler = text(&mut caller, "http_add_route", handler)?;
            caller
                .data_mut()
                .http
                .add_route(server, &method, &pattern, &handler)
                .map_err(|e| trap("http_add_route", e))
        },
    )?;
    linker.func_wrap(
        ENV,
        "http_listen",
        |mut caller: Caller<'_, HostState<B>>, server: i32, address: B::Guest| -> wasmtime::Result<()> {
            let address = text(&mut caller, "http_listen", address)?;
            caller
                .data_mut()
                .http
                .listen(server, &address)
                .map_err(|e| trap("http_listen", e))
        },
    )?;

    link_response(linker, "http_response_text", server::TEXT)?;
    link_response(linker, "http_response_html", server::HTML)?;
    linker.func_wrap(
        ENV,
        "http_response_json",
        |mut caller: Caller<'_, HostState<B>>, v: B::Guest| -> wasmtime::Result<B::Guest> {
            let v = host(&mut caller, "http_response_json", v)?;
            let body = crate::json::stringify(&v).map_err(|e| trap("http_response_json", e))?;
            guest(&mut caller, "http_response_json", &server::response_value(body, server::JSON))
        },
    )?;
    linker.func_wrap(
        ENV,
        "http_response_redirect",
        |mut caller: Caller<'_, HostState<B>>, url: B::Guest| -> wasmtime::Result<B::Guest> {
            let url = host(&mut caller, "http_response_redirect", url)?;
            guest(
                &mut caller,
                "http_response_redirect",
                &server::redirect_value(url.to_display_string()),
            )
        },
    )?;

    link_response_str(linker, "http_response_text_str", server::TEXT)?;
    link_response_str(linker, "http_response_html_str", server::HTML)?;
    linker.func_wrap(
        ENV,
        "http_response_redirect_str",
        |mut caller: Caller<'_, HostState<B>>, ptr: i32, len: i32| -> wasmtime::Result<B::Guest> {
            let url = read_text(&mut caller, "http_response_redirect_str", ptr, len)?;
            guest(&mut caller, "http_response_redirect_str", &server::redirect_value(url))
        },
    )?;

    for (name, field) in [
        ("http_get_path", "path"),
        ("http_get_method", "method"),
        ("http_get_query", "query"),
        ("http_get_form", "form"),
    ] {
        linker.func_wrap(
            ENV,
            name,
            move |mut caller: Caller<'_, HostState<B>>, req: B::Guest| -> wasmtime::Result<B::Guest> {
                object_field(&mut caller, name, req, field)
            },
        )?;
    }
    Ok(())
}

fn link_response<B: ValueBridge>(
    linker: &mut Linker<HostState<B>>,
    name: &'static str,
    content_type: &'static str,
) -> wasmtime::Result<()> {
    linker.func_wrap(
        ENV,
        name,
        move |mut caller: Caller<'_, HostState<B>>, body: B::Guest| -> wasmtime::Result<B::Guest> {
            let body = host(&mut caller, name, body)?;
            guest(
                &mut caller,
                name,
                &server::response_value(body.to_display_string(), content_type),
            )
        },
    )?;
    Ok(())
}

fn link_response_str<B: ValueBridge>(
    linker: &mut Linker<HostState<B>>,
    name: &'static str,
    content_type: &'static str,
) -> wasmtime::Result<()> {
    linker.func_wrap(
        ENV,
        name,
        move |mut caller: Caller<'_, HostState<B>>, ptr: i32, len: i32| -> wasmtime::Result<B::Guest> {
            let body = read_text(&mut caller, name, ptr, len)?;
            guest(&mut caller, name, &server::response_value(body, content_type))
        },
    )?;
    Ok(())
}

// =============================================================================
// Environment & Output
// =============================================================================

fn link_environment<B: ValueBridge>(linker: &mut Linker<HostState<B>>) -> wasmtime::Result<()> {
    linker.func_wrap(
        ENV,
        "write_value",
        |mut caller: Caller<'_, HostState<B>>, fd: i32, v: B::Guest| -> wasmtime::Result<()> {
            let v = host(&mut caller, "write_value", v)?;
            let mut line = v.to_display_string();
            line.push('\n');
            caller
                .data_mut()
                .output
                .write(fd, line.as_bytes())
                .map_err(|errno| trap("write_value", format!("fd {} rejected with errno {}", fd, errno)))
        },
    )?;
    linker.func_wrap(
        ENV,
        "get_args",
        |mut caller: Caller<'_, HostState<B>>| -> wasmtime::Result<B::Guest> {
            let args: Vec<Value> = caller.data().args.iter().map(|a| Value::from(a.as_str())).collect();
            guest(&mut caller, "get_args", &Value::Array(args))
        },
    )?;
    linker.func_wrap(
        ENV,
        "get_env",
        |mut caller: Caller<'_, HostState<B>>, name: B::Guest| -> wasmtime::Result<B::Guest> {
            let name = text(&mut caller, "get_env", name)?;
            let v = std::env::var(&name).map(Value::String).unwrap_or(Value::Null);
            guest(&mut caller, "get_env", &v)
        },
    )?;
    linker.func_wrap(ENV, "gc", |mut caller: Caller<'_, HostState<B>>| {
        gc::collect(&mut caller, GcTrigger::Explicit);
    })?;
    Ok(())
}

/// fd_write(fd, iovs, iovs_len, nwritten) -> errno. Each iovec is a
/// little-endian (buf_ptr: u32, buf_len: u32) pair.
fn link_wasi<B: ValueBridge>(linker: &mut Linker<HostState<B>>) -> wasmtime::Result<()> {
    linker.func_wrap(
        WASI,
        "fd_write",
        |mut caller: Caller<'_, HostState<B>>, fd: i32, iovs: i32, iovs_len: i32, nwritten: i32| -> i32 {
            let mem = match caller.get_export("memory") {
                Some(Extern::Memory(mem)) => mem,
                _ => return ERRNO_BADF,
            };
            let size = mem.data_size(&caller);
            let mut bytes = Vec::new();
            for i in 0..iovs_len.max(0) as usize {
                let mut iov = [0u8; 8];
                let at = iovs as u32 as usize + i * 8;
                if mem.read(&caller, at, &mut iov).is_err() {
                    return ERRNO_FAULT;
                }
                let ptr = u32::from_le_bytes([iov[0], iov[1], iov[2], iov[3]]) as usize;
                let len = u32::from_le_bytes([iov[4], iov[5], iov[6], iov[7]]) as usize;
                if ptr.saturating_add(len) > size {
                    return ERRNO_FAULT;
                }
                let start = bytes.len();
                bytes.resize(start + len, 0);
                if mem.read(&caller, ptr, &mut bytes[start..]).is_err() {
                    return ERRNO_FAULT;
                }
            }
            if let Err(errno) = caller.data_mut().output.write(fd, &bytes) {
                return errno;
            }
            let written = (bytes.len() as u32).to_le_bytes();
            if mem.write(&mut caller, nwritten as u32 as usize, &written).is_err() {
                return ERRNO_FAULT;
            }
            ERRNO_SUCCESS
        },
    )?;
    linker.func_wrap(
        WASI,
        "proc_exit",
        |mut caller: Caller<'_, HostState<B>>, code: i32| -> wasmtime::Result<()> {
            caller.data_mut().exit_code = Some(code);
            Err(wasmtime::Error::new(GuestExit { code }))
        },
    )?;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
