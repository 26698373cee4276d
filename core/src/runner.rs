/*
 * Copyright (c) 2026 Mohamad Al-Zawahreh (dba Sovereign Systems).
 *
 * Wasmtime Execution of Compiled Guest Modules.
 *
 * Loads a module, links the host imports for the module's value encoding,
 * runs the entry point, and then either exits or hands the instance to the
 * HTTP serving layer if the guest asked to listen.
 *
 * LICENSE: DUAL-LICENSED (AGPLv3 or COMMERCIAL).
 */

use crate::bridge::{Encoding, HandleTable, ReferenceBridge, ValueBridge};
use crate::config::RuntimeConfig;
use crate::gc::{self, GcTrigger};
use crate::host::{link_host_imports, GuestExit, HostOptions, HostState, Output, OutputMode};
use crate::logging;
use crate::server::{Dispatcher, GuestSession, Server};
use crate::value::Value;
use serde::Serialize;
use std::fmt;
use tracing::{debug, info, warn};
use wasmtime::{
    AsContextMut, Config, Engine, ExternType, Instance, Linker, Module, RootScope, Store, ValType,
};

// =============================================================================
// Error Types
// =============================================================================

#[derive(Debug, Clone)]
pub struct RunError {
    pub message: String,
    pub context: String,
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}] {}", self.context, self.message)
    }
}

impl std::error::Error for RunError {}

impl RunError {
    fn new(context: &str, message: impl fmt::Display) -> Self {
        RunError {
            message: message.to_string(),
            context: context.to_string(),
        }
    }
}

fn stage(context: &'static str) -> impl Fn(wasmtime::Error) -> RunError {
    move |e| RunError::new(context, format!("{:#}", e))
}

// =============================================================================
// Engine & Module
// =============================================================================

/// Engine with the reference-type and GC proposals the reference encoding
/// needs. Handle-encoded modules run on it unchanged.
pub fn engine() -> Result<Engine, RunError> {
    let mut config = Config::new();
    config.wasm_reference_types(true);
    config.wasm_function_references(true);
    config.wasm_gc(true);
    Engine::new(&config).map_err(stage("engine"))
}

/// A module carrying an `externref` anywhere in its `env` imports was
/// generated for the reference encoding.
pub fn detect_encoding(module: &Module) -> Encoding {
    let uses_refs = module
        .imports()
        .filter(|import| import.module() == "env")
        .filter_map(|import| match import.ty() {
            ExternType::Func(f) => Some(f),
            _ => None,
        })
        .any(|f| {
            f.params()
                .chain(f.results())
                .any(|t| matches!(t, ValType::Ref(_)))
        });
    if uses_refs {
        Encoding::Reference
    } else {
        Encoding::Handle
    }
}

pub fn load(engine: &Engine, bytes: &[u8]) -> Result<Module, RunError> {
    Module::from_binary(engine, bytes).map_err(stage("run_module::load"))
}

// =============================================================================
// Execution
// =============================================================================

/// One instantiated guest and the store that owns its host state.
pub struct Execution<B: ValueBridge> {
    store: Store<HostState<B>>,
    instance: Instance,
}

impl<B: ValueBridge> Execution<B> {
    pub fn instantiate(engine: &Engine, module: &Module, options: HostOptions) -> Result<Self, RunError> {
        let mut linker = Linker::<HostState<B>>::new(engine);
        link_host_imports(&mut linker).map_err(stage("run_module::link"))?;
        let mut store = Store::new(engine, HostState::new(options));
        let instance = linker
            .instantiate(&mut store, module)
            .map_err(stage("run_module::instantiate"))?;
        debug!(encoding = %B::ENCODING, "instantiated guest");
        Ok(Execution { store, instance })
    }

    /// Opens a store before the entry point runs.
    pub fn open_database(&mut self, identifier: &str) -> Result<(), RunError> {
        self.store
            .data_mut()
            .db
            .open(identifier)
            .map_err(|e| RunError::new("run_module::open_database", e))
    }

    /// Runs `_start` (or `main`) and returns the exit code. `proc_exit` is
    /// an exit, not an error.
    pub fn run_entry(&mut self) -> Result<i32, RunError> {
        let entry = ["_start", "main"]
            .iter()
            .find_map(|name| {
                self.instance
                    .get_typed_func::<(), ()>(&mut self.store, name)
                    .ok()
            })
            .ok_or_else(|| RunError::new("run_module::get_entry", "no `_start` or `main` export"))?;

        let outcome = entry.call(&mut self.store, ());
        self.store.data_mut().output.flush_log();
        gc::collect(&mut self.store, GcTrigger::EntryReturned);

        match outcome {
            Ok(()) => Ok(self.store.data().exit_code.unwrap_or(0)),
            Err(e) => match e.downcast_ref::<GuestExit>() {
                Some(exit) => Ok(exit.code),
                None => Err(RunError::new("run_module::call_entry", format!("{:#}", e))),
            },
        }
    }

    /// Calls an exported `(G) -> G` function with a host value.
    pub fn call(&mut self, name: &str, arg: &Value) -> Result<Value, RunError> {
        let func = self
            .instance
            .get_typed_func::<B::Guest, B::Guest>(&mut self.store, name)
            .map_err(stage("call::get_func"))?;
        let mut scope = RootScope::new(&mut self.store);
        let arg = B::to_guest(&mut scope.as_context_mut(), arg)
            .map_err(|e| RunError::new("call::argument", e))?;
        let out = func.call(&mut scope, arg).map_err(stage("call::invoke"))?;
        B::to_host(&mut scope.as_context_mut(), out).map_err(|e| RunError::new("call::result", e))
    }

    pub fn output(&self) -> &Output {
        &self.store.data().output
    }

    pub fn state(&self) -> &HostState<B> {
        self.store.data()
    }

    /// Consumes the pending-listen token, if the guest recorded one.
    pub fn into_server(mut self) -> Result<Server<B>, Self> {
        match self.store.data_mut().http.take_pending() {
            Some((pending, routes)) => {
                let session = GuestSession {
                    store: self.store,
                    instance: self.instance,
                };
                Ok(Server::new(Dispatcher::new(session, routes), pending.address))
            }
            None => Err(self),
        }
    }
}

// =============================================================================
// Public API
// =============================================================================

/// Production path: installs the log subscriber, runs the entry point with
/// inherited stdout and, if the guest listened, serves until the process
/// exits.
pub fn run_module(bytes: &[u8], config: &RuntimeConfig) -> Result<i32, RunError> {
    logging::init(config.logging_level());
    let engine = engine()?;
    let module = load(&engine, bytes)?;
    match detect_encoding(&module) {
        Encoding::Handle => run_with::<HandleTable>(&engine, &module, config),
        Encoding::Reference => run_with::<ReferenceBridge>(&engine, &module, config),
    }
}

fn run_with<B: ValueBridge>(engine: &Engine, module: &Module, config: &RuntimeConfig) -> Result<i32, RunError> {
    let options = HostOptions::from_config(config, OutputMode::Inherit);
    let mut exec = Execution::<B>::instantiate(engine, module, options)?;
    if let Some(db) = &config.database {
        exec.open_database(db)?;
    }
    let code = exec.run_entry()?;
    if code != 0 {
        return Ok(code);
    }
    match exec.into_server() {
        Ok(server) => {
            info!(address = server.address(), "starting listener");
            server
                .serve_forever()
                .map_err(|e| RunError::new("run_module::serve", e))?;
            Ok(0)
        }
        Err(_) => Ok(code),
    }
}

/// Outcome of a captured run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxResult {
    pub stdout: String,
    pub html: String,
    pub exit_code: i32,
    pub error: Option<String>,
}

impl SandboxResult {
    fn failed(error: RunError) -> Self {
        SandboxResult {
            stdout: String::new(),
            html: String::new(),
            exit_code: 1,
            error: Some(error.to_string()),
        }
    }
}

/// Runs with all output captured. Never fails: errors land in `error`
/// with exit code 1. A pending listen is ignored.
pub fn run_sandboxed(bytes: &[u8], args: Vec<String>) -> SandboxResult {
    let engine = match engine() {
        Ok(engine) => engine,
        Err(e) => return SandboxResult::failed(e),
    };
    let module = match load(&engine, bytes) {
        Ok(module) => module,
        Err(e) => return SandboxResult::failed(e),
    };
    let options = HostOptions {
        args,
        ..HostOptions::capture()
    };
    match detect_encoding(&module) {
        Encoding::Handle => sandbox::<HandleTable>(&engine, &module, options),
        Encoding::Reference => sandbox::<ReferenceBridge>(&engine, &module, options),
    }
}

fn sandbox<B: ValueBridge>(engine: &Engine, module: &Module, options: HostOptions) -> SandboxResult {
    let mut exec = match Execution::<B>::instantiate(engine, module, options) {
        Ok(exec) => exec,
        Err(e) => return SandboxResult::failed(e),
    };
    let outcome = exec.run_entry();
    if exec.state().http.pending().is_some() {
        warn!("sandboxed guest requested a listener; ignoring");
    }
    let output = exec.output();
    let (exit_code, error) = match outcome {
        Ok(code) => (code, None),
        Err(e) => (1, Some(e.to_string())),
    };
    SandboxResult {
        stdout: output.stdout(),
        html: output.html(),
        exit_code,
        error,
    }
}

// =============================================================================
// Tests
// =============================================================================
