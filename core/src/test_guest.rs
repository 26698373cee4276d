/*
 * Copyright (c) 2026 Mohamad Al-Zawahreh (dba Sovereign Systems).
 *
 * Guest Module Builder (tests only).
 *
 * Assembles small guest modules against the `env` import surface with
 * wasm-encoder, in either value encoding, so execution tests never depend
 * on checked-in binaries.
 *
 * LICENSE: DUAL-LICENSED (AGPLv3 or COMMERCIAL).
 */

use crate::bridge::Encoding;
use wasm_encoder::{
    CodeSection, ConstExpr, DataSection, EntityType, ExportKind, ExportSection, Function,
    FunctionSection, ImportSection, Instruction, MemorySection, MemoryType, Module, RefType,
    TypeSection, ValType,
};

type Signature = (Vec<ValType>, Vec<ValType>);

/// Guest value type for an encoding.
pub fn value_type(encoding: Encoding) -> ValType {
    match encoding {
        Encoding::Handle => ValType::I32,
        Encoding::Reference => ValType::Ref(RefType::EXTERNREF),
    }
}

/// Signature of an `env` import with `g` as the value type.
fn env_signature(name: &str, g: ValType) -> Option<Signature> {
    use ValType::{F64, I32, I64};
    let sig = match name {
        "val_undefined" | "val_null" | "obj_new" | "get_args" => (vec![], vec![g]),
        "val_from_i64" => (vec![I64], vec![g]),
        "val_from_f64" => (vec![F64], vec![g]),
        "val_from_bool" | "arr_new" => (vec![I32], vec![g]),
        "val_to_i64" => (vec![g], vec![I64]),
        "val_to_f64" => (vec![g], vec![F64]),
        "val_to_bool" | "val_kind" | "val_is_error" | "str_len" | "arr_len" => (vec![g], vec![I32]),
        "val_eq" | "str_eq" | "obj_has" => (vec![g, g], vec![I32]),
        "val_to_string" | "obj_keys" | "json_stringify" | "json_parse" | "db_open"
        | "register_tables" | "get_env" | "http_response_text" | "http_response_html"
        | "http_response_json" | "http_response_redirect" | "http_get_path"
        | "http_get_method" | "http_get_query" | "http_get_form" => (vec![g], vec![g]),
        "str_from_utf8" | "intern_string" | "http_response_text_str"
        | "http_response_html_str" | "http_response_redirect_str" => (vec![I32, I32], vec![g]),
        "str_concat" | "arr_join" | "obj_get" | "json_decode" | "sql_exec" | "sql_query"
        | "sql_fetch_one" | "sql_fetch_optional" | "sql_execute" => (vec![g, g], vec![g]),
        "str_write" => (vec![g, I32, I32], vec![I32]),
        "arr_get" => (vec![g, I32], vec![g]),
        "arr_set" => (vec![g, I32, g], vec![]),
        "arr_range" => (vec![I64, I64], vec![g]),
        "obj_set" => (vec![g, g, g], vec![]),
        "http_create_server" => (vec![], vec![I32]),
        "http_add_route" => (vec![I32, g, g, g], vec![]),
        "http_listen" | "write_value" => (vec![I32, g], vec![]),
        "gc" => (vec![], vec![]),
        _ => return None,
    };
    Some(sig)
}

fn wasi_signature(name: &str) -> Option<Signature> {
    use ValType::I32;
    match name {
        "fd_write" => Some((vec![I32, I32, I32, I32], vec![I32])),
        "proc_exit" => Some((vec![I32], vec![])),
        _ => None,
    }
}

struct Defined {
    type_index: u32,
    locals: Vec<ValType>,
    body: Vec<Instruction<'static>>,
}

pub struct GuestBuilder {
    g: ValType,
    types: Vec<Signature>,
    imports: Vec<(&'static str, String, u32)>,
    functions: Vec<Defined>,
    exports: Vec<(String, u32)>,
    data: Vec<(u32, Vec<u8>)>,
    data_end: u32,
}

impl GuestBuilder {
    pub fn new(encoding: Encoding) -> Self {
        GuestBuilder {
            g: value_type(encoding),
            types: Vec::new(),
            imports: Vec::new(),
            functions: Vec::new(),
            exports: Vec::new(),
            data: Vec::new(),
            data_end: 16,
        }
    }

    pub fn g(&self) -> ValType {
        self.g
    }

    fn type_index(&mut self, sig: Signature) -> u32 {
        if let Some(i) = self.types.iter().position(|t| *t == sig) {
            return i as u32;
        }
        self.types.push(sig);
        (self.types.len() - 1) as u32
    }

    fn import(&mut self, module: &'static str, name: &str, sig: Signature) -> u32 {
        if let Some(i) = self
            .imports
            .iter()
            .position(|(m, n, _)| *m == module && n == name)
        {
            return i as u32;
        }
        assert!(self.functions.is_empty(), "declare imports before functions");
        let ty = self.type_index(sig);
        self.imports.push((module, name.to_string(), ty));
        (self.imports.len() - 1) as u32
    }

    /// Function index of an `env` import, declaring it on first use.
    pub fn env(&mut self, name: &str) -> u32 {
        let sig = env_signature(name, self.g).unwrap_or_else(|| panic!("unknown import {}", name));
        self.import("env", name, sig)
    }

    pub fn wasi(&mut self, name: &str) -> u32 {
        let sig = wasi_signature(name).unwrap_or_else(|| panic!("unknown wasi import {}", name));
        self.import("wasi_snapshot_preview1", name, sig)
    }

    /// Places bytes in linear memory; returns their offset.
    pub fn bytes(&mut self, bytes: &[u8]) -> i32 {
        let at = self.data_end;
        self.data.push((at, bytes.to_vec()));
        self.data_end += (bytes.len() as u32 + 7) & !7;
        at as i32
    }

    /// (ptr, len) of a string placed in linear memory.
    pub fn string(&mut self, text: &str) -> (i32, i32) {
        (self.bytes(text.as_bytes()), text.len() as i32)
    }

    /// Instructions that leave `text` on the stack as a guest value.
    pub fn str_value(&mut self, text: &str) -> Vec<Instruction<'static>> {
        let from_utf8 = self.env("str_from_utf8");
        let (ptr, len) = self.string(text);
        vec![
            Instruction::I32Const(ptr),
            Instruction::I32Const(len),
            Instruction::Call(from_utf8),
        ]
    }

    /// Adds and exports a function. `End` is appended.
    pub fn function(
        &mut self,
        export: &str,
        params: Vec<ValType>,
        results: Vec<ValType>,
        locals: Vec<ValType>,
        body: Vec<Instruction<'static>>,
    ) -> u32 {
        let type_index = self.type_index((params, results));
        self.functions.push(Defined {
            type_index,
            locals,
            body,
        });
        let index = (self.imports.len() + self.functions.len() - 1) as u32;
        self.exports.push((export.to_string(), index));
        index
    }

    /// `() -> ()` entry point.
    pub fn start(&mut self, body: Vec<Instruction<'static>>) -> u32 {
        self.function("_start", vec![], vec![], vec![], body)
    }

    /// `(G) -> G` route handler; the request is local 0.
    pub fn handler(&mut self, name: &str, body: Vec<Instruction<'static>>) -> u32 {
        let g = self.g;
        self.function(name, vec![g], vec![g], vec![], body)
    }

    pub fn finish(self) -> Vec<u8> {
        let mut types = TypeSection::new();
        for (params, results) in &self.types {
            types.ty().function(params.iter().copied(), results.iter().copied());
        }

        let mut imports = ImportSection::new();
        for (module, name, ty) in &self.imports {
            imports.import(module, name, EntityType::Function(*ty));
        }

        let mut functions = FunctionSection::new();
        for f in &self.functions {
            functions.function(f.type_index);
        }

        let mut memories = MemorySection::new();
        memories.memory(MemoryType {
            minimum: 1,
            maximum: None,
            memory64: false,
            shared: false,
            page_size_log2: None,
        });

        let mut exports = ExportSection::new();
        exports.export("memory", ExportKind::Memory, 0);
        for (name, index) in &self.exports {
            exports.export(name, ExportKind::Func, *index);
        }

        let mut code = CodeSection::new();
        for f in &self.functions {
            let mut func = Function::new(f.locals.iter().map(|t| (1, *t)));
            for instr in &f.body {
                func.instruction(instr);
            }
            func.instruction(&Instruction::End);
            code.function(&func);
        }

        let mut data = DataSection::new();
        for (offset, bytes) in &self.data {
            data.active(0, &ConstExpr::i32_const(*offset as i32), bytes.iter().copied());
        }

        let mut module = Module::new();
        module.section(&types);
        module.section(&imports);
        module.section(&functions);
        module.section(&memories);
        module.section(&exports);
        module.section(&code);
        module.section(&data);
        module.finish()
    }
}
