// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Host-function and import plumbing: marshalling, host errors as traps,
//! memory views, global imports, and link errors.

use lamina::{
    Extern, HostContext, Imports, Instance, LinkError, Module, Options, TrapKind, Value,
};
use wasm_encoder::{
    CodeSection, EntityType, ExportKind, ExportSection, Function, FunctionSection, GlobalType,
    ImportSection, Instruction, MemorySection, MemoryType, Module as WasmModule, TypeSection,
    ValType,
};

// Imports env.add1 : i32 -> i32 and env.poke : () -> (), plus an imported
// immutable global env.base : i32; exports wrappers over them.
fn host_module() -> Vec<u8> {
    let mut module = WasmModule::new();

    let mut types = TypeSection::new();
    types.ty().function([ValType::I32], [ValType::I32]); // add1
    types.ty().function([], []); // poke
    module.section(&types);

    let mut imports = ImportSection::new();
    imports.import("env", "add1", EntityType::Function(0));
    imports.import("env", "poke", EntityType::Function(1));
    imports.import(
        "env",
        "base",
        EntityType::Global(GlobalType {
            val_type: ValType::I32,
            mutable: false,
            shared: false,
        }),
    );
    module.section(&imports);

    let mut functions = FunctionSection::new();
    functions.function(0); // bump = add1(x) + base
    functions.function(1); // poke_mem
    module.section(&functions);

    let mut memories = MemorySection::new();
    memories.memory(MemoryType {
        minimum: 1,
        maximum: Some(1),
        memory64: false,
        shared: false,
        page_size_log2: None,
    });
    module.section(&memories);

    let mut exports = ExportSection::new();
    exports.export("bump", ExportKind::Func, 2);
    exports.export("poke_mem", ExportKind::Func, 3);
    module.section(&exports);

    let mut code = CodeSection::new();

    let mut bump = Function::new(vec![]);
    bump.instruction(&Instruction::LocalGet(0));
    bump.instruction(&Instruction::Call(0));
    bump.instruction(&Instruction::GlobalGet(0));
    bump.instruction(&Instruction::I32Add);
    bump.instruction(&Instruction::End);
    code.function(&bump);

    let mut poke_mem = Function::new(vec![]);
    poke_mem.instruction(&Instruction::Call(1));
    poke_mem.instruction(&Instruction::End);
    code.function(&poke_mem);

    module.section(&code);
    module.finish()
}

fn imports_with(add1_fails: bool) -> Imports {
    let mut imports = Imports::new();
    imports.define_func("env", "add1", move |ctx: &mut HostContext<'_>| {
        if add1_fails {
            return Err("refused".to_string());
        }
        let Value::I32(v) = ctx.args[0] else {
            return Err("bad argument".to_string());
        };
        ctx.results.push(Value::I32(v + 1));
        Ok(())
    });
    imports.define_func("env", "poke", |ctx: &mut HostContext<'_>| {
        let memory = ctx.memory.as_mut().expect("instance has a memory");
        memory.write(32, b"poked").map_err(|e| e.to_string())
    });
    imports.define("env", "base", Extern::Global(Value::I32(100)));
    imports
}

#[test]
fn host_functions_marshal_arguments_and_results() {
    let module = Module::decode(&host_module()).unwrap();
    let mut instance =
        Instance::instantiate(&module, imports_with(false), Options::default()).unwrap();

    let mut results = Vec::new();
    instance
        .invoke("bump", &[Value::I32(7)], &mut results)
        .unwrap();
    // add1(7) + base(100)
    assert_eq!(results, vec![Value::I32(108)]);
}

#[test]
fn host_errors_surface_as_traps() {
    let module = Module::decode(&host_module()).unwrap();
    let mut instance =
        Instance::instantiate(&module, imports_with(true), Options::default()).unwrap();

    let mut results = Vec::new();
    let trap = instance
        .invoke("bump", &[Value::I32(7)], &mut results)
        .unwrap_err();
    assert!(matches!(trap.kind, TrapKind::HostError(ref msg) if msg.contains("refused")));
}

#[test]
fn host_functions_see_linear_memory() {
    let module = Module::decode(&host_module()).unwrap();
    let mut instance =
        Instance::instantiate(&module, imports_with(false), Options::default()).unwrap();

    let mut results = Vec::new();
    instance.invoke("poke_mem", &[], &mut results).unwrap();
    assert_eq!(instance.memory_read(0, 32, 5).unwrap(), b"poked");
}

#[test]
fn missing_import_is_a_link_error() {
    let module = Module::decode(&host_module()).unwrap();
    let error = Instance::instantiate(&module, Imports::new(), Options::default()).unwrap_err();
    assert!(matches!(error, LinkError::MissingImport { .. }));
}

#[test]
fn import_kind_mismatch_is_a_link_error() {
    let module = Module::decode(&host_module()).unwrap();
    let mut imports = imports_with(false);
    imports.define("env", "add1", Extern::Global(Value::I32(0)));
    let error = Instance::instantiate(&module, imports, Options::default()).unwrap_err();
    assert!(matches!(error, LinkError::ImportKindMismatch { .. }));
}

#[test]
fn global_import_type_is_checked() {
    let module = Module::decode(&host_module()).unwrap();
    let mut imports = imports_with(false);
    imports.define("env", "base", Extern::Global(Value::I64(5)));
    let error = Instance::instantiate(&module, imports, Options::default()).unwrap_err();
    assert!(matches!(error, LinkError::ImportTypeMismatch { .. }));
}
