// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! The error layers: decode failures, validation failures, and
//! instantiation failures, each reported before the next layer runs.

use lamina::{Imports, Instance, Module, ModuleError, Options, Value};
use wasm_encoder::{
    CodeSection, ConstExpr, DataSection, ExportKind, ExportSection, Function, FunctionSection,
    GlobalSection, GlobalType, Instruction, MemorySection, MemoryType, Module as WasmModule,
    TypeSection, ValType,
};

fn empty_with_type() -> (WasmModule, ()) {
    let mut module = WasmModule::new();
    let mut types = TypeSection::new();
    types.ty().function([], [ValType::I32]);
    module.section(&types);
    (module, ())
}

#[test]
fn bad_magic_is_a_decode_error() {
    let error = Module::decode(&[0xde, 0xad, 0xbe, 0xef]).unwrap_err();
    assert!(matches!(error, ModuleError::Decode(_)));
}

#[test]
fn truncated_module_is_a_decode_error() {
    let good = {
        let (mut module, ()) = empty_with_type();
        let mut functions = FunctionSection::new();
        functions.function(0);
        module.section(&functions);
        let mut code = CodeSection::new();
        let mut f = Function::new(vec![]);
        f.instruction(&Instruction::I32Const(1));
        f.instruction(&Instruction::End);
        code.function(&f);
        module.section(&code);
        module.finish()
    };
    let error = Module::decode(&good[..good.len() - 3]).unwrap_err();
    assert!(matches!(error, ModuleError::Decode(_)));
}

#[test]
fn function_and_code_counts_must_agree() {
    let (mut module, ()) = empty_with_type();
    let mut functions = FunctionSection::new();
    functions.function(0);
    functions.function(0);
    module.section(&functions);
    let mut code = CodeSection::new();
    let mut f = Function::new(vec![]);
    f.instruction(&Instruction::I32Const(1));
    f.instruction(&Instruction::End);
    code.function(&f);
    module.section(&code);

    let error = Module::decode(&module.finish()).unwrap_err();
    assert!(matches!(error, ModuleError::Decode(_)));
}

#[test]
fn operand_type_mismatch_is_a_validation_error() {
    let (mut module, ()) = empty_with_type();
    let mut functions = FunctionSection::new();
    functions.function(0);
    module.section(&functions);
    let mut code = CodeSection::new();
    let mut f = Function::new(vec![]);
    // i64.const where an i32 result is declared.
    f.instruction(&Instruction::I64Const(1));
    f.instruction(&Instruction::End);
    code.function(&f);
    module.section(&code);

    let error = Module::decode(&module.finish()).unwrap_err();
    assert!(matches!(error, ModuleError::Validate(_)));
}

#[test]
fn branch_depth_is_validated() {
    let (mut module, ()) = empty_with_type();
    let mut functions = FunctionSection::new();
    functions.function(0);
    module.section(&functions);
    let mut code = CodeSection::new();
    let mut f = Function::new(vec![]);
    f.instruction(&Instruction::Br(9));
    f.instruction(&Instruction::End);
    code.function(&f);
    module.section(&code);

    let error = Module::decode(&module.finish()).unwrap_err();
    assert!(matches!(error, ModuleError::Validate(_)));
}

#[test]
fn duplicate_export_names_are_rejected() {
    let (mut module, ()) = empty_with_type();
    let mut functions = FunctionSection::new();
    functions.function(0);
    functions.function(0);
    module.section(&functions);
    let mut exports = ExportSection::new();
    exports.export("same", ExportKind::Func, 0);
    exports.export("same", ExportKind::Func, 1);
    module.section(&exports);
    let mut code = CodeSection::new();
    for _ in 0..2 {
        let mut f = Function::new(vec![]);
        f.instruction(&Instruction::I32Const(1));
        f.instruction(&Instruction::End);
        code.function(&f);
    }
    module.section(&code);

    let error = Module::decode(&module.finish()).unwrap_err();
    assert!(matches!(error, ModuleError::Validate(_)));
}

#[test]
fn writes_to_immutable_globals_are_rejected() {
    let mut module = WasmModule::new();
    let mut types = TypeSection::new();
    types.ty().function([], []);
    module.section(&types);
    let mut functions = FunctionSection::new();
    functions.function(0);
    module.section(&functions);
    let mut globals = GlobalSection::new();
    globals.global(
        GlobalType {
            val_type: ValType::I32,
            mutable: false,
            shared: false,
        },
        &ConstExpr::i32_const(3),
    );
    module.section(&globals);
    let mut code = CodeSection::new();
    let mut f = Function::new(vec![]);
    f.instruction(&Instruction::I32Const(1));
    f.instruction(&Instruction::GlobalSet(0));
    f.instruction(&Instruction::End);
    code.function(&f);
    module.section(&code);

    let error = Module::decode(&module.finish()).unwrap_err();
    assert!(matches!(error, ModuleError::Validate(_)));
}

#[test]
fn extended_constant_initializers_evaluate() {
    // global = 6 * 7, read back through an exported function.
    let mut module = WasmModule::new();
    let mut types = TypeSection::new();
    types.ty().function([], [ValType::I32]);
    module.section(&types);
    let mut functions = FunctionSection::new();
    functions.function(0);
    module.section(&functions);
    // One immutable i32 global initialized by the extended-constant
    // expression `i32.const 6; i32.const 7; i32.mul`.
    module.section(&wasm_encoder::RawSection {
        id: 6,
        data: &[0x01, 0x7f, 0x00, 0x41, 0x06, 0x41, 0x07, 0x6c, 0x0b],
    });
    let mut exports = ExportSection::new();
    exports.export("answer", ExportKind::Func, 0);
    module.section(&exports);
    let mut code = CodeSection::new();
    let mut f = Function::new(vec![]);
    f.instruction(&Instruction::GlobalGet(0));
    f.instruction(&Instruction::End);
    code.function(&f);
    module.section(&code);

    let module = Module::decode(&module.finish()).unwrap();
    let mut instance = Instance::instantiate(&module, Imports::new(), Options::default()).unwrap();
    let mut results = Vec::new();
    instance.invoke("answer", &[], &mut results).unwrap();
    assert_eq!(results, vec![Value::I32(42)]);
}

#[test]
fn active_data_segment_out_of_bounds_fails_instantiation() {
    let mut module = WasmModule::new();
    let mut memories = MemorySection::new();
    memories.memory(MemoryType {
        minimum: 1,
        maximum: Some(1),
        memory64: false,
        shared: false,
        page_size_log2: None,
    });
    module.section(&memories);
    let mut data = DataSection::new();
    data.active(0, &ConstExpr::i32_const(65530), *b"too far past the end");
    module.section(&data);

    let module = Module::decode(&module.finish()).unwrap();
    let error = Instance::instantiate(&module, Imports::new(), Options::default()).unwrap_err();
    assert!(matches!(error, lamina::LinkError::SegmentOutOfBounds));
}

#[test]
fn trap_leaves_the_instance_usable() {
    // A trapping function and a healthy one side by side.
    let mut module = WasmModule::new();
    let mut types = TypeSection::new();
    types.ty().function([], [ValType::I32]);
    module.section(&types);
    let mut functions = FunctionSection::new();
    functions.function(0);
    functions.function(0);
    module.section(&functions);
    let mut exports = ExportSection::new();
    exports.export("boom", ExportKind::Func, 0);
    exports.export("ok", ExportKind::Func, 1);
    module.section(&exports);
    let mut code = CodeSection::new();
    let mut boom = Function::new(vec![]);
    boom.instruction(&Instruction::Unreachable);
    boom.instruction(&Instruction::End);
    code.function(&boom);
    let mut ok = Function::new(vec![]);
    ok.instruction(&Instruction::I32Const(5));
    ok.instruction(&Instruction::End);
    code.function(&ok);
    module.section(&code);

    let module = Module::decode(&module.finish()).unwrap();
    let mut instance = Instance::instantiate(&module, Imports::new(), Options::default()).unwrap();
    let mut results = Vec::new();
    for _ in 0..3 {
        let trap = instance.invoke("boom", &[], &mut results).unwrap_err();
        assert_eq!(trap.kind, lamina::TrapKind::Unreachable);
        instance.invoke("ok", &[], &mut results).unwrap();
        assert_eq!(results, vec![Value::I32(5)]);
    }
}
