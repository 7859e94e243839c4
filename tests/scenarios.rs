// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! End-to-end scenarios: recursion across tiers, out-of-bounds traps,
//! division traps, tail-call recursion, exceptions, and fuel.

use lamina::{Imports, Instance, Module, Options, TierConfig, TrapKind, Value};
use wasm_encoder::{
    BlockType, CodeSection, ExportKind, ExportSection, Function, FunctionSection, Instruction,
    MemArg, MemorySection, MemoryType, Module as WasmModule, TypeSection, ValType,
};

fn memarg(offset: u64) -> MemArg {
    MemArg {
        offset,
        align: 0,
        memory_index: 0,
    }
}

fn interpreter_options() -> Options {
    Options {
        tier: TierConfig {
            enable_jit: false,
            ..TierConfig::default()
        },
        ..Options::default()
    }
}

fn eager_jit_options() -> Options {
    Options {
        tier: TierConfig {
            call_threshold: 1,
            backedge_threshold: 10,
            enable_jit: true,
        },
        ..Options::default()
    }
}

// (func $fib (param i32) (result i32) — the classic recursive shape.
fn fib_module() -> Vec<u8> {
    let mut module = WasmModule::new();

    let mut types = TypeSection::new();
    types.ty().function([ValType::I32], [ValType::I32]);
    module.section(&types);

    let mut functions = FunctionSection::new();
    functions.function(0);
    module.section(&functions);

    let mut exports = ExportSection::new();
    exports.export("fib", ExportKind::Func, 0);
    module.section(&exports);

    let mut f = Function::new(vec![]);
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::I32Const(2));
    f.instruction(&Instruction::I32LtS);
    f.instruction(&Instruction::If(BlockType::Result(ValType::I32)));
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::Else);
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::I32Const(1));
    f.instruction(&Instruction::I32Sub);
    f.instruction(&Instruction::Call(0));
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::I32Const(2));
    f.instruction(&Instruction::I32Sub);
    f.instruction(&Instruction::Call(0));
    f.instruction(&Instruction::I32Add);
    f.instruction(&Instruction::End);
    f.instruction(&Instruction::End);

    let mut code = CodeSection::new();
    code.function(&f);
    module.section(&code);
    module.finish()
}

fn invoke_i32(instance: &mut Instance, name: &str, args: &[Value]) -> Result<i32, lamina::Trap> {
    let mut results = Vec::new();
    instance.invoke(name, args, &mut results)?;
    match results.as_slice() {
        [Value::I32(v)] => Ok(*v),
        other => panic!("unexpected results {other:?}"),
    }
}

#[test]
fn fib_in_the_interpreter() {
    let module = Module::decode(&fib_module()).unwrap();
    let mut instance = Instance::instantiate(&module, Imports::new(), interpreter_options()).unwrap();
    assert_eq!(invoke_i32(&mut instance, "fib", &[Value::I32(10)]).unwrap(), 55);
    assert_eq!(
        invoke_i32(&mut instance, "fib", &[Value::I32(24)]).unwrap(),
        46368
    );
}

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
#[test]
fn fib_native_matches_the_interpreter() {
    let module = Module::decode(&fib_module()).unwrap();

    let mut interp = Instance::instantiate(&module, Imports::new(), interpreter_options()).unwrap();
    let mut native = Instance::instantiate(&module, Imports::new(), eager_jit_options()).unwrap();

    for n in [0, 1, 2, 10, 20] {
        let expected = invoke_i32(&mut interp, "fib", &[Value::I32(n)]).unwrap();
        let actual = invoke_i32(&mut native, "fib", &[Value::I32(n)]).unwrap();
        assert_eq!(actual, expected, "fib({n})");
    }
    // Hot enough to be native by now; the headline value.
    assert_eq!(
        invoke_i32(&mut native, "fib", &[Value::I32(35)]).unwrap(),
        9_227_465
    );
}

fn oob_module() -> Vec<u8> {
    let mut module = WasmModule::new();

    let mut types = TypeSection::new();
    types.ty().function([ValType::I32], [ValType::I32]);
    module.section(&types);

    let mut functions = FunctionSection::new();
    functions.function(0);
    module.section(&functions);

    let mut memories = MemorySection::new();
    memories.memory(MemoryType {
        minimum: 1,
        maximum: Some(2),
        memory64: false,
        shared: false,
        page_size_log2: None,
    });
    module.section(&memories);

    let mut exports = ExportSection::new();
    exports.export("f", ExportKind::Func, 0);
    exports.export("mem", ExportKind::Memory, 0);
    module.section(&exports);

    let mut f = Function::new(vec![]);
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::I32Load(memarg(0)));
    f.instruction(&Instruction::End);

    let mut code = CodeSection::new();
    code.function(&f);
    module.section(&code);
    module.finish()
}

#[test]
fn oob_read_traps_with_position() {
    let module = Module::decode(&oob_module()).unwrap();
    let mut instance = Instance::instantiate(&module, Imports::new(), interpreter_options()).unwrap();

    // One 64 KiB page: the first byte past it faults.
    let trap = invoke_i32(&mut instance, "f", &[Value::I32(65536)]).unwrap_err();
    assert_eq!(trap.kind, TrapKind::OutOfBoundsMemoryAccess);
    assert_eq!(trap.func, Some(0));

    // In-bounds still works afterwards: the instance stays usable.
    assert_eq!(invoke_i32(&mut instance, "f", &[Value::I32(0)]).unwrap(), 0);
}

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
#[test]
fn oob_read_traps_under_native_code() {
    let module = Module::decode(&oob_module()).unwrap();
    let mut instance = Instance::instantiate(&module, Imports::new(), eager_jit_options()).unwrap();

    // Warm up in bounds, then fault.
    assert_eq!(invoke_i32(&mut instance, "f", &[Value::I32(0)]).unwrap(), 0);
    for _ in 0..4 {
        let trap = invoke_i32(&mut instance, "f", &[Value::I32(65536)]).unwrap_err();
        assert_eq!(trap.kind, TrapKind::OutOfBoundsMemoryAccess);
        // And the engine remains usable.
        assert_eq!(invoke_i32(&mut instance, "f", &[Value::I32(4)]).unwrap(), 0);
    }
}

fn div_module() -> Vec<u8> {
    let mut module = WasmModule::new();

    let mut types = TypeSection::new();
    types
        .ty()
        .function([ValType::I32, ValType::I32], [ValType::I32]);
    module.section(&types);

    let mut functions = FunctionSection::new();
    functions.function(0);
    module.section(&functions);

    let mut exports = ExportSection::new();
    exports.export("div", ExportKind::Func, 0);
    module.section(&exports);

    let mut f = Function::new(vec![]);
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::LocalGet(1));
    f.instruction(&Instruction::I32DivS);
    f.instruction(&Instruction::End);

    let mut code = CodeSection::new();
    code.function(&f);
    module.section(&code);
    module.finish()
}

#[test]
fn division_traps_by_kind() {
    let module = Module::decode(&div_module()).unwrap();
    for options in [interpreter_options(), eager_jit_options()] {
        let mut instance = Instance::instantiate(&module, Imports::new(), options).unwrap();

        assert_eq!(
            invoke_i32(&mut instance, "div", &[Value::I32(7), Value::I32(2)]).unwrap(),
            3
        );
        let trap = invoke_i32(&mut instance, "div", &[Value::I32(1), Value::I32(0)]).unwrap_err();
        assert_eq!(trap.kind, TrapKind::DivisionByZero);

        let trap = invoke_i32(
            &mut instance,
            "div",
            &[Value::I32(i32::MIN), Value::I32(-1)],
        )
        .unwrap_err();
        assert_eq!(trap.kind, TrapKind::IntegerOverflow);
    }
}

// sum_to via a tail-call loop: (n, acc) -> acc when n == 0, else
// return_call (n-1, acc+n).
fn sum_module() -> Vec<u8> {
    let mut module = WasmModule::new();

    let mut types = TypeSection::new();
    types
        .ty()
        .function([ValType::I64, ValType::I64], [ValType::I64]); // helper
    types.ty().function([ValType::I64], [ValType::I64]); // entry
    module.section(&types);

    let mut functions = FunctionSection::new();
    functions.function(0);
    functions.function(1);
    module.section(&functions);

    let mut exports = ExportSection::new();
    exports.export("sum_to", ExportKind::Func, 1);
    module.section(&exports);

    let mut helper = Function::new(vec![]);
    helper.instruction(&Instruction::LocalGet(0));
    helper.instruction(&Instruction::I64Eqz);
    helper.instruction(&Instruction::If(BlockType::Result(ValType::I64)));
    helper.instruction(&Instruction::LocalGet(1));
    helper.instruction(&Instruction::Else);
    helper.instruction(&Instruction::LocalGet(0));
    helper.instruction(&Instruction::I64Const(1));
    helper.instruction(&Instruction::I64Sub);
    helper.instruction(&Instruction::LocalGet(1));
    helper.instruction(&Instruction::LocalGet(0));
    helper.instruction(&Instruction::I64Add);
    helper.instruction(&Instruction::ReturnCall(0));
    helper.instruction(&Instruction::End);
    helper.instruction(&Instruction::End);

    let mut entry = Function::new(vec![]);
    entry.instruction(&Instruction::LocalGet(0));
    entry.instruction(&Instruction::I64Const(0));
    entry.instruction(&Instruction::ReturnCall(0));
    entry.instruction(&Instruction::End);

    let mut code = CodeSection::new();
    code.function(&helper);
    code.function(&entry);
    module.section(&code);
    module.finish()
}

#[test]
fn tail_call_loop_does_not_overflow() {
    let module = Module::decode(&sum_module()).unwrap();
    let mut instance = Instance::instantiate(&module, Imports::new(), interpreter_options()).unwrap();

    let mut results = Vec::new();
    instance
        .invoke("sum_to", &[Value::I64(1_000_000)], &mut results)
        .unwrap();
    assert_eq!(results, vec![Value::I64(500_000_500_000)]);
}

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
#[test]
fn tail_call_loop_native() {
    let module = Module::decode(&sum_module()).unwrap();
    let mut instance = Instance::instantiate(&module, Imports::new(), eager_jit_options()).unwrap();

    let mut results = Vec::new();
    instance
        .invoke("sum_to", &[Value::I64(1_000_000)], &mut results)
        .unwrap();
    assert_eq!(results, vec![Value::I64(500_000_500_000)]);
}

// Throws tag 0 (payload 42) inside try_table with a catch routing to a
// block whose result is the payload.
fn exception_module() -> Vec<u8> {
    let mut module = WasmModule::new();

    let mut types = TypeSection::new();
    types.ty().function([ValType::I32], []); // tag type
    types.ty().function([], [ValType::I32]); // catch42
    types.ty().function([], []); // thrower
    module.section(&types);

    let mut functions = FunctionSection::new();
    functions.function(1);
    functions.function(2);
    module.section(&functions);

    // Tag section (id 13) sits between Memory and Global.
    let mut tags = wasm_encoder::TagSection::new();
    tags.tag(wasm_encoder::TagType {
        kind: wasm_encoder::TagKind::Exception,
        func_type_idx: 0,
    });
    module.section(&tags);

    let mut exports = ExportSection::new();
    exports.export("catch42", ExportKind::Func, 0);
    exports.export("throw42", ExportKind::Func, 1);
    module.section(&exports);

    // catch42: block (result i32) / try_table (catch 0 -> label 0) /
    // i32.const 42 / throw 0 / end / i32.const 0 / end / end
    let mut catcher = Function::new(vec![]);
    catcher.instruction(&Instruction::Block(BlockType::Result(ValType::I32)));
    catcher.raw([0x1f, 0x40, 0x01, 0x00, 0x00, 0x00]); // try_table, 1 catch
    catcher.instruction(&Instruction::I32Const(42));
    catcher.raw([0x08, 0x00]); // throw tag 0
    catcher.instruction(&Instruction::End); // try_table
    catcher.instruction(&Instruction::I32Const(0));
    catcher.instruction(&Instruction::End); // block
    catcher.instruction(&Instruction::End);

    let mut thrower = Function::new(vec![]);
    thrower.instruction(&Instruction::I32Const(42));
    thrower.raw([0x08, 0x00]);
    thrower.instruction(&Instruction::End);

    let mut code = CodeSection::new();
    code.function(&catcher);
    code.function(&thrower);
    module.section(&code);
    module.finish()
}

#[test]
fn try_table_catches_matching_tag() {
    let module = Module::decode(&exception_module()).unwrap();
    let mut instance = Instance::instantiate(&module, Imports::new(), interpreter_options()).unwrap();

    assert_eq!(invoke_i32(&mut instance, "catch42", &[]).unwrap(), 42);
}

#[test]
fn uncaught_exception_reaches_the_embedder() {
    let module = Module::decode(&exception_module()).unwrap();
    let mut instance = Instance::instantiate(&module, Imports::new(), interpreter_options()).unwrap();

    let mut results = Vec::new();
    let trap = instance.invoke("throw42", &[], &mut results).unwrap_err();
    assert!(matches!(trap.kind, TrapKind::WasmException { .. }));
    assert_eq!(instance.exception_tag(&trap), Some(0));
    assert_eq!(instance.exception_payload(&trap), Some(vec![42]));
}

fn infinite_loop_module() -> Vec<u8> {
    let mut module = WasmModule::new();

    let mut types = TypeSection::new();
    types.ty().function([], []);
    module.section(&types);

    let mut functions = FunctionSection::new();
    functions.function(0);
    module.section(&functions);

    let mut exports = ExportSection::new();
    exports.export("spin", ExportKind::Func, 0);
    module.section(&exports);

    let mut f = Function::new(vec![]);
    f.instruction(&Instruction::Loop(BlockType::Empty));
    f.instruction(&Instruction::Br(0));
    f.instruction(&Instruction::End);
    f.instruction(&Instruction::End);

    let mut code = CodeSection::new();
    code.function(&f);
    module.section(&code);
    module.finish()
}

#[test]
fn fuel_bounds_an_infinite_loop() {
    let module = Module::decode(&infinite_loop_module()).unwrap();
    let mut options = interpreter_options();
    options.fuel = Some(10_000);
    let mut instance = Instance::instantiate(&module, Imports::new(), options).unwrap();

    let mut results = Vec::new();
    let trap = instance.invoke("spin", &[], &mut results).unwrap_err();
    assert_eq!(trap.kind, TrapKind::FuelExhausted);
    // Exactly 10 000 decrement events happened.
    assert_eq!(instance.fuel(), Some(0));

    // Refueling recovers the instance.
    instance.set_fuel(5);
    let trap = instance.invoke("spin", &[], &mut results).unwrap_err();
    assert_eq!(trap.kind, TrapKind::FuelExhausted);
}

// deep(n) recurses n times before bottoming out.
fn deep_module() -> Vec<u8> {
    let mut module = WasmModule::new();

    let mut types = TypeSection::new();
    types.ty().function([ValType::I32], [ValType::I32]);
    module.section(&types);

    let mut functions = FunctionSection::new();
    functions.function(0);
    module.section(&functions);

    let mut exports = ExportSection::new();
    exports.export("deep", ExportKind::Func, 0);
    module.section(&exports);

    let mut f = Function::new(vec![]);
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::I32Eqz);
    f.instruction(&Instruction::If(BlockType::Result(ValType::I32)));
    f.instruction(&Instruction::I32Const(0));
    f.instruction(&Instruction::Else);
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::I32Const(1));
    f.instruction(&Instruction::I32Sub);
    f.instruction(&Instruction::Call(0));
    f.instruction(&Instruction::End);
    f.instruction(&Instruction::End);

    let mut code = CodeSection::new();
    code.function(&f);
    module.section(&code);
    module.finish()
}

#[test]
fn call_depth_is_bounded() {
    let module = Module::decode(&deep_module()).unwrap();
    let mut instance = Instance::instantiate(&module, Imports::new(), interpreter_options()).unwrap();

    // Comfortably under both bounds (each interpreter frame also holds its
    // register file on the shared operand stack).
    assert_eq!(
        invoke_i32(&mut instance, "deep", &[Value::I32(700)]).unwrap(),
        0
    );
    // Far over the call-depth bound.
    let trap = invoke_i32(&mut instance, "deep", &[Value::I32(20_000)]).unwrap_err();
    assert_eq!(trap.kind, TrapKind::StackOverflow);
}

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
#[test]
fn call_depth_is_bounded_in_native_code() {
    let module = Module::decode(&deep_module()).unwrap();
    let mut instance = Instance::instantiate(&module, Imports::new(), eager_jit_options()).unwrap();

    assert_eq!(
        invoke_i32(&mut instance, "deep", &[Value::I32(1000)]).unwrap(),
        0
    );
    let trap = invoke_i32(&mut instance, "deep", &[Value::I32(2000)]).unwrap_err();
    assert_eq!(trap.kind, TrapKind::StackOverflow);
}

#[test]
fn interrupt_flag_stops_execution() {
    let module = Module::decode(&infinite_loop_module()).unwrap();
    let mut instance = Instance::instantiate(&module, Imports::new(), interpreter_options()).unwrap();

    instance
        .interrupt_handle()
        .store(true, std::sync::atomic::Ordering::Relaxed);
    let mut results = Vec::new();
    let trap = instance.invoke("spin", &[], &mut results).unwrap_err();
    assert_eq!(trap.kind, TrapKind::Interrupted);
}
