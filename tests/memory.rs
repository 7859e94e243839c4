// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Linear-memory laws: store/load round-trips, grow semantics, bulk
//! operations, and the embedder's read/write windows.

use lamina::{Imports, Instance, Module, Options, TrapKind, Value};
use wasm_encoder::{
    CodeSection, DataCountSection, DataSection, ExportKind, ExportSection, Function,
    FunctionSection, Instruction, MemArg, MemorySection, MemoryType, Module as WasmModule,
    TypeSection, ValType,
};

fn memarg(offset: u64) -> MemArg {
    MemArg {
        offset,
        align: 0,
        memory_index: 0,
    }
}

// One page (max 3) plus store/load/size/grow/fill/copy/init exports and a
// passive data segment "hello".
fn memory_module() -> Vec<u8> {
    let mut module = WasmModule::new();

    let mut types = TypeSection::new();
    types
        .ty()
        .function([ValType::I32, ValType::I32], []); // store
    types.ty().function([ValType::I32], [ValType::I32]); // load, grow
    types.ty().function([], [ValType::I32]); // size
    types
        .ty()
        .function([ValType::I32, ValType::I32, ValType::I32], []); // fill/copy/init
    module.section(&types);

    let mut functions = FunctionSection::new();
    for ty in [0u32, 1, 1, 2, 3, 3, 3] {
        functions.function(ty);
    }
    module.section(&functions);

    let mut memories = MemorySection::new();
    memories.memory(MemoryType {
        minimum: 1,
        maximum: Some(3),
        memory64: false,
        shared: false,
        page_size_log2: None,
    });
    module.section(&memories);

    let mut exports = ExportSection::new();
    for (name, index) in [
        ("store", 0u32),
        ("load", 1),
        ("grow", 2),
        ("size", 3),
        ("fill", 4),
        ("copy", 5),
        ("init", 6),
    ] {
        exports.export(name, ExportKind::Func, index);
    }
    module.section(&exports);

    module.section(&DataCountSection { count: 1 });

    let mut code = CodeSection::new();

    let mut store = Function::new(vec![]);
    store.instruction(&Instruction::LocalGet(0));
    store.instruction(&Instruction::LocalGet(1));
    store.instruction(&Instruction::I32Store(memarg(0)));
    store.instruction(&Instruction::End);
    code.function(&store);

    let mut load = Function::new(vec![]);
    load.instruction(&Instruction::LocalGet(0));
    load.instruction(&Instruction::I32Load(memarg(0)));
    load.instruction(&Instruction::End);
    code.function(&load);

    let mut grow = Function::new(vec![]);
    grow.instruction(&Instruction::LocalGet(0));
    grow.instruction(&Instruction::MemoryGrow(0));
    grow.instruction(&Instruction::End);
    code.function(&grow);

    let mut size = Function::new(vec![]);
    size.instruction(&Instruction::MemorySize(0));
    size.instruction(&Instruction::End);
    code.function(&size);

    // (dst, value, len) -> memory.fill
    let mut fill = Function::new(vec![]);
    fill.instruction(&Instruction::LocalGet(0));
    fill.instruction(&Instruction::LocalGet(1));
    fill.instruction(&Instruction::LocalGet(2));
    fill.raw([0xfc, 0x0b, 0x00]);
    fill.instruction(&Instruction::End);
    code.function(&fill);

    // (dst, src, len) -> memory.copy
    let mut copy = Function::new(vec![]);
    copy.instruction(&Instruction::LocalGet(0));
    copy.instruction(&Instruction::LocalGet(1));
    copy.instruction(&Instruction::LocalGet(2));
    copy.raw([0xfc, 0x0a, 0x00, 0x00]);
    copy.instruction(&Instruction::End);
    code.function(&copy);

    // (dst, src, len) -> memory.init 0
    let mut init = Function::new(vec![]);
    init.instruction(&Instruction::LocalGet(0));
    init.instruction(&Instruction::LocalGet(1));
    init.instruction(&Instruction::LocalGet(2));
    init.raw([0xfc, 0x08, 0x00, 0x00]);
    init.instruction(&Instruction::End);
    code.function(&init);

    module.section(&code);

    let mut data = DataSection::new();
    data.passive(*b"hello");
    module.section(&data);

    module.finish()
}

fn instantiate() -> Instance {
    let module = Module::decode(&memory_module()).unwrap();
    Instance::instantiate(&module, Imports::new(), Options::default()).unwrap()
}

fn call(instance: &mut Instance, name: &str, args: &[Value]) -> Result<Vec<Value>, lamina::Trap> {
    let mut results = Vec::new();
    instance.invoke(name, args, &mut results)?;
    Ok(results)
}

#[test]
fn store_then_load_round_trips() {
    let mut instance = instantiate();
    call(
        &mut instance,
        "store",
        &[Value::I32(64), Value::I32(-559038737)],
    )
    .unwrap();
    assert_eq!(
        call(&mut instance, "load", &[Value::I32(64)]).unwrap(),
        vec![Value::I32(-559038737)]
    );
}

#[test]
fn grow_returns_prior_size_and_respects_max() {
    let mut instance = instantiate();
    assert_eq!(
        call(&mut instance, "size", &[]).unwrap(),
        vec![Value::I32(1)]
    );
    assert_eq!(
        call(&mut instance, "grow", &[Value::I32(1)]).unwrap(),
        vec![Value::I32(1)]
    );
    assert_eq!(
        call(&mut instance, "size", &[]).unwrap(),
        vec![Value::I32(2)]
    );
    // Over max: -1, size unchanged.
    assert_eq!(
        call(&mut instance, "grow", &[Value::I32(5)]).unwrap(),
        vec![Value::I32(-1)]
    );
    assert_eq!(
        call(&mut instance, "size", &[]).unwrap(),
        vec![Value::I32(2)]
    );

    // The grown page is addressable.
    call(
        &mut instance,
        "store",
        &[Value::I32(65536 + 16), Value::I32(7)],
    )
    .unwrap();
    assert_eq!(
        call(&mut instance, "load", &[Value::I32(65536 + 16)]).unwrap(),
        vec![Value::I32(7)]
    );
}

#[test]
fn fill_copy_and_init() {
    let mut instance = instantiate();
    call(
        &mut instance,
        "fill",
        &[Value::I32(0), Value::I32(0x5a), Value::I32(8)],
    )
    .unwrap();
    call(
        &mut instance,
        "copy",
        &[Value::I32(100), Value::I32(0), Value::I32(8)],
    )
    .unwrap();
    assert_eq!(
        instance.memory_read(0, 100, 8).unwrap(),
        vec![0x5a; 8]
    );

    call(
        &mut instance,
        "init",
        &[Value::I32(200), Value::I32(0), Value::I32(5)],
    )
    .unwrap();
    assert_eq!(instance.memory_read(0, 200, 5).unwrap(), b"hello");

    // Bounds are checked before any byte moves.
    let trap = call(
        &mut instance,
        "fill",
        &[Value::I32(65530), Value::I32(1), Value::I32(100)],
    )
    .unwrap_err();
    assert_eq!(trap.kind, TrapKind::OutOfBoundsMemoryAccess);
    assert_eq!(instance.memory_read(0, 65530, 1).unwrap(), vec![0]);
}

#[test]
fn embedder_windows_are_bounds_checked() {
    let mut instance = instantiate();
    instance.memory_write(0, 10, b"abc").unwrap();
    assert_eq!(instance.memory_read(0, 10, 3).unwrap(), b"abc");

    let trap = instance.memory_read(0, 65530, 100).unwrap_err();
    assert_eq!(trap.kind, TrapKind::OutOfBoundsMemoryAccess);
    let trap = instance.memory_write(0, 65535, &[1, 2]).unwrap_err();
    assert_eq!(trap.kind, TrapKind::OutOfBoundsMemoryAccess);
}

#[test]
fn u33_addressing_cannot_wrap() {
    let mut instance = instantiate();
    // addr + offset computed in 33 bits: u32::MAX + small offset must trap,
    // not wrap to a small address.
    let trap = call(&mut instance, "load", &[Value::I32(-1)]).unwrap_err();
    assert_eq!(trap.kind, TrapKind::OutOfBoundsMemoryAccess);
}
