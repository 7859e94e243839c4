// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Tables and indirect calls: dispatch, signature checks, null entries,
//! and the get/set law.

use lamina::{Imports, Instance, Module, Options, TrapKind, Value};
use wasm_encoder::{
    CodeSection, ConstExpr, ElementSection, Elements, ExportKind, ExportSection, Function,
    FunctionSection, Instruction, Module as WasmModule, RefType, TableSection, TableType,
    TypeSection, ValType,
};

// Three-entry funcref table, entries 0/1 filled with constants-returning
// functions, entry 2 left null. A third function has a mismatched
// signature reachable through "pick_wrong".
fn table_module() -> Vec<u8> {
    let mut module = WasmModule::new();

    let mut types = TypeSection::new();
    types.ty().function([], [ValType::I32]); // 0: () -> i32
    types.ty().function([ValType::I32], [ValType::I32]); // 1: dispatchers
    types
        .ty()
        .function([ValType::I32], [ValType::FUNCREF]); // 2: table.get
    types
        .ty()
        .function([ValType::I32, ValType::FUNCREF], []); // 3: table.set
    module.section(&types);

    let mut functions = FunctionSection::new();
    functions.function(0); // ten
    functions.function(0); // twenty
    functions.function(1); // pick
    functions.function(1); // pick_wrong (dispatches with type 1)
    functions.function(2); // tget
    functions.function(3); // tset
    module.section(&functions);

    let mut tables = TableSection::new();
    tables.table(TableType {
        element_type: RefType::FUNCREF,
        minimum: 3,
        maximum: Some(4),
        table64: false,
        shared: false,
    });
    module.section(&tables);

    let mut exports = ExportSection::new();
    exports.export("pick", ExportKind::Func, 2);
    exports.export("pick_wrong", ExportKind::Func, 3);
    exports.export("tget", ExportKind::Func, 4);
    exports.export("tset", ExportKind::Func, 5);
    module.section(&exports);

    let mut elements = ElementSection::new();
    elements.active(
        None,
        &ConstExpr::i32_const(0),
        Elements::Functions(std::borrow::Cow::Borrowed(&[0, 1])),
    );
    module.section(&elements);

    let mut code = CodeSection::new();

    let mut ten = Function::new(vec![]);
    ten.instruction(&Instruction::I32Const(10));
    ten.instruction(&Instruction::End);
    code.function(&ten);

    let mut twenty = Function::new(vec![]);
    twenty.instruction(&Instruction::I32Const(20));
    twenty.instruction(&Instruction::End);
    code.function(&twenty);

    // pick(i) = call_indirect (type 0) table[i]
    let mut pick = Function::new(vec![]);
    pick.instruction(&Instruction::LocalGet(0));
    pick.raw([0x11, 0x00, 0x00]); // call_indirect type 0, table 0
    pick.instruction(&Instruction::End);
    code.function(&pick);

    // pick_wrong(i) dispatches with type 1 (i32 -> i32), pushing its own
    // argument: the signature check must reject entries of type 0.
    let mut pick_wrong = Function::new(vec![]);
    pick_wrong.instruction(&Instruction::LocalGet(0));
    pick_wrong.instruction(&Instruction::LocalGet(0));
    pick_wrong.raw([0x11, 0x01, 0x00]);
    pick_wrong.instruction(&Instruction::End);
    code.function(&pick_wrong);

    let mut tget = Function::new(vec![]);
    tget.instruction(&Instruction::LocalGet(0));
    tget.raw([0x25, 0x00]); // table.get 0
    tget.instruction(&Instruction::End);
    code.function(&tget);

    let mut tset = Function::new(vec![]);
    tset.instruction(&Instruction::LocalGet(0));
    tset.instruction(&Instruction::LocalGet(1));
    tset.raw([0x26, 0x00]); // table.set 0
    tset.instruction(&Instruction::End);
    code.function(&tset);

    module.section(&code);
    module.finish()
}

fn instantiate() -> Instance {
    let module = Module::decode(&table_module()).unwrap();
    Instance::instantiate(&module, Imports::new(), Options::default()).unwrap()
}

fn call(instance: &mut Instance, name: &str, args: &[Value]) -> Result<Vec<Value>, lamina::Trap> {
    let mut results = Vec::new();
    instance.invoke(name, args, &mut results)?;
    Ok(results)
}

#[test]
fn indirect_calls_dispatch_through_the_table() {
    let mut instance = instantiate();
    assert_eq!(
        call(&mut instance, "pick", &[Value::I32(0)]).unwrap(),
        vec![Value::I32(10)]
    );
    assert_eq!(
        call(&mut instance, "pick", &[Value::I32(1)]).unwrap(),
        vec![Value::I32(20)]
    );
}

#[test]
fn null_entry_is_undefined_element() {
    let mut instance = instantiate();
    let trap = call(&mut instance, "pick", &[Value::I32(2)]).unwrap_err();
    assert_eq!(trap.kind, TrapKind::UndefinedElement);

    // Out of bounds entirely.
    let trap = call(&mut instance, "pick", &[Value::I32(40)]).unwrap_err();
    assert_eq!(trap.kind, TrapKind::UndefinedElement);
}

#[test]
fn signature_mismatch_traps() {
    let mut instance = instantiate();
    let trap = call(&mut instance, "pick_wrong", &[Value::I32(0)]).unwrap_err();
    assert_eq!(trap.kind, TrapKind::MismatchedSignatures);
}

#[test]
fn table_set_then_get_round_trips() {
    let mut instance = instantiate();
    // Swap entry 2 (null) for function 1; dispatch sees it.
    call(
        &mut instance,
        "tset",
        &[Value::I32(2), Value::FuncRef(Some(1))],
    )
    .unwrap();
    assert_eq!(
        call(&mut instance, "tget", &[Value::I32(2)]).unwrap(),
        vec![Value::FuncRef(Some(1))]
    );
    assert_eq!(
        call(&mut instance, "pick", &[Value::I32(2)]).unwrap(),
        vec![Value::I32(20)]
    );

    // And back to null.
    call(&mut instance, "tset", &[Value::I32(2), Value::FuncRef(None)]).unwrap();
    assert_eq!(
        call(&mut instance, "tget", &[Value::I32(2)]).unwrap(),
        vec![Value::FuncRef(None)]
    );
}
