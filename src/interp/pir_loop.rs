// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! The PIR dispatch loop: the fall-back tier that executes everything.

use super::num;
use super::{Action, ExecState, HandlerEntry, burn_fuel, on_back_edge, push_slot};
use crate::pir::{AtomicRmwKind, PirFunction, PirOp, decode_heap_type};
use crate::runtime::{
    GcObject, Instance, LABEL_STACK_SLOTS, Store, TrapKind, refenc,
};
use crate::runtime::memory::LinearMemory;
use crate::types::{CompositeType, HeapType, ModuleInner, RmwOp, StorageType};

#[inline]
fn addr_value(memory: &LinearMemory, slot: u64) -> u64 {
    if memory.ty().memory64 {
        slot
    } else {
        u64::from(slot as u32)
    }
}

#[inline]
fn table_index(instance: &Instance, table: u32, slot: u64) -> u64 {
    if instance.store.tables[table as usize].ty.table64 {
        slot
    } else {
        u64::from(slot as u32)
    }
}

// Executes the current (topmost) frame until it transfers control.
pub(super) fn run_pir(
    instance: &mut Instance,
    exec: &mut ExecState,
    pir: &PirFunction,
) -> Result<Action, TrapKind> {
    let frame_index = exec.frames.len() - 1;
    let (func, base, operand_base) = {
        let frame = &exec.frames[frame_index];
        (frame.func, frame.base, frame.operand_base)
    };
    let module = instance.module.clone();
    let mut pc = exec.frames[frame_index].pc;

    macro_rules! pop {
        () => {
            exec.stack.pop().expect("validated operand stack")
        };
    }
    macro_rules! push {
        ($value:expr) => {
            push_slot(&mut exec.stack, $value)?
        };
    }
    macro_rules! binop32 {
        (|$a:ident, $b:ident| $body:expr) => {{
            let $b = pop!() as u32;
            let $a = pop!() as u32;
            let result: u32 = $body;
            push!(u64::from(result));
        }};
    }
    macro_rules! binop64 {
        (|$a:ident, $b:ident| $body:expr) => {{
            let $b = pop!();
            let $a = pop!();
            let result: u64 = $body;
            push!(result);
        }};
    }
    macro_rules! unop32 {
        (|$a:ident| $body:expr) => {{
            let $a = pop!() as u32;
            let result: u32 = $body;
            push!(u64::from(result));
        }};
    }
    macro_rules! unop64 {
        (|$a:ident| $body:expr) => {{
            let $a = pop!();
            let result: u64 = $body;
            push!(result);
        }};
    }
    macro_rules! cmp32 {
        (|$a:ident, $b:ident| $body:expr) => {{
            let $b = pop!() as u32;
            let $a = pop!() as u32;
            push!(u64::from($body));
        }};
    }
    macro_rules! cmp64 {
        (|$a:ident, $b:ident| $body:expr) => {{
            let $b = pop!();
            let $a = pop!();
            push!(u64::from($body));
        }};
    }
    macro_rules! binf32 {
        (|$a:ident, $b:ident| $body:expr) => {{
            let $b = f32::from_bits(pop!() as u32);
            let $a = f32::from_bits(pop!() as u32);
            let result: f32 = $body;
            push!(u64::from(result.to_bits()));
        }};
    }
    macro_rules! binf64 {
        (|$a:ident, $b:ident| $body:expr) => {{
            let $b = f64::from_bits(pop!());
            let $a = f64::from_bits(pop!());
            let result: f64 = $body;
            push!(result.to_bits());
        }};
    }
    macro_rules! unf32 {
        (|$a:ident| $body:expr) => {{
            let $a = f32::from_bits(pop!() as u32);
            let result: f32 = $body;
            push!(u64::from(result.to_bits()));
        }};
    }
    macro_rules! unf64 {
        (|$a:ident| $body:expr) => {{
            let $a = f64::from_bits(pop!());
            let result: f64 = $body;
            push!(result.to_bits());
        }};
    }
    macro_rules! cmpf32 {
        (|$a:ident, $b:ident| $body:expr) => {{
            let $b = f32::from_bits(pop!() as u32);
            let $a = f32::from_bits(pop!() as u32);
            push!(u64::from($body));
        }};
    }
    macro_rules! cmpf64 {
        (|$a:ident, $b:ident| $body:expr) => {{
            let $b = f64::from_bits(pop!());
            let $a = f64::from_bits(pop!());
            push!(u64::from($body));
        }};
    }
    macro_rules! load {
        ($inst:expr, $width:literal, $conv:expr) => {{
            let marg = pir.memargs[$inst.a as usize];
            let memory = &instance.store.memories[marg.memory as usize];
            let addr = addr_value(memory, pop!());
            let bytes = memory.load::<$width>(addr, marg.offset)?;
            let value: u64 = $conv(bytes);
            push!(value);
        }};
    }
    macro_rules! store_op {
        ($inst:expr, $width:literal, $conv:expr) => {{
            let marg = pir.memargs[$inst.a as usize];
            let value = pop!();
            let memory = &mut instance.store.memories[marg.memory as usize];
            let addr = addr_value(memory, pop!());
            let bytes: [u8; $width] = $conv(value);
            memory.store::<$width>(addr, marg.offset, bytes)?;
        }};
    }
    macro_rules! take_branch {
        ($at:expr, $target:expr, $copy:expr, $dest:expr) => {{
            let copy = $copy as usize;
            let dest = operand_base + $dest as usize;
            let src = exec.stack.len() - copy;
            if src != dest {
                exec.stack.copy_within(src.., dest);
            }
            exec.stack.truncate(dest + copy);
            let target = $target as usize;
            if target <= $at {
                on_back_edge(instance, func)?;
            }
            pc = target;
        }};
    }
    macro_rules! transfer {
        ($action:expr) => {{
            exec.frames[frame_index].pc = pc;
            return Ok($action);
        }};
    }

    loop {
        let at = pc;
        exec.frames[frame_index].pc = at;
        burn_fuel(instance)?;
        let inst = pir.insts[at];
        pc = at + 1;

        use PirOp as P;
        match inst.op {
            P::Nop => {}
            P::Unreachable => return Err(TrapKind::Unreachable),

            P::Br => take_branch!(at, inst.a, inst.b, inst.c),
            P::BrIf => {
                if pop!() as u32 != 0 {
                    take_branch!(at, inst.a, inst.b, inst.c);
                }
            }
            P::BrIfZero => {
                if pop!() as u32 == 0 {
                    take_branch!(at, inst.a, inst.b, inst.c);
                }
            }
            P::BrTable => {
                let index = pop!() as u32 as usize;
                let table = &pir.br_tables[inst.a as usize];
                let &(target, copy, dest) = table
                    .targets
                    .get(index.min(table.targets.len() - 1))
                    .expect("branch tables are non-empty");
                take_branch!(at, target, copy, dest);
            }

            P::Return => {
                transfer!(Action::Return {
                    result_start: exec.stack.len() - inst.a as usize,
                });
            }
            P::Call | P::ReturnCall => {
                let callee = inst.a;
                let arg_slots = callee_param_slots(instance, callee);
                transfer!(Action::Call {
                    callee,
                    tail: inst.op == P::ReturnCall,
                    arg_slots,
                });
            }
            P::CallIndirect | P::ReturnCallIndirect => {
                let index = table_index(instance, inst.b, pop!());
                let bits = instance.store.tables[inst.b as usize].get(index)?;
                if refenc::is_null(bits) {
                    return Err(TrapKind::UndefinedElement);
                }
                if refenc::tag(bits) != refenc::TAG_FUNC {
                    return Err(TrapKind::MismatchedSignatures);
                }
                let callee = refenc::payload(bits) as u32;
                let expected = module.type_fingerprints[inst.a as usize];
                if instance.store.functions[callee as usize].fingerprint != expected {
                    return Err(TrapKind::MismatchedSignatures);
                }
                let arg_slots = callee_param_slots(instance, callee);
                transfer!(Action::Call {
                    callee,
                    tail: inst.op == P::ReturnCallIndirect,
                    arg_slots,
                });
            }
            P::CallRef | P::ReturnCallRef => {
                // The reference sits on top, above the arguments.
                let bits = pop!();
                if refenc::is_null(bits) {
                    return Err(TrapKind::NullReference);
                }
                let callee = refenc::payload(bits) as u32;
                let arg_slots = callee_param_slots(instance, callee);
                transfer!(Action::Call {
                    callee,
                    tail: inst.op == P::ReturnCallRef,
                    arg_slots,
                });
            }

            P::Throw => {
                let tag = inst.a;
                let param_slots = instance.store.tags[tag as usize].param_slots as usize;
                let start = exec.stack.len() - param_slots;
                let payload = exec.stack[start..].to_vec();
                exec.stack.truncate(start);
                let index = instance.store.exceptions.len();
                instance
                    .store
                    .exceptions
                    .push(crate::runtime::ExnObject { tag, payload });
                transfer!(Action::Throw {
                    exn: refenc::exn(index),
                });
            }
            P::ThrowRef => {
                let bits = pop!();
                if refenc::is_null(bits) {
                    return Err(TrapKind::NullReference);
                }
                transfer!(Action::Throw { exn: bits });
            }
            P::TryPush => {
                let handler = &pir.handlers[inst.a as usize];
                let (start, end) = (handler.start, handler.end);
                // Re-entering a try over a branch leaves stale entries of
                // nested-or-equal scopes behind; retire them now so the
                // handler stack stays bounded by the nesting depth.
                while exec
                    .handlers
                    .last()
                    .is_some_and(|entry| entry.frame_index == frame_index && entry.start >= start)
                {
                    exec.handlers.pop();
                }
                if exec.handlers.len() >= LABEL_STACK_SLOTS {
                    return Err(TrapKind::StackOverflow);
                }
                exec.handlers.push(HandlerEntry {
                    frame_index,
                    handler: inst.a,
                    start,
                    end,
                });
            }
            P::TryPop => {
                if exec
                    .handlers
                    .last()
                    .is_some_and(|entry| entry.frame_index == frame_index)
                {
                    exec.handlers.pop();
                }
            }

            P::Drop => {
                let keep = exec.stack.len() - inst.a as usize;
                exec.stack.truncate(keep);
            }
            P::Select => {
                let cond = pop!() as u32;
                if inst.a == 1 {
                    let if_false = pop!();
                    let if_true = pop!();
                    push!(if cond != 0 { if_true } else { if_false });
                } else {
                    let false_hi = pop!();
                    let false_lo = pop!();
                    let true_hi = pop!();
                    let true_lo = pop!();
                    let (lo, hi) = if cond != 0 {
                        (true_lo, true_hi)
                    } else {
                        (false_lo, false_hi)
                    };
                    push!(lo);
                    push!(hi);
                }
            }

            P::LocalGet => {
                for i in 0..inst.b as usize {
                    let value = exec.stack[base + inst.a as usize + i];
                    push!(value);
                }
            }
            P::LocalSet => {
                for i in (0..inst.b as usize).rev() {
                    let value = pop!();
                    exec.stack[base + inst.a as usize + i] = value;
                }
            }
            P::LocalTee => {
                let top = exec.stack.len() - inst.b as usize;
                for i in 0..inst.b as usize {
                    exec.stack[base + inst.a as usize + i] = exec.stack[top + i];
                }
            }
            P::GlobalGet => {
                let value = instance.store.globals[inst.a as usize].value;
                push!(value[0]);
                if inst.b == 2 {
                    push!(value[1]);
                }
            }
            P::GlobalSet => {
                let hi = if inst.b == 2 { pop!() } else { 0 };
                let lo = pop!();
                instance.store.globals[inst.a as usize].value = [lo, hi];
            }

            P::TableGet => {
                let index = table_index(instance, inst.a, pop!());
                let bits = instance.store.tables[inst.a as usize].get(index)?;
                push!(bits);
            }
            P::TableSet => {
                let value = pop!();
                let index = table_index(instance, inst.a, pop!());
                instance.store.tables[inst.a as usize].set(index, value)?;
            }
            P::TableInit => {
                let len = u64::from(pop!() as u32);
                let src = u64::from(pop!() as u32);
                let dst = table_index(instance, inst.b, pop!());
                let elems = instance.store.elems[inst.a as usize].clone().unwrap_or_default();
                let src_end = src
                    .checked_add(len)
                    .ok_or(TrapKind::UndefinedElement)?;
                if src_end > elems.len() as u64 {
                    return Err(TrapKind::UndefinedElement);
                }
                let table = &mut instance.store.tables[inst.b as usize];
                let dst_end = dst.checked_add(len).ok_or(TrapKind::UndefinedElement)?;
                if dst_end > table.size() {
                    return Err(TrapKind::UndefinedElement);
                }
                table.elems[dst as usize..dst_end as usize]
                    .copy_from_slice(&elems[src as usize..src_end as usize]);
            }
            P::ElemDrop => {
                instance.store.elems[inst.a as usize] = None;
            }
            P::TableCopy => {
                let len = u64::from(pop!() as u32);
                let src = table_index(instance, inst.b, pop!());
                let dst = table_index(instance, inst.a, pop!());
                table_copy(&mut instance.store, inst.a, dst, inst.b, src, len)?;
            }
            P::TableGrow => {
                let delta = table_index(instance, inst.a, pop!());
                let init = pop!();
                let table = &mut instance.store.tables[inst.a as usize];
                let result = match table.grow(delta, init) {
                    Some(prior) => prior,
                    None => {
                        if table.ty.table64 {
                            u64::MAX
                        } else {
                            u64::from(u32::MAX)
                        }
                    }
                };
                push!(result);
            }
            P::TableSize => {
                push!(instance.store.tables[inst.a as usize].size());
            }
            P::TableFill => {
                let len = table_index(instance, inst.a, pop!());
                let value = pop!();
                let start = table_index(instance, inst.a, pop!());
                instance.store.tables[inst.a as usize].fill(start, value, len)?;
            }

            P::RefNull => push!(refenc::NULL),
            P::RefIsNull => {
                let bits = pop!();
                push!(u64::from(refenc::is_null(bits)));
            }
            P::RefFunc => push!(refenc::func(inst.a)),
            P::RefEq => {
                let b = pop!();
                let a = pop!();
                push!(u64::from(a == b));
            }
            P::RefAsNonNull => {
                let bits = *exec.stack.last().expect("validated operand stack");
                if refenc::is_null(bits) {
                    return Err(TrapKind::NullReference);
                }
            }
            P::BrOnNull => {
                let bits = pop!();
                if refenc::is_null(bits) {
                    take_branch!(at, inst.a, inst.b, inst.c);
                } else {
                    push!(bits);
                }
            }
            P::BrOnNonNull => {
                let bits = pop!();
                if !refenc::is_null(bits) {
                    push!(bits);
                    take_branch!(at, inst.a, inst.b, inst.c);
                }
            }

            // Memory accesses.
            P::I32Load => load!(inst, 4, |b| u64::from(u32::from_le_bytes(b))),
            P::I64Load => load!(inst, 8, u64::from_le_bytes),
            P::F32Load => load!(inst, 4, |b| u64::from(u32::from_le_bytes(b))),
            P::F64Load => load!(inst, 8, u64::from_le_bytes),
            P::I32Load8S => load!(inst, 1, |b: [u8; 1]| u64::from(b[0] as i8 as i32 as u32)),
            P::I32Load8U => load!(inst, 1, |b: [u8; 1]| u64::from(b[0])),
            P::I32Load16S => load!(inst, 2, |b| u64::from(i16::from_le_bytes(b) as i32 as u32)),
            P::I32Load16U => load!(inst, 2, |b| u64::from(u16::from_le_bytes(b))),
            P::I64Load8S => load!(inst, 1, |b: [u8; 1]| b[0] as i8 as i64 as u64),
            P::I64Load8U => load!(inst, 1, |b: [u8; 1]| u64::from(b[0])),
            P::I64Load16S => load!(inst, 2, |b| i16::from_le_bytes(b) as i64 as u64),
            P::I64Load16U => load!(inst, 2, |b| u64::from(u16::from_le_bytes(b))),
            P::I64Load32S => load!(inst, 4, |b| i32::from_le_bytes(b) as i64 as u64),
            P::I64Load32U => load!(inst, 4, |b| u64::from(u32::from_le_bytes(b))),
            P::I32Store => store_op!(inst, 4, |v: u64| (v as u32).to_le_bytes()),
            P::I64Store => store_op!(inst, 8, |v: u64| v.to_le_bytes()),
            P::F32Store => store_op!(inst, 4, |v: u64| (v as u32).to_le_bytes()),
            P::F64Store => store_op!(inst, 8, |v: u64| v.to_le_bytes()),
            P::I32Store8 => store_op!(inst, 1, |v: u64| [v as u8]),
            P::I32Store16 => store_op!(inst, 2, |v: u64| (v as u16).to_le_bytes()),
            P::I64Store8 => store_op!(inst, 1, |v: u64| [v as u8]),
            P::I64Store16 => store_op!(inst, 2, |v: u64| (v as u16).to_le_bytes()),
            P::I64Store32 => store_op!(inst, 4, |v: u64| (v as u32).to_le_bytes()),
            P::V128Load => {
                let marg = pir.memargs[inst.a as usize];
                let memory = &instance.store.memories[marg.memory as usize];
                let addr = addr_value(memory, pop!());
                let bytes = memory.load::<16>(addr, marg.offset)?;
                push!(u64::from_le_bytes(bytes[..8].try_into().unwrap()));
                push!(u64::from_le_bytes(bytes[8..].try_into().unwrap()));
            }
            P::V128Store => {
                let marg = pir.memargs[inst.a as usize];
                let hi = pop!();
                let lo = pop!();
                let memory = &mut instance.store.memories[marg.memory as usize];
                let addr = addr_value(memory, pop!());
                let mut bytes = [0u8; 16];
                bytes[..8].copy_from_slice(&lo.to_le_bytes());
                bytes[8..].copy_from_slice(&hi.to_le_bytes());
                memory.store::<16>(addr, marg.offset, bytes)?;
            }
            P::MemorySize => {
                push!(instance.store.memories[inst.a as usize].pages());
            }
            P::MemoryGrow => {
                let memory = &mut instance.store.memories[inst.a as usize];
                let delta = addr_value(memory, pop!());
                let result = match memory.grow(delta) {
                    Some(prior) => prior,
                    None if memory.ty().memory64 => u64::MAX,
                    None => u64::from(u32::MAX),
                };
                push!(result);
            }
            P::MemoryInit => {
                let len = u64::from(pop!() as u32);
                let src = u64::from(pop!() as u32);
                let data = instance.store.datas[inst.a as usize]
                    .clone()
                    .unwrap_or_default();
                let memory = &mut instance.store.memories[inst.b as usize];
                let dst = addr_value(memory, pop!());
                memory.init(dst, &data, src, len)?;
            }
            P::DataDrop => {
                instance.store.datas[inst.a as usize] = None;
            }
            P::MemoryCopy => {
                let (dst_mem, src_mem) = (inst.a as usize, inst.b as usize);
                let len_is_64 = instance.store.memories[dst_mem].ty().memory64
                    && instance.store.memories[src_mem].ty().memory64;
                let len = if len_is_64 {
                    pop!()
                } else {
                    u64::from(pop!() as u32)
                };
                let src = addr_value(&instance.store.memories[src_mem], pop!());
                let dst = addr_value(&instance.store.memories[dst_mem], pop!());
                if dst_mem == src_mem {
                    instance.store.memories[dst_mem].copy_within(dst, src, len)?;
                } else {
                    let (a, b) = split_two(&mut instance.store.memories, dst_mem, src_mem);
                    LinearMemory::copy_between(a, dst, b, src, len)?;
                }
            }
            P::MemoryFill => {
                let memory = &mut instance.store.memories[inst.a as usize];
                let len = addr_value(memory, pop!());
                let value = pop!() as u8;
                let dst = addr_value(memory, pop!());
                memory.fill(dst, value, len)?;
            }

            P::AtomicNotify => {
                let marg = pir.memargs[inst.a as usize];
                let _count = pop!() as u32;
                let memory = &instance.store.memories[marg.memory as usize];
                let addr = addr_value(memory, pop!());
                check_atomic_addr(memory, addr, marg.offset, 4)?;
                // Sequential engine: there are never waiters.
                push!(0);
            }
            P::AtomicWait32 | P::AtomicWait64 => {
                let width = if inst.op == P::AtomicWait32 { 4 } else { 8 };
                let marg = pir.memargs[inst.a as usize];
                let _timeout = pop!() as i64;
                let expected = pop!();
                let memory = &instance.store.memories[marg.memory as usize];
                let addr = addr_value(memory, pop!());
                check_atomic_addr(memory, addr, marg.offset, width)?;
                if !memory.ty().shared {
                    return Err(TrapKind::AtomicWaitUnshared);
                }
                let observed = if width == 4 {
                    u64::from(u32::from_le_bytes(memory.load::<4>(addr, marg.offset)?))
                } else {
                    u64::from_le_bytes(memory.load::<8>(addr, marg.offset)?)
                };
                let expected = if width == 4 {
                    u64::from(expected as u32)
                } else {
                    expected
                };
                // 1 = value mismatch; 2 = timed out. Never blocking keeps a
                // single-threaded module from deadlocking.
                push!(if observed != expected { 1 } else { 2 });
            }
            P::AtomicRmw => {
                let kind = AtomicRmwKind::unpack(inst.b);
                let marg = pir.memargs[inst.a as usize];
                let operand = pop!();
                let memory = &mut instance.store.memories[marg.memory as usize];
                let addr = addr_value(memory, pop!());
                check_atomic_addr(memory, addr, marg.offset, u32::from(kind.width))?;
                let old = atomic_load(memory, addr, marg.offset, kind.width)?;
                let new = apply_rmw(kind, old, operand);
                atomic_store(memory, addr, marg.offset, kind.width, new)?;
                push!(narrow(old, kind.is_64));
            }
            P::AtomicCmpxchg => {
                let kind = AtomicRmwKind::unpack(inst.b);
                let marg = pir.memargs[inst.a as usize];
                let replacement = pop!();
                let expected = pop!();
                let memory = &mut instance.store.memories[marg.memory as usize];
                let addr = addr_value(memory, pop!());
                check_atomic_addr(memory, addr, marg.offset, u32::from(kind.width))?;
                let old = atomic_load(memory, addr, marg.offset, kind.width)?;
                let expected = mask_width(expected, kind.width);
                if old == expected {
                    atomic_store(memory, addr, marg.offset, kind.width, replacement)?;
                }
                push!(narrow(old, kind.is_64));
            }

            // Constants.
            P::I32Const => push!(u64::from(inst.a)),
            P::I64Const => push!(pir.wide[inst.a as usize]),
            P::F32Const => push!(u64::from(inst.a)),
            P::F64Const => push!(pir.wide[inst.a as usize]),
            P::V128Const => {
                let bytes = pir.v128[inst.a as usize];
                push!(u64::from_le_bytes(bytes[..8].try_into().unwrap()));
                push!(u64::from_le_bytes(bytes[8..].try_into().unwrap()));
            }

            // i32 numerics.
            P::I32Eqz => unop32!(|a| u32::from(a == 0)),
            P::I32Eq => cmp32!(|a, b| a == b),
            P::I32Ne => cmp32!(|a, b| a != b),
            P::I32LtS => cmp32!(|a, b| (a as i32) < (b as i32)),
            P::I32LtU => cmp32!(|a, b| a < b),
            P::I32GtS => cmp32!(|a, b| (a as i32) > (b as i32)),
            P::I32GtU => cmp32!(|a, b| a > b),
            P::I32LeS => cmp32!(|a, b| (a as i32) <= (b as i32)),
            P::I32LeU => cmp32!(|a, b| a <= b),
            P::I32GeS => cmp32!(|a, b| (a as i32) >= (b as i32)),
            P::I32GeU => cmp32!(|a, b| a >= b),
            P::I32Clz => unop32!(|a| a.leading_zeros()),
            P::I32Ctz => unop32!(|a| a.trailing_zeros()),
            P::I32Popcnt => unop32!(|a| a.count_ones()),
            P::I32Add => binop32!(|a, b| a.wrapping_add(b)),
            P::I32Sub => binop32!(|a, b| a.wrapping_sub(b)),
            P::I32Mul => binop32!(|a, b| a.wrapping_mul(b)),
            P::I32DivS => binop32!(|a, b| num::i32_div_s(a as i32, b as i32)? as u32),
            P::I32DivU => binop32!(|a, b| num::i32_div_u(a, b)?),
            P::I32RemS => binop32!(|a, b| num::i32_rem_s(a as i32, b as i32)? as u32),
            P::I32RemU => binop32!(|a, b| num::i32_rem_u(a, b)?),
            P::I32And => binop32!(|a, b| a & b),
            P::I32Or => binop32!(|a, b| a | b),
            P::I32Xor => binop32!(|a, b| a ^ b),
            P::I32Shl => binop32!(|a, b| a.wrapping_shl(b)),
            P::I32ShrS => binop32!(|a, b| ((a as i32).wrapping_shr(b)) as u32),
            P::I32ShrU => binop32!(|a, b| a.wrapping_shr(b)),
            P::I32Rotl => binop32!(|a, b| a.rotate_left(b & 31)),
            P::I32Rotr => binop32!(|a, b| a.rotate_right(b & 31)),

            // i64 numerics.
            P::I64Eqz => {
                let a = pop!();
                push!(u64::from(a == 0));
            }
            P::I64Eq => cmp64!(|a, b| a == b),
            P::I64Ne => cmp64!(|a, b| a != b),
            P::I64LtS => cmp64!(|a, b| (a as i64) < (b as i64)),
            P::I64LtU => cmp64!(|a, b| a < b),
            P::I64GtS => cmp64!(|a, b| (a as i64) > (b as i64)),
            P::I64GtU => cmp64!(|a, b| a > b),
            P::I64LeS => cmp64!(|a, b| (a as i64) <= (b as i64)),
            P::I64LeU => cmp64!(|a, b| a <= b),
            P::I64GeS => cmp64!(|a, b| (a as i64) >= (b as i64)),
            P::I64GeU => cmp64!(|a, b| a >= b),
            P::I64Clz => unop64!(|a| u64::from(a.leading_zeros())),
            P::I64Ctz => unop64!(|a| u64::from(a.trailing_zeros())),
            P::I64Popcnt => unop64!(|a| u64::from(a.count_ones())),
            P::I64Add => binop64!(|a, b| a.wrapping_add(b)),
            P::I64Sub => binop64!(|a, b| a.wrapping_sub(b)),
            P::I64Mul => binop64!(|a, b| a.wrapping_mul(b)),
            P::I64DivS => binop64!(|a, b| num::i64_div_s(a as i64, b as i64)? as u64),
            P::I64DivU => binop64!(|a, b| num::i64_div_u(a, b)?),
            P::I64RemS => binop64!(|a, b| num::i64_rem_s(a as i64, b as i64)? as u64),
            P::I64RemU => binop64!(|a, b| num::i64_rem_u(a, b)?),
            P::I64And => binop64!(|a, b| a & b),
            P::I64Or => binop64!(|a, b| a | b),
            P::I64Xor => binop64!(|a, b| a ^ b),
            P::I64Shl => binop64!(|a, b| a.wrapping_shl(b as u32)),
            P::I64ShrS => binop64!(|a, b| ((a as i64).wrapping_shr(b as u32)) as u64),
            P::I64ShrU => binop64!(|a, b| a.wrapping_shr(b as u32)),
            P::I64Rotl => binop64!(|a, b| a.rotate_left((b & 63) as u32)),
            P::I64Rotr => binop64!(|a, b| a.rotate_right((b & 63) as u32)),

            // f32.
            P::F32Eq => cmpf32!(|a, b| a == b),
            P::F32Ne => cmpf32!(|a, b| a != b),
            P::F32Lt => cmpf32!(|a, b| a < b),
            P::F32Gt => cmpf32!(|a, b| a > b),
            P::F32Le => cmpf32!(|a, b| a <= b),
            P::F32Ge => cmpf32!(|a, b| a >= b),
            P::F32Abs => unf32!(|a| a.abs()),
            P::F32Neg => unf32!(|a| -a),
            P::F32Ceil => unf32!(|a| a.ceil()),
            P::F32Floor => unf32!(|a| a.floor()),
            P::F32Trunc => unf32!(|a| a.trunc()),
            P::F32Nearest => unf32!(|a| a.round_ties_even()),
            P::F32Sqrt => unf32!(|a| a.sqrt()),
            P::F32Add => binf32!(|a, b| a + b),
            P::F32Sub => binf32!(|a, b| a - b),
            P::F32Mul => binf32!(|a, b| a * b),
            P::F32Div => binf32!(|a, b| a / b),
            P::F32Min => binf32!(|a, b| num::f32_min(a, b)),
            P::F32Max => binf32!(|a, b| num::f32_max(a, b)),
            P::F32Copysign => binf32!(|a, b| a.copysign(b)),

            // f64.
            P::F64Eq => cmpf64!(|a, b| a == b),
            P::F64Ne => cmpf64!(|a, b| a != b),
            P::F64Lt => cmpf64!(|a, b| a < b),
            P::F64Gt => cmpf64!(|a, b| a > b),
            P::F64Le => cmpf64!(|a, b| a <= b),
            P::F64Ge => cmpf64!(|a, b| a >= b),
            P::F64Abs => unf64!(|a| a.abs()),
            P::F64Neg => unf64!(|a| -a),
            P::F64Ceil => unf64!(|a| a.ceil()),
            P::F64Floor => unf64!(|a| a.floor()),
            P::F64Trunc => unf64!(|a| a.trunc()),
            P::F64Nearest => unf64!(|a| a.round_ties_even()),
            P::F64Sqrt => unf64!(|a| a.sqrt()),
            P::F64Add => binf64!(|a, b| a + b),
            P::F64Sub => binf64!(|a, b| a - b),
            P::F64Mul => binf64!(|a, b| a * b),
            P::F64Div => binf64!(|a, b| a / b),
            P::F64Min => binf64!(|a, b| num::f64_min(a, b)),
            P::F64Max => binf64!(|a, b| num::f64_max(a, b)),
            P::F64Copysign => binf64!(|a, b| a.copysign(b)),

            // Conversions.
            P::I32WrapI64 => {
                let a = pop!();
                push!(u64::from(a as u32));
            }
            P::I32TruncF32S => {
                let a = f32::from_bits(pop!() as u32);
                push!(u64::from(num::i32_trunc_s(f64::from(a))? as u32));
            }
            P::I32TruncF32U => {
                let a = f32::from_bits(pop!() as u32);
                push!(u64::from(num::i32_trunc_u(f64::from(a))?));
            }
            P::I32TruncF64S => {
                let a = f64::from_bits(pop!());
                push!(u64::from(num::i32_trunc_s(a)? as u32));
            }
            P::I32TruncF64U => {
                let a = f64::from_bits(pop!());
                push!(u64::from(num::i32_trunc_u(a)?));
            }
            P::I64ExtendI32S => {
                let a = pop!() as u32;
                push!(a as i32 as i64 as u64);
            }
            P::I64ExtendI32U => {
                let a = pop!() as u32;
                push!(u64::from(a));
            }
            P::I64TruncF32S => {
                let a = f32::from_bits(pop!() as u32);
                push!(num::i64_trunc_s(f64::from(a))? as u64);
            }
            P::I64TruncF32U => {
                let a = f32::from_bits(pop!() as u32);
                push!(num::i64_trunc_u(f64::from(a))?);
            }
            P::I64TruncF64S => {
                let a = f64::from_bits(pop!());
                push!(num::i64_trunc_s(a)? as u64);
            }
            P::I64TruncF64U => {
                let a = f64::from_bits(pop!());
                push!(num::i64_trunc_u(a)?);
            }
            P::F32ConvertI32S => {
                let a = pop!() as u32 as i32;
                push!(u64::from((a as f32).to_bits()));
            }
            P::F32ConvertI32U => {
                let a = pop!() as u32;
                push!(u64::from((a as f32).to_bits()));
            }
            P::F32ConvertI64S => {
                let a = pop!() as i64;
                push!(u64::from((a as f32).to_bits()));
            }
            P::F32ConvertI64U => {
                let a = pop!();
                push!(u64::from((a as f32).to_bits()));
            }
            P::F32DemoteF64 => {
                let a = f64::from_bits(pop!());
                push!(u64::from((a as f32).to_bits()));
            }
            P::F64ConvertI32S => {
                let a = pop!() as u32 as i32;
                push!(f64::from(a).to_bits());
            }
            P::F64ConvertI32U => {
                let a = pop!() as u32;
                push!(f64::from(a).to_bits());
            }
            P::F64ConvertI64S => {
                let a = pop!() as i64;
                push!((a as f64).to_bits());
            }
            P::F64ConvertI64U => {
                let a = pop!();
                push!((a as f64).to_bits());
            }
            P::F64PromoteF32 => {
                let a = f32::from_bits(pop!() as u32);
                push!(f64::from(a).to_bits());
            }
            P::I32ReinterpretF32 | P::F32ReinterpretI32 => {
                // Bit-identity on a 32-bit slot.
            }
            P::I64ReinterpretF64 | P::F64ReinterpretI64 => {}
            P::I32Extend8S => unop32!(|a| a as u8 as i8 as i32 as u32),
            P::I32Extend16S => unop32!(|a| a as u16 as i16 as i32 as u32),
            P::I64Extend8S => unop64!(|a| a as u8 as i8 as i64 as u64),
            P::I64Extend16S => unop64!(|a| a as u16 as i16 as i64 as u64),
            P::I64Extend32S => unop64!(|a| a as u32 as i32 as i64 as u64),
            P::I32TruncSatF32S => {
                let a = f32::from_bits(pop!() as u32);
                push!(u64::from((a as i32) as u32));
            }
            P::I32TruncSatF32U => {
                let a = f32::from_bits(pop!() as u32);
                push!(u64::from(a as u32));
            }
            P::I32TruncSatF64S => {
                let a = f64::from_bits(pop!());
                push!(u64::from((a as i32) as u32));
            }
            P::I32TruncSatF64U => {
                let a = f64::from_bits(pop!());
                push!(u64::from(a as u32));
            }
            P::I64TruncSatF32S => {
                let a = f32::from_bits(pop!() as u32);
                push!((a as i64) as u64);
            }
            P::I64TruncSatF32U => {
                let a = f32::from_bits(pop!() as u32);
                push!(a as u64);
            }
            P::I64TruncSatF64S => {
                let a = f64::from_bits(pop!());
                push!((a as i64) as u64);
            }
            P::I64TruncSatF64U => {
                let a = f64::from_bits(pop!());
                push!(a as u64);
            }

            // GC.
            P::StructNew | P::StructNewDefault | P::StructGet | P::StructSet | P::ArrayNew
            | P::ArrayNewDefault | P::ArrayNewFixed | P::ArrayNewData | P::ArrayNewElem
            | P::ArrayGet | P::ArraySet | P::ArrayLen | P::ArrayFill | P::ArrayCopy
            | P::ArrayInitData | P::ArrayInitElem | P::RefTest | P::RefCast | P::BrOnCast
            | P::RefI31 | P::I31GetS | P::I31GetU | P::AnyConvertExtern | P::ExternConvertAny => {
                let branch = run_gc_op(instance, exec, &module, pir, inst)?;
                if let Some((target, copy, dest)) = branch {
                    take_branch!(at, target, copy, dest);
                }
            }

            // Vector subset.
            P::I8x16Splat => {
                let a = pop!() as u8;
                let lane = u64::from(a);
                let mut v = 0u64;
                for i in 0..8 {
                    v |= lane << (i * 8);
                }
                push!(v);
                push!(v);
            }
            P::I16x8Splat => {
                let a = pop!() as u16;
                let lane = u64::from(a);
                let v = lane | lane << 16 | lane << 32 | lane << 48;
                push!(v);
                push!(v);
            }
            P::I32x4Splat => {
                let a = pop!() as u32;
                let v = u64::from(a) | u64::from(a) << 32;
                push!(v);
                push!(v);
            }
            P::I64x2Splat => {
                let a = pop!();
                push!(a);
                push!(a);
            }
            P::I32x4ExtractLane => {
                let hi = pop!();
                let lo = pop!();
                let lanes = [lo as u32, (lo >> 32) as u32, hi as u32, (hi >> 32) as u32];
                push!(u64::from(lanes[inst.a as usize]));
            }
            P::I32x4ReplaceLane => {
                let value = pop!() as u32;
                let hi = pop!();
                let lo = pop!();
                let mut lanes = [lo as u32, (lo >> 32) as u32, hi as u32, (hi >> 32) as u32];
                lanes[inst.a as usize] = value;
                push!(u64::from(lanes[0]) | u64::from(lanes[1]) << 32);
                push!(u64::from(lanes[2]) | u64::from(lanes[3]) << 32);
            }
            P::I32x4Add | P::I32x4Sub | P::I32x4Mul => {
                let b_hi = pop!();
                let b_lo = pop!();
                let a_hi = pop!();
                let a_lo = pop!();
                let a = [
                    a_lo as u32,
                    (a_lo >> 32) as u32,
                    a_hi as u32,
                    (a_hi >> 32) as u32,
                ];
                let b = [
                    b_lo as u32,
                    (b_lo >> 32) as u32,
                    b_hi as u32,
                    (b_hi >> 32) as u32,
                ];
                let mut r = [0u32; 4];
                for i in 0..4 {
                    r[i] = match inst.op {
                        P::I32x4Add => a[i].wrapping_add(b[i]),
                        P::I32x4Sub => a[i].wrapping_sub(b[i]),
                        _ => a[i].wrapping_mul(b[i]),
                    };
                }
                push!(u64::from(r[0]) | u64::from(r[1]) << 32);
                push!(u64::from(r[2]) | u64::from(r[3]) << 32);
            }
            P::V128And => {
                let b_hi = pop!();
                let b_lo = pop!();
                let a_hi = pop!();
                let a_lo = pop!();
                push!(a_lo & b_lo);
                push!(a_hi & b_hi);
            }
            P::V128Or => {
                let b_hi = pop!();
                let b_lo = pop!();
                let a_hi = pop!();
                let a_lo = pop!();
                push!(a_lo | b_lo);
                push!(a_hi | b_hi);
            }
            P::V128Xor => {
                let b_hi = pop!();
                let b_lo = pop!();
                let a_hi = pop!();
                let a_lo = pop!();
                push!(a_lo ^ b_lo);
                push!(a_hi ^ b_hi);
            }
            P::V128Not => {
                let hi = pop!();
                let lo = pop!();
                push!(!lo);
                push!(!hi);
            }
            P::V128AnyTrue => {
                let hi = pop!();
                let lo = pop!();
                push!(u64::from(lo != 0 || hi != 0));
            }
            P::I32x4AllTrue => {
                let hi = pop!();
                let lo = pop!();
                let all = lo as u32 != 0
                    && (lo >> 32) as u32 != 0
                    && hi as u32 != 0
                    && (hi >> 32) as u32 != 0;
                push!(u64::from(all));
            }
        }
    }
}

fn callee_param_slots(instance: &Instance, callee: u32) -> usize {
    let type_idx = instance.store.functions[callee as usize].type_idx;
    instance.module.types[usize::from(type_idx)]
        .as_func()
        .expect("store functions have function types")
        .param_slots()
}

fn split_two<T>(items: &mut [T], a: usize, b: usize) -> (&mut T, &T) {
    debug_assert_ne!(a, b);
    if a < b {
        let (lo, hi) = items.split_at_mut(b);
        (&mut lo[a], &hi[0])
    } else {
        let (lo, hi) = items.split_at_mut(a);
        (&mut hi[0], &lo[b])
    }
}

fn table_copy(
    store: &mut Store,
    dst_table: u32,
    dst: u64,
    src_table: u32,
    src: u64,
    len: u64,
) -> Result<(), TrapKind> {
    let src_size = store.tables[src_table as usize].size();
    let dst_size = store.tables[dst_table as usize].size();
    let src_end = src.checked_add(len).ok_or(TrapKind::UndefinedElement)?;
    let dst_end = dst.checked_add(len).ok_or(TrapKind::UndefinedElement)?;
    if src_end > src_size || dst_end > dst_size {
        return Err(TrapKind::UndefinedElement);
    }
    if dst_table == src_table {
        let table = &mut store.tables[dst_table as usize];
        table
            .elems
            .copy_within(src as usize..src_end as usize, dst as usize);
    } else {
        let (dst_ref, src_ref) = split_two(&mut store.tables, dst_table as usize, src_table as usize);
        dst_ref.elems[dst as usize..dst_end as usize]
            .copy_from_slice(&src_ref.elems[src as usize..src_end as usize]);
    }
    Ok(())
}

fn check_atomic_addr(
    memory: &LinearMemory,
    addr: u64,
    offset: u64,
    width: u32,
) -> Result<(), TrapKind> {
    let effective = addr
        .checked_add(offset)
        .ok_or(TrapKind::OutOfBoundsMemoryAccess)?;
    if effective % u64::from(width) != 0 {
        return Err(TrapKind::OutOfBoundsMemoryAccess);
    }
    let end = effective
        .checked_add(u64::from(width))
        .ok_or(TrapKind::OutOfBoundsMemoryAccess)?;
    if end > memory.byte_size() as u64 {
        return Err(TrapKind::OutOfBoundsMemoryAccess);
    }
    Ok(())
}

fn atomic_load(
    memory: &LinearMemory,
    addr: u64,
    offset: u64,
    width: u8,
) -> Result<u64, TrapKind> {
    Ok(match width {
        1 => u64::from(memory.load::<1>(addr, offset)?[0]),
        2 => u64::from(u16::from_le_bytes(memory.load::<2>(addr, offset)?)),
        4 => u64::from(u32::from_le_bytes(memory.load::<4>(addr, offset)?)),
        _ => u64::from_le_bytes(memory.load::<8>(addr, offset)?),
    })
}

fn atomic_store(
    memory: &mut LinearMemory,
    addr: u64,
    offset: u64,
    width: u8,
    value: u64,
) -> Result<(), TrapKind> {
    match width {
        1 => memory.store::<1>(addr, offset, [value as u8]),
        2 => memory.store::<2>(addr, offset, (value as u16).to_le_bytes()),
        4 => memory.store::<4>(addr, offset, (value as u32).to_le_bytes()),
        _ => memory.store::<8>(addr, offset, value.to_le_bytes()),
    }
}

fn mask_width(value: u64, width: u8) -> u64 {
    match width {
        1 => value & 0xff,
        2 => value & 0xffff,
        4 => value & 0xffff_ffff,
        _ => value,
    }
}

fn apply_rmw(kind: AtomicRmwKind, old: u64, operand: u64) -> u64 {
    let operand = mask_width(operand, kind.width);
    let raw = match kind.op {
        RmwOp::Add => old.wrapping_add(operand),
        RmwOp::Sub => old.wrapping_sub(operand),
        RmwOp::And => old & operand,
        RmwOp::Or => old | operand,
        RmwOp::Xor => old ^ operand,
        RmwOp::Xchg => operand,
    };
    mask_width(raw, kind.width)
}

fn narrow(value: u64, is_64: bool) -> u64 {
    if is_64 { value } else { u64::from(value as u32) }
}

// Executes a GC instruction; a Some result is a taken br_on_cast branch as
// (target, copy, dest).
fn run_gc_op(
    instance: &mut Instance,
    exec: &mut ExecState,
    module: &ModuleInner,
    pir: &PirFunction,
    inst: crate::pir::PirInst,
) -> Result<Option<(u32, u32, u32)>, TrapKind> {
    use PirOp as P;

    macro_rules! pop {
        () => {
            exec.stack.pop().expect("validated operand stack")
        };
    }
    macro_rules! push {
        ($value:expr) => {
            push_slot(&mut exec.stack, $value)?
        };
    }

    match inst.op {
        P::StructNew => {
            let fields = struct_field_storages(module, inst.a);
            let start = exec.stack.len() - fields.len();
            let mut values = exec.stack[start..].to_vec();
            exec.stack.truncate(start);
            for (value, storage) in values.iter_mut().zip(&fields) {
                *value = mask_storage(*value, *storage);
            }
            let index = instance.store.gc.len();
            instance.store.gc.push(GcObject::Struct {
                type_idx: inst.a,
                fields: values,
            });
            push!(refenc::gc(index));
        }
        P::StructNewDefault => {
            let fields = struct_field_storages(module, inst.a);
            let index = instance.store.gc.len();
            instance.store.gc.push(GcObject::Struct {
                type_idx: inst.a,
                fields: vec![0; fields.len()],
            });
            push!(refenc::gc(index));
        }
        P::StructGet => {
            let bits = pop!();
            let index = gc_index(bits)?;
            let GcObject::Struct { fields, .. } = &instance.store.gc[index] else {
                return Err(TrapKind::CastFailure);
            };
            let raw = fields[inst.b as usize];
            let storage = struct_field_storages(module, inst.a)[inst.b as usize];
            push!(read_storage(raw, storage, inst.c));
        }
        P::StructSet => {
            let value = pop!();
            let bits = pop!();
            let index = gc_index(bits)?;
            let storage = struct_field_storages(module, inst.a)[inst.b as usize];
            let GcObject::Struct { fields, .. } = &mut instance.store.gc[index] else {
                return Err(TrapKind::CastFailure);
            };
            fields[inst.b as usize] = mask_storage(value, storage);
        }
        P::ArrayNew | P::ArrayNewDefault => {
            let len = pop!() as u32 as usize;
            let init = if inst.op == P::ArrayNew { pop!() } else { 0 };
            let storage = array_storage(module, inst.a);
            if len > (1 << 28) {
                return Err(TrapKind::MemoryLimitExceeded);
            }
            let index = instance.store.gc.len();
            instance.store.gc.push(GcObject::Array {
                type_idx: inst.a,
                storage,
                elems: vec![mask_storage(init, storage); len],
            });
            push!(refenc::gc(index));
        }
        P::ArrayNewFixed => {
            let storage = array_storage(module, inst.a);
            let start = exec.stack.len() - inst.b as usize;
            let mut elems = exec.stack[start..].to_vec();
            exec.stack.truncate(start);
            for value in &mut elems {
                *value = mask_storage(*value, storage);
            }
            let index = instance.store.gc.len();
            instance.store.gc.push(GcObject::Array {
                type_idx: inst.a,
                storage,
                elems,
            });
            push!(refenc::gc(index));
        }
        P::ArrayNewData => {
            let len = pop!() as u32 as usize;
            let src = pop!() as u32 as usize;
            let storage = array_storage(module, inst.a);
            let width = storage_width(storage);
            let data = instance.store.datas[inst.b as usize]
                .clone()
                .unwrap_or_default();
            let end = src
                .checked_add(len.checked_mul(width).ok_or(TrapKind::OutOfBoundsMemoryAccess)?)
                .ok_or(TrapKind::OutOfBoundsMemoryAccess)?;
            if end > data.len() {
                return Err(TrapKind::OutOfBoundsMemoryAccess);
            }
            let elems = (0..len)
                .map(|i| read_le(&data[src + i * width..src + (i + 1) * width]))
                .collect();
            let index = instance.store.gc.len();
            instance.store.gc.push(GcObject::Array {
                type_idx: inst.a,
                storage,
                elems,
            });
            push!(refenc::gc(index));
        }
        P::ArrayNewElem => {
            let len = pop!() as u32 as usize;
            let src = pop!() as u32 as usize;
            let elems = instance.store.elems[inst.b as usize]
                .clone()
                .unwrap_or_default();
            let end = src.checked_add(len).ok_or(TrapKind::UndefinedElement)?;
            if end > elems.len() {
                return Err(TrapKind::UndefinedElement);
            }
            let storage = array_storage(module, inst.a);
            let index = instance.store.gc.len();
            instance.store.gc.push(GcObject::Array {
                type_idx: inst.a,
                storage,
                elems: elems[src..end].to_vec(),
            });
            push!(refenc::gc(index));
        }
        P::ArrayGet => {
            let at = pop!() as u32 as usize;
            let bits = pop!();
            let index = gc_index(bits)?;
            let GcObject::Array { elems, storage, .. } = &instance.store.gc[index] else {
                return Err(TrapKind::CastFailure);
            };
            let raw = *elems.get(at).ok_or(TrapKind::UndefinedElement)?;
            let storage = *storage;
            push!(read_storage(raw, storage, inst.c));
        }
        P::ArraySet => {
            let value = pop!();
            let at = pop!() as u32 as usize;
            let bits = pop!();
            let index = gc_index(bits)?;
            let GcObject::Array { elems, storage, .. } = &mut instance.store.gc[index] else {
                return Err(TrapKind::CastFailure);
            };
            let storage = *storage;
            let slot = elems.get_mut(at).ok_or(TrapKind::UndefinedElement)?;
            *slot = mask_storage(value, storage);
        }
        P::ArrayLen => {
            let bits = pop!();
            let index = gc_index(bits)?;
            let GcObject::Array { elems, .. } = &instance.store.gc[index] else {
                return Err(TrapKind::CastFailure);
            };
            push!(elems.len() as u64);
        }
        P::ArrayFill => {
            let len = pop!() as u32 as usize;
            let value = pop!();
            let at = pop!() as u32 as usize;
            let bits = pop!();
            let index = gc_index(bits)?;
            let GcObject::Array { elems, storage, .. } = &mut instance.store.gc[index] else {
                return Err(TrapKind::CastFailure);
            };
            let storage = *storage;
            let end = at.checked_add(len).ok_or(TrapKind::UndefinedElement)?;
            if end > elems.len() {
                return Err(TrapKind::UndefinedElement);
            }
            elems[at..end].fill(mask_storage(value, storage));
        }
        P::ArrayCopy => {
            let len = pop!() as u32 as usize;
            let src_at = pop!() as u32 as usize;
            let src_bits = pop!();
            let dst_at = pop!() as u32 as usize;
            let dst_bits = pop!();
            let src_index = gc_index(src_bits)?;
            let dst_index = gc_index(dst_bits)?;
            let src_elems = {
                let GcObject::Array { elems, .. } = &instance.store.gc[src_index] else {
                    return Err(TrapKind::CastFailure);
                };
                let end = src_at.checked_add(len).ok_or(TrapKind::UndefinedElement)?;
                if end > elems.len() {
                    return Err(TrapKind::UndefinedElement);
                }
                elems[src_at..end].to_vec()
            };
            let GcObject::Array { elems, .. } = &mut instance.store.gc[dst_index] else {
                return Err(TrapKind::CastFailure);
            };
            let end = dst_at.checked_add(len).ok_or(TrapKind::UndefinedElement)?;
            if end > elems.len() {
                return Err(TrapKind::UndefinedElement);
            }
            elems[dst_at..end].copy_from_slice(&src_elems);
        }
        P::ArrayInitData => {
            let len = pop!() as u32 as usize;
            let src = pop!() as u32 as usize;
            let dst_at = pop!() as u32 as usize;
            let bits = pop!();
            let index = gc_index(bits)?;
            let data = instance.store.datas[inst.b as usize]
                .clone()
                .unwrap_or_default();
            let GcObject::Array { elems, storage, .. } = &mut instance.store.gc[index] else {
                return Err(TrapKind::CastFailure);
            };
            let width = storage_width(*storage);
            let src_end = src
                .checked_add(len.checked_mul(width).ok_or(TrapKind::OutOfBoundsMemoryAccess)?)
                .ok_or(TrapKind::OutOfBoundsMemoryAccess)?;
            let dst_end = dst_at.checked_add(len).ok_or(TrapKind::UndefinedElement)?;
            if src_end > data.len() || dst_end > elems.len() {
                return Err(TrapKind::OutOfBoundsMemoryAccess);
            }
            for i in 0..len {
                elems[dst_at + i] = read_le(&data[src + i * width..src + (i + 1) * width]);
            }
        }
        P::ArrayInitElem => {
            let len = pop!() as u32 as usize;
            let src = pop!() as u32 as usize;
            let dst_at = pop!() as u32 as usize;
            let bits = pop!();
            let index = gc_index(bits)?;
            let source = instance.store.elems[inst.b as usize]
                .clone()
                .unwrap_or_default();
            let GcObject::Array { elems, .. } = &mut instance.store.gc[index] else {
                return Err(TrapKind::CastFailure);
            };
            let src_end = src.checked_add(len).ok_or(TrapKind::UndefinedElement)?;
            let dst_end = dst_at.checked_add(len).ok_or(TrapKind::UndefinedElement)?;
            if src_end > source.len() || dst_end > elems.len() {
                return Err(TrapKind::UndefinedElement);
            }
            elems[dst_at..dst_end].copy_from_slice(&source[src..src_end]);
        }
        P::RefTest => {
            let bits = pop!();
            let heap = decode_heap_type(inst.a);
            let pass = ref_test(instance, module, bits, heap, inst.b != 0);
            push!(u64::from(pass));
        }
        P::RefCast => {
            let bits = pop!();
            let heap = decode_heap_type(inst.a);
            if !ref_test(instance, module, bits, heap, inst.b != 0) {
                return Err(TrapKind::CastFailure);
            }
            push!(bits);
        }
        P::BrOnCast => {
            let cast = pir.casts[inst.a as usize];
            let bits = *exec.stack.last().expect("validated operand stack");
            let heap = decode_heap_type(cast.to);
            let pass = ref_test(instance, module, bits, heap, cast.to_nullable);
            if pass != cast.on_fail {
                return Ok(Some((cast.target, cast.copy, cast.dest_height)));
            }
        }
        P::RefI31 => {
            let value = pop!() as u32 as i32;
            push!(refenc::i31(value));
        }
        P::I31GetS => {
            let bits = pop!();
            if refenc::is_null(bits) {
                return Err(TrapKind::NullReference);
            }
            push!(u64::from(refenc::i31_get_s(bits) as u32));
        }
        P::I31GetU => {
            let bits = pop!();
            if refenc::is_null(bits) {
                return Err(TrapKind::NullReference);
            }
            push!(u64::from(refenc::i31_get_u(bits) as u32));
        }
        P::AnyConvertExtern | P::ExternConvertAny => {
            // Internalization keeps the representation; the dynamic tests
            // accept external handles under `any`.
        }
        _ => unreachable!("not a GC op: {:?}", inst.op),
    }
    Ok(None)
}

fn gc_index(bits: u64) -> Result<usize, TrapKind> {
    if refenc::is_null(bits) {
        return Err(TrapKind::NullReference);
    }
    if refenc::tag(bits) != refenc::TAG_GC {
        return Err(TrapKind::CastFailure);
    }
    Ok(refenc::payload(bits) as usize)
}

fn struct_field_storages(module: &ModuleInner, type_idx: u32) -> Vec<StorageType> {
    match &module.types[type_idx as usize].composite {
        CompositeType::Struct(fields) => fields.iter().map(|f| f.storage).collect(),
        _ => Vec::new(),
    }
}

fn array_storage(module: &ModuleInner, type_idx: u32) -> StorageType {
    match &module.types[type_idx as usize].composite {
        CompositeType::Array(field) => field.storage,
        _ => StorageType::Val(crate::types::ValType::I32),
    }
}

fn storage_width(storage: StorageType) -> usize {
    use crate::types::ValType;
    match storage {
        StorageType::I8 => 1,
        StorageType::I16 => 2,
        StorageType::Val(ValType::I32 | ValType::F32) => 4,
        StorageType::Val(_) => 8,
    }
}

fn read_le(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf[..bytes.len()].copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}

fn mask_storage(value: u64, storage: StorageType) -> u64 {
    match storage {
        StorageType::I8 => value & 0xff,
        StorageType::I16 => value & 0xffff,
        StorageType::Val(_) => value,
    }
}

// sign: 0 = plain, 1 = signed extension, 2 = unsigned extension.
fn read_storage(raw: u64, storage: StorageType, sign: u32) -> u64 {
    match (storage, sign) {
        (StorageType::I8, 1) => u64::from(raw as u8 as i8 as i32 as u32),
        (StorageType::I16, 1) => u64::from(raw as u16 as i16 as i32 as u32),
        _ => raw,
    }
}

// Dynamic reference-type test against a target heap type.
fn ref_test(
    instance: &Instance,
    module: &ModuleInner,
    bits: u64,
    target: HeapType,
    null_ok: bool,
) -> bool {
    use HeapType::*;

    if refenc::is_null(bits) {
        return null_ok;
    }
    match refenc::tag(bits) {
        refenc::TAG_I31 => matches!(target, I31 | Eq | Any),
        refenc::TAG_FUNC => match target {
            Func => true,
            Concrete(idx) => {
                let addr = refenc::payload(bits) as usize;
                let actual = instance.store.functions[addr].type_idx;
                concrete_matches(module, actual, idx)
            }
            _ => false,
        },
        refenc::TAG_EXTERN => matches!(target, Extern | Any),
        refenc::TAG_EXN => matches!(target, Exn),
        refenc::TAG_GC => {
            let index = refenc::payload(bits) as usize;
            let (kind_is_struct, actual) = match &instance.store.gc[index] {
                GcObject::Struct { type_idx, .. } => (true, *type_idx),
                GcObject::Array { type_idx, .. } => (false, *type_idx),
            };
            match target {
                Any | Eq => true,
                Struct => kind_is_struct,
                Array => !kind_is_struct,
                Concrete(idx) => {
                    concrete_matches(module, crate::types::TypeIdx::new(actual), idx)
                }
                _ => false,
            }
        }
        _ => false,
    }
}

// Structural subtype check between concrete type indices: canonical
// fingerprint equality, or a walk up the declared supertype chain.
fn concrete_matches(
    module: &ModuleInner,
    actual: crate::types::TypeIdx,
    target: crate::types::TypeIdx,
) -> bool {
    if module.types_match(actual, target) {
        return true;
    }
    let mut current = actual;
    loop {
        let sub = &module.types[usize::from(current)];
        let Some(&next) = sub.supertypes.first() else {
            return false;
        };
        if module.types_match(next, target) {
            return true;
        }
        current = next;
    }
}
