// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! The RIR dispatch loop: the default interpreter tier, executing over the
//! virtual register file instead of an operand stack.

use super::num;
use super::{Action, ExecState, burn_fuel, on_back_edge, push_slot};
use crate::rir::{Cond, RirFunction, RirOp};
use crate::runtime::{Instance, TrapKind, refenc};

#[inline]
fn cond_holds_32(cond: Cond, a: u32, b: u32) -> bool {
    match cond {
        Cond::Eq => a == b,
        Cond::Ne => a != b,
        Cond::LtS => (a as i32) < (b as i32),
        Cond::LtU => a < b,
        Cond::GtS => (a as i32) > (b as i32),
        Cond::GtU => a > b,
        Cond::LeS => (a as i32) <= (b as i32),
        Cond::LeU => a <= b,
        Cond::GeS => (a as i32) >= (b as i32),
        Cond::GeU => a >= b,
    }
}

#[inline]
fn cond_holds_64(cond: Cond, a: u64, b: u64) -> bool {
    match cond {
        Cond::Eq => a == b,
        Cond::Ne => a != b,
        Cond::LtS => (a as i64) < (b as i64),
        Cond::LtU => a < b,
        Cond::GtS => (a as i64) > (b as i64),
        Cond::GtU => a > b,
        Cond::LeS => (a as i64) <= (b as i64),
        Cond::LeU => a <= b,
        Cond::GeS => (a as i64) >= (b as i64),
        Cond::GeU => a >= b,
    }
}

// Executes the current (topmost) frame until it transfers control.
pub(super) fn run_rir(
    instance: &mut Instance,
    exec: &mut ExecState,
    rir: &RirFunction,
) -> Result<Action, TrapKind> {
    let frame_index = exec.frames.len() - 1;
    let (func, base) = {
        let frame = &exec.frames[frame_index];
        (frame.func, frame.base)
    };
    let mut pc = exec.frames[frame_index].pc;

    macro_rules! reg {
        ($r:expr) => {
            exec.stack[base + $r as usize]
        };
    }
    macro_rules! set {
        ($r:expr, $value:expr) => {
            exec.stack[base + $r as usize] = $value
        };
    }
    macro_rules! bin32 {
        ($inst:expr, |$a:ident, $b:ident| $body:expr) => {{
            let $a = reg!($inst.a) as u32;
            let $b = reg!($inst.b) as u32;
            let result: u32 = $body;
            set!($inst.dst, u64::from(result));
        }};
    }
    macro_rules! bin64 {
        ($inst:expr, |$a:ident, $b:ident| $body:expr) => {{
            let $a = reg!($inst.a);
            let $b = reg!($inst.b);
            let result: u64 = $body;
            set!($inst.dst, result);
        }};
    }
    macro_rules! imm32 {
        ($inst:expr, |$a:ident, $b:ident| $body:expr) => {{
            let $a = reg!($inst.a) as u32;
            let $b = $inst.imm;
            let result: u32 = $body;
            set!($inst.dst, u64::from(result));
        }};
    }
    macro_rules! imm64 {
        ($inst:expr, |$a:ident, $b:ident| $body:expr) => {{
            let $a = reg!($inst.a);
            let $b = rir.wide[$inst.imm as usize];
            let result: u64 = $body;
            set!($inst.dst, result);
        }};
    }
    macro_rules! un32 {
        ($inst:expr, |$a:ident| $body:expr) => {{
            let $a = reg!($inst.a) as u32;
            let result: u32 = $body;
            set!($inst.dst, u64::from(result));
        }};
    }
    macro_rules! un64 {
        ($inst:expr, |$a:ident| $body:expr) => {{
            let $a = reg!($inst.a);
            let result: u64 = $body;
            set!($inst.dst, result);
        }};
    }
    macro_rules! cmp32 {
        ($inst:expr, |$a:ident, $b:ident| $body:expr) => {{
            let $a = reg!($inst.a) as u32;
            let $b = reg!($inst.b) as u32;
            set!($inst.dst, u64::from($body));
        }};
    }
    macro_rules! cmp64 {
        ($inst:expr, |$a:ident, $b:ident| $body:expr) => {{
            let $a = reg!($inst.a);
            let $b = reg!($inst.b);
            set!($inst.dst, u64::from($body));
        }};
    }
    macro_rules! binf32 {
        ($inst:expr, |$a:ident, $b:ident| $body:expr) => {{
            let $a = f32::from_bits(reg!($inst.a) as u32);
            let $b = f32::from_bits(reg!($inst.b) as u32);
            let result: f32 = $body;
            set!($inst.dst, u64::from(result.to_bits()));
        }};
    }
    macro_rules! binf64 {
        ($inst:expr, |$a:ident, $b:ident| $body:expr) => {{
            let $a = f64::from_bits(reg!($inst.a));
            let $b = f64::from_bits(reg!($inst.b));
            let result: f64 = $body;
            set!($inst.dst, result.to_bits());
        }};
    }
    macro_rules! unf32 {
        ($inst:expr, |$a:ident| $body:expr) => {{
            let $a = f32::from_bits(reg!($inst.a) as u32);
            let result: f32 = $body;
            set!($inst.dst, u64::from(result.to_bits()));
        }};
    }
    macro_rules! unf64 {
        ($inst:expr, |$a:ident| $body:expr) => {{
            let $a = f64::from_bits(reg!($inst.a));
            let result: f64 = $body;
            set!($inst.dst, result.to_bits());
        }};
    }
    macro_rules! cmpf32 {
        ($inst:expr, |$a:ident, $b:ident| $body:expr) => {{
            let $a = f32::from_bits(reg!($inst.a) as u32);
            let $b = f32::from_bits(reg!($inst.b) as u32);
            set!($inst.dst, u64::from($body));
        }};
    }
    macro_rules! cmpf64 {
        ($inst:expr, |$a:ident, $b:ident| $body:expr) => {{
            let $a = f64::from_bits(reg!($inst.a));
            let $b = f64::from_bits(reg!($inst.b));
            set!($inst.dst, u64::from($body));
        }};
    }
    macro_rules! load {
        ($inst:expr, $width:literal, $conv:expr) => {{
            let marg = rir.memargs[$inst.imm as usize];
            let memory = &instance.store.memories[marg.memory as usize];
            let slot = reg!($inst.a);
            let addr = if memory.ty().memory64 {
                slot
            } else {
                u64::from(slot as u32)
            };
            let bytes = memory.load::<$width>(addr, marg.offset)?;
            let value: u64 = $conv(bytes);
            set!($inst.dst, value);
        }};
    }
    macro_rules! store_op {
        ($inst:expr, $width:literal, $conv:expr) => {{
            let marg = rir.memargs[$inst.imm as usize];
            let value = reg!($inst.b);
            let slot = reg!($inst.a);
            let memory = &mut instance.store.memories[marg.memory as usize];
            let addr = if memory.ty().memory64 {
                slot
            } else {
                u64::from(slot as u32)
            };
            let bytes: [u8; $width] = $conv(value);
            memory.store::<$width>(addr, marg.offset, bytes)?;
        }};
    }
    macro_rules! jump {
        ($at:expr, $target:expr) => {{
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
        let inst = rir.insts[at];
        pc = at + 1;

        use RirOp as R;
        match inst.op {
            R::Nop => {}
            R::Unreachable => return Err(TrapKind::Unreachable),
            R::Move => {
                let value = reg!(inst.a);
                set!(inst.dst, value);
            }
            R::Const32 => set!(inst.dst, u64::from(inst.imm)),
            R::Const64 => set!(inst.dst, rir.wide[inst.imm as usize]),

            R::Br => jump!(at, inst.imm),
            R::BrIfZero => {
                if reg!(inst.a) as u32 == 0 {
                    jump!(at, inst.imm);
                }
            }
            R::BrIfNonZero => {
                if reg!(inst.a) as u32 != 0 {
                    jump!(at, inst.imm);
                }
            }
            R::BrCmpI32 => {
                let cond = Cond::from_u16(inst.dst);
                if cond_holds_32(cond, reg!(inst.a) as u32, reg!(inst.b) as u32) {
                    jump!(at, inst.imm);
                }
            }
            R::BrCmpI64 => {
                let cond = Cond::from_u16(inst.dst);
                if cond_holds_64(cond, reg!(inst.a), reg!(inst.b)) {
                    jump!(at, inst.imm);
                }
            }
            R::BrTable => {
                let table = &rir.br_tables[inst.imm as usize];
                let index = (reg!(inst.a) as u32 as usize).min(table.len() - 1);
                let target = table[index];
                jump!(at, target);
            }

            R::Ret => {
                let count = rir.lists[inst.a as usize].len();
                let result_start = exec.stack.len();
                for i in 0..count {
                    let value = exec.stack[base + rir.lists[inst.a as usize][i] as usize];
                    push_slot(&mut exec.stack, value)?;
                }
                transfer!(Action::Return { result_start });
            }
            R::Call | R::ReturnCall => {
                let site = &rir.calls[inst.imm as usize];
                let callee = site.target;
                let tail = inst.op == R::ReturnCall;
                let arg_slots = site.args.len();
                for i in 0..arg_slots {
                    let value = exec.stack[base + rir.calls[inst.imm as usize].args[i] as usize];
                    push_slot(&mut exec.stack, value)?;
                }
                if !tail {
                    exec.frames[frame_index].pending_call = Some(inst.imm);
                }
                transfer!(Action::Call {
                    callee,
                    tail,
                    arg_slots,
                });
            }
            R::CallIndirect | R::ReturnCallIndirect => {
                let site_idx = inst.imm as usize;
                let (table, addr_reg, type_idx) = {
                    let site = &rir.calls[site_idx];
                    (site.table, site.addr, site.target)
                };
                let slot = reg!(addr_reg);
                let index = if instance.store.tables[table as usize].ty.table64 {
                    slot
                } else {
                    u64::from(slot as u32)
                };
                let bits = instance.store.tables[table as usize].get(index)?;
                if refenc::is_null(bits) {
                    return Err(TrapKind::UndefinedElement);
                }
                if refenc::tag(bits) != refenc::TAG_FUNC {
                    return Err(TrapKind::MismatchedSignatures);
                }
                let callee = refenc::payload(bits) as u32;
                let expected = instance.module.type_fingerprints[type_idx as usize];
                if instance.store.functions[callee as usize].fingerprint != expected {
                    return Err(TrapKind::MismatchedSignatures);
                }
                let tail = inst.op == R::ReturnCallIndirect;
                let arg_slots = rir.calls[site_idx].args.len();
                for i in 0..arg_slots {
                    let value = exec.stack[base + rir.calls[site_idx].args[i] as usize];
                    push_slot(&mut exec.stack, value)?;
                }
                if !tail {
                    exec.frames[frame_index].pending_call = Some(inst.imm);
                }
                transfer!(Action::Call {
                    callee,
                    tail,
                    arg_slots,
                });
            }

            R::Select => {
                let cond = reg!(inst.imm as u16) as u32;
                let value = if cond != 0 { reg!(inst.a) } else { reg!(inst.b) };
                set!(inst.dst, value);
            }

            R::GlobalGet => {
                set!(inst.dst, instance.store.globals[inst.imm as usize].value[0]);
            }
            R::GlobalSet => {
                let value = reg!(inst.a);
                instance.store.globals[inst.imm as usize].value = [value, 0];
            }

            R::I32Load => load!(inst, 4, |b| u64::from(u32::from_le_bytes(b))),
            R::I64Load => load!(inst, 8, u64::from_le_bytes),
            R::F32Load => load!(inst, 4, |b| u64::from(u32::from_le_bytes(b))),
            R::F64Load => load!(inst, 8, u64::from_le_bytes),
            R::I32Load8S => load!(inst, 1, |b: [u8; 1]| u64::from(b[0] as i8 as i32 as u32)),
            R::I32Load8U => load!(inst, 1, |b: [u8; 1]| u64::from(b[0])),
            R::I32Load16S => load!(inst, 2, |b| u64::from(i16::from_le_bytes(b) as i32 as u32)),
            R::I32Load16U => load!(inst, 2, |b| u64::from(u16::from_le_bytes(b))),
            R::I64Load8S => load!(inst, 1, |b: [u8; 1]| b[0] as i8 as i64 as u64),
            R::I64Load8U => load!(inst, 1, |b: [u8; 1]| u64::from(b[0])),
            R::I64Load16S => load!(inst, 2, |b| i16::from_le_bytes(b) as i64 as u64),
            R::I64Load16U => load!(inst, 2, |b| u64::from(u16::from_le_bytes(b))),
            R::I64Load32S => load!(inst, 4, |b| i32::from_le_bytes(b) as i64 as u64),
            R::I64Load32U => load!(inst, 4, |b| u64::from(u32::from_le_bytes(b))),
            R::I32Store => store_op!(inst, 4, |v: u64| (v as u32).to_le_bytes()),
            R::I64Store => store_op!(inst, 8, |v: u64| v.to_le_bytes()),
            R::F32Store => store_op!(inst, 4, |v: u64| (v as u32).to_le_bytes()),
            R::F64Store => store_op!(inst, 8, |v: u64| v.to_le_bytes()),
            R::I32Store8 => store_op!(inst, 1, |v: u64| [v as u8]),
            R::I32Store16 => store_op!(inst, 2, |v: u64| (v as u16).to_le_bytes()),
            R::I64Store8 => store_op!(inst, 1, |v: u64| [v as u8]),
            R::I64Store16 => store_op!(inst, 2, |v: u64| (v as u16).to_le_bytes()),
            R::I64Store32 => store_op!(inst, 4, |v: u64| (v as u32).to_le_bytes()),
            R::MemorySize => {
                set!(inst.dst, instance.store.memories[inst.imm as usize].pages());
            }
            R::MemoryGrow => {
                let memory = &mut instance.store.memories[inst.imm as usize];
                let slot = reg!(inst.a);
                let delta = if memory.ty().memory64 {
                    slot
                } else {
                    u64::from(slot as u32)
                };
                let result = match memory.grow(delta) {
                    Some(prior) => prior,
                    None if memory.ty().memory64 => u64::MAX,
                    None => u64::from(u32::MAX),
                };
                set!(inst.dst, result);
            }

            // i32 ALU.
            R::I32Eqz => un32!(inst, |a| u32::from(a == 0)),
            R::I32Eq => cmp32!(inst, |a, b| a == b),
            R::I32Ne => cmp32!(inst, |a, b| a != b),
            R::I32LtS => cmp32!(inst, |a, b| (a as i32) < (b as i32)),
            R::I32LtU => cmp32!(inst, |a, b| a < b),
            R::I32GtS => cmp32!(inst, |a, b| (a as i32) > (b as i32)),
            R::I32GtU => cmp32!(inst, |a, b| a > b),
            R::I32LeS => cmp32!(inst, |a, b| (a as i32) <= (b as i32)),
            R::I32LeU => cmp32!(inst, |a, b| a <= b),
            R::I32GeS => cmp32!(inst, |a, b| (a as i32) >= (b as i32)),
            R::I32GeU => cmp32!(inst, |a, b| a >= b),
            R::I32Clz => un32!(inst, |a| a.leading_zeros()),
            R::I32Ctz => un32!(inst, |a| a.trailing_zeros()),
            R::I32Popcnt => un32!(inst, |a| a.count_ones()),
            R::I32Add => bin32!(inst, |a, b| a.wrapping_add(b)),
            R::I32Sub => bin32!(inst, |a, b| a.wrapping_sub(b)),
            R::I32Mul => bin32!(inst, |a, b| a.wrapping_mul(b)),
            R::I32DivS => bin32!(inst, |a, b| num::i32_div_s(a as i32, b as i32)? as u32),
            R::I32DivU => bin32!(inst, |a, b| num::i32_div_u(a, b)?),
            R::I32RemS => bin32!(inst, |a, b| num::i32_rem_s(a as i32, b as i32)? as u32),
            R::I32RemU => bin32!(inst, |a, b| num::i32_rem_u(a, b)?),
            R::I32And => bin32!(inst, |a, b| a & b),
            R::I32Or => bin32!(inst, |a, b| a | b),
            R::I32Xor => bin32!(inst, |a, b| a ^ b),
            R::I32Shl => bin32!(inst, |a, b| a.wrapping_shl(b)),
            R::I32ShrS => bin32!(inst, |a, b| ((a as i32).wrapping_shr(b)) as u32),
            R::I32ShrU => bin32!(inst, |a, b| a.wrapping_shr(b)),
            R::I32Rotl => bin32!(inst, |a, b| a.rotate_left(b & 31)),
            R::I32Rotr => bin32!(inst, |a, b| a.rotate_right(b & 31)),
            R::I32AddImm => imm32!(inst, |a, b| a.wrapping_add(b)),
            R::I32MulImm => imm32!(inst, |a, b| a.wrapping_mul(b)),
            R::I32AndImm => imm32!(inst, |a, b| a & b),
            R::I32OrImm => imm32!(inst, |a, b| a | b),
            R::I32XorImm => imm32!(inst, |a, b| a ^ b),
            R::I32ShlImm => imm32!(inst, |a, b| a.wrapping_shl(b)),
            R::I32ShrSImm => imm32!(inst, |a, b| ((a as i32).wrapping_shr(b)) as u32),
            R::I32ShrUImm => imm32!(inst, |a, b| a.wrapping_shr(b)),

            // i64 ALU.
            R::I64Eqz => un64!(inst, |a| u64::from(a == 0)),
            R::I64Eq => cmp64!(inst, |a, b| a == b),
            R::I64Ne => cmp64!(inst, |a, b| a != b),
            R::I64LtS => cmp64!(inst, |a, b| (a as i64) < (b as i64)),
            R::I64LtU => cmp64!(inst, |a, b| a < b),
            R::I64GtS => cmp64!(inst, |a, b| (a as i64) > (b as i64)),
            R::I64GtU => cmp64!(inst, |a, b| a > b),
            R::I64LeS => cmp64!(inst, |a, b| (a as i64) <= (b as i64)),
            R::I64LeU => cmp64!(inst, |a, b| a <= b),
            R::I64GeS => cmp64!(inst, |a, b| (a as i64) >= (b as i64)),
            R::I64GeU => cmp64!(inst, |a, b| a >= b),
            R::I64Clz => un64!(inst, |a| u64::from(a.leading_zeros())),
            R::I64Ctz => un64!(inst, |a| u64::from(a.trailing_zeros())),
            R::I64Popcnt => un64!(inst, |a| u64::from(a.count_ones())),
            R::I64Add => bin64!(inst, |a, b| a.wrapping_add(b)),
            R::I64Sub => bin64!(inst, |a, b| a.wrapping_sub(b)),
            R::I64Mul => bin64!(inst, |a, b| a.wrapping_mul(b)),
            R::I64DivS => bin64!(inst, |a, b| num::i64_div_s(a as i64, b as i64)? as u64),
            R::I64DivU => bin64!(inst, |a, b| num::i64_div_u(a, b)?),
            R::I64RemS => bin64!(inst, |a, b| num::i64_rem_s(a as i64, b as i64)? as u64),
            R::I64RemU => bin64!(inst, |a, b| num::i64_rem_u(a, b)?),
            R::I64And => bin64!(inst, |a, b| a & b),
            R::I64Or => bin64!(inst, |a, b| a | b),
            R::I64Xor => bin64!(inst, |a, b| a ^ b),
            R::I64Shl => bin64!(inst, |a, b| a.wrapping_shl(b as u32)),
            R::I64ShrS => bin64!(inst, |a, b| ((a as i64).wrapping_shr(b as u32)) as u64),
            R::I64ShrU => bin64!(inst, |a, b| a.wrapping_shr(b as u32)),
            R::I64Rotl => bin64!(inst, |a, b| a.rotate_left((b & 63) as u32)),
            R::I64Rotr => bin64!(inst, |a, b| a.rotate_right((b & 63) as u32)),
            R::I64AddImm => imm64!(inst, |a, b| a.wrapping_add(b)),
            R::I64AndImm => imm64!(inst, |a, b| a & b),
            R::I64OrImm => imm64!(inst, |a, b| a | b),
            R::I64XorImm => imm64!(inst, |a, b| a ^ b),

            // Floating point.
            R::F32Eq => cmpf32!(inst, |a, b| a == b),
            R::F32Ne => cmpf32!(inst, |a, b| a != b),
            R::F32Lt => cmpf32!(inst, |a, b| a < b),
            R::F32Gt => cmpf32!(inst, |a, b| a > b),
            R::F32Le => cmpf32!(inst, |a, b| a <= b),
            R::F32Ge => cmpf32!(inst, |a, b| a >= b),
            R::F64Eq => cmpf64!(inst, |a, b| a == b),
            R::F64Ne => cmpf64!(inst, |a, b| a != b),
            R::F64Lt => cmpf64!(inst, |a, b| a < b),
            R::F64Gt => cmpf64!(inst, |a, b| a > b),
            R::F64Le => cmpf64!(inst, |a, b| a <= b),
            R::F64Ge => cmpf64!(inst, |a, b| a >= b),
            R::F32Abs => unf32!(inst, |a| a.abs()),
            R::F32Neg => unf32!(inst, |a| -a),
            R::F32Ceil => unf32!(inst, |a| a.ceil()),
            R::F32Floor => unf32!(inst, |a| a.floor()),
            R::F32Trunc => unf32!(inst, |a| a.trunc()),
            R::F32Nearest => unf32!(inst, |a| a.round_ties_even()),
            R::F32Sqrt => unf32!(inst, |a| a.sqrt()),
            R::F32Add => binf32!(inst, |a, b| a + b),
            R::F32Sub => binf32!(inst, |a, b| a - b),
            R::F32Mul => binf32!(inst, |a, b| a * b),
            R::F32Div => binf32!(inst, |a, b| a / b),
            R::F32Min => binf32!(inst, |a, b| num::f32_min(a, b)),
            R::F32Max => binf32!(inst, |a, b| num::f32_max(a, b)),
            R::F32Copysign => binf32!(inst, |a, b| a.copysign(b)),
            R::F64Abs => unf64!(inst, |a| a.abs()),
            R::F64Neg => unf64!(inst, |a| -a),
            R::F64Ceil => unf64!(inst, |a| a.ceil()),
            R::F64Floor => unf64!(inst, |a| a.floor()),
            R::F64Trunc => unf64!(inst, |a| a.trunc()),
            R::F64Nearest => unf64!(inst, |a| a.round_ties_even()),
            R::F64Sqrt => unf64!(inst, |a| a.sqrt()),
            R::F64Add => binf64!(inst, |a, b| a + b),
            R::F64Sub => binf64!(inst, |a, b| a - b),
            R::F64Mul => binf64!(inst, |a, b| a * b),
            R::F64Div => binf64!(inst, |a, b| a / b),
            R::F64Min => binf64!(inst, |a, b| num::f64_min(a, b)),
            R::F64Max => binf64!(inst, |a, b| num::f64_max(a, b)),
            R::F64Copysign => binf64!(inst, |a, b| a.copysign(b)),

            // Conversions.
            R::I32WrapI64 => un64!(inst, |a| u64::from(a as u32)),
            R::I32TruncF32S => {
                let a = f32::from_bits(reg!(inst.a) as u32);
                set!(inst.dst, u64::from(num::i32_trunc_s(f64::from(a))? as u32));
            }
            R::I32TruncF32U => {
                let a = f32::from_bits(reg!(inst.a) as u32);
                set!(inst.dst, u64::from(num::i32_trunc_u(f64::from(a))?));
            }
            R::I32TruncF64S => {
                let a = f64::from_bits(reg!(inst.a));
                set!(inst.dst, u64::from(num::i32_trunc_s(a)? as u32));
            }
            R::I32TruncF64U => {
                let a = f64::from_bits(reg!(inst.a));
                set!(inst.dst, u64::from(num::i32_trunc_u(a)?));
            }
            R::I64ExtendI32S => un64!(inst, |a| a as u32 as i32 as i64 as u64),
            R::I64ExtendI32U => un64!(inst, |a| u64::from(a as u32)),
            R::I64TruncF32S => {
                let a = f32::from_bits(reg!(inst.a) as u32);
                set!(inst.dst, num::i64_trunc_s(f64::from(a))? as u64);
            }
            R::I64TruncF32U => {
                let a = f32::from_bits(reg!(inst.a) as u32);
                set!(inst.dst, num::i64_trunc_u(f64::from(a))?);
            }
            R::I64TruncF64S => {
                let a = f64::from_bits(reg!(inst.a));
                set!(inst.dst, num::i64_trunc_s(a)? as u64);
            }
            R::I64TruncF64U => {
                let a = f64::from_bits(reg!(inst.a));
                set!(inst.dst, num::i64_trunc_u(a)?);
            }
            R::F32ConvertI32S => un32!(inst, |a| ((a as i32) as f32).to_bits()),
            R::F32ConvertI32U => un32!(inst, |a| (a as f32).to_bits()),
            R::F32ConvertI64S => {
                let a = reg!(inst.a) as i64;
                set!(inst.dst, u64::from((a as f32).to_bits()));
            }
            R::F32ConvertI64U => {
                let a = reg!(inst.a);
                set!(inst.dst, u64::from((a as f32).to_bits()));
            }
            R::F32DemoteF64 => {
                let a = f64::from_bits(reg!(inst.a));
                set!(inst.dst, u64::from((a as f32).to_bits()));
            }
            R::F64ConvertI32S => {
                let a = reg!(inst.a) as u32 as i32;
                set!(inst.dst, f64::from(a).to_bits());
            }
            R::F64ConvertI32U => {
                let a = reg!(inst.a) as u32;
                set!(inst.dst, f64::from(a).to_bits());
            }
            R::F64ConvertI64S => {
                let a = reg!(inst.a) as i64;
                set!(inst.dst, (a as f64).to_bits());
            }
            R::F64ConvertI64U => {
                let a = reg!(inst.a);
                set!(inst.dst, (a as f64).to_bits());
            }
            R::F64PromoteF32 => {
                let a = f32::from_bits(reg!(inst.a) as u32);
                set!(inst.dst, f64::from(a).to_bits());
            }
            R::I32Extend8S => un32!(inst, |a| a as u8 as i8 as i32 as u32),
            R::I32Extend16S => un32!(inst, |a| a as u16 as i16 as i32 as u32),
            R::I64Extend8S => un64!(inst, |a| a as u8 as i8 as i64 as u64),
            R::I64Extend16S => un64!(inst, |a| a as u16 as i16 as i64 as u64),
            R::I64Extend32S => un64!(inst, |a| a as u32 as i32 as i64 as u64),
            R::I32TruncSatF32S => {
                let a = f32::from_bits(reg!(inst.a) as u32);
                set!(inst.dst, u64::from((a as i32) as u32));
            }
            R::I32TruncSatF32U => {
                let a = f32::from_bits(reg!(inst.a) as u32);
                set!(inst.dst, u64::from(a as u32));
            }
            R::I32TruncSatF64S => {
                let a = f64::from_bits(reg!(inst.a));
                set!(inst.dst, u64::from((a as i32) as u32));
            }
            R::I32TruncSatF64U => {
                let a = f64::from_bits(reg!(inst.a));
                set!(inst.dst, u64::from(a as u32));
            }
            R::I64TruncSatF32S => {
                let a = f32::from_bits(reg!(inst.a) as u32);
                set!(inst.dst, (a as i64) as u64);
            }
            R::I64TruncSatF32U => {
                let a = f32::from_bits(reg!(inst.a) as u32);
                set!(inst.dst, a as u64);
            }
            R::I64TruncSatF64S => {
                let a = f64::from_bits(reg!(inst.a));
                set!(inst.dst, (a as i64) as u64);
            }
            R::I64TruncSatF64U => {
                let a = f64::from_bits(reg!(inst.a));
                set!(inst.dst, a as u64);
            }
        }
    }
}
