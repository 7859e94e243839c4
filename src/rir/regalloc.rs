// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Linear-scan register allocation over RIR virtual registers.
//!
//! Intervals are computed from defs and uses, extended across loop
//! back-edges so a value is never clobbered mid-iteration. Intervals that
//! cross a call site are placed in callee-saved registers or spilled —
//! never in a caller-saved register. Ties between intervals starting at the
//! same instruction break on first-use position. Every value holds one
//! location for its whole lifetime (register or frame spill slot); the
//! spill map lets the interpreter reconstruct values from JIT frames on
//! deoptimization.
//!
//! All values, floats included, are allocated from the integer bank; the
//! backends move operands through reserved vector scratch registers for
//! float operations.

use super::{RirFunction, RirInst, RirOp};

/// The physical registers a backend exposes to the allocator, as
/// backend-specific encodings.
#[derive(Clone, Copy, Debug)]
pub(crate) struct IsaRegisters {
    /// Clobbered by calls; usable for intervals that cross none.
    pub caller_saved: &'static [u8],
    /// Preserved across calls; the prologue saves those actually used.
    pub callee_saved: &'static [u8],
}

/// x86_64 System-V: rax/rdx are division scratch, r12/r13 hold the context
/// and memory base, rbp/rsp frame. Remaining volatiles plus rbx/r14/r15.
pub(crate) const X86_64_REGS: IsaRegisters = IsaRegisters {
    caller_saved: &[1, 6, 7, 8, 9, 10, 11], // rcx, rsi, rdi, r8-r11
    callee_saved: &[3, 14, 15],             // rbx, r14, r15
};

/// ARM64: x26/x27 hold the memory base and context, x0-x8 and x16/x17 are
/// call/scratch registers.
pub(crate) const ARM64_REGS: IsaRegisters = IsaRegisters {
    caller_saved: &[9, 10, 11, 12, 13, 14, 15],
    callee_saved: &[19, 20, 21, 22, 23, 24, 25],
};

/// Where a virtual register lives for its whole lifetime.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Loc {
    Reg(u8),
    /// Index of a frame spill slot (8 bytes each).
    Spill(u32),
}

/// The allocator's output for one function.
#[derive(Clone, Debug)]
pub(crate) struct Allocation {
    /// Location per virtual register.
    pub locs: Vec<Loc>,
    pub num_spill_slots: u32,
    /// (vreg, spill slot) pairs, for deopt reconstruction.
    pub spill_map: Vec<(u16, u32)>,
    /// Callee-saved registers handed out; the prologue must preserve them.
    pub used_callee_saved: Vec<u8>,
}

#[derive(Clone, Copy, Debug)]
struct Interval {
    vreg: u16,
    start: u32,
    end: u32,
    first_use: u32,
    crosses_call: bool,
}

// Collects (defs, uses) of one instruction into the callback.
fn visit_operands(
    function: &RirFunction,
    inst: &RirInst,
    mut def: impl FnMut(u16),
    mut used: impl FnMut(u16),
) {
    use RirOp as R;
    match inst.op {
        R::Nop | R::Unreachable | R::Br => {}
        R::Move => {
            used(inst.a);
            def(inst.dst);
        }
        R::Const32 | R::Const64 | R::GlobalGet | R::MemorySize => def(inst.dst),
        R::BrIfZero | R::BrIfNonZero | R::BrTable | R::GlobalSet => used(inst.a),
        R::BrCmpI32 | R::BrCmpI64 => {
            used(inst.a);
            used(inst.b);
        }
        R::Ret => {
            for &reg in &function.lists[inst.a as usize] {
                used(reg);
            }
        }
        R::Call | R::CallIndirect | R::ReturnCall | R::ReturnCallIndirect => {
            let site = &function.calls[inst.imm as usize];
            for &reg in &site.args {
                used(reg);
            }
            if matches!(inst.op, R::CallIndirect | R::ReturnCallIndirect) {
                used(site.addr);
            }
            for &reg in &site.rets {
                def(reg);
            }
        }
        R::Select => {
            used(inst.a);
            used(inst.b);
            used(inst.imm as u16);
            def(inst.dst);
        }
        R::MemoryGrow => {
            used(inst.a);
            def(inst.dst);
        }
        // Loads define, stores only use.
        R::I32Load | R::I64Load | R::F32Load | R::F64Load | R::I32Load8S | R::I32Load8U
        | R::I32Load16S | R::I32Load16U | R::I64Load8S | R::I64Load8U | R::I64Load16S
        | R::I64Load16U | R::I64Load32S | R::I64Load32U => {
            used(inst.a);
            def(inst.dst);
        }
        R::I32Store | R::I64Store | R::F32Store | R::F64Store | R::I32Store8 | R::I32Store16
        | R::I64Store8 | R::I64Store16 | R::I64Store32 => {
            used(inst.a);
            used(inst.b);
        }
        // Immediate-form and unary ALU ops read `a` only.
        R::I32AddImm | R::I32MulImm | R::I32AndImm | R::I32OrImm | R::I32XorImm | R::I32ShlImm
        | R::I32ShrSImm | R::I32ShrUImm | R::I64AddImm | R::I64AndImm | R::I64OrImm
        | R::I64XorImm | R::I32Eqz | R::I64Eqz | R::I32Clz | R::I32Ctz | R::I32Popcnt
        | R::I64Clz | R::I64Ctz | R::I64Popcnt | R::F32Abs | R::F32Neg | R::F32Ceil
        | R::F32Floor | R::F32Trunc | R::F32Nearest | R::F32Sqrt | R::F64Abs | R::F64Neg
        | R::F64Ceil | R::F64Floor | R::F64Trunc | R::F64Nearest | R::F64Sqrt
        | R::I32WrapI64 | R::I32TruncF32S | R::I32TruncF32U | R::I32TruncF64S
        | R::I32TruncF64U | R::I64ExtendI32S | R::I64ExtendI32U | R::I64TruncF32S
        | R::I64TruncF32U | R::I64TruncF64S | R::I64TruncF64U | R::F32ConvertI32S
        | R::F32ConvertI32U | R::F32ConvertI64S | R::F32ConvertI64U | R::F32DemoteF64
        | R::F64ConvertI32S | R::F64ConvertI32U | R::F64ConvertI64S | R::F64ConvertI64U
        | R::F64PromoteF32 | R::I32Extend8S | R::I32Extend16S | R::I64Extend8S
        | R::I64Extend16S | R::I64Extend32S | R::I32TruncSatF32S | R::I32TruncSatF32U
        | R::I32TruncSatF64S | R::I32TruncSatF64U | R::I64TruncSatF32S | R::I64TruncSatF32U
        | R::I64TruncSatF64S | R::I64TruncSatF64U => {
            used(inst.a);
            def(inst.dst);
        }
        // Everything else is a two-operand ALU op.
        _ => {
            used(inst.a);
            used(inst.b);
            def(inst.dst);
        }
    }
}

fn compute_intervals(function: &RirFunction) -> Vec<Interval> {
    const UNSEEN: u32 = u32::MAX;
    let n = function.num_regs as usize;
    let start: Vec<std::cell::Cell<u32>> = vec![std::cell::Cell::new(UNSEEN); n];
    let end: Vec<std::cell::Cell<u32>> = vec![std::cell::Cell::new(0u32); n];
    let first_use: Vec<std::cell::Cell<u32>> = vec![std::cell::Cell::new(UNSEEN); n];

    // Locals (parameters and zero-initialized declarations) are defined at
    // entry.
    for vreg in 0..function.num_locals as usize {
        start[vreg].set(0);
    }

    for (pc, inst) in function.insts.iter().enumerate() {
        let pc = pc as u32;
        visit_operands(
            function,
            inst,
            |def| {
                let slot = def as usize;
                if start[slot].get() == UNSEEN {
                    start[slot].set(pc);
                }
                end[slot].set(end[slot].get().max(pc));
            },
            |used| {
                let slot = used as usize;
                if start[slot].get() == UNSEEN {
                    start[slot].set(pc);
                }
                if first_use[slot].get() == UNSEEN {
                    first_use[slot].set(pc);
                }
                end[slot].set(end[slot].get().max(pc));
            },
        );
    }

    let mut start: Vec<u32> = start.into_iter().map(std::cell::Cell::into_inner).collect();
    let mut end: Vec<u32> = end.into_iter().map(std::cell::Cell::into_inner).collect();
    let first_use: Vec<u32> = first_use
        .into_iter()
        .map(std::cell::Cell::into_inner)
        .collect();

    // Extend across loop back-edges: anything live anywhere inside a loop
    // stays live through the jump that restarts it.
    for (pc, inst) in function.insts.iter().enumerate() {
        let pc = pc as u32;
        let is_back_edge = matches!(
            inst.op,
            RirOp::Br | RirOp::BrIfZero | RirOp::BrIfNonZero | RirOp::BrCmpI32 | RirOp::BrCmpI64
        ) && inst.imm <= pc;
        if !is_back_edge {
            continue;
        }
        let head = inst.imm;
        for vreg in 0..n {
            if start[vreg] != UNSEEN && start[vreg] <= pc && end[vreg] >= head {
                end[vreg] = end[vreg].max(pc);
            }
        }
    }

    // Anything lowered to a helper call clobbers the caller-saved set.
    let call_pcs: Vec<u32> = function
        .insts
        .iter()
        .enumerate()
        .filter(|(_, inst)| {
            matches!(
                inst.op,
                RirOp::Call
                    | RirOp::CallIndirect
                    | RirOp::MemoryGrow
                    | RirOp::GlobalGet
                    | RirOp::GlobalSet
            )
        })
        .map(|(pc, _)| pc as u32)
        .collect();

    let mut intervals: Vec<Interval> = (0..n)
        .filter(|&vreg| start[vreg] != UNSEEN)
        .map(|vreg| {
            let crosses_call = call_pcs
                .iter()
                .any(|&call| start[vreg] < call && end[vreg] > call);
            Interval {
                vreg: vreg as u16,
                start: start[vreg],
                end: end[vreg],
                first_use: first_use[vreg].min(end[vreg]),
                crosses_call,
            }
        })
        .collect();
    intervals.sort_by_key(|iv| (iv.start, iv.first_use, iv.vreg));
    intervals
}

/// Runs linear scan for the given register file.
pub(crate) fn allocate(function: &RirFunction, isa: IsaRegisters) -> Allocation {
    let intervals = compute_intervals(function);
    let mut locs = vec![Loc::Spill(0); function.num_regs as usize];
    let mut active: Vec<(u32, u8)> = Vec::new(); // (end, reg)
    let mut free_caller: Vec<u8> = isa.caller_saved.to_vec();
    let mut free_callee: Vec<u8> = isa.callee_saved.to_vec();
    let mut used_callee_saved = Vec::new();
    let mut num_spill_slots = 0u32;
    let mut spill_map = Vec::new();

    for interval in &intervals {
        // Expire finished intervals.
        active.retain(|&(end, reg)| {
            if end < interval.start {
                if isa.callee_saved.contains(&reg) {
                    free_callee.push(reg);
                } else {
                    free_caller.push(reg);
                }
                false
            } else {
                true
            }
        });

        // A value live across a call is never left in a caller-saved
        // register; callee-saved or the frame.
        let choice = if interval.crosses_call {
            free_callee.pop()
        } else {
            free_caller.pop().or_else(|| free_callee.pop())
        };
        match choice {
            Some(reg) => {
                if isa.callee_saved.contains(&reg) && !used_callee_saved.contains(&reg) {
                    used_callee_saved.push(reg);
                }
                locs[interval.vreg as usize] = Loc::Reg(reg);
                active.push((interval.end, reg));
            }
            None => {
                let slot = num_spill_slots;
                num_spill_slots += 1;
                locs[interval.vreg as usize] = Loc::Spill(slot);
                spill_map.push((interval.vreg, slot));
            }
        }
    }

    Allocation {
        locs,
        num_spill_slots,
        spill_map,
        used_callee_saved,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pir::build_pir;
    use crate::rir::build_rir;
    use crate::types::{
        CompositeType, FuncBody, FuncIdx, FuncType, ModuleInner, SubType, TypeIdx, ValType,
    };

    fn rir_for(body: &[u8], params: Vec<ValType>, results: Vec<ValType>) -> RirFunction {
        let mut module = ModuleInner {
            types: vec![SubType {
                is_final: true,
                supertypes: Vec::new(),
                composite: CompositeType::Func(FuncType { params, results }),
                rec_group_start: 0,
                rec_group_len: 1,
            }],
            functions: vec![TypeIdx::new(0)],
            ..Default::default()
        };
        module.canonicalize_types();
        let body = FuncBody {
            locals: Vec::new(),
            bytecode: body.into(),
            offset: 0,
        };
        let pir = build_pir(&module, FuncIdx::new(0), &body).unwrap();
        build_rir(&module, &pir).unwrap()
    }

    #[test]
    fn straight_line_gets_registers() {
        // (i32, i32) -> i32: local.get 0; local.get 1; i32.add; end
        let rir = rir_for(
            &[0x20, 0x00, 0x20, 0x01, 0x6a, 0x0b],
            vec![ValType::I32, ValType::I32],
            vec![ValType::I32],
        );
        let alloc = allocate(&rir, X86_64_REGS);
        assert_eq!(alloc.num_spill_slots, 0);
        for vreg in 0..rir.num_regs {
            assert!(matches!(alloc.locs[vreg as usize], Loc::Reg(_)));
        }
    }

    #[test]
    fn call_crossing_value_avoids_caller_saved() {
        // (i32) -> i32: local.get 0; call 0; local.get 0; i32.add; end
        // Local 0 is live across the call.
        let rir = rir_for(
            &[0x20, 0x00, 0x10, 0x00, 0x20, 0x00, 0x6a, 0x0b],
            vec![ValType::I32],
            vec![ValType::I32],
        );
        let alloc = allocate(&rir, X86_64_REGS);
        match alloc.locs[0] {
            Loc::Reg(reg) => assert!(
                X86_64_REGS.callee_saved.contains(&reg),
                "call-crossing local landed in caller-saved r{reg}"
            ),
            Loc::Spill(_) => {}
        }
    }

    #[test]
    fn spills_when_pressure_exceeds_registers() {
        // Push 16 constants, then sum them: more simultaneously-live values
        // than allocatable registers.
        let mut body = Vec::new();
        for i in 0..16 {
            body.extend_from_slice(&[0x41, i]);
        }
        for _ in 0..15 {
            body.push(0x6a);
        }
        body.push(0x0b);
        let rir = rir_for(&body, vec![], vec![ValType::I32]);
        let alloc = allocate(&rir, X86_64_REGS);
        assert!(alloc.num_spill_slots > 0);
        // The spill map names every spilled vreg exactly once.
        for (vreg, slot) in &alloc.spill_map {
            assert_eq!(alloc.locs[*vreg as usize], Loc::Spill(*slot));
        }
    }

    #[test]
    fn loop_carried_values_stay_live() {
        // (i32) -> i32 loop: decrements local 0 until zero.
        // loop; local.get 0; i32.const 1; i32.sub; local.tee 0; br_if 0;
        // end; local.get 0; end
        let rir = rir_for(
            &[
                0x03, 0x40, 0x20, 0x00, 0x41, 0x01, 0x6b, 0x22, 0x00, 0x0d, 0x00, 0x0b, 0x20,
                0x00, 0x0b,
            ],
            vec![ValType::I32],
            vec![ValType::I32],
        );
        let alloc = allocate(&rir, ARM64_REGS);
        // Local 0 must have a location covering the whole loop.
        assert!(matches!(alloc.locs[0], Loc::Reg(_) | Loc::Spill(_)));
    }
}
