// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! ARM64 backend.
//!
//! Emits AAPCS64 native code from allocated RIR. Register conventions: x27
//! holds the context, x26 the linear-memory base, x16/x17/x8 are scratch;
//! the allocator hands out x9-x15 and x19-x25. Frames are sp-based with
//! positive scaled offsets: the outgoing-argument area at the bottom, the
//! saved argument pointer above it, spill slots on top.
//!
//! Division has no trapping form here, so the divisor-first checks are
//! explicit compare-and-branch sequences into the shared trap stubs, which
//! keeps the trap order identical to the interpreter's.

use super::{
    CTX_CALL_HELPER, CTX_DEPTH, CTX_FRAME_BASE, CTX_FUEL, CTX_GLOBAL_GET_HELPER,
    CTX_GLOBAL_SET_HELPER, CTX_GROW_HELPER, CTX_INDIRECT_HELPER, CTX_MEMORY_BASE,
    CTX_MEMORY_SIZE, CompileError, EmittedCode, FuncLayout, TRAP_DIV_ZERO, TRAP_FUEL,
    TRAP_INT_OVERFLOW, TRAP_OOB, TRAP_STACK_OVERFLOW, TRAP_UNREACHABLE,
};
use crate::rir::regalloc::{Allocation, Loc};
use crate::rir::{Cond, RirFunction, RirInst, RirOp};
use crate::runtime::MAX_CALL_DEPTH;

const SP: u8 = 31;
const XZR: u8 = 31;
const T0: u8 = 16;
const T1: u8 = 17;
const T2: u8 = 8;
const CTX: u8 = 27;
const MEM: u8 = 26;

// b.cond condition encodings for "branch when the comparison holds".
fn cc_of(cond: Cond) -> u8 {
    match cond {
        Cond::Eq => 0x0,
        Cond::Ne => 0x1,
        Cond::LtS => 0xb,
        Cond::LtU => 0x3,
        Cond::GtS => 0xc,
        Cond::GtU => 0x8,
        Cond::LeS => 0xd,
        Cond::LeU => 0x9,
        Cond::GeS => 0xa,
        Cond::GeU => 0x2,
    }
}

struct Asm {
    code: Vec<u8>,
}

impl Asm {
    fn new() -> Self {
        Self {
            code: Vec::with_capacity(1024),
        }
    }

    fn here(&self) -> u32 {
        self.code.len() as u32
    }

    fn word(&mut self, word: u32) {
        self.code.extend_from_slice(&word.to_le_bytes());
    }

    // mov xd <- xm (orr xd, xzr, xm).
    fn mov_rr(&mut self, dst: u8, src: u8) {
        if dst == src {
            return;
        }
        self.word(0xaa00_03e0 | u32::from(src) << 16 | u32::from(dst));
    }

    // mov wd <- wm, zero-extending.
    fn mov_ww(&mut self, dst: u8, src: u8) {
        self.word(0x2a00_03e0 | u32::from(src) << 16 | u32::from(dst));
    }

    // xd <- a 64-bit immediate, via movz/movk.
    fn mov_ri(&mut self, dst: u8, value: u64) {
        let chunks = [
            (value & 0xffff) as u32,
            ((value >> 16) & 0xffff) as u32,
            ((value >> 32) & 0xffff) as u32,
            ((value >> 48) & 0xffff) as u32,
        ];
        // movz with the first chunk (zeroing the rest), movk the others.
        self.word(0xd280_0000 | chunks[0] << 5 | u32::from(dst));
        for (hw, &chunk) in chunks.iter().enumerate().skip(1) {
            if chunk != 0 {
                self.word(
                    0xf280_0000 | (hw as u32) << 21 | chunk << 5 | u32::from(dst),
                );
            }
        }
    }

    // ldr xd, [xn, #disp] (disp a multiple of 8, unsigned).
    fn load(&mut self, dst: u8, base: u8, disp: u32) {
        debug_assert_eq!(disp % 8, 0);
        self.word(0xf940_0000 | (disp / 8) << 10 | u32::from(base) << 5 | u32::from(dst));
    }

    // str xs, [xn, #disp].
    fn store(&mut self, src: u8, base: u8, disp: u32) {
        debug_assert_eq!(disp % 8, 0);
        self.word(0xf900_0000 | (disp / 8) << 10 | u32::from(base) << 5 | u32::from(src));
    }

    // stp pre-index [sp, #-16]!.
    fn push_pair(&mut self, rt: u8, rt2: u8) {
        self.word(0xa9bf_0000 | u32::from(rt2) << 10 | u32::from(SP) << 5 | u32::from(rt));
    }

    // ldp post-index [sp], #16.
    fn pop_pair(&mut self, rt: u8, rt2: u8) {
        self.word(0xa8c1_0000 | u32::from(rt2) << 10 | u32::from(SP) << 5 | u32::from(rt));
    }

    fn add_imm(&mut self, dst: u8, src: u8, imm: u32) {
        debug_assert!(imm < 4096);
        self.word(0x9100_0000 | imm << 10 | u32::from(src) << 5 | u32::from(dst));
    }

    fn sub_imm(&mut self, dst: u8, src: u8, imm: u32) {
        debug_assert!(imm < 4096);
        self.word(0xd100_0000 | imm << 10 | u32::from(src) << 5 | u32::from(dst));
    }

    // cmp xn, xm / cmp wn, wm.
    fn cmp_rr(&mut self, wide: bool, a: u8, b: u8) {
        let base = if wide { 0xeb00_001f } else { 0x6b00_001f };
        self.word(base | u32::from(b) << 16 | u32::from(a) << 5);
    }

    // cmp xn, #imm12.
    fn cmp_imm(&mut self, wide: bool, a: u8, imm: u32) {
        debug_assert!(imm < 4096);
        let base = if wide { 0xf100_001f } else { 0x7100_001f };
        self.word(base | imm << 10 | u32::from(a) << 5);
    }

    fn b(&mut self) -> u32 {
        let at = self.here();
        self.word(0x1400_0000);
        at
    }

    fn b_cond(&mut self, cond: u8) -> u32 {
        let at = self.here();
        self.word(0x5400_0000 | u32::from(cond));
        at
    }

    fn cbz(&mut self, wide: bool, reg: u8) -> u32 {
        let at = self.here();
        let base = if wide { 0xb400_0000 } else { 0x3400_0000 };
        self.word(base | u32::from(reg));
        at
    }

    fn cbnz(&mut self, wide: bool, reg: u8) -> u32 {
        let at = self.here();
        let base = if wide { 0xb500_0000 } else { 0x3500_0000 };
        self.word(base | u32::from(reg));
        at
    }

    fn blr(&mut self, reg: u8) {
        self.word(0xd63f_0000 | u32::from(reg) << 5);
    }

    fn ret(&mut self) {
        self.word(0xd65f_03c0);
    }

    fn patch(&mut self, at: u32, target: u32) {
        let rel_words = (i64::from(target) - i64::from(at)) / 4;
        let index = at as usize;
        let mut word = u32::from_le_bytes(self.code[index..index + 4].try_into().unwrap());
        match word >> 24 {
            // b: imm26.
            0x14 => word |= (rel_words as u32) & 0x03ff_ffff,
            // b.cond, cbz/cbnz: imm19 at bit 5.
            _ => word |= ((rel_words as u32) & 0x7_ffff) << 5,
        }
        self.code[index..index + 4].copy_from_slice(&word.to_le_bytes());
    }
}

#[derive(Clone, Copy)]
enum Place {
    Reg(u8),
    // sp-relative byte offset.
    Frame(u32),
}

struct Emitter<'a> {
    asm: Asm,
    rir: &'a RirFunction,
    layout: &'a FuncLayout,
    places: Vec<Place>,
    out_area: u32,
    args_slot: u32,
    frame_size: u32,
    block_offsets: Vec<u32>,
    branch_fixups: Vec<(u32, u32)>,
    exit_fixups: Vec<(u32, Stub)>,
    restart: u32,
    deopt: Vec<(u32, u32)>,
}

#[derive(Clone, Copy, Eq, PartialEq)]
enum Stub {
    CommonExit,
    Oob,
    DivZero,
    IntOverflow,
    Fuel,
    StackOverflow,
    Unreachable,
}

pub(crate) fn emit(
    rir: &RirFunction,
    alloc: &Allocation,
    layout: &FuncLayout,
) -> Result<EmittedCode, CompileError> {
    check_coverage(rir, layout)?;

    let out_slots = out_area_slots(rir);
    let spill_bytes = alloc.num_spill_slots * 8;
    let mut frame = out_slots * 8 + 8 + spill_bytes;
    frame = frame.div_ceil(16) * 16;
    if frame >= 4096 {
        return Err(CompileError::Unsupported);
    }

    let args_slot = out_slots * 8;
    let places = (0..rir.num_regs)
        .map(|vreg| match alloc.locs[vreg as usize] {
            Loc::Reg(reg) => Place::Reg(reg),
            Loc::Spill(slot) => Place::Frame(args_slot + 8 + slot * 8),
        })
        .collect();

    let emitter = Emitter {
        asm: Asm::new(),
        rir,
        layout,
        places,
        out_area: 0,
        args_slot,
        frame_size: frame,
        block_offsets: vec![0; rir.insts.len()],
        branch_fixups: Vec::new(),
        exit_fixups: Vec::new(),
        restart: 0,
        deopt: Vec::new(),
    };
    emitter.emit_function()
}

fn out_area_slots(rir: &RirFunction) -> u32 {
    let mut slots = rir.param_count.max(rir.result_count) as u32;
    for site in &rir.calls {
        slots = slots.max(site.args.len().max(site.rets.len()) as u32);
    }
    slots.max(1)
}

fn check_coverage(rir: &RirFunction, layout: &FuncLayout) -> Result<(), CompileError> {
    use RirOp as R;
    for inst in &rir.insts {
        match inst.op {
            R::F32Eq | R::F32Ne | R::F32Lt | R::F32Gt | R::F32Le | R::F32Ge | R::F64Eq
            | R::F64Ne | R::F64Lt | R::F64Gt | R::F64Le | R::F64Ge | R::F32Min | R::F32Max
            | R::F64Min | R::F64Max | R::F32Ceil | R::F32Floor | R::F32Trunc | R::F32Nearest
            | R::F64Ceil | R::F64Floor | R::F64Trunc | R::F64Nearest | R::F32Copysign
            | R::F64Copysign | R::I32TruncF32S | R::I32TruncF32U | R::I32TruncF64S
            | R::I32TruncF64U | R::I64TruncF32S | R::I64TruncF32U | R::I64TruncF64S
            | R::I64TruncF64U | R::I32TruncSatF32S | R::I32TruncSatF32U | R::I32TruncSatF64S
            | R::I32TruncSatF64U | R::I64TruncSatF32S | R::I64TruncSatF32U
            | R::I64TruncSatF64S | R::I64TruncSatF64U | R::F32ConvertI32S | R::F32ConvertI32U
            | R::F32ConvertI64S | R::F32ConvertI64U | R::F64ConvertI32S | R::F64ConvertI32U
            | R::F64ConvertI64S | R::F64ConvertI64U => return Err(CompileError::Unsupported),
            R::ReturnCall => {
                let site = &rir.calls[inst.imm as usize];
                if site.target != layout.func_index {
                    return Err(CompileError::Unsupported);
                }
            }
            R::ReturnCallIndirect => return Err(CompileError::Unsupported),
            _ => {}
        }
    }
    Ok(())
}

impl Emitter<'_> {
    fn place(&self, vreg: u16) -> Place {
        self.places[vreg as usize]
    }

    fn value_in(&mut self, vreg: u16, scratch: u8) -> u8 {
        match self.place(vreg) {
            Place::Reg(reg) => reg,
            Place::Frame(disp) => {
                self.asm.load(scratch, SP, disp);
                scratch
            }
        }
    }

    fn value_into(&mut self, vreg: u16, dst: u8) {
        match self.place(vreg) {
            Place::Reg(reg) => self.asm.mov_rr(dst, reg),
            Place::Frame(disp) => self.asm.load(dst, SP, disp),
        }
    }

    fn store_result(&mut self, vreg: u16, src: u8) {
        match self.place(vreg) {
            Place::Reg(reg) => self.asm.mov_rr(reg, src),
            Place::Frame(disp) => self.asm.store(src, SP, disp),
        }
    }

    fn jump_to_stub(&mut self, stub: Stub) {
        let at = self.asm.b();
        self.exit_fixups.push((at, stub));
    }

    fn bcond_to_stub(&mut self, cond: u8, stub: Stub) {
        let at = self.asm.b_cond(cond);
        self.exit_fixups.push((at, stub));
    }

    fn branch_to(&mut self, target_rir: u32) {
        let at = self.asm.b();
        self.branch_fixups.push((at, target_rir));
    }

    fn bcond_to(&mut self, cond: u8, target_rir: u32) {
        let at = self.asm.b_cond(cond);
        self.branch_fixups.push((at, target_rir));
    }

    fn burn_fuel(&mut self) {
        self.asm.load(T0, CTX, CTX_FUEL);
        self.asm.load(T1, T0, 0);
        // subs x17, x17, #1
        self.asm.word(0xf100_0400 | u32::from(T1) << 5 | u32::from(T1));
        self.asm.store(T1, T0, 0);
        self.bcond_to_stub(0x4, Stub::Fuel); // b.mi
    }

    fn emit_function(mut self) -> Result<EmittedCode, CompileError> {
        // external entry: x0 = ctx.
        self.asm.load(1, 0, CTX_FRAME_BASE);
        let entry_jump = self.asm.b();

        // internal entry: x0 = ctx, x1 = args.
        let internal = self.asm.here();
        self.asm.patch(entry_jump, internal);

        self.asm.push_pair(29, 30);
        // mov x29, sp
        self.asm.word(0x9100_03fd);
        for (a, b) in [(19u8, 20u8), (21, 22), (23, 24), (25, 26), (27, 28)] {
            self.asm.push_pair(a, b);
        }
        self.asm.sub_imm(SP, SP, self.frame_size);

        self.asm.mov_rr(CTX, 0);
        self.asm.store(1, SP, self.args_slot);

        // Depth bound.
        self.asm.load(T0, CTX, CTX_DEPTH);
        self.asm.add_imm(T0, T0, 1);
        self.asm.store(T0, CTX, CTX_DEPTH);
        self.asm.cmp_imm(true, T0, MAX_CALL_DEPTH as u32);
        self.bcond_to_stub(0x8, Stub::StackOverflow); // b.hi

        self.asm.load(MEM, CTX, CTX_MEMORY_BASE);

        // Stage incoming args into the out area.
        for i in 0..self.rir.param_count as u32 {
            self.asm.load(T0, 1, i * 8);
            self.asm.store(T0, SP, self.out_area + i * 8);
        }

        self.restart = self.asm.here();
        for i in 0..self.rir.param_count {
            self.asm.load(T0, SP, self.out_area + u32::from(i) * 8);
            self.store_result(i, T0);
        }
        for vreg in self.rir.param_count..self.rir.num_locals {
            self.store_result(vreg, XZR);
        }
        self.burn_fuel();

        for pc in 0..self.rir.insts.len() {
            self.block_offsets[pc] = self.asm.here();
            self.deopt.push((self.asm.here(), pc as u32));
            let inst = self.rir.insts[pc];
            self.emit_inst(pc as u32, inst)?;
        }

        // Stubs and the common exit.
        let mut stub_offsets = Vec::new();
        for (stub, code) in [
            (Stub::Unreachable, TRAP_UNREACHABLE),
            (Stub::DivZero, TRAP_DIV_ZERO),
            (Stub::IntOverflow, TRAP_INT_OVERFLOW),
            (Stub::Oob, TRAP_OOB),
            (Stub::Fuel, TRAP_FUEL),
            (Stub::StackOverflow, TRAP_STACK_OVERFLOW),
        ] {
            stub_offsets.push((stub, self.asm.here()));
            self.asm.mov_ri(0, code as u64);
            let at = self.asm.b();
            self.exit_fixups.push((at, Stub::CommonExit));
        }

        let common_exit = self.asm.here();
        self.asm.load(T0, CTX, CTX_DEPTH);
        self.asm.sub_imm(T0, T0, 1);
        self.asm.store(T0, CTX, CTX_DEPTH);
        self.asm.add_imm(SP, SP, self.frame_size);
        for (a, b) in [(27u8, 28u8), (25, 26), (23, 24), (21, 22), (19, 20)] {
            self.asm.pop_pair(a, b);
        }
        self.asm.pop_pair(29, 30);
        self.asm.ret();

        let oob_stub = stub_offsets
            .iter()
            .find(|(stub, _)| *stub == Stub::Oob)
            .map(|&(_, offset)| offset)
            .expect("oob stub emitted");
        for (at, stub) in std::mem::take(&mut self.exit_fixups) {
            let target = match stub {
                Stub::CommonExit => common_exit,
                other => {
                    stub_offsets
                        .iter()
                        .find(|(stub, _)| *stub == other)
                        .expect("all stubs emitted")
                        .1
                }
            };
            self.asm.patch(at, target);
        }
        for (at, target_rir) in std::mem::take(&mut self.branch_fixups) {
            let target = self.block_offsets[target_rir as usize];
            self.asm.patch(at, target);
        }

        Ok(EmittedCode {
            code: self.asm.code,
            oob_stub,
            deopt: self.deopt,
        })
    }

    fn emit_inst(&mut self, pc: u32, inst: RirInst) -> Result<(), CompileError> {
        use RirOp as R;

        match inst.op {
            R::Nop => {}
            R::Unreachable => self.jump_to_stub(Stub::Unreachable),
            R::Move => {
                let src = self.value_in(inst.a, T0);
                self.store_result(inst.dst, src);
            }
            R::Const32 => {
                self.asm.mov_ri(T0, u64::from(inst.imm));
                self.store_result(inst.dst, T0);
            }
            R::Const64 => {
                self.asm.mov_ri(T0, self.rir.wide[inst.imm as usize]);
                self.store_result(inst.dst, T0);
            }

            R::Br => {
                if inst.imm <= pc {
                    self.burn_fuel();
                }
                self.branch_to(inst.imm);
            }
            R::BrIfZero | R::BrIfNonZero => {
                self.burn_fuel();
                let value = self.value_in(inst.a, T0);
                let at = if inst.op == R::BrIfZero {
                    self.asm.cbz(false, value)
                } else {
                    self.asm.cbnz(false, value)
                };
                self.branch_fixups.push((at, inst.imm));
            }
            R::BrCmpI32 | R::BrCmpI64 => {
                self.burn_fuel();
                let wide = inst.op == R::BrCmpI64;
                let a = self.value_in(inst.a, T0);
                let b = self.value_in(inst.b, T1);
                self.asm.cmp_rr(wide, a, b);
                self.bcond_to(cc_of(Cond::from_u16(inst.dst)), inst.imm);
            }
            R::BrTable => {
                self.burn_fuel();
                let index = self.value_in(inst.a, T0);
                self.asm.mov_ww(T0, index);
                let entries = self.rir.br_tables[inst.imm as usize].clone();
                let default = *entries.last().expect("non-empty branch table");
                for (i, &target) in entries.iter().take(entries.len() - 1).enumerate() {
                    if i < 4096 {
                        self.asm.cmp_imm(false, T0, i as u32);
                    } else {
                        self.asm.mov_ri(T1, i as u64);
                        self.asm.cmp_rr(false, T0, T1);
                    }
                    self.bcond_to(0x0, target); // b.eq
                }
                self.branch_to(default);
            }

            R::Ret => {
                let list = self.rir.lists[inst.a as usize].clone();
                self.asm.load(T2, SP, self.args_slot);
                for (i, &vreg) in list.iter().enumerate() {
                    let value = self.value_in(vreg, T0);
                    self.asm.store(value, T2, i as u32 * 8);
                }
                self.asm.mov_ri(0, 0);
                self.jump_to_stub(Stub::CommonExit);
            }

            R::Call => self.emit_call(inst)?,
            R::ReturnCall => self.emit_self_tail_call(inst),
            R::CallIndirect => self.emit_call_indirect(inst)?,
            R::ReturnCallIndirect => return Err(CompileError::Unsupported),

            R::Select => {
                let cond = self.value_in(inst.imm as u16, T2);
                let if_true = self.value_in(inst.a, T0);
                let if_false = self.value_in(inst.b, T1);
                // cmp cond, #0; csel dst, if_true, if_false, ne
                self.asm.cmp_imm(false, cond, 0);
                self.asm.word(
                    0x9a80_0000
                        | u32::from(if_false) << 16
                        | 0x1u32 << 12
                        | u32::from(if_true) << 5
                        | u32::from(T0),
                );
                self.store_result(inst.dst, T0);
            }

            R::GlobalGet => {
                self.asm.mov_rr(0, CTX);
                self.asm.mov_ri(1, u64::from(inst.imm));
                self.asm.load(T0, CTX, CTX_GLOBAL_GET_HELPER);
                self.asm.blr(T0);
                self.reload_memory();
                self.store_result(inst.dst, 0);
            }
            R::GlobalSet => {
                self.value_into(inst.a, 2);
                self.asm.mov_rr(0, CTX);
                self.asm.mov_ri(1, u64::from(inst.imm));
                self.asm.load(T0, CTX, CTX_GLOBAL_SET_HELPER);
                self.asm.blr(T0);
                self.reload_memory();
            }

            R::MemorySize => {
                self.asm.load(T0, CTX, CTX_MEMORY_SIZE);
                // lsr x16, x16, #16
                self.asm
                    .word(0xd350_fc00 | u32::from(T0) << 5 | u32::from(T0));
                self.store_result(inst.dst, T0);
            }
            R::MemoryGrow => {
                self.value_into(inst.a, 2);
                // Zero-extend the page count.
                self.asm.mov_ww(2, 2);
                self.asm.mov_rr(0, CTX);
                self.asm.mov_ri(1, u64::from(inst.imm));
                self.asm.load(T0, CTX, CTX_GROW_HELPER);
                self.asm.blr(T0);
                self.reload_memory();
                self.store_result(inst.dst, 0);
            }

            R::I32Load | R::I64Load | R::F32Load | R::F64Load | R::I32Load8S | R::I32Load8U
            | R::I32Load16S | R::I32Load16U | R::I64Load8S | R::I64Load8U | R::I64Load16S
            | R::I64Load16U | R::I64Load32S | R::I64Load32U => self.emit_load(inst)?,
            R::I32Store | R::I64Store | R::F32Store | R::F64Store | R::I32Store8
            | R::I32Store16 | R::I64Store8 | R::I64Store16 | R::I64Store32 => {
                self.emit_store(inst)?;
            }

            R::I32DivS | R::I32DivU | R::I32RemS | R::I32RemU | R::I64DivS | R::I64DivU
            | R::I64RemS | R::I64RemU => self.emit_div(inst),

            R::I32Shl | R::I32ShrS | R::I32ShrU | R::I64Shl | R::I64ShrS | R::I64ShrU
            | R::I32Rotl | R::I32Rotr | R::I64Rotl | R::I64Rotr => self.emit_shift(inst),
            R::I32ShlImm | R::I32ShrSImm | R::I32ShrUImm => {
                let a = self.value_in(inst.a, T0);
                self.asm.mov_ri(T1, u64::from(inst.imm & 31));
                let variant: u32 = match inst.op {
                    R::I32ShlImm => 0x1ac0_2000,
                    R::I32ShrUImm => 0x1ac0_2400,
                    _ => 0x1ac0_2800,
                };
                self.asm
                    .word(variant | u32::from(T1) << 16 | u32::from(a) << 5 | u32::from(T0));
                self.store_result(inst.dst, T0);
            }

            R::I32Clz | R::I64Clz => {
                let wide = inst.op == R::I64Clz;
                let a = self.value_in(inst.a, T0);
                let base: u32 = if wide { 0xdac0_1000 } else { 0x5ac0_1000 };
                self.asm.word(base | u32::from(a) << 5 | u32::from(T0));
                self.store_result(inst.dst, T0);
            }
            R::I32Ctz | R::I64Ctz => {
                let wide = inst.op == R::I64Ctz;
                let a = self.value_in(inst.a, T0);
                let rbit: u32 = if wide { 0xdac0_0000 } else { 0x5ac0_0000 };
                let clz: u32 = if wide { 0xdac0_1000 } else { 0x5ac0_1000 };
                self.asm.word(rbit | u32::from(a) << 5 | u32::from(T0));
                self.asm.word(clz | u32::from(T0) << 5 | u32::from(T0));
                self.store_result(inst.dst, T0);
            }
            R::I32Popcnt | R::I64Popcnt => {
                let wide = inst.op == R::I64Popcnt;
                let a = self.value_in(inst.a, T0);
                if !wide {
                    self.asm.mov_ww(T0, a);
                } else {
                    self.asm.mov_rr(T0, a);
                }
                // fmov d0, x16; cnt v0.8b; addv b0, v0.8b; fmov x16, d0
                self.asm.word(0x9e67_0000 | u32::from(T0) << 5);
                self.asm.word(0x0e20_5800);
                self.asm.word(0x0e31_b800);
                self.asm.word(0x9e66_0000 | u32::from(T0));
                self.store_result(inst.dst, T0);
            }

            R::I32Eqz | R::I64Eqz => {
                let wide = inst.op == R::I64Eqz;
                let a = self.value_in(inst.a, T0);
                self.asm.cmp_imm(wide, a, 0);
                self.emit_cset(inst.dst, 0x0);
            }
            R::I32Eq | R::I32Ne | R::I32LtS | R::I32LtU | R::I32GtS | R::I32GtU | R::I32LeS
            | R::I32LeU | R::I32GeS | R::I32GeU | R::I64Eq | R::I64Ne | R::I64LtS | R::I64LtU
            | R::I64GtS | R::I64GtU | R::I64LeS | R::I64LeU | R::I64GeS | R::I64GeU => {
                let (cond, wide) = cmp_shape(inst.op);
                let a = self.value_in(inst.a, T0);
                let b = self.value_in(inst.b, T1);
                self.asm.cmp_rr(wide, a, b);
                self.emit_cset(inst.dst, cc_of(cond));
            }

            R::I32Add | R::I32Sub | R::I32Mul | R::I32And | R::I32Or | R::I32Xor | R::I64Add
            | R::I64Sub | R::I64Mul | R::I64And | R::I64Or | R::I64Xor => {
                let a = self.value_in(inst.a, T0);
                let b = self.value_in(inst.b, T1);
                let word = alu_word(inst.op, T0, a, b);
                self.asm.word(word);
                self.store_result(inst.dst, T0);
            }
            R::I32AddImm | R::I32AndImm | R::I32OrImm | R::I32XorImm | R::I32MulImm => {
                let a = self.value_in(inst.a, T0);
                self.asm.mov_ri(T1, u64::from(inst.imm));
                let op = match inst.op {
                    R::I32AddImm => RirOp::I32Add,
                    R::I32AndImm => RirOp::I32And,
                    R::I32OrImm => RirOp::I32Or,
                    R::I32XorImm => RirOp::I32Xor,
                    _ => RirOp::I32Mul,
                };
                let word = alu_word(op, T0, a, T1);
                self.asm.word(word);
                self.store_result(inst.dst, T0);
            }
            R::I64AddImm | R::I64AndImm | R::I64OrImm | R::I64XorImm => {
                let a = self.value_in(inst.a, T0);
                self.asm.mov_ri(T1, self.rir.wide[inst.imm as usize]);
                let op = match inst.op {
                    R::I64AddImm => RirOp::I64Add,
                    R::I64AndImm => RirOp::I64And,
                    R::I64OrImm => RirOp::I64Or,
                    _ => RirOp::I64Xor,
                };
                let word = alu_word(op, T0, a, T1);
                self.asm.word(word);
                self.store_result(inst.dst, T0);
            }

            R::I32WrapI64 | R::I64ExtendI32U => {
                let a = self.value_in(inst.a, T0);
                self.asm.mov_ww(T0, a);
                self.store_result(inst.dst, T0);
            }
            R::I64ExtendI32S | R::I64Extend32S => {
                let a = self.value_in(inst.a, T0);
                // sxtw x16, wa
                self.asm
                    .word(0x9340_7c00 | u32::from(a) << 5 | u32::from(T0));
                self.store_result(inst.dst, T0);
            }
            R::I32Extend8S => {
                let a = self.value_in(inst.a, T0);
                self.asm
                    .word(0x1300_1c00 | u32::from(a) << 5 | u32::from(T0));
                self.store_result(inst.dst, T0);
            }
            R::I32Extend16S => {
                let a = self.value_in(inst.a, T0);
                self.asm
                    .word(0x1300_3c00 | u32::from(a) << 5 | u32::from(T0));
                self.store_result(inst.dst, T0);
            }
            R::I64Extend8S => {
                let a = self.value_in(inst.a, T0);
                self.asm
                    .word(0x9340_1c00 | u32::from(a) << 5 | u32::from(T0));
                self.store_result(inst.dst, T0);
            }
            R::I64Extend16S => {
                let a = self.value_in(inst.a, T0);
                self.asm
                    .word(0x9340_3c00 | u32::from(a) << 5 | u32::from(T0));
                self.store_result(inst.dst, T0);
            }

            R::F32Add | R::F32Sub | R::F32Mul | R::F32Div | R::F64Add | R::F64Sub | R::F64Mul
            | R::F64Div | R::F32Sqrt | R::F64Sqrt | R::F32DemoteF64 | R::F64PromoteF32 => {
                self.emit_float(inst);
            }
            R::F32Abs => self.emit_float_mask(inst, 0x7fff_ffff, false),
            R::F32Neg => self.emit_float_mask(inst, 0x8000_0000, true),
            R::F64Abs => self.emit_float_mask64(inst, 0x7fff_ffff_ffff_ffff, false),
            R::F64Neg => self.emit_float_mask64(inst, 0x8000_0000_0000_0000, true),

            _ => return Err(CompileError::Unsupported),
        }
        Ok(())
    }

    fn reload_memory(&mut self) {
        self.asm.load(MEM, CTX, CTX_MEMORY_BASE);
    }

    fn emit_cset(&mut self, dst: u16, cond: u8) {
        // cset x16, cond == csinc x16, xzr, xzr, !cond.
        self.asm.word(
            0x9a9f_07e0 | u32::from(cond ^ 1) << 12 | u32::from(T0),
        );
        self.store_result(dst, T0);
    }

    // Effective address into x16; explicit bounds check unless in guard
    // mode.
    fn emit_address(&mut self, addr_vreg: u16, offset: u64, width: u32) {
        if offset > u64::from(u32::MAX) {
            self.jump_to_stub(Stub::Oob);
            return;
        }
        let addr = self.value_in(addr_vreg, T0);
        self.asm.mov_ww(T0, addr);
        if offset != 0 {
            if offset < 4096 {
                self.asm.add_imm(T0, T0, offset as u32);
            } else {
                self.asm.mov_ri(T1, offset);
                // add x16, x16, x17
                self.asm.word(
                    0x8b00_0000 | u32::from(T1) << 16 | u32::from(T0) << 5 | u32::from(T0),
                );
            }
        }
        if !self.layout.guard_mode {
            if width < 4096 {
                self.asm.add_imm(T1, T0, width);
            } else {
                self.asm.mov_ri(T1, u64::from(width));
                self.asm.word(
                    0x8b00_0000 | u32::from(T1) << 16 | u32::from(T0) << 5 | u32::from(T1),
                );
            }
            self.asm.load(T2, CTX, CTX_MEMORY_SIZE);
            self.asm.cmp_rr(true, T1, T2);
            self.bcond_to_stub(0x8, Stub::Oob); // b.hi
        }
    }

    fn emit_load(&mut self, inst: RirInst) -> Result<(), CompileError> {
        use RirOp as R;
        let marg = self.rir.memargs[inst.imm as usize];
        let width = match inst.op {
            R::I32Load8S | R::I32Load8U | R::I64Load8S | R::I64Load8U => 1,
            R::I32Load16S | R::I32Load16U | R::I64Load16S | R::I64Load16U => 2,
            R::I32Load | R::F32Load | R::I64Load32S | R::I64Load32U => 4,
            _ => 8,
        };
        self.emit_address(inst.a, marg.offset, width);
        if marg.offset > u64::from(u32::MAX) {
            return Ok(());
        }

        // ldr-family [x26 + x16] into x17.
        let base: u32 = match inst.op {
            R::I64Load | R::F64Load => 0xf860_6800,
            R::I32Load | R::F32Load | R::I64Load32U => 0xb860_6800,
            R::I32Load8U | R::I64Load8U => 0x3860_6800,
            R::I32Load16U | R::I64Load16U => 0x7860_6800,
            R::I32Load8S => 0x38e0_6800,
            R::I64Load8S => 0x38a0_6800,
            R::I32Load16S => 0x78e0_6800,
            R::I64Load16S => 0x78a0_6800,
            R::I64Load32S => 0xb8a0_6800,
            _ => unreachable!(),
        };
        self.asm
            .word(base | u32::from(T0) << 16 | u32::from(MEM) << 5 | u32::from(T1));
        self.store_result(inst.dst, T1);
        Ok(())
    }

    fn emit_store(&mut self, inst: RirInst) -> Result<(), CompileError> {
        use RirOp as R;
        let marg = self.rir.memargs[inst.imm as usize];
        let width = match inst.op {
            R::I32Store8 | R::I64Store8 => 1,
            R::I32Store16 | R::I64Store16 => 2,
            R::I32Store | R::F32Store | R::I64Store32 => 4,
            _ => 8,
        };
        self.emit_address(inst.a, marg.offset, width);
        if marg.offset > u64::from(u32::MAX) {
            return Ok(());
        }
        self.value_into(inst.b, T2);

        let base: u32 = match width {
            1 => 0x3820_6800,
            2 => 0x7820_6800,
            4 => 0xb820_6800,
            _ => 0xf820_6800,
        };
        self.asm
            .word(base | u32::from(T0) << 16 | u32::from(MEM) << 5 | u32::from(T2));
        Ok(())
    }

    fn emit_div(&mut self, inst: RirInst) {
        use RirOp as R;
        let wide = matches!(inst.op, R::I64DivS | R::I64DivU | R::I64RemS | R::I64RemU);
        let signed = matches!(inst.op, R::I32DivS | R::I32RemS | R::I64DivS | R::I64RemS);
        let is_rem = matches!(inst.op, R::I32RemS | R::I32RemU | R::I64RemS | R::I64RemU);

        let a = self.value_in(inst.a, T0);
        if a != T0 {
            if wide {
                self.asm.mov_rr(T0, a);
            } else {
                self.asm.mov_ww(T0, a);
            }
        }
        let b = self.value_in(inst.b, T1);
        if b != T1 {
            if wide {
                self.asm.mov_rr(T1, b);
            } else {
                self.asm.mov_ww(T1, b);
            }
        }

        // Divisor first.
        let nonzero = self.asm.cbnz(wide, T1);
        self.jump_to_stub(Stub::DivZero);
        let resume = self.asm.here();
        self.asm.patch(nonzero, resume);

        let mut rem_zero_fixup = None;
        if signed {
            // The MIN / -1 pair: division overflows, remainder is zero.
            // cmn x17, #1 (compare against -1)
            let base = if wide { 0xb100_001f } else { 0x3100_001f };
            self.asm.word(base | 1 << 10 | u32::from(T1) << 5);
            let not_minus_one = self.asm.b_cond(0x1); // b.ne
            if wide {
                self.asm.mov_ri(T2, i64::MIN as u64);
            } else {
                self.asm.mov_ri(T2, u64::from(i32::MIN as u32));
            }
            self.asm.cmp_rr(wide, T0, T2);
            let not_min = self.asm.b_cond(0x1);
            if is_rem {
                self.asm.mov_ri(T0, 0);
                let done = self.asm.b();
                rem_zero_fixup = Some(done);
            } else {
                self.jump_to_stub(Stub::IntOverflow);
            }
            let resume = self.asm.here();
            self.asm.patch(not_minus_one, resume);
            self.asm.patch(not_min, resume);
        }

        // q = a / b into t2.
        let div: u32 = match (wide, signed) {
            (true, true) => 0x9ac0_0c00,
            (true, false) => 0x9ac0_0800,
            (false, true) => 0x1ac0_0c00,
            (false, false) => 0x1ac0_0800,
        };
        self.asm
            .word(div | u32::from(T1) << 16 | u32::from(T0) << 5 | u32::from(T2));
        if is_rem {
            // rem = a - q*b: msub t0, t2, t1, t0
            let msub: u32 = if wide { 0x9b00_8000 } else { 0x1b00_8000 };
            self.asm.word(
                msub | u32::from(T1) << 16
                    | u32::from(T0) << 10
                    | u32::from(T2) << 5
                    | u32::from(T0),
            );
        } else {
            self.asm.mov_rr(T0, T2);
        }
        if !wide {
            self.asm.mov_ww(T0, T0);
        }
        if let Some(done) = rem_zero_fixup {
            let after = self.asm.here();
            self.asm.patch(done, after);
        }
        self.store_result(inst.dst, T0);
    }

    fn emit_shift(&mut self, inst: RirInst) {
        use RirOp as R;
        let wide = matches!(
            inst.op,
            R::I64Shl | R::I64ShrS | R::I64ShrU | R::I64Rotl | R::I64Rotr
        );
        let a = self.value_in(inst.a, T0);
        let b = self.value_in(inst.b, T1);

        let count = if matches!(inst.op, R::I32Rotl | R::I64Rotl) {
            // rotl(a, n) == rotr(a, -n); the rotate masks the count.
            let neg: u32 = if wide { 0xcb00_03e0 } else { 0x4b00_03e0 };
            self.asm.word(neg | u32::from(b) << 16 | u32::from(T1));
            T1
        } else {
            b
        };
        let variant: u32 = match inst.op {
            R::I32Shl => 0x1ac0_2000,
            R::I32ShrU => 0x1ac0_2400,
            R::I32ShrS => 0x1ac0_2800,
            R::I32Rotl | R::I32Rotr => 0x1ac0_2c00,
            R::I64Shl => 0x9ac0_2000,
            R::I64ShrU => 0x9ac0_2400,
            R::I64ShrS => 0x9ac0_2800,
            _ => 0x9ac0_2c00,
        };
        self.asm
            .word(variant | u32::from(count) << 16 | u32::from(a) << 5 | u32::from(T0));
        self.store_result(inst.dst, T0);
    }

    fn emit_float(&mut self, inst: RirInst) {
        use RirOp as R;
        let (word, wide_in, wide_out, binary): (u32, bool, bool, bool) = match inst.op {
            R::F32Add => (0x1e20_2800, false, false, true),
            R::F32Sub => (0x1e20_3800, false, false, true),
            R::F32Mul => (0x1e20_0800, false, false, true),
            R::F32Div => (0x1e20_1800, false, false, true),
            R::F64Add => (0x1e60_2800, true, true, true),
            R::F64Sub => (0x1e60_3800, true, true, true),
            R::F64Mul => (0x1e60_0800, true, true, true),
            R::F64Div => (0x1e60_1800, true, true, true),
            R::F32Sqrt => (0x1e21_c000, false, false, false),
            R::F64Sqrt => (0x1e61_c000, true, true, false),
            R::F32DemoteF64 => (0x1e62_4000, true, false, false),
            R::F64PromoteF32 => (0x1e22_c000, false, true, false),
            _ => unreachable!(),
        };

        self.value_into(inst.a, T0);
        // fmov d0/s0 <- x16/w16.
        self.asm.word(if wide_in {
            0x9e67_0000 | u32::from(T0) << 5
        } else {
            0x1e27_0000 | u32::from(T0) << 5
        });
        if binary {
            self.value_into(inst.b, T1);
            self.asm.word(if wide_in {
                0x9e67_0000 | u32::from(T1) << 5 | 1
            } else {
                0x1e27_0000 | u32::from(T1) << 5 | 1
            });
            self.asm.word(word | 1 << 16);
        } else {
            self.asm.word(word);
        }
        // fmov back.
        self.asm.word(if wide_out {
            0x9e66_0000 | u32::from(T0)
        } else {
            0x1e26_0000 | u32::from(T0)
        });
        if !wide_out {
            self.asm.mov_ww(T0, T0);
        }
        self.store_result(inst.dst, T0);
    }

    fn emit_float_mask(&mut self, inst: RirInst, mask: u32, is_xor: bool) {
        let a = self.value_in(inst.a, T0);
        self.asm.mov_ri(T1, u64::from(mask));
        let word: u32 = if is_xor { 0x4a00_0000 } else { 0x0a00_0000 };
        self.asm
            .word(word | u32::from(T1) << 16 | u32::from(a) << 5 | u32::from(T0));
        self.store_result(inst.dst, T0);
    }

    fn emit_float_mask64(&mut self, inst: RirInst, mask: u64, is_xor: bool) {
        let a = self.value_in(inst.a, T0);
        self.asm.mov_ri(T1, mask);
        let word: u32 = if is_xor { 0xca00_0000 } else { 0x8a00_0000 };
        self.asm
            .word(word | u32::from(T1) << 16 | u32::from(a) << 5 | u32::from(T0));
        self.store_result(inst.dst, T0);
    }

    fn emit_call(&mut self, inst: RirInst) -> Result<(), CompileError> {
        let site = self.rir.calls[inst.imm as usize].clone();
        if site.target == self.layout.func_index {
            return self.emit_self_call(inst);
        }
        self.stage_args(&site.args);
        self.asm.mov_rr(0, CTX);
        self.asm.mov_ri(1, u64::from(site.target));
        self.asm.add_imm(2, SP, self.out_area);
        self.asm
            .mov_ri(3, (site.args.len() as u64) << 32 | site.rets.len() as u64);
        self.asm.load(T0, CTX, CTX_CALL_HELPER);
        self.asm.blr(T0);
        self.check_helper_status();
        self.reload_memory();
        self.unstage_rets(&site.rets);
        Ok(())
    }

    fn emit_call_indirect(&mut self, inst: RirInst) -> Result<(), CompileError> {
        let site = self.rir.calls[inst.imm as usize].clone();
        self.stage_args(&site.args);
        self.value_into(site.addr, 2);
        self.asm.mov_rr(0, CTX);
        self.asm
            .mov_ri(1, u64::from(site.target) << 32 | u64::from(site.table));
        self.asm.add_imm(3, SP, self.out_area);
        self.asm
            .mov_ri(4, (site.args.len() as u64) << 32 | site.rets.len() as u64);
        self.asm.load(T0, CTX, CTX_INDIRECT_HELPER);
        self.asm.blr(T0);
        self.check_helper_status();
        self.reload_memory();
        self.unstage_rets(&site.rets);
        Ok(())
    }

    fn emit_self_call(&mut self, inst: RirInst) -> Result<(), CompileError> {
        let site = self.rir.calls[inst.imm as usize].clone();
        self.stage_args(&site.args);
        self.asm.mov_rr(0, CTX);
        self.asm.add_imm(1, SP, self.out_area);
        // bl internal entry.
        let at = self.asm.here();
        self.asm.word(0x9400_0000);
        let rel_words = (i64::from(internal_entry_offset()) - i64::from(at)) / 4;
        let index = at as usize;
        let mut word =
            u32::from_le_bytes(self.asm.code[index..index + 4].try_into().unwrap());
        word |= (rel_words as u32) & 0x03ff_ffff;
        self.asm.code[index..index + 4].copy_from_slice(&word.to_le_bytes());
        self.check_helper_status();
        self.reload_memory();
        self.unstage_rets(&site.rets);
        Ok(())
    }

    fn emit_self_tail_call(&mut self, inst: RirInst) {
        let site = self.rir.calls[inst.imm as usize].clone();
        self.stage_args(&site.args);
        self.burn_fuel();
        let at = self.asm.b();
        let restart = self.restart;
        self.asm.patch(at, restart);
    }

    fn stage_args(&mut self, args: &[u16]) {
        for (i, &vreg) in args.iter().enumerate() {
            let value = self.value_in(vreg, T0);
            self.asm.store(value, SP, self.out_area + i as u32 * 8);
        }
    }

    fn unstage_rets(&mut self, rets: &[u16]) {
        for (i, &vreg) in rets.iter().enumerate() {
            self.asm.load(T0, SP, self.out_area + i as u32 * 8);
            self.store_result(vreg, T0);
        }
    }

    fn check_helper_status(&mut self) {
        let at = self.asm.cbnz(true, 0);
        self.exit_fixups.push((at, Stub::CommonExit));
    }
}

// The internal entry sits past the external entry's load + branch.
fn internal_entry_offset() -> u32 {
    8
}

fn cmp_shape(op: RirOp) -> (Cond, bool) {
    use RirOp as R;
    match op {
        R::I32Eq => (Cond::Eq, false),
        R::I32Ne => (Cond::Ne, false),
        R::I32LtS => (Cond::LtS, false),
        R::I32LtU => (Cond::LtU, false),
        R::I32GtS => (Cond::GtS, false),
        R::I32GtU => (Cond::GtU, false),
        R::I32LeS => (Cond::LeS, false),
        R::I32LeU => (Cond::LeU, false),
        R::I32GeS => (Cond::GeS, false),
        R::I32GeU => (Cond::GeU, false),
        R::I64Eq => (Cond::Eq, true),
        R::I64Ne => (Cond::Ne, true),
        R::I64LtS => (Cond::LtS, true),
        R::I64LtU => (Cond::LtU, true),
        R::I64GtS => (Cond::GtS, true),
        R::I64GtU => (Cond::GtU, true),
        R::I64LeS => (Cond::LeS, true),
        R::I64LeU => (Cond::LeU, true),
        R::I64GeS => (Cond::GeS, true),
        R::I64GeU => (Cond::GeU, true),
        _ => unreachable!(),
    }
}

// Two-operand ALU encodings, dst/a/b. The multiply bases bake in Ra=xzr
// (madd with a zero addend).
fn alu_word(op: RirOp, dst: u8, a: u8, b: u8) -> u32 {
    use RirOp as R;
    let base: u32 = match op {
        R::I32Add => 0x0b00_0000,
        R::I32Sub => 0x4b00_0000,
        R::I32And => 0x0a00_0000,
        R::I32Or => 0x2a00_0000,
        R::I32Xor => 0x4a00_0000,
        R::I32Mul => 0x1b00_7c00,
        R::I64Add => 0x8b00_0000,
        R::I64Sub => 0xcb00_0000,
        R::I64And => 0x8a00_0000,
        R::I64Or => 0xaa00_0000,
        R::I64Xor => 0xca00_0000,
        R::I64Mul => 0x9b00_7c00,
        _ => unreachable!(),
    };
    base | u32::from(b) << 16 | u32::from(a) << 5 | u32::from(dst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_encodings() {
        let mut asm = Asm::new();
        asm.mov_rr(27, 0); // mov x27, x0
        assert_eq!(asm.code, 0xaa00_03fbu32.to_le_bytes());

        let mut asm = Asm::new();
        asm.load(1, 0, 0); // ldr x1, [x0]
        assert_eq!(asm.code, 0xf940_0001u32.to_le_bytes());

        let mut asm = Asm::new();
        asm.ret();
        assert_eq!(asm.code, 0xd65f_03c0u32.to_le_bytes());
    }

    #[test]
    fn branch_patching() {
        let mut asm = Asm::new();
        let at = asm.b();
        asm.word(0xd503_201f); // nop
        let target = asm.here();
        asm.patch(at, target);
        // b +2 words.
        assert_eq!(asm.code[..4], 0x1400_0002u32.to_le_bytes());
    }

    #[test]
    fn immediate_synthesis() {
        let mut asm = Asm::new();
        asm.mov_ri(0, 0x1234);
        // movz x0, #0x1234
        assert_eq!(asm.code, (0xd280_0000u32 | 0x1234 << 5).to_le_bytes());

        let mut asm = Asm::new();
        asm.mov_ri(5, 0xdead_beef_0000);
        // movz + two movk.
        assert_eq!(asm.code.len(), 12);
    }
}
