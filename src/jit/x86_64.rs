// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! x86_64 backend.
//!
//! Emits System-V native code from allocated RIR. Register conventions:
//! r12 holds the context, r13 the linear-memory base, rax/rdx are scratch
//! (and the division pair); the allocator hands out rcx/rsi/rdi/r8-r11 and
//! rbx/r14/r15. Frames are rbp-based: callee saves, then spill slots, then
//! the outgoing-argument area shared by call sites and self tail-calls.
//!
//! Two entries share one body: the external entry loads the argument
//! pointer from the context, the internal entry (used by self-calls) takes
//! it in rsi directly. Guard-mode memory accesses are single instructions;
//! otherwise an explicit bounds compare branches to the out-of-bounds stub
//! that the signal router also targets.

use super::{
    CTX_CALL_HELPER, CTX_DEPTH, CTX_FRAME_BASE, CTX_FUEL, CTX_GLOBAL_GET_HELPER,
    CTX_GLOBAL_SET_HELPER, CTX_GROW_HELPER, CTX_INDIRECT_HELPER, CTX_MEMORY_BASE,
    CTX_MEMORY_SIZE, CompileError, EmittedCode, FuncLayout, TRAP_DIV_ZERO, TRAP_FUEL,
    TRAP_INT_OVERFLOW, TRAP_OOB, TRAP_STACK_OVERFLOW, TRAP_UNREACHABLE,
};
use crate::rir::regalloc::{Allocation, Loc};
use crate::rir::{Cond, RirFunction, RirInst, RirOp};
use crate::runtime::MAX_CALL_DEPTH;

// Register numbers.
const RAX: u8 = 0;
const RCX: u8 = 1;
const RDX: u8 = 2;
const RSP: u8 = 4;
const RBP: u8 = 5;
const RSI: u8 = 6;
const RDI: u8 = 7;
const R12: u8 = 12;
const R13: u8 = 13;

// jcc condition nibbles for "branch when the comparison holds".
fn cc_of(cond: Cond) -> u8 {
    match cond {
        Cond::Eq => 0x4,
        Cond::Ne => 0x5,
        Cond::LtS => 0xc,
        Cond::LtU => 0x2,
        Cond::GtS => 0xf,
        Cond::GtU => 0x7,
        Cond::LeS => 0xe,
        Cond::LeU => 0x6,
        Cond::GeS => 0xd,
        Cond::GeU => 0x3,
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

    fn byte(&mut self, byte: u8) {
        self.code.push(byte);
    }

    fn bytes(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    fn imm32(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    fn imm64(&mut self, value: u64) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    fn rex(&mut self, wide: bool, reg: u8, index: u8, base: u8) {
        let mut rex = 0x40u8;
        if wide {
            rex |= 8;
        }
        if reg >= 8 {
            rex |= 4;
        }
        if index >= 8 {
            rex |= 2;
        }
        if base >= 8 {
            rex |= 1;
        }
        if rex != 0x40 || wide {
            self.byte(rex);
        }
    }

    // Always-emit REX variant, for byte-register operands.
    fn rex_force(&mut self, wide: bool, reg: u8, index: u8, base: u8) {
        let mut rex = 0x40u8;
        if wide {
            rex |= 8;
        }
        if reg >= 8 {
            rex |= 4;
        }
        if index >= 8 {
            rex |= 2;
        }
        if base >= 8 {
            rex |= 1;
        }
        self.byte(rex);
    }

    fn modrm(&mut self, md: u8, reg: u8, rm: u8) {
        self.byte(md << 6 | (reg & 7) << 3 | (rm & 7));
    }

    // [base + disp32] addressing for `reg`; handles the rsp/r12 SIB case.
    fn mem(&mut self, reg: u8, base: u8, disp: i32) {
        if base & 7 == RSP {
            self.modrm(2, reg, RSP);
            self.byte(0x24); // SIB: scale 1, no index, base rsp/r12
        } else {
            self.modrm(2, reg, base);
        }
        self.imm32(disp as u32);
    }

    // mov dst64 <- src64.
    fn mov_rr(&mut self, dst: u8, src: u8) {
        if dst == src {
            return;
        }
        self.rex(true, src, 0, dst);
        self.byte(0x89);
        self.modrm(3, src, dst);
    }

    // mov dst64 <- imm64 (movabs; shortened when it fits in 32 bits).
    fn mov_ri(&mut self, dst: u8, value: u64) {
        if value <= u32::MAX as u64 {
            // mov r32, imm32 zero-extends.
            self.rex(false, 0, 0, dst);
            self.byte(0xb8 + (dst & 7));
            self.imm32(value as u32);
        } else {
            self.rex(true, 0, 0, dst);
            self.byte(0xb8 + (dst & 7));
            self.imm64(value);
        }
    }

    // mov dst64 <- [base + disp].
    fn load_rm(&mut self, dst: u8, base: u8, disp: i32) {
        self.rex(true, dst, 0, base);
        self.byte(0x8b);
        self.mem(dst, base, disp);
    }

    // mov [base + disp] <- src64.
    fn store_mr(&mut self, base: u8, disp: i32, src: u8) {
        self.rex(true, src, 0, base);
        self.byte(0x89);
        self.mem(src, base, disp);
    }

    // Binary ALU ops, register forms: opcode is the r/m,reg byte.
    fn alu_rr(&mut self, wide: bool, opcode: u8, dst: u8, src: u8) {
        self.rex(wide, src, 0, dst);
        self.byte(opcode);
        self.modrm(3, src, dst);
    }

    fn jmp_rel32(&mut self) -> u32 {
        self.byte(0xe9);
        let at = self.here();
        self.imm32(0);
        at
    }

    fn jcc_rel32(&mut self, cc: u8) -> u32 {
        self.byte(0x0f);
        self.byte(0x80 + cc);
        let at = self.here();
        self.imm32(0);
        at
    }

    fn patch_rel32(&mut self, at: u32, target: u32) {
        let rel = target.wrapping_sub(at + 4) as i32;
        self.code[at as usize..at as usize + 4].copy_from_slice(&rel.to_le_bytes());
    }

    fn call_reg(&mut self, reg: u8) {
        self.rex(false, 0, 0, reg);
        self.byte(0xff);
        self.modrm(3, 2, reg);
    }
}

// Where a value lives at runtime: its physical register or a frame slot.
#[derive(Clone, Copy)]
enum Place {
    Reg(u8),
    // rbp-relative displacement.
    Frame(i32),
}

struct Emitter<'a> {
    asm: Asm,
    rir: &'a RirFunction,
    layout: &'a FuncLayout,
    places: Vec<Place>,
    // Frame displacements.
    out_area: i32,
    args_slot: i32,
    frame_size: u32,
    // RIR pc -> code offset, for branch resolution.
    block_offsets: Vec<u32>,
    // (patch position, target RIR pc).
    branch_fixups: Vec<(u32, u32)>,
    // Stubs, patched at the end: positions jumping to each named stub.
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

/// Emits native code for one function, or reports the construct that keeps
/// it on the interpreter tiers.
pub(crate) fn emit(
    rir: &RirFunction,
    alloc: &Allocation,
    layout: &FuncLayout,
) -> Result<EmittedCode, CompileError> {
    check_coverage(rir, layout)?;

    // Frame: [saved rbp][rbx r12 r13 r14 r15][spills][args ptr][out area]
    let out_slots = out_area_slots(rir);
    let spill_bytes = alloc.num_spill_slots * 8;
    let mut frame = spill_bytes + 8 + out_slots * 8;
    // Keep rsp 16-aligned in the body: entry misaligns by 8, push rbp and
    // the five saves realign to 8, so the frame must be ≡ 8 (mod 16).
    if frame % 16 != 8 {
        frame += 8;
    }

    let saved = 5 * 8; // rbx, r12, r13, r14, r15
    let places = (0..rir.num_regs)
        .map(|vreg| match alloc.locs[vreg as usize] {
            Loc::Reg(reg) => Place::Reg(reg),
            Loc::Spill(slot) => Place::Frame(-(saved + (slot as i32 + 1) * 8)),
        })
        .collect();
    let args_slot = -(saved + spill_bytes as i32 + 8);
    let out_area = args_slot - (out_slots as i32) * 8;

    let emitter = Emitter {
        asm: Asm::new(),
        rir,
        layout,
        places,
        out_area,
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

// The staging area must fit the widest call site (and the tail-call arg
// shuffle).
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
            // Float comparisons, min/max/rounding/copysign, and the
            // trapping/saturating conversions stay interpreted.
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
            // Tail calls are compiled only when self-recursive.
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

    // Loads a vreg into `scratch` unless it already sits in a register.
    fn value_in(&mut self, vreg: u16, scratch: u8) -> u8 {
        match self.place(vreg) {
            Place::Reg(reg) => reg,
            Place::Frame(disp) => {
                self.asm.load_rm(scratch, RBP, disp);
                scratch
            }
        }
    }

    // Copies a vreg's value into `dst` unconditionally.
    fn value_into(&mut self, vreg: u16, dst: u8) {
        match self.place(vreg) {
            Place::Reg(reg) => self.asm.mov_rr(dst, reg),
            Place::Frame(disp) => self.asm.load_rm(dst, RBP, disp),
        }
    }

    // Stores `src` into a vreg's home.
    fn store_result(&mut self, vreg: u16, src: u8) {
        match self.place(vreg) {
            Place::Reg(reg) => self.asm.mov_rr(reg, src),
            Place::Frame(disp) => self.asm.store_mr(RBP, disp, src),
        }
    }

    fn jump_to_stub(&mut self, stub: Stub) {
        let at = self.asm.jmp_rel32();
        self.exit_fixups.push((at, stub));
    }

    fn jcc_to_stub(&mut self, cc: u8, stub: Stub) {
        let at = self.asm.jcc_rel32(cc);
        self.exit_fixups.push((at, stub));
    }

    fn branch_to(&mut self, target_rir: u32) {
        let at = self.asm.jmp_rel32();
        self.branch_fixups.push((at, target_rir));
    }

    fn jcc_to(&mut self, cc: u8, target_rir: u32) {
        let at = self.asm.jcc_rel32(cc);
        self.branch_fixups.push((at, target_rir));
    }

    // One fuel-counter decrement (a basic block's worth).
    fn burn_fuel(&mut self) {
        self.asm.load_rm(RAX, R12, CTX_FUEL as i32);
        // sub qword [rax], 1
        self.asm.rex(true, 0, 0, RAX);
        self.asm.byte(0x83);
        self.asm.mem(5, RAX, 0);
        self.asm.byte(1);
        // js fuel_stub
        self.jcc_to_stub(0x8, Stub::Fuel);
    }

    fn emit_function(mut self) -> Result<EmittedCode, CompileError> {
        // external entry: rdi = ctx; fetch the args pointer and fall into
        // the shared prologue.
        self.asm.load_rm(RSI, RDI, CTX_FRAME_BASE as i32);
        let internal_entry_jump = self.asm.jmp_rel32();

        // internal entry: rdi = ctx, rsi = args. The jump above lands here.
        let internal_entry = self.asm.here();
        self.asm.patch_rel32(internal_entry_jump, internal_entry);

        // push rbp; mov rbp, rsp
        self.asm.byte(0x55);
        self.asm.mov_rr(RBP, RSP);
        // push rbx, r12, r13, r14, r15
        for reg in [3u8, 12, 13, 14, 15] {
            self.asm.rex(false, 0, 0, reg);
            self.asm.byte(0x50 + (reg & 7));
        }
        // sub rsp, frame
        self.asm.rex(true, 0, 0, RSP);
        self.asm.byte(0x81);
        self.asm.modrm(3, 5, RSP);
        self.asm.imm32(self.frame_size);

        self.asm.mov_rr(R12, RDI);
        // Save the caller's result buffer.
        self.asm.store_mr(RBP, self.args_slot, RSI);

        // Depth accounting and the call-depth bound.
        self.asm.load_rm(RAX, R12, CTX_DEPTH as i32);
        // add rax, 1
        self.asm.rex(true, 0, 0, RAX);
        self.asm.byte(0x83);
        self.asm.modrm(3, 0, RAX);
        self.asm.byte(1);
        self.asm.store_mr(R12, CTX_DEPTH as i32, RAX);
        // cmp rax, MAX_CALL_DEPTH
        self.asm.rex(true, 0, 0, RAX);
        self.asm.byte(0x81);
        self.asm.modrm(3, 7, RAX);
        self.asm.imm32(MAX_CALL_DEPTH as u32);
        self.jcc_to_stub(0x7, Stub::StackOverflow); // ja

        self.asm.load_rm(R13, R12, CTX_MEMORY_BASE as i32);

        // Stage incoming arguments into the out area (the tail-call target
        // also reads from there).
        for i in 0..self.rir.param_count as i32 {
            self.asm.load_rm(RAX, RSI, i * 8);
            self.asm.store_mr(RBP, self.out_area + i * 8, RAX);
        }

        // restart: copy staged args into their homes, zero other locals.
        self.restart = self.asm.here();
        for i in 0..self.rir.param_count {
            self.asm.load_rm(RAX, RBP, self.out_area + i as i32 * 8);
            self.store_result(i, RAX);
        }
        if self.rir.num_locals > self.rir.param_count {
            // xor eax, eax
            self.asm.alu_rr(false, 0x31, RAX, RAX);
            for vreg in self.rir.param_count..self.rir.num_locals {
                self.store_result(vreg, RAX);
            }
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
        let common_exit = {
            for (stub, code) in [
                (Stub::Unreachable, TRAP_UNREACHABLE),
                (Stub::DivZero, TRAP_DIV_ZERO),
                (Stub::IntOverflow, TRAP_INT_OVERFLOW),
                (Stub::Oob, TRAP_OOB),
                (Stub::Fuel, TRAP_FUEL),
                (Stub::StackOverflow, TRAP_STACK_OVERFLOW),
            ] {
                stub_offsets.push((stub, self.asm.here()));
                self.asm.mov_ri(RAX, code as u64);
                // Falls through chains would mis-exit; jump explicitly.
                let at = self.asm.jmp_rel32();
                self.exit_fixups.push((at, Stub::CommonExit));
            }

            let exit = self.asm.here();
            // dec depth
            self.asm.load_rm(RDX, R12, CTX_DEPTH as i32);
            self.asm.rex(true, 0, 0, RDX);
            self.asm.byte(0x83);
            self.asm.modrm(3, 5, RDX);
            self.asm.byte(1);
            self.asm.store_mr(R12, CTX_DEPTH as i32, RDX);
            // lea rsp, [rbp - 40]; pop saves; pop rbp; ret
            self.asm.rex(true, RSP, 0, RBP);
            self.asm.byte(0x8d);
            self.asm.mem(RSP, RBP, -40);
            for reg in [15u8, 14, 13, 12, 3] {
                self.asm.rex(false, 0, 0, reg);
                self.asm.byte(0x58 + (reg & 7));
            }
            self.asm.byte(0x5d); // pop rbp
            self.asm.byte(0xc3); // ret
            exit
        };

        // Resolve fixups.
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
            self.asm.patch_rel32(at, target);
        }
        for (at, target_rir) in std::mem::take(&mut self.branch_fixups) {
            let target = self.block_offsets[target_rir as usize];
            self.asm.patch_rel32(at, target);
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
                let src = self.value_in(inst.a, RAX);
                self.store_result(inst.dst, src);
            }
            R::Const32 => {
                self.asm.mov_ri(RAX, u64::from(inst.imm));
                self.store_result(inst.dst, RAX);
            }
            R::Const64 => {
                self.asm.mov_ri(RAX, self.rir.wide[inst.imm as usize]);
                self.store_result(inst.dst, RAX);
            }

            R::Br => {
                if inst.imm <= pc {
                    self.burn_fuel();
                }
                self.branch_to(inst.imm);
            }
            R::BrIfZero | R::BrIfNonZero => {
                self.burn_fuel();
                let value = self.value_in(inst.a, RAX);
                // test r32, r32
                self.asm.alu_rr(false, 0x85, value, value);
                let cc = if inst.op == R::BrIfZero { 0x4 } else { 0x5 };
                self.jcc_to(cc, inst.imm);
            }
            R::BrCmpI32 | R::BrCmpI64 => {
                self.burn_fuel();
                let wide = inst.op == R::BrCmpI64;
                let a = self.value_in(inst.a, RAX);
                let b = self.value_in(inst.b, RDX);
                self.asm.alu_rr(wide, 0x39, a, b); // cmp a, b
                self.jcc_to(cc_of(Cond::from_u16(inst.dst)), inst.imm);
            }
            R::BrTable => {
                self.burn_fuel();
                let index = self.value_in(inst.a, RAX);
                self.asm.mov_rr(RAX, index);
                let entries = self.rir.br_tables[inst.imm as usize].clone();
                let default = *entries.last().expect("non-empty branch table");
                for (i, &target) in entries.iter().take(entries.len() - 1).enumerate() {
                    // cmp eax, i; je target
                    self.asm.byte(0x3d);
                    self.asm.imm32(i as u32);
                    self.jcc_to(0x4, target);
                }
                self.branch_to(default);
            }

            R::Ret => {
                let list = self.rir.lists[inst.a as usize].clone();
                self.asm.load_rm(RSI, RBP, self.args_slot);
                for (i, &vreg) in list.iter().enumerate() {
                    let value = self.value_in(vreg, RAX);
                    self.asm.store_mr(RSI, i as i32 * 8, value);
                }
                // xor eax, eax; jmp common exit
                self.asm.alu_rr(false, 0x31, RAX, RAX);
                self.jump_to_stub(Stub::CommonExit);
            }

            R::Call => self.emit_call(inst)?,
            R::ReturnCall => self.emit_self_tail_call(inst),
            R::CallIndirect => self.emit_call_indirect(inst)?,
            R::ReturnCallIndirect => return Err(CompileError::Unsupported),

            R::Select => {
                let cond = self.value_in(inst.imm as u16, RDX);
                self.asm.alu_rr(false, 0x85, cond, cond); // test
                self.value_into(inst.b, RAX); // if-false
                // cmovne rax, if_true
                match self.place(inst.a) {
                    Place::Reg(reg) => {
                        self.asm.rex(true, RAX, 0, reg);
                        self.asm.bytes(&[0x0f, 0x45]);
                        self.asm.modrm(3, RAX, reg);
                    }
                    Place::Frame(disp) => {
                        self.asm.rex(true, RAX, 0, RBP);
                        self.asm.bytes(&[0x0f, 0x45]);
                        self.asm.mem(RAX, RBP, disp);
                    }
                }
                self.store_result(inst.dst, RAX);
            }

            R::GlobalGet => {
                self.emit_helper_preamble(CTX_GLOBAL_GET_HELPER);
                self.asm.mov_ri(RSI, u64::from(inst.imm));
                self.asm.call_reg(RAX);
                self.reload_memory();
                self.store_result(inst.dst, RAX);
            }
            R::GlobalSet => {
                let value = self.value_in(inst.a, RDX);
                self.asm.mov_rr(RDX, value);
                self.emit_helper_preamble(CTX_GLOBAL_SET_HELPER);
                self.asm.mov_ri(RSI, u64::from(inst.imm));
                self.asm.call_reg(RAX);
                self.reload_memory();
            }

            R::MemorySize => {
                self.asm.load_rm(RAX, R12, CTX_MEMORY_SIZE as i32);
                // shr rax, 16 (pages)
                self.asm.rex(true, 0, 0, RAX);
                self.asm.byte(0xc1);
                self.asm.modrm(3, 5, RAX);
                self.asm.byte(16);
                self.store_result(inst.dst, RAX);
            }
            R::MemoryGrow => {
                let delta = self.value_in(inst.a, RDX);
                // mov edx, delta32 (zero-extend the page count)
                self.asm.rex(false, delta, 0, RDX);
                self.asm.byte(0x89);
                self.asm.modrm(3, delta, RDX);
                self.emit_helper_preamble(CTX_GROW_HELPER);
                // rsi = memory index
                self.asm.mov_ri(RSI, u64::from(inst.imm));
                self.asm.call_reg(RAX);
                self.reload_memory();
                self.store_result(inst.dst, RAX);
            }

            // Memory accesses.
            R::I32Load | R::I64Load | R::F32Load | R::F64Load | R::I32Load8S | R::I32Load8U
            | R::I32Load16S | R::I32Load16U | R::I64Load8S | R::I64Load8U | R::I64Load16S
            | R::I64Load16U | R::I64Load32S | R::I64Load32U => {
                self.emit_load(inst)?;
            }
            R::I32Store | R::I64Store | R::F32Store | R::F64Store | R::I32Store8
            | R::I32Store16 | R::I64Store8 | R::I64Store16 | R::I64Store32 => {
                self.emit_store(inst)?;
            }

            // Divisions: divisor checked first, then the overflow pair.
            R::I32DivS | R::I32DivU | R::I32RemS | R::I32RemU | R::I64DivS | R::I64DivU
            | R::I64RemS | R::I64RemU => self.emit_div(inst),

            // Shifts and rotates via cl.
            R::I32Shl | R::I32ShrS | R::I32ShrU | R::I64Shl | R::I64ShrS | R::I64ShrU
            | R::I32Rotl | R::I32Rotr | R::I64Rotl | R::I64Rotr => self.emit_shift(inst),
            R::I32ShlImm | R::I32ShrSImm | R::I32ShrUImm => {
                let a = self.value_in(inst.a, RAX);
                self.asm.mov_rr(RAX, a);
                let sub = match inst.op {
                    R::I32ShlImm => 4,
                    R::I32ShrUImm => 5,
                    _ => 7,
                };
                self.asm.byte(0xc1);
                self.asm.modrm(3, sub, RAX);
                self.asm.byte((inst.imm & 31) as u8);
                self.store_result(inst.dst, RAX);
            }

            // Bit counting.
            R::I32Clz => self.emit_clz(inst, false),
            R::I64Clz => self.emit_clz(inst, true),
            R::I32Ctz => self.emit_ctz(inst, false),
            R::I64Ctz => self.emit_ctz(inst, true),
            R::I32Popcnt | R::I64Popcnt => {
                let wide = inst.op == R::I64Popcnt;
                let a = self.value_in(inst.a, RAX);
                self.asm.byte(0xf3);
                self.asm.rex(wide, RAX, 0, a);
                self.asm.bytes(&[0x0f, 0xb8]);
                self.asm.modrm(3, RAX, a);
                self.store_result(inst.dst, RAX);
            }

            // Comparisons producing 0/1.
            R::I32Eqz | R::I64Eqz => {
                let wide = inst.op == R::I64Eqz;
                let a = self.value_in(inst.a, RAX);
                self.asm.alu_rr(wide, 0x85, a, a);
                self.emit_setcc(inst.dst, 0x4);
            }
            R::I32Eq | R::I32Ne | R::I32LtS | R::I32LtU | R::I32GtS | R::I32GtU | R::I32LeS
            | R::I32LeU | R::I32GeS | R::I32GeU | R::I64Eq | R::I64Ne | R::I64LtS | R::I64LtU
            | R::I64GtS | R::I64GtU | R::I64LeS | R::I64LeU | R::I64GeS | R::I64GeU => {
                let (cond, wide) = cmp_shape(inst.op);
                let a = self.value_in(inst.a, RAX);
                let b = self.value_in(inst.b, RDX);
                self.asm.alu_rr(wide, 0x39, a, b);
                self.emit_setcc(inst.dst, cc_of(cond));
            }

            // Plain ALU.
            R::I32Add | R::I32Sub | R::I32Mul | R::I32And | R::I32Or | R::I32Xor | R::I64Add
            | R::I64Sub | R::I64Mul | R::I64And | R::I64Or | R::I64Xor => {
                let (opcode, wide, is_mul) = alu_shape(inst.op);
                self.value_into(inst.a, RAX);
                let b = self.value_in(inst.b, RDX);
                if is_mul {
                    // imul rax, b
                    self.asm.rex(wide, RAX, 0, b);
                    self.asm.bytes(&[0x0f, 0xaf]);
                    self.asm.modrm(3, RAX, b);
                } else {
                    self.asm.alu_rr(wide, opcode, RAX, b);
                }
                self.store_result(inst.dst, RAX);
            }
            R::I32AddImm | R::I32AndImm | R::I32OrImm | R::I32XorImm | R::I32MulImm => {
                self.value_into(inst.a, RAX);
                match inst.op {
                    R::I32MulImm => {
                        // imul eax, eax, imm32
                        self.asm.byte(0x69);
                        self.asm.modrm(3, RAX, RAX);
                        self.asm.imm32(inst.imm);
                    }
                    other => {
                        let sub = match other {
                            R::I32AddImm => 0,
                            R::I32AndImm => 4,
                            R::I32OrImm => 1,
                            _ => 6, // xor
                        };
                        self.asm.byte(0x81);
                        self.asm.modrm(3, sub, RAX);
                        self.asm.imm32(inst.imm);
                    }
                }
                self.store_result(inst.dst, RAX);
            }
            R::I64AddImm | R::I64AndImm | R::I64OrImm | R::I64XorImm => {
                self.value_into(inst.a, RAX);
                self.asm.mov_ri(RDX, self.rir.wide[inst.imm as usize]);
                let opcode = match inst.op {
                    R::I64AddImm => 0x01,
                    R::I64AndImm => 0x21,
                    R::I64OrImm => 0x09,
                    _ => 0x31,
                };
                self.asm.alu_rr(true, opcode, RAX, RDX);
                self.store_result(inst.dst, RAX);
            }

            // Width changes.
            R::I32WrapI64 => {
                let a = self.value_in(inst.a, RAX);
                // mov eax, a32 zero-extends.
                self.asm.rex(false, a, 0, RAX);
                self.asm.byte(0x89);
                self.asm.modrm(3, a, RAX);
                self.store_result(inst.dst, RAX);
            }
            R::I64ExtendI32U => {
                let a = self.value_in(inst.a, RAX);
                self.asm.rex(false, a, 0, RAX);
                self.asm.byte(0x89);
                self.asm.modrm(3, a, RAX);
                self.store_result(inst.dst, RAX);
            }
            R::I64ExtendI32S => {
                let a = self.value_in(inst.a, RAX);
                // movsxd rax, a32
                self.asm.rex(true, RAX, 0, a);
                self.asm.byte(0x63);
                self.asm.modrm(3, RAX, a);
                self.store_result(inst.dst, RAX);
            }
            R::I32Extend8S | R::I64Extend8S => {
                let wide = inst.op == R::I64Extend8S;
                let a = self.value_in(inst.a, RAX);
                self.asm.rex_force(wide, RAX, 0, a);
                self.asm.bytes(&[0x0f, 0xbe]);
                self.asm.modrm(3, RAX, a);
                self.store_result(inst.dst, RAX);
            }
            R::I32Extend16S | R::I64Extend16S => {
                let wide = inst.op == R::I64Extend16S;
                let a = self.value_in(inst.a, RAX);
                self.asm.rex(wide, RAX, 0, a);
                self.asm.bytes(&[0x0f, 0xbf]);
                self.asm.modrm(3, RAX, a);
                self.store_result(inst.dst, RAX);
            }
            R::I64Extend32S => {
                let a = self.value_in(inst.a, RAX);
                self.asm.rex(true, RAX, 0, a);
                self.asm.byte(0x63);
                self.asm.modrm(3, RAX, a);
                self.store_result(inst.dst, RAX);
            }

            // Float arithmetic through the vector scratch registers.
            R::F32Add | R::F32Sub | R::F32Mul | R::F32Div | R::F64Add | R::F64Sub | R::F64Mul
            | R::F64Div => self.emit_float_arith(inst),
            R::F32Sqrt | R::F64Sqrt => self.emit_float_sqrt(inst),
            R::F32Abs => self.emit_float_mask(inst, 0x7fff_ffff, 0x21),
            R::F32Neg => self.emit_float_mask(inst, 0x8000_0000, 0x31),
            R::F64Abs => self.emit_float_mask64(inst, 0x7fff_ffff_ffff_ffff, 0x21),
            R::F64Neg => self.emit_float_mask64(inst, 0x8000_0000_0000_0000, 0x31),
            R::F32DemoteF64 => self.emit_float_cvt(inst, &[0xf2, 0x0f, 0x5a], false),
            R::F64PromoteF32 => self.emit_float_cvt(inst, &[0xf3, 0x0f, 0x5a], true),

            _ => return Err(CompileError::Unsupported),
        }
        Ok(())
    }

    // rax = helper address; rdi = ctx. Arguments beyond that are placed by
    // the caller around this.
    fn emit_helper_preamble(&mut self, helper_offset: u32) {
        self.asm.mov_rr(RDI, R12);
        self.asm.load_rm(RAX, R12, helper_offset as i32);
    }

    fn reload_memory(&mut self) {
        self.asm.load_rm(R13, R12, CTX_MEMORY_BASE as i32);
    }

    fn emit_setcc(&mut self, dst: u16, cc: u8) {
        // setcc al; movzx eax, al
        self.asm.bytes(&[0x0f, 0x90 + cc]);
        self.asm.modrm(3, 0, RAX);
        self.asm.bytes(&[0x0f, 0xb6]);
        self.asm.modrm(3, RAX, RAX);
        self.store_result(dst, RAX);
    }

    // Computes the effective address into rax; traps to the OOB stub when
    // out of range (explicitly, or later via the guard fault).
    fn emit_address(&mut self, addr_vreg: u16, offset: u64, width: u32) -> Result<(), CompileError> {
        if offset > u64::from(u32::MAX) {
            // Statically out of range for a 32-bit memory.
            self.jump_to_stub(Stub::Oob);
            return Ok(());
        }
        let addr = self.value_in(addr_vreg, RAX);
        // mov eax, addr32 (zero-extend).
        self.asm.rex(false, addr, 0, RAX);
        self.asm.byte(0x89);
        self.asm.modrm(3, addr, RAX);
        if offset != 0 {
            if offset <= 0x7fff_ffff {
                // add rax, imm32
                self.asm.rex(true, 0, 0, RAX);
                self.asm.byte(0x81);
                self.asm.modrm(3, 0, RAX);
                self.asm.imm32(offset as u32);
            } else {
                self.asm.mov_ri(RDX, offset);
                self.asm.alu_rr(true, 0x01, RAX, RDX);
            }
        }
        if !self.layout.guard_mode {
            // rdx = rax + width; cmp rdx, [r12 + size]; ja oob
            self.asm.mov_rr(RDX, RAX);
            self.asm.rex(true, 0, 0, RDX);
            self.asm.byte(0x81);
            self.asm.modrm(3, 0, RDX);
            self.asm.imm32(width);
            self.asm.rex(true, RDX, 0, R12);
            self.asm.byte(0x3b);
            self.asm.mem(RDX, R12, CTX_MEMORY_SIZE as i32);
            self.jcc_to_stub(0x7, Stub::Oob);
        }
        Ok(())
    }

    // ModRM+SIB for [r13 + rax].
    fn mem_operand(&mut self, reg: u8) {
        // mod=01 (disp8 0) because r13 as base cannot use mod=00.
        self.asm.modrm(1, reg, RSP);
        self.asm.byte((RAX & 7) << 3 | (R13 & 7));
        self.asm.byte(0);
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
        self.emit_address(inst.a, marg.offset, width)?;
        if marg.offset > u64::from(u32::MAX) {
            return Ok(());
        }

        // Load into rax from [r13 + rax].
        match inst.op {
            R::I32Load | R::F32Load | R::I64Load32U => {
                // mov eax, [r13+rax]
                self.asm.rex(false, RAX, RAX, R13);
                self.asm.byte(0x8b);
                self.mem_operand(RAX);
            }
            R::I64Load | R::F64Load => {
                self.asm.rex(true, RAX, RAX, R13);
                self.asm.byte(0x8b);
                self.mem_operand(RAX);
            }
            R::I32Load8U | R::I64Load8U => {
                self.asm.rex(false, RAX, RAX, R13);
                self.asm.bytes(&[0x0f, 0xb6]);
                self.mem_operand(RAX);
            }
            R::I32Load16U | R::I64Load16U => {
                self.asm.rex(false, RAX, RAX, R13);
                self.asm.bytes(&[0x0f, 0xb7]);
                self.mem_operand(RAX);
            }
            R::I32Load8S => {
                self.asm.rex(false, RAX, RAX, R13);
                self.asm.bytes(&[0x0f, 0xbe]);
                self.mem_operand(RAX);
            }
            R::I64Load8S => {
                self.asm.rex(true, RAX, RAX, R13);
                self.asm.bytes(&[0x0f, 0xbe]);
                self.mem_operand(RAX);
            }
            R::I32Load16S => {
                self.asm.rex(false, RAX, RAX, R13);
                self.asm.bytes(&[0x0f, 0xbf]);
                self.mem_operand(RAX);
            }
            R::I64Load16S => {
                self.asm.rex(true, RAX, RAX, R13);
                self.asm.bytes(&[0x0f, 0xbf]);
                self.mem_operand(RAX);
            }
            R::I64Load32S => {
                self.asm.rex(true, RAX, RAX, R13);
                self.asm.byte(0x63);
                self.mem_operand(RAX);
            }
            _ => unreachable!(),
        }
        self.store_result(inst.dst, RAX);
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
        self.emit_address(inst.a, marg.offset, width)?;
        if marg.offset > u64::from(u32::MAX) {
            return Ok(());
        }
        self.value_into(inst.b, RDX);

        match width {
            1 => {
                self.asm.rex(false, RDX, RAX, R13);
                self.asm.byte(0x88);
                self.mem_operand(RDX);
            }
            2 => {
                self.asm.byte(0x66);
                self.asm.rex(false, RDX, RAX, R13);
                self.asm.byte(0x89);
                self.mem_operand(RDX);
            }
            4 => {
                self.asm.rex(false, RDX, RAX, R13);
                self.asm.byte(0x89);
                self.mem_operand(RDX);
            }
            _ => {
                self.asm.rex(true, RDX, RAX, R13);
                self.asm.byte(0x89);
                self.mem_operand(RDX);
            }
        }
        Ok(())
    }

    fn emit_div(&mut self, inst: RirInst) {
        use RirOp as R;
        let wide = matches!(inst.op, R::I64DivS | R::I64DivU | R::I64RemS | R::I64RemU);
        let signed = matches!(inst.op, R::I32DivS | R::I32RemS | R::I64DivS | R::I64RemS);
        let is_rem = matches!(inst.op, R::I32RemS | R::I32RemU | R::I64RemS | R::I64RemU);

        // Divisor into rcx's slot? rcx may be live. Keep the divisor where
        // it is: registers divide directly, spills divide from memory.
        // The divisor check comes first.
        match self.place(inst.b) {
            Place::Reg(reg) => {
                self.asm.alu_rr(wide, 0x85, reg, reg);
            }
            Place::Frame(disp) => {
                // cmp qword [rbp+disp], 0
                self.asm.rex(wide, 0, 0, RBP);
                self.asm.byte(0x83);
                self.asm.mem(7, RBP, disp);
                self.asm.byte(0);
            }
        }
        self.jcc_to_stub(0x4, Stub::DivZero);

        self.value_into(inst.a, RAX);

        if signed {
            // The MIN / -1 pair overflows; remainder of that pair is 0.
            // cmp b, -1; jne ok; cmp rax, MIN; jne ok → for division this
            // traps, for remainder it yields zero.
            match self.place(inst.b) {
                Place::Reg(reg) => {
                    self.asm.rex(wide, 0, 0, reg);
                    self.asm.byte(0x83);
                    self.asm.modrm(3, 7, reg);
                    self.asm.byte(0xff);
                }
                Place::Frame(disp) => {
                    self.asm.rex(wide, 0, 0, RBP);
                    self.asm.byte(0x83);
                    self.asm.mem(7, RBP, disp);
                    self.asm.byte(0xff);
                }
            }
            let skip_minmax = self.asm.jcc_rel32(0x5); // jne
            // cmp rax against MIN.
            if wide {
                self.asm.mov_ri(RDX, i64::MIN as u64);
                self.asm.alu_rr(true, 0x39, RAX, RDX);
            } else {
                self.asm.byte(0x3d);
                self.asm.imm32(i32::MIN as u32);
            }
            let not_min = self.asm.jcc_rel32(0x5); // jne
            if is_rem {
                // Result is zero.
                self.asm.alu_rr(false, 0x31, RAX, RAX);
                let done = self.asm.jmp_rel32();
                let resume = self.asm.here();
                self.asm.patch_rel32(skip_minmax, resume);
                self.asm.patch_rel32(not_min, resume);
                self.emit_div_core(inst, wide, signed, is_rem);
                let after = self.asm.here();
                self.asm.patch_rel32(done, after);
                self.store_result(inst.dst, RAX);
                return;
            }
            self.jump_to_stub(Stub::IntOverflow);
            let resume = self.asm.here();
            self.asm.patch_rel32(skip_minmax, resume);
            self.asm.patch_rel32(not_min, resume);
        }

        self.emit_div_core(inst, wide, signed, is_rem);
        self.store_result(inst.dst, RAX);
    }

    fn emit_div_core(&mut self, inst: RirInst, wide: bool, signed: bool, is_rem: bool) {
        if signed {
            // cdq / cqo
            if wide {
                self.asm.byte(0x48);
            }
            self.asm.byte(0x99);
        } else {
            self.asm.alu_rr(false, 0x31, RDX, RDX); // xor edx, edx
        }
        let sub = if signed { 7 } else { 6 };
        match self.place(inst.b) {
            Place::Reg(reg) => {
                self.asm.rex(wide, 0, 0, reg);
                self.asm.byte(0xf7);
                self.asm.modrm(3, sub, reg);
            }
            Place::Frame(disp) => {
                self.asm.rex(wide, 0, 0, RBP);
                self.asm.byte(0xf7);
                self.asm.mem(sub, RBP, disp);
            }
        }
        if is_rem {
            self.asm.mov_rr(RAX, RDX);
            if !wide {
                // Re-normalize the 32-bit remainder.
                self.asm.rex(false, RAX, 0, RAX);
                self.asm.byte(0x89);
                self.asm.modrm(3, RAX, RAX);
            }
        }
    }

    fn emit_shift(&mut self, inst: RirInst) {
        use RirOp as R;
        let wide = matches!(
            inst.op,
            R::I64Shl | R::I64ShrS | R::I64ShrU | R::I64Rotl | R::I64Rotr
        );
        let sub = match inst.op {
            R::I32Shl | R::I64Shl => 4,
            R::I32ShrU | R::I64ShrU => 5,
            R::I32ShrS | R::I64ShrS => 7,
            R::I32Rotl | R::I64Rotl => 0,
            _ => 1, // ror
        };

        self.value_into(inst.a, RAX);
        // Preserve rcx in rdx (it may hold a live value), load the count,
        // shift, restore.
        self.asm.mov_rr(RDX, RCX);
        let count = self.value_in(inst.b, RCX);
        if count != RCX {
            // mov ecx, count32
            self.asm.rex(false, count, 0, RCX);
            self.asm.byte(0x89);
            self.asm.modrm(3, count, RCX);
        }
        self.asm.rex(wide, 0, 0, RAX);
        self.asm.byte(0xd3);
        self.asm.modrm(3, sub, RAX);
        self.asm.mov_rr(RCX, RDX);
        self.store_result(inst.dst, RAX);
    }

    fn emit_clz(&mut self, inst: RirInst, wide: bool) {
        let bits = if wide { 64u32 } else { 32 };
        self.value_into(inst.a, RDX);
        self.asm.mov_ri(RAX, u64::from(bits));
        self.asm.alu_rr(wide, 0x85, RDX, RDX); // test
        let zero = self.asm.jcc_rel32(0x4);
        // bsr rax, rdx; rax = bits-1 - rax
        self.asm.rex(wide, RAX, 0, RDX);
        self.asm.bytes(&[0x0f, 0xbd]);
        self.asm.modrm(3, RAX, RDX);
        // xor rax, bits-1 (equivalent to bits-1 - rax for in-range values)
        self.asm.rex(wide, 0, 0, RAX);
        self.asm.byte(0x83);
        self.asm.modrm(3, 6, RAX);
        self.asm.byte((bits - 1) as u8);
        let end = self.asm.here();
        self.asm.patch_rel32(zero, end);
        self.store_result(inst.dst, RAX);
    }

    fn emit_ctz(&mut self, inst: RirInst, wide: bool) {
        let bits = if wide { 64u32 } else { 32 };
        self.value_into(inst.a, RDX);
        self.asm.mov_ri(RAX, u64::from(bits));
        self.asm.alu_rr(wide, 0x85, RDX, RDX);
        let zero = self.asm.jcc_rel32(0x4);
        // bsf rax, rdx
        self.asm.rex(wide, RAX, 0, RDX);
        self.asm.bytes(&[0x0f, 0xbc]);
        self.asm.modrm(3, RAX, RDX);
        let end = self.asm.here();
        self.asm.patch_rel32(zero, end);
        self.store_result(inst.dst, RAX);
    }

    fn emit_float_arith(&mut self, inst: RirInst) {
        use RirOp as R;
        let (prefix, op) = match inst.op {
            R::F32Add => (0xf3, 0x58),
            R::F32Sub => (0xf3, 0x5c),
            R::F32Mul => (0xf3, 0x59),
            R::F32Div => (0xf3, 0x5e),
            R::F64Add => (0xf2, 0x58),
            R::F64Sub => (0xf2, 0x5c),
            R::F64Mul => (0xf2, 0x59),
            R::F64Div => (0xf2, 0x5e),
            _ => unreachable!(),
        };
        let wide = prefix == 0xf2;
        self.value_into(inst.a, RAX);
        self.value_into(inst.b, RDX);
        self.movq_to_xmm(0, RAX, wide);
        self.movq_to_xmm(1, RDX, wide);
        // op xmm0, xmm1
        self.asm.byte(prefix);
        self.asm.bytes(&[0x0f, op]);
        self.asm.modrm(3, 0, 1);
        self.movq_from_xmm(RAX, 0, wide);
        self.store_result(inst.dst, RAX);
    }

    fn emit_float_sqrt(&mut self, inst: RirInst) {
        let wide = inst.op == RirOp::F64Sqrt;
        self.value_into(inst.a, RAX);
        self.movq_to_xmm(0, RAX, wide);
        self.asm.byte(if wide { 0xf2 } else { 0xf3 });
        self.asm.bytes(&[0x0f, 0x51]);
        self.asm.modrm(3, 0, 0);
        self.movq_from_xmm(RAX, 0, wide);
        self.store_result(inst.dst, RAX);
    }

    // f32 abs/neg as integer masking; alu_op 0x21 = and, 0x31 = xor.
    fn emit_float_mask(&mut self, inst: RirInst, mask: u32, alu_op: u8) {
        self.value_into(inst.a, RAX);
        self.asm.mov_ri(RDX, u64::from(mask));
        self.asm.alu_rr(false, alu_op, RAX, RDX);
        self.store_result(inst.dst, RAX);
    }

    fn emit_float_mask64(&mut self, inst: RirInst, mask: u64, alu_op: u8) {
        self.value_into(inst.a, RAX);
        self.asm.mov_ri(RDX, mask);
        self.asm.alu_rr(true, alu_op, RAX, RDX);
        self.store_result(inst.dst, RAX);
    }

    fn emit_float_cvt(&mut self, inst: RirInst, opcode: &[u8], from_f32: bool) {
        self.value_into(inst.a, RAX);
        self.movq_to_xmm(0, RAX, !from_f32);
        self.asm.bytes(opcode);
        self.asm.modrm(3, 0, 0);
        self.movq_from_xmm(RAX, 0, from_f32);
        self.store_result(inst.dst, RAX);
    }

    // movq/movd xmm, r.
    fn movq_to_xmm(&mut self, xmm: u8, reg: u8, wide: bool) {
        self.asm.byte(0x66);
        if wide || reg >= 8 {
            self.asm.rex_force(wide, xmm, 0, reg);
        }
        self.asm.bytes(&[0x0f, 0x6e]);
        self.asm.modrm(3, xmm, reg);
    }

    // movq/movd r, xmm.
    fn movq_from_xmm(&mut self, reg: u8, xmm: u8, wide: bool) {
        self.asm.byte(0x66);
        if wide || reg >= 8 {
            self.asm.rex_force(wide, xmm, 0, reg);
        }
        self.asm.bytes(&[0x0f, 0x7e]);
        self.asm.modrm(3, xmm, reg);
    }

    // A cross-function call through the interpreter trampoline.
    fn emit_call(&mut self, inst: RirInst) -> Result<(), CompileError> {
        let site = self.rir.calls[inst.imm as usize].clone();
        if site.target == self.layout.func_index {
            return self.emit_self_call(inst);
        }

        self.stage_args(&site.args);
        self.asm.mov_rr(RDI, R12);
        self.asm.mov_ri(RSI, u64::from(site.target));
        // rdx = out area pointer
        self.lea_out_area(RDX);
        self.asm
            .mov_ri(RCX, (site.args.len() as u64) << 32 | site.rets.len() as u64);
        self.asm.load_rm(RAX, R12, CTX_CALL_HELPER as i32);
        self.asm.call_reg(RAX);
        self.check_helper_status();
        self.reload_memory();
        self.unstage_rets(&site.rets);
        Ok(())
    }

    fn emit_call_indirect(&mut self, inst: RirInst) -> Result<(), CompileError> {
        let site = self.rir.calls[inst.imm as usize].clone();
        self.stage_args(&site.args);
        // rdx = table index value (before rdi/rsi are set up).
        self.value_into(site.addr, RDX);
        self.asm.mov_rr(RDI, R12);
        self.asm
            .mov_ri(RSI, (u64::from(site.target)) << 32 | u64::from(site.table));
        self.lea_out_area(RCX);
        // r8 = counts
        self.asm
            .mov_ri(8, (site.args.len() as u64) << 32 | site.rets.len() as u64);
        self.asm.load_rm(RAX, R12, CTX_INDIRECT_HELPER as i32);
        self.asm.call_reg(RAX);
        self.check_helper_status();
        self.reload_memory();
        self.unstage_rets(&site.rets);
        Ok(())
    }

    // Self recursion compiles to a direct call of the internal entry.
    fn emit_self_call(&mut self, inst: RirInst) -> Result<(), CompileError> {
        let site = self.rir.calls[inst.imm as usize].clone();
        self.stage_args(&site.args);
        self.asm.mov_rr(RDI, R12);
        self.lea_out_area(RSI);
        // call rel32 to the internal entry (offset known: right after the
        // external entry's load+jmp).
        self.asm.byte(0xe8);
        let at = self.asm.here();
        self.asm.imm32(0);
        let internal_entry = internal_entry_offset();
        self.asm.patch_rel32(at, internal_entry);
        self.check_helper_status();
        self.reload_memory();
        self.unstage_rets(&site.rets);
        Ok(())
    }

    // Self tail call: stage the new arguments and restart the body.
    fn emit_self_tail_call(&mut self, inst: RirInst) {
        let site = self.rir.calls[inst.imm as usize].clone();
        self.stage_args(&site.args);
        self.burn_fuel();
        let at = self.asm.jmp_rel32();
        self.asm.patch_rel32(at, self.restart);
    }

    fn stage_args(&mut self, args: &[u16]) {
        for (i, &vreg) in args.iter().enumerate() {
            let value = self.value_in(vreg, RAX);
            self.asm.store_mr(RBP, self.out_area + i as i32 * 8, value);
        }
    }

    fn unstage_rets(&mut self, rets: &[u16]) {
        for (i, &vreg) in rets.iter().enumerate() {
            self.asm.load_rm(RAX, RBP, self.out_area + i as i32 * 8);
            self.store_result(vreg, RAX);
        }
    }

    fn lea_out_area(&mut self, dst: u8) {
        self.asm.rex(true, dst, 0, RBP);
        self.asm.byte(0x8d);
        self.asm.mem(dst, RBP, self.out_area);
    }

    fn check_helper_status(&mut self) {
        // test rax, rax; jnz common exit (rax carries the code).
        self.asm.alu_rr(true, 0x85, RAX, RAX);
        let at = self.asm.jcc_rel32(0x5);
        self.exit_fixups.push((at, Stub::CommonExit));
    }
}

// The internal entry sits right past the external entry's two
// instructions: mov rsi, [rdi+0] (4 bytes: REX 8B /r + modrm + sib? none —
// disp32 form is 8 bytes) then jmp rel32 (5 bytes).
fn internal_entry_offset() -> u32 {
    // mov rsi, [rdi + disp32]: REX.W(1) + 8B(1) + modrm(1) + disp32(4) = 7
    // jmp rel32: 5
    12
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

// (r/m-form opcode, wide, is_mul).
fn alu_shape(op: RirOp) -> (u8, bool, bool) {
    use RirOp as R;
    match op {
        R::I32Add => (0x01, false, false),
        R::I32Sub => (0x29, false, false),
        R::I32Mul => (0, false, true),
        R::I32And => (0x21, false, false),
        R::I32Or => (0x09, false, false),
        R::I32Xor => (0x31, false, false),
        R::I64Add => (0x01, true, false),
        R::I64Sub => (0x29, true, false),
        R::I64Mul => (0, true, true),
        R::I64And => (0x21, true, false),
        R::I64Or => (0x09, true, false),
        R::I64Xor => (0x31, true, false),
        _ => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn asm_mov_encodings() {
        let mut asm = Asm::new();
        asm.mov_rr(RAX, RSI); // mov rax, rsi
        assert_eq!(asm.code, vec![0x48, 0x89, 0xf0]);

        let mut asm = Asm::new();
        asm.mov_ri(RAX, 7); // mov eax, 7
        assert_eq!(asm.code, vec![0xb8, 7, 0, 0, 0]);

        let mut asm = Asm::new();
        asm.mov_ri(R13, 0x1_0000_0000); // movabs r13, ...
        assert_eq!(asm.code[..2], [0x49, 0xbd]);

        let mut asm = Asm::new();
        asm.load_rm(RAX, R12, 0x10); // mov rax, [r12+0x10]
        assert_eq!(asm.code, vec![0x49, 0x8b, 0x84, 0x24, 0x10, 0, 0, 0]);
    }

    #[test]
    fn rel32_patching() {
        let mut asm = Asm::new();
        let at = asm.jmp_rel32();
        asm.byte(0x90);
        let target = asm.here();
        asm.patch_rel32(at, target);
        // jmp +1 over the nop.
        assert_eq!(asm.code, vec![0xe9, 1, 0, 0, 0, 0x90]);
    }

    #[test]
    fn internal_entry_offset_matches_emission() {
        let mut asm = Asm::new();
        asm.load_rm(RSI, RDI, CTX_FRAME_BASE as i32);
        asm.jmp_rel32();
        assert_eq!(asm.here(), internal_entry_offset());
    }
}
