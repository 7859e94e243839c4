// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Register IR (RIR).
//!
//! Eliminates the operand stack from PIR. Locals get dedicated virtual
//! registers that persist across instructions; every pushed value gets the
//! register of its stack position, so the register holding a value at a
//! given height is the same on every path into a join and branch result
//! copies become plain register moves (frequently none at all).
//!
//! Peepholes applied during construction:
//! - fold a constant feeding a binary op into an immediate-form op;
//! - collapse `local.get` / `local.set` pairs into a single move;
//! - fuse a comparison immediately followed by a conditional branch into
//!   `br_cmp`;
//! - elide moves whose source and destination coincide.
//!
//! Functions using constructs the register form does not model (v128
//! values, GC objects, exception handling, reference and table traffic,
//! bulk memory) stay on the PIR tier; building them reports
//! [`RirError::Unsupported`].

pub(crate) mod regalloc;

use std::collections::{HashMap, HashSet};

use thiserror::Error;

use crate::pir::{PirFunction, PirInst, PirMemArg, PirOp};
use crate::types::{FuncIdx, ModuleInner};

/// Errors from register-IR construction.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RirError {
    /// The function uses a construct the register tier does not model; it
    /// stays on the PIR interpreter.
    #[error("construct unsupported by the register tier")]
    Unsupported,
    #[error("inconsistent IR while building register form")]
    InvalidIR,
}

/// Branch conditions for fused compare-and-branch.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u16)]
pub(crate) enum Cond {
    Eq = 0,
    Ne,
    LtS,
    LtU,
    GtS,
    GtU,
    LeS,
    LeU,
    GeS,
    GeU,
}

impl Cond {
    pub(crate) fn from_u16(bits: u16) -> Cond {
        match bits {
            0 => Cond::Eq,
            1 => Cond::Ne,
            2 => Cond::LtS,
            3 => Cond::LtU,
            4 => Cond::GtS,
            5 => Cond::GtU,
            6 => Cond::LeS,
            7 => Cond::LeU,
            8 => Cond::GeS,
            _ => Cond::GeU,
        }
    }

    pub(crate) fn invert(self) -> Cond {
        match self {
            Cond::Eq => Cond::Ne,
            Cond::Ne => Cond::Eq,
            Cond::LtS => Cond::GeS,
            Cond::LtU => Cond::GeU,
            Cond::GtS => Cond::LeS,
            Cond::GtU => Cond::LeU,
            Cond::LeS => Cond::GtS,
            Cond::LeU => Cond::GtU,
            Cond::GeS => Cond::LtS,
            Cond::GeU => Cond::LtU,
        }
    }
}

// (condition, is_64) of a pure comparison op.
fn cond_of_cmp(op: RirOp) -> Option<(Cond, bool)> {
    use RirOp as R;
    Some(match op {
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
        _ => return None,
    })
}

/// A register-form instruction. Operand meanings vary by op; `dst`/`a`/`b`
/// name virtual registers unless noted.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct RirInst {
    pub op: RirOp,
    pub dst: u16,
    pub a: u16,
    pub b: u16,
    pub imm: u32,
}

impl RirInst {
    fn new(op: RirOp) -> Self {
        Self {
            op,
            dst: 0,
            a: 0,
            b: 0,
            imm: 0,
        }
    }
}

/// Register-form opcodes.
///
/// Unary ops read `a` into `dst`; binary ops compute `dst = a <op> b`;
/// immediate forms replace `b` with `imm` (or a wide-pool index for 64-bit
/// immediates). Branch targets live in `imm`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum RirOp {
    Nop,
    Unreachable,
    /// dst <- a.
    Move,
    /// dst <- imm (i32/f32 bits).
    Const32,
    /// dst <- wide[imm] (i64/f64 bits).
    Const64,

    Br,
    /// Branch to `imm` when `a` is zero.
    BrIfZero,
    /// Branch to `imm` when `a` is non-zero.
    BrIfNonZero,
    /// Fused compare-and-branch: branch to `imm` when `a <cond> b`; the
    /// condition lives in `dst`.
    BrCmpI32,
    BrCmpI64,
    /// Indexed dispatch on `a`; `imm` names a branch table whose entries
    /// (default last) are RIR targets.
    BrTable,

    /// Return; `a` names the result-register list.
    Ret,
    /// Call through site `imm` (see [`RirCallSite`]).
    Call,
    CallIndirect,
    ReturnCall,
    ReturnCallIndirect,

    /// dst <- (imm-reg != 0) ? a : b.
    Select,

    /// dst <- global[imm] / global[imm] <- a.
    GlobalGet,
    GlobalSet,

    /// Loads: dst <- memory[a + memarg(imm)]; stores: memory[a + ...] <- b.
    I32Load,
    I64Load,
    F32Load,
    F64Load,
    I32Load8S,
    I32Load8U,
    I32Load16S,
    I32Load16U,
    I64Load8S,
    I64Load8U,
    I64Load16S,
    I64Load16U,
    I64Load32S,
    I64Load32U,
    I32Store,
    I64Store,
    F32Store,
    F64Store,
    I32Store8,
    I32Store16,
    I64Store8,
    I64Store16,
    I64Store32,
    /// dst <- size of memory `imm`, in pages.
    MemorySize,
    /// dst <- grow of memory `imm` by `a` pages.
    MemoryGrow,

    // i32 ALU.
    I32Eqz,
    I32Eq,
    I32Ne,
    I32LtS,
    I32LtU,
    I32GtS,
    I32GtU,
    I32LeS,
    I32LeU,
    I32GeS,
    I32GeU,
    I32Clz,
    I32Ctz,
    I32Popcnt,
    I32Add,
    I32Sub,
    I32Mul,
    I32DivS,
    I32DivU,
    I32RemS,
    I32RemU,
    I32And,
    I32Or,
    I32Xor,
    I32Shl,
    I32ShrS,
    I32ShrU,
    I32Rotl,
    I32Rotr,
    I32AddImm,
    I32MulImm,
    I32AndImm,
    I32OrImm,
    I32XorImm,
    I32ShlImm,
    I32ShrSImm,
    I32ShrUImm,

    // i64 ALU.
    I64Eqz,
    I64Eq,
    I64Ne,
    I64LtS,
    I64LtU,
    I64GtS,
    I64GtU,
    I64LeS,
    I64LeU,
    I64GeS,
    I64GeU,
    I64Clz,
    I64Ctz,
    I64Popcnt,
    I64Add,
    I64Sub,
    I64Mul,
    I64DivS,
    I64DivU,
    I64RemS,
    I64RemU,
    I64And,
    I64Or,
    I64Xor,
    I64Shl,
    I64ShrS,
    I64ShrU,
    I64Rotl,
    I64Rotr,
    /// Immediate indexes the wide pool.
    I64AddImm,
    I64AndImm,
    I64OrImm,
    I64XorImm,

    // Floating point.
    F32Eq,
    F32Ne,
    F32Lt,
    F32Gt,
    F32Le,
    F32Ge,
    F64Eq,
    F64Ne,
    F64Lt,
    F64Gt,
    F64Le,
    F64Ge,
    F32Abs,
    F32Neg,
    F32Ceil,
    F32Floor,
    F32Trunc,
    F32Nearest,
    F32Sqrt,
    F32Add,
    F32Sub,
    F32Mul,
    F32Div,
    F32Min,
    F32Max,
    F32Copysign,
    F64Abs,
    F64Neg,
    F64Ceil,
    F64Floor,
    F64Trunc,
    F64Nearest,
    F64Sqrt,
    F64Add,
    F64Sub,
    F64Mul,
    F64Div,
    F64Min,
    F64Max,
    F64Copysign,

    // Conversions.
    I32WrapI64,
    I32TruncF32S,
    I32TruncF32U,
    I32TruncF64S,
    I32TruncF64U,
    I64ExtendI32S,
    I64ExtendI32U,
    I64TruncF32S,
    I64TruncF32U,
    I64TruncF64S,
    I64TruncF64U,
    F32ConvertI32S,
    F32ConvertI32U,
    F32ConvertI64S,
    F32ConvertI64U,
    F32DemoteF64,
    F64ConvertI32S,
    F64ConvertI32U,
    F64ConvertI64S,
    F64ConvertI64U,
    F64PromoteF32,
    I32Extend8S,
    I32Extend16S,
    I64Extend8S,
    I64Extend16S,
    I64Extend32S,
    I32TruncSatF32S,
    I32TruncSatF32U,
    I32TruncSatF64S,
    I32TruncSatF64U,
    I64TruncSatF32S,
    I64TruncSatF32U,
    I64TruncSatF64S,
    I64TruncSatF64U,
}

/// A call site's register shape.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct RirCallSite {
    /// Function index (direct calls) or type index (indirect calls).
    pub target: u32,
    /// Table index, for indirect calls.
    pub table: u32,
    /// The register holding the table address, for indirect calls.
    pub addr: u16,
    /// Argument registers, in order.
    pub args: Vec<u16>,
    /// Result destination registers, in order.
    pub rets: Vec<u16>,
}

/// A function in register form. The RIR interpreter executes directly over
/// the virtual register file; the JIT additionally runs the linear-scan
/// allocator over it.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct RirFunction {
    pub insts: Vec<RirInst>,
    /// Virtual registers holding locals (parameters first).
    pub num_locals: u16,
    /// Total virtual registers (locals + operand positions).
    pub num_regs: u16,
    pub param_count: u16,
    pub result_count: u16,
    pub memargs: Vec<PirMemArg>,
    pub wide: Vec<u64>,
    pub calls: Vec<RirCallSite>,
    /// Register lists (return values).
    pub lists: Vec<Vec<u16>>,
    /// Branch tables: RIR targets, default last.
    pub br_tables: Vec<Vec<u32>>,
    /// RIR PC -> PIR PC, for deopt and trap attribution.
    pub rir_to_pir: Vec<u32>,
    /// RIR PCs that are loop headers.
    pub loop_heads: Vec<u32>,
}

// Marker for RIR PCs not yet assigned (dead PIR instructions keep it).
const PENDING: u32 = u32::MAX;

enum Flow {
    Normal,
    /// Control never falls through; subsequent PIR code is reachable only
    /// via recorded joins.
    Transfer,
}

struct RirBuilder<'m, 'p> {
    module: &'m ModuleInner,
    pir: &'p PirFunction,
    out: RirFunction,
    /// Operand height, in slots; the value at height h lives in vreg
    /// num_locals + h.
    height: u32,
    /// rir_of_pir[pir_pc] = first RIR PC lowered from it.
    rir_of_pir: Vec<u32>,
    /// RIR instructions whose `imm` holds a PIR target awaiting remap.
    pending_branches: Vec<u32>,
    /// Operand heights at branch targets.
    join_heights: HashMap<u32, u32>,
    /// PIR PCs that are back-edge targets.
    loop_heads: HashSet<u32>,
    /// RIR length at the most recent join; peepholes never reach past it,
    /// so a value formed on one path is never folded into another.
    barrier: usize,
}

/// Builds the register form of a predecoded function.
pub(crate) fn build_rir(module: &ModuleInner, pir: &PirFunction) -> Result<RirFunction, RirError> {
    // The register tier models one value per register; any v128 traffic
    // stays on PIR.
    if pir.local_types.iter().any(|ty| ty.slot_count() != 1) {
        return Err(RirError::Unsupported);
    }

    let mut builder = RirBuilder {
        module,
        pir,
        out: RirFunction {
            num_locals: pir.local_slots as u16,
            num_regs: pir.local_slots as u16,
            param_count: pir.param_slots as u16,
            result_count: pir.result_slots as u16,
            memargs: pir.memargs.clone(),
            wide: pir.wide.clone(),
            ..Default::default()
        },
        height: 0,
        rir_of_pir: vec![PENDING; pir.insts.len()],
        pending_branches: Vec::new(),
        join_heights: HashMap::new(),
        loop_heads: pir.loop_heads.iter().copied().collect(),
        barrier: 0,
    };

    let mut dead = false;
    for pc in 0..pir.insts.len() {
        let is_join = builder.join_heights.contains_key(&(pc as u32))
            || builder.loop_heads.contains(&(pc as u32));
        if is_join {
            builder.barrier = builder.out.insts.len();
            if dead && let Some(&height) = builder.join_heights.get(&(pc as u32)) {
                builder.height = height;
                dead = false;
            }
        }
        if dead {
            // Unreachable forever (e.g. the tail of an infinite loop);
            // nothing branches here, so nothing is emitted.
            continue;
        }
        builder.rir_of_pir[pc] = builder.out.insts.len() as u32;
        match builder.lower(pc as u32, pir.insts[pc])? {
            Flow::Normal => {}
            Flow::Transfer => dead = true,
        }
    }

    // Remap branch targets from PIR to RIR PCs.
    let resolve = |pir_pc: u32, rir_of_pir: &[u32]| -> Result<u32, RirError> {
        rir_of_pir
            .get(pir_pc as usize)
            .copied()
            .filter(|&rir| rir != PENDING)
            .ok_or(RirError::InvalidIR)
    };
    for &at in &builder.pending_branches {
        let target = builder.out.insts[at as usize].imm;
        builder.out.insts[at as usize].imm = resolve(target, &builder.rir_of_pir)?;
    }
    for &head in &pir.loop_heads {
        if let Ok(rir) = resolve(head, &builder.rir_of_pir) {
            builder.out.loop_heads.push(rir);
        }
    }
    Ok(builder.out)
}

impl RirBuilder<'_, '_> {
    fn reg_at(&self, height: u32) -> u16 {
        self.pir.local_slots as u16 + height as u16
    }

    fn top(&self) -> u16 {
        self.reg_at(self.height - 1)
    }

    fn push_reg(&mut self) -> u16 {
        let reg = self.reg_at(self.height);
        self.height += 1;
        if reg + 1 > self.out.num_regs {
            self.out.num_regs = reg + 1;
        }
        reg
    }

    fn pop_reg(&mut self) -> u16 {
        self.height -= 1;
        self.reg_at(self.height)
    }

    fn emit(&mut self, pir_pc: u32, inst: RirInst) -> u32 {
        let pc = self.out.insts.len() as u32;
        self.out.insts.push(inst);
        self.out.rir_to_pir.push(pir_pc);
        pc
    }

    // Removes the most recently emitted instruction (peephole backtrack).
    fn unemit(&mut self) -> RirInst {
        self.out.rir_to_pir.pop();
        self.out.insts.pop().expect("peephole on empty stream")
    }

    fn emit_moves(&mut self, pir_pc: u32, copy: u32, dest: u32) {
        // Copy the top `copy` slots down to `dest`; positions usually agree
        // already, in which case nothing is emitted.
        let src_base = self.height - copy;
        if src_base == dest {
            return;
        }
        for i in 0..copy {
            let src = self.reg_at(src_base + i);
            let dst = self.reg_at(dest + i);
            self.emit(
                pir_pc,
                RirInst {
                    op: RirOp::Move,
                    dst,
                    a: src,
                    b: 0,
                    imm: 0,
                },
            );
        }
    }

    // Emits a branch whose `imm` holds a PIR target, recording the join
    // height at the destination.
    fn emit_branch(&mut self, pir_pc: u32, mut inst: RirInst, target: u32, join_height: u32) {
        inst.imm = target;
        let at = self.emit(pir_pc, inst);
        self.pending_branches.push(at);
        self.join_heights.insert(target, join_height);
    }

    // The previous instruction when it is a comparison defining `reg` in
    // the current straight-line region.
    fn fusable_cmp(&self, reg: u16) -> Option<(RirInst, Cond, bool)> {
        if self.out.insts.len() <= self.barrier {
            return None;
        }
        let last = *self.out.insts.last()?;
        if last.dst != reg {
            return None;
        }
        let (cond, is_64) = cond_of_cmp(last.op)?;
        Some((last, cond, is_64))
    }

    // Reads a popped temp through an immediately-preceding move out of a
    // local, eliding the move.
    fn read_through(&mut self, reg: u16) -> u16 {
        if reg < self.out.num_locals || self.out.insts.len() <= self.barrier {
            return reg;
        }
        match self.out.insts.last() {
            Some(last) if last.op == RirOp::Move && last.dst == reg => {
                let src = last.a;
                self.unemit();
                src
            }
            _ => reg,
        }
    }

    fn lower(&mut self, pc: u32, inst: PirInst) -> Result<Flow, RirError> {
        use PirOp as P;
        use RirOp as R;

        let PirInst { op, a, b, c } = inst;
        match op {
            P::Nop => {}
            P::Unreachable => {
                self.emit(pc, RirInst::new(R::Unreachable));
                return Ok(Flow::Transfer);
            }

            P::Br => {
                self.emit_moves(pc, b, c);
                self.emit_branch(pc, RirInst::new(R::Br), a, c + b);
                return Ok(Flow::Transfer);
            }
            P::BrIf | P::BrIfZero => {
                let cond = self.pop_reg();
                let invert = op == P::BrIfZero;
                let fused = self.fusable_cmp(cond);
                let needs_moves = b > 0 && self.height - b != c;
                if needs_moves {
                    // The taken path shuffles registers: skip an inline
                    // stub on the inverse condition.
                    let skip = if let Some((cmp, cc, is_64)) = fused {
                        self.unemit();
                        let cc = if invert { cc } else { cc.invert() };
                        let op = if is_64 { R::BrCmpI64 } else { R::BrCmpI32 };
                        self.emit(
                            pc,
                            RirInst {
                                op,
                                dst: cc as u16,
                                a: cmp.a,
                                b: cmp.b,
                                imm: 0,
                            },
                        )
                    } else {
                        let op = if invert { R::BrIfNonZero } else { R::BrIfZero };
                        self.emit(
                            pc,
                            RirInst {
                                op,
                                dst: 0,
                                a: cond,
                                b: 0,
                                imm: 0,
                            },
                        )
                    };
                    self.emit_moves(pc, b, c);
                    self.emit_branch(pc, RirInst::new(R::Br), a, c + b);
                    let after = self.out.insts.len() as u32;
                    self.out.insts[skip as usize].imm = after;
                } else if let Some((cmp, cc, is_64)) = fused {
                    self.unemit();
                    let cc = if invert { cc.invert() } else { cc };
                    let op = if is_64 { R::BrCmpI64 } else { R::BrCmpI32 };
                    self.emit_branch(
                        pc,
                        RirInst {
                            op,
                            dst: cc as u16,
                            a: cmp.a,
                            b: cmp.b,
                            imm: 0,
                        },
                        a,
                        c + b,
                    );
                } else {
                    let op = if invert { R::BrIfZero } else { R::BrIfNonZero };
                    self.emit_branch(
                        pc,
                        RirInst {
                            op,
                            dst: 0,
                            a: cond,
                            b: 0,
                            imm: 0,
                        },
                        a,
                        c + b,
                    );
                }
            }
            P::BrTable => {
                let index = self.pop_reg();
                let table_idx = self.out.br_tables.len() as u32;
                self.out.br_tables.push(Vec::new());
                self.emit(
                    pc,
                    RirInst {
                        op: R::BrTable,
                        dst: 0,
                        a: index,
                        b: 0,
                        imm: table_idx,
                    },
                );
                // Every entry dispatches through an inline stub carrying its
                // result moves; entries are final RIR PCs.
                let pir_targets = self.pir.br_tables[a as usize].targets.clone();
                let mut entries = Vec::with_capacity(pir_targets.len());
                for (target, copy, dest) in pir_targets {
                    let stub = self.out.insts.len() as u32;
                    let saved = self.height;
                    self.emit_moves(pc, copy, dest);
                    self.emit_branch(pc, RirInst::new(R::Br), target, dest + copy);
                    self.height = saved;
                    entries.push(stub);
                }
                self.out.br_tables[table_idx as usize] = entries;
                return Ok(Flow::Transfer);
            }

            P::Return => {
                let mut regs = Vec::with_capacity(a as usize);
                for i in 0..a {
                    regs.push(self.reg_at(self.height - a + i));
                }
                let list = self.out.lists.len() as u16;
                self.out.lists.push(regs);
                self.emit(
                    pc,
                    RirInst {
                        op: R::Ret,
                        dst: 0,
                        a: list,
                        b: 0,
                        imm: 0,
                    },
                );
                return Ok(Flow::Transfer);
            }

            P::Call => return self.lower_call(pc, a, None, false),
            P::ReturnCall => return self.lower_call(pc, a, None, true),
            P::CallIndirect => return self.lower_call(pc, a, Some(b), false),
            P::ReturnCallIndirect => return self.lower_call(pc, a, Some(b), true),

            P::Drop => {
                self.height = self.height.checked_sub(a).ok_or(RirError::InvalidIR)?;
            }
            P::Select => {
                if a != 1 {
                    return Err(RirError::Unsupported);
                }
                let cond = self.pop_reg();
                let if_false = self.pop_reg();
                let if_true = self.pop_reg();
                let dst = self.push_reg();
                self.emit(
                    pc,
                    RirInst {
                        op: R::Select,
                        dst,
                        a: if_true,
                        b: if_false,
                        imm: u32::from(cond),
                    },
                );
            }

            P::LocalGet => {
                if b != 1 {
                    return Err(RirError::Unsupported);
                }
                let dst = self.push_reg();
                self.emit(
                    pc,
                    RirInst {
                        op: R::Move,
                        dst,
                        a: a as u16,
                        b: 0,
                        imm: 0,
                    },
                );
            }
            P::LocalSet => {
                if b != 1 {
                    return Err(RirError::Unsupported);
                }
                let src = self.pop_reg();
                // Collapse a value moved into a temp and immediately into a
                // local: read through to the original source.
                let src = self.read_through(src);
                if src != a as u16 {
                    self.emit(
                        pc,
                        RirInst {
                            op: R::Move,
                            dst: a as u16,
                            a: src,
                            b: 0,
                            imm: 0,
                        },
                    );
                }
            }
            P::LocalTee => {
                if b != 1 {
                    return Err(RirError::Unsupported);
                }
                let src = self.top();
                if src != a as u16 {
                    self.emit(
                        pc,
                        RirInst {
                            op: R::Move,
                            dst: a as u16,
                            a: src,
                            b: 0,
                            imm: 0,
                        },
                    );
                }
            }
            P::GlobalGet => {
                if b != 1 {
                    return Err(RirError::Unsupported);
                }
                let dst = self.push_reg();
                self.emit(
                    pc,
                    RirInst {
                        op: R::GlobalGet,
                        dst,
                        a: 0,
                        b: 0,
                        imm: a,
                    },
                );
            }
            P::GlobalSet => {
                if b != 1 {
                    return Err(RirError::Unsupported);
                }
                let src = self.pop_reg();
                let src = self.read_through(src);
                self.emit(
                    pc,
                    RirInst {
                        op: R::GlobalSet,
                        dst: 0,
                        a: src,
                        b: 0,
                        imm: a,
                    },
                );
            }

            P::I32Const | P::F32Const => {
                let dst = self.push_reg();
                self.emit(
                    pc,
                    RirInst {
                        op: R::Const32,
                        dst,
                        a: 0,
                        b: 0,
                        imm: a,
                    },
                );
            }
            P::I64Const | P::F64Const => {
                let dst = self.push_reg();
                self.emit(
                    pc,
                    RirInst {
                        op: R::Const64,
                        dst,
                        a: 0,
                        b: 0,
                        imm: a,
                    },
                );
            }

            P::MemorySize => {
                let dst = self.push_reg();
                self.emit(
                    pc,
                    RirInst {
                        op: R::MemorySize,
                        dst,
                        a: 0,
                        b: 0,
                        imm: a,
                    },
                );
            }
            P::MemoryGrow => {
                let delta = self.pop_reg();
                let delta = self.read_through(delta);
                let dst = self.push_reg();
                self.emit(
                    pc,
                    RirInst {
                        op: R::MemoryGrow,
                        dst,
                        a: delta,
                        b: 0,
                        imm: a,
                    },
                );
            }

            P::I32Load | P::I64Load | P::F32Load | P::F64Load | P::I32Load8S | P::I32Load8U
            | P::I32Load16S | P::I32Load16U | P::I64Load8S | P::I64Load8U | P::I64Load16S
            | P::I64Load16U | P::I64Load32S | P::I64Load32U => {
                let addr = self.pop_reg();
                let addr = self.read_through(addr);
                let dst = self.push_reg();
                self.emit(
                    pc,
                    RirInst {
                        op: rir_mem_op(op),
                        dst,
                        a: addr,
                        b: 0,
                        imm: a,
                    },
                );
            }
            P::I32Store | P::I64Store | P::F32Store | P::F64Store | P::I32Store8
            | P::I32Store16 | P::I64Store8 | P::I64Store16 | P::I64Store32 => {
                let value = self.pop_reg();
                let value = self.read_through(value);
                let addr = self.pop_reg();
                let addr = self.read_through(addr);
                self.emit(
                    pc,
                    RirInst {
                        op: rir_mem_op(op),
                        dst: 0,
                        a: addr,
                        b: value,
                        imm: a,
                    },
                );
            }

            // Reinterpretations are bit-identities on the same position.
            P::I32ReinterpretF32 | P::I64ReinterpretF64 | P::F32ReinterpretI32
            | P::F64ReinterpretI64 => {}

            _ => {
                if let Some((rir, arity)) = rir_numeric(op) {
                    self.lower_numeric(pc, rir, arity)?;
                } else {
                    return Err(RirError::Unsupported);
                }
            }
        }
        Ok(Flow::Normal)
    }

    fn lower_numeric(&mut self, pc: u32, op: RirOp, arity: u8) -> Result<(), RirError> {
        use RirOp as R;
        if arity == 1 {
            let a = self.pop_reg();
            let a = self.read_through(a);
            let dst = self.push_reg();
            self.emit(
                pc,
                RirInst {
                    op,
                    dst,
                    a,
                    b: 0,
                    imm: 0,
                },
            );
            return Ok(());
        }

        let b = self.pop_reg();
        // Immediate folding: a constant feeding the right operand of a
        // foldable op becomes its immediate form.
        if let Some(imm_op) = imm_form(op)
            && self.out.insts.len() > self.barrier
            && let Some(last) = self.out.insts.last().copied()
            && last.dst == b
            && last.op == (if imm_op_is_64(imm_op) { R::Const64 } else { R::Const32 })
        {
            self.unemit();
            let a = self.pop_reg();
            let a = self.read_through(a);
            let dst = self.push_reg();
            self.emit(
                pc,
                RirInst {
                    op: imm_op,
                    dst,
                    a,
                    b: 0,
                    imm: last.imm,
                },
            );
            return Ok(());
        }
        let b = self.read_through(b);
        let a = self.pop_reg();
        let a = self.read_through(a);
        let dst = self.push_reg();
        self.emit(
            pc,
            RirInst {
                op,
                dst,
                a,
                b,
                imm: 0,
            },
        );
        Ok(())
    }

    fn lower_call(
        &mut self,
        pc: u32,
        target: u32,
        table: Option<u32>,
        tail: bool,
    ) -> Result<Flow, RirError> {
        use RirOp as R;

        let ft = if table.is_some() {
            self.module.types[target as usize]
                .as_func()
                .ok_or(RirError::InvalidIR)?
        } else {
            self.module.func_type(FuncIdx::new(target))
        };
        // v128 anywhere in the signature keeps the caller on PIR.
        if ft.param_slots() != ft.params.len() || ft.result_slots() != ft.results.len() {
            return Err(RirError::Unsupported);
        }
        let nparams = ft.params.len() as u32;
        let nresults = ft.results.len() as u32;

        let addr = if table.is_some() { self.pop_reg() } else { 0 };
        let mut args = Vec::with_capacity(nparams as usize);
        for i in 0..nparams {
            args.push(self.reg_at(self.height - nparams + i));
        }
        self.height -= nparams;

        let mut rets = Vec::with_capacity(nresults as usize);
        if !tail {
            for _ in 0..nresults {
                rets.push(self.push_reg());
            }
        }

        let site = self.out.calls.len() as u32;
        self.out.calls.push(RirCallSite {
            target,
            table: table.unwrap_or(0),
            addr,
            args,
            rets,
        });
        let op = match (table.is_some(), tail) {
            (false, false) => R::Call,
            (false, true) => R::ReturnCall,
            (true, false) => R::CallIndirect,
            (true, true) => R::ReturnCallIndirect,
        };
        self.emit(
            pc,
            RirInst {
                op,
                dst: 0,
                a: 0,
                b: 0,
                imm: site,
            },
        );
        Ok(if tail { Flow::Transfer } else { Flow::Normal })
    }
}

fn imm_form(op: RirOp) -> Option<RirOp> {
    use RirOp as R;
    Some(match op {
        R::I32Add => R::I32AddImm,
        R::I32Mul => R::I32MulImm,
        R::I32And => R::I32AndImm,
        R::I32Or => R::I32OrImm,
        R::I32Xor => R::I32XorImm,
        R::I32Shl => R::I32ShlImm,
        R::I32ShrS => R::I32ShrSImm,
        R::I32ShrU => R::I32ShrUImm,
        R::I64Add => R::I64AddImm,
        R::I64And => R::I64AndImm,
        R::I64Or => R::I64OrImm,
        R::I64Xor => R::I64XorImm,
        _ => return None,
    })
}

fn imm_op_is_64(op: RirOp) -> bool {
    matches!(
        op,
        RirOp::I64AddImm | RirOp::I64AndImm | RirOp::I64OrImm | RirOp::I64XorImm
    )
}

fn rir_mem_op(op: PirOp) -> RirOp {
    use PirOp as P;
    use RirOp as R;
    match op {
        P::I32Load => R::I32Load,
        P::I64Load => R::I64Load,
        P::F32Load => R::F32Load,
        P::F64Load => R::F64Load,
        P::I32Load8S => R::I32Load8S,
        P::I32Load8U => R::I32Load8U,
        P::I32Load16S => R::I32Load16S,
        P::I32Load16U => R::I32Load16U,
        P::I64Load8S => R::I64Load8S,
        P::I64Load8U => R::I64Load8U,
        P::I64Load16S => R::I64Load16S,
        P::I64Load16U => R::I64Load16U,
        P::I64Load32S => R::I64Load32S,
        P::I64Load32U => R::I64Load32U,
        P::I32Store => R::I32Store,
        P::I64Store => R::I64Store,
        P::F32Store => R::F32Store,
        P::F64Store => R::F64Store,
        P::I32Store8 => R::I32Store8,
        P::I32Store16 => R::I32Store16,
        P::I64Store8 => R::I64Store8,
        P::I64Store16 => R::I64Store16,
        P::I64Store32 => R::I64Store32,
        _ => unreachable!("not a memory op: {op:?}"),
    }
}

// (register op, operand arity) for the 1:1 numeric lowerings.
fn rir_numeric(op: PirOp) -> Option<(RirOp, u8)> {
    use PirOp as P;
    use RirOp as R;

    macro_rules! same {
        ($($name:ident: $arity:expr),* $(,)?) => {
            match op {
                $(P::$name => Some((R::$name, $arity)),)*
                _ => None,
            }
        };
    }

    same! {
        I32Eqz: 1, I32Eq: 2, I32Ne: 2, I32LtS: 2, I32LtU: 2, I32GtS: 2,
        I32GtU: 2, I32LeS: 2, I32LeU: 2, I32GeS: 2, I32GeU: 2,
        I32Clz: 1, I32Ctz: 1, I32Popcnt: 1, I32Add: 2, I32Sub: 2,
        I32Mul: 2, I32DivS: 2, I32DivU: 2, I32RemS: 2, I32RemU: 2,
        I32And: 2, I32Or: 2, I32Xor: 2, I32Shl: 2, I32ShrS: 2,
        I32ShrU: 2, I32Rotl: 2, I32Rotr: 2,
        I64Eqz: 1, I64Eq: 2, I64Ne: 2, I64LtS: 2, I64LtU: 2, I64GtS: 2,
        I64GtU: 2, I64LeS: 2, I64LeU: 2, I64GeS: 2, I64GeU: 2,
        I64Clz: 1, I64Ctz: 1, I64Popcnt: 1, I64Add: 2, I64Sub: 2,
        I64Mul: 2, I64DivS: 2, I64DivU: 2, I64RemS: 2, I64RemU: 2,
        I64And: 2, I64Or: 2, I64Xor: 2, I64Shl: 2, I64ShrS: 2,
        I64ShrU: 2, I64Rotl: 2, I64Rotr: 2,
        F32Eq: 2, F32Ne: 2, F32Lt: 2, F32Gt: 2, F32Le: 2, F32Ge: 2,
        F64Eq: 2, F64Ne: 2, F64Lt: 2, F64Gt: 2, F64Le: 2, F64Ge: 2,
        F32Abs: 1, F32Neg: 1, F32Ceil: 1, F32Floor: 1, F32Trunc: 1,
        F32Nearest: 1, F32Sqrt: 1, F32Add: 2, F32Sub: 2, F32Mul: 2,
        F32Div: 2, F32Min: 2, F32Max: 2, F32Copysign: 2,
        F64Abs: 1, F64Neg: 1, F64Ceil: 1, F64Floor: 1, F64Trunc: 1,
        F64Nearest: 1, F64Sqrt: 1, F64Add: 2, F64Sub: 2, F64Mul: 2,
        F64Div: 2, F64Min: 2, F64Max: 2, F64Copysign: 2,
        I32WrapI64: 1, I32TruncF32S: 1, I32TruncF32U: 1, I32TruncF64S: 1,
        I32TruncF64U: 1, I64ExtendI32S: 1, I64ExtendI32U: 1,
        I64TruncF32S: 1, I64TruncF32U: 1, I64TruncF64S: 1, I64TruncF64U: 1,
        F32ConvertI32S: 1, F32ConvertI32U: 1, F32ConvertI64S: 1,
        F32ConvertI64U: 1, F32DemoteF64: 1, F64ConvertI32S: 1,
        F64ConvertI32U: 1, F64ConvertI64S: 1, F64ConvertI64U: 1,
        F64PromoteF32: 1, I32Extend8S: 1, I32Extend16S: 1, I64Extend8S: 1,
        I64Extend16S: 1, I64Extend32S: 1,
        I32TruncSatF32S: 1, I32TruncSatF32U: 1, I32TruncSatF64S: 1,
        I32TruncSatF64U: 1, I64TruncSatF32S: 1, I64TruncSatF32U: 1,
        I64TruncSatF64S: 1, I64TruncSatF64U: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pir::build_pir;
    use crate::types::{CompositeType, FuncBody, FuncType, SubType, TypeIdx, ValType};

    fn test_module(params: Vec<ValType>, results: Vec<ValType>) -> ModuleInner {
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
        module
    }

    fn build(module: &ModuleInner, body: &[u8]) -> RirFunction {
        let body = FuncBody {
            locals: Vec::new(),
            bytecode: body.into(),
            offset: 0,
        };
        let pir = build_pir(module, FuncIdx::new(0), &body).unwrap();
        build_rir(module, &pir).unwrap()
    }

    #[test]
    fn const_feeding_add_folds_to_immediate() {
        let module = test_module(vec![ValType::I32], vec![ValType::I32]);
        // local.get 0; i32.const 1; i32.add; end
        let rir = build(&module, &[0x20, 0x00, 0x41, 0x01, 0x6a, 0x0b]);
        let ops: Vec<RirOp> = rir.insts.iter().map(|i| i.op).collect();
        assert_eq!(ops, vec![RirOp::I32AddImm, RirOp::Ret]);
        assert_eq!(rir.insts[0].a, 0); // reads the local directly
        assert_eq!(rir.insts[0].imm, 1);
    }

    #[test]
    fn get_set_collapses_to_move() {
        let module = test_module(vec![ValType::I32, ValType::I32], vec![]);
        // local.get 0; local.set 1; end
        let rir = build(&module, &[0x20, 0x00, 0x21, 0x01, 0x0b]);
        let ops: Vec<RirOp> = rir.insts.iter().map(|i| i.op).collect();
        assert_eq!(ops, vec![RirOp::Move, RirOp::Ret]);
        assert_eq!(rir.insts[0].dst, 1);
        assert_eq!(rir.insts[0].a, 0);
    }

    #[test]
    fn cmp_then_br_if_fuses() {
        let module = test_module(vec![ValType::I32], vec![ValType::I32]);
        // block; local.get 0; i32.const 3; i32.lt_s; br_if 0; end;
        // i32.const 9; end
        let rir = build(
            &module,
            &[
                0x02, 0x40, 0x20, 0x00, 0x41, 0x03, 0x48, 0x0d, 0x00, 0x0b, 0x41, 0x09, 0x0b,
            ],
        );
        let ops: Vec<RirOp> = rir.insts.iter().map(|i| i.op).collect();
        // The comparison's inputs feed the branch directly.
        assert!(ops.contains(&RirOp::BrCmpI32));
        assert!(!ops.contains(&RirOp::I32LtS));
    }

    #[test]
    fn self_move_is_elided() {
        let module = test_module(vec![ValType::I32], vec![]);
        // local.get 0; local.set 0; end
        let rir = build(&module, &[0x20, 0x00, 0x21, 0x00, 0x0b]);
        let ops: Vec<RirOp> = rir.insts.iter().map(|i| i.op).collect();
        assert_eq!(ops, vec![RirOp::Ret]);
    }

    #[test]
    fn calls_carry_register_shapes() {
        let module = test_module(vec![ValType::I32], vec![ValType::I32]);
        // local.get 0; call 0; end — self-recursive shape.
        let rir = build(&module, &[0x20, 0x00, 0x10, 0x00, 0x0b]);
        let call = rir
            .insts
            .iter()
            .find(|inst| inst.op == RirOp::Call)
            .expect("a call instruction");
        let site = &rir.calls[call.imm as usize];
        assert_eq!(site.target, 0);
        assert_eq!(site.args.len(), 1);
        assert_eq!(site.rets.len(), 1);
    }

    #[test]
    fn v128_functions_stay_on_pir() {
        let module = test_module(vec![], vec![]);
        let mut body = vec![0xfd, 0x0c];
        body.extend_from_slice(&[0u8; 16]);
        body.extend_from_slice(&[0x1a, 0x0b]);
        let body = FuncBody {
            locals: vec![],
            bytecode: body.into(),
            offset: 0,
        };
        let pir = build_pir(&module, FuncIdx::new(0), &body).unwrap();
        assert_eq!(build_rir(&module, &pir), Err(RirError::Unsupported));
    }

    #[test]
    fn deopt_map_points_back_at_pir() {
        let module = test_module(vec![ValType::I32], vec![ValType::I32]);
        let rir = build(&module, &[0x20, 0x00, 0x41, 0x01, 0x6a, 0x0b]);
        assert_eq!(rir.rir_to_pir.len(), rir.insts.len());
        // The fused add maps back to the PIR add, the return to the PIR
        // return.
        assert_eq!(rir.rir_to_pir.last().copied(), Some(3));
    }
}
