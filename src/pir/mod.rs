// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Predecoded IR (PIR).
//!
//! Rewrites variable-length bytecode into fixed-width instructions over
//! which the interpreter can dispatch without re-parsing LEB fields. Each
//! instruction is an opcode tag plus three 32-bit immediates; anything wider
//! (memargs, 64-bit constants, branch tables, catch clauses) lives in side
//! tables indexed by an immediate. Labels are resolved here: every branch
//! points at a target PC and carries the value-copy count and destination
//! stack height needed on the taken path.
//!
//! Dead code (anything following an unconditional transfer, up to the next
//! reachable join) is not emitted; validation has already checked it.

use thiserror::Error;

use crate::decode::body::{BlockType, CatchClause, Inst, InstDecoder, MemArg, SimdImm};
use crate::types::{
    AtomicClass, AtomicOpcode, FuncBody, FuncIdx, FuncType, GcOpcode, HeapType, MiscOpcode,
    ModuleInner, Opcode, RefType, RmwOp, TypeIdx, ValType,
};

/// Errors from predecoding. `InvalidIR` should not occur once validation has
/// passed; it is kept as a defensive backstop.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum PirError {
    #[error("vector instruction {0:#x} requires the legacy stack interpreter")]
    UnsupportedSimd(u32),
    #[error("inconsistent IR while predecoding")]
    InvalidIR,
}

/// A fixed-width predecoded instruction.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct PirInst {
    pub op: PirOp,
    pub a: u32,
    pub b: u32,
    pub c: u32,
}

impl PirInst {
    fn new(op: PirOp) -> Self {
        Self {
            op,
            a: 0,
            b: 0,
            c: 0,
        }
    }

    fn a(op: PirOp, a: u32) -> Self {
        Self { op, a, b: 0, c: 0 }
    }

    fn ab(op: PirOp, a: u32, b: u32) -> Self {
        Self { op, a, b, c: 0 }
    }

    fn abc(op: PirOp, a: u32, b: u32, c: u32) -> Self {
        Self { op, a, b, c }
    }
}

/// Fixed-width PIR opcodes. Immediate meanings are noted per group.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum PirOp {
    // Control. Branches: a = target PC, b = slots to copy, c = destination
    // operand height (in slots, relative to the frame's operand base).
    Nop,
    Unreachable,
    Br,
    BrIf,
    /// Branch when the popped i32 is zero (lowered `if`).
    BrIfZero,
    /// a = branch-table payload index.
    BrTable,
    /// a = result slots.
    Return,
    /// a = function index.
    Call,
    ReturnCall,
    /// a = type index, b = table index.
    CallIndirect,
    ReturnCallIndirect,
    /// a = type index.
    CallRef,
    ReturnCallRef,
    /// a = tag index.
    Throw,
    ThrowRef,
    /// a = handler payload index.
    TryPush,
    TryPop,

    // Parametric. a = slot count.
    Drop,
    Select,

    // Locals/globals. a = slot offset (locals) or index (globals),
    // b = slot count.
    LocalGet,
    LocalSet,
    LocalTee,
    GlobalGet,
    GlobalSet,

    // Tables. a = table index (b = second index where noted).
    TableGet,
    TableSet,
    /// a = element index, b = table index.
    TableInit,
    /// a = element index.
    ElemDrop,
    /// a = destination table, b = source table.
    TableCopy,
    TableGrow,
    TableSize,
    TableFill,

    // References.
    RefNull,
    RefIsNull,
    /// a = function index.
    RefFunc,
    RefEq,
    RefAsNonNull,
    /// Branch when the popped reference is null; re-pushes it otherwise.
    BrOnNull,
    BrOnNonNull,

    // Memory. Loads/stores: a = memarg payload index.
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
    V128Load,
    V128Store,
    /// a = memory index.
    MemorySize,
    MemoryGrow,
    /// a = data index, b = memory index.
    MemoryInit,
    /// a = data index.
    DataDrop,
    /// a = destination memory, b = source memory.
    MemoryCopy,
    /// a = memory index.
    MemoryFill,

    // Atomics (sequential model). a = memarg payload index; RMW packs
    // width/op into b.
    AtomicNotify,
    AtomicWait32,
    AtomicWait64,
    /// b = packed AtomicRmwKind.
    AtomicRmw,
    AtomicCmpxchg,

    // Constants. a = inline bits or wide-pool index.
    I32Const,
    /// a = wide-pool index.
    I64Const,
    F32Const,
    /// a = wide-pool index.
    F64Const,
    /// a = v128-pool index.
    V128Const,

    // i32 numerics.
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

    // i64 numerics.
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

    // f32 numerics.
    F32Eq,
    F32Ne,
    F32Lt,
    F32Gt,
    F32Le,
    F32Ge,
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

    // f64 numerics.
    F64Eq,
    F64Ne,
    F64Lt,
    F64Gt,
    F64Le,
    F64Ge,
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
    I32ReinterpretF32,
    I64ReinterpretF64,
    F32ReinterpretI32,
    F64ReinterpretI64,
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

    // GC. a = type index (b = second immediate where noted).
    StructNew,
    StructNewDefault,
    /// a = type index, b = field index, c = sign (0 plain, 1 signed, 2
    /// unsigned).
    StructGet,
    StructSet,
    ArrayNew,
    ArrayNewDefault,
    /// a = type index, b = element count.
    ArrayNewFixed,
    /// a = type index, b = data index.
    ArrayNewData,
    /// a = type index, b = element index.
    ArrayNewElem,
    /// a = type index, c = sign as for StructGet.
    ArrayGet,
    ArraySet,
    ArrayLen,
    ArrayFill,
    /// a = destination type, b = source type.
    ArrayCopy,
    ArrayInitData,
    ArrayInitElem,
    /// a = encoded heap type, b = 1 when null passes the test.
    RefTest,
    RefCast,
    /// a = cast payload index.
    BrOnCast,
    RefI31,
    I31GetS,
    I31GetU,
    AnyConvertExtern,
    ExternConvertAny,

    // Vector subset. Anything beyond it fails predecoding with
    // UnsupportedSimd.
    I8x16Splat,
    I16x8Splat,
    I32x4Splat,
    I64x2Splat,
    /// a = lane.
    I32x4ExtractLane,
    I32x4ReplaceLane,
    I32x4Add,
    I32x4Sub,
    I32x4Mul,
    V128And,
    V128Or,
    V128Xor,
    V128Not,
    V128AnyTrue,
    I32x4AllTrue,
}

/// Packed operation descriptor for lowered atomic read-modify-writes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct AtomicRmwKind {
    pub is_64: bool,
    pub width: u8,
    pub op: RmwOp,
}

impl AtomicRmwKind {
    pub(crate) fn pack(self) -> u32 {
        let op = match self.op {
            RmwOp::Add => 0u32,
            RmwOp::Sub => 1,
            RmwOp::And => 2,
            RmwOp::Or => 3,
            RmwOp::Xor => 4,
            RmwOp::Xchg => 5,
        };
        (op << 8) | (u32::from(self.width) << 1) | u32::from(self.is_64)
    }

    pub(crate) fn unpack(bits: u32) -> Self {
        let op = match bits >> 8 {
            0 => RmwOp::Add,
            1 => RmwOp::Sub,
            2 => RmwOp::And,
            3 => RmwOp::Or,
            4 => RmwOp::Xor,
            _ => RmwOp::Xchg,
        };
        Self {
            is_64: bits & 1 != 0,
            width: ((bits >> 1) & 0x7f) as u8,
            op,
        }
    }
}

/// A memory-access payload.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct PirMemArg {
    pub offset: u64,
    pub memory: u32,
}

/// One branch-table payload: targets first, default last, as
/// (target PC, copy slots, destination height) triples.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct PirBrTable {
    pub targets: Vec<(u32, u32, u32)>,
}

/// A resolved catch clause. `tag == u32::MAX` is catch_all.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct PirCatch {
    pub tag: u32,
    pub push_exn: bool,
    pub target: u32,
    pub dest_height: u32,
}

/// An exception-handler payload: the clauses of one `try_table` plus the PIR
/// PC range its body occupies. A handler entry on the runtime stack is live
/// only while its frame's PC is inside the range.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct PirHandler {
    pub clauses: Vec<PirCatch>,
    pub start: u32,
    pub end: u32,
}

/// A br_on_cast payload.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct PirCast {
    pub target: u32,
    pub copy: u32,
    pub dest_height: u32,
    pub to_nullable: bool,
    pub to: u32,
    /// Branch on cast failure instead of success.
    pub on_fail: bool,
}

/// Encodes a heap type into a PIR immediate: abstract types take small
/// values, concrete types are offset past them.
pub(crate) fn encode_heap_type(heap: HeapType) -> u32 {
    match heap {
        HeapType::Func => 0,
        HeapType::Extern => 1,
        HeapType::Exn => 2,
        HeapType::Any => 3,
        HeapType::Eq => 4,
        HeapType::I31 => 5,
        HeapType::Struct => 6,
        HeapType::Array => 7,
        HeapType::None => 8,
        HeapType::NoFunc => 9,
        HeapType::NoExtern => 10,
        HeapType::NoExn => 11,
        HeapType::Concrete(idx) => 12 + *idx,
    }
}

pub(crate) fn decode_heap_type(bits: u32) -> HeapType {
    match bits {
        0 => HeapType::Func,
        1 => HeapType::Extern,
        2 => HeapType::Exn,
        3 => HeapType::Any,
        4 => HeapType::Eq,
        5 => HeapType::I31,
        6 => HeapType::Struct,
        7 => HeapType::Array,
        8 => HeapType::None,
        9 => HeapType::NoFunc,
        10 => HeapType::NoExtern,
        11 => HeapType::NoExn,
        idx => HeapType::Concrete(TypeIdx::new(idx - 12)),
    }
}

/// A function predecoded into fixed-width form.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct PirFunction {
    pub insts: Vec<PirInst>,
    /// PIR PC -> byte offset of the source instruction within the body.
    pub pc_map: Vec<u32>,
    pub memargs: Vec<PirMemArg>,
    /// 64-bit constant pool (i64/f64 bit patterns).
    pub wide: Vec<u64>,
    pub v128: Vec<[u8; 16]>,
    pub br_tables: Vec<PirBrTable>,
    pub handlers: Vec<PirHandler>,
    pub casts: Vec<PirCast>,
    /// Slot offset of each local (params first).
    pub local_slot: Vec<u32>,
    pub local_types: Vec<ValType>,
    pub local_slots: u32,
    pub param_slots: u32,
    pub result_slots: u32,
    /// PIR PCs that are loop headers (back-edge targets), for tier
    /// accounting and JIT layout.
    pub loop_heads: Vec<u32>,
}

// One structured-control entry during predecoding.
struct BlockScope {
    kind: ScopeKind,
    /// Operand height (slots) just inside the block (params pushed).
    entry_height: u32,
    param_slots: u32,
    result_slots: u32,
    result_types: Vec<ValType>,
    param_types: Vec<ValType>,
    /// PIR PC of the loop header, for back-edges.
    head: u32,
    /// Instructions whose `a` must be patched to the block's end PC.
    fixups: Vec<Fixup>,
    /// Handler payload to close at end, for try_table scopes.
    handler: Option<u32>,
    /// Set when the remainder of the scope is statically unreachable.
    dead: bool,
}

#[derive(Clone, Copy, Eq, PartialEq)]
enum ScopeKind {
    Block,
    Loop,
    If,
    Else,
    Try,
}

#[derive(Clone, Copy)]
enum Fixup {
    /// Patch insts[pc].a to the end PC.
    BranchTarget(u32),
    /// Patch br_tables[idx].targets[entry].0.
    TableTarget { table: u32, entry: u32 },
    /// Patch handlers[idx].clauses[entry].target.
    CatchTarget { handler: u32, entry: u32 },
    /// Patch casts[idx].target.
    CastTarget(u32),
}

struct PirBuilder<'m> {
    module: &'m ModuleInner,
    out: PirFunction,
    /// Mirror of the value stack, in types; validation guarantees shape.
    stack: Vec<ValType>,
    scopes: Vec<BlockScope>,
}

/// Predecodes a validated function body.
pub(crate) fn build_pir(
    module: &ModuleInner,
    func: FuncIdx,
    body: &FuncBody,
) -> Result<PirFunction, PirError> {
    let ty = module.func_type(func);

    let mut out = PirFunction::default();
    let mut slot = 0u32;
    for &param in &ty.params {
        out.local_slot.push(slot);
        out.local_types.push(param);
        slot += param.slot_count() as u32;
    }
    out.param_slots = slot;
    for &(count, local_ty) in &body.locals {
        for _ in 0..count {
            out.local_slot.push(slot);
            out.local_types.push(local_ty);
            slot += local_ty.slot_count() as u32;
        }
    }
    out.local_slots = slot;
    out.result_slots = ty.result_slots() as u32;

    let mut builder = PirBuilder {
        module,
        out,
        stack: Vec::new(),
        scopes: vec![BlockScope {
            kind: ScopeKind::Block,
            entry_height: 0,
            param_slots: 0,
            result_slots: ty.result_slots() as u32,
            result_types: ty.results.clone(),
            param_types: Vec::new(),
            head: 0,
            fixups: Vec::new(),
            handler: None,
            dead: false,
        }],
    };

    let mut decoder = InstDecoder::new(&body.bytecode);
    while !builder.scopes.is_empty() {
        let (offset, inst) = decoder.next().map_err(|_| PirError::InvalidIR)?;
        builder.step(offset, &inst)?;
    }
    Ok(builder.out)
}

impl PirBuilder<'_> {
    fn height(&self) -> u32 {
        self.stack.iter().map(|t| t.slot_count() as u32).sum()
    }

    fn emit(&mut self, offset: usize, inst: PirInst) -> u32 {
        let pc = self.out.insts.len() as u32;
        self.out.insts.push(inst);
        self.out.pc_map.push(offset as u32);
        pc
    }

    fn push(&mut self, ty: ValType) {
        self.stack.push(ty);
    }

    fn pop(&mut self) -> ValType {
        self.stack.pop().expect("validated stack underflow")
    }

    fn pop_n(&mut self, n: usize) {
        for _ in 0..n {
            self.pop();
        }
    }

    fn memarg(&mut self, arg: MemArg) -> u32 {
        let idx = self.out.memargs.len() as u32;
        self.out.memargs.push(PirMemArg {
            offset: arg.offset,
            memory: arg.memory,
        });
        idx
    }

    fn wide(&mut self, bits: u64) -> u32 {
        let idx = self.out.wide.len() as u32;
        self.out.wide.push(bits);
        idx
    }

    fn func_type_of(&self, type_idx: u32) -> &FuncType {
        self.module.types[type_idx as usize]
            .as_func()
            .expect("validated function type")
    }

    fn block_signature(&self, bt: BlockType) -> (Vec<ValType>, Vec<ValType>) {
        match bt {
            BlockType::Empty => (Vec::new(), Vec::new()),
            BlockType::Value(ty) => (Vec::new(), vec![ty]),
            BlockType::Func(idx) => {
                let ft = self.func_type_of(idx);
                (ft.params.clone(), ft.results.clone())
            }
        }
    }

    // Branch shape (target fixup or loop head, copy count, destination
    // height) for a branch to the given label depth.
    fn branch_shape(&self, depth: u32) -> (Option<u32>, u32, u32) {
        let scope = &self.scopes[self.scopes.len() - 1 - depth as usize];
        if scope.kind == ScopeKind::Loop {
            (
                Some(scope.head),
                scope.param_slots,
                scope.entry_height - scope.param_slots,
            )
        } else {
            (
                None,
                scope.result_slots,
                scope.entry_height - scope.param_slots,
            )
        }
    }

    fn add_branch_fixup(&mut self, depth: u32, pc: u32) {
        let idx = self.scopes.len() - 1 - depth as usize;
        self.scopes[idx].fixups.push(Fixup::BranchTarget(pc));
    }

    // Emits a branch (of the given opcode) to `depth`, leaving target
    // resolution to the scope end when the target is forward.
    fn emit_branch(&mut self, offset: usize, op: PirOp, depth: u32) -> u32 {
        let (target, copy, dest) = self.branch_shape(depth);
        let pc = self.emit(
            offset,
            PirInst::abc(op, target.unwrap_or(u32::MAX), copy, dest),
        );
        if target.is_none() {
            self.add_branch_fixup(depth, pc);
        }
        pc
    }

    fn enter_dead_code(&mut self) {
        let scope = self.scopes.last_mut().expect("scope stack intact");
        scope.dead = true;
    }

    fn step(&mut self, offset: usize, inst: &Inst) -> Result<(), PirError> {
        // In dead code, only track scope structure; nothing is emitted.
        if self.scopes.last().is_some_and(|s| s.dead) {
            match inst {
                Inst::Block { .. } | Inst::TryTable { .. } => {
                    let top = self.scopes.last().unwrap();
                    let (entry_height, dead) = (top.entry_height, true);
                    self.scopes.push(BlockScope {
                        kind: ScopeKind::Block,
                        entry_height,
                        param_slots: 0,
                        result_slots: 0,
                        result_types: Vec::new(),
                        param_types: Vec::new(),
                        head: 0,
                        fixups: Vec::new(),
                        handler: None,
                        dead,
                    });
                }
                Inst::Simple(Opcode::Else) => {
                    // An else after a dead then-arm revives the scope.
                    let scope = self.scopes.last_mut().unwrap();
                    if scope.kind == ScopeKind::If {
                        scope.kind = ScopeKind::Else;
                        scope.dead = false;
                        let params = scope.param_types.clone();
                        let entry = scope.entry_height - scope.param_slots;
                        self.truncate_stack_to(entry);
                        for ty in params {
                            self.push(ty);
                        }
                        let end_pc = self.out.insts.len() as u32;
                        let scope = self.scopes.last_mut().unwrap();
                        // Pending else-target fixups resolve to here.
                        let mut kept = Vec::new();
                        for fixup in std::mem::take(&mut scope.fixups) {
                            match fixup {
                                Fixup::BranchTarget(pc) if is_else_fixup(&self.out, pc) => {
                                    patch_target(&mut self.out, Fixup::BranchTarget(pc), end_pc);
                                }
                                other => kept.push(other),
                            }
                        }
                        self.scopes.last_mut().unwrap().fixups = kept;
                    }
                }
                Inst::Simple(Opcode::End) => {
                    self.close_scope(offset)?;
                }
                _ => {}
            }
            return Ok(());
        }
        self.step_live(offset, inst)
    }

    fn truncate_stack_to(&mut self, slots: u32) {
        while self.height() > slots {
            self.pop();
        }
    }

    fn close_scope(&mut self, offset: usize) -> Result<(), PirError> {
        let end_pc = self.out.insts.len() as u32;
        let scope = self.scopes.pop().ok_or(PirError::InvalidIR)?;

        // An if whose then-arm ended without an else: its false-branch
        // target is also the end.
        for fixup in &scope.fixups {
            patch_target(&mut self.out, *fixup, end_pc);
        }
        if let Some(handler) = scope.handler {
            self.out.handlers[handler as usize].end = end_pc;
            // Outermost-scope returns aside, the try body exits over its
            // TryPop below; branches over it are handled by the liveness
            // range.
            self.emit(offset, PirInst::new(PirOp::TryPop));
        }

        if self.scopes.is_empty() {
            // Function end: emit the implicit return.
            self.emit(offset, PirInst::a(PirOp::Return, self.out.result_slots));
            return Ok(());
        }

        // Reset the mirror stack to the post-block shape; after a dead end
        // control can only arrive here via the block's label, which carries
        // exactly the result values.
        self.truncate_stack_to(scope.entry_height - scope.param_slots);
        for ty in &scope.result_types {
            self.stack.push(*ty);
        }
        Ok(())
    }

    fn step_live(&mut self, offset: usize, inst: &Inst) -> Result<(), PirError> {
        use PirOp as P;
        use ValType::{F32, F64, I32, I64};

        match inst {
            Inst::Block { op, bt } => {
                let (params, results) = self.block_signature(*bt);
                let param_slots: u32 = params.iter().map(|t| t.slot_count() as u32).sum();
                let result_slots: u32 = results.iter().map(|t| t.slot_count() as u32).sum();

                match op {
                    Opcode::Block => {
                        self.scopes.push(BlockScope {
                            kind: ScopeKind::Block,
                            entry_height: self.height(),
                            param_slots,
                            result_slots,
                            result_types: results,
                            param_types: params,
                            head: 0,
                            fixups: Vec::new(),
                            handler: None,
                            dead: false,
                        });
                    }
                    Opcode::Loop => {
                        let head = self.out.insts.len() as u32;
                        self.out.loop_heads.push(head);
                        self.scopes.push(BlockScope {
                            kind: ScopeKind::Loop,
                            entry_height: self.height(),
                            param_slots,
                            result_slots,
                            result_types: results,
                            param_types: params,
                            head,
                            fixups: Vec::new(),
                            handler: None,
                            dead: false,
                        });
                    }
                    Opcode::If => {
                        self.pop(); // condition
                        let height = self.height();
                        // Jump to the else arm (or end) when false; the
                        // block params stay where they are.
                        let pc = self.emit(
                            offset,
                            PirInst::abc(P::BrIfZero, u32::MAX, 0, height),
                        );
                        self.scopes.push(BlockScope {
                            kind: ScopeKind::If,
                            entry_height: height,
                            param_slots,
                            result_slots,
                            result_types: results,
                            param_types: params,
                            head: 0,
                            fixups: vec![Fixup::BranchTarget(pc)],
                            handler: None,
                            dead: false,
                        });
                    }
                    _ => unreachable!(),
                }
            }

            Inst::TryTable { bt, clauses } => {
                let (params, results) = self.block_signature(*bt);
                let param_slots: u32 = params.iter().map(|t| t.slot_count() as u32).sum();
                let result_slots: u32 = results.iter().map(|t| t.slot_count() as u32).sum();
                let handler_idx = self.out.handlers.len() as u32;

                let mut resolved = Vec::with_capacity(clauses.len());
                for (i, clause) in clauses.iter().enumerate() {
                    let (tag, push_exn, label) = match *clause {
                        CatchClause::One { tag, label } => (tag, false, label),
                        CatchClause::OneRef { tag, label } => (tag, true, label),
                        CatchClause::All { label } => (u32::MAX, false, label),
                        CatchClause::AllRef { label } => (u32::MAX, true, label),
                    };
                    // Catch targets resolve like branches from just outside
                    // the try scope.
                    let (target, _, dest) = self.branch_shape(label);
                    resolved.push(PirCatch {
                        tag,
                        push_exn,
                        target: target.unwrap_or(u32::MAX),
                        dest_height: dest,
                    });
                    if target.is_none() {
                        let scope_idx = self.scopes.len() - 1 - label as usize;
                        self.scopes[scope_idx].fixups.push(Fixup::CatchTarget {
                            handler: handler_idx,
                            entry: i as u32,
                        });
                    }
                }

                let push_pc = self.emit(offset, PirInst::a(P::TryPush, handler_idx));
                self.out.handlers.push(PirHandler {
                    clauses: resolved,
                    start: push_pc,
                    end: u32::MAX,
                });
                self.scopes.push(BlockScope {
                    kind: ScopeKind::Try,
                    entry_height: self.height(),
                    param_slots,
                    result_slots,
                    result_types: results,
                    param_types: params,
                    head: 0,
                    fixups: Vec::new(),
                    handler: Some(handler_idx),
                    dead: false,
                });
            }

            Inst::Simple(op) => self.step_simple(offset, *op)?,
            Inst::Label { op, depth } => match op {
                Opcode::Br => {
                    self.emit_branch(offset, P::Br, *depth);
                    self.enter_dead_code();
                }
                Opcode::BrIf => {
                    self.pop();
                    self.emit_branch(offset, P::BrIf, *depth);
                }
                Opcode::BrOnNull => {
                    let rt = self.pop();
                    self.emit_branch(offset, P::BrOnNull, *depth);
                    self.push(rt);
                }
                Opcode::BrOnNonNull => {
                    // The popped reference travels with the branch.
                    self.pop();
                    self.emit_branch(offset, P::BrOnNonNull, *depth);
                }
                _ => unreachable!(),
            },
            Inst::BrTable { targets, default } => {
                self.pop();
                let table_idx = self.out.br_tables.len() as u32;
                let mut entries = Vec::with_capacity(targets.len() + 1);
                for (i, &depth) in targets.iter().chain(std::iter::once(default)).enumerate() {
                    let (target, copy, dest) = self.branch_shape(depth);
                    entries.push((target.unwrap_or(u32::MAX), copy, dest));
                    if target.is_none() {
                        let scope_idx = self.scopes.len() - 1 - depth as usize;
                        self.scopes[scope_idx].fixups.push(Fixup::TableTarget {
                            table: table_idx,
                            entry: i as u32,
                        });
                    }
                }
                self.out.br_tables.push(PirBrTable { targets: entries });
                self.emit(offset, PirInst::a(P::BrTable, table_idx));
                self.enter_dead_code();
            }

            Inst::Index { op, index } => self.step_indexed(offset, *op, *index)?,
            Inst::CallIndirect { ty, table, tail } => {
                let ft = self.func_type_of(*ty);
                let (params, results) = (ft.params.clone(), ft.results.clone());
                self.pop(); // table address
                self.pop_n(params.len());
                let op = if *tail {
                    P::ReturnCallIndirect
                } else {
                    P::CallIndirect
                };
                self.emit(offset, PirInst::ab(op, *ty, *table));
                if *tail {
                    self.enter_dead_code();
                } else {
                    for ty in results {
                        self.push(ty);
                    }
                }
            }

            Inst::RefNull(heap) => {
                self.emit(offset, PirInst::new(P::RefNull));
                self.push(ValType::Ref(RefType {
                    nullable: true,
                    heap: *heap,
                }));
            }
            Inst::SelectT(types) => {
                self.pop(); // condition
                let ty = types[0];
                self.pop();
                self.pop();
                self.emit(offset, PirInst::a(P::Select, ty.slot_count() as u32));
                self.push(ty);
            }

            Inst::Mem { op, arg } => {
                let payload = self.memarg(*arg);
                let (pir, loaded, stored) = lower_mem_op(*op);
                if stored.is_some() {
                    self.pop(); // value
                    self.pop(); // address
                } else {
                    self.pop(); // address
                }
                self.emit(offset, PirInst::a(pir, payload));
                if let Some(ty) = loaded {
                    self.push(ty);
                }
            }
            Inst::MemorySize { memory } => {
                self.emit(offset, PirInst::a(P::MemorySize, *memory));
                self.push(self.memory_addr_type(*memory));
            }
            Inst::MemoryGrow { memory } => {
                self.pop();
                self.emit(offset, PirInst::a(P::MemoryGrow, *memory));
                self.push(self.memory_addr_type(*memory));
            }

            Inst::I32Const(v) => {
                self.emit(offset, PirInst::a(P::I32Const, *v as u32));
                self.push(I32);
            }
            Inst::I64Const(v) => {
                let idx = self.wide(*v as u64);
                self.emit(offset, PirInst::a(P::I64Const, idx));
                self.push(I64);
            }
            Inst::F32Const(v) => {
                self.emit(offset, PirInst::a(P::F32Const, v.to_bits()));
                self.push(F32);
            }
            Inst::F64Const(v) => {
                let idx = self.wide(v.to_bits());
                self.emit(offset, PirInst::a(P::F64Const, idx));
                self.push(F64);
            }

            Inst::Misc { op, a, b } => self.step_misc(offset, *op, *a, *b)?,
            Inst::Gc { op, a, b } => self.step_gc(offset, *op, *a, *b)?,
            Inst::GcTest { op, heap } => {
                let encoded = encode_heap_type(*heap);
                self.pop();
                match op {
                    GcOpcode::RefTest | GcOpcode::RefTestNull => {
                        let null_ok = u32::from(*op == GcOpcode::RefTestNull);
                        self.emit(offset, PirInst::ab(P::RefTest, encoded, null_ok));
                        self.push(I32);
                    }
                    GcOpcode::RefCast | GcOpcode::RefCastNull => {
                        let null_ok = u32::from(*op == GcOpcode::RefCastNull);
                        self.emit(offset, PirInst::ab(P::RefCast, encoded, null_ok));
                        self.push(ValType::Ref(RefType {
                            nullable: null_ok != 0,
                            heap: *heap,
                        }));
                    }
                    _ => unreachable!(),
                }
            }
            Inst::GcCast {
                fail,
                label,
                from_nullable: _,
                from: _,
                to_nullable,
                to,
            } => {
                let rt = self.pop();
                let (target, copy, dest) = self.branch_shape(*label);
                // The label's types include the tested reference, so the
                // branch copy count already covers it.
                let cast_idx = self.out.casts.len() as u32;
                self.out.casts.push(PirCast {
                    target: target.unwrap_or(u32::MAX),
                    copy,
                    dest_height: dest,
                    to_nullable: *to_nullable,
                    to: encode_heap_type(*to),
                    on_fail: *fail,
                });
                if target.is_none() {
                    let scope_idx = self.scopes.len() - 1 - *label as usize;
                    self.scopes[scope_idx]
                        .fixups
                        .push(Fixup::CastTarget(cast_idx));
                }
                self.emit(offset, PirInst::a(P::BrOnCast, cast_idx));
                self.push(rt);
            }

            Inst::Simd { sub, imm } => self.step_simd(offset, *sub, *imm)?,
            Inst::Atomic { class, arg } => self.step_atomic(offset, *class, *arg)?,
            Inst::AtomicFence => {
                self.emit(offset, PirInst::new(P::Nop));
            }
        }
        Ok(())
    }

    fn memory_addr_type(&self, memory: u32) -> ValType {
        if self.module.memories[memory as usize].memory64 {
            ValType::I64
        } else {
            ValType::I32
        }
    }

    fn table_addr_type(&self, table: u32) -> ValType {
        if self.module.tables[table as usize].table64 {
            ValType::I64
        } else {
            ValType::I32
        }
    }

    fn step_simple(&mut self, offset: usize, op: Opcode) -> Result<(), PirError> {
        use Opcode as O;
        use PirOp as P;
        use ValType::I32;

        // Numeric 1:1 lowerings first.
        if let Some((pir, pops, pushed)) = lower_numeric(op) {
            self.pop_n(pops);
            self.emit(offset, PirInst::new(pir));
            if let Some(ty) = pushed {
                self.push(ty);
            }
            return Ok(());
        }

        match op {
            O::Unreachable => {
                self.emit(offset, PirInst::new(P::Unreachable));
                self.enter_dead_code();
            }
            O::Nop => {}
            O::Else => {
                // Terminate the then-arm with a jump to the block end, then
                // retarget the false-branch here.
                let scope = self.scopes.last().ok_or(PirError::InvalidIR)?;
                let (result_slots, entry, params) = (
                    scope.result_slots,
                    scope.entry_height - scope.param_slots,
                    scope.param_types.clone(),
                );
                let jump = self.emit(
                    offset,
                    PirInst::abc(P::Br, u32::MAX, result_slots, entry),
                );
                let else_pc = self.out.insts.len() as u32;

                let scope = self.scopes.last_mut().unwrap();
                scope.kind = ScopeKind::Else;
                let fixups = std::mem::take(&mut scope.fixups);
                let mut kept = vec![Fixup::BranchTarget(jump)];
                for fixup in fixups {
                    match fixup {
                        Fixup::BranchTarget(pc) if is_else_fixup(&self.out, pc) => {
                            patch_target(&mut self.out, Fixup::BranchTarget(pc), else_pc);
                        }
                        other => kept.push(other),
                    }
                }
                let scope = self.scopes.last_mut().unwrap();
                scope.fixups = kept;

                // Reset the mirror stack for the else arm.
                let entry_abs = entry;
                self.truncate_stack_to(entry_abs);
                for ty in params {
                    self.push(ty);
                }
            }
            O::End => {
                self.close_scope(offset)?;
            }
            O::Return => {
                self.emit(offset, PirInst::a(P::Return, self.out.result_slots));
                self.enter_dead_code();
            }
            O::Drop => {
                let ty = self.pop();
                self.emit(offset, PirInst::a(P::Drop, ty.slot_count() as u32));
            }
            O::Select => {
                self.pop(); // condition
                let ty = self.pop();
                self.pop();
                self.emit(offset, PirInst::a(P::Select, ty.slot_count() as u32));
                self.push(ty);
            }
            O::RefIsNull => {
                self.pop();
                self.emit(offset, PirInst::new(P::RefIsNull));
                self.push(I32);
            }
            O::RefEq => {
                self.pop();
                self.pop();
                self.emit(offset, PirInst::new(P::RefEq));
                self.push(I32);
            }
            O::RefAsNonNull => {
                let rt = self.pop();
                self.emit(offset, PirInst::new(P::RefAsNonNull));
                self.push(rt);
            }
            O::ThrowRef => {
                self.pop();
                self.emit(offset, PirInst::new(P::ThrowRef));
                self.enter_dead_code();
            }
            _ => return Err(PirError::InvalidIR),
        }
        Ok(())
    }

    fn step_indexed(&mut self, offset: usize, op: Opcode, index: u32) -> Result<(), PirError> {
        use Opcode as O;
        use PirOp as P;

        match op {
            O::Call | O::ReturnCall => {
                let ft = self.module.func_type(FuncIdx::new(index));
                let (nparams, results) = (ft.params.len(), ft.results.clone());
                self.pop_n(nparams);
                let pir = if op == O::ReturnCall {
                    P::ReturnCall
                } else {
                    P::Call
                };
                self.emit(offset, PirInst::a(pir, index));
                if op == O::ReturnCall {
                    self.enter_dead_code();
                } else {
                    for ty in results {
                        self.push(ty);
                    }
                }
            }
            O::CallRef | O::ReturnCallRef => {
                let ft = self.func_type_of(index);
                let (nparams, results) = (ft.params.len(), ft.results.clone());
                self.pop(); // function reference
                self.pop_n(nparams);
                let pir = if op == O::ReturnCallRef {
                    P::ReturnCallRef
                } else {
                    P::CallRef
                };
                self.emit(offset, PirInst::a(pir, index));
                if op == O::ReturnCallRef {
                    self.enter_dead_code();
                } else {
                    for ty in results {
                        self.push(ty);
                    }
                }
            }
            O::LocalGet => {
                let ty = self.out.local_types[index as usize];
                let slot = self.out.local_slot[index as usize];
                self.emit(
                    offset,
                    PirInst::ab(P::LocalGet, slot, ty.slot_count() as u32),
                );
                self.push(ty);
            }
            O::LocalSet => {
                let ty = self.out.local_types[index as usize];
                let slot = self.out.local_slot[index as usize];
                self.pop();
                self.emit(
                    offset,
                    PirInst::ab(P::LocalSet, slot, ty.slot_count() as u32),
                );
            }
            O::LocalTee => {
                let ty = self.out.local_types[index as usize];
                let slot = self.out.local_slot[index as usize];
                self.emit(
                    offset,
                    PirInst::ab(P::LocalTee, slot, ty.slot_count() as u32),
                );
            }
            O::GlobalGet => {
                let ty = self.module.global_types[index as usize].value;
                self.emit(
                    offset,
                    PirInst::ab(P::GlobalGet, index, ty.slot_count() as u32),
                );
                self.push(ty);
            }
            O::GlobalSet => {
                let ty = self.module.global_types[index as usize].value;
                self.pop();
                self.emit(
                    offset,
                    PirInst::ab(P::GlobalSet, index, ty.slot_count() as u32),
                );
            }
            O::TableGet => {
                self.pop();
                self.emit(offset, PirInst::a(P::TableGet, index));
                self.push(ValType::Ref(self.module.tables[index as usize].element));
            }
            O::TableSet => {
                self.pop();
                self.pop();
                self.emit(offset, PirInst::a(P::TableSet, index));
            }
            O::RefFunc => {
                self.emit(offset, PirInst::a(P::RefFunc, index));
                let ty = self.module.functions[index as usize];
                self.push(ValType::Ref(RefType {
                    nullable: false,
                    heap: HeapType::Concrete(ty),
                }));
            }
            O::Throw => {
                let params = self.module.types[usize::from(self.module.tags[index as usize].ty)]
                    .as_func()
                    .expect("validated tag type")
                    .params
                    .len();
                self.pop_n(params);
                self.emit(offset, PirInst::a(P::Throw, index));
                self.enter_dead_code();
            }
            _ => return Err(PirError::InvalidIR),
        }
        Ok(())
    }

    fn step_misc(&mut self, offset: usize, op: MiscOpcode, a: u32, b: u32) -> Result<(), PirError> {
        use MiscOpcode as M;
        use PirOp as P;
        use ValType::{I32, I64};

        let (pir, pops, pushed): (PirOp, usize, Option<ValType>) = match op {
            M::I32TruncSatF32S => (P::I32TruncSatF32S, 1, Some(I32)),
            M::I32TruncSatF32U => (P::I32TruncSatF32U, 1, Some(I32)),
            M::I32TruncSatF64S => (P::I32TruncSatF64S, 1, Some(I32)),
            M::I32TruncSatF64U => (P::I32TruncSatF64U, 1, Some(I32)),
            M::I64TruncSatF32S => (P::I64TruncSatF32S, 1, Some(I64)),
            M::I64TruncSatF32U => (P::I64TruncSatF32U, 1, Some(I64)),
            M::I64TruncSatF64S => (P::I64TruncSatF64S, 1, Some(I64)),
            M::I64TruncSatF64U => (P::I64TruncSatF64U, 1, Some(I64)),
            M::MemoryInit => (P::MemoryInit, 3, None),
            M::DataDrop => (P::DataDrop, 0, None),
            M::MemoryCopy => (P::MemoryCopy, 3, None),
            M::MemoryFill => (P::MemoryFill, 3, None),
            M::TableInit => (P::TableInit, 3, None),
            M::ElemDrop => (P::ElemDrop, 0, None),
            M::TableCopy => (P::TableCopy, 3, None),
            M::TableGrow => (P::TableGrow, 2, Some(self.table_addr_type(a))),
            M::TableSize => (P::TableSize, 0, Some(self.table_addr_type(a))),
            M::TableFill => (P::TableFill, 3, None),
        };
        self.pop_n(pops);
        self.emit(offset, PirInst::ab(pir, a, b));
        if let Some(ty) = pushed {
            self.push(ty);
        }
        Ok(())
    }

    fn step_gc(&mut self, offset: usize, op: GcOpcode, a: u32, b: u32) -> Result<(), PirError> {
        use GcOpcode as G;
        use PirOp as P;
        use ValType::I32;

        // GC storage is modeled as one slot per field; vector fields would
        // need the full-width interpreter.
        if matches!(
            op,
            G::StructNew
                | G::StructNewDefault
                | G::StructGet
                | G::StructGetS
                | G::StructGetU
                | G::StructSet
                | G::ArrayNew
                | G::ArrayNewDefault
                | G::ArrayNewFixed
                | G::ArrayGet
                | G::ArrayGetS
                | G::ArrayGetU
                | G::ArraySet
                | G::ArrayFill
        ) && self.gc_type_has_v128(a)
        {
            return Err(PirError::UnsupportedSimd(0x0c));
        }

        let concrete = |idx: u32| {
            ValType::Ref(RefType {
                nullable: false,
                heap: HeapType::Concrete(TypeIdx::new(idx)),
            })
        };

        match op {
            G::StructNew => {
                let n = self.struct_field_count(a);
                self.pop_n(n);
                self.emit(offset, PirInst::a(P::StructNew, a));
                self.push(concrete(a));
            }
            G::StructNewDefault => {
                self.emit(offset, PirInst::a(P::StructNewDefault, a));
                self.push(concrete(a));
            }
            G::StructGet | G::StructGetS | G::StructGetU => {
                self.pop();
                let sign = match op {
                    G::StructGet => 0,
                    G::StructGetS => 1,
                    _ => 2,
                };
                self.emit(offset, PirInst::abc(P::StructGet, a, b, sign));
                self.push(self.struct_field_type(a, b));
            }
            G::StructSet => {
                self.pop();
                self.pop();
                self.emit(offset, PirInst::ab(P::StructSet, a, b));
            }
            G::ArrayNew => {
                self.pop_n(2);
                self.emit(offset, PirInst::a(P::ArrayNew, a));
                self.push(concrete(a));
            }
            G::ArrayNewDefault => {
                self.pop();
                self.emit(offset, PirInst::a(P::ArrayNewDefault, a));
                self.push(concrete(a));
            }
            G::ArrayNewFixed => {
                self.pop_n(b as usize);
                self.emit(offset, PirInst::ab(P::ArrayNewFixed, a, b));
                self.push(concrete(a));
            }
            G::ArrayNewData => {
                self.pop_n(2);
                self.emit(offset, PirInst::ab(P::ArrayNewData, a, b));
                self.push(concrete(a));
            }
            G::ArrayNewElem => {
                self.pop_n(2);
                self.emit(offset, PirInst::ab(P::ArrayNewElem, a, b));
                self.push(concrete(a));
            }
            G::ArrayGet | G::ArrayGetS | G::ArrayGetU => {
                self.pop_n(2);
                let sign = match op {
                    G::ArrayGet => 0,
                    G::ArrayGetS => 1,
                    _ => 2,
                };
                self.emit(offset, PirInst::abc(P::ArrayGet, a, 0, sign));
                self.push(self.array_elem_type(a));
            }
            G::ArraySet => {
                self.pop_n(3);
                self.emit(offset, PirInst::a(P::ArraySet, a));
            }
            G::ArrayLen => {
                self.pop();
                self.emit(offset, PirInst::new(P::ArrayLen));
                self.push(I32);
            }
            G::ArrayFill => {
                self.pop_n(4);
                self.emit(offset, PirInst::a(P::ArrayFill, a));
            }
            G::ArrayCopy => {
                self.pop_n(5);
                self.emit(offset, PirInst::ab(P::ArrayCopy, a, b));
            }
            G::ArrayInitData => {
                self.pop_n(4);
                self.emit(offset, PirInst::ab(P::ArrayInitData, a, b));
            }
            G::ArrayInitElem => {
                self.pop_n(4);
                self.emit(offset, PirInst::ab(P::ArrayInitElem, a, b));
            }
            G::AnyConvertExtern => {
                let rt = self.pop();
                self.emit(offset, PirInst::new(P::AnyConvertExtern));
                self.push(convert_hierarchy(rt, HeapType::Any));
            }
            G::ExternConvertAny => {
                let rt = self.pop();
                self.emit(offset, PirInst::new(P::ExternConvertAny));
                self.push(convert_hierarchy(rt, HeapType::Extern));
            }
            G::RefI31 => {
                self.pop();
                self.emit(offset, PirInst::new(P::RefI31));
                self.push(ValType::Ref(RefType {
                    nullable: false,
                    heap: HeapType::I31,
                }));
            }
            G::I31GetS => {
                self.pop();
                self.emit(offset, PirInst::new(P::I31GetS));
                self.push(I32);
            }
            G::I31GetU => {
                self.pop();
                self.emit(offset, PirInst::new(P::I31GetU));
                self.push(I32);
            }
            G::RefTest | G::RefTestNull | G::RefCast | G::RefCastNull | G::BrOnCast
            | G::BrOnCastFail => unreachable!("decoded as dedicated variants"),
        }
        Ok(())
    }

    fn gc_type_has_v128(&self, type_idx: u32) -> bool {
        match &self.module.types[type_idx as usize].composite {
            crate::types::CompositeType::Struct(fields) => fields
                .iter()
                .any(|field| field.storage.unpacked().slot_count() != 1),
            crate::types::CompositeType::Array(field) => {
                field.storage.unpacked().slot_count() != 1
            }
            crate::types::CompositeType::Func(_) => false,
        }
    }

    fn struct_field_count(&self, type_idx: u32) -> usize {
        match &self.module.types[type_idx as usize].composite {
            crate::types::CompositeType::Struct(fields) => fields.len(),
            _ => 0,
        }
    }

    fn struct_field_type(&self, type_idx: u32, field: u32) -> ValType {
        match &self.module.types[type_idx as usize].composite {
            crate::types::CompositeType::Struct(fields) => {
                fields[field as usize].storage.unpacked()
            }
            _ => ValType::I32,
        }
    }

    fn array_elem_type(&self, type_idx: u32) -> ValType {
        match &self.module.types[type_idx as usize].composite {
            crate::types::CompositeType::Array(field) => field.storage.unpacked(),
            _ => ValType::I32,
        }
    }

    fn step_simd(&mut self, offset: usize, sub: u32, imm: SimdImm) -> Result<(), PirError> {
        use PirOp as P;
        use ValType::{I32, V128};

        match (sub, imm) {
            // v128.load / v128.store.
            (0x00, SimdImm::Mem(arg)) => {
                let payload = self.memarg(arg);
                self.pop();
                self.emit(offset, PirInst::a(P::V128Load, payload));
                self.push(V128);
            }
            (0x0b, SimdImm::Mem(arg)) => {
                let payload = self.memarg(arg);
                self.pop_n(2);
                self.emit(offset, PirInst::a(P::V128Store, payload));
            }
            (0x0c, SimdImm::Bytes(bytes)) => {
                let idx = self.out.v128.len() as u32;
                self.out.v128.push(bytes);
                self.emit(offset, PirInst::a(P::V128Const, idx));
                self.push(V128);
            }
            (0x0f, _) => {
                self.pop();
                self.emit(offset, PirInst::new(P::I8x16Splat));
                self.push(V128);
            }
            (0x10, _) => {
                self.pop();
                self.emit(offset, PirInst::new(P::I16x8Splat));
                self.push(V128);
            }
            (0x11, _) => {
                self.pop();
                self.emit(offset, PirInst::new(P::I32x4Splat));
                self.push(V128);
            }
            (0x12, _) => {
                self.pop();
                self.emit(offset, PirInst::new(P::I64x2Splat));
                self.push(V128);
            }
            (0x1b, SimdImm::Lane(lane)) => {
                self.pop();
                self.emit(offset, PirInst::a(P::I32x4ExtractLane, u32::from(lane)));
                self.push(I32);
            }
            (0x1c, SimdImm::Lane(lane)) => {
                self.pop_n(2);
                self.emit(offset, PirInst::a(P::I32x4ReplaceLane, u32::from(lane)));
                self.push(V128);
            }
            (0x4d, _) => {
                self.pop();
                self.emit(offset, PirInst::new(P::V128Not));
                self.push(V128);
            }
            (0x4e, _) => {
                self.pop_n(2);
                self.emit(offset, PirInst::new(P::V128And));
                self.push(V128);
            }
            (0x50, _) => {
                self.pop_n(2);
                self.emit(offset, PirInst::new(P::V128Or));
                self.push(V128);
            }
            (0x51, _) => {
                self.pop_n(2);
                self.emit(offset, PirInst::new(P::V128Xor));
                self.push(V128);
            }
            (0x53, _) => {
                self.pop();
                self.emit(offset, PirInst::new(P::V128AnyTrue));
                self.push(I32);
            }
            (0xa3, _) => {
                self.pop();
                self.emit(offset, PirInst::new(P::I32x4AllTrue));
                self.push(I32);
            }
            (0xae, _) => {
                self.pop_n(2);
                self.emit(offset, PirInst::new(P::I32x4Add));
                self.push(V128);
            }
            (0xb1, _) => {
                self.pop_n(2);
                self.emit(offset, PirInst::new(P::I32x4Sub));
                self.push(V128);
            }
            (0xb5, _) => {
                self.pop_n(2);
                self.emit(offset, PirInst::new(P::I32x4Mul));
                self.push(V128);
            }
            _ => return Err(PirError::UnsupportedSimd(sub)),
        }
        Ok(())
    }

    fn step_atomic(
        &mut self,
        offset: usize,
        class: AtomicClass,
        arg: MemArg,
    ) -> Result<(), PirError> {
        use PirOp as P;
        use ValType::{I32, I64};

        let payload = self.memarg(arg);
        match class {
            AtomicClass::Sync(AtomicOpcode::MemoryAtomicNotify) => {
                self.pop_n(2);
                self.emit(offset, PirInst::a(P::AtomicNotify, payload));
                self.push(I32);
            }
            AtomicClass::Sync(AtomicOpcode::MemoryAtomicWait32) => {
                self.pop_n(3);
                self.emit(offset, PirInst::a(P::AtomicWait32, payload));
                self.push(I32);
            }
            AtomicClass::Sync(AtomicOpcode::MemoryAtomicWait64) => {
                self.pop_n(3);
                self.emit(offset, PirInst::a(P::AtomicWait64, payload));
                self.push(I32);
            }
            AtomicClass::Sync(AtomicOpcode::AtomicFence) => unreachable!(),
            // In the sequential model an atomic access is its plain
            // counterpart; zero-extension for narrow loads matches the _u
            // load semantics.
            AtomicClass::Load { is_64, width } => {
                self.pop();
                let pir = match (is_64, width) {
                    (false, 4) => P::I32Load,
                    (false, 1) => P::I32Load8U,
                    (false, 2) => P::I32Load16U,
                    (true, 8) => P::I64Load,
                    (true, 1) => P::I64Load8U,
                    (true, 2) => P::I64Load16U,
                    (true, 4) => P::I64Load32U,
                    _ => return Err(PirError::InvalidIR),
                };
                self.emit(offset, PirInst::a(pir, payload));
                self.push(if is_64 { I64 } else { I32 });
            }
            AtomicClass::Store { is_64, width } => {
                self.pop_n(2);
                let pir = match (is_64, width) {
                    (false, 4) => P::I32Store,
                    (false, 1) => P::I32Store8,
                    (false, 2) => P::I32Store16,
                    (true, 8) => P::I64Store,
                    (true, 1) => P::I64Store8,
                    (true, 2) => P::I64Store16,
                    (true, 4) => P::I64Store32,
                    _ => return Err(PirError::InvalidIR),
                };
                self.emit(offset, PirInst::a(pir, payload));
            }
            AtomicClass::Rmw { is_64, width, op } => {
                self.pop_n(2);
                let kind = AtomicRmwKind { is_64, width, op };
                self.emit(offset, PirInst::ab(P::AtomicRmw, payload, kind.pack()));
                self.push(if is_64 { I64 } else { I32 });
            }
            AtomicClass::Cmpxchg { is_64, width } => {
                self.pop_n(3);
                let kind = AtomicRmwKind {
                    is_64,
                    width,
                    op: RmwOp::Xchg,
                };
                self.emit(offset, PirInst::ab(P::AtomicCmpxchg, payload, kind.pack()));
                self.push(if is_64 { I64 } else { I32 });
            }
        }
        Ok(())
    }
}

// An if's pending false-branch fixup points at a BrIfZero; else-retargeting
// applies only to those.
fn is_else_fixup(out: &PirFunction, pc: u32) -> bool {
    out.insts[pc as usize].op == PirOp::BrIfZero
}

fn patch_target(out: &mut PirFunction, fixup: Fixup, end_pc: u32) {
    match fixup {
        Fixup::BranchTarget(pc) => out.insts[pc as usize].a = end_pc,
        Fixup::TableTarget { table, entry } => {
            out.br_tables[table as usize].targets[entry as usize].0 = end_pc;
        }
        Fixup::CatchTarget { handler, entry } => {
            out.handlers[handler as usize].clauses[entry as usize].target = end_pc;
        }
        Fixup::CastTarget(cast) => out.casts[cast as usize].target = end_pc,
    }
}

fn convert_hierarchy(rt: ValType, to: HeapType) -> ValType {
    let nullable = matches!(rt, ValType::Ref(r) if r.nullable);
    ValType::Ref(RefType { nullable, heap: to })
}

// Lowers a plain load/store opcode: (PIR op, pushed type, popped value
// type for stores).
fn lower_mem_op(op: Opcode) -> (PirOp, Option<ValType>, Option<ValType>) {
    use Opcode as O;
    use PirOp as P;
    use ValType::{F32, F64, I32, I64};
    match op {
        O::I32Load => (P::I32Load, Some(I32), None),
        O::I64Load => (P::I64Load, Some(I64), None),
        O::F32Load => (P::F32Load, Some(F32), None),
        O::F64Load => (P::F64Load, Some(F64), None),
        O::I32Load8S => (P::I32Load8S, Some(I32), None),
        O::I32Load8U => (P::I32Load8U, Some(I32), None),
        O::I32Load16S => (P::I32Load16S, Some(I32), None),
        O::I32Load16U => (P::I32Load16U, Some(I32), None),
        O::I64Load8S => (P::I64Load8S, Some(I64), None),
        O::I64Load8U => (P::I64Load8U, Some(I64), None),
        O::I64Load16S => (P::I64Load16S, Some(I64), None),
        O::I64Load16U => (P::I64Load16U, Some(I64), None),
        O::I64Load32S => (P::I64Load32S, Some(I64), None),
        O::I64Load32U => (P::I64Load32U, Some(I64), None),
        O::I32Store => (P::I32Store, None, Some(I32)),
        O::I64Store => (P::I64Store, None, Some(I64)),
        O::F32Store => (P::F32Store, None, Some(F32)),
        O::F64Store => (P::F64Store, None, Some(F64)),
        O::I32Store8 => (P::I32Store8, None, Some(I32)),
        O::I32Store16 => (P::I32Store16, None, Some(I32)),
        O::I64Store8 => (P::I64Store8, None, Some(I64)),
        O::I64Store16 => (P::I64Store16, None, Some(I64)),
        O::I64Store32 => (P::I64Store32, None, Some(I64)),
        _ => unreachable!("not a memory access: {op:?}"),
    }
}

// 1:1 numeric lowering: (PIR op, values popped, value pushed).
fn lower_numeric(op: Opcode) -> Option<(PirOp, usize, Option<ValType>)> {
    use Opcode as O;
    use PirOp as P;
    use ValType::{F32, F64, I32, I64};

    macro_rules! map {
        ($pir:ident, $pops:expr, $push:expr) => {
            Some((P::$pir, $pops, $push))
        };
    }

    match op {
        O::I32Eqz => map!(I32Eqz, 1, Some(I32)),
        O::I32Eq => map!(I32Eq, 2, Some(I32)),
        O::I32Ne => map!(I32Ne, 2, Some(I32)),
        O::I32LtS => map!(I32LtS, 2, Some(I32)),
        O::I32LtU => map!(I32LtU, 2, Some(I32)),
        O::I32GtS => map!(I32GtS, 2, Some(I32)),
        O::I32GtU => map!(I32GtU, 2, Some(I32)),
        O::I32LeS => map!(I32LeS, 2, Some(I32)),
        O::I32LeU => map!(I32LeU, 2, Some(I32)),
        O::I32GeS => map!(I32GeS, 2, Some(I32)),
        O::I32GeU => map!(I32GeU, 2, Some(I32)),
        O::I64Eqz => map!(I64Eqz, 1, Some(I32)),
        O::I64Eq => map!(I64Eq, 2, Some(I32)),
        O::I64Ne => map!(I64Ne, 2, Some(I32)),
        O::I64LtS => map!(I64LtS, 2, Some(I32)),
        O::I64LtU => map!(I64LtU, 2, Some(I32)),
        O::I64GtS => map!(I64GtS, 2, Some(I32)),
        O::I64GtU => map!(I64GtU, 2, Some(I32)),
        O::I64LeS => map!(I64LeS, 2, Some(I32)),
        O::I64LeU => map!(I64LeU, 2, Some(I32)),
        O::I64GeS => map!(I64GeS, 2, Some(I32)),
        O::I64GeU => map!(I64GeU, 2, Some(I32)),
        O::F32Eq => map!(F32Eq, 2, Some(I32)),
        O::F32Ne => map!(F32Ne, 2, Some(I32)),
        O::F32Lt => map!(F32Lt, 2, Some(I32)),
        O::F32Gt => map!(F32Gt, 2, Some(I32)),
        O::F32Le => map!(F32Le, 2, Some(I32)),
        O::F32Ge => map!(F32Ge, 2, Some(I32)),
        O::F64Eq => map!(F64Eq, 2, Some(I32)),
        O::F64Ne => map!(F64Ne, 2, Some(I32)),
        O::F64Lt => map!(F64Lt, 2, Some(I32)),
        O::F64Gt => map!(F64Gt, 2, Some(I32)),
        O::F64Le => map!(F64Le, 2, Some(I32)),
        O::F64Ge => map!(F64Ge, 2, Some(I32)),
        O::I32Clz => map!(I32Clz, 1, Some(I32)),
        O::I32Ctz => map!(I32Ctz, 1, Some(I32)),
        O::I32Popcnt => map!(I32Popcnt, 1, Some(I32)),
        O::I32Add => map!(I32Add, 2, Some(I32)),
        O::I32Sub => map!(I32Sub, 2, Some(I32)),
        O::I32Mul => map!(I32Mul, 2, Some(I32)),
        O::I32DivS => map!(I32DivS, 2, Some(I32)),
        O::I32DivU => map!(I32DivU, 2, Some(I32)),
        O::I32RemS => map!(I32RemS, 2, Some(I32)),
        O::I32RemU => map!(I32RemU, 2, Some(I32)),
        O::I32And => map!(I32And, 2, Some(I32)),
        O::I32Or => map!(I32Or, 2, Some(I32)),
        O::I32Xor => map!(I32Xor, 2, Some(I32)),
        O::I32Shl => map!(I32Shl, 2, Some(I32)),
        O::I32ShrS => map!(I32ShrS, 2, Some(I32)),
        O::I32ShrU => map!(I32ShrU, 2, Some(I32)),
        O::I32Rotl => map!(I32Rotl, 2, Some(I32)),
        O::I32Rotr => map!(I32Rotr, 2, Some(I32)),
        O::I64Clz => map!(I64Clz, 1, Some(I64)),
        O::I64Ctz => map!(I64Ctz, 1, Some(I64)),
        O::I64Popcnt => map!(I64Popcnt, 1, Some(I64)),
        O::I64Add => map!(I64Add, 2, Some(I64)),
        O::I64Sub => map!(I64Sub, 2, Some(I64)),
        O::I64Mul => map!(I64Mul, 2, Some(I64)),
        O::I64DivS => map!(I64DivS, 2, Some(I64)),
        O::I64DivU => map!(I64DivU, 2, Some(I64)),
        O::I64RemS => map!(I64RemS, 2, Some(I64)),
        O::I64RemU => map!(I64RemU, 2, Some(I64)),
        O::I64And => map!(I64And, 2, Some(I64)),
        O::I64Or => map!(I64Or, 2, Some(I64)),
        O::I64Xor => map!(I64Xor, 2, Some(I64)),
        O::I64Shl => map!(I64Shl, 2, Some(I64)),
        O::I64ShrS => map!(I64ShrS, 2, Some(I64)),
        O::I64ShrU => map!(I64ShrU, 2, Some(I64)),
        O::I64Rotl => map!(I64Rotl, 2, Some(I64)),
        O::I64Rotr => map!(I64Rotr, 2, Some(I64)),
        O::F32Abs => map!(F32Abs, 1, Some(F32)),
        O::F32Neg => map!(F32Neg, 1, Some(F32)),
        O::F32Ceil => map!(F32Ceil, 1, Some(F32)),
        O::F32Floor => map!(F32Floor, 1, Some(F32)),
        O::F32Trunc => map!(F32Trunc, 1, Some(F32)),
        O::F32Nearest => map!(F32Nearest, 1, Some(F32)),
        O::F32Sqrt => map!(F32Sqrt, 1, Some(F32)),
        O::F32Add => map!(F32Add, 2, Some(F32)),
        O::F32Sub => map!(F32Sub, 2, Some(F32)),
        O::F32Mul => map!(F32Mul, 2, Some(F32)),
        O::F32Div => map!(F32Div, 2, Some(F32)),
        O::F32Min => map!(F32Min, 2, Some(F32)),
        O::F32Max => map!(F32Max, 2, Some(F32)),
        O::F32Copysign => map!(F32Copysign, 2, Some(F32)),
        O::F64Abs => map!(F64Abs, 1, Some(F64)),
        O::F64Neg => map!(F64Neg, 1, Some(F64)),
        O::F64Ceil => map!(F64Ceil, 1, Some(F64)),
        O::F64Floor => map!(F64Floor, 1, Some(F64)),
        O::F64Trunc => map!(F64Trunc, 1, Some(F64)),
        O::F64Nearest => map!(F64Nearest, 1, Some(F64)),
        O::F64Sqrt => map!(F64Sqrt, 1, Some(F64)),
        O::F64Add => map!(F64Add, 2, Some(F64)),
        O::F64Sub => map!(F64Sub, 2, Some(F64)),
        O::F64Mul => map!(F64Mul, 2, Some(F64)),
        O::F64Div => map!(F64Div, 2, Some(F64)),
        O::F64Min => map!(F64Min, 2, Some(F64)),
        O::F64Max => map!(F64Max, 2, Some(F64)),
        O::F64Copysign => map!(F64Copysign, 2, Some(F64)),
        O::I32WrapI64 => map!(I32WrapI64, 1, Some(I32)),
        O::I32TruncF32S => map!(I32TruncF32S, 1, Some(I32)),
        O::I32TruncF32U => map!(I32TruncF32U, 1, Some(I32)),
        O::I32TruncF64S => map!(I32TruncF64S, 1, Some(I32)),
        O::I32TruncF64U => map!(I32TruncF64U, 1, Some(I32)),
        O::I64ExtendI32S => map!(I64ExtendI32S, 1, Some(I64)),
        O::I64ExtendI32U => map!(I64ExtendI32U, 1, Some(I64)),
        O::I64TruncF32S => map!(I64TruncF32S, 1, Some(I64)),
        O::I64TruncF32U => map!(I64TruncF32U, 1, Some(I64)),
        O::I64TruncF64S => map!(I64TruncF64S, 1, Some(I64)),
        O::I64TruncF64U => map!(I64TruncF64U, 1, Some(I64)),
        O::F32ConvertI32S => map!(F32ConvertI32S, 1, Some(F32)),
        O::F32ConvertI32U => map!(F32ConvertI32U, 1, Some(F32)),
        O::F32ConvertI64S => map!(F32ConvertI64S, 1, Some(F32)),
        O::F32ConvertI64U => map!(F32ConvertI64U, 1, Some(F32)),
        O::F32DemoteF64 => map!(F32DemoteF64, 1, Some(F32)),
        O::F64ConvertI32S => map!(F64ConvertI32S, 1, Some(F64)),
        O::F64ConvertI32U => map!(F64ConvertI32U, 1, Some(F64)),
        O::F64ConvertI64S => map!(F64ConvertI64S, 1, Some(F64)),
        O::F64ConvertI64U => map!(F64ConvertI64U, 1, Some(F64)),
        O::F64PromoteF32 => map!(F64PromoteF32, 1, Some(F64)),
        O::I32ReinterpretF32 => map!(I32ReinterpretF32, 1, Some(I32)),
        O::I64ReinterpretF64 => map!(I64ReinterpretF64, 1, Some(I64)),
        O::F32ReinterpretI32 => map!(F32ReinterpretI32, 1, Some(F32)),
        O::F64ReinterpretI64 => map!(F64ReinterpretI64, 1, Some(F64)),
        O::I32Extend8S => map!(I32Extend8S, 1, Some(I32)),
        O::I32Extend16S => map!(I32Extend16S, 1, Some(I32)),
        O::I64Extend8S => map!(I64Extend8S, 1, Some(I64)),
        O::I64Extend16S => map!(I64Extend16S, 1, Some(I64)),
        O::I64Extend32S => map!(I64Extend32S, 1, Some(I64)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CompositeType, SubType};

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

    fn build(module: &ModuleInner, locals: Vec<(u32, ValType)>, body: &[u8]) -> PirFunction {
        let body = FuncBody {
            locals,
            bytecode: body.into(),
            offset: 0,
        };
        build_pir(module, FuncIdx::new(0), &body).unwrap()
    }

    #[test]
    fn lowers_straight_line_code() {
        let module = test_module(vec![ValType::I32], vec![ValType::I32]);
        // local.get 0; i32.const 1; i32.add; end
        let pir = build(&module, vec![], &[0x20, 0x00, 0x41, 0x01, 0x6a, 0x0b]);
        let ops: Vec<PirOp> = pir.insts.iter().map(|i| i.op).collect();
        assert_eq!(
            ops,
            vec![PirOp::LocalGet, PirOp::I32Const, PirOp::I32Add, PirOp::Return]
        );
        assert_eq!(pir.insts[3].a, 1); // one result slot
        assert_eq!(pir.pc_map, vec![0, 2, 4, 5]);
    }

    #[test]
    fn resolves_forward_branch() {
        let module = test_module(vec![], vec![]);
        // block; br 0; end; end
        let pir = build(&module, vec![], &[0x02, 0x40, 0x0c, 0x00, 0x0b, 0x0b]);
        assert_eq!(pir.insts[0].op, PirOp::Br);
        // The branch lands on the implicit Return emitted at function end.
        assert_eq!(pir.insts[0].a, 1);
        assert_eq!(pir.insts[1].op, PirOp::Return);
    }

    #[test]
    fn resolves_loop_back_edge() {
        let module = test_module(vec![], vec![]);
        // loop; br 0; end; end — an infinite loop.
        let pir = build(&module, vec![], &[0x03, 0x40, 0x0c, 0x00, 0x0b, 0x0b]);
        assert_eq!(pir.insts[0].op, PirOp::Br);
        assert_eq!(pir.insts[0].a, 0); // back to the loop head
        assert_eq!(pir.loop_heads, vec![0]);
    }

    #[test]
    fn lowers_if_else() {
        let module = test_module(vec![ValType::I32], vec![ValType::I32]);
        // local.get 0; if (result i32); i32.const 1; else; i32.const 2;
        // end; end
        let pir = build(
            &module,
            vec![],
            &[
                0x20, 0x00, 0x04, 0x7f, 0x41, 0x01, 0x05, 0x41, 0x02, 0x0b, 0x0b,
            ],
        );
        let ops: Vec<PirOp> = pir.insts.iter().map(|i| i.op).collect();
        assert_eq!(
            ops,
            vec![
                PirOp::LocalGet,
                PirOp::BrIfZero,
                PirOp::I32Const, // then
                PirOp::Br,       // jump over else
                PirOp::I32Const, // else
                PirOp::Return,
            ]
        );
        assert_eq!(pir.insts[1].a, 4); // false -> else arm
        assert_eq!(pir.insts[3].a, 5); // then -> end
    }

    #[test]
    fn dead_code_is_elided() {
        let module = test_module(vec![], vec![ValType::I32]);
        // i32.const 1; return; i32.const 2; i32.const 3; i32.add; end
        let pir = build(
            &module,
            vec![],
            &[0x41, 0x01, 0x0f, 0x41, 0x02, 0x41, 0x03, 0x6a, 0x0b],
        );
        let ops: Vec<PirOp> = pir.insts.iter().map(|i| i.op).collect();
        // Only the live prefix and the closing implicit return survive.
        assert_eq!(
            ops,
            vec![PirOp::I32Const, PirOp::Return, PirOp::Return]
        );
    }

    #[test]
    fn atomics_lower_to_plain_accesses() {
        let mut module = test_module(vec![], vec![ValType::I32]);
        module.memories.push(crate::types::MemoryType {
            limits: crate::types::Limits { min: 1, max: None },
            shared: false,
            memory64: false,
            page_size_log2: None,
        });
        // i32.const 0; i32.atomic.load offset=0 align=4; end
        let pir = build(
            &module,
            vec![],
            &[0x41, 0x00, 0xfe, 0x10, 0x02, 0x00, 0x0b],
        );
        let ops: Vec<PirOp> = pir.insts.iter().map(|i| i.op).collect();
        assert_eq!(ops, vec![PirOp::I32Const, PirOp::I32Load, PirOp::Return]);
    }

    #[test]
    fn v128_const_uses_pool() {
        let module = test_module(vec![], vec![]);
        let mut body = vec![0xfd, 0x0c];
        body.extend_from_slice(&[7u8; 16]);
        body.extend_from_slice(&[0x1a, 0x0b]); // drop; end
        let pir = build(&module, vec![], &body);
        assert_eq!(pir.insts[0].op, PirOp::V128Const);
        assert_eq!(pir.v128[0], [7u8; 16]);
        assert_eq!(pir.insts[1].op, PirOp::Drop);
        assert_eq!(pir.insts[1].a, 2); // two slots
    }

    #[test]
    fn unsupported_simd_is_reported() {
        let module = test_module(vec![], vec![]);
        // i8x16.shuffle requires the full vector interpreter.
        let mut body = vec![0xfd, 0x0d];
        body.extend_from_slice(&[0u8; 16]);
        body.push(0x0b);
        let body = FuncBody {
            locals: vec![],
            bytecode: body.into(),
            offset: 0,
        };
        assert_eq!(
            build_pir(&module, FuncIdx::new(0), &body),
            Err(PirError::UnsupportedSimd(0x0d))
        );
    }
}
