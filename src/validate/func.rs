// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Function-body type checking.
//!
//! The classic two-stack algorithm: a value-type stack and a control-frame
//! stack. Each control frame records its input/output types, the value-stack
//! height at entry, and an unreachable flag. Polymorphic instructions
//! (unreachable, br, return, throw) switch the current frame to unreachable,
//! after which popped operands type-match against anything.

use crate::decode::body::{BlockType, CatchClause, Inst, InstDecoder, MemArg, SimdImm};
use crate::types::{
    AtomicClass, AtomicOpcode, CompositeType, FieldType, FuncBody, FuncIdx, FuncType, GcOpcode,
    HeapType, MiscOpcode, Mutability, Opcode, RefType, StorageType, ValType,
};

use super::{BodyError, MAX_BLOCK_NESTING, ValidateError, Validator};

// A stack slot: a known type, or the bottom type produced by popping in
// unreachable code.
type Slot = Option<ValType>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum FrameKind {
    Block,
    Loop,
    If,
    Else,
    Try,
}

struct CtrlFrame {
    kind: FrameKind,
    start_types: Vec<ValType>,
    end_types: Vec<ValType>,
    height: usize,
    unreachable: bool,
    // Length of the local-initialization undo log at frame entry.
    init_mark: usize,
}

struct FuncValidator<'v, 'module> {
    validator: &'v Validator<'module>,
    locals: Vec<ValType>,
    local_init: Vec<bool>,
    init_log: Vec<u32>,
    vals: Vec<Slot>,
    ctrls: Vec<CtrlFrame>,
    results: Vec<ValType>,
}

pub(crate) fn validate_function_body(
    validator: &Validator<'_>,
    func: FuncIdx,
    body: &FuncBody,
) -> Result<(), ValidateError> {
    let module = validator.module;
    let ty = module.func_type(func);

    let mut locals = ty.params.clone();
    let mut local_init = vec![true; locals.len()];
    for &(count, local_ty) in &body.locals {
        for _ in 0..count {
            locals.push(local_ty);
            local_init.push(local_ty.is_defaultable());
        }
    }

    let mut fv = FuncValidator {
        validator,
        locals,
        local_init,
        init_log: Vec::new(),
        vals: Vec::new(),
        ctrls: vec![CtrlFrame {
            kind: FrameKind::Block,
            start_types: Vec::new(),
            end_types: ty.results.clone(),
            height: 0,
            unreachable: false,
            init_mark: 0,
        }],
        results: ty.results.clone(),
    };

    let mut decoder = InstDecoder::new(&body.bytecode);
    loop {
        let offset = decoder.offset();
        if decoder.is_at_end() {
            return Err(ValidateError::FunctionBody {
                func: *func,
                offset,
                kind: BodyError::MissingEnd,
            });
        }
        let (offset, inst) = decoder.next().map_err(|err| ValidateError::FunctionBody {
            func: *func,
            offset,
            kind: BodyError::Decode(err),
        })?;
        let done = fv.step(&inst).map_err(|kind| ValidateError::FunctionBody {
            func: *func,
            offset,
            kind,
        })?;
        if done {
            break;
        }
    }
    if !decoder.is_at_end() {
        return Err(ValidateError::FunctionBody {
            func: *func,
            offset: decoder.offset(),
            kind: BodyError::TrailingCode,
        });
    }
    Ok(())
}

impl<'module> FuncValidator<'_, 'module> {
    fn push(&mut self, ty: ValType) {
        self.vals.push(Some(ty));
    }

    fn push_all(&mut self, types: &[ValType]) {
        for &ty in types {
            self.push(ty);
        }
    }

    fn pop_any(&mut self) -> Result<Slot, BodyError> {
        let frame = self.ctrls.last().expect("frame stack never empties early");
        if self.vals.len() == frame.height {
            return if frame.unreachable {
                Ok(None)
            } else {
                Err(BodyError::StackUnderflow)
            };
        }
        Ok(self.vals.pop().unwrap())
    }

    fn pop_expect(&mut self, expect: ValType) -> Result<Slot, BodyError> {
        let actual = self.pop_any()?;
        match actual {
            None => Ok(None),
            Some(ty) if self.validator.is_val_subtype(ty, expect) => Ok(actual),
            Some(ty) => Err(BodyError::OperandMismatch {
                expected: type_name(expect),
                found: type_name(ty),
            }),
        }
    }

    fn pop_all(&mut self, types: &[ValType]) -> Result<(), BodyError> {
        for &ty in types.iter().rev() {
            self.pop_expect(ty)?;
        }
        Ok(())
    }

    // Pops any reference value, returning its type if known.
    fn pop_ref(&mut self) -> Result<Option<RefType>, BodyError> {
        match self.pop_any()? {
            None => Ok(None),
            Some(ValType::Ref(rt)) => Ok(Some(rt)),
            Some(ty) => Err(BodyError::OperandMismatch {
                expected: "a reference",
                found: type_name(ty),
            }),
        }
    }

    fn push_ctrl(
        &mut self,
        kind: FrameKind,
        start_types: Vec<ValType>,
        end_types: Vec<ValType>,
    ) -> Result<(), BodyError> {
        if self.ctrls.len() >= MAX_BLOCK_NESTING {
            return Err(BodyError::NestingTooDeep);
        }
        let height = self.vals.len();
        self.ctrls.push(CtrlFrame {
            kind,
            start_types: start_types.clone(),
            end_types,
            height,
            unreachable: false,
            init_mark: self.init_log.len(),
        });
        self.push_all(&start_types);
        Ok(())
    }

    fn pop_ctrl(&mut self) -> Result<CtrlFrame, BodyError> {
        let frame = self.ctrls.last().expect("frame stack never empties early");
        let end_types = frame.end_types.clone();
        let height = frame.height;
        self.pop_all(&end_types)?;
        if self.vals.len() != height {
            return Err(BodyError::UnbalancedStack);
        }
        let frame = self.ctrls.pop().unwrap();
        // Local initializations do not survive the block that performed
        // them.
        while self.init_log.len() > frame.init_mark {
            let local = self.init_log.pop().unwrap();
            self.local_init[local as usize] = false;
        }
        Ok(frame)
    }

    fn mark_unreachable(&mut self) {
        let frame = self.ctrls.last_mut().expect("frame stack never empties");
        self.vals.truncate(frame.height);
        frame.unreachable = true;
    }

    fn label(&self, depth: u32) -> Result<&CtrlFrame, BodyError> {
        self.ctrls
            .len()
            .checked_sub(1 + depth as usize)
            .map(|idx| &self.ctrls[idx])
            .ok_or(BodyError::BadLabel(depth))
    }

    fn label_types(&self, depth: u32) -> Result<Vec<ValType>, BodyError> {
        let frame = self.label(depth)?;
        Ok(if frame.kind == FrameKind::Loop {
            frame.start_types.clone()
        } else {
            frame.end_types.clone()
        })
    }

    fn block_signature(&self, bt: BlockType) -> Result<(Vec<ValType>, Vec<ValType>), BodyError> {
        match bt {
            BlockType::Empty => Ok((Vec::new(), Vec::new())),
            BlockType::Value(ty) => Ok((Vec::new(), vec![ty])),
            BlockType::Func(idx) => {
                let ft = self.func_type_by_type_idx(idx)?;
                Ok((ft.params.clone(), ft.results.clone()))
            }
        }
    }

    fn func_type_by_type_idx(&self, idx: u32) -> Result<&'module FuncType, BodyError> {
        self.validator
            .module
            .types
            .get(idx as usize)
            .and_then(|sub| sub.as_func())
            .ok_or(BodyError::NotAFunctionType(idx))
    }

    fn tag_params(&self, tag: u32) -> Result<&'module [ValType], BodyError> {
        let module = self.validator.module;
        let tag_ty = module
            .tags
            .get(tag as usize)
            .ok_or(BodyError::BadIndex {
                space: "tag",
                index: tag,
            })?;
        Ok(&self.func_type_by_type_idx(*tag_ty.ty)?.params)
    }

    fn memory_addr_type(&self, memory: u32) -> Result<ValType, BodyError> {
        let module = self.validator.module;
        let ty = module.memories.get(memory as usize).ok_or(BodyError::BadIndex {
            space: "memory",
            index: memory,
        })?;
        Ok(if ty.memory64 { ValType::I64 } else { ValType::I32 })
    }

    fn table_addr_type(&self, table: u32) -> Result<ValType, BodyError> {
        let module = self.validator.module;
        let ty = module.tables.get(table as usize).ok_or(BodyError::BadIndex {
            space: "table",
            index: table,
        })?;
        Ok(if ty.table64 { ValType::I64 } else { ValType::I32 })
    }

    fn check_mem_access(&mut self, arg: MemArg, width: u32) -> Result<ValType, BodyError> {
        let addr_ty = self.memory_addr_type(arg.memory)?;
        if (1u64 << arg.align) > u64::from(width) {
            return Err(BodyError::AlignTooLarge { align: arg.align });
        }
        Ok(addr_ty)
    }

    fn binop(&mut self, ty: ValType) -> Result<(), BodyError> {
        self.pop_expect(ty)?;
        self.pop_expect(ty)?;
        self.push(ty);
        Ok(())
    }

    fn unop(&mut self, ty: ValType) -> Result<(), BodyError> {
        self.pop_expect(ty)?;
        self.push(ty);
        Ok(())
    }

    fn relop(&mut self, ty: ValType) -> Result<(), BodyError> {
        self.pop_expect(ty)?;
        self.pop_expect(ty)?;
        self.push(ValType::I32);
        Ok(())
    }

    fn cvt(&mut self, from: ValType, to: ValType) -> Result<(), BodyError> {
        self.pop_expect(from)?;
        self.push(to);
        Ok(())
    }

    fn call_signature(&mut self, ft: &FuncType, tail: bool) -> Result<(), BodyError> {
        let params = ft.params.clone();
        self.pop_all(&params)?;
        if tail {
            // A tail call returns on the caller's behalf; the callee's
            // results must match the caller's exactly.
            if ft.results != self.results {
                return Err(BodyError::TailCalleeMismatch);
            }
            self.mark_unreachable();
        } else {
            let results = ft.results.clone();
            self.push_all(&results);
        }
        Ok(())
    }

    fn local_type(&self, index: u32) -> Result<ValType, BodyError> {
        self.locals
            .get(index as usize)
            .copied()
            .ok_or(BodyError::BadIndex {
                space: "local",
                index,
            })
    }

    fn mark_local_init(&mut self, index: u32) {
        if !self.local_init[index as usize] {
            self.local_init[index as usize] = true;
            self.init_log.push(index);
        }
    }

    // Type-checks one instruction. Returns true once the outermost frame has
    // been closed by its `end`.
    fn step(&mut self, inst: &Inst) -> Result<bool, BodyError> {
        use Opcode::*;
        use ValType::{F32, F64, I32, I64};

        match inst {
            Inst::Simple(op) => match op {
                Unreachable => self.mark_unreachable(),
                Nop => {}
                Else => {
                    let frame = self.pop_ctrl()?;
                    if frame.kind != FrameKind::If {
                        return Err(BodyError::ElseWithoutIf);
                    }
                    self.push_ctrl(FrameKind::Else, frame.start_types, frame.end_types)?;
                }
                End => {
                    let frame = self.pop_ctrl()?;
                    // An if without an else must be an identity block.
                    if frame.kind == FrameKind::If && frame.start_types != frame.end_types {
                        return Err(BodyError::LabelArityMismatch);
                    }
                    let end_types = frame.end_types;
                    self.push_all(&end_types);
                    if self.ctrls.is_empty() {
                        return Ok(true);
                    }
                }
                Return => {
                    let results = self.results.clone();
                    self.pop_all(&results)?;
                    self.mark_unreachable();
                }
                Drop => {
                    self.pop_any()?;
                }
                Select => {
                    self.pop_expect(I32)?;
                    let a = self.pop_any()?;
                    let b = self.pop_any()?;
                    let ty = match (a, b) {
                        (Some(ValType::Ref(_)), _) | (_, Some(ValType::Ref(_))) => {
                            return Err(BodyError::OperandMismatch {
                                expected: "a numeric or vector type",
                                found: "a reference",
                            });
                        }
                        (Some(x), Some(y)) if x != y => {
                            return Err(BodyError::OperandMismatch {
                                expected: type_name(x),
                                found: type_name(y),
                            });
                        }
                        (Some(x), _) | (_, Some(x)) => Some(x),
                        (None, None) => None,
                    };
                    self.vals.push(ty);
                }
                RefIsNull => {
                    self.pop_ref()?;
                    self.push(I32);
                }
                RefEq => {
                    let eq = ValType::Ref(RefType {
                        nullable: true,
                        heap: HeapType::Eq,
                    });
                    self.pop_expect(eq)?;
                    self.pop_expect(eq)?;
                    self.push(I32);
                }
                RefAsNonNull => {
                    let rt = self.pop_ref()?;
                    let heap = rt.map_or(HeapType::None, |rt| rt.heap);
                    self.push(ValType::Ref(RefType {
                        nullable: false,
                        heap,
                    }));
                }
                ThrowRef => {
                    self.pop_expect(ValType::EXNREF)?;
                    self.mark_unreachable();
                }

                // i32 numerics.
                I32Eqz => self.cvt(I32, I32)?,
                I32Eq | I32Ne | I32LtS | I32LtU | I32GtS | I32GtU | I32LeS | I32LeU | I32GeS
                | I32GeU => self.relop(I32)?,
                I32Clz | I32Ctz | I32Popcnt | I32Extend8S | I32Extend16S => self.unop(I32)?,
                I32Add | I32Sub | I32Mul | I32DivS | I32DivU | I32RemS | I32RemU | I32And
                | I32Or | I32Xor | I32Shl | I32ShrS | I32ShrU | I32Rotl | I32Rotr => {
                    self.binop(I32)?;
                }

                // i64 numerics.
                I64Eqz => self.cvt(I64, I32)?,
                I64Eq | I64Ne | I64LtS | I64LtU | I64GtS | I64GtU | I64LeS | I64LeU | I64GeS
                | I64GeU => self.relop(I64)?,
                I64Clz | I64Ctz | I64Popcnt | I64Extend8S | I64Extend16S | I64Extend32S => {
                    self.unop(I64)?;
                }
                I64Add | I64Sub | I64Mul | I64DivS | I64DivU | I64RemS | I64RemU | I64And
                | I64Or | I64Xor | I64Shl | I64ShrS | I64ShrU | I64Rotl | I64Rotr => {
                    self.binop(I64)?;
                }

                // Floats.
                F32Eq | F32Ne | F32Lt | F32Gt | F32Le | F32Ge => self.relop(F32)?,
                F64Eq | F64Ne | F64Lt | F64Gt | F64Le | F64Ge => self.relop(F64)?,
                F32Abs | F32Neg | F32Ceil | F32Floor | F32Trunc | F32Nearest | F32Sqrt => {
                    self.unop(F32)?;
                }
                F64Abs | F64Neg | F64Ceil | F64Floor | F64Trunc | F64Nearest | F64Sqrt => {
                    self.unop(F64)?;
                }
                F32Add | F32Sub | F32Mul | F32Div | F32Min | F32Max | F32Copysign => {
                    self.binop(F32)?;
                }
                F64Add | F64Sub | F64Mul | F64Div | F64Min | F64Max | F64Copysign => {
                    self.binop(F64)?;
                }

                // Conversions.
                I32WrapI64 => self.cvt(I64, I32)?,
                I32TruncF32S | I32TruncF32U => self.cvt(F32, I32)?,
                I32TruncF64S | I32TruncF64U => self.cvt(F64, I32)?,
                I64ExtendI32S | I64ExtendI32U => self.cvt(I32, I64)?,
                I64TruncF32S | I64TruncF32U => self.cvt(F32, I64)?,
                I64TruncF64S | I64TruncF64U => self.cvt(F64, I64)?,
                F32ConvertI32S | F32ConvertI32U => self.cvt(I32, F32)?,
                F32ConvertI64S | F32ConvertI64U => self.cvt(I64, F32)?,
                F32DemoteF64 => self.cvt(F64, F32)?,
                F64ConvertI32S | F64ConvertI32U => self.cvt(I32, F64)?,
                F64ConvertI64S | F64ConvertI64U => self.cvt(I64, F64)?,
                F64PromoteF32 => self.cvt(F32, F64)?,
                I32ReinterpretF32 => self.cvt(F32, I32)?,
                I64ReinterpretF64 => self.cvt(F64, I64)?,
                F32ReinterpretI32 => self.cvt(I32, F32)?,
                F64ReinterpretI64 => self.cvt(I64, F64)?,

                _ => unreachable!("{op:?} carries immediates"),
            },

            Inst::Block { op, bt } => {
                let (params, results) = self.block_signature(*bt)?;
                if *op == If {
                    self.pop_expect(I32)?;
                }
                self.pop_all(&params)?;
                let kind = match op {
                    Block => FrameKind::Block,
                    Loop => FrameKind::Loop,
                    If => FrameKind::If,
                    _ => unreachable!(),
                };
                self.push_ctrl(kind, params, results)?;
            }

            Inst::TryTable { bt, clauses } => {
                let (params, results) = self.block_signature(*bt)?;
                for clause in clauses {
                    let expected: Vec<ValType> = match *clause {
                        CatchClause::One { tag, label: _ } => self.tag_params(tag)?.to_vec(),
                        CatchClause::OneRef { tag, label: _ } => {
                            let mut types = self.tag_params(tag)?.to_vec();
                            types.push(ValType::EXNREF);
                            types
                        }
                        CatchClause::All { .. } => Vec::new(),
                        CatchClause::AllRef { .. } => vec![ValType::EXNREF],
                    };
                    let target = self.label_types(clause.label())?;
                    if target.len() != expected.len()
                        || !expected
                            .iter()
                            .zip(&target)
                            .all(|(&e, &t)| self.validator.is_val_subtype(e, t))
                    {
                        return Err(BodyError::LabelArityMismatch);
                    }
                }
                self.pop_all(&params)?;
                self.push_ctrl(FrameKind::Try, params, results)?;
            }

            Inst::Label { op, depth } => match op {
                Br => {
                    let types = self.label_types(*depth)?;
                    self.pop_all(&types)?;
                    self.mark_unreachable();
                }
                BrIf => {
                    self.pop_expect(I32)?;
                    let types = self.label_types(*depth)?;
                    self.pop_all(&types)?;
                    self.push_all(&types);
                }
                BrOnNull => {
                    let rt = self.pop_ref()?;
                    let types = self.label_types(*depth)?;
                    self.pop_all(&types)?;
                    self.push_all(&types);
                    let heap = rt.map_or(HeapType::None, |rt| rt.heap);
                    self.push(ValType::Ref(RefType {
                        nullable: false,
                        heap,
                    }));
                }
                BrOnNonNull => {
                    let types = self.label_types(*depth)?;
                    let Some(&ValType::Ref(last)) = types.last() else {
                        return Err(BodyError::LabelArityMismatch);
                    };
                    self.pop_expect(ValType::Ref(RefType {
                        nullable: true,
                        heap: last.heap,
                    }))?;
                    let rest = &types[..types.len() - 1];
                    self.pop_all(rest)?;
                    self.push_all(rest);
                }
                _ => unreachable!(),
            },

            Inst::BrTable { targets, default } => {
                self.pop_expect(I32)?;
                let default_types = self.label_types(*default)?;
                for &target in targets {
                    let types = self.label_types(target)?;
                    if types.len() != default_types.len() {
                        return Err(BodyError::LabelArityMismatch);
                    }
                    // Peek-check: pop against this target's types, then
                    // restore.
                    let saved = self.vals.clone();
                    self.pop_all(&types)?;
                    self.vals = saved;
                }
                self.pop_all(&default_types)?;
                self.mark_unreachable();
            }

            Inst::Index { op, index } => match op {
                Call | ReturnCall => {
                    let module = self.validator.module;
                    if *index as usize >= module.functions.len() {
                        return Err(BodyError::BadIndex {
                            space: "function",
                            index: *index,
                        });
                    }
                    let ft = module.func_type(FuncIdx::new(*index)).clone();
                    self.call_signature(&ft, *op == ReturnCall)?;
                }
                CallRef | ReturnCallRef => {
                    let ft = self.func_type_by_type_idx(*index)?.clone();
                    self.pop_expect(ValType::Ref(RefType {
                        nullable: true,
                        heap: HeapType::Concrete(crate::types::TypeIdx::new(*index)),
                    }))?;
                    self.call_signature(&ft, *op == ReturnCallRef)?;
                }
                LocalGet => {
                    let ty = self.local_type(*index)?;
                    if !self.local_init[*index as usize] {
                        return Err(BodyError::UninitializedLocal(*index));
                    }
                    self.push(ty);
                }
                LocalSet => {
                    let ty = self.local_type(*index)?;
                    self.pop_expect(ty)?;
                    self.mark_local_init(*index);
                }
                LocalTee => {
                    let ty = self.local_type(*index)?;
                    self.pop_expect(ty)?;
                    self.mark_local_init(*index);
                    self.push(ty);
                }
                GlobalGet => {
                    let module = self.validator.module;
                    let ty = module
                        .global_types
                        .get(*index as usize)
                        .ok_or(BodyError::BadIndex {
                            space: "global",
                            index: *index,
                        })?;
                    self.push(ty.value);
                }
                GlobalSet => {
                    let module = self.validator.module;
                    let ty = module
                        .global_types
                        .get(*index as usize)
                        .ok_or(BodyError::BadIndex {
                            space: "global",
                            index: *index,
                        })?;
                    if ty.mutability != Mutability::Var {
                        return Err(BodyError::ImmutableGlobal(*index));
                    }
                    self.pop_expect(ty.value)?;
                }
                TableGet => {
                    let element = self.table_element(*index)?;
                    let addr = self.table_addr_type(*index)?;
                    self.pop_expect(addr)?;
                    self.push(ValType::Ref(element));
                }
                TableSet => {
                    let element = self.table_element(*index)?;
                    let addr = self.table_addr_type(*index)?;
                    self.pop_expect(ValType::Ref(element))?;
                    self.pop_expect(addr)?;
                }
                RefFunc => {
                    let module = self.validator.module;
                    if *index as usize >= module.functions.len() {
                        return Err(BodyError::BadIndex {
                            space: "function",
                            index: *index,
                        });
                    }
                    if !self.validator.declared_funcs.contains(index) {
                        return Err(BodyError::BadIndex {
                            space: "declared function",
                            index: *index,
                        });
                    }
                    let ty = module.functions[*index as usize];
                    self.push(ValType::Ref(RefType {
                        nullable: false,
                        heap: HeapType::Concrete(ty),
                    }));
                }
                Throw => {
                    let params = self.tag_params(*index)?.to_vec();
                    self.pop_all(&params)?;
                    self.mark_unreachable();
                }
                _ => unreachable!(),
            },

            Inst::CallIndirect { ty, table, tail } => {
                let element = self.table_element(*table)?;
                if !self.validator.is_heap_subtype(element.heap, HeapType::Func) {
                    return Err(BodyError::NonFuncTable);
                }
                let addr = self.table_addr_type(*table)?;
                let ft = self.func_type_by_type_idx(*ty)?.clone();
                self.pop_expect(addr)?;
                self.call_signature(&ft, *tail)?;
            }

            Inst::RefNull(heap) => {
                if let HeapType::Concrete(idx) = heap
                    && **idx as usize >= self.validator.module.types.len()
                {
                    return Err(BodyError::BadIndex {
                        space: "type",
                        index: **idx,
                    });
                }
                self.push(ValType::Ref(RefType {
                    nullable: true,
                    heap: *heap,
                }));
            }

            Inst::SelectT(types) => {
                if types.len() != 1 {
                    return Err(BodyError::OperandMismatch {
                        expected: "exactly one select type",
                        found: "several",
                    });
                }
                let ty = types[0];
                self.pop_expect(I32)?;
                self.pop_expect(ty)?;
                self.pop_expect(ty)?;
                self.push(ty);
            }

            Inst::Mem { op, arg } => {
                let (width, value_ty, is_store) = mem_access_shape(*op);
                let addr_ty = self.check_mem_access(*arg, width)?;
                if is_store {
                    self.pop_expect(value_ty)?;
                    self.pop_expect(addr_ty)?;
                } else {
                    self.pop_expect(addr_ty)?;
                    self.push(value_ty);
                }
            }

            Inst::MemorySize { memory } => {
                let addr_ty = self.memory_addr_type(*memory)?;
                self.push(addr_ty);
            }
            Inst::MemoryGrow { memory } => {
                let addr_ty = self.memory_addr_type(*memory)?;
                self.pop_expect(addr_ty)?;
                self.push(addr_ty);
            }

            Inst::I32Const(_) => self.push(I32),
            Inst::I64Const(_) => self.push(I64),
            Inst::F32Const(_) => self.push(F32),
            Inst::F64Const(_) => self.push(F64),

            Inst::Misc { op, a, b } => self.step_misc(*op, *a, *b)?,
            Inst::Gc { op, a, b } => self.step_gc(*op, *a, *b)?,
            Inst::GcTest { op, heap } => {
                if let HeapType::Concrete(idx) = heap
                    && **idx as usize >= self.validator.module.types.len()
                {
                    return Err(BodyError::BadIndex {
                        space: "type",
                        index: **idx,
                    });
                }
                let operand = self.pop_ref()?;
                if let Some(rt) = operand
                    && !same_hierarchy(rt.heap, *heap)
                {
                    return Err(BodyError::IncompatibleCast);
                }
                match op {
                    GcOpcode::RefTest | GcOpcode::RefTestNull => self.push(I32),
                    GcOpcode::RefCast => self.push(ValType::Ref(RefType {
                        nullable: false,
                        heap: *heap,
                    })),
                    GcOpcode::RefCastNull => self.push(ValType::Ref(RefType {
                        nullable: true,
                        heap: *heap,
                    })),
                    _ => unreachable!(),
                }
            }
            Inst::GcCast {
                fail,
                label,
                from_nullable,
                from,
                to_nullable,
                to,
            } => {
                let from_rt = RefType {
                    nullable: *from_nullable,
                    heap: *from,
                };
                let to_rt = RefType {
                    nullable: *to_nullable,
                    heap: *to,
                };
                if !self.validator.is_heap_subtype(*to, *from) {
                    return Err(BodyError::IncompatibleCast);
                }
                self.pop_expect(ValType::Ref(from_rt))?;
                let types = self.label_types(*label)?;
                let Some(&ValType::Ref(last)) = types.last() else {
                    return Err(BodyError::LabelArityMismatch);
                };
                // The branched value is the cast target (or the cast
                // complement for the fail form, approximated by `from`).
                let branched = if *fail { from_rt } else { to_rt };
                if !self.validator.is_ref_subtype(branched, last) {
                    return Err(BodyError::LabelArityMismatch);
                }
                let rest = &types[..types.len() - 1];
                self.pop_all(rest)?;
                self.push_all(rest);
                let fallthrough = if *fail { to_rt } else { from_rt };
                self.push(ValType::Ref(fallthrough));
            }

            Inst::Simd { sub, imm } => self.step_simd(*sub, *imm)?,

            Inst::Atomic { class, arg } => self.step_atomic(*class, *arg)?,
            Inst::AtomicFence => {}
        }
        Ok(false)
    }

    fn table_element(&self, table: u32) -> Result<RefType, BodyError> {
        self.validator
            .module
            .tables
            .get(table as usize)
            .map(|ty| ty.element)
            .ok_or(BodyError::BadIndex {
                space: "table",
                index: table,
            })
    }

    fn step_misc(&mut self, op: MiscOpcode, a: u32, b: u32) -> Result<(), BodyError> {
        use MiscOpcode::*;
        use ValType::{F32, F64, I32, I64};

        let module = self.validator.module;
        // memory.init and data.drop require the data-count section so the
        // check can run before the data section has been seen.
        let data_bounds = |index: u32| {
            if module.data_count.is_some() && (index as usize) < module.datas.len() {
                Ok(())
            } else {
                Err(BodyError::BadIndex {
                    space: "data",
                    index,
                })
            }
        };
        let elem_bounds = |index: u32| {
            if (index as usize) < module.elements.len() {
                Ok(())
            } else {
                Err(BodyError::BadIndex {
                    space: "element",
                    index,
                })
            }
        };

        match op {
            I32TruncSatF32S | I32TruncSatF32U => self.cvt(F32, I32)?,
            I32TruncSatF64S | I32TruncSatF64U => self.cvt(F64, I32)?,
            I64TruncSatF32S | I64TruncSatF32U => self.cvt(F32, I64)?,
            I64TruncSatF64S | I64TruncSatF64U => self.cvt(F64, I64)?,
            MemoryInit => {
                data_bounds(a)?;
                let addr = self.memory_addr_type(b)?;
                self.pop_expect(I32)?;
                self.pop_expect(I32)?;
                self.pop_expect(addr)?;
            }
            DataDrop => data_bounds(a)?,
            MemoryCopy => {
                let dst = self.memory_addr_type(a)?;
                let src = self.memory_addr_type(b)?;
                // The length takes the narrower of the two address types.
                let len = if dst == I32 || src == I32 { I32 } else { I64 };
                self.pop_expect(len)?;
                self.pop_expect(src)?;
                self.pop_expect(dst)?;
            }
            MemoryFill => {
                let addr = self.memory_addr_type(a)?;
                self.pop_expect(addr)?;
                self.pop_expect(I32)?;
                self.pop_expect(addr)?;
            }
            TableInit => {
                elem_bounds(a)?;
                let element = self.table_element(b)?;
                if !self
                    .validator
                    .is_ref_subtype(module.elements[a as usize].ty, element)
                {
                    return Err(BodyError::NonFuncTable);
                }
                let addr = self.table_addr_type(b)?;
                self.pop_expect(I32)?;
                self.pop_expect(I32)?;
                self.pop_expect(addr)?;
            }
            ElemDrop => elem_bounds(a)?,
            TableCopy => {
                let dst = self.table_element(a)?;
                let src = self.table_element(b)?;
                if !self.validator.is_ref_subtype(src, dst) {
                    return Err(BodyError::NonFuncTable);
                }
                let dst_addr = self.table_addr_type(a)?;
                let src_addr = self.table_addr_type(b)?;
                let len = if dst_addr == I32 || src_addr == I32 {
                    I32
                } else {
                    I64
                };
                self.pop_expect(len)?;
                self.pop_expect(src_addr)?;
                self.pop_expect(dst_addr)?;
            }
            TableGrow => {
                let element = self.table_element(a)?;
                let addr = self.table_addr_type(a)?;
                self.pop_expect(addr)?;
                self.pop_expect(ValType::Ref(element))?;
                self.push(addr);
            }
            TableSize => {
                let addr = self.table_addr_type(a)?;
                self.push(addr);
            }
            TableFill => {
                let element = self.table_element(a)?;
                let addr = self.table_addr_type(a)?;
                self.pop_expect(addr)?;
                self.pop_expect(ValType::Ref(element))?;
                self.pop_expect(addr)?;
            }
        }
        Ok(())
    }

    fn struct_fields(&self, type_idx: u32) -> Result<&'module [FieldType], BodyError> {
        match self
            .validator
            .module
            .types
            .get(type_idx as usize)
            .map(|sub| &sub.composite)
        {
            Some(CompositeType::Struct(fields)) => Ok(fields),
            Some(_) => Err(BodyError::WrongComposite),
            None => Err(BodyError::BadIndex {
                space: "type",
                index: type_idx,
            }),
        }
    }

    fn array_field(&self, type_idx: u32) -> Result<FieldType, BodyError> {
        match self
            .validator
            .module
            .types
            .get(type_idx as usize)
            .map(|sub| &sub.composite)
        {
            Some(CompositeType::Array(field)) => Ok(*field),
            Some(_) => Err(BodyError::WrongComposite),
            None => Err(BodyError::BadIndex {
                space: "type",
                index: type_idx,
            }),
        }
    }

    fn concrete_ref(&self, type_idx: u32, nullable: bool) -> ValType {
        ValType::Ref(RefType {
            nullable,
            heap: HeapType::Concrete(crate::types::TypeIdx::new(type_idx)),
        })
    }

    fn step_gc(&mut self, op: GcOpcode, a: u32, b: u32) -> Result<(), BodyError> {
        use GcOpcode::*;
        use ValType::I32;

        match op {
            StructNew => {
                let fields = self.struct_fields(a)?.to_vec();
                for field in fields.iter().rev() {
                    self.pop_expect(field.storage.unpacked())?;
                }
                let ty = self.concrete_ref(a, false);
                self.push(ty);
            }
            StructNewDefault => {
                let fields = self.struct_fields(a)?;
                if !fields.iter().all(|f| f.storage.unpacked().is_defaultable()) {
                    return Err(BodyError::OperandMismatch {
                        expected: "defaultable fields",
                        found: "a non-defaultable field",
                    });
                }
                let ty = self.concrete_ref(a, false);
                self.push(ty);
            }
            StructGet | StructGetS | StructGetU => {
                let fields = self.struct_fields(a)?;
                let field = *fields.get(b as usize).ok_or(BodyError::BadField { field: b })?;
                let packed = matches!(field.storage, StorageType::I8 | StorageType::I16);
                if packed != (op != StructGet) {
                    return Err(BodyError::PackedAccess);
                }
                let operand = self.concrete_ref(a, true);
                self.pop_expect(operand)?;
                self.push(field.storage.unpacked());
            }
            StructSet => {
                let fields = self.struct_fields(a)?;
                let field = *fields.get(b as usize).ok_or(BodyError::BadField { field: b })?;
                if !field.mutable {
                    return Err(BodyError::BadField { field: b });
                }
                self.pop_expect(field.storage.unpacked())?;
                let operand = self.concrete_ref(a, true);
                self.pop_expect(operand)?;
            }
            ArrayNew => {
                let field = self.array_field(a)?;
                self.pop_expect(I32)?;
                self.pop_expect(field.storage.unpacked())?;
                let ty = self.concrete_ref(a, false);
                self.push(ty);
            }
            ArrayNewDefault => {
                let field = self.array_field(a)?;
                if !field.storage.unpacked().is_defaultable() {
                    return Err(BodyError::OperandMismatch {
                        expected: "a defaultable element",
                        found: "a non-defaultable element",
                    });
                }
                self.pop_expect(I32)?;
                let ty = self.concrete_ref(a, false);
                self.push(ty);
            }
            ArrayNewFixed => {
                let field = self.array_field(a)?;
                for _ in 0..b {
                    self.pop_expect(field.storage.unpacked())?;
                }
                let ty = self.concrete_ref(a, false);
                self.push(ty);
            }
            ArrayNewData | ArrayNewElem => {
                self.array_field(a)?;
                self.pop_expect(I32)?;
                self.pop_expect(I32)?;
                let ty = self.concrete_ref(a, false);
                self.push(ty);
            }
            ArrayGet | ArrayGetS | ArrayGetU => {
                let field = self.array_field(a)?;
                let packed = matches!(field.storage, StorageType::I8 | StorageType::I16);
                if packed != (op != ArrayGet) {
                    return Err(BodyError::PackedAccess);
                }
                self.pop_expect(I32)?;
                let operand = self.concrete_ref(a, true);
                self.pop_expect(operand)?;
                self.push(field.storage.unpacked());
            }
            ArraySet => {
                let field = self.array_field(a)?;
                if !field.mutable {
                    return Err(BodyError::BadField { field: 0 });
                }
                self.pop_expect(field.storage.unpacked())?;
                self.pop_expect(I32)?;
                let operand = self.concrete_ref(a, true);
                self.pop_expect(operand)?;
            }
            ArrayLen => {
                self.pop_expect(ValType::Ref(RefType {
                    nullable: true,
                    heap: HeapType::Array,
                }))?;
                self.push(I32);
            }
            ArrayFill => {
                let field = self.array_field(a)?;
                if !field.mutable {
                    return Err(BodyError::BadField { field: 0 });
                }
                self.pop_expect(I32)?;
                self.pop_expect(field.storage.unpacked())?;
                self.pop_expect(I32)?;
                let operand = self.concrete_ref(a, true);
                self.pop_expect(operand)?;
            }
            ArrayCopy => {
                let dst = self.array_field(a)?;
                let src = self.array_field(b)?;
                if !dst.mutable {
                    return Err(BodyError::BadField { field: 0 });
                }
                if !self
                    .validator
                    .is_val_subtype(src.storage.unpacked(), dst.storage.unpacked())
                {
                    return Err(BodyError::IncompatibleCast);
                }
                self.pop_expect(I32)?;
                self.pop_expect(I32)?;
                let src_ref = self.concrete_ref(b, true);
                self.pop_expect(src_ref)?;
                self.pop_expect(I32)?;
                let dst_ref = self.concrete_ref(a, true);
                self.pop_expect(dst_ref)?;
            }
            ArrayInitData | ArrayInitElem => {
                let field = self.array_field(a)?;
                if !field.mutable {
                    return Err(BodyError::BadField { field: 0 });
                }
                self.pop_expect(I32)?;
                self.pop_expect(I32)?;
                self.pop_expect(I32)?;
                let operand = self.concrete_ref(a, true);
                self.pop_expect(operand)?;
            }
            AnyConvertExtern => {
                let rt = self.pop_ref()?;
                let nullable = rt.is_none_or(|rt| rt.nullable);
                self.push(ValType::Ref(RefType {
                    nullable,
                    heap: HeapType::Any,
                }));
            }
            ExternConvertAny => {
                let rt = self.pop_ref()?;
                let nullable = rt.is_none_or(|rt| rt.nullable);
                self.push(ValType::Ref(RefType {
                    nullable,
                    heap: HeapType::Extern,
                }));
            }
            RefI31 => {
                self.pop_expect(I32)?;
                self.push(ValType::Ref(RefType {
                    nullable: false,
                    heap: HeapType::I31,
                }));
            }
            I31GetS | I31GetU => {
                self.pop_expect(ValType::Ref(RefType {
                    nullable: true,
                    heap: HeapType::I31,
                }))?;
                self.push(I32);
            }
            RefTest | RefTestNull | RefCast | RefCastNull | BrOnCast | BrOnCastFail => {
                unreachable!("decoded as dedicated variants")
            }
        }
        Ok(())
    }

    fn step_simd(&mut self, sub: u32, imm: SimdImm) -> Result<(), BodyError> {
        use ValType::{I32, V128};

        // Lane-indexed immediates are bounds-checked against their shape.
        if let SimdImm::Lane(lane) = imm {
            let lanes: u8 = match sub {
                0x15..=0x17 => 16,
                0x18..=0x1a => 8,
                0x1b | 0x1c | 0x1f | 0x20 => 4,
                0x1d | 0x1e | 0x21 | 0x22 => 2,
                _ => 16,
            };
            if lane >= lanes {
                return Err(BodyError::BadIndex {
                    space: "lane",
                    index: u32::from(lane),
                });
            }
        }

        match simd_shape(sub).ok_or(BodyError::UnknownSimdOpcode(sub))? {
            SimdShape::Load => {
                let SimdImm::Mem(arg) = imm else {
                    return Err(BodyError::UnknownSimdOpcode(sub));
                };
                let addr = self.check_mem_access(arg, 16)?;
                self.pop_expect(addr)?;
                self.push(V128);
            }
            SimdShape::Store => {
                let SimdImm::Mem(arg) = imm else {
                    return Err(BodyError::UnknownSimdOpcode(sub));
                };
                let addr = self.check_mem_access(arg, 16)?;
                self.pop_expect(V128)?;
                self.pop_expect(addr)?;
            }
            SimdShape::LoadLane => {
                let SimdImm::MemLane(arg, _) = imm else {
                    return Err(BodyError::UnknownSimdOpcode(sub));
                };
                let addr = self.check_mem_access(arg, 16)?;
                self.pop_expect(V128)?;
                self.pop_expect(addr)?;
                self.push(V128);
            }
            SimdShape::StoreLane => {
                let SimdImm::MemLane(arg, _) = imm else {
                    return Err(BodyError::UnknownSimdOpcode(sub));
                };
                let addr = self.check_mem_access(arg, 16)?;
                self.pop_expect(V128)?;
                self.pop_expect(addr)?;
            }
            SimdShape::Const => self.push(V128),
            SimdShape::Unop => self.unop(V128)?,
            SimdShape::Binop => self.binop(V128)?,
            SimdShape::Ternop => {
                self.pop_expect(V128)?;
                self.pop_expect(V128)?;
                self.pop_expect(V128)?;
                self.push(V128);
            }
            SimdShape::Shift => {
                self.pop_expect(I32)?;
                self.pop_expect(V128)?;
                self.push(V128);
            }
            SimdShape::Splat(ty) => self.cvt(ty, V128)?,
            SimdShape::Extract(ty) => self.cvt(V128, ty)?,
            SimdShape::Replace(ty) => {
                self.pop_expect(ty)?;
                self.pop_expect(V128)?;
                self.push(V128);
            }
            SimdShape::ToI32 => self.cvt(V128, I32)?,
        }
        Ok(())
    }

    fn step_atomic(&mut self, class: AtomicClass, arg: MemArg) -> Result<(), BodyError> {
        use ValType::{I32, I64};

        let (width, value_ty) = match class {
            AtomicClass::Sync(AtomicOpcode::MemoryAtomicNotify) => (4, I32),
            AtomicClass::Sync(AtomicOpcode::MemoryAtomicWait32) => (4, I32),
            AtomicClass::Sync(AtomicOpcode::MemoryAtomicWait64) => (8, I64),
            AtomicClass::Sync(AtomicOpcode::AtomicFence) => unreachable!(),
            AtomicClass::Load { is_64, width }
            | AtomicClass::Store { is_64, width }
            | AtomicClass::Rmw { is_64, width, .. }
            | AtomicClass::Cmpxchg { is_64, width } => {
                (u32::from(width), if is_64 { I64 } else { I32 })
            }
        };
        // Atomic accesses require exact natural alignment.
        let addr_ty = self.memory_addr_type(arg.memory)?;
        if (1u64 << arg.align) != u64::from(width) {
            return Err(BodyError::AlignTooLarge { align: arg.align });
        }

        match class {
            AtomicClass::Sync(AtomicOpcode::MemoryAtomicNotify) => {
                self.pop_expect(I32)?;
                self.pop_expect(addr_ty)?;
                self.push(I32);
            }
            AtomicClass::Sync(op) => {
                // wait32 / wait64: [addr, expected, timeout(i64)] -> [i32].
                self.pop_expect(I64)?;
                self.pop_expect(if op == AtomicOpcode::MemoryAtomicWait64 {
                    I64
                } else {
                    I32
                })?;
                self.pop_expect(addr_ty)?;
                self.push(I32);
            }
            AtomicClass::Load { .. } => {
                self.pop_expect(addr_ty)?;
                self.push(value_ty);
            }
            AtomicClass::Store { .. } => {
                self.pop_expect(value_ty)?;
                self.pop_expect(addr_ty)?;
            }
            AtomicClass::Rmw { .. } => {
                self.pop_expect(value_ty)?;
                self.pop_expect(addr_ty)?;
                self.push(value_ty);
            }
            AtomicClass::Cmpxchg { .. } => {
                self.pop_expect(value_ty)?;
                self.pop_expect(value_ty)?;
                self.pop_expect(addr_ty)?;
                self.push(value_ty);
            }
        }
        Ok(())
    }
}

// Whether two heap types live in the same hierarchy (a cast between them is
// at least well-formed).
fn same_hierarchy(a: HeapType, b: HeapType) -> bool {
    use HeapType::*;
    let rank = |h: HeapType| match h {
        Func | NoFunc => 0,
        Extern | NoExtern => 1,
        Exn | NoExn => 2,
        Concrete(_) => 3,
        _ => 3,
    };
    // Concrete types may sit under func or any; be permissive there.
    matches!((a, b), (Concrete(_), _) | (_, Concrete(_))) || rank(a) == rank(b)
}

// The access width in bytes, the value type, and the store-ness of a plain
// memory instruction.
fn mem_access_shape(op: Opcode) -> (u32, ValType, bool) {
    use Opcode::*;
    use ValType::{F32, F64, I32, I64};
    match op {
        I32Load => (4, I32, false),
        I64Load => (8, I64, false),
        F32Load => (4, F32, false),
        F64Load => (8, F64, false),
        I32Load8S | I32Load8U => (1, I32, false),
        I32Load16S | I32Load16U => (2, I32, false),
        I64Load8S | I64Load8U => (1, I64, false),
        I64Load16S | I64Load16U => (2, I64, false),
        I64Load32S | I64Load32U => (4, I64, false),
        I32Store => (4, I32, true),
        I64Store => (8, I64, true),
        F32Store => (4, F32, true),
        F64Store => (8, F64, true),
        I32Store8 => (1, I32, true),
        I32Store16 => (2, I32, true),
        I64Store8 => (1, I64, true),
        I64Store16 => (2, I64, true),
        I64Store32 => (4, I64, true),
        _ => unreachable!("not a memory access: {op:?}"),
    }
}

enum SimdShape {
    Load,
    Store,
    LoadLane,
    StoreLane,
    Const,
    Unop,
    Binop,
    Ternop,
    Shift,
    Splat(ValType),
    Extract(ValType),
    Replace(ValType),
    ToI32,
}

// Coarse structural classification of the vector opcode space. Precise
// per-lane semantics live with execution; validation only needs stack
// shapes. Unassigned sub-opcodes return None.
fn simd_shape(sub: u32) -> Option<SimdShape> {
    use SimdShape::*;
    use ValType::{F32, F64, I32, I64};
    Some(match sub {
        0x00..=0x0a => Load,
        0x0b => Store,
        0x0c => Const,
        0x0d | 0x0e => Binop, // shuffle, swizzle
        0x0f..=0x11 => Splat(I32),
        0x12 => Splat(I64),
        0x13 => Splat(F32),
        0x14 => Splat(F64),
        0x15 | 0x16 | 0x18 | 0x19 | 0x1b => Extract(I32),
        0x17 | 0x1a | 0x1c => Replace(I32),
        0x1d => Extract(I64),
        0x1e => Replace(I64),
        0x1f => Extract(F32),
        0x20 => Replace(F32),
        0x21 => Extract(F64),
        0x22 => Replace(F64),
        0x23..=0x4c => Binop, // comparisons
        0x4d => Unop,         // v128.not
        0x4e..=0x51 => Binop, // and/andnot/or/xor
        0x52 => Ternop,       // bitselect
        0x53 => ToI32,        // v128.any_true
        0x54..=0x57 => LoadLane,
        0x58..=0x5b => StoreLane,
        0x5c | 0x5d => Load, // load32_zero / load64_zero
        0x5e | 0x5f => Unop, // demote/promote
        0x60..=0x62 => Unop, // i8x16 abs/neg/popcnt
        0x63 | 0x64 => ToI32,
        0x65 | 0x66 => Binop, // narrow
        0x67..=0x6a => Unop,  // f32x4 rounding
        0x6b..=0x6d => Shift,
        0x6e..=0x73 => Binop, // i8x16 add/sub saturating
        0x74 | 0x75 | 0x7a => Unop, // f64x2 rounding
        0x76..=0x79 => Binop, // i8x16 min/max
        0x7b => Binop,        // avgr_u
        0x7c..=0x7f => Unop,  // extadd_pairwise
        0x80 | 0x81 => Unop,  // i16x8 abs/neg
        0x82 => Binop,        // q15mulr_sat_s
        0x83 | 0x84 => ToI32,
        0x85 | 0x86 => Binop, // narrow
        0x87..=0x8a => Unop,  // extend
        0x8b..=0x8d => Shift,
        0x8e..=0x93 => Binop,
        0x94 => Unop, // f64x2.nearest
        0x95..=0x9b => Binop,
        0x9c..=0x9f => Binop, // extmul
        0xa0 | 0xa1 => Unop,  // i32x4 abs/neg
        0xa3 | 0xa4 => ToI32,
        0xa7..=0xaa => Unop, // extend
        0xab..=0xad => Shift,
        0xae..=0xb3 => Binop,
        0xb5..=0xba => Binop,
        0xbc..=0xbf => Binop, // extmul
        0xc0 | 0xc1 => Unop,  // i64x2 abs/neg
        0xc3 | 0xc4 => ToI32,
        0xc7..=0xca => Unop, // extend
        0xcb..=0xcd => Shift,
        0xce..=0xd5 => Binop,
        0xd6..=0xdb => Binop, // i64x2 comparisons
        0xdc..=0xdf => Binop, // extmul
        0xe0 | 0xe1 | 0xe3 => Unop, // f32x4 abs/neg/sqrt
        0xe2 => Unop,
        0xe4..=0xeb => Binop, // f32x4 arithmetic
        0xec | 0xed | 0xef => Unop, // f64x2 abs/neg/sqrt
        0xee => Unop,
        0xf0..=0xf7 => Binop, // f64x2 arithmetic
        0xf8..=0xff => Unop,  // conversions
        // Relaxed SIMD: swizzle/min/max/q15mulr/dot are binary; the fused
        // multiply-adds and laneselects are ternary; truncations are unary.
        0x100 => Binop,
        0x101..=0x104 => Unop,
        0x105..=0x108 => Ternop,
        0x109..=0x10c => Ternop,
        0x10d..=0x110 => Binop,
        0x111 | 0x112 => Binop,
        0x113 => Ternop,
        _ => return None,
    })
}

fn type_name(ty: ValType) -> &'static str {
    match ty {
        ValType::I32 => "i32",
        ValType::I64 => "i64",
        ValType::F32 => "f32",
        ValType::F64 => "f64",
        ValType::V128 => "v128",
        ValType::Ref(RefType {
            heap: HeapType::Func,
            ..
        }) => "funcref",
        ValType::Ref(RefType {
            heap: HeapType::Extern,
            ..
        }) => "externref",
        ValType::Ref(RefType {
            heap: HeapType::Exn,
            ..
        }) => "exnref",
        ValType::Ref(_) => "a reference",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CompositeType, ModuleInner, SubType, TypeIdx};

    fn module_with_sig(params: Vec<ValType>, results: Vec<ValType>) -> ModuleInner {
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

    fn check(module: &ModuleInner, body: &[u8]) -> Result<(), ValidateError> {
        let validator = Validator {
            module,
            declared_funcs: Default::default(),
        };
        let body = FuncBody {
            locals: Vec::new(),
            bytecode: body.into(),
            offset: 0,
        };
        validate_function_body(&validator, FuncIdx::new(0), &body)
    }

    #[test]
    fn accepts_add_one() {
        let module = module_with_sig(vec![ValType::I32], vec![ValType::I32]);
        // local.get 0; i32.const 1; i32.add; end
        check(&module, &[0x20, 0x00, 0x41, 0x01, 0x6a, 0x0b]).unwrap();
    }

    #[test]
    fn rejects_operand_type_mismatch() {
        let module = module_with_sig(vec![ValType::I64], vec![ValType::I32]);
        // local.get 0 (i64); i32.const 1; i32.add -> mismatch at offset 4
        let err = check(&module, &[0x20, 0x00, 0x41, 0x01, 0x6a, 0x0b]).unwrap_err();
        let ValidateError::FunctionBody { offset, kind, .. } = err else {
            panic!("unexpected error shape");
        };
        assert_eq!(offset, 4);
        assert!(matches!(kind, BodyError::OperandMismatch { .. }));
    }

    #[test]
    fn rejects_stack_underflow() {
        let module = module_with_sig(vec![], vec![ValType::I32]);
        // i32.add with an empty stack.
        let err = check(&module, &[0x6a, 0x0b]).unwrap_err();
        assert!(matches!(
            err,
            ValidateError::FunctionBody {
                kind: BodyError::StackUnderflow,
                ..
            }
        ));
    }

    #[test]
    fn unreachable_makes_operands_polymorphic() {
        let module = module_with_sig(vec![], vec![ValType::I32]);
        // unreachable; i32.add; end — the add type-checks against bottom.
        check(&module, &[0x00, 0x6a, 0x0b]).unwrap();
    }

    #[test]
    fn rejects_branch_to_missing_label() {
        let module = module_with_sig(vec![], vec![]);
        // br 5; end
        let err = check(&module, &[0x0c, 0x05, 0x0b]).unwrap_err();
        assert!(matches!(
            err,
            ValidateError::FunctionBody {
                kind: BodyError::BadLabel(5),
                ..
            }
        ));
    }

    #[test]
    fn if_without_else_must_be_identity() {
        let module = module_with_sig(vec![ValType::I32], vec![ValType::I32]);
        // local.get 0; if (result i32); i32.const 1; end — missing else.
        let err = check(&module, &[0x20, 0x00, 0x04, 0x7f, 0x41, 0x01, 0x0b, 0x0b]).unwrap_err();
        assert!(matches!(
            err,
            ValidateError::FunctionBody {
                kind: BodyError::LabelArityMismatch,
                ..
            }
        ));
    }

    #[test]
    fn block_results_flow_out() {
        let module = module_with_sig(vec![], vec![ValType::I32]);
        // block (result i32); i32.const 7; end; end
        check(&module, &[0x02, 0x7f, 0x41, 0x07, 0x0b, 0x0b]).unwrap();
    }

    #[test]
    fn loop_label_takes_params() {
        let module = module_with_sig(vec![], vec![]);
        // loop; br 0 would be an infinite loop: validates fine.
        check(&module, &[0x03, 0x40, 0x0c, 0x00, 0x0b, 0x0b]).unwrap();
    }

    #[test]
    fn rejects_write_to_immutable_global() {
        let mut module = module_with_sig(vec![], vec![]);
        module.global_types.push(crate::types::GlobalType {
            value: ValType::I32,
            mutability: Mutability::Const,
        });
        // i32.const 1; global.set 0
        let err = check(&module, &[0x41, 0x01, 0x24, 0x00, 0x0b]).unwrap_err();
        assert!(matches!(
            err,
            ValidateError::FunctionBody {
                kind: BodyError::ImmutableGlobal(0),
                ..
            }
        ));
    }

    #[test]
    fn missing_end_is_reported() {
        let module = module_with_sig(vec![], vec![]);
        let err = check(&module, &[0x01]).unwrap_err(); // nop, no end
        assert!(matches!(
            err,
            ValidateError::FunctionBody {
                kind: BodyError::MissingEnd,
                ..
            }
        ));
    }
}
