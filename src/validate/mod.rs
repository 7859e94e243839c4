// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Module validation.
//!
//! Structurally verifies every section and type-checks every function body
//! and constant expression. A module that passes validation can be executed
//! without dynamic stack-shape checks: operand-stack heights at control-flow
//! joins are static facts established here.

mod func;

use std::collections::HashSet;

use thiserror::Error;
use tracing::debug;

use crate::decode::DecodeError;
use crate::decode::body::{Inst, InstDecoder};
use crate::types::{
    CompositeType, ConstExpr, ElementInit, ElementMode, ExportDescriptor, FuncIdx, GlobalIdx,
    HeapType, ImportDescriptor, Limits, MemoryType, ModuleInner, Mutability, Opcode, RefType,
    SubType, TypeIdx, ValType,
};

pub(crate) use func::validate_function_body;

/// The deepest allowed nesting of blocks within one function body.
pub const MAX_BLOCK_NESTING: usize = 500;

/// Represents errors that can arise during module validation.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ValidateError {
    #[error("{space} index {index} out of bounds (capacity {capacity})")]
    IndexOutOfBounds {
        space: &'static str,
        index: u32,
        capacity: u32,
    },
    #[error("duplicate export name {0:?}")]
    DuplicateExportName(String),
    #[error("data count section says {expected}; data section has {actual}")]
    DataCountMismatch { expected: usize, actual: usize },
    #[error("start function must be [] -> []")]
    InvalidStartFunction,
    #[error("invalid limits: min {min} exceeds max {max}")]
    InvalidLimits { min: u64, max: u64 },
    #[error("memory too large: {pages} pages over a {max} page ceiling")]
    MemoryTooLarge { pages: u64, max: u64 },
    #[error("shared memory requires a max")]
    SharedMemoryNeedsMax,
    #[error("tag type must have empty results")]
    InvalidTagType,
    #[error("supertype {super_idx} is final or incompatible with type {sub_idx}")]
    InvalidSupertype { sub_idx: u32, super_idx: u32 },
    #[error("element segment type mismatch")]
    ElementTypeMismatch,
    #[error("constant expression is malformed or uses a non-constant operand")]
    InvalidConstExpr,
    #[error("constant expression yields {found:?}; expected {expected:?}")]
    ConstExprTypeMismatch { expected: ValType, found: ValType },
    #[error("undeclared function reference {0}")]
    UndeclaredFuncRef(u32),
    #[error("in function {func} at {offset:#x}: {kind}")]
    FunctionBody {
        func: u32,
        offset: usize,
        kind: BodyError,
    },
}

/// A type-checking offense inside one function body, reported with the
/// first offending PC.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum BodyError {
    #[error("malformed body: {0}")]
    Decode(DecodeError),
    #[error("operand type mismatch: expected {expected}, found {found}")]
    OperandMismatch {
        expected: &'static str,
        found: &'static str,
    },
    #[error("operand stack underflow")]
    StackUnderflow,
    #[error("branch to non-existent label {0}")]
    BadLabel(u32),
    #[error("branch label shapes disagree")]
    LabelArityMismatch,
    #[error("{space} index {index} out of bounds")]
    BadIndex { space: &'static str, index: u32 },
    #[error("assignment to immutable global {0}")]
    ImmutableGlobal(u32),
    #[error("read of uninitialized non-defaultable local {0}")]
    UninitializedLocal(u32),
    #[error("alignment 2^{align} exceeds the access width")]
    AlignTooLarge { align: u32 },
    #[error("block nesting exceeds {MAX_BLOCK_NESTING}")]
    NestingTooDeep,
    #[error("values remain on the stack at block end")]
    UnbalancedStack,
    #[error("else without if")]
    ElseWithoutIf,
    #[error("missing end terminator")]
    MissingEnd,
    #[error("trailing bytes after function end")]
    TrailingCode,
    #[error("call_indirect type {0} is not a function type")]
    NotAFunctionType(u32),
    #[error("tail-callee results do not match the caller's results")]
    TailCalleeMismatch,
    #[error("unknown or unassigned vector opcode {0:#x}")]
    UnknownSimdOpcode(u32),
    #[error("reference-cast target incompatible with operand")]
    IncompatibleCast,
    #[error("table element type is not a function reference")]
    NonFuncTable,
    #[error("expected a struct/array type, found another composite")]
    WrongComposite,
    #[error("field {field} out of bounds or immutable")]
    BadField { field: u32 },
    #[error("packed field requires the _s/_u access form")]
    PackedAccess,
}

pub(crate) struct Validator<'module> {
    pub(crate) module: &'module ModuleInner,
    /// Functions that may be referenced by `ref.func` in code: those
    /// mentioned by exports, globals' initializers, or element segments.
    pub(crate) declared_funcs: HashSet<u32>,
}

impl<'module> Validator<'module> {
    fn new(module: &'module ModuleInner) -> Self {
        Self {
            module,
            declared_funcs: HashSet::new(),
        }
    }

    pub(crate) fn check_type_idx(&self, index: u32) -> Result<TypeIdx, ValidateError> {
        bounds("type", index, self.module.types.len())?;
        Ok(TypeIdx::new(index))
    }

    pub(crate) fn func_type_at(&self, index: u32) -> Result<&'module SubType, ValidateError> {
        let idx = self.check_type_idx(index)?;
        Ok(&self.module.types[usize::from(idx)])
    }

    /// Whether `a` is a subtype of `b` under the module's declared and
    /// structural subtyping.
    pub(crate) fn is_val_subtype(&self, a: ValType, b: ValType) -> bool {
        match (a, b) {
            (ValType::Ref(ra), ValType::Ref(rb)) => self.is_ref_subtype(ra, rb),
            _ => a == b,
        }
    }

    pub(crate) fn is_ref_subtype(&self, a: RefType, b: RefType) -> bool {
        (b.nullable || !a.nullable) && self.is_heap_subtype(a.heap, b.heap)
    }

    pub(crate) fn is_heap_subtype(&self, a: HeapType, b: HeapType) -> bool {
        use HeapType::*;
        if a == b {
            return true;
        }
        match (a, b) {
            // Bottom types are subtypes of everything in their hierarchy.
            (None, Any | Eq | I31 | Struct | Array | Concrete(_)) => {
                !matches!(b, Concrete(idx) if self.composite_kind(idx) == CompositeKind::Func)
            }
            (NoFunc, Func | Concrete(_)) => {
                !matches!(b, Concrete(idx) if self.composite_kind(idx) != CompositeKind::Func)
            }
            (NoExtern, Extern) => true,
            (NoExn, Exn) => true,
            // The internal hierarchy under any.
            (Eq | I31 | Struct | Array, Any) => true,
            (I31 | Struct | Array, Eq) => true,
            (Concrete(idx), Any | Eq) => self.composite_kind(idx) != CompositeKind::Func,
            (Concrete(idx), Struct) => self.composite_kind(idx) == CompositeKind::Struct,
            (Concrete(idx), Array) => self.composite_kind(idx) == CompositeKind::Array,
            (Concrete(idx), Func) => self.composite_kind(idx) == CompositeKind::Func,
            (Concrete(a_idx), Concrete(b_idx)) => self.is_concrete_subtype(a_idx, b_idx),
            _ => false,
        }
    }

    fn is_concrete_subtype(&self, a: TypeIdx, b: TypeIdx) -> bool {
        if self.module.types_match(a, b) {
            return true;
        }
        // Walk the declared supertype chain upward from `a`.
        let mut current = a;
        loop {
            let sub = &self.module.types[usize::from(current)];
            let Some(&next) = sub.supertypes.first() else {
                return false;
            };
            if self.module.types_match(next, b) {
                return true;
            }
            current = next;
        }
    }

    fn composite_kind(&self, idx: TypeIdx) -> CompositeKind {
        match &self.module.types[usize::from(idx)].composite {
            CompositeType::Func(_) => CompositeKind::Func,
            CompositeType::Struct(_) => CompositeKind::Struct,
            CompositeType::Array(_) => CompositeKind::Array,
        }
    }
}

#[derive(Clone, Copy, Eq, PartialEq)]
enum CompositeKind {
    Func,
    Struct,
    Array,
}

fn bounds(space: &'static str, index: u32, capacity: usize) -> Result<(), ValidateError> {
    if (index as usize) < capacity {
        Ok(())
    } else {
        Err(ValidateError::IndexOutOfBounds {
            space,
            index,
            capacity: capacity as u32,
        })
    }
}

/// Validates a decoded module. On success the module's every body and
/// constant expression is safe to lower and execute.
pub(crate) fn validate_module(module: &ModuleInner) -> Result<(), ValidateError> {
    let mut validator = Validator::new(module);

    validate_types(&validator)?;
    validate_imports(&validator)?;

    for &type_idx in &module.functions {
        let sub = validator.func_type_at(*type_idx)?;
        if sub.as_func().is_none() {
            return Err(ValidateError::IndexOutOfBounds {
                space: "function type",
                index: *type_idx,
                capacity: module.types.len() as u32,
            });
        }
    }

    for table in &module.tables {
        validate_limits(&table.limits)?;
        validate_ref_type_indices(&validator, table.element)?;
    }
    for memory in &module.memories {
        validate_memory_type(memory)?;
    }
    for tag in &module.tags {
        let sub = validator.func_type_at(*tag.ty)?;
        match sub.as_func() {
            Some(ft) if ft.results.is_empty() => {}
            _ => return Err(ValidateError::InvalidTagType),
        }
    }

    // Exports: every name unique, every index in range. Functions named by
    // exports become declared for ref.func purposes.
    let mut export_names = HashSet::new();
    for export in &module.exports {
        if !export_names.insert(export.field.as_ref()) {
            return Err(ValidateError::DuplicateExportName(export.field.to_string()));
        }
        match export.descriptor {
            ExportDescriptor::Function(idx) => {
                bounds("function", *idx, module.functions.len())?;
                validator.declared_funcs.insert(*idx);
            }
            ExportDescriptor::Table(idx) => bounds("table", *idx, module.tables.len())?,
            ExportDescriptor::Memory(idx) => bounds("memory", *idx, module.memories.len())?,
            ExportDescriptor::Global(idx) => bounds("global", *idx, module.global_types.len())?,
            ExportDescriptor::Tag(idx) => bounds("tag", *idx, module.tags.len())?,
        }
    }

    // Element segments come before globals/code so that the declared-funcs
    // set is complete before ref.func appears in an initializer or body.
    for segment in &module.elements {
        match &segment.init {
            ElementInit::FunctionIndices(indices) => {
                for &idx in indices {
                    bounds("function", *idx, module.functions.len())?;
                    validator.declared_funcs.insert(*idx);
                }
            }
            ElementInit::Expressions(exprs) => {
                for expr in exprs {
                    declare_const_expr_funcs(&mut validator, expr)?;
                }
            }
        }
        if let ElementMode::Active { offset, .. } = &segment.mode {
            declare_const_expr_funcs(&mut validator, offset)?;
        }
    }
    for global in &module.globals {
        declare_const_expr_funcs(&mut validator, &global.init)?;
    }

    for segment in &module.elements {
        match &segment.init {
            ElementInit::FunctionIndices(_) => {
                // funcref only; any table of funcref element type accepts it.
                if !validator.is_ref_subtype(RefType::FUNCREF, segment.ty)
                    && segment.ty != RefType::FUNCREF
                {
                    return Err(ValidateError::ElementTypeMismatch);
                }
            }
            ElementInit::Expressions(exprs) => {
                for expr in exprs {
                    validate_const_expr(&validator, expr, ValType::Ref(segment.ty))?;
                }
            }
        }
        if let ElementMode::Active { table, offset } = &segment.mode {
            bounds("table", **table, module.tables.len())?;
            let table_ty = module.table_type(*table);
            if !validator.is_ref_subtype(segment.ty, table_ty.element) {
                return Err(ValidateError::ElementTypeMismatch);
            }
            let addr_ty = if table_ty.table64 {
                ValType::I64
            } else {
                ValType::I32
            };
            validate_const_expr(&validator, offset, addr_ty)?;
        }
    }

    for (i, global) in module.globals.iter().enumerate() {
        // A global initializer may read only globals defined earlier
        // (imports, in this implementation, plus preceding definitions).
        let visible = module.num_imported_globals + i;
        validate_const_expr_with_global_limit(&validator, &global.init, global.ty.value, visible)?;
    }

    for (i, init) in module.table_inits.iter().enumerate() {
        if let Some(init) = init {
            let ty = module.tables[module.num_imported_tables + i];
            validate_const_expr(&validator, init, ValType::Ref(ty.element))?;
        }
    }

    for segment in &module.datas {
        if let crate::types::DataMode::Active { memory, offset } = &segment.mode {
            bounds("memory", **memory, module.memories.len())?;
            let addr_ty = if module.memory_type(*memory).memory64 {
                ValType::I64
            } else {
                ValType::I32
            };
            validate_const_expr(&validator, offset, addr_ty)?;
        }
    }

    if let Some(count) = module.data_count
        && count as usize != module.datas.len()
    {
        return Err(ValidateError::DataCountMismatch {
            expected: count as usize,
            actual: module.datas.len(),
        });
    }

    if let Some(start) = module.start {
        bounds("function", *start, module.functions.len())?;
        let ty = module.func_type(start);
        if !ty.params.is_empty() || !ty.results.is_empty() {
            return Err(ValidateError::InvalidStartFunction);
        }
    }

    // Finally, every local function body.
    for (i, body) in module.code.iter().enumerate() {
        let func_idx = FuncIdx::new((module.num_imported_functions + i) as u32);
        validate_function_body(&validator, func_idx, body)?;
    }

    debug!(functions = module.code.len(), "validated module");
    Ok(())
}

fn validate_types(validator: &Validator<'_>) -> Result<(), ValidateError> {
    let module = validator.module;
    for (i, sub) in module.types.iter().enumerate() {
        for &sup in &sub.supertypes {
            // A supertype must precede its subtype (or share its group), and
            // must not be declared final.
            if usize::from(sup) >= module.types.len() || usize::from(sup) >= i && !same_group(sub, *sup) {
                return Err(ValidateError::InvalidSupertype {
                    sub_idx: i as u32,
                    super_idx: *sup,
                });
            }
            let sup_ty = &module.types[usize::from(sup)];
            if sup_ty.is_final || !compatible_shape(&sub.composite, &sup_ty.composite) {
                return Err(ValidateError::InvalidSupertype {
                    sub_idx: i as u32,
                    super_idx: *sup,
                });
            }
        }
        validate_composite_indices(validator, &sub.composite)?;
    }
    Ok(())
}

fn same_group(sub: &SubType, sup: u32) -> bool {
    sup >= sub.rec_group_start && sup < sub.rec_group_start + sub.rec_group_len
}

// Shallow shape compatibility between a subtype and its declared supertype.
// Field- and signature-level variance is enforced structurally here too.
fn compatible_shape(sub: &CompositeType, sup: &CompositeType) -> bool {
    match (sub, sup) {
        (CompositeType::Func(a), CompositeType::Func(b)) => {
            a.params.len() == b.params.len() && a.results.len() == b.results.len()
        }
        (CompositeType::Struct(a), CompositeType::Struct(b)) => a.len() >= b.len(),
        (CompositeType::Array(_), CompositeType::Array(_)) => true,
        _ => false,
    }
}

fn validate_composite_indices(
    validator: &Validator<'_>,
    composite: &CompositeType,
) -> Result<(), ValidateError> {
    let mut check_val = |ty: ValType| match ty {
        ValType::Ref(RefType {
            heap: HeapType::Concrete(idx),
            ..
        }) => validator.check_type_idx(*idx).map(|_| ()),
        _ => Ok(()),
    };
    match composite {
        CompositeType::Func(ft) => {
            for &ty in ft.params.iter().chain(&ft.results) {
                check_val(ty)?;
            }
        }
        CompositeType::Struct(fields) => {
            for field in fields {
                check_val(field.storage.unpacked())?;
            }
        }
        CompositeType::Array(field) => check_val(field.storage.unpacked())?,
    }
    Ok(())
}

fn validate_imports(validator: &Validator<'_>) -> Result<(), ValidateError> {
    for import in &validator.module.imports {
        match import.descriptor {
            ImportDescriptor::Function(ty) => {
                let sub = validator.func_type_at(*ty)?;
                if sub.as_func().is_none() {
                    return Err(ValidateError::IndexOutOfBounds {
                        space: "function type",
                        index: *ty,
                        capacity: validator.module.types.len() as u32,
                    });
                }
            }
            ImportDescriptor::Table(ty) => {
                validate_limits(&ty.limits)?;
                validate_ref_type_indices(validator, ty.element)?;
            }
            ImportDescriptor::Memory(ty) => validate_memory_type(&ty)?,
            ImportDescriptor::Global(ty) => {
                if let ValType::Ref(rt) = ty.value {
                    validate_ref_type_indices(validator, rt)?;
                }
            }
            ImportDescriptor::Tag(ty) => {
                let sub = validator.func_type_at(*ty.ty)?;
                match sub.as_func() {
                    Some(ft) if ft.results.is_empty() => {}
                    _ => return Err(ValidateError::InvalidTagType),
                }
            }
        }
    }
    Ok(())
}

fn validate_ref_type_indices(
    validator: &Validator<'_>,
    ty: RefType,
) -> Result<(), ValidateError> {
    if let HeapType::Concrete(idx) = ty.heap {
        validator.check_type_idx(*idx)?;
    }
    Ok(())
}

fn validate_limits(limits: &Limits) -> Result<(), ValidateError> {
    if let Some(max) = limits.max
        && limits.min > max
    {
        return Err(ValidateError::InvalidLimits {
            min: limits.min,
            max,
        });
    }
    Ok(())
}

fn validate_memory_type(ty: &MemoryType) -> Result<(), ValidateError> {
    validate_limits(&ty.limits)?;
    if ty.shared && ty.limits.max.is_none() {
        return Err(ValidateError::SharedMemoryNeedsMax);
    }
    let ceiling = ty.absolute_max_pages();
    let declared = ty.limits.max.unwrap_or(ty.limits.min);
    if ty.limits.min > ceiling || declared > ceiling {
        return Err(ValidateError::MemoryTooLarge {
            pages: declared.max(ty.limits.min),
            max: ceiling,
        });
    }
    Ok(())
}

// Collects ref.func targets from a constant expression into the declared
// set; runs before const-expr type checking so bodies may also use them.
fn declare_const_expr_funcs(
    validator: &mut Validator<'_>,
    expr: &ConstExpr,
) -> Result<(), ValidateError> {
    let mut decoder = InstDecoder::new(&expr.bytecode);
    while !decoder.is_at_end() {
        let (_, inst) = decoder
            .next()
            .map_err(|_| ValidateError::InvalidConstExpr)?;
        if let Inst::Index {
            op: Opcode::RefFunc,
            index,
        } = inst
        {
            bounds("function", index, validator.module.functions.len())?;
            validator.declared_funcs.insert(index);
        }
    }
    Ok(())
}

pub(crate) fn validate_const_expr(
    validator: &Validator<'_>,
    expr: &ConstExpr,
    expected: ValType,
) -> Result<(), ValidateError> {
    validate_const_expr_with_global_limit(
        validator,
        expr,
        expected,
        validator.module.global_types.len(),
    )
}

// Type-checks a constant expression with a cap on which globals are visible
// (a global's own initializer may only read preceding globals). Extended
// constants allow i32/i64 add, sub, and mul.
fn validate_const_expr_with_global_limit(
    validator: &Validator<'_>,
    expr: &ConstExpr,
    expected: ValType,
    visible_globals: usize,
) -> Result<(), ValidateError> {
    let module = validator.module;
    let mut stack: Vec<ValType> = Vec::new();
    let mut decoder = InstDecoder::new(&expr.bytecode);
    let mut ended = false;

    while !decoder.is_at_end() {
        let (_, inst) = decoder
            .next()
            .map_err(|_| ValidateError::InvalidConstExpr)?;
        if ended {
            return Err(ValidateError::InvalidConstExpr);
        }
        match inst {
            Inst::I32Const(_) => stack.push(ValType::I32),
            Inst::I64Const(_) => stack.push(ValType::I64),
            Inst::F32Const(_) => stack.push(ValType::F32),
            Inst::F64Const(_) => stack.push(ValType::F64),
            Inst::Simd { sub: 0x0c, .. } => stack.push(ValType::V128),
            Inst::RefNull(heap) => {
                if let HeapType::Concrete(idx) = heap {
                    validator.check_type_idx(*idx)?;
                }
                stack.push(ValType::Ref(RefType {
                    nullable: true,
                    heap,
                }));
            }
            Inst::Index {
                op: Opcode::RefFunc,
                index,
            } => {
                bounds("function", index, module.functions.len())?;
                if !validator.declared_funcs.contains(&index) {
                    return Err(ValidateError::UndeclaredFuncRef(index));
                }
                let ty = module.functions[index as usize];
                stack.push(ValType::Ref(RefType {
                    nullable: false,
                    heap: HeapType::Concrete(ty),
                }));
            }
            Inst::Index {
                op: Opcode::GlobalGet,
                index,
            } => {
                bounds("global", index, visible_globals.min(module.global_types.len()))?;
                let ty = module.global_type(GlobalIdx::new(index));
                // Only immutable globals are constant.
                if ty.mutability != Mutability::Const {
                    return Err(ValidateError::InvalidConstExpr);
                }
                stack.push(ty.value);
            }
            Inst::Simple(
                op @ (Opcode::I32Add
                | Opcode::I32Sub
                | Opcode::I32Mul
                | Opcode::I64Add
                | Opcode::I64Sub
                | Opcode::I64Mul),
            ) => {
                let operand = if matches!(op, Opcode::I32Add | Opcode::I32Sub | Opcode::I32Mul) {
                    ValType::I32
                } else {
                    ValType::I64
                };
                let rhs = stack.pop();
                let lhs = stack.pop();
                if rhs != Some(operand) || lhs != Some(operand) {
                    return Err(ValidateError::InvalidConstExpr);
                }
                stack.push(operand);
            }
            Inst::Simple(Opcode::End) => ended = true,
            _ => return Err(ValidateError::InvalidConstExpr),
        }
    }
    if !ended {
        return Err(ValidateError::InvalidConstExpr);
    }

    match stack.as_slice() {
        [found] => {
            if validator.is_val_subtype(*found, expected) {
                Ok(())
            } else {
                Err(ValidateError::ConstExprTypeMismatch {
                    expected,
                    found: *found,
                })
            }
        }
        _ => Err(ValidateError::InvalidConstExpr),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FuncType, GlobalType};

    fn empty_module() -> ModuleInner {
        ModuleInner::default()
    }

    fn const_expr(bytes: &[u8]) -> ConstExpr {
        ConstExpr {
            bytecode: bytes.into(),
        }
    }

    #[test]
    fn const_expr_accepts_extended_arithmetic() {
        let module = empty_module();
        let validator = Validator::new(&module);
        // i32.const 2; i32.const 3; i32.mul; end
        let expr = const_expr(&[0x41, 0x02, 0x41, 0x03, 0x6c, 0x0b]);
        validate_const_expr(&validator, &expr, ValType::I32).unwrap();
    }

    #[test]
    fn const_expr_rejects_non_constant_operator() {
        let module = empty_module();
        let validator = Validator::new(&module);
        // i32.const 1; i32.const 2; i32.div_s; end
        let expr = const_expr(&[0x41, 0x01, 0x41, 0x02, 0x6d, 0x0b]);
        assert_eq!(
            validate_const_expr(&validator, &expr, ValType::I32),
            Err(ValidateError::InvalidConstExpr)
        );
    }

    #[test]
    fn const_expr_respects_result_type() {
        let module = empty_module();
        let validator = Validator::new(&module);
        let expr = const_expr(&[0x42, 0x2a, 0x0b]); // i64.const 42
        assert!(matches!(
            validate_const_expr(&validator, &expr, ValType::I32),
            Err(ValidateError::ConstExprTypeMismatch { .. })
        ));
    }

    #[test]
    fn mutable_global_is_not_constant() {
        let mut module = empty_module();
        module.global_types.push(GlobalType {
            value: ValType::I32,
            mutability: Mutability::Var,
        });
        module.num_imported_globals = 1;
        let validator = Validator::new(&module);
        let expr = const_expr(&[0x23, 0x00, 0x0b]); // global.get 0
        assert_eq!(
            validate_const_expr(&validator, &expr, ValType::I32),
            Err(ValidateError::InvalidConstExpr)
        );
    }

    #[test]
    fn start_function_must_be_nullary() {
        let mut module = empty_module();
        module.types.push(SubType {
            is_final: true,
            supertypes: Vec::new(),
            composite: CompositeType::Func(FuncType {
                params: vec![ValType::I32],
                results: vec![],
            }),
            rec_group_start: 0,
            rec_group_len: 1,
        });
        module.functions.push(TypeIdx::new(0));
        module.num_imported_functions = 1;
        module.start = Some(FuncIdx::new(0));
        module.canonicalize_types();
        assert_eq!(
            validate_module(&module),
            Err(ValidateError::InvalidStartFunction)
        );
    }
}
