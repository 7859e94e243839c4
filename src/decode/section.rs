// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Per-record decoding of the non-custom sections.

use crate::types::{
    CompositeType, ConstExpr, DataMode, DataSegment, ElementInit, ElementMode, ElementSegment,
    Export, ExportDescriptor, ExternKind, FieldType, FuncBody, FuncIdx, FuncType, Global,
    GlobalIdx, GlobalType, HeapType, Import, ImportDescriptor, Limits, MemIdx, MemoryType,
    ModuleInner, Mutability, RefType, SectionId, StorageType, SubType, TableIdx, TableType,
    TagIdx, TagType, TypeIdx, ValType,
};

use super::body::scan_const_expr;
use super::reader::Reader;
use super::{DecodeError, MAX_FUNCTION_LOCALS, MAX_SECTION_ITEMS, at, parse_branch_hints};

// Composite/subtype tokens within the type section.
const TOKEN_FUNC: u8 = 0x60;
const TOKEN_STRUCT: u8 = 0x5f;
const TOKEN_ARRAY: u8 = 0x5e;
const TOKEN_SUB: u8 = 0x50;
const TOKEN_SUB_FINAL: u8 = 0x4f;
const TOKEN_REC: u8 = 0x4e;

// Reference-type tokens.
const TOKEN_REF_NULLABLE: u8 = 0x63;
const TOKEN_REF_NON_NULL: u8 = 0x64;

fn item_count(reader: &mut Reader<'_>, id: SectionId) -> Result<u32, DecodeError> {
    let count = at!(reader, reader.read_u32())?;
    if count > MAX_SECTION_ITEMS {
        return Err(DecodeError::TooManyItems { id, count });
    }
    Ok(count)
}

// Maps an abstract-heap-type token (also a valid shorthand reftype byte) to
// its heap type.
fn abstract_heap_type(byte: u8) -> Option<HeapType> {
    match byte {
        0x70 => Some(HeapType::Func),
        0x6f => Some(HeapType::Extern),
        0x6e => Some(HeapType::Any),
        0x6d => Some(HeapType::Eq),
        0x6c => Some(HeapType::I31),
        0x6b => Some(HeapType::Struct),
        0x6a => Some(HeapType::Array),
        0x69 => Some(HeapType::Exn),
        0x71 => Some(HeapType::None),
        0x72 => Some(HeapType::NoExtern),
        0x73 => Some(HeapType::NoFunc),
        0x74 => Some(HeapType::NoExn),
        _ => None,
    }
}

pub(crate) fn read_heap_type(reader: &mut Reader<'_>) -> Result<HeapType, DecodeError> {
    let offset = reader.offset();
    let value = at!(reader, reader.read_s33())?;
    if value >= 0 {
        if value > i64::from(u32::MAX) {
            return Err(DecodeError::InvalidToken {
                byte: 0,
                offset,
            });
        }
        return Ok(HeapType::Concrete(TypeIdx::new(value as u32)));
    }
    // Negative values are the sign-extended single-byte abstract tokens.
    let byte = (value & 0x7f) as u8;
    abstract_heap_type(byte).ok_or(DecodeError::InvalidToken { byte, offset })
}

pub(crate) fn read_ref_type(reader: &mut Reader<'_>) -> Result<RefType, DecodeError> {
    let offset = reader.offset();
    let byte = at!(reader, reader.peek_byte())?;
    match byte {
        TOKEN_REF_NULLABLE | TOKEN_REF_NON_NULL => {
            reader.read_byte().unwrap();
            let heap = read_heap_type(reader)?;
            Ok(RefType {
                nullable: byte == TOKEN_REF_NULLABLE,
                heap,
            })
        }
        _ => {
            let heap = abstract_heap_type(byte)
                .ok_or(DecodeError::InvalidToken { byte, offset })?;
            reader.read_byte().unwrap();
            Ok(RefType {
                nullable: true,
                heap,
            })
        }
    }
}

pub(crate) fn read_val_type(reader: &mut Reader<'_>) -> Result<ValType, DecodeError> {
    let offset = reader.offset();
    let byte = at!(reader, reader.peek_byte())?;
    match byte {
        0x7f => {
            reader.read_byte().unwrap();
            Ok(ValType::I32)
        }
        0x7e => {
            reader.read_byte().unwrap();
            Ok(ValType::I64)
        }
        0x7d => {
            reader.read_byte().unwrap();
            Ok(ValType::F32)
        }
        0x7c => {
            reader.read_byte().unwrap();
            Ok(ValType::F64)
        }
        0x7b => {
            reader.read_byte().unwrap();
            Ok(ValType::V128)
        }
        _ => read_ref_type(reader)
            .map(ValType::Ref)
            .map_err(|_| DecodeError::InvalidValType { byte, offset }),
    }
}

fn read_result_types(reader: &mut Reader<'_>) -> Result<Vec<ValType>, DecodeError> {
    let count = item_count(reader, SectionId::Type)?;
    let mut types = Vec::with_capacity(count as usize);
    for _ in 0..count {
        types.push(read_val_type(reader)?);
    }
    Ok(types)
}

fn read_storage_type(reader: &mut Reader<'_>) -> Result<StorageType, DecodeError> {
    let byte = at!(reader, reader.peek_byte())?;
    match byte {
        0x78 => {
            reader.read_byte().unwrap();
            Ok(StorageType::I8)
        }
        0x77 => {
            reader.read_byte().unwrap();
            Ok(StorageType::I16)
        }
        _ => Ok(StorageType::Val(read_val_type(reader)?)),
    }
}

fn read_field_type(reader: &mut Reader<'_>) -> Result<FieldType, DecodeError> {
    let storage = read_storage_type(reader)?;
    let offset = reader.offset();
    let byte = at!(reader, reader.read_byte())?;
    let mutable = match Mutability::try_from(byte) {
        Ok(Mutability::Var) => true,
        Ok(Mutability::Const) => false,
        Err(_) => return Err(DecodeError::InvalidToken { byte, offset }),
    };
    Ok(FieldType { storage, mutable })
}

fn read_composite(reader: &mut Reader<'_>) -> Result<CompositeType, DecodeError> {
    let offset = reader.offset();
    let byte = at!(reader, reader.read_byte())?;
    match byte {
        TOKEN_FUNC => {
            let params = read_result_types(reader)?;
            let results = read_result_types(reader)?;
            Ok(CompositeType::Func(FuncType { params, results }))
        }
        TOKEN_STRUCT => {
            let count = item_count(reader, SectionId::Type)?;
            let mut fields = Vec::with_capacity(count as usize);
            for _ in 0..count {
                fields.push(read_field_type(reader)?);
            }
            Ok(CompositeType::Struct(fields))
        }
        TOKEN_ARRAY => Ok(CompositeType::Array(read_field_type(reader)?)),
        _ => Err(DecodeError::InvalidToken { byte, offset }),
    }
}

fn read_sub_type(reader: &mut Reader<'_>, group_start: u32) -> Result<SubType, DecodeError> {
    let byte = at!(reader, reader.peek_byte())?;
    let (is_final, has_supers) = match byte {
        TOKEN_SUB => (false, true),
        TOKEN_SUB_FINAL => (true, true),
        _ => (true, false),
    };
    let mut supertypes = Vec::new();
    if has_supers {
        reader.read_byte().unwrap();
        let count = at!(reader, reader.read_u32())?;
        for _ in 0..count {
            supertypes.push(TypeIdx::new(at!(reader, reader.read_u32())?));
        }
    }
    Ok(SubType {
        is_final,
        supertypes,
        composite: read_composite(reader)?,
        rec_group_start: group_start,
        rec_group_len: 1,
    })
}

pub(super) fn decode_types(
    reader: &mut Reader<'_>,
    module: &mut ModuleInner,
) -> Result<(), DecodeError> {
    let count = item_count(reader, SectionId::Type)?;
    for _ in 0..count {
        let group_start = module.types.len() as u32;
        if at!(reader, reader.peek_byte())? == TOKEN_REC {
            reader.read_byte().unwrap();
            let group_len = item_count(reader, SectionId::Type)?;
            for _ in 0..group_len {
                let mut sub = read_sub_type(reader, group_start)?;
                sub.rec_group_len = group_len;
                module.types.push(sub);
            }
        } else {
            module.types.push(read_sub_type(reader, group_start)?);
        }
    }
    Ok(())
}

// Limits-flag bits: 0x01 max present, 0x02 shared, 0x04 64-bit address
// type, 0x08 custom page size follows (memories only).
fn read_limits(
    reader: &mut Reader<'_>,
    allow_page_size: bool,
) -> Result<(Limits, bool, bool, Option<u32>), DecodeError> {
    let offset = reader.offset();
    let flag = at!(reader, reader.read_byte())?;
    let allowed = if allow_page_size { 0x0f } else { 0x07 };
    if flag & !allowed != 0 {
        return Err(DecodeError::InvalidLimitsFlag { flag, offset });
    }
    let has_max = flag & 0x01 != 0;
    let shared = flag & 0x02 != 0;
    let is_64 = flag & 0x04 != 0;
    if shared && !has_max {
        return Err(DecodeError::InvalidLimitsFlag { flag, offset });
    }

    let min = if is_64 {
        at!(reader, reader.read_u64())?
    } else {
        u64::from(at!(reader, reader.read_u32())?)
    };
    let max = if has_max {
        Some(if is_64 {
            at!(reader, reader.read_u64())?
        } else {
            u64::from(at!(reader, reader.read_u32())?)
        })
    } else {
        None
    };
    let page_size_log2 = if flag & 0x08 != 0 {
        Some(at!(reader, reader.read_u32())?)
    } else {
        None
    };
    Ok((Limits { min, max }, shared, is_64, page_size_log2))
}

fn read_table_type(reader: &mut Reader<'_>) -> Result<TableType, DecodeError> {
    let element = read_ref_type(reader)?;
    let (limits, _, table64, _) = read_limits(reader, false)?;
    Ok(TableType {
        element,
        limits,
        table64,
    })
}

fn read_memory_type(reader: &mut Reader<'_>) -> Result<MemoryType, DecodeError> {
    let (limits, shared, memory64, page_size_log2) = read_limits(reader, true)?;
    Ok(MemoryType {
        limits,
        shared,
        memory64,
        page_size_log2,
    })
}

fn read_global_type(reader: &mut Reader<'_>) -> Result<GlobalType, DecodeError> {
    let value = read_val_type(reader)?;
    let offset = reader.offset();
    let byte = at!(reader, reader.read_byte())?;
    let mutability =
        Mutability::try_from(byte).map_err(|_| DecodeError::InvalidToken { byte, offset })?;
    Ok(GlobalType { value, mutability })
}

fn read_tag_type(reader: &mut Reader<'_>) -> Result<TagType, DecodeError> {
    // The single defined attribute is 0x00 (an exception tag).
    let offset = reader.offset();
    let byte = at!(reader, reader.read_byte())?;
    if byte != 0x00 {
        return Err(DecodeError::InvalidToken { byte, offset });
    }
    Ok(TagType {
        ty: TypeIdx::new(at!(reader, reader.read_u32())?),
    })
}

pub(super) fn decode_imports(
    reader: &mut Reader<'_>,
    module: &mut ModuleInner,
) -> Result<(), DecodeError> {
    let count = item_count(reader, SectionId::Import)?;
    for _ in 0..count {
        let module_name = at!(reader, reader.read_name())?.into();
        let field = at!(reader, reader.read_name())?.into();
        let offset = reader.offset();
        let byte = at!(reader, reader.read_byte())?;
        let kind =
            ExternKind::try_from(byte).map_err(|_| DecodeError::InvalidToken { byte, offset })?;
        let descriptor = match kind {
            ExternKind::Function => {
                let ty = TypeIdx::new(at!(reader, reader.read_u32())?);
                module.functions.push(ty);
                module.num_imported_functions += 1;
                ImportDescriptor::Function(ty)
            }
            ExternKind::Table => {
                let ty = read_table_type(reader)?;
                module.tables.push(ty);
                module.num_imported_tables += 1;
                ImportDescriptor::Table(ty)
            }
            ExternKind::Memory => {
                let ty = read_memory_type(reader)?;
                module.memories.push(ty);
                module.num_imported_memories += 1;
                ImportDescriptor::Memory(ty)
            }
            ExternKind::Global => {
                let ty = read_global_type(reader)?;
                module.global_types.push(ty);
                module.num_imported_globals += 1;
                ImportDescriptor::Global(ty)
            }
            ExternKind::Tag => {
                let ty = read_tag_type(reader)?;
                module.tags.push(ty);
                module.num_imported_tags += 1;
                ImportDescriptor::Tag(ty)
            }
        };
        module.imports.push(Import {
            module: module_name,
            field,
            descriptor,
        });
    }
    Ok(())
}

pub(super) fn decode_functions(
    reader: &mut Reader<'_>,
    module: &mut ModuleInner,
) -> Result<(), DecodeError> {
    let count = item_count(reader, SectionId::Function)?;
    for _ in 0..count {
        module
            .functions
            .push(TypeIdx::new(at!(reader, reader.read_u32())?));
    }
    Ok(())
}

pub(super) fn decode_tables(
    reader: &mut Reader<'_>,
    module: &mut ModuleInner,
) -> Result<(), DecodeError> {
    let count = item_count(reader, SectionId::Table)?;
    for _ in 0..count {
        // A 0x40 0x00 prefix declares a table with an explicit initializer.
        if at!(reader, reader.peek_byte())? == 0x40 {
            reader.read_byte().unwrap();
            let offset = reader.offset();
            let byte = at!(reader, reader.read_byte())?;
            if byte != 0x00 {
                return Err(DecodeError::InvalidToken { byte, offset });
            }
            let ty = read_table_type(reader)?;
            let init = read_const_expr(reader)?;
            module.tables.push(ty);
            module.table_inits.push(Some(init));
        } else {
            module.tables.push(read_table_type(reader)?);
            module.table_inits.push(None);
        }
    }
    Ok(())
}

pub(super) fn decode_memories(
    reader: &mut Reader<'_>,
    module: &mut ModuleInner,
) -> Result<(), DecodeError> {
    let count = item_count(reader, SectionId::Memory)?;
    for _ in 0..count {
        module.memories.push(read_memory_type(reader)?);
    }
    Ok(())
}

pub(super) fn decode_tags(
    reader: &mut Reader<'_>,
    module: &mut ModuleInner,
) -> Result<(), DecodeError> {
    let count = item_count(reader, SectionId::Tag)?;
    for _ in 0..count {
        module.tags.push(read_tag_type(reader)?);
    }
    Ok(())
}

fn read_const_expr(reader: &mut Reader<'_>) -> Result<ConstExpr, DecodeError> {
    let bytes = scan_const_expr(reader)?;
    Ok(ConstExpr {
        bytecode: bytes.into(),
    })
}

pub(super) fn decode_globals(
    reader: &mut Reader<'_>,
    module: &mut ModuleInner,
) -> Result<(), DecodeError> {
    let count = item_count(reader, SectionId::Global)?;
    for _ in 0..count {
        let ty = read_global_type(reader)?;
        let init = read_const_expr(reader)?;
        module.global_types.push(ty);
        module.globals.push(Global { ty, init });
    }
    Ok(())
}

pub(super) fn decode_exports(
    reader: &mut Reader<'_>,
    module: &mut ModuleInner,
) -> Result<(), DecodeError> {
    let count = item_count(reader, SectionId::Export)?;
    for _ in 0..count {
        let field = at!(reader, reader.read_name())?.into();
        let offset = reader.offset();
        let byte = at!(reader, reader.read_byte())?;
        let kind =
            ExternKind::try_from(byte).map_err(|_| DecodeError::InvalidToken { byte, offset })?;
        let index = at!(reader, reader.read_u32())?;
        let descriptor = match kind {
            ExternKind::Function => ExportDescriptor::Function(FuncIdx::new(index)),
            ExternKind::Table => ExportDescriptor::Table(TableIdx::new(index)),
            ExternKind::Memory => ExportDescriptor::Memory(MemIdx::new(index)),
            ExternKind::Global => ExportDescriptor::Global(GlobalIdx::new(index)),
            ExternKind::Tag => ExportDescriptor::Tag(TagIdx::new(index)),
        };
        module.exports.push(Export { field, descriptor });
    }
    Ok(())
}

pub(super) fn decode_start(
    reader: &mut Reader<'_>,
    module: &mut ModuleInner,
) -> Result<(), DecodeError> {
    module.start = Some(FuncIdx::new(at!(reader, reader.read_u32())?));
    Ok(())
}

fn read_elem_kind(reader: &mut Reader<'_>) -> Result<RefType, DecodeError> {
    let offset = reader.offset();
    let byte = at!(reader, reader.read_byte())?;
    if byte != 0x00 {
        return Err(DecodeError::InvalidToken { byte, offset });
    }
    Ok(RefType::FUNCREF)
}

fn read_func_indices(reader: &mut Reader<'_>) -> Result<Vec<FuncIdx>, DecodeError> {
    let count = item_count(reader, SectionId::Element)?;
    let mut indices = Vec::with_capacity(count as usize);
    for _ in 0..count {
        indices.push(FuncIdx::new(at!(reader, reader.read_u32())?));
    }
    Ok(indices)
}

fn read_elem_exprs(reader: &mut Reader<'_>) -> Result<Vec<ConstExpr>, DecodeError> {
    let count = item_count(reader, SectionId::Element)?;
    let mut exprs = Vec::with_capacity(count as usize);
    for _ in 0..count {
        exprs.push(read_const_expr(reader)?);
    }
    Ok(exprs)
}

pub(super) fn decode_elements(
    reader: &mut Reader<'_>,
    module: &mut ModuleInner,
) -> Result<(), DecodeError> {
    let count = item_count(reader, SectionId::Element)?;
    for _ in 0..count {
        let offset = reader.offset();
        let form = at!(reader, reader.read_u32())?;
        let segment = match form {
            0 => ElementSegment {
                ty: RefType::FUNCREF,
                mode: ElementMode::Active {
                    table: TableIdx::new(0),
                    offset: read_const_expr(reader)?,
                },
                init: ElementInit::FunctionIndices(read_func_indices(reader)?),
            },
            1 => {
                let ty = read_elem_kind(reader)?;
                ElementSegment {
                    ty,
                    init: ElementInit::FunctionIndices(read_func_indices(reader)?),
                    mode: ElementMode::Passive,
                }
            }
            2 => {
                let table = TableIdx::new(at!(reader, reader.read_u32())?);
                let offset = read_const_expr(reader)?;
                let ty = read_elem_kind(reader)?;
                ElementSegment {
                    ty,
                    init: ElementInit::FunctionIndices(read_func_indices(reader)?),
                    mode: ElementMode::Active { table, offset },
                }
            }
            3 => {
                let ty = read_elem_kind(reader)?;
                ElementSegment {
                    ty,
                    init: ElementInit::FunctionIndices(read_func_indices(reader)?),
                    mode: ElementMode::Declarative,
                }
            }
            4 => ElementSegment {
                ty: RefType::FUNCREF,
                mode: ElementMode::Active {
                    table: TableIdx::new(0),
                    offset: read_const_expr(reader)?,
                },
                init: ElementInit::Expressions(read_elem_exprs(reader)?),
            },
            5 => {
                let ty = read_ref_type(reader)?;
                ElementSegment {
                    ty,
                    init: ElementInit::Expressions(read_elem_exprs(reader)?),
                    mode: ElementMode::Passive,
                }
            }
            6 => {
                let table = TableIdx::new(at!(reader, reader.read_u32())?);
                let offset = read_const_expr(reader)?;
                let ty = read_ref_type(reader)?;
                ElementSegment {
                    ty,
                    init: ElementInit::Expressions(read_elem_exprs(reader)?),
                    mode: ElementMode::Active { table, offset },
                }
            }
            7 => {
                let ty = read_ref_type(reader)?;
                ElementSegment {
                    ty,
                    init: ElementInit::Expressions(read_elem_exprs(reader)?),
                    mode: ElementMode::Declarative,
                }
            }
            _ => {
                return Err(DecodeError::InvalidToken {
                    byte: form as u8,
                    offset,
                });
            }
        };
        module.elements.push(segment);
    }
    Ok(())
}

pub(super) fn decode_code(
    reader: &mut Reader<'_>,
    module: &mut ModuleInner,
) -> Result<usize, DecodeError> {
    let count = item_count(reader, SectionId::Code)?;
    for _ in 0..count {
        let size = at!(reader, reader.read_u32())?;
        let body_start = reader.offset();

        let mut locals = Vec::new();
        let num_groups = at!(reader, reader.read_u32())?;
        let mut total: u64 = 0;
        for _ in 0..num_groups {
            let n = at!(reader, reader.read_u32())?;
            let ty = read_val_type(reader)?;
            // Saturating: a hostile module can declare u32::MAX locals per
            // group; the sum must not wrap past the limit check.
            total = total.saturating_add(u64::from(n));
            locals.push((n, ty));
        }
        if total > MAX_FUNCTION_LOCALS {
            return Err(DecodeError::TooManyLocals(total));
        }

        let consumed = reader.offset() - body_start;
        let remaining = (size as usize)
            .checked_sub(consumed)
            .ok_or(DecodeError::InvalidFunctionLength {
                expected: size,
                actual: consumed as u32,
            })?;
        let offset = reader.offset();
        let bytecode = at!(reader, reader.read_bytes(remaining))?;
        module.code.push(FuncBody {
            locals,
            bytecode: bytecode.into(),
            offset,
        });
    }
    Ok(count as usize)
}

pub(super) fn decode_data(
    reader: &mut Reader<'_>,
    module: &mut ModuleInner,
) -> Result<(), DecodeError> {
    let count = item_count(reader, SectionId::Data)?;
    for _ in 0..count {
        let offset = reader.offset();
        let form = at!(reader, reader.read_u32())?;
        let mode = match form {
            0 => DataMode::Active {
                memory: MemIdx::new(0),
                offset: read_const_expr(reader)?,
            },
            1 => DataMode::Passive,
            2 => {
                let memory = MemIdx::new(at!(reader, reader.read_u32())?);
                DataMode::Active {
                    memory,
                    offset: read_const_expr(reader)?,
                }
            }
            _ => {
                return Err(DecodeError::InvalidToken {
                    byte: form as u8,
                    offset,
                });
            }
        };
        let len = at!(reader, reader.read_u32())? as usize;
        let init = at!(reader, reader.read_bytes(len))?;
        module.datas.push(DataSegment {
            init: init.into(),
            mode,
        });
    }
    Ok(())
}

pub(super) fn decode_custom(
    reader: &mut Reader<'_>,
    section_end: usize,
    module: &mut ModuleInner,
) -> Result<(), DecodeError> {
    let name = at!(reader, reader.read_name())?;
    let remaining = section_end.saturating_sub(reader.offset());
    let payload = at!(reader, reader.read_bytes(remaining))?;
    if name == "metadata.code.branch_hint"
        && let Some(hints) = parse_branch_hints(payload)
    {
        for (func, func_hints) in hints {
            module.branch_hints.insert(func, func_hints);
        }
    }
    Ok(())
}
