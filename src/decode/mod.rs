// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! WebAssembly binary format decoding.
//!
//! Walks the section-structured binary, refusing sections whose declared
//! lengths overrun the input, and produces the typed module record that
//! validation and execution build on. Custom sections may interleave
//! anywhere; all other sections must appear at most once and in the
//! prescribed order (with Tag between Memory and Global, and DataCount
//! before Code).

pub(crate) mod body;
pub(crate) mod reader;
mod section;

use thiserror::Error;
use tracing::debug;

use crate::types::{BranchHint, ModuleInner, SectionId, Version};
use reader::{ReadError, Reader};

/// The number of items any one section may declare.
pub const MAX_SECTION_ITEMS: u32 = 100_000;

/// The number of locals any one function may declare.
pub const MAX_FUNCTION_LOCALS: u64 = 50_000;

const MAGIC: u32 = 0x6d73_6100; // '\0asm'

/// Represents errors that can arise during module decoding.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DecodeError {
    #[error("unexpected end of input at {offset:#x}")]
    UnexpectedEof { offset: usize },
    #[error("invalid LEB128-encoding at {offset:#x}")]
    InvalidLeb128 { offset: usize },
    #[error("invalid UTF-8 at {offset:#x}")]
    InvalidUtf8 { offset: usize },
    #[error("invalid magic ({0:#x})")]
    InvalidMagic(u32),
    #[error("unknown version ({0:#x})")]
    UnknownVersion(u32),
    #[error("invalid section ID ({id:#x}) at {offset:#x}")]
    InvalidSectionId { id: u8, offset: usize },
    #[error("duplicate of section ({0:?})")]
    DuplicateSection(SectionId),
    #[error("out-of-order sections: {before:?} before {after:?}")]
    OutOfOrderSection {
        before: SectionId,
        after: SectionId,
    },
    #[error("invalid section length for {id:?}: expected {expected:#x}; got {actual:#x}")]
    InvalidSectionLength {
        id: SectionId,
        expected: u32,
        actual: u32,
    },
    #[error("invalid func length: expected {expected:#x}; got {actual:#x}")]
    InvalidFunctionLength { expected: u32, actual: u32 },
    #[error("function and code section sizes disagree: {functions} vs {bodies}")]
    FunctionCodeCountMismatch { functions: usize, bodies: usize },
    #[error("invalid value type ({byte:#x}) at {offset:#x}")]
    InvalidValType { byte: u8, offset: usize },
    #[error("invalid limits flag ({flag:#x}) at {offset:#x}")]
    InvalidLimitsFlag { flag: u8, offset: usize },
    #[error("invalid byte token ({byte:#x}) at {offset:#x}")]
    InvalidToken { byte: u8, offset: usize },
    #[error("invalid opcode ({byte:#x}) at {offset:#x}")]
    InvalidOpcode { byte: u8, offset: usize },
    #[error("invalid prefixed opcode ({prefix:#x} {sub:#x}) at {offset:#x}")]
    InvalidPrefixedOpcode { prefix: u8, sub: u32, offset: usize },
    #[error("too many locals: at least {0} were specified")]
    TooManyLocals(u64),
    #[error("section {id:?} declares {count} items, over the {MAX_SECTION_ITEMS} limit")]
    TooManyItems { id: SectionId, count: u32 },
}

impl DecodeError {
    pub(crate) fn from_read(err: ReadError, offset: usize) -> Self {
        match err {
            ReadError::Eof => DecodeError::UnexpectedEof { offset },
            ReadError::InvalidLeb128 => DecodeError::InvalidLeb128 { offset },
            ReadError::InvalidUtf8 => DecodeError::InvalidUtf8 { offset },
        }
    }
}

// Attaches the current reader offset to a raw read failure.
macro_rules! at {
    ($reader:expr, $read:expr) => {{
        let offset = $reader.offset();
        $read.map_err(|err| DecodeError::from_read(err, offset))
    }};
}
pub(crate) use at;

/// Decodes a module binary into its typed record. The result has not yet
/// been validated.
pub(crate) fn decode_module(bytes: &[u8]) -> Result<ModuleInner, DecodeError> {
    let mut reader = Reader::new(bytes);

    let magic = at!(reader, reader.read_bytes(4))?;
    let magic = u32::from_le_bytes(magic.try_into().unwrap());
    if magic != MAGIC {
        return Err(DecodeError::InvalidMagic(magic));
    }
    let version = at!(reader, reader.read_bytes(4))?;
    let version = u32::from_le_bytes(version.try_into().unwrap());
    Version::try_from(version).map_err(|_| DecodeError::UnknownVersion(version))?;

    let mut module = ModuleInner::default();
    let mut num_bodies = 0usize;

    // The last non-custom section ID seen.
    let mut last_id: Option<SectionId> = None;
    // There is no in-band signal in the WASM format for the end of a module;
    // the best we can generically do is expect the input to end at a section
    // boundary.
    while !reader.is_at_end() {
        let id_offset = reader.offset();
        let id = at!(reader, reader.read_byte())?;
        let id = SectionId::try_from(id).map_err(|_| DecodeError::InvalidSectionId {
            id,
            offset: id_offset,
        })?;

        // Apart from custom sections, which can appear anywhere in the
        // format, sections must appear at most once and in order.
        if id != SectionId::Custom {
            if let Some(last) = last_id {
                if id == last {
                    return Err(DecodeError::DuplicateSection(id));
                }
                if id < last {
                    return Err(DecodeError::OutOfOrderSection {
                        before: last,
                        after: id,
                    });
                }
            }
            last_id = Some(id);
        }

        let len: u32 = at!(reader, reader.read_u32())?;
        if len as usize > reader.remaining() {
            return Err(DecodeError::UnexpectedEof {
                offset: reader.offset(),
            });
        }
        let section_start = reader.offset();
        match id {
            SectionId::Custom => {
                section::decode_custom(&mut reader, section_start + len as usize, &mut module)?;
            }
            SectionId::Type => section::decode_types(&mut reader, &mut module)?,
            SectionId::Import => section::decode_imports(&mut reader, &mut module)?,
            SectionId::Function => section::decode_functions(&mut reader, &mut module)?,
            SectionId::Table => section::decode_tables(&mut reader, &mut module)?,
            SectionId::Memory => section::decode_memories(&mut reader, &mut module)?,
            SectionId::Tag => section::decode_tags(&mut reader, &mut module)?,
            SectionId::Global => section::decode_globals(&mut reader, &mut module)?,
            SectionId::Export => section::decode_exports(&mut reader, &mut module)?,
            SectionId::Start => section::decode_start(&mut reader, &mut module)?,
            SectionId::Element => section::decode_elements(&mut reader, &mut module)?,
            SectionId::DataCount => {
                module.data_count = Some(at!(reader, reader.read_u32())?);
            }
            SectionId::Code => {
                num_bodies = section::decode_code(&mut reader, &mut module)?;
            }
            SectionId::Data => section::decode_data(&mut reader, &mut module)?,
        }
        let actual = reader.offset() - section_start;
        if actual != len as usize {
            return Err(DecodeError::InvalidSectionLength {
                id,
                expected: len,
                actual: actual as u32,
            });
        }
    }

    let declared = module.functions.len() - module.num_imported_functions;
    if declared != num_bodies {
        return Err(DecodeError::FunctionCodeCountMismatch {
            functions: declared,
            bodies: num_bodies,
        });
    }

    debug!(
        types = module.types.len(),
        functions = module.functions.len(),
        memories = module.memories.len(),
        tables = module.tables.len(),
        "decoded module"
    );
    Ok(module)
}

/// A description of one import, as reported by [`crate::inspect_imports`].
#[derive(Clone, Debug)]
pub struct ImportRecord {
    pub module: String,
    pub name: String,
    pub kind: crate::types::ExternKind,
    /// For function and tag imports, the parameter/result shape.
    pub signature: Option<crate::types::FuncType>,
}

/// Decodes just enough of a binary to describe its imports.
pub(crate) fn decode_imports_only(bytes: &[u8]) -> Result<Vec<ImportRecord>, DecodeError> {
    let module = decode_module(bytes)?;
    let records = module
        .imports
        .iter()
        .map(|import| {
            let signature = match import.descriptor {
                crate::types::ImportDescriptor::Function(ty)
                | crate::types::ImportDescriptor::Tag(crate::types::TagType { ty }) => module
                    .types
                    .get(usize::from(ty))
                    .and_then(|sub| sub.as_func())
                    .cloned(),
                _ => None,
            };
            ImportRecord {
                module: import.module.to_string(),
                name: import.field.to_string(),
                kind: import.descriptor.kind(),
                signature,
            }
        })
        .collect();
    Ok(records)
}

// Parses the "metadata.code.branch_hint" custom section payload. Hints are
// advisory; a malformed hint section is ignored rather than rejected.
pub(crate) fn parse_branch_hints(bytes: &[u8]) -> Option<Vec<(u32, Vec<BranchHint>)>> {
    let mut reader = Reader::new(bytes);
    let num_funcs = reader.read_u32().ok()?;
    if num_funcs > MAX_SECTION_ITEMS {
        return None;
    }
    let mut all = Vec::with_capacity(num_funcs as usize);
    for _ in 0..num_funcs {
        let func = reader.read_u32().ok()?;
        let num_hints = reader.read_u32().ok()?;
        if num_hints > MAX_SECTION_ITEMS {
            return None;
        }
        let mut hints = Vec::with_capacity(num_hints as usize);
        for _ in 0..num_hints {
            let offset = reader.read_u32().ok()?;
            let size = reader.read_u32().ok()?;
            let value = reader.read_byte().ok()?;
            if size != 1 || value > 1 {
                return None;
            }
            hints.push(BranchHint {
                offset,
                likely: value == 1,
            });
        }
        hints.sort_by_key(|hint| hint.offset);
        all.push((func, hints));
    }
    reader.is_at_end().then_some(all)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_magic() {
        let err = decode_module(&[0x01, 0x61, 0x73, 0x6d, 1, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidMagic(_)));
    }

    #[test]
    fn rejects_bad_version() {
        let err = decode_module(&[0x00, 0x61, 0x73, 0x6d, 2, 0, 0, 0]).unwrap_err();
        assert_eq!(err, DecodeError::UnknownVersion(2));
    }

    #[test]
    fn accepts_empty_module() {
        let module = decode_module(&[0x00, 0x61, 0x73, 0x6d, 1, 0, 0, 0]).unwrap();
        assert!(module.functions.is_empty());
        assert!(module.memories.is_empty());
    }

    #[test]
    fn rejects_truncated_header() {
        let err = decode_module(&[0x00, 0x61]).unwrap_err();
        assert!(matches!(err, DecodeError::UnexpectedEof { .. }));
    }

    #[test]
    fn rejects_overrunning_section() {
        // Type section claiming 100 bytes of payload with none present.
        let err = decode_module(&[0x00, 0x61, 0x73, 0x6d, 1, 0, 0, 0, 0x01, 100]).unwrap_err();
        assert!(matches!(err, DecodeError::UnexpectedEof { .. }));
    }

    #[test]
    fn parses_branch_hint_payload() {
        // One function (index 3) with hints at offsets 9 (unlikely) and 4
        // (likely); parsed hints come back sorted by offset.
        let payload = [1, 3, 2, 9, 1, 0, 4, 1, 1];
        let hints = parse_branch_hints(&payload).unwrap();
        assert_eq!(hints.len(), 1);
        assert_eq!(hints[0].0, 3);
        assert_eq!(hints[0].1.len(), 2);
        assert_eq!(hints[0].1[0].offset, 4);
        assert!(hints[0].1[0].likely);
        assert!(!hints[0].1[1].likely);
    }

    #[test]
    fn malformed_branch_hints_are_ignored() {
        assert!(parse_branch_hints(&[1, 0, 1, 0, 2, 1]).is_none()); // size != 1
    }
}
