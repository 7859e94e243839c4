// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! WebAssembly type definitions.
//!
//! This module contains all the type definitions used for decoding and
//! representing modules: value types, heap types, function signatures,
//! imports, exports, segments, and the decoded module record itself.

mod instr;
pub use instr::*;

use std::cmp;
use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};

use num_enum::TryFromPrimitive;

// Defines a public index newtype without public mutable access to the
// underlying u32, along with some convenience trait implementations.
macro_rules! index_type {
    (
        $(#[$meta:meta])*
        pub struct $type:ident(u32);
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
        pub struct $type(u32);

        impl $type {
            pub fn new(value: u32) -> Self {
                Self(value)
            }
        }

        impl ::std::ops::Deref for $type {
            type Target = u32;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl From<$type> for usize {
            fn from(idx: $type) -> usize {
                idx.0 as usize
            }
        }
    };
}

index_type!(
    /// An index into the type section.
    pub struct TypeIdx(u32);
);

index_type!(
    /// An index into the function index space (imports first).
    pub struct FuncIdx(u32);
);

index_type!(
    /// An index into the table index space.
    pub struct TableIdx(u32);
);

index_type!(
    /// An index into the memory index space.
    pub struct MemIdx(u32);
);

index_type!(
    /// An index into the global index space.
    pub struct GlobalIdx(u32);
);

index_type!(
    /// An index into the tag index space.
    pub struct TagIdx(u32);
);

index_type!(
    /// An index into the element section.
    pub struct ElemIdx(u32);
);

index_type!(
    /// An index into the data section.
    pub struct DataIdx(u32);
);

index_type!(
    /// An index into a function's local variables.
    pub struct LocalIdx(u32);
);

index_type!(
    /// An index referencing structured control instructions inside an
    /// instruction sequence.
    pub struct LabelIdx(u32);
);

/// WebAssembly module version.
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u32)]
pub enum Version {
    V1 = 1,
}

/// The abstract or concrete heap a reference points into.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum HeapType {
    Func,
    Extern,
    Exn,
    Any,
    Eq,
    I31,
    Struct,
    Array,
    None,
    NoFunc,
    NoExtern,
    NoExn,
    /// A concrete type-section type (function, struct, or array).
    Concrete(TypeIdx),
}

impl HeapType {
    /// The abstract bottom type of this heap type's hierarchy.
    pub fn bottom(self) -> HeapType {
        match self {
            HeapType::Func | HeapType::NoFunc => HeapType::NoFunc,
            HeapType::Extern | HeapType::NoExtern => HeapType::NoExtern,
            HeapType::Exn | HeapType::NoExn => HeapType::NoExn,
            _ => HeapType::None,
        }
    }
}

/// The type of a reference to an object in the runtime store.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct RefType {
    pub nullable: bool,
    pub heap: HeapType,
}

impl RefType {
    pub const FUNCREF: RefType = RefType {
        nullable: true,
        heap: HeapType::Func,
    };
    pub const EXTERNREF: RefType = RefType {
        nullable: true,
        heap: HeapType::Extern,
    };
    pub const EXNREF: RefType = RefType {
        nullable: true,
        heap: HeapType::Exn,
    };
}

/// Value types classify the individual values that WebAssembly code can
/// compute with and the values that a variable accepts.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ValType {
    /// 32-bit integer.
    I32,
    /// 64-bit integer.
    I64,
    /// 32-bit floating point number.
    F32,
    /// 64-bit floating point number.
    F64,
    /// 128-bit SIMD vector.
    V128,
    /// A reference.
    Ref(RefType),
}

impl ValType {
    pub const FUNCREF: ValType = ValType::Ref(RefType::FUNCREF);
    pub const EXTERNREF: ValType = ValType::Ref(RefType::EXTERNREF);
    pub const EXNREF: ValType = ValType::Ref(RefType::EXNREF);

    /// Whether a local of this type can be read before being written.
    pub fn is_defaultable(self) -> bool {
        match self {
            ValType::Ref(rt) => rt.nullable,
            _ => true,
        }
    }

    /// The number of 64-bit operand slots a value of this type occupies.
    pub fn slot_count(self) -> usize {
        if self == ValType::V128 { 2 } else { 1 }
    }
}

/// The signature of a function, mapping parameters to results. Also used to
/// classify the inputs and outputs of instructions and blocks.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct FuncType {
    pub params: Vec<ValType>,
    pub results: Vec<ValType>,
}

impl FuncType {
    /// Total operand slots occupied by the parameters.
    pub fn param_slots(&self) -> usize {
        self.params.iter().map(|t| t.slot_count()).sum()
    }

    /// Total operand slots occupied by the results.
    pub fn result_slots(&self) -> usize {
        self.results.iter().map(|t| t.slot_count()).sum()
    }
}

/// A field's storage inside a struct or array: either a full value type or a
/// packed 8/16-bit integer.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum StorageType {
    I8,
    I16,
    Val(ValType),
}

impl StorageType {
    /// The value type this storage widens to on access.
    pub fn unpacked(self) -> ValType {
        match self {
            StorageType::I8 | StorageType::I16 => ValType::I32,
            StorageType::Val(ty) => ty,
        }
    }
}

/// A struct or array field with its mutability.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct FieldType {
    pub storage: StorageType,
    pub mutable: bool,
}

/// The shape of a type-section entry.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum CompositeType {
    Func(FuncType),
    Struct(Vec<FieldType>),
    Array(FieldType),
}

/// A type-section entry: a composite type plus its subtyping declaration.
/// Types declared together in a `rec` group form one equivalence unit.
#[derive(Clone, Debug)]
pub struct SubType {
    pub is_final: bool,
    pub supertypes: Vec<TypeIdx>,
    pub composite: CompositeType,
    /// Index of the first type of the enclosing rec group.
    pub rec_group_start: u32,
    /// Number of types in the enclosing rec group.
    pub rec_group_len: u32,
}

impl SubType {
    /// The function signature, if this is a function type.
    pub fn as_func(&self) -> Option<&FuncType> {
        match &self.composite {
            CompositeType::Func(ft) => Some(ft),
            _ => None,
        }
    }
}

/// The size range of the resizeable storage associated with memories (pages)
/// and tables (elements). Widths are u64 to accommodate 64-bit address types.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Limits {
    /// Minimum size.
    pub min: u64,
    /// Maximum size, with None indicating that there is no upper limit.
    pub max: Option<u64>,
}

impl Limits {
    /// Whether these limits fit within (i.e. import-match) `other`.
    pub fn fits_within(&self, other: &Limits) -> bool {
        self.min >= other.min
            && match (self.max, other.max) {
                (_, None) => true,
                (Some(a), Some(b)) => a <= b,
                (None, Some(_)) => false,
            }
    }
}

/// A linear memory type.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MemoryType {
    /// Size limits, in pages.
    pub limits: Limits,
    /// Whether the memory may be shared between agents.
    pub shared: bool,
    /// Whether the memory uses a 64-bit address type.
    pub memory64: bool,
    /// log2 of the page size, for the custom-page-sizes extension. None
    /// means the default 64 KiB pages.
    pub page_size_log2: Option<u32>,
}

impl MemoryType {
    /// The default WebAssembly page size.
    pub const PAGE_SIZE: u64 = 0x1_0000; // 64 KiB

    /// The page size in bytes for this memory.
    pub fn page_size(&self) -> u64 {
        match self.page_size_log2 {
            Some(log2) => 1u64 << log2,
            None => Self::PAGE_SIZE,
        }
    }

    /// The hard ceiling on page count implied by the address type.
    pub fn absolute_max_pages(&self) -> u64 {
        if self.memory64 {
            u64::MAX / self.page_size()
        } else {
            (1u64 << 32) / self.page_size()
        }
    }
}

/// WebAssembly table type.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TableType {
    /// Type of references stored in the table.
    pub element: RefType,
    /// Table size limits, in elements.
    pub limits: Limits,
    /// Whether the table uses a 64-bit address type.
    pub table64: bool,
}

/// The mutability of a global variable.
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum Mutability {
    /// Immutable.
    Const = 0x00,
    /// Mutable.
    Var = 0x01,
}

/// The type of a global variable.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct GlobalType {
    pub value: ValType,
    pub mutability: Mutability,
}

/// The type of an exception tag: a function type index whose results must be
/// empty. Two tags are the same at runtime iff they were instantiated from
/// the same declared or imported tag.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TagType {
    pub ty: TypeIdx,
}

/// A constant expression: a bytecode slice evaluated at instantiation time
/// (global initializers, segment offsets, element expressions).
#[derive(Clone, Debug)]
pub struct ConstExpr {
    pub bytecode: Box<[u8]>,
}

/// Section identifier within a module.
///
/// `PartialOrd` is implemented so that, for non-custom section IDs, an ID is
/// less than another precisely when the former must appear before the latter
/// when both are present.
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum SectionId {
    /// Custom section with arbitrary data.
    Custom = 0,
    /// Function type declarations.
    Type = 1,
    /// Import declarations.
    Import = 2,
    /// Function type indices for module functions.
    Function = 3,
    /// Table declarations.
    Table = 4,
    /// Memory declarations.
    Memory = 5,
    /// Exception tag declarations; sits between Memory and Global.
    Tag = 13,
    /// Global declarations.
    Global = 6,
    /// Export declarations.
    Export = 7,
    /// Start function index.
    Start = 8,
    /// Element segments for table initialization.
    Element = 9,
    /// Function bodies.
    Code = 10,
    /// Data segments for memory initialization.
    Data = 11,
    /// Data segment count (for bulk memory operations).
    DataCount = 12,
}

impl SectionId {
    // Rank in the prescribed section order.
    fn rank(self) -> u8 {
        match self {
            SectionId::Custom => 0,
            SectionId::Type => 1,
            SectionId::Import => 2,
            SectionId::Function => 3,
            SectionId::Table => 4,
            SectionId::Memory => 5,
            SectionId::Tag => 6,
            SectionId::Global => 7,
            SectionId::Export => 8,
            SectionId::Start => 9,
            SectionId::Element => 10,
            SectionId::DataCount => 11,
            SectionId::Code => 12,
            SectionId::Data => 13,
        }
    }
}

// The logical order, as documented above.
impl PartialOrd for SectionId {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        self.rank().partial_cmp(&other.rank())
    }
}

/// What kind of entity an import or export refers to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum ExternKind {
    Function = 0x00,
    Table = 0x01,
    Memory = 0x02,
    Global = 0x03,
    Tag = 0x04,
}

/// Import descriptor types.
#[derive(Clone, Copy, Debug)]
pub enum ImportDescriptor {
    /// Import a function with the given type index.
    Function(TypeIdx),
    /// Import a table with the given type.
    Table(TableType),
    /// Import a memory with the given type.
    Memory(MemoryType),
    /// Import a global with the given type.
    Global(GlobalType),
    /// Import an exception tag with the given type.
    Tag(TagType),
}

impl ImportDescriptor {
    pub fn kind(&self) -> ExternKind {
        match self {
            ImportDescriptor::Function(_) => ExternKind::Function,
            ImportDescriptor::Table(_) => ExternKind::Table,
            ImportDescriptor::Memory(_) => ExternKind::Memory,
            ImportDescriptor::Global(_) => ExternKind::Global,
            ImportDescriptor::Tag(_) => ExternKind::Tag,
        }
    }
}

/// An import declaration.
#[derive(Clone, Debug)]
pub struct Import {
    /// Name of the module to import from.
    pub module: Box<str>,
    /// Name of the imported entity.
    pub field: Box<str>,
    /// Type of the imported entity.
    pub descriptor: ImportDescriptor,
}

/// Describes what kind of entity is being exported.
#[derive(Clone, Copy, Debug)]
pub enum ExportDescriptor {
    Function(FuncIdx),
    Table(TableIdx),
    Memory(MemIdx),
    Global(GlobalIdx),
    Tag(TagIdx),
}

impl ExportDescriptor {
    pub fn kind(&self) -> ExternKind {
        match self {
            ExportDescriptor::Function(_) => ExternKind::Function,
            ExportDescriptor::Table(_) => ExternKind::Table,
            ExportDescriptor::Memory(_) => ExternKind::Memory,
            ExportDescriptor::Global(_) => ExternKind::Global,
            ExportDescriptor::Tag(_) => ExternKind::Tag,
        }
    }
}

/// An export declaration.
#[derive(Clone, Debug)]
pub struct Export {
    /// Name of the exported entity.
    pub field: Box<str>,
    /// Type and index of the exported entity.
    pub descriptor: ExportDescriptor,
}

/// A global declaration.
#[derive(Clone, Debug)]
pub struct Global {
    /// Global type and mutability.
    pub ty: GlobalType,
    /// Initialization expression.
    pub init: ConstExpr,
}

/// The initialization data for an element segment.
#[derive(Clone, Debug)]
pub enum ElementInit {
    /// Element segment contains function indices.
    FunctionIndices(Vec<FuncIdx>),
    /// Element segment contains initialization expressions.
    Expressions(Vec<ConstExpr>),
}

impl ElementInit {
    pub fn len(&self) -> usize {
        match self {
            ElementInit::FunctionIndices(v) => v.len(),
            ElementInit::Expressions(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Element segment mode.
#[derive(Clone, Debug)]
pub enum ElementMode {
    Passive,
    Active { table: TableIdx, offset: ConstExpr },
    Declarative,
}

/// WebAssembly element segment.
#[derive(Clone, Debug)]
pub struct ElementSegment {
    /// The type of references this element segment contains.
    pub ty: RefType,
    /// The initial values for the element segment.
    pub init: ElementInit,
    /// How this element segment should be placed.
    pub mode: ElementMode,
}

/// The placement mode for a data segment.
#[derive(Clone, Debug)]
pub enum DataMode {
    /// Must be explicitly copied via memory.init.
    Passive,
    /// Automatically copied to memory during instantiation.
    Active { memory: MemIdx, offset: ConstExpr },
}

/// A data segment for initializing linear memory.
#[derive(Clone, Debug)]
pub struct DataSegment {
    /// The initial data bytes for this segment.
    pub init: Box<[u8]>,
    /// How this data segment should be placed.
    pub mode: DataMode,
}

/// A function body: compressed locals declarations plus raw bytecode.
#[derive(Clone, Debug)]
pub struct FuncBody {
    /// Local variable declarations (count, type), parameters excluded.
    pub locals: Vec<(u32, ValType)>,
    /// The body expression's bytecode, terminator `end` included.
    pub bytecode: Box<[u8]>,
    /// Byte offset of the body within the original module, for error
    /// reporting and deopt attribution.
    pub offset: usize,
}

impl FuncBody {
    /// The total number of declared locals (parameters excluded).
    pub fn local_count(&self) -> u64 {
        self.locals.iter().map(|&(n, _)| u64::from(n)).sum()
    }
}

/// A branch hint for one instruction: byte offset relative to the function
/// body and whether the branch is likely taken.
#[derive(Clone, Copy, Debug)]
pub struct BranchHint {
    pub offset: u32,
    pub likely: bool,
}

/// An immutable decoded module record.
///
/// Index spaces (functions, tables, memories, globals, tags) list imports
/// first, followed by module-local definitions.
#[derive(Debug, Default)]
pub struct ModuleInner {
    /// Type section, rec groups flattened.
    pub types: Vec<SubType>,
    /// Canonical fingerprint per type index; structurally equivalent
    /// recursive groups map to equal fingerprints.
    pub type_fingerprints: Vec<u64>,
    pub imports: Vec<Import>,
    /// Type index of every function in the index space (imports first).
    pub functions: Vec<TypeIdx>,
    pub tables: Vec<TableType>,
    /// Initializer expressions for locally-defined tables declared with an
    /// explicit init, parallel to the tail of `tables`.
    pub table_inits: Vec<Option<ConstExpr>>,
    pub memories: Vec<MemoryType>,
    pub tags: Vec<TagType>,
    /// The global type of every global in the index space (imports first).
    pub global_types: Vec<GlobalType>,
    /// Locally-defined globals, parallel to the tail of `global_types`.
    pub globals: Vec<Global>,
    pub exports: Vec<Export>,
    pub start: Option<FuncIdx>,
    pub elements: Vec<ElementSegment>,
    pub datas: Vec<DataSegment>,
    pub data_count: Option<u32>,
    /// Bodies of module-local functions, parallel to the tail of
    /// `functions` past `num_imported_functions`.
    pub code: Vec<FuncBody>,
    /// Branch hints per local function index, sorted by offset.
    pub branch_hints: HashMap<u32, Vec<BranchHint>>,

    pub num_imported_functions: usize,
    pub num_imported_tables: usize,
    pub num_imported_memories: usize,
    pub num_imported_globals: usize,
    pub num_imported_tags: usize,
}

impl ModuleInner {
    /// The function type of the function at `idx` in the function index
    /// space.
    ///
    /// # Panics
    /// If `idx` is out of bounds or its type is not a function type; both
    /// are ruled out by validation.
    pub fn func_type(&self, idx: FuncIdx) -> &FuncType {
        let type_idx = self.functions[usize::from(idx)];
        self.types[usize::from(type_idx)]
            .as_func()
            .expect("function declarations reference function types")
    }

    /// The table type at `idx` in the table index space.
    pub fn table_type(&self, idx: TableIdx) -> &TableType {
        &self.tables[usize::from(idx)]
    }

    /// The memory type at `idx` in the memory index space.
    pub fn memory_type(&self, idx: MemIdx) -> &MemoryType {
        &self.memories[usize::from(idx)]
    }

    /// The global type at `idx` in the global index space.
    pub fn global_type(&self, idx: GlobalIdx) -> GlobalType {
        self.global_types[usize::from(idx)]
    }

    /// Whether two type indices are structurally equivalent, via canonical
    /// rec-group fingerprints.
    pub fn types_match(&self, a: TypeIdx, b: TypeIdx) -> bool {
        a == b || self.type_fingerprints[usize::from(a)] == self.type_fingerprints[usize::from(b)]
    }

    /// Computes canonical fingerprints for every type. Within a rec group, a
    /// type's fingerprint combines the group's structural hash with the
    /// type's position, so structural equivalence becomes integer equality.
    pub fn canonicalize_types(&mut self) {
        self.type_fingerprints.clear();
        self.type_fingerprints.reserve(self.types.len());
        let mut idx = 0usize;
        while idx < self.types.len() {
            let group_start = self.types[idx].rec_group_start as usize;
            let group_len = self.types[idx].rec_group_len.max(1) as usize;
            debug_assert_eq!(group_start, idx);

            let mut hasher = DefaultHasher::new();
            group_len.hash(&mut hasher);
            for member in &self.types[group_start..group_start + group_len] {
                hash_subtype(
                    member,
                    group_start as u32,
                    &self.type_fingerprints,
                    &mut hasher,
                );
            }
            let group_hash = hasher.finish();

            for position in 0..group_len {
                let mut h = DefaultHasher::new();
                group_hash.hash(&mut h);
                position.hash(&mut h);
                self.type_fingerprints.push(h.finish());
            }
            idx += group_len;
        }
    }
}

// Hashes one rec-group member structurally. References to types inside the
// group hash as relative positions; references to earlier types hash as
// their already-canonical fingerprints, making equivalent groups hash
// identically.
fn hash_subtype(
    sub: &SubType,
    group_start: u32,
    prior_fingerprints: &[u64],
    hasher: &mut DefaultHasher,
) {
    let hash_type_ref = |idx: TypeIdx, hasher: &mut DefaultHasher| {
        if *idx >= group_start {
            0u8.hash(hasher);
            (*idx - group_start).hash(hasher);
        } else {
            1u8.hash(hasher);
            prior_fingerprints[usize::from(idx)].hash(hasher);
        }
    };
    let hash_heap = |heap: HeapType, hasher: &mut DefaultHasher| match heap {
        HeapType::Concrete(idx) => {
            255u8.hash(hasher);
            hash_type_ref(idx, hasher);
        }
        other => {
            core::mem::discriminant(&other).hash(hasher);
        }
    };
    let hash_val = |ty: ValType, hasher: &mut DefaultHasher| match ty {
        ValType::Ref(rt) => {
            5u8.hash(hasher);
            rt.nullable.hash(hasher);
            hash_heap(rt.heap, hasher);
        }
        other => core::mem::discriminant(&other).hash(hasher),
    };
    let hash_field = |f: &FieldType, hasher: &mut DefaultHasher| {
        f.mutable.hash(hasher);
        match f.storage {
            StorageType::I8 => 8u8.hash(hasher),
            StorageType::I16 => 16u8.hash(hasher),
            StorageType::Val(ty) => {
                0u8.hash(hasher);
                hash_val(ty, hasher);
            }
        }
    };

    sub.is_final.hash(hasher);
    sub.supertypes.len().hash(hasher);
    for &sup in &sub.supertypes {
        hash_type_ref(sup, hasher);
    }
    match &sub.composite {
        CompositeType::Func(ft) => {
            0u8.hash(hasher);
            ft.params.len().hash(hasher);
            for &p in &ft.params {
                hash_val(p, hasher);
            }
            ft.results.len().hash(hasher);
            for &r in &ft.results {
                hash_val(r, hasher);
            }
        }
        CompositeType::Struct(fields) => {
            1u8.hash(hasher);
            fields.len().hash(hasher);
            for f in fields {
                hash_field(f, hasher);
            }
        }
        CompositeType::Array(f) => {
            2u8.hash(hasher);
            hash_field(f, hasher);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn func_subtype(params: Vec<ValType>, results: Vec<ValType>, start: u32) -> SubType {
        SubType {
            is_final: true,
            supertypes: Vec::new(),
            composite: CompositeType::Func(FuncType { params, results }),
            rec_group_start: start,
            rec_group_len: 1,
        }
    }

    #[test]
    fn section_order_handles_tag_and_datacount() {
        assert!(SectionId::Memory < SectionId::Tag);
        assert!(SectionId::Tag < SectionId::Global);
        assert!(SectionId::DataCount < SectionId::Code);
        assert!(SectionId::Code < SectionId::Data);
        assert!(SectionId::Type < SectionId::Import);
    }

    #[test]
    fn structurally_equal_types_share_fingerprints() {
        let mut module = ModuleInner {
            types: vec![
                func_subtype(vec![ValType::I32], vec![ValType::I32], 0),
                func_subtype(vec![ValType::I64], vec![], 1),
                func_subtype(vec![ValType::I32], vec![ValType::I32], 2),
            ],
            ..Default::default()
        };
        module.canonicalize_types();

        assert!(module.types_match(TypeIdx::new(0), TypeIdx::new(2)));
        assert!(!module.types_match(TypeIdx::new(0), TypeIdx::new(1)));
    }

    #[test]
    fn limits_fit() {
        let narrow = Limits {
            min: 2,
            max: Some(4),
        };
        let wide = Limits { min: 1, max: None };
        assert!(narrow.fits_within(&wide));
        assert!(!wide.fits_within(&narrow));
    }
}
