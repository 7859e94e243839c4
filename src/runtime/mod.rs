// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Runtime structures: values, traps, the store, and instantiation.
//!
//! A [`Store`] is an arena-like container of addresses for functions,
//! memories, tables, globals, tags, and GC objects; addresses are opaque
//! indices and every runtime reference resolves through it. An
//! [`Instance`] is the mutable projection of a decoded module: its store
//! plus resolved imports and export lookup. Store lifetime equals instance
//! lifetime.

pub(crate) mod memory;

use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use bitflags::bitflags;
use thiserror::Error;
use tracing::debug;

use crate::pir::PirFunction;
use crate::rir::RirFunction;
use crate::types::{
    ConstExpr, DataMode, ElementInit, ElementMode, ExportDescriptor, ExternKind, FuncType,
    ImportDescriptor, ModuleInner, Opcode, StorageType, TableType, TagType, TypeIdx, ValType,
};
use crate::decode::body::{Inst, InstDecoder};
use memory::LinearMemory;

/// The maximum call depth, enforced at function entry on every tier.
pub const MAX_CALL_DEPTH: usize = 1024;
/// Operand stack capacity, in 64-bit slots.
pub const OPERAND_STACK_SLOTS: usize = 4096;
/// Label stack capacity.
pub const LABEL_STACK_SLOTS: usize = 4096;

/// The reason an execution trapped. Engine traps (everything but
/// `WasmException`) are not catchable by Wasm code.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TrapKind {
    #[error("unreachable executed")]
    Unreachable,
    #[error("integer division by zero")]
    DivisionByZero,
    #[error("integer overflow")]
    IntegerOverflow,
    #[error("invalid conversion to integer")]
    InvalidConversion,
    #[error("out of bounds memory access")]
    OutOfBoundsMemoryAccess,
    #[error("undefined table element")]
    UndefinedElement,
    #[error("indirect call signature mismatch")]
    MismatchedSignatures,
    #[error("call stack exhausted")]
    StackOverflow,
    #[error("memory limit exceeded")]
    MemoryLimitExceeded,
    #[error("table limit exceeded")]
    TableLimitExceeded,
    #[error("fuel exhausted")]
    FuelExhausted,
    #[error("execution interrupted")]
    Interrupted,
    #[error("atomic wait on unshared memory")]
    AtomicWaitUnshared,
    #[error("null reference")]
    NullReference,
    #[error("cast failure")]
    CastFailure,
    #[error("instruction unsupported by this build")]
    UnsupportedInstruction,
    #[error("uncaught wasm exception")]
    WasmException {
        /// Encoded exception reference; resolve through
        /// [`Instance::exception_tag`] / [`Instance::exception_payload`].
        exn: u64,
    },
    #[error("host error: {0}")]
    HostError(Arc<str>),
}

/// A trap, with the function index and byte offset of the faulting
/// instruction where attributable.
#[derive(Clone, Debug, Error, PartialEq)]
#[error("{kind}{}", location_suffix(.func, .offset))]
pub struct Trap {
    pub kind: TrapKind,
    pub func: Option<u32>,
    pub offset: Option<u32>,
}

fn location_suffix(func: &Option<u32>, offset: &Option<u32>) -> String {
    match (func, offset) {
        (Some(func), Some(offset)) => format!(" (function {func} at byte {offset:#x})"),
        (Some(func), None) => format!(" (function {func})"),
        _ => String::new(),
    }
}

impl Trap {
    pub(crate) fn plain(kind: TrapKind) -> Self {
        Self {
            kind,
            func: None,
            offset: None,
        }
    }
}

impl From<TrapKind> for Trap {
    fn from(kind: TrapKind) -> Self {
        Trap::plain(kind)
    }
}

/// Errors that can arise while instantiating a module.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("missing import {module}::{name}")]
    MissingImport { module: String, name: String },
    #[error("import {module}::{name} has the wrong kind (expected {expected:?})")]
    ImportKindMismatch {
        module: String,
        name: String,
        expected: ExternKind,
    },
    #[error("import {module}::{name} has an incompatible type")]
    ImportTypeMismatch { module: String, name: String },
    #[error("active segment out of bounds")]
    SegmentOutOfBounds,
    #[error("constant expression failed to evaluate")]
    BadConstExpr,
    #[error("resource allocation failed: {0}")]
    Allocation(TrapKind),
    #[error("start function trapped: {0}")]
    StartTrap(Trap),
}

/// A WebAssembly value, as seen by the embedder.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Value {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    V128(u128),
    /// A function reference: a store function address, or null.
    FuncRef(Option<u32>),
    /// An external reference: an embedder-supplied 60-bit handle, or null.
    ExternRef(Option<u64>),
}

impl Value {
    pub fn ty(&self) -> ValType {
        match self {
            Value::I32(_) => ValType::I32,
            Value::I64(_) => ValType::I64,
            Value::F32(_) => ValType::F32,
            Value::F64(_) => ValType::F64,
            Value::V128(_) => ValType::V128,
            Value::FuncRef(_) => ValType::FUNCREF,
            Value::ExternRef(_) => ValType::EXTERNREF,
        }
    }
}

/// Encoding of reference values into 64-bit operand slots.
///
/// Null is all-zeros. Otherwise the low three bits carry an address tag and
/// the payload sits above: i31 payloads, store function addresses, GC arena
/// indices, exception arena indices, or embedder handles.
pub(crate) mod refenc {
    pub(crate) const NULL: u64 = 0;

    const TAG_MASK: u64 = 0b111;
    pub(crate) const TAG_I31: u64 = 0b001;
    pub(crate) const TAG_FUNC: u64 = 0b010;
    pub(crate) const TAG_EXTERN: u64 = 0b011;
    pub(crate) const TAG_GC: u64 = 0b100;
    pub(crate) const TAG_EXN: u64 = 0b101;

    pub(crate) fn is_null(bits: u64) -> bool {
        bits == NULL
    }

    pub(crate) fn tag(bits: u64) -> u64 {
        bits & TAG_MASK
    }

    pub(crate) fn payload(bits: u64) -> u64 {
        bits >> 3
    }

    pub(crate) fn func(addr: u32) -> u64 {
        (u64::from(addr) << 3) | TAG_FUNC
    }

    pub(crate) fn extern_handle(handle: u64) -> u64 {
        (handle << 3) | TAG_EXTERN
    }

    pub(crate) fn gc(index: usize) -> u64 {
        ((index as u64) << 3) | TAG_GC
    }

    pub(crate) fn exn(index: usize) -> u64 {
        ((index as u64) << 3) | TAG_EXN
    }

    /// i31: the 31-bit payload is stored sign-preserving above the tag.
    pub(crate) fn i31(value: i32) -> u64 {
        ((value as u32 & 0x7fff_ffff) as u64) << 3 | TAG_I31
    }

    pub(crate) fn i31_get_s(bits: u64) -> i32 {
        let raw = (payload(bits) as u32) & 0x7fff_ffff;
        // Sign-extend from 31 bits.
        ((raw << 1) as i32) >> 1
    }

    pub(crate) fn i31_get_u(bits: u64) -> i32 {
        ((payload(bits) as u32) & 0x7fff_ffff) as i32
    }
}

/// Tier progression of one function. `InterpreterPinned` marks a failed
/// compile; it is never retried.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) enum TierState {
    #[default]
    Interpreter,
    Compiling,
    Native,
    InterpreterPinned,
}

#[derive(Clone, Copy)]
pub(crate) enum FuncKind {
    /// A module-local function; the index is into the module's bodies.
    Wasm { body_index: u32 },
    /// A host function, resolved at instantiation.
    Host { host_index: u32 },
}

/// One function in the store, with its lazily-built tier caches.
pub(crate) struct FunctionEntity {
    pub kind: FuncKind,
    pub type_idx: TypeIdx,
    /// Canonical signature fingerprint, for call_indirect checks.
    pub fingerprint: u64,
    pub tier: TierState,
    pub call_count: u32,
    pub backedge_count: u32,
    pub pir: Option<Rc<PirFunction>>,
    pub rir: Option<Rc<RirFunction>>,
    pub jit: Option<Arc<crate::jit::JitCode>>,
}

impl FunctionEntity {
    fn new(kind: FuncKind, type_idx: TypeIdx, fingerprint: u64) -> Self {
        Self {
            kind,
            type_idx,
            fingerprint,
            tier: TierState::default(),
            call_count: 0,
            backedge_count: 0,
            pir: None,
            rir: None,
            jit: None,
        }
    }
}

pub(crate) struct Table {
    pub ty: TableType,
    max: u64,
    pub elems: Vec<u64>,
}

impl Table {
    pub(crate) fn new(ty: TableType, init: u64) -> Self {
        Self {
            ty,
            max: ty.limits.max.unwrap_or(u64::MAX),
            elems: vec![init; ty.limits.min as usize],
        }
    }

    pub(crate) fn size(&self) -> u64 {
        self.elems.len() as u64
    }

    pub(crate) fn get(&self, index: u64) -> Result<u64, TrapKind> {
        self.elems
            .get(index as usize)
            .copied()
            .ok_or(TrapKind::UndefinedElement)
    }

    pub(crate) fn set(&mut self, index: u64, value: u64) -> Result<(), TrapKind> {
        let slot = self
            .elems
            .get_mut(index as usize)
            .ok_or(TrapKind::UndefinedElement)?;
        *slot = value;
        Ok(())
    }

    /// Returns the previous size, or None on failure (translated to -1 by
    /// the caller).
    pub(crate) fn grow(&mut self, delta: u64, init: u64) -> Option<u64> {
        let prior = self.size();
        let new = prior.checked_add(delta)?;
        if new > self.max || new > u32::MAX as u64 {
            return None;
        }
        self.elems.resize(new as usize, init);
        Some(prior)
    }

    pub(crate) fn fill(&mut self, start: u64, value: u64, len: u64) -> Result<(), TrapKind> {
        let end = start.checked_add(len).ok_or(TrapKind::UndefinedElement)?;
        if end > self.size() {
            return Err(TrapKind::UndefinedElement);
        }
        self.elems[start as usize..end as usize].fill(value);
        Ok(())
    }
}

/// A GC heap object. Packed i8/i16 array storage is widened into slots;
/// values are masked at write time.
pub(crate) enum GcObject {
    Struct {
        type_idx: u32,
        fields: Vec<u64>,
    },
    Array {
        type_idx: u32,
        storage: StorageType,
        elems: Vec<u64>,
    },
}

/// An exception object: a tag address plus its payload slots.
pub(crate) struct ExnObject {
    pub tag: u32,
    pub payload: Vec<u64>,
}

pub(crate) struct GlobalEntity {
    pub ty: ValType,
    pub value: [u64; 2],
}

pub(crate) struct TagEntity {
    pub type_idx: TypeIdx,
    pub param_slots: u32,
}

/// Arena-like container of runtime addresses. Everything the executing
/// instruction stream touches resolves through here.
#[derive(Default)]
pub(crate) struct Store {
    pub functions: Vec<FunctionEntity>,
    pub memories: Vec<LinearMemory>,
    pub tables: Vec<Table>,
    pub globals: Vec<GlobalEntity>,
    pub tags: Vec<TagEntity>,
    pub gc: Vec<GcObject>,
    pub exceptions: Vec<ExnObject>,
    /// Data segment instances; None once dropped.
    pub datas: Vec<Option<Box<[u8]>>>,
    /// Element segment instances as encoded references; None once dropped.
    pub elems: Vec<Option<Vec<u64>>>,
}

/// The context passed to a host function for the duration of one call. Host
/// functions must not retain it; the borrow makes that structural.
pub struct HostContext<'a> {
    /// Arguments, in declaration order.
    pub args: &'a [Value],
    /// Result values; push exactly the declared results.
    pub results: &'a mut Vec<Value>,
    /// The integer context tag registered with the function.
    pub tag: u32,
    /// A view of memory 0, when the instance has one.
    pub memory: Option<LinearMemoryView<'a>>,
}

/// A bounds-checked window over a linear memory handed to host functions.
pub struct LinearMemoryView<'a> {
    pub(crate) memory: &'a mut LinearMemory,
}

impl LinearMemoryView<'_> {
    pub fn len(&self) -> usize {
        self.memory.byte_size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>, Trap> {
        self.memory.read(offset, len).map_err(Trap::plain)
    }

    pub fn write(&mut self, offset: u64, bytes: &[u8]) -> Result<(), Trap> {
        self.memory.write(offset, bytes).map_err(Trap::plain)
    }
}

/// A function supplied by the embedder. It consumes its declared parameters
/// and pushes its declared results; returning an error surfaces as a trap
/// to the Wasm caller.
pub trait HostFunc {
    fn call(&mut self, ctx: &mut HostContext<'_>) -> Result<(), String>;
}

impl<F> HostFunc for F
where
    F: FnMut(&mut HostContext<'_>) -> Result<(), String>,
{
    fn call(&mut self, ctx: &mut HostContext<'_>) -> Result<(), String> {
        self(ctx)
    }
}

/// An importable entity.
pub enum Extern {
    Func {
        func: Box<dyn HostFunc>,
        /// Context tag passed through to every call.
        tag: u32,
    },
    Global(Value),
    /// A fresh memory of the declared type is allocated for the instance.
    Memory,
    /// A fresh table of the declared type is allocated for the instance.
    Table,
    /// A fresh tag identity is minted for the instance.
    Tag,
}

/// The import set handed to instantiation.
#[derive(Default)]
pub struct Imports {
    entries: HashMap<(String, String), Extern>,
}

impl Imports {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define(&mut self, module: &str, name: &str, value: Extern) -> &mut Self {
        self.entries
            .insert((module.to_string(), name.to_string()), value);
        self
    }

    pub fn define_func(
        &mut self,
        module: &str,
        name: &str,
        func: impl HostFunc + 'static,
    ) -> &mut Self {
        self.define(
            module,
            name,
            Extern::Func {
                func: Box::new(func),
                tag: 0,
            },
        )
    }

    fn take(&mut self, module: &str, name: &str) -> Option<Extern> {
        self.entries
            .remove(&(module.to_string(), name.to_string()))
    }
}

bitflags! {
    /// Capability flags forwarded to the (out-of-scope) system-interface
    /// collaborator. The engine itself consults none of them.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct Capabilities: u32 {
        const FS_READ = 1 << 0;
        const FS_WRITE = 1 << 1;
        const ENV = 1 << 2;
        const NETWORK = 1 << 3;
        const CLOCK = 1 << 4;
    }
}

/// Instantiation options.
pub struct Options {
    /// Fuel ceiling; None disables metering.
    pub fuel: Option<u64>,
    /// Per-memory byte ceiling, applied below each memory's declared max.
    pub memory_ceiling: Option<u64>,
    pub capabilities: Capabilities,
    /// Preopened directories for the system-interface collaborator.
    pub preopens: Vec<PathBuf>,
    /// Environment map for the system-interface collaborator.
    pub env: HashMap<String, String>,
    pub tier: crate::jit::TierConfig,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            fuel: None,
            memory_ceiling: None,
            capabilities: Capabilities::empty(),
            preopens: Vec::new(),
            env: HashMap::new(),
            tier: crate::jit::TierConfig::default(),
        }
    }
}

pub(crate) struct HostSlot {
    pub func: Box<dyn HostFunc>,
    pub tag: u32,
    pub ty: FuncType,
}

/// An instantiated module, ready to execute.
pub struct Instance {
    pub(crate) module: Arc<ModuleInner>,
    pub(crate) store: Store,
    pub(crate) host_funcs: Vec<HostSlot>,
    pub(crate) exports: HashMap<String, ExportDescriptor>,
    pub(crate) interrupt: Arc<AtomicBool>,
    /// Remaining fuel; i64::MAX when metering is disabled.
    pub(crate) fuel: i64,
    pub(crate) fuel_enabled: bool,
    pub(crate) tier: crate::jit::TierConfig,
    /// Reusable execution stacks.
    pub(crate) exec: crate::interp::ExecState,
    /// A trap parked by a JIT helper for the native exit path.
    pub(crate) pending_trap: Option<Trap>,
    /// Native frames invisible to the interpreter's frame stack, counted
    /// toward the call-depth bound while re-entered from JIT code.
    pub(crate) depth_bias: u32,
    #[allow(dead_code)]
    pub(crate) capabilities: Capabilities,
    #[allow(dead_code)]
    pub(crate) preopens: Vec<PathBuf>,
    #[allow(dead_code)]
    pub(crate) env: HashMap<String, String>,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance").finish_non_exhaustive()
    }
}

impl Instance {
    /// Instantiates `module` with the given imports and options: allocates
    /// memories, tables, globals, and tags, runs init expressions, applies
    /// active segments, and executes the start function.
    pub fn instantiate(
        module: &crate::Module,
        mut imports: Imports,
        options: Options,
    ) -> Result<Self, LinkError> {
        let inner = module.inner().clone();
        let mut store = Store::default();
        let mut host_funcs = Vec::new();

        // Imports resolve in declaration order, so store addresses line up
        // with module index spaces.
        for import in &inner.imports {
            let found = imports.take(&import.module, &import.field);
            let found = found.ok_or_else(|| LinkError::MissingImport {
                module: import.module.to_string(),
                name: import.field.to_string(),
            })?;
            let mismatch = |expected| LinkError::ImportKindMismatch {
                module: import.module.to_string(),
                name: import.field.to_string(),
                expected,
            };
            match (&import.descriptor, found) {
                (ImportDescriptor::Function(ty), Extern::Func { func, tag }) => {
                    let sig = inner.types[usize::from(*ty)]
                        .as_func()
                        .expect("validated import type")
                        .clone();
                    let host_index = host_funcs.len() as u32;
                    host_funcs.push(HostSlot {
                        func,
                        tag,
                        ty: sig,
                    });
                    store.functions.push(FunctionEntity::new(
                        FuncKind::Host { host_index },
                        *ty,
                        inner.type_fingerprints[usize::from(*ty)],
                    ));
                }
                (ImportDescriptor::Function(_), _) => {
                    return Err(mismatch(ExternKind::Function));
                }
                (ImportDescriptor::Global(ty), Extern::Global(value)) => {
                    if value.ty() != ty.value {
                        return Err(LinkError::ImportTypeMismatch {
                            module: import.module.to_string(),
                            name: import.field.to_string(),
                        });
                    }
                    store.globals.push(GlobalEntity {
                        ty: ty.value,
                        value: value_to_slots(value),
                    });
                }
                (ImportDescriptor::Global(_), _) => return Err(mismatch(ExternKind::Global)),
                (ImportDescriptor::Memory(ty), Extern::Memory) => {
                    let memory = LinearMemory::new(*ty, options.memory_ceiling)
                        .map_err(LinkError::Allocation)?;
                    store.memories.push(memory);
                }
                (ImportDescriptor::Memory(_), _) => return Err(mismatch(ExternKind::Memory)),
                (ImportDescriptor::Table(ty), Extern::Table) => {
                    store.tables.push(Table::new(*ty, refenc::NULL));
                }
                (ImportDescriptor::Table(_), _) => return Err(mismatch(ExternKind::Table)),
                (ImportDescriptor::Tag(TagType { ty }), Extern::Tag) => {
                    store.tags.push(new_tag(&inner, *ty));
                }
                (ImportDescriptor::Tag(_), _) => return Err(mismatch(ExternKind::Tag)),
            }
        }

        // Locally-defined entities.
        for (i, &type_idx) in inner
            .functions
            .iter()
            .enumerate()
            .skip(inner.num_imported_functions)
        {
            let body_index = (i - inner.num_imported_functions) as u32;
            store.functions.push(FunctionEntity::new(
                FuncKind::Wasm { body_index },
                type_idx,
                inner.type_fingerprints[usize::from(type_idx)],
            ));
        }
        for ty in inner.memories.iter().skip(inner.num_imported_memories) {
            let memory =
                LinearMemory::new(*ty, options.memory_ceiling).map_err(LinkError::Allocation)?;
            store.memories.push(memory);
        }
        for tag in inner.tags.iter().skip(inner.num_imported_tags) {
            store.tags.push(new_tag(&inner, tag.ty));
        }
        for global in &inner.globals {
            let slots = eval_const(&store, &global.init)?;
            store.globals.push(GlobalEntity {
                ty: global.ty.value,
                value: slots,
            });
        }
        for (i, ty) in inner
            .tables
            .iter()
            .enumerate()
            .skip(inner.num_imported_tables)
        {
            let init = match &inner.table_inits[i - inner.num_imported_tables] {
                Some(expr) => eval_const(&store, expr)?[0],
                None => refenc::NULL,
            };
            store.tables.push(Table::new(*ty, init));
        }

        // Element segments.
        for segment in &inner.elements {
            let refs: Vec<u64> = match &segment.init {
                ElementInit::FunctionIndices(indices) => {
                    indices.iter().map(|idx| refenc::func(**idx)).collect()
                }
                ElementInit::Expressions(exprs) => {
                    let mut refs = Vec::with_capacity(exprs.len());
                    for expr in exprs {
                        refs.push(eval_const(&store, expr)?[0]);
                    }
                    refs
                }
            };
            match &segment.mode {
                ElementMode::Active { table, offset } => {
                    let at = eval_const(&store, offset)?[0];
                    let table = &mut store.tables[usize::from(*table)];
                    let end = at
                        .checked_add(refs.len() as u64)
                        .ok_or(LinkError::SegmentOutOfBounds)?;
                    if end > table.size() {
                        return Err(LinkError::SegmentOutOfBounds);
                    }
                    table.elems[at as usize..end as usize].copy_from_slice(&refs);
                    store.elems.push(None);
                }
                ElementMode::Passive => store.elems.push(Some(refs)),
                ElementMode::Declarative => store.elems.push(None),
            }
        }

        // Data segments.
        for segment in &inner.datas {
            match &segment.mode {
                DataMode::Active { memory, offset } => {
                    let at = eval_const(&store, offset)?[0];
                    let memory = &mut store.memories[usize::from(*memory)];
                    memory
                        .init(at, &segment.init, 0, segment.init.len() as u64)
                        .map_err(|_| LinkError::SegmentOutOfBounds)?;
                    store.datas.push(None);
                }
                DataMode::Passive => store.datas.push(Some(segment.init.clone())),
            }
        }

        let exports = inner
            .exports
            .iter()
            .map(|export| (export.field.to_string(), export.descriptor))
            .collect();

        let mut instance = Instance {
            module: inner,
            store,
            host_funcs,
            exports,
            interrupt: Arc::new(AtomicBool::new(false)),
            fuel: options.fuel.map_or(i64::MAX, |f| f.min(i64::MAX as u64) as i64),
            fuel_enabled: options.fuel.is_some(),
            tier: options.tier,
            exec: crate::interp::ExecState::new(),
            pending_trap: None,
            depth_bias: 0,
            capabilities: options.capabilities,
            preopens: options.preopens,
            env: options.env,
        };
        debug!(
            functions = instance.store.functions.len(),
            memories = instance.store.memories.len(),
            "instantiated module"
        );

        if let Some(start) = instance.module.start {
            crate::interp::call_function(&mut instance, *start, &[], &mut Vec::new())
                .map_err(LinkError::StartTrap)?;
        }
        Ok(instance)
    }

    /// Invokes an exported function. `results` is cleared and filled with
    /// the declared results on success.
    pub fn invoke(
        &mut self,
        name: &str,
        args: &[Value],
        results: &mut Vec<Value>,
    ) -> Result<(), Trap> {
        let Some(ExportDescriptor::Function(idx)) = self.exports.get(name).copied() else {
            return Err(Trap::plain(TrapKind::UndefinedElement));
        };
        crate::interp::call_function(self, *idx, args, results)
    }

    /// Reads bytes from an instance memory.
    pub fn memory_read(&self, memory: u32, offset: u64, len: usize) -> Result<Vec<u8>, Trap> {
        let memory = self
            .store
            .memories
            .get(memory as usize)
            .ok_or_else(|| Trap::plain(TrapKind::OutOfBoundsMemoryAccess))?;
        memory.read(offset, len).map_err(Trap::plain)
    }

    /// Writes bytes into an instance memory.
    pub fn memory_write(&mut self, memory: u32, offset: u64, bytes: &[u8]) -> Result<(), Trap> {
        let memory = self
            .store
            .memories
            .get_mut(memory as usize)
            .ok_or_else(|| Trap::plain(TrapKind::OutOfBoundsMemoryAccess))?;
        memory.write(offset, bytes).map_err(Trap::plain)
    }

    /// Remaining fuel, when metering is enabled.
    pub fn fuel(&self) -> Option<u64> {
        self.fuel_enabled.then_some(self.fuel.max(0) as u64)
    }

    /// Resets the fuel budget (also enables metering).
    pub fn set_fuel(&mut self, fuel: u64) {
        self.fuel_enabled = true;
        self.fuel = fuel.min(i64::MAX as u64) as i64;
    }

    /// A flag that, once set, interrupts execution at the next back-edge or
    /// call entry.
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        self.interrupt.clone()
    }

    /// The tag index an uncaught exception was thrown with.
    pub fn exception_tag(&self, trap: &Trap) -> Option<u32> {
        if let TrapKind::WasmException { exn } = trap.kind {
            let obj = self.store.exceptions.get(refenc::payload(exn) as usize)?;
            Some(obj.tag)
        } else {
            None
        }
    }

    /// The payload slots of an uncaught exception.
    pub fn exception_payload(&self, trap: &Trap) -> Option<Vec<u64>> {
        if let TrapKind::WasmException { exn } = trap.kind {
            let obj = self.store.exceptions.get(refenc::payload(exn) as usize)?;
            Some(obj.payload.clone())
        } else {
            None
        }
    }
}

fn new_tag(inner: &ModuleInner, type_idx: TypeIdx) -> TagEntity {
    let param_slots = inner.types[usize::from(type_idx)]
        .as_func()
        .map_or(0, FuncType::param_slots) as u32;
    TagEntity {
        type_idx,
        param_slots,
    }
}

pub(crate) fn value_to_slots(value: Value) -> [u64; 2] {
    match value {
        Value::I32(v) => [v as u32 as u64, 0],
        Value::I64(v) => [v as u64, 0],
        Value::F32(v) => [u64::from(v.to_bits()), 0],
        Value::F64(v) => [v.to_bits(), 0],
        Value::V128(v) => [v as u64, (v >> 64) as u64],
        Value::FuncRef(None) | Value::ExternRef(None) => [refenc::NULL, 0],
        Value::FuncRef(Some(addr)) => [refenc::func(addr), 0],
        Value::ExternRef(Some(handle)) => [refenc::extern_handle(handle), 0],
    }
}

pub(crate) fn slots_to_value(ty: ValType, lo: u64, hi: u64) -> Value {
    match ty {
        ValType::I32 => Value::I32(lo as u32 as i32),
        ValType::I64 => Value::I64(lo as i64),
        ValType::F32 => Value::F32(f32::from_bits(lo as u32)),
        ValType::F64 => Value::F64(f64::from_bits(lo)),
        ValType::V128 => Value::V128(u128::from(lo) | (u128::from(hi) << 64)),
        ValType::Ref(rt) => {
            if refenc::is_null(lo) {
                match rt.heap {
                    crate::types::HeapType::Extern => Value::ExternRef(None),
                    _ => Value::FuncRef(None),
                }
            } else if refenc::tag(lo) == refenc::TAG_EXTERN {
                Value::ExternRef(Some(refenc::payload(lo)))
            } else {
                Value::FuncRef(Some(refenc::payload(lo) as u32))
            }
        }
    }
}

// Evaluates a constant expression to one value (two slots for v128).
// Validation has already established constness and result type.
fn eval_const(store: &Store, expr: &ConstExpr) -> Result<[u64; 2], LinkError> {
    let mut stack: Vec<u64> = Vec::new();
    let mut wide = false;
    let mut decoder = InstDecoder::new(&expr.bytecode);
    loop {
        let (_, inst) = decoder.next().map_err(|_| LinkError::BadConstExpr)?;
        match inst {
            Inst::I32Const(v) => stack.push(v as u32 as u64),
            Inst::I64Const(v) => stack.push(v as u64),
            Inst::F32Const(v) => stack.push(u64::from(v.to_bits())),
            Inst::F64Const(v) => stack.push(v.to_bits()),
            Inst::Simd {
                sub: 0x0c,
                imm: crate::decode::body::SimdImm::Bytes(bytes),
            } => {
                stack.push(u64::from_le_bytes(bytes[..8].try_into().unwrap()));
                stack.push(u64::from_le_bytes(bytes[8..].try_into().unwrap()));
                wide = true;
            }
            Inst::RefNull(_) => stack.push(refenc::NULL),
            Inst::Index {
                op: Opcode::RefFunc,
                index,
            } => stack.push(refenc::func(index)),
            Inst::Index {
                op: Opcode::GlobalGet,
                index,
            } => {
                let global = store
                    .globals
                    .get(index as usize)
                    .ok_or(LinkError::BadConstExpr)?;
                stack.push(global.value[0]);
                if global.ty == ValType::V128 {
                    stack.push(global.value[1]);
                    wide = true;
                }
            }
            Inst::Simple(op) => match op {
                Opcode::End => break,
                Opcode::I32Add | Opcode::I32Sub | Opcode::I32Mul => {
                    let b = stack.pop().ok_or(LinkError::BadConstExpr)? as u32;
                    let a = stack.pop().ok_or(LinkError::BadConstExpr)? as u32;
                    let v = match op {
                        Opcode::I32Add => a.wrapping_add(b),
                        Opcode::I32Sub => a.wrapping_sub(b),
                        _ => a.wrapping_mul(b),
                    };
                    stack.push(u64::from(v));
                }
                Opcode::I64Add | Opcode::I64Sub | Opcode::I64Mul => {
                    let b = stack.pop().ok_or(LinkError::BadConstExpr)?;
                    let a = stack.pop().ok_or(LinkError::BadConstExpr)?;
                    let v = match op {
                        Opcode::I64Add => a.wrapping_add(b),
                        Opcode::I64Sub => a.wrapping_sub(b),
                        _ => a.wrapping_mul(b),
                    };
                    stack.push(v);
                }
                _ => return Err(LinkError::BadConstExpr),
            },
            _ => return Err(LinkError::BadConstExpr),
        }
    }
    match (stack.len(), wide) {
        (1, false) => Ok([stack[0], 0]),
        (2, true) => Ok([stack[0], stack[1]]),
        _ => Err(LinkError::BadConstExpr),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ref_encoding_round_trips() {
        assert!(refenc::is_null(refenc::NULL));

        let f = refenc::func(42);
        assert!(!refenc::is_null(f));
        assert_eq!(refenc::tag(f), refenc::TAG_FUNC);
        assert_eq!(refenc::payload(f), 42);

        let neg = refenc::i31(-5);
        assert_eq!(refenc::tag(neg), refenc::TAG_I31);
        assert_eq!(refenc::i31_get_s(neg), -5);
        assert_eq!(refenc::i31_get_u(neg), 0x7fff_fffb);

        let pos = refenc::i31(0x3fff_ffff);
        assert_eq!(refenc::i31_get_s(pos), 0x3fff_ffff);
        assert_eq!(refenc::i31_get_u(pos), 0x3fff_ffff);
    }

    #[test]
    fn value_slot_round_trips() {
        let cases = [
            Value::I32(-7),
            Value::I64(i64::MIN),
            Value::F32(1.5),
            Value::F64(-0.0),
            Value::FuncRef(Some(3)),
            Value::FuncRef(None),
            Value::ExternRef(Some(99)),
        ];
        for value in cases {
            let [lo, hi] = value_to_slots(value);
            assert_eq!(slots_to_value(value.ty(), lo, hi), value);
        }

        let v = Value::V128(0x0123_4567_89ab_cdef_fedc_ba98_7654_3210);
        let [lo, hi] = value_to_slots(v);
        assert_eq!(slots_to_value(ValType::V128, lo, hi), v);
    }

    #[test]
    fn table_grow_and_fill() {
        let ty = TableType {
            element: crate::types::RefType::FUNCREF,
            limits: crate::types::Limits {
                min: 2,
                max: Some(4),
            },
            table64: false,
        };
        let mut table = Table::new(ty, refenc::NULL);
        assert_eq!(table.size(), 2);
        assert_eq!(table.grow(1, refenc::func(7)), Some(2));
        assert_eq!(table.get(2).unwrap(), refenc::func(7));
        assert_eq!(table.grow(5, refenc::NULL), None);

        table.fill(0, refenc::func(1), 3).unwrap();
        assert_eq!(table.get(0).unwrap(), refenc::func(1));
        assert_eq!(
            table.fill(2, refenc::NULL, 5).unwrap_err(),
            TrapKind::UndefinedElement
        );
    }
}
