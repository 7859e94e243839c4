// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Tiering and native code.
//!
//! The tier controller counts calls and loop back-edges per function; on a
//! threshold crossing the function's register form is handed to the
//! architecture backend, the emitted bytes are installed in a W^X code
//! buffer, and the entry pointer is cached for future calls. A failed
//! compile discards the buffer entirely and pins the function to the
//! interpreter; it is never retried.
//!
//! Native code runs over a small C-ABI context: arguments and results live
//! at `frame_base` (a slice of the shared operand stack), the linear-memory
//! base and size are bound into reserved registers by the prologue, and
//! anything the backend does not inline (cross-function calls, memory
//! growth, global access) goes through the `helper_*` trampolines, which
//! re-enter the interpreter driver above the current frame floor.

pub(crate) mod fault;

#[cfg(target_arch = "aarch64")]
mod arm64;
#[cfg(target_arch = "x86_64")]
mod x86_64;

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, trace};

use crate::interp::ExecState;
use crate::rir::RirFunction;
use crate::rir::regalloc::{self, Allocation};
use crate::runtime::{Instance, TierState, Trap, TrapKind};

/// Tiering thresholds and switches.
#[derive(Clone, Copy, Debug)]
pub struct TierConfig {
    /// Calls before a function is scheduled for compilation.
    pub call_threshold: u32,
    /// Loop back-edges before a function is scheduled for compilation.
    pub backedge_threshold: u32,
    pub enable_jit: bool,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            call_threshold: 8,
            backedge_threshold: 1000,
            enable_jit: cfg!(any(target_arch = "x86_64", target_arch = "aarch64")),
        }
    }
}

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub(crate) enum CompileError {
    #[error("construct unsupported by the native backend")]
    Unsupported,
    #[error("code buffer allocation failed")]
    Alloc,
}

// Status codes returned by native entries and helpers. Zero is success;
// TRAP_PENDING means the full trap was parked on the instance.
pub(crate) const TRAP_UNREACHABLE: i64 = 1;
pub(crate) const TRAP_DIV_ZERO: i64 = 2;
pub(crate) const TRAP_INT_OVERFLOW: i64 = 3;
pub(crate) const TRAP_OOB: i64 = 5;
pub(crate) const TRAP_STACK_OVERFLOW: i64 = 6;
pub(crate) const TRAP_FUEL: i64 = 7;
pub(crate) const TRAP_PENDING: i64 = 8;

fn trap_kind_of_code(code: i64) -> TrapKind {
    match code {
        TRAP_DIV_ZERO => TrapKind::DivisionByZero,
        TRAP_INT_OVERFLOW => TrapKind::IntegerOverflow,
        TRAP_OOB => TrapKind::OutOfBoundsMemoryAccess,
        TRAP_STACK_OVERFLOW => TrapKind::StackOverflow,
        TRAP_FUEL => TrapKind::FuelExhausted,
        _ => TrapKind::Unreachable,
    }
}

/// The C-ABI context handed to native entries. Field offsets are fixed;
/// the backends embed them as immediates (see the layout test below).
#[repr(C)]
pub(crate) struct JitContext {
    /// 0x00: argument/result slots (a window into the operand stack).
    pub frame_base: *mut u64,
    /// 0x08: linear memory 0 base, refreshed after every helper call.
    pub memory_base: *mut u8,
    /// 0x10: linear memory 0 byte size.
    pub memory_size: u64,
    /// 0x18: the fuel counter.
    pub fuel: *mut i64,
    /// 0x20.
    pub instance: *mut (),
    /// 0x28.
    pub exec: *mut (),
    /// 0x30: call depth including native frames; entries increment it.
    pub depth: u64,
    /// 0x38.
    pub call_helper: usize,
    /// 0x40.
    pub indirect_helper: usize,
    /// 0x48.
    pub grow_helper: usize,
    /// 0x50.
    pub global_get_helper: usize,
    /// 0x58.
    pub global_set_helper: usize,
}

pub(crate) const CTX_FRAME_BASE: u32 = 0x00;
pub(crate) const CTX_MEMORY_BASE: u32 = 0x08;
pub(crate) const CTX_MEMORY_SIZE: u32 = 0x10;
pub(crate) const CTX_FUEL: u32 = 0x18;
pub(crate) const CTX_DEPTH: u32 = 0x30;
pub(crate) const CTX_CALL_HELPER: u32 = 0x38;
pub(crate) const CTX_INDIRECT_HELPER: u32 = 0x40;
pub(crate) const CTX_GROW_HELPER: u32 = 0x48;
pub(crate) const CTX_GLOBAL_GET_HELPER: u32 = 0x50;
pub(crate) const CTX_GLOBAL_SET_HELPER: u32 = 0x58;

/// What a backend produces for one function.
pub(crate) struct EmittedCode {
    pub code: Vec<u8>,
    /// Offset of the out-of-bounds stub (the signal router's redirect
    /// target).
    pub oob_stub: u32,
    /// (code offset, RIR PC) pairs mapping native PCs back for deopt and
    /// trap attribution.
    pub deopt: Vec<(u32, u32)>,
}

/// Per-function compilation inputs beyond the RIR itself.
pub(crate) struct FuncLayout {
    pub func_index: u32,
    /// Single load/store memory accesses (guard pages) vs explicit bounds
    /// checks.
    pub guard_mode: bool,
}

/// An executable code buffer. Mapped RW for emission, transitioned to RX
/// before first use; the two states never overlap.
pub(crate) struct CodeBuf {
    ptr: *mut u8,
    len: usize,
}

// Immutable executable memory after installation.
unsafe impl Send for CodeBuf {}
unsafe impl Sync for CodeBuf {}

impl CodeBuf {
    fn install(code: &[u8]) -> Result<Self, CompileError> {
        let page = 4096usize;
        let len = code.len().div_ceil(page) * page;
        // Safety: fresh anonymous RW mapping.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(CompileError::Alloc);
        }
        let ptr = ptr.cast::<u8>();
        // Safety: the mapping is RW and at least code.len() long.
        unsafe { std::ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len()) };
        // Safety: transition the whole buffer to RX (never writable and
        // executable at once).
        let rc = unsafe { libc::mprotect(ptr.cast(), len, libc::PROT_READ | libc::PROT_EXEC) };
        if rc != 0 {
            // Safety: releasing the mapping we created.
            unsafe { libc::munmap(ptr.cast(), len) };
            return Err(CompileError::Alloc);
        }
        #[cfg(target_arch = "aarch64")]
        {
            unsafe extern "C" {
                fn __clear_cache(start: *mut libc::c_char, end: *mut libc::c_char);
            }
            // Safety: flushing the instruction cache over the new code.
            unsafe { __clear_cache(ptr.cast(), ptr.add(len).cast()) };
        }
        Ok(Self { ptr, len })
    }

    pub(crate) fn as_ptr(&self) -> *const u8 {
        self.ptr
    }
}

impl Drop for CodeBuf {
    fn drop(&mut self) {
        fault::unregister_code_region(self.ptr as usize);
        // Safety: unmapping our own buffer; no entry pointer outlives the
        // owning JitCode.
        unsafe { libc::munmap(self.ptr.cast(), self.len) };
    }
}

/// Installed native code for one function.
pub(crate) struct JitCode {
    #[allow(dead_code)]
    buf: CodeBuf,
    entry: *const u8,
    pub param_slots: u32,
    pub result_slots: u32,
    /// (code offset, RIR PC), sorted by offset.
    pub deopt: Vec<(u32, u32)>,
}

// The entry pointer targets immutable executable memory.
unsafe impl Send for JitCode {}
unsafe impl Sync for JitCode {}

/// Builds the missing interpreter tiers for a function: PIR always, RIR
/// when the register form supports it.
pub(crate) fn ensure_tiers(instance: &mut Instance, func_addr: u32) -> Result<(), TrapKind> {
    let entity = &instance.store.functions[func_addr as usize];
    if entity.pir.is_some() {
        return Ok(());
    }
    let module = instance.module.clone();
    let crate::runtime::FuncKind::Wasm { body_index } = entity.kind else {
        return Ok(());
    };
    let body = &module.code[body_index as usize];
    let pir = crate::pir::build_pir(&module, crate::types::FuncIdx::new(func_addr), body)
        .map_err(|_| TrapKind::UnsupportedInstruction)?;
    let pir = std::rc::Rc::new(pir);

    let rir = match crate::rir::build_rir(&module, &pir) {
        Ok(rir) => Some(std::rc::Rc::new(rir)),
        Err(_) => None,
    };

    let entity = &mut instance.store.functions[func_addr as usize];
    entity.rir = rir;
    entity.pir = Some(pir);
    Ok(())
}

/// The tier controller's promotion check: on a threshold crossing, compile
/// and install the native entry, or pin the function to the interpreter.
pub(crate) fn maybe_promote(instance: &mut Instance, func_addr: u32) {
    let tier = instance.tier;
    if !tier.enable_jit {
        return;
    }
    let entity = &instance.store.functions[func_addr as usize];
    if entity.tier != TierState::Interpreter {
        return;
    }
    // Module-level branch hints mark the function as branch-profiled;
    // promote its loops sooner.
    let is_wasm_local = matches!(entity.kind, crate::runtime::FuncKind::Wasm { .. });
    if !is_wasm_local {
        return;
    }
    let backedge_threshold = if instance
        .module
        .branch_hints
        .contains_key(&func_addr)
    {
        tier.backedge_threshold / 2
    } else {
        tier.backedge_threshold
    };
    if entity.call_count < tier.call_threshold && entity.backedge_count < backedge_threshold {
        return;
    }

    // At most one compilation is ever active for a function: the state
    // moves to Compiling synchronously before any compile work happens.
    instance.store.functions[func_addr as usize].tier = TierState::Compiling;
    match compile(instance, func_addr) {
        Ok(code) => {
            debug!(func = func_addr, sites = code.deopt.len(), "installed native code");
            let entity = &mut instance.store.functions[func_addr as usize];
            entity.jit = Some(code);
            entity.tier = TierState::Native;
        }
        Err(error) => {
            trace!(func = func_addr, %error, "compile failed; pinning to interpreter");
            let entity = &mut instance.store.functions[func_addr as usize];
            entity.jit = None;
            entity.tier = TierState::InterpreterPinned;
        }
    }
}

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
fn compile(instance: &mut Instance, func_addr: u32) -> Result<Arc<JitCode>, CompileError> {
    let entity = &instance.store.functions[func_addr as usize];
    let rir = entity.rir.clone().ok_or(CompileError::Unsupported)?;

    // Accesses beyond memory 0, 64-bit memories, and custom page sizes stay
    // on the interpreter tiers.
    let memory = instance.store.memories.first();
    if let Some(memory) = memory {
        let ty = memory.ty();
        if ty.memory64 || ty.page_size_log2.is_some() {
            return Err(CompileError::Unsupported);
        }
    }
    if rir.memargs.iter().any(|marg| marg.memory != 0) {
        return Err(CompileError::Unsupported);
    }
    let guard_mode = memory.is_some_and(|memory| {
        memory.is_guarded() && fault::guard_region_is_registered(memory.base_ptr() as usize)
    });

    let layout = FuncLayout {
        func_index: func_addr,
        guard_mode,
    };
    #[cfg(target_arch = "x86_64")]
    let (isa, emit): (_, fn(&RirFunction, &Allocation, &FuncLayout) -> Result<EmittedCode, CompileError>) =
        (regalloc::X86_64_REGS, x86_64::emit);
    #[cfg(target_arch = "aarch64")]
    let (isa, emit): (_, fn(&RirFunction, &Allocation, &FuncLayout) -> Result<EmittedCode, CompileError>) =
        (regalloc::ARM64_REGS, arm64::emit);

    let alloc = regalloc::allocate(&rir, isa);
    let emitted = emit(&rir, &alloc, &layout)?;
    let buf = CodeBuf::install(&emitted.code)?;
    fault::register_code_region(
        buf.ptr as usize,
        buf.len,
        buf.ptr as usize + emitted.oob_stub as usize,
    );
    let entry = buf.ptr.cast_const();
    Ok(Arc::new(JitCode {
        buf,
        entry,
        param_slots: u32::from(rir.param_count),
        result_slots: u32::from(rir.result_count),
        deopt: emitted.deopt,
    }))
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn compile(_instance: &mut Instance, _func_addr: u32) -> Result<Arc<JitCode>, CompileError> {
    Err(CompileError::Unsupported)
}

/// Runs installed native code for a call whose arguments are at `base` on
/// the operand stack. Results are left at `base`, exactly like an inline
/// host call.
pub(crate) fn invoke_native(
    instance: &mut Instance,
    exec: &mut ExecState,
    func_addr: u32,
    code: &Arc<JitCode>,
    base: usize,
) -> Result<(), Trap> {
    let slots = code.param_slots.max(code.result_slots) as usize;
    if !exec.reserve_native_frame(base, slots) {
        return Err(Trap::plain(TrapKind::StackOverflow));
    }

    let (memory_base, memory_size) = match instance.store.memories.first() {
        Some(memory) => (memory.base_ptr(), memory.byte_size() as u64),
        None => (std::ptr::null_mut(), 0),
    };
    let depth = exec.frames_len() as u64 + u64::from(instance.depth_bias);
    let mut ctx = JitContext {
        frame_base: exec.stack_ptr_at(base),
        memory_base,
        memory_size,
        fuel: &raw mut instance.fuel,
        instance: std::ptr::from_mut(instance).cast(),
        exec: std::ptr::from_mut(exec).cast(),
        depth,
        call_helper: helper_call as usize,
        indirect_helper: helper_call_indirect as usize,
        grow_helper: helper_memory_grow as usize,
        global_get_helper: helper_global_get as usize,
        global_set_helper: helper_global_set as usize,
    };

    // Safety: the entry points at installed RX code emitted for exactly
    // this ABI.
    let entry: extern "C" fn(*mut JitContext) -> i64 =
        unsafe { std::mem::transmute(code.entry) };
    let status = entry(&mut ctx);

    if status == 0 {
        exec.truncate_stack(base + code.result_slots as usize);
        return Ok(());
    }
    if status == TRAP_PENDING
        && let Some(trap) = instance.pending_trap.take()
    {
        return Err(trap);
    }
    let kind = trap_kind_of_code(status);
    // Memory faults carry the faulting code offset; resolve it through the
    // deopt map for byte-accurate attribution.
    let offset = fault::take_last_fault_offset().and_then(|code_offset| {
        let rir_pc = code
            .deopt
            .iter()
            .take_while(|&&(start, _)| start <= code_offset)
            .last()
            .map(|&(_, rir_pc)| rir_pc)?;
        let entity = &instance.store.functions[func_addr as usize];
        let pir_pc = entity.rir.as_ref()?.rir_to_pir.get(rir_pc as usize)?;
        entity.pir.as_ref()?.pc_map.get(*pir_pc as usize).copied()
    });
    Err(Trap {
        kind,
        func: Some(func_addr),
        offset,
    })
}

// ---- helper trampolines -------------------------------------------------
//
// Reached from native code with the C ABI. They reconstruct the engine
// references from the context, re-enter the interpreter driver, and refresh
// the context's memory binding before returning (the callee may have grown
// memory).

unsafe fn ctx_parts<'a>(ctx: *mut JitContext) -> (&'a mut JitContext, &'a mut Instance, &'a mut ExecState) {
    // Safety: native code runs strictly inside invoke_native, whose
    // borrows are dormant for the duration; single-threaded access.
    unsafe {
        let ctx = &mut *ctx;
        let instance = &mut *ctx.instance.cast::<Instance>();
        let exec = &mut *ctx.exec.cast::<ExecState>();
        (ctx, instance, exec)
    }
}

fn refresh_memory(ctx: &mut JitContext, instance: &Instance) {
    if let Some(memory) = instance.store.memories.first() {
        ctx.memory_base = memory.base_ptr();
        ctx.memory_size = memory.byte_size() as u64;
    }
}

extern "C" fn helper_call(ctx: *mut JitContext, callee: u32, args: *mut u64, counts: u64) -> i64 {
    // Safety: see ctx_parts.
    let (ctx, instance, exec) = unsafe { ctx_parts(ctx) };
    let nargs = (counts >> 32) as usize;
    let nrets = (counts & 0xffff_ffff) as usize;

    // Safety: the backend sized the buffer for max(nargs, nrets).
    let buffer = unsafe { std::slice::from_raw_parts_mut(args, nargs.max(nrets)) };
    dispatch_wasm_call(ctx, instance, exec, callee, buffer, nargs, nrets)
}

extern "C" fn helper_call_indirect(
    ctx: *mut JitContext,
    type_table: u64,
    index: u64,
    args: *mut u64,
    counts: u64,
) -> i64 {
    // Safety: see ctx_parts.
    let (ctx, instance, exec) = unsafe { ctx_parts(ctx) };
    let type_idx = (type_table >> 32) as u32;
    let table = (type_table & 0xffff_ffff) as u32;
    let nargs = (counts >> 32) as usize;
    let nrets = (counts & 0xffff_ffff) as usize;

    let resolve = || -> Result<u32, TrapKind> {
        let table_entity = &instance.store.tables[table as usize];
        let index = if table_entity.ty.table64 {
            index
        } else {
            u64::from(index as u32)
        };
        let bits = table_entity.get(index)?;
        if crate::runtime::refenc::is_null(bits) {
            return Err(TrapKind::UndefinedElement);
        }
        if crate::runtime::refenc::tag(bits) != crate::runtime::refenc::TAG_FUNC {
            return Err(TrapKind::MismatchedSignatures);
        }
        let callee = crate::runtime::refenc::payload(bits) as u32;
        let expected = instance.module.type_fingerprints[type_idx as usize];
        if instance.store.functions[callee as usize].fingerprint != expected {
            return Err(TrapKind::MismatchedSignatures);
        }
        Ok(callee)
    };
    let callee = match resolve() {
        Ok(callee) => callee,
        Err(kind) => {
            instance.pending_trap = Some(Trap::plain(kind));
            return TRAP_PENDING;
        }
    };
    // Safety: the backend sized the buffer for max(nargs, nrets).
    let buffer = unsafe { std::slice::from_raw_parts_mut(args, nargs.max(nrets)) };
    dispatch_wasm_call(ctx, instance, exec, callee, buffer, nargs, nrets)
}

fn dispatch_wasm_call(
    ctx: &mut JitContext,
    instance: &mut Instance,
    exec: &mut ExecState,
    callee: u32,
    buffer: &mut [u64],
    nargs: usize,
    nrets: usize,
) -> i64 {
    let floor = exec.frames_len();
    let arg_start = exec.stack_len();
    if !exec.push_args(&buffer[..nargs]) {
        instance.pending_trap = Some(Trap::plain(TrapKind::StackOverflow));
        return TRAP_PENDING;
    }

    // Native frames are invisible to the interpreter's frame stack; bias
    // its depth accounting while we are re-entered.
    let saved_bias = instance.depth_bias;
    instance.depth_bias = (ctx.depth as usize).saturating_sub(floor) as u32;
    let outcome = crate::interp::enter_function(instance, exec, callee, false)
        .and_then(|()| crate::interp::run_until(instance, exec, floor));
    instance.depth_bias = saved_bias;

    match outcome {
        Ok(()) => {
            exec.read_results(arg_start, &mut buffer[..nrets]);
            exec.truncate_stack(arg_start);
            refresh_memory(ctx, instance);
            0
        }
        Err(trap) => {
            exec.truncate_frames(floor);
            exec.truncate_stack(arg_start);
            instance.pending_trap = Some(trap);
            TRAP_PENDING
        }
    }
}

extern "C" fn helper_memory_grow(ctx: *mut JitContext, memory: u32, delta: u64) -> u64 {
    // Safety: see ctx_parts.
    let (ctx, instance, _) = unsafe { ctx_parts(ctx) };
    let entity = &mut instance.store.memories[memory as usize];
    let result = match entity.grow(delta) {
        Some(prior) => prior,
        None => u64::from(u32::MAX),
    };
    refresh_memory(ctx, instance);
    result
}

extern "C" fn helper_global_get(ctx: *mut JitContext, index: u32) -> u64 {
    // Safety: see ctx_parts.
    let (_, instance, _) = unsafe { ctx_parts(ctx) };
    instance.store.globals[index as usize].value[0]
}

extern "C" fn helper_global_set(ctx: *mut JitContext, index: u32, value: u64) {
    // Safety: see ctx_parts.
    let (_, instance, _) = unsafe { ctx_parts(ctx) };
    instance.store.globals[index as usize].value = [value, 0];
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::offset_of;

    #[test]
    fn context_offsets_match_backend_constants() {
        assert_eq!(offset_of!(JitContext, frame_base), CTX_FRAME_BASE as usize);
        assert_eq!(offset_of!(JitContext, memory_base), CTX_MEMORY_BASE as usize);
        assert_eq!(offset_of!(JitContext, memory_size), CTX_MEMORY_SIZE as usize);
        assert_eq!(offset_of!(JitContext, fuel), CTX_FUEL as usize);
        assert_eq!(offset_of!(JitContext, depth), CTX_DEPTH as usize);
        assert_eq!(offset_of!(JitContext, call_helper), CTX_CALL_HELPER as usize);
        assert_eq!(
            offset_of!(JitContext, indirect_helper),
            CTX_INDIRECT_HELPER as usize
        );
        assert_eq!(offset_of!(JitContext, grow_helper), CTX_GROW_HELPER as usize);
        assert_eq!(
            offset_of!(JitContext, global_get_helper),
            CTX_GLOBAL_GET_HELPER as usize
        );
        assert_eq!(
            offset_of!(JitContext, global_set_helper),
            CTX_GLOBAL_SET_HELPER as usize
        );
    }

    #[test]
    fn code_buffer_is_executable_after_install() {
        // A function that returns its argument: mov rax, rdi; ret on
        // x86_64; mov x0-identity on aarch64.
        #[cfg(target_arch = "x86_64")]
        let code = [0x48, 0x89, 0xf8, 0xc3];
        #[cfg(target_arch = "aarch64")]
        let code = [0xe0, 0x03, 0x00, 0xaa, 0xc0, 0x03, 0x5f, 0xd6]; // mov x0, x0; ret
        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
        let code = [0u8; 4];

        let buf = CodeBuf::install(&code).unwrap();
        #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
        {
            // Safety: the buffer holds the identity function above.
            let f: extern "C" fn(u64) -> u64 = unsafe { std::mem::transmute(buf.as_ptr()) };
            assert_eq!(f(42), 42);
        }
        drop(buf);
    }
}
