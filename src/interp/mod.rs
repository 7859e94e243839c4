// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! The interpreter tiers.
//!
//! Two dispatch loops coexist over shared stacks and accessors: the PIR
//! loop executes everything (the fall-back tier), the RIR loop executes the
//! register form (the default tier). Hot functions dispatch to native code
//! instead; the tier controller runs at function entry and at taken
//! back-edges.
//!
//! Calling convention, all tiers: the caller leaves arguments as the
//! topmost operand slots; the callee's frame base overlays them (parameters
//! and locals share slots), and results are copied down to the frame base
//! on return. Wasm-level calls never recurse into the Rust stack — frames
//! are explicit — except through native code, which re-enters the driver
//! via trampolines above a deeper frame floor.

pub(crate) mod num;
mod pir_loop;
mod rir_loop;

use std::rc::Rc;
use std::sync::atomic::Ordering;

use crate::pir::PirFunction;
use crate::rir::RirFunction;
use crate::runtime::{
    FuncKind, HostContext, Instance, LinearMemoryView, MAX_CALL_DEPTH, OPERAND_STACK_SLOTS,
    TierState, Trap, TrapKind, Value, slots_to_value, value_to_slots,
};
use crate::types::{TypeIdx, ValType};

use pir_loop::run_pir;
use rir_loop::run_rir;

/// One stack frame: locals (parameters first), the PC, and the base of this
/// frame's operand or register region.
pub(crate) struct Frame {
    pub func: u32,
    /// First slot of locals (PIR) or of the register file (RIR).
    pub base: usize,
    /// PIR: first operand slot (base + local slots). RIR: equals `base`.
    pub operand_base: usize,
    pub pc: usize,
    code: FrameCode,
    /// RIR: call site whose results are pending a copy into registers.
    pending_call: Option<u32>,
}

#[derive(Clone)]
enum FrameCode {
    Pir(Rc<PirFunction>),
    Rir(Rc<RirFunction>),
}

// A pushed exception-handler scope. Live only while its frame's PC sits
// inside [start, end]; stale entries are discarded lazily.
struct HandlerEntry {
    frame_index: usize,
    handler: u32,
    start: u32,
    end: u32,
}

/// Reusable execution stacks, kept on the instance between invocations.
#[derive(Default)]
pub(crate) struct ExecState {
    stack: Vec<u64>,
    frames: Vec<Frame>,
    handlers: Vec<HandlerEntry>,
}

impl ExecState {
    pub(crate) fn new() -> Self {
        Self {
            // Full capacity up front: native code holds raw pointers into
            // the stack across helper calls, so it must never reallocate.
            stack: Vec::with_capacity(OPERAND_STACK_SLOTS),
            frames: Vec::with_capacity(64),
            handlers: Vec::new(),
        }
    }

    pub(crate) fn frames_len(&self) -> usize {
        self.frames.len()
    }

    pub(crate) fn stack_len(&self) -> usize {
        self.stack.len()
    }

    pub(crate) fn truncate_stack(&mut self, len: usize) {
        self.stack.truncate(len);
    }

    pub(crate) fn truncate_frames(&mut self, len: usize) {
        self.frames.truncate(len);
    }

    /// A raw window into the stack for native code. Stable across helper
    /// re-entry because the stack never reallocates.
    pub(crate) fn stack_ptr_at(&mut self, base: usize) -> *mut u64 {
        // Safety: base stays within the fixed capacity per
        // reserve_native_frame.
        unsafe { self.stack.as_mut_ptr().add(base) }
    }

    /// Sizes the stack for a native frame needing `slots` beyond `base`.
    pub(crate) fn reserve_native_frame(&mut self, base: usize, slots: usize) -> bool {
        if base + slots >= OPERAND_STACK_SLOTS {
            return false;
        }
        if self.stack.len() < base + slots {
            self.stack.resize(base + slots, 0);
        }
        true
    }

    pub(crate) fn push_args(&mut self, args: &[u64]) -> bool {
        if self.stack.len() + args.len() >= OPERAND_STACK_SLOTS {
            return false;
        }
        self.stack.extend_from_slice(args);
        true
    }

    pub(crate) fn read_results(&self, start: usize, out: &mut [u64]) {
        out.copy_from_slice(&self.stack[start..start + out.len()]);
    }
}

// What a dispatch loop hands back to the driver at a frame transition.
enum Action {
    /// The frame returned; its results are the stack tail from
    /// `result_start`.
    Return { result_start: usize },
    /// Enter `callee`, whose arguments are the top `arg_slots` slots.
    Call {
        callee: u32,
        tail: bool,
        arg_slots: usize,
    },
    /// An exception was thrown.
    Throw { exn: u64 },
}

/// Invokes a store function with embedder values; the entry point behind
/// [`Instance::invoke`] and start-function execution.
pub(crate) fn call_function(
    instance: &mut Instance,
    func_addr: u32,
    args: &[Value],
    results: &mut Vec<Value>,
) -> Result<(), Trap> {
    let type_idx = instance.store.functions[func_addr as usize].type_idx;
    let ty = instance.module.types[usize::from(type_idx)]
        .as_func()
        .expect("store functions have function types")
        .clone();
    if args.len() != ty.params.len() {
        return Err(Trap::plain(TrapKind::MismatchedSignatures));
    }

    let mut exec = std::mem::take(&mut instance.exec);
    exec.stack.clear();
    exec.frames.clear();
    exec.handlers.clear();
    for (value, &param) in args.iter().zip(&ty.params) {
        if !value_fits(*value, param) {
            instance.exec = exec;
            return Err(Trap::plain(TrapKind::MismatchedSignatures));
        }
        let [lo, hi] = value_to_slots(*value);
        exec.stack.push(lo);
        if param.slot_count() == 2 {
            exec.stack.push(hi);
        }
    }

    let outcome = (|| {
        enter_and_absorb(instance, &mut exec, func_addr, 0)?;
        run_until(instance, &mut exec, 0)
    })();

    let outcome = outcome.map(|()| {
        results.clear();
        let mut at = 0usize;
        for &result in &ty.results {
            let lo = exec.stack[at];
            let hi = if result.slot_count() == 2 {
                at += 1;
                exec.stack[at]
            } else {
                0
            };
            at += 1;
            results.push(slots_to_value(result, lo, hi));
        }
    });

    // After any trap the stacks reset; engine state stays usable for the
    // next invocation.
    exec.stack.clear();
    exec.frames.clear();
    exec.handlers.clear();
    instance.exec = exec;
    outcome
}

fn value_fits(value: Value, param: ValType) -> bool {
    value.ty() == param || matches!((value.ty(), param), (ValType::Ref(_), ValType::Ref(_)))
}

// Enters a function whose arguments are the top slots of the stack; if it
// ran inline (host or native), absorbs results into a pending RIR call
// site.
fn enter_and_absorb(
    instance: &mut Instance,
    exec: &mut ExecState,
    callee: u32,
    result_base: usize,
) -> Result<(), Trap> {
    let depth = exec.frames.len();
    enter_function(instance, exec, callee, false)?;
    if exec.frames.len() == depth {
        absorb_pending(exec, result_base);
    }
    Ok(())
}

// Enters a function. Host functions run to completion inline; Wasm
// functions push a frame or run natively. `tail` skips the depth increment
// (the caller's frame has already been discarded).
pub(crate) fn enter_function(
    instance: &mut Instance,
    exec: &mut ExecState,
    func_addr: u32,
    tail: bool,
) -> Result<(), Trap> {
    if !tail && exec.frames.len() + instance.depth_bias as usize >= MAX_CALL_DEPTH {
        return Err(Trap::plain(TrapKind::StackOverflow));
    }
    if instance.interrupt.load(Ordering::Relaxed) {
        return Err(Trap::plain(TrapKind::Interrupted));
    }

    let entity = &mut instance.store.functions[func_addr as usize];
    let type_idx = entity.type_idx;
    if let FuncKind::Host { host_index } = entity.kind {
        return call_host(instance, exec, host_index, type_idx);
    }

    entity.call_count = entity.call_count.saturating_add(1);
    crate::jit::ensure_tiers(instance, func_addr).map_err(Trap::plain)?;
    crate::jit::maybe_promote(instance, func_addr);

    let entity = &instance.store.functions[func_addr as usize];
    if entity.tier == TierState::Native
        && let Some(code) = entity.jit.clone()
    {
        let base = exec.stack.len() - code.param_slots as usize;
        return crate::jit::invoke_native(instance, exec, func_addr, &code, base);
    }

    if let Some(rir) = entity.rir.clone() {
        push_rir_frame(exec, func_addr, rir)
    } else {
        let pir = entity.pir.clone().expect("predecoded before execution");
        push_pir_frame(exec, func_addr, pir)
    }
}

fn push_pir_frame(exec: &mut ExecState, func: u32, pir: Rc<PirFunction>) -> Result<(), Trap> {
    let param_slots = pir.param_slots as usize;
    let local_slots = pir.local_slots as usize;
    let base = exec.stack.len() - param_slots;
    if base + local_slots >= OPERAND_STACK_SLOTS {
        return Err(Trap::plain(TrapKind::StackOverflow));
    }
    exec.stack.resize(base + local_slots, 0);
    exec.frames.push(Frame {
        func,
        base,
        operand_base: base + local_slots,
        pc: 0,
        code: FrameCode::Pir(pir),
        pending_call: None,
    });
    Ok(())
}

fn push_rir_frame(exec: &mut ExecState, func: u32, rir: Rc<RirFunction>) -> Result<(), Trap> {
    let param_count = rir.param_count as usize;
    let num_regs = rir.num_regs as usize;
    let base = exec.stack.len() - param_count;
    if base + num_regs >= OPERAND_STACK_SLOTS {
        return Err(Trap::plain(TrapKind::StackOverflow));
    }
    exec.stack.resize(base + num_regs, 0);
    exec.frames.push(Frame {
        func,
        base,
        operand_base: base,
        pc: 0,
        code: FrameCode::Rir(rir),
        pending_call: None,
    });
    Ok(())
}

// Marshals and runs a host function inline: arguments are popped from the
// stack, results pushed in their place.
fn call_host(
    instance: &mut Instance,
    exec: &mut ExecState,
    host_index: u32,
    type_idx: TypeIdx,
) -> Result<(), Trap> {
    let ty = instance.module.types[usize::from(type_idx)]
        .as_func()
        .expect("host functions have function types")
        .clone();

    let param_slots = ty.param_slots();
    let arg_base = exec.stack.len() - param_slots;
    let mut args = Vec::with_capacity(ty.params.len());
    let mut at = arg_base;
    for &param in &ty.params {
        let lo = exec.stack[at];
        let hi = if param.slot_count() == 2 {
            at += 1;
            exec.stack[at]
        } else {
            0
        };
        at += 1;
        args.push(slots_to_value(param, lo, hi));
    }
    exec.stack.truncate(arg_base);

    let mut results = Vec::with_capacity(ty.results.len());
    let slot = &mut instance.host_funcs[host_index as usize];
    let tag = slot.tag;
    let memory = instance
        .store
        .memories
        .iter_mut()
        .next()
        .map(|memory| LinearMemoryView { memory });
    let mut ctx = HostContext {
        args: &args,
        results: &mut results,
        tag,
        memory,
    };
    slot.func
        .call(&mut ctx)
        .map_err(|message| Trap::plain(TrapKind::HostError(message.into())))?;

    if results.len() != ty.results.len() {
        return Err(Trap::plain(TrapKind::MismatchedSignatures));
    }
    for (value, &result) in results.iter().zip(&ty.results) {
        if !value_fits(*value, result) {
            return Err(Trap::plain(TrapKind::MismatchedSignatures));
        }
        let [lo, hi] = value_to_slots(*value);
        exec.stack.push(lo);
        if result.slot_count() == 2 {
            exec.stack.push(hi);
        }
    }
    Ok(())
}

/// Runs frames until the frame stack shrinks back to `floor`. The single
/// driver shared by the public entry, start execution, and the JIT's call
/// trampolines.
pub(crate) fn run_until(
    instance: &mut Instance,
    exec: &mut ExecState,
    floor: usize,
) -> Result<(), Trap> {
    while exec.frames.len() > floor {
        let code = exec.frames.last().expect("non-empty frame stack").code.clone();
        let action = match code {
            FrameCode::Pir(pir) => run_pir(instance, exec, &pir),
            FrameCode::Rir(rir) => run_rir(instance, exec, &rir),
        };
        let action = match action {
            Ok(action) => action,
            Err(kind) => return Err(attribute_trap(instance, exec, kind)),
        };
        match action {
            Action::Return { result_start } => finish_return(exec, result_start),
            Action::Call {
                callee,
                tail,
                arg_slots,
            } => {
                let mut result_base = exec.stack.len() - arg_slots;
                if tail {
                    let frame = exec.frames.pop().expect("tail-calling frame");
                    let start = exec.stack.len() - arg_slots;
                    exec.stack.copy_within(start.., frame.base);
                    exec.stack.truncate(frame.base + arg_slots);
                    result_base = frame.base;
                    discard_dead_handlers(exec);
                }
                let depth = exec.frames.len();
                enter_function(instance, exec, callee, tail)?;
                if exec.frames.len() == depth {
                    absorb_pending(exec, result_base);
                }
            }
            Action::Throw { exn } => {
                if !unwind_exception(instance, exec, exn) {
                    return Err(attribute_trap(
                        instance,
                        exec,
                        TrapKind::WasmException { exn },
                    ));
                }
            }
        }
    }
    Ok(())
}

// Attaches the faulting function index and byte offset to a trap.
fn attribute_trap(instance: &Instance, exec: &ExecState, kind: TrapKind) -> Trap {
    let Some(frame) = exec.frames.last() else {
        return Trap::plain(kind);
    };
    let offset = match &frame.code {
        FrameCode::Pir(pir) => pir.pc_map.get(frame.pc).copied(),
        FrameCode::Rir(rir) => {
            let pir_pc = rir.rir_to_pir.get(frame.pc).copied();
            let entity = &instance.store.functions[frame.func as usize];
            pir_pc.and_then(|pir_pc| {
                entity
                    .pir
                    .as_ref()
                    .and_then(|pir| pir.pc_map.get(pir_pc as usize).copied())
            })
        }
    };
    Trap {
        kind,
        func: Some(frame.func),
        offset,
    }
}

// Completes a return: results move down to the frame base, the frame pops,
// and a pending call site in the caller takes its results.
fn finish_return(exec: &mut ExecState, result_start: usize) {
    let frame = exec.frames.pop().expect("returning frame");
    let result_slots = exec.stack.len() - result_start;
    exec.stack.copy_within(result_start.., frame.base);
    exec.stack.truncate(frame.base + result_slots);
    discard_dead_handlers(exec);
    absorb_pending(exec, frame.base);
}

fn discard_dead_handlers(exec: &mut ExecState) {
    while exec
        .handlers
        .last()
        .is_some_and(|entry| entry.frame_index >= exec.frames.len())
    {
        exec.handlers.pop();
    }
}

// Copies inline-call results (sitting at `result_base`) into the caller's
// destination registers, when the top frame is a register frame mid-call.
fn absorb_pending(exec: &mut ExecState, result_base: usize) {
    let Some(caller) = exec.frames.last_mut() else {
        return;
    };
    let Some(site) = caller.pending_call.take() else {
        return;
    };
    let FrameCode::Rir(rir) = caller.code.clone() else {
        unreachable!("pending call sites belong to register frames");
    };
    let base = caller.base;
    let site = &rir.calls[site as usize];
    for (i, &reg) in site.rets.iter().enumerate() {
        exec.stack[base + reg as usize] = exec.stack[result_base + i];
    }
    exec.stack.truncate(base + rir.num_regs as usize);
}

// Searches the handler stack for a clause matching the thrown exception;
// false when nothing catches it.
fn unwind_exception(instance: &mut Instance, exec: &mut ExecState, exn: u64) -> bool {
    let tag = instance.store.exceptions[refenc_payload(exn)].tag;
    loop {
        let Some(entry) = exec.handlers.last() else {
            return false;
        };
        // Stale entries: frame gone, or PC outside the protected range.
        if entry.frame_index >= exec.frames.len() {
            exec.handlers.pop();
            continue;
        }
        let frame = &exec.frames[entry.frame_index];
        // The frame's PC is its resumption point, one past the throwing
        // instruction or call site; a resumption point of `end` (the
        // scope's TryPop) still belongs to the scope, so the bound is
        // inclusive.
        let pc = frame.pc as u32;
        if pc < entry.start || pc > entry.end {
            exec.handlers.pop();
            continue;
        }
        let FrameCode::Pir(pir) = frame.code.clone() else {
            exec.handlers.pop();
            continue;
        };
        let handler = &pir.handlers[entry.handler as usize];
        let Some(clause) = handler
            .clauses
            .iter()
            .find(|clause| clause.tag == u32::MAX || clause.tag == tag)
            .copied()
        else {
            exec.handlers.pop();
            continue;
        };

        // Caught: unwind to the handler's frame and branch to the clause
        // target with the payload on the stack.
        let frame_index = entry.frame_index;
        exec.handlers.pop();
        exec.frames.truncate(frame_index + 1);
        let frame = exec.frames.last_mut().expect("handler frame");
        frame.pc = clause.target as usize;
        let dest = frame.operand_base + clause.dest_height as usize;
        exec.stack.truncate(dest);
        let payload = instance.store.exceptions[refenc_payload(exn)].payload.clone();
        exec.stack.extend_from_slice(&payload);
        if clause.push_exn {
            exec.stack.push(exn);
        }
        return true;
    }
}

fn refenc_payload(exn: u64) -> usize {
    crate::runtime::refenc::payload(exn) as usize
}

// Burns one unit of fuel; traps between instructions once exhausted.
#[inline]
fn burn_fuel(instance: &mut Instance) -> Result<(), TrapKind> {
    if instance.fuel_enabled {
        if instance.fuel <= 0 {
            return Err(TrapKind::FuelExhausted);
        }
        instance.fuel -= 1;
    }
    Ok(())
}

// A taken back-edge: samples the interrupt flag and feeds the tier
// controller (fuel is already accounted per instruction).
#[inline]
fn on_back_edge(instance: &mut Instance, func: u32) -> Result<(), TrapKind> {
    if instance.interrupt.load(Ordering::Relaxed) {
        return Err(TrapKind::Interrupted);
    }
    let entity = &mut instance.store.functions[func as usize];
    entity.backedge_count = entity.backedge_count.saturating_add(1);
    crate::jit::maybe_promote(instance, func);
    Ok(())
}

// Pushes one operand slot, honoring the stack capacity.
#[inline]
fn push_slot(stack: &mut Vec<u64>, value: u64) -> Result<(), TrapKind> {
    if stack.len() >= OPERAND_STACK_SLOTS {
        return Err(TrapKind::StackOverflow);
    }
    stack.push(value);
    Ok(())
}
