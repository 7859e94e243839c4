// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Signal and fault routing.
//!
//! A single process-wide SIGSEGV/SIGBUS handler translates guard-page
//! faults into out-of-bounds traps: a fault whose address lies in a
//! registered guard region while the PC lies in registered JIT code is
//! redirected (by rewriting the ucontext PC) to that function's
//! out-of-bounds stub. Anything else chains to the previously-installed
//! handler.
//!
//! The registries are fixed arrays of atomic slots so the handler can read
//! them without taking any lock: a slot is deactivated (length zeroed)
//! before its fields change and activated last with release ordering.

use std::sync::Once;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

const MAX_GUARD_REGIONS: usize = 128;
const MAX_CODE_REGIONS: usize = 1024;

struct GuardSlot {
    base: AtomicUsize,
    len: AtomicUsize,
}

struct CodeSlot {
    base: AtomicUsize,
    stub: AtomicUsize,
    len: AtomicUsize,
}

#[allow(clippy::declare_interior_mutable_const)]
const GUARD_INIT: GuardSlot = GuardSlot {
    base: AtomicUsize::new(0),
    len: AtomicUsize::new(0),
};
#[allow(clippy::declare_interior_mutable_const)]
const CODE_INIT: CodeSlot = CodeSlot {
    base: AtomicUsize::new(0),
    stub: AtomicUsize::new(0),
    len: AtomicUsize::new(0),
};

static GUARDS: [GuardSlot; MAX_GUARD_REGIONS] = [GUARD_INIT; MAX_GUARD_REGIONS];
static CODE: [CodeSlot; MAX_CODE_REGIONS] = [CODE_INIT; MAX_CODE_REGIONS];

/// The JIT-relative offset of the most recent redirected fault, for trap
/// attribution through the deopt map.
static LAST_FAULT_OFFSET: AtomicU64 = AtomicU64::new(u64::MAX);

pub(crate) fn take_last_fault_offset() -> Option<u32> {
    let value = LAST_FAULT_OFFSET.swap(u64::MAX, Ordering::Relaxed);
    (value != u64::MAX).then_some(value as u32)
}

/// Registers a memory's guard-carrying reservation. Also installs the
/// process-wide signal handler on first use.
pub(crate) fn register_guard_region(base: usize, len: usize) {
    install_handler();
    for slot in &GUARDS {
        if slot.len.load(Ordering::Acquire) == 0
            && slot
                .len
                .compare_exchange(0, usize::MAX, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        {
            slot.base.store(base, Ordering::Relaxed);
            slot.len.store(len, Ordering::Release);
            return;
        }
    }
    // Registry exhausted: the memory still works, its accesses simply
    // cannot be rescued from signal context. JIT code for it must not be
    // emitted in guard mode; the interpreter always bounds-checks.
}

pub(crate) fn unregister_guard_region(base: usize) {
    for slot in &GUARDS {
        if slot.base.load(Ordering::Relaxed) == base && slot.len.load(Ordering::Acquire) != 0 {
            slot.len.store(0, Ordering::Release);
            slot.base.store(0, Ordering::Relaxed);
            return;
        }
    }
}

/// Whether the guard region at `base` is registered (and faults in it will
/// be routed).
pub(crate) fn guard_region_is_registered(base: usize) -> bool {
    GUARDS.iter().any(|slot| {
        slot.base.load(Ordering::Relaxed) == base && slot.len.load(Ordering::Acquire) != 0
    })
}

/// Registers a JIT code range with its out-of-bounds stub address.
pub(crate) fn register_code_region(base: usize, len: usize, stub: usize) {
    install_handler();
    for slot in &CODE {
        if slot.len.load(Ordering::Acquire) == 0
            && slot
                .len
                .compare_exchange(0, usize::MAX, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        {
            slot.base.store(base, Ordering::Relaxed);
            slot.stub.store(stub, Ordering::Relaxed);
            slot.len.store(len, Ordering::Release);
            return;
        }
    }
}

pub(crate) fn unregister_code_region(base: usize) {
    for slot in &CODE {
        if slot.base.load(Ordering::Relaxed) == base && slot.len.load(Ordering::Acquire) != 0 {
            slot.len.store(0, Ordering::Release);
            slot.base.store(0, Ordering::Relaxed);
            return;
        }
    }
}

// Both lookups must hit for a fault to be ours.
fn lookup(fault_addr: usize, pc: usize) -> Option<(usize, usize)> {
    let mut in_guard = false;
    for slot in &GUARDS {
        let len = slot.len.load(Ordering::Acquire);
        if len == 0 || len == usize::MAX {
            continue;
        }
        let base = slot.base.load(Ordering::Relaxed);
        if fault_addr >= base && fault_addr - base < len {
            in_guard = true;
            break;
        }
    }
    if !in_guard {
        return None;
    }
    for slot in &CODE {
        let len = slot.len.load(Ordering::Acquire);
        if len == 0 || len == usize::MAX {
            continue;
        }
        let base = slot.base.load(Ordering::Relaxed);
        if pc >= base && pc - base < len {
            return Some((slot.stub.load(Ordering::Relaxed), pc - base));
        }
    }
    None
}

#[cfg(target_os = "linux")]
mod posix {
    use super::*;
    use std::mem;

    static INSTALL: Once = Once::new();
    // The handlers we displaced, for chaining.
    static mut PREV_SEGV: Option<libc::sigaction> = None;
    static mut PREV_BUS: Option<libc::sigaction> = None;

    pub(super) fn install_handler() {
        INSTALL.call_once(|| {
            // Safety: standard one-time sigaction installation; the handler
            // touches only async-signal-safe state (atomics and ucontext).
            unsafe {
                let mut action: libc::sigaction = mem::zeroed();
                let entry: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) =
                    handler;
                action.sa_sigaction = entry as usize;
                action.sa_flags = libc::SA_SIGINFO | libc::SA_NODEFER;
                libc::sigemptyset(&raw mut action.sa_mask);

                let mut prev: libc::sigaction = mem::zeroed();
                libc::sigaction(libc::SIGSEGV, &action, &mut prev);
                PREV_SEGV = Some(prev);

                let mut prev: libc::sigaction = mem::zeroed();
                libc::sigaction(libc::SIGBUS, &action, &mut prev);
                PREV_BUS = Some(prev);
            }
            tracing::debug!("installed guard-page fault handler");
        });
    }

    unsafe fn context_pc(context: *mut libc::c_void) -> usize {
        // Safety: the kernel hands a valid ucontext_t to SA_SIGINFO
        // handlers.
        unsafe {
            let ucontext = &*(context as *const libc::ucontext_t);
            #[cfg(target_arch = "x86_64")]
            {
                ucontext.uc_mcontext.gregs[libc::REG_RIP as usize] as usize
            }
            #[cfg(target_arch = "aarch64")]
            {
                ucontext.uc_mcontext.pc as usize
            }
            #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
            {
                let _ = ucontext;
                0
            }
        }
    }

    unsafe fn set_context_pc(context: *mut libc::c_void, pc: usize) {
        // Safety: as for context_pc; the rewrite resumes execution at a
        // stub inside the same (still-mapped) code buffer.
        unsafe {
            let ucontext = &mut *(context as *mut libc::ucontext_t);
            #[cfg(target_arch = "x86_64")]
            {
                ucontext.uc_mcontext.gregs[libc::REG_RIP as usize] = pc as i64;
            }
            #[cfg(target_arch = "aarch64")]
            {
                ucontext.uc_mcontext.pc = pc as u64;
            }
            #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
            {
                let _ = (ucontext, pc);
            }
        }
    }

    extern "C" fn handler(
        signal: libc::c_int,
        info: *mut libc::siginfo_t,
        context: *mut libc::c_void,
    ) {
        // Safety: si_addr is valid for SIGSEGV/SIGBUS.
        let fault_addr = unsafe { (*info).si_addr() as usize };
        let pc = unsafe { context_pc(context) };

        if let Some((stub, offset)) = lookup(fault_addr, pc) {
            LAST_FAULT_OFFSET.store(u64::from(offset as u32), Ordering::Relaxed);
            // Safety: redirecting into the registered stub.
            unsafe { set_context_pc(context, stub) };
            return;
        }

        // Not ours: chain to the displaced handler, or restore defaults and
        // let the re-raised signal reach the host debugger.
        // Safety: single-threaded mutation happened inside Once; reads
        // afterwards observe the published value.
        let prev = unsafe {
            let prev_ptr = if signal == libc::SIGSEGV {
                &raw const PREV_SEGV
            } else {
                &raw const PREV_BUS
            };
            (*prev_ptr).as_ref().copied()
        };
        match prev {
            Some(prev)
                if prev.sa_sigaction != libc::SIG_DFL && prev.sa_sigaction != libc::SIG_IGN =>
            {
                if prev.sa_flags & libc::SA_SIGINFO != 0 {
                    // Safety: chaining to the previous SA_SIGINFO handler.
                    unsafe {
                        let chained: extern "C" fn(
                            libc::c_int,
                            *mut libc::siginfo_t,
                            *mut libc::c_void,
                        ) = std::mem::transmute(prev.sa_sigaction);
                        chained(signal, info, context);
                    }
                } else {
                    // Safety: chaining to a plain handler.
                    unsafe {
                        let chained: extern "C" fn(libc::c_int) =
                            std::mem::transmute(prev.sa_sigaction);
                        chained(signal);
                    }
                }
            }
            _ => {
                // Safety: restoring default disposition; returning re-faults
                // and terminates under the default handler.
                unsafe {
                    let mut action: libc::sigaction = mem::zeroed();
                    action.sa_sigaction = libc::SIG_DFL;
                    libc::sigemptyset(&raw mut action.sa_mask);
                    libc::sigaction(signal, &action, std::ptr::null_mut());
                }
            }
        }
    }
}

#[cfg(target_os = "linux")]
use posix::install_handler;

#[cfg(not(target_os = "linux"))]
fn install_handler() {
    // Guard-page routing is only wired up on Linux; elsewhere JIT code is
    // emitted with explicit bounds checks and the registries are inert.
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_registry_round_trips() {
        register_guard_region(0x7000_0000, 0x1000);
        assert!(guard_region_is_registered(0x7000_0000));
        assert!(lookup(0x7000_0800, 0x1234).is_none()); // no code region

        register_code_region(0x1000, 0x100, 0x1080);
        assert_eq!(lookup(0x7000_0800, 0x1010), Some((0x1080, 0x10)));
        // Fault address outside any guard: not ours.
        assert!(lookup(0x6000_0000, 0x1010).is_none());

        unregister_code_region(0x1000);
        assert!(lookup(0x7000_0800, 0x1010).is_none());
        unregister_guard_region(0x7000_0000);
        assert!(!guard_region_is_registered(0x7000_0000));
    }

    #[test]
    fn fault_offset_is_consumed_once() {
        LAST_FAULT_OFFSET.store(0x44, Ordering::Relaxed);
        assert_eq!(take_last_fault_offset(), Some(0x44));
        assert_eq!(take_last_fault_offset(), None);
    }
}
