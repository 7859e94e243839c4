// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Linear memory.
//!
//! Each memory is an mmap-backed byte region. For 32-bit memories on 64-bit
//! hosts the full 4 GiB data span plus a 4 GiB + 64 KiB PROT_NONE guard is
//! reserved up front, so growth never moves the base and JIT code can elide
//! per-access bounds branches; a fault in the guard is routed to an
//! out-of-bounds trap by the signal router. 64-bit memories are always
//! explicitly bounds-checked and carry no guard.
//!
//! Effective addresses use 33-bit arithmetic for 32-bit memories (u64 for
//! 64-bit ones); `effective + width` is compared against the byte length
//! before any dereference.

use std::ptr;

use tracing::trace;

use crate::runtime::TrapKind;
use crate::types::MemoryType;

/// The span a 32-bit guard-mode memory reserves for data.
const WASM32_DATA_SPAN: usize = 1 << 32;
/// Guard region: 4 GiB + 64 KiB, covering every u33 effective address plus
/// the widest access.
pub(crate) const GUARD_SPAN: usize = (1 << 32) + (64 << 10);

pub(crate) struct LinearMemory {
    base: *mut u8,
    /// Accessible byte length.
    size: usize,
    /// Total reserved mapping length.
    reserved: usize,
    ty: MemoryType,
    /// Current size in pages.
    pages: u64,
    /// Effective page ceiling (declared max intersected with the embedder's
    /// memory ceiling).
    max_pages: u64,
    /// Whether the mapping carries the PROT_NONE guard.
    guarded: bool,
}

// The raw pointer is owned uniquely by this structure.
unsafe impl Send for LinearMemory {}

impl LinearMemory {
    /// Creates a memory of the type's minimum size. `ceiling_bytes`
    /// optionally caps growth below the declared maximum.
    pub(crate) fn new(ty: MemoryType, ceiling_bytes: Option<u64>) -> Result<Self, TrapKind> {
        let page_size = ty.page_size();
        let mut max_pages = ty.limits.max.unwrap_or(ty.absolute_max_pages());
        if let Some(ceiling) = ceiling_bytes {
            max_pages = max_pages.min(ceiling / page_size);
        }
        if ty.limits.min > max_pages {
            return Err(TrapKind::MemoryLimitExceeded);
        }

        let size = (ty.limits.min * page_size) as usize;
        // Guard mode needs the 32-bit address space to be reservable and
        // the fault router to be available.
        let guarded =
            !ty.memory64 && cfg!(all(target_pointer_width = "64", target_os = "linux"));
        let reserved = if guarded {
            WASM32_DATA_SPAN + GUARD_SPAN
        } else {
            (max_pages * page_size) as usize
        };

        let base = if reserved == 0 {
            ptr::null_mut()
        } else {
            // Safety: anonymous reservation; accessibility is granted below.
            let mapped = unsafe {
                libc::mmap(
                    ptr::null_mut(),
                    reserved,
                    libc::PROT_NONE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                    -1,
                    0,
                )
            };
            if mapped == libc::MAP_FAILED {
                return Err(TrapKind::MemoryLimitExceeded);
            }
            mapped.cast::<u8>()
        };

        if size > 0 {
            // Safety: `base..base+size` lies inside the fresh reservation.
            let rc = unsafe {
                libc::mprotect(base.cast(), size, libc::PROT_READ | libc::PROT_WRITE)
            };
            if rc != 0 {
                // Safety: unmapping the reservation we just created.
                unsafe { libc::munmap(base.cast(), reserved) };
                return Err(TrapKind::MemoryLimitExceeded);
            }
        }

        if guarded && !base.is_null() {
            crate::jit::fault::register_guard_region(base as usize, reserved);
        }
        trace!(pages = ty.limits.min, guarded, "created linear memory");

        Ok(Self {
            base,
            size,
            reserved,
            ty,
            pages: ty.limits.min,
            max_pages,
            guarded,
        })
    }

    pub(crate) fn ty(&self) -> &MemoryType {
        &self.ty
    }

    /// Current size in pages.
    pub(crate) fn pages(&self) -> u64 {
        self.pages
    }

    /// Current size in bytes.
    pub(crate) fn byte_size(&self) -> usize {
        self.size
    }

    pub(crate) fn base_ptr(&self) -> *mut u8 {
        self.base
    }

    pub(crate) fn is_guarded(&self) -> bool {
        self.guarded
    }

    // Computes and checks the effective address of an access, returning its
    // byte offset. 33-bit arithmetic for 32-bit memories: both operands are
    // in [0, 2^32), so u64 addition cannot wrap and stands in for u33.
    #[inline]
    fn effective(&self, addr: u64, offset: u64, width: usize) -> Result<usize, TrapKind> {
        let effective = if self.ty.memory64 {
            addr.checked_add(offset)
                .ok_or(TrapKind::OutOfBoundsMemoryAccess)?
        } else {
            addr + offset
        };
        let end = effective
            .checked_add(width as u64)
            .ok_or(TrapKind::OutOfBoundsMemoryAccess)?;
        if end > self.size as u64 {
            return Err(TrapKind::OutOfBoundsMemoryAccess);
        }
        Ok(effective as usize)
    }

    #[inline]
    pub(crate) fn load<const WIDTH: usize>(
        &self,
        addr: u64,
        offset: u64,
    ) -> Result<[u8; WIDTH], TrapKind> {
        let at = self.effective(addr, offset, WIDTH)?;
        let mut out = [0u8; WIDTH];
        // Safety: `at + WIDTH <= size` per the check above.
        unsafe { ptr::copy_nonoverlapping(self.base.add(at), out.as_mut_ptr(), WIDTH) };
        Ok(out)
    }

    #[inline]
    pub(crate) fn store<const WIDTH: usize>(
        &mut self,
        addr: u64,
        offset: u64,
        bytes: [u8; WIDTH],
    ) -> Result<(), TrapKind> {
        let at = self.effective(addr, offset, WIDTH)?;
        // Safety: `at + WIDTH <= size` per the check above.
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), self.base.add(at), WIDTH) };
        Ok(())
    }

    /// Reads `len` bytes at `addr` into a fresh buffer.
    pub(crate) fn read(&self, addr: u64, len: usize) -> Result<Vec<u8>, TrapKind> {
        let at = self.effective(addr, 0, len)?;
        let mut out = vec![0u8; len];
        // Safety: range checked above.
        unsafe { ptr::copy_nonoverlapping(self.base.add(at), out.as_mut_ptr(), len) };
        Ok(out)
    }

    /// Writes `bytes` at `addr`.
    pub(crate) fn write(&mut self, addr: u64, bytes: &[u8]) -> Result<(), TrapKind> {
        let at = self.effective(addr, 0, bytes.len())?;
        // Safety: range checked above.
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), self.base.add(at), bytes.len()) };
        Ok(())
    }

    /// `memory.fill`: bounds are verified before any byte is written.
    pub(crate) fn fill(&mut self, addr: u64, value: u8, len: u64) -> Result<(), TrapKind> {
        let at = self.effective(addr, 0, 0)?;
        let end = (addr)
            .checked_add(len)
            .ok_or(TrapKind::OutOfBoundsMemoryAccess)?;
        if end > self.size as u64 {
            return Err(TrapKind::OutOfBoundsMemoryAccess);
        }
        // Safety: `at + len <= size` per the checks above.
        unsafe { ptr::write_bytes(self.base.add(at), value, len as usize) };
        Ok(())
    }

    /// `memory.copy` within one memory; overlapping ranges copy as if
    /// buffered. Both ends are checked before any byte moves.
    pub(crate) fn copy_within(&mut self, dst: u64, src: u64, len: u64) -> Result<(), TrapKind> {
        let size = self.size as u64;
        let dst_end = dst.checked_add(len).ok_or(TrapKind::OutOfBoundsMemoryAccess)?;
        let src_end = src.checked_add(len).ok_or(TrapKind::OutOfBoundsMemoryAccess)?;
        if dst_end > size || src_end > size {
            return Err(TrapKind::OutOfBoundsMemoryAccess);
        }
        // Safety: both ranges verified in-bounds; copy handles overlap.
        unsafe {
            ptr::copy(
                self.base.add(src as usize),
                self.base.add(dst as usize),
                len as usize,
            );
        }
        Ok(())
    }

    /// Cross-memory `memory.copy`. Both ends are checked before any byte
    /// moves.
    pub(crate) fn copy_between(
        dst: &mut LinearMemory,
        dst_addr: u64,
        src: &LinearMemory,
        src_addr: u64,
        len: u64,
    ) -> Result<(), TrapKind> {
        let dst_end = dst_addr
            .checked_add(len)
            .ok_or(TrapKind::OutOfBoundsMemoryAccess)?;
        let src_end = src_addr
            .checked_add(len)
            .ok_or(TrapKind::OutOfBoundsMemoryAccess)?;
        if dst_end > dst.size as u64 || src_end > src.size as u64 {
            return Err(TrapKind::OutOfBoundsMemoryAccess);
        }
        // Safety: distinct memories, ranges verified in-bounds.
        unsafe {
            ptr::copy_nonoverlapping(
                src.base.add(src_addr as usize),
                dst.base.add(dst_addr as usize),
                len as usize,
            );
        }
        Ok(())
    }

    /// `memory.init` from a passive data segment.
    pub(crate) fn init(
        &mut self,
        dst: u64,
        data: &[u8],
        src: u64,
        len: u64,
    ) -> Result<(), TrapKind> {
        let src_end = src.checked_add(len).ok_or(TrapKind::OutOfBoundsMemoryAccess)?;
        let dst_end = dst.checked_add(len).ok_or(TrapKind::OutOfBoundsMemoryAccess)?;
        if src_end > data.len() as u64 || dst_end > self.size as u64 {
            return Err(TrapKind::OutOfBoundsMemoryAccess);
        }
        // Safety: destination verified in-bounds above.
        unsafe {
            ptr::copy_nonoverlapping(
                data.as_ptr().add(src as usize),
                self.base.add(dst as usize),
                len as usize,
            );
        }
        Ok(())
    }

    /// Grows by `delta` pages, returning the previous page count, or None
    /// when the request exceeds the limits (the caller translates that to
    /// the -1 / 2^64-1 result value).
    pub(crate) fn grow(&mut self, delta: u64) -> Option<u64> {
        let prior = self.pages;
        if delta == 0 {
            return Some(prior);
        }
        let new_pages = prior.checked_add(delta)?;
        if new_pages > self.max_pages {
            return None;
        }
        let page_size = self.ty.page_size();
        let new_size = (new_pages * page_size) as usize;

        if new_size <= self.reserved {
            // In-place: widen the accessible prefix.
            // Safety: the range lies inside our reservation.
            let rc = unsafe {
                libc::mprotect(
                    self.base.cast(),
                    new_size,
                    libc::PROT_READ | libc::PROT_WRITE,
                )
            };
            if rc != 0 {
                return None;
            }
        } else {
            // Unguarded growth past the reservation: remap, possibly
            // moving the base.
            let new_base = self.remap(new_size)?;
            self.base = new_base;
            self.reserved = new_size;
        }
        self.pages = new_pages;
        self.size = new_size;
        trace!(from = prior, to = new_pages, "memory.grow");
        Some(prior)
    }

    #[cfg(target_os = "linux")]
    fn remap(&mut self, new_size: usize) -> Option<*mut u8> {
        // Safety: remapping our own allocation; MREMAP_MAYMOVE keeps it
        // valid even when the neighborhood is occupied.
        let remapped = unsafe {
            libc::mremap(
                self.base.cast(),
                self.reserved,
                new_size,
                libc::MREMAP_MAYMOVE,
            )
        };
        if remapped == libc::MAP_FAILED {
            return None;
        }
        Some(remapped.cast())
    }

    #[cfg(not(target_os = "linux"))]
    fn remap(&mut self, new_size: usize) -> Option<*mut u8> {
        // Safety: fresh anonymous mapping; old contents are copied over and
        // the old mapping released.
        unsafe {
            let mapped = libc::mmap(
                ptr::null_mut(),
                new_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            if mapped == libc::MAP_FAILED {
                return None;
            }
            ptr::copy_nonoverlapping(self.base, mapped.cast::<u8>(), self.size);
            libc::munmap(self.base.cast(), self.reserved);
            Some(mapped.cast())
        }
    }
}

impl Drop for LinearMemory {
    fn drop(&mut self) {
        if !self.base.is_null() {
            if self.guarded {
                crate::jit::fault::unregister_guard_region(self.base as usize);
            }
            // Safety: unmapping the reservation created in `new`/`remap`.
            unsafe { libc::munmap(self.base.cast(), self.reserved) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Limits;

    fn mem32(min: u64, max: Option<u64>) -> LinearMemory {
        LinearMemory::new(
            MemoryType {
                limits: Limits { min, max },
                shared: false,
                memory64: false,
                page_size_log2: None,
            },
            None,
        )
        .unwrap()
    }

    #[test]
    fn store_then_load_round_trips() {
        let mut mem = mem32(1, Some(2));
        mem.store::<4>(16, 0, 0xdead_beef_u32.to_le_bytes()).unwrap();
        let loaded = u32::from_le_bytes(mem.load::<4>(12, 4).unwrap());
        assert_eq!(loaded, 0xdead_beef);
    }

    #[test]
    fn oob_access_traps() {
        let mut mem = mem32(1, Some(1));
        // One page: bytes [0, 65536). A 4-byte load ending at 65537 is out.
        assert_eq!(
            mem.load::<4>(65533, 0).unwrap_err(),
            TrapKind::OutOfBoundsMemoryAccess
        );
        // The u33 sum addr + offset must not wrap into range.
        assert_eq!(
            mem.load::<4>(u32::MAX as u64, 8).unwrap_err(),
            TrapKind::OutOfBoundsMemoryAccess
        );
        assert!(mem.store::<4>(65532, 0, [0; 4]).is_ok());
    }

    #[test]
    fn grow_reports_prior_size_and_respects_max() {
        let mut mem = mem32(1, Some(3));
        assert_eq!(mem.grow(1), Some(1));
        assert_eq!(mem.pages(), 2);
        assert_eq!(mem.grow(0), Some(2));
        assert_eq!(mem.grow(2), None); // over max
        assert_eq!(mem.pages(), 2);

        // Newly grown pages are zeroed and writable.
        assert_eq!(mem.load::<4>(65536 + 100, 0).unwrap(), [0; 4]);
        mem.store::<4>(65536 + 100, 0, [1, 2, 3, 4]).unwrap();
    }

    #[test]
    fn fill_and_copy_check_bounds_first() {
        let mut mem = mem32(1, Some(1));
        assert_eq!(
            mem.fill(65530, 0xab, 10).unwrap_err(),
            TrapKind::OutOfBoundsMemoryAccess
        );
        // The failed fill must not have written anything.
        assert_eq!(mem.load::<1>(65530, 0).unwrap(), [0]);

        mem.fill(0, 0x5a, 8).unwrap();
        mem.copy_within(16, 0, 8).unwrap();
        assert_eq!(mem.load::<8>(16, 0).unwrap(), [0x5a; 8]);

        assert_eq!(
            mem.copy_within(65530, 0, 16).unwrap_err(),
            TrapKind::OutOfBoundsMemoryAccess
        );
    }

    #[test]
    fn ceiling_caps_growth() {
        let mem = LinearMemory::new(
            MemoryType {
                limits: Limits { min: 1, max: None },
                shared: false,
                memory64: false,
                page_size_log2: None,
            },
            Some(2 * 65536),
        );
        let mut mem = mem.unwrap();
        assert_eq!(mem.grow(1), Some(1));
        assert_eq!(mem.grow(1), None);
    }
}
