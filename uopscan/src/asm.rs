//! Backing memory for emitted code, and cache maintenance on it.

use nix::sys::mman::{ ProtFlags, MapFlags, mmap, munmap };

use crate::error::{ HarnessError, Result };

/// Type of a function emitted into a [CodeArena].
/// This is the signature used to call emitted code from Rust.
pub type MeasuredFn = extern "C" fn(usize, usize) -> usize;

/// Size of a cache line on every machine we care about.
pub const CACHE_LINE: usize = 64;

enum Backing {
    /// Fixed anonymous RWX mapping (unmapped on drop).
    Fixed,
    /// Anonymous RW mapping at an address picked by the kernel.
    /// Never executed; used for the model machine and for tests.
    Anon(memmap2::MmapMut),
}

/// A block of memory that we write code into *and* later execute.
///
/// Unlike [dynasmrt::ExecutableBuffer], the mapping is writable for its
/// entire lifetime: the test pad is rewritten before every measurement, and
/// we don't want an `mprotect()` in the middle of that.
pub struct CodeArena {
    /// Pointer to backing allocation
    ptr: *mut u8,
    /// Size of backing allocation
    len: usize,
    backing: Backing,
}

impl CodeArena {
    /// Obtain an anonymous fixed RWX mapping at the requested address.
    ///
    /// NOTE: Userspace ends at `0000_7fff_ffff_ffff`.
    /// See https://www.kernel.org/doc/html/latest/arch/x86/x86_64/mm.html
    pub fn fixed(req_addr: usize, len: usize) -> Result<Self> {
        assert!(req_addr + len < 0x0000_7fff_ffff_ffff,
            "Requested allocation {:016x}-{:016x} exceeds userspace limits?",
            req_addr, req_addr + len
        );
        assert!(req_addr % CACHE_LINE == 0);

        let addr = std::num::NonZeroUsize::new(req_addr);
        let size = std::num::NonZeroUsize::new(len)
            .ok_or(HarnessError::Map { addr: req_addr, len,
                errno: nix::errno::Errno::EINVAL
            })?;
        let prot = ProtFlags::PROT_READ
                 | ProtFlags::PROT_WRITE
                 | ProtFlags::PROT_EXEC;
        let flag = MapFlags::MAP_ANONYMOUS
                 | MapFlags::MAP_PRIVATE
                 | MapFlags::MAP_FIXED
                 | MapFlags::MAP_POPULATE;
        let ptr = unsafe { mmap(addr, size, prot, flag, -1, 0) }
            .map_err(|errno| HarnessError::Map { addr: req_addr, len, errno })?;
        assert!(ptr as usize == req_addr);
        Ok(Self { ptr: ptr as *mut u8, len, backing: Backing::Fixed })
    }

    /// Obtain an anonymous read/write mapping anywhere.
    pub fn anywhere(len: usize) -> Result<Self> {
        let mut map = memmap2::MmapOptions::new().len(len).map_anon()?;
        let ptr = map.as_mut_ptr();
        Ok(Self { ptr, len, backing: Backing::Anon(map) })
    }

    /// Return the base address of the mapping.
    pub fn base_addr(&self) -> usize { self.ptr as usize }

    pub fn len(&self) -> usize { self.len }

    pub fn is_executable(&self) -> bool {
        matches!(self.backing, Backing::Fixed)
    }

    /// Return the bytes in `[offset, offset + len)`.
    pub fn bytes(&self, offset: usize, len: usize) -> &[u8] {
        assert!(offset + len <= self.len);
        unsafe { std::slice::from_raw_parts(self.ptr.add(offset), len) }
    }

    /// Copy `src` into the arena at `offset`.
    pub fn write(&mut self, offset: usize, src: &[u8]) {
        assert!(offset + src.len() <= self.len,
            "Write {:x}+{:x} would overflow arena ({:x} bytes)",
            offset, src.len(), self.len
        );
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(),
                self.ptr.add(offset), src.len()
            );
        }
    }

    /// Fill `[offset, offset + len)` with a single byte.
    pub fn fill(&mut self, offset: usize, len: usize, byte: u8) {
        assert!(offset + len <= self.len);
        unsafe { std::ptr::write_bytes(self.ptr.add(offset), byte, len); }
    }

    /// Force `[offset, offset + len)` out of every level of the cache
    /// hierarchy, so the next fetch has to see the bytes currently in memory.
    pub fn flush(&mut self, offset: usize, len: usize) {
        assert!(offset + len <= self.len);
        unsafe { flush_lines(self.ptr.add(offset), len) }
    }

    /// Return a function pointer [MeasuredFn] to code at `offset`.
    ///
    /// # Safety
    /// The caller must have written a complete function at `offset`.
    pub unsafe fn as_fn(&self, offset: usize) -> MeasuredFn {
        assert!(self.is_executable());
        assert!(offset < self.len);
        unsafe { std::mem::transmute(self.ptr.add(offset)) }
    }
}

/// Presumably we want to call `munmap` when this object is destroyed.
impl Drop for CodeArena {
    fn drop(&mut self) {
        if let Backing::Fixed = self.backing {
            unsafe {
                let _ = munmap(self.ptr as *mut std::ffi::c_void, self.len);
            }
        }
    }
}

/// Write every byte in the range back over itself, drain the store buffer,
/// then CLFLUSH each line and wait for the flushes to complete.
///
/// The self-copy makes sure that every line is treated as modified code
/// (which invalidates the decoded stream buffer on Intel parts) even when
/// the caller didn't touch all of it.
#[cfg(target_arch = "x86_64")]
unsafe fn flush_lines(ptr: *mut u8, len: usize) {
    use std::arch::x86_64::{ _mm_clflush, _mm_mfence, _mm_sfence };
    unsafe {
        for i in 0..len {
            let p = ptr.add(i);
            std::ptr::write_volatile(p, std::ptr::read_volatile(p));
        }
        _mm_sfence();
        let start = (ptr as usize) & !(CACHE_LINE - 1);
        let end = ptr as usize + len;
        let mut line = start;
        while line < end {
            _mm_clflush(line as *const u8);
            line += CACHE_LINE;
        }
        _mm_mfence();
    }
}

#[cfg(not(target_arch = "x86_64"))]
unsafe fn flush_lines(_ptr: *mut u8, _len: usize) {
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn anon_arena_write_fill_flush() {
        let mut arena = CodeArena::anywhere(0x1000).unwrap();
        assert!(!arena.is_executable());
        assert_eq!(arena.base_addr() % CACHE_LINE, 0);

        arena.fill(0, 0x200, 0x90);
        arena.write(0x10, &[0x0f, 0x1f, 0x00]);
        arena.flush(0, 0x200);
        assert_eq!(arena.bytes(0x0e, 6), &[0x90, 0x90, 0x0f, 0x1f, 0x00, 0x90]);
    }

    #[test]
    #[should_panic]
    fn write_past_end() {
        let mut arena = CodeArena::anywhere(0x40).unwrap();
        arena.write(0x3e, &[0; 4]);
    }
}
