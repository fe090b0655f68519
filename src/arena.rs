//! The executable arena: one `mmap`'d region that linked code is written
//! into, then flipped from writable to executable exactly once.
//!
//! The AST, IR, and symbol tables need no arena of their own here — normal
//! Rust ownership (`Vec`, `Box`, interned `Id`s) already gives the
//! general-purpose, growable, automatically-freed storage the original's
//! `memarena`-based general arena provided by hand; duplicating that in
//! `unsafe` code would just be working around Rust's allocator, not using
//! it. Grounded in `original_source/incs/memarena.h`'s `arena_set_prot`
//! (one `mprotect` call over the whole block) and `srcs/cleanup/cleanup.c`
//! (`munmap` on teardown).

use std::ffi::c_void;
use std::io;

/// A page-aligned, anonymous, RW-mapped region sized up front. Code is
/// written into it while it's writable; [`ExecutableArena::make_executable`]
/// then flips the whole region to read+execute exactly once, matching the
/// original's `arena_set_prot(a, PROT_READ | PROT_EXEC)`.
pub struct ExecutableArena {
    base: *mut c_void,
    len: usize,
    executable: bool,
}

fn page_size() -> usize {
    // SAFETY: `sysconf` with `_SC_PAGESIZE` has no preconditions and never
    // fails in practice; a negative result just means "ask again never".
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

fn round_up_to_page(size: usize) -> usize {
    let page = page_size();
    (size + page - 1) & !(page - 1)
}

impl ExecutableArena {
    /// Reserve at least `min_size` bytes of RW, anonymous, page-aligned
    /// memory.
    pub fn new(min_size: usize) -> io::Result<Self> {
        let len = round_up_to_page(min_size.max(1));
        // SAFETY: a fixed set of flags with no file descriptor and no
        // fixed address requested; the returned pointer is checked against
        // MAP_FAILED before use.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(ExecutableArena {
            base,
            len,
            executable: false,
        })
    }

    /// Copy linked code into the arena. Must be called before
    /// [`Self::make_executable`].
    pub fn write(&mut self, code: &[u8]) {
        assert!(!self.executable, "cannot write to an arena already flipped to executable");
        assert!(code.len() <= self.len, "compiled code does not fit the reserved arena");
        // SAFETY: `base` is a live mapping of at least `self.len` writable
        // bytes, and `code.len() <= self.len` was just checked.
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), self.base as *mut u8, code.len());
        }
    }

    /// Flip the whole region to read+execute. Irreversible: once flipped,
    /// the arena can never be written to again, matching the JIT's
    /// write-xor-execute discipline.
    pub fn make_executable(&mut self) -> io::Result<()> {
        assert!(!self.executable, "arena already executable");
        // SAFETY: `base`/`len` describe the same mapping `mmap` returned.
        let rc = unsafe { libc::mprotect(self.base, self.len, libc::PROT_READ | libc::PROT_EXEC) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        self.executable = true;
        Ok(())
    }

    /// The address of byte 0 of the arena, to add function offsets to.
    pub fn base_addr(&self) -> usize {
        self.base as usize
    }

    /// Call `main`'s entry point as a no-argument function returning an
    /// `i64`. Must only be called after [`Self::make_executable`], with
    /// `offset` pointing at a real function prologue this module linked.
    ///
    /// # Safety
    /// The caller must guarantee `offset` is the start of a function this
    /// arena's code was compiled to follow the System V calling
    /// convention for a zero-argument call, and that this arena has
    /// already been made executable.
    pub unsafe fn call_entry(&self, offset: usize) -> i64 {
        assert!(self.executable, "arena must be executable before invoking compiled code");
        let entry: extern "C" fn() -> i64 = std::mem::transmute(self.base.add(offset));
        entry()
    }
}

impl Drop for ExecutableArena {
    fn drop(&mut self) {
        // SAFETY: `base`/`len` describe exactly the mapping `mmap` made;
        // dropped at most once since `Drop::drop` runs once per value.
        unsafe {
            libc::munmap(self.base, self.len);
        }
    }
}

// The raw pointer is to an OS-backed mapping, not thread-local state; the
// arena itself enforces the write-then-flip-then-call ordering that makes
// sharing it across threads sound for our single-invocation use.
unsafe impl Send for ExecutableArena {}
unsafe impl Sync for ExecutableArena {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserves_at_least_the_requested_size() {
        let arena = ExecutableArena::new(10).unwrap();
        assert!(arena.len >= 10);
    }

    #[test]
    fn write_then_flip_then_call_runs_the_written_code() {
        // `mov eax, 42; ret` (32-bit mov zero-extends into rax).
        let code: [u8; 6] = [0xB8, 42, 0, 0, 0, 0xC3];
        let mut arena = ExecutableArena::new(code.len()).unwrap();
        arena.write(&code);
        arena.make_executable().unwrap();
        let result = unsafe { arena.call_entry(0) };
        assert_eq!(result, 42);
    }
}
