//! Executable memory for compiled blocks.
//!
//! One `mmap`ed slab is carved up bump-allocator style and only ever released as a whole. The
//! slab is never writable and executable at the same time: Linux flips page protections around
//! each write, macOS uses `MAP_JIT` with the per-thread write-protect toggle.

use std::io;
use std::ptr::NonNull;

use rustc_hash::FxHashMap;

use super::CodeCacheError;
use crate::block::Location;

const ALIGN: usize = 16;

/// Where a block's code lives inside the slab.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct CodeHandle {
    offset: usize,
    len: usize,
}

pub struct CodeCache {
    base: NonNull<u8>,
    capacity: usize,
    used: usize,
    entries: FxHashMap<Location, CodeHandle>,
}

// The slab is owned exclusively; raw pointers only keep it from being `Send` by default.
unsafe impl Send for CodeCache {}

impl CodeCache {
    /// Reserves at least `capacity` bytes, rounded up to whole pages.
    pub fn new(capacity: usize) -> Result<Self, CodeCacheError> {
        let page = page_size();
        let capacity = capacity.max(1).div_ceil(page) * page;
        let base = map(capacity)?;
        Ok(Self {
            base,
            capacity,
            used: 0,
            entries: FxHashMap::default(),
        })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes handed out since the last reset.
    #[inline]
    pub fn used(&self) -> usize {
        self.used
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, location: &Location) -> bool {
        self.entries.contains_key(location)
    }

    /// Entry point of the code stored for `location`.
    pub fn get(&self, location: &Location) -> Option<*const u8> {
        let handle = self.entries.get(location)?;
        // In bounds: handles are only created by `insert`.
        Some(unsafe { self.base.as_ptr().add(handle.offset) } as *const u8)
    }

    /// The machine code stored for `location`, for dumps and tests.
    pub fn code(&self, location: &Location) -> Option<&[u8]> {
        let handle = self.entries.get(location)?;
        // SAFETY: the slab is always readable and the handle lies inside it.
        Some(unsafe {
            std::slice::from_raw_parts(self.base.as_ptr().add(handle.offset), handle.len)
        })
    }

    /// Copies `code` into the slab and records it under `location`.
    ///
    /// # Panics
    ///
    /// If `location` already has code. Callers check [`CodeCache::contains`] first.
    pub fn insert(&mut self, location: Location, code: &[u8]) -> Result<*const u8, CodeCacheError> {
        assert!(
            !self.entries.contains_key(&location),
            "code for {location} inserted twice"
        );
        let offset = self.used.next_multiple_of(ALIGN);
        let end = offset
            .checked_add(code.len())
            .filter(|&end| end <= self.capacity)
            .ok_or(CodeCacheError::Exhausted {
                requested: code.len(),
                capacity: self.capacity,
            })?;

        {
            let window = WriteWindow::open(self.base, self.capacity)?;
            // SAFETY: `offset..end` lies inside the slab and nothing executes while we write.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    code.as_ptr(),
                    self.base.as_ptr().add(offset),
                    code.len(),
                );
            }
            window.close()?;
        }
        flush_icache(unsafe { self.base.as_ptr().add(offset) }, code.len());

        self.used = end;
        self.entries.insert(
            location,
            CodeHandle {
                offset,
                len: code.len(),
            },
        );
        Ok(unsafe { self.base.as_ptr().add(offset) } as *const u8)
    }

    /// Forgets every block. Previously returned entry points must no longer be called.
    pub fn reset(&mut self) {
        self.entries.clear();
        self.used = 0;
    }
}

impl Drop for CodeCache {
    fn drop(&mut self) {
        // SAFETY: `base..base + capacity` was returned by `mmap` in `new`.
        let rc = unsafe { libc::munmap(self.base.as_ptr().cast(), self.capacity) };
        if rc != 0 {
            tracing::error!(error = %io::Error::last_os_error(), "munmap of code cache failed");
        }
    }
}

impl core::fmt::Debug for CodeCache {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CodeCache")
            .field("capacity", &self.capacity)
            .field("used", &self.used)
            .field("blocks", &self.entries.len())
            .finish()
    }
}

fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

// ---- Platform ----

#[cfg(not(target_os = "macos"))]
fn map(len: usize) -> Result<NonNull<u8>, CodeCacheError> {
    // SAFETY: anonymous private mapping, no address hint.
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_EXEC,
            libc::MAP_ANON | libc::MAP_PRIVATE,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(CodeCacheError::Map(io::Error::last_os_error()));
    }
    NonNull::new(ptr.cast()).ok_or_else(|| CodeCacheError::Map(io::ErrorKind::Other.into()))
}

#[cfg(target_os = "macos")]
fn map(len: usize) -> Result<NonNull<u8>, CodeCacheError> {
    // SAFETY: anonymous private mapping, no address hint.
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            libc::MAP_ANON | libc::MAP_PRIVATE | libc::MAP_JIT,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(CodeCacheError::Map(io::Error::last_os_error()));
    }
    NonNull::new(ptr.cast()).ok_or_else(|| CodeCacheError::Map(io::ErrorKind::Other.into()))
}

/// Keeps the slab writable (and not executable) while alive.
struct WriteWindow {
    base: NonNull<u8>,
    len: usize,
    open: bool,
}

impl WriteWindow {
    #[cfg(not(target_os = "macos"))]
    fn open(base: NonNull<u8>, len: usize) -> Result<Self, CodeCacheError> {
        protect(base, len, libc::PROT_READ | libc::PROT_WRITE)?;
        Ok(Self {
            base,
            len,
            open: true,
        })
    }

    #[cfg(target_os = "macos")]
    fn open(base: NonNull<u8>, len: usize) -> Result<Self, CodeCacheError> {
        // SAFETY: toggles the calling thread's view of MAP_JIT pages.
        unsafe {
            if pthread_jit_write_protect_supported_np() != 0 {
                pthread_jit_write_protect_np(0);
            }
        }
        Ok(Self {
            base,
            len,
            open: true,
        })
    }

    fn close(mut self) -> Result<(), CodeCacheError> {
        self.open = false;
        seal(self.base, self.len)
    }
}

impl Drop for WriteWindow {
    fn drop(&mut self) {
        if self.open {
            if let Err(error) = seal(self.base, self.len) {
                tracing::error!(%error, "failed to re-protect code cache");
            }
        }
    }
}

#[cfg(not(target_os = "macos"))]
fn seal(base: NonNull<u8>, len: usize) -> Result<(), CodeCacheError> {
    protect(base, len, libc::PROT_READ | libc::PROT_EXEC)
}

#[cfg(target_os = "macos")]
fn seal(_base: NonNull<u8>, _len: usize) -> Result<(), CodeCacheError> {
    // SAFETY: see `WriteWindow::open`.
    unsafe {
        if pthread_jit_write_protect_supported_np() != 0 {
            pthread_jit_write_protect_np(1);
        }
    }
    Ok(())
}

#[cfg(not(target_os = "macos"))]
fn protect(base: NonNull<u8>, len: usize, prot: libc::c_int) -> Result<(), CodeCacheError> {
    // SAFETY: `base..base + len` is the page-aligned slab from `map`.
    let rc = unsafe { libc::mprotect(base.as_ptr().cast(), len, prot) };
    if rc != 0 {
        return Err(CodeCacheError::Protect(io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(all(target_arch = "aarch64", not(target_os = "macos")))]
fn flush_icache(start: *mut u8, len: usize) {
    // SAFETY: the range was just written and lies inside the slab.
    unsafe { __clear_cache(start.cast(), start.add(len).cast()) }
}

#[cfg(target_os = "macos")]
fn flush_icache(start: *mut u8, len: usize) {
    // SAFETY: the range was just written and lies inside the slab.
    unsafe { sys_icache_invalidate(start.cast(), len) }
}

/// Instruction and data caches are coherent here.
#[cfg(not(any(target_arch = "aarch64", target_os = "macos")))]
fn flush_icache(_start: *mut u8, _len: usize) {}

#[cfg(target_os = "macos")]
extern "C" {
    fn pthread_jit_write_protect_supported_np() -> libc::c_int;
    fn pthread_jit_write_protect_np(enabled: libc::c_int);
    fn sys_icache_invalidate(start: *mut libc::c_void, len: libc::size_t);
}

#[cfg(all(target_arch = "aarch64", not(target_os = "macos")))]
extern "C" {
    fn __clear_cache(begin: *mut libc::c_char, end: *mut libc::c_char);
}

#[cfg(test)]
mod tests {
    use super::*;
    use duet_types::Mode;

    fn at(address: u32) -> Location {
        Location {
            address,
            mode: Mode::System,
            thumb: false,
        }
    }

    #[test]
    fn capacity_is_rounded_to_pages() {
        let cache = CodeCache::new(1).unwrap();
        assert_eq!(cache.capacity(), page_size());
        assert!(cache.is_empty());
    }

    #[test]
    fn insert_then_get() {
        let mut cache = CodeCache::new(4096).unwrap();
        let code = [0xC0, 0x03, 0x5F, 0xD6];
        let entry = cache.insert(at(0x100), &code).unwrap();
        assert_eq!(cache.get(&at(0x100)), Some(entry));
        assert!(cache.contains(&at(0x100)));
        assert!(!cache.contains(&at(0x104)));
        assert_eq!(cache.code(&at(0x100)), Some(&code[..]));

        let second = cache.insert(at(0x104), &code).unwrap();
        assert_eq!(second as usize - entry as usize, ALIGN);
    }

    #[test]
    fn exhaustion_then_reset() {
        let mut cache = CodeCache::new(4096).unwrap();
        let big = vec![0u8; cache.capacity()];
        cache.insert(at(0), &big).unwrap();
        let err = cache.insert(at(4), &[0; 4]).unwrap_err();
        assert!(matches!(err, CodeCacheError::Exhausted { requested: 4, .. }));

        cache.reset();
        assert!(cache.is_empty());
        assert_eq!(cache.used(), 0);
        cache.insert(at(4), &[0; 4]).unwrap();
    }

    #[test]
    #[should_panic(expected = "inserted twice")]
    fn duplicate_insert_panics() {
        let mut cache = CodeCache::new(4096).unwrap();
        cache.insert(at(0), &[0; 4]).unwrap();
        let _ = cache.insert(at(0), &[0; 4]);
    }
}
