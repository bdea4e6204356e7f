//! Executable code regions
//!
//! A region is born writable, receives one image, and is then locked
//! read+exec for the rest of its life:
//!
//! ```text
//! WritableRegion --lock()--> LockedRegion --drop--> unmapped
//! ```
//!
//! There is no transition back. All protection changes are serialised by a
//! process-wide text mutex, and every mapped byte is charged against a global
//! budget.

use parking_lot::Mutex;
use rand::Rng;
use std::io;
use std::ops::Range;
use std::ptr::NonNull;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::RegionError;

/// Bytes reserved beyond the image so the start offset can be randomised
const MIN_HOLE: usize = 128;

static TEXT_MUTEX: Mutex<()> = parking_lot::const_mutex(());
static JIT_CURRENT: AtomicUsize = AtomicUsize::new(0);
static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

/// System page size
pub fn page_size() -> usize {
    *PAGE_SIZE.get_or_init(sys::page_size)
}

/// Bytes of compiled code currently mapped
pub fn jit_memory_in_use() -> usize {
    JIT_CURRENT.load(Ordering::Relaxed)
}

fn charge(size: usize, limit: usize, privileged: bool) -> Result<(), RegionError> {
    let mut in_use = JIT_CURRENT.load(Ordering::Relaxed);
    loop {
        let next = in_use.saturating_add(size);
        if next > limit && !privileged {
            return Err(RegionError::LimitExceeded {
                requested: size,
                in_use,
                limit,
            });
        }
        match JIT_CURRENT.compare_exchange_weak(in_use, next, Ordering::Relaxed, Ordering::Relaxed)
        {
            Ok(_) => return Ok(()),
            Err(actual) => in_use = actual,
        }
    }
}

fn uncharge(size: usize) {
    JIT_CURRENT.fetch_sub(size, Ordering::Relaxed);
}

/// Owned mapping; unmapped and uncharged on drop
struct RawRegion {
    base: NonNull<u8>,
    size: usize,
    /// Permissions were changed and must be restored before unmapping
    reset_perms: bool,
}

// SAFETY: the mapping is exclusively owned by this value.
unsafe impl Send for RawRegion {}
// SAFETY: shared access is read-only once the region is locked, and
// `WritableRegion` only hands out mutable slices through `&mut self`.
unsafe impl Sync for RawRegion {}

impl Drop for RawRegion {
    fn drop(&mut self) {
        if self.reset_perms {
            let _text = TEXT_MUTEX.lock();
            if let Err(err) = sys::protect(self.base, self.size, sys::Prot::ReadWrite) {
                tracing::warn!(target: "sieve::jit", %err, "failed to reset code permissions");
            }
        }
        sys::unmap(self.base, self.size);
        uncharge(self.size);
        tracing::debug!(target: "sieve::jit", size = self.size, "code region freed");
    }
}

/// Freshly mapped region that can still be written
pub struct WritableRegion {
    raw: RawRegion,
    image_start: usize,
    image_len: usize,
}

impl std::fmt::Debug for WritableRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WritableRegion")
            .field("size", &self.raw.size)
            .field("image_start", &self.image_start)
            .field("image_len", &self.image_len)
            .finish()
    }
}

fn map_failed(size: usize, source: io::Error) -> RegionError {
    if source.kind() == io::ErrorKind::Unsupported {
        return RegionError::Unsupported;
    }
    RegionError::Map { size, source }
}

fn protect_failed(source: io::Error) -> RegionError {
    if source.kind() == io::ErrorKind::Unsupported {
        return RegionError::Unsupported;
    }
    RegionError::Protect(source)
}

impl WritableRegion {
    /// Map a region large enough for `image_len` bytes.
    ///
    /// The whole mapping is filled by `poison` first; the image then starts at
    /// a random multiple of `align` inside the first page hole. `align` must be
    /// a power of two.
    pub fn alloc<F>(
        image_len: usize,
        align: usize,
        poison: F,
        limit: usize,
        privileged: bool,
    ) -> Result<Self, RegionError>
    where
        F: FnOnce(&mut [u8]),
    {
        if image_len == 0 {
            return Err(RegionError::EmptyImage);
        }
        debug_assert!(align.is_power_of_two());

        let page = page_size();
        let size = (image_len + MIN_HOLE).div_ceil(page) * page;
        charge(size, limit, privileged)?;

        let base = match sys::map(size) {
            Ok(base) => base,
            Err(source) => {
                uncharge(size);
                return Err(map_failed(size, source));
            }
        };
        let raw = RawRegion {
            base,
            size,
            reset_perms: false,
        };

        // SAFETY: `base` points to `size` writable bytes owned by `raw`.
        let bytes = unsafe { std::slice::from_raw_parts_mut(raw.base.as_ptr(), size) };
        poison(bytes);

        let hole = (size - image_len).min(page);
        let image_start = rand::rng().random_range(0..hole) & !(align - 1);

        tracing::debug!(
            target: "sieve::jit",
            size,
            image_len,
            image_start,
            "code region mapped"
        );
        Ok(Self {
            raw,
            image_start,
            image_len,
        })
    }

    /// The writable image
    pub fn image_mut(&mut self) -> &mut [u8] {
        // SAFETY: the image lies inside the mapping, which is still writable
        // and borrowed exclusively through `self`.
        unsafe {
            std::slice::from_raw_parts_mut(
                self.raw.base.as_ptr().add(self.image_start),
                self.image_len,
            )
        }
    }

    /// Offset of the image from the start of the mapping
    pub fn image_offset(&self) -> usize {
        self.image_start
    }

    /// Size of the whole mapping
    pub fn size(&self) -> usize {
        self.raw.size
    }

    /// Make the region read+exec. `used` bytes of the image are kept visible
    /// through [`LockedRegion::image`].
    pub fn lock(self, used: usize) -> Result<LockedRegion, RegionError> {
        let Self {
            mut raw,
            image_start,
            image_len,
        } = self;

        {
            let _text = TEXT_MUTEX.lock();
            raw.reset_perms = true;
            sys::protect(raw.base, raw.size, sys::Prot::Read).map_err(protect_failed)?;
            sys::protect(raw.base, raw.size, sys::Prot::ReadExec).map_err(protect_failed)?;
        }

        tracing::debug!(target: "sieve::jit", size = raw.size, used, "code region locked");
        Ok(LockedRegion {
            raw,
            image_start,
            image_len: used.min(image_len),
        })
    }
}

/// Region that is read+exec and never writable again
pub struct LockedRegion {
    raw: RawRegion,
    image_start: usize,
    image_len: usize,
}

impl std::fmt::Debug for LockedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockedRegion")
            .field("range", &self.range())
            .field("image_len", &self.image_len)
            .finish()
    }
}

impl LockedRegion {
    /// The emitted image
    pub fn image(&self) -> &[u8] {
        // SAFETY: the image lies inside the readable mapping owned by `self`.
        unsafe {
            std::slice::from_raw_parts(self.raw.base.as_ptr().add(self.image_start), self.image_len)
        }
    }

    /// Address of the first image byte
    pub fn image_addr(&self) -> usize {
        self.raw.base.as_ptr() as usize + self.image_start
    }

    /// Address range of the whole mapping
    pub fn range(&self) -> Range<usize> {
        let start = self.raw.base.as_ptr() as usize;
        start..start + self.raw.size
    }

    /// Size of the whole mapping
    pub fn size(&self) -> usize {
        self.raw.size
    }
}

#[cfg(unix)]
mod sys {
    use std::io;
    use std::ptr::{self, NonNull};

    #[derive(Clone, Copy)]
    pub(super) enum Prot {
        Read,
        ReadWrite,
        ReadExec,
    }

    pub(super) fn page_size() -> usize {
        // SAFETY: sysconf has no preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 { size as usize } else { 4096 }
    }

    pub(super) fn map(size: usize) -> io::Result<NonNull<u8>> {
        // SAFETY: anonymous private mapping, no existing memory is touched.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        NonNull::new(ptr.cast::<u8>()).ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))
    }

    pub(super) fn protect(base: NonNull<u8>, size: usize, prot: Prot) -> io::Result<()> {
        let flags = match prot {
            Prot::Read => libc::PROT_READ,
            Prot::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
            Prot::ReadExec => libc::PROT_READ | libc::PROT_EXEC,
        };
        // SAFETY: `base..base + size` is a mapping owned by the caller.
        let rc = unsafe { libc::mprotect(base.as_ptr().cast(), size, flags) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub(super) fn unmap(base: NonNull<u8>, size: usize) {
        // SAFETY: the caller owns the mapping and drops its last reference.
        unsafe {
            libc::munmap(base.as_ptr().cast(), size);
        }
    }
}

#[cfg(not(unix))]
mod sys {
    use std::io;
    use std::ptr::NonNull;

    #[derive(Clone, Copy)]
    pub(super) enum Prot {
        Read,
        ReadWrite,
        ReadExec,
    }

    pub(super) fn page_size() -> usize {
        4096
    }

    pub(super) fn map(_size: usize) -> io::Result<NonNull<u8>> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }

    pub(super) fn protect(_base: NonNull<u8>, _size: usize, _prot: Prot) -> io::Result<()> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }

    pub(super) fn unmap(_base: NonNull<u8>, _size: usize) {}
}
