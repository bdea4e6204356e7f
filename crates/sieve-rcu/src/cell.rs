//! Atomically published, grace-period reclaimed slot

use crate::domain::{QuiescentDomain, ReadGuard};
use std::marker::PhantomData;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, Ordering};

/// Optional `Arc<T>` that readers load without locking.
///
/// Replacing the value waits for a grace period of the owning domain before
/// the previous value is handed back, so a reference obtained inside a read
/// section stays valid until that section ends.
pub struct RcuCell<T> {
    ptr: AtomicPtr<T>,
    domain: QuiescentDomain,
    _owns: PhantomData<Arc<T>>,
}

fn into_raw<T>(value: Option<Arc<T>>) -> *mut T {
    value.map_or(ptr::null_mut(), |arc| Arc::into_raw(arc).cast_mut())
}

/// # Safety
/// `raw` must be null or come from `Arc::into_raw` with one owned count.
unsafe fn from_raw<T>(raw: *mut T) -> Option<Arc<T>> {
    if raw.is_null() {
        None
    } else {
        // SAFETY: guaranteed by the caller.
        Some(unsafe { Arc::from_raw(raw.cast_const()) })
    }
}

impl<T> RcuCell<T> {
    /// Create a cell in `domain`
    pub fn new(domain: &QuiescentDomain, value: Option<Arc<T>>) -> Self {
        Self {
            ptr: AtomicPtr::new(into_raw(value)),
            domain: domain.clone(),
            _owns: PhantomData,
        }
    }

    /// Create an empty cell in `domain`
    pub fn empty(domain: &QuiescentDomain) -> Self {
        Self::new(domain, None)
    }

    /// Borrow the current value for the duration of `guard`
    #[inline]
    pub fn load<'g>(&'g self, guard: &'g ReadGuard<'_>) -> Option<&'g T> {
        debug_assert!(self.domain.same_domain(guard.domain()));
        let raw = self.ptr.load(Ordering::SeqCst);
        // SAFETY: a published pointer is released only after a grace period,
        // and `guard` keeps this reader's section open.
        unsafe { raw.as_ref() }
    }

    /// Take a counted reference to the current value
    pub fn load_arc(&self, guard: &ReadGuard<'_>) -> Option<Arc<T>> {
        debug_assert!(self.domain.same_domain(guard.domain()));
        let raw = self.ptr.load(Ordering::SeqCst);
        if raw.is_null() {
            return None;
        }
        // SAFETY: the value is alive for the read section, see `load`.
        unsafe {
            Arc::increment_strong_count(raw.cast_const());
            from_raw(raw)
        }
    }

    /// Whether a value is published. Racy by nature.
    pub fn is_set(&self) -> bool {
        !self.ptr.load(Ordering::SeqCst).is_null()
    }

    /// Publish `value` and return the previous value once no reader can
    /// still see it.
    pub fn replace(&self, value: Option<Arc<T>>) -> Option<Arc<T>> {
        let old = self.ptr.swap(into_raw(value), Ordering::SeqCst);
        if old.is_null() {
            return None;
        }
        self.domain.synchronize();
        // SAFETY: `old` was published by this cell and no reader holds it.
        unsafe { from_raw(old) }
    }

    /// Publish `value` and release the previous value on the next
    /// [`QuiescentDomain::reclaim`].
    pub fn replace_deferred(&self, value: Option<Arc<T>>)
    where
        T: Send + Sync + 'static,
    {
        let old = self.ptr.swap(into_raw(value), Ordering::SeqCst);
        if old.is_null() {
            return;
        }
        let old = SendPtr(old);
        self.domain.defer(move || {
            let old = old;
            // SAFETY: runs after a grace period following the swap.
            drop(unsafe { from_raw(old.0) });
        });
    }

    /// Publish `value` only if the cell is empty. Returns `value` back on
    /// failure.
    pub fn set_if_empty(&self, value: Arc<T>) -> Result<(), Arc<T>> {
        let raw = Arc::into_raw(value).cast_mut();
        match self
            .ptr
            .compare_exchange(ptr::null_mut(), raw, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => Ok(()),
            // SAFETY: `raw` was never published.
            Err(_) => Err(unsafe { Arc::from_raw(raw.cast_const()) }),
        }
    }

    /// Remove the value, waiting for a grace period
    pub fn take(&self) -> Option<Arc<T>> {
        self.replace(None)
    }

    /// Domain the cell belongs to
    pub fn domain(&self) -> &QuiescentDomain {
        &self.domain
    }
}

struct SendPtr<T>(*mut T);

// SAFETY: the pointer is an owned `Arc<T>` count and `T: Send + Sync`.
unsafe impl<T: Send + Sync> Send for SendPtr<T> {}

impl<T> Drop for RcuCell<T> {
    fn drop(&mut self) {
        let raw = *self.ptr.get_mut();
        // SAFETY: exclusive access, every borrow handed out by `load` has ended.
        drop(unsafe { from_raw(raw) });
    }
}

impl<T> std::fmt::Debug for RcuCell<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RcuCell").field("set", &self.is_set()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_and_replace() {
        let domain = QuiescentDomain::new();
        let cell = RcuCell::new(&domain, Some(Arc::new(1u32)));
        let reader = domain.register();
        {
            let guard = reader.read_lock();
            assert_eq!(cell.load(&guard), Some(&1));
        }
        let old = cell.replace(Some(Arc::new(2)));
        assert_eq!(old.as_deref(), Some(&1));
        let guard = reader.read_lock();
        assert_eq!(cell.load(&guard), Some(&2));
    }

    #[test]
    fn test_load_arc_keeps_value_alive() {
        let domain = QuiescentDomain::new();
        let cell = RcuCell::new(&domain, Some(Arc::new(String::from("a"))));
        let reader = domain.register();
        let held = {
            let guard = reader.read_lock();
            cell.load_arc(&guard)
        };
        drop(cell.take());
        assert_eq!(held.as_deref().map(String::as_str), Some("a"));
    }

    #[test]
    fn test_set_if_empty() {
        let domain = QuiescentDomain::new();
        let cell = RcuCell::empty(&domain);
        assert!(cell.set_if_empty(Arc::new(7u8)).is_ok());
        assert_eq!(cell.set_if_empty(Arc::new(8u8)), Err(Arc::new(8u8)));
    }

    #[test]
    fn test_deferred_release() {
        let domain = QuiescentDomain::new();
        let value = Arc::new(5u64);
        let cell = RcuCell::new(&domain, Some(Arc::clone(&value)));
        cell.replace_deferred(None);
        assert_eq!(Arc::strong_count(&value), 2);
        domain.reclaim();
        assert_eq!(Arc::strong_count(&value), 1);
    }
}
