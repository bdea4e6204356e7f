//! Reclamation domain and reader registration

use crossbeam_utils::Backoff;
use parking_lot::Mutex;
use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Value stored in a reader slot while it is outside any read section
const QUIESCENT: u64 = 0;

type Deferred = Box<dyn FnOnce() + Send>;

/// Per-reader state visible to writers
struct ReaderSlot {
    /// Epoch observed on entry to the outermost read section, or `QUIESCENT`
    active: AtomicU64,
}

pub(crate) struct DomainInner {
    /// Global grace-period counter, starts at 1 so it never equals `QUIESCENT`
    epoch: AtomicU64,
    readers: Mutex<Vec<Arc<ReaderSlot>>>,
    deferred: Mutex<Vec<Deferred>>,
}

/// A set of readers and the writers that wait for them.
///
/// Cloning is cheap and yields a handle to the same domain.
#[derive(Clone)]
pub struct QuiescentDomain {
    pub(crate) inner: Arc<DomainInner>,
}

impl Default for QuiescentDomain {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for QuiescentDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuiescentDomain")
            .field("epoch", &self.epoch())
            .field("readers", &self.reader_count())
            .finish()
    }
}

impl QuiescentDomain {
    /// Create an empty domain
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DomainInner {
                epoch: AtomicU64::new(1),
                readers: Mutex::new(Vec::new()),
                deferred: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register a new reader. The handle deregisters itself when dropped.
    pub fn register(&self) -> Reader {
        let slot = Arc::new(ReaderSlot {
            active: AtomicU64::new(QUIESCENT),
        });
        self.inner.readers.lock().push(Arc::clone(&slot));
        Reader {
            slot,
            domain: self.clone(),
            nesting: Cell::new(0),
        }
    }

    /// Current grace-period counter
    pub fn epoch(&self) -> u64 {
        self.inner.epoch.load(Ordering::SeqCst)
    }

    /// Number of registered readers
    pub fn reader_count(&self) -> usize {
        self.inner.readers.lock().len()
    }

    /// Whether two handles refer to the same domain
    pub fn same_domain(&self, other: &QuiescentDomain) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Wait until every read section that was open on entry has closed.
    ///
    /// Must not be called from inside a read section of this domain.
    pub fn synchronize(&self) {
        let target = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let readers: Vec<Arc<ReaderSlot>> = self.inner.readers.lock().clone();

        for slot in &readers {
            let backoff = Backoff::new();
            loop {
                let seen = slot.active.load(Ordering::SeqCst);
                if seen == QUIESCENT || seen >= target {
                    break;
                }
                backoff.snooze();
            }
        }

        tracing::trace!(
            target: "sieve::rcu",
            epoch = target,
            readers = readers.len(),
            "grace period elapsed"
        );
    }

    /// Queue `f` to run after a future grace period.
    pub fn defer<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.deferred.lock().push(Box::new(f));
    }

    /// Number of callbacks waiting for a grace period
    pub fn pending(&self) -> usize {
        self.inner.deferred.lock().len()
    }

    /// Wait for a grace period and run every callback queued before the call.
    ///
    /// Returns the number of callbacks run.
    pub fn reclaim(&self) -> usize {
        let batch = std::mem::take(&mut *self.inner.deferred.lock());
        if batch.is_empty() {
            return 0;
        }
        self.synchronize();
        let count = batch.len();
        for f in batch {
            f();
        }
        tracing::debug!(target: "sieve::rcu", count, "deferred frees run");
        count
    }
}

/// A registered reader, owned by one thread at a time.
pub struct Reader {
    slot: Arc<ReaderSlot>,
    domain: QuiescentDomain,
    nesting: Cell<u32>,
}

impl std::fmt::Debug for Reader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reader")
            .field("nesting", &self.nesting.get())
            .finish()
    }
}

impl Reader {
    /// Enter a read section. Sections nest.
    #[inline]
    pub fn read_lock(&self) -> ReadGuard<'_> {
        let depth = self.nesting.get();
        if depth == 0 {
            let epoch = self.domain.inner.epoch.load(Ordering::SeqCst);
            self.slot.active.store(epoch, Ordering::SeqCst);
        }
        self.nesting.set(depth + 1);
        ReadGuard {
            reader: self,
            _not_send: PhantomData,
        }
    }

    /// Whether a read section is open
    pub fn in_read_section(&self) -> bool {
        self.nesting.get() > 0
    }

    /// Domain this reader belongs to
    pub fn domain(&self) -> &QuiescentDomain {
        &self.domain
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        self.slot.active.store(QUIESCENT, Ordering::SeqCst);
        let mut readers = self.domain.inner.readers.lock();
        readers.retain(|slot| !Arc::ptr_eq(slot, &self.slot));
    }
}

/// An open read section. Values loaded through it stay alive until it drops.
pub struct ReadGuard<'r> {
    reader: &'r Reader,
    _not_send: PhantomData<*const ()>,
}

impl ReadGuard<'_> {
    /// Domain the section belongs to
    pub fn domain(&self) -> &QuiescentDomain {
        &self.reader.domain
    }
}

impl Drop for ReadGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        let depth = self.reader.nesting.get() - 1;
        self.reader.nesting.set(depth);
        if depth == 0 {
            self.reader.slot.active.store(QUIESCENT, Ordering::SeqCst);
        }
    }
}
