//! Address to name directories for compiled programs
//!
//! Two directories share one reclamation domain. The global directory holds
//! symbols that may be shown to observers; the private directory holds every
//! compiled region so code addresses can always be recognised, even when
//! names are hidden. Readers never lock; writers serialise on a mutex and
//! publish a fresh sorted table.

use parking_lot::Mutex;
use sieve_rcu::{QuiescentDomain, RcuCell, ReadGuard};
use std::ops::Range;
use std::sync::Arc;

/// Longest symbol name
pub const KSYM_NAME_LEN: usize = 128;

/// Prefix of every program symbol
const SYMBOL_PREFIX: &str = "bpf_prog_";

/// Build `bpf_prog_<tag>[_<name>]`, keeping only `[A-Za-z0-9_.]` from `name`
/// and bounding the result to [`KSYM_NAME_LEN`] bytes.
pub fn symbol_name(tag: &[u8], name: &str) -> String {
    let mut sym = String::with_capacity(KSYM_NAME_LEN);
    sym.push_str(SYMBOL_PREFIX);
    for byte in tag {
        sym.push_str(&format!("{byte:02x}"));
    }
    let clean: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '.')
        .collect();
    if !clean.is_empty() {
        sym.push('_');
        sym.push_str(&clean);
    }
    sym.truncate(KSYM_NAME_LEN);
    sym
}

/// One registered code range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolEntry {
    /// Symbol name
    pub name: String,
    /// Covered addresses
    pub range: Range<usize>,
    /// Identity of the owner, used for removal
    pub owner: u64,
}

/// Result of an address lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolHit {
    /// Symbol name
    pub name: String,
    /// Range of the symbol
    pub range: Range<usize>,
    /// `addr - range.start`
    pub offset: usize,
}

type Table = Vec<SymbolEntry>;

struct Directory {
    published: RcuCell<Table>,
    /// Writer copy; the mutex also orders publications
    master: Mutex<Table>,
}

impl Directory {
    fn new(domain: &QuiescentDomain) -> Self {
        Self {
            published: RcuCell::new(domain, Some(Arc::new(Vec::new()))),
            master: Mutex::new(Vec::new()),
        }
    }

    fn insert(&self, entry: SymbolEntry) {
        let mut master = self.master.lock();
        let at = master.partition_point(|e| e.range.start < entry.range.start);
        master.insert(at, entry);
        drop(self.published.replace(Some(Arc::new(master.clone()))));
    }

    fn remove(&self, owner: u64) -> bool {
        let mut master = self.master.lock();
        let before = master.len();
        master.retain(|e| e.owner != owner);
        if master.len() == before {
            return false;
        }
        // old table freed on the next reclaim; removal never waits
        self.published.replace_deferred(Some(Arc::new(master.clone())));
        true
    }

    fn find<'g>(&'g self, guard: &'g ReadGuard<'_>, addr: usize) -> Option<&'g SymbolEntry> {
        let table = self.published.load(guard)?;
        let idx = table.partition_point(|e| e.range.start <= addr);
        let entry = table.get(idx.checked_sub(1)?)?;
        entry.range.contains(&addr).then_some(entry)
    }

    fn snapshot(&self, guard: &ReadGuard<'_>) -> Table {
        self.published
            .load(guard)
            .map(|table| table.to_vec())
            .unwrap_or_default()
    }
}

/// Symbol directories for compiled code
pub struct Symbolizer {
    global: Directory,
    private: Directory,
}

impl std::fmt::Debug for Symbolizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Symbolizer")
            .field("global", &self.global.master.lock().len())
            .field("private", &self.private.master.lock().len())
            .finish()
    }
}

impl Symbolizer {
    /// Empty directories in `domain`
    pub fn new(domain: &QuiescentDomain) -> Self {
        Self {
            global: Directory::new(domain),
            private: Directory::new(domain),
        }
    }

    /// Register `range` under `name` for `owner`. Hidden symbols only go to
    /// the private directory.
    pub fn add(&self, name: String, range: Range<usize>, owner: u64, visible: bool) {
        tracing::debug!(
            target: "sieve::jit",
            %name,
            start = range.start,
            len = range.len(),
            visible,
            "symbol added"
        );
        let entry = SymbolEntry { name, range, owner };
        if visible {
            self.global.insert(entry.clone());
        }
        self.private.insert(entry);
    }

    /// Remove every symbol registered for `owner`. Returns whether anything
    /// was registered. Safe inside a read section: superseded tables wait
    /// for [`QuiescentDomain::reclaim`].
    pub fn remove(&self, owner: u64) -> bool {
        let global = self.global.remove(owner);
        let private = self.private.remove(owner);
        global || private
    }

    /// Visible symbol covering `addr`
    pub fn lookup(&self, guard: &ReadGuard<'_>, addr: usize) -> Option<SymbolHit> {
        self.global.find(guard, addr).map(|entry| SymbolHit {
            name: entry.name.clone(),
            range: entry.range.clone(),
            offset: addr - entry.range.start,
        })
    }

    /// Whether `addr` lies in any compiled region, visible or not
    pub fn is_text_address(&self, guard: &ReadGuard<'_>, addr: usize) -> bool {
        self.global.find(guard, addr).is_some() || self.private.find(guard, addr).is_some()
    }

    /// Visible symbols in address order
    pub fn symbols(&self, guard: &ReadGuard<'_>) -> Vec<SymbolEntry> {
        self.global.snapshot(guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_name_format() {
        let tag = [0xde, 0xad, 0xbe, 0xef, 0, 1, 2, 3];
        assert_eq!(symbol_name(&tag, ""), "bpf_prog_deadbeef00010203");
        assert_eq!(symbol_name(&tag, "my-filter v1.2"), "bpf_prog_deadbeef00010203_myfilterv1.2");
        assert!(symbol_name(&tag, &"x".repeat(500)).len() <= KSYM_NAME_LEN);
    }

    #[test]
    fn test_lookup_inside_and_outside() {
        let domain = QuiescentDomain::new();
        let syms = Symbolizer::new(&domain);
        syms.add("bpf_prog_a".into(), 0x1000..0x2000, 1, true);
        syms.add("bpf_prog_b".into(), 0x3000..0x4000, 2, true);

        let reader = domain.register();
        let guard = reader.read_lock();
        let hit = syms.lookup(&guard, 0x1010).expect("inside first range");
        assert_eq!(hit.name, "bpf_prog_a");
        assert_eq!(hit.offset, 0x10);
        assert!(syms.lookup(&guard, 0x2000).is_none());
        assert!(syms.lookup(&guard, 0x0fff).is_none());
        assert_eq!(syms.lookup(&guard, 0x3fff).map(|h| h.name), Some("bpf_prog_b".into()));
        assert_eq!(syms.symbols(&guard).len(), 2);
    }

    #[test]
    fn test_hidden_symbols_are_text_but_not_named() {
        let domain = QuiescentDomain::new();
        let syms = Symbolizer::new(&domain);
        syms.add("bpf_prog_hidden".into(), 0x5000..0x6000, 9, false);

        {
            let reader = domain.register();
            let guard = reader.read_lock();
            assert!(syms.lookup(&guard, 0x5000).is_none());
            assert!(syms.is_text_address(&guard, 0x5000));
            assert!(syms.symbols(&guard).is_empty());
        }

        assert!(syms.remove(9));
        assert!(!syms.remove(9));
        let reader = domain.register();
        let guard = reader.read_lock();
        assert!(!syms.is_text_address(&guard, 0x5000));
    }

    #[test]
    fn test_remove_inside_read_section() {
        let domain = QuiescentDomain::new();
        let syms = Symbolizer::new(&domain);
        syms.add("bpf_prog_c".into(), 0x7000..0x7100, 4, true);

        let reader = domain.register();
        {
            let guard = reader.read_lock();
            assert!(syms.remove(4));
            assert!(syms.lookup(&guard, 0x7000).is_none());
        }
        assert_eq!(domain.pending(), 2);
        assert_eq!(domain.reclaim(), 2);
        let guard = reader.read_lock();
        assert!(!syms.is_text_address(&guard, 0x7000));
    }
}
