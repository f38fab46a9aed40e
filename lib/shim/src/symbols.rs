//! Lazily populated table of resolved procedure symbols.
//!
//! Resolving a procedure name means opening and parsing an ELF file, which
//! is far too slow to do per frame. Backtraces tend to repeat frames, so we
//! keep every symbol the unwinder has ever resolved and answer later frames
//! from a binary search. Each symbol gets a sequence number on first
//! insertion; the compact stream refers to symbols by that number after a
//! single `[f:...]` registration line.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::output::EventBuf;

/// Name emitted for frames whose procedure could not be resolved.
pub const UNRESOLVED_NAME: &str = "?";

#[derive(Debug, Clone)]
pub struct Symbol {
    pub start_ip: usize,
    /// Inclusive: a single-point unresolved entry has `end_ip == start_ip`.
    pub end_ip: usize,
    pub seq: u64,
    name: Option<Arc<str>>,
}

impl Symbol {
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or(UNRESOLVED_NAME)
    }

    pub fn is_resolved(&self) -> bool {
        self.name.is_some()
    }
}

struct TableInner {
    /// Sorted by `start_ip`, no duplicate starts.
    rows: Vec<Symbol>,
    next_seq: u64,
}

pub struct SymbolTable {
    inner: RwLock<TableInner>,
}

const INITIAL_SYMBOLS: usize = 400;

impl SymbolTable {
    pub const fn new() -> Self {
        Self {
            inner: RwLock::new(TableInner {
                rows: Vec::new(),
                next_seq: 0,
            }),
        }
    }

    pub fn lookup(&self, ip: usize) -> Option<Symbol> {
        let inner = self.inner.read();
        let idx = inner.rows.partition_point(|r| r.start_ip <= ip);
        let row = inner.rows.get(idx.checked_sub(1)?)?;
        (ip <= row.end_ip).then(|| row.clone())
    }

    /// Register a symbol. `name: None` records the unresolved sentinel.
    ///
    /// A row is identified by its start address: inserting an already-known
    /// start only widens that row's `end_ip` (the unwinding library reports
    /// a procedure's start, and we learn its extent from the instruction
    /// pointers we meet). Sequence numbers are assigned once, monotonically,
    /// and never change; new rows are announced with a `[f:...]` line unless
    /// the stream is in human-readable form.
    pub fn insert(
        &self,
        start_ip: usize,
        end_ip: usize,
        name: Option<&str>,
        human_readable: bool,
        out: &mut EventBuf,
    ) -> Symbol {
        let end_ip = end_ip.max(start_ip);
        let mut inner = self.inner.write();

        match inner.rows.binary_search_by(|r| r.start_ip.cmp(&start_ip)) {
            Ok(i) => {
                let row = &mut inner.rows[i];
                row.end_ip = row.end_ip.max(end_ip);
                row.clone()
            }
            Err(i) => {
                let seq = inner.next_seq;
                inner.next_seq += 1;
                let sym = Symbol {
                    start_ip,
                    end_ip,
                    seq,
                    name: name.map(Arc::from),
                };
                if !human_readable {
                    out.append(format_args!(
                        "[f:{}][{:x}-{:x}][{}]\n",
                        seq,
                        start_ip,
                        end_ip,
                        sym.name()
                    ));
                }
                if inner.rows.len() == inner.rows.capacity() {
                    let grow = if inner.rows.capacity() == 0 {
                        INITIAL_SYMBOLS
                    } else {
                        inner.rows.capacity() / 2
                    };
                    inner.rows.reserve_exact(grow);
                }
                inner.rows.insert(i, sym.clone());
                sym
            }
        }
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert_quiet(t: &SymbolTable, start: usize, end: usize, name: Option<&str>) -> Symbol {
        let mut out = EventBuf::new();
        t.insert(start, end, name, true, &mut out)
    }

    #[test]
    fn lookup_honors_start_order() {
        let t = SymbolTable::new();
        // Inserted out of order on purpose.
        insert_quiet(&t, 0x5000, 0x5fff, Some("late"));
        insert_quiet(&t, 0x1000, 0x1fff, Some("early"));

        assert_eq!(t.lookup(0x1000).unwrap().name(), "early");
        assert_eq!(t.lookup(0x5abc).unwrap().name(), "late");
        assert_eq!(t.lookup(0x5fff).unwrap().name(), "late"); // inclusive end
        assert!(t.lookup(0x0fff).is_none());
        assert!(t.lookup(0x3000).is_none());
    }

    #[test]
    fn seq_is_monotonic_and_immutable() {
        let t = SymbolTable::new();
        let a = insert_quiet(&t, 0x1000, 0x1fff, Some("a"));
        let b = insert_quiet(&t, 0x2000, 0x2fff, Some("b"));
        assert_eq!(a.seq, 0);
        assert_eq!(b.seq, 1);

        // Sorting churn must not renumber existing rows.
        insert_quiet(&t, 0x0100, 0x01ff, Some("front"));
        assert_eq!(t.lookup(0x1000).unwrap().seq, 0);
        assert_eq!(t.lookup(0x2000).unwrap().seq, 1);
        assert_eq!(t.lookup(0x0100).unwrap().seq, 2);
    }

    #[test]
    fn duplicate_start_extends_instead_of_duplicating() {
        let t = SymbolTable::new();
        let first = insert_quiet(&t, 0x1000, 0x1010, Some("f"));
        let again = insert_quiet(&t, 0x1000, 0x1080, Some("f"));
        assert_eq!(first.seq, again.seq);
        assert_eq!(again.end_ip, 0x1080);
        // The widened row answers the new range.
        assert_eq!(t.lookup(0x1050).unwrap().seq, first.seq);
    }

    #[test]
    fn unresolved_rows_are_single_point() {
        let t = SymbolTable::new();
        let s = insert_quiet(&t, 0x4242, 0x4242, None);
        assert!(!s.is_resolved());
        assert_eq!(s.name(), UNRESOLVED_NAME);
        assert!(t.lookup(0x4242).is_some());
        assert!(t.lookup(0x4243).is_none());
    }

    #[test]
    fn registration_line_format() {
        let t = SymbolTable::new();
        let mut out = EventBuf::new();
        t.insert(0x42d91d68, 0x42d91dd7, Some("log_config_push"), false, &mut out);
        assert_eq!(
            out.as_str(),
            "[f:0][42d91d68-42d91dd7][log_config_push]\n"
        );

        // Human-readable streams carry no registration lines, and re-inserts
        // never emit a second one.
        let mut out2 = EventBuf::new();
        t.insert(0x42d91d68, 0x42d91de0, Some("log_config_push"), false, &mut out2);
        assert_eq!(out2.as_str(), "");
    }
}
