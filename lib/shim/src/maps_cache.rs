//! Cache of the process's executable address ranges.
//!
//! The unwinder on some platforms hands back register values that are plain
//! garbage; before trusting an instruction pointer we check it against the
//! executable (`x`) mappings of `/proc/self/maps`. The file is re-read only
//! when a shim observed something that can change the executable layout
//! (an executable `mmap`, a `dlclose`).

use core::sync::atomic::{AtomicBool, Ordering};
use std::str::FromStr;

use once_cell::sync::Lazy;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use regex::Regex;

/// One executable mapping, `low <= ip < high`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecRange {
    pub low: usize,
    pub high: usize,
}

/// A line of `/proc/[pid]/maps`, reduced to what the cache needs.
#[derive(Debug, PartialEq, Eq)]
struct MapsLine {
    low: usize,
    high: usize,
    execute: bool,
}

impl FromStr for MapsLine {
    type Err = String;

    // LOW-HIGH PERMS OFFSET DEV INODE [PATH]
    fn from_str(line: &str) -> Result<Self, Self::Err> {
        static RE: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"^([0-9a-f]+)-([0-9a-f]+)\s+(\S)(\S)(\S)(\S)\s").unwrap());

        let caps = RE
            .captures(line)
            .ok_or_else(|| format!("not a maps line: {line}"))?;

        let addr = |i| {
            let s = caps.get(i).unwrap().as_str();
            usize::from_str_radix(s, 16).map_err(|e| format!("bad address '{s}': {e}"))
        };
        let execute = match caps.get(5).unwrap().as_str() {
            "x" => true,
            "-" => false,
            other => return Err(format!("bad execute bit '{other}' in: {line}")),
        };

        Ok(MapsLine {
            low: addr(1)?,
            high: addr(2)?,
            execute,
        })
    }
}

const INITIAL_RANGES: usize = 400;

/// Keep the original geometric growth (x1.5) instead of `Vec`'s.
fn grow_for_push<T>(v: &mut Vec<T>) {
    if v.len() == v.capacity() {
        v.reserve_exact(v.capacity() / 2);
    }
}

fn parse_ranges(contents: &str, out: &mut Vec<ExecRange>) {
    for line in contents.lines() {
        match line.parse::<MapsLine>() {
            Ok(m) if m.execute => {
                grow_for_push(out);
                out.push(ExecRange {
                    low: m.low,
                    high: m.high,
                });
            }
            Ok(_) => {}
            Err(e) => log::warn!("skipping maps line: {e}"),
        }
    }
    // The kernel emits the file sorted; the binary search below must not
    // depend on that staying true.
    out.sort_unstable_by_key(|r| r.low);
}

fn contains(ranges: &[ExecRange], ip: usize) -> bool {
    let (Some(first), Some(last)) = (ranges.first(), ranges.last()) else {
        return false;
    };
    // Fast path: no executable mapping outside the known envelope.
    if ip < first.low || ip >= last.high {
        return false;
    }

    let idx = ranges.partition_point(|r| r.low <= ip);
    idx > 0 && ip < ranges[idx - 1].high
}

pub struct RangeCache {
    ranges: RwLock<Vec<ExecRange>>,
    stale: AtomicBool,
}

impl RangeCache {
    pub const fn new() -> Self {
        Self {
            ranges: RwLock::new(Vec::new()),
            stale: AtomicBool::new(false),
        }
    }

    /// Request a rebuild on the next lookup. Safe to call from contexts
    /// (the `dlclose` hook, an mmap shim mid-event) that must not re-read
    /// the maps file themselves.
    pub fn mark_stale(&self) {
        self.stale.store(true, Ordering::Release);
    }

    /// Whether `ip` lies inside an executable mapping, as of the last
    /// rebuild. A stale or empty cache is rebuilt first; a miss re-checks
    /// the stale flag and rebuilds at most once more.
    pub fn lookup(&self, ip: usize) -> bool {
        let mut guard = self.ranges.read();
        if self.stale.load(Ordering::Acquire) || guard.is_empty() {
            drop(guard);
            guard = self.rebuild();
        }

        if contains(&guard, ip) {
            return true;
        }

        // A concurrent thread may have invalidated the cache between our
        // rebuild and the probe; one more attempt, never two.
        if self.stale.load(Ordering::Acquire) {
            drop(guard);
            guard = self.rebuild();
            return contains(&guard, ip);
        }
        false
    }

    /// Rebuild if still needed and hand back a read guard without a window
    /// in which the table is unlocked.
    fn rebuild(&self) -> RwLockReadGuard<'_, Vec<ExecRange>> {
        let mut w = self.ranges.write();
        // Another thread may have rebuilt while we waited for the lock.
        if self.stale.swap(false, Ordering::AcqRel) || w.is_empty() {
            if w.capacity() == 0 {
                w.reserve_exact(INITIAL_RANGES);
            }
            w.clear();
            match std::fs::read_to_string("/proc/self/maps") {
                Ok(contents) => parse_ranges(&contents, &mut w),
                Err(e) => {
                    // An unreadable maps file leaves the cache empty: every
                    // IP is unmappable, backtraces stop, tracing continues.
                    log::warn!("cannot read /proc/self/maps: {e}");
                }
            }
        }
        RwLockWriteGuard::downgrade(w)
    }
}

impl Default for RangeCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_lines_from_proc5() {
        // Taken from proc(5).
        assert_eq!(
            "00400000-00452000 r-xp 00000000 08:02 173521      /usr/bin/dbus-daemon"
                .parse::<MapsLine>()
                .unwrap(),
            MapsLine {
                low: 0x00400000,
                high: 0x00452000,
                execute: true,
            }
        );
        assert_eq!(
            "00e03000-00e24000 rw-p 00000000 00:00 0           [heap]"
                .parse::<MapsLine>()
                .unwrap(),
            MapsLine {
                low: 0x00e03000,
                high: 0x00e24000,
                execute: false,
            }
        );
        // Anonymous mapping, no path field.
        assert_eq!(
            "35b1a21000-35b1a22000 rw-p 00000000 00:00 0"
                .parse::<MapsLine>()
                .unwrap()
                .execute,
            false
        );
    }

    #[test]
    fn rejects_garbage() {
        assert!("".parse::<MapsLine>().is_err());
        assert!("garbage".parse::<MapsLine>().is_err());
        assert!("00400000-0045200q r-xp 00000000 08:02 1 /bin/x"
            .parse::<MapsLine>()
            .is_err());
        assert!("00400000-00452000 r-zp 00000000 08:02 1 /bin/x"
            .parse::<MapsLine>()
            .is_err());
    }

    #[test]
    fn keeps_only_executable_ranges_sorted() {
        let contents = "\
7f0000002000-7f0000003000 r-xp 00000000 00:00 0
7f0000000000-7f0000001000 r-xp 00000000 00:00 0
7f0000001000-7f0000002000 rw-p 00000000 00:00 0
this line is noise
";
        let mut ranges = Vec::new();
        parse_ranges(contents, &mut ranges);
        assert_eq!(
            ranges,
            vec![
                ExecRange { low: 0x7f0000000000, high: 0x7f0000001000 },
                ExecRange { low: 0x7f0000002000, high: 0x7f0000003000 },
            ]
        );
    }

    #[test]
    fn containment_is_half_open_with_fast_path() {
        let ranges = [
            ExecRange { low: 0x1000, high: 0x2000 },
            ExecRange { low: 0x5000, high: 0x6000 },
        ];
        assert!(!contains(&ranges, 0xfff)); // below the envelope
        assert!(contains(&ranges, 0x1000));
        assert!(contains(&ranges, 0x1fff));
        assert!(!contains(&ranges, 0x2000)); // high is exclusive
        assert!(!contains(&ranges, 0x3000)); // gap between ranges
        assert!(contains(&ranges, 0x5abc));
        assert!(!contains(&ranges, 0x6000)); // above the envelope
        assert!(!contains(&[], 0x1000));
    }

    #[test]
    fn lookup_finds_our_own_code() {
        let cache = RangeCache::new();
        // A function in this test binary lives in an executable mapping.
        let ip = lookup_finds_our_own_code as usize;
        assert!(cache.lookup(ip));
        // Stack addresses are not executable.
        let on_stack = 0u8;
        assert!(!cache.lookup(&on_stack as *const u8 as usize));
        // A stale cache resolves to the same answer after the rebuild.
        cache.mark_stale();
        assert!(cache.lookup(ip));
    }
}
