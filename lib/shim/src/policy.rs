//! Decides, per event, whether a backtrace is worth paying for.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::events::{SizeClass, STAT_SLOTS};
use crate::options::{Mode, Options};
use crate::output::EventBuf;

/// Per-class running statistic. Meaning depends on the mode: under
/// `alloc-top` it is the largest size seen for the class, under `growth` the
/// last RSS sample (in pages). Relaxed atomics: alloc-top updates race by
/// design (as in the original), growth updates are serialized by the tracer
/// mutex.
pub struct Policy {
    stats: [AtomicUsize; STAT_SLOTS],
}

impl Policy {
    pub const fn new() -> Self {
        Self {
            stats: [AtomicUsize::new(0), AtomicUsize::new(0)],
        }
    }

    /// Apply the active mode's rule. May append a `[m:...]` growth line to
    /// the event record as a side effect.
    pub fn should_backtrace(
        &self,
        opts: &Options,
        page_size: usize,
        size: usize,
        class: SizeClass,
        out: &mut EventBuf,
    ) -> bool {
        match opts.mode {
            Mode::Watermark => {
                class.stat_slot().is_some()
                    && opts.min_wmark <= size
                    && size <= opts.max_wmark
            }
            Mode::Growth => {
                let Some(rss) = read_rss_pages() else {
                    return false;
                };
                let Some(slot) = class.stat_slot() else {
                    return false;
                };
                let old = self.stats[slot].swap(rss, Ordering::Relaxed);
                if class == SizeClass::Mmap || rss > old {
                    out.append(format_args!(
                        "[m:{}-{}]\n",
                        old * page_size,
                        rss * page_size
                    ));
                    true
                } else {
                    false
                }
            }
            Mode::Full => true,
            Mode::AllocOnly => class.stat_slot().is_some(),
            Mode::AllocTop => {
                let Some(slot) = class.stat_slot() else {
                    return false;
                };
                let prev = self.stats[slot].fetch_max(size, Ordering::Relaxed);
                size > prev
            }
        }
    }
}

impl Default for Policy {
    fn default() -> Self {
        Self::new()
    }
}

/// Resident set size in pages, from the second field of `/proc/self/statm`.
/// `None` (and a sample of 0) both mean "don't trust this event".
fn read_rss_pages() -> Option<usize> {
    let fd = rustix::fs::open(
        "/proc/self/statm",
        rustix::fs::OFlags::RDONLY | rustix::fs::OFlags::CLOEXEC,
        rustix::fs::Mode::empty(),
    )
    .ok()?;

    let mut buf = [0u8; 64];
    let n = rustix::io::read(fd, &mut buf).ok()?;
    let text = core::str::from_utf8(&buf[..n]).ok()?;
    let rss = text.split_whitespace().nth(1)?.parse().ok()?;
    (rss != 0).then_some(rss)
}
