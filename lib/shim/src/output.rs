//! Per-thread event record assembly and the output sink.
//!
//! One event becomes one contiguous buffer, committed with a single `write`
//! at the outermost shim return. The buffer is thread-local, so records from
//! different threads never interleave mid-record even on a shared sink.

use core::cell::RefCell;
use core::fmt;
use core::fmt::Write as _;

use fmt_nostd::{FdWriter, FormatBuffer};
use rustix::fd::BorrowedFd;

/// Two pages. Enough for a header, a deep backtrace, and a handful of
/// symbol-registration lines.
pub const EVENT_BUF_SIZE: usize = 8192;

static_assertions::const_assert_eq!(EVENT_BUF_SIZE, 2 * 4096);

pub fn stderr_fd() -> BorrowedFd<'static> {
    // SAFETY: stderr is open for the lifetime of the process.
    unsafe { BorrowedFd::borrow_raw(linux_raw_sys::general::STDERR_FILENO as i32) }
}

/// Unconditional diagnostic on the fallback stream followed by process
/// abort. This must work before anything (including the logger) is set up.
pub fn fatal(args: fmt::Arguments<'_>) -> ! {
    let mut buf = FormatBuffer::<256>::new();
    let _ = buf.write_str("mtrace: fatal: ");
    let _ = buf.write_fmt(args);
    let _ = buf.write_char('\n');
    let _ = FdWriter::new(stderr_fd()).write_all(buf.as_bytes());
    std::process::abort()
}

pub struct EventBuf {
    buf: FormatBuffer<EVENT_BUF_SIZE>,
    tid: Option<i32>,
}

impl EventBuf {
    pub const fn new() -> Self {
        Self {
            buf: FormatBuffer::new(),
            tid: None,
        }
    }

    fn tid(&mut self) -> i32 {
        *self
            .tid
            .get_or_insert_with(|| rustix::thread::gettid().as_raw_nonzero().get())
    }

    /// Append formatted text. Overflow truncates the record; the first
    /// overflowing append reports it on the diagnostic stream, since the
    /// caller has no better recovery than a short record.
    pub fn append(&mut self, args: fmt::Arguments<'_>) {
        let already_truncated = self.buf.truncated() > 0;
        let _ = self.buf.write_fmt(args);
        if !already_truncated && self.buf.truncated() > 0 {
            log::error!(
                "event record exceeds the {EVENT_BUF_SIZE}-byte thread buffer; truncating"
            );
        }
    }

    pub fn tid_tag(&mut self) {
        let tid = self.tid();
        self.append(format_args!("[t:{tid}]"));
    }

    pub fn timestamp_tag(&mut self) {
        let now = rustix::time::clock_gettime(rustix::time::ClockId::Realtime);
        self.append(format_args!(
            "[t:{}.{:06}] ",
            now.tv_sec,
            now.tv_nsec / 1_000
        ));
    }

    pub fn as_str(&self) -> &str {
        self.buf.as_str()
    }

    /// Write the accumulated record to `sink` as one payload and reset.
    pub fn commit(&mut self, sink: BorrowedFd<'_>) {
        if !self.buf.is_empty() {
            if let Err(e) = FdWriter::new(sink).write_all(self.buf.as_bytes()) {
                log::error!("dropping event record: sink write failed: {e}");
            }
        }
        self.buf.reset();
    }
}

impl Default for EventBuf {
    fn default() -> Self {
        Self::new()
    }
}

thread_local! {
    static EVENT_BUF: RefCell<EventBuf> = const { RefCell::new(EventBuf::new()) };
}

/// Run `f` with this thread's event buffer. Only the outermost interposed
/// call may use this; nested calls never touch the buffer, so the borrow is
/// never contended.
pub fn with<R>(f: impl FnOnce(&mut EventBuf) -> R) -> R {
    EVENT_BUF.with(|b| f(&mut b.borrow_mut()))
}

#[cfg(test)]
mod tests {
    use rustix::fd::AsFd;

    use super::*;

    #[test]
    fn header_tags_have_the_wire_shape() {
        let mut buf = EventBuf::new();
        buf.tid_tag();
        buf.timestamp_tag();

        let s = buf.as_str().to_owned();
        assert!(s.starts_with("[t:"), "got {s:?}");
        // Two tags, the second `sec.usec` with a six-digit fraction and a
        // trailing space.
        let second = &s[s[1..].find("[t:").unwrap() + 1..];
        let inner = second
            .strip_prefix("[t:")
            .and_then(|r| r.strip_suffix("] "))
            .unwrap();
        let (sec, usec) = inner.split_once('.').unwrap();
        assert!(sec.parse::<u64>().is_ok());
        assert_eq!(usec.len(), 6);
        assert!(usec.parse::<u32>().is_ok());
    }

    #[test]
    fn tid_matches_this_thread() {
        let mut buf = EventBuf::new();
        buf.tid_tag();
        let expected = format!("[t:{}]", rustix::thread::gettid().as_raw_nonzero().get());
        assert_eq!(buf.as_str(), expected);
    }

    #[test]
    fn commit_writes_once_and_resets() {
        let (reader, writer) = rustix::pipe::pipe().unwrap();

        let mut buf = EventBuf::new();
        buf.append(format_args!("MA$({})=0x{:x}\n", 100, 0xdead_usize));
        buf.commit(writer.as_fd());
        assert_eq!(buf.as_str(), "");

        let mut out = [0u8; 64];
        let n = rustix::io::read(reader.as_fd(), &mut out).unwrap();
        assert_eq!(&out[..n], b"MA$(100)=0xdead\n");

        // An empty buffer commits nothing.
        buf.commit(writer.as_fd());
        drop(writer);
        let n = rustix::io::read(reader.as_fd(), &mut out).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn oversized_record_is_truncated_not_grown() {
        let mut buf = EventBuf::new();
        for _ in 0..EVENT_BUF_SIZE {
            buf.append(format_args!("xx"));
        }
        assert_eq!(buf.as_str().len(), EVENT_BUF_SIZE);
    }
}
