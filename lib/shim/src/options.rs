//! Configuration surface: environment variables, reporting modes, and the
//! output sink.

use core::fmt::Write as _;
use std::fs::OpenOptions;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use fmt_nostd::{FdWriter, FormatBuffer};
use log::LevelFilter;

use crate::output;

pub const DEFAULT_BACKTRACE_DEPTH: usize = 32;

/// Exactly one reporting mode is active; later mode-selecting environment
/// variables clobber earlier ones (`MTRACE_REPORTING_MODE`, then the two
/// watermark variables). The human-readable flag is orthogonal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Trace events that grew the resident set (the default).
    Growth,
    /// Trace an allocation only when it sets a new per-class size record.
    AllocTop,
    /// Trace every allocation-class event.
    AllocOnly,
    /// Trace everything.
    Full,
    /// Trace allocation-class events inside `[min, max]`.
    Watermark,
}

pub enum Sink {
    Stderr,
    File(OwnedFd),
}

impl Sink {
    pub fn fd(&self) -> BorrowedFd<'_> {
        match self {
            Sink::Stderr => output::stderr_fd(),
            Sink::File(f) => f.as_fd(),
        }
    }
}

pub struct Options {
    pub mode: Mode,
    pub human_readable: bool,
    pub backtrace_depth: usize,
    pub min_wmark: usize,
    pub max_wmark: usize,
    pub log_level: LevelFilter,
    pub sink: Sink,
}

impl Options {
    /// Defaults, also served to racing threads that slip past the
    /// initialized flag before the environment has been parsed.
    pub const fn fallback() -> Self {
        Self {
            mode: Mode::Growth,
            human_readable: false,
            backtrace_depth: DEFAULT_BACKTRACE_DEPTH,
            min_wmark: 0,
            max_wmark: usize::MAX,
            log_level: LevelFilter::Warn,
            sink: Sink::Stderr,
        }
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// `get` returns the value of an environment variable, or `None` when
    /// unset (factored out so tests don't mutate the process environment).
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let mut opts = Self::fallback();

        if let Some(depth) = get("MTRACE_BACKTRACE_DEPTH") {
            let depth: i64 = depth.trim().parse().unwrap_or(0);
            opts.backtrace_depth = depth.max(0) as usize;
        }

        if let Some(dir) = get("MTRACE_LOG_DIR") {
            opts.sink = Sink::File(create_trace_file(Path::new(&dir)));
        }

        if let Some(mode) = get("MTRACE_REPORTING_MODE") {
            match mode.as_str() {
                "atop" => opts.mode = Mode::AllocTop,
                "full" => opts.mode = Mode::Full,
                "alloc" => opts.mode = Mode::AllocOnly,
                other => log::warn!("unknown MTRACE_REPORTING_MODE '{other}', keeping default"),
            }
        }

        if let Some(wmark) = get("MTRACE_ALLOC_MINWMARK") {
            opts.min_wmark = memparse(&wmark);
            opts.mode = Mode::Watermark;
        }

        if let Some(wmark) = get("MTRACE_ALLOC_MAXWMARK") {
            opts.max_wmark = memparse(&wmark);
            opts.mode = Mode::Watermark;
        }

        if get("MTRACE_HUMAN_READABLE").is_some() {
            opts.human_readable = true;
        }

        if let Some(level) = get("MTRACE_LOG_LEVEL") {
            opts.log_level = match level.to_ascii_lowercase().as_str() {
                "error" => LevelFilter::Error,
                "warn" => LevelFilter::Warn,
                "info" => LevelFilter::Info,
                "debug" => LevelFilter::Debug,
                "trace" => LevelFilter::Trace,
                _ => LevelFilter::Warn,
            };
        }

        opts
    }
}

/// Parse a memory size: decimal digits with an optional `k`/`m`/`g`
/// multiplier (powers of 1024, case-insensitive). Trailing text after the
/// multiplier is ignored, unparsable input yields 0.
pub fn memparse(s: &str) -> usize {
    let s = s.trim();
    let digits_end = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let value: usize = s[..digits_end].parse().unwrap_or(0);

    let shift = match s[digits_end..].chars().next() {
        Some('g' | 'G') => 30,
        Some('m' | 'M') => 20,
        Some('k' | 'K') => 10,
        _ => 0,
    };
    value << shift
}

/// Create `mtrace-<progname>-<pid>` under `dir`, close-on-exec, and
/// announce it on stderr. The tracer is useless without its sink, so
/// failure exits the process.
fn create_trace_file(dir: &Path) -> OwnedFd {
    let progname = std::env::current_exe()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "unknown".to_owned());
    let path = dir.join(format!("mtrace-{}-{}", progname, std::process::id()));

    let file = match OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .custom_flags(libc::O_CLOEXEC)
        .open(&path)
    {
        Ok(f) => f,
        Err(e) => {
            let mut msg = FormatBuffer::<512>::new();
            let _ = write!(msg, "mtrace: can't open {}: {}\n", path.display(), e);
            let _ = FdWriter::new(output::stderr_fd()).write_all(msg.as_bytes());
            std::process::exit(1);
        }
    };

    let mut banner = FormatBuffer::<512>::new();
    let _ = write!(banner, "\n*** mtrace log: `tail -f {}'\n\n", path.display());
    let _ = FdWriter::new(output::stderr_fd()).write_all(banner.as_bytes());

    file.into()
}
