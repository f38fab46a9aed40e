//! Diagnostic logger for the tracer's own messages.
//!
//! Event records never go through here; this backs the `log` macros used
//! for internal warnings and errors. It formats into a fixed buffer and
//! writes straight to stderr, so it can run from inside an interposed call
//! without allocating or taking libc's stdio locks.

use core::fmt::Write as _;

use fmt_nostd::{FdWriter, FormatBuffer};

use crate::output;

pub struct DiagLogger;

static LOGGER: DiagLogger = DiagLogger;

/// Install as the `log` backend. Later calls (or a second logger installed
/// by the traced program's own Rust code, if any) are ignored.
pub fn install(level: log::LevelFilter) {
    log::set_max_level(level);
    let _ = log::set_logger(&LOGGER);
}

impl log::Log for DiagLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let mut buf = FormatBuffer::<1024>::new();
        let _ = write!(
            &mut buf,
            "[mtrace] [{}] [{}:{}] ",
            record.level(),
            record.file().unwrap_or("?"),
            record.line().unwrap_or(0),
        );
        let _ = buf.write_fmt(*record.args());
        let _ = buf.write_char('\n');
        let _ = FdWriter::new(output::stderr_fd()).write_all(buf.as_bytes());
    }

    fn flush(&self) {}
}

#[cfg(test)]
mod tests {
    use log::Log;

    use super::*;

    #[test]
    fn respects_the_max_level() {
        log::set_max_level(log::LevelFilter::Warn);
        let meta_err = log::Metadata::builder().level(log::Level::Error).build();
        let meta_dbg = log::Metadata::builder().level(log::Level::Debug).build();
        assert!(LOGGER.enabled(&meta_err));
        assert!(!LOGGER.enabled(&meta_dbg));
    }
}
