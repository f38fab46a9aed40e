/// A fixed-capacity text buffer usable with Rust's formatting machinery.
///
/// Rust's formatting utilities panic when a writer reports an error, so an
/// overflowing write is truncated (at a character boundary) instead of
/// failing. The number of dropped bytes is kept in a counter the caller can
/// inspect after the fact; once a buffer has started truncating it drops all
/// further input so that records are cut short rather than interleaved.
///
/// ```
/// use core::fmt::Write;
/// use fmt_nostd::FormatBuffer;
///
/// let mut buf = FormatBuffer::<64>::new();
/// write!(&mut buf, "tid={}", 42).unwrap();
/// assert_eq!(buf.as_str(), "tid=42");
/// ```
pub struct FormatBuffer<const N: usize> {
    bytes: [u8; N],
    used: usize,
    truncated: usize,
}

impl<const N: usize> FormatBuffer<N> {
    pub const fn new() -> Self {
        Self {
            bytes: [0; N],
            used: 0,
            truncated: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    pub fn remaining(&self) -> usize {
        N - self.used
    }

    /// Bytes dropped by overflowing writes since the last reset.
    pub fn truncated(&self) -> usize {
        self.truncated
    }

    pub fn reset(&mut self) {
        self.used = 0;
        self.truncated = 0;
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.used]
    }

    pub fn as_str(&self) -> &str {
        // SAFETY: only whole `&str`s are ever copied in, split at char
        // boundaries, so the used prefix is valid UTF-8.
        unsafe { core::str::from_utf8_unchecked(self.as_bytes()) }
    }
}

impl<const N: usize> core::fmt::Write for FormatBuffer<N> {
    fn write_str(&mut self, src: &str) -> core::fmt::Result {
        if self.truncated > 0 {
            self.truncated += src.len();
            return Ok(());
        }

        let fitting = if src.len() <= self.remaining() {
            src.len()
        } else {
            // Back off to a char boundary so the buffer stays valid UTF-8.
            let mut n = self.remaining();
            while !src.is_char_boundary(n) {
                n -= 1;
            }
            n
        };

        self.bytes[self.used..self.used + fitting].copy_from_slice(&src.as_bytes()[..fitting]);
        self.used += fitting;
        self.truncated += src.len() - fitting;
        Ok(())
    }
}

impl<const N: usize> Default for FormatBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use core::fmt::Write;

    use super::*;

    #[test]
    fn exact_fit() {
        let mut buf = FormatBuffer::<3>::new();
        buf.write_str("abc").unwrap();
        assert_eq!(buf.as_str(), "abc");
        assert_eq!(buf.truncated(), 0);
        assert_eq!(buf.remaining(), 0);
    }

    #[test]
    fn overflow_truncates_and_counts() {
        let mut buf = FormatBuffer::<4>::new();
        buf.write_str("abcdef").unwrap();
        assert_eq!(buf.as_str(), "abcd");
        assert_eq!(buf.truncated(), 2);

        // Truncation is sticky: later writes are dropped entirely.
        buf.write_str("x").unwrap();
        assert_eq!(buf.as_str(), "abcd");
        assert_eq!(buf.truncated(), 3);
    }

    #[test]
    fn overflow_respects_char_boundaries() {
        let mut buf = FormatBuffer::<4>::new();
        // U+00A1 is two bytes in UTF-8; it must not be split.
        buf.write_str("abc¡").unwrap();
        assert_eq!(buf.as_str(), "abc");
        assert_eq!(buf.truncated(), 2);
    }

    #[test]
    fn reset_clears_truncation() {
        let mut buf = FormatBuffer::<2>::new();
        buf.write_str("abc").unwrap();
        buf.reset();
        assert_eq!(buf.len(), 0);
        assert_eq!(buf.truncated(), 0);
        buf.write_str("xy").unwrap();
        assert_eq!(buf.as_str(), "xy");
    }

    #[test]
    fn formatting_macros_work() {
        let mut buf = FormatBuffer::<32>::new();
        write!(&mut buf, "[{:x}-{:x}]", 0x1000, 0x2000).unwrap();
        assert_eq!(buf.as_str(), "[1000-2000]");
    }
}
