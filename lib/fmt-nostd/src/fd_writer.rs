use rustix::fd::BorrowedFd;
use rustix::io::Errno;

/// A `core::fmt::Write` over a raw file descriptor.
///
/// Writes go straight to the `write` syscall, retrying on `EINTR` and
/// resuming after short writes. Any other error is reported as
/// `core::fmt::Error`, in which case a partial write may have occurred.
pub struct FdWriter<'fd> {
    fd: BorrowedFd<'fd>,
}

impl<'fd> FdWriter<'fd> {
    pub fn new(fd: BorrowedFd<'fd>) -> Self {
        Self { fd }
    }

    pub fn write_all(&mut self, mut bytes: &[u8]) -> Result<(), Errno> {
        while !bytes.is_empty() {
            match rustix::io::write(self.fd, bytes) {
                Ok(0) => return Err(Errno::IO),
                Ok(n) => bytes = &bytes[n..],
                Err(Errno::INTR) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl core::fmt::Write for FdWriter<'_> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        self.write_all(s.as_bytes()).map_err(|_| core::fmt::Error)
    }
}

#[cfg(test)]
mod tests {
    use core::fmt::Write;

    use rustix::fd::AsFd;

    use super::*;

    #[test]
    fn writes_reach_the_fd() {
        let (reader, writer) = rustix::pipe::pipe().unwrap();

        let mut w = FdWriter::new(writer.as_fd());
        write!(&mut w, "ab{}", 1).unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(rustix::io::read(reader.as_fd(), &mut buf), Ok(3));
        assert_eq!(&buf[..3], b"ab1");
    }

    #[test]
    fn closed_fd_reports_error() {
        let (reader, writer) = rustix::pipe::pipe().unwrap();
        drop(reader);

        // Writing to a pipe with no reader raises EPIPE (SIGPIPE is ignored
        // under the test harness).
        let mut w = FdWriter::new(writer.as_fd());
        assert!(w.write_all(b"x").is_err());
    }
}
