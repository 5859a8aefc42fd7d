use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// A connection removed from its event loop by
/// [`Action::Detach`](crate::Action::Detach), handed to the application
/// as a synchronous bidirectional byte stream.
///
/// The fd has had `O_NONBLOCK` cleared, so reads and writes block.
/// Dropping the stream closes the fd.
pub struct DetachedStream {
    fd: OwnedFd,
}

impl DetachedStream {
    pub(crate) fn from_raw(fd: RawFd) -> Self {
        DetachedStream {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Read for DetachedStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let n = unsafe {
                libc::read(
                    self.fd.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            return Ok(n as usize);
        }
    }
}

impl Write for DetachedStream {
    /// Writes the whole slice, looping over partial writes.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut rest = buf;
        while !rest.is_empty() {
            let n = unsafe {
                libc::write(
                    self.fd.as_raw_fd(),
                    rest.as_ptr() as *const libc::c_void,
                    rest.len(),
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            rest = &rest[n as usize..];
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn socketpair() -> (DetachedStream, DetachedStream) {
        let mut fds = [0 as RawFd; 2];
        let ret = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        };
        assert_eq!(ret, 0);
        (DetachedStream::from_raw(fds[0]), DetachedStream::from_raw(fds[1]))
    }

    #[test]
    fn write_then_read() {
        let (mut a, mut b) = socketpair();
        a.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        b.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn drop_closes_peer_sees_eof() {
        let (a, mut b) = socketpair();
        drop(a);
        let mut buf = [0u8; 1];
        assert_eq!(b.read(&mut buf).unwrap(), 0);
    }
}
