//! Pipe file descriptors for worker communication.
//!
//! [`PipeFd`] is the raw byte channel under every [`FastSender`](crate::FastSender) and
//! [`FastReceiver`](crate::FastReceiver): reads and writes go straight to the descriptor and
//! are retried on `EINTR`.

use std::io::{self, Read, Write};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::process::{ChildStderr, ChildStdin, ChildStdout};

/// A file descriptor wrapper that implements Read/Write with EINTR handling.
#[derive(Debug)]
pub struct PipeFd {
    fd: OwnedFd,
}

impl PipeFd {
    /// Create from an owned file descriptor.
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// Create from a raw file descriptor (takes ownership).
    ///
    /// # Safety
    /// The caller must ensure `fd` is a valid, open file descriptor that nothing else owns.
    pub unsafe fn from_raw(fd: RawFd) -> Self {
        Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        }
    }

    /// Release ownership of the descriptor.
    pub fn into_owned_fd(self) -> OwnedFd {
        self.fd
    }
}

/// Create a unidirectional pipe, returning `(read_end, write_end)`.
///
/// Both ends are close-on-exec, so they never leak into unrelated spawned children.
#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
pub fn pipe() -> io::Result<(PipeFd, PipeFd)> {
    let (read_fd, write_fd) =
        nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC).map_err(io::Error::from)?;
    Ok((PipeFd::new(read_fd), PipeFd::new(write_fd)))
}

/// Create a unidirectional pipe, returning `(read_end, write_end)`.
#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
pub fn pipe() -> io::Result<(PipeFd, PipeFd)> {
    let (read_fd, write_fd) = nix::unistd::pipe().map_err(io::Error::from)?;
    for fd in [&read_fd, &write_fd] {
        nix::fcntl::fcntl(fd, nix::fcntl::FcntlArg::F_SETFD(nix::fcntl::FdFlag::FD_CLOEXEC))
            .map_err(io::Error::from)?;
    }
    Ok((PipeFd::new(read_fd), PipeFd::new(write_fd)))
}

impl AsFd for PipeFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for PipeFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl IntoRawFd for PipeFd {
    fn into_raw_fd(self) -> RawFd {
        self.fd.into_raw_fd()
    }
}

impl From<OwnedFd> for PipeFd {
    fn from(fd: OwnedFd) -> Self {
        Self::new(fd)
    }
}

impl From<ChildStdin> for PipeFd {
    fn from(stdin: ChildStdin) -> Self {
        Self::new(OwnedFd::from(stdin))
    }
}

impl From<ChildStdout> for PipeFd {
    fn from(stdout: ChildStdout) -> Self {
        Self::new(OwnedFd::from(stdout))
    }
}

impl From<ChildStderr> for PipeFd {
    fn from(stderr: ChildStderr) -> Self {
        Self::new(OwnedFd::from(stderr))
    }
}

impl Read for PipeFd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::read(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }
}

impl Write for PipeFd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::write(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(()) // Pipes don't need flushing at the fd level
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipe_roundtrip_and_eof() {
        let (mut read_end, mut write_end) = pipe().unwrap();
        write_end.write_all(b"hello").unwrap();
        drop(write_end); // Close write end to signal EOF

        let mut out = String::new();
        read_end.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello");
    }

    #[test]
    fn test_pipe_is_cloexec() {
        let (read_end, write_end) = pipe().unwrap();
        for fd in [&read_end, &write_end] {
            let flags = nix::fcntl::fcntl(fd, nix::fcntl::FcntlArg::F_GETFD).unwrap();
            assert!(nix::fcntl::FdFlag::from_bits_truncate(flags)
                .contains(nix::fcntl::FdFlag::FD_CLOEXEC));
        }
    }

    #[test]
    fn test_write_to_closed_pipe_fails() {
        // The test harness may not ignore SIGPIPE; ignore it here so EPIPE surfaces as an error.
        unsafe {
            nix::sys::signal::signal(
                nix::sys::signal::Signal::SIGPIPE,
                nix::sys::signal::SigHandler::SigIgn,
            )
            .ok();
        }
        let (read_end, mut write_end) = pipe().unwrap();
        drop(read_end);
        let err = write_end.write_all(b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
