//! The online sink: a single named pipe shared by every traced thread.
//!
//! Atomic framing relies on the OS guarantee that writes no larger than the
//! pipe's atomic-write ceiling are delivered without interleaving, so no
//! user-level lock is taken.  The transport mechanics live behind
//! [`PipeWriter`] so the flush engine only ever sees the ceiling and a
//! byte-oriented `write` with a short-write indication.

use std::ffi::CString;
use std::fs;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use anyhow::{Context, Result};

/// The capability the flush engine frames against.
pub trait PipeWriter: Send + Sync {
    /// Largest write the OS delivers atomically on this pipe.
    fn atomic_write_size(&self) -> usize;
    /// Byte-oriented write; a short count indicates a partial write.
    fn write(&self, data: &[u8]) -> io::Result<usize>;
}

/// OS-backed named pipe, opened write-only from the traced process.
pub struct NamedPipe {
    fd: OwnedFd,
}

impl NamedPipe {
    /// Open the pipe at `path` for writing.  Blocks until a reader (the
    /// simulator) has the other end open.
    pub fn open(path: &Path) -> Result<Self> {
        let cpath = CString::new(path.as_os_str().as_bytes())
            .with_context(|| format!("Bad pipe path {}", path.display()))?;
        let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_WRONLY) };
        if fd < 0 {
            return Err(io::Error::last_os_error())
                .with_context(|| format!("Failed to open pipe {}", path.display()));
        }
        Ok(NamedPipe {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Grow the pipe buffer to the system maximum so the simulator end
    /// keeps up with bursts.  Best effort.
    pub fn maximize_buffer(&self) -> bool {
        let Ok(max) = fs::read_to_string("/proc/sys/fs/pipe-max-size") else {
            return false;
        };
        let Ok(max) = max.trim().parse::<libc::c_int>() else {
            return false;
        };
        unsafe { libc::fcntl(self.fd.as_raw_fd(), libc::F_SETPIPE_SZ, max) >= 0 }
    }
}

impl PipeWriter for NamedPipe {
    fn atomic_write_size(&self) -> usize {
        libc::PIPE_BUF
    }

    fn write(&self, data: &[u8]) -> io::Result<usize> {
        let ret = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                data.as_ptr() as *const libc::c_void,
                data.len(),
            )
        };
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(ret as usize)
        }
    }
}
