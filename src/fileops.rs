//! Installable file operations.
//!
//! Consumers embedding the tracer can replace any subset of the default
//! OS-backed operations: redirecting trace output over a network, taking
//! ownership of whole buffers instead of paying for copies, or hooking
//! process exit.  Open handles are trait objects so a replacement supplies
//! its own read/write/close behavior along with `open`.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;

/// One open trace output handle.  Closing is dropping.
pub trait TraceFile: Send {
    fn write(&mut self, data: &[u8]) -> io::Result<usize>;
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }
}

impl TraceFile for File {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        Write::write(self, data)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(self, buf)
    }
}

/// A flushed buffer whose ownership transfers to the handoff callback.
/// `valid` bytes from the start are trace records; the rest is buffer slack
/// the consumer may reuse.
pub struct FlushedBuffer {
    pub mem: Box<[u8]>,
    pub valid: usize,
}

pub type OpenFileFn = Box<dyn Fn(&Path) -> io::Result<Box<dyn TraceFile>> + Send + Sync>;
pub type CreateDirFn = Box<dyn Fn(&Path) -> io::Result<()> + Send + Sync>;
pub type HandoffFn = Box<dyn Fn(&mut dyn TraceFile, FlushedBuffer) -> io::Result<()> + Send + Sync>;
pub type ExitFn = Box<dyn FnOnce() + Send + Sync>;

/// The installable vtable.  Defaults are OS-backed; replace fields before
/// handing the ops to the tracer.
pub struct FileOps {
    /// Create-new open: fails if the path already exists, which drives the
    /// unique-name retry loops.
    pub open: OpenFileFn,
    /// Fails if the directory already exists.
    pub create_dir: CreateDirFn,
    /// When set, flushed buffers are handed off whole instead of written;
    /// the tracer allocates a fresh buffer after each handoff.
    pub handoff: Option<HandoffFn>,
    /// Invoked once at process exit, after all sinks are closed.
    pub exit_cb: Option<ExitFn>,
    /// False once `create_dir` has been replaced; suppresses the log
    /// directory notice, since a replacement may not create any directory.
    pub default_create_dir: bool,
}

impl Default for FileOps {
    fn default() -> Self {
        FileOps {
            open: Box::new(|path| {
                let file = OpenOptions::new().write(true).create_new(true).open(path)?;
                Ok(Box::new(file) as Box<dyn TraceFile>)
            }),
            create_dir: Box::new(|path| fs::create_dir(path)),
            handoff: None,
            exit_cb: None,
            default_create_dir: true,
        }
    }
}

impl FileOps {
    /// Replace any subset of the basic file operations.
    pub fn replace(&mut self, open: Option<OpenFileFn>, create_dir: Option<CreateDirFn>) {
        if let Some(open) = open {
            self.open = open;
        }
        if let Some(create_dir) = create_dir {
            self.create_dir = create_dir;
            self.default_create_dir = false;
        }
    }

    /// Install buffer handoff and an exit callback.
    pub fn buffer_handoff(&mut self, handoff: HandoffFn, exit_cb: Option<ExitFn>) {
        self.handoff = Some(handoff);
        self.exit_cb = exit_cb;
    }
}
