//! cachetrace - tracing client core for feeding a cache simulator.
//!
//! This library is the core of a dynamic-binary-instrumentation tracing
//! client.  The host DBI framework decodes basic blocks and executes the
//! code we hand back; this crate decides what code to inject, stages the
//! emitted records in per-thread buffers, and routes full buffers either to
//! per-thread raw files (offline mode) or to a single shared named pipe
//! (online mode).
//!
//! # Modules
//!
//! - [`config`] - runtime options
//! - [`record`] - fixed-width trace record layout
//! - [`codegen`] - the code-building capability handed to the host
//! - [`encoder`] - online/offline record encoders
//! - [`filter`] - the inline L0 direct-mapped filter cache
//! - [`buffer`] - per-thread trace buffers and thread state
//! - [`planner`] - the basic-block instrumentation pipeline
//! - [`flush`] - buffer draining and sink framing
//! - [`tracer`] - global state and thread/process lifecycle

use std::sync::atomic::{AtomicU8, Ordering};

pub mod buffer;
pub mod codegen;
pub mod config;
pub mod encoder;
pub mod fileops;
pub mod filter;
pub mod flush;
pub mod physaddr;
pub mod pipe;
pub mod planner;
pub mod record;
pub mod tracer;

pub use buffer::ThreadData;
pub use config::Config;
pub use fileops::{FileOps, FlushedBuffer, TraceFile};
pub use pipe::{NamedPipe, PipeWriter};
pub use planner::{BasicBlock, DbiHost, Instr};
pub use tracer::Tracer;

static VERBOSITY: AtomicU8 = AtomicU8::new(0);

/// Current diagnostic verbosity, set once from [`Config`] at init.
pub fn verbosity() -> u8 {
    VERBOSITY.load(Ordering::Relaxed)
}

pub(crate) fn set_verbosity(level: u8) {
    VERBOSITY.store(level, Ordering::Relaxed);
}

/// Verbosity-gated diagnostic notice on stderr.
#[macro_export]
macro_rules! notify {
    ($level:expr, $($arg:tt)*) => {
        if $crate::verbosity() >= $level {
            eprintln!($($arg)*);
        }
    };
}

/// Unrecoverable failure on a path with no error channel (injected-code
/// callbacks).  The traced process aborts rather than produce a truncated
/// or corrupt trace.
pub(crate) fn fatal(msg: &str) -> ! {
    eprintln!("Fatal error: {msg}");
    std::process::abort();
}
