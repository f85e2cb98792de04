//! Runtime options for the tracing client.
//!
//! Option *parsing* belongs to the embedding host; this struct only carries
//! the parsed values, separated from any CLI concerns.

use std::path::PathBuf;

use anyhow::{bail, Result};

/// Configuration for one tracing run.
#[derive(Debug, Clone)]
pub struct Config {
    /// Offline mode: per-thread raw files under `outdir`.  Online mode
    /// (false): a single shared named pipe at `ipc_name`.
    pub offline: bool,
    /// Named-pipe path (online mode; required).
    pub ipc_name: String,
    /// Root directory for offline output (offline mode; required).
    pub outdir: PathBuf,
    /// Rewrite record addresses to physical at flush time.
    pub use_physical: bool,
    /// Enable the inline L0 filter cache.
    pub l0_filter: bool,
    /// L0 instruction-fetch filter size in bytes (power of two).
    pub l0i_size: u64,
    /// L0 data filter size in bytes (power of two).
    pub l0d_size: u64,
    /// Cache line size in bytes (power of two).
    pub line_size: u64,
    /// Soft per-thread byte cap; 0 disables.  We do not guarantee to match
    /// the cap exactly: up to one extra buffer may be written.
    pub max_trace_size: u64,
    /// Online consumers want fine-grained instruction typing.  Disables
    /// instruction bundling in online mode.
    pub online_instr_types: bool,
    /// Diagnostic verbosity (0 = warnings only).
    pub verbose: u8,
    /// Per-thread buffer capacity in records.  Must be large enough to hold
    /// every record emitted between fullness checks.
    pub buffer_entries: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            offline: true,
            ipc_name: String::new(),
            outdir: PathBuf::new(),
            use_physical: false,
            l0_filter: false,
            l0i_size: 32 * 1024,
            l0d_size: 32 * 1024,
            line_size: 64,
            max_trace_size: 0,
            online_instr_types: false,
            verbose: 0,
            buffer_entries: 4096,
        }
    }
}

impl Config {
    /// Validate the option set.  Configuration errors are fatal at client
    /// init; the embedder is expected to abort with the returned message.
    pub fn validate(&self) -> Result<()> {
        if self.offline {
            if self.outdir.as_os_str().is_empty() {
                bail!("Usage error: outdir is required for offline tracing");
            }
        } else if self.ipc_name.is_empty() {
            bail!("Usage error: ipc name is required for online tracing");
        }
        if self.buffer_entries < 2 {
            bail!("Usage error: buffer_entries must hold a header and at least one record");
        }
        if !self.line_size.is_power_of_two() {
            bail!("Usage error: line_size must be a power of two");
        }
        if self.l0_filter {
            for (name, size) in [("L0I_size", self.l0i_size), ("L0D_size", self.l0d_size)] {
                if !size.is_power_of_two() {
                    bail!("Usage error: {name} must be a power of two");
                }
                if size < self.line_size {
                    bail!("Usage error: {name} must be at least one cache line");
                }
            }
        }
        Ok(())
    }
}
