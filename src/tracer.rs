//! Global tracer state and the thread/process lifecycle.
//!
//! One [`Tracer`] exists per traced process.  Threads get their state from
//! [`Tracer::thread_init`] and return it at [`Tracer::thread_exit`]; a
//! forked child re-runs init through [`Tracer::fork_init`].  The only
//! cross-thread state is the sink itself and the global reference counter,
//! folded under a mutex at thread exit.

use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::{bail, Context, Result};

use crate::buffer::{BufferGeometry, ThreadData, TraceBuffer};
use crate::codegen::{ArchCaps, TLS_SLOT_BUF_PTR, TLS_SLOT_DCACHE, TLS_SLOT_ICACHE};
use crate::config::Config;
use crate::encoder::{Encoder, ModuleDataFn, ModuleInfo, OfflineEncoder, OnlineEncoder};
use crate::fileops::{FileOps, TraceFile};
use crate::filter::{FilterGeometry, TagArray};
use crate::physaddr::PhysAddr;
use crate::pipe::{NamedPipe, PipeWriter};
use crate::{fatal, notify, set_verbosity};

/// Prefix of every output name this tracer creates.
pub const OUTFILE_PREFIX: &str = "memtrace";
/// Subdirectory of the run directory holding the raw per-thread files.
pub const RAW_SUBDIR: &str = "raw";
/// Well-known module-list file name inside the raw subdirectory.
pub const MODULE_LIST_FILENAME: &str = "modules.log";
/// Unique-name retries before giving up on file or directory creation.
pub const NUM_UNIQUE_TRIES: u32 = 10_000;

/// Replaceable buffer allocator; `None` models allocation failure.
pub type BufferAllocFn = Box<dyn Fn(usize) -> Option<Box<[u8]>> + Send + Sync>;

pub(crate) struct Filters {
    pub icache: FilterGeometry,
    pub dcache: FilterGeometry,
}

pub(crate) enum Sink {
    Offline {
        /// Directory the raw thread files go into; replaced in a forked
        /// child.
        logdir: Mutex<PathBuf>,
        modlist_path: Mutex<PathBuf>,
    },
    Online {
        pipe: Box<dyn PipeWriter>,
    },
}

/// Process-wide tracer state.
pub struct Tracer {
    pub(crate) config: Config,
    pub(crate) geom: BufferGeometry,
    pub(crate) arch: ArchCaps,
    pub(crate) encoder: Box<dyn Encoder>,
    pub(crate) sink: Sink,
    pub(crate) file_ops: FileOps,
    pub(crate) physaddr: Option<PhysAddr>,
    /// Mutated once on OOM degradation, hence atomic rather than config.
    pub(crate) max_trace_size: AtomicU64,
    pub(crate) global_refs: Mutex<u64>,
    pub(crate) buffer_alloc: BufferAllocFn,
    pub(crate) filters: Option<Filters>,
}

/// Builder wiring optional collaborators before init.
pub struct TracerBuilder {
    config: Config,
    file_ops: FileOps,
    pipe: Option<Box<dyn PipeWriter>>,
    arch: ArchCaps,
    buffer_alloc: Option<BufferAllocFn>,
    module_data: Option<ModuleDataFn>,
}

impl TracerBuilder {
    /// Replace the OS-backed file operations.
    pub fn file_ops(mut self, file_ops: FileOps) -> Self {
        self.file_ops = file_ops;
        self
    }

    /// Supply the online pipe directly instead of opening `ipc_name`.
    pub fn pipe(mut self, pipe: Box<dyn PipeWriter>) -> Self {
        self.pipe = Some(pipe);
        self
    }

    pub fn arch(mut self, arch: ArchCaps) -> Self {
        self.arch = arch;
        self
    }

    /// Replace the buffer allocator (used to exercise the OOM paths).
    pub fn buffer_alloc(mut self, alloc: BufferAllocFn) -> Self {
        self.buffer_alloc = Some(alloc);
        self
    }

    /// Attach producer-specific bytes to offline module records.
    pub fn module_data(mut self, module_data: ModuleDataFn) -> Self {
        self.module_data = Some(module_data);
        self
    }

    pub fn build(self) -> Result<Tracer> {
        let TracerBuilder {
            config,
            file_ops,
            pipe,
            arch,
            buffer_alloc,
            module_data,
        } = self;
        config.validate()?;
        set_verbosity(config.verbose);

        let (sink, encoder): (Sink, Box<dyn Encoder>) = if config.offline {
            let (logdir, modlist_path, module_file) =
                init_offline_dir(&file_ops, &config.outdir)?;
            let encoder = OfflineEncoder::new(module_file, module_data);
            (
                Sink::Offline {
                    logdir: Mutex::new(logdir),
                    modlist_path: Mutex::new(modlist_path),
                },
                Box::new(encoder),
            )
        } else {
            let pipe = match pipe {
                Some(pipe) => pipe,
                None => {
                    let pipe = NamedPipe::open(Path::new(&config.ipc_name))?;
                    if !pipe.maximize_buffer() {
                        notify!(1, "Failed to maximize pipe buffer: performance may suffer.");
                    }
                    Box::new(pipe) as Box<dyn PipeWriter>
                }
            };
            (
                Sink::Online { pipe },
                Box::new(OnlineEncoder::new(config.online_instr_types)),
            )
        };

        let physaddr = if config.use_physical {
            match PhysAddr::init() {
                Ok(physaddr) => Some(physaddr),
                Err(_) => {
                    notify!(0, "Unable to open pagemap: using virtual addresses.");
                    None
                }
            }
        } else {
            None
        };

        let filters = config.l0_filter.then(|| Filters {
            icache: FilterGeometry::new(config.l0i_size, config.line_size),
            dcache: FilterGeometry::new(config.l0d_size, config.line_size),
        });

        let geom = BufferGeometry::new(encoder.sizeof_entry(), config.buffer_entries);
        Ok(Tracer {
            max_trace_size: AtomicU64::new(config.max_trace_size),
            config,
            geom,
            arch,
            encoder,
            sink,
            file_ops,
            physaddr,
            global_refs: Mutex::new(0),
            buffer_alloc: buffer_alloc
                .unwrap_or_else(|| Box::new(|size| Some(vec![0u8; size].into_boxed_slice()))),
            filters,
        })
    }
}

impl Tracer {
    pub fn builder(config: Config) -> TracerBuilder {
        TracerBuilder {
            config,
            file_ops: FileOps::default(),
            pipe: None,
            arch: ArchCaps::default(),
            buffer_alloc: None,
            module_data: None,
        }
    }

    /// Initialize with all-default collaborators.
    pub fn new(config: Config) -> Result<Tracer> {
        Tracer::builder(config).build()
    }

    pub(crate) fn translate_physical(&self) -> bool {
        self.physaddr.is_some()
    }

    /// Path of the module-list file (offline mode).
    pub fn modlist_path(&self) -> Option<PathBuf> {
        match &self.sink {
            Sink::Offline { modlist_path, .. } => Some(modlist_path.lock().unwrap().clone()),
            Sink::Online { .. } => None,
        }
    }

    /// Host module-load event; the offline encoder records it.
    pub fn module_loaded(&self, module: &ModuleInfo) -> Result<()> {
        self.encoder.module_loaded(module)
    }

    /// Allocate (or degrade to the reserve) this thread's primary buffer.
    pub(crate) fn create_buffer(&self, data: &mut ThreadData) {
        match (self.buffer_alloc)(self.geom.total_size()) {
            Some(mem) => {
                data.buffer = Some(TraceBuffer::from_mem(mem, self.geom.payload_size));
                data.num_buffers += 1;
                if data.num_buffers == 2 {
                    // The reserve buffer waits for the second allocation so
                    // idle threads never pay for it.
                    if let Some(mem) = (self.buffer_alloc)(self.geom.total_size()) {
                        data.reserve =
                            Some(TraceBuffer::from_mem(mem, self.geom.payload_size));
                    }
                }
            }
            None => {
                if data.reserve.is_none() {
                    fatal("out of memory and cannot recover");
                }
                notify!(0, "Out of memory: truncating further tracing.");
                data.buffer = data.reserve.take();
                data.in_reserve = true;
                // Cap the trace below what this thread already wrote so no
                // future flush writes anything out.
                self.max_trace_size.store(
                    data.bytes_written.saturating_sub(1).max(1),
                    Ordering::Relaxed,
                );
            }
        }
    }

    /// Set up tracing for a new application thread.
    pub fn thread_init(&self, tid: u32) -> Result<ThreadData> {
        let mut data = ThreadData::new(tid);
        self.create_buffer(&mut data);
        self.init_thread_in_process(&mut data)?;
        Ok(data)
    }

    /// The part of thread init redone after a fork: a new offline file, or
    /// a new thread/process registration pair online.
    fn init_thread_in_process(&self, data: &mut ThreadData) -> Result<()> {
        let tid = data.tid;
        let pid = process::id();
        match &self.sink {
            Sink::Offline { logdir, .. } => {
                let dir = logdir.lock().unwrap().clone();
                let mut opened = None;
                for i in 0..NUM_UNIQUE_TRIES {
                    let path = dir.join(format!("{OUTFILE_PREFIX}.{tid:05}.{i:04}.log"));
                    if let Ok(file) = (self.file_ops.open)(&path) {
                        notify!(2, "Created thread trace file {}", path.display());
                        opened = Some(file);
                        break;
                    }
                }
                let Some(file) = opened else {
                    bail!(
                        "failed to create a unique trace file for thread {tid} in {}",
                        dir.display()
                    );
                };
                data.file = Some(file);

                // Initial headers go at the top of the first buffer; the
                // first flush writes them out in place of a unit header.
                let buffer = data.buffer.as_mut().expect("thread buffer");
                let base = buffer.base();
                let slice = buffer.as_mut_slice();
                let mut offs = self.encoder.append_thread_header(slice, tid);
                data.init_header_size = offs;
                offs += self.encoder.append_tid(&mut slice[offs..], tid);
                offs += self.encoder.append_pid(&mut slice[offs..], pid);
                data.tls.write(TLS_SLOT_BUF_PTR, base + offs as u64);
            }
            Sink::Online { pipe } => {
                // Register this thread with the simulator through the
                // normal flush path.
                let entry_size = self.geom.entry_size;
                let mut reg = vec![0u8; 3 * entry_size];
                let mut offs = self.encoder.append_thread_header(&mut reg, tid);
                offs += self.encoder.append_tid(&mut reg[offs..], tid);
                offs += self.encoder.append_pid(&mut reg[offs..], pid);
                self.atomic_pipe_write(pipe.as_ref(), &mut reg, 0, offs, tid);

                let base = data.buffer.as_ref().expect("thread buffer").base();
                data.tls
                    .write(TLS_SLOT_BUF_PTR, base + self.geom.hdr_size as u64);
            }
        }

        if let Some(filters) = &self.filters {
            let dcache = TagArray::new(&filters.dcache);
            data.tls.write(TLS_SLOT_DCACHE, dcache.base());
            data.dcache = Some(dcache);
            let icache = TagArray::new(&filters.icache);
            data.tls.write(TLS_SLOT_ICACHE, icache.base());
            data.icache = Some(icache);
        }
        Ok(())
    }

    /// Drain and tear down an exiting thread.  The exit marker is written
    /// even when the thread is over the byte cap.
    pub fn thread_exit(&self, mut data: ThreadData) {
        let cap = self.max_trace_size.load(Ordering::Relaxed);
        let entry_size = self.geom.entry_size;
        {
            let buffer = data.buffer.as_mut().expect("thread buffer");
            let base = buffer.base();
            if cap > 0 && data.bytes_written > cap {
                // Over the limit: drop the staged payload so only the
                // footer goes out.
                data.tls
                    .write(TLS_SLOT_BUF_PTR, base + self.geom.hdr_size as u64);
            }
            let offset = (data.tls.read(TLS_SLOT_BUF_PTR) - base) as usize;
            self.encoder
                .append_thread_exit(&mut buffer.as_mut_slice()[offset..], data.tid);
            data.tls
                .write(TLS_SLOT_BUF_PTR, base + (offset + entry_size) as u64);
        }
        self.memtrace(&mut data, true);

        // Close the thread file; buffers and filter arrays go with the
        // thread data.
        data.file = None;
        let mut refs = self.global_refs.lock().unwrap();
        *refs += data.num_refs;
    }

    /// Re-init in a forked child: fresh counters, a fresh output directory
    /// and module list (offline), and a new thread file or registration.
    /// Outstanding data was flushed before the fork syscall.
    pub fn fork_init(&self, data: &mut ThreadData) -> Result<()> {
        // Only references in the new process count; this also re-arms the
        // offline initial-header path in the flush engine.
        data.num_refs = 0;
        if let Sink::Offline {
            logdir,
            modlist_path,
        } = &self.sink
        {
            let (new_dir, new_modpath, module_file) =
                init_offline_dir(&self.file_ops, &self.config.outdir)?;
            *logdir.lock().unwrap() = new_dir;
            *modlist_path.lock().unwrap() = new_modpath;
            self.encoder.on_fork(Some(module_file));
        }
        // The parent's descriptor is close-on-fork.
        data.file = None;
        self.init_thread_in_process(data)
    }

    /// Syscall-entry hook.  The host decodes instruction-cache-flush
    /// syscalls on architectures that expose them and passes the range.
    pub fn pre_syscall(&self, data: &mut ThreadData, icache_flush: Option<(u64, u64)>) {
        if let Some((start, size)) = icache_flush {
            if size > 0 {
                let buffer = data.buffer.as_mut().expect("thread buffer");
                let base = buffer.base();
                let offset = (data.tls.read(TLS_SLOT_BUF_PTR) - base) as usize;
                let written = self
                    .encoder
                    .append_iflush(&mut buffer.as_mut_slice()[offset..], start, size);
                data.tls
                    .write(TLS_SLOT_BUF_PTR, base + (offset + written) as u64);
            }
        }
        if self.file_ops.handoff.is_none() {
            self.memtrace(data, false);
        }
    }

    /// Tear down at process exit: close the sink, then run the registered
    /// exit callback.
    pub fn process_exit(self) {
        let Tracer {
            encoder,
            sink,
            mut file_ops,
            global_refs,
            ..
        } = self;
        let total = *global_refs.lock().unwrap();
        notify!(
            1,
            "memtrace exiting process {}; traced {} references.",
            process::id(),
            total
        );
        // Closing order: encoder first (module list), then the sink.
        drop(encoder);
        drop(sink);
        if let Some(exit_cb) = file_ops.exit_cb.take() {
            exit_cb();
        }
    }
}

/// Create the unique run directory, its raw subdirectory, and the
/// module-list file.
fn init_offline_dir(
    file_ops: &FileOps,
    outdir: &Path,
) -> Result<(PathBuf, PathBuf, Box<dyn TraceFile>)> {
    let pid = process::id();
    let mut created = None;
    for i in 0..NUM_UNIQUE_TRIES {
        let dir = outdir.join(format!("{OUTFILE_PREFIX}.{pid}.{i:04}.dir"));
        if (file_ops.create_dir)(&dir).is_ok() {
            created = Some(dir);
            break;
        }
    }
    let Some(dir) = created else {
        bail!("Failed to create a unique subdir in {}", outdir.display());
    };
    // Raw thread files are grouped a level down, isolated from the
    // processed trace the post-processor writes beside them.
    let raw = dir.join(RAW_SUBDIR);
    (file_ops.create_dir)(&raw)
        .with_context(|| format!("Failed to create {}", raw.display()))?;
    // A replaced create_dir may be a network nop; the notice is only
    // meaningful for the default.
    if file_ops.default_create_dir {
        notify!(1, "Log directory is {}", raw.display());
    }
    let modlist = raw.join(MODULE_LIST_FILENAME);
    let module_file = (file_ops.open)(&modlist)
        .with_context(|| format!("Failed to create {}", modlist.display()))?;
    Ok((raw, modlist, module_file))
}
