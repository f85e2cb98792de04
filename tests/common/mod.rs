//! Common test utilities: a simulated DBI host that executes instrumented
//! blocks through the reference executor, a capturing pipe, and an
//! independent record decoder built from the documented wire layout.

// Each test binary uses a different subset of these helpers.
#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::sync::Mutex;

use cachetrace::codegen::{AppView, CodeBlock, Machine, MemRefKey, Pred};
use cachetrace::planner::{BasicBlock, DbiHost};
use cachetrace::{PipeWriter, ThreadData, Tracer};

/// Host whose string-loop expansion reports a fixed answer.
pub struct SimHost {
    pub repstr: bool,
}

impl SimHost {
    pub fn new() -> Self {
        SimHost { repstr: false }
    }
}

impl DbiHost for SimHost {
    fn expand_rep_string(&self, _bb: &mut BasicBlock) -> bool {
        self.repstr
    }
}

/// Concrete application state for one execution of a block: effective
/// addresses per memory operand and predicate outcomes.
#[derive(Default)]
pub struct AppRun {
    pub addrs: HashMap<(usize, usize), u64>,
    pub preds: HashMap<u16, bool>,
}

impl AppRun {
    pub fn with_addrs(addrs: &[((usize, usize), u64)]) -> Self {
        AppRun {
            addrs: addrs.iter().copied().collect(),
            preds: HashMap::new(),
        }
    }
}

impl AppView for AppRun {
    fn operand_addr(&self, key: MemRefKey) -> u64 {
        self.addrs[&(key.instr, key.opnd)]
    }

    fn pred_true(&self, pred: Pred) -> bool {
        *self.preds.get(&pred.0).unwrap_or(&true)
    }
}

/// One simulated application thread: its tracer state plus a machine
/// executing the injected code.
pub struct TestThread<'t> {
    pub tracer: &'t Tracer,
    pub data: Option<ThreadData>,
    machine: Machine,
}

impl<'t> TestThread<'t> {
    pub fn new(tracer: &'t Tracer, tid: u32) -> Self {
        TestThread {
            tracer,
            data: Some(tracer.thread_init(tid).unwrap()),
            machine: Machine::default(),
        }
    }

    /// Execute one instrumented block, routing clean calls into the flush
    /// engine, exactly as the host would.
    pub fn run(&mut self, block: &CodeBlock, app: &AppRun) {
        let data = self.data.as_mut().unwrap();
        let tls = data.tls.clone();
        let tracer = self.tracer;
        unsafe {
            self.machine
                .run(block, &tls, app, &mut || tracer.clean_call(data));
        }
    }

    pub fn data(&self) -> &ThreadData {
        self.data.as_ref().unwrap()
    }

    pub fn exit(mut self) {
        self.tracer.thread_exit(self.data.take().unwrap());
    }
}

/// Online sink double: records every write and its size.
pub struct CapturePipe {
    pub atomic: usize,
    pub writes: Mutex<Vec<Vec<u8>>>,
}

impl CapturePipe {
    pub fn new(atomic: usize) -> Self {
        CapturePipe {
            atomic,
            writes: Mutex::new(Vec::new()),
        }
    }
}

impl PipeWriter for CapturePipe {
    fn atomic_write_size(&self) -> usize {
        self.atomic
    }

    fn write(&self, data: &[u8]) -> io::Result<usize> {
        self.writes.lock().unwrap().push(data.to_vec());
        Ok(data.len())
    }
}

/// Newtype wrapper so `Arc<CapturePipe>` can implement the foreign
/// `PipeWriter` trait despite the orphan rule (`Arc` is not fundamental).
pub struct ArcPipe(pub std::sync::Arc<CapturePipe>);

impl PipeWriter for ArcPipe {
    fn atomic_write_size(&self) -> usize {
        self.0.atomic_write_size()
    }

    fn write(&self, data: &[u8]) -> io::Result<usize> {
        self.0.write(data)
    }
}

/// Record types as documented for the trace stream; kept separate from the
/// crate's own definitions so decoding is an independent check.
pub const T_THREAD_HEADER: u16 = 0;
pub const T_THREAD: u16 = 1;
pub const T_PID: u16 = 2;
pub const T_THREAD_EXIT: u16 = 3;
pub const T_LOAD: u16 = 4;
pub const T_STORE: u16 = 5;
pub const T_INSTR: u16 = 7;
pub const T_INSTR_BUNDLE: u16 = 14;
pub const T_INSTR_FLUSH: u16 = 15;

pub const RECORD_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedRecord {
    pub typ: u16,
    pub size: u16,
    pub addr: u64,
}

/// Independent decoder: 16-byte records, `u16 type` at offset 0, `u16
/// size` at offset 2, `u64 addr` at offset 8, native byte order.
pub fn decode_stream(bytes: &[u8]) -> Vec<DecodedRecord> {
    assert_eq!(bytes.len() % RECORD_SIZE, 0, "truncated record stream");
    bytes
        .chunks_exact(RECORD_SIZE)
        .map(|chunk| DecodedRecord {
            typ: u16::from_ne_bytes([chunk[0], chunk[1]]),
            size: u16::from_ne_bytes([chunk[2], chunk[3]]),
            addr: u64::from_ne_bytes(chunk[8..16].try_into().unwrap()),
        })
        .collect()
}

/// The raw trace files of every run directory under `outdir`, keyed by
/// `<run-dir>/<file-name>` so files from different runs never collide.
pub fn read_raw_files(outdir: &std::path::Path) -> HashMap<String, Vec<u8>> {
    let mut files = HashMap::new();
    for run_dir in std::fs::read_dir(outdir).unwrap() {
        let run_dir = run_dir.unwrap().path();
        let dir_name = run_dir.file_name().unwrap().to_string_lossy().into_owned();
        let raw = run_dir.join("raw");
        if !raw.is_dir() {
            continue;
        }
        for entry in std::fs::read_dir(raw).unwrap() {
            let path = entry.unwrap().path();
            let name = path.file_name().unwrap().to_string_lossy().into_owned();
            if name == "modules.log" {
                continue;
            }
            files.insert(format!("{dir_name}/{name}"), std::fs::read(&path).unwrap());
        }
    }
    files
}

/// Payload records of a decoded per-thread stream: everything that is not
/// framing (thread header, tid/pid registration, unit headers).
pub fn payload_records(records: &[DecodedRecord]) -> Vec<DecodedRecord> {
    records
        .iter()
        .copied()
        .filter(|r| r.typ != T_THREAD_HEADER && r.typ != T_THREAD && r.typ != T_PID)
        .collect()
}
