//! Record encoders: the capability set that knows the on-wire record
//! layout and how to emit code that appends records.
//!
//! Two variants share the capability: [`OnlineEncoder`] for the pipe sink
//! and [`OfflineEncoder`] for per-thread raw files.  The offline variant
//! additionally records every observed module into the module-list file so
//! the post-processor can map instruction PCs back to images.

use std::io;
use std::sync::Mutex;

use anyhow::{Context, Result};

use crate::codegen::{CodeBlock, MemRefKey, Op, Pred, Reg};
use crate::fileops::TraceFile;
use crate::planner::{BasicBlock, Instr, InstrKind};
use crate::record::{
    RawEntry, RecordType, BUNDLE_MAX, ENTRY_ADDR_OFFS, ENTRY_SIZE, ENTRY_SIZE_OFFS,
    ENTRY_TYPE_OFFS,
};
use crate::record::write_entry;

/// A module the host reports as loaded into the traced process.
#[derive(Debug, Clone)]
pub struct ModuleInfo {
    pub base: u64,
    pub end: u64,
    pub entry: u64,
    pub path: String,
}

/// Producer-specific bytes attached to each module-list record.
pub type ModuleDataFn = Box<dyn Fn(&ModuleInfo) -> Option<Vec<u8>> + Send + Sync>;

fn instr_record_type(kind: InstrKind) -> RecordType {
    match kind {
        InstrKind::Regular => RecordType::Instr,
        InstrKind::DirectJump => RecordType::InstrDirectJump,
        InstrKind::IndirectJump => RecordType::InstrIndirectJump,
        InstrKind::ConditionalJump => RecordType::InstrConditionalJump,
        InstrKind::DirectCall => RecordType::InstrDirectCall,
        InstrKind::IndirectCall => RecordType::InstrIndirectCall,
        InstrKind::Return => RecordType::InstrReturn,
    }
}

/// Emit inline stores writing one full record at `buf_ptr + adjust` with an
/// immediate address field.  Returns the new adjust.
fn emit_entry_imm(
    cb: &mut CodeBlock,
    reg_ptr: Reg,
    adjust: i32,
    typ: RecordType,
    size: u16,
    addr: u64,
) -> i32 {
    cb.emit(Op::StoreHalfImm(reg_ptr, adjust + ENTRY_TYPE_OFFS, typ as u16));
    cb.emit(Op::StoreHalfImm(reg_ptr, adjust + ENTRY_SIZE_OFFS, size));
    cb.emit(Op::StoreImm(reg_ptr, adjust + ENTRY_ADDR_OFFS, addr));
    adjust + ENTRY_SIZE as i32
}

/// The record-encoding capability.
///
/// The `append_*` operations write finished records at the start of the
/// given buffer and return the bytes written; the `instrument_*` operations
/// emit inline code that writes records at `buf_ptr + adjust` when the
/// instrumented code runs, returning the accumulated adjust.
pub trait Encoder: Send + Sync {
    fn sizeof_entry(&self) -> usize {
        ENTRY_SIZE
    }

    fn append_thread_header(&self, buf: &mut [u8], tid: u32) -> usize {
        write_entry(
            buf,
            RawEntry {
                typ: RecordType::ThreadHeader as u16,
                size: 0,
                addr: tid as u64,
            },
        )
    }

    fn append_tid(&self, buf: &mut [u8], tid: u32) -> usize {
        write_entry(
            buf,
            RawEntry {
                typ: RecordType::Thread as u16,
                size: 0,
                addr: tid as u64,
            },
        )
    }

    fn append_pid(&self, buf: &mut [u8], pid: u32) -> usize {
        write_entry(
            buf,
            RawEntry {
                typ: RecordType::Pid as u16,
                size: 0,
                addr: pid as u64,
            },
        )
    }

    fn append_thread_exit(&self, buf: &mut [u8], tid: u32) -> usize {
        write_entry(
            buf,
            RawEntry {
                typ: RecordType::ThreadExit as u16,
                size: 0,
                addr: tid as u64,
            },
        )
    }

    fn append_iflush(&self, buf: &mut [u8], start: u64, size: u64) -> usize {
        write_entry(
            buf,
            RawEntry {
                typ: RecordType::InstrFlush as u16,
                size: size.min(u16::MAX as u64) as u16,
                addr: start,
            },
        )
    }

    /// The leading record of every flush unit identifies the emitting
    /// thread.
    fn append_unit_header(&self, buf: &mut [u8], tid: u32) -> usize {
        self.append_tid(buf, tid)
    }

    /// Analysis-phase hook: the returned cookie is handed back to every
    /// `instrument_*` call for this block.  Bit 0 records the repstr flag.
    fn bb_analysis(&self, _bb: &BasicBlock, repstr: bool) -> u64 {
        repstr as u64
    }

    /// Emit inline code writing one instruction-fetch entry.
    fn instrument_instr(
        &self,
        cb: &mut CodeBlock,
        cookie: u64,
        reg_ptr: Reg,
        adjust: i32,
        instr: &Instr,
    ) -> i32;

    /// Emit one packed bundle record summarizing a run of simple
    /// instructions.  Callers must not bundle when physical addresses are
    /// in use, since a bundle may straddle pages.
    fn instrument_ibundle(
        &self,
        cb: &mut CodeBlock,
        reg_ptr: Reg,
        mut adjust: i32,
        instrs: &[&Instr],
    ) -> i32 {
        for chunk in instrs.chunks(BUNDLE_MAX) {
            let mut packed = 0u64;
            for (i, instr) in chunk.iter().enumerate() {
                packed |= (instr.length.min(u8::MAX as u16) as u64) << (8 * i);
            }
            adjust = emit_entry_imm(
                cb,
                reg_ptr,
                adjust,
                RecordType::InstrBundle,
                chunk.len() as u16,
                packed,
            );
        }
        adjust
    }

    /// Emit inline code writing one memory-reference entry, honoring the
    /// source instruction's predicate so the record is conditionally
    /// written.
    fn instrument_memref(
        &self,
        cb: &mut CodeBlock,
        reg_ptr: Reg,
        reg_tmp: Reg,
        adjust: i32,
        instr: &Instr,
        key: MemRefKey,
        write: bool,
        pred: Option<Pred>,
    ) -> i32 {
        let opnd = &instr.mem_ops[key.opnd];
        let typ = if opnd.is_prefetch {
            RecordType::Prefetch
        } else if write {
            RecordType::Store
        } else {
            RecordType::Load
        };
        let mark = cb.mark();
        let skip = match pred {
            Some(pred) if !cb.caps().predication => {
                let skip = cb.new_label();
                cb.emit(Op::JumpIfPredFalse(pred, skip));
                Some(skip)
            }
            _ => None,
        };
        cb.emit(Op::StoreHalfImm(reg_ptr, adjust + ENTRY_TYPE_OFFS, typ as u16));
        cb.emit(Op::StoreHalfImm(reg_ptr, adjust + ENTRY_SIZE_OFFS, opnd.size));
        self.insert_obtain_addr(cb, reg_tmp, key);
        cb.emit(Op::Store(reg_ptr, adjust + ENTRY_ADDR_OFFS, reg_tmp));
        match (pred, skip) {
            (Some(pred), None) => cb.tag_pred_since(mark, pred),
            (_, Some(skip)) => cb.bind(skip),
            _ => {}
        }
        adjust + ENTRY_SIZE as i32
    }

    /// Emit inline code that materializes the effective address of a memory
    /// operand into `dst`.
    fn insert_obtain_addr(&self, cb: &mut CodeBlock, dst: Reg, key: MemRefKey) {
        cb.emit(Op::ObtainAddr(dst, key));
    }

    /// Offline variant records newly observed modules; a no-op online.
    fn module_loaded(&self, _module: &ModuleInfo) -> Result<()> {
        Ok(())
    }

    /// Swap in the child's module-list file after a fork.
    fn on_fork(&self, _module_file: Option<Box<dyn TraceFile>>) {}
}

/// Encoder for the online pipe sink.
pub struct OnlineEncoder {
    /// Fine-grained instruction typing, requested by online consumers; when
    /// off, every fetch is a plain instruction record.
    instr_types: bool,
}

impl OnlineEncoder {
    pub fn new(instr_types: bool) -> Self {
        OnlineEncoder { instr_types }
    }
}

impl Encoder for OnlineEncoder {
    fn instrument_instr(
        &self,
        cb: &mut CodeBlock,
        cookie: u64,
        reg_ptr: Reg,
        adjust: i32,
        instr: &Instr,
    ) -> i32 {
        let repstr = cookie & 1 != 0;
        let typ = if self.instr_types && !repstr {
            instr_record_type(instr.kind)
        } else {
            RecordType::Instr
        };
        emit_entry_imm(cb, reg_ptr, adjust, typ, instr.length, instr.pc)
    }
}

struct ModuleLog {
    file: Option<Box<dyn TraceFile>>,
    count: u32,
}

/// Encoder for offline raw files; owns the module-list file.
pub struct OfflineEncoder {
    log: Mutex<ModuleLog>,
    module_data: Mutex<Option<ModuleDataFn>>,
}

impl OfflineEncoder {
    pub fn new(module_file: Box<dyn TraceFile>, module_data: Option<ModuleDataFn>) -> Self {
        OfflineEncoder {
            log: Mutex::new(ModuleLog {
                file: Some(module_file),
                count: 0,
            }),
            module_data: Mutex::new(module_data),
        }
    }

    /// Install the custom module-metadata callback.  The first registrant
    /// wins; later calls are silently ignored.
    pub fn set_module_data(&self, cb: ModuleDataFn) {
        let mut slot = self.module_data.lock().unwrap();
        if slot.is_none() {
            *slot = Some(cb);
        }
    }
}

impl Encoder for OfflineEncoder {
    fn instrument_instr(
        &self,
        cb: &mut CodeBlock,
        cookie: u64,
        reg_ptr: Reg,
        adjust: i32,
        instr: &Instr,
    ) -> i32 {
        // Expanded string loops carry synthesized instructions whose kinds
        // are not the application's; record them untyped and let the
        // post-processor deduplicate.
        let typ = if cookie & 1 != 0 {
            RecordType::Instr
        } else {
            instr_record_type(instr.kind)
        };
        emit_entry_imm(cb, reg_ptr, adjust, typ, instr.length, instr.pc)
    }

    fn module_loaded(&self, module: &ModuleInfo) -> Result<()> {
        let custom = {
            let data = self.module_data.lock().unwrap();
            data.as_ref().and_then(|cb| cb(module))
        };
        let mut log = self.log.lock().unwrap();
        let index = log.count;
        let mut line = format!(
            "{}, 0x{:x}, 0x{:x}, 0x{:x}, {}",
            index, module.base, module.end, module.entry, module.path
        );
        if let Some(custom) = custom {
            line.push_str(", ");
            for byte in custom {
                line.push_str(&format!("{byte:02x}"));
            }
        }
        line.push('\n');
        let file = log
            .file
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
            .context("module-list file is closed")?;
        let bytes = line.as_bytes();
        let mut written = 0;
        while written < bytes.len() {
            let n = file
                .write(&bytes[written..])
                .context("Failed to write module list")?;
            if n == 0 {
                anyhow::bail!("Short write to module list");
            }
            written += n;
        }
        log.count += 1;
        Ok(())
    }

    fn on_fork(&self, module_file: Option<Box<dyn TraceFile>>) {
        let mut log = self.log.lock().unwrap();
        log.file = module_file;
        log.count = 0;
    }
}
