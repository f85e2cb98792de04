//! The basic-block instrumentation pipeline.
//!
//! The host DBI presents each basic block across four phases: an app2app
//! pass (string-loop expansion), an analysis pass, a per-instruction pass,
//! and a post pass where the per-block state is dropped.  The planner runs
//! across these phases and produces the injected code: instruction and
//! memory-reference record emission, optional L0 filter probes, buffer
//! pointer updates, and the block-end fullness check with its clean call.

use crate::codegen::{
    CodeBlock, MemRefKey, Op, Pred, Reg, TLS_SLOT_BUF_PTR, TLS_SLOT_DCACHE, TLS_SLOT_ICACHE,
};
use crate::fatal;
use crate::filter::{self, ProbeTarget};
use crate::tracer::Tracer;

/// Capacity of the delay buffer: the longest run of simple instructions
/// summarized by bundle records.
pub const MAX_DELAY_INSTRS: usize = 32;

/// Instruction classes the encoders may type fetch records with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstrKind {
    Regular,
    DirectJump,
    IndirectJump,
    ConditionalJump,
    DirectCall,
    IndirectCall,
    Return,
}

/// One memory operand of an application instruction.
#[derive(Debug, Clone, Copy)]
pub struct MemOperand {
    pub size: u16,
    pub is_store: bool,
    pub is_prefetch: bool,
}

/// The host's description of one decoded instruction.
#[derive(Debug, Clone)]
pub struct Instr {
    pub pc: u64,
    pub length: u16,
    pub kind: InstrKind,
    /// False for instructions the host inserted (meta code).
    pub is_app: bool,
    pub mem_ops: Vec<MemOperand>,
    pub predicate: Option<Pred>,
    /// Store side of a load-exclusive/store-exclusive pair.
    pub is_exclusive_store: bool,
    /// The store also writes its own base register, so its instrumentation
    /// cannot be deferred past it.
    pub writes_own_base: bool,
}

impl Instr {
    pub fn is_memref(&self) -> bool {
        !self.mem_ops.is_empty()
    }
}

/// One basic block as handed over by the host.
#[derive(Debug, Clone, Default)]
pub struct BasicBlock {
    pub instrs: Vec<Instr>,
}

/// Host utilities the planner delegates to.
pub trait DbiHost {
    /// Expand string-loop instructions into regular loops so every
    /// per-iteration reference is visible.  Returns whether the block was
    /// such an expansion.
    fn expand_rep_string(&self, bb: &mut BasicBlock) -> bool;
}

/// Per-block user data; lives only while one block is instrumented.
#[derive(Default)]
struct BlockState {
    last_app_pc: Option<u64>,
    /// Deferred exclusive store, instrumented at the next instruction so
    /// injected code does not separate the LL/SC pair.
    strex: Option<usize>,
    delay: [usize; MAX_DELAY_INSTRS],
    num_delay: usize,
    repstr: bool,
    /// Encoder-private cookie from the analysis pass.
    cookie: u64,
}

impl Tracer {
    /// Run the full instrumentation pipeline over one basic block and
    /// return the injected code.
    pub fn instrument_block(&self, host: &dyn DbiHost, bb: &mut BasicBlock) -> CodeBlock {
        let mut ud = BlockState {
            repstr: host.expand_rep_string(bb),
            ..Default::default()
        };
        ud.cookie = self.encoder.bb_analysis(bb, ud.repstr);
        let mut cb = CodeBlock::new(self.arch);
        for idx in 0..bb.instrs.len() {
            self.instrument_one(&mut cb, bb, idx, &mut ud);
        }
        cb
    }

    fn instrument_one(&self, cb: &mut CodeBlock, bb: &BasicBlock, idx: usize, ud: &mut BlockState) {
        let instr = &bb.instrs[idx];
        let offline = self.config.offline;
        let filtered = self.filters.is_some();
        let is_first = idx == 0;
        let is_last = idx == bb.instrs.len() - 1;

        // Skip meta instructions and duplicate PCs from string-loop
        // expansion (the expansion means the fetch trace carries the wrong
        // instruction length; we live with that).  Offline still needs an
        // instruction entry for the start of the block.
        if (!instr.is_app || ud.last_app_pc == Some(instr.pc))
            && ud.strex.is_none()
            && (!offline || !is_first)
        {
            return;
        }

        // Defer an exclusive store with a clean destination: its records
        // are emitted after the store so the instrumentation does not sit
        // between the LL/SC pair.  A store that clobbers its own base
        // cannot be deferred, since the address is gone afterwards.
        if ud.strex.is_none() && instr.is_exclusive_store && !instr.writes_own_base {
            ud.strex = Some(idx);
            ud.last_app_pc = Some(instr.pc);
            return;
        }

        // Delay simple instructions so a run of them becomes one bundle.
        let bundleable = instr.kind == InstrKind::Regular
            || (!offline && !self.config.online_instr_types);
        if (!offline || !is_first)
            && !instr.is_memref()
            && !is_last
            && bundleable
            && ud.strex.is_none()
            && !filtered
            && ud.num_delay < MAX_DELAY_INSTRS
        {
            ud.delay[ud.num_delay] = idx;
            ud.num_delay += 1;
            return;
        }

        let pred = instr.predicate;
        // Two scratch registers per instrumented instruction rather than
        // per entry.  The primary must be eligible for the short
        // branch-if-zero encoding so the fullness check's jump reaches
        // across the clean call; on hosts without that instruction the
        // secondary carries the saved flags instead.
        let Some(reg_ptr) = cb.reserve_scratch(true) else {
            fatal("failed to reserve scratch registers");
        };
        let Some(reg_tmp) = cb.reserve_scratch(false) else {
            fatal("failed to reserve scratch registers");
        };

        let mut adjust = 0;
        // The filter path loads the buffer pointer after its own probe.
        if !filtered {
            cb.emit(Op::ReadTls(reg_ptr, TLS_SLOT_BUF_PTR));
        }

        if ud.num_delay != 0 {
            adjust = self.instrument_delay_instrs(cb, bb, ud, reg_ptr, adjust);
        }

        if let Some(sidx) = ud.strex.take() {
            let strex = &bb.instrs[sidx];
            debug_assert!(strex.is_exclusive_store);
            adjust = self.instr_entry(cb, bb, ud, sidx, reg_ptr, reg_tmp, adjust);
            if let Some(opnd) = strex.mem_ops.iter().position(|op| op.is_store) {
                adjust = self.memref_entry(
                    cb,
                    bb,
                    sidx,
                    opnd,
                    reg_ptr,
                    reg_tmp,
                    adjust,
                    true,
                    strex.predicate,
                );
            }
        }

        // The instruction entry doubles as the PC context for the data
        // entries that follow it.  A repstr expansion keeps only the
        // original fetch.
        let is_memref = instr.is_memref();
        if is_memref || !ud.repstr {
            adjust = self.instr_entry(cb, bb, ud, idx, reg_ptr, reg_tmp, adjust);
        }
        ud.last_app_pc = Some(instr.pc);

        if is_memref {
            if pred.is_some() && adjust != 0 {
                // The predicated emission below may not execute; settle the
                // unconditional part of the adjustment first.
                self.update_buf_ptr(cb, reg_ptr, None, adjust);
                adjust = 0;
            }
            for (opnd, mem) in instr.mem_ops.iter().enumerate() {
                if !mem.is_store {
                    adjust = self.memref_entry(
                        cb, bb, idx, opnd, reg_ptr, reg_tmp, adjust, false, pred,
                    );
                }
            }
            for (opnd, mem) in instr.mem_ops.iter().enumerate() {
                if mem.is_store {
                    adjust = self.memref_entry(
                        cb, bb, idx, opnd, reg_ptr, reg_tmp, adjust, true, pred,
                    );
                }
            }
            if adjust != 0 {
                self.update_buf_ptr(cb, reg_ptr, pred, adjust);
            }
        } else if adjust != 0 {
            self.update_buf_ptr(cb, reg_ptr, None, adjust);
        }

        if is_last {
            if filtered {
                cb.emit(Op::ReadTls(reg_ptr, TLS_SLOT_BUF_PTR));
            }
            self.emit_fullness_check(cb, reg_ptr, reg_tmp);
        }

        cb.unreserve_scratch(reg_ptr);
        cb.unreserve_scratch(reg_tmp);
    }

    fn instrument_delay_instrs(
        &self,
        cb: &mut CodeBlock,
        bb: &BasicBlock,
        ud: &mut BlockState,
        reg_ptr: Reg,
        mut adjust: i32,
    ) -> i32 {
        if ud.repstr {
            // The expansion's mix of translations would skew the fetch
            // statistics; the pre-memref instruction entry suffices for the
            // whole block.
            ud.num_delay = 0;
            return adjust;
        }
        let delayed = &ud.delay[..ud.num_delay];
        adjust = self
            .encoder
            .instrument_instr(cb, ud.cookie, reg_ptr, adjust, &bb.instrs[delayed[0]]);
        if self.translate_physical() {
            // A bundle may straddle pages, so emit full entries instead.
            for &di in &delayed[1..] {
                adjust = self
                    .encoder
                    .instrument_instr(cb, ud.cookie, reg_ptr, adjust, &bb.instrs[di]);
            }
        } else if delayed.len() > 1 {
            let rest: Vec<&Instr> = delayed[1..].iter().map(|&di| &bb.instrs[di]).collect();
            adjust = self.encoder.instrument_ibundle(cb, reg_ptr, adjust, &rest);
        }
        ud.num_delay = 0;
        adjust
    }

    fn instr_entry(
        &self,
        cb: &mut CodeBlock,
        bb: &BasicBlock,
        ud: &mut BlockState,
        idx: usize,
        reg_ptr: Reg,
        reg_tmp: Reg,
        mut adjust: i32,
    ) -> i32 {
        let instr = &bb.instrs[idx];
        let skip = cb.new_label();
        let mut reg_third = None;
        if let Some(filters) = &self.filters {
            let geom = &filters.icache;
            // Still on the same line as the previous fetch: skip even the
            // array probe.  A fetch straddling two lines is filtered by its
            // first line only.
            if let Some(last) = ud.last_app_pc {
                if geom.line_index(last) == geom.line_index(instr.pc) {
                    return adjust;
                }
            }
            ud.last_app_pc = Some(instr.pc);
            reg_third = Some(filter::emit_probe(
                cb,
                geom,
                TLS_SLOT_ICACHE,
                reg_ptr,
                reg_tmp,
                ProbeTarget::Pc(instr.pc),
                skip,
                None,
            ));
            cb.emit(Op::ReadTls(reg_ptr, TLS_SLOT_BUF_PTR));
        }
        adjust = self
            .encoder
            .instrument_instr(cb, ud.cookie, reg_ptr, adjust, instr);
        if self.filters.is_some() && adjust != 0 {
            // Filter hits and misses break up the adjustment, so fold it
            // into the pointer immediately.
            self.update_buf_ptr(cb, reg_ptr, None, adjust);
            adjust = 0;
        }
        cb.bind(skip);
        // Scratch parity on all paths: the filter scratch is released after
        // the skip target.
        if let Some(reg) = reg_third {
            cb.unreserve_scratch(reg);
        }
        adjust
    }

    #[allow(clippy::too_many_arguments)]
    fn memref_entry(
        &self,
        cb: &mut CodeBlock,
        bb: &BasicBlock,
        idx: usize,
        opnd: usize,
        reg_ptr: Reg,
        reg_tmp: Reg,
        mut adjust: i32,
        write: bool,
        pred: Option<Pred>,
    ) -> i32 {
        let instr = &bb.instrs[idx];
        let key = MemRefKey { instr: idx, opnd };
        let skip = cb.new_label();
        let mut reg_third = None;
        let filtered = self.filters.is_some();
        if let Some(filters) = &self.filters {
            reg_third = Some(filter::emit_probe(
                cb,
                &filters.dcache,
                TLS_SLOT_DCACHE,
                reg_ptr,
                reg_tmp,
                ProbeTarget::Mem(key),
                skip,
                pred,
            ));
            cb.emit(Op::ReadTls(reg_ptr, TLS_SLOT_BUF_PTR));
        }
        // When filtered, the probe's skip-branch already covers the
        // predicate.
        let inner_pred = if filtered { None } else { pred };
        adjust = self
            .encoder
            .instrument_memref(cb, reg_ptr, reg_tmp, adjust, instr, key, write, inner_pred);
        if filtered && adjust != 0 {
            self.update_buf_ptr(cb, reg_ptr, None, adjust);
            adjust = 0;
        }
        cb.bind(skip);
        if let Some(reg) = reg_third {
            cb.unreserve_scratch(reg);
        }
        adjust
    }

    fn update_buf_ptr(&self, cb: &mut CodeBlock, reg_ptr: Reg, pred: Option<Pred>, adjust: i32) {
        if adjust == 0 {
            return;
        }
        match pred {
            Some(pred) if !self.arch.predication => {
                let skip = cb.new_label();
                cb.emit(Op::JumpIfPredFalse(pred, skip));
                cb.emit(Op::AddImm(reg_ptr, adjust as i64));
                cb.emit(Op::WriteTls(TLS_SLOT_BUF_PTR, reg_ptr));
                cb.bind(skip);
            }
            Some(pred) => {
                let mark = cb.mark();
                cb.emit(Op::AddImm(reg_ptr, adjust as i64));
                cb.emit(Op::WriteTls(TLS_SLOT_BUF_PTR, reg_ptr));
                cb.tag_pred_since(mark, pred);
            }
            None => {
                cb.emit(Op::AddImm(reg_ptr, adjust as i64));
                cb.emit(Op::WriteTls(TLS_SLOT_BUF_PTR, reg_ptr));
            }
        }
    }

    /// At the end of every block: `tmp := *buf_ptr; branch-if-zero skip;
    /// call flush; skip:`.  Rests on the invariant that the byte after the
    /// last record is zero in the payload and non-zero in the redzone.
    fn emit_fullness_check(&self, cb: &mut CodeBlock, reg_ptr: Reg, reg_tmp: Reg) {
        let skip = cb.new_label();
        if !self.arch.branch_if_zero {
            cb.emit(Op::SaveFlags(reg_tmp));
        }
        cb.emit(Op::Load(reg_ptr, reg_ptr, 0));
        cb.emit(Op::JumpIfZero(reg_ptr, skip));
        cb.emit(Op::CleanCall);
        cb.bind(skip);
        if !self.arch.branch_if_zero {
            cb.emit(Op::RestoreFlags(reg_tmp));
        }
    }
}

/// Convenience constructors for host-side block descriptions; shared by the
/// tests and any embedding host that synthesizes blocks.
impl Instr {
    pub fn plain(pc: u64, length: u16) -> Self {
        Instr {
            pc,
            length,
            kind: InstrKind::Regular,
            is_app: true,
            mem_ops: Vec::new(),
            predicate: None,
            is_exclusive_store: false,
            writes_own_base: false,
        }
    }

    pub fn load(pc: u64, length: u16, size: u16) -> Self {
        let mut instr = Instr::plain(pc, length);
        instr.mem_ops.push(MemOperand {
            size,
            is_store: false,
            is_prefetch: false,
        });
        instr
    }

    pub fn store(pc: u64, length: u16, size: u16) -> Self {
        let mut instr = Instr::plain(pc, length);
        instr.mem_ops.push(MemOperand {
            size,
            is_store: true,
            is_prefetch: false,
        });
        instr
    }
}
