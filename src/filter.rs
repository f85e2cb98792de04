//! The inline "L0" filter: per-thread direct-mapped tag arrays consulted by
//! generated code to suppress records for recently-seen cache lines.
//!
//! One array filters instruction fetches, one filters data references.  A
//! slot holds the line tag (`addr >> log2(line_size)`); direct-mapped
//! overwrite on miss is the only replacement policy.  References that
//! straddle a line boundary are treated as touching only the first line.

use crate::codegen::{CodeBlock, Label, MemRefKey, Op, Pred, Reg};
use crate::fatal;

/// Geometry of one tag array, derived from the configured cache and line
/// sizes (both powers of two).
#[derive(Debug, Clone, Copy)]
pub struct FilterGeometry {
    pub line_bits: u32,
    pub mask: u64,
    pub entries: usize,
}

impl FilterGeometry {
    pub fn new(cache_size: u64, line_size: u64) -> Self {
        debug_assert!(cache_size.is_power_of_two() && line_size.is_power_of_two());
        let entries = (cache_size / line_size) as usize;
        FilterGeometry {
            line_bits: line_size.trailing_zeros(),
            mask: entries as u64 - 1,
            entries,
        }
    }

    pub fn line_index(&self, addr: u64) -> u64 {
        (addr >> self.line_bits) & self.mask
    }
}

/// One zero-initialized tag array.  Generated code indexes it through a raw
/// TLS slot; the array just has to stay put for the thread's lifetime.
pub struct TagArray {
    tags: Box<[u64]>,
}

impl TagArray {
    pub fn new(geom: &FilterGeometry) -> Self {
        TagArray {
            tags: vec![0u64; geom.entries].into_boxed_slice(),
        }
    }

    pub fn base(&self) -> u64 {
        self.tags.as_ptr() as u64
    }

    /// Software model of the generated probe: true on hit, and installs the
    /// tag on miss.  The emitted code and this model must agree.
    pub fn probe(&mut self, geom: &FilterGeometry, addr: u64) -> bool {
        let tag = addr >> geom.line_bits;
        let idx = (tag & geom.mask) as usize;
        if self.tags[idx] == tag {
            true
        } else {
            self.tags[idx] = tag;
            false
        }
    }
}

/// What the probe tags: an instruction fetch at a known PC, or a memory
/// operand whose address the host materializes at run time.
#[derive(Debug, Clone, Copy)]
pub enum ProbeTarget {
    Pc(u64),
    Mem(MemRefKey),
}

/// Emit the inline filter probe.  On a hit control transfers to `skip`,
/// suppressing the caller's record emission; on a miss the tag is installed
/// and control falls through.
///
/// Clobbers `reg_ptr` (the caller reloads the buffer pointer afterwards)
/// and `reg_addr`.  Reserves and returns a third scratch register that the
/// caller must unreserve *after* binding `skip`, for parity on all paths.
pub fn emit_probe(
    cb: &mut CodeBlock,
    geom: &FilterGeometry,
    tls_slot: usize,
    reg_ptr: Reg,
    reg_addr: Reg,
    target: ProbeTarget,
    skip: Label,
    pred: Option<Pred>,
) -> Reg {
    let Some(reg_idx) = cb.reserve_scratch(false) else {
        fatal("failed to reserve filter scratch register");
    };
    // A conditional branch sits inside the probe, so even hosts with
    // general predication get a skip-branch rather than predicate tags.
    if let Some(pred) = pred {
        cb.emit(Op::JumpIfPredFalse(pred, skip));
    }
    match target {
        ProbeTarget::Pc(pc) => cb.emit(Op::MovImm(reg_addr, pc)),
        ProbeTarget::Mem(key) => cb.emit(Op::ObtainAddr(reg_addr, key)),
    }
    // reg_addr := line tag; clobbered rather than spending a fourth scratch,
    // the caller recomputes the app address on the miss path.
    cb.emit(Op::ShrImm(reg_addr, geom.line_bits));
    cb.emit(Op::Mov(reg_idx, reg_addr));
    cb.emit(Op::AndImm(reg_idx, geom.mask));
    cb.emit(Op::ReadTls(reg_ptr, tls_slot));
    cb.emit(Op::AddShl(reg_ptr, reg_idx, 3));
    cb.emit(Op::Load(reg_idx, reg_ptr, 0));
    cb.emit(Op::JumpIfEq(reg_idx, reg_addr, skip));
    cb.emit(Op::Store(reg_ptr, 0, reg_addr));
    reg_idx
}
