//! Fixed-width trace record layout.
//!
//! Every record in the stream is one [`RawEntry`]: a `(type, size, addr)`
//! tuple at a fixed byte width.  The flush engine and the offline
//! post-processor both inspect records in place, so the layout is
//! `#[repr(C)]` and viewable through [`plain`].

use plain::Plain;

/// One trace record as it sits in a buffer or on the wire.
///
/// `addr` holds the referenced virtual (or translated physical) address for
/// memory records, the instruction PC for fetch records, packed instruction
/// lengths for bundles, and the thread/process id for lifecycle records.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RawEntry {
    pub typ: u16,
    pub size: u16,
    pub addr: u64,
}

unsafe impl Plain for RawEntry {}

/// Byte width of one record.  Generated code stores record fields at these
/// fixed offsets relative to the write pointer.
pub const ENTRY_SIZE: usize = std::mem::size_of::<RawEntry>();

/// Field offsets inside a [`RawEntry`], used by emitted stores.
pub const ENTRY_TYPE_OFFS: i32 = 0;
pub const ENTRY_SIZE_OFFS: i32 = 2;
pub const ENTRY_ADDR_OFFS: i32 = 8;

/// Maximum instruction lengths packed into one bundle record: one length per
/// byte of the `addr` field.
pub const BUNDLE_MAX: usize = 8;

/// Record types on the wire.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    /// Leading record of an offline thread file; `addr` carries the tid.
    ThreadHeader = 0,
    /// Thread id registration, also the unit header of every flush.
    Thread = 1,
    /// Process id registration.
    Pid = 2,
    /// Final record a thread contributes.
    ThreadExit = 3,
    Load = 4,
    Store = 5,
    Prefetch = 6,
    Instr = 7,
    InstrDirectJump = 8,
    InstrIndirectJump = 9,
    InstrConditionalJump = 10,
    InstrDirectCall = 11,
    InstrIndirectCall = 12,
    InstrReturn = 13,
    /// Packed run of simple instructions; `size` counts them and each byte
    /// of `addr` holds one instruction length.
    InstrBundle = 14,
    /// Instruction-cache flush of a virtual range.
    InstrFlush = 15,
}

impl RecordType {
    pub fn from_u16(raw: u16) -> Option<RecordType> {
        use RecordType::*;
        Some(match raw {
            0 => ThreadHeader,
            1 => Thread,
            2 => Pid,
            3 => ThreadExit,
            4 => Load,
            5 => Store,
            6 => Prefetch,
            7 => Instr,
            8 => InstrDirectJump,
            9 => InstrIndirectJump,
            10 => InstrConditionalJump,
            11 => InstrDirectCall,
            12 => InstrIndirectCall,
            13 => InstrReturn,
            14 => InstrBundle,
            15 => InstrFlush,
            _ => return None,
        })
    }

    /// Instruction-fetch records: the only legal boundaries for splitting an
    /// online flush unit into atomic pipe writes.
    pub fn is_instr_fetch(self) -> bool {
        use RecordType::*;
        matches!(
            self,
            Instr | InstrDirectJump
                | InstrIndirectJump
                | InstrConditionalJump
                | InstrDirectCall
                | InstrIndirectCall
                | InstrReturn
        )
    }

    /// Lifecycle records whose `addr` is an id, never translated.
    pub fn is_lifecycle(self) -> bool {
        use RecordType::*;
        matches!(self, ThreadHeader | Thread | Pid | ThreadExit)
    }
}

/// Serialize `entry` into the first [`ENTRY_SIZE`] bytes of `buf`.
/// Returns the bytes written.  Padding bytes are zeroed, preserving the
/// buffer invariant that unwritten payload bytes stay zero.
pub fn write_entry(buf: &mut [u8], entry: RawEntry) -> usize {
    buf[0..2].copy_from_slice(&entry.typ.to_ne_bytes());
    buf[2..4].copy_from_slice(&entry.size.to_ne_bytes());
    buf[4..8].fill(0);
    buf[8..16].copy_from_slice(&entry.addr.to_ne_bytes());
    ENTRY_SIZE
}

/// View the record at the start of `buf`.
pub fn read_entry(buf: &[u8]) -> RawEntry {
    let mut entry = RawEntry::default();
    plain::copy_from_bytes(&mut entry, &buf[..ENTRY_SIZE]).expect("entry size");
    entry
}

pub fn get_entry_type(buf: &[u8]) -> Option<RecordType> {
    RecordType::from_u16(read_entry(buf).typ)
}

pub fn get_entry_size(buf: &[u8]) -> u16 {
    read_entry(buf).size
}

pub fn get_entry_addr(buf: &[u8]) -> u64 {
    read_entry(buf).addr
}

/// Rewrite the address field of the record at the start of `buf` in place.
pub fn set_entry_addr(buf: &mut [u8], addr: u64) {
    buf[ENTRY_ADDR_OFFS as usize..ENTRY_SIZE].copy_from_slice(&addr.to_ne_bytes());
}
