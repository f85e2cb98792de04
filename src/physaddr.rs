//! Virtual-to-physical address translation via the kernel page map.
//!
//! The page map is opened once at init; each translation is one positioned
//! read.  Translation failure (kernel pages, wild accesses to unmapped
//! addresses) is reported as 0 and the caller keeps the virtual address.

use std::fs::File;
use std::os::unix::fs::FileExt;

use anyhow::{Context, Result};

const PAGEMAP_PATH: &str = "/proc/self/pagemap";

/// Bit 63 of a pagemap entry: page present in memory.
const PAGEMAP_PRESENT: u64 = 1 << 63;
/// Bits 0-54: page frame number.
const PAGEMAP_PFN_MASK: u64 = (1 << 55) - 1;

pub struct PhysAddr {
    pagemap: File,
    page_shift: u32,
}

impl PhysAddr {
    /// Open the page-map view.  Fails without the needed privileges, in
    /// which case the caller falls back to virtual addresses.
    pub fn init() -> Result<Self> {
        let pagemap = File::open(PAGEMAP_PATH)
            .with_context(|| format!("Failed to open {PAGEMAP_PATH}"))?;
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let page_size = if page_size > 0 { page_size as u64 } else { 4096 };
        Ok(PhysAddr {
            pagemap,
            page_shift: page_size.trailing_zeros(),
        })
    }

    /// Translate a virtual address; 0 signals failure.
    pub fn virtual2physical(&self, virt: u64) -> u64 {
        let offset = (virt >> self.page_shift) * 8;
        let mut raw = [0u8; 8];
        if self.pagemap.read_exact_at(&mut raw, offset).is_err() {
            return 0;
        }
        let entry = u64::from_ne_bytes(raw);
        if entry & PAGEMAP_PRESENT == 0 {
            return 0;
        }
        let pfn = entry & PAGEMAP_PFN_MASK;
        if pfn == 0 {
            // PFNs are zeroed for unprivileged readers.
            return 0;
        }
        let page_mask = (1u64 << self.page_shift) - 1;
        (pfn << self.page_shift) | (virt & page_mask)
    }
}
