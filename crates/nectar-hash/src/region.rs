//! The in-memory image of the table: one anonymous private mapping exposing
//! raw-byte and cell views of the same storage.
//!
//! The region, not the backing file, is the authoritative copy between
//! flushes. Access discipline (enforced by the callers in `table`):
//!
//! - cell reads and writes hold the bucket mutex;
//! - whole-extent loads hold that extent's fetch lock while the extent is
//!   still missing, so no cell access can race them;
//! - whole-extent *copies* for writeback intentionally run without the
//!   bucket mutex. A racing cell write may be observed torn in the copy;
//!   the race also re-dirties the extent, so a coherent image follows, and
//!   a torn image that survives a crash is zeroed by the startup verifier.

use std::io;
use std::ptr;
use std::slice;

use memmap2::{MmapMut, MmapOptions};
use tracing::debug;

use crate::layout::{Cell, CELL_BYTES};

pub(crate) struct Region {
    map: MmapMut,
    base: *mut u8,
    len: usize,
}

// All mutation goes through the raw pointer under the locking discipline
// above; the MmapMut itself is only held to keep the mapping alive and for
// mlock/madvise calls.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Map `len` zeroed bytes. Zero bytes mean "every cell empty", which is
    /// exactly the state of a never-written extent.
    pub fn anonymous(len: usize) -> io::Result<Self> {
        assert!(len > 0);
        let mut map = MmapOptions::new().len(len).map_anon()?;

        #[cfg(target_os = "linux")]
        {
            use memmap2::Advice;
            // Multi-GiB tables want huge pages; neither hint is load-bearing
            if let Err(e) = map.advise(Advice::HugePage) {
                debug!(error = %e, "madvise(HUGEPAGE) not honored");
            }
            if let Err(e) = map.advise(Advice::DontFork) {
                debug!(error = %e, "madvise(DONTFORK) not honored");
            }
        }

        let base = map.as_mut_ptr();
        // Page alignment implies cell alignment
        assert_eq!(base as usize % std::mem::align_of::<Cell>(), 0);
        Ok(Self { map, base, len })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Pin the whole region in physical memory. Best-effort; the caller
    /// logs and continues on failure.
    pub fn mlock(&self) -> io::Result<()> {
        self.map.lock()
    }

    #[inline]
    fn check(&self, offset: usize, len: usize) {
        let end = offset.checked_add(len).expect("region range overflow");
        assert!(end <= self.len, "region range {offset}+{len} out of bounds");
    }

    /// Copy bytes out of the region. May observe torn concurrent cell
    /// writes; see the module docs.
    pub fn read_into(&self, offset: usize, dst: &mut [u8]) {
        self.check(offset, dst.len());
        unsafe {
            ptr::copy_nonoverlapping(self.base.add(offset), dst.as_mut_ptr(), dst.len());
        }
    }

    /// Raw byte view of a range, for loading an extent from the backing
    /// file.
    ///
    /// # Safety
    ///
    /// The caller must hold the fetch lock for the extent covering
    /// `[offset, offset + len)` while that extent is still marked missing,
    /// so no other thread reads or writes the range.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn bytes_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        self.check(offset, len);
        slice::from_raw_parts_mut(self.base.add(offset), len)
    }

    /// Cell view of a bucket.
    ///
    /// # Safety
    ///
    /// The caller must hold the bucket mutex.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn cells_mut(&self, offset: usize, count: usize) -> &mut [Cell] {
        self.check(offset, count * CELL_BYTES);
        debug_assert_eq!(offset % CELL_BYTES, 0);
        slice::from_raw_parts_mut(self.base.add(offset) as *mut Cell, count)
    }
}
