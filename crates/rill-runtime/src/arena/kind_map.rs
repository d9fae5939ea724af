//! Kind Map - O(1) classification of arbitrary addresses
//!
//! The collector and interner must classify reference slots without
//! touching the pointee: is this address obstack memory, interned-heap
//! memory, a large object, or something we don't manage at all?
//!
//! The map is a two-level table indexed by the high bits of the address:
//! level 1 covers 1 GiB regions, level 2 covers 4 KiB granules within a
//! region. Level-2 pages are allocated lazily the first time a granule
//! inside their region is tagged, so untouched address space costs one
//! null pointer.

use std::sync::atomic::{AtomicPtr, AtomicU8, Ordering};

/// Classification of a memory address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MemoryKind {
    /// Not managed by the runtime.
    Unknown = 0,
    /// Obstack chunk memory.
    Obstack = 1,
    /// Interned-object heap.
    IObj = 2,
    /// Large or pinned object storage.
    Large = 3,
}

impl MemoryKind {
    fn from_u8(value: u8) -> MemoryKind {
        match value {
            1 => MemoryKind::Obstack,
            2 => MemoryKind::IObj,
            3 => MemoryKind::Large,
            _ => MemoryKind::Unknown,
        }
    }
}

/// Granule size: one kind byte per 4 KiB page.
pub const GRANULE_SIZE: usize = 4096;
const GRANULE_SHIFT: u32 = 12;

/// Level-1 region size: 1 GiB.
const REGION_SHIFT: u32 = 30;
const GRANULES_PER_REGION: usize = 1 << (REGION_SHIFT - GRANULE_SHIFT);

/// Level-1 table covers the canonical 47-bit user address space.
const REGION_COUNT: usize = 1 << (47 - REGION_SHIFT);

struct KindPage {
    granules: [AtomicU8; GRANULES_PER_REGION],
}

impl KindPage {
    fn new() -> Box<KindPage> {
        // AtomicU8 is zero-initializable and zero means Unknown.
        let layout = std::alloc::Layout::new::<KindPage>();
        unsafe {
            let raw = std::alloc::alloc_zeroed(layout);
            if raw.is_null() {
                std::alloc::handle_alloc_error(layout);
            }
            Box::from_raw(raw as *mut KindPage)
        }
    }
}

/// Two-level address-to-kind table.
pub struct KindMap {
    regions: Box<[AtomicPtr<KindPage>]>,
}

impl KindMap {
    pub fn new() -> Self {
        let mut regions = Vec::with_capacity(REGION_COUNT);
        regions.resize_with(REGION_COUNT, || AtomicPtr::new(std::ptr::null_mut()));
        Self {
            regions: regions.into_boxed_slice(),
        }
    }

    /// Classify one address.
    #[inline]
    pub fn kind_of(&self, addr: usize) -> MemoryKind {
        let region = addr >> REGION_SHIFT;
        if region >= REGION_COUNT {
            return MemoryKind::Unknown;
        }
        let page = self.regions[region].load(Ordering::Acquire);
        if page.is_null() {
            return MemoryKind::Unknown;
        }
        let granule = (addr >> GRANULE_SHIFT) & (GRANULES_PER_REGION - 1);
        let value = unsafe { (*page).granules[granule].load(Ordering::Relaxed) };
        MemoryKind::from_u8(value)
    }

    /// Tag the granules covering `[addr, addr + len)`.
    ///
    /// `addr` and `len` must be granule-aligned.
    pub fn set_memory_kind(&self, addr: usize, len: usize, kind: MemoryKind) {
        debug_assert_eq!(addr % GRANULE_SIZE, 0);
        debug_assert_eq!(len % GRANULE_SIZE, 0);

        let mut granule_addr = addr;
        let end = addr + len;
        while granule_addr < end {
            let region = granule_addr >> REGION_SHIFT;
            assert!(region < REGION_COUNT, "address outside mappable space");
            let page = self.page_for(region);
            let granule = (granule_addr >> GRANULE_SHIFT) & (GRANULES_PER_REGION - 1);
            unsafe { (*page).granules[granule].store(kind as u8, Ordering::Relaxed) };
            granule_addr += GRANULE_SIZE;
        }
    }

    fn page_for(&self, region: usize) -> *mut KindPage {
        let slot = &self.regions[region];
        let existing = slot.load(Ordering::Acquire);
        if !existing.is_null() {
            return existing;
        }
        let fresh = Box::into_raw(KindPage::new());
        match slot.compare_exchange(
            std::ptr::null_mut(),
            fresh,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => fresh,
            Err(winner) => {
                // Lost the race; discard ours.
                unsafe { drop(Box::from_raw(fresh)) };
                winner
            }
        }
    }
}

impl Drop for KindMap {
    fn drop(&mut self) {
        for slot in self.regions.iter() {
            let page = slot.load(Ordering::Relaxed);
            if !page.is_null() {
                unsafe { drop(Box::from_raw(page)) };
            }
        }
    }
}
