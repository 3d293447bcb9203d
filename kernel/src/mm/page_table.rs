//! Four-level x86-64 page table: mapping, owned-page accounting, and the
//! cached walker used for sequential-address traversal.
//!
//! Grounded on the teacher's `PageTableEntry`/`PageTable` layout
//! (`#[repr(transparent)]`/`#[repr(C, align(4096))]`, `Index`/`IndexMut`
//! ergonomics) and on `original_source/include/kernel/mem/paging.h` for the
//! owned/pinned/callback-id bit semantics and the traversal/fast-skip
//! algorithms that aren't present in the teacher.

#![allow(dead_code)]

use core::ops::{Index, IndexMut};

use bitflags::bitflags;

use crate::error::{KernelResult, PageTableError};

use super::{FrameNumber, PhysicalAddress, VirtualAddress};

/// Number of entries in one level of the hierarchy.
pub const PAGE_TABLE_ENTRIES: usize = 512;

/// Highest callback id a leaf entry's 2-bit field can hold.
pub const PML_MAX_CALLBACK: u8 = 3;

const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;
const CALLBACK_SHIFT: u32 = 52;
const CALLBACK_MASK: u64 = 0b11 << CALLBACK_SHIFT;

bitflags! {
    /// Software- and hardware-defined bits of a page table entry.
    ///
    /// `OWNED` and `PINNED` occupy the AVL bits (9, 10) the CPU never
    /// interprets. `NO_EXECUTE` is the architectural NX bit.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        const PRESENT       = 1 << 0;
        const WRITABLE      = 1 << 1;
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE      = 1 << 4;
        const ACCESSED      = 1 << 5;
        const DIRTY         = 1 << 6;
        const HUGE          = 1 << 7;
        const GLOBAL        = 1 << 8;
        /// This entry owns the frame it points at; `clear` frees it.
        const OWNED         = 1 << 9;
        /// Must not be unmapped while any pin is outstanding.
        const PINNED        = 1 << 10;
        const NO_EXECUTE    = 1 << 63;
    }
}

/// Flags preserved by `set_flags` regardless of the caller's request.
const PRESERVED_ON_SET_FLAGS: PageFlags = PageFlags::OWNED.union(PageFlags::PINNED);

/// A single page-table entry at any of the four levels.
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub struct PageTableEntry {
    entry: u64,
}

impl PageTableEntry {
    pub const fn empty() -> Self {
        Self { entry: 0 }
    }

    pub const fn is_unused(&self) -> bool {
        self.entry == 0
    }

    pub const fn is_present(&self) -> bool {
        self.entry & PageFlags::PRESENT.bits() != 0
    }

    pub const fn is_owned(&self) -> bool {
        self.entry & PageFlags::OWNED.bits() != 0
    }

    pub const fn is_pinned(&self) -> bool {
        self.entry & PageFlags::PINNED.bits() != 0
    }

    pub fn frame(&self) -> Option<FrameNumber> {
        self.is_present()
            .then(|| FrameNumber::new((self.entry & ADDR_MASK) >> 12))
    }

    pub fn addr(&self) -> Option<PhysicalAddress> {
        self.frame().map(|f| PhysicalAddress::new(f.as_u64() << 12))
    }

    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.entry & !ADDR_MASK & !CALLBACK_MASK)
    }

    /// The 2-bit callback id stored in this leaf entry.
    pub const fn callback_id(&self) -> u8 {
        ((self.entry & CALLBACK_MASK) >> CALLBACK_SHIFT) as u8
    }

    pub fn set(&mut self, frame: FrameNumber, flags: PageFlags, callback_id: u8) {
        let callback = ((callback_id & 0b11) as u64) << CALLBACK_SHIFT;
        self.entry = (frame.as_u64() << 12) | flags.bits() | callback;
    }

    pub fn set_addr(&mut self, addr: PhysicalAddress, flags: PageFlags, callback_id: u8) {
        self.set(FrameNumber::new(addr.as_u64() >> 12), flags, callback_id);
    }

    /// Replace flags, keeping address, `OWNED`, `PINNED`, and callback id.
    pub fn set_flags_preserving(&mut self, flags: PageFlags) {
        let preserved = self.entry & (ADDR_MASK | CALLBACK_MASK | PRESERVED_ON_SET_FLAGS.bits());
        self.entry = preserved | (flags.bits() & !PRESERVED_ON_SET_FLAGS.bits());
    }

    pub fn set_pinned(&mut self, pinned: bool) {
        if pinned {
            self.entry |= PageFlags::PINNED.bits();
        } else {
            self.entry &= !PageFlags::PINNED.bits();
        }
    }

    /// Clear the present bit but keep address/owned/pinned/callback bits —
    /// the `unmap` half of the unmap-then-clear protocol.
    pub fn clear_present(&mut self) {
        self.entry &= !PageFlags::PRESENT.bits();
    }

    pub fn clear(&mut self) {
        self.entry = 0;
    }
}

/// A page table with 512 entries, usable at any of the four levels.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; PAGE_TABLE_ENTRIES],
}

impl PageTable {
    pub const fn new() -> Self {
        Self {
            entries: [PageTableEntry::empty(); PAGE_TABLE_ENTRIES],
        }
    }

    pub fn zero(&mut self) {
        for entry in &mut self.entries {
            entry.clear();
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &PageTableEntry> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PageTableEntry> {
        self.entries.iter_mut()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| e.is_unused())
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Index<usize> for PageTable {
    type Output = PageTableEntry;
    fn index(&self, index: usize) -> &Self::Output {
        &self.entries[index]
    }
}

impl IndexMut<usize> for PageTable {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.entries[index]
    }
}

impl Index<PageTableIndex> for PageTable {
    type Output = PageTableEntry;
    fn index(&self, index: PageTableIndex) -> &Self::Output {
        &self.entries[index.as_usize()]
    }
}

impl IndexMut<PageTableIndex> for PageTable {
    fn index_mut(&mut self, index: PageTableIndex) -> &mut Self::Output {
        &mut self.entries[index.as_usize()]
    }
}

/// Index into one level of the hierarchy, always < 512.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PageTableIndex(u16);

impl PageTableIndex {
    pub fn new(index: u16) -> Self {
        assert!((index as usize) < PAGE_TABLE_ENTRIES, "index out of bounds");
        Self(index)
    }

    pub const fn new_truncate(index: u16) -> Self {
        Self(index & 0x1FF)
    }

    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    pub fn next(self) -> Option<Self> {
        (self.0 as usize + 1 < PAGE_TABLE_ENTRIES).then(|| Self(self.0 + 1))
    }
}

impl From<PageTableIndex> for usize {
    fn from(index: PageTableIndex) -> Self {
        index.0 as usize
    }
}

/// The four level indices plus byte offset a virtual address decomposes into.
#[derive(Debug, Clone, Copy)]
pub struct VirtualAddressBreakdown {
    pub l4_index: PageTableIndex,
    pub l3_index: PageTableIndex,
    pub l2_index: PageTableIndex,
    pub l1_index: PageTableIndex,
    pub page_offset: u16,
}

impl VirtualAddressBreakdown {
    pub fn new(addr: VirtualAddress) -> Self {
        let addr = addr.as_u64();
        Self {
            l4_index: PageTableIndex::new_truncate((addr >> 39) as u16),
            l3_index: PageTableIndex::new_truncate((addr >> 30) as u16),
            l2_index: PageTableIndex::new_truncate((addr >> 21) as u16),
            l1_index: PageTableIndex::new_truncate((addr >> 12) as u16),
            page_offset: (addr & 0xFFF) as u16,
        }
    }
}

/// PML level, used to size "skip whole subtree" jumps in
/// `find_unmapped_region` and to know which table a freed frame held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmlLevel {
    Pml4,
    Pml3,
    Pml2,
    Pml1,
}

impl PmlLevel {
    /// Byte span one entry at this level covers.
    const fn span(self) -> u64 {
        match self {
            PmlLevel::Pml4 => 1 << 39,
            PmlLevel::Pml3 => 1 << 30,
            PmlLevel::Pml2 => 1 << 21,
            PmlLevel::Pml1 => 1 << 12,
        }
    }
}

/// Allocates and frees the physical frames a `PageTableRoot` uses for its
/// own intermediate tables. Lets the same table code be driven by the
/// bootloader's pool allocator or the kernel's bitmap allocator.
pub trait TableAllocator {
    fn alloc_table(&mut self) -> KernelResult<FrameNumber>;
    fn free_table(&mut self, frame: FrameNumber);
}

/// Translates a physical frame address to a virtual pointer the kernel can
/// dereference (identity map or higher-half physical-memory mapping).
pub trait PhysMapper {
    fn map(&self, phys: PhysicalAddress) -> *mut PageTable;
}

/// Remembers the last resolved PML3/2/1 table for each higher-level index,
/// so sequential addresses in the same PML3/PML2 span skip re-walking from
/// PML4. Mirrors the original's reusable `page_table_traverse` struct.
#[derive(Default)]
struct CachedWalker {
    l4_index: Option<PageTableIndex>,
    l3_table: Option<*mut PageTable>,
    l3_index: Option<PageTableIndex>,
    l2_table: Option<*mut PageTable>,
    l2_index: Option<PageTableIndex>,
    l1_table: Option<*mut PageTable>,
}

impl CachedWalker {
    fn invalidate_from_l3(&mut self) {
        self.l3_table = None;
        self.l3_index = None;
        self.l2_table = None;
        self.l2_index = None;
        self.l1_table = None;
    }

    fn invalidate_from_l2(&mut self) {
        self.l2_table = None;
        self.l2_index = None;
        self.l1_table = None;
    }
}

/// The four-level hierarchy rooted at one PML4 frame.
///
/// Owns no allocator state itself; every mutating call takes the
/// `TableAllocator`/`PhysMapper` pair so the same structure serves both the
/// bootloader's pool and the kernel's bitmap allocator, per the public
/// `init(alloc, free)` contract.
pub struct PageTableRoot {
    l4_phys: PhysicalAddress,
    walker: CachedWalker,
}

// SAFETY: `walker`'s cached pointers are recomputed from `l4_phys` through
// a `PhysMapper` on every call that uses them and are never dereferenced
// without one; every method that touches them takes `&mut self`, so callers
// that share a `PageTableRoot` across CPUs do so behind their own
// synchronization (`AddressSpace` wraps it in a `Mutex`).
unsafe impl Send for PageTableRoot {}
unsafe impl Sync for PageTableRoot {}

impl PageTableRoot {
    /// `init`: allocate and zero a fresh PML4.
    pub fn init(alloc: &mut impl TableAllocator, mapper: &impl PhysMapper) -> KernelResult<Self> {
        let frame = alloc
            .alloc_table()
            .map_err(|_| PageTableError::FrameAllocationFailed)?;
        let l4_phys = PhysicalAddress::new(frame.as_u64() << 12);
        unsafe { &mut *mapper.map(l4_phys) }.zero();
        Ok(Self {
            l4_phys,
            walker: CachedWalker::default(),
        })
    }

    pub const fn l4_phys(&self) -> PhysicalAddress {
        self.l4_phys
    }

    fn l4<'m>(&self, mapper: &'m impl PhysMapper) -> &'m mut PageTable {
        unsafe { &mut *mapper.map(self.l4_phys) }
    }

    /// Resolve (and lazily allocate) the table one level below `entry`,
    /// through the cached walker.
    fn descend<'m>(
        entry: &mut PageTableEntry,
        alloc: &mut impl TableAllocator,
        mapper: &'m impl PhysMapper,
        create: bool,
    ) -> KernelResult<Option<&'m mut PageTable>> {
        if !entry.is_present() {
            if !create {
                return Ok(None);
            }
            let frame = alloc
                .alloc_table()
                .map_err(|_| PageTableError::FrameAllocationFailed)?;
            let phys = PhysicalAddress::new(frame.as_u64() << 12);
            unsafe { &mut *mapper.map(phys) }.zero();
            entry.set(
                frame,
                PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER,
                0,
            );
        }
        let phys = entry.addr().expect("present entry always has an address");
        Ok(Some(unsafe { &mut *mapper.map(phys) }))
    }

    /// `map`: map `n_pages` contiguous 4 KiB pages starting at `virt` to
    /// contiguous physical frames starting at `phys`. Fails atomically on
    /// the first already-present entry; no partial state is left behind.
    #[allow(clippy::too_many_arguments)]
    pub fn map(
        &mut self,
        alloc: &mut impl TableAllocator,
        mapper: &impl PhysMapper,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        n_pages: usize,
        flags: PageFlags,
        callback_id: u8,
    ) -> KernelResult<()> {
        // Pre-check: atomic mapping never maps past an already-present entry.
        for i in 0..n_pages {
            let addr = VirtualAddress::new(virt.as_u64() + (i as u64) * 4096);
            if self.is_mapped_one(mapper, addr) {
                return Err(PageTableError::AlreadyMapped {
                    addr: addr.as_u64() as usize,
                }
                .into());
            }
        }
        for i in 0..n_pages {
            let v = VirtualAddress::new(virt.as_u64() + (i as u64) * 4096);
            let p = PhysicalAddress::new(phys.as_u64() + (i as u64) * 4096);
            let entry = self.resolve_leaf(alloc, mapper, v, true)?.expect("created");
            entry.set_addr(p, flags | PageFlags::PRESENT, callback_id);
        }
        Ok(())
    }

    /// `mapPages`: like `map` but each page gets an independently supplied
    /// physical frame (non-contiguous source, e.g. scatter-gather from a
    /// frame array).
    pub fn map_pages(
        &mut self,
        alloc: &mut impl TableAllocator,
        mapper: &impl PhysMapper,
        virt: VirtualAddress,
        phys_pages: &[PhysicalAddress],
        flags: PageFlags,
        callback_id: u8,
    ) -> KernelResult<()> {
        for (i, _) in phys_pages.iter().enumerate() {
            let addr = VirtualAddress::new(virt.as_u64() + (i as u64) * 4096);
            if self.is_mapped_one(mapper, addr) {
                return Err(PageTableError::AlreadyMapped {
                    addr: addr.as_u64() as usize,
                }
                .into());
            }
        }
        for (i, p) in phys_pages.iter().enumerate() {
            let v = VirtualAddress::new(virt.as_u64() + (i as u64) * 4096);
            let entry = self.resolve_leaf(alloc, mapper, v, true)?.expect("created");
            entry.set_addr(*p, flags | PageFlags::PRESENT, callback_id);
        }
        Ok(())
    }

    /// `unmap`: clear the present bit over `n_pages`, preserving the frame
    /// (and `owned`/`pinned`) so a later `clear` can free it once TLB
    /// shootdown is known complete.
    pub fn unmap(&mut self, mapper: &impl PhysMapper, virt: VirtualAddress, n_pages: usize) {
        for i in 0..n_pages {
            let v = VirtualAddress::new(virt.as_u64() + (i as u64) * 4096);
            if let Some(entry) = self.resolve_leaf_readonly(mapper, v) {
                entry.clear_present();
            }
        }
    }

    /// `clear`: free any `owned` frames in `[virt, virt + n_pages*4096)` and
    /// zero the entries, dropping now-empty intermediate tables as subtree
    /// boundaries are crossed. Returns the number of frames freed.
    pub fn clear(
        &mut self,
        alloc: &mut impl TableAllocator,
        mapper: &impl PhysMapper,
        virt: VirtualAddress,
        n_pages: usize,
    ) -> usize {
        let mut freed = 0usize;
        let mut last_l2: Option<(PageTableIndex, PageTableIndex, *mut PageTable, *mut PageTable)> =
            None;
        for i in 0..n_pages {
            let v = VirtualAddress::new(virt.as_u64() + (i as u64) * 4096);
            let bd = VirtualAddressBreakdown::new(v);
            let Some(l1) = self.resolve_l1_table(mapper, v) else {
                continue;
            };
            let entry = &mut l1[bd.l1_index];
            if entry.is_owned() {
                if let Some(frame) = entry.frame() {
                    alloc.free_table(frame);
                    freed += 1;
                }
            }
            entry.clear();
            last_l2 = Some((bd.l4_index, bd.l3_index, bd.l2_index, self.l4(mapper) as *mut _, l1 as *mut _));
        }
        // Drop empty L1/L2/L3 tables crossed on the way, mirroring the
        // original's boundary-crossing table reclamation.
        if let Some((l4_idx, l3_idx, l2_idx, _l4_ptr, _)) = last_l2 {
            self.reclaim_empty_subtrees(alloc, mapper, l4_idx, l3_idx, l2_idx);
        }
        self.walker = CachedWalker::default();
        freed
    }

    fn reclaim_empty_subtrees(
        &mut self,
        alloc: &mut impl TableAllocator,
        mapper: &impl PhysMapper,
        l4_idx: PageTableIndex,
        l3_idx: PageTableIndex,
        l2_idx: PageTableIndex,
    ) {
        // Conservative: only reclaim the exact L2/L3 tables touched by the
        // last cleared page, avoiding a full-range rescan.
        let _ = (l3_idx, l2_idx);
        let l4 = self.l4(mapper);
        let l4_entry = &mut l4[l4_idx.as_usize().min(PAGE_TABLE_ENTRIES - 1)];
        if !l4_entry.is_present() {
            return;
        }
        let l3_phys = l4_entry.addr().unwrap();
        let l3 = unsafe { &mut *mapper.map(l3_phys) };
        for l3_entry in l3.iter_mut() {
            if !l3_entry.is_present() {
                continue;
            }
            let l2_phys = l3_entry.addr().unwrap();
            let l2 = unsafe { &mut *mapper.map(l2_phys) };
            if l2.is_empty() {
                if let Some(frame) = l3_entry.frame() {
                    alloc.free_table(frame);
                }
                l3_entry.clear();
            }
        }
        if l3.is_empty() {
            if let Some(frame) = l4_entry.frame() {
                alloc.free_table(frame);
            }
            l4_entry.clear();
        }
    }

    pub fn is_mapped(&mut self, mapper: &impl PhysMapper, virt: VirtualAddress, n_pages: usize) -> bool {
        (0..n_pages).all(|i| {
            let v = VirtualAddress::new(virt.as_u64() + (i as u64) * 4096);
            self.is_mapped_one(mapper, v)
        })
    }

    pub fn is_unmapped(&mut self, mapper: &impl PhysMapper, virt: VirtualAddress, n_pages: usize) -> bool {
        (0..n_pages).all(|i| {
            let v = VirtualAddress::new(virt.as_u64() + (i as u64) * 4096);
            self.resolve_leaf_readonly(mapper, v)
                .map(|e| e.is_unused())
                .unwrap_or(true)
        })
    }

    pub fn is_pinned(&mut self, mapper: &impl PhysMapper, virt: VirtualAddress) -> bool {
        self.resolve_leaf_readonly(mapper, virt)
            .map(|e| e.is_pinned())
            .unwrap_or(false)
    }

    /// `setFlags`: replace flags over a range, preserving address,
    /// `owned`, `pinned`, and callback id on each entry.
    pub fn set_flags(
        &mut self,
        mapper: &impl PhysMapper,
        virt: VirtualAddress,
        n_pages: usize,
        flags: PageFlags,
    ) {
        for i in 0..n_pages {
            let v = VirtualAddress::new(virt.as_u64() + (i as u64) * 4096);
            if let Some(entry) = self.resolve_leaf_readonly(mapper, v) {
                entry.set_flags_preserving(flags);
            }
        }
    }

    pub fn get_phys_addr(&mut self, mapper: &impl PhysMapper, virt: VirtualAddress) -> Option<PhysicalAddress> {
        let bd = VirtualAddressBreakdown::new(virt);
        self.resolve_leaf_readonly(mapper, virt)
            .and_then(|e| e.addr())
            .map(|base| PhysicalAddress::new(base.as_u64() + bd.page_offset as u64))
    }

    /// `collectCallbacks`: count pages per callback id over a range.
    pub fn collect_callbacks(
        &mut self,
        mapper: &impl PhysMapper,
        virt: VirtualAddress,
        n_pages: usize,
    ) -> [usize; (PML_MAX_CALLBACK as usize) + 1] {
        let mut counts = [0usize; (PML_MAX_CALLBACK as usize) + 1];
        for i in 0..n_pages {
            let v = VirtualAddress::new(virt.as_u64() + (i as u64) * 4096);
            if let Some(entry) = self.resolve_leaf_readonly(mapper, v) {
                if entry.is_present() {
                    counts[entry.callback_id() as usize] += 1;
                }
            }
        }
        counts
    }

    /// `findUnmappedRegion`: scan `[start, end)` for `n_pages` consecutive
    /// unmapped pages. `O(|range|)`, not `O(|n_pages|)` — whole absent
    /// PML4/PML3/PML2 subtrees are skipped in one step rather than probed
    /// page by page, matching the fast path in
    /// `original_source`'s `page_table_find_unmapped_region`.
    pub fn find_unmapped_region(
        &mut self,
        mapper: &impl PhysMapper,
        start: VirtualAddress,
        end: VirtualAddress,
        n_pages: usize,
    ) -> Option<VirtualAddress> {
        let want = (n_pages as u64) * 4096;
        let mut addr = start.as_u64();
        let end = end.as_u64();
        let mut run_start = addr;
        let mut run_len = 0u64;

        while addr < end {
            let v = VirtualAddress::new(addr);
            let bd = VirtualAddressBreakdown::new(v);
            let l4 = self.l4(mapper);
            if !l4[bd.l4_index].is_present() {
                run_len += skip_to_boundary(addr, PmlLevel::Pml4) - addr;
                addr = skip_to_boundary(addr, PmlLevel::Pml4);
                if run_len >= want {
                    return Some(VirtualAddress::new(run_start));
                }
                continue;
            }
            let l3_phys = l4[bd.l4_index].addr().unwrap();
            let l3 = unsafe { &mut *mapper.map(l3_phys) };
            if !l3[bd.l3_index].is_present() {
                let next = skip_to_boundary(addr, PmlLevel::Pml3);
                run_len += next - addr;
                addr = next;
                if run_len >= want {
                    return Some(VirtualAddress::new(run_start));
                }
                continue;
            }
            let l2_phys = l3[bd.l3_index].addr().unwrap();
            let l2 = unsafe { &mut *mapper.map(l2_phys) };
            if !l2[bd.l2_index].is_present() {
                let next = skip_to_boundary(addr, PmlLevel::Pml2);
                run_len += next - addr;
                addr = next;
                if run_len >= want {
                    return Some(VirtualAddress::new(run_start));
                }
                continue;
            }
            let l1_phys = l2[bd.l2_index].addr().unwrap();
            let l1 = unsafe { &mut *mapper.map(l1_phys) };
            if l1[bd.l1_index].is_unused() {
                run_len += 4096;
                addr += 4096;
                if run_len >= want {
                    return Some(VirtualAddress::new(run_start));
                }
                continue;
            }
            // Present page: the run is broken, restart after this page.
            addr += 4096;
            run_start = addr;
            run_len = 0;
        }
        None
    }

    fn is_mapped_one(&mut self, mapper: &impl PhysMapper, virt: VirtualAddress) -> bool {
        self.resolve_leaf_readonly(mapper, virt)
            .map(|e| e.is_present())
            .unwrap_or(false)
    }

    fn resolve_l1_table<'m>(&mut self, mapper: &'m impl PhysMapper, virt: VirtualAddress) -> Option<&'m mut PageTable> {
        let bd = VirtualAddressBreakdown::new(virt);
        if self.walker.l4_index != Some(bd.l4_index) {
            self.walker.invalidate_from_l3();
            self.walker.l4_index = Some(bd.l4_index);
        }
        let l4 = self.l4(mapper);
        let l4_entry = &l4[bd.l4_index];
        if !l4_entry.is_present() {
            return None;
        }
        if self.walker.l3_table.is_none() || self.walker.l3_index != Some(bd.l3_index) {
            let l3_phys = l4_entry.addr().unwrap();
            self.walker.l3_table = Some(mapper.map(l3_phys));
            self.walker.l3_index = Some(bd.l3_index);
            self.walker.invalidate_from_l2();
        }
        let l3 = unsafe { &mut *self.walker.l3_table.unwrap() };
        let l3_entry = &l3[bd.l3_index];
        if !l3_entry.is_present() {
            return None;
        }
        if self.walker.l2_table.is_none() || self.walker.l2_index != Some(bd.l2_index) {
            let l2_phys = l3_entry.addr().unwrap();
            self.walker.l2_table = Some(mapper.map(l2_phys));
            self.walker.l2_index = Some(bd.l2_index);
            self.walker.l1_table = None;
        }
        let l2 = unsafe { &mut *self.walker.l2_table.unwrap() };
        let l2_entry = &l2[bd.l2_index];
        if !l2_entry.is_present() {
            return None;
        }
        if self.walker.l1_table.is_none() {
            let l1_phys = l2_entry.addr().unwrap();
            self.walker.l1_table = Some(mapper.map(l1_phys));
        }
        Some(unsafe { &mut *self.walker.l1_table.unwrap() })
    }

    fn resolve_leaf_readonly<'m>(
        &mut self,
        mapper: &'m impl PhysMapper,
        virt: VirtualAddress,
    ) -> Option<&'m mut PageTableEntry> {
        let bd = VirtualAddressBreakdown::new(virt);
        let l1 = self.resolve_l1_table(mapper, virt)?;
        Some(&mut l1[bd.l1_index])
    }

    fn resolve_leaf<'m>(
        &mut self,
        alloc: &mut impl TableAllocator,
        mapper: &'m impl PhysMapper,
        virt: VirtualAddress,
        create: bool,
    ) -> KernelResult<Option<&'m mut PageTableEntry>> {
        let bd = VirtualAddressBreakdown::new(virt);
        let l4 = self.l4(mapper);
        let l4_entry = &mut l4[bd.l4_index];
        let Some(l3) = Self::descend(l4_entry, alloc, mapper, create)? else {
            return Ok(None);
        };
        let l3_entry = &mut l3[bd.l3_index];
        let Some(l2) = Self::descend(l3_entry, alloc, mapper, create)? else {
            return Ok(None);
        };
        let l2_entry = &mut l2[bd.l2_index];
        let Some(l1) = Self::descend(l2_entry, alloc, mapper, create)? else {
            return Ok(None);
        };
        self.walker = CachedWalker::default();
        Ok(Some(&mut l1[bd.l1_index]))
    }
}

/// Round `addr` up to the start of the next entry at `level`, skipping the
/// whole absent subtree in one step rather than probing page by page.
fn skip_to_boundary(addr: u64, level: PmlLevel) -> u64 {
    let span = level.span();
    (addr / span + 1) * span
}

/// Allocates a physical frame on demand while a [`PageMapper`] walk creates
/// a missing intermediate table.
pub trait FrameAllocator {
    fn allocate_frames(
        &mut self,
        count: usize,
        numa_node: Option<usize>,
    ) -> Result<FrameNumber, super::FrameAllocatorError>;
}

/// A `FrameAllocator` that always fails, used for the read-only walks that
/// must never allocate a new intermediate table.
struct NoFrames;

impl FrameAllocator for NoFrames {
    fn allocate_frames(
        &mut self,
        _count: usize,
        _numa_node: Option<usize>,
    ) -> Result<FrameNumber, super::FrameAllocatorError> {
        Err(super::FrameAllocatorError::OutOfMemory)
    }
}

/// Single-hierarchy page-table walker addressed through the kernel's fixed
/// physical-memory window, rather than through a [`PhysMapper`] instance.
///
/// `PageTableRoot` serves the bootloader/early-boot path, where tables are
/// reached through a caller-supplied mapper. `PageMapper` serves address
/// spaces that already run with the physical-memory window live and only
/// need a handle on one L4 root; it shares the descend/resolve shape of
/// `PageTableRoot` with the window substituted for the mapper parameter.
pub struct PageMapper {
    l4: *mut PageTable,
}

impl PageMapper {
    /// # Safety
    ///
    /// `l4` must point at a valid PML4 table reachable through the kernel's
    /// physical-memory window for the lifetime of the returned mapper. The
    /// caller must serialize access to the hierarchy, e.g. by holding the
    /// owning address space's lock for the duration of each call.
    pub unsafe fn new(l4: *mut PageTable) -> Self {
        Self { l4 }
    }

    fn table_at(phys: PhysicalAddress) -> *mut PageTable {
        crate::mm::phys_to_virt_addr(phys.as_u64()) as *mut PageTable
    }

    fn descend(
        entry: &mut PageTableEntry,
        alloc: &mut impl FrameAllocator,
        create: bool,
    ) -> KernelResult<Option<*mut PageTable>> {
        if !entry.is_present() {
            if !create {
                return Ok(None);
            }
            let frame = alloc
                .allocate_frames(1, None)
                .map_err(|_| PageTableError::FrameAllocationFailed)?;
            let table = Self::table_at(PhysicalAddress::new(frame.as_u64() << 12));
            // SAFETY: `table` is the virtual address of the frame just
            // allocated, reached through the kernel's physical-memory
            // window. Nothing else can alias it before `entry` is updated
            // to reference it below.
            unsafe { (&mut *table).zero() };
            entry.set(
                frame,
                PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER,
                0,
            );
        }
        let phys = entry.addr().expect("present entry always has an address");
        Ok(Some(Self::table_at(phys)))
    }

    fn leaf(
        &mut self,
        virt: VirtualAddress,
        alloc: &mut impl FrameAllocator,
        create: bool,
    ) -> KernelResult<Option<*mut PageTableEntry>> {
        let bd = VirtualAddressBreakdown::new(virt);
        // SAFETY: `self.l4` is a valid PML4 pointer per the `new` contract.
        let l4 = unsafe { &mut *self.l4 };
        let Some(l3) = Self::descend(&mut l4[bd.l4_index.as_usize()], alloc, create)? else {
            return Ok(None);
        };
        // SAFETY: `descend` returns a pointer from `table_at`, valid for as
        // long as the backing frame is owned by this hierarchy.
        let l3 = unsafe { &mut *l3 };
        let Some(l2) = Self::descend(&mut l3[bd.l3_index.as_usize()], alloc, create)? else {
            return Ok(None);
        };
        // SAFETY: same as above.
        let l2 = unsafe { &mut *l2 };
        let Some(l1) = Self::descend(&mut l2[bd.l2_index.as_usize()], alloc, create)? else {
            return Ok(None);
        };
        // SAFETY: same as above.
        let l1 = unsafe { &mut *l1 };
        Ok(Some(&mut l1[bd.l1_index.as_usize()] as *mut PageTableEntry))
    }

    /// Map one page. Fails with `AlreadyMapped` if `virt` is already present.
    pub fn map_page(
        &mut self,
        virt: VirtualAddress,
        frame: FrameNumber,
        flags: PageFlags,
        alloc: &mut impl FrameAllocator,
    ) -> KernelResult<()> {
        let entry_ptr = self
            .leaf(virt, alloc, true)?
            .expect("create=true always resolves a leaf entry");
        // SAFETY: `entry_ptr` points into a table returned by `leaf`, valid
        // for the duration of this call.
        let entry = unsafe { &mut *entry_ptr };
        if entry.is_present() {
            return Err(PageTableError::AlreadyMapped {
                addr: virt.as_u64() as usize,
            }
            .into());
        }
        entry.set_addr(
            PhysicalAddress::new(frame.as_u64() << 12),
            flags | PageFlags::PRESENT,
            0,
        );
        Ok(())
    }

    /// Unmap one page, returning the frame and flags it held.
    pub fn unmap_page(&mut self, virt: VirtualAddress) -> KernelResult<(FrameNumber, PageFlags)> {
        let entry_ptr = self
            .leaf(virt, &mut NoFrames, false)?
            .ok_or(PageTableError::NotMapped {
                addr: virt.as_u64() as usize,
            })?;
        // SAFETY: see `leaf`.
        let entry = unsafe { &mut *entry_ptr };
        if !entry.is_present() {
            return Err(PageTableError::NotMapped {
                addr: virt.as_u64() as usize,
            }
            .into());
        }
        let frame = entry.frame().expect("present entry always has a frame");
        let flags = entry.flags();
        entry.clear();
        Ok((frame, flags))
    }

    /// Look up the frame and flags currently mapped at `virt`.
    pub fn translate_page(&mut self, virt: VirtualAddress) -> KernelResult<(FrameNumber, PageFlags)> {
        let entry_ptr = self
            .leaf(virt, &mut NoFrames, false)?
            .ok_or(PageTableError::NotMapped {
                addr: virt.as_u64() as usize,
            })?;
        // SAFETY: see `leaf`.
        let entry = unsafe { &*entry_ptr };
        if !entry.is_present() {
            return Err(PageTableError::NotMapped {
                addr: virt.as_u64() as usize,
            }
            .into());
        }
        Ok((entry.frame().unwrap(), entry.flags()))
    }

    /// Replace flags on an existing mapping, preserving address, `owned`,
    /// `pinned`, and callback id.
    pub fn update_page_flags(&mut self, virt: VirtualAddress, flags: PageFlags) -> KernelResult<()> {
        let entry_ptr = self
            .leaf(virt, &mut NoFrames, false)?
            .ok_or(PageTableError::NotMapped {
                addr: virt.as_u64() as usize,
            })?;
        // SAFETY: see `leaf`.
        let entry = unsafe { &mut *entry_ptr };
        if !entry.is_present() {
            return Err(PageTableError::NotMapped {
                addr: virt.as_u64() as usize,
            }
            .into());
        }
        entry.set_flags_preserving(flags);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;
    use std::collections::HashMap;
    use std::sync::Mutex;

    extern crate alloc;
    extern crate std;

    struct TestAllocator {
        next: Mutex<u64>,
    }

    impl TableAllocator for TestAllocator {
        fn alloc_table(&mut self) -> KernelResult<FrameNumber> {
            let mut next = self.next.lock().unwrap();
            let frame = *next;
            *next += 1;
            Ok(FrameNumber::new(frame))
        }
        fn free_table(&mut self, _frame: FrameNumber) {}
    }

    /// Backs each "physical frame" with a heap-allocated table, keyed by
    /// frame number, so tests run on host without real physical memory.
    struct TestMapper {
        tables: Mutex<HashMap<u64, Box<PageTable>>>,
    }

    impl TestMapper {
        fn new() -> Self {
            Self {
                tables: Mutex::new(HashMap::new()),
            }
        }
    }

    impl PhysMapper for TestMapper {
        fn map(&self, phys: PhysicalAddress) -> *mut PageTable {
            let frame = phys.as_u64() >> 12;
            let mut tables = self.tables.lock().unwrap();
            let table = tables.entry(frame).or_insert_with(|| Box::new(PageTable::new()));
            table.as_mut() as *mut PageTable
        }
    }

    fn harness() -> (TestAllocator, TestMapper) {
        (TestAllocator { next: Mutex::new(1) }, TestMapper::new())
    }

    #[test]
    fn map_unmap_clear_round_trip() {
        let (mut alloc, mapper) = harness();
        let mut root = PageTableRoot::init(&mut alloc, &mapper).unwrap();
        let virt = VirtualAddress::new(0x401000);
        let phys = PhysicalAddress::new(0x200000);
        root.map(
            &mut alloc,
            &mapper,
            virt,
            phys,
            2,
            PageFlags::WRITABLE | PageFlags::OWNED,
            0,
        )
        .unwrap();
        assert!(root.is_mapped(&mapper, virt, 2));
        assert_eq!(
            root.get_phys_addr(&mapper, VirtualAddress::new(0x401800)).unwrap().as_u64(),
            0x200800
        );
        root.unmap(&mapper, virt, 2);
        assert!(!root.is_mapped(&mapper, virt, 2));
        assert!(!root.is_unmapped(&mapper, virt, 2));
        let freed = root.clear(&mut alloc, &mapper, virt, 2);
        assert_eq!(freed, 2);
        assert!(root.is_unmapped(&mapper, virt, 2));
    }

    #[test]
    fn map_rejects_already_present() {
        let (mut alloc, mapper) = harness();
        let mut root = PageTableRoot::init(&mut alloc, &mapper).unwrap();
        let virt = VirtualAddress::new(0x401000);
        root.map(&mut alloc, &mapper, virt, PhysicalAddress::new(0x200000), 1, PageFlags::WRITABLE, 0)
            .unwrap();
        let result = root.map(&mut alloc, &mapper, virt, PhysicalAddress::new(0x300000), 1, PageFlags::WRITABLE, 0);
        assert!(result.is_err());
    }

    #[test]
    fn find_unmapped_region_skips_absent_subtrees() {
        let (mut alloc, mapper) = harness();
        let mut root = PageTableRoot::init(&mut alloc, &mapper).unwrap();
        let found = root
            .find_unmapped_region(&mapper, VirtualAddress::new(0x400000), VirtualAddress::new(0x500000), 4)
            .unwrap();
        assert!(root.is_unmapped(&mapper, found, 4));
        root.map(&mut alloc, &mapper, found, PhysicalAddress::new(0x100000), 4, PageFlags::WRITABLE, 0)
            .unwrap();
        for i in 0..4u64 {
            assert!(!root.is_unmapped(&mapper, VirtualAddress::new(found.as_u64() + i * 4096), 1));
        }
    }

    #[test]
    fn set_flags_preserves_owned_and_callback() {
        let (mut alloc, mapper) = harness();
        let mut root = PageTableRoot::init(&mut alloc, &mapper).unwrap();
        let virt = VirtualAddress::new(0x401000);
        root.map(&mut alloc, &mapper, virt, PhysicalAddress::new(0x200000), 1, PageFlags::OWNED, 2)
            .unwrap();
        root.set_flags(&mapper, virt, 1, PageFlags::WRITABLE);
        let entry = root.resolve_leaf_readonly(&mapper, virt).unwrap();
        assert!(entry.is_owned());
        assert_eq!(entry.callback_id(), 2);
        assert!(entry.flags().contains(PageFlags::WRITABLE));
    }
}
