//! Memory management: physical frame allocator, kernel heap, the four-level
//! page table, and the per-process address space built on top of it.

#![allow(dead_code)]

pub mod bootloader;
pub mod demand_paging;
pub mod frame_allocator;
pub mod heap;
pub mod page_fault;
pub mod page_table;
pub mod vas;

pub use frame_allocator::{
    FrameAllocatorError, FrameNumber, MemoryZone, PhysicalAddress, FRAME_ALLOCATOR, FRAME_SIZE,
};
pub use page_table::PageFlags;
pub use vas::{AddressSpace, AddressSpaceFlags};

/// A contiguous region of physical memory as reported by the boot-info
/// memory map.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    pub start: u64,
    pub size: u64,
    pub usable: bool,
}

pub const PAGE_SIZE: usize = FRAME_SIZE;

/// Virtual memory address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtualAddress(pub u64);

impl VirtualAddress {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn as_usize(&self) -> usize {
        self.0 as usize
    }

    pub fn add(&self, offset: usize) -> Self {
        Self(self.0 + offset as u64)
    }

    pub const fn align_down(&self, align: u64) -> Self {
        Self(self.0 & !(align - 1))
    }

    pub const fn is_aligned(&self, align: u64) -> bool {
        self.0 & (align - 1) == 0
    }
}

/// Page size options for large-page mappings.
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSize {
    Small = 4096,
    Large = 2 * 1024 * 1024,
    Huge = 1024 * 1024 * 1024,
}

/// Translates a physical frame into the virtual pointer the kernel can
/// dereference, through the bootloader's all-physical-memory mapping.
pub struct KernelPhysMapper;

impl page_table::PhysMapper for KernelPhysMapper {
    fn map(&self, phys: PhysicalAddress) -> *mut page_table::PageTable {
        crate::boot::info::phys_to_virt(phys.as_u64()) as *mut page_table::PageTable
    }
}

/// Translate a raw physical address to the raw virtual address it is
/// reachable at through the kernel's physical-memory window. Callers that
/// need a typed pointer cast the `u64` result themselves.
pub fn phys_to_virt_addr(phys: u64) -> u64 {
    crate::boot::info::phys_to_virt(phys)
}

/// Drives page-table allocation through the kernel's bitmap/buddy physical
/// allocator, so the same `PageTableRoot` code also works when driven by
/// the bootloader's own pool allocator during early boot.
pub struct KernelTableAllocator;

impl page_table::TableAllocator for KernelTableAllocator {
    fn alloc_table(&mut self) -> crate::error::KernelResult<FrameNumber> {
        FRAME_ALLOCATOR
            .lock()
            .allocate_frames(1, None)
            .map_err(|_| crate::error::PageTableError::FrameAllocationFailed.into())
    }

    fn free_table(&mut self, frame: FrameNumber) {
        let _ = FRAME_ALLOCATOR.lock().free_frames(frame, 1);
    }
}

/// Initializes the physical allocator and the kernel heap. Called once
/// during boot, after the bootloader's memory map has been recorded and
/// before the kernel address space is constructed.
pub fn init() {
    log::debug!("mm: initializing frame allocator and heap");
    bootloader::init_from_boot_info();
    if let Err(e) = heap::init() {
        panic!("failed to initialize kernel heap: {}", e);
    }
    log::info!("mm: memory management initialized");
}
