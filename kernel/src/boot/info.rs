//! The boot-info blob as the kernel sees it.
//!
//! Grounded on `bootloader_api::BootInfo`, which remains the source of
//! truth; this module narrows it down to the fields the core needs and
//! makes them available after the one-shot hand-off call, matching the
//! memory-map/framebuffer descriptor shapes described for the kernel's own
//! boot protocol.

use core::sync::atomic::{AtomicU64, Ordering};

use spin::Once;

/// One entry of the physical memory map, rewritten into the higher half by
/// the boot loader before hand-off.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct MemoryMapEntry {
    pub phys_start: u64,
    pub virt_start: u64,
    pub kind: MemoryRegionKind,
    pub page_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MemoryRegionKind {
    Usable,
    Reserved,
    BootloaderReclaimable,
    UnknownUefi(u32),
    UnknownBios(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FramebufferFormat {
    Rgb32,
    Bgr32,
    Bitmask,
    BltOnly,
    Unknown,
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct FramebufferInfo {
    pub phys_addr: u64,
    pub virt_addr: u64,
    pub width: usize,
    pub height: usize,
    pub stride: usize,
    pub byte_size: usize,
    pub format: FramebufferFormat,
}

/// Fields of the boot-info blob the kernel core depends on.
pub struct KernelBootInfo {
    pub physical_memory_offset: u64,
    pub rsdp_addr: Option<u64>,
    pub framebuffer: Option<FramebufferInfo>,
    pub memory_regions: &'static [bootloader_api::info::MemoryRegion],
}

static BOOT_INFO: Once<KernelBootInfo> = Once::new();
static PHYSICAL_MEMORY_OFFSET: AtomicU64 = AtomicU64::new(0);

/// Called exactly once, from the bootloader entry trampoline.
pub fn record(raw: &'static mut bootloader_api::BootInfo) {
    let phys_mem_offset = raw
        .physical_memory_offset
        .into_option()
        .expect("bootloader must map all physical memory for the kernel to function");
    PHYSICAL_MEMORY_OFFSET.store(phys_mem_offset, Ordering::Release);

    let framebuffer = raw.framebuffer.as_ref().map(|fb| {
        let info = fb.info();
        FramebufferInfo {
            phys_addr: 0,
            virt_addr: fb.buffer().as_ptr() as u64,
            width: info.width,
            height: info.height,
            stride: info.stride,
            byte_size: fb.buffer().len(),
            format: match info.pixel_format {
                bootloader_api::info::PixelFormat::Rgb => FramebufferFormat::Rgb32,
                bootloader_api::info::PixelFormat::Bgr => FramebufferFormat::Bgr32,
                bootloader_api::info::PixelFormat::U8 => FramebufferFormat::BltOnly,
                _ => FramebufferFormat::Unknown,
            },
        }
    });

    // SAFETY: `raw` is `&'static mut`, so its memory_regions slice is valid
    // for the program's remaining lifetime; we only ever read it afterward.
    let memory_regions: &'static [bootloader_api::info::MemoryRegion] = &raw.memory_regions;

    BOOT_INFO.call_once(|| KernelBootInfo {
        physical_memory_offset: phys_mem_offset,
        rsdp_addr: raw.rsdp_addr.into_option(),
        framebuffer,
        memory_regions,
    });
}

pub fn get() -> &'static KernelBootInfo {
    BOOT_INFO
        .get()
        .expect("boot::info::record must run before any subsystem reads boot info")
}

/// Translate a physical address to the virtual address it's mapped at
/// through the bootloader's all-physical-memory mapping. Used by the page
/// table code to dereference intermediate table frames.
pub fn phys_to_virt(phys: u64) -> u64 {
    PHYSICAL_MEMORY_OFFSET.load(Ordering::Acquire) + phys
}
