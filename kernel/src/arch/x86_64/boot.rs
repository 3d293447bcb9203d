//! UEFI-via-bootloader entry point.
//!
//! The boot loader is an external collaborator: it hands off a single
//! `BootInfo` blob (memory map, framebuffer descriptor, ACPI RSDP pointer,
//! physical-memory offset) with virtual addresses already rewritten into
//! the higher half, then jumps here once.

use bootloader_api::{entry_point, BootInfo, BootloaderConfig};

use crate::boot::info;

static BOOTLOADER_CONFIG: BootloaderConfig = {
    let mut config = BootloaderConfig::new_default();
    config.mappings.physical_memory = Some(bootloader_api::config::Mapping::Dynamic);
    config
};

entry_point!(kernel_main, config = &BOOTLOADER_CONFIG);

fn kernel_main(boot_info: &'static mut BootInfo) -> ! {
    info::record(boot_info);
    crate::_start()
}
