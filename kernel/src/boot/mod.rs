//! Boot hand-off from the external UEFI bootloader.

pub mod info;
