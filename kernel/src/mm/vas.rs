//! Per-process address space: owned user mappings layered over a shared
//! kernel region, pin accounting, and cross-CPU TLB shootdown.
//!
//! The teacher's `VirtualAddressSpace` wrapped a single `PageMapper` with no
//! pin tracking and a `Vec`-batched local TLB flush. `original_source`'s
//! `kernel/mem/paging.h`/`vas.h` track pins per page (two bits aren't enough
//! for nested pins, so the original keeps a side table) and shoot down TLBs
//! on every CPU that may have the mapping cached, not just the local one.
//! This rewrite keeps the teacher's "one struct owns one root, user code
//! never touches raw tables" shape but replaces the body with that model,
//! built on `super::page_table::PageTableRoot`.

#![allow(clippy::manual_div_ceil)]

use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use bitflags::bitflags;
use spin::Mutex;

use crate::error::{AddressSpaceError, KernelError, KernelResult, PageTableError};

use super::page_table::{PageTableRoot, PML_MAX_CALLBACK};
use super::{KernelPhysMapper, KernelTableAllocator, PageFlags, PhysicalAddress, VirtualAddress};

/// Number of entries one PML4 table holds; user/kernel halves split at
/// half this, matching `original_source`'s canonical-address split.
const PML4_ENTRIES: usize = 512;
/// PML4 indices `[0, KERNEL_PML4_BOUNDARY)` are user-owned; the rest are
/// shared kernel slots copied from the boot page tables into every address
/// space at construction time (`free_user_page_table_frames`'s own split,
/// kept here as the single source of truth).
const KERNEL_PML4_BOUNDARY: usize = PML4_ENTRIES / 2;

/// Entries queued in one CPU's shootdown ring before the requester gives up
/// and panics. `original_source` sizes this ring per-CPU and panics on
/// overflow rather than blocking indefinitely on a stuck remote CPU.
const SHOOTDOWN_RING_CAPACITY: usize = 64;
/// Spins waiting for remote CPUs to acknowledge a shootdown before treating
/// it as a hung CPU.
const SHOOTDOWN_TIMEOUT_SPINS: u64 = 10_000_000;

bitflags! {
    /// Construction-time flags selecting which shared kernel regions an
    /// address space's PML4 shares with the boot tables.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AddressSpaceFlags: u32 {
        /// Share the PML4 slots covering the kernel's own text/data image.
        const MAP_KERNEL_BINARY = 1 << 0;
        /// Share the PML4 slots covering the kernel heap.
        const MAP_KERNEL_HEAP   = 1 << 1;
        /// Share the PML4 slots covering the physical-memory identity map.
        const MAP_IDENTITY      = 1 << 2;
    }
}

/// One pending TLB invalidation, queued for a remote CPU.
#[derive(Debug, Clone, Copy)]
struct ShootdownRequest {
    virt: u64,
    n_pages: u32,
}

/// Bounded per-CPU shootdown mailbox: the requester pushes entries and
/// raises `pending`, sends an IPI, then spins on `acked` reaching the
/// generation it just posted.
struct ShootdownMailbox {
    entries: Mutex<Vec<ShootdownRequest>>,
    generation: AtomicU64,
    acked: AtomicU64,
}

impl ShootdownMailbox {
    const fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            generation: AtomicU64::new(0),
            acked: AtomicU64::new(0),
        }
    }
}

/// Upper bound on simultaneously active CPUs the shootdown protocol
/// tracks. Kept local to `mm` for the same reason `irp::timeout::MAX_CPUS`
/// is local to `irp`: no cross-module dependency on scheduler internals.
pub const MAX_CPUS: usize = 32;

const EMPTY_MAILBOX: ShootdownMailbox = ShootdownMailbox::new();
static MAILBOXES: [ShootdownMailbox; MAX_CPUS] = [EMPTY_MAILBOX; MAX_CPUS];

/// Which CPUs currently have a page table loaded and so need shooting down.
/// Set by [`AddressSpace::load`], read by [`request_shootdown`].
static ACTIVE_CPUS: AtomicU32 = AtomicU32::new(0);

fn mark_active(cpu: usize) {
    ACTIVE_CPUS.fetch_or(1 << (cpu % 32), Ordering::AcqRel);
}

/// Send `virt..virt+n_pages*4096` to every active CPU's shootdown mailbox,
/// IPI them, and spin for acknowledgment. The requester also services its
/// own mailbox locally via `invlpg` without round-tripping through an IPI.
///
/// # Errors
///
/// Returns [`AddressSpaceError::ShootdownRingFull`] if any remote mailbox is
/// already at capacity, and [`AddressSpaceError::ShootdownTimeout`] if a
/// remote CPU never acknowledges — the caller's only correct response to
/// either is to treat the remote CPU as wedged, matching `original_source`'s
/// "shootdown never silently drops an invalidation" invariant.
fn request_shootdown(local_cpu: usize, virt: VirtualAddress, n_pages: usize) -> Result<(), KernelError> {
    flush_local(virt, n_pages);

    let active = ACTIVE_CPUS.load(Ordering::Acquire);
    for cpu in 0..MAX_CPUS {
        if cpu == local_cpu || active & (1 << (cpu % 32)) == 0 {
            continue;
        }
        let mailbox = &MAILBOXES[cpu];
        {
            let mut entries = mailbox.entries.lock();
            if entries.len() >= SHOOTDOWN_RING_CAPACITY {
                return Err(AddressSpaceError::ShootdownRingFull { cpu }.into());
            }
            entries.push(ShootdownRequest {
                virt: virt.as_u64(),
                n_pages: n_pages as u32,
            });
        }
        let generation = mailbox.generation.fetch_add(1, Ordering::AcqRel) + 1;
        send_shootdown_ipi(cpu);

        let mut spins = 0u64;
        while mailbox.acked.load(Ordering::Acquire) < generation {
            core::hint::spin_loop();
            spins += 1;
            if spins > SHOOTDOWN_TIMEOUT_SPINS {
                return Err(AddressSpaceError::ShootdownTimeout { cpu }.into());
            }
        }
    }
    Ok(())
}

#[cfg(target_arch = "x86_64")]
fn send_shootdown_ipi(cpu: usize) {
    crate::sched::smp::send_ipi(cpu as u8, SHOOTDOWN_IPI_VECTOR);
}

#[cfg(not(target_arch = "x86_64"))]
fn send_shootdown_ipi(_cpu: usize) {}

/// Vector the local APIC delivers shootdown IPIs on. Handled by
/// [`handle_shootdown_ipi`], invoked from the architecture's interrupt
/// dispatch table.
pub const SHOOTDOWN_IPI_VECTOR: u8 = 0xFB;

#[cfg(target_arch = "x86_64")]
fn flush_local(virt: VirtualAddress, n_pages: usize) {
    for i in 0..n_pages {
        crate::arch::x86_64::mmu::flush_tlb_address(virt.as_u64() + (i as u64) * 4096);
    }
}

#[cfg(not(target_arch = "x86_64"))]
fn flush_local(_virt: VirtualAddress, _n_pages: usize) {}

/// Run on the IPI'd CPU: drain its mailbox, invalidate every queued range
/// locally, and bump `acked` so the requester's spin-wait completes.
pub fn handle_shootdown_ipi(cpu: usize) {
    let mailbox = &MAILBOXES[cpu % MAX_CPUS];
    let requests: Vec<ShootdownRequest> = mailbox.entries.lock().drain(..).collect();
    for req in requests {
        flush_local(VirtualAddress::new(req.virt), req.n_pages as usize);
    }
    mailbox.acked.store(mailbox.generation.load(Ordering::Acquire), Ordering::Release);
}

/// A callback id registered against [`AddressSpace::alloc_callback`],
/// consumed whenever a page tagged with it is torn down (page-fault
/// handlers, demand-paging backers, and similar per-mapping hooks).
pub type CallbackFn = fn(VirtualAddress);

/// A process's or the kernel's virtual address space: one [`PageTableRoot`]
/// plus pin accounting and registered teardown callbacks.
///
/// Mirrors the teacher's "single struct owns the root, nobody outside `mm`
/// touches raw tables" shape; the body is rebuilt around pin/unpin,
/// two-phase mapping, and callback ids that the teacher's `VirtualMapping`
/// design didn't have.
pub struct AddressSpace {
    root: Mutex<PageTableRoot>,
    /// Pin depth per page, for pages pinned more than once (the page table
    /// entry itself only has one `PINNED` bit; depth lives here).
    pins: Mutex<BTreeMap<u64, u32>>,
    /// Live user-space mappings (`virt` -> page count), so
    /// [`destroy_user_space`](Self::destroy_user_space) can tear the whole
    /// address space down without a PML4-subtree walker. Mirrors the
    /// teacher's `VirtualAddressSpace::mappings` bookkeeping.
    mappings: Mutex<BTreeMap<u64, usize>>,
    /// Registered teardown callbacks, indexed by the 2-bit id stored in
    /// each leaf entry. Slot 0 is reserved for "no callback".
    callbacks: Mutex<[Option<CallbackFn>; (PML_MAX_CALLBACK as usize) + 1]>,
    flags: AddressSpaceFlags,
    cpu: AtomicUsize,
    /// Half-open `[start, end)` user window this space's addresses must fall
    /// within, checked by [`check_access`](Self::check_access). Mirrors
    /// `original_source`'s `space->startAddress`/`space->endAddress`.
    start: VirtualAddress,
    end: VirtualAddress,
}

/// State threaded between [`AddressSpace::begin_mapping`] and
/// [`AddressSpace::end_mapping`]. The caller resolves the backing frames
/// (which may block on I/O, e.g. demand paging) between the two calls,
/// while the address space has already reserved the virtual range.
pub struct MappingTicket {
    virt: VirtualAddress,
    n_pages: usize,
}

impl AddressSpace {
    /// Allocate a fresh PML4, share the requested kernel PML4 slots from the
    /// currently-loaded table, and return the new address space unloaded.
    pub fn init(flags: AddressSpaceFlags) -> KernelResult<Self> {
        Self::init_with_range(
            VirtualAddress::new(crate::process::memory::layout::USER_SPACE_START as u64),
            VirtualAddress::new(crate::process::memory::layout::USER_SPACE_END as u64),
            flags,
        )
    }

    /// As [`init`](Self::init), with an explicit `[start, end)` user window
    /// instead of the default process layout (spec: `init(start, end,
    /// flags)`).
    pub fn init_with_range(
        start: VirtualAddress,
        end: VirtualAddress,
        flags: AddressSpaceFlags,
    ) -> KernelResult<Self> {
        let root = PageTableRoot::init(&mut KernelTableAllocator, &KernelPhysMapper)?;
        let space = Self {
            root: Mutex::new(root),
            pins: Mutex::new(BTreeMap::new()),
            mappings: Mutex::new(BTreeMap::new()),
            callbacks: Mutex::new([None; (PML_MAX_CALLBACK as usize) + 1]),
            flags,
            cpu: AtomicUsize::new(usize::MAX),
            start,
            end,
        };
        space.share_kernel_region()?;
        Ok(space)
    }

    /// Copy the shared kernel PML4 entries (indices `[KERNEL_PML4_BOUNDARY,
    /// 512)`) from the currently active page table into this one. Every
    /// address space's kernel half points at the same L3/L2/L1 tables, so a
    /// mapping made in one is visible in all of them without any
    /// propagation step — exactly the property `MAP_KERNEL_BINARY` /
    /// `MAP_KERNEL_HEAP` / `MAP_IDENTITY` select pieces of.
    fn share_kernel_region(&self) -> KernelResult<()> {
        if self.flags.is_empty() {
            return Ok(());
        }
        let current = current_l4_phys();
        if current.as_u64() == 0 {
            // No address space loaded yet (early boot): nothing to copy from.
            return Ok(());
        }
        let src = unsafe { &*(KernelPhysMapper.map(current) as *const super::page_table::PageTable) };
        let root = self.root.lock();
        let dst = unsafe { &mut *KernelPhysMapper.map(root.l4_phys()) };
        for i in KERNEL_PML4_BOUNDARY..PML4_ENTRIES {
            dst[i] = src[i];
        }
        Ok(())
    }

    pub fn flags(&self) -> AddressSpaceFlags {
        self.flags
    }

    pub fn l4_phys(&self) -> PhysicalAddress {
        self.root.lock().l4_phys()
    }

    /// Install this address space's PML4 into `CR3` and remember which CPU
    /// it is now active on, so shootdowns know to target it.
    pub fn load(&self, cpu: usize) {
        self.cpu.store(cpu, Ordering::Release);
        mark_active(cpu);
        write_cr3(self.l4_phys());
    }

    /// Register a teardown callback, returning the id future mappings
    /// should pass to [`begin_mapping`](Self::begin_mapping)'s `callback_id`
    /// parameter.
    ///
    /// # Errors
    ///
    /// [`PageTableError::TooManyCallbacks`] once all `PML_MAX_CALLBACK`
    /// non-zero slots are taken.
    pub fn alloc_callback(&self, f: CallbackFn) -> KernelResult<u8> {
        let mut slots = self.callbacks.lock();
        for id in 1..=(PML_MAX_CALLBACK as usize) {
            if slots[id].is_none() {
                slots[id] = Some(f);
                return Ok(id as u8);
            }
        }
        Err(PageTableError::TooManyCallbacks.into())
    }

    pub fn free_callback(&self, id: u8) {
        if id != 0 && (id as usize) <= PML_MAX_CALLBACK as usize {
            self.callbacks.lock()[id as usize] = None;
        }
    }

    fn run_callbacks_for(&self, virt: VirtualAddress, n_pages: usize) {
        let counts = {
            let mut root = self.root.lock();
            root.collect_callbacks(&KernelPhysMapper, virt, n_pages)
        };
        let slots = self.callbacks.lock();
        for (id, count) in counts.iter().enumerate() {
            if *count > 0 {
                if let Some(f) = slots[id] {
                    f(virt);
                }
            }
        }
    }

    /// Phase one of mapping: reserve `n_pages` contiguous, currently-unmapped
    /// pages starting at or after `hint` (or anywhere if `hint` is `None`),
    /// without yet choosing backing frames. Returns a ticket that must be
    /// passed to [`end_mapping`](Self::end_mapping) or dropped (dropping
    /// simply leaves the range unmapped; nothing was committed).
    pub fn begin_mapping(
        &self,
        hint: Option<VirtualAddress>,
        range_end: VirtualAddress,
        n_pages: usize,
    ) -> KernelResult<MappingTicket> {
        let start = hint.unwrap_or(VirtualAddress::new(0));
        let mut root = self.root.lock();
        let virt = root
            .find_unmapped_region(&KernelPhysMapper, start, range_end, n_pages)
            .ok_or(PageTableError::NoUnmappedRegion { len: n_pages * 4096 })?;
        Ok(MappingTicket { virt, n_pages })
    }

    /// Phase two: install `phys` (one frame per page, contiguous in the
    /// ticket's virtual range) with `flags`/`callback_id`, completing a
    /// mapping started with [`begin_mapping`](Self::begin_mapping). The
    /// range is guaranteed still unmapped: nothing else can have claimed it,
    /// since `find_unmapped_region` only reports ranges and doesn't reserve
    /// them out-of-band — callers that need that guarantee under
    /// concurrent mappers must hold the same lock across both phases (this
    /// is why both phases take `&self` and internally serialize on `root`).
    pub fn end_mapping(
        &self,
        ticket: MappingTicket,
        phys: PhysicalAddress,
        flags: PageFlags,
        callback_id: u8,
    ) -> KernelResult<VirtualAddress> {
        {
            let mut root = self.root.lock();
            root.map(
                &mut KernelTableAllocator,
                &KernelPhysMapper,
                ticket.virt,
                phys,
                ticket.n_pages,
                flags,
                callback_id,
            )?;
        }
        self.mappings.lock().insert(ticket.virt.as_u64(), ticket.n_pages);
        Ok(ticket.virt)
    }

    /// Map `n_pages` contiguous pages in one call, for callers that already
    /// know their physical backing and don't need the two-phase split.
    pub fn map(
        &self,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        n_pages: usize,
        flags: PageFlags,
        callback_id: u8,
    ) -> KernelResult<()> {
        self.root.lock().map(
            &mut KernelTableAllocator,
            &KernelPhysMapper,
            virt,
            phys,
            n_pages,
            flags,
            callback_id,
        )?;
        self.mappings.lock().insert(virt.as_u64(), n_pages);
        Ok(())
    }

    /// Unmap and free `n_pages` starting at `virt`, pinned pages excluded.
    /// Runs any registered teardown callbacks, clears the present bit on
    /// every CPU that may have the range cached (TLB shootdown), then frees
    /// owned frames and drops now-empty intermediate tables.
    pub fn unmap(&self, virt: VirtualAddress, n_pages: usize) -> KernelResult<usize> {
        {
            let mut root = self.root.lock();
            for i in 0..n_pages {
                let v = VirtualAddress::new(virt.as_u64() + (i as u64) * 4096);
                if root.is_pinned(&KernelPhysMapper, v) {
                    return Err(PageTableError::Pinned {
                        addr: v.as_u64() as usize,
                    }
                    .into());
                }
            }
        }
        self.run_callbacks_for(virt, n_pages);
        {
            let mut root = self.root.lock();
            root.unmap(&KernelPhysMapper, virt, n_pages);
        }
        let cpu = self.cpu.load(Ordering::Acquire);
        if cpu != usize::MAX {
            request_shootdown(cpu, virt, n_pages)?;
        }
        let freed = self
            .root
            .lock()
            .clear(&mut KernelTableAllocator, &KernelPhysMapper, virt, n_pages);
        self.mappings.lock().remove(&virt.as_u64());
        Ok(freed)
    }

    /// Back `v` with a fresh owned frame if it isn't mapped yet. Shared by
    /// [`pin`](Self::pin) and [`pin_terminated`](Self::pin_terminated), both
    /// of which must fault in missing user pages before pinning them
    /// (`original_source`'s `space_populate_user_region`).
    fn populate_page(&self, root: &mut PageTableRoot, v: VirtualAddress) -> KernelResult<()> {
        if root.is_mapped(&KernelPhysMapper, v, 1) {
            return Ok(());
        }
        let frame = super::FRAME_ALLOCATOR
            .lock()
            .allocate_frames(1, None)
            .map_err(|_| PageTableError::FrameAllocationFailed)?;
        let phys = PhysicalAddress::new(frame.as_u64() << 12);
        root.map(
            &mut KernelTableAllocator,
            &KernelPhysMapper,
            v,
            phys,
            1,
            PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER | PageFlags::OWNED,
            0,
        )?;
        self.mappings.lock().insert(v.as_u64(), 1);
        Ok(())
    }

    /// Pin `n_pages` starting at `virt` against unmapping, incrementing the
    /// depth if already pinned. Any page not yet backed by a frame is
    /// populated first (spec: "pin populates any missing user pages, then
    /// increments pin depth"), so a pin can never silently cover an absent
    /// mapping. The page table entry's `PINNED` bit is set on first pin and
    /// cleared only when the depth returns to zero.
    pub fn pin(&self, virt: VirtualAddress, n_pages: usize) -> KernelResult<()> {
        let mut root = self.root.lock();
        for i in 0..n_pages {
            let v = VirtualAddress::new(virt.as_u64() + (i as u64) * 4096);
            self.populate_page(&mut root, v)?;
        }

        let mut pins = self.pins.lock();
        for i in 0..n_pages {
            let v = virt.as_u64() + (i as u64) * 4096;
            let depth = pins.entry(v).or_insert(0);
            *depth += 1;
            if *depth == 1 {
                root.set_flags(
                    &KernelPhysMapper,
                    VirtualAddress::new(v),
                    1,
                    PageFlags::PRESENT | PageFlags::PINNED,
                );
            }
        }
        Ok(())
    }

    /// Reverse one [`pin`](Self::pin) call. Unpinning a page not currently
    /// pinned is [`AddressSpaceError::PinCountUnderflow`].
    pub fn unpin(&self, virt: VirtualAddress, n_pages: usize) -> KernelResult<()> {
        let mut root = self.root.lock();
        let mut pins = self.pins.lock();
        for i in 0..n_pages {
            let v = virt.as_u64() + (i as u64) * 4096;
            let depth = pins
                .get_mut(&v)
                .ok_or(AddressSpaceError::PinCountUnderflow { addr: v as usize })?;
            if *depth == 0 {
                return Err(AddressSpaceError::PinCountUnderflow { addr: v as usize }.into());
            }
            *depth -= 1;
            if *depth == 0 {
                pins.remove(&v);
                root.set_flags(&KernelPhysMapper, VirtualAddress::new(v), 1, PageFlags::PRESENT);
            }
        }
        Ok(())
    }

    pub fn is_pinned(&self, virt: VirtualAddress) -> bool {
        self.root.lock().is_pinned(&KernelPhysMapper, virt)
    }

    /// Validate that `[addr, addr + length)` lies entirely within this
    /// space's `[start, end)` user window, per `original_source`'s
    /// `space_check_access`. A zero-length range is always valid.
    pub fn check_access(&self, addr: VirtualAddress, length: usize) -> KernelResult<()> {
        if length == 0 {
            return Ok(());
        }
        let lo = addr.as_u64();
        let hi = lo
            .checked_add(length as u64)
            .ok_or(AddressSpaceError::OutOfRange { addr: lo as usize })?;
        if lo < self.start.as_u64() || hi > self.end.as_u64() {
            return Err(AddressSpaceError::OutOfRange { addr: lo as usize }.into());
        }
        Ok(())
    }

    /// Pin pages one at a time starting at `addr`, scanning each newly
    /// pinned page for the `object_size`-byte `terminator` sequence, until
    /// either the terminator is found or `max_count` objects have been
    /// scanned. Returns the byte offset of the terminator's first byte
    /// relative to `addr`.
    ///
    /// Every page touched by the scan ends up pinned on success. On failure
    /// (terminator not found, or a page could not be pinned) every page
    /// pinned during this call is unpinned before returning, so a caller
    /// never has to clean up a partial scan. Grounded on
    /// `original_source`'s `space_pin_terminated`, including its
    /// partial-match realignment: a mismatched byte skips ahead by
    /// `object_size - matched` rather than restarting the scan one byte at
    /// a time.
    pub fn pin_terminated(
        &self,
        addr: VirtualAddress,
        terminator: &[u8],
        object_size: usize,
        max_count: usize,
    ) -> KernelResult<usize> {
        if terminator.is_empty() || object_size == 0 || max_count == 0 {
            return Err(AddressSpaceError::OutOfRange {
                addr: addr.as_u64() as usize,
            }
            .into());
        }

        let start = addr.as_u64();
        let end = start + (max_count as u64) * (object_size as u64);
        let mut current = start;
        let mut matched = 0usize;
        let mut pinned_pages: Vec<u64> = Vec::new();

        let outcome = 'scan: loop {
            if current >= end {
                break 'scan None;
            }

            let page_start = current - (current % 4096);
            if self.pin(VirtualAddress::new(page_start), 1).is_err() {
                break 'scan None;
            }
            pinned_pages.push(page_start);

            let scan_end = core::cmp::min(page_start + 4096, end);
            while current < scan_end {
                // SAFETY: `current` was just pinned and populated above, so
                // it is present and mapped in this address space.
                let byte = unsafe { *(current as *const u8) };
                if byte == terminator[matched] {
                    matched += 1;
                    if matched == object_size {
                        break 'scan Some(current + 1 - object_size as u64 - start);
                    }
                    current += 1;
                } else {
                    current += (object_size - matched) as u64;
                    matched = 0;
                }
            }
            current = scan_end;
        };

        match outcome {
            Some(offset) => Ok(offset as usize),
            None => {
                for page_start in pinned_pages {
                    let _ = self.unpin(VirtualAddress::new(page_start), 1);
                }
                Err(AddressSpaceError::OutOfRange { addr: start as usize }.into())
            }
        }
    }

    pub fn is_mapped(&self, virt: VirtualAddress, n_pages: usize) -> bool {
        self.root.lock().is_mapped(&KernelPhysMapper, virt, n_pages)
    }

    pub fn translate(&self, virt: VirtualAddress) -> Option<PhysicalAddress> {
        self.root.lock().get_phys_addr(&KernelPhysMapper, virt)
    }

    /// Tear down every tracked user-space mapping, freeing owned frames and
    /// their intermediate tables. Shared kernel PML4 slots are untouched.
    /// Issues one full local TLB flush at the end rather than a shootdown
    /// per mapping, since the caller is about to switch away from this
    /// address space entirely (teacher's `VirtualAddressSpace::destroy`).
    /// Called on process exit.
    pub fn destroy_user_space(&self) -> usize {
        let entries: Vec<(u64, usize)> = {
            let mappings = self.mappings.lock();
            mappings.iter().map(|(&v, &n)| (v, n)).collect()
        };
        let mut freed = 0usize;
        {
            let mut root = self.root.lock();
            for (virt, n_pages) in &entries {
                root.unmap(&KernelPhysMapper, VirtualAddress::new(*virt), *n_pages);
                freed += root.clear(
                    &mut KernelTableAllocator,
                    &KernelPhysMapper,
                    VirtualAddress::new(*virt),
                    *n_pages,
                );
            }
        }
        self.mappings.lock().clear();
        self.pins.lock().clear();
        crate::arch::tlb_flush_all();
        freed
    }
}

fn current_l4_phys() -> PhysicalAddress {
    read_cr3()
}

#[cfg(target_arch = "x86_64")]
fn read_cr3() -> PhysicalAddress {
    crate::arch::x86_64::mmu::read_cr3()
}

#[cfg(target_arch = "x86_64")]
fn write_cr3(addr: PhysicalAddress) {
    crate::arch::x86_64::mmu::write_cr3(addr)
}

#[cfg(not(target_arch = "x86_64"))]
fn read_cr3() -> PhysicalAddress {
    PhysicalAddress::new(0)
}

#[cfg(not(target_arch = "x86_64"))]
fn write_cr3(_addr: PhysicalAddress) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_then_unmap_frees_frame() {
        let space = AddressSpace::init(AddressSpaceFlags::empty()).unwrap();
        let virt = VirtualAddress::new(0x1000_0000);
        let phys = PhysicalAddress::new(0x20_0000);
        space
            .map(virt, phys, 1, PageFlags::PRESENT | PageFlags::WRITABLE, 0)
            .unwrap();
        assert!(space.is_mapped(virt, 1));
        let freed = space.unmap(virt, 1).unwrap();
        assert_eq!(freed, 0); // not OWNED: frame wasn't allocated by us
        assert!(!space.is_mapped(virt, 1));
    }

    #[test]
    fn pin_blocks_unmap_until_fully_unpinned() {
        let space = AddressSpace::init(AddressSpaceFlags::empty()).unwrap();
        let virt = VirtualAddress::new(0x2000_0000);
        let phys = PhysicalAddress::new(0x30_0000);
        space.map(virt, phys, 1, PageFlags::PRESENT, 0).unwrap();
        space.pin(virt, 1).unwrap();
        space.pin(virt, 1).unwrap();
        assert!(space.unmap(virt, 1).is_err());
        space.unpin(virt, 1).unwrap();
        assert!(space.unmap(virt, 1).is_err());
        space.unpin(virt, 1).unwrap();
        assert!(space.unmap(virt, 1).is_ok());
    }

    #[test]
    fn unpin_without_pin_underflows() {
        let space = AddressSpace::init(AddressSpaceFlags::empty()).unwrap();
        let virt = VirtualAddress::new(0x3000_0000);
        assert!(space.unpin(virt, 1).is_err());
    }

    #[test]
    fn begin_end_mapping_round_trip() {
        let space = AddressSpace::init(AddressSpaceFlags::empty()).unwrap();
        let ticket = space
            .begin_mapping(None, VirtualAddress::new(0x4000_0000_0000), 2)
            .unwrap();
        let virt = ticket.virt;
        let phys = PhysicalAddress::new(0x40_0000);
        let mapped_at = space
            .end_mapping(ticket, phys, PageFlags::PRESENT | PageFlags::WRITABLE, 0)
            .unwrap();
        assert_eq!(mapped_at, virt);
        assert!(space.is_mapped(virt, 2));
    }

    #[test]
    fn callback_runs_on_unmap() {
        use core::sync::atomic::{AtomicBool, Ordering};
        static RAN: AtomicBool = AtomicBool::new(false);
        fn mark(_v: VirtualAddress) {
            RAN.store(true, Ordering::SeqCst);
        }

        let space = AddressSpace::init(AddressSpaceFlags::empty()).unwrap();
        let id = space.alloc_callback(mark).unwrap();
        let virt = VirtualAddress::new(0x5000_0000);
        space.map(virt, PhysicalAddress::new(0x50_0000), 1, PageFlags::PRESENT, id).unwrap();
        space.unmap(virt, 1).unwrap();
        assert!(RAN.load(Ordering::SeqCst));
    }

    #[test]
    fn callback_slots_exhaust() {
        fn noop(_v: VirtualAddress) {}
        let space = AddressSpace::init(AddressSpaceFlags::empty()).unwrap();
        for _ in 0..(PML_MAX_CALLBACK as usize) {
            space.alloc_callback(noop).unwrap();
        }
        assert!(space.alloc_callback(noop).is_err());
    }

    #[test]
    fn check_access_validates_user_window() {
        let space = AddressSpace::init(AddressSpaceFlags::empty()).unwrap();
        let start = VirtualAddress::new(crate::process::memory::layout::USER_SPACE_START as u64);
        assert!(space.check_access(start, 16).is_ok());
        let past_end = VirtualAddress::new(crate::process::memory::layout::USER_SPACE_END as u64);
        assert!(space.check_access(past_end, 1).is_err());
        assert!(space.check_access(VirtualAddress::new(0), 0).is_ok());
    }

    #[test]
    fn pin_terminated_finds_offset_and_leaves_pages_pinned() {
        let space = AddressSpace::init(AddressSpaceFlags::empty()).unwrap();
        let mut buf = alloc::vec![b'a'; 4096 * 2];
        buf[10] = 0;
        let addr = VirtualAddress::new(buf.as_ptr() as u64);
        let offset = space.pin_terminated(addr, &[0], 1, 64).unwrap();
        assert_eq!(offset, 10);
        assert!(space.is_pinned(addr));
    }

    #[test]
    fn pin_terminated_fails_and_unpins_when_not_found() {
        let space = AddressSpace::init(AddressSpaceFlags::empty()).unwrap();
        let buf = alloc::vec![1u8; 4096];
        let addr = VirtualAddress::new(buf.as_ptr() as u64);
        assert!(space.pin_terminated(addr, &[0], 1, 8).is_err());
        assert!(!space.is_pinned(addr));
    }
}
