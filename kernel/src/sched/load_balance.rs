//! Load balancing and task migration between CPUs
//!
//! Two distinct EEVDF balancing rules  plus deferred cleanup of
//! dead tasks. There is no periodic rebalance pass: placement happens once,
//! at submit time, and is corrected lazily by whichever CPU next goes idle.

use core::sync::atomic::Ordering;

use super::{metrics, smp, task::Task};

/// How long (in ticks) a client's working set is assumed to stay cache-hot
/// on the CPU it last ran on .
pub const CACHE_HOT_THRESHOLD: u64 = 1_000;

/// Wrapper to make NonNull<Task> Send/Sync for load balancing data structures.
///
/// # Safety
///
/// TaskPtr instances in load balancing are only accessed under appropriate
/// locks (cleanup queue mutex or CPU ready queue locks). Task memory is
/// managed by the kernel allocator.
#[derive(Clone, Copy)]
struct TaskPtr(core::ptr::NonNull<Task>);

// SAFETY: TaskPtr is only accessed under mutex locks in the cleanup queue or
// during load balancing with CPU ready queue locks held. No unsynchronized
// concurrent access occurs.
unsafe impl Send for TaskPtr {}
// SAFETY: Same as Send -- all access is synchronized via mutexes.
unsafe impl Sync for TaskPtr {}

/// Clean up dead tasks that have been marked for deferred deallocation
#[cfg(feature = "alloc")]
pub fn cleanup_dead_tasks() {
    extern crate alloc;
    use alloc::{boxed::Box, vec::Vec};

    use spin::Lazy;

    static CLEANUP_QUEUE: Lazy<spin::Mutex<Vec<(TaskPtr, u64)>>> =
        Lazy::new(|| spin::Mutex::new(Vec::new()));

    let current_tick = crate::arch::timer::get_ticks();
    let mut queue = CLEANUP_QUEUE.lock();

    // Find tasks that are ready to be cleaned up
    let mut i = 0;
    while i < queue.len() {
        let (TaskPtr(task_ptr), cleanup_tick) = queue[i];

        if current_tick >= cleanup_tick {
            // Remove from queue
            queue.swap_remove(i);

            // SAFETY: This task pointer was placed in the cleanup queue by
            // `exit_task` after being removed from the scheduler. We waited
            // at least 100 ticks (the cleanup delay) to ensure no other CPU
            // holds a reference to this task. The pointer was originally
            // created via `Box::leak` and is valid to reconstruct.
            unsafe {
                let task_box = Box::from_raw(task_ptr.as_ptr());
                drop(task_box);
            }

            #[cfg(not(target_arch = "aarch64"))]
            println!("[SCHED] Cleaned up dead task");

            #[cfg(target_arch = "aarch64")]
            {
                // SAFETY: uart_write_str writes to the UART MMIO register at
                // 0x09000000 on the QEMU virt machine. This is always mapped
                // and does not alias Rust memory.
                unsafe {
                    use crate::arch::aarch64::direct_uart::uart_write_str;
                    uart_write_str("[SCHED] Cleaned up dead task\n");
                }
            }
        } else {
            i += 1;
        }
    }
}

/// Push-at-submit : choose the CPU a newly runnable client
/// should land on. If it ran recently enough on `last_cpu` that its
/// working set is probably still resident there, keep it; otherwise hand
/// it to the CPU currently carrying the least EEVDF weight, so weight
/// stays roughly balanced without ever moving a running client.
#[cfg(feature = "alloc")]
pub fn push_target(task: &Task, fallback_cpu: u8) -> u8 {
    if let Some(last) = task.last_cpu {
        let now = crate::arch::timer::get_ticks();
        if now.saturating_sub(task.slice_stop) < CACHE_HOT_THRESHOLD
            && task.can_run_on(last)
            && smp::per_cpu(last).is_some_and(|c| c.cpu_info.is_online())
        {
            return last;
        }
    }

    let mut best_cpu = fallback_cpu;
    let mut best_weight = u64::MAX;
    for cpu_id in 0..smp::MAX_CPUS as u8 {
        if !task.can_run_on(cpu_id) {
            continue;
        }
        let Some(cpu_data) = smp::per_cpu(cpu_id) else {
            continue;
        };
        if !cpu_data.cpu_info.is_online() {
            continue;
        }
        let weight = cpu_data.cpu_info.scheduler.lock().total_weight();
        if weight < best_weight {
            best_weight = weight;
            best_cpu = cpu_id;
        }
    }
    best_cpu
}

/// Pull-at-idle : called by a CPU about to enter its idle loop.
/// Scans the other online CPUs for the one carrying the largest EEVDF
/// weight and, if it holds a cache-cold client, unlinks it and hands it
/// back for the caller to run.
#[cfg(feature = "alloc")]
pub fn pull_idle(this_cpu: u8) -> Option<core::ptr::NonNull<Task>> {
    let mut donor_cpu = None;
    let mut donor_weight = 0u64;

    for cpu_id in 0..smp::MAX_CPUS as u8 {
        if cpu_id == this_cpu {
            continue;
        }
        let Some(cpu_data) = smp::per_cpu(cpu_id) else {
            continue;
        };
        if !cpu_data.cpu_info.is_online() {
            continue;
        }
        let weight = cpu_data.cpu_info.scheduler.lock().total_weight();
        if weight > donor_weight {
            donor_weight = weight;
            donor_cpu = Some(cpu_id);
        }
    }

    let donor_cpu = donor_cpu?;
    let donor_data = smp::per_cpu(donor_cpu)?;
    let donor_scheduler = donor_data.cpu_info.scheduler.lock();
    let eevdf_queue = donor_scheduler.eevdf_queue.as_ref()?;
    let now = crate::arch::timer::get_ticks();
    let task_ptr = eevdf_queue.lock().take_cache_cold(now, CACHE_HOT_THRESHOLD)?;

    // SAFETY: `task_ptr` was just unlinked from the donor's runqueue under
    // that queue's lock, so no other CPU holds it.
    unsafe {
        let task_mut = task_ptr.as_ptr();
        (*task_mut).last_cpu = Some(this_cpu);
        (*task_mut).migrations += 1;
    }

    donor_data
        .cpu_info
        .nr_running
        .fetch_sub(1, Ordering::Relaxed);
    donor_data.cpu_info.update_load();
    metrics::SCHEDULER_METRICS.record_migration();

    Some(task_ptr)
}
