//! Ready queue management for scheduler

#[cfg(feature = "alloc")]
extern crate alloc;
#[cfg(feature = "alloc")]
use alloc::{collections::BTreeMap, vec::Vec};
use core::ptr::NonNull;

use spin::Mutex;

use super::{
    task::{SchedClass, Task},
    task_ptr::TaskPtr,
    vtime::VClock,
};

/// Ready queue for a single priority level
pub struct PriorityQueue {
    /// Circular queue of task pointers
    tasks: [Option<TaskPtr>; MAX_TASKS_PER_QUEUE],
    /// Head index (next to dequeue)
    head: usize,
    /// Tail index (next to enqueue)
    tail: usize,
    /// Number of tasks in queue
    count: usize,
}

impl PriorityQueue {
    /// Create new empty priority queue
    pub const fn new() -> Self {
        Self {
            tasks: [None; MAX_TASKS_PER_QUEUE],
            head: 0,
            tail: 0,
            count: 0,
        }
    }

    /// Check if queue is empty
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Check if queue is full
    pub fn is_full(&self) -> bool {
        self.count == MAX_TASKS_PER_QUEUE
    }

    /// Enqueue task
    pub fn enqueue(&mut self, task: NonNull<Task>) -> bool {
        if self.is_full() {
            return false;
        }

        self.tasks[self.tail] = Some(TaskPtr::new(task));
        self.tail = (self.tail + 1) % MAX_TASKS_PER_QUEUE;
        self.count += 1;
        true
    }

    /// Dequeue task
    pub fn dequeue(&mut self) -> Option<NonNull<Task>> {
        if self.is_empty() {
            return None;
        }

        let task = self.tasks[self.head].take();
        self.head = (self.head + 1) % MAX_TASKS_PER_QUEUE;
        self.count -= 1;
        task.map(|t| t.as_ptr())
    }

    /// Peek at next task without removing
    pub fn peek(&self) -> Option<NonNull<Task>> {
        if self.is_empty() {
            None
        } else {
            self.tasks[self.head].map(|t| t.as_ptr())
        }
    }

    /// Remove specific task from queue
    pub fn remove(&mut self, target: NonNull<Task>) -> bool {
        if self.is_empty() {
            return false;
        }

        let mut found = false;
        let mut new_tasks = [None; MAX_TASKS_PER_QUEUE];
        let mut new_count = 0;

        // Copy all tasks except target to new array
        let mut idx = self.head;
        for _ in 0..self.count {
            if let Some(task) = self.tasks[idx] {
                if task.as_ptr() != target {
                    new_tasks[new_count] = Some(task);
                    new_count += 1;
                } else {
                    found = true;
                }
            }
            idx = (idx + 1) % MAX_TASKS_PER_QUEUE;
        }

        if found {
            // Replace with new array
            self.tasks = new_tasks;
            self.head = 0;
            self.tail = new_count;
            self.count = new_count;
        }

        found
    }
}

/// Multi-level ready queue
pub struct ReadyQueue {
    /// Real-time queues by priority
    rt_queues: [PriorityQueue; NUM_RT_PRIORITIES],
    /// Normal priority queues
    normal_queues: [PriorityQueue; NUM_NORMAL_PRIORITIES],
    /// Idle queue
    idle_queue: PriorityQueue,
    /// Bitmap of non-empty real-time queues
    rt_bitmap: u32,
    /// Bitmap of non-empty normal queues
    normal_bitmap: u32,
    /// Whether idle queue has tasks
    idle_flag: bool,
}

impl ReadyQueue {
    /// Create new ready queue
    pub const fn new() -> Self {
        Self {
            rt_queues: [const { PriorityQueue::new() }; NUM_RT_PRIORITIES],
            normal_queues: [const { PriorityQueue::new() }; NUM_NORMAL_PRIORITIES],
            idle_queue: PriorityQueue::new(),
            rt_bitmap: 0,
            normal_bitmap: 0,
            idle_flag: false,
        }
    }

    /// Add task to appropriate queue
    pub fn enqueue(&mut self, task: NonNull<Task>) -> bool {
        unsafe {
            let task_ref = task.as_ref();
            match task_ref.sched_class {
                SchedClass::RealTime => {
                    let idx = (task_ref.priority as usize).min(NUM_RT_PRIORITIES - 1);
                    if self.rt_queues[idx].enqueue(task) {
                        self.rt_bitmap |= 1 << idx;
                        true
                    } else {
                        false
                    }
                }
                SchedClass::Normal => {
                    let idx = ((task_ref.priority as usize).saturating_sub(30) / 10)
                        .min(NUM_NORMAL_PRIORITIES - 1);
                    if self.normal_queues[idx].enqueue(task) {
                        self.normal_bitmap |= 1 << idx;
                        true
                    } else {
                        false
                    }
                }
                SchedClass::Idle => {
                    if self.idle_queue.enqueue(task) {
                        self.idle_flag = true;
                        true
                    } else {
                        false
                    }
                }
            }
        }
    }

    /// Dequeue highest priority task
    pub fn dequeue(&mut self) -> Option<NonNull<Task>> {
        // Check real-time queues first
        if self.rt_bitmap != 0 {
            let idx = self.rt_bitmap.trailing_zeros() as usize;
            if let Some(task) = self.rt_queues[idx].dequeue() {
                if self.rt_queues[idx].is_empty() {
                    self.rt_bitmap &= !(1 << idx);
                }
                return Some(task);
            }
        }

        // Check normal queues
        if self.normal_bitmap != 0 {
            let idx = self.normal_bitmap.trailing_zeros() as usize;
            if let Some(task) = self.normal_queues[idx].dequeue() {
                if self.normal_queues[idx].is_empty() {
                    self.normal_bitmap &= !(1 << idx);
                }
                return Some(task);
            }
        }

        // Check idle queue
        if self.idle_flag {
            if let Some(task) = self.idle_queue.dequeue() {
                if self.idle_queue.is_empty() {
                    self.idle_flag = false;
                }
                return Some(task);
            }
        }

        None
    }

    /// Remove specific task from queues
    pub fn remove(&mut self, task: NonNull<Task>) -> bool {
        unsafe {
            let task_ref = task.as_ref();
            match task_ref.sched_class {
                SchedClass::RealTime => {
                    let idx = (task_ref.priority as usize).min(NUM_RT_PRIORITIES - 1);
                    let removed = self.rt_queues[idx].remove(task);
                    if removed && self.rt_queues[idx].is_empty() {
                        self.rt_bitmap &= !(1 << idx);
                    }
                    removed
                }
                SchedClass::Normal => {
                    let idx = ((task_ref.priority as usize).saturating_sub(30) / 10)
                        .min(NUM_NORMAL_PRIORITIES - 1);
                    let removed = self.normal_queues[idx].remove(task);
                    if removed && self.normal_queues[idx].is_empty() {
                        self.normal_bitmap &= !(1 << idx);
                    }
                    removed
                }
                SchedClass::Idle => {
                    let removed = self.idle_queue.remove(task);
                    if removed && self.idle_queue.is_empty() {
                        self.idle_flag = false;
                    }
                    removed
                }
            }
        }
    }

    /// Check if any tasks are ready
    pub fn has_ready_tasks(&self) -> bool {
        self.rt_bitmap != 0 || self.normal_bitmap != 0 || self.idle_flag
    }
}

/// EEVDF run queue .
///
/// The spec calls for an augmented red-black tree keyed by `vdeadline`
/// with a per-subtree cached minimum `veligible`. The teacher's own CFS
/// runqueue (the code this type replaces) already makes the equivalent
/// simplification of flattening an augmented tree into a `BTreeMap`; this
/// keeps that precedent; see `DESIGN.md`'s runqueue Open Question for the
/// resulting Big-O tradeoff (selection is `O(n)` over the runnable set
/// rather than `O(log n)` with subtree pruning).
#[cfg(feature = "alloc")]
pub struct EevdfRunQueue {
    /// Tasks keyed by `(vdeadline, tid)`; the tid breaks ties on equal
    /// deadlines with a stable per-thread ordering .
    by_deadline: BTreeMap<(VClock, u64), TaskPtr>,
    /// The scheduler's virtual time, advanced by the owning
    /// [`super::scheduler::Scheduler`] on every tick/submit.
    vtime: VClock,
    /// Sum of weights of all runnable clients (`W` in ).
    total_weight: u64,
}

#[cfg(feature = "alloc")]
impl EevdfRunQueue {
    /// Create new empty EEVDF run queue
    pub fn new() -> Self {
        Self {
            by_deadline: BTreeMap::new(),
            vtime: VClock::ZERO,
            total_weight: 0,
        }
    }

    pub fn vtime(&self) -> VClock {
        self.vtime
    }

    pub fn total_weight(&self) -> u64 {
        self.total_weight
    }

    pub fn is_empty(&self) -> bool {
        self.by_deadline.is_empty()
    }

    pub fn len(&self) -> usize {
        self.by_deadline.len()
    }

    /// Advance virtual time by real-time delta `dt_ticks`,
    /// §4.4: `vtime += Q * dt / W`. No-op while the queue is empty.
    pub fn advance(&mut self, dt_ticks: u64) {
        if self.total_weight == 0 || dt_ticks == 0 {
            return;
        }
        self.vtime += VClock::scaled(dt_ticks, self.total_weight);
    }

    /// Insert a client, assigning its `vdeadline` from its current
    /// `veligible`/`weight`. Tasks new to the runqueue become eligible
    /// immediately (`veligible = vtime`) unless they already carry lag
    /// from a previous run.
    pub fn enqueue(&mut self, task: NonNull<Task>) {
        unsafe {
            let task_mut = task.as_ptr();
            let tid = (*task_mut).tid;
            (*task_mut).vdeadline =
                super::task::recompute_deadline((*task_mut).veligible, (*task_mut).weight);
            (*task_mut).vmin_eligible = (*task_mut).veligible;
            self.total_weight += (*task_mut).weight;
            self.by_deadline
                .insert(((*task_mut).vdeadline, tid), TaskPtr::new(task));
        }
    }

    /// Select and remove the eligible client with the earliest
    /// `vdeadline` ( "leftmost node whose subtree contains an
    /// eligible client").
    pub fn dequeue(&mut self) -> Option<NonNull<Task>> {
        let key = self.by_deadline.iter().find_map(|(key, ptr)| {
            let veligible = unsafe { ptr.as_ptr().as_ref().veligible };
            veligible.eligible_at(self.vtime).then_some(*key)
        })?;

        let task_ptr = self.by_deadline.remove(&key)?;
        unsafe {
            self.total_weight = self
                .total_weight
                .saturating_sub(task_ptr.as_ptr().as_ref().weight);
        }
        Some(task_ptr.as_ptr())
    }

    /// Remove a specific client (used when it blocks, is migrated, or
    /// dies while still runnable).
    pub fn remove(&mut self, target: NonNull<Task>) -> bool {
        unsafe {
            let target_ref = target.as_ref();
            let key = (target_ref.vdeadline, target_ref.tid);
            if self.by_deadline.remove(&key).is_some() {
                self.total_weight = self.total_weight.saturating_sub(target_ref.weight);
                true
            } else {
                false
            }
        }
    }

    /// Global minimum `veligible` across the runqueue; stands in for the
    /// per-subtree cached minimum the augmented tree would track (spec
    /// §8's `veligible >= vminEligible` invariant, checked here at
    /// whole-queue granularity).
    pub fn min_eligible(&self) -> Option<VClock> {
        self.by_deadline
            .values()
            .map(|ptr| unsafe { ptr.as_ptr().as_ref().veligible })
            .min()
    }

    /// Unlink and return the first client whose working set has gone
    /// cache-cold (`now - slice_stop >= threshold`), used by the pull-at-idle
    /// side of load balancing . Clients are visited in
    /// `(vdeadline, tid)` order, so a CPU with several cold clients gives up
    /// the one closest to running next.
    pub fn take_cache_cold(&mut self, now: u64, threshold: u64) -> Option<NonNull<Task>> {
        let key = self.by_deadline.iter().find_map(|(key, ptr)| {
            let cold = unsafe { now.saturating_sub(ptr.as_ptr().as_ref().slice_stop) >= threshold };
            cold.then_some(*key)
        })?;
        let task_ptr = self.by_deadline.remove(&key)?;
        unsafe {
            self.total_weight = self
                .total_weight
                .saturating_sub(task_ptr.as_ptr().as_ref().weight);
        }
        Some(task_ptr.as_ptr())
    }
}

impl Default for PriorityQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Default for ReadyQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "alloc")]
impl Default for EevdfRunQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Maximum tasks per priority queue
const MAX_TASKS_PER_QUEUE: usize = 256;

/// Number of real-time priority levels
const NUM_RT_PRIORITIES: usize = 30;

/// Number of normal priority levels
const NUM_NORMAL_PRIORITIES: usize = 4;

/// Global ready queue protected by mutex
#[cfg(not(target_arch = "riscv64"))]
pub static READY_QUEUE: Mutex<ReadyQueue> = Mutex::new(ReadyQueue::new());

/// Global ready queue for RISC-V (avoiding spin::Mutex issues)
#[cfg(target_arch = "riscv64")]
pub static mut READY_QUEUE_STATIC: Option<alloc::boxed::Box<ReadyQueue>> = None;

/// Per-CPU ready queues for SMP
#[cfg(feature = "smp")]
pub static PER_CPU_QUEUES: [Mutex<ReadyQueue>; MAX_CPUS] =
    [const { Mutex::new(ReadyQueue::new()) }; MAX_CPUS];

/// Maximum number of CPUs supported
#[cfg(feature = "smp")]
pub const MAX_CPUS: usize = 64;

/// Get the global ready queue (architecture-specific)
#[cfg(target_arch = "riscv64")]
pub fn get_ready_queue() -> &'static mut ReadyQueue {
    unsafe {
        if READY_QUEUE_STATIC.is_none() {
            // Initialize the ready queue
            #[cfg(feature = "alloc")]
            {
                let queue = alloc::boxed::Box::new(ReadyQueue::new());
                READY_QUEUE_STATIC = Some(queue);
            }
            #[cfg(not(feature = "alloc"))]
            {
                panic!("Cannot initialize ready queue without alloc feature");
            }
        }
        READY_QUEUE_STATIC.as_mut().unwrap().as_mut()
    }
}

/// Initialize the ready queue for RISC-V
#[cfg(target_arch = "riscv64")]
pub fn init_ready_queue() {
    unsafe {
        if READY_QUEUE_STATIC.is_none() {
            #[cfg(feature = "alloc")]
            {
                crate::println!("[SCHED] Initializing RISC-V ready queue...");
                let queue = alloc::boxed::Box::new(ReadyQueue::new());
                READY_QUEUE_STATIC = Some(queue);
                crate::println!("[SCHED] RISC-V ready queue initialized");
            }
        }
    }
}

#[cfg(test)]
#[cfg(feature = "alloc")]
mod eevdf_tests {
    use alloc::boxed::Box;
    use core::ptr::NonNull;

    use super::*;
    use crate::process::{ProcessId, ThreadId};

    fn leaked_task(tid: u64, weight: u64) -> NonNull<Task> {
        let mut task = Box::new(Task::new(
            ProcessId(1),
            ThreadId(tid),
            alloc::string::String::new(),
            0,
            0,
            0,
        ));
        task.weight = weight;
        NonNull::new(Box::leak(task) as *mut _).unwrap()
    }

    #[test]
    fn equal_weight_clients_alternate_fairly() {
        let mut rq = EevdfRunQueue::new();
        let a = leaked_task(1, 10);
        let b = leaked_task(2, 10);
        rq.enqueue(a);
        rq.enqueue(b);

        // Both start eligible at vtime=0; earliest vdeadline (tie broken
        // by tid) runs first.
        let first = rq.dequeue().unwrap();
        assert_eq!(unsafe { first.as_ref().tid }, 1);

        // Simulate A having run: its veligible advances past B's.
        unsafe {
            let a_mut = first.as_ptr();
            (*a_mut).veligible += VClock::scaled(5, 10);
        }
        rq.enqueue(first);
        rq.advance(5);

        let second = rq.dequeue().unwrap();
        assert_eq!(unsafe { second.as_ref().tid }, 2);
    }

    #[test]
    fn dequeue_skips_ineligible_client() {
        let mut rq = EevdfRunQueue::new();
        let a = leaked_task(1, 10);
        let b = leaked_task(2, 10);
        unsafe {
            // B is far in the future, not yet eligible.
            (*b.as_ptr()).veligible = VClock::from_ticks(1000);
        }
        rq.enqueue(a);
        rq.enqueue(b);

        let picked = rq.dequeue().unwrap();
        assert_eq!(unsafe { picked.as_ref().tid }, 1);
        assert_eq!(rq.len(), 1);
    }
}
