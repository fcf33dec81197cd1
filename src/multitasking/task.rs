//! Kernel execution contexts.

use alloc::alloc::{alloc, dealloc, Layout};
use alloc::string::String;
use alloc::sync::Arc;
use core::cell::UnsafeCell;
use core::fmt;
use core::sync::atomic::{
    AtomicBool, AtomicPtr, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering,
};

use crate::arch;
use crate::error::KernelError;
use crate::executor;
use crate::memory::addr::VirtAddr;
use crate::memory::constants::{KERNEL_STACK_PAGES, PAGE_SIZE_BYTES};
use crate::multitasking::process::Process;
use crate::multitasking::{cleanup, scheduler};
use crate::sync::WaitQueue;

/// Task identifier, unique for the lifetime of the system.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct TaskId(u64);

impl TaskId {
    pub(super) fn allocate() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    Ready = 0,
    Running = 1,
    Blocked = 2,
    Dropped = 3,
}

impl TaskState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Ready,
            1 => Self::Running,
            2 => Self::Blocked,
            3 => Self::Dropped,
            _ => unreachable!("invalid task state"),
        }
    }
}

/// Scheduling priority. Carried on every task; the round-robin queue
/// currently treats all non-idle priorities alike.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Idle,
    BackgroundKernel,
    User,
    NormalKernel,
}

/// Who the task belongs to.
pub enum TaskEnvironment {
    Kernel,
    User(Arc<Process>),
}

impl fmt::Debug for TaskEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kernel => f.write_str("Kernel"),
            Self::User(process) => write!(f, "User({})", process.name()),
        }
    }
}

/// Heap-backed kernel stack.
pub struct KernelStack {
    base: *mut u8,
    layout: Layout,
}

unsafe impl Send for KernelStack {}
unsafe impl Sync for KernelStack {}

impl KernelStack {
    const SIZE_BYTES: usize = (KERNEL_STACK_PAGES * PAGE_SIZE_BYTES) as usize;

    pub fn allocate() -> Result<Self, KernelError> {
        let layout = Layout::from_size_align(Self::SIZE_BYTES, 16)
            .map_err(|_| KernelError::BadArgument)?;
        let base = unsafe { alloc(layout) };
        if base.is_null() {
            return Err(KernelError::OutOfMemory);
        }
        Ok(Self { base, layout })
    }

    pub fn top(&self) -> VirtAddr {
        VirtAddr::new(self.base as u64 + Self::SIZE_BYTES as u64)
    }
}

impl Drop for KernelStack {
    fn drop(&mut self) {
        unsafe { dealloc(self.base, self.layout) }
    }
}

pub type TaskEntry = fn(usize);

pub struct Task {
    id: TaskId,
    name: String,
    priority: Priority,
    environment: TaskEnvironment,
    #[allow(dead_code)]
    stack: KernelStack,
    /// Saved register context; touched only by the scheduler during a
    /// switch, while the scheduler lock is held
    pub(crate) context: UnsafeCell<arch::Context>,
    entry: Option<(TaskEntry, usize)>,

    state: AtomicU8,
    /// Logical reference count held by transient users of the task.
    /// Table membership is not counted; the cleanup service only destroys
    /// a dropped task whose count is zero.
    refcount: AtomicUsize,

    // Scheduling discipline; only the task's own executor mutates these.
    interrupt_disable_count: AtomicU32,
    preemption_disable_count: AtomicU32,
    preemption_skipped: AtomicBool,
    spinlocks_held: AtomicU32,
    scheduler_locked: AtomicBool,

    /// Interrupt state to restore when this task next finishes a switch
    pub(super) saved_interrupts_enabled: AtomicBool,
    /// Wait structure currently holding this task, for cancellation and
    /// timeout removal. Valid only while `state == Blocked`.
    pub(crate) blocked_on: AtomicPtr<WaitQueue>,
    /// Incremented at every block; lets stale timeout entries detect that
    /// the sleep they belong to is over
    pub(crate) block_epoch: AtomicU64,
    /// Set when a wake came from the timeout path
    pub(crate) woken_by_timeout: AtomicBool,

    /// The task has permanently left its executor; set by the switch
    /// completion path right before the task is queued for cleanup.
    /// Destruction requires it, so a stack is never freed while live.
    pub(super) unscheduled: AtomicBool,
    pub(super) queued_for_cleanup: AtomicBool,
    pub(super) cleanup_next: AtomicPtr<Task>,
}

unsafe impl Send for Task {}
unsafe impl Sync for Task {}

impl Task {
    fn new(
        name: String,
        priority: Priority,
        environment: TaskEnvironment,
        entry: Option<(TaskEntry, usize)>,
    ) -> Result<Arc<Self>, KernelError> {
        let stack = KernelStack::allocate()?;
        let context = arch::new_task_context(stack.top(), scheduler::task_startup);

        Ok(Arc::new(Self {
            id: TaskId::allocate(),
            name,
            priority,
            environment,
            stack,
            context: UnsafeCell::new(context),
            entry,
            state: AtomicU8::new(TaskState::Ready as u8),
            refcount: AtomicUsize::new(0),
            interrupt_disable_count: AtomicU32::new(0),
            preemption_disable_count: AtomicU32::new(0),
            preemption_skipped: AtomicBool::new(false),
            spinlocks_held: AtomicU32::new(0),
            scheduler_locked: AtomicBool::new(false),
            saved_interrupts_enabled: AtomicBool::new(true),
            blocked_on: AtomicPtr::new(core::ptr::null_mut()),
            block_epoch: AtomicU64::new(0),
            woken_by_timeout: AtomicBool::new(false),
            unscheduled: AtomicBool::new(false),
            queued_for_cleanup: AtomicBool::new(false),
            cleanup_next: AtomicPtr::new(core::ptr::null_mut()),
        }))
    }

    pub(super) fn new_kernel(
        name: String,
        priority: Priority,
        entry: TaskEntry,
        arg: usize,
    ) -> Result<Arc<Self>, KernelError> {
        Self::new(name, priority, TaskEnvironment::Kernel, Some((entry, arg)))
    }

    pub(super) fn new_user(
        name: String,
        process: Arc<Process>,
        entry: TaskEntry,
        arg: usize,
    ) -> Result<Arc<Self>, KernelError> {
        Self::new(
            name,
            Priority::User,
            TaskEnvironment::User(process),
            Some((entry, arg)),
        )
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn environment(&self) -> &TaskEnvironment {
        &self.environment
    }

    pub(super) fn entry(&self) -> Option<(TaskEntry, usize)> {
        self.entry
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        self.state.store(state as u8, Ordering::Release)
    }

    /// Set the state unless the task has been dropped; a concurrent
    /// cancellation always wins.
    pub(crate) fn set_state_if_not_dropped(&self, state: TaskState) {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current == TaskState::Dropped as u8 {
                return;
            }
            match self.state.compare_exchange_weak(
                current,
                state as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(now) => current = now,
            }
        }
    }

    /// CAS one state transition; returns whether it happened.
    pub(crate) fn transition(&self, from: TaskState, to: TaskState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Move to `Dropped` from whatever non-dropped state the task is in.
    /// Returns the state it left, or `None` if it was already dropped.
    pub(crate) fn drop_state(&self) -> Option<TaskState> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current == TaskState::Dropped as u8 {
                return None;
            }
            match self.state.compare_exchange_weak(
                current,
                TaskState::Dropped as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(TaskState::from_u8(current)),
                Err(now) => current = now,
            }
        }
    }

    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }

    /// Take another logical reference. The task must be known live.
    pub fn retain(&self) {
        let previous = self.refcount.fetch_add(1, Ordering::AcqRel);
        debug_assert!(previous != 0, "retain of a destroyed task");
    }

    pub(super) fn refcount_dec(&self) -> usize {
        let previous = self.refcount.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous != 0, "release of a destroyed task");
        previous - 1
    }

    pub(super) fn is_preemption_blocked(&self) -> bool {
        self.interrupt_disable_count.load(Ordering::Relaxed) != 0
            || self.preemption_disable_count.load(Ordering::Relaxed) != 0
            || self.spinlocks_held.load(Ordering::Relaxed) != 0
            || self.scheduler_locked.load(Ordering::Relaxed)
    }

    pub(super) fn set_preemption_skipped(&self) {
        self.preemption_skipped.store(true, Ordering::Relaxed);
    }

    pub(crate) fn preemption_skipped_pending(&self) -> bool {
        self.preemption_skipped.load(Ordering::Relaxed)
    }

    pub fn lock_scheduler(&self) {
        self.scheduler_locked.store(true, Ordering::Relaxed);
    }

    pub fn unlock_scheduler(&self) {
        self.scheduler_locked.store(false, Ordering::Relaxed);
        deferred_preempt_check();
    }

    pub fn spinlocks_held(&self) -> u32 {
        self.spinlocks_held.load(Ordering::Relaxed)
    }

    pub fn interrupt_disable_count(&self) -> u32 {
        self.interrupt_disable_count.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

/// Release one logical reference. If the task has been dropped, has left
/// its executor for good, and this was the last reference, hand it
/// (back) to the cleanup service.
pub fn release(task: &Arc<Task>) {
    if task.refcount_dec() == 0
        && task.state() == TaskState::Dropped
        && task.unscheduled.load(Ordering::Acquire)
    {
        cleanup::queue_task_for_cleanup(task.clone());
    }
}

/// Cancel a task: transition to dropped and, if it was blocked, pull it
/// out of the structure holding it so it gets a chance to exit.
pub fn cancel(task: &Arc<Task>) {
    let previous = match task.drop_state() {
        Some(state) => state,
        // Already dropped
        None => return,
    };

    if previous == TaskState::Blocked {
        let queue = task.blocked_on.load(Ordering::Acquire);
        if !queue.is_null() {
            // The queue outlives its waiters, so the pointer is live.
            let removed = unsafe { (*queue).remove(task) };
            if removed {
                // Let it run to observe the cancellation.
                scheduler::ready_for_exit(task.clone());
            }
        }
    }
}

/// The task currently running on this executor.
pub fn current() -> Option<Arc<Task>> {
    executor::current_task_cloned()
}

// Per-task bookkeeping hooks used by the locking primitives. Outside a
// bound executor (early boot, host test threads) they are no-ops.

pub(crate) fn note_spinlock_acquire() {
    let _ = executor::with_current_task(|task| {
        task.interrupt_disable_count.fetch_add(1, Ordering::Relaxed);
        task.spinlocks_held.fetch_add(1, Ordering::Relaxed);
    });
}

pub(crate) fn note_spinlock_release() {
    let _ = executor::with_current_task(|task| {
        task.spinlocks_held.fetch_sub(1, Ordering::Relaxed);
        task.interrupt_disable_count.fetch_sub(1, Ordering::Relaxed);
    });
}

pub(crate) fn note_preemption_disable() {
    let _ = executor::with_current_task(|task| {
        task.preemption_disable_count.fetch_add(1, Ordering::Relaxed);
    });
}

pub(crate) fn note_preemption_enable() {
    let _ = executor::with_current_task(|task| {
        task.preemption_disable_count.fetch_sub(1, Ordering::Relaxed);
    });
    deferred_preempt_check();
}

/// Run a deferred preemption if a timer tick was swallowed while
/// preemption was blocked and every blocker is now gone.
pub(crate) fn deferred_preempt_check() {
    let due = executor::with_current_task(|task| {
        if task.is_preemption_blocked() {
            return false;
        }
        task.preemption_skipped.swap(false, Ordering::Relaxed)
    })
    .unwrap_or(false);

    if due && arch::interrupts_enabled() {
        scheduler::maybe_preempt();
    }
}

/// RAII preemption-disable region.
pub struct PreemptionGuard(());

impl PreemptionGuard {
    pub fn new() -> Self {
        note_preemption_disable();
        Self(())
    }
}

impl Default for PreemptionGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PreemptionGuard {
    fn drop(&mut self) {
        note_preemption_enable();
    }
}
