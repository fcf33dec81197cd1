//! Per-CPU executor records.
//!
//! Exactly one executor exists per CPU. The set is built once during init
//! and sealed; the bootstrap executor is a static so panics have a home
//! before the heap exists. The architecture adapter stores the binding in
//! a per-CPU register, which makes `current()` a single register read.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicPtr, Ordering};

use spin::Once;

use crate::arch;
use crate::multitasking::task::Task;

/// Raw id reported when no executor is bound yet.
pub const UNBOUND_ID_RAW: u32 = u32::MAX;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ExecutorId(u32);

impl ExecutorId {
    pub const BOOTSTRAP: ExecutorId = ExecutorId(0);

    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ExecutorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub struct Executor {
    id: ExecutorId,
    /// The task running on this CPU. Written only by the scheduler during
    /// a switch, with the scheduler lock held.
    current_task: AtomicPtr<Task>,
    /// This executor's idle task; set once in stage 3
    scheduler_task: Once<Arc<Task>>,
    /// An exited task whose final switch has not completed yet; the
    /// incoming side hands it to the cleanup service
    pub(crate) pending_exit: AtomicPtr<Task>,
}

impl Executor {
    pub const fn new(id: ExecutorId) -> Self {
        Self {
            id,
            current_task: AtomicPtr::new(core::ptr::null_mut()),
            scheduler_task: Once::new(),
            pending_exit: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    pub fn id(&self) -> ExecutorId {
        self.id
    }

    pub(crate) fn set_scheduler_task(&self, task: Arc<Task>) {
        self.scheduler_task.call_once(|| task);
    }

    pub(crate) fn scheduler_task(&self) -> Option<&Arc<Task>> {
        self.scheduler_task.get()
    }

    /// Install `task` as the running task, returning the previous one.
    ///
    /// # Safety
    /// Caller must hold the scheduler lock and be running on this executor.
    pub(crate) unsafe fn swap_current_task(&self, task: Option<Arc<Task>>) -> Option<Arc<Task>> {
        let new = match task {
            Some(task) => Arc::into_raw(task) as *mut Task,
            None => core::ptr::null_mut(),
        };
        let previous = self.current_task.swap(new, Ordering::AcqRel);
        if previous.is_null() {
            None
        } else {
            Some(Arc::from_raw(previous))
        }
    }
}

/// Constructed statically so the boot CPU can take meaningful panics
/// before anything is initialized.
static BOOTSTRAP_EXECUTOR: Executor = Executor::new(ExecutorId::BOOTSTRAP);

/// All executors, allocated once in stage 1 and never resized.
static EXECUTORS: Once<Box<[Executor]>> = Once::new();

/// Bind the boot CPU to the static bootstrap record. First thing stage 1
/// does.
pub fn bind_bootstrap_early() {
    arch::bind_executor(&BOOTSTRAP_EXECUTOR);
}

/// Allocate and seal the executor set.
pub fn init_executors(count: usize) {
    assert!(count >= 1);
    EXECUTORS.call_once(|| {
        (0..count as u32)
            .map(|id| Executor::new(ExecutorId::new(id)))
            .collect()
    });
}

pub fn all() -> &'static [Executor] {
    EXECUTORS.get().expect("executors used before stage1")
}

pub fn get(id: ExecutorId) -> &'static Executor {
    &all()[id.as_u32() as usize]
}

/// Bind the calling CPU to its sealed executor record.
pub fn bind(id: ExecutorId) {
    arch::bind_executor(get(id));
}

pub fn current() -> Option<&'static Executor> {
    let ptr = arch::current_executor_ptr();
    if ptr.is_null() {
        None
    } else {
        // Executors are statics or sealed leaked allocations.
        Some(unsafe { &*ptr })
    }
}

pub fn current_id_raw() -> u32 {
    match current() {
        Some(executor) => executor.id().as_u32(),
        None => UNBOUND_ID_RAW,
    }
}

pub(crate) fn with_current_task<R>(f: impl FnOnce(&Task) -> R) -> Option<R> {
    let executor = current()?;
    let ptr = executor.current_task.load(Ordering::Acquire);
    if ptr.is_null() {
        return None;
    }
    // The running task is pinned for as long as it is current; cleanup
    // never destroys a task that is still scheduled.
    Some(f(unsafe { &*ptr }))
}

pub(crate) fn current_task_cloned() -> Option<Arc<Task>> {
    let executor = current()?;
    let ptr = executor.current_task.load(Ordering::Acquire);
    if ptr.is_null() {
        return None;
    }
    unsafe {
        Arc::increment_strong_count(ptr);
        Some(Arc::from_raw(ptr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn executor_set_is_sealed_after_init() {
        init_executors(4);
        // A later init cannot resize the set.
        init_executors(9);

        assert_eq!(all().len(), 4);
        for (index, executor) in all().iter().enumerate() {
            assert_eq!(executor.id().as_u32() as usize, index);
        }
        assert!(get(ExecutorId::new(2)).scheduler_task().is_none());
    }

    #[test]
    fn current_task_swaps_round_trip() {
        let executor = testing::bind_test_executor(77);
        assert_eq!(current_id_raw(), 77);

        let task = crate::multitasking::testing::spawn_floating_task("swapped");
        assert!(testing::install_current_task(executor, task.clone()).is_none());
        assert_eq!(
            with_current_task(|current| current.id()),
            Some(task.id())
        );

        let back = testing::clear_current_task(executor).unwrap();
        assert!(Arc::ptr_eq(&back, &task));
        assert!(with_current_task(|_| ()).is_none());

        testing::unbind();
        assert_eq!(current_id_raw(), UNBOUND_ID_RAW);
    }
}
