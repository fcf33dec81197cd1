//! Userspace process container.
//!
//! A process owns an address space and a set of user tasks. Every live
//! thread holds one logical reference; the process-cleanup service
//! destroys the process once the last reference is released.

use alloc::string::String;
use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use hashbrown::HashMap;

use crate::error::KernelError;
use crate::memory::address_space::AddressSpace;
use crate::sync::{LifoNode, RwLock};

use super::cleanup;
use super::scheduler;
use super::task::{Task, TaskEntry, TaskId};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ProcessId(u64);

impl ProcessId {
    fn allocate() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub struct Process {
    id: ProcessId,
    name: String,
    /// Logical reference count: one per live thread plus one per
    /// transient holder. Zero queues the process for cleanup.
    refcount: AtomicUsize,
    address_space: AddressSpace,
    threads: RwLock<HashMap<TaskId, Arc<Task>>>,
    next_thread_ordinal: AtomicU32,
    pub(super) queued_for_cleanup: AtomicBool,
    pub(super) cleanup_next: AtomicPtr<Process>,
}

impl LifoNode for Process {
    fn lifo_next(&self) -> &AtomicPtr<Process> {
        &self.cleanup_next
    }
}

lazy_static::lazy_static! {
    /// All live processes
    static ref PROCESS_TABLE: RwLock<HashMap<ProcessId, Arc<Process>>> =
        RwLock::new(HashMap::new());
}

impl Process {
    /// Create an empty process with a fresh user address space and one
    /// logical reference (the caller's).
    pub fn create(name: String) -> Result<Arc<Process>, KernelError> {
        let address_space = AddressSpace::new_user(name.clone())?;

        let process = Arc::new(Process {
            id: ProcessId::allocate(),
            name,
            refcount: AtomicUsize::new(1),
            address_space,
            threads: RwLock::new(HashMap::new()),
            next_thread_ordinal: AtomicU32::new(0),
            queued_for_cleanup: AtomicBool::new(false),
            cleanup_next: AtomicPtr::new(core::ptr::null_mut()),
        });

        PROCESS_TABLE.write().insert(process.id, process.clone());
        log::debug!("Created process {} ({})", process.id, process.name);
        Ok(process)
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address_space(&self) -> &AddressSpace {
        &self.address_space
    }

    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }

    pub fn retain(&self) {
        let previous = self.refcount.fetch_add(1, Ordering::AcqRel);
        debug_assert!(previous != 0, "retain of a destroyed process");
    }

    pub fn thread_count(&self) -> usize {
        self.threads.read().len()
    }

    /// Spawn a user task in this process and make it runnable. The
    /// thread holds one process reference until it is reaped.
    pub fn create_thread(
        self: &Arc<Process>,
        entry: TaskEntry,
        arg: usize,
    ) -> Result<Arc<Task>, KernelError> {
        use alloc::format;

        let ordinal = self.next_thread_ordinal.fetch_add(1, Ordering::Relaxed);
        let task = Task::new_user(
            format!("{}/{}", self.name, ordinal),
            self.clone(),
            entry,
            arg,
        )?;

        self.retain();
        self.threads.write().insert(task.id(), task.clone());
        scheduler::ready(task.clone());
        Ok(task)
    }

    /// Drop a thread's table entry during task cleanup. Returns whether
    /// it was present.
    pub(super) fn remove_thread(&self, id: TaskId) -> bool {
        self.threads.write().remove(&id).is_some()
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

pub fn process_by_id(id: ProcessId) -> Option<Arc<Process>> {
    PROCESS_TABLE.read().get(&id).cloned()
}

pub fn process_count() -> usize {
    PROCESS_TABLE.read().len()
}

/// Release one logical reference; the last one queues the process for
/// the cleanup service.
pub fn release(process: &Arc<Process>) {
    let previous = process.refcount.fetch_sub(1, Ordering::AcqRel);
    debug_assert!(previous != 0, "release of a destroyed process");
    if previous == 1 {
        cleanup::queue_process_for_cleanup(process.clone());
    }
}

/// Final teardown, called by the cleanup service only.
pub(super) fn destroy(process: &Arc<Process>) {
    log::debug!("Destroying process {} ({})", process.id, process.name);
    debug_assert_eq!(process.thread_count(), 0);
    process.address_space.reinitialize_and_unmap_all();
    PROCESS_TABLE.write().remove(&process.id);
}
