//! Tasks, the scheduler, processes, and their cleanup.

use alloc::sync::Arc;

use hashbrown::HashMap;

use crate::error::KernelError;
use crate::sync::RwLock;

pub mod cleanup;
pub mod process;
pub mod scheduler;
pub mod task;

#[cfg(test)]
pub(crate) mod testing;

pub use self::process::{Process, ProcessId};
pub use self::task::{Priority, Task, TaskId, TaskState};

lazy_static::lazy_static! {
    /// All kernel-owned tasks (user tasks live in their process's thread
    /// table instead)
    static ref KERNEL_TASKS: RwLock<HashMap<TaskId, Arc<Task>>> = RwLock::new(HashMap::new());
}

/// Spawn a kernel task and make it runnable.
pub fn create_kernel_task(
    name: &str,
    priority: Priority,
    entry: task::TaskEntry,
    arg: usize,
) -> Result<Arc<Task>, KernelError> {
    use alloc::string::ToString;

    let task = Task::new_kernel(name.to_string(), priority, entry, arg)?;
    KERNEL_TASKS.write().insert(task.id(), task.clone());
    scheduler::ready(task.clone());
    log::debug!("Spawned kernel task {} ({})", task.id(), name);
    Ok(task)
}

pub fn kernel_task_count() -> usize {
    KERNEL_TASKS.read().len()
}

pub(super) fn remove_kernel_task(id: TaskId) -> bool {
    KERNEL_TASKS.write().remove(&id).is_some()
}
