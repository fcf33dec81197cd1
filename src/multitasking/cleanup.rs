//! Background cleanup services.
//!
//! Two singleton kernel tasks drain intrusive LIFOs of dropped tasks and
//! dead processes into their destructors. Queueing is idempotent, cheap,
//! and callable from any context; the services do the heavy lifting in
//! task context where blocking on table locks is allowed.

use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use crate::sync::{AtomicLifo, LifoNode, Parker};

use super::process::{self, Process};
use super::task::{Task, TaskEnvironment, TaskState};
use super::{remove_kernel_task, Priority};

impl LifoNode for Task {
    fn lifo_next(&self) -> &core::sync::atomic::AtomicPtr<Task> {
        &self.cleanup_next
    }
}

static TASK_CLEANUP_QUEUE: AtomicLifo<Task> = AtomicLifo::new();
static TASK_CLEANUP_PARKER: Parker = Parker::new();

static PROCESS_CLEANUP_QUEUE: AtomicLifo<Process> = AtomicLifo::new();
static PROCESS_CLEANUP_PARKER: Parker = Parker::new();

/// Hand a dropped task to the task-cleanup service. Queueing the same
/// task twice is a no-op until the service requeues or destroys it.
pub fn queue_task_for_cleanup(task: Arc<Task>) {
    debug_assert_eq!(task.state(), TaskState::Dropped);
    if task
        .queued_for_cleanup
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }
    TASK_CLEANUP_QUEUE.push(task);
    TASK_CLEANUP_PARKER.unpark();
}

/// Hand a zero-reference process to the process-cleanup service.
pub fn queue_process_for_cleanup(process: Arc<Process>) {
    if process
        .queued_for_cleanup
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }
    PROCESS_CLEANUP_QUEUE.push(process);
    PROCESS_CLEANUP_PARKER.unpark();
}

/// Drain the task queue once. Returns how many tasks were destroyed.
pub(crate) fn drain_task_cleanup_queue() -> usize {
    let mut destroyed = 0;
    while let Some(task) = TASK_CLEANUP_QUEUE.pop() {
        if reap_task(task) {
            destroyed += 1;
        }
    }
    destroyed
}

/// Destroy one dropped task, unless it has been resurrected or is still
/// on its way off an executor.
fn reap_task(task: Arc<Task>) -> bool {
    // Resurrection: someone re-referenced the task after it was queued.
    // Leave it intact; the releasing path requeues it later.
    if task.refcount() != 0 || !task.unscheduled.load(Ordering::Acquire) {
        task.queued_for_cleanup.store(false, Ordering::Release);
        return false;
    }

    debug_assert_eq!(task.state(), TaskState::Dropped);
    log::trace!("Reaping task {} ({})", task.id(), task.name());

    match task.environment() {
        TaskEnvironment::Kernel => {
            remove_kernel_task(task.id());
        }
        TaskEnvironment::User(owner) => {
            owner.remove_thread(task.id());
            process::release(owner);
        }
    }
    // Storage goes away with the last Arc.
    true
}

/// Drain the process queue once. Returns how many were destroyed.
pub(crate) fn drain_process_cleanup_queue() -> usize {
    let mut destroyed = 0;
    while let Some(dead) = PROCESS_CLEANUP_QUEUE.pop() {
        if dead.refcount() != 0 {
            dead.queued_for_cleanup.store(false, Ordering::Release);
            continue;
        }
        process::destroy(&dead);
        destroyed += 1;
    }
    destroyed
}

fn task_cleanup_main(_arg: usize) {
    loop {
        TASK_CLEANUP_PARKER.park();
        drain_task_cleanup_queue();
    }
}

fn process_cleanup_main(_arg: usize) {
    loop {
        PROCESS_CLEANUP_PARKER.park();
        drain_process_cleanup_queue();
    }
}

/// Spawn both cleanup services. Stage 4 calls this once.
pub fn spawn_services() {
    super::create_kernel_task(
        "task-cleanup",
        Priority::BackgroundKernel,
        task_cleanup_main,
        0,
    )
    .expect("cannot spawn task-cleanup");
    super::create_kernel_task(
        "process-cleanup",
        Priority::BackgroundKernel,
        process_cleanup_main,
        0,
    )
    .expect("cannot spawn process-cleanup");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multitasking::task;
    use crate::multitasking::testing::spawn_floating_task;

    /// The cleanup queues are single-consumer; tests that drain them
    /// must not overlap.
    static DRAIN_SERIAL: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn make_dead(name: &str) -> Arc<Task> {
        let task = spawn_floating_task(name);
        let _ = task.drop_state();
        task.unscheduled.store(true, Ordering::Release);
        task
    }

    #[test]
    fn double_queue_is_idempotent() {
        let _serial = DRAIN_SERIAL.lock().unwrap();

        let dead = make_dead("double-queued");
        queue_task_for_cleanup(dead.clone());
        queue_task_for_cleanup(dead.clone());

        assert_eq!(drain_task_cleanup_queue(), 1);
    }

    #[test]
    fn resurrection_defers_destruction() {
        let _serial = DRAIN_SERIAL.lock().unwrap();

        let dead = make_dead("lazarus");
        // A concurrent path still holds a logical reference.
        dead.retain();
        queue_task_for_cleanup(dead.clone());

        // The service observes the reference and leaves the task intact.
        assert_eq!(drain_task_cleanup_queue(), 0);
        assert!(!dead.queued_for_cleanup.load(Ordering::Acquire));
        assert_eq!(dead.state(), TaskState::Dropped);

        // The holder lets go; the release path queues a second cycle.
        task::release(&dead);
        assert_eq!(drain_task_cleanup_queue(), 1);
    }

    #[test]
    fn process_cleanup_destroys_after_last_release() {
        let _serial = DRAIN_SERIAL.lock().unwrap();
        crate::memory::testing::init_global_pool();
        use crate::multitasking::process::{self, Process};
        use alloc::string::String;

        let before = process::process_count();
        let proc = Process::create(String::from("short-lived")).unwrap();
        assert_eq!(process::process_count(), before + 1);

        process::release(&proc);
        assert_eq!(drain_process_cleanup_queue(), 1);
        assert_eq!(process::process_count(), before);
    }

    #[test]
    fn reaping_a_user_thread_releases_its_process() {
        let _serial = DRAIN_SERIAL.lock().unwrap();
        crate::memory::testing::init_global_pool();
        use crate::multitasking::process::{self, Process};
        use alloc::string::String;

        fn thread_entry(_arg: usize) {}

        let proc = Process::create(String::from("threaded")).unwrap();
        let thread = proc.create_thread(thread_entry, 0).unwrap();
        assert_eq!(proc.refcount(), 2);
        assert_eq!(proc.thread_count(), 1);

        // The thread exits; its final switch completes.
        let _ = thread.drop_state();
        thread.unscheduled.store(true, Ordering::Release);
        queue_task_for_cleanup(thread.clone());
        assert_eq!(drain_task_cleanup_queue(), 1);

        assert_eq!(proc.thread_count(), 0);
        assert_eq!(proc.refcount(), 1);

        process::release(&proc);
        assert_eq!(drain_process_cleanup_queue(), 1);
    }

    #[test]
    fn still_scheduled_task_is_not_destroyed() {
        let _serial = DRAIN_SERIAL.lock().unwrap();

        let dying = spawn_floating_task("still-running");
        let _ = dying.drop_state();
        // Dropped but its final switch has not completed.
        queue_task_for_cleanup(dying.clone());
        assert_eq!(drain_task_cleanup_queue(), 0);

        dying.unscheduled.store(true, Ordering::Release);
        queue_task_for_cleanup(dying.clone());
        assert_eq!(drain_task_cleanup_queue(), 1);
    }
}
