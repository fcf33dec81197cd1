//! FIFO wait queue.
//!
//! The lost-wakeup-free rendezvous at the bottom of every sleeping
//! primitive. A waiter registers itself and blocks atomically with
//! respect to the queue's spinlock; a waker that takes the same lock
//! therefore either sees the registration or runs before the sleep
//! decision was made.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::ptr;
use core::sync::atomic::Ordering;

use crate::error::KernelError;
use crate::multitasking::scheduler;
use crate::multitasking::task::{self, Task, TaskState};
use crate::sync::TicketLock;
use crate::time::Instant;

pub struct WaitQueue {
    waiters: TicketLock<VecDeque<Arc<Task>>>,
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            waiters: TicketLock::new(VecDeque::new()),
        }
    }

    /// Block the current task until a waker hands the CPU back.
    ///
    /// Returns `Cancelled` if the task was cancelled while blocked.
    pub fn wait(&self) -> Result<(), KernelError> {
        self.wait_inner(None)
    }

    /// Like [`WaitQueue::wait`], but gives up at `deadline`.
    pub fn wait_deadline(&self, deadline: Instant) -> Result<(), KernelError> {
        self.wait_inner(Some(deadline))
    }

    fn wait_inner(&self, deadline: Option<Instant>) -> Result<(), KernelError> {
        assert!(
            scheduler::can_block(),
            "wait queue used from a non-blockable context"
        );
        let task = task::current().expect("wait without current task");

        let mut waiters = self.waiters.lock();
        task.block_epoch.fetch_add(1, Ordering::AcqRel);
        task.woken_by_timeout.store(false, Ordering::Release);
        task.blocked_on
            .store(self as *const WaitQueue as *mut WaitQueue, Ordering::Release);
        task.set_state(TaskState::Blocked);
        waiters.push_back(task.clone());

        if let Some(deadline) = deadline {
            scheduler::register_timeout(&task, deadline);
        }

        scheduler::block_current_releasing(waiters);

        // Woken up (or cancelled, or timed out).
        task.blocked_on.store(ptr::null_mut(), Ordering::Release);
        if task.state() == TaskState::Dropped {
            return Err(KernelError::Cancelled);
        }
        if task.woken_by_timeout.swap(false, Ordering::AcqRel) {
            return Err(KernelError::Timeout);
        }
        Ok(())
    }

    /// Wake the longest-waiting task. Returns it, already queued to the
    /// scheduler, or `None` if nobody was waiting.
    pub fn wake_one(&self) -> Option<Arc<Task>> {
        let task = self.waiters.lock().pop_front()?;
        task.blocked_on.store(ptr::null_mut(), Ordering::Release);
        scheduler::ready(task.clone());
        Some(task)
    }

    /// Wake every waiter, preserving FIFO order. Returns how many.
    pub fn wake_all(&self) -> usize {
        let mut woken = 0;
        while self.wake_one().is_some() {
            woken += 1;
        }
        woken
    }

    /// Forget a specific waiter, for cancellation and timeouts. Returns
    /// whether the task was still queued; the caller that got `true` owns
    /// the wakeup.
    pub fn remove(&self, task: &Arc<Task>) -> bool {
        let mut waiters = self.waiters.lock();
        match waiters.iter().position(|waiter| Arc::ptr_eq(waiter, task)) {
            Some(index) => {
                waiters.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.lock().len()
    }
}

impl Drop for WaitQueue {
    fn drop(&mut self) {
        debug_assert!(
            self.waiters.lock().is_empty(),
            "wait queue dropped with blocked waiters"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multitasking::testing::spawn_floating_task;

    #[test]
    fn wake_order_is_fifo() {
        let queue = WaitQueue::new();
        let mut expected = Vec::new();

        // Register 16 waiters in order, the way wait() would under its
        // lock, without suspending this (non-task) thread.
        for i in 0..16 {
            let task = spawn_floating_task(&alloc::format!("waiter-{}", i));
            task.set_state(TaskState::Blocked);
            queue.waiters.lock().push_back(task.clone());
            expected.push(task.id());
        }

        let mut woken = Vec::new();
        for _ in 0..16 {
            let task = queue.wake_one().expect("a waiter was lost");
            assert_eq!(task.state(), TaskState::Ready);
            woken.push(task.id());
        }

        assert_eq!(woken, expected);
        assert!(queue.wake_one().is_none(), "a wakeup was doubled");
    }

    #[test]
    fn cancelling_a_blocked_waiter_pulls_it_off_the_queue() {
        use crate::multitasking::task;

        let queue = WaitQueue::new();
        let victim = spawn_floating_task("cancel-me");

        // Registered the way wait() would leave it.
        victim.block_epoch.fetch_add(1, Ordering::AcqRel);
        victim
            .blocked_on
            .store(&queue as *const WaitQueue as *mut WaitQueue, Ordering::Release);
        victim.set_state(TaskState::Blocked);
        queue.waiters.lock().push_back(victim.clone());

        task::cancel(&victim);

        assert_eq!(victim.state(), TaskState::Dropped);
        assert_eq!(queue.waiter_count(), 0, "cancelled waiter was not forgotten");
        assert!(queue.wake_one().is_none());

        // Cancelling again is a no-op.
        task::cancel(&victim);
        assert_eq!(victim.state(), TaskState::Dropped);
    }

    #[test]
    fn timeout_wakes_the_waiter_with_the_flag_set() {
        use crate::multitasking::scheduler::{register_timeout, wake_due_sleepers};
        use crate::time::Instant;

        let queue = WaitQueue::new();
        let waiter = spawn_floating_task("deadline");

        // Registered the way wait_deadline() would leave it.
        waiter.block_epoch.fetch_add(1, Ordering::AcqRel);
        waiter.woken_by_timeout.store(false, Ordering::Release);
        waiter
            .blocked_on
            .store(&queue as *const WaitQueue as *mut WaitQueue, Ordering::Release);
        waiter.set_state(TaskState::Blocked);
        queue.waiters.lock().push_back(waiter.clone());
        register_timeout(&waiter, Instant::from_nanos(50));

        wake_due_sleepers(Instant::from_nanos(100));

        assert_eq!(waiter.state(), TaskState::Ready);
        assert!(waiter.woken_by_timeout.load(Ordering::Acquire));
        assert_eq!(queue.waiter_count(), 0, "timeout left the waiter queued");
        waiter.blocked_on.store(core::ptr::null_mut(), Ordering::Release);

        // A stale deadline from a block that already ended is ignored.
        register_timeout(&waiter, Instant::from_nanos(150));
        waiter.block_epoch.fetch_add(1, Ordering::AcqRel);
        waiter.woken_by_timeout.store(false, Ordering::Release);
        wake_due_sleepers(Instant::from_nanos(200));
        assert!(!waiter.woken_by_timeout.load(Ordering::Acquire));
    }

    #[test]
    fn remove_forgets_a_waiter() {
        let queue = WaitQueue::new();
        let first = spawn_floating_task("removed");
        let second = spawn_floating_task("kept");
        first.set_state(TaskState::Blocked);
        second.set_state(TaskState::Blocked);
        queue.waiters.lock().push_back(first.clone());
        queue.waiters.lock().push_back(second.clone());

        assert!(queue.remove(&first));
        assert!(!queue.remove(&first), "double removal must report false");

        let woken = queue.wake_one().unwrap();
        assert!(Arc::ptr_eq(&woken, &second));
        assert!(queue.wake_one().is_none());
    }
}
