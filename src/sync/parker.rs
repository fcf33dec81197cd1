//! One-slot binary semaphore for single-consumer services.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch;
use crate::multitasking::scheduler;
use crate::multitasking::task::{self, Task, TaskState};
use crate::sync::TicketLock;

pub struct Parker {
    /// A wakeup that arrived while nobody was parked
    notified: AtomicBool,
    /// The single parked task, if any
    waiter: TicketLock<Option<Arc<Task>>>,
}

impl Parker {
    pub const fn new() -> Self {
        Self {
            notified: AtomicBool::new(false),
            waiter: TicketLock::new(None),
        }
    }

    /// Sleep until the next `unpark`. A token from an earlier `unpark`
    /// is consumed without sleeping; tokens do not accumulate.
    pub fn park(&self) {
        if self.notified.swap(false, Ordering::AcqRel) {
            return;
        }

        if !scheduler::can_block() {
            // Pre-scheduler (and host test) fallback
            while !self.notified.swap(false, Ordering::AcqRel) {
                arch::spin_hint();
            }
            return;
        }

        let task = task::current().expect("park without current task");

        let mut waiter = self.waiter.lock();
        // Re-check under the lock; an unpark may have raced in.
        if self.notified.swap(false, Ordering::AcqRel) {
            return;
        }
        debug_assert!(waiter.is_none(), "parker already has a waiter");
        task.block_epoch.fetch_add(1, Ordering::AcqRel);
        task.set_state(TaskState::Blocked);
        *waiter = Some(task);

        scheduler::block_current_releasing(waiter);
    }

    /// Wake the parked task, or leave a token for the next `park`.
    pub fn unpark(&self) {
        let mut waiter = self.waiter.lock();
        match waiter.take() {
            Some(task) => {
                drop(waiter);
                scheduler::ready(task);
            }
            None => {
                self.notified.store(true, Ordering::Release);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unpark_before_park_is_not_lost() {
        let parker = Parker::new();
        parker.unpark();
        // Consumes the token without a scheduler.
        parker.park();
    }

    #[test]
    fn tokens_do_not_accumulate() {
        let parker = Parker::new();
        parker.unpark();
        parker.unpark();
        parker.park();
        assert!(!parker.notified.load(Ordering::Acquire));
    }
}
