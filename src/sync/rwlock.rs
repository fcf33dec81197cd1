//! Writer-preferring reader/writer lock.
//!
//! Readers share; a writer excludes everyone. Once a writer is waiting,
//! new readers queue behind it, so writers cannot starve. Contended
//! acquisition sleeps; before the scheduler runs (and on host test
//! threads) it degrades to spinning.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

use crate::arch;
use crate::multitasking::scheduler;
use crate::multitasking::task::{self, Task, TaskId, TaskState};
use crate::sync::TicketLock;

struct RwState {
    readers: usize,
    writer: bool,
    /// Id of the writing task, when the writer runs in task context
    writer_id: Option<TaskId>,
    waiting_writers: VecDeque<Arc<Task>>,
    waiting_readers: VecDeque<Arc<Task>>,
}

pub struct RwLock<T: ?Sized> {
    state: TicketLock<RwState>,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for RwLock<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for RwLock<T> {}

pub struct RwLockReadGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
}

pub struct RwLockWriteGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
}

impl<T> RwLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            state: TicketLock::new(RwState {
                readers: 0,
                writer: false,
                writer_id: None,
                waiting_writers: VecDeque::new(),
                waiting_readers: VecDeque::new(),
            }),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> RwLock<T> {
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        loop {
            // Decided before taking the state lock; see Mutex::lock.
            let blockable = scheduler::can_block();
            let mut state = self.state.lock();
            // Writer preference: queued writers hold back new readers.
            if !state.writer && state.waiting_writers.is_empty() {
                state.readers += 1;
                return RwLockReadGuard { lock: self };
            }

            if blockable {
                let task = task::current().expect("blockable context has a task");
                task.set_state(TaskState::Blocked);
                state.waiting_readers.push_back(task);
                scheduler::block_current_releasing(state);
                // Re-contend after wake.
            } else {
                drop(state);
                arch::spin_hint();
            }
        }
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        loop {
            let blockable = scheduler::can_block();
            let mut state = self.state.lock();
            if !state.writer && state.readers == 0 {
                state.writer = true;
                state.writer_id = task::current().map(|task| task.id());
                return RwLockWriteGuard { lock: self };
            }

            if blockable {
                let task = task::current().expect("blockable context has a task");
                task.set_state(TaskState::Blocked);
                state.waiting_writers.push_back(task);
                scheduler::block_current_releasing(state);
            } else {
                drop(state);
                arch::spin_hint();
            }
        }
    }

    pub fn try_read(&self) -> Option<RwLockReadGuard<'_, T>> {
        let mut state = self.state.lock();
        if !state.writer && state.waiting_writers.is_empty() {
            state.readers += 1;
            Some(RwLockReadGuard { lock: self })
        } else {
            None
        }
    }

    pub fn try_write(&self) -> Option<RwLockWriteGuard<'_, T>> {
        let mut state = self.state.lock();
        if !state.writer && state.readers == 0 {
            state.writer = true;
            state.writer_id = task::current().map(|task| task.id());
            Some(RwLockWriteGuard { lock: self })
        } else {
            None
        }
    }

    /// Whether the calling task holds the write side.
    pub fn write_held_by_current(&self) -> bool {
        let current = task::current().map(|task| task.id());
        current.is_some() && self.state.lock().writer_id == current
    }

    fn release_read(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.readers > 0);
        state.readers -= 1;
        if state.readers == 0 {
            if let Some(writer) = state.waiting_writers.pop_front() {
                scheduler::ready(writer);
            }
        }
    }

    fn release_write(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.writer);
        state.writer = false;
        state.writer_id = None;
        if let Some(writer) = state.waiting_writers.pop_front() {
            scheduler::ready(writer);
        } else {
            while let Some(reader) = state.waiting_readers.pop_front() {
                scheduler::ready(reader);
            }
        }
    }
}

impl<'a, T: ?Sized> Deref for RwLockReadGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T: ?Sized> Drop for RwLockReadGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.release_read();
    }
}

impl<'a, T: ?Sized> Deref for RwLockWriteGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T: ?Sized> DerefMut for RwLockWriteGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T: ?Sized> Drop for RwLockWriteGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.release_write();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readers_share_writers_exclude() {
        let lock = RwLock::new(7u32);
        let r1 = lock.read();
        let r2 = lock.read();
        assert_eq!(*r1 + *r2, 14);
        assert!(lock.try_write().is_none());
        drop(r1);
        assert!(lock.try_write().is_none());
        drop(r2);

        let mut w = lock.write();
        *w = 8;
        assert!(lock.try_read().is_none());
        drop(w);
        assert_eq!(*lock.read(), 8);
    }

    #[test]
    fn queued_writer_blocks_new_readers() {
        use crate::multitasking::testing::spawn_floating_task;

        let lock = RwLock::new(());
        let reader = lock.read();

        // A writer waits; writer preference must turn new readers away.
        let writer_task = spawn_floating_task("rw-writer");
        writer_task.set_state(TaskState::Blocked);
        lock.state.lock().waiting_writers.push_back(writer_task.clone());

        assert!(lock.try_read().is_none());

        // Last reader leaving wakes the writer.
        drop(reader);
        assert_eq!(writer_task.state(), TaskState::Ready);
    }

    #[test]
    fn concurrent_reads_with_occasional_writer() {
        static LOCK: RwLock<u64> = RwLock::new(0);

        let writers: Vec<_> = (0..4)
            .map(|_| {
                std::thread::spawn(|| {
                    for _ in 0..1_000 {
                        *LOCK.write() += 1;
                    }
                })
            })
            .collect();
        let readers: Vec<_> = (0..4)
            .map(|_| {
                std::thread::spawn(|| {
                    for _ in 0..1_000 {
                        let value = *LOCK.read();
                        assert!(value <= 4_000);
                    }
                })
            })
            .collect();

        for thread in writers.into_iter().chain(readers) {
            thread.join().unwrap();
        }
        assert_eq!(*LOCK.read(), 4_000);
    }
}
