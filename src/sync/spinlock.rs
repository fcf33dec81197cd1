//! Ticket spinlock.
//!
//! FIFO under contention: each acquirer takes a ticket and waits until it
//! is served. Interrupts are disabled for as long as the lock is held and
//! the holder's executor id is recorded, so recursive acquisition and
//! wrong-CPU release are caught in debug builds. Holders must not block;
//! the per-task `spinlocks_held` counter keeps the scheduler honest about
//! that.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::arch;
use crate::executor;
use crate::multitasking::task;

/// No executor holds the lock.
const NO_HOLDER: u32 = u32::MAX;

pub struct TicketLock<T: ?Sized> {
    next_ticket: AtomicU32,
    now_serving: AtomicU32,
    holder: AtomicU32,
    poisoned: AtomicBool,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Sync for TicketLock<T> {}
unsafe impl<T: ?Sized + Send> Send for TicketLock<T> {}

pub struct TicketGuard<'a, T: ?Sized> {
    lock: &'a TicketLock<T>,
    irq_was_enabled: bool,
}

impl<T> TicketLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            next_ticket: AtomicU32::new(0),
            now_serving: AtomicU32::new(0),
            holder: AtomicU32::new(NO_HOLDER),
            poisoned: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> TicketLock<T> {
    pub fn lock(&self) -> TicketGuard<'_, T> {
        // Interrupts go off before the ticket is taken, so an interrupt
        // handler on this CPU can never find us mid-queue.
        let irq_was_enabled = arch::interrupts_enabled();
        arch::disable_interrupts();
        task::note_spinlock_acquire();

        if self.poisoned.load(Ordering::Acquire) {
            panic!("acquiring poisoned spinlock");
        }
        let me = executor::current_id_raw();
        debug_assert!(
            me == NO_HOLDER || self.holder.load(Ordering::Relaxed) != me,
            "recursive spinlock acquisition"
        );

        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        while self.now_serving.load(Ordering::Acquire) != ticket {
            arch::spin_hint();
        }

        if self.poisoned.load(Ordering::Acquire) {
            panic!("acquiring poisoned spinlock");
        }
        self.holder.store(me, Ordering::Relaxed);

        TicketGuard {
            lock: self,
            irq_was_enabled,
        }
    }

    pub fn try_lock(&self) -> Option<TicketGuard<'_, T>> {
        let irq_was_enabled = arch::interrupts_enabled();
        arch::disable_interrupts();
        task::note_spinlock_acquire();

        let serving = self.now_serving.load(Ordering::Acquire);
        let acquired = self
            .next_ticket
            .compare_exchange(serving, serving.wrapping_add(1), Ordering::Acquire, Ordering::Relaxed)
            .is_ok();

        if acquired && !self.poisoned.load(Ordering::Acquire) {
            self.holder
                .store(executor::current_id_raw(), Ordering::Relaxed);
            Some(TicketGuard {
                lock: self,
                irq_was_enabled,
            })
        } else {
            if acquired {
                // Undo the taken ticket slot before reporting failure
                self.now_serving.fetch_add(1, Ordering::Release);
            }
            task::note_spinlock_release();
            if irq_was_enabled {
                arch::enable_interrupts();
            }
            None
        }
    }

    /// Make every future acquisition panic. Used when the protected data
    /// is known to be in an unusable state.
    pub fn poison(&self) {
        self.poisoned.store(true, Ordering::Release);
    }

    pub fn is_locked(&self) -> bool {
        self.next_ticket.load(Ordering::Relaxed) != self.now_serving.load(Ordering::Relaxed)
    }

    /// Release a lock whose guard was leaked by `TicketGuard::leak_for_switch`,
    /// restoring the interrupt state the leaking side saved.
    ///
    /// # Safety
    /// Must only be called on the executor that leaked the guard, exactly
    /// once per leak.
    pub unsafe fn complete_handoff(&self, irq_was_enabled: bool) {
        self.holder.store(NO_HOLDER, Ordering::Relaxed);
        self.now_serving.fetch_add(1, Ordering::Release);
        if irq_was_enabled {
            arch::enable_interrupts();
        }
    }
}

impl<'a, T: ?Sized> TicketGuard<'a, T> {
    /// The interrupt state saved when this guard was taken.
    pub fn saved_interrupts(&self) -> bool {
        self.irq_was_enabled
    }

    /// Keep the lock held past the end of this guard's scope, with
    /// interrupts still disabled, and drop the holder's bookkeeping now.
    /// The context-switch path uses this to carry the scheduler lock from
    /// the outgoing task to the incoming one, which releases it with
    /// `complete_handoff`.
    ///
    /// Returns the interrupt state to restore at handoff completion.
    pub fn leak_for_switch(self) -> bool {
        let irq_was_enabled = self.irq_was_enabled;
        task::note_spinlock_release();
        core::mem::forget(self);
        irq_was_enabled
    }

    /// Release the lock but leave interrupts disabled, returning the
    /// saved interrupt state for the caller to restore later. Used when
    /// an outer lock must be released after an inner one was taken.
    pub fn unlock_no_irq_restore(self) -> bool {
        let irq_was_enabled = self.irq_was_enabled;
        self.lock.holder.store(NO_HOLDER, Ordering::Relaxed);
        self.lock.now_serving.fetch_add(1, Ordering::Release);
        task::note_spinlock_release();
        core::mem::forget(self);
        irq_was_enabled
    }
}

impl<'a, T: ?Sized> Deref for TicketGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T: ?Sized> DerefMut for TicketGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T: ?Sized> Drop for TicketGuard<'a, T> {
    fn drop(&mut self) {
        let me = executor::current_id_raw();
        debug_assert!(
            me == NO_HOLDER || self.lock.holder.load(Ordering::Relaxed) == me,
            "spinlock released by non-holder"
        );
        self.lock.holder.store(NO_HOLDER, Ordering::Relaxed);
        self.lock.now_serving.fetch_add(1, Ordering::Release);

        task::note_spinlock_release();
        if self.irq_was_enabled {
            arch::enable_interrupts();
        }
        // A preemption that arrived while this lock was held happens now.
        task::deferred_preempt_check();
    }
}
