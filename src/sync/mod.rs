//! Synchronization primitives.
//!
//! Lock ordering, outermost to innermost: any subsystem lock (address
//! space, tables, wait structures) then the scheduler lock. Nothing may
//! be acquired while the scheduler lock is held, and nothing may suspend
//! while any spinlock is held.

mod atomic_lifo;
mod mutex;
mod parker;
mod rwlock;
mod spinlock;
mod wait_queue;

pub use self::atomic_lifo::{AtomicLifo, LifoNode};
pub use self::mutex::{Mutex, MutexGuard};
pub use self::parker::Parker;
pub use self::rwlock::{RwLock, RwLockReadGuard, RwLockWriteGuard};
pub use self::spinlock::{TicketGuard, TicketLock};
pub use self::wait_queue::WaitQueue;
