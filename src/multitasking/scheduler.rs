//! Preemptive round-robin scheduler.
//!
//! One global ready queue, FIFO, protected by the scheduler ticket lock.
//! The scheduler lock is the innermost lock in the kernel: nothing else
//! may be acquired while it is held. Context switches happen with the
//! lock held on the outgoing side; the incoming side releases it in
//! [`finish_switch`].

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use crate::arch;
use crate::executor;
use crate::sync::{TicketGuard, TicketLock};
use crate::time::{Duration, Instant};

use super::cleanup;
use super::task::{self, Task, TaskState};

/// How long a task runs before the periodic timer offers its slot to the
/// next ready task.
pub const TIME_SLICE: Duration = Duration::from_millis(5);

/// A task waiting for a moment in time. The epoch pins the entry to one
/// particular block; a stale entry is ignored when it comes due.
struct Sleeper {
    wake_at: Instant,
    epoch: u64,
    task: Arc<Task>,
}

/// Scheduler queues. A plain struct so the policy is testable without
/// touching the global instance.
pub(crate) struct SchedulerState {
    ready: VecDeque<Arc<Task>>,
    /// Sorted by wake time
    sleeping: VecDeque<Sleeper>,
}

impl SchedulerState {
    pub(crate) fn new() -> Self {
        Self {
            ready: VecDeque::new(),
            sleeping: VecDeque::new(),
        }
    }

    pub(crate) fn enqueue(&mut self, task: Arc<Task>) {
        self.ready.push_back(task);
    }

    pub(crate) fn dequeue(&mut self) -> Option<Arc<Task>> {
        self.ready.pop_front()
    }

    pub(crate) fn ready_len(&self) -> usize {
        self.ready.len()
    }

    fn enqueue_sleeper(&mut self, sleeper: Sleeper) {
        let index = sorted_index(&self.sleeping, sleeper.wake_at);
        self.sleeping.insert(index, sleeper);
    }

    fn take_due_sleepers(&mut self, now: Instant) -> VecDeque<Sleeper> {
        let mut due = VecDeque::new();
        while let Some(first) = self.sleeping.front() {
            if first.wake_at <= now {
                due.push_back(self.sleeping.pop_front().unwrap());
            } else {
                break;
            }
        }
        due
    }
}

/// Priority-queue-like index into the sorted sleeper list
fn sorted_index(v: &VecDeque<Sleeper>, t: Instant) -> usize {
    let mut i = 0;
    while i < v.len() {
        if v[i].wake_at > t {
            return i;
        }
        i += 1;
    }
    v.len()
}

lazy_static::lazy_static! {
    /// The scheduler lock. Innermost kernel lock.
    static ref SCHEDULER: TicketLock<SchedulerState> = TicketLock::new(SchedulerState::new());
}

/// What becomes of the task that is switching away.
enum Disposition {
    /// Put it at the back of the ready queue
    Requeue,
    /// A wait structure already owns it
    Blocked,
    /// Hand it to the cleanup service once off its stack
    Exited,
    /// Park it on the sleep queue until the deadline
    Sleep(Instant),
    /// It is this executor's scheduler task; it is found again through
    /// the executor record, not a queue
    Idle,
}

/// Make a woken or fresh task runnable and queue it.
pub fn ready(task: Arc<Task>) {
    // A concurrent cancellation wins: a dropped task is queued as-is so
    // it can run once and exit.
    let _ = task.transition(TaskState::Blocked, TaskState::Ready);
    SCHEDULER.lock().enqueue(task);
}

/// Queue a cancelled task without touching its `Dropped` state, so it can
/// run once and observe the cancellation.
pub(crate) fn ready_for_exit(task: Arc<Task>) {
    SCHEDULER.lock().enqueue(task);
}

/// Voluntarily give up the CPU. No-op before the scheduler is running.
pub fn yield_now() {
    if executor::with_current_task(|_| ()).is_none() {
        return;
    }
    switch_away(Disposition::Requeue, None::<TicketGuard<'_, ()>>);

    // A cancelled task exits at its next voluntary suspension point.
    let dropped =
        executor::with_current_task(|task| task.state() == TaskState::Dropped).unwrap_or(false);
    if dropped {
        exit_current();
    }
}

/// Block the current task until `wake_at`.
pub fn sleep_until(wake_at: Instant) {
    let prepared = executor::with_current_task(|task| {
        task.block_epoch.fetch_add(1, Ordering::AcqRel);
        task.set_state(TaskState::Blocked);
    });
    if prepared.is_none() {
        return;
    }
    switch_away(Disposition::Sleep(wake_at), None::<TicketGuard<'_, ()>>);
}

pub fn sleep(duration: Duration) {
    sleep_until(crate::time::now() + duration);
}

/// True when the current context may suspend: a task is running and it
/// holds no spinlock.
pub fn can_block() -> bool {
    executor::with_current_task(|task| {
        task.spinlocks_held() == 0 && task.interrupt_disable_count() == 0
    })
    .unwrap_or(false)
}

/// Block the current task, releasing `held` (a wait structure's lock)
/// only after the scheduler lock is taken, so a waker can never observe
/// the registration without the block that follows it.
///
/// The caller has already registered the task and set its state to
/// `Blocked` under `held`.
pub(crate) fn block_current_releasing<T: ?Sized>(held: TicketGuard<'_, T>) {
    switch_away(Disposition::Blocked, Some(held));
}

/// Periodic preemption point. Requeues the current task and runs the
/// next ready one, unless the current task has preemption blocked, in
/// which case the tick is remembered and replayed when the last blocker
/// is released.
pub fn maybe_preempt() {
    let blocked = executor::with_current_task(|task| {
        if task.state() == TaskState::Running && task.is_preemption_blocked() {
            task.set_preemption_skipped();
            true
        } else {
            false
        }
    });
    match blocked {
        // No executor or no current task yet
        None => return,
        Some(true) => return,
        Some(false) => {}
    }

    let disposition = if current_is_scheduler_task() {
        Disposition::Idle
    } else {
        Disposition::Requeue
    };
    switch_away(disposition, None::<TicketGuard<'_, ()>>);
}

fn current_is_scheduler_task() -> bool {
    let executor = match executor::current() {
        Some(executor) => executor,
        None => return false,
    };
    let idle_id = executor.scheduler_task().map(|task| task.id());
    executor::with_current_task(|task| Some(task.id()) == idle_id).unwrap_or(false)
}

/// The switch itself. Picks the next task under the scheduler lock,
/// re-homes the outgoing task per `disposition`, and transfers control.
/// Returns when something switches back to the calling task.
fn switch_away<T: ?Sized>(disposition: Disposition, held: Option<TicketGuard<'_, T>>) {
    let executor = match executor::current() {
        Some(executor) => executor,
        None => return,
    };

    let mut sched = SCHEDULER.lock();

    // The wait structure's lock can go now; wakers queue up behind the
    // scheduler lock we hold. Interrupts stay disabled.
    let pre_block_irq = held.map(|guard| guard.unlock_no_irq_restore());

    let next = match sched.dequeue() {
        Some(next) => next,
        None => match disposition {
            // Nothing else to run; keep running.
            Disposition::Requeue | Disposition::Idle => {
                drop(sched);
                return;
            }
            // The current task cannot continue; fall back to this
            // executor's scheduler task.
            _ => executor
                .scheduler_task()
                .expect("blocking before the scheduler task exists")
                .clone(),
        },
    };

    // Runnable unless it was cancelled while queued; a cancelled task
    // still runs once so it can exit.
    if next.state() != TaskState::Dropped {
        next.set_state(TaskState::Running);
    }
    let next_context = next.context.get();

    let previous = unsafe { executor.swap_current_task(Some(next)) }
        .expect("switch_away without a current task");

    // The interrupt state this task resumes with: for a block it is the
    // state from before the wait structure's lock; otherwise the state
    // from before the scheduler lock.
    let resume_irq = pre_block_irq.unwrap_or_else(|| sched.saved_interrupts());
    previous
        .saved_interrupts_enabled
        .store(resume_irq, Ordering::Release);

    let previous_context = previous.context.get();

    match disposition {
        Disposition::Requeue => {
            previous.set_state_if_not_dropped(TaskState::Ready);
            sched.enqueue(previous);
        }
        Disposition::Idle => {
            // Found again through the executor record
            previous.set_state_if_not_dropped(TaskState::Ready);
            drop(previous);
        }
        Disposition::Sleep(wake_at) => {
            let epoch = previous.block_epoch.load(Ordering::Acquire);
            sched.enqueue_sleeper(Sleeper {
                wake_at,
                epoch,
                task: previous,
            });
        }
        Disposition::Blocked => {
            // The wait structure holds its own reference.
            drop(previous);
        }
        Disposition::Exited => {
            // Destroyed only after we are off its stack; the incoming
            // side hands it to cleanup.
            let raw = Arc::into_raw(previous) as *mut Task;
            let stale = executor.pending_exit.swap(raw, Ordering::AcqRel);
            debug_assert!(stale.is_null());
        }
    }

    let _ = sched.leak_for_switch();

    unsafe { arch::context_switch(previous_context, next_context) };

    // Someone switched back to us.
    finish_switch();
}

/// Release the scheduler lock carried across a switch and restore the
/// incoming task's interrupt state; then dispose of any task that exited
/// on the way out.
pub(crate) fn finish_switch() {
    let executor = executor::current().expect("finish_switch without executor");

    let resume_irq = executor::with_current_task(|task| {
        task.saved_interrupts_enabled.load(Ordering::Acquire)
    })
    .unwrap_or(true);

    unsafe { SCHEDULER.complete_handoff(resume_irq) };

    let dead = executor
        .pending_exit
        .swap(core::ptr::null_mut(), Ordering::AcqRel);
    if !dead.is_null() {
        let dead = unsafe { Arc::from_raw(dead) };
        dead.unscheduled.store(true, Ordering::Release);
        cleanup::queue_task_for_cleanup(dead);
    }
}

/// First instruction of every task. The switch that started us is still
/// holding the scheduler lock; finish it, then run the task body.
pub(crate) extern "C" fn task_startup() -> ! {
    finish_switch();

    let task = task::current().expect("task_startup without current task");
    if task.state() != TaskState::Dropped {
        if let Some((entry, arg)) = task.entry() {
            drop(task);
            entry(arg);
        }
    }

    exit_current()
}

/// Terminate the current task. Its storage is reclaimed by the cleanup
/// service once the switch away from it has completed.
pub fn exit_current() -> ! {
    executor::with_current_task(|task| {
        let _ = task.drop_state();
    })
    .expect("exit without a current task");

    switch_away(Disposition::Exited, None::<TicketGuard<'_, ()>>);
    unreachable!("exited task resumed");
}

/// Wake every sleeper whose deadline has passed. Runs from the timer
/// interrupt before the preemption check.
pub fn wake_due_sleepers(now: Instant) {
    let due = SCHEDULER.lock().take_due_sleepers(now);

    for sleeper in due {
        let Sleeper { epoch, task, .. } = sleeper;
        // A stale entry: the sleep it belonged to already ended.
        if task.block_epoch.load(Ordering::Acquire) != epoch {
            continue;
        }
        match task.state() {
            TaskState::Blocked => {
                let queue = task.blocked_on.load(Ordering::Acquire);
                if queue.is_null() {
                    // Plain sleep; wake directly.
                    if task.transition(TaskState::Blocked, TaskState::Ready) {
                        SCHEDULER.lock().enqueue(task);
                    }
                } else {
                    // Deadline while waiting on a queue. Removal
                    // arbitrates against a concurrent real wake.
                    let removed = unsafe { (*queue).remove(&task) };
                    if removed {
                        task.woken_by_timeout.store(true, Ordering::Release);
                        ready(task);
                    }
                }
            }
            // Cancelled while sleeping: give it its exit run.
            TaskState::Dropped => ready_for_exit(task),
            _ => {}
        }
    }
}

/// Register a deadline for the task's in-progress block. Called by wait
/// structures before they suspend.
pub(crate) fn register_timeout(task: &Arc<Task>, wake_at: Instant) {
    let epoch = task.block_epoch.load(Ordering::Acquire);
    SCHEDULER.lock().enqueue_sleeper(Sleeper {
        wake_at,
        epoch,
        task: task.clone(),
    });
}

/// Create this executor's scheduler (idle) task and enter scheduling.
/// Never returns; the boot context is abandoned.
pub fn start() -> ! {
    use alloc::format;

    let executor = executor::current().expect("scheduler start without executor");

    let idle = Task::new_kernel(
        format!("scheduler-{}", executor.id()),
        super::task::Priority::Idle,
        idle_main,
        0,
    )
    .expect("cannot allocate scheduler task");
    executor.set_scheduler_task(idle);

    // Run whatever is ready; idle if nothing is.
    let first_context = {
        let mut sched = SCHEDULER.lock();
        let first = sched
            .dequeue()
            .unwrap_or_else(|| executor.scheduler_task().unwrap().clone());
        first.set_state(TaskState::Running);
        let first_context = first.context.get();
        let stale = unsafe { executor.swap_current_task(Some(first)) };
        debug_assert!(stale.is_none());
        let _ = sched.leak_for_switch();
        first_context
    };

    let mut boot_context = arch::empty_context();
    unsafe { arch::context_switch(&mut boot_context, first_context) };
    unreachable!("boot context resumed");
}

/// The idle loop: run ready work when there is any, otherwise wait for
/// an interrupt with interrupts enabled.
fn idle_main(_arg: usize) {
    loop {
        let has_work = { SCHEDULER.lock().ready_len() > 0 };
        if has_work {
            maybe_preempt();
        } else {
            arch::wait_for_interrupt();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multitasking::testing::spawn_floating_task;

    #[test]
    fn round_robin_rotation_is_strict() {
        let mut state = SchedulerState::new();
        let a = spawn_floating_task("rr-a");
        let b = spawn_floating_task("rr-b");
        let c = spawn_floating_task("rr-c");
        let ids = [a.id(), b.id(), c.id()];

        state.enqueue(a);
        state.enqueue(b);
        state.enqueue(c);

        let mut visits = Vec::new();
        for _ in 0..300 {
            let next = state.dequeue().unwrap();
            visits.push(next.id());
            state.enqueue(next);
        }

        for (i, id) in visits.iter().enumerate() {
            assert_eq!(*id, ids[i % 3]);
        }
        // Everyone ran equally often
        for id in ids {
            assert_eq!(visits.iter().filter(|v| **v == id).count(), 100);
        }
    }

    #[test]
    fn sleepers_wake_in_deadline_order() {
        let mut state = SchedulerState::new();
        let late = spawn_floating_task("sleep-late");
        let early = spawn_floating_task("sleep-early");
        let late_id = late.id();
        let early_id = early.id();

        state.enqueue_sleeper(Sleeper {
            wake_at: Instant::from_nanos(200),
            epoch: 0,
            task: late,
        });
        state.enqueue_sleeper(Sleeper {
            wake_at: Instant::from_nanos(100),
            epoch: 0,
            task: early,
        });

        let due = state.take_due_sleepers(Instant::from_nanos(150));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].task.id(), early_id);

        let due = state.take_due_sleepers(Instant::from_nanos(300));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].task.id(), late_id);
    }

    #[test]
    fn timer_tick_during_blocked_preemption_is_remembered() {
        let executor = crate::executor::testing::bind_test_executor(40);
        let task = spawn_floating_task("no-preempt");
        task.set_state(TaskState::Running);
        let _ = crate::executor::testing::install_current_task(executor, task.clone());

        task.lock_scheduler();
        maybe_preempt();

        // The tick did not switch, it was recorded for replay at the
        // next release of the outermost blocker.
        assert_eq!(task.state(), TaskState::Running);
        assert!(task.preemption_skipped_pending());

        let _ = crate::executor::testing::clear_current_task(executor);
        crate::executor::testing::unbind();
        task.unlock_scheduler();
    }
}
