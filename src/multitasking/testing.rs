//! Test support for task machinery.
//!
//! Tests drive the scheduler through its queues and state transitions;
//! they never perform real context switches, so no test may install a
//! current task and then enter a path that could reach `switch_away`
//! with a non-empty ready queue.

use alloc::string::ToString;
use alloc::sync::Arc;

use super::task::{Priority, Task};

fn floating_entry(_arg: usize) {}

/// A kernel task that is not registered in any table and not queued
/// anywhere; tests place it where they need it.
pub(crate) fn spawn_floating_task(name: &str) -> Arc<Task> {
    Task::new_kernel(
        name.to_string(),
        Priority::NormalKernel,
        floating_entry,
        0,
    )
    .expect("cannot allocate test task")
}
