//! Scoped numeric thread budget for task bodies.
//!
//! Workers already run several tasks in parallel, so a task body that spins
//! up its own numeric thread pool should size it from [`num_threads`] rather
//! than from the machine's core count. [`set_num_threads`] acquires a budget
//! for the current thread and restores the previous one when the guard drops,
//! including on unwind.

use std::cell::Cell;
use std::marker::PhantomData;

thread_local! {
    static NUM_THREADS: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Thread budget visible to code running on the current thread.
///
/// Falls back to the available parallelism when no budget was set.
pub fn num_threads() -> usize {
    NUM_THREADS
        .with(Cell::get)
        .unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
}

/// Set the budget for the current thread until the returned guard drops.
pub fn set_num_threads(n: usize) -> NumThreadsGuard {
    let previous = NUM_THREADS.with(|cell| cell.replace(Some(n.max(1))));
    NumThreadsGuard {
        previous,
        _not_send: PhantomData,
    }
}

/// Restores the previous budget on drop. Bound to the thread that made it.
#[must_use = "the thread budget is restored as soon as the guard is dropped"]
pub struct NumThreadsGuard {
    previous: Option<usize>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for NumThreadsGuard {
    fn drop(&mut self) {
        NUM_THREADS.with(|cell| cell.set(self.previous));
    }
}
