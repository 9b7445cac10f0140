//! Job execution surface.
//!
//! Two thin adapters over one shared core: [`JobExecutor`] blocks the
//! calling thread while waiting on the pool, [`AsyncJobExecutor`] suspends
//! the calling task. Dispatch, job tracking and cancellation live in the
//! core and behave identically in both.

mod blocking;
mod core;
mod suspending;

pub use blocking::{JobExecutor, JobResults};
pub use suspending::{AsyncJobExecutor, AsyncJobResults};
