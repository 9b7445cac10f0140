//! Completion-ordered iteration over submitted tasks.
//!
//! [`AsCompleted`] subscribes to every handle it is given and yields each
//! one as soon as it reaches a terminal state, so the order is the order in
//! which work finishes rather than the order it was submitted in. The same
//! channel backs both consumption modes:
//!
//! - [`AsCompleted::next_blocking`] parks the calling thread
//! - the [`Stream`] impl suspends the calling task
//!
//! A stream is finite and is consumed exactly once; iterating the same
//! handles again requires a fresh `AsCompleted`.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc::{self, UnboundedReceiver};

use crate::error::{ExecError, Result};
use crate::pool::handle::{TaskHandle, TaskStatus, TaskValue};

/// A handle paired with its gathered result.
#[derive(Debug)]
pub struct Completed {
    pub handle: TaskHandle,
    pub outcome: Result<TaskValue>,
}

impl Completed {
    fn gather(handle: TaskHandle) -> Self {
        let outcome = if handle.status() == TaskStatus::Cancelled {
            Err(ExecError::TaskCancelled(handle.key()))
        } else {
            match handle.take_outcome() {
                Some(Ok(value)) => Ok(value),
                Some(Err(e)) => Err(ExecError::Task(e)),
                None => Err(ExecError::Internal(format!(
                    "result of task {} was already gathered",
                    handle.key()
                ))),
            }
        };
        Self { handle, outcome }
    }
}

pub struct AsCompleted {
    rx: UnboundedReceiver<TaskHandle>,
    remaining: usize,
}

impl AsCompleted {
    pub fn new<'a>(handles: impl IntoIterator<Item = &'a TaskHandle>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut remaining = 0;
        for handle in handles {
            handle.add_done_listener(tx.clone());
            remaining += 1;
        }
        Self { rx, remaining }
    }

    /// Handles that have not been yielded yet
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining == 0
    }

    /// Block the current thread until the next task completes.
    ///
    /// Returns `None` once every handle was yielded, or early if the pool
    /// dropped the remaining handles without finishing them (check
    /// [`remaining`](Self::remaining)). Must not be called from inside an
    /// async runtime.
    pub fn next_blocking(&mut self) -> Option<Completed> {
        if self.remaining == 0 {
            return None;
        }
        let handle = self.rx.blocking_recv()?;
        self.remaining -= 1;
        Some(Completed::gather(handle))
    }

    pub fn poll_next_completed(&mut self, cx: &mut Context<'_>) -> Poll<Option<Completed>> {
        if self.remaining == 0 {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(handle)) => {
                self.remaining -= 1;
                Poll::Ready(Some(Completed::gather(handle)))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Stream for AsCompleted {
    type Item = Completed;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().poll_next_completed(cx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining))
    }
}
