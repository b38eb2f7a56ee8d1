//! Bounded worker pool for per-table work.
//!
//! Workers pull tasks from a shared queue and report through a channel, so no
//! accumulator is written concurrently. A task that panics is reported as that
//! task's failure and its siblings keep running.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, PoisonError};
use std::thread;

use tablevault_core::TransportError;

use crate::config::RetryPolicy;

/// Shared cooperative cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Cancels the operations running when [`OperationCanceller::cancel`] is
/// called. Every operation gets its own flag, so later operations start clean.
#[derive(Debug, Clone, Default)]
pub struct OperationCanceller {
    running: Arc<Mutex<Vec<CancelHandle>>>,
}

impl OperationCanceller {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        for handle in running.iter() {
            handle.cancel();
        }
        tracing::info!(operations = running.len(), "cancellation requested");
    }

    /// Number of operations currently registered.
    #[must_use]
    pub fn running(&self) -> usize {
        self.running.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub(crate) fn begin(&self) -> OperationToken {
        let cancel = CancelHandle::new();
        self.running.lock().unwrap_or_else(PoisonError::into_inner).push(cancel.clone());
        OperationToken { registry: Arc::clone(&self.running), cancel }
    }
}

/// Flag of one running operation; deregisters itself on drop.
pub(crate) struct OperationToken {
    registry: Arc<Mutex<Vec<CancelHandle>>>,
    pub cancel: CancelHandle,
}

impl Drop for OperationToken {
    fn drop(&mut self) {
        let mut running = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        running.retain(|handle| !Arc::ptr_eq(&handle.0, &self.cancel.0));
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskResult<T> {
    Completed(T),
    Panicked(String),
    /// Never started because the run was cancelled.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutcome<T> {
    pub key: String,
    pub result: TaskResult<T>,
}

/// Run `work` over every task with at most `workers` threads.
///
/// Returns once every task has completed, panicked, or been skipped. Results
/// come back in submission order.
pub fn run_pool<I, T, F>(workers: usize, tasks: Vec<(String, I)>, cancel: &CancelHandle, work: F) -> Vec<TaskOutcome<T>>
where
    I: Send,
    T: Send,
    F: Fn(&str, I) -> T + Sync,
{
    let total = tasks.len();
    let width = workers.clamp(1, total.max(1));
    let queue = Mutex::new(tasks.into_iter().enumerate().collect::<VecDeque<_>>());
    let (sender, receiver) = mpsc::channel::<(usize, TaskOutcome<T>)>();

    thread::scope(|scope| {
        for _ in 0..width {
            let sender = sender.clone();
            let queue = &queue;
            let work = &work;
            scope.spawn(move || loop {
                let next = queue.lock().unwrap_or_else(PoisonError::into_inner).pop_front();
                let Some((index, (key, input))) = next else {
                    break;
                };

                let result = if cancel.is_cancelled() {
                    TaskResult::Skipped
                } else {
                    match catch_unwind(AssertUnwindSafe(|| work(&key, input))) {
                        Ok(value) => TaskResult::Completed(value),
                        Err(payload) => {
                            let message = panic_message(payload.as_ref());
                            tracing::error!(task = %key, panic = %message, "pool task panicked");
                            TaskResult::Panicked(message)
                        }
                    }
                };

                if sender.send((index, TaskOutcome { key, result })).is_err() {
                    break;
                }
            });
        }
    });
    drop(sender);

    let mut collected: Vec<(usize, TaskOutcome<T>)> = receiver.into_iter().collect();
    collected.sort_by_key(|(index, _)| *index);
    debug_assert_eq!(collected.len(), total);
    collected.into_iter().map(|(_, outcome)| outcome).collect()
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "task panicked".to_string()
    }
}

/// Call `op`, retrying retryable transport errors with exponential backoff.
///
/// Stops early, returning the last error, once `cancel` is set.
///
/// # Errors
/// Returns the last error when it is not retryable or attempts are exhausted.
pub fn with_retry<T>(
    policy: &RetryPolicy,
    cancel: &CancelHandle,
    label: &str,
    mut op: impl FnMut() -> Result<T, TransportError>,
) -> Result<T, TransportError> {
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.max_attempts && !cancel.is_cancelled() => {
                let delay = policy.backoff(attempt);
                tracing::warn!(operation = label, attempt, ?delay, error = %err, "retrying");
                thread::sleep(delay);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
