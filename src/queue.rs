//! Serial execution contexts.
//!
//! A [`SerialQueue`] is a cloneable handle over an unbounded channel drained
//! by a single spawned task: submitted closures run in FIFO order, one at a
//! time. Requests use one queue for lifecycle events (the "underlying"
//! context), a second for response serialization, and a third as the default
//! context for user callbacks.

use tokio::sync::{mpsc, oneshot};

type Job = Box<dyn FnOnce() + Send>;

/// A serial execution context backed by one tokio task.
///
/// Dropping every clone of the handle shuts the drain task down after the
/// remaining jobs have run. Must be created inside a tokio runtime.
#[derive(Clone)]
pub struct SerialQueue {
    label: &'static str,
    tx: mpsc::UnboundedSender<Job>,
}

impl SerialQueue {
    pub fn new(label: &'static str) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job();
            }
        });
        Self { label, tx }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Submit a closure for execution after all previously submitted work.
    ///
    /// Never blocks; jobs submitted after the drain task has shut down are
    /// silently dropped.
    pub fn dispatch(&self, job: impl FnOnce() + Send + 'static) {
        let _ = self.tx.send(Box::new(job));
    }

    /// Wait until every job submitted before this call has executed.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        self.dispatch(move || {
            let _ = tx.send(());
        });
        let _ = rx.await;
    }
}

impl std::fmt::Debug for SerialQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialQueue")
            .field("label", &self.label)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn jobs_run_in_submission_order() {
        let queue = SerialQueue::new("test.serial");
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..100 {
            let seen = seen.clone();
            queue.dispatch(move || seen.lock().unwrap().push(i));
        }
        queue.flush().await;
        let seen = seen.lock().unwrap();
        assert_eq!(*seen, (0..100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn flush_observes_prior_jobs_from_other_clones() {
        let queue = SerialQueue::new("test.clones");
        let hits = Arc::new(Mutex::new(0u32));
        for _ in 0..10 {
            let clone = queue.clone();
            let hits = hits.clone();
            clone.dispatch(move || *hits.lock().unwrap() += 1);
        }
        queue.flush().await;
        assert_eq!(*hits.lock().unwrap(), 10);
    }
}
