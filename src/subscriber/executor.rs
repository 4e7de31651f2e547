//! Single-worker handler executor with a bounded queue.
//!
//! User handlers run on one dedicated worker thread, in submission order.
//! When the queue is full the submitter (the replication reader) blocks,
//! which is the backpressure path from a slow consumer into the network
//! reader. An optional timeout turns that block into an `Unavailable`
//! failure.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::error::{Error, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Work queue size used when the caller does not configure one.
pub const DEFAULT_WORK_QUEUE: usize = 256;

/// Bounded single-worker executor for change handlers.
pub struct FlowControlledExecutor {
    tx: Mutex<Option<mpsc::Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    submit_timeout: Option<Duration>,
    /// First handler panic, captured by the worker before it stops.
    panic: Arc<Mutex<Option<String>>>,
}

impl FlowControlledExecutor {
    /// Create the executor and start its worker thread.
    pub fn new(work_queue: usize, submit_timeout: Option<Duration>) -> FlowControlledExecutor {
        let (tx, mut rx) = mpsc::channel::<Job>(work_queue.max(1));
        let panic: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let panic_slot = panic.clone();

        let worker = std::thread::Builder::new()
            .name("pgcdc-handler".into())
            .spawn(move || {
                while let Some(job) = rx.blocking_recv() {
                    if let Err(cause) = std::panic::catch_unwind(AssertUnwindSafe(job)) {
                        let msg = panic_message(&cause);
                        error!(panic = %msg, "change handler panicked; stopping executor");
                        *panic_slot.lock().expect("panic slot poisoned") = Some(msg);
                        rx.close();
                        break;
                    }
                }
                debug!("handler executor worker stopped");
            })
            .expect("spawn handler worker thread");

        FlowControlledExecutor {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            submit_timeout,
            panic,
        }
    }

    /// Queue a job, blocking while the queue is full. Fails `Unavailable`
    /// on backpressure timeout, `Fault` once a handler has panicked.
    pub async fn submit(&self, job: Job) -> Result<()> {
        let tx = {
            let guard = self.tx.lock().expect("executor lock poisoned");
            guard.clone()
        };
        let Some(tx) = tx else {
            return Err(self.closed_error());
        };
        let send = tx.send(job);
        let outcome = match self.submit_timeout {
            None => send.await.map_err(|_| self.closed_error()),
            Some(limit) => match tokio::time::timeout(limit, send).await {
                Ok(sent) => sent.map_err(|_| self.closed_error()),
                Err(_) => Err(Error::Unavailable(
                    "handler submit timed out due to backpressure".into(),
                )),
            },
        };
        outcome
    }

    /// A panic captured from a handler, if any.
    pub fn handler_panic(&self) -> Option<String> {
        self.panic.lock().expect("panic slot poisoned").clone()
    }

    fn closed_error(&self) -> Error {
        match self.handler_panic() {
            Some(msg) => Error::Fault(format!("change handler panicked: {msg}")),
            None => Error::Incorrect("handler executor is closed".into()),
        }
    }

    /// Drain queued jobs and stop the worker. Idempotent.
    pub async fn close(&self) {
        let tx = self.tx.lock().expect("executor lock poisoned").take();
        drop(tx); // worker exits once the queue is drained
        let worker = self.worker.lock().expect("executor lock poisoned").take();
        if let Some(handle) = worker {
            // The join is quick once the sender is gone; hop off the
            // async runtime for it.
            let _ = tokio::task::spawn_blocking(move || {
                let _ = handle.join();
            })
            .await;
        }
    }
}

fn panic_message(cause: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = cause.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = cause.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc as std_mpsc;

    #[tokio::test]
    async fn runs_jobs_in_order() {
        let exec = FlowControlledExecutor::new(8, None);
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let seen = seen.clone();
            exec.submit(Box::new(move || {
                seen.lock().unwrap().push(i);
            }))
            .await
            .unwrap();
        }
        exec.close().await;
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn backpressure_times_out() {
        let exec = FlowControlledExecutor::new(1, Some(Duration::from_millis(50)));
        let (gate_tx, gate_rx) = std_mpsc::channel::<()>();

        // First job occupies the worker until the gate opens.
        exec.submit(Box::new(move || {
            let _ = gate_rx.recv();
        }))
        .await
        .unwrap();
        // Give the worker a moment to pick the job up, then fill the queue.
        tokio::time::sleep(Duration::from_millis(20)).await;
        exec.submit(Box::new(|| {})).await.unwrap();

        // Queue is full and the worker is stuck: this one must time out.
        let err = exec.submit(Box::new(|| {})).await.unwrap_err();
        assert!(err.is_unavailable(), "got {err:?}");
        assert!(err.to_string().contains("backpressure"));

        gate_tx.send(()).unwrap();
        exec.close().await;
    }

    #[tokio::test]
    async fn close_drains_pending_jobs() {
        let exec = FlowControlledExecutor::new(16, None);
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let count = count.clone();
            exec.submit(Box::new(move || {
                count.fetch_add(1, Ordering::SeqCst);
            }))
            .await
            .unwrap();
        }
        exec.close().await;
        assert_eq!(count.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn handler_panic_is_captured() {
        let exec = FlowControlledExecutor::new(4, None);
        exec.submit(Box::new(|| panic!("boom"))).await.unwrap();

        // The worker stops; eventually submits fail with the panic.
        let mut last = None;
        for _ in 0..50 {
            match exec.submit(Box::new(|| {})).await {
                Ok(()) => tokio::time::sleep(Duration::from_millis(10)).await,
                Err(e) => {
                    last = Some(e);
                    break;
                }
            }
        }
        let err = last.expect("submit should fail after a handler panic");
        assert!(err.is_fault(), "got {err:?}");
        assert!(err.to_string().contains("boom"));
        exec.close().await;
    }
}
