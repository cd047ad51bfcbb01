//! Action relay: runs closures submitted by worker threads on the owning thread.
//!
//! A worker sends a request and blocks until the owner has executed it. The
//! owner serves requests one at a time, so relayed work is serialized on the
//! owner's thread and sees whatever thread-bound resources it holds.
//!
//! Only the owner's wait for the next request is bounded. A worker's wait for
//! its reply includes the time spent behind queued siblings, so it is released
//! by the owner instead: either the job runs, or the relay is dropped and the
//! pending reply channel closes.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};

use crate::error::ExecutionError;
use crate::pool::block_on_bounded;

type Job = Box<dyn FnOnce() + Send>;

/// Why a relayed request produced no value.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The closure panicked on the owner thread; the panic was contained.
    #[error("relayed action panicked: {0}")]
    Panicked(String),

    /// The relay could not run the request at all.
    #[error(transparent)]
    Fatal(#[from] ExecutionError),
}

/// Owner side of the relay. Created per fan-out on the owning thread.
pub struct ActionRelay {
    sender: mpsc::Sender<Job>,
    receiver: mpsc::Receiver<Job>,
    handle: Handle,
    timeout: Option<Duration>,
}

impl ActionRelay {
    /// Creates a relay whose queue holds `capacity` pending requests.
    pub fn new(capacity: usize, handle: Handle, timeout: Option<Duration>) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            sender,
            receiver,
            handle,
            timeout,
        }
    }

    /// A handle for one worker task.
    pub fn requester(&self) -> RelayRequester {
        RelayRequester {
            sender: self.sender.clone(),
            handle: self.handle.clone(),
        }
    }

    /// Serves requests on the calling thread until `expected` have run or
    /// every requester is gone. Returns how many were served.
    ///
    /// Fails with [`ExecutionError::Timeout`] if no request arrives in time.
    /// Requests still queued at that point are dropped without running.
    pub fn serve(self, expected: usize) -> Result<usize, ExecutionError> {
        let ActionRelay {
            sender,
            mut receiver,
            handle,
            timeout,
        } = self;
        drop(sender);

        let mut served = 0;
        while served < expected {
            match block_on_bounded(&handle, timeout, "relayed action", receiver.recv())? {
                Some(job) => {
                    job();
                    served += 1;
                    metrics::counter!("orchestration_relay_jobs_total").increment(1);
                }
                None => break,
            }
        }
        tracing::trace!(served, expected, "relay drained");
        Ok(served)
    }
}

/// Worker side of the relay.
#[derive(Clone)]
pub struct RelayRequester {
    sender: mpsc::Sender<Job>,
    handle: Handle,
}

impl RelayRequester {
    /// Runs `action` on the owner thread and waits for its value.
    ///
    /// Blocks until the owner has run `action` or dropped the relay. Must be
    /// called from a thread outside any async context.
    pub fn request<T, F>(&self, action: F) -> Result<T, RelayError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (reply, outcome) = oneshot::channel();
        let job: Job = Box::new(move || {
            if reply.is_closed() {
                tracing::warn!("requester gone, relayed action skipped");
                metrics::counter!("orchestration_relay_skipped_total").increment(1);
                return;
            }
            let result = panic::catch_unwind(AssertUnwindSafe(action)).map_err(panic_message);
            let _ = reply.send(result);
        });

        self.sender.try_send(job).map_err(|error| match error {
            mpsc::error::TrySendError::Full(_) => ExecutionError::QueueFull {
                capacity: self.sender.max_capacity(),
            },
            mpsc::error::TrySendError::Closed(_) => {
                ExecutionError::CannotExecute("action relay is closed".to_string())
            }
        })?;

        match self.handle.block_on(outcome) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(RelayError::Panicked(message)),
            Err(_) => Err(RelayError::Fatal(ExecutionError::CannotExecute(
                "action relay dropped the request".to_string(),
            ))),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
