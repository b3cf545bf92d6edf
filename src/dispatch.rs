//! Bounded hand-off between the poller and the forwarder.
//!
//! Jobs are blocking IMAP/SMTP work, so they run on the tokio blocking pool
//! of a dedicated runtime. At most `max_size` jobs run at once; up to
//! `queue_capacity` more wait in a bounded channel. Past that the job is
//! rejected. Idle blocking threads exit after `keep_alive`.

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error};
use tokio::runtime::{Builder, Runtime};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Semaphore;
use tokio::task::{self, JoinHandle};

use crate::config::PoolConfig;
use crate::email::EmailError;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkerPool {
    runtime: Mutex<Option<Runtime>>,
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    max_size: usize,
}

impl WorkerPool {
    pub fn new(config: &PoolConfig) -> Result<Self, EmailError> {
        let core_size = config.core_size.max(1);
        let max_size = config.max_size.max(core_size);

        let prefix = config.thread_name_prefix.clone();
        let counter = AtomicUsize::new(0);
        let runtime = Builder::new_multi_thread()
            .worker_threads(core_size)
            .max_blocking_threads(max_size)
            .thread_name_fn(move || format!("{}{}", prefix, counter.fetch_add(1, Ordering::SeqCst) + 1))
            .thread_keep_alive(Duration::from_secs(config.keep_alive_secs))
            .enable_all()
            .build()?;

        debug!(
            "Creating worker pool: core={}, max={}, queue={}",
            core_size, max_size, config.queue_capacity
        );

        let (sender, receiver) = mpsc::channel::<Job>(config.queue_capacity.max(1));
        let dispatcher = runtime.spawn(Self::dispatch(receiver, max_size));

        Ok(Self {
            runtime: Mutex::new(Some(runtime)),
            sender: Mutex::new(Some(sender)),
            dispatcher: Mutex::new(Some(dispatcher)),
            max_size,
        })
    }

    /// Moves queued jobs onto the blocking pool, never more than `max_size`
    /// at once. A job stays in the channel until a slot is free.
    async fn dispatch(mut receiver: mpsc::Receiver<Job>, max_size: usize) {
        let slots = Arc::new(Semaphore::new(max_size));

        loop {
            let permit = match Arc::clone(&slots).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let Some(job) = receiver.recv().await else {
                break;
            };

            let handle = task::spawn_blocking(move || {
                let _permit = permit;
                job();
            });
            tokio::spawn(async move {
                if let Err(e) = handle.await {
                    if e.is_panic() {
                        error!("Uncaught panic in worker: {}", panic_message(e.into_panic()));
                    } else {
                        error!("Worker job cancelled: {}", e);
                    }
                }
            });
        }

        debug!("Dispatcher stopped");
    }

    pub fn submit<F>(&self, job: F) -> Result<(), EmailError>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self
            .sender
            .lock()
            .map_err(|_| EmailError::DispatchError("pool lock poisoned".to_string()))?
            .clone()
            .ok_or_else(|| EmailError::DispatchError("pool is shut down".to_string()))?;

        match sender.try_send(Box::new(job)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(EmailError::DispatchError(format!(
                "queue full and all {} workers busy",
                self.max_size
            ))),
            Err(TrySendError::Closed(_)) => {
                Err(EmailError::DispatchError("pool is shut down".to_string()))
            }
        }
    }

    /// Closes the queue, lets the dispatcher drain it and waits for running
    /// jobs. Must not be called from inside a job.
    pub fn shutdown(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }

        let runtime = match self.runtime.lock() {
            Ok(mut runtime) => runtime.take(),
            Err(_) => return,
        };
        let Some(runtime) = runtime else {
            return;
        };

        let dispatcher = self.dispatcher.lock().ok().and_then(|mut d| d.take());
        if let Some(dispatcher) = dispatcher {
            if let Err(e) = runtime.block_on(dispatcher) {
                error!("Error joining dispatcher: {}", e);
            }
        }

        // Dropping the runtime waits for blocking jobs still running.
        drop(runtime);
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
