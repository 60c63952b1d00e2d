//! Per-key serialized job execution.
//!
//! A lane is a task that runs the jobs submitted under one key, one at a
//! time, in submission order. Different keys run in parallel. Lanes are
//! created on first use and exit after sitting idle, so only users with
//! recent traffic hold a task.

use async_trait::async_trait;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;

/// Runs one job.
#[async_trait]
pub trait LaneHandler<J>: Send + Sync + 'static
where
    J: Send + 'static,
{
    async fn handle(&self, job: J);
}

struct Inner<K, J> {
    senders: HashMap<K, mpsc::UnboundedSender<J>>,
    closed: bool,
}

/// A set of lanes keyed by `K` carrying jobs of type `J`.
pub struct Lanes<K, J> {
    inner: Arc<Mutex<Inner<K, J>>>,
    idle: Duration,
    tracker: TaskTracker,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<K, J> Lanes<K, J>
where
    K: Eq + Hash + Clone + Send + 'static,
    J: Send + 'static,
{
    /// Creates an empty set whose lanes exit after `idle` without work.
    #[must_use]
    pub fn new(idle: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                senders: HashMap::new(),
                closed: false,
            })),
            idle,
            tracker: TaskTracker::new(),
        }
    }

    /// Queues `job` on the lane for `key`, starting the lane if needed.
    ///
    /// # Errors
    ///
    /// Returns the job if the set has been closed.
    pub fn submit<H>(&self, key: K, job: J, handler: &Arc<H>) -> Result<(), J>
    where
        H: LaneHandler<J>,
    {
        let mut inner = lock(&self.inner);
        if inner.closed {
            return Err(job);
        }

        let job = match inner.senders.get(&key) {
            Some(sender) => match sender.send(job) {
                Ok(()) => return Ok(()),
                // The lane task is gone without deregistering; replace it.
                Err(mpsc::error::SendError(job)) => job,
            },
            None => job,
        };

        let (sender, receiver) = mpsc::unbounded_channel();
        inner.senders.insert(key.clone(), sender);
        self.tracker.spawn(run_lane(
            Arc::clone(&self.inner),
            key,
            job,
            receiver,
            Arc::clone(handler),
            self.idle,
        ));
        Ok(())
    }

    /// Number of lanes currently running.
    #[must_use]
    pub fn active(&self) -> usize {
        lock(&self.inner).senders.len()
    }

    /// Refuses new jobs. Lanes finish what they already hold, then exit.
    pub fn close(&self) {
        let mut inner = lock(&self.inner);
        inner.closed = true;
        inner.senders.clear();
        drop(inner);
        self.tracker.close();
    }

    /// Waits for every lane to exit. Only returns after [`Lanes::close`].
    pub async fn drained(&self) {
        self.tracker.wait().await;
    }
}

async fn run_lane<K, J, H>(
    inner: Arc<Mutex<Inner<K, J>>>,
    key: K,
    first: J,
    mut receiver: mpsc::UnboundedReceiver<J>,
    handler: Arc<H>,
    idle: Duration,
) where
    K: Eq + Hash + Send + 'static,
    J: Send + 'static,
    H: LaneHandler<J>,
{
    handler.handle(first).await;

    loop {
        match tokio::time::timeout(idle, receiver.recv()).await {
            Ok(Some(job)) => handler.handle(job).await,
            Ok(None) => break,
            Err(_) => {
                // Deregister under the lock so no job slips in between the
                // emptiness check and the removal.
                let next = {
                    let mut inner = lock(&inner);
                    match receiver.try_recv() {
                        Ok(job) => Some(job),
                        Err(_) => {
                            inner.senders.remove(&key);
                            None
                        }
                    }
                };
                match next {
                    Some(job) => handler.handle(job).await,
                    None => break,
                }
            }
        }
    }
}
