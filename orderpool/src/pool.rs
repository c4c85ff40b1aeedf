use std::{fmt, num::NonZeroUsize, sync::Arc};

use tokio::sync::Notify;
use uuid::Uuid;

use crate::{
    config::Config,
    error::{HandleError, PoolError},
    handle::WorkerHandle,
    message::{Transform, WorkerStatus},
};

/// Fixed-size set of worker handles.
///
/// Every handle's responses signal the same [`Notify`], so the owner of the
/// pool can sleep until any worker has something to say.
pub struct Pool<I, O> {
    id: Uuid,
    config: Config,
    // Insertion order is the order handles are primed in; correctness does
    // not depend on it.
    handles: Vec<WorkerHandle<I, O>>,
    ready: Arc<Notify>,
}

impl<I, O> fmt::Debug for Pool<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("handles", &self.handles)
            .finish_non_exhaustive()
    }
}

impl<I, O> Pool<I, O> {
    /// Creates an empty pool; no worker runs until [`Pool::start`].
    pub fn new(config: Config) -> Self {
        Self {
            id: Uuid::new_v4(),
            config,
            handles: Vec::new(),
            ready: Arc::new(Notify::new()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// True iff the pool has handles and every one of them is alive.
    pub fn is_alive(&self) -> bool {
        !self.handles.is_empty() && self.handles.iter().all(WorkerHandle::is_alive)
    }

    pub fn handles(&self) -> &[WorkerHandle<I, O>] {
        &self.handles
    }

    pub fn handles_mut(&mut self) -> &mut [WorkerHandle<I, O>] {
        &mut self.handles
    }

    /// Signalled whenever any worker of this pool sends a response or exits.
    pub fn readiness(&self) -> Arc<Notify> {
        self.ready.clone()
    }

    /// Sends `function` to every handle. Handles that fail are collected so
    /// the rest still receive it.
    #[tracing::instrument(skip_all, fields(pool_id = %self.id))]
    pub async fn broadcast_function(&mut self, function: Transform<I, O>) -> Result<(), PoolError> {
        let mut failures = Vec::new();

        for handle in &mut self.handles {
            if let Err(err) = handle.update_function(function.clone()).await {
                failures.push(err);
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            tracing::error!(failed = failures.len(), "function broadcast incomplete");
            Err(PoolError::Broadcast { failures })
        }
    }

    /// Closes every handle gracefully and empties the pool, even if some of
    /// them fail to close.
    #[tracing::instrument(skip_all, fields(pool_id = %self.id))]
    pub async fn join_all(&mut self) -> Result<(), PoolError> {
        let mut failures = Vec::new();

        for mut handle in self.handles.drain(..) {
            match handle.close().await {
                Ok(()) => {}
                Err(err @ HandleError::WorkerIsDead { .. }) => {
                    tracing::warn!("{err} at shutdown");
                }
                Err(err) => failures.push(err),
            }
        }

        tracing::debug!("all workers have been shutdown");

        if failures.is_empty() {
            Ok(())
        } else {
            Err(PoolError::Shutdown { failures })
        }
    }

    /// Kills every handle without waiting for it and empties the pool.
    pub fn terminate_all(&mut self) {
        tracing::debug!(pool_id = %self.id, "terminating all workers");

        for mut handle in self.handles.drain(..) {
            handle.terminate();
        }
    }

    /// Status snapshot of every worker, in handle order.
    pub async fn status_all(&mut self) -> Result<Vec<WorkerStatus>, HandleError> {
        let mut statuses = Vec::with_capacity(self.handles.len());

        for handle in &mut self.handles {
            statuses.push(handle.status().await?);
        }

        Ok(statuses)
    }
}

impl<I, O> Pool<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Starts `count` fresh workers, all running `function`.
    ///
    /// If any worker fails to start, the ones already started are terminated.
    #[tracing::instrument(skip(self, function), fields(pool_id = %self.id))]
    pub async fn start(&mut self, count: NonZeroUsize, function: Transform<I, O>) -> Result<(), PoolError> {
        if self.handles.iter().any(WorkerHandle::is_alive) {
            return Err(PoolError::AlreadyRunning);
        }

        // Dead leftovers from a previous run are never reused.
        self.terminate_all();

        for pid in 0..count.get() {
            let mut handle = WorkerHandle::new(
                pid,
                self.config.isolation,
                self.config.channel_capacity,
                self.ready.clone(),
            );

            let started = match handle.start() {
                Ok(()) => handle.update_function(function.clone()).await,
                Err(err) => Err(err),
            };

            if let Err(err) = started {
                self.terminate_all();
                return Err(PoolError::Start(err));
            }

            self.handles.push(handle);
        }

        tracing::debug!(workers = count.get(), "pool started");

        Ok(())
    }
}

impl<I, O> Drop for Pool<I, O> {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            self.terminate_all();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        config::Isolation,
        message::{infallible, DataPayload, Response},
    };

    fn pool(isolation: Isolation) -> Pool<u64, u64> {
        let mut config = Config::with_workers(NonZeroUsize::new(3).unwrap());
        config.isolation = isolation;
        Pool::new(config)
    }

    fn three() -> NonZeroUsize {
        NonZeroUsize::new(3).unwrap()
    }

    #[tokio::test]
    async fn start_and_join() {
        let mut pool = pool(Isolation::Task);
        assert!(!pool.is_alive());

        pool.start(three(), infallible(|x: u64| x)).await.unwrap();
        assert!(pool.is_alive());
        assert_eq!(pool.len(), 3);

        let pids: Vec<_> = pool.handles().iter().map(WorkerHandle::pid).collect();
        assert_eq!(pids, vec![0, 1, 2]);

        pool.join_all().await.unwrap();
        assert!(!pool.is_alive());
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn start_twice_is_refused() {
        let mut pool = pool(Isolation::Task);
        pool.start(three(), infallible(|x: u64| x)).await.unwrap();

        assert!(matches!(
            pool.start(three(), infallible(|x: u64| x)).await,
            Err(PoolError::AlreadyRunning)
        ));

        pool.terminate_all();
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn broadcast_reaches_every_worker() {
        let mut pool = pool(Isolation::Task);
        pool.start(three(), infallible(|x: u64| x)).await.unwrap();
        pool.broadcast_function(infallible(|x: u64| x + 100))
            .await
            .unwrap();

        for handle in pool.handles_mut() {
            handle.send(DataPayload::new(0, 1)).await.unwrap();
            match handle.receive().await.unwrap() {
                Response::Data(payload) => assert_eq!(payload.value, 101),
                other => panic!("unexpected response {other:?}"),
            }
        }

        pool.join_all().await.unwrap();
    }

    #[tokio::test]
    async fn broadcast_lists_dead_workers() {
        let mut pool = pool(Isolation::Task);
        pool.start(three(), infallible(|x: u64| x)).await.unwrap();
        pool.handles_mut()[1].terminate();
        assert!(!pool.is_alive());

        match pool.broadcast_function(infallible(|x: u64| x)).await {
            Err(PoolError::Broadcast { failures }) => {
                let pids: Vec<_> = failures.iter().map(HandleError::pid).collect();
                assert_eq!(pids, vec![1]);
            }
            other => panic!("unexpected result {other:?}"),
        }

        pool.terminate_all();
    }

    #[tokio::test]
    async fn graceful_shutdown_of_threads() {
        let mut pool = pool(Isolation::Thread);
        pool.start(three(), infallible(|x: u64| x)).await.unwrap();

        let statuses = pool.status_all().await.unwrap();
        assert_eq!(statuses.len(), 3);
        assert!(statuses.iter().all(|s| s.jobs_finished == 0));

        tokio::time::timeout(std::time::Duration::from_secs(5), pool.join_all())
            .await
            .unwrap()
            .unwrap();
        assert!(pool.is_empty());
    }
}
