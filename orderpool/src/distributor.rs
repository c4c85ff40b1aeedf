//! Ordered map over a worker pool.
//!
//! The distributor primes every worker with one element, then waits for any
//! of them to answer. Each answer is buffered and the worker that sent it
//! gets the next element, until the input runs out and every element sent has
//! come back. Results are sorted by their index before being returned, so the
//! output order never depends on which worker finished first.

use std::{num::NonZeroUsize, time::Duration};

use tokio::time::Instant;

use crate::{
    config::{Config, ErrorPolicy},
    error::{ElementError, HandleError, MapError, PoolError},
    handle::WorkerHandle,
    message::{DataPayload, Response, Transform},
    pool::Pool,
    Pid,
};

/// Result of one element: the function's output or the marker for its failure.
pub type Outcome<O> = Result<O, ElementError>;

#[derive(Debug)]
pub struct Distributor<I, O> {
    pool: Pool<I, O>,
}

impl<I, O> Distributor<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    pub fn new(config: Config) -> Self {
        Self {
            pool: Pool::new(config),
        }
    }

    /// Starts a pool of `workers` with the default configuration otherwise.
    pub fn with_workers(workers: NonZeroUsize) -> Self {
        Self::new(Config::with_workers(workers))
    }

    pub fn pool(&self) -> &Pool<I, O> {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut Pool<I, O> {
        &mut self.pool
    }

    /// Starts the pool ahead of time so it stays up across `map` calls.
    pub async fn start(&mut self, function: Transform<I, O>) -> Result<(), PoolError> {
        let workers = self.pool.config().workers;
        self.pool.start(workers, function).await
    }

    /// Closes every worker gracefully.
    pub async fn close(&mut self) -> Result<(), PoolError> {
        self.pool.join_all().await
    }

    pub fn terminate(&mut self) {
        self.pool.terminate_all();
    }

    /// Applies `function` to every element on the pool's workers and returns
    /// the outcomes in the order of `elements`.
    ///
    /// A pool that was not running is started for this call and closed
    /// afterwards; a running pool is reused and left running. If the call
    /// fails, no partial results are returned and the pool is terminated.
    #[tracing::instrument(skip_all, fields(pool_id = %self.pool.id()))]
    pub async fn map<It>(&mut self, function: Transform<I, O>, elements: It) -> Result<Vec<Outcome<O>>, MapError>
    where
        It: IntoIterator<Item = I>,
    {
        let mut elements = elements.into_iter().enumerate().peekable();
        if elements.peek().is_none() {
            tracing::debug!("empty input, nothing to distribute");
            return Ok(Vec::new());
        }

        let was_alive = self.pool.is_alive();
        let outcome = match self.prepare(function, was_alive).await {
            Ok(()) => self.drain(&mut elements).await,
            Err(err) => Err(err),
        };

        match outcome {
            Ok(results) => {
                tracing::debug!(elements = results.len(), "map finished");
                if !was_alive {
                    self.pool.join_all().await?;
                }
                Ok(results)
            }
            Err(err) => {
                tracing::error!(
                    label = err.as_label(),
                    worker = ?err.worker(),
                    index = ?err.index(),
                    "map failed: {err}"
                );
                self.pool.terminate_all();
                Err(err)
            }
        }
    }

    async fn prepare(&mut self, function: Transform<I, O>, was_alive: bool) -> Result<(), MapError> {
        if was_alive {
            self.pool.broadcast_function(function).await?;
        } else {
            // A partially dead pool is replaced as a whole.
            self.pool.terminate_all();
            let workers = self.pool.config().workers;
            self.pool.start(workers, function).await?;
        }

        Ok(())
    }

    async fn drain(
        &mut self,
        elements: &mut impl Iterator<Item = (usize, I)>,
    ) -> Result<Vec<Outcome<O>>, MapError> {
        let policy = self.pool.config().error_policy;
        let timeout = self.pool.config().job_timeout;
        let ready = self.pool.readiness();
        let handles = self.pool.handles_mut();

        let mut results: Vec<DataPayload<Outcome<O>>> = Vec::new();
        let mut sent = 0;

        for handle in handles.iter_mut() {
            let Some((index, value)) = elements.next() else {
                break;
            };
            handle.send(DataPayload::new(index, value)).await?;
            sent += 1;
        }

        while results.len() < sent {
            // Registered before scanning so a response arriving mid-scan
            // still wakes us up.
            let notified = ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let mut progressed = false;
            for handle in handles.iter_mut() {
                if !handle.poll()? {
                    continue;
                }

                let response = handle.receive().await?;
                results.push(collect(handle.pid(), response, policy)?);
                progressed = true;

                if let Some((index, value)) = elements.next() {
                    handle.send(DataPayload::new(index, value)).await?;
                    sent += 1;
                }
            }

            if progressed {
                continue;
            }

            let deadline = timeout.and_then(|timeout| {
                next_deadline(handles, timeout).map(|deadline| (deadline, timeout))
            });

            match deadline {
                Some((deadline, timeout)) => tokio::select! {
                    () = &mut notified => {}
                    () = tokio::time::sleep_until(deadline) => expire(handles, timeout)?,
                },
                None => notified.await,
            }
        }

        results.sort_unstable();
        Ok(results.into_iter().map(|payload| payload.value).collect())
    }
}

fn collect<O>(pid: Pid, response: Response<O>, policy: ErrorPolicy) -> Result<DataPayload<Outcome<O>>, MapError> {
    match response {
        Response::Data(payload) => Ok(payload.map(Ok)),
        Response::UserFunctionError { pid, index, error } => match policy {
            ErrorPolicy::PerElement => Ok(DataPayload {
                index,
                value: Err(ElementError {
                    pid,
                    index,
                    message: error,
                }),
                owner: Some(pid),
            }),
            ErrorPolicy::AbortMap => Err(MapError::UserFunction { pid, index, error }),
        },
        Response::WorkerError { pid, fault } => Err(MapError::Worker { pid, fault }),
        other => Err(HandleError::UnexpectedMessage {
            pid,
            kind: other.kind(),
        }
        .into()),
    }
}

fn next_deadline<I, O>(handles: &[WorkerHandle<I, O>], timeout: Duration) -> Option<Instant> {
    handles
        .iter()
        .filter_map(WorkerHandle::in_flight)
        .map(|job| job.since + timeout)
        .min()
}

// Terminates the first worker whose element has been in flight for longer
// than `timeout`.
fn expire<I, O>(handles: &mut [WorkerHandle<I, O>], timeout: Duration) -> Result<(), MapError> {
    let now = Instant::now();

    for handle in handles.iter_mut() {
        let Some(job) = handle.in_flight() else {
            continue;
        };

        if job.since + timeout <= now {
            let pid = handle.pid();
            handle.terminate();
            return Err(MapError::Timeout {
                pid,
                index: job.index,
                timeout,
            });
        }
    }

    Ok(())
}
