//! Orchestrator-side handle on a single worker.
//!
//! A [`WorkerHandle`] owns the channel to its worker and the task or thread
//! the worker runs in. It tracks which elements are in flight so that a
//! worker dying mid-job can be reported with the index it was holding.

use std::{collections::VecDeque, fmt, io, sync::Arc, thread};

use tokio::{
    sync::Notify,
    task::{self, JoinHandle},
    time::Instant,
};

use crate::{
    channel::{self, Endpoint},
    config::Isolation,
    error::{HandleError, WorkerExit},
    message::{DataPayload, Request, Response, Transform, WorkerStatus},
    worker::Worker,
    Pid,
};

/// Orchestrator side of a channel pair.
pub type OrchestratorEndpoint<I, O> = Endpoint<Request<I, O>, Response<O>>;

/// An element sent to a worker whose response has not been received yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InFlight {
    pub index: usize,
    /// When the worker could first have started on it.
    pub since: Instant,
}

// Execution context the worker loop runs in.
enum Context {
    Task(JoinHandle<Result<(), WorkerExit>>),
    Thread(thread::JoinHandle<Result<(), WorkerExit>>),
}

impl Context {
    fn spawn<I, O>(isolation: Isolation, pid: Pid, worker: Worker<I, O>) -> io::Result<Self>
    where
        I: Send + 'static,
        O: Send + 'static,
    {
        match isolation {
            Isolation::Task => Ok(Context::Task(tokio::spawn(worker.run()))),
            Isolation::Thread => {
                let handle = thread::Builder::new()
                    .name(format!("orderpool-worker-{pid}"))
                    .spawn(move || {
                        let runtime = tokio::runtime::Builder::new_current_thread()
                            .enable_all()
                            .build()
                            .map_err(WorkerExit::Runtime)?;

                        runtime.block_on(worker.run())
                    })?;

                Ok(Context::Thread(handle))
            }
        }
    }

    fn is_finished(&self) -> bool {
        match self {
            Context::Task(handle) => handle.is_finished(),
            Context::Thread(handle) => handle.is_finished(),
        }
    }

    fn abort(self) {
        match self {
            Context::Task(handle) => handle.abort(),
            // Threads cannot be killed. Once their channel is gone they exit
            // at the next receive or send; until then they run detached.
            Context::Thread(handle) => drop(handle),
        }
    }

    async fn join(self, pid: Pid) -> Result<(), HandleError> {
        let exit = match self {
            Context::Task(handle) => match handle.await {
                Ok(exit) => exit,
                Err(err) if err.is_panic() => return Err(HandleError::WorkerPanicked { pid }),
                Err(_) => return Err(HandleError::WorkerDied { pid, index: None }),
            },
            Context::Thread(handle) => match task::spawn_blocking(move || handle.join()).await {
                Ok(Ok(exit)) => exit,
                Ok(Err(_)) => return Err(HandleError::WorkerPanicked { pid }),
                Err(_) => return Err(HandleError::WorkerDied { pid, index: None }),
            },
        };

        if let Err(exit) = exit {
            tracing::warn!(worker_id = pid, "worker had already exited: {exit}");
        }

        Ok(())
    }
}

/// Orchestrator-side proxy for one worker: owns the channel to it and the
/// context it runs in.
///
/// A handle can be started again after it was closed or terminated; each
/// start spawns a fresh worker (without a function) on a fresh channel.
pub struct WorkerHandle<I, O> {
    pid: Pid,
    isolation: Isolation,
    capacity: usize,
    ready: Arc<Notify>,
    endpoint: Option<OrchestratorEndpoint<I, O>>,
    context: Option<Context>,
    // Elements sent but not yet answered, in the order the worker sees them.
    in_flight: VecDeque<InFlight>,
}

impl<I, O> fmt::Debug for WorkerHandle<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("pid", &self.pid)
            .field("isolation", &self.isolation)
            .field("alive", &self.is_alive())
            .field("in_flight", &self.in_flight)
            .finish_non_exhaustive()
    }
}

impl<I, O> WorkerHandle<I, O> {
    /// Creates a handle that is not running yet. Responses from the worker
    /// signal `ready`.
    pub fn new(pid: Pid, isolation: Isolation, capacity: usize, ready: Arc<Notify>) -> Self {
        Self {
            pid,
            isolation,
            capacity: capacity.max(1),
            ready,
            endpoint: None,
            context: None,
            in_flight: VecDeque::new(),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn is_alive(&self) -> bool {
        self.endpoint.is_some() && self.context.as_ref().is_some_and(|c| !c.is_finished())
    }

    /// Oldest element the worker has not answered yet.
    pub fn in_flight(&self) -> Option<InFlight> {
        self.in_flight.front().copied()
    }

    /// Stamps the payload with this worker's identity and sends it.
    pub async fn send(&mut self, mut payload: DataPayload<I>) -> Result<(), HandleError> {
        let pid = self.pid;
        let index = payload.index;
        payload.owner = Some(pid);

        self.live_endpoint()?
            .send(Request::Data(payload))
            .await
            .map_err(|_| HandleError::WorkerDied {
                pid,
                index: Some(index),
            })?;

        self.in_flight.push_back(InFlight {
            index,
            since: Instant::now(),
        });
        tracing::trace!(worker_id = pid, index, "element sent");

        Ok(())
    }

    /// Whether a response can be received without waiting. Never blocks.
    pub fn poll(&mut self) -> Result<bool, HandleError> {
        let pid = self.pid;
        let endpoint = self
            .endpoint
            .as_mut()
            .ok_or(HandleError::WorkerIsDead { pid })?;

        match endpoint.poll() {
            Ok(ready) => Ok(ready),
            Err(_) => Err(self.died()),
        }
    }

    /// Waits for the next response from the worker.
    ///
    /// Per-element failures (`UserFunctionError`, `WorkerError`) are returned
    /// as responses; only a broken channel is an error here.
    pub async fn receive(&mut self) -> Result<Response<O>, HandleError> {
        let pid = self.pid;
        let endpoint = self
            .endpoint
            .as_mut()
            .ok_or(HandleError::WorkerIsDead { pid })?;

        let response = match endpoint.receive().await {
            Ok(response) => response,
            Err(_) => return Err(self.died()),
        };

        if let Some(index) = response.index() {
            self.settle(index);
        }

        Ok(response)
    }

    /// Replaces the function the worker applies to subsequent elements.
    pub async fn update_function(&mut self, function: Transform<I, O>) -> Result<(), HandleError> {
        let pid = self.pid;

        self.live_endpoint()?
            .send(Request::ChangeFunction(function))
            .await
            .map_err(|_| HandleError::WorkerDied { pid, index: None })
    }

    /// Asks the worker for a snapshot of its bookkeeping. Only valid while
    /// nothing is in flight.
    pub async fn status(&mut self) -> Result<WorkerStatus, HandleError> {
        let pid = self.pid;
        if let Some(job) = self.in_flight() {
            return Err(HandleError::Busy {
                pid,
                index: job.index,
            });
        }

        self.live_endpoint()?
            .send(Request::StatusRequest)
            .await
            .map_err(|_| HandleError::WorkerDied { pid, index: None })?;

        match self.receive().await? {
            Response::Status(status) => Ok(status),
            other => Err(HandleError::UnexpectedMessage {
                pid,
                kind: other.kind(),
            }),
        }
    }

    /// Asks the worker to stop and waits until its context has ended.
    #[tracing::instrument(skip(self), fields(worker_id = self.pid))]
    pub async fn close(&mut self) -> Result<(), HandleError> {
        if !self.is_alive() {
            self.endpoint = None;
            self.context = None;
            return Err(HandleError::WorkerIsDead { pid: self.pid });
        }

        if let Some(endpoint) = self.endpoint.as_mut() {
            if let Err(err) = endpoint.send(Request::Close).await {
                tracing::debug!("close not delivered, worker is already gone: {err}");
            }
        }

        let joined = match self.context.take() {
            Some(context) => context.join(self.pid).await,
            None => Ok(()),
        };

        self.endpoint = None;
        self.in_flight.clear();
        tracing::debug!("worker closed");

        joined
    }

    /// Stops the worker without asking it to. Anything in flight is lost.
    pub fn terminate(&mut self) {
        if let Some(context) = self.context.take() {
            if !context.is_finished() {
                tracing::warn!(
                    worker_id = self.pid,
                    in_flight = ?self.in_flight(),
                    "terminating worker"
                );
            }
            context.abort();
        }

        self.endpoint = None;
        self.in_flight.clear();
    }

    fn live_endpoint(&mut self) -> Result<&mut OrchestratorEndpoint<I, O>, HandleError> {
        if !self.is_alive() {
            return Err(HandleError::WorkerIsDead { pid: self.pid });
        }

        self.endpoint
            .as_mut()
            .ok_or(HandleError::WorkerIsDead { pid: self.pid })
    }

    fn settle(&mut self, index: usize) {
        match self.in_flight.front() {
            Some(job) if job.index == index => {
                self.in_flight.pop_front();
            }
            _ => {
                tracing::warn!(worker_id = self.pid, index, "response for an element not in flight");
                self.in_flight.retain(|job| job.index != index);
            }
        }

        // The next queued element only starts now.
        if let Some(next) = self.in_flight.front_mut() {
            next.since = Instant::now();
        }
    }

    fn died(&self) -> HandleError {
        let index = self.in_flight().map(|job| job.index);
        tracing::error!(worker_id = self.pid, ?index, "worker channel broke");

        HandleError::WorkerDied {
            pid: self.pid,
            index,
        }
    }
}

impl<I, O> WorkerHandle<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Spawns a fresh worker. Must be called from within a tokio runtime.
    pub fn start(&mut self) -> Result<(), HandleError> {
        if self.is_alive() {
            return Err(HandleError::AlreadyAlive { pid: self.pid });
        }

        // Leftovers of a worker that died on its own.
        self.endpoint = None;
        self.context = None;
        self.in_flight.clear();

        let (endpoint, worker_endpoint) = channel::pair(self.capacity, self.ready.clone());
        let worker = Worker::new(self.pid, worker_endpoint);
        let context = Context::spawn(self.isolation, self.pid, worker)
            .map_err(|source| HandleError::Spawn {
                pid: self.pid,
                source,
            })?;

        self.endpoint = Some(endpoint);
        self.context = Some(context);
        tracing::debug!(worker_id = self.pid, isolation = ?self.isolation, "worker started");

        Ok(())
    }
}

impl<I, O> Drop for WorkerHandle<I, O> {
    fn drop(&mut self) {
        if let Some(context) = self.context.take() {
            context.abort();
        }
    }
}

#[cfg(test)]
impl<I, O> WorkerHandle<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Replaces the worker with one that accepts function changes but drops
    /// its channel as soon as it is given an element.
    pub(crate) fn crash_on_next_element(&mut self) {
        self.terminate();

        let (endpoint, mut worker) =
            channel::pair::<Request<I, O>, Response<O>>(self.capacity, self.ready.clone());
        let task: JoinHandle<Result<(), WorkerExit>> = tokio::spawn(async move {
            loop {
                if let Request::Data(_) = worker.receive().await? {
                    return Ok(());
                }
            }
        });

        self.endpoint = Some(endpoint);
        self.context = Some(Context::Task(task));
    }
}
