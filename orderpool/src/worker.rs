use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    time::{Duration, Instant, SystemTime},
};

use crate::{
    channel::Endpoint,
    error::{WorkerExit, WorkerFault},
    message::{DataPayload, Request, Response, Transform, WorkerStatus},
    Pid,
};

/// Worker side of a channel pair.
pub type WorkerEndpoint<I, O> = Endpoint<Response<O>, Request<I, O>>;

/// Long-lived loop that receives elements, applies the current function to
/// them and sends the results back. Starts without a function.
pub struct Worker<I, O> {
    pid: Pid,
    endpoint: WorkerEndpoint<I, O>,
    function: Option<Transform<I, O>>,
    state: State,
    clock: Clock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Executing { index: usize },
    Closed,
}

impl State {
    // The worker state machine. Executing is only ever held for the duration
    // of a single synchronous call to the user function.
    //
    //                       data (function set)
    //         ┌──────────┐ ───────────────────► ┌───────────┐
    //   data ┌┤          │                      │           │
    //  (none)││   IDLE   │ ◄─────────────────── │ EXECUTING │
    //  change└►          │   result / failure   │           │
    // status  └────┬─────┘                      └───────────┘
    //              │ close, channel error
    //         ┌────▼─────┐
    //         │  CLOSED  │
    //         └──────────┘
    fn next<I, O>(self, request: &Request<I, O>, has_function: bool) -> State {
        match (self, request) {
            (State::Idle, Request::Data(payload)) if has_function => State::Executing {
                index: payload.index,
            },
            (_, Request::Close) | (State::Closed, _) => State::Closed,
            (State::Idle | State::Executing { .. }, _) => State::Idle,
        }
    }
}

#[derive(Debug)]
struct Clock {
    started_at: SystemTime,
    started: Instant,
    waiting: Duration,
    working: Duration,
    jobs_finished: u64,
}

impl Clock {
    fn new() -> Self {
        Self {
            started_at: SystemTime::now(),
            started: Instant::now(),
            waiting: Duration::ZERO,
            working: Duration::ZERO,
            jobs_finished: 0,
        }
    }
}

impl<I, O> std::fmt::Debug for Worker<I, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("pid", &self.pid)
            .field("has_function", &self.function.is_some())
            .field("state", &self.state)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl<I, O> Worker<I, O> {
    pub fn new(pid: Pid, endpoint: WorkerEndpoint<I, O>) -> Self {
        Self {
            pid,
            endpoint,
            function: None,
            state: State::Idle,
            clock: Clock::new(),
        }
    }

    /// Runs until the orchestrator sends `Close` (`Ok`) or the channel to it
    /// breaks (`Err`).
    #[tracing::instrument(skip(self), fields(worker_id = self.pid))]
    pub async fn run(mut self) -> Result<(), WorkerExit> {
        tracing::debug!("worker started");

        loop {
            let waiting = Instant::now();
            let request = match self.endpoint.receive().await {
                Ok(request) => request,
                Err(err) => {
                    tracing::error!("worker channel broken: {err}; shutting down");
                    return Err(err.into());
                }
            };
            self.clock.waiting += waiting.elapsed();

            self.state = self.state.next(&request, self.function.is_some());
            tracing::trace!("received {}", request.kind());

            match request {
                Request::Data(payload) => {
                    if let State::Executing { index } = self.state {
                        tracing::trace!(index, "executing");
                    }
                    let response = self.execute(payload);
                    self.state = State::Idle;
                    self.endpoint.send(response).await?;
                }
                Request::ChangeFunction(function) => {
                    tracing::debug!("function replaced");
                    self.function = Some(function);
                }
                Request::StatusRequest => {
                    self.endpoint.send(Response::Status(self.status())).await?;
                }
                Request::Close => {
                    tracing::debug!("received close from orchestrator");
                    return Ok(());
                }
            }
        }
    }

    fn execute(&mut self, payload: DataPayload<I>) -> Response<O> {
        let index = payload.index;

        let Some(function) = self.function.clone() else {
            tracing::warn!(index, "received data before any function was set");
            return Response::WorkerError {
                pid: self.pid,
                fault: WorkerFault::NoFunction { index },
            };
        };

        let started = Instant::now();
        let value = payload.value;
        let outcome = panic::catch_unwind(AssertUnwindSafe(move || function(value)));
        self.clock.working += started.elapsed();
        self.clock.jobs_finished += 1;

        match outcome {
            Ok(Ok(value)) => Response::Data(DataPayload {
                index,
                value,
                owner: Some(self.pid),
            }),
            Ok(Err(err)) => {
                tracing::warn!(index, "user function failed: {err}");
                Response::UserFunctionError {
                    pid: self.pid,
                    index,
                    error: err.to_string(),
                }
            }
            Err(panic) => {
                let error = panic_message(panic.as_ref());
                tracing::warn!(index, "user function panicked: {error}");
                Response::UserFunctionError {
                    pid: self.pid,
                    index,
                    error,
                }
            }
        }
    }

    fn status(&self) -> WorkerStatus {
        WorkerStatus {
            pid: self.pid,
            started_at: self.clock.started_at,
            uptime: self.clock.started.elapsed(),
            time_waiting: self.clock.waiting,
            time_working: self.clock.working,
            jobs_finished: self.clock.jobs_finished,
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("panicked: {msg}")
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("panicked: {msg}")
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use tokio::{sync::Notify, task::JoinHandle};

    use super::*;
    use crate::{
        channel,
        error::ChannelError,
        message::{infallible, transform},
    };

    type Orchestrator = Endpoint<Request<i64, i64>, Response<i64>>;

    fn spawn(pid: Pid) -> (Orchestrator, JoinHandle<Result<(), WorkerExit>>) {
        let (orchestrator, endpoint) = channel::pair(16, Arc::new(Notify::new()));
        let handle = tokio::spawn(Worker::new(pid, endpoint).run());
        (orchestrator, handle)
    }

    #[tokio::test]
    async fn data_without_function_reports_fault() {
        let (mut tx, handle) = spawn(4);

        tx.send(Request::Data(DataPayload::new(0, 1))).await.unwrap();
        match tx.receive().await.unwrap() {
            Response::WorkerError { pid, fault } => {
                assert_eq!(pid, 4);
                assert_eq!(fault, WorkerFault::NoFunction { index: 0 });
            }
            other => panic!("unexpected response {other:?}"),
        }

        // Still alive and able to close cleanly.
        tx.send(Request::Close).await.unwrap();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn applies_function_and_stamps_owner() {
        let (mut tx, handle) = spawn(1);

        tx.send(Request::ChangeFunction(infallible(|x: i64| x + 10)))
            .await
            .unwrap();
        tx.send(Request::Data(DataPayload::new(3, 5))).await.unwrap();

        match tx.receive().await.unwrap() {
            Response::Data(payload) => {
                assert_eq!(payload.index, 3);
                assert_eq!(payload.value, 15);
                assert_eq!(payload.owner, Some(1));
            }
            other => panic!("unexpected response {other:?}"),
        }

        tx.send(Request::Close).await.unwrap();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn survives_user_function_errors_and_panics() {
        let (mut tx, handle) = spawn(0);

        let f = transform(|x: i64| match x {
            3 => Err("three is not allowed"),
            4 => panic!("four"),
            x => Ok(x * 2),
        });
        tx.send(Request::ChangeFunction(f)).await.unwrap();

        for (index, value) in [3, 4, 5].into_iter().enumerate() {
            tx.send(Request::Data(DataPayload::new(index, value)))
                .await
                .unwrap();
        }

        match tx.receive().await.unwrap() {
            Response::UserFunctionError { index, error, .. } => {
                assert_eq!(index, 0);
                assert_eq!(error, "three is not allowed");
            }
            other => panic!("unexpected response {other:?}"),
        }
        match tx.receive().await.unwrap() {
            Response::UserFunctionError { index, error, .. } => {
                assert_eq!(index, 1);
                assert_eq!(error, "panicked: four");
            }
            other => panic!("unexpected response {other:?}"),
        }
        match tx.receive().await.unwrap() {
            Response::Data(payload) => assert_eq!(payload.value, 10),
            other => panic!("unexpected response {other:?}"),
        }

        tx.send(Request::Close).await.unwrap();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn status_tracks_jobs_and_time() {
        let (mut tx, handle) = spawn(2);

        tx.send(Request::ChangeFunction(infallible(|x: i64| x)))
            .await
            .unwrap();
        for index in 0..3 {
            tx.send(Request::Data(DataPayload::new(index, 0))).await.unwrap();
            tx.receive().await.unwrap();
        }

        tx.send(Request::StatusRequest).await.unwrap();
        match tx.receive().await.unwrap() {
            Response::Status(status) => {
                assert_eq!(status.pid, 2);
                assert_eq!(status.jobs_finished, 3);
                assert!(status.time_waiting + status.time_working <= status.uptime);
            }
            other => panic!("unexpected response {other:?}"),
        }

        tx.send(Request::Close).await.unwrap();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn exits_with_error_when_orchestrator_disappears() {
        let (tx, handle) = spawn(0);
        drop(tx);

        match handle.await.unwrap() {
            Err(WorkerExit::Channel(err)) => assert_eq!(err, ChannelError::EndOfStream),
            other => panic!("unexpected exit {other:?}"),
        }
    }

    #[test]
    fn close_is_terminal() {
        let close: Request<i64, i64> = Request::Close;
        let data: Request<i64, i64> = Request::Data(DataPayload::new(0, 0));

        assert_eq!(State::Idle.next(&close, true), State::Closed);
        assert_eq!(State::Closed.next(&data, true), State::Closed);
        assert_eq!(State::Idle.next(&data, false), State::Idle);
        assert_eq!(
            State::Idle.next(&data, true),
            State::Executing { index: 0 }
        );
    }
}
