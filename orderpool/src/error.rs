//! Error types used across the pool.
//!
//! - [`ChannelError`]: a channel endpoint lost its peer.
//! - [`WorkerExit`]: why a worker loop ended without being asked to close.
//! - [`WorkerFault`]: a fault reported by a live worker as a message.
//! - [`HandleError`]: lifecycle and transport failures of a single worker handle.
//! - [`PoolError`]: pool-wide lifecycle failures, aggregated per worker.
//! - [`MapError`]: why an ordered map call failed as a whole.
//! - [`ElementError`]: per-element failure marker returned inside map results.

use std::{io, time::Duration};

use thiserror::Error;

use crate::Pid;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    /// The peer endpoint was dropped; nothing can be sent to it anymore.
    #[error("channel closed: peer endpoint is gone")]
    Closed,
    /// The peer endpoint was dropped and every buffered message was consumed.
    #[error("end of stream: peer terminated without a final signal")]
    EndOfStream,
}

#[derive(Error, Debug)]
pub enum WorkerExit {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("failed to build worker runtime: {0}")]
    Runtime(#[source] io::Error),
}

/// Faults a worker reports back instead of crashing.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerFault {
    #[error("worker has no function to apply to element {index}")]
    NoFunction { index: usize },
}

#[derive(Error, Debug)]
pub enum HandleError {
    #[error("worker {pid} is already alive")]
    AlreadyAlive { pid: Pid },
    #[error("worker {pid} is not alive")]
    WorkerIsDead { pid: Pid },
    #[error("worker {pid} died (element in flight: {index:?})")]
    WorkerDied { pid: Pid, index: Option<usize> },
    #[error("worker {pid} panicked")]
    WorkerPanicked { pid: Pid },
    #[error("worker {pid} is busy with element {index}")]
    Busy { pid: Pid, index: usize },
    #[error("worker {pid} sent an unexpected `{kind}` message")]
    UnexpectedMessage { pid: Pid, kind: &'static str },
    #[error("failed to spawn worker {pid}: {source}")]
    Spawn {
        pid: Pid,
        #[source]
        source: io::Error,
    },
}

impl HandleError {
    pub fn pid(&self) -> Pid {
        match self {
            HandleError::AlreadyAlive { pid }
            | HandleError::WorkerIsDead { pid }
            | HandleError::WorkerDied { pid, .. }
            | HandleError::WorkerPanicked { pid }
            | HandleError::Busy { pid, .. }
            | HandleError::UnexpectedMessage { pid, .. }
            | HandleError::Spawn { pid, .. } => *pid,
        }
    }
}

fn pids(failures: &[HandleError]) -> Vec<Pid> {
    failures.iter().map(HandleError::pid).collect()
}

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("pool is already running")]
    AlreadyRunning,
    #[error("failed to start pool: {0}")]
    Start(#[source] HandleError),
    #[error("function broadcast failed for workers {:?}", pids(.failures))]
    Broadcast { failures: Vec<HandleError> },
    #[error("graceful shutdown failed for workers {:?}", pids(.failures))]
    Shutdown { failures: Vec<HandleError> },
}

/// Why a `map` call failed. No partial results are returned alongside it.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum MapError {
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Handle(#[from] HandleError),
    #[error("user function failed on element {index} (worker {pid}): {error}")]
    UserFunction { pid: Pid, index: usize, error: String },
    #[error("worker {pid} reported a fault: {fault}")]
    Worker { pid: Pid, fault: WorkerFault },
    #[error("worker {pid} exceeded {timeout:?} on element {index}")]
    Timeout {
        pid: Pid,
        index: usize,
        timeout: Duration,
    },
}

impl MapError {
    /// Identity of the worker implicated in the failure, if one is.
    pub fn worker(&self) -> Option<Pid> {
        match self {
            MapError::Pool(PoolError::Start(err)) | MapError::Handle(err) => Some(err.pid()),
            MapError::Pool(_) => None,
            MapError::UserFunction { pid, .. }
            | MapError::Worker { pid, .. }
            | MapError::Timeout { pid, .. } => Some(*pid),
        }
    }

    /// Index of the element in flight at the time of failure, if known.
    pub fn index(&self) -> Option<usize> {
        match self {
            MapError::Handle(HandleError::WorkerDied { index, .. }) => *index,
            MapError::Handle(HandleError::Busy { index, .. })
            | MapError::UserFunction { index, .. }
            | MapError::Worker {
                fault: WorkerFault::NoFunction { index },
                ..
            }
            | MapError::Timeout { index, .. } => Some(*index),
            MapError::Pool(_) | MapError::Handle(_) => None,
        }
    }

    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            MapError::Pool(_) => "map_pool",
            MapError::Handle(HandleError::WorkerDied { .. }) => "map_worker_died",
            MapError::Handle(_) => "map_handle",
            MapError::UserFunction { .. } => "map_user_function",
            MapError::Worker { .. } => "map_worker_fault",
            MapError::Timeout { .. } => "map_timeout",
        }
    }
}

/// Marker left in the results of a `map` call for an element whose user
/// function failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("element {index} failed on worker {pid}: {message}")]
pub struct ElementError {
    pub pid: Pid,
    pub index: usize,
    pub message: String,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn aggregate_errors_list_failed_workers() {
        let err = PoolError::Broadcast {
            failures: vec![
                HandleError::WorkerIsDead { pid: 1 },
                HandleError::WorkerIsDead { pid: 3 },
            ],
        };
        assert_eq!(err.to_string(), "function broadcast failed for workers [1, 3]");
    }

    #[test]
    fn map_error_identifies_worker_and_index() {
        let err = MapError::from(HandleError::WorkerDied {
            pid: 2,
            index: Some(9),
        });
        assert_eq!(err.worker(), Some(2));
        assert_eq!(err.index(), Some(9));
        assert_eq!(err.as_label(), "map_worker_died");

        let err = MapError::from(PoolError::AlreadyRunning);
        assert_eq!(err.worker(), None);
        assert_eq!(err.index(), None);
    }
}
