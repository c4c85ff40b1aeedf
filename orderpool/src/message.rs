use std::{
    cmp::Ordering,
    convert::Infallible,
    fmt,
    sync::Arc,
    time::{Duration, SystemTime},
};

use crate::{error::WorkerFault, Pid};

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// User function applied by a worker to every element it receives.
///
/// Shared behind an `Arc` so the same function can be broadcast to every
/// worker of a pool without cloning the closure itself.
pub type Transform<I, O> = Arc<dyn Fn(I) -> Result<O, BoxError> + Send + Sync>;

/// Wraps a fallible closure into a [`Transform`].
pub fn transform<I, O, E, F>(f: F) -> Transform<I, O>
where
    F: Fn(I) -> Result<O, E> + Send + Sync + 'static,
    E: Into<BoxError>,
{
    Arc::new(move |value| f(value).map_err(Into::into))
}

/// Wraps a closure that cannot fail into a [`Transform`].
pub fn infallible<I, O, F>(f: F) -> Transform<I, O>
where
    F: Fn(I) -> O + Send + Sync + 'static,
{
    transform(move |value| Ok::<_, Infallible>(f(value)))
}

/// Unit of work travelling between the distributor and exactly one worker.
///
/// Payloads are ordered (and compared) by `index` alone.
#[derive(Debug, Clone)]
pub struct DataPayload<T> {
    pub index: usize,
    pub value: T,
    /// Worker that processed (or is processing) the payload, for diagnostics.
    pub owner: Option<Pid>,
}

impl<T> DataPayload<T> {
    pub fn new(index: usize, value: T) -> Self {
        Self {
            index,
            value,
            owner: None,
        }
    }

    /// Replaces the value while keeping the index and owner.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> DataPayload<U> {
        DataPayload {
            index: self.index,
            value: f(self.value),
            owner: self.owner,
        }
    }
}

impl<T> PartialEq for DataPayload<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl<T> Eq for DataPayload<T> {}

impl<T> PartialOrd for DataPayload<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for DataPayload<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.index.cmp(&other.index)
    }
}

/// Snapshot of a worker's bookkeeping, sent in reply to a status request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStatus {
    pub pid: Pid,
    pub started_at: SystemTime,
    pub uptime: Duration,
    pub time_waiting: Duration,
    pub time_working: Duration,
    pub jobs_finished: u64,
}

/// Messages sent from the orchestrator to a worker.
pub enum Request<I, O> {
    Data(DataPayload<I>),
    ChangeFunction(Transform<I, O>),
    StatusRequest,
    Close,
}

impl<I: fmt::Debug, O> fmt::Debug for Request<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::Data(payload) => f.debug_tuple("Data").field(payload).finish(),
            Request::ChangeFunction(_) => f.write_str("ChangeFunction(..)"),
            Request::StatusRequest => f.write_str("StatusRequest"),
            Request::Close => f.write_str("Close"),
        }
    }
}

impl<I, O> Request<I, O> {
    /// Short name of the variant, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Data(_) => "data",
            Request::ChangeFunction(_) => "change_function",
            Request::StatusRequest => "status_request",
            Request::Close => "close",
        }
    }
}

/// Messages sent from a worker back to the orchestrator.
#[derive(Debug)]
pub enum Response<O> {
    Data(DataPayload<O>),
    Status(WorkerStatus),
    WorkerError {
        pid: Pid,
        fault: WorkerFault,
    },
    /// The user function failed (or panicked) on the element at `index`. The
    /// worker itself keeps running.
    UserFunctionError {
        pid: Pid,
        index: usize,
        error: String,
    },
}

impl<O> Response<O> {
    /// Short name of the variant, used in logs and protocol errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Response::Data(_) => "data",
            Response::Status(_) => "status",
            Response::WorkerError { .. } => "worker_error",
            Response::UserFunctionError { .. } => "user_function_error",
        }
    }

    /// Index of the element this response settles, if any.
    pub fn index(&self) -> Option<usize> {
        match self {
            Response::Data(payload) => Some(payload.index),
            Response::UserFunctionError { index, .. } => Some(*index),
            Response::WorkerError {
                fault: WorkerFault::NoFunction { index },
                ..
            } => Some(*index),
            Response::Status(_) => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn payloads_order_by_index_only() {
        let mut payloads = vec![
            DataPayload::new(2, "c"),
            DataPayload::new(0, "z"),
            DataPayload::new(1, "a"),
        ];
        payloads.sort();

        let indices: Vec<_> = payloads.iter().map(|p| p.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(DataPayload::new(4, "x"), DataPayload::new(4, "y"));
    }

    #[test]
    fn map_keeps_index_and_owner() {
        let mut payload = DataPayload::new(7, 3);
        payload.owner = Some(2);

        let mapped = payload.map(|v| v.to_string());
        assert_eq!(mapped.index, 7);
        assert_eq!(mapped.owner, Some(2));
        assert_eq!(mapped.value, "3");
    }

    #[test]
    fn transform_boxes_errors() {
        let f = transform(|x: i32| if x < 0 { Err("negative") } else { Ok(x) });

        assert_eq!(f(1).ok(), Some(1));
        assert_eq!(f(-1).unwrap_err().to_string(), "negative");
    }

    #[test]
    fn response_reports_settled_index() {
        let response: Response<()> = Response::UserFunctionError {
            pid: 0,
            index: 5,
            error: "boom".into(),
        };
        assert_eq!(response.index(), Some(5));
        assert_eq!(response.kind(), "user_function_error");
    }
}
