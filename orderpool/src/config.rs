//! # Runtime configuration.
//!
//! [`Config`] decides how many workers a pool runs, how they are isolated,
//! how deep their channels are, whether jobs time out and what a failing
//! user function does to a `map` call.
//!
//! # Example
//! ```
//! use std::{num::NonZeroUsize, time::Duration};
//! use orderpool::{Config, ErrorPolicy, Isolation};
//!
//! let mut cfg = Config::default();
//! cfg.workers = NonZeroUsize::new(3).unwrap();
//! cfg.isolation = Isolation::Thread;
//! cfg.job_timeout = Some(Duration::from_secs(5));
//! cfg.error_policy = ErrorPolicy::AbortMap;
//!
//! assert_eq!(cfg.workers.get(), 3);
//! ```

use std::{num::NonZeroUsize, thread, time::Duration};

/// Execution context a worker loop runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Isolation {
    /// A tokio task on the caller's runtime. Cheapest, but a user function
    /// that blocks also blocks that runtime thread.
    #[default]
    Task,
    /// A dedicated OS thread driving its own single-threaded runtime.
    Thread,
}

/// What a `map` call does when the user function fails on one element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorPolicy {
    /// Record an error marker at that element's position and keep going.
    #[default]
    PerElement,
    /// Fail the whole call with the first user function error.
    AbortMap,
}

#[derive(Clone, Debug)]
pub struct Config {
    /// Number of workers in the pool.
    pub workers: NonZeroUsize,
    pub isolation: Isolation,
    /// Capacity of each direction of every worker channel.
    pub channel_capacity: usize,
    /// Longest a single element may stay with a worker (`None` = no limit).
    /// A worker over the limit is terminated and the `map` call fails.
    pub job_timeout: Option<Duration>,
    pub error_policy: ErrorPolicy,
}

impl Default for Config {
    /// - `workers` = available parallelism (1 if unknown)
    /// - `isolation = Task`
    /// - `channel_capacity = 1024`
    /// - `job_timeout = None`
    /// - `error_policy = PerElement`
    fn default() -> Self {
        Self {
            workers: thread::available_parallelism().unwrap_or(NonZeroUsize::MIN),
            isolation: Isolation::default(),
            channel_capacity: 1024,
            job_timeout: None,
            error_policy: ErrorPolicy::default(),
        }
    }
}

impl Config {
    /// Default configuration with a fixed number of workers.
    pub fn with_workers(workers: NonZeroUsize) -> Self {
        Self {
            workers,
            ..Self::default()
        }
    }
}
