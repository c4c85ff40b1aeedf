//! Ordered parallel map over a fixed pool of isolated workers.
//!
//! A [`Distributor`] feeds elements to the workers of a [`Pool`], collects
//! their results in whatever order they complete and hands them back in the
//! order the elements were given.
//!
//! ```no_run
//! use orderpool::{message::infallible, Config, Distributor};
//!
//! # async fn run() -> Result<(), orderpool::error::MapError> {
//! let mut distributor = Distributor::new(Config::default());
//! let squares = distributor.map(infallible(|x: u64| x * x), 0..7).await?;
//! # Ok(())
//! # }
//! ```
pub mod channel;
pub mod config;
pub mod distributor;
pub mod error;
pub mod handle;
pub mod message;
pub mod pool;
pub mod worker;

pub use crate::{
    config::{Config, ErrorPolicy, Isolation},
    distributor::Distributor,
    handle::WorkerHandle,
    message::{DataPayload, Request, Response, Transform, WorkerStatus},
    pool::Pool,
};

// NOTE(jdb): Identity of a worker, assigned by the pool when the handle is
// created and stamped on every payload the worker processes. Never derived
// from ambient process state.
pub type Pid = usize;
