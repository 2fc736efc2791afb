//! Message Pipeline
//!
//! One ingest loop moves messages from the source subscription into the
//! bounded hand-off queue without ever blocking on it; a fixed pool of
//! workers drains the queue, routes, transforms and publishes.

mod ingest;
mod worker;

pub use ingest::{IngestLoop, Offer};
pub use worker::{ProcessError, Worker, WorkerContext};
