//! Client-side worker that fetches tasks and runs topic handlers.

mod backoff;
mod handler;
mod runner;

pub use backoff::{RetryDecision, RetryPolicy};
pub use handler::{HandlerError, TopicHandler};
pub use runner::{TopicWorker, TopicWorkerBuilder};
