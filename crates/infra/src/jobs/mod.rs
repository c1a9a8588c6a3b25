//! Resumable batch jobs.
//!
//! ## Components
//!
//! - `WorkQueue`: unbounded FIFO with an outstanding-work counter for drain-based shutdown
//! - `Engine`: fixed worker pool; each worker runs one message per unit of work
//! - `EngineLifecycle`: init-once / shutdown-once slot around an engine
//! - `Dispatcher`: routes a message to the handler for its type
//! - `ImportCompaniesHandler`: copies collection memberships one window at a time
//! - `JobService`: creates, looks up and resumes jobs
//!
//! A handler that has more work returns a continuation; the worker resubmits it to
//! the same queue before marking its own message done.

pub mod engine;
pub mod error;
pub mod import;
pub mod message;
pub mod queue;
pub mod service;
pub mod types;
mod worker;

pub use engine::{Engine, EngineConfig, EngineLifecycle, EngineStats, JobSubmitter};
pub use error::{EngineError, JobError};
pub use import::{IMPORT_BATCH_SIZE, ImportCompaniesHandler, MAX_IMPORT_BATCH_SIZE, Step};
pub use message::{Dispatched, Dispatcher, Message, MessageType};
pub use queue::WorkQueue;
pub use service::{JobService, ServiceError};
pub use types::{ImportState, JobRecord, JobStatus, JobUpdate, progress_message};
