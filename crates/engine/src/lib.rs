//! Transfer engine: splits files into hashed chunks, spreads them across
//! storage backends, and reassembles them on demand.
//!
//! The [`TransferQueue`] is the main entry point: enqueue uploads,
//! downloads, and deletions, consume [`TransferEvent`]s for presentation,
//! and let the coordinator handle retries, rate-limit pauses, and
//! cancellation. The orchestrators underneath are public for callers that
//! want to drive a single transfer without a queue.

mod config;
mod delete;
mod download;
mod error;
mod events;
mod queue;
mod retry;
#[cfg(test)]
mod testing;
mod upload;

pub use config::EngineConfig;
pub use delete::{DeleteReport, Deleter};
pub use download::DownloadOrchestrator;
pub use error::{EngineError, ErrorClass, classify, classify_backend};
pub use events::{JobId, JobInfo, QueueSnapshot, TransferEvent, TransferStage};
pub use queue::{Job, JobKind, TransferQueue};
pub use retry::RetryPolicy;
pub use upload::UploadOrchestrator;
