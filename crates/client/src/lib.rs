//! ComfyUI job submission and status-tracking client.
//!
//! Submits a workflow over HTTP, then follows its execution through the
//! server's WebSocket event stream: a [`JobTracker`] keeps a
//! thread-safe [`JobStatus`] up to date, wakes blocked waiters on every
//! transition, and notifies an optional [`StatusObserver`]. REST
//! helpers cover history retrieval, artifact download, and image
//! upload.

pub mod api;
mod channel;
pub mod config;
mod dispatch;
pub mod history;
pub mod messages;
pub mod observer;
pub mod status;
pub mod tracker;

pub use api::{ArtifactRef, ComfyApi, ComfyApiError, SubmitResponse};
pub use config::ClientConfig;
pub use history::output_artifacts;
pub use observer::{FnObserver, NoopObserver, StatusObserver};
pub use status::{JobState, JobStatus};
pub use tracker::JobTracker;
