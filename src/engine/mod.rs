//! Live run synchronization engine.
//!
//! Two independent channels feed one view of a backend pipeline run: the
//! push-based [`channel::EventChannelClient`] (log events, process-wide) and
//! the pull-based [`poller::StatusPoller`] (status snapshots, per run). The
//! [`session::RunSession`] owns the current run and merges what the poller
//! reports; [`log_buffer::LogAccumulator`] keeps the event history.

pub mod api;
pub mod channel;
pub mod log_buffer;
pub mod poller;
pub mod session;

use crate::model::{RunId, RunStatus, RunTicket};
use api::ApiError;
use async_trait::async_trait;

/// The run endpoints of the pipeline backend.
#[async_trait]
pub trait PipelineBackend: Send + Sync {
    async fn start_run(&self, dataset_path: &str) -> Result<RunTicket, ApiError>;

    async fn fetch_status(&self, run_id: &RunId) -> Result<RunStatus, ApiError>;
}
