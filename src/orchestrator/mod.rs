//! Application-level orchestration utilities.
//!
//! This module drives a run from the command line (start, follow, stop) and
//! handles post-run processing such as summaries and exports. CLI code calls
//! into this module so the engine stays free of presentation concerns.

mod controller;
mod post_process;

pub(crate) use controller::{follow_run, stream_logs, FollowOutcome};
pub(crate) use post_process::process_run_completion;
