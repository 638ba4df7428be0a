//! Post-run processing utilities.
//!
//! Builds the final summary and handles the optional JSON export after a
//! followed run ends.

use crate::cli::RunArgs;
use crate::engine::log_buffer::LogAccumulator;
use crate::engine::session::SessionView;
use crate::model::{AgentEvent, RunStatus};
use crate::text_summary;
use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;

/// Result of post-run processing, ready for presentation layers.
pub(crate) struct ProcessedRun {
    pub summary: Vec<String>,
    pub export_messages: Vec<String>,
}

#[derive(Serialize)]
struct RunExport<'a> {
    exported_at: String,
    status: Option<&'a RunStatus>,
    last_error: Option<&'a str>,
    logs: &'a [AgentEvent],
}

/// Summarize a finished run and export it if requested.
pub(crate) fn process_run_completion(
    args: &RunArgs,
    view: &SessionView,
    logs: &LogAccumulator,
) -> ProcessedRun {
    let summary = match view.latest_status.as_deref() {
        Some(status) => text_summary::build_text_summary(status).lines,
        None => vec![match view.current_run_id.as_ref() {
            Some(id) => format!("Run {id}: no status received"),
            None => "No run was started".to_string(),
        }],
    };

    let mut export_messages = Vec::new();
    if let Some(path) = args.export_json.as_deref() {
        match export_json(path, view, &logs.snapshot()) {
            Ok(()) => export_messages.push(format!("Exported JSON: {}", path.display())),
            Err(e) => export_messages.push(format!("Export JSON failed: {e:#}")),
        }
    }

    ProcessedRun {
        summary,
        export_messages,
    }
}

fn export_json(path: &Path, view: &SessionView, logs: &[AgentEvent]) -> Result<()> {
    let export = RunExport {
        exported_at: time::OffsetDateTime::now_utc()
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap_or_else(|_| "now".into()),
        status: view.latest_status.as_deref(),
        last_error: view.last_error.as_deref(),
        logs,
    };
    let body = serde_json::to_string_pretty(&export)?;
    std::fs::write(path, body).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}
