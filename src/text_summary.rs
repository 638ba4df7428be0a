//! Text summary builder for CLI output.
//!
//! Turns a final run snapshot into human-readable lines for text mode.

use crate::model::{ColorJitter, RunPhase, RunStatus};

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

/// Build a text summary from the last snapshot of a run.
pub(crate) fn build_text_summary(status: &RunStatus) -> TextSummary {
    let mut lines = Vec::new();

    let outcome = match &status.phase {
        RunPhase::Running => "still running",
        RunPhase::Completed => "completed",
        RunPhase::Failed { .. } => "FAILED",
    };
    lines.push(format!("Run {}: {outcome}", status.run_id));
    if let Some(stage) = status.current_stage.as_deref() {
        lines.push(format!("Stage: {stage}"));
    }

    if let Some(stats) = status.dataset_stats.as_ref() {
        lines.push(format!(
            "Dataset: {} images, {} classes, imbalance {:.2}",
            stats.size, stats.num_classes, stats.imbalance_ratio
        ));
        lines.push(format!(
            "Quality: avg blur {:.1}, avg noise {:.2}",
            stats.avg_blur, stats.avg_noise
        ));
        // BTreeMap keeps class names sorted.
        for (class, count) in &stats.class_dist {
            lines.push(format!("  {class}: {count}"));
        }
    }

    if let Some(plan) = status.aug_plan.as_ref() {
        let jitter = match plan.color_jitter {
            ColorJitter::None | ColorJitter::Other => "none",
            ColorJitter::Low => "low",
            ColorJitter::Medium => "medium",
        };
        lines.push(format!(
            "Augmentation: rotation {}°, flip {}, color jitter {jitter}",
            plan.rotation,
            if plan.flip { "on" } else { "off" }
        ));
    }

    if let Some(sel) = status.selected_model.as_ref() {
        lines.push(format!("Model: {} ({})", sel.selected_model, sel.reason));
    }

    if let Some(res) = status.model_results.as_ref() {
        lines.push(format!(
            "Results: accuracy {:.1}%, F1 {:.1}%",
            res.accuracy * 100.0,
            res.f1_score * 100.0
        ));
        lines.push(format!("Saved model: {}", res.model_path));
    }

    if let RunPhase::Failed { error } = &status.phase {
        lines.push(format!(
            "Error: {}",
            error.as_deref().unwrap_or("Pipeline failed")
        ));
    }

    TextSummary { lines }
}
