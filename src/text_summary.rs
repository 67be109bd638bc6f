//! Text summary builder for CLI output.
//!
//! Formats the final run account as human-readable lines for stdout.

use crate::model::{RunOutcome, RunSummary};

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

fn outcome_label(outcome: &RunOutcome) -> String {
    match outcome {
        RunOutcome::Completed => "completed".to_string(),
        RunOutcome::AbortedEarly => "engine exited early".to_string(),
        RunOutcome::NoImages => "no images to process".to_string(),
        RunOutcome::Cancelled => "cancelled".to_string(),
        RunOutcome::Failed { reason } => format!("failed: {reason}"),
    }
}

pub(crate) fn build_text_summary(summary: &RunSummary) -> TextSummary {
    let mut lines = vec![
        format!("Outcome: {}", outcome_label(&summary.outcome)),
        format!(
            "Source: {} (threshold {})",
            summary.source.display(),
            summary.threshold
        ),
    ];

    // Nothing was staged for these, so counts would only be noise.
    if matches!(
        summary.outcome,
        RunOutcome::NoImages | RunOutcome::Failed { .. }
    ) && summary.processed == 0
    {
        return TextSummary { lines };
    }

    lines.push(format!(
        "Results: {}/{} processed ({} ok, {} failed)",
        summary.processed, summary.expected, summary.succeeded, summary.failed
    ));
    match summary.mean_of_means {
        Some(mean) => lines.push(format!("Mean of Avg_Sqrt_Area: {mean:.4}")),
        None => lines.push("Mean of Avg_Sqrt_Area: -".to_string()),
    }
    lines.push(format!("Report: {}", summary.report_path.display()));

    TextSummary { lines }
}
