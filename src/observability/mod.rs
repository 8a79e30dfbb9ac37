use std::time::Instant;

use tracing_subscriber::EnvFilter;

use crate::session::SessionOutcome;

/// Initialize the tracing subscriber with the configured log level.
///
/// Maps config log levels to tracing levels:
/// - "DISABLED" -> no subscriber installed
/// - "WARNING" -> WARN
/// - "CRITICAL" -> ERROR
/// - Others map directly (DEBUG, INFO, ERROR)
pub fn init_tracing(log_level: &str) {
    let Some(filter) = filter_for_level(log_level) else {
        return;
    };

    // Diagnostics go to stderr; stdout carries the analysis text.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

fn filter_for_level(log_level: &str) -> Option<EnvFilter> {
    let level = log_level.to_uppercase();
    let tracing_level = match level.as_str() {
        "DISABLED" => return None,
        "WARNING" => "WARN",
        "CRITICAL" => "ERROR",
        other => other,
    };
    Some(EnvFilter::try_new(tracing_level).unwrap_or_else(|_| EnvFilter::new("INFO")))
}

/// Log how an analysis ended, with its wall-clock duration.
pub fn log_analysis_outcome(outcome: &SessionOutcome, start_time: Instant) {
    let elapsed_ms = start_time.elapsed().as_millis();
    match outcome {
        SessionOutcome::Completed(snapshot) => tracing::info!(
            elapsed_ms,
            answer_len = snapshot.answer_text.len(),
            reasoning_len = snapshot.reasoning_text.len(),
            "analysis finished"
        ),
        SessionOutcome::Failed(report) => tracing::warn!(
            elapsed_ms,
            category = ?report.error.category(),
            error = %report.error,
            partial_answer_len = report.partial_answer_text.len(),
            "analysis failed"
        ),
        SessionOutcome::Cancelled(snapshot) => tracing::info!(
            elapsed_ms,
            answer_len = snapshot.answer_text.len(),
            "analysis cancelled"
        ),
    }
}
