//! Execution-id threading (spec.md §4.10). Every public entry point mints an
//! `ExecutionId` and opens a `tracing::Span` carrying it, so every log line,
//! event, and stream message emitted while the span is active can be
//! correlated back to one invocation — the teacher's `tracing` +
//! `tracing-subscriber` idiom (`env-filter`, present in every Cargo.toml in
//! the pack), generalized from per-request to per-sync-invocation spans.

use shared::ids::ExecutionId;
use tracing::Span;

/// Mint a fresh `ExecutionId` and open a span scoped to it. Entered spans
/// attach `execution_id` to every event logged within, without threading the
/// id through every function signature by hand.
pub fn new_execution_span(operation: &'static str) -> (ExecutionId, Span) {
    let execution_id = ExecutionId::new();
    let span = tracing::info_span!("execution", operation, execution_id = %execution_id);
    (execution_id, span)
}

/// Initialize the process-wide subscriber (teacher's
/// `utils/logger.rs::init_logger_with_file`, simplified to stdout-only since
/// this engine runs as a batch CLI, not a long-lived edge server).
pub fn init_tracing(log_level: &str) {
    tracing_subscriber::fmt()
        .with_max_level(log_level.parse().unwrap_or(tracing::Level::INFO))
        .with_target(false)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_execution_span_mints_a_fresh_id_each_call() {
        let (id_a, _) = new_execution_span("sync");
        let (id_b, _) = new_execution_span("sync");
        assert_ne!(id_a, id_b);
    }
}
