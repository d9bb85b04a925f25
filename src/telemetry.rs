use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

/// Initialize structured logging for the orchestrator.
///
/// JSON output with span context gives every log line the correlation data
/// needed to follow a story across agent handoffs. Log sinks never see raw
/// credentials: everything user- or process-derived is routed through
/// [`crate::scrub::scrub`] before it is handed to `tracing`.
pub fn init_telemetry() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true),
        )
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    tracing::info!("DevOS orchestrator telemetry initialized with structured logging");
    Ok(())
}

/// Generate a correlation ID for linking related operations
pub fn generate_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Create a span with common pipeline attributes. The dispatcher wraps
/// every agent run in one of these, so executor and handoff logs carry the
/// correlation id.
pub fn create_pipeline_span(
    operation: &str,
    project_id: Option<&str>,
    story_id: Option<&str>,
    correlation_id: Option<&str>,
) -> tracing::Span {
    tracing::info_span!(
        "pipeline_operation",
        operation = operation,
        project.id = project_id,
        story.id = story_id,
        correlation.id = correlation_id,
    )
}

/// Shutdown telemetry gracefully
pub fn shutdown_telemetry() {
    tracing::info!("DevOS orchestrator telemetry shutdown complete");
}
