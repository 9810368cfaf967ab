//! Structured logging setup shared by every Backlot binary.
//!
//! - `LOG_FORMAT=json` switches to flattened JSON events for log aggregation
//! - `RUST_LOG` filters as usual, e.g. `RUST_LOG=bl_worker=debug,tower_http=info`
//!
//! Task-scoped context is attached through spans:
//!
//! ```rust,ignore
//! let span = tracing::info_span!("task", task_id = %message.id, task_name = %message.task_name);
//! handler.run(ctx).instrument(span).await
//! ```

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Install the global subscriber. Safe to call once per process.
pub fn init_logging(service_name: &str) {
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let env_filter = default_filter();

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true)
                    .flatten_event(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(true).with_ansi(true))
            .init();
    }

    tracing::debug!(service = %service_name, "Logging initialized");
}

fn default_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}
