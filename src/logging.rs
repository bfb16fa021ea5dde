use std::sync::Once;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::error::{Result, SchemaError};

static LOGGING_INIT: Once = Once::new();

/// Installs a global tracing subscriber for processes embedding the cache.
///
/// The filter comes from `RUST_LOG` and defaults to `info`. With `json`
/// set, events are written as flattened JSON objects. Repeated calls are
/// no-ops once initialization has run.
pub fn init_logging(json: bool) -> Result<()> {
    let mut init_result = Ok(());

    LOGGING_INIT.call_once(|| {
        let registry = tracing_subscriber::registry().with(default_env_filter());
        let installed = if json {
            registry
                .with(
                    fmt::layer()
                        .json()
                        .flatten_event(true)
                        .with_current_span(false)
                        .with_span_list(false)
                        .with_target(true)
                        .with_level(true),
                )
                .try_init()
        } else {
            registry.with(fmt::layer().compact()).try_init()
        };
        init_result = installed.map_err(|error| SchemaError::Config {
            details: format!("failed to initialize logging: {}", error),
        });
    });

    init_result
}

fn default_env_filter() -> EnvFilter {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new("info"),
    }
}
