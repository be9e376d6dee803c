use std::sync::Once;

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

static LOG_INIT: Once = Once::new();

/// Directives used when neither `RUST_LOG` nor an explicit value is provided
pub const DEFAULT_DIRECTIVES: &str = "info";

/// Install the global tracing subscriber once per process.
///
/// `RUST_LOG` takes precedence over `default_value`, which itself falls back to
/// [`DEFAULT_DIRECTIVES`]. Later calls are no-ops, so every test may call it.
pub fn log_init(default_value: Option<&str>) {
    LOG_INIT.call_once(|| {
        let directives = std::env::var("RUST_LOG")
            .ok()
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| default_value.unwrap_or(DEFAULT_DIRECTIVES).to_owned());
        tracing_setup(&directives);
    });
}

fn tracing_setup(directives: &str) {
    let format = tracing_subscriber::fmt::layer()
        .with_level(true)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(true)
        .compact();

    let filter = EnvFilter::try_new(directives).unwrap_or_else(|e| {
        eprintln!("invalid log directives {directives:?}: {e}, using {DEFAULT_DIRECTIVES:?}");
        EnvFilter::new(DEFAULT_DIRECTIVES)
    });
    let (filter, _reload_handle) = tracing_subscriber::reload::Layer::new(filter);

    // another subscriber may already be installed by the host application
    if let Err(e) = tracing_subscriber::registry()
        .with(filter)
        .with(format)
        .try_init()
    {
        eprintln!("tracing subscriber not installed: {e}");
    }
}
