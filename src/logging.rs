use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub type LogHandle =
    tracing_subscriber::reload::Handle<tracing_subscriber::EnvFilter, tracing_subscriber::Registry>;

fn layers() -> (
    tracing_subscriber::reload::Layer<tracing_subscriber::EnvFilter, tracing_subscriber::Registry>,
    LogHandle,
) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::reload::Layer::new(env_filter)
}

/// Installs the global subscriber. The returned handle swaps the filter at
/// runtime. Panics if a subscriber is already installed.
pub fn init_logging() -> LogHandle {
    let (filter, reload_handle) = layers();
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact().with_target(true))
        .init();
    reload_handle
}

/// Like [`init_logging`], but returns `None` when a subscriber is already
/// installed (tests call it repeatedly).
pub fn try_init_logging() -> Option<LogHandle> {
    let (filter, reload_handle) = layers();
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_target(true)
                .with_test_writer(),
        )
        .try_init()
        .ok()?;
    Some(reload_handle)
}
