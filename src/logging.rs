/// Tracing subscriber setup for applications embedding RamLake.
///
/// The library only emits `tracing` events; it never installs a subscriber
/// on its own. Call one of these once at program start. Later calls are
/// ignored, since the global subscriber can only be set once per process.
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Install a formatted subscriber filtered by `RUST_LOG`, falling back to
/// `default_filter` (for example `"ramlake=info"`) when it is unset.
///
/// Returns false if a global subscriber was already installed.
pub fn init(default_filter: &str) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init()
        .is_ok()
}

/// Install a subscriber configured only from `RUST_LOG` (`ramlake=info` if unset).
pub fn try_init_from_env() -> bool {
    init("ramlake=info")
}
