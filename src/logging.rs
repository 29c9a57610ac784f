//! Subscriber setup for the binary. Library code only emits events through
//! `tracing` and never installs anything itself.
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};

/// Installs the global subscriber. `RUST_LOG` wins over `verbose` when set.
///
/// Log lines are written through the indicatif layer, so they are printed
/// above the progress bars instead of tearing them.
pub fn init(verbose: bool) -> Result<(), TryInitError> {
    let default = if verbose { "mimesis=debug" } else { "mimesis=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let indicatif_layer = IndicatifLayer::new();
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(indicatif_layer.get_stderr_writer());

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(indicatif_layer)
        .try_init()
}
