use once_cell::sync::OnceCell;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::queue::Serializer;
use crate::sink::QueueLayer;

static INIT: OnceCell<()> = OnceCell::new();

/// Installs the process-wide `tracing` subscriber. `RUST_LOG` overrides
/// `default_filter`. Only the first call has any effect, later ones are no-ops.
pub fn init(default_filter: &str) {
    INIT.get_or_init(|| {
        let filter = env_filter(default_filter);
        // Fails only if some other subscriber got installed first; that one stays.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init();
    });
}

fn env_filter(default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
}

/// Like [`init`], and also hands every event to `queue_layer`. The filter only applies
/// to the console; the queue keeps its own minimum level. `false` when a subscriber was
/// already installed, in which case `queue_layer` is dropped.
pub fn init_with_queue<F: Serializer + 'static>(default_filter: &str, queue_layer: QueueLayer<F>) -> bool {
    let mut installed = false;
    INIT.get_or_init(|| {
        let console = tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_filter(env_filter(default_filter));
        installed = tracing_subscriber::registry().with(console).with(queue_layer).try_init().is_ok();
    });
    installed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init("debug");
        init("trace");
        assert!(INIT.get().is_some());
        tracing::debug!("logging initialised twice without panicking");
    }
}
