//! Logging setup
//!
//! The library only emits `tracing` events. Binaries and tests call
//! [`init_tracing`] once to install a formatter.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install a `fmt` subscriber filtered by `RUST_LOG`, falling back to
/// `default_directive`. Returns `false` if a subscriber was already set.
pub fn init_tracing(default_directive: &str) -> bool {
    let filter = std::env::var("RUST_LOG")
        .ok()
        .and_then(|v| EnvFilter::try_new(v).ok())
        .unwrap_or_else(|| EnvFilter::new(default_directive));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}

/// Default filter for a run; `verbose` enables per-slot debug events
pub fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "progressive_hedging=debug,info"
    } else {
        "progressive_hedging=info,warn"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let _ = init_tracing(default_directive(false));
        assert!(!init_tracing(default_directive(true)));
    }
}
