//! Tracing setup for host applications
//!
//! The library itself only emits `tracing` events; embedders that want the
//! default subscriber call [`init`] once at startup. `RUST_LOG` overrides
//! the verbosity knob.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install a stderr text subscriber.
///
/// `verbosity`: 0=error, 1=warn, 2=info, 3=debug, 4+=trace.
/// Silently does nothing if a subscriber is already installed.
pub fn init(verbosity: u8) {
    let level = match verbosity {
        0 => "error",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("oxidetty={level}")));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_file(verbosity >= 3)
                .with_line_number(verbosity >= 3),
        )
        .try_init();
}
