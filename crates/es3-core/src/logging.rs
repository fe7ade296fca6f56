//! Logging init: stderr subscriber with a verbosity-derived filter.

use tracing_subscriber::EnvFilter;

/// Initialize logging to stderr. `verbosity` follows the CLI scale:
/// 0 = errors only, 1 = info, 2 = debug, 3+ = trace. `RUST_LOG` wins
/// when set so operators can scope filters per module.
pub fn init(verbosity: u32) {
    let default = match verbosity {
        0 => "error",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}
