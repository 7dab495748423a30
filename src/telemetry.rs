//! Tracing subscriber setup for binaries and tests.

use tracing_subscriber::EnvFilter;

/// Environment variable consulted before `RUST_LOG`.
pub const LOG_ENV: &str = "BIOTRACK_LOG";

/// Installs a stderr `fmt` subscriber.
///
/// `verbosity` selects the default level (0 = warn, 1 = info, 2 = debug,
/// 3+ = trace) when neither `BIOTRACK_LOG` nor `RUST_LOG` is set. Calling
/// this more than once is harmless.
pub fn init(verbosity: u8) {
    let default = match verbosity {
        0 => "biotrack=warn",
        1 => "biotrack=info",
        2 => "biotrack=debug",
        _ => "biotrack=trace",
    };
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init();
}
