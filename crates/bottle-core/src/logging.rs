//! Logger bootstrap shared by the binaries.

use std::sync::Once;

const LOG_ENV: &str = "BOTTLE_LOG";

static INIT: Once = Once::new();

/// Install the process-wide logger once. `BOTTLE_LOG` wins over `RUST_LOG`,
/// which wins over `default_level`.
pub fn init(default_level: &str) {
    INIT.call_once(|| {
        let filter = std::env::var(LOG_ENV)
            .or_else(|_| std::env::var("RUST_LOG"))
            .unwrap_or_else(|_| default_level.to_string());

        let _ = env_logger::Builder::new()
            .parse_filters(&filter)
            .format_timestamp_secs()
            .target(env_logger::Target::Stderr)
            .try_init();
    });
}
