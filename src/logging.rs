use log::LevelFilter;
use std::sync::OnceLock;

static LOGGER_INIT: OnceLock<()> = OnceLock::new();

/// Install the process logger once. `RUST_LOG` overrides the default `info` level.
pub fn init() {
    LOGGER_INIT.get_or_init(|| {
        let _ = env_logger::Builder::new()
            .filter_level(LevelFilter::Info)
            .parse_default_env()
            .format_timestamp_millis()
            .try_init();
    });
}
