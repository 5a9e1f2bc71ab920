use std::time::Duration;

use crate::{DotlockSettings, Options};

pub(crate) fn enable_logging() {
    let _ = env_logger::builder()
        .filter_level(log::LevelFilter::Trace)
        .format_timestamp(None)
        .is_test(true)
        .try_init();
}

/// Default options with short lock timeouts so contended tests fail fast.
pub(crate) fn test_options() -> Options {
    Options {
        dotlock: DotlockSettings {
            use_excl_lock: true,
            timeout: Duration::from_secs(5),
            stale_timeout: Duration::from_secs(60),
        },
        ..Options::default()
    }
}
