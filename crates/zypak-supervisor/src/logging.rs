use std::sync::Once;

use tracing::Level;

use crate::config::SupervisorConfig;

static INIT_LOGGING: Once = Once::new();

/// Installs a stderr `fmt` subscriber. The first call wins; later calls, or a
/// subscriber installed by the embedding process, leave things as they are.
pub fn init_logging(config: &SupervisorConfig) {
    let level = if config.debug {
        Level::DEBUG
    } else {
        Level::INFO
    };

    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_ansi(false)
            .try_init();
    });
}

/// Same as [`init_logging`] but routed through the test harness's capture.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .with_test_writer()
            .with_thread_names(true)
            .with_ansi(false)
            .try_init();
    });
}
