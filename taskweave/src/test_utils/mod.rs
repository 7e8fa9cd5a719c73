use crate::runtime::{Builder, Runtime};
use std::sync::Once;
use tracing_subscriber::EnvFilter;

mod recorder;
pub(crate) use recorder::{Event, Recorder};

static INIT_LOGGING: Once = Once::new();

/// Initialize test logging, filtered through `RUST_LOG` (warn by default).
///
/// Safe to call multiple times; only initializes once.
pub(crate) fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_thread_names(true)
            .with_ansi(false)
            .try_init();
    });
}

/// Runtime without threads, every queue is driven by the test itself.
pub(crate) fn manual_runtime() -> Runtime {
    init_test_logging();

    match Builder::new().worker_threads(0).try_build() {
        Ok(rt) => rt,
        Err(e) => panic!("failed to build manual runtime: {e:?}"),
    }
}

/// Runtime with `workers` threads serving the worker queue.
pub(crate) fn threaded_runtime(workers: usize) -> Runtime {
    init_test_logging();

    let built = Builder::new()
        .worker_threads(workers)
        .sleep_on_idle(std::time::Duration::from_micros(200))
        .try_build();

    match built {
        Ok(rt) => rt,
        Err(e) => panic!("failed to build runtime: {e:?}"),
    }
}
