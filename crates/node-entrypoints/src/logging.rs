/*!
Logging and profiling setup for node binaries.

Two implementations share one API:

- real: compiled with `feature = "profiling"`. Adds a `tracing-chrome` layer recording a
  `trace-*.json` file when `ENABLE_PROFILING` is set at startup.
- stub: compiled in all other configurations; logging only.

Logs go to stderr so stdout stays free for command output.

Top-level API (always available):
- `setup_logging() -> LoggingGuard`: call it before spawning threads (or building a
  multi-threaded runtime), since it may set `RUST_LOG`
- `is_profiling_enabled() -> bool`
*/

/// Default filter for debug builds, when `RUST_LOG` is not set
const DEBUG_FILTER: &str = "info,fleet_index_lib=debug,fleet_node=debug,node_entrypoints=debug";
/// Default filter for release builds, when `RUST_LOG` is not set
const RELEASE_FILTER: &str = "info";

/// Install the default filter into `RUST_LOG` when it is unset.
///
/// # Safety
///
/// No other thread may read or write the environment concurrently.
unsafe fn set_default_filter() {
    if std::env::var("RUST_LOG").is_err() {
        // Safety: upheld by the caller
        unsafe {
            if cfg!(debug_assertions) {
                std::env::set_var("RUST_LOG", DEBUG_FILTER);
            } else {
                std::env::set_var("RUST_LOG", RELEASE_FILTER);
            }
        }
    }
}

#[cfg(feature = "profiling")]
mod inner {
    use std::sync::atomic::{AtomicBool, Ordering};

    use tracing_chrome::{ChromeLayerBuilder, FlushGuard};
    use tracing_subscriber::Registry;
    use tracing_subscriber::prelude::*;

    static PROFILING_ENABLED: AtomicBool = AtomicBool::new(false);

    /// Keeps the trace file open; dropping it flushes the recorded trace.
    #[must_use = "dropping the guard flushes and closes the trace file"]
    pub struct LoggingGuard {
        _flush: Option<FlushGuard>,
    }

    /// Initialize logging, and start a profiling session if `ENABLE_PROFILING` is set.
    pub fn setup_logging() -> LoggingGuard {
        use tracing_subscriber::EnvFilter;
        use tracing_subscriber::fmt;

        // Safety: documented precondition of `setup_logging`, honored by `run_native`
        unsafe { super::set_default_filter() };
        let fmt_layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(EnvFilter::from_default_env());

        let (chrome_layer, flush) = if std::env::var("ENABLE_PROFILING").is_ok() {
            let (layer, guard) = ChromeLayerBuilder::<Registry>::new().include_args(true).build();
            (Some(layer), Some(guard))
        } else {
            (None, None)
        };
        PROFILING_ENABLED.store(flush.is_some(), Ordering::Relaxed);

        tracing_subscriber::registry()
            .with(chrome_layer)
            .with(fmt_layer)
            .init();

        if flush.is_some() {
            tracing::info!("Logging initialized, recording chrome trace (ENABLE_PROFILING)");
        } else {
            tracing::info!("Logging initialized (set ENABLE_PROFILING to record a trace)");
        }
        LoggingGuard { _flush: flush }
    }

    pub fn is_profiling_enabled() -> bool {
        PROFILING_ENABLED.load(Ordering::Relaxed)
    }
}

#[cfg(not(feature = "profiling"))]
mod inner {
    use tracing_subscriber::prelude::*;

    /// Nothing to flush without profiling
    #[must_use]
    pub struct LoggingGuard;

    /// Initialize logging with sensible defaults; profiling is a no-op here.
    pub fn setup_logging() -> LoggingGuard {
        use tracing_subscriber::EnvFilter;
        use tracing_subscriber::fmt;

        // Safety: documented precondition of `setup_logging`, honored by `run_native`
        unsafe { super::set_default_filter() };

        let fmt_layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(EnvFilter::from_default_env());
        let registry = tracing_subscriber::registry().with(fmt_layer);
        registry.init();

        tracing::info!("Logging initialized (profiling disabled in this build)");
        LoggingGuard
    }

    pub fn is_profiling_enabled() -> bool {
        false
    }
}

// Re-export a stable API surface regardless of which `inner` module was compiled.
pub use inner::{LoggingGuard, is_profiling_enabled, setup_logging};
