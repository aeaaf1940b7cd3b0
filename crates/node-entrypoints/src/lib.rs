//! Process entry points for fleet index nodes
//!
//! This crate provides the plumbing every node binary needs before it can do real work:
//! CLI and environment parsing, logging (and optional profiling) setup, build metadata,
//! and a few async runtime helpers.
//!
//! # Usage
//!
//! In your `main.rs`:
//!
//! ```ignore
//! fn main() -> std::process::ExitCode {
//!     node_entrypoints::run_native("Fleet Node", || async { my_node::run().await })
//! }
//! ```

pub mod async_runtime;
pub mod cli;
pub mod logging;

// Re-export commonly used items
pub use cli::{get_env, parse_args};
pub use logging::{LoggingGuard, setup_logging};

mod metadata;
pub use metadata::{BuildInfo, log_version_info, short_version_info};

use std::fmt::Display;
use std::future::Future;
use std::process::ExitCode;

/// Run a node on a multi-threaded tokio runtime.
///
/// Logging is set up before the runtime spawns its worker threads, and version info is
/// logged before `app_main` starts. An error returned by `app_main` is logged and turned
/// into a failure exit code.
pub fn run_native<F, Fut, E>(app_name: &str, app_main: F) -> ExitCode
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: Display,
{
    // Before the runtime: the default filter is written to the process environment, which
    // is only sound while no other thread runs. The guard outlives the runtime.
    let _guard = setup_logging();

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create Tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    rt.block_on(native_main_impl(app_name, app_main))
}

/// Internal implementation for the native entry point.
/// Use [`run_native`] instead of calling this directly.
#[doc(hidden)]
pub async fn native_main_impl<F, Fut, E>(app_name: &str, app_main: F) -> ExitCode
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: Display,
{
    log_version_info(app_name);

    match app_main().await {
        Ok(()) => {
            tracing::info!("{} stopped", app_name);
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("{} failed: {}", app_name, e);
            ExitCode::FAILURE
        }
    }
}
