//! Async runtime helpers
//!
//! Thin wrappers over tokio so spawned work shows up in profiling traces, plus the shutdown
//! plumbing shared by node binaries.

// Re-export sync primitives used by node loops
pub use tokio::sync::watch;

/// Spawn an async task on the current runtime.
pub fn spawn<F>(future: F) -> tokio::task::JoinHandle<F::Output>
where
    F: std::future::Future + Send + 'static,
    F::Output: Send + 'static,
{
    // Wrap the provided future in a profiling scope so spawned tasks are easier
    // to identify in profiling traces. When profiling is disabled this is a no-op.
    #[cfg(feature = "profiling")]
    {
        tokio::spawn(async move {
            profiling::scope!(
                "async_runtime::spawn",
                format!("task_type={}", std::any::type_name::<F>()).as_str()
            );
            future.await
        })
    }
    #[cfg(not(feature = "profiling"))]
    {
        tokio::spawn(future)
    }
}

/// Run blocking work (store calls, index sweeps) off the async worker threads.
pub fn spawn_blocking<F, R>(f: F) -> tokio::task::JoinHandle<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    #[cfg(feature = "profiling")]
    {
        tokio::task::spawn_blocking(move || {
            profiling::scope!("async_runtime::spawn_blocking");
            f()
        })
    }
    #[cfg(not(feature = "profiling"))]
    {
        tokio::task::spawn_blocking(f)
    }
}

/// Check if we're running inside a tokio runtime context.
pub fn in_runtime_context() -> bool {
    tokio::runtime::Handle::try_current().is_ok()
}

/// Shutdown broadcast: loops hold a receiver and stop once it turns `true`.
pub fn shutdown_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// Resolve once the process receives ctrl-c.
///
/// If the signal handler cannot be installed, this logs the error and never resolves, so
/// the node keeps running instead of shutting down at once.
pub async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Wait for ctrl-c, then tell every receiver of `shutdown` to stop.
pub async fn forward_ctrl_c(shutdown: watch::Sender<bool>) {
    ctrl_c().await;
    tracing::info!("Received ctrl-c, shutting down");
    // No receivers left means everything already stopped
    let _ = shutdown.send(true);
}

/// Wait until `shutdown` turns `true` (or its sender is dropped).
pub async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    // Only fails once the sender is gone, which also means shutdown
    let _ = shutdown.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_spawn_and_spawn_blocking() {
        assert!(in_runtime_context());
        assert_eq!(spawn(async { 21 * 2 }).await.unwrap(), 42);
        assert_eq!(spawn_blocking(|| "done").await.unwrap(), "done");
    }

    #[tokio::test]
    async fn test_wait_for_shutdown() {
        let (tx, mut rx) = shutdown_channel();
        let waiter = spawn(async move {
            wait_for_shutdown(&mut rx).await;
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_dropped_sender_counts_as_shutdown() {
        let (tx, mut rx) = shutdown_channel();
        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), wait_for_shutdown(&mut rx))
            .await
            .unwrap();
    }
}
