//! Fleet Node - application library
//!
//! Wires the fleet index library to a feed directory, a leadership coordinator and the
//! command line.

mod error;
mod feed;
mod node;
mod settings;

pub use error::{NodeError, Result};
pub use feed::{FeedDirectory, PollReport, SnapshotFeedScheduler};
pub use node::{FleetNode, search, serve, serve_with_lock};
pub use settings::{Command, SearchArgs, SearchKind, Settings};

use node_entrypoints::async_runtime;

/// Run the command selected on the command line
pub async fn run(settings: Settings) -> Result<()> {
    let config = settings.config();
    let feed_dir = settings.feed_dir();
    tracing::debug!("Resolved configuration: {:?}", config);

    match settings.command {
        Command::Serve => {
            let (tx, rx) = async_runtime::shutdown_channel();
            async_runtime::spawn(async_runtime::forward_ctrl_c(tx));
            tracing::info!(
                "Serving feeds from {} (lock '{}')",
                feed_dir.display(),
                config.lock_name
            );
            serve(config, feed_dir, rx).await
        }
        Command::Search(args) => {
            let json = search(config, feed_dir, args).await?;
            println!("{json}");
            Ok(())
        }
    }
}
