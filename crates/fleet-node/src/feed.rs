//! Snapshot-directory feed pipeline
//!
//! Providers drop one normalized [`FleetSnapshot`] per file (`*.json`) into a directory.
//! Each poll applies every snapshot through the [`FleetUpdater`], remembering the last
//! applied snapshot per system so vehicles that disappear from a feed are removed. A system
//! whose file is gone is cleared from the caches.

use crate::error::{NodeError, Result};

use fleet_index_lib::{FeedUpdateScheduler, FleetSnapshot, FleetUpdater};
use node_entrypoints::async_runtime;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Outcome of one directory poll
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    pub applied: usize,
    pub failed: usize,
    pub cleared: usize,
}

/// A directory of provider snapshots feeding one updater
pub struct FeedDirectory {
    dir: PathBuf,
    updater: Arc<FleetUpdater>,
    previous: tokio::sync::Mutex<HashMap<String, FleetSnapshot>>,
}

impl FeedDirectory {
    pub fn new(dir: PathBuf, updater: Arc<FleetUpdater>) -> Self {
        Self {
            dir,
            updater,
            previous: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    #[inline]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Read the directory once and apply every snapshot in it.
    ///
    /// Polls are serialized. A snapshot that fails to parse or apply is logged and skipped;
    /// while any file failed to parse, no system is cleared.
    pub async fn poll(&self) -> Result<PollReport> {
        let (snapshots, unreadable) = load_snapshots(&self.dir).await?;
        let mut previous = self.previous.lock().await;
        let mut report = PollReport {
            failed: unreadable,
            ..Default::default()
        };

        let mut seen = HashSet::with_capacity(snapshots.len());
        for snapshot in snapshots {
            let system_id = snapshot.provider.system_id.clone();
            if !seen.insert(system_id.clone()) {
                tracing::warn!("Several snapshots for system {}; applying each in turn", system_id);
            }

            let updater = self.updater.clone();
            let before = previous.get(&system_id).cloned();
            let applied = async_runtime::spawn_blocking(move || {
                updater
                    .apply_snapshot(before.as_ref(), &snapshot)
                    .map(|update| (snapshot, update))
            })
            .await?;

            match applied {
                Ok((snapshot, update)) => {
                    tracing::debug!("Applied snapshot of {}: {:?}", system_id, update);
                    previous.insert(system_id, snapshot);
                    report.applied += 1;
                }
                Err(e) => {
                    tracing::warn!("Failed to apply snapshot of {}: {}", system_id, e);
                    report.failed += 1;
                }
            }
        }

        if unreadable == 0 {
            let gone: Vec<String> = previous
                .keys()
                .filter(|system_id| !seen.contains(*system_id))
                .cloned()
                .collect();
            for system_id in gone {
                let updater = self.updater.clone();
                let target = system_id.clone();
                match async_runtime::spawn_blocking(move || updater.clear_system(&target)).await? {
                    Ok(_) => {
                        previous.remove(&system_id);
                        report.cleared += 1;
                    }
                    Err(e) => tracing::warn!("Failed to clear system {}: {}", system_id, e),
                }
            }
        }

        Ok(report)
    }
}

/// Parse every `*.json` file of `dir`, in file name order.
///
/// Returns the snapshots and the number of files that could not be read or parsed.
async fn load_snapshots(dir: &Path) -> Result<(Vec<FleetSnapshot>, usize)> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(NodeError::FeedDirMissing(dir.to_path_buf()));
        }
        Err(e) => return Err(e.into()),
    };

    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut snapshots = Vec::with_capacity(paths.len());
    let mut unreadable = 0;
    for path in paths {
        match read_snapshot(&path).await {
            Ok(snapshot) => snapshots.push(snapshot),
            Err(e) => {
                tracing::warn!("Skipping snapshot {}: {}", path.display(), e);
                unreadable += 1;
            }
        }
    }
    Ok((snapshots, unreadable))
}

async fn read_snapshot(path: &Path) -> Result<FleetSnapshot> {
    let contents = tokio::fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&contents)?)
}

/// Polls a [`FeedDirectory`] on a fixed interval while started
pub struct SnapshotFeedScheduler {
    source: Arc<FeedDirectory>,
    interval: Duration,
    runtime: Handle,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SnapshotFeedScheduler {
    /// `runtime` runs the polling task; start and stop may be called from any thread.
    pub fn new(source: Arc<FeedDirectory>, interval: Duration, runtime: Handle) -> Self {
        Self {
            source,
            interval,
            runtime,
            task: Mutex::new(None),
        }
    }

    fn task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_running(&self) -> bool {
        self.task().as_ref().is_some_and(|t| !t.is_finished())
    }
}

async fn poll_forever(source: Arc<FeedDirectory>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match source.poll().await {
            Ok(report) if report.failed > 0 => tracing::warn!(
                "Feed update from {}: {} applied, {} failed",
                source.dir().display(),
                report.applied,
                report.failed
            ),
            Ok(report) => tracing::debug!("Feed update: {:?}", report),
            Err(e) => tracing::warn!("Feed update from {} failed: {}", source.dir().display(), e),
        }
    }
}

impl FeedUpdateScheduler for SnapshotFeedScheduler {
    fn start(&self) {
        let mut task = self.task();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        tracing::info!(
            "Polling {} every {:?}",
            self.source.dir().display(),
            self.interval
        );
        let _runtime = self.runtime.enter();
        *task = Some(async_runtime::spawn(poll_forever(
            self.source.clone(),
            self.interval,
        )));
    }

    fn stop(&self) {
        if let Some(task) = self.task().take() {
            task.abort();
            tracing::info!("Stopped polling {}", self.source.dir().display());
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use fleet_index_lib::{
        Config, EntityCache, FeedProvider, FleetCaches, FormFactor, PropulsionType, Vehicle,
        VehicleType,
    };

    /// Fresh, empty scratch directory unique to one test
    pub(crate) fn create_test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("fleet-node-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    pub(crate) fn create_test_snapshot(codespace: &str, vehicles: &[(&str, f64, f64)]) -> FleetSnapshot {
        let provider = FeedProvider {
            codespace: codespace.to_string(),
            system_id: format!("{codespace}:System:1"),
            operator_id: format!("{codespace}:Operator:1"),
            operator_name: codespace.to_string(),
        };
        FleetSnapshot {
            provider: provider.clone(),
            last_updated: 0,
            ttl: 0,
            vehicles: vehicles
                .iter()
                .map(|(id, lon, lat)| Vehicle {
                    id: id.to_string(),
                    lat: Some(*lat),
                    lon: Some(*lon),
                    provider: provider.clone(),
                    vehicle_type: VehicleType {
                        id: format!("{codespace}:VehicleType:scooter"),
                        form_factor: FormFactor::Scooter,
                        propulsion_type: PropulsionType::Electric,
                        name: None,
                        max_range_meters: None,
                    },
                    pricing_plan_id: None,
                    current_range_meters: None,
                    reserved: false,
                    disabled: false,
                })
                .collect(),
            ..Default::default()
        }
    }

    pub(crate) fn write_snapshot(dir: &Path, file: &str, snapshot: &FleetSnapshot) {
        std::fs::write(dir.join(file), serde_json::to_string(snapshot).unwrap()).unwrap();
    }

    fn create_test_updater() -> Arc<FleetUpdater> {
        let config = Config::default();
        Arc::new(FleetUpdater::new(FleetCaches::in_memory(&config), config))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_poll_applies_and_clears() {
        let dir = create_test_dir("poll");
        let updater = create_test_updater();
        let source = FeedDirectory::new(dir.clone(), updater.clone());

        write_snapshot(&dir, "tst.json", &create_test_snapshot("TST", &[("TST:Vehicle:1", 10.0, 59.9), ("TST:Vehicle:2", 10.1, 59.9)]));
        write_snapshot(&dir, "yvo.json", &create_test_snapshot("YVO", &[("YVO:Vehicle:1", 10.2, 59.9)]));
        std::fs::write(dir.join("README.txt"), "not a snapshot").unwrap();

        let report = source.poll().await.unwrap();
        assert_eq!(report, PollReport { applied: 2, failed: 0, cleared: 0 });
        assert_eq!(updater.caches().vehicles.count().unwrap(), 3);

        // Vehicle 1 leaves the TST feed, the YVO feed goes away entirely
        write_snapshot(&dir, "tst.json", &create_test_snapshot("TST", &[("TST:Vehicle:2", 10.1, 59.9)]));
        std::fs::remove_file(dir.join("yvo.json")).unwrap();

        let report = source.poll().await.unwrap();
        assert_eq!(report, PollReport { applied: 1, failed: 0, cleared: 1 });
        assert_eq!(updater.caches().vehicles.count().unwrap(), 1);
        assert!(updater.caches().vehicles.has_key("TST:Vehicle:2").unwrap());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unreadable_file_blocks_clearing() {
        let dir = create_test_dir("unreadable");
        let updater = create_test_updater();
        let source = FeedDirectory::new(dir.clone(), updater.clone());

        write_snapshot(&dir, "tst.json", &create_test_snapshot("TST", &[("TST:Vehicle:1", 10.0, 59.9)]));
        source.poll().await.unwrap();

        // Corrupt the only file: its system must not be cleared on a guess
        std::fs::write(dir.join("tst.json"), "{ truncated").unwrap();
        let report = source.poll().await.unwrap();
        assert_eq!(report, PollReport { applied: 0, failed: 1, cleared: 0 });
        assert_eq!(updater.caches().vehicles.count().unwrap(), 1);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_missing_directory() {
        let source = FeedDirectory::new(PathBuf::from("/nonexistent/fleet-feeds"), create_test_updater());
        assert!(matches!(source.poll().await, Err(NodeError::FeedDirMissing(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_scheduler_start_stop_idempotent() {
        let dir = create_test_dir("scheduler");
        let updater = create_test_updater();
        write_snapshot(&dir, "tst.json", &create_test_snapshot("TST", &[("TST:Vehicle:1", 10.0, 59.9)]));

        let source = Arc::new(FeedDirectory::new(dir.clone(), updater.clone()));
        let scheduler = SnapshotFeedScheduler::new(source, Duration::from_millis(20), Handle::current());

        scheduler.stop();
        assert!(!scheduler.is_running());

        scheduler.start();
        scheduler.start();
        assert!(scheduler.is_running());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(updater.caches().vehicles.has_key("TST:Vehicle:1").unwrap());

        scheduler.stop();
        scheduler.stop();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!scheduler.is_running());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
