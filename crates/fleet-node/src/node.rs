//! One aggregator node: caches, derived indexes and the loops that keep them healthy

use crate::error::Result;
use crate::feed::{FeedDirectory, SnapshotFeedScheduler};
use crate::settings::{SearchArgs, SearchKind};

use fleet_index_lib::{
    Config, Coordinator, DistributedLock, EntityCache, EntityKind, FleetCaches, FleetUpdater, GeoSearchEngine,
    Identifier, InMemoryLeaseLock, InMemorySpatialIndex, OrphanReconciler, Projector, Station,
    Vehicle, run_heartbeat, validate_codespaces, validate_systems,
};
use node_entrypoints::async_runtime::{self, watch};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

/// Caches, spatial indexes, projectors and search engine of one process
pub struct FleetNode {
    updater: Arc<FleetUpdater>,
    vehicle_projector: Arc<Projector<Vehicle>>,
    station_projector: Arc<Projector<Station>>,
    vehicle_reconciler: OrphanReconciler<Vehicle>,
    station_reconciler: OrphanReconciler<Station>,
    engine: GeoSearchEngine,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl FleetNode {
    /// Wire in-memory caches to fresh indexes. Projectors are attached before anything is
    /// written, so the indexes see every cache change.
    pub fn new(config: &Config) -> Result<Self> {
        let caches = FleetCaches::in_memory(config);
        let vehicle_index = Arc::new(InMemorySpatialIndex::new(EntityKind::Vehicle));
        let station_index = Arc::new(InMemorySpatialIndex::new(EntityKind::Station));

        let vehicle_projector = Arc::new(Projector::new(
            caches.vehicles.clone(),
            vehicle_index.clone(),
        )?);
        vehicle_projector.attach();
        let station_projector = Arc::new(Projector::new(
            caches.stations.clone(),
            station_index.clone(),
        )?);
        station_projector.attach();

        let engine = GeoSearchEngine::new(
            caches.vehicles.clone(),
            vehicle_index.clone(),
            caches.stations.clone(),
            station_index.clone(),
        )?;

        Ok(Self {
            vehicle_reconciler: OrphanReconciler::new(caches.vehicles.clone(), vehicle_index),
            station_reconciler: OrphanReconciler::new(caches.stations.clone(), station_index),
            updater: Arc::new(FleetUpdater::new(caches, config.clone())),
            vehicle_projector,
            station_projector,
            engine,
        })
    }

    #[inline]
    pub fn updater(&self) -> &Arc<FleetUpdater> {
        &self.updater
    }

    #[inline]
    pub fn engine(&self) -> &GeoSearchEngine {
        &self.engine
    }

    #[inline]
    pub fn caches(&self) -> &FleetCaches {
        self.updater.caches()
    }

    /// Remove orphaned members from both indexes. Returns the number of removed entities.
    pub fn sweep_orphans(&self) -> usize {
        let vehicles = self.vehicle_reconciler.reconcile();
        let stations = self.station_reconciler.reconcile();

        let mut total = 0;
        for (kind, result) in [
            (self.vehicle_reconciler.kind(), vehicles),
            (self.station_reconciler.kind(), stations),
        ] {
            match result {
                Ok(removed) if !removed.is_empty() => {
                    tracing::info!("Removed {} orphans in {} spatial index", removed.len(), kind);
                    total += removed.len();
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("Orphan sweep of {} spatial index failed: {}", kind, e),
            }
        }
        total
    }

    /// Evict expired entries from every cache. Returns the number of evicted entries.
    pub fn purge_expired(&self) -> usize {
        let caches = self.caches();
        [
            caches.vehicles.purge_expired(),
            caches.stations.purge_expired(),
            caches.systems.purge_expired(),
            caches.vehicle_types.purge_expired(),
            caches.pricing_plans.purge_expired(),
            caches.regions.purge_expired(),
            caches.geofencing_zones.purge_expired(),
        ]
        .into_iter()
        .map(|purged| {
            purged.unwrap_or_else(|e| {
                tracing::warn!("Expiry sweep failed: {}", e);
                0
            })
        })
        .sum()
    }

    /// Cache events the projectors could not apply so far
    pub fn failed_projections(&self) -> u64 {
        self.vehicle_projector.failed_events() + self.station_projector.failed_events()
    }

    /// Codespaces and system ids currently present in the caches
    pub fn known_codespaces_and_systems(&self) -> Result<(HashSet<String>, HashSet<String>)> {
        let caches = self.caches();
        let mut codespaces = HashSet::new();
        let mut systems = HashSet::new();
        let providers = caches
            .vehicles
            .values()?
            .into_iter()
            .map(|v| v.provider)
            .chain(caches.stations.values()?.into_iter().map(|s| s.provider));
        for provider in providers {
            codespaces.insert(provider.codespace);
            systems.insert(provider.system_id);
        }
        for system in caches.systems.values()? {
            if let Ok(id) = Identifier::parse(&system.id) {
                codespaces.insert(id.codespace().to_string());
            }
            systems.insert(system.id);
        }
        Ok((codespaces, systems))
    }

    /// Answer one search as pretty-printed JSON
    pub fn search_json(&self, args: &SearchArgs) -> Result<String> {
        let (codespaces, systems) = self.known_codespaces_and_systems()?;
        validate_codespaces(&args.codespaces, &codespaces)?;
        validate_systems(&args.systems, &systems)?;

        let params = args.parameters();
        let json = match args.kind {
            SearchKind::Vehicles => {
                let vehicles = self.engine.search_vehicles(&params, &args.vehicle_filter())?;
                serde_json::to_string_pretty(&vehicles)?
            }
            SearchKind::Stations => {
                let stations = self.engine.search_stations(&params, &args.station_filter())?;
                serde_json::to_string_pretty(&stations)?
            }
        };
        Ok(json)
    }
}

/// Expiry sweep on every node, orphan sweep only while leader
async fn run_maintenance(
    node: Arc<FleetNode>,
    coordinator: Arc<Coordinator>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires at once; nothing to sweep yet
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = async_runtime::wait_for_shutdown(&mut shutdown) => break,
        }

        let tick_node = node.clone();
        let leader = coordinator.is_leader();
        let (purged, orphans) = async_runtime::spawn_blocking(move || {
            let purged = tick_node.purge_expired();
            let orphans = if leader { tick_node.sweep_orphans() } else { 0 };
            (purged, orphans)
        })
        .await?;
        tracing::debug!(
            "Maintenance: {} expired entries, {} orphans (leader: {})",
            purged,
            orphans,
            leader
        );
    }
    Ok(())
}

/// Run a node until `shutdown` turns true, competing for an in-process leadership lock
pub async fn serve(config: Config, feed_dir: PathBuf, shutdown: watch::Receiver<bool>) -> Result<()> {
    let lock = InMemoryLeaseLock::new(config.lock_name.clone());
    serve_with_lock(config, feed_dir, Arc::new(lock.handle()), shutdown).await
}

/// Run a node against the given leadership lock.
///
/// Stops once `shutdown` turns true, or as soon as either background loop ends on its own,
/// in which case the other loop is stopped too and the loop's error is returned.
pub async fn serve_with_lock(
    config: Config,
    feed_dir: PathBuf,
    lock: Arc<dyn DistributedLock>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let node = Arc::new(FleetNode::new(&config)?);
    let source = Arc::new(FeedDirectory::new(feed_dir, node.updater().clone()));
    let scheduler = Arc::new(SnapshotFeedScheduler::new(
        source,
        config.feed_update_interval,
        tokio::runtime::Handle::current(),
    ));
    let coordinator = Arc::new(Coordinator::new(
        lock,
        scheduler,
        config.lock_wait,
        config.lock_lease,
    ));

    let (stop_tx, stop_rx) = async_runtime::shutdown_channel();
    let mut heartbeat = async_runtime::spawn(run_heartbeat(
        coordinator.clone(),
        config.heartbeat_interval,
        stop_rx.clone(),
    ));
    let mut maintenance = async_runtime::spawn(run_maintenance(
        node.clone(),
        coordinator,
        config.orphan_sweep_interval,
        stop_rx,
    ));

    let mut heartbeat_result = None;
    let mut maintenance_result = None;
    tokio::select! {
        _ = async_runtime::wait_for_shutdown(&mut shutdown) => {}
        result = &mut heartbeat => {
            tracing::warn!("Heartbeat loop ended, stopping node");
            heartbeat_result = Some(result);
        }
        result = &mut maintenance => {
            tracing::warn!("Maintenance loop ended, stopping node");
            maintenance_result = Some(result);
        }
    }
    // Fails only when both loops already dropped their receivers
    let _ = stop_tx.send(true);

    let heartbeat_result = match heartbeat_result {
        Some(result) => result,
        None => heartbeat.await,
    };
    let maintenance_result = match maintenance_result {
        Some(result) => result,
        None => maintenance.await,
    };
    heartbeat_result??;
    maintenance_result??;

    if node.failed_projections() > 0 {
        tracing::warn!("{} cache events could not be projected", node.failed_projections());
    }
    Ok(())
}

/// Load the feed directory once and answer a single query
pub async fn search(config: Config, feed_dir: PathBuf, args: SearchArgs) -> Result<String> {
    let node = Arc::new(FleetNode::new(&config)?);
    let source = FeedDirectory::new(feed_dir, node.updater().clone());
    let report = source.poll().await?;
    tracing::debug!("Loaded feeds: {:?}", report);

    async_runtime::spawn_blocking(move || node.search_json(&args)).await?
}
