//! Cluster singleton coordination
//!
//! Every node runs a heartbeat that tries to take a named lease lock with a bounded wait.
//! The node holding the lock runs the feed update scheduler; all others keep it stopped.
//! A node that dies simply stops renewing, and its lease runs out.
//!
//! Brief leaderless windows (up to one lease) are accepted in exchange for a simple protocol.

use crate::utils::deadline_after;
use crate::{FleetError, Result};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// Leadership state of one node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LeaderState {
    #[default]
    NotLeader,
    Leader,
}

/// Named mutual-exclusion lease in a shared store
pub trait DistributedLock: Send + Sync {
    fn name(&self) -> &str;

    /// Try to take (or renew) the lock, waiting at most `wait`. A successful acquisition
    /// holds for `lease` unless renewed.
    ///
    /// Fails with [`FleetError::LockAcquisitionInterrupted`] when the wait is interrupted.
    fn try_lock(&self, wait: Duration, lease: Duration) -> Result<bool>;

    /// Whether this holder currently owns an unexpired lease
    fn is_held(&self) -> bool;

    /// Give the lock up if held
    fn release(&self);
}

/// Polling pipeline gated by leadership. Both operations are idempotent.
pub trait FeedUpdateScheduler: Send + Sync {
    fn start(&self);
    fn stop(&self);
}

#[derive(Debug)]
struct Lease {
    holder: u64,
    expires_at: Instant,
}

/// Process-local lease lock shared by any number of [`LeaseHandle`]s.
///
/// Stands in for a lock in a shared store when nodes share a process (tests, single node).
#[derive(Debug, Clone)]
pub struct InMemoryLeaseLock {
    name: Arc<str>,
    lease: Arc<Mutex<Option<Lease>>>,
    next_holder: Arc<AtomicU64>,
}

impl InMemoryLeaseLock {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Arc::from(name.into()),
            lease: Arc::new(Mutex::new(None)),
            next_holder: Arc::new(AtomicU64::new(1)),
        }
    }

    /// A new contender for this lock
    pub fn handle(&self) -> LeaseHandle {
        LeaseHandle {
            lock: self.clone(),
            holder: self.next_holder.fetch_add(1, Ordering::Relaxed),
            interrupted: AtomicBool::new(false),
        }
    }

    fn lease(&self) -> MutexGuard<'_, Option<Lease>> {
        self.lease.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One contender's view of an [`InMemoryLeaseLock`]
#[derive(Debug)]
pub struct LeaseHandle {
    lock: InMemoryLeaseLock,
    holder: u64,
    interrupted: AtomicBool,
}

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(5);

impl LeaseHandle {
    /// Interrupt the current (or next) lock wait
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    fn try_take(&self, lease: Duration) -> bool {
        let now = Instant::now();
        let mut current = self.lock.lease();
        let free = match current.as_ref() {
            None => true,
            Some(l) => l.holder == self.holder || l.expires_at <= now,
        };
        if free {
            *current = Some(Lease {
                holder: self.holder,
                expires_at: deadline_after(now, lease),
            });
        }
        free
    }
}

impl DistributedLock for LeaseHandle {
    fn name(&self) -> &str {
        &self.lock.name
    }

    fn try_lock(&self, wait: Duration, lease: Duration) -> Result<bool> {
        let deadline = deadline_after(Instant::now(), wait);
        loop {
            if self.interrupted.swap(false, Ordering::SeqCst) {
                return Err(FleetError::LockAcquisitionInterrupted(self.name().to_string()));
            }
            if self.try_take(lease) {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            std::thread::sleep(LOCK_POLL_INTERVAL.min(deadline - now));
        }
    }

    fn is_held(&self) -> bool {
        self.lock
            .lease()
            .as_ref()
            .is_some_and(|l| l.holder == self.holder && l.expires_at > Instant::now())
    }

    fn release(&self) {
        let mut current = self.lock.lease();
        if current.as_ref().is_some_and(|l| l.holder == self.holder) {
            *current = None;
        }
    }
}

/// Drives a [`FeedUpdateScheduler`] from lock heartbeats
pub struct Coordinator {
    state: Mutex<LeaderState>,
    lock: Arc<dyn DistributedLock>,
    scheduler: Arc<dyn FeedUpdateScheduler>,
    wait: Duration,
    lease: Duration,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl Coordinator {
    pub fn new(
        lock: Arc<dyn DistributedLock>,
        scheduler: Arc<dyn FeedUpdateScheduler>,
        wait: Duration,
        lease: Duration,
    ) -> Self {
        Self {
            state: Mutex::new(LeaderState::NotLeader),
            lock,
            scheduler,
            wait,
            lease,
        }
    }

    fn state(&self) -> MutexGuard<'_, LeaderState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// One heartbeat tick: take or renew the lock and start or stop the scheduler to match.
    ///
    /// The state lock is held for the whole tick, so concurrent calls are serialized.
    pub fn heartbeat(&self) -> Result<LeaderState> {
        let mut state = self.state();
        match self.lock.try_lock(self.wait, self.lease) {
            Ok(true) => {
                if *state == LeaderState::NotLeader {
                    tracing::info!("Acquired lock '{}', starting feed updates", self.lock.name());
                    self.scheduler.start();
                    *state = LeaderState::Leader;
                }
            }
            Ok(false) => {
                if *state == LeaderState::Leader {
                    tracing::warn!("Lost lock '{}', stopping feed updates", self.lock.name());
                    self.scheduler.stop();
                    *state = LeaderState::NotLeader;
                }
            }
            Err(e) => {
                tracing::warn!("{}, stopping feed updates", e);
                self.scheduler.stop();
                *state = LeaderState::NotLeader;
                return Err(e);
            }
        }
        Ok(*state)
    }

    /// Leader by the last heartbeat, with a lease that has not run out since
    pub fn is_leader(&self) -> bool {
        *self.state() == LeaderState::Leader && self.lock.is_held()
    }

    #[inline]
    pub fn lock_name(&self) -> &str {
        self.lock.name()
    }

    /// Stop the scheduler and give the lock up
    pub fn shutdown(&self) {
        let mut state = self.state();
        self.scheduler.stop();
        self.lock.release();
        *state = LeaderState::NotLeader;
        tracing::info!("Released lock '{}'", self.lock.name());
    }
}

/// Heartbeat loop: one tick every `interval` until `shutdown` turns true.
///
/// Ticks never overlap; a slow lock attempt delays the next tick. On shutdown the scheduler
/// is stopped and the lock released. An interrupted lock attempt ends the loop with the error.
pub async fn run_heartbeat(
    coordinator: Arc<Coordinator>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let result = loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break Ok(());
                }
                continue;
            }
        }

        let tick = coordinator.clone();
        match tokio::task::spawn_blocking(move || tick.heartbeat()).await {
            Ok(Ok(state)) => tracing::trace!("Heartbeat on '{}': {:?}", coordinator.lock_name(), state),
            Ok(Err(e)) => break Err(e),
            Err(e) => tracing::error!("Heartbeat task failed: {}", e),
        }
    };

    coordinator.shutdown();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingScheduler {
        running: AtomicBool,
        starts: AtomicU64,
        stops: AtomicU64,
    }

    impl FeedUpdateScheduler for RecordingScheduler {
        fn start(&self) {
            if !self.running.swap(true, Ordering::SeqCst) {
                self.starts.fetch_add(1, Ordering::SeqCst);
            }
        }
        fn stop(&self) {
            if self.running.swap(false, Ordering::SeqCst) {
                self.stops.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    impl RecordingScheduler {
        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }
    }

    const WAIT: Duration = Duration::from_millis(10);
    const LEASE: Duration = Duration::from_millis(80);

    type TestNode = (Arc<Coordinator>, Arc<RecordingScheduler>, Arc<LeaseHandle>);

    fn create_test_node(lock: &InMemoryLeaseLock, lease: Duration) -> TestNode {
        let handle = Arc::new(lock.handle());
        let scheduler = Arc::new(RecordingScheduler::default());
        let coordinator = Arc::new(Coordinator::new(handle.clone(), scheduler.clone(), WAIT, lease));
        (coordinator, scheduler, handle)
    }

    #[test]
    fn test_single_leader_and_failover() {
        let lock = InMemoryLeaseLock::new("leader");
        let (a, a_scheduler, _) = create_test_node(&lock, LEASE);
        let (b, b_scheduler, _) = create_test_node(&lock, LEASE);

        assert_eq!(a.heartbeat().unwrap(), LeaderState::Leader);
        assert_eq!(b.heartbeat().unwrap(), LeaderState::NotLeader);
        assert!(a.is_leader() && !b.is_leader());
        assert!(a_scheduler.is_running() && !b_scheduler.is_running());

        // Renewal keeps the leader and does not restart its scheduler
        assert_eq!(a.heartbeat().unwrap(), LeaderState::Leader);
        assert_eq!(a_scheduler.starts.load(Ordering::SeqCst), 1);

        // A stops renewing; once its lease runs out, B takes over
        std::thread::sleep(LEASE + Duration::from_millis(20));
        assert!(!a.is_leader());
        assert_eq!(b.heartbeat().unwrap(), LeaderState::Leader);
        assert!(b.is_leader());

        // A notices on its next tick
        assert_eq!(a.heartbeat().unwrap(), LeaderState::NotLeader);
        assert!(!a_scheduler.is_running());
        assert_eq!(a_scheduler.stops.load(Ordering::SeqCst), 1);
        assert!(b_scheduler.is_running());
    }

    #[test]
    fn test_interrupt_stops_scheduler_and_propagates() {
        let lock = InMemoryLeaseLock::new("leader");
        let (coordinator, scheduler, handle) = create_test_node(&lock, LEASE);
        coordinator.heartbeat().unwrap();
        assert!(scheduler.is_running());

        handle.interrupt();
        let err = coordinator.heartbeat().unwrap_err();
        assert_eq!(err, FleetError::LockAcquisitionInterrupted("leader".to_string()));
        assert!(!scheduler.is_running());
        assert!(!coordinator.is_leader());
    }

    #[test]
    fn test_shutdown_releases_lock() {
        let lock = InMemoryLeaseLock::new("leader");
        let (a, a_scheduler, _) = create_test_node(&lock, LEASE);
        let (b, _, _) = create_test_node(&lock, LEASE);

        a.heartbeat().unwrap();
        a.shutdown();
        assert!(!a_scheduler.is_running());
        // No need to wait for the lease
        assert_eq!(b.heartbeat().unwrap(), LeaderState::Leader);
    }

    #[test]
    fn test_contended_acquisition_waits_at_most_the_bound() {
        let lock = InMemoryLeaseLock::new("leader");
        let first = lock.handle();
        let second = lock.handle();
        assert!(first.try_lock(WAIT, Duration::from_secs(10)).unwrap());

        let started = Instant::now();
        assert!(!second.try_lock(Duration::from_millis(30), LEASE).unwrap());
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(first.is_held() && !second.is_held());
    }

    #[test]
    fn test_concurrent_contenders_exclusive() {
        let lock = InMemoryLeaseLock::new("leader");
        let nodes: Vec<_> = (0..4).map(|_| create_test_node(&lock, Duration::from_secs(10))).collect();

        std::thread::scope(|scope| {
            for (coordinator, _, _) in &nodes {
                scope.spawn(move || {
                    for _ in 0..5 {
                        coordinator.heartbeat().unwrap();
                    }
                });
            }
        });

        let leaders = nodes.iter().filter(|(c, _, _)| c.is_leader()).count();
        let running = nodes.iter().filter(|(_, s, _)| s.is_running()).count();
        assert_eq!(leaders, 1);
        assert_eq!(running, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_heartbeat_loop_starts_and_shuts_down() {
        let lock = InMemoryLeaseLock::new("leader");
        let (coordinator, scheduler, _) = create_test_node(&lock, LEASE);
        let (tx, rx) = watch::channel(false);

        let task = tokio::spawn(run_heartbeat(coordinator.clone(), Duration::from_millis(20), rx));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(coordinator.is_leader());
        assert!(scheduler.is_running());

        tx.send(true).unwrap();
        task.await.unwrap().unwrap();
        assert!(!scheduler.is_running());
        assert!(!coordinator.is_leader());
        assert!(lock.handle().try_lock(WAIT, LEASE).unwrap());
    }

    #[test]
    fn test_huge_wait_and_lease_do_not_overflow() {
        let lock = InMemoryLeaseLock::new("leader");
        let handle = lock.handle();
        assert!(handle.try_lock(Duration::MAX, Duration::MAX).unwrap());
        assert!(handle.is_held());
        assert!(!lock.handle().try_lock(Duration::ZERO, LEASE).unwrap());
    }

    /// Time until `condition` holds, polling for at most `limit`
    async fn time_until(limit: Duration, condition: impl Fn() -> bool) -> Option<Duration> {
        let started = Instant::now();
        while started.elapsed() < limit {
            if condition() {
                return Some(started.elapsed());
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        None
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_heartbeat_loops_hand_over_on_shutdown() {
        const HEARTBEAT: Duration = Duration::from_millis(50);
        let lock = InMemoryLeaseLock::new("leader");
        let (a, a_scheduler, _) = create_test_node(&lock, Duration::from_millis(200));
        let (b, b_scheduler, _) = create_test_node(&lock, Duration::from_millis(200));
        let (a_tx, a_rx) = watch::channel(false);
        let (b_tx, b_rx) = watch::channel(false);

        let a_task = tokio::spawn(run_heartbeat(a.clone(), HEARTBEAT, a_rx));
        assert!(time_until(Duration::from_secs(1), || a.is_leader()).await.is_some());
        let b_task = tokio::spawn(run_heartbeat(b.clone(), HEARTBEAT, b_rx));
        tokio::time::sleep(HEARTBEAT * 3).await;
        assert!(a.is_leader() && !b.is_leader());
        assert!(!b_scheduler.is_running());

        // A graceful stop releases the lock, so B's next tick wins it
        a_tx.send(true).unwrap();
        a_task.await.unwrap().unwrap();
        let handover = time_until(Duration::from_secs(1), || b.is_leader()).await.unwrap();
        assert!(handover <= HEARTBEAT * 2, "handover took {handover:?}");
        assert!(b_scheduler.is_running() && !a_scheduler.is_running());

        b_tx.send(true).unwrap();
        b_task.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_heartbeat_loops_take_over_after_leader_dies() {
        const HEARTBEAT: Duration = Duration::from_millis(20);
        let lock = InMemoryLeaseLock::new("leader");
        let (a, _, _) = create_test_node(&lock, LEASE);
        let (b, b_scheduler, _) = create_test_node(&lock, LEASE);
        let (_a_tx, a_rx) = watch::channel(false);
        let (b_tx, b_rx) = watch::channel(false);

        let a_task = tokio::spawn(run_heartbeat(a.clone(), HEARTBEAT, a_rx));
        assert!(time_until(Duration::from_secs(1), || a.is_leader()).await.is_some());
        let b_task = tokio::spawn(run_heartbeat(b.clone(), HEARTBEAT, b_rx));

        // A vanishes without releasing; B waits out the lease, then wins on its next tick
        a_task.abort();
        let _ = a_task.await;
        assert!(!b.is_leader());
        let takeover = time_until(Duration::from_secs(2), || b.is_leader()).await.unwrap();
        assert!(takeover <= LEASE + HEARTBEAT * 3, "takeover took {takeover:?}");
        assert!(!a.is_leader());
        assert!(b_scheduler.is_running());

        b_tx.send(true).unwrap();
        b_task.await.unwrap().unwrap();
    }
}
