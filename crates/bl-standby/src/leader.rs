//! Leader election over a lease backend.
//!
//! - Acquire with a TTL, extend every refresh interval
//! - Step down as soon as an extend fails or the local view of the lease runs out
//! - Release on shutdown so a standby can take over without waiting for expiry

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Result, StandbyError};
use crate::lease::{LeaseBackend, RedisLease};

/// Configuration for leader election
#[derive(Debug, Clone)]
pub struct LeaderElectionConfig {
    /// Key holding the lease
    pub lock_key: String,

    /// Lease TTL
    pub ttl: Duration,

    /// How often the leader extends and standbys poll (must be below the TTL)
    pub refresh_interval: Duration,

    /// Unique identifier for this instance
    pub instance_id: String,
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self {
            lock_key: "backlot:scheduler:leader".to_string(),
            ttl: Duration::from_secs(30),
            refresh_interval: Duration::from_secs(1),
            instance_id: Uuid::new_v4().to_string(),
        }
    }
}

impl LeaderElectionConfig {
    pub fn with_lock_key(mut self, key: impl Into<String>) -> Self {
        self.lock_key = key.into();
        self
    }

    pub fn with_instance_id(mut self, id: impl Into<String>) -> Self {
        self.instance_id = id.into();
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.refresh_interval.is_zero() || self.refresh_interval >= self.ttl {
            return Err(StandbyError::Config(format!(
                "refresh interval {:?} must be non-zero and shorter than the lease TTL {:?}",
                self.refresh_interval, self.ttl
            )));
        }
        if self.instance_id.is_empty() {
            return Err(StandbyError::Config("instance id must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Leadership status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadershipStatus {
    /// This instance holds the lease
    Leader,
    /// Another instance holds the lease
    Follower,
    /// Lease backend unreachable
    Unknown,
}

/// Leader election manager
pub struct LeaderElection {
    config: LeaderElectionConfig,
    backend: Arc<dyn LeaseBackend>,
    is_leader: AtomicBool,
    running: AtomicBool,
    /// When our lease expires as far as we know; leadership is void past it.
    lease_deadline: Mutex<Option<Instant>>,
    shutdown_tx: broadcast::Sender<()>,
    status_tx: watch::Sender<LeadershipStatus>,
    status_rx: watch::Receiver<LeadershipStatus>,
}

impl LeaderElection {
    pub fn new(config: LeaderElectionConfig, backend: Arc<dyn LeaseBackend>) -> Result<Self> {
        config.validate()?;
        let (shutdown_tx, _) = broadcast::channel(1);
        let (status_tx, status_rx) = watch::channel(LeadershipStatus::Unknown);

        Ok(Self {
            config,
            backend,
            is_leader: AtomicBool::new(false),
            running: AtomicBool::new(false),
            lease_deadline: Mutex::new(None),
            shutdown_tx,
            status_tx,
            status_rx,
        })
    }

    /// Election over a Redis lease.
    pub async fn redis(config: LeaderElectionConfig, redis_url: &str) -> Result<Self> {
        let backend = RedisLease::connect(redis_url).await?;
        Self::new(config, Arc::new(backend))
    }

    /// Check if this instance is currently the leader
    pub fn is_leader(&self) -> bool {
        if !self.is_leader.load(Ordering::SeqCst) {
            return false;
        }
        self.lease_deadline
            .lock()
            .is_some_and(|deadline| Instant::now() < deadline)
    }

    /// Get current leadership status
    pub fn status(&self) -> LeadershipStatus {
        *self.status_rx.borrow()
    }

    /// Subscribe to leadership status changes
    pub fn subscribe(&self) -> watch::Receiver<LeadershipStatus> {
        self.status_rx.clone()
    }

    /// Start the election loop in the background
    pub fn start(self: Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(StandbyError::AlreadyRunning);
        }

        info!(
            instance_id = %self.config.instance_id,
            lock_key = %self.config.lock_key,
            ttl_ms = self.config.ttl.as_millis() as u64,
            "Starting leader election"
        );

        let election = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(election.config.refresh_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        election.tick().await;
                    }
                    _ = shutdown_rx.recv() => {
                        info!(instance_id = %election.config.instance_id, "Leader election shutting down");
                        election.release_leadership().await;
                        break;
                    }
                }
            }
        });

        Ok(())
    }

    /// One election round: extend if leading, otherwise try to acquire.
    pub async fn tick(&self) {
        let key = &self.config.lock_key;
        let id = &self.config.instance_id;
        let attempt_started = Instant::now();

        if self.is_leader() {
            match self.backend.extend(key, id, self.config.ttl).await {
                Ok(true) => {
                    self.renew_deadline(attempt_started);
                    debug!(instance_id = %id, "Extended leadership lease");
                }
                Ok(false) => {
                    warn!(instance_id = %id, "Lease taken over by another instance");
                    self.set_status(LeadershipStatus::Follower);
                }
                Err(e) => {
                    error!(error = %e, "Failed to extend lease");
                    self.set_status(LeadershipStatus::Unknown);
                }
            }
        } else {
            match self.backend.try_acquire(key, id, self.config.ttl).await {
                Ok(true) => {
                    self.renew_deadline(attempt_started);
                    info!(instance_id = %id, "Acquired leadership");
                    self.set_status(LeadershipStatus::Leader);
                }
                Ok(false) => {
                    debug!(instance_id = %id, "Leadership held by another instance");
                    self.set_status(LeadershipStatus::Follower);
                }
                Err(e) => {
                    error!(error = %e, "Failed to acquire leadership");
                    self.set_status(LeadershipStatus::Unknown);
                }
            }
        }
    }

    // Measured from before the backend call, so the local deadline never outlives the real lease.
    fn renew_deadline(&self, attempt_started: Instant) {
        *self.lease_deadline.lock() = Some(attempt_started + self.config.ttl);
    }

    async fn release_leadership(&self) {
        if !self.is_leader() {
            self.set_status(LeadershipStatus::Follower);
            return;
        }

        match self
            .backend
            .release(&self.config.lock_key, &self.config.instance_id)
            .await
        {
            Ok(true) => {
                info!(instance_id = %self.config.instance_id, "Released leadership");
            }
            Ok(false) => {
                debug!(instance_id = %self.config.instance_id, "Leadership was already released");
            }
            Err(e) => {
                error!(error = %e, "Failed to release leadership");
            }
        }

        self.set_status(LeadershipStatus::Follower);
    }

    fn set_status(&self, status: LeadershipStatus) {
        let was_leader = self.is_leader.load(Ordering::SeqCst);
        let is_now_leader = status == LeadershipStatus::Leader;

        self.is_leader.store(is_now_leader, Ordering::SeqCst);
        if !is_now_leader {
            *self.lease_deadline.lock() = None;
        }
        let _ = self.status_tx.send(status);

        if was_leader != is_now_leader {
            metrics::gauge!("backlot.scheduler.is_leader").set(if is_now_leader { 1.0 } else { 0.0 });
            if is_now_leader {
                info!(instance_id = %self.config.instance_id, "Became leader");
            } else {
                info!(instance_id = %self.config.instance_id, "Lost leadership");
            }
        }
    }

    /// Stop the election loop and release the lease.
    pub async fn shutdown(&self) {
        info!(instance_id = %self.config.instance_id, "Stopping leader election");
        self.running.store(false, Ordering::SeqCst);
        if self.shutdown_tx.send(()).is_err() {
            // Loop never started; release directly
            self.release_leadership().await;
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.config.instance_id
    }
}

/// Standby-aware wrapper that gates operations on leadership
#[derive(Clone)]
pub struct StandbyGuard {
    election: Arc<LeaderElection>,
}

impl StandbyGuard {
    pub fn new(election: Arc<LeaderElection>) -> Self {
        Self { election }
    }

    /// Run a function only if we're the leader
    pub async fn run_if_leader<F, Fut, T>(&self, f: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        if self.election.is_leader() {
            Some(f().await)
        } else {
            None
        }
    }

    /// Check if we should process (are leader)
    pub fn should_process(&self) -> bool {
        self.election.is_leader()
    }

    /// Wait until we become leader
    pub async fn wait_for_leadership(&self) {
        let mut rx = self.election.subscribe();

        while *rx.borrow_and_update() != LeadershipStatus::Leader {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
}
