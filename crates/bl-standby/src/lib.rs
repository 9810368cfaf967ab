//! Backlot Standby Mode
//!
//! Leased-lock leader election so that only one scheduler instance fires
//! periodic tasks while the others wait on standby.
//!
//! # Features
//!
//! - **Leased lock**: acquire with a TTL, extend every refresh interval, release on shutdown
//! - **Automatic failover**: a standby takes over once the leader's lease lapses
//! - **Standby Guard**: helper to gate work on leadership status
//!
//! # Example
//!
//! ```no_run
//! use bl_standby::{LeaderElection, LeaderElectionConfig, StandbyGuard};
//! use std::sync::Arc;
//!
//! async fn example() {
//!     let config = LeaderElectionConfig::default().with_lock_key("backlot:scheduler:leader");
//!     let election = Arc::new(
//!         LeaderElection::redis(config, "redis://localhost:6379").await.unwrap(),
//!     );
//!     election.clone().start().unwrap();
//!
//!     let guard = StandbyGuard::new(election.clone());
//!     guard.wait_for_leadership().await;
//!     guard.run_if_leader(|| async { println!("firing schedules") }).await;
//! }
//! ```

mod error;
mod leader;
mod lease;

pub use error::{Result, StandbyError};
pub use leader::{LeaderElection, LeaderElectionConfig, LeadershipStatus, StandbyGuard};
pub use lease::{LeaseBackend, MemoryLease, RedisLease};
