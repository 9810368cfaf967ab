//! Failover between instances sharing one lease.

use std::sync::Arc;
use std::time::Duration;

use bl_standby::{
    LeaderElection, LeaderElectionConfig, LeadershipStatus, LeaseBackend, MemoryLease, StandbyGuard,
};

fn election(lease: &Arc<MemoryLease>, id: &str) -> Arc<LeaderElection> {
    let config = LeaderElectionConfig::default()
        .with_instance_id(id)
        .with_ttl(Duration::from_secs(3))
        .with_refresh_interval(Duration::from_secs(1));
    Arc::new(LeaderElection::new(config, lease.clone() as Arc<dyn LeaseBackend>).unwrap())
}

#[tokio::test(start_paused = true)]
async fn test_single_leader_among_instances() {
    let lease = Arc::new(MemoryLease::new());
    let a = election(&lease, "a");
    let b = election(&lease, "b");

    a.tick().await;
    b.tick().await;

    assert!(a.is_leader());
    assert!(!b.is_leader());
    assert_eq!(a.status(), LeadershipStatus::Leader);
    assert_eq!(b.status(), LeadershipStatus::Follower);
    assert_eq!(lease.holder("backlot:scheduler:leader").as_deref(), Some("a"));
}

#[tokio::test(start_paused = true)]
async fn test_standby_takes_over_after_lease_lapses() {
    let lease = Arc::new(MemoryLease::new());
    let a = election(&lease, "a");
    let b = election(&lease, "b");

    a.tick().await;
    b.tick().await;
    assert!(a.is_leader());

    // leader goes silent (crash); the standby keeps polling
    for _ in 0..2 {
        tokio::time::advance(Duration::from_secs(1)).await;
        b.tick().await;
        assert!(!b.is_leader());
    }

    tokio::time::advance(Duration::from_secs(2)).await;
    b.tick().await;
    assert!(b.is_leader());
    assert!(!a.is_leader());

    // the old leader notices on its next round
    a.tick().await;
    assert_eq!(a.status(), LeadershipStatus::Follower);
}

#[tokio::test(start_paused = true)]
async fn test_leader_keeps_lease_while_refreshing() {
    let lease = Arc::new(MemoryLease::new());
    let a = election(&lease, "a");
    let b = election(&lease, "b");

    a.tick().await;
    for _ in 0..10 {
        tokio::time::advance(Duration::from_secs(1)).await;
        a.tick().await;
        b.tick().await;
        assert!(a.is_leader());
        assert!(!b.is_leader());
    }
}

#[tokio::test]
async fn test_shutdown_releases_lease() {
    let lease = Arc::new(MemoryLease::new());
    let a = election(&lease, "a");
    let b = election(&lease, "b");

    a.clone().start().unwrap();
    StandbyGuard::new(a.clone()).wait_for_leadership().await;

    a.shutdown().await;
    tokio::time::timeout(Duration::from_secs(2), async {
        while lease.holder("backlot:scheduler:leader").is_some() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    b.tick().await;
    assert!(b.is_leader());
}

#[tokio::test]
async fn test_start_twice_is_rejected() {
    let lease = Arc::new(MemoryLease::new());
    let a = election(&lease, "a");
    a.clone().start().unwrap();
    assert!(a.clone().start().is_err());
    a.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_guard_runs_only_on_leader() {
    let lease = Arc::new(MemoryLease::new());
    let a = election(&lease, "a");
    let b = election(&lease, "b");
    a.tick().await;
    b.tick().await;

    let ran_a = StandbyGuard::new(a).run_if_leader(|| async { 1 }).await;
    let guard_b = StandbyGuard::new(b);
    let ran_b = guard_b.run_if_leader(|| async { 2 }).await;

    assert_eq!(ran_a, Some(1));
    assert_eq!(ran_b, None);
    assert!(!guard_b.should_process());
}
