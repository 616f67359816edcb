//! dblock Core Integration Tests
//!
//! The first part runs against the in-process backend. The `live` module
//! needs a database configured through the `DBLOCK_*` environment variables
//! and only builds with the `integration-tests` feature.

use dblock_core::driver::MemoryLockServer;
use dblock_core::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn factory(server: &MemoryLockServer) -> LockFactory {
    LockFactory::from_driver(server.connect())
}

#[tokio::test]
async fn test_multi_lock_workflow() {
    let server = MemoryLockServer::new();
    let alice = factory(&server);
    let bob = factory(&server);

    let transfer = alice.create_multi_lock(["account:2", "account:1"]).unwrap();
    transfer.acquire().await.unwrap();

    let audit = bob.create_lock("account:1");
    assert!(!audit.try_acquire().await.unwrap());

    let other = bob.create_multi_lock(["account:3", "account:4"]).unwrap();
    assert!(other.try_acquire().await.unwrap());

    transfer.release().await.unwrap();
    assert!(audit.try_acquire().await.unwrap());
}

#[tokio::test]
async fn test_synchronize_counter_across_connections() {
    let server = MemoryLockServer::new();
    let counter = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let lock = factory(&server).create_lock("counter");
        let counter = counter.clone();
        handles.push(tokio::spawn(async move {
            lock.synchronize(|| async {
                // read-modify-write with a yield in between
                let value = counter.load(Ordering::SeqCst);
                tokio::task::yield_now().await;
                counter.store(value + 1, Ordering::SeqCst);
                Ok::<_, std::io::Error>(())
            })
            .await
        }));
    }

    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    assert_eq!(counter.load(Ordering::SeqCst), 8);
}

#[tokio::test]
async fn test_task_error_releases_for_the_next_holder() {
    let server = MemoryLockServer::new();
    let first = factory(&server).create_lock("job");
    let second = factory(&server).create_lock("job");

    let err = first
        .synchronize(|| async { Err::<(), _>(std::io::Error::other("job crashed")) })
        .await
        .unwrap_err();
    assert_eq!(err.task_error().map(|e| e.to_string()), Some("job crashed".to_string()));

    let result = second
        .try_synchronize(|| async { Ok::<_, std::io::Error>("ran") })
        .await
        .unwrap();
    assert_eq!(result, SynchronizeResult::Success("ran"));
}

#[tokio::test(start_paused = true)]
async fn test_timeout_is_bounded() {
    let server = MemoryLockServer::new();
    let holder = factory(&server).create_lock("slow");
    holder.acquire().await.unwrap();

    let waiter = factory(&server).create_multi_lock(["fast", "slow"]).unwrap();
    let start = tokio::time::Instant::now();

    assert!(!waiter.try_acquire_with_timeout(3).await.unwrap());
    assert!(start.elapsed() <= Duration::from_secs(4));
    assert!(!server.is_held("fast"));
}

#[cfg(feature = "integration-tests")]
mod live {
    use super::*;
    use dblock_core::config::connect;
    use uuid::Uuid;

    async fn live_factory() -> LockFactory {
        let config = DriverConfig::from_env().expect("DBLOCK_* variables required for live tests");
        let connected = connect(&config).await.expect("database connection failed");
        LockFactory::new(connected.driver)
    }

    fn unique(base: &str) -> String {
        format!("{}:{}", base, Uuid::new_v4())
    }

    #[tokio::test]
    async fn test_two_connections_exclude_each_other() {
        let one = live_factory().await;
        let two = live_factory().await;
        let name = unique("exclusive");

        let held = one.create_lock(name.clone());
        held.acquire().await.unwrap();
        assert!(!two.create_lock(name.clone()).try_acquire().await.unwrap());

        held.release().await.unwrap();
        let taken = two.create_lock(name);
        assert!(taken.try_acquire().await.unwrap());
        taken.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_reentrant_on_one_connection() {
        let one = live_factory().await;
        let two = live_factory().await;
        let name = unique("reentrant");

        let lock = one.create_lock(name.clone());
        assert!(lock.try_acquire().await.unwrap());
        assert!(lock.try_acquire().await.unwrap());
        lock.release().await.unwrap();

        assert!(!two.create_lock(name.clone()).try_acquire().await.unwrap());
        lock.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_release_without_acquire_fails() {
        let one = live_factory().await;

        let err = one.create_lock(unique("never")).release().await.unwrap_err();
        assert_eq!(err.kind(), LockErrorKind::Release);
    }

    #[tokio::test]
    async fn test_multi_lock_rolls_back() {
        let one = live_factory().await;
        let two = live_factory().await;
        let (a, b, c) = (unique("a"), unique("b"), unique("c"));

        let held = one.create_lock(c.clone());
        held.acquire().await.unwrap();

        let multi = two.create_multi_lock([a.clone(), b.clone(), c.clone()]).unwrap();
        assert!(!multi.try_acquire_with_timeout(1).await.unwrap());

        let probe = one.create_multi_lock([a, b]).unwrap();
        assert!(probe.try_acquire().await.unwrap());
        probe.release().await.unwrap();
        held.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_bounded_wait_gives_up() {
        let one = live_factory().await;
        let two = live_factory().await;
        let name = unique("bounded");

        let held = one.create_lock(name.clone());
        held.acquire().await.unwrap();

        let start = std::time::Instant::now();
        assert!(!two.create_lock(name).try_acquire_with_timeout(1).await.unwrap());
        assert!(start.elapsed() >= Duration::from_millis(900));
        assert!(start.elapsed() < Duration::from_secs(3));

        held.release().await.unwrap();
    }
}
