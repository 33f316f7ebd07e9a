mod support;

use cacheworker::block::{ManagerOptions, Reaper};
use std::time::Duration;
use support::{open, with_capacity};

fn options() -> ManagerOptions {
    ManagerOptions {
        heartbeat_interval: Duration::from_millis(1000),
        zombie_multiplier: 3,
        ..with_capacity(1000)
    }
}

#[tokio::test(start_paused = true)]
async fn test_silent_session_is_reclaimed() {
    let w = open(options()).await;
    let reaper = Reaper::spawn(w.manager.clone(), w.manager.options().heartbeat_interval);

    // the session shows up half way through the first reaper cycle
    tokio::time::sleep(Duration::from_millis(500)).await;
    w.manager.user_heartbeat(7).await;
    w.manager.create_user_folders(7).await.unwrap();
    w.manager.lock_block(100, 7).await;
    w.manager.lock_block(101, 7).await;
    assert!(w.manager.request_space(7, 400).await);

    tokio::time::sleep(Duration::from_millis(2900)).await;
    assert!(w.manager.session_usage(7).await.is_some());

    // 3500ms after the heartbeat
    tokio::time::sleep(Duration::from_millis(610)).await;
    assert!(w.manager.session_usage(7).await.is_none());
    assert_eq!(w.manager.space_usage().await.reserved, 0);
    assert!(w.manager.take_removed_blocks().await.is_empty());
    // a new session can take the whole capacity back
    assert!(w.manager.request_space(8, 1000).await);

    reaper.stop();
    reaper.join().await;
    assert!(!w.manager.user_temp_folder(7).exists());
}

#[tokio::test(start_paused = true)]
async fn test_heartbeats_keep_session_alive() {
    let w = open(options()).await;
    let reaper = Reaper::spawn(w.manager.clone(), w.manager.options().heartbeat_interval);

    w.manager.user_heartbeat(1).await;
    w.manager.lock_block(5, 1).await;
    for _ in 0..10 {
        tokio::time::sleep(Duration::from_millis(900)).await;
        w.manager.user_heartbeat(1).await;
    }
    let usage = w.manager.session_usage(1).await.unwrap();
    assert_eq!(usage.held_locks.get(&5), Some(&1));

    reaper.stop();
    reaper.join().await;
}

#[tokio::test(start_paused = true)]
async fn test_explicit_release_and_reaper_reclaim_once() {
    let w = open(options()).await;
    w.manager.user_heartbeat(3).await;
    assert!(w.manager.request_space(3, 250).await);
    tokio::time::advance(Duration::from_millis(3001)).await;

    // the reaper got there first, the explicit release finds nothing
    assert_eq!(w.manager.cleanup_users().await, 1);
    assert!(!w.manager.release_session(3).await);
    assert_eq!(w.manager.cleanup_users().await, 0);
    assert_eq!(w.manager.space_usage().await.reserved, 0);
}

#[tokio::test(start_paused = true)]
async fn test_stopped_reaper_runs_no_more_cycles() {
    let w = open(options()).await;
    let reaper = Reaper::spawn(w.manager.clone(), w.manager.options().heartbeat_interval);
    w.manager.user_heartbeat(9).await;
    reaper.stop();
    reaper.join().await;

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(w.manager.session_usage(9).await.is_some());
    // manual cleanup still works
    assert_eq!(w.manager.cleanup_users().await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_release_is_exactly_once() {
    let w = open(ManagerOptions {
        heartbeat_interval: Duration::from_millis(10),
        zombie_multiplier: 1,
        ..with_capacity(10_000)
    })
    .await;
    for s in 0..20u64 {
        w.manager.user_heartbeat(s).await;
        w.manager.lock_block(s, s).await;
        assert!(w.manager.request_space(s, 100).await);
    }
    tokio::time::sleep(Duration::from_millis(30)).await;

    let mut tasks = Vec::new();
    for s in 0..20u64 {
        let m = w.manager.clone();
        tasks.push(tokio::spawn(async move { m.release_session(s).await as usize }));
    }
    let reaper_manager = w.manager.clone();
    let reaped = tokio::spawn(async move { reaper_manager.cleanup_users().await });

    let mut released = 0;
    for t in tasks {
        released += t.await.unwrap();
    }
    released += reaped.await.unwrap();
    assert_eq!(released, 20);
    assert_eq!(w.manager.space_usage().await.reserved, 0);
    for s in 0..20u64 {
        assert!(w.manager.session_usage(s).await.is_none());
    }
}
