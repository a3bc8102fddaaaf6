#![cfg(unix)]

mod common;

use chrono::DateTime;
use cloudsync_lib::core::{SyncEvent, SyncPhase, WarningKind};
use cloudsync_lib::{LargeSyncPolicy, SyncMode};
use common::{next_event, until_complete, until_progress, FakeRclone, Sandbox};
use std::time::{Duration, Instant};

#[tokio::test]
async fn test_first_sync_runs_dry_run_then_transfer() {
    let sandbox = Sandbox::new(FakeRclone::default());
    let (engine, mut rx) = sandbox.orchestrator(sandbox.settings());

    assert!(engine.sync_now());
    assert_eq!(next_event(&mut rx).await, SyncEvent::Start);
    let (success, message, seen) = until_complete(&mut rx).await;
    assert!(success, "{}", message);

    let syncs = sandbox.sync_calls();
    assert_eq!(syncs.len(), 2);
    assert!(syncs[0].contains("--dry-run"));
    assert!(!syncs[1].contains("--dry-run"));
    // 估算在 dry-run 之后、正式传输之前
    let calls = sandbox.calls();
    assert!(calls[1].starts_with("size proton: --json"));

    assert!(seen.contains(&SyncEvent::Progress {
        line: "Transferred: 2 / 2".into()
    }));
    assert!(!seen.iter().any(|e| matches!(e, SyncEvent::Warning { .. })));

    let status = engine.get_status();
    assert!(status.first_sync_completed);
    assert!(!status.transfer_in_progress);
    assert_eq!(status.phase, SyncPhase::Idle);
    let last = status.last_sync_time.expect("last sync time");
    assert!(DateTime::parse_from_rfc3339(&last).is_ok());
}

#[tokio::test]
async fn test_later_syncs_skip_preflight() {
    let sandbox = Sandbox::new(FakeRclone::default());
    let (engine, mut rx) = sandbox.orchestrator(sandbox.settings());

    assert!(engine.sync_now_blocking().await);
    let (success, _, _) = until_complete(&mut rx).await;
    assert!(success);
    assert!(engine.sync_now_blocking().await);
    let (success, _, _) = until_complete(&mut rx).await;
    assert!(success);

    let calls = sandbox.calls();
    assert_eq!(calls.iter().filter(|c| c.starts_with("size ")).count(), 1);
    assert_eq!(sandbox.sync_calls().len(), 3);
}

#[tokio::test]
async fn test_dry_run_can_be_disabled() {
    let sandbox = Sandbox::new(FakeRclone::default());
    let mut settings = sandbox.settings();
    settings.dry_run_first_sync = false;
    let (engine, mut rx) = sandbox.orchestrator(settings);

    assert!(engine.sync_now_blocking().await);
    assert!(until_complete(&mut rx).await.0);
    assert_eq!(sandbox.sync_calls().len(), 1);
    assert_eq!(sandbox.calls()[0], "size proton: --json");
}

#[tokio::test]
async fn test_filters_and_bandwidth_are_passed() {
    let sandbox = Sandbox::new(FakeRclone::default());
    let mut settings = sandbox.settings();
    settings.sync_mode = SyncMode::Include;
    settings.included_folders = vec!["Photos".into()];
    settings.bandwidth_limit_kbps = 1024;
    let (engine, mut rx) = sandbox.orchestrator(settings);
    let engine = engine.with_first_sync_completed(true);

    assert!(engine.sync_now_blocking().await);
    assert!(until_complete(&mut rx).await.0);

    let syncs = sandbox.sync_calls();
    assert_eq!(syncs.len(), 1);
    assert!(syncs[0].ends_with("--include=Photos/** --include=Photos --exclude=* --bwlimit 1024k"));
    assert!(sandbox.calls().iter().all(|c| !c.starts_with("size ")));
}

#[tokio::test]
async fn test_busy_engine_rejects_second_sync() {
    let sandbox = Sandbox::new(FakeRclone::long_running());
    let (engine, mut rx) = sandbox.orchestrator(sandbox.settings());
    let engine = engine.with_first_sync_completed(true);

    assert!(engine.sync_now());
    until_progress(&mut rx).await;

    assert!(!engine.sync_now());
    assert!(!engine.sync_now_blocking().await);
    let status = engine.get_status();
    assert!(status.transfer_in_progress);
    assert_eq!(status.phase, SyncPhase::Transferring);

    assert!(engine.cancel().await);
    let (success, _, _) = until_complete(&mut rx).await;
    assert!(!success);
    assert_eq!(sandbox.sync_calls().len(), 1);
}

#[tokio::test]
async fn test_cancel_stops_transfer_within_bound() {
    let sandbox = Sandbox::new(FakeRclone::long_running());
    let (engine, mut rx) = sandbox.orchestrator(sandbox.settings());
    let engine = engine.with_first_sync_completed(true);

    assert!(engine.sync_now());
    until_progress(&mut rx).await;

    let started = Instant::now();
    assert!(engine.cancel().await);
    assert!(started.elapsed() <= Duration::from_secs(6));

    let status = engine.get_status();
    assert!(!status.transfer_in_progress);
    assert_eq!(status.phase, SyncPhase::Idle);
    assert_eq!(status.last_sync_time, None);

    let (success, _, _) = until_complete(&mut rx).await;
    assert!(!success);
    assert!(!engine.cancel().await);
}

#[tokio::test]
async fn test_cancel_during_dry_run_skips_transfer() {
    let sandbox = Sandbox::new(FakeRclone::long_running());
    let (engine, mut rx) = sandbox.orchestrator(sandbox.settings());

    assert!(engine.sync_now());
    until_progress(&mut rx).await;
    assert_eq!(engine.phase(), SyncPhase::PreflightDryRun);
    assert!(!engine.pause());

    assert!(engine.cancel().await);
    let (success, _, _) = until_complete(&mut rx).await;
    assert!(!success);

    let syncs = sandbox.sync_calls();
    assert_eq!(syncs.len(), 1);
    assert!(syncs[0].contains("--dry-run"));
    assert!(!engine.get_status().first_sync_completed);
}

#[tokio::test]
async fn test_pause_and_resume() {
    let sandbox = Sandbox::new(FakeRclone::long_running());
    let (engine, mut rx) = sandbox.orchestrator(sandbox.settings());
    let engine = engine.with_first_sync_completed(true);

    assert!(engine.sync_now());
    until_progress(&mut rx).await;

    assert!(engine.pause());
    assert!(!engine.pause());
    let status = engine.get_status();
    assert!(status.paused);
    assert_eq!(status.phase, SyncPhase::Paused);

    assert!(engine.resume());
    assert!(!engine.resume());
    assert!(!engine.get_status().paused);

    assert!(engine.pause());
    let started = Instant::now();
    assert!(engine.cancel().await);
    assert!(started.elapsed() <= Duration::from_secs(6));
    assert!(!engine.get_status().paused);
    assert!(!until_complete(&mut rx).await.0);
}

#[tokio::test]
async fn test_large_sync_warns_and_proceeds() {
    let sandbox = Sandbox::new(FakeRclone {
        size_bytes: 2000 * 1024 * 1024,
        ..Default::default()
    });
    let mut settings = sandbox.settings();
    settings.dry_run_first_sync = false;
    let (engine, mut rx) = sandbox.orchestrator(settings);

    assert!(engine.sync_now_blocking().await);
    let (success, _, seen) = until_complete(&mut rx).await;
    assert!(success);

    let warning = seen.iter().find_map(|e| match e {
        SyncEvent::Warning { kind, data } => Some((*kind, data.clone())),
        _ => None,
    });
    let (kind, data) = warning.expect("large sync warning");
    assert_eq!(kind, WarningKind::LargeSync);
    assert_eq!(data.size_mb, 2000.0);
    assert_eq!(data.file_count, 3);
    assert_eq!(sandbox.sync_calls().len(), 1);
}

#[tokio::test]
async fn test_threshold_is_strict_and_can_be_disabled() {
    let sandbox = Sandbox::new(FakeRclone {
        size_bytes: 1000 * 1024 * 1024,
        ..Default::default()
    });
    let mut settings = sandbox.settings();
    settings.dry_run_first_sync = false;
    let (engine, mut rx) = sandbox.orchestrator(settings.clone());
    assert!(engine.sync_now_blocking().await);
    let (_, _, seen) = until_complete(&mut rx).await;
    assert!(!seen.iter().any(|e| matches!(e, SyncEvent::Warning { .. })));

    settings.large_sync_threshold_mb = 10;
    settings.confirm_large_sync = false;
    let (engine, mut rx) = sandbox.orchestrator(settings);
    assert!(engine.sync_now_blocking().await);
    let (success, _, seen) = until_complete(&mut rx).await;
    assert!(success);
    assert!(!seen.iter().any(|e| matches!(e, SyncEvent::Warning { .. })));
}

#[tokio::test]
async fn test_confirm_policy_waits_for_answer() {
    let sandbox = Sandbox::new(FakeRclone {
        size_bytes: 5000 * 1024 * 1024,
        ..Default::default()
    });
    let mut settings = sandbox.settings();
    settings.dry_run_first_sync = false;
    settings.large_sync_policy = LargeSyncPolicy::Confirm;

    // 拒绝：不启动传输
    let (engine, mut rx) = sandbox.orchestrator(settings.clone());
    assert!(engine.sync_now());
    loop {
        if let SyncEvent::Warning { .. } = next_event(&mut rx).await {
            break;
        }
    }
    assert_eq!(engine.phase(), SyncPhase::PreflightSizeCheck);
    assert!(engine.confirm_large_sync(false));
    assert!(!engine.confirm_large_sync(false));
    let (success, _, _) = until_complete(&mut rx).await;
    assert!(!success);
    assert!(sandbox.sync_calls().is_empty());

    // 确认：继续传输
    let (engine, mut rx) = sandbox.orchestrator(settings);
    assert!(engine.sync_now());
    loop {
        if let SyncEvent::Warning { .. } = next_event(&mut rx).await {
            break;
        }
    }
    assert!(engine.confirm_large_sync(true));
    let (success, _, _) = until_complete(&mut rx).await;
    assert!(success);
    assert_eq!(sandbox.sync_calls().len(), 1);
}

#[tokio::test]
async fn test_cancel_while_awaiting_confirmation() {
    let sandbox = Sandbox::new(FakeRclone {
        size_bytes: 5000 * 1024 * 1024,
        ..Default::default()
    });
    let mut settings = sandbox.settings();
    settings.dry_run_first_sync = false;
    settings.large_sync_policy = LargeSyncPolicy::Confirm;
    let (engine, mut rx) = sandbox.orchestrator(settings);

    assert!(engine.sync_now());
    loop {
        if let SyncEvent::Warning { .. } = next_event(&mut rx).await {
            break;
        }
    }
    assert!(engine.cancel().await);
    assert!(!until_complete(&mut rx).await.0);
    assert!(sandbox.sync_calls().is_empty());
    assert!(!engine.confirm_large_sync(true));
}

#[tokio::test]
async fn test_failed_transfer_keeps_last_sync_time() {
    let sandbox = Sandbox::new(FakeRclone::failing(1));
    let (engine, mut rx) = sandbox.orchestrator(sandbox.settings());
    let engine = engine.with_first_sync_completed(true);

    assert!(engine.sync_now_blocking().await);
    let (success, message, _) = until_complete(&mut rx).await;
    assert!(!success);
    assert!(message.contains('1'));
    assert_eq!(engine.get_status().last_sync_time, None);
}

#[tokio::test]
async fn test_auto_sync_start_then_stop_runs_nothing() {
    let sandbox = Sandbox::new(FakeRclone::default());
    let (engine, mut rx) = sandbox.orchestrator(sandbox.settings());

    assert!(engine.start_auto_sync());
    engine.stop_auto_sync().await;

    assert!(!engine.get_status().auto_sync_running);
    assert!(rx.try_recv().is_err());
    assert!(sandbox.calls().is_empty());
}

#[tokio::test]
async fn test_auto_sync_first_tick_syncs_immediately() {
    let sandbox = Sandbox::new(FakeRclone::default());
    let (engine, mut rx) = sandbox.orchestrator(sandbox.settings());
    let engine = engine.with_first_sync_completed(true);

    assert!(engine.start_auto_sync());
    assert_eq!(next_event(&mut rx).await, SyncEvent::Start);
    assert!(until_complete(&mut rx).await.0);
    assert!(engine.get_status().auto_sync_running);

    engine.stop_auto_sync().await;
    assert!(!engine.get_status().auto_sync_running);
    assert_eq!(sandbox.sync_calls().len(), 1);
}

#[tokio::test]
async fn test_cancel_force_kills_stubborn_transfer() {
    let sandbox = Sandbox::new(FakeRclone::ignoring_term());
    let (engine, mut rx) = sandbox.orchestrator(sandbox.settings());
    let engine = engine.with_first_sync_completed(true);

    assert!(engine.sync_now());
    until_progress(&mut rx).await;

    let started = Instant::now();
    assert!(engine.cancel().await);
    assert!(started.elapsed() <= Duration::from_secs(6));
    assert!(!engine.get_status().transfer_in_progress);
    assert!(!until_complete(&mut rx).await.0);
}

#[tokio::test]
async fn test_failed_estimate_skips_size_check() {
    let sandbox = Sandbox::new(FakeRclone::unparsable_size());
    let mut settings = sandbox.settings();
    settings.dry_run_first_sync = false;
    settings.large_sync_threshold_mb = 0;
    let (engine, mut rx) = sandbox.orchestrator(settings);

    assert!(engine.sync_now_blocking().await);
    let (success, message, seen) = until_complete(&mut rx).await;
    assert!(success, "{}", message);
    assert!(!seen.iter().any(|e| matches!(e, SyncEvent::Warning { .. })));

    let calls = sandbox.calls();
    assert_eq!(calls[0], "size proton: --json");
    assert_eq!(sandbox.sync_calls().len(), 1);
    assert!(engine.get_status().first_sync_completed);
}
