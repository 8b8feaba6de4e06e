//! 集成测试 - 传输控制器
//!
//! 使用回环引擎验证做种、下载、清理与会话停止的完整流程。

use hfmdrop_core::transfer::Session;
use hfmdrop_core::transfer::controller::{MSG_METADATA_UNAVAILABLE, TransferController};
use hfmdrop_core::{
    ChannelSink, CompletedEvent, DropSettings, Engine, ErrorEvent, MemoryEngine,
    NotificationSink, ProgressEvent, Role, SessionSlot, Swarm, TransferError, TransferHandle,
    TransferNotification, format_locator, parse_locator,
};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver};

fn write_source(dir: &Path, name: &str, len: usize) -> PathBuf {
    let path = dir.join(name);
    let data: Vec<u8> = (0..len).map(|i| (i * 31 % 251) as u8).collect();
    std::fs::write(&path, data).unwrap();
    path
}

struct Peer {
    engine: Arc<MemoryEngine>,
    controller: TransferController<MemoryEngine>,
    notifications: UnboundedReceiver<TransferNotification>,
}

fn peer(swarm: &Swarm, settings: &DropSettings) -> Peer {
    let engine = Arc::new(MemoryEngine::new(swarm.clone()));
    let (sink, notifications) = ChannelSink::new();
    let controller =
        TransferController::start(Arc::clone(&engine), Arc::new(sink), settings).unwrap();
    Peer {
        engine,
        controller,
        notifications,
    }
}

async fn next_notification(rx: &mut UnboundedReceiver<TransferNotification>) -> TransferNotification {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("notification timed out")
        .expect("notification channel closed")
}

fn drain(rx: &mut UnboundedReceiver<TransferNotification>) -> Vec<TransferNotification> {
    let mut out = Vec::new();
    while let Ok(n) = rx.try_recv() {
        out.push(n);
    }
    out
}

/// 收到终止通知后立即停止会话的接收方
struct StoppingSink {
    session: OnceLock<Arc<Session<MemoryEngine>>>,
    tx: mpsc::UnboundedSender<TransferNotification>,
}

impl StoppingSink {
    fn stop(&self) {
        if let Some(session) = self.session.get() {
            session.stop();
        }
    }
}

impl NotificationSink for StoppingSink {
    fn on_progress(&self, event: ProgressEvent) {
        let _ = self.tx.send(TransferNotification::Progress(event));
    }

    fn on_completed(&self, event: CompletedEvent) {
        let _ = self.tx.send(TransferNotification::Completed(event));
        self.stop();
    }

    fn on_error(&self, event: ErrorEvent) {
        let _ = self.tx.send(TransferNotification::Error(event));
        self.stop();
    }
}

struct StoppingPeer {
    engine: Arc<MemoryEngine>,
    controller: Arc<TransferController<MemoryEngine>>,
    notifications: UnboundedReceiver<TransferNotification>,
}

fn stopping_peer(swarm: &Swarm, settings: &DropSettings) -> StoppingPeer {
    let engine = Arc::new(MemoryEngine::new(swarm.clone()));
    let (tx, notifications) = mpsc::unbounded_channel();
    let sink = Arc::new(StoppingSink {
        session: OnceLock::new(),
        tx,
    });
    let controller = Arc::new(
        TransferController::start(Arc::clone(&engine), sink.clone(), settings).unwrap(),
    );
    let _ = sink.session.set(Arc::clone(controller.session()));
    StoppingPeer {
        engine,
        controller,
        notifications,
    }
}

/// 等待会话停止；状态锁被占住时超时失败
async fn wait_stopped(controller: &Arc<TransferController<MemoryEngine>>) {
    let controller = Arc::clone(controller);
    let check = tokio::task::spawn_blocking(move || {
        while controller.is_running() {
            std::thread::sleep(Duration::from_millis(10));
        }
    });
    tokio::time::timeout(Duration::from_secs(3), check)
        .await
        .expect("session did not stop")
        .unwrap();
}

fn descriptor_artifacts(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("seed_") && n.ends_with(".torrent"))
        })
        .collect()
}

// ============================================================================
// 做种
// ============================================================================

#[tokio::test]
async fn test_start_seeding_registers_request() {
    let dir = tempfile::tempdir().unwrap();
    let source = write_source(dir.path(), "report.pdf", 40_000);
    let seeder = peer(&Swarm::new(), &DropSettings::default());

    let locator = seeder
        .controller
        .start_seeding(&source, "req-seed-1")
        .await
        .unwrap();

    assert!(locator.starts_with("magnet:?xt=urn:btmh:1220"));
    let parsed = parse_locator(&locator).unwrap();
    assert_eq!(parsed.display_name.as_deref(), Some("report.pdf"));

    let (request_id, handle) = seeder
        .controller
        .session()
        .registry()
        .find_by_content_id(&parsed.content_id)
        .unwrap();
    assert_eq!(request_id, "req-seed-1");
    assert!(handle.is_valid());
    assert_eq!(handle.locator(), locator);

    let active = seeder.controller.active_transfers();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].role, Role::Seed);
}

#[tokio::test]
async fn test_seeding_removes_descriptor_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let source = write_source(dir.path(), "video.mp4", 1_000_000);
    let seeder = peer(&Swarm::new(), &DropSettings::default());

    seeder
        .controller
        .start_seeding(&source, "req-big")
        .await
        .unwrap();

    assert!(descriptor_artifacts(dir.path()).is_empty());
    let cid = parse_locator(
        &seeder
            .controller
            .session()
            .registry()
            .entries()[0]
            .handle
            .locator(),
    )
    .unwrap()
    .content_id;
    let descriptor = seeder.engine.descriptor(&cid).unwrap();
    assert_eq!(descriptor.length, 1_000_000);
    assert_eq!(descriptor.piece_length, 16 * 1024);
    assert_eq!(descriptor.piece_count(), 62);
    assert!(descriptor.private);
    assert_eq!(descriptor.created_by.as_deref(), Some("HFM Drop"));
}

#[tokio::test]
async fn test_seeding_missing_file_fails_validation() {
    let dir = tempfile::tempdir().unwrap();
    let mut seeder = peer(&Swarm::new(), &DropSettings::default());

    let result = seeder
        .controller
        .start_seeding(&dir.path().join("absent.bin"), "req-missing")
        .await;

    assert!(matches!(result, Err(TransferError::Validation(_))));
    assert!(seeder.controller.active_transfers().is_empty());
    assert!(descriptor_artifacts(dir.path()).is_empty());
    assert!(drain(&mut seeder.notifications).is_empty());
}

#[tokio::test]
async fn test_seeding_engine_rejection_removes_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let source = write_source(dir.path(), "budget.xlsx", 60_000);
    let seeder = peer(&Swarm::new(), &DropSettings::default());
    seeder.engine.stop();

    let result = seeder
        .controller
        .start_seeding(&source, "req-rejected")
        .await;

    assert!(matches!(result, Err(TransferError::Engine(_))));
    assert!(descriptor_artifacts(dir.path()).is_empty());
    assert!(seeder.controller.active_transfers().is_empty());
}

#[cfg(unix)]
#[tokio::test]
async fn test_seeding_unreadable_file_fails_validation() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let source = write_source(dir.path(), "locked.bin", 10_000);
    std::fs::set_permissions(&source, std::fs::Permissions::from_mode(0o000)).unwrap();
    if std::fs::File::open(&source).is_ok() {
        // root 不受权限位限制
        return;
    }
    let seeder = peer(&Swarm::new(), &DropSettings::default());

    let result = seeder.controller.start_seeding(&source, "req-locked").await;

    assert!(matches!(result, Err(TransferError::Validation(_))));
    assert!(descriptor_artifacts(dir.path()).is_empty());
    assert!(seeder.controller.active_transfers().is_empty());
}

// ============================================================================
// 下载
// ============================================================================

#[tokio::test]
async fn test_download_invalid_locator_fails_validation() {
    let dir = tempfile::tempdir().unwrap();
    let mut leecher = peer(&Swarm::new(), &DropSettings::default());

    // 默认 30 秒超时，无效定位串必须立即失败
    let result = tokio::time::timeout(
        Duration::from_secs(2),
        leecher
            .controller
            .start_download("magnet:?dn=no-hash.txt", dir.path(), "req-bad"),
    )
    .await
    .expect("invalid locator waited for metadata");

    assert!(matches!(result, Err(TransferError::Validation(_))));
    let notifications = drain(&mut leecher.notifications);
    assert_eq!(
        notifications,
        vec![TransferNotification::Error(ErrorEvent {
            request_id: "req-bad".to_string(),
            message: MSG_METADATA_UNAVAILABLE.to_string(),
        })]
    );
    assert!(leecher.controller.session().registry().is_empty());
}

#[tokio::test]
async fn test_download_metadata_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let settings = DropSettings {
        metadata_timeout_secs: 1,
        ..Default::default()
    };
    let mut leecher = peer(&Swarm::new(), &settings);
    let locator = format_locator(&"ab".repeat(32), "nothing.txt");

    let result = leecher
        .controller
        .start_download(&locator, dir.path(), "req-dl-1")
        .await;

    assert!(matches!(result, Err(TransferError::Timeout(_))));
    let notifications = drain(&mut leecher.notifications);
    assert_eq!(notifications.len(), 1);
    match &notifications[0] {
        TransferNotification::Error(e) => {
            assert_eq!(e.request_id, "req-dl-1");
            assert_eq!(e.message, MSG_METADATA_UNAVAILABLE);
        }
        other => panic!("unexpected notification {other:?}"),
    }
    assert!(leecher.controller.session().registry().is_empty());
}

#[tokio::test]
async fn test_loopback_transfer_completes() {
    let seed_dir = tempfile::tempdir().unwrap();
    let save_dir = tempfile::tempdir().unwrap();
    let source = write_source(seed_dir.path(), "photos.tar", 100_000);

    let swarm = Swarm::new();
    let settings = DropSettings::default();
    let seeder = peer(&swarm, &settings);
    let mut leecher = peer(&swarm, &settings);

    let locator = seeder
        .controller
        .start_seeding(&source, "req-send")
        .await
        .unwrap();
    let target = save_dir.path().join("inbox");
    leecher
        .controller
        .start_download(&locator, &target, "req-recv")
        .await
        .unwrap();
    assert_eq!(leecher.controller.active_transfers()[0].role, Role::Leech);

    leecher.engine.tick();
    match next_notification(&mut leecher.notifications).await {
        TransferNotification::Progress(p) => {
            assert_eq!(p.request_id, "req-recv");
            assert_eq!(p.phase_label, "Receiving File...");
            assert_eq!(p.bytes_done, 65_536);
            assert_eq!(p.percent, 65);
        }
        other => panic!("unexpected notification {other:?}"),
    }

    leecher.engine.tick();
    match next_notification(&mut leecher.notifications).await {
        TransferNotification::Progress(p) => assert_eq!(p.percent, 100),
        other => panic!("unexpected notification {other:?}"),
    }
    match next_notification(&mut leecher.notifications).await {
        TransferNotification::Completed(c) => assert_eq!(c.request_id, "req-recv"),
        other => panic!("unexpected notification {other:?}"),
    }

    // 完成后被清理
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(leecher.controller.session().registry().is_empty());
    assert_eq!(leecher.engine.transfer_count(), 0);
    assert_eq!(
        std::fs::read(target.join("photos.tar")).unwrap(),
        std::fs::read(&source).unwrap()
    );

    // 做种方仍在登记中
    assert_eq!(seeder.controller.active_transfers().len(), 1);
}

// ============================================================================
// 清理与停止
// ============================================================================

#[tokio::test]
async fn test_cleanup_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let source = write_source(dir.path(), "notes.txt", 20_000);
    let seeder = peer(&Swarm::new(), &DropSettings::default());
    seeder
        .controller
        .start_seeding(&source, "req-clean")
        .await
        .unwrap();

    let handle = seeder.controller.session().registry().entries()[0]
        .handle
        .clone();
    seeder.controller.cleanup_transfer(&handle);
    seeder.controller.cleanup_transfer(&handle);

    assert!(!handle.is_valid());
    assert!(seeder.controller.active_transfers().is_empty());
    assert_eq!(seeder.engine.transfer_count(), 0);
}

#[tokio::test]
async fn test_cancel_transfer_by_request_id() {
    let dir = tempfile::tempdir().unwrap();
    let source = write_source(dir.path(), "slides.key", 20_000);
    let mut seeder = peer(&Swarm::new(), &DropSettings::default());
    seeder
        .controller
        .start_seeding(&source, "req-cancel")
        .await
        .unwrap();

    assert!(seeder.controller.cancel_transfer("req-cancel"));
    assert!(!seeder.controller.cancel_transfer("req-cancel"));
    assert_eq!(seeder.engine.transfer_count(), 0);
    assert!(drain(&mut seeder.notifications).is_empty());
}

#[tokio::test]
async fn test_stop_session_rejects_new_transfers() {
    let dir = tempfile::tempdir().unwrap();
    let source = write_source(dir.path(), "draft.docx", 30_000);
    let mut seeder = peer(&Swarm::new(), &DropSettings::default());
    let locator = seeder
        .controller
        .start_seeding(&source, "req-before")
        .await
        .unwrap();

    seeder.controller.stop_session();
    seeder.controller.stop_session();

    assert!(!seeder.controller.is_running());
    assert!(seeder.controller.session().registry().is_empty());
    assert!(!seeder.engine.is_running());

    let seeding = seeder.controller.start_seeding(&source, "req-after").await;
    assert!(matches!(seeding, Err(TransferError::SessionStopped)));
    let download = seeder
        .controller
        .start_download(&locator, dir.path(), "req-after")
        .await;
    assert!(matches!(download, Err(TransferError::SessionStopped)));

    seeder.engine.tick();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(drain(&mut seeder.notifications).is_empty());
}

#[tokio::test]
async fn test_session_slot_recreates_after_stop() {
    let swarm = Swarm::new();
    let slot: SessionSlot<MemoryEngine> = SessionSlot::new();
    let init = || {
        let (sink, _rx) = ChannelSink::new();
        TransferController::start(
            Arc::new(MemoryEngine::new(swarm.clone())),
            Arc::new(sink),
            &DropSettings::default(),
        )
    };

    let first = slot.get_or_start(init).unwrap();
    let again = slot.get_or_start(init).unwrap();
    assert!(Arc::ptr_eq(&first, &again));

    slot.stop_session();
    assert!(!first.is_running());
    assert!(slot.current().is_none());

    let second = slot.get_or_start(init).unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert!(second.is_running());
    assert!(second.session().engine().is_running());
}

#[tokio::test]
async fn test_dropping_controller_stops_session() {
    let dir = tempfile::tempdir().unwrap();
    let source = write_source(dir.path(), "memo.txt", 5_000);
    let seeder = peer(&Swarm::new(), &DropSettings::default());
    seeder
        .controller
        .start_seeding(&source, "req-drop")
        .await
        .unwrap();
    let session = Arc::clone(seeder.controller.session());
    let engine = Arc::clone(&seeder.engine);

    drop(seeder);

    assert!(!session.is_running());
    assert!(session.cancelled().is_cancelled());
    assert!(!engine.is_running());
    assert_eq!(engine.transfer_count(), 0);
}

// ============================================================================
// 通知回调中停止会话
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sink_stops_session_on_error() {
    let dir = tempfile::tempdir().unwrap();
    let settings = DropSettings {
        metadata_timeout_secs: 1,
        ..Default::default()
    };
    let mut leecher = stopping_peer(&Swarm::new(), &settings);
    let locator = format_locator(&"cd".repeat(32), "gone.txt");

    let task = {
        let controller = Arc::clone(&leecher.controller);
        let target = dir.path().to_path_buf();
        tokio::spawn(async move {
            controller
                .start_download(&locator, &target, "req-stop-err")
                .await
        })
    };
    let result = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("start_download did not return")
        .unwrap();

    assert!(matches!(result, Err(TransferError::Timeout(_))));
    assert!(matches!(
        leecher.notifications.try_recv().unwrap(),
        TransferNotification::Error(e) if e.request_id == "req-stop-err"
    ));
    wait_stopped(&leecher.controller).await;
    assert!(!leecher.engine.is_running());
    assert!(leecher.controller.session().registry().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sink_stops_session_on_completed() {
    let seed_dir = tempfile::tempdir().unwrap();
    let save_dir = tempfile::tempdir().unwrap();
    let source = write_source(seed_dir.path(), "album.flac", 40_000);

    let swarm = Swarm::new();
    let settings = DropSettings::default();
    let seeder = peer(&swarm, &settings);
    let mut leecher = stopping_peer(&swarm, &settings);

    let locator = seeder
        .controller
        .start_seeding(&source, "req-stop-send")
        .await
        .unwrap();
    leecher
        .controller
        .start_download(&locator, save_dir.path(), "req-stop-done")
        .await
        .unwrap();

    // 40 000 字节 = 3 片，一次 tick 完成
    leecher.engine.tick();
    loop {
        match next_notification(&mut leecher.notifications).await {
            TransferNotification::Progress(_) => {}
            TransferNotification::Completed(c) => {
                assert_eq!(c.request_id, "req-stop-done");
                break;
            }
            TransferNotification::Error(e) => panic!("unexpected error {}", e.message),
        }
    }

    wait_stopped(&leecher.controller).await;
    assert!(!leecher.engine.is_running());
    assert_eq!(leecher.engine.transfer_count(), 0);

    // 停止后不再产生通知
    leecher.engine.tick();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(leecher.notifications.try_recv().is_err());
}
