//! 进程内回环引擎
//!
//! 共享同一个 [`Swarm`] 的多个 `MemoryEngine` 互为对端:
//! - 注册时本地已有完整文件则做种，并在 swarm 中公布元数据
//! - 否则作为下载方，每次 `tick()` 从种子文件复制若干分片并逐片校验
//! - 每次 `tick()` 发出一个覆盖所有传输的状态批次
//!
//! 设置了 tick 间隔时，`start()` 会启动周期任务；否则由调用方手动 `tick()`。

use super::{Engine, EngineError, EngineEvent, Registration, StatusSnapshot, TransferHandle};
use crate::descriptor::{Descriptor, parse_locator};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// 每次 tick 每个下载最多传输的分片数
pub const PIECES_PER_TICK: usize = 4;

/// 元数据轮询间隔
const RESOLVE_POLL: Duration = Duration::from_millis(50);

static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(1);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct SwarmEntry {
    metadata: Vec<u8>,
    /// 引擎 ID -> 完整文件路径
    seeds: HashMap<u64, PathBuf>,
    members: HashSet<u64>,
    /// 引擎 ID -> 尚未统计的上传字节
    uploaded: HashMap<u64, u64>,
}

/// 回环 swarm，按内容 ID 记录成员和种子
#[derive(Clone, Default)]
pub struct Swarm {
    entries: Arc<Mutex<HashMap<String, SwarmEntry>>>,
}

impl Swarm {
    pub fn new() -> Self {
        Self::default()
    }

    fn advertise(&self, content_id: &str, metadata: Vec<u8>, engine: u64, path: PathBuf) {
        let mut entries = lock(&self.entries);
        let entry = entries.entry(content_id.to_string()).or_default();
        entry.metadata = metadata;
        entry.seeds.insert(engine, path);
        entry.members.insert(engine);
    }

    fn join(&self, content_id: &str, engine: u64) {
        let mut entries = lock(&self.entries);
        entries
            .entry(content_id.to_string())
            .or_default()
            .members
            .insert(engine);
    }

    fn leave(&self, content_id: &str, engine: u64) {
        let mut entries = lock(&self.entries);
        if let Some(entry) = entries.get_mut(content_id) {
            entry.seeds.remove(&engine);
            entry.members.remove(&engine);
            entry.uploaded.remove(&engine);
            if entry.members.is_empty() {
                entries.remove(content_id);
            }
        }
    }

    fn leave_all(&self, engine: u64) {
        let mut entries = lock(&self.entries);
        entries.retain(|_, entry| {
            entry.seeds.remove(&engine);
            entry.members.remove(&engine);
            entry.uploaded.remove(&engine);
            !entry.members.is_empty()
        });
    }

    /// 有种子时返回元数据
    pub fn metadata(&self, content_id: &str) -> Option<Vec<u8>> {
        let entries = lock(&self.entries);
        entries
            .get(content_id)
            .filter(|e| !e.seeds.is_empty())
            .map(|e| e.metadata.clone())
    }

    /// 其他引擎的种子
    fn seed_for(&self, content_id: &str, engine: u64) -> Option<(u64, PathBuf)> {
        let entries = lock(&self.entries);
        entries.get(content_id).and_then(|e| {
            e.seeds
                .iter()
                .filter(|(id, _)| **id != engine)
                .min_by_key(|(id, _)| **id)
                .map(|(id, path)| (*id, path.clone()))
        })
    }

    fn peer_count(&self, content_id: &str, engine: u64) -> u32 {
        let entries = lock(&self.entries);
        entries.get(content_id).map_or(0, |e| {
            let others = e.members.iter().filter(|id| **id != engine).count();
            u32::try_from(others).unwrap_or(u32::MAX)
        })
    }

    fn record_upload(&self, content_id: &str, engine: u64, bytes: u64) {
        let mut entries = lock(&self.entries);
        if let Some(entry) = entries.get_mut(content_id) {
            *entry.uploaded.entry(engine).or_insert(0) += bytes;
        }
    }

    fn take_uploaded(&self, content_id: &str, engine: u64) -> u64 {
        let mut entries = lock(&self.entries);
        entries
            .get_mut(content_id)
            .and_then(|e| e.uploaded.remove(&engine))
            .unwrap_or(0)
    }
}

/// 回环引擎句柄
#[derive(Debug, Clone)]
pub struct MemoryHandle {
    content_id: String,
    locator: String,
    alive: Arc<AtomicBool>,
}

impl TransferHandle for MemoryHandle {
    fn is_valid(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn locator(&self) -> String {
        self.locator.clone()
    }

    fn content_id_hex(&self) -> String {
        self.content_id.clone()
    }
}

struct MemoryTransfer {
    handle: MemoryHandle,
    descriptor: Descriptor,
    path: PathBuf,
    seeding: bool,
    failed: bool,
    next_piece: usize,
    bytes_done: u64,
}

#[derive(Default)]
struct EngineState {
    running: bool,
    transfers: HashMap<String, MemoryTransfer>,
}

struct Inner {
    id: u64,
    swarm: Swarm,
    tick_interval: Option<Duration>,
    state: Mutex<EngineState>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<EngineEvent<MemoryHandle>>>>,
    ticker: Mutex<Option<CancellationToken>>,
}

/// 进程内回环引擎
#[derive(Clone)]
pub struct MemoryEngine {
    inner: Arc<Inner>,
}

impl MemoryEngine {
    /// 手动 tick 的引擎
    pub fn new(swarm: Swarm) -> Self {
        Self::build(swarm, None)
    }

    /// 按固定间隔自动 tick 的引擎
    pub fn with_tick_interval(swarm: Swarm, interval: Duration) -> Self {
        Self::build(swarm, Some(interval))
    }

    fn build(swarm: Swarm, tick_interval: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed),
                swarm,
                tick_interval,
                state: Mutex::new(EngineState::default()),
                subscribers: Mutex::new(Vec::new()),
                ticker: Mutex::new(None),
            }),
        }
    }

    /// 向所有订阅者发送事件
    pub fn emit(&self, event: EngineEvent<MemoryHandle>) {
        self.inner.emit(event);
    }

    /// 推进一次传输并发出状态批次
    pub fn tick(&self) {
        self.inner.tick();
    }

    /// 已注册的描述
    pub fn descriptor(&self, content_id: &str) -> Option<Descriptor> {
        lock(&self.inner.state)
            .transfers
            .get(content_id)
            .map(|t| t.descriptor.clone())
    }

    /// 活动传输数量
    pub fn transfer_count(&self) -> usize {
        lock(&self.inner.state).transfers.len()
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.state).running
    }
}

impl Inner {
    fn emit(&self, event: EngineEvent<MemoryHandle>) {
        let mut subscribers = lock(&self.subscribers);
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn tick_period(&self) -> Duration {
        self.tick_interval.unwrap_or(Duration::from_secs(1))
    }

    fn tick(&self) {
        let mut terminal = Vec::new();
        let mut snapshots = Vec::new();
        let period = self.tick_period().as_secs_f64().max(f64::EPSILON);

        {
            let mut state = lock(&self.state);
            if !state.running {
                return;
            }

            for transfer in state.transfers.values_mut() {
                if transfer.failed {
                    continue;
                }
                let content_id = transfer.handle.content_id.clone();
                let mut downloaded = 0u64;

                if !transfer.seeding {
                    match self.pull_pieces(transfer) {
                        Ok(n) => downloaded = n,
                        Err(message) => {
                            warn!("Transfer {} failed: {}", content_id, message);
                            transfer.failed = true;
                            terminal.push(EngineEvent::Error {
                                handle: transfer.handle.clone(),
                                message,
                            });
                            continue;
                        }
                    }
                    if transfer.next_piece >= transfer.descriptor.piece_count() {
                        transfer.seeding = true;
                        self.swarm.advertise(
                            &content_id,
                            transfer.descriptor.to_bytes(),
                            self.id,
                            transfer.path.clone(),
                        );
                        info!("Transfer {} complete, now seeding", content_id);
                        terminal.push(EngineEvent::Finished(transfer.handle.clone()));
                    }
                }

                let uploaded = self.swarm.take_uploaded(&content_id, self.id);
                snapshots.push(StatusSnapshot {
                    content_id: content_id.clone(),
                    is_seeding: transfer.seeding,
                    num_peers: self.swarm.peer_count(&content_id, self.id),
                    download_rate: rate(downloaded, period),
                    upload_rate: rate(uploaded, period),
                    bytes_done: transfer.bytes_done,
                    bytes_wanted: transfer.descriptor.length,
                });
            }
        }

        if !snapshots.is_empty() {
            snapshots.sort_by(|a, b| a.content_id.cmp(&b.content_id));
            self.emit(EngineEvent::StatusBatch(snapshots));
        }
        for event in terminal {
            self.emit(event);
        }
    }

    /// 从种子复制分片，返回本次下载字节数
    fn pull_pieces(&self, transfer: &mut MemoryTransfer) -> Result<u64, String> {
        let content_id = &transfer.handle.content_id;
        let Some((seed_engine, seed_path)) = self.swarm.seed_for(content_id, self.id) else {
            // 没有种子时等待
            return Ok(0);
        };

        let mut source =
            File::open(&seed_path).map_err(|e| format!("peer read failed: {e}"))?;
        let mut target = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&transfer.path)
            .map_err(|e| format!("cannot write {}: {e}", transfer.path.display()))?;

        let mut downloaded = 0u64;
        for _ in 0..PIECES_PER_TICK {
            let index = transfer.next_piece;
            let Some((start, end)) = transfer.descriptor.piece_range(index) else {
                break;
            };
            let len = usize::try_from(end - start).map_err(|e| e.to_string())?;
            let mut buf = vec![0u8; len];
            source
                .seek(SeekFrom::Start(start))
                .and_then(|_| source.read_exact(&mut buf))
                .map_err(|e| format!("peer read failed: {e}"))?;
            if !transfer.descriptor.verify_piece(index, &buf) {
                return Err(format!("piece {index} failed hash check"));
            }
            target
                .seek(SeekFrom::Start(start))
                .and_then(|_| target.write_all(&buf))
                .map_err(|e| format!("cannot write {}: {e}", transfer.path.display()))?;

            transfer.next_piece += 1;
            transfer.bytes_done = end;
            downloaded += end - start;
        }

        self.swarm
            .record_upload(content_id, seed_engine, downloaded);
        Ok(downloaded)
    }

    fn spawn_ticker(self: &Arc<Self>) {
        let Some(interval) = self.tick_interval else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No tokio runtime, automatic ticks disabled");
            return;
        };

        let token = CancellationToken::new();
        if let Some(old) = lock(&self.ticker).replace(token.clone()) {
            old.cancel();
        }

        let inner = Arc::clone(self);
        runtime.spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.tick().await;
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = timer.tick() => {
                        let inner = Arc::clone(&inner);
                        if tokio::task::spawn_blocking(move || inner.tick()).await.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("Ticker stopped");
        });
    }
}

#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn rate(bytes: u64, period_secs: f64) -> u64 {
    (bytes as f64 / period_secs) as u64
}

fn file_len(path: &Path) -> Option<u64> {
    std::fs::metadata(path).ok().filter(|m| m.is_file()).map(|m| m.len())
}

#[async_trait]
impl Engine for MemoryEngine {
    type Handle = MemoryHandle;

    fn start(&self) -> Result<(), EngineError> {
        {
            let mut state = lock(&self.inner.state);
            if state.running {
                return Ok(());
            }
            state.running = true;
        }
        self.inner.spawn_ticker();
        debug!("Memory engine {} started", self.inner.id);
        Ok(())
    }

    fn stop(&self) {
        if let Some(token) = lock(&self.inner.ticker).take() {
            token.cancel();
        }
        {
            let mut state = lock(&self.inner.state);
            state.running = false;
            for (_, transfer) in state.transfers.drain() {
                transfer.handle.alive.store(false, Ordering::SeqCst);
            }
        }
        self.inner.swarm.leave_all(self.inner.id);
        lock(&self.inner.subscribers).clear();
        debug!("Memory engine {} stopped", self.inner.id);
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<EngineEvent<MemoryHandle>> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.inner.subscribers).push(tx);
        rx
    }

    async fn register_for_distribution(
        &self,
        registration: Registration<'_>,
    ) -> Result<(), EngineError> {
        // 提供了描述文件时以文件内容为准
        let descriptor = match registration.descriptor_file {
            Some(path) => {
                Descriptor::read_from(path).map_err(|e| EngineError::Rejected(e.to_string()))?
            }
            None => registration.descriptor.clone(),
        };
        let content_id = descriptor.content_id();
        let path = registration.base_dir.join(&descriptor.name);
        let seeding = file_len(&path) == Some(descriptor.length);

        let mut state = lock(&self.inner.state);
        if !state.running {
            return Err(EngineError::NotRunning);
        }
        if state.transfers.contains_key(&content_id) {
            return Ok(());
        }

        if seeding {
            self.inner
                .swarm
                .advertise(&content_id, descriptor.to_bytes(), self.inner.id, path.clone());
        } else {
            self.inner.swarm.join(&content_id, self.inner.id);
        }

        let handle = MemoryHandle {
            content_id: content_id.clone(),
            locator: descriptor.locator(),
            alive: Arc::new(AtomicBool::new(true)),
        };
        let (next_piece, bytes_done) = if seeding {
            (descriptor.piece_count(), descriptor.length)
        } else {
            (0, 0)
        };
        debug!(
            "Registered {} ({}) in {:?}",
            content_id,
            if seeding { "seed" } else { "leech" },
            registration.base_dir
        );
        state.transfers.insert(
            content_id,
            MemoryTransfer {
                handle,
                descriptor,
                path,
                seeding,
                failed: false,
                next_piece,
                bytes_done,
            },
        );
        Ok(())
    }

    fn find_handle(&self, content_id: &str) -> Option<MemoryHandle> {
        lock(&self.inner.state)
            .transfers
            .get(content_id)
            .map(|t| t.handle.clone())
    }

    async fn resolve_metadata(&self, locator: &str, timeout: Duration) -> Option<Vec<u8>> {
        let locator = parse_locator(locator)?;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if !self.is_running() {
                return None;
            }
            if let Some(metadata) = self.inner.swarm.metadata(&locator.content_id) {
                return Some(metadata);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return None;
            }
            tokio::time::sleep(RESOLVE_POLL.min(deadline - now)).await;
        }
    }

    fn drop_handle(&self, handle: &MemoryHandle) {
        let removed = lock(&self.inner.state)
            .transfers
            .remove(&handle.content_id)
            .is_some();
        handle.alive.store(false, Ordering::SeqCst);
        if removed {
            self.inner.swarm.leave(&handle.content_id, self.inner.id);
            debug!("Dropped {}", handle.content_id);
        }
    }
}
