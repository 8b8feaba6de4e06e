//! 引擎事件翻译
//!
//! 消费会话的全部引擎事件，按内容 ID 查注册表，转成对外通知:
//! - 状态批次 -> 每个已登记传输一条进度通知
//! - 完成 -> 一条完成通知，然后清理
//! - 错误 -> 一条错误通知，然后清理
//!
//! 未登记（或已清理）的内容 ID 不产生通知，终止事件仍会触发清理，
//! 所以同一传输最多一条终止通知。

use super::notify::{CompletedEvent, ErrorEvent, NotificationSink, ProgressEvent};
use super::session::Session;
use crate::engine::{Engine, EngineEvent, StatusSnapshot, TransferHandle};
use log::{debug, error, info};
use std::sync::Arc;
use tokio::sync::mpsc;

pub const PHASE_SENDING: &str = "Sending File...";
pub const PHASE_RECEIVING: &str = "Receiving File...";

/// 完成百分比，`bytes_wanted == 0` 时为 0，结果限制在 0..=100
pub fn percent(bytes_done: u64, bytes_wanted: u64) -> u8 {
    if bytes_wanted == 0 {
        return 0;
    }
    let p = (u128::from(bytes_done) * 100 / u128::from(bytes_wanted)).min(100);
    u8::try_from(p).unwrap_or(100)
}

/// 对端数与速率描述
pub fn detail_label(snapshot: &StatusSnapshot) -> String {
    format!(
        "Peers: {} | Down: {} KB/s | Up: {} KB/s",
        snapshot.num_peers,
        snapshot.download_rate / 1024,
        snapshot.upload_rate / 1024
    )
}

/// 事件翻译器
pub struct EventTranslator<E: Engine> {
    session: Arc<Session<E>>,
    sink: Arc<dyn NotificationSink>,
}

impl<E: Engine> EventTranslator<E> {
    pub fn new(session: Arc<Session<E>>, sink: Arc<dyn NotificationSink>) -> Self {
        Self { session, sink }
    }

    /// 事件循环，会话停止或通道关闭时退出
    pub async fn run(self, mut events: mpsc::UnboundedReceiver<EngineEvent<E::Handle>>) {
        let cancelled = self.session.cancelled();
        loop {
            tokio::select! {
                biased;
                () = cancelled.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.dispatch(event),
                    None => break,
                },
            }
        }
        debug!("Event translator stopped");
    }

    /// 处理单个事件；会话停止后忽略
    pub fn dispatch(&self, event: EngineEvent<E::Handle>) {
        self.session.with_running(|| match event {
            EngineEvent::StatusBatch(snapshots) => {
                for snapshot in &snapshots {
                    self.on_status(snapshot);
                }
            }
            EngineEvent::Finished(handle) => self.on_finished(&handle),
            EngineEvent::Error { handle, message } => self.on_error(&handle, message),
        });
    }

    fn on_status(&self, snapshot: &StatusSnapshot) {
        let Some((request_id, _)) = self
            .session
            .registry()
            .find_by_content_id(&snapshot.content_id)
        else {
            return;
        };

        let phase = if snapshot.is_seeding {
            PHASE_SENDING
        } else {
            PHASE_RECEIVING
        };
        self.sink.on_progress(ProgressEvent {
            request_id,
            phase_label: phase.to_string(),
            detail_label: detail_label(snapshot),
            percent: percent(snapshot.bytes_done, snapshot.bytes_wanted),
            bytes_done: snapshot.bytes_done,
        });
    }

    fn on_finished(&self, handle: &E::Handle) {
        let request_id = self.lookup(handle);
        info!(
            "Transfer finished for request ID: {}",
            request_id.as_deref().unwrap_or("unknown")
        );
        if let Some(request_id) = request_id {
            self.sink.on_completed(CompletedEvent { request_id });
        }
        self.session.cleanup(handle);
    }

    fn on_error(&self, handle: &E::Handle, message: String) {
        let request_id = self.lookup(handle);
        error!(
            "Transfer error for request ID {}: {}",
            request_id.as_deref().unwrap_or("unknown"),
            message
        );
        if let Some(request_id) = request_id {
            self.sink.on_error(ErrorEvent {
                request_id,
                message,
            });
        }
        self.session.cleanup(handle);
    }

    fn lookup(&self, handle: &E::Handle) -> Option<String> {
        self.session
            .registry()
            .find_by_content_id(&handle.content_id_hex())
            .map(|(request_id, _)| request_id)
    }
}
