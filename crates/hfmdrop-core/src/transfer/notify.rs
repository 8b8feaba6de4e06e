//! 生命周期通知
//!
//! 核心向外发出三类通知: 进度、完成、错误。
//! 接收方实现 [`NotificationSink`]；[`ChannelSink`] 把通知转发到 mpsc 通道。

use serde::Serialize;
use tokio::sync::mpsc;

/// 进度通知
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub request_id: String,
    /// 粗粒度阶段 ("Sending File..." / "Receiving File...")
    pub phase_label: String,
    /// 对端数与速率
    pub detail_label: String,
    /// 0..=100
    pub percent: u8,
    pub bytes_done: u64,
}

/// 完成通知
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedEvent {
    pub request_id: String,
}

/// 错误通知
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEvent {
    pub request_id: String,
    pub message: String,
}

/// 统一的通知类型
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TransferNotification {
    Progress(ProgressEvent),
    Completed(CompletedEvent),
    Error(ErrorEvent),
}

impl TransferNotification {
    pub fn request_id(&self) -> &str {
        match self {
            TransferNotification::Progress(e) => &e.request_id,
            TransferNotification::Completed(e) => &e.request_id,
            TransferNotification::Error(e) => &e.request_id,
        }
    }

    /// 完成或错误
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransferNotification::Progress(_))
    }
}

/// 通知接收方
pub trait NotificationSink: Send + Sync {
    /// 进度更新
    fn on_progress(&self, event: ProgressEvent);
    /// 传输完成
    fn on_completed(&self, event: CompletedEvent);
    /// 传输失败
    fn on_error(&self, event: ErrorEvent);
}

/// 转发到通道的通知接收方
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<TransferNotification>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TransferNotification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl NotificationSink for ChannelSink {
    fn on_progress(&self, event: ProgressEvent) {
        let _ = self.tx.send(TransferNotification::Progress(event));
    }

    fn on_completed(&self, event: CompletedEvent) {
        let _ = self.tx.send(TransferNotification::Completed(event));
    }

    fn on_error(&self, event: ErrorEvent) {
        let _ = self.tx.send(TransferNotification::Error(event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize_tagged() {
        let n = TransferNotification::Progress(ProgressEvent {
            request_id: "r1".to_string(),
            phase_label: "Sending File...".to_string(),
            detail_label: "Peers: 1 | Down: 0 KB/s | Up: 4 KB/s".to_string(),
            percent: 40,
            bytes_done: 400,
        });
        let json: serde_json::Value = serde_json::to_value(&n).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["requestId"], "r1");
        assert_eq!(json["bytesDone"], 400);
        assert!(!n.is_terminal());
    }

    #[test]
    fn test_channel_sink_forwards() {
        let (sink, mut rx) = ChannelSink::new();
        sink.on_completed(CompletedEvent {
            request_id: "r2".to_string(),
        });
        sink.on_error(ErrorEvent {
            request_id: "r3".to_string(),
            message: "boom".to_string(),
        });

        let first = rx.try_recv().unwrap();
        assert_eq!(first.request_id(), "r2");
        assert!(first.is_terminal());
        assert!(matches!(rx.try_recv().unwrap(), TransferNotification::Error(e) if e.message == "boom"));
    }
}
