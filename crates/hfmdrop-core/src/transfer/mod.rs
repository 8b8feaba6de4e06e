//! 传输编排
//!
//! 包含:
//! - 请求注册表 (请求 ID <-> 内容 ID)
//! - 引擎事件翻译 (状态/完成/错误 -> 对外通知)
//! - 会话与控制器 (做种、下载、清理、停止)

pub mod controller;
pub mod notify;
pub mod registry;
pub mod session;
pub mod translator;

pub use controller::{ActiveTransfer, SessionSlot, TransferController};
pub use notify::{
    ChannelSink, CompletedEvent, ErrorEvent, NotificationSink, ProgressEvent,
    TransferNotification,
};
pub use registry::{RequestRegistry, Role, TransferRequest};
pub use session::Session;
pub use translator::{EventTranslator, percent};

use crate::descriptor::DescriptorError;
use std::time::Duration;

/// 传输错误
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// 源文件缺失/不可读，或保存目录无法创建
    #[error("Validation failed: {0}")]
    Validation(String),

    /// 注册后句柄缺失或无效，或引擎拒绝
    #[error("Engine error: {0}")]
    Engine(String),

    /// 元数据解析超时
    #[error("Metadata resolution timed out after {0:?}")]
    Timeout(Duration),

    #[error("Session has been stopped")]
    SessionStopped,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<DescriptorError> for TransferError {
    fn from(e: DescriptorError) -> Self {
        match e {
            DescriptorError::Missing(_)
            | DescriptorError::Unreadable { .. }
            | DescriptorError::InvalidName(_)
            | DescriptorError::InvalidPieceSize(_) => TransferError::Validation(e.to_string()),
            DescriptorError::Artifact(io) => TransferError::Io(io),
            DescriptorError::Decode(_) | DescriptorError::InvalidField(_) => {
                TransferError::Engine(e.to_string())
            }
        }
    }
}
