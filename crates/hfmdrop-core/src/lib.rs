//! HFM Drop Core Library
//!
//! 基于外部 P2P 引擎的文件互传编排核心
//!
//! # 模块
//!
//! - **descriptor**: 描述文件构建、编解码和定位串
//! - **engine**: P2P 引擎接口与进程内回环实现
//! - **transfer**: 请求注册表、事件翻译、传输控制器
//! - **config**: 应用设置
//!
//! # 使用示例
//!
//! ## 发送文件
//!
//! ```ignore
//! use hfmdrop_core::{ChannelSink, DropSettings, MemoryEngine, Swarm, TransferController};
//!
//! let (sink, mut notifications) = ChannelSink::new();
//! let engine = Arc::new(MemoryEngine::new(Swarm::new()));
//! let controller = TransferController::start(engine, Arc::new(sink), &DropSettings::load())?;
//!
//! // 返回可分享的定位串
//! let locator = controller.start_seeding(&path, "req-1").await?;
//! ```
//!
//! ## 接收文件
//!
//! ```ignore
//! controller.start_download(&locator, &save_dir, "req-2").await?;
//!
//! while let Some(n) = notifications.recv().await {
//!     if n.is_terminal() {
//!         break;
//!     }
//! }
//! ```

pub mod config;
pub mod descriptor;
pub mod engine;
pub mod transfer;

pub use config::{DropSettings, SettingsError};

// Descriptor re-exports
pub use descriptor::{
    BuiltDescriptor, Descriptor, DescriptorBuilder, DescriptorError, Locator, PieceSize,
    format_locator, parse_locator,
};

// Engine re-exports
pub use engine::{
    Engine, EngineError, EngineEvent, MemoryEngine, MemoryHandle, Registration, StatusSnapshot,
    Swarm, TransferHandle,
};

// Transfer re-exports
pub use transfer::{
    ActiveTransfer, ChannelSink, CompletedEvent, ErrorEvent, NotificationSink, ProgressEvent,
    Role, SessionSlot, TransferController, TransferError, TransferNotification,
};
