//! P2P 引擎接口
//!
//! 传输核心不实现任何线协议，只依赖这里定义的引擎能力:
//! - 会话启动/停止
//! - 注册描述以开始分发
//! - 按内容 ID 查找句柄、移除句柄
//! - 通过定位串解析元数据（有超时）
//! - 单一事件通道: 状态批次、完成、错误
//!
//! `memory` 子模块提供进程内回环实现，用于测试和 CLI 演示。

pub mod memory;


pub use memory::{MemoryEngine, MemoryHandle, Swarm};

use crate::descriptor::Descriptor;
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;

/// 引擎错误
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Engine is not running")]
    NotRunning,

    #[error("Engine rejected transfer: {0}")]
    Rejected(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// 引擎侧的活动传输句柄
pub trait TransferHandle: Clone + Send + Sync + 'static {
    /// 句柄是否仍然有效（被移除或会话停止后无效）
    fn is_valid(&self) -> bool;
    /// 可分享的定位串
    fn locator(&self) -> String;
    /// 内容 ID（十六进制）
    fn content_id_hex(&self) -> String;
}

/// 单个传输的状态快照
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub content_id: String,
    pub is_seeding: bool,
    pub num_peers: u32,
    /// 下载速率 (字节/秒)
    pub download_rate: u64,
    /// 上传速率 (字节/秒)
    pub upload_rate: u64,
    pub bytes_done: u64,
    pub bytes_wanted: u64,
}

/// 引擎事件
#[derive(Debug, Clone)]
pub enum EngineEvent<H> {
    /// 周期性状态批次
    StatusBatch(Vec<StatusSnapshot>),
    /// 传输完成
    Finished(H),
    /// 传输出错
    Error { handle: H, message: String },
}

/// 注册请求
#[derive(Debug, Clone, Copy)]
pub struct Registration<'a> {
    pub descriptor: &'a Descriptor,
    /// 需要文件形式描述的引擎使用；下载时为 None
    pub descriptor_file: Option<&'a Path>,
    /// 数据所在（做种）或保存（下载）目录
    pub base_dir: &'a Path,
}

/// P2P 引擎
#[async_trait]
pub trait Engine: Send + Sync + 'static {
    type Handle: TransferHandle;

    /// 启动会话
    fn start(&self) -> Result<(), EngineError>;

    /// 停止会话，所有句柄失效，事件通道关闭
    fn stop(&self);

    /// 订阅全部事件
    fn subscribe(&self) -> mpsc::UnboundedReceiver<EngineEvent<Self::Handle>>;

    /// 注册描述开始分发；句柄随后通过 `find_handle` 获取
    async fn register_for_distribution(
        &self,
        registration: Registration<'_>,
    ) -> Result<(), EngineError>;

    /// 按内容 ID 查找句柄
    fn find_handle(&self, content_id: &str) -> Option<Self::Handle>;

    /// 从定位串解析元数据，超时返回 None
    async fn resolve_metadata(&self, locator: &str, timeout: Duration) -> Option<Vec<u8>>;

    /// 移除句柄（对已移除的句柄无操作）
    fn drop_handle(&self, handle: &Self::Handle);
}
