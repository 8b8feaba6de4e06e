//! 传输控制器
//!
//! 对外入口: 做种、下载、清理、停止会话。
//!
//! 每个控制器拥有一个会话；[`SessionSlot`] 在组合根保证同一时刻至多一个活动控制器。

use super::TransferError;
use super::notify::{ErrorEvent, NotificationSink};
use super::registry::{Role, TransferRequest};
use super::session::Session;
use super::translator::EventTranslator;
use crate::config::DropSettings;
use crate::descriptor::{BuiltDescriptor, Descriptor, DescriptorBuilder, parse_locator};
use crate::engine::{Engine, Registration, TransferHandle};
use log::{debug, error, info};
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

pub const MSG_METADATA_UNAVAILABLE: &str = "Could not retrieve file metadata from locator.";
pub const MSG_INIT_FAILED: &str = "Failed to initialize download session.";

/// 活动传输概要
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveTransfer {
    pub request_id: String,
    pub role: Role,
    pub content_id: String,
}

/// 传输控制器
pub struct TransferController<E: Engine> {
    session: Arc<Session<E>>,
    sink: Arc<dyn NotificationSink>,
    builder: DescriptorBuilder,
    metadata_timeout: Duration,
}

impl<E: Engine> TransferController<E> {
    /// 创建并启动会话，注册事件翻译器
    ///
    /// 必须在 tokio 运行时内调用。
    pub fn start(
        engine: Arc<E>,
        sink: Arc<dyn NotificationSink>,
        settings: &DropSettings,
    ) -> Result<Self, TransferError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TransferError::Engine(format!("no tokio runtime: {e}")))?;

        let (session, events) = Session::start(engine)?;
        let translator = EventTranslator::new(Arc::clone(&session), Arc::clone(&sink));
        runtime.spawn(translator.run(events));

        Ok(Self {
            session,
            sink,
            builder: settings.descriptor_builder(),
            metadata_timeout: settings.metadata_timeout(),
        })
    }

    pub fn session(&self) -> &Arc<Session<E>> {
        &self.session
    }

    pub fn is_running(&self) -> bool {
        self.session.is_running()
    }

    /// 开始做种，返回可分享的定位串
    pub async fn start_seeding(
        &self,
        source: &Path,
        request_id: &str,
    ) -> Result<String, TransferError> {
        self.session.ensure_running()?;

        if !source.is_file() {
            error!("Data file to be seeded does not exist: {:?}", source);
            return Err(TransferError::Validation(format!(
                "source file does not exist: {}",
                source.display()
            )));
        }

        let built = self.builder.build(source).map_err(|e| {
            error!("Failed to create descriptor for seeding: {}", e);
            TransferError::from(e)
        })?;

        let result = self.register_seed(&built, source, request_id).await;
        // 临时描述文件在任何结果下都删除
        built.discard();
        result
    }

    async fn register_seed(
        &self,
        built: &BuiltDescriptor,
        source: &Path,
        request_id: &str,
    ) -> Result<String, TransferError> {
        let base_dir = source
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let content_id = built.descriptor.content_id();

        self.session
            .engine()
            .register_for_distribution(Registration {
                descriptor: &built.descriptor,
                descriptor_file: Some(built.artifact_path()),
                base_dir,
            })
            .await
            .map_err(|e| {
                error!("Engine rejected seed for request ID {}: {}", request_id, e);
                TransferError::Engine(e.to_string())
            })?;

        let Some(handle) = self.valid_handle(&content_id) else {
            error!("Failed to get valid handle after adding seed.");
            return Err(TransferError::Engine(format!(
                "no valid handle for content {content_id}"
            )));
        };

        let locator = handle.locator();
        self.session.insert(TransferRequest {
            request_id: request_id.to_string(),
            role: Role::Seed,
            content_id,
            handle,
        })?;
        info!(
            "Started seeding for request ID {}. Locator: {}",
            request_id, locator
        );
        Ok(locator)
    }

    /// 开始下载
    ///
    /// 元数据解析有超时；解析失败或句柄无效时发出一条错误通知，不登记任何传输。
    pub async fn start_download(
        &self,
        locator: &str,
        save_dir: &Path,
        request_id: &str,
    ) -> Result<(), TransferError> {
        self.session.ensure_running()?;

        if let Err(e) = tokio::fs::create_dir_all(save_dir).await {
            error!("Cannot create save directory {:?}: {}", save_dir, e);
            return Err(TransferError::Validation(format!(
                "cannot create save directory {}: {e}",
                save_dir.display()
            )));
        }

        if parse_locator(locator).is_none() {
            error!("Invalid locator for request ID {}: {}", request_id, locator);
            self.emit_error(request_id, MSG_METADATA_UNAVAILABLE);
            return Err(TransferError::Validation(format!("invalid locator: {locator}")));
        }

        let timeout = self.metadata_timeout;
        let resolved = tokio::time::timeout(
            timeout,
            self.session.engine().resolve_metadata(locator, timeout),
        )
        .await;
        let Ok(Some(metadata)) = resolved else {
            error!("Failed to fetch metadata for request ID {}", request_id);
            self.emit_error(request_id, MSG_METADATA_UNAVAILABLE);
            return Err(TransferError::Timeout(timeout));
        };

        let descriptor = match Descriptor::from_bytes(&metadata) {
            Ok(d) => d,
            Err(e) => {
                error!("Failed to start download: {}", e);
                self.emit_error(request_id, &format!("Download error: {e}"));
                return Err(TransferError::from(e));
            }
        };
        let content_id = descriptor.content_id();

        if let Err(e) = self
            .session
            .engine()
            .register_for_distribution(Registration {
                descriptor: &descriptor,
                descriptor_file: None,
                base_dir: save_dir,
            })
            .await
        {
            error!("Failed to start download: {}", e);
            self.emit_error(request_id, &format!("Download error: {e}"));
            return Err(TransferError::Engine(e.to_string()));
        }

        let Some(handle) = self.valid_handle(&content_id) else {
            error!("Failed to start download: invalid handle returned.");
            self.emit_error(request_id, MSG_INIT_FAILED);
            return Err(TransferError::Engine(format!(
                "no valid handle for content {content_id}"
            )));
        };

        self.session.insert(TransferRequest {
            request_id: request_id.to_string(),
            role: Role::Leech,
            content_id,
            handle,
        })?;
        info!("Started download for request ID: {}", request_id);
        Ok(())
    }

    /// 清理传输（幂等）
    pub fn cleanup_transfer(&self, handle: &E::Handle) {
        self.session.cleanup(handle);
    }

    /// 按请求 ID 取消传输，不发终止通知
    pub fn cancel_transfer(&self, request_id: &str) -> bool {
        let Some(record) = self.session.registry().find_by_request_id(request_id) else {
            debug!("Cancel for unknown request ID {}", request_id);
            return false;
        };
        self.cleanup_transfer(&record.handle);
        true
    }

    /// 停止会话；之后本控制器不再接受新传输
    ///
    /// 控制器被丢弃时也会停止会话。
    pub fn stop_session(&self) {
        self.session.stop();
    }

    /// 当前登记的传输
    pub fn active_transfers(&self) -> Vec<ActiveTransfer> {
        self.session
            .registry()
            .entries()
            .into_iter()
            .map(|r| ActiveTransfer {
                request_id: r.request_id,
                role: r.role,
                content_id: r.content_id,
            })
            .collect()
    }

    fn valid_handle(&self, content_id: &str) -> Option<E::Handle> {
        self.session
            .engine()
            .find_handle(content_id)
            .filter(TransferHandle::is_valid)
    }

    fn emit_error(&self, request_id: &str, message: &str) {
        self.session.with_running(|| {
            self.sink.on_error(ErrorEvent {
                request_id: request_id.to_string(),
                message: message.to_string(),
            });
        });
    }
}

impl<E: Engine> Drop for TransferController<E> {
    fn drop(&mut self) {
        // 翻译任务持有会话，不停止则引擎和任务一直存活
        self.session.stop();
    }
}

/// 组合根持有的控制器槽位
///
/// 创建与停止在同一把锁内串行，停止后下一次 `get_or_start` 创建新会话。
pub struct SessionSlot<E: Engine> {
    current: Mutex<Option<Arc<TransferController<E>>>>,
}

impl<E: Engine> Default for SessionSlot<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Engine> SessionSlot<E> {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Arc<TransferController<E>>>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 返回活动控制器，没有则用 `init` 创建
    pub fn get_or_start<F>(&self, init: F) -> Result<Arc<TransferController<E>>, TransferError>
    where
        F: FnOnce() -> Result<TransferController<E>, TransferError>,
    {
        let mut current = self.lock();
        if let Some(controller) = current.as_ref().filter(|c| c.is_running()) {
            return Ok(Arc::clone(controller));
        }
        let controller = Arc::new(init()?);
        *current = Some(Arc::clone(&controller));
        Ok(controller)
    }

    /// 当前活动控制器
    pub fn current(&self) -> Option<Arc<TransferController<E>>> {
        self.lock().as_ref().filter(|c| c.is_running()).cloned()
    }

    /// 停止并清空槽位
    pub fn stop_session(&self) {
        let current = self.lock().take();
        if let Some(controller) = current {
            controller.stop_session();
        }
    }
}
