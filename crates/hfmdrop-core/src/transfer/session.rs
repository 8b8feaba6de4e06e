//! 运行时会话
//!
//! 包装引擎与注册表，是事件分发和控制器之间唯一的共享状态。
//! 停止与注册互斥: 停止后不能再插入记录，注册表被清空。
//! 通知回调在锁外执行。

use super::TransferError;
use super::registry::{RequestRegistry, TransferRequest};
use crate::engine::{Engine, EngineEvent, TransferHandle};
use log::{debug, info, warn};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Running,
    Stopped,
}

/// 引擎会话
pub struct Session<E: Engine> {
    engine: Arc<E>,
    registry: RequestRegistry<E::Handle>,
    state: Mutex<SessionState>,
    cancel: CancellationToken,
}

impl<E: Engine> Session<E> {
    /// 订阅事件并启动引擎
    ///
    /// 返回的接收端是该会话唯一的事件订阅，必须在注册任何传输前建立。
    pub fn start(
        engine: Arc<E>,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<EngineEvent<E::Handle>>), TransferError> {
        let events = engine.subscribe();
        engine
            .start()
            .map_err(|e| TransferError::Engine(format!("failed to start session: {e}")))?;
        info!("Transfer session started");

        let session = Arc::new(Self {
            engine,
            registry: RequestRegistry::new(),
            state: Mutex::new(SessionState::Running),
            cancel: CancellationToken::new(),
        });
        Ok((session, events))
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn registry(&self) -> &RequestRegistry<E::Handle> {
        &self.registry
    }

    pub fn is_running(&self) -> bool {
        *self.state() == SessionState::Running
    }

    pub(crate) fn ensure_running(&self) -> Result<(), TransferError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(TransferError::SessionStopped)
        }
    }

    /// 仅在会话运行时执行 `f`
    ///
    /// 状态锁只用于判断，`f` 执行时不持有，所以 `f` 内的通知回调可以调用 `stop`。
    pub(crate) fn with_running<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        self.is_running().then(f)
    }

    /// 会话停止时被取消
    pub fn cancelled(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// 插入注册表；会话已停止时失败
    pub(crate) fn insert(&self, request: TransferRequest<E::Handle>) -> Result<(), TransferError> {
        let state = self.state();
        if *state == SessionState::Stopped {
            return Err(TransferError::SessionStopped);
        }
        let request_id = request.request_id.clone();
        for old in self.registry.put(request) {
            warn!(
                "Request {} replaced tracked transfer {} (request {})",
                request_id, old.content_id, old.request_id
            );
        }
        Ok(())
    }

    /// 清理传输: 移除注册表记录并让引擎移除句柄
    ///
    /// 句柄无效时无操作；重复调用只会再次尝试引擎侧移除。
    pub fn cleanup(&self, handle: &E::Handle) {
        if !handle.is_valid() {
            return;
        }
        let content_id = handle.content_id_hex();
        let removed = self.registry.remove_by_content_id(&content_id);
        self.engine.drop_handle(handle);

        match removed {
            Some(request_id) => {
                info!("Cleaned up and removed transfer for request ID: {request_id}");
            }
            None => debug!("Dropped untracked transfer {content_id}"),
        }
    }

    /// 停止会话（重复调用无操作）
    pub fn stop(&self) {
        let mut state = self.state();
        if *state == SessionState::Stopped {
            return;
        }
        info!("Stopping transfer session");
        *state = SessionState::Stopped;
        self.cancel.cancel();
        self.engine.stop();
        self.registry.clear();
    }
}
