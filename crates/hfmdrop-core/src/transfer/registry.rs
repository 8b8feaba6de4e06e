//! 请求注册表
//!
//! 应用请求 ID 与引擎内容 ID 的双向映射。记录按请求 ID 存放，
//! 另有内容 ID -> 请求 ID 的索引；两者在同一把锁内更新，
//! 任一时刻每个请求 ID、每个内容 ID 至多对应一条记录。

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// 传输角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Seed,
    Leech,
}

/// 注册的传输
#[derive(Debug, Clone)]
pub struct TransferRequest<H> {
    pub request_id: String,
    pub role: Role,
    pub content_id: String,
    pub handle: H,
}

struct Inner<H> {
    records: HashMap<String, TransferRequest<H>>,
    by_content: HashMap<String, String>,
}

impl<H> Inner<H> {
    fn remove_record(&mut self, request_id: &str) -> Option<TransferRequest<H>> {
        let record = self.records.remove(request_id)?;
        self.by_content.remove(&record.content_id);
        Some(record)
    }
}

/// 线程安全的双向注册表
pub struct RequestRegistry<H> {
    inner: Mutex<Inner<H>>,
}

impl<H: Clone> Default for RequestRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: Clone> RequestRegistry<H> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                records: HashMap::new(),
                by_content: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<H>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 插入记录，覆盖同一请求 ID（或同一内容 ID）的旧记录
    ///
    /// 返回被替换的记录。
    pub fn put(&self, request: TransferRequest<H>) -> Vec<TransferRequest<H>> {
        let mut inner = self.lock();
        let mut replaced = Vec::new();

        if let Some(old) = inner.remove_record(&request.request_id) {
            replaced.push(old);
        }
        if let Some(owner) = inner.by_content.get(&request.content_id).cloned()
            && let Some(old) = inner.remove_record(&owner)
        {
            replaced.push(old);
        }

        inner
            .by_content
            .insert(request.content_id.clone(), request.request_id.clone());
        inner.records.insert(request.request_id.clone(), request);
        replaced
    }

    /// 按内容 ID 查找 (请求 ID, 句柄)
    pub fn find_by_content_id(&self, content_id: &str) -> Option<(String, H)> {
        let inner = self.lock();
        let request_id = inner.by_content.get(content_id)?;
        inner
            .records
            .get(request_id)
            .map(|r| (r.request_id.clone(), r.handle.clone()))
    }

    /// 按请求 ID 查找记录
    pub fn find_by_request_id(&self, request_id: &str) -> Option<TransferRequest<H>> {
        self.lock().records.get(request_id).cloned()
    }

    /// 按内容 ID 移除，返回请求 ID；不存在时无操作
    pub fn remove_by_content_id(&self, content_id: &str) -> Option<String> {
        let mut inner = self.lock();
        let request_id = inner.by_content.get(content_id).cloned()?;
        inner.remove_record(&request_id).map(|r| r.request_id)
    }

    /// 按请求 ID 移除，返回内容 ID；不存在时无操作
    pub fn remove_by_request_id(&self, request_id: &str) -> Option<String> {
        self.lock().remove_record(request_id).map(|r| r.content_id)
    }

    /// 清空
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.records.clear();
        inner.by_content.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 当前所有记录（按请求 ID 排序）
    pub fn entries(&self) -> Vec<TransferRequest<H>> {
        let mut entries: Vec<_> = self.lock().records.values().cloned().collect();
        entries.sort_by(|a, b| a.request_id.cmp(&b.request_id));
        entries
    }
}
