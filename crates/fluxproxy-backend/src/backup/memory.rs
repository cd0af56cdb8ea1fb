//! 进程内备份队列
//!
//! 语义与 Kafka 队列一致: 处理成功后才提交,取消时未提交的数据保留。
//! 不具备跨进程持久性,用于演练环境与测试。

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::{BackupFactory, BackupHandler, BackupStore};
use crate::{BackendError, BackendResult};

/// 内存队列
pub struct MemoryBackup {
    topic: String,
    queue: Mutex<VecDeque<Vec<u8>>>,
    available: AtomicBool,
    pushed: AtomicU64,
    consumed: AtomicU64,
}

impl MemoryBackup {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            queue: Mutex::new(VecDeque::new()),
            available: AtomicBool::new(true),
            pushed: AtomicU64::new(0),
            consumed: AtomicU64::new(0),
        }
    }

    /// 模拟队列服务可用/不可用
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// 当前积压数据的快照
    pub fn snapshot(&self) -> Vec<Vec<u8>> {
        self.queue.lock().iter().cloned().collect()
    }

    pub fn pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    pub fn consumed(&self) -> u64 {
        self.consumed.load(Ordering::Relaxed)
    }

    fn check_available(&self) -> BackendResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BackendError::BackupUnavailable(format!("{} is unreachable", self.topic)))
        }
    }
}

#[async_trait]
impl BackupStore for MemoryBackup {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn push(&self, data: Vec<u8>) -> BackendResult<()> {
        self.check_available()
            .map_err(|e| BackendError::PushBackup(e.to_string()))?;
        self.queue.lock().push_back(data);
        self.pushed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn pull(&self, cancel: &CancellationToken, handler: &dyn BackupHandler) -> BackendResult<()> {
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            self.check_available()?;
            let item = self.queue.lock().front().cloned();
            let Some(item) = item else {
                return Ok(());
            };
            handler.handle(&item).await;
            // 处理完成后提交
            self.queue.lock().pop_front();
            self.consumed.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn offset_size(&self) -> BackendResult<i64> {
        self.check_available()?;
        Ok(self.queue.lock().len() as i64)
    }

    async fn close(&self) {}
}

/// 内存队列工厂
///
/// 同名后端重复创建时返回同一个队列,模拟重连后积压仍在。
#[derive(Default)]
pub struct MemoryBackupFactory {
    stores: Mutex<HashMap<String, Arc<MemoryBackup>>>,
}

impl MemoryBackupFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn store(&self, backend: &str) -> Arc<MemoryBackup> {
        self.stores
            .lock()
            .entry(backend.to_string())
            .or_insert_with(|| Arc::new(MemoryBackup::new(format!("memory_{}", backend))))
            .clone()
    }
}

#[async_trait]
impl BackupFactory for MemoryBackupFactory {
    async fn create(&self, backend: &str) -> BackendResult<Arc<dyn BackupStore>> {
        Ok(self.store(backend))
    }
}
