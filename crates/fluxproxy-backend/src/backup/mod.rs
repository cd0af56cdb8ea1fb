//! 备份队列
//!
//! 后端无法直接写入时,请求被序列化为 `BackupData` 推入持久化队列,
//! 恢复后由回放任务按批次拉取并重新走正常写入路径。
//! 队列只保证至少一次投递,不保证顺序。

mod kafka;
mod memory;

pub use kafka::{KafkaBackup, KafkaBackupFactory};
pub use memory::{MemoryBackup, MemoryBackupFactory};

use async_trait::async_trait;
use bytes::Bytes;
use fluxproxy_common::{FlowId, Headers, WriteParams};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{BackendError, BackendResult};

/// 备份信封
///
/// 队列中的数据可能跨越多次部署,字段只增不改,新增字段必须有默认值。
/// `url_params.db` 为空表示这是一条建库语句,`query` 即 SQL。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupData {
    #[serde(default)]
    pub header: Headers,
    #[serde(default, with = "payload")]
    pub query: Bytes,
    #[serde(default)]
    pub url_params: WriteParams,
    #[serde(default)]
    pub flow_id: FlowId,
}

impl BackupData {
    pub fn new(flow_id: FlowId, url_params: WriteParams, query: Bytes, header: Headers) -> Self {
        Self {
            header,
            query,
            url_params,
            flow_id,
        }
    }

    /// 是否为建库语句
    pub fn is_create_database(&self) -> bool {
        self.url_params.db.is_empty()
    }

    pub fn encode(&self) -> BackendResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| BackendError::BackupSerialize(e.to_string()))
    }

    pub fn decode(data: &[u8]) -> BackendResult<Self> {
        serde_json::from_slice(data).map_err(|e| BackendError::BackupDecode(e.to_string()))
    }
}

/// 以 base64 字符串保存二进制负载
mod payload {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD
            .decode(s.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

/// 回放时逐条处理备份数据
#[async_trait]
pub trait BackupHandler: Send + Sync {
    async fn handle(&self, data: &[u8]);
}

/// 持久化备份队列
#[async_trait]
pub trait BackupStore: Send + Sync {
    /// 队列名称
    fn topic(&self) -> &str;

    /// 追加一条序列化后的信封
    async fn push(&self, data: Vec<u8>) -> BackendResult<()>;

    /// # Brief
    /// 拉取并处理积压数据,积压清零或被取消后返回
    ///
    /// 不是持续订阅,每次调用只排空当前积压。
    async fn pull(&self, cancel: &CancellationToken, handler: &dyn BackupHandler) -> BackendResult<()>;

    /// 积压量: 各分区最新位点与已提交位点之差的总和
    async fn offset_size(&self) -> BackendResult<i64>;

    async fn has_data(&self) -> BackendResult<bool> {
        let size = self.offset_size().await?;
        if size < 0 {
            return Err(BackendError::LowerZeroOffset(size));
        }
        Ok(size > 0)
    }

    async fn close(&self);
}

/// 按后端名创建备份队列
#[async_trait]
pub trait BackupFactory: Send + Sync {
    async fn create(&self, backend: &str) -> BackendResult<Arc<dyn BackupStore>>;
}

/// 不做备份的空队列
///
/// 推入的数据直接丢弃,积压永远为 0。
pub struct EmptyBackup {
    topic: String,
}

impl EmptyBackup {
    pub fn new(backend: &str) -> Self {
        Self {
            topic: format!("empty_{}", backend),
        }
    }
}

#[async_trait]
impl BackupStore for EmptyBackup {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn push(&self, data: Vec<u8>) -> BackendResult<()> {
        warn!("backup ignored for {}, {} bytes dropped", self.topic, data.len());
        Ok(())
    }

    async fn pull(&self, _cancel: &CancellationToken, _handler: &dyn BackupHandler) -> BackendResult<()> {
        Ok(())
    }

    async fn offset_size(&self) -> BackendResult<i64> {
        Ok(0)
    }

    async fn close(&self) {}
}

/// 创建空队列
#[derive(Debug, Default)]
pub struct EmptyBackupFactory;

#[async_trait]
impl BackupFactory for EmptyBackupFactory {
    async fn create(&self, backend: &str) -> BackendResult<Arc<dyn BackupStore>> {
        Ok(Arc::new(EmptyBackup::new(backend)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_round_trip() {
        let mut header = Headers::new();
        header.insert("Content-Type", "text/plain");
        let params = WriteParams {
            db: "db1".into(),
            consistency: "one".into(),
            precision: "s".into(),
            rp: "autogen".into(),
        };
        let data = BackupData::new(42, params, Bytes::from_static(b"cpu,host=a value=1 0\n"), header);

        let encoded = data.encode().unwrap();
        let decoded = BackupData::decode(&encoded).unwrap();
        assert_eq!(decoded, data);
        assert!(!decoded.is_create_database());
    }

    #[test]
    fn test_envelope_tolerates_missing_and_unknown_fields() {
        let raw = br#"{"query":"Q1JFQVRFIERBVEFCQVNFIGRiMQ==","flow_id":7,"extra":true}"#;
        let decoded = BackupData::decode(raw).unwrap();
        assert_eq!(decoded.flow_id, 7);
        assert_eq!(&decoded.query[..], b"CREATE DATABASE db1");
        assert!(decoded.is_create_database());
        assert!(decoded.header.is_empty());
    }

    #[test]
    fn test_envelope_decode_error() {
        assert!(matches!(
            BackupData::decode(b"not json"),
            Err(BackendError::BackupDecode(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_backup() {
        let store = EmptyBackupFactory.create("b1").await.unwrap();
        store.push(b"data".to_vec()).await.unwrap();
        assert!(!store.has_data().await.unwrap());
        assert_eq!(store.topic(), "empty_b1");
    }
}
