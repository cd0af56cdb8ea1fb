//! Kafka 备份队列
//!
//! 每个后端一个 topic (`<prefix>_<backend>`,默认单分区单副本),
//! 每个后端一个消费组。生产端 acks=all,消费端手动提交位点。

use async_trait::async_trait;
use fluxproxy_common::KafkaConfig;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::RDKafkaErrorCode;
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{Offset, TopicPartitionList};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{BackupFactory, BackupHandler, BackupStore};
use crate::{BackendError, BackendResult};

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// Kafka 备份队列
pub struct KafkaBackup {
    topic: String,
    producer: FutureProducer,
    consumer: Arc<StreamConsumer>,
    check_interval: Duration,
}

impl KafkaBackup {
    /// # Brief
    /// 连接 Kafka,确保 topic 存在并订阅
    ///
    /// # Arguments
    /// * `config` - Kafka 配置
    /// * `backend` - 后端名,决定 topic 与消费组
    pub async fn connect(config: &KafkaConfig, backend: &str) -> BackendResult<Self> {
        let topic = config.topic(backend);
        let base = client_config(config);

        ensure_topic(&base, config, &topic).await?;

        let producer: FutureProducer = base
            .clone()
            .set("acks", "all")
            .set("message.send.max.retries", "10")
            .create()
            .map_err(unavailable)?;

        let consumer: StreamConsumer = base
            .clone()
            .set("group.id", config.group(backend))
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()
            .map_err(unavailable)?;
        consumer.subscribe(&[topic.as_str()]).map_err(unavailable)?;

        info!("kafka backup ready, topic:{} brokers:{}", topic, config.brokers());
        Ok(Self {
            topic,
            producer,
            consumer: Arc::new(consumer),
            check_interval: config.check_interval(),
        })
    }

    fn commit(&self, partition: i32, offset: i64) -> BackendResult<()> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&self.topic, partition, Offset::Offset(offset + 1))
            .map_err(unavailable)?;
        self.consumer
            .commit(&tpl, CommitMode::Async)
            .map_err(unavailable)
    }
}

fn unavailable(e: rdkafka::error::KafkaError) -> BackendError {
    BackendError::BackupUnavailable(e.to_string())
}

fn client_config(config: &KafkaConfig) -> ClientConfig {
    let mut base = ClientConfig::new();
    base.set("bootstrap.servers", config.brokers());
    if !config.username.is_empty() {
        base.set("security.protocol", "SASL_PLAINTEXT")
            .set("sasl.mechanisms", &config.mechanism)
            .set("sasl.username", &config.username)
            .set("sasl.password", &config.password);
    }
    base
}

async fn ensure_topic(base: &ClientConfig, config: &KafkaConfig, topic: &str) -> BackendResult<()> {
    let admin: AdminClient<DefaultClientContext> = base.create().map_err(unavailable)?;
    let retention_ms = config.retention().map(|d| d.as_millis().to_string());
    let mut new_topic = NewTopic::new(topic, 1, TopicReplication::Fixed(1));
    if let Some(ms) = retention_ms.as_deref() {
        new_topic = new_topic.set("retention.ms", ms);
    }

    let results = admin
        .create_topics(&[new_topic], &AdminOptions::new())
        .await
        .map_err(unavailable)?;
    for result in results {
        match result {
            Ok(name) => info!("kafka topic created: {}", name),
            Err((name, RDKafkaErrorCode::TopicAlreadyExists)) => debug!("kafka topic exists: {}", name),
            Err((name, code)) => {
                return Err(BackendError::BackupUnavailable(format!(
                    "create topic {} failed: {}",
                    name, code
                )))
            }
        }
    }
    Ok(())
}

#[async_trait]
impl BackupStore for KafkaBackup {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn push(&self, data: Vec<u8>) -> BackendResult<()> {
        let record = FutureRecord::<(), Vec<u8>>::to(&self.topic).payload(&data);
        self.producer
            .send(record, Duration::from_secs(0))
            .await
            .map(|_| ())
            .map_err(|(e, _)| BackendError::PushBackup(e.to_string()))
    }

    async fn pull(&self, cancel: &CancellationToken, handler: &dyn BackupHandler) -> BackendResult<()> {
        loop {
            if cancel.is_cancelled() || !self.has_data().await? {
                return Ok(());
            }

            // 每个检查周期结束后重新计算积压
            let deadline = tokio::time::sleep(self.check_interval);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = &mut deadline => break,
                    msg = self.consumer.recv() => {
                        let msg = msg.map_err(unavailable)?.detach();
                        if let Some(payload) = msg.payload() {
                            handler.handle(payload).await;
                        }
                        self.commit(msg.partition(), msg.offset())?;
                    }
                }
            }
        }
    }

    async fn offset_size(&self) -> BackendResult<i64> {
        let consumer = self.consumer.clone();
        let topic = self.topic.clone();
        tokio::task::spawn_blocking(move || backlog(&consumer, &topic))
            .await
            .map_err(|e| BackendError::BackupUnavailable(e.to_string()))?
    }

    async fn close(&self) {
        self.consumer.unsubscribe();
        debug!("kafka backup closed, topic:{}", self.topic);
    }
}

/// 计算各分区 (最新位点 - 已提交位点) 之和,空分区跳过
fn backlog(consumer: &StreamConsumer, topic: &str) -> BackendResult<i64> {
    let metadata = consumer
        .fetch_metadata(Some(topic), METADATA_TIMEOUT)
        .map_err(unavailable)?;
    let partitions: Vec<i32> = metadata
        .topics()
        .iter()
        .filter(|t| t.name() == topic)
        .flat_map(|t| t.partitions().iter().map(|p| p.id()))
        .collect();

    let mut tpl = TopicPartitionList::new();
    for partition in &partitions {
        tpl.add_partition(topic, *partition);
    }
    let committed = consumer
        .committed_offsets(tpl, METADATA_TIMEOUT)
        .map_err(unavailable)?;

    let mut total = 0i64;
    for partition in partitions {
        let (low, high) = consumer
            .fetch_watermarks(topic, partition, METADATA_TIMEOUT)
            .map_err(unavailable)?;
        if low == high {
            continue;
        }
        let committed_offset = committed
            .find_partition(topic, partition)
            .and_then(|elem| match elem.offset() {
                Offset::Offset(o) => Some(o),
                _ => None,
            })
            .unwrap_or(low);
        let size = high - committed_offset.max(low);
        if size < 0 {
            warn!("negative backlog on {}:{} high:{} committed:{}", topic, partition, high, committed_offset);
        }
        total += size;
    }
    Ok(total)
}

/// Kafka 队列工厂
pub struct KafkaBackupFactory {
    config: KafkaConfig,
}

impl KafkaBackupFactory {
    pub fn new(config: KafkaConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl BackupFactory for KafkaBackupFactory {
    async fn create(&self, backend: &str) -> BackendResult<Arc<dyn BackupStore>> {
        Ok(Arc::new(KafkaBackup::connect(&self.config, backend).await?))
    }
}
