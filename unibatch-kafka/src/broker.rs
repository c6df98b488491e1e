//! Kafka 消息代理客户端

use crate::{config::KafkaConfig, errors::KafkaBatchError};
use bytes::Bytes;
use rdkafka::{
    Message, Offset, TopicPartitionList,
    consumer::{CommitMode, Consumer, StreamConsumer},
    message::BorrowedMessage,
};
use std::sync::Arc;
use tokio::{
    task,
    time::{Duration, Instant, timeout_at},
};
use tracing::{debug, info, warn};
use unibatch::{BatchError, BrokerClient, ConsumerConfig, Partition, PollPolicy, Record};

/// 基于 `StreamConsumer` 的消息代理客户端
///
/// 数量、字节、等待时间三项阈值在客户端判定；librdkafka 的 `fetch.min.bytes`
/// 与 `fetch.wait.max.ms` 仅影响底层预取。
pub struct KafkaBroker {
    consumer: Arc<StreamConsumer>,
    timeout: Duration,
}

impl KafkaBroker {
    /// 创建消费者并订阅主题
    pub fn new(
        config: &KafkaConfig,
        name: &str,
        cfg: &ConsumerConfig,
    ) -> Result<Self, KafkaBatchError> {
        let consumer: StreamConsumer = config.client_config(name, cfg).create()?;
        let topics: Vec<&str> = cfg.topics.iter().map(String::as_str).collect();
        consumer.subscribe(&topics)?;
        info!("消费者 {name} 成功订阅 {topics:?}");
        Ok(Self {
            consumer: Arc::new(consumer),
            timeout: config.timeout,
        })
    }
}

fn to_record(msg: &BorrowedMessage<'_>) -> Option<Record> {
    let offset = u64::try_from(msg.offset()).ok()?;
    Some(Record::new(
        Partition::new(msg.topic(), msg.partition()),
        offset,
        msg.key().map(Bytes::copy_from_slice),
        msg.payload().map(Bytes::copy_from_slice).unwrap_or_default(),
    ))
}

impl BrokerClient for KafkaBroker {
    async fn poll(&mut self, policy: &PollPolicy) -> Result<Vec<Record>, BatchError> {
        let limit = policy.record_limit();
        let deadline = Instant::now() + policy.max_wait();
        let mut records = Vec::with_capacity(limit);
        let mut bytes = 0;

        while records.len() < limit {
            // 达到字节阈值后只取已就绪的消息
            let until = if bytes >= policy.min_fetch_bytes() {
                Instant::now()
            } else {
                deadline
            };
            match timeout_at(until, self.consumer.recv()).await {
                Ok(Ok(msg)) => match to_record(&msg) {
                    Some(record) => {
                        bytes += record.size_bytes();
                        records.push(record);
                    }
                    None => warn!("丢弃无效偏移量的消息：{}|{}", msg.topic(), msg.partition()),
                },
                Ok(Err(e)) if records.is_empty() => {
                    return Err(BatchError::PollFailed(e.to_string()));
                }
                Ok(Err(e)) => {
                    warn!("拉取中断，先交付已取得的 {} 条消息：{e}", records.len());
                    break;
                }
                Err(_) => break,
            }
        }

        debug!("拉取 {} 条消息，共 {bytes} 字节", records.len());
        Ok(records)
    }

    async fn commit(&mut self, offsets: &[(Partition, u64)]) -> Result<(), BatchError> {
        let mut tpl = TopicPartitionList::with_capacity(offsets.len());
        for (partition, offset) in offsets {
            let next = i64::try_from(offset + 1)
                .map_err(|e| BatchError::CommitFailed(format!("{partition}@{offset}：{e}")))?;
            tpl.add_partition_offset(&partition.topic, partition.id, Offset::Offset(next))
                .map_err(|e| BatchError::CommitFailed(e.to_string()))?;
        }

        let consumer = Arc::clone(&self.consumer);
        task::spawn_blocking(move || consumer.commit(&tpl, CommitMode::Sync))
            .await
            .map_err(|e| BatchError::CommitFailed(e.to_string()))?
            .map_err(|e| BatchError::CommitFailed(e.to_string()))
    }

    async fn committed(&mut self) -> Result<Vec<(Partition, u64)>, BatchError> {
        let consumer = Arc::clone(&self.consumer);
        let timeout = self.timeout;
        let tpl = task::spawn_blocking(move || consumer.committed(timeout))
            .await
            .map_err(|e| BatchError::PollFailed(e.to_string()))?
            .map_err(|e| BatchError::PollFailed(e.to_string()))?;

        Ok(tpl
            .elements()
            .iter()
            .filter_map(|e| match e.offset() {
                Offset::Offset(next) if next > 0 => Some((
                    Partition::new(e.topic(), e.partition()),
                    (next - 1) as u64,
                )),
                _ => None,
            })
            .collect())
    }
}
