//! # 批次累积
//!
//! 数量上限、最少字节、最长等待三项阈值由代理端的拉取执行，这里只对拉取结果做筛选。

use crate::{
    config::PollPolicy,
    domain::BrokerClient,
    errors::BatchError,
    record::{Partition, Record, RecordBatch},
};
use ahash::AHashMap;
use std::{collections::VecDeque, fmt};
use tokio::time::Instant;
use tracing::{debug, warn};

/// 批次成形原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// 触及数量上限
    Count,
    /// 触及最少字节
    Bytes,
    /// 触及等待超时
    Timeout,
    /// 无需等待，立即返回
    Immediate,
}

impl fmt::Display for FlushReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            FlushReason::Count => "触及数量阈值",
            FlushReason::Bytes => "触及字节阈值",
            FlushReason::Timeout => "触及等待超时",
            FlushReason::Immediate => "立即返回",
        };
        f.write_str(reason)
    }
}

/// 累积结果
#[derive(Debug)]
pub enum Accumulated {
    /// 无消息，不得进入分发
    Empty,
    /// 可分发的批次
    Ready(RecordBatch, FlushReason),
}

/// 批次累积者
#[derive(Debug, Default)]
pub struct BatchAccumulator {
    last_seen: AHashMap<Partition, u64>,
    backlog: VecDeque<Record>,
}

impl BatchAccumulator {
    /// 执行一次拉取并判定是否构成批次
    pub async fn accumulate<B>(
        &mut self,
        broker: &mut B,
        policy: &PollPolicy,
    ) -> Result<Accumulated, BatchError>
    where
        B: BrokerClient,
    {
        let limit = policy.record_limit();
        if !self.backlog.is_empty() {
            let take = self.backlog.len().min(limit);
            let records: Vec<Record> = self.backlog.drain(..take).collect();
            debug!("投递积压的 {take} 条消息，剩余 {} 条", self.backlog.len());
            let reason = if take == limit {
                FlushReason::Count
            } else {
                FlushReason::Immediate
            };
            return Ok(Self::emit(records, reason));
        }

        let started = Instant::now();
        let mut records = broker.poll(policy).await?;

        let before = records.len();
        records.retain(|record| self.observe(record));
        if records.len() < before {
            warn!("丢弃 {} 条偏移量未递增的消息", before - records.len());
        }

        if records.len() > limit {
            warn!("拉取到 {} 条消息，超过上限 {limit}，超出部分留待下批", records.len());
            self.backlog.extend(records.drain(limit..));
        }

        let reason = if records.len() == limit {
            FlushReason::Count
        } else if policy.is_immediate() {
            FlushReason::Immediate
        } else if policy.min_fetch_bytes() > 0
            && records.iter().map(Record::size_bytes).sum::<usize>() >= policy.min_fetch_bytes()
        {
            FlushReason::Bytes
        } else {
            FlushReason::Timeout
        };
        debug!(
            "拉取返回 {} 条消息，耗时 {:?}",
            records.len(),
            started.elapsed()
        );
        Ok(Self::emit(records, reason))
    }

    fn observe(&mut self, record: &Record) -> bool {
        match self.last_seen.get_mut(&record.partition) {
            Some(last) if record.offset <= *last => false,
            Some(last) => {
                *last = record.offset;
                true
            }
            None => {
                self.last_seen.insert(record.partition.clone(), record.offset);
                true
            }
        }
    }

    fn emit(records: Vec<Record>, reason: FlushReason) -> Accumulated {
        match RecordBatch::new(records) {
            Some(batch) => {
                debug!("{reason}，形成 {} 条消息的批次", batch.len());
                Accumulated::Ready(batch, reason)
            }
            None => Accumulated::Empty,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IsolationLevel;
    use bytes::Bytes;
    use std::time::Duration;

    struct ScriptedBroker {
        responses: VecDeque<Result<Vec<Record>, BatchError>>,
        polls: usize,
    }

    impl ScriptedBroker {
        fn new(responses: Vec<Result<Vec<Record>, BatchError>>) -> Self {
            Self {
                responses: responses.into(),
                polls: 0,
            }
        }
    }

    impl BrokerClient for ScriptedBroker {
        async fn poll(&mut self, _policy: &PollPolicy) -> Result<Vec<Record>, BatchError> {
            self.polls += 1;
            self.responses.pop_front().unwrap_or(Ok(Vec::new()))
        }

        async fn commit(&mut self, _offsets: &[(Partition, u64)]) -> Result<(), BatchError> {
            Ok(())
        }

        async fn committed(&mut self) -> Result<Vec<(Partition, u64)>, BatchError> {
            Ok(Vec::new())
        }
    }

    fn records(partition: i32, offsets: std::ops::Range<u64>, size: usize) -> Vec<Record> {
        offsets
            .map(|o| {
                Record::new(
                    Partition::new("note", partition),
                    o,
                    None,
                    Bytes::from(vec![0u8; size]),
                )
            })
            .collect()
    }

    fn policy(limit: usize, min_bytes: usize, wait_ms: u64) -> PollPolicy {
        PollPolicy::new(
            limit,
            min_bytes,
            Duration::from_millis(wait_ms),
            IsolationLevel::ReadCommitted,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn empty_poll_is_empty() {
        let mut broker = ScriptedBroker::new(vec![Ok(Vec::new())]);
        let mut acc = BatchAccumulator::default();

        let result = acc.accumulate(&mut broker, &policy(20, 1, 100)).await.unwrap();

        assert!(matches!(result, Accumulated::Empty));
    }

    #[tokio::test]
    async fn full_poll_is_count_reason() {
        let mut broker = ScriptedBroker::new(vec![Ok(records(0, 0..20, 10))]);
        let mut acc = BatchAccumulator::default();

        let result = acc.accumulate(&mut broker, &policy(20, 1, 100)).await.unwrap();

        match result {
            Accumulated::Ready(batch, reason) => {
                assert_eq!(batch.len(), 20);
                assert_eq!(reason, FlushReason::Count);
            }
            Accumulated::Empty => panic!("应形成批次"),
        }
    }

    #[tokio::test]
    async fn single_record_below_min_bytes_is_emittable() {
        let mut broker = ScriptedBroker::new(vec![Ok(records(0, 0..1, 10))]);
        let mut acc = BatchAccumulator::default();

        let result = acc
            .accumulate(&mut broker, &policy(20, 10 * 1024, 100))
            .await
            .unwrap();

        match result {
            Accumulated::Ready(batch, reason) => {
                assert_eq!(batch.len(), 1);
                assert_eq!(reason, FlushReason::Timeout);
            }
            Accumulated::Empty => panic!("应形成批次"),
        }
    }

    #[tokio::test]
    async fn bytes_threshold_reason() {
        let mut broker = ScriptedBroker::new(vec![Ok(records(0, 0..3, 5 * 1024))]);
        let mut acc = BatchAccumulator::default();

        let result = acc
            .accumulate(&mut broker, &policy(20, 10 * 1024, 10_000))
            .await
            .unwrap();

        assert!(matches!(result, Accumulated::Ready(_, FlushReason::Bytes)));
    }

    #[tokio::test]
    async fn overflow_is_kept_for_next_cycle() {
        let mut broker = ScriptedBroker::new(vec![Ok(records(0, 0..25, 10))]);
        let mut acc = BatchAccumulator::default();
        let policy = policy(20, 1, 100);

        let first = acc.accumulate(&mut broker, &policy).await.unwrap();
        let second = acc.accumulate(&mut broker, &policy).await.unwrap();

        match (first, second) {
            (Accumulated::Ready(a, _), Accumulated::Ready(b, _)) => {
                assert_eq!(a.len(), 20);
                assert_eq!(b.len(), 5);
                assert_eq!(b.records()[0].offset, 20);
            }
            _ => panic!("应形成两个批次"),
        }
        assert_eq!(broker.polls, 1);
    }

    #[tokio::test]
    async fn stale_offsets_are_dropped() {
        let mut broker = ScriptedBroker::new(vec![
            Ok(records(0, 0..5, 10)),
            Ok(records(0, 3..8, 10)),
        ]);
        let mut acc = BatchAccumulator::default();
        let policy = policy(20, 1, 100);

        let _ = acc.accumulate(&mut broker, &policy).await.unwrap();
        let second = acc.accumulate(&mut broker, &policy).await.unwrap();

        match second {
            Accumulated::Ready(batch, _) => {
                let offsets: Vec<u64> = batch.iter().map(|r| r.offset).collect();
                assert_eq!(offsets, vec![5, 6, 7]);
            }
            Accumulated::Empty => panic!("应形成批次"),
        }
    }

    #[tokio::test]
    async fn poll_failure_propagates() {
        let mut broker =
            ScriptedBroker::new(vec![Err(BatchError::PollFailed("timeout".to_string()))]);
        let mut acc = BatchAccumulator::default();

        let result = acc.accumulate(&mut broker, &policy(20, 1, 100)).await;

        assert!(matches!(result, Err(BatchError::PollFailed(_))));
    }
}
