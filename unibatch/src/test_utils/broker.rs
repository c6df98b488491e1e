//! 确定性的内存代理，配合 tokio 暂停时钟使用

use crate::{
    config::{IsolationLevel, PollPolicy},
    domain::BrokerClient,
    errors::BatchError,
    record::{Partition, Record},
};
use ahash::AHashMap;
use bytes::Bytes;
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard},
};
use tokio::time::{Duration, Instant, sleep_until};

struct Entry {
    record: Record,
    visible_at: Instant,
    aborted: bool,
}

#[derive(Default)]
struct BrokerState {
    log: BTreeMap<Partition, Vec<Entry>>,
    committed: AHashMap<Partition, u64>,
    commit_history: Vec<(Partition, u64)>,
    poll_failures: usize,
    commit_failures: usize,
    commit_failures_from: usize,
    commit_calls: usize,
    polls: usize,
}

/// 内存代理，可在多个客户端间共享以模拟重启
#[derive(Clone, Default)]
pub struct FakeBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl FakeBroker {
    /// 构造函数
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn append(&self, partition: &Partition, size: usize, delay: Duration, aborted: bool) -> u64 {
        let mut state = self.state();
        let entries = state.log.entry(partition.clone()).or_default();
        let offset = entries.len() as u64;
        let mut visible_at = Instant::now() + delay;
        if let Some(last) = entries.last() {
            visible_at = visible_at.max(last.visible_at);
        }
        entries.push(Entry {
            record: Record::new(
                partition.clone(),
                offset,
                None,
                Bytes::from(vec![b'x'; size]),
            ),
            visible_at,
            aborted,
        });
        offset
    }

    /// 写入一条立即可见的消息，返回偏移量
    pub fn produce(&self, partition: &Partition, size: usize) -> u64 {
        self.append(partition, size, Duration::ZERO, false)
    }

    /// 写入多条立即可见的消息
    pub fn produce_many(&self, partition: &Partition, count: usize, size: usize) {
        for _ in 0..count {
            self.produce(partition, size);
        }
    }

    /// 写入一条延迟可见的消息
    pub fn produce_after(&self, partition: &Partition, size: usize, delay: Duration) -> u64 {
        self.append(partition, size, delay, false)
    }

    /// 写入一条属于已中止事务的消息
    pub fn produce_aborted(&self, partition: &Partition, size: usize) -> u64 {
        self.append(partition, size, Duration::ZERO, true)
    }

    /// 接下来 `n` 次拉取失败
    pub fn fail_polls(&self, n: usize) {
        self.state().poll_failures = n;
    }

    /// 接下来 `n` 次提交失败
    pub fn fail_commits(&self, n: usize) {
        self.state().commit_failures = n;
    }

    /// 从第 `after` 次提交之后开始，连续 `n` 次提交失败
    pub fn fail_commits_after(&self, after: usize, n: usize) {
        let mut state = self.state();
        state.commit_failures_from = after;
        state.commit_failures = n;
    }

    /// 指定分区已提交的偏移量
    pub fn committed(&self, partition: &Partition) -> Option<u64> {
        self.state().committed.get(partition).copied()
    }

    /// 按顺序记录的全部成功提交
    pub fn commit_history(&self) -> Vec<(Partition, u64)> {
        self.state().commit_history.clone()
    }

    /// 拉取次数
    pub fn polls(&self) -> usize {
        self.state().polls
    }

    /// 新的客户端，从已提交偏移量之后开始读取
    pub fn client(&self) -> FakeClient {
        let positions = self
            .state()
            .committed
            .iter()
            .map(|(p, o)| (p.clone(), o + 1))
            .collect();
        FakeClient {
            broker: self.clone(),
            positions,
        }
    }
}

/// 内存代理的客户端
pub struct FakeClient {
    broker: FakeBroker,
    positions: AHashMap<Partition, u64>,
}

struct Available {
    count: usize,
    bytes: usize,
    next_arrival: Option<Instant>,
}

impl FakeClient {
    fn available(&self, state: &BrokerState, policy: &PollPolicy, now: Instant) -> Available {
        let mut available = Available {
            count: 0,
            bytes: 0,
            next_arrival: None,
        };
        for (partition, entries) in &state.log {
            let start = self.positions.get(partition).copied().unwrap_or(0) as usize;
            for entry in entries.iter().skip(start) {
                if entry.visible_at > now {
                    available.next_arrival = Some(
                        available
                            .next_arrival
                            .map_or(entry.visible_at, |t| t.min(entry.visible_at)),
                    );
                    break;
                }
                if entry.aborted && policy.isolation_level() == IsolationLevel::ReadCommitted {
                    continue;
                }
                available.count += 1;
                available.bytes += entry.record.size_bytes();
            }
        }
        available
    }

    fn take(&mut self, state: &BrokerState, policy: &PollPolicy, now: Instant) -> Vec<Record> {
        let limit = policy.record_limit();
        let mut records = Vec::new();
        for (partition, entries) in &state.log {
            let position = self.positions.entry(partition.clone()).or_insert(0);
            for entry in entries.iter().skip(*position as usize) {
                if records.len() == limit || entry.visible_at > now {
                    break;
                }
                *position += 1;
                if entry.aborted && policy.isolation_level() == IsolationLevel::ReadCommitted {
                    continue;
                }
                records.push(entry.record.clone());
            }
        }
        records
    }
}

impl BrokerClient for FakeClient {
    async fn poll(&mut self, policy: &PollPolicy) -> Result<Vec<Record>, BatchError> {
        let broker = self.broker.clone();
        {
            let mut state = broker.state();
            state.polls += 1;
            if state.poll_failures > 0 {
                state.poll_failures -= 1;
                return Err(BatchError::PollFailed("代理不可达".to_string()));
            }
        }

        let deadline = Instant::now() + policy.max_wait();
        loop {
            let now = Instant::now();
            let wake = {
                let state = broker.state();
                let available = self.available(&state, policy, now);
                if available.count >= policy.record_limit()
                    || available.bytes >= policy.min_fetch_bytes()
                    || now >= deadline
                {
                    return Ok(self.take(&state, policy, now));
                }
                available.next_arrival.map_or(deadline, |t| t.min(deadline))
            };
            sleep_until(wake).await;
        }
    }

    async fn commit(&mut self, offsets: &[(Partition, u64)]) -> Result<(), BatchError> {
        let mut state = self.broker.state();
        state.commit_calls += 1;
        if state.commit_calls > state.commit_failures_from && state.commit_failures > 0 {
            state.commit_failures -= 1;
            return Err(BatchError::CommitFailed("代理拒绝提交".to_string()));
        }
        for (partition, offset) in offsets {
            state.committed.insert(partition.clone(), *offset);
            state.commit_history.push((partition.clone(), *offset));
        }
        Ok(())
    }

    async fn committed(&mut self) -> Result<Vec<(Partition, u64)>, BatchError> {
        Ok(self
            .broker
            .state()
            .committed
            .iter()
            .map(|(p, o)| (p.clone(), *o))
            .collect())
    }
}
