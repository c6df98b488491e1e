//! 记录全部回调的处理者

use crate::{
    ack::Confirm,
    domain::Handler,
    errors::BatchError,
    record::{CommitKey, Partition, Record},
};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::Instant;

/// 回调事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    /// 批次开始
    Start(usize),
    /// 单条消息
    Item(Partition, u64),
    /// 批次结束
    End(CommitKey),
}

#[derive(Default)]
struct Journal {
    calls: Vec<(Instant, Call)>,
    fail_offsets: Vec<(Partition, u64)>,
}

/// 记录回调的处理者，可克隆后在测试中观察
#[derive(Clone, Default)]
pub struct RecordingHandler {
    journal: Arc<Mutex<Journal>>,
    confirm: bool,
}

impl RecordingHandler {
    /// 不确认的处理者
    pub fn new() -> Self {
        Self::default()
    }

    /// 批次结束时确认的处理者
    pub fn confirming() -> Self {
        Self {
            confirm: true,
            ..Default::default()
        }
    }

    fn journal(&self) -> MutexGuard<'_, Journal> {
        match self.journal.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// 处理到指定消息时失败，仅失败一次
    pub fn fail_on(&self, partition: &Partition, offset: u64) {
        self.journal().fail_offsets.push((partition.clone(), offset));
    }

    /// 全部回调
    pub fn calls(&self) -> Vec<Call> {
        self.journal().calls.iter().map(|(_, c)| c.clone()).collect()
    }

    /// 带时间戳的全部回调
    pub fn timed_calls(&self) -> Vec<(Instant, Call)> {
        self.journal().calls.clone()
    }

    /// 各批次的消息数
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.journal()
            .calls
            .iter()
            .filter_map(|(_, c)| match c {
                Call::Start(n) => Some(*n),
                _ => None,
            })
            .collect()
    }

    /// 收到的消息位置
    pub fn items(&self) -> Vec<(Partition, u64)> {
        self.journal()
            .calls
            .iter()
            .filter_map(|(_, c)| match c {
                Call::Item(p, o) => Some((p.clone(), *o)),
                _ => None,
            })
            .collect()
    }
}

impl Handler for RecordingHandler {
    async fn on_batch_start(&mut self, size: usize) -> Result<(), BatchError> {
        self.journal().calls.push((Instant::now(), Call::Start(size)));
        Ok(())
    }

    async fn on_item(&mut self, record: &Record) -> Result<(), BatchError> {
        let mut journal = self.journal();
        let target = (record.partition.clone(), record.offset);
        if let Some(i) = journal.fail_offsets.iter().position(|f| f == &target) {
            journal.fail_offsets.remove(i);
            return Err(BatchError::ProcessingFailed(format!(
                "消息 {}@{} 处理失败",
                record.partition, record.offset
            )));
        }
        journal
            .calls
            .push((Instant::now(), Call::Item(target.0, target.1)));
        Ok(())
    }

    async fn on_batch_end(&mut self, key: &CommitKey, confirm: &Confirm) -> Result<(), BatchError> {
        self.journal().calls.push((Instant::now(), Call::End(key.clone())));
        if self.confirm {
            confirm.confirm(key.clone());
        }
        Ok(())
    }
}
