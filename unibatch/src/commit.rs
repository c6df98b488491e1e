//! # 偏移量提交

use crate::{
    domain::BrokerClient,
    errors::BatchError,
    record::{CommitKey, Partition, RecordBatch},
};
use ahash::AHashMap;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// 已提交偏移量表，各分区记录最后一条已提交消息的偏移量
#[derive(Debug, Clone, Default)]
pub struct OffsetTable {
    offsets: AHashMap<Partition, u64>,
}

impl OffsetTable {
    /// 指定分区已提交的偏移量
    pub fn get(&self, partition: &Partition) -> Option<u64> {
        self.offsets.get(partition).copied()
    }

    /// 偏移量是否超过已提交位置
    #[inline]
    pub fn is_ahead(&self, partition: &Partition, offset: u64) -> bool {
        self.get(partition).is_none_or(|committed| offset > committed)
    }

    /// 遍历分区偏移量
    pub fn iter(&self) -> impl Iterator<Item = (&Partition, u64)> {
        self.offsets.iter().map(|(p, o)| (p, *o))
    }

    /// 分区数
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    fn advance(&mut self, partition: &Partition, offset: u64) {
        self.offsets
            .entry(partition.clone())
            .and_modify(|e| *e = offset.max(*e))
            .or_insert(offset);
    }
}

/// 提交结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// 没有需要推进的分区
    Noop,
    /// 推进了若干分区
    Advanced(usize),
}

/// 提交管理者
///
/// 只推进不回退。代理确认前偏移量表保持不变，失败的偏移量留待下个周期重试。
/// 各分区只提交连续完成的前缀：处理失败或尚未确认的批次阻挡其后的偏移量。
#[derive(Debug, Default)]
pub struct CommitManager {
    table: OffsetTable,
    pending: BTreeMap<Partition, u64>,
    outstanding: Vec<(CommitKey, BTreeMap<Partition, u64>)>,
    floors: AHashMap<Partition, u64>,
}

impl CommitManager {
    /// 以代理已提交的偏移量初始化
    pub fn seed(&mut self, committed: Vec<(Partition, u64)>) {
        for (partition, offset) in committed {
            debug!("恢复分区 {partition} 已提交偏移量 {offset}");
            self.table.advance(&partition, offset);
        }
        let table = &self.table;
        self.pending
            .retain(|partition, offset| table.is_ahead(partition, *offset));
    }

    /// 登记已投递、等待手动确认的批次
    pub fn hold(&mut self, batch: &RecordBatch) {
        self.outstanding
            .push((batch.commit_key().clone(), batch.first_offsets()));
    }

    /// 核对确认的提交键，仅接受等待确认的批次键
    pub fn acknowledge(&mut self, key: &CommitKey) -> bool {
        match self.outstanding.iter().position(|(k, _)| k == key) {
            Some(i) => {
                self.outstanding.remove(i);
                true
            }
            None => false,
        }
    }

    /// 阻挡处理失败的批次，重启前各分区不会提交到其起始偏移量及之后
    pub fn block(&mut self, batch: &RecordBatch) {
        for (partition, first) in batch.first_offsets() {
            warn!("分区 {partition} 偏移量 {first} 处理失败，重启前不再越过提交");
            self.floors
                .entry(partition)
                .and_modify(|e| *e = first.min(*e))
                .or_insert(first);
        }
    }

    /// 提交提交键，仅提交超过已提交位置的分区
    pub async fn commit<B>(
        &mut self,
        broker: &mut B,
        key: &CommitKey,
    ) -> Result<CommitOutcome, BatchError>
    where
        B: BrokerClient,
    {
        for (partition, offset) in key.iter() {
            if self.table.is_ahead(partition, offset) {
                self.pending
                    .entry(partition.clone())
                    .and_modify(|e| *e = offset.max(*e))
                    .or_insert(offset);
            }
        }
        self.flush(broker).await
    }

    /// 重试先前失败的提交
    pub async fn retry<B>(&mut self, broker: &mut B) -> Result<CommitOutcome, BatchError>
    where
        B: BrokerClient,
    {
        if self.has_pending() {
            debug!("重试 {} 个分区的偏移量提交", self.pending.len());
        }
        self.flush(broker).await
    }

    fn limit(&self, partition: &Partition) -> Option<u64> {
        let held = self
            .outstanding
            .iter()
            .filter_map(|(_, firsts)| firsts.get(partition).copied());
        self.floors.get(partition).copied().into_iter().chain(held).min()
    }

    fn committable(&self) -> Vec<(Partition, u64)> {
        self.pending
            .iter()
            .filter_map(|(partition, target)| {
                let offset = match self.limit(partition) {
                    Some(first) => (*target).min(first.checked_sub(1)?),
                    None => *target,
                };
                self.table
                    .is_ahead(partition, offset)
                    .then(|| (partition.clone(), offset))
            })
            .collect()
    }

    async fn flush<B>(&mut self, broker: &mut B) -> Result<CommitOutcome, BatchError>
    where
        B: BrokerClient,
    {
        let offsets = self.committable();
        if offsets.is_empty() {
            if self.pending.is_empty() {
                debug!("无需推进的偏移量，跳过提交");
            } else {
                debug!("{} 个分区受未完成批次阻挡，暂不提交", self.pending.len());
            }
            return Ok(CommitOutcome::Noop);
        }

        match broker.commit(&offsets).await {
            Ok(()) => {
                for (partition, offset) in &offsets {
                    self.table.advance(partition, *offset);
                    debug!("分区 {partition} 提交偏移量 {offset}");
                }
                let table = &self.table;
                self.pending
                    .retain(|partition, offset| table.is_ahead(partition, *offset));
                Ok(CommitOutcome::Advanced(offsets.len()))
            }
            Err(e) => {
                warn!("提交 {} 个分区的偏移量失败，留待重试：{e}", offsets.len());
                Err(match e {
                    BatchError::CommitFailed(_) => e,
                    other => BatchError::CommitFailed(other.to_string()),
                })
            }
        }
    }

    /// 提交键是否已全部提交
    pub fn covers(&self, key: &CommitKey) -> bool {
        key.iter()
            .all(|(partition, offset)| !self.table.is_ahead(partition, offset))
    }

    /// 是否存在可提交的待定偏移量
    pub fn has_pending(&self) -> bool {
        !self.committable().is_empty()
    }

    /// 已提交偏移量表
    pub fn table(&self) -> &OffsetTable {
        &self.table
    }
}
