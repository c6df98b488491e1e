//! # 消息与批次

use bytes::Bytes;
use std::{collections::BTreeMap, fmt, sync::Arc};

/// 主题分区
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Partition {
    /// 主题
    pub topic: Arc<str>,
    /// 分区号
    pub id: i32,
}

impl Partition {
    /// 构造函数
    pub fn new(topic: impl Into<Arc<str>>, id: i32) -> Self {
        Self {
            topic: topic.into(),
            id,
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.topic, self.id)
    }
}

/// 提交键
///
/// 不透明的位置标识，可解析为一组分区偏移量，每个分区只保留最大偏移量。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitKey {
    offsets: BTreeMap<Partition, u64>,
}

impl CommitKey {
    /// 单个分区偏移量构成的提交键
    pub fn single(partition: Partition, offset: u64) -> Self {
        let mut offsets = BTreeMap::new();
        offsets.insert(partition, offset);
        Self { offsets }
    }

    /// 合并另一提交键，按分区取最大偏移量
    pub fn merge(&mut self, other: &CommitKey) {
        for (partition, offset) in &other.offsets {
            self.advance(partition, *offset);
        }
    }

    pub(crate) fn advance(&mut self, partition: &Partition, offset: u64) {
        self.offsets
            .entry(partition.clone())
            .and_modify(|e| *e = offset.max(*e))
            .or_insert(offset);
    }

    /// 指定分区的偏移量
    pub fn offset(&self, partition: &Partition) -> Option<u64> {
        self.offsets.get(partition).copied()
    }

    /// 遍历分区偏移量
    pub fn iter(&self) -> impl Iterator<Item = (&Partition, u64)> {
        self.offsets.iter().map(|(p, o)| (p, *o))
    }

    /// 涉及的分区数
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }
}

impl fmt::Display for CommitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, (partition, offset)) in self.offsets.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{partition}@{offset}")?;
        }
        f.write_str("]")
    }
}

/// 消息记录，创建后不可变
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// 所属分区
    pub partition: Partition,
    /// 分区内偏移量
    pub offset: u64,
    /// 消息键
    pub key: Option<Bytes>,
    /// 消息体
    pub payload: Bytes,
}

impl Record {
    /// 构造函数
    pub fn new(partition: Partition, offset: u64, key: Option<Bytes>, payload: Bytes) -> Self {
        Self {
            partition,
            offset,
            key,
            payload,
        }
    }

    /// 消息字节数，计入键和消息体
    #[inline]
    pub fn size_bytes(&self) -> usize {
        self.key.as_ref().map_or(0, Bytes::len) + self.payload.len()
    }

    /// 本消息位置对应的提交键
    pub fn commit_key(&self) -> CommitKey {
        CommitKey::single(self.partition.clone(), self.offset)
    }
}

/// 消息批次，至少包含一条消息
#[derive(Debug, Clone)]
pub struct RecordBatch {
    records: Vec<Record>,
    commit_key: CommitKey,
    size_bytes: usize,
}

impl RecordBatch {
    /// 由拉取结果构造批次，空结果返回 `None`
    pub fn new(records: Vec<Record>) -> Option<Self> {
        if records.is_empty() {
            return None;
        }
        let mut commit_key = CommitKey::default();
        let mut size_bytes = 0;
        for record in &records {
            commit_key.advance(&record.partition, record.offset);
            size_bytes += record.size_bytes();
        }
        Some(Self {
            records,
            commit_key,
            size_bytes,
        })
    }

    /// 消息数
    #[inline]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// 批次永不为空
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// 批次字节数
    #[inline]
    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    /// 按投递顺序排列的消息
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// 按投递顺序遍历消息
    pub fn iter(&self) -> std::slice::Iter<'_, Record> {
        self.records.iter()
    }

    /// 批次提交键，各分区取本批次内的最大偏移量
    pub fn commit_key(&self) -> &CommitKey {
        &self.commit_key
    }

    /// 各分区本批次内的最小偏移量
    pub fn first_offsets(&self) -> BTreeMap<Partition, u64> {
        let mut firsts = BTreeMap::new();
        for record in &self.records {
            firsts
                .entry(record.partition.clone())
                .and_modify(|e: &mut u64| *e = record.offset.min(*e))
                .or_insert(record.offset);
        }
        firsts
    }
}

impl<'a> IntoIterator for &'a RecordBatch {
    type Item = &'a Record;
    type IntoIter = std::slice::Iter<'a, Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}
