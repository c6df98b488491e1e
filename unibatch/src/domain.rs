//! # **unibatch** 特征

use crate::{
    ack::Confirm,
    config::PollPolicy,
    errors::BatchError,
    record::{CommitKey, Partition, Record},
};
use std::future::Future;

/// 消息代理客户端特征
///
/// 消息代理的网络协议与存储对引擎不透明，引擎只依赖拉取与提交两个契约。
pub trait BrokerClient: Send + 'static {
    /// 拉取消息
    ///
    /// 至多返回 `record_limit` 条消息。若不能立即满足数量上限，则等待至累计
    /// `min_fetch_bytes` 字节或 `max_wait` 超时，返回当时可用的消息，可能为空。
    /// 传输层错误返回 [`BatchError::PollFailed`]，不同于空结果。
    fn poll(
        &mut self,
        policy: &PollPolicy,
    ) -> impl Future<Output = Result<Vec<Record>, BatchError>> + Send;

    /// 提交分区偏移量，偏移量为已消费的最后一条消息
    ///
    /// 可重复提交，不保证多分区原子性。
    fn commit(
        &mut self,
        offsets: &[(Partition, u64)],
    ) -> impl Future<Output = Result<(), BatchError>> + Send;

    /// 获取已提交的分区偏移量，用于重启后恢复
    fn committed(
        &mut self,
    ) -> impl Future<Output = Result<Vec<(Partition, u64)>, BatchError>> + Send;
}

/// 处理者特征
///
/// 由嵌入应用提供。任一方法返回错误即视为批次处理失败，该批次不会被提交。
pub trait Handler: Send + 'static {
    /// 批次开始
    fn on_batch_start(
        &mut self,
        size: usize,
    ) -> impl Future<Output = Result<(), BatchError>> + Send {
        let _ = size;
        async { Ok(()) }
    }

    /// 处理单条消息
    fn on_item(&mut self, record: &Record) -> impl Future<Output = Result<(), BatchError>> + Send;

    /// 批次结束
    ///
    /// 手动确认模式下，处理者在确认全部消息处理成功后调用 `confirm.confirm(key)`。
    fn on_batch_end(
        &mut self,
        key: &CommitKey,
        confirm: &Confirm,
    ) -> impl Future<Output = Result<(), BatchError>> + Send {
        let _ = (key, confirm);
        async { Ok(()) }
    }
}
