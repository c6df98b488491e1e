//! # 确认策略
//!
//! 自动确认：批次投递成功即提交，下游尚未持久化时崩溃会丢失该批次，但不会重复。
//! 手动确认：仅在处理者调用 [`Confirm::confirm`] 后提交，未确认的批次在重启后重新投递。

use crate::{
    config::AckMode,
    record::{CommitKey, RecordBatch},
};
use enum_dispatch::enum_dispatch;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// 确认策略特征
#[enum_dispatch]
pub trait AckStrategy {
    /// 确认模式
    fn mode(&self) -> AckMode;

    /// 批次全部回调成功后调用，返回需要立即提交的提交键
    fn on_batch_delivered(&self, batch: &RecordBatch) -> Option<CommitKey>;
}

/// 自动确认
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoAck;

impl AckStrategy for AutoAck {
    fn mode(&self) -> AckMode {
        AckMode::Auto
    }

    #[inline]
    fn on_batch_delivered(&self, batch: &RecordBatch) -> Option<CommitKey> {
        Some(batch.commit_key().clone())
    }
}

/// 手动确认
#[derive(Debug, Clone, Copy, Default)]
pub struct ManualAck;

impl AckStrategy for ManualAck {
    fn mode(&self) -> AckMode {
        AckMode::Manual
    }

    #[inline]
    fn on_batch_delivered(&self, _batch: &RecordBatch) -> Option<CommitKey> {
        None
    }
}

/// 构造时绑定的确认策略
#[enum_dispatch(AckStrategy)]
#[derive(Debug, Clone, Copy)]
pub enum Ack {
    /// 自动确认
    AutoAck,
    /// 手动确认
    ManualAck,
}

impl From<AckMode> for Ack {
    fn from(mode: AckMode) -> Self {
        match mode {
            AckMode::Auto => Ack::AutoAck(AutoAck),
            AckMode::Manual => Ack::ManualAck(ManualAck),
        }
    }
}

/// 手动确认句柄
///
/// 可克隆后留存，确认在下个拉取周期开始前或关闭前提交。
#[derive(Debug, Clone)]
pub struct Confirm {
    mode: AckMode,
    tx: mpsc::UnboundedSender<CommitKey>,
}

impl Confirm {
    pub(crate) fn channel(mode: AckMode) -> (Self, mpsc::UnboundedReceiver<CommitKey>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { mode, tx }, rx)
    }

    /// 确认提交键对应的消息已全部处理成功
    pub fn confirm(&self, key: CommitKey) {
        if self.mode == AckMode::Auto {
            debug!("自动确认模式，忽略手动确认：{key}");
            return;
        }
        debug!("收到手动确认：{key}");
        if let Err(e) = self.tx.send(key) {
            warn!("消费者已停止，确认 {} 未能提交", e.0);
        }
    }
}
