//! # **unibatch** 批量消费引擎
//!
//! 从分区日志型消息代理持续拉取消息，按数量、字节、等待时间三项阈值成批，
//! 整批投递给处理者，并按自动或手动确认模式提交消费偏移量。
//!
//! 控制流：拉取循环 → 代理拉取（批次累积策略）→ 空则继续拉取 →
//! 分发（批次与消息回调）→ 确认策略决定提交时机 → 提交管理者 → 代理提交。

#![warn(missing_docs)]

pub mod accumulator;
pub mod ack;
pub mod app;
pub mod commit;
pub mod config;
pub mod dispatcher;
pub mod domain;
pub mod errors;
pub mod poller;
pub mod record;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use ack::{Ack, AckStrategy, AutoAck, Confirm, ManualAck};
pub use app::App;
pub use config::{AckMode, ConsumerConfig, IsolationLevel, PollPolicy};
pub use domain::{BrokerClient, Handler};
pub use errors::BatchError;
pub use poller::{Cycle, LoopState, PollLoop};
pub use record::{CommitKey, Partition, Record, RecordBatch};
