//! # 拉取循环
//!
//! 拉取、分发、提交严格串行：上一批次分发返回前，不会开始下一批次。

use crate::{
    accumulator::{Accumulated, BatchAccumulator},
    ack::{Ack, AckStrategy, Confirm},
    commit::{CommitManager, CommitOutcome},
    config::{AckMode, Backoff, ConsumerConfig, PollPolicy},
    dispatcher::Dispatcher,
    domain::{BrokerClient, Handler},
    errors::BatchError,
    record::CommitKey,
};
use std::{fmt, sync::Arc};
use tokio::{
    sync::{Notify, mpsc, watch},
    time::sleep,
};
use tracing::{Span, debug, error, info, instrument, warn};

/// 拉取循环状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// 尚未启动
    Idle,
    /// 等待代理返回
    Polling,
    /// 空拉取，不唤醒处理者
    Empty,
    /// 批次已成形
    BatchReady,
    /// 分发中
    Dispatching,
    /// 批次已提交
    Committed,
    /// 批次未提交
    Uncommitted,
    /// 已停止
    Stopped,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// 单个周期的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cycle {
    /// 空拉取
    Empty,
    /// 批次已分发并提交
    Committed(usize),
    /// 批次已分发，尚未提交
    Uncommitted(usize),
}

/// 拉取循环
pub struct PollLoop<B, H>
where
    B: BrokerClient,
    H: Handler,
{
    name: String,
    policy: PollPolicy,
    backoff: Backoff,
    broker: B,
    handler: H,
    accumulator: BatchAccumulator,
    dispatcher: Dispatcher,
    commits: CommitManager,
    confirm_rx: mpsc::UnboundedReceiver<CommitKey>,
    state_tx: watch::Sender<LoopState>,
}

impl<B, H> PollLoop<B, H>
where
    B: BrokerClient,
    H: Handler,
{
    /// 构造函数，配置无效时消费者不会启动
    pub fn new(
        name: impl Into<String>,
        cfg: &ConsumerConfig,
        broker: B,
        handler: H,
    ) -> Result<Self, BatchError> {
        let policy = cfg.policy()?;
        let (confirm, confirm_rx) = Confirm::channel(cfg.ack_mode);
        let (state_tx, _) = watch::channel(LoopState::Idle);
        Ok(Self {
            name: name.into(),
            policy,
            backoff: cfg.backoff(),
            broker,
            handler,
            accumulator: BatchAccumulator::default(),
            dispatcher: Dispatcher::new(Ack::from(cfg.ack_mode), confirm),
            commits: CommitManager::default(),
            confirm_rx,
            state_tx,
        })
    }

    /// 消费者名称
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 确认模式
    pub fn ack_mode(&self) -> AckMode {
        self.dispatcher.ack().mode()
    }

    /// 订阅状态变化
    pub fn subscribe(&self) -> watch::Receiver<LoopState> {
        self.state_tx.subscribe()
    }

    /// 当前状态
    pub fn state(&self) -> LoopState {
        *self.state_tx.borrow()
    }

    /// 提交管理者
    pub fn commits(&self) -> &CommitManager {
        &self.commits
    }

    fn transit(&self, state: LoopState) {
        let prev = self.state_tx.send_replace(state);
        if prev != state {
            debug!("状态 {prev} -> {state}");
        }
    }

    /// 以代理已提交的偏移量恢复
    pub async fn resume(&mut self) -> Result<(), BatchError> {
        let committed = self.broker.committed().await?;
        info!("恢复 {} 个分区的已提交偏移量", committed.len());
        self.commits.seed(committed);
        Ok(())
    }

    /// 执行一个完整周期：结算确认、拉取、分发、提交
    pub async fn run_once(&mut self) -> Result<Cycle, BatchError> {
        self.settle().await;
        self.transit(LoopState::Polling);
        let accumulated = self
            .accumulator
            .accumulate(&mut self.broker, &self.policy)
            .await?;
        self.process(accumulated).await
    }

    async fn process(&mut self, accumulated: Accumulated) -> Result<Cycle, BatchError> {
        let (batch, reason) = match accumulated {
            Accumulated::Empty => {
                self.transit(LoopState::Empty);
                return Ok(Cycle::Empty);
            }
            Accumulated::Ready(batch, reason) => (batch, reason),
        };

        self.transit(LoopState::BatchReady);
        let size = batch.len();
        self.transit(LoopState::Dispatching);
        match self
            .dispatcher
            .dispatch(&batch, reason, &mut self.handler)
            .await
        {
            Ok(Some(key)) => {
                if let Err(e) = self.commits.commit(&mut self.broker, &key).await {
                    self.transit(LoopState::Uncommitted);
                    return Err(e);
                }
                Ok(self.conclude(&key, size))
            }
            Ok(None) => {
                self.commits.hold(&batch);
                self.drain_confirms().await;
                Ok(self.conclude(batch.commit_key(), size))
            }
            Err(e) => {
                self.commits.block(&batch);
                self.drain_confirms().await;
                self.transit(LoopState::Uncommitted);
                Err(e)
            }
        }
    }

    fn conclude(&self, key: &CommitKey, size: usize) -> Cycle {
        if self.commits.covers(key) {
            self.transit(LoopState::Committed);
            Cycle::Committed(size)
        } else {
            self.transit(LoopState::Uncommitted);
            Cycle::Uncommitted(size)
        }
    }

    async fn drain_confirms(&mut self) {
        let mut key: Option<CommitKey> = None;
        while let Ok(confirmed) = self.confirm_rx.try_recv() {
            if !self.commits.acknowledge(&confirmed) {
                warn!("拒绝未知提交键的确认：{confirmed}");
                continue;
            }
            match key.as_mut() {
                Some(k) => k.merge(&confirmed),
                None => key = Some(confirmed),
            }
        }
        let result = match key {
            Some(key) => self.commits.commit(&mut self.broker, &key).await,
            None => self.commits.retry(&mut self.broker).await,
        };
        match result {
            Ok(CommitOutcome::Advanced(n)) => debug!("推进 {n} 个分区的偏移量"),
            Ok(CommitOutcome::Noop) => {}
            Err(e) => warn!("{e}，下个周期重试"),
        }
    }

    async fn settle(&mut self) {
        if self.commits.has_pending() || !self.confirm_rx.is_empty() {
            self.drain_confirms().await;
        }
    }

    /// 持续运行直至收到关闭信号
    ///
    /// 关闭信号会打断进行中的拉取，丢弃未成批的消息，重启后从已提交偏移量继续；
    /// 分发中的批次则先完成分发与提交判定再退出。
    #[instrument(name = "poll_loop", skip_all, fields(consumer))]
    pub async fn run(mut self, ready: Arc<Notify>, notify: Arc<Notify>) {
        Span::current().record("consumer", self.name.as_str());
        let notified = notify.notified();
        tokio::pin!(notified);
        ready.notify_one();
        info!("启动拉取循环，确认模式 {:?}", self.ack_mode());

        loop {
            let result = tokio::select! {
                biased;
                _ = &mut notified => {
                    info!("收到关闭信号，开始优雅退出");
                    self.transit(LoopState::Stopped);
                    return;
                }
                result = self.resume() => result,
            };
            match result {
                Ok(()) => break,
                Err(e) => {
                    let delay = self.backoff.next_delay();
                    warn!("恢复已提交偏移量失败，{delay:?} 后重试：{e}");
                    tokio::select! {
                        biased;
                        _ = &mut notified => {
                            info!("收到关闭信号，开始优雅退出");
                            self.transit(LoopState::Stopped);
                            return;
                        }
                        _ = sleep(delay) => {}
                    }
                }
            }
        }
        self.backoff.reset();

        loop {
            self.settle().await;
            self.transit(LoopState::Polling);
            let accumulated = tokio::select! {
                biased;
                _ = &mut notified => {
                    info!("收到关闭信号，开始优雅退出");
                    break;
                }
                accumulated = self.accumulator.accumulate(&mut self.broker, &self.policy) => {
                    accumulated
                }
            };

            match accumulated {
                Ok(accumulated) => {
                    self.backoff.reset();
                    match self.process(accumulated).await {
                        Ok(Cycle::Empty) => debug!("空拉取"),
                        Ok(Cycle::Committed(n)) => debug!("批次 {n} 条消息已提交"),
                        Ok(Cycle::Uncommitted(n)) => debug!("批次 {n} 条消息等待确认"),
                        Err(e) if e.is_retryable() => warn!("{e}，下个周期重试"),
                        Err(e) => error!("{e}"),
                    }
                }
                Err(e) => {
                    let delay = self.backoff.next_delay();
                    warn!("{e}，{delay:?} 后重试");
                    tokio::select! {
                        biased;
                        _ = &mut notified => {
                            info!("收到关闭信号，开始优雅退出");
                            break;
                        }
                        _ = sleep(delay) => {}
                    }
                }
            }
        }

        if !self.confirm_rx.is_empty() || self.commits.has_pending() {
            info!("优雅退出，提交已确认的偏移量");
            self.drain_confirms().await;
        }
        self.transit(LoopState::Stopped);
        info!("拉取循环已停止");
    }
}
