//! Kafka 消费者启动

use crate::{broker::KafkaBroker, config::KafkaConfig, errors::KafkaBatchError};
use tokio::sync::watch;
use tracing::{Span, info, instrument};
use unibatch::{App, Handler, LoopState, PollLoop};

/// 按进程级配置启动命名消费者
pub async fn launch<H>(
    app: &App,
    name: &str,
    handler: H,
) -> Result<watch::Receiver<LoopState>, KafkaBatchError>
where
    H: Handler,
{
    launch_with(app, KafkaConfig::get()?, name, handler).await
}

/// 按指定配置启动命名消费者，配置无效时不会启动
#[instrument(name = "launch_consumer", skip_all, fields(consumer))]
pub async fn launch_with<H>(
    app: &App,
    config: &KafkaConfig,
    name: &str,
    handler: H,
) -> Result<watch::Receiver<LoopState>, KafkaBatchError>
where
    H: Handler,
{
    Span::current().record("consumer", name);
    let cfg = config
        .consumers
        .get(name)
        .ok_or_else(|| KafkaBatchError::NotConfigured(name.to_string()))?;
    cfg.policy()?;
    let broker = KafkaBroker::new(config, name, cfg)?;
    let poll_loop = PollLoop::new(name, cfg, broker, handler)?;
    let state = app.launch(poll_loop).await;
    info!("消费者 {name} 已启动，确认模式 {:?}", cfg.ack_mode);
    Ok(state)
}
