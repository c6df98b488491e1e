//! # **unibatch** 的 Kafka 实现
//!
//! 以 librdkafka 消费者实现 [`unibatch::BrokerClient`]，
//! 按命名配置创建消费者并交由 [`unibatch::App`] 运行。

pub mod app;
pub mod broker;
pub mod config;
pub mod errors;

pub use app::{launch, launch_with};
pub use broker::KafkaBroker;
pub use config::KafkaConfig;
pub use errors::KafkaBatchError;
