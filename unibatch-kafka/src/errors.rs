use thiserror::Error;
use unibatch::BatchError;

/// Kafka 实现的错误枚举
#[derive(Debug, Error)]
pub enum KafkaBatchError {
    /// librdkafka 返回的错误
    #[error("Kafka错误：{0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
    /// 引擎错误
    #[error(transparent)]
    Batch(#[from] BatchError),
    /// 未找到命名消费者配置
    #[error("消费者 '{0}' 未配置")]
    NotConfigured(String),
}

impl From<&str> for KafkaBatchError {
    fn from(s: &str) -> Self {
        KafkaBatchError::Batch(BatchError::ConfigInvalid(s.to_string()))
    }
}

impl From<config::ConfigError> for KafkaBatchError {
    fn from(e: config::ConfigError) -> Self {
        KafkaBatchError::Batch(e.into())
    }
}
