//! # **unibatch** 错误定义

use thiserror::Error;

/// **unibatch** 错误枚举
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BatchError {
    /// 拉取消息失败，传输层错误，与空拉取不同
    #[error("拉取消息失败：{0}")]
    PollFailed(String),
    /// 批次或消息处理失败
    #[error("消息处理失败：{0}")]
    ProcessingFailed(String),
    /// 提交偏移量失败
    #[error("提交偏移量失败：{0}")]
    CommitFailed(String),
    /// 配置无效
    #[error("配置无效：{0}")]
    ConfigInvalid(String),
}

impl BatchError {
    /// 是否可在下个周期重试
    pub fn is_retryable(&self) -> bool {
        matches!(self, BatchError::PollFailed(_) | BatchError::CommitFailed(_))
    }
}

impl From<&str> for BatchError {
    fn from(s: &str) -> Self {
        BatchError::ProcessingFailed(s.to_owned())
    }
}

impl From<config::ConfigError> for BatchError {
    fn from(e: config::ConfigError) -> Self {
        BatchError::ConfigInvalid(e.to_string())
    }
}

impl From<validator::ValidationErrors> for BatchError {
    fn from(e: validator::ValidationErrors) -> Self {
        BatchError::ConfigInvalid(e.to_string())
    }
}
