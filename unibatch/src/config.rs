//! # **unibatch** 配置

use crate::errors::BatchError;
use config::{Config, Environment, File};
use serde::{Deserialize, de::DeserializeOwned};
use std::{collections::HashMap, path::PathBuf, time::Duration};
use validator::Validate;

/// 命名配置集合
#[derive(Debug, Clone)]
pub struct NamedConfig<T> {
    configs: HashMap<String, T>,
}

impl<T> NamedConfig<T>
where
    T: DeserializeOwned + Validate + Clone + Send + Sync + 'static,
{
    /// 获取命名配置
    pub fn get(&self, name: &str) -> Option<&T> {
        self.configs.get(name)
    }

    /// 遍历所有命名配置
    pub fn iter(&self) -> impl Iterator<Item = (&String, &T)> {
        self.configs.iter()
    }
}

/// 构建分层配置：默认文件、环境文件、环境变量
pub fn build_config(crate_dir: PathBuf) -> Result<Config, BatchError> {
    let config_root = std::env::var("UNIBATCH_CONFIG_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| crate_dir.join("config"));
    let env = std::env::var("UNIBATCH_ENV").unwrap_or_else(|_| "dev".to_string());
    let config = Config::builder()
        .add_source(File::from(config_root.join("default")).required(false))
        .add_source(File::from(config_root.join(env)).required(false))
        .add_source(
            Environment::with_prefix("UNIBATCH")
                .separator("__")
                .list_separator(","),
        )
        .build()?;
    Ok(config)
}

/// 加载并校验命名配置
pub fn load_named_config<T>(config: &Config, section: &str) -> Result<NamedConfig<T>, BatchError>
where
    T: DeserializeOwned + Validate + Clone,
{
    let configs = match config.get::<HashMap<String, T>>(section) {
        Ok(c) => c,
        Err(config::ConfigError::NotFound(_)) => HashMap::new(),
        Err(e) => return Err(e.into()),
    };

    for (key, cfg) in &configs {
        cfg.validate()
            .map_err(|e| BatchError::ConfigInvalid(format!("{section}.{key}：{e}")))?;
    }

    Ok(NamedConfig { configs })
}

/// 事务隔离级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    /// 仅可见已提交事务的消息
    #[default]
    ReadCommitted,
    /// 可见未提交及已中止事务的消息
    ReadUncommitted,
}

impl IsolationLevel {
    /// 对应的 librdkafka 取值
    pub fn as_str(&self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "read_committed",
            IsolationLevel::ReadUncommitted => "read_uncommitted",
        }
    }
}

/// 确认模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    /// 批次投递成功后立即提交
    #[default]
    Auto,
    /// 处理者显式确认后提交
    Manual,
}

/// 拉取策略，消费者生命周期内不可变
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    record_limit: usize,
    min_fetch_bytes: usize,
    max_wait: Duration,
    isolation_level: IsolationLevel,
}

impl PollPolicy {
    /// 构造函数，`record_limit` 必须大于零
    pub fn new(
        record_limit: usize,
        min_fetch_bytes: usize,
        max_wait: Duration,
        isolation_level: IsolationLevel,
    ) -> Result<Self, BatchError> {
        if record_limit == 0 {
            return Err(BatchError::ConfigInvalid("record_limit 必须大于 0".to_string()));
        }
        Ok(Self {
            record_limit,
            min_fetch_bytes,
            max_wait,
            isolation_level,
        })
    }

    /// 单批次最大消息数
    #[inline]
    pub fn record_limit(&self) -> usize {
        self.record_limit
    }

    /// 最少拉取字节数
    #[inline]
    pub fn min_fetch_bytes(&self) -> usize {
        self.min_fetch_bytes
    }

    /// 最长等待时间
    #[inline]
    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }

    /// 事务隔离级别
    #[inline]
    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    /// 是否立即返回，不等待
    #[inline]
    pub fn is_immediate(&self) -> bool {
        self.min_fetch_bytes == 0 && self.max_wait.is_zero()
    }
}

/// 消费者配置
#[derive(Debug, Deserialize, Validate, Clone)]
#[serde(default)]
pub struct ConsumerConfig {
    /// 订阅的主题，Kafka 实现中以 `^` 开头表示正则
    #[validate(length(min = 1))]
    pub topics: Vec<String>,
    /// 覆盖全局的 bootstrap 地址
    pub bootstrap: Option<String>,
    /// 单批次最大消息数
    #[validate(range(min = 1))]
    pub record_limit: usize,
    /// 最少拉取字节数
    pub min_fetch_bytes: usize,
    /// 最长等待毫秒数
    #[validate(range(max = 300000))]
    pub max_wait_ms: u64,
    /// 事务隔离级别
    pub isolation_level: IsolationLevel,
    /// 确认模式
    pub ack_mode: AckMode,
    /// 拉取失败重试的初始退避毫秒数
    #[validate(range(min = 1))]
    pub retry_backoff_ms: u64,
    /// 退避上限毫秒数
    #[validate(range(min = 1))]
    pub retry_backoff_max_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            topics: Vec::new(),
            bootstrap: None,
            record_limit: 500,
            min_fetch_bytes: 1,
            max_wait_ms: 500,
            isolation_level: IsolationLevel::ReadCommitted,
            ack_mode: AckMode::Auto,
            retry_backoff_ms: 100,
            retry_backoff_max_ms: 30_000,
        }
    }
}

impl ConsumerConfig {
    /// 校验配置并生成拉取策略
    pub fn policy(&self) -> Result<PollPolicy, BatchError> {
        self.validate()?;
        if self.retry_backoff_max_ms < self.retry_backoff_ms {
            return Err(BatchError::ConfigInvalid(
                "retry_backoff_max_ms 不能小于 retry_backoff_ms".to_string(),
            ));
        }
        PollPolicy::new(
            self.record_limit,
            self.min_fetch_bytes,
            Duration::from_millis(self.max_wait_ms),
            self.isolation_level,
        )
    }

    /// 重试退避策略
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.retry_backoff_ms),
            Duration::from_millis(self.retry_backoff_max_ms),
        )
    }
}

/// 指数退避
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    /// 构造函数
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            current: base,
        }
    }

    /// 下一次等待时长，每次翻倍直至上限
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    /// 成功后重置
    pub fn reset(&mut self) {
        self.current = self.base;
    }
}
