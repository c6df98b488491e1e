use crate::errors::KafkaBatchError;
use rdkafka::ClientConfig;
use std::{collections::HashMap, path::PathBuf, sync::OnceLock};
use tokio::time::Duration;
use tracing::{debug, info};
use unibatch::{
    BatchError, ConsumerConfig,
    config::{NamedConfig, build_config, load_named_config},
};

static KAFKA_CONFIG: OnceLock<KafkaConfig> = OnceLock::new();

fn load_named_setting(
    config: &config::Config,
    section: &str,
) -> Result<HashMap<String, HashMap<String, String>>, KafkaBatchError> {
    let input = match config.get::<HashMap<String, config::Value>>(section) {
        Ok(c) => c,
        Err(config::ConfigError::NotFound(_)) => return Ok(HashMap::new()),
        Err(e) => return Err(e.into()),
    };

    let mut result = HashMap::with_capacity(input.len());
    for (name, value) in input {
        let map = value
            .try_deserialize::<HashMap<String, String>>()
            .map_err(|e| BatchError::ConfigInvalid(format!("{section}.{name}：{e}")))?;
        result.insert(name, map);
    }
    Ok(result)
}

#[inline]
fn load_timeout(config: &config::Config) -> Duration {
    match config.get("timeout") {
        Ok(t) => Duration::from_secs(t),
        Err(_) => Duration::from_secs(45),
    }
}

/// Kafka 消费配置
#[derive(Debug, Clone)]
pub struct KafkaConfig {
    /// 全局 bootstrap 地址
    pub bootstrap: String,
    /// 查询已提交偏移量的超时
    pub timeout: Duration,
    /// 命名消费者配置
    pub consumers: NamedConfig<ConsumerConfig>,
    /// 命名消费者的 librdkafka 原始配置
    pub cc: HashMap<String, HashMap<String, String>>,
}

impl KafkaConfig {
    /// 从本 crate 的配置目录与环境变量加载
    pub fn load() -> Result<Self, KafkaBatchError> {
        let config = build_config(PathBuf::from(env!("CARGO_MANIFEST_DIR")))?;
        Self::from_config(&config)
    }

    /// 进程级配置，首次访问时加载
    pub fn get() -> Result<&'static Self, KafkaBatchError> {
        if let Some(cfg) = KAFKA_CONFIG.get() {
            return Ok(cfg);
        }
        let _ = KAFKA_CONFIG.set(Self::load()?);
        KAFKA_CONFIG.get().ok_or_else(|| "Kafka 配置初始化失败".into())
    }

    /// 从已构建的配置解析
    pub fn from_config(config: &config::Config) -> Result<Self, KafkaBatchError> {
        let bootstrap = config.get::<String>("bootstrap")?;
        let timeout = load_timeout(config);
        let consumers = load_named_config(config, "consumers")?;
        let cc = load_named_setting(config, "cc")?;
        info!("加载 {} 个消费者配置", consumers.iter().count());
        Ok(Self {
            bootstrap,
            timeout,
            consumers,
            cc,
        })
    }

    /// 命名消费者的 librdkafka 客户端配置
    ///
    /// 原始配置先行，引擎依赖的项随后覆盖：偏移量只由确认策略提交。
    pub fn client_config(&self, name: &str, cfg: &ConsumerConfig) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("auto.offset.reset", "earliest");
        if let Some(settings) = self.cc.get(name) {
            for (key, value) in settings {
                config.set(key, value);
            }
        }
        let bootstrap = cfg.bootstrap.as_deref().unwrap_or(&self.bootstrap);
        config
            .set("bootstrap.servers", bootstrap)
            .set("group.id", name)
            .set("enable.auto.commit", "false")
            .set("isolation.level", cfg.isolation_level.as_str())
            .set("fetch.min.bytes", cfg.min_fetch_bytes.max(1).to_string())
            .set("fetch.wait.max.ms", cfg.max_wait_ms.to_string());
        debug!("生成消费者 {name} 的客户端配置");
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::{File, FileFormat};
    use rstest::*;
    use unibatch::{AckMode, IsolationLevel};

    const LAYERED: &str = r#"
bootstrap = "kafka-0:9092"

[consumers.note]
topics = ["note"]
record_limit = 20
min_fetch_bytes = 10240
max_wait_ms = 10000
ack_mode = "manual"

[consumers.audit]
topics = ["^audit-.*"]
bootstrap = "kafka-1:9092"
isolation_level = "read_uncommitted"

[cc.note]
"session.timeout.ms" = "6000"
"enable.auto.commit" = "true"
"#;

    #[fixture]
    fn layered() -> config::Config {
        config::Config::builder()
            .add_source(File::from_str(LAYERED, FileFormat::Toml))
            .build()
            .unwrap()
    }

    #[rstest]
    fn parse_layered_config(layered: config::Config) {
        let cfg = KafkaConfig::from_config(&layered).unwrap();
        assert_eq!(cfg.bootstrap, "kafka-0:9092");
        assert_eq!(cfg.timeout, Duration::from_secs(45));

        let note = cfg.consumers.get("note").unwrap();
        assert_eq!(note.record_limit, 20);
        assert_eq!(note.ack_mode, AckMode::Manual);
        let audit = cfg.consumers.get("audit").unwrap();
        assert_eq!(audit.isolation_level, IsolationLevel::ReadUncommitted);
        assert_eq!(audit.record_limit, 500);
    }

    #[rstest]
    fn client_config_maps_policy(layered: config::Config) {
        let cfg = KafkaConfig::from_config(&layered).unwrap();
        let note = cfg.client_config("note", cfg.consumers.get("note").unwrap());

        assert_eq!(note.get("bootstrap.servers"), Some("kafka-0:9092"));
        assert_eq!(note.get("group.id"), Some("note"));
        assert_eq!(note.get("isolation.level"), Some("read_committed"));
        assert_eq!(note.get("fetch.min.bytes"), Some("10240"));
        assert_eq!(note.get("fetch.wait.max.ms"), Some("10000"));
        assert_eq!(note.get("session.timeout.ms"), Some("6000"));
        assert_eq!(note.get("auto.offset.reset"), Some("earliest"));
    }

    #[rstest]
    fn engine_settings_override_raw(layered: config::Config) {
        let cfg = KafkaConfig::from_config(&layered).unwrap();
        let note = cfg.client_config("note", cfg.consumers.get("note").unwrap());
        assert_eq!(note.get("enable.auto.commit"), Some("false"));

        let audit = cfg.client_config("audit", cfg.consumers.get("audit").unwrap());
        assert_eq!(audit.get("bootstrap.servers"), Some("kafka-1:9092"));
        assert_eq!(audit.get("isolation.level"), Some("read_uncommitted"));
        assert_eq!(audit.get("fetch.min.bytes"), Some("1"));
    }

    #[rstest]
    fn zero_min_bytes_clamped(layered: config::Config) {
        let cfg = KafkaConfig::from_config(&layered).unwrap();
        let immediate = ConsumerConfig {
            topics: vec!["note".to_string()],
            min_fetch_bytes: 0,
            max_wait_ms: 0,
            ..Default::default()
        };
        let client = cfg.client_config("note", &immediate);
        assert_eq!(client.get("fetch.min.bytes"), Some("1"));
        assert_eq!(client.get("fetch.wait.max.ms"), Some("0"));
    }

    #[test]
    fn missing_bootstrap_is_invalid() {
        let config = config::Config::builder().build().unwrap();
        assert!(matches!(
            KafkaConfig::from_config(&config),
            Err(KafkaBatchError::Batch(BatchError::ConfigInvalid(_)))
        ));
    }

    #[test]
    fn invalid_consumer_is_rejected() {
        let source = "bootstrap = \"kafka-0:9092\"\n[consumers.note]\ntopics = []\n";
        let config = config::Config::builder()
            .add_source(File::from_str(source, FileFormat::Toml))
            .build()
            .unwrap();
        assert!(matches!(
            KafkaConfig::from_config(&config),
            Err(KafkaBatchError::Batch(BatchError::ConfigInvalid(_)))
        ));
    }
}
