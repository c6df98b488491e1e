#![allow(dead_code)]

use rdkafka::{
    ClientConfig,
    admin::{AdminClient, AdminOptions, NewTopic, TopicReplication},
    client::DefaultClientContext,
    producer::{FutureProducer, FutureRecord},
};
use std::sync::LazyLock;
use tokio::time::{Duration, sleep};
use tracing::{Level, info};
use tracing_subscriber::fmt;
use unibatch_kafka::KafkaConfig;

pub(crate) static CFG: LazyLock<KafkaConfig> = LazyLock::new(|| {
    let _ = fmt()
        .with_test_writer()
        .with_max_level(Level::DEBUG)
        .try_init();
    info!("启用 {} 测试日志输出", Level::DEBUG);
    KafkaConfig::load().unwrap()
});

pub(crate) static OPTS: LazyLock<AdminOptions> = LazyLock::new(|| {
    AdminOptions::new()
        .operation_timeout(Some(Duration::from_secs(3)))
        .request_timeout(Some(Duration::from_secs(5)))
});

pub(crate) static ADMIN: LazyLock<AdminClient<DefaultClientContext>> =
    LazyLock::new(|| client().create().expect("管理客户端创建失败"));

pub(crate) static PRODUCER: LazyLock<FutureProducer> =
    LazyLock::new(|| client().create().expect("生产者创建失败"));

pub(crate) fn client() -> ClientConfig {
    let mut config = ClientConfig::new();
    config.set("bootstrap.servers", &CFG.bootstrap);
    config
}

pub(crate) async fn create_topic(name: &str, partitions: i32) {
    let topic = NewTopic::new(name, partitions, TopicReplication::Fixed(3));
    let _ = ADMIN.create_topics(&[topic], &OPTS).await;
}

pub(crate) async fn delete_topic(name: &str) {
    let _ = ADMIN.delete_topics(&[name], &OPTS).await;
}

pub(crate) async fn produce(topic: &str, count: usize, size: usize) {
    let payload = vec![b'x'; size];
    for i in 0..count {
        let key = i.to_string();
        let record = FutureRecord::to(topic)
            .key(key.as_str())
            .payload(payload.as_slice());
        PRODUCER
            .send(record, Duration::from_secs(5))
            .await
            .expect("发送消息失败");
    }
}

pub(crate) async fn wait_until(mut cond: impl FnMut() -> bool, limit: Duration) {
    let started = tokio::time::Instant::now();
    while !cond() {
        assert!(started.elapsed() < limit, "等待条件超时");
        sleep(Duration::from_millis(100)).await;
    }
}
