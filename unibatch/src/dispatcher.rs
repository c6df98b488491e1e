//! # 批次分发

use crate::{
    accumulator::FlushReason,
    ack::{Ack, AckStrategy, Confirm},
    domain::Handler,
    errors::BatchError,
    record::{CommitKey, RecordBatch},
};
use tracing::{debug, error, instrument};

/// 批次分发者
#[derive(Debug, Clone)]
pub struct Dispatcher {
    ack: Ack,
    confirm: Confirm,
}

impl Dispatcher {
    /// 构造函数
    pub fn new(ack: Ack, confirm: Confirm) -> Self {
        Self { ack, confirm }
    }

    /// 绑定的确认策略
    pub fn ack(&self) -> &Ack {
        &self.ack
    }

    /// 按固定顺序调用处理者：批次开始、逐条消息、批次结束，全部成功后交由确认策略
    ///
    /// 任一步失败返回 [`BatchError::ProcessingFailed`]，不会产生提交键。
    #[instrument(
        name = "dispatch_batch",
        level = "debug",
        skip_all,
        fields(size = batch.len(), %reason)
    )]
    pub async fn dispatch<H>(
        &self,
        batch: &RecordBatch,
        reason: FlushReason,
        handler: &mut H,
    ) -> Result<Option<CommitKey>, BatchError>
    where
        H: Handler,
    {
        handler
            .on_batch_start(batch.len())
            .await
            .map_err(|e| processing("批次开始", e))?;

        for (position, record) in batch.iter().enumerate() {
            if let Err(e) = handler.on_item(record).await {
                error!(
                    partition = %record.partition,
                    offset = record.offset,
                    "第 {} 条消息处理失败，放弃批次剩余 {} 条消息",
                    position + 1,
                    batch.len() - position - 1
                );
                return Err(processing("消息", e));
            }
        }

        handler
            .on_batch_end(batch.commit_key(), &self.confirm)
            .await
            .map_err(|e| processing("批次结束", e))?;

        debug!("批次投递完成：{}", batch.commit_key());
        Ok(self.ack.on_batch_delivered(batch))
    }
}

fn processing(stage: &str, e: BatchError) -> BatchError {
    match e {
        BatchError::ProcessingFailed(msg) => {
            BatchError::ProcessingFailed(format!("{stage}：{msg}"))
        }
        other => BatchError::ProcessingFailed(format!("{stage}：{other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::AckMode,
        record::{Partition, Record},
    };
    use bytes::Bytes;

    #[derive(Default)]
    struct Trace {
        calls: Vec<String>,
        fail_at: Option<u64>,
        confirm: bool,
    }

    impl Handler for Trace {
        async fn on_batch_start(&mut self, size: usize) -> Result<(), BatchError> {
            self.calls.push(format!("start:{size}"));
            Ok(())
        }

        async fn on_item(&mut self, record: &Record) -> Result<(), BatchError> {
            if self.fail_at == Some(record.offset) {
                return Err("坏消息".into());
            }
            self.calls.push(format!("item:{}", record.offset));
            Ok(())
        }

        async fn on_batch_end(
            &mut self,
            key: &CommitKey,
            confirm: &Confirm,
        ) -> Result<(), BatchError> {
            self.calls.push(format!("end:{key}"));
            if self.confirm {
                confirm.confirm(key.clone());
            }
            Ok(())
        }
    }

    fn batch() -> RecordBatch {
        let p = Partition::new("note", 0);
        RecordBatch::new(
            (0..5)
                .map(|o| Record::new(p.clone(), o, None, Bytes::from_static(b"x")))
                .collect(),
        )
        .unwrap()
    }

    fn dispatcher(mode: AckMode) -> (Dispatcher, tokio::sync::mpsc::UnboundedReceiver<CommitKey>) {
        let (confirm, rx) = Confirm::channel(mode);
        (Dispatcher::new(Ack::from(mode), confirm), rx)
    }

    #[tokio::test]
    async fn hooks_run_in_order() {
        let (dispatcher, _rx) = dispatcher(AckMode::Auto);
        let mut handler = Trace::default();
        let batch = batch();

        let key = dispatcher.dispatch(&batch, FlushReason::Count, &mut handler).await.unwrap();

        assert_eq!(
            handler.calls,
            vec![
                "start:5", "item:0", "item:1", "item:2", "item:3", "item:4",
                "end:[note|0@4]"
            ]
        );
        assert_eq!(key, Some(batch.commit_key().clone()));
    }

    #[tokio::test]
    async fn item_failure_aborts_batch() {
        let (dispatcher, _rx) = dispatcher(AckMode::Auto);
        let mut handler = Trace {
            fail_at: Some(2),
            ..Default::default()
        };

        let result = dispatcher.dispatch(&batch(), FlushReason::Timeout, &mut handler).await;

        assert!(matches!(result, Err(BatchError::ProcessingFailed(_))));
        assert_eq!(handler.calls, vec!["start:5", "item:0", "item:1"]);
    }

    #[tokio::test]
    async fn manual_mode_yields_no_key_but_forwards_confirm() {
        let (dispatcher, mut rx) = dispatcher(AckMode::Manual);
        let mut handler = Trace {
            confirm: true,
            ..Default::default()
        };
        let batch = batch();

        let key = dispatcher.dispatch(&batch, FlushReason::Count, &mut handler).await.unwrap();

        assert_eq!(key, None);
        assert_eq!(rx.try_recv().ok(), Some(batch.commit_key().clone()));
    }

    #[derive(Clone, Default)]
    struct Capture(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for Capture {
        type Writer = Capture;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[tokio::test]
    async fn span_records_flush_reason() {
        let capture = Capture::default();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(capture.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);
        let (dispatcher, _rx) = dispatcher(AckMode::Auto);
        let mut handler = Trace::default();

        dispatcher
            .dispatch(&batch(), FlushReason::Bytes, &mut handler)
            .await
            .unwrap();

        let output = String::from_utf8(capture.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("dispatch_batch{size=5 reason=触及字节阈值}"));
    }
}
