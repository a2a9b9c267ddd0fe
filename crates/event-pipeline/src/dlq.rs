//! 死信队列
//!
//! 解码失败、永久失败或重试耗尽的消息被写入 `{源 topic}DLQ`，
//! 内容为原始消息文本与失败原因。死信记录只供人工排查，管道自身不会再读取。

use std::sync::Arc;

use pipeline_shared::error::PipelineError;
use pipeline_shared::observability::metrics;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::ports::RecordPublisher;

/// 死信 topic 后缀
pub const DLQ_SUFFIX: &str = "DLQ";

/// 由源 topic 推导死信 topic，例如 `UnitUnsuitable` -> `UnitUnsuitableDLQ`
pub fn dead_letter_topic(source_topic: &str) -> String {
    format!("{source_topic}{DLQ_SUFFIX}")
}

// ---------------------------------------------------------------------------
// DeadLetterRecord — 死信消息体
// ---------------------------------------------------------------------------

/// 死信消息体
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    /// 原始消息文本，逐字保留
    pub message: String,
    /// 失败原因
    pub error: String,
}

// ---------------------------------------------------------------------------
// DeadLetterSink — 死信发布
// ---------------------------------------------------------------------------

/// 死信发布器
///
/// 发布失败采取"失败放行"：[`DeadLetterSink::send_or_log`] 只记录日志和指标，
/// 调用方照常确认消息。否则要么阻塞整个分区，要么让 pump 崩溃，
/// 两者都比丢失一份诊断副本更糟。
pub struct DeadLetterSink {
    publisher: Arc<dyn RecordPublisher>,
    source_topic: String,
    topic: String,
}

impl DeadLetterSink {
    pub fn new(publisher: Arc<dyn RecordPublisher>, source_topic: &str) -> Self {
        Self {
            publisher,
            source_topic: source_topic.to_string(),
            topic: dead_letter_topic(source_topic),
        }
    }

    /// 死信 topic 名称
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// 发布死信记录，沿用源消息的 key 以保持同一实体落在同一分区
    pub async fn send(
        &self,
        key: Option<&str>,
        original_raw: &str,
        error_message: &str,
    ) -> Result<(), PipelineError> {
        let record = DeadLetterRecord {
            message: original_raw.to_string(),
            error: error_message.to_string(),
        };
        let payload = serde_json::to_vec(&record)?;

        self.publisher.publish(&self.topic, key, &payload).await?;

        warn!(
            source_topic = %self.source_topic,
            dlq_topic = %self.topic,
            error = error_message,
            "消息已发送到死信队列"
        );
        Ok(())
    }

    /// 尽力发布，失败时记录日志并返回 false，从不向上传播错误
    pub async fn send_or_log(
        &self,
        key: Option<&str>,
        original_raw: &str,
        error_message: &str,
    ) -> bool {
        match self.send(key, original_raw, error_message).await {
            Ok(()) => true,
            Err(e) => {
                error!(
                    source_topic = %self.source_topic,
                    dlq_topic = %self.topic,
                    error = %e,
                    original_error = error_message,
                    "发送到死信队列失败，诊断副本丢失，消息仍将被确认"
                );
                metrics::record_dlq_publish_failure(&self.source_topic);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::RecordingPublisher;

    #[test]
    fn test_dead_letter_topic() {
        assert_eq!(dead_letter_topic("UnitUnsuitable"), "UnitUnsuitableDLQ");
        assert_eq!(dead_letter_topic("ProductsImported"), "ProductsImportedDLQ");
    }

    #[test]
    fn test_dead_letter_record_wire_format() {
        let record = DeadLetterRecord {
            message: "not-json".to_string(),
            error: "JSON 格式错误: expected ident".to_string(),
        };

        let json: serde_json::Value = serde_json::to_value(&record).unwrap();
        assert_eq!(json["message"], "not-json");
        assert_eq!(json["error"], "JSON 格式错误: expected ident");
        assert_eq!(json.as_object().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_send_publishes_to_derived_topic() {
        let publisher = Arc::new(RecordingPublisher::new());
        let sink = DeadLetterSink::new(publisher.clone(), "UnitUnsuitable");

        sink.send(Some("W1"), r#"{"eventId":"x"}"#, "库存服务超时")
            .await
            .unwrap();

        let published = publisher.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "UnitUnsuitableDLQ");
        assert_eq!(published[0].key.as_deref(), Some("W1"));

        let dead_letters = publisher.dead_letters();
        assert_eq!(
            dead_letters,
            vec![DeadLetterRecord {
                message: r#"{"eventId":"x"}"#.to_string(),
                error: "库存服务超时".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn test_send_surfaces_publish_error() {
        let publisher = Arc::new(RecordingPublisher::new());
        publisher.fail_publishes(true);
        let sink = DeadLetterSink::new(publisher.clone(), "UnitUnsuitable");

        let result = sink.send(None, "not-json", "JSON 格式错误").await;
        assert!(result.is_err());
        assert!(publisher.published().is_empty());
    }

    #[tokio::test]
    async fn test_send_or_log_swallows_publish_error() {
        let publisher = Arc::new(RecordingPublisher::new());
        publisher.fail_publishes(true);
        let sink = DeadLetterSink::new(publisher.clone(), "UnitUnsuitable");

        assert!(!sink.send_or_log(None, "not-json", "JSON 格式错误").await);

        publisher.fail_publishes(false);
        assert!(sink.send_or_log(None, "not-json", "JSON 格式错误").await);
        assert_eq!(publisher.published().len(), 1);
    }
}
