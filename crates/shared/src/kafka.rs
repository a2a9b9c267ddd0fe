//! Kafka 基础设施封装
//!
//! 将 rdkafka 的底层 API 封装为业务友好的 Producer/Consumer 抽象，
//! 统一消息所有权转换、错误映射、offset 提交与重新订阅语义。

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use rdkafka::client::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, ConsumerContext, StreamConsumer};
use rdkafka::error::KafkaResult;
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{Offset, TopicPartitionList};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::{AckMode, KafkaConfig};
use crate::error::PipelineError;
use crate::observability::metrics;

// ---------------------------------------------------------------------------
// RawRecord
// ---------------------------------------------------------------------------

/// 消费到的 Kafka 消息的统一表示
///
/// 将 rdkafka 的 `BorrowedMessage`（带生命周期约束）转换为拥有所有权的结构体，
/// 使消息可以安全地跨 await 点传递给工作池中的任务。
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub value: Vec<u8>,
    pub timestamp: Option<i64>,
    pub headers: HashMap<String, String>,
}

impl RawRecord {
    /// 从 rdkafka 的借用消息构造，提取并拥有所有字段
    fn from_borrowed(msg: &BorrowedMessage<'_>) -> Self {
        let key = msg
            .key()
            .and_then(|k| std::str::from_utf8(k).ok())
            .map(String::from);

        let value = msg.payload().map(|p| p.to_vec()).unwrap_or_default();

        let timestamp = msg.timestamp().to_millis();

        let mut headers = HashMap::new();
        if let Some(h) = msg.headers() {
            for idx in 0..h.count() {
                let header = h.get(idx);
                if let Some(raw) = header.value
                    && let Ok(value) = std::str::from_utf8(raw)
                {
                    headers.insert(header.key.to_string(), value.to_string());
                }
            }
        }

        Self {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key,
            value,
            timestamp,
            headers,
        }
    }

    /// 将消息值视为 UTF-8 字符串返回
    pub fn value_str(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.value)
    }

    /// 原始值的文本形式，非法 UTF-8 字节以替换字符呈现
    pub fn value_lossy(&self) -> String {
        String::from_utf8_lossy(&self.value).into_owned()
    }

    pub fn position(&self) -> RecordPosition {
        RecordPosition {
            topic: self.topic.clone(),
            partition: self.partition,
            offset: self.offset,
        }
    }
}

/// 消息在 broker 中的位置，提交 offset 时使用
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordPosition {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl std::fmt::Display for RecordPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]@{}", self.topic, self.partition, self.offset)
    }
}

// ---------------------------------------------------------------------------
// KafkaProducer
// ---------------------------------------------------------------------------

/// 面向业务的 Kafka 生产者
///
/// 封装 `FutureProducer` 并提供类型安全的 JSON 发送方法，
/// 内部已派生 Clone（`FutureProducer` 本身是 Arc 包装的）。
#[derive(Clone)]
pub struct KafkaProducer {
    producer: FutureProducer,
    send_timeout: Duration,
}

impl KafkaProducer {
    /// 根据配置创建生产者
    ///
    /// 投递超时由 `message_timeout_ms` 控制；超时后返回错误由上层决定如何处理，
    /// 而非无限等待。
    pub fn new(config: &KafkaConfig) -> Result<Self, PipelineError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("message.timeout.ms", config.message_timeout_ms.to_string())
            .create()
            .map_err(|e| PipelineError::Kafka(format!("创建生产者失败: {e}")))?;

        info!(brokers = %config.brokers, "Kafka 生产者已初始化");
        Ok(Self {
            producer,
            send_timeout: Duration::from_millis(config.message_timeout_ms),
        })
    }

    /// 发送原始字节消息，`key` 为空时由分区器自行选择分区
    pub async fn send(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: &[u8],
    ) -> Result<(i32, i64), PipelineError> {
        let mut record: FutureRecord<'_, str, [u8]> = FutureRecord::to(topic).payload(payload);
        if let Some(key) = key {
            record = record.key(key);
        }

        // rdkafka 0.39+ 返回 Delivery 结构体而非元组
        let delivery = self
            .producer
            .send(record, self.send_timeout)
            .await
            .map_err(|(e, _)| PipelineError::Kafka(format!("发送消息失败: {e}")))?;

        debug!(
            topic,
            key,
            partition = delivery.partition,
            offset = delivery.offset,
            "消息已发送"
        );
        Ok((delivery.partition, delivery.offset))
    }

    /// 将值序列化为 JSON 后发送
    ///
    /// 序列化与网络发送拆分为两步，便于独立定位故障原因。
    pub async fn send_json<T: Serialize>(
        &self,
        topic: &str,
        key: Option<&str>,
        value: &T,
    ) -> Result<(i32, i64), PipelineError> {
        let payload = serde_json::to_vec(value)?;
        self.send(topic, key, &payload).await
    }
}

// ---------------------------------------------------------------------------
// KafkaConsumer
// ---------------------------------------------------------------------------

/// 消费者上下文
///
/// 提交以异步方式发出，broker 的处理结果只能在回调中拿到，
/// 自动提交模式下的周期提交同样经过这里。
pub struct CommitReportingContext;

impl ClientContext for CommitReportingContext {}

impl ConsumerContext for CommitReportingContext {
    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        report_commit_result(&result, offsets);
    }
}

/// 记录被 broker 拒绝的提交，返回失败的分区数
fn report_commit_result(result: &KafkaResult<()>, offsets: &TopicPartitionList) -> usize {
    let mut failed = 0;
    for elem in offsets.elements() {
        let reason = match result {
            Err(e) => e.to_string(),
            Ok(()) => match elem.error() {
                Ok(()) => continue,
                Err(e) => e.to_string(),
            },
        };
        failed += 1;
        error!(
            topic = elem.topic(),
            partition = elem.partition(),
            offset = ?elem.offset(),
            error = %reason,
            "broker 拒绝 offset 提交"
        );
        metrics::record_commit_failure(elem.topic());
    }

    if failed == 0
        && let Err(e) = result
    {
        error!(error = %e, "offset 提交失败");
    }
    failed
}

/// 面向业务的 Kafka 消费者
///
/// 手动模式下关闭 `enable.auto.commit`，由调用方在终态动作完成后逐条提交；
/// 自动模式下 offset 在消息交付给应用时即被存储并周期性提交。
pub struct KafkaConsumer {
    consumer: StreamConsumer<CommitReportingContext>,
    /// 记录当前订阅，重新订阅时复用
    topics: Mutex<Vec<String>>,
}

impl KafkaConsumer {
    /// 创建消费者
    ///
    /// `group_id_suffix` 允许同一服务内不同监听器使用独立的消费组，
    /// 例如 "inventory-listener.unit_unsuitable"。
    pub fn new(
        config: &KafkaConfig,
        group_id_suffix: Option<&str>,
        ack_mode: AckMode,
    ) -> Result<Self, PipelineError> {
        let group_id = match group_id_suffix {
            Some(suffix) => format!("{}.{}", config.consumer_group, suffix),
            None => config.consumer_group.clone(),
        };

        let auto_commit = match ack_mode {
            AckMode::Manual => "false",
            AckMode::Auto => "true",
        };

        let consumer: StreamConsumer<CommitReportingContext> = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &group_id)
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            .set("enable.auto.commit", auto_commit)
            .set("enable.auto.offset.store", "true")
            .create_with_context(CommitReportingContext)
            .map_err(|e| PipelineError::Kafka(format!("创建消费者失败: {e}")))?;

        info!(brokers = %config.brokers, group_id, %ack_mode, "Kafka 消费者已初始化");
        Ok(Self {
            consumer,
            topics: Mutex::new(Vec::new()),
        })
    }

    /// 订阅指定的 topic 列表
    pub fn subscribe(&self, topics: &[&str]) -> Result<(), PipelineError> {
        self.consumer
            .subscribe(topics)
            .map_err(|e| PipelineError::Kafka(format!("订阅 topic 失败: {e}")))?;

        *self.topics.lock() = topics.iter().map(|t| t.to_string()).collect();
        info!(?topics, "已订阅 Kafka topics");
        Ok(())
    }

    /// 取消并重新建立当前订阅
    ///
    /// 未提交的 offset 会在重新分配分区后从上次提交处继续消费。
    pub fn resubscribe(&self) -> Result<(), PipelineError> {
        let topics = self.topics.lock().clone();
        if topics.is_empty() {
            return Err(PipelineError::Kafka("尚未订阅任何 topic，无法重新订阅".to_string()));
        }

        self.consumer.unsubscribe();
        let refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer
            .subscribe(&refs)
            .map_err(|e| PipelineError::Kafka(format!("重新订阅 topic 失败: {e}")))?;

        warn!(?topics, "已重新订阅 Kafka topics");
        Ok(())
    }

    /// 拉取下一条消息
    ///
    /// 借用消息在此处即转换为 `RawRecord`，不跨 await 持有。
    pub async fn recv(&self) -> Result<RawRecord, PipelineError> {
        let msg = self
            .consumer
            .recv()
            .await
            .map_err(|e| PipelineError::Kafka(format!("接收消息出错: {e}")))?;

        let record = RawRecord::from_borrowed(&msg);
        debug!(
            topic = %record.topic,
            partition = record.partition,
            offset = record.offset,
            "收到 Kafka 消息"
        );
        Ok(record)
    }

    /// 提交单条消息的 offset（提交值为 offset + 1，即下一条待消费位置）
    ///
    /// 异步提交：这里的错误只表示提交请求未能发出，
    /// broker 端的拒绝由 [`CommitReportingContext`] 记录。
    pub fn commit(&self, position: &RecordPosition) -> Result<(), PipelineError> {
        let commit_err = |message: String| PipelineError::Commit {
            topic: position.topic.clone(),
            partition: position.partition,
            offset: position.offset,
            message,
        };

        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(
            &position.topic,
            position.partition,
            Offset::Offset(position.offset + 1),
        )
        .map_err(|e| commit_err(e.to_string()))?;

        self.consumer
            .commit(&tpl, CommitMode::Async)
            .map_err(|e| commit_err(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// 测试
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rdkafka::error::{KafkaError, RDKafkaErrorCode};

    fn record(value: &[u8]) -> RawRecord {
        RawRecord {
            topic: "UnitUnsuitable".to_string(),
            partition: 2,
            offset: 42,
            key: Some("W036825000001".to_string()),
            value: value.to_vec(),
            timestamp: Some(1_700_000_000_000),
            headers: HashMap::from([("traceparent".to_string(), "00-abc".to_string())]),
        }
    }

    #[test]
    fn test_record_position() {
        let msg = record(b"{}");
        let position = msg.position();

        assert_eq!(position.topic, "UnitUnsuitable");
        assert_eq!(position.partition, 2);
        assert_eq!(position.offset, 42);
        assert_eq!(position.to_string(), "UnitUnsuitable[2]@42");
    }

    fn offsets(partitions: &[i32]) -> TopicPartitionList {
        let mut tpl = TopicPartitionList::new();
        for partition in partitions {
            tpl.add_partition_offset("UnitUnsuitable", *partition, Offset::Offset(43))
                .unwrap();
        }
        tpl
    }

    #[test]
    fn test_successful_commit_reports_nothing() {
        assert_eq!(report_commit_result(&Ok(()), &offsets(&[0, 1])), 0);
    }

    #[test]
    fn test_rejected_commit_reports_every_partition() {
        let rejected = Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::RebalanceInProgress));

        assert_eq!(report_commit_result(&rejected, &offsets(&[0, 1])), 2);
        assert_eq!(report_commit_result(&rejected, &offsets(&[])), 0);
    }

    #[test]
    fn test_record_value_str() {
        assert_eq!(record(b"hello world").value_str().unwrap(), "hello world");
    }

    #[test]
    fn test_record_value_invalid_utf8() {
        let msg = record(&[0x6e, 0xFF, 0xFE]);
        assert!(msg.value_str().is_err());
        // 宽松转换保留可读部分
        assert!(msg.value_lossy().starts_with('n'));
    }
}
