//! Broker 端口
//!
//! 管道只依赖这三个抽象：拉取消息、发布消息、提交 offset。
//! 生产环境由 Kafka 客户端实现，测试使用 [`crate::test_utils`] 中的内存实现。

use async_trait::async_trait;
use pipeline_shared::error::PipelineError;
use pipeline_shared::kafka::{KafkaConsumer, KafkaProducer, RawRecord, RecordPosition};

/// 消息来源
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// 拉取下一条消息；返回错误表示订阅流本身出现故障
    async fn poll(&self) -> Result<RawRecord, PipelineError>;

    /// 重建订阅
    async fn resubscribe(&self) -> Result<(), PipelineError>;
}

/// 消息发布
#[async_trait]
pub trait RecordPublisher: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: &[u8],
    ) -> Result<(), PipelineError>;
}

/// offset 提交
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecordCommitter: Send + Sync {
    async fn commit(&self, position: &RecordPosition) -> Result<(), PipelineError>;
}

#[async_trait]
impl RecordSource for KafkaConsumer {
    async fn poll(&self) -> Result<RawRecord, PipelineError> {
        self.recv().await
    }

    async fn resubscribe(&self) -> Result<(), PipelineError> {
        KafkaConsumer::resubscribe(self)
    }
}

#[async_trait]
impl RecordCommitter for KafkaConsumer {
    async fn commit(&self, position: &RecordPosition) -> Result<(), PipelineError> {
        KafkaConsumer::commit(self, position)
    }
}

#[async_trait]
impl RecordPublisher for KafkaProducer {
    async fn publish(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: &[u8],
    ) -> Result<(), PipelineError> {
        self.send(topic, key, payload).await.map(|_| ())
    }
}
