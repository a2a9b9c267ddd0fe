//! 统一错误处理模块
//!
//! 定义基础设施层共享的错误类型，使用 thiserror 提供良好的错误信息。
//! 业务处理相关的错误分类（瞬时/永久）由 event-pipeline 自行定义。

use thiserror::Error;

/// 基础设施错误类型
#[derive(Debug, Error)]
pub enum PipelineError {
    // ==================== Kafka 错误 ====================
    #[error("Kafka 错误: {0}")]
    Kafka(String),

    #[error("提交 offset 失败: {topic}[{partition}]@{offset} - {message}")]
    Commit {
        topic: String,
        partition: i32,
        offset: i64,
        message: String,
    },

    // ==================== 配置错误 ====================
    #[error("配置错误: {0}")]
    Config(#[from] config::ConfigError),

    #[error("无效的配置: {field} - {message}")]
    InvalidConfig { field: String, message: String },

    // ==================== 序列化错误 ====================
    #[error("序列化失败: {0}")]
    Serialization(#[from] serde_json::Error),

    // ==================== 通用错误 ====================
    #[error("内部错误: {0}")]
    Internal(String),
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Kafka(_) => "KAFKA_ERROR",
            Self::Commit { .. } => "COMMIT_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
            Self::InvalidConfig { .. } => "INVALID_CONFIG",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// 是否为可重试错误
    ///
    /// 只有与 broker 交互的错误可能随时间恢复，配置和序列化错误重试无意义。
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Kafka(_) | Self::Commit { .. })
    }
}

impl From<rdkafka::error::KafkaError> for PipelineError {
    fn from(err: rdkafka::error::KafkaError) -> Self {
        Self::Kafka(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code() {
        let err = PipelineError::Commit {
            topic: "UnitUnsuitable".to_string(),
            partition: 0,
            offset: 7,
            message: "coordinator not available".to_string(),
        };
        assert_eq!(err.code(), "COMMIT_ERROR");
        assert_eq!(
            err.to_string(),
            "提交 offset 失败: UnitUnsuitable[0]@7 - coordinator not available"
        );
    }

    #[test]
    fn test_is_retryable() {
        assert!(PipelineError::Kafka("broker 不可达".to_string()).is_retryable());

        let invalid = PipelineError::InvalidConfig {
            field: "listeners.unit.workers".to_string(),
            message: "必须大于 0".to_string(),
        };
        assert!(!invalid.is_retryable());
    }

    #[test]
    fn test_from_serde_error() {
        let serde_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = PipelineError::from(serde_err);
        assert_eq!(err.code(), "SERIALIZATION_ERROR");
    }
}
