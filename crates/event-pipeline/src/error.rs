//! 消费管道错误类型
//!
//! 按处理阶段划分：解码失败不重试、业务失败按瞬时/永久分类、
//! 订阅流不可恢复时才让整个 pump 退出。

use std::fmt::Display;

use pipeline_shared::error::PipelineError;

/// 解码失败的具体原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeErrorKind {
    InvalidUtf8,
    MalformedJson,
    /// 信封必填字段缺失或格式错误（eventId 非 UUID、occurredOn 非 ISO-8601 等）
    InvalidEnvelope,
    /// 信封合法，但 payload 与监听器期望的类型不符
    IncompatiblePayload,
}

impl Display for DecodeErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::InvalidUtf8 => "非法 UTF-8 编码",
            Self::MalformedJson => "JSON 格式错误",
            Self::InvalidEnvelope => "事件信封无效",
            Self::IncompatiblePayload => "事件载荷与目标类型不兼容",
        };
        write!(f, "{s}")
    }
}

/// 事件解码错误
///
/// 携带原始消息文本，写入死信队列时原样保留。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct DecodeError {
    pub kind: DecodeErrorKind,
    pub raw: String,
    /// 解析器给出的错误描述
    pub message: String,
}

impl DecodeError {
    pub fn new(kind: DecodeErrorKind, raw: impl Into<String>, message: impl Display) -> Self {
        Self {
            kind,
            raw: raw.into(),
            message: message.to_string(),
        }
    }
}

/// 业务处理错误
///
/// Display 只输出原始错误描述，死信记录中的 error 字段即为业务返回的原文。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// 瞬时故障（下游暂不可用等），由重试策略处理
    #[error("{0}")]
    Transient(String),
    /// 永久失败（领域不变量被破坏、载荷校验失败），重试无意义，直接进入死信
    #[error("{0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn transient(message: impl Display) -> Self {
        Self::Transient(message.to_string())
    }

    pub fn permanent(message: impl Display) -> Self {
        Self::Permanent(message.to_string())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// 未显式分类的错误默认视为可重试
impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::Transient(format!("{err:#}"))
    }
}

/// Pump 级错误，只有订阅流层面的故障会让消费循环退出
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("订阅流不可恢复: topic={topic} - {message}")]
    Infrastructure { topic: String, message: String },

    #[error(transparent)]
    Shared(#[from] PipelineError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_error_display() {
        let err = DecodeError::new(
            DecodeErrorKind::MalformedJson,
            "not-json",
            "expected ident at line 1 column 2",
        );
        assert_eq!(
            err.to_string(),
            "JSON 格式错误: expected ident at line 1 column 2"
        );
        assert_eq!(err.raw, "not-json");
    }

    #[test]
    fn test_handler_error_classification() {
        assert!(HandlerError::transient("库存服务超时").is_retryable());
        assert!(!HandlerError::permanent("unitNumber 为空").is_retryable());

        // Display 不添加任何前缀
        assert_eq!(HandlerError::permanent("unitNumber 为空").to_string(), "unitNumber 为空");
    }

    #[test]
    fn test_anyhow_defaults_to_transient() {
        let err: HandlerError = anyhow::anyhow!("连接被重置").into();
        assert_eq!(err, HandlerError::Transient("连接被重置".to_string()));
    }

    #[test]
    fn test_consumer_error_display() {
        let err = ConsumerError::Infrastructure {
            topic: "UnitUnsuitable".to_string(),
            message: "重新订阅次数已用尽".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "订阅流不可恢复: topic=UnitUnsuitable - 重新订阅次数已用尽"
        );

        let err = ConsumerError::from(PipelineError::Kafka("broker 不可达".to_string()));
        assert_eq!(err.to_string(), "Kafka 错误: broker 不可达");
    }
}
