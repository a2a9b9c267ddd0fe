//! 事件信封编解码
//!
//! 所有领域事件都包装在统一的信封中：
//! `{eventId, occurredOn, eventType, eventVersion, payload}`。
//! 监听器在构造时提供一个 [`PayloadDecoder`] 值描述期望的载荷类型，
//! 支持普通类型与"某类型的列表"两种形状，调用方无需为每种事件编写解码代码。

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use pipeline_shared::error::PipelineError;
use pipeline_shared::kafka::RawRecord;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{DecodeError, DecodeErrorKind};

// ---------------------------------------------------------------------------
// EventEnvelope — 通用事件信封
// ---------------------------------------------------------------------------

/// 通用事件信封
///
/// 信封本身不提供任何顺序保证，顺序仅依赖 broker 的分区内顺序。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope<T> {
    pub event_id: Uuid,
    pub occurred_on: DateTime<Utc>,
    pub event_type: String,
    pub event_version: String,
    pub payload: T,
}

impl<T> EventEnvelope<T> {
    /// 构建新事件，使用 UUID v7 作为 event_id（时间有序，适合作为消息 key）
    pub fn new(event_type: impl Into<String>, event_version: impl Into<String>, payload: T) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            occurred_on: Utc::now(),
            event_type: event_type.into(),
            event_version: event_version.into(),
            payload,
        }
    }

    /// 替换载荷，保留信封元数据
    pub fn map_payload<U>(self, f: impl FnOnce(T) -> U) -> EventEnvelope<U> {
        EventEnvelope {
            event_id: self.event_id,
            occurred_on: self.occurred_on,
            event_type: self.event_type,
            event_version: self.event_version,
            payload: f(self.payload),
        }
    }
}

// ---------------------------------------------------------------------------
// PayloadDecoder — 载荷类型描述
// ---------------------------------------------------------------------------

type DecodeFn<T> = dyn Fn(Value) -> Result<T, String> + Send + Sync;

/// 载荷解码器
///
/// 以值的形式描述监听器期望的载荷类型，而不是依赖运行时类型信息。
pub struct PayloadDecoder<T> {
    description: String,
    decode: Arc<DecodeFn<T>>,
}

impl<T> Clone for PayloadDecoder<T> {
    fn clone(&self) -> Self {
        Self {
            description: self.description.clone(),
            decode: self.decode.clone(),
        }
    }
}

impl<T> fmt::Debug for PayloadDecoder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayloadDecoder")
            .field("description", &self.description)
            .finish()
    }
}

impl<T: DeserializeOwned + 'static> PayloadDecoder<T> {
    /// 基于 serde 的 JSON 解码
    pub fn json() -> Self {
        Self {
            description: std::any::type_name::<T>().to_string(),
            decode: Arc::new(|value| serde_json::from_value(value).map_err(|e| e.to_string())),
        }
    }
}

impl<T: 'static> PayloadDecoder<T> {
    /// 自定义解码函数，适用于需要兼容多个载荷版本的事件
    pub fn custom<F>(description: impl Into<String>, decode: F) -> Self
    where
        F: Fn(Value) -> Result<T, String> + Send + Sync + 'static,
    {
        Self {
            description: description.into(),
            decode: Arc::new(decode),
        }
    }

    /// 由元素解码器派生"元素列表"解码器，错误信息带上出错元素的下标
    pub fn list(self) -> PayloadDecoder<Vec<T>> {
        let element = self.decode;
        PayloadDecoder {
            description: format!("list<{}>", self.description),
            decode: Arc::new(move |value| {
                let Value::Array(items) = value else {
                    return Err(format!("期望 JSON 数组，实际为 {}", json_kind(&value)));
                };
                items
                    .into_iter()
                    .enumerate()
                    .map(|(idx, item)| element(item).map_err(|e| format!("[{idx}]: {e}")))
                    .collect()
            }),
        }
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn decode(&self, value: Value) -> Result<T, String> {
        (self.decode)(value)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// EnvelopeCodec — 信封编解码器
// ---------------------------------------------------------------------------

/// 信封编解码器
///
/// 解码分三步，每一步的失败对应不同的 [`DecodeErrorKind`]：
/// 文本 -> JSON -> 信封字段 -> 载荷。解码失败从不重试。
pub struct EnvelopeCodec<T> {
    decoder: PayloadDecoder<T>,
}

impl<T> Clone for EnvelopeCodec<T> {
    fn clone(&self) -> Self {
        Self {
            decoder: self.decoder.clone(),
        }
    }
}

impl<T: 'static> EnvelopeCodec<T> {
    pub fn new(decoder: PayloadDecoder<T>) -> Self {
        Self { decoder }
    }

    pub fn payload_description(&self) -> &str {
        self.decoder.description()
    }

    /// 解码原始消息文本
    pub fn decode(&self, raw: &str) -> Result<EventEnvelope<T>, DecodeError> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| DecodeError::new(DecodeErrorKind::MalformedJson, raw, e))?;

        let envelope: EventEnvelope<Value> = serde_json::from_value(value)
            .map_err(|e| DecodeError::new(DecodeErrorKind::InvalidEnvelope, raw, e))?;

        let EventEnvelope {
            event_id,
            occurred_on,
            event_type,
            event_version,
            payload,
        } = envelope;

        let payload = self.decoder.decode(payload).map_err(|e| {
            DecodeError::new(
                DecodeErrorKind::IncompatiblePayload,
                raw,
                format!("{} ({})", e, self.decoder.description()),
            )
        })?;

        Ok(EventEnvelope {
            event_id,
            occurred_on,
            event_type,
            event_version,
            payload,
        })
    }

    /// 解码 Kafka 消息，非 UTF-8 的消息同样视为解码失败
    pub fn decode_record(&self, record: &RawRecord) -> Result<EventEnvelope<T>, DecodeError> {
        match record.value_str() {
            Ok(raw) => self.decode(raw),
            Err(e) => Err(DecodeError::new(
                DecodeErrorKind::InvalidUtf8,
                record.value_lossy(),
                e,
            )),
        }
    }
}

impl<T: DeserializeOwned + 'static> Default for EnvelopeCodec<T> {
    fn default() -> Self {
        Self::new(PayloadDecoder::json())
    }
}

impl<T: Serialize> EnvelopeCodec<T> {
    /// 编码为线上格式
    pub fn encode(envelope: &EventEnvelope<T>) -> Result<String, PipelineError> {
        Ok(serde_json::to_string(envelope)?)
    }
}
