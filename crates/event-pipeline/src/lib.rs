//! 可靠事件消费管道
//!
//! 从 broker 拉取事件信封，解码为类型化载荷后调用业务用例，
//! 瞬时失败按重试策略重试，无法处理的消息写入死信队列，每条消息恰好确认一次。

pub mod ack;
pub mod dlq;
pub mod envelope;
pub mod error;
pub mod invoker;
pub mod ports;
pub mod pump;
pub mod test_utils;
pub mod worker_pool;

pub use ack::{AckOutcome, AcknowledgmentGate, PendingAck};
pub use dlq::{DeadLetterRecord, DeadLetterSink, dead_letter_topic};
pub use envelope::{EnvelopeCodec, EventEnvelope, PayloadDecoder};
pub use error::{ConsumerError, DecodeError, DecodeErrorKind, HandlerError};
pub use invoker::{UseCase, UseCaseInvoker};
pub use ports::{RecordCommitter, RecordPublisher, RecordSource};
pub use pump::{ConsumerPump, DeadLetterReason, RecordOutcome, RecordProcessor};
pub use worker_pool::WorkerPool;
