//! 消费主循环
//!
//! 每条消息的生命周期：
//!
//! ```text
//! RECEIVED -> DECODING -> DECODE_FAILED -> DEAD_LETTERED -> ACKED
//!                      -> DECODED -> INVOKING -> SUCCESS -> ACKED
//!                                             -> RETRYING -> INVOKING
//!                                             -> RETRIES_EXHAUSTED -> DEAD_LETTERED -> ACKED
//!                                             -> PERMANENT_FAILURE -> DEAD_LETTERED -> ACKED
//! ```
//!
//! 单条消息的任何失败都不会让 pump 停止。只有订阅流本身无法恢复
//! （出现不可重试的拉取错误，或连续拉取失败且重新订阅次数用尽）时，
//! `run` 才返回 [`ConsumerError::Infrastructure`]，由宿主进程退出交给进程管理器重启。

use std::sync::Arc;
use std::time::{Duration, Instant};

use pipeline_shared::config::ListenerConfig;
use pipeline_shared::error::PipelineError;
use pipeline_shared::kafka::RawRecord;
use pipeline_shared::observability::{self, metrics};
use pipeline_shared::retry::{RetryPolicy, retry_with_report};
use tokio::sync::watch;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::ack::{AcknowledgmentGate, PendingAck};
use crate::dlq::DeadLetterSink;
use crate::envelope::EnvelopeCodec;
use crate::error::{ConsumerError, HandlerError};
use crate::invoker::UseCaseInvoker;
use crate::ports::{RecordCommitter, RecordPublisher, RecordSource};
use crate::worker_pool::{Job, WorkerPool, shard_key};

// ---------------------------------------------------------------------------
// RecordOutcome — 单条消息的处理结果
// ---------------------------------------------------------------------------

/// 进入死信队列的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterReason {
    DecodeFailed,
    PermanentFailure,
    RetriesExhausted,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DecodeFailed => "decode_failed",
            Self::PermanentFailure => "permanent_failure",
            Self::RetriesExhausted => "retries_exhausted",
        }
    }
}

/// 单条消息的终态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Succeeded {
        attempts: u32,
    },
    DeadLettered {
        reason: DeadLetterReason,
        /// 业务调用次数，解码失败时为 0
        attempts: u32,
        error: String,
        /// 死信是否发布成功；失败时消息照常确认
        published: bool,
    },
}

impl RecordOutcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Succeeded { .. } => "success",
            Self::DeadLettered { .. } => "dead_lettered",
        }
    }
}

// ---------------------------------------------------------------------------
// RecordProcessor — 单条消息的处理流程
// ---------------------------------------------------------------------------

/// 单条消息的处理流程：解码、带重试的业务调用、死信、确认
pub struct RecordProcessor<T, O> {
    topic: String,
    codec: EnvelopeCodec<T>,
    invoker: UseCaseInvoker<T, O>,
    retry: RetryPolicy,
    dead_letter: DeadLetterSink,
}

impl<T, O> RecordProcessor<T, O>
where
    T: Send + Sync + 'static,
    O: Send + 'static,
{
    pub fn new(
        topic: impl Into<String>,
        codec: EnvelopeCodec<T>,
        invoker: UseCaseInvoker<T, O>,
        retry: RetryPolicy,
        dead_letter: DeadLetterSink,
    ) -> Self {
        Self {
            topic: topic.into(),
            codec,
            invoker,
            retry,
            dead_letter,
        }
    }

    /// 处理一条消息直到确认
    ///
    /// 每条消息恰好确认一次：成功走 `ack_success`，其余路径在死信发布后走
    /// `ack_after_dead_letter`，死信发布失败也不例外。
    pub async fn process(&self, record: RawRecord, pending: PendingAck) -> RecordOutcome {
        let span = info_span!(
            "process_record",
            topic = %record.topic,
            partition = record.partition,
            offset = record.offset
        );
        observability::tracing::set_parent_from_headers(&span, &record.headers);

        self.process_in_span(record, pending).instrument(span).await
    }

    async fn process_in_span(&self, record: RawRecord, pending: PendingAck) -> RecordOutcome {
        let started = Instant::now();
        let key = record.key.as_deref();

        let outcome = match self.codec.decode_record(&record) {
            Err(e) => {
                warn!(error = %e, "消息解码失败，不重试，直接发送到死信队列");
                let error = e.to_string();
                let published = self.dead_letter.send_or_log(key, &e.raw, &error).await;
                RecordOutcome::DeadLettered {
                    reason: DeadLetterReason::DecodeFailed,
                    attempts: 0,
                    error,
                    published,
                }
            }
            Ok(envelope) => {
                debug!(
                    event_id = %envelope.event_id,
                    event_type = %envelope.event_type,
                    event_version = %envelope.event_version,
                    "事件解码成功"
                );

                let mut attempt: u32 = 0;
                let report = retry_with_report(
                    &self.retry,
                    &self.topic,
                    HandlerError::is_retryable,
                    || {
                        attempt += 1;
                        if attempt > 1 {
                            metrics::record_retry(&self.topic);
                        }
                        self.invoker.invoke(&envelope.payload)
                    },
                )
                .await;

                match report.result {
                    Ok(_) => {
                        info!(
                            event_id = %envelope.event_id,
                            attempts = report.attempts,
                            "事件处理成功"
                        );
                        RecordOutcome::Succeeded {
                            attempts: report.attempts,
                        }
                    }
                    Err(err) => {
                        let reason = if err.is_retryable() {
                            DeadLetterReason::RetriesExhausted
                        } else {
                            DeadLetterReason::PermanentFailure
                        };
                        error!(
                            event_id = %envelope.event_id,
                            attempts = report.attempts,
                            reason = reason.as_str(),
                            error = %err,
                            "事件处理失败，发送到死信队列"
                        );
                        let error = err.to_string();
                        let published = self
                            .dead_letter
                            .send_or_log(key, &record.value_lossy(), &error)
                            .await;
                        RecordOutcome::DeadLettered {
                            reason,
                            attempts: report.attempts,
                            error,
                            published,
                        }
                    }
                }
            }
        };

        match &outcome {
            RecordOutcome::Succeeded { .. } => {
                pending.ack_success().await;
            }
            RecordOutcome::DeadLettered { reason, .. } => {
                metrics::record_dead_letter(&self.topic, reason.as_str());
                pending.ack_after_dead_letter().await;
            }
        }

        metrics::record_outcome(&self.topic, outcome.label(), started.elapsed().as_secs_f64());
        outcome
    }
}

// ---------------------------------------------------------------------------
// ConsumerPump — 拉取循环
// ---------------------------------------------------------------------------

/// 单个监听器的消费 pump
///
/// 拉取在调用 `run` 的任务上进行，解码与业务处理提交到独立的有界工作池。
pub struct ConsumerPump<T, O> {
    name: String,
    config: ListenerConfig,
    source: Arc<dyn RecordSource>,
    gate: AcknowledgmentGate,
    processor: Arc<RecordProcessor<T, O>>,
}

impl<T, O> ConsumerPump<T, O>
where
    T: Send + Sync + 'static,
    O: Send + 'static,
{
    pub fn new(
        name: &str,
        config: ListenerConfig,
        source: Arc<dyn RecordSource>,
        committer: Arc<dyn RecordCommitter>,
        publisher: Arc<dyn RecordPublisher>,
        codec: EnvelopeCodec<T>,
        invoker: UseCaseInvoker<T, O>,
    ) -> Result<Self, PipelineError> {
        config.validate(name)?;

        let dead_letter = DeadLetterSink::new(publisher, &config.topic);
        let processor = RecordProcessor::new(
            config.topic.clone(),
            codec,
            invoker,
            config.retry.to_policy(),
            dead_letter,
        );

        Ok(Self {
            name: name.to_string(),
            gate: AcknowledgmentGate::new(committer, config.ack_mode),
            config,
            source,
            processor: Arc::new(processor),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn topic(&self) -> &str {
        &self.config.topic
    }

    /// 运行消费循环，直到收到关闭信号或订阅流不可恢复
    ///
    /// 关闭时等待 `shutdown_grace`，之后仍未完成的消息被放弃且不确认。
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), ConsumerError> {
        let pool = WorkerPool::new(&self.config.topic, self.config.workers, self.config.max_queued)?;

        info!(
            listener = %self.name,
            topic = %self.config.topic,
            ack_mode = %self.config.ack_mode,
            workers = self.config.workers,
            max_queued = self.config.max_queued,
            "消费者已启动"
        );

        let result = self.poll_loop(&pool, &mut shutdown).await;

        let abandoned = pool.shutdown(self.config.shutdown_grace()).await;
        info!(
            listener = %self.name,
            topic = %self.config.topic,
            abandoned,
            "消费者已停止"
        );
        result
    }

    async fn poll_loop(
        &self,
        pool: &WorkerPool,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), ConsumerError> {
        let topic = self.config.topic.as_str();
        let stream_retry = self.config.stream.retry.to_policy();
        let max_resubscribes = self.config.stream.max_resubscribes;
        let mut consecutive_failures: u32 = 0;
        let mut resubscribes: u32 = 0;

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let polled = tokio::select! {
                biased;
                _ = shutdown.changed() => return Ok(()),
                polled = self.source.poll() => polled,
            };

            let err = match polled {
                Ok(record) => {
                    consecutive_failures = 0;
                    resubscribes = 0;
                    if self.dispatch(pool, record, shutdown).await? {
                        return Ok(());
                    }
                    continue;
                }
                Err(err) => err,
            };

            consecutive_failures += 1;
            metrics::record_stream_error(topic);

            if !err.is_retryable() {
                error!(
                    topic,
                    code = err.code(),
                    error = %err,
                    "拉取消息出现不可重试的错误，消费者退出"
                );
                metrics::record_fatal_error(topic);
                return Err(ConsumerError::Infrastructure {
                    topic: topic.to_string(),
                    message: format!("不可重试的拉取错误: {err}"),
                });
            }

            if stream_retry.should_retry(consecutive_failures) {
                let delay = stream_retry.delay_after_attempt(consecutive_failures);
                warn!(
                    topic,
                    attempt = consecutive_failures,
                    max_attempts = stream_retry.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "拉取消息失败，将在退避后重试"
                );
                if sleep_or_shutdown(delay, shutdown).await {
                    return Ok(());
                }
                continue;
            }

            if resubscribes >= max_resubscribes {
                error!(
                    topic,
                    resubscribes,
                    error = %err,
                    "订阅流无法恢复，消费者退出"
                );
                metrics::record_fatal_error(topic);
                return Err(ConsumerError::Infrastructure {
                    topic: topic.to_string(),
                    message: format!("重新订阅 {resubscribes} 次后仍无法恢复: {err}"),
                });
            }

            resubscribes += 1;
            consecutive_failures = 0;
            warn!(
                topic,
                resubscribe = resubscribes,
                max_resubscribes,
                error = %err,
                "连续拉取失败，重新订阅"
            );
            if let Err(e) = self.source.resubscribe().await {
                warn!(topic, error = %e, "重新订阅失败");
            }
        }
    }

    /// 把消息提交到工作池；在等待队列空位期间收到关闭信号时返回 true
    async fn dispatch(
        &self,
        pool: &WorkerPool,
        record: RawRecord,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<bool, ConsumerError> {
        debug!(
            topic = %record.topic,
            partition = record.partition,
            offset = record.offset,
            "收到消息"
        );

        let pending = self.gate.receive(&record);
        let shard = shard_key(&record.topic, record.partition);
        let processor = self.processor.clone();
        let job: Job = Box::pin(async move {
            processor.process(record, pending).await;
        });

        tokio::select! {
            biased;
            _ = shutdown.changed() => Ok(true),
            dispatched = pool.dispatch(shard, job) => {
                dispatched?;
                Ok(false)
            }
        }
    }
}

/// 可被关闭信号打断的等待，被打断时返回 true
async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        biased;
        _ = shutdown.changed() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}
