//! 测试工具模块
//!
//! 提供 broker 端口的内存实现、可编排失败次数的用例以及测试数据构造函数，
//! 让管道的完整流程无需真实 Kafka 即可验证。

use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use pipeline_shared::config::{AckMode, DelayKind, ListenerConfig};
use pipeline_shared::error::PipelineError;
use pipeline_shared::kafka::{RawRecord, RecordPosition};
use serde_json::Value;
use tokio::sync::Notify;

use crate::dlq::DeadLetterRecord;
use crate::envelope::EventEnvelope;
use crate::error::HandlerError;
use crate::invoker::UseCase;
use crate::ports::{RecordCommitter, RecordPublisher, RecordSource};

// ==================== 测试数据构造 ====================

/// 构造一条完整的事件信封 JSON 文本
pub fn envelope_json(event_type: &str, payload: Value) -> String {
    let envelope = EventEnvelope::new(event_type, "1.0", payload);
    serde_json::to_string(&envelope).unwrap_or_default()
}

/// 构造一条消费到的消息
pub fn raw_record(topic: &str, partition: i32, offset: i64, value: &str) -> RawRecord {
    RawRecord {
        topic: topic.to_string(),
        partition,
        offset,
        key: None,
        value: value.as_bytes().to_vec(),
        timestamp: None,
        headers: HashMap::new(),
    }
}

/// 重试与订阅流退避均为 1ms 固定间隔的监听器配置
pub fn fast_listener_config(topic: &str, ack_mode: AckMode) -> ListenerConfig {
    let mut config = ListenerConfig::new(topic, ack_mode);
    config.retry.strategy = DelayKind::Fixed;
    config.retry.delay_ms = 1;
    config.stream.retry.strategy = DelayKind::Fixed;
    config.stream.retry.delay_ms = 1;
    config
}

// ==================== 内存消息源 ====================

/// 按脚本依次返回消息或错误的消息源
///
/// 脚本耗尽后 `poll` 一直挂起，直到有新的条目被推入；
/// 调用 [`InMemorySource::fail_forever`] 后则持续返回错误。
#[derive(Default)]
pub struct InMemorySource {
    script: Mutex<VecDeque<Result<RawRecord, PipelineError>>>,
    notify: Notify,
    fail_forever: AtomicBool,
    resubscribes: AtomicU32,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = RawRecord>) -> Self {
        let source = Self::new();
        for record in records {
            source.push(record);
        }
        source
    }

    pub fn push(&self, record: RawRecord) {
        self.script.lock().push_back(Ok(record));
        self.notify.notify_one();
    }

    pub fn push_error(&self, message: &str) {
        self.script
            .lock()
            .push_back(Err(PipelineError::Kafka(message.to_string())));
        self.notify.notify_one();
    }

    /// 推入指定类型的拉取错误
    pub fn push_failure(&self, error: PipelineError) {
        self.script.lock().push_back(Err(error));
        self.notify.notify_one();
    }

    pub fn fail_forever(&self) {
        self.fail_forever.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn resubscribe_count(&self) -> u32 {
        self.resubscribes.load(Ordering::SeqCst)
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().len()
    }
}

#[async_trait]
impl RecordSource for InMemorySource {
    async fn poll(&self) -> Result<RawRecord, PipelineError> {
        loop {
            if let Some(next) = self.script.lock().pop_front() {
                return next;
            }
            if self.fail_forever.load(Ordering::SeqCst) {
                return Err(PipelineError::Kafka("broker 不可达".to_string()));
            }
            self.notify.notified().await;
        }
    }

    async fn resubscribe(&self) -> Result<(), PipelineError> {
        self.resubscribes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ==================== 记录型发布器 ====================

/// 被发布的一条消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedRecord {
    pub topic: String,
    pub key: Option<String>,
    pub payload: Vec<u8>,
}

/// 记录所有发布请求，可切换为持续失败
#[derive(Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<PublishedRecord>>,
    failing: AtomicBool,
    attempts: AtomicUsize,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_publishes(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// 成功发布的消息
    pub fn published(&self) -> Vec<PublishedRecord> {
        self.published.lock().clone()
    }

    /// 发布请求总数，含失败的请求
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// 将成功发布的消息解析为死信记录
    pub fn dead_letters(&self) -> Vec<DeadLetterRecord> {
        self.published
            .lock()
            .iter()
            .filter_map(|record| serde_json::from_slice(&record.payload).ok())
            .collect()
    }
}

#[async_trait]
impl RecordPublisher for RecordingPublisher {
    async fn publish(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: &[u8],
    ) -> Result<(), PipelineError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(PipelineError::Kafka(format!("发布到 {topic} 失败")));
        }
        self.published.lock().push(PublishedRecord {
            topic: topic.to_string(),
            key: key.map(String::from),
            payload: payload.to_vec(),
        });
        Ok(())
    }
}

// ==================== 记录型提交器 ====================

/// 记录所有 offset 提交
#[derive(Default)]
pub struct RecordingCommitter {
    commits: Mutex<Vec<RecordPosition>>,
    notify: Notify,
}

impl RecordingCommitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commits(&self) -> Vec<RecordPosition> {
        self.commits.lock().clone()
    }

    /// 等待至少 `count` 次提交，超时返回 false
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.notify.notified();
                if self.commits.lock().len() >= count {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }
}

#[async_trait]
impl RecordCommitter for RecordingCommitter {
    async fn commit(&self, position: &RecordPosition) -> Result<(), PipelineError> {
        self.commits.lock().push(position.clone());
        self.notify.notify_waiters();
        Ok(())
    }
}

// ==================== 可编排的用例 ====================

#[derive(Debug, Clone)]
enum Behavior {
    Succeed,
    /// 前 n 次调用以瞬时错误失败
    FailTimes(u32),
    /// 前 n 次调用 panic
    PanicTimes(u32),
    Permanent(String),
    Block,
}

/// 按预设行为执行的用例，记录调用次数、输入与峰值并发
pub struct ScriptedUseCase {
    behavior: Behavior,
    delay: Duration,
    calls: AtomicU32,
    running: AtomicUsize,
    peak: AtomicUsize,
    inputs: Mutex<Vec<String>>,
}

impl ScriptedUseCase {
    fn with_behavior(behavior: Behavior) -> Self {
        Self {
            behavior,
            delay: Duration::ZERO,
            calls: AtomicU32::new(0),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            inputs: Mutex::new(Vec::new()),
        }
    }

    pub fn succeeding() -> Self {
        Self::with_behavior(Behavior::Succeed)
    }

    /// 前 `times` 次调用失败，错误信息为"第 N 次调用失败"
    pub fn failing_times(times: u32) -> Self {
        Self::with_behavior(Behavior::FailTimes(times))
    }

    pub fn always_failing() -> Self {
        Self::with_behavior(Behavior::FailTimes(u32::MAX))
    }

    /// 前 `times` 次调用 panic，信息为"第 N 次调用崩溃"
    pub fn panicking_times(times: u32) -> Self {
        Self::with_behavior(Behavior::PanicTimes(times))
    }

    pub fn permanent(message: &str) -> Self {
        Self::with_behavior(Behavior::Permanent(message.to_string()))
    }

    /// 永不返回，用于模拟关闭时仍在执行的消息
    pub fn blocking() -> Self {
        Self::with_behavior(Behavior::Block)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// 按调用顺序记录的输入（Debug 格式）
    pub fn inputs(&self) -> Vec<String> {
        self.inputs.lock().clone()
    }
}

#[async_trait]
impl<I: Debug + Send + 'static> UseCase<I> for ScriptedUseCase {
    type Output = ();

    async fn execute(&self, input: I) -> Result<(), HandlerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        self.inputs.lock().push(format!("{input:?}"));

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let result = match &self.behavior {
            Behavior::Succeed => Ok(()),
            Behavior::FailTimes(times) if call <= *times => {
                Err(HandlerError::transient(format!("第 {call} 次调用失败")))
            }
            Behavior::FailTimes(_) => Ok(()),
            Behavior::PanicTimes(times) if call <= *times => {
                self.running.fetch_sub(1, Ordering::SeqCst);
                panic!("第 {call} 次调用崩溃")
            }
            Behavior::PanicTimes(_) => Ok(()),
            Behavior::Permanent(message) => Err(HandlerError::permanent(message)),
            Behavior::Block => {
                futures::future::pending::<()>().await;
                Ok(())
            }
        };

        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
