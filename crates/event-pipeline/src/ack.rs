//! 消息确认闸门
//!
//! 每条消息在收到时领取一个 [`PendingAck`]，它只能以值的方式被消费一次：
//! `ack_success` 或 `ack_after_dead_letter` 二选一。
//! 未确认就被丢弃的 `PendingAck`（关闭、任务取消）不会提交任何 offset，
//! 重启后消息会被重新投递。
//!
//! Kafka 的 offset 提交是异步的：这里记录的提交失败只包括请求未能发出，
//! broker 端的拒绝由 `pipeline_shared::kafka::CommitReportingContext` 回调记录，
//! 两者计入同一个 `pipeline_commit_failures_total` 指标。

use std::sync::Arc;

use pipeline_shared::config::AckMode;
use pipeline_shared::kafka::{RawRecord, RecordPosition};
use pipeline_shared::observability::metrics;
use tracing::{debug, error, warn};

use crate::ports::RecordCommitter;

/// 消息的终态动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Success,
    DeadLettered,
}

/// 确认闸门，按确认模式决定终态时是否提交 offset
#[derive(Clone)]
pub struct AcknowledgmentGate {
    committer: Arc<dyn RecordCommitter>,
    mode: AckMode,
}

impl AcknowledgmentGate {
    pub fn new(committer: Arc<dyn RecordCommitter>, mode: AckMode) -> Self {
        Self { committer, mode }
    }

    pub fn mode(&self) -> AckMode {
        self.mode
    }

    /// 收到消息时调用
    ///
    /// 自动模式下 offset 已由客户端在交付时存储，这里不会再提交。
    pub fn receive(&self, record: &RawRecord) -> PendingAck {
        PendingAck {
            position: record.position(),
            committer: self.committer.clone(),
            mode: self.mode,
            settled: false,
        }
    }
}

/// 单条消息待完成的确认
#[must_use = "未确认的消息会在重启后被重新投递"]
pub struct PendingAck {
    position: RecordPosition,
    committer: Arc<dyn RecordCommitter>,
    mode: AckMode,
    settled: bool,
}

impl PendingAck {
    pub fn position(&self) -> &RecordPosition {
        &self.position
    }

    /// 业务处理成功后确认
    pub async fn ack_success(self) -> AckOutcome {
        self.settle(AckOutcome::Success).await
    }

    /// 死信发布（无论成功与否）之后确认
    pub async fn ack_after_dead_letter(self) -> AckOutcome {
        self.settle(AckOutcome::DeadLettered).await
    }

    async fn settle(mut self, outcome: AckOutcome) -> AckOutcome {
        self.settled = true;

        if self.mode == AckMode::Manual {
            // 提交失败不影响终态：offset 未推进时消息可能被重复投递，符合至少一次语义
            if let Err(e) = self.committer.commit(&self.position).await {
                error!(
                    position = %self.position,
                    error = %e,
                    "提交 offset 失败，消息可能被重复投递"
                );
                metrics::record_commit_failure(&self.position.topic);
            }
        }

        debug!(position = %self.position, ?outcome, mode = %self.mode, "消息已确认");
        outcome
    }
}

impl Drop for PendingAck {
    fn drop(&mut self) {
        if !self.settled {
            warn!(
                position = %self.position,
                "消息未确认即被放弃，重启后将重新投递"
            );
        }
    }
}
