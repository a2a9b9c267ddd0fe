//! 重试策略与执行器
//!
//! 提供固定间隔与指数退避（带抖动）两种延迟策略，用于瞬时故障的自动恢复。
//! 不可重试的错误（如载荷校验失败）不应被重试——由调用方通过 `is_retryable` 闭包控制。

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// DelayStrategy — 重试间隔策略
// ---------------------------------------------------------------------------

/// 两次尝试之间的等待策略
#[derive(Debug, Clone, PartialEq)]
pub enum DelayStrategy {
    /// 每次重试前等待相同时长
    Fixed(Duration),
    /// 指数退避：initial_delay * multiplier^retry，不超过 max_delay，
    /// 再叠加 ±jitter 比例的随机偏移，避免大量消费者同时重试形成风暴
    Backoff {
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
        jitter: f64,
    },
}

impl DelayStrategy {
    /// 未叠加抖动的基础等待时间（retry 从 0 开始，表示第几次重试）
    pub fn base_delay(&self, retry: u32) -> Duration {
        match self {
            Self::Fixed(delay) => *delay,
            Self::Backoff {
                initial_delay,
                max_delay,
                multiplier,
                ..
            } => {
                let base_ms = initial_delay.as_millis() as f64;
                let delay_ms = base_ms * multiplier.powi(retry as i32);
                let capped_ms = delay_ms.min(max_delay.as_millis() as f64);
                Duration::from_millis(capped_ms as u64)
            }
        }
    }

    /// 实际等待时间
    ///
    /// 抖动区间为 [base - base*jitter, base + base*jitter]，
    /// 并被夹在 [initial_delay, max_delay] 之内。
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry);
        let Self::Backoff {
            initial_delay,
            max_delay,
            jitter,
            ..
        } = self
        else {
            return base;
        };

        if *jitter <= 0.0 || base.is_zero() {
            return base;
        }

        let base_ms = base.as_millis() as f64;
        let offset_ms = base_ms * jitter.min(1.0);
        let low = (base_ms - offset_ms).max(initial_delay.as_millis() as f64);
        let high = (base_ms + offset_ms).min(max_delay.as_millis() as f64);
        if high <= low {
            return base;
        }

        let ms = rand::rng().random_range(low..=high);
        Duration::from_millis(ms as u64)
    }
}

// ---------------------------------------------------------------------------
// RetryPolicy — 重试策略配置
// ---------------------------------------------------------------------------

/// 重试策略配置
///
/// `max_attempts` 为总尝试次数（含首次执行）。
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: DelayStrategy,
}

impl Default for RetryPolicy {
    /// 默认策略：最多尝试 3 次，指数退避 1 秒起步、30 秒封顶、倍数 2.0、抖动 0.5
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: DelayStrategy::Backoff {
                initial_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(30),
                multiplier: 2.0,
                jitter: 0.5,
            },
        }
    }
}

impl RetryPolicy {
    /// 固定间隔策略
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay: DelayStrategy::Fixed(delay),
        }
    }

    /// 指数退避策略
    pub fn backoff(
        max_attempts: u32,
        initial_delay: Duration,
        max_delay: Duration,
        jitter: f64,
    ) -> Self {
        Self {
            max_attempts,
            delay: DelayStrategy::Backoff {
                initial_delay,
                max_delay,
                multiplier: 2.0,
                jitter,
            },
        }
    }

    /// 已执行 `attempts` 次后是否还允许再尝试
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// 第 `attempts` 次失败后到下一次尝试之间的等待时间
    pub fn delay_after_attempt(&self, attempts: u32) -> Duration {
        self.delay.delay_for_retry(attempts.saturating_sub(1))
    }
}

// ---------------------------------------------------------------------------
// RetryState — 单次执行过程中的重试状态
// ---------------------------------------------------------------------------

/// 一次带重试执行的中间状态，仅在该次执行期间存在
#[derive(Debug)]
pub struct RetryState<E> {
    /// 已执行的尝试次数
    pub attempt: u32,
    pub last_error: Option<E>,
    pub next_delay: Option<Duration>,
}

impl<E> RetryState<E> {
    fn new() -> Self {
        Self {
            attempt: 0,
            last_error: None,
            next_delay: None,
        }
    }
}

/// 带重试执行的最终报告
#[derive(Debug)]
pub struct RetryReport<T, E> {
    /// 成功值，或最后一次尝试的原始错误
    pub result: Result<T, E>,
    /// 实际执行的尝试次数
    pub attempts: u32,
}

// ---------------------------------------------------------------------------
// retry_with_policy — 带重试的异步执行器
// ---------------------------------------------------------------------------

/// 带重试的异步执行器
///
/// 用尽尝试次数后原样返回最后一次的错误，不做类型转换，
/// 便于死信记录保留真实的失败原因。
pub async fn retry_with_policy<F, Fut, T, E>(
    policy: &RetryPolicy,
    operation_name: &str,
    is_retryable: impl Fn(&E) -> bool,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    retry_with_report(policy, operation_name, is_retryable, operation)
        .await
        .result
}

/// 与 [`retry_with_policy`] 相同，额外返回实际尝试次数
pub async fn retry_with_report<F, Fut, T, E>(
    policy: &RetryPolicy,
    operation_name: &str,
    is_retryable: impl Fn(&E) -> bool,
    mut operation: F,
) -> RetryReport<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut state: RetryState<E> = RetryState::new();

    loop {
        state.attempt += 1;

        match operation().await {
            Ok(value) => {
                if state.attempt > 1 {
                    info!(
                        operation = operation_name,
                        attempt = state.attempt,
                        "操作在重试后成功"
                    );
                }
                return RetryReport {
                    result: Ok(value),
                    attempts: state.attempt,
                };
            }
            Err(err) => {
                // 非瞬时错误不重试，直接返回
                if !is_retryable(&err) {
                    warn!(
                        operation = operation_name,
                        attempt = state.attempt,
                        error = %err,
                        "操作失败且不可重试，直接返回错误"
                    );
                    return RetryReport {
                        result: Err(err),
                        attempts: state.attempt,
                    };
                }

                if !policy.should_retry(state.attempt) {
                    warn!(
                        operation = operation_name,
                        attempt = state.attempt,
                        max_attempts = policy.max_attempts,
                        error = %err,
                        "已达最大尝试次数，放弃重试"
                    );
                    return RetryReport {
                        result: Err(err),
                        attempts: state.attempt,
                    };
                }

                let delay = policy.delay_after_attempt(state.attempt);
                warn!(
                    operation = operation_name,
                    attempt = state.attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "操作失败，将在退避后重试"
                );
                state.last_error = Some(err);
                state.next_delay = Some(delay);

                tokio::time::sleep(delay).await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// 单元测试
// ---------------------------------------------------------------------------
