//! 配置管理模块
//!
//! 支持多格式配置文件加载，环境变量覆盖，以及类型安全的配置访问。
//! 每个监听器（listener）独立配置 topic、重试、工作池与确认模式。

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::error::PipelineError;
use crate::retry::{DelayStrategy, RetryPolicy};

/// Kafka 配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KafkaConfig {
    pub brokers: String,
    pub consumer_group: String,
    pub auto_offset_reset: String,
    pub session_timeout_ms: u64,
    /// 生产者投递超时，超时后由上层决定是否记录失败
    pub message_timeout_ms: u64,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            consumer_group: "event-pipeline".to_string(),
            auto_offset_reset: "earliest".to_string(),
            session_timeout_ms: 45_000,
            message_timeout_ms: 5_000,
        }
    }
}

/// 可观测性配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// 服务名称，由 AppConfig 注入
    pub service_name: String,
    pub log_level: String,
    /// 是否输出 JSON 结构化日志
    pub json_logs: bool,
    pub metrics_enabled: bool,
    pub metrics_port: u16,
    /// OpenTelemetry OTLP 端点，为空时不导出追踪数据
    pub otlp_endpoint: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown-service".to_string(),
            log_level: "info".to_string(),
            json_logs: false,
            metrics_enabled: true,
            metrics_port: 9090,
            otlp_endpoint: None,
        }
    }
}

impl ObservabilityConfig {
    pub fn with_service_name(mut self, service_name: &str) -> Self {
        self.service_name = service_name.to_string();
        self
    }
}

/// 确认（offset 提交）模式
///
/// 没有默认值：自动提交会在处理前就推进 offset，进程崩溃时消息会丢失，
/// 必须由每个监听器显式选择。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckMode {
    /// 终态动作（成功或写入死信）完成后才提交
    Manual,
    /// 收到消息即由客户端自动提交
    Auto,
}

impl std::fmt::Display for AckMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Manual => write!(f, "manual"),
            Self::Auto => write!(f, "auto"),
        }
    }
}

/// 延迟策略类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DelayKind {
    Fixed,
    Backoff,
}

/// 重试配置（毫秒为单位，便于在 TOML 和环境变量中书写）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub strategy: DelayKind,
    /// fixed 策略的间隔，或 backoff 策略的初始间隔
    pub delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            strategy: DelayKind::Backoff,
            delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: 0.5,
        }
    }
}

impl RetryConfig {
    pub fn to_policy(&self) -> RetryPolicy {
        let delay = match self.strategy {
            DelayKind::Fixed => DelayStrategy::Fixed(Duration::from_millis(self.delay_ms)),
            DelayKind::Backoff => DelayStrategy::Backoff {
                initial_delay: Duration::from_millis(self.delay_ms),
                max_delay: Duration::from_millis(self.max_delay_ms),
                multiplier: self.multiplier,
                jitter: self.jitter,
            },
        };
        RetryPolicy {
            max_attempts: self.max_attempts,
            delay,
        }
    }
}

/// 订阅流级别的容错配置
///
/// 连续拉取失败达到 `retry.max_attempts` 后重新订阅；
/// 重新订阅超过 `max_resubscribes` 次仍无法恢复则视为致命错误。
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub retry: RetryConfig,
    pub max_resubscribes: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig {
                max_attempts: 5,
                ..RetryConfig::default()
            },
            max_resubscribes: 3,
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_workers() -> usize {
    16
}

fn default_max_queued() -> usize {
    128
}

/// 单个监听器配置
#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    pub topic: String,
    /// 必填，见 [`AckMode`]
    pub ack_mode: AckMode,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_max_queued")]
    pub max_queued: usize,
    #[serde(default)]
    pub stream: StreamConfig,
    /// 关闭时等待在途消息完成的时间，超时后直接放弃（不提交，重启后重投）
    #[serde(default)]
    pub shutdown_grace_ms: u64,
}

impl ListenerConfig {
    pub fn new(topic: impl Into<String>, ack_mode: AckMode) -> Self {
        Self {
            topic: topic.into(),
            ack_mode,
            retry: RetryConfig {
                max_attempts: default_max_attempts(),
                ..RetryConfig::default()
            },
            workers: default_workers(),
            max_queued: default_max_queued(),
            stream: StreamConfig::default(),
            shutdown_grace_ms: 0,
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// 校验取值范围，避免以 0 个 worker 或 0 次尝试启动
    pub fn validate(&self, name: &str) -> Result<(), PipelineError> {
        let invalid = |field: &str, message: &str| PipelineError::InvalidConfig {
            field: format!("listeners.{name}.{field}"),
            message: message.to_string(),
        };

        if self.topic.trim().is_empty() {
            return Err(invalid("topic", "不能为空"));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "必须大于 0"));
        }
        if self.workers == 0 {
            return Err(invalid("workers", "必须大于 0"));
        }
        if self.max_queued < self.workers {
            return Err(invalid("max_queued", "不能小于 workers"));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(invalid("retry.jitter", "必须在 0 到 1 之间"));
        }
        if self.stream.retry.max_attempts == 0 {
            return Err(invalid("stream.retry.max_attempts", "必须大于 0"));
        }
        Ok(())
    }
}

/// 应用配置
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    pub service_name: String,
    pub environment: String,
    #[serde(default)]
    pub kafka: KafkaConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
    /// 监听器名称 -> 配置
    #[serde(default)]
    pub listeners: BTreeMap<String, ListenerConfig>,
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序（后加载的会覆盖先加载的同名配置项）：
    /// 1. .env 文件（如存在）
    /// 2. config/default.toml
    /// 3. config/{environment}.toml
    /// 4. config/{service_name}.toml
    /// 5. 环境变量（PIPELINE_ 前缀，`__` 分隔层级，如 PIPELINE_KAFKA__BROKERS -> kafka.brokers）
    pub fn load(service_name: &str) -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let env = std::env::var("PIPELINE_ENV").unwrap_or_else(|_| "development".to_string());
        let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".to_string());

        let builder = Config::builder()
            .set_default("service_name", service_name)?
            .set_default("environment", env.clone())?
            .add_source(File::from(Path::new(&config_dir).join("default.toml")).required(false))
            .add_source(
                File::from(Path::new(&config_dir).join(format!("{}.toml", env))).required(false),
            )
            .add_source(
                File::from(Path::new(&config_dir).join(format!("{}.toml", service_name)))
                    .required(false),
            )
            .add_source(
                Environment::with_prefix("PIPELINE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// 按名称获取监听器配置并校验
    pub fn listener(&self, name: &str) -> Result<&ListenerConfig, PipelineError> {
        let listener = self
            .listeners
            .get(name)
            .ok_or_else(|| PipelineError::InvalidConfig {
                field: format!("listeners.{name}"),
                message: "未配置该监听器".to_string(),
            })?;
        listener.validate(name)?;
        Ok(listener)
    }
}
