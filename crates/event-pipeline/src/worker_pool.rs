//! 有界工作池
//!
//! 解码与业务处理运行在独立的多线程 runtime 上，与拉取循环隔离，
//! 阻塞或缓慢的业务逻辑不会拖住 broker 心跳与拉取。
//!
//! - 固定数量的常驻 worker，每个 worker 串行执行分配给它的任务；
//! - 任务按 `(topic, partition)` 分片路由，同一分区的消息严格按序处理；
//! - 排队加执行中的任务总数不超过 `max_queued`，达到上限时 `dispatch` 等待（背压）。

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use pipeline_shared::error::PipelineError;
use pipeline_shared::observability::metrics;
use tokio::runtime::Runtime;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// 提交给工作池的任务
pub type Job = BoxFuture<'static, ()>;

type Slot = (Job, OwnedSemaphorePermit);

/// 由 topic 与分区计算路由键
pub fn shard_key(topic: &str, partition: i32) -> u64 {
    let mut hasher = DefaultHasher::new();
    topic.hash(&mut hasher);
    partition.hash(&mut hasher);
    hasher.finish()
}

pub struct WorkerPool {
    name: String,
    senders: Vec<mpsc::UnboundedSender<Slot>>,
    permits: Arc<Semaphore>,
    max_queued: usize,
    handles: Vec<JoinHandle<()>>,
    runtime: Option<Runtime>,
}

impl WorkerPool {
    /// 创建工作池并启动全部 worker
    ///
    /// `name` 同时用作线程名前缀与 in-flight 指标的 topic 标签。
    pub fn new(name: &str, workers: usize, max_queued: usize) -> Result<Self, PipelineError> {
        if workers == 0 || max_queued < workers {
            return Err(PipelineError::InvalidConfig {
                field: "workers".to_string(),
                message: format!("workers={workers} max_queued={max_queued} 不合法"),
            });
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(workers)
            .thread_name(format!("{name}-worker"))
            .enable_all()
            .build()
            .map_err(|e| PipelineError::Internal(format!("创建工作池 runtime 失败: {e}")))?;

        let permits = Arc::new(Semaphore::new(max_queued));
        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);

        for worker_id in 0..workers {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.push(tx);
            handles.push(runtime.spawn(run_worker(
                name.to_string(),
                worker_id,
                rx,
                permits.clone(),
                max_queued,
            )));
        }

        info!(pool = name, workers, max_queued, "工作池已启动");

        Ok(Self {
            name: name.to_string(),
            senders,
            permits,
            max_queued,
            handles,
            runtime: Some(runtime),
        })
    }

    /// 提交任务，队列已满时等待空位
    pub async fn dispatch(&self, shard: u64, job: Job) -> Result<(), PipelineError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PipelineError::Internal(format!("工作池 {} 已关闭", self.name)))?;

        let index = (shard % self.senders.len() as u64) as usize;
        let sender = self
            .senders
            .get(index)
            .ok_or_else(|| PipelineError::Internal(format!("工作池 {} 没有可用 worker", self.name)))?;

        sender
            .send((job, permit))
            .map_err(|_| PipelineError::Internal(format!("worker {index} 已退出")))?;

        metrics::set_inflight(&self.name, self.in_flight());
        Ok(())
    }

    /// 已提交但尚未完成的任务数（排队中 + 执行中）
    pub fn in_flight(&self) -> usize {
        self.max_queued - self.permits.available_permits()
    }

    /// 关闭工作池
    ///
    /// 停止接收新任务，最多等待 `grace` 让已提交的任务完成，
    /// 之后丢弃剩余任务。返回被放弃的任务数。
    pub async fn shutdown(mut self, grace: Duration) -> usize {
        self.senders.clear();
        let handles = std::mem::take(&mut self.handles);

        if !grace.is_zero() {
            let drained = futures::future::join_all(handles);
            if tokio::time::timeout(grace, drained).await.is_err() {
                warn!(pool = %self.name, grace_ms = grace.as_millis() as u64, "宽限期已过，仍有任务未完成");
            }
        }

        let abandoned = self.in_flight();
        if abandoned > 0 {
            warn!(pool = %self.name, abandoned, "放弃未完成的消息，它们不会被确认");
        }

        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
        metrics::set_inflight(&self.name, 0);
        info!(pool = %self.name, "工作池已关闭");
        abandoned
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // 在异步上下文中直接 drop Runtime 会 panic
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

async fn run_worker(
    pool: String,
    worker_id: usize,
    mut rx: mpsc::UnboundedReceiver<Slot>,
    permits: Arc<Semaphore>,
    max_queued: usize,
) {
    while let Some((job, permit)) = rx.recv().await {
        if AssertUnwindSafe(job).catch_unwind().await.is_err() {
            error!(pool = %pool, worker_id, "任务发生 panic，worker 继续运行");
        }
        drop(permit);
        metrics::set_inflight(&pool, max_queued - permits.available_permits());
    }
    debug!(pool = %pool, worker_id, "worker 退出");
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::Notify;

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("条件在超时前未满足");
    }

    #[test]
    fn test_shard_key_is_stable() {
        assert_eq!(shard_key("UnitUnsuitable", 0), shard_key("UnitUnsuitable", 0));
        assert_ne!(shard_key("UnitUnsuitable", 0), shard_key("UnitUnsuitable", 1));
    }

    #[test]
    fn test_rejects_invalid_sizes() {
        assert!(WorkerPool::new("test", 0, 10).is_err());
        assert!(WorkerPool::new("test", 4, 2).is_err());
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_workers() {
        let pool = WorkerPool::new("concurrency", 3, 6).unwrap();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        for shard in 0..24u64 {
            let running = running.clone();
            let peak = peak.clone();
            let done = done.clone();
            pool.dispatch(
                shard,
                Box::pin(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    done.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();
            assert!(pool.in_flight() <= 6);
        }

        wait_until(|| done.load(Ordering::SeqCst) == 24).await;
        assert!(peak.load(Ordering::SeqCst) <= 3);
        wait_until(|| pool.in_flight() == 0).await;
        assert_eq!(pool.shutdown(Duration::ZERO).await, 0);
    }

    #[tokio::test]
    async fn test_dispatch_waits_when_queue_is_full() {
        let pool = WorkerPool::new("backpressure", 1, 2).unwrap();
        let gate = Arc::new(Notify::new());

        for _ in 0..2 {
            let gate = gate.clone();
            pool.dispatch(0, Box::pin(async move { gate.notified().await }))
                .await
                .unwrap();
        }
        assert_eq!(pool.in_flight(), 2);

        let third = pool.dispatch(0, Box::pin(async {}));
        tokio::pin!(third);
        assert!(
            tokio::time::timeout(Duration::from_millis(50), &mut third)
                .await
                .is_err()
        );

        gate.notify_one();
        tokio::time::timeout(Duration::from_secs(5), third)
            .await
            .unwrap()
            .unwrap();
        gate.notify_one();
    }

    #[tokio::test]
    async fn test_same_shard_runs_in_order() {
        let pool = WorkerPool::new("ordering", 4, 32).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let shard = shard_key("UnitUnsuitable", 2);

        for i in 0..20u64 {
            let seen = seen.clone();
            pool.dispatch(
                shard,
                Box::pin(async move {
                    // 先提交的任务睡得更久，若并发执行顺序就会被打乱
                    tokio::time::sleep(Duration::from_millis(20 - i)).await;
                    seen.lock().push(i);
                }),
            )
            .await
            .unwrap();
        }

        wait_until(|| seen.lock().len() == 20).await;
        assert_eq!(*seen.lock(), (0..20).collect::<Vec<_>>());
    }

    fn explode() {
        panic!("业务异常");
    }

    #[tokio::test]
    async fn test_panicking_job_does_not_kill_worker() {
        let pool = WorkerPool::new("panic", 1, 4).unwrap();
        let finished = Arc::new(AtomicBool::new(false));

        pool.dispatch(0, Box::pin(async { explode() }))
            .await
            .unwrap();

        let flag = finished.clone();
        pool.dispatch(0, Box::pin(async move { flag.store(true, Ordering::SeqCst) }))
            .await
            .unwrap();

        wait_until(|| finished.load(Ordering::SeqCst)).await;
        wait_until(|| pool.in_flight() == 0).await;
    }

    #[tokio::test]
    async fn test_shutdown_abandons_unfinished_jobs() {
        struct DropFlag(Arc<AtomicBool>);
        impl Drop for DropFlag {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let pool = WorkerPool::new("shutdown", 2, 4).unwrap();
        let dropped = Arc::new(AtomicBool::new(false));
        let completed = Arc::new(AtomicBool::new(false));

        let guard = DropFlag(dropped.clone());
        let flag = completed.clone();
        pool.dispatch(
            0,
            Box::pin(async move {
                let _guard = guard;
                futures::future::pending::<()>().await;
                flag.store(true, Ordering::SeqCst);
            }),
        )
        .await
        .unwrap();

        let abandoned = pool.shutdown(Duration::from_millis(20)).await;
        assert_eq!(abandoned, 1);

        wait_until(|| dropped.load(Ordering::SeqCst)).await;
        assert!(!completed.load(Ordering::SeqCst));
    }
}
