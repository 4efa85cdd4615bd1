/// 工作队列
///
/// 每次收敛尝试、每次任务推进都是一个独立的 [`Job`]。作业之间不共享内存，
/// 所有协调都经由持久化的资源/任务行完成，所以同一个作业重复投递是安全的。

pub mod dispatcher;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::models::ResourceKey;
use common::{Error, Result};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::db::models::resource::{Resource, StateGuard};

pub use dispatcher::JobDispatcher;

/// 重试基础间隔
const RETRY_BASE_DELAY_MS: u64 = 200;

#[derive(Debug, Clone, PartialEq)]
pub enum Job {
    /// 对某资源执行一次收敛，guard 为投递时的 (state, desired_state, version)
    Reconcile { resource_id: String, guard: StateGuard },
    /// 推进任务
    AdvanceTask { task_id: String },
    /// 资源到达目标状态、失败或已删除
    ResourceSettled { key: ResourceKey },
}

impl Job {
    pub fn reconcile(resource: &Resource) -> Self {
        Job::Reconcile {
            resource_id: resource.id.clone(),
            guard: resource.guard(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Job::Reconcile { .. } => "reconcile",
            Job::AdvanceTask { .. } => "advance_task",
            Job::ResourceSettled { .. } => "resource_settled",
        }
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync + 'static {
    async fn enqueue(&self, job: Job) -> Result<()>;
}

#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: &Job) -> Result<()>;
}

#[derive(Debug)]
struct Envelope {
    job: Job,
    retries: u32,
}

/// 基于 tokio mpsc 的进程内队列
#[derive(Clone)]
pub struct ChannelQueue {
    sender: mpsc::UnboundedSender<Envelope>,
}

/// 队列的消费端，交给 [`WorkerPool`]
pub struct JobReceiver {
    receiver: mpsc::UnboundedReceiver<Envelope>,
}

impl ChannelQueue {
    pub fn new() -> (Self, JobReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, JobReceiver { receiver })
    }

    fn send(&self, envelope: Envelope) -> Result<()> {
        self.sender
            .send(envelope)
            .map_err(|_| Error::Internal("作业队列已关闭".to_string()))
    }
}

#[async_trait]
impl JobQueue for ChannelQueue {
    async fn enqueue(&self, job: Job) -> Result<()> {
        debug!("入队: {:?}", job);
        self.send(Envelope { job, retries: 0 })
    }
}

/// 固定数量的 worker，共享一个接收端
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl WorkerPool {
    pub fn start(
        queue: ChannelQueue,
        receiver: JobReceiver,
        handler: Arc<dyn JobHandler>,
        worker_count: usize,
        max_retries: u32,
        cancel: CancellationToken,
    ) -> Self {
        let receiver = Arc::new(Mutex::new(receiver.receiver));
        let handles = (0..worker_count)
            .map(|worker_id| {
                let worker = Worker {
                    id: worker_id,
                    queue: queue.clone(),
                    receiver: receiver.clone(),
                    handler: handler.clone(),
                    max_retries,
                    cancel: cancel.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        info!("已启动 {} 个 worker", worker_count);
        Self { handles, cancel }
    }

    /// 停止接收新作业并等待正在执行的作业结束
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("worker 异常退出: {}", e);
            }
        }
        info!("全部 worker 已退出");
    }
}

struct Worker {
    id: usize,
    queue: ChannelQueue,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<Envelope>>>,
    handler: Arc<dyn JobHandler>,
    max_retries: u32,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(self) {
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = async { self.receiver.lock().await.recv().await } => next,
            };
            let Some(envelope) = next else {
                break;
            };

            if let Err(e) = self.handler.handle(&envelope.job).await {
                self.retry_or_drop(envelope, e);
            }
        }
        debug!("worker {} 退出", self.id);
    }

    fn retry_or_drop(&self, envelope: Envelope, err: Error) {
        if envelope.retries >= self.max_retries {
            error!(
                "作业重试 {} 次后仍失败，已丢弃: {:?}: {}",
                envelope.retries, envelope.job, err
            );
            return;
        }

        warn!(
            "作业执行失败，稍后重试 ({}/{}): {}: {}",
            envelope.retries + 1,
            self.max_retries,
            envelope.job.kind(),
            err
        );
        let delay = Duration::from_millis(RETRY_BASE_DELAY_MS << envelope.retries.min(6));
        let queue = self.queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let retry = Envelope {
                job: envelope.job,
                retries: envelope.retries + 1,
            };
            if let Err(e) = queue.send(retry) {
                warn!("重试入队失败: {}", e);
            }
        });
    }
}
