/// Prometheus 指标

use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// 每次收敛的结果
    pub reconcile_passes: IntCounterVec,
    /// 任务项结束（完成或失败）
    pub task_items: IntCounterVec,
    /// 回调投递结果
    pub callbacks: IntCounterVec,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let reconcile_passes = IntCounterVec::new(
            Opts::new("reconcile_passes_total", "收敛执行次数"),
            &["deploy_type", "outcome"],
        )?;
        registry.register(Box::new(reconcile_passes.clone()))?;

        let task_items = IntCounterVec::new(
            Opts::new("task_items_total", "任务项结束次数"),
            &["action", "outcome"],
        )?;
        registry.register(Box::new(task_items.clone()))?;

        let callbacks = IntCounterVec::new(
            Opts::new("callbacks_total", "回调投递次数"),
            &["result"],
        )?;
        registry.register(Box::new(callbacks.clone()))?;

        Ok(Self {
            registry,
            reconcile_passes,
            task_items,
            callbacks,
        })
    }

    /// 文本格式导出
    pub fn render(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
