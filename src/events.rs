// ==========================================
// 数据传输系统 - 任务完成事件
// ==========================================
// 职责: 定义任务终态事件与发布 trait
// 说明: 管道在 done / failed 迁移后发布事件，由外部调度层订阅（如通知用户）
// ==========================================

use crate::domain::types::{TaskKind, TaskStatus};
use serde::{Deserialize, Serialize};
use std::error::Error;
use tokio::sync::mpsc;

/// 任务终态事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferEvent {
    pub task_id: String,
    pub kind: TaskKind,
    /// 任务名称
    pub title: String,
    /// Done 或 Failed
    pub status: TaskStatus,
    pub creator_id: i64,
    pub total_rows: Option<u64>,
    pub error_rows: u64,
    /// 导入错误报告
    pub error_report_path: Option<String>,
    /// 导出文件
    pub file_path: Option<String>,
    /// 失败原因
    pub message: Option<String>,
}

impl TransferEvent {
    /// 通知文案，如 "员工导入_202406071530_ab12cd34完成"
    pub fn summary(&self) -> String {
        match self.status {
            TaskStatus::Failed => format!(
                "{}失败: {}",
                self.title,
                self.message.as_deref().unwrap_or("未知错误")
            ),
            _ if self.error_rows > 0 => {
                format!("{}完成，{} 行数据异常", self.title, self.error_rows)
            }
            _ => format!("{}完成", self.title),
        }
    }
}

// ==========================================
// 事件发布 Trait
// ==========================================

/// 事件发布者
///
/// # 实现说明
/// - 发布失败只记录日志，不影响任务终态
pub trait TransferEventPublisher: Send + Sync {
    fn publish(&self, event: TransferEvent) -> Result<(), Box<dyn Error + Send + Sync>>;
}

/// 空操作事件发布者
///
/// 用于不需要事件发布的场景（如单元测试）
#[derive(Debug, Clone, Default)]
pub struct NoOpEventPublisher;

impl TransferEventPublisher for NoOpEventPublisher {
    fn publish(&self, event: TransferEvent) -> Result<(), Box<dyn Error + Send + Sync>> {
        tracing::debug!(
            task_id = %event.task_id,
            status = %event.status,
            "NoOpEventPublisher: 跳过事件发布"
        );
        Ok(())
    }
}

/// 日志事件发布者（CLI 使用，通知文案写入日志）
#[derive(Debug, Clone, Default)]
pub struct TracingEventPublisher;

impl TransferEventPublisher for TracingEventPublisher {
    fn publish(&self, event: TransferEvent) -> Result<(), Box<dyn Error + Send + Sync>> {
        match event.status {
            TaskStatus::Failed => tracing::error!(task_id = %event.task_id, "{}", event.summary()),
            _ => tracing::info!(task_id = %event.task_id, "{}", event.summary()),
        }
        Ok(())
    }
}

/// 通道事件发布者（订阅方持有接收端）
#[derive(Debug, Clone)]
pub struct ChannelEventPublisher {
    sender: mpsc::UnboundedSender<TransferEvent>,
}

impl ChannelEventPublisher {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TransferEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl TransferEventPublisher for ChannelEventPublisher {
    fn publish(&self, event: TransferEvent) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.sender
            .send(event)
            .map_err(|e| format!("事件通道已关闭: task_id={}", e.0.task_id).into())
    }
}

/// 发布事件，失败仅告警
pub(crate) fn publish_or_warn(publisher: &dyn TransferEventPublisher, event: TransferEvent) {
    let task_id = event.task_id.clone();
    if let Err(e) = publisher.publish(event) {
        tracing::warn!(task_id = %task_id, error = %e, "任务事件发布失败");
    }
}
