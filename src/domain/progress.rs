// ==========================================
// 数据传输系统 - 进度快照
// ==========================================
// 职责: 任务的临时进度视图（与持久记录生命周期独立）
// 红线: total 已知后 processed ≤ total；processed 单调不减
// ==========================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub task_id: String,
    pub title: String,
    pub started_at: Option<DateTime<Utc>>,
    /// 完成前为空
    pub finished_at: Option<DateTime<Utc>>,
    pub processed: u64,
    /// 扫描完成前未知
    pub total: Option<u64>,
    pub has_error: bool,
    pub error_rows: u64,
    pub failed: bool,
}

impl ProgressSnapshot {
    pub fn new(task_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            title: title.into(),
            started_at: None,
            finished_at: None,
            processed: 0,
            total: None,
            has_error: false,
            error_rows: 0,
            failed: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    /// 百分比（total 未知时为空）
    pub fn percent(&self) -> Option<f64> {
        match self.total {
            Some(0) => Some(100.0),
            Some(total) => Some((self.processed.min(total) as f64) * 100.0 / total as f64),
            None => None,
        }
    }
}
