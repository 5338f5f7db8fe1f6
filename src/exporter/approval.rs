// ==========================================
// 数据传输系统 - 导出审核门
// ==========================================
// 职责: 判断导出类型是否需要审核、创建审核申请、查询当前审核状态
// 说明:
// - 审核流程本身在外部系统，这里只定义接口
// - PolicyApprovalGate: 按审核类型集合判断，审核结果以持久记录为准
// ==========================================

use crate::domain::task::TransferTask;
use crate::domain::types::ApprovalStatus;
use std::collections::HashSet;
use std::sync::Mutex;
use tracing::info;

/// 不需要审核时自动通过的系统意见
pub const AUTO_APPROVAL_COMMENT: &str = "无需审核";

pub trait ApprovalGate: Send + Sync {
    /// 该审核类型是否需要审核
    fn is_approval_required(&self, approval_type: &str) -> bool;

    /// 为任务创建审核申请（Err 为失败原因）
    fn create_approval_request(&self, task: &TransferTask) -> Result<(), String>;

    /// 任务当前审核状态
    fn current_status(&self, task: &TransferTask) -> Result<ApprovalStatus, String>;
}

// ==========================================
// PolicyApprovalGate
// ==========================================
#[derive(Debug, Default)]
pub struct PolicyApprovalGate {
    required_types: HashSet<String>,
    requested: Mutex<Vec<String>>,
}

impl PolicyApprovalGate {
    /// 所有导出均无需审核
    pub fn permissive() -> Self {
        Self::default()
    }

    /// 指定需要审核的类型
    pub fn requiring<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            required_types: types.into_iter().map(Into::into).collect(),
            requested: Mutex::new(Vec::new()),
        }
    }

    /// 已创建审核申请的任务 ID
    pub fn requested_tasks(&self) -> Vec<String> {
        self.requested
            .lock()
            .map(|ids| ids.clone())
            .unwrap_or_default()
    }
}

impl ApprovalGate for PolicyApprovalGate {
    fn is_approval_required(&self, approval_type: &str) -> bool {
        self.required_types.contains(approval_type)
    }

    fn create_approval_request(&self, task: &TransferTask) -> Result<(), String> {
        let mut requested = self
            .requested
            .lock()
            .map_err(|e| format!("审核申请登记失败: {}", e))?;
        requested.push(task.task_id.clone());
        info!(task_id = %task.task_id, task_name = %task.task_name, "已创建导出审核申请");
        Ok(())
    }

    fn current_status(&self, task: &TransferTask) -> Result<ApprovalStatus, String> {
        Ok(task.approval_status.unwrap_or(ApprovalStatus::Pending))
    }
}
