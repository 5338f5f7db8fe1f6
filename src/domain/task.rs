// ==========================================
// 数据传输系统 - 传输任务领域模型
// ==========================================
// 职责: 传输任务持久记录、任务附加参数、执行上下文
// 对齐: transfer_records 表
// ==========================================

use crate::domain::types::{ApprovalStatus, ExportMode, TaskKind, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ==========================================
// TransferTask - 传输任务记录
// ==========================================
// 红线: status 只能前进，file_path（导出）一经写入不可修改
// 用途: 管道只通过 开始/完成/失败 三个迁移点修改
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferTask {
    // ===== 标识 =====
    pub task_id: String,   // 任务 ID（不透明令牌）
    pub task_name: String, // 任务名称（标题_时间_随机串）
    pub kind: TaskKind,    // import / export
    pub handler: String,   // 注册表中的导入器/导出器键
    pub creator_id: i64,   // 创建者

    // ===== 状态 =====
    pub status: TaskStatus,
    pub file_path: Option<String>, // 导入: 源文件; 导出: 生成文件（首次物化后写入）
    pub properties: TaskProperties,
    pub error: Option<String>,           // 失败原因
    pub error_file_path: Option<String>, // 错误报告文件
    pub total_count: Option<u64>,        // 总数据量

    // ===== 时间 =====
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration: Option<String>, // HH:MM:SS

    // ===== 审核（仅导出） =====
    pub approver_id: Option<i64>,
    pub approval_status: Option<ApprovalStatus>,
    pub approval_comment: Option<String>,
    pub approval_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransferTask {
    /// 创建待处理任务
    pub fn new_pending(
        task_id: String,
        task_name: String,
        kind: TaskKind,
        handler: String,
        creator_id: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            task_id,
            task_name,
            kind,
            handler,
            creator_id,
            status: TaskStatus::Pending,
            file_path: None,
            properties: TaskProperties::default(),
            error: None,
            error_file_path: None,
            total_count: None,
            started_at: None,
            ended_at: None,
            duration: None,
            approver_id: None,
            approval_status: None,
            approval_comment: None,
            approval_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_approved(&self) -> bool {
        self.approval_status == Some(ApprovalStatus::Approved)
    }
}

/// 任务名称: `<标题>_<YYYYMMDDhhmm>_<8位随机串>`
pub fn compose_task_name(title: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{}_{}_{}",
        title.trim(),
        chrono::Local::now().format("%Y%m%d%H%M"),
        &suffix[..8]
    )
}

/// 耗时格式化为 HH:MM:SS（小时不截断）
pub fn format_duration(seconds: i64) -> String {
    let seconds = seconds.max(0);
    format!(
        "{:02}:{:02}:{:02}",
        seconds / 3600,
        (seconds % 3600) / 60,
        seconds % 60
    )
}

// ==========================================
// TaskProperties - 任务附加参数（JSON 列）
// ==========================================
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskProperties {
    /// 导出模式
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<ExportMode>,
    /// 申请导出的字段（表头）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_fields: Option<Vec<String>>,
    /// 审核人核定的字段，优先于 request_fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_fields: Option<Vec<String>>,
    /// 模式参数（ID 列表或筛选条件）
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
    /// 导入: 用户确认的列头（与字段按位置对应）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Vec<String>>,
    /// 导入: 表头行数（1 或 2）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading_rows: Option<u8>,
}

impl TaskProperties {
    /// 实际导出的字段: approved_fields > request_fields
    pub fn effective_fields(&self) -> Option<&[String]> {
        self.approved_fields
            .as_deref()
            .filter(|f| !f.is_empty())
            .or_else(|| self.request_fields.as_deref().filter(|f| !f.is_empty()))
    }
}

// ==========================================
// ExecutionContext - 显式执行上下文
// ==========================================
// 管道代码不读取任何全局"当前用户/当前请求"，由入口显式传入
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub user_id: i64,
    /// 超级管理员可绕过导出审核
    pub is_admin: bool,
    /// 请求附加参数，透传给导入器/导出器
    #[serde(default)]
    pub request_params: Value,
}

impl ExecutionContext {
    pub fn user(user_id: i64) -> Self {
        Self {
            user_id,
            is_admin: false,
            request_params: Value::Null,
        }
    }

    pub fn admin(user_id: i64) -> Self {
        Self {
            user_id,
            is_admin: true,
            request_params: Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compose_task_name() {
        let name = compose_task_name("员工导出");
        let parts: Vec<&str> = name.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "员工导出");
        assert_eq!(parts[1].len(), 12);
        assert_eq!(parts[2].len(), 8);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0), "00:00:00");
        assert_eq!(format_duration(3725), "01:02:05");
        assert_eq!(format_duration(-5), "00:00:00");
        assert_eq!(format_duration(100 * 3600), "100:00:00");
    }

    #[test]
    fn test_effective_fields_prefers_approved() {
        let props = TaskProperties {
            request_fields: Some(vec!["A".into(), "B".into()]),
            approved_fields: Some(vec!["A".into()]),
            ..Default::default()
        };
        assert_eq!(props.effective_fields(), Some(&["A".to_string()][..]));
    }

    #[test]
    fn test_effective_fields_ignores_empty_lists() {
        let props = TaskProperties {
            request_fields: Some(vec!["A".into()]),
            approved_fields: Some(vec![]),
            ..Default::default()
        };
        assert_eq!(props.effective_fields(), Some(&["A".to_string()][..]));

        let empty = TaskProperties::default();
        assert!(empty.effective_fields().is_none());
    }

    #[test]
    fn test_properties_json_shape() {
        let props = TaskProperties {
            mode: Some(ExportMode::Selection),
            request_fields: Some(vec!["名称".into()]),
            params: serde_json::json!([3, 7, 9]),
            ..Default::default()
        };
        let json = serde_json::to_value(&props).unwrap();
        assert_eq!(json["mode"], "selection");
        assert_eq!(json["params"], serde_json::json!([3, 7, 9]));
        assert!(json.get("approved_fields").is_none());
    }
}
