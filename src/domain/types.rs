// ==========================================
// 数据传输系统 - 领域类型定义
// ==========================================
// 职责: 任务类型、任务状态、审核状态、导出模式
// 序列化格式: snake_case (与数据库一致)
// ==========================================

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ==========================================
// 任务类型 (Task Kind)
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Import, // 导入
    Export, // 导出
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Import => "import",
            TaskKind::Export => "export",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "import" => Ok(TaskKind::Import),
            "export" => Ok(TaskKind::Export),
            other => Err(format!("未知任务类型: {}", other)),
        }
    }
}

// ==========================================
// 任务状态 (Task Status)
// ==========================================
// 状态机: pending → processing → {done | failed}
// 例外: 导出任务物化失败后允许 failed → processing 重试
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,    // 待处理
    Processing, // 处理中
    Done,       // 结束
    Failed,     // 失败
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
        }
    }

    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed)
    }

    /// 判断状态迁移是否合法
    ///
    /// # 参数
    /// - next: 目标状态
    /// - kind: 任务类型（仅导出任务允许失败重试）
    pub fn can_transition_to(&self, next: TaskStatus, kind: TaskKind) -> bool {
        match (self, next) {
            (TaskStatus::Pending, TaskStatus::Processing) => true,
            (TaskStatus::Processing, TaskStatus::Done) => true,
            (TaskStatus::Processing, TaskStatus::Failed) => true,
            // 启动前失败（如文件丢失）也需要落终态
            (TaskStatus::Pending, TaskStatus::Failed) => true,
            (TaskStatus::Failed, TaskStatus::Processing) => kind == TaskKind::Export,
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "done" => Ok(TaskStatus::Done),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(format!("未知任务状态: {}", other)),
        }
    }
}

// ==========================================
// 审核状态 (Approval Status)
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,  // 待审核
    Approved, // 已通过
    Rejected, // 已驳回
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApprovalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "pending" => Ok(ApprovalStatus::Pending),
            "approved" => Ok(ApprovalStatus::Approved),
            "rejected" => Ok(ApprovalStatus::Rejected),
            other => Err(format!("未知审核状态: {}", other)),
        }
    }
}

// ==========================================
// 导出模式 (Export Mode)
// ==========================================
// all: 全量查询
// page / selection: 按 ID 列表导出
// query: 结构化筛选条件
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportMode {
    All,
    Page,
    Selection,
    Query,
}

impl ExportMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportMode::All => "all",
            ExportMode::Page => "page",
            ExportMode::Selection => "selection",
            ExportMode::Query => "query",
        }
    }
}

impl fmt::Display for ExportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExportMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "all" => Ok(ExportMode::All),
            "page" => Ok(ExportMode::Page),
            "selection" => Ok(ExportMode::Selection),
            "query" => Ok(ExportMode::Query),
            other => Err(format!("未知导出模式: {}", other)),
        }
    }
}
