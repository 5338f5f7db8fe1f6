// ==========================================
// 数据传输系统 - 领域模型层
// ==========================================
// 职责: 定义传输任务、字段、单元格、进度等领域类型
// 红线: 不含数据访问逻辑,不含管道逻辑
// ==========================================

pub mod field;
pub mod progress;
pub mod task;
pub mod types;

// 重导出核心类型
pub use field::{CanonicalRow, CellValue, FieldSpec, FieldType, RawRow};
pub use progress::ProgressSnapshot;
pub use task::{compose_task_name, format_duration, ExecutionContext, TaskProperties, TransferTask};
pub use types::{ApprovalStatus, ExportMode, TaskKind, TaskStatus};
