// ==========================================
// 数据传输系统 - 数据仓储层
// ==========================================
// 红线: Repository 不含业务逻辑
// ==========================================
// 职责: 任务记录、进度存储、SQLite 表适配，屏蔽数据库细节
// 约束: 所有值使用参数化查询
// ==========================================

pub mod error;
pub mod progress_repo;
pub mod table_adapter;
pub mod task_record_repo;

// 重导出核心仓储
pub use error::{RepositoryError, RepositoryResult};
pub use progress_repo::{MemoryProgressStore, ProgressStore, SqliteProgressStore};
pub use table_adapter::{SqliteTableExporter, SqliteTableImporter};
pub use task_record_repo::{
    ApprovalDecision, RecordFilter, SqliteTaskRecordStore, TaskCompletion, TaskRecordStore,
};
