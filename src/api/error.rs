// ==========================================
// 数据传输系统 - API层错误类型
// ==========================================
// 职责: 将管道/仓储错误转换为调用方可直接展示的错误
// 分级:
// - 请求级（参数/任务/审核）: InvalidInput / NotFound / NotApproved / Conflict
// - 其余: TransferFailed（任务已置为 failed，消息即失败原因）
// ==========================================

use crate::error::TransferError;
use crate::repository::error::RepositoryError;
use thiserror::Error;

/// API层错误类型
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("无效输入: {0}")]
    InvalidInput(String),

    #[error("资源未找到: {0}")]
    NotFound(String),

    #[error("导出任务未审核通过: {0}")]
    NotApproved(String),

    #[error("操作冲突: {0}")]
    Conflict(String),

    #[error("传输任务失败: {0}")]
    TransferFailed(String),

    // ==========================================
    // 数据访问错误
    // ==========================================
    #[error("数据库错误: {0}")]
    DatabaseError(String),

    // ==========================================
    // 通用错误
    // ==========================================
    #[error("内部错误: {0}")]
    InternalError(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

// ==========================================
// 从 TransferError 转换
// ==========================================
impl From<TransferError> for ApiError {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::TaskNotFound(id) => ApiError::NotFound(format!("任务(id={})不存在", id)),
            TransferError::UnknownHandler(key) => {
                ApiError::NotFound(format!("处理器(key={})未注册", key))
            }
            TransferError::ExportNotApproved(id) => ApiError::NotApproved(id),
            TransferError::ExportInProgress(id) => {
                ApiError::Conflict(format!("导出任务正在生成中: {}", id))
            }
            TransferError::Repository(repo) => ApiError::from(repo),
            TransferError::InternalError(msg) => ApiError::InternalError(msg),
            TransferError::Other(e) => ApiError::Other(e),
            other if other.is_request_level() => ApiError::InvalidInput(other.to_string()),
            other => ApiError::TransferFailed(other.to_string()),
        }
    }
}

// ==========================================
// 从 RepositoryError 转换
// ==========================================
impl From<RepositoryError> for ApiError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound { entity, id } => {
                ApiError::NotFound(format!("{}(id={})不存在", entity, id))
            }
            RepositoryError::InvalidStateTransition { task_id, from, to } => ApiError::Conflict(
                format!("任务{}状态不允许从 {} 变更为 {}", task_id, from, to),
            ),
            RepositoryError::FilePathImmutable(task_id) => {
                ApiError::Conflict(format!("任务{}的导出文件已生成，不可修改", task_id))
            }
            RepositoryError::FieldValueError { field, message } => {
                ApiError::InvalidInput(format!("字段{}错误: {}", field, message))
            }
            RepositoryError::UniqueConstraintViolation(msg) => {
                ApiError::Conflict(format!("唯一约束违反: {}", msg))
            }
            RepositoryError::LockError(msg) => {
                ApiError::DatabaseError(format!("数据库锁获取失败: {}", msg))
            }
            RepositoryError::DatabaseConnectionError(msg)
            | RepositoryError::DatabaseTransactionError(msg)
            | RepositoryError::DatabaseQueryError(msg) => ApiError::DatabaseError(msg),
            RepositoryError::InternalError(msg) => ApiError::InternalError(msg),
        }
    }
}

/// Result 类型别名
pub type ApiResult<T> = Result<T, ApiError>;
