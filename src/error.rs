// ==========================================
// 数据传输系统 - 管道错误类型
// ==========================================
// 工具: thiserror 派生宏
// 分级:
// - 行级错误（校验失败/重复/落库回调失败）不走本类型，记入错误收集器
// - 任务级致命错误: 中止剩余分块，任务置为 failed
// - 请求级错误: 立即拒绝调用方，不修改任务
// ==========================================

use crate::repository::error::RepositoryError;
use thiserror::Error;

/// 传输管道错误类型
#[derive(Error, Debug)]
pub enum TransferError {
    // ===== 文件相关错误 =====
    #[error("文件不存在: {0}")]
    FileNotFound(String),

    #[error("文件格式不支持: {0}（仅支持 .xlsx/.xls/.ods/.csv）")]
    UnsupportedFormat(String),

    #[error("文件读取失败: {0}")]
    FileReadError(String),

    #[error("文件写入失败: {0}")]
    FileWriteError(String),

    #[error("Excel 解析失败: {0}")]
    ExcelParseError(String),

    #[error("CSV 解析失败: {0}")]
    CsvParseError(String),

    // ===== 请求级错误 =====
    #[error("任务不存在: {0}")]
    TaskNotFound(String),

    #[error("未注册的处理器: {0}")]
    UnknownHandler(String),

    #[error("导出任务未审核通过: {0}")]
    ExportNotApproved(String),

    #[error("导出任务正在生成中: {0}")]
    ExportInProgress(String),

    #[error("校验规则无效 (字段 {field}): {message}")]
    InvalidRule { field: String, message: String },

    #[error("请求参数无效: {0}")]
    InvalidRequest(String),

    #[error("创建审核申请失败: {0}")]
    ApprovalRequestFailed(String),

    // ===== 任务级错误 =====
    #[error("分块超限: 分块大小 {chunk_size}，实际读取 {rows} 行")]
    ChunkOverflow { chunk_size: usize, rows: u64 },

    #[error("数据查询失败: {0}")]
    QueryError(String),

    #[error("序列化失败: {0}")]
    SerializationError(String),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    // ===== 通用错误 =====
    #[error("内部错误: {0}")]
    InternalError(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TransferError {
    /// 是否为请求级错误（直接拒绝调用方，任务未被修改）
    pub fn is_request_level(&self) -> bool {
        match self {
            TransferError::TaskNotFound(_)
            | TransferError::UnknownHandler(_)
            | TransferError::ExportNotApproved(_)
            | TransferError::ExportInProgress(_)
            | TransferError::InvalidRule { .. }
            | TransferError::InvalidRequest(_)
            | TransferError::ApprovalRequestFailed(_)
            | TransferError::UnsupportedFormat(_)
            | TransferError::FileNotFound(_) => true,
            TransferError::Repository(RepositoryError::NotFound { .. }) => true,
            _ => false,
        }
    }
}

// 实现 From<std::io::Error>
impl From<std::io::Error> for TransferError {
    fn from(err: std::io::Error) -> Self {
        TransferError::FileReadError(err.to_string())
    }
}

// 实现 From<csv::Error>
impl From<csv::Error> for TransferError {
    fn from(err: csv::Error) -> Self {
        TransferError::CsvParseError(err.to_string())
    }
}

// 实现 From<calamine::Error>
impl From<calamine::Error> for TransferError {
    fn from(err: calamine::Error) -> Self {
        TransferError::ExcelParseError(err.to_string())
    }
}

// 实现 From<calamine::XlsxError>（.xlsx 流式读取）
impl From<calamine::XlsxError> for TransferError {
    fn from(err: calamine::XlsxError) -> Self {
        TransferError::ExcelParseError(err.to_string())
    }
}

// 实现 From<rust_xlsxwriter::XlsxError>
impl From<rust_xlsxwriter::XlsxError> for TransferError {
    fn from(err: rust_xlsxwriter::XlsxError) -> Self {
        TransferError::FileWriteError(err.to_string())
    }
}

// 实现 From<serde_json::Error>
impl From<serde_json::Error> for TransferError {
    fn from(err: serde_json::Error) -> Self {
        TransferError::SerializationError(err.to_string())
    }
}

// 实现 From<rusqlite::Error>
impl From<rusqlite::Error> for TransferError {
    fn from(err: rusqlite::Error) -> Self {
        TransferError::Repository(RepositoryError::from(err))
    }
}

/// Result 类型别名
pub type TransferResult<T> = Result<T, TransferError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_level_classification() {
        assert!(TransferError::ExportNotApproved("t1".into()).is_request_level());
        assert!(TransferError::TaskNotFound("t1".into()).is_request_level());
        assert!(TransferError::Repository(RepositoryError::NotFound {
            entity: "TransferTask".into(),
            id: "x".into()
        })
        .is_request_level());

        assert!(!TransferError::CsvParseError("bad".into()).is_request_level());
        assert!(!TransferError::QueryError("boom".into()).is_request_level());
    }

    #[test]
    fn test_io_error_maps_to_read_error() {
        let err: TransferError =
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied").into();
        assert!(matches!(err, TransferError::FileReadError(_)));
    }
}
