// ==========================================
// 数据传输系统 - API 层
// ==========================================
// 职责: 提供传输任务 API 接口,供 HTTP 层 / CLI 调用
// ==========================================

pub mod error;
pub mod transfer_api;

// 重导出核心类型
pub use error::{ApiError, ApiResult};
pub use transfer_api::{FieldHint, HeaderPreview, ImportHandle, ImportSubmission, TransferApi};
