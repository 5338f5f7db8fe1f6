// ==========================================
// 数据传输系统 - 核心库
// ==========================================
// 职责: 表格数据导入导出任务管道
// - 分块流式读取、字段映射、校验、去重、错误报告
// - 导出审核门与下载时物化
// - 任务记录与进度存储（SQLite）
// ==========================================

// ==========================================
// 模块声明
// ==========================================

// 领域层 - 任务/字段/进度
pub mod domain;

// 数据仓储层 - 任务记录、进度、表适配
pub mod repository;

// 导入层
pub mod importer;

// 导出层
pub mod exporter;

// 配置层 - 管道运行参数
pub mod config;

// 数据库基础设施（连接初始化/PRAGMA 统一）
pub mod db;

// 管道错误类型
pub mod error;

// 任务终态事件
pub mod events;

// 导入器/导出器注册表
pub mod registry;

// 日志系统
pub mod logging;

// API 层
pub mod api;

// ==========================================
// 重导出核心类型
// ==========================================

// 领域类型
pub use domain::{
    ApprovalStatus, CanonicalRow, CellValue, ExecutionContext, ExportMode, FieldSpec, FieldType,
    ProgressSnapshot, RawRow, TaskKind, TaskStatus, TransferTask,
};

// 管道
pub use exporter::{ExportPipeline, ExportRequest, RowExporter};
pub use importer::{ImportJob, ImportPipeline, RowImporter};

// 错误
pub use error::{TransferError, TransferResult};

// 注册表与 API
pub use api::{ApiError, TransferApi};
pub use registry::TransferRegistry;

// ==========================================
// 常量定义
// ==========================================

// 系统版本
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// 系统名称
pub const APP_NAME: &str = "tabular-transfer";
