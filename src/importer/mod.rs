// ==========================================
// 数据传输系统 - 导入层
// ==========================================
// 职责: 上传文件暂存、分块读取、字段映射、校验、去重、错误报告
// 支持: Excel (xlsx/xlsm/xls/ods), CSV
// ==========================================

// 模块声明
pub mod chunk_cursor;
pub mod deduplicator;
pub mod error_collector;
pub mod field_mapper;
pub mod file_parser;
pub mod import_pipeline;
pub mod importer_trait;
pub mod staged_file;
pub mod validator;

// 重导出核心类型
pub use chunk_cursor::{detect_heading_rows, ChunkCursor, RowPosition};
pub use deduplicator::Deduplicator;
pub use error_collector::{ErrorCollector, ErrorEntry, ReportLayout};
pub use file_parser::{open_row_source, read_first_cell, read_headers, RowSource};
pub use import_pipeline::{ImportJob, ImportOutcome, ImportPipeline};
pub use staged_file::{stage_upload, StagedFile};
pub use validator::RuleSet;

// 重导出 Trait 接口
pub use importer_trait::RowImporter;
