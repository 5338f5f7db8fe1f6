// ==========================================
// 数据传输系统 - 导出层
// ==========================================
// 职责: 导出器参与方接口、审核门、导出文件写入、导出管道
// ==========================================

pub mod approval;
pub mod export_pipeline;
pub mod exporter_trait;
pub mod sheet_writer;

pub use approval::{ApprovalGate, PolicyApprovalGate};
pub use export_pipeline::{extract_headers, ExportPipeline, ExportRequest, ExportTicket};
pub use exporter_trait::{ExportFilter, QueryCursor, RowExporter};
pub use sheet_writer::{create_sheet_writer, SheetFormat, SheetWriter};
