// ==========================================
// 数据传输系统 - 传输 API
// ==========================================
// 职责: 面向 HTTP 层/CLI 的异步门面
// - 导入: 表头预览 → 提交任务（后台执行）
// - 导出: 表头 → 创建任务 → 下载（首次下载时物化）
// - 进度轮询、审核结果登记、任务记录查询
// 说明: 管道为同步实现，经 spawn_blocking 在阻塞线程池执行
// ==========================================

use crate::api::error::{ApiError, ApiResult};
use crate::config::TransferSettings;
use crate::domain::progress::ProgressSnapshot;
use crate::domain::task::{compose_task_name, ExecutionContext, TaskProperties, TransferTask};
use crate::domain::types::{ApprovalStatus, TaskKind};
use crate::error::{TransferError, TransferResult};
use crate::events::TransferEventPublisher;
use crate::exporter::approval::ApprovalGate;
use crate::exporter::export_pipeline::{extract_headers, ExportPipeline, ExportRequest, ExportTicket};
use crate::importer::chunk_cursor::detect_heading_rows;
use crate::importer::file_parser::{read_first_cell, read_headers};
use crate::importer::import_pipeline::{check_fields, ImportJob, ImportOutcome, ImportPipeline};
use crate::importer::staged_file::{stage_upload, StagedFile};
use crate::registry::TransferRegistry;
use crate::repository::progress_repo::{ProgressStore, SqliteProgressStore};
use crate::repository::task_record_repo::{
    ApprovalDecision, RecordFilter, SqliteTaskRecordStore, TaskRecordStore,
};
use chrono::Utc;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, instrument};

/// 导入列提示（前端标记必填列）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldHint {
    pub label: String,
    pub required: bool,
}

/// 导入阶段 1 结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderPreview {
    /// 暂存文件路径（提交导入时回传）
    pub path: PathBuf,
    pub headers: Vec<String>,
    pub heading_rows: u8,
    pub fields: Vec<FieldHint>,
}

/// 导入提交参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportSubmission {
    pub title: String,
    pub handler: String,
    /// 阶段 1 返回的暂存文件
    pub path: PathBuf,
    #[serde(default)]
    pub headers: Option<Vec<String>>,
    #[serde(default)]
    pub heading_rows: Option<u8>,
    #[serde(default)]
    pub extra: Value,
}

/// 已提交的导入任务
#[derive(Debug)]
pub struct ImportHandle {
    pub task_id: String,
    pub task_name: String,
    join: JoinHandle<TransferResult<ImportOutcome>>,
}

impl ImportHandle {
    /// 等待后台导入结束
    pub async fn wait(self) -> ApiResult<ImportOutcome> {
        let outcome = self
            .join
            .await
            .map_err(|e| ApiError::InternalError(format!("导入线程异常: {}", e)))??;
        Ok(outcome)
    }
}

/// 传输 API
pub struct TransferApi {
    records: Arc<dyn TaskRecordStore>,
    progress: Arc<dyn ProgressStore>,
    registry: Arc<TransferRegistry>,
    import_pipeline: Arc<ImportPipeline>,
    export_pipeline: Arc<ExportPipeline>,
    settings: TransferSettings,
}

impl TransferApi {
    pub fn new(
        records: Arc<dyn TaskRecordStore>,
        progress: Arc<dyn ProgressStore>,
        events: Arc<dyn TransferEventPublisher>,
        approval: Arc<dyn ApprovalGate>,
        registry: TransferRegistry,
        settings: TransferSettings,
    ) -> Self {
        let import_pipeline = Arc::new(ImportPipeline::new(
            records.clone(),
            progress.clone(),
            events.clone(),
            settings.clone(),
        ));
        let export_pipeline = Arc::new(ExportPipeline::new(
            records.clone(),
            progress.clone(),
            events,
            approval,
            settings.clone(),
        ));

        Self {
            records,
            progress,
            registry: Arc::new(registry),
            import_pipeline,
            export_pipeline,
            settings,
        }
    }

    /// 使用 SQLite 任务记录与进度存储（同一连接）
    pub fn from_connection(
        conn: Arc<Mutex<Connection>>,
        events: Arc<dyn TransferEventPublisher>,
        approval: Arc<dyn ApprovalGate>,
        registry: TransferRegistry,
        settings: TransferSettings,
    ) -> Self {
        Self::new(
            Arc::new(SqliteTaskRecordStore::from_connection(conn.clone())),
            Arc::new(SqliteProgressStore::from_connection(conn)),
            events,
            approval,
            registry,
            settings,
        )
    }

    pub fn settings(&self) -> &TransferSettings {
        &self.settings
    }

    // ==========================================
    // 导入
    // ==========================================

    /// 导入阶段 1: 暂存上传文件并读取列头
    #[instrument(skip(self, ctx, upload), fields(user_id = ctx.user_id))]
    pub async fn read_import_headers(
        &self,
        ctx: &ExecutionContext,
        handler: &str,
        upload: &Path,
    ) -> ApiResult<HeaderPreview> {
        let importer = self.registry.resolve_importer(handler, ctx)?;
        let fields = importer.fields();
        check_fields(&fields)?;

        let upload = upload.to_path_buf();
        let import_dir = self.settings.import_dir();
        let system_name = self.settings.system_name.clone();

        let (path, headers, heading_rows) = tokio::task::spawn_blocking(move || {
            let staged = StagedFile::new(stage_upload(&upload, &import_dir)?);
            let heading_rows = detect_heading_rows(
                read_first_cell(staged.path())?.as_deref(),
                system_name.as_deref(),
            );
            let headers = read_headers(staged.path(), heading_rows)?;
            Ok::<_, TransferError>((staged.keep(), headers, heading_rows))
        })
        .await
        .map_err(|e| ApiError::InternalError(e.to_string()))??;

        Ok(HeaderPreview {
            path,
            headers,
            heading_rows,
            fields: fields
                .iter()
                .map(|f| FieldHint {
                    label: f.label.clone(),
                    required: f.is_required(),
                })
                .collect(),
        })
    }

    /// 导入阶段 2: 创建任务并在后台执行
    #[instrument(skip(self, ctx, submission), fields(user_id = ctx.user_id, handler = %submission.handler))]
    pub async fn submit_import(
        &self,
        ctx: &ExecutionContext,
        submission: ImportSubmission,
    ) -> ApiResult<ImportHandle> {
        let importer = self.registry.resolve_importer(&submission.handler, ctx)?;
        check_fields(&importer.fields())?;
        if !submission.path.exists() {
            return Err(TransferError::FileNotFound(submission.path.display().to_string()).into());
        }

        let mut task = TransferTask::new_pending(
            uuid::Uuid::new_v4().to_string(),
            compose_task_name(&submission.title),
            TaskKind::Import,
            submission.handler.clone(),
            ctx.user_id,
        );
        task.file_path = Some(submission.path.display().to_string());
        task.properties = TaskProperties {
            headers: submission.headers.clone(),
            heading_rows: submission.heading_rows,
            params: submission.extra.clone(),
            ..Default::default()
        };
        self.records.create(&task)?;

        let job = ImportJob {
            task_id: task.task_id.clone(),
            title: task.task_name.clone(),
            source_path: submission.path,
            headers: submission.headers,
            heading_rows: submission.heading_rows,
            extra: submission.extra,
            creator_id: ctx.user_id,
        };
        info!(task_id = %task.task_id, task_name = %task.task_name, "导入任务已提交");

        let pipeline = self.import_pipeline.clone();
        let join = tokio::task::spawn_blocking(move || pipeline.run(job, importer.as_ref()));

        Ok(ImportHandle {
            task_id: task.task_id,
            task_name: task.task_name,
            join,
        })
    }

    // ==========================================
    // 导出
    // ==========================================

    /// 导出阶段 1: 可用表头
    pub fn export_headers(&self, ctx: &ExecutionContext, handler: &str) -> ApiResult<Vec<String>> {
        let exporter = self.registry.resolve_exporter(handler, ctx)?;
        Ok(extract_headers(exporter.as_ref()))
    }

    /// 导出阶段 2: 创建任务
    pub async fn create_export(
        &self,
        ctx: &ExecutionContext,
        title: &str,
        handler: &str,
        request: ExportRequest,
    ) -> ApiResult<ExportTicket> {
        let exporter = self.registry.resolve_exporter(handler, ctx)?;
        let pipeline = self.export_pipeline.clone();
        let ctx = ctx.clone();
        let title = title.to_string();
        let handler = handler.to_string();

        let ticket = tokio::task::spawn_blocking(move || {
            pipeline.create_task(&ctx, &title, &handler, exporter.as_ref(), request)
        })
        .await
        .map_err(|e| ApiError::InternalError(e.to_string()))??;
        Ok(ticket)
    }

    /// 导出阶段 3: 下载（首次下载时生成文件）
    pub async fn download_export(
        &self,
        ctx: &ExecutionContext,
        task_id: &str,
    ) -> ApiResult<PathBuf> {
        let task = self.get_record(task_id)?;
        let exporter = self.registry.resolve_exporter(&task.handler, ctx)?;
        let pipeline = self.export_pipeline.clone();
        let ctx = ctx.clone();
        let task_id = task_id.to_string();

        let path = tokio::task::spawn_blocking(move || {
            pipeline.download(&ctx, &task_id, exporter.as_ref())
        })
        .await
        .map_err(|e| ApiError::InternalError(e.to_string()))??;
        Ok(path)
    }

    // ==========================================
    // 进度与记录
    // ==========================================

    /// 批量轮询进度（过期或不存在的任务返回 None）
    pub fn poll_progress(&self, task_ids: &[String]) -> ApiResult<Vec<Option<ProgressSnapshot>>> {
        let mut snapshots = Vec::with_capacity(task_ids.len());
        for task_id in task_ids {
            snapshots.push(self.progress.snapshot(task_id)?);
        }
        Ok(snapshots)
    }

    /// 登记审核结果
    ///
    /// # 参数
    /// - status: 仅允许 approved / rejected
    /// - approved_fields: 审核人核定的导出字段（优先于申请字段）
    pub fn record_approval(
        &self,
        task_id: &str,
        approver_id: i64,
        status: ApprovalStatus,
        comment: Option<String>,
        approved_fields: Option<Vec<String>>,
    ) -> ApiResult<()> {
        if status == ApprovalStatus::Pending {
            return Err(ApiError::InvalidInput(
                "审核结果只能是 approved 或 rejected".to_string(),
            ));
        }

        let task = self.get_record(task_id)?;
        if task.kind != TaskKind::Export {
            return Err(ApiError::InvalidInput(format!("任务不是导出任务: {}", task_id)));
        }

        self.records.update_approval(
            task_id,
            ApprovalDecision {
                status,
                approver_id: Some(approver_id),
                comment,
                decided_at: Utc::now(),
                approved_fields,
            },
        )?;
        info!(task_id, approver_id, status = %status, "审核结果已登记");
        Ok(())
    }

    pub fn get_record(&self, task_id: &str) -> ApiResult<TransferTask> {
        self.records
            .get(task_id)?
            .ok_or_else(|| ApiError::NotFound(format!("任务(id={})不存在", task_id)))
    }

    /// 任务记录（按创建时间倒序）
    pub fn list_records(&self, filter: &RecordFilter) -> ApiResult<Vec<TransferTask>> {
        Ok(self.records.list(filter)?)
    }

    /// 清理过期进度
    pub fn evict_expired_progress(&self) -> ApiResult<usize> {
        Ok(self.progress.evict_expired()?)
    }
}
