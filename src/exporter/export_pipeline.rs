// ==========================================
// 数据传输系统 - 导出管道
// ==========================================
// 职责: 导出三阶段协议
// 1. 表头提取: 返回导出器可用表头，不创建任务
// 2. 创建任务: 记录模式/字段/参数，按审核策略创建审核申请或自动通过
// 3. 下载时物化: 审核通过后首次下载生成文件，之后直接返回同一路径
// 红线:
// - 文件路径一经写入不再修改（至多物化一次）
// - 物化失败不写入文件路径，允许重试
// - 同一任务同一时刻只允许一个物化过程
// ==========================================

use crate::config::TransferSettings;
use crate::domain::field::CellValue;
use crate::domain::task::{compose_task_name, ExecutionContext, TaskProperties, TransferTask};
use crate::domain::types::{ApprovalStatus, ExportMode, TaskKind, TaskStatus};
use crate::error::{TransferError, TransferResult};
use crate::events::{publish_or_warn, TransferEvent, TransferEventPublisher};
use crate::exporter::approval::{ApprovalGate, AUTO_APPROVAL_COMMENT};
use crate::exporter::exporter_trait::{ExportFilter, RowExporter};
use crate::exporter::sheet_writer::create_sheet_writer;
use crate::importer::import_pipeline::{elapsed, ProgressTicker};
use crate::importer::staged_file::{random_suffix, sanitize_file_stem, StagedFile};
use crate::repository::progress_repo::ProgressStore;
use crate::repository::task_record_repo::{TaskCompletion, TaskRecordStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, instrument, warn};

/// 创建导出任务的请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportRequest {
    pub mode: ExportMode,
    /// 选择的表头及顺序；为空导出全部默认表头
    #[serde(default)]
    pub fields: Option<Vec<String>>,
    /// 模式参数（ID 列表或筛选条件）
    #[serde(default)]
    pub params: Value,
}

/// 创建结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportTicket {
    pub task_id: String,
    pub task_name: String,
    pub approval_status: ApprovalStatus,
}

/// 阶段 1: 表头提取（无状态）
pub fn extract_headers(exporter: &dyn RowExporter) -> Vec<String> {
    exporter.default_headers()
}

// ==========================================
// ExportPipeline
// ==========================================
pub struct ExportPipeline {
    records: Arc<dyn TaskRecordStore>,
    progress: Arc<dyn ProgressStore>,
    events: Arc<dyn TransferEventPublisher>,
    approval: Arc<dyn ApprovalGate>,
    settings: TransferSettings,
    // 物化中的任务
    in_flight: Mutex<HashSet<String>>,
}

/// 物化锁守卫（释放时移出 in_flight）
struct MaterializeGuard<'a> {
    in_flight: &'a Mutex<HashSet<String>>,
    task_id: String,
}

impl Drop for MaterializeGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut set) = self.in_flight.lock() {
            set.remove(&self.task_id);
        }
    }
}

impl ExportPipeline {
    pub fn new(
        records: Arc<dyn TaskRecordStore>,
        progress: Arc<dyn ProgressStore>,
        events: Arc<dyn TransferEventPublisher>,
        approval: Arc<dyn ApprovalGate>,
        settings: TransferSettings,
    ) -> Self {
        Self {
            records,
            progress,
            events,
            approval,
            settings,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// 阶段 2: 创建导出任务
    ///
    /// # 错误
    /// - InvalidRequest: 模式参数不合法或表头不存在
    /// - ApprovalRequestFailed: 审核申请创建失败（任务已置为 failed）
    #[instrument(skip(self, ctx, exporter, request), fields(user_id = ctx.user_id))]
    pub fn create_task(
        &self,
        ctx: &ExecutionContext,
        title: &str,
        handler: &str,
        exporter: &dyn RowExporter,
        request: ExportRequest,
    ) -> TransferResult<ExportTicket> {
        ExportFilter::from_mode(Some(request.mode), &request.params)?;

        let request_fields = request.fields.filter(|f| !f.is_empty());
        if let Some(fields) = &request_fields {
            let available: HashSet<String> = exporter.default_headers().into_iter().collect();
            if let Some(unknown) = fields.iter().find(|f| !available.contains(*f)) {
                return Err(TransferError::InvalidRequest(format!("未知导出字段: {}", unknown)));
            }
        }

        let mut task = TransferTask::new_pending(
            uuid::Uuid::new_v4().to_string(),
            compose_task_name(title),
            TaskKind::Export,
            handler.to_string(),
            ctx.user_id,
        );
        task.properties = TaskProperties {
            mode: Some(request.mode),
            request_fields,
            params: request.params,
            ..Default::default()
        };

        let approval_type = exporter.approval_type();
        let requires_approval = self.approval.is_approval_required(&approval_type);
        if requires_approval {
            task.approval_status = Some(ApprovalStatus::Pending);
        } else {
            task.approval_status = Some(ApprovalStatus::Approved);
            task.approval_comment = Some(AUTO_APPROVAL_COMMENT.to_string());
            task.approval_at = Some(Utc::now());
        }
        self.records.create(&task)?;

        if requires_approval {
            if let Err(message) = self.approval.create_approval_request(&task) {
                warn!(task_id = %task.task_id, error = %message, "审核申请创建失败");
                self.records
                    .mark_failed(&task.task_id, Utc::now(), &message)?;
                return Err(TransferError::ApprovalRequestFailed(message));
            }
        }

        info!(
            task_id = %task.task_id,
            task_name = %task.task_name,
            approval_type = %approval_type,
            requires_approval,
            "导出任务已创建"
        );
        Ok(ExportTicket {
            task_id: task.task_id,
            task_name: task.task_name,
            approval_status: task.approval_status.unwrap_or(ApprovalStatus::Pending),
        })
    }

    /// 阶段 3: 下载（必要时物化）
    ///
    /// # 返回
    /// - 导出文件路径（重复下载返回同一路径，不重新查询）
    ///
    /// # 错误
    /// - TaskNotFound / ExportNotApproved / ExportInProgress / InvalidRequest: 请求级，任务未修改
    /// - 其他: 物化失败，任务已置为 failed，可重试
    #[instrument(skip(self, ctx, exporter), fields(user_id = ctx.user_id))]
    pub fn download(
        &self,
        ctx: &ExecutionContext,
        task_id: &str,
        exporter: &dyn RowExporter,
    ) -> TransferResult<PathBuf> {
        let task = self.load_export_task(task_id)?;

        if !ctx.is_admin {
            let status = self
                .approval
                .current_status(&task)
                .map_err(TransferError::ApprovalRequestFailed)?;
            if status != ApprovalStatus::Approved {
                return Err(TransferError::ExportNotApproved(task_id.to_string()));
            }
        }

        if let Some(path) = &task.file_path {
            debug!(task_id, path = %path, "导出文件已存在，直接返回");
            return Ok(PathBuf::from(path));
        }

        let _guard = self.acquire(task_id)?;

        // 持锁后再确认一次（其他进程可能已生成或正在生成）
        let task = self.load_export_task(task_id)?;
        if let Some(path) = &task.file_path {
            return Ok(PathBuf::from(path));
        }
        if task.status == TaskStatus::Processing {
            return Err(TransferError::ExportInProgress(task_id.to_string()));
        }

        self.materialize(&task, exporter)
    }

    fn load_export_task(&self, task_id: &str) -> TransferResult<TransferTask> {
        let task = self
            .records
            .get(task_id)?
            .ok_or_else(|| TransferError::TaskNotFound(task_id.to_string()))?;
        if task.kind != TaskKind::Export {
            return Err(TransferError::InvalidRequest(format!(
                "任务不是导出任务: {}",
                task_id
            )));
        }
        Ok(task)
    }

    fn acquire(&self, task_id: &str) -> TransferResult<MaterializeGuard<'_>> {
        let mut in_flight = self
            .in_flight
            .lock()
            .map_err(|e| TransferError::InternalError(e.to_string()))?;
        if !in_flight.insert(task_id.to_string()) {
            return Err(TransferError::ExportInProgress(task_id.to_string()));
        }
        Ok(MaterializeGuard {
            in_flight: &self.in_flight,
            task_id: task_id.to_string(),
        })
    }

    fn materialize(&self, task: &TransferTask, exporter: &dyn RowExporter) -> TransferResult<PathBuf> {
        let headers = resolve_headers(task, exporter)?;
        let filter = ExportFilter::from_mode(task.properties.mode, &task.properties.params)?;

        // 认领: pending/failed → processing；认领失败时任务归其他执行者所有，不做任何修改
        let started_at = Utc::now();
        if let Err(claim_err) = self.records.mark_processing(&task.task_id, started_at, None) {
            let current = self.load_export_task(&task.task_id)?;
            if let Some(path) = current.file_path {
                return Ok(PathBuf::from(path));
            }
            if current.status == TaskStatus::Processing {
                return Err(TransferError::ExportInProgress(task.task_id.clone()));
            }
            return Err(claim_err.into());
        }

        let export_dir = self.settings.export_dir();
        let file_name = format!(
            "{}_{}_{}.{}",
            sanitize_file_stem(&task.task_name),
            Utc::now().timestamp(),
            random_suffix(6),
            self.settings.export_format.extension()
        );
        let target = export_dir.join(file_name);

        match self.write_artifact(task, exporter, &headers, &filter, &target, started_at) {
            Ok(total_rows) => {
                publish_or_warn(
                    self.events.as_ref(),
                    self.event(task, TaskStatus::Done, Some(total_rows), Some(target.as_path()), None),
                );
                Ok(target)
            }
            Err(e) => {
                error!(task_id = %task.task_id, error = %e, "导出物化失败");
                if let Err(remove_err) = fs::remove_file(&target) {
                    if remove_err.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = %target.display(), error = %remove_err, "导出文件清理失败");
                    }
                }
                let message = e.to_string();
                if let Err(mark_err) = self.records.mark_failed(&task.task_id, Utc::now(), &message)
                {
                    warn!(task_id = %task.task_id, error = %mark_err, "任务记录置为失败时出错");
                }
                if let Err(mark_err) = self.progress.mark_failed(
                    &task.task_id,
                    &task.task_name,
                    self.settings.progress_ttl(),
                ) {
                    warn!(task_id = %task.task_id, error = %mark_err, "进度置为失败时出错");
                }
                publish_or_warn(
                    self.events.as_ref(),
                    self.event(task, TaskStatus::Failed, None, None, Some(message)),
                );
                Err(e)
            }
        }
    }

    /// 生成导出文件并完成任务，返回导出行数（调用前任务已被本执行者认领）
    fn write_artifact(
        &self,
        task: &TransferTask,
        exporter: &dyn RowExporter,
        headers: &[String],
        filter: &ExportFilter,
        target: &Path,
        started_at: DateTime<Utc>,
    ) -> TransferResult<u64> {
        let task_id = task.task_id.as_str();

        let mut cursor = exporter.prepare_query(filter)?;
        let total_rows = cursor.count()?;
        self.progress
            .start(task_id, &task.task_name, Some(total_rows), started_at)?;
        info!(task_id, total_rows, headers = headers.len(), "开始生成导出文件");

        if let Some(dir) = target.parent() {
            fs::create_dir_all(dir).map_err(|e| TransferError::FileWriteError(e.to_string()))?;
        }
        let mut part = target.as_os_str().to_owned();
        part.push(".part");
        let part = StagedFile::new(part);

        let mut writer = create_sheet_writer(self.settings.export_format, part.path(), headers)?;
        let mut ticker = ProgressTicker::new(self.settings.progress_flush_rows);
        let mut written = 0u64;

        loop {
            let chunk = cursor.next_chunk(self.settings.chunk_size.max(1))?;
            if chunk.is_empty() {
                break;
            }

            for source_row in &chunk {
                let mut mapped = exporter.map_row(source_row);
                let values: Vec<CellValue> = headers
                    .iter()
                    .map(|h| mapped.remove(h).unwrap_or(CellValue::Empty))
                    .collect();
                writer.write_row(&values)?;
                written += 1;

                if let Some(n) = ticker.tick() {
                    self.progress.increment_processed(task_id, n)?;
                }
            }

            if let Some(n) = ticker.drain() {
                self.progress.increment_processed(task_id, n)?;
            }
        }

        writer.finish()?;
        fs::rename(part.path(), target).map_err(|e| TransferError::FileWriteError(e.to_string()))?;

        let ended_at = Utc::now();
        self.records.mark_done(
            task_id,
            TaskCompletion {
                ended_at: Some(ended_at),
                duration: Some(elapsed(started_at, ended_at)),
                file_path: Some(target.display().to_string()),
                total_count: Some(total_rows),
                ..Default::default()
            },
        )?;
        self.progress
            .finish(task_id, ended_at, self.settings.progress_ttl())?;

        info!(task_id, rows = written, path = %target.display(), "导出文件已生成");
        Ok(written)
    }

    fn event(
        &self,
        task: &TransferTask,
        status: TaskStatus,
        total_rows: Option<u64>,
        file_path: Option<&Path>,
        message: Option<String>,
    ) -> TransferEvent {
        TransferEvent {
            task_id: task.task_id.clone(),
            kind: TaskKind::Export,
            title: task.task_name.clone(),
            status,
            creator_id: task.creator_id,
            total_rows,
            error_rows: 0,
            error_report_path: None,
            file_path: file_path.map(|p| p.display().to_string()),
            message,
        }
    }
}

/// 物化时的导出表头
///
/// 审核核定字段优先于申请字段；只保留导出器当前提供的表头，
/// 未知字段丢弃，全部未知时拒绝（任务未修改）
fn resolve_headers(task: &TransferTask, exporter: &dyn RowExporter) -> TransferResult<Vec<String>> {
    let available = exporter.default_headers();
    let requested = match task.properties.effective_fields() {
        Some(fields) => fields,
        None => return Ok(available),
    };

    let (known, unknown): (Vec<String>, Vec<String>) = requested
        .iter()
        .cloned()
        .partition(|field| available.contains(field));
    if !unknown.is_empty() {
        warn!(task_id = %task.task_id, unknown = ?unknown, "导出字段不在导出器表头中，已忽略");
    }
    if known.is_empty() {
        return Err(TransferError::InvalidRequest(format!(
            "导出字段均不存在: {}",
            unknown.join(",")
        )));
    }
    Ok(known)
}
