// ==========================================
// 数据传输系统 - 导入管道
// ==========================================
// 职责: 驱动单个导入任务从暂存文件到落库回调
// 状态机: pending → processing → {done, failed}
// 流程（逐行）: 游标前进 → 计入已处理 → 映射 → 去重 → 校验 → 落库回调
// 红线:
// - 行级错误（重复/校验失败/回调失败）只记入错误报告，不中止任务
// - 单任务内分块严格顺序处理（行号计算依赖顺序）
// - 暂存文件在成功与失败路径上都会删除
// ==========================================

use crate::config::TransferSettings;
use crate::domain::field::FieldSpec;
use crate::domain::task::format_duration;
use crate::domain::types::{TaskKind, TaskStatus};
use crate::error::{TransferError, TransferResult};
use crate::events::{publish_or_warn, TransferEvent, TransferEventPublisher};
use crate::importer::chunk_cursor::{detect_heading_rows, ChunkCursor};
use crate::importer::deduplicator::{row_hash, Deduplicator};
use crate::importer::error_collector::{ErrorCollector, ErrorEntry};
use crate::importer::field_mapper;
use crate::importer::file_parser::{open_row_source, read_first_cell};
use crate::importer::importer_trait::RowImporter;
use crate::importer::staged_file::{sanitize_file_stem, StagedFile};
use crate::importer::validator::{rule_labels, validate, RuleSet};
use crate::repository::progress_repo::ProgressStore;
use crate::repository::task_record_repo::{TaskCompletion, TaskRecordStore};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// 重复行的错误原因
pub const DUPLICATE_REASON: &str = "重复数据";

/// 导入任务参数
#[derive(Debug, Clone)]
pub struct ImportJob {
    pub task_id: String,
    /// 任务名称（进度标题、错误报告文件名）
    pub title: String,
    /// 暂存文件（任务结束后删除）
    pub source_path: PathBuf,
    /// 用户确认的列头；为空时使用文件列头
    pub headers: Option<Vec<String>>,
    /// 表头行数；为空时按首格内容检测
    pub heading_rows: Option<u8>,
    /// 透传给落库回调的附加参数
    pub extra: Value,
    pub creator_id: i64,
}

/// 导入结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImportOutcome {
    pub task_id: String,
    pub total_rows: u64,
    pub error_rows: u64,
    pub heading_rows: u8,
    pub error_report: Option<PathBuf>,
    pub duration: String,
}

// ==========================================
// ImportPipeline
// ==========================================
pub struct ImportPipeline {
    records: Arc<dyn TaskRecordStore>,
    progress: Arc<dyn ProgressStore>,
    events: Arc<dyn TransferEventPublisher>,
    settings: TransferSettings,
}

impl ImportPipeline {
    pub fn new(
        records: Arc<dyn TaskRecordStore>,
        progress: Arc<dyn ProgressStore>,
        events: Arc<dyn TransferEventPublisher>,
        settings: TransferSettings,
    ) -> Self {
        Self {
            records,
            progress,
            events,
            settings,
        }
    }

    /// 执行导入任务
    ///
    /// # 返回
    /// - Ok: 任务已置为 done（可能带错误报告）
    /// - Err: 任务级致命错误，任务已置为 failed
    #[instrument(skip(self, job, importer), fields(task_id = %job.task_id))]
    pub fn run(&self, job: ImportJob, importer: &dyn RowImporter) -> TransferResult<ImportOutcome> {
        let staged = StagedFile::new(&job.source_path);
        info!(title = %job.title, source = %staged.path().display(), "开始导入");

        match self.execute(&job, importer) {
            Ok(outcome) => {
                info!(
                    total_rows = outcome.total_rows,
                    error_rows = outcome.error_rows,
                    duration = %outcome.duration,
                    "导入完成"
                );
                publish_or_warn(
                    self.events.as_ref(),
                    TransferEvent {
                        task_id: job.task_id.clone(),
                        kind: TaskKind::Import,
                        title: job.title.clone(),
                        status: TaskStatus::Done,
                        creator_id: job.creator_id,
                        total_rows: Some(outcome.total_rows),
                        error_rows: outcome.error_rows,
                        error_report_path: outcome
                            .error_report
                            .as_ref()
                            .map(|p| p.display().to_string()),
                        file_path: None,
                        message: None,
                    },
                );
                Ok(outcome)
            }
            Err(e) => {
                self.fail(&job, &e);
                Err(e)
            }
        }
    }

    fn execute(&self, job: &ImportJob, importer: &dyn RowImporter) -> TransferResult<ImportOutcome> {
        let started_at = Utc::now();
        let task_id = job.task_id.as_str();

        // ===== 表头行数（任务期间冻结） =====
        let heading_rows = match job.heading_rows {
            Some(rows) => rows.clamp(1, 2),
            None => detect_heading_rows(
                read_first_cell(&job.source_path)?.as_deref(),
                self.settings.system_name.as_deref(),
            ),
        };

        let mut source = open_row_source(&job.source_path, heading_rows)?;
        let headers = job
            .headers
            .clone()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| source.headers().to_vec());

        let fields = importer.fields();
        let rules = RuleSet::parse(&fields)?;
        let labels = rule_labels(&fields);

        // total 在第一次 processed 更新前写入
        let total_rows = source.total_rows();
        self.progress
            .start(task_id, &job.title, Some(total_rows), started_at)?;
        self.records
            .mark_processing(task_id, started_at, Some(total_rows))?;
        debug!(heading_rows, total_rows, headers = headers.len(), "导入开始处理");

        let report_path = self
            .settings
            .report_dir()
            .join(format!("{}_errors.csv", sanitize_file_stem(&job.title)));
        let mut collector =
            ErrorCollector::new(self.settings.report_layout, report_path, headers.clone());

        let mut cursor = ChunkCursor::new(self.settings.chunk_size, heading_rows);
        let mut deduplicator = Deduplicator::new();
        let mut ticker = ProgressTicker::new(self.settings.progress_flush_rows);

        loop {
            let chunk = source.next_chunk(cursor.chunk_size())?;
            if chunk.is_empty() {
                break;
            }
            cursor.begin_chunk();

            for raw in chunk {
                let position = cursor.advance()?;
                if let Some(n) = ticker.tick() {
                    self.progress.increment_processed(task_id, n)?;
                }

                if raw.is_blank() {
                    continue;
                }

                let row = field_mapper::map(&fields, &headers, &raw);
                let reason = if deduplicator.check_and_remember(row_hash(&raw)?) {
                    Some(DUPLICATE_REASON.to_string())
                } else if let Some(message) = validate(&row, &rules, &labels).into_iter().next() {
                    Some(message)
                } else {
                    importer.store(&row, &job.extra).err()
                };

                if let Some(reason) = reason {
                    debug!(display_row = position.display_row, reason = %reason, "行级错误");
                    collector.push(ErrorEntry {
                        display_row: position.display_row,
                        reason,
                        original: field_mapper::echo_values(&fields, &headers, &raw, &row),
                    })?;
                    self.progress.record_error_rows(task_id, 1)?;
                }
            }

            if let Some(n) = ticker.drain() {
                self.progress.increment_processed(task_id, n)?;
            }
        }

        // ===== 完成 =====
        let error_report = collector.finish()?;
        let ended_at = Utc::now();
        let duration = elapsed(started_at, ended_at);
        let error_rows = collector.error_rows();

        self.records.mark_done(
            task_id,
            TaskCompletion {
                ended_at: Some(ended_at),
                duration: Some(duration.clone()),
                error_file_path: error_report.as_ref().map(|p| p.display().to_string()),
                file_path: None,
                error: (error_rows > 0).then(|| format!("{} 行数据异常", error_rows)),
                total_count: None,
            },
        )?;
        self.progress
            .finish(task_id, ended_at, self.settings.progress_ttl())?;

        Ok(ImportOutcome {
            task_id: job.task_id.clone(),
            total_rows,
            error_rows,
            heading_rows,
            error_report,
            duration,
        })
    }

    fn fail(&self, job: &ImportJob, err: &TransferError) {
        error!(task_id = %job.task_id, error = %err, "导入任务失败");
        let message = err.to_string();

        if let Err(e) = self.records.mark_failed(&job.task_id, Utc::now(), &message) {
            warn!(task_id = %job.task_id, error = %e, "任务记录置为失败时出错");
        }
        if let Err(e) =
            self.progress
                .mark_failed(&job.task_id, &job.title, self.settings.progress_ttl())
        {
            warn!(task_id = %job.task_id, error = %e, "进度置为失败时出错");
        }

        publish_or_warn(
            self.events.as_ref(),
            TransferEvent {
                task_id: job.task_id.clone(),
                kind: TaskKind::Import,
                title: job.title.clone(),
                status: TaskStatus::Failed,
                creator_id: job.creator_id,
                total_rows: None,
                error_rows: 0,
                error_report_path: None,
                file_path: None,
                message: Some(message),
            },
        );
    }
}

/// 校验导入器字段定义（任务创建前调用，规则无效属于请求级错误）
pub fn check_fields(fields: &[FieldSpec]) -> TransferResult<()> {
    RuleSet::parse(fields).map(|_| ())
}

pub(crate) fn elapsed(started_at: DateTime<Utc>, ended_at: DateTime<Utc>) -> String {
    format_duration((ended_at - started_at).num_seconds())
}

// ==========================================
// ProgressTicker - 进度写入节流
// ==========================================
#[derive(Debug)]
pub(crate) struct ProgressTicker {
    every: u64,
    pending: u64,
}

impl ProgressTicker {
    pub(crate) fn new(every: u64) -> Self {
        Self {
            every: every.max(1),
            pending: 0,
        }
    }

    /// 计入一行，达到阈值时返回待写入数量
    pub(crate) fn tick(&mut self) -> Option<u64> {
        self.pending += 1;
        if self.pending >= self.every {
            self.drain()
        } else {
            None
        }
    }

    pub(crate) fn drain(&mut self) -> Option<u64> {
        match std::mem::take(&mut self.pending) {
            0 => None,
            n => Some(n),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::field::{CanonicalRow, FieldType};
    use crate::domain::task::TransferTask;
    use crate::events::ChannelEventPublisher;
    use crate::importer::error_collector::ReportLayout;
    use crate::repository::progress_repo::MemoryProgressStore;
    use crate::repository::task_record_repo::SqliteTaskRecordStore;
    use rusqlite::Connection;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct CollectingImporter {
        fields: Vec<FieldSpec>,
        stored: Mutex<Vec<CanonicalRow>>,
        reject_name: Option<String>,
    }

    impl CollectingImporter {
        fn new(fields: Vec<FieldSpec>) -> Self {
            Self {
                fields,
                stored: Mutex::new(Vec::new()),
                reject_name: None,
            }
        }
    }

    impl RowImporter for CollectingImporter {
        fn fields(&self) -> Vec<FieldSpec> {
            self.fields.clone()
        }

        fn store(&self, row: &CanonicalRow, _extra: &Value) -> Result<(), String> {
            let name = row.get("name").map(|v| v.to_display()).unwrap_or_default();
            if self.reject_name.as_deref() == Some(name.as_str()) {
                return Err(format!("{} 已存在", name));
            }
            self.stored.lock().unwrap().push(row.clone());
            Ok(())
        }
    }

    struct Fixture {
        dir: TempDir,
        records: Arc<SqliteTaskRecordStore>,
        progress: Arc<MemoryProgressStore>,
        pipeline: ImportPipeline,
    }

    fn fixture(chunk_size: usize, layout: ReportLayout) -> Fixture {
        let dir = TempDir::new().unwrap();
        let conn = Connection::open_in_memory().unwrap();
        crate::db::init_schema(&conn).unwrap();
        let records = Arc::new(SqliteTaskRecordStore::from_connection(Arc::new(Mutex::new(
            conn,
        ))));
        let progress = Arc::new(MemoryProgressStore::new());

        let mut settings = TransferSettings::with_storage_root(dir.path());
        settings.chunk_size = chunk_size;
        settings.report_layout = layout;

        let pipeline = ImportPipeline::new(
            records.clone(),
            progress.clone(),
            Arc::new(ChannelEventPublisher::new().0),
            settings,
        );
        Fixture {
            dir,
            records,
            progress,
            pipeline,
        }
    }

    fn job(fx: &Fixture, task_id: &str, content: &str) -> ImportJob {
        let path = fx.dir.path().join(format!("{}.csv", task_id));
        fs::write(&path, content).unwrap();

        fx.records
            .create(&TransferTask::new_pending(
                task_id.to_string(),
                format!("员工导入_{}", task_id),
                TaskKind::Import,
                "employees".to_string(),
                1,
            ))
            .unwrap();

        ImportJob {
            task_id: task_id.to_string(),
            title: format!("员工导入_{}", task_id),
            source_path: path,
            headers: None,
            heading_rows: None,
            extra: Value::Null,
            creator_id: 1,
        }
    }

    fn fields() -> Vec<FieldSpec> {
        vec![
            FieldSpec::new("name", "姓名")
                .with_type(FieldType::String)
                .with_rule("required"),
            FieldSpec::new("age", "年龄").with_rule("nullable|integer"),
        ]
    }

    #[test]
    fn test_row_errors_do_not_fail_task() {
        let fx = fixture(2, ReportLayout::RowNumber);
        let job = job(&fx, "t1", "姓名,年龄\n张三,30\n,20\n张三,30\n李四,abc\n王五,40\n");
        let source = job.source_path.clone();
        let importer = CollectingImporter::new(fields());

        let outcome = fx.pipeline.run(job, &importer).unwrap();
        assert_eq!(outcome.total_rows, 5);
        assert_eq!(outcome.error_rows, 3);
        assert_eq!(outcome.heading_rows, 1);
        assert_eq!(importer.stored.lock().unwrap().len(), 2);
        assert!(!source.exists());

        let report = fs::read_to_string(outcome.error_report.unwrap()).unwrap();
        let lines: Vec<&str> = report.trim_start_matches('\u{feff}').lines().collect();
        assert_eq!(lines[0], "行号,原因");
        assert_eq!(lines[1], "3,姓名不能为空");
        assert_eq!(lines[2], format!("4,{}", DUPLICATE_REASON));
        assert_eq!(lines[3], "5,年龄必须是整数");

        let task = fx.records.get("t1").unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Done);
        assert_eq!(task.total_count, Some(5));
        assert!(task.error_file_path.is_some());
        assert!(task.duration.is_some());

        let snap = fx.progress.snapshot("t1").unwrap().unwrap();
        assert_eq!(snap.processed, 5);
        assert_eq!(snap.error_rows, 3);
        assert!(snap.is_finished());
    }

    #[test]
    fn test_store_callback_error_is_row_level() {
        let fx = fixture(1000, ReportLayout::ContentEcho);
        let job = job(&fx, "t2", "姓名,年龄\n张三,30\n李四,31\n");
        let mut importer = CollectingImporter::new(fields());
        importer.reject_name = Some("李四".to_string());

        let outcome = fx.pipeline.run(job, &importer).unwrap();
        assert_eq!(outcome.error_rows, 1);

        let report = fs::read_to_string(outcome.error_report.unwrap()).unwrap();
        let lines: Vec<&str> = report.trim_start_matches('\u{feff}').lines().collect();
        assert!(lines[0].ends_with(",姓名,年龄"));
        assert_eq!(lines[1], "李四 已存在,李四,31");
    }

    #[test]
    fn test_clean_import_has_no_report() {
        let fx = fixture(1000, ReportLayout::ContentEcho);
        let job = job(&fx, "t3", "姓名,年龄\n张三,30\n");
        let outcome = fx
            .pipeline
            .run(job, &CollectingImporter::new(fields()))
            .unwrap();

        assert!(outcome.error_report.is_none());
        let task = fx.records.get("t3").unwrap().unwrap();
        assert!(task.error_file_path.is_none());
        assert!(task.error.is_none());
    }

    #[test]
    fn test_title_row_shifts_display_rows() {
        let fx = fixture(2, ReportLayout::RowNumber);
        let job = job(
            &fx,
            "t4",
            "员工导入模板,\n姓名,年龄\n张三,1\n,2\n李四,3\n,4\n",
        );
        let outcome = fx
            .pipeline
            .run(job, &CollectingImporter::new(fields()))
            .unwrap();
        assert_eq!(outcome.heading_rows, 2);

        let report = fs::read_to_string(outcome.error_report.unwrap()).unwrap();
        let rows: Vec<&str> = report
            .trim_start_matches('\u{feff}')
            .lines()
            .skip(1)
            .map(|l| l.split(',').next().unwrap())
            .collect();
        assert_eq!(rows, vec!["4", "6"]);
    }

    #[test]
    fn test_fatal_error_marks_failed() {
        let fx = fixture(1000, ReportLayout::RowNumber);
        let mut job = job(&fx, "t5", "姓名\n张三\n");
        job.source_path = fx.dir.path().join("missing.csv");

        let err = fx
            .pipeline
            .run(job, &CollectingImporter::new(fields()))
            .unwrap_err();
        assert!(matches!(err, TransferError::FileNotFound(_) | TransferError::FileReadError(_)));

        let task = fx.records.get("t5").unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.is_some());
        assert!(fx.progress.snapshot("t5").unwrap().unwrap().failed);
    }

    #[test]
    fn test_invalid_rule_fails_task() {
        let fx = fixture(1000, ReportLayout::RowNumber);
        let job = job(&fx, "t6", "姓名\n张三\n");
        let importer =
            CollectingImporter::new(vec![FieldSpec::new("name", "姓名").with_rule("uuid")]);

        let err = fx.pipeline.run(job, &importer).unwrap_err();
        assert!(matches!(err, TransferError::InvalidRule { .. }));
        assert_eq!(
            fx.records.get("t6").unwrap().unwrap().status,
            TaskStatus::Failed
        );
    }

    #[test]
    fn test_ticker_batches_writes() {
        let mut ticker = ProgressTicker::new(3);
        assert_eq!(ticker.tick(), None);
        assert_eq!(ticker.tick(), None);
        assert_eq!(ticker.tick(), Some(3));
        assert_eq!(ticker.tick(), None);
        assert_eq!(ticker.drain(), Some(1));
        assert_eq!(ticker.drain(), None);
    }
}
