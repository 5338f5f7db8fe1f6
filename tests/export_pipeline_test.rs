// ==========================================
// 导出管道集成测试
// ==========================================
// 测试目标: 下载时物化、重复下载复用文件、审核门、失败重试
// ==========================================

mod test_helpers;

use calamine::{open_workbook, Data, Reader, Xlsx};
use chrono::Utc;
use serde_json::{json, Value};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use tabular_transfer::events::ChannelEventPublisher;
use tabular_transfer::exporter::{ExportPipeline, ExportRequest, PolicyApprovalGate, SheetFormat};
use tabular_transfer::repository::{
    ApprovalDecision, ProgressStore, SqliteProgressStore, SqliteTaskRecordStore, TaskRecordStore,
};
use tabular_transfer::{
    logging, ApprovalStatus, ExecutionContext, ExportMode, TaskStatus, TransferError,
};
use tempfile::TempDir;
use test_helpers::{create_stores, create_test_db, test_settings, CountingExporter};

/// 共享同一存储的另一个执行者（独立的进程内物化锁）
fn other_worker(fx: &Fixture) -> ExportPipeline {
    ExportPipeline::new(
        fx.records.clone(),
        fx.progress.clone(),
        Arc::new(ChannelEventPublisher::new().0),
        fx.gate.clone(),
        test_settings(fx.dir.path(), 2, SheetFormat::Csv),
    )
}

struct Fixture {
    dir: TempDir,
    records: Arc<SqliteTaskRecordStore>,
    progress: Arc<SqliteProgressStore>,
    gate: Arc<PolicyApprovalGate>,
    pipeline: ExportPipeline,
}

fn fixture(gate: PolicyApprovalGate, format: SheetFormat) -> Fixture {
    let (dir, conn) = create_test_db().expect("Failed to create test db");
    let (records, progress) = create_stores(&conn);
    let gate = Arc::new(gate);
    let pipeline = ExportPipeline::new(
        records.clone(),
        progress.clone(),
        Arc::new(ChannelEventPublisher::new().0),
        gate.clone(),
        test_settings(dir.path(), 2, format),
    );
    Fixture {
        dir,
        records,
        progress,
        gate,
        pipeline,
    }
}

fn selection(ids: Value) -> ExportRequest {
    ExportRequest {
        mode: ExportMode::Selection,
        fields: None,
        params: ids,
    }
}

fn export_dir_entries(path: &Path) -> Vec<String> {
    let dir = path.parent().unwrap();
    fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect()
}

#[test]
fn test_selection_export_materializes_once() {
    logging::init_test();

    let fx = fixture(PolicyApprovalGate::permissive(), SheetFormat::Csv);
    let exporter = CountingExporter::new(20);
    let ctx = ExecutionContext::user(3);

    let ticket = fx
        .pipeline
        .create_task(&ctx, "物料导出", "items", &exporter, selection(json!([3, 7, 9])))
        .expect("Create should succeed");
    assert_eq!(ticket.approval_status, ApprovalStatus::Approved);
    assert!(ticket.task_name.starts_with("物料导出_"));
    assert_eq!(exporter.query_count(), 0, "创建任务时不应查询数据");

    let task = fx.records.get(&ticket.task_id).unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert!(task.file_path.is_none());
    assert_eq!(task.approval_comment.as_deref(), Some("无需审核"));

    let path = fx
        .pipeline
        .download(&ctx, &ticket.task_id, &exporter)
        .expect("Download should succeed");
    assert!(path.exists());
    assert!(path
        .file_name()
        .unwrap()
        .to_string_lossy()
        .starts_with("物料导出_"));

    let text = fs::read_to_string(&path).unwrap();
    assert_eq!(
        text.trim_start_matches('\u{feff}'),
        "编号,名称,数量\n3,item-3,30\n7,item-7,70\n9,item-9,90\n"
    );

    let task = fx.records.get(&ticket.task_id).unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Done);
    assert_eq!(task.total_count, Some(3));
    assert_eq!(task.file_path.as_deref(), Some(path.to_string_lossy().as_ref()));
    assert!(task.duration.is_some());

    let snapshot = fx.progress.snapshot(&ticket.task_id).unwrap().unwrap();
    assert_eq!(snapshot.processed, 3);
    assert!(snapshot.is_finished());

    // 重复下载返回同一文件，不重新查询
    let again = fx
        .pipeline
        .download(&ctx, &ticket.task_id, &exporter)
        .expect("Second download should succeed");
    assert_eq!(again, path);
    assert_eq!(exporter.query_count(), 1);
    assert_eq!(export_dir_entries(&path).len(), 1);
    let snapshot = fx.progress.snapshot(&ticket.task_id).unwrap().unwrap();
    assert_eq!(snapshot.processed, 3, "重复下载不应再计入进度");
}

#[test]
fn test_approval_gate_blocks_until_approved() {
    logging::init_test();

    let fx = fixture(PolicyApprovalGate::requiring(["items"]), SheetFormat::Csv);
    let exporter = CountingExporter::new(5);
    let user = ExecutionContext::user(3);

    let ticket = fx
        .pipeline
        .create_task(
            &user,
            "物料导出",
            "items",
            &exporter,
            ExportRequest {
                mode: ExportMode::All,
                fields: Some(vec!["名称".to_string(), "编号".to_string()]),
                params: Value::Null,
            },
        )
        .expect("Create should succeed");
    assert_eq!(ticket.approval_status, ApprovalStatus::Pending);
    assert_eq!(fx.gate.requested_tasks(), vec![ticket.task_id.clone()]);

    let err = fx
        .pipeline
        .download(&user, &ticket.task_id, &exporter)
        .unwrap_err();
    assert!(matches!(err, TransferError::ExportNotApproved(_)));
    assert_eq!(exporter.query_count(), 0);
    assert_eq!(
        fx.records.get(&ticket.task_id).unwrap().unwrap().status,
        TaskStatus::Pending
    );

    // 审核人核定字段优先于申请字段
    fx.records
        .update_approval(
            &ticket.task_id,
            ApprovalDecision {
                status: ApprovalStatus::Approved,
                approver_id: Some(99),
                comment: Some("同意".to_string()),
                decided_at: Utc::now(),
                approved_fields: Some(vec!["编号".to_string()]),
            },
        )
        .unwrap();

    let path = fx
        .pipeline
        .download(&user, &ticket.task_id, &exporter)
        .expect("Approved download should succeed");
    let text = fs::read_to_string(&path).unwrap();
    assert_eq!(text.trim_start_matches('\u{feff}'), "编号\n1\n2\n3\n4\n5\n");

    let task = fx.records.get(&ticket.task_id).unwrap().unwrap();
    assert_eq!(task.approver_id, Some(99));
    assert_eq!(task.approval_comment.as_deref(), Some("同意"));
}

#[test]
fn test_admin_bypasses_pending_and_rejected_approval() {
    let fx = fixture(PolicyApprovalGate::requiring(["items"]), SheetFormat::Csv);
    let exporter = CountingExporter::new(2);

    let ticket = fx
        .pipeline
        .create_task(
            &ExecutionContext::user(3),
            "物料导出",
            "items",
            &exporter,
            selection(json!([1, 2])),
        )
        .unwrap();
    fx.records
        .update_approval(
            &ticket.task_id,
            ApprovalDecision {
                status: ApprovalStatus::Rejected,
                approver_id: Some(99),
                comment: Some("数据敏感".to_string()),
                decided_at: Utc::now(),
                approved_fields: None,
            },
        )
        .unwrap();

    let err = fx
        .pipeline
        .download(&ExecutionContext::user(3), &ticket.task_id, &exporter)
        .unwrap_err();
    assert!(matches!(err, TransferError::ExportNotApproved(_)));

    let path = fx
        .pipeline
        .download(&ExecutionContext::admin(1), &ticket.task_id, &exporter)
        .expect("Admin download should succeed");
    assert!(path.exists());
}

#[test]
fn test_failed_materialization_can_be_retried() {
    logging::init_test();

    let fx = fixture(PolicyApprovalGate::permissive(), SheetFormat::Csv);
    let exporter = CountingExporter::failing_once(4);
    let ctx = ExecutionContext::user(3);

    let ticket = fx
        .pipeline
        .create_task(
            &ctx,
            "物料导出",
            "items",
            &exporter,
            ExportRequest {
                mode: ExportMode::All,
                fields: None,
                params: Value::Null,
            },
        )
        .unwrap();

    let err = fx.pipeline.download(&ctx, &ticket.task_id, &exporter);
    assert!(err.is_err());

    let task = fx.records.get(&ticket.task_id).unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.file_path.is_none());
    assert!(task.error.unwrap().contains("数据源连接中断"));
    assert!(fx.progress.snapshot(&ticket.task_id).unwrap().unwrap().failed);

    // 重试: failed → processing → done
    let path = fx
        .pipeline
        .download(&ctx, &ticket.task_id, &exporter)
        .expect("Retry should succeed");
    assert_eq!(exporter.query_count(), 2);
    let file_name = path.file_name().unwrap().to_string_lossy().to_string();
    assert_eq!(export_dir_entries(&path), vec![file_name]);

    let task = fx.records.get(&ticket.task_id).unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Done);
    assert_eq!(task.total_count, Some(4));
}

#[test]
fn test_download_during_other_worker_export_leaves_it_running() {
    logging::init_test();

    let fx = fixture(PolicyApprovalGate::permissive(), SheetFormat::Csv);
    let worker_b = other_worker(&fx);
    let (exporter, pause) = CountingExporter::paused(3);
    let ctx = ExecutionContext::user(3);

    let ticket = fx
        .pipeline
        .create_task(
            &ctx,
            "物料导出",
            "items",
            &exporter,
            ExportRequest {
                mode: ExportMode::All,
                fields: None,
                params: Value::Null,
            },
        )
        .unwrap();
    let task_id = ticket.task_id.as_str();

    let path = thread::scope(|scope| {
        let worker_a = scope.spawn(|| fx.pipeline.download(&ctx, task_id, &exporter));
        pause.wait_entered();

        // A 正在生成: B 的下载被拒绝，且不修改任务
        let result_b = worker_b.download(&ctx, task_id, &exporter);
        let task = fx.records.get(task_id).unwrap().unwrap();
        let progress_failed = fx.progress.snapshot(task_id).unwrap().unwrap().failed;
        pause.release();

        let err = result_b.unwrap_err();
        assert!(matches!(&err, TransferError::ExportInProgress(id) if id == task_id));
        assert!(err.is_request_level());
        assert_eq!(task.status, TaskStatus::Processing);
        assert!(task.error.is_none());
        assert!(!progress_failed);

        worker_a
            .join()
            .unwrap()
            .expect("Worker A should finish its export")
    });

    let task = fx.records.get(task_id).unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Done);
    assert_eq!(task.total_count, Some(3));
    assert_eq!(task.file_path.as_deref(), Some(path.to_string_lossy().as_ref()));
    assert!(path.exists());

    // 完成后 B 直接拿到 A 生成的文件
    let again = worker_b.download(&ctx, task_id, &exporter).unwrap();
    assert_eq!(again, path);
    assert_eq!(exporter.query_count(), 1);
}

#[test]
fn test_xlsx_export_is_readable() {
    let fx = fixture(PolicyApprovalGate::permissive(), SheetFormat::Xlsx);
    let exporter = CountingExporter::new(3);
    let ctx = ExecutionContext::user(3);

    let ticket = fx
        .pipeline
        .create_task(&ctx, "物料导出", "items", &exporter, selection(json!([5, 6])))
        .unwrap();
    let path = fx.pipeline.download(&ctx, &ticket.task_id, &exporter).unwrap();
    assert_eq!(path.extension().and_then(|e| e.to_str()), Some("xlsx"));

    let mut workbook: Xlsx<_> = open_workbook(&path).unwrap();
    let sheet_name = workbook.sheet_names()[0].clone();
    let range = workbook.worksheet_range(&sheet_name).unwrap();
    let rows: Vec<Vec<Data>> = range.rows().map(|r| r.to_vec()).collect();

    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0][0], Data::String("编号".to_string()));
    assert_eq!(rows[1][0], Data::Float(5.0));
    assert_eq!(rows[2][1], Data::String("item-6".to_string()));
}

#[test]
fn test_unknown_task_is_request_error() {
    let fx = fixture(PolicyApprovalGate::permissive(), SheetFormat::Csv);
    let err = fx
        .pipeline
        .download(&ExecutionContext::user(1), "missing", &CountingExporter::new(1))
        .unwrap_err();
    assert!(matches!(&err, TransferError::TaskNotFound(id) if id == "missing"));
    assert!(err.is_request_level());
}
