// ==========================================
// 传输 API 端到端测试
// ==========================================
// 测试目标: 以 SQLite 业务表为导入目标/导出来源，走通
// 表头预览 → 导入 → 导出创建 → 审核 → 下载 → 进度/记录查询
// ==========================================

mod test_helpers;

use rusqlite::Connection;
use serde_json::json;
use std::fs;
use std::sync::{Arc, Mutex};
use tabular_transfer::api::{ApiError, ImportSubmission, TransferApi};
use tabular_transfer::events::NoOpEventPublisher;
use tabular_transfer::exporter::{PolicyApprovalGate, RowExporter, SheetFormat};
use tabular_transfer::repository::table_adapter::{
    user_tables, SqliteTableExporter, SqliteTableImporter,
};
use tabular_transfer::repository::RecordFilter;
use tabular_transfer::{
    logging, ApprovalStatus, ExecutionContext, ExportMode, ExportRequest, RowImporter, TaskKind,
    TaskStatus, TransferRegistry,
};
use tempfile::TempDir;
use test_helpers::{create_test_db, test_settings, write_file};

fn table_registry(conn: &Arc<Mutex<Connection>>) -> TransferRegistry {
    let tables = user_tables(&conn.lock().unwrap()).unwrap();
    let mut registry = TransferRegistry::new();
    for table in tables {
        let (c, t) = (conn.clone(), table.clone());
        registry.register_importer(table.as_str(), move |_ctx| {
            Ok(Arc::new(SqliteTableImporter::discover(c.clone(), &t)?) as Arc<dyn RowImporter>)
        });
        let (c, t) = (conn.clone(), table.clone());
        registry.register_exporter(table.as_str(), move |_ctx| {
            Ok(Arc::new(SqliteTableExporter::discover(c.clone(), &t)?) as Arc<dyn RowExporter>)
        });
    }
    registry
}

fn setup(gate: PolicyApprovalGate) -> (TempDir, Arc<Mutex<Connection>>, TransferApi) {
    let (dir, conn) = create_test_db().expect("Failed to create test db");
    conn.lock()
        .unwrap()
        .execute_batch(
            r#"
            CREATE TABLE employees (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                dept TEXT,
                age INTEGER
            );
            "#,
        )
        .unwrap();

    let api = TransferApi::from_connection(
        conn.clone(),
        Arc::new(NoOpEventPublisher),
        Arc::new(gate),
        table_registry(&conn),
        test_settings(dir.path(), 2, SheetFormat::Csv),
    );
    (dir, conn, api)
}

async fn import_employees(api: &TransferApi, dir: &TempDir, content: &str) -> String {
    let ctx = ExecutionContext::user(8);
    let upload = write_file(dir.path(), "upload-employees.csv", content);
    let preview = api
        .read_import_headers(&ctx, "employees", &upload)
        .await
        .expect("Header preview should succeed");

    let handle = api
        .submit_import(
            &ctx,
            ImportSubmission {
                title: "员工导入".to_string(),
                handler: "employees".to_string(),
                path: preview.path,
                headers: None,
                heading_rows: Some(preview.heading_rows),
                extra: serde_json::Value::Null,
            },
        )
        .await
        .expect("Submit should succeed");
    let task_id = handle.task_id.clone();
    handle.wait().await.expect("Import should finish");
    task_id
}

#[tokio::test]
async fn test_header_preview_stages_upload() {
    logging::init_test();
    let (dir, _conn, api) = setup(PolicyApprovalGate::permissive());

    let upload = write_file(
        dir.path(),
        "my-employees.csv",
        "员工导入模板,,\nname,dept,age\n张三,研发,30\n",
    );
    let preview = api
        .read_import_headers(&ExecutionContext::user(8), "employees", &upload)
        .await
        .unwrap();

    assert_eq!(preview.heading_rows, 2);
    assert_eq!(preview.headers, vec!["name", "dept", "age"]);
    assert!(preview.path.exists());
    assert!(upload.exists(), "原上传文件不应被移动");
    assert!(preview
        .path
        .file_name()
        .unwrap()
        .to_string_lossy()
        .starts_with("my_employees_"));

    let required: Vec<(String, bool)> = preview
        .fields
        .iter()
        .map(|f| (f.label.clone(), f.required))
        .collect();
    assert_eq!(
        required,
        vec![
            ("name".to_string(), true),
            ("dept".to_string(), false),
            ("age".to_string(), false),
        ]
    );
}

#[tokio::test]
async fn test_import_then_export_round_trip() {
    logging::init_test();
    let (dir, conn, api) = setup(PolicyApprovalGate::permissive());

    let import_id = import_employees(
        &api,
        &dir,
        "name,dept,age\n张三,研发,30\n李四,财务,41\n,研发,22\n王五,研发,\n",
    )
    .await;

    let record = api.get_record(&import_id).unwrap();
    assert_eq!(record.kind, TaskKind::Import);
    assert_eq!(record.status, TaskStatus::Done);
    assert_eq!(record.total_count, Some(4));
    let report = fs::read_to_string(record.error_file_path.unwrap()).unwrap();
    assert!(report.contains("name不能为空"));

    let stored: i64 = conn
        .lock()
        .unwrap()
        .query_row("SELECT COUNT(*) FROM employees", [], |row| row.get(0))
        .unwrap();
    assert_eq!(stored, 3);

    let ctx = ExecutionContext::user(8);
    assert_eq!(
        api.export_headers(&ctx, "employees").unwrap(),
        vec!["id", "name", "dept", "age"]
    );

    let ticket = api
        .create_export(
            &ctx,
            "研发员工",
            "employees",
            ExportRequest {
                mode: ExportMode::Query,
                fields: Some(vec!["name".to_string(), "age".to_string()]),
                params: json!({"dept": "研发"}),
            },
        )
        .await
        .unwrap();
    let path = api.download_export(&ctx, &ticket.task_id).await.unwrap();
    let text = fs::read_to_string(&path).unwrap();
    assert_eq!(text.trim_start_matches('\u{feff}'), "name,age\n张三,30\n王五,\n");

    let snapshots = api
        .poll_progress(&[ticket.task_id.clone(), "missing".to_string()])
        .unwrap();
    assert_eq!(snapshots[0].as_ref().unwrap().processed, 2);
    assert!(snapshots[1].is_none());

    let exports = api
        .list_records(&RecordFilter {
            kind: Some(TaskKind::Export),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(exports.len(), 1);
    assert_eq!(exports[0].task_id, ticket.task_id);

    let mine = api
        .list_records(&RecordFilter {
            creator_id: Some(8),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(mine.len(), 2);
}

#[tokio::test]
async fn test_approval_flow_through_api() {
    logging::init_test();
    let (dir, _conn, api) = setup(PolicyApprovalGate::requiring(["employees"]));
    import_employees(&api, &dir, "name,dept,age\n张三,研发,30\n李四,财务,41\n").await;

    let ctx = ExecutionContext::user(8);
    let ticket = api
        .create_export(
            &ctx,
            "员工导出",
            "employees",
            ExportRequest {
                mode: ExportMode::Selection,
                fields: None,
                params: json!([2]),
            },
        )
        .await
        .unwrap();
    assert_eq!(ticket.approval_status, ApprovalStatus::Pending);

    let err = api.download_export(&ctx, &ticket.task_id).await.unwrap_err();
    assert!(matches!(err, ApiError::NotApproved(_)));

    let err = api
        .record_approval(&ticket.task_id, 99, ApprovalStatus::Pending, None, None)
        .unwrap_err();
    assert!(matches!(err, ApiError::InvalidInput(_)));

    api.record_approval(
        &ticket.task_id,
        99,
        ApprovalStatus::Approved,
        Some("同意".to_string()),
        Some(vec!["name".to_string()]),
    )
    .unwrap();

    let path = api.download_export(&ctx, &ticket.task_id).await.unwrap();
    let text = fs::read_to_string(&path).unwrap();
    assert_eq!(text.trim_start_matches('\u{feff}'), "name\n李四\n");

    let record = api.get_record(&ticket.task_id).unwrap();
    assert_eq!(record.approval_status, Some(ApprovalStatus::Approved));
    assert_eq!(record.approver_id, Some(99));
    assert!(record.approval_at.is_some());
}

#[tokio::test]
async fn test_request_level_errors() {
    let (dir, _conn, api) = setup(PolicyApprovalGate::permissive());
    let ctx = ExecutionContext::user(1);

    let err = api
        .read_import_headers(&ctx, "unknown_table", &dir.path().join("x.csv"))
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::NotFound(_)));

    let err = api
        .read_import_headers(&ctx, "employees", &dir.path().join("absent.csv"))
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::InvalidInput(_)));

    let err = api.download_export(&ctx, "no-such-task").await.unwrap_err();
    assert!(matches!(err, ApiError::NotFound(_)));

    let err = api
        .create_export(
            &ctx,
            "员工导出",
            "employees",
            ExportRequest {
                mode: ExportMode::All,
                fields: Some(vec!["salary".to_string()]),
                params: serde_json::Value::Null,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::InvalidInput(_)));
    assert!(api.list_records(&RecordFilter::default()).unwrap().is_empty());
}
