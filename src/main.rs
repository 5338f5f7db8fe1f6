// ==========================================
// 数据传输系统 - 命令行入口
// ==========================================
// 职责: 运维 CLI，以数据库中的业务表作为导入目标/导出来源
// 处理器键 = 表名（启动时按库内业务表注册）
// ==========================================

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use rusqlite::Connection;
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tabular_transfer::api::{ImportSubmission, TransferApi};
use tabular_transfer::config::{ConfigManager, TransferConfigReader};
use tabular_transfer::events::TracingEventPublisher;
use tabular_transfer::exporter::{PolicyApprovalGate, RowExporter};
use tabular_transfer::importer::RowImporter;
use tabular_transfer::repository::table_adapter::{
    user_tables, SqliteTableExporter, SqliteTableImporter,
};
use tabular_transfer::repository::RecordFilter;
use tabular_transfer::{
    db, logging, ApprovalStatus, ExecutionContext, ExportMode, ExportRequest, TaskKind,
    TransferRegistry,
};
use tracing::info;

/// 数据库路径环境变量
const DB_PATH_ENV: &str = "TABULAR_TRANSFER_DB_PATH";

#[derive(Parser)]
#[command(name = "tabular-transfer")]
#[command(about = "表格数据导入导出任务工具")]
#[command(version)]
struct Cli {
    /// SQLite 数据库路径（默认: $TABULAR_TRANSFER_DB_PATH 或用户数据目录）
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// 以 JSON 行输出日志
    #[arg(long, global = true)]
    json_log: bool,

    /// 需要审核的导出表（可重复或逗号分隔）
    #[arg(long, global = true, value_delimiter = ',')]
    require_approval: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 初始化数据库并写入配置
    Init {
        /// 配置项，如 --set transfer/chunk_size=500
        #[arg(long = "set", value_name = "KEY=VALUE")]
        settings: Vec<String>,
    },
    /// 暂存上传文件并预览列头
    Headers {
        /// 目标表
        #[arg(short, long)]
        table: String,
        file: PathBuf,
        #[arg(short, long, default_value_t = 0)]
        user: i64,
    },
    /// 导入文件到指定表（前台等待完成）
    Import {
        #[arg(short, long)]
        table: String,
        file: PathBuf,
        /// 任务标题（默认: 表名）
        #[arg(long)]
        title: Option<String>,
        /// 用户确认的列头（逗号分隔）
        #[arg(long, value_delimiter = ',')]
        headers: Vec<String>,
        /// 表头行数（默认自动检测）
        #[arg(long)]
        heading_rows: Option<u8>,
        #[arg(short, long, default_value_t = 0)]
        user: i64,
    },
    /// 创建导出任务
    Export {
        #[arg(short, long)]
        table: String,
        /// all / page / selection / query
        #[arg(short, long, default_value = "all")]
        mode: ExportMode,
        /// page / selection 模式的 ID 列表
        #[arg(long, value_delimiter = ',')]
        ids: Vec<i64>,
        /// query 模式的筛选条件（JSON 对象）
        #[arg(long)]
        filter: Option<String>,
        /// 导出列及顺序（逗号分隔）
        #[arg(long, value_delimiter = ',')]
        fields: Vec<String>,
        #[arg(long)]
        title: Option<String>,
        #[arg(short, long, default_value_t = 0)]
        user: i64,
    },
    /// 登记导出审核结果
    Approve {
        task_id: String,
        #[arg(long)]
        approver: i64,
        /// 驳回（默认通过）
        #[arg(long)]
        reject: bool,
        #[arg(long)]
        comment: Option<String>,
        /// 核定的导出列（逗号分隔）
        #[arg(long, value_delimiter = ',')]
        fields: Vec<String>,
    },
    /// 下载导出文件（首次下载时生成）
    Download {
        task_id: String,
        #[arg(short, long, default_value_t = 0)]
        user: i64,
        /// 以超级管理员身份下载（跳过审核）
        #[arg(long)]
        admin: bool,
    },
    /// 查询任务进度
    Progress {
        #[arg(required = true)]
        task_ids: Vec<String>,
    },
    /// 列出任务记录
    Records {
        /// import / export
        #[arg(long)]
        kind: Option<TaskKind>,
        #[arg(short, long)]
        user: Option<i64>,
        #[arg(long, default_value_t = 20)]
        limit: u32,
        #[arg(long, default_value_t = 0)]
        offset: u32,
    },
}

/// 默认数据库路径
fn default_db_path() -> PathBuf {
    if let Ok(path) = std::env::var(DB_PATH_ENV) {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }

    match dirs::data_dir() {
        Some(data_dir) => data_dir.join("tabular-transfer").join("tabular_transfer.db"),
        None => PathBuf::from("./tabular_transfer.db"),
    }
}

/// 为每张业务表注册导入器与导出器
fn build_registry(conn: &Arc<Mutex<Connection>>, tables: &[String]) -> TransferRegistry {
    let mut registry = TransferRegistry::new();
    for table in tables {
        let (import_conn, import_table) = (conn.clone(), table.clone());
        registry.register_importer(table.as_str(), move |_ctx| {
            let importer = SqliteTableImporter::discover(import_conn.clone(), &import_table)?;
            Ok(Arc::new(importer) as Arc<dyn RowImporter>)
        });

        let (export_conn, export_table) = (conn.clone(), table.clone());
        registry.register_exporter(table.as_str(), move |_ctx| {
            let exporter = SqliteTableExporter::discover(export_conn.clone(), &export_table)?;
            Ok(Arc::new(exporter) as Arc<dyn RowExporter>)
        });
    }
    registry
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn non_empty(values: Vec<String>) -> Option<Vec<String>> {
    if values.is_empty() {
        None
    } else {
        Some(values)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.json_log);

    let db_path = cli.db.clone().unwrap_or_else(default_db_path);
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("无法创建数据库目录: {}", parent.display()))?;
    }
    let db_path_str = db_path.to_string_lossy().to_string();
    info!(version = tabular_transfer::VERSION, db = %db_path_str, "tabular-transfer 启动");

    let conn = db::open_sqlite_connection(&db_path_str)
        .with_context(|| format!("无法打开数据库: {}", db_path_str))?;
    db::init_schema(&conn)?;
    let tables = user_tables(&conn)?;
    let conn = Arc::new(Mutex::new(conn));

    let config = ConfigManager::from_connection(conn.clone())?;
    if let Commands::Init { settings } = &cli.command {
        for entry in settings {
            let (key, value) = entry
                .split_once('=')
                .ok_or_else(|| anyhow!("配置项格式应为 KEY=VALUE: {}", entry))?;
            config.set_global_config_value(key.trim(), value.trim())?;
        }
    }
    let settings = config.load_settings().await?;

    let approval = if cli.require_approval.is_empty() {
        PolicyApprovalGate::permissive()
    } else {
        PolicyApprovalGate::requiring(cli.require_approval.clone())
    };

    let api = TransferApi::from_connection(
        conn.clone(),
        Arc::new(TracingEventPublisher),
        Arc::new(approval),
        build_registry(&conn, &tables),
        settings,
    );

    match cli.command {
        Commands::Init { .. } => {
            print_json(api.settings())?;
            info!(tables = ?tables, "数据库已初始化");
        }

        Commands::Headers { table, file, user } => {
            let preview = api
                .read_import_headers(&ExecutionContext::user(user), &table, &file)
                .await?;
            print_json(&preview)?;
        }

        Commands::Import {
            table,
            file,
            title,
            headers,
            heading_rows,
            user,
        } => {
            let ctx = ExecutionContext::user(user);
            let preview = api.read_import_headers(&ctx, &table, &file).await?;
            let handle = api
                .submit_import(
                    &ctx,
                    ImportSubmission {
                        title: title.unwrap_or_else(|| table.clone()),
                        handler: table,
                        path: preview.path,
                        headers: non_empty(headers),
                        heading_rows: heading_rows.or(Some(preview.heading_rows)),
                        extra: Value::Null,
                    },
                )
                .await?;
            info!(task_id = %handle.task_id, task_name = %handle.task_name, "导入执行中");
            let outcome = handle.wait().await?;
            print_json(&outcome)?;
        }

        Commands::Export {
            table,
            mode,
            ids,
            filter,
            fields,
            title,
            user,
        } => {
            let params = match mode {
                ExportMode::All => Value::Null,
                ExportMode::Page | ExportMode::Selection => Value::from(ids),
                ExportMode::Query => match filter {
                    Some(raw) => serde_json::from_str(&raw).context("筛选条件不是合法 JSON")?,
                    None => Value::Object(Default::default()),
                },
            };
            let ticket = api
                .create_export(
                    &ExecutionContext::user(user),
                    title.as_deref().unwrap_or(&table),
                    &table,
                    ExportRequest {
                        mode,
                        fields: non_empty(fields),
                        params,
                    },
                )
                .await?;
            print_json(&ticket)?;
        }

        Commands::Approve {
            task_id,
            approver,
            reject,
            comment,
            fields,
        } => {
            let status = if reject {
                ApprovalStatus::Rejected
            } else {
                ApprovalStatus::Approved
            };
            api.record_approval(&task_id, approver, status, comment, non_empty(fields))?;
            print_json(&api.get_record(&task_id)?)?;
        }

        Commands::Download {
            task_id,
            user,
            admin,
        } => {
            let ctx = if admin {
                ExecutionContext::admin(user)
            } else {
                ExecutionContext::user(user)
            };
            let path = api.download_export(&ctx, &task_id).await?;
            println!("{}", path.display());
        }

        Commands::Progress { task_ids } => {
            print_json(&api.poll_progress(&task_ids)?)?;
        }

        Commands::Records {
            kind,
            user,
            limit,
            offset,
        } => {
            let filter = RecordFilter {
                kind,
                creator_id: user,
                limit,
                offset,
            };
            print_json(&api.list_records(&filter)?)?;
        }
    }

    let evicted = api.evict_expired_progress()?;
    if evicted > 0 {
        info!(evicted, "已清理过期进度");
    }
    Ok(())
}
