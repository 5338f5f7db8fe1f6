// ==========================================
// 数据传输系统 - 配置层
// ==========================================
// 职责: 管道运行参数管理,支持 config_kv 表与环境变量覆写
// ==========================================

pub mod config_manager;
pub mod transfer_config_trait;
pub mod transfer_settings;

// 重导出核心配置管理器
pub use config_manager::{config_keys, ConfigManager};
pub use transfer_config_trait::TransferConfigReader;
pub use transfer_settings::TransferSettings;
