// ==========================================
// 数据传输系统 - 导入器参与方 Trait
// ==========================================
// 职责: 定义各导入类型需提供的能力（字段定义 + 落库回调）
// 红线: 不包含文件读取、校验、进度逻辑（由导入管道负责）
// ==========================================

use crate::domain::field::{CanonicalRow, FieldSpec};
use serde_json::Value;

/// 导入器
///
/// 由注册表按键创建，任务创建时解析一次；在后台线程中调用，需 Send + Sync
pub trait RowImporter: Send + Sync {
    /// 字段定义（按列位置对应）
    fn fields(&self) -> Vec<FieldSpec>;

    /// 落库回调
    ///
    /// # 参数
    /// - row: 已映射、已通过校验的规范行
    /// - extra: 任务级附加参数（调用方透传）
    ///
    /// # 返回
    /// - Err(message): 行级错误，记入错误报告，不中止任务
    fn store(&self, row: &CanonicalRow, extra: &Value) -> Result<(), String>;
}
