// ==========================================
// 数据传输系统 - 导入器/导出器注册表
// ==========================================
// 职责: 稳定字符串键 → 参与方工厂
// 说明:
// - 任务创建时按键解析一次，键写入任务记录的 handler 字段
// - 工厂接收执行上下文（用户、请求参数），可按调用方定制参与方
// ==========================================

use crate::domain::task::ExecutionContext;
use crate::error::{TransferError, TransferResult};
use crate::exporter::exporter_trait::RowExporter;
use crate::importer::importer_trait::RowImporter;
use std::collections::HashMap;
use std::sync::Arc;

pub type ImporterFactory =
    Arc<dyn Fn(&ExecutionContext) -> TransferResult<Arc<dyn RowImporter>> + Send + Sync>;

pub type ExporterFactory =
    Arc<dyn Fn(&ExecutionContext) -> TransferResult<Arc<dyn RowExporter>> + Send + Sync>;

#[derive(Default, Clone)]
pub struct TransferRegistry {
    importers: HashMap<String, ImporterFactory>,
    exporters: HashMap<String, ExporterFactory>,
}

impl TransferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册导入器（同名覆盖）
    pub fn register_importer<F>(&mut self, key: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&ExecutionContext) -> TransferResult<Arc<dyn RowImporter>> + Send + Sync + 'static,
    {
        self.importers.insert(key.into(), Arc::new(factory));
        self
    }

    /// 注册导出器（同名覆盖）
    pub fn register_exporter<F>(&mut self, key: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&ExecutionContext) -> TransferResult<Arc<dyn RowExporter>> + Send + Sync + 'static,
    {
        self.exporters.insert(key.into(), Arc::new(factory));
        self
    }

    pub fn resolve_importer(
        &self,
        key: &str,
        ctx: &ExecutionContext,
    ) -> TransferResult<Arc<dyn RowImporter>> {
        let factory = self
            .importers
            .get(key)
            .ok_or_else(|| TransferError::UnknownHandler(key.to_string()))?;
        factory(ctx)
    }

    pub fn resolve_exporter(
        &self,
        key: &str,
        ctx: &ExecutionContext,
    ) -> TransferResult<Arc<dyn RowExporter>> {
        let factory = self
            .exporters
            .get(key)
            .ok_or_else(|| TransferError::UnknownHandler(key.to_string()))?;
        factory(ctx)
    }

    /// 已注册的导入器键（排序）
    pub fn importer_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.importers.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// 已注册的导出器键（排序）
    pub fn exporter_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.exporters.keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl std::fmt::Debug for TransferRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferRegistry")
            .field("importers", &self.importer_keys())
            .field("exporters", &self.exporter_keys())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::field::{CanonicalRow, FieldSpec};
    use serde_json::Value;

    struct NamedImporter(String);

    impl RowImporter for NamedImporter {
        fn fields(&self) -> Vec<FieldSpec> {
            vec![FieldSpec::new("name", self.0.clone())]
        }

        fn store(&self, _row: &CanonicalRow, _extra: &Value) -> Result<(), String> {
            Ok(())
        }
    }

    #[test]
    fn test_resolve_registered_importer() {
        let mut registry = TransferRegistry::new();
        registry.register_importer("employees", |ctx| {
            Ok(Arc::new(NamedImporter(format!("user-{}", ctx.user_id))) as Arc<dyn RowImporter>)
        });

        let importer = registry
            .resolve_importer("employees", &ExecutionContext::user(7))
            .unwrap();
        assert_eq!(importer.fields()[0].label, "user-7");
        assert_eq!(registry.importer_keys(), vec!["employees".to_string()]);
    }

    #[test]
    fn test_unknown_key() {
        let registry = TransferRegistry::new();
        let err = registry
            .resolve_exporter("missing", &ExecutionContext::user(1))
            .err()
            .unwrap();
        assert!(matches!(err, TransferError::UnknownHandler(key) if key == "missing"));
        assert!(registry
            .resolve_importer("missing", &ExecutionContext::user(1))
            .is_err());
    }
}
