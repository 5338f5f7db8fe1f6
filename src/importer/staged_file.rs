// ==========================================
// 数据传输系统 - 上传文件暂存
// ==========================================
// 职责:
// - 上传文件复制到 storage_root/import，命名 `<原名>_<unix秒>_<6位随机串>.<ext>`
// - StagedFile 守卫: 导入结束时（成功或失败）删除暂存文件
// ==========================================

use crate::error::{TransferError, TransferResult};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// 随机串（取 UUID v4 的十六进制字符）
pub fn random_suffix(len: usize) -> String {
    let mut out = String::with_capacity(len);
    while out.len() < len {
        out.push_str(&uuid::Uuid::new_v4().simple().to_string());
    }
    out.truncate(len);
    out
}

/// 文件名安全化: 去除路径分隔符，`-` 替换为 `_`
pub fn sanitize_file_stem(stem: &str) -> String {
    let cleaned: String = stem
        .trim()
        .chars()
        .map(|c| match c {
            '-' | '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect();

    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned
    }
}

/// 生成暂存文件名
pub fn staged_file_name(original_name: &str) -> String {
    let path = Path::new(original_name);
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("upload");
    let timestamp = chrono::Utc::now().timestamp();

    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!(
            "{}_{}_{}.{}",
            sanitize_file_stem(stem),
            timestamp,
            random_suffix(6),
            ext.to_lowercase()
        ),
        None => format!("{}_{}_{}", sanitize_file_stem(stem), timestamp, random_suffix(6)),
    }
}

/// 将上传文件复制到暂存目录
///
/// # 返回
/// - 暂存文件路径
pub fn stage_upload(source: &Path, import_dir: &Path) -> TransferResult<PathBuf> {
    if !source.exists() {
        return Err(TransferError::FileNotFound(source.display().to_string()));
    }

    let original_name = source
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| TransferError::InvalidRequest(format!("无效文件名: {}", source.display())))?;

    fs::create_dir_all(import_dir).map_err(|e| TransferError::FileWriteError(e.to_string()))?;
    let target = import_dir.join(staged_file_name(original_name));
    fs::copy(source, &target).map_err(|e| TransferError::FileWriteError(e.to_string()))?;

    debug!(source = %source.display(), target = %target.display(), "上传文件已暂存");
    Ok(target)
}

// ==========================================
// StagedFile - 暂存文件守卫
// ==========================================
#[derive(Debug)]
pub struct StagedFile {
    path: PathBuf,
    armed: bool,
}

impl StagedFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            armed: true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 保留文件（交由后续任务负责删除）
    pub fn keep(mut self) -> PathBuf {
        self.armed = false;
        std::mem::take(&mut self.path)
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "暂存文件已删除"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "暂存文件删除失败"),
        }
    }
}
