// ==========================================
// 数据传输系统 - 字段映射器
// ==========================================
// 职责: 原始行（按列头） → 规范行（按字段键） + 类型转换
// 对应: map / unmap（错误报告需展示用户上传的原始内容）
// 约定:
// - 第 i 个字段对应第 i 个列头；列头缺失则跳过该字段
// - 无法识别的值一律转为空值，不报错（由校验器决定是否报错）
// ==========================================

use crate::domain::field::{CanonicalRow, CellValue, FieldSpec, FieldType, RawRow};
use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};

/// 支持的日期文本格式
const DATE_FORMATS: [&str; 4] = ["%Y-%m-%d", "%Y/%m/%d", "%Y%m%d", "%Y.%m.%d"];

/// 支持的日期时间文本格式
const DATETIME_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S", "%Y/%m/%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];

/// 原始行 → 规范行
pub fn map(fields: &[FieldSpec], headers: &[String], raw: &RawRow) -> CanonicalRow {
    let mut row = CanonicalRow::new();

    for (index, field) in fields.iter().enumerate() {
        let header = match headers.get(index) {
            Some(h) if !h.trim().is_empty() => h,
            _ => continue,
        };

        let value = raw.get(header).cloned().unwrap_or(CellValue::Empty);
        row.insert(field.field.clone(), coerce(value, field.field_type));
    }

    row
}

/// 规范行 → 原始展示值（按列头顺序）
pub fn unmap(fields: &[FieldSpec], headers: &[String], row: &CanonicalRow) -> Vec<String> {
    headers
        .iter()
        .enumerate()
        .map(|(index, _)| {
            fields
                .get(index)
                .and_then(|field| row.get(&field.field))
                .map(CellValue::to_display)
                .unwrap_or_default()
        })
        .collect()
}

/// 错误报告回显内容
///
/// 以 unmap 结果为准；转换后为空而原始单元格非空的（如无法识别的日期），
/// 回显原始单元格，保证用户看到自己上传的内容
pub fn echo_values(
    fields: &[FieldSpec],
    headers: &[String],
    raw: &RawRow,
    row: &CanonicalRow,
) -> Vec<String> {
    let mut values = unmap(fields, headers, row);
    for (index, header) in headers.iter().enumerate() {
        let keep_raw = fields
            .get(index)
            .map(|f| f.field_type == Some(FieldType::String))
            .unwrap_or(true);

        if keep_raw || values[index].is_empty() {
            if let Some(cell) = raw.get(header) {
                values[index] = cell.to_display();
            }
        }
    }
    values
}

/// 按字段类型转换单元格值
fn coerce(value: CellValue, field_type: Option<FieldType>) -> CellValue {
    if value.is_empty() {
        return CellValue::Empty;
    }

    match field_type {
        None => value,
        Some(FieldType::String) => CellValue::String(value.to_display()),
        Some(FieldType::Date) => coerce_date(&value).map(CellValue::Date).unwrap_or(CellValue::Empty),
        Some(FieldType::Number) => coerce_number(&value),
    }
}

/// 表格日期序列号/日期文本 → 日历日期
pub fn coerce_date(value: &CellValue) -> Option<NaiveDate> {
    match value {
        CellValue::Date(d) => Some(*d),
        CellValue::DateTime(dt) => Some(dt.date()),
        CellValue::Int(i) => excel_serial_to_date(*i as f64),
        CellValue::Float(f) => excel_serial_to_date(*f),
        CellValue::String(s) => parse_date_text(s),
        CellValue::Empty | CellValue::Bool(_) => None,
    }
}

fn coerce_number(value: &CellValue) -> CellValue {
    match value {
        CellValue::Int(_) | CellValue::Float(_) => value.clone(),
        CellValue::String(s) => {
            let text = s.trim();
            if let Ok(i) = text.parse::<i64>() {
                CellValue::Int(i)
            } else if let Ok(f) = text.parse::<f64>() {
                CellValue::Float(f)
            } else {
                CellValue::Empty
            }
        }
        _ => CellValue::Empty,
    }
}

/// 解析日期文本（兼容日期时间文本与序列号文本）
pub fn parse_date_text(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(text, format) {
            return Some(date);
        }
    }
    for format in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, format) {
            return Some(dt.date());
        }
    }

    // "45356" 这类以文本形式保存的序列号
    text.parse::<f64>().ok().and_then(excel_serial_to_date)
}

/// 表格日期序列号 → 日期
///
/// 1900 日期系统: 1 = 1900-01-01；61 起以 1899-12-30 为基准。
/// 序列号 60 是表格沿用的不存在日期 1900-02-29，不对应任何日历日期，返回 None
pub fn excel_serial_to_date(serial: f64) -> Option<NaiveDate> {
    excel_serial_to_datetime(serial).map(|dt| dt.date())
}

/// 表格日期时间序列号 → 日期时间（小数部分为一天内的时间）
pub fn excel_serial_to_datetime(serial: f64) -> Option<NaiveDateTime> {
    if !serial.is_finite() || serial < 1.0 || serial > 2_958_465.0 {
        return None;
    }

    let days = serial.trunc() as i64;
    if days == 60 {
        return None;
    }
    let base = if days < 61 {
        NaiveDate::from_ymd_opt(1899, 12, 31)?
    } else {
        NaiveDate::from_ymd_opt(1899, 12, 30)?
    };

    let date = base.checked_add_signed(Duration::days(days))?;
    let seconds = ((serial - serial.trunc()) * 86_400.0).round() as u32;
    let time = NaiveTime::from_num_seconds_from_midnight_opt(seconds.min(86_399), 0)?;
    Some(date.and_time(time))
}
