// ==========================================
// 数据传输系统 - 行校验器
// ==========================================
// 职责: 按字段规则校验规范行，生成面向用户的错误信息
// 规则: `|` 分隔，如 `required|integer|min:1`，任务开始时解析一次
// 红线: 校验失败为行级错误，只返回信息，不中止任务
// ==========================================

use crate::domain::field::{CanonicalRow, CellValue, FieldSpec};
use crate::error::{TransferError, TransferResult};
use crate::importer::field_mapper::parse_date_text;
use regex::Regex;
use std::collections::HashMap;

// ==========================================
// Rule - 单条规则
// ==========================================
#[derive(Debug, Clone)]
pub enum Rule {
    Required,
    Nullable,
    String,
    Integer,
    Numeric,
    Date,
    Min(f64), // 数值下限 / 最少字符数
    Max(f64), // 数值上限 / 最多字符数
    In(Vec<String>),
    Regex(Regex),
}

impl Rule {
    fn parse(part: &str, field: &str) -> TransferResult<Self> {
        let (name, arg) = match part.split_once(':') {
            Some((name, arg)) => (name.trim(), Some(arg)),
            None => (part.trim(), None),
        };

        let invalid = |message: String| TransferError::InvalidRule {
            field: field.to_string(),
            message,
        };
        let bound = |arg: Option<&str>| -> TransferResult<f64> {
            arg.map(str::trim)
                .and_then(|a| a.parse::<f64>().ok())
                .ok_or_else(|| invalid(format!("规则 {} 需要数值参数", name)))
        };

        match name {
            "required" => Ok(Rule::Required),
            "nullable" => Ok(Rule::Nullable),
            "string" => Ok(Rule::String),
            "integer" => Ok(Rule::Integer),
            "numeric" => Ok(Rule::Numeric),
            "date" => Ok(Rule::Date),
            "min" => Ok(Rule::Min(bound(arg)?)),
            "max" => Ok(Rule::Max(bound(arg)?)),
            "in" => {
                let values: Vec<String> = arg
                    .unwrap_or_default()
                    .split(',')
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty())
                    .collect();
                if values.is_empty() {
                    return Err(invalid("规则 in 需要至少一个候选值".to_string()));
                }
                Ok(Rule::In(values))
            }
            "regex" => {
                let pattern = arg.unwrap_or_default();
                Regex::new(pattern)
                    .map(Rule::Regex)
                    .map_err(|e| invalid(format!("正则表达式无效: {}", e)))
            }
            other => Err(invalid(format!("未知规则: {}", other))),
        }
    }
}

// ==========================================
// RuleSet - 任务级规则集（字段键 → 规则列表）
// ==========================================
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    entries: Vec<(String, Vec<Rule>)>,
}

impl RuleSet {
    /// 从字段定义解析规则
    ///
    /// # 错误
    /// - InvalidRule: 未知规则或参数不合法（请求级错误）
    pub fn parse(fields: &[FieldSpec]) -> TransferResult<Self> {
        let mut entries = Vec::new();

        for field in fields {
            let rule = match field.rule.as_deref().map(str::trim) {
                Some(r) if !r.is_empty() => r,
                _ => continue,
            };

            let mut rules = Vec::new();
            let mut rest = rule;
            while !rest.is_empty() {
                // regex 参数可能包含 `|`，必须位于最后
                if rest.trim_start().starts_with("regex:") {
                    rules.push(Rule::parse(rest.trim_start(), &field.field)?);
                    break;
                }
                let (part, tail) = rest.split_once('|').unwrap_or((rest, ""));
                if !part.trim().is_empty() {
                    rules.push(Rule::parse(part, &field.field)?);
                }
                rest = tail;
            }

            entries.push((field.field.clone(), rules));
        }

        Ok(Self { entries })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// 字段键 → 列标签（错误信息引用列标签而非内部字段名）
pub fn rule_labels(fields: &[FieldSpec]) -> HashMap<String, String> {
    fields
        .iter()
        .map(|f| (f.field.clone(), f.label.clone()))
        .collect()
}

/// 校验规范行
///
/// # 返回
/// - 空列表: 校验通过
/// - 否则: 按字段顺序的全部错误信息（调用方通常取第一条）
pub fn validate(
    row: &CanonicalRow,
    rules: &RuleSet,
    labels: &HashMap<String, String>,
) -> Vec<String> {
    let mut errors = Vec::new();

    for (field, field_rules) in &rules.entries {
        let label = labels.get(field).map(String::as_str).unwrap_or(field.as_str());
        let value = row.get(field).unwrap_or(&CellValue::Empty);

        if value.is_empty() {
            if field_rules.iter().any(|r| matches!(r, Rule::Required)) {
                errors.push(format!("{}不能为空", label));
            }
            continue;
        }

        let numeric = field_rules
            .iter()
            .any(|r| matches!(r, Rule::Integer | Rule::Numeric));

        for rule in field_rules {
            if let Some(message) = check(rule, value, label, numeric) {
                errors.push(message);
                break;
            }
        }
    }

    errors
}

/// 单条规则检查（值非空）
fn check(rule: &Rule, value: &CellValue, label: &str, numeric: bool) -> Option<String> {
    match rule {
        Rule::Required | Rule::Nullable => None,
        Rule::String => match value {
            CellValue::String(_) => None,
            _ => Some(format!("{}必须是文本", label)),
        },
        Rule::Integer => match value {
            CellValue::Int(_) => None,
            CellValue::Float(f) if f.fract() == 0.0 => None,
            CellValue::String(s) if s.trim().parse::<i64>().is_ok() => None,
            _ => Some(format!("{}必须是整数", label)),
        },
        Rule::Numeric => match value.as_f64() {
            Some(_) => None,
            None => Some(format!("{}必须是数字", label)),
        },
        Rule::Date => {
            let ok = match value {
                CellValue::Date(_) | CellValue::DateTime(_) => true,
                CellValue::String(s) => parse_date_text(s).is_some(),
                _ => false,
            };
            if ok {
                None
            } else {
                Some(format!("{}不是有效的日期", label))
            }
        }
        Rule::Min(min) => {
            if numeric {
                match value.as_f64() {
                    Some(v) if v < *min => Some(format!("{}不能小于{}", label, format_bound(*min))),
                    _ => None,
                }
            } else if (char_len(value) as f64) < *min {
                Some(format!("{}长度不能少于{}个字符", label, format_bound(*min)))
            } else {
                None
            }
        }
        Rule::Max(max) => {
            if numeric {
                match value.as_f64() {
                    Some(v) if v > *max => Some(format!("{}不能大于{}", label, format_bound(*max))),
                    _ => None,
                }
            } else if (char_len(value) as f64) > *max {
                Some(format!("{}长度不能超过{}个字符", label, format_bound(*max)))
            } else {
                None
            }
        }
        Rule::In(values) => {
            let display = value.to_display();
            if values.iter().any(|v| v == display.trim()) {
                None
            } else {
                Some(format!("{}的值无效，可选值: {}", label, values.join("/")))
            }
        }
        Rule::Regex(re) => {
            if re.is_match(&value.to_display()) {
                None
            } else {
                Some(format!("{}格式不正确", label))
            }
        }
    }
}

fn char_len(value: &CellValue) -> usize {
    value.to_display().chars().count()
}

fn format_bound(bound: f64) -> String {
    CellValue::Float(bound).to_display()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn fields() -> Vec<FieldSpec> {
        vec![
            FieldSpec::new("name", "姓名").with_rule("required|string|max:4"),
            FieldSpec::new("age", "年龄").with_rule("nullable|integer|min:18|max:65"),
            FieldSpec::new("gender", "性别").with_rule("in:男,女"),
            FieldSpec::new("born", "出生日期").with_rule("date"),
            FieldSpec::new("phone", "手机号").with_rule("regex:^1[3-9]\\d{9}$|^$"),
            FieldSpec::new("memo", "备注"),
        ]
    }

    fn row(pairs: Vec<(&str, CellValue)>) -> CanonicalRow {
        pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    fn run(row: &CanonicalRow) -> Vec<String> {
        let fields = fields();
        let rules = RuleSet::parse(&fields).unwrap();
        validate(row, &rules, &rule_labels(&fields))
    }

    #[test]
    fn test_valid_row_passes() {
        let r = row(vec![
            ("name", "张三".into()),
            ("age", CellValue::Int(30)),
            ("gender", "男".into()),
            ("born", CellValue::Date(NaiveDate::from_ymd_opt(1994, 5, 1).unwrap())),
            ("phone", "13800138000".into()),
        ]);
        assert!(run(&r).is_empty());
    }

    #[test]
    fn test_required_uses_label() {
        let r = row(vec![("name", CellValue::Empty)]);
        assert_eq!(run(&r), vec!["姓名不能为空".to_string()]);
    }

    #[test]
    fn test_numeric_bounds_vs_length_bounds() {
        let r = row(vec![("name", "欧阳娜娜娜".into()), ("age", "17".into())]);
        let errors = run(&r);
        assert_eq!(
            errors,
            vec![
                "姓名长度不能超过4个字符".to_string(),
                "年龄不能小于18".to_string()
            ]
        );
    }

    #[test]
    fn test_in_and_date_rules() {
        let r = row(vec![
            ("name", "李四".into()),
            ("gender", "未知".into()),
            ("born", "不是日期".into()),
        ]);
        let errors = run(&r);
        assert_eq!(errors.len(), 2);
        assert!(errors[0].starts_with("性别的值无效"));
        assert_eq!(errors[1], "出生日期不是有效的日期");
    }

    #[test]
    fn test_regex_may_contain_pipe() {
        let fields = vec![FieldSpec::new("code", "编码").with_rule("required|regex:^(A|B)\\d+$")];
        let rules = RuleSet::parse(&fields).unwrap();
        let labels = rule_labels(&fields);

        assert!(validate(&row(vec![("code", "A12".into())]), &rules, &labels).is_empty());
        assert_eq!(
            validate(&row(vec![("code", "C12".into())]), &rules, &labels),
            vec!["编码格式不正确".to_string()]
        );
    }

    #[test]
    fn test_unknown_rule_is_request_error() {
        let fields = vec![FieldSpec::new("x", "X").with_rule("required|uuid")];
        let err = RuleSet::parse(&fields).unwrap_err();
        assert!(matches!(err, TransferError::InvalidRule { .. }));
        assert!(err.is_request_level());

        let bad_bound = vec![FieldSpec::new("x", "X").with_rule("max:abc")];
        assert!(RuleSet::parse(&bad_bound).is_err());
    }
}
