//! Value formatting for answers
//!
//! Formatting only changes presentation (grouping, rounding to the stored
//! precision, date rendering). It never derives new numbers.
use crate::executor::CellValue;
use crate::schema::{SchemaDescriptor, SemanticType};
use chrono::NaiveDate;
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref AGGREGATE_CALL: Regex = Regex::new(
        r"(?i)\b(COUNT|SUM|AVG|MIN|MAX|TOTAL)\s*\(\s*(?:DISTINCT\s+)?([A-Za-z_][A-Za-z0-9_.]*|\*)"
    )
    .unwrap();
    static ref BARE_COLUMN: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*)?$").unwrap();
    static ref CALL_NAME: Regex = Regex::new(r"^([A-Za-z_]+)\s*\((.*)\)$").unwrap();
}

#[derive(Debug, Clone)]
pub struct ValueFormatter {
    currency_symbol: String,
}

impl Default for ValueFormatter {
    fn default() -> Self {
        Self::new("$")
    }
}

impl ValueFormatter {
    pub fn new(currency_symbol: &str) -> Self {
        Self {
            currency_symbol: currency_symbol.to_string(),
        }
    }

    pub fn format(&self, value: &CellValue, semantic: Option<SemanticType>) -> String {
        let number = value.as_f64();
        match (semantic, value) {
            (_, CellValue::Null) => "none".to_string(),
            (_, CellValue::Blob(len)) => format!("<{} bytes>", len),
            (Some(SemanticType::Currency), _) if number.is_some() => {
                format_currency(number.unwrap_or_default(), &self.currency_symbol)
            }
            (Some(SemanticType::Days), _) if number.is_some() => format_days(number.unwrap_or_default()),
            (Some(SemanticType::Count | SemanticType::Integer), _) if number.is_some() => {
                format_number(number.unwrap_or_default())
            }
            (Some(SemanticType::Flag), CellValue::Integer(i)) => {
                if *i == 0 { "no".to_string() } else { "yes".to_string() }
            }
            (Some(SemanticType::Date), CellValue::Text(text)) => format_date(text),
            // Untyped integers (years, ids) print as stored.
            (_, CellValue::Integer(i)) => i.to_string(),
            (_, CellValue::Real(r)) => format_number(*r),
            (_, CellValue::Text(text)) => text.clone(),
        }
    }
}

/// `1234` -> `1,234`
pub fn group_thousands(value: i64) -> String {
    let digits = value.unsigned_abs().to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    if value < 0 {
        format!("-{}", grouped)
    } else {
        grouped
    }
}

/// `1234.5` -> `$1,234.50`
pub fn format_currency(amount: f64, symbol: &str) -> String {
    let cents = (amount * 100.0).round() as i64;
    let sign = if cents < 0 { "-" } else { "" };
    let cents = cents.abs();
    format!("{}{}{}.{:02}", sign, symbol, group_thousands(cents / 100), cents % 100)
}

/// Whole numbers are grouped, fractions keep at most two places.
pub fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        return group_thousands(value as i64);
    }
    let fixed = format!("{:.2}", value);
    let trimmed = fixed.trim_end_matches('0').trim_end_matches('.');
    match trimmed.split_once('.') {
        Some((whole, frac)) => {
            let whole: i64 = whole.parse().unwrap_or_default();
            let sign = if value < 0.0 && whole == 0 { "-" } else { "" };
            format!("{}{}.{}", sign, group_thousands(whole), frac)
        }
        None => trimmed.to_string(),
    }
}

pub fn format_days(days: f64) -> String {
    let amount = format_number(days);
    if days == 1.0 {
        format!("{} day", amount)
    } else {
        format!("{} days", amount)
    }
}

/// ISO dates render as `15 Mar 2025 (2025-03-15)`; anything else is kept as stored.
pub fn format_date(text: &str) -> String {
    match NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d") {
        Ok(date) => format!("{} ({})", date.format("%-d %b %Y"), date.format("%Y-%m-%d")),
        Err(_) => text.to_string(),
    }
}

/// Semantic type of an expression such as `SUM(amount)`, `COUNT(*)` or `e.days`.
pub fn expression_semantic(expression: &str, schema: &SchemaDescriptor) -> Option<SemanticType> {
    let expression = expression.trim();

    if BARE_COLUMN.is_match(expression) {
        let column = expression.rsplit('.').next().unwrap_or(expression);
        return schema.column_semantic(column);
    }

    let caps = AGGREGATE_CALL.captures(expression)?;
    if caps[1].eq_ignore_ascii_case("COUNT") {
        return Some(SemanticType::Count);
    }
    let argument = caps[2].rsplit('.').next().unwrap_or(&caps[2]);
    match schema.column_semantic(argument)? {
        SemanticType::Flag => Some(SemanticType::Count),
        semantic => Some(semantic),
    }
}

/// Readable label for a result column: `total_amount` -> `Total amount`,
/// `SUM(amount)` -> `Sum of amount`.
pub fn column_label(name: &str) -> String {
    let base = match CALL_NAME.captures(name.trim()) {
        Some(caps) => {
            let argument = caps[2].trim();
            if argument == "*" || argument.is_empty() {
                caps[1].to_lowercase()
            } else {
                format!("{} of {}", caps[1].to_lowercase(), argument.rsplit('.').next().unwrap_or(argument))
            }
        }
        None => name.rsplit('.').next().unwrap_or(name).to_string(),
    };

    let spaced = base.replace('_', " ");
    let mut chars = spaced.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => spaced,
    }
}
