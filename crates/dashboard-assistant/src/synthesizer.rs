//! Response synthesis
//!
//! Turns a `QueryResult` into an answer. The deterministic answer is built from
//! the result cells alone. Optional model phrasing only sees that answer with
//! every value masked as `[V1]`, `[V2]`, ..., and its reply is accepted only if
//! the masks come back intact and no other digits were added; the masks are
//! then filled with the formatted values. Numbers in the answer therefore
//! always come from the result.
use crate::executor::{CellValue, QueryResult};
use crate::formatting::{column_label, expression_semantic, ValueFormatter};
use crate::model_runtime::{GenerationEngine, GenerationSettings};
use crate::pipeline::Outcome;
use crate::schema::{SchemaDescriptor, SemanticType};
use crate::utils::TextUtils;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

pub const NO_DATA_ANSWER: &str = "I couldn't find any matching records for that question.";

/// How results with more than one row are presented
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnswerPolicy {
    /// List up to `max_rows` rows, then state how many were left out
    Enumerate { max_rows: usize },
    /// Row count, the columns, and the first row
    Summarize,
}

impl Default for AnswerPolicy {
    fn default() -> Self {
        AnswerPolicy::Enumerate { max_rows: 10 }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Part {
    Fixed(String),
    Value(String),
}

/// A synthesized answer plus the pieces needed to rephrase it safely
#[derive(Debug, Clone, PartialEq)]
pub struct Synthesis {
    pub text: String,
    pub outcome: Outcome,
    parts: Vec<Part>,
}

impl Synthesis {
    fn from_parts(parts: Vec<Part>, outcome: Outcome) -> Self {
        let text = parts
            .iter()
            .map(|p| match p {
                Part::Fixed(s) | Part::Value(s) => s.as_str(),
            })
            .collect();
        Self { text, outcome, parts }
    }

    /// Formatted values in answer order.
    pub fn values(&self) -> Vec<&str> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Value(v) => Some(v.as_str()),
                Part::Fixed(_) => None,
            })
            .collect()
    }

    /// The answer with each value replaced by its mask.
    pub fn masked(&self) -> String {
        let mut index = 0;
        self.parts
            .iter()
            .map(|p| match p {
                Part::Fixed(s) => s.clone(),
                Part::Value(_) => {
                    index += 1;
                    format!("[V{}]", index)
                }
            })
            .collect()
    }

    /// Fill masks in a model rewording, or `None` if the rewording dropped,
    /// duplicated or invented values.
    pub fn unmask(&self, reply: &str) -> Option<String> {
        let reply = reply.trim();
        if reply.is_empty() {
            return None;
        }

        let values = self.values();
        for i in 1..=values.len() {
            if reply.matches(&format!("[V{}]", i)).count() != 1 {
                return None;
            }
        }

        let mask = Regex::new(r"\[V(\d+)\]").ok()?;
        let stripped = mask.replace_all(reply, "");
        if TextUtils::has_digits(&stripped) {
            return None;
        }
        // Masks beyond the value count would survive as stray digits.
        if mask.captures_iter(reply).count() != values.len() {
            return None;
        }

        let filled = mask.replace_all(reply, |caps: &regex::Captures| {
            let index: usize = caps[1].parse().unwrap_or(0);
            values.get(index.wrapping_sub(1)).copied().unwrap_or("").to_string()
        });
        Some(filled.into_owned())
    }
}

#[derive(Debug, Clone)]
pub struct SynthesizerConfig {
    pub policy: AnswerPolicy,
    pub currency_symbol: String,
}

impl Default for SynthesizerConfig {
    fn default() -> Self {
        Self {
            policy: AnswerPolicy::default(),
            currency_symbol: "$".to_string(),
        }
    }
}

pub struct ResponseSynthesizer {
    schema: Arc<SchemaDescriptor>,
    formatter: ValueFormatter,
    policy: AnswerPolicy,
}

impl ResponseSynthesizer {
    pub fn new(schema: Arc<SchemaDescriptor>, config: SynthesizerConfig) -> Self {
        Self {
            schema,
            formatter: ValueFormatter::new(&config.currency_symbol),
            policy: config.policy,
        }
    }

    /// Deterministic answer for `result`, produced by `sql`.
    pub fn synthesize(&self, question: &str, sql: &str, result: &QueryResult) -> Synthesis {
        if is_no_data(result) {
            debug!("No data for question: {}", question);
            return Synthesis::from_parts(vec![Part::Fixed(NO_DATA_ANSWER.to_string())], Outcome::NoData);
        }

        let semantics: Vec<Option<SemanticType>> =
            result.columns.iter().map(|c| self.column_semantic(c, sql)).collect();

        let parts = if let Some(value) = result.single_value() {
            vec![
                Part::Fixed(format!("{}: ", column_label(&result.columns[0]))),
                Part::Value(self.formatter.format(value, semantics[0])),
            ]
        } else if result.row_count() == 1 {
            self.row_parts(&result.columns, &result.rows[0], &semantics)
        } else {
            match self.policy {
                AnswerPolicy::Enumerate { max_rows } => self.enumerate(result, &semantics, max_rows),
                AnswerPolicy::Summarize => self.summarize(result, &semantics),
            }
        };

        Synthesis::from_parts(parts, Outcome::Success)
    }

    /// Ask the engine to reword `synthesis` conversationally. Falls back to the
    /// deterministic text on any failure or unsafe reply.
    pub async fn phrase(
        &self,
        engine: &dyn GenerationEngine,
        settings: &GenerationSettings,
        question: &str,
        synthesis: &Synthesis,
    ) -> String {
        if synthesis.outcome != Outcome::Success {
            return synthesis.text.clone();
        }

        let prompt = phrasing_prompt(question, &synthesis.masked());
        let request = settings.request(prompt);
        let reply = match tokio::time::timeout(settings.timeout, engine.generate(request)).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                warn!("Phrasing failed, using plain answer: {}", e);
                return synthesis.text.clone();
            }
            Err(_) => {
                warn!("Phrasing timed out, using plain answer");
                return synthesis.text.clone();
            }
        };

        match synthesis.unmask(&reply) {
            Some(text) => text,
            None => {
                debug!("Rejected phrasing that altered values: {}", reply.trim());
                synthesis.text.clone()
            }
        }
    }

    fn column_semantic(&self, column: &str, sql: &str) -> Option<SemanticType> {
        expression_semantic(column, &self.schema)
            .or_else(|| alias_expression(sql, column).and_then(|e| expression_semantic(&e, &self.schema)))
    }

    fn row_parts(&self, columns: &[String], row: &[CellValue], semantics: &[Option<SemanticType>]) -> Vec<Part> {
        let mut parts = Vec::new();
        for (i, (column, cell)) in columns.iter().zip(row).enumerate() {
            let label = column_label(column);
            let prefix = if i == 0 { format!("{}: ", label) } else { format!(", {}: ", label) };
            parts.push(Part::Fixed(prefix));
            parts.push(Part::Value(self.formatter.format(cell, semantics[i])));
        }
        parts
    }

    fn enumerate(&self, result: &QueryResult, semantics: &[Option<SemanticType>], max_rows: usize) -> Vec<Part> {
        let total = result.row_count();
        let mut parts = vec![
            Part::Fixed("Found ".to_string()),
            Part::Value(total.to_string()),
            Part::Fixed(" records:".to_string()),
        ];

        let single_column = result.columns.len() == 1;
        for row in result.rows.iter().take(max_rows) {
            parts.push(Part::Fixed("\n- ".to_string()));
            if single_column {
                parts.push(Part::Value(self.formatter.format(&row[0], semantics[0])));
            } else {
                parts.extend(self.row_parts(&result.columns, row, semantics));
            }
        }

        if total > max_rows {
            parts.push(Part::Fixed("\n(Showing the first ".to_string()));
            parts.push(Part::Value(max_rows.to_string()));
            parts.push(Part::Fixed(" of ".to_string()));
            parts.push(Part::Value(total.to_string()));
            parts.push(Part::Fixed(" rows.)".to_string()));
        }
        parts
    }

    fn summarize(&self, result: &QueryResult, semantics: &[Option<SemanticType>]) -> Vec<Part> {
        let columns: Vec<String> = result.columns.iter().map(|c| column_label(c)).collect();
        let mut parts = vec![
            Part::Value(result.row_count().to_string()),
            Part::Fixed(format!(" rows with columns {}. First row: ", columns.join(", "))),
        ];
        parts.extend(self.row_parts(&result.columns, &result.rows[0], semantics));
        parts
    }
}

/// Zero rows, or the single all-NULL row an aggregate returns over no rows.
pub fn is_no_data(result: &QueryResult) -> bool {
    match result.rows.as_slice() {
        [] => true,
        [row] => row.iter().all(CellValue::is_null),
        _ => false,
    }
}

/// The expression a statement aliases to `alias`, e.g. `SUM(amount)` for
/// `SELECT SUM(amount) AS total ...`.
fn alias_expression(sql: &str, alias: &str) -> Option<String> {
    let pattern = format!(r#"(?i)\bAS\s+["`\[]?{}["`\]]?(?:\s|,|$)"#, regex::escape(alias));
    let found = Regex::new(&pattern).ok()?.find(sql)?;

    // Walk back to the start of the select-list item.
    let head = &sql[..found.start()];
    let mut depth = 0i32;
    let mut start = 0;
    for (i, ch) in head.char_indices().rev() {
        match ch {
            ')' => depth += 1,
            '(' if depth == 0 => {
                start = i + 1;
                break;
            }
            '(' => depth -= 1,
            ',' if depth == 0 => {
                start = i + 1;
                break;
            }
            _ => {}
        }
    }

    let expression = head[start..].trim();
    let expression = strip_leading_keyword(expression, "SELECT");
    let expression = strip_leading_keyword(expression, "DISTINCT");
    (!expression.is_empty()).then(|| expression.to_string())
}

fn strip_leading_keyword<'a>(text: &'a str, keyword: &str) -> &'a str {
    match text.get(..keyword.len()) {
        Some(head) if head.eq_ignore_ascii_case(keyword) => text[keyword.len()..].trim_start(),
        _ => text,
    }
}

fn phrasing_prompt(question: &str, masked_answer: &str) -> String {
    format!(
        "Rewrite the answer as one or two friendly sentences that reply to the question.\n\
         Keep every placeholder such as [V1] exactly once and do not write any other numbers.\n\
         Question: {}\nAnswer: {}\nRewritten:",
        question, masked_answer
    )
}
