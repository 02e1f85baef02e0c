//! Builds the generation prompt from schema, recent turns and the question
//!
//! Section order is fixed: instructions, schema, recent answered turns,
//! question, `SQL:` cue. When the prompt would exceed the character budget the
//! oldest turns are dropped first; instructions, schema and question are
//! always kept.
use super::memory::ConversationTurn;
use crate::schema::SchemaDescriptor;
use crate::utils::TextUtils;
use chrono::NaiveDate;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct PromptBuilderConfig {
    /// Most recent answered turns to include
    pub max_context_turns: usize,
    pub prompt_budget_chars: usize,
}

impl Default for PromptBuilderConfig {
    fn default() -> Self {
        Self {
            max_context_turns: 3,
            prompt_budget_chars: 6000,
        }
    }
}

pub struct PromptBuilder {
    config: PromptBuilderConfig,
}

impl PromptBuilder {
    pub fn new(config: PromptBuilderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PromptBuilderConfig {
        &self.config
    }

    pub fn build(
        &self,
        schema: &SchemaDescriptor,
        turns: &[Arc<ConversationTurn>],
        resolved_question: &str,
        reference: NaiveDate,
    ) -> String {
        let header = Self::header(reference);
        let schema_section = format!("Schema:\n{}\n", schema.summary());
        let question_section = format!("Question: {}\nSQL:", TextUtils::normalize_whitespace(resolved_question));

        let fixed_len = header.len() + schema_section.len() + question_section.len();
        let examples = self.select_examples(turns, fixed_len);

        let mut prompt = String::with_capacity(fixed_len + examples.iter().map(String::len).sum::<usize>());
        prompt.push_str(&header);
        prompt.push_str(&schema_section);
        for example in &examples {
            prompt.push_str(example);
        }
        prompt.push_str(&question_section);
        prompt
    }

    fn header(reference: NaiveDate) -> String {
        let mut header = String::from(
            "You translate questions about the user's personal records into one SQLite query.\n\
             Rules:\n\
             - Reply with exactly one SELECT statement and nothing else.\n\
             - If the message needs no data (a greeting, thanks, small talk), reply instead with \
             REPLY: followed by one short sentence.\n\
             - Use only the tables and columns listed in the schema.\n\
             - Dates are TEXT 'YYYY-MM-DD'. Match a month with SUBSTR(date, 1, 7) = 'YYYY-MM' \
             and a year with SUBSTR(date, 1, 4) = 'YYYY'.\n\
             - Document expiries are documents.expiry_date; the soonest is \
             ORDER BY expiry_date ASC LIMIT 1.\n\
             - Give every aggregate an alias, e.g. SUM(amount) AS total_amount.\n",
        );
        header.push_str(&format!("- Today is {}. ", reference.format("%Y-%m-%d")));
        header.push_str(
            "You may write {{CURRENT_YEAR}}, {{CURRENT_MONTH}} (two digits), {{CURRENT_DATE}} or \
             {{YEAR_MONTH}} ('YYYY-MM'; {{YEAR_MONTH-1}} is last month, across year ends too); \
             they are filled in before the query runs.\n\n",
        );
        header
    }

    /// Newest answered turns that fit in the budget, returned oldest first.
    fn select_examples(&self, turns: &[Arc<ConversationTurn>], fixed_len: usize) -> Vec<String> {
        let mut used = fixed_len;
        let mut selected = Vec::new();

        let candidates = turns.iter().rev().filter(|t| t.is_answered()).take(self.config.max_context_turns);
        for turn in candidates {
            let example = format!(
                "Question: {}\nSQL: {}\n\n",
                TextUtils::normalize_whitespace(&turn.resolved_question),
                TextUtils::normalize_whitespace(&turn.generated_sql)
            );
            if used + example.len() > self.config.prompt_budget_chars {
                debug!("Prompt budget reached after {} turn(s), dropping older ones", selected.len());
                break;
            }
            used += example.len();
            selected.push(example);
        }

        selected.reverse();
        selected
    }
}
