//! Typed failure taxonomy for the question pipeline
//!
//! Every stage returns its own error type; `AssistantError` wraps them so the
//! session can tell the user which stage failed.
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GenerationError {
    #[error("model runtime unavailable: {0}")]
    Unavailable(String),

    #[error("generation timed out after {0} ms")]
    Timeout(u64),

    #[error("model backend returned {status}: {body}")]
    Backend { status: u16, body: String },

    #[error("malformed model response: {0}")]
    Malformed(String),

    #[error("model returned no SQL")]
    EmptyOutput,
}

/// Why the guard refused a candidate statement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GuardReason {
    Empty,
    Lexical,
    MultipleStatements,
    NotReadOnly,
    UnknownTable,
    UnknownColumn,
    DisallowedFunction,
}

impl GuardReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            GuardReason::Empty => "empty",
            GuardReason::Lexical => "lexical",
            GuardReason::MultipleStatements => "multiple_statements",
            GuardReason::NotReadOnly => "not_read_only",
            GuardReason::UnknownTable => "unknown_table",
            GuardReason::UnknownColumn => "unknown_column",
            GuardReason::DisallowedFunction => "disallowed_function",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{} ({})", .reason.as_str(), .detail)]
pub struct GuardError {
    pub reason: GuardReason,
    pub detail: String,
}

impl GuardError {
    pub fn new(reason: GuardReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("database unavailable: {0}")]
    Connection(String),

    #[error("query failed: {0}")]
    Query(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResourceLimitError {
    #[error("query returned more than {limit} rows")]
    TooManyRows { limit: usize },

    #[error("query exceeded its {0} ms budget")]
    Timeout(u64),
}

/// Executor failures keep limit breaches apart from store errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    ResourceLimit(#[from] ResourceLimitError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Generation,
    GenerationTimeout,
    Guard(GuardReason),
    Execution,
    RowLimit,
    QueryTimeout,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AssistantError {
    #[error("generation failed: {0}")]
    Generation(#[from] GenerationError),

    #[error("guard rejected query: {0}")]
    Guard(#[from] GuardError),

    #[error("execution failed: {0}")]
    Execution(#[from] ExecutionError),

    #[error("resource limit: {0}")]
    ResourceLimit(#[from] ResourceLimitError),
}

impl From<ExecutorError> for AssistantError {
    fn from(e: ExecutorError) -> Self {
        match e {
            ExecutorError::Execution(e) => AssistantError::Execution(e),
            ExecutorError::ResourceLimit(e) => AssistantError::ResourceLimit(e),
        }
    }
}

impl AssistantError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AssistantError::Generation(GenerationError::Timeout(_)) => ErrorKind::GenerationTimeout,
            AssistantError::Generation(_) => ErrorKind::Generation,
            AssistantError::Guard(e) => ErrorKind::Guard(e.reason),
            AssistantError::Execution(_) => ErrorKind::Execution,
            AssistantError::ResourceLimit(ResourceLimitError::TooManyRows { .. }) => ErrorKind::RowLimit,
            AssistantError::ResourceLimit(ResourceLimitError::Timeout(_)) => ErrorKind::QueryTimeout,
        }
    }

    /// Stage-specific message shown to the user.
    pub fn user_message(&self) -> String {
        match self {
            AssistantError::Generation(GenerationError::Timeout(_)) => {
                "The language model is taking too long to answer. Try a shorter or simpler question.".to_string()
            }
            AssistantError::Generation(GenerationError::Unavailable(_)) => {
                "The local language model isn't available right now. Check MODEL_PATH and that the model server is running.".to_string()
            }
            AssistantError::Generation(_) => {
                "The language model didn't produce a usable query. Try rephrasing your question.".to_string()
            }
            AssistantError::Guard(e) => match e.reason {
                GuardReason::UnknownTable | GuardReason::UnknownColumn => format!(
                    "I couldn't safely translate that into a query: it referred to data I don't track ({}). Try naming expenses, loans, leave, documents, allowances or tasks.",
                    e.detail
                ),
                _ => "I couldn't safely translate that into a query. I can only read your records, one question at a time.".to_string(),
            },
            AssistantError::Execution(_) => {
                "The query I built failed when reading your records. Try rephrasing, for example by naming the record type explicitly.".to_string()
            }
            AssistantError::ResourceLimit(ResourceLimitError::TooManyRows { limit }) => format!(
                "That matches more than {} records. Try narrowing it down, for example by month or category.",
                limit
            ),
            AssistantError::ResourceLimit(ResourceLimitError::Timeout(_)) => {
                "That's taking too long, try a narrower question.".to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_are_distinct_per_stage() {
        let errors = [
            AssistantError::from(GenerationError::EmptyOutput),
            AssistantError::from(GenerationError::Timeout(10)),
            AssistantError::from(GuardError::new(GuardReason::NotReadOnly, "DROP")),
            AssistantError::from(ExecutionError::Query("no such column".into())),
            AssistantError::from(ResourceLimitError::TooManyRows { limit: 5 }),
            AssistantError::from(ResourceLimitError::Timeout(10)),
        ];
        let kinds: std::collections::HashSet<_> = errors.iter().map(|e| e.kind()).collect();
        assert_eq!(kinds.len(), errors.len());

        let messages: std::collections::HashSet<_> = errors.iter().map(|e| e.user_message()).collect();
        assert_eq!(messages.len(), errors.len());
    }

    #[test]
    fn test_guard_message_is_specific() {
        let err = AssistantError::from(GuardError::new(GuardReason::NotReadOnly, "DROP"));
        assert!(err.user_message().starts_with("I couldn't safely translate that into a query"));
    }

    #[test]
    fn test_query_timeout_message() {
        let err = AssistantError::from(ExecutorError::from(ResourceLimitError::Timeout(500)));
        assert_eq!(err.kind(), ErrorKind::QueryTimeout);
        assert_eq!(err.user_message(), "That's taking too long, try a narrower question.");
    }
}
