//! Short-term conversation memory
//!
//! A bounded FIFO of immutable turns owned by one session. Appending is the
//! only mutation; the oldest turn is evicted once capacity is reached.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TurnOutcome {
    /// Query ran and produced an answer
    Answered,
    /// Query ran and matched nothing
    NoData,
    /// Guard refused the generated SQL
    Rejected,
    /// Validated SQL failed at the store
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub question: String,
    pub resolved_question: String,
    /// Validated SQL for executed turns, the raw candidate otherwise
    pub generated_sql: String,
    pub result_summary: String,
    pub outcome: TurnOutcome,
    pub timestamp: DateTime<Utc>,
}

impl ConversationTurn {
    /// Turns whose SQL passed the guard and ran, usable as prompt context.
    pub fn is_answered(&self) -> bool {
        matches!(self.outcome, TurnOutcome::Answered | TurnOutcome::NoData)
    }
}

#[derive(Debug, Clone)]
pub struct ConversationMemory {
    turns: VecDeque<Arc<ConversationTurn>>,
    capacity: usize,
}

impl Default for ConversationMemory {
    fn default() -> Self {
        Self::new(8)
    }
}

impl ConversationMemory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            turns: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn append(&mut self, turn: ConversationTurn) -> Arc<ConversationTurn> {
        if self.turns.len() == self.capacity {
            if let Some(evicted) = self.turns.pop_front() {
                debug!("Evicting oldest turn: {}", evicted.question);
            }
        }
        let turn = Arc::new(turn);
        self.turns.push_back(Arc::clone(&turn));
        turn
    }

    /// Up to `max_turns` most recent turns, oldest first.
    pub fn context(&self, max_turns: usize) -> Vec<Arc<ConversationTurn>> {
        let skip = self.turns.len().saturating_sub(max_turns);
        self.turns.iter().skip(skip).cloned().collect()
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
