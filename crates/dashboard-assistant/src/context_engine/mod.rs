//! Context engine module - conversation memory and prompt assembly

pub mod memory;
pub mod prompt_builder;

pub use memory::{ConversationMemory, ConversationTurn, TurnOutcome};
pub use prompt_builder::{PromptBuilder, PromptBuilderConfig};
