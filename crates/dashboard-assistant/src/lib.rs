//! Offline natural-language questions over personal dashboard records.
//!
//! A question is resolved for relative dates, turned into SQL by a local
//! model, checked by the SQL guard, run read-only against SQLite and answered
//! from the result rows.

pub mod config;
pub mod context_engine;
pub mod error;
pub mod executor;
pub mod formatting;
pub mod metrics;
pub mod model_runtime;
pub mod pipeline;
pub mod placeholders;
pub mod schema;
pub mod sql_guard;
pub mod synthesizer;
pub mod telemetry;
pub mod utils;

// Public API exports
pub use config::Config;
pub use context_engine::{ConversationMemory, ConversationTurn, TurnOutcome};
pub use error::{AssistantError, ErrorKind, GuardReason};
pub use executor::{CellValue, ExecutionLimits, QueryExecutor, QueryResult};
pub use model_runtime::{GenerationEngine, LlamaServerEngine, ScriptedEngine};
pub use pipeline::{Answer, AssistantSession, CandidateQuery, Outcome, SessionConfig};
pub use placeholders::PlaceholderResolver;
pub use schema::SchemaDescriptor;
pub use sql_guard::SqlGuard;
pub use synthesizer::{AnswerPolicy, ResponseSynthesizer};
