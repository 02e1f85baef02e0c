//! Model runtime - text generation behind the `GenerationEngine` trait
//!
//! Architecture:
//! - The pipeline depends only on the trait, so any backend can be substituted
//! - The production backend is llama.cpp's `llama-server` over HTTP
//! - `ScriptedEngine` replays canned completions for offline runs and tests
pub mod runtime_trait;
pub mod llama_server;
pub mod format_detector;
pub mod scripted;

pub use runtime_trait::{
    extract_sql, parse_completion, Completion, GenerationEngine, GenerationRequest, GenerationSettings,
    ModelFormat, RuntimeConfig,
};
pub use llama_server::LlamaServerEngine;
pub use format_detector::FormatDetector;
pub use scripted::ScriptedEngine;
