use crate::error::GenerationError;
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

lazy_static! {
    static ref CODE_FENCE: Regex = Regex::new(r"(?s)```[A-Za-z]*\s*\n?(.*?)(?:```|$)").unwrap();
    static ref SQL_LABEL: Regex = Regex::new(r"(?i)^\s*(?:sql|sqlite|query)\s*:\s*").unwrap();
    static ref REPLY_LABEL: Regex = Regex::new(r"(?i)^\s*reply\s*:").unwrap();
}

/// Model file formats llama.cpp can serve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelFormat {
    GGUF,
    /// Legacy pre-GGUF files
    GGML,
}

impl ModelFormat {
    pub fn extensions(&self) -> &[&str] {
        match self {
            ModelFormat::GGUF => &["gguf"],
            ModelFormat::GGML => &["ggml", "bin"],
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ModelFormat::GGUF => "GGUF (llama.cpp)",
            ModelFormat::GGML => "GGML (llama.cpp legacy)",
        }
    }
}

/// How to launch and reach the local model server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub model_path: PathBuf,
    pub format: ModelFormat,
    pub host: String,
    pub port: u16,
    pub context_size: u32,
    pub batch_size: u32,
    pub threads: u32,
    pub gpu_layers: u32,
    /// `llama-server` binary; when unset the server is expected to be running already
    pub runtime_binary: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::new(),
            format: ModelFormat::GGUF,
            host: "127.0.0.1".to_string(),
            port: 8081,
            context_size: 4096,
            batch_size: 256,
            threads: 4,
            gpu_layers: 0,
            runtime_binary: None,
        }
    }
}

impl RuntimeConfig {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// One completion call. Engines keep no state between requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub max_tokens: u32,
    pub stop: Vec<String>,
    pub temperature: f32,
}

/// Sampling bounds applied to every request built by the pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationSettings {
    pub max_tokens: u32,
    pub temperature: f32,
    pub stop: Vec<String>,
    pub timeout: Duration,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            max_tokens: 256,
            temperature: 0.0,
            stop: vec!["\n\n".to_string(), "Question:".to_string()],
            timeout: Duration::from_millis(30_000),
        }
    }
}

impl GenerationSettings {
    pub fn request(&self, prompt: String) -> GenerationRequest {
        GenerationRequest {
            prompt,
            max_tokens: self.max_tokens,
            stop: self.stop.clone(),
            temperature: self.temperature,
        }
    }
}

/// Capability interface over the text-generation backend
#[async_trait]
pub trait GenerationEngine: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> Result<String, GenerationError>;

    fn name(&self) -> &str;
}

/// What the model produced for one question
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// Candidate statement, still untrusted
    Sql(String),
    /// Direct answer to a message that needs no data
    Reply(String),
}

/// Classify a raw completion. Only text behind a leading `REPLY:` label is a
/// conversational reply; anything else goes on to the guard as SQL.
pub fn parse_completion(raw: &str, stop: &[String]) -> Result<Completion, GenerationError> {
    let Some(label) = REPLY_LABEL.find(raw) else {
        return extract_sql(raw, stop).map(Completion::Sql);
    };
    let text = &raw[label.end()..];
    let reply = text[..first_stop(text, stop)].trim();
    if reply.is_empty() {
        return Err(GenerationError::EmptyOutput);
    }
    Ok(Completion::Reply(reply.to_string()))
}

/// Pull the statement out of a raw completion.
///
/// Cuts at the first stop sequence, unwraps a markdown code fence and drops a
/// leading `SQL:` label. The statement text itself is never edited.
pub fn extract_sql(raw: &str, stop: &[String]) -> Result<String, GenerationError> {
    let mut text = raw.trim_start();

    // A fenced block is taken whole before stop sequences apply, so a newline
    // stop cannot cut it open.
    let fenced;
    if let Some(caps) = CODE_FENCE.captures(text) {
        fenced = caps[1].to_string();
        text = fenced.as_str();
    }

    let text = SQL_LABEL.replace(text, "");
    let sql = text[..first_stop(&text, stop)].trim();
    if sql.is_empty() {
        return Err(GenerationError::EmptyOutput);
    }
    Ok(sql.to_string())
}

fn first_stop(text: &str, stop: &[String]) -> usize {
    stop.iter()
        .filter(|s| !s.is_empty())
        .filter_map(|s| text.find(s.as_str()))
        .min()
        .unwrap_or(text.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stops() -> Vec<String> {
        GenerationSettings::default().stop
    }

    #[test]
    fn test_extract_plain() {
        let sql = extract_sql(" SELECT COUNT(*) FROM tasks WHERE done = 0", &stops()).unwrap();
        assert_eq!(sql, "SELECT COUNT(*) FROM tasks WHERE done = 0");
    }

    #[test]
    fn test_extract_strips_fence_and_label() {
        let raw = "```sql\nSELECT SUM(amount) FROM expenses\n```\nThis sums the expenses.";
        assert_eq!(extract_sql(raw, &stops()).unwrap(), "SELECT SUM(amount) FROM expenses");

        let raw = "SQL: SELECT name FROM documents";
        assert_eq!(extract_sql(raw, &stops()).unwrap(), "SELECT name FROM documents");
    }

    #[test]
    fn test_extract_cuts_at_stop_sequence() {
        let raw = "SELECT * FROM expenses\n\nQuestion: and loans?";
        assert_eq!(extract_sql(raw, &stops()).unwrap(), "SELECT * FROM expenses");
    }

    #[test]
    fn test_semicolons_are_left_for_the_guard() {
        let raw = "SELECT 1 FROM expenses; DROP TABLE expenses";
        assert_eq!(extract_sql(raw, &stops()).unwrap(), raw);
    }

    #[test]
    fn test_empty_output_is_an_error() {
        assert_eq!(extract_sql("   ", &stops()), Err(GenerationError::EmptyOutput));
        assert_eq!(extract_sql("```sql\n```", &stops()), Err(GenerationError::EmptyOutput));
        assert_eq!(extract_sql("\n\nSELECT 1", &stops()).unwrap(), "SELECT 1");
    }

    #[test]
    fn test_reply_label_marks_conversation() {
        let reply = parse_completion(" REPLY: Hello! Ask me about your expenses.\n\nQuestion: hi", &stops()).unwrap();
        assert_eq!(reply, Completion::Reply("Hello! Ask me about your expenses.".into()));

        let reply = parse_completion("reply:You're welcome.", &stops()).unwrap();
        assert_eq!(reply, Completion::Reply("You're welcome.".into()));

        assert_eq!(parse_completion("REPLY:   ", &stops()), Err(GenerationError::EmptyOutput));
    }

    #[test]
    fn test_unlabelled_prose_is_left_for_the_guard() {
        let sql = parse_completion("Sorry, I cannot help with that.", &stops()).unwrap();
        assert_eq!(sql, Completion::Sql("Sorry, I cannot help with that.".into()));

        let sql = parse_completion("SELECT 'REPLY: no' AS note FROM tasks", &stops()).unwrap();
        assert_eq!(sql, Completion::Sql("SELECT 'REPLY: no' AS note FROM tasks".into()));
    }

    #[test]
    fn test_settings_build_requests() {
        let settings = GenerationSettings {
            max_tokens: 64,
            temperature: 0.1,
            stop: vec!["\n\n".into()],
            timeout: Duration::from_secs(1),
        };
        let request = settings.request("prompt".into());
        assert_eq!(request.max_tokens, 64);
        assert_eq!(request.stop, vec!["\n\n".to_string()]);
    }
}
