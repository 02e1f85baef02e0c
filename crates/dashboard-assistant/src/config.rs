//! Startup configuration from the environment (and `.env`)

use crate::context_engine::PromptBuilderConfig;
use crate::executor::ExecutionLimits;
use crate::model_runtime::{FormatDetector, GenerationSettings, ModelFormat, RuntimeConfig};
use crate::synthesizer::{AnswerPolicy, SynthesizerConfig};
use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct Config {
    pub model_path: String,
    pub llama_bin: Option<String>,
    pub llama_host: String,
    pub llama_port: u16,
    pub ctx_size: u32,
    pub batch_size: u32,
    pub threads: u32,
    pub gpu_layers: u32,
    pub db_path: String,
    pub max_context_turns: usize,
    pub memory_capacity: usize,
    pub prompt_budget_chars: usize,
    pub max_rows: usize,
    pub generation_timeout_ms: u64,
    pub query_timeout_ms: u64,
    pub temperature: f32,
    pub max_tokens: u32,
    pub stop_sequences: Vec<String>,
    pub answer_policy: AnswerPolicy,
    pub phrase_answers: bool,
    pub currency_symbol: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(|_| {})
    }

    /// Load `.env` and the process environment, apply `overrides` (command
    /// line flags), then validate.
    pub fn from_env_with<O>(overrides: O) -> Result<Self>
    where
        O: FnOnce(&mut Self),
    {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }

        Self::from_vars_with(|key| env::var(key).ok(), overrides)
    }

    pub fn from_vars_with<F, O>(get: F, overrides: O) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
        O: FnOnce(&mut Self),
    {
        let mut config = Self::from_vars(get)?;
        overrides(&mut config);
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from any key lookup; missing keys take defaults.
    pub fn from_vars<F>(get: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let model_path = get("MODEL_PATH").unwrap_or_default();
        let llama_bin = get("LLAMA_BIN").filter(|s| !s.trim().is_empty());

        let threads = match get("THREADS").as_deref() {
            None | Some("auto") => Self::auto_detect_threads(),
            Some(value) => parse_value("THREADS", value)?,
        };
        let ctx_size = match get("CTX_SIZE").as_deref() {
            None | Some("auto") => Self::auto_detect_ctx_size(&model_path),
            Some(value) => parse_value("CTX_SIZE", value)?,
        };
        let batch_size = match get("BATCH_SIZE").as_deref() {
            None | Some("auto") => Self::batch_size_for_ctx(ctx_size),
            Some(value) => parse_value("BATCH_SIZE", value)?,
        };

        let answer_policy = match get("ANSWER_POLICY").as_deref().map(str::to_ascii_lowercase).as_deref() {
            None | Some("enumerate") | Some("list") => AnswerPolicy::Enumerate {
                max_rows: parse_or(&get, "ANSWER_LIST_ROWS", 10)?,
            },
            Some("summarize") | Some("summary") => AnswerPolicy::Summarize,
            Some(other) => {
                return Err(anyhow::anyhow!(
                    "Invalid ANSWER_POLICY '{}': expected 'enumerate' or 'summarize'",
                    other
                ))
            }
        };

        let stop_sequences = match get("STOP_SEQUENCES") {
            Some(raw) => parse_stop_sequences(&raw),
            None => GenerationSettings::default().stop,
        };

        Ok(Self {
            model_path,
            llama_bin,
            llama_host: get("LLAMA_HOST").unwrap_or_else(|| "127.0.0.1".into()),
            llama_port: parse_or(&get, "LLAMA_PORT", 8081)?,
            ctx_size,
            batch_size,
            threads,
            gpu_layers: parse_or(&get, "GPU_LAYERS", 0)?,
            db_path: get("DB_PATH").unwrap_or_else(|| "dashboard.db".into()),
            max_context_turns: parse_or(&get, "MAX_CONTEXT_TURNS", 3)?,
            memory_capacity: parse_or(&get, "MEMORY_CAPACITY", 8)?,
            prompt_budget_chars: parse_or(&get, "PROMPT_BUDGET_CHARS", 6000)?,
            max_rows: parse_or(&get, "MAX_ROWS", 200)?,
            generation_timeout_ms: parse_or(&get, "GENERATION_TIMEOUT_MS", 30_000)?,
            query_timeout_ms: parse_or(&get, "QUERY_TIMEOUT_MS", 2_000)?,
            temperature: parse_or(&get, "TEMPERATURE", 0.0)?,
            max_tokens: parse_or(&get, "MAX_TOKENS", 256)?,
            stop_sequences,
            answer_policy,
            phrase_answers: parse_flag(&get, "PHRASE_ANSWERS")?,
            currency_symbol: get("CURRENCY_SYMBOL").unwrap_or_else(|| "$".into()),
        })
    }

    /// Checks that need the filesystem: the model when we launch the server,
    /// and the records database.
    pub fn validate(&self) -> Result<()> {
        if let Some(bin) = &self.llama_bin {
            if !std::path::Path::new(bin).exists() {
                return Err(anyhow::anyhow!(
                    "Llama binary not found at: {}. Please check LLAMA_BIN in .env file.",
                    bin
                ));
            }
            if self.model_path.is_empty() {
                return Err(anyhow::anyhow!("MODEL_PATH must be set when LLAMA_BIN is set"));
            }
            FormatDetector::validate_model(std::path::Path::new(&self.model_path))
                .context("MODEL_PATH is not a loadable model")?;
        }

        if !std::path::Path::new(&self.db_path).exists() {
            return Err(anyhow::anyhow!(
                "Records database not found at: {}. Please check DB_PATH.",
                self.db_path
            ));
        }

        if self.max_rows == 0 {
            return Err(anyhow::anyhow!("MAX_ROWS must be at least 1"));
        }
        Ok(())
    }

    fn auto_detect_threads() -> u32 {
        let num_cpus = num_cpus::get() as u32;
        info!("Auto-detected CPU cores: {}", num_cpus);

        match num_cpus {
            0..=2 => 1,
            3..=4 => (num_cpus * 2) / 3,
            5..=8 => (num_cpus * 3) / 5,
            9..=16 => num_cpus / 2,
            17..=32 => (num_cpus * 2) / 5,
            _ => 16,
        }
    }

    fn auto_detect_ctx_size(model_path: &str) -> u32 {
        let inferred = Self::read_ctx_size_from_model_path(model_path);
        info!("Context size: {} (inferred from model name)", inferred);
        inferred
    }

    /// Heuristic from common GGUF filename patterns. Prompts here are short,
    /// so the default stays small.
    fn read_ctx_size_from_model_path(model_path: &str) -> u32 {
        let name = std::path::Path::new(model_path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(model_path)
            .to_lowercase();

        if name.contains("32k") {
            32768
        } else if name.contains("16k") {
            16384
        } else if name.contains("8k") {
            8192
        } else if name.contains("2k") {
            2048
        } else {
            4096
        }
    }

    fn batch_size_for_ctx(ctx_size: u32) -> u32 {
        match ctx_size {
            0..=2048 => 512,
            2049..=4096 => 384,
            4097..=8192 => 256,
            8193..=16384 => 128,
            _ => 64,
        }
    }

    pub fn model_format(&self) -> Option<ModelFormat> {
        FormatDetector::detect_from_path(std::path::Path::new(&self.model_path))
    }

    pub fn backend_url(&self) -> String {
        format!("http://{}:{}", self.llama_host, self.llama_port)
    }

    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            model_path: PathBuf::from(&self.model_path),
            format: self.model_format().unwrap_or(ModelFormat::GGUF),
            host: self.llama_host.clone(),
            port: self.llama_port,
            context_size: self.ctx_size,
            batch_size: self.batch_size,
            threads: self.threads,
            gpu_layers: self.gpu_layers,
            runtime_binary: self.llama_bin.as_ref().map(PathBuf::from),
        }
    }

    pub fn generation_settings(&self) -> GenerationSettings {
        GenerationSettings {
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            stop: self.stop_sequences.clone(),
            timeout: Duration::from_millis(self.generation_timeout_ms),
        }
    }

    pub fn execution_limits(&self) -> ExecutionLimits {
        ExecutionLimits {
            max_rows: self.max_rows,
            timeout: Duration::from_millis(self.query_timeout_ms),
        }
    }

    pub fn prompt_config(&self) -> PromptBuilderConfig {
        PromptBuilderConfig {
            max_context_turns: self.max_context_turns,
            prompt_budget_chars: self.prompt_budget_chars,
        }
    }

    pub fn synthesizer_config(&self) -> SynthesizerConfig {
        SynthesizerConfig {
            policy: self.answer_policy,
            currency_symbol: self.currency_symbol.clone(),
        }
    }

    pub fn print_config(&self) {
        info!("Current Configuration:");
        info!("- Model Path: {}", if self.model_path.is_empty() { "(not set)" } else { &self.model_path });
        info!("- Llama Binary: {}", self.llama_bin.as_deref().unwrap_or("(external server)"));
        info!("- Backend URL: {}", self.backend_url());
        info!("- Context Size: {}", self.ctx_size);
        info!("- Batch Size: {}", self.batch_size);
        info!("- Threads: {}", self.threads);
        info!("- GPU Layers: {}", self.gpu_layers);
        info!("- Database: {}", self.db_path);
        info!("- Context Turns: {} (memory holds {})", self.max_context_turns, self.memory_capacity);
        info!("- Prompt Budget: {} chars", self.prompt_budget_chars);
        info!("- Max Rows: {}", self.max_rows);
        info!("- Generation Timeout: {}ms", self.generation_timeout_ms);
        info!("- Query Timeout: {}ms", self.query_timeout_ms);
        info!("- Sampling: temperature {}, max tokens {}", self.temperature, self.max_tokens);
        info!("- Answer Policy: {:?}", self.answer_policy);
        info!("- Phrase Answers: {}", self.phrase_answers);
    }
}

fn parse_value<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("Invalid value for {}: '{}'", key, value))
}

fn parse_or<F, T>(get: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match get(key) {
        Some(value) => parse_value(key, &value),
        None => Ok(default),
    }
}

fn parse_flag<F>(get: &F, key: &str) -> Result<bool>
where
    F: Fn(&str) -> Option<String>,
{
    match get(key).map(|v| v.trim().to_ascii_lowercase()).as_deref() {
        None | Some("") | Some("0") | Some("false") | Some("no") | Some("off") => Ok(false),
        Some("1") | Some("true") | Some("yes") | Some("on") => Ok(true),
        Some(other) => Err(anyhow::anyhow!("Invalid value for {}: '{}'", key, other)),
    }
}

/// `|`-separated list; `\n` escapes become newlines.
fn parse_stop_sequences(raw: &str) -> Vec<String> {
    raw.split('|')
        .map(|s| s.replace("\\n", "\n"))
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_vars(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.max_context_turns, 3);
        assert_eq!(config.memory_capacity, 8);
        assert_eq!(config.max_rows, 200);
        assert_eq!(config.generation_timeout_ms, 30_000);
        assert_eq!(config.query_timeout_ms, 2_000);
        assert_eq!(config.answer_policy, AnswerPolicy::Enumerate { max_rows: 10 });
        assert!(!config.phrase_answers);
        assert!(config.llama_bin.is_none());
        assert!(config.threads >= 1);
        assert_eq!(config.backend_url(), "http://127.0.0.1:8081");
    }

    #[test]
    fn test_explicit_values() {
        let config = config_from(&[
            ("MODEL_PATH", "/models/sqlcoder-7b-q4.gguf"),
            ("MAX_CONTEXT_TURNS", "5"),
            ("MAX_ROWS", "50"),
            ("GENERATION_TIMEOUT_MS", "1500"),
            ("QUERY_TIMEOUT_MS", "250"),
            ("THREADS", "4"),
            ("ANSWER_POLICY", "summarize"),
            ("PHRASE_ANSWERS", "true"),
            ("CURRENCY_SYMBOL", "RM "),
        ])
        .unwrap();
        assert_eq!(config.max_context_turns, 5);
        assert_eq!(config.threads, 4);
        assert_eq!(config.answer_policy, AnswerPolicy::Summarize);
        assert!(config.phrase_answers);
        assert_eq!(config.execution_limits().max_rows, 50);
        assert_eq!(config.execution_limits().timeout, Duration::from_millis(250));
        assert_eq!(config.generation_settings().timeout, Duration::from_millis(1500));
        assert_eq!(config.synthesizer_config().currency_symbol, "RM ");
        assert_eq!(config.model_format(), Some(ModelFormat::GGUF));
    }

    #[test]
    fn test_invalid_numbers_are_reported() {
        let err = config_from(&[("MAX_ROWS", "lots")]).unwrap_err();
        assert!(err.to_string().contains("MAX_ROWS"));
        assert!(config_from(&[("ANSWER_POLICY", "poem")]).is_err());
        assert!(config_from(&[("PHRASE_ANSWERS", "maybe")]).is_err());
    }

    #[test]
    fn test_ctx_size_from_model_name() {
        assert_eq!(Config::read_ctx_size_from_model_path("/m/qwen2.5-coder-32k.gguf"), 32768);
        assert_eq!(Config::read_ctx_size_from_model_path("/m/phi-3-mini-4k-q4.gguf"), 4096);
        assert_eq!(Config::read_ctx_size_from_model_path("/8k/model.gguf"), 4096);
        let config = config_from(&[("MODEL_PATH", "llama-8k.gguf")]).unwrap();
        assert_eq!(config.ctx_size, 8192);
        assert_eq!(config.batch_size, 256);
    }

    #[test]
    fn test_stop_sequences() {
        let config = config_from(&[("STOP_SEQUENCES", "\\n\\n|Question:|;")]).unwrap();
        assert_eq!(config.stop_sequences, vec!["\n\n", "Question:", ";"]);
        assert_eq!(config_from(&[]).unwrap().stop_sequences, GenerationSettings::default().stop);
    }

    #[test]
    fn test_runtime_config_mapping() {
        let config = config_from(&[
            ("MODEL_PATH", "/m/model.gguf"),
            ("LLAMA_BIN", "/usr/bin/llama-server"),
            ("LLAMA_PORT", "9090"),
            ("GPU_LAYERS", "12"),
        ])
        .unwrap();
        let runtime = config.runtime_config();
        assert_eq!(runtime.port, 9090);
        assert_eq!(runtime.gpu_layers, 12);
        assert_eq!(runtime.runtime_binary, Some(PathBuf::from("/usr/bin/llama-server")));
        assert_eq!(runtime.base_url(), "http://127.0.0.1:9090");
    }

    #[test]
    fn test_validate_requires_database_and_model() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = dir.path().join("records.db");
        std::fs::write(&db, b"").unwrap();

        let mut config = config_from(&[("DB_PATH", db.to_str().unwrap())]).unwrap();
        assert!(config.validate().is_ok());

        config.db_path = dir.path().join("missing.db").to_string_lossy().to_string();
        assert!(config.validate().is_err());

        config.db_path = db.to_string_lossy().to_string();
        config.llama_bin = Some(db.to_string_lossy().to_string());
        config.model_path = dir.path().join("absent.gguf").to_string_lossy().to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overrides_apply_before_validation() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = dir.path().join("records.db");
        std::fs::write(&db, b"").unwrap();
        let vars: HashMap<String, String> = [
            ("DB_PATH", "/nowhere/records.db"),
            ("LLAMA_BIN", "/nowhere/llama-server"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        assert!(Config::from_vars_with(|key| vars.get(key).cloned(), |_| {}).is_err());

        let config = Config::from_vars_with(
            |key| vars.get(key).cloned(),
            |config| {
                config.db_path = db.to_string_lossy().into_owned();
                config.llama_bin = None;
            },
        )
        .unwrap();
        assert_eq!(config.db_path, db.to_string_lossy());
        assert!(config.llama_bin.is_none());
    }
}
