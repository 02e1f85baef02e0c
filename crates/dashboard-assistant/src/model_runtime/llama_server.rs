//! llama.cpp server backend
//!
//! Optionally spawns `llama-server` for the configured GGUF model, then talks
//! to its OpenAI-compatible `/v1/completions` endpoint over HTTP.

use super::format_detector::FormatDetector;
use super::runtime_trait::*;
use crate::error::GenerationError;
use async_trait::async_trait;
use std::process::{Child, Command, Stdio};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

pub struct LlamaServerEngine {
    server_process: Option<Child>,
    http_client: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
}

impl LlamaServerEngine {
    /// Use a server that is already listening at `base_url`.
    pub fn connect(base_url: &str, request_timeout: Duration) -> Self {
        Self {
            server_process: None,
            http_client: reqwest::Client::builder()
                .timeout(request_timeout)
                .build()
                .unwrap_or_default(),
            base_url: base_url.trim_end_matches('/').to_string(),
            request_timeout,
        }
    }

    /// Start `llama-server` for `config.model_path` (when a binary is configured)
    /// and wait until it reports healthy.
    pub async fn launch(config: &RuntimeConfig, request_timeout: Duration) -> anyhow::Result<Self> {
        let mut engine = Self::connect(&config.base_url(), request_timeout);

        let Some(binary_path) = config.runtime_binary.as_ref() else {
            info!("No llama-server binary configured, expecting a server at {}", engine.base_url);
            return Ok(engine);
        };

        let format = FormatDetector::validate_model(&config.model_path)?;
        if !binary_path.exists() {
            return Err(anyhow::anyhow!(
                "llama-server binary not found at: {}",
                binary_path.display()
            ));
        }

        info!("Starting llama-server for {} model: {}", format.name(), config.model_path.display());
        info!("  Binary: {}", binary_path.display());
        info!("  Port: {}", config.port);
        info!("  Context Size: {}", config.context_size);
        info!("  GPU Layers: {}", config.gpu_layers);

        let mut cmd = Command::new(binary_path);
        cmd.arg("--model").arg(&config.model_path)
            .arg("--host").arg(&config.host)
            .arg("--port").arg(config.port.to_string())
            .arg("--ctx-size").arg(config.context_size.to_string())
            .arg("--batch-size").arg(config.batch_size.to_string())
            .arg("--threads").arg(config.threads.to_string())
            .arg("--n-gpu-layers").arg(config.gpu_layers.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let child = cmd.spawn()
            .map_err(|e| anyhow::anyhow!("Failed to spawn llama-server: {}", e))?;
        engine.server_process = Some(child);

        info!("llama-server process started, waiting for health check...");
        for attempt in 1..=30 {
            sleep(Duration::from_secs(2)).await;

            if engine.is_ready().await {
                info!("llama-server ready after {} seconds", attempt * 2);
                return Ok(engine);
            }

            if attempt % 5 == 0 {
                info!("Still waiting for llama-server... ({}/60s)", attempt * 2);
            }
        }

        Err(anyhow::anyhow!("llama-server failed to start within 60 seconds"))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn completions_url(&self) -> String {
        format!("{}/v1/completions", self.base_url)
    }

    pub async fn is_ready(&self) -> bool {
        let health_url = format!("{}/health", self.base_url);
        match self.http_client.get(&health_url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    pub fn shutdown(&mut self) {
        if let Some(mut child) = self.server_process.take() {
            info!("Shutting down llama-server");
            match child.kill() {
                Ok(_) => {
                    let _ = child.wait();
                }
                Err(e) => warn!("Failed to kill llama-server process: {}", e),
            }
        }
    }
}

#[async_trait]
impl GenerationEngine for LlamaServerEngine {
    async fn generate(&self, request: GenerationRequest) -> Result<String, GenerationError> {
        let payload = serde_json::json!({
            "model": "local-llm",
            "prompt": request.prompt,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "stop": request.stop,
            "stream": false,
        });

        let resp = self.http_client.post(self.completions_url())
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GenerationError::Timeout(self.request_timeout.as_millis() as u64)
                } else {
                    GenerationError::Unavailable(e.to_string())
                }
            })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(GenerationError::Backend { status, body });
        }

        let response: serde_json::Value = resp.json().await
            .map_err(|e| GenerationError::Malformed(format!("failed to parse response: {}", e)))?;

        let text = response["choices"][0]["text"]
            .as_str()
            .ok_or_else(|| GenerationError::Malformed("missing choices[0].text".to_string()))?;
        debug!(
            "Completion finished ({}): {} chars",
            response["choices"][0]["finish_reason"].as_str().unwrap_or("unknown"),
            text.len()
        );

        if text.trim().is_empty() {
            return Err(GenerationError::EmptyOutput);
        }
        Ok(text.to_string())
    }

    fn name(&self) -> &str {
        "llama.cpp (llama-server)"
    }
}

impl Drop for LlamaServerEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
