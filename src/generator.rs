//! Answer generator implementations.
//!
//! [`OpenRouterGenerator`] talks to any OpenAI-compatible
//! `/chat/completions` endpoint (OpenRouter by default). Outages (network
//! errors, 429, 5xx) surface as [`QaError::GeneratorUnavailable`] so the
//! caller can retry; other client errors fail immediately.
//!
//! `cqa models` checks the configured models against the provider's
//! `/models` catalog and can send each one a one-line test prompt.

use anyhow::bail;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use codebase_qa_core::generate::{AnswerGenerator, Prompt};
use codebase_qa_core::{QaError, Result};

use crate::config::{Config, GeneratorConfig};

#[derive(Debug, Clone, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

/// Chat-completions client.
pub struct OpenRouterGenerator {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
}

impl OpenRouterGenerator {
    /// Build a generator from configuration; `model` overrides `config.model`.
    pub fn new(config: &GeneratorConfig, model: Option<&str>) -> anyhow::Result<Self> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            anyhow::anyhow!("{} environment variable not set", config.api_key_env)
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            url: config.url.clone(),
            api_key,
            model: model.unwrap_or(&config.model).to_string(),
        })
    }
}

#[async_trait]
impl AnswerGenerator for OpenRouterGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &Prompt) -> Result<String> {
        let messages = [
            ChatMessage {
                role: "system",
                content: &prompt.system,
            },
            ChatMessage {
                role: "user",
                content: &prompt.user,
            },
        ];
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
        });

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| QaError::GeneratorUnavailable(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            let message = format!("generator API error {status}: {body_text}");
            if status.as_u16() == 429 || status.is_server_error() {
                return Err(QaError::GeneratorUnavailable(message));
            }
            return Err(QaError::Configuration(message));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| QaError::GeneratorUnavailable(format!("failed to parse response: {e}")))?;
        parse_chat_response(&json)
    }
}

fn parse_chat_response(json: &serde_json::Value) -> Result<String> {
    json.get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(|s| s.trim().to_string())
        .ok_or_else(|| {
            QaError::GeneratorUnavailable(format!("unexpected response structure: {json}"))
        })
}

/// A generator that refuses every request.
pub struct DisabledGenerator;

#[async_trait]
impl AnswerGenerator for DisabledGenerator {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn generate(&self, _prompt: &Prompt) -> Result<String> {
        Err(QaError::Configuration(
            "answer generator is disabled; use `cqa context` to see retrieved code".to_string(),
        ))
    }
}

/// Create the generator selected by `config.provider`.
pub fn create_generator(
    config: &GeneratorConfig,
    model: Option<&str>,
) -> anyhow::Result<Arc<dyn AnswerGenerator>> {
    match config.provider.as_str() {
        "openrouter" => Ok(Arc::new(OpenRouterGenerator::new(config, model)?)),
        "disabled" => Ok(Arc::new(DisabledGenerator)),
        other => bail!("Unknown generator provider: {}", other),
    }
}

/// One entry of the provider's model catalog.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub context_length: Option<u64>,
}

#[derive(Deserialize)]
struct ModelCatalog {
    data: Vec<ModelInfo>,
}

/// Parse an OpenAI-style `{"data": [{"id": ...}, ...]}` model list.
pub fn parse_models_response(json: serde_json::Value) -> Result<Vec<ModelInfo>> {
    serde_json::from_value::<ModelCatalog>(json)
        .map(|catalog| catalog.data)
        .map_err(|e| QaError::GeneratorUnavailable(format!("unexpected models response: {e}")))
}

/// Pair each wanted model with its catalog entry, if listed.
pub fn match_models<'a, 'b>(
    wanted: &'a [String],
    catalog: &'b [ModelInfo],
) -> Vec<(&'a str, Option<&'b ModelInfo>)> {
    wanted
        .iter()
        .map(|model| {
            let entry = catalog.iter().find(|info| info.id == *model);
            (model.as_str(), entry)
        })
        .collect()
}

/// Download the model catalog. The API key is sent when it is set.
pub async fn fetch_model_catalog(config: &GeneratorConfig) -> Result<Vec<ModelInfo>> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()
        .map_err(|e| QaError::Configuration(format!("http client: {e}")))?;
    let mut request = client.get(&config.models_url);
    if let Ok(key) = std::env::var(&config.api_key_env) {
        request = request.bearer_auth(key);
    }

    let response = request
        .send()
        .await
        .map_err(|e| QaError::GeneratorUnavailable(format!("request failed: {e}")))?;
    let status = response.status();
    if !status.is_success() {
        let body_text = response.text().await.unwrap_or_default();
        let message = format!("models API error {status}: {body_text}");
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(QaError::GeneratorUnavailable(message));
        }
        return Err(QaError::Configuration(message));
    }

    let json: serde_json::Value = response
        .json()
        .await
        .map_err(|e| QaError::GeneratorUnavailable(format!("failed to parse response: {e}")))?;
    parse_models_response(json)
}

/// Check the configured models (plus `extra`) and print one line each.
///
/// Fails when any model is missing from the catalog or, with `ping`,
/// does not answer a test prompt.
pub async fn run_models(config: &Config, extra: &[String], ping: bool) -> anyhow::Result<()> {
    let generator = &config.generator;
    if generator.provider == "disabled" {
        bail!("answer generator is disabled; set [generator] provider to check models");
    }

    let mut wanted = generator.candidate_models();
    for model in extra {
        if !wanted.contains(model) {
            wanted.push(model.clone());
        }
    }

    let catalog = fetch_model_catalog(generator).await?;
    info!(listed = catalog.len(), checking = wanted.len(), "fetched model catalog");

    let mut unavailable = 0usize;
    for (model, entry) in match_models(&wanted, &catalog) {
        let Some(entry) = entry else {
            println!("{model:<40} missing");
            unavailable += 1;
            continue;
        };
        let context = entry
            .context_length
            .map(|n| format!("{n} tokens"))
            .unwrap_or_else(|| "-".to_string());
        if !ping {
            println!("{model:<40} listed      {context}");
            continue;
        }

        let chat = OpenRouterGenerator::new(generator, Some(model))?;
        let prompt = Prompt {
            system: "You are a connectivity check.".to_string(),
            user: "Reply with the single word OK.".to_string(),
        };
        match chat.generate(&prompt).await {
            Ok(_) => println!("{model:<40} available   {context}"),
            Err(e) => {
                println!("{model:<40} failed      {e}");
                unavailable += 1;
            }
        }
    }

    if unavailable > 0 {
        bail!("{unavailable} of {} models unavailable", wanted.len());
    }
    Ok(())
}
