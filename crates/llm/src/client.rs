use std::time::Duration;

use reqwest::{header::HeaderValue, Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::sleep;
use tracing::debug;

use crate::{BackendKind, GenerateRequest, ProviderDescriptor, ProviderError};

const MAX_RETRIES: usize = 4;
const ANTHROPIC_VERSION: &str = "2023-06-01";
const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Clone)]
pub enum BackendConfig {
    OpenAi { api_key: String, base_url: String },
    Anthropic { api_key: String, base_url: String },
    Ollama { base_url: String },
}

impl BackendConfig {
    pub fn kind(&self) -> BackendKind {
        match self {
            BackendConfig::OpenAi { .. } => BackendKind::OpenAi,
            BackendConfig::Anthropic { .. } => BackendKind::Anthropic,
            BackendConfig::Ollama { .. } => BackendKind::Ollama,
        }
    }
}

/// HTTP client for one configured backend.
#[derive(Clone)]
pub struct BackendClient {
    http: Client,
    config: BackendConfig,
}

impl BackendClient {
    pub fn new(config: BackendConfig, timeout: Duration) -> Result<Self, ProviderError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| {
                ProviderError::new(config.kind().as_str(), format!("http client: {err}"))
            })?;
        Ok(Self { http, config })
    }

    pub fn kind(&self) -> BackendKind {
        self.config.kind()
    }

    fn error(&self, message: impl Into<String>) -> ProviderError {
        ProviderError::new(self.kind().as_str(), message)
    }

    fn transport_error(&self, context: &str, err: reqwest::Error) -> ProviderError {
        if err.is_timeout() {
            self.error(format!("{context}: request timed out"))
        } else {
            self.error(format!("{context}: {err}"))
        }
    }

    pub async fn list_models(&self) -> Result<Vec<ProviderDescriptor>, ProviderError> {
        match &self.config {
            BackendConfig::OpenAi { api_key, base_url } => {
                let url = format!("{}/models", base_url.trim_end_matches('/'));
                let response = self
                    .http
                    .get(&url)
                    .bearer_auth(api_key)
                    .send()
                    .await
                    .map_err(|err| self.transport_error("list models", err))?;
                let listing: ModelList = self.decode(response, "list models").await?;
                Ok(listing
                    .data
                    .into_iter()
                    .map(|m| m.id)
                    .filter(|id| is_openai_chat_model(id))
                    .map(|id| ProviderDescriptor::new(BackendKind::OpenAi, id, 0.0))
                    .collect())
            }
            BackendConfig::Anthropic { api_key, base_url } => {
                let url = format!("{}/v1/models", base_url.trim_end_matches('/'));
                let response = self
                    .http
                    .get(&url)
                    .header("x-api-key", api_key)
                    .header("anthropic-version", ANTHROPIC_VERSION)
                    .send()
                    .await
                    .map_err(|err| self.transport_error("list models", err))?;
                let listing: ModelList = self.decode(response, "list models").await?;
                Ok(listing
                    .data
                    .into_iter()
                    .map(|m| ProviderDescriptor::new(BackendKind::Anthropic, m.id, 0.0))
                    .collect())
            }
            BackendConfig::Ollama { base_url } => {
                let url = format!("{}/api/tags", base_url.trim_end_matches('/'));
                let response = self
                    .http
                    .get(&url)
                    .send()
                    .await
                    .map_err(|err| self.transport_error("list models", err))?;
                let tags: OllamaTags = self.decode(response, "list models").await?;
                Ok(tags
                    .models
                    .into_iter()
                    .map(|m| {
                        let ram = round_gb(m.size as f64 / BYTES_PER_GB);
                        ProviderDescriptor::new(BackendKind::Ollama, m.name, ram)
                    })
                    .collect())
            }
        }
    }

    pub async fn generate(
        &self,
        model: &str,
        req: &GenerateRequest,
    ) -> Result<String, ProviderError> {
        match &self.config {
            BackendConfig::OpenAi { api_key, base_url } => {
                self.generate_openai(api_key, base_url, model, req).await
            }
            BackendConfig::Anthropic { api_key, base_url } => {
                self.generate_anthropic(api_key, base_url, model, req).await
            }
            BackendConfig::Ollama { base_url } => self.generate_ollama(base_url, model, req).await,
        }
    }

    /// Lightweight reachability check for one model.
    pub async fn probe(&self, model: &str) -> Result<(), ProviderError> {
        let response = match &self.config {
            BackendConfig::OpenAi { api_key, base_url } => {
                self.http
                    .get(format!("{}/models/{}", base_url.trim_end_matches('/'), model))
                    .bearer_auth(api_key)
                    .send()
                    .await
            }
            BackendConfig::Anthropic { api_key, base_url } => {
                self.http
                    .get(format!("{}/v1/models/{}", base_url.trim_end_matches('/'), model))
                    .header("x-api-key", api_key)
                    .header("anthropic-version", ANTHROPIC_VERSION)
                    .send()
                    .await
            }
            BackendConfig::Ollama { base_url } => {
                self.http
                    .post(format!("{}/api/show", base_url.trim_end_matches('/')))
                    .json(&json!({ "name": model }))
                    .send()
                    .await
            }
        }
        .map_err(|err| self.transport_error("probe", err))?;
        let status = response.status();
        if !status.is_success() {
            return Err(self.error(format!("probe {model} returned status {status}")));
        }
        Ok(())
    }

    /// Asks a local backend to drop a resident model. Remote backends ignore this.
    pub async fn unload(&self, model: &str) -> Result<(), ProviderError> {
        let BackendConfig::Ollama { base_url } = &self.config else {
            return Ok(());
        };
        let response = self
            .http
            .post(format!("{}/api/generate", base_url.trim_end_matches('/')))
            .json(&json!({ "model": model, "keep_alive": 0 }))
            .send()
            .await
            .map_err(|err| self.transport_error("unload", err))?;
        if !response.status().is_success() {
            return Err(self.error(format!(
                "unload {model} returned status {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn generate_openai(
        &self,
        api_key: &str,
        base_url: &str,
        model: &str,
        req: &GenerateRequest,
    ) -> Result<String, ProviderError> {
        let url = format!("{}/chat/completions", base_url.trim_end_matches('/'));
        let mut messages = Vec::new();
        if let Some(system) = &req.system_prompt {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.push(json!({ "role": "user", "content": req.prompt }));
        let payload = json!({
            "model": model,
            "messages": messages,
            "temperature": req.temperature,
            "max_tokens": req.max_tokens,
        });
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            let response = self
                .http
                .post(&url)
                .bearer_auth(api_key)
                .json(&payload)
                .send()
                .await
                .map_err(|err| self.transport_error("chat completion", err))?;
            if response.status() == StatusCode::TOO_MANY_REQUESTS {
                if attempt > MAX_RETRIES {
                    return Err(self.error(format!("rate limited after {MAX_RETRIES} retries")));
                }
                let wait = backoff_delay(attempt, response.headers().get("retry-after"));
                debug!(backend = "openai", attempt, ?wait, "rate limited, backing off");
                sleep(wait).await;
                continue;
            }
            let value: Value = self.decode(response, "chat completion").await?;
            return extract_openai_text(&value)
                .ok_or_else(|| self.error("missing text in chat completion response"));
        }
    }

    async fn generate_anthropic(
        &self,
        api_key: &str,
        base_url: &str,
        model: &str,
        req: &GenerateRequest,
    ) -> Result<String, ProviderError> {
        let url = format!("{}/v1/messages", base_url.trim_end_matches('/'));
        let mut payload = json!({
            "model": model,
            "max_tokens": req.max_tokens,
            "temperature": req.temperature,
            "messages": [ { "role": "user", "content": req.prompt } ],
        });
        if let Some(system) = &req.system_prompt {
            payload["system"] = json!(system);
        }
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            let response = self
                .http
                .post(&url)
                .header("x-api-key", api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&payload)
                .send()
                .await
                .map_err(|err| self.transport_error("messages", err))?;
            if response.status() == StatusCode::TOO_MANY_REQUESTS {
                if attempt > MAX_RETRIES {
                    return Err(self.error(format!("rate limited after {MAX_RETRIES} retries")));
                }
                let wait = backoff_delay(attempt, response.headers().get("retry-after"));
                debug!(backend = "anthropic", attempt, ?wait, "rate limited, backing off");
                sleep(wait).await;
                continue;
            }
            let parsed: AnthropicResponse = self.decode(response, "messages").await?;
            return parsed
                .content
                .into_iter()
                .find_map(|part| part.text)
                .ok_or_else(|| self.error("missing text in messages response"));
        }
    }

    async fn generate_ollama(
        &self,
        base_url: &str,
        model: &str,
        req: &GenerateRequest,
    ) -> Result<String, ProviderError> {
        let url = format!("{}/api/generate", base_url.trim_end_matches('/'));
        let mut payload = json!({
            "model": model,
            "prompt": req.prompt,
            "stream": false,
            "options": {
                "temperature": req.temperature,
                "num_predict": req.max_tokens,
            },
        });
        if let Some(system) = &req.system_prompt {
            payload["system"] = json!(system);
        }
        let response = self
            .http
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|err| self.transport_error("generate", err))?;
        let parsed: OllamaGenerate = self.decode(response, "generate").await?;
        Ok(parsed.response)
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        &self,
        response: Response,
        context: &str,
    ) -> Result<T, ProviderError> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| self.transport_error(context, err))?;
        if !status.is_success() {
            return Err(self.error(format!(
                "{context} returned status {status}: {}",
                truncate(&body, 300)
            )));
        }
        serde_json::from_str(&body)
            .map_err(|err| self.error(format!("{context}: failed to decode response: {err}")))
    }
}

fn backoff_delay(attempt: usize, retry_after: Option<&HeaderValue>) -> Duration {
    if let Some(value) = retry_after {
        if let Ok(text) = value.to_str() {
            if let Ok(secs) = text.parse::<u64>() {
                return Duration::from_secs(secs.max(1));
            }
        }
    }
    let capped = attempt.min(5) as u32;
    Duration::from_secs(1u64 << capped)
}

fn is_openai_chat_model(id: &str) -> bool {
    let lower = id.to_lowercase();
    let family = lower.starts_with("gpt-")
        || lower.starts_with("o1")
        || lower.starts_with("o3")
        || lower.starts_with("o4");
    let special = ["audio", "realtime", "transcribe", "tts", "image", "search"]
        .iter()
        .any(|s| lower.contains(s));
    family && !special
}

fn round_gb(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}

fn extract_openai_text(value: &Value) -> Option<String> {
    let choice = value.get("choices")?.as_array()?.first()?;
    if let Some(text) = choice.get("text").and_then(|t| t.as_str()) {
        return Some(text.to_string());
    }
    let content = choice.get("message")?.get("content")?;
    if let Some(text) = content.as_str() {
        return Some(text.to_string());
    }
    content
        .as_array()?
        .iter()
        .find_map(|part| part.get("text").and_then(|t| t.as_str()))
        .map(|text| text.to_string())
}

#[derive(Deserialize)]
struct ModelList {
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
}

#[derive(Deserialize)]
struct OllamaTags {
    #[serde(default)]
    models: Vec<OllamaModel>,
}

#[derive(Deserialize)]
struct OllamaModel {
    name: String,
    #[serde(default)]
    size: u64,
}

#[derive(Deserialize)]
struct OllamaGenerate {
    response: String,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContent>,
}

#[derive(Deserialize)]
struct AnthropicContent {
    text: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_prefers_retry_after_header() {
        let header = HeaderValue::from_static("7");
        assert_eq!(backoff_delay(1, Some(&header)), Duration::from_secs(7));
        assert_eq!(backoff_delay(2, None), Duration::from_secs(4));
        assert_eq!(backoff_delay(40, None), Duration::from_secs(32));
    }

    #[test]
    fn chat_model_filter_skips_non_text_endpoints() {
        assert!(is_openai_chat_model("gpt-4o-mini"));
        assert!(is_openai_chat_model("o3-mini"));
        assert!(!is_openai_chat_model("gpt-4o-realtime-preview"));
        assert!(!is_openai_chat_model("text-embedding-3-small"));
        assert!(!is_openai_chat_model("whisper-1"));
    }

    #[test]
    fn extracts_text_from_chat_shapes() {
        let plain = json!({"choices": [{"message": {"content": "hello"}}]});
        assert_eq!(extract_openai_text(&plain).as_deref(), Some("hello"));
        let parts = json!({"choices": [{"message": {"content": [{"type": "text", "text": "hi"}]}}]});
        assert_eq!(extract_openai_text(&parts).as_deref(), Some("hi"));
        assert!(extract_openai_text(&json!({"choices": []})).is_none());
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé…");
        assert_eq!(truncate("ok", 10), "ok");
    }
}
