mod client;
mod registry;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use client::{BackendClient, BackendConfig};
pub use registry::{BackendRegistry, ProviderHandle, RegistrySettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    OpenAi,
    Anthropic,
    Ollama,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::OpenAi => "openai",
            BackendKind::Anthropic => "anthropic",
            BackendKind::Ollama => "ollama",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "openai" => Some(BackendKind::OpenAi),
            "anthropic" => Some(BackendKind::Anthropic),
            "ollama" | "local" => Some(BackendKind::Ollama),
            _ => None,
        }
    }

    pub fn provider_kind(&self) -> ProviderKind {
        match self {
            BackendKind::Ollama => ProviderKind::Local,
            BackendKind::OpenAi | BackendKind::Anthropic => ProviderKind::Remote,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Text,
    Image,
}

/// Which provider kinds a run is allowed to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProviderMode {
    OnlineOnly,
    LocalOnly,
    #[default]
    Mixed,
}

impl ProviderMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderMode::OnlineOnly => "online_only",
            ProviderMode::LocalOnly => "local_only",
            ProviderMode::Mixed => "mixed",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value.to_lowercase().replace('-', "_").as_str() {
            "online" | "online_only" | "remote" => Some(ProviderMode::OnlineOnly),
            "local" | "local_only" => Some(ProviderMode::LocalOnly),
            "mixed" | "all" => Some(ProviderMode::Mixed),
            _ => None,
        }
    }

    pub fn admits(&self, kind: ProviderKind) -> bool {
        match self {
            ProviderMode::OnlineOnly => kind == ProviderKind::Remote,
            ProviderMode::LocalOnly => kind == ProviderKind::Local,
            ProviderMode::Mixed => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    pub name: String,
    pub kind: ProviderKind,
    pub backend: BackendKind,
    pub model: String,
    pub capabilities: Vec<Capability>,
    pub ram_required_gb: f64,
}

impl ProviderDescriptor {
    pub fn new(backend: BackendKind, model: impl Into<String>, ram_required_gb: f64) -> Self {
        let model = model.into();
        let capabilities = infer_capabilities(backend, &model);
        let kind = backend.provider_kind();
        Self {
            name: format!("{}/{}", backend.as_str(), model),
            kind,
            backend,
            model,
            capabilities,
            ram_required_gb: if kind == ProviderKind::Local {
                ram_required_gb
            } else {
                0.0
            },
        }
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn is_local(&self) -> bool {
        self.kind == ProviderKind::Local
    }
}

/// Vision-capable model families advertise `image` in addition to `text`.
pub fn infer_capabilities(backend: BackendKind, model: &str) -> Vec<Capability> {
    let lower = model.to_lowercase();
    let vision = match backend {
        BackendKind::OpenAi => ["gpt-4o", "gpt-4.1", "gpt-5", "o3", "o4"]
            .iter()
            .any(|family| lower.starts_with(family)),
        BackendKind::Anthropic => {
            lower.starts_with("claude") && !lower.starts_with("claude-2") && !lower.contains("instant")
        }
        BackendKind::Ollama => [
            "llava",
            "bakllava",
            "moondream",
            "vision",
            "minicpm-v",
            "qwen2.5vl",
            "gemma3",
        ]
        .iter()
        .any(|family| lower.contains(family)),
    };
    if vision {
        vec![Capability::Text, Capability::Image]
    } else {
        vec![Capability::Text]
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{backend} provider error: {message}")]
pub struct ProviderError {
    pub backend: String,
    pub message: String,
}

impl ProviderError {
    pub fn new(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            message: message.into(),
        }
    }
}

/// Text generation against one model of one backend.
pub trait InferenceProvider: Send + Sync {
    fn generate(&self, request: &GenerateRequest) -> Result<String, ProviderError>;
}

impl<F> InferenceProvider for F
where
    F: Fn(&GenerateRequest) -> Result<String, ProviderError> + Send + Sync,
{
    fn generate(&self, request: &GenerateRequest) -> Result<String, ProviderError> {
        self(request)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Discovery {
    pub providers: Vec<ProviderDescriptor>,
    pub errors: Vec<ProviderError>,
}

/// Source of providers for a run: enumeration, handles and connectivity probes.
pub trait ProviderCatalog: Send + Sync {
    fn discover(&self, mode: ProviderMode) -> Discovery;

    fn provider(&self, descriptor: &ProviderDescriptor) -> Option<Arc<dyn InferenceProvider>>;

    fn probe(&self, descriptor: &ProviderDescriptor) -> Result<(), ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_names_are_backend_qualified() {
        let desc = ProviderDescriptor::new(BackendKind::Ollama, "llava:7b", 4.5);
        assert_eq!(desc.name, "ollama/llava:7b");
        assert!(desc.is_local());
        assert!(desc.supports(Capability::Image));
        assert_eq!(desc.ram_required_gb, 4.5);
    }

    #[test]
    fn remote_descriptors_cost_no_ram() {
        let desc = ProviderDescriptor::new(BackendKind::OpenAi, "gpt-3.5-turbo", 8.0);
        assert_eq!(desc.kind, ProviderKind::Remote);
        assert_eq!(desc.ram_required_gb, 0.0);
        assert_eq!(desc.capabilities, vec![Capability::Text]);
    }

    #[test]
    fn provider_mode_parses_cli_spellings() {
        assert_eq!(
            ProviderMode::from_str("online-only"),
            Some(ProviderMode::OnlineOnly)
        );
        assert_eq!(ProviderMode::from_str("local"), Some(ProviderMode::LocalOnly));
        assert_eq!(ProviderMode::from_str("MIXED"), Some(ProviderMode::Mixed));
        assert!(ProviderMode::from_str("sideways").is_none());
        assert!(!ProviderMode::LocalOnly.admits(ProviderKind::Remote));
        assert!(ProviderMode::Mixed.admits(ProviderKind::Local));
    }

    #[test]
    fn closures_act_as_providers() {
        let provider = |req: &GenerateRequest| -> Result<String, ProviderError> {
            Ok(format!("echo: {}", req.prompt))
        };
        let out = provider
            .generate(&GenerateRequest {
                prompt: "hi".into(),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(out, "echo: hi");
    }
}
