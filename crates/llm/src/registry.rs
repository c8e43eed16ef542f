use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

use crate::client::{BackendClient, BackendConfig};
use crate::{
    BackendKind, Discovery, GenerateRequest, InferenceProvider, ProviderCatalog,
    ProviderDescriptor, ProviderError, ProviderMode,
};

/// Connection settings for every backend a run may use. Remote backends are
/// only registered when their credential is present.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub anthropic_api_key: Option<String>,
    pub anthropic_base_url: String,
    pub ollama_base_url: Option<String>,
    pub timeout: Duration,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            openai_api_key: None,
            openai_base_url: "https://api.openai.com/v1".to_string(),
            anthropic_api_key: None,
            anthropic_base_url: "https://api.anthropic.com".to_string(),
            ollama_base_url: Some("http://127.0.0.1:11434".to_string()),
            timeout: Duration::from_secs(120),
        }
    }
}

pub struct BackendRegistry {
    runtime: Arc<Runtime>,
    clients: Vec<Arc<BackendClient>>,
}

impl BackendRegistry {
    pub fn from_settings(settings: &RegistrySettings) -> Result<Self, ProviderError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|err| ProviderError::new("registry", format!("tokio runtime: {err}")))?;
        let mut clients = Vec::new();
        match settings.openai_api_key.as_deref().filter(|k| !k.trim().is_empty()) {
            Some(key) => clients.push(Arc::new(BackendClient::new(
                BackendConfig::OpenAi {
                    api_key: key.to_string(),
                    base_url: settings.openai_base_url.clone(),
                },
                settings.timeout,
            )?)),
            None => debug!("OPENAI_API_KEY not set; openai backend disabled"),
        }
        match settings
            .anthropic_api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
        {
            Some(key) => clients.push(Arc::new(BackendClient::new(
                BackendConfig::Anthropic {
                    api_key: key.to_string(),
                    base_url: settings.anthropic_base_url.clone(),
                },
                settings.timeout,
            )?)),
            None => debug!("ANTHROPIC_API_KEY not set; anthropic backend disabled"),
        }
        if let Some(base_url) = &settings.ollama_base_url {
            clients.push(Arc::new(BackendClient::new(
                BackendConfig::Ollama {
                    base_url: base_url.clone(),
                },
                settings.timeout,
            )?));
        }
        Ok(Self {
            runtime: Arc::new(runtime),
            clients,
        })
    }

    fn client(&self, backend: BackendKind) -> Option<&Arc<BackendClient>> {
        self.clients.iter().find(|c| c.kind() == backend)
    }

    pub fn backends(&self) -> Vec<BackendKind> {
        self.clients.iter().map(|c| c.kind()).collect()
    }

    /// Releases a resident local model; used as the scheduler's eviction hook.
    /// Accepts a bare model name or a provider name such as `ollama/llava`.
    pub fn unload_local(&self, model: &str) {
        let Some(client) = self.client(BackendKind::Ollama) else {
            return;
        };
        let model = model
            .strip_prefix(BackendKind::Ollama.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .unwrap_or(model);
        if let Err(err) = self.runtime.block_on(client.unload(model)) {
            warn!(model, error = %err, "failed to unload local model");
        }
    }
}

impl ProviderCatalog for BackendRegistry {
    fn discover(&self, mode: ProviderMode) -> Discovery {
        let mut discovery = Discovery::default();
        for client in &self.clients {
            if !mode.admits(client.kind().provider_kind()) {
                continue;
            }
            match self.runtime.block_on(client.list_models()) {
                Ok(models) => {
                    info!(backend = %client.kind(), count = models.len(), "discovered models");
                    discovery.providers.extend(models);
                }
                Err(err) => {
                    warn!(backend = %client.kind(), error = %err, "model discovery failed");
                    discovery.errors.push(err);
                }
            }
        }
        discovery
    }

    fn provider(&self, descriptor: &ProviderDescriptor) -> Option<Arc<dyn InferenceProvider>> {
        let client = self.client(descriptor.backend)?;
        Some(Arc::new(ProviderHandle {
            runtime: self.runtime.clone(),
            client: client.clone(),
            model: descriptor.model.clone(),
        }))
    }

    fn probe(&self, descriptor: &ProviderDescriptor) -> Result<(), ProviderError> {
        let client = self.client(descriptor.backend).ok_or_else(|| {
            ProviderError::new(descriptor.backend.as_str(), "backend not configured")
        })?;
        self.runtime.block_on(client.probe(&descriptor.model))
    }
}

/// A single model on a single backend, driven synchronously.
pub struct ProviderHandle {
    runtime: Arc<Runtime>,
    client: Arc<BackendClient>,
    model: String,
}

impl InferenceProvider for ProviderHandle {
    fn generate(&self, request: &GenerateRequest) -> Result<String, ProviderError> {
        self.runtime
            .block_on(self.client.generate(&self.model, request))
    }
}
