use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use foldwise_llm::{Capability, ProviderCatalog, ProviderDescriptor, ProviderKind};
use tracing::{debug, info, warn};

use crate::config::ProviderSettings;
use crate::content::primary_type;
use crate::parse::parse_type_mapping;
use crate::records::{DiscoveryResult, EnumerationResult, MappingSource, TypeToProviderMap};

use super::InferenceContext;

const MAPPING_SYSTEM_PROMPT: &str = "You route files to AI models. Reply with a single JSON object mapping each content type to exactly one provider name from the list.";

pub fn discover(
    enumeration: &EnumerationResult,
    settings: &ProviderSettings,
    inference: &InferenceContext<'_>,
) -> DiscoveryResult {
    let started = Instant::now();
    info!(stage = "stage2", mode = settings.mode.as_str(), "discovering providers");
    let found = inference.catalog.discover(settings.mode);
    let discovery_errors: Vec<String> = found.errors.iter().map(|e| e.to_string()).collect();
    for err in &discovery_errors {
        warn!(stage = "stage2", error = %err, "backend discovery failed");
    }
    let providers = found.providers;
    for desc in &providers {
        inference.scheduler.register(desc);
    }

    let mapping_provider = select_mapping_provider(&providers, settings.mapping_provider.as_deref());
    let mut mapping_source = MappingSource::Heuristic;
    let mut mapping = TypeToProviderMap::default();
    if let (Some(desc), false) = (&mapping_provider, enumeration.content_types.is_empty()) {
        match request_mapping(enumeration, &providers, desc, inference) {
            Ok(map) => {
                mapping = map;
                mapping_source = MappingSource::Provider;
            }
            Err(err) => {
                warn!(stage = "stage2", provider = %desc.name, error = %err, "mapping call failed, using heuristic");
            }
        }
    }
    fill_gaps(&mut mapping, &enumeration.content_types, &providers);

    let connectivity = probe_required(&mapping, &providers, inference.catalog);
    let result = DiscoveryResult {
        providers,
        mapping,
        mapping_source,
        mapping_provider: mapping_provider.map(|d| d.name),
        connectivity,
        discovery_errors,
    };
    info!(
        stage = "stage2",
        providers = result.providers.len(),
        mapped_types = result.mapping.len(),
        source = ?result.mapping_source,
        reachable = result.connectivity.values().filter(|ok| **ok).count(),
        unreachable = result.connectivity.values().filter(|ok| !**ok).count(),
        elapsed = ?started.elapsed(),
        "discovery finished"
    );
    result
}

/// The configured provider if it was discovered, else the first remote text
/// provider, else the first provider of any kind.
pub fn select_mapping_provider(
    providers: &[ProviderDescriptor],
    configured: Option<&str>,
) -> Option<ProviderDescriptor> {
    if let Some(name) = configured {
        match providers.iter().find(|p| p.name == name || p.model == name) {
            Some(found) => return Some(found.clone()),
            None => warn!(stage = "stage2", provider = name, "configured mapping provider not available"),
        }
    }
    providers
        .iter()
        .find(|p| p.kind == ProviderKind::Remote && p.supports(Capability::Text))
        .or_else(|| providers.first())
        .cloned()
}

fn request_mapping(
    enumeration: &EnumerationResult,
    providers: &[ProviderDescriptor],
    mapping_provider: &ProviderDescriptor,
    inference: &InferenceContext<'_>,
) -> crate::error::Result<TypeToProviderMap> {
    let types: Vec<&str> = enumeration.content_types.iter().map(String::as_str).collect();
    let catalog: Vec<String> = providers
        .iter()
        .map(|p| {
            let caps: Vec<&str> = p
                .capabilities
                .iter()
                .map(|c| match c {
                    Capability::Text => "text",
                    Capability::Image => "image",
                })
                .collect();
            format!(
                "- {} ({:?}, capabilities: {}, ram: {:.1} GB)",
                p.name,
                p.kind,
                caps.join("+"),
                p.ram_required_gb
            )
        })
        .collect();
    let prompt = format!(
        "Content types found:\n{}\n\nAvailable providers:\n{}\n\nAssign each content type to the provider best suited to describe such files. You may use wildcard keys like \"image/*\". Answer with JSON: {{\"mapping\": {{\"<content type>\": \"<provider name>\"}}}}",
        types.join("\n"),
        catalog.join("\n")
    );
    let reply = inference.call(mapping_provider, MAPPING_SYSTEM_PROMPT, prompt)?;
    parse_type_mapping(&reply, &enumeration.content_types, providers)
        .map_err(|err| crate::error::FoldwiseError::Other(format!("unusable mapping reply: {err}")))
}

/// Image types prefer an image-capable provider; everything else goes to the
/// first text provider.
pub fn heuristic_provider<'p>(
    content_type: &str,
    providers: &'p [ProviderDescriptor],
) -> Option<&'p ProviderDescriptor> {
    let text = providers.iter().find(|p| p.supports(Capability::Text));
    if primary_type(content_type) == "image" {
        providers
            .iter()
            .find(|p| p.supports(Capability::Image))
            .or(text)
    } else {
        text
    }
}

fn fill_gaps(
    mapping: &mut TypeToProviderMap,
    content_types: &BTreeSet<String>,
    providers: &[ProviderDescriptor],
) {
    for content_type in content_types {
        if mapping.resolve(content_type).is_some() {
            continue;
        }
        if let Some(provider) = heuristic_provider(content_type, providers) {
            debug!(stage = "stage2", content_type = %content_type, provider = %provider.name, "heuristic assignment");
            mapping.insert(content_type.clone(), provider.name.clone());
        }
    }
}

fn probe_required(
    mapping: &TypeToProviderMap,
    providers: &[ProviderDescriptor],
    catalog: &dyn ProviderCatalog,
) -> BTreeMap<String, bool> {
    let mut connectivity = BTreeMap::new();
    for name in mapping.providers() {
        let ok = match providers.iter().find(|p| p.name == name) {
            Some(desc) => match catalog.probe(desc) {
                Ok(()) => true,
                Err(err) => {
                    warn!(stage = "stage2", provider = name, error = %err, "connectivity probe failed");
                    false
                }
            },
            None => false,
        };
        connectivity.insert(name.to_string(), ok);
    }
    connectivity
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::records::FileRecord;
    use crate::scheduler::{ModelScheduler, SchedulerConfig};
    use foldwise_llm::{BackendKind, Discovery, GenerateRequest, InferenceProvider, ProviderError, ProviderMode};
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    struct StubCatalog {
        providers: Vec<ProviderDescriptor>,
        reply: Result<String, ProviderError>,
        down: Vec<String>,
    }

    impl ProviderCatalog for StubCatalog {
        fn discover(&self, _mode: ProviderMode) -> Discovery {
            Discovery {
                providers: self.providers.clone(),
                errors: vec![ProviderError::new("anthropic", "missing credential")],
            }
        }

        fn provider(&self, _d: &ProviderDescriptor) -> Option<Arc<dyn InferenceProvider>> {
            let reply = self.reply.clone();
            Some(Arc::new(move |_: &GenerateRequest| reply.clone()))
        }

        fn probe(&self, d: &ProviderDescriptor) -> Result<(), ProviderError> {
            if self.down.contains(&d.name) {
                Err(ProviderError::new("ollama", "connection refused"))
            } else {
                Ok(())
            }
        }
    }

    fn enumeration(types: &[&str]) -> EnumerationResult {
        let files = types
            .iter()
            .enumerate()
            .map(|(i, ct)| FileRecord {
                path: format!("/src/f{i}"),
                relative_path: format!("f{i}"),
                name: format!("f{i}"),
                content_type: ct.to_string(),
                size_bytes: 1,
                metadata: serde_json::Value::Null,
            })
            .collect();
        EnumerationResult::new(Path::new("/src"), files, Vec::new(), Vec::new())
    }

    fn providers() -> Vec<ProviderDescriptor> {
        vec![
            ProviderDescriptor::new(BackendKind::Ollama, "llama3", 5.0),
            ProviderDescriptor::new(BackendKind::Ollama, "llava", 4.0),
            ProviderDescriptor::new(BackendKind::OpenAi, "gpt-4o-mini", 0.0),
        ]
    }

    fn run(catalog: &StubCatalog, enumeration: &EnumerationResult) -> DiscoveryResult {
        let scheduler = ModelScheduler::new(SchedulerConfig {
            total_ram_gb: 32.0,
            max_concurrent: 2,
            idle_timeout: Duration::from_secs(60),
        });
        let config = PipelineConfig::default();
        let inference = InferenceContext::new(catalog, &scheduler, &config);
        discover(enumeration, &config.providers, &inference)
    }

    #[test]
    fn provider_mapping_is_used_and_gaps_filled() {
        let catalog = StubCatalog {
            providers: providers(),
            reply: Ok(r#"{"image/*": "ollama/llava"}"#.to_string()),
            down: vec!["ollama/llama3".to_string()],
        };
        let result = run(&catalog, &enumeration(&["image/jpeg", "text/plain"]));
        assert_eq!(result.mapping_source, MappingSource::Provider);
        assert_eq!(result.mapping_provider.as_deref(), Some("openai/gpt-4o-mini"));
        assert_eq!(result.mapping.resolve("image/jpeg"), Some("ollama/llava"));
        assert_eq!(result.mapping.resolve("text/plain"), Some("ollama/llama3"));
        assert!(result.is_reachable("ollama/llava"));
        assert!(!result.is_reachable("ollama/llama3"));
        assert_eq!(result.discovery_errors.len(), 1);
    }

    #[test]
    fn failed_mapping_call_falls_back_to_heuristic() {
        let catalog = StubCatalog {
            providers: providers(),
            reply: Err(ProviderError::new("openai", "timeout")),
            down: Vec::new(),
        };
        let result = run(&catalog, &enumeration(&["image/png", "application/pdf"]));
        assert_eq!(result.mapping_source, MappingSource::Heuristic);
        assert_eq!(result.mapping.resolve("image/png"), Some("ollama/llava"));
        assert_eq!(result.mapping.resolve("application/pdf"), Some("ollama/llama3"));
    }

    #[test]
    fn configured_mapping_provider_wins() {
        let list = providers();
        let chosen = select_mapping_provider(&list, Some("llava")).unwrap();
        assert_eq!(chosen.name, "ollama/llava");
        let fallback = select_mapping_provider(&list, Some("missing")).unwrap();
        assert_eq!(fallback.name, "openai/gpt-4o-mini");
        assert!(select_mapping_provider(&[], None).is_none());
    }
}
