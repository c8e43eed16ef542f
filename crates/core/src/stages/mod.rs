pub mod analyze;
pub mod commit;
pub mod discover;
pub mod enumerate;
pub mod taxonomy;

use std::time::Instant;

use foldwise_llm::{GenerateRequest, ProviderCatalog, ProviderDescriptor, ProviderError};
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::debug;

use crate::config::PipelineConfig;
use crate::error::{FoldwiseError, Result};
use crate::scheduler::ModelScheduler;

/// Everything a stage needs to talk to a provider: the catalog that hands out
/// handles, the scheduler that admits local models, and generation settings.
pub struct InferenceContext<'a> {
    pub catalog: &'a dyn ProviderCatalog,
    pub scheduler: &'a ModelScheduler,
    pub temperature: f32,
    pub max_tokens: u32,
    pub force_evict: bool,
}

impl<'a> InferenceContext<'a> {
    pub fn new(
        catalog: &'a dyn ProviderCatalog,
        scheduler: &'a ModelScheduler,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            catalog,
            scheduler,
            temperature: config.providers.temperature,
            max_tokens: config.providers.max_tokens,
            force_evict: config.scheduler.force_evict,
        }
    }

    /// Leases the model from the scheduler when it is local, then generates.
    /// The lease keeps the model resident until the reply is in.
    pub fn call(&self, desc: &ProviderDescriptor, system: &str, prompt: String) -> Result<String> {
        let provider = self.catalog.provider(desc).ok_or_else(|| {
            FoldwiseError::Provider(ProviderError::new(
                desc.backend.as_str(),
                format!("no handle for {}", desc.name),
            ))
        })?;
        let lease = if desc.is_local() {
            Some(self.scheduler.acquire(&desc.name, self.force_evict)?)
        } else {
            None
        };
        let started = Instant::now();
        let request = GenerateRequest {
            prompt,
            system_prompt: Some(system.to_string()),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };
        let outcome = provider.generate(&request);
        drop(lease);
        debug!(provider = %desc.name, elapsed = ?started.elapsed(), ok = outcome.is_ok(), "provider call");
        Ok(outcome?)
    }
}

pub(crate) fn worker_pool(workers: usize) -> Result<ThreadPool> {
    ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .thread_name(|i| format!("foldwise-worker-{i}"))
        .build()
        .map_err(|err| FoldwiseError::Other(format!("failed to start worker pool: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::SchedulerConfig;
    use foldwise_llm::{BackendKind, Discovery, InferenceProvider, ProviderMode};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    /// Every model sleeps while generating and logs when it starts and ends.
    struct SlowCatalog {
        events: Arc<Mutex<Vec<String>>>,
    }

    impl ProviderCatalog for SlowCatalog {
        fn discover(&self, _mode: ProviderMode) -> Discovery {
            Discovery::default()
        }

        fn provider(&self, desc: &ProviderDescriptor) -> Option<Arc<dyn InferenceProvider>> {
            let events = Arc::clone(&self.events);
            let name = desc.name.clone();
            Some(Arc::new(move |_: &GenerateRequest| -> std::result::Result<String, ProviderError> {
                events.lock().push(format!("start {name}"));
                thread::sleep(Duration::from_millis(300));
                events.lock().push(format!("end {name}"));
                Ok("{}".to_string())
            }))
        }

        fn probe(&self, _desc: &ProviderDescriptor) -> std::result::Result<(), ProviderError> {
            Ok(())
        }
    }

    #[test]
    fn running_call_keeps_its_model_resident() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let scheduler = ModelScheduler::new(SchedulerConfig {
            total_ram_gb: 16.0,
            max_concurrent: 1,
            idle_timeout: Duration::from_secs(600),
        })
        .with_eviction_hook(Box::new(move |name: &str| sink.lock().push(format!("evict {name}"))));
        let vision = ProviderDescriptor::new(BackendKind::Ollama, "llava", 5.0);
        let text = ProviderDescriptor::new(BackendKind::Ollama, "llama3", 5.0);
        scheduler.register(&vision);
        scheduler.register(&text);
        let config = PipelineConfig::default();
        assert!(config.scheduler.force_evict);
        let catalog = SlowCatalog {
            events: Arc::clone(&events),
        };
        let ctx = InferenceContext::new(&catalog, &scheduler, &config);

        thread::scope(|s| {
            let first = s.spawn(|| ctx.call(&vision, "describe", "a.jpg".to_string()));
            thread::sleep(Duration::from_millis(100));
            let second = s.spawn(|| ctx.call(&text, "describe", "b.txt".to_string()));
            first.join().unwrap().unwrap();
            second.join().unwrap().unwrap();
        });

        let log = events.lock().clone();
        let at = |entry: &str| log.iter().position(|e| e == entry).unwrap();
        assert!(at("end ollama/llava") < at("evict ollama/llava"), "{log:?}");
        assert!(at("evict ollama/llava") < at("start ollama/llama3"), "{log:?}");
        assert!(scheduler.is_loaded(&text.name));
        assert_eq!(scheduler.loaded().len(), 1);
    }
}
