use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::{de::DeserializeOwned, Serialize};
use tracing::{info, warn};

use crate::cache::{digest_of, stage_key, stage_prefix, CacheStore};
use crate::config::PipelineConfig;
use crate::error::{FoldwiseError, Result};
use crate::records::{
    AnalysisResult, CommitResult, DiscoveryResult, EnumerationResult, MappingSource, TaxonomyResult,
};
use crate::stages::{analyze, commit, discover, enumerate, taxonomy, InferenceContext};

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub source: PathBuf,
    pub destination: PathBuf,
    /// Stages (1..=5) to load from cache instead of running.
    pub skip: BTreeSet<u8>,
    /// Where to write each stage's result as pretty JSON.
    pub stage_outputs: BTreeMap<u8, PathBuf>,
}

impl RunOptions {
    pub fn new(source: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            skip: BTreeSet::new(),
            stage_outputs: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub enumeration: EnumerationResult,
    pub discovery: DiscoveryResult,
    pub analysis: AnalysisResult,
    pub taxonomy: TaxonomyResult,
    pub commit: CommitResult,
    /// Stages whose result came from the cache.
    pub from_cache: BTreeSet<u8>,
}

/// Runs Stage1 through Stage5 in order. Each stage result is cached under a
/// key that folds in a digest of the previous stage's result, so a change
/// anywhere upstream invalidates everything after it.
pub struct Pipeline<'a> {
    config: &'a PipelineConfig,
    cache: &'a CacheStore,
    inference: InferenceContext<'a>,
}

impl<'a> Pipeline<'a> {
    pub fn new(config: &'a PipelineConfig, cache: &'a CacheStore, inference: InferenceContext<'a>) -> Self {
        Self {
            config,
            cache,
            inference,
        }
    }

    pub fn run(&self, options: &RunOptions) -> Result<RunReport> {
        let started = Instant::now();
        let root = enumerate::check_source(&options.source)?;
        commit::prepare_destination(&options.destination, self.config.commit.dry_run)?;
        let mut from_cache = BTreeSet::new();

        let policy = &self.config.scan;
        let key1 = stage_key(&root, &policy.fingerprint());
        // always rescanned; files a real commit already moved keep their
        // earlier records so a resumed run reproduces the same downstream keys
        let enumeration: EnumerationResult = self.stage(1, &key1, options, &mut from_cache, |_| false, || {
            let fresh = enumerate::enumerate(&root, policy, self.cache, self.config.analysis.workers)?;
            Ok(match self.cache.get::<EnumerationResult>(&stage_prefix(1), &key1, None) {
                Some(previous) => enumerate::reconcile(fresh, &previous, policy, |path| {
                    commit::completed_move(self.cache, path).is_some()
                }),
                None => fresh,
            })
        })?;

        let providers = &self.config.providers;
        let key2 = stage_key(
            &root,
            &format!(
                "{}|{}|{}",
                digest_of(&enumeration),
                providers.mode.as_str(),
                providers.mapping_provider.as_deref().unwrap_or("")
            ),
        );
        let discovery: DiscoveryResult = self.stage(
            2,
            &key2,
            options,
            &mut from_cache,
            |d: &DiscoveryResult| discovery_reusable(d, &enumeration),
            || Ok(discover::discover(&enumeration, providers, &self.inference)),
        )?;
        for desc in &discovery.providers {
            self.inference.scheduler.register(desc);
        }

        let key3 = stage_key(
            &root,
            &format!("{}|{}", digest_of(&enumeration), digest_of(&discovery)),
        );
        let analysis: AnalysisResult = self.stage(
            3,
            &key3,
            options,
            &mut from_cache,
            |a: &AnalysisResult| a.failed().next().is_none(),
            || {
                analyze::analyze(
                    &enumeration,
                    &discovery,
                    &self.config.analysis,
                    self.cache,
                    &self.inference,
                )
            },
        )?;

        let key4 = stage_key(
            &root,
            &format!("{}|{}", digest_of(&analysis), digest_of(&self.config.taxonomy)),
        );
        let taxonomy: TaxonomyResult = self.stage(
            4,
            &key4,
            options,
            &mut from_cache,
            |t: &TaxonomyResult| t.failed_batches == 0,
            || {
                Ok(taxonomy::build_taxonomy(
                    &enumeration,
                    &analysis,
                    &discovery,
                    &self.config.taxonomy,
                    &self.inference,
                ))
            },
        )?;

        let commit_settings = &self.config.commit;
        let key5 = stage_key(
            &root,
            &format!(
                "{}|{}|{}|{}",
                digest_of(&taxonomy),
                digest_of(&enumeration.excluded),
                options.destination.display(),
                digest_of(commit_settings)
            ),
        );
        let commit: CommitResult = self.stage(
            5,
            &key5,
            options,
            &mut from_cache,
            |c: &CommitResult| c.dry_run,
            || {
                commit::commit(
                    &enumeration,
                    &analysis,
                    &taxonomy,
                    &options.destination,
                    commit_settings,
                    self.cache,
                )
            },
        )?;

        info!(
            files = enumeration.files.len(),
            moves = commit.operations.len(),
            cached_stages = from_cache.len(),
            elapsed = ?started.elapsed(),
            "pipeline finished"
        );
        Ok(RunReport {
            enumeration,
            discovery,
            analysis,
            taxonomy,
            commit,
            from_cache,
        })
    }

    /// Loads the stage from cache when skipped or when a cached result passes
    /// `reusable`; otherwise computes and stores it.
    fn stage<T, R, F>(
        &self,
        n: u8,
        key: &str,
        options: &RunOptions,
        from_cache: &mut BTreeSet<u8>,
        reusable: R,
        compute: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        R: Fn(&T) -> bool,
        F: FnOnce() -> Result<T>,
    {
        let prefix = stage_prefix(n);
        let stage = prefix.as_str();
        let value = if options.skip.contains(&n) {
            let cached = self
                .cache
                .get::<T>(&prefix, key, None)
                .ok_or(FoldwiseError::MissingStageResult(n))?;
            info!(stage, "skipped, loaded result from cache");
            from_cache.insert(n);
            cached
        } else {
            match self.cache.get::<T>(&prefix, key, None).filter(|v| reusable(v)) {
                Some(cached) => {
                    info!(stage, "reusing cached result");
                    from_cache.insert(n);
                    cached
                }
                None => {
                    let value = compute()?;
                    if let Err(err) = self.cache.put(&prefix, key, &value) {
                        warn!(stage, error = %err, "failed to cache stage result");
                    }
                    value
                }
            }
        };
        if let Some(path) = options.stage_outputs.get(&n) {
            write_artifact(path, &value)?;
            info!(stage, path = %path.display(), "stage output written");
        }
        Ok(value)
    }
}

/// A heuristic mapping is only kept when no provider call could have
/// produced a better one.
fn discovery_reusable(discovery: &DiscoveryResult, enumeration: &EnumerationResult) -> bool {
    let mapping_settled = discovery.mapping_source == MappingSource::Provider
        || discovery.mapping_provider.is_none()
        || enumeration.content_types.is_empty();
    !discovery.providers.is_empty() && discovery.connectivity.values().all(|ok| *ok) && mapping_settled
}

fn write_artifact<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(writer, value)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{ModelScheduler, SchedulerConfig};
    use foldwise_llm::{
        BackendKind, Discovery, GenerateRequest, InferenceProvider, ProviderCatalog, ProviderDescriptor,
        ProviderError, ProviderMode,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;

    struct EmptyCatalog;

    impl ProviderCatalog for EmptyCatalog {
        fn discover(&self, _mode: ProviderMode) -> Discovery {
            Discovery::default()
        }

        fn provider(&self, _d: &ProviderDescriptor) -> Option<Arc<dyn InferenceProvider>> {
            None
        }

        fn probe(&self, _d: &ProviderDescriptor) -> std::result::Result<(), ProviderError> {
            Ok(())
        }
    }

    fn scheduler() -> ModelScheduler {
        ModelScheduler::new(SchedulerConfig {
            total_ram_gb: 8.0,
            max_concurrent: 1,
            idle_timeout: Duration::from_secs(60),
        })
    }

    #[test]
    fn skipping_without_cached_result_is_fatal() {
        let src = tempdir().unwrap();
        let work = tempdir().unwrap();
        let mut config = PipelineConfig::default();
        config.commit.dry_run = true;
        let cache = CacheStore::open(work.path().join("cache"), Duration::from_secs(60)).unwrap();
        let sched = scheduler();
        let pipeline = Pipeline::new(&config, &cache, InferenceContext::new(&EmptyCatalog, &sched, &config));
        let mut options = RunOptions::new(src.path(), work.path().join("out"));
        options.skip.insert(1);
        let err = pipeline.run(&options).unwrap_err();
        assert!(matches!(err, FoldwiseError::MissingStageResult(1)));
    }

    #[test]
    fn without_providers_every_file_routes_to_errors() {
        let src = tempdir().unwrap();
        let work = tempdir().unwrap();
        fs::write(src.path().join("a.txt"), "hello").unwrap();
        let mut config = PipelineConfig::default();
        config.commit.dry_run = true;
        let cache = CacheStore::open(work.path().join("cache"), Duration::from_secs(60)).unwrap();
        let sched = scheduler();
        let pipeline = Pipeline::new(&config, &cache, InferenceContext::new(&EmptyCatalog, &sched, &config));
        let mut options = RunOptions::new(src.path(), work.path().join("out"));
        let artifact = work.path().join("artifacts/stage3.json");
        options.stage_outputs.insert(3, artifact.clone());
        let report = pipeline.run(&options).unwrap();
        assert_eq!(report.commit.operations.len(), 1);
        assert_eq!(report.commit.operations[0].category, crate::records::MoveCategory::Error);
        let written: AnalysisResult =
            serde_json::from_slice(&fs::read(&artifact).unwrap()).unwrap();
        assert_eq!(written, report.analysis);
        assert!(report.from_cache.is_empty());
    }

    /// The first mapping call fails; later ones succeed. Every other call
    /// fails.
    struct FlakyMapping {
        mapping_calls: Arc<AtomicUsize>,
    }

    impl ProviderCatalog for FlakyMapping {
        fn discover(&self, _mode: ProviderMode) -> Discovery {
            Discovery {
                providers: vec![ProviderDescriptor::new(BackendKind::OpenAi, "gpt-4o", 0.0)],
                errors: Vec::new(),
            }
        }

        fn provider(&self, _d: &ProviderDescriptor) -> Option<Arc<dyn InferenceProvider>> {
            let calls = Arc::clone(&self.mapping_calls);
            Some(Arc::new(move |request: &GenerateRequest| {
                let system = request.system_prompt.as_deref().unwrap_or("");
                if !system.contains("route files") {
                    return Err(ProviderError::new("openai", "unavailable"));
                }
                match calls.fetch_add(1, Ordering::SeqCst) {
                    0 => Err(ProviderError::new("openai", "rate limited")),
                    _ => Ok(r#"{"mapping": {"text/*": "openai/gpt-4o"}}"#.to_string()),
                }
            }))
        }

        fn probe(&self, _d: &ProviderDescriptor) -> std::result::Result<(), ProviderError> {
            Ok(())
        }
    }

    #[test]
    fn heuristic_fallback_mapping_is_not_reused() {
        let src = tempdir().unwrap();
        let work = tempdir().unwrap();
        fs::write(src.path().join("a.txt"), "hello").unwrap();
        let mut config = PipelineConfig::default();
        config.commit.dry_run = true;
        let cache = CacheStore::open(work.path().join("cache"), Duration::from_secs(60)).unwrap();
        let sched = scheduler();
        let calls = Arc::new(AtomicUsize::new(0));
        let catalog = FlakyMapping {
            mapping_calls: Arc::clone(&calls),
        };
        let pipeline = Pipeline::new(&config, &cache, InferenceContext::new(&catalog, &sched, &config));
        let options = RunOptions::new(src.path(), work.path().join("out"));

        let first = pipeline.run(&options).unwrap();
        assert_eq!(first.discovery.mapping_source, MappingSource::Heuristic);

        let second = pipeline.run(&options).unwrap();
        assert!(!second.from_cache.contains(&2));
        assert_eq!(second.discovery.mapping_source, MappingSource::Provider);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let third = pipeline.run(&options).unwrap();
        assert!(third.from_cache.contains(&2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
