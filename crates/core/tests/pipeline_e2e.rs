use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use foldwise_core::llm::{
    BackendKind, Discovery, GenerateRequest, InferenceProvider, ProviderCatalog,
    ProviderDescriptor, ProviderError, ProviderMode,
};
use foldwise_core::{
    CacheStore, InferenceContext, ModelScheduler, MoveCategory, Pipeline, PipelineConfig,
    RunOptions, SchedulerConfig,
};
use tempfile::tempdir;

/// Answers each prompt family with a canned reply and counts every call.
struct ScriptedCatalog {
    calls: Arc<AtomicUsize>,
}

fn reply_for(request: &GenerateRequest) -> String {
    let system = request.system_prompt.as_deref().unwrap_or("");
    if system.contains("route files") {
        r#"{"mapping": {"image/*": "openai/gpt-4o", "application/pdf": "openai/gpt-4o"}}"#.to_string()
    } else if system.contains("folder hierarchies") {
        r#"{"taxonomy": [{"path": "Photos", "label": "Photos", "description": "pictures"},
                         {"path": "Documents", "label": "Documents", "description": "papers"}],
            "assignments": [{"file": "a.jpg", "category": "Photos", "filename": "beach"},
                            {"file": "b.pdf", "category": "Documents", "filename": "invoice"}]}"#
            .to_string()
    } else if request.prompt.contains("a.jpg") {
        r#"{"name": "beach", "description": "a beach", "tags": ["travel"]}"#.to_string()
    } else {
        r#"{"name": "invoice", "description": "an invoice", "tags": ["finance"]}"#.to_string()
    }
}

impl ProviderCatalog for ScriptedCatalog {
    fn discover(&self, _mode: ProviderMode) -> Discovery {
        Discovery {
            providers: vec![ProviderDescriptor::new(BackendKind::OpenAi, "gpt-4o", 0.0)],
            errors: Vec::new(),
        }
    }

    fn provider(&self, _d: &ProviderDescriptor) -> Option<Arc<dyn InferenceProvider>> {
        let calls = Arc::clone(&self.calls);
        Some(Arc::new(move |request: &GenerateRequest| -> Result<String, ProviderError> {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(reply_for(request))
        }))
    }

    fn probe(&self, _d: &ProviderDescriptor) -> Result<(), ProviderError> {
        Ok(())
    }
}

fn populate(src: &Path) {
    fs::write(src.join("a.jpg"), b"not really a jpeg").unwrap();
    fs::write(src.join("b.pdf"), b"%PDF-1.4 truncated").unwrap();
    fs::write(src.join(".cfg"), b"secret=1").unwrap();
}

#[test]
fn dry_run_plans_moves_and_second_run_is_served_from_cache() {
    let src = tempdir().unwrap();
    let work = tempdir().unwrap();
    populate(src.path());
    let dst = work.path().join("organized");

    let mut config = PipelineConfig::default();
    config.commit.dry_run = true;
    let cache = CacheStore::open(work.path().join("cache"), Duration::from_secs(3600)).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let catalog = ScriptedCatalog {
        calls: Arc::clone(&calls),
    };
    let scheduler = ModelScheduler::new(SchedulerConfig {
        total_ram_gb: 16.0,
        max_concurrent: 1,
        idle_timeout: Duration::from_secs(600),
    });
    let pipeline = Pipeline::new(
        &config,
        &cache,
        InferenceContext::new(&catalog, &scheduler, &config),
    );
    let options = RunOptions::new(src.path(), &dst);

    let first = pipeline.run(&options).unwrap();
    assert_eq!(first.enumeration.files.len(), 2);
    assert_eq!(first.enumeration.excluded.len(), 1);
    assert_eq!(first.commit.count(MoveCategory::Organized), 2);
    assert_eq!(first.commit.count(MoveCategory::Excluded), 1);
    assert_eq!(first.commit.failures(), 0);
    let beach = first
        .commit
        .operations
        .iter()
        .find(|op| op.source_path.ends_with("a.jpg"))
        .unwrap();
    assert_eq!(beach.target_filename, "beach.jpg");
    assert!(beach.target_dir.ends_with("Photos"));
    assert!(first.from_cache.is_empty());
    let calls_after_first = calls.load(Ordering::SeqCst);
    assert_eq!(calls_after_first, 4, "mapping, two analyses and one taxonomy batch");

    // nothing on disk changed
    assert!(!dst.exists());
    assert!(src.path().join("a.jpg").exists());
    assert!(src.path().join(".cfg").exists());

    let second = pipeline.run(&options).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), calls_after_first);
    assert_eq!(second.commit.operations, first.commit.operations);
    assert_eq!(second.taxonomy, first.taxonomy);
    assert!([2u8, 3, 4, 5].iter().all(|n| second.from_cache.contains(n)));
}

#[test]
fn real_run_moves_files_and_writes_audit_log() {
    let src = tempdir().unwrap();
    let work = tempdir().unwrap();
    populate(src.path());
    let dst = work.path().join("organized");

    let config = PipelineConfig::default();
    let cache = CacheStore::disabled(work.path().join("cache"));
    let catalog = ScriptedCatalog {
        calls: Arc::new(AtomicUsize::new(0)),
    };
    let scheduler = ModelScheduler::new(SchedulerConfig {
        total_ram_gb: 16.0,
        max_concurrent: 1,
        idle_timeout: Duration::from_secs(600),
    });
    let pipeline = Pipeline::new(
        &config,
        &cache,
        InferenceContext::new(&catalog, &scheduler, &config),
    );
    let report = pipeline.run(&RunOptions::new(src.path(), &dst)).unwrap();

    assert_eq!(report.commit.failures(), 0);
    assert!(dst.join("Photos/beach.jpg").exists());
    assert!(dst.join("Documents/invoice.pdf").exists());
    assert!(!src.path().join("a.jpg").exists());
    assert!(dst.join("_excluded/.cfg").exists());
    assert!(dst.join("_excluded/exclusions_log.json").exists());
    let errors: serde_json::Value =
        serde_json::from_slice(&fs::read(dst.join("_errors/errors_log.json")).unwrap()).unwrap();
    assert_eq!(errors["total"], 0);
}

#[test]
fn rerun_after_failed_move_resumes_from_cached_taxonomy() {
    let src = tempdir().unwrap();
    let work = tempdir().unwrap();
    populate(src.path());
    let dst = work.path().join("organized");
    fs::create_dir_all(dst.join("Documents")).unwrap();
    fs::write(dst.join("Documents/invoice.pdf"), b"someone else's invoice").unwrap();

    let config = PipelineConfig::default();
    let cache = CacheStore::open(work.path().join("cache"), Duration::from_secs(3600)).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let catalog = ScriptedCatalog {
        calls: Arc::clone(&calls),
    };
    let scheduler = ModelScheduler::new(SchedulerConfig {
        total_ram_gb: 16.0,
        max_concurrent: 1,
        idle_timeout: Duration::from_secs(600),
    });
    let pipeline = Pipeline::new(
        &config,
        &cache,
        InferenceContext::new(&catalog, &scheduler, &config),
    );
    let options = RunOptions::new(src.path(), &dst);

    let first = pipeline.run(&options).unwrap();
    assert_eq!(first.commit.failures(), 1);
    assert!(dst.join("Photos/beach.jpg").exists());
    assert!(src.path().join("b.pdf").exists());
    let calls_after_first = calls.load(Ordering::SeqCst);
    assert_eq!(calls_after_first, 4);

    fs::remove_file(dst.join("Documents/invoice.pdf")).unwrap();
    let second = pipeline.run(&options).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), calls_after_first);
    assert!([2u8, 3, 4].iter().all(|n| second.from_cache.contains(n)));
    assert_eq!(second.enumeration, first.enumeration);
    assert_eq!(second.taxonomy, first.taxonomy);
    assert_eq!(second.commit.failures(), 0);
    assert_eq!(second.commit.count(MoveCategory::Organized), 2);
    assert!(dst.join("Photos/beach.jpg").exists());
    assert_eq!(fs::read(dst.join("Documents/invoice.pdf")).unwrap(), b"%PDF-1.4 truncated");
    assert!(!src.path().join("b.pdf").exists());
    assert!(dst.join("_excluded/.cfg").exists());
}
