mod cli;
mod logging;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use foldwise_core::{
    CacheScope, CacheStats, CacheStore, InferenceContext, ModelScheduler, MoveCategory, Pipeline,
    PipelineConfig, RunOptions, RunReport, SchedulerConfig,
};
use foldwise_llm::BackendRegistry;

use crate::cli::Cli;

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_tracing(cli.verbose);

    let mut config = PipelineConfig::load(cli.config.as_deref())?;
    cli.apply(&mut config);
    config.validate()?;

    let cache = if config.cache.enabled {
        CacheStore::open(&config.cache.dir, config.cache.ttl())
            .with_context(|| format!("failed to open cache at {}", config.cache.dir.display()))?
    } else {
        info!("cache disabled for this run");
        CacheStore::disabled(&config.cache.dir)
    };

    if let Some(scope) = cli.clear_cache {
        let removed = cache.invalidate(scope)?;
        println!("cleared {removed} cache entries ({})", scope_label(scope));
    }
    if cli.cache_stats && cli.cache_only() {
        print_cache_stats(&cache.stats()?);
    }
    let (Some(src), Some(dst)) = (cli.src.clone(), cli.dst.clone()) else {
        return Ok(());
    };

    let registry = Arc::new(BackendRegistry::from_settings(&config.registry_settings())?);
    let evictor = Arc::clone(&registry);
    let scheduler = ModelScheduler::new(SchedulerConfig::from_settings(&config.scheduler))
        .with_eviction_hook(Box::new(move |name: &str| evictor.unload_local(name)));
    info!(
        total_ram_gb = scheduler.config().total_ram_gb,
        max_concurrent = scheduler.config().max_concurrent,
        backends = ?registry.backends(),
        "providers configured"
    );

    let pipeline = Pipeline::new(
        &config,
        &cache,
        InferenceContext::new(registry.as_ref(), &scheduler, &config),
    );
    let mut options = RunOptions::new(src, dst);
    options.skip = cli.skip_stages();
    options.stage_outputs = cli.stage_outputs();
    let report = pipeline.run(&options)?;

    print_summary(&report);
    if cli.cache_stats {
        print_cache_stats(&cache.stats()?);
    }
    Ok(())
}

fn scope_label(scope: CacheScope) -> String {
    match scope {
        CacheScope::All => "all".to_string(),
        CacheScope::Stage(n) => format!("stage{n}"),
    }
}

fn print_summary(report: &RunReport) {
    let commit = &report.commit;
    let heading = if commit.dry_run { "dry run, nothing moved" } else { "run complete" };
    println!("foldwise: {heading}");
    println!(
        "  scanned:   {} files, {} excluded, {} scan errors",
        report.enumeration.files.len(),
        report.enumeration.excluded.len(),
        report.enumeration.errors.len()
    );
    println!(
        "  analyzed:  {} ok, {} failed",
        report.analysis.succeeded().count(),
        report.analysis.failed().count()
    );
    println!(
        "  taxonomy:  {} categories from {} batches ({} failed)",
        report.taxonomy.taxonomy.len(),
        report.taxonomy.batches,
        report.taxonomy.failed_batches
    );
    for category in [
        MoveCategory::Organized,
        MoveCategory::Garbage,
        MoveCategory::Excluded,
        MoveCategory::Error,
    ] {
        println!("  {:<10} {}", format!("{category}:"), commit.count(category));
    }
    if commit.failures() > 0 {
        println!("  failed moves: {}", commit.failures());
    }
    if !report.from_cache.is_empty() {
        let stages: Vec<String> = report.from_cache.iter().map(|n| format!("stage{n}")).collect();
        println!("  from cache: {}", stages.join(", "));
    }
}

fn print_cache_stats(stats: &CacheStats) {
    println!(
        "cache: {} entries, {} bytes ({} hits, {} misses this run)",
        stats.entry_count, stats.total_bytes, stats.hits, stats.misses
    );
    for (prefix, entry) in &stats.by_prefix {
        println!("  {prefix:<14} {:>6} entries {:>12} bytes", entry.entries, entry.bytes);
    }
}
