use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::cache::{file_key, file_prefix, CacheStore};
use crate::config::AnalysisSettings;
use crate::content::{primary_type, read_excerpt};
use crate::error::Result;
use crate::parse::parse_analysis;
use crate::records::{AnalysisResult, DiscoveryResult, EnumerationResult, FileAnalysis, FileRecord};

use super::{worker_pool, InferenceContext};

const ANALYSIS_SYSTEM_PROMPT: &str = "You catalogue files for a personal archive. Reply with one JSON object: {\"name\": short descriptive snake_case file name without extension, \"description\": one sentence, \"tags\": [up to five lowercase tags], \"garbage\": true only for junk such as temp exports or duplicates}.";

pub fn analyze(
    enumeration: &EnumerationResult,
    discovery: &DiscoveryResult,
    settings: &AnalysisSettings,
    cache: &CacheStore,
    inference: &InferenceContext<'_>,
) -> Result<AnalysisResult> {
    let started = Instant::now();
    let total = enumeration.files.len();
    info!(stage = "stage3", files = total, workers = settings.workers, "analyzing files");
    let done = AtomicUsize::new(0);
    let pool = worker_pool(settings.workers)?;
    let analyses: Vec<FileAnalysis> = pool.install(|| {
        enumeration
            .files
            .par_iter()
            .map(|record| {
                let analysis = analyze_file(record, discovery, settings, cache, inference);
                let n = done.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(stage = "stage3", path = %record.relative_path, ok = analysis.is_ok(), "{n}/{total}");
                analysis
            })
            .collect()
    });
    let result = AnalysisResult { analyses };
    info!(
        stage = "stage3",
        succeeded = result.succeeded().count(),
        failed = result.failed().count(),
        garbage = result.succeeded().filter(|a| a.garbage).count(),
        elapsed = ?started.elapsed(),
        "analysis finished"
    );
    Ok(result)
}

/// Only successful analyses are cached, so failures are retried next run.
fn analyze_file(
    record: &FileRecord,
    discovery: &DiscoveryResult,
    settings: &AnalysisSettings,
    cache: &CacheStore,
    inference: &InferenceContext<'_>,
) -> FileAnalysis {
    let source = Path::new(&record.path);
    let key = file_key(source);
    let prefix = file_prefix(3);
    if let Some(cached) = cache.get::<FileAnalysis>(&prefix, &key, Some(source)) {
        if cached.is_ok() {
            return cached;
        }
    }

    let Some(provider) = discovery.mapping.resolve(&record.content_type) else {
        return FileAnalysis::failed(
            &record.path,
            &record.name,
            None,
            format!("no provider assigned for {}", record.content_type),
        );
    };
    let assigned = Some(provider.to_string());
    if !discovery.is_reachable(provider) {
        return FileAnalysis::failed(
            &record.path,
            &record.name,
            assigned,
            format!("provider {provider} is unreachable"),
        );
    }
    let Some(desc) = discovery.descriptor(provider) else {
        return FileAnalysis::failed(
            &record.path,
            &record.name,
            assigned,
            format!("provider {provider} was not discovered"),
        );
    };

    let prompt = analysis_prompt(record, settings.excerpt_bytes);
    let reply = match inference.call(desc, ANALYSIS_SYSTEM_PROMPT, prompt) {
        Ok(reply) => reply,
        Err(err) => {
            warn!(stage = "stage3", path = %record.path, provider, error = %err, "provider call failed");
            return FileAnalysis::failed(&record.path, &record.name, assigned, err.to_string());
        }
    };
    let analysis = match parse_analysis(&reply) {
        Ok(parsed) => FileAnalysis {
            path: record.path.clone(),
            assigned_provider: assigned,
            proposed_name: parsed.proposed_name,
            description: parsed.description,
            tags: parsed.tags,
            garbage: parsed.garbage,
            error: None,
        },
        Err(err) => {
            warn!(stage = "stage3", path = %record.path, provider, error = %err, "unparseable analysis");
            return FileAnalysis::failed(
                &record.path,
                &record.name,
                assigned,
                format!("unparseable response: {err}"),
            );
        }
    };
    if let Err(err) = cache.put(&prefix, &key, &analysis) {
        warn!(stage = "stage3", path = %record.path, error = %err, "failed to cache analysis");
    }
    analysis
}

fn analysis_prompt(record: &FileRecord, excerpt_bytes: usize) -> String {
    let mut prompt = format!(
        "File name: {}\nLocation: {}\nContent type: {}\nSize: {} bytes\nMetadata: {}\n",
        record.name, record.relative_path, record.content_type, record.size_bytes, record.metadata
    );
    match primary_type(&record.content_type) {
        "image" => prompt.push_str("\nThis is an image; infer its subject from the name, location and metadata.\n"),
        _ => {
            if let Some(excerpt) = read_excerpt(Path::new(&record.path), excerpt_bytes) {
                if !excerpt.trim().is_empty() {
                    prompt.push_str("\nContent excerpt:\n");
                    prompt.push_str(&excerpt);
                    prompt.push('\n');
                }
            }
        }
    }
    prompt
}
