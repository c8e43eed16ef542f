use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::config::TaxonomySettings;
use crate::parse::{parse_taxonomy_response, TaxonomyProposal};
use crate::records::{
    AnalysisResult, DiscoveryResult, EnumerationResult, FileAnalysis, FileAssignment, FileRecord,
    Taxonomy, TaxonomyResult,
};
use crate::tree::{chunk_tree, DirTree};

use super::InferenceContext;

const TAXONOMY_SYSTEM_PROMPT: &str = "You design folder hierarchies for personal archives. Reply with one JSON object: {\"taxonomy\": [{\"path\": \"Top/Sub\", \"label\": ..., \"description\": ..., \"children\": [...]}], \"assignments\": [{\"file\": relative path as given, \"category\": taxonomy path, \"filename\": new file name, \"reasoning\": short reason}]}.";

/// One analyzed file as seen by this stage.
struct Item<'a> {
    record: &'a FileRecord,
    analysis: &'a FileAnalysis,
}

pub fn build_taxonomy(
    enumeration: &EnumerationResult,
    analysis: &AnalysisResult,
    discovery: &DiscoveryResult,
    settings: &TaxonomySettings,
    inference: &InferenceContext<'_>,
) -> TaxonomyResult {
    let started = Instant::now();
    let records = enumeration.records_by_path();
    let mut items: Vec<Item<'_>> = analysis
        .succeeded()
        .filter_map(|a| {
            records
                .get(a.path.as_str())
                .copied()
                .map(|record| Item { record, analysis: a })
        })
        .collect();
    items.sort_by(|a, b| a.record.relative_path.cmp(&b.record.relative_path));
    let (garbage, regular): (Vec<Item<'_>>, Vec<Item<'_>>) =
        items.into_iter().partition(|i| i.analysis.garbage);
    info!(
        stage = "stage4",
        files = regular.len(),
        garbage = garbage.len(),
        batch_size = settings.batch_size,
        "building taxonomy"
    );

    let mut result = TaxonomyResult::default();
    let mut uncategorized = 0usize;
    let provider = discovery
        .mapping_provider
        .as_deref()
        .and_then(|name| discovery.descriptor(name));
    if provider.is_none() && !regular.is_empty() {
        warn!(stage = "stage4", "no mapping provider available, files stay uncategorized");
    }

    for batch in regular.chunks(settings.batch_size.max(1)) {
        let tree = DirTree::from_paths(batch.iter().map(|i| i.record.relative_path.as_str()));
        for chunk in chunk_tree(&tree, settings.max_tree_bytes) {
            let paths = chunk.tree.file_paths();
            let sub: Vec<&Item<'_>> = batch
                .iter()
                .filter(|i| paths.contains(&i.record.relative_path))
                .collect();
            if sub.is_empty() {
                continue;
            }
            result.batches += 1;
            let proposal = match provider {
                Some(desc) => {
                    let prompt = batch_prompt(&result.taxonomy, &chunk.tree, &sub);
                    inference
                        .call(desc, TAXONOMY_SYSTEM_PROMPT, prompt)
                        .map_err(|err| err.to_string())
                        .and_then(|reply| {
                            parse_taxonomy_response(&reply).map_err(|err| err.to_string())
                        })
                }
                None => Err("no mapping provider".to_string()),
            };
            match proposal {
                Ok(proposal) => {
                    uncategorized += merge_batch(&mut result, &proposal, &sub, settings);
                }
                Err(err) => {
                    warn!(stage = "stage4", batch = result.batches, files = sub.len(), error = %err, "batch failed, assigning to uncategorized");
                    result.failed_batches += 1;
                    for item in &sub {
                        assign(&mut result, item, &settings.uncategorized_path, None, "taxonomy batch failed");
                    }
                    uncategorized += sub.len();
                }
            }
        }
    }

    for item in &garbage {
        let mut assignment = make_assignment(item, &settings.garbage_path, None, "classified as garbage");
        assignment.garbage = true;
        result
            .taxonomy
            .insert_if_absent(&settings.garbage_path, "Garbage", "Files flagged as not worth keeping");
        result.assignments.push(assignment);
    }

    info!(
        stage = "stage4",
        categories = result.taxonomy.len(),
        assignments = result.assignments.len(),
        batches = result.batches,
        failed_batches = result.failed_batches,
        uncategorized,
        elapsed = ?started.elapsed(),
        "taxonomy finished"
    );
    result
}

fn batch_prompt(existing: &Taxonomy, tree: &DirTree, items: &[&Item<'_>]) -> String {
    let mut prompt = String::new();
    if existing.is_empty() {
        prompt.push_str("Propose an initial category taxonomy for these files and assign each file to one category.\n");
    } else {
        prompt.push_str("Existing taxonomy (extend it, never rename or remove existing paths):\n");
        prompt.push_str(&existing.outline());
        prompt.push_str("\n\nAssign the new files below, adding categories only where none fits.\n");
    }
    prompt.push_str("\nDirectory layout:\n");
    prompt.push_str(&serde_json::to_string(tree).unwrap_or_default());
    prompt.push_str("\n\nFiles:\n");
    for item in items {
        let a = item.analysis;
        prompt.push_str(&format!(
            "- {} | proposed name: {} | {} | tags: {}\n",
            item.record.relative_path,
            a.proposed_name,
            a.description,
            a.tags.join(", ")
        ));
    }
    prompt
}

/// Adds new categories, then assigns every file in the batch. Returns how
/// many files fell back to the uncategorized path.
fn merge_batch(
    result: &mut TaxonomyResult,
    proposal: &TaxonomyProposal,
    items: &[&Item<'_>],
    settings: &TaxonomySettings,
) -> usize {
    let mut added = 0usize;
    for category in &proposal.categories {
        if let Some(path) = normalize_category_path(&category.path) {
            if result
                .taxonomy
                .insert_if_absent(&path, &category.label, &category.description)
            {
                added += 1;
            }
        }
    }
    let mut by_file: BTreeMap<&str, &crate::parse::ProposedAssignment> = BTreeMap::new();
    for proposed in &proposal.assignments {
        by_file.insert(proposed.file.trim().trim_start_matches("./"), proposed);
    }
    let mut fallback = 0usize;
    for item in items {
        let record = item.record;
        let proposed = by_file
            .get(record.relative_path.as_str())
            .or_else(|| by_file.get(record.path.as_str()))
            .or_else(|| by_file.get(record.name.as_str()));
        let category = proposed.and_then(|p| normalize_category_path(&p.category));
        match (proposed, category) {
            (Some(p), Some(category)) => {
                let reasoning = if p.reasoning.is_empty() {
                    "assigned by taxonomy provider"
                } else {
                    p.reasoning.as_str()
                };
                assign(result, item, &category, p.filename.as_deref(), reasoning);
            }
            _ => {
                fallback += 1;
                assign(result, item, &settings.uncategorized_path, None, "not assigned by taxonomy provider");
            }
        }
    }
    debug!(stage = "stage4", added, fallback, "batch merged");
    fallback
}

fn assign(
    result: &mut TaxonomyResult,
    item: &Item<'_>,
    category: &str,
    filename: Option<&str>,
    reasoning: &str,
) {
    let label = category.rsplit('/').next().unwrap_or(category).to_string();
    result.taxonomy.insert_if_absent(category, &label, "");
    result
        .assignments
        .push(make_assignment(item, category, filename, reasoning));
}

fn make_assignment(
    item: &Item<'_>,
    category: &str,
    filename: Option<&str>,
    reasoning: &str,
) -> FileAssignment {
    let base = filename.unwrap_or(item.analysis.proposed_name.as_str());
    FileAssignment {
        path: item.record.path.clone(),
        target_category_path: category.to_string(),
        proposed_filename: compose_filename(base, &item.record.name),
        reasoning: reasoning.to_string(),
        garbage: false,
    }
}

fn sanitize_segment(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    cleaned.trim().trim_matches('.').trim().to_string()
}

/// Cleans a proposed category path into `/`-separated segments. `None` when
/// nothing usable remains.
pub fn normalize_category_path(raw: &str) -> Option<String> {
    let segments: Vec<String> = raw
        .split(['/', '\\'])
        .map(sanitize_segment)
        .filter(|s| !s.is_empty())
        .collect();
    (!segments.is_empty()).then(|| segments.join("/"))
}

/// Safe file name from a proposed base name that always keeps the original
/// extension.
pub fn compose_filename(proposed: &str, original: &str) -> String {
    let original_path = Path::new(original);
    let ext = original_path.extension().and_then(|e| e.to_str());
    let mut stem = sanitize_segment(proposed);
    if let Some(ext) = ext {
        let suffix = format!(".{ext}");
        let tail = stem.len().checked_sub(suffix.len());
        if let Some(at) = tail.filter(|at| stem.is_char_boundary(*at)) {
            if stem[at..].eq_ignore_ascii_case(&suffix) {
                stem.truncate(at);
            }
        }
    }
    let stem = stem.trim().trim_end_matches('.').to_string();
    let stem = if stem.is_empty() {
        original_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string())
    } else {
        stem
    };
    match ext {
        Some(ext) => format!("{stem}.{ext}"),
        None => stem,
    }
}
