//! Entities handed from one stage to the next. Everything refers to files by
//! absolute path string so a stage can be re-run against whatever is on disk.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;

use foldwise_llm::ProviderDescriptor;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::content::primary_type;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    pub relative_path: String,
    pub name: String,
    pub content_type: String,
    pub size_bytes: u64,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExclusionRule {
    Hidden,
    Extension,
    Directory,
    Size,
    Symlink,
}

impl ExclusionRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExclusionRule::Hidden => "hidden",
            ExclusionRule::Extension => "extension",
            ExclusionRule::Directory => "directory",
            ExclusionRule::Size => "size",
            ExclusionRule::Symlink => "symlink",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExcludedFile {
    pub path: String,
    pub relative_path: String,
    pub reason: String,
    pub rule: ExclusionRule,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanError {
    pub path: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnumerationResult {
    pub source_root: String,
    pub files: Vec<FileRecord>,
    pub excluded: Vec<ExcludedFile>,
    pub errors: Vec<ScanError>,
    pub content_types: BTreeSet<String>,
}

impl EnumerationResult {
    pub fn new(
        source_root: &Path,
        files: Vec<FileRecord>,
        excluded: Vec<ExcludedFile>,
        errors: Vec<ScanError>,
    ) -> Self {
        let content_types = files.iter().map(|f| f.content_type.clone()).collect();
        Self {
            source_root: source_root.to_string_lossy().into_owned(),
            files,
            excluded,
            errors,
            content_types,
        }
    }

    pub fn record(&self, path: &str) -> Option<&FileRecord> {
        self.files.iter().find(|f| f.path == path)
    }

    pub fn records_by_path(&self) -> BTreeMap<&str, &FileRecord> {
        self.files.iter().map(|f| (f.path.as_str(), f)).collect()
    }
}

/// Content type to provider name. Keys may be exact (`image/png`) or
/// primary-type wildcards (`image/*`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeToProviderMap(pub BTreeMap<String, String>);

impl TypeToProviderMap {
    pub fn insert(&mut self, content_type: impl Into<String>, provider: impl Into<String>) {
        self.0.insert(content_type.into(), provider.into());
    }

    /// Exact match first, then the `primary/*` wildcard.
    pub fn resolve(&self, content_type: &str) -> Option<&str> {
        if let Some(provider) = self.0.get(content_type) {
            return Some(provider.as_str());
        }
        let wildcard = format!("{}/*", primary_type(content_type));
        self.0.get(&wildcard).map(|p| p.as_str())
    }

    pub fn providers(&self) -> BTreeSet<&str> {
        self.0.values().map(|p| p.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingSource {
    Provider,
    Heuristic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryResult {
    pub providers: Vec<ProviderDescriptor>,
    pub mapping: TypeToProviderMap,
    pub mapping_source: MappingSource,
    pub mapping_provider: Option<String>,
    /// Probe outcome per required provider.
    pub connectivity: BTreeMap<String, bool>,
    #[serde(default)]
    pub discovery_errors: Vec<String>,
}

impl DiscoveryResult {
    pub fn descriptor(&self, name: &str) -> Option<&ProviderDescriptor> {
        self.providers.iter().find(|p| p.name == name)
    }

    pub fn is_reachable(&self, name: &str) -> bool {
        self.connectivity.get(name).copied().unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileAnalysis {
    pub path: String,
    pub assigned_provider: Option<String>,
    pub proposed_name: String,
    pub description: String,
    pub tags: Vec<String>,
    #[serde(default)]
    pub garbage: bool,
    pub error: Option<String>,
}

impl FileAnalysis {
    pub fn failed(
        path: &str,
        original_name: &str,
        provider: Option<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            path: path.to_string(),
            assigned_provider: provider,
            proposed_name: original_name.to_string(),
            description: String::new(),
            tags: Vec::new(),
            garbage: false,
            error: Some(error.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub analyses: Vec<FileAnalysis>,
}

impl AnalysisResult {
    pub fn succeeded(&self) -> impl Iterator<Item = &FileAnalysis> {
        self.analyses.iter().filter(|a| a.is_ok())
    }

    pub fn failed(&self) -> impl Iterator<Item = &FileAnalysis> {
        self.analyses.iter().filter(|a| !a.is_ok())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxonomyNode {
    pub path: String,
    pub label: String,
    pub description: String,
    pub child_paths: Vec<String>,
}

/// Category tree stored flat, keyed by `/`-separated path. Parents are found
/// by trimming the last segment, children through `child_paths`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Taxonomy {
    pub nodes: BTreeMap<String, TaxonomyNode>,
}

impl Taxonomy {
    pub fn contains(&self, path: &str) -> bool {
        self.nodes.contains_key(path)
    }

    pub fn get(&self, path: &str) -> Option<&TaxonomyNode> {
        self.nodes.get(path)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn roots(&self) -> impl Iterator<Item = &TaxonomyNode> {
        self.nodes.values().filter(|n| !n.path.contains('/'))
    }

    /// Adds `path` and any missing ancestors. Existing nodes are left as they
    /// are. Returns whether `path` itself was new.
    pub fn insert_if_absent(&mut self, path: &str, label: &str, description: &str) -> bool {
        if self.nodes.contains_key(path) {
            return false;
        }
        if let Some((parent, _)) = path.rsplit_once('/') {
            if !self.nodes.contains_key(parent) {
                let parent_label = parent.rsplit('/').next().unwrap_or(parent).to_string();
                self.insert_if_absent(parent, &parent_label, "");
            }
            if let Some(node) = self.nodes.get_mut(parent) {
                if !node.child_paths.iter().any(|c| c == path) {
                    node.child_paths.push(path.to_string());
                    node.child_paths.sort();
                }
            }
        }
        let label = if label.trim().is_empty() {
            path.rsplit('/').next().unwrap_or(path)
        } else {
            label.trim()
        };
        self.nodes.insert(
            path.to_string(),
            TaxonomyNode {
                path: path.to_string(),
                label: label.to_string(),
                description: description.trim().to_string(),
                child_paths: Vec::new(),
            },
        );
        true
    }

    /// Renders one line per node, used as context for extending the tree.
    pub fn outline(&self) -> String {
        self.nodes
            .values()
            .map(|n| {
                if n.description.is_empty() {
                    format!("- {} ({})", n.path, n.label)
                } else {
                    format!("- {} ({}): {}", n.path, n.label, n.description)
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileAssignment {
    pub path: String,
    pub target_category_path: String,
    pub proposed_filename: String,
    pub reasoning: String,
    #[serde(default)]
    pub garbage: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaxonomyResult {
    pub taxonomy: Taxonomy,
    pub assignments: Vec<FileAssignment>,
    pub batches: usize,
    pub failed_batches: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveCategory {
    Organized,
    Garbage,
    Excluded,
    Error,
}

impl fmt::Display for MoveCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            MoveCategory::Organized => "organized",
            MoveCategory::Garbage => "garbage",
            MoveCategory::Excluded => "excluded",
            MoveCategory::Error => "error",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveOperation {
    pub source_path: String,
    pub target_dir: String,
    pub target_filename: String,
    pub category: MoveCategory,
    pub success: bool,
    pub error: Option<String>,
    /// Why the file went to a sink; empty for organized moves.
    #[serde(default)]
    pub reason: String,
}

impl MoveOperation {
    pub fn target_path(&self) -> String {
        Path::new(&self.target_dir)
            .join(&self.target_filename)
            .to_string_lossy()
            .into_owned()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub source_path: String,
    pub target_path: String,
    pub category: MoveCategory,
    pub reason: String,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLog {
    pub timestamp: String,
    pub total: usize,
    pub entries: Vec<AuditEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitResult {
    pub dry_run: bool,
    pub operations: Vec<MoveOperation>,
    pub exclusions_log: AuditLog,
    pub errors_log: AuditLog,
}

impl CommitResult {
    pub fn count(&self, category: MoveCategory) -> usize {
        self.operations
            .iter()
            .filter(|op| op.category == category)
            .count()
    }

    pub fn failures(&self) -> usize {
        self.operations.iter().filter(|op| !op.success).count()
    }
}
