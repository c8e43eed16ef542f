mod cache;
mod config;
mod content;
mod error;
mod parse;
mod pipeline;
mod records;
mod scheduler;
pub mod stages;
mod tree;

pub use cache::{
    digest_of, file_key, file_prefix, short_hash, stage_key, stage_prefix, CacheScope, CacheStats,
    CacheStore, PrefixStats, STAGE_COUNT,
};
pub use config::{
    AnalysisSettings, CacheSettings, CommitSettings, LocalBackendSettings, PipelineConfig,
    ProviderSettings, RemoteBackendSettings, ScanPolicy, SchedulerSettings, TaxonomySettings,
    DEFAULT_CONFIG_FILE,
};
pub use content::{detect_content_type, extract_metadata, primary_type, read_excerpt, OCTET_STREAM};
pub use error::{FoldwiseError, Result};
pub use parse::{
    extract_json_block, parse_analysis, parse_taxonomy_response, parse_type_mapping, ParseError,
    ParsedAnalysis, ProposedAssignment, ProposedCategory, TaxonomyProposal,
};
pub use pipeline::{Pipeline, RunOptions, RunReport};
pub use records::{
    AnalysisResult, AuditEntry, AuditLog, CommitResult, DiscoveryResult, EnumerationResult,
    ExcludedFile, ExclusionRule, FileAnalysis, FileAssignment, FileRecord, MappingSource,
    MoveCategory, MoveOperation, ScanError, Taxonomy, TaxonomyNode, TaxonomyResult,
    TypeToProviderMap,
};
pub use scheduler::{
    detect_total_ram_gb, EvictionHook, LoadedModel, ModelLease, ModelScheduler, SchedulerConfig,
    SchedulerError,
};
pub use stages::InferenceContext;
pub use tree::{chunk_tree, DirTree, TreeChunk};

pub use foldwise_llm as llm;
