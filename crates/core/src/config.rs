use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use foldwise_llm::{ProviderMode, RegistrySettings};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::short_hash;
use crate::error::{FoldwiseError, Result};

pub const DEFAULT_CONFIG_FILE: &str = "foldwise.toml";

/// Run-wide settings. Built once at startup and handed to each stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub cache: CacheSettings,
    pub scan: ScanPolicy,
    pub providers: ProviderSettings,
    pub scheduler: SchedulerSettings,
    pub analysis: AnalysisSettings,
    pub taxonomy: TaxonomySettings,
    pub commit: CommitSettings,
}

impl PipelineConfig {
    /// Reads `path`, or `foldwise.toml` in the working directory when no path
    /// is given and that file exists, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).is_file() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|err| {
            FoldwiseError::Config(format!("failed to read {}: {err}", path.display()))
        })?;
        debug!(path = %path.display(), "loaded config file");
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|err| FoldwiseError::Config(err.to_string()))
    }

    fn apply_env(&mut self) {
        if let Ok(dir) = env::var("FOLDWISE_CACHE_DIR") {
            self.cache.dir = PathBuf::from(dir);
        }
        if let Ok(key) = env::var("OPENAI_API_KEY") {
            self.providers.openai.api_key = Some(key);
        }
        if let Ok(key) = env::var("ANTHROPIC_API_KEY") {
            self.providers.anthropic.api_key = Some(key);
        }
        if let Ok(host) = env::var("OLLAMA_HOST") {
            self.providers.ollama.base_url = if host.starts_with("http") {
                host
            } else {
                format!("http://{host}")
            };
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.taxonomy.batch_size == 0 {
            return Err(FoldwiseError::Config(
                "taxonomy.batch_size must be positive".into(),
            ));
        }
        if self.scheduler.max_concurrent == 0 {
            return Err(FoldwiseError::Config(
                "scheduler.max_concurrent must be positive".into(),
            ));
        }
        if self.analysis.workers == 0 {
            return Err(FoldwiseError::Config(
                "analysis.workers must be positive".into(),
            ));
        }
        if !(0.0..=2.0).contains(&self.providers.temperature) {
            return Err(FoldwiseError::Config(
                "providers.temperature must be within 0.0..=2.0".into(),
            ));
        }
        Ok(())
    }

    pub fn registry_settings(&self) -> RegistrySettings {
        RegistrySettings {
            openai_api_key: self.providers.openai.api_key.clone(),
            openai_base_url: self.providers.openai.base_url.clone(),
            anthropic_api_key: self.providers.anthropic.api_key.clone(),
            anthropic_base_url: self.providers.anthropic.base_url.clone(),
            ollama_base_url: self
                .providers
                .ollama
                .enabled
                .then(|| self.providers.ollama.base_url.clone()),
            timeout: Duration::from_secs(self.providers.timeout_secs.max(1)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub dir: PathBuf,
    pub ttl_hours: u64,
    pub enabled: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(".foldwise-cache"),
            ttl_hours: 24 * 7,
            enabled: true,
        }
    }
}

impl CacheSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_hours.saturating_mul(3600))
    }
}

/// Inclusion policy for Stage1. Rules are applied in the order
/// hidden, extension, directory, size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanPolicy {
    pub include_hidden: bool,
    pub excluded_extensions: Vec<String>,
    pub excluded_dirs: Vec<String>,
    pub max_file_size_mb: Option<u64>,
    pub follow_symlinks: bool,
    pub max_files: Option<usize>,
}

impl Default for ScanPolicy {
    fn default() -> Self {
        Self {
            include_hidden: false,
            excluded_extensions: vec![
                "tmp".to_string(),
                "part".to_string(),
                "crdownload".to_string(),
            ],
            excluded_dirs: vec![
                ".git".to_string(),
                "node_modules".to_string(),
                "__pycache__".to_string(),
            ],
            max_file_size_mb: Some(2048),
            follow_symlinks: false,
            max_files: None,
        }
    }
}

impl ScanPolicy {
    pub fn max_file_size_bytes(&self) -> Option<u64> {
        self.max_file_size_mb.map(|mb| mb.saturating_mul(1024 * 1024))
    }

    pub fn excludes_extension(&self, ext: &str) -> bool {
        let ext = ext.trim_start_matches('.').to_lowercase();
        self.excluded_extensions
            .iter()
            .any(|e| e.trim_start_matches('.').to_lowercase() == ext)
    }

    pub fn excludes_dir(&self, name: &str) -> bool {
        self.excluded_dirs.iter().any(|d| d == name)
    }

    /// Stable digest of every field; part of the Stage1 cache key.
    pub fn fingerprint(&self) -> String {
        let encoded = serde_json::to_vec(self).unwrap_or_default();
        short_hash(&encoded)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub mode: ProviderMode,
    pub mapping_provider: Option<String>,
    pub timeout_secs: u64,
    pub temperature: f32,
    pub max_tokens: u32,
    pub openai: RemoteBackendSettings,
    pub anthropic: RemoteBackendSettings,
    pub ollama: LocalBackendSettings,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            mode: ProviderMode::Mixed,
            mapping_provider: None,
            timeout_secs: 120,
            temperature: 0.2,
            max_tokens: 1024,
            openai: RemoteBackendSettings {
                api_key: None,
                base_url: "https://api.openai.com/v1".to_string(),
            },
            anthropic: RemoteBackendSettings {
                api_key: None,
                base_url: "https://api.anthropic.com".to_string(),
            },
            ollama: LocalBackendSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteBackendSettings {
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalBackendSettings {
    pub enabled: bool,
    pub base_url: String,
}

impl Default for LocalBackendSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "http://127.0.0.1:11434".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Detected from the host when unset.
    pub total_ram_gb: Option<f64>,
    pub max_concurrent: usize,
    pub idle_timeout_secs: u64,
    pub force_evict: bool,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            total_ram_gb: None,
            max_concurrent: 1,
            idle_timeout_secs: 300,
            force_evict: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisSettings {
    pub workers: usize,
    pub excerpt_bytes: usize,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            excerpt_bytes: 2048,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaxonomySettings {
    pub batch_size: usize,
    pub max_tree_bytes: usize,
    pub garbage_path: String,
    pub uncategorized_path: String,
}

impl Default for TaxonomySettings {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_tree_bytes: 8 * 1024,
            garbage_path: "_garbage".to_string(),
            uncategorized_path: "Uncategorized".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommitSettings {
    pub dry_run: bool,
    pub overwrite: bool,
    pub excluded_dir: String,
    pub errors_dir: String,
}

impl Default for CommitSettings {
    fn default() -> Self {
        Self {
            dry_run: false,
            overwrite: false,
            excluded_dir: "_excluded".to_string(),
            errors_dir: "_errors".to_string(),
        }
    }
}
