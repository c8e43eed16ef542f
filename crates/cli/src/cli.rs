use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use clap::{ArgAction, Parser};
use foldwise_core::{CacheScope, PipelineConfig};
use foldwise_llm::ProviderMode;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(
    name = "foldwise",
    version = VERSION,
    about = "Reorganize a directory tree with AI-proposed categories and names"
)]
pub struct Cli {
    /// Directory to organize.
    #[arg(long, required_unless_present_any = ["cache_stats", "clear_cache"])]
    pub src: Option<PathBuf>,
    /// Destination root for the organized tree.
    #[arg(long, required_unless_present_any = ["cache_stats", "clear_cache"])]
    pub dst: Option<PathBuf>,
    /// TOML config file; defaults to ./foldwise.toml when present.
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long = "no-cache", action = ArgAction::SetTrue)]
    pub no_cache: bool,
    /// `all` or `stage1`..`stage5`.
    #[arg(long = "clear-cache", value_name = "SCOPE", value_parser = parse_scope)]
    pub clear_cache: Option<CacheScope>,
    #[arg(long = "cache-stats", action = ArgAction::SetTrue)]
    pub cache_stats: bool,

    #[arg(long = "skip-stage1", action = ArgAction::SetTrue)]
    pub skip_stage1: bool,
    #[arg(long = "skip-stage2", action = ArgAction::SetTrue)]
    pub skip_stage2: bool,
    #[arg(long = "skip-stage3", action = ArgAction::SetTrue)]
    pub skip_stage3: bool,
    #[arg(long = "skip-stage4", action = ArgAction::SetTrue)]
    pub skip_stage4: bool,
    #[arg(long = "skip-stage5", action = ArgAction::SetTrue)]
    pub skip_stage5: bool,

    #[arg(long = "max-files")]
    pub max_files: Option<usize>,
    #[arg(long = "dry-run", action = ArgAction::SetTrue)]
    pub dry_run: bool,
    #[arg(long, action = ArgAction::SetTrue)]
    pub overwrite: bool,
    /// online, local or mixed.
    #[arg(long, value_parser = parse_mode)]
    pub mode: Option<ProviderMode>,

    #[arg(long = "stage1-output")]
    pub stage1_output: Option<PathBuf>,
    #[arg(long = "stage2-output")]
    pub stage2_output: Option<PathBuf>,
    #[arg(long = "stage3-output")]
    pub stage3_output: Option<PathBuf>,
    #[arg(long = "stage4-output")]
    pub stage4_output: Option<PathBuf>,
    #[arg(long = "stage5-output")]
    pub stage5_output: Option<PathBuf>,

    #[arg(short, long, action = ArgAction::SetTrue)]
    pub verbose: bool,
}

impl Cli {
    /// Flags take precedence over the file and environment.
    pub fn apply(&self, config: &mut PipelineConfig) {
        if self.no_cache {
            config.cache.enabled = false;
        }
        if let Some(max) = self.max_files {
            config.scan.max_files = Some(max);
        }
        if self.dry_run {
            config.commit.dry_run = true;
        }
        if self.overwrite {
            config.commit.overwrite = true;
        }
        if let Some(mode) = self.mode {
            config.providers.mode = mode;
        }
    }

    pub fn skip_stages(&self) -> BTreeSet<u8> {
        [
            self.skip_stage1,
            self.skip_stage2,
            self.skip_stage3,
            self.skip_stage4,
            self.skip_stage5,
        ]
        .into_iter()
        .zip(1u8..)
        .filter_map(|(skip, n)| skip.then_some(n))
        .collect()
    }

    pub fn stage_outputs(&self) -> BTreeMap<u8, PathBuf> {
        [
            &self.stage1_output,
            &self.stage2_output,
            &self.stage3_output,
            &self.stage4_output,
            &self.stage5_output,
        ]
        .into_iter()
        .zip(1u8..)
        .filter_map(|(path, n)| path.clone().map(|p| (n, p)))
        .collect()
    }

    pub fn cache_only(&self) -> bool {
        self.src.is_none() || self.dst.is_none()
    }
}

fn parse_scope(raw: &str) -> Result<CacheScope, String> {
    CacheScope::parse(raw).ok_or_else(|| format!("expected all or stage1..stage5, got {raw}"))
}

fn parse_mode(raw: &str) -> Result<ProviderMode, String> {
    ProviderMode::from_str(raw).ok_or_else(|| format!("expected online, local or mixed, got {raw}"))
}
