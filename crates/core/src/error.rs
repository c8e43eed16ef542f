use std::path::PathBuf;

use foldwise_llm::ProviderError;
use thiserror::Error;

use crate::scheduler::SchedulerError;

#[derive(Error, Debug)]
pub enum FoldwiseError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serde json error: {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("source directory {0:?} does not exist")]
    SourceMissing(PathBuf),
    #[error("source path {0:?} is not a directory")]
    SourceNotDirectory(PathBuf),
    #[error("cannot create destination {path:?}: {source}")]
    Destination {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no cached result for stage{0}; run it without --skip-stage{0} first")]
    MissingStageResult(u8),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error("other: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, FoldwiseError>;

impl From<anyhow::Error> for FoldwiseError {
    fn from(value: anyhow::Error) -> Self {
        Self::Other(value.to_string())
    }
}
