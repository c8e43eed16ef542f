use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::Result;

pub const STAGE_COUNT: u8 = 5;

/// First 16 hex characters of the SHA-256 of `input`.
pub fn short_hash(input: &[u8]) -> String {
    let digest = Sha256::digest(input);
    hex::encode(&digest[..8])
}

/// Key for a single file's entry.
pub fn file_key(path: &Path) -> String {
    let mut buf = b"file\0".to_vec();
    buf.extend_from_slice(path.to_string_lossy().as_bytes());
    short_hash(&buf)
}

/// Key for a whole stage result produced from `source_dir`. `fingerprint`
/// carries everything else the result depends on.
pub fn stage_key(source_dir: &Path, fingerprint: &str) -> String {
    let mut buf = b"stage\0".to_vec();
    buf.extend_from_slice(source_dir.to_string_lossy().as_bytes());
    buf.push(0);
    buf.extend_from_slice(fingerprint.as_bytes());
    short_hash(&buf)
}

/// Digest of any serializable value, used to chain stage keys.
pub fn digest_of<T: Serialize>(value: &T) -> String {
    short_hash(&serde_json::to_vec(value).unwrap_or_default())
}

pub fn stage_prefix(stage: u8) -> String {
    format!("stage{stage}")
}

pub fn file_prefix(stage: u8) -> String {
    format!("stage{stage}_file")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheScope {
    All,
    Stage(u8),
}

impl CacheScope {
    pub fn parse(raw: &str) -> Option<Self> {
        let lower = raw.trim().to_lowercase();
        if lower == "all" {
            return Some(CacheScope::All);
        }
        let n: u8 = lower.strip_prefix("stage")?.parse().ok()?;
        (1..=STAGE_COUNT).contains(&n).then_some(CacheScope::Stage(n))
    }

    fn matches(&self, file_name: &str) -> bool {
        match self {
            CacheScope::All => true,
            CacheScope::Stage(n) => file_name.starts_with(&format!("stage{n}_")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PrefixStats {
    pub entries: usize,
    pub bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entry_count: usize,
    pub total_bytes: u64,
    pub by_prefix: BTreeMap<String, PrefixStats>,
    pub hits: u64,
    pub misses: u64,
}

#[derive(Serialize, Deserialize)]
struct CacheEntry<T> {
    key: String,
    written_at: DateTime<Utc>,
    payload: T,
}

/// One JSON file per key under `dir`, named `<prefix>_<key>.json`.
pub struct CacheStore {
    dir: PathBuf,
    ttl: Duration,
    enabled: bool,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStore {
    pub fn open(dir: impl Into<PathBuf>, ttl: Duration) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            ttl,
            enabled: true,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    /// A store that never hits and never writes.
    pub fn disabled(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ttl: Duration::ZERO,
            enabled: false,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn entry_path(&self, prefix: &str, key: &str) -> PathBuf {
        self.dir.join(format!("{prefix}_{key}.json"))
    }

    /// Returns the payload if present, within TTL and, when `source` is
    /// given, not older than that file's modification time. Anything else,
    /// including unreadable or corrupt entries, is a miss.
    pub fn get<T: DeserializeOwned>(&self, prefix: &str, key: &str, source: Option<&Path>) -> Option<T> {
        self.get_at(prefix, key, source, Utc::now())
    }

    pub(crate) fn get_at<T: DeserializeOwned>(
        &self,
        prefix: &str,
        key: &str,
        source: Option<&Path>,
        now: DateTime<Utc>,
    ) -> Option<T> {
        let found = self.lookup(prefix, key, source, now);
        let counter = if found.is_some() {
            &self.hits
        } else {
            &self.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    fn lookup<T: DeserializeOwned>(
        &self,
        prefix: &str,
        key: &str,
        source: Option<&Path>,
        now: DateTime<Utc>,
    ) -> Option<T> {
        if !self.enabled {
            return None;
        }
        let path = self.entry_path(prefix, key);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "unreadable cache entry");
                return None;
            }
        };
        let entry: CacheEntry<T> = match serde_json::from_slice(&raw) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "corrupt cache entry ignored");
                return None;
            }
        };
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX);
        if now.signed_duration_since(entry.written_at) > ttl {
            debug!(prefix, key, "cache entry expired");
            return None;
        }
        if let Some(source) = source {
            let modified = match fs::metadata(source).and_then(|m| m.modified()) {
                Ok(modified) => DateTime::<Utc>::from(modified),
                Err(_) => return None,
            };
            if modified > entry.written_at {
                debug!(prefix, key, source = %source.display(), "source changed since cache write");
                return None;
            }
        }
        Some(entry.payload)
    }

    /// Writes atomically, replacing any previous entry for the key.
    pub fn put<T: Serialize>(&self, prefix: &str, key: &str, payload: &T) -> Result<()> {
        self.put_at(prefix, key, payload, Utc::now())
    }

    pub(crate) fn put_at<T: Serialize>(
        &self,
        prefix: &str,
        key: &str,
        payload: &T,
        written_at: DateTime<Utc>,
    ) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let entry = CacheEntry {
            key: key.to_string(),
            written_at,
            payload,
        };
        let encoded = serde_json::to_vec(&entry)?;
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&encoded)?;
        tmp.persist(self.entry_path(prefix, key))
            .map_err(|err| err.error)?;
        Ok(())
    }

    /// Deletes every entry in `scope`; returns how many were removed.
    pub fn invalidate(&self, scope: CacheScope) -> Result<usize> {
        let mut removed = 0usize;
        for (name, path, _) in self.entries()? {
            if scope.matches(&name) {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        debug!(?scope, removed, "cache invalidated");
        Ok(removed)
    }

    pub fn stats(&self) -> Result<CacheStats> {
        let mut stats = CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            ..CacheStats::default()
        };
        for (name, _, bytes) in self.entries()? {
            stats.entry_count += 1;
            stats.total_bytes += bytes;
            let prefix = name
                .trim_end_matches(".json")
                .rsplit_once('_')
                .map(|(prefix, _)| prefix.to_string())
                .unwrap_or_else(|| name.clone());
            let bucket = stats.by_prefix.entry(prefix).or_default();
            bucket.entries += 1;
            bucket.bytes += bytes;
        }
        Ok(stats)
    }

    fn entries(&self) -> Result<Vec<(String, PathBuf, u64)>> {
        let mut out = Vec::new();
        let reader = match fs::read_dir(&self.dir) {
            Ok(reader) => reader,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(err) => return Err(err.into()),
        };
        for entry in reader {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with("stage") || !name.ends_with(".json") {
                continue;
            }
            let meta = entry.metadata()?;
            if meta.is_file() {
                out.push((name, entry.path(), meta.len()));
            }
        }
        out.sort();
        Ok(out)
    }
}
