use std::collections::HashMap;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::time::Instant;

use rayon::prelude::*;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::cache::{file_key, file_prefix, CacheStore};
use crate::config::ScanPolicy;
use crate::content::{detect_content_type, extract_metadata};
use crate::error::{FoldwiseError, Result};
use crate::records::{EnumerationResult, ExcludedFile, ExclusionRule, FileRecord, ScanError};

use super::worker_pool;

/// Fails unless `source` is an existing directory.
pub fn check_source(source: &Path) -> Result<PathBuf> {
    if !source.exists() {
        return Err(FoldwiseError::SourceMissing(source.to_path_buf()));
    }
    if !source.is_dir() {
        return Err(FoldwiseError::SourceNotDirectory(source.to_path_buf()));
    }
    Ok(source.canonicalize()?)
}

struct Candidate {
    path: PathBuf,
    relative: String,
    size: u64,
}

pub fn enumerate(
    source: &Path,
    policy: &ScanPolicy,
    cache: &CacheStore,
    workers: usize,
) -> Result<EnumerationResult> {
    let root = check_source(source)?;
    let started = Instant::now();
    info!(stage = "stage1", root = %root.display(), "enumerating source tree");

    let mut candidates = Vec::new();
    let mut excluded = Vec::new();
    let mut errors = Vec::new();
    let walker = WalkDir::new(&root)
        .follow_links(policy.follow_symlinks)
        .sort_by_file_name()
        .min_depth(1);
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                let path = err
                    .path()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| root.display().to_string());
                warn!(stage = "stage1", path = %path, error = %err, "scan error");
                errors.push(ScanError {
                    path,
                    message: err.to_string(),
                });
                continue;
            }
        };
        let file_type = entry.file_type();
        if file_type.is_dir() {
            continue;
        }
        let path = entry.path().to_path_buf();
        let relative = relative_path(&root, &path);
        let metadata = match entry.metadata() {
            Ok(meta) => meta,
            Err(err) => {
                errors.push(ScanError {
                    path: path.display().to_string(),
                    message: err.to_string(),
                });
                continue;
            }
        };
        match exclusion(&relative, file_type.is_symlink(), &metadata, policy) {
            Some((rule, reason)) => {
                debug!(stage = "stage1", path = %relative, rule = rule.as_str(), "excluded");
                excluded.push(ExcludedFile {
                    path: path.display().to_string(),
                    relative_path: relative,
                    reason,
                    rule,
                });
            }
            None => candidates.push(Candidate {
                path,
                relative,
                size: metadata.len(),
            }),
        }
    }

    if let Some(limit) = policy.max_files {
        if candidates.len() > limit {
            info!(
                stage = "stage1",
                limit,
                dropped = candidates.len() - limit,
                "max-files limit reached"
            );
            candidates.truncate(limit);
        }
    }

    let pool = worker_pool(workers)?;
    let files: Vec<FileRecord> = pool.install(|| {
        candidates
            .par_iter()
            .map(|candidate| record_for(candidate, cache))
            .collect()
    });

    let result = EnumerationResult::new(&root, files, excluded, errors);
    info!(
        stage = "stage1",
        files = result.files.len(),
        excluded = result.excluded.len(),
        errors = result.errors.len(),
        content_types = result.content_types.len(),
        elapsed = ?started.elapsed(),
        "enumeration finished"
    );
    Ok(result)
}

/// Folds entries of an earlier enumeration back into a fresh walk when
/// `moved` reports that a real commit already took them out of the tree.
/// Entries keep the earlier order, so an unchanged tree reproduces the earlier
/// result exactly and every later stage key stays the same.
pub fn reconcile(
    fresh: EnumerationResult,
    previous: &EnumerationResult,
    policy: &ScanPolicy,
    moved: impl Fn(&str) -> bool,
) -> EnumerationResult {
    if fresh.source_root != previous.source_root {
        return fresh;
    }
    let EnumerationResult {
        files: fresh_files,
        excluded: fresh_excluded,
        errors,
        ..
    } = fresh;

    let order: Vec<String> = fresh_files.iter().map(|f| f.path.clone()).collect();
    let mut by_path: HashMap<String, FileRecord> = fresh_files
        .into_iter()
        .map(|f| (f.path.clone(), f))
        .collect();
    let mut files = Vec::with_capacity(order.len());
    let mut restored = 0usize;
    for earlier in &previous.files {
        if let Some(current) = by_path.remove(&earlier.path) {
            files.push(current);
        } else if moved(&earlier.path) {
            files.push(earlier.clone());
            restored += 1;
        }
    }
    files.extend(order.iter().filter_map(|path| by_path.remove(path)));
    if let Some(limit) = policy.max_files {
        files.truncate(limit);
    }

    let mut excluded: Vec<ExcludedFile> = previous
        .excluded
        .iter()
        .filter(|e| !fresh_excluded.iter().any(|f| f.path == e.path) && moved(&e.path))
        .cloned()
        .collect();
    restored += excluded.len();
    excluded.extend(fresh_excluded);
    excluded.sort_by(|a, b| {
        position_of(&previous.excluded, &a.path).cmp(&position_of(&previous.excluded, &b.path))
    });

    if restored > 0 {
        info!(stage = "stage1", restored, "kept entries already moved by an earlier run");
    }
    EnumerationResult::new(Path::new(&previous.source_root), files, excluded, errors)
}

fn position_of(entries: &[ExcludedFile], path: &str) -> usize {
    entries
        .iter()
        .position(|e| e.path == path)
        .unwrap_or(usize::MAX)
}

fn relative_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

/// First matching rule, in the order hidden, extension, directory, symlink,
/// size.
fn exclusion(
    relative: &str,
    is_symlink: bool,
    metadata: &Metadata,
    policy: &ScanPolicy,
) -> Option<(ExclusionRule, String)> {
    let segments: Vec<&str> = relative.split('/').collect();
    let (name, dirs) = segments.split_last()?;
    if !policy.include_hidden {
        if let Some(hidden) = segments.iter().find(|s| s.starts_with('.')) {
            return Some((ExclusionRule::Hidden, format!("hidden path component {hidden}")));
        }
    }
    if let Some(ext) = Path::new(name).extension().and_then(|e| e.to_str()) {
        if policy.excludes_extension(ext) {
            return Some((ExclusionRule::Extension, format!("excluded extension .{ext}")));
        }
    }
    if let Some(dir) = dirs.iter().find(|d| policy.excludes_dir(d)) {
        return Some((ExclusionRule::Directory, format!("inside excluded directory {dir}")));
    }
    if is_symlink && !policy.follow_symlinks {
        return Some((ExclusionRule::Symlink, "symbolic link".to_string()));
    }
    if let Some(limit) = policy.max_file_size_bytes() {
        if metadata.len() > limit {
            return Some((
                ExclusionRule::Size,
                format!("{} bytes exceeds limit of {limit}", metadata.len()),
            ));
        }
    }
    None
}

fn record_for(candidate: &Candidate, cache: &CacheStore) -> FileRecord {
    let key = file_key(&candidate.path);
    let prefix = file_prefix(1);
    // the key is the absolute path, so a scan from a different root must not
    // reuse the stored relative path
    if let Some(record) = cache
        .get::<FileRecord>(&prefix, &key, Some(&candidate.path))
        .filter(|r| r.relative_path == candidate.relative && r.size_bytes == candidate.size)
    {
        return record;
    }
    let content_type = detect_content_type(&candidate.path);
    let record = FileRecord {
        path: candidate.path.display().to_string(),
        relative_path: candidate.relative.clone(),
        name: candidate
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        content_type: content_type.to_string(),
        size_bytes: candidate.size,
        metadata: extract_metadata(&candidate.path, content_type, candidate.size),
    };
    if let Err(err) = cache.put(&prefix, &key, &record) {
        warn!(stage = "stage1", path = %record.path, error = %err, "failed to cache file record");
    }
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;
    use tempfile::tempdir;

    fn write(root: &Path, rel: &str, body: &[u8]) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }

    fn cache_in(dir: &Path) -> CacheStore {
        CacheStore::open(dir, Duration::from_secs(3600)).unwrap()
    }

    #[test]
    fn rules_apply_in_order_and_record_reason() {
        let src = tempdir().unwrap();
        let cache_dir = tempdir().unwrap();
        write(src.path(), "a.jpg", b"jpeg");
        write(src.path(), "docs/b.pdf", b"pdf");
        write(src.path(), ".hidden/c.tmp", b"x");
        write(src.path(), "dl/movie.part", b"x");
        write(src.path(), "node_modules/pkg/index.js", b"x");
        write(src.path(), "big.bin", &[7u8; 2048]);
        let cache = cache_in(cache_dir.path());
        let result = enumerate(src.path(), &ScanPolicy::default(), &cache, 2).unwrap();

        let names: Vec<&str> = result.files.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(names, vec!["a.jpg", "big.bin", "docs/b.pdf"]);
        let rule_of = |rel: &str| {
            result
                .excluded
                .iter()
                .find(|e| e.relative_path == rel)
                .map(|e| e.rule)
        };
        assert_eq!(rule_of(".hidden/c.tmp"), Some(ExclusionRule::Hidden));
        assert_eq!(rule_of("dl/movie.part"), Some(ExclusionRule::Extension));
        assert_eq!(
            rule_of("node_modules/pkg/index.js"),
            Some(ExclusionRule::Directory)
        );
        assert!(result.content_types.contains("application/pdf"));
    }

    #[test]
    fn size_limit_excludes_large_files() {
        let src = tempdir().unwrap();
        write(src.path(), "empty.txt", b"");
        write(src.path(), "data.bin", b"abc");
        let policy = ScanPolicy {
            max_file_size_mb: Some(0),
            ..ScanPolicy::default()
        };
        let cache = CacheStore::disabled(src.path().join("unused"));
        let result = enumerate(src.path(), &policy, &cache, 1).unwrap();
        assert_eq!(result.files.len(), 1);
        assert_eq!(result.files[0].name, "empty.txt");
        assert_eq!(result.excluded[0].rule, ExclusionRule::Size);
    }

    #[test]
    fn max_files_caps_records_in_path_order() {
        let src = tempdir().unwrap();
        let cache_dir = tempdir().unwrap();
        for name in ["c.txt", "a.txt", "b.txt"] {
            write(src.path(), name, b"hello");
        }
        let policy = ScanPolicy {
            max_files: Some(2),
            ..ScanPolicy::default()
        };
        let result = enumerate(src.path(), &policy, &cache_in(cache_dir.path()), 1).unwrap();
        let names: Vec<&str> = result.files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "b.txt"]);
    }

    #[test]
    fn missing_source_is_fatal() {
        let dir = tempdir().unwrap();
        let cache = CacheStore::disabled(dir.path().join("cache"));
        let err = enumerate(&dir.path().join("nope"), &ScanPolicy::default(), &cache, 1)
            .unwrap_err();
        assert!(matches!(err, FoldwiseError::SourceMissing(_)));
        let file = dir.path().join("file.txt");
        fs::write(&file, "x").unwrap();
        let err = enumerate(&file, &ScanPolicy::default(), &cache, 1).unwrap_err();
        assert!(matches!(err, FoldwiseError::SourceNotDirectory(_)));
    }

    #[test]
    fn file_records_come_from_cache_on_rerun() {
        let src = tempdir().unwrap();
        let cache_dir = tempdir().unwrap();
        write(src.path(), "notes.txt", b"one\ntwo\n");
        let cache = cache_in(cache_dir.path());
        let first = enumerate(src.path(), &ScanPolicy::default(), &cache, 1).unwrap();
        let second = enumerate(src.path(), &ScanPolicy::default(), &cache, 1).unwrap();
        assert_eq!(first, second);
        assert_eq!(cache.stats().unwrap().hits, 1);
        assert_eq!(first.files[0].metadata["line_count"], serde_json::json!(2));
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_directory_is_recorded_and_walk_continues() {
        use std::os::unix::fs::PermissionsExt;

        let src = tempdir().unwrap();
        write(src.path(), "locked/secret.txt", b"x");
        write(src.path(), "open/visible.txt", b"y");
        write(src.path(), "top.txt", b"z");
        let locked = src.path().join("locked");
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();
        if fs::read_dir(&locked).is_ok() {
            // permission bits do not bind this user (root)
            fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
            return;
        }
        let cache = CacheStore::disabled(src.path().join("unused"));
        let result = enumerate(src.path(), &ScanPolicy::default(), &cache, 1);
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

        let result = result.unwrap();
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].path.ends_with("locked"), "{:?}", result.errors);
        let names: Vec<&str> = result.files.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(names, vec!["open/visible.txt", "top.txt"]);
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_excluded_unless_followed() {
        let src = tempdir().unwrap();
        write(src.path(), "real.txt", b"content");
        std::os::unix::fs::symlink(src.path().join("real.txt"), src.path().join("link.txt")).unwrap();
        let cache = CacheStore::disabled(src.path().join("unused"));

        let result = enumerate(src.path(), &ScanPolicy::default(), &cache, 1).unwrap();
        let names: Vec<&str> = result.files.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(names, vec!["real.txt"]);
        assert_eq!(result.excluded.len(), 1);
        assert_eq!(result.excluded[0].relative_path, "link.txt");
        assert_eq!(result.excluded[0].rule, ExclusionRule::Symlink);

        let follow = ScanPolicy {
            follow_symlinks: true,
            ..ScanPolicy::default()
        };
        let result = enumerate(src.path(), &follow, &cache, 1).unwrap();
        assert_eq!(result.files.len(), 2);
        assert!(result.excluded.is_empty());
    }

    #[test]
    fn reconcile_keeps_moved_entries_in_earlier_order() {
        let src = tempdir().unwrap();
        write(src.path(), "a.txt", b"a");
        write(src.path(), "b.txt", b"b");
        write(src.path(), ".cfg", b"c");
        let policy = ScanPolicy::default();
        let cache = CacheStore::disabled(src.path().join("unused"));
        let previous = enumerate(src.path(), &policy, &cache, 1).unwrap();

        let moved_away = |rel: &str| previous.source_root.clone() + "/" + rel;
        fs::remove_file(src.path().join("a.txt")).unwrap();
        fs::remove_file(src.path().join(".cfg")).unwrap();
        write(src.path(), "c.txt", b"new");
        let fresh = enumerate(src.path(), &policy, &cache, 1).unwrap();
        let merged = reconcile(fresh, &previous, &policy, |path| {
            path == moved_away("a.txt") || path == moved_away(".cfg")
        });
        let names: Vec<&str> = merged.files.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "b.txt", "c.txt"]);
        assert_eq!(merged.excluded, previous.excluded);

        fs::remove_file(src.path().join("c.txt")).unwrap();
        let fresh = enumerate(src.path(), &policy, &cache, 1).unwrap();
        let unchanged = reconcile(fresh, &previous, &policy, |path| {
            path == moved_away("a.txt") || path == moved_away(".cfg")
        });
        assert_eq!(unchanged, previous);

        let fresh = enumerate(src.path(), &policy, &cache, 1).unwrap();
        let dropped = reconcile(fresh, &previous, &policy, |_| false);
        assert_eq!(dropped.files.len(), 1);
        assert!(dropped.excluded.is_empty());
    }
}
