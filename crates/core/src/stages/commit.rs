use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::cache::{file_key, file_prefix, CacheStore};
use crate::config::CommitSettings;
use crate::error::{FoldwiseError, Result};
use crate::records::{
    AnalysisResult, AuditEntry, AuditLog, CommitResult, EnumerationResult, MoveCategory,
    MoveOperation, TaxonomyResult,
};

pub const EXCLUSIONS_LOG: &str = "exclusions_log.json";
pub const ERRORS_LOG: &str = "errors_log.json";

/// Creates the destination root unless this is a dry run.
pub fn prepare_destination(dst: &Path, dry_run: bool) -> Result<()> {
    if dry_run {
        if dst.exists() && !dst.is_dir() {
            return Err(FoldwiseError::Destination {
                path: dst.to_path_buf(),
                source: io::Error::new(io::ErrorKind::AlreadyExists, "not a directory"),
            });
        }
        return Ok(());
    }
    fs::create_dir_all(dst).map_err(|source| FoldwiseError::Destination {
        path: dst.to_path_buf(),
        source,
    })
}

struct Planned {
    source: String,
    dir: PathBuf,
    filename: String,
    category: MoveCategory,
    reason: String,
}

pub fn commit(
    enumeration: &EnumerationResult,
    analysis: &AnalysisResult,
    taxonomy: &TaxonomyResult,
    dst: &Path,
    settings: &CommitSettings,
    cache: &CacheStore,
) -> Result<CommitResult> {
    let started = Instant::now();
    prepare_destination(dst, settings.dry_run)?;
    let plan = plan_moves(enumeration, analysis, taxonomy, dst, settings);
    info!(
        stage = "stage5",
        moves = plan.len(),
        dry_run = settings.dry_run,
        dst = %dst.display(),
        "committing moves"
    );

    let now = Utc::now();
    let mut claimed = HashSet::new();
    let mut operations = Vec::with_capacity(plan.len());
    for planned in plan {
        let op = execute(planned, settings, cache, &mut claimed, now);
        if !op.success {
            warn!(stage = "stage5", source = %op.source_path, error = op.error.as_deref().unwrap_or(""), "move failed");
        }
        operations.push(op);
    }

    let exclusions_log = audit_log(&operations, now, |op| {
        matches!(op.category, MoveCategory::Excluded | MoveCategory::Garbage)
    });
    let errors_log = audit_log(&operations, now, |op| {
        op.category == MoveCategory::Error || !op.success
    });
    if !settings.dry_run {
        for (dir, name, log) in [
            (&settings.excluded_dir, EXCLUSIONS_LOG, &exclusions_log),
            (&settings.errors_dir, ERRORS_LOG, &errors_log),
        ] {
            let dir = dst.join(dir);
            if let Err(err) = write_log(&dir, name, log) {
                warn!(stage = "stage5", path = %dir.join(name).display(), error = %err, "failed to write audit log");
            }
        }
    }

    let result = CommitResult {
        dry_run: settings.dry_run,
        operations,
        exclusions_log,
        errors_log,
    };
    info!(
        stage = "stage5",
        organized = result.count(MoveCategory::Organized),
        garbage = result.count(MoveCategory::Garbage),
        excluded = result.count(MoveCategory::Excluded),
        errors = result.count(MoveCategory::Error),
        failed = result.failures(),
        elapsed = ?started.elapsed(),
        "commit finished"
    );
    Ok(result)
}

/// Assignments first, then Stage1 exclusions, then failed analyses.
fn plan_moves(
    enumeration: &EnumerationResult,
    analysis: &AnalysisResult,
    taxonomy: &TaxonomyResult,
    dst: &Path,
    settings: &CommitSettings,
) -> Vec<Planned> {
    let records = enumeration.records_by_path();
    let mut plan = Vec::new();
    for assignment in &taxonomy.assignments {
        let category = if assignment.garbage {
            MoveCategory::Garbage
        } else {
            MoveCategory::Organized
        };
        let reason = if assignment.garbage {
            assignment.reasoning.clone()
        } else {
            String::new()
        };
        plan.push(Planned {
            source: assignment.path.clone(),
            dir: join_relative(dst, &assignment.target_category_path),
            filename: assignment.proposed_filename.clone(),
            category,
            reason,
        });
    }
    for excluded in &enumeration.excluded {
        plan.push(Planned {
            source: excluded.path.clone(),
            dir: join_relative(&dst.join(&settings.excluded_dir), parent_of(&excluded.relative_path)),
            filename: file_name_of(&excluded.path),
            category: MoveCategory::Excluded,
            reason: format!("{}: {}", excluded.rule.as_str(), excluded.reason),
        });
    }
    for failed in analysis.failed() {
        let relative = records
            .get(failed.path.as_str())
            .map(|r| r.relative_path.as_str())
            .unwrap_or("");
        plan.push(Planned {
            source: failed.path.clone(),
            dir: join_relative(&dst.join(&settings.errors_dir), parent_of(relative)),
            filename: file_name_of(&failed.path),
            category: MoveCategory::Error,
            reason: failed.error.clone().unwrap_or_default(),
        });
    }
    plan
}

fn join_relative(base: &Path, relative: &str) -> PathBuf {
    relative
        .split('/')
        .filter(|s| !s.is_empty() && *s != "." && *s != "..")
        .fold(base.to_path_buf(), |acc, s| acc.join(s))
}

fn parent_of(relative: &str) -> &str {
    relative.rsplit_once('/').map(|(parent, _)| parent).unwrap_or("")
}

fn file_name_of(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

fn execute(
    planned: Planned,
    settings: &CommitSettings,
    cache: &CacheStore,
    claimed: &mut HashSet<PathBuf>,
    now: DateTime<Utc>,
) -> MoveOperation {
    let key = file_key(Path::new(&planned.source));
    let prefix = file_prefix(5);
    if !settings.dry_run {
        if let Some(done) = completed_move(cache, &planned.source) {
            debug!(stage = "stage5", source = %done.source_path, "already moved");
            claimed.insert(PathBuf::from(done.target_path()));
            return done;
        }
    }

    let mut op = MoveOperation {
        source_path: planned.source,
        target_dir: planned.dir.display().to_string(),
        target_filename: planned.filename,
        category: planned.category,
        success: false,
        error: None,
        reason: planned.reason,
    };
    match resolve_target(&planned.dir, &op.target_filename, op.category, settings.overwrite, claimed, now) {
        Ok(filename) => op.target_filename = filename,
        Err(message) => {
            op.error = Some(message);
            return op;
        }
    }
    let target = planned.dir.join(&op.target_filename);
    claimed.insert(target.clone());
    if settings.dry_run {
        op.success = true;
        return op;
    }
    match move_file(Path::new(&op.source_path), &target, settings.overwrite) {
        Ok(()) => {
            op.success = true;
            debug!(stage = "stage5", source = %op.source_path, target = %target.display(), category = %op.category, "moved");
            if let Err(err) = cache.put(&prefix, &key, &op) {
                warn!(stage = "stage5", error = %err, "failed to cache move");
            }
        }
        Err(err) => op.error = Some(err.to_string()),
    }
    op
}

/// The recorded move of `source` when an earlier real run finished it: the
/// source is gone and the target is still in place.
pub fn completed_move(cache: &CacheStore, source: &str) -> Option<MoveOperation> {
    cache
        .get::<MoveOperation>(&file_prefix(5), &file_key(Path::new(source)), None)
        .filter(|done| done.success && done.source_path == source)
        .filter(|done| !Path::new(source).exists() && Path::new(&done.target_path()).exists())
}

/// Picks the final file name in `dir`. Names already claimed earlier in this
/// run get a counter suffix. An existing file on disk refuses organized
/// moves unless `overwrite` is set; sink categories get a timestamp suffix.
fn resolve_target(
    dir: &Path,
    filename: &str,
    category: MoveCategory,
    overwrite: bool,
    claimed: &HashSet<PathBuf>,
    now: DateTime<Utc>,
) -> std::result::Result<String, String> {
    let taken = |name: &str| {
        let path = dir.join(name);
        claimed.contains(&path) || path.exists()
    };
    let candidate = dir.join(filename);
    if claimed.contains(&candidate) {
        return Ok(next_free(filename, None, &taken));
    }
    if !candidate.exists() {
        return Ok(filename.to_string());
    }
    match category {
        MoveCategory::Organized if overwrite => Ok(filename.to_string()),
        MoveCategory::Organized => Err(format!(
            "target {} already exists",
            candidate.display()
        )),
        _ => {
            let stamp = now.format("%Y%m%d-%H%M%S").to_string();
            Ok(next_free(filename, Some(&stamp), &taken))
        }
    }
}

fn split_name(filename: &str) -> (&str, Option<&str>) {
    match filename.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (filename, None),
    }
}

fn next_free(filename: &str, stamp: Option<&str>, taken: &dyn Fn(&str) -> bool) -> String {
    let (stem, ext) = split_name(filename);
    let build = |counter: usize| {
        let mut name = stem.to_string();
        if let Some(stamp) = stamp {
            name.push('_');
            name.push_str(stamp);
        }
        if counter > 1 {
            name.push_str(&format!("_{counter}"));
        }
        match ext {
            Some(ext) => format!("{name}.{ext}"),
            None => name,
        }
    };
    let start = if stamp.is_some() { 1 } else { 2 };
    (start..)
        .map(build)
        .find(|name| !taken(name))
        .unwrap_or_else(|| filename.to_string())
}

/// Rename, falling back to copy and remove when the rename fails (for
/// example across filesystems).
fn move_file(source: &Path, target: &Path, overwrite: bool) -> io::Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    if overwrite && target.is_file() {
        fs::remove_file(target)?;
    }
    match fs::rename(source, target) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Err(err),
        Err(err) => {
            debug!(source = %source.display(), error = %err, "rename failed, copying instead");
            fs::copy(source, target).map_err(|_| err)?;
            fs::remove_file(source)
        }
    }
}

fn audit_log(
    operations: &[MoveOperation],
    now: DateTime<Utc>,
    include: impl Fn(&MoveOperation) -> bool,
) -> AuditLog {
    let entries: Vec<AuditEntry> = operations
        .iter()
        .filter(|op| include(op))
        .map(|op| AuditEntry {
            source_path: op.source_path.clone(),
            target_path: op.target_path(),
            category: op.category,
            reason: match &op.error {
                Some(err) if op.reason.is_empty() => err.clone(),
                Some(err) => format!("{}; move failed: {err}", op.reason),
                None => op.reason.clone(),
            },
            success: op.success,
        })
        .collect();
    AuditLog {
        timestamp: now.to_rfc3339(),
        total: entries.len(),
        entries,
    }
}

fn write_log(dir: &Path, name: &str, log: &AuditLog) -> Result<()> {
    fs::create_dir_all(dir)?;
    let path = dir.join(name);
    fs::write(&path, serde_json::to_vec_pretty(log)?)?;
    debug!(stage = "stage5", path = %path.display(), entries = log.total, "audit log written");
    Ok(())
}
