use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Directory tree in the shape handed to context-limited consumers:
/// `{"dirs": {name: tree}, "files": [name]}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirTree {
    #[serde(default)]
    pub dirs: BTreeMap<String, DirTree>,
    #[serde(default)]
    pub files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeChunk {
    pub tree: DirTree,
    /// Set when the chunk is a single file whose encoding alone exceeds the
    /// limit; such a chunk cannot be split any further.
    pub oversized: bool,
}

impl DirTree {
    /// Builds a tree from `/`-separated relative paths.
    pub fn from_paths<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut root = DirTree::default();
        for path in paths {
            let parts: Vec<&str> = path
                .as_ref()
                .split('/')
                .filter(|p| !p.is_empty())
                .collect();
            let Some((file, dirs)) = parts.split_last() else {
                continue;
            };
            let mut node = &mut root;
            for dir in dirs {
                node = node.dirs.entry((*dir).to_string()).or_default();
            }
            node.files.push((*file).to_string());
        }
        root
    }

    pub fn encoded_size(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(usize::MAX)
    }

    pub fn file_count(&self) -> usize {
        self.files.len() + self.dirs.values().map(|d| d.file_count()).sum::<usize>()
    }

    /// Every file as a `/`-separated path relative to this tree's root.
    pub fn file_paths(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_paths("", &mut out);
        out
    }

    fn collect_paths(&self, prefix: &str, out: &mut Vec<String>) {
        for file in &self.files {
            out.push(join(prefix, file));
        }
        for (name, sub) in &self.dirs {
            sub.collect_paths(&join(prefix, name), out);
        }
    }

    fn wrap(name: &str, inner: DirTree) -> DirTree {
        let mut dirs = BTreeMap::new();
        dirs.insert(name.to_string(), inner);
        DirTree {
            dirs,
            files: Vec::new(),
        }
    }
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

/// Splits `tree` into independently serializable sub-trees whose encoded
/// size stays within `max_encoded_size`. Every input file lands in exactly one
/// chunk. A lone file that cannot fit is emitted on its own and flagged
/// `oversized`; that is the floor of the subdivision.
pub fn chunk_tree(tree: &DirTree, max_encoded_size: usize) -> Vec<TreeChunk> {
    if tree.file_count() == 0 || tree.encoded_size() <= max_encoded_size {
        return vec![finish(tree.clone(), max_encoded_size)];
    }
    split(tree, max_encoded_size)
        .into_iter()
        .map(|t| finish(t, max_encoded_size))
        .collect()
}

fn finish(tree: DirTree, max: usize) -> TreeChunk {
    let size = tree.encoded_size();
    let oversized = size > max && tree.file_count() > 0;
    if oversized {
        warn!(
            size,
            limit = max,
            file = tree.file_paths().first().map(String::as_str).unwrap_or(""),
            "chunk exceeds size limit and cannot be subdivided"
        );
    }
    TreeChunk { tree, oversized }
}

fn split(tree: &DirTree, max: usize) -> Vec<DirTree> {
    if tree.encoded_size() <= max {
        return vec![tree.clone()];
    }
    let mut out = Vec::new();
    if !tree.files.is_empty() {
        let root_files = DirTree {
            dirs: BTreeMap::new(),
            files: tree.files.clone(),
        };
        if root_files.encoded_size() <= max {
            out.push(root_files);
        } else {
            out.extend(pack_files(&tree.files, max));
        }
    }
    for (name, sub) in &tree.dirs {
        if sub.file_count() == 0 {
            continue;
        }
        let wrapped = DirTree::wrap(name, sub.clone());
        if wrapped.encoded_size() <= max {
            out.push(wrapped);
            continue;
        }
        // wrapping adds a fixed number of bytes, so recurse against the
        // reduced budget and re-wrap every inner piece
        let overhead = wrap_overhead(name);
        for inner in split(sub, max.saturating_sub(overhead)) {
            out.push(DirTree::wrap(name, inner));
        }
    }
    out
}

fn wrap_overhead(name: &str) -> usize {
    DirTree::wrap(name, DirTree::default())
        .encoded_size()
        .saturating_sub(DirTree::default().encoded_size())
}

/// Greedy packing in visitation order; flushes when the next name would push
/// the encoded chunk past `max`.
fn pack_files(files: &[String], max: usize) -> Vec<DirTree> {
    let base = DirTree::default().encoded_size();
    let mut out = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut running = 0usize;
    for file in files {
        let item = serde_json::to_vec(file).map(|v| v.len()).unwrap_or(0);
        let separator = usize::from(!current.is_empty());
        if !current.is_empty() && base + running + separator + item > max {
            out.push(DirTree {
                dirs: BTreeMap::new(),
                files: std::mem::take(&mut current),
            });
            running = 0;
        }
        running += usize::from(!current.is_empty()) + item;
        current.push(file.clone());
    }
    if !current.is_empty() {
        out.push(DirTree {
            dirs: BTreeMap::new(),
            files: current,
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sorted(mut paths: Vec<String>) -> Vec<String> {
        paths.sort();
        paths
    }

    fn all_paths(chunks: &[TreeChunk]) -> Vec<String> {
        sorted(chunks.iter().flat_map(|c| c.tree.file_paths()).collect())
    }

    #[test]
    fn empty_tree_yields_single_empty_chunk() {
        let chunks = chunk_tree(&DirTree::default(), 10);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].tree, DirTree::default());
        assert!(!chunks[0].oversized);
    }

    #[test]
    fn small_tree_is_emitted_whole() {
        let tree = DirTree::from_paths(["a.txt", "docs/b.pdf", "docs/c/d.md"]);
        let chunks = chunk_tree(&tree, 10_000);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].tree, tree);
    }

    #[test]
    fn split_keeps_full_path_context() {
        let paths: Vec<String> = (0..40)
            .map(|i| format!("photos/2021/summer/img_{i:03}.jpg"))
            .chain((0..5).map(|i| format!("notes_{i}.txt")))
            .collect();
        let tree = DirTree::from_paths(&paths);
        let limit = 300;
        let chunks = chunk_tree(&tree, limit);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(!chunk.oversized);
            assert!(chunk.tree.encoded_size() <= limit);
            assert!(chunk.tree.file_count() > 0);
            for path in chunk.tree.file_paths() {
                assert!(path.starts_with("photos/2021/summer/") || path.starts_with("notes_"));
            }
        }
        assert_eq!(all_paths(&chunks), sorted(paths));
    }

    #[test]
    fn oversized_single_file_is_flagged_not_dropped() {
        let long = format!("{}.bin", "x".repeat(200));
        let tree = DirTree::from_paths([long.as_str(), "small.txt"]);
        let chunks = chunk_tree(&tree, 64);
        assert_eq!(all_paths(&chunks), sorted(vec![long.clone(), "small.txt".into()]));
        let flagged: Vec<_> = chunks.iter().filter(|c| c.oversized).collect();
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].tree.files, vec![long]);
    }

    #[test]
    fn pack_files_matches_exact_encoding() {
        let files: Vec<String> = (0..10).map(|i| format!("f{i}")).collect();
        let base = DirTree::default().encoded_size();
        let max = base + 4 * 4 + 3;
        let packs = pack_files(&files, max);
        assert_eq!(packs.len(), 3);
        assert_eq!(packs[0].files.len(), 4);
        for pack in &packs {
            assert!(pack.encoded_size() <= max);
        }
    }

    #[test]
    fn empty_subdirectories_do_not_produce_chunks() {
        let mut tree = DirTree::from_paths((0..20).map(|i| format!("full/file_{i}.txt")));
        tree.dirs.insert("empty".to_string(), DirTree::default());
        let chunks = chunk_tree(&tree, 120);
        assert!(chunks.iter().all(|c| c.tree.file_count() > 0));
    }
}
