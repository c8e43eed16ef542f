use proptest::prelude::*;
use foldwise_core::{chunk_tree, DirTree};

fn relative_paths() -> impl Strategy<Value = Vec<String>> {
    let path = (
        prop::collection::vec("[a-d]{1,6}", 0..4),
        "[a-z0-9_]{1,24}\\.(txt|jpg|pdf)",
    )
        .prop_map(|(dirs, file)| {
            let mut parts = dirs;
            parts.push(file);
            parts.join("/")
        });
    prop::collection::vec(path, 0..60)
}

fn sorted(mut paths: Vec<String>) -> Vec<String> {
    paths.sort();
    paths
}

proptest! {
    #[test]
    fn chunks_cover_every_file_exactly_once(paths in relative_paths(), limit in 1usize..600) {
        let tree = DirTree::from_paths(&paths);
        let chunks = chunk_tree(&tree, limit);
        let covered: Vec<String> = chunks.iter().flat_map(|c| c.tree.file_paths()).collect();
        prop_assert_eq!(sorted(covered), sorted(paths));
    }

    #[test]
    fn chunks_respect_limit_unless_flagged(paths in relative_paths(), limit in 1usize..600) {
        let tree = DirTree::from_paths(&paths);
        for chunk in chunk_tree(&tree, limit) {
            if chunk.oversized {
                prop_assert_eq!(chunk.tree.file_count(), 1);
                prop_assert!(chunk.tree.encoded_size() > limit);
            } else {
                prop_assert!(chunk.tree.file_count() == 0 || chunk.tree.encoded_size() <= limit);
            }
        }
    }
}
