//! Narrowing bursts of watch events down to the one path worth syncing.
//!
//! A watcher reports every modified entry plus the directories whose listings
//! changed because of it. Only the entries that changed themselves matter;
//! their longest common ancestor is the smallest root that covers them.

use std::collections::BTreeMap;

use tracing::debug;

use crate::vpath;

/// Smallest path that covers every genuinely modified entry in `paths`.
///
/// Paths are bucketed by depth and visited deepest first. Each visited path
/// counts as modified and knocks its direct parent out of the next bucket up,
/// since that parent was only reported because of it. The survivors are
/// folded with a segment-wise common prefix. An empty input resolves to `/`.
///
/// # Example
///
/// ```rust
/// use vfsync::resolve;
///
/// assert_eq!(resolve(&["/", "/file"]), "/file");
/// assert_eq!(resolve(&["/dir", "/dir/a.txt", "/other"]), "/");
/// ```
#[must_use]
pub fn resolve<P: AsRef<str>>(paths: &[P]) -> String {
    let mut by_depth: BTreeMap<usize, Vec<String>> = BTreeMap::new();
    for path in paths {
        let path = vpath::normalize(path.as_ref());
        by_depth.entry(vpath::depth(&path)).or_default().push(path);
    }

    let mut modified: Vec<String> = Vec::new();
    while let Some((depth, bucket)) = by_depth.pop_last() {
        for path in bucket {
            if depth > 0 {
                let parent = vpath::dirname(&path);
                if let Some(parents) = by_depth.get_mut(&(depth - 1)) {
                    parents.retain(|p| *p != parent);
                }
            }
            modified.push(path);
        }
    }

    let root = modified
        .into_iter()
        .reduce(|acc, path| vpath::common_prefix(&acc, &path))
        .unwrap_or_else(|| vpath::ROOT.to_string());

    debug!(events = paths.len(), %root, "resolved sync root");
    root
}

/// Drop entries that have already been synced.
///
/// For every synced path present in `paths`, all of its occurrences are
/// removed, and so are all occurrences of its direct parent. Order of the
/// remaining entries is preserved.
///
/// # Example
///
/// ```rust
/// use vfsync::filter_synced;
///
/// let remaining = filter_synced(&["/", "/file", "/other"], &["/file"]);
/// assert_eq!(remaining, vec!["/other".to_string()]);
/// ```
#[must_use]
pub fn filter_synced<P: AsRef<str>, S: AsRef<str>>(paths: &[P], synced: &[S]) -> Vec<String> {
    let mut remaining: Vec<String> = paths.iter().map(|p| p.as_ref().to_string()).collect();

    for synced in synced {
        let synced = synced.as_ref();
        if !remaining.iter().any(|p| p == synced) {
            continue;
        }
        let parent = vpath::dirname(synced);
        remaining.retain(|p| p != synced && *p != parent);
    }

    remaining
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn path_strategy() -> impl Strategy<Value = String> {
        prop::collection::vec(prop::sample::select(vec!["a", "b", "c"]), 0..4)
            .prop_map(|segments| format!("/{}", segments.join("/")))
    }

    proptest! {
        /// The resolved root is an ancestor of every input's deepest survivors,
        /// and therefore of every leaf reported.
        #[test]
        fn resolved_root_covers_leaves(paths in prop::collection::vec(path_strategy(), 1..12)) {
            let root = resolve(&paths);
            let deepest = paths.iter().map(|p| vpath::depth(p)).max().unwrap_or(0);
            for path in paths.iter().filter(|p| vpath::depth(p) == deepest) {
                prop_assert!(vpath::is_within(path, &root));
            }
        }

        /// Filtering never invents entries.
        #[test]
        fn filter_is_subsequence(
            paths in prop::collection::vec(path_strategy(), 0..10),
            synced in prop::collection::vec(path_strategy(), 0..4),
        ) {
            let remaining = filter_synced(&paths, &synced);
            let mut source = paths.iter();
            for path in &remaining {
                prop_assert!(source.any(|p| p == path));
            }
        }
    }
}
