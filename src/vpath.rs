//! Helpers for `/`-rooted virtual filesystem paths.
//!
//! Paths are plain strings using `/` as separator, always absolute. `/` is
//! the root and has depth 0.

/// Separator between path segments.
pub const SEPARATOR: char = '/';

/// Root path.
pub const ROOT: &str = "/";

/// Non-empty segments of `path`.
pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split(SEPARATOR).filter(|s| !s.is_empty())
}

/// Number of separators below the root: `/` is 0, `/a` is 1, `/a/b` is 2.
#[must_use]
pub fn depth(path: &str) -> usize {
    segments(path).count()
}

/// True when some segment is `.` or `..`.
///
/// Such paths are never resolved; callers reject them.
#[must_use]
pub fn has_relative_segments(path: &str) -> bool {
    segments(path).any(|s| s == "." || s == "..")
}

/// Canonical form: leading `/`, no trailing or repeated separators.
#[must_use]
pub fn normalize(path: &str) -> String {
    let joined = segments(path).collect::<Vec<_>>().join("/");
    format!("/{joined}")
}

/// Parent directory; the root is its own parent.
#[must_use]
pub fn dirname(path: &str) -> String {
    let normalized = normalize(path);
    match normalized.rfind(SEPARATOR) {
        Some(0) | None => ROOT.to_string(),
        Some(i) => normalized[..i].to_string(),
    }
}

/// Final segment, or `""` for the root.
#[must_use]
pub fn basename(path: &str) -> &str {
    segments(path).last().unwrap_or("")
}

/// Join a child name onto a directory path.
#[must_use]
pub fn join(dir: &str, name: &str) -> String {
    normalize(&format!("{dir}/{name}"))
}

/// True when `path` is `ancestor` or lies below it.
#[must_use]
pub fn is_within(path: &str, ancestor: &str) -> bool {
    let mut path = segments(path);
    segments(ancestor).all(|segment| path.next() == Some(segment))
}

/// Longest common ancestor of two paths, compared segment by segment.
#[must_use]
pub fn common_prefix(a: &str, b: &str) -> String {
    let shared: Vec<&str> = segments(a)
        .zip(segments(b))
        .take_while(|(x, y)| x == y)
        .map(|(x, _)| x)
        .collect();
    format!("/{}", shared.join("/"))
}
