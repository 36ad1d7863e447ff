use std::hash::{Hash, Hasher};
use std::path::{Component, Path, PathBuf};
use fnv::FnvHasher;

pub use fnv::{FnvHashMap, FnvHashSet};

pub fn hash_single<T: Hash + ?Sized>(object: &T) -> u64 {
    let mut hasher: FnvHasher = Default::default();
    object.hash(&mut hasher);
    hasher.finish()
}

/// Converts `path` (somewhere beneath `root`) into a `/`-separated key.
///
/// Returns `None` for the root itself, for paths outside the root and for
/// names that aren't valid UTF-8.
pub fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(name) => parts.push(name.to_str()?),
            _ => return None,
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// The absolute local path for `key`.
pub fn local_path(root: &Path, key: &str) -> PathBuf {
    let mut path = root.to_path_buf();
    for part in key.split('/') {
        path.push(part);
    }
    path
}

pub fn parent_key(key: &str) -> Option<&str> {
    key.rsplit_once('/').map(|(parent, _)| parent)
}

/// Every proper ancestor of `key`, nearest first.
pub fn ancestors(key: &str) -> impl Iterator<Item = &str> {
    let mut current = key;
    std::iter::from_fn(move || {
        let parent = parent_key(current)?;
        current = parent;
        Some(parent)
    })
}

/// Zero for top-level entries.
pub fn depth(key: &str) -> usize {
    key.matches('/').count()
}

pub fn is_descendant(key: &str, directory: &str) -> bool {
    key.len() > directory.len() && key.starts_with(directory) && key[directory.len()..].starts_with('/')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_use_forward_slashes() {
        let root = Path::new("/srv/home");
        assert_eq!(relative_key(root, Path::new("/srv/home/alice/notes.txt")).as_deref(), Some("alice/notes.txt"));
        assert_eq!(relative_key(root, root), None);
        assert_eq!(relative_key(root, Path::new("/elsewhere")), None);
        assert_eq!(local_path(root, "alice/notes.txt"), Path::new("/srv/home/alice/notes.txt"));
    }

    #[test]
    fn ancestors_walk_upwards() {
        let found: Vec<&str> = ancestors("a/b/c.txt").collect();
        assert_eq!(found, vec!["a/b", "a"]);
        assert_eq!(ancestors("top").count(), 0);
        assert_eq!(depth("a/b/c.txt"), 2);
    }

    #[test]
    fn descendants_need_a_separator() {
        assert!(is_descendant("docs/a.txt", "docs"));
        assert!(!is_descendant("docs2/a.txt", "docs"));
        assert!(!is_descendant("docs", "docs"));
    }
}
