use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
};
use tracing::warn;

/// One input archive, identified by its absolute path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceArchive(PathBuf);

impl SourceArchive {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }

    pub fn name(&self) -> String {
        self.0
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.0.display().to_string())
    }
}

impl fmt::Display for SourceArchive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    Dir(BTreeMap<String, Node>),
    /// Archives providing this file, in the order they were added. Never empty.
    File(Vec<SourceArchive>),
}

/// Union of per-archive listings keyed by path segment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentTree {
    root: BTreeMap<String, Node>,
}

/// A file in the tree with its logical path rebuilt from the segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Leaf<'a> {
    pub path: String,
    pub sources: &'a [SourceArchive],
}

impl ContentTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the tree from `(archive, listing)` pairs, appending archives to
    /// each leaf in iteration order.
    pub fn build<L, P>(listings: L) -> Self
    where
        L: IntoIterator<Item = (SourceArchive, Vec<P>)>,
        P: AsRef<str>,
    {
        let mut tree = Self::new();
        for (archive, paths) in listings {
            for path in paths {
                tree.insert(&archive, path.as_ref());
            }
        }
        tree
    }

    /// Records that `archive` provides a file at `path`. Returns false when
    /// the path is empty, climbs out of its root, or collides with an
    /// existing file/directory.
    pub fn insert(&mut self, archive: &SourceArchive, path: &str) -> bool {
        if !is_contained(path) {
            warn!("{path} in {archive}: path leaves the archive root, skipped");
            return false;
        }
        let segments = split_segments(path);
        let Some((file_name, dirs)) = segments.split_last() else {
            return false;
        };

        let mut level = &mut self.root;
        for segment in dirs {
            let node = level
                .entry((*segment).to_string())
                .or_insert_with(|| Node::Dir(BTreeMap::new()));
            level = match node {
                Node::Dir(children) => children,
                Node::File(_) => {
                    warn!("{path} in {archive}: {segment} is already a file, skipped");
                    return false;
                }
            };
        }

        match level
            .entry((*file_name).to_string())
            .or_insert_with(|| Node::File(Vec::new()))
        {
            Node::File(sources) => {
                if !sources.contains(archive) {
                    sources.push(archive.clone());
                }
                true
            }
            Node::Dir(_) => {
                warn!("{path} in {archive}: already a directory, skipped");
                false
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Sources recorded for a logical path.
    pub fn get(&self, path: &str) -> Option<&[SourceArchive]> {
        let segments = split_segments(path);
        let (file_name, dirs) = segments.split_last()?;
        let mut level = &self.root;
        for segment in dirs {
            match level.get(*segment)? {
                Node::Dir(children) => level = children,
                Node::File(_) => return None,
            }
        }
        match level.get(*file_name)? {
            Node::File(sources) => Some(sources),
            Node::Dir(_) => None,
        }
    }

    /// Every file, depth first, in path order.
    pub fn leaves(&self) -> Vec<Leaf<'_>> {
        let mut out = Vec::new();
        let mut stack = Vec::new();
        collect_leaves(&self.root, &mut stack, &mut out);
        out
    }

    pub fn file_count(&self) -> usize {
        self.leaves().len()
    }

    /// New tree with only the files whose logical path matches. Empty
    /// directories are pruned.
    pub fn filter<F>(&self, predicate: F) -> ContentTree
    where
        F: Fn(&str) -> bool,
    {
        let mut stack = Vec::new();
        ContentTree {
            root: filter_level(&self.root, &mut stack, &predicate),
        }
    }

    /// Case-insensitive substring search on the logical path.
    pub fn search(&self, query: &str) -> ContentTree {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return self.clone();
        }
        self.filter(|path| path.to_lowercase().contains(&needle))
    }
}

pub fn split_segments(path: &str) -> Vec<&str> {
    path.split(['/', '\\'])
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect()
}

/// Whether `path` names a file strictly below whatever root it is joined
/// to: at least one segment, no `..`, no drive or stream prefix.
pub fn is_contained(path: &str) -> bool {
    let segments = split_segments(path);
    !segments.is_empty() && segments.iter().all(|segment| is_plain_segment(segment))
}

fn is_plain_segment(segment: &str) -> bool {
    segment != ".." && !segment.contains(':')
}

/// `root` with the logical path's segments appended. Segments that would
/// step out of `root` are dropped.
pub fn join_logical(root: &Path, logical_path: &str) -> PathBuf {
    let mut path = root.to_path_buf();
    for segment in split_segments(logical_path) {
        if is_plain_segment(segment) {
            path.push(segment);
        }
    }
    path
}

/// Canonical `/`-joined form of a logical path.
pub fn normalize_logical_path(path: &str) -> String {
    split_segments(path).join("/")
}

fn collect_leaves<'a>(
    level: &'a BTreeMap<String, Node>,
    stack: &mut Vec<&'a str>,
    out: &mut Vec<Leaf<'a>>,
) {
    for (name, node) in level {
        stack.push(name);
        match node {
            Node::Dir(children) => collect_leaves(children, stack, out),
            Node::File(sources) => out.push(Leaf {
                path: stack.join("/"),
                sources,
            }),
        }
        stack.pop();
    }
}

fn filter_level<'a, F>(
    level: &'a BTreeMap<String, Node>,
    stack: &mut Vec<&'a str>,
    predicate: &F,
) -> BTreeMap<String, Node>
where
    F: Fn(&str) -> bool,
{
    let mut kept = BTreeMap::new();
    for (name, node) in level {
        stack.push(name);
        match node {
            Node::Dir(children) => {
                let children = filter_level(children, stack, predicate);
                if !children.is_empty() {
                    kept.insert(name.clone(), Node::Dir(children));
                }
            }
            Node::File(sources) => {
                if predicate(&stack.join("/")) {
                    kept.insert(name.clone(), Node::File(sources.clone()));
                }
            }
        }
        stack.pop();
    }
    kept
}
