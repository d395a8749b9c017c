use crate::content_tree::{is_contained, join_logical, ContentTree, SourceArchive};
use serde::Serialize;
use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictCategory {
    /// Exactly one archive provides the file.
    NoConflict,
    /// Two archives, and a reference copy exists.
    DualMatch,
    /// Two archives, no reference copy.
    DualNoMatch,
    Triple,
    /// Four or more archives; beyond what a three-way merge can take.
    Complex,
}

impl ConflictCategory {
    pub const ALL: [ConflictCategory; 5] = [
        ConflictCategory::NoConflict,
        ConflictCategory::DualMatch,
        ConflictCategory::DualNoMatch,
        ConflictCategory::Triple,
        ConflictCategory::Complex,
    ];

    /// `None` for zero sources, which a built tree never contains.
    pub fn from_sources(source_count: usize, has_reference: bool) -> Option<Self> {
        match source_count {
            0 => None,
            1 => Some(ConflictCategory::NoConflict),
            2 if has_reference => Some(ConflictCategory::DualMatch),
            2 => Some(ConflictCategory::DualNoMatch),
            3 => Some(ConflictCategory::Triple),
            _ => Some(ConflictCategory::Complex),
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            ConflictCategory::NoConflict => "no_conflict",
            ConflictCategory::DualMatch => "dual_match",
            ConflictCategory::DualNoMatch => "dual_no_match",
            ConflictCategory::Triple => "triple",
            ConflictCategory::Complex => "complex",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ConflictCategory::NoConflict => "No conflict",
            ConflictCategory::DualMatch => "Two sources, vanilla match",
            ConflictCategory::DualNoMatch => "Two sources, no vanilla",
            ConflictCategory::Triple => "Three sources",
            ConflictCategory::Complex => "Four or more sources (unsupported)",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|category| category.tag().eq_ignore_ascii_case(value.trim()))
    }

    /// Whether `source_count` is what this category was assigned for.
    pub fn fits_source_count(self, source_count: usize) -> bool {
        match self {
            ConflictCategory::NoConflict => source_count == 1,
            ConflictCategory::DualMatch | ConflictCategory::DualNoMatch => source_count == 2,
            ConflictCategory::Triple => source_count == 3,
            ConflictCategory::Complex => source_count > 3,
        }
    }
}

impl fmt::Display for ConflictCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Unit of user selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictEntry {
    pub logical_path: String,
    pub category: ConflictCategory,
    /// Display names, parallel to `source_paths`.
    pub source_names: Vec<String>,
    pub source_paths: Vec<PathBuf>,
}

impl ConflictEntry {
    pub fn new(
        logical_path: impl Into<String>,
        category: ConflictCategory,
        sources: &[SourceArchive],
    ) -> Self {
        let mut sources = sources.to_vec();
        sources.sort_by(|a, b| {
            a.name()
                .to_lowercase()
                .cmp(&b.name().to_lowercase())
                .then_with(|| a.cmp(b))
        });
        Self {
            logical_path: logical_path.into(),
            category,
            source_names: sources.iter().map(|source| source.name()).collect(),
            source_paths: sources.iter().map(|source| source.path().to_path_buf()).collect(),
        }
    }

    pub fn display_name(&self) -> String {
        if self.logical_path.is_empty() {
            return "<unnamed entry>".to_string();
        }
        self.logical_path.clone()
    }

    pub fn sources(&self) -> Vec<SourceArchive> {
        self.source_paths.iter().cloned().map(SourceArchive::new).collect()
    }

    pub fn has_required_values(&self) -> bool {
        is_contained(&self.logical_path)
            && !self.source_paths.is_empty()
            && self.source_names.len() == self.source_paths.len()
            && self.source_names.iter().all(|name| !name.trim().is_empty())
            && self.source_paths.iter().all(|path| !path.as_os_str().is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CategoryCounts(BTreeMap<ConflictCategory, usize>);

impl CategoryCounts {
    pub fn get(&self, category: ConflictCategory) -> usize {
        self.0.get(&category).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.0.values().sum()
    }

    fn bump(&mut self, category: ConflictCategory) {
        *self.0.entry(category).or_insert(0) += 1;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub entries: Vec<ConflictEntry>,
    pub counts: CategoryCounts,
}

impl Classification {
    pub fn find(&self, logical_path: &str) -> Option<&ConflictEntry> {
        self.entries
            .iter()
            .find(|entry| entry.logical_path == logical_path)
    }

    pub fn of_category(&self, category: ConflictCategory) -> impl Iterator<Item = &ConflictEntry> {
        self.entries
            .iter()
            .filter(move |entry| entry.category == category)
    }
}

/// Mirrored location of a logical path under the reference root.
pub fn reference_path(reference_root: &Path, logical_path: &str) -> PathBuf {
    join_logical(reference_root, logical_path)
}

/// Whether a regular reference file exists for `logical_path`. Checked on
/// the live filesystem every time.
pub fn has_reference(reference_root: Option<&Path>, logical_path: &str) -> bool {
    reference_root
        .map(|root| reference_path(root, logical_path).is_file())
        .unwrap_or(false)
}

/// Assigns a category to every file in `tree`.
///
/// Reference matching is existence only: a reference file whose content
/// differs from every source still counts as a match.
pub fn classify(tree: &ContentTree, reference_root: Option<&Path>) -> Classification {
    let mut classification = Classification::default();
    for leaf in tree.leaves() {
        let source_count = leaf.sources.len();
        let reference = source_count == 2 && has_reference(reference_root, &leaf.path);
        let Some(category) = ConflictCategory::from_sources(source_count, reference) else {
            warn!("{} has no contributing archive, skipped", leaf.path);
            continue;
        };
        classification.counts.bump(category);
        classification
            .entries
            .push(ConflictEntry::new(leaf.path, category, leaf.sources));
    }
    classification
}
