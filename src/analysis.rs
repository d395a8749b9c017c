use crate::{
    archive_tool::{list_with_key_fallback, ArchiveTool},
    classifier::{classify, Classification},
    content_tree::{ContentTree, SourceArchive},
    executor::TaskRetryExecutor,
};
use serde::Serialize;
use std::path::Path;
use tracing::{info, warn};

/// Archive that could not be listed, with the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListingFailure {
    pub archive: SourceArchive,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct Analysis {
    pub tree: ContentTree,
    pub classification: Classification,
    pub listing_failures: Vec<ListingFailure>,
}

impl Analysis {
    /// Re-classifies a search-filtered view; the full tree is kept as is.
    pub fn search(&self, query: &str, reference_root: Option<&Path>) -> Classification {
        classify(&self.tree.search(query), reference_root)
    }
}

/// Lists every archive through the executor, merges the listings and
/// classifies the result. Archives that fail to list are left out.
pub fn analyze(
    tool: &dyn ArchiveTool,
    executor: &TaskRetryExecutor,
    archives: &[SourceArchive],
    key: Option<&str>,
    reference_root: Option<&Path>,
) -> Analysis {
    info!(
        "listing {} archive(s) on {} worker(s)",
        archives.len(),
        executor.pool_size()
    );
    let mut outcome = executor.run(archives, |archive| {
        list_with_key_fallback(tool, archive.path(), key)
    });

    // Keep the caller's archive order so leaf source order is stable.
    let mut listings = Vec::new();
    let mut listing_failures = Vec::new();
    for archive in archives {
        if let Some(paths) = outcome.succeeded.remove(archive) {
            listings.push((archive.clone(), paths));
        } else if let Some(failure) = outcome.failed.remove(archive) {
            warn!("listing {archive} failed: {failure}");
            listing_failures.push(ListingFailure {
                archive: archive.clone(),
                reason: failure.to_string(),
            });
        }
    }

    let tree = ContentTree::build(listings);
    let classification = classify(&tree, reference_root);
    info!(
        "{} file(s) across {} archive(s), {} listing failure(s)",
        tree.file_count(),
        archives.len() - listing_failures.len(),
        listing_failures.len()
    );
    Analysis {
        tree,
        classification,
        listing_failures,
    }
}
