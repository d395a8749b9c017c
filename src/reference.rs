use crate::{
    archive_tool::{unpack_with_key_fallback, ArchiveTool},
    content_tree::SourceArchive,
    executor::{TaskOutcome, TaskRetryExecutor},
};
use anyhow::{Context, Result};
use std::{fs, path::Path, path::PathBuf};
use tracing::{info, warn};

/// Unpacks the vanilla archives straight into `reference_root`, so the
/// reference tree mirrors the logical paths the mods override.
pub fn extract_reference(
    tool: &dyn ArchiveTool,
    executor: &TaskRetryExecutor,
    vanilla_archives: &[SourceArchive],
    reference_root: &Path,
    key: Option<&str>,
    allowed_extensions: &[String],
) -> Result<TaskOutcome<SourceArchive, PathBuf>> {
    tool.validate().context("archive tool unavailable")?;
    fs::create_dir_all(reference_root).context("create vanilla root")?;

    info!(
        "extracting {} vanilla archive(s) into {}",
        vanilla_archives.len(),
        reference_root.display()
    );
    let outcome = executor.run(vanilla_archives, |archive| {
        unpack_with_key_fallback(tool, archive.path(), reference_root, key, allowed_extensions)
    });
    for (archive, failure) in &outcome.failed {
        warn!("vanilla extraction of {archive} failed: {failure}");
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{classifier::has_reference, testing::FakeArchiveTool};
    use std::time::Duration;

    #[test]
    fn extracted_files_become_reference_matches() {
        let root = tempfile::tempdir().unwrap();
        let tool = FakeArchiveTool::new()
            .with_archive("/game/pakchunk0.pak", &[("foo/bar.cfg", "v"), ("foo/tex.uasset", "t")])
            .failing_unpack("/game/pakchunk1.pak", "Error: truncated");
        let executor = TaskRetryExecutor::new(2, 10, Duration::from_secs(5), 0);
        let archives = vec![
            SourceArchive::new("/game/pakchunk0.pak"),
            SourceArchive::new("/game/pakchunk1.pak"),
        ];

        let outcome = extract_reference(
            &tool,
            &executor,
            &archives,
            root.path(),
            None,
            &["cfg".to_string()],
        )
        .unwrap();

        assert_eq!(outcome.succeeded.len(), 1);
        assert_eq!(outcome.failed.len(), 1);
        assert!(has_reference(Some(root.path()), "foo/bar.cfg"));
        assert!(!has_reference(Some(root.path()), "foo/tex.uasset"));
    }

    #[test]
    fn missing_tool_fails_before_any_work() {
        let root = tempfile::tempdir().unwrap();
        let tool = FakeArchiveTool::new().missing();
        let executor = TaskRetryExecutor::new(1, 10, Duration::from_secs(5), 0);
        let result = extract_reference(&tool, &executor, &[], root.path(), None, &[]);
        assert!(result.is_err());
        assert!(tool.unpack_calls().is_empty());
    }
}
