//! Unpack → merge → collect pipeline over user-selected conflict entries.
//!
//! Per-entry failures never abort a run; they are recorded as skips with a
//! reason. A run only aborts when the archive tool is unusable, the staging
//! directory ends up empty, the user cancels the destination prompt, or
//! packing fails.

use crate::{
    analysis::ListingFailure,
    archive_tool::{unpack_with_key_fallback, ArchiveTool},
    classifier::{ConflictCategory, ConflictEntry},
    config::AppConfig,
    content_tree::{join_logical, SourceArchive},
    error::{MergeError, RunAbort},
    executor::TaskRetryExecutor,
    merge_tool::MergeTool,
    prompt::DestinationPrompt,
    session::{dir_has_no_files, SessionDir},
};
use serde::Serialize;
use std::{
    collections::{BTreeSet, HashMap},
    fmt, fs,
    path::{Path, PathBuf},
};
use time::{macros::format_description, OffsetDateTime};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default)]
pub struct ProcessorOptions {
    pub ignore_no_conflict: bool,
    /// Static output file name; a timestamped default is used when unset.
    pub output_name: Option<String>,
    pub aes_key: Option<String>,
    /// Unpack filter. Empty unpacks everything.
    pub allowed_extensions: Vec<String>,
}

impl ProcessorOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            ignore_no_conflict: config.ignore_no_conflict,
            output_name: config.output_pak_name.clone(),
            aes_key: config.aes_key.clone(),
            allowed_extensions: config.allowed_extensions.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum SkipReason {
    /// Selected entry lacks a contained path, sources, or source names.
    InvalidValues,
    NoConflicts,
    TooManySources,
    /// Category does not fit the number of sources on the entry.
    Ineligible,
    UnpackFailed { details: String },
    NoValidFiles { details: String },
    MergeToolNotFound { tool: String },
    /// The tool exited cleanly but no output was saved.
    MergeNoOutput,
    MergeFailed { exit_code: Option<i32>, stderr: String },
}

impl SkipReason {
    pub fn code(&self) -> &'static str {
        match self {
            SkipReason::InvalidValues => "invalid_values",
            SkipReason::NoConflicts => "no_conflicts",
            SkipReason::TooManySources => "too_many_sources",
            SkipReason::Ineligible => "ineligible",
            SkipReason::UnpackFailed { .. } => "unpack_failed",
            SkipReason::NoValidFiles { .. } => "no_valid_files",
            SkipReason::MergeToolNotFound { .. } => "merge_tool_not_found",
            SkipReason::MergeNoOutput => "merge_no_output",
            SkipReason::MergeFailed { .. } => "merge_failed",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::InvalidValues => write!(f, "missing required values"),
            SkipReason::NoConflicts => write!(f, "no conflicts (ignored)"),
            SkipReason::TooManySources => write!(f, "too many sources for a merge"),
            SkipReason::Ineligible => write!(f, "category does not match its sources"),
            SkipReason::UnpackFailed { details } => write!(f, "unpack failed: {details}"),
            SkipReason::NoValidFiles { details } => write!(f, "no valid files: {details}"),
            SkipReason::MergeToolNotFound { tool } => write!(f, "merge tool not found: {tool}"),
            SkipReason::MergeNoOutput => write!(f, "merge produced no output file"),
            SkipReason::MergeFailed { exit_code, stderr } => {
                match exit_code {
                    Some(code) => write!(f, "merge tool exited with {code}")?,
                    None => write!(f, "merge tool failed")?,
                }
                if !stderr.is_empty() {
                    write!(f, ": {stderr}")?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProcessingOutcome {
    Processed { name: String },
    Skipped { name: String, reason: SkipReason },
}

impl ProcessingOutcome {
    pub fn name(&self) -> &str {
        match self {
            ProcessingOutcome::Processed { name } | ProcessingOutcome::Skipped { name, .. } => name,
        }
    }

    pub fn is_processed(&self) -> bool {
        matches!(self, ProcessingOutcome::Processed { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub output: PathBuf,
    pub outcomes: Vec<ProcessingOutcome>,
    /// Archives left out of the analysis because they could not be listed.
    pub listing_failures: Vec<ListingFailure>,
}

impl RunReport {
    pub fn with_listing_failures(mut self, failures: Vec<ListingFailure>) -> Self {
        self.listing_failures = failures;
        self
    }

    pub fn processed(&self) -> impl Iterator<Item = &str> {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.is_processed())
            .map(|outcome| outcome.name())
    }

    pub fn skipped(&self) -> impl Iterator<Item = (&str, &SkipReason)> {
        self.outcomes.iter().filter_map(|outcome| match outcome {
            ProcessingOutcome::Skipped { name, reason } => Some((name.as_str(), reason)),
            ProcessingOutcome::Processed { .. } => None,
        })
    }

    pub fn processed_count(&self) -> usize {
        self.processed().count()
    }

    pub fn skipped_count(&self) -> usize {
        self.skipped().count()
    }
}

/// What a category asks of the pipeline: `Ok(seed)` means merge, seeding
/// with the reference copy when `seed` is true.
pub fn dispatch(category: ConflictCategory, ignore_no_conflict: bool) -> Result<bool, SkipReason> {
    match category {
        ConflictCategory::NoConflict if ignore_no_conflict => Err(SkipReason::NoConflicts),
        ConflictCategory::NoConflict => Ok(true),
        ConflictCategory::DualMatch => Ok(true),
        ConflictCategory::DualNoMatch => Ok(false),
        ConflictCategory::Triple => Ok(false),
        ConflictCategory::Complex => Err(SkipReason::TooManySources),
    }
}

pub fn default_output_name(configured: Option<&str>, now: OffsetDateTime) -> String {
    if let Some(name) = configured.map(str::trim).filter(|name| !name.is_empty()) {
        if name.to_ascii_lowercase().ends_with(".pak") {
            return name.to_string();
        }
        return format!("{name}.pak");
    }
    let stamp = now
        .format(format_description!(
            "[year][month][day]_[hour][minute][second]"
        ))
        .unwrap_or_else(|_| now.unix_timestamp().to_string());
    format!("MergedMods_{stamp}_P.pak")
}

pub struct ConflictProcessor<'a> {
    archive_tool: &'a dyn ArchiveTool,
    merge_tool: &'a dyn MergeTool,
    executor: &'a TaskRetryExecutor,
    session: &'a SessionDir,
    reference_root: Option<&'a Path>,
    options: ProcessorOptions,
    unpack_extensions: Vec<String>,
    unpacked: HashMap<SourceArchive, PathBuf>,
    unpack_failures: HashMap<SourceArchive, String>,
}

impl<'a> ConflictProcessor<'a> {
    pub fn new(
        archive_tool: &'a dyn ArchiveTool,
        merge_tool: &'a dyn MergeTool,
        executor: &'a TaskRetryExecutor,
        session: &'a SessionDir,
        reference_root: Option<&'a Path>,
        options: ProcessorOptions,
    ) -> Self {
        let unpack_extensions = options.allowed_extensions.clone();
        Self {
            archive_tool,
            merge_tool,
            executor,
            session,
            reference_root,
            options,
            unpack_extensions,
            unpacked: HashMap::new(),
            unpack_failures: HashMap::new(),
        }
    }

    /// Processes every entry, then packs the staging directory into the
    /// destination the prompt returns.
    pub fn run(
        &mut self,
        entries: &[ConflictEntry],
        prompt: &mut dyn DestinationPrompt,
    ) -> Result<RunReport, RunAbort> {
        self.archive_tool
            .validate()
            .map_err(|err| RunAbort::ToolUnavailable(err.to_string()))?;

        let outcomes = self.process_entries(entries);
        self.finish(outcomes, prompt)
    }

    /// Runs the per-entry pipeline. Every entry yields exactly one outcome,
    /// in input order.
    pub fn process_entries(&mut self, entries: &[ConflictEntry]) -> Vec<ProcessingOutcome> {
        self.unpack_extensions = unpack_extensions(&self.options.allowed_extensions, entries);
        info!("processing {} selected entr(ies)", entries.len());

        entries
            .iter()
            .map(|entry| {
                let name = entry.display_name();
                match self.process_entry(entry) {
                    Ok(()) => {
                        info!("merged {name}");
                        ProcessingOutcome::Processed { name }
                    }
                    Err(reason) => {
                        info!("skipped {name}: {reason}");
                        ProcessingOutcome::Skipped { name, reason }
                    }
                }
            })
            .collect()
    }

    fn process_entry(&mut self, entry: &ConflictEntry) -> Result<(), SkipReason> {
        if !entry.has_required_values() {
            return Err(SkipReason::InvalidValues);
        }
        let seed = dispatch(entry.category, self.options.ignore_no_conflict)?;
        if !entry.category.fits_source_count(entry.source_paths.len()) {
            return Err(SkipReason::Ineligible);
        }

        let sources = entry.sources();
        self.unpack_sources(&sources);
        let mut inputs = self.collect_inputs(entry, &sources)?;

        if seed {
            match self.reference_copy(&entry.logical_path) {
                Some(reference) => inputs.insert(0, reference),
                None => debug!("no vanilla copy of {}, merging without it", entry.logical_path),
            }
        }

        self.merge(entry, &inputs)
    }

    /// Unpacks the archives this session has not seen yet. Sources already
    /// unpacked, or already failed, are not retried.
    fn unpack_sources(&mut self, sources: &[SourceArchive]) {
        let pending: Vec<SourceArchive> = sources
            .iter()
            .filter(|source| {
                !self.unpacked.contains_key(*source) && !self.unpack_failures.contains_key(*source)
            })
            .cloned()
            .collect();
        if pending.is_empty() {
            return;
        }

        let tool = self.archive_tool;
        let session = self.session;
        let key = self.options.aes_key.as_deref();
        let extensions = &self.unpack_extensions;
        let outcome = self.executor.run_attempts(&pending, |archive, attempt| {
            unpack_with_key_fallback(
                tool,
                archive.path(),
                &session.unpack_attempt_dir(archive, attempt),
                key,
                extensions,
            )
        });

        for (archive, dir) in outcome.succeeded {
            debug!("unpacked {archive} into {}", dir.display());
            self.unpacked.insert(archive, dir);
        }
        for (archive, failure) in outcome.failed {
            warn!("unpacking {archive} failed: {failure}");
            self.unpack_failures.insert(archive, failure.to_string());
        }
    }

    /// The unpacked copy of the entry's file from each source, in source
    /// order. Sources whose copy is missing are left out.
    fn collect_inputs(
        &self,
        entry: &ConflictEntry,
        sources: &[SourceArchive],
    ) -> Result<Vec<PathBuf>, SkipReason> {
        let mut inputs = Vec::new();
        let mut problems = Vec::new();
        let mut unpack_failed = 0usize;

        for source in sources {
            if let Some(reason) = self.unpack_failures.get(source) {
                unpack_failed += 1;
                problems.push(format!("{source}: {reason}"));
                continue;
            }
            let Some(dir) = self.unpacked.get(source) else {
                problems.push(format!("{source}: not unpacked"));
                continue;
            };
            let file = join_logical(dir, &entry.logical_path);
            if file.is_file() {
                inputs.push(file);
            } else {
                warn!(
                    "{} missing from unpacked {source}, leaving it out",
                    entry.logical_path
                );
                problems.push(format!("{source}: file not found after unpack"));
            }
        }

        if !inputs.is_empty() {
            return Ok(inputs);
        }
        let details = problems.join("; ");
        if unpack_failed == sources.len() {
            Err(SkipReason::UnpackFailed { details })
        } else {
            Err(SkipReason::NoValidFiles { details })
        }
    }

    fn reference_copy(&self, logical_path: &str) -> Option<PathBuf> {
        let root = self.reference_root?;
        let path = join_logical(root, logical_path);
        path.is_file().then_some(path)
    }

    /// Blocks for as long as the user keeps the merge tool open. Success
    /// needs both a zero exit code and the output file on disk.
    fn merge(&self, entry: &ConflictEntry, inputs: &[PathBuf]) -> Result<(), SkipReason> {
        let output = join_logical(&self.session.staging_dir(), &entry.logical_path);
        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent).map_err(|err| SkipReason::MergeFailed {
                exit_code: None,
                stderr: format!("create staging dir: {err}"),
            })?;
        }

        let run = match self.merge_tool.merge(inputs, &output) {
            Ok(run) => run,
            Err(MergeError::ToolNotFound(tool)) => {
                return Err(SkipReason::MergeToolNotFound { tool });
            }
            Err(err) => {
                return Err(SkipReason::MergeFailed {
                    exit_code: None,
                    stderr: err.to_string(),
                });
            }
        };

        if !run.succeeded() {
            if output.exists() {
                debug!("removing output of failed merge {}", output.display());
                let _ = fs::remove_file(&output);
            }
            return Err(SkipReason::MergeFailed {
                exit_code: Some(run.exit_code),
                stderr: run.stderr,
            });
        }
        if !output.is_file() {
            warn!("{} closed without saving {}", self.merge_tool.name(), output.display());
            return Err(SkipReason::MergeNoOutput);
        }
        Ok(())
    }

    fn finish(
        &self,
        outcomes: Vec<ProcessingOutcome>,
        prompt: &mut dyn DestinationPrompt,
    ) -> Result<RunReport, RunAbort> {
        let staging = self.session.staging_dir();
        if dir_has_no_files(&staging) {
            return Err(RunAbort::StagingEmpty);
        }

        let name = default_output_name(self.options.output_name.as_deref(), OffsetDateTime::now_utc());
        let Some(dest_dir) = prompt.choose_destination(&name) else {
            info!("destination prompt cancelled");
            return Err(RunAbort::Cancelled);
        };
        fs::create_dir_all(&dest_dir)?;

        let dest = dest_dir.join(&name);
        info!("packing {} into {}", staging.display(), dest.display());
        let output = self
            .archive_tool
            .pack(&staging, &dest)
            .map_err(|err| RunAbort::PackFailed(err.to_string()))?;
        Ok(RunReport {
            output,
            outcomes,
            listing_failures: Vec::new(),
        })
    }
}

/// The configured filter widened by the extensions of the selected files,
/// so a filter never hides a file the user asked to merge.
fn unpack_extensions(configured: &[String], entries: &[ConflictEntry]) -> Vec<String> {
    if configured.is_empty() {
        return Vec::new();
    }
    let mut extensions: BTreeSet<String> = configured.iter().cloned().collect();
    for entry in entries {
        if let Some(ext) = Path::new(&entry.logical_path)
            .extension()
            .and_then(|ext| ext.to_str())
        {
            extensions.insert(ext.to_ascii_lowercase());
        }
    }
    extensions.into_iter().collect()
}
