//! In-memory collaborators for unit tests.

use crate::{
    archive_tool::ArchiveTool,
    error::{ArchiveError, MergeError},
    merge_tool::{MergeRun, MergeTool},
    prompt::DestinationPrompt,
};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
    thread,
    time::Duration,
};
use walkdir::WalkDir;

#[derive(Debug, Clone, Default)]
struct FakeArchive {
    files: Vec<(String, String)>,
    key: Option<String>,
    unpack_error: Option<String>,
    unpack_delay: Option<Duration>,
    list_error: Option<String>,
}

#[derive(Debug, Default)]
pub struct FakeArchiveTool {
    archives: HashMap<PathBuf, FakeArchive>,
    missing: bool,
    pack_error: Option<String>,
    unpack_calls: Mutex<Vec<PathBuf>>,
    unpack_dests: Mutex<Vec<PathBuf>>,
    packed: Mutex<Vec<(PathBuf, Vec<String>)>>,
}

impl FakeArchiveTool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_archive(mut self, path: impl Into<PathBuf>, files: &[(&str, &str)]) -> Self {
        let files = files
            .iter()
            .map(|(name, body)| (name.to_string(), body.to_string()))
            .collect();
        self.archives.insert(
            path.into(),
            FakeArchive {
                files,
                ..FakeArchive::default()
            },
        );
        self
    }

    pub fn encrypted(mut self, path: impl Into<PathBuf>, key: &str) -> Self {
        self.archive_mut(path).key = Some(key.to_string());
        self
    }

    pub fn failing_unpack(mut self, path: impl Into<PathBuf>, stderr: &str) -> Self {
        self.archive_mut(path).unpack_error = Some(stderr.to_string());
        self
    }

    pub fn failing_list(mut self, path: impl Into<PathBuf>, stderr: &str) -> Self {
        self.archive_mut(path).list_error = Some(stderr.to_string());
        self
    }

    pub fn slow_unpack(mut self, path: impl Into<PathBuf>, delay: Duration) -> Self {
        self.archive_mut(path).unpack_delay = Some(delay);
        self
    }

    pub fn missing(mut self) -> Self {
        self.missing = true;
        self
    }

    pub fn failing_pack(mut self, stderr: &str) -> Self {
        self.pack_error = Some(stderr.to_string());
        self
    }

    pub fn unpack_calls(&self) -> Vec<PathBuf> {
        self.unpack_calls.lock().unwrap().clone()
    }

    /// Destination directory of every unpack call, in call order.
    pub fn unpack_dests(&self) -> Vec<PathBuf> {
        self.unpack_dests.lock().unwrap().clone()
    }

    /// Destination and relative file list of every successful pack.
    pub fn packed(&self) -> Vec<(PathBuf, Vec<String>)> {
        self.packed.lock().unwrap().clone()
    }

    fn archive_mut(&mut self, path: impl Into<PathBuf>) -> &mut FakeArchive {
        self.archives.entry(path.into()).or_default()
    }

    fn archive(&self, path: &Path, key: Option<&str>) -> Result<&FakeArchive, ArchiveError> {
        let archive = self.archives.get(path).ok_or_else(|| ArchiveError::Failed {
            stderr: format!("no such archive: {}", path.display()),
        })?;
        if archive.key.is_some() && archive.key.as_deref() != key {
            return Err(ArchiveError::EncryptionKeyRequired(path.to_path_buf()));
        }
        Ok(archive)
    }
}

impl ArchiveTool for FakeArchiveTool {
    fn validate(&self) -> Result<(), ArchiveError> {
        if self.missing {
            return Err(ArchiveError::ToolNotFound(PathBuf::from("repak")));
        }
        Ok(())
    }

    fn list(&self, archive: &Path, key: Option<&str>) -> Result<Vec<String>, ArchiveError> {
        let entry = self.archive(archive, key)?;
        if let Some(stderr) = &entry.list_error {
            return Err(ArchiveError::Failed {
                stderr: stderr.clone(),
            });
        }
        Ok(entry.files.iter().map(|(name, _)| name.clone()).collect())
    }

    fn unpack(
        &self,
        archive: &Path,
        dest: &Path,
        key: Option<&str>,
        allowed_extensions: &[String],
    ) -> Result<PathBuf, ArchiveError> {
        self.unpack_calls.lock().unwrap().push(archive.to_path_buf());
        self.unpack_dests.lock().unwrap().push(dest.to_path_buf());
        let entry = self.archive(archive, key)?;
        if let Some(delay) = entry.unpack_delay {
            thread::sleep(delay);
        }
        if let Some(stderr) = &entry.unpack_error {
            return Err(ArchiveError::Failed {
                stderr: stderr.clone(),
            });
        }
        for (name, body) in &entry.files {
            let allowed = allowed_extensions.is_empty()
                || allowed_extensions
                    .iter()
                    .any(|ext| name.to_ascii_lowercase().ends_with(&format!(".{ext}")));
            if !allowed {
                continue;
            }
            let target = dest.join(name);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(target, body)?;
        }
        Ok(dest.to_path_buf())
    }

    fn pack(&self, source_dir: &Path, dest: &Path) -> Result<PathBuf, ArchiveError> {
        if let Some(stderr) = &self.pack_error {
            return Err(ArchiveError::Failed {
                stderr: stderr.clone(),
            });
        }
        let mut files: Vec<String> = WalkDir::new(source_dir)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| {
                entry
                    .path()
                    .strip_prefix(source_dir)
                    .ok()
                    .map(|rel| rel.to_string_lossy().replace('\\', "/"))
            })
            .collect();
        files.sort();
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(dest, files.join("\n"))?;
        self.packed
            .lock()
            .unwrap()
            .push((dest.to_path_buf(), files));
        Ok(dest.to_path_buf())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeBehavior {
    /// Writes the inputs joined by newlines to the output, exits 0.
    Concatenate,
    /// Exits 0 without writing the output.
    CloseWithoutSaving,
    /// Exits non-zero with stderr.
    Fail { exit_code: i32, stderr: String },
    /// Writes the output but exits non-zero.
    FailWithOutput { exit_code: i32 },
    Missing,
}

/// One recorded invocation: input paths and their contents at call time.
#[derive(Debug, Clone)]
pub struct MergeCall {
    pub inputs: Vec<PathBuf>,
    pub contents: Vec<String>,
    pub output: PathBuf,
}

#[derive(Debug)]
pub struct FakeMergeTool {
    behavior: MergeBehavior,
    calls: Mutex<Vec<MergeCall>>,
}

impl FakeMergeTool {
    pub fn new(behavior: MergeBehavior) -> Self {
        Self {
            behavior,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<MergeCall> {
        self.calls.lock().unwrap().clone()
    }
}

impl MergeTool for FakeMergeTool {
    fn name(&self) -> &str {
        "fake"
    }

    fn merge(&self, inputs: &[PathBuf], output: &Path) -> Result<MergeRun, MergeError> {
        if self.behavior == MergeBehavior::Missing {
            return Err(MergeError::ToolNotFound("fake-merge".to_string()));
        }
        if inputs.is_empty() || inputs.len() > 3 {
            return Err(MergeError::InputCount(inputs.len()));
        }
        let contents: Vec<String> = inputs
            .iter()
            .map(|path| fs::read_to_string(path).unwrap_or_default())
            .collect();
        self.calls.lock().unwrap().push(MergeCall {
            inputs: inputs.to_vec(),
            contents: contents.clone(),
            output: output.to_path_buf(),
        });

        let ok = MergeRun {
            exit_code: 0,
            stderr: String::new(),
        };
        match &self.behavior {
            MergeBehavior::Concatenate => {
                fs::write(output, contents.join("\n"))?;
                Ok(ok)
            }
            MergeBehavior::CloseWithoutSaving => Ok(ok),
            MergeBehavior::Fail { exit_code, stderr } => Ok(MergeRun {
                exit_code: *exit_code,
                stderr: stderr.clone(),
            }),
            MergeBehavior::FailWithOutput { exit_code } => {
                fs::write(output, contents.join("\n"))?;
                Ok(MergeRun {
                    exit_code: *exit_code,
                    stderr: String::new(),
                })
            }
            MergeBehavior::Missing => unreachable!(),
        }
    }
}

/// Answers every prompt with the same value.
#[derive(Debug, Default)]
pub struct FakePrompt {
    answer: Option<PathBuf>,
    pub asked: usize,
}

impl FakePrompt {
    pub fn answering(path: impl Into<PathBuf>) -> Self {
        Self {
            answer: Some(path.into()),
            asked: 0,
        }
    }

    pub fn cancelling() -> Self {
        Self::default()
    }
}

impl DestinationPrompt for FakePrompt {
    fn choose_destination(&mut self, _suggested_name: &str) -> Option<PathBuf> {
        self.asked += 1;
        self.answer.clone()
    }
}
