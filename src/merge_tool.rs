//! External diff/merge tool launch.
//!
//! Supports KDiff3, WinMerge and Meld. Inputs arrive ordered with the
//! reference copy (when present) first; each adapter maps that order onto
//! its own pane layout.

use crate::{
    command::{create_command, resolve_executable, stderr_text},
    error::MergeError,
};
use serde::{Deserialize, Serialize};
use std::{
    ffi::OsString,
    io,
    path::{Path, PathBuf},
    process::Stdio,
};
use tracing::{debug, info};

/// Exit status of one interactive merge session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeRun {
    /// `-1` when the process was terminated by a signal.
    pub exit_code: i32,
    pub stderr: String,
}

impl MergeRun {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// The capability the pipeline needs from a merge tool: ordered inputs in,
/// one output path, a blocking call that ends when the user closes the tool.
pub trait MergeTool: Send + Sync {
    fn name(&self) -> &str;

    fn merge(&self, inputs: &[PathBuf], output: &Path) -> Result<MergeRun, MergeError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeToolKind {
    #[default]
    #[serde(rename = "kdiff3")]
    KDiff3,
    #[serde(rename = "winmerge")]
    WinMerge,
    Meld,
}

impl MergeToolKind {
    pub fn display_name(self) -> &'static str {
        match self {
            MergeToolKind::KDiff3 => "KDiff3",
            MergeToolKind::WinMerge => "WinMerge",
            MergeToolKind::Meld => "Meld",
        }
    }

    pub fn default_command(self) -> &'static str {
        match self {
            MergeToolKind::KDiff3 => "kdiff3",
            MergeToolKind::WinMerge => "WinMergeU",
            MergeToolKind::Meld => "meld",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "kdiff3" => Some(MergeToolKind::KDiff3),
            "winmerge" | "winmergeu" => Some(MergeToolKind::WinMerge),
            "meld" => Some(MergeToolKind::Meld),
            _ => None,
        }
    }

    /// Command line arguments for the given inputs.
    pub fn build_args(
        self,
        inputs: &[PathBuf],
        output: &Path,
    ) -> Result<Vec<OsString>, MergeError> {
        if inputs.is_empty() || inputs.len() > 3 {
            return Err(MergeError::InputCount(inputs.len()));
        }
        let mut args: Vec<OsString> = Vec::new();
        match self {
            MergeToolKind::KDiff3 => {
                match inputs {
                    [single] => args.extend([os(single), os(single)]),
                    [base, a, b] => {
                        args.extend(labels(&["--L1", "--L2", "--L3"], ["Base", "Mod A", "Mod B"]));
                        args.extend([os(base), os(a), os(b)]);
                    }
                    _ => args.extend(inputs.iter().map(|path| os(path))),
                }
                args.push(OsString::from("-o"));
                args.push(os(output));
            }
            MergeToolKind::WinMerge => {
                args.extend([OsString::from("/u"), OsString::from("/e")]);
                match inputs {
                    [single] => args.extend([os(single), os(single)]),
                    [base, a, b] => {
                        // Base goes in the middle pane; labels follow pane order.
                        args.extend(labels(&["/dl", "/dm", "/dr"], ["Mod A", "Base", "Mod B"]));
                        args.extend([os(a), os(base), os(b)]);
                    }
                    _ => args.extend(inputs.iter().map(|path| os(path))),
                }
                args.push(OsString::from("/o"));
                args.push(os(output));
            }
            MergeToolKind::Meld => {
                match inputs {
                    [single] => args.extend([os(single), os(single)]),
                    // Meld merges into the middle pane.
                    [base, a, b] => args.extend([os(a), os(base), os(b)]),
                    _ => args.extend(inputs.iter().map(|path| os(path))),
                }
                args.push(OsString::from("--output"));
                args.push(os(output));
            }
        }
        Ok(args)
    }
}

fn os(path: &Path) -> OsString {
    path.as_os_str().to_os_string()
}

fn labels(flags: &[&str; 3], names: [&str; 3]) -> Vec<OsString> {
    flags
        .iter()
        .zip(names)
        .flat_map(|(flag, name)| [OsString::from(*flag), OsString::from(name)])
        .collect()
}

#[derive(Debug, Clone)]
pub struct ExternalMergeTool {
    kind: MergeToolKind,
    executable: PathBuf,
}

impl ExternalMergeTool {
    pub fn new(kind: MergeToolKind, executable: Option<PathBuf>) -> Self {
        let executable =
            executable.unwrap_or_else(|| PathBuf::from(kind.default_command()));
        Self { kind, executable }
    }

    pub fn kind(&self) -> MergeToolKind {
        self.kind
    }

    pub fn is_available(&self) -> bool {
        resolve_executable(&self.executable).is_some()
    }
}

impl MergeTool for ExternalMergeTool {
    fn name(&self) -> &str {
        self.kind.display_name()
    }

    fn merge(&self, inputs: &[PathBuf], output: &Path) -> Result<MergeRun, MergeError> {
        let args = self.kind.build_args(inputs, output)?;
        let program = resolve_executable(&self.executable)
            .ok_or_else(|| MergeError::ToolNotFound(self.executable.display().to_string()))?;

        info!(
            "launching {} with {} input(s) -> {}",
            self.name(),
            inputs.len(),
            output.display()
        );
        let result = create_command(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output();
        let output = match result {
            Ok(output) => output,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(MergeError::ToolNotFound(program.display().to_string()));
            }
            Err(err) => return Err(MergeError::Launch(err)),
        };

        let run = MergeRun {
            exit_code: output.status.code().unwrap_or(-1),
            stderr: stderr_text(&output.stderr),
        };
        debug!("{} exited with {}", self.name(), run.exit_code);
        Ok(run)
    }
}
