use crate::{
    command::{create_command, resolve_executable, stderr_text},
    error::ArchiveError,
};
use std::{
    fs, io,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};
use tracing::debug;

/// The capability the pipeline needs from an archive packer.
pub trait ArchiveTool: Send + Sync {
    /// Checks that the tool can be launched at all.
    fn validate(&self) -> Result<(), ArchiveError>;

    /// Relative file paths stored in the archive.
    fn list(&self, archive: &Path, key: Option<&str>) -> Result<Vec<String>, ArchiveError>;

    fn unpack(
        &self,
        archive: &Path,
        dest: &Path,
        key: Option<&str>,
        allowed_extensions: &[String],
    ) -> Result<PathBuf, ArchiveError>;

    fn pack(&self, source_dir: &Path, dest: &Path) -> Result<PathBuf, ArchiveError>;
}

/// Lists without a key first and retries once with `key` when the tool
/// reports the archive as encrypted.
pub fn list_with_key_fallback(
    tool: &dyn ArchiveTool,
    archive: &Path,
    key: Option<&str>,
) -> Result<Vec<String>, ArchiveError> {
    match tool.list(archive, None) {
        Err(err) if err.is_key_required() => match key {
            Some(key) => {
                debug!("listing {} with AES key", archive.display());
                tool.list(archive, Some(key))
            }
            None => Err(err),
        },
        other => other,
    }
}

pub fn unpack_with_key_fallback(
    tool: &dyn ArchiveTool,
    archive: &Path,
    dest: &Path,
    key: Option<&str>,
    allowed_extensions: &[String],
) -> Result<PathBuf, ArchiveError> {
    match tool.unpack(archive, dest, None, allowed_extensions) {
        Err(err) if err.is_key_required() => match key {
            Some(key) => {
                debug!("unpacking {} with AES key", archive.display());
                tool.unpack(archive, dest, Some(key), allowed_extensions)
            }
            None => Err(err),
        },
        other => other,
    }
}

/// [`ArchiveTool`] backed by the `repak` command line tool.
#[derive(Debug, Clone)]
pub struct RepakTool {
    executable: PathBuf,
}

impl RepakTool {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
        }
    }

    fn command(&self, key: Option<&str>) -> Result<Command, ArchiveError> {
        let program = resolve_executable(&self.executable)
            .ok_or_else(|| ArchiveError::ToolNotFound(self.executable.clone()))?;
        let mut cmd = create_command(&program);
        if let Some(key) = key {
            cmd.arg("--aes-key").arg(key);
        }
        Ok(cmd)
    }

    fn run(&self, mut cmd: Command, archive: &Path) -> Result<String, ArchiveError> {
        let output = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(|err| match err.kind() {
                io::ErrorKind::NotFound => ArchiveError::ToolNotFound(self.executable.clone()),
                _ => ArchiveError::Launch(err),
            })?;

        if !output.status.success() {
            let stderr = stderr_text(&output.stderr);
            if mentions_encryption(&stderr) {
                return Err(ArchiveError::EncryptionKeyRequired(archive.to_path_buf()));
            }
            return Err(ArchiveError::Failed { stderr });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl ArchiveTool for RepakTool {
    fn validate(&self) -> Result<(), ArchiveError> {
        let mut cmd = self.command(None)?;
        cmd.arg("--version");
        self.run(cmd, &self.executable).map(|_| ())
    }

    fn list(&self, archive: &Path, key: Option<&str>) -> Result<Vec<String>, ArchiveError> {
        let mut cmd = self.command(key)?;
        cmd.arg("list").arg(archive);
        let stdout = self.run(cmd, archive)?;
        Ok(parse_listing(&stdout))
    }

    fn unpack(
        &self,
        archive: &Path,
        dest: &Path,
        key: Option<&str>,
        allowed_extensions: &[String],
    ) -> Result<PathBuf, ArchiveError> {
        fs::create_dir_all(dest)?;
        let mut cmd = self.command(key)?;
        cmd.arg("unpack")
            .arg(archive)
            .arg("--output")
            .arg(dest)
            .arg("--force");
        for ext in allowed_extensions {
            cmd.arg("--include").arg(format!("**/*.{ext}"));
        }
        self.run(cmd, archive)?;
        Ok(dest.to_path_buf())
    }

    fn pack(&self, source_dir: &Path, dest: &Path) -> Result<PathBuf, ArchiveError> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut cmd = self.command(None)?;
        cmd.arg("pack").arg(source_dir).arg(dest);
        self.run(cmd, source_dir)?;
        Ok(dest.to_path_buf())
    }
}

fn parse_listing(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(|line| line.trim().replace('\\', "/"))
        .filter(|line| !line.is_empty())
        .collect()
}

fn mentions_encryption(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("encrypted") || lower.contains("aes key") || lower.contains("key is required")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeArchiveTool;

    #[test]
    fn listing_normalizes_separators_and_blank_lines() {
        let parsed = parse_listing("Stalker2\\Content\\a.cfg\r\n\n  b/c.ini  \n");
        assert_eq!(parsed, vec!["Stalker2/Content/a.cfg", "b/c.ini"]);
    }

    #[test]
    fn encryption_is_detected_from_stderr() {
        assert!(mentions_encryption("Error: pak is Encrypted but no key was provided"));
        assert!(mentions_encryption("missing AES key"));
        assert!(!mentions_encryption("Error: unexpected end of file"));
    }

    #[test]
    fn missing_executable_reports_tool_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let tool = RepakTool::new(dir.path().join("no-such-repak"));
        assert!(matches!(tool.validate(), Err(ArchiveError::ToolNotFound(_))));
    }

    #[test]
    fn key_fallback_retries_only_when_key_present() {
        let tool = FakeArchiveTool::new()
            .with_archive("/mods/locked.pak", &[("a.cfg", "x")])
            .encrypted("/mods/locked.pak", "secret");

        let without = list_with_key_fallback(&tool, Path::new("/mods/locked.pak"), None);
        assert!(matches!(without, Err(ArchiveError::EncryptionKeyRequired(_))));

        let with = list_with_key_fallback(&tool, Path::new("/mods/locked.pak"), Some("secret"))
            .unwrap();
        assert_eq!(with, vec!["a.cfg"]);
    }
}
