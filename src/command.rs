//! Process spawning helpers shared by the archive and merge tool adapters.

use std::{
    env,
    path::{Path, PathBuf},
    process::Command,
};

/// Creates a Command that does not flash a console window on Windows.
pub fn create_command(program: &Path) -> Command {
    #[allow(unused_mut)]
    let mut cmd = Command::new(program);

    #[cfg(target_os = "windows")]
    {
        use std::os::windows::process::CommandExt;
        // CREATE_NO_WINDOW
        cmd.creation_flags(0x08000000);
    }

    cmd
}

/// Resolves a program to an existing file.
///
/// Anything with a directory component is taken as a path; bare names are
/// searched on `PATH` (with `.exe` tried on Windows).
pub fn resolve_executable(program: &Path) -> Option<PathBuf> {
    if program.as_os_str().is_empty() {
        return None;
    }
    if program.components().count() > 1 || program.is_absolute() {
        return program.is_file().then(|| program.to_path_buf());
    }

    let path_var = env::var_os("PATH")?;
    for dir in env::split_paths(&path_var) {
        let candidate = dir.join(program);
        if candidate.is_file() {
            return Some(candidate);
        }
        if cfg!(windows) && candidate.extension().is_none() {
            let exe = candidate.with_extension("exe");
            if exe.is_file() {
                return Some(exe);
            }
        }
    }
    None
}

pub fn stderr_text(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_paths_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let tool = dir.path().join("repak");
        assert!(resolve_executable(&tool).is_none());

        std::fs::write(&tool, b"").unwrap();
        assert_eq!(resolve_executable(&tool), Some(tool));
    }

    #[test]
    fn empty_program_never_resolves() {
        assert!(resolve_executable(Path::new("")).is_none());
    }
}
