use crate::content_tree::SourceArchive;
use anyhow::{Context, Result};
use blake3::Hasher;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::atomic::{AtomicUsize, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};
use tracing::debug;
use walkdir::WalkDir;

static SESSION_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Temporary workspace for one analysis session: per-archive unpack
/// directories and the staging directory merged files are written to.
/// Removed when dropped, on every exit path.
#[derive(Debug)]
pub struct SessionDir {
    root: PathBuf,
    keep: bool,
}

impl SessionDir {
    pub fn create(temp_root: &Path) -> Result<Self> {
        fs::create_dir_all(temp_root).context("create temp root")?;

        let counter = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed);
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let root = temp_root.join(format!("session-{nanos}-{counter}"));
        fs::create_dir_all(root.join("staging")).context("create staging dir")?;
        fs::create_dir_all(root.join("unpacked")).context("create unpack dir")?;
        debug!("session dir {}", root.display());
        Ok(Self { root, keep: false })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root.join("staging")
    }

    /// Unpack target for one archive, stable for the session.
    pub fn unpack_dir(&self, archive: &SourceArchive) -> PathBuf {
        self.root.join("unpacked").join(archive_dir_name(archive))
    }

    /// Private target for one unpack attempt, so a retry never writes
    /// where an abandoned attempt may still be writing.
    pub fn unpack_attempt_dir(&self, archive: &SourceArchive, attempt: u32) -> PathBuf {
        self.unpack_dir(archive).join(format!("attempt-{attempt}"))
    }

    /// Leaves the directory on disk after drop, for debugging.
    pub fn keep(&mut self) {
        self.keep = true;
    }
}

impl Drop for SessionDir {
    fn drop(&mut self) {
        if !self.keep {
            let _ = fs::remove_dir_all(&self.root);
        }
    }
}

pub fn archive_dir_name(archive: &SourceArchive) -> String {
    let stem = archive
        .path()
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut hasher = Hasher::new();
    hasher.update(archive.path().to_string_lossy().as_bytes());
    let hash = hasher.finalize().to_hex();
    format!("{}-{}", sanitize_label(&stem), &hash.as_str()[..12])
}

fn sanitize_label(value: &str) -> String {
    value
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

/// True when `dir` holds no regular file at any depth.
pub fn dir_has_no_files(dir: &Path) -> bool {
    !WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .any(|entry| entry.file_type().is_file())
}
