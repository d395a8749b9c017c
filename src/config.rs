use crate::merge_tool::MergeToolKind;
use anyhow::{Context, Result};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_BATCH_SIZE: usize = 10;
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_archive_tool")]
    pub archive_tool: PathBuf,
    #[serde(default)]
    pub merge_tool: MergeToolKind,
    #[serde(default)]
    pub merge_tool_path: Option<PathBuf>,
    #[serde(default)]
    pub vanilla_root: Option<PathBuf>,
    #[serde(default)]
    pub vanilla_paks: Vec<PathBuf>,
    #[serde(default)]
    pub aes_key: Option<String>,
    #[serde(default)]
    pub output_pak_name: Option<String>,
    #[serde(default)]
    pub allowed_extensions: Vec<String>,
    #[serde(default = "default_true")]
    pub ignore_no_conflict: bool,
    #[serde(default)]
    pub tasks: TaskSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSettings {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Worker count; the host's logical core count when unset.
    #[serde(default)]
    pub pool_size: Option<usize>,
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            pool_size: None,
        }
    }
}

impl TaskSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            archive_tool: default_archive_tool(),
            merge_tool: MergeToolKind::default(),
            merge_tool_path: None,
            vanilla_root: None,
            vanilla_paks: Vec::new(),
            aes_key: None,
            output_pak_name: None,
            allowed_extensions: Vec::new(),
            ignore_no_conflict: true,
            tasks: TaskSettings::default(),
        }
    }
}

impl AppConfig {
    pub fn load_or_create() -> Result<Self> {
        let path = default_config_path()?;
        if path.exists() {
            return Self::load_from(&path);
        }

        let config = AppConfig::default();
        config.save_to(&path)?;
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let mut config: AppConfig = serde_json::from_str(&raw).context("parse config")?;
        config.normalize();
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("create config dir")?;
        }
        let raw = serde_json::to_string_pretty(self).context("serialize config")?;
        fs::write(path, raw).context("write config")?;
        Ok(())
    }

    /// Lowercases extensions and strips leading dots so `.CFG` and `cfg` agree.
    fn normalize(&mut self) {
        self.allowed_extensions = self
            .allowed_extensions
            .iter()
            .map(|ext| ext.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|ext| !ext.is_empty())
            .collect();
        if self.tasks.batch_size == 0 {
            self.tasks.batch_size = DEFAULT_BATCH_SIZE;
        }
        if self.aes_key.as_deref().is_some_and(|key| key.trim().is_empty()) {
            self.aes_key = None;
        }
    }
}

pub fn default_config_path() -> Result<PathBuf> {
    Ok(base_data_dir()?.join("config.json"))
}

pub fn base_data_dir() -> Result<PathBuf> {
    let base = BaseDirs::new().context("resolve home dir")?;
    Ok(base.data_local_dir().join("pakmerger"))
}

fn default_archive_tool() -> PathBuf {
    PathBuf::from("repak")
}

fn default_true() -> bool {
    true
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "allowed_extensions": [".CFG", " ini ", ""] }"#).unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.archive_tool, PathBuf::from("repak"));
        assert_eq!(config.merge_tool, MergeToolKind::KDiff3);
        assert!(config.ignore_no_conflict);
        assert_eq!(config.tasks.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(config.tasks.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(config.allowed_extensions, vec!["cfg", "ini"]);
    }

    #[test]
    fn save_then_load_keeps_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let config = AppConfig {
            merge_tool: MergeToolKind::Meld,
            vanilla_root: Some(dir.path().join("vanilla")),
            output_pak_name: Some("z_merged_P.pak".to_string()),
            ..AppConfig::default()
        };
        config.save_to(&path).unwrap();

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.merge_tool, MergeToolKind::Meld);
        assert_eq!(loaded.vanilla_root, config.vanilla_root);
        assert_eq!(loaded.output_pak_name.as_deref(), Some("z_merged_P.pak"));
    }

    #[test]
    fn blank_key_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "aes_key": "  ", "tasks": { "batch_size": 0 } }"#).unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert!(config.aes_key.is_none());
        assert_eq!(config.tasks.batch_size, DEFAULT_BATCH_SIZE);
    }
}
