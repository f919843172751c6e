use std::path::{Path, PathBuf};

use anyhow::Context;

const APP_DIR_NAME: &str = "ocsync";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub database_path: PathBuf,
    pub storage_root: PathBuf,
}

impl SyncConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let data_dir = dirs::data_dir().unwrap_or_else(|| home.join(".local/share"));
        Ok(Self::from_vars(&home, &data_dir, |name| std::env::var(name).ok()))
    }

    fn from_vars<F>(home: &Path, data_dir: &Path, var: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let app_dir = data_dir.join(APP_DIR_NAME);
        let database_path = var("OCSYNC_DATABASE")
            .filter(|value| !value.is_empty())
            .map(|value| expand_with_home(&value, home))
            .unwrap_or_else(|| app_dir.join("index.db"));
        let storage_root = var("OCSYNC_STORAGE_DIR")
            .filter(|value| !value.is_empty())
            .map(|value| expand_with_home(&value, home))
            .unwrap_or_else(|| app_dir.join("files"));
        Self {
            database_path,
            storage_root,
        }
    }
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}
