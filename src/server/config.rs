use serde::Deserialize;
use std::{env, fs, path::Path, path::PathBuf};

/// Application configuration, explicitly constructed at startup and passed
/// to every component. Loaded from YAML when a config file exists; every
/// field has a default so running without one just works.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// SQLite database file (env `DB_PATH` overrides).
    pub db_path: PathBuf,
    /// Directory for uploaded report photos.
    pub upload_dir: PathBuf,
    /// Directory where generated PDF exports are persisted.
    pub report_dir: PathBuf,
    /// Listen port (env `PORT` overrides).
    pub listen_port: Option<u16>,
    /// Name printed on the "responsible technician" line of every export.
    pub technician: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/machinelog.db"),
            upload_dir: PathBuf::from("data/uploads"),
            report_dir: PathBuf::from("data/reports"),
            listen_port: None,
            technician: "Willian Ruiz Z".to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl AppConfig {
    pub fn load(cli_path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match cli_path {
            Some(p) => p.to_path_buf(),
            None => PathBuf::from(
                env::var("CONFIG_PATH").unwrap_or_else(|_| "config.yaml".to_string()),
            ),
        };
        let mut cfg = if path.exists() {
            Self::load_from_path(&path)?
        } else {
            Self::default()
        };
        if let Ok(db) = env::var("DB_PATH") {
            cfg.db_path = PathBuf::from(db);
        }
        Ok(cfg)
    }

    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(&path)?;
        let cfg: AppConfig = serde_yaml::from_str(&text)?;
        Ok(cfg)
    }

    /// Create the upload/report/database directories this config points at.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.upload_dir)?;
        fs::create_dir_all(&self.report_dir)?;
        if let Some(parent) = self.db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}
