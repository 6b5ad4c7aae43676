use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Directory layout under the node home shared by the multiplexer and the
/// application builds it launches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HomeLayout {
    home: PathBuf,
}

impl HomeLayout {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.home.join("bin")
    }

    pub fn config_dir(&self) -> PathBuf {
        self.home.join("config")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.home.join("data")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.home.join("tmp")
    }

    pub fn config_path(&self) -> PathBuf {
        self.config_dir().join("multiplexer.toml")
    }

    pub fn versions_manifest_path(&self) -> PathBuf {
        self.config_dir().join("versions.toml")
    }

    pub fn validator_state_path(&self) -> PathBuf {
        self.data_dir().join("priv_validator_state.json")
    }

    /// Latest committed height the multiplexer has seen, kept across restarts.
    pub fn height_record_path(&self) -> PathBuf {
        self.data_dir().join("appmux_height.json")
    }

    /// Written by the application when it halts for a planned upgrade.
    pub fn upgrade_info_path(&self) -> PathBuf {
        self.data_dir().join("upgrade-info.json")
    }

    pub fn version_dir(&self, label: &str) -> PathBuf {
        self.bin_dir().join(label)
    }

    pub fn extraction_stamp_path(&self, label: &str) -> PathBuf {
        self.version_dir(label).join(".extracted")
    }

    pub fn ensure_base_dirs(&self) -> Result<()> {
        for dir in [self.bin_dir(), self.config_dir(), self.data_dir(), self.tmp_dir()] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

pub fn default_home() -> Result<PathBuf> {
    if let Some(home) = std::env::var_os("APPMUX_HOME").filter(|value| !value.is_empty()) {
        return Ok(PathBuf::from(home));
    }

    if cfg!(windows) {
        let app_data = std::env::var("LOCALAPPDATA")
            .context("LOCALAPPDATA is not set; cannot resolve Windows node home")?;
        return Ok(PathBuf::from(app_data).join("Appmux"));
    }

    let home = std::env::var("HOME").context("HOME is not set; cannot resolve node home")?;
    Ok(PathBuf::from(home).join(".appmux"))
}
