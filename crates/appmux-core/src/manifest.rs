use std::collections::HashSet;

use anyhow::{anyhow, Context};
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::abci::AbciVersion;

pub const DEFAULT_BINARY_NAME: &str = "appd";

/// One embedded application build as listed in `versions.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionEntry {
    pub app_version: u64,
    pub abci: AbciVersion,
    pub activation_height: Option<u64>,
    pub label: Version,
    pub payload: String,
    pub sha256: Option<String>,
    pub binary: Option<String>,
    #[serde(default)]
    pub start_args: Vec<String>,
    pub upgrade_height_flag: Option<String>,
}

impl VersionEntry {
    pub fn binary_name(&self) -> &str {
        self.binary.as_deref().unwrap_or(DEFAULT_BINARY_NAME)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionsManifest {
    #[serde(default)]
    pub versions: Vec<VersionEntry>,
}

impl VersionsManifest {
    pub fn from_toml_str(input: &str) -> anyhow::Result<Self> {
        let manifest: Self = toml::from_str(input).context("failed to parse versions manifest")?;

        let mut seen_labels = HashSet::new();
        for entry in &manifest.versions {
            if entry.payload.trim().is_empty() {
                return Err(anyhow!(
                    "payload must not be empty for app version {}",
                    entry.app_version
                ));
            }
            validate_binary_name(entry.binary_name()).with_context(|| {
                format!("invalid binary name for app version {}", entry.app_version)
            })?;
            if let Some(sha256) = &entry.sha256 {
                validate_sha256_hex(sha256).with_context(|| {
                    format!("invalid sha256 for app version {}", entry.app_version)
                })?;
            }
            if let Some(flag) = &entry.upgrade_height_flag {
                if !flag.starts_with("--") || flag.contains('=') {
                    return Err(anyhow!(
                        "upgrade_height_flag '{}' for app version {} must look like --name",
                        flag,
                        entry.app_version
                    ));
                }
            }
            if !seen_labels.insert(entry.label.clone()) {
                return Err(anyhow!(
                    "duplicate build label '{}' in versions manifest",
                    entry.label
                ));
            }
        }

        Ok(manifest)
    }
}

fn validate_binary_name(name: &str) -> anyhow::Result<()> {
    if name.trim().is_empty() {
        return Err(anyhow!("binary name must not be empty"));
    }
    if name.contains('/') || name.contains('\\') || name == "." || name == ".." {
        return Err(anyhow!("binary name '{name}' must be a bare file name"));
    }
    Ok(())
}

fn validate_sha256_hex(value: &str) -> anyhow::Result<()> {
    if value.len() != 64 || !value.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(anyhow!(
            "expected 64 hex characters, got '{value}'"
        ));
    }
    Ok(())
}
