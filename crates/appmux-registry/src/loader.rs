use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use appmux_appd::{AppBinary, HomeLayout, PayloadSource};
use appmux_core::{ActivationOverride, Result, VersionsManifest};
use tracing::debug;

use crate::{VersionDescriptor, VersionRegistry};

/// Builds the registry described by a versions manifest.
///
/// Payload paths are relative to `manifest_dir`. When an override is given,
/// every version that declares an `upgrade_height_flag` is started with
/// `<flag>=<height>` so the build itself learns about the shifted boundary.
pub fn registry_from_manifest(
    manifest: &VersionsManifest,
    manifest_dir: &Path,
    layout: &HomeLayout,
    activation_override: Option<ActivationOverride>,
) -> Result<VersionRegistry> {
    let mut descriptors = Vec::with_capacity(manifest.versions.len());
    for entry in &manifest.versions {
        let payload_path = resolve_payload_path(manifest_dir, &entry.payload);
        let mut binary = AppBinary::new(
            entry.app_version,
            entry.label.clone(),
            PayloadSource::File(payload_path),
            layout.clone(),
        )
        .with_binary_name(entry.binary_name());
        if let Some(sha256) = &entry.sha256 {
            binary = binary.with_sha256(sha256.clone());
        }

        let mut descriptor = VersionDescriptor::new(
            entry.app_version,
            entry.abci,
            binary,
            entry.start_args.clone(),
        );
        if let Some(height) = entry.activation_height {
            descriptor = descriptor.with_activation_height(height);
        }
        if let (Some(flag), Some(activation_override)) =
            (&entry.upgrade_height_flag, activation_override)
        {
            descriptor.push_start_arg(format!("{flag}={}", activation_override.height));
        }
        descriptors.push(descriptor);
    }

    let registry = VersionRegistry::with_override(descriptors, activation_override)?;
    for descriptor in registry.iter() {
        debug!(
            app_version = descriptor.app_version(),
            abci = %descriptor.abci_version(),
            activation_height = ?descriptor.activation_height(),
            label = %descriptor.binary().label(),
            "registered app version"
        );
    }
    Ok(registry)
}

pub fn load_registry(
    manifest_path: &Path,
    layout: &HomeLayout,
    activation_override: Option<ActivationOverride>,
) -> anyhow::Result<VersionRegistry> {
    let raw = fs::read_to_string(manifest_path).with_context(|| {
        format!(
            "failed to read versions manifest {}",
            manifest_path.display()
        )
    })?;
    let manifest = VersionsManifest::from_toml_str(&raw)
        .with_context(|| format!("invalid versions manifest {}", manifest_path.display()))?;
    let manifest_dir = manifest_path.parent().unwrap_or_else(|| Path::new("."));
    let registry = registry_from_manifest(&manifest, manifest_dir, layout, activation_override)?;
    Ok(registry)
}

fn resolve_payload_path(manifest_dir: &Path, payload: &str) -> PathBuf {
    let path = Path::new(payload);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        manifest_dir.join(path)
    }
}
