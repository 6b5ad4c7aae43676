use anyhow::{anyhow, Context, Result};
use flate2::read::GzDecoder;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::fs_utils::remove_file_if_exists;
use crate::HomeLayout;

/// Unpacks a gzip-compressed tar payload and installs the executable named
/// `binary_name` from it as `<home>/bin/<label>/<binary_name>`.
///
/// The payload is staged under `<home>/tmp` first and the executable moved
/// into place only once it was found, so an interrupted extraction never
/// leaves a directory that later passes [`is_extracted`].
pub(crate) fn install_payload<R: Read>(
    layout: &HomeLayout,
    label: &str,
    binary_name: &str,
    payload: R,
    fingerprint: &str,
) -> Result<PathBuf> {
    let extract_tmp = make_tmp_dir(layout, "extract")?;
    let raw_dir = extract_tmp.join("raw");
    fs::create_dir_all(&raw_dir)
        .with_context(|| format!("failed to create {}", raw_dir.display()))?;

    let installed = stage_payload(payload, &raw_dir, binary_name)
        .and_then(|staged| place_binary(layout, label, binary_name, &staged));
    let _ = fs::remove_dir_all(&extract_tmp);
    let binary = installed?;

    if !is_executable(&binary) {
        return Err(anyhow!(
            "extracted binary is not executable: {}",
            binary.display()
        ));
    }

    write_stamp(&layout.extraction_stamp_path(label), fingerprint, binary_name)?;
    Ok(binary)
}

/// Returns the executable path when a previous extraction of the payload
/// identified by `fingerprint` is still intact on disk.
pub(crate) fn is_extracted(layout: &HomeLayout, label: &str, fingerprint: &str) -> Option<PathBuf> {
    let stamp = fs::read_to_string(layout.extraction_stamp_path(label)).ok()?;
    let (stamped, binary_name) = parse_stamp(&stamp)?;
    if stamped != fingerprint {
        return None;
    }

    let binary = layout.version_dir(label).join(binary_name);
    is_executable(&binary).then_some(binary)
}

fn stage_payload<R: Read>(payload: R, raw_dir: &Path, binary_name: &str) -> Result<PathBuf> {
    extract_tar_gz(payload, raw_dir)?;
    let binary = locate_binary(raw_dir, binary_name)?;
    set_executable(&binary)?;
    Ok(binary)
}

/// Replaces `<home>/bin/<label>/` with a directory holding only the staged
/// executable.
fn place_binary(layout: &HomeLayout, label: &str, binary_name: &str, staged: &Path) -> Result<PathBuf> {
    let dst = layout.version_dir(label);
    if dst.exists() {
        fs::remove_dir_all(&dst).with_context(|| {
            format!("failed to remove stale extraction dir: {}", dst.display())
        })?;
    }
    fs::create_dir_all(&dst).with_context(|| format!("failed to create {}", dst.display()))?;

    let binary = dst.join(binary_name);
    // tmp/ may sit on another filesystem; copying keeps the permission bits.
    if fs::rename(staged, &binary).is_err() {
        fs::copy(staged, &binary).with_context(|| {
            format!("failed to copy {} to {}", staged.display(), binary.display())
        })?;
    }
    Ok(binary)
}

pub(crate) fn extract_tar_gz<R: Read>(payload: R, dst: &Path) -> Result<()> {
    let decoder = GzDecoder::new(payload);
    let mut archive = tar::Archive::new(decoder);
    archive.set_preserve_permissions(true);
    archive
        .unpack(dst)
        .with_context(|| format!("failed to decompress payload into {}", dst.display()))
}

pub(crate) fn locate_binary(root: &Path, binary_name: &str) -> Result<PathBuf> {
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = fs::read_dir(&dir)
            .with_context(|| format!("failed to read {}", dir.display()))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .with_context(|| format!("failed to list {}", dir.display()))?;
        entries.sort_by_key(|entry| entry.file_name());

        let mut subdirs = Vec::new();
        for entry in entries {
            let path = entry.path();
            let metadata = fs::symlink_metadata(&path)
                .with_context(|| format!("failed to stat {}", path.display()))?;
            if metadata.is_dir() {
                subdirs.push(path);
                continue;
            }
            if metadata.is_file() && entry.file_name() == binary_name {
                return Ok(path);
            }
        }
        pending.extend(subdirs.into_iter().rev());
    }

    Err(anyhow!(
        "payload does not contain an executable named '{binary_name}'"
    ))
}

fn set_executable(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        let mut permissions = fs::metadata(path)
            .with_context(|| format!("failed to stat {}", path.display()))?
            .permissions();
        permissions.set_mode(permissions.mode() | 0o755);
        fs::set_permissions(path, permissions)
            .with_context(|| format!("failed to set executable mode on {}", path.display()))?;
    }
    #[cfg(not(unix))]
    let _ = path;

    Ok(())
}

pub(crate) fn is_executable(path: &Path) -> bool {
    let Ok(metadata) = fs::metadata(path) else {
        return false;
    };
    if !metadata.is_file() {
        return false;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

fn write_stamp(path: &Path, fingerprint: &str, binary_name: &str) -> Result<()> {
    remove_file_if_exists(path)
        .with_context(|| format!("failed to clear extraction stamp {}", path.display()))?;
    let content = format!("payload={fingerprint}\nbinary={binary_name}\n");
    fs::write(path, content)
        .with_context(|| format!("failed to write extraction stamp {}", path.display()))
}

fn parse_stamp(raw: &str) -> Option<(&str, &str)> {
    let mut fingerprint = None;
    let mut binary = None;
    for line in raw.lines() {
        match line.split_once('=') {
            Some(("payload", value)) => fingerprint = Some(value.trim()),
            Some(("binary", value)) => binary = Some(value.trim()),
            _ => {}
        }
    }
    match (fingerprint, binary) {
        (Some(fingerprint), Some(binary)) if !fingerprint.is_empty() && !binary.is_empty() => {
            Some((fingerprint, binary))
        }
        _ => None,
    }
}

fn make_tmp_dir(layout: &HomeLayout, prefix: &str) -> Result<PathBuf> {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock is before unix epoch")?
        .as_nanos();
    let mut dir = layout.tmp_dir();
    dir.push(format!("{}-{}-{}", prefix, std::process::id(), nanos));
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed creating tmp dir: {}", dir.display()))?;
    Ok(dir)
}
