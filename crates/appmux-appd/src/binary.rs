use std::borrow::Cow;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, UNIX_EPOCH};

use anyhow::{anyhow, Context};
use appmux_core::{MultiplexerError, Result, DEFAULT_BINARY_NAME};
use appmux_security::{sha256_hex, verify_sha256, verify_sha256_reader};
use semver::Version;
use tracing::{debug, info};

use crate::extract::{install_payload, is_extracted};
use crate::process::{RunningInstance, StdioBindings, StopReport};
use crate::HomeLayout;

/// Where the compressed payload of an application build lives.
#[derive(Debug, Clone)]
pub enum PayloadSource {
    /// Compiled into the multiplexer, e.g. with `include_bytes!`.
    Embedded(Cow<'static, [u8]>),
    /// Shipped next to the multiplexer as a `.tar.gz` file.
    File(PathBuf),
}

impl PayloadSource {
    /// Identifies the payload for the extraction stamp. A declared digest is
    /// taken as is; a file is known by its size and modification time, so a
    /// restart does not read it again.
    fn fingerprint(&self, declared_sha256: Option<&str>) -> anyhow::Result<String> {
        if let Some(expected) = declared_sha256 {
            return Ok(format!("sha256:{}", expected.trim().to_ascii_lowercase()));
        }
        match self {
            Self::Embedded(bytes) => Ok(format!("sha256:{}", sha256_hex(bytes))),
            Self::File(path) => {
                let metadata = fs::metadata(path)
                    .with_context(|| format!("failed to stat payload {}", path.display()))?;
                let modified = metadata
                    .modified()
                    .ok()
                    .and_then(|modified| modified.duration_since(UNIX_EPOCH).ok())
                    .map(|since_epoch| since_epoch.as_nanos())
                    .unwrap_or_default();
                Ok(format!("file:{}:{modified}", metadata.len()))
            }
        }
    }

    fn verify(&self, expected: &str) -> anyhow::Result<()> {
        let verified = match self {
            Self::Embedded(bytes) => verify_sha256(bytes, expected),
            Self::File(path) => verify_sha256_reader(&mut open_payload(path)?, expected)?,
        };
        if !verified {
            return Err(anyhow!(
                "payload checksum mismatch: expected {}",
                expected.trim()
            ));
        }
        Ok(())
    }

    fn reader(&self) -> anyhow::Result<Box<dyn Read + '_>> {
        match self {
            Self::Embedded(bytes) => Ok(Box::new(&bytes[..])),
            Self::File(path) => Ok(Box::new(open_payload(path)?)),
        }
    }
}

fn open_payload(path: &Path) -> anyhow::Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .with_context(|| format!("failed to read payload {}", path.display()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractOutcome {
    Extracted(PathBuf),
    AlreadyPresent(PathBuf),
}

impl ExtractOutcome {
    pub fn path(&self) -> &Path {
        match self {
            Self::Extracted(path) | Self::AlreadyPresent(path) => path,
        }
    }
}

/// One embedded application build.
#[derive(Debug)]
pub struct AppBinary {
    app_version: u64,
    label: Version,
    source: PayloadSource,
    sha256: Option<String>,
    binary_name: String,
    layout: HomeLayout,
    resolved: OnceLock<PathBuf>,
}

impl AppBinary {
    pub fn new(app_version: u64, label: Version, source: PayloadSource, layout: HomeLayout) -> Self {
        Self {
            app_version,
            label,
            source,
            sha256: None,
            binary_name: DEFAULT_BINARY_NAME.to_string(),
            layout,
            resolved: OnceLock::new(),
        }
    }

    pub fn with_sha256(mut self, sha256: impl Into<String>) -> Self {
        self.sha256 = Some(sha256.into());
        self
    }

    pub fn with_binary_name(mut self, binary_name: impl Into<String>) -> Self {
        self.binary_name = binary_name.into();
        self
    }

    pub fn app_version(&self) -> u64 {
        self.app_version
    }

    pub fn label(&self) -> &Version {
        &self.label
    }

    pub fn binary_name(&self) -> &str {
        &self.binary_name
    }

    pub fn layout(&self) -> &HomeLayout {
        &self.layout
    }

    /// Path of the executable, extracting the payload on first use.
    ///
    /// Within one process the path is computed once; across restarts the
    /// extraction stamp on disk turns a repeat call into a no-op.
    pub fn resolve(&self) -> Result<&Path> {
        if let Some(path) = self.resolved.get() {
            return Ok(path);
        }
        let outcome = self.extract()?;
        let path = self
            .resolved
            .get_or_init(|| outcome.path().to_path_buf());
        Ok(path)
    }

    /// Ensures the payload is extracted and reports whether work was done.
    pub fn extract(&self) -> Result<ExtractOutcome> {
        self.extract_inner().map_err(|err| MultiplexerError::Extraction {
            app_version: self.app_version,
            label: self.label.to_string(),
            reason: format!("{err:#}"),
        })
    }

    fn extract_inner(&self) -> anyhow::Result<ExtractOutcome> {
        let label = self.label.to_string();
        let fingerprint = self.source.fingerprint(self.sha256.as_deref())?;
        if let Some(path) = is_extracted(&self.layout, &label, &fingerprint) {
            debug!(app_version = self.app_version, path = %path.display(), "payload already extracted");
            return Ok(ExtractOutcome::AlreadyPresent(path));
        }

        if let Some(expected) = &self.sha256 {
            self.source.verify(expected)?;
        }
        fs::create_dir_all(self.layout.bin_dir()).with_context(|| {
            format!("failed to create {}", self.layout.bin_dir().display())
        })?;
        let path = install_payload(
            &self.layout,
            &label,
            &self.binary_name,
            self.source.reader()?,
            &fingerprint,
        )?;
        info!(
            app_version = self.app_version,
            label = %label,
            path = %path.display(),
            "extracted embedded app binary"
        );
        Ok(ExtractOutcome::Extracted(path))
    }

    /// Starts the build as a subprocess. Must be called from within a tokio
    /// runtime.
    pub fn launch(&self, args: &[String], stdio: StdioBindings) -> Result<RunningInstance> {
        let path = self.resolve()?;

        let mut command = tokio::process::Command::new(path);
        command.args(args).kill_on_drop(true);
        // Own process group: a terminal ctrl-c reaches the multiplexer only,
        // which then stops the app itself.
        #[cfg(unix)]
        command.process_group(0);
        stdio.apply(&mut command);

        let child = command.spawn().map_err(|source| MultiplexerError::Launch {
            app_version: self.app_version,
            path: path.to_path_buf(),
            source,
        })?;
        let instance = RunningInstance::new(self.app_version, child);
        info!(
            app_version = self.app_version,
            label = %self.label,
            pid = instance.pid(),
            "launched app binary"
        );
        Ok(instance)
    }

    pub async fn stop(&self, instance: RunningInstance, grace: Duration) -> Result<StopReport> {
        debug_assert_eq!(instance.app_version(), self.app_version);
        instance.shutdown(grace).await
    }
}
