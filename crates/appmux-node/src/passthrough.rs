use std::fmt;
use std::process::Command;
use std::str::FromStr;
use std::sync::Arc;

use appmux_appd::exit_code;
use appmux_core::{MultiplexerError, Result};
use appmux_registry::{VersionDescriptor, VersionRegistry};
use tracing::debug;

/// Which embedded build a passthrough command runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionSelector {
    Latest,
    App(u64),
}

impl FromStr for VersionSelector {
    type Err = String;

    fn from_str(input: &str) -> std::result::Result<Self, Self::Err> {
        let trimmed = input.trim();
        if trimmed.eq_ignore_ascii_case("latest") {
            return Ok(Self::Latest);
        }
        let digits = trimmed
            .strip_prefix('v')
            .or_else(|| trimmed.strip_prefix('V'))
            .unwrap_or(trimmed);
        digits
            .parse()
            .map(Self::App)
            .map_err(|_| format!("invalid version selector '{input}': expected 'latest', 'vN' or 'N'"))
    }
}

impl fmt::Display for VersionSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Latest => f.write_str("latest"),
            Self::App(app_version) => write!(f, "v{app_version}"),
        }
    }
}

/// Runs a non-start command directly against one embedded build, with the
/// terminal handed over unchanged.
#[derive(Debug, Clone)]
pub struct PassthroughDispatcher {
    registry: Arc<VersionRegistry>,
}

impl PassthroughDispatcher {
    pub fn new(registry: Arc<VersionRegistry>) -> Self {
        Self { registry }
    }

    pub fn select(&self, selector: VersionSelector) -> Result<&VersionDescriptor> {
        match selector {
            VersionSelector::Latest => Ok(self.registry.latest()),
            VersionSelector::App(app_version) => self.registry.by_app_version(app_version),
        }
    }

    /// Runs the selected build to completion and returns the exit code a
    /// shell would report for it.
    pub fn run(&self, selector: VersionSelector, args: &[String]) -> Result<i32> {
        let descriptor = self.select(selector)?;
        let binary = descriptor.binary();
        let path = binary.resolve()?;
        debug!(
            app_version = descriptor.app_version(),
            path = %path.display(),
            ?args,
            "running passthrough command"
        );

        let status = Command::new(path)
            .args(args)
            .status()
            .map_err(|source| MultiplexerError::Launch {
                app_version: descriptor.app_version(),
                path: path.to_path_buf(),
                source,
            })?;
        Ok(exit_code(status))
    }
}
