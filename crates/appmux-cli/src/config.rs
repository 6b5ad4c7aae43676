use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use appmux_node::{ChildOutput, ProxySettings, StartConfig};
use serde::Deserialize;

/// `<home>/config/multiplexer.toml`. Every field has a default, so a
/// missing file is the same as an empty one.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct MultiplexerConfig {
    pub(crate) grace_period_secs: u64,
    pub(crate) child_output: ChildOutput,
    /// Relative paths are resolved against the home directory.
    pub(crate) versions_manifest: Option<PathBuf>,
    pub(crate) proxy: ProxyConfig,
    pub(crate) monitor: MonitorConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct ProxyConfig {
    pub(crate) enabled: bool,
    pub(crate) listen_address: String,
    pub(crate) app_address: String,
    pub(crate) ready_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct MonitorConfig {
    pub(crate) rpc_address: String,
    pub(crate) poll_interval_ms: u64,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: 5,
            child_output: ChildOutput::Inherit,
            versions_manifest: None,
            proxy: ProxyConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_address: "tcp://127.0.0.1:26658".to_string(),
            app_address: "tcp://127.0.0.1:36658".to_string(),
            ready_timeout_secs: 30,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            rpc_address: "tcp://127.0.0.1:26657".to_string(),
            poll_interval_ms: 500,
        }
    }
}

/// Command-line values that take precedence over the config file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct StartOverrides {
    pub(crate) grace_period_secs: Option<u64>,
    pub(crate) proxy_address: Option<String>,
    pub(crate) app_address: Option<String>,
    pub(crate) rpc_address: Option<String>,
    pub(crate) no_proxy: bool,
    pub(crate) log_child_output: bool,
}

impl MultiplexerConfig {
    pub(crate) fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self = toml::from_str(input).context("failed to parse multiplexer config")?;
        if config.monitor.poll_interval_ms == 0 {
            anyhow::bail!("monitor.poll_interval_ms must be greater than zero");
        }
        if config.proxy.ready_timeout_secs == 0 {
            anyhow::bail!("proxy.ready_timeout_secs must be greater than zero");
        }
        Ok(config)
    }

    pub(crate) fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(raw) => Self::from_toml_str(&raw)
                .with_context(|| format!("invalid config {}", path.display())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => {
                Err(err).with_context(|| format!("failed to read config {}", path.display()))
            }
        }
    }

    pub(crate) fn apply_overrides(&mut self, overrides: &StartOverrides) {
        if let Some(secs) = overrides.grace_period_secs {
            self.grace_period_secs = secs;
        }
        if let Some(address) = &overrides.proxy_address {
            self.proxy.listen_address = address.clone();
        }
        if let Some(address) = &overrides.app_address {
            self.proxy.app_address = address.clone();
        }
        if let Some(address) = &overrides.rpc_address {
            self.monitor.rpc_address = address.clone();
        }
        if overrides.no_proxy {
            self.proxy.enabled = false;
        }
        if overrides.log_child_output {
            self.child_output = ChildOutput::Log;
        }
    }

    pub(crate) fn versions_manifest_path(&self, home: &Path) -> Option<PathBuf> {
        self.versions_manifest.as_ref().map(|path| {
            if path.is_absolute() {
                path.clone()
            } else {
                home.join(path)
            }
        })
    }

    pub(crate) fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.monitor.poll_interval_ms)
    }

    pub(crate) fn start_config(&self, home: &Path, extra_args: Vec<String>) -> StartConfig {
        let mut config = StartConfig::new(home);
        config.extra_args = extra_args;
        config.grace_period = Duration::from_secs(self.grace_period_secs);
        config.child_output = self.child_output;
        config.proxy = self.proxy.enabled.then(|| ProxySettings {
            listen_address: self.proxy.listen_address.clone(),
            app_address: self.proxy.app_address.clone(),
            ready_timeout: Duration::from_secs(self.proxy.ready_timeout_secs),
        });
        config
    }
}
