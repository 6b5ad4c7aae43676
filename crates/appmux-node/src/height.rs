use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context};
use appmux_appd::HomeLayout;
use appmux_core::{ChainHeight, MultiplexerError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

const EVENT_BUFFER: usize = 64;

/// Where the node last left the chain, read once at startup.
pub trait HeightStore {
    fn persisted_height(&self) -> Result<ChainHeight>;

    /// Remembers a height the chain has committed. Read-only stores ignore it.
    fn record_height(&self, height: u64) -> Result<()> {
        let _ = height;
        Ok(())
    }
}

impl HeightStore for ChainHeight {
    fn persisted_height(&self) -> Result<ChainHeight> {
        Ok(*self)
    }
}

#[derive(Deserialize)]
struct HeightDocument {
    height: HeightValue,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum HeightValue {
    Text(String),
    Number(u64),
}

/// Reads the `height` field of a JSON document. A missing file is genesis.
fn read_height_file(path: &Path) -> anyhow::Result<ChainHeight> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(ChainHeight::Genesis),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", path.display()))
        }
    };
    let document: HeightDocument = serde_json::from_str(&raw)
        .with_context(|| format!("invalid height file {}", path.display()))?;
    let height = match document.height {
        HeightValue::Number(height) => height,
        HeightValue::Text(text) => text
            .trim()
            .parse()
            .with_context(|| format!("invalid height '{text}' in {}", path.display()))?,
    };
    Ok(ChainHeight::from_persisted(Some(height)))
}

fn height_source_error(err: anyhow::Error) -> MultiplexerError {
    MultiplexerError::HeightSource(format!("{err:#}"))
}

/// CometBFT's `priv_validator_state.json`: the last height this node signed.
/// A node that never signed has no such file, or one stuck at 0.
#[derive(Debug, Clone)]
pub struct ValidatorStateFile {
    path: PathBuf,
}

impl ValidatorStateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl HeightStore for ValidatorStateFile {
    fn persisted_height(&self) -> Result<ChainHeight> {
        read_height_file(&self.path).map_err(height_source_error)
    }
}

/// Committed heights observed by the multiplexer, persisted so that full
/// nodes, which never sign, still restart on the right version.
#[derive(Debug, Clone)]
pub struct HeightRecordFile {
    path: PathBuf,
}

impl HeightRecordFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn write(&self, height: u64) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let staged = self.path.with_extension("json.tmp");
        let body = serde_json::json!({ "height": height.to_string() }).to_string();
        fs::write(&staged, body)
            .with_context(|| format!("failed to write {}", staged.display()))?;
        fs::rename(&staged, &self.path).with_context(|| {
            format!(
                "failed to move {} to {}",
                staged.display(),
                self.path.display()
            )
        })
    }
}

impl HeightStore for HeightRecordFile {
    fn persisted_height(&self) -> Result<ChainHeight> {
        read_height_file(&self.path).map_err(height_source_error)
    }

    fn record_height(&self, height: u64) -> Result<()> {
        self.write(height).map_err(height_source_error)
    }
}

/// `upgrade-info.json`, left behind by an application that halted for a
/// planned upgrade. Its height has been reached by definition.
#[derive(Debug, Clone)]
pub struct UpgradeInfoFile {
    path: PathBuf,
}

impl UpgradeInfoFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl HeightStore for UpgradeInfoFile {
    fn persisted_height(&self) -> Result<ChainHeight> {
        read_height_file(&self.path).map_err(height_source_error)
    }
}

/// Every height source in a node home. The persisted height is the highest
/// any of them reports, and observed heights go to the multiplexer's record.
#[derive(Debug, Clone)]
pub struct NodeHeightStore {
    validator_state: ValidatorStateFile,
    record: HeightRecordFile,
    upgrade_info: UpgradeInfoFile,
}

impl NodeHeightStore {
    pub fn for_home(layout: &HomeLayout) -> Self {
        Self {
            validator_state: ValidatorStateFile::new(layout.validator_state_path()),
            record: HeightRecordFile::new(layout.height_record_path()),
            upgrade_info: UpgradeInfoFile::new(layout.upgrade_info_path()),
        }
    }
}

impl HeightStore for NodeHeightStore {
    fn persisted_height(&self) -> Result<ChainHeight> {
        let signed = self.validator_state.persisted_height()?;
        let recorded = self.record.persisted_height()?;
        let upgrade = self.upgrade_info.persisted_height()?;
        debug!(%signed, %recorded, %upgrade, "read persisted heights");
        let highest = [signed, recorded, upgrade]
            .into_iter()
            .map(|height| height.value())
            .max()
            .unwrap_or(0);
        Ok(ChainHeight::from_persisted(Some(highest)))
    }

    fn record_height(&self, height: u64) -> Result<()> {
        self.record.record_height(height)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeightEvent {
    /// Latest height committed by the consensus engine.
    Height(u64),
    /// The chain announced that it now runs this app version.
    UpgradeNotice { app_version: u64 },
}

/// Live feed of chain progress. `None` means the feed has ended for good.
#[async_trait]
pub trait HeightMonitor: Send {
    async fn next_event(&mut self) -> Option<HeightEvent>;
}

/// Height feed driven by the caller, used when events come from somewhere
/// other than the consensus engine's RPC.
pub struct ChannelHeightMonitor {
    events: mpsc::Receiver<HeightEvent>,
}

impl ChannelHeightMonitor {
    pub fn new(capacity: usize) -> (mpsc::Sender<HeightEvent>, Self) {
        let (sender, events) = mpsc::channel(capacity);
        (sender, Self { events })
    }
}

#[async_trait]
impl HeightMonitor for ChannelHeightMonitor {
    async fn next_event(&mut self) -> Option<HeightEvent> {
        self.events.recv().await
    }
}

/// Polls the consensus engine's `/status` endpoint in a background task.
/// Dropping the monitor stops the poller.
pub struct RpcHeightMonitor {
    events: mpsc::Receiver<HeightEvent>,
    poller: JoinHandle<()>,
}

impl RpcHeightMonitor {
    /// Starts polling. Must be called from within a tokio runtime.
    pub fn spawn(rpc_address: &str, poll_interval: Duration) -> anyhow::Result<Self> {
        let url = status_url(rpc_address);
        let client = reqwest::Client::builder()
            .timeout(poll_interval.max(Duration::from_secs(2)))
            .build()
            .context("failed to build rpc client")?;
        let (sender, events) = mpsc::channel(EVENT_BUFFER);
        info!(url = %url, interval_ms = poll_interval.as_millis() as u64, "polling chain height");
        let poller = tokio::spawn(poll_status(client, url, poll_interval, sender));
        Ok(Self { events, poller })
    }
}

impl Drop for RpcHeightMonitor {
    fn drop(&mut self) {
        self.poller.abort();
    }
}

#[async_trait]
impl HeightMonitor for RpcHeightMonitor {
    async fn next_event(&mut self) -> Option<HeightEvent> {
        self.events.recv().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NodeStatus {
    pub(crate) height: u64,
    pub(crate) app_version: Option<u64>,
}

#[derive(Deserialize)]
struct StatusEnvelope {
    result: StatusResult,
}

#[derive(Deserialize)]
struct StatusResult {
    sync_info: SyncInfo,
    #[serde(default)]
    node_info: Option<NodeInfo>,
}

#[derive(Deserialize)]
struct SyncInfo {
    latest_block_height: String,
}

#[derive(Deserialize)]
struct NodeInfo {
    #[serde(default)]
    protocol_version: Option<ProtocolVersion>,
}

#[derive(Deserialize)]
struct ProtocolVersion {
    #[serde(default)]
    app: Option<String>,
}

pub(crate) fn parse_status(body: &str) -> anyhow::Result<NodeStatus> {
    let envelope: StatusEnvelope =
        serde_json::from_str(body).context("invalid status response")?;
    let raw_height = envelope.result.sync_info.latest_block_height;
    let height = raw_height
        .trim()
        .parse()
        .map_err(|_| anyhow!("invalid latest_block_height '{raw_height}'"))?;
    let app_version = envelope
        .result
        .node_info
        .and_then(|info| info.protocol_version)
        .and_then(|protocol| protocol.app)
        .and_then(|app| app.trim().parse().ok());
    Ok(NodeStatus {
        height,
        app_version,
    })
}

pub(crate) fn status_url(rpc_address: &str) -> String {
    let base = rpc_address.trim().trim_end_matches('/');
    let base = match base.strip_prefix("tcp://") {
        Some(rest) => format!("http://{rest}"),
        None if base.contains("://") => base.to_string(),
        None => format!("http://{base}"),
    };
    format!("{base}/status")
}

async fn fetch_status(client: &reqwest::Client, url: &str) -> anyhow::Result<NodeStatus> {
    let body = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("failed to query {url}"))?
        .error_for_status()
        .with_context(|| format!("rpc {url} returned an error status"))?
        .text()
        .await
        .with_context(|| format!("failed to read response from {url}"))?;
    parse_status(&body)
}

async fn poll_status(
    client: reqwest::Client,
    url: String,
    interval: Duration,
    sender: mpsc::Sender<HeightEvent>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_height = None;
    let mut last_app_version = None;
    let mut failing = false;

    loop {
        ticker.tick().await;
        let status = match fetch_status(&client, &url).await {
            Ok(status) => status,
            Err(err) => {
                if failing {
                    debug!("height poll failed: {err:#}");
                } else {
                    warn!("height poll failed: {err:#}");
                    failing = true;
                }
                continue;
            }
        };
        if failing {
            info!(height = status.height, "height source reachable again");
            failing = false;
        }

        if let Some(app_version) = status.app_version {
            if last_app_version != Some(app_version) {
                last_app_version = Some(app_version);
                if sender
                    .send(HeightEvent::UpgradeNotice { app_version })
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }
        if last_height != Some(status.height) {
            last_height = Some(status.height);
            debug!(height = status.height, "observed chain height");
            if sender.send(HeightEvent::Height(status.height)).await.is_err() {
                return;
            }
        }
    }
}
