use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use appmux_appd::{default_home, HomeLayout};
use appmux_core::ActivationOverride;
use appmux_node::{
    Multiplexer, NodeHeightStore, PassthroughDispatcher, RpcHeightMonitor, VersionSelector,
};
use appmux_registry::{load_registry, VersionRegistry};
use tracing::{info, warn};

use crate::config::{MultiplexerConfig, StartOverrides};
use crate::render::{format_version_lines, OutputStyle};

/// Everything the subcommands share: where the node lives, how it is
/// configured, and which app versions it can run.
pub(crate) struct NodeContext {
    pub(crate) layout: HomeLayout,
    pub(crate) config: MultiplexerConfig,
    pub(crate) registry: Arc<VersionRegistry>,
}

pub(crate) fn load_node_context(
    home: Option<PathBuf>,
    versions: Option<&Path>,
    upgrade_height_override: Option<&str>,
) -> Result<NodeContext> {
    // Parsed before anything touches disk so a bad override fails fast.
    let activation_override = ActivationOverride::parse_optional(upgrade_height_override)?;

    let home = match home {
        Some(home) => home,
        None => default_home()?,
    };
    let layout = HomeLayout::new(home);
    let config = MultiplexerConfig::load(&layout.config_path())?;

    let manifest_path = versions
        .map(Path::to_path_buf)
        .or_else(|| config.versions_manifest_path(layout.home()))
        .unwrap_or_else(|| layout.versions_manifest_path());
    let registry = load_registry(&manifest_path, &layout, activation_override)?;
    if let Some(activation_override) = activation_override {
        info!(
            app_version = activation_override.app_version,
            height = activation_override.height,
            "activation height override in effect"
        );
    }

    Ok(NodeContext {
        layout,
        config,
        registry: Arc::new(registry),
    })
}

pub(crate) fn run_versions_command(context: &NodeContext, style: OutputStyle) -> Vec<String> {
    format_version_lines(&context.registry, &context.layout, style)
}

pub(crate) fn run_passthrough_command(
    context: NodeContext,
    selector: VersionSelector,
    args: &[String],
) -> Result<i32> {
    let dispatcher = PassthroughDispatcher::new(context.registry);
    let code = dispatcher.run(selector, args)?;
    Ok(code)
}

pub(crate) fn run_start_command(
    context: NodeContext,
    overrides: &StartOverrides,
    extra_args: Vec<String>,
) -> Result<i32> {
    let mut config = context.config;
    config.apply_overrides(overrides);
    context.layout.ensure_base_dirs()?;

    let start_config = config.start_config(context.layout.home(), extra_args);
    let store = NodeHeightStore::for_home(&context.layout);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    runtime.block_on(async {
        let monitor = RpcHeightMonitor::spawn(&config.monitor.rpc_address, config.poll_interval())?;
        let multiplexer = Multiplexer::new(context.registry, start_config);
        multiplexer.run(&store, monitor, shutdown_signal()).await?;
        Ok::<_, anyhow::Error>(())
    })?;
    Ok(0)
}

/// Resolves on ctrl-c, or on SIGTERM where that exists.
async fn shutdown_signal() {
    let interrupt = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl-c: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(err) => {
                warn!("failed to listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => info!("received interrupt, stopping"),
        _ = terminate => info!("received terminate signal, stopping"),
    }
}
