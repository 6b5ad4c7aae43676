use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

mod command_flows;
mod completion;
mod config;
mod dispatch;
mod logging;
mod render;

use appmux_node::VersionSelector;
use completion::CliCompletionShell;
use dispatch::run_cli;
use logging::init_tracing;
use render::{current_output_style, render_status_line};

#[derive(Parser, Debug)]
#[command(name = "appmux")]
#[command(
    about = "Runs the application version that is authoritative for the chain height",
    long_about = None,
    version
)]
struct Cli {
    /// Node home holding config/, data/ and the extracted app binaries.
    #[arg(long, global = true, env = "APPMUX_HOME")]
    home: Option<PathBuf>,
    /// Versions manifest; defaults to <home>/config/versions.toml.
    #[arg(long, global = true)]
    versions: Option<PathBuf>,
    /// Shifts the activation height of one app version.
    #[arg(
        long,
        global = true,
        env = "APPMUX_UPGRADE_HEIGHT_OVERRIDE",
        value_name = "APP_VERSION=HEIGHT"
    )]
    upgrade_height_override: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the node, switching app versions at their activation heights.
    Start(StartArgs),
    /// Run any other command against one embedded app version.
    Passthrough {
        /// `latest`, or a pinned app version such as `v3`.
        selector: VersionSelector,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// List the registered app versions.
    Versions,
    /// Print a shell completion script.
    Completions {
        #[arg(value_enum)]
        shell: CliCompletionShell,
    },
}

#[derive(Args, Debug, Default)]
struct StartArgs {
    #[arg(long)]
    grace_period_secs: Option<u64>,
    /// Address the consensus engine connects to.
    #[arg(long)]
    proxy_address: Option<String>,
    /// Address the app versions serve ABCI on behind the proxy.
    #[arg(long)]
    app_address: Option<String>,
    /// Consensus engine RPC polled for the chain height.
    #[arg(long)]
    rpc_address: Option<String>,
    /// Let the consensus engine dial the app directly.
    #[arg(long)]
    no_proxy: bool,
    /// Re-emit app output as log records instead of sharing the terminal.
    #[arg(long)]
    log_app_output: bool,
    /// Passed to every app version after its own start arguments.
    #[arg(last = true)]
    extra: Vec<String>,
}

fn main() {
    let cli = Cli::parse();
    init_tracing();

    let code = match run_cli(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!(
                "{}",
                render_status_line(current_output_style(), "error", &format!("{err:#}"))
            );
            1
        }
    };
    std::process::exit(code);
}
