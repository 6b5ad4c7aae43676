use anyhow::Result;

use crate::command_flows::{
    load_node_context, run_passthrough_command, run_start_command, run_versions_command,
};
use crate::completion::write_completions_script;
use crate::config::StartOverrides;
use crate::render::current_output_style;
use crate::{Cli, Commands, StartArgs};

/// Runs one command and returns the process exit code.
pub(crate) fn run_cli(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Completions { shell } => {
            let stdout = std::io::stdout();
            write_completions_script(shell, &mut stdout.lock())?;
            Ok(0)
        }
        Commands::Versions => {
            let context = load_node_context(
                cli.home,
                cli.versions.as_deref(),
                cli.upgrade_height_override.as_deref(),
            )?;
            for line in run_versions_command(&context, current_output_style()) {
                println!("{line}");
            }
            Ok(0)
        }
        Commands::Passthrough { selector, args } => {
            let context = load_node_context(
                cli.home,
                cli.versions.as_deref(),
                cli.upgrade_height_override.as_deref(),
            )?;
            run_passthrough_command(context, selector, &args)
        }
        Commands::Start(start) => {
            let context = load_node_context(
                cli.home,
                cli.versions.as_deref(),
                cli.upgrade_height_override.as_deref(),
            )?;
            let overrides = start_overrides(&start);
            run_start_command(context, &overrides, start.extra)
        }
    }
}

pub(crate) fn start_overrides(start: &StartArgs) -> StartOverrides {
    StartOverrides {
        grace_period_secs: start.grace_period_secs,
        proxy_address: start.proxy_address.clone(),
        app_address: start.app_address.clone(),
        rpc_address: start.rpc_address.clone(),
        no_proxy: start.no_proxy,
        log_child_output: start.log_app_output,
    }
}
