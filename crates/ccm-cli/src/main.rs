//! cc-manager - query and switch the CC mode of the GPUs on this host

use anyhow::{Context, Result};
use ccm_adapter_gpu::{
    config::{DEFAULT_SYSFS_ROOT, DEFAULT_TOOL_PATH},
    DeviceDiscovery, GpuAdapterConfig, GpuAdminTool, ModeApplier, SysfsPciBus,
};
use ccm_core::{parse_device_id_list, CcMode};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

mod commands;
mod output;

use commands::DeviceSelector;
use output::{OutputFormat, OutputFormatter};

/// Query and switch the confidential-computing mode of local GPUs
#[derive(Debug, Parser)]
#[command(name = "cc-manager")]
#[command(about = "Query and switch the confidential-computing mode of local GPUs")]
#[command(version)]
pub struct Cli {
    /// Comma-separated CC capable PCI device ids
    #[arg(long, env = "CC_CAPABLE_DEVICE_IDS", value_name = "IDS")]
    capable_device_ids: String,

    /// GPU admin tool executable
    #[arg(long, env = "GPU_ADMIN_TOOL", default_value = DEFAULT_TOOL_PATH)]
    tool: PathBuf,

    /// Root of the sysfs tree
    #[arg(long, env = "SYSFS_ROOT", default_value = DEFAULT_SYSFS_ROOT)]
    sysfs_root: PathBuf,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table")]
    output: OutputFormat,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Switch GPUs to a CC mode
    #[command(name = "set-cc-mode")]
    SetCcMode {
        #[command(flatten)]
        selector: DeviceSelector,

        /// CC mode (on, off, devtools)
        #[arg(short, long)]
        mode: CcMode,
    },

    /// Show the CC mode of GPUs
    #[command(name = "get-cc-mode")]
    GetCcMode {
        #[command(flatten)]
        selector: DeviceSelector,
    },

    /// Reset GPUs without changing their CC mode
    #[command(name = "reset")]
    Reset {
        #[command(flatten)]
        selector: DeviceSelector,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let formatter = OutputFormatter::new(cli.output);

    if let Err(e) = run(cli).await {
        formatter.print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(format!(
            "ccm_cli={},ccm_adapter_gpu={},ccm_core={}",
            log_level, log_level, log_level
        ))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    debug!("Starting cc-manager with: {:?}", cli);

    let capable_device_ids = parse_device_id_list(&cli.capable_device_ids)
        .context("Invalid CC_CAPABLE_DEVICE_IDS")?;
    let config = GpuAdapterConfig::new(capable_device_ids)
        .with_tool_path(&cli.tool)
        .with_sysfs_root(&cli.sysfs_root);
    config.validate()?;

    let bus = Arc::new(SysfsPciBus::new(&config.sysfs_root));
    let tool = Arc::new(GpuAdminTool::new(&config.tool_path));
    let discovery = DeviceDiscovery::new(bus.clone(), config.capable_device_ids.clone());
    let applier = ModeApplier::new(bus, tool);

    // Execute command
    match cli.command {
        Commands::SetCcMode { selector, mode } => {
            commands::mode::set_cc_mode(&discovery, &applier, &selector, mode, cli.output).await?;
        }
        Commands::GetCcMode { selector } => {
            commands::mode::get_cc_mode(&discovery, &applier, &selector, cli.output).await?;
        }
        Commands::Reset { selector } => {
            commands::mode::reset(&discovery, &applier, &selector, cli.output).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert()
    }

    #[test]
    fn test_parse_set_cc_mode() {
        let cli = Cli::try_parse_from([
            "cc-manager",
            "--capable-device-ids",
            "0x2331",
            "set-cc-mode",
            "--all",
            "--mode",
            "devtools",
        ])
        .unwrap();

        match cli.command {
            Commands::SetCcMode { selector, mode } => {
                assert!(selector.all);
                assert_eq!(mode, CcMode::Devtools);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_short_flags() {
        let cli = Cli::try_parse_from([
            "cc-manager",
            "--capable-device-ids",
            "0x2331",
            "set-cc-mode",
            "-a",
            "-m",
            "on",
        ])
        .unwrap();

        match cli.command {
            Commands::SetCcMode { selector, mode } => {
                assert!(selector.all);
                assert!(selector.device_id.is_none());
                assert_eq!(mode, CcMode::On);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_selector_is_required_and_exclusive() {
        let base = ["cc-manager", "--capable-device-ids", "0x2331", "get-cc-mode"];
        assert!(Cli::try_parse_from(base).is_err());

        let mut both = base.to_vec();
        both.extend(["--all", "--device-id", "0000:41:00.0"]);
        assert!(Cli::try_parse_from(both).is_err());
    }

    #[test]
    fn test_invalid_mode_rejected() {
        let result = Cli::try_parse_from([
            "cc-manager",
            "--capable-device-ids",
            "0x2331",
            "set-cc-mode",
            "--device-id",
            "0000:41:00.0",
            "--mode",
            "enabled",
        ]);
        assert!(result.is_err());
    }
}
