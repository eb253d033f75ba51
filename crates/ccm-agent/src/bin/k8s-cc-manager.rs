//! Main binary for the CC mode agent (k8s-cc-manager)

use ccm_agent::{init_agent, AgentConfig, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "k8s-cc-manager")]
#[command(about = "Keeps the CC mode of the node's GPUs in sync with the nvidia.com/cc.mode label")]
#[command(version = ccm_core::VERSION)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Name of the node to manage
    #[arg(long, value_name = "NAME")]
    node_name: Option<String>,

    /// Kubeconfig file; the in-cluster service account is used when unset
    #[arg(long, value_name = "FILE")]
    kubeconfig: Option<PathBuf>,

    /// CC mode applied when the node label is not set
    #[arg(short = 'm', long, value_name = "MODE")]
    default_cc_mode: Option<String>,

    /// Log level
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Log format (text, json)
    #[arg(long, value_name = "FORMAT")]
    log_format: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent (default)
    Run,
    /// Generate default configuration
    GenerateConfig {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Validate configuration
    ValidateConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::GenerateConfig { ref output }) => generate_config(output.clone()),
        Some(Commands::ValidateConfig) => validate_config(&cli),
        Some(Commands::Run) | None => run_agent(&cli).await,
    }
}

fn load_config(cli: &Cli) -> Result<AgentConfig> {
    let mut config = AgentConfig::load(cli.config.as_deref())?;

    // Apply CLI overrides
    if let Some(ref node_name) = cli.node_name {
        config.node_name = node_name.clone();
    }
    if let Some(ref kubeconfig) = cli.kubeconfig {
        config.kubeconfig = Some(kubeconfig.clone());
    }
    if let Some(ref mode) = cli.default_cc_mode {
        config.default_cc_mode = mode.clone();
    }
    if let Some(ref level) = cli.log_level {
        config.logging.level = level.clone();
    }
    if let Some(ref format) = cli.log_format {
        config.logging.format = format.clone();
    }
    if cli.debug {
        config.logging.level = "debug".to_string();
    }

    Ok(config)
}

async fn run_agent(cli: &Cli) -> Result<()> {
    let config = match load_config(cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let mut agent = match init_agent(&config).await {
        Ok(agent) => agent,
        Err(e) => {
            error!("Failed to initialize k8s-cc-manager: {}", e);
            eprintln!("Failed to initialize k8s-cc-manager: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        "k8s-cc-manager {} managing node {}",
        ccm_core::VERSION,
        config.node_name
    );

    if let Err(e) = agent.run().await {
        error!("k8s-cc-manager failed: {}", e);
        std::process::exit(1);
    }

    Ok(())
}

fn generate_config(output: Option<PathBuf>) -> Result<()> {
    let config = AgentConfig::default();

    if let Some(output_path) = output {
        config.to_file(&output_path)?;
        println!("Generated configuration file: {}", output_path.display());
    } else {
        let yaml = serde_yaml::to_string(&config)?;
        println!("{}", yaml);
    }

    Ok(())
}

fn validate_config(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;
    config.validate()?;

    println!("Configuration is valid");
    println!("Node: {}", config.node_name);
    println!("CC capable device ids: {}", config.cc_capable_device_ids);
    match config.default_mode()? {
        Some(mode) => println!("Default CC mode: {}", mode),
        None => println!("Default CC mode: <none>"),
    }
    if config.evict_operator_components {
        println!(
            "Evicting operator components in namespace {} (timeout {}s)",
            config.operator_namespace, config.eviction_timeout_seconds
        );
    } else {
        println!("Operator component eviction disabled");
    }
    println!("Readiness file: {}", config.cc_readiness_file.display());

    Ok(())
}
