//! Coordination node entry point
//!
//! Runs a coordination client with an acknowledging callback: every local
//! agent answers each request with a SUCCEED response. Useful for smoke
//! testing a cluster topic and as a template for real solvers.

use clap::{Parser, Subcommand};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use simcoord::agent::AgentRecord;
use simcoord::dispatch::{CoordinationCallback, HandlerResult};
use simcoord::observability::{init_default_logging, init_logging, parse_level, LogFormat};
use simcoord::protocol::{
    CommandKind, CommandResponse, Context, TaskInitRequest, TerminateRequest, TickRequest,
    TimeSeriesCalcRequest, TimeSeriesUpdateRequest,
};
use simcoord::transport::MqttTransport;
use simcoord::{CoordinationClient, CoordinatorConfig};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tracing::{error, info};

/// Simulation agent coordination node
#[derive(Parser)]
#[command(name = "simcoord")]
#[command(about = "Coordinate simulation agents over an MQTT cluster topic")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "SIMCOORD_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join the coordination topic until SIGINT/SIGTERM
    Run,
    /// Validate the configuration
    Config {
        /// Print the parsed configuration
        #[arg(long)]
        show: bool,
    },
}

/// Answers every request with one SUCCEED response per local agent
struct AcknowledgingCallback;

impl AcknowledgingCallback {
    fn acknowledge(
        kind: CommandKind,
        command_id: &str,
        context: &Context,
        agents: &[AgentRecord],
    ) -> HandlerResult {
        Ok(agents
            .iter()
            .map(|agent| CommandResponse::new(kind.clone(), command_id, context, agent))
            .collect())
    }
}

impl CoordinationCallback for AcknowledgingCallback {
    fn component(&self) -> &str {
        "acknowledger"
    }

    fn on_task_init(&self, request: &TaskInitRequest, agents: &[AgentRecord]) -> HandlerResult {
        Self::acknowledge(
            CommandKind::TaskInitResponse,
            &request.command_id,
            &request.context,
            agents,
        )
    }

    fn on_tick(&self, request: &TickRequest, agents: &[AgentRecord]) -> HandlerResult {
        Self::acknowledge(
            CommandKind::TickResponse,
            &request.command_id,
            &request.context,
            agents,
        )
    }

    fn on_terminate(&self, request: &TerminateRequest, agents: &[AgentRecord]) -> HandlerResult {
        Self::acknowledge(
            CommandKind::TerminateResponse,
            &request.command_id,
            &request.context,
            agents,
        )
    }

    fn on_time_series_update(
        &self,
        request: &TimeSeriesUpdateRequest,
        agents: &[AgentRecord],
    ) -> HandlerResult {
        Self::acknowledge(
            CommandKind::TimeSeriesUpdateResponse,
            &request.command_id,
            &request.context,
            agents,
        )
    }

    fn on_time_series_calc(
        &self,
        request: &TimeSeriesCalcRequest,
        agents: &[AgentRecord],
    ) -> HandlerResult {
        Self::acknowledge(
            CommandKind::TimeSeriesCalcResponse,
            &request.command_id,
            &request.context,
            agents,
        )
    }
}

fn main() {
    let cli = Cli::parse();

    let logging = match cli.verbose {
        0 => init_default_logging(),
        1 => init_logging(parse_level("DEBUG"), LogFormat::Compact, false),
        _ => init_logging(parse_level("TRACE"), LogFormat::Compact, true),
    };
    if let Err(e) = logging {
        eprintln!("Failed to initialize logging: {e}");
    }

    info!("Starting simcoord v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_node(config),
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Shutdown complete");
}

fn load_configuration(
    config_path: Option<&Path>,
) -> Result<CoordinatorConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(CoordinatorConfig::load_from_file(path)?);
    }

    for candidate in ["simcoord.toml", "config/simcoord.toml"] {
        let path = Path::new(candidate);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(CoordinatorConfig::load_from_file(path)?);
        }
    }

    Err("no configuration file found; pass --config or create simcoord.toml".into())
}

fn run_node(config: CoordinatorConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        cluster_id = %config.node.cluster_id,
        node_id = %config.node.node_id,
        hosted_codes = ?config.agents.codes,
        "Joining coordination topic"
    );

    let transport = Arc::new(MqttTransport::new(format!("simcoord-{}", config.node.node_id)));
    let client =
        CoordinationClient::builder(config, transport, Arc::new(AcknowledgingCallback)).build()?;

    // Register before start so an early signal is not lost
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    client.start()?;

    if let Some(signal) = signals.forever().next() {
        info!(signal, "Received shutdown signal");
    }

    client.stop()?;
    info!(
        metrics = %serde_json::to_string(&client.metrics())?,
        "Final coordination counters"
    );
    Ok(())
}

fn handle_config_command(
    config: &CoordinatorConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    info!("Configuration is valid");
    info!("Coordination topic: {}", config.coordination_topic());
    info!("Metrics topic: {}", config.metrics_topic());

    if show {
        println!("{}", toml::to_string_pretty(config)?);
    }
    Ok(())
}
