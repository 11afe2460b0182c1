use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tabpilot::config::{load_config, AppConfig};
use tabpilot::kernel::Kernel;
use tabpilot_agent_bridge::AgentBridge;
use tabpilot_cdp_driver::{CdpDriver, CdpTransport, ChromiumTransport, TabDriver};
use tabpilot_core_types::{generated_command_id, Settings};
use tabpilot_data_stream::DataStreamer;
use tabpilot_executor::Executor;
use tabpilot_extract::ScriptAdapter;
use tabpilot_state_center::StateCenter;
use tabpilot_tab_registry::SessionRegistry;

/// TabPilot — browser-automation command orchestrator
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestrator: connect to the agent and drive the browser
    Serve,
    /// Enqueue a single command locally and print its result
    Run(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Command verb (e.g. WAIT, OPEN_URL)
    #[arg(long = "type")]
    kind: String,

    /// Command payload as JSON
    #[arg(long, default_value = "{}")]
    payload: String,

    /// Command id; generated when omitted
    #[arg(long)]
    id: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve => cmd_serve(config).await,
        Commands::Run(args) => cmd_run(config, args).await,
    }
}

fn init_logging(level: &str) -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.to_string())),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
    Ok(())
}

struct Core {
    kernel: Arc<Kernel>,
    executor: Arc<Executor>,
    settings: Settings,
}

fn build_core(config: &AppConfig) -> Core {
    let state = Arc::new(StateCenter::with_state_file(
        config.settings.clone(),
        config.state_path(),
    ));
    let settings = state.settings();

    let transport: Arc<dyn CdpTransport> =
        Arc::new(ChromiumTransport::new(tabpilot_cdp_driver::DriverConfig {
            websocket_url: config.browser.websocket_url.clone(),
            default_deadline: std::time::Duration::from_millis(config.browser.command_deadline_ms),
        }));
    let driver = CdpDriver::new(transport);
    driver.start();
    let driver: Arc<dyn TabDriver> = driver;

    let registry = SessionRegistry::new(Arc::clone(&driver));
    registry.start();
    let adapter = Arc::new(ScriptAdapter::new(Arc::clone(&driver)));
    let sink = DataStreamer::spawn(settings.data_endpoint.clone());

    let executor = Executor::new(
        Arc::clone(&state),
        Arc::clone(&registry),
        driver,
        adapter,
        sink.clone(),
    );
    executor.start();

    let kernel = Kernel::new(state, Arc::clone(&executor), registry, sink);
    Core {
        kernel,
        executor,
        settings,
    }
}

async fn cmd_serve(config: AppConfig) -> Result<()> {
    let core = build_core(&config);
    let bridge = AgentBridge::spawn(core.settings.agent_endpoint.clone(), core.kernel.clone());
    core.kernel.bind_bridge(bridge);
    info!(
        agent = %core.settings.agent_endpoint,
        data = %core.settings.data_endpoint,
        browser = %config.browser.websocket_url,
        "tabpilot serving"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    core.kernel.shutdown().await;
    Ok(())
}

async fn cmd_run(config: AppConfig, args: RunArgs) -> Result<()> {
    let core = build_core(&config);
    let payload: Value =
        serde_json::from_str(&args.payload).context("payload must be valid JSON")?;
    let id = args.id.unwrap_or_else(generated_command_id);
    let command = json!({ "id": id, "type": args.kind, "payload": payload });

    let mut events = core.executor.subscribe();
    let verdict = core.executor.enqueue(&command);
    println!("{}", serde_json::to_string_pretty(&verdict)?);
    if verdict.error.is_some() {
        core.kernel.shutdown().await;
        return Ok(());
    }

    loop {
        match events.recv().await {
            Ok(tabpilot_executor::CoreEvent::CommandResult { command_id, result })
                if command_id == id =>
            {
                println!("{}", serde_json::to_string_pretty(&result)?);
                break;
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }
    core.kernel.shutdown().await;
    Ok(())
}
