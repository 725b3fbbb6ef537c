//! SRE Sentinel daemon: watches labeled containers, detects anomalies,
//! diagnoses root causes, and heals through the MCP gateway.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use sentinel_ai::{AnomalyDetector, ModelClient, RootCauseAnalyzer};
use sentinel_api::{build_router, ApiState, SentinelSnapshot};
use sentinel_bus::{EventBus, RedisBus};
use sentinel_config::{GatewaySettings, Settings};
use sentinel_gateway::McpGateway;
use sentinel_observer::{AnomalySink, DockerClient, Observer, ObserverState};
use sentinel_pipeline::{ContainerProbe, IncidentPipeline};
use sentinel_types::{AnomalyVerdict, ContainerState, Incident, IncidentContext};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Autonomous SRE agent for containerized services
#[derive(Parser)]
#[command(name = "sentinel")]
#[command(about = "Watches labeled containers, diagnoses anomalies, and auto-heals via the MCP gateway")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// [DEFAULT] Run the monitoring daemon and telemetry surface
    Run,
    /// Connect to the MCP gateway, print the discovered tool catalog, and
    /// report whether remediation is possible
    CheckGateway,
}

/// Routes escalated anomalies from the observer into the pipeline. Keeps
/// the two crates decoupled: the observer only knows this trait.
struct PipelineSink(Arc<IncidentPipeline>);

#[async_trait]
impl AnomalySink for PipelineSink {
    async fn handle_anomaly(&self, context: IncidentContext, verdict: AnomalyVerdict) {
        self.0.handle_anomaly(context, verdict).await;
    }
}

/// Container status probe for incident verification, backed by the runtime.
struct DockerProbe(DockerClient);

#[async_trait]
impl ContainerProbe for DockerProbe {
    async fn container_status(&self, name: &str) -> Option<String> {
        self.0.container_status(name).await.ok()
    }
}

/// Snapshot provider for the telemetry surface.
struct Sentinel {
    observer_state: Arc<ObserverState>,
    pipeline: Arc<IncidentPipeline>,
}

impl SentinelSnapshot for Sentinel {
    fn snapshot_containers(&self) -> Vec<ContainerState> {
        self.observer_state.snapshot_containers()
    }

    fn snapshot_incidents(&self) -> Vec<Incident> {
        self.pipeline.snapshot_incidents()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_daemon().await,
        Commands::CheckGateway => check_gateway().await,
    }
}

async fn run_daemon() -> Result<()> {
    let settings = Settings::from_env().context("configuration error")?;

    let bus: Arc<dyn EventBus> = match RedisBus::connect(&settings.redis).await {
        Ok(bus) => Arc::new(bus),
        Err(err) => {
            error!(error = %err, "failed to initialize the Redis event bus");
            error!("Ensure Redis is running and accessible.");
            error!("You can start one with: docker run -d -p 6379:6379 redis:latest");
            return Err(err.into());
        }
    };

    let docker = DockerClient::connect().context("failed to connect to the Docker daemon")?;

    let model_client = Arc::new(ModelClient::new(&settings.models));
    let analyzer =
        RootCauseAnalyzer::new(Arc::clone(&model_client), settings.models.deep_model.clone());
    let gateway = Arc::new(McpGateway::new(&settings.gateway));

    let pipeline = Arc::new(IncidentPipeline::new(
        Arc::clone(&bus),
        Arc::new(AnomalyDetector::new(
            Arc::clone(&model_client),
            settings.models.fast_model.clone(),
        )),
        analyzer,
        gateway,
        Arc::new(DockerProbe(docker.clone())),
        Some(settings.observer.compose_file.clone()),
    ));

    let observer = Observer::new(
        docker,
        Arc::clone(&bus),
        AnomalyDetector::new(Arc::clone(&model_client), settings.models.fast_model.clone()),
        Arc::new(PipelineSink(Arc::clone(&pipeline))),
        settings.observer.clone(),
    );

    let api_state = Arc::new(ApiState {
        snapshot: Arc::new(Sentinel {
            observer_state: observer.state(),
            pipeline: Arc::clone(&pipeline),
        }),
        bus: Arc::clone(&bus),
    });
    let app = build_router(api_state);

    let bind = format!("{}:{}", settings.api.host, settings.api.port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind telemetry surface on {bind}"))?;
    info!(address = %bind, "telemetry surface listening");

    tokio::select! {
        () = observer.run() => {
            error!("observer loop ended unexpectedly");
        }
        result = async { axum::serve(listener, app).await } => {
            result.context("telemetry server failed")?;
        }
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for shutdown signal")?;
            info!("shutting down");
        }
    }

    Ok(())
}

/// One-shot gateway diagnosis for operators wiring up a new host.
async fn check_gateway() -> Result<()> {
    let settings = GatewaySettings::from_env()?;
    println!("Gateway URL:  {}", settings.gateway_url);
    println!(
        "Auto-heal:    {}",
        if settings.auto_heal_enabled { "enabled" } else { "disabled" }
    );

    let gateway = McpGateway::new(&settings);
    gateway
        .initialize()
        .await
        .context("failed to initialize the MCP Gateway session")?;

    let catalog = gateway.tool_catalog().await;
    if catalog.is_empty() {
        println!("\nNo tools advertised.");
    } else {
        println!("\nAvailable tools:\n{catalog}");
    }

    if gateway.verify_gateway_health().await {
        println!("Gateway is healthy.");
        Ok(())
    } else {
        bail!("gateway is unhealthy: session established but no tools advertised");
    }
}
