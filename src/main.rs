//! z/VM FCP Operator
//!
//! Serves the FCP pool and volume attach/detach operations of one z/VM
//! partition over REST.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use zvm_fcp_operator::domain::ports::HardwareQueryRef;
use zvm_fcp_operator::{
    ApiServer, ApiServerConfig, CommandHardwareQuery, Config, Error, FcpManager, MemoryStore,
    OperatorMetrics, Orchestrator, OrchestratorConfig, RestGateway, Result, VolumeAction,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// z/VM FCP Operator - FCP device pool and volume attach/detach orchestration
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "FCP_CONFIG")]
    config: Option<PathBuf>,

    /// REST API bind address (overrides api.listen_addr)
    #[arg(long, env = "FCP_LISTEN_ADDR")]
    listen_addr: Option<String>,

    /// LPAR name (overrides host.lpar_name)
    #[arg(long, env = "FCP_LPAR_NAME")]
    lpar_name: Option<String>,

    /// Hypervisor gateway URL (overrides gateway.endpoint)
    #[arg(long, env = "FCP_GATEWAY_ENDPOINT")]
    gateway_endpoint: Option<String>,

    /// Pool snapshot file (overrides store.snapshot_path)
    #[arg(long, env = "FCP_SNAPSHOT_PATH")]
    snapshot_path: Option<PathBuf>,

    /// Reconcile with the hardware before serving
    #[arg(long, env = "FCP_SYNC_ON_START")]
    sync_on_start: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    /// File config with command line overrides applied
    fn load_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };
        if let Some(addr) = &self.listen_addr {
            config.api.listen_addr = addr.clone();
        }
        if let Some(lpar) = &self.lpar_name {
            config.host.lpar_name = lpar.clone();
        }
        if let Some(endpoint) = &self.gateway_endpoint {
            config.gateway.endpoint = endpoint.clone();
        }
        if let Some(path) = &self.snapshot_path {
            config.store.snapshot_path = Some(path.clone());
        }
        config.validate()?;
        Ok(config)
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let config = args.load_config()?;

    info!("Starting z/VM FCP Operator");
    info!("  Version: {}", zvm_fcp_operator::VERSION);
    info!("  LPAR: {}", config.host.lpar_name);
    info!("  REST API: {}", config.api.listen_addr);
    info!("  Gateway: {}", config.gateway.endpoint);

    let store = match &config.store.snapshot_path {
        Some(path) => {
            info!("Pool snapshot: {}", path.display());
            Arc::new(MemoryStore::with_snapshot(path)?)
        }
        None => {
            warn!("No snapshot path configured, pool state is kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let gateway = Arc::new(RestGateway::new(config.gateway_config())?);
    let hardware: HardwareQueryRef = match &config.hardware.query_command {
        Some(argv) => {
            info!("Hardware query command: {}", argv.join(" "));
            Arc::new(CommandHardwareQuery::new(argv)?)
        }
        None => gateway.clone(),
    };

    let pool = FcpManager::new(config.manager_config(), store, hardware);
    let orchestrator = Orchestrator::new(
        OrchestratorConfig {
            lpar_name: config.host.lpar_name.clone(),
        },
        pool,
        gateway.clone(),
        gateway,
        OperatorMetrics::new()?,
    );

    if args.sync_on_start {
        match orchestrator.dispatch(VolumeAction::SyncWithHardware).await {
            Ok(_) => info!("Initial hardware reconciliation complete"),
            Err(e) => error!("Initial hardware reconciliation failed: {}", e),
        }
    }

    let api_server = Arc::new(ApiServer::new(
        ApiServerConfig {
            rest_addr: config.listen_addr()?,
        },
        orchestrator,
    ));

    let server = {
        let api_server = api_server.clone();
        tokio::spawn(async move { api_server.run().await })
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown signal received");
            api_server.shutdown();
        }
        result = server => {
            return result.map_err(|e| Error::Internal(format!("API server task failed: {}", e)))?;
        }
    }

    info!("Operator shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "reqwest=info", "tower=warn", "axum=info"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
