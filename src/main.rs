use anyhow::Context;
use clap::Parser;
use edge_gateway::{init_tracing, metrics::MetricsService, run, GatewayBuilder, GatewayConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "edge-gateway", version, about)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, env = "GATEWAY_CONFIG", default_value = "config/gateway.yaml")]
    config: PathBuf,

    /// Do not install the Prometheus recorder
    #[arg(long)]
    no_prometheus: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing()?;

    let config = GatewayConfig::load(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    info!(
        path = %cli.config.display(),
        services = config.services.len(),
        "Configuration loaded"
    );

    let mut builder = GatewayBuilder::new(config);
    if !cli.no_prometheus {
        match MetricsService::new() {
            Ok(metrics) => builder = builder.prometheus(metrics.handle()),
            Err(e) => warn!(error = %e, "Prometheus recorder unavailable"),
        }
    }

    let gateway = Arc::new(builder.build().await.context("assembling gateway")?);
    run(gateway).await.context("serving")?;
    Ok(())
}
