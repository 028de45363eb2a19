//! GPU fleet reconciler process entrypoint.
//!
//! Watches `GPURequest` objects cluster-wide and drives them toward their
//! declared spec via the provider adapters, pricing cache and selector.

use std::sync::Arc;

use clap::Parser;
use futures::StreamExt;
use kube::runtime::{controller::Controller, watcher};
use kube::{Api, Client};
use tgp_config::OperatorConfig;
use tgp_pricing::PricingCache;
use tgp_types::GPURequest;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tgp_operator::{build_registry, error_policy, reconcile, Context};

#[derive(Parser, Debug)]
#[command(name = "tgp-operator", version, about = "GPU fleet reconciler")]
struct Cli {
    /// Path to the operator config YAML. Overrides `CONFIG_PATH`.
    #[arg(long)]
    config: Option<String>,

    /// Tracing filter, e.g. `info`, `debug`, `tgp_operator=debug`.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("starting tgp-operator v{}", env!("CARGO_PKG_VERSION"));

    if let Some(path) = &cli.config {
        std::env::set_var("CONFIG_PATH", path);
    }

    let config = Arc::new(OperatorConfig::load_or_default());
    if let Err(e) = config.validate() {
        error!(error = %e, "operator config failed validation");
        return Err(e.into());
    }

    let client = Client::try_default().await?;
    info!("connected to Kubernetes cluster");

    let adapters = build_registry(&client, &config).await?;
    info!(providers = adapters.len(), "provider adapters ready");

    let pricing = Arc::new(PricingCache::new(config.pricing.ttl));

    let context = Arc::new(Context {
        client: client.clone(),
        config: config.clone(),
        adapters,
        pricing,
    });

    let requests: Api<GPURequest> = Api::all(client.clone());

    Controller::new(requests, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .for_each(|result| async move {
            match result {
                Ok(action) => info!(?action, "reconcile succeeded"),
                Err(err) => warn!(error = %err, "reconcile failed"),
            }
        })
        .await;

    info!("controller stopped");
    Ok(())
}
