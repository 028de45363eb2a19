//! Builds the provider adapter registry from process configuration.
//!
//! Credentials are read once at startup from the Secret each
//! `ProviderConfig::credentials_ref` points at; the core never holds or logs
//! a raw API key after adapter construction.

use std::collections::HashMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use tgp_adapter::{LambdaLabs, ProviderAdapter, RunPod, VastAi};
use tgp_config::OperatorConfig;
use tracing::{info, warn};

use crate::error::{ReconcileError, Result};

pub type AdapterRegistry = HashMap<String, Arc<dyn ProviderAdapter>>;

/// Instantiates one adapter per enabled provider in `config`, reading each
/// one's API key from its configured Secret.
pub async fn build_registry(client: &Client, config: &OperatorConfig) -> Result<AdapterRegistry> {
    let secrets: Api<Secret> = Api::default_namespaced(client.clone());
    let mut registry = AdapterRegistry::new();

    for (name, provider_config) in &config.providers {
        if !provider_config.enabled {
            continue;
        }

        let Some(secret_ref) = &provider_config.credentials_ref else {
            warn!(provider = %name, "provider enabled but no credentialsRef set, skipping");
            continue;
        };

        let api_key = read_secret_key(&secrets, &secret_ref.name, &secret_ref.key).await?;

        let adapter: Arc<dyn ProviderAdapter> = match name.as_str() {
            "runpod" => Arc::new(RunPod::new(api_key)?),
            "lambdalabs" => Arc::new(LambdaLabs::new(api_key)?),
            "vastai" => Arc::new(VastAi::new(api_key)?),
            other => {
                warn!(provider = %other, "unrecognized provider name in config, skipping");
                continue;
            }
        };

        info!(provider = %name, "provider adapter initialized");
        registry.insert(name.clone(), adapter);
    }

    if registry.is_empty() {
        return Err(ReconcileError::Config(
            "no provider adapters could be built from configuration".to_string(),
        ));
    }

    Ok(registry)
}

async fn read_secret_key(secrets: &Api<Secret>, name: &str, key: &str) -> Result<String> {
    let secret = secrets.get(name).await?;
    let data = secret.data.unwrap_or_default();
    let bytes = data
        .get(key)
        .ok_or_else(|| ReconcileError::Config(format!("secret {name} has no key {key}")))?;
    String::from_utf8(bytes.0.clone())
        .map_err(|_| ReconcileError::Config(format!("secret {name}/{key} is not valid UTF-8")))
}
