//! RunPod REST API client.
//!
//! API reference: <https://docs.runpod.io/api-reference>

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tgp_types::{BillingModel, GpuOffer, NormalizedPricing, OfferFilters};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::adapter::ProviderAdapter;
use crate::error::AdapterError;
use crate::rate_limit::RateLimiter;
use crate::types::{
    InstanceState, InstanceStatus, LaunchRequest, LaunchedInstance, ProviderInfo, RateLimits,
};

const API_BASE_URL: &str = "https://api.runpod.io/v2";
const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Deserialize)]
struct RunPodGpuType {
    id: String,
    display_name: String,
    memory_in_gb: u32,
    #[serde(default)]
    secure_price: Option<String>,
    #[serde(default)]
    community_price: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RunPodGpuTypesResponse {
    gpu_types: Vec<RunPodGpuType>,
}

#[derive(Debug, Serialize)]
struct DeployPodRequest<'a> {
    cloud_type: &'a str,
    gpu_type_id: &'a str,
    gpu_count: u32,
    container_disk_in_gb: u32,
    docker_args: &'a str,
    env: &'a serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    bid_per_gpu: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RunPodPod {
    id: String,
    #[serde(rename = "desiredStatus")]
    desired_status: String,
    #[serde(default)]
    runtime: Option<RunPodRuntime>,
    #[serde(rename = "costPerHr", default)]
    cost_per_hr: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RunPodRuntime {
    #[serde(default)]
    ports: Vec<RunPodPort>,
}

#[derive(Debug, Deserialize)]
struct RunPodPort {
    #[serde(default)]
    ip: Option<String>,
}

/// RunPod provider adapter.
pub struct RunPod {
    client: Client,
    api_key: String,
    limiter: RateLimiter,
}

impl RunPod {
    /// # Errors
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(api_key: impl Into<String>) -> Result<Self, AdapterError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;
        let limiter = RateLimiter::new(RateLimits {
            requests_per_second: 5,
            burst: 10,
        });
        Ok(Self {
            client,
            api_key: api_key.into(),
            limiter,
        })
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<T, AdapterError> {
        self.limiter.acquire(cancel).await?;
        let url = format!("{API_BASE_URL}{path}");
        debug!(url = %url, "GET request");
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    async fn post<T: serde::de::DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
        cancel: &CancellationToken,
    ) -> Result<T, AdapterError> {
        self.limiter.acquire(cancel).await?;
        let url = format!("{API_BASE_URL}{path}");
        debug!(url = %url, "POST request");
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, AdapterError> {
        let status = response.status();
        let text = response.text().await?;

        if status.is_success() {
            serde_json::from_str(&text).map_err(|e| {
                warn!(error = %e, body = %text, "failed to parse RunPod response");
                AdapterError::Serialization(e)
            })
        } else if status == StatusCode::NOT_FOUND {
            Err(AdapterError::NotFound(text))
        } else if status == StatusCode::TOO_MANY_REQUESTS {
            Err(AdapterError::RateLimited {
                retry_after_secs: 5,
            })
        } else if status.is_server_error() {
            Err(AdapterError::Transient {
                status: status.as_u16(),
                message: text,
            })
        } else {
            Err(AdapterError::Permanent {
                status: status.as_u16(),
                message: text,
            })
        }
    }

    fn to_state(desired_status: &str) -> InstanceState {
        match desired_status {
            "RUNNING" => InstanceState::Running,
            "CREATED" | "RESTARTING" => InstanceState::Pending,
            "EXITED" | "TERMINATED" => InstanceState::Terminated,
            "TERMINATING" => InstanceState::Terminating,
            _ => InstanceState::Unknown,
        }
    }
}

#[async_trait]
impl ProviderAdapter for RunPod {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            name: "runpod",
            supports_spot: true,
        }
    }

    fn rate_limits(&self) -> RateLimits {
        RateLimits {
            requests_per_second: 5,
            burst: 10,
        }
    }

    async fn list_available_gpus(
        &self,
        filters: &OfferFilters,
        cancel: &CancellationToken,
    ) -> Result<Vec<GpuOffer>, AdapterError> {
        let response: RunPodGpuTypesResponse = self.get("/gputypes", cancel).await?;
        let offers = response
            .gpu_types
            .into_iter()
            .filter(|gpu| gpu.display_name == filters.gpu_type || gpu.id == filters.gpu_type)
            .map(|gpu| {
                let on_demand = gpu.secure_price.unwrap_or_else(|| "0".to_string());
                let spot = gpu.community_price;
                GpuOffer {
                    offer_id: gpu.id.clone(),
                    provider: "runpod".to_string(),
                    gpu_type: filters.gpu_type.clone(),
                    gpu_count: 1,
                    region: filters.region.clone().unwrap_or_else(|| "any".to_string()),
                    hourly_price: on_demand,
                    spot_price: spot,
                    memory_gb: gpu.memory_in_gb,
                    storage_gb: 0,
                    is_spot: filters.want_spot,
                    available: true,
                }
            })
            .filter(|offer| filters.matches(offer))
            .collect();
        Ok(offers)
    }

    async fn get_normalized_pricing(
        &self,
        gpu_type: &str,
        region: &str,
        cancel: &CancellationToken,
    ) -> Result<NormalizedPricing, AdapterError> {
        let filters = OfferFilters {
            gpu_type: gpu_type.to_string(),
            region: Some(region.to_string()),
            max_hourly_price: None,
            want_spot: false,
        };
        let offers = self.list_available_gpus(&filters, cancel).await?;
        let offer = offers
            .into_iter()
            .next()
            .ok_or_else(|| AdapterError::NoCapacity {
                gpu_type: gpu_type.to_string(),
                region: region.to_string(),
            })?;
        NormalizedPricing::from_quote(&offer.hourly_price, BillingModel::PerHour, "USD", Utc::now())
            .map_err(|e| AdapterError::Config(e.to_string()))
    }

    async fn launch_instance(
        &self,
        request: &LaunchRequest,
        cancel: &CancellationToken,
    ) -> Result<LaunchedInstance, AdapterError> {
        let filters = OfferFilters {
            gpu_type: request.gpu_type.clone(),
            region: Some(request.region.clone()),
            max_hourly_price: request.max_price,
            want_spot: request.spot,
        };
        let offer = self
            .list_available_gpus(&filters, cancel)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| AdapterError::NoCapacity {
                gpu_type: request.gpu_type.clone(),
                region: request.region.clone(),
            })?;

        let body = DeployPodRequest {
            cloud_type: if request.spot { "COMMUNITY" } else { "SECURE" },
            gpu_type_id: &offer.offer_id,
            gpu_count: 1,
            container_disk_in_gb: 50,
            docker_args: "",
            env: &request.user_data,
            bid_per_gpu: request.spot.then(|| offer.hourly_price.clone()),
        };
        let pod: RunPodPod = self.post("/pods", &body, cancel).await?;
        Ok(LaunchedInstance {
            instance_id: pod.id,
            hourly_price: offer.hourly_price,
        })
    }

    async fn get_instance_status(
        &self,
        instance_id: &str,
        cancel: &CancellationToken,
    ) -> Result<InstanceStatus, AdapterError> {
        let path = format!("/pods/{instance_id}");
        let pod: RunPodPod = match self.get(&path, cancel).await {
            Ok(pod) => pod,
            Err(AdapterError::NotFound(_)) => return Ok(InstanceStatus::vanished()),
            Err(e) => return Err(e),
        };
        let public_ip = pod
            .runtime
            .as_ref()
            .and_then(|rt| rt.ports.first())
            .and_then(|p| p.ip.clone());
        Ok(InstanceStatus {
            state: Self::to_state(&pod.desired_status),
            public_ip,
            private_ip: None,
            updated_at: Utc::now(),
            message: None,
        })
    }

    async fn terminate_instance(
        &self,
        instance_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), AdapterError> {
        self.limiter.acquire(cancel).await?;
        let url = format!("{API_BASE_URL}/pods/{instance_id}");
        let response = self
            .client
            .delete(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            let text = response.text().await.unwrap_or_default();
            Err(AdapterError::Transient {
                status: status.as_u16(),
                message: text,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn desired_status_maps_to_standard_state() {
        assert_eq!(RunPod::to_state("RUNNING"), InstanceState::Running);
        assert_eq!(RunPod::to_state("EXITED"), InstanceState::Terminated);
        assert_eq!(RunPod::to_state("whatever-runpod-invents-next"), InstanceState::Unknown);
    }
}
