//! Lambda Cloud (Lambda Labs) API client.
//!
//! API reference: <https://docs.lambdalabs.com/public-cloud/cloud-api>

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
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

const API_BASE_URL: &str = "https://cloud.lambdalabs.com/api/v1";
const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Deserialize)]
struct InstanceTypeEntry {
    instance_type: InstanceTypeDetails,
    regions_with_capacity_available: Vec<RegionInfo>,
}

#[derive(Debug, Deserialize)]
struct InstanceTypeDetails {
    name: String,
    price_cents_per_hour: u64,
    specs: InstanceSpecs,
}

#[derive(Debug, Deserialize)]
struct InstanceSpecs {
    memory_gib: u32,
    storage_gib: u32,
}

#[derive(Debug, Deserialize)]
struct RegionInfo {
    name: String,
}

#[derive(Debug, Deserialize)]
struct InstanceTypesResponse {
    data: std::collections::HashMap<String, InstanceTypeEntry>,
}

#[derive(Debug, Serialize)]
struct LaunchInstanceRequest<'a> {
    region_name: &'a str,
    instance_type_name: &'a str,
    quantity: u32,
    file_system_names: Vec<&'a str>,
    user_data: &'a serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct LaunchInstanceResponse {
    data: LaunchInstanceData,
}

#[derive(Debug, Deserialize)]
struct LaunchInstanceData {
    instance_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct InstanceResponse {
    data: InstanceDetails,
}

#[derive(Debug, Deserialize)]
struct InstanceDetails {
    status: String,
    ip: Option<String>,
    private_ip: Option<String>,
}

/// Lambda Cloud provider adapter.
pub struct LambdaLabs {
    client: Client,
    api_key: String,
    limiter: RateLimiter,
}

impl LambdaLabs {
    /// # Errors
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(api_key: impl Into<String>) -> Result<Self, AdapterError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            limiter: RateLimiter::new(RateLimits {
                requests_per_second: 2,
                burst: 5,
            }),
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
        let response = self.client.get(&url).bearer_auth(&self.api_key).send().await?;
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
                warn!(error = %e, body = %text, "failed to parse Lambda Cloud response");
                AdapterError::Serialization(e)
            })
        } else if status == StatusCode::NOT_FOUND {
            Err(AdapterError::NotFound(text))
        } else if status == StatusCode::TOO_MANY_REQUESTS {
            Err(AdapterError::RateLimited { retry_after_secs: 10 })
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

    fn to_state(status: &str) -> InstanceState {
        match status {
            "booting" => InstanceState::Pending,
            "active" => InstanceState::Running,
            "unhealthy" => InstanceState::Unknown,
            "terminating" => InstanceState::Terminating,
            "terminated" => InstanceState::Terminated,
            _ => InstanceState::Unknown,
        }
    }
}

#[async_trait]
impl ProviderAdapter for LambdaLabs {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            name: "lambdalabs",
            supports_spot: false,
        }
    }

    fn rate_limits(&self) -> RateLimits {
        RateLimits {
            requests_per_second: 2,
            burst: 5,
        }
    }

    async fn list_available_gpus(
        &self,
        filters: &OfferFilters,
        cancel: &CancellationToken,
    ) -> Result<Vec<GpuOffer>, AdapterError> {
        let response: InstanceTypesResponse = self.get("/instance-types", cancel).await?;
        let offers = response
            .data
            .into_values()
            .filter(|entry| entry.instance_type.name == filters.gpu_type)
            .flat_map(|entry| {
                let price = format!("{:.2}", entry.instance_type.price_cents_per_hour as f64 / 100.0);
                entry
                    .regions_with_capacity_available
                    .into_iter()
                    .map(move |region| GpuOffer {
                        offer_id: entry.instance_type.name.clone(),
                        provider: "lambdalabs".to_string(),
                        gpu_type: entry.instance_type.name.clone(),
                        gpu_count: 1,
                        region: region.name,
                        hourly_price: price.clone(),
                        spot_price: None,
                        memory_gb: entry.instance_type.specs.memory_gib,
                        storage_gb: entry.instance_type.specs.storage_gib,
                        is_spot: false,
                        available: true,
                    })
                    .collect::<Vec<_>>()
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
        let offer = self
            .list_available_gpus(&filters, cancel)
            .await?
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
            want_spot: false,
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

        let body = LaunchInstanceRequest {
            region_name: &request.region,
            instance_type_name: &offer.gpu_type,
            quantity: 1,
            file_system_names: vec![],
            user_data: &request.user_data,
        };
        let response: LaunchInstanceResponse = self.post("/instance-operations/launch", &body, cancel).await?;
        let instance_id = response
            .data
            .instance_ids
            .into_iter()
            .next()
            .ok_or_else(|| AdapterError::Permanent {
                status: 200,
                message: "launch response carried no instance id".to_string(),
            })?;
        Ok(LaunchedInstance {
            instance_id,
            hourly_price: offer.hourly_price,
        })
    }

    async fn get_instance_status(
        &self,
        instance_id: &str,
        cancel: &CancellationToken,
    ) -> Result<InstanceStatus, AdapterError> {
        let path = format!("/instances/{instance_id}");
        let response: InstanceResponse = match self.get(&path, cancel).await {
            Ok(response) => response,
            Err(AdapterError::NotFound(_)) => return Ok(InstanceStatus::vanished()),
            Err(e) => return Err(e),
        };
        Ok(InstanceStatus {
            state: Self::to_state(&response.data.status),
            public_ip: response.data.ip,
            private_ip: response.data.private_ip,
            updated_at: Utc::now(),
            message: None,
        })
    }

    async fn terminate_instance(
        &self,
        instance_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), AdapterError> {
        #[derive(Serialize)]
        struct TerminateRequest<'a> {
            instance_ids: Vec<&'a str>,
        }
        let body = TerminateRequest {
            instance_ids: vec![instance_id],
        };
        let result: Result<serde_json::Value, AdapterError> =
            self.post("/instance-operations/terminate", &body, cancel).await;
        match result {
            Ok(_) => Ok(()),
            Err(AdapterError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_maps_to_standard_state() {
        assert_eq!(LambdaLabs::to_state("active"), InstanceState::Running);
        assert_eq!(LambdaLabs::to_state("terminated"), InstanceState::Terminated);
        assert_eq!(LambdaLabs::to_state("something-new"), InstanceState::Unknown);
    }
}
