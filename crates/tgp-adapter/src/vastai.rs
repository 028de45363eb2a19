//! Vast.ai API client.
//!
//! API reference: <https://vast.ai/docs/api/>

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

const API_BASE_URL: &str = "https://console.vast.ai/api/v0";
const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Deserialize)]
struct VastOffer {
    id: u64,
    gpu_name: String,
    num_gpus: u32,
    geolocation: Option<String>,
    dph_total: f64,
    #[serde(default)]
    dph_base: Option<f64>,
    gpu_ram: u32,
    disk_space: f64,
    rentable: bool,
}

#[derive(Debug, Deserialize)]
struct SearchOffersResponse {
    offers: Vec<VastOffer>,
}

#[derive(Debug, Serialize)]
struct CreateInstanceRequest<'a> {
    client_id: &'a str,
    image: &'a str,
    onstart: &'a str,
}

#[derive(Debug, Deserialize)]
struct CreateInstanceResponse {
    new_contract: u64,
}

#[derive(Debug, Deserialize)]
struct InstanceResponse {
    instances: InstanceDetails,
}

#[derive(Debug, Deserialize)]
struct InstanceDetails {
    actual_status: Option<String>,
    public_ipaddr: Option<String>,
}

/// Vast.ai provider adapter.
pub struct VastAi {
    client: Client,
    api_key: String,
    limiter: RateLimiter,
}

impl VastAi {
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
                requests_per_second: 3,
                burst: 6,
            }),
        })
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<T, AdapterError> {
        self.limiter.acquire(cancel).await?;
        let url = format!("{API_BASE_URL}{path}?api_key={}", self.api_key);
        debug!(path = %path, "GET request");
        let response = self.client.get(&url).send().await?;
        Self::handle_response(response).await
    }

    async fn put<T: serde::de::DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
        cancel: &CancellationToken,
    ) -> Result<T, AdapterError> {
        self.limiter.acquire(cancel).await?;
        let url = format!("{API_BASE_URL}{path}?api_key={}", self.api_key);
        debug!(path = %path, "PUT request");
        let response = self.client.put(&url).json(body).send().await?;
        Self::handle_response(response).await
    }

    async fn delete(&self, path: &str, cancel: &CancellationToken) -> Result<(), AdapterError> {
        self.limiter.acquire(cancel).await?;
        let url = format!("{API_BASE_URL}{path}?api_key={}", self.api_key);
        debug!(path = %path, "DELETE request");
        let response = self.client.delete(&url).send().await?;
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

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, AdapterError> {
        let status = response.status();
        let text = response.text().await?;
        if status.is_success() {
            serde_json::from_str(&text).map_err(|e| {
                warn!(error = %e, body = %text, "failed to parse Vast.ai response");
                AdapterError::Serialization(e)
            })
        } else if status == StatusCode::NOT_FOUND {
            Err(AdapterError::NotFound(text))
        } else if status == StatusCode::TOO_MANY_REQUESTS {
            Err(AdapterError::RateLimited { retry_after_secs: 5 })
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

    fn to_offer(offer: VastOffer, want_spot: bool) -> GpuOffer {
        GpuOffer {
            offer_id: offer.id.to_string(),
            provider: "vastai".to_string(),
            gpu_type: offer.gpu_name,
            gpu_count: offer.num_gpus,
            region: offer.geolocation.unwrap_or_else(|| "unknown".to_string()),
            hourly_price: format!("{:.4}", offer.dph_base.unwrap_or(offer.dph_total)),
            spot_price: Some(format!("{:.4}", offer.dph_total)),
            memory_gb: offer.gpu_ram,
            storage_gb: offer.disk_space as u32,
            is_spot: want_spot,
            available: offer.rentable,
        }
    }

    fn to_state(actual_status: Option<&str>) -> InstanceState {
        match actual_status {
            Some("running") => InstanceState::Running,
            Some("loading") | Some("created") => InstanceState::Pending,
            Some("exited") => InstanceState::Terminated,
            None => InstanceState::Unknown,
            Some(_) => InstanceState::Unknown,
        }
    }
}

#[async_trait]
impl ProviderAdapter for VastAi {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            name: "vastai",
            supports_spot: true,
        }
    }

    fn rate_limits(&self) -> RateLimits {
        RateLimits {
            requests_per_second: 3,
            burst: 6,
        }
    }

    async fn list_available_gpus(
        &self,
        filters: &OfferFilters,
        cancel: &CancellationToken,
    ) -> Result<Vec<GpuOffer>, AdapterError> {
        let path = format!("/bundles/?gpu_name={}", filters.gpu_type);
        let response: SearchOffersResponse = self.get(&path, cancel).await?;
        let offers = response
            .offers
            .into_iter()
            .map(|o| Self::to_offer(o, filters.want_spot))
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

        let onstart = request.user_data.to_string();
        let body = CreateInstanceRequest {
            client_id: "me",
            image: &request.image_ref,
            onstart: &onstart,
        };
        let path = format!("/asks/{}/", offer.offer_id);
        let response: CreateInstanceResponse = self.put(&path, &body, cancel).await?;
        Ok(LaunchedInstance {
            instance_id: response.new_contract.to_string(),
            hourly_price: offer.hourly_price,
        })
    }

    async fn get_instance_status(
        &self,
        instance_id: &str,
        cancel: &CancellationToken,
    ) -> Result<InstanceStatus, AdapterError> {
        let path = format!("/instances/{instance_id}/");
        let response: InstanceResponse = match self.get(&path, cancel).await {
            Ok(response) => response,
            Err(AdapterError::NotFound(_)) => return Ok(InstanceStatus::vanished()),
            Err(e) => return Err(e),
        };
        Ok(InstanceStatus {
            state: Self::to_state(response.instances.actual_status.as_deref()),
            public_ip: response.instances.public_ipaddr,
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
        let path = format!("/instances/{instance_id}/");
        self.delete(&path, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actual_status_maps_to_standard_state() {
        assert_eq!(VastAi::to_state(Some("running")), InstanceState::Running);
        assert_eq!(VastAi::to_state(Some("exited")), InstanceState::Terminated);
        assert_eq!(VastAi::to_state(None), InstanceState::Unknown);
    }
}
