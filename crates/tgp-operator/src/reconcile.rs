//! The single reconcile loop for `GPURequest` objects.
//!
//! Mirrors the teacher's status-first, finalizer-wrapped reconcile shape
//! (`tasks::code::controller::reconcile_code_run`): a thin finalizer
//! wrapper dispatches to an apply path and a cleanup path, both of which
//! return a `kube::runtime::controller::Action` the outer `Controller` uses
//! to decide when to run again.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube::{Api, Resource, ResourceExt};
use rust_decimal::Decimal;
use serde_json::json;
use tgp_adapter::{LaunchRequest, ProviderAdapter};
use tgp_pricing::CacheKey;
use tgp_selector::{select_offer, SelectionCriteria};
use tgp_statemachine::{check_lifetime_and_idleness, decide, lifetime_requeue_hint, LaunchOutcome, Observation, RequeueHint, StatusEffect};
use tgp_types::{GPURequest, GPURequestStatus, OfferFilters, Phase};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::context::{Context, GPU_REQUEST_FINALIZER};
use crate::error::{ReconcileError, Result};

#[instrument(skip(ctx), fields(gpu_request = %obj.name_any()))]
pub async fn reconcile(obj: Arc<GPURequest>, ctx: Arc<Context>) -> Result<Action> {
    let api: Api<GPURequest> = Api::all(ctx.client.clone());

    let result = finalizer(&api, GPU_REQUEST_FINALIZER, obj, |event| async {
        match event {
            FinalizerEvent::Apply(obj) => reconcile_apply(&obj, &ctx).await,
            FinalizerEvent::Cleanup(obj) => reconcile_cleanup(&obj, &ctx).await,
        }
    })
    .await
    .map_err(|e| match e {
        kube::runtime::finalizer::Error::ApplyFailed(err) | kube::runtime::finalizer::Error::CleanupFailed(err) => err,
        kube::runtime::finalizer::Error::AddFinalizer(e) | kube::runtime::finalizer::Error::RemoveFinalizer(e) => {
            ReconcileError::Kube(e)
        }
        kube::runtime::finalizer::Error::UnnamedObject => ReconcileError::MissingObjectKey,
        kube::runtime::finalizer::Error::InvalidFinalizer => ReconcileError::Config("invalid finalizer name".to_string()),
    })?;

    Ok(result)
}

#[must_use]
pub fn error_policy(_obj: Arc<GPURequest>, error: &ReconcileError, ctx: Arc<Context>) -> Action {
    error!(error = %error, "reconcile failed, requeueing with backoff");
    Action::requeue(ctx.config.reconcile.max_backoff)
}

async fn reconcile_apply(obj: &GPURequest, ctx: &Context) -> Result<Action> {
    let name = obj.name_any();
    let status = obj.status.clone().unwrap_or_default();
    let cancel = CancellationToken::new();

    let max_lifetime = duration_or(obj.spec.max_lifetime.as_deref(), ctx.config.defaults.max_lifetime)?;
    let idle_timeout = duration_or(obj.spec.idle_timeout.as_deref(), ctx.config.defaults.idle_timeout)?;

    let observation = match status.phase {
        Phase::Pending => build_pending_observation(obj, ctx, &cancel).await?,
        Phase::Terminated | Phase::Failed => Observation {
            now: Utc::now(),
            idle_timeout,
            ..Default::default()
        },
        _ => build_running_observation(obj, &status, ctx, idle_timeout, &cancel).await?,
    };

    let mut decision = decide(status.phase, &observation, max_lifetime);

    // Lifetime/idleness is evaluated independently of the phase-transition
    // table since it can fire from any non-terminal phase once an instance
    // invariant holds, not just from Ready (§4.5).
    if status.phase.requires_instance() && decision.next_phase != Phase::Terminating && !decision.next_phase.is_terminal() {
        if let Some(condition) = check_lifetime_and_idleness(
            observation.now,
            parse_timestamp(status.termination_scheduled_at.as_deref()),
            parse_timestamp(status.last_heartbeat.as_deref()),
            idle_timeout,
        ) {
            decision.next_phase = Phase::Terminating;
            decision.effects.push(StatusEffect::PushCondition(condition));
            decision.requeue = RequeueHint::WatchOnly;
        } else if status.phase == Phase::Ready {
            decision.requeue = lifetime_requeue_hint(parse_timestamp(status.termination_scheduled_at.as_deref()));
        }
    }

    if status.phase == Phase::Terminating && matches!(decision.effects.first(), Some(StatusEffect::TerminateInstance)) {
        terminate_recorded_instance(&ctx.adapters, &status, &cancel).await?;
    }

    apply_status_effects(obj, &decision.effects, decision.next_phase, ctx).await?;

    info!(gpu_request = %name, phase = %decision.next_phase, "reconciled");

    Ok(match decision.requeue {
        RequeueHint::At(at) => {
            let delay = (at - observation.now).to_std().unwrap_or(StdDuration::ZERO);
            Action::requeue(delay)
        }
        RequeueHint::WatchOnly => Action::await_change(),
    })
}

async fn build_pending_observation(obj: &GPURequest, ctx: &Context, cancel: &CancellationToken) -> Result<Observation> {
    let now = Utc::now();
    let filters = OfferFilters {
        gpu_type: obj.spec.gpu_type.clone(),
        region: obj.spec.region.clone(),
        max_hourly_price: obj
            .spec
            .max_hourly_price
            .as_deref()
            .map(str::parse::<Decimal>)
            .transpose()
            .map_err(|_| ReconcileError::Config("max_hourly_price is not a valid decimal".to_string()))?,
        want_spot: obj.spec.spot,
    };

    let candidate_providers: Vec<&String> = match &obj.spec.provider {
        Some(wanted) => ctx.adapters.keys().filter(|name| *name == wanted).collect(),
        None => ctx.adapters.keys().collect(),
    };

    let mut offers = Vec::new();
    for provider_name in candidate_providers {
        let adapter = &ctx.adapters[provider_name];

        // Bound outbound traffic: skip listing a provider whose cached
        // normalized price is already over the ceiling.
        if let Some(ceiling) = filters.max_hourly_price {
            let region = filters.region.clone().unwrap_or_default();
            let key = CacheKey::new(provider_name.clone(), filters.gpu_type.clone(), region.clone());
            let quote = ctx
                .pricing
                .get(&key, || async {
                    adapter
                        .get_normalized_pricing(&filters.gpu_type, &region, cancel)
                        .await
                        .map_err(|e| e.to_string())
                })
                .await;
            match quote {
                Ok(pricing) if pricing.price_per_hour > ceiling => {
                    debug!(provider = %provider_name, "skipping provider over price ceiling");
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(provider = %provider_name, error = %e, "pricing lookup failed, listing anyway");
                }
            }
        }

        match adapter.list_available_gpus(&filters, cancel).await {
            Ok(found) => offers.extend(found),
            Err(e) => warn!(provider = %provider_name, error = %e, "failed to list offers"),
        }
    }

    let criteria = SelectionCriteria {
        filters,
        memory_floor_gb: 0,
        preferred_provider: obj.spec.provider.clone(),
    };

    let just_launched = match select_offer(&offers, &criteria) {
        Ok(offer) => {
            let adapter = &ctx.adapters[&offer.provider];
            let request = LaunchRequest {
                gpu_type: offer.gpu_type.clone(),
                region: offer.region.clone(),
                image_ref: offer.offer_id.clone(),
                user_data: obj.spec.bootstrap_config.clone().unwrap_or(json!({})),
                labels: HashMap::from([("tgp.io/gpu-request".to_string(), obj.name_any())]),
                spot: obj.spec.spot,
                max_price: criteria.filters.max_hourly_price,
            };
            let launched = adapter.launch_instance(&request, cancel).await?;
            Some(LaunchOutcome {
                provider: offer.provider.clone(),
                instance_id: launched.instance_id,
                hourly_price: launched.hourly_price,
            })
        }
        Err(_) => None,
    };

    let attempt = obj.status.as_ref().and_then(|s| s.pending_attempts).unwrap_or(0);

    Ok(Observation {
        now,
        just_launched,
        attempt,
        ..Default::default()
    })
}

async fn build_running_observation(
    obj: &GPURequest,
    status: &GPURequestStatus,
    ctx: &Context,
    idle_timeout: StdDuration,
    cancel: &CancellationToken,
) -> Result<Observation> {
    let now = Utc::now();
    let instance_status = match (&status.selected_provider, &status.instance_id) {
        (Some(provider), Some(instance_id)) => {
            let adapter = ctx
                .adapters
                .get(provider)
                .ok_or_else(|| ReconcileError::UnknownProvider(provider.clone()))?;
            Some(adapter.get_instance_status(instance_id, cancel).await?)
        }
        _ => None,
    };

    let (node_ready, node_name) = if status.phase == Phase::Joining || status.phase == Phase::Ready {
        lookup_node(ctx, &expected_node_name(status)).await?
    } else {
        (false, None)
    };

    Ok(Observation {
        now,
        instance_status,
        node_ready,
        node_name,
        idle_timeout,
        attempt: 0,
        deletion_requested: obj.meta().deletion_timestamp.is_some(),
        ..Default::default()
    })
}

fn expected_node_name(status: &GPURequestStatus) -> String {
    status
        .instance_id
        .as_deref()
        .map(|id| format!("gpu-{id}"))
        .unwrap_or_default()
}

async fn lookup_node(ctx: &Context, name: &str) -> Result<(bool, Option<String>)> {
    if name.is_empty() {
        return Ok((false, None));
    }
    let nodes: Api<Node> = Api::all(ctx.client.clone());
    match nodes.get_opt(name).await? {
        Some(node) => {
            let ready = node
                .status
                .and_then(|s| s.conditions)
                .unwrap_or_default()
                .into_iter()
                .any(|c| c.type_ == "Ready" && c.status == "True");
            Ok((ready, Some(name.to_string())))
        }
        None => Ok((false, None)),
    }
}

/// Deletion cleanup routes through the same `decide()`/`apply_status_effects`
/// pair as the apply path, so the deletion-requested transition in
/// `tgp_statemachine::decide` is the one code path both branches share
/// rather than a table entry the cleanup path bypasses. The finalizer
/// wrapper only gets one cleanup call before it strips the finalizer and the
/// object disappears, so termination itself stays unconditional here rather
/// than waiting on a future reconcile the way the apply path's Terminating
/// phase does.
async fn reconcile_cleanup(obj: &GPURequest, ctx: &Context) -> Result<Action> {
    let status = obj.status.clone().unwrap_or_default();
    let cancel = CancellationToken::new();

    let observation = Observation {
        now: Utc::now(),
        deletion_requested: true,
        ..Default::default()
    };
    let decision = decide(status.phase, &observation, StdDuration::ZERO);

    terminate_recorded_instance(&ctx.adapters, &status, &cancel).await?;
    apply_status_effects(obj, &decision.effects, decision.next_phase, ctx).await?;

    Ok(Action::await_change())
}

/// Terminates the instance recorded in `status`, if any. A no-op when the
/// status carries no instance (nothing was ever launched); errors if the
/// recorded provider has no registered adapter.
async fn terminate_recorded_instance(
    adapters: &crate::adapters::AdapterRegistry,
    status: &GPURequestStatus,
    cancel: &CancellationToken,
) -> Result<()> {
    let (Some(provider), Some(instance_id)) = (&status.selected_provider, &status.instance_id) else {
        return Ok(());
    };
    let adapter = adapters
        .get(provider)
        .ok_or_else(|| ReconcileError::UnknownProvider(provider.clone()))?;
    adapter.terminate_instance(instance_id, cancel).await?;
    Ok(())
}

async fn apply_status_effects(obj: &GPURequest, effects: &[StatusEffect], next_phase: Phase, ctx: &Context) -> Result<()> {
    let api: Api<GPURequest> = Api::all(ctx.client.clone());
    let name = obj.name_any();
    let mut status = obj.status.clone().unwrap_or_default();
    status.phase = next_phase;
    status.observed_generation = obj.meta().generation;

    for effect in effects {
        match effect {
            StatusEffect::RecordLaunch {
                provider,
                instance_id,
                hourly_price,
                provisioned_at,
                termination_scheduled_at,
            } => {
                status.selected_provider = Some(provider.clone());
                status.instance_id = Some(instance_id.clone());
                status.hourly_price = Some(hourly_price.clone());
                status.provisioned_at = Some(provisioned_at.to_rfc3339());
                status.termination_scheduled_at = termination_scheduled_at.map(|t| t.to_rfc3339());
            }
            StatusEffect::RecordAddresses { public_ip, private_ip } => {
                if public_ip.is_some() {
                    status.public_ip = public_ip.clone();
                }
                if private_ip.is_some() {
                    status.private_ip = private_ip.clone();
                }
            }
            StatusEffect::RecordNode { node_name } => {
                status.node_name = Some(node_name.clone());
            }
            StatusEffect::RefreshHeartbeat { at } => {
                status.last_heartbeat = Some(at.to_rfc3339());
            }
            StatusEffect::RecordPendingAttempts(count) => {
                status.pending_attempts = if *count == 0 { None } else { Some(*count) };
            }
            StatusEffect::PushCondition(condition) => {
                status.push_condition(condition.clone());
            }
            // Finalizer attach/detach is handled by the `finalizer()` wrapper
            // itself; these effects are informational only.
            StatusEffect::AttachFinalizer | StatusEffect::ClearFinalizer | StatusEffect::TerminateInstance => {}
        }
    }

    let patch = json!({ "status": status });
    api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

fn duration_or(spec_value: Option<&str>, default: StdDuration) -> Result<StdDuration> {
    match spec_value {
        Some(raw) => humantime::parse_duration(raw).map_err(|source| ReconcileError::InvalidDuration {
            value: raw.to_string(),
            source,
        }),
        None => Ok(default),
    }
}

fn parse_timestamp(raw: Option<&str>) -> Option<chrono::DateTime<Utc>> {
    raw.and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_or_parses_a_spec_override() {
        let result = duration_or(Some("45m"), StdDuration::from_secs(1)).unwrap();
        assert_eq!(result, StdDuration::from_secs(45 * 60));
    }

    #[test]
    fn duration_or_falls_back_to_default_when_unset() {
        let result = duration_or(None, StdDuration::from_secs(900)).unwrap();
        assert_eq!(result, StdDuration::from_secs(900));
    }

    #[test]
    fn duration_or_rejects_garbage() {
        assert!(duration_or(Some("not-a-duration"), StdDuration::from_secs(1)).is_err());
    }

    #[test]
    fn parse_timestamp_accepts_rfc3339_and_rejects_garbage() {
        assert!(parse_timestamp(Some("2026-01-01T00:00:00Z")).is_some());
        assert!(parse_timestamp(Some("not-a-timestamp")).is_none());
        assert!(parse_timestamp(None).is_none());
    }

    #[test]
    fn expected_node_name_is_derived_from_instance_id() {
        let status = GPURequestStatus {
            instance_id: Some("i-42".to_string()),
            ..Default::default()
        };
        assert_eq!(expected_node_name(&status), "gpu-i-42");
    }

    #[test]
    fn expected_node_name_is_empty_without_an_instance() {
        let status = GPURequestStatus::default();
        assert_eq!(expected_node_name(&status), "");
    }

    fn registry_with(name: &str, adapter: tgp_adapter::MockProviderAdapter) -> crate::adapters::AdapterRegistry {
        let mut registry = crate::adapters::AdapterRegistry::new();
        registry.insert(name.to_string(), Arc::new(adapter));
        registry
    }

    #[tokio::test]
    async fn terminate_recorded_instance_is_a_noop_without_an_instance_id() {
        let registry = crate::adapters::AdapterRegistry::new();
        let status = GPURequestStatus::default();
        let cancel = CancellationToken::new();
        assert!(terminate_recorded_instance(&registry, &status, &cancel).await.is_ok());
    }

    #[tokio::test]
    async fn terminate_recorded_instance_calls_the_matching_adapter() {
        let mut mock = tgp_adapter::MockProviderAdapter::new();
        mock.expect_terminate_instance()
            .withf(|id, _| id == "i-1")
            .times(1)
            .returning(|_, _| Box::pin(async { Ok(()) }));

        let registry = registry_with("runpod", mock);
        let status = GPURequestStatus {
            selected_provider: Some("runpod".to_string()),
            instance_id: Some("i-1".to_string()),
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        assert!(terminate_recorded_instance(&registry, &status, &cancel).await.is_ok());
    }

    #[tokio::test]
    async fn terminate_recorded_instance_errors_on_unregistered_provider() {
        let registry = crate::adapters::AdapterRegistry::new();
        let status = GPURequestStatus {
            selected_provider: Some("runpod".to_string()),
            instance_id: Some("i-1".to_string()),
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        let result = terminate_recorded_instance(&registry, &status, &cancel).await;
        assert!(matches!(result, Err(ReconcileError::UnknownProvider(_))));
    }

    #[tokio::test]
    async fn terminate_recorded_instance_propagates_adapter_errors() {
        let mut mock = tgp_adapter::MockProviderAdapter::new();
        mock.expect_terminate_instance()
            .returning(|_, _| Box::pin(async { Err(tgp_adapter::AdapterError::NotFound("i-1".to_string())) }));

        let registry = registry_with("runpod", mock);
        let status = GPURequestStatus {
            selected_provider: Some("runpod".to_string()),
            instance_id: Some("i-1".to_string()),
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        assert!(terminate_recorded_instance(&registry, &status, &cancel).await.is_err());
    }
}
