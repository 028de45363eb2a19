//! Pure phase-transition logic.
//!
//! Nothing here performs I/O: the reconciler gathers observations (adapter
//! status, node readiness, deletion markers) and hands them to [`decide`],
//! which returns the next phase plus the status fields/effects that follow
//! from it. This mirrors the teacher's separation between `ProvisionStep`
//! bookkeeping and the I/O that drives it in `metal::state`.

pub mod backoff;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tgp_adapter::{InstanceState, InstanceStatus};
use tgp_types::condition::reasons;
use tgp_types::{Condition, Phase};

pub use backoff::BackoffPolicy;

/// Fixed polling interval while steadily waiting on an instance that is
/// reporting unchanged state (§4.4's "fixed polling interval" for
/// Booting/Joining), before any adaptive extension.
pub const STEADY_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(15);

/// What the reconciler observed this pass, already adapted into standard
/// types; everything here is optional because not every phase needs every
/// observation.
#[derive(Debug, Clone, Default)]
pub struct Observation {
    pub now: DateTime<Utc>,
    pub deletion_requested: bool,
    /// Set once an offer has been chosen and launched this reconcile.
    pub just_launched: Option<LaunchOutcome>,
    pub instance_status: Option<InstanceStatus>,
    pub node_ready: bool,
    pub node_name: Option<String>,
    pub idle_timeout: std::time::Duration,
    /// Consecutive failed reconciles for this object, for backoff sizing.
    /// Reset to 0 on any phase-advancing transition.
    pub attempt: u32,
}

#[derive(Debug, Clone)]
pub struct LaunchOutcome {
    pub provider: String,
    pub instance_id: String,
    pub hourly_price: String,
}

/// A field the reconciler should persist as part of this transition's
/// two-phase status write (§4.6: status first, then side effects).
#[derive(Debug, Clone)]
pub enum StatusEffect {
    RecordLaunch {
        provider: String,
        instance_id: String,
        hourly_price: String,
        provisioned_at: DateTime<Utc>,
        termination_scheduled_at: Option<DateTime<Utc>>,
    },
    RecordAddresses {
        public_ip: Option<String>,
        private_ip: Option<String>,
    },
    RecordNode {
        node_name: String,
    },
    RefreshHeartbeat {
        at: DateTime<Utc>,
    },
    /// Persists the consecutive-no-offer counter; `0` clears it.
    RecordPendingAttempts(u32),
    PushCondition(Condition),
    AttachFinalizer,
    ClearFinalizer,
    /// The side effect of actually calling the adapter to tear the
    /// instance down; the reconciler performs this, the state machine only
    /// asks for it.
    TerminateInstance,
}

/// What the reconciler should do after a successful `decide` call.
#[derive(Debug, Clone, Copy)]
pub enum RequeueHint {
    /// Re-run at a fixed point in time (e.g. lifetime expiry, or the next
    /// backoff step).
    At(DateTime<Utc>),
    /// No explicit requeue; rely on the next watch event.
    WatchOnly,
}

#[derive(Debug, Clone)]
pub struct Decision {
    pub next_phase: Phase,
    pub effects: Vec<StatusEffect>,
    pub requeue: RequeueHint,
}

/// Computes the next phase and its effects from the current phase plus this
/// reconcile's observations. See the module-level transition table this
/// mirrors: `Pending -> Provisioning -> Booting -> Joining -> Ready ->
/// Terminating -> Terminated`, with `Failed` reachable from any non-terminal
/// phase and `Terminating` reachable from anywhere non-terminal on deletion.
#[must_use]
pub fn decide(current_phase: Phase, observation: &Observation, max_lifetime: std::time::Duration) -> Decision {
    if observation.deletion_requested && current_phase != Phase::Terminating && !current_phase.is_terminal() {
        return Decision {
            next_phase: Phase::Terminating,
            effects: vec![StatusEffect::PushCondition(Condition::new(
                "Terminating",
                reasons::DELETION_REQUESTED,
                "deletion requested by user",
            ))],
            requeue: RequeueHint::WatchOnly,
        };
    }

    match current_phase {
        Phase::Pending => decide_pending(observation, max_lifetime),
        Phase::Provisioning => decide_provisioning(observation),
        Phase::Booting => decide_booting(observation),
        Phase::Joining => decide_joining(observation),
        Phase::Ready => decide_ready(observation),
        Phase::Terminating => decide_terminating(observation),
        Phase::Terminated | Phase::Failed => Decision {
            next_phase: current_phase,
            effects: vec![],
            requeue: RequeueHint::WatchOnly,
        },
    }
}

fn decide_pending(observation: &Observation, max_lifetime: std::time::Duration) -> Decision {
    match &observation.just_launched {
        Some(outcome) => {
            let lifetime = ChronoDuration::from_std(max_lifetime).unwrap_or(ChronoDuration::zero());
            let termination_scheduled_at = Some(observation.now + lifetime);
            Decision {
                next_phase: Phase::Provisioning,
                effects: vec![
                    StatusEffect::AttachFinalizer,
                    StatusEffect::RecordLaunch {
                        provider: outcome.provider.clone(),
                        instance_id: outcome.instance_id.clone(),
                        hourly_price: outcome.hourly_price.clone(),
                        provisioned_at: observation.now,
                        termination_scheduled_at,
                    },
                    StatusEffect::RecordPendingAttempts(0),
                ],
                requeue: RequeueHint::WatchOnly,
            }
        }
        None => {
            let next_attempt = observation.attempt.saturating_add(1);
            let delay = BackoffPolicy::default().delay_for(next_attempt, 0.0);
            let delay = ChronoDuration::from_std(delay).unwrap_or(ChronoDuration::seconds(1));
            Decision {
                next_phase: Phase::Pending,
                effects: vec![
                    StatusEffect::PushCondition(Condition::new(
                        "Pending",
                        reasons::OFFER_NOT_FOUND,
                        "no eligible offer this reconcile",
                    )),
                    StatusEffect::RecordPendingAttempts(next_attempt),
                ],
                requeue: RequeueHint::At(observation.now + delay),
            }
        }
    }
}

fn decide_provisioning(observation: &Observation) -> Decision {
    match classify(observation) {
        Classified::Orphan => fail_on_orphan(),
        Classified::Failed(message) => fail(message),
        Classified::Status(status) => match status.state {
            InstanceState::Pending => Decision {
                next_phase: Phase::Provisioning,
                effects: vec![],
                requeue: RequeueHint::At(observation.now + steady_poll()),
            },
            InstanceState::Running if status.public_ip.is_none() => Decision {
                next_phase: Phase::Booting,
                effects: vec![],
                requeue: RequeueHint::At(observation.now + steady_poll()),
            },
            InstanceState::Running => Decision {
                next_phase: Phase::Booting,
                effects: vec![StatusEffect::RecordAddresses {
                    public_ip: status.public_ip.clone(),
                    private_ip: status.private_ip.clone(),
                }],
                requeue: RequeueHint::At(observation.now + steady_poll()),
            },
            _ => Decision {
                next_phase: Phase::Provisioning,
                effects: vec![],
                requeue: RequeueHint::At(observation.now + steady_poll()),
            },
        },
    }
}

fn steady_poll() -> ChronoDuration {
    ChronoDuration::from_std(STEADY_POLL_INTERVAL).unwrap_or(ChronoDuration::seconds(15))
}

fn decide_booting(observation: &Observation) -> Decision {
    match classify(observation) {
        Classified::Orphan => fail_on_orphan(),
        Classified::Failed(message) => fail(message),
        Classified::Status(status) if status.state == InstanceState::Running && status.public_ip.is_some() => {
            Decision {
                next_phase: Phase::Joining,
                effects: vec![StatusEffect::RecordAddresses {
                    public_ip: status.public_ip.clone(),
                    private_ip: status.private_ip.clone(),
                }],
                requeue: RequeueHint::At(observation.now + steady_poll()),
            }
        }
        _ => Decision {
            next_phase: Phase::Booting,
            effects: vec![],
            requeue: RequeueHint::At(observation.now + steady_poll()),
        },
    }
}

fn decide_joining(observation: &Observation) -> Decision {
    if observation.node_ready {
        let mut effects = vec![StatusEffect::RefreshHeartbeat { at: observation.now }];
        if let Some(node_name) = &observation.node_name {
            effects.push(StatusEffect::RecordNode {
                node_name: node_name.clone(),
            });
        }
        return Decision {
            next_phase: Phase::Ready,
            effects,
            requeue: RequeueHint::WatchOnly,
        };
    }
    Decision {
        next_phase: Phase::Joining,
        effects: vec![],
        requeue: RequeueHint::At(observation.now + steady_poll()),
    }
}

fn decide_ready(observation: &Observation) -> Decision {
    if observation.node_ready {
        return Decision {
            next_phase: Phase::Ready,
            effects: vec![StatusEffect::RefreshHeartbeat { at: observation.now }],
            requeue: RequeueHint::WatchOnly,
        };
    }
    Decision {
        next_phase: Phase::Ready,
        effects: vec![],
        requeue: RequeueHint::WatchOnly,
    }
}

/// Separately callable so the reconciler can evaluate lifetime/idle expiry
/// against the persisted status without re-deriving `Observation` (§4.5).
#[must_use]
pub fn check_lifetime_and_idleness(
    now: DateTime<Utc>,
    termination_scheduled_at: Option<DateTime<Utc>>,
    last_heartbeat: Option<DateTime<Utc>>,
    idle_timeout: std::time::Duration,
) -> Option<Condition> {
    if let Some(scheduled) = termination_scheduled_at {
        if now >= scheduled {
            return Some(Condition::new(
                "Terminating",
                reasons::LIFETIME_EXPIRED,
                "max_lifetime elapsed",
            ));
        }
    }
    if let Some(heartbeat) = last_heartbeat {
        let idle = ChronoDuration::from_std(idle_timeout).unwrap_or(ChronoDuration::zero());
        if now - heartbeat > idle {
            return Some(Condition::new(
                "Terminating",
                reasons::IDLE_TIMEOUT,
                "no heartbeat within idle_timeout",
            ));
        }
    }
    None
}

/// When an object is `Ready` and not yet due for termination, the
/// reconciler should requeue exactly at `termination_scheduled_at` rather
/// than poll (§4.5's "schedule a requeue at that time").
#[must_use]
pub fn lifetime_requeue_hint(termination_scheduled_at: Option<DateTime<Utc>>) -> RequeueHint {
    match termination_scheduled_at {
        Some(at) => RequeueHint::At(at),
        None => RequeueHint::WatchOnly,
    }
}

fn decide_terminating(observation: &Observation) -> Decision {
    match &observation.instance_status {
        Some(status) if matches!(status.state, InstanceState::Terminated | InstanceState::Unknown) => Decision {
            next_phase: Phase::Terminated,
            effects: vec![StatusEffect::ClearFinalizer],
            requeue: RequeueHint::WatchOnly,
        },
        _ => Decision {
            next_phase: Phase::Terminating,
            effects: vec![StatusEffect::TerminateInstance],
            requeue: RequeueHint::WatchOnly,
        },
    }
}

enum Classified<'a> {
    Status(&'a InstanceStatus),
    Orphan,
    Failed(String),
}

fn classify(observation: &Observation) -> Classified<'_> {
    match &observation.instance_status {
        Some(status) if status.state == InstanceState::Failed => {
            Classified::Failed(status.message.clone().unwrap_or_else(|| "adapter reported Failed".to_string()))
        }
        Some(status) if status.state == InstanceState::Unknown => Classified::Orphan,
        Some(status) => Classified::Status(status),
        None => Classified::Orphan,
    }
}

fn fail(message: String) -> Decision {
    Decision {
        next_phase: Phase::Failed,
        effects: vec![StatusEffect::PushCondition(Condition::new(
            "Failed",
            reasons::PROVIDER_PERMANENT,
            message,
        ))],
        requeue: RequeueHint::WatchOnly,
    }
}

fn fail_on_orphan() -> Decision {
    Decision {
        next_phase: Phase::Failed,
        effects: vec![StatusEffect::PushCondition(Condition::new(
            "Failed",
            reasons::ORPHAN_INSTANCE,
            "instance_id set but adapter reports Unknown/not-found; operator must intervene",
        ))],
        requeue: RequeueHint::WatchOnly,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn pending_without_launch_stays_pending() {
        let observation = Observation {
            now: now(),
            ..Default::default()
        };
        let decision = decide(Phase::Pending, &observation, std::time::Duration::from_secs(3600));
        assert_eq!(decision.next_phase, Phase::Pending);
    }

    #[test]
    fn pending_without_launch_escalates_backoff_with_attempt_count() {
        let first = decide(
            Phase::Pending,
            &Observation {
                now: now(),
                attempt: 0,
                ..Default::default()
            },
            std::time::Duration::from_secs(3600),
        );
        let second = decide(
            Phase::Pending,
            &Observation {
                now: now(),
                attempt: 1,
                ..Default::default()
            },
            std::time::Duration::from_secs(3600),
        );
        let delay_of = |decision: &Decision| match decision.requeue {
            RequeueHint::At(at) => at - now(),
            RequeueHint::WatchOnly => panic!("expected a timed requeue"),
        };
        assert!(delay_of(&second) > delay_of(&first));
        assert!(first
            .effects
            .iter()
            .any(|e| matches!(e, StatusEffect::RecordPendingAttempts(1))));
        assert!(second
            .effects
            .iter()
            .any(|e| matches!(e, StatusEffect::RecordPendingAttempts(2))));
    }

    #[test]
    fn pending_with_launch_moves_to_provisioning_and_schedules_termination() {
        let observation = Observation {
            now: now(),
            just_launched: Some(LaunchOutcome {
                provider: "runpod".to_string(),
                instance_id: "i-1".to_string(),
                hourly_price: "0.50".to_string(),
            }),
            ..Default::default()
        };
        let decision = decide(Phase::Pending, &observation, std::time::Duration::from_secs(3600));
        assert_eq!(decision.next_phase, Phase::Provisioning);
        let launch_effect = decision
            .effects
            .iter()
            .find_map(|e| match e {
                StatusEffect::RecordLaunch {
                    termination_scheduled_at,
                    provisioned_at,
                    ..
                } => Some((*provisioned_at, *termination_scheduled_at)),
                _ => None,
            })
            .unwrap();
        assert_eq!(launch_effect.1, Some(launch_effect.0 + ChronoDuration::hours(1)));
    }

    #[test]
    fn running_with_ip_moves_provisioning_through_to_joining() {
        let running_status = InstanceStatus {
            state: InstanceState::Running,
            public_ip: Some("1.2.3.4".to_string()),
            private_ip: None,
            updated_at: now(),
            message: None,
        };
        let observation = Observation {
            now: now(),
            instance_status: Some(running_status.clone()),
            ..Default::default()
        };
        let provisioning_decision = decide(Phase::Provisioning, &observation, std::time::Duration::from_secs(3600));
        assert_eq!(provisioning_decision.next_phase, Phase::Booting);

        let booting_decision = decide(Phase::Booting, &observation, std::time::Duration::from_secs(3600));
        assert_eq!(booting_decision.next_phase, Phase::Joining);
    }

    #[test]
    fn unknown_status_in_provisioning_is_an_orphan() {
        let observation = Observation {
            now: now(),
            instance_status: Some(InstanceStatus {
                state: InstanceState::Unknown,
                public_ip: None,
                private_ip: None,
                updated_at: now(),
                message: None,
            }),
            ..Default::default()
        };
        let decision = decide(Phase::Provisioning, &observation, std::time::Duration::from_secs(3600));
        assert_eq!(decision.next_phase, Phase::Failed);
    }

    #[test]
    fn missing_status_in_ready_is_not_treated_as_orphan() {
        let observation = Observation {
            now: now(),
            node_ready: true,
            ..Default::default()
        };
        let decision = decide(Phase::Ready, &observation, std::time::Duration::from_secs(3600));
        assert_eq!(decision.next_phase, Phase::Ready);
    }

    #[test]
    fn deletion_request_moves_any_non_terminal_phase_to_terminating() {
        let observation = Observation {
            now: now(),
            deletion_requested: true,
            ..Default::default()
        };
        for phase in [Phase::Pending, Phase::Provisioning, Phase::Ready, Phase::Failed] {
            let decision = decide(phase, &observation, std::time::Duration::from_secs(3600));
            if phase == Phase::Failed {
                assert_eq!(decision.next_phase, Phase::Failed);
            } else {
                assert_eq!(decision.next_phase, Phase::Terminating);
            }
        }
    }

    #[test]
    fn terminating_with_terminated_instance_clears_finalizer() {
        let observation = Observation {
            now: now(),
            instance_status: Some(InstanceStatus {
                state: InstanceState::Terminated,
                public_ip: None,
                private_ip: None,
                updated_at: now(),
                message: None,
            }),
            ..Default::default()
        };
        let decision = decide(Phase::Terminating, &observation, std::time::Duration::from_secs(3600));
        assert_eq!(decision.next_phase, Phase::Terminated);
        assert!(matches!(decision.effects[0], StatusEffect::ClearFinalizer));
    }

    #[test]
    fn lifetime_expiry_requests_termination() {
        let scheduled = now() - ChronoDuration::seconds(1);
        let condition = check_lifetime_and_idleness(now(), Some(scheduled), None, std::time::Duration::from_secs(1800));
        assert!(condition.is_some());
        assert_eq!(condition.unwrap().reason, reasons::LIFETIME_EXPIRED);
    }

    #[test]
    fn stale_heartbeat_requests_termination() {
        let heartbeat = now() - ChronoDuration::hours(1);
        let condition = check_lifetime_and_idleness(now(), None, Some(heartbeat), std::time::Duration::from_secs(1800));
        assert!(condition.is_some());
        assert_eq!(condition.unwrap().reason, reasons::IDLE_TIMEOUT);
    }

    #[test]
    fn fresh_heartbeat_within_budget_does_not_terminate() {
        let heartbeat = now() - ChronoDuration::minutes(5);
        let condition = check_lifetime_and_idleness(now(), None, Some(heartbeat), std::time::Duration::from_secs(1800));
        assert!(condition.is_none());
    }

    #[test]
    fn lifetime_requeue_hint_targets_the_scheduled_time() {
        let scheduled = now() + ChronoDuration::hours(1);
        match lifetime_requeue_hint(Some(scheduled)) {
            RequeueHint::At(at) => assert_eq!(at, scheduled),
            RequeueHint::WatchOnly => panic!("expected a timed requeue"),
        }
        assert!(matches!(lifetime_requeue_hint(None), RequeueHint::WatchOnly));
    }

    proptest::proptest! {
        #[test]
        fn decide_is_deterministic_for_arbitrary_phase_and_attempt(
            attempt in 0u32..50,
            deletion_requested in proptest::bool::ANY,
        ) {
            let observation = Observation {
                now: now(),
                attempt,
                deletion_requested,
                ..Default::default()
            };
            for phase in [
                Phase::Pending,
                Phase::Provisioning,
                Phase::Booting,
                Phase::Joining,
                Phase::Ready,
                Phase::Terminating,
                Phase::Terminated,
                Phase::Failed,
            ] {
                let first = decide(phase, &observation, std::time::Duration::from_secs(3600));
                let second = decide(phase, &observation, std::time::Duration::from_secs(3600));
                proptest::prop_assert_eq!(first.next_phase, second.next_phase);
            }
        }
    }
}
