//! NDA machine.
//!
//! Draft → Pending → Viewed → Signed → Active → Expired, with Rejected
//! as the decline terminal. Out of Draft the request is risk-scored and
//! routed: low risk auto-approves straight to signature, medium risk
//! waits on the pitch creator (≤ 72 h), high risk or a forced review
//! waits on legal (≤ 48 h). Signature webhooks arrive as a single
//! `envelope-status` event; Active sleeps until the access expiry.

use super::{DealMachine, MachineEnv, NextAction, StepCall, decoded};
use crate::error::EngineError;
use crate::providers::{Channel, DealRow, Notification, Priority};
use crate::risk;
use chrono::{DateTime, Duration, Months, Utc};
use greenlight_types::{
    CompensationOp, DomainState, EventName, FailedStep, InstanceState, NdaParams, NdaState,
    Payload, RiskAssessment, RiskFactors, RiskRoute, StepError, StepName, TemplateComplexity,
    WorkflowKind,
};
use serde::{Deserialize, Serialize};

const VALIDATE_REQUEST: &str = "validate-request";
const ASSESS_RISK: &str = "assess-risk";
const NOTIFY_REVIEWER: &str = "notify-reviewer";
const SEND_FOR_SIGNATURE: &str = "send-for-signature";
const GRANT_PITCH_ACCESS: &str = "grant-pitch-access";
const REVOKE_PITCH_ACCESS: &str = "revoke-pitch-access";

const CREATOR_REVIEW: &str = "creator-review";
const LEGAL_REVIEW: &str = "legal-review";
const ENVELOPE_STATUS: &str = "envelope-status";

#[derive(Debug, Serialize, Deserialize)]
struct RequestValidated {
    template_complexity: TemplateComplexity,
    clause_count: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct RiskAssessed {
    factors: RiskFactors,
    assessment: RiskAssessment,
}

#[derive(Debug, Serialize, Deserialize)]
struct EnvelopeSent {
    envelope_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct AccessGranted {
    expires_at: DateTime<Utc>,
}

pub struct NdaMachine;

impl NdaMachine {
    fn params<'a>(&self, state: &'a InstanceState) -> Result<&'a NdaParams, EngineError> {
        match &state.start.params {
            greenlight_types::StartParams::Nda(p) => Ok(p),
            other => Err(EngineError::Corrupted(format!(
                "nda machine driving {} parameters",
                other.kind()
            ))),
        }
    }

    fn validate_request(&self, params: &NdaParams, env: &MachineEnv) -> StepCall {
        let templates = env.providers.templates.clone();
        let entities = env.providers.entities.clone();
        let instance = env.instance;
        let params = params.clone();
        let now = env.now;
        StepCall::new(VALIDATE_REQUEST, move || {
            let templates = templates.clone();
            let entities = entities.clone();
            let params = params.clone();
            async move {
                // Unknown templates score as custom.
                let template = templates.get_template(&params.template_id).await?;
                let (complexity, clause_count) = template
                    .map(|t| (t.complexity, t.clause_count))
                    .unwrap_or((TemplateComplexity::Custom, 0));
                entities
                    .upsert_deal(DealRow {
                        deal_id: instance.full_hex(),
                        instance,
                        kind: WorkflowKind::Nda,
                        pitch_id: params.pitch_id.clone(),
                        party_id: params.requester_id.clone(),
                        state: "Draft".to_string(),
                        exclusivity_expires_at: None,
                        created_at: now,
                    })
                    .await?;
                Payload::encode(&RequestValidated {
                    template_complexity: complexity,
                    clause_count,
                })
                .map_err(|e| StepError::fatal(e.to_string()))
            }
        })
        .compensate(CompensationOp::CancelDealRecord {
            deal_id: env.instance.full_hex(),
        })
    }

    fn assess_risk(
        &self,
        validated: RequestValidated,
        params: &NdaParams,
        env: &MachineEnv,
    ) -> StepCall {
        let entities = env.providers.entities.clone();
        let params = params.clone();
        StepCall::new(ASSESS_RISK, move || {
            let entities = entities.clone();
            let params = params.clone();
            let complexity = validated.template_complexity;
            async move {
                let user = entities.get_user(&params.requester_id).await?;
                let history = entities.nda_history(&params.requester_id).await?;
                let factors = RiskFactors {
                    email_verified: user.email_verified,
                    phone_verified: user.phone_verified,
                    identity_verified: user.identity_verified,
                    account_age_days: user.account_age_days,
                    trust_score: user.trust_score,
                    template: complexity,
                    custom_terms: params.custom_terms.len() as u32,
                    duration_months: params.duration_months,
                    territorial_restrictions: params.territorial_restrictions.len() as u32,
                    prior_breaches: history.prior_breaches,
                    prior_disputes: history.prior_disputes,
                };
                let assessment = risk::assess(&factors);
                Payload::encode(&RiskAssessed {
                    factors,
                    assessment,
                })
                .map_err(|e| StepError::fatal(e.to_string()))
            }
        })
    }

    fn notify_reviewer(&self, route: RiskRoute, params: &NdaParams, env: &MachineEnv) -> StepCall {
        let notifications = env.providers.notifications.clone();
        let recipient = match route {
            RiskRoute::LegalReview => "legal-team".to_string(),
            _ => params.creator_id.clone(),
        };
        StepCall::new(NOTIFY_REVIEWER, move || {
            let notifications = notifications.clone();
            let recipient = recipient.clone();
            async move {
                notifications
                    .enqueue(Notification {
                        kind: "nda_review_requested".to_string(),
                        recipient_id: recipient.clone(),
                        channels: vec![Channel::Email, Channel::InApp],
                        priority: Priority::High,
                    })
                    .await?;
                Ok(Payload::null())
            }
        })
    }

    fn send_for_signature(&self, params: &NdaParams, env: &MachineEnv) -> StepCall {
        let signatures = env.providers.signatures.clone();
        let key = env.idempotency_key(SEND_FOR_SIGNATURE);
        let params = params.clone();
        let instance = env.instance;
        StepCall::new(SEND_FOR_SIGNATURE, move || {
            let signatures = signatures.clone();
            let key = key.clone();
            let params = params.clone();
            async move {
                let envelope_id = signatures
                    .create_envelope(
                        &key,
                        &params.template_id,
                        vec![params.requester_email.clone(), params.creator_id.clone()],
                        Payload::from_value(serde_json::json!({
                            "instance": instance.full_hex(),
                            "pitch_id": params.pitch_id,
                        })),
                    )
                    .await?;
                Payload::encode(&EnvelopeSent { envelope_id })
                    .map_err(|e| StepError::fatal(e.to_string()))
            }
        })
        .compensate(CompensationOp::VoidEnvelope {
            envelope_step: StepName::new(SEND_FOR_SIGNATURE),
        })
    }

    fn grant_pitch_access(&self, params: &NdaParams, env: &MachineEnv) -> StepCall {
        let entities = env.providers.entities.clone();
        let notifications = env.providers.notifications.clone();
        let params = params.clone();
        let compensate_params = params.clone();
        let deal_id = env.instance.full_hex();
        // Computed once here and memoized with the output, so the expiry
        // is identical on every replay.
        let expires_at = env
            .now
            .checked_add_months(Months::new(params.duration_months))
            .unwrap_or(env.now + Duration::days(30 * params.duration_months as i64));
        StepCall::new(GRANT_PITCH_ACCESS, move || {
            let entities = entities.clone();
            let notifications = notifications.clone();
            let params = params.clone();
            let deal_id = deal_id.clone();
            async move {
                entities
                    .grant_pitch_access(&params.pitch_id, &params.requester_id, expires_at)
                    .await?;
                entities.update_deal_state(&deal_id, "Active").await?;
                notifications
                    .enqueue(Notification {
                        kind: "nda_active".to_string(),
                        recipient_id: params.requester_id.clone(),
                        channels: vec![Channel::Email, Channel::InApp],
                        priority: Priority::Normal,
                    })
                    .await?;
                Payload::encode(&AccessGranted { expires_at })
                    .map_err(|e| StepError::fatal(e.to_string()))
            }
        })
        .compensate(CompensationOp::RevokePitchAccess {
            pitch_id: compensate_params.pitch_id.clone(),
            party_id: compensate_params.requester_id.clone(),
        })
    }

    fn revoke_pitch_access(&self, params: &NdaParams, env: &MachineEnv) -> StepCall {
        let entities = env.providers.entities.clone();
        let notifications = env.providers.notifications.clone();
        let params = params.clone();
        let deal_id = env.instance.full_hex();
        StepCall::new(REVOKE_PITCH_ACCESS, move || {
            let entities = entities.clone();
            let notifications = notifications.clone();
            let params = params.clone();
            let deal_id = deal_id.clone();
            async move {
                entities
                    .revoke_pitch_access(&params.pitch_id, &params.requester_id)
                    .await?;
                entities.update_deal_state(&deal_id, "Expired").await?;
                notifications
                    .enqueue(Notification {
                        kind: "nda_expired".to_string(),
                        recipient_id: params.requester_id.clone(),
                        channels: vec![Channel::Email],
                        priority: Priority::Low,
                    })
                    .await?;
                Ok(Payload::null())
            }
        })
    }

    fn transition(&self, to: NdaState) -> NextAction {
        NextAction::Transition {
            to: DomainState::Nda(to),
        }
    }

    fn review_gate(
        &self,
        route: RiskRoute,
        state: &InstanceState,
        params: &NdaParams,
        env: &MachineEnv,
    ) -> Result<NextAction, EngineError> {
        let (wait_name, window) = match route {
            RiskRoute::CreatorReview => (CREATOR_REVIEW, Duration::hours(72)),
            _ => (LEGAL_REVIEW, Duration::hours(48)),
        };
        if state.memo_output(&StepName::new(NOTIFY_REVIEWER)).is_none() {
            return Ok(NextAction::RunStep(self.notify_reviewer(route, params, env)));
        }
        let Some(outcome) = state.last_wait_for(&EventName::new(wait_name)) else {
            return Ok(NextAction::Wait {
                name: EventName::new(wait_name),
                filter: None,
                deadline: Some(env.now + window),
            });
        };
        if outcome.is_timeout() {
            return Ok(self.transition(NdaState::Rejected {
                reason: "review window elapsed".to_string(),
            }));
        }
        match outcome.payload().and_then(|p| p.str_field("decision")) {
            Some("approve") => {
                if decoded::<EnvelopeSent>(state, &StepName::new(SEND_FOR_SIGNATURE))?.is_none() {
                    return Ok(NextAction::RunStep(self.send_for_signature(params, env)));
                }
                Ok(self.transition(NdaState::Pending { route }))
            }
            _ => Ok(self.transition(NdaState::Rejected {
                reason: "review rejected".to_string(),
            })),
        }
    }

    fn on_envelope_status(
        &self,
        state: &InstanceState,
        from_pending: bool,
    ) -> Result<Option<NextAction>, EngineError> {
        let Some(outcome) = state.last_wait_for(&EventName::new(ENVELOPE_STATUS)) else {
            return Ok(None);
        };
        let status = outcome.payload().and_then(|p| p.str_field("status"));
        Ok(match status {
            Some("delivered") if from_pending => Some(self.transition(NdaState::Viewed)),
            Some("completed") => Some(self.transition(NdaState::Signed)),
            Some("declined") | Some("voided") => Some(self.transition(NdaState::Rejected {
                reason: format!("envelope {}", status.unwrap_or("closed")),
            })),
            // `sent` (and a redundant `delivered` at Viewed) re-waits.
            _ => Some(NextAction::Wait {
                name: EventName::new(ENVELOPE_STATUS),
                filter: None,
                deadline: None,
            }),
        })
    }
}

impl DealMachine for NdaMachine {
    fn kind(&self) -> WorkflowKind {
        WorkflowKind::Nda
    }

    fn next_action(
        &self,
        state: &InstanceState,
        env: &MachineEnv,
    ) -> Result<NextAction, EngineError> {
        let params = self.params(state)?;
        let DomainState::Nda(current) = &state.state else {
            return Err(EngineError::Corrupted(format!(
                "nda machine driving state {}",
                state.state
            )));
        };

        match current {
            NdaState::Draft => {
                let Some(validated) =
                    decoded::<RequestValidated>(state, &StepName::new(VALIDATE_REQUEST))?
                else {
                    return Ok(NextAction::RunStep(self.validate_request(params, env)));
                };
                let Some(assessed) = decoded::<RiskAssessed>(state, &StepName::new(ASSESS_RISK))?
                else {
                    return Ok(NextAction::RunStep(self.assess_risk(validated, params, env)));
                };
                match assessed.assessment.route() {
                    RiskRoute::Auto => {
                        if decoded::<EnvelopeSent>(state, &StepName::new(SEND_FOR_SIGNATURE))?
                            .is_none()
                        {
                            return Ok(NextAction::RunStep(self.send_for_signature(params, env)));
                        }
                        Ok(self.transition(NdaState::Pending {
                            route: RiskRoute::Auto,
                        }))
                    }
                    route => self.review_gate(route, state, params, env),
                }
            }

            NdaState::Pending { .. } => {
                match self.on_envelope_status(state, true)? {
                    Some(action) => Ok(action),
                    None => Ok(NextAction::Wait {
                        name: EventName::new(ENVELOPE_STATUS),
                        filter: None,
                        deadline: None,
                    }),
                }
            }

            NdaState::Viewed => match self.on_envelope_status(state, false)? {
                Some(action) => Ok(action),
                None => Ok(NextAction::Wait {
                    name: EventName::new(ENVELOPE_STATUS),
                    filter: None,
                    deadline: None,
                }),
            },

            NdaState::Signed => {
                let Some(granted) =
                    decoded::<AccessGranted>(state, &StepName::new(GRANT_PITCH_ACCESS))?
                else {
                    return Ok(NextAction::RunStep(self.grant_pitch_access(params, env)));
                };
                Ok(self.transition(NdaState::Active {
                    expires_at: granted.expires_at,
                }))
            }

            NdaState::Active { expires_at } => {
                if !state.sleep_fired {
                    return Ok(NextAction::Sleep { until: *expires_at });
                }
                if state
                    .memo_output(&StepName::new(REVOKE_PITCH_ACCESS))
                    .is_none()
                {
                    return Ok(NextAction::RunStep(self.revoke_pitch_access(params, env)));
                }
                Ok(self.transition(NdaState::Expired))
            }

            NdaState::Expired | NdaState::Rejected { .. } => Ok(NextAction::Complete),
        }
    }

    fn on_domain_failure(
        &self,
        _state: &InstanceState,
        failed: &FailedStep,
    ) -> Result<NextAction, EngineError> {
        Ok(NextAction::Transition {
            to: DomainState::Nda(NdaState::Rejected {
                reason: format!("step '{}' failed: {}", failed.step, failed.error.message),
            }),
        })
    }

    fn abort_state(&self, reason: &str) -> DomainState {
        DomainState::Nda(NdaState::Rejected {
            reason: reason.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{
        MemoryDocumentStore, MemoryEntityStore, MemoryNotificationSink, MemoryPaymentProvider,
        MemorySignatureProvider, MemoryTemplateStore, NullNotifier, ProviderSet,
    };
    use greenlight_types::{
        FulfilledWait, InstanceId, RequesterType, RiskLevel, StartInfo, StartParams, WaitOutcome,
    };
    use std::sync::Arc;

    fn env() -> MachineEnv {
        MachineEnv {
            instance: InstanceId::derive(WorkflowKind::Nda, "nda-machine-test"),
            now: Utc::now(),
            providers: ProviderSet {
                entities: Arc::new(MemoryEntityStore::new()),
                documents: Arc::new(MemoryDocumentStore::new()),
                templates: Arc::new(MemoryTemplateStore::new()),
                payments: Arc::new(MemoryPaymentProvider::new()),
                signatures: Arc::new(MemorySignatureProvider::new()),
                notifications: Arc::new(MemoryNotificationSink::new()),
                peers: Arc::new(NullNotifier),
            },
        }
    }

    fn state_in(nda_state: NdaState) -> InstanceState {
        let mut state = InstanceState::new(StartInfo {
            kind: WorkflowKind::Nda,
            params: StartParams::Nda(NdaParams {
                requester_id: "req-1".into(),
                requester_type: RequesterType::Investor,
                requester_email: "req@example.com".into(),
                pitch_id: "pitch-1".into(),
                creator_id: "cre-1".into(),
                template_id: "standard".into(),
                duration_months: 24,
                custom_terms: vec![],
                territorial_restrictions: vec![],
            }),
            client_token: "nda-machine-test".into(),
        });
        state.state = DomainState::Nda(nda_state);
        state
    }

    fn with_memo(mut state: InstanceState, step: &str, value: serde_json::Value) -> InstanceState {
        state
            .memo
            .insert(StepName::new(step), Payload::from_value(value));
        state
    }

    fn with_assessment(state: InstanceState, score: u32, requires_review: bool) -> InstanceState {
        let level = if requires_review || score >= 80 {
            RiskLevel::High
        } else if score >= 40 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        };
        let state = with_memo(
            state,
            VALIDATE_REQUEST,
            serde_json::json!({"template_complexity": "standard", "clause_count": 12}),
        );
        with_memo(
            state,
            ASSESS_RISK,
            serde_json::json!({
                "factors": {
                    "email_verified": true, "phone_verified": true,
                    "identity_verified": true, "account_age_days": 365,
                    "trust_score": 90, "template": "standard",
                    "custom_terms": 0, "duration_months": 24,
                    "territorial_restrictions": 0, "prior_breaches": 0,
                    "prior_disputes": 0
                },
                "assessment": {
                    "score": score, "level": level, "requires_review": requires_review
                }
            }),
        )
    }

    fn with_wait(mut state: InstanceState, name: &str, payload: serde_json::Value) -> InstanceState {
        state.last_wait = Some(FulfilledWait {
            name: EventName::new(name),
            outcome: WaitOutcome::Event {
                payload: Payload::from_value(payload),
            },
        });
        state
    }

    fn expect_transition(action: NextAction) -> NdaState {
        match action {
            NextAction::Transition {
                to: DomainState::Nda(s),
            } => s,
            other => panic!("expected transition, got {other:?}"),
        }
    }

    #[test]
    fn low_risk_auto_approves_to_signature() {
        let machine = NdaMachine;
        let state = with_assessment(state_in(NdaState::Draft), 10, false);
        match machine.next_action(&state, &env()).unwrap() {
            NextAction::RunStep(call) => assert_eq!(call.name.as_str(), SEND_FOR_SIGNATURE),
            other => panic!("expected signature step, got {other:?}"),
        }

        let sent = with_memo(
            state,
            SEND_FOR_SIGNATURE,
            serde_json::json!({"envelope_id": "env_1"}),
        );
        let next = expect_transition(machine.next_action(&sent, &env()).unwrap());
        assert_eq!(
            next,
            NdaState::Pending {
                route: RiskRoute::Auto
            }
        );
    }

    #[test]
    fn medium_risk_waits_on_creator_review() {
        let machine = NdaMachine;
        let state = with_memo(
            with_assessment(state_in(NdaState::Draft), 45, false),
            NOTIFY_REVIEWER,
            serde_json::Value::Null,
        );
        match machine.next_action(&state, &env()).unwrap() {
            NextAction::Wait { name, deadline, .. } => {
                assert_eq!(name.as_str(), CREATOR_REVIEW);
                assert!(deadline.is_some());
            }
            other => panic!("expected creator review wait, got {other:?}"),
        }
    }

    #[test]
    fn forced_review_routes_to_legal_even_at_low_score() {
        let machine = NdaMachine;
        let state = with_memo(
            with_assessment(state_in(NdaState::Draft), 30, true),
            NOTIFY_REVIEWER,
            serde_json::Value::Null,
        );
        match machine.next_action(&state, &env()).unwrap() {
            NextAction::Wait { name, .. } => assert_eq!(name.as_str(), LEGAL_REVIEW),
            other => panic!("expected legal review wait, got {other:?}"),
        }
    }

    #[test]
    fn review_timeout_rejects() {
        let machine = NdaMachine;
        let mut state = with_memo(
            with_assessment(state_in(NdaState::Draft), 45, false),
            NOTIFY_REVIEWER,
            serde_json::Value::Null,
        );
        state.last_wait = Some(FulfilledWait {
            name: EventName::new(CREATOR_REVIEW),
            outcome: WaitOutcome::TimedOut,
        });
        let next = expect_transition(machine.next_action(&state, &env()).unwrap());
        assert_eq!(next.name(), "Rejected");
    }

    #[test]
    fn review_approval_sends_then_pends() {
        let machine = NdaMachine;
        let approved = with_wait(
            with_memo(
                with_assessment(state_in(NdaState::Draft), 85, false),
                NOTIFY_REVIEWER,
                serde_json::Value::Null,
            ),
            LEGAL_REVIEW,
            serde_json::json!({"decision": "approve"}),
        );
        match machine.next_action(&approved, &env()).unwrap() {
            NextAction::RunStep(call) => assert_eq!(call.name.as_str(), SEND_FOR_SIGNATURE),
            other => panic!("expected signature step, got {other:?}"),
        }
    }

    #[test]
    fn pending_completed_skips_viewed() {
        let machine = NdaMachine;
        let state = with_wait(
            state_in(NdaState::Pending {
                route: RiskRoute::Auto,
            }),
            ENVELOPE_STATUS,
            serde_json::json!({"status": "completed"}),
        );
        let next = expect_transition(machine.next_action(&state, &env()).unwrap());
        assert_eq!(next, NdaState::Signed);
    }

    #[test]
    fn declined_envelope_rejects() {
        let machine = NdaMachine;
        let state = with_wait(
            state_in(NdaState::Viewed),
            ENVELOPE_STATUS,
            serde_json::json!({"status": "declined"}),
        );
        let next = expect_transition(machine.next_action(&state, &env()).unwrap());
        assert_eq!(next.name(), "Rejected");
    }

    #[test]
    fn signed_grants_access_then_activates() {
        let machine = NdaMachine;
        let state = state_in(NdaState::Signed);
        match machine.next_action(&state, &env()).unwrap() {
            NextAction::RunStep(call) => {
                assert_eq!(call.name.as_str(), GRANT_PITCH_ACCESS);
                assert!(matches!(
                    call.compensation,
                    Some(CompensationOp::RevokePitchAccess { .. })
                ));
            }
            other => panic!("expected grant step, got {other:?}"),
        }

        let expires_at = Utc::now() + Duration::days(730);
        let granted = with_memo(
            state,
            GRANT_PITCH_ACCESS,
            serde_json::json!({"expires_at": expires_at}),
        );
        let next = expect_transition(machine.next_action(&granted, &env()).unwrap());
        assert_eq!(next.name(), "Active");
    }

    #[test]
    fn active_sleeps_until_expiry_then_revokes() {
        let machine = NdaMachine;
        let expires_at = Utc::now() + Duration::days(730);
        let state = state_in(NdaState::Active { expires_at });
        match machine.next_action(&state, &env()).unwrap() {
            NextAction::Sleep { until } => assert_eq!(until, expires_at),
            other => panic!("expected sleep, got {other:?}"),
        }

        let mut woke = state;
        woke.sleep_fired = true;
        match machine.next_action(&woke, &env()).unwrap() {
            NextAction::RunStep(call) => assert_eq!(call.name.as_str(), REVOKE_PITCH_ACCESS),
            other => panic!("expected revoke step, got {other:?}"),
        }

        let revoked = with_memo(woke, REVOKE_PITCH_ACCESS, serde_json::Value::Null);
        let next = expect_transition(machine.next_action(&revoked, &env()).unwrap());
        assert_eq!(next, NdaState::Expired);
    }
}
