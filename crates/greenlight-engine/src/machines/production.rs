//! Production deal machine.
//!
//! Interest → Meeting → Proposal → Negotiation → Contract → Production →
//! Completed, with Waitlisted parking behind another deal's exclusivity
//! window. Entering Contract grants a 30-day exclusivity on the pitch;
//! release (lapse, decline, failure, abort) promotes the earliest
//! waitlisted deal back to Interest.

use super::{DealMachine, MachineEnv, NextAction, StepCall, decoded};
use crate::error::EngineError;
use crate::providers::{Channel, DealRow, Notification, Priority, ProviderSet};
use chrono::{DateTime, Duration, Utc};
use greenlight_types::{
    CompensationOp, DomainState, EXCLUSIVITY_DAYS, EventName, FailedStep, InstanceState,
    MAX_ACTIVE_PROJECTS, Payload, ProductionParams, ProductionState, StepError, StepName,
    WorkflowKind,
};
use serde::{Deserialize, Serialize};

const RECORD_INTEREST: &str = "record-interest";
const CHECK_CAPACITY: &str = "check-capacity";
const GRANT_EXCLUSIVITY: &str = "grant-exclusivity";
const PREPARE_CONTRACT: &str = "prepare-contract";
const RELEASE_EXCLUSIVITY: &str = "release-exclusivity";
const RETURN_TO_INTEREST: &str = "return-to-interest";

const CREATOR_RESPONSE: &str = "creator-response";
const MEETING_COMPLETED: &str = "meeting-completed";
const PROPOSAL_RESPONSE: &str = "proposal-response";
const TERMS_AGREED: &str = "terms-agreed";
const CONTRACT_SIGNED: &str = "contract-signed";
const PRODUCTION_COMPLETED: &str = "production-completed";
/// Delivered by a releasing instance to the promoted waitlisted deal.
pub const EXCLUSIVITY_RELEASED: &str = "exclusivity-released";

#[derive(Debug, Serialize, Deserialize)]
struct InterestRecorded {
    deal_id: String,
    waitlisted: bool,
    recorded_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CapacityChecked {
    active_projects: usize,
    exceeded: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct ExclusivityGranted {
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct EnvelopePrepared {
    envelope_id: String,
    document_key: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ExclusivityReleased {
    promoted_deal_id: Option<String>,
}

/// Clear this deal's exclusivity window and promote the earliest-queued
/// waitlisted deal on the pitch (FIFO by creation time). Shared by the
/// forward release step and the `ReleaseExclusivity` compensator so both
/// paths promote identically.
pub(crate) async fn release_and_promote(
    providers: &ProviderSet,
    own_deal_id: &str,
    pitch_id: &str,
) -> Result<Option<String>, StepError> {
    providers.entities.set_exclusivity(own_deal_id, None).await?;

    let rows = providers.entities.deals_for_pitch(pitch_id).await?;
    let next = rows
        .iter()
        .find(|row| row.deal_id != own_deal_id && row.state == "Waitlisted");
    let Some(next) = next else {
        return Ok(None);
    };

    providers
        .peers
        .deliver(
            next.instance,
            EventName::new(EXCLUSIVITY_RELEASED),
            Payload::from_value(serde_json::json!({ "pitch_id": pitch_id })),
        )
        .await?;
    providers
        .notifications
        .enqueue(Notification {
            kind: "exclusivity_released".to_string(),
            recipient_id: next.party_id.clone(),
            channels: vec![Channel::Email, Channel::InApp],
            priority: Priority::Normal,
        })
        .await?;
    Ok(Some(next.deal_id.clone()))
}

pub struct ProductionMachine;

impl ProductionMachine {
    fn params<'a>(&self, state: &'a InstanceState) -> Result<&'a ProductionParams, EngineError> {
        match &state.start.params {
            greenlight_types::StartParams::Production(p) => Ok(p),
            other => Err(EngineError::Corrupted(format!(
                "production machine driving {} parameters",
                other.kind()
            ))),
        }
    }

    fn record_interest(&self, params: &ProductionParams, env: &MachineEnv) -> StepCall {
        let entities = env.providers.entities.clone();
        let notifications = env.providers.notifications.clone();
        let instance = env.instance;
        let params = params.clone();
        let now = env.now;
        StepCall::new(RECORD_INTEREST, move || {
            let entities = entities.clone();
            let notifications = notifications.clone();
            let params = params.clone();
            async move {
                let deal_id = instance.full_hex();
                // Another deal's live exclusivity window parks this one.
                let waitlisted = entities
                    .deals_for_pitch(&params.pitch_id)
                    .await?
                    .iter()
                    .any(|row| {
                        row.deal_id != deal_id
                            && row.exclusivity_expires_at.is_some_and(|at| at > now)
                    });
                entities
                    .upsert_deal(DealRow {
                        deal_id: deal_id.clone(),
                        instance,
                        kind: WorkflowKind::Production,
                        pitch_id: params.pitch_id.clone(),
                        party_id: params.production_company_id.clone(),
                        state: if waitlisted { "Waitlisted" } else { "Interest" }.to_string(),
                        exclusivity_expires_at: None,
                        created_at: now,
                    })
                    .await?;
                notifications
                    .enqueue(Notification {
                        kind: "production_interest".to_string(),
                        recipient_id: params.creator_id.clone(),
                        channels: vec![Channel::Email, Channel::InApp],
                        priority: Priority::Normal,
                    })
                    .await?;
                Payload::encode(&InterestRecorded {
                    deal_id,
                    waitlisted,
                    recorded_at: now,
                })
                .map_err(|e| StepError::fatal(e.to_string()))
            }
        })
        .compensate(CompensationOp::CancelDealRecord {
            deal_id: env.instance.full_hex(),
        })
    }

    fn check_capacity(&self, params: &ProductionParams, env: &MachineEnv) -> StepCall {
        let entities = env.providers.entities.clone();
        let company_id = params.production_company_id.clone();
        StepCall::new(CHECK_CAPACITY, move || {
            let entities = entities.clone();
            let company_id = company_id.clone();
            async move {
                let company = entities.get_company(&company_id).await?;
                Payload::encode(&CapacityChecked {
                    active_projects: company.active_projects,
                    exceeded: company.active_projects > MAX_ACTIVE_PROJECTS,
                })
                .map_err(|e| StepError::fatal(e.to_string()))
            }
        })
    }

    fn grant_exclusivity(&self, params: &ProductionParams, env: &MachineEnv) -> StepCall {
        let entities = env.providers.entities.clone();
        let deal_id = env.instance.full_hex();
        let expires_at = env.now + Duration::days(EXCLUSIVITY_DAYS);
        StepCall::new(GRANT_EXCLUSIVITY, move || {
            let entities = entities.clone();
            let deal_id = deal_id.clone();
            async move {
                entities
                    .set_exclusivity(&deal_id, Some(expires_at))
                    .await?;
                entities.update_deal_state(&deal_id, "Contract").await?;
                Payload::encode(&ExclusivityGranted { expires_at })
                    .map_err(|e| StepError::fatal(e.to_string()))
            }
        })
        .compensate(CompensationOp::ReleaseExclusivity {
            pitch_id: params.pitch_id.clone(),
        })
    }

    fn prepare_contract(&self, params: &ProductionParams, env: &MachineEnv) -> StepCall {
        let documents = env.providers.documents.clone();
        let signatures = env.providers.signatures.clone();
        let key = env.idempotency_key(PREPARE_CONTRACT);
        let params = params.clone();
        let instance = env.instance;
        StepCall::new(PREPARE_CONTRACT, move || {
            let documents = documents.clone();
            let signatures = signatures.clone();
            let key = key.clone();
            let params = params.clone();
            async move {
                let document_key = format!("{}/production-contract.json", instance.full_hex());
                let body = serde_json::json!({
                    "document": "production-contract",
                    "pitch_id": params.pitch_id,
                    "company_id": params.production_company_id,
                    "creator_id": params.creator_id,
                    "interest_type": params.interest_type,
                });
                let bytes = serde_json::to_vec(&body)
                    .map_err(|e| StepError::fatal(e.to_string()))?;
                documents.put(&document_key, bytes).await?;
                let envelope_id = signatures
                    .create_envelope(
                        &key,
                        "production-contract",
                        vec![
                            params.production_company_id.clone(),
                            params.creator_id.clone(),
                        ],
                        Payload::from_value(serde_json::json!({
                            "instance": instance.full_hex(),
                            "document_key": document_key,
                        })),
                    )
                    .await?;
                Payload::encode(&EnvelopePrepared {
                    envelope_id,
                    document_key,
                })
                .map_err(|e| StepError::fatal(e.to_string()))
            }
        })
        .compensate(CompensationOp::VoidEnvelope {
            envelope_step: StepName::new(PREPARE_CONTRACT),
        })
    }

    fn release_exclusivity(&self, params: &ProductionParams, env: &MachineEnv) -> StepCall {
        let providers = env.providers.clone();
        let deal_id = env.instance.full_hex();
        let pitch_id = params.pitch_id.clone();
        StepCall::new(RELEASE_EXCLUSIVITY, move || {
            let providers = providers.clone();
            let deal_id = deal_id.clone();
            let pitch_id = pitch_id.clone();
            async move {
                let promoted = release_and_promote(&providers, &deal_id, &pitch_id).await?;
                Payload::encode(&ExclusivityReleased {
                    promoted_deal_id: promoted,
                })
                .map_err(|e| StepError::fatal(e.to_string()))
            }
        })
    }

    fn return_to_interest(&self, params: &ProductionParams, env: &MachineEnv) -> StepCall {
        let entities = env.providers.entities.clone();
        let notifications = env.providers.notifications.clone();
        let deal_id = env.instance.full_hex();
        let company_id = params.production_company_id.clone();
        StepCall::new(RETURN_TO_INTEREST, move || {
            let entities = entities.clone();
            let notifications = notifications.clone();
            let deal_id = deal_id.clone();
            let company_id = company_id.clone();
            async move {
                entities.update_deal_state(&deal_id, "Interest").await?;
                notifications
                    .enqueue(Notification {
                        kind: "deal_promoted".to_string(),
                        recipient_id: company_id.clone(),
                        channels: vec![Channel::Email, Channel::InApp],
                        priority: Priority::Normal,
                    })
                    .await?;
                Ok(Payload::null())
            }
        })
    }

    fn transition(&self, to: ProductionState) -> NextAction {
        NextAction::Transition {
            to: DomainState::Production(to),
        }
    }

    fn wait(&self, name: &str, deadline: Option<DateTime<Utc>>) -> NextAction {
        NextAction::Wait {
            name: EventName::new(name),
            filter: None,
            deadline,
        }
    }
}

fn decision(state: &InstanceState, wait: &str) -> Option<String> {
    state
        .last_wait_for(&EventName::new(wait))
        .and_then(|o| o.payload())
        .and_then(|p| p.str_field("decision"))
        .map(str::to_string)
}

impl DealMachine for ProductionMachine {
    fn kind(&self) -> WorkflowKind {
        WorkflowKind::Production
    }

    fn next_action(
        &self,
        state: &InstanceState,
        env: &MachineEnv,
    ) -> Result<NextAction, EngineError> {
        let params = self.params(state)?;
        let DomainState::Production(current) = &state.state else {
            return Err(EngineError::Corrupted(format!(
                "production machine driving state {}",
                state.state
            )));
        };

        match current {
            ProductionState::Interest => {
                let Some(recorded) =
                    decoded::<InterestRecorded>(state, &StepName::new(RECORD_INTEREST))?
                else {
                    return Ok(NextAction::RunStep(self.record_interest(params, env)));
                };
                // A promoted deal re-enters Interest with its recorded
                // waitlist flag still set; the promotion step marks the
                // difference.
                if recorded.waitlisted
                    && state
                        .memo_output(&StepName::new(RETURN_TO_INTEREST))
                        .is_none()
                {
                    return Ok(self.transition(ProductionState::Waitlisted {
                        since: recorded.recorded_at,
                    }));
                }

                match decision(state, CREATOR_RESPONSE).as_deref() {
                    None => {
                        if state
                            .last_wait_for(&EventName::new(CREATOR_RESPONSE))
                            .is_some_and(|o| o.is_timeout())
                        {
                            return Ok(self.transition(ProductionState::Rejected {
                                reason: "creator did not respond".to_string(),
                            }));
                        }
                        Ok(self.wait(CREATOR_RESPONSE, None))
                    }
                    Some("accept") => {
                        match decoded::<CapacityChecked>(state, &StepName::new(CHECK_CAPACITY))? {
                            None => Ok(NextAction::RunStep(self.check_capacity(params, env))),
                            Some(capacity) if capacity.exceeded => {
                                Ok(self.transition(ProductionState::Rejected {
                                    reason: "CapacityExceeded".to_string(),
                                }))
                            }
                            Some(_) => Ok(self.transition(ProductionState::Meeting)),
                        }
                    }
                    Some(_) => Ok(self.transition(ProductionState::Rejected {
                        reason: "creator declined".to_string(),
                    })),
                }
            }

            ProductionState::Waitlisted { .. } => {
                if state
                    .last_wait_for(&EventName::new(EXCLUSIVITY_RELEASED))
                    .is_none()
                {
                    return Ok(self.wait(EXCLUSIVITY_RELEASED, None));
                }
                if state
                    .memo_output(&StepName::new(RETURN_TO_INTEREST))
                    .is_none()
                {
                    return Ok(NextAction::RunStep(self.return_to_interest(params, env)));
                }
                Ok(self.transition(ProductionState::Interest))
            }

            ProductionState::Meeting => match decision(state, MEETING_COMPLETED).as_deref() {
                None => Ok(self.wait(MEETING_COMPLETED, None)),
                Some("completed") => Ok(self.transition(ProductionState::Proposal)),
                Some(_) => Ok(self.transition(ProductionState::Rejected {
                    reason: "meeting cancelled".to_string(),
                })),
            },

            ProductionState::Proposal => match decision(state, PROPOSAL_RESPONSE).as_deref() {
                None => Ok(self.wait(PROPOSAL_RESPONSE, None)),
                Some("accept") => Ok(self.transition(ProductionState::Negotiation)),
                Some(_) => Ok(self.transition(ProductionState::Rejected {
                    reason: "proposal declined".to_string(),
                })),
            },

            ProductionState::Negotiation => match decision(state, TERMS_AGREED).as_deref() {
                None => Ok(self.wait(TERMS_AGREED, None)),
                Some("agreed") => {
                    let Some(granted) =
                        decoded::<ExclusivityGranted>(state, &StepName::new(GRANT_EXCLUSIVITY))?
                    else {
                        return Ok(NextAction::RunStep(self.grant_exclusivity(params, env)));
                    };
                    if decoded::<EnvelopePrepared>(state, &StepName::new(PREPARE_CONTRACT))?
                        .is_none()
                    {
                        return Ok(NextAction::RunStep(self.prepare_contract(params, env)));
                    }
                    Ok(self.transition(ProductionState::Contract {
                        exclusivity_expires_at: granted.expires_at,
                    }))
                }
                Some(_) => Ok(self.transition(ProductionState::Rejected {
                    reason: "terms not agreed".to_string(),
                })),
            },

            ProductionState::Contract {
                exclusivity_expires_at,
            } => {
                let Some(outcome) = state.last_wait_for(&EventName::new(CONTRACT_SIGNED)) else {
                    return Ok(self.wait(CONTRACT_SIGNED, Some(*exclusivity_expires_at)));
                };
                let signed = outcome
                    .payload()
                    .and_then(|p| p.str_field("status"))
                    .map(str::to_string);
                match (outcome.is_timeout(), signed.as_deref()) {
                    (false, Some("completed")) => {
                        Ok(self.transition(ProductionState::Production))
                    }
                    _ => {
                        // Window lapsed or the contract was declined:
                        // release and hand the pitch to the next in line.
                        if decoded::<ExclusivityReleased>(
                            state,
                            &StepName::new(RELEASE_EXCLUSIVITY),
                        )?
                        .is_none()
                        {
                            return Ok(NextAction::RunStep(
                                self.release_exclusivity(params, env),
                            ));
                        }
                        if outcome.is_timeout() {
                            Ok(self.transition(ProductionState::Expired {
                                stage: "contract".to_string(),
                            }))
                        } else {
                            Ok(self.transition(ProductionState::Rejected {
                                reason: "contract declined".to_string(),
                            }))
                        }
                    }
                }
            }

            ProductionState::Production => {
                if state
                    .last_wait_for(&EventName::new(PRODUCTION_COMPLETED))
                    .is_none()
                {
                    return Ok(self.wait(PRODUCTION_COMPLETED, None));
                }
                Ok(self.transition(ProductionState::Completed))
            }

            ProductionState::Completed
            | ProductionState::Rejected { .. }
            | ProductionState::Expired { .. } => Ok(NextAction::Complete),
        }
    }

    fn on_domain_failure(
        &self,
        _state: &InstanceState,
        failed: &FailedStep,
    ) -> Result<NextAction, EngineError> {
        Ok(NextAction::Transition {
            to: DomainState::Production(ProductionState::Rejected {
                reason: format!("step '{}' failed: {}", failed.step, failed.error.message),
            }),
        })
    }

    fn abort_state(&self, reason: &str) -> DomainState {
        DomainState::Production(ProductionState::Rejected {
            reason: reason.to_string(),
        })
    }
}
