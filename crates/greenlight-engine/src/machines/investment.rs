//! Investment deal machine.
//!
//! Interest → Qualification → Negotiation (counter-offer loop) →
//! TermSheet → DueDiligence → Commitment → Escrow → Closing → Funded →
//! Completed, with Withdrawn / Rejected / Expired / Failed terminals.
//! Human gates: creator decision ≤ 7 days, investor counter-response
//! ≤ 3 days, term-sheet signatures ≤ 5 days, final commitment ≤ 48 hours,
//! escrow deposit ≤ 7 days.

use super::{DealMachine, MachineEnv, NextAction, StepCall, decoded, unexpected_wait};
use crate::error::EngineError;
use chrono::Duration;
use greenlight_types::{
    CompensationOp, DomainState, EventName, FailedStep, InstanceState, InvestmentParams,
    InvestmentState, NegotiationTurn, Payload, StepError, StepName, WaitOutcome, WorkflowKind,
};
use serde::{Deserialize, Serialize};

const RECORD_INTEREST: &str = "record-interest";
const VERIFY_ACCREDITATION: &str = "verify-accreditation";
const PREPARE_TERM_SHEET: &str = "prepare-term-sheet";
const OPEN_DUE_DILIGENCE: &str = "open-due-diligence";
const HOLD_FUNDS: &str = "hold-funds";
const NOTIFY_PAYMENT_FAILED: &str = "notify-payment-failed";
const PREPARE_CLOSING_DOCS: &str = "prepare-closing-docs";
const RELEASE_FUNDS: &str = "release-funds";
const FINALIZE_INVESTMENT: &str = "finalize-investment";

const CREATOR_DECISION: &str = "creator-decision";
const INVESTOR_RESPONSE: &str = "investor-response";
const TERM_SHEET_SIGNED: &str = "term-sheet-signed";
const DUE_DILIGENCE_RESULT: &str = "due-diligence-result";
const COMMITMENT_CONFIRMED: &str = "commitment-confirmed";
const PAYMENT_STATUS: &str = "payment-status";
const CLOSING_DOCS_EXECUTED: &str = "closing-docs-executed";
const TRANSFER_CONFIRMED: &str = "transfer-confirmed";

/// A creator may counter at most twice before the deal is rejected.
const MAX_COUNTER_ROUNDS: u32 = 2;

#[derive(Debug, Serialize, Deserialize)]
struct InterestRecorded {
    deal_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct QualificationOutcome {
    accredited: bool,
    reason: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct EnvelopePrepared {
    envelope_id: String,
    document_key: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct FundsHeld {
    intent_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct InvestmentFinalized {
    total_funded: u64,
}

pub struct InvestmentMachine;

impl InvestmentMachine {
    fn params<'a>(&self, state: &'a InstanceState) -> Result<&'a InvestmentParams, EngineError> {
        match &state.start.params {
            greenlight_types::StartParams::Investment(p) => Ok(p),
            other => Err(EngineError::Corrupted(format!(
                "investment machine driving {} parameters",
                other.kind()
            ))),
        }
    }

    fn record_interest(&self, params: &InvestmentParams, env: &MachineEnv) -> StepCall {
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
                entities
                    .upsert_deal(crate::providers::DealRow {
                        deal_id: deal_id.clone(),
                        instance,
                        kind: WorkflowKind::Investment,
                        pitch_id: params.pitch_id.clone(),
                        party_id: params.investor_id.clone(),
                        state: "Interest".to_string(),
                        exclusivity_expires_at: None,
                        created_at: now,
                    })
                    .await?;
                notifications
                    .enqueue(crate::providers::Notification {
                        kind: "investment_interest".to_string(),
                        recipient_id: params.creator_id.clone(),
                        channels: vec![
                            crate::providers::Channel::Email,
                            crate::providers::Channel::InApp,
                        ],
                        priority: crate::providers::Priority::Normal,
                    })
                    .await?;
                Payload::encode(&InterestRecorded { deal_id })
                    .map_err(|e| StepError::fatal(e.to_string()))
            }
        })
        .compensate(CompensationOp::CancelDealRecord {
            deal_id: env.instance.full_hex(),
        })
    }

    fn verify_accreditation(&self, params: &InvestmentParams, env: &MachineEnv) -> StepCall {
        let entities = env.providers.entities.clone();
        let investor_id = params.investor_id.clone();
        StepCall::new(VERIFY_ACCREDITATION, move || {
            let entities = entities.clone();
            let investor_id = investor_id.clone();
            async move {
                let user = entities.get_user(&investor_id).await?;
                let outcome = if !user.identity_verified {
                    QualificationOutcome {
                        accredited: false,
                        reason: "identity not verified".to_string(),
                    }
                } else if !user.accredited {
                    QualificationOutcome {
                        accredited: false,
                        reason: "investor is not accredited".to_string(),
                    }
                } else {
                    QualificationOutcome {
                        accredited: true,
                        reason: String::new(),
                    }
                };
                Payload::encode(&outcome).map_err(|e| StepError::fatal(e.to_string()))
            }
        })
    }

    fn prepare_envelope_step(
        &self,
        step_name: &'static str,
        document_kind: &'static str,
        amount: u64,
        params: &InvestmentParams,
        env: &MachineEnv,
    ) -> StepCall {
        let documents = env.providers.documents.clone();
        let signatures = env.providers.signatures.clone();
        let key = env.idempotency_key(step_name);
        let params = params.clone();
        let instance = env.instance;
        StepCall::new(step_name, move || {
            let documents = documents.clone();
            let signatures = signatures.clone();
            let key = key.clone();
            let params = params.clone();
            async move {
                let document_key = format!("{}/{document_kind}.json", instance.full_hex());
                let body = serde_json::json!({
                    "document": document_kind,
                    "pitch_id": params.pitch_id,
                    "investor_id": params.investor_id,
                    "creator_id": params.creator_id,
                    "amount": amount,
                    "investment_type": params.investment_type,
                });
                let bytes = serde_json::to_vec(&body)
                    .map_err(|e| StepError::fatal(e.to_string()))?;
                documents.put(&document_key, bytes).await?;
                let envelope_id = signatures
                    .create_envelope(
                        &key,
                        document_kind,
                        vec![params.investor_id.clone(), params.creator_id.clone()],
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
            envelope_step: StepName::new(step_name),
        })
    }

    fn open_due_diligence(&self, params: &InvestmentParams, env: &MachineEnv) -> StepCall {
        let notifications = env.providers.notifications.clone();
        let params = params.clone();
        StepCall::new(OPEN_DUE_DILIGENCE, move || {
            let notifications = notifications.clone();
            let params = params.clone();
            async move {
                for recipient in [&params.investor_id, &params.creator_id] {
                    notifications
                        .enqueue(crate::providers::Notification {
                            kind: "due_diligence_opened".to_string(),
                            recipient_id: recipient.clone(),
                            channels: vec![crate::providers::Channel::Email],
                            priority: crate::providers::Priority::Normal,
                        })
                        .await?;
                }
                Ok(Payload::null())
            }
        })
    }

    fn hold_funds(&self, amount: u64, params: &InvestmentParams, env: &MachineEnv) -> StepCall {
        let payments = env.providers.payments.clone();
        let key = env.idempotency_key(HOLD_FUNDS);
        let pitch_id = params.pitch_id.clone();
        let instance = env.instance;
        StepCall::new(HOLD_FUNDS, move || {
            let payments = payments.clone();
            let key = key.clone();
            let pitch_id = pitch_id.clone();
            async move {
                let intent_id = payments
                    .hold_funds(
                        &key,
                        amount,
                        Payload::from_value(serde_json::json!({
                            "instance": instance.full_hex(),
                            "pitch_id": pitch_id,
                        })),
                    )
                    .await?;
                Payload::encode(&FundsHeld { intent_id })
                    .map_err(|e| StepError::fatal(e.to_string()))
            }
        })
        .compensate(CompensationOp::RefundPayment {
            intent_step: StepName::new(HOLD_FUNDS),
        })
    }

    fn notify_payment_failed(&self, params: &InvestmentParams, env: &MachineEnv) -> StepCall {
        let notifications = env.providers.notifications.clone();
        let investor_id = params.investor_id.clone();
        StepCall::new(NOTIFY_PAYMENT_FAILED, move || {
            let notifications = notifications.clone();
            let investor_id = investor_id.clone();
            async move {
                notifications
                    .enqueue(crate::providers::Notification {
                        kind: "payment_failed".to_string(),
                        recipient_id: investor_id.clone(),
                        channels: vec![
                            crate::providers::Channel::Email,
                            crate::providers::Channel::Push,
                        ],
                        priority: crate::providers::Priority::High,
                    })
                    .await?;
                Ok(Payload::null())
            }
        })
    }

    fn release_funds(&self, intent_id: String, env: &MachineEnv) -> StepCall {
        let payments = env.providers.payments.clone();
        StepCall::new(RELEASE_FUNDS, move || {
            let payments = payments.clone();
            let intent_id = intent_id.clone();
            async move {
                payments.release_funds(&intent_id).await?;
                Ok(Payload::null())
            }
        })
    }

    fn finalize_investment(
        &self,
        amount: u64,
        params: &InvestmentParams,
        env: &MachineEnv,
    ) -> StepCall {
        let entities = env.providers.entities.clone();
        let notifications = env.providers.notifications.clone();
        let params = params.clone();
        let deal_id = env.instance.full_hex();
        StepCall::new(FINALIZE_INVESTMENT, move || {
            let entities = entities.clone();
            let notifications = notifications.clone();
            let params = params.clone();
            let deal_id = deal_id.clone();
            async move {
                let total_funded = entities
                    .add_pitch_funding(&params.pitch_id, amount)
                    .await?;
                entities.update_deal_state(&deal_id, "Completed").await?;
                for recipient in [&params.investor_id, &params.creator_id] {
                    notifications
                        .enqueue(crate::providers::Notification {
                            kind: "investment_completed".to_string(),
                            recipient_id: recipient.clone(),
                            channels: vec![
                                crate::providers::Channel::Email,
                                crate::providers::Channel::InApp,
                            ],
                            priority: crate::providers::Priority::High,
                        })
                        .await?;
                }
                Payload::encode(&InvestmentFinalized { total_funded })
                    .map_err(|e| StepError::fatal(e.to_string()))
            }
        })
    }

    fn transition(&self, to: InvestmentState) -> NextAction {
        NextAction::Transition {
            to: DomainState::Investment(to),
        }
    }

    fn wait(&self, name: &str, deadline: Option<chrono::DateTime<chrono::Utc>>) -> NextAction {
        NextAction::Wait {
            name: EventName::new(name),
            filter: None,
            deadline,
        }
    }
}

fn decision(outcome: &WaitOutcome) -> Option<&str> {
    outcome.payload().and_then(|p| p.str_field("decision"))
}

fn status(outcome: &WaitOutcome) -> Option<&str> {
    outcome.payload().and_then(|p| p.str_field("status"))
}

fn counter_amount(outcome: &WaitOutcome) -> Option<u64> {
    outcome
        .payload()
        .and_then(|p| p.raw().get("counter_amount"))
        .and_then(|v| v.as_u64())
}

impl DealMachine for InvestmentMachine {
    fn kind(&self) -> WorkflowKind {
        WorkflowKind::Investment
    }

    fn next_action(
        &self,
        state: &InstanceState,
        env: &MachineEnv,
    ) -> Result<NextAction, EngineError> {
        let params = self.params(state)?;
        let DomainState::Investment(current) = &state.state else {
            return Err(EngineError::Corrupted(format!(
                "investment machine driving state {}",
                state.state
            )));
        };

        match current {
            InvestmentState::Interest => {
                if decoded::<InterestRecorded>(state, &StepName::new(RECORD_INTEREST))?.is_none() {
                    return Ok(NextAction::RunStep(self.record_interest(params, env)));
                }
                Ok(self.transition(InvestmentState::Qualification))
            }

            InvestmentState::Qualification => {
                match decoded::<QualificationOutcome>(
                    state,
                    &StepName::new(VERIFY_ACCREDITATION),
                )? {
                    None => Ok(NextAction::RunStep(self.verify_accreditation(params, env))),
                    Some(outcome) if outcome.accredited => {
                        Ok(self.transition(InvestmentState::Negotiation {
                            amount: params.proposed_amount,
                            counter_rounds: 0,
                            turn: NegotiationTurn::Creator,
                        }))
                    }
                    Some(outcome) => Ok(self.transition(InvestmentState::Rejected {
                        reason: outcome.reason,
                    })),
                }
            }

            InvestmentState::Negotiation {
                amount,
                counter_rounds,
                turn,
            } => {
                let (wait_name, window) = match turn {
                    NegotiationTurn::Creator => (CREATOR_DECISION, Duration::days(7)),
                    NegotiationTurn::Investor => (INVESTOR_RESPONSE, Duration::days(3)),
                };
                let Some(outcome) = state.last_wait_for(&EventName::new(wait_name)) else {
                    return Ok(self.wait(wait_name, Some(env.now + window)));
                };
                if outcome.is_timeout() {
                    return Ok(self.transition(InvestmentState::Expired {
                        stage: "negotiation".to_string(),
                    }));
                }
                match decision(outcome) {
                    Some("approve") | Some("accept") => {
                        Ok(self.transition(InvestmentState::TermSheet {
                            agreed_amount: *amount,
                        }))
                    }
                    Some("counter") => {
                        if *counter_rounds >= MAX_COUNTER_ROUNDS {
                            return Ok(self.transition(InvestmentState::Rejected {
                                reason: "counter-offer limit reached".to_string(),
                            }));
                        }
                        let next_turn = match turn {
                            NegotiationTurn::Creator => NegotiationTurn::Investor,
                            NegotiationTurn::Investor => NegotiationTurn::Creator,
                        };
                        Ok(self.transition(InvestmentState::Negotiation {
                            amount: counter_amount(outcome).unwrap_or(*amount),
                            counter_rounds: counter_rounds + 1,
                            turn: next_turn,
                        }))
                    }
                    _ => Ok(self.transition(InvestmentState::Rejected {
                        reason: "offer declined".to_string(),
                    })),
                }
            }

            InvestmentState::TermSheet { agreed_amount } => {
                if decoded::<EnvelopePrepared>(state, &StepName::new(PREPARE_TERM_SHEET))?
                    .is_none()
                {
                    return Ok(NextAction::RunStep(self.prepare_envelope_step(
                        PREPARE_TERM_SHEET,
                        "term-sheet",
                        *agreed_amount,
                        params,
                        env,
                    )));
                }
                let Some(outcome) = state.last_wait_for(&EventName::new(TERM_SHEET_SIGNED))
                else {
                    return Ok(self.wait(TERM_SHEET_SIGNED, Some(env.now + Duration::days(5))));
                };
                if outcome.is_timeout() {
                    return Ok(self.transition(InvestmentState::Expired {
                        stage: "term_sheet".to_string(),
                    }));
                }
                match status(outcome) {
                    Some("completed") => Ok(self.transition(InvestmentState::DueDiligence {
                        agreed_amount: *agreed_amount,
                    })),
                    _ => Ok(self.transition(InvestmentState::Rejected {
                        reason: "term sheet declined".to_string(),
                    })),
                }
            }

            InvestmentState::DueDiligence { agreed_amount } => {
                if state
                    .memo_output(&StepName::new(OPEN_DUE_DILIGENCE))
                    .is_none()
                {
                    return Ok(NextAction::RunStep(self.open_due_diligence(params, env)));
                }
                let Some(outcome) = state.last_wait_for(&EventName::new(DUE_DILIGENCE_RESULT))
                else {
                    return Ok(self.wait(DUE_DILIGENCE_RESULT, None));
                };
                let passed = outcome
                    .payload()
                    .and_then(|p| p.raw().get("passed"))
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                if passed {
                    Ok(self.transition(InvestmentState::Commitment {
                        agreed_amount: *agreed_amount,
                    }))
                } else {
                    Ok(self.transition(InvestmentState::Failed {
                        reason: "due diligence found issues".to_string(),
                    }))
                }
            }

            InvestmentState::Commitment { agreed_amount } => {
                let Some(outcome) = state.last_wait_for(&EventName::new(COMMITMENT_CONFIRMED))
                else {
                    return Ok(self.wait(COMMITMENT_CONFIRMED, Some(env.now + Duration::hours(48))));
                };
                if outcome.is_timeout() {
                    return Ok(self.transition(InvestmentState::Expired {
                        stage: "commitment".to_string(),
                    }));
                }
                match decision(outcome) {
                    Some("confirm") => {
                        if decoded::<FundsHeld>(state, &StepName::new(HOLD_FUNDS))?.is_none() {
                            return Ok(NextAction::RunStep(self.hold_funds(
                                *agreed_amount,
                                params,
                                env,
                            )));
                        }
                        Ok(self.transition(InvestmentState::Escrow {
                            agreed_amount: *agreed_amount,
                        }))
                    }
                    _ => Ok(self.transition(InvestmentState::Withdrawn {
                        reason: "commitment withdrawn".to_string(),
                    })),
                }
            }

            InvestmentState::Escrow { agreed_amount } => {
                let Some(outcome) = state.last_wait_for(&EventName::new(PAYMENT_STATUS)) else {
                    return Ok(self.wait(PAYMENT_STATUS, Some(env.now + Duration::days(7))));
                };
                if outcome.is_timeout() {
                    return Ok(self.transition(InvestmentState::Failed {
                        reason: "escrow deposit window elapsed".to_string(),
                    }));
                }
                match status(outcome) {
                    Some("succeeded") => Ok(self.transition(InvestmentState::Closing {
                        agreed_amount: *agreed_amount,
                    })),
                    Some("processing") => {
                        Ok(self.wait(PAYMENT_STATUS, Some(env.now + Duration::days(7))))
                    }
                    _ => {
                        if state
                            .memo_output(&StepName::new(NOTIFY_PAYMENT_FAILED))
                            .is_none()
                        {
                            return Ok(NextAction::RunStep(
                                self.notify_payment_failed(params, env),
                            ));
                        }
                        Ok(self.transition(InvestmentState::Failed {
                            reason: "escrow payment failed".to_string(),
                        }))
                    }
                }
            }

            InvestmentState::Closing { agreed_amount } => {
                if decoded::<EnvelopePrepared>(state, &StepName::new(PREPARE_CLOSING_DOCS))?
                    .is_none()
                {
                    return Ok(NextAction::RunStep(self.prepare_envelope_step(
                        PREPARE_CLOSING_DOCS,
                        "closing-documents",
                        *agreed_amount,
                        params,
                        env,
                    )));
                }
                let Some(outcome) = state.last_wait_for(&EventName::new(CLOSING_DOCS_EXECUTED))
                else {
                    return Ok(self.wait(CLOSING_DOCS_EXECUTED, None));
                };
                match status(outcome) {
                    Some("completed") => Ok(self.transition(InvestmentState::Funded {
                        agreed_amount: *agreed_amount,
                    })),
                    _ => Ok(self.transition(InvestmentState::Failed {
                        reason: "closing documents declined".to_string(),
                    })),
                }
            }

            InvestmentState::Funded { agreed_amount } => {
                if state.memo_output(&StepName::new(RELEASE_FUNDS)).is_none() {
                    let held = decoded::<FundsHeld>(state, &StepName::new(HOLD_FUNDS))?
                        .ok_or_else(|| {
                            EngineError::Corrupted(
                                "funded without a recorded payment hold".to_string(),
                            )
                        })?;
                    return Ok(NextAction::RunStep(self.release_funds(held.intent_id, env)));
                }
                if state
                    .last_wait_for(&EventName::new(TRANSFER_CONFIRMED))
                    .is_none()
                {
                    return Ok(self.wait(TRANSFER_CONFIRMED, None));
                }
                Ok(self.transition(InvestmentState::Completed {
                    agreed_amount: *agreed_amount,
                }))
            }

            InvestmentState::Completed { agreed_amount } => {
                if decoded::<InvestmentFinalized>(state, &StepName::new(FINALIZE_INVESTMENT))?
                    .is_none()
                {
                    return Ok(NextAction::RunStep(self.finalize_investment(
                        *agreed_amount,
                        params,
                        env,
                    )));
                }
                Ok(NextAction::Complete)
            }

            InvestmentState::Withdrawn { .. }
            | InvestmentState::Rejected { .. }
            | InvestmentState::Expired { .. } => Ok(NextAction::Complete),

            InvestmentState::Failed { .. } => Err(unexpected_wait(state)),
        }
    }

    fn on_domain_failure(
        &self,
        _state: &InstanceState,
        failed: &FailedStep,
    ) -> Result<NextAction, EngineError> {
        Ok(NextAction::Transition {
            to: DomainState::Investment(InvestmentState::Failed {
                reason: format!("step '{}' failed: {}", failed.step, failed.error.message),
            }),
        })
    }

    fn abort_state(&self, reason: &str) -> DomainState {
        DomainState::Investment(InvestmentState::Withdrawn {
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
    use chrono::Utc;
    use greenlight_types::{
        FulfilledWait, InstanceId, InstanceStatus, InvestmentType, StartInfo, StartParams,
    };
    use std::sync::Arc;

    fn providers() -> ProviderSet {
        ProviderSet {
            entities: Arc::new(MemoryEntityStore::new()),
            documents: Arc::new(MemoryDocumentStore::new()),
            templates: Arc::new(MemoryTemplateStore::new()),
            payments: Arc::new(MemoryPaymentProvider::new()),
            signatures: Arc::new(MemorySignatureProvider::new()),
            notifications: Arc::new(MemoryNotificationSink::new()),
            peers: Arc::new(NullNotifier),
        }
    }

    fn env() -> MachineEnv {
        MachineEnv {
            instance: InstanceId::derive(WorkflowKind::Investment, "machine-test"),
            now: Utc::now(),
            providers: providers(),
        }
    }

    fn state_in(investment_state: InvestmentState) -> InstanceState {
        let mut state = InstanceState::new(StartInfo {
            kind: WorkflowKind::Investment,
            params: StartParams::Investment(InvestmentParams {
                investor_id: "inv-1".into(),
                creator_id: "cre-1".into(),
                pitch_id: "pitch-1".into(),
                proposed_amount: 250_000,
                investment_type: InvestmentType::Equity,
                nda_accepted: true,
            }),
            client_token: "machine-test".into(),
        });
        state.state = DomainState::Investment(investment_state);
        state.status = InstanceStatus::Runnable;
        state
    }

    fn with_memo(mut state: InstanceState, step: &str, value: serde_json::Value) -> InstanceState {
        state
            .memo
            .insert(StepName::new(step), Payload::from_value(value));
        state
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

    fn with_timeout(mut state: InstanceState, name: &str) -> InstanceState {
        state.last_wait = Some(FulfilledWait {
            name: EventName::new(name),
            outcome: WaitOutcome::TimedOut,
        });
        state
    }

    fn expect_transition(action: NextAction) -> InvestmentState {
        match action {
            NextAction::Transition {
                to: DomainState::Investment(s),
            } => s,
            other => panic!("expected transition, got {other:?}"),
        }
    }

    #[test]
    fn interest_runs_record_step_then_qualifies() {
        let machine = InvestmentMachine;
        let state = state_in(InvestmentState::Interest);

        match machine.next_action(&state, &env()).unwrap() {
            NextAction::RunStep(call) => assert_eq!(call.name.as_str(), RECORD_INTEREST),
            other => panic!("expected step, got {other:?}"),
        }

        let state = with_memo(state, RECORD_INTEREST, serde_json::json!({"deal_id": "d"}));
        let next = expect_transition(machine.next_action(&state, &env()).unwrap());
        assert_eq!(next.name(), "Qualification");
    }

    #[test]
    fn qualification_routes_on_accreditation() {
        let machine = InvestmentMachine;
        let accredited = with_memo(
            state_in(InvestmentState::Qualification),
            VERIFY_ACCREDITATION,
            serde_json::json!({"accredited": true, "reason": ""}),
        );
        let next = expect_transition(machine.next_action(&accredited, &env()).unwrap());
        assert_eq!(
            next,
            InvestmentState::Negotiation {
                amount: 250_000,
                counter_rounds: 0,
                turn: NegotiationTurn::Creator,
            }
        );

        let rejected = with_memo(
            state_in(InvestmentState::Qualification),
            VERIFY_ACCREDITATION,
            serde_json::json!({"accredited": false, "reason": "investor is not accredited"}),
        );
        let next = expect_transition(machine.next_action(&rejected, &env()).unwrap());
        assert_eq!(next.name(), "Rejected");
    }

    #[test]
    fn creator_timeout_expires_the_deal() {
        let machine = InvestmentMachine;
        let state = with_timeout(
            state_in(InvestmentState::Negotiation {
                amount: 250_000,
                counter_rounds: 0,
                turn: NegotiationTurn::Creator,
            }),
            CREATOR_DECISION,
        );
        let next = expect_transition(machine.next_action(&state, &env()).unwrap());
        assert_eq!(
            next,
            InvestmentState::Expired {
                stage: "negotiation".to_string()
            }
        );
    }

    #[test]
    fn counter_offer_updates_amount_and_flips_turn() {
        let machine = InvestmentMachine;
        let state = with_wait(
            state_in(InvestmentState::Negotiation {
                amount: 250_000,
                counter_rounds: 0,
                turn: NegotiationTurn::Creator,
            }),
            CREATOR_DECISION,
            serde_json::json!({"decision": "counter", "counter_amount": 300_000}),
        );
        let next = expect_transition(machine.next_action(&state, &env()).unwrap());
        assert_eq!(
            next,
            InvestmentState::Negotiation {
                amount: 300_000,
                counter_rounds: 1,
                turn: NegotiationTurn::Investor,
            }
        );
    }

    #[test]
    fn third_counter_round_rejects() {
        let machine = InvestmentMachine;
        let state = with_wait(
            state_in(InvestmentState::Negotiation {
                amount: 300_000,
                counter_rounds: 2,
                turn: NegotiationTurn::Creator,
            }),
            CREATOR_DECISION,
            serde_json::json!({"decision": "counter", "counter_amount": 350_000}),
        );
        let next = expect_transition(machine.next_action(&state, &env()).unwrap());
        assert_eq!(next.name(), "Rejected");
    }

    #[test]
    fn commitment_confirm_holds_funds_before_escrow() {
        let machine = InvestmentMachine;
        let confirmed = with_wait(
            state_in(InvestmentState::Commitment {
                agreed_amount: 250_000,
            }),
            COMMITMENT_CONFIRMED,
            serde_json::json!({"decision": "confirm"}),
        );
        match machine.next_action(&confirmed, &env()).unwrap() {
            NextAction::RunStep(call) => {
                assert_eq!(call.name.as_str(), HOLD_FUNDS);
                assert!(matches!(
                    call.compensation,
                    Some(CompensationOp::RefundPayment { .. })
                ));
            }
            other => panic!("expected hold-funds, got {other:?}"),
        }

        let held = with_memo(
            confirmed,
            HOLD_FUNDS,
            serde_json::json!({"intent_id": "pi_1"}),
        );
        let next = expect_transition(machine.next_action(&held, &env()).unwrap());
        assert_eq!(next.name(), "Escrow");
    }

    #[test]
    fn payment_failure_notifies_then_fails() {
        let machine = InvestmentMachine;
        let failed = with_wait(
            state_in(InvestmentState::Escrow {
                agreed_amount: 250_000,
            }),
            PAYMENT_STATUS,
            serde_json::json!({"status": "failed"}),
        );
        match machine.next_action(&failed, &env()).unwrap() {
            NextAction::RunStep(call) => assert_eq!(call.name.as_str(), NOTIFY_PAYMENT_FAILED),
            other => panic!("expected notify step, got {other:?}"),
        }

        let notified = with_memo(failed, NOTIFY_PAYMENT_FAILED, serde_json::Value::Null);
        let next = expect_transition(machine.next_action(&notified, &env()).unwrap());
        assert_eq!(next.name(), "Failed");
    }

    #[test]
    fn processing_payment_re_waits() {
        let machine = InvestmentMachine;
        let state = with_wait(
            state_in(InvestmentState::Escrow {
                agreed_amount: 250_000,
            }),
            PAYMENT_STATUS,
            serde_json::json!({"status": "processing"}),
        );
        match machine.next_action(&state, &env()).unwrap() {
            NextAction::Wait { name, .. } => assert_eq!(name.as_str(), PAYMENT_STATUS),
            other => panic!("expected re-wait, got {other:?}"),
        }
    }

    #[test]
    fn abort_state_is_withdrawn() {
        let machine = InvestmentMachine;
        let state = machine.abort_state("cancelled by investor");
        assert_eq!(state.name(), "Withdrawn");
    }
}
