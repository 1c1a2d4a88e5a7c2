//! Compensation runner.
//!
//! On fatal failure or abort, steps that registered a reversal pop in
//! LIFO order. Each compensator executes as a fresh memoized step named
//! `compensate:<original>`, so a crash mid-compensation resumes exactly
//! where it left off. A compensator failure is recorded and does not
//! block further pops.

use crate::context::AdvanceCtx;
use crate::error::EngineError;
use crate::executor::{StepRun, run_step};
use crate::machines::{StepCall, production};
use crate::providers::ProviderSet;
use greenlight_types::{
    CompensationEntry, CompensationOp, CompensationOutcome, EventType, InstanceState, Payload,
    RetryPolicy, StepError, StepName,
};
use tracing::{info, warn};

/// Drain the persisted stack. Outcomes accumulate in the state fold and
/// are carried on the final `InstanceFailed` event.
pub(crate) async fn run_compensation(
    ctx: &mut AdvanceCtx,
    providers: &ProviderSet,
    default_retry: &RetryPolicy,
) -> Result<(), EngineError> {
    while let Some(entry) = ctx.state.comp_stack.last().cloned() {
        info!(instance = %ctx.instance, step = %entry.step, "compensating");
        let call = compensator_call(&entry, &ctx.state, ctx.instance.full_hex(), providers)?;
        let outcome = match run_step(ctx, call, default_retry).await? {
            StepRun::Completed(_) => CompensationOutcome::succeeded(entry.step.clone()),
            StepRun::Failed(error) => {
                warn!(
                    instance = %ctx.instance,
                    step = %entry.step,
                    error = %error,
                    "compensator failed, continuing with remaining stack"
                );
                CompensationOutcome::failed(entry.step.clone(), error)
            }
        };
        ctx.append(vec![EventType::CompensationApplied {
            step: entry.step.clone(),
            outcome,
        }])
        .await?;
    }
    Ok(())
}

/// Build the executable step for one stack entry. Identifiers a
/// compensator needs (intent, envelope) come out of the original step's
/// memoized output, never from live handles.
fn compensator_call(
    entry: &CompensationEntry,
    state: &InstanceState,
    own_deal_id: String,
    providers: &ProviderSet,
) -> Result<StepCall, EngineError> {
    let name = entry.step.compensation();

    let call = match &entry.op {
        CompensationOp::RefundPayment { intent_step } => {
            let intent_id = memo_field(state, intent_step, "intent_id")?;
            let payments = providers.payments.clone();
            StepCall::new(name.as_str(), move || {
                let payments = payments.clone();
                let intent_id = intent_id.clone();
                async move {
                    payments.refund(&intent_id).await?;
                    Ok(Payload::null())
                }
            })
        }
        CompensationOp::VoidEnvelope { envelope_step } => {
            let envelope_id = memo_field(state, envelope_step, "envelope_id")?;
            let signatures = providers.signatures.clone();
            StepCall::new(name.as_str(), move || {
                let signatures = signatures.clone();
                let envelope_id = envelope_id.clone();
                async move {
                    signatures.void_envelope(&envelope_id).await?;
                    Ok(Payload::null())
                }
            })
        }
        CompensationOp::RevokePitchAccess { pitch_id, party_id } => {
            let entities = providers.entities.clone();
            let pitch_id = pitch_id.clone();
            let party_id = party_id.clone();
            StepCall::new(name.as_str(), move || {
                let entities = entities.clone();
                let pitch_id = pitch_id.clone();
                let party_id = party_id.clone();
                async move {
                    entities.revoke_pitch_access(&pitch_id, &party_id).await?;
                    Ok(Payload::null())
                }
            })
        }
        CompensationOp::ReleaseExclusivity { pitch_id } => {
            let providers = providers.clone();
            let pitch_id = pitch_id.clone();
            StepCall::new(name.as_str(), move || {
                let providers = providers.clone();
                let own_deal_id = own_deal_id.clone();
                let pitch_id = pitch_id.clone();
                async move {
                    let promoted =
                        production::release_and_promote(&providers, &own_deal_id, &pitch_id)
                            .await?;
                    Payload::encode(&serde_json::json!({ "promoted_deal_id": promoted }))
                        .map_err(|e| StepError::fatal(e.to_string()))
                }
            })
        }
        CompensationOp::CancelDealRecord { deal_id } => {
            let entities = providers.entities.clone();
            let deal_id = deal_id.clone();
            StepCall::new(name.as_str(), move || {
                let entities = entities.clone();
                let deal_id = deal_id.clone();
                async move {
                    entities.update_deal_state(&deal_id, "Cancelled").await?;
                    Ok(Payload::null())
                }
            })
        }
    };
    Ok(call)
}

/// Read a string field out of a memoized step output.
fn memo_field(
    state: &InstanceState,
    step: &StepName,
    field: &str,
) -> Result<String, EngineError> {
    state
        .memo_output(step)
        .and_then(|payload| payload.str_field(field))
        .map(str::to_string)
        .ok_or_else(|| {
            EngineError::Corrupted(format!(
                "compensation needs '{field}' from step '{step}', but it is not recorded"
            ))
        })
}
