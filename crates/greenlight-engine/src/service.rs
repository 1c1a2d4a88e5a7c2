//! Ingress operations.
//!
//! Start is idempotent on the client token (the instance id is derived
//! from it), deliveries are at-least-once and FIFO per event name, and
//! parameter validation failures are Domain errors that reject the call
//! synchronously; no instance is created for them.

use crate::context::AdvanceCtx;
use crate::error::EngineError;
use crate::scheduler::{Engine, EngineInner};
use greenlight_journal::{InstanceFilter, InstanceMeta, InstancePage, Page};
use greenlight_types::{
    CompensationOutcome, EventName, EventType, InstanceId, InstanceStatus, InvestmentParams,
    MAX_INVESTMENT, MIN_INVESTMENT, NdaParams, Payload, ProductionParams, StartParams, StepError,
    StepName, WorkflowKind,
};
use std::sync::Arc;
use tracing::{info, warn};

/// Months of pitch access granted when the request does not say.
const DEFAULT_NDA_DURATION_MONTHS: u32 = 24;
/// NDA durations outside 1..=120 months are rejected rather than guessed.
const MAX_NDA_DURATION_MONTHS: u32 = 120;

/// What `get_status` reports.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusView {
    pub instance: InstanceId,
    pub kind: WorkflowKind,
    pub status: InstanceStatus,
    pub current_state: String,
    pub last_version: u64,
    pub last_error: Option<StepError>,
    pub failed_step: Option<StepName>,
    pub terminal_reason: Option<String>,
    pub compensation: Vec<CompensationOutcome>,
}

impl Engine {
    /// Start a workflow. Idempotent on `client_token`: the instance id is
    /// derived from it, and a second start with the same token returns
    /// the existing id without touching the log.
    pub async fn start_workflow(
        &self,
        params: StartParams,
        client_token: Option<String>,
    ) -> Result<InstanceId, EngineError> {
        let mut params = params;
        self.validate_start(&mut params).await?;

        let token =
            client_token.unwrap_or_else(|| uuid::Uuid::new_v4().as_hyphenated().to_string());
        let kind = params.kind();
        let instance = InstanceId::derive(kind, &token);

        let guard = self.inner.locks.acquire(instance).await;
        if self.inner.store.instance_meta(instance).await?.is_some() {
            drop(guard);
            info!(instance = %instance, %kind, "idempotent start hit");
            return Ok(instance);
        }

        let now = self.inner.clock.now();
        self.inner
            .store
            .register_instance(InstanceMeta {
                id: instance,
                kind,
                status: InstanceStatus::Runnable,
                latest_version: 0,
                pitch_id: params.pitch_id().to_string(),
                initiator_id: params.initiator_id().to_string(),
                creator_id: params.creator_id().to_string(),
                created_at: now,
                last_advanced_at: now,
            })
            .await?;
        append_first(
            &self.inner,
            instance,
            EventType::InstanceStarted {
                kind,
                params,
                client_token: token,
            },
        )
        .await?;
        drop(guard);

        info!(instance = %instance, %kind, "workflow started");
        self.enqueue(instance);
        Ok(instance)
    }

    /// Deliver an external event. At-least-once: the receipt is appended
    /// to the instance log, the message queued in the mailbox, and the
    /// instance woken to drain it. Deliveries to terminal instances are
    /// dropped with a log line.
    pub async fn deliver_event(
        &self,
        instance: InstanceId,
        name: EventName,
        payload: Payload,
    ) -> Result<(), EngineError> {
        deliver_internal(&self.inner, instance, name, payload).await?;
        self.enqueue(instance);
        Ok(())
    }

    pub async fn get_status(&self, instance: InstanceId) -> Result<StatusView, EngineError> {
        let _guard = self.inner.locks.acquire(instance).await;
        let ctx = AdvanceCtx::load(
            instance,
            self.inner.store.clone(),
            self.inner.clock.clone(),
            self.inner.config.snapshot_interval,
        )
        .await?;
        let state = ctx.state;
        Ok(StatusView {
            instance,
            kind: state.kind(),
            status: state.status.clone(),
            current_state: state.state.name().to_string(),
            last_version: state.version,
            last_error: state.last_error.as_ref().map(|f| f.error.clone()),
            failed_step: state.last_error.as_ref().map(|f| f.step.clone()),
            terminal_reason: state.state.terminal_reason(),
            compensation: state.comp_outcomes,
        })
    }

    /// Page through instances by party, pitch, and/or kind.
    pub async fn list_instances(
        &self,
        filter: InstanceFilter,
        page: Page,
    ) -> Result<InstancePage, EngineError> {
        Ok(self.inner.store.list_instances(filter, page).await?)
    }

    /// Request cooperative cancellation. Observed at the instance's next
    /// advance, which drains the compensation stack and terminates it as
    /// Failed with the cancelled reason.
    pub async fn abort(&self, instance: InstanceId, reason: &str) -> Result<(), EngineError> {
        let guard = self.inner.locks.acquire(instance).await;
        let mut ctx = AdvanceCtx::load(
            instance,
            self.inner.store.clone(),
            self.inner.clock.clone(),
            self.inner.config.snapshot_interval,
        )
        .await?;
        if ctx.state.status.is_terminal() {
            drop(guard);
            warn!(instance = %instance, "abort of a terminal instance ignored");
            return Ok(());
        }
        ctx.append(vec![EventType::AbortRequested {
            reason: reason.to_string(),
        }])
        .await?;
        drop(guard);
        self.enqueue(instance);
        Ok(())
    }

    async fn validate_start(&self, params: &mut StartParams) -> Result<(), EngineError> {
        match params {
            StartParams::Investment(p) => self.validate_investment(p),
            StartParams::Production(p) => self.validate_production(p).await,
            StartParams::Nda(p) => self.validate_nda(p).await,
        }
    }

    fn validate_investment(&self, params: &InvestmentParams) -> Result<(), EngineError> {
        require_ids(&[
            ("investorId", &params.investor_id),
            ("creatorId", &params.creator_id),
            ("pitchId", &params.pitch_id),
        ])?;
        if params.proposed_amount < MIN_INVESTMENT {
            return Err(EngineError::Validation(format!(
                "proposed amount {} is below the minimum of {MIN_INVESTMENT}",
                params.proposed_amount
            )));
        }
        if params.proposed_amount > MAX_INVESTMENT {
            return Err(EngineError::Validation(format!(
                "proposed amount {} exceeds the maximum of {MAX_INVESTMENT}",
                params.proposed_amount
            )));
        }
        if !params.nda_accepted {
            return Err(EngineError::Validation(
                "the pitch NDA must be accepted before investing".to_string(),
            ));
        }
        Ok(())
    }

    async fn validate_production(&self, params: &ProductionParams) -> Result<(), EngineError> {
        require_ids(&[
            ("productionCompanyId", &params.production_company_id),
            ("pitchId", &params.pitch_id),
            ("creatorId", &params.creator_id),
        ])?;
        let company = self
            .inner
            .providers
            .entities
            .get_company(&params.production_company_id)
            .await
            .map_err(|e| EngineError::Validation(e.message))?;
        if !company.verified {
            return Err(EngineError::Validation(format!(
                "production company '{}' is not verified",
                params.production_company_id
            )));
        }
        Ok(())
    }

    async fn validate_nda(&self, params: &mut NdaParams) -> Result<(), EngineError> {
        require_ids(&[
            ("requesterId", &params.requester_id),
            ("pitchId", &params.pitch_id),
            ("creatorId", &params.creator_id),
            ("templateId", &params.template_id),
        ])?;
        if !valid_email(&params.requester_email) {
            return Err(EngineError::Validation(format!(
                "'{}' is not a valid email address",
                params.requester_email
            )));
        }
        if params.duration_months == 0 {
            params.duration_months = DEFAULT_NDA_DURATION_MONTHS;
        }
        if params.duration_months > MAX_NDA_DURATION_MONTHS {
            return Err(EngineError::Validation(format!(
                "durationMonths {} is outside 1..={MAX_NDA_DURATION_MONTHS}",
                params.duration_months
            )));
        }
        let duplicate = self
            .inner
            .providers
            .entities
            .active_nda_exists(&params.pitch_id, &params.requester_id)
            .await
            .map_err(|e| EngineError::Validation(e.message))?;
        if duplicate {
            return Err(EngineError::Validation(format!(
                "an active NDA already exists for requester '{}' on pitch '{}'",
                params.requester_id, params.pitch_id
            )));
        }
        Ok(())
    }
}

/// Append the opening event of a brand-new log.
async fn append_first(
    inner: &Arc<EngineInner>,
    instance: InstanceId,
    event: EventType,
) -> Result<(), EngineError> {
    let record = greenlight_types::EventRecord {
        event_id: greenlight_types::EventId::derive(&instance, 1),
        version: 1,
        timestamp: inner.clock.now(),
        event,
    };
    inner.store.append(instance, 0, vec![record]).await?;
    Ok(())
}

/// Shared delivery path for ingress and for instance-to-instance
/// notifications. Appends the durable receipt under the target's lock,
/// queues the message, and leaves waking to the caller.
pub(crate) async fn deliver_internal(
    inner: &Arc<EngineInner>,
    instance: InstanceId,
    name: EventName,
    payload: Payload,
) -> Result<(), EngineError> {
    let guard = inner.locks.acquire(instance).await;
    let mut ctx = AdvanceCtx::load(
        instance,
        inner.store.clone(),
        inner.clock.clone(),
        inner.config.snapshot_interval,
    )
    .await?;
    if ctx.state.status.is_terminal() {
        drop(guard);
        warn!(
            instance = %instance,
            event = %name,
            "event delivered after terminality, dropped"
        );
        return Ok(());
    }
    let received_at = inner.clock.now();
    ctx.append(vec![EventType::ExternalEvent {
        name: name.clone(),
        payload: payload.clone(),
        received_at,
    }])
    .await?;
    inner
        .mailbox
        .deliver(instance, name, payload, received_at)
        .await?;
    drop(guard);
    inner.queue.push(instance);
    Ok(())
}

fn require_ids(fields: &[(&str, &str)]) -> Result<(), EngineError> {
    for (name, value) in fields {
        if value.trim().is_empty() {
            return Err(EngineError::Validation(format!("{name} must not be empty")));
        }
    }
    Ok(())
}

/// Shape check only: one `@`, a non-empty local part, a dotted domain.
fn valid_email(email: &str) -> bool {
    if email.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.contains('@') {
        return false;
    }
    let Some((host, tld)) = domain.rsplit_once('.') else {
        return false;
    };
    !host.is_empty() && !tld.is_empty()
}
