//! The three domain machines.
//!
//! A machine is a pure decider: given the folded [`InstanceState`] it
//! names the next action from a small palette: run a step, open a wait,
//! sleep, apply a transition, or conclude. All side effects live inside
//! step bodies; the machine itself never touches a provider, so its
//! decisions replay identically from the log.

mod investment;
mod nda;
pub(crate) mod production;

pub use investment::InvestmentMachine;
pub use nda::NdaMachine;
pub use production::ProductionMachine;

use crate::error::EngineError;
use crate::providers::ProviderSet;
use chrono::{DateTime, Utc};
use greenlight_types::{
    CompensationOp, DomainState, EventFilter, EventName, FailedStep, InstanceId, InstanceState,
    Payload, RetryPolicy, StepError, StepName, WorkflowKind,
};
use serde::de::DeserializeOwned;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

pub type StepFuture = Pin<Box<dyn Future<Output = Result<Payload, StepError>> + Send>>;
pub type StepBody = Box<dyn Fn() -> StepFuture + Send + Sync>;

/// A named side-effecting closure with retry policy and optional
/// compensator. The body is a factory so each retry attempt gets a fresh
/// future.
pub struct StepCall {
    pub name: StepName,
    /// None inherits the engine default.
    pub retry: Option<RetryPolicy>,
    pub compensation: Option<CompensationOp>,
    pub body: StepBody,
}

impl StepCall {
    pub fn new<F, Fut>(name: &str, body: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload, StepError>> + Send + 'static,
    {
        Self {
            name: StepName::new(name),
            retry: None,
            compensation: None,
            body: Box::new(move || Box::pin(body())),
        }
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn no_retry(self) -> Self {
        self.retry(RetryPolicy::no_retry())
    }

    pub fn compensate(mut self, op: CompensationOp) -> Self {
        self.compensation = Some(op);
        self
    }
}

impl fmt::Debug for StepCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepCall")
            .field("name", &self.name)
            .field("retry", &self.retry)
            .field("compensation", &self.compensation)
            .finish_non_exhaustive()
    }
}

/// What the scheduler should do next for an instance.
#[derive(Debug)]
pub enum NextAction {
    RunStep(StepCall),
    Wait {
        name: EventName,
        filter: Option<EventFilter>,
        deadline: Option<DateTime<Utc>>,
    },
    Sleep {
        until: DateTime<Utc>,
    },
    Transition {
        to: DomainState,
    },
    /// The domain state is terminal and wrap-up is done.
    Complete,
}

/// Per-advance context handed to a machine: who is deciding, when it is,
/// and which providers its step closures may capture.
#[derive(Clone)]
pub struct MachineEnv {
    pub instance: InstanceId,
    pub now: DateTime<Utc>,
    pub providers: ProviderSet,
}

impl MachineEnv {
    /// Idempotency key for a provider call: step name × instance id.
    pub fn idempotency_key(&self, step: &str) -> String {
        format!("{}:{step}", self.instance.full_hex())
    }
}

pub trait DealMachine: Send + Sync {
    fn kind(&self) -> WorkflowKind;

    /// Decide the next action for a runnable instance.
    fn next_action(
        &self,
        state: &InstanceState,
        env: &MachineEnv,
    ) -> Result<NextAction, EngineError>;

    /// Map an unhandled domain step failure onto a terminal transition.
    fn on_domain_failure(
        &self,
        state: &InstanceState,
        failed: &FailedStep,
    ) -> Result<NextAction, EngineError>;

    /// The terminal state applied after an explicit abort.
    fn abort_state(&self, reason: &str) -> DomainState;
}

/// Typed memo read, mapping a shape mismatch to the fatal corrupted-state
/// error: if the log and the deployed machine disagree about a step
/// output, replay determinism is gone.
pub(crate) fn decoded<T: DeserializeOwned>(
    state: &InstanceState,
    step: &StepName,
) -> Result<Option<T>, EngineError> {
    state
        .step_output(step)
        .map_err(|e| EngineError::Corrupted(format!("step '{step}' output: {e}")))
}

/// The machine was consulted with a wait outcome it does not recognize,
/// a replay-determinism failure.
pub(crate) fn unexpected_wait(state: &InstanceState) -> EngineError {
    let seen = state
        .last_wait
        .as_ref()
        .map(|w| w.name.to_string())
        .unwrap_or_else(|| "<none>".to_string());
    EngineError::Corrupted(format!(
        "unexpected wait outcome '{seen}' in state {}",
        state.state
    ))
}
