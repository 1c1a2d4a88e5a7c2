pub mod compensation;
pub mod domain;
pub mod event;
pub mod id;
pub mod journal;
pub mod payload;
pub mod snapshot;
pub mod step;
pub mod wait;

pub use compensation::{CompensationEntry, CompensationOp, CompensationOutcome};
pub use domain::{
    DomainState, EXCLUSIVITY_DAYS, InterestType, InvestmentParams, InvestmentState,
    InvestmentType, MAX_ACTIVE_PROJECTS, MAX_INVESTMENT, MIN_INVESTMENT, NdaParams, NdaState,
    NegotiationTurn, ProductionParams, ProductionState, RequesterType, RiskAssessment,
    RiskFactors, RiskLevel, RiskRoute, StartParams, TemplateComplexity, WorkflowKind,
};
pub use event::EventType;
pub use id::{EventId, InstanceId};
pub use journal::{EventLog, EventRecord, InstanceStatus};
pub use payload::{Payload, PayloadError};
pub use snapshot::{FailedStep, FulfilledWait, InstanceState, Snapshot, StartInfo};
pub use step::{COMPENSATE_PREFIX, ErrorClass, RetryPolicy, StepError, StepName};
pub use wait::{EventFilter, EventName, WaitDescriptor, WaitOutcome};
