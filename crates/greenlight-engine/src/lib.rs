//! Durable deal-orchestration engine for a film/media marketplace.
//!
//! Long-running Investment, Production, and NDA transactions are modeled
//! as persistent state machines. Each instance is an append-only event
//! log with periodic snapshots; the scheduler replays the log into state,
//! asks the domain machine for the next action, and executes side effects
//! as memoized, retried, compensable steps. Instances suspend
//! indefinitely on external-event waits and timed sleeps and resume when
//! matching events arrive or timers fire, across process restarts.
//!
//! ```no_run
//! use greenlight_engine::Engine;
//! use greenlight_types::{InvestmentParams, InvestmentType, StartParams};
//!
//! # async fn demo() -> Result<(), greenlight_engine::EngineError> {
//! let engine = Engine::in_memory();
//! let instance = engine
//!     .start_workflow(
//!         StartParams::Investment(InvestmentParams {
//!             investor_id: "investor-7".into(),
//!             creator_id: "creator-3".into(),
//!             pitch_id: "pitch-42".into(),
//!             proposed_amount: 250_000,
//!             investment_type: InvestmentType::Equity,
//!             nda_accepted: true,
//!         }),
//!         Some("client-token-1".into()),
//!     )
//!     .await?;
//! engine.run_until_idle().await?;
//! let status = engine.get_status(instance).await?;
//! println!("{}: {}", status.current_state, status.status);
//! # Ok(())
//! # }
//! ```

mod compensate;
mod config;
mod context;
mod error;
mod executor;
mod lock;
pub mod machines;
pub mod providers;
pub mod registry;
pub mod risk;
mod scheduler;
mod service;

pub use config::EngineConfig;
pub use error::EngineError;
pub use machines::{DealMachine, MachineEnv, NextAction, StepCall};
pub use registry::{MachineDef, MachineRegistry};
pub use scheduler::{Engine, EngineBuilder};
pub use service::StatusView;
