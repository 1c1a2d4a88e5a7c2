//! Step execution.
//!
//! A step runs at most once per instance: the memo is consulted before
//! the body, success is recorded with the cached output (and any
//! compensation registration), transient failures retry inside the
//! executor with capped exponential backoff, and exhaustion or a
//! non-retryable failure is recorded and surfaced to the scheduler.

use crate::context::AdvanceCtx;
use crate::machines::StepCall;
use chrono::Duration as ChronoDuration;
use greenlight_types::{EventType, Payload, RetryPolicy, StepError};
use tracing::{debug, warn};

use crate::error::EngineError;

/// How a step run concluded. Engine-level failures (store, invariants)
/// travel separately as `EngineError`.
#[derive(Debug)]
pub(crate) enum StepRun {
    Completed(Payload),
    Failed(StepError),
}

pub(crate) async fn run_step(
    ctx: &mut AdvanceCtx,
    call: StepCall,
    default_retry: &RetryPolicy,
) -> Result<StepRun, EngineError> {
    // Memo first: a replayed or retried advance returns the recorded
    // output without touching the provider again.
    if let Some(cached) = ctx.state.memo_output(&call.name) {
        debug!(instance = %ctx.instance, step = %call.name, "step memo hit");
        return Ok(StepRun::Completed(cached.clone()));
    }

    let retry = call.retry.clone().unwrap_or_else(|| default_retry.clone());
    ctx.append(vec![EventType::StepStarted {
        step: call.name.clone(),
        attempt: 1,
    }])
    .await?;

    let mut attempt = 1u32;
    loop {
        match (call.body)().await {
            Ok(output) => {
                debug!(instance = %ctx.instance, step = %call.name, attempt, "step succeeded");
                ctx.append(vec![EventType::StepSucceeded {
                    step: call.name.clone(),
                    output: output.clone(),
                    compensation: call.compensation.clone(),
                }])
                .await?;
                return Ok(StepRun::Completed(output));
            }
            Err(error) if error.class.is_retryable() && attempt < retry.max_attempts => {
                let delay = retry.delay_before(attempt);
                warn!(
                    instance = %ctx.instance,
                    step = %call.name,
                    attempt,
                    error = %error,
                    delay_ms = delay.as_millis() as u64,
                    "step failed, retrying"
                );
                let retry_at = ctx.now()
                    + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::zero());
                ctx.append(vec![EventType::StepRetrying {
                    step: call.name.clone(),
                    failed_attempt: attempt,
                    error,
                    retry_at,
                }])
                .await?;
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => {
                warn!(
                    instance = %ctx.instance,
                    step = %call.name,
                    attempt,
                    error = %error,
                    "step failed terminally"
                );
                ctx.append(vec![EventType::StepFailed {
                    step: call.name.clone(),
                    error: error.clone(),
                }])
                .await?;
                return Ok(StepRun::Failed(error));
            }
        }
    }
}
