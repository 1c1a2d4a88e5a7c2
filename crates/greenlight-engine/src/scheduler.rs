//! Instance scheduler.
//!
//! Owns the runnable queue and advances one instance at a time under its
//! write lock: rebuild state from the log, drain pending failure or abort
//! into compensation, resolve outstanding waits against the mailbox and
//! the clock, and otherwise dispatch whatever the domain machine decides
//! next. Instances advance in parallel; a single instance never does.

use crate::compensate;
use crate::config::EngineConfig;
use crate::context::AdvanceCtx;
use crate::error::EngineError;
use crate::executor;
use crate::lock::LockManager;
use crate::machines::{
    DealMachine, InvestmentMachine, MachineEnv, NdaMachine, NextAction, ProductionMachine,
};
use crate::providers::{
    InstanceNotifier, MemoryDocumentStore, MemoryEntityStore, MemoryNotificationSink,
    MemoryPaymentProvider, MemorySignatureProvider, MemoryTemplateStore, ProviderSet,
};
use crate::registry::MachineRegistry;
use async_trait::async_trait;
use greenlight_journal::{
    Clock, EventStore, InMemoryEventStore, InMemoryMailbox, InMemoryTimerService, Mailbox,
    StoreError, SystemClock, TimerService,
};
use greenlight_types::{
    ErrorClass, EventName, EventType, InstanceId, Payload, StepError, WaitDescriptor, WaitOutcome,
    WorkflowKind,
};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Iteration bound for one advance cycle. A healthy machine parks or
/// terminates long before this; hitting the bound means a decision loop
/// is not making progress.
const MAX_ACTIONS_PER_ADVANCE: u32 = 256;

#[derive(Default)]
pub(crate) struct RunQueue {
    inner: Mutex<(VecDeque<InstanceId>, HashSet<InstanceId>)>,
    notify: tokio::sync::Notify,
}

impl RunQueue {
    pub fn push(&self, instance: InstanceId) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.1.insert(instance) {
            inner.0.push_back(instance);
        }
        drop(inner);
        self.notify.notify_one();
    }

    pub fn pop(&self) -> Option<InstanceId> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let next = inner.0.pop_front();
        if let Some(id) = &next {
            inner.1.remove(id);
        }
        next
    }

    pub async fn notified(&self) {
        self.notify.notified().await
    }
}

pub(crate) struct EngineInner {
    pub config: EngineConfig,
    pub store: Arc<dyn EventStore>,
    pub mailbox: Arc<dyn Mailbox>,
    pub timers: Arc<dyn TimerService>,
    pub clock: Arc<dyn Clock>,
    pub locks: LockManager,
    pub registry: MachineRegistry,
    pub providers: ProviderSet,
    pub queue: RunQueue,
    investment: InvestmentMachine,
    production: ProductionMachine,
    nda: NdaMachine,
    shutdown: AtomicBool,
}

impl EngineInner {
    pub fn machine(&self, kind: WorkflowKind) -> &dyn DealMachine {
        match kind {
            WorkflowKind::Investment => &self.investment,
            WorkflowKind::Production => &self.production,
            WorkflowKind::Nda => &self.nda,
        }
    }
}

/// Cross-instance delivery for steps (waitlist promotion). Holds a weak
/// reference so a dropped engine fails the step instead of leaking.
struct EnginePeers {
    inner: Weak<EngineInner>,
}

#[async_trait]
impl InstanceNotifier for EnginePeers {
    async fn deliver(
        &self,
        instance: InstanceId,
        name: EventName,
        payload: Payload,
    ) -> Result<(), StepError> {
        let Some(inner) = self.inner.upgrade() else {
            return Err(StepError::fatal("engine is shut down"));
        };
        crate::service::deliver_internal(&inner, instance, name, payload)
            .await
            .map_err(|e| StepError::transient(e.to_string()))
    }
}

/// The deal-orchestration engine: ingress API plus scheduler.
#[derive(Clone)]
pub struct Engine {
    pub(crate) inner: Arc<EngineInner>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// In-memory engine with default config, the test and reference
    /// configuration.
    pub fn in_memory() -> Self {
        Self::builder().build()
    }

    /// Move every instance whose timer has fired onto the runnable queue.
    pub async fn tick_timers(&self) -> Result<(), EngineError> {
        for instance in self.inner.timers.due(self.inner.clock.now()).await? {
            debug!(instance = %instance, "timer fired");
            self.inner.queue.push(instance);
        }
        Ok(())
    }

    /// Drain the runnable queue until no instance has work left. Timer
    /// fires are folded in between rounds, so a wait whose deadline the
    /// clock has already crossed resolves within the same call.
    pub async fn run_until_idle(&self) -> Result<(), EngineError> {
        loop {
            self.tick_timers().await?;
            let mut progressed = false;
            while let Some(instance) = self.inner.queue.pop() {
                progressed = true;
                self.advance(instance).await?;
            }
            if !progressed {
                return Ok(());
            }
        }
    }

    /// Background worker loop: drains the queue, polls timers, parks on
    /// the queue notifier between rounds. Stop with [`Engine::shutdown`].
    pub fn spawn(&self) -> tokio::task::JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            info!("scheduler worker started");
            while !engine.inner.shutdown.load(Ordering::Relaxed) {
                if let Err(e) = engine.tick_timers().await {
                    error!(error = %e, "timer tick failed");
                }
                while let Some(instance) = engine.inner.queue.pop() {
                    if let Err(e) = engine.advance(instance).await {
                        error!(instance = %instance, error = %e, "advance failed");
                    }
                }
                tokio::select! {
                    _ = engine.inner.queue.notified() => {}
                    _ = tokio::time::sleep(Duration::from_millis(250)) => {}
                }
            }
            info!("scheduler worker stopped");
        })
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Relaxed);
        self.inner.queue.notify.notify_one();
    }

    pub(crate) fn enqueue(&self, instance: InstanceId) {
        self.inner.queue.push(instance);
    }

    /// Advance one instance to its next suspension point or terminal.
    pub async fn advance(&self, instance: InstanceId) -> Result<(), EngineError> {
        let guard = self.inner.locks.acquire(instance).await;
        let result = self.advance_locked(instance).await;
        drop(guard);
        result
    }

    async fn advance_locked(&self, instance: InstanceId) -> Result<(), EngineError> {
        let mut conflicts = 0;
        loop {
            let mut ctx = AdvanceCtx::load(
                instance,
                self.inner.store.clone(),
                self.inner.clock.clone(),
                self.inner.config.snapshot_interval,
            )
            .await?;
            match self.drive(&mut ctx).await {
                Ok(()) => return Ok(()),
                Err(EngineError::Store(StoreError::VersionConflict { .. }))
                    if conflicts < self.inner.config.max_append_retries =>
                {
                    // A competing writer moved the log; rebuild and retry
                    // on the fresh state.
                    conflicts += 1;
                    warn!(instance = %instance, conflicts, "version conflict, rebuilding");
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn drive(&self, ctx: &mut AdvanceCtx) -> Result<(), EngineError> {
        let inner = &self.inner;
        let kind = ctx.state.kind();

        for _ in 0..MAX_ACTIONS_PER_ADVANCE {
            if ctx.state.status.is_terminal() {
                return self.finalize(ctx).await;
            }

            // Failure and abort precede everything else, and resume after
            // a crash: an unfinished compensation shows up here again.
            if let Some(error) = pending_failure(ctx) {
                compensate::run_compensation(ctx, &inner.providers, &inner.config.default_retry)
                    .await?;
                if ctx.state.abort_reason.is_some() && !ctx.state.state.is_terminal() {
                    let reason = ctx.state.abort_reason.clone().unwrap_or_default();
                    let to = inner.machine(kind).abort_state(&reason);
                    inner.registry.check_transition(kind, &ctx.state.state, &to)?;
                    ctx.append(vec![EventType::TransitionApplied {
                        from: ctx.state.state.clone(),
                        to,
                    }])
                    .await?;
                }
                let compensation = ctx.state.comp_outcomes.clone();
                ctx.append(vec![EventType::InstanceFailed {
                    error,
                    compensation,
                }])
                .await?;
                continue;
            }

            // Outstanding wait: poll the mailbox atomically under the
            // lock, honor the deadline, or park.
            if let Some(wait) = ctx.state.wait.clone() {
                match wait {
                    WaitDescriptor::Event {
                        name,
                        filter,
                        deadline,
                    } => {
                        if let Some(message) = inner
                            .mailbox
                            .take(ctx.instance, &name, filter.as_ref())
                            .await?
                        {
                            inner.timers.cancel(ctx.instance).await?;
                            ctx.append(vec![EventType::WaitFulfilled {
                                name,
                                outcome: WaitOutcome::Event {
                                    payload: message.payload,
                                },
                            }])
                            .await?;
                            continue;
                        }
                        if let Some(at) = deadline {
                            if ctx.now() >= at {
                                inner.timers.cancel(ctx.instance).await?;
                                ctx.append(vec![EventType::WaitFulfilled {
                                    name,
                                    outcome: WaitOutcome::TimedOut,
                                }])
                                .await?;
                                continue;
                            }
                            inner.timers.schedule(ctx.instance, at).await?;
                        }
                        return self.park(ctx).await;
                    }
                    WaitDescriptor::Sleep { until } => {
                        if ctx.now() >= until {
                            inner.timers.cancel(ctx.instance).await?;
                            ctx.append(vec![EventType::SleepFired]).await?;
                            continue;
                        }
                        inner.timers.schedule(ctx.instance, until).await?;
                        return self.park(ctx).await;
                    }
                }
            }

            // Let the machine decide. An unhandled domain failure goes
            // through its failure hook instead.
            let machine = inner.machine(kind);
            let action = match ctx.state.failed_step() {
                Some(failed) if failed.error.class == ErrorClass::Domain => {
                    machine.on_domain_failure(&ctx.state, failed)?
                }
                _ => {
                    let env = MachineEnv {
                        instance: ctx.instance,
                        now: ctx.now(),
                        providers: inner.providers.clone(),
                    };
                    machine.next_action(&ctx.state, &env)?
                }
            };

            match action {
                NextAction::RunStep(call) => {
                    // Failures fold into state; the top of the loop or
                    // the machine's failure hook picks them up.
                    let _ = executor::run_step(ctx, call, &inner.config.default_retry).await?;
                }
                NextAction::Wait {
                    name,
                    filter,
                    deadline,
                } => {
                    ctx.append(vec![EventType::WaitStarted {
                        name,
                        filter,
                        deadline,
                    }])
                    .await?;
                }
                NextAction::Sleep { until } => {
                    ctx.append(vec![EventType::SleepStarted { until }]).await?;
                }
                NextAction::Transition { to } => {
                    inner.registry.check_transition(kind, &ctx.state.state, &to)?;
                    debug!(
                        instance = %ctx.instance,
                        from = ctx.state.state.name(),
                        to = to.name(),
                        "transition"
                    );
                    ctx.append(vec![EventType::TransitionApplied {
                        from: ctx.state.state.clone(),
                        to,
                    }])
                    .await?;
                }
                NextAction::Complete => {
                    ctx.append(vec![EventType::InstanceCompleted {
                        final_state: ctx.state.state.clone(),
                    }])
                    .await?;
                }
            }
        }

        Err(EngineError::Corrupted(format!(
            "instance {} exceeded {MAX_ACTIONS_PER_ADVANCE} actions without suspending",
            ctx.instance
        )))
    }

    /// Leave the instance suspended (Waiting or Sleeping).
    async fn park(&self, ctx: &mut AdvanceCtx) -> Result<(), EngineError> {
        self.update_meta(ctx).await
    }

    async fn finalize(&self, ctx: &mut AdvanceCtx) -> Result<(), EngineError> {
        info!(
            instance = %ctx.instance,
            status = %ctx.state.status,
            state = ctx.state.state.name(),
            version = ctx.state.version,
            "instance finished"
        );
        ctx.write_snapshot().await?;
        self.inner.mailbox.purge(ctx.instance).await?;
        self.inner.timers.cancel(ctx.instance).await?;
        self.update_meta(ctx).await?;
        self.inner.locks.release_terminal(ctx.instance);
        Ok(())
    }

    async fn update_meta(&self, ctx: &AdvanceCtx) -> Result<(), EngineError> {
        self.inner
            .store
            .update_instance(
                ctx.instance,
                ctx.state.status.clone(),
                ctx.state.version,
                self.inner.clock.now(),
            )
            .await?;
        Ok(())
    }
}

/// The error that should drive this instance into compensation, if any.
fn pending_failure(ctx: &AdvanceCtx) -> Option<StepError> {
    if let Some(reason) = &ctx.state.abort_reason {
        return Some(StepError::domain(format!("cancelled: {reason}")));
    }
    if ctx.state.state.is_failure() {
        let reason = ctx
            .state
            .state
            .terminal_reason()
            .unwrap_or_else(|| "workflow failed".to_string());
        return Some(StepError::domain(reason));
    }
    match ctx.state.failed_step() {
        Some(failed) if failed.error.class != ErrorClass::Domain => Some(failed.error.clone()),
        _ => None,
    }
}

#[derive(Default)]
pub struct EngineBuilder {
    config: Option<EngineConfig>,
    store: Option<Arc<dyn EventStore>>,
    mailbox: Option<Arc<dyn Mailbox>>,
    timers: Option<Arc<dyn TimerService>>,
    clock: Option<Arc<dyn Clock>>,
    entities: Option<Arc<dyn crate::providers::EntityStore>>,
    documents: Option<Arc<dyn crate::providers::DocumentStore>>,
    templates: Option<Arc<dyn crate::providers::TemplateStore>>,
    payments: Option<Arc<dyn crate::providers::PaymentProvider>>,
    signatures: Option<Arc<dyn crate::providers::SignatureProvider>>,
    notifications: Option<Arc<dyn crate::providers::NotificationSink>>,
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn store(mut self, store: Arc<dyn EventStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn mailbox(mut self, mailbox: Arc<dyn Mailbox>) -> Self {
        self.mailbox = Some(mailbox);
        self
    }

    pub fn timers(mut self, timers: Arc<dyn TimerService>) -> Self {
        self.timers = Some(timers);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn entities(mut self, entities: Arc<dyn crate::providers::EntityStore>) -> Self {
        self.entities = Some(entities);
        self
    }

    pub fn documents(mut self, documents: Arc<dyn crate::providers::DocumentStore>) -> Self {
        self.documents = Some(documents);
        self
    }

    pub fn templates(mut self, templates: Arc<dyn crate::providers::TemplateStore>) -> Self {
        self.templates = Some(templates);
        self
    }

    pub fn payments(mut self, payments: Arc<dyn crate::providers::PaymentProvider>) -> Self {
        self.payments = Some(payments);
        self
    }

    pub fn signatures(
        mut self,
        signatures: Arc<dyn crate::providers::SignatureProvider>,
    ) -> Self {
        self.signatures = Some(signatures);
        self
    }

    pub fn notifications(
        mut self,
        notifications: Arc<dyn crate::providers::NotificationSink>,
    ) -> Self {
        self.notifications = Some(notifications);
        self
    }

    pub fn build(self) -> Engine {
        let inner = Arc::new_cyclic(|weak: &Weak<EngineInner>| {
            let providers = ProviderSet {
                entities: self
                    .entities
                    .unwrap_or_else(|| Arc::new(MemoryEntityStore::new())),
                documents: self
                    .documents
                    .unwrap_or_else(|| Arc::new(MemoryDocumentStore::new())),
                templates: self
                    .templates
                    .unwrap_or_else(|| Arc::new(MemoryTemplateStore::new())),
                payments: self
                    .payments
                    .unwrap_or_else(|| Arc::new(MemoryPaymentProvider::new())),
                signatures: self
                    .signatures
                    .unwrap_or_else(|| Arc::new(MemorySignatureProvider::new())),
                notifications: self
                    .notifications
                    .unwrap_or_else(|| Arc::new(MemoryNotificationSink::new())),
                peers: Arc::new(EnginePeers {
                    inner: weak.clone(),
                }),
            };
            EngineInner {
                config: self.config.unwrap_or_default(),
                store: self
                    .store
                    .unwrap_or_else(|| Arc::new(InMemoryEventStore::new())),
                mailbox: self
                    .mailbox
                    .unwrap_or_else(|| Arc::new(InMemoryMailbox::new())),
                timers: self
                    .timers
                    .unwrap_or_else(|| Arc::new(InMemoryTimerService::new())),
                clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
                locks: LockManager::new(),
                registry: MachineRegistry::new(),
                providers,
                queue: RunQueue::default(),
                investment: InvestmentMachine,
                production: ProductionMachine,
                nda: NdaMachine,
                shutdown: AtomicBool::new(false),
            }
        });
        Engine { inner }
    }
}
