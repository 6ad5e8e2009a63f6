//! Reconciliation controller.
//!
//! The controller:
//! - Consumes intent events (`vm.created`, `vm.updated`, `vm.deleted`)
//! - Resyncs every known VM on a fixed period
//! - Runs at most one pass per VM at a time, coalescing triggers that arrive
//!   while a pass is in flight into one follow-up pass
//! - Retries transient failures at a fixed interval until the attempt budget
//!   is spent, then marks the VM failed for that generation
//! - Persists status and publishes `vm.status.*` events
//!
//! ```text
//!  intents ──┐
//!            ├──> dispatch(id) ──> worker permit ──> reconcile_one(id)
//!  resync ───┘                                          │
//!                                     load ─> plan ─> execute ─> persist ─> publish
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use kiln_events::{topics, BusError, Event, EventBus, StatusSnapshot};
use kiln_id::VmId;
use kiln_model::{LogicalState, MicroVm, MicroVmStatus};
use kiln_reconcile::{
    Acquire, AttemptTracker, ConvergenceStatus, DeadlineTracker, KeyedFlight, ReconcileError,
};
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use crate::config::ReconcileConfig;
use crate::error::{ControllerError, ErrorClass, PlanError, ReconcileStepError};
use crate::executor::{Executor, PassOutcome};
use crate::machine::{self, PlanContext, Target};
use crate::provider::ProviderRegistry;
use crate::repository::MicroVmRepository;

/// When a VM should be looked at again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    /// Only on the next event or resync.
    No,
    After(Duration),
    /// Within the same call.
    Now,
}

/// Result of [`Controller::reconcile_one`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub convergence: ConvergenceStatus,
    /// Logical state after the last pass; `None` when no pass ran.
    pub state: Option<LogicalState>,
    pub requeue: Requeue,
    /// Passes run by this call. Zero when the trigger was coalesced into a
    /// pass already in flight.
    pub passes: u32,
}

impl ReconcileOutcome {
    fn new(convergence: ConvergenceStatus, state: LogicalState, requeue: Requeue) -> Self {
        Self {
            convergence,
            state: Some(state),
            requeue,
            passes: 1,
        }
    }

    fn coalesced() -> Self {
        Self {
            convergence: ConvergenceStatus::Converging,
            state: None,
            requeue: Requeue::No,
            passes: 0,
        }
    }

    fn gone() -> Self {
        Self {
            convergence: ConvergenceStatus::Gone,
            state: None,
            requeue: Requeue::No,
            passes: 1,
        }
    }
}

struct Inner {
    config: ReconcileConfig,
    repo: Arc<dyn MicroVmRepository>,
    providers: ProviderRegistry,
    executor: Executor,
    bus: EventBus,
    plan_ctx: PlanContext,
    flights: KeyedFlight<VmId>,
    attempts: AttemptTracker<VmId>,
    deadlines: DeadlineTracker<VmId>,
    workers: Arc<Semaphore>,
    tasks: TaskTracker,
    /// Cancels every pass and pending requeue when the loop stops.
    shutdown: CancellationToken,
    /// VMs allowed one pass despite a terminal failure.
    retriggered: Mutex<HashSet<VmId>>,
    /// Newest spec generation announced by an intent, per VM.
    seen_generations: Mutex<HashMap<VmId, u64>>,
}

/// Drives every stored microVM toward its spec.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<Inner>,
}

impl Controller {
    pub fn new(
        config: ReconcileConfig,
        repo: Arc<dyn MicroVmRepository>,
        providers: ProviderRegistry,
        executor: Executor,
        bus: EventBus,
        plan_ctx: PlanContext,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                attempts: AttemptTracker::new(config.maximum_retry),
                deadlines: DeadlineTracker::new(config.delete_vm_timeout),
                workers: Arc::new(Semaphore::new(config.workers.max(1))),
                config,
                repo,
                providers,
                executor,
                bus,
                plan_ctx,
                flights: KeyedFlight::new(),
                tasks: TaskTracker::new(),
                shutdown: CancellationToken::new(),
                retriggered: Mutex::new(HashSet::new()),
                seen_generations: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.inner.config
    }

    /// Run the control loop until `cancel` fires.
    ///
    /// Returns an error only if the intent subscription closes underneath
    /// it. On return every dispatched pass has finished or been cancelled.
    #[instrument(skip_all, name = "controller")]
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), ControllerError> {
        let inner = &self.inner;

        if inner.config.disable_reconcile {
            info!("Reconciliation disabled, waiting for shutdown");
            cancel.cancelled().await;
            return Ok(());
        }

        info!(
            resync_period_secs = inner.config.resync_period.as_secs(),
            maximum_retry = inner.config.maximum_retry,
            retry_interval_secs = inner.config.retry_interval.as_secs(),
            workers = inner.config.workers,
            "Starting reconciliation loop"
        );

        let mut intents = inner.bus.subscribe_topics(&cancel, &topics::INTENTS);
        let mut resync = tokio::time::interval(inner.config.resync_period);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                received = intents.recv() => match received {
                    Some(Ok(envelope)) => self.handle_intent(&envelope.event),
                    Some(Err(BusError::Lagged { skipped })) => {
                        warn!(skipped, "Intent subscription lagged, relying on resync");
                    }
                    Some(Err(BusError::Closed)) | None => {
                        if cancel.is_cancelled() {
                            break Ok(());
                        }
                        error!("Intent subscription closed");
                        break Err(ControllerError::BusClosed);
                    }
                },
                _ = resync.tick() => self.resync().await,
            }
        };

        self.shutdown().await;
        result
    }

    async fn shutdown(&self) {
        let inner = &self.inner;
        inner.shutdown.cancel();
        inner.tasks.close();
        info!(in_flight = inner.flights.in_flight(), "Waiting for reconciles to stop");
        inner.tasks.wait().await;
        info!("Reconciliation loop stopped");
    }

    fn handle_intent(&self, event: &Event) {
        match event {
            Event::MicroVmSpecCreated { id } => self.dispatch(id.clone()),
            Event::MicroVmSpecUpdated { id, generation }
            | Event::MicroVmSpecDeleted { id, generation } => {
                // A new generation gets a fresh attempt budget; a repeated
                // announcement of the same one keeps the count.
                if self.observe_generation(id, *generation) {
                    self.inner.attempts.clear(id);
                } else {
                    debug!(vm_id = %id, generation, "Intent repeats a seen generation");
                }
                self.dispatch(id.clone());
            }
            other => debug!(topic = other.default_topic(), "Ignoring non-intent event"),
        }
    }

    /// Record `generation` for `id`, returning whether it is newer than any
    /// seen before.
    fn observe_generation(&self, id: &VmId, generation: u64) -> bool {
        let mut seen = self.inner.seen_generations.lock();
        match seen.get(id) {
            Some(&last) if last >= generation => false,
            _ => {
                seen.insert(id.clone(), generation);
                true
            }
        }
    }

    async fn resync(&self) {
        match self.inner.repo.list_ids().await {
            Ok(ids) => {
                debug!(count = ids.len(), "Resyncing microVMs");
                for id in ids {
                    self.dispatch(id);
                }
            }
            Err(e) => warn!(error = %e, "Failed to list microVMs for resync"),
        }
    }

    /// Queue a reconcile of `id` on the worker pool.
    pub fn dispatch(&self, id: VmId) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }

        let this = self.clone();
        self.inner.tasks.spawn(async move {
            let inner = &this.inner;
            let permit = tokio::select! {
                biased;
                _ = inner.shutdown.cancelled() => return,
                permit = Arc::clone(&inner.workers).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            };

            let result = this.reconcile_one(&id, &inner.shutdown).await;
            drop(permit);

            match result {
                Ok(ReconcileOutcome {
                    requeue: Requeue::After(delay),
                    ..
                }) => this.requeue_after(id, delay),
                Ok(_) => {}
                Err(e) => error!(vm_id = %id, error = %e, "Reconcile failed"),
            }
        });
    }

    fn requeue_after(&self, id: VmId, delay: Duration) {
        let this = self.clone();
        self.inner.tasks.spawn(async move {
            tokio::select! {
                _ = this.inner.shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => this.dispatch(id),
            }
        });
    }

    /// Allow a VM that failed terminally one more pass at its current
    /// generation, with a fresh attempt and delete budget.
    pub fn retrigger(&self, id: &VmId) {
        info!(vm_id = %id, "Retriggering reconcile");
        let inner = &self.inner;
        inner.retriggered.lock().insert(id.clone());
        inner.attempts.clear(id);
        inner.deadlines.clear(id);
        self.dispatch(id.clone());
    }

    /// Failed attempts recorded for `id` since its last success.
    pub fn attempts(&self, id: &VmId) -> u32 {
        self.inner.attempts.attempts(id)
    }

    /// Reconcile one VM, running follow-up passes for triggers coalesced
    /// while it ran.
    #[instrument(skip_all, fields(vm_id = %id))]
    pub async fn reconcile_one(
        &self,
        id: &VmId,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome, ControllerError> {
        let mut permit = match self.inner.flights.try_acquire(id) {
            Acquire::Acquired(permit) => permit,
            Acquire::Coalesced => {
                debug!("Reconcile already in flight, coalesced");
                return Ok(ReconcileOutcome::coalesced());
            }
        };

        let mut passes = 0;
        loop {
            let mut outcome = self.pass(id, cancel).await?;
            passes += 1;
            outcome.passes = passes;

            if cancel.is_cancelled() {
                return Ok(outcome);
            }
            let again = outcome.requeue == Requeue::Now || permit.take_rerun();
            if !again {
                return Ok(outcome);
            }
            debug!(passes, "Running follow-up pass");
        }
    }

    async fn pass(
        &self,
        id: &VmId,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome, ControllerError> {
        let inner = &self.inner;
        let retriggered = inner.retriggered.lock().remove(id);

        let Some(mut vm) = inner.repo.get(id).await? else {
            debug!("MicroVM no longer stored");
            inner.attempts.clear(id);
            inner.deadlines.clear(id);
            return Ok(ReconcileOutcome::gone());
        };
        vm.check_generation()?;

        if vm.is_terminally_failed() && !retriggered {
            debug!(
                generation = vm.spec.generation,
                "MicroVM failed at this generation, waiting for a new one"
            );
            return Ok(ReconcileOutcome::new(
                ConvergenceStatus::Diverged,
                LogicalState::Failed,
                Requeue::No,
            ));
        }

        if vm.spec.is_deleted() && vm.status.state == LogicalState::Deleted {
            return self.finish_delete(&vm).await;
        }

        let before = vm.status.clone();

        let Some(provider) = inner.providers.get(&vm.spec.provider) else {
            let err = PlanError::UnknownProvider(vm.spec.provider.clone());
            return self.fail_terminally(vm, &before, 1, err.to_string()).await;
        };

        let plan = match machine::plan(
            &vm,
            provider.name(),
            provider.capabilities(),
            &inner.plan_ctx,
        ) {
            Ok(plan) => plan,
            Err(e) => return self.fail_terminally(vm, &before, 1, e.to_string()).await,
        };
        debug!(steps = ?plan.step_names(), target = ?plan.target, "Planned pass");

        let result = if plan.target == Target::Deleted {
            let remaining = inner.deadlines.start(id);
            let timed = if remaining.is_zero() {
                None
            } else {
                tokio::time::timeout(
                    remaining,
                    inner
                        .executor
                        .execute(provider.as_ref(), &mut vm, &plan, cancel),
                )
                .await
                .ok()
            };
            match timed {
                Some(result) => result,
                None => {
                    let err = ReconcileError::Timeout {
                        resource: format!("teardown of {id}"),
                        elapsed: inner
                            .deadlines
                            .elapsed(id)
                            .unwrap_or_else(|| inner.deadlines.budget()),
                    };
                    inner.attempts.clear(id);
                    let attempts = vm.status.retry + 1;
                    return self
                        .fail_terminally(vm, &before, attempts, err.to_string())
                        .await;
                }
            }
        } else {
            inner
                .executor
                .execute(provider.as_ref(), &mut vm, &plan, cancel)
                .await
        };

        match result {
            Ok(outcome) => self.complete(vm, &before, outcome).await,
            Err(e) => self.handle_failure(vm, &before, e).await,
        }
    }

    async fn complete(
        &self,
        vm: MicroVm,
        before: &MicroVmStatus,
        outcome: PassOutcome,
    ) -> Result<ReconcileOutcome, ControllerError> {
        let inner = &self.inner;

        let (convergence, requeue) = match outcome {
            PassOutcome::Deleted => return self.finish_delete(&vm).await,
            PassOutcome::Running | PassOutcome::Unchanged => {
                (ConvergenceStatus::Converged, Requeue::No)
            }
            PassOutcome::Created => (
                ConvergenceStatus::Converging,
                Requeue::After(inner.config.retry_interval),
            ),
            PassOutcome::Drifted => (ConvergenceStatus::Converging, Requeue::Now),
        };

        inner.attempts.clear(&vm.id);
        self.persist(&vm, before).await?;

        if outcome == PassOutcome::Running && before.state != LogicalState::Running {
            info!(
                vm_id = %vm.id,
                generation = vm.spec.generation,
                "MicroVM running"
            );
        }

        Ok(ReconcileOutcome::new(convergence, vm.status.state, requeue))
    }

    async fn finish_delete(&self, vm: &MicroVm) -> Result<ReconcileOutcome, ControllerError> {
        let inner = &self.inner;
        inner.repo.delete(&vm.id).await?;
        inner.attempts.clear(&vm.id);
        inner.deadlines.clear(&vm.id);
        inner.retriggered.lock().remove(&vm.id);
        inner.seen_generations.lock().remove(&vm.id);

        info!(vm_id = %vm.id, "MicroVM deleted");
        self.publish(Event::MicroVmDeleted { id: vm.id.clone() });

        Ok(ReconcileOutcome::new(
            ConvergenceStatus::Gone,
            LogicalState::Deleted,
            Requeue::No,
        ))
    }

    async fn handle_failure(
        &self,
        mut vm: MicroVm,
        before: &MicroVmStatus,
        err: ReconcileStepError,
    ) -> Result<ReconcileOutcome, ControllerError> {
        let inner = &self.inner;
        let message = err.to_string();

        match err.class() {
            ErrorClass::Cancelled => {
                debug!(step = err.step, "Pass cancelled");
                self.persist(&vm, before).await?;
                Ok(ReconcileOutcome::new(
                    ConvergenceStatus::Converging,
                    vm.status.state,
                    Requeue::No,
                ))
            }
            ErrorClass::Validation => self.fail_terminally(vm, before, 1, message).await,
            ErrorClass::Transient => {
                let attempt = inner.attempts.record_failure(&vm.id, &message);
                if attempt.exhausted {
                    inner.attempts.clear(&vm.id);
                    let exhausted = ReconcileError::Exhausted {
                        resource: vm.id.to_string(),
                        attempts: attempt.attempt,
                        last_error: message,
                    };
                    return self
                        .fail_terminally(vm, before, attempt.attempt, exhausted.to_string())
                        .await;
                }

                // Teardown retries share the delete deadline.
                let mut delay = inner.config.retry_interval;
                if vm.spec.is_deleted() {
                    if let Some(remaining) = inner.deadlines.remaining(&vm.id) {
                        if remaining.is_zero() {
                            inner.attempts.clear(&vm.id);
                            let err = ReconcileError::Timeout {
                                resource: format!("teardown of {}", vm.id),
                                elapsed: inner
                                    .deadlines
                                    .elapsed(&vm.id)
                                    .unwrap_or_else(|| inner.deadlines.budget()),
                            };
                            let message = format!("{err}: {message}");
                            return self
                                .fail_terminally(vm, before, attempt.attempt, message)
                                .await;
                        }
                        delay = delay.min(remaining);
                    }
                }

                warn!(
                    vm_id = %vm.id,
                    attempt = attempt.attempt,
                    max_retries = inner.attempts.max_retries(),
                    step = err.step,
                    error = %err.source,
                    "Reconcile attempt failed, will retry"
                );
                vm.status.record_failure(attempt.attempt, message);
                self.persist(&vm, before).await?;

                Ok(ReconcileOutcome::new(
                    ConvergenceStatus::Converging,
                    vm.status.state,
                    Requeue::After(delay),
                ))
            }
        }
    }

    async fn fail_terminally(
        &self,
        mut vm: MicroVm,
        before: &MicroVmStatus,
        attempts: u32,
        message: String,
    ) -> Result<ReconcileOutcome, ControllerError> {
        let generation = vm.spec.generation;
        error!(
            vm_id = %vm.id,
            generation,
            attempts,
            error = %message,
            "MicroVM failed"
        );

        vm.status.mark_failed(generation, attempts, message.clone());
        self.persist(&vm, before).await?;
        self.publish(Event::MicroVmReconcileFailed {
            id: vm.id.clone(),
            generation,
            attempts,
            error: message,
        });

        Ok(ReconcileOutcome::new(
            ConvergenceStatus::Diverged,
            LogicalState::Failed,
            Requeue::No,
        ))
    }

    /// Write the status back if the pass changed it, announcing changes
    /// observers care about.
    async fn persist(&self, vm: &MicroVm, before: &MicroVmStatus) -> Result<(), ControllerError> {
        if vm.status == *before {
            return Ok(());
        }
        self.inner.repo.save_status(&vm.id, &vm.status).await?;

        if vm.status.differs_observably(before) {
            self.publish(Event::MicroVmStatusUpdated {
                id: vm.id.clone(),
                status: StatusSnapshot::from(&vm.status),
            });
        }
        Ok(())
    }

    fn publish(&self, event: Event) {
        if let Err(e) = self.inner.bus.publish_event(event) {
            warn!(error = %e, "Failed to publish event");
        }
    }
}
