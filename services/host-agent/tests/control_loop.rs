//! The control loop as a whole: event-driven dispatch, single flight per
//! VM, disabled reconciliation and shutdown.

mod common;

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{fc_spec, snapshot, wait_for, Harness, PROVIDER};
use kiln_agent::mock::{
    CallLog, MockDiskService, MockImageService, MockNetworkService, MockProvider,
};
use kiln_agent::{
    Capability, Controller, Executor, InMemoryRepository, MachineMetrics, MicroVmCommands,
    MicroVmProvider, PlanContext, PortResult, ProviderRegistry, ReconcileConfig,
};
use kiln_events::{Event, EventBus};
use kiln_id::VmId;
use kiln_model::{LogicalState, MicroVm, MicroVmSpec, ProviderState};
use kiln_reconcile::ConvergenceStatus;
use proptest::prelude::*;
use tokio_util::sync::CancellationToken;

/// Wraps the mock provider, holding each `create` open for a second and
/// tracking how many run at once.
struct SlowCreate {
    inner: MockProvider,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

#[async_trait]
impl MicroVmProvider for SlowCreate {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn capabilities(&self) -> &[Capability] {
        self.inner.capabilities()
    }

    async fn create(&self, vm: &MicroVm) -> PortResult<()> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(1)).await;
        let result = self.inner.create(vm).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn start(&self, vm: &MicroVm) -> PortResult<()> {
        self.inner.start(vm).await
    }

    async fn delete(&self, id: &VmId) -> PortResult<()> {
        self.inner.delete(id).await
    }

    async fn state(&self, id: &VmId) -> PortResult<ProviderState> {
        self.inner.state(id).await
    }

    async fn metrics(&self, id: &VmId) -> PortResult<MachineMetrics> {
        self.inner.metrics(id).await
    }
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_triggers_share_one_flight() {
    let log = CallLog::new();
    let provider = Arc::new(SlowCreate {
        inner: MockProvider::new(PROVIDER, log.clone()),
        active: AtomicUsize::new(0),
        max_active: AtomicUsize::new(0),
    });
    let repo = Arc::new(InMemoryRepository::new());
    let bus = EventBus::new();
    let providers = ProviderRegistry::new().with(provider.clone());
    let controller = Controller::new(
        ReconcileConfig::default(),
        repo.clone(),
        providers.clone(),
        Executor::new(
            Arc::new(MockNetworkService::new(log.clone())),
            Arc::new(MockImageService::new(log.clone())),
            Arc::new(MockDiskService::new(log.clone())),
        ),
        bus.clone(),
        PlanContext {
            data_dir: PathBuf::from("/var/lib/kiln"),
            bridge_name: None,
        },
    );
    let commands = MicroVmCommands::new(repo, bus, providers, PROVIDER);
    let id = commands.create("default", "web", fc_spec()).await.unwrap().id;

    let cancel = CancellationToken::new();
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let controller = controller.clone();
            let id = id.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { controller.reconcile_one(&id, &cancel).await.unwrap() })
        })
        .collect();

    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await.unwrap());
    }

    assert_eq!(provider.max_active.load(Ordering::SeqCst), 1);
    assert_eq!(log.count("provider.create"), 1);
    assert_eq!(log.count("provider.start"), 1);
    assert_eq!(outcomes.iter().filter(|o| o.passes == 0).count(), 7);

    // The flight that ran also picked up the coalesced triggers.
    let ran = outcomes.iter().find(|o| o.passes > 0).unwrap();
    assert_eq!(ran.passes, 2);
    assert_eq!(ran.state, Some(LogicalState::Running));
}

#[tokio::test(start_paused = true)]
async fn test_intents_drive_vm_through_lifecycle() {
    let h = Harness::new();
    let cancel = CancellationToken::new();
    let mut events = h.status_events(&cancel);
    let loop_handle = h.run(&cancel);

    let id = h.create(fc_spec()).await;
    let running = wait_for(&mut events, &id, |e| {
        snapshot(e).is_some_and(|s| s.state == LogicalState::Running)
    })
    .await;
    assert_eq!(snapshot(&running).unwrap().observed_generation, 1);

    h.commands.delete(&id).await.unwrap();
    wait_for(&mut events, &id, |e| matches!(e, Event::MicroVmDeleted { .. })).await;
    assert!(h.stored(&id).await.is_none());
    assert_eq!(h.provider.vm_count(), 0);

    cancel.cancel();
    loop_handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_resync_recovers_missed_intents() {
    let h = Harness::new();
    let id = h.create(fc_spec()).await;
    // Created before the loop subscribed; only resync can find it.
    h.log.clear();

    let cancel = CancellationToken::new();
    let mut events = h.status_events(&cancel);
    let loop_handle = h.run(&cancel);
    wait_for(&mut events, &id, |e| {
        snapshot(e).is_some_and(|s| s.state == LogicalState::Running)
    })
    .await;

    // A VM that stops behind the controller's back is restarted on resync.
    h.provider.remove(&id);
    tokio::time::sleep(Duration::from_secs(601)).await;
    assert_eq!(h.provider.vm_state(&id), Some(ProviderState::Running));
    assert_eq!(h.log.count("provider.create"), 2);

    cancel.cancel();
    loop_handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_disabled_reconcile_touches_nothing() {
    let h = Harness::builder()
        .config(|c| c.disable_reconcile = true)
        .build();
    let cancel = CancellationToken::new();
    let loop_handle = h.run(&cancel);

    let id = h.create(fc_spec()).await;
    tokio::time::sleep(Duration::from_secs(3600)).await;

    assert!(h.log.entries().is_empty());
    assert_eq!(h.vm(&id).await.status.state, LogicalState::Pending);

    cancel.cancel();
    loop_handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_interrupts_hung_pass_and_keeps_progress() {
    let h = Harness::new();
    h.provider.hang("start");
    let cancel = CancellationToken::new();
    let loop_handle = h.run(&cancel);

    let id = h.create(fc_spec()).await;
    while h.log.count("provider.start") == 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), loop_handle)
        .await
        .expect("controller stops promptly")
        .unwrap();

    let vm = h.vm(&id).await;
    assert_ne!(vm.status.state, LogicalState::Running);
    assert_eq!(vm.status.retry, 0);
    assert!(vm.status.volumes.contains_key("root"));
    assert_eq!(vm.status.provider_state, ProviderState::Configured);
    assert!(vm.status.applied_shape.is_some());
}

#[derive(Debug, Clone)]
enum Op {
    Update(u32),
    Reconcile,
    FailStart,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1u32..4).prop_map(Op::Update),
        Just(Op::Reconcile),
        Just(Op::FailStart),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_observed_generation_never_passes_spec(ops in prop::collection::vec(op(), 1..16)) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        rt.block_on(async {
            let h = Harness::new();
            let id = h.create(fc_spec()).await;
            let mut generation = 1;
            let mut observed = 0;

            for op in ops {
                match op {
                    Op::Update(vcpu) => {
                        let spec = MicroVmSpec { vcpu, ..fc_spec() };
                        h.commands.update(&id, spec).await.unwrap();
                        generation += 1;
                    }
                    Op::Reconcile => {
                        let outcome = h.reconcile(&id).await;
                        if outcome.convergence == ConvergenceStatus::Converged {
                            let vm = h.vm(&id).await;
                            prop_assert_eq!(vm.status.state, LogicalState::Running);
                            prop_assert_eq!(vm.status.observed_generation, generation);
                        }
                    }
                    Op::FailStart => h.provider.fail_times("start", 1, "boot failed"),
                }

                let vm = h.vm(&id).await;
                prop_assert_eq!(vm.spec.generation, generation);
                prop_assert!(vm.status.observed_generation <= vm.spec.generation);
                prop_assert!(vm.status.observed_generation >= observed);
                observed = vm.status.observed_generation;
            }
            Ok::<(), TestCaseError>(())
        })?;
    }
}
