//! Shared wiring for the integration tests: mock adapters behind the real
//! controller, command façade and in-memory repository.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use kiln_agent::mock::{
    CallLog, MockDiskService, MockImageService, MockNetworkService, MockProvider,
};
use kiln_agent::{
    Capability, Controller, Executor, InMemoryRepository, MicroVmCommands, MicroVmRepository,
    PlanContext, ProviderRegistry, ReconcileConfig, ReconcileOutcome,
};
use kiln_events::{Event, EventBus, StatusSnapshot, Subscription};
use kiln_id::VmId;
use kiln_model::{MicroVm, MicroVmSpec};
use tokio_util::sync::CancellationToken;

pub const PROVIDER: &str = "fc";

pub struct Harness {
    pub log: CallLog,
    pub provider: Arc<MockProvider>,
    pub network: Arc<MockNetworkService>,
    pub images: Arc<MockImageService>,
    pub disks: Arc<MockDiskService>,
    pub repo: Arc<InMemoryRepository>,
    pub bus: EventBus,
    pub commands: MicroVmCommands,
    pub controller: Controller,
}

pub struct HarnessBuilder {
    config: ReconcileConfig,
    capabilities: Option<Vec<Capability>>,
}

impl HarnessBuilder {
    pub fn config(mut self, f: impl FnOnce(&mut ReconcileConfig)) -> Self {
        f(&mut self.config);
        self
    }

    pub fn capabilities(mut self, capabilities: Vec<Capability>) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    pub fn build(self) -> Harness {
        let log = CallLog::new();
        let mut provider = MockProvider::new(PROVIDER, log.clone());
        if let Some(capabilities) = self.capabilities {
            provider = provider.with_capabilities(capabilities);
        }
        let provider = Arc::new(provider);
        let network = Arc::new(MockNetworkService::new(log.clone()));
        let images = Arc::new(MockImageService::new(log.clone()));
        let disks = Arc::new(MockDiskService::new(log.clone()));
        let repo = Arc::new(InMemoryRepository::new());
        let bus = EventBus::new();
        let providers = ProviderRegistry::new().with(provider.clone());

        let controller = Controller::new(
            self.config,
            repo.clone(),
            providers.clone(),
            Executor::new(network.clone(), images.clone(), disks.clone()),
            bus.clone(),
            PlanContext {
                data_dir: PathBuf::from("/var/lib/kiln"),
                bridge_name: Some("br0".into()),
            },
        );
        let commands = MicroVmCommands::new(repo.clone(), bus.clone(), providers, PROVIDER);

        Harness {
            log,
            provider,
            network,
            images,
            disks,
            repo,
            bus,
            commands,
            controller,
        }
    }
}

impl Harness {
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder {
            config: ReconcileConfig {
                resync_period: Duration::from_secs(600),
                maximum_retry: 3,
                retry_interval: Duration::from_secs(5),
                delete_vm_timeout: Duration::from_secs(30),
                disable_reconcile: false,
                workers: 4,
            },
            capabilities: None,
        }
    }

    pub fn new() -> Self {
        Self::builder().build()
    }

    pub async fn create(&self, spec: MicroVmSpec) -> VmId {
        self.commands
            .create("default", "web", spec)
            .await
            .expect("create")
            .id
    }

    pub async fn reconcile(&self, id: &VmId) -> ReconcileOutcome {
        self.controller
            .reconcile_one(id, &CancellationToken::new())
            .await
            .expect("reconcile")
    }

    pub async fn vm(&self, id: &VmId) -> MicroVm {
        self.repo
            .get(id)
            .await
            .expect("repository")
            .expect("vm stored")
    }

    pub async fn stored(&self, id: &VmId) -> Option<MicroVm> {
        self.repo.get(id).await.expect("repository")
    }

    /// Subscribe to every status topic.
    pub fn status_events(&self, cancel: &CancellationToken) -> Subscription {
        self.bus
            .subscribe_topic(cancel, kiln_events::topics::MICROVM_STATUS_ALL)
    }

    /// Start the control loop in the background.
    pub fn run(&self, cancel: &CancellationToken) -> tokio::task::JoinHandle<()> {
        let controller = self.controller.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            controller.run(cancel).await.expect("controller run");
        })
    }
}

/// The VM from the basic scenario: one vCPU, 128 MiB, alpine root.
pub fn fc_spec() -> MicroVmSpec {
    MicroVmSpec::new(PROVIDER, 1, 128, "alpine:latest")
}

/// Wait (in virtual time) for the first status event matching `pred`.
pub async fn wait_for(
    events: &mut Subscription,
    id: &VmId,
    mut pred: impl FnMut(&Event) -> bool,
) -> Event {
    tokio::time::timeout(Duration::from_secs(3600), async {
        loop {
            match events.recv().await {
                Some(Ok(envelope)) if envelope.event.vm_id() == id && pred(&envelope.event) => {
                    return envelope.event.clone();
                }
                Some(_) => {}
                None => panic!("status subscription ended"),
            }
        }
    })
    .await
    .expect("status event")
}

/// Status snapshot carried by a `vm.status.updated` event.
pub fn snapshot(event: &Event) -> Option<&StatusSnapshot> {
    match event {
        Event::MicroVmStatusUpdated { status, .. } => Some(status),
        _ => None,
    }
}
