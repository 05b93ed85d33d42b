use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use beskar7_config::Settings;
use beskar7_controllers::{
    ClusterReconciler, Context, HostReconciler, MachineReconciler, RedfishJobRunner, Requeue,
};
use beskar7_coordinator::{ClaimCoordinator, LeaderGate};
use beskar7_domain::{
    conditions, parse_provider_id, Beskar7Cluster, Beskar7Machine, ClusterSpec, ClusterStatus,
    ConditionStatus, ConsumerRef, ControlPlaneEndpoint, HostState, MachinePhase, MachineSpec,
    MachineStatus, ObjectKey, ObjectMeta, OsFamily, PhysicalHost, PhysicalHostSpec,
    PhysicalHostStatus, PowerState, ProvisioningMode,
};
use beskar7_metrics::Metrics;
use beskar7_queue::ProvisioningQueue;
use beskar7_redfish::{ClientCache, FakeRedfishFactory};
use beskar7_store::{InMemoryStore, ObjectStore, Secret};
use tokio::sync::watch;
use uuid::Uuid;

struct Harness {
    ctx: Arc<Context>,
    store: Arc<InMemoryStore>,
    factory: Arc<FakeRedfishFactory>,
    hosts: HostReconciler,
    machines: MachineReconciler,
    clusters: ClusterReconciler,
    _shutdown: watch::Sender<bool>,
}

async fn harness() -> Harness {
    harness_with(Settings::default()).await
}

async fn harness_with(settings: Settings) -> Harness {
    let store = Arc::new(InMemoryStore::new());
    let factory = Arc::new(FakeRedfishFactory::new());
    let metrics = Arc::new(Metrics::new());
    let settings = Arc::new(settings);

    let gate = Arc::new(LeaderGate::new(store.clone(), &settings.leader, metrics.clone()));
    let coordinator = Arc::new(ClaimCoordinator::new(store.clone(), gate, metrics.clone()));
    let queue = ProvisioningQueue::new(settings.queue.clone(), metrics.clone());

    let ctx = Arc::new(Context {
        store: store.clone(),
        redfish: Arc::new(ClientCache::new(factory.clone())),
        queue: queue.clone(),
        coordinator,
        metrics,
        settings,
        namespace: "ns1".to_string(),
    });

    let (shutdown, rx) = watch::channel(false);
    tokio::spawn(queue.run(RedfishJobRunner::new(ctx.clone()), rx));

    Harness {
        hosts: HostReconciler::new(ctx.clone()),
        machines: MachineReconciler::new(ctx.clone()),
        clusters: ClusterReconciler::new(ctx.clone()),
        ctx,
        store,
        factory,
        _shutdown: shutdown,
    }
}

impl Harness {
    async fn seed_secret(&self, name: &str) {
        self.store
            .put_secret(Secret {
                metadata: ObjectMeta::new("ns1", name),
                data: [
                    ("username".to_string(), "admin".to_string()),
                    ("password".to_string(), "secret".to_string()),
                ]
                .into_iter()
                .collect(),
            })
            .await;
    }

    async fn seed_host(&self, name: &str) -> PhysicalHost {
        self.seed_secret(&format!("{name}-credentials")).await;
        self.store
            .create_host(&PhysicalHost {
                metadata: ObjectMeta::new("ns1", name),
                spec: PhysicalHostSpec {
                    redfish_address: format!("https://bmc-{name}"),
                    credentials_ref: format!("{name}-credentials"),
                    insecure_skip_verify: false,
                    consumer_ref: None,
                    boot_iso_source: None,
                    user_data_ref: None,
                },
                status: PhysicalHostStatus::default(),
            })
            .await
            .unwrap()
    }

    async fn seed_machine(&self, name: &str) -> Beskar7Machine {
        self.store
            .create_machine(&Beskar7Machine {
                metadata: ObjectMeta::new("ns1", name),
                spec: MachineSpec {
                    os_family: OsFamily::Kairos,
                    image_url: "http://img/kairos.iso".to_string(),
                    provisioning_mode: ProvisioningMode::RemoteConfig,
                    config_url: Some(format!("http://cfg/{name}.yaml")),
                    provider_id: None,
                    host_selector: BTreeMap::new(),
                },
                status: MachineStatus::default(),
            })
            .await
            .unwrap()
    }

    async fn reconcile_host(&self, name: &str) -> Requeue {
        use beskar7_controllers::Reconciler;
        self.hosts.reconcile(ObjectKey::new("ns1", name)).await.unwrap()
    }

    async fn reconcile_machine(&self, name: &str) -> Requeue {
        use beskar7_controllers::Reconciler;
        self.machines.reconcile(ObjectKey::new("ns1", name)).await.unwrap()
    }

    async fn host(&self, name: &str) -> Option<PhysicalHost> {
        self.store.get_host(&ObjectKey::new("ns1", name)).await.unwrap()
    }

    async fn machine(&self, name: &str) -> Option<Beskar7Machine> {
        self.store.get_machine(&ObjectKey::new("ns1", name)).await.unwrap()
    }
}

async fn settle() {
    // Let the queue dispatcher and workers run; paused clock auto-advances.
    tokio::time::sleep(Duration::from_secs(120)).await;
}

#[tokio::test(start_paused = true)]
async fn happy_path_host_and_machine_reach_running() {
    let h = harness().await;
    h.seed_host("h1").await;
    h.seed_host("h2").await;
    h.seed_machine("m1").await;

    // Enrollment: both hosts become Available with hardware facts.
    h.reconcile_host("h1").await;
    h.reconcile_host("h2").await;
    for name in ["h1", "h2"] {
        let host = h.host(name).await.unwrap();
        assert_eq!(host.status.state, HostState::Available);
        assert!(host.status.hardware_details.is_some());
        assert!(conditions::is_condition_true(
            &host.status.conditions,
            conditions::REDFISH_CONNECTION_READY
        ));
    }

    // Claim: exactly one host is bound, boot parameters land on its spec.
    h.reconcile_machine("m1").await;
    let machine = h.machine("m1").await.unwrap();
    let provider_id = machine.spec.provider_id.clone().expect("provider id assigned");
    let (ns, host_name) = parse_provider_id(&provider_id).unwrap();
    assert_eq!(ns, "ns1");
    assert_eq!(machine.status.phase, MachinePhase::Provisioning);

    let bound = h.host(&host_name).await.unwrap();
    assert_eq!(bound.status.state, HostState::Claimed);
    assert_eq!(
        bound.spec.consumer_ref.as_ref().unwrap().uid,
        machine.metadata.uid.unwrap()
    );
    assert_eq!(bound.spec.boot_iso_source.as_deref(), Some("http://img/kairos.iso"));
    assert_eq!(bound.spec.user_data_ref.as_deref(), Some("http://cfg/m1.yaml"));

    let other = if host_name == "h1" { "h2" } else { "h1" };
    assert!(h.host(other).await.unwrap().spec.consumer_ref.is_none());

    // Provisioning side effects run through the queue.
    h.reconcile_host(&host_name).await;
    assert_eq!(h.host(&host_name).await.unwrap().status.state, HostState::Provisioning);
    settle().await;

    let bmc = h.factory.bmc(&format!("https://bmc-{host_name}"));
    assert_eq!(bmc.power(), PowerState::On);
    assert!(bmc.media().inserted);
    assert_eq!(bmc.media().image.as_deref(), Some("http://img/kairos.iso"));
    assert_eq!(
        bmc.bios_attribute("KernelArgs").as_deref(),
        Some("config_url=http://cfg/m1.yaml")
    );
    assert!(bmc.boot_override().is_some());

    // Observation advances the host, then the machine.
    h.reconcile_host(&host_name).await;
    let host = h.host(&host_name).await.unwrap();
    assert_eq!(host.status.state, HostState::Provisioned);
    assert_eq!(host.status.observed_power_state, PowerState::On);

    h.reconcile_machine("m1").await;
    let machine = h.machine("m1").await.unwrap();
    assert_eq!(machine.status.phase, MachinePhase::Running);
    assert!(machine.status.ready);
    assert_eq!(machine.spec.provider_id.as_deref(), Some(provider_id.as_str()));
}

#[tokio::test(start_paused = true)]
async fn second_machine_waits_when_pool_is_exhausted() {
    let h = harness().await;
    h.seed_host("h1").await;
    h.seed_machine("m1").await;
    h.seed_machine("m2").await;

    h.reconcile_host("h1").await;
    h.reconcile_machine("m1").await;
    assert!(h.machine("m1").await.unwrap().spec.provider_id.is_some());

    let outcome = h.reconcile_machine("m2").await;
    let m2 = h.machine("m2").await.unwrap();
    assert!(m2.spec.provider_id.is_none());
    let cond = conditions::get_condition(&m2.status.conditions, conditions::MACHINE_READY)
        .expect("condition set");
    assert_eq!(cond.status, ConditionStatus::False);
    assert_eq!(
        cond.reason.as_deref(),
        Some(conditions::REASON_WAITING_FOR_PHYSICAL_HOST)
    );
    assert_eq!(
        outcome,
        Requeue::After(h.ctx.settings.controller.requeue_after_no_host)
    );
}

#[tokio::test(start_paused = true)]
async fn deletion_releases_the_host_in_order() {
    let h = harness().await;
    h.seed_host("h1").await;
    h.seed_machine("m1").await;

    h.reconcile_host("h1").await;
    h.reconcile_machine("m1").await;
    h.reconcile_host("h1").await;
    settle().await;
    h.reconcile_host("h1").await;
    h.reconcile_machine("m1").await;
    assert_eq!(h.machine("m1").await.unwrap().status.phase, MachinePhase::Running);

    // Delete the machine: phase flips, then the host deprovisions.
    h.store.delete_machine(&ObjectKey::new("ns1", "m1")).await.unwrap();
    h.reconcile_machine("m1").await;
    let machine = h.machine("m1").await.unwrap();
    assert_eq!(machine.status.phase, MachinePhase::Deleting);
    assert_eq!(h.host("h1").await.unwrap().status.state, HostState::Deprovisioning);

    // Queue ejects the media and powers the host off.
    h.reconcile_host("h1").await;
    settle().await;
    let bmc = h.factory.bmc("https://bmc-h1");
    assert_eq!(bmc.power(), PowerState::Off);
    assert!(!bmc.media().inserted);

    // Host returns to Available with the claim cleared.
    h.reconcile_host("h1").await;
    let host = h.host("h1").await.unwrap();
    assert_eq!(host.status.state, HostState::Available);
    assert!(host.spec.consumer_ref.is_none());
    assert!(host.spec.boot_iso_source.is_none());

    // Machine finalizer drops and the object disappears.
    h.reconcile_machine("m1").await;
    assert!(h.machine("m1").await.is_none());
}

#[tokio::test(start_paused = true)]
async fn failure_domains_are_discovered_from_host_labels() {
    let h = harness().await;
    for (name, zone) in [("h1", "a"), ("h2", "b"), ("h3", "a")] {
        let mut host = h.seed_host(name).await;
        host.metadata
            .labels
            .insert("topology.kubernetes.io/zone".to_string(), zone.to_string());
        h.store.update_host(&host).await.unwrap();
    }

    h.store
        .update_cluster(&Beskar7Cluster {
            metadata: ObjectMeta::new("ns1", "c1"),
            spec: ClusterSpec {
                control_plane_endpoint: ControlPlaneEndpoint {
                    host: "cp.example.com".to_string(),
                    port: 6443,
                },
                ..Default::default()
            },
            status: ClusterStatus::default(),
        })
        .await
        .unwrap();

    use beskar7_controllers::Reconciler;
    h.clusters.reconcile(ObjectKey::new("ns1", "c1")).await.unwrap();

    let cluster = h
        .store
        .get_cluster(&ObjectKey::new("ns1", "c1"))
        .await
        .unwrap()
        .unwrap();
    let domains: Vec<&str> =
        cluster.status.failure_domains.iter().map(String::as_str).collect();
    assert_eq!(domains, vec!["a", "b"]);
    assert!(conditions::is_condition_true(
        &cluster.status.conditions,
        conditions::FAILURE_DOMAINS_READY
    ));
    assert!(conditions::is_condition_true(
        &cluster.status.conditions,
        conditions::CONTROL_PLANE_ENDPOINT_READY
    ));
    assert!(cluster.status.ready);
}

#[tokio::test(start_paused = true)]
async fn unreachable_bmc_keeps_host_enrolling_with_bounded_retries() {
    let h = harness().await;
    h.seed_host("h1").await;
    h.factory.fail_connects(true);

    h.reconcile_host("h1").await;

    // Five attempts inside the retry envelope, then the round surfaces the
    // failure without leaving Enrolling.
    assert_eq!(h.factory.connect_count(), 5);
    let host = h.host("h1").await.unwrap();
    assert_eq!(host.status.state, HostState::Enrolling);
    let cond = conditions::get_condition(
        &host.status.conditions,
        conditions::REDFISH_CONNECTION_READY,
    )
    .unwrap();
    assert_eq!(cond.status, ConditionStatus::False);
    assert_eq!(
        cond.reason.as_deref(),
        Some(conditions::REASON_REDFISH_CONNECTION_FAILED)
    );

    // Recovery on a later round.
    h.factory.fail_connects(false);
    h.reconcile_host("h1").await;
    assert_eq!(h.host("h1").await.unwrap().status.state, HostState::Available);
}

#[tokio::test(start_paused = true)]
async fn missing_secret_is_surfaced() {
    let h = harness().await;
    // Host without its credentials secret.
    h.store
        .create_host(&PhysicalHost {
            metadata: ObjectMeta::new("ns1", "h1"),
            spec: PhysicalHostSpec {
                redfish_address: "https://bmc-h1".to_string(),
                credentials_ref: "absent".to_string(),
                insecure_skip_verify: false,
                consumer_ref: None,
                boot_iso_source: None,
                user_data_ref: None,
            },
            status: PhysicalHostStatus::default(),
        })
        .await
        .unwrap();

    h.reconcile_host("h1").await;
    let host = h.host("h1").await.unwrap();
    assert_eq!(host.status.state, HostState::Enrolling);
    let cond = conditions::get_condition(
        &host.status.conditions,
        conditions::REDFISH_CONNECTION_READY,
    )
    .unwrap();
    assert_eq!(cond.reason.as_deref(), Some(conditions::REASON_SECRET_NOT_FOUND));
}

#[tokio::test(start_paused = true)]
async fn full_queue_defers_provisioning() {
    let mut settings = Settings::default();
    settings.queue.max_queue_depth = 0;
    let h = harness_with(settings).await;
    h.seed_host("h1").await;
    h.seed_machine("m1").await;

    h.reconcile_host("h1").await;
    h.reconcile_machine("m1").await;
    assert_eq!(h.host("h1").await.unwrap().status.state, HostState::Claimed);

    // Enqueue is rejected; the host stays Claimed for a later round.
    let outcome = h.reconcile_host("h1").await;
    assert_eq!(h.host("h1").await.unwrap().status.state, HostState::Claimed);
    assert_eq!(
        outcome,
        Requeue::After(h.ctx.settings.controller.requeue_after_error)
    );
}

#[tokio::test(start_paused = true)]
async fn lost_claim_is_terminal_for_the_machine() {
    let h = harness().await;
    let host = h.seed_host("h1").await;
    let machine = h.seed_machine("m1").await;

    // Machine believes it owns h1, but h1 is bound to someone else.
    let mut machine = machine;
    machine.spec.provider_id = Some("b7:////ns1/h1".to_string());
    h.store.update_machine(&machine).await.unwrap();

    let mut host = host;
    host.status.state = HostState::Claimed;
    host.spec.consumer_ref = Some(ConsumerRef {
        namespace: "ns1".to_string(),
        name: "intruder".to_string(),
        uid: Uuid::new_v4(),
    });
    h.store.update_host(&host).await.unwrap();

    let outcome = h.reconcile_machine("m1").await;
    assert_eq!(outcome, Requeue::No);
    let machine = h.machine("m1").await.unwrap();
    assert_eq!(machine.status.phase, MachinePhase::Failed);
    assert_eq!(
        machine.status.failure_reason.as_deref(),
        Some(conditions::REASON_CLAIM_LOST)
    );
}

#[tokio::test(start_paused = true)]
async fn validation_failure_is_terminal_and_not_retried() {
    let h = harness().await;
    h.seed_host("h1").await;
    // RemoteConfig without a config URL is rejected at admission.
    h.store
        .create_machine(&Beskar7Machine {
            metadata: ObjectMeta::new("ns1", "m-bad"),
            spec: MachineSpec {
                os_family: OsFamily::Talos,
                image_url: "http://img/talos.iso".to_string(),
                provisioning_mode: ProvisioningMode::RemoteConfig,
                config_url: None,
                provider_id: None,
                host_selector: BTreeMap::new(),
            },
            status: MachineStatus::default(),
        })
        .await
        .unwrap();

    let outcome = h.reconcile_machine("m-bad").await;
    assert_eq!(outcome, Requeue::No);
    let machine = h.machine("m-bad").await.unwrap();
    assert_eq!(machine.status.phase, MachinePhase::Failed);
    assert_eq!(machine.status.failure_reason.as_deref(), Some("ValidationFailed"));
    // No host was consumed.
    assert!(h.host("h1").await.unwrap().spec.consumer_ref.is_none());
}
