//! Stories about converging machines to the declared topology

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use fleet::config::FleetConfig;
use fleet::discovery::{StaticDiscovery, LOCAL_PROXY_ENDPOINT};
use fleet::hooks::{HookContext, ProvisionHook};
use fleet::machine::Machine;
use fleet::platform::PlatformApi;
use fleet::reconcile::Cluster;
use fleet::{Error, Result};

use super::fakes::{FakeBootstrap, FakePlatform, FakeProvider};

const SMALL: &str = r#"
name: prod
kubernetesVersion: v1.31.2
masters: {count: 1, template: ubuntu}
pools:
  workers: {count: 2, template: ubuntu}
discovery: {kind: static}
provisioning: {staggerMs: 0}
"#;

fn config(yaml: &str) -> FleetConfig {
    FleetConfig::from_yaml(yaml).unwrap()
}

fn cluster(
    config: FleetConfig,
    provider: &Arc<FakeProvider>,
    platform: &Arc<FakePlatform>,
) -> Cluster {
    Cluster::builder(
        config,
        provider.clone(),
        platform.clone(),
        Arc::new(StaticDiscovery),
        Arc::new(FakeBootstrap),
    )
    .poll_interval(Duration::from_millis(10))
    .build()
}

/// Records lifecycle callbacks as `<event> <machine>`
#[derive(Default)]
struct RecordingHook {
    calls: Mutex<Vec<String>>,
}

impl RecordingHook {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, event: &str, machine: &dyn Machine) {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{event} {}", machine.name()));
    }
}

#[async_trait]
impl ProvisionHook for RecordingHook {
    fn name(&self) -> &str {
        "recording"
    }

    async fn after_provision(&self, _ctx: &HookContext<'_>, machine: &dyn Machine) -> Result<()> {
        self.record("provisioned", machine);
        Ok(())
    }

    async fn before_terminate(&self, _ctx: &HookContext<'_>, machine: &dyn Machine) -> Result<()> {
        self.record("terminating", machine);
        Ok(())
    }
}

/// Refuses every termination
struct BlockingHook;

#[async_trait]
impl ProvisionHook for BlockingHook {
    fn name(&self) -> &str {
        "blocking"
    }

    async fn before_terminate(&self, _ctx: &HookContext<'_>, _machine: &dyn Machine) -> Result<()> {
        Err(Error::provider("registry unavailable"))
    }
}

// =============================================================================
// Bring-up
// =============================================================================

/// Story: an operator declares one master and two workers against an empty
/// backend. The first run creates the primary master, waits for the API
/// server, then fills the worker pool. Three machines and three nodes exist
/// afterwards.
#[tokio::test]
async fn empty_backend_converges_to_declared_topology() {
    let platform = FakePlatform::new();
    let provider = FakeProvider::new(platform.clone());
    let cluster = cluster(config(SMALL), &provider, &platform);

    let summary = cluster.reconcile().await.unwrap();

    assert_eq!(summary.created.len(), 3);
    assert!(summary.skipped.is_empty());
    assert_eq!(provider.live().len(), 3);
    assert_eq!(platform.node_names().len(), 3);
    assert!(provider.clones()[0].starts_with("prod-master-"));
    assert_eq!(
        provider
            .live()
            .iter()
            .filter(|n| n.starts_with("prod-workers-"))
            .count(),
        2
    );
}

/// Story: running reconcile again with nothing changed is a no-op.
#[tokio::test]
async fn second_run_changes_nothing() {
    let platform = FakePlatform::new();
    let provider = FakeProvider::new(platform.clone());
    let cluster = cluster(config(SMALL), &provider, &platform);

    cluster.reconcile().await.unwrap();
    let clones = provider.clones().len();

    let summary = cluster.reconcile().await.unwrap();
    assert!(summary.is_noop(), "second run did {summary}");
    assert_eq!(provider.clones().len(), clones);
}

/// Story: three masters are declared. The primary comes first and the two
/// secondaries join after it, never before the control plane answers.
#[tokio::test]
async fn masters_join_after_primary() {
    let platform = FakePlatform::new();
    let provider = FakeProvider::new(platform.clone());
    let yaml = SMALL.replace("masters: {count: 1", "masters: {count: 3");
    let cluster = cluster(config(&yaml), &provider, &platform);

    cluster.reconcile().await.unwrap();

    let clones = provider.clones();
    assert_eq!(clones.len(), 5);
    assert!(clones[..3].iter().all(|n| n.starts_with("prod-master-")));
}

/// Story: a registered hook sees every machine the run created.
#[tokio::test]
async fn hooks_observe_provisioning() {
    let platform = FakePlatform::new();
    let provider = FakeProvider::new(platform.clone());
    let hook = Arc::new(RecordingHook::default());
    let cluster = Cluster::builder(
        config(SMALL),
        provider.clone(),
        platform.clone(),
        Arc::new(StaticDiscovery),
        Arc::new(FakeBootstrap),
    )
    .hook(hook.clone())
    .poll_interval(Duration::from_millis(10))
    .build();

    let summary = cluster.reconcile().await.unwrap();

    let mut seen: Vec<_> = hook
        .calls()
        .into_iter()
        .filter_map(|c| c.strip_prefix("provisioned ").map(str::to_string))
        .collect();
    seen.sort();
    let mut created = summary.created.clone();
    created.sort();
    assert_eq!(seen, created);
}

/// Story: every machine, primary included, boots with the control-plane
/// endpoint discovery resolved, so join commands know where to go.
#[tokio::test]
async fn joins_carry_the_control_plane_endpoint() {
    let platform = FakePlatform::new();
    let provider = FakeProvider::new(platform.clone());
    let yaml = SMALL.replace("masters: {count: 1", "masters: {count: 2");
    let cluster = cluster(config(&yaml), &provider, &platform);

    cluster.reconcile().await.unwrap();

    let clones = provider.clones();
    assert_eq!(clones.len(), 4);
    for name in &clones {
        let payload = provider.payload(name).unwrap();
        assert!(
            payload.ends_with(&format!("{name} {LOCAL_PROXY_ENDPOINT}")),
            "{name} booted with {payload:?}"
        );
    }
    assert!(provider
        .payload(&clones[1])
        .unwrap()
        .starts_with("secondary-master "));
}

// =============================================================================
// Scaling
// =============================================================================

/// Story: five workers exist, created at t=1..5 and listed in no particular
/// order. The pool shrinks to three: the two oldest are drained, their nodes
/// deleted, and their machines destroyed.
#[tokio::test]
async fn scale_down_removes_oldest_workers() {
    let platform = FakePlatform::new();
    let provider = FakeProvider::new(platform.clone());
    provider.seed("prod-master-mmmmm", 0);
    for (name, secs) in [
        ("prod-workers-ccccc", 3),
        ("prod-workers-eeeee", 5),
        ("prod-workers-aaaaa", 1),
        ("prod-workers-ddddd", 4),
        ("prod-workers-bbbbb", 2),
    ] {
        provider.seed(name, secs);
    }
    let yaml = SMALL.replace("workers: {count: 2", "workers: {count: 3");
    let cluster = cluster(config(&yaml), &provider, &platform);

    let summary = cluster.reconcile().await.unwrap();

    let mut terminated = summary.terminated.clone();
    terminated.sort();
    assert_eq!(terminated, vec!["prod-workers-aaaaa", "prod-workers-bbbbb"]);
    assert_eq!(
        provider.terminated().into_iter().collect::<Vec<_>>(),
        terminated
    );

    let events = platform.events();
    for victim in &terminated {
        let drain = events.iter().position(|e| e == &format!("drain {victim}"));
        let delete = events.iter().position(|e| e == &format!("delete {victim}"));
        assert!(drain.is_some() && drain < delete, "events: {events:?}");
        assert_eq!(provider.lifecycle(victim), vec!["shutdown", "terminate"]);
    }
    assert!(summary.created.is_empty());
}

/// Story: a pre-terminate hook fails while a pool shrinks. The failure is
/// logged and the oldest worker is still retired.
#[tokio::test]
async fn failing_terminate_hook_does_not_block_scale_down() {
    let platform = FakePlatform::new();
    let provider = FakeProvider::new(platform.clone());
    provider.seed("prod-master-mmmmm", 0);
    for (name, secs) in [
        ("prod-workers-aaaaa", 1),
        ("prod-workers-bbbbb", 2),
        ("prod-workers-ccccc", 3),
    ] {
        provider.seed(name, secs);
    }
    let cluster = Cluster::builder(
        config(SMALL),
        provider.clone(),
        platform.clone(),
        Arc::new(StaticDiscovery),
        Arc::new(FakeBootstrap),
    )
    .hook(Arc::new(BlockingHook))
    .poll_interval(Duration::from_millis(10))
    .build();

    let summary = cluster.reconcile().await.unwrap();

    assert_eq!(summary.terminated, vec!["prod-workers-aaaaa"]);
    assert!(summary.skipped.is_empty());
}

/// Story: a node whose machine the provider no longer knows still counts
/// toward the pool, so nothing is launched to replace it.
#[tokio::test]
async fn null_machines_count_toward_size() {
    let platform = FakePlatform::new();
    let provider = FakeProvider::new(platform.clone());
    provider.seed("prod-master-mmmmm", 0);
    provider.seed("prod-workers-aaaaa", 1);
    platform.join("prod-workers-zzzzz");

    let cluster = cluster(config(SMALL), &provider, &platform);
    let summary = cluster.reconcile().await.unwrap();

    assert!(summary.is_noop(), "run did {summary}");
}

/// Story: machines keep failing to join. Once a pool has more of them than
/// the configured limit, reconcile refuses to launch anything.
#[tokio::test]
async fn orphan_guard_stops_provisioning() {
    let platform = FakePlatform::new();
    let provider = FakeProvider::new(platform.clone());
    provider.seed("prod-master-mmmmm", 0);
    for name in ["prod-workers-aaaaa", "prod-workers-bbbbb"] {
        provider.seed(name, 1);
        platform.delete_node(name).await.unwrap();
    }
    let yaml = SMALL.replace(
        "provisioning: {staggerMs: 0}",
        "provisioning: {staggerMs: 0, maxOrphans: 1}",
    );
    let clones_before = provider.clones().len();
    let cluster = cluster(config(&yaml), &provider, &platform);

    let err = cluster.reconcile().await.unwrap_err();

    assert!(matches!(err, Error::Precondition(_)), "got {err:?}");
    assert_eq!(provider.clones().len(), clones_before);
}

/// Story: the same stuck pool while two secondary masters are still
/// missing. The guard refuses the run before any master joins.
#[tokio::test]
async fn orphan_guard_runs_before_masters_join() {
    let platform = FakePlatform::new();
    let provider = FakeProvider::new(platform.clone());
    provider.seed("prod-master-mmmmm", 0);
    for name in ["prod-workers-aaaaa", "prod-workers-bbbbb"] {
        provider.seed(name, 1);
        platform.delete_node(name).await.unwrap();
    }
    let yaml = SMALL
        .replace("masters: {count: 1", "masters: {count: 3")
        .replace(
            "provisioning: {staggerMs: 0}",
            "provisioning: {staggerMs: 0, maxOrphans: 1}",
        );
    let cluster = cluster(config(&yaml), &provider, &platform);

    let err = cluster.reconcile().await.unwrap_err();

    assert!(matches!(err, Error::Precondition(_)), "got {err:?}");
    assert!(provider.clones().is_empty(), "cloned {:?}", provider.clones());
}

/// Story: worker machines are left over from a cluster that no longer has
/// a control plane. Nothing of theirs joined, so the guard refuses to
/// create a primary master next to them.
#[tokio::test]
async fn orphan_guard_runs_before_primary_master() {
    let platform = FakePlatform::new();
    let provider = FakeProvider::new(platform.clone());
    for name in ["prod-workers-aaaaa", "prod-workers-bbbbb"] {
        provider.seed(name, 1);
        platform.delete_node(name).await.unwrap();
    }
    let yaml = SMALL.replace(
        "provisioning: {staggerMs: 0}",
        "provisioning: {staggerMs: 0, maxOrphans: 1}",
    );
    let cluster = cluster(config(&yaml), &provider, &platform);

    let err = cluster.reconcile().await.unwrap_err();

    assert!(matches!(err, Error::Precondition(_)), "got {err:?}");
    assert!(provider.clones().is_empty(), "cloned {:?}", provider.clones());
}

// =============================================================================
// Teardown
// =============================================================================

/// Story: tearing down a running cluster destroys every machine and removes
/// every node without draining anything.
#[tokio::test]
async fn teardown_destroys_everything_without_draining() {
    let platform = FakePlatform::new();
    let provider = FakeProvider::new(platform.clone());
    let hook = Arc::new(RecordingHook::default());
    let cluster = Cluster::builder(
        config(SMALL),
        provider.clone(),
        platform.clone(),
        Arc::new(StaticDiscovery),
        Arc::new(FakeBootstrap),
    )
    .hook(hook.clone())
    .poll_interval(Duration::from_millis(10))
    .build();
    cluster.reconcile().await.unwrap();

    let summary = cluster.teardown().await.unwrap();

    assert_eq!(summary.terminated.len(), 3);
    assert!(provider.live().is_empty());
    assert!(platform.node_names().is_empty());
    assert!(!platform.events().iter().any(|e| e.starts_with("drain ")));
    for name in provider.terminated() {
        assert_eq!(provider.lifecycle(&name), vec!["power-off", "terminate"]);
    }
    assert_eq!(
        hook.calls()
            .iter()
            .filter(|c| c.starts_with("terminating "))
            .count(),
        3
    );
}
