//! Stories about rolling maintenance

use std::sync::Arc;
use std::time::Duration;

use fleet::config::FleetConfig;
use fleet::discovery::StaticDiscovery;
use fleet::machine::NodeMachine;
use fleet::reconcile::Cluster;
use fleet::rolling::{NodeState, RollingEngine, RollingOptions, UpgradeTarget};
use fleet::Error;

use super::fakes::{FakeBootstrap, FakePlatform, FakeProvider};

const CONFIG: &str = r#"
name: prod
kubernetesVersion: v1.31.2
masters: {count: 1, template: ubuntu}
pools:
  workers: {count: 3, template: ubuntu}
discovery: {kind: static}
rolling:
  upgradeCommand: "apt-get install -y kubelet={version}-*"
"#;

/// Four machines, oldest first: a worker, the master, two more workers
async fn fleet() -> (Arc<FakePlatform>, Vec<NodeMachine>) {
    let platform = FakePlatform::new();
    let provider = FakeProvider::new(platform.clone());
    provider.seed("prod-workers-aaaaa", 1);
    provider.seed("prod-master-mmmmm", 2);
    provider.seed("prod-workers-bbbbb", 3);
    provider.seed("prod-workers-ccccc", 4);

    let cluster = Cluster::builder(
        FleetConfig::from_yaml(CONFIG).unwrap(),
        provider,
        platform.clone(),
        Arc::new(StaticDiscovery),
        Arc::new(FakeBootstrap),
    )
    .build();
    let nodes = cluster.node_machines().await.unwrap();
    (platform, nodes)
}

fn engine(platform: &Arc<FakePlatform>, force: bool) -> RollingEngine {
    let mut options = RollingOptions::from_config(&FleetConfig::from_yaml(CONFIG).unwrap());
    options.force = force;
    options.poll_interval = Duration::from_secs(1);
    options.health_interval = Duration::from_secs(1);
    options.drain_timeout = Duration::from_secs(30);
    options.ready_timeout = Duration::from_secs(60);
    RollingEngine::new(platform.clone(), platform.clone(), options)
}

/// Index of the first event matching `event`
fn at(events: &[String], event: &str) -> usize {
    events
        .iter()
        .position(|e| e == event)
        .unwrap_or_else(|| panic!("no {event:?} in {events:?}"))
}

/// Story: an operator restarts a four-node cluster whose second-oldest node
/// is the master. The three workers reboot one after another in age order;
/// each is back and uncordoned before the next is drained. The master is
/// left alone.
#[tokio::test(start_paused = true)]
async fn restart_walks_workers_one_at_a_time() {
    let (platform, nodes) = fleet().await;

    let report = engine(&platform, false)
        .rolling_restart(&nodes)
        .await
        .unwrap();

    assert_eq!(
        report.processed(),
        vec!["prod-workers-aaaaa", "prod-workers-bbbbb", "prod-workers-ccccc"]
    );
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].node, "prod-master-mmmmm");
    assert!(report.runs.iter().all(|r| r.state() == NodeState::Done));

    let events = platform.events();
    assert!(!events.iter().any(|e| e.ends_with("prod-master-mmmmm")));
    let names = report.processed();
    for pair in names.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        assert!(at(&events, &format!("drain {a}")) < at(&events, &format!("reboot {a}")));
        assert!(at(&events, &format!("reboot {a}")) < at(&events, &format!("uncordon {a}")));
        assert!(at(&events, &format!("uncordon {a}")) < at(&events, &format!("drain {b}")));
    }
}

/// Story: a PodDisruptionBudget blocks draining the second worker. Without
/// force the run stops there and the third worker is never touched.
#[tokio::test(start_paused = true)]
async fn strict_run_stops_at_blocked_drain() {
    let (platform, nodes) = fleet().await;
    platform.fail_drain("prod-workers-bbbbb");

    let err = engine(&platform, false)
        .rolling_restart(&nodes)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Drain { .. }), "got {err:?}");
    let events = platform.events();
    assert!(!events.iter().any(|e| e == "reboot prod-workers-bbbbb"));
    assert!(!events.iter().any(|e| e.ends_with("prod-workers-ccccc")));
}

/// Story: the same blocked drain with force: the worker reboots anyway and
/// the run finishes, reporting what it pushed past.
#[tokio::test(start_paused = true)]
async fn forced_run_continues_past_blocked_drain() {
    let (platform, nodes) = fleet().await;
    platform.fail_drain("prod-workers-bbbbb");

    let report = engine(&platform, true)
        .rolling_restart(&nodes)
        .await
        .unwrap();

    assert_eq!(report.processed().len(), 3);
    assert_eq!(report.forced.len(), 1);
    assert!(report.forced[0].contains("prod-workers-bbbbb"));
}

/// Story: a worker goes down but never comes back. Even with force this
/// fails the run, and nothing after it is touched.
#[tokio::test(start_paused = true)]
async fn node_that_never_returns_fails_forced_run() {
    let (platform, nodes) = fleet().await;
    platform.never_ready("prod-workers-aaaaa");

    let err = engine(&platform, true)
        .rolling_restart(&nodes)
        .await
        .unwrap_err();

    match err {
        Error::NodeNotReady { node, .. } => assert_eq!(node, "prod-workers-aaaaa"),
        other => panic!("expected NodeNotReady, got {other:?}"),
    }
    assert!(!platform
        .events()
        .iter()
        .any(|e| e.ends_with("prod-workers-bbbbb")));
}

/// Story: upgrading to the configured version takes the master first, then
/// the workers in age order.
#[tokio::test(start_paused = true)]
async fn upgrade_takes_master_first() {
    let (platform, nodes) = fleet().await;
    let target = UpgradeTarget::from_config(
        &FleetConfig::from_yaml(CONFIG).unwrap(),
        Duration::ZERO,
    );

    let report = engine(&platform, false)
        .rolling_upgrade(&nodes, &target)
        .await
        .unwrap();

    assert_eq!(
        report.processed(),
        vec![
            "prod-master-mmmmm",
            "prod-workers-aaaaa",
            "prod-workers-bbbbb",
            "prod-workers-ccccc"
        ]
    );
}

/// Story: with a minimum age longer than any node has existed, nothing is
/// upgraded.
#[tokio::test(start_paused = true)]
async fn upgrade_leaves_young_nodes_alone() {
    let platform = FakePlatform::new();
    platform.join("prod-workers-fresh");
    let nodes = vec![NodeMachine::new(
        fleet::platform::PlatformApi::get_node(platform.as_ref(), "prod-workers-fresh")
            .await
            .unwrap(),
        None,
    )
    .await];
    let target = UpgradeTarget {
        version: "v1.31.2".into(),
        command: "true".into(),
        min_age: Duration::from_secs(24 * 3600),
    };

    let report = engine(&platform, false)
        .rolling_upgrade(&nodes, &target)
        .await
        .unwrap();

    assert!(report.runs.is_empty());
    assert_eq!(report.skipped.len(), 1);
}
