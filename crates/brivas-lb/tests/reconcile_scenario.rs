//! End-to-end reconciliation against the in-memory data plane

use brivas_core::{BalancerState, DataPlaneState, DynamicRoute, LinkAddress, ServiceKey};
use brivas_lb::modules::memory::{MemoryDataPlane, Op};
use brivas_lb::{
    Balancer, BalancerConfig, BalancerContext, BalancerSnapshot, ControlPlaneConfig, ControlPlaneReconciler,
    DataPlaneManager, FwmarkAllocator, ReconcilerContext, WithdrawAndFlush,
};
use brivas_telemetry::MetricsRegistry;
use serde_json::json;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

async fn eventually<F, Fut>(what: &str, check: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + WAIT;
    while !check().await {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn balancer(name: &str, port: u16, hosts: &[String], extra: serde_json::Value) -> BalancerConfig {
    let mut value = json!({
        "name": name,
        "vip": "10.0.0.1",
        "port": port,
        "discovery": { "type": "static", "hosts": hosts },
        "health_check": { "interval_ms": 50, "check": { "type": "dummy" } },
        "retry_delay_ms": 50
    });
    if let (Some(base), Some(extra)) = (value.as_object_mut(), extra.as_object()) {
        for (k, v) in extra {
            base.insert(k.clone(), v.clone());
        }
    }
    serde_json::from_value(value).unwrap()
}

fn named_hosts() -> Vec<String> {
    vec!["h1".to_string(), "h2".to_string()]
}

struct Harness {
    plane: MemoryDataPlane,
    manager: Arc<DataPlaneManager>,
    reconciler: ControlPlaneReconciler,
    after_init: Arc<AtomicUsize>,
}

fn start(config: ControlPlaneConfig) -> Harness {
    let plane = MemoryDataPlane::new("test");
    plane.resolver.insert("h1", "10.1.0.1".parse().unwrap());
    plane.resolver.insert("h2", "10.1.0.2".parse().unwrap());

    let manager = Arc::new(DataPlaneManager::new(
        plane.modules(),
        Arc::new(WithdrawAndFlush),
        MetricsRegistry::new(),
    ));
    let after_init = Arc::new(AtomicUsize::new(0));
    let fired = after_init.clone();

    let reconciler = ControlPlaneReconciler::start(
        config,
        ReconcilerContext {
            client: manager.clone(),
            resolver: plane.resolver.clone(),
            metrics: MetricsRegistry::new(),
        },
        Some(Box::new(move || {
            fired.fetch_add(1, Ordering::SeqCst);
        })),
        CancellationToken::new(),
    )
    .unwrap();

    Harness {
        plane,
        manager,
        reconciler,
        after_init,
    }
}

async fn initialized(reconciler: &ControlPlaneReconciler) {
    eventually("initial push", move || async move { reconciler.is_initialized() }).await;
}

async fn next_snapshot(balancer: &Balancer, wake: &mut mpsc::Receiver<()>) -> Arc<BalancerSnapshot> {
    tokio::time::timeout(WAIT, wake.recv()).await.unwrap().unwrap();
    balancer.snapshot().unwrap()
}

fn sorted(mut state: DataPlaneState) -> DataPlaneState {
    state.balancers.sort_by_key(|b| b.key);
    for balancer in &mut state.balancers {
        balancer.upstreams.sort_by_key(|u| u.key());
    }
    state.dynamic_routes.sort_by_key(|r| r.prefix);
    state.link_addresses.sort_by_key(|l| l.address);
    state
}

#[tokio::test]
async fn svc_a_partial_health_blocks_route() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let up = listener.local_addr().unwrap().port();
    let down = {
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        closed.local_addr().unwrap().port()
    };

    let hosts = vec![format!("127.0.0.1:{}", up), format!("127.0.0.1:{}", down)];
    let svc_a = balancer(
        "svc-a",
        443,
        &hosts,
        json!({
            "health_check": { "interval_ms": 50, "check": { "type": "tcp", "timeout_ms": 500 } },
            "bgp": { "local_asn": 65000, "peer_asn": 65001, "community": "65000:100" },
            "announce_limit_ratio": 0.9
        }),
    );
    let harness = start(ControlPlaneConfig {
        balancers: vec![svc_a],
        ..Default::default()
    });

    initialized(&harness.reconciler).await;

    let state = harness.reconciler.last_state().unwrap();
    assert_eq!(state.balancers.len(), 1);
    let upstreams = &state.balancers[0].upstreams;
    let weight_of = |port: u16| upstreams.iter().find(|u| u.port == port).unwrap().weight;
    assert_eq!(weight_of(up), 1000);
    assert_eq!(weight_of(down), 0);
    assert!(state.dynamic_routes.is_empty());
    assert_eq!(
        state.link_addresses,
        vec![LinkAddress {
            interface: "lo".into(),
            address: "10.0.0.1".parse().unwrap(),
        }]
    );

    let live = assert_ok!(harness.manager.get_state().await);
    assert!(live.dynamic_routes.is_empty());
    assert_eq!(live.balancers[0].name, "svc-a");
    assert_eq!(harness.after_init.load(Ordering::SeqCst), 1);

    drop(listener);
    harness.reconciler.stop().await;
}

#[tokio::test]
async fn healthy_balancer_announces_and_round_trips() {
    let svc = balancer(
        "svc-b",
        443,
        &named_hosts(),
        json!({
            "bgp": { "local_asn": 65000, "peer_asn": 65001, "community": "65000:100" },
            "fwmark": true
        }),
    );
    let harness = start(ControlPlaneConfig {
        balancers: vec![svc],
        ..Default::default()
    });

    initialized(&harness.reconciler).await;

    let desired = harness.reconciler.last_state().unwrap();
    // One tuple service plus a mirror per real server
    assert_eq!(desired.balancers.len(), 3);
    assert_eq!(desired.dynamic_routes.len(), 1);
    assert!(harness.plane.journal.entries().contains(&Op::BgpInit(65000)));

    let live = assert_ok!(harness.manager.get_state().await);
    assert_eq!(sorted(live), sorted((*desired).clone()));

    // Same state again touches nothing
    let applied = harness.plane.journal.len();
    assert_ok!(harness.manager.set_state(&desired).await);
    assert_eq!(harness.plane.journal.len(), applied);

    harness.reconciler.stop().await;
}

#[tokio::test]
async fn reload_adds_and_removes_balancers() {
    let first = balancer("svc-a", 443, &named_hosts(), json!({}));
    let harness = start(ControlPlaneConfig {
        balancers: vec![first.clone()],
        ..Default::default()
    });
    initialized(&harness.reconciler).await;

    let second = balancer("svc-c", 80, &named_hosts(), json!({}));
    assert_ok!(
        harness
            .reconciler
            .reload(ControlPlaneConfig {
                balancers: vec![first.clone(), second.clone()],
                ..Default::default()
            })
            .await
    );
    let reconciler = &harness.reconciler;
    eventually("second service", move || async move {
        reconciler.last_state().is_some_and(|s| s.balancers.len() == 2)
    })
    .await;

    // Duplicate service key: rejected, nothing changes
    let clash = balancer("svc-d", 80, &named_hosts(), json!({}));
    assert_err!(
        harness
            .reconciler
            .reload(ControlPlaneConfig {
                balancers: vec![first.clone(), second, clash],
                ..Default::default()
            })
            .await
    );
    assert_eq!(harness.reconciler.config().balancers.len(), 2);

    assert_ok!(
        harness
            .reconciler
            .reload(ControlPlaneConfig {
                balancers: vec![first],
                ..Default::default()
            })
            .await
    );
    let manager = &harness.manager;
    eventually("service removal", move || async move {
        manager.get_state().await.is_ok_and(|s| s.balancers.len() == 1)
    })
    .await;
    assert_eq!(harness.after_init.load(Ordering::SeqCst), 1);

    harness.reconciler.stop().await;
}

#[tokio::test]
async fn unresolvable_new_balancer_does_not_freeze_others() {
    let first = balancer("svc-a", 443, &named_hosts(), json!({}));
    let harness = start(ControlPlaneConfig {
        balancers: vec![first],
        ..Default::default()
    });
    initialized(&harness.reconciler).await;

    let reweighted = balancer("svc-a", 443, &named_hosts(), json!({ "weight_up": 7 }));
    let stuck = balancer("svc-e", 8080, &["nowhere".to_string()], json!({}));
    assert_ok!(
        harness
            .reconciler
            .reload(ControlPlaneConfig {
                balancers: vec![reweighted, stuck],
                ..Default::default()
            })
            .await
    );

    let manager = &harness.manager;
    eventually("svc-a reweight on the data plane", move || async move {
        manager.get_state().await.is_ok_and(|s| {
            s.balancers.len() == 1 && s.balancers[0].upstreams.iter().all(|u| u.weight == 7)
        })
    })
    .await;

    harness.reconciler.stop().await;
}

#[tokio::test]
async fn withdrawal_waits_for_longest_hold_time() {
    let plane = MemoryDataPlane::default();
    let manager = DataPlaneManager::new(plane.modules(), Arc::new(WithdrawAndFlush), MetricsRegistry::new());
    let route = |prefix: &str, hold_time_ms| DynamicRoute {
        local_asn: 65000,
        peer_asn: 65001,
        community: String::new(),
        prefix: prefix.parse().unwrap(),
        hold_time_ms,
    };

    let announced = DataPlaneState {
        dynamic_routes: vec![route("10.0.0.1/32", 100), route("10.0.0.2/32", 250)],
        ..Default::default()
    };
    assert_ok!(manager.set_state(&announced).await);

    let start = Instant::now();
    assert_ok!(manager.set_state(&DataPlaneState::default()).await);
    assert!(start.elapsed() >= Duration::from_millis(250));
    assert!(assert_ok!(manager.get_state().await).dynamic_routes.is_empty());
}

#[tokio::test]
async fn failsafe_keeps_upstreams_after_total_outage() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let plane = MemoryDataPlane::default();

    let config = balancer(
        "svc-e",
        443,
        &[format!("127.0.0.1:{}", port)],
        json!({
            "health_check": { "interval_ms": 50, "check": { "type": "tcp", "timeout_ms": 200 } },
            "bgp": { "local_asn": 65000, "peer_asn": 65001 }
        }),
    );
    let (notify, mut wake) = mpsc::channel(1);
    let balancer = Balancer::spawn(
        config,
        BalancerContext {
            resolver: plane.resolver.clone(),
            fwmarks: Arc::new(FwmarkAllocator::default()),
            notify,
        },
        CancellationToken::new(),
    )
    .unwrap();

    let healthy = next_snapshot(&balancer, &mut wake).await;
    assert!(!healthy.initial_state);
    assert!(healthy.admits_route());

    drop(listener);
    let mut snapshot = next_snapshot(&balancer, &mut wake).await;
    while !snapshot.failsafe {
        snapshot = next_snapshot(&balancer, &mut wake).await;
    }
    assert_eq!(snapshot.alive_ratio, 0.0);
    assert_eq!(snapshot.state.upstreams[0].weight, 1000);
    assert!(!snapshot.admits_route());

    balancer.stop().await;
}

#[tokio::test]
async fn never_healthy_balancer_stays_down() {
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = closed.local_addr().unwrap().port();
    drop(closed);

    let plane = MemoryDataPlane::default();
    let config = balancer(
        "svc-f",
        443,
        &[format!("127.0.0.1:{}", port)],
        json!({ "health_check": { "interval_ms": 50, "check": { "type": "tcp", "timeout_ms": 200 } } }),
    );
    let (notify, mut wake) = mpsc::channel(1);
    let balancer = Balancer::spawn(
        config,
        BalancerContext {
            resolver: plane.resolver.clone(),
            fwmarks: Arc::new(FwmarkAllocator::default()),
            notify,
        },
        CancellationToken::new(),
    )
    .unwrap();

    let snapshot = next_snapshot(&balancer, &mut wake).await;
    assert!(snapshot.initial_state);
    assert!(!snapshot.failsafe);
    assert_eq!(snapshot.state.upstreams[0].weight, 0);

    balancer.stop().await;
}

#[tokio::test]
async fn data_plane_push_preserves_mirror_names() {
    let plane = MemoryDataPlane::new("test");
    plane.resolver.insert("h1", "10.1.0.1".parse().unwrap());
    let manager = DataPlaneManager::new(plane.modules(), Arc::new(WithdrawAndFlush), MetricsRegistry::new());

    let mark = ServiceKey::Fwmark {
        mark: 5000,
        family: brivas_core::AddressFamily::Inet,
    };
    let mirror = BalancerState::new(
        "svc:h1",
        mark,
        vec![brivas_core::UpstreamState {
            hostname: "h1".into(),
            address: "10.1.0.1".parse().unwrap(),
            port: 0,
            weight: 1000,
            forward_method: Default::default(),
        }],
    );
    let desired = DataPlaneState {
        balancers: vec![mirror.clone()],
        ..Default::default()
    };

    assert_ok!(manager.set_state(&desired).await);
    let live = assert_ok!(manager.get_state().await);
    assert_eq!(live.balancers, vec![mirror]);
}
