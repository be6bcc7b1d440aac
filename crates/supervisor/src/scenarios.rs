//! End-to-end lifecycle scenarios against scripted strategies.

use std::sync::Arc;
use std::time::Duration;

use devlink_events::{ErrorKind, EventBus, EventKind, Filter, LifecycleEvent};
use serde_json::json;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::config::SupervisorConfig;
use crate::error::LinkError;
use crate::mock::{Inbound, MockStrategy, Step};
use crate::retry::RetryPolicy;
use crate::supervisor::ConnectionSupervisor;
use crate::types::{ConnectionState, DeviceIdentity, Pattern};

struct Harness {
    sup: ConnectionSupervisor,
    mock: Arc<MockStrategy>,
    events: UnboundedReceiver<LifecycleEvent>,
}

impl Harness {
    fn new(pattern: Pattern, config: SupervisorConfig) -> Self {
        let bus = EventBus::new();
        let events = bus.subscribe_channel(Filter::All);
        let mock = MockStrategy::new(pattern);
        let sup = ConnectionSupervisor::new(
            DeviceIdentity::new("dev", "Scenario Device"),
            mock.clone(),
            bus,
            config,
        );
        Self { sup, mock, events }
    }

    fn drain(&mut self) -> Vec<EventKind> {
        let mut out = Vec::new();
        while let Ok(ev) = self.events.try_recv() {
            out.push(ev.kind);
        }
        out
    }
}

fn fixed(delay: Duration) -> SupervisorConfig {
    SupervisorConfig {
        retry: RetryPolicy::fixed(delay),
        ..SupervisorConfig::default()
    }
}

fn assert_legal(history: &[ConnectionState]) {
    for pair in history.windows(2) {
        assert!(
            pair[0].can_transition_to(pair[1]),
            "illegal transition {} -> {} in {history:?}",
            pair[0],
            pair[1]
        );
    }
}

/// Fails if an update appears between a connection-ending event and the
/// next `Connected`.
fn assert_no_late_updates(kinds: &[EventKind]) {
    let mut open = false;
    for kind in kinds {
        match kind {
            EventKind::Connected => open = true,
            EventKind::Disconnected | EventKind::Error { .. } => open = false,
            EventKind::Update { payload } => {
                assert!(open, "update {payload} published outside a connection: {kinds:?}")
            }
            _ => {}
        }
    }
}

fn exhausted_errors(kinds: &[EventKind]) -> usize {
    kinds
        .iter()
        .filter(|k| {
            matches!(
                k,
                EventKind::Error {
                    retries_exhausted: true,
                    ..
                }
            )
        })
        .count()
}

#[tokio::test]
async fn backoff_grows_then_connects() {
    tokio::time::pause();
    let mut h = Harness::new(Pattern::StatelessRequest, SupervisorConfig::default());
    h.mock.fail_times("probe_reachable", 3);

    assert_eq!(h.sup.connect().await, ConnectionState::Reconnecting);
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(h.sup.state(), ConnectionState::Connected);
    assert_eq!(h.sup.retry_state().attempt, 0);
    assert_eq!(h.mock.calls("probe_reachable"), 4);

    let retries: Vec<(u32, Duration)> = h
        .drain()
        .into_iter()
        .filter_map(|k| match k {
            EventKind::Reconnecting { attempt, delay } => Some((attempt, delay)),
            _ => None,
        })
        .collect();
    assert_eq!(retries.len(), 3);
    for ((attempt, delay), nominal) in retries.iter().zip([1.0, 2.0, 4.0]) {
        let secs = delay.as_secs_f64();
        assert!(
            secs >= nominal * 0.8 - 1e-6 && secs <= nominal * 1.2 + 1e-6,
            "attempt {attempt}: {secs}s not within 20% of {nominal}s"
        );
    }
    assert_eq!(
        retries.iter().map(|(a, _)| *a).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
}

#[tokio::test]
async fn polling_failure_on_second_call_reconnects() {
    tokio::time::pause();
    let config = SupervisorConfig {
        poll_interval: Duration::from_secs(10),
        ..fixed(Duration::from_secs(5))
    };
    let mut h = Harness::new(Pattern::Polling, config);
    h.mock.script(
        "poll_once",
        [Step::Ok, Step::Fail(LinkError::Protocol("bad reply".into()))],
    );

    assert_eq!(h.sup.connect().await, ConnectionState::Connected);
    tokio::time::sleep(Duration::from_secs(16)).await;

    assert_eq!(
        h.drain(),
        vec![
            EventKind::Connecting,
            EventKind::Connected,
            EventKind::Update {
                payload: json!({ "poll": 1 })
            },
            EventKind::Error {
                kind: ErrorKind::Protocol,
                reason: "protocol error: bad reply".into(),
                retries_exhausted: false,
            },
            EventKind::Reconnecting {
                attempt: 1,
                delay: Duration::from_secs(5),
            },
            EventKind::Connected,
            EventKind::Update {
                payload: json!({ "poll": 3 })
            },
        ]
    );
    assert_eq!(h.mock.calls("open_session"), 2);
    assert_eq!(h.mock.calls("close_session"), 1);
}

#[tokio::test]
async fn healthy_watchdog_never_reconnects() {
    tokio::time::pause();
    let mut h = Harness::new(Pattern::ExternalClient, SupervisorConfig::default());

    assert_eq!(h.sup.connect().await, ConnectionState::Connected);
    tokio::time::sleep(Duration::from_secs(3600)).await;

    assert_eq!(h.sup.state(), ConnectionState::Connected);
    assert_eq!(h.drain(), vec![EventKind::Connecting, EventKind::Connected]);
    assert_eq!(h.mock.calls("create_external_client"), 1);
}

#[tokio::test]
async fn attempt_ceiling_ends_in_failed() {
    tokio::time::pause();
    let config = SupervisorConfig {
        retry: RetryPolicy::fixed(Duration::from_secs(1)).with_max_attempts(3),
        ..SupervisorConfig::default()
    };
    let mut h = Harness::new(Pattern::StatelessRequest, config);
    h.mock.fail_times("probe_reachable", 100);

    assert_eq!(h.sup.connect().await, ConnectionState::Reconnecting);
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(h.sup.state(), ConnectionState::Failed);
    assert_eq!(h.mock.calls("probe_reachable"), 4);
    assert_eq!(h.sup.retry_state().attempt, 3);

    let kinds = h.drain();
    assert_eq!(exhausted_errors(&kinds), 1);
    assert!(matches!(
        kinds.last(),
        Some(EventKind::Error {
            kind: ErrorKind::Exhausted,
            retries_exhausted: true,
            ..
        })
    ));

    // Nothing else happens until someone calls connect() again.
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(h.mock.calls("probe_reachable"), 4);
    assert!(h.drain().is_empty());
    assert_legal(&h.sup.state_history());
}

#[tokio::test]
async fn disconnect_during_backoff_is_prompt() {
    let mut h = Harness::new(Pattern::StatelessRequest, fixed(Duration::from_secs(10)));
    h.mock.fail_times("probe_reachable", 1);

    assert_eq!(h.sup.connect().await, ConnectionState::Reconnecting);
    let start = std::time::Instant::now();
    h.sup.disconnect().await;
    let elapsed = start.elapsed();

    assert!(elapsed < Duration::from_millis(50), "disconnect took {elapsed:?}");
    assert_eq!(h.sup.state(), ConnectionState::Disconnected);
    assert_eq!(h.drain().last(), Some(&EventKind::Disconnected));
    assert_eq!(h.mock.calls("probe_reachable"), 1);
}

#[tokio::test]
async fn disconnect_during_maintenance_is_prompt() {
    let mut h = Harness::new(Pattern::PersistentSocket, SupervisorConfig::default());

    assert_eq!(h.sup.connect().await, ConnectionState::Connected);
    let start = std::time::Instant::now();
    h.sup.disconnect().await;

    assert!(start.elapsed() < Duration::from_millis(50));
    assert_eq!(h.mock.calls("close_socket"), 1);
    assert_eq!(h.sup.live_maintenance(), 0);
    assert_eq!(h.drain().last(), Some(&EventKind::Disconnected));
}

#[tokio::test]
async fn no_update_after_error_or_disconnect() {
    tokio::time::pause();
    let config = SupervisorConfig {
        watchdog_interval: Duration::from_secs(10),
        ..fixed(Duration::from_secs(5))
    };
    let mut h = Harness::new(Pattern::ExternalClient, config);

    assert_eq!(h.sup.connect().await, ConnectionState::Connected);
    let first = h.mock.bound_context().unwrap();
    assert!(first.emit_update(json!("live")));

    h.mock.set_alive(false);
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(h.sup.state(), ConnectionState::Reconnecting);
    assert!(!first.emit_update(json!("during backoff")));

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.sup.state(), ConnectionState::Connected);
    let second = h.mock.bound_context().unwrap();
    assert!(!first.emit_update(json!("stale binding")));
    assert!(second.emit_update(json!("fresh")));

    h.sup.disconnect().await;
    assert!(!second.emit_update(json!("after disconnect")));
    assert!(!second.is_current());

    let kinds = h.drain();
    assert_no_late_updates(&kinds);
    assert_eq!(
        kinds
            .iter()
            .filter(|k| matches!(k, EventKind::Update { .. }))
            .count(),
        2
    );
    assert_eq!(kinds.last(), Some(&EventKind::Disconnected));
}

#[tokio::test]
async fn at_most_one_maintenance_task_across_reconnects() {
    tokio::time::pause();
    let config = SupervisorConfig {
        poll_interval: Duration::from_secs(1),
        ..fixed(Duration::from_secs(1))
    };
    let mut h = Harness::new(Pattern::Polling, config);
    for _ in 0..20 {
        h.mock.script(
            "poll_once",
            [Step::Ok, Step::Fail(LinkError::Timeout("no reply".into()))],
        );
    }

    h.sup.connect().await;
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(h.mock.calls("open_session") >= 10);
    assert_eq!(h.sup.maintenance_peak(), 1);

    h.sup.disconnect().await;
    assert_eq!(h.sup.live_maintenance(), 0);
    assert_eq!(
        h.mock.calls("open_session"),
        h.mock.calls("close_session")
    );
    assert_legal(&h.sup.state_history());
    assert_no_late_updates(&h.drain());
}

#[tokio::test]
async fn transitions_stay_on_the_state_machine() {
    tokio::time::pause();
    let h = Harness::new(Pattern::PersistentSocket, fixed(Duration::from_secs(1)));
    h.mock.fail_times("open_socket", 2);

    assert_eq!(h.sup.connect().await, ConnectionState::Reconnecting);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.sup.state(), ConnectionState::Connected);

    h.mock.push(Inbound::Close);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.sup.state(), ConnectionState::Connected);

    h.sup.disconnect().await;
    assert_eq!(h.sup.connect().await, ConnectionState::Connected);
    h.mock.push(Inbound::Fail(LinkError::Protocol("garbled".into())));
    tokio::time::sleep(Duration::from_millis(10)).await;
    h.sup.disconnect().await;

    let history = h.sup.state_history();
    assert_legal(&history);
    for state in [
        ConnectionState::Connecting,
        ConnectionState::Connected,
        ConnectionState::Reconnecting,
        ConnectionState::Disconnected,
    ] {
        assert!(history.contains(&state), "{state} never entered");
    }
    assert_eq!(history.last(), Some(&ConnectionState::Disconnected));
}

#[tokio::test]
async fn hybrid_push_loss_degrades_without_reconnecting() {
    tokio::time::pause();
    let config = SupervisorConfig {
        poll_interval: Duration::from_secs(10),
        ..fixed(Duration::from_secs(5))
    };
    let mut h = Harness::new(Pattern::HybridPushPoll, config);

    assert_eq!(h.sup.connect().await, ConnectionState::Connected);
    h.mock.push(Inbound::Close);
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(h.sup.state(), ConnectionState::Connected);
    let kinds = h.drain();
    assert!(kinds.contains(&EventKind::Degraded {
        kind: ErrorKind::Unreachable,
        reason: "device unreachable: connection closed by peer".into(),
    }));
    assert!(!kinds.iter().any(|k| matches!(
        k,
        EventKind::Reconnecting { .. } | EventKind::Error { .. }
    )));

    tokio::time::sleep(Duration::from_secs(15)).await;
    assert_eq!(h.mock.calls("open_socket"), 2);
    assert_eq!(h.sup.state(), ConnectionState::Connected);

    // Polling keeps reporting after the push channel went away.
    let mut all = kinds;
    all.extend(h.drain());
    assert!(all.iter().any(|k| matches!(k, EventKind::Update { .. })));
    assert_no_late_updates(&all);

    // Polling is authoritative: its failure still reconnects.
    h.mock.script("poll_once", [Step::Fail(LinkError::Timeout("no reply".into()))]);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.sup.state(), ConnectionState::Reconnecting);
    assert!(h
        .drain()
        .iter()
        .any(|k| matches!(k, EventKind::Reconnecting { attempt: 1, .. })));
}

#[tokio::test]
async fn hybrid_connects_without_push_channel() {
    tokio::time::pause();
    let h = Harness::new(Pattern::HybridPushPoll, fixed(Duration::from_secs(5)));
    h.mock.fail_times("open_socket", 1);

    assert_eq!(h.sup.connect().await, ConnectionState::Connected);
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(h.mock.calls("open_socket"), 2);
    assert_eq!(h.sup.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn hybrid_push_loss_reconnects_when_configured() {
    tokio::time::pause();
    let config = SupervisorConfig {
        keep_polling_on_push_loss: false,
        ..fixed(Duration::from_secs(5))
    };
    let h = Harness::new(Pattern::HybridPushPoll, config);

    assert_eq!(h.sup.connect().await, ConnectionState::Connected);
    h.mock.push(Inbound::Close);
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(h.sup.state(), ConnectionState::Reconnecting);
    assert_eq!(h.mock.calls("close_session"), 1);
    assert_eq!(h.mock.calls("close_socket"), 1);
}

#[tokio::test]
async fn recovered_external_client_is_reused() {
    tokio::time::pause();
    let config = SupervisorConfig {
        watchdog_interval: Duration::from_secs(30),
        ..fixed(Duration::from_secs(5))
    };
    let mut h = Harness::new(Pattern::ExternalClient, config);

    assert_eq!(h.sup.connect().await, ConnectionState::Connected);
    let ctx = h.mock.bound_context().unwrap();

    h.mock.set_alive(false);
    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(h.sup.state(), ConnectionState::Reconnecting);

    // The client reconnects by itself during the backoff.
    h.mock.set_alive(true);
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(h.sup.state(), ConnectionState::Connected);
    assert_eq!(h.mock.calls("create_external_client"), 1);
    assert_eq!(h.mock.calls("bind_client_events"), 1);
    assert_eq!(h.mock.calls("unbind_client_events"), 0);
    assert!(ctx.is_current());

    let kinds = h.drain();
    assert_eq!(
        kinds.iter().filter(|k| **k == EventKind::Connected).count(),
        2
    );
    assert!(kinds.iter().any(|k| matches!(
        k,
        EventKind::Error {
            kind: ErrorKind::ExternalFailure,
            ..
        }
    )));

    h.sup.disconnect().await;
    assert_eq!(h.mock.calls("unbind_client_events"), 1);
    assert!(!ctx.is_current());
}

#[tokio::test]
async fn one_failing_device_does_not_affect_another() {
    tokio::time::pause();
    let bus = EventBus::new();
    let mut healthy_events = bus.subscribe_channel(Filter::device("good"));

    let broken = MockStrategy::new(Pattern::Polling);
    broken.fail_times("open_session", 100);
    let bad = ConnectionSupervisor::new(
        DeviceIdentity::new("bad", "Broken"),
        broken,
        bus.clone(),
        SupervisorConfig {
            retry: RetryPolicy::fixed(Duration::from_secs(1)).with_max_attempts(2),
            ..SupervisorConfig::default()
        },
    );
    let good = ConnectionSupervisor::new(
        DeviceIdentity::new("good", "Healthy"),
        MockStrategy::new(Pattern::Polling),
        bus,
        SupervisorConfig::default(),
    );

    bad.connect().await;
    good.connect().await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(bad.state(), ConnectionState::Failed);
    assert_eq!(good.state(), ConnectionState::Connected);
    while let Ok(ev) = healthy_events.try_recv() {
        assert_eq!(ev.device_id, "good");
        assert!(!matches!(ev.kind, EventKind::Error { .. }));
    }
}

#[tokio::test]
async fn concurrent_connects_start_one_lifecycle() {
    tokio::time::pause();
    let h = Harness::new(Pattern::Polling, SupervisorConfig::default());

    let (a, b) = tokio::join!(h.sup.connect(), h.sup.connect());
    for state in [a, b] {
        assert!(
            matches!(state, ConnectionState::Connecting | ConnectionState::Connected),
            "unexpected {state}"
        );
    }
    assert_eq!(h.mock.calls("open_session"), 1);
    assert_eq!(h.sup.maintenance_peak(), 1);
}

#[tokio::test]
async fn config_update_requests_reach_the_bus() {
    tokio::time::pause();
    let mut h = Harness::new(Pattern::ExternalClient, SupervisorConfig::default());
    h.sup.connect().await;

    let ctx = h.mock.bound_context().unwrap();
    ctx.request_config_update(json!({ "token": "fresh" }));

    assert!(h.drain().contains(&EventKind::ConfigUpdateRequested {
        changes: json!({ "token": "fresh" })
    }));
}

#[tokio::test]
async fn disconnect_waits_for_in_flight_request() {
    tokio::time::pause();
    let mut h = Harness::new(Pattern::StatelessRequest, SupervisorConfig::default());
    assert_eq!(h.sup.connect().await, ConnectionState::Connected);

    let started = tokio::time::Instant::now();
    let (result, ()) = tokio::join!(
        h.sup.request(|| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, LinkError>("done")
        }),
        async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            h.sup.disconnect().await;
            assert_eq!(h.mock.calls("open_session"), 1);
            assert_eq!(
                h.mock.calls("close_session"),
                1,
                "session still open after disconnect returned"
            );
        }
    );

    assert_eq!(result, Err(LinkError::NotConnected));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(h.sup.state(), ConnectionState::Disconnected);
    assert_eq!(h.drain().last(), Some(&EventKind::Disconnected));

    let after = h.sup.request(|| async { Ok(()) }).await;
    assert_eq!(after, Err(LinkError::NotConnected));
    assert_eq!(h.mock.calls("open_session"), 1);
}

#[tokio::test]
async fn disconnect_during_connect_hook_is_prompt() {
    tokio::time::pause();
    let mut h = Harness::new(Pattern::PersistentSocket, SupervisorConfig::default());
    h.mock.script("open_socket", [Step::Hang]);

    let started = tokio::time::Instant::now();
    let (state, ()) = tokio::join!(h.sup.connect(), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        h.sup.disconnect().await;
    });

    assert_eq!(state, ConnectionState::Disconnected);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(h.mock.calls("open_socket"), 1);
    assert_eq!(h.mock.calls("close_socket"), 0);

    let kinds = h.drain();
    assert_eq!(kinds, vec![EventKind::Connecting, EventKind::Disconnected]);
    assert_legal(&h.sup.state_history());
}
