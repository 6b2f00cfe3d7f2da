use super::*;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ServiceDefinition;
use crate::errors::HubError;
use crate::manager::CommandManager;

fn settings() -> HubSettings {
    HubSettings {
        grace_period: Duration::from_millis(200),
        buffer_capacity: 16,
        stop_timeout: Duration::from_secs(1),
    }
}

fn hub_with(script: &str, settings: HubSettings) -> HubHandle {
    let service = ServiceDefinition::new(
        "pugA",
        vec!["sh".to_string(), "-c".to_string(), script.to_string()],
    );
    let (handle, actor) = HubActor::create(Arc::new(service), Arc::new(CommandManager), settings);
    tokio::spawn(actor.run());
    handle
}

fn hub(script: &str) -> HubHandle {
    hub_with(script, settings())
}

async fn wait_for_state(handle: &HubHandle, state: HubState, within: Duration) -> HubStatus {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        let status = handle.status().await.unwrap();
        if status.state == state || tokio::time::Instant::now() >= deadline {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn next_line(sub: &mut Subscription) -> String {
    match tokio::time::timeout(Duration::from_secs(5), sub.recv()).await {
        Ok(SubscriptionEvent::Line(line)) => line.message,
        other => panic!("expected a line, got {:?}", other),
    }
}

async fn closed(sub: &mut Subscription) -> CloseReason {
    loop {
        match tokio::time::timeout(Duration::from_secs(5), sub.recv()).await {
            Ok(SubscriptionEvent::Line(_)) => continue,
            Ok(SubscriptionEvent::Closed(reason)) => return reason,
            Err(_) => panic!("subscription did not close"),
        }
    }
}

fn process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

// ========================================================================
// Lifecycle
// ========================================================================

#[tokio::test]
async fn hub_starts_idle_without_a_process() {
    let handle = hub("sleep 30");
    let status = handle.status().await.unwrap();
    assert_eq!(status.state, HubState::Idle);
    assert_eq!(status.subscribers, 0);
    assert_eq!(status.pid, None);
}

#[tokio::test]
async fn first_subscriber_starts_the_tail() {
    let handle = hub("sleep 30");
    let _sub = handle.subscribe().await.unwrap();

    let status = handle.status().await.unwrap();
    assert_eq!(status.state, HubState::Streaming);
    assert_eq!(status.subscribers, 1);
    assert!(status.pid.is_some_and(process_alive));
    handle.shutdown().await;
}

#[tokio::test]
async fn second_subscriber_shares_the_process() {
    let handle = hub("sleep 30");
    let _a = handle.subscribe().await.unwrap();
    let pid = handle.status().await.unwrap().pid;
    let _b = handle.subscribe().await.unwrap();

    let status = handle.status().await.unwrap();
    assert_eq!(status.subscribers, 2);
    assert_eq!(status.pid, pid);
    handle.shutdown().await;
}

#[tokio::test]
async fn last_unsubscribe_drains_then_stops_the_tail() {
    let handle = hub("sleep 30");
    let mut sub = handle.subscribe().await.unwrap();
    let pid = handle.status().await.unwrap().pid.unwrap();

    sub.unsubscribe().await;
    let status = handle.status().await.unwrap();
    assert_eq!(status.state, HubState::Draining);
    assert_eq!(status.subscribers, 0);
    assert!(process_alive(pid), "tail must survive the grace period start");

    let status = wait_for_state(&handle, HubState::Idle, Duration::from_secs(3)).await;
    assert_eq!(status.state, HubState::Idle);
    assert_eq!(status.pid, None);
    assert!(!process_alive(pid));
}

#[tokio::test]
async fn resubscribe_during_grace_keeps_the_process() {
    let handle = hub("sleep 30");
    let mut first = handle.subscribe().await.unwrap();
    let pid = handle.status().await.unwrap().pid;
    first.unsubscribe().await;

    let _second = handle.subscribe().await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    let status = handle.status().await.unwrap();
    assert_eq!(status.state, HubState::Streaming);
    assert_eq!(status.pid, pid);
    handle.shutdown().await;
}

#[tokio::test]
async fn unsubscribe_is_idempotent() {
    let handle = hub("sleep 30");
    let mut a = handle.subscribe().await.unwrap();
    let _b = handle.subscribe().await.unwrap();

    a.unsubscribe().await;
    a.unsubscribe().await;
    drop(a);

    let status = handle.status().await.unwrap();
    assert_eq!(status.subscribers, 1);
    assert_eq!(status.state, HubState::Streaming);
    handle.shutdown().await;
}

#[tokio::test]
async fn dropped_subscription_counts_as_unsubscribe() {
    let handle = hub("sleep 30");
    let sub = handle.subscribe().await.unwrap();
    let pid = handle.status().await.unwrap().pid.unwrap();

    drop(sub);
    let status = wait_for_state(&handle, HubState::Idle, Duration::from_secs(3)).await;
    assert_eq!(status.state, HubState::Idle);
    assert!(!process_alive(pid));
}

// ========================================================================
// Delivery
// ========================================================================

#[tokio::test]
async fn lines_fan_out_in_order() {
    let handle = hub("sleep 0.3; echo one; echo two; echo three; sleep 30");
    let mut a = handle.subscribe().await.unwrap();
    let mut b = handle.subscribe().await.unwrap();

    for sub in [&mut a, &mut b] {
        assert_eq!(next_line(sub).await, "one");
        assert_eq!(next_line(sub).await, "two");
        assert_eq!(next_line(sub).await, "three");
    }
    handle.shutdown().await;
}

#[tokio::test]
async fn journal_json_lines_are_parsed() {
    let handle = hub(
        r#"sleep 0.2; echo '{"MESSAGE":"disk full","PRIORITY":"3","__REALTIME_TIMESTAMP":"1700000000000000"}'; sleep 30"#,
    );
    let mut sub = handle.subscribe().await.unwrap();

    match tokio::time::timeout(Duration::from_secs(5), sub.recv()).await {
        Ok(SubscriptionEvent::Line(line)) => {
            assert_eq!(line.message, "disk full");
            assert_eq!(line.priority, Some(3));
            assert_eq!(line.timestamp, Some(1_700_000_000_000_000));
        }
        other => panic!("expected a line, got {:?}", other),
    }
    handle.shutdown().await;
}

#[tokio::test]
async fn invalid_utf8_output_does_not_end_the_tail() {
    let handle = hub(r"sleep 0.2; printf 'ok\n\377\376\n'; echo after; sleep 30");
    let mut sub = handle.subscribe().await.unwrap();

    assert_eq!(next_line(&mut sub).await, "ok");
    assert_eq!(next_line(&mut sub).await, "\u{FFFD}\u{FFFD}");
    assert_eq!(next_line(&mut sub).await, "after");

    let status = tokio::time::timeout(Duration::from_secs(1), handle.status())
        .await
        .expect("hub stopped answering")
        .unwrap();
    assert_eq!(status.state, HubState::Streaming);
    assert_eq!(status.subscribers, 1);
    assert!(process_alive(status.pid.unwrap()));

    handle.shutdown().await;
}

#[tokio::test]
async fn slow_subscriber_is_disconnected_without_stalling_others() {
    let mut settings = settings();
    settings.buffer_capacity = 4;
    let handle = hub_with(
        "sleep 0.3; for i in $(seq 1 20); do echo $i; sleep 0.02; done; sleep 30",
        settings,
    );

    let mut slow = handle.subscribe().await.unwrap();
    let mut fast = handle.subscribe().await.unwrap();

    for expected in 1..=20 {
        assert_eq!(next_line(&mut fast).await, expected.to_string());
    }
    assert_eq!(closed(&mut slow).await, CloseReason::Overflow);

    let status = handle.status().await.unwrap();
    assert_eq!(status.subscribers, 1);
    handle.shutdown().await;
}

// ========================================================================
// Failures and shutdown
// ========================================================================

#[tokio::test]
async fn tail_exit_closes_subscribers_as_unavailable() {
    let handle = hub("sleep 0.2; echo last");
    let mut sub = handle.subscribe().await.unwrap();

    assert_eq!(next_line(&mut sub).await, "last");
    assert!(matches!(closed(&mut sub).await, CloseReason::ServiceUnavailable(_)));

    let status = wait_for_state(&handle, HubState::Idle, Duration::from_secs(3)).await;
    assert_eq!(status.state, HubState::Idle);
    assert_eq!(status.subscribers, 0);
}

#[tokio::test]
async fn tail_closing_stdout_is_stopped_without_wedging_the_hub() {
    // stdout closes while the process keeps running
    let handle = hub("sleep 0.2; echo bye; exec >&-; sleep 30");
    let mut sub = handle.subscribe().await.unwrap();
    let pid = handle.status().await.unwrap().pid.unwrap();

    assert_eq!(next_line(&mut sub).await, "bye");
    assert!(matches!(closed(&mut sub).await, CloseReason::ServiceUnavailable(_)));

    let status = tokio::time::timeout(Duration::from_secs(3), handle.status())
        .await
        .expect("hub stopped answering")
        .unwrap();
    assert_eq!(status.state, HubState::Idle);
    assert_eq!(status.pid, None);
    assert!(!process_alive(pid));

    // Still serving new subscribers
    let again = tokio::time::timeout(Duration::from_secs(3), handle.subscribe())
        .await
        .expect("hub stopped answering");
    assert!(again.is_ok());

    handle.shutdown().await;
}

#[tokio::test]
async fn spawn_failure_is_stream_unavailable() {
    let service = ServiceDefinition::new("broken", vec!["/nonexistent/warden-tail".to_string()]);
    let (handle, actor) = HubActor::create(Arc::new(service), Arc::new(CommandManager), settings());
    tokio::spawn(actor.run());

    let err = handle.subscribe().await.err().unwrap();
    assert!(matches!(err, HubError::StreamUnavailable { .. }));

    let status = handle.status().await.unwrap();
    assert_eq!(status.state, HubState::Idle);
    assert_eq!(status.subscribers, 0);
}

#[tokio::test]
async fn shutdown_closes_every_subscription() {
    let handle = hub("sleep 30");
    let mut a = handle.subscribe().await.unwrap();
    let mut b = handle.subscribe().await.unwrap();
    let pid = handle.status().await.unwrap().pid.unwrap();

    handle.shutdown().await;
    assert_eq!(closed(&mut a).await, CloseReason::Shutdown);
    assert_eq!(closed(&mut b).await, CloseReason::Shutdown);
    assert!(!process_alive(pid));
    assert!(matches!(handle.status().await, Err(HubError::HubStopped(_))));
}

#[test]
fn close_reasons_map_to_stream_states() {
    use warden_protocol::protocol::StreamState;
    assert_eq!(CloseReason::Unsubscribed.stream_state(), None);
    assert_eq!(CloseReason::Overflow.stream_state(), Some(StreamState::OverflowDisconnect));
    assert_eq!(CloseReason::Shutdown.stream_state(), Some(StreamState::Shutdown));
}

// ========================================================================
// Registry
// ========================================================================

#[tokio::test]
async fn registry_runs_one_hub_per_service() {
    let catalog = crate::config::ServiceCatalog::new([
        ServiceDefinition::new("a", vec!["sleep".into(), "30".into()]),
        ServiceDefinition::new("b", vec!["sleep".into(), "30".into()]),
    ]);
    let registry = HubRegistry::start(&catalog, Arc::new(CommandManager), settings());
    assert_eq!(registry.len(), 2);

    let _sub = registry.subscribe("a").await.unwrap();
    let statuses = registry.statuses().await;
    assert_eq!(statuses.len(), 2);
    assert_eq!(statuses[0].service, "a");
    assert_eq!(statuses[0].state, HubState::Streaming);
    assert_eq!(statuses[1].state, HubState::Idle);

    assert!(matches!(
        registry.subscribe("missing").await,
        Err(HubError::ServiceNotFound(_))
    ));
    registry.shutdown_all().await;
    assert!(registry.statuses().await.is_empty());
}

// ========================================================================
// Journal parsing
// ========================================================================

#[test]
fn plain_text_passes_through() {
    let line = journal::parse_line("hello world\n");
    assert_eq!(line.message, "hello world");
    assert_eq!(line.priority, None);
    assert_eq!(line.timestamp, None);
}

#[test]
fn json_that_is_not_an_object_is_plain_text() {
    assert_eq!(journal::parse_line("[1,2,3]").message, "[1,2,3]");
    assert_eq!(journal::parse_line("42").message, "42");
}

#[test]
fn byte_array_messages_are_decoded() {
    let line = journal::parse_line(r#"{"MESSAGE":[104,105],"PRIORITY":"6"}"#);
    assert_eq!(line.message, "hi");
    assert_eq!(line.priority, Some(6));
}

#[test]
fn out_of_range_priority_is_dropped() {
    let line = journal::parse_line(r#"{"MESSAGE":"x","PRIORITY":"900"}"#);
    assert_eq!(line.priority, None);
}
