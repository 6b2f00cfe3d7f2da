//! Async utilities to wait for state transitions

use std::path::Path;
use std::time::Duration;

use tokio::time::{Instant, sleep};
use warden_daemon::hub::{HubRegistry, HubState, HubStatus};
use warden_protocol::client::Client;

/// Wait until the daemon socket accepts connections
pub async fn wait_for_socket(socket_path: &Path, timeout: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if Client::is_daemon_running(socket_path).await {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Poll a hub until it reaches `expected`. Returns the last status seen.
pub async fn wait_for_hub_state(
    hubs: &HubRegistry,
    service: &str,
    expected: HubState,
    timeout: Duration,
) -> Option<HubStatus> {
    let hub = hubs.get(service)?;
    let start = Instant::now();
    loop {
        let status = hub.status().await.ok()?;
        if status.state == expected || start.elapsed() >= timeout {
            return Some(status);
        }
        sleep(Duration::from_millis(20)).await;
    }
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    condition()
}
