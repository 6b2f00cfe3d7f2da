//! A dependent daemon delegating validation to a live authority

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tempfile::TempDir;
use warden_daemon::audit::{ACTION_RESTART, AuditOutcome};
use warden_daemon::gate::AuthorizationGate;
use warden_daemon::manager::CommandManager;
use warden_daemon::roles::Role;
use warden_daemon::validator::{AuthorityUpstream, CrossServiceValidator};
use warden_protocol::protocol::ErrorKind;
use warden_tests::{CountingAuthority, MarkerFileHelper, TestConfigBuilder, TestDaemonHarness, wait_until};

struct Pair {
    authority: TestDaemonHarness,
    dependent: TestDaemonHarness,
    upstream: Arc<CountingAuthority>,
}

async fn pair(dir: &TempDir, cache_ttl: Duration) -> Pair {
    let authority_config = TestConfigBuilder::authority(dir.path(), "authority")
        .service("site", "sleep 30", "true")
        .build();
    let authority = TestDaemonHarness::start(authority_config).await.unwrap();

    let markers = MarkerFileHelper::new(dir.path());
    let dependent_config = TestConfigBuilder::dependent(dir.path(), "pug", authority.socket_path())
        .service("pugA", "sleep 30", &markers.append_script("pugA-restart"))
        .cache_ttl(cache_ttl)
        .build();
    let upstream = CountingAuthority::new(authority.socket_path().to_path_buf());
    let as_upstream: Arc<dyn AuthorityUpstream> = upstream.clone();
    let dependent = TestDaemonHarness::start_with(dependent_config, Arc::new(CommandManager), Some(as_upstream))
        .await
        .unwrap();

    // Let the revocation feed attach; it clears the cache when it opens
    tokio::time::sleep(Duration::from_millis(200)).await;

    Pair {
        authority,
        dependent,
        upstream,
    }
}

fn remote_validator(harness: &TestDaemonHarness) -> Arc<CrossServiceValidator> {
    match harness.daemon.gate.as_ref() {
        AuthorizationGate::Remote(validator) => validator.clone(),
        AuthorizationGate::Local(_) => panic!("expected a dependent daemon"),
    }
}

// ============================================================================
// Coalescing and caching
// ============================================================================

#[tokio::test]
async fn concurrent_requests_share_one_upstream_call() {
    let dir = TempDir::new().unwrap();
    let pair = pair(&dir, Duration::from_secs(60)).await;
    let (_, token) = pair.authority.login(&[Role::Helper]);
    let before = pair.upstream.calls();

    let client = pair.dependent.client().await;
    let responses = join_all((0..20).map(|_| client.list_services(&token))).await;
    for response in responses {
        assert!(response.unwrap().error_kind().is_none());
    }
    assert_eq!(pair.upstream.calls() - before, 1);

    // Cached from here on
    assert!(client.list_services(&token).await.unwrap().error_kind().is_none());
    assert_eq!(pair.upstream.calls() - before, 1);

    pair.dependent.stop().await;
    pair.authority.stop().await;
}

#[tokio::test]
async fn role_changes_reach_dependents_after_cache_ttl() {
    let dir = TempDir::new().unwrap();
    let pair = pair(&dir, Duration::from_secs(1)).await;
    let (_, admin) = pair.authority.login(&[Role::Administrator]);
    let (target, token) = pair.authority.login(&[Role::Helper]);
    let client = pair.dependent.client().await;

    assert_eq!(
        client.hub_status(&token).await.unwrap().error_kind(),
        Some(ErrorKind::Forbidden)
    );

    let authority_client = pair.authority.client().await;
    let granted = authority_client.assign_role(&admin, target.0, "moderator").await.unwrap();
    assert!(granted.error_kind().is_none());

    // Still the cached decision
    assert_eq!(
        client.hub_status(&token).await.unwrap().error_kind(),
        Some(ErrorKind::Forbidden)
    );

    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert!(client.hub_status(&token).await.unwrap().error_kind().is_none());

    pair.dependent.stop().await;
    pair.authority.stop().await;
}

// ============================================================================
// Revocation
// ============================================================================

#[tokio::test]
async fn logout_at_authority_evicts_dependent_cache() {
    let dir = TempDir::new().unwrap();
    let pair = pair(&dir, Duration::from_secs(60)).await;
    let (_, token) = pair.authority.login(&[Role::Moderator]);
    let client = pair.dependent.client().await;
    let validator = remote_validator(&pair.dependent);

    assert!(client.hub_status(&token).await.unwrap().error_kind().is_none());
    assert_eq!(validator.cached_len(), 1);

    let authority_client = pair.authority.client().await;
    assert!(authority_client.logout(&token).await.unwrap().error_kind().is_none());

    assert!(wait_until(Duration::from_secs(2), || validator.cached_len() == 0).await);
    assert_eq!(
        client.hub_status(&token).await.unwrap().error_kind(),
        Some(ErrorKind::Unauthorized)
    );

    pair.dependent.stop().await;
    pair.authority.stop().await;
}

// ============================================================================
// Fail closed
// ============================================================================

#[tokio::test]
async fn unreachable_authority_refuses_everything() {
    let dir = TempDir::new().unwrap();
    let markers = MarkerFileHelper::new(dir.path());
    let config = TestConfigBuilder::dependent(dir.path(), "pug", &dir.path().join("missing.sock"))
        .service("pugA", "sleep 30", &markers.append_script("pugA-restart"))
        .build();
    let dependent = TestDaemonHarness::start(config).await.unwrap();
    let client = dependent.client().await;
    let token = "ab".repeat(32);

    assert_eq!(
        client.list_services(&token).await.unwrap().error_kind(),
        Some(ErrorKind::ServiceUnavailable)
    );
    assert_eq!(
        client.restart_service(&token, "pugA").await.unwrap().error_kind(),
        Some(ErrorKind::ServiceUnavailable)
    );
    assert!(!markers.marker_exists("pugA-restart"));

    let entries = dependent.audit_entries(ACTION_RESTART);
    assert_eq!(entries.len(), 1);
    assert!(matches!(entries[0].outcome, AuditOutcome::Failure { .. }));

    dependent.stop().await;
}

#[tokio::test]
async fn restart_on_dependent_uses_authority_identity() {
    let dir = TempDir::new().unwrap();
    let pair = pair(&dir, Duration::from_secs(60)).await;
    let (moderator, token) = pair.authority.login(&[Role::Moderator]);
    let client = pair.dependent.client().await;
    let markers = MarkerFileHelper::new(dir.path());

    let response = client.restart_service(&token, "pugA").await.unwrap();
    assert!(response.error_kind().is_none(), "restart failed: {:?}", response);
    assert_eq!(markers.count_marker_lines("pugA-restart"), 1);

    let entries = pair.dependent.audit_entries(ACTION_RESTART);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].actor, Some(moderator));
    assert_eq!(entries[0].target, "pugA");
    assert_eq!(entries[0].outcome, AuditOutcome::Success);

    pair.dependent.stop().await;
    pair.authority.stop().await;
}
