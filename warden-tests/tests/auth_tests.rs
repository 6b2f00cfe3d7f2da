//! Session validation and rank checks through a live authority socket

use std::time::Duration;

use tempfile::TempDir;
use warden_daemon::audit::{ACTION_ROLE_ASSIGN, AuditOutcome};
use warden_daemon::roles::Role;
use warden_protocol::protocol::{ErrorKind, Response, ResponseData, SessionValidation};
use warden_tests::{TestConfigBuilder, TestDaemonHarness};

async fn authority(dir: &TempDir) -> TestDaemonHarness {
    let config = TestConfigBuilder::authority(dir.path(), "authority")
        .service("pugA", "sleep 30", "true")
        .service("ttt", "sleep 30", "true")
        .build();
    TestDaemonHarness::start(config).await.unwrap()
}

fn validation(response: Response) -> SessionValidation {
    match response {
        Response::Ok {
            data: Some(ResponseData::SessionValidation(v)),
            ..
        } => v,
        other => panic!("expected a validation, got {:?}", other),
    }
}

// ============================================================================
// Validation
// ============================================================================

#[tokio::test]
async fn validate_session_resolves_identity() {
    let dir = TempDir::new().unwrap();
    let harness = authority(&dir).await;
    let (user, token) = harness.login(&[Role::Helper, Role::Moderator]);

    let client = harness.client().await;
    let v = validation(client.validate_session(&token).await.unwrap());

    assert!(v.valid);
    assert_eq!(v.user_id, Some(user.0));
    assert_eq!(v.min_rank, Some(Role::Moderator.rank()));
    assert_eq!(v.roles, vec!["moderator".to_string(), "helper".to_string()]);
    assert!(v.expires_at.is_some());

    harness.stop().await;
}

#[tokio::test]
async fn unknown_and_revoked_tokens_are_invalid() {
    let dir = TempDir::new().unwrap();
    let harness = authority(&dir).await;
    let (_, token) = harness.login(&[Role::Moderator]);
    let client = harness.client().await;

    assert!(!validation(client.validate_session("not-a-token").await.unwrap()).valid);
    assert!(!validation(client.validate_session(&"ab".repeat(32)).await.unwrap()).valid);

    let logout = client.logout(&token).await.unwrap();
    assert!(logout.error_kind().is_none(), "logout failed: {:?}", logout);
    assert!(!validation(client.validate_session(&token).await.unwrap()).valid);

    // A second logout has nothing to revoke
    let again = client.logout(&token).await.unwrap();
    assert_eq!(again.error_kind(), Some(ErrorKind::Unauthorized));

    harness.stop().await;
}

// ============================================================================
// Rank checks
// ============================================================================

#[tokio::test]
async fn list_services_needs_helper_rank() {
    let dir = TempDir::new().unwrap();
    let harness = authority(&dir).await;
    let (_, helper) = harness.login(&[Role::Helper]);
    let (_, captain) = harness.login(&[Role::Captain]);
    let (_, plain) = harness.login(&[]);
    let client = harness.client().await;

    match client.list_services(&helper).await.unwrap() {
        Response::Ok {
            data: Some(ResponseData::Services(services)),
            ..
        } => {
            let names: Vec<_> = services.iter().map(|s| s.name.as_str()).collect();
            assert_eq!(names, vec!["pugA", "ttt"]);
        }
        other => panic!("unexpected response: {:?}", other),
    }

    for token in [&captain, &plain] {
        let response = client.list_services(token).await.unwrap();
        assert_eq!(response.error_kind(), Some(ErrorKind::Forbidden));
    }

    let response = client.list_services("garbage").await.unwrap();
    assert_eq!(response.error_kind(), Some(ErrorKind::Unauthorized));

    harness.stop().await;
}

#[tokio::test]
async fn role_grant_takes_effect_on_next_request() {
    let dir = TempDir::new().unwrap();
    let harness = authority(&dir).await;
    let (admin, admin_token) = harness.login(&[Role::Administrator]);
    let (target, target_token) = harness.login(&[]);
    let client = harness.client().await;

    assert_eq!(
        client.hub_status(&target_token).await.unwrap().error_kind(),
        Some(ErrorKind::Forbidden)
    );

    let response = client.assign_role(&admin_token, target.0, "moderator").await.unwrap();
    match response {
        Response::Ok {
            data: Some(ResponseData::RoleChange(change)),
            ..
        } => assert!(change.changed),
        other => panic!("unexpected response: {:?}", other),
    }

    // Same token, no re-login
    assert!(client.hub_status(&target_token).await.unwrap().error_kind().is_none());

    let entries = harness.audit_entries(ACTION_ROLE_ASSIGN);
    let last = entries.last().unwrap();
    assert_eq!(last.actor, Some(admin));
    assert_eq!(last.outcome, AuditOutcome::Success);

    harness.stop().await;
}

#[tokio::test]
async fn role_grant_above_own_rank_is_refused_and_audited() {
    let dir = TempDir::new().unwrap();
    let harness = authority(&dir).await;
    let (moderator, token) = harness.login(&[Role::Moderator]);
    let target = harness.create_user(&[]);
    let client = harness.client().await;

    let response = client.assign_role(&token, target.0, "administrator").await.unwrap();
    assert_eq!(response.error_kind(), Some(ErrorKind::PermissionDenied));
    assert!(harness.authority().roles.roles_of(target).is_empty());

    let entries = harness.audit_entries(ACTION_ROLE_ASSIGN);
    let last = entries.last().unwrap();
    assert_eq!(last.actor, Some(moderator));
    assert!(matches!(last.outcome, AuditOutcome::Denied { .. }));

    harness.stop().await;
}

#[tokio::test]
async fn expired_session_is_rejected() {
    let dir = TempDir::new().unwrap();
    let mut config = TestConfigBuilder::authority(dir.path(), "authority")
        .service("pugA", "sleep 30", "true")
        .build();
    config.sessions.ttl = Duration::from_millis(100);
    let harness = TestDaemonHarness::start(config).await.unwrap();
    let (_, token) = harness.login(&[Role::SuperAdmin]);
    let client = harness.client().await;

    assert!(client.list_services(&token).await.unwrap().error_kind().is_none());
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(
        client.list_services(&token).await.unwrap().error_kind(),
        Some(ErrorKind::Unauthorized)
    );

    harness.stop().await;
}
