use super::*;
use std::time::Duration;

use crate::audit::AuditLog;
use crate::users::{ExternalIds, UserDirectory};

struct Authority {
    users: Arc<UserDirectory>,
    roles: Arc<RoleRegistry>,
    sessions: Arc<SessionStore>,
    gate: AuthorizationGate,
}

fn authority() -> Authority {
    let users = Arc::new(UserDirectory::new());
    let roles = Arc::new(RoleRegistry::new(users.clone(), Arc::new(AuditLog::new())));
    let sessions = Arc::new(SessionStore::new(Duration::from_secs(3600)));
    let gate = AuthorizationGate::Local(LocalGate::new(sessions.clone(), roles.clone()));
    Authority {
        users,
        roles,
        sessions,
        gate,
    }
}

impl Authority {
    fn login(&self, roles: &[Role]) -> (UserId, String) {
        let user = self.users.create(None, ExternalIds::default()).unwrap().id;
        for role in roles {
            self.roles.seed(user, *role).unwrap();
        }
        let (token, _) = self.sessions.issue(user).unwrap();
        (user, token.to_hex())
    }
}

// ========================================================================
// Local gate
// ========================================================================

#[tokio::test]
async fn valid_token_resolves_identity() {
    let a = authority();
    let (user, token) = a.login(&[Role::Captain, Role::Moderator]);

    let identity = a.gate.validate(&token).await.unwrap();
    assert_eq!(identity.user_id, user);
    assert_eq!(identity.roles, vec![Role::Moderator, Role::Captain]);
    assert_eq!(identity.min_rank, 2);
}

#[tokio::test]
async fn user_without_roles_has_lowest_rank() {
    let a = authority();
    let (_, token) = a.login(&[]);
    let identity = a.gate.validate(&token).await.unwrap();
    assert!(identity.roles.is_empty());
    assert_eq!(identity.min_rank, crate::roles::LOWEST_RANK);
}

#[tokio::test]
async fn bad_tokens_are_unauthorized() {
    let a = authority();
    let unknown = "00".repeat(32);
    for token in ["", "garbage", unknown.as_str()] {
        assert_eq!(a.gate.validate(token).await, Err(AuthError::Unauthorized));
    }
}

#[tokio::test]
async fn revoked_token_is_unauthorized() {
    let a = authority();
    let (_, token) = a.login(&[Role::SuperAdmin]);
    a.sessions.revoke(&token);
    assert_eq!(a.gate.require_min_rank(&token, 5).await, Err(AuthError::Unauthorized));
}

#[tokio::test]
async fn rank_requirement_is_inclusive() {
    let a = authority();
    let (user, token) = a.login(&[Role::Moderator]);

    assert!(a.gate.require_min_rank(&token, 2).await.is_ok());
    assert!(a.gate.require_min_rank(&token, 5).await.is_ok());
    assert_eq!(
        a.gate.require_min_rank(&token, 1).await,
        Err(AuthError::Forbidden {
            user_id: user,
            required: 1,
            actual: 2
        })
    );
}

#[tokio::test]
async fn role_changes_apply_to_the_next_check() {
    let a = authority();
    let (admin, _) = a.login(&[Role::Administrator]);
    let (user, token) = a.login(&[]);

    assert!(a.gate.require_min_rank(&token, 2).await.is_err());
    a.roles.assign(admin, user, Role::Moderator).unwrap();
    assert!(a.gate.require_min_rank(&token, 2).await.is_ok());
}

#[test]
fn gate_kind() {
    assert!(authority().gate.is_local());
}

// ========================================================================
// Wire form
// ========================================================================

#[test]
fn validation_round_trip_keeps_rank_and_expiry() {
    let identity = Identity {
        user_id: UserId(4),
        roles: vec![Role::Helper],
        min_rank: 3,
        expires_at: Utc.timestamp_millis_opt(1_700_000_000_123).unwrap(),
    };
    let wire = identity.to_validation();
    assert!(wire.valid);
    assert_eq!(wire.roles, vec!["helper".to_string()]);
    assert_eq!(Identity::from_validation(&wire), Ok(Some(identity)));
}

#[test]
fn invalid_validation_is_none() {
    assert_eq!(Identity::from_validation(&SessionValidation::invalid()), Ok(None));
}

#[test]
fn valid_answer_missing_fields_is_malformed() {
    let wire = SessionValidation {
        valid: true,
        user_id: Some(1),
        roles: vec![],
        min_rank: None,
        expires_at: Some(0),
    };
    assert!(Identity::from_validation(&wire).is_err());
}

#[test]
fn unknown_roles_are_dropped_but_rank_is_kept() {
    let wire = SessionValidation {
        valid: true,
        user_id: Some(1),
        roles: vec!["wizard".into(), "captain".into()],
        min_rank: Some(4),
        expires_at: Some(1_700_000_000_000),
    };
    let identity = Identity::from_validation(&wire).unwrap().unwrap();
    assert_eq!(identity.roles, vec![Role::Captain]);
    assert_eq!(identity.min_rank, 4);
}
