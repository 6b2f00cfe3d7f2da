//! Role hierarchy and user↔role assignments.
//!
//! Roles form a fixed, totally ordered hierarchy. Each role has a rank;
//! a lower rank is more privileged. A user's effective privilege is their
//! best (minimum) rank; a user with no assignments is a plain `user`.
//!
//! Assignment rule: an actor may grant or remove a role only when that
//! role's rank is strictly greater than the actor's own best rank, and
//! never on themselves. A refused change leaves the table untouched.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::audit::{
    ACTION_ROLE_ASSIGN, ACTION_ROLE_REMOVE, ACTION_ROLE_SEED, AuditEntry, AuditLog, AuditOutcome,
};
use crate::errors::RoleError;
use crate::users::{UserDirectory, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    SuperAdmin,
    Administrator,
    Moderator,
    Helper,
    Captain,
    User,
}

/// Every role, most privileged first.
pub const ALL_ROLES: &[Role] = &[
    Role::SuperAdmin,
    Role::Administrator,
    Role::Moderator,
    Role::Helper,
    Role::Captain,
    Role::User,
];

/// Rank of users with no role assignments.
pub const LOWEST_RANK: u8 = Role::User.rank();

/// Required rank for service control.
pub const MODERATOR_OR_ABOVE: u8 = Role::Moderator.rank();

impl Role {
    pub const fn rank(self) -> u8 {
        match self {
            Role::SuperAdmin => 0,
            Role::Administrator => 1,
            Role::Moderator => 2,
            Role::Helper => 3,
            Role::Captain => 4,
            Role::User => 5,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Role::SuperAdmin => "superadmin",
            Role::Administrator => "administrator",
            Role::Moderator => "moderator",
            Role::Helper => "helper",
            Role::Captain => "captain",
            Role::User => "user",
        }
    }

    pub fn parse(name: &str) -> Option<Role> {
        ALL_ROLES
            .iter()
            .copied()
            .find(|r| r.name().eq_ignore_ascii_case(name.trim()))
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Role {
    type Err = RoleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::parse(s).ok_or_else(|| RoleError::UnknownRole(s.to_string()))
    }
}

/// Check the assignment rule without touching any state.
pub fn check_assignment(actor: UserId, actor_rank: u8, target: UserId, role: Role) -> Result<(), String> {
    if actor == target {
        return Err("users cannot modify their own roles".to_string());
    }
    if role.rank() <= actor_rank {
        return Err(format!(
            "role '{}' (rank {}) is not below your rank {}",
            role,
            role.rank(),
            actor_rank
        ));
    }
    Ok(())
}

/// Best rank among a set of roles.
pub fn min_rank_of<'a>(roles: impl IntoIterator<Item = &'a Role>) -> u8 {
    roles
        .into_iter()
        .map(|r| r.rank())
        .min()
        .unwrap_or(LOWEST_RANK)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RoleOp {
    Assign,
    Remove,
}

impl RoleOp {
    fn action(self) -> &'static str {
        match self {
            RoleOp::Assign => ACTION_ROLE_ASSIGN,
            RoleOp::Remove => ACTION_ROLE_REMOVE,
        }
    }
}

/// Whether an allowed change actually altered the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleChange {
    Applied,
    /// The user already had (assign) or already lacked (remove) the role
    Unchanged,
}

/// Owned store of role assignments. The single writer of the role table.
pub struct RoleRegistry {
    assignments: RwLock<HashMap<UserId, BTreeSet<Role>>>,
    users: Arc<UserDirectory>,
    audit: Arc<AuditLog>,
}

impl RoleRegistry {
    pub fn new(users: Arc<UserDirectory>, audit: Arc<AuditLog>) -> Self {
        Self {
            assignments: RwLock::new(HashMap::new()),
            users,
            audit,
        }
    }

    /// Roles held by a user, most privileged first.
    pub fn roles_of(&self, user: UserId) -> Vec<Role> {
        self.assignments
            .read()
            .get(&user)
            .map(|roles| roles.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn min_rank(&self, user: UserId) -> u8 {
        self.assignments
            .read()
            .get(&user)
            .map(|roles| min_rank_of(roles))
            .unwrap_or(LOWEST_RANK)
    }

    /// Roles the actor is allowed to hand out.
    pub fn assignable_roles(&self, actor: UserId) -> Vec<Role> {
        let rank = self.min_rank(actor);
        ALL_ROLES.iter().copied().filter(|r| r.rank() > rank).collect()
    }

    pub fn assign(&self, actor: UserId, target: UserId, role: Role) -> Result<RoleChange, RoleError> {
        self.apply(actor, target, role, RoleOp::Assign)
    }

    pub fn remove(&self, actor: UserId, target: UserId, role: Role) -> Result<RoleChange, RoleError> {
        self.apply(actor, target, role, RoleOp::Remove)
    }

    /// Grant a role outside the assignment rule. Only reachable by local
    /// operators, to bootstrap the first administrators.
    pub fn seed(&self, target: UserId, role: Role) -> Result<RoleChange, RoleError> {
        if !self.users.contains(target) {
            return Err(RoleError::UserNotFound(target));
        }
        let inserted = self.assignments.write().entry(target).or_default().insert(role);
        self.audit.record(AuditEntry::new(
            None,
            ACTION_ROLE_SEED,
            role_target(target, role),
            AuditOutcome::Success,
        ));
        info!("Seeded role {} for user {}", role, target);
        Ok(if inserted { RoleChange::Applied } else { RoleChange::Unchanged })
    }

    fn apply(&self, actor: UserId, target: UserId, role: Role, op: RoleOp) -> Result<RoleChange, RoleError> {
        let audit_target = role_target(target, role);

        let result = {
            let mut table = self.assignments.write();
            let actor_rank = table.get(&actor).map(|roles| min_rank_of(roles)).unwrap_or(LOWEST_RANK);

            match check_assignment(actor, actor_rank, target, role) {
                Err(reason) => Err(RoleError::PermissionDenied(reason)),
                Ok(()) if !self.users.contains(target) => Err(RoleError::UserNotFound(target)),
                Ok(()) => {
                    let changed = match op {
                        RoleOp::Assign => table.entry(target).or_default().insert(role),
                        RoleOp::Remove => {
                            let removed = table.get_mut(&target).is_some_and(|roles| roles.remove(&role));
                            if table.get(&target).is_some_and(|roles| roles.is_empty()) {
                                table.remove(&target);
                            }
                            removed
                        }
                    };
                    Ok(if changed { RoleChange::Applied } else { RoleChange::Unchanged })
                }
            }
        };

        let outcome = match &result {
            Ok(_) => AuditOutcome::Success,
            Err(e @ RoleError::PermissionDenied(_)) => AuditOutcome::Denied { reason: e.to_string() },
            Err(e) => AuditOutcome::Failure { reason: e.to_string() },
        };
        self.audit.record(AuditEntry::new(Some(actor), op.action(), audit_target, outcome));

        if let Ok(RoleChange::Applied) = result {
            info!("User {} {} role {} for user {}", actor, op.action(), role, target);
        }
        result
    }
}

fn role_target(user: UserId, role: Role) -> String {
    format!("user:{}/{}", user, role)
}
