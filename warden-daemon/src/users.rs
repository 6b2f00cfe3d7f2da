//! User records owned by the authority.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::errors::UserError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Accounts on external identity providers linked to a user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalIds {
    pub steam_id64: Option<String>,
    pub discord_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: Option<String>,
    pub external: ExternalIds,
    pub created_at: DateTime<Utc>,
}

#[derive(Default)]
struct Directory {
    users: HashMap<UserId, Arc<User>>,
    next_id: u64,
}

/// In-memory user table. The single writer of user records.
#[derive(Default)]
pub struct UserDirectory {
    inner: RwLock<Directory>,
}

impl UserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a user. An external identity can be linked to one user only.
    pub fn create(&self, name: Option<String>, external: ExternalIds) -> Result<Arc<User>, UserError> {
        let mut dir = self.inner.write();

        for existing in dir.users.values() {
            if let Some(steam) = &external.steam_id64
                && existing.external.steam_id64.as_ref() == Some(steam)
            {
                return Err(UserError::DuplicateIdentity {
                    identity: format!("steam:{}", steam),
                    user_id: existing.id,
                });
            }
            if let Some(discord) = &external.discord_id
                && existing.external.discord_id.as_ref() == Some(discord)
            {
                return Err(UserError::DuplicateIdentity {
                    identity: format!("discord:{}", discord),
                    user_id: existing.id,
                });
            }
        }

        dir.next_id += 1;
        let user = Arc::new(User {
            id: UserId(dir.next_id),
            name,
            external,
            created_at: Utc::now(),
        });
        dir.users.insert(user.id, Arc::clone(&user));
        Ok(user)
    }

    pub fn get(&self, id: UserId) -> Option<Arc<User>> {
        self.inner.read().users.get(&id).cloned()
    }

    pub fn contains(&self, id: UserId) -> bool {
        self.inner.read().users.contains_key(&id)
    }

    pub fn find_by_steam_id(&self, steam_id64: &str) -> Option<Arc<User>> {
        self.inner
            .read()
            .users
            .values()
            .find(|u| u.external.steam_id64.as_deref() == Some(steam_id64))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
