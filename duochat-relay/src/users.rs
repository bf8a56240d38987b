//! Directory of known users, used to build the conversation sidebar.
//!
//! Accounts live with the upstream auth service. The relay only learns about
//! a user when they connect, call the API, or are preloaded from config.

use std::collections::BTreeMap;

use duochat_proto::api::UserProfile;
use duochat_proto::message::UserId;
use tokio::sync::RwLock;

/// Sorted set of user profiles.
#[derive(Debug, Default)]
pub struct UserDirectory {
    users: RwLock<BTreeMap<UserId, UserProfile>>,
}

impl UserDirectory {
    /// Creates an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a directory preloaded with `profiles`.
    #[must_use]
    pub fn with_profiles(profiles: impl IntoIterator<Item = UserProfile>) -> Self {
        let users = profiles.into_iter().map(|p| (p.id.clone(), p)).collect();
        Self {
            users: RwLock::new(users),
        }
    }

    /// Records that `user` exists, using the id as display name when the
    /// user is new. Returns `true` if the user was not known before.
    pub async fn touch(&self, user: &UserId) -> bool {
        if self.users.read().await.contains_key(user) {
            return false;
        }
        let mut users = self.users.write().await;
        if users.contains_key(user) {
            return false;
        }
        tracing::debug!(user_id = %user, "registering user in directory");
        users.insert(user.clone(), UserProfile::named(user.clone(), user.as_str()));
        true
    }

    /// Returns the profile of `user`, if known.
    pub async fn get(&self, user: &UserId) -> Option<UserProfile> {
        self.users.read().await.get(user).cloned()
    }

    /// Every known user except `me`, sorted by id.
    pub async fn others(&self, me: &UserId) -> Vec<UserProfile> {
        self.users
            .read()
            .await
            .values()
            .filter(|p| &p.id != me)
            .cloned()
            .collect()
    }

    /// Number of known users.
    pub async fn len(&self) -> usize {
        self.users.read().await.len()
    }

    /// Returns `true` if no user is known.
    pub async fn is_empty(&self) -> bool {
        self.users.read().await.is_empty()
    }
}
