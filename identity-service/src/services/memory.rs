use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::error::StorageError;
use super::storage::{AppStorage, InviteStorage, TokenStorage, UserAuthStorage, UserStorage};
use crate::models::{
    AppData, FirstFactorInternalStrategy, Identity, Invite, InviteQuery, NewUser, SolveContext,
    TokenStorageEntity, User, UserAuthChallenge, UserData, UserDataField,
};

type ChallengeKey = (FirstFactorInternalStrategy, String);

struct StoredToken {
    entity: TokenStorageEntity,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct MemoryState {
    apps: HashMap<String, AppData>,
    users: HashMap<String, User>,
    user_data: HashMap<String, UserData>,
    tokens: HashMap<String, StoredToken>,
    challenges: HashMap<String, UserAuthChallenge>,
    /// Newest challenge id per strategy and user key.
    latest_challenge: HashMap<ChallengeKey, String>,
    invites: HashMap<String, Invite>,
}

impl MemoryState {
    fn prune_challenges(&mut self, now: DateTime<Utc>) {
        self.challenges.retain(|_, c| c.expires_at > now);
        let live = &self.challenges;
        self.latest_challenge.retain(|_, id| live.contains_key(id));
    }

    fn prune_tokens(&mut self, now: DateTime<Utc>) {
        self.tokens.retain(|_, t| t.expires_at > now);
    }
}

/// Apps and users loaded at startup.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SeedData {
    #[serde(default)]
    pub apps: Vec<AppData>,
    #[serde(default)]
    pub users: Vec<SeedUser>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedUser {
    #[serde(flatten)]
    pub user: User,
    #[serde(default)]
    pub data: UserData,
}

/// Process-local implementation of every storage trait.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<MemoryState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seed(seed: SeedData) -> Result<Self, StorageError> {
        let store = Self::new();
        for app in seed.apps {
            store.insert_app(app)?;
        }
        for SeedUser { user, data } in seed.users {
            store.insert_user(user, data)?;
        }
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, StorageError> {
        self.state
            .lock()
            .map_err(|e| StorageError::Backend(format!("memory store mutex poisoned: {}", e)))
    }

    pub fn insert_app(&self, app: AppData) -> Result<(), StorageError> {
        self.lock()?.apps.insert(app.id.clone(), app);
        Ok(())
    }

    /// Insert a user with a known id, replacing any previous record.
    pub fn insert_user(&self, user: User, data: UserData) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        state.user_data.insert(user.id.clone(), data);
        state.users.insert(user.id.clone(), user);
        Ok(())
    }

    pub fn challenge_count(&self) -> Result<usize, StorageError> {
        Ok(self.lock()?.challenges.len())
    }
}

fn matches_identity(user: &User, identity: Identity, value: &str) -> bool {
    let stored = user.identity_value(identity);
    match identity {
        Identity::Email => stored.eq_ignore_ascii_case(value),
        _ => stored == value,
    }
}

#[async_trait]
impl AppStorage for InMemoryStore {
    async fn app_by_id(&self, id: &str) -> Result<Option<AppData>, StorageError> {
        Ok(self.lock()?.apps.get(id).cloned())
    }
}

#[async_trait]
impl UserStorage for InMemoryStore {
    async fn user_by_id(&self, id: &str) -> Result<Option<User>, StorageError> {
        Ok(self.lock()?.users.get(id).cloned())
    }

    async fn user_by_secondary_id(
        &self,
        identity: Identity,
        value: &str,
    ) -> Result<Option<User>, StorageError> {
        if value.is_empty() {
            return Ok(None);
        }
        Ok(self
            .lock()?
            .users
            .values()
            .find(|u| matches_identity(u, identity, value))
            .cloned())
    }

    async fn user_data(
        &self,
        id: &str,
        fields: &[UserDataField],
    ) -> Result<UserData, StorageError> {
        Ok(self
            .lock()?
            .user_data
            .get(id)
            .map(|data| data.select(fields))
            .unwrap_or_default())
    }

    async fn add_user(&self, user: NewUser) -> Result<User, StorageError> {
        let mut state = self.lock()?;
        let taken = state.users.values().any(|u| {
            (!user.email.is_empty() && u.email.eq_ignore_ascii_case(&user.email))
                || (!user.phone_number.is_empty() && u.phone_number == user.phone_number)
                || (!user.username.is_empty() && u.username == user.username)
        });
        if taken {
            return Err(StorageError::Duplicate("user".to_string()));
        }

        let created = User {
            id: Uuid::new_v4().to_string(),
            username: user.username,
            email: user.email,
            phone_number: user.phone_number,
            given_name: user.given_name,
            active: true,
            anonymous: false,
            access_role: String::new(),
            scopes: user.scopes,
            locale: user.locale,
        };
        state.users.insert(created.id.clone(), created.clone());
        state
            .user_data
            .insert(created.id.clone(), UserData::default());
        Ok(created)
    }

    async fn update_user_data(
        &self,
        id: &str,
        data: &UserData,
        fields: &[UserDataField],
    ) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        if !state.users.contains_key(id) {
            return Err(StorageError::Backend(format!("user {} does not exist", id)));
        }
        state
            .user_data
            .entry(id.to_string())
            .or_default()
            .apply(data, fields);
        Ok(())
    }
}

#[async_trait]
impl TokenStorage for InMemoryStore {
    async fn save_token(
        &self,
        entity: &TokenStorageEntity,
        ttl_seconds: i64,
    ) -> Result<bool, StorageError> {
        let now = Utc::now();
        let mut state = self.lock()?;
        state.prune_tokens(now);
        if state.tokens.contains_key(&entity.id) {
            return Ok(false);
        }
        state.tokens.insert(
            entity.id.clone(),
            StoredToken {
                entity: entity.clone(),
                expires_at: now + Duration::seconds(ttl_seconds.max(1)),
            },
        );
        Ok(true)
    }

    async fn token_by_id(&self, id: &str) -> Result<Option<TokenStorageEntity>, StorageError> {
        let now = Utc::now();
        Ok(self
            .lock()?
            .tokens
            .get(id)
            .filter(|t| t.expires_at > now)
            .map(|t| t.entity.clone()))
    }
}

#[async_trait]
impl UserAuthStorage for InMemoryStore {
    async fn add_challenge(&self, challenge: &UserAuthChallenge) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        state.prune_challenges(Utc::now());
        let key = (challenge.strategy, challenge.user_id.clone());
        if let Some(previous) = state.latest_challenge.insert(key, challenge.id.clone()) {
            state.challenges.remove(&previous);
        }
        state
            .challenges
            .insert(challenge.id.clone(), challenge.clone());
        Ok(())
    }

    async fn get_latest_challenge(
        &self,
        strategy: &FirstFactorInternalStrategy,
        user_id: &str,
    ) -> Result<Option<UserAuthChallenge>, StorageError> {
        let state = self.lock()?;
        Ok(state
            .latest_challenge
            .get(&(*strategy, user_id.to_string()))
            .and_then(|id| state.challenges.get(id))
            .cloned())
    }

    async fn mark_challenge_as_sent(&self, id: &str) -> Result<(), StorageError> {
        if let Some(c) = self.lock()?.challenges.get_mut(id) {
            c.sent_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn begin_attempt(&self, id: &str) -> Result<bool, StorageError> {
        let now = Utc::now();
        let mut state = self.lock()?;
        let Some(c) = state.challenges.get_mut(id) else {
            return Ok(false);
        };
        if !c.valid_at(now) {
            return Ok(false);
        }
        c.attempts += 1;
        Ok(true)
    }

    async fn mark_challenge_as_solved(
        &self,
        id: &str,
        context: &SolveContext,
    ) -> Result<bool, StorageError> {
        let now = Utc::now();
        let mut state = self.lock()?;
        let Some(c) = state.challenges.get_mut(id) else {
            return Ok(false);
        };
        if c.solved || now >= c.expires_at {
            return Ok(false);
        }
        c.solved = true;
        c.solved_at = Some(now);
        c.solved_device_id = context.device_id.clone();
        c.solved_user_agent = context.user_agent.clone();
        Ok(true)
    }
}

#[async_trait]
impl InviteStorage for InMemoryStore {
    async fn save(&self, invite: &Invite) -> Result<(), StorageError> {
        self.lock()?
            .invites
            .insert(invite.id.clone(), invite.clone());
        Ok(())
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<Invite>, StorageError> {
        Ok(self.lock()?.invites.get(id).cloned())
    }

    async fn get_by_token(&self, token: &str) -> Result<Option<Invite>, StorageError> {
        Ok(self
            .lock()?
            .invites
            .values()
            .find(|i| i.token == token)
            .cloned())
    }

    async fn get_all(&self, query: &InviteQuery) -> Result<Vec<Invite>, StorageError> {
        let mut invites: Vec<Invite> = self
            .lock()?
            .invites
            .values()
            .filter(|i| query.matches(i))
            .cloned()
            .collect();
        invites.sort_by_key(|i| i.created_at);
        Ok(invites)
    }

    async fn update(&self, invite: &Invite) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        match state.invites.get_mut(&invite.id) {
            Some(existing) => {
                *existing = invite.clone();
                Ok(())
            }
            None => Err(StorageError::Backend(format!(
                "invite {} does not exist",
                invite.id
            ))),
        }
    }

    async fn mark_accepted(&self, id: &str, user_id: &str) -> Result<bool, StorageError> {
        let mut state = self.lock()?;
        let Some(invite) = state.invites.get_mut(id) else {
            return Ok(false);
        };
        if invite.accepted_at.is_some() {
            return Ok(false);
        }
        invite.accepted_at = Some(Utc::now());
        invite.accepted_by = Some(user_id.to_string());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChallengeType, TokenType, Transport, MAX_VERIFY_ATTEMPTS};

    fn challenge(id: &str) -> UserAuthChallenge {
        let now = Utc::now();
        UserAuthChallenge {
            id: id.to_string(),
            user_id: "u1".to_string(),
            device_id: String::new(),
            user_agent: String::new(),
            app_id: "a1".to_string(),
            strategy: FirstFactorInternalStrategy::new(
                Identity::Phone,
                ChallengeType::Otp,
                Transport::Sms,
            ),
            otp: "123456".to_string(),
            user_code_challenge: String::new(),
            solved: false,
            attempts: 0,
            created_at: now,
            sent_at: None,
            expires_at: now + Duration::minutes(5),
            expires_mins: 5,
            solved_at: None,
            solved_device_id: String::new(),
            solved_user_agent: String::new(),
        }
    }

    #[tokio::test]
    async fn test_save_token_is_insert_if_absent() {
        let store = InMemoryStore::new();
        let entity = TokenStorageEntity::new("jti-1", TokenType::Refresh, "u1");
        assert!(store.save_token(&entity, 60).await.unwrap());
        assert!(!store.save_token(&entity, 60).await.unwrap());
        assert!(store.token_by_id("jti-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_tokens_expire_after_ttl() {
        let store = InMemoryStore::new();
        let entity = TokenStorageEntity::new("jti-2", TokenType::Access, "u1");
        assert!(store.save_token(&entity, 1).await.unwrap());
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        assert!(store.token_by_id("jti-2").await.unwrap().is_none());
        assert!(store.save_token(&entity, 60).await.unwrap());
    }

    #[tokio::test]
    async fn test_mark_solved_is_compare_and_swap() {
        let store = InMemoryStore::new();
        store.add_challenge(&challenge("c1")).await.unwrap();
        let ctx = SolveContext::default();
        assert!(store.mark_challenge_as_solved("c1", &ctx).await.unwrap());
        assert!(!store.mark_challenge_as_solved("c1", &ctx).await.unwrap());
        assert!(!store.mark_challenge_as_solved("missing", &ctx).await.unwrap());
    }

    #[tokio::test]
    async fn test_latest_challenge_wins() {
        let store = InMemoryStore::new();
        store.add_challenge(&challenge("c1")).await.unwrap();
        let mut second = challenge("c2");
        second.created_at = second.created_at + Duration::seconds(1);
        store.add_challenge(&second).await.unwrap();

        let strategy = second.strategy;
        let latest = store
            .get_latest_challenge(&strategy, "u1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.id, "c2");
        assert!(store
            .get_latest_challenge(&strategy, "u2")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_new_challenge_replaces_previous() {
        let store = InMemoryStore::new();
        store.add_challenge(&challenge("c1")).await.unwrap();
        store.add_challenge(&challenge("c2")).await.unwrap();
        assert_eq!(store.challenge_count().unwrap(), 1);

        let ctx = SolveContext::default();
        assert!(!store.begin_attempt("c1").await.unwrap());
        assert!(!store.mark_challenge_as_solved("c1", &ctx).await.unwrap());
        assert!(store.mark_challenge_as_solved("c2", &ctx).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_challenges_are_pruned() {
        let store = InMemoryStore::new();
        for i in 0..10 {
            let mut stale = challenge(&format!("old-{}", i));
            stale.user_id = format!("u{}", i);
            stale.expires_at = Utc::now() - Duration::seconds(1);
            store.add_challenge(&stale).await.unwrap();
        }
        let mut fresh = challenge("fresh");
        fresh.user_id = "someone-else".to_string();
        store.add_challenge(&fresh).await.unwrap();
        assert_eq!(store.challenge_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let store = InMemoryStore::new();
        store.add_challenge(&challenge("c1")).await.unwrap();
        for _ in 0..MAX_VERIFY_ATTEMPTS {
            assert!(store.begin_attempt("c1").await.unwrap());
        }
        assert!(!store.begin_attempt("c1").await.unwrap());
        assert!(!store.begin_attempt("missing").await.unwrap());

        let strategy = challenge("c1").strategy;
        let stored = store
            .get_latest_challenge(&strategy, "u1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.attempts, MAX_VERIFY_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_expired_challenge_cannot_be_solved() {
        let store = InMemoryStore::new();
        let mut c = challenge("c1");
        c.expires_at = Utc::now() + Duration::milliseconds(50);
        store.add_challenge(&c).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let ctx = SolveContext::default();
        assert!(!store.begin_attempt("c1").await.unwrap());
        assert!(!store.mark_challenge_as_solved("c1", &ctx).await.unwrap());
    }

    #[tokio::test]
    async fn test_add_user_rejects_duplicates() {
        let store = InMemoryStore::new();
        let new_user = NewUser {
            email: "jane@example.com".to_string(),
            ..Default::default()
        };
        let user = store.add_user(new_user.clone()).await.unwrap();
        assert!(!user.id.is_empty());
        assert!(matches!(
            store.add_user(new_user).await,
            Err(StorageError::Duplicate(_))
        ));
        let found = store
            .user_by_secondary_id(Identity::Email, "JANE@example.com")
            .await
            .unwrap();
        assert_eq!(found.map(|u| u.id), Some(user.id));
    }
}
