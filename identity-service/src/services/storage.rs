//! Storage collaborators. Lookups return `Ok(None)` when the record does not
//! exist; `Err` is reserved for backend failures.

use async_trait::async_trait;

use super::context::RequestContext;
use super::error::{ServiceError, StorageError};
use crate::models::{
    AppData, FirstFactorInternalStrategy, Identity, Invite, InviteQuery, NewUser, SolveContext,
    TokenStorageEntity, User, UserAuthChallenge, UserData, UserDataField,
};

#[async_trait]
pub trait AppStorage: Send + Sync {
    async fn app_by_id(&self, id: &str) -> Result<Option<AppData>, StorageError>;
}

#[async_trait]
pub trait UserStorage: Send + Sync {
    async fn user_by_id(&self, id: &str) -> Result<Option<User>, StorageError>;

    async fn user_by_secondary_id(
        &self,
        identity: Identity,
        value: &str,
    ) -> Result<Option<User>, StorageError>;

    /// Only `fields` are populated in the result.
    async fn user_data(&self, id: &str, fields: &[UserDataField])
        -> Result<UserData, StorageError>;

    /// Persist a new user and assign its id. Fails with
    /// `StorageError::Duplicate` when the email, phone or username is taken.
    async fn add_user(&self, user: NewUser) -> Result<User, StorageError>;

    async fn update_user_data(
        &self,
        id: &str,
        data: &UserData,
        fields: &[UserDataField],
    ) -> Result<(), StorageError>;
}

#[async_trait]
pub trait TokenStorage: Send + Sync {
    /// Insert if absent. Returns `false` when a token with the same id is
    /// already stored.
    async fn save_token(
        &self,
        entity: &TokenStorageEntity,
        ttl_seconds: i64,
    ) -> Result<bool, StorageError>;

    async fn token_by_id(&self, id: &str) -> Result<Option<TokenStorageEntity>, StorageError>;
}

#[async_trait]
pub trait UserAuthStorage: Send + Sync {
    /// Store a challenge. It supersedes any earlier challenge for the same
    /// strategy and user, and expired challenges may be dropped.
    async fn add_challenge(&self, challenge: &UserAuthChallenge) -> Result<(), StorageError>;

    async fn get_latest_challenge(
        &self,
        strategy: &FirstFactorInternalStrategy,
        user_id: &str,
    ) -> Result<Option<UserAuthChallenge>, StorageError>;

    async fn mark_challenge_as_sent(&self, id: &str) -> Result<(), StorageError>;

    /// Atomically consume one verification attempt. Returns `false`, and
    /// consumes nothing, when the challenge is missing, solved, expired or out
    /// of attempts. A code may only be compared after this returns `true`.
    async fn begin_attempt(&self, id: &str) -> Result<bool, StorageError>;

    /// Compare-and-swap on the solved flag. Returns `false` if the challenge
    /// does not exist, is already solved or has expired.
    async fn mark_challenge_as_solved(
        &self,
        id: &str,
        context: &SolveContext,
    ) -> Result<bool, StorageError>;
}

#[async_trait]
pub trait InviteStorage: Send + Sync {
    async fn save(&self, invite: &Invite) -> Result<(), StorageError>;
    async fn get_by_id(&self, id: &str) -> Result<Option<Invite>, StorageError>;
    async fn get_by_token(&self, token: &str) -> Result<Option<Invite>, StorageError>;
    async fn get_all(&self, query: &InviteQuery) -> Result<Vec<Invite>, StorageError>;
    async fn update(&self, invite: &Invite) -> Result<(), StorageError>;

    /// Compare-and-swap on `accepted_at`. Returns `false` if the invite was
    /// already accepted or does not exist.
    async fn mark_accepted(&self, id: &str, user_id: &str) -> Result<bool, StorageError>;
}

/// Load an app that exists and is active.
pub async fn active_app(
    ctx: &RequestContext,
    apps: &dyn AppStorage,
    app_id: &str,
) -> Result<AppData, ServiceError> {
    let app = ctx
        .run(apps.app_by_id(app_id))
        .await?
        .ok_or(ServiceError::AppNotFound)?;
    if !app.active {
        tracing::info!(app_id = %app_id, "Rejected request for inactive app");
        return Err(ServiceError::AppInactive);
    }
    Ok(app)
}
