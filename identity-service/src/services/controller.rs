use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;
use validator::ValidateEmail;

use super::challenge::{ChallengeEngine, ChallengeRequest, ChallengeVerification, IssuedChallenge};
use super::context::RequestContext;
use super::credentials::{hash_password, verify_password, Password};
use super::email::{EmailProvider, EmailTemplate};
use super::error::{InvalidReason, NotificationError, ServiceError, TokenError};
use super::jwt::{Claims, Token, TokenService};
use super::messages::{MessageCatalog, DEFAULT_LOCALE};
use super::sms::SmsProvider;
use super::storage::{
    active_app, AppStorage, InviteStorage, TokenStorage, UserAuthStorage, UserStorage,
};
use super::strategy::select_strategy;
use super::tenant::{
    filter_invitee_could_invite, invitation_claims, invitation_from_claims, is_claim_segment,
    root_authority, tenant_data,
};
use crate::models::{
    merge_memberships, AppData, AuthResponse, ChallengeType, FirstFactorInternalStrategy,
    Identity, Invite, NewUser, TenantMembership, TenantMemberships, TokenStorageEntity,
    TokenType, Transport, User, UserData, UserDataField,
};

pub const SCOPE_OFFLINE: &str = "offline";
pub const SCOPE_OPENID: &str = "openid";

/// Storage collaborators the controller and challenge engine work against.
#[derive(Clone)]
pub struct Stores {
    pub apps: Arc<dyn AppStorage>,
    pub users: Arc<dyn UserStorage>,
    pub tokens: Arc<dyn TokenStorage>,
    pub challenges: Arc<dyn UserAuthStorage>,
    pub invites: Arc<dyn InviteStorage>,
}

#[derive(Clone)]
pub struct Notifiers {
    pub email: Arc<dyn EmailProvider>,
    pub sms: Arc<dyn SmsProvider>,
    pub catalog: Arc<dyn MessageCatalog>,
}

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Base for links when an app has no URL of its own.
    pub public_base_url: String,
    pub management_roles: HashSet<String>,
    /// Subject of invitations created through the management API.
    pub root_inviter_id: String,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            public_base_url: "http://localhost:8080".to_string(),
            management_roles: HashSet::from(["admin".to_string(), "owner".to_string()]),
            root_inviter_id: "root".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewUserRequest {
    pub username: String,
    pub email: String,
    pub phone_number: String,
    pub given_name: String,
    pub locale: String,
    pub password: Password,
}

#[derive(Debug, Clone, Default)]
pub struct InvitationRequest {
    pub tenant: String,
    pub tenant_name: String,
    pub group: String,
    pub roles: Vec<String>,
    pub email: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResetEmailData {
    pub user_id: String,
    pub recipient: String,
    pub reset_url: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

pub struct UserController {
    tokens: TokenService,
    stores: Stores,
    email: Arc<dyn EmailProvider>,
    engine: ChallengeEngine,
    settings: ControllerSettings,
}

/// Seconds until `exp`, never less than one so storage TTLs stay valid.
/// Signed marker on invite tokens minted by the management API.
const ROOT_INVITE_CLAIM: &str = "root_invite";

/// Whose authority backs an invitation.
#[derive(Debug, Clone, Copy)]
enum Inviter<'a> {
    Root,
    Member(&'a str),
}

fn remaining_ttl(exp: i64) -> i64 {
    (exp - Utc::now().timestamp()).max(1)
}

fn timestamp(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(seconds, 0).single().unwrap_or_else(Utc::now)
}

fn has_scope(scopes: &[String], scope: &str) -> bool {
    scopes.iter().any(|s| s == scope)
}

fn link_with_token(base: &str, token: &str) -> Result<String, ServiceError> {
    reqwest::Url::parse_with_params(base, &[("token", token)])
        .map(|url| url.to_string())
        .map_err(|e| {
            NotificationError::Template(format!("invalid link base {}: {}", base, e)).into()
        })
}

impl UserController {
    pub fn new(
        tokens: TokenService,
        stores: Stores,
        notifiers: Notifiers,
        settings: ControllerSettings,
    ) -> Self {
        let engine = ChallengeEngine::new(
            stores.apps.clone(),
            stores.users.clone(),
            stores.challenges.clone(),
            notifiers.email.clone(),
            notifiers.sms,
            notifiers.catalog,
            settings.public_base_url.clone(),
        );
        Self {
            tokens,
            stores,
            email: notifiers.email,
            engine,
            settings,
        }
    }

    pub fn token_service(&self) -> &TokenService {
        &self.tokens
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    async fn memberships(
        &self,
        ctx: &RequestContext,
        user_id: &str,
    ) -> Result<TenantMemberships, ServiceError> {
        let data = ctx
            .run(
                self.stores
                    .users
                    .user_data(user_id, &[UserDataField::TenantMembership]),
            )
            .await?;
        Ok(data.tenant_membership.unwrap_or_default())
    }

    async fn hash(password: Password) -> Result<String, ServiceError> {
        let hashed = tokio::task::spawn_blocking(move || hash_password(&password))
            .await
            .map_err(|e| anyhow::anyhow!("password hashing task failed: {}", e))??;
        Ok(hashed)
    }

    #[tracing::instrument(skip_all, fields(app_id = %app_id))]
    pub async fn login_with_password(
        &self,
        ctx: &RequestContext,
        app_id: &str,
        identity: Identity,
        value: &str,
        password: Password,
        scopes: &[String],
    ) -> Result<AuthResponse, ServiceError> {
        let app = active_app(ctx, self.stores.apps.as_ref(), app_id).await?;
        select_strategy(
            &app,
            &FirstFactorInternalStrategy::new(identity, ChallengeType::Password, Transport::None),
        )?;

        let user = ctx
            .run(self.stores.users.user_by_secondary_id(identity, value))
            .await?
            .filter(|u| u.active)
            .ok_or(ServiceError::UserNotFound)?;

        let data = ctx
            .run(
                self.stores
                    .users
                    .user_data(&user.id, &[UserDataField::PasswordHash]),
            )
            .await?;
        let stored = data.password_hash.unwrap_or_default();
        let matches = tokio::task::spawn_blocking(move || verify_password(&password, &stored))
            .await
            .map_err(|e| anyhow::anyhow!("password verification task failed: {}", e))?;
        if !matches {
            return Err(ServiceError::InvalidCredentials);
        }

        tracing::info!(user_id = %user.id, "Password login succeeded");
        self.issue_tokens(ctx, &user, &app, scopes).await
    }

    #[tracing::instrument(skip_all, fields(app_id = %app_id))]
    pub async fn register_with_password(
        &self,
        ctx: &RequestContext,
        app_id: &str,
        request: NewUserRequest,
        scopes: &[String],
    ) -> Result<AuthResponse, ServiceError> {
        let app = active_app(ctx, self.stores.apps.as_ref(), app_id).await?;
        if app.registration_forbidden {
            return Err(ServiceError::RegistrationForbidden);
        }
        if !app
            .first_factor_strategies()
            .any(|s| s.challenge == ChallengeType::Password)
        {
            return Err(ServiceError::StrategyUnsupportedByApp);
        }
        if request.email.is_empty()
            && request.username.is_empty()
            && request.phone_number.is_empty()
        {
            return Err(ServiceError::Validation(
                "email, username or phone number is required".to_string(),
            ));
        }
        if !request.email.is_empty() && !request.email.validate_email() {
            return Err(ServiceError::Validation("invalid email".to_string()));
        }
        let password = request.password;
        if !password.is_acceptable() {
            return Err(ServiceError::Validation(
                "password must be at least 8 characters".to_string(),
            ));
        }

        let password_hash = Self::hash(password).await?;
        let user = ctx
            .run(self.stores.users.add_user(NewUser {
                username: request.username,
                email: request.email,
                phone_number: request.phone_number,
                given_name: request.given_name,
                locale: request.locale,
                scopes: Vec::new(),
            }))
            .await?;

        let data = UserData {
            password_hash: Some(password_hash),
            ..Default::default()
        };
        ctx.run(
            self.stores
                .users
                .update_user_data(&user.id, &data, &[UserDataField::PasswordHash]),
        )
        .await?;

        tracing::info!(user_id = %user.id, "Registered user with password");
        self.issue_tokens(ctx, &user, &app, scopes).await
    }

    pub async fn request_challenge(
        &self,
        ctx: &RequestContext,
        request: ChallengeRequest,
    ) -> Result<IssuedChallenge, ServiceError> {
        self.engine.request_challenge(ctx, request).await
    }

    /// Solve a challenge, registering the user if needed, and issue tokens.
    pub async fn login_with_challenge(
        &self,
        ctx: &RequestContext,
        verification: ChallengeVerification,
        scopes: &[String],
    ) -> Result<AuthResponse, ServiceError> {
        let (user, app) = self
            .engine
            .login_or_register_user_with_challenge(ctx, verification)
            .await?;
        self.issue_tokens(ctx, &user, &app, scopes).await
    }

    /// Access token always; refresh token for offline apps when `offline` is
    /// requested; ID token when `openid` is requested.
    pub async fn issue_tokens(
        &self,
        ctx: &RequestContext,
        user: &User,
        app: &AppData,
        scopes: &[String],
    ) -> Result<AuthResponse, ServiceError> {
        let memberships = self.memberships(ctx, &user.id).await?;
        let lifetimes = &app.token_lifetimes;

        let access = self
            .tokens
            .new_token(TokenType::Access, user, &app.id, scopes, tenant_data(&memberships))
            .with_lifetime(lifetimes.for_type(TokenType::Access));
        let access_token = self.tokens.sign_token(&access)?;

        let refresh_token = if app.offline && has_scope(scopes, SCOPE_OFFLINE) {
            let refresh = self
                .tokens
                .new_token(TokenType::Refresh, user, &app.id, scopes, Map::new())
                .with_lifetime(lifetimes.for_type(TokenType::Refresh));
            Some(self.tokens.sign_token(&refresh)?)
        } else {
            None
        };

        let id_token = if has_scope(scopes, SCOPE_OPENID) {
            let id = self
                .tokens
                .new_token(TokenType::Id, user, &app.id, scopes, Map::new())
                .with_lifetime(lifetimes.for_type(TokenType::Id));
            Some(self.tokens.sign_token(&id)?)
        } else {
            None
        };

        Ok(AuthResponse {
            access_token,
            refresh_token,
            id_token,
            token_type: "Bearer".to_string(),
            expires_in: access.lifetime_seconds(),
        })
    }

    /// Validate an access token for `app_id` and reject it if it has been
    /// retired by a refresh.
    pub async fn authenticate_access_token(
        &self,
        ctx: &RequestContext,
        raw: &str,
        app_id: &str,
    ) -> Result<Claims, ServiceError> {
        let token = self
            .tokens
            .parse_and_validate(raw, app_id, TokenType::Access)?;
        if let Some(jti) = token.id() {
            if ctx.run(self.stores.tokens.token_by_id(jti)).await?.is_some() {
                return Err(ServiceError::TokenBlocked);
            }
        }
        Ok(token.claims)
    }

    async fn retire_access_token(
        &self,
        ctx: &RequestContext,
        raw: &str,
        app_id: &str,
        subject: &str,
    ) -> Result<(), ServiceError> {
        // Expired tokens are still retired; forged or foreign ones are not.
        let access = match self
            .tokens
            .parse_and_validate_allow_expired(raw, app_id, TokenType::Access)
        {
            Ok(access) => access,
            Err(e) => {
                tracing::info!(error = %e, "Ignoring invalid access token during refresh");
                return Ok(());
            }
        };
        let claims = &access.claims;
        if claims.sub != subject {
            tracing::info!(user_id = %subject, "Ignoring foreign access token during refresh");
            return Ok(());
        }
        let Some(jti) = access.id() else {
            return Ok(());
        };

        let entity = TokenStorageEntity::new(jti, TokenType::Access, subject)
            .with_comment("retired by refresh");
        ctx.run(self.stores.tokens.save_token(&entity, remaining_ttl(claims.exp)))
            .await?;
        Ok(())
    }

    /// Rotate a refresh token. Both used tokens are recorded before the new
    /// set is minted, so a failure after this point leaves the old refresh
    /// token unusable.
    #[tracing::instrument(skip_all, fields(app_id = %app_id))]
    pub async fn refresh_jwt_token(
        &self,
        ctx: &RequestContext,
        refresh_raw: &str,
        access_raw: Option<&str>,
        app_id: &str,
        scopes: &[String],
    ) -> Result<AuthResponse, ServiceError> {
        let app = active_app(ctx, self.stores.apps.as_ref(), app_id).await?;
        let refresh = self
            .tokens
            .parse_and_validate(refresh_raw, &app.id, TokenType::Refresh)?;

        let subject = refresh.subject();
        if subject.is_empty() {
            return Err(ServiceError::InvalidSubject);
        }
        let user = ctx
            .run(self.stores.users.user_by_id(subject))
            .await?
            .filter(|u| u.active)
            .ok_or(ServiceError::UserNotFound)?;

        let jti = refresh
            .id()
            .ok_or(ServiceError::TokenInvalid(TokenError::Invalid(
                InvalidReason::Malformed,
            )))?;
        if ctx.run(self.stores.tokens.token_by_id(jti)).await?.is_some() {
            tracing::warn!(user_id = %user.id, jti = %jti, "Refresh token reuse detected");
            return Err(ServiceError::TokenBlocked);
        }

        if let Some(access_raw) = access_raw.filter(|raw| !raw.is_empty()) {
            self.retire_access_token(ctx, access_raw, &app.id, &user.id)
                .await?;
        }

        let entity = TokenStorageEntity::new(jti, TokenType::Refresh, user.id.as_str())
            .with_comment("rotated");
        let recorded = ctx
            .run(
                self.stores
                    .tokens
                    .save_token(&entity, remaining_ttl(refresh.claims.exp)),
            )
            .await?;
        if !recorded {
            tracing::warn!(
                user_id = %user.id,
                jti = %jti,
                "Concurrent refresh lost the rotation race"
            );
            return Err(ServiceError::TokenBlocked);
        }

        let mut scopes = scopes.to_vec();
        if !has_scope(&scopes, SCOPE_OFFLINE) {
            scopes.push(SCOPE_OFFLINE.to_string());
        }

        tracing::info!(user_id = %user.id, "Refresh token rotated");
        self.issue_tokens(ctx, &user, &app, &scopes).await
    }

    /// Mint a reset token for the user and email a reset link.
    #[tracing::instrument(skip_all, fields(user_id = %user_id, app_id = %app_id))]
    pub async fn send_password_reset_email(
        &self,
        ctx: &RequestContext,
        user_id: &str,
        app_id: &str,
    ) -> Result<ResetEmailData, ServiceError> {
        let app = active_app(ctx, self.stores.apps.as_ref(), app_id).await?;
        let user = ctx
            .run(self.stores.users.user_by_id(user_id))
            .await?
            .ok_or(ServiceError::UserNotFound)?;
        if user.email.is_empty() {
            return Err(ServiceError::Validation("user has no email address".to_string()));
        }

        let reset = self
            .tokens
            .new_token(TokenType::Reset, &user, &app.id, &[], Map::new())
            .with_lifetime(app.token_lifetimes.for_type(TokenType::Reset));
        let token = self.tokens.sign_token(&reset)?;

        let base = app
            .reset_password_url
            .clone()
            .filter(|url| !url.is_empty())
            .unwrap_or_else(|| {
                format!(
                    "{}/reset-password",
                    self.settings.public_base_url.trim_end_matches('/')
                )
            });
        let reset_url = link_with_token(&base, &token)?;

        let locale = [user.locale.as_str(), app.default_locale.as_deref().unwrap_or("")]
            .into_iter()
            .find(|l| !l.is_empty())
            .unwrap_or(DEFAULT_LOCALE);
        let mut data = Map::new();
        data.insert("name".into(), Value::String(user.display_name().to_string()));
        data.insert("link".into(), Value::String(reset_url.clone()));
        data.insert("app".into(), Value::String(app.id.clone()));
        data.insert("locale".into(), Value::String(locale.to_string()));

        ctx.run(self.email.send_user_email(
            EmailTemplate::ResetPassword,
            app.email_template_subfolder(),
            &user.email,
            &data,
        ))
        .await?;

        tracing::info!(user_id = %user.id, "Password reset email sent");
        Ok(ResetEmailData {
            user_id: user.id,
            recipient: user.email,
            reset_url,
            token,
            expires_at: timestamp(reset.claims.exp),
        })
    }

    /// Succeeds whether or not the email belongs to an account.
    pub async fn request_password_reset(
        &self,
        ctx: &RequestContext,
        app_id: &str,
        email: &str,
    ) -> Result<(), ServiceError> {
        active_app(ctx, self.stores.apps.as_ref(), app_id).await?;
        let user = ctx
            .run(self.stores.users.user_by_secondary_id(Identity::Email, email))
            .await?;
        match user.filter(|u| u.active) {
            Some(user) => {
                self.send_password_reset_email(ctx, &user.id, app_id)
                    .await?;
            }
            None => tracing::info!(app_id = %app_id, "Password reset requested for unknown email"),
        }
        Ok(())
    }

    /// Redeem a reset token. Each token works once.
    #[tracing::instrument(skip_all, fields(app_id = %app_id))]
    pub async fn reset_password(
        &self,
        ctx: &RequestContext,
        app_id: &str,
        reset_raw: &str,
        new_password: Password,
    ) -> Result<(), ServiceError> {
        let app = active_app(ctx, self.stores.apps.as_ref(), app_id).await?;
        let reset = self
            .tokens
            .parse_and_validate(reset_raw, &app.id, TokenType::Reset)?;
        if reset.subject().is_empty() {
            return Err(ServiceError::InvalidSubject);
        }
        if !new_password.is_acceptable() {
            return Err(ServiceError::Validation(
                "password must be at least 8 characters".to_string(),
            ));
        }
        let user = ctx
            .run(self.stores.users.user_by_id(reset.subject()))
            .await?
            .ok_or(ServiceError::UserNotFound)?;

        let token_id = hex::encode(Sha256::digest(reset_raw.as_bytes()));
        let entity = TokenStorageEntity::new(token_id, TokenType::Reset, user.id.as_str())
            .with_comment("redeemed");
        let recorded = ctx
            .run(
                self.stores
                    .tokens
                    .save_token(&entity, remaining_ttl(reset.claims.exp)),
            )
            .await?;
        if !recorded {
            return Err(ServiceError::TokenBlocked);
        }

        let data = UserData {
            password_hash: Some(Self::hash(new_password).await?),
            ..Default::default()
        };
        ctx.run(
            self.stores
                .users
                .update_user_data(&user.id, &data, &[UserDataField::PasswordHash]),
        )
        .await?;

        tracing::info!(user_id = %user.id, "Password reset");
        Ok(())
    }

    /// Authority of an inviter over tenants: the live membership for users,
    /// everything requested for the service itself.
    async fn inviter_authority(
        &self,
        ctx: &RequestContext,
        inviter: Inviter<'_>,
        requested: &TenantMemberships,
    ) -> Result<TenantMemberships, ServiceError> {
        match inviter {
            Inviter::Root => Ok(root_authority(requested, &self.settings.management_roles)),
            Inviter::Member(user_id) => self.memberships(ctx, user_id).await,
        }
    }

    /// Mint an invite token for what the inviter may grant and persist the
    /// invitation. `inviter` is `None` for management-initiated invitations.
    #[tracing::instrument(skip_all, fields(app_id = %app.id))]
    pub async fn create_invitation(
        &self,
        ctx: &RequestContext,
        app: &AppData,
        inviter: Option<&User>,
        request: InvitationRequest,
    ) -> Result<Invite, ServiceError> {
        if !request.email.is_empty() && !request.email.validate_email() {
            return Err(ServiceError::Validation("invalid email".to_string()));
        }
        if !is_claim_segment(&request.tenant) || !is_claim_segment(&request.group) {
            return Err(ServiceError::Validation(
                "tenant and group must be non-empty and must not contain ':'".to_string(),
            ));
        }

        let mut requested = TenantMemberships::new();
        requested.insert(
            request.tenant.clone(),
            TenantMembership::new(request.tenant.clone(), request.tenant_name.clone())
                .with_group(request.group.clone(), request.roles.iter().cloned()),
        );

        let root = User {
            id: self.settings.root_inviter_id.clone(),
            username: self.settings.root_inviter_id.clone(),
            ..Default::default()
        };
        let (inviter, authority_of) = match inviter {
            Some(user) => (user, Inviter::Member(&user.id)),
            None => (&root, Inviter::Root),
        };

        let authority = self.inviter_authority(ctx, authority_of, &requested).await?;
        let granted =
            filter_invitee_could_invite(&authority, &requested, &self.settings.management_roles);
        let Some(membership) = granted.get(&request.tenant) else {
            tracing::info!(
                inviter_id = %inviter.id,
                tenant = %request.tenant,
                "Inviter cannot grant requested membership"
            );
            return Err(ServiceError::InvalidInviteTokenBadInvitee);
        };
        let roles = membership.roles_in(&request.group).join(",");
        let tenant_name = membership.tenant_name.clone();

        let mut claims = invitation_claims(&granted);
        if !request.email.is_empty() {
            claims.insert("email".into(), Value::String(request.email.clone()));
        }
        if matches!(authority_of, Inviter::Root) {
            claims.insert(ROOT_INVITE_CLAIM.into(), Value::Bool(true));
        }
        let invite_token = self
            .tokens
            .new_token(TokenType::Invite, inviter, &app.id, &[], claims)
            .with_lifetime(app.token_lifetimes.for_type(TokenType::Invite));
        let token = self.tokens.sign_token(&invite_token)?;

        let invite = Invite {
            id: Uuid::new_v4().to_string(),
            app_id: app.id.clone(),
            inviter_id: inviter.id.clone(),
            inviter_name: inviter.display_name().to_string(),
            token,
            email: request.email,
            role: roles,
            tenant: request.tenant,
            tenant_name,
            group: request.group,
            created_by: inviter.id.clone(),
            created_at: timestamp(invite_token.claims.iat),
            expires_at: timestamp(invite_token.claims.exp),
            accepted_at: None,
            accepted_by: None,
        };
        ctx.run(self.stores.invites.save(&invite)).await?;

        tracing::info!(
            invite_id = %invite.id,
            inviter_id = %invite.inviter_id,
            "Invitation created"
        );
        Ok(invite)
    }

    /// Resolve the app and inviter, create the invitation and optionally
    /// email it. `inviter_id` is `None` for the management API.
    pub async fn invite(
        &self,
        ctx: &RequestContext,
        app_id: &str,
        inviter_id: Option<&str>,
        request: InvitationRequest,
        send_email: bool,
    ) -> Result<Invite, ServiceError> {
        let app = active_app(ctx, self.stores.apps.as_ref(), app_id).await?;
        let inviter = match inviter_id {
            Some(id) => Some(
                ctx.run(self.stores.users.user_by_id(id))
                    .await?
                    .filter(|u| u.active)
                    .ok_or(ServiceError::UserNotFound)?,
            ),
            None => None,
        };

        let invite = self
            .create_invitation(ctx, &app, inviter.as_ref(), request)
            .await?;
        if send_email && !invite.email.is_empty() {
            self.send_invitation_email(ctx, &app, &invite).await?;
        }
        Ok(invite)
    }

    pub async fn send_invitation_email(
        &self,
        ctx: &RequestContext,
        app: &AppData,
        invite: &Invite,
    ) -> Result<(), ServiceError> {
        if invite.email.is_empty() {
            return Err(ServiceError::Validation("invitation has no email".to_string()));
        }
        let base = app
            .invite_url
            .clone()
            .filter(|url| !url.is_empty())
            .unwrap_or_else(|| {
                format!("{}/invite", self.settings.public_base_url.trim_end_matches('/'))
            });
        let link = link_with_token(&base, &invite.token)?;
        let tenant = if invite.tenant_name.is_empty() {
            &invite.tenant
        } else {
            &invite.tenant_name
        };

        let mut data = Map::new();
        data.insert("name".into(), Value::String(invite.email.clone()));
        data.insert("inviter".into(), Value::String(invite.inviter_name.clone()));
        data.insert("tenant".into(), Value::String(tenant.clone()));
        data.insert("link".into(), Value::String(link));
        data.insert("app".into(), Value::String(app.id.clone()));
        data.insert(
            "locale".into(),
            Value::String(app.default_locale.clone().unwrap_or_else(|| DEFAULT_LOCALE.to_string())),
        );

        ctx.run(self.email.send_user_email(
            EmailTemplate::Invite,
            app.email_template_subfolder(),
            &invite.email,
            &data,
        ))
        .await?;
        tracing::info!(invite_id = %invite.id, "Invitation email sent");
        Ok(())
    }

    /// Redeem an invite token for `user_id`. The grant is recomputed against
    /// the inviter's current membership and the invitation is consumed before
    /// the user's membership changes.
    #[tracing::instrument(skip_all, fields(app_id = %app_id, user_id = %user_id))]
    pub async fn add_user_to_tenant_with_invitation_token(
        &self,
        ctx: &RequestContext,
        app_id: &str,
        user_id: &str,
        invite_raw: &str,
    ) -> Result<TenantMemberships, ServiceError> {
        let app = active_app(ctx, self.stores.apps.as_ref(), app_id).await?;
        let token: Token = self
            .tokens
            .parse_and_validate(invite_raw, &app.id, TokenType::Invite)?;
        if token.subject().is_empty() {
            return Err(ServiceError::InvalidSubject);
        }

        let invite = ctx
            .run(self.stores.invites.get_by_token(invite_raw))
            .await?
            .ok_or(ServiceError::InviteNotFound)?;
        if invite.is_accepted() {
            return Err(ServiceError::InvitationUsed);
        }

        let user = ctx
            .run(self.stores.users.user_by_id(user_id))
            .await?
            .ok_or(ServiceError::UserNotFound)?;
        if !invite.email.is_empty() && !invite.email.eq_ignore_ascii_case(&user.email) {
            tracing::info!(invite_id = %invite.id, "Invitation presented by a different user");
            return Err(ServiceError::InvalidInviteTokenBadInvitee);
        }

        let requested = invitation_from_claims(&token.claims.payload);
        let authority_of = match token.claims.payload.get(ROOT_INVITE_CLAIM) {
            Some(Value::Bool(true)) => Inviter::Root,
            _ => Inviter::Member(token.subject()),
        };
        let authority = self
            .inviter_authority(ctx, authority_of, &requested)
            .await?;
        let mut granted =
            filter_invitee_could_invite(&authority, &requested, &self.settings.management_roles);
        if granted.is_empty() {
            return Err(ServiceError::InvalidInviteTokenBadInvitee);
        }
        // Invite claims carry ids only.
        if let Some(membership) = granted.get_mut(&invite.tenant) {
            if membership.tenant_name.is_empty() {
                membership.tenant_name = invite.tenant_name.clone();
            }
        }

        let accepted = ctx
            .run(self.stores.invites.mark_accepted(&invite.id, &user.id))
            .await?;
        if !accepted {
            return Err(ServiceError::InvitationUsed);
        }

        let mut memberships = self.memberships(ctx, &user.id).await?;
        merge_memberships(&mut memberships, &granted);
        let data = UserData {
            tenant_membership: Some(memberships.clone()),
            ..Default::default()
        };
        ctx.run(
            self.stores
                .users
                .update_user_data(&user.id, &data, &[UserDataField::TenantMembership]),
        )
        .await?;

        tracing::info!(invite_id = %invite.id, user_id = %user.id, "Invitation accepted");
        Ok(memberships)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remaining_ttl_is_positive() {
        assert_eq!(remaining_ttl(Utc::now().timestamp() - 100), 1);
        assert!(remaining_ttl(Utc::now().timestamp() + 100) > 90);
    }

    #[test]
    fn test_link_with_token_escapes() {
        let link = link_with_token("https://app.example.com/reset?lang=en", "a.b+c").unwrap();
        assert_eq!(link, "https://app.example.com/reset?lang=en&token=a.b%2Bc");
        assert!(link_with_token("not a url", "x").is_err());
    }

    #[test]
    fn test_has_scope() {
        let scopes = vec!["openid".to_string(), "email".to_string()];
        assert!(has_scope(&scopes, SCOPE_OPENID));
        assert!(!has_scope(&scopes, SCOPE_OFFLINE));
    }
}
