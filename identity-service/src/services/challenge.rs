//! OTP and magic-link challenges: issue, dispatch, verify.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use rand::{distributions::Alphanumeric, rngs::OsRng, Rng};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use super::context::RequestContext;
use super::email::{EmailProvider, EmailTemplate};
use super::error::{NotificationError, ServiceError};
use super::messages::{self, MessageCatalog, DEFAULT_LOCALE};
use super::sms::SmsProvider;
use super::storage::{active_app, AppStorage, UserAuthStorage, UserStorage};
use super::strategy::{expire_challenge_duration, select_strategy};
use crate::models::{
    AppData, ChallengeType, FirstFactorInternalStrategy, Identity, NewUser, PendingUser,
    ResolvedUser, SolveContext, Transport, User, UserAuthChallenge, UserDataField,
};

pub const OTP_LENGTH: usize = 6;
pub const MAGIC_LINK_CODE_LENGTH: usize = 32;

/// Numeric one-time code from the operating system CSPRNG.
pub fn generate_otp() -> String {
    let mut rng = OsRng;
    (0..OTP_LENGTH)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect()
}

/// Alphanumeric magic-link code from the operating system CSPRNG.
pub fn generate_magic_link_code() -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(MAGIC_LINK_CODE_LENGTH)
        .map(char::from)
        .collect()
}

/// S256 transform binding a challenge to the client that requested it.
pub fn code_challenge_for(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Where a code is delivered: the user's stored contact for the transport,
/// or the identity value itself when it is of the transport's kind.
fn delivery_address<'a>(
    strategy: &FirstFactorInternalStrategy,
    user: &'a ResolvedUser,
    identity_value: &'a str,
) -> Result<Option<&'a str>, ServiceError> {
    let (native, stored, kind) = match strategy.transport {
        Transport::Sms => (Identity::Phone, user.phone_number(), "phone number"),
        Transport::Email => (Identity::Email, user.email(), "email address"),
        Transport::None => return Ok(None),
    };
    if !stored.is_empty() {
        Ok(Some(stored))
    } else if strategy.identity == native {
        Ok(Some(identity_value))
    } else {
        Err(ServiceError::Validation(format!("no {} to deliver the code to", kind)))
    }
}

#[derive(Debug, Clone)]
pub struct ChallengeRequest {
    pub app_id: String,
    pub strategy: FirstFactorInternalStrategy,
    pub identity_value: String,
    pub locale: String,
    pub device_id: String,
    pub user_agent: String,
    /// Optional S256 code challenge; verification must present the verifier.
    pub user_code_challenge: String,
}

#[derive(Debug, Clone)]
pub struct ChallengeVerification {
    pub app_id: String,
    pub strategy: FirstFactorInternalStrategy,
    pub identity_value: String,
    pub code: String,
    pub locale: String,
    pub device_id: String,
    pub user_agent: String,
    pub user_code_verifier: String,
}

#[derive(Debug, Clone)]
pub struct IssuedChallenge {
    pub challenge_id: String,
    pub strategy: FirstFactorInternalStrategy,
    pub expires_at: chrono::DateTime<Utc>,
    pub expires_mins: i64,
}

pub struct ChallengeEngine {
    apps: Arc<dyn AppStorage>,
    users: Arc<dyn UserStorage>,
    challenges: Arc<dyn UserAuthStorage>,
    email: Arc<dyn EmailProvider>,
    sms: Arc<dyn SmsProvider>,
    catalog: Arc<dyn MessageCatalog>,
    public_base_url: String,
}

impl ChallengeEngine {
    pub fn new(
        apps: Arc<dyn AppStorage>,
        users: Arc<dyn UserStorage>,
        challenges: Arc<dyn UserAuthStorage>,
        email: Arc<dyn EmailProvider>,
        sms: Arc<dyn SmsProvider>,
        catalog: Arc<dyn MessageCatalog>,
        public_base_url: impl Into<String>,
    ) -> Self {
        Self {
            apps,
            users,
            challenges,
            email,
            sms,
            catalog,
            public_base_url: public_base_url.into(),
        }
    }

    /// App, strategy and user resolution shared by request and verify.
    async fn resolve(
        &self,
        ctx: &RequestContext,
        app_id: &str,
        requested: &FirstFactorInternalStrategy,
        identity_value: &str,
        locale: &str,
    ) -> Result<(AppData, FirstFactorInternalStrategy, ResolvedUser), ServiceError> {
        let app = active_app(ctx, self.apps.as_ref(), app_id).await?;
        let strategy = select_strategy(&app, requested)?;
        if strategy.challenge == ChallengeType::Password {
            return Err(ServiceError::Validation(
                "password strategies are not challenge based".to_string(),
            ));
        }
        if identity_value.trim().is_empty() {
            return Err(ServiceError::Validation("identity value is required".to_string()));
        }

        let found = ctx
            .run(
                self.users
                    .user_by_secondary_id(strategy.identity, identity_value),
            )
            .await?;

        let user = match found {
            Some(user) if user.active => ResolvedUser::Persisted(user),
            Some(user) => {
                tracing::info!(user_id = %user.id, "Challenge for inactive user");
                return Err(ServiceError::UserNotFound);
            }
            None if strategy.identity != Identity::Id
                && app.passwordless_registration_allowed
                && !app.registration_forbidden =>
            {
                ResolvedUser::Pending(PendingUser::from_identity(
                    strategy.identity,
                    identity_value,
                    locale,
                ))
            }
            None => return Err(ServiceError::UserNotFound),
        };

        Ok((app, strategy, user))
    }

    #[tracing::instrument(skip_all, fields(app_id = %request.app_id))]
    pub async fn request_challenge(
        &self,
        ctx: &RequestContext,
        request: ChallengeRequest,
    ) -> Result<IssuedChallenge, ServiceError> {
        let (app, strategy, user) = self
            .resolve(
                ctx,
                &request.app_id,
                &request.strategy,
                &request.identity_value,
                &request.locale,
            )
            .await?;

        let recipient = delivery_address(&strategy, &user, &request.identity_value)?;

        let code = match strategy.challenge {
            ChallengeType::MagicLink => generate_magic_link_code(),
            _ => generate_otp(),
        };
        let ttl = expire_challenge_duration(&strategy);
        let now = Utc::now();
        let challenge = UserAuthChallenge {
            id: Uuid::new_v4().to_string(),
            user_id: user.challenge_key(strategy.identity, &request.identity_value),
            device_id: request.device_id,
            user_agent: request.user_agent,
            app_id: app.id.clone(),
            strategy,
            otp: code,
            user_code_challenge: request.user_code_challenge,
            solved: false,
            attempts: 0,
            created_at: now,
            sent_at: None,
            expires_at: now + ttl,
            expires_mins: ttl.num_minutes(),
            solved_at: None,
            solved_device_id: String::new(),
            solved_user_agent: String::new(),
        };

        ctx.run(self.challenges.add_challenge(&challenge)).await?;
        if let Some(recipient) = recipient {
            self.dispatch(ctx, &app, &user, recipient, &request.identity_value, &challenge)
                .await?;
        }
        ctx.run(self.challenges.mark_challenge_as_sent(&challenge.id))
            .await?;

        tracing::info!(
            challenge_id = %challenge.id,
            pending_user = user.is_pending(),
            strategy = %strategy.key(),
            "Challenge issued"
        );

        Ok(IssuedChallenge {
            challenge_id: challenge.id,
            strategy,
            expires_at: challenge.expires_at,
            expires_mins: challenge.expires_mins,
        })
    }

    fn locales<'a>(&self, app: &'a AppData, user: &'a ResolvedUser) -> Vec<&'a str> {
        [user.locale(), app.default_locale.as_deref().unwrap_or("")]
            .into_iter()
            .filter(|l| !l.is_empty())
            .collect()
    }

    /// App custom SMS text wins over the built-in catalog.
    fn sms_text(&self, app: &AppData, locales: &[&str], args: &[(&str, &str)]) -> String {
        let custom = app.custom_sms_messages.as_ref().and_then(|custom| {
            locales
                .iter()
                .copied()
                .chain(std::iter::once(DEFAULT_LOCALE))
                .find_map(|locale| custom.get(locale)?.get(messages::SMS_OTP))
        });
        match custom {
            Some(template) => messages::render(template, args),
            None => self.catalog.sl(locales, messages::SMS_OTP, args),
        }
    }

    fn magic_link(
        &self,
        app: &AppData,
        identity_value: &str,
        code: &str,
    ) -> Result<String, ServiceError> {
        let base = app
            .login_app_settings
            .as_ref()
            .map(|s| s.login_url.clone())
            .filter(|url| !url.is_empty())
            .unwrap_or_else(|| format!("{}/login", self.public_base_url.trim_end_matches('/')));
        let url = reqwest::Url::parse_with_params(
            &base,
            &[("code", code), ("identity", identity_value), ("app", &app.id)],
        )
        .map_err(|e| NotificationError::Template(format!("invalid login url {}: {}", base, e)))?;
        Ok(url.to_string())
    }

    async fn dispatch(
        &self,
        ctx: &RequestContext,
        app: &AppData,
        user: &ResolvedUser,
        recipient: &str,
        identity_value: &str,
        challenge: &UserAuthChallenge,
    ) -> Result<(), ServiceError> {
        let locales = self.locales(app, user);
        let minutes = challenge.expires_mins.to_string();

        match challenge.strategy.transport {
            Transport::Sms => {
                let text = self.sms_text(
                    app,
                    &locales,
                    &[
                        ("code", challenge.otp.as_str()),
                        ("app", app.id.as_str()),
                        ("minutes", minutes.as_str()),
                    ],
                );
                ctx.run(self.sms.send_sms(recipient, &text)).await
            }
            Transport::Email => {
                let mut data = Map::new();
                data.insert("app".into(), Value::String(app.id.clone()));
                data.insert("name".into(), Value::String(user.display_name().to_string()));
                data.insert("minutes".into(), Value::String(minutes));
                data.insert(
                    "locale".into(),
                    Value::String(locales.first().copied().unwrap_or(DEFAULT_LOCALE).to_string()),
                );
                let template = match challenge.strategy.challenge {
                    ChallengeType::MagicLink => {
                        let link = self.magic_link(app, identity_value, &challenge.otp)?;
                        data.insert("link".into(), Value::String(link));
                        EmailTemplate::MagicLink
                    }
                    _ => {
                        data.insert("code".into(), Value::String(challenge.otp.clone()));
                        EmailTemplate::LoginCode
                    }
                };
                ctx.run(self.email.send_user_email(
                    template,
                    app.email_template_subfolder(),
                    recipient,
                    &data,
                ))
                .await
            }
            Transport::None => Ok(()),
        }
    }

    /// Debug codes only apply to persisted users of apps that allow them.
    async fn debug_code_matches(
        &self,
        ctx: &RequestContext,
        app: &AppData,
        user: &ResolvedUser,
        code: &str,
    ) -> Result<bool, ServiceError> {
        let ResolvedUser::Persisted(persisted) = user else {
            return Ok(false);
        };
        if !app.debug_otp_code_allowed {
            return Ok(false);
        }
        let data = ctx
            .run(
                self.users
                    .user_data(&persisted.id, &[UserDataField::DebugOtpCode]),
            )
            .await?;
        Ok(data
            .debug_otp_code
            .as_deref()
            .filter(|debug| !debug.is_empty())
            .is_some_and(|debug| constant_time_eq(debug, code)))
    }

    #[tracing::instrument(skip_all, fields(app_id = %verification.app_id))]
    pub async fn verify_challenge(
        &self,
        ctx: &RequestContext,
        verification: ChallengeVerification,
    ) -> Result<(ResolvedUser, AppData), ServiceError> {
        let (app, strategy, user) = self
            .resolve(
                ctx,
                &verification.app_id,
                &verification.strategy,
                &verification.identity_value,
                &verification.locale,
            )
            .await?;

        if self
            .debug_code_matches(ctx, &app, &user, &verification.code)
            .await?
        {
            if let ResolvedUser::Persisted(u) = &user {
                tracing::warn!(
                    audit = "debug_otp_bypass",
                    user_id = %u.id,
                    app_id = %app.id,
                    "Challenge satisfied with debug OTP code"
                );
            }
            return Ok((user, app));
        }

        let key = user.challenge_key(strategy.identity, &verification.identity_value);
        let challenge = ctx
            .run(self.challenges.get_latest_challenge(&strategy, &key))
            .await?
            .ok_or(ServiceError::ChallengeNotFound)?;

        // Attempts are reserved before comparing, so parallel guesses share
        // one budget.
        let admitted = ctx
            .run(self.challenges.begin_attempt(&challenge.id))
            .await?;
        if !admitted {
            return Err(ServiceError::ChallengeNotFound);
        }

        let binding_ok = challenge.user_code_challenge.is_empty()
            || constant_time_eq(
                &challenge.user_code_challenge,
                &code_challenge_for(&verification.user_code_verifier),
            );

        if !binding_ok || !constant_time_eq(&challenge.otp, &verification.code) {
            tracing::info!(
                challenge_id = %challenge.id,
                prior_attempts = challenge.attempts,
                "Challenge verification failed"
            );
            return Err(ServiceError::InvalidOtp);
        }

        let solve = SolveContext {
            device_id: verification.device_id,
            user_agent: verification.user_agent,
        };
        let solved = ctx
            .run(self.challenges.mark_challenge_as_solved(&challenge.id, &solve))
            .await?;
        if !solved {
            return Err(ServiceError::ChallengeNotFound);
        }

        tracing::info!(challenge_id = %challenge.id, "Challenge solved");
        Ok((user, app))
    }

    /// Verify, then persist a pending user so the caller always gets a real
    /// account.
    pub async fn login_or_register_user_with_challenge(
        &self,
        ctx: &RequestContext,
        verification: ChallengeVerification,
    ) -> Result<(User, AppData), ServiceError> {
        let (resolved, app) = self.verify_challenge(ctx, verification).await?;
        let user = match resolved {
            ResolvedUser::Persisted(user) => user,
            ResolvedUser::Pending(pending) => {
                let user = ctx
                    .run(self.users.add_user(NewUser::from(pending)))
                    .await?;
                tracing::info!(
                    user_id = %user.id,
                    app_id = %app.id,
                    "Registered user via challenge"
                );
                user
            }
        };
        Ok((user, app))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AuthStrategy, UserData, MAX_VERIFY_ATTEMPTS};
    use crate::services::email::MockEmailService;
    use crate::services::error::StorageError;
    use crate::services::memory::InMemoryStore;
    use crate::services::messages::BuiltinCatalog;
    use crate::services::sms::MockSmsProvider;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::task::JoinSet;

    fn email_otp() -> FirstFactorInternalStrategy {
        FirstFactorInternalStrategy::new(Identity::Email, ChallengeType::Otp, Transport::Email)
    }

    fn sms_otp(identity: Identity) -> FirstFactorInternalStrategy {
        FirstFactorInternalStrategy::new(identity, ChallengeType::Otp, Transport::Sms)
    }

    /// Holds every reader between fetching a challenge and using it.
    struct SlowChallenges(Arc<InMemoryStore>);

    #[async_trait]
    impl UserAuthStorage for SlowChallenges {
        async fn add_challenge(&self, challenge: &UserAuthChallenge) -> Result<(), StorageError> {
            self.0.add_challenge(challenge).await
        }

        async fn get_latest_challenge(
            &self,
            strategy: &FirstFactorInternalStrategy,
            user_id: &str,
        ) -> Result<Option<UserAuthChallenge>, StorageError> {
            let found = self.0.get_latest_challenge(strategy, user_id).await?;
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(found)
        }

        async fn mark_challenge_as_sent(&self, id: &str) -> Result<(), StorageError> {
            self.0.mark_challenge_as_sent(id).await
        }

        async fn begin_attempt(&self, id: &str) -> Result<bool, StorageError> {
            self.0.begin_attempt(id).await
        }

        async fn mark_challenge_as_solved(
            &self,
            id: &str,
            context: &SolveContext,
        ) -> Result<bool, StorageError> {
            self.0.mark_challenge_as_solved(id, context).await
        }
    }

    #[test]
    fn test_delivery_address_prefers_stored_contact() {
        let stored = ResolvedUser::Persisted(User {
            id: "u1".to_string(),
            email: "jane@x.test".to_string(),
            phone_number: "+61450111222".to_string(),
            active: true,
            ..Default::default()
        });
        assert_eq!(
            delivery_address(&sms_otp(Identity::Email), &stored, "jane@x.test").unwrap(),
            Some("+61450111222")
        );
        assert_eq!(
            delivery_address(&email_otp(), &stored, "JANE@x.test").unwrap(),
            Some("jane@x.test")
        );

        let pending = ResolvedUser::Pending(PendingUser::from_identity(
            Identity::Phone,
            "+15550100",
            "en",
        ));
        assert_eq!(
            delivery_address(&sms_otp(Identity::Phone), &pending, "+15550100").unwrap(),
            Some("+15550100")
        );
    }

    #[test]
    fn test_delivery_address_never_mixes_kinds() {
        let pending = ResolvedUser::Pending(PendingUser::from_identity(
            Identity::Email,
            "new@x.test",
            "en",
        ));
        assert!(matches!(
            delivery_address(&sms_otp(Identity::Email), &pending, "new@x.test"),
            Err(ServiceError::Validation(_))
        ));

        let no_email = ResolvedUser::Persisted(User {
            id: "u2".to_string(),
            username: "jdoe".to_string(),
            active: true,
            ..Default::default()
        });
        let by_username = FirstFactorInternalStrategy::new(
            Identity::Username,
            ChallengeType::Otp,
            Transport::Email,
        );
        assert!(matches!(
            delivery_address(&by_username, &no_email, "jdoe"),
            Err(ServiceError::Validation(_))
        ));

        let silent =
            FirstFactorInternalStrategy::new(Identity::Email, ChallengeType::Otp, Transport::None);
        assert_eq!(delivery_address(&silent, &pending, "new@x.test").unwrap(), None);
    }

    #[tokio::test]
    async fn test_parallel_guesses_share_one_attempt_budget() {
        let store = Arc::new(InMemoryStore::new());
        store
            .insert_app(AppData {
                id: "app1".to_string(),
                active: true,
                auth_strategies: vec![AuthStrategy::FirstFactorInternal(email_otp())],
                ..Default::default()
            })
            .unwrap();
        store
            .insert_user(
                User {
                    id: "u1".to_string(),
                    email: "jane@x.test".to_string(),
                    active: true,
                    ..Default::default()
                },
                UserData::default(),
            )
            .unwrap();

        let email = Arc::new(MockEmailService::new());
        let engine = Arc::new(ChallengeEngine::new(
            store.clone(),
            store.clone(),
            Arc::new(SlowChallenges(store.clone())),
            email.clone(),
            Arc::new(MockSmsProvider::new()),
            Arc::new(BuiltinCatalog::default()),
            "https://id.example.com",
        ));

        let ctx = RequestContext::default();
        let issued = engine
            .request_challenge(
                &ctx,
                ChallengeRequest {
                    app_id: "app1".to_string(),
                    strategy: email_otp(),
                    identity_value: "jane@x.test".to_string(),
                    locale: "en".to_string(),
                    device_id: String::new(),
                    user_agent: String::new(),
                    user_code_challenge: String::new(),
                },
            )
            .await
            .unwrap();
        let code = email.sent()[0].data["code"].as_str().unwrap().to_string();
        let wrong = if code == "000000" { "111111" } else { "000000" };

        let guesses = 31;
        let mut set = JoinSet::new();
        for i in 0..guesses {
            let engine = engine.clone();
            let guess = if i == guesses - 1 { code.clone() } else { wrong.to_string() };
            set.spawn(async move {
                engine
                    .verify_challenge(
                        &RequestContext::default(),
                        ChallengeVerification {
                            app_id: "app1".to_string(),
                            strategy: email_otp(),
                            identity_value: "jane@x.test".to_string(),
                            code: guess,
                            locale: "en".to_string(),
                            device_id: String::new(),
                            user_agent: String::new(),
                            user_code_verifier: String::new(),
                        },
                    )
                    .await
            });
        }

        let (mut solved, mut rejected, mut refused) = (0, 0, 0);
        while let Some(outcome) = set.join_next().await {
            match outcome.unwrap() {
                Ok(_) => solved += 1,
                Err(ServiceError::InvalidOtp) => rejected += 1,
                Err(ServiceError::ChallengeNotFound) => refused += 1,
                Err(other) => panic!("unexpected error: {}", other),
            }
        }

        assert!(solved <= 1);
        assert_eq!(solved + rejected, MAX_VERIFY_ATTEMPTS as usize);
        assert_eq!(refused, guesses - MAX_VERIFY_ATTEMPTS as usize);

        let stored = store
            .get_latest_challenge(&email_otp(), "u1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.id, issued.challenge_id);
        assert_eq!(stored.attempts, MAX_VERIFY_ATTEMPTS);
    }

    #[test]
    fn test_otp_shape() {
        for _ in 0..100 {
            let otp = generate_otp();
            assert_eq!(otp.len(), OTP_LENGTH);
            assert!(otp.chars().all(|c| c.is_ascii_digit()));
        }
        let code = generate_magic_link_code();
        assert_eq!(code.len(), MAGIC_LINK_CODE_LENGTH);
        assert!(code.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_otp_digits_are_uniform() {
        let mut counts = [0u32; 10];
        let samples = 10_000;
        for _ in 0..samples {
            for c in generate_otp().chars() {
                counts[(c as u8 - b'0') as usize] += 1;
            }
        }
        let expected = (samples * OTP_LENGTH) as f64 / 10.0;
        for (digit, count) in counts.iter().enumerate() {
            let deviation = (*count as f64 - expected).abs() / expected;
            assert!(deviation < 0.1, "digit {} seen {} times", digit, count);
        }
    }

    #[test]
    fn test_otp_is_not_reproducible() {
        let first: Vec<String> = (0..20).map(|_| generate_otp()).collect();
        let second: Vec<String> = (0..20).map(|_| generate_otp()).collect();
        assert_ne!(first, second);
    }

    #[test]
    fn test_code_challenge_binding() {
        let challenge = code_challenge_for("verifier-123");
        assert_eq!(challenge, code_challenge_for("verifier-123"));
        assert_ne!(challenge, code_challenge_for("verifier-124"));
        assert!(!challenge.contains('='));
    }
}
