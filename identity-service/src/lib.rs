pub mod config;
pub mod dtos;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod utils;

use service_core::async_trait::async_trait;
use service_core::axum::{
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};
use service_core::error::AppError;
use service_core::middleware::{
    cors::OriginChecker,
    rate_limit::{create_ip_rate_limiter, ip_rate_limit_middleware, IpRateLimiter},
    signature::{signature_validation_middleware, SigningKeyStore},
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::config::IdentityConfig;
use crate::services::{
    BuiltinCatalog, ControllerSettings, EmailProvider, FileKeyStorage, HttpSmsProvider,
    InMemoryStore, KeyStorage, MessageCatalog, MockEmailService, MockSmsProvider, Notifiers,
    RedisTokenStorage, RequestContext, SeedData, SigningAlgorithm, SmsProvider, SmtpEmailService,
    Stores, TokenService, TokenStorage, UserController,
};

/// The identity services, or the reason they could not start. The process
/// keeps serving `/health` either way.
#[derive(Clone)]
pub enum ServiceSlot {
    Ready(Arc<UserController>),
    Unavailable(Arc<str>),
}

impl ServiceSlot {
    pub fn controller(&self) -> Result<&UserController, AppError> {
        match self {
            ServiceSlot::Ready(controller) => Ok(controller),
            ServiceSlot::Unavailable(reason) => {
                tracing::error!(
                    reason = %reason,
                    "Auth request while identity services are unavailable"
                );
                Err(AppError::ServiceUnavailable(
                    "identity service unavailable".to_string(),
                ))
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, ServiceSlot::Ready(_))
    }
}

/// Shared secrets for signed management requests, by key id.
#[derive(Clone, Default)]
pub struct ManagementKeys(Arc<HashMap<String, Vec<u8>>>);

impl ManagementKeys {
    pub fn new(keys: &HashMap<String, String>) -> Self {
        Self(Arc::new(
            keys.iter()
                .map(|(id, secret)| (id.clone(), secret.as_bytes().to_vec()))
                .collect(),
        ))
    }
}

#[async_trait]
impl SigningKeyStore for ManagementKeys {
    async fn signing_secret(&self, key_id: &str) -> Result<Option<Vec<u8>>, AppError> {
        Ok(self.0.get(key_id).cloned())
    }
}

#[derive(Clone)]
pub struct AppState {
    pub identity: ServiceSlot,
    pub management_keys: ManagementKeys,
    pub origins: OriginChecker,
    pub login_rate_limiter: IpRateLimiter,
    pub challenge_rate_limiter: IpRateLimiter,
    pub service_name: String,
    pub public_base_url: String,
    pub request_timeout: Duration,
}

impl AppState {
    pub fn from_config(config: &IdentityConfig, identity: ServiceSlot) -> Self {
        Self {
            identity,
            management_keys: ManagementKeys::new(&config.security.management_keys),
            origins: OriginChecker::new(config.security.allowed_origins.iter().cloned()),
            login_rate_limiter: create_ip_rate_limiter(
                config.rate_limit.login_attempts,
                config.rate_limit.login_window_seconds,
            ),
            challenge_rate_limiter: create_ip_rate_limiter(
                config.rate_limit.challenge_attempts,
                config.rate_limit.challenge_window_seconds,
            ),
            service_name: config.service_name.clone(),
            public_base_url: config.public_base_url.clone(),
            request_timeout: Duration::from_secs(config.request_timeout_seconds.max(1)),
        }
    }

    /// Deadline-bound context for one request.
    pub fn request_context(&self) -> RequestContext {
        RequestContext::with_timeout(self.request_timeout)
    }
}

/// Build the identity services from configuration. Failures are logged and
/// turned into [`ServiceSlot::Unavailable`] instead of aborting startup.
pub async fn init_identity(config: &IdentityConfig) -> ServiceSlot {
    match try_init_identity(config).await {
        Ok(controller) => ServiceSlot::Ready(Arc::new(controller)),
        Err(e) => {
            tracing::error!(
                error = %e,
                "Identity services failed to initialize; auth routes disabled"
            );
            ServiceSlot::Unavailable(Arc::from(e.to_string()))
        }
    }
}

async fn try_init_identity(config: &IdentityConfig) -> Result<UserController, anyhow::Error> {
    let algorithm = SigningAlgorithm::parse(&config.keys.algorithm)?;
    let keys = FileKeyStorage::new(&config.keys.private_key_path, &config.keys.public_key_path)
        .load_keys(algorithm)
        .await?;
    let tokens = TokenService::new(config.tokens.clone(), &keys)?;

    let seed = match &config.storage.seed_file {
        Some(path) => {
            let raw = tokio::fs::read_to_string(path).await?;
            serde_json::from_str::<SeedData>(&raw)?
        }
        None => SeedData::default(),
    };
    let memory = Arc::new(InMemoryStore::from_seed(seed)?);

    let token_storage: Arc<dyn TokenStorage> = match config.storage.kind.as_str() {
        "memory" => memory.clone(),
        "redis" => {
            let url = config
                .storage
                .redis_url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("REDIS_URL is required for redis storage"))?;
            let redis = RedisTokenStorage::new(url).await?;
            redis.health_check().await?;
            Arc::new(redis)
        }
        other => anyhow::bail!("Unsupported storage type: {}", other),
    };

    let catalog: Arc<dyn MessageCatalog> = Arc::new(BuiltinCatalog::default());
    let email: Arc<dyn EmailProvider> = match &config.smtp {
        Some(smtp) => Arc::new(SmtpEmailService::new(smtp, catalog.clone())?),
        None => {
            tracing::warn!("SMTP not configured; emails are recorded in memory only");
            Arc::new(MockEmailService::new())
        }
    };
    let sms: Arc<dyn SmsProvider> = match &config.sms {
        Some(gateway) => Arc::new(HttpSmsProvider::new(gateway.clone())?),
        None => {
            tracing::warn!("SMS gateway not configured; SMS are recorded in memory only");
            Arc::new(MockSmsProvider::new())
        }
    };

    let stores = Stores {
        apps: memory.clone(),
        users: memory.clone(),
        tokens: token_storage,
        challenges: memory.clone(),
        invites: memory,
    };
    let settings = ControllerSettings {
        public_base_url: config.public_base_url.clone(),
        management_roles: config.security.management_roles.clone(),
        ..Default::default()
    };

    Ok(UserController::new(
        tokens,
        stores,
        Notifiers {
            email,
            sms,
            catalog,
        },
        settings,
    ))
}

pub fn build_router(state: AppState) -> Router {
    // SMS pumping and password guessing are throttled per client IP.
    let login_route = Router::new()
        .route("/auth/login", post(handlers::auth::login))
        .layer(from_fn_with_state(
            state.login_rate_limiter.clone(),
            ip_rate_limit_middleware,
        ));

    let challenge_route = Router::new()
        .route(
            "/auth/challenge/request",
            post(handlers::challenge::request_challenge),
        )
        .layer(from_fn_with_state(
            state.challenge_rate_limiter.clone(),
            ip_rate_limit_middleware,
        ));

    let management_routes = Router::new()
        .route(
            "/management/invitation",
            post(handlers::management::create_invitation),
        )
        .route(
            "/management/reset-token",
            post(handlers::management::create_reset_token),
        )
        .layer(from_fn_with_state(
            state.management_keys.clone(),
            signature_validation_middleware::<ManagementKeys>,
        ));

    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/.well-known/jwks.json", get(handlers::well_known::jwks))
        .route(
            "/.well-known/openid-configuration",
            get(handlers::well_known::openid_configuration),
        )
        .route("/auth/register", post(handlers::auth::register))
        .route("/auth/token", post(handlers::auth::token))
        .route(
            "/auth/challenge/verify",
            post(handlers::challenge::verify_challenge),
        )
        .route(
            "/auth/password/reset/request",
            post(handlers::auth::request_password_reset),
        )
        .route("/auth/password/reset", post(handlers::auth::reset_password))
        .route("/auth/invite", post(handlers::invitation::create_invitation))
        .route(
            "/auth/invite/accept",
            post(handlers::invitation::accept_invitation),
        )
        .merge(login_route)
        .merge(challenge_route)
        .merge(management_routes)
        .with_state(state.clone())
        .layer(TraceLayer::new_for_http().make_span_with(
            |request: &service_core::axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                    version = ?request.version(),
                )
            },
        ))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(state.origins.layer())
}
