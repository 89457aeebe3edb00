//! In-process test harness: memory storage, recording notifiers and the
//! fixture RSA key pair behind the real router.

#![allow(dead_code)]

use identity_service::{
    build_router,
    models::{
        AppData, AuthStrategy, ChallengeType, FirstFactorInternalStrategy, Identity,
        TenantMembership, TenantMemberships, Transport, User, UserData,
    },
    services::{
        credentials::hash_password, BuiltinCatalog, ControllerSettings, InMemoryStore, KeyStorage,
        MockEmailService, MockSmsProvider, Notifiers, Password, SigningAlgorithm,
        StaticKeyStorage, Stores, TokenConfig, TokenService, UserController,
    },
    AppState, ManagementKeys, ServiceSlot,
};
use serde_json::{Map, Value};
use service_core::axum::{
    body::Body,
    http::{header, HeaderMap, Request, StatusCode},
    Router,
};
use service_core::middleware::cors::OriginChecker;
use service_core::middleware::rate_limit::create_ip_rate_limiter;
use service_core::middleware::signature::{
    CONTENT_MD5_HEADER, DIGEST_HEADER, EXPIRES_HEADER, KEY_ID_HEADER,
};
use service_core::utils::signature::{body_md5, digest_header, generate_signature, SignedParts};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tower::util::ServiceExt;

pub const PRIVATE_KEY: &str = include_str!("../fixtures/rsa_private.pem");
pub const PUBLIC_KEY: &str = include_str!("../fixtures/rsa_public.pem");

pub const APP_ID: &str = "app1";
pub const BASE_URL: &str = "https://id.example.com";
pub const PASSWORD: &str = "correct-horse-battery";

pub const ADMIN_ID: &str = "u-admin";
pub const ADMIN_EMAIL: &str = "admin@acme.test";
pub const MEMBER_ID: &str = "u-member";
pub const MEMBER_EMAIL: &str = "member@acme.test";
pub const OUTSIDER_ID: &str = "u-outsider";
pub const OUTSIDER_EMAIL: &str = "outsider@example.test";

pub const MGMT_KEY_ID: &str = "ops";
pub const MGMT_SECRET: &[u8] = b"s3cret-management-key";
pub const HOST: &str = "id.example.com";

pub fn strategy(
    identity: Identity,
    challenge: ChallengeType,
    transport: Transport,
) -> AuthStrategy {
    AuthStrategy::FirstFactorInternal(FirstFactorInternalStrategy::new(
        identity, challenge, transport,
    ))
}

pub fn test_app_data() -> AppData {
    AppData {
        id: APP_ID.to_string(),
        active: true,
        offline: true,
        auth_strategies: vec![
            strategy(Identity::Email, ChallengeType::Password, Transport::None),
            strategy(Identity::Email, ChallengeType::Otp, Transport::Email),
            strategy(Identity::Phone, ChallengeType::Otp, Transport::Sms),
            strategy(Identity::Email, ChallengeType::MagicLink, Transport::Email),
        ],
        passwordless_registration_allowed: true,
        ..Default::default()
    }
}

pub fn user(id: &str, email: &str) -> User {
    User {
        id: id.to_string(),
        username: id.to_string(),
        email: email.to_string(),
        given_name: id.to_string(),
        active: true,
        ..Default::default()
    }
}

pub fn acme_admin_membership() -> TenantMemberships {
    let mut memberships = TenantMemberships::new();
    memberships.insert(
        "acme".to_string(),
        TenantMembership::new("acme", "Acme Inc").with_group("staff", ["admin", "member"]),
    );
    memberships
}

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub store: Arc<InMemoryStore>,
    pub email: Arc<MockEmailService>,
    pub sms: Arc<MockSmsProvider>,
}

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_app(test_app_data()).await
    }

    pub async fn with_app(app: AppData) -> Self {
        let store = Arc::new(InMemoryStore::new());
        store.insert_app(app).unwrap();

        let password_hash = hash_password(&Password::new(PASSWORD)).unwrap();
        store
            .insert_user(
                user(ADMIN_ID, ADMIN_EMAIL),
                UserData {
                    tenant_membership: Some(acme_admin_membership()),
                    password_hash: Some(password_hash.clone()),
                    ..Default::default()
                },
            )
            .unwrap();
        store
            .insert_user(
                user(MEMBER_ID, MEMBER_EMAIL),
                UserData {
                    password_hash: Some(password_hash.clone()),
                    ..Default::default()
                },
            )
            .unwrap();
        store
            .insert_user(
                user(OUTSIDER_ID, OUTSIDER_EMAIL),
                UserData {
                    password_hash: Some(password_hash),
                    ..Default::default()
                },
            )
            .unwrap();

        let keys = StaticKeyStorage::new(PRIVATE_KEY, PUBLIC_KEY)
            .load_keys(SigningAlgorithm::RS256)
            .await
            .unwrap();
        let tokens = TokenService::new(
            TokenConfig {
                issuer: BASE_URL.to_string(),
                ..Default::default()
            },
            &keys,
        )
        .unwrap();

        let email = Arc::new(MockEmailService::new());
        let sms = Arc::new(MockSmsProvider::new());
        let controller = UserController::new(
            tokens,
            Stores {
                apps: store.clone(),
                users: store.clone(),
                tokens: store.clone(),
                challenges: store.clone(),
                invites: store.clone(),
            },
            Notifiers {
                email: email.clone(),
                sms: sms.clone(),
                catalog: Arc::new(BuiltinCatalog::default()),
            },
            ControllerSettings {
                public_base_url: BASE_URL.to_string(),
                ..Default::default()
            },
        );

        let state = test_state(ServiceSlot::Ready(Arc::new(controller)));
        Self {
            router: build_router(state.clone()),
            state,
            store,
            email,
            sms,
        }
    }

    pub fn controller(&self) -> &UserController {
        match &self.state.identity {
            ServiceSlot::Ready(controller) => controller,
            ServiceSlot::Unavailable(reason) => panic!("identity unavailable: {}", reason),
        }
    }

    pub async fn send(&self, request: Request<Body>) -> TestResponse {
        send(&self.router, request).await
    }

    pub async fn get(&self, path: &str) -> TestResponse {
        self.send(Request::get(path).body(Body::empty()).unwrap())
            .await
    }

    pub async fn post(&self, path: &str, bearer: Option<&str>, body: Value) -> TestResponse {
        self.post_for(APP_ID, path, bearer, body).await
    }

    pub async fn post_for(
        &self,
        app_id: &str,
        path: &str,
        bearer: Option<&str>,
        body: Value,
    ) -> TestResponse {
        let mut builder = Request::post(path)
            .header(header::CONTENT_TYPE, "application/json")
            .header("x-app-id", app_id);
        if let Some(token) = bearer {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        self.send(builder.body(Body::from(body.to_string())).unwrap())
            .await
    }

    /// Management request signed with `secret` under the test key id.
    pub async fn signed_post(&self, path: &str, body: Value, secret: &[u8]) -> TestResponse {
        let body = body.to_string();
        let date = chrono::Utc::now().to_rfc2822();
        let expires = (chrono::Utc::now() + chrono::Duration::minutes(5)).to_rfc2822();
        let md5 = body_md5(body.as_bytes());
        let parts = SignedParts {
            method: "POST",
            body_md5: &md5,
            content_type: "application/json",
            date: &date,
            expires: &expires,
            host: HOST,
        };
        let signature = generate_signature(secret, &parts).unwrap();

        let request = Request::post(path)
            .header(header::HOST, HOST)
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::DATE, &date)
            .header(EXPIRES_HEADER, &expires)
            .header(CONTENT_MD5_HEADER, &md5)
            .header(KEY_ID_HEADER, MGMT_KEY_ID)
            .header(DIGEST_HEADER, digest_header(&signature))
            .body(Body::from(body))
            .unwrap();
        self.send(request).await
    }

    pub async fn login(&self, email: &str, scopes: &[&str]) -> Value {
        let response = self
            .post(
                "/auth/login",
                None,
                serde_json::json!({
                    "identity": "email",
                    "value": email,
                    "password": PASSWORD,
                    "scopes": scopes,
                }),
            )
            .await;
        assert_eq!(response.status, StatusCode::OK, "login failed: {}", response.body);
        response.body
    }

    pub async fn access_token(&self, email: &str) -> String {
        self.login(email, &[]).await["access_token"]
            .as_str()
            .unwrap()
            .to_string()
    }

    pub fn last_email_data(&self) -> Map<String, Value> {
        self.email
            .sent()
            .last()
            .map(|sent| sent.data.clone())
            .expect("no email was sent")
    }
}

pub fn test_state(identity: ServiceSlot) -> AppState {
    let mut keys = HashMap::new();
    keys.insert(
        MGMT_KEY_ID.to_string(),
        String::from_utf8(MGMT_SECRET.to_vec()).unwrap(),
    );
    AppState {
        identity,
        management_keys: ManagementKeys::new(&keys),
        origins: OriginChecker::new(["https://app.example.com"]),
        login_rate_limiter: create_ip_rate_limiter(100, 60),
        challenge_rate_limiter: create_ip_rate_limiter(100, 60),
        service_name: "identity-service-test".to_string(),
        public_base_url: BASE_URL.to_string(),
        request_timeout: Duration::from_secs(10),
    }
}

pub async fn send(router: &Router, request: Request<Body>) -> TestResponse {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = http_body_util::BodyExt::collect(response.into_body())
        .await
        .unwrap()
        .to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| {
            Value::String(String::from_utf8_lossy(&bytes).into_owned())
        })
    };
    TestResponse {
        status,
        headers,
        body,
    }
}
