use service_core::config as core_config;
use service_core::error::AppError;
use std::collections::{HashMap, HashSet};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::services::{SmsGatewayConfig, SmtpConfig, TokenConfig};

#[derive(Debug, Clone)]
pub struct IdentityConfig {
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    /// Externally visible base URL, used for discovery and default links.
    pub public_base_url: String,
    pub request_timeout_seconds: u64,
    pub keys: KeyConfig,
    pub tokens: TokenConfig,
    pub storage: StorageConfig,
    pub smtp: Option<SmtpConfig>,
    pub sms: Option<SmsGatewayConfig>,
    pub security: SecurityConfig,
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Environment {
    Dev,
    Prod,
}

#[derive(Debug, Clone)]
pub struct KeyConfig {
    pub algorithm: String,
    pub private_key_path: PathBuf,
    pub public_key_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// `memory` or `redis`. Checked at startup, not here, so that a bad value
    /// leaves the service up with auth disabled.
    pub kind: String,
    pub redis_url: Option<String>,
    /// JSON file of apps and users for the in-memory store.
    pub seed_file: Option<PathBuf>,
}

#[derive(Clone)]
pub struct SecurityConfig {
    pub allowed_origins: Vec<String>,
    /// key id -> shared secret for signed management requests.
    pub management_keys: HashMap<String, String>,
    pub management_roles: HashSet<String>,
}

impl std::fmt::Debug for SecurityConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityConfig")
            .field("allowed_origins", &self.allowed_origins)
            .field("management_key_ids", &self.management_keys.keys().collect::<Vec<_>>())
            .field("management_roles", &self.management_roles)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub login_attempts: u32,
    pub login_window_seconds: u64,
    pub challenge_attempts: u32,
    pub challenge_window_seconds: u64,
}

impl IdentityConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;

        let env_str = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let environment: Environment = env_str
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let is_prod = environment == Environment::Prod;
        let defaults = TokenConfig::default();
        let public_base_url = get_env("PUBLIC_BASE_URL", Some("http://localhost:8080"), is_prod)?;

        let config = IdentityConfig {
            common: common_config,
            environment: environment.clone(),
            service_name: get_env("SERVICE_NAME", Some("identity-service"), is_prod)?,
            service_version: get_env("SERVICE_VERSION", Some(env!("CARGO_PKG_VERSION")), is_prod)?,
            log_level: get_env("LOG_LEVEL", Some("info"), is_prod)?,
            otlp_endpoint: get_optional_env("OTLP_ENDPOINT"),
            request_timeout_seconds: parse_env("REQUEST_TIMEOUT_SECONDS", "30", is_prod)?,
            keys: KeyConfig {
                algorithm: get_env("TOKEN_SIGNING_ALGORITHM", Some("RS256"), is_prod)?,
                private_key_path: get_env(
                    "TOKEN_PRIVATE_KEY_PATH",
                    Some("keys/private.pem"),
                    is_prod,
                )?
                .into(),
                public_key_path: get_env("TOKEN_PUBLIC_KEY_PATH", Some("keys/public.pem"), is_prod)?
                    .into(),
            },
            tokens: TokenConfig {
                issuer: get_env("TOKEN_ISSUER", Some(public_base_url.as_str()), is_prod)?,
                key_id: get_optional_env("TOKEN_KEY_ID"),
                access_ttl_seconds: parse_env(
                    "ACCESS_TOKEN_TTL_SECONDS",
                    &defaults.access_ttl_seconds.to_string(),
                    is_prod,
                )?,
                refresh_ttl_seconds: parse_env(
                    "REFRESH_TOKEN_TTL_SECONDS",
                    &defaults.refresh_ttl_seconds.to_string(),
                    is_prod,
                )?,
                id_ttl_seconds: parse_env(
                    "ID_TOKEN_TTL_SECONDS",
                    &defaults.id_ttl_seconds.to_string(),
                    is_prod,
                )?,
                invite_ttl_seconds: parse_env(
                    "INVITE_TOKEN_TTL_SECONDS",
                    &defaults.invite_ttl_seconds.to_string(),
                    is_prod,
                )?,
                reset_ttl_seconds: parse_env(
                    "RESET_TOKEN_TTL_SECONDS",
                    &defaults.reset_ttl_seconds.to_string(),
                    is_prod,
                )?,
            },
            storage: StorageConfig {
                kind: get_env("STORAGE_TYPE", Some("memory"), is_prod)?,
                redis_url: get_optional_env("REDIS_URL"),
                seed_file: get_optional_env("SEED_FILE").map(PathBuf::from),
            },
            smtp: match get_optional_env("SMTP_HOST") {
                Some(host) => Some(SmtpConfig {
                    host,
                    port: parse_env("SMTP_PORT", "587", is_prod)?,
                    username: get_env("SMTP_USERNAME", None, is_prod)?,
                    password: get_env("SMTP_PASSWORD", None, is_prod)?,
                    from: get_env("SMTP_FROM", None, is_prod)?,
                    templates_dir: get_optional_env("EMAIL_TEMPLATES_DIR").map(PathBuf::from),
                }),
                None => None,
            },
            sms: match get_optional_env("SMS_GATEWAY_URL") {
                Some(url) => Some(SmsGatewayConfig {
                    url,
                    api_key: get_env("SMS_GATEWAY_API_KEY", None, is_prod)?,
                    sender: get_env("SMS_SENDER", Some("IDENTITY"), is_prod)?,
                }),
                None => None,
            },
            security: SecurityConfig {
                allowed_origins: split_list(&get_env(
                    "ALLOWED_ORIGINS",
                    Some("http://localhost:3000"),
                    is_prod,
                )?),
                management_keys: parse_management_keys(
                    &get_optional_env("MANAGEMENT_API_KEYS").unwrap_or_default(),
                )?,
                management_roles: split_list(&get_env(
                    "MANAGEMENT_ROLES",
                    Some("admin,owner"),
                    is_prod,
                )?)
                .into_iter()
                .collect(),
            },
            rate_limit: RateLimitConfig {
                login_attempts: get_env("RATE_LIMIT_LOGIN_ATTEMPTS", Some("5"), is_prod)?
                    .parse()
                    .unwrap_or(5),
                login_window_seconds: get_env(
                    "RATE_LIMIT_LOGIN_WINDOW_SECONDS",
                    Some("900"),
                    is_prod,
                )?
                .parse()
                .unwrap_or(900),
                challenge_attempts: get_env("RATE_LIMIT_CHALLENGE_ATTEMPTS", Some("5"), is_prod)?
                    .parse()
                    .unwrap_or(5),
                challenge_window_seconds: get_env(
                    "RATE_LIMIT_CHALLENGE_WINDOW_SECONDS",
                    Some("300"),
                    is_prod,
                )?
                .parse()
                .unwrap_or(300),
            },
            public_base_url,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.common.port == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "PORT must be greater than 0"
            )));
        }

        let lifetimes = [
            ("ACCESS_TOKEN_TTL_SECONDS", self.tokens.access_ttl_seconds),
            ("REFRESH_TOKEN_TTL_SECONDS", self.tokens.refresh_ttl_seconds),
            ("ID_TOKEN_TTL_SECONDS", self.tokens.id_ttl_seconds),
            ("INVITE_TOKEN_TTL_SECONDS", self.tokens.invite_ttl_seconds),
            ("RESET_TOKEN_TTL_SECONDS", self.tokens.reset_ttl_seconds),
        ];
        if let Some((key, _)) = lifetimes.iter().find(|(_, ttl)| *ttl <= 0) {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "{} must be positive",
                key
            )));
        }

        if self.environment == Environment::Prod
            && self.security.allowed_origins.iter().any(|o| o == "*")
        {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "Wildcard CORS origin not allowed in production"
            )));
        }

        if self.security.management_keys.is_empty() {
            tracing::warn!(
                "No management API keys configured; management routes reject every request"
            );
        }

        Ok(())
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod && default.is_none() {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required in production but not set",
                    key
                ))))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required but not set",
                    key
                ))))
            }
        }
    }
}

fn get_optional_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_env<T>(key: &str, default: &str, is_prod: bool) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get_env(key, Some(default), is_prod)?
        .parse()
        .map_err(|e: T::Err| AppError::ConfigError(anyhow::anyhow!("{}: {}", key, e)))
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// `id:secret,id2:secret2`
fn parse_management_keys(value: &str) -> Result<HashMap<String, String>, AppError> {
    split_list(value)
        .into_iter()
        .map(|entry| {
            entry
                .split_once(':')
                .filter(|(id, secret)| !id.is_empty() && !secret.is_empty())
                .map(|(id, secret)| (id.to_string(), secret.to_string()))
                .ok_or_else(|| {
                    AppError::ConfigError(anyhow::anyhow!(
                        "MANAGEMENT_API_KEYS entries must be id:secret"
                    ))
                })
        })
        .collect()
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}
