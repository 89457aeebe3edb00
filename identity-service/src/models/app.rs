//! App model - per-application authentication policy.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::token::TokenType;

/// Which user attribute identifies the account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Identity {
    Email,
    Phone,
    Username,
    Id,
}

impl Identity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Identity::Email => "email",
            Identity::Phone => "phone",
            Identity::Username => "username",
            Identity::Id => "id",
        }
    }
}

/// What the user has to prove.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeType {
    Otp,
    MagicLink,
    Password,
}

/// How the challenge reaches the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    Sms,
    Email,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FirstFactorInternalStrategy {
    pub identity: Identity,
    pub challenge: ChallengeType,
    pub transport: Transport,
}

impl FirstFactorInternalStrategy {
    pub fn new(identity: Identity, challenge: ChallengeType, transport: Transport) -> Self {
        Self {
            identity,
            challenge,
            transport,
        }
    }

    /// Stable key used to index challenges in storage.
    pub fn key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.identity.as_str(),
            serde_plain(&self.challenge),
            serde_plain(&self.transport)
        )
    }
}

fn serde_plain<T: Serialize>(value: &T) -> String {
    serde_json::to_value(value)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FederatedStrategy {
    pub provider: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthStrategyType {
    FirstFactorInternal,
    FirstFactorFederated,
}

/// A strategy configured on an app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthStrategy {
    FirstFactorInternal(FirstFactorInternalStrategy),
    FirstFactorFederated(FederatedStrategy),
}

impl AuthStrategy {
    pub fn strategy_type(&self) -> AuthStrategyType {
        match self {
            AuthStrategy::FirstFactorInternal(_) => AuthStrategyType::FirstFactorInternal,
            AuthStrategy::FirstFactorFederated(_) => AuthStrategyType::FirstFactorFederated,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoginAppSettings {
    /// Base URL of the app's login web app, used for magic links.
    #[serde(default)]
    pub login_url: String,
}

/// Per-app token lifetime overrides, in seconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenLifetimes {
    #[serde(default)]
    pub access_seconds: Option<i64>,
    #[serde(default)]
    pub refresh_seconds: Option<i64>,
    #[serde(default)]
    pub id_seconds: Option<i64>,
    #[serde(default)]
    pub invite_seconds: Option<i64>,
    #[serde(default)]
    pub reset_seconds: Option<i64>,
}

impl TokenLifetimes {
    pub fn for_type(&self, token_type: TokenType) -> Option<i64> {
        match token_type {
            TokenType::Access => self.access_seconds,
            TokenType::Refresh => self.refresh_seconds,
            TokenType::Id => self.id_seconds,
            TokenType::Invite => self.invite_seconds,
            TokenType::Reset => self.reset_seconds,
        }
    }
}

/// locale -> message key -> text
pub type CustomSmsMessages = HashMap<String, HashMap<String, String>>;

/// One tenant application of the identity service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppData {
    pub id: String,
    #[serde(default)]
    pub active: bool,
    /// Whether refresh tokens may be issued.
    #[serde(default)]
    pub offline: bool,
    #[serde(default)]
    pub auth_strategies: Vec<AuthStrategy>,
    #[serde(default)]
    pub login_app_settings: Option<LoginAppSettings>,
    #[serde(default)]
    pub custom_email_templates: bool,
    #[serde(default)]
    pub custom_sms_messages: Option<CustomSmsMessages>,
    #[serde(default)]
    pub registration_forbidden: bool,
    #[serde(default)]
    pub passwordless_registration_allowed: bool,
    #[serde(default)]
    pub debug_otp_code_allowed: bool,
    #[serde(default)]
    pub token_lifetimes: TokenLifetimes,
    #[serde(default)]
    pub reset_password_url: Option<String>,
    #[serde(default)]
    pub invite_url: Option<String>,
    #[serde(default)]
    pub default_locale: Option<String>,
}

impl AppData {
    /// Subfolder for app-specific email templates, if enabled.
    pub fn email_template_subfolder(&self) -> Option<&str> {
        self.custom_email_templates.then_some(self.id.as_str())
    }

    pub fn first_factor_strategies(&self) -> impl Iterator<Item = &FirstFactorInternalStrategy> {
        self.auth_strategies.iter().filter_map(|s| match s {
            AuthStrategy::FirstFactorInternal(ffi) => Some(ffi),
            AuthStrategy::FirstFactorFederated(_) => None,
        })
    }
}
