use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::models::{ChallengeType, FirstFactorInternalStrategy, Identity, Transport};

fn default_identity() -> Identity {
    Identity::Email
}

#[derive(Debug, Deserialize, Validate)]
pub struct LoginRequest {
    #[serde(default = "default_identity")]
    pub identity: Identity,

    #[validate(length(min = 1, message = "Identity value is required"))]
    pub value: String,

    #[validate(length(min = 1, message = "Password is required"))]
    pub password: String,

    #[serde(default)]
    pub scopes: Vec<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct RegisterRequest {
    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub email: String,

    #[serde(default)]
    pub phone_number: String,

    #[serde(default)]
    pub given_name: String,

    #[serde(default)]
    pub locale: String,

    #[validate(length(min = 8, message = "Password must be at least 8 characters"))]
    pub password: String,

    #[serde(default)]
    pub scopes: Vec<String>,
}

/// Strategy triple as sent by clients.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct StrategyDto {
    pub identity: Identity,
    pub challenge: ChallengeType,
    pub transport: Transport,
}

impl From<StrategyDto> for FirstFactorInternalStrategy {
    fn from(s: StrategyDto) -> Self {
        FirstFactorInternalStrategy::new(s.identity, s.challenge, s.transport)
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct ChallengeRequestBody {
    #[serde(flatten)]
    pub strategy: StrategyDto,

    #[validate(length(min = 1, message = "Identity value is required"))]
    pub value: String,

    #[serde(default)]
    pub locale: String,

    #[serde(default)]
    pub device_id: String,

    /// S256 code challenge binding the challenge to this client.
    #[serde(default)]
    pub code_challenge: String,
}

#[derive(Debug, Serialize)]
pub struct ChallengeResponse {
    pub challenge_id: String,
    pub expires_at: DateTime<Utc>,
    pub expires_mins: i64,
}

#[derive(Debug, Deserialize, Validate)]
pub struct VerifyChallengeRequest {
    #[serde(flatten)]
    pub strategy: StrategyDto,

    #[validate(length(min = 1, message = "Identity value is required"))]
    pub value: String,

    #[validate(length(min = 1, message = "Code is required"))]
    pub code: String,

    #[serde(default)]
    pub locale: String,

    #[serde(default)]
    pub device_id: String,

    #[serde(default)]
    pub code_verifier: String,

    #[serde(default)]
    pub scopes: Vec<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct TokenRequest {
    #[validate(length(min = 1, message = "Refresh token is required"))]
    pub refresh_token: String,

    /// The access token being replaced, retired together with the refresh token.
    #[serde(default)]
    pub access_token: Option<String>,

    #[serde(default)]
    pub scopes: Vec<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct PasswordResetRequest {
    #[validate(email(message = "Invalid email format"))]
    pub email: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct PasswordResetConfirm {
    #[validate(length(min = 1, message = "Token is required"))]
    pub token: String,

    #[validate(length(min = 8, message = "Password must be at least 8 characters"))]
    pub new_password: String,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
