use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    Access,
    Refresh,
    Id,
    Invite,
    Reset,
}

impl TokenType {
    pub const ALL: [TokenType; 5] = [
        TokenType::Access,
        TokenType::Refresh,
        TokenType::Id,
        TokenType::Invite,
        TokenType::Reset,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TokenType::Access => "access",
            TokenType::Refresh => "refresh",
            TokenType::Id => "id",
            TokenType::Invite => "invite",
            TokenType::Reset => "reset",
        }
    }

    /// Whether tokens of this type carry a `jti`.
    pub fn has_id(&self) -> bool {
        matches!(self, TokenType::Access | TokenType::Refresh)
    }
}

/// A token recorded in token storage. Presence of an id means the token can no
/// longer be used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenStorageEntity {
    pub id: String,
    #[serde(default)]
    pub raw_token: String,
    pub token_type: TokenType,
    pub added_at: DateTime<Utc>,
    #[serde(default)]
    pub added_by: String,
    #[serde(default)]
    pub comments: String,
}

impl TokenStorageEntity {
    pub fn new(id: impl Into<String>, token_type: TokenType, added_by: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            raw_token: String::new(),
            token_type,
            added_at: Utc::now(),
            added_by: added_by.into(),
            comments: String::new(),
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comments = comment.into();
        self
    }
}

/// Tokens returned to the client after authentication.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthResponse {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    pub token_type: String,
    pub expires_in: i64,
}
