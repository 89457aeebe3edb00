use service_core::error::AppError;
use thiserror::Error;

/// Caller-facing classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Unauthorized,
    InvalidInput,
    Unsupported,
    Conflict,
    Internal,
}

/// Why a token failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidReason {
    Signature,
    Issuer,
    Audience,
    Type,
    Expired,
    Malformed,
}

#[derive(Error, Debug)]
pub enum TokenError {
    #[error("Token could not be parsed: {0}")]
    Parse(String),

    #[error("Token invalid: {0:?}")]
    Invalid(InvalidReason),

    #[error("Token signing failed: {0}")]
    Signing(String),
}

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Failed to read key {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse key: {0}")]
    Parse(String),

    #[error("Unsupported signing algorithm: {0}")]
    UnsupportedAlgorithm(String),
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Duplicate record: {0}")]
    Duplicate(String),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

#[derive(Error, Debug)]
pub enum NotificationError {
    #[error("Email error: {0}")]
    Email(String),

    #[error("SMS error: {0}")]
    Sms(String),

    #[error("Template error: {0}")]
    Template(String),
}

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("App not found")]
    AppNotFound,

    #[error("App is inactive")]
    AppInactive,

    #[error("Requested challenge is not supported by the app")]
    StrategyUnsupportedByApp,

    #[error("User not found")]
    UserNotFound,

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Invalid OTP code")]
    InvalidOtp,

    #[error("Challenge not found or expired")]
    ChallengeNotFound,

    #[error("Invite not found")]
    InviteNotFound,

    #[error(transparent)]
    TokenParse(TokenError),

    #[error(transparent)]
    TokenInvalid(TokenError),

    #[error("Token is blocked")]
    TokenBlocked,

    #[error("Token subject is empty")]
    InvalidSubject,

    #[error("Inviter cannot grant any of the requested memberships")]
    InvalidInviteTokenBadInvitee,

    #[error("Invitation already used")]
    InvitationUsed,

    #[error("Registration is forbidden for this app")]
    RegistrationForbidden,

    #[error("User already exists")]
    UserAlreadyExists,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Storage error: {0}")]
    Storage(StorageError),

    #[error("Notification error: {0}")]
    Notification(#[from] NotificationError),

    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Request deadline exceeded")]
    DeadlineExceeded,
}

impl From<TokenError> for ServiceError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Parse(_) => ServiceError::TokenParse(err),
            TokenError::Invalid(_) => ServiceError::TokenInvalid(err),
            TokenError::Signing(msg) => ServiceError::Internal(anyhow::anyhow!(msg)),
        }
    }
}

impl From<StorageError> for ServiceError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Duplicate(_) => ServiceError::UserAlreadyExists,
            other => ServiceError::Storage(other),
        }
    }
}

impl ServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::AppNotFound
            | ServiceError::UserNotFound
            | ServiceError::ChallengeNotFound
            | ServiceError::InviteNotFound => ErrorKind::NotFound,
            ServiceError::AppInactive
            | ServiceError::InvalidCredentials
            | ServiceError::InvalidOtp
            | ServiceError::TokenInvalid(_)
            | ServiceError::InvalidInviteTokenBadInvitee
            | ServiceError::RegistrationForbidden => ErrorKind::Unauthorized,
            ServiceError::TokenParse(_)
            | ServiceError::InvalidSubject
            | ServiceError::Validation(_) => ErrorKind::InvalidInput,
            ServiceError::StrategyUnsupportedByApp => ErrorKind::Unsupported,
            ServiceError::TokenBlocked
            | ServiceError::InvitationUsed
            | ServiceError::UserAlreadyExists => ErrorKind::Conflict,
            ServiceError::Storage(_)
            | ServiceError::Notification(_)
            | ServiceError::Key(_)
            | ServiceError::Internal(_)
            | ServiceError::Cancelled
            | ServiceError::DeadlineExceeded => ErrorKind::Internal,
        }
    }

    /// Failures that must not reveal whether an account exists.
    fn is_credential_failure(&self) -> bool {
        matches!(
            self,
            ServiceError::UserNotFound
                | ServiceError::InvalidCredentials
                | ServiceError::InvalidOtp
                | ServiceError::ChallengeNotFound
        )
    }
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        if err.is_credential_failure() {
            tracing::info!(kind = ?err, "Credential check failed");
            return AppError::Unauthorized(anyhow::anyhow!("invalid credentials"));
        }

        let message = err.to_string();
        match err.kind() {
            ErrorKind::NotFound => AppError::NotFound(anyhow::anyhow!(message)),
            ErrorKind::Unauthorized => AppError::Unauthorized(anyhow::anyhow!(message)),
            ErrorKind::InvalidInput => AppError::BadRequest(anyhow::anyhow!(message)),
            ErrorKind::Unsupported => AppError::Unsupported(anyhow::anyhow!(message)),
            ErrorKind::Conflict => AppError::Conflict(anyhow::anyhow!(message)),
            ErrorKind::Internal => AppError::InternalError(anyhow::Error::new(err)),
        }
    }
}
