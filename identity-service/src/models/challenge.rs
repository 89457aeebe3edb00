use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::app::FirstFactorInternalStrategy;

/// Codes compared against a challenge before it is burned.
pub const MAX_VERIFY_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeState {
    Created,
    Sent,
    Solved,
    Expired,
}

/// One issued OTP or magic-link challenge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserAuthChallenge {
    pub id: String,
    /// Persisted user id, or `pending:<identity>:<value>`.
    pub user_id: String,
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub user_agent: String,
    pub app_id: String,
    pub strategy: FirstFactorInternalStrategy,
    pub otp: String,
    #[serde(default)]
    pub user_code_challenge: String,
    #[serde(default)]
    pub solved: bool,
    /// Verification attempts admitted so far, successful or not.
    #[serde(default)]
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub sent_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub expires_mins: i64,
    #[serde(default)]
    pub solved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub solved_device_id: String,
    #[serde(default)]
    pub solved_user_agent: String,
}

impl UserAuthChallenge {
    pub fn state_at(&self, now: DateTime<Utc>) -> ChallengeState {
        if self.solved {
            ChallengeState::Solved
        } else if now >= self.expires_at {
            ChallengeState::Expired
        } else if self.sent_at.is_some() {
            ChallengeState::Sent
        } else {
            ChallengeState::Created
        }
    }

    pub fn state(&self) -> ChallengeState {
        self.state_at(Utc::now())
    }

    /// Not solved, not expired and with attempts left.
    pub fn valid_at(&self, now: DateTime<Utc>) -> bool {
        !matches!(
            self.state_at(now),
            ChallengeState::Solved | ChallengeState::Expired
        ) && self.attempts < MAX_VERIFY_ATTEMPTS
    }

    pub fn valid(&self) -> bool {
        self.valid_at(Utc::now())
    }
}

/// Device context recorded when a challenge is solved.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SolveContext {
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub user_agent: String,
}
