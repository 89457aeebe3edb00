use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A persisted tenant invitation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invite {
    pub id: String,
    pub app_id: String,
    pub inviter_id: String,
    #[serde(default)]
    pub inviter_name: String,
    /// Signed invite token.
    pub token: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub role: String,
    pub tenant: String,
    #[serde(default)]
    pub tenant_name: String,
    pub group: String,
    #[serde(default)]
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub accepted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub accepted_by: Option<String>,
}

impl Invite {
    pub fn is_accepted(&self) -> bool {
        self.accepted_at.is_some()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Filter for `InviteStorage::get_all`.
#[derive(Debug, Clone, Default)]
pub struct InviteQuery {
    pub app_id: Option<String>,
    pub tenant: Option<String>,
    pub email: Option<String>,
    pub include_accepted: bool,
}

impl InviteQuery {
    pub fn matches(&self, invite: &Invite) -> bool {
        self.app_id.as_deref().map_or(true, |v| v == invite.app_id)
            && self.tenant.as_deref().map_or(true, |v| v == invite.tenant)
            && self
                .email
                .as_deref()
                .map_or(true, |v| v.eq_ignore_ascii_case(&invite.email))
            && (self.include_accepted || !invite.is_accepted())
    }
}
