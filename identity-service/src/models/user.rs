//! User model - persisted accounts and not-yet-persisted passwordless users.

use serde::{Deserialize, Serialize};

use super::app::Identity;
use super::tenant::TenantMemberships;

/// A persisted user. `id` is always a storage-assigned identifier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub phone_number: String,
    #[serde(default)]
    pub given_name: String,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub anonymous: bool,
    #[serde(default)]
    pub access_role: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub locale: String,
}

fn default_true() -> bool {
    true
}

impl User {
    /// Value of the given identity field.
    pub fn identity_value(&self, identity: Identity) -> &str {
        match identity {
            Identity::Email => &self.email,
            Identity::Phone => &self.phone_number,
            Identity::Username => &self.username,
            Identity::Id => &self.id,
        }
    }

    /// Human readable name for emails and invitations.
    pub fn display_name(&self) -> &str {
        [&self.given_name, &self.username, &self.email]
            .into_iter()
            .find(|s| !s.is_empty())
            .map(String::as_str)
            .unwrap_or("")
    }
}

/// A passwordless user synthesized during a challenge flow. It has no id and
/// can only become a [`User`] through `UserStorage::add_user`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PendingUser {
    pub username: String,
    pub email: String,
    pub phone_number: String,
    pub locale: String,
}

impl PendingUser {
    pub fn from_identity(identity: Identity, value: &str, locale: &str) -> Self {
        let mut user = PendingUser {
            locale: locale.to_string(),
            ..Default::default()
        };
        match identity {
            Identity::Email => user.email = value.to_string(),
            Identity::Phone => user.phone_number = value.to_string(),
            Identity::Username | Identity::Id => user.username = value.to_string(),
        }
        user
    }
}

/// Result of resolving an identity value during a challenge flow.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedUser {
    Persisted(User),
    Pending(PendingUser),
}

impl ResolvedUser {
    /// Key used to bind challenges to this user. Pending users are keyed by
    /// their identity so two unregistered numbers never share a challenge.
    pub fn challenge_key(&self, identity: Identity, value: &str) -> String {
        match self {
            ResolvedUser::Persisted(user) => user.id.clone(),
            ResolvedUser::Pending(_) => {
                let value = match identity {
                    Identity::Email => value.trim().to_lowercase(),
                    _ => value.trim().to_string(),
                };
                format!("pending:{}:{}", identity.as_str(), value)
            }
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, ResolvedUser::Pending(_))
    }

    pub fn locale(&self) -> &str {
        match self {
            ResolvedUser::Persisted(u) => &u.locale,
            ResolvedUser::Pending(u) => &u.locale,
        }
    }

    pub fn email(&self) -> &str {
        match self {
            ResolvedUser::Persisted(u) => &u.email,
            ResolvedUser::Pending(u) => &u.email,
        }
    }

    pub fn phone_number(&self) -> &str {
        match self {
            ResolvedUser::Persisted(u) => &u.phone_number,
            ResolvedUser::Pending(u) => &u.phone_number,
        }
    }

    pub fn display_name(&self) -> &str {
        match self {
            ResolvedUser::Persisted(u) => u.display_name(),
            ResolvedUser::Pending(u) => {
                if u.email.is_empty() {
                    &u.username
                } else {
                    &u.email
                }
            }
        }
    }
}

/// New account data for password registration.
#[derive(Debug, Clone, Default)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub phone_number: String,
    pub given_name: String,
    pub locale: String,
    pub scopes: Vec<String>,
}

impl From<PendingUser> for NewUser {
    fn from(p: PendingUser) -> Self {
        NewUser {
            username: p.username,
            email: p.email,
            phone_number: p.phone_number,
            locale: p.locale,
            ..Default::default()
        }
    }
}

/// Supplementary user fields fetched on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserDataField {
    TenantMembership,
    DebugOtpCode,
    PasswordHash,
}

/// Only the fields that were requested are populated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_membership: Option<TenantMemberships>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_otp_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<String>,
}

impl UserData {
    /// Copy of `self` restricted to `fields`.
    pub fn select(&self, fields: &[UserDataField]) -> UserData {
        let mut out = UserData::default();
        for field in fields {
            match field {
                UserDataField::TenantMembership => {
                    out.tenant_membership = self.tenant_membership.clone()
                }
                UserDataField::DebugOtpCode => out.debug_otp_code = self.debug_otp_code.clone(),
                UserDataField::PasswordHash => out.password_hash = self.password_hash.clone(),
            }
        }
        out
    }

    /// Overwrite the given `fields` of `self` with the values from `other`.
    pub fn apply(&mut self, other: &UserData, fields: &[UserDataField]) {
        for field in fields {
            match field {
                UserDataField::TenantMembership => {
                    self.tenant_membership = other.tenant_membership.clone()
                }
                UserDataField::DebugOtpCode => self.debug_otp_code = other.debug_otp_code.clone(),
                UserDataField::PasswordHash => self.password_hash = other.password_hash.clone(),
            }
        }
    }
}
