use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::models::{Invite, TenantMemberships};
use crate::services::tenant::is_claim_segment;
use crate::services::InvitationRequest;

fn validate_claim_segment(id: &str) -> Result<(), ValidationError> {
    if is_claim_segment(id) {
        Ok(())
    } else {
        let mut error = ValidationError::new("claim_segment");
        error.message = Some("Must not contain ':'".into());
        Err(error)
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateInvitationRequest {
    #[validate(
        length(min = 1, message = "Tenant is required"),
        custom(function = "validate_claim_segment")
    )]
    pub tenant: String,

    #[serde(default)]
    pub tenant_name: String,

    #[validate(
        length(min = 1, message = "Group is required"),
        custom(function = "validate_claim_segment")
    )]
    pub group: String,

    #[validate(length(min = 1, message = "At least one role is required"))]
    pub roles: Vec<String>,

    #[serde(default)]
    pub email: String,

    /// Email the invitation link right away.
    #[serde(default)]
    pub send_email: bool,
}

impl From<CreateInvitationRequest> for InvitationRequest {
    fn from(req: CreateInvitationRequest) -> Self {
        InvitationRequest {
            tenant: req.tenant,
            tenant_name: req.tenant_name,
            group: req.group,
            roles: req.roles,
            email: req.email,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct InvitationResponse {
    pub id: String,
    pub token: String,
    pub tenant: String,
    pub group: String,
    pub roles: Vec<String>,
    pub email: String,
    pub expires_at: DateTime<Utc>,
}

impl From<Invite> for InvitationResponse {
    fn from(invite: Invite) -> Self {
        InvitationResponse {
            id: invite.id,
            token: invite.token,
            tenant: invite.tenant,
            group: invite.group,
            roles: invite
                .role
                .split(',')
                .filter(|r| !r.is_empty())
                .map(str::to_string)
                .collect(),
            email: invite.email,
            expires_at: invite.expires_at,
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct AcceptInvitationRequest {
    #[validate(length(min = 1, message = "Token is required"))]
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct AcceptInvitationResponse {
    pub tenant_membership: TenantMemberships,
}

/// Management API: invitation on behalf of the service itself.
#[derive(Debug, Deserialize, Validate)]
pub struct ManagementInvitationRequest {
    #[validate(length(min = 1, message = "App id is required"))]
    pub app_id: String,

    #[serde(flatten)]
    #[validate(nested)]
    pub invitation: CreateInvitationRequest,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ResetTokenRequest {
    #[validate(length(min = 1, message = "App id is required"))]
    pub app_id: String,

    #[validate(length(min = 1, message = "User id is required"))]
    pub user_id: String,
}
