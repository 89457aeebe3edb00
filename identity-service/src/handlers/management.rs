//! Management API. Requests are authenticated by the signature middleware,
//! so invitations here are issued with root authority.

use service_core::{
    axum::{extract::State, http::StatusCode, response::IntoResponse, Json},
    error::AppError,
};

use crate::{
    dtos::invitation::{InvitationResponse, ManagementInvitationRequest, ResetTokenRequest},
    utils::ValidatedJson,
    AppState,
};

pub async fn create_invitation(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<ManagementInvitationRequest>,
) -> Result<impl IntoResponse, AppError> {
    let controller = state.identity.controller()?;
    let ctx = state.request_context();

    let send_email = req.invitation.send_email;
    let invite = controller
        .invite(&ctx, &req.app_id, None, req.invitation.into(), send_email)
        .await?;

    tracing::info!(
        invite_id = %invite.id,
        app_id = %req.app_id,
        audit = "management_invitation",
        "Management invitation issued"
    );
    Ok((StatusCode::CREATED, Json(InvitationResponse::from(invite))))
}

/// Mint a password reset token for a user and email the link.
pub async fn create_reset_token(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<ResetTokenRequest>,
) -> Result<impl IntoResponse, AppError> {
    let controller = state.identity.controller()?;
    let ctx = state.request_context();

    let reset = controller
        .send_password_reset_email(&ctx, &req.user_id, &req.app_id)
        .await?;

    tracing::info!(
        user_id = %req.user_id,
        app_id = %req.app_id,
        audit = "management_reset_token",
        "Management reset token issued"
    );
    Ok(Json(reset))
}
