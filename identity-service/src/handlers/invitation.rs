use service_core::{
    axum::{extract::State, http::StatusCode, response::IntoResponse, Json},
    error::AppError,
};

use crate::{
    dtos::invitation::{
        AcceptInvitationRequest, AcceptInvitationResponse, CreateInvitationRequest,
        InvitationResponse,
    },
    middleware::{AppId, BearerToken},
    utils::ValidatedJson,
    AppState,
};

/// Invite someone into a tenant the caller manages.
pub async fn create_invitation(
    State(state): State<AppState>,
    AppId(app_id): AppId,
    BearerToken(access_token): BearerToken,
    ValidatedJson(req): ValidatedJson<CreateInvitationRequest>,
) -> Result<impl IntoResponse, AppError> {
    let controller = state.identity.controller()?;
    let ctx = state.request_context();

    let claims = controller
        .authenticate_access_token(&ctx, &access_token, &app_id)
        .await?;
    let send_email = req.send_email;
    let invite = controller
        .invite(&ctx, &app_id, Some(&claims.sub), req.into(), send_email)
        .await?;

    Ok((StatusCode::CREATED, Json(InvitationResponse::from(invite))))
}

/// Redeem an invitation for the authenticated user.
pub async fn accept_invitation(
    State(state): State<AppState>,
    AppId(app_id): AppId,
    BearerToken(access_token): BearerToken,
    ValidatedJson(req): ValidatedJson<AcceptInvitationRequest>,
) -> Result<impl IntoResponse, AppError> {
    let controller = state.identity.controller()?;
    let ctx = state.request_context();

    let claims = controller
        .authenticate_access_token(&ctx, &access_token, &app_id)
        .await?;
    let tenant_membership = controller
        .add_user_to_tenant_with_invitation_token(&ctx, &app_id, &claims.sub, &req.token)
        .await?;

    Ok(Json(AcceptInvitationResponse { tenant_membership }))
}
