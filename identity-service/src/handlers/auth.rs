use service_core::{
    axum::{extract::State, http::StatusCode, response::IntoResponse, Json},
    error::AppError,
};

use crate::{
    dtos::auth::{
        LoginRequest, MessageResponse, PasswordResetConfirm, PasswordResetRequest,
        RegisterRequest, TokenRequest,
    },
    middleware::AppId,
    services::{NewUserRequest, Password},
    utils::ValidatedJson,
    AppState,
};

pub async fn login(
    State(state): State<AppState>,
    AppId(app_id): AppId,
    ValidatedJson(req): ValidatedJson<LoginRequest>,
) -> Result<impl IntoResponse, AppError> {
    let controller = state.identity.controller()?;
    let ctx = state.request_context();

    let tokens = controller
        .login_with_password(
            &ctx,
            &app_id,
            req.identity,
            &req.value,
            Password::new(req.password),
            &req.scopes,
        )
        .await
        .map_err(|e| {
            tracing::info!(error = %e, app_id = %app_id, "Password login rejected");
            e
        })?;

    Ok(Json(tokens))
}

pub async fn register(
    State(state): State<AppState>,
    AppId(app_id): AppId,
    ValidatedJson(req): ValidatedJson<RegisterRequest>,
) -> Result<impl IntoResponse, AppError> {
    let controller = state.identity.controller()?;
    let ctx = state.request_context();

    let request = NewUserRequest {
        username: req.username,
        email: req.email,
        phone_number: req.phone_number,
        given_name: req.given_name,
        locale: req.locale,
        password: Password::new(req.password),
    };
    let tokens = controller
        .register_with_password(&ctx, &app_id, request, &req.scopes)
        .await?;

    Ok((StatusCode::CREATED, Json(tokens)))
}

/// Refresh token rotation.
pub async fn token(
    State(state): State<AppState>,
    AppId(app_id): AppId,
    ValidatedJson(req): ValidatedJson<TokenRequest>,
) -> Result<impl IntoResponse, AppError> {
    let controller = state.identity.controller()?;
    let ctx = state.request_context();

    let tokens = controller
        .refresh_jwt_token(
            &ctx,
            &req.refresh_token,
            req.access_token.as_deref(),
            &app_id,
            &req.scopes,
        )
        .await?;

    Ok(Json(tokens))
}

pub async fn request_password_reset(
    State(state): State<AppState>,
    AppId(app_id): AppId,
    ValidatedJson(req): ValidatedJson<PasswordResetRequest>,
) -> Result<impl IntoResponse, AppError> {
    let controller = state.identity.controller()?;
    let ctx = state.request_context();

    controller
        .request_password_reset(&ctx, &app_id, &req.email)
        .await
        .map_err(|e| {
            tracing::error!(
                error = %e,
                app_id = %app_id,
                "Failed to process password reset request"
            );
            e
        })?;

    Ok(Json(MessageResponse::new(
        "If your email is registered, you will receive a password reset link shortly.",
    )))
}

pub async fn reset_password(
    State(state): State<AppState>,
    AppId(app_id): AppId,
    ValidatedJson(req): ValidatedJson<PasswordResetConfirm>,
) -> Result<impl IntoResponse, AppError> {
    let controller = state.identity.controller()?;
    let ctx = state.request_context();

    controller
        .reset_password(&ctx, &app_id, &req.token, Password::new(req.new_password))
        .await?;

    Ok(Json(MessageResponse::new(
        "Password reset successful. You can now login with your new password.",
    )))
}
