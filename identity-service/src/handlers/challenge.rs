//! Passwordless login: OTP and magic link challenges.

use service_core::{
    axum::{extract::State, http::StatusCode, response::IntoResponse, Json},
    error::AppError,
};

use crate::{
    dtos::auth::{ChallengeRequestBody, ChallengeResponse, VerifyChallengeRequest},
    middleware::{AppId, UserAgent},
    services::{ChallengeRequest, ChallengeVerification},
    utils::ValidatedJson,
    AppState,
};

pub async fn request_challenge(
    State(state): State<AppState>,
    AppId(app_id): AppId,
    UserAgent(user_agent): UserAgent,
    ValidatedJson(req): ValidatedJson<ChallengeRequestBody>,
) -> Result<impl IntoResponse, AppError> {
    let controller = state.identity.controller()?;
    let ctx = state.request_context();

    let issued = controller
        .request_challenge(
            &ctx,
            ChallengeRequest {
                app_id,
                strategy: req.strategy.into(),
                identity_value: req.value,
                locale: req.locale,
                device_id: req.device_id,
                user_agent,
                user_code_challenge: req.code_challenge,
            },
        )
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(ChallengeResponse {
            challenge_id: issued.challenge_id,
            expires_at: issued.expires_at,
            expires_mins: issued.expires_mins,
        }),
    ))
}

pub async fn verify_challenge(
    State(state): State<AppState>,
    AppId(app_id): AppId,
    UserAgent(user_agent): UserAgent,
    ValidatedJson(req): ValidatedJson<VerifyChallengeRequest>,
) -> Result<impl IntoResponse, AppError> {
    let controller = state.identity.controller()?;
    let ctx = state.request_context();

    let verification = ChallengeVerification {
        app_id,
        strategy: req.strategy.into(),
        identity_value: req.value,
        code: req.code,
        locale: req.locale,
        device_id: req.device_id,
        user_agent,
        user_code_verifier: req.code_verifier,
    };
    let tokens = controller
        .login_with_challenge(&ctx, verification, &req.scopes)
        .await?;

    Ok(Json(tokens))
}
