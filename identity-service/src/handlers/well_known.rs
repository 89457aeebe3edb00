use crate::AppState;
use service_core::{
    axum::{extract::State, http::header, response::IntoResponse, Json},
    error::AppError,
};

/// Public signing key as a JWKS document.
pub async fn jwks(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let jwks = state.identity.controller()?.token_service().jwks();
    Ok((
        [
            (header::CONTENT_TYPE, "application/json"),
            (header::CACHE_CONTROL, "public, max-age=3600"),
        ],
        Json(jwks),
    ))
}

pub async fn openid_configuration(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let discovery = state
        .identity
        .controller()?
        .token_service()
        .discovery(&state.public_base_url);
    Ok((
        [(header::CACHE_CONTROL, "public, max-age=3600")],
        Json(discovery),
    ))
}
