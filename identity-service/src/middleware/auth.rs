use service_core::{
    axum::{
        async_trait,
        extract::FromRequestParts,
        http::{header, request::Parts},
    },
    error::AppError,
};

pub const APP_ID_HEADER: &str = "x-app-id";

/// The calling app, from the `X-App-ID` header.
#[derive(Debug, Clone)]
pub struct AppId(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for AppId
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(APP_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| AppId(value.to_string()))
            .ok_or_else(|| AppError::BadRequest(anyhow::anyhow!("Missing X-App-ID header")))
    }
}

/// Raw bearer token from the `Authorization` header. Validation is up to the
/// handler, which knows the audience.
#[derive(Debug, Clone)]
pub struct BearerToken(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for BearerToken
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(|token| BearerToken(token.to_string()))
            .ok_or_else(|| {
                AppError::Unauthorized(anyhow::anyhow!("Missing or invalid Authorization header"))
            })
    }
}

/// Client user agent, empty when absent.
#[derive(Debug, Clone, Default)]
pub struct UserAgent(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for UserAgent
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(UserAgent(
            parts
                .headers
                .get(header::USER_AGENT)
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default()
                .to_string(),
        ))
    }
}
