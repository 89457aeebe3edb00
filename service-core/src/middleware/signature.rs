use crate::error::AppError;
use crate::utils::signature::{body_md5, verify_signature, SignedParts, DIGEST_PREFIX};
use async_trait::async_trait;
use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderMap},
    middleware::Next,
    response::Response,
};
use chrono::{DateTime, Utc};
use http_body_util::BodyExt;
use subtle::ConstantTimeEq;

pub const KEY_ID_HEADER: &str = "x-key-id";
pub const DIGEST_HEADER: &str = "digest";
pub const CONTENT_MD5_HEADER: &str = "content-md5";
pub const EXPIRES_HEADER: &str = "expires";

/// Resolves the shared secret for a management key id.
#[async_trait]
pub trait SigningKeyStore: Send + Sync {
    async fn signing_secret(&self, key_id: &str) -> Result<Option<Vec<u8>>, AppError>;
}

/// Rejects management requests that are unsigned, expired, malformed, or
/// whose body or signature does not match.
pub async fn signature_validation_middleware<S>(
    State(store): State<S>,
    req: Request,
    next: Next,
) -> Result<Response, AppError>
where
    S: SigningKeyStore + Clone + Send + Sync + 'static,
{
    let headers = req.headers();

    let digest = get_header(headers, DIGEST_HEADER)?;
    let signature = digest
        .strip_prefix(DIGEST_PREFIX)
        .ok_or_else(|| unauthorized("Unsupported digest algorithm"))?
        .to_string();
    let key_id = get_header(headers, KEY_ID_HEADER)?;
    let date = get_header(headers, header::DATE.as_str())?;
    let expires = get_header(headers, EXPIRES_HEADER)?;
    let content_md5 = get_header(headers, CONTENT_MD5_HEADER)?;
    let host = get_header(headers, header::HOST.as_str())?;
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    parse_http_date(&date)?;
    let expires_at = parse_http_date(&expires)?;
    if expires_at < Utc::now() {
        return Err(unauthorized("Request expired"));
    }

    let secret = store
        .signing_secret(&key_id)
        .await?
        .ok_or_else(|| unauthorized("Unknown key id"))?;

    let (parts, body) = req.into_parts();
    let bytes = body
        .collect()
        .await
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("Failed to read body: {}", e)))?
        .to_bytes();

    let computed_md5 = body_md5(&bytes);
    if !bool::from(computed_md5.as_bytes().ct_eq(content_md5.as_bytes())) {
        return Err(unauthorized("Content-MD5 mismatch"));
    }

    let signed = SignedParts {
        method: parts.method.as_str(),
        body_md5: &content_md5,
        content_type: &content_type,
        date: &date,
        expires: &expires,
        host: &host,
    };

    let is_valid = verify_signature(&secret, &signed, &signature).map_err(|e| {
        AppError::InternalError(anyhow::anyhow!("Signature verification error: {}", e))
    })?;

    if !is_valid {
        tracing::warn!(key_id = %key_id, "Rejected management request with bad signature");
        return Err(unauthorized("Invalid signature"));
    }

    let req = Request::from_parts(parts, Body::from(bytes));
    Ok(next.run(req).await)
}

fn parse_http_date(value: &str) -> Result<DateTime<Utc>, AppError> {
    DateTime::parse_from_rfc2822(value)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|_| unauthorized("Malformed date header"))
}

fn get_header(headers: &HeaderMap, key: &str) -> Result<String, AppError> {
    headers
        .get(key)
        .ok_or_else(|| AppError::Unauthorized(anyhow::anyhow!("Missing header: {}", key)))?
        .to_str()
        .map(|s| s.to_string())
        .map_err(|_| AppError::Unauthorized(anyhow::anyhow!("Invalid header format: {}", key)))
}

fn unauthorized(msg: &'static str) -> AppError {
    AppError::Unauthorized(anyhow::anyhow!(msg))
}
