use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    Engine,
};
use chrono::Utc;
use jsonwebtoken::{
    decode, encode, errors::ErrorKind as JwtErrorKind, DecodingKey, EncodingKey, Header,
    Validation,
};
use rsa::{
    pkcs1::DecodeRsaPublicKey, pkcs8::DecodePublicKey, traits::PublicKeyParts, RsaPublicKey,
};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use uuid::Uuid;

use super::error::{InvalidReason, KeyError, TokenError};
use super::keys::{KeyPair, SigningAlgorithm};
use crate::models::{TokenType, User};

/// Issuer and default lifetimes, in seconds.
#[derive(Debug, Clone)]
pub struct TokenConfig {
    pub issuer: String,
    pub key_id: Option<String>,
    pub access_ttl_seconds: i64,
    pub refresh_ttl_seconds: i64,
    pub id_ttl_seconds: i64,
    pub invite_ttl_seconds: i64,
    pub reset_ttl_seconds: i64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            issuer: "http://localhost:8080".to_string(),
            key_id: None,
            access_ttl_seconds: 30 * 60,
            refresh_ttl_seconds: 30 * 24 * 60 * 60,
            id_ttl_seconds: 30 * 60,
            invite_ttl_seconds: 7 * 24 * 60 * 60,
            reset_ttl_seconds: 2 * 60 * 60,
        }
    }
}

impl TokenConfig {
    fn default_lifetime(&self, token_type: TokenType) -> i64 {
        match token_type {
            TokenType::Access => self.access_ttl_seconds,
            TokenType::Refresh => self.refresh_ttl_seconds,
            TokenType::Id => self.id_ttl_seconds,
            TokenType::Invite => self.invite_ttl_seconds,
            TokenType::Reset => self.reset_ttl_seconds,
        }
    }
}

/// Registered claims plus the token type and a flattened payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default)]
    pub sub: String,
    #[serde(default)]
    pub iss: String,
    #[serde(default, deserialize_with = "one_or_many")]
    pub aud: Vec<String>,
    pub exp: i64,
    pub iat: i64,
    #[serde(rename = "type")]
    pub token_type: TokenType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(aud) => vec![aud],
        OneOrMany::Many(aud) => aud,
    })
}

/// A minted or parsed token. Parsed tokens remember their compact form so
/// they can be validated later.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub claims: Claims,
    raw: Option<String>,
}

impl Token {
    /// Override the lifetime counted from `iat`. `None` keeps the default.
    pub fn with_lifetime(mut self, seconds: Option<i64>) -> Self {
        if let Some(seconds) = seconds {
            self.claims.exp = self.claims.iat + seconds;
        }
        self
    }

    pub fn token_type(&self) -> TokenType {
        self.claims.token_type
    }

    pub fn id(&self) -> Option<&str> {
        self.claims.jti.as_deref()
    }

    pub fn subject(&self) -> &str {
        &self.claims.sub
    }

    pub fn raw(&self) -> Option<&str> {
        self.raw.as_deref()
    }

    pub fn lifetime_seconds(&self) -> i64 {
        self.claims.exp - self.claims.iat
    }
}

/// User attributes the requested scopes entitle a token to carry.
pub fn fieldset_for_scopes(user: &User, scopes: &[String]) -> Map<String, Value> {
    let mut fields = Map::new();
    for scope in scopes {
        match scope.as_str() {
            "email" => {
                fields.insert("email".into(), Value::String(user.email.clone()));
            }
            "phone" => {
                fields.insert(
                    "phone_number".into(),
                    Value::String(user.phone_number.clone()),
                );
            }
            "profile" => {
                fields.insert("username".into(), Value::String(user.username.clone()));
                fields.insert("given_name".into(), Value::String(user.given_name.clone()));
                fields.insert("locale".into(), Value::String(user.locale.clone()));
            }
            "roles" => {
                fields.insert(
                    "access_role".into(),
                    Value::String(user.access_role.clone()),
                );
                fields.insert("scopes".into(), serde_json::json!(user.scopes));
            }
            _ => {}
        }
    }
    fields
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonWebKey {
    pub kty: String,
    #[serde(rename = "use")]
    pub key_use: String,
    pub alg: String,
    pub kid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonWebKeySet {
    pub keys: Vec<JsonWebKey>,
}

impl JsonWebKeySet {
    pub fn find_key(&self, kid: &str) -> Option<&JsonWebKey> {
        self.keys.iter().find(|k| k.kid == kid)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenIdConfiguration {
    pub issuer: String,
    pub jwks_uri: String,
    pub token_endpoint: String,
    pub id_token_signing_alg_values_supported: Vec<String>,
    pub subject_types_supported: Vec<String>,
    pub scopes_supported: Vec<String>,
}

/// Mints, signs, parses and validates tokens.
#[derive(Clone)]
pub struct TokenService {
    config: TokenConfig,
    algorithm: SigningAlgorithm,
    key_id: String,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    jwk: JsonWebKey,
}

impl TokenService {
    pub fn new(config: TokenConfig, keys: &KeyPair) -> Result<Self, KeyError> {
        let algorithm = keys.algorithm;
        let (encoding_key, decoding_key) = match algorithm {
            SigningAlgorithm::RS256 => (
                EncodingKey::from_rsa_pem(keys.private_pem.as_bytes())
                    .map_err(|e| KeyError::Parse(format!("private key: {}", e)))?,
                DecodingKey::from_rsa_pem(keys.public_pem.as_bytes())
                    .map_err(|e| KeyError::Parse(format!("public key: {}", e)))?,
            ),
            SigningAlgorithm::ES256 => (
                EncodingKey::from_ec_pem(keys.private_pem.as_bytes())
                    .map_err(|e| KeyError::Parse(format!("private key: {}", e)))?,
                DecodingKey::from_ec_pem(keys.public_pem.as_bytes())
                    .map_err(|e| KeyError::Parse(format!("public key: {}", e)))?,
            ),
        };

        let key_id = config
            .key_id
            .clone()
            .filter(|kid| !kid.is_empty())
            .unwrap_or_else(|| derive_key_id(&keys.public_pem));
        let jwk = public_jwk(algorithm, &key_id, &keys.public_pem)?;

        tracing::info!(
            algorithm = algorithm.as_str(),
            kid = %key_id,
            issuer = %config.issuer,
            "Token service initialized"
        );

        Ok(Self {
            config,
            algorithm,
            key_id,
            encoding_key,
            decoding_key,
            jwk,
        })
    }

    pub fn algorithm(&self) -> SigningAlgorithm {
        self.algorithm
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn issuer(&self) -> &str {
        &self.config.issuer
    }

    /// Build an unsigned token. `user` is the subject, except for invite
    /// tokens where it is the inviter.
    pub fn new_token(
        &self,
        token_type: TokenType,
        user: &User,
        audience: &str,
        scopes: &[String],
        extra_claims: Map<String, Value>,
    ) -> Token {
        let now = Utc::now().timestamp();
        let mut payload = Map::new();

        match token_type {
            TokenType::Access | TokenType::Id => {
                payload.extend(fieldset_for_scopes(user, scopes));
                payload.extend(extra_claims);
            }
            TokenType::Refresh | TokenType::Invite => payload.extend(extra_claims),
            TokenType::Reset => {}
        }

        let claims = Claims {
            sub: user.id.clone(),
            iss: self.config.issuer.clone(),
            aud: vec![audience.to_string()],
            exp: now + self.config.default_lifetime(token_type),
            iat: now,
            token_type,
            jti: token_type.has_id().then(|| Uuid::new_v4().to_string()),
            payload,
        };

        Token { claims, raw: None }
    }

    /// Compact JWS with `alg` and `kid` in the header.
    pub fn sign_token(&self, token: &Token) -> Result<String, TokenError> {
        let mut header = Header::new(self.algorithm.jwt_algorithm());
        header.kid = Some(self.key_id.clone());
        encode(&header, &token.claims, &self.encoding_key)
            .map_err(|e| TokenError::Signing(e.to_string()))
    }

    /// Decode without checking the signature or any claim.
    pub fn parse(&self, raw: &str) -> Result<Token, TokenError> {
        let mut validation = Validation::new(self.algorithm.jwt_algorithm());
        validation.insecure_disable_signature_validation();
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        let data = decode::<Claims>(raw, &DecodingKey::from_secret(&[]), &validation)
            .map_err(|e| TokenError::Parse(e.to_string()))?;

        Ok(Token {
            claims: data.claims,
            raw: Some(raw.to_string()),
        })
    }

    /// Check signature, expiry, issuer, audience and type. No leeway.
    pub fn validate(
        &self,
        token: &Token,
        expected_audience: &str,
        expected_issuer: &str,
        expected_type: TokenType,
    ) -> Result<Claims, TokenError> {
        self.check(token, expected_audience, expected_issuer, expected_type, true)
    }

    fn check(
        &self,
        token: &Token,
        expected_audience: &str,
        expected_issuer: &str,
        expected_type: TokenType,
        check_expiry: bool,
    ) -> Result<Claims, TokenError> {
        let raw = token
            .raw
            .as_deref()
            .ok_or(TokenError::Invalid(InvalidReason::Malformed))?;

        let mut validation = Validation::new(self.algorithm.jwt_algorithm());
        validation.leeway = 0;
        validation.validate_exp = check_expiry;
        validation.set_audience(&[expected_audience]);
        validation.set_issuer(&[expected_issuer]);
        validation.required_spec_claims =
            HashSet::from(["exp", "iss", "aud", "sub"].map(String::from));

        let data = decode::<Claims>(raw, &self.decoding_key, &validation).map_err(|e| {
            let reason = match e.kind() {
                JwtErrorKind::InvalidSignature | JwtErrorKind::InvalidAlgorithm => {
                    InvalidReason::Signature
                }
                JwtErrorKind::ExpiredSignature => InvalidReason::Expired,
                JwtErrorKind::InvalidIssuer => InvalidReason::Issuer,
                JwtErrorKind::InvalidAudience => InvalidReason::Audience,
                _ => InvalidReason::Malformed,
            };
            TokenError::Invalid(reason)
        })?;

        if data.claims.token_type != expected_type {
            return Err(TokenError::Invalid(InvalidReason::Type));
        }

        Ok(data.claims)
    }

    /// Parse then validate in one step.
    pub fn parse_and_validate(
        &self,
        raw: &str,
        expected_audience: &str,
        expected_type: TokenType,
    ) -> Result<Token, TokenError> {
        let token = self.parse(raw)?;
        self.validate(&token, expected_audience, &self.config.issuer, expected_type)?;
        Ok(token)
    }

    /// Like [`Self::parse_and_validate`] but accepts an expired token. Used
    /// where a token is being retired rather than honoured.
    pub fn parse_and_validate_allow_expired(
        &self,
        raw: &str,
        expected_audience: &str,
        expected_type: TokenType,
    ) -> Result<Token, TokenError> {
        let token = self.parse(raw)?;
        self.check(&token, expected_audience, &self.config.issuer, expected_type, false)?;
        Ok(token)
    }

    pub fn jwks(&self) -> JsonWebKeySet {
        JsonWebKeySet {
            keys: vec![self.jwk.clone()],
        }
    }

    pub fn discovery(&self, base_url: &str) -> OpenIdConfiguration {
        let base = base_url.trim_end_matches('/');
        OpenIdConfiguration {
            issuer: self.config.issuer.clone(),
            jwks_uri: format!("{}/.well-known/jwks.json", base),
            token_endpoint: format!("{}/auth/token", base),
            id_token_signing_alg_values_supported: vec![self.algorithm.as_str().to_string()],
            subject_types_supported: vec!["public".to_string()],
            scopes_supported: ["openid", "offline", "email", "phone", "profile", "roles"]
                .map(String::from)
                .to_vec(),
        }
    }
}

fn derive_key_id(public_pem: &str) -> String {
    let digest = Sha256::digest(public_pem.trim().as_bytes());
    hex::encode(&digest[..8])
}

fn pem_body(pem: &str) -> Result<Vec<u8>, KeyError> {
    let body: String = pem
        .lines()
        .filter(|line| !line.starts_with("-----"))
        .map(str::trim)
        .collect();
    STANDARD
        .decode(body)
        .map_err(|e| KeyError::Parse(format!("public key PEM: {}", e)))
}

fn public_jwk(
    algorithm: SigningAlgorithm,
    key_id: &str,
    public_pem: &str,
) -> Result<JsonWebKey, KeyError> {
    let mut jwk = JsonWebKey {
        kty: String::new(),
        key_use: "sig".to_string(),
        alg: algorithm.as_str().to_string(),
        kid: key_id.to_string(),
        n: None,
        e: None,
        crv: None,
        x: None,
        y: None,
    };

    match algorithm {
        SigningAlgorithm::RS256 => {
            let key = RsaPublicKey::from_public_key_pem(public_pem)
                .or_else(|_| RsaPublicKey::from_pkcs1_pem(public_pem))
                .map_err(|e| KeyError::Parse(format!("RSA public key: {}", e)))?;
            jwk.kty = "RSA".to_string();
            jwk.n = Some(URL_SAFE_NO_PAD.encode(key.n().to_bytes_be()));
            jwk.e = Some(URL_SAFE_NO_PAD.encode(key.e().to_bytes_be()));
        }
        SigningAlgorithm::ES256 => {
            // SPKI for P-256 ends with the 65 byte uncompressed point 0x04 || x || y.
            let der = pem_body(public_pem)?;
            if der.len() < 65 || der[der.len() - 65] != 0x04 {
                return Err(KeyError::Parse(
                    "EC public key is not an uncompressed P-256 point".into(),
                ));
            }
            let point = &der[der.len() - 65..];
            jwk.kty = "EC".to_string();
            jwk.crv = Some("P-256".to_string());
            jwk.x = Some(URL_SAFE_NO_PAD.encode(&point[1..33]));
            jwk.y = Some(URL_SAFE_NO_PAD.encode(&point[33..65]));
        }
    }

    Ok(jwk)
}
