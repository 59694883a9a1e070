//! Request authentication
//!
//! The [`SecureGate`] resolves every protected request to an [`Identity`]
//! before any handler runs. Credentials come from the session cookie or an
//! `Authorization: Bearer` header and are checked by pluggable
//! [`CredentialValidator`]s.

use crate::config::AuthConfig;
use crate::error::{json_error_response, GatewayErrorCode};
use crate::router::AuthMode;
use chrono::{Duration, Utc};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{AUTHORIZATION, COOKIE, LOCATION};
use hyper::{HeaderMap, Response, StatusCode, Uri};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// An authenticated principal
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity(Arc<str>);

impl Identity {
    pub fn new(name: &str) -> Self {
        Self(Arc::from(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Rendering usable in file names: anything outside `[A-Za-z0-9_-]`
    /// becomes `_`.
    pub fn file_safe(&self) -> String {
        self.0
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect()
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AuthFailure {
    #[error("no credential presented")]
    Missing,
    #[error("credential rejected")]
    Invalid,
    #[error("credential expired")]
    Expired,
}

/// Maps a raw credential to the identity it authenticates
pub trait CredentialValidator: Send + Sync {
    fn validate(&self, credential: &str) -> Result<Identity, AuthFailure>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: i64,
    pub iat: i64,
}

/// HS256-signed session tokens
#[derive(Clone)]
pub struct JwtValidator {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    token_expiry_hours: i64,
}

impl JwtValidator {
    pub fn new(secret: &str, token_expiry_hours: i64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            token_expiry_hours,
        }
    }

    pub fn create_token(&self, user: &str) -> Result<String, jsonwebtoken::errors::Error> {
        self.create_token_with_ttl(user, Duration::hours(self.token_expiry_hours))
    }

    pub fn create_token_with_ttl(
        &self,
        user: &str,
        ttl: Duration,
    ) -> Result<String, jsonwebtoken::errors::Error> {
        let now = Utc::now();
        let claims = Claims {
            sub: user.to_string(),
            exp: (now + ttl).timestamp(),
            iat: now.timestamp(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
    }

    pub fn verify_token(&self, token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
        let validation = Validation::new(Algorithm::HS256);
        decode::<Claims>(token, &self.decoding_key, &validation).map(|data| data.claims)
    }
}

impl CredentialValidator for JwtValidator {
    fn validate(&self, credential: &str) -> Result<Identity, AuthFailure> {
        match self.verify_token(credential) {
            Ok(claims) if !claims.sub.is_empty() => Ok(Identity::new(&claims.sub)),
            Ok(_) => Err(AuthFailure::Invalid),
            Err(e) if matches!(e.kind(), ErrorKind::ExpiredSignature) => Err(AuthFailure::Expired),
            Err(_) => Err(AuthFailure::Invalid),
        }
    }
}

/// Fixed bearer tokens for service accounts
pub struct StaticTokenValidator {
    tokens: Vec<(String, Identity)>,
}

impl StaticTokenValidator {
    pub fn new(tokens: &HashMap<String, String>) -> Self {
        Self {
            tokens: tokens
                .iter()
                .map(|(token, user)| (token.clone(), Identity::new(user)))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl CredentialValidator for StaticTokenValidator {
    fn validate(&self, credential: &str) -> Result<Identity, AuthFailure> {
        // Every entry is compared so timing does not reveal which one matched
        let mut found = None;
        for (token, identity) in &self.tokens {
            if constant_time_compare(token, credential) && found.is_none() {
                found = Some(identity.clone());
            }
        }
        found.ok_or(AuthFailure::Invalid)
    }
}

fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}

/// Resolves requests to identities and renders authentication failures
pub struct SecureGate {
    validators: Vec<Arc<dyn CredentialValidator>>,
    cookie_name: String,
    cookie_secure: bool,
    login_url: String,
}

impl SecureGate {
    pub fn new(validators: Vec<Arc<dyn CredentialValidator>>, config: &AuthConfig) -> Self {
        Self {
            validators,
            cookie_name: config.cookie_name.clone(),
            cookie_secure: config.cookie_secure,
            login_url: config.login_url.clone(),
        }
    }

    /// Gate with the JWT validator (and static tokens, when configured)
    pub fn from_config(config: &AuthConfig) -> Self {
        let secret = config.secret.clone().unwrap_or_else(|| {
            warn!("No auth secret configured, generated a random one; sessions will not survive a restart");
            uuid::Uuid::new_v4().to_string()
        });

        let mut validators: Vec<Arc<dyn CredentialValidator>> =
            vec![Arc::new(JwtValidator::new(&secret, config.token_expiry_hours))];

        let static_tokens = StaticTokenValidator::new(&config.tokens);
        if !static_tokens.is_empty() {
            validators.push(Arc::new(static_tokens));
        }

        Self::new(validators, config)
    }

    pub fn login_url(&self) -> &str {
        &self.login_url
    }

    /// Resolve the request's credential to an identity. An explicit
    /// `Authorization: Bearer` header wins over the session cookie.
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<Identity, AuthFailure> {
        let credential = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(extract_token_from_header)
            .or_else(|| {
                headers
                    .get_all(COOKIE)
                    .iter()
                    .filter_map(|v| v.to_str().ok())
                    .find_map(|v| self.extract_token_from_cookie(v))
            })
            .ok_or(AuthFailure::Missing)?;

        let mut failure = AuthFailure::Invalid;
        for validator in &self.validators {
            match validator.validate(&credential) {
                Ok(identity) => return Ok(identity),
                Err(AuthFailure::Expired) => failure = AuthFailure::Expired,
                Err(_) => {}
            }
        }

        debug!(reason = %failure, "Authentication failed");
        Err(failure)
    }

    /// Response for a request that failed authentication on a route with `mode`
    pub fn reject(&self, mode: AuthMode, uri: &Uri) -> Response<BoxBody<Bytes, hyper::Error>> {
        match mode {
            AuthMode::Redirect => {
                let app_uri = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
                let location = format!("{}?appUri={}", self.login_url, urlencoding::encode(app_uri));

                Response::builder()
                    .status(StatusCode::FOUND)
                    .header(LOCATION, location)
                    .header(hyper::header::CONTENT_TYPE, "text/plain")
                    .body(
                        Full::new(Bytes::from("Redirecting to sign in"))
                            .map_err(|never| match never {})
                            .boxed(),
                    )
                    .expect("valid response builder")
            }
            AuthMode::Reject | AuthMode::Public => {
                json_error_response(GatewayErrorCode::Unauthenticated, "Authentication required")
            }
        }
    }

    /// Expires the session cookie in the browser
    pub fn create_logout_cookie(&self) -> String {
        let mut cookie = format!("{}=; Path=/; Max-Age=0; HttpOnly", self.cookie_name);
        if self.cookie_secure {
            cookie.push_str("; Secure");
        }
        cookie.push_str("; SameSite=Strict");
        cookie
    }

    fn extract_token_from_cookie(&self, cookie_header: &str) -> Option<String> {
        for cookie in cookie_header.split(';') {
            let cookie = cookie.trim();
            if let Some(value) = cookie.strip_prefix(&format!("{}=", self.cookie_name)) {
                if !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
        None
    }
}

fn extract_token_from_header(auth_header: &str) -> Option<String> {
    auth_header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}
