//! Dual-mode authentication: signed bearer tokens take precedence, a static
//! API key is the fallback, and with neither configured the gateway runs
//! open. Open mode is for local development only and must be called out in
//! deployment docs.

use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use mesh_core::auth::{AuthContext, AuthMethod};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;

pub const API_KEY_HEADER: &str = "x-api-key";

/// Scope required to mint new tokens with an existing token.
pub const SCOPE_TOKEN_ISSUE: &str = "token:issue";

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    iss: String,
    aud: String,
    sub: String,
    exp: u64,
    iat: u64,
    #[serde(default)]
    scopes: Vec<String>,
}

#[derive(Clone)]
pub struct AuthGateway {
    api_key: Option<String>,
    jwt_secret: Option<String>,
    issuer: String,
    audience: String,
    token_ttl_secs: u64,
}

impl AuthGateway {
    pub fn new(
        api_key: Option<String>,
        jwt_secret: Option<String>,
        issuer: String,
        audience: String,
        token_ttl_secs: u64,
    ) -> Self {
        Self {
            api_key,
            jwt_secret,
            issuer,
            audience,
            token_ttl_secs,
        }
    }

    fn bearer_token(headers: &HeaderMap) -> Result<Option<String>, ApiError> {
        let Some(value) = headers.get(AUTHORIZATION) else {
            return Ok(None);
        };
        let value = value
            .to_str()
            .map_err(|_| ApiError::Unauthorized("invalid Authorization header".into()))?;
        let mut parts = value.split_whitespace();
        match (parts.next(), parts.next(), parts.next()) {
            (Some(scheme), Some(token), None) if scheme.eq_ignore_ascii_case("bearer") => {
                Ok(Some(token.to_string()))
            }
            _ => Err(ApiError::Unauthorized("invalid Authorization header".into())),
        }
    }

    fn validation(&self) -> Validation {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);
        validation.set_required_spec_claims(&["exp", "iat", "sub", "iss", "aud"]);
        validation
    }

    fn decode_claims(&self, token: &str) -> Result<Claims, ApiError> {
        let secret = self
            .jwt_secret
            .as_deref()
            .ok_or_else(|| ApiError::Unauthorized("invalid token".into()))?;
        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &self.validation(),
        )
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                ApiError::Unauthorized("token expired".into())
            }
            _ => ApiError::Unauthorized("invalid token".into()),
        })?;
        Ok(data.claims)
    }

    /// Resolve an identity from request headers, enforcing `required_scopes`
    /// for bearer tokens. The static key, when it matches, is
    /// full-privilege; scope checks apply to tokens only.
    pub fn authenticate(
        &self,
        headers: &HeaderMap,
        required_scopes: &[&str],
    ) -> Result<AuthContext, ApiError> {
        if let Some(token) = Self::bearer_token(headers)? {
            let claims = self.decode_claims(&token)?;
            let ctx = AuthContext {
                method: AuthMethod::Bearer,
                subject: Some(claims.sub),
                scopes: claims.scopes,
            };
            if !ctx.has_scopes(required_scopes) {
                return Err(ApiError::Forbidden("insufficient scope".into()));
            }
            return Ok(ctx);
        }

        if let Some(expected) = &self.api_key {
            let presented = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok());
            if presented != Some(expected.as_str()) {
                return Err(ApiError::Unauthorized("invalid API key".into()));
            }
            return Ok(AuthContext {
                method: AuthMethod::ApiKey,
                subject: Some("api_key".into()),
                scopes: Vec::new(),
            });
        }

        // Open mode: no credential configured.
        Ok(AuthContext::open())
    }

    /// Sign a token for `subject` with the configured lifetime. The caller
    /// is responsible for authorizing the issuance itself.
    pub fn issue_token(
        &self,
        subject: &str,
        scopes: Vec<String>,
        now: u64,
    ) -> Result<(String, u64), ApiError> {
        let secret = self
            .jwt_secret
            .as_deref()
            .ok_or_else(|| ApiError::Internal("token signing not configured".into()))?;
        let claims = Claims {
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            sub: subject.to_string(),
            exp: now + self.token_ttl_secs,
            iat: now,
            scopes,
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .map_err(|e| ApiError::Internal(format!("token signing failed: {e}")))?;
        Ok((token, self.token_ttl_secs))
    }

    /// Authorize a token-issue request: a bearer token needs the
    /// `token:issue` scope, otherwise the static key must match exactly.
    pub fn authorize_issue(&self, headers: &HeaderMap) -> Result<(), ApiError> {
        if Self::bearer_token(headers)?.is_some() {
            self.authenticate(headers, &[SCOPE_TOKEN_ISSUE])?;
            return Ok(());
        }
        let presented = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok());
        match &self.api_key {
            Some(expected) if presented == Some(expected.as_str()) => Ok(()),
            _ => Err(ApiError::Unauthorized("unauthorized".into())),
        }
    }

    /// Verified token subject, with all errors suppressed. Used for
    /// rate-limit bucketing and log identity.
    pub fn peek_subject(&self, headers: &HeaderMap) -> Option<String> {
        let token = Self::bearer_token(headers).ok().flatten()?;
        self.decode_claims(&token).ok().map(|c| c.sub)
    }

    /// Best-effort identity label for request logs; never the raw key.
    pub fn identity_label(&self, headers: &HeaderMap) -> Option<String> {
        if let Some(sub) = self.peek_subject(headers) {
            return Some(format!("jwt:{sub}"));
        }
        headers.get(API_KEY_HEADER).map(|_| "api".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn gateway(api_key: Option<&str>, secret: Option<&str>) -> AuthGateway {
        AuthGateway::new(
            api_key.map(str::to_string),
            secret.map(str::to_string),
            "orchestrator".into(),
            "orchestrator".into(),
            3600,
        )
    }

    fn bearer_headers(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        headers
    }

    fn now() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs()
    }

    #[test]
    fn open_mode_allows_anonymous_requests() {
        let gw = gateway(None, None);
        let ctx = gw.authenticate(&HeaderMap::new(), &[]).unwrap();
        assert_eq!(ctx.method, AuthMethod::None);
    }

    #[test]
    fn api_key_mode_rejects_missing_and_wrong_keys() {
        let gw = gateway(Some("secret"), None);
        assert!(matches!(
            gw.authenticate(&HeaderMap::new(), &[]),
            Err(ApiError::Unauthorized(_))
        ));

        let mut headers = HeaderMap::new();
        headers.insert(API_KEY_HEADER, HeaderValue::from_static("wrong"));
        assert!(matches!(
            gw.authenticate(&headers, &[]),
            Err(ApiError::Unauthorized(_))
        ));

        let mut headers = HeaderMap::new();
        headers.insert(API_KEY_HEADER, HeaderValue::from_static("secret"));
        let ctx = gw.authenticate(&headers, &["job:create"]).unwrap();
        assert_eq!(ctx.method, AuthMethod::ApiKey);
    }

    #[test]
    fn issued_token_round_trips_with_scopes() {
        let gw = gateway(None, Some("jwt-secret"));
        let (token, ttl) = gw
            .issue_token("alice", vec!["job:create".into()], now())
            .unwrap();
        assert_eq!(ttl, 3600);

        let ctx = gw
            .authenticate(&bearer_headers(&token), &["job:create"])
            .unwrap();
        assert_eq!(ctx.method, AuthMethod::Bearer);
        assert_eq!(ctx.subject.as_deref(), Some("alice"));
    }

    #[test]
    fn missing_scope_is_forbidden_not_unauthorized() {
        let gw = gateway(None, Some("jwt-secret"));
        let (token, _) = gw.issue_token("alice", vec![], now()).unwrap();
        assert!(matches!(
            gw.authenticate(&bearer_headers(&token), &["round:start"]),
            Err(ApiError::Forbidden(_))
        ));
    }

    #[test]
    fn expired_token_is_unauthorized() {
        let gw = gateway(None, Some("jwt-secret"));
        // Issue far enough in the past that exp is behind now even with leeway.
        let (token, _) = gw.issue_token("alice", vec![], now() - 8000).unwrap();
        assert!(matches!(
            gw.authenticate(&bearer_headers(&token), &[]),
            Err(ApiError::Unauthorized(msg)) if msg == "token expired"
        ));
    }

    #[test]
    fn token_signed_with_other_secret_is_rejected() {
        let other = gateway(None, Some("different"));
        let (token, _) = other.issue_token("mallory", vec![], now()).unwrap();

        let gw = gateway(None, Some("jwt-secret"));
        assert!(matches!(
            gw.authenticate(&bearer_headers(&token), &[]),
            Err(ApiError::Unauthorized(msg)) if msg == "invalid token"
        ));
    }

    #[test]
    fn issue_authorization_requires_key_or_scope() {
        let gw = gateway(Some("secret"), Some("jwt-secret"));
        assert!(gw.authorize_issue(&HeaderMap::new()).is_err());

        let mut headers = HeaderMap::new();
        headers.insert(API_KEY_HEADER, HeaderValue::from_static("secret"));
        assert!(gw.authorize_issue(&headers).is_ok());

        let (plain, _) = gw.issue_token("alice", vec![], now()).unwrap();
        assert!(gw.authorize_issue(&bearer_headers(&plain)).is_err());

        let (privileged, _) = gw
            .issue_token("alice", vec![SCOPE_TOKEN_ISSUE.into()], now())
            .unwrap();
        assert!(gw.authorize_issue(&bearer_headers(&privileged)).is_ok());
    }
}
