//! Connection upgrade authentication.
//!
//! The token is looked up in this order:
//!
//! 1. query parameter `token`
//! 2. query parameter `access_token`
//! 3. `Authorization: Bearer <token>` header
//!
//! Query keys match case-insensitively, blank values are skipped and the
//! last non-blank occurrence of a key wins.

use super::token::{TokenError, TokenValidator};
use super::Principal;
use percent_encoding::percent_decode_str;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

const BEARER_PREFIX: &str = "Bearer ";

/// Why an upgrade was refused.
#[derive(Debug, Error)]
pub enum HandshakeRejected {
    /// No token in the query string or headers.
    #[error("No bearer token supplied")]
    MissingToken,

    /// Token failed validation.
    #[error("Invalid token: {0}")]
    InvalidToken(#[from] TokenError),

    /// Token is past its expiry.
    #[error("Token has expired")]
    Expired,
}

/// Admits or rejects connection upgrades.
#[derive(Clone)]
pub struct HandshakeAuthenticator {
    validator: Arc<dyn TokenValidator>,
}

impl HandshakeAuthenticator {
    /// Create an authenticator backed by `validator`.
    #[must_use]
    pub fn new(validator: Arc<dyn TokenValidator>) -> Self {
        Self { validator }
    }

    /// Authenticate an upgrade request from its raw query string and
    /// `Authorization` header.
    ///
    /// # Errors
    ///
    /// Returns `HandshakeRejected` if no token is found, the token is
    /// invalid or it has expired. No connection may be admitted then.
    pub fn authenticate(
        &self,
        query: Option<&str>,
        authorization: Option<&str>,
    ) -> Result<Principal, HandshakeRejected> {
        let result = self.validate(query, authorization);
        match &result {
            Ok(principal) => debug!(user = %principal, "Handshake accepted"),
            Err(e) => warn!(error = %e, "Handshake rejected"),
        }
        result
    }

    fn validate(
        &self,
        query: Option<&str>,
        authorization: Option<&str>,
    ) -> Result<Principal, HandshakeRejected> {
        let token = resolve_token(query, authorization).ok_or(HandshakeRejected::MissingToken)?;

        let user_id = self.validator.extract_user_id(&token)?;
        if self.validator.is_token_expired(&token) {
            return Err(HandshakeRejected::Expired);
        }
        Ok(Principal::new(user_id))
    }
}

/// Find the bearer token in an upgrade request.
#[must_use]
pub fn resolve_token(query: Option<&str>, authorization: Option<&str>) -> Option<String> {
    if let Some(query) = query {
        let token = query_param(query, "token").or_else(|| query_param(query, "access_token"));
        if token.is_some() {
            return token;
        }
    }

    authorization
        .and_then(|value| value.strip_prefix(BEARER_PREFIX))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}

/// Last non-blank value of `name` in a query string.
fn query_param(query: &str, name: &str) -> Option<String> {
    query
        .trim_start_matches('?')
        .split('&')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            if !form_decode(key).eq_ignore_ascii_case(name) {
                return None;
            }
            let value = form_decode(value);
            let value = value.trim();
            (!value.is_empty()).then(|| value.to_string())
        })
        .last()
}

fn form_decode(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    percent_decode_str(&spaced).decode_utf8_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::token::JwtValidator;
    use jsonwebtoken::get_current_timestamp;

    fn authenticator() -> (HandshakeAuthenticator, JwtValidator) {
        let jwt = JwtValidator::new("handshake-secret").unwrap();
        (HandshakeAuthenticator::new(Arc::new(jwt.clone())), jwt)
    }

    #[test]
    fn test_query_token_admitted() {
        let (auth, jwt) = authenticator();
        let token = jwt.issue("user-1").unwrap();

        let principal = auth
            .authenticate(Some(&format!("token={token}")), None)
            .unwrap();
        assert_eq!(principal.name(), "user-1");
    }

    #[test]
    fn test_expired_token_rejected() {
        let (auth, jwt) = authenticator();
        let token = jwt
            .issue_with_expiry("user-1", get_current_timestamp() - 1)
            .unwrap();

        let result = auth.authenticate(Some(&format!("token={token}")), None);
        assert!(matches!(result, Err(HandshakeRejected::Expired)));
    }

    #[test]
    fn test_missing_token_rejected() {
        let (auth, _) = authenticator();
        assert!(matches!(
            auth.authenticate(None, None),
            Err(HandshakeRejected::MissingToken)
        ));
        assert!(matches!(
            auth.authenticate(Some("token=&access_token=%20"), Some("Basic abc")),
            Err(HandshakeRejected::MissingToken)
        ));
    }

    #[test]
    fn test_invalid_token_rejected() {
        let (auth, _) = authenticator();
        let result = auth.authenticate(Some("token=garbage"), None);
        assert!(matches!(result, Err(HandshakeRejected::InvalidToken(_))));
    }

    #[test]
    fn test_bearer_header_fallback() {
        let (auth, jwt) = authenticator();
        let token = jwt.issue("user-2").unwrap();

        let principal = auth
            .authenticate(Some("foo=bar"), Some(&format!("Bearer {token}")))
            .unwrap();
        assert_eq!(principal.name(), "user-2");
    }

    #[test]
    fn test_resolution_order() {
        assert_eq!(
            resolve_token(Some("access_token=b&token=a"), Some("Bearer c")).as_deref(),
            Some("a")
        );
        assert_eq!(
            resolve_token(Some("access_token=b"), Some("Bearer c")).as_deref(),
            Some("b")
        );
        assert_eq!(resolve_token(Some(""), Some("Bearer c")).as_deref(), Some("c"));
        assert_eq!(resolve_token(None, Some("c")), None);
    }

    #[test]
    fn test_query_decoding() {
        assert_eq!(
            resolve_token(Some("?TOKEN=a%2Eb+c&token="), None).as_deref(),
            Some("a.b c")
        );
        assert_eq!(
            resolve_token(Some("token=first&token=second"), None).as_deref(),
            Some("second")
        );
    }
}
