//! Bearer token validation.

use jsonwebtoken::{
    decode, encode, get_current_timestamp, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Default lifetime of tokens minted by [`JwtValidator::issue`].
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Token validation errors.
#[derive(Debug, Error)]
pub enum TokenError {
    /// Token was empty or whitespace.
    #[error("Token is blank")]
    Blank,

    /// Token carries no subject.
    #[error("Token has no subject")]
    MissingSubject,

    /// Signature, format or claims are invalid.
    #[error("Invalid token: {0}")]
    Invalid(String),

    /// No signing secret was configured.
    #[error("JWT secret is not configured")]
    MissingSecret,

    /// Token could not be minted.
    #[error("Failed to issue token: {0}")]
    Issue(String),
}

/// Validates bearer tokens and extracts the user they were issued to.
pub trait TokenValidator: Send + Sync {
    /// Extract the user id from a token.
    ///
    /// # Errors
    ///
    /// Returns an error if the token is blank, malformed, forged or has no
    /// subject. Expiry is reported separately by
    /// [`is_token_expired`](Self::is_token_expired).
    fn extract_user_id(&self, token: &str) -> Result<String, TokenError>;

    /// Whether the token is expired. Tokens that cannot be read count as
    /// expired.
    fn is_token_expired(&self, token: &str) -> bool;

    /// Whether the token belongs to `user_id` and has not expired.
    fn is_token_valid(&self, token: &str, user_id: &str) -> bool {
        match self.extract_user_id(token) {
            Ok(subject) => subject == user_id && !self.is_token_expired(token),
            Err(_) => false,
        }
    }
}

/// JWT claims.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID).
    pub sub: String,
    /// Issued at (Unix timestamp).
    pub iat: u64,
    /// Expiration time (Unix timestamp).
    pub exp: u64,
}

/// HS256 JWT validator.
#[derive(Clone)]
pub struct JwtValidator {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    token_ttl: Duration,
}

impl JwtValidator {
    /// Create a validator for tokens signed with `secret`.
    ///
    /// # Errors
    ///
    /// Returns `TokenError::MissingSecret` if the secret is blank.
    pub fn new(secret: &str) -> Result<Self, TokenError> {
        if secret.trim().is_empty() {
            return Err(TokenError::MissingSecret);
        }

        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry is checked by `is_token_expired` so that an expired token
        // still yields its subject.
        validation.validate_exp = false;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            token_ttl: DEFAULT_TOKEN_TTL,
        })
    }

    /// Set the lifetime of issued tokens.
    #[must_use]
    pub fn with_token_ttl(mut self, ttl: Duration) -> Self {
        self.token_ttl = ttl;
        self
    }

    /// Mint a token for `user_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn issue(&self, user_id: &str) -> Result<String, TokenError> {
        let exp = get_current_timestamp() + self.token_ttl.as_secs();
        self.issue_with_expiry(user_id, exp)
    }

    /// Mint a token for `user_id` expiring at the given Unix timestamp.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn issue_with_expiry(&self, user_id: &str, exp: u64) -> Result<String, TokenError> {
        let claims = Claims {
            sub: user_id.to_string(),
            iat: get_current_timestamp(),
            exp,
        };
        self.encode_claims(&claims)
    }

    /// Sign arbitrary claims.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode_claims(&self, claims: &Claims) -> Result<String, TokenError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key)
            .map_err(|e| TokenError::Issue(e.to_string()))
    }

    /// Verify the signature and decode the claims without checking expiry.
    ///
    /// # Errors
    ///
    /// Returns an error if the token is blank or fails verification.
    pub fn decode_claims(&self, token: &str) -> Result<Claims, TokenError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(TokenError::Blank);
        }
        decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| TokenError::Invalid(e.to_string()))
    }
}

impl TokenValidator for JwtValidator {
    fn extract_user_id(&self, token: &str) -> Result<String, TokenError> {
        let claims = self.decode_claims(token)?;
        if claims.sub.trim().is_empty() {
            return Err(TokenError::MissingSubject);
        }
        Ok(claims.sub)
    }

    fn is_token_expired(&self, token: &str) -> bool {
        match self.decode_claims(token) {
            Ok(claims) => claims.exp <= get_current_timestamp(),
            Err(_) => true,
        }
    }
}

impl std::fmt::Debug for JwtValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtValidator")
            .field("token_ttl", &self.token_ttl)
            .finish_non_exhaustive()
    }
}
