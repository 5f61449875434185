//! OAuth access tokens for the FCM HTTP v1 API.
//!
//! A service-account assertion (RS256 JWT) is exchanged at the Google token
//! endpoint for a short-lived bearer token, which is cached and reused by all
//! concurrent sends until shortly before it expires.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use relay_common::config::FirebaseCredentials;
use relay_common::error::RelayError;

pub const FIREBASE_MESSAGING_SCOPE: &str = "https://www.googleapis.com/auth/firebase.messaging";

/// Assertions are valid for one hour, the maximum Google accepts.
const ASSERTION_LIFETIME_SECS: i64 = 3600;

/// Refresh this long before the cached token actually expires.
const REFRESH_MARGIN_SECS: i64 = 60;

/// Source of bearer tokens for push API calls.
#[async_trait]
pub trait AccessTokenSource: Send + Sync {
    async fn access_token(&self) -> Result<String, RelayError>;
}

/// JWT claims of a service-account assertion.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AssertionClaims {
    pub iss: String,
    pub scope: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

impl CachedToken {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now + Duration::seconds(REFRESH_MARGIN_SECS) < self.expires_at
    }
}

/// Service-account token source with an in-process cache.
pub struct ServiceAccountTokenSource {
    http: reqwest::Client,
    client_email: String,
    token_uri: String,
    key: EncodingKey,
    cached: RwLock<Option<CachedToken>>,
}

impl ServiceAccountTokenSource {
    /// Fails fast when the private key is not a valid RSA PEM.
    pub fn new(http: reqwest::Client, credentials: &FirebaseCredentials) -> Result<Self, RelayError> {
        let key = EncodingKey::from_rsa_pem(credentials.private_key.as_bytes())
            .map_err(|e| RelayError::Auth(format!("Invalid service account private key: {}", e)))?;

        Ok(Self {
            http,
            client_email: credentials.client_email.clone(),
            token_uri: credentials.token_uri.clone(),
            key,
            cached: RwLock::new(None),
        })
    }

    /// Build the claims of a fresh assertion issued at `now`.
    pub fn assertion_claims(&self, now: DateTime<Utc>) -> AssertionClaims {
        AssertionClaims {
            iss: self.client_email.clone(),
            scope: FIREBASE_MESSAGING_SCOPE.to_string(),
            aud: self.token_uri.clone(),
            iat: now.timestamp(),
            exp: now.timestamp() + ASSERTION_LIFETIME_SECS,
        }
    }

    async fn fetch(&self) -> Result<CachedToken, RelayError> {
        let now = Utc::now();
        let assertion = encode(
            &Header::new(Algorithm::RS256),
            &self.assertion_claims(now),
            &self.key,
        )
        .map_err(|e| RelayError::Auth(format!("Failed to sign assertion: {}", e)))?;

        let response = self
            .http
            .post(&self.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::Auth(format!(
                "Token exchange failed ({}): {}",
                status, body
            )));
        }

        let token: TokenResponse = response.json().await?;
        tracing::debug!(expires_in = token.expires_in, "Fetched FCM access token");

        Ok(CachedToken {
            token: token.access_token,
            expires_at: now + Duration::seconds(token.expires_in),
        })
    }
}

#[async_trait]
impl AccessTokenSource for ServiceAccountTokenSource {
    async fn access_token(&self) -> Result<String, RelayError> {
        if let Some(cached) = self.cached.read().await.as_ref()
            && cached.is_fresh(Utc::now())
        {
            return Ok(cached.token.clone());
        }

        let mut slot = self.cached.write().await;
        // Another task may have refreshed while we waited for the lock
        if let Some(cached) = slot.as_ref()
            && cached.is_fresh(Utc::now())
        {
            return Ok(cached.token.clone());
        }

        let fresh = self.fetch().await?;
        let token = fresh.token.clone();
        *slot = Some(fresh);
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials(private_key: &str) -> FirebaseCredentials {
        FirebaseCredentials {
            project_id: "chat-app".to_string(),
            client_email: "relay@chat-app.iam.gserviceaccount.com".to_string(),
            private_key: private_key.to_string(),
            token_uri: "https://oauth2.googleapis.com/token".to_string(),
        }
    }

    #[test]
    fn test_invalid_private_key_rejected() {
        let result = ServiceAccountTokenSource::new(reqwest::Client::new(), &credentials("not a pem"));
        assert!(matches!(result, Err(RelayError::Auth(_))));
    }

    #[test]
    fn test_cached_token_freshness() {
        let now = Utc::now();
        let token = CachedToken {
            token: "ya29.token".to_string(),
            expires_at: now + Duration::seconds(3599),
        };
        assert!(token.is_fresh(now));
        // Inside the refresh margin counts as expired
        assert!(!token.is_fresh(now + Duration::seconds(3550)));
        assert!(!token.is_fresh(now + Duration::seconds(4000)));
    }
}
