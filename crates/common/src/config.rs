use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Largest recipient count FCM accepts for one multicast-style batch.
pub const MAX_DISPATCH_BATCH_SIZE: usize = 500;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string for the watched document store
    pub database_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Redis connection string. When unset, invalid tokens are only logged.
    pub redis_url: Option<String>,

    /// Redis list that receives invalid-token records
    pub invalid_token_queue_key: String,

    /// Firebase service account credentials
    pub firebase: FirebaseCredentials,

    /// FCM API base URL (default: https://fcm.googleapis.com)
    pub fcm_base_url: String,

    /// Maximum in-flight FCM sends while fanning out one batch
    pub fcm_max_concurrency: usize,

    /// Tokens per dispatch batch, capped at `MAX_DISPATCH_BATCH_SIZE`
    pub dispatch_batch_size: usize,

    /// Age after which another worker's claim may be taken over (0 = never)
    pub claim_ttl_seconds: u64,

    pub notification_default_title: String,
    pub notification_default_body: String,

    /// Android notification channel id attached to every push
    pub android_channel_id: Option<String>,
}

/// Service-account credentials used to mint FCM access tokens.
#[derive(Clone, Deserialize)]
pub struct FirebaseCredentials {
    pub project_id: String,
    pub client_email: String,
    /// PEM-encoded RSA private key with real newlines
    pub private_key: String,
    /// OAuth token endpoint (default: https://oauth2.googleapis.com/token)
    pub token_uri: String,
}

impl std::fmt::Debug for FirebaseCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FirebaseCredentials")
            .field("project_id", &self.project_id)
            .field("client_email", &self.client_email)
            .field("private_key", &"<redacted>")
            .field("token_uri", &self.token_uri)
            .finish()
    }
}

impl AppConfig {
    /// Load configuration from the process environment (and `.env`, if present).
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let dispatch_batch_size: usize = parse_or(&lookup, "DISPATCH_BATCH_SIZE", 500)?;
        if dispatch_batch_size == 0 || dispatch_batch_size > MAX_DISPATCH_BATCH_SIZE {
            return Err(ConfigError::Invalid {
                var: "DISPATCH_BATCH_SIZE",
                reason: format!("must be between 1 and {}", MAX_DISPATCH_BATCH_SIZE),
            });
        }

        let fcm_max_concurrency: usize = parse_or(&lookup, "FCM_MAX_CONCURRENCY", 32)?;
        if fcm_max_concurrency == 0 {
            return Err(ConfigError::Invalid {
                var: "FCM_MAX_CONCURRENCY",
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            database_url: required(&lookup, "DATABASE_URL")?,
            db_max_connections: parse_or(&lookup, "DB_MAX_CONNECTIONS", 20)?,
            redis_url: optional(&lookup, "REDIS_URL"),
            invalid_token_queue_key: optional(&lookup, "INVALID_TOKEN_QUEUE_KEY")
                .unwrap_or_else(|| "push:invalid_tokens".to_string()),
            firebase: FirebaseCredentials {
                project_id: required(&lookup, "FIREBASE_PROJECT_ID")?,
                client_email: required(&lookup, "FIREBASE_CLIENT_EMAIL")?,
                private_key: unescape_private_key(&required(&lookup, "FIREBASE_PRIVATE_KEY")?),
                token_uri: optional(&lookup, "GOOGLE_TOKEN_URI")
                    .unwrap_or_else(|| "https://oauth2.googleapis.com/token".to_string()),
            },
            fcm_base_url: optional(&lookup, "FCM_BASE_URL")
                .unwrap_or_else(|| "https://fcm.googleapis.com".to_string()),
            fcm_max_concurrency,
            dispatch_batch_size,
            claim_ttl_seconds: parse_or(&lookup, "CLAIM_TTL_SECONDS", 300)?,
            notification_default_title: optional(&lookup, "NOTIFICATION_DEFAULT_TITLE")
                .unwrap_or_else(|| "New message".to_string()),
            notification_default_body: optional(&lookup, "NOTIFICATION_DEFAULT_BODY")
                .unwrap_or_else(|| "You have a new message".to_string()),
            android_channel_id: optional(&lookup, "ANDROID_CHANNEL_ID"),
        })
    }

    /// Claim staleness window, `None` when takeover is disabled.
    pub fn claim_ttl(&self) -> Option<Duration> {
        (self.claim_ttl_seconds > 0).then(|| Duration::from_secs(self.claim_ttl_seconds))
    }
}

/// Private keys pasted into env files usually carry literal `\n` sequences.
pub fn unescape_private_key(raw: &str) -> String {
    raw.replace("\\n", "\n")
}

fn required<F>(lookup: &F, var: &'static str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    optional(lookup, var).ok_or(ConfigError::Missing(var))
}

fn optional<F>(lookup: &F, var: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(var).filter(|v| !v.trim().is_empty())
}

fn parse_or<F, T>(lookup: &F, var: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional(lookup, var) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}
