//! Drive credentials
//!
//! A service account signs a short-lived RS256 assertion and trades it at the
//! key's token endpoint for an hour-long access token. The token is cached and
//! exchanged again shortly before it expires.

use crate::{CacheError, Result};
use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

pub const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive.file";

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;
/// Tokens are refreshed this long before the provider says they expire
const REFRESH_MARGIN: Duration = Duration::from_secs(120);

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

/// The fields of a `credentials.json` service-account key that signing needs.
#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

impl std::fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("client_email", &self.client_email)
            .field("token_uri", &self.token_uri)
            .finish_non_exhaustive()
    }
}

impl ServiceAccountKey {
    pub async fn from_file(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path).await?;
        serde_json::from_str(&raw).map_err(|e| {
            CacheError::Config(format!("invalid service account key {}: {e}", path.display()))
        })
    }
}

#[derive(Debug, Serialize, PartialEq, Eq)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Clone)]
pub struct CachedToken {
    value: String,
    refresh_at: Instant,
}

/// Where the bearer token for each Drive call comes from.
pub enum DriveAuth {
    Static(String),
    ServiceAccount {
        key: ServiceAccountKey,
        cached: Mutex<Option<CachedToken>>,
    },
}

impl DriveAuth {
    pub fn service_account(key: ServiceAccountKey) -> Self {
        Self::ServiceAccount {
            key,
            cached: Mutex::new(None),
        }
    }

    fn assertion(key: &ServiceAccountKey, now: i64) -> Result<String> {
        let claims = AssertionClaims {
            iss: &key.client_email,
            scope: DRIVE_SCOPE,
            aud: &key.token_uri,
            iat: now,
            exp: now + ASSERTION_LIFETIME_SECS,
        };
        let signing_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(|e| CacheError::Config(format!("service account private key: {e}")))?;
        encode(&Header::new(Algorithm::RS256), &claims, &signing_key)
            .map_err(|e| CacheError::Remote(format!("sign assertion: {e}")))
    }

    /// Returns a usable bearer token, exchanging a fresh assertion when the cached one is stale.
    pub async fn bearer(&self, client: &reqwest::Client) -> Result<String> {
        let (key, cached) = match self {
            DriveAuth::Static(token) => return Ok(token.clone()),
            DriveAuth::ServiceAccount { key, cached } => (key, cached),
        };

        // Held across the exchange so concurrent callers share one refresh.
        let mut cached = cached.lock().await;
        if let Some(token) = cached.as_ref().filter(|t| Instant::now() < t.refresh_at) {
            return Ok(token.value.clone());
        }

        debug!(target: "remote", account = %key.client_email, "Exchanging service account assertion");
        let assertion = Self::assertion(key, Utc::now().timestamp())?;
        let response = client
            .post(&key.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await
            .map_err(|e| CacheError::Remote(format!("token exchange: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(200).collect();
            return Err(CacheError::Remote(format!(
                "token exchange: HTTP {status}: {snippet}"
            )));
        }
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| CacheError::Remote(format!("token decode: {e}")))?;

        let refresh_at = Instant::now()
            + Duration::from_secs(token.expires_in).saturating_sub(REFRESH_MARGIN);
        info!(target: "remote", expires_in = token.expires_in, "Drive access token refreshed");
        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            refresh_at,
        });
        Ok(token.access_token)
    }
}
