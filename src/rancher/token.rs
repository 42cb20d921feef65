use crate::errors::{Error, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, Semaphore};
use tokio::time::{Duration, Instant};
use tracing::{debug, info};

/// Rancher login tokens live for at least 12 hours; renew one hour early so
/// in-flight calls never race the expiry.
const TOKEN_LIFETIME: Duration = Duration::from_secs(12 * 60 * 60);
const RENEWAL_MARGIN: Duration = Duration::from_secs(60 * 60);

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
    #[serde(rename = "responseType")]
    response_type: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    token: String,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

impl CachedToken {
    fn is_valid(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

/// Automatically refreshed login token derived from (username, password).
///
/// Refreshes go through a single-permit semaphore: callers that find the
/// token expired acquire the permit, re-check under it, and only the first
/// one performs the login round trip.
pub struct TokenCache {
    login_url: String,
    username: String,
    password: String,
    http: reqwest::Client,
    token: RwLock<Option<CachedToken>>,
    refresh_permit: Semaphore,
}

impl TokenCache {
    pub fn new(base_url: &str, username: String, password: String, http: reqwest::Client) -> Self {
        TokenCache {
            login_url: format!(
                "{}/v3-public/localProviders/local?action=login",
                base_url.trim_end_matches('/')
            ),
            username,
            password,
            http,
            token: RwLock::new(None),
            refresh_permit: Semaphore::new(1),
        }
    }

    /// Current bearer token, refreshed when expired
    pub async fn bearer(&self) -> Result<String> {
        if let Some(cached) = self.token.read().await.as_ref() {
            if cached.is_valid() {
                return Ok(cached.value.clone());
            }
        }

        let _permit = self
            .refresh_permit
            .acquire()
            .await
            .map_err(|_| Error::Internal("token refresh semaphore closed".to_string()))?;

        // another caller may have refreshed while we waited for the permit
        if let Some(cached) = self.token.read().await.as_ref() {
            if cached.is_valid() {
                debug!("token already refreshed by a concurrent caller");
                return Ok(cached.value.clone());
            }
        }

        let token = self.login().await?;
        *self.token.write().await = Some(CachedToken {
            value: token.clone(),
            expires_at: Instant::now() + TOKEN_LIFETIME - RENEWAL_MARGIN,
        });
        Ok(token)
    }

    async fn login(&self) -> Result<String> {
        info!(username = self.username, "logging into Rancher");
        let response = self
            .http
            .post(&self.login_url)
            .json(&LoginRequest {
                username: &self.username,
                password: &self.password,
                response_type: "token",
            })
            .send()
            .await
            .map_err(Error::Http)?;

        if !response.status().is_success() {
            return Err(Error::Auth(format!(
                "login returned {} for user '{}'",
                response.status(),
                self.username
            )));
        }

        let login: LoginResponse = response.json().await.map_err(Error::Http)?;
        Ok(login.token)
    }
}
