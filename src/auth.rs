//! Authentication configuration and header resolution.
//!
//! An [`AuthConfig`] describes how to authenticate the run's requests.
//! Static variants (bearer token, API key) resolve to headers by template
//! substitution alone. OAuth2 variants fetch a bearer token from the
//! configured token endpoint and cache it until shortly before expiry.
//! The jwt variant signs a token locally. Any string field may contain
//! template placeholders.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::debug;

use crate::errors::AuthError;
use crate::templating::TemplateEngine;

/// Authentication configuration, tagged by `type` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthConfig {
    BearerToken {
        token: String,
    },
    ApiKey {
        key: String,
        #[serde(default = "default_api_key_header")]
        header_name: String,
    },
    Oauth2ClientCredentials {
        token_url: String,
        client_id: String,
        client_secret: String,
        #[serde(default)]
        scope: Option<String>,
    },
    Oauth2PasswordGrant {
        token_url: String,
        client_id: String,
        username: String,
        password: String,
        #[serde(default)]
        scope: Option<String>,
    },
    Jwt {
        secret: String,
        #[serde(default = "default_jwt_algorithm")]
        algorithm: String,
        #[serde(default)]
        issuer: Option<String>,
        #[serde(default)]
        subject: Option<String>,
        #[serde(default)]
        audience: Option<String>,
        #[serde(default)]
        claims: HashMap<String, Value>,
        #[serde(default = "default_jwt_expires")]
        expires_in_seconds: u64,
    },
}

fn default_api_key_header() -> String {
    "X-API-Key".to_string()
}

fn default_jwt_algorithm() -> String {
    "HS256".to_string()
}

fn default_jwt_expires() -> u64 {
    3600
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// TTL-aware in-memory store of OAuth2 bearer tokens.
///
/// Entries are stored with a refresh buffer subtracted from the reported
/// lifetime so tokens are refreshed before they actually expire. Stale
/// entries are evicted on lookup. Concurrent first fetches for the same
/// key are not coalesced; the last writer wins.
#[derive(Debug, Default)]
pub struct TokenCache {
    entries: Mutex<HashMap<String, CachedToken>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// A cached token, if present and not yet expired.
    pub async fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get(key) {
            if entry.expires_at > Instant::now() {
                return Some(entry.token.clone());
            }
            entries.remove(key);
        }
        None
    }

    /// Cache a token for `expires_in` seconds, minus the refresh buffer
    /// `min(30, expires_in / 10)`.
    pub async fn set(&self, key: &str, token: String, expires_in: u64) {
        let buffer = 30.min(expires_in / 10);
        let expires_at = Instant::now() + Duration::from_secs(expires_in - buffer);
        let mut entries = self.entries.lock().await;
        entries.insert(key.to_string(), CachedToken { token, expires_at });
    }

    /// Drop one entry, or everything when `key` is `None`.
    pub async fn clear(&self, key: Option<&str>) {
        let mut entries = self.entries.lock().await;
        match key {
            Some(key) => {
                entries.remove(key);
            }
            None => entries.clear(),
        }
    }
}

/// Resolves an [`AuthConfig`] to request headers, handling template
/// substitution, OAuth2 token acquisition, and JWT signing.
pub struct AuthProvider {
    templates: Arc<TemplateEngine>,
    client: reqwest::Client,
    token_cache: TokenCache,
}

impl AuthProvider {
    pub fn new(templates: Arc<TemplateEngine>, client: reqwest::Client) -> Self {
        Self {
            templates,
            client,
            token_cache: TokenCache::new(),
        }
    }

    /// Resolve the config to the headers added to every request of the run.
    pub async fn headers(&self, config: &AuthConfig) -> Result<HashMap<String, String>, AuthError> {
        match config {
            AuthConfig::BearerToken { token } => {
                let token = self.templates.substitute(token, 0);
                Ok(bearer_header(&token))
            }
            AuthConfig::ApiKey { key, header_name } => {
                let key = self.templates.substitute(key, 0);
                let header_name = self.templates.substitute(header_name, 0);
                Ok(HashMap::from([(header_name, key)]))
            }
            AuthConfig::Oauth2ClientCredentials {
                token_url,
                client_id,
                client_secret,
                scope,
            } => {
                let cache_key = format!("oauth2_cc:{}:{}", token_url, client_id);
                if let Some(token) = self.token_cache.get(&cache_key).await {
                    return Ok(bearer_header(&token));
                }

                let mut form = vec![
                    ("grant_type".to_string(), "client_credentials".to_string()),
                    ("client_id".to_string(), self.templates.substitute(client_id, 0)),
                    ("client_secret".to_string(), self.templates.substitute(client_secret, 0)),
                ];
                if let Some(scope) = scope {
                    form.push(("scope".to_string(), self.templates.substitute(scope, 0)));
                }

                let token_url = self.templates.substitute(token_url, 0);
                let (token, expires_in) = self.fetch_token(&token_url, &form).await?;
                self.token_cache.set(&cache_key, token.clone(), expires_in).await;
                Ok(bearer_header(&token))
            }
            AuthConfig::Oauth2PasswordGrant {
                token_url,
                client_id,
                username,
                password,
                scope,
            } => {
                let cache_key = format!("oauth2_pw:{}:{}:{}", token_url, client_id, username);
                if let Some(token) = self.token_cache.get(&cache_key).await {
                    return Ok(bearer_header(&token));
                }

                let mut form = vec![
                    ("grant_type".to_string(), "password".to_string()),
                    ("client_id".to_string(), self.templates.substitute(client_id, 0)),
                    ("username".to_string(), self.templates.substitute(username, 0)),
                    ("password".to_string(), self.templates.substitute(password, 0)),
                ];
                if let Some(scope) = scope {
                    form.push(("scope".to_string(), self.templates.substitute(scope, 0)));
                }

                let token_url = self.templates.substitute(token_url, 0);
                let (token, expires_in) = self.fetch_token(&token_url, &form).await?;
                self.token_cache.set(&cache_key, token.clone(), expires_in).await;
                Ok(bearer_header(&token))
            }
            AuthConfig::Jwt {
                secret,
                algorithm,
                issuer,
                subject,
                audience,
                claims,
                expires_in_seconds,
            } => self.jwt_headers(
                secret,
                algorithm,
                issuer.as_deref(),
                subject.as_deref(),
                audience.as_deref(),
                claims,
                *expires_in_seconds,
            ),
        }
    }

    /// POST the grant to the token endpoint and extract the access token.
    async fn fetch_token(
        &self,
        token_url: &str,
        form: &[(String, String)],
    ) -> Result<(String, u64), AuthError> {
        debug!(token_url = %token_url, "Fetching OAuth2 token");

        let response = self.client.post(token_url).form(form).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::TokenEndpointStatus {
                status: status.as_u16(),
            });
        }

        let payload: Value = response.json().await?;
        let token = payload
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or(AuthError::MissingAccessToken)?
            .to_string();
        let expires_in = payload.get("expires_in").and_then(Value::as_u64).unwrap_or(3600);

        Ok((token, expires_in))
    }

    #[allow(clippy::too_many_arguments)]
    fn jwt_headers(
        &self,
        secret: &str,
        algorithm: &str,
        issuer: Option<&str>,
        subject: Option<&str>,
        audience: Option<&str>,
        claims: &HashMap<String, Value>,
        expires_in_seconds: u64,
    ) -> Result<HashMap<String, String>, AuthError> {
        let algorithm = match algorithm {
            "HS256" => Algorithm::HS256,
            "HS384" => Algorithm::HS384,
            "HS512" => Algorithm::HS512,
            other => return Err(AuthError::UnsupportedJwtAlgorithm(other.to_string())),
        };

        let secret = self.templates.substitute(secret, 0);
        let now = Utc::now().timestamp();

        let mut payload = serde_json::Map::new();
        payload.insert("iat".to_string(), json!(now));
        payload.insert("exp".to_string(), json!(now + expires_in_seconds as i64));
        if let Some(issuer) = issuer {
            payload.insert("iss".to_string(), json!(self.templates.substitute(issuer, 0)));
        }
        if let Some(subject) = subject {
            payload.insert("sub".to_string(), json!(self.templates.substitute(subject, 0)));
        }
        if let Some(audience) = audience {
            payload.insert("aud".to_string(), json!(self.templates.substitute(audience, 0)));
        }
        for (key, value) in claims {
            let resolved = match value {
                Value::String(s) => json!(self.templates.substitute(s, 0)),
                other => other.clone(),
            };
            payload.insert(key.clone(), resolved);
        }

        let token = jsonwebtoken::encode(
            &Header::new(algorithm),
            &Value::Object(payload),
            &EncodingKey::from_secret(secret.as_bytes()),
        )?;

        Ok(bearer_header(&token))
    }
}

fn bearer_header(token: &str) -> HashMap<String, String> {
    HashMap::from([("Authorization".to_string(), format!("Bearer {}", token))])
}
