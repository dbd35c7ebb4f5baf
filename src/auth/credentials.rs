use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;

use super::error::AuthError;
use super::AccessTokenSource;

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// On-disk credentials as written by the consent flow.
///
/// Unknown fields are carried through untouched when the file is rewritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CredentialsFile {
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    client_secret: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    token_uri: Option<String>,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Refresh-token credentials loaded from a JSON file.
///
/// Refreshed access tokens are written back so the next run can reuse them
/// until they expire.
pub struct StoredCredentials {
    path: PathBuf,
    http: reqwest::Client,
    state: Mutex<CredentialsFile>,
}

impl std::fmt::Debug for StoredCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredCredentials")
            .field("path", &self.path)
            .field("tokens", &"<redacted>")
            .finish()
    }
}

impl StoredCredentials {
    /// Load credentials from `path`.
    ///
    /// The client id, client secret and refresh token must be present.
    pub async fn load(path: &Path, http: reqwest::Client) -> Result<Self, AuthError> {
        let contents = fs::read_to_string(path).await?;
        let file: CredentialsFile = serde_json::from_str(&contents)?;

        let missing = |field| AuthError::MissingField {
            path: path.display().to_string(),
            field,
        };
        if file.client_id.is_none() {
            return Err(missing("client_id"));
        }
        if file.client_secret.is_none() {
            return Err(missing("client_secret"));
        }
        if file.refresh_token.is_none() {
            return Err(missing("refresh_token"));
        }

        tracing::debug!(path = %path.display(), "Loaded credentials");
        Ok(Self {
            path: path.to_path_buf(),
            http,
            state: Mutex::new(file),
        })
    }

    async fn persist(&self, file: &CredentialsFile) -> Result<(), AuthError> {
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(file)?).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl AccessTokenSource for StoredCredentials {
    async fn access_token(&self) -> Result<String, AuthError> {
        if let Some(token) = self.state.lock().await.access_token.clone() {
            return Ok(token);
        }
        self.refresh().await
    }

    async fn refresh(&self) -> Result<String, AuthError> {
        let mut state = self.state.lock().await;

        let token_uri = state
            .token_uri
            .clone()
            .unwrap_or_else(|| DEFAULT_TOKEN_URI.to_string());
        let form = [
            ("grant_type", "refresh_token"),
            ("client_id", state.client_id.as_deref().unwrap_or_default()),
            (
                "client_secret",
                state.client_secret.as_deref().unwrap_or_default(),
            ),
            (
                "refresh_token",
                state.refresh_token.as_deref().unwrap_or_default(),
            ),
        ];

        tracing::debug!("Refreshing access token");
        let response = self.http.post(&token_uri).form(&form).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = match serde_json::from_str::<TokenErrorResponse>(&body) {
                Ok(err) => match err.error_description {
                    Some(desc) => format!("{}: {desc}", err.error),
                    None => err.error,
                },
                Err(_) => body,
            };
            return Err(AuthError::RefreshRejected {
                code: status.as_u16(),
                message,
            });
        }

        let token: TokenResponse = response.json().await?;
        tracing::info!(expires_in = ?token.expires_in, "Access token refreshed");

        state.access_token = Some(token.access_token.clone());
        if let Some(rotated) = token.refresh_token {
            state.refresh_token = Some(rotated);
        }
        if let Err(e) = self.persist(&state).await {
            tracing::warn!(
                path = %self.path.display(),
                error = %e,
                "Failed to write refreshed credentials"
            );
        }

        Ok(token.access_token)
    }
}
