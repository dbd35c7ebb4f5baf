use thiserror::Error;

/// Errors produced while obtaining or refreshing an access token.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Credentials file {path} is missing field '{field}'")]
    MissingField { path: String, field: &'static str },

    #[error("Token refresh rejected (HTTP {code}): {message}")]
    RefreshRejected { code: u16, message: String },

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
