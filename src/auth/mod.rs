//! Authorization capability for the remote catalog.
//!
//! The catalog never obtains credentials itself: it asks an
//! [`AccessTokenSource`] for a bearer token and, when the remote answers 401,
//! calls [`AccessTokenSource::refresh`] once before retrying. The interactive
//! OAuth2 consent flow lives outside this crate; [`StoredCredentials`] only
//! consumes the refresh token it produced.

mod credentials;
mod error;

use async_trait::async_trait;

pub use self::credentials::StoredCredentials;
pub use self::error::AuthError;

#[async_trait]
pub trait AccessTokenSource: Send + Sync {
    /// The current bearer token, refreshing first if none is cached.
    async fn access_token(&self) -> Result<String, AuthError>;

    /// Obtain a new token, replacing the cached one.
    async fn refresh(&self) -> Result<String, AuthError>;
}
