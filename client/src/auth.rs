//! Access tokens for the remote service.
//!
//! Acquiring and refreshing tokens is the host application's job; the pass
//! only asks a [`TokenProvider`] for a valid token once per run.

use async_trait::async_trait;
use std::fmt;

/// A bearer token. Its value never appears in `Debug` output or logs.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token, for building request headers.
    pub fn secret(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(<redacted>)")
    }
}

/// Failure to obtain a token.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("no signed-in user")]
    NotSignedIn,

    #[error("token refresh failed: {0}")]
    RefreshFailed(String),
}

/// Source of access tokens.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// A currently valid token, refreshed if necessary.
    async fn access_token(&self) -> Result<AccessToken, AuthError>;
}

/// Provider handing out a fixed token, or failing when there is none.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenProvider {
    token: Option<AccessToken>,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Some(AccessToken::new(token)),
        }
    }

    /// A provider for a signed-out user.
    pub fn signed_out() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn access_token(&self) -> Result<AccessToken, AuthError> {
        self.token.clone().ok_or(AuthError::NotSignedIn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_redacted_in_debug() {
        let token = AccessToken::new("very-secret");
        let printed = format!("{token:?}");
        assert!(!printed.contains("very-secret"));
        assert_eq!(token.secret(), "very-secret");
    }

    #[tokio::test]
    async fn static_provider() {
        let provider = StaticTokenProvider::new("t");
        assert_eq!(provider.access_token().await.unwrap().secret(), "t");
        assert_eq!(
            StaticTokenProvider::signed_out().access_token().await,
            Err(AuthError::NotSignedIn)
        );
    }
}
