//! OAuth2 token sources.
//!
//! The metadata exchange carries an OAuth2 access token that the server-side
//! proxy uses to authenticate the caller (always, and as the primary
//! credential when IAM authentication is selected). Token acquisition and
//! refresh are the embedding application's concern; the connector consumes
//! tokens through the narrow [`TokenSource`] trait.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use zeroize::Zeroize;

use crate::error::{Error, Result};

/// An OAuth2 access token.
///
/// The secret is zeroized on drop and is excluded from `Debug` output.
pub struct AccessToken {
    secret: String,
    expiry: Option<DateTime<Utc>>,
}

impl AccessToken {
    /// Create a token without a known expiry.
    pub fn new(secret: impl Into<String>) -> Self {
        AccessToken {
            secret: secret.into(),
            expiry: None,
        }
    }

    /// Set the expiration time (builder pattern).
    pub fn with_expiry(mut self, expiry: DateTime<Utc>) -> Self {
        self.expiry = Some(expiry);
        self
    }

    /// The raw token value.
    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// Token expiration time, if known.
    pub fn expiry(&self) -> Option<DateTime<Utc>> {
        self.expiry
    }

    /// Whether an expiration is set and already past.
    pub fn is_expired(&self) -> bool {
        self.expiry.is_some_and(|exp| exp < Utc::now())
    }
}

impl Drop for AccessToken {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("expiry", &self.expiry)
            .finish_non_exhaustive()
    }
}

/// Source of OAuth2 access tokens.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Return a currently valid access token.
    async fn token(&self) -> Result<AccessToken>;
}

impl std::fmt::Debug for dyn TokenSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn TokenSource").finish_non_exhaustive()
    }
}

/// A token source that always yields the same fixed token.
pub struct StaticTokenSource {
    secret: String,
}

impl StaticTokenSource {
    pub fn new(secret: impl Into<String>) -> Self {
        StaticTokenSource {
            secret: secret.into(),
        }
    }
}

impl Drop for StaticTokenSource {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn token(&self) -> Result<AccessToken> {
        Ok(AccessToken::new(self.secret.clone()))
    }
}

/// Subset of a credentials JSON document the connector understands.
///
/// Credential discovery and refresh flows are out of scope; the accepted
/// documents are token-bearing (an `access_token` field), which covers
/// authorized-user exports and test fixtures. Anything else must be adapted
/// by the embedding application into a [`TokenSource`].
#[derive(Deserialize)]
struct CredentialsDocument {
    #[serde(rename = "type")]
    kind: Option<String>,
    access_token: Option<String>,
}

/// Build a token source from a credentials JSON document.
pub(crate) fn token_source_from_json(json: &[u8]) -> Result<Arc<dyn TokenSource>> {
    let doc: CredentialsDocument = serde_json::from_slice(json)
        .map_err(|e| Error::config(format!("invalid credentials JSON: {e}"), "n/a"))?;
    match doc.access_token {
        Some(token) if !token.is_empty() => Ok(Arc::new(StaticTokenSource::new(token))),
        _ => Err(Error::config(
            format!(
                "credentials of type {:?} do not carry an access token; \
                 supply a token source instead",
                doc.kind.as_deref().unwrap_or("unknown")
            ),
            "n/a",
        )),
    }
}
