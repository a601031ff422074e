//! Interfaces to the identity provider and token validator
//!
//! The engine never talks to the network itself. Refreshing a credential is
//! delegated to a [`CredentialRefresher`], and confirming the refreshed
//! credential is delegated to a [`CredentialValidator`]. Any resilience the
//! provider client wants beyond the engine's bounded retries, such as
//! circuit breaking, belongs inside those implementations.

use std::{error, sync::Arc, time::Duration};

use async_trait::async_trait;
use tether_clock::{Clock, System, UnixMillis};
use thiserror::Error;

use crate::{claims, AccessToken, AccessTokenRef, RefreshToken, RefreshTokenRef, UserId};

#[cfg(feature = "oauth2")]
#[cfg_attr(docsrs, doc(cfg(feature = "oauth2")))]
pub mod oauth2;

/// A credential as returned by the identity provider after a refresh
#[derive(Clone, Debug)]
pub struct RefreshedCredential {
    /// The new access token
    pub access_token: AccessToken,
    /// The rotated refresh token, if the provider rotates them
    ///
    /// When absent, the existing refresh token is kept.
    pub refresh_token: Option<RefreshToken>,
    /// How long the provider says the access token is valid for
    pub expires_in: Duration,
}

/// Claims extracted from a validated access token
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TokenClaims {
    /// The subject of the token
    pub subject: Option<UserId>,
    /// The audience or client the token was issued to
    pub audience: Option<String>,
    /// When the token expires
    pub expires_at: Option<UnixMillis>,
}

/// An error reported by the identity provider or validator
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The underlying session or refresh token has been revoked
    #[error("session revoked by identity provider: {0}")]
    SessionRevoked(String),
    /// The credential was expired or otherwise rejected
    #[error("credential rejected: {0}")]
    TokenRejected(String),
    /// The request or credential was malformed
    #[error("invalid credential request: {0}")]
    InvalidRequest(String),
    /// The identity provider could not be reached or failed internally
    #[error("identity provider unavailable")]
    Unavailable(#[source] Box<dyn error::Error + Send + Sync + 'static>),
}

impl ProviderError {
    /// Wraps a transport or server failure
    pub fn unavailable(error: impl Into<Box<dyn error::Error + Send + Sync + 'static>>) -> Self {
        Self::Unavailable(error.into())
    }

    /// Whether repeating the same request may succeed
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Exchanges a refresh token for a fresh access token
#[async_trait]
pub trait CredentialRefresher: Send + Sync {
    /// Performs the exchange
    async fn refresh(
        &self,
        refresh_token: &RefreshTokenRef,
    ) -> Result<RefreshedCredential, ProviderError>;
}

/// Confirms that an access token is acceptable and exposes its claims
#[async_trait]
pub trait CredentialValidator: Send + Sync {
    /// Validates the token
    ///
    /// A rejected token should be reported as [`ProviderError::TokenRejected`],
    /// or [`ProviderError::SessionRevoked`] if the session behind it is gone.
    async fn validate(&self, access_token: &AccessTokenRef) -> Result<TokenClaims, ProviderError>;
}

#[async_trait]
impl<T: CredentialRefresher + ?Sized> CredentialRefresher for Arc<T> {
    async fn refresh(
        &self,
        refresh_token: &RefreshTokenRef,
    ) -> Result<RefreshedCredential, ProviderError> {
        T::refresh(self, refresh_token).await
    }
}

#[async_trait]
impl<T: CredentialValidator + ?Sized> CredentialValidator for Arc<T> {
    async fn validate(&self, access_token: &AccessTokenRef) -> Result<TokenClaims, ProviderError> {
        T::validate(self, access_token).await
    }
}

/// A validator that trusts the identity provider and only reads claims
///
/// Claims are read from the token's JWT payload without checking its
/// signature. Opaque tokens are accepted with empty claims. A JWT whose
/// `exp` has already passed is rejected.
#[derive(Clone, Copy, Debug, Default)]
pub struct UnverifiedClaimsValidator<C = System> {
    clock: C,
}

impl UnverifiedClaimsValidator {
    /// Constructs a new validator using the system clock
    pub const fn new() -> Self {
        Self { clock: System }
    }
}

impl<C> UnverifiedClaimsValidator<C> {
    /// Sets a custom clock to be used
    ///
    /// Useful for testing purposes
    pub fn with_clock<D>(self, clock: D) -> UnverifiedClaimsValidator<D> {
        UnverifiedClaimsValidator { clock }
    }
}

#[async_trait]
impl<C: Clock + Send + Sync> CredentialValidator for UnverifiedClaimsValidator<C> {
    async fn validate(&self, access_token: &AccessTokenRef) -> Result<TokenClaims, ProviderError> {
        let claims = claims::peek_claims(access_token).unwrap_or_default();
        match claims.expires_at {
            Some(exp) if exp <= self.clock.now() => Err(ProviderError::TokenRejected(
                "access token is already expired".into(),
            )),
            _ => Ok(claims),
        }
    }
}
