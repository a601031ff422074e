//! Unverified inspection of JWT access token claims
//!
//! Tokens handed to the engine have already been verified by whatever
//! accepted the connection. The only thing needed here is to read the
//! claims back out, most importantly `exp`, so that the engine knows when
//! a credential goes stale. No signature checks are performed.

use aliri_base64::Base64Url;
use serde::Deserialize;
use tether_clock::UnixMillis;

use crate::{provider::TokenClaims, AccessTokenRef, UserId};

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_first(self) -> Option<String> {
        match self {
            Self::One(s) => Some(s),
            Self::Many(v) => v.into_iter().next(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PeekedClaims {
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    aud: Option<OneOrMany>,
    #[serde(default)]
    azp: Option<String>,
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    exp: Option<u64>,
}

/// Reads the claims of a JWT access token without verifying it
///
/// Returns `None` if the token is not a three-part compact JWT or its payload
/// is not a JSON object.
pub fn peek_claims(token: &AccessTokenRef) -> Option<TokenClaims> {
    let mut parts = token.as_str().split('.');
    let (_header, payload, _signature) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }

    let raw = Base64Url::from_encoded(payload).ok()?;
    let claims: PeekedClaims = match serde_json::from_slice(raw.as_slice()) {
        Ok(c) => c,
        Err(error) => {
            tracing::trace!(
                error = (&error as &dyn std::error::Error),
                "token payload is not a claims object"
            );
            return None;
        }
    };

    Some(TokenClaims {
        subject: claims.sub.map(UserId::new),
        audience: claims
            .aud
            .and_then(OneOrMany::into_first)
            .or(claims.azp)
            .or(claims.client_id),
        expires_at: claims.exp.map(UnixMillis::from_secs),
    })
}

/// Reads the `exp` claim of a JWT access token without verifying it
#[inline]
pub fn peek_expiry(token: &AccessTokenRef) -> Option<UnixMillis> {
    peek_claims(token).and_then(|c| c.expires_at)
}

#[cfg(test)]
pub(crate) fn unsigned_jwt(claims: &serde_json::Value) -> crate::AccessToken {
    let header = Base64Url::from_raw(r#"{"alg":"none","typ":"JWT"}"#);
    let payload = Base64Url::from_raw(claims.to_string());
    crate::AccessToken::new(format!("{}.{}.", header, payload))
}
