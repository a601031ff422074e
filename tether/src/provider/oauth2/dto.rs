//! DTOs for interacting with OAuth2 token endpoints

use serde::{Deserialize, Serialize, Serializer};

use crate::{AccessTokenRef, ClientIdRef, ClientSecretRef, RefreshTokenRef};

/// The body of a `refresh_token` grant request
#[derive(Debug)]
pub(super) struct RefreshTokenRequest<'a> {
    pub client_id: &'a ClientIdRef,
    pub client_secret: Option<&'a ClientSecretRef>,
    pub refresh_token: &'a RefreshTokenRef,
}

impl Serialize for RefreshTokenRequest<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeStruct;

        let mut ser = serializer.serialize_struct("RefreshTokenRequest", 4)?;
        ser.serialize_field("grant_type", "refresh_token")?;
        ser.serialize_field("client_id", self.client_id)?;
        if let Some(secret) = self.client_secret {
            ser.serialize_field("client_secret", secret)?;
        } else {
            ser.skip_field("client_secret")?;
        }
        ser.serialize_field("refresh_token", self.refresh_token)?;
        ser.end()
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct TokenResponse<'a> {
    #[serde(borrow)]
    pub access_token: &'a AccessTokenRef,
    #[serde(borrow, default)]
    pub refresh_token: Option<&'a RefreshTokenRef>,
    pub expires_in: u64,
}

#[derive(Debug, Deserialize)]
pub(super) struct ErrorResponse {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
}
