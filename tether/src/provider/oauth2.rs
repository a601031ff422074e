//! A credential refresher that uses an OAuth2 server as the authority

use std::{marker::PhantomData, time::Duration};

use async_trait::async_trait;
use reqwest::StatusCode;

use super::{CredentialRefresher, ProviderError, RefreshedCredential};
use crate::{ClientId, ClientSecret, RefreshTokenRef};

pub mod dto;

/// Performs the OAuth2 `refresh_token` grant against a token endpoint
#[derive(Debug)]
pub struct OAuth2RefreshClient<T = JsonBody> {
    client: reqwest::Client,
    token_url: reqwest::Url,
    client_id: ClientId,
    client_secret: Option<ClientSecret>,
    content_type: PhantomData<fn() -> T>,
}

impl OAuth2RefreshClient<JsonBody> {
    /// Constructs a new refresh client for a public client
    pub fn new(client: reqwest::Client, token_url: reqwest::Url, client_id: ClientId) -> Self {
        Self {
            client,
            token_url,
            client_id,
            client_secret: None,
            content_type: PhantomData,
        }
    }
}

impl<T> OAuth2RefreshClient<T> {
    /// Authenticates the client to the authority with a secret
    pub fn with_client_secret(mut self, client_secret: ClientSecret) -> Self {
        self.client_secret = Some(client_secret);
        self
    }

    /// Configures the client to send credentials to
    /// the authority as form data
    pub fn using_form_data(self) -> OAuth2RefreshClient<FormBody> {
        OAuth2RefreshClient {
            client: self.client,
            token_url: self.token_url,
            client_id: self.client_id,
            client_secret: self.client_secret,
            content_type: PhantomData,
        }
    }
}

#[async_trait]
impl<T: RequestType> CredentialRefresher for OAuth2RefreshClient<T> {
    #[tracing::instrument(
        skip(self, refresh_token),
        fields(token_url = %self.token_url, client_id = %self.client_id),
    )]
    async fn refresh(
        &self,
        refresh_token: &RefreshTokenRef,
    ) -> Result<RefreshedCredential, ProviderError> {
        tracing::trace!("requesting token refresh from authority");

        let payload = dto::RefreshTokenRequest {
            client_id: &self.client_id,
            client_secret: self.client_secret.as_deref(),
            refresh_token,
        };

        let req = T::attach_payload(self.client.post(self.token_url.clone()), &payload);
        let resp = req.send().await.map_err(ProviderError::unavailable)?;
        let status = resp.status();

        tracing::debug!(
            response.status = status.as_u16(),
            "received token response from issuing authority"
        );

        let body = resp.bytes().await.map_err(ProviderError::unavailable)?;

        if !status.is_success() {
            return Err(classify_error_response(status, &body));
        }

        let resp: dto::TokenResponse = serde_json::from_slice(&body).map_err(|error| {
            ProviderError::TokenRejected(format!("malformed token response: {}", error))
        })?;

        tracing::info!(
            has_refresh_token = resp.refresh_token.is_some(),
            lifetime = resp.expires_in,
            "received refreshed tokens"
        );

        Ok(RefreshedCredential {
            access_token: (*resp.access_token).to_owned(),
            refresh_token: resp.refresh_token.map(|rt| (*rt).to_owned()),
            expires_in: Duration::from_secs(resp.expires_in),
        })
    }
}

fn classify_error_response(status: StatusCode, body: &[u8]) -> ProviderError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return ProviderError::unavailable(format!("authority responded with {}", status));
    }

    match serde_json::from_slice::<dto::ErrorResponse>(body) {
        Ok(err) => {
            let detail = err.error_description.unwrap_or_else(|| err.error.clone());
            match err.error.as_str() {
                "invalid_grant" => ProviderError::SessionRevoked(detail),
                "invalid_token" | "unauthorized_client" => ProviderError::TokenRejected(detail),
                _ => ProviderError::InvalidRequest(detail),
            }
        }
        Err(_) if status == StatusCode::UNAUTHORIZED => {
            ProviderError::TokenRejected(format!("authority responded with {}", status))
        }
        Err(_) => ProviderError::InvalidRequest(format!("authority responded with {}", status)),
    }
}

/// A manner of attaching a serializable payload to a request
pub trait RequestType: Send + Sync + 'static {
    /// Attaches the serializable payload to the request body
    fn attach_payload<S: serde::Serialize>(
        request: reqwest::RequestBuilder,
        payload: &S,
    ) -> reqwest::RequestBuilder;
}

/// Attaches credentials to the request body as JSON
#[derive(Debug)]
pub struct JsonBody;

/// Attaches credentials to the request body as URL-encoded form data
#[derive(Debug)]
pub struct FormBody;

impl RequestType for JsonBody {
    fn attach_payload<S: serde::Serialize>(
        request: reqwest::RequestBuilder,
        payload: &S,
    ) -> reqwest::RequestBuilder {
        request.json(payload)
    }
}

impl RequestType for FormBody {
    fn attach_payload<S: serde::Serialize>(
        request: reqwest::RequestBuilder,
        payload: &S,
    ) -> reqwest::RequestBuilder {
        request.form(payload)
    }
}
