//! Background credential refresh for long-lived, connection-bound sessions
//!
//! Servers that hold persistent connections, such as WebSockets, often
//! authenticate each connection once and then keep it open for far longer
//! than the access token presented at the start is valid. This crate keeps
//! a registry of those connections and their credentials and refreshes each
//! credential against the identity provider shortly before it expires.
//!
//! The engine bounds the resources it will spend doing so. The registry has a
//! fixed capacity and evicts the least recently accessed sessions when it
//! fills up. Refreshes are bounded by a global concurrency limit, and a
//! refresh that would exceed it is deferred rather than queued. A periodic
//! sweep removes sessions that have been revoked, abandoned, or are stuck
//! mid-refresh.
//!
//! While a refresh is in flight, the session remains usable for a grace
//! period. If no refresh succeeds within that period, the session is
//! considered invalid and the connection should be closed.
//!
//! # General Flow
//!
//! On application start-up, build a [`SessionConfig`], choose how
//! credentials are refreshed, and spawn the engine. The engine's sweeper and
//! refresh monitor run as background tasks on the current Tokio runtime.
//!
//! ```
//! use tether::{
//!     provider::oauth2::OAuth2RefreshClient, ClientId, ConnectionId, InitialAuthState,
//!     SessionConfig, SessionEngine,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SessionConfig::builder()
//!     .refresh_threshold_secs(300)
//!     .max_concurrent_refreshes(10)
//!     .build()?;
//!
//! let refresher = OAuth2RefreshClient::new(
//!     reqwest::Client::new(),
//!     reqwest::Url::parse("https://example.com/oauth/token")?,
//!     ClientId::from_static("my-service"),
//! );
//!
//! let engine = SessionEngine::builder(config, refresher).spawn();
//!
//! # let (user_id, access_token, refresh_token) = (
//! #     tether::UserId::from_static("user"),
//! #     tether::AccessToken::from_static("access"),
//! #     tether::RefreshToken::from_static("refresh"),
//! # );
//! let connection = ConnectionId::from_static("ws-1234");
//! engine.register_connection(
//!     connection.clone(),
//!     InitialAuthState::new(user_id, access_token, refresh_token),
//! )?;
//!
//! // ...on each message from the connection
//! if !engine.is_session_valid(&connection) {
//!     // close the connection
//! }
//!
//! // ...when the connection closes
//! engine.unregister_connection(&connection);
//!
//! engine.shutdown();
//! # Ok(())
//! # }
//! ```
//!
//! This crate includes an example that drives a handful of connections
//! against a real token endpoint in the examples folder.
//!
//! # Features
//!
//! The following features are supported by this crate, all of which are
//! enabled by default:
//!
//! * `oauth2`: Provides a [`CredentialRefresher`][provider::CredentialRefresher]
//!   that performs the OAuth2 _refresh token_ grant using [reqwest].

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

mod braids;
pub mod claims;
mod config;
mod engine;
mod error;
pub mod executor;
pub mod metrics;
pub mod monitor;
pub mod provider;
pub mod registry;
pub mod retry;
pub mod stats;
pub mod sweeper;

#[cfg(test)]
mod test_support;

pub use braids::*;
pub use config::{ConfigError, ConfigViolation, PartialSessionConfig, SessionConfig};
pub use engine::{SessionEngine, SessionEngineBuilder};
pub use error::{ErrorKind, SessionError};
pub use executor::RefreshOutcome;
pub use registry::{InitialAuthState, SessionEntry};
pub use stats::SessionStats;
pub use sweeper::{RemovalReason, SweepReport};
