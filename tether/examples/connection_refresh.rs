use std::time::Duration;

use clap::Parser;
use tether::{
    provider::oauth2::OAuth2RefreshClient, AccessToken, ClientId, ClientSecret, ConnectionId,
    InitialAuthState, RefreshToken, SessionConfig, SessionEngine, UserId,
};
use tokio::time;

#[derive(Debug, Parser)]
struct Opts {
    /// The issuing authority's token request URL
    #[clap(short, long, env)]
    token_url: reqwest::Url,

    /// The client ID of the client
    #[clap(short, long, env)]
    client_id: ClientId,

    /// The client secret used to identify the client to the issuing authority
    #[clap(short = 's', long, env, hide_env_values = true)]
    client_secret: Option<ClientSecret>,

    /// The user the session belongs to
    #[clap(short, long, env)]
    user_id: UserId,

    /// The access token presented when the connection was opened
    #[clap(short, long, env, hide_env_values = true)]
    access_token: AccessToken,

    /// The refresh token paired with the access token
    #[clap(short, long, env, hide_env_values = true)]
    refresh_token: RefreshToken,

    /// Seconds before expiry at which to refresh
    #[clap(long, env, default_value_t = 300)]
    refresh_threshold_secs: u64,

    /// Milliseconds between checks for credentials nearing expiry
    #[clap(long, env, default_value_t = 60_000)]
    check_interval_ms: u64,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    let config = SessionConfig::builder()
        .refresh_threshold_secs(opts.refresh_threshold_secs)
        .check_interval_ms(opts.check_interval_ms)
        .build()?;

    let mut refresher =
        OAuth2RefreshClient::new(reqwest::Client::new(), opts.token_url, opts.client_id);
    if let Some(secret) = opts.client_secret {
        refresher = refresher.with_client_secret(secret);
    }

    let engine = SessionEngine::builder(config, refresher).spawn();

    let connection = ConnectionId::from_static("demo-connection");
    engine.register_connection(
        connection.clone(),
        InitialAuthState::new(opts.user_id, opts.access_token, opts.refresh_token),
    )?;

    if engine.needs_refresh(&connection) {
        let outcome = engine.refresh_connection_token(&connection).await?;
        tracing::info!(
            token_expiry = outcome.token_expiry.0,
            rotated = outcome.refresh_token_rotated,
            "refreshed credential on start-up"
        );
    }

    let mut interval = time::interval(Duration::from_secs(5));
    loop {
        interval.tick().await;

        if !engine.is_session_valid(&connection) {
            tracing::error!(connection.id = %connection, "session is no longer valid");
            break;
        }

        let stats = engine.stats();
        tracing::info!(stats = %serde_json::to_string(&stats)?, "engine stats");

        if let Some(entry) = engine.get_session_state(&connection) {
            tracing::debug!(
                token = format_args!("{:#?}", entry.current_token()),
                expiry = ?entry.token_expiry().map(|t| t.0),
                refresh_attempts = entry.refresh_attempts(),
                "current credential"
            );
        }
    }

    engine.shutdown();
    Ok(())
}
