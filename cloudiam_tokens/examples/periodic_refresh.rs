use std::time::Duration;

use clap::Parser;
use cloudiam_tokens::{
    issuer::ReqwestIssuer, ApiKey, ClientCredentials, ClientId, ClientSecret, Credential,
    IamTokenSource, TokenStatus, DEFAULT_IAM_URL,
};
use tokio::time;

#[derive(Debug, Parser)]
struct Opts {
    /// The API key to exchange for access tokens
    #[clap(short, long, env = "IAM_APIKEY", hide_env_values = true)]
    apikey: ApiKey,

    /// The IAM token endpoint
    #[clap(short = 'u', long, env = "IAM_URL", default_value = DEFAULT_IAM_URL)]
    iam_url: reqwest::Url,

    /// The client ID used to authenticate the token request
    #[clap(long, env = "IAM_CLIENT_ID", requires = "client_secret")]
    client_id: Option<ClientId>,

    /// The client secret used to authenticate the token request
    #[clap(
        long,
        env = "IAM_CLIENT_SECRET",
        requires = "client_id",
        hide_env_values = true
    )]
    client_secret: Option<ClientSecret>,

    /// Seconds between polls of the token source
    #[clap(short, long, default_value_t = 5)]
    interval: u64,
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

    let mut credential = Credential::new(opts.apikey)?.with_url(opts.iam_url);
    if let (Some(client_id), Some(client_secret)) = (opts.client_id, opts.client_secret) {
        credential = credential.with_client_credentials(ClientCredentials {
            client_id,
            client_secret,
        });
    }

    let issuer = ReqwestIssuer::with_default_client()?;
    let source = IamTokenSource::new(issuer, credential);

    let token = source.token().await?;
    tracing::info!(token = format_args!("{:#?}", token), "first access token");

    let mut interval = time::interval(Duration::from_secs(opts.interval));
    loop {
        interval.tick().await;

        let status = source.status();
        let token = match source.token().await {
            Ok(token) => token,
            Err(error) => {
                tracing::error!(
                    error = (&error as &dyn std::error::Error),
                    "unable to obtain access token"
                );
                continue;
            }
        };

        let cached = source.cached();
        let refresh_at = cached.as_ref().map(|c| c.refresh_at().0);
        let expiry = cached.as_ref().map(|c| c.expiry().0);
        match status {
            TokenStatus::Fresh => {
                tracing::debug!(
                    ?status,
                    ?refresh_at,
                    ?expiry,
                    token = format_args!("{:#?}", token),
                    "pulled token"
                )
            }
            TokenStatus::RefreshDue => {
                tracing::info!(
                    ?status,
                    ?refresh_at,
                    ?expiry,
                    token = format_args!("{:#?}", token),
                    "pulled token, refreshing"
                )
            }
            TokenStatus::Empty | TokenStatus::Expired => {
                tracing::warn!(
                    ?status,
                    ?refresh_at,
                    ?expiry,
                    token = format_args!("{:#?}", token),
                    "pulled token after waiting on issuer"
                )
            }
        }
    }
}
