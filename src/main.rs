use anyhow::Context;
use clap::Parser;
use oidc_gatekeeper::{Config, ProxyServer};
use std::path::PathBuf;

/// An authenticating OIDC reverse proxy.
///
/// Flags override `PROXY_` environment variables, which override the
/// configuration file. List and map options (resources, claim matches,
/// headers) live in the file only.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML)
    #[arg(long, env = "PROXY_CONFIG")]
    config: Option<PathBuf>,

    /// Interface to listen on
    #[arg(long, env = "PROXY_LISTEN")]
    listen: Option<String>,

    /// OIDC issuer base url used for discovery
    #[arg(long, env = "PROXY_DISCOVERY_URL")]
    discovery_url: Option<String>,

    /// OAuth2 client id
    #[arg(long, env = "PROXY_CLIENT_ID")]
    client_id: Option<String>,

    /// OAuth2 client secret
    #[arg(long, env = "PROXY_CLIENT_SECRET")]
    client_secret: Option<String>,

    /// External url of the proxy, used to build redirect urls
    #[arg(long, env = "PROXY_REDIRECTION_URL")]
    redirection_url: Option<String>,

    /// Url of the upstream service requests are forwarded to
    #[arg(long, env = "PROXY_UPSTREAM_URL")]
    upstream_url: Option<String>,

    /// Session backend url, e.g. memory://
    #[arg(long, env = "PROXY_STORE_URL")]
    store_url: Option<String>,

    /// AES key (16 or 32 bytes) for cookie encryption
    #[arg(long, env = "PROXY_ENCRYPTION_KEY", hide_env_values = true)]
    encryption_key: Option<String>,

    /// Return 401 on authentication failure rather than redirecting browsers
    #[arg(long, env = "PROXY_NO_REDIRECTS")]
    no_redirects: Option<bool>,

    /// Persist refresh tokens and silently refresh expired sessions
    #[arg(long, env = "PROXY_ENABLE_REFRESH_TOKENS")]
    enable_refresh_tokens: Option<bool>,

    /// Encrypt the access token cookie
    #[arg(long, env = "PROXY_ENABLE_ENCRYPTED_TOKEN")]
    enable_encrypted_token: Option<bool>,

    /// Switch to the outbound forward-signing mode
    #[arg(long, env = "PROXY_ENABLE_FORWARDING")]
    enable_forwarding: Option<bool>,

    /// TESTING ONLY: accept tokens without verifying them
    #[arg(long, env = "PROXY_SKIP_TOKEN_VERIFICATION")]
    skip_token_verification: Option<bool>,

    /// Expose prometheus metrics on /oauth/metrics
    #[arg(long, env = "PROXY_ENABLE_METRICS")]
    enable_metrics: Option<bool>,
}

impl Args {
    /// Fold the resolved flag and environment values onto the file config.
    fn apply(self, config: &mut Config) {
        let Args {
            config: _,
            listen,
            discovery_url,
            client_id,
            client_secret,
            redirection_url,
            upstream_url,
            store_url,
            encryption_key,
            no_redirects,
            enable_refresh_tokens,
            enable_encrypted_token,
            enable_forwarding,
            skip_token_verification,
            enable_metrics,
        } = self;

        if let Some(value) = listen {
            config.listen = value;
        }
        if let Some(value) = discovery_url {
            config.discovery_url = value;
        }
        if let Some(value) = client_id {
            config.client_id = value;
        }
        if let Some(value) = client_secret {
            config.client_secret = value;
        }
        if let Some(value) = redirection_url {
            config.redirection_url = value;
        }
        if let Some(value) = upstream_url {
            config.upstream_url = value;
        }
        if let Some(value) = store_url {
            config.store_url = value;
        }
        if let Some(value) = encryption_key {
            config.encryption_key = value;
        }
        if let Some(value) = no_redirects {
            config.no_redirects = value;
        }
        if let Some(value) = enable_refresh_tokens {
            config.enable_refresh_tokens = value;
        }
        if let Some(value) = enable_encrypted_token {
            config.enable_encrypted_token = value;
        }
        if let Some(value) = enable_forwarding {
            config.enable_forwarding = value;
        }
        if let Some(value) = skip_token_verification {
            config.skip_token_verification = value;
        }
        if let Some(value) = enable_metrics {
            config.enable_metrics = value;
        }
    }
}

#[actix_web::main]
async fn main() {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));
    if let Err(err) = run().await {
        log::error!("{:#}", err);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => Config::default(),
    };
    args.apply(&mut config);

    let server = ProxyServer::new(config)
        .await
        .context("initializing the proxy")?;
    server.run().await.context("running the proxy service")?;
    Ok(())
}
