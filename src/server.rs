use crate::config::Config;
use crate::cookie::CookieJar;
use crate::errors::ProxyError;
use crate::forward::{forward_signed, forward_upstream, ForwardSigner, Upstream};
use crate::jwks::TokenVerifier;
use crate::metrics::{Measure, ProxyMetrics};
use crate::middleware::{Admission, Authentication, EntryPoint, HeadersInjector};
use crate::oidc::{discover, IdpClient, RefreshGroup, TokenGrant};
use crate::resource::ResourceTable;
use crate::route;
use crate::store::{create_store, SessionStore};
use crate::token::TokenCodec;
use actix_cors::Cors;
use actix_web::middleware::{Condition, Logger};
use actix_web::{web, App, HttpServer};
use std::sync::Arc;
use std::time::Duration;

/// Deadline on any single call against the identity provider.
const IDP_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on a buffered request body relayed upstream.
const MAX_UPSTREAM_BODY: usize = 16 * 1024 * 1024;

/// Everything a request needs, owned in one place and shared by reference.
pub struct Gatekeeper {
    pub config: Config,
    pub table: ResourceTable,
    pub access_codec: TokenCodec,
    pub refresh_codec: Option<TokenCodec>,
    pub jar: CookieJar,
    pub verifier: TokenVerifier,
    pub idp: Option<Arc<dyn TokenGrant>>,
    pub store: Option<Arc<dyn SessionStore>>,
    pub refreshes: RefreshGroup,
    pub upstream: Option<Upstream>,
    pub metrics: ProxyMetrics,
}

/// The proxy service itself.
pub struct ProxyServer {
    data: web::Data<Gatekeeper>,
    signer: Option<web::Data<ForwardSigner>>,
}

impl ProxyServer {
    /// Build the service from its configuration: compile the policy table,
    /// discover the identity provider and prime the signing keys.
    pub async fn new(config: Config) -> Result<ProxyServer, ProxyError> {
        ProxyServer::with_store(config, None).await
    }

    /// Like [`ProxyServer::new`] but with an externally provided session
    /// backend (redis, boltdb, ...) instead of the one named by `store_url`.
    pub async fn with_store(
        mut config: Config,
        session_store: Option<Arc<dyn SessionStore>>,
    ) -> Result<ProxyServer, ProxyError> {
        let table = config.validate()?;
        for resource in table.iter() {
            log::info!(
                "protecting resource uri: {} methods: {} roles: [{}] whitelisted: {}",
                resource.uri,
                resource.method_summary(),
                resource.roles.join(","),
                resource.whitelisted
            );
        }
        for (claim, pattern) in &config.match_claims {
            log::info!("token must contain claim: {} matching: {}", claim, pattern);
        }
        if config.enable_encrypted_token {
            log::info!("session access tokens will be encrypted");
        }

        let idp_http = reqwest::Client::builder()
            .timeout(IDP_TIMEOUT)
            .build()
            .map_err(|err| ProxyError::ConfigInvalid(err.to_string()))?;

        let (idp, verifier): (Option<Arc<dyn TokenGrant>>, TokenVerifier) = if config
            .skip_token_verification
        {
            log::warn!("TESTING ONLY CONFIG - the verification of tokens has been disabled");
            (None, TokenVerifier::skip_verification())
        } else {
            let discovery = discover(&idp_http, &config.discovery_url).await?;
            let verifier = TokenVerifier::jwks(
                idp_http.clone(),
                discovery.jwks_uri.clone(),
                discovery.issuer.clone(),
                config.client_id.clone(),
                config.skip_issuer_check,
                config.skip_client_id,
            );
            verifier.prime().await;
            let idp = IdpClient::new(
                idp_http.clone(),
                discovery,
                &config.client_id,
                &config.client_secret,
                &config.scopes,
            )?;
            (Some(Arc::new(idp)), verifier)
        };

        let access_codec = TokenCodec::new(&config.encryption_key, config.enable_encrypted_token)?;
        let refresh_codec = if config.enable_refresh_tokens {
            Some(TokenCodec::new(&config.encryption_key, true)?)
        } else {
            None
        };

        let store = match session_store {
            Some(store) => Some(store),
            None => create_store(&config.store_url)?,
        };
        let upstream = if config.enable_forwarding {
            None
        } else {
            log::info!("enabled reverse proxy mode, upstream url: {}", config.upstream_url);
            Some(Upstream::new(
                &config.upstream_url,
                config.upstream_timeout(),
                config.skip_upstream_tls_verify,
            )?)
        };

        let signer = if config.enable_forwarding {
            log::info!("enabled forward signing mode, listening on: {}", config.listen);
            let idp = idp.clone().ok_or_else(|| {
                ProxyError::ConfigInvalid(
                    "forward-signing mode requires an identity provider".to_string(),
                )
            })?;
            Some(web::Data::new(ForwardSigner::new(
                idp,
                config.upstream_timeout(),
                config.skip_upstream_tls_verify,
            )?))
        } else {
            None
        };

        let metrics =
            ProxyMetrics::new().map_err(|err| ProxyError::ConfigInvalid(err.to_string()))?;
        let jar = CookieJar::new(config.secure_cookies);

        let data = web::Data::new(Gatekeeper {
            table,
            access_codec,
            refresh_codec,
            jar,
            verifier,
            idp,
            store,
            refreshes: RefreshGroup::new(),
            upstream,
            metrics,
            config,
        });

        Ok(ProxyServer { data, signer })
    }

    /// Serve until shutdown; exits cleanly on SIGINT/SIGTERM with in-flight
    /// requests drained up to the configured timeout.
    pub async fn run(self) -> std::io::Result<()> {
        let listen = self.data.config.listen.clone();
        let shutdown = self.data.config.server_shutdown_timeout_secs;

        match self.signer {
            Some(signer) => {
                let enable_logging = self.data.config.enable_logging;
                HttpServer::new(move || {
                    App::new()
                        .app_data(signer.clone())
                        .app_data(web::PayloadConfig::new(MAX_UPSTREAM_BODY))
                        .wrap(Condition::new(enable_logging, Logger::default()))
                        .default_service(web::route().to(forward_signed))
                })
                .shutdown_timeout(shutdown)
                .bind(&listen)?
                .run()
                .await
            }
            None => {
                let data = self.data;
                HttpServer::new(move || reverse_proxy_app(data.clone()))
                    .shutdown_timeout(shutdown)
                    .bind(&listen)?
                    .run()
                    .await
            }
        }
    }
}

fn build_cors(config: &Config) -> Cors {
    let mut cors = Cors::default();
    for origin in &config.cors_origins {
        cors = cors.allowed_origin(origin);
    }
    if !config.cors_methods.is_empty() {
        cors = cors.allowed_methods(config.cors_methods.iter().map(String::as_str));
    }
    if !config.cors_headers.is_empty() {
        cors = cors.allowed_headers(config.cors_headers.iter().map(String::as_str));
    }
    if config.cors_credentials {
        cors = cors.supports_credentials();
    }
    if config.cors_max_age > 0 {
        cors = cors.max_age(config.cors_max_age as usize);
    }
    cors
}

/// Compose the reverse proxy application: the global chain wraps both the
/// OAuth handlers and the catch-all upstream forwarder; the OAuth base is
/// structurally never forwarded.
fn reverse_proxy_app(
    data: web::Data<Gatekeeper>,
) -> App<
    impl actix_web::dev::ServiceFactory<
        actix_web::dev::ServiceRequest,
        Config = (),
        Response = actix_web::dev::ServiceResponse<impl actix_web::body::MessageBody>,
        Error = actix_web::Error,
        InitError = (),
    >,
> {
    let config = &data.config;
    let cors_enabled = !config.cors_origins.is_empty();
    let cors = build_cors(config);
    let enable_logging = config.enable_logging;
    let oauth_base = config.oauth_uri.clone();

    App::new()
        .app_data(data.clone())
        .app_data(web::PayloadConfig::new(MAX_UPSTREAM_BODY))
        .wrap(HeadersInjector)
        .wrap(Admission)
        .wrap(Authentication)
        .wrap(Condition::new(cors_enabled, cors))
        .wrap(Condition::new(enable_logging, Logger::default()))
        .wrap(Measure)
        .wrap(EntryPoint)
        .service(web::scope(&oauth_base).configure(route::configure))
        .default_service(web::route().to(forward_upstream))
}
