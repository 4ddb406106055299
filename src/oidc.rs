use crate::errors::ProxyError;
use async_trait::async_trait;
use oauth2::basic::BasicClient;
use oauth2::reqwest::async_http_client;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, RedirectUrl, RefreshToken,
    ResourceOwnerPassword, ResourceOwnerUsername, Scope, TokenResponse, TokenUrl,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

/// Deadline on retrieving the discovery document at startup.
const DISCOVERY_DEADLINE: Duration = Duration::from_secs(30);
const DISCOVERY_RETRY_INTERVAL: Duration = Duration::from_secs(3);

/// The OIDC provider configuration published under
/// `/.well-known/openid-configuration`.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryDocument {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub jwks_uri: String,
    #[serde(default)]
    pub revocation_endpoint: Option<String>,
    #[serde(default)]
    pub end_session_endpoint: Option<String>,
}

/// Fetch the discovery document, retrying until the deadline; the IDP is
/// commonly still booting when the proxy comes up.
pub async fn discover(
    http: &reqwest::Client,
    discovery_url: &str,
) -> Result<DiscoveryDocument, ProxyError> {
    let base = discovery_url
        .trim_end_matches('/')
        .trim_end_matches("/.well-known/openid-configuration");
    let url = format!("{}/.well-known/openid-configuration", base);

    let attempt = async {
        loop {
            log::info!("attempting to retrieve configuration from {}", url);
            match fetch_discovery(http, &url).await {
                Ok(doc) => return doc,
                Err(err) => log::warn!("failed to get provider configuration: {}", err),
            }
            tokio::time::sleep(DISCOVERY_RETRY_INTERVAL).await;
        }
    };
    match tokio::time::timeout(DISCOVERY_DEADLINE, attempt).await {
        Ok(doc) => {
            log::info!("successfully retrieved the openid configuration");
            Ok(doc)
        }
        Err(_) => Err(ProxyError::IdpUnreachable(anyhow::anyhow!(
            "failed to retrieve the provider configuration from the discovery url"
        ))),
    }
}

async fn fetch_discovery(
    http: &reqwest::Client,
    url: &str,
) -> Result<DiscoveryDocument, anyhow::Error> {
    Ok(http
        .get(url)
        .send()
        .await?
        .error_for_status()?
        .json::<DiscoveryDocument>()
        .await?)
}

/// A grant that went wrong; transport failures surface as 502, grants the
/// IDP refused as 403/401 depending on the caller.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GrantError {
    #[error("the identity provider rejected the grant: {0}")]
    Rejected(String),
    #[error("unable to reach the identity provider: {0}")]
    Transport(String),
}

/// Tokens returned from any grant, normalized.
#[derive(Debug, Clone)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<Duration>,
}

/// The grant operations of the identity provider.
///
/// The rest of the proxy talks to the IDP only through this trait, so the
/// login and refresh flows can be driven end-to-end against a test double.
#[async_trait]
pub trait TokenGrant: Send + Sync {
    /// The IDP authorize URL for a login round trip; `nonce` travels as the
    /// OAuth2 `state`.
    fn authorize_url(&self, nonce: &str, redirect_uri: &str) -> Result<Url, ProxyError>;

    async fn exchange_code(&self, code: &str, redirect_uri: &str)
        -> Result<TokenSet, GrantError>;

    async fn refresh(&self, refresh_token: &str) -> Result<TokenSet, GrantError>;

    /// Resource-owner password credentials grant, used by the login handler.
    async fn password_grant(&self, username: &str, password: &str)
        -> Result<TokenSet, GrantError>;

    /// Client-credentials grant for the forward-signing mode.
    async fn client_credentials(&self) -> Result<TokenSet, GrantError>;

    /// Best-effort token revocation; absence of the endpoint or a failing
    /// call only logs.
    async fn revoke(&self, token: &str);
}

/// Client for the identity provider's token machinery.
pub struct IdpClient {
    oauth: BasicClient,
    pub discovery: DiscoveryDocument,
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
    scopes: Vec<String>,
}

impl IdpClient {
    pub fn new(
        http: reqwest::Client,
        discovery: DiscoveryDocument,
        client_id: &str,
        client_secret: &str,
        scopes: &[String],
    ) -> Result<IdpClient, ProxyError> {
        let auth_url = AuthUrl::new(discovery.authorization_endpoint.clone())
            .map_err(|err| ProxyError::ConfigInvalid(format!("invalid authorization endpoint: {}", err)))?;
        let token_url = TokenUrl::new(discovery.token_endpoint.clone())
            .map_err(|err| ProxyError::ConfigInvalid(format!("invalid token endpoint: {}", err)))?;
        let oauth = BasicClient::new(
            ClientId::new(client_id.to_string()),
            Some(ClientSecret::new(client_secret.to_string())),
            auth_url,
            Some(token_url),
        );
        Ok(IdpClient {
            oauth,
            discovery,
            http,
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            scopes: scopes.to_vec(),
        })
    }
}

#[async_trait]
impl TokenGrant for IdpClient {
    fn authorize_url(&self, nonce: &str, redirect_uri: &str) -> Result<Url, ProxyError> {
        let redirect = RedirectUrl::new(redirect_uri.to_string())
            .map_err(|err| ProxyError::MalformedRequest(format!("invalid redirect uri: {}", err)))?;
        let client = self.oauth.clone().set_redirect_uri(redirect);
        let nonce = nonce.to_string();
        let mut request = client.authorize_url(move || CsrfToken::new(nonce));
        for scope in &self.scopes {
            request = request.add_scope(Scope::new(scope.clone()));
        }
        let (url, _) = request.url();
        Ok(url)
    }

    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenSet, GrantError> {
        let redirect = RedirectUrl::new(redirect_uri.to_string())
            .map_err(|err| GrantError::Rejected(err.to_string()))?;
        let client = self.oauth.clone().set_redirect_uri(redirect);
        let response = client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .request_async(async_http_client)
            .await
            .map_err(map_grant_error)?;
        Ok(normalize(response))
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenSet, GrantError> {
        log::debug!("exchanging the refresh token for a new access token");
        let response = self
            .oauth
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
            .request_async(async_http_client)
            .await
            .map_err(map_grant_error)?;
        Ok(normalize(response))
    }

    async fn password_grant(
        &self,
        username: &str,
        password: &str,
    ) -> Result<TokenSet, GrantError> {
        let username_owned = ResourceOwnerUsername::new(username.to_string());
        let password_owned = ResourceOwnerPassword::new(password.to_string());
        let mut request = self.oauth.exchange_password(&username_owned, &password_owned);
        for scope in &self.scopes {
            request = request.add_scope(Scope::new(scope.clone()));
        }
        let response = request
            .request_async(async_http_client)
            .await
            .map_err(map_grant_error)?;
        Ok(normalize(response))
    }

    async fn client_credentials(&self) -> Result<TokenSet, GrantError> {
        let response = self
            .oauth
            .exchange_client_credentials()
            .request_async(async_http_client)
            .await
            .map_err(map_grant_error)?;
        Ok(normalize(response))
    }

    async fn revoke(&self, token: &str) {
        let Some(endpoint) = self.discovery.revocation_endpoint.as_deref() else {
            log::debug!("the idp does not expose a revocation endpoint");
            return;
        };
        let result = self
            .http
            .post(endpoint)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("token", token), ("token_type_hint", "access_token")])
            .send()
            .await
            .and_then(|resp| resp.error_for_status());
        if let Err(err) = result {
            log::warn!("unable to revoke the session token: {}", err);
        }
    }
}

type HttpGrantError =
    oauth2::basic::BasicRequestTokenError<oauth2::reqwest::Error<reqwest::Error>>;

fn map_grant_error(err: HttpGrantError) -> GrantError {
    match err {
        oauth2::RequestTokenError::Request(inner) => GrantError::Transport(inner.to_string()),
        other => GrantError::Rejected(other.to_string()),
    }
}

fn normalize(response: oauth2::basic::BasicTokenResponse) -> TokenSet {
    TokenSet {
        access_token: response.access_token().secret().clone(),
        refresh_token: response.refresh_token().map(|t| t.secret().clone()),
        expires_in: response.expires_in(),
    }
}

/// Deduplicates concurrent refreshes of the same session.
///
/// Keyed by the hash of the expired access token: the first caller performs
/// the exchange, followers block on the same slot and reuse its outcome.
/// Refreshes in other processes may still race, the IDP arbitrates those.
#[derive(Default)]
pub struct RefreshGroup {
    inflight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<Option<Result<TokenSet, GrantError>>>>>>,
}

impl RefreshGroup {
    pub fn new() -> RefreshGroup {
        RefreshGroup::default()
    }

    pub async fn run<F, Fut>(&self, key: &str, refresh: F) -> Result<TokenSet, GrantError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<TokenSet, GrantError>>,
    {
        let slot = {
            let mut inflight = self.inflight.lock().unwrap();
            inflight
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(None)))
                .clone()
        };

        let mut guard = slot.lock().await;
        if let Some(outcome) = guard.as_ref() {
            log::debug!("joining an in-flight refresh for this session");
            return outcome.clone();
        }
        let outcome = refresh().await;
        *guard = Some(outcome.clone());
        self.inflight.lock().unwrap().remove(key);
        outcome
    }
}
