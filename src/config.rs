use crate::errors::ProxyError;
use crate::resource::ResourceTable;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

const ENCRYPTION_KEY_SIZES: [usize; 2] = [16, 32];

fn default_listen() -> String {
    "127.0.0.1:3000".to_string()
}

fn default_oauth_uri() -> String {
    "/oauth".to_string()
}

fn default_cookie_access_name() -> String {
    "gk-access".to_string()
}

fn default_cookie_refresh_name() -> String {
    "gk-refresh".to_string()
}

fn default_scopes() -> Vec<String> {
    vec!["openid".to_string()]
}

fn default_upstream_timeout() -> u64 {
    10
}

fn default_shutdown_timeout() -> u64 {
    10
}

fn default_access_token_duration() -> u64 {
    // 12 hours, the upper clamp on the access cookie lifetime
    12 * 3600
}

fn default_refresh_token_lifetime() -> u64 {
    3 * 3600
}

/// A protected resource as declared in the configuration file.
///
/// Declaration order matters: the first resource whose URI prefix and method
/// set match a request wins. See [`ResourceTable`] for the compiled form.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ResourceConfig {
    /// URI prefix, no trailing slash.
    pub uri: String,
    /// Methods guarded on this prefix; `ANY` is the wildcard. Empty means `ANY`.
    #[serde(default)]
    pub methods: Vec<String>,
    /// Roles the user must hold. Empty means any authenticated user.
    #[serde(default)]
    pub roles: Vec<String>,
    /// Require any one role instead of all of them.
    #[serde(default)]
    pub require_any_role: bool,
    /// Claim name to regex predicates, overriding global `match_claims` on key collision.
    #[serde(default)]
    pub claims_match: HashMap<String, String>,
    /// Skip authentication and authorization entirely.
    #[serde(default)]
    pub whitelisted: bool,
    /// Extra static headers injected upstream for this resource only.
    #[serde(default)]
    pub custom_headers: HashMap<String, String>,
}

/// Proxy configuration, immutable after startup.
///
/// Loaded from a YAML file, then overridden by `PROXY_`-prefixed environment
/// variables and command line flags (flag > env > file > default). The flag
/// and env mapping is declared on [`crate::main`]'s clap struct; list and map
/// options are file-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Interface the service listens on.
    pub listen: String,
    /// OIDC issuer base; discovery appends `/.well-known/openid-configuration`.
    pub discovery_url: String,
    pub client_id: String,
    pub client_secret: String,
    /// External URL of the proxy; empty derives it from the Host header.
    pub redirection_url: String,
    /// Origin requests are forwarded to.
    pub upstream_url: String,
    /// The protected resource table, evaluated in declaration order.
    pub resources: Vec<ResourceConfig>,
    /// Global claim to regex predicates applied to every protected resource.
    pub match_claims: HashMap<String, String>,
    /// Claim names propagated upstream as `X-Auth-<Name>` headers.
    pub add_claims: Vec<String>,
    /// Static headers injected on every upstream request.
    pub headers: HashMap<String, String>,
    /// AES key (16 or 32 bytes) for cookie encryption; required when
    /// `enable_encrypted_token` or `enable_refresh_tokens` is set.
    pub encryption_key: String,
    pub enable_encrypted_token: bool,
    /// Persist the refresh token and silently refresh expired access tokens.
    pub enable_refresh_tokens: bool,
    /// Session backend URL; empty keeps the refresh token in an encrypted cookie.
    pub store_url: String,
    pub cookie_access_name: String,
    pub cookie_refresh_name: String,
    /// Return 401 on authentication failure instead of redirecting browsers to the IDP.
    pub no_redirects: bool,
    /// TESTING ONLY: accept tokens without verifying them.
    pub skip_token_verification: bool,
    /// Relax the audience check.
    pub skip_client_id: bool,
    /// Relax the issuer check.
    pub skip_issuer_check: bool,
    /// Switch to the outbound forward-signing mode.
    pub enable_forwarding: bool,
    /// Enable the resource-owner password grant on `POST /oauth/login`.
    pub enable_login_handler: bool,
    /// Inject `Authorization: Bearer` upstream.
    pub enable_authorization_header: bool,
    /// Inject `X-Auth-Token` upstream.
    pub enable_token_header: bool,
    pub enable_logging: bool,
    pub enable_metrics: bool,
    /// Only serve `/oauth/metrics` and `/oauth/token` to localhost peers.
    pub localhost_metrics: bool,
    /// Mark session cookies `Secure`; set when terminating TLS in front.
    pub secure_cookies: bool,
    /// OAuth2 scopes requested during the authorization flow.
    pub scopes: Vec<String>,
    /// Base path the OAuth handlers are mounted under.
    pub oauth_uri: String,
    pub cors_origins: Vec<String>,
    pub cors_methods: Vec<String>,
    pub cors_headers: Vec<String>,
    pub cors_credentials: bool,
    pub cors_max_age: u64,
    pub upstream_timeout_secs: u64,
    pub skip_upstream_tls_verify: bool,
    pub server_shutdown_timeout_secs: u64,
    /// Upper clamp on the access cookie lifetime, seconds.
    pub access_token_duration_secs: u64,
    /// Lifetime of persisted refresh tokens, seconds.
    pub refresh_token_lifetime_secs: u64,
    /// Allowed clock skew when checking token expiry, seconds.
    pub token_clock_skew_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen: default_listen(),
            discovery_url: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            redirection_url: String::new(),
            upstream_url: String::new(),
            resources: Vec::new(),
            match_claims: HashMap::new(),
            add_claims: Vec::new(),
            headers: HashMap::new(),
            encryption_key: String::new(),
            enable_encrypted_token: false,
            enable_refresh_tokens: false,
            store_url: String::new(),
            cookie_access_name: default_cookie_access_name(),
            cookie_refresh_name: default_cookie_refresh_name(),
            no_redirects: false,
            skip_token_verification: false,
            skip_client_id: false,
            skip_issuer_check: false,
            enable_forwarding: false,
            enable_login_handler: false,
            enable_authorization_header: false,
            enable_token_header: false,
            enable_logging: true,
            enable_metrics: false,
            localhost_metrics: false,
            secure_cookies: false,
            scopes: default_scopes(),
            oauth_uri: default_oauth_uri(),
            cors_origins: Vec::new(),
            cors_methods: Vec::new(),
            cors_headers: Vec::new(),
            cors_credentials: false,
            cors_max_age: 0,
            upstream_timeout_secs: default_upstream_timeout(),
            skip_upstream_tls_verify: false,
            server_shutdown_timeout_secs: default_shutdown_timeout(),
            access_token_duration_secs: default_access_token_duration(),
            refresh_token_lifetime_secs: default_refresh_token_lifetime(),
            token_clock_skew_secs: 0,
        }
    }
}

impl Config {
    /// Load the configuration from a YAML file.
    pub fn from_file(path: &Path) -> Result<Config, ProxyError> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            ProxyError::ConfigInvalid(format!("unable to read {}: {}", path.display(), err))
        })?;
        serde_yaml::from_str(&raw).map_err(|err| {
            ProxyError::ConfigInvalid(format!("unable to parse {}: {}", path.display(), err))
        })
    }

    /// Validate the configuration and compile the resource table.
    ///
    /// Resource URIs are normalized (trailing slashes trimmed with a warning,
    /// matching the behaviour the service has always had) and claim regexes
    /// are compiled here so a bad pattern fails at startup rather than on the
    /// first matching request.
    pub fn validate(&mut self) -> Result<ResourceTable, ProxyError> {
        if self.discovery_url.is_empty() && !self.skip_token_verification {
            return Err(ProxyError::ConfigInvalid(
                "discovery_url is required".to_string(),
            ));
        }
        if self.enable_forwarding && self.skip_token_verification {
            return Err(ProxyError::ConfigInvalid(
                "forward-signing mode requires an identity provider".to_string(),
            ));
        }
        if self.upstream_url.is_empty() && !self.enable_forwarding {
            return Err(ProxyError::ConfigInvalid(
                "upstream_url is required in reverse proxy mode".to_string(),
            ));
        }
        if !self.upstream_url.is_empty() {
            let upstream = url::Url::parse(&self.upstream_url).map_err(|err| {
                ProxyError::ConfigInvalid(format!("invalid upstream_url: {}", err))
            })?;
            if !matches!(upstream.scheme(), "http" | "https") {
                return Err(ProxyError::ConfigInvalid(format!(
                    "unsupported upstream scheme {}, the embedded transport only speaks http and https",
                    upstream.scheme()
                )));
            }
        }
        if self.enable_encrypted_token || self.enable_refresh_tokens {
            if !ENCRYPTION_KEY_SIZES.contains(&self.encryption_key.len()) {
                return Err(ProxyError::ConfigInvalid(
                    "encryption_key must be 16 or 32 bytes when encrypted tokens or refresh tokens are enabled"
                        .to_string(),
                ));
            }
        }
        if !self.store_url.is_empty() {
            crate::store::validate_store_url(&self.store_url)?;
        }
        if !self.oauth_uri.starts_with('/') {
            return Err(ProxyError::ConfigInvalid(
                "oauth_uri must start with /".to_string(),
            ));
        }
        if self.client_id.is_empty() && self.client_secret.is_empty() && !self.skip_token_verification {
            log::warn!("client credentials are not set, depending on the provider you might be unable to authenticate");
        }
        if self.redirection_url.is_empty() {
            log::warn!("no redirection_url has been set, will use host headers");
        }
        if self.upstream_url.is_empty() && (self.enable_authorization_header || self.enable_token_header)
        {
            log::warn!("token headers are enabled without an upstream, you sure you want tokens proxied?");
        }

        for resource in &mut self.resources {
            if resource.uri.len() > 1 && resource.uri.ends_with('/') {
                let trimmed = resource.uri.trim_end_matches('/').to_string();
                log::warn!(
                    "resource uri {} is not a prefix, amending to {}",
                    resource.uri,
                    trimmed
                );
                resource.uri = trimmed;
            }
        }

        ResourceTable::compile(&self.resources, &self.match_claims)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }

    pub fn access_token_duration(&self) -> Duration {
        Duration::from_secs(self.access_token_duration_secs)
    }

    pub fn refresh_token_lifetime(&self) -> Duration {
        Duration::from_secs(self.refresh_token_lifetime_secs)
    }

    /// The external base URL of the proxy, or `None` when it must be derived
    /// from the Host header of the incoming request.
    pub fn external_url(&self) -> Option<&str> {
        if self.redirection_url.is_empty() {
            None
        } else {
            Some(self.redirection_url.trim_end_matches('/'))
        }
    }

    /// Absolute path of an OAuth handler, e.g. `/oauth/callback`.
    pub fn oauth_path(&self, suffix: &str) -> String {
        format!("{}{}", self.oauth_uri.trim_end_matches('/'), suffix)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn minimal() -> Config {
        Config {
            discovery_url: "https://idp.example.com/realms/test".to_string(),
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
            upstream_url: "http://127.0.0.1:8080".to_string(),
            ..Config::default()
        }
    }

    #[test]
    fn test_defaults_round_trip_through_yaml() {
        let cfg: Config = serde_yaml::from_str("discovery_url: https://idp/realm").unwrap();
        assert_eq!(cfg.listen, "127.0.0.1:3000");
        assert_eq!(cfg.oauth_uri, "/oauth");
        assert_eq!(cfg.scopes, vec!["openid".to_string()]);
        assert_eq!(cfg.upstream_timeout_secs, 10);
    }

    #[test]
    fn test_missing_discovery_url_is_rejected() {
        let mut cfg = minimal();
        cfg.discovery_url.clear();
        assert!(matches!(
            cfg.validate(),
            Err(ProxyError::ConfigInvalid(msg)) if msg.contains("discovery_url")
        ));
    }

    #[test]
    fn test_encryption_key_length_is_enforced() {
        let mut cfg = minimal();
        cfg.enable_refresh_tokens = true;
        cfg.encryption_key = "short".to_string();
        assert!(cfg.validate().is_err());

        cfg.encryption_key = "0123456789abcdef".to_string();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_trailing_slash_resources_are_amended() {
        let mut cfg = minimal();
        cfg.resources.push(ResourceConfig {
            uri: "/admin/".to_string(),
            ..ResourceConfig::default()
        });
        cfg.validate().unwrap();
        assert_eq!(cfg.resources[0].uri, "/admin");
    }

    #[test]
    fn test_unknown_upstream_scheme_is_rejected() {
        let mut cfg = minimal();
        cfg.upstream_url = "unix:///var/run/app.sock".to_string();
        assert!(matches!(
            cfg.validate(),
            Err(ProxyError::ConfigInvalid(msg)) if msg.contains("unsupported upstream scheme")
        ));
    }

    #[test]
    fn test_oauth_path_joins_base_and_suffix() {
        let cfg = minimal();
        assert_eq!(cfg.oauth_path("/callback"), "/oauth/callback");
    }
}
