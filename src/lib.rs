#![doc = r#"
# oidc-gatekeeper

An authenticating reverse proxy for the [Actix web framework](https://actix.rs),
sitting in front of an upstream HTTP service and enforcing OpenID Connect
authentication plus role and claim based authorization on every request.

The proxy brokers the OAuth2 authorization code flow with an OIDC provider,
validates bearer tokens against the provider's JWKS, maintains encrypted and
chunked session cookies for browser clients, silently refreshes expired
access tokens, and propagates the resulting identity to the upstream through
`X-Auth-*` headers.

# Getting started

Point the proxy at an OIDC realm and an upstream, and declare which URI
prefixes need which roles:

```yaml
listen: 0.0.0.0:3000
discovery_url: https://idp.example.com/realms/main
client_id: gatekeeper
client_secret: s3cr3t
upstream_url: http://127.0.0.1:8080
redirection_url: https://www.example.com
enable_refresh_tokens: true
encryption_key: 0123456789abcdef0123456789abcdef
resources:
  - uri: /admin
    methods: [GET, POST]
    roles: [admin]
  - uri: /metrics
    whitelisted: true
```

```shell
oidc-gatekeeper --config gatekeeper.yaml
```

Every option is also reachable as a `PROXY_` environment variable or a
command line flag; flags win over the environment, the environment wins over
the file.

Requests are matched against the resource table in declaration order, the
first URI prefix and method hit wins. Unauthenticated browsers are bounced
through `/oauth/authorize` to the provider and return via `/oauth/callback`
with their session in chunked, optionally AES-GCM encrypted cookies. API
clients present `Authorization: Bearer` and receive plain `401`s.

Embedding the proxy in an existing binary:

```rust,ignore
use oidc_gatekeeper::{Config, ProxyServer};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_file("gatekeeper.yaml".as_ref())?;
    ProxyServer::new(config).await?.run().await?;
    Ok(())
}
```

An externally implemented session backend can be injected with
[`ProxyServer::with_store`]; the crate itself ships the in-memory one.
"#]

pub mod config;
pub mod cookie;
pub mod errors;
pub mod forward;
pub mod jwks;
pub mod metrics;
pub mod middleware;
pub mod oidc;
pub mod resource;
pub mod route;
pub mod server;
pub mod store;
pub mod token;
pub mod user;

pub use config::Config;
pub use errors::ProxyError;
pub use oidc::TokenGrant;
pub use server::ProxyServer;
pub use store::SessionStore;
pub use user::UserContext;
