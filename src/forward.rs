use crate::errors::{render, ProxyError};
use crate::middleware::{CanonicalPath, HOP_BY_HOP_HEADERS};
use crate::oidc::{GrantError, TokenGrant};
use crate::server::Gatekeeper;
use actix_web::http::header;
use actix_web::{web, HttpMessage, HttpRequest, HttpResponse};
use std::sync::Arc;
use std::time::{Duration, Instant};
use url::Url;

/// Refresh the signer token this long before it actually expires.
const SIGNER_EXPIRY_SLACK: Duration = Duration::from_secs(30);
const SIGNER_DEFAULT_LIFETIME: Duration = Duration::from_secs(60);

fn accept_of(req: &HttpRequest) -> Option<&str> {
    req.headers()
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|hop| hop.eq_ignore_ascii_case(name))
}

fn should_forward_request_header(name: &str) -> bool {
    !is_hop_by_hop(name) && !name.eq_ignore_ascii_case("host")
}

fn should_forward_response_header(name: &str) -> bool {
    !is_hop_by_hop(name) && !name.eq_ignore_ascii_case("content-length")
}

/// Join the upstream base with the canonical request path and query.
fn join_upstream_url(base: &Url, path: &str, query: Option<&str>) -> Url {
    let mut url = base.clone();
    let base_path = base.path().trim_end_matches('/');
    url.set_path(&format!("{}{}", base_path, path));
    url.set_query(query);
    url
}

fn copy_request_headers(req: &HttpRequest, headers: &mut reqwest::header::HeaderMap) {
    for (name, value) in req.headers() {
        if !should_forward_request_header(name.as_str()) {
            continue;
        }
        if let (Ok(header_name), Ok(header_value)) = (
            reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            headers.append(header_name, header_value);
        }
    }
    let info = req.connection_info();
    if let Ok(proto) = reqwest::header::HeaderValue::from_str(info.scheme()) {
        headers.insert(
            reqwest::header::HeaderName::from_static("x-forwarded-proto"),
            proto,
        );
    }
    if let Ok(host) = reqwest::header::HeaderValue::from_str(info.host()) {
        headers.insert(
            reqwest::header::HeaderName::from_static("x-forwarded-host"),
            host,
        );
    }
    if let Some(peer) = req.peer_addr() {
        if let Ok(peer_value) = reqwest::header::HeaderValue::from_str(&peer.ip().to_string()) {
            headers.append(
                reqwest::header::HeaderName::from_static("x-forwarded-for"),
                peer_value,
            );
        }
    }
}

async fn relay(
    client: &reqwest::Client,
    method: &actix_web::http::Method,
    url: Url,
    headers: reqwest::header::HeaderMap,
    body: web::Bytes,
) -> Result<HttpResponse, ProxyError> {
    let method = reqwest::Method::from_bytes(method.as_str().as_bytes())
        .map_err(|err| ProxyError::UpstreamUnreachable(err.into()))?;
    let mut request = client.request(method, url).headers(headers);
    if !body.is_empty() {
        request = request.body(body);
    }
    let response = request
        .send()
        .await
        .map_err(|err| ProxyError::UpstreamUnreachable(err.into()))?;

    let status = actix_web::http::StatusCode::from_u16(response.status().as_u16())
        .unwrap_or(actix_web::http::StatusCode::BAD_GATEWAY);
    let mut builder = HttpResponse::build(status);
    for (name, value) in response.headers() {
        if !should_forward_response_header(name.as_str()) {
            continue;
        }
        if let (Ok(header_name), Ok(header_value)) = (
            header::HeaderName::from_bytes(name.as_str().as_bytes()),
            header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            builder.append_header((header_name, header_value));
        }
    }
    let payload = response
        .bytes()
        .await
        .map_err(|err| ProxyError::UpstreamUnreachable(err.into()))?;
    Ok(builder.body(payload))
}

/// The upstream origin of the reverse proxy.
pub struct Upstream {
    client: reqwest::Client,
    base: Url,
}

impl Upstream {
    pub fn new(
        upstream_url: &str,
        timeout: Duration,
        skip_tls_verify: bool,
    ) -> Result<Upstream, ProxyError> {
        let base = Url::parse(upstream_url)
            .map_err(|err| ProxyError::ConfigInvalid(format!("invalid upstream_url: {}", err)))?;
        if skip_tls_verify {
            log::warn!("upstream tls verification is switched off");
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(skip_tls_verify)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|err| ProxyError::ConfigInvalid(err.to_string()))?;
        Ok(Upstream { client, base })
    }
}

/// Terminal handler of the protected chain: relay the request to the origin.
pub async fn forward_upstream(
    req: HttpRequest,
    body: web::Bytes,
    data: web::Data<Gatekeeper>,
) -> HttpResponse {
    let Some(upstream) = data.upstream.as_ref() else {
        return render(
            &ProxyError::UpstreamUnreachable(anyhow::anyhow!("no upstream configured")),
            accept_of(&req),
        );
    };
    let path = req
        .extensions()
        .get::<CanonicalPath>()
        .map(|c| c.0.clone())
        .unwrap_or_else(|| req.path().to_string());
    let url = join_upstream_url(&upstream.base, &path, query_of(&req));

    let mut headers = reqwest::header::HeaderMap::new();
    copy_request_headers(&req, &mut headers);

    match relay(&upstream.client, req.method(), url, headers, body).await {
        Ok(response) => response,
        Err(err) => {
            log::error!("unable to relay the request upstream: {}", err);
            render(&err, accept_of(&req))
        }
    }
}

fn query_of(req: &HttpRequest) -> Option<&str> {
    match req.query_string() {
        "" => None,
        query => Some(query),
    }
}

/// Outbound gateway of the forward-signing mode.
///
/// Requests from local clients are relayed to their destination with the
/// proxy's own bearer token attached, acquired through the client-credentials
/// grant and refreshed shortly before expiry. TLS interception is the
/// embedded MITM engine's concern; this handler signs whatever reaches it.
pub struct ForwardSigner {
    idp: Arc<dyn TokenGrant>,
    client: reqwest::Client,
    token: tokio::sync::Mutex<Option<SignerToken>>,
}

struct SignerToken {
    access_token: String,
    expires_at: Instant,
}

impl ForwardSigner {
    pub fn new(
        idp: Arc<dyn TokenGrant>,
        timeout: Duration,
        skip_tls_verify: bool,
    ) -> Result<ForwardSigner, ProxyError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(skip_tls_verify)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|err| ProxyError::ConfigInvalid(err.to_string()))?;
        Ok(ForwardSigner {
            idp,
            client,
            token: tokio::sync::Mutex::new(None),
        })
    }

    /// The proxy's own bearer token, exchanged anew when close to expiry.
    async fn bearer(&self) -> Result<String, GrantError> {
        let mut slot = self.token.lock().await;
        if let Some(current) = slot.as_ref() {
            if current.expires_at > Instant::now() + SIGNER_EXPIRY_SLACK {
                return Ok(current.access_token.clone());
            }
        }
        log::debug!("renewing the forward-signing service token");
        let tokens = self.idp.client_credentials().await?;
        let lifetime = tokens.expires_in.unwrap_or(SIGNER_DEFAULT_LIFETIME);
        let access_token = tokens.access_token.clone();
        *slot = Some(SignerToken {
            access_token: tokens.access_token,
            expires_at: Instant::now() + lifetime,
        });
        Ok(access_token)
    }
}

/// Handler of the forward-signing mode: every request is signed and relayed
/// to the host it names.
pub async fn forward_signed(
    req: HttpRequest,
    body: web::Bytes,
    signer: web::Data<ForwardSigner>,
) -> HttpResponse {
    // Absolute-form URI from a proxying client, otherwise fall back on Host.
    let target = if req.uri().scheme().is_some() && req.uri().authority().is_some() {
        req.uri().to_string()
    } else {
        let info = req.connection_info();
        format!("{}://{}{}", info.scheme(), info.host(), req.uri())
    };
    let url = match Url::parse(&target) {
        Ok(url) => url,
        Err(err) => {
            return render(
                &ProxyError::MalformedRequest(format!("invalid target url: {}", err)),
                accept_of(&req),
            )
        }
    };

    let bearer = match signer.bearer().await {
        Ok(bearer) => bearer,
        Err(err) => {
            log::error!("unable to obtain a signing token: {}", err);
            return render(
                &ProxyError::IdpUnreachable(anyhow::anyhow!(err.to_string())),
                accept_of(&req),
            );
        }
    };

    let mut headers = reqwest::header::HeaderMap::new();
    copy_request_headers(&req, &mut headers);
    if let Ok(value) = reqwest::header::HeaderValue::from_str(&format!("Bearer {}", bearer)) {
        headers.insert(reqwest::header::AUTHORIZATION, value);
    }

    match relay(&signer.client, req.method(), url, headers, body).await {
        Ok(response) => response,
        Err(err) => {
            log::error!("unable to relay the signed request: {}", err);
            render(&err, accept_of(&req))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_join_upstream_url_preserves_base_path_and_query() {
        let base = Url::parse("http://upstream:8080").unwrap();
        assert_eq!(
            join_upstream_url(&base, "/admin/test", Some("a=1&b=2")).as_str(),
            "http://upstream:8080/admin/test?a=1&b=2"
        );

        let prefixed = Url::parse("http://upstream:8080/service/").unwrap();
        assert_eq!(
            join_upstream_url(&prefixed, "/admin", None).as_str(),
            "http://upstream:8080/service/admin"
        );
    }

    #[test]
    fn test_hop_by_hop_headers_are_not_forwarded() {
        assert!(!should_forward_request_header("Connection"));
        assert!(!should_forward_request_header("Transfer-Encoding"));
        assert!(!should_forward_request_header("Upgrade"));
        assert!(!should_forward_request_header("host"));
        assert!(should_forward_request_header("X-Request-Id"));
        assert!(should_forward_request_header("Cookie"));

        assert!(!should_forward_response_header("content-length"));
        assert!(should_forward_response_header("content-type"));
    }
}
