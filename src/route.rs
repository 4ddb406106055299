use crate::cookie::read_cookie;
use crate::errors::{render, ProxyError};
use crate::oidc::{GrantError, TokenGrant};
use crate::server::Gatekeeper;
use crate::token::{access_token_hash, unverified_claims};
use crate::{store, user::UserContext};
use actix_web::http::header;
use actix_web::{get, post, web, HttpRequest, HttpResponse, Responder};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// Cookie holding the login handshake, `{nonce -> state}`.
pub(crate) const REQUEST_URI_COOKIE: &str = "request_uri";

/// Lifetime of the login handshake cookie.
const REQUEST_STATE_TTL: Duration = Duration::from_secs(300);

/// The login handshake persisted between `/authorize` and `/callback`.
#[derive(Serialize, Deserialize)]
struct RequestState {
    nonce: String,
    state: String,
}

#[derive(Deserialize)]
struct AuthorizeQuery {
    state: Option<String>,
}

#[derive(Deserialize)]
struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

#[derive(Deserialize)]
struct LogoutQuery {
    redirect: Option<String>,
}

#[derive(Deserialize)]
struct LoginForm {
    username: String,
    password: String,
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(authorize)
        .service(callback)
        .service(logout)
        .service(token_view)
        .service(login)
        .service(health)
        .service(expired)
        .service(metrics);
}

fn accept_of(req: &HttpRequest) -> Option<&str> {
    req.headers()
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
}

/// The external base of the proxy, configured or derived from the Host header.
fn external_base(req: &HttpRequest, data: &Gatekeeper) -> String {
    match data.config.external_url() {
        Some(base) => base.to_string(),
        None => {
            let info = req.connection_info();
            format!("{}://{}", info.scheme(), info.host())
        }
    }
}

fn callback_uri(req: &HttpRequest, data: &Gatekeeper) -> String {
    format!(
        "{}{}",
        external_base(req, data),
        data.config.oauth_path("/callback")
    )
}

/// A login `state` must be a relative path or an absolute URL on this host.
fn validated_state(state: &str, req: &HttpRequest) -> Option<String> {
    if state.starts_with('/') && !state.starts_with("//") {
        return Some(state.to_string());
    }
    let url = Url::parse(state).ok()?;
    let host = url.host_str()?;
    let authority = match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };
    if authority == req.connection_info().host() {
        Some(state.to_string())
    } else {
        None
    }
}

fn random_nonce() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// The bearer token of the current session, from header or access cookie.
fn session_token(req: &HttpRequest, data: &Gatekeeper) -> Option<String> {
    if let Some(value) = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(token) = value.strip_prefix("Bearer ") {
            return Some(token.trim().to_string());
        }
    }
    let sealed = read_cookie(req, &data.config.cookie_access_name)?;
    data.access_codec.decode(&sealed).ok()
}

/// Loopback gate shared by the metrics and token debug views.
fn localhost_only(req: &HttpRequest) -> bool {
    let peer_is_local = req
        .peer_addr()
        .map(|addr| addr.ip().is_loopback())
        .unwrap_or(false);
    let forwarded_is_local = match req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        None => true,
        Some(chain) => chain
            .split(',')
            .all(|hop| hop.trim().parse::<std::net::IpAddr>().map(|ip| ip.is_loopback()).unwrap_or(false)),
    };
    peer_is_local && forwarded_is_local
}

/// Begin the authorization code flow: stash the handshake in a short-lived
/// cookie and bounce the client to the IDP.
#[get("/authorize")]
async fn authorize(
    req: HttpRequest,
    query: web::Query<AuthorizeQuery>,
    data: web::Data<Gatekeeper>,
) -> impl Responder {
    let Some(idp) = data.idp.as_ref() else {
        return render(
            &ProxyError::IdpUnreachable(anyhow::anyhow!("no identity provider configured")),
            accept_of(&req),
        );
    };

    let state = match &query.state {
        None => "/".to_string(),
        Some(raw) => match validated_state(raw, &req) {
            Some(state) => state,
            None => {
                return render(
                    &ProxyError::MalformedRequest("unsafe state parameter".to_string()),
                    accept_of(&req),
                )
            }
        },
    };

    let nonce = random_nonce();
    let auth_url = match idp.authorize_url(&nonce, &callback_uri(&req, &data)) {
        Ok(url) => url,
        Err(err) => return render(&err, accept_of(&req)),
    };

    let handshake = RequestState { nonce, state };
    let serialized = match serde_json::to_string(&handshake) {
        Ok(serialized) => serialized,
        Err(err) => {
            log::error!("unable to serialize the login handshake: {}", err);
            return HttpResponse::InternalServerError().finish();
        }
    };
    let sealed = match data.access_codec.encode(&serialized) {
        Ok(sealed) => sealed,
        Err(err) => return render(&err, accept_of(&req)),
    };

    let mut response = HttpResponse::TemporaryRedirect();
    for cookie in data.jar.write(REQUEST_URI_COOKIE, &sealed, REQUEST_STATE_TTL) {
        response.cookie(cookie);
    }
    response
        .insert_header((header::LOCATION, auth_url.to_string()))
        .finish()
}

/// Complete the flow: check the handshake, exchange the code and establish
/// the session cookies.
#[get("/callback")]
async fn callback(
    req: HttpRequest,
    query: web::Query<CallbackQuery>,
    data: web::Data<Gatekeeper>,
) -> impl Responder {
    let Some(idp) = data.idp.as_ref() else {
        return render(
            &ProxyError::IdpUnreachable(anyhow::anyhow!("no identity provider configured")),
            accept_of(&req),
        );
    };

    if let Some(error) = &query.error {
        let description = query.error_description.clone().unwrap_or_default();
        log::warn!("authorization rejected by the idp: {} {}", error, description);
        return render(&ProxyError::Forbidden, accept_of(&req));
    }
    let (Some(code), Some(state)) = (&query.code, &query.state) else {
        return render(
            &ProxyError::MalformedRequest("missing code or state".to_string()),
            accept_of(&req),
        );
    };

    let handshake: Option<RequestState> = read_cookie(&req, REQUEST_URI_COOKIE)
        .and_then(|sealed| data.access_codec.decode(&sealed).ok())
        .and_then(|raw| serde_json::from_str(&raw).ok());
    let Some(handshake) = handshake else {
        return render(
            &ProxyError::MalformedRequest("login handshake cookie is missing".to_string()),
            accept_of(&req),
        );
    };
    if handshake.nonce != *state {
        return render(
            &ProxyError::MalformedRequest("state does not match the handshake".to_string()),
            accept_of(&req),
        );
    }

    let tokens = match idp.exchange_code(code, &callback_uri(&req, &data)).await {
        Ok(tokens) => tokens,
        Err(GrantError::Rejected(reason)) => {
            log::warn!("code exchange was rejected: {}", reason);
            return render(&ProxyError::Forbidden, accept_of(&req));
        }
        Err(GrantError::Transport(reason)) => {
            return render(
                &ProxyError::IdpUnreachable(anyhow::anyhow!(reason)),
                accept_of(&req),
            )
        }
    };

    let user = match data.verifier.verify(&tokens.access_token).await {
        Ok(claims) => UserContext::from_claims(claims, &tokens.access_token, false),
        Err(_) => None,
    };
    let Some(user) = user else {
        log::warn!("the exchanged access token failed verification");
        return render(&ProxyError::Forbidden, accept_of(&req));
    };
    log::info!("issuing a session for {}", user.preferred_name);

    let access_ttl = std::cmp::min(
        Duration::from_secs(user.expires_in() as u64),
        data.config.access_token_duration(),
    );
    let sealed_access = match data.access_codec.encode(&tokens.access_token) {
        Ok(sealed) => sealed,
        Err(err) => return render(&err, accept_of(&req)),
    };

    let mut response = HttpResponse::TemporaryRedirect();
    for cookie in data
        .jar
        .write(&data.config.cookie_access_name, &sealed_access, access_ttl)
    {
        response.cookie(cookie);
    }

    if data.config.enable_refresh_tokens {
        if let (Some(refresh), Some(codec)) = (&tokens.refresh_token, &data.refresh_codec) {
            match codec.encode(refresh) {
                Ok(sealed_refresh) => match &data.store {
                    Some(session_store) => {
                        store::set_with_deadline(
                            session_store.as_ref(),
                            &access_token_hash(&tokens.access_token),
                            &sealed_refresh,
                            data.config.refresh_token_lifetime(),
                        )
                        .await;
                    }
                    None => {
                        for cookie in data.jar.write(
                            &data.config.cookie_refresh_name,
                            &sealed_refresh,
                            data.config.refresh_token_lifetime(),
                        ) {
                            response.cookie(cookie);
                        }
                    }
                },
                Err(err) => log::warn!("unable to seal the refresh token: {}", err),
            }
        }
    }

    for cookie in data.jar.clear(&req, REQUEST_URI_COOKIE) {
        response.cookie(cookie);
    }

    response
        .insert_header((header::LOCATION, handshake.state))
        .finish()
}

/// Drop the session, revoking the access token with the IDP best-effort.
#[get("/logout")]
async fn logout(
    req: HttpRequest,
    query: web::Query<LogoutQuery>,
    data: web::Data<Gatekeeper>,
) -> impl Responder {
    if let Some(token) = session_token(&req, &data) {
        if let Some(session_store) = &data.store {
            store::delete_with_deadline(session_store.as_ref(), &access_token_hash(&token)).await;
        }
        if let Some(idp) = data.idp.as_ref() {
            idp.revoke(&token).await;
        }
    }

    let mut response = match &query.redirect {
        Some(redirect) => {
            let mut builder = HttpResponse::SeeOther();
            builder.insert_header((header::LOCATION, redirect.as_str()));
            builder
        }
        None => HttpResponse::Ok(),
    };
    for name in [
        data.config.cookie_access_name.as_str(),
        data.config.cookie_refresh_name.as_str(),
        REQUEST_URI_COOKIE,
    ] {
        for cookie in data.jar.clear(&req, name) {
            response.cookie(cookie);
        }
    }
    response.finish()
}

/// Debug view of the current session's token payload.
#[get("/token")]
async fn token_view(req: HttpRequest, data: web::Data<Gatekeeper>) -> impl Responder {
    if data.config.localhost_metrics && !localhost_only(&req) {
        return render(&ProxyError::Forbidden, accept_of(&req));
    }
    let Some(token) = session_token(&req, &data) else {
        return render(&ProxyError::unauthorized(), accept_of(&req));
    };
    match unverified_claims(&token) {
        Ok(claims) => HttpResponse::Ok().json(claims),
        Err(err) => render(&err, accept_of(&req)),
    }
}

/// Resource-owner password grant; disabled unless explicitly enabled.
#[post("/login")]
async fn login(
    req: HttpRequest,
    form: web::Form<LoginForm>,
    data: web::Data<Gatekeeper>,
) -> impl Responder {
    if !data.config.enable_login_handler {
        return HttpResponse::NotFound().finish();
    }
    let Some(idp) = data.idp.as_ref() else {
        return render(
            &ProxyError::IdpUnreachable(anyhow::anyhow!("no identity provider configured")),
            accept_of(&req),
        );
    };
    match idp.password_grant(&form.username, &form.password).await {
        Ok(tokens) => HttpResponse::Ok().json(serde_json::json!({
            "access_token": tokens.access_token,
            "token_type": "Bearer",
            "expires_in": tokens.expires_in.map(|d| d.as_secs()),
            "refresh_token": tokens.refresh_token,
        })),
        Err(GrantError::Rejected(reason)) => {
            log::warn!("password grant rejected: {}", reason);
            render(&ProxyError::unauthorized(), accept_of(&req))
        }
        Err(GrantError::Transport(reason)) => render(
            &ProxyError::IdpUnreachable(anyhow::anyhow!(reason)),
            accept_of(&req),
        ),
    }
}

#[get("/health")]
async fn health() -> impl Responder {
    HttpResponse::Ok().body("OK\n")
}

/// 200 while the session is live, 401 once it has expired.
#[get("/expired")]
async fn expired(req: HttpRequest, data: web::Data<Gatekeeper>) -> impl Responder {
    let Some(token) = session_token(&req, &data) else {
        return render(&ProxyError::unauthorized(), accept_of(&req));
    };
    let user = match data.verifier.verify(&token).await {
        Ok(claims) => UserContext::from_claims(claims, &token, false),
        Err(_) => None,
    };
    match user {
        Some(user)
            if !user.is_expired(Duration::from_secs(data.config.token_clock_skew_secs)) =>
        {
            HttpResponse::Ok().finish()
        }
        _ => render(&ProxyError::unauthorized(), accept_of(&req)),
    }
}

#[get("/metrics")]
async fn metrics(req: HttpRequest, data: web::Data<Gatekeeper>) -> impl Responder {
    if !data.config.enable_metrics {
        return HttpResponse::NotFound().finish();
    }
    if data.config.localhost_metrics && !localhost_only(&req) {
        return render(&ProxyError::Forbidden, accept_of(&req));
    }
    match data.metrics.export() {
        Ok(text) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4; charset=utf-8")
            .body(text),
        Err(err) => {
            log::error!("unable to encode metrics: {}", err);
            HttpResponse::InternalServerError().finish()
        }
    }
}
