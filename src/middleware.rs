use crate::cookie::read_cookie;
use crate::errors::{render, ProxyError};
use crate::oidc::{GrantError, TokenGrant, TokenSet};
use crate::resource::{canonicalize_path, Resource};
use crate::server::Gatekeeper;
use crate::store;
use crate::token::access_token_hash;
use crate::user::UserContext;
use actix_web::body::EitherBody;
use actix_web::cookie::Cookie;
use actix_web::dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::http::header::{self, HeaderName, HeaderValue};
use actix_web::web::Data;
use actix_web::{Error, HttpMessage, HttpResponse};
use futures_util::future::LocalBoxFuture;
use futures_util::FutureExt;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use std::future::{ready, Ready};
use std::panic::AssertUnwindSafe;
use std::rc::Rc;

/// Hop-by-hop headers stripped before a request is forwarded.
pub(crate) const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// The canonical request path, attached by the entrypoint middleware.
#[derive(Debug, Clone)]
pub struct CanonicalPath(pub String);

/// The resource the request matched, attached by the authentication middleware.
#[derive(Debug, Clone)]
pub struct MatchedResource(pub std::sync::Arc<Resource>);

fn gatekeeper(req: &ServiceRequest) -> Option<Data<Gatekeeper>> {
    req.app_data::<Data<Gatekeeper>>().cloned()
}

fn is_oauth_path(req: &ServiceRequest, data: &Gatekeeper) -> bool {
    let base = data.config.oauth_uri.trim_end_matches('/');
    let path = req.path();
    path == base || path.starts_with(&format!("{}/", base))
}

/// `true` when the client looks like a browser we may bounce to the IDP.
///
/// `Accept: */*` counts: an absent or wildcard preference gets the redirect,
/// only clients explicitly asking for something other than html get the 401.
fn browser_like(req: &ServiceRequest) -> bool {
    match req.headers().get(header::ACCEPT).and_then(|v| v.to_str().ok()) {
        None => true,
        Some(accept) => accept.contains("text/html") || accept.contains("*/*"),
    }
}

fn login_redirect_location(data: &Gatekeeper, req: &ServiceRequest) -> String {
    let original = req.request().uri().to_string();
    let state = utf8_percent_encode(&original, NON_ALPHANUMERIC).to_string();
    format!("{}?state={}", data.config.oauth_path("/authorize"), state)
}

/// Render the unauthorized outcome: a 307 to the login flow for browsers
/// (unless redirects are disabled) or a 401 challenge, optionally dropping
/// the session cookies.
fn deny_unauthorized(
    data: &Gatekeeper,
    req: &ServiceRequest,
    clear_session: bool,
) -> HttpResponse {
    // A client presenting a bearer header is not a browser; never bounce it
    // to the login flow.
    let bearer_client = req.headers().contains_key(header::AUTHORIZATION);
    let err = if !bearer_client && !data.config.no_redirects && browser_like(req) {
        ProxyError::redirect_to_login(login_redirect_location(data, req))
    } else {
        ProxyError::unauthorized()
    };
    let accept = req
        .headers()
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok());
    let mut response = render(&err, accept);
    if clear_session {
        for cookie in session_clearing_cookies(data, req) {
            let _ = response.add_cookie(&cookie);
        }
    }
    response
}

fn session_clearing_cookies(data: &Gatekeeper, req: &ServiceRequest) -> Vec<Cookie<'static>> {
    let mut cookies = data.jar.clear(req.request(), &data.config.cookie_access_name);
    cookies.extend(
        data.jar
            .clear(req.request(), &data.config.cookie_refresh_name),
    );
    cookies
}

// ---------------------------------------------------------------------------
// Entrypoint: path canonicalization and panic recovery.

pub struct EntryPoint;

impl<S, B> Transform<S, ServiceRequest> for EntryPoint
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type InitError = ();
    type Transform = EntryPointMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(EntryPointMiddleware {
            service: Rc::new(service),
        }))
    }
}

pub struct EntryPointMiddleware<S> {
    service: Rc<S>,
}

impl<S, B> Service<ServiceRequest> for EntryPointMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = Rc::clone(&self.service);
        Box::pin(async move {
            let Some(data) = gatekeeper(&req) else {
                return Ok(req
                    .into_response(HttpResponse::InternalServerError().finish())
                    .map_into_right_body());
            };

            if !is_oauth_path(&req, &data) {
                match canonicalize_path(req.path()) {
                    Ok(canonical) => {
                        req.extensions_mut().insert(CanonicalPath(canonical));
                    }
                    Err(err) => {
                        log::warn!("rejecting request with unsafe path: {}", err);
                        let response = if data.config.no_redirects {
                            let accept = req
                                .headers()
                                .get(header::ACCEPT)
                                .and_then(|v| v.to_str().ok());
                            render(&ProxyError::MalformedRequest(err.to_string()), accept)
                        } else {
                            deny_unauthorized(&data, &req, false)
                        };
                        return Ok(req.into_response(response).map_into_right_body());
                    }
                }
            }

            match AssertUnwindSafe(service.call(req)).catch_unwind().await {
                Ok(result) => result.map(|res| res.map_into_left_body()),
                Err(_) => {
                    log::error!("handler panicked, responding with an internal error");
                    Err(actix_web::error::ErrorInternalServerError("internal error"))
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Authentication: resolve and verify the request identity, refreshing an
// expired cookie session when possible.

/// New session material produced by a refresh, applied to the response.
struct SessionUpdate {
    cookies: Vec<Cookie<'static>>,
}

pub struct Authentication;

impl<S, B> Transform<S, ServiceRequest> for Authentication
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type InitError = ();
    type Transform = AuthenticationMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(AuthenticationMiddleware {
            service: Rc::new(service),
        }))
    }
}

pub struct AuthenticationMiddleware<S> {
    service: Rc<S>,
}

enum Credentials {
    Bearer(String),
    Cookie(String),
    None,
}

fn extract_credentials(req: &ServiceRequest, data: &Gatekeeper) -> Result<Credentials, ProxyError> {
    if let Some(value) = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(token) = value.strip_prefix("Bearer ") {
            return Ok(Credentials::Bearer(token.trim().to_string()));
        }
    }
    match read_cookie(req.request(), &data.config.cookie_access_name) {
        Some(value) => Ok(Credentials::Cookie(data.access_codec.decode(&value)?)),
        None => Ok(Credentials::None),
    }
}

/// Locate the refresh token for an expired cookie session: from the store
/// keyed by the access token hash, or from the encrypted refresh cookie.
async fn refresh_token_for(
    req: &ServiceRequest,
    data: &Gatekeeper,
    access_hash: &str,
) -> Option<String> {
    if let Some(session_store) = &data.store {
        let sealed = store::get_with_deadline(session_store.as_ref(), access_hash).await?;
        return data.refresh_codec.as_ref()?.decode(&sealed).ok();
    }
    let sealed = read_cookie(req.request(), &data.config.cookie_refresh_name)?;
    data.refresh_codec.as_ref()?.decode(&sealed).ok()
}

/// Perform the refresh exchange, single-flighted per session, and persist the
/// new refresh token.
async fn refresh_session(
    data: &Data<Gatekeeper>,
    access_hash: &str,
    refresh_token: String,
) -> Result<TokenSet, GrantError> {
    let inner = data.clone();
    let hash = access_hash.to_string();
    data.refreshes
        .run(access_hash, move || async move {
            let Some(idp) = inner.idp.as_ref() else {
                return Err(GrantError::Rejected(
                    "no identity provider client configured".to_string(),
                ));
            };
            let tokens = idp.refresh(&refresh_token).await?;

            if let (Some(session_store), Some(codec)) = (&inner.store, &inner.refresh_codec) {
                let next_refresh = tokens.refresh_token.as_deref().unwrap_or(&refresh_token);
                if let Ok(sealed) = codec.encode(next_refresh) {
                    store::delete_with_deadline(session_store.as_ref(), &hash).await;
                    store::set_with_deadline(
                        session_store.as_ref(),
                        &access_token_hash(&tokens.access_token),
                        &sealed,
                        inner.config.refresh_token_lifetime(),
                    )
                    .await;
                }
            }
            Ok(tokens)
        })
        .await
}

/// Cookies carrying the refreshed session back to the client.
fn session_cookies(data: &Gatekeeper, user: &UserContext, tokens: &TokenSet) -> SessionUpdate {
    let ttl = std::cmp::min(
        std::time::Duration::from_secs(user.expires_in() as u64),
        data.config.access_token_duration(),
    );
    let mut cookies = Vec::new();
    if let Ok(value) = data.access_codec.encode(&tokens.access_token) {
        cookies.extend(
            data.jar
                .write(&data.config.cookie_access_name, &value, ttl),
        );
    }
    if data.store.is_none() {
        if let (Some(refresh), Some(codec)) = (&tokens.refresh_token, &data.refresh_codec) {
            if let Ok(value) = codec.encode(refresh) {
                cookies.extend(data.jar.write(
                    &data.config.cookie_refresh_name,
                    &value,
                    data.config.refresh_token_lifetime(),
                ));
            }
        }
    }
    SessionUpdate { cookies }
}

impl<S, B> Service<ServiceRequest> for AuthenticationMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = Rc::clone(&self.service);
        Box::pin(async move {
            let Some(data) = gatekeeper(&req) else {
                return Ok(req
                    .into_response(HttpResponse::InternalServerError().finish())
                    .map_into_right_body());
            };
            if is_oauth_path(&req, &data) {
                let res = service.call(req).await?;
                return Ok(res.map_into_left_body());
            }

            let canonical = req
                .extensions()
                .get::<CanonicalPath>()
                .map(|c| c.0.clone());
            let canonical = match canonical {
                Some(path) => path,
                None => match canonicalize_path(req.path()) {
                    Ok(path) => path,
                    Err(_) => {
                        let response = deny_unauthorized(&data, &req, false);
                        return Ok(req.into_response(response).map_into_right_body());
                    }
                },
            };

            let Some(resource) = data.table.matched(&canonical, req.method()) else {
                // No policy covers this path; forward it untouched.
                let res = service.call(req).await?;
                return Ok(res.map_into_left_body());
            };
            req.extensions_mut()
                .insert(MatchedResource(resource.clone()));
            if resource.whitelisted {
                let res = service.call(req).await?;
                return Ok(res.map_into_left_body());
            }

            let credentials = match extract_credentials(&req, &data) {
                Ok(credentials) => credentials,
                Err(_) => {
                    log::debug!("session cookie failed to decode, clearing the session");
                    let response = deny_unauthorized(&data, &req, true);
                    return Ok(req.into_response(response).map_into_right_body());
                }
            };
            let (raw_token, bearer) = match credentials {
                Credentials::Bearer(token) => (token, true),
                Credentials::Cookie(token) => (token, false),
                Credentials::None => {
                    let response = deny_unauthorized(&data, &req, false);
                    return Ok(req.into_response(response).map_into_right_body());
                }
            };

            let claims = match data.verifier.verify(&raw_token).await {
                Ok(claims) => claims,
                Err(_) => {
                    let response = deny_unauthorized(&data, &req, !bearer);
                    return Ok(req.into_response(response).map_into_right_body());
                }
            };
            let Some(user) = UserContext::from_claims(claims, &raw_token, bearer) else {
                let response = deny_unauthorized(&data, &req, !bearer);
                return Ok(req.into_response(response).map_into_right_body());
            };

            let skew = std::time::Duration::from_secs(data.config.token_clock_skew_secs);
            let mut update: Option<SessionUpdate> = None;
            let user = if !user.is_expired(skew) {
                user
            } else if bearer || !data.config.enable_refresh_tokens {
                log::debug!("{} presented an expired token", user.preferred_name);
                let response = deny_unauthorized(&data, &req, !bearer);
                return Ok(req.into_response(response).map_into_right_body());
            } else {
                // Expired cookie session: attempt a silent refresh.
                let access_hash = access_token_hash(&raw_token);
                let Some(refresh_token) = refresh_token_for(&req, &data, &access_hash).await
                else {
                    let response = deny_unauthorized(&data, &req, true);
                    return Ok(req.into_response(response).map_into_right_body());
                };
                match refresh_session(&data, &access_hash, refresh_token).await {
                    Ok(tokens) => {
                        let refreshed = match data.verifier.verify(&tokens.access_token).await {
                            Ok(claims) => {
                                UserContext::from_claims(claims, &tokens.access_token, false)
                            }
                            Err(_) => None,
                        };
                        let Some(refreshed) = refreshed else {
                            let response = deny_unauthorized(&data, &req, true);
                            return Ok(req.into_response(response).map_into_right_body());
                        };
                        log::debug!("refreshed the session of {}", refreshed.preferred_name);
                        update = Some(session_cookies(&data, &refreshed, &tokens));
                        refreshed
                    }
                    Err(err) => {
                        log::debug!("unable to refresh the session: {}", err);
                        let response = deny_unauthorized(&data, &req, true);
                        return Ok(req.into_response(response).map_into_right_body());
                    }
                }
            };

            req.extensions_mut().insert(Rc::new(user));
            let mut res = service.call(req).await?;
            if let Some(update) = update {
                for cookie in &update.cookies {
                    if let Err(err) = res.response_mut().add_cookie(cookie) {
                        log::error!("unable to attach a session cookie: {}", err);
                    }
                }
            }
            Ok(res.map_into_left_body())
        })
    }
}

// ---------------------------------------------------------------------------
// Admission: enforce the resource policy on the authenticated identity.

pub struct Admission;

impl<S, B> Transform<S, ServiceRequest> for Admission
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type InitError = ();
    type Transform = AdmissionMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(AdmissionMiddleware {
            service: Rc::new(service),
        }))
    }
}

pub struct AdmissionMiddleware<S> {
    service: Rc<S>,
}

/// The policy decision for a user against a resource.
fn admit(user: &UserContext, resource: &Resource, data: &Gatekeeper) -> bool {
    if !data.config.skip_client_id && !user.is_audience(&data.config.client_id) {
        log::warn!(
            "{} denied, token audience does not include the client id",
            user.preferred_name
        );
        return false;
    }

    if !resource.roles.is_empty() {
        let allowed = if resource.require_any_role {
            resource.roles.iter().any(|role| user.roles.contains(role))
        } else {
            resource.roles.iter().all(|role| user.roles.contains(role))
        };
        if !allowed {
            log::warn!(
                "{} denied access to {}, holds roles [{}] but needs [{}]",
                user.preferred_name,
                resource.uri,
                user.roles_joined(),
                resource.roles.join(",")
            );
            return false;
        }
    }

    for (claim, regex) in &resource.claims_match {
        let values = user.claim_values(claim);
        if values.is_empty() {
            log::warn!(
                "{} denied access to {}, claim {} is missing",
                user.preferred_name,
                resource.uri,
                claim
            );
            return false;
        }
        if !values.iter().any(|value| regex.is_match(value)) {
            log::warn!(
                "{} denied access to {}, claim {} does not match",
                user.preferred_name,
                resource.uri,
                claim
            );
            return false;
        }
    }

    true
}

impl<S, B> Service<ServiceRequest> for AdmissionMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = Rc::clone(&self.service);
        Box::pin(async move {
            let Some(data) = gatekeeper(&req) else {
                return Ok(req
                    .into_response(HttpResponse::InternalServerError().finish())
                    .map_into_right_body());
            };

            let decision = {
                let extensions = req.extensions();
                let resource = extensions.get::<MatchedResource>();
                let user = extensions.get::<Rc<UserContext>>();
                match (resource, user) {
                    (None, _) => None,
                    (Some(resource), _) if resource.0.whitelisted => None,
                    (Some(resource), Some(user)) => Some(admit(user, &resource.0, &data)),
                    // A matched, unwhitelisted resource without an identity
                    // never passes; authentication should have caught it.
                    (Some(_), None) => Some(false),
                }
            };

            if decision == Some(false) {
                let accept = req
                    .headers()
                    .get(header::ACCEPT)
                    .and_then(|v| v.to_str().ok());
                let response = render(&ProxyError::Forbidden, accept);
                return Ok(req.into_response(response).map_into_right_body());
            }

            let res = service.call(req).await?;
            Ok(res.map_into_left_body())
        })
    }
}

// ---------------------------------------------------------------------------
// Header injection: scrub hop-by-hop headers and attach identity and static
// headers for the upstream.

pub struct HeadersInjector;

impl<S, B> Transform<S, ServiceRequest> for HeadersInjector
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = HeadersInjectorMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(HeadersInjectorMiddleware {
            service: Rc::new(service),
        }))
    }
}

pub struct HeadersInjectorMiddleware<S> {
    service: Rc<S>,
}

/// `given_name` -> `X-Auth-Given-Name`.
pub(crate) fn claim_header_name(claim: &str) -> String {
    let kebab: Vec<String> = claim
        .split(|c| c == '_' || c == '-')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect();
    format!("X-Auth-{}", kebab.join("-"))
}

fn insert_header(req: &mut ServiceRequest, name: &str, value: &str) {
    let Ok(header_name) = HeaderName::try_from(name.to_ascii_lowercase()) else {
        log::warn!("dropping invalid upstream header name {}", name);
        return;
    };
    match HeaderValue::from_str(value) {
        Ok(header_value) => {
            req.headers_mut().insert(header_name, header_value);
        }
        Err(_) => log::warn!("dropping upstream header {} with invalid value", name),
    }
}

impl<S, B> Service<ServiceRequest> for HeadersInjectorMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, mut req: ServiceRequest) -> Self::Future {
        let service = Rc::clone(&self.service);
        Box::pin(async move {
            let Some(data) = gatekeeper(&req) else {
                return service.call(req).await;
            };
            if is_oauth_path(&req, &data) {
                return service.call(req).await;
            }

            for name in HOP_BY_HOP_HEADERS {
                req.headers_mut().remove(name);
            }

            let user = req.extensions().get::<Rc<UserContext>>().cloned();
            if let Some(user) = user {
                insert_header(&mut req, "X-Auth-Subject", &user.id);
                insert_header(&mut req, "X-Auth-Userid", &user.preferred_name);
                insert_header(&mut req, "X-Auth-Email", &user.email);
                insert_header(&mut req, "X-Auth-Username", &user.preferred_name);
                insert_header(&mut req, "X-Auth-ExpiresIn", &user.expires_in().to_string());
                insert_header(&mut req, "X-Auth-Roles", &user.roles_joined());
                insert_header(&mut req, "X-Auth-Audience", &user.audience.join(","));
                if data.config.enable_token_header {
                    insert_header(&mut req, "X-Auth-Token", &user.raw_token);
                }
                if data.config.enable_authorization_header {
                    insert_header(
                        &mut req,
                        "Authorization",
                        &format!("Bearer {}", user.raw_token),
                    );
                }
                for claim in &data.config.add_claims {
                    let values = user.claim_values(claim);
                    if !values.is_empty() {
                        insert_header(&mut req, &claim_header_name(claim), &values.join(","));
                    }
                }
            }

            for (name, value) in &data.config.headers {
                insert_header(&mut req, name, value);
            }
            let custom = req
                .extensions()
                .get::<MatchedResource>()
                .map(|m| m.0.custom_headers.clone());
            if let Some(custom) = custom {
                for (name, value) in custom {
                    insert_header(&mut req, &name, &value);
                }
            }

            service.call(req).await
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_claim_header_name_kebab_cases() {
        assert_eq!(claim_header_name("given_name"), "X-Auth-Given-Name");
        assert_eq!(claim_header_name("email"), "X-Auth-Email");
        assert_eq!(claim_header_name("family-name"), "X-Auth-Family-Name");
        assert_eq!(claim_header_name("item"), "X-Auth-Item");
    }
}
