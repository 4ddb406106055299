use actix_web::{http::header, http::StatusCode, HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

/// Error kinds surfaced by the request pipeline.
///
/// Each variant maps to a fixed HTTP status; rendering picks JSON or plain
/// text from the `Accept` header. Messages never carry token or key material.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    #[error("authentication required")]
    Unauthorized {
        /// Absolute-path location for a browser redirect to the login flow.
        redirect: Option<String>,
    },
    #[error("access denied")]
    Forbidden,
    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(anyhow::Error),
    #[error("identity provider unreachable: {0}")]
    IdpUnreachable(anyhow::Error),
    #[error("session store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("session cookie corrupted")]
    CookieCorrupted,
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
}

impl ProxyError {
    pub(crate) fn unauthorized() -> Self {
        ProxyError::Unauthorized { redirect: None }
    }

    pub(crate) fn redirect_to_login(location: String) -> Self {
        ProxyError::Unauthorized {
            redirect: Some(location),
        }
    }

    fn body_for(&self, accept_json: bool) -> (String, &'static str) {
        if accept_json {
            let body = json!({ "error": self.to_string() }).to_string();
            (body, "application/json")
        } else {
            (self.to_string(), "text/plain; charset=utf-8")
        }
    }
}

impl ResponseError for ProxyError {
    fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::MalformedRequest(_) | ProxyError::CookieCorrupted => {
                StatusCode::BAD_REQUEST
            }
            ProxyError::Unauthorized { redirect: Some(_) } => StatusCode::TEMPORARY_REDIRECT,
            ProxyError::Unauthorized { redirect: None } => StatusCode::UNAUTHORIZED,
            ProxyError::Forbidden => StatusCode::FORBIDDEN,
            ProxyError::UpstreamUnreachable(_) | ProxyError::IdpUnreachable(_) => {
                StatusCode::BAD_GATEWAY
            }
            ProxyError::StoreUnavailable(_) | ProxyError::ConfigInvalid(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        let mut builder = HttpResponse::build(self.status_code());
        match self {
            ProxyError::Unauthorized { redirect: Some(location) } => {
                builder.insert_header((header::LOCATION, location.as_str()));
                builder.finish()
            }
            ProxyError::Unauthorized { redirect: None } => {
                builder.insert_header((header::WWW_AUTHENTICATE, "Bearer"));
                builder.body(self.to_string())
            }
            _ => builder.body(self.to_string()),
        }
    }
}

/// Render an error honouring the `Accept` header of the originating request.
///
/// The `ResponseError` implementation cannot see the request, so handlers that
/// have it at hand go through here instead.
pub(crate) fn render(err: &ProxyError, accept: Option<&str>) -> HttpResponse {
    let accept_json = accept
        .map(|a| a.contains("application/json") && !a.contains("text/html"))
        .unwrap_or(false);
    let mut builder = HttpResponse::build(err.status_code());
    match err {
        ProxyError::Unauthorized { redirect: Some(location) } => {
            builder.insert_header((header::LOCATION, location.as_str()));
            builder.finish()
        }
        ProxyError::Unauthorized { redirect: None } => {
            builder.insert_header((header::WWW_AUTHENTICATE, "Bearer"));
            let (body, ctype) = err.body_for(accept_json);
            builder.content_type(ctype).body(body)
        }
        _ => {
            let (body, ctype) = err.body_for(accept_json);
            builder.content_type(ctype).body(body)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_unauthorized_without_redirect_carries_challenge() {
        let err = ProxyError::unauthorized();
        let resp = err.error_response();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            resp.headers().get(header::WWW_AUTHENTICATE).unwrap(),
            "Bearer"
        );
    }

    #[test]
    fn test_unauthorized_with_redirect_is_temporary_redirect() {
        let err = ProxyError::redirect_to_login("/oauth/authorize?state=%2Fadmin".to_string());
        let resp = err.error_response();
        assert_eq!(resp.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(
            resp.headers().get(header::LOCATION).unwrap(),
            "/oauth/authorize?state=%2Fadmin"
        );
    }

    #[test]
    fn test_render_selects_json_for_json_accept() {
        let err = ProxyError::Forbidden;
        let resp = render(&err, Some("application/json"));
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }
}
