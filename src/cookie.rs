use actix_web::cookie::{time, Cookie, SameSite};
use actix_web::HttpRequest;
use std::collections::BTreeMap;
use std::time::Duration;

/// Browsers cap a single cookie around 4 KiB; values beyond this are chunked
/// across `name`, `name-1`, `name-2`, ...
pub const MAX_COOKIE_CHUNK: usize = 4093;

/// Session cookie writer, carrying the attributes every cookie of the proxy
/// shares.
#[derive(Debug, Clone, Copy)]
pub struct CookieJar {
    secure: bool,
}

impl CookieJar {
    pub fn new(secure: bool) -> CookieJar {
        CookieJar { secure }
    }

    /// Split `value` into chunked cookies of at most [`MAX_COOKIE_CHUNK`] bytes.
    pub fn write(&self, name: &str, value: &str, max_age: Duration) -> Vec<Cookie<'static>> {
        self.write_chunked(name, value, max_age, MAX_COOKIE_CHUNK)
    }

    fn write_chunked(
        &self,
        name: &str,
        value: &str,
        max_age: Duration,
        chunk_size: usize,
    ) -> Vec<Cookie<'static>> {
        let mut cookies = Vec::new();
        let bytes = value.as_bytes();
        let mut start = 0;
        let mut index = 0;
        loop {
            let mut end = (start + chunk_size).min(bytes.len());
            // Values are base64 in practice, but never split a multibyte
            // character if one slips through.
            while end > start && !value.is_char_boundary(end) {
                end -= 1;
            }
            let chunk = &value[start..end];
            let cookie_name = if index == 0 {
                name.to_string()
            } else {
                format!("{}-{}", name, index)
            };
            cookies.push(self.build(cookie_name, chunk.to_string(), max_age));
            start = end;
            index += 1;
            if start >= bytes.len() {
                break;
            }
        }
        cookies
    }

    fn build(&self, name: String, value: String, max_age: Duration) -> Cookie<'static> {
        Cookie::build(name, value)
            .http_only(true)
            .secure(self.secure)
            .same_site(SameSite::Lax)
            .path("/")
            .max_age(time::Duration::seconds(max_age.as_secs() as i64))
            .finish()
    }

    /// Removal cookies (`Max-Age=0`) for `name` and every chunk of it present
    /// on the request.
    pub fn clear(&self, req: &HttpRequest, name: &str) -> Vec<Cookie<'static>> {
        let mut dead = Vec::new();
        let Ok(cookies) = req.cookies() else {
            return dead;
        };
        for cookie in cookies.iter() {
            if cookie.name() == name || is_chunk_of(cookie.name(), name) {
                let mut removal = Cookie::new(cookie.name().to_string(), "");
                removal.set_path("/");
                removal.make_removal();
                dead.push(removal);
            }
        }
        if dead.is_empty() {
            // The client may hold a cookie that was not replayed on this
            // request; clear the base name regardless.
            let mut removal = Cookie::new(name.to_string(), "");
            removal.set_path("/");
            removal.make_removal();
            dead.push(removal);
        }
        dead
    }
}

/// Reassemble a possibly chunked cookie from the request, concatenating
/// chunks by ascending index.
pub fn read_cookie(req: &HttpRequest, name: &str) -> Option<String> {
    let cookies = req.cookies().ok()?;
    let mut parts: BTreeMap<usize, String> = BTreeMap::new();
    for cookie in cookies.iter() {
        if cookie.name() == name {
            parts.insert(0, cookie.value().to_string());
        } else if let Some(index) = chunk_index(cookie.name(), name) {
            parts.insert(index, cookie.value().to_string());
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.into_values().collect::<Vec<_>>().concat())
}

fn is_chunk_of(cookie_name: &str, base: &str) -> bool {
    chunk_index(cookie_name, base).is_some()
}

fn chunk_index(cookie_name: &str, base: &str) -> Option<usize> {
    let suffix = cookie_name.strip_prefix(base)?.strip_prefix('-')?;
    suffix.parse::<usize>().ok().filter(|i| *i > 0)
}

#[cfg(test)]
mod test {
    use super::*;
    use actix_web::test::TestRequest;

    fn jar() -> CookieJar {
        CookieJar::new(false)
    }

    #[test]
    fn test_small_value_is_a_single_cookie() {
        let cookies = jar().write("gk-access", "value", Duration::from_secs(60));
        assert_eq!(cookies.len(), 1);
        assert_eq!(cookies[0].name(), "gk-access");
        assert_eq!(cookies[0].value(), "value");
    }

    #[test]
    fn test_cookie_attributes() {
        let cookies = CookieJar::new(true).write("gk-access", "value", Duration::from_secs(60));
        let cookie = &cookies[0];
        assert_eq!(cookie.http_only(), Some(true));
        assert_eq!(cookie.secure(), Some(true));
        assert_eq!(cookie.same_site(), Some(SameSite::Lax));
        assert_eq!(cookie.path(), Some("/"));
        assert_eq!(cookie.max_age(), Some(time::Duration::seconds(60)));
    }

    #[test]
    fn test_chunk_names_follow_the_dash_index_scheme() {
        let value = "a".repeat(MAX_COOKIE_CHUNK * 2 + 10);
        let cookies = jar().write("gk-access", &value, Duration::from_secs(60));
        assert_eq!(cookies.len(), 3);
        assert_eq!(cookies[0].name(), "gk-access");
        assert_eq!(cookies[1].name(), "gk-access-1");
        assert_eq!(cookies[2].name(), "gk-access-2");
        assert!(cookies.iter().all(|c| c.value().len() <= MAX_COOKIE_CHUNK));
    }

    #[test]
    fn test_round_trip_large_value() {
        // Exercise well past the single cookie limit, up to 256 KiB.
        let value: String = (0..(256 * 1024))
            .map(|i| char::from(b'a' + (i % 26) as u8))
            .collect();
        let cookies = jar().write("gk-refresh", &value, Duration::from_secs(60));
        assert!(cookies.len() > 1);

        let mut req = TestRequest::default();
        for cookie in &cookies {
            req = req.cookie(cookie.clone());
        }
        let req = req.to_http_request();
        assert_eq!(read_cookie(&req, "gk-refresh").unwrap(), value);
    }

    #[test]
    fn test_read_ignores_unrelated_cookies() {
        let req = TestRequest::default()
            .cookie(Cookie::new("gk-access", "abc"))
            .cookie(Cookie::new("gk-access-1", "def"))
            .cookie(Cookie::new("gk-accessory", "nope"))
            .cookie(Cookie::new("other", "nope"))
            .to_http_request();
        assert_eq!(read_cookie(&req, "gk-access").unwrap(), "abcdef");
    }

    #[test]
    fn test_read_missing_cookie_is_none() {
        let req = TestRequest::default().to_http_request();
        assert!(read_cookie(&req, "gk-access").is_none());
    }

    #[test]
    fn test_clear_marks_all_chunks_for_removal() {
        let req = TestRequest::default()
            .cookie(Cookie::new("gk-access", "abc"))
            .cookie(Cookie::new("gk-access-1", "def"))
            .cookie(Cookie::new("other", "keep"))
            .to_http_request();
        let dead = jar().clear(&req, "gk-access");
        let names: Vec<&str> = dead.iter().map(|c| c.name()).collect();
        assert!(names.contains(&"gk-access"));
        assert!(names.contains(&"gk-access-1"));
        assert!(!names.contains(&"other"));
        assert!(dead
            .iter()
            .all(|c| c.max_age() == Some(time::Duration::ZERO)));
    }

    #[test]
    fn test_clear_without_request_cookies_still_clears_base() {
        let req = TestRequest::default().to_http_request();
        let dead = jar().clear(&req, "gk-access");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].name(), "gk-access");
    }
}
