use crate::errors::ProxyError;
use crate::token::unverified_claims;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

/// How often the key set may be refreshed in response to an unknown `kid`.
const REFRESH_INTERVAL: Duration = Duration::from_secs(30);

const ALLOWED_ALGS: [Algorithm; 8] = [
    Algorithm::RS256,
    Algorithm::RS384,
    Algorithm::RS512,
    Algorithm::PS256,
    Algorithm::PS384,
    Algorithm::ES256,
    Algorithm::ES384,
    Algorithm::HS256,
];

/// Verifies access tokens against the IDP's published JWKS.
///
/// The key set is process-wide and read-mostly: readers take a snapshot,
/// refreshes are single-flighted and rate limited to once per 30 seconds.
/// Expiry is deliberately not checked here, the authentication middleware
/// owns that transition (an expired token may still be refreshable).
pub struct TokenVerifier {
    mode: Mode,
}

enum Mode {
    /// TESTING ONLY: tokens are parsed but not verified.
    Skip,
    Jwks(Box<JwksVerifier>),
}

struct JwksVerifier {
    http: reqwest::Client,
    jwks_uri: String,
    issuer: String,
    client_id: String,
    skip_issuer_check: bool,
    skip_client_id: bool,
    keys: RwLock<Arc<JwkSet>>,
    limiter: RefreshLimiter,
    refresh_flight: tokio::sync::Mutex<()>,
}

impl TokenVerifier {
    pub fn skip_verification() -> TokenVerifier {
        TokenVerifier { mode: Mode::Skip }
    }

    pub fn jwks(
        http: reqwest::Client,
        jwks_uri: String,
        issuer: String,
        client_id: String,
        skip_issuer_check: bool,
        skip_client_id: bool,
    ) -> TokenVerifier {
        TokenVerifier {
            mode: Mode::Jwks(Box::new(JwksVerifier {
                http,
                jwks_uri,
                issuer,
                client_id,
                skip_issuer_check,
                skip_client_id,
                keys: RwLock::new(Arc::new(JwkSet { keys: Vec::new() })),
                limiter: RefreshLimiter::new(REFRESH_INTERVAL),
                refresh_flight: tokio::sync::Mutex::new(()),
            })),
        }
    }

    /// Fetch the key set once at startup; failures are logged and retried on
    /// the first unknown `kid`.
    pub async fn prime(&self) {
        if let Mode::Jwks(verifier) = &self.mode {
            if let Err(err) = verifier.refresh().await {
                log::warn!("initial jwks fetch failed, will retry on demand: {}", err);
            }
        }
    }

    /// Verify signature, issuer and audience of a compact JWS and return its
    /// claims.
    pub async fn verify(&self, token: &str) -> Result<Value, ProxyError> {
        match &self.mode {
            Mode::Skip => unverified_claims(token)
                .map_err(|_| ProxyError::unauthorized()),
            Mode::Jwks(verifier) => verifier.verify(token).await,
        }
    }

    #[cfg(test)]
    pub(crate) fn install_keys(&self, keys: JwkSet) {
        if let Mode::Jwks(verifier) = &self.mode {
            *verifier.keys.write().unwrap() = Arc::new(keys);
        }
    }
}

impl JwksVerifier {
    async fn verify(&self, token: &str) -> Result<Value, ProxyError> {
        let header = decode_header(token).map_err(|_| ProxyError::unauthorized())?;
        if !ALLOWED_ALGS.contains(&header.alg) {
            log::warn!("token signed with unacceptable algorithm {:?}", header.alg);
            return Err(ProxyError::unauthorized());
        }
        let Some(kid) = header.kid else {
            return Err(ProxyError::unauthorized());
        };

        let mut snapshot = self.snapshot();
        if snapshot.find(&kid).is_none() {
            self.refresh_on_unknown_kid(&kid).await;
            snapshot = self.snapshot();
        }
        let Some(jwk) = snapshot.find(&kid) else {
            log::warn!("token references unknown signing key {}", kid);
            return Err(ProxyError::unauthorized());
        };

        let key = DecodingKey::from_jwk(jwk).map_err(|_| ProxyError::unauthorized())?;
        let mut validation = Validation::new(header.alg);
        // Expiry and audience transitions belong to the middleware; the
        // validation here is signature-only.
        validation.required_spec_claims = HashSet::new();
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;

        let data = decode::<Value>(token, &key, &validation).map_err(|err| {
            log::debug!("token signature rejected: {}", err);
            ProxyError::unauthorized()
        })?;
        let claims = data.claims;

        if !self.skip_issuer_check {
            let issuer = claims.get("iss").and_then(Value::as_str).unwrap_or_default();
            if issuer != self.issuer {
                log::warn!("token issuer {} does not match the discovery url", issuer);
                return Err(ProxyError::unauthorized());
            }
        }
        if !self.skip_client_id && !audience_contains(&claims, &self.client_id) {
            log::warn!("token audience does not contain the client id");
            return Err(ProxyError::unauthorized());
        }

        Ok(claims)
    }

    fn snapshot(&self) -> Arc<JwkSet> {
        self.keys.read().unwrap().clone()
    }

    async fn refresh_on_unknown_kid(&self, kid: &str) {
        let _flight = self.refresh_flight.lock().await;
        // The leader may already have pulled the key we are missing.
        if self.snapshot().find(kid).is_some() {
            return;
        }
        if !self.limiter.allow() {
            return;
        }
        if let Err(err) = self.refresh().await {
            log::warn!("jwks refresh failed: {}", err);
        }
    }

    async fn refresh(&self) -> Result<(), ProxyError> {
        let set: JwkSet = self
            .http
            .get(&self.jwks_uri)
            .send()
            .await
            .map_err(|err| ProxyError::IdpUnreachable(err.into()))?
            .error_for_status()
            .map_err(|err| ProxyError::IdpUnreachable(err.into()))?
            .json()
            .await
            .map_err(|err| ProxyError::IdpUnreachable(err.into()))?;
        log::debug!("retrieved {} signing keys from the idp", set.keys.len());
        *self.keys.write().unwrap() = Arc::new(set);
        Ok(())
    }
}

fn audience_contains(claims: &Value, client_id: &str) -> bool {
    match claims.get("aud") {
        Some(Value::String(aud)) => aud == client_id,
        Some(Value::Array(items)) => items
            .iter()
            .any(|a| a.as_str().map(|s| s == client_id).unwrap_or(false)),
        _ => false,
    }
}

/// Rate limits key refreshes; the first caller after the interval wins.
struct RefreshLimiter {
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl RefreshLimiter {
    fn new(min_interval: Duration) -> RefreshLimiter {
        RefreshLimiter {
            min_interval,
            last: Mutex::new(None),
        }
    }

    fn allow(&self) -> bool {
        let mut last = self.last.lock().unwrap();
        match *last {
            Some(at) if at.elapsed() < self.min_interval => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use chrono::Utc;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    const SECRET: &[u8] = b"a-shared-secret-for-testing-only";

    fn hs256_keyset(kid: &str) -> JwkSet {
        let jwk = json!({
            "kty": "oct",
            "kid": kid,
            "alg": "HS256",
            "k": URL_SAFE_NO_PAD.encode(SECRET),
        });
        serde_json::from_value(json!({ "keys": [jwk] })).unwrap()
    }

    fn signed_token(kid: &str, claims: &serde_json::Value) -> String {
        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some(kid.to_string());
        encode(&header, claims, &EncodingKey::from_secret(SECRET)).unwrap()
    }

    fn verifier() -> TokenVerifier {
        let v = TokenVerifier::jwks(
            reqwest::Client::new(),
            "http://127.0.0.1:1/jwks".to_string(),
            "https://idp.example.com/realms/test".to_string(),
            "client".to_string(),
            false,
            false,
        );
        v.install_keys(hs256_keyset("test-key"));
        v
    }

    fn valid_claims() -> serde_json::Value {
        json!({
            "iss": "https://idp.example.com/realms/test",
            "aud": "client",
            "sub": "alice",
            "exp": Utc::now().timestamp() + 600,
        })
    }

    #[tokio::test]
    async fn test_valid_token_passes() {
        let token = signed_token("test-key", &valid_claims());
        let claims = verifier().verify(&token).await.unwrap();
        assert_eq!(claims["sub"], "alice");
    }

    #[tokio::test]
    async fn test_tampered_signature_is_rejected() {
        let mut token = signed_token("test-key", &valid_claims());
        token.pop();
        token.push('A');
        assert!(verifier().verify(&token).await.is_err());
    }

    #[tokio::test]
    async fn test_wrong_issuer_is_rejected_unless_skipped() {
        let mut claims = valid_claims();
        claims["iss"] = json!("https://evil.example.com");
        let token = signed_token("test-key", &claims);
        assert!(verifier().verify(&token).await.is_err());

        let relaxed = TokenVerifier::jwks(
            reqwest::Client::new(),
            "http://127.0.0.1:1/jwks".to_string(),
            "https://idp.example.com/realms/test".to_string(),
            "client".to_string(),
            true,
            false,
        );
        relaxed.install_keys(hs256_keyset("test-key"));
        assert!(relaxed.verify(&token).await.is_ok());
    }

    #[tokio::test]
    async fn test_wrong_audience_is_rejected_unless_skipped() {
        let mut claims = valid_claims();
        claims["aud"] = json!("somebody-else");
        let token = signed_token("test-key", &claims);
        assert!(verifier().verify(&token).await.is_err());

        let relaxed = TokenVerifier::jwks(
            reqwest::Client::new(),
            "http://127.0.0.1:1/jwks".to_string(),
            "https://idp.example.com/realms/test".to_string(),
            "client".to_string(),
            false,
            true,
        );
        relaxed.install_keys(hs256_keyset("test-key"));
        assert!(relaxed.verify(&token).await.is_ok());
    }

    #[tokio::test]
    async fn test_audience_array_form_is_accepted() {
        let mut claims = valid_claims();
        claims["aud"] = json!(["account", "client"]);
        let token = signed_token("test-key", &claims);
        assert!(verifier().verify(&token).await.is_ok());
    }

    #[tokio::test]
    async fn test_expired_token_still_verifies() {
        // Expiry is the middleware's decision, not the verifier's.
        let mut claims = valid_claims();
        claims["exp"] = json!(Utc::now().timestamp() - 600);
        let token = signed_token("test-key", &claims);
        assert!(verifier().verify(&token).await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_kid_is_rejected() {
        let token = signed_token("other-key", &valid_claims());
        assert!(verifier().verify(&token).await.is_err());
    }

    #[tokio::test]
    async fn test_skip_verification_accepts_unsigned_tokens() {
        let verifier = TokenVerifier::skip_verification();
        let token = crate::token::test::fake_jws(&valid_claims());
        let claims = verifier.verify(&token).await.unwrap();
        assert_eq!(claims["sub"], "alice");
    }

    #[test]
    fn test_refresh_limiter_allows_once_per_interval() {
        let limiter = RefreshLimiter::new(Duration::from_secs(30));
        assert!(limiter.allow());
        assert!(!limiter.allow());
        assert!(!limiter.allow());

        let immediate = RefreshLimiter::new(Duration::ZERO);
        assert!(immediate.allow());
        assert!(immediate.allow());
    }
}
