use crate::errors::ProxyError;
use aes_gcm::aead::{Aead, OsRng};
use aes_gcm::{AeadCore, Aes128Gcm, Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use sha2::{Digest, Sha256};

const NONCE_LEN: usize = 12;

enum Cipher {
    Aes128(Aes128Gcm),
    Aes256(Aes256Gcm),
}

/// Codec turning tokens into cookie values and back.
///
/// Without encryption the value is the base64 of the compact JWS. With
/// encryption the token is sealed with AES-GCM under the configured key, a
/// random 12-byte nonce prepended, and the whole buffer base64-encoded.
pub struct TokenCodec {
    cipher: Option<Cipher>,
}

impl TokenCodec {
    /// Build a codec; `key` must be empty, 16 or 32 bytes.
    pub fn new(key: &str, encrypt: bool) -> Result<TokenCodec, ProxyError> {
        if !encrypt {
            return Ok(TokenCodec { cipher: None });
        }
        let cipher = match key.len() {
            16 => Cipher::Aes128(
                Aes128Gcm::new_from_slice(key.as_bytes())
                    .map_err(|_| ProxyError::ConfigInvalid("invalid encryption key".to_string()))?,
            ),
            32 => Cipher::Aes256(
                Aes256Gcm::new_from_slice(key.as_bytes())
                    .map_err(|_| ProxyError::ConfigInvalid("invalid encryption key".to_string()))?,
            ),
            _ => {
                return Err(ProxyError::ConfigInvalid(
                    "encryption key must be 16 or 32 bytes".to_string(),
                ))
            }
        };
        Ok(TokenCodec {
            cipher: Some(cipher),
        })
    }

    pub fn is_encrypting(&self) -> bool {
        self.cipher.is_some()
    }

    /// Encode a token for cookie storage.
    pub fn encode(&self, token: &str) -> Result<String, ProxyError> {
        match &self.cipher {
            None => Ok(STANDARD.encode(token.as_bytes())),
            Some(cipher) => {
                let sealed = match cipher {
                    Cipher::Aes128(c) => {
                        let nonce = Aes128Gcm::generate_nonce(&mut OsRng);
                        let mut out = nonce.to_vec();
                        let ciphertext = c
                            .encrypt(&nonce, token.as_bytes())
                            .map_err(|_| ProxyError::CookieCorrupted)?;
                        out.extend_from_slice(&ciphertext);
                        out
                    }
                    Cipher::Aes256(c) => {
                        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
                        let mut out = nonce.to_vec();
                        let ciphertext = c
                            .encrypt(&nonce, token.as_bytes())
                            .map_err(|_| ProxyError::CookieCorrupted)?;
                        out.extend_from_slice(&ciphertext);
                        out
                    }
                };
                Ok(STANDARD.encode(sealed))
            }
        }
    }

    /// Decode a cookie value back into the token.
    pub fn decode(&self, value: &str) -> Result<String, ProxyError> {
        let raw = STANDARD
            .decode(value.as_bytes())
            .map_err(|_| ProxyError::CookieCorrupted)?;
        match &self.cipher {
            None => String::from_utf8(raw).map_err(|_| ProxyError::CookieCorrupted),
            Some(cipher) => {
                if raw.len() <= NONCE_LEN {
                    return Err(ProxyError::CookieCorrupted);
                }
                let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
                let plain = match cipher {
                    Cipher::Aes128(c) => c
                        .decrypt(Nonce::from_slice(nonce), ciphertext)
                        .map_err(|_| ProxyError::CookieCorrupted)?,
                    Cipher::Aes256(c) => c
                        .decrypt(Nonce::from_slice(nonce), ciphertext)
                        .map_err(|_| ProxyError::CookieCorrupted)?,
                };
                String::from_utf8(plain).map_err(|_| ProxyError::CookieCorrupted)
            }
        }
    }
}

/// The store key of an access token, `sha256` over the compact JWS.
pub fn access_token_hash(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Decode the payload of a compact JWS without verifying it.
///
/// Used by the debug token view and by `skip_token_verification`; all other
/// paths go through the JWKS verifier.
pub fn unverified_claims(token: &str) -> Result<serde_json::Value, ProxyError> {
    let mut parts = token.split('.');
    let (Some(_), Some(payload), Some(_), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(ProxyError::MalformedRequest(
            "token is not a compact JWS".to_string(),
        ));
    };
    let raw = URL_SAFE_NO_PAD
        .decode(payload.as_bytes())
        .map_err(|_| ProxyError::MalformedRequest("token payload is not base64url".to_string()))?;
    serde_json::from_slice(&raw)
        .map_err(|_| ProxyError::MalformedRequest("token payload is not JSON".to_string()))
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use serde_json::json;

    /// Build an unsigned-but-well-formed compact JWS around the given claims.
    pub(crate) fn fake_jws(claims: &serde_json::Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"RS256","typ":"JWT","kid":"test"}"#);
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
        format!("{}.{}.c2lnbmF0dXJl", header, payload)
    }

    #[test]
    fn test_plain_round_trip() {
        let codec = TokenCodec::new("", false).unwrap();
        let token = fake_jws(&json!({"sub": "alice"}));
        let encoded = codec.encode(&token).unwrap();
        assert_eq!(codec.decode(&encoded).unwrap(), token);
    }

    #[test]
    fn test_encrypted_round_trip_128_and_256() {
        for key in ["0123456789abcdef", "0123456789abcdef0123456789abcdef"] {
            let codec = TokenCodec::new(key, true).unwrap();
            let token = fake_jws(&json!({"sub": "alice"}));
            let encoded = codec.encode(&token).unwrap();
            assert_ne!(encoded, token);
            assert_ne!(encoded, STANDARD.encode(&token));
            assert_eq!(codec.decode(&encoded).unwrap(), token);
        }
    }

    #[test]
    fn test_corrupted_value_fails_decode() {
        let codec = TokenCodec::new("0123456789abcdef", true).unwrap();
        let encoded = codec.encode("token").unwrap();
        let mut raw = STANDARD.decode(&encoded).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        let tampered = STANDARD.encode(raw);
        assert!(matches!(
            codec.decode(&tampered),
            Err(ProxyError::CookieCorrupted)
        ));
        assert!(matches!(
            codec.decode("not base64 at all!"),
            Err(ProxyError::CookieCorrupted)
        ));
    }

    #[test]
    fn test_bad_key_length_is_rejected() {
        assert!(TokenCodec::new("tiny", true).is_err());
    }

    #[test]
    fn test_unverified_claims_extracts_payload() {
        let token = fake_jws(&json!({"sub": "alice", "aud": "client"}));
        let claims = unverified_claims(&token).unwrap();
        assert_eq!(claims["sub"], "alice");
        assert!(unverified_claims("garbage").is_err());
    }

    #[test]
    fn test_access_token_hash_is_stable_hex() {
        let a = access_token_hash("token");
        let b = access_token_hash("token");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, access_token_hash("other"));
    }
}
