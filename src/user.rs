use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// Per-request identity materialized from a verified access token.
///
/// Created by the authentication middleware and discarded with the request.
/// Roles combine realm roles with client roles flattened as `client:role`.
#[derive(Debug, Clone)]
pub struct UserContext {
    pub id: String,
    pub name: String,
    pub preferred_name: String,
    pub email: String,
    pub audience: Vec<String>,
    pub expires_at: DateTime<Utc>,
    pub roles: Vec<String>,
    pub claims: Value,
    pub raw_token: String,
    pub bearer: bool,
}

impl UserContext {
    /// Extract the identity from token claims.
    ///
    /// `sub` and `exp` are the only hard requirements; everything else falls
    /// back to an empty value or, for the preferred name, to the email.
    pub fn from_claims(claims: Value, raw_token: &str, bearer: bool) -> Option<UserContext> {
        let id = claims.get("sub")?.as_str()?.to_string();
        let exp = claims.get("exp")?.as_i64()?;
        let expires_at = Utc.timestamp_opt(exp, 0).single()?;

        let email = string_claim(&claims, "email");
        let preferred_name = match string_claim(&claims, "preferred_username") {
            name if name.is_empty() => email.clone(),
            name => name,
        };
        let name = match string_claim(&claims, "name") {
            n if n.is_empty() => preferred_name.clone(),
            n => n,
        };

        Some(UserContext {
            id,
            name,
            preferred_name,
            email,
            audience: audiences(&claims),
            expires_at,
            roles: extract_roles(&claims),
            claims,
            raw_token: raw_token.to_string(),
            bearer,
        })
    }

    pub fn is_audience(&self, aud: &str) -> bool {
        self.audience.iter().any(|a| a == aud)
    }

    pub fn is_expired(&self, skew: Duration) -> bool {
        self.expires_at + chrono::Duration::seconds(skew.as_secs() as i64) < Utc::now()
    }

    /// Seconds until expiry, floored at zero.
    pub fn expires_in(&self) -> i64 {
        (self.expires_at - Utc::now()).num_seconds().max(0)
    }

    pub fn roles_joined(&self) -> String {
        self.roles.join(",")
    }

    /// Stringified values of a claim; a scalar yields one entry, a list one
    /// per element, a missing claim none.
    pub fn claim_values(&self, name: &str) -> Vec<String> {
        match self.claims.get(name) {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items.iter().map(stringify).collect(),
            Some(other) => vec![stringify(other)],
        }
    }
}

impl fmt::Display for UserContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "user: {}, expires: {}, roles: {}",
            self.preferred_name,
            self.expires_at,
            self.roles_joined()
        )
    }
}

fn string_claim(claims: &Value, name: &str) -> String {
    claims
        .get(name)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn audiences(claims: &Value) -> Vec<String> {
    match claims.get("aud") {
        Some(Value::String(aud)) => vec![aud.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

fn extract_roles(claims: &Value) -> Vec<String> {
    let mut roles = Vec::new();
    if let Some(realm) = claims
        .get("realm_access")
        .and_then(|v| v.get("roles"))
        .and_then(Value::as_array)
    {
        roles.extend(realm.iter().filter_map(Value::as_str).map(str::to_string));
    }
    if let Some(clients) = claims.get("resource_access").and_then(Value::as_object) {
        for (client, access) in clients {
            if let Some(list) = access.get("roles").and_then(Value::as_array) {
                roles.extend(
                    list.iter()
                        .filter_map(Value::as_str)
                        .map(|role| format!("{}:{}", client, role)),
                );
            }
        }
    }
    roles
}
