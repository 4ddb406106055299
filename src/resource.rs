use crate::config::ResourceConfig;
use crate::errors::ProxyError;
use actix_web::http::Method;
use percent_encoding::percent_decode_str;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// A compiled protected resource.
///
/// Claim predicates are merged with the global `match_claims` at compile
/// time, resource-local entries winning on key collision, so the
/// authorization middleware never consults two maps.
#[derive(Debug, Clone)]
pub struct Resource {
    pub uri: String,
    methods: Option<HashSet<Method>>,
    pub roles: Vec<String>,
    pub require_any_role: bool,
    pub claims_match: Vec<(String, Regex)>,
    pub whitelisted: bool,
    pub custom_headers: Vec<(String, String)>,
}

impl Resource {
    fn matches(&self, path: &str, method: &Method) -> bool {
        let prefix_hit =
            path == self.uri || path.starts_with(&format!("{}/", self.uri)) || self.uri == "/";
        if !prefix_hit {
            return false;
        }
        match &self.methods {
            None => true,
            Some(set) => set.contains(method),
        }
    }

    pub fn method_summary(&self) -> String {
        match &self.methods {
            None => "ANY".to_string(),
            Some(set) => {
                let mut names: Vec<&str> = set.iter().map(|m| m.as_str()).collect();
                names.sort_unstable();
                names.join(",")
            }
        }
    }
}

/// The ordered policy table; first prefix and method match wins.
#[derive(Debug, Clone, Default)]
pub struct ResourceTable {
    resources: Vec<Arc<Resource>>,
}

impl ResourceTable {
    /// Compile the configured resources, rejecting invalid entries.
    pub fn compile(
        configs: &[ResourceConfig],
        global_claims: &HashMap<String, String>,
    ) -> Result<ResourceTable, ProxyError> {
        let global = compile_claims(global_claims, "match_claims")?;
        let mut resources = Vec::with_capacity(configs.len());
        for cfg in configs {
            if !cfg.uri.starts_with('/') {
                return Err(ProxyError::ConfigInvalid(format!(
                    "resource uri {} must start with /",
                    cfg.uri
                )));
            }
            let mut seen = HashSet::new();
            for role in &cfg.roles {
                if !seen.insert(role.as_str()) {
                    return Err(ProxyError::ConfigInvalid(format!(
                        "resource {} lists role {} more than once",
                        cfg.uri, role
                    )));
                }
            }
            let methods = compile_methods(&cfg.methods, &cfg.uri)?;
            let local = compile_claims(&cfg.claims_match, &cfg.uri)?;
            let mut claims: Vec<(String, Regex)> = Vec::new();
            let local_keys: HashSet<String> = local.iter().map(|(k, _)| k.clone()).collect();
            claims.extend(local);
            claims.extend(
                global
                    .iter()
                    .filter(|(k, _)| !local_keys.contains(k.as_str()))
                    .cloned(),
            );
            resources.push(Arc::new(Resource {
                uri: cfg.uri.clone(),
                methods,
                roles: cfg.roles.clone(),
                require_any_role: cfg.require_any_role,
                claims_match: claims,
                whitelisted: cfg.whitelisted,
                custom_headers: cfg
                    .custom_headers
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            }));
        }
        Ok(ResourceTable { resources })
    }

    /// Match a canonical path and method against the table, in declaration order.
    pub fn matched(&self, path: &str, method: &Method) -> Option<Arc<Resource>> {
        self.resources
            .iter()
            .find(|r| r.matches(path, method))
            .cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Resource>> {
        self.resources.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

fn compile_methods(
    methods: &[String],
    uri: &str,
) -> Result<Option<HashSet<Method>>, ProxyError> {
    if methods.is_empty() || methods.iter().any(|m| m.eq_ignore_ascii_case("ANY")) {
        return Ok(None);
    }
    let mut set = HashSet::new();
    for name in methods {
        let method = Method::from_bytes(name.to_ascii_uppercase().as_bytes()).map_err(|_| {
            ProxyError::ConfigInvalid(format!("resource {} has invalid method {}", uri, name))
        })?;
        set.insert(method);
    }
    Ok(Some(set))
}

fn compile_claims(
    claims: &HashMap<String, String>,
    context: &str,
) -> Result<Vec<(String, Regex)>, ProxyError> {
    let mut compiled: Vec<(String, Regex)> = Vec::with_capacity(claims.len());
    for (name, pattern) in claims {
        // Claim values must fully match, so the pattern is anchored.
        let anchored = format!("^(?:{})$", pattern);
        let regex = Regex::new(&anchored).map_err(|err| {
            ProxyError::ConfigInvalid(format!(
                "claim match {} on {} does not compile: {}",
                name, context, err
            ))
        })?;
        compiled.push((name.clone(), regex));
    }
    compiled.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(compiled)
}

/// Canonicalize a request path before it is matched against the table.
///
/// Percent-encodings are decoded, repeated slashes collapsed and dot segments
/// resolved. A path that would climb above the root is rejected so it can
/// never reach the upstream under a different resource than its normalized
/// equivalent.
pub fn canonicalize_path(raw: &str) -> Result<String, ProxyError> {
    let decoded = percent_decode_str(raw)
        .decode_utf8()
        .map_err(|_| ProxyError::MalformedRequest("path is not valid utf-8".to_string()))?;
    if decoded.contains('\0') {
        return Err(ProxyError::MalformedRequest(
            "path contains a nul byte".to_string(),
        ));
    }

    let mut segments: Vec<&str> = Vec::new();
    for segment in decoded.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                if segments.pop().is_none() {
                    return Err(ProxyError::MalformedRequest(
                        "path escapes the root".to_string(),
                    ));
                }
            }
            other => segments.push(other),
        }
    }

    if segments.is_empty() {
        Ok("/".to_string())
    } else {
        Ok(format!("/{}", segments.join("/")))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn table(resources: Vec<ResourceConfig>) -> ResourceTable {
        ResourceTable::compile(&resources, &HashMap::new()).unwrap()
    }

    fn admin_resource() -> ResourceConfig {
        ResourceConfig {
            uri: "/admin".to_string(),
            roles: vec!["admin".to_string()],
            ..ResourceConfig::default()
        }
    }

    #[test]
    fn test_prefix_matching() {
        let t = table(vec![admin_resource()]);
        assert!(t.matched("/admin", &Method::GET).is_some());
        assert!(t.matched("/admin/users", &Method::GET).is_some());
        assert!(t.matched("/administrator", &Method::GET).is_none());
        assert!(t.matched("/other", &Method::GET).is_none());
    }

    #[test]
    fn test_declaration_order_wins_over_prefix_length() {
        let t = table(vec![
            ResourceConfig {
                uri: "/api".to_string(),
                roles: vec!["user".to_string()],
                ..ResourceConfig::default()
            },
            ResourceConfig {
                uri: "/api/admin".to_string(),
                roles: vec!["admin".to_string()],
                ..ResourceConfig::default()
            },
        ]);
        let matched = t.matched("/api/admin/thing", &Method::GET).unwrap();
        assert_eq!(matched.uri, "/api");
    }

    #[test]
    fn test_method_set_and_wildcard() {
        let t = table(vec![ResourceConfig {
            uri: "/write".to_string(),
            methods: vec!["POST".to_string(), "put".to_string()],
            ..ResourceConfig::default()
        }]);
        assert!(t.matched("/write", &Method::POST).is_some());
        assert!(t.matched("/write", &Method::PUT).is_some());
        assert!(t.matched("/write", &Method::GET).is_none());

        let any = table(vec![ResourceConfig {
            uri: "/any".to_string(),
            methods: vec!["ANY".to_string()],
            ..ResourceConfig::default()
        }]);
        assert!(any.matched("/any", &Method::DELETE).is_some());
    }

    #[test]
    fn test_root_resource_matches_everything() {
        let t = table(vec![ResourceConfig {
            uri: "/".to_string(),
            ..ResourceConfig::default()
        }]);
        assert!(t.matched("/", &Method::GET).is_some());
        assert!(t.matched("/anything/below", &Method::GET).is_some());
    }

    #[test]
    fn test_invalid_resources_are_rejected() {
        let missing_slash = ResourceTable::compile(
            &[ResourceConfig {
                uri: "admin".to_string(),
                ..ResourceConfig::default()
            }],
            &HashMap::new(),
        );
        assert!(missing_slash.is_err());

        let duplicate_roles = ResourceTable::compile(
            &[ResourceConfig {
                uri: "/admin".to_string(),
                roles: vec!["admin".to_string(), "admin".to_string()],
                ..ResourceConfig::default()
            }],
            &HashMap::new(),
        );
        assert!(duplicate_roles.is_err());

        let bad_regex = ResourceTable::compile(
            &[ResourceConfig {
                uri: "/admin".to_string(),
                claims_match: [("item".to_string(), "(".to_string())].into_iter().collect(),
                ..ResourceConfig::default()
            }],
            &HashMap::new(),
        );
        assert!(bad_regex.is_err());
    }

    #[test]
    fn test_local_claims_override_global() {
        let global: HashMap<String, String> = [
            ("item".to_string(), "^global$".to_string()),
            ("env".to_string(), "^prod$".to_string()),
        ]
        .into_iter()
        .collect();
        let t = ResourceTable::compile(
            &[ResourceConfig {
                uri: "/admin".to_string(),
                claims_match: [("item".to_string(), "^local$".to_string())]
                    .into_iter()
                    .collect(),
                ..ResourceConfig::default()
            }],
            &global,
        )
        .unwrap();
        let resource = t.matched("/admin", &Method::GET).unwrap();
        let item = resource
            .claims_match
            .iter()
            .find(|(k, _)| k == "item")
            .unwrap();
        assert!(item.1.is_match("local"));
        assert!(!item.1.is_match("global"));
        assert!(resource.claims_match.iter().any(|(k, _)| k == "env"));
    }

    #[test]
    fn test_canonicalize_decodes_and_collapses() {
        assert_eq!(canonicalize_path("/admin").unwrap(), "/admin");
        assert_eq!(canonicalize_path("//admin//test").unwrap(), "/admin/test");
        assert_eq!(canonicalize_path("/admin%2Ftest").unwrap(), "/admin/test");
        assert_eq!(
            canonicalize_path("///admin/../admin//%2Ftest").unwrap(),
            "/admin/test"
        );
        assert_eq!(canonicalize_path("/help/../admin/test/21").unwrap(), "/admin/test/21");
        assert_eq!(canonicalize_path("/a/./b").unwrap(), "/a/b");
        assert_eq!(canonicalize_path("/").unwrap(), "/");
    }

    #[test]
    fn test_canonicalize_rejects_root_escape() {
        assert!(canonicalize_path("/..").is_err());
        assert!(canonicalize_path("/../etc/passwd").is_err());
        assert!(canonicalize_path("/a/../../b").is_err());
    }
}
