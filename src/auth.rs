//! Credential recognition: an ordered registry of adapters over inbound
//! headers. Adapters only ever see and emit sanitized prefixes; full tokens
//! are never logged or stored on the decision.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum CredentialKind {
    #[serde(rename = "api-key")]
    ApiKey,
    #[serde(rename = "oauth")]
    Oauth,
    #[serde(rename = "unknown")]
    Unknown,
}

#[derive(Clone, Debug, Serialize)]
pub struct AuthInfo {
    pub adapter: String,
    pub kind: CredentialKind,
    pub prefix: String,
    pub valid: bool,
}

impl AuthInfo {
    pub fn unknown() -> Self {
        Self {
            adapter: String::new(),
            kind: CredentialKind::Unknown,
            prefix: String::new(),
            valid: false,
        }
    }
}

/// Header map with case-insensitive names. Values keep their arrival order;
/// adapters read the first value of a name.
#[derive(Clone, Debug, Default)]
pub struct Headers {
    map: HashMap<String, Vec<String>>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        self.map
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(value.into());
    }

    pub fn from_http(headers: &axum::http::HeaderMap) -> Self {
        let mut out = Self::new();
        for (name, value) in headers {
            if let Ok(v) = value.to_str() {
                out.insert(name.as_str(), v);
            }
        }
        out
    }

    pub fn get_first(&self, name: &str) -> Option<&str> {
        self.map
            .get(&name.to_ascii_lowercase())
            .and_then(|v| v.first())
            .map(|s| s.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

pub trait AuthAdapter: Send + Sync {
    fn id(&self) -> &'static str;
    fn priority(&self) -> u8;
    fn detect(&self, headers: &Headers) -> bool;
    fn extract(&self, headers: &Headers) -> AuthInfo;
}

/// `Bearer <token>` value of the authorization header, if well formed.
fn bearer_token(headers: &Headers) -> Option<&str> {
    let raw = headers.get_first("authorization")?;
    if raw.len() < 7 || !raw[..6].eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = raw[6..].trim();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

/// At most the first 5 characters, then an ellipsis.
fn sanitized_prefix(token: &str) -> String {
    let head: String = token.chars().take(5).collect();
    format!("{}\u{2026}", head)
}

/// Shared shape of the shipped adapters: match a bearer token prefix.
struct BearerPrefixAdapter {
    id: &'static str,
    priority: u8,
    token_prefix: &'static str,
    kind: CredentialKind,
}

impl AuthAdapter for BearerPrefixAdapter {
    fn id(&self) -> &'static str {
        self.id
    }

    fn priority(&self) -> u8 {
        self.priority
    }

    fn detect(&self, headers: &Headers) -> bool {
        bearer_token(headers)
            .map(|t| t.starts_with(self.token_prefix))
            .unwrap_or(false)
    }

    fn extract(&self, headers: &Headers) -> AuthInfo {
        match bearer_token(headers) {
            Some(token) => AuthInfo {
                adapter: self.id.to_string(),
                kind: self.kind,
                prefix: sanitized_prefix(token),
                valid: true,
            },
            None => AuthInfo::unknown(),
        }
    }
}

pub struct AuthAdapterRegistry {
    adapters: Vec<Arc<dyn AuthAdapter>>,
}

impl AuthAdapterRegistry {
    pub fn new() -> Self {
        Self {
            adapters: Vec::new(),
        }
    }

    /// Registry with the shipped OpenAI-key, Anthropic-OAuth and
    /// Google-OAuth adapters.
    pub fn with_default_adapters() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(BearerPrefixAdapter {
            id: "openai-key",
            priority: 30,
            token_prefix: "sk-",
            kind: CredentialKind::ApiKey,
        }));
        registry.register(Arc::new(BearerPrefixAdapter {
            id: "anthropic-oauth",
            priority: 20,
            token_prefix: "anthropic_",
            kind: CredentialKind::Oauth,
        }));
        registry.register(Arc::new(BearerPrefixAdapter {
            id: "google-oauth",
            priority: 10,
            token_prefix: "ya29.",
            kind: CredentialKind::Oauth,
        }));
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn AuthAdapter>) {
        self.adapters.push(adapter);
        self.adapters.sort_by(|a, b| b.priority().cmp(&a.priority()));
    }

    /// Highest-priority adapter whose `detect` fires wins; otherwise an
    /// unknown, invalid `AuthInfo` (malformed and missing credentials look
    /// the same to downstream consumers).
    pub fn classify(&self, headers: &Headers) -> AuthInfo {
        for adapter in &self.adapters {
            if adapter.detect(headers) {
                return adapter.extract(headers);
            }
        }
        AuthInfo::unknown()
    }
}

impl Default for AuthAdapterRegistry {
    fn default() -> Self {
        Self::with_default_adapters()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(value: &str) -> Headers {
        let mut h = Headers::new();
        h.insert("Authorization", value);
        h
    }

    #[test]
    fn recognizes_openai_style_keys() {
        let info = AuthAdapterRegistry::with_default_adapters().classify(&headers("Bearer sk-abc"));
        assert_eq!(info.adapter, "openai-key");
        assert_eq!(info.kind, CredentialKind::ApiKey);
        assert_eq!(info.prefix, "sk-ab\u{2026}");
        assert!(info.valid);
    }

    #[test]
    fn recognizes_anthropic_and_google_oauth() {
        let registry = AuthAdapterRegistry::with_default_adapters();

        let info = registry.classify(&headers("Bearer anthropic_xyz"));
        assert_eq!(info.adapter, "anthropic-oauth");
        assert_eq!(info.kind, CredentialKind::Oauth);

        let info = registry.classify(&headers("Bearer ya29.ABCD"));
        assert_eq!(info.adapter, "google-oauth");
        assert_eq!(info.kind, CredentialKind::Oauth);
    }

    #[test]
    fn header_lookup_is_case_insensitive_and_multi_value_aware() {
        let registry = AuthAdapterRegistry::with_default_adapters();
        let mut h = Headers::new();
        h.insert("AUTHORIZATION", "Bearer sk-zzz");
        h.insert("authorization", "Bearer ya29.later");
        let info = registry.classify(&h);
        // First value of the name wins.
        assert_eq!(info.adapter, "openai-key");
    }

    #[test]
    fn missing_or_malformed_credentials_are_unknown_and_invalid() {
        let registry = AuthAdapterRegistry::with_default_adapters();

        let info = registry.classify(&Headers::new());
        assert_eq!(info.kind, CredentialKind::Unknown);
        assert!(!info.valid);

        for malformed in ["Bearer", "Bearer   ", "Basic dXNlcg==", "token sk-abc"] {
            let info = registry.classify(&headers(malformed));
            assert_eq!(info.kind, CredentialKind::Unknown, "case: {malformed}");
            assert!(!info.valid);
        }
    }

    #[test]
    fn no_credential_material_survives_extraction() {
        let token = "sk-super-secret-key-material-0123456789";
        let info =
            AuthAdapterRegistry::with_default_adapters().classify(&headers(&format!("Bearer {token}")));
        assert!(info.prefix.len() < 10);
        assert!(!info.prefix.contains("secret"));
        let encoded = serde_json::to_string(&info).unwrap();
        assert!(!encoded.contains("secret"));
    }

    #[test]
    fn priority_orders_adapter_evaluation() {
        struct CatchAll;
        impl AuthAdapter for CatchAll {
            fn id(&self) -> &'static str {
                "catch-all"
            }
            fn priority(&self) -> u8 {
                99
            }
            fn detect(&self, headers: &Headers) -> bool {
                !headers.is_empty()
            }
            fn extract(&self, _headers: &Headers) -> AuthInfo {
                AuthInfo {
                    adapter: "catch-all".into(),
                    kind: CredentialKind::ApiKey,
                    prefix: String::new(),
                    valid: true,
                }
            }
        }
        let mut registry = AuthAdapterRegistry::with_default_adapters();
        registry.register(Arc::new(CatchAll));
        let info = registry.classify(&headers("Bearer sk-abc"));
        assert_eq!(info.adapter, "catch-all");
    }
}
