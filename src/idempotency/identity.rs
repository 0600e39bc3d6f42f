use http::{request::Parts, HeaderName};

/// Identity used when no caller could be determined.
pub const ANONYMOUS: &str = "anonymous";

/// Authenticated caller, inserted into request extensions by the auth layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity(pub String);

/// Resolves the opaque caller identity used to scope idempotency keys.
pub trait IdentityExtractor: Send + Sync {
    /// Returns `None` when the request carries no identity.
    fn identify(&self, parts: &Parts) -> Option<String>;
}

/// Reads the [`CallerIdentity`] extension.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtensionIdentity;

impl IdentityExtractor for ExtensionIdentity {
    fn identify(&self, parts: &Parts) -> Option<String> {
        parts
            .extensions
            .get::<CallerIdentity>()
            .map(|identity| identity.0.clone())
            .filter(|identity| !identity.is_empty())
    }
}

/// Reads the identity from a trusted header set by an upstream gateway.
#[derive(Debug, Clone)]
pub struct HeaderIdentity {
    header: HeaderName,
}

impl HeaderIdentity {
    pub fn new(header: HeaderName) -> Self {
        Self { header }
    }
}

impl IdentityExtractor for HeaderIdentity {
    fn identify(&self, parts: &Parts) -> Option<String> {
        parts
            .headers
            .get(&self.header)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    }
}

/// Identity for the request, falling back to [`ANONYMOUS`].
pub fn resolve_identity(extractor: &dyn IdentityExtractor, parts: &Parts) -> String {
    extractor
        .identify(parts)
        .unwrap_or_else(|| ANONYMOUS.to_string())
}
