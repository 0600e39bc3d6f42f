use http::{header, request::Parts};
use sha2::{Digest, Sha256};

/// Request attributes that identify "the same logical request".
///
/// Arbitrary custom headers are deliberately left out, so incidental header
/// churn between retries does not turn into a key conflict.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FingerprintInput<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub query: &'a str,
    pub host: &'a str,
    pub content_type: &'a str,
    pub identity: &'a str,
    pub body: &'a [u8],
}

impl<'a> FingerprintInput<'a> {
    /// Collects the fingerprint fields from a request head and its buffered body.
    pub fn from_parts(parts: &'a Parts, identity: &'a str, body: &'a [u8]) -> Self {
        let host = parts
            .headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .or_else(|| parts.uri.authority().map(|a| a.as_str()))
            .unwrap_or("");
        let content_type = parts
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");

        Self {
            method: parts.method.as_str(),
            path: parts.uri.path(),
            query: parts.uri.query().unwrap_or(""),
            host,
            content_type,
            identity,
            body,
        }
    }

    /// Computes the hex SHA-256 fingerprint.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();

        update_field(&mut hasher, b"method", self.method.to_ascii_uppercase().as_bytes());
        update_field(&mut hasher, b"path", self.path.as_bytes());
        update_field(&mut hasher, b"query", self.query.as_bytes());
        update_field(&mut hasher, b"host", self.host.as_bytes());
        update_field(&mut hasher, b"content-type", self.content_type.as_bytes());
        update_field(&mut hasher, b"identity", self.identity.as_bytes());
        // An empty body still hashes to the digest of "", never to "absent".
        update_field(&mut hasher, b"body", body_digest(self.body).as_bytes());

        hex::encode(hasher.finalize())
    }
}

/// Hex SHA-256 of the raw request body.
pub fn body_digest(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

/// Length-prefixed so adjacent fields cannot bleed into each other.
fn update_field(hasher: &mut Sha256, label: &[u8], value: &[u8]) {
    hasher.update(label);
    hasher.update((value.len() as u64).to_be_bytes());
    hasher.update(value);
}
