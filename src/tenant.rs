//! Tenant identifiers derived from credentials

use sha2::{Digest, Sha256};
use std::fmt;

/// Number of hex characters used in container names and log fields
const SHORT_ID_LEN: usize = 12;

/// Fixed-length, non-reversible digest of a tenant credential.
///
/// The raw credential never outlives the request it arrived on; everything
/// that is stored or logged is keyed by this value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    /// Derive the tenant id for a credential (hex SHA-256)
    pub fn from_credential(credential: &str) -> Self {
        let digest = Sha256::digest(credential.as_bytes());
        Self(hex::encode(digest))
    }

    /// Parse an id previously produced by [`TenantId::from_credential`]
    pub fn parse(value: &str) -> Option<Self> {
        let valid = value.len() == 64 && value.chars().all(|c| c.is_ascii_hexdigit());
        valid.then(|| Self(value.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix used in logs and container names
    pub fn short(&self) -> &str {
        &self.0[..SHORT_ID_LEN]
    }

    /// Deterministic container name for this tenant
    pub fn container_name(&self, prefix: &str) -> String {
        format!("{}{}", prefix, self.short())
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_is_deterministic_and_fixed_length() {
        let a = TenantId::from_credential("ol_api_secret");
        let b = TenantId::from_credential("ol_api_secret");
        let c = TenantId::from_credential("ol_api_other");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str().len(), 64);
        assert!(!a.as_str().contains("secret"));
    }

    #[test]
    fn test_container_name_uses_short_prefix() {
        let id = TenantId::from_credential("key");
        let name = id.container_name("mcp-");
        assert_eq!(name.len(), 4 + 12);
        assert!(name.starts_with("mcp-"));
        assert!(id.as_str().starts_with(&name[4..]));
        assert_eq!(id.to_string(), id.short());
    }

    #[test]
    fn test_parse() {
        let id = TenantId::from_credential("key");
        assert_eq!(TenantId::parse(id.as_str()), Some(id.clone()));
        assert_eq!(TenantId::parse(&id.as_str().to_uppercase()), Some(id));
        assert!(TenantId::parse("abc").is_none());
        assert!(TenantId::parse(&"z".repeat(64)).is_none());
    }
}
