//! Physical name derivation for namespaced kinds.
//!
//! Every tenant of the host writes into one shared namespace, so a physical
//! name must be unique across (virtual cluster, namespace, name). The name is
//! a readable prefix followed by a fixed-width digest; two tenants can only
//! collide through a digest collision, never through a naming coincidence.

use sha2::{Digest, Sha256};

/// Maximum length of a DNS-1123 label
pub const MAX_NAME_LEN: usize = 63;

/// Hex characters of the digest appended to every physical name (128 bits)
pub const HASH_HEX_LEN: usize = 32;

/// Separator between the name, namespace and virtual cluster in the prefix
const PREFIX_SEPARATOR: &str = "-x-";

/// Rule translating a virtual (namespace, name) into a physical identity.
///
/// Implementations must be deterministic and pure.
pub trait NameTranslator: Send + Sync {
    /// Physical name for a virtual object
    fn physical_name(&self, name: &str, namespace: &str) -> String;

    /// Physical namespace for objects from the given virtual namespace
    fn physical_namespace(&self, namespace: &str) -> String;
}

/// Default translator: hashed names in a single shared target namespace.
#[derive(Clone, Debug)]
pub struct HashedNameTranslator {
    vcluster_name: String,
    target_namespace: String,
}

impl HashedNameTranslator {
    /// Create a translator for the given virtual cluster and host namespace
    pub fn new(vcluster_name: impl Into<String>, target_namespace: impl Into<String>) -> Self {
        Self {
            vcluster_name: vcluster_name.into(),
            target_namespace: target_namespace.into(),
        }
    }

    /// Virtual cluster this translator names objects for
    pub fn vcluster_name(&self) -> &str {
        &self.vcluster_name
    }

    /// Host namespace every namespaced object lands in
    pub fn target_namespace(&self) -> &str {
        &self.target_namespace
    }
}

impl NameTranslator for HashedNameTranslator {
    fn physical_name(&self, name: &str, namespace: &str) -> String {
        hashed_name(&self.vcluster_name, namespace, name)
    }

    fn physical_namespace(&self, _namespace: &str) -> String {
        self.target_namespace.clone()
    }
}

/// Hex digest identifying (vcluster, namespace, name).
///
/// Fields are NUL-separated so that `("a-b", "c")` and `("a", "b-c")` hash
/// differently.
pub fn identity_digest(vcluster: &str, namespace: &str, name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(vcluster.as_bytes());
    hasher.update([0u8]);
    hasher.update(namespace.as_bytes());
    hasher.update([0u8]);
    hasher.update(name.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..HASH_HEX_LEN / 2])
}

/// Build `<prefix>-<digest>` where the prefix is
/// `<name>-x-<namespace>-x-<vcluster>` sanitized and truncated to fit.
pub fn hashed_name(vcluster: &str, namespace: &str, name: &str) -> String {
    let digest = identity_digest(vcluster, namespace, name);
    let raw = [name, namespace, vcluster].join(PREFIX_SEPARATOR);
    let budget = MAX_NAME_LEN - HASH_HEX_LEN - 1;

    let prefix = sanitize(&raw);
    let prefix = prefix[..prefix.len().min(budget)].trim_matches('-');

    if prefix.is_empty() {
        digest
    } else {
        format!("{prefix}-{digest}")
    }
}

/// Lowercase, map every character outside `[a-z0-9-]` to `-`.
fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}
