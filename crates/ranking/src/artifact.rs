//! Source artifacts: per-repository symbol reference tables.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A reference to `symbol` from a file at `path`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SymbolReference {
    pub symbol: String,
    pub path: String,
}

impl SymbolReference {
    pub fn new(symbol: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            path: path.into(),
        }
    }
}

/// One uploaded symbol table for a repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceArtifact {
    pub artifact_id: i64,
    pub repository: String,
    pub references: Vec<SymbolReference>,
}

impl SourceArtifact {
    /// Content fingerprint; independent of reference order.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut refs: Vec<&SymbolReference> = self.references.iter().collect();
        refs.sort();

        let mut hasher = Sha256::new();
        hasher.update(self.repository.as_bytes());
        hasher.update([0u8]);
        for r in refs {
            hasher.update(r.symbol.as_bytes());
            hasher.update([b'\t']);
            hasher.update(r.path.as_bytes());
            hasher.update([b'\n']);
        }
        Fingerprint::from_digest(&hasher.finalize())
    }
}

/// Hex-encoded SHA-256 content fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    fn from_digest(digest: &[u8]) -> Self {
        let mut out = String::with_capacity(digest.len() * 2);
        for b in digest {
            out.push_str(&format!("{b:02x}"));
        }
        Self(out)
    }

    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact(refs: &[(&str, &str)]) -> SourceArtifact {
        SourceArtifact {
            artifact_id: 1,
            repository: "github.com/acme/api".into(),
            references: refs
                .iter()
                .map(|(s, p)| SymbolReference::new(*s, *p))
                .collect(),
        }
    }

    #[test]
    fn fingerprint_ignores_reference_order() {
        let a = artifact(&[("Foo", "a.go"), ("Bar", "b.go")]);
        let b = artifact(&[("Bar", "b.go"), ("Foo", "a.go")]);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().as_str().len(), 64);
    }

    #[test]
    fn fingerprint_changes_with_content() {
        let a = artifact(&[("Foo", "a.go")]);
        let b = artifact(&[("Foo", "a2.go")]);
        assert_ne!(a.fingerprint(), b.fingerprint());

        let mut c = a.clone();
        c.repository = "github.com/acme/web".into();
        assert_ne!(a.fingerprint(), c.fingerprint());
    }
}
