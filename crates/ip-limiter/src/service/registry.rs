//! Credential Registry
//!
//! Maps credential identifiers to their protocol kind. The map is rebuilt
//! wholesale from the proxy configuration document and swapped under an
//! exclusive lock, so readers see either the old map or the new one.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::domain::{extract_credentials, ProtocolKind};
use crate::error::DocumentError;
use crate::ports::CredentialLookup;

/// Outcome of a registry rebuild
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RebuildSummary {
    /// Identifiers now registered
    pub entries: usize,
    /// Inbounds with a recognized protocol
    pub inbounds_scanned: usize,
    /// The document was unusable and the registry was cleared
    pub cleared: bool,
}

/// Registry of credentials known to the proxy configuration
#[derive(Debug, Default)]
pub struct CredentialRegistry {
    entries: RwLock<Arc<HashMap<String, ProtocolKind>>>,
}

impl CredentialRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the registry with the credentials found in `document`.
    ///
    /// An unusable document leaves the registry empty.
    pub fn rebuild(&self, document: &[u8]) -> RebuildSummary {
        match extract_credentials(document) {
            Ok(extracted) => {
                let summary = RebuildSummary {
                    entries: extracted.credentials.len(),
                    inbounds_scanned: extracted.inbounds_scanned,
                    cleared: false,
                };
                *self.entries.write() = Arc::new(extracted.credentials);

                info!(
                    entries = summary.entries,
                    inbounds = summary.inbounds_scanned,
                    "Credential registry rebuilt"
                );
                summary
            }
            Err(e) => self.clear_after(e),
        }
    }

    /// Read `path` and rebuild from its contents
    pub fn rebuild_from_path(&self, path: impl AsRef<Path>) -> RebuildSummary {
        match std::fs::read(path.as_ref()) {
            Ok(bytes) => self.rebuild(&bytes),
            Err(e) => self.clear_after(DocumentError::Io(e)),
        }
    }

    fn clear_after(&self, error: DocumentError) -> RebuildSummary {
        *self.entries.write() = Arc::new(HashMap::new());
        warn!(error = %error, "Proxy configuration unusable; credential registry cleared");
        RebuildSummary {
            cleared: true,
            ..RebuildSummary::default()
        }
    }

    pub fn is_registered(&self, identifier: &str) -> bool {
        self.entries.read().contains_key(identifier)
    }

    pub fn protocol_of(&self, identifier: &str) -> Option<ProtocolKind> {
        self.entries.read().get(identifier).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Current map; stays valid after later rebuilds
    pub fn snapshot(&self) -> Arc<HashMap<String, ProtocolKind>> {
        Arc::clone(&self.entries.read())
    }
}

impl CredentialLookup for CredentialRegistry {
    fn is_registered(&self, identifier: &str) -> bool {
        CredentialRegistry::is_registered(self, identifier)
    }

    fn protocol_of(&self, identifier: &str) -> Option<ProtocolKind> {
        CredentialRegistry::protocol_of(self, identifier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const ONE_VLESS: &[u8] = br#"{
        "inbounds": [
            { "protocol": "vless", "tag": "in-vless", "settings": { "clients": [ { "id": "abc-123" } ] } }
        ]
    }"#;

    #[test]
    fn test_rebuild_registers_client() {
        let registry = CredentialRegistry::new();
        let summary = registry.rebuild(ONE_VLESS);

        assert_eq!(summary.entries, 1);
        assert_eq!(summary.inbounds_scanned, 1);
        assert!(!summary.cleared);
        assert!(registry.is_registered("abc-123"));
        assert_eq!(registry.protocol_of("abc-123"), Some(ProtocolKind::Vless));
    }

    #[test]
    fn test_rebuild_with_empty_inbounds_unregisters() {
        let registry = CredentialRegistry::new();
        registry.rebuild(ONE_VLESS);

        let summary = registry.rebuild(br#"{"inbounds": []}"#);
        assert_eq!(summary.entries, 0);
        assert!(!summary.cleared);
        assert!(!registry.is_registered("abc-123"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_malformed_document_clears() {
        let registry = CredentialRegistry::new();
        registry.rebuild(ONE_VLESS);

        let summary = registry.rebuild(b"{not json");
        assert!(summary.cleared);
        assert!(registry.is_empty());

        registry.rebuild(ONE_VLESS);
        assert!(registry.rebuild(br#"{"outbounds": []}"#).cleared);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_snapshot_survives_rebuild() {
        let registry = CredentialRegistry::new();
        registry.rebuild(ONE_VLESS);
        let before = registry.snapshot();

        registry.rebuild(br#"{"inbounds": []}"#);
        assert!(before.contains_key("abc-123"));
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn test_rebuild_from_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(ONE_VLESS).unwrap();

        let registry = CredentialRegistry::new();
        assert_eq!(registry.rebuild_from_path(file.path()).entries, 1);

        let summary = registry.rebuild_from_path("/nonexistent/proxy-config.json");
        assert!(summary.cleared);
        assert!(registry.is_empty());
    }
}
