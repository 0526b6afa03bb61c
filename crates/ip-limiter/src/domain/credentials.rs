//! Credential extraction from proxy configuration documents
//!
//! Only the inbound list is inspected. Each inbound whose protocol is one of
//! the recognized kinds contributes the identifiers of its clients:
//!
//! ```text
//! { "inbounds": [
//!     { "protocol": "vless",  "tag": "in-1", "settings": { "clients": [ { "id": "..." } ] } },
//!     { "protocol": "trojan", "tag": "in-2", "settings": { "clients": [ { "password": "..." } ] } }
//! ] }
//! ```
//!
//! RULES:
//! - No I/O, no locking; the registry service owns the resulting map
//! - Unrecognized protocols and malformed entries are skipped, not errors

use crate::error::DocumentError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

/// Proxy protocols whose clients carry a credential identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    Vmess,
    Vless,
    Trojan,
}

impl ProtocolKind {
    /// Parse the `protocol` field of an inbound; `None` for any other protocol
    pub fn from_protocol(protocol: &str) -> Option<Self> {
        match protocol {
            "vmess" => Some(ProtocolKind::Vmess),
            "vless" => Some(ProtocolKind::Vless),
            "trojan" => Some(ProtocolKind::Trojan),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolKind::Vmess => "vmess",
            ProtocolKind::Vless => "vless",
            ProtocolKind::Trojan => "trojan",
        }
    }

    /// Client field holding the credential identifier
    pub fn identifier_field(&self) -> &'static str {
        match self {
            ProtocolKind::Trojan => "password",
            ProtocolKind::Vmess | ProtocolKind::Vless => "id",
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Credentials found in one configuration document
#[derive(Clone, Debug, Default)]
pub struct ExtractedCredentials {
    /// identifier -> protocol kind
    pub credentials: HashMap<String, ProtocolKind>,
    /// Inbounds with a recognized protocol
    pub inbounds_scanned: usize,
}

/// Scan a configuration document for client credentials.
///
/// Fails only when the document itself is unusable (not JSON, not an
/// object, no inbound list). Individual malformed inbounds or clients are
/// skipped.
pub fn extract_credentials(document: &[u8]) -> Result<ExtractedCredentials, DocumentError> {
    let root: Value = serde_json::from_slice(document)?;
    let root = root.as_object().ok_or(DocumentError::NotAnObject)?;
    let inbounds = root
        .get("inbounds")
        .and_then(Value::as_array)
        .ok_or(DocumentError::MissingInbounds)?;

    let mut extracted = ExtractedCredentials::default();

    for inbound in inbounds {
        let Some(inbound) = inbound.as_object() else {
            continue;
        };
        let Some(kind) = inbound
            .get("protocol")
            .and_then(Value::as_str)
            .and_then(ProtocolKind::from_protocol)
        else {
            continue;
        };
        let tag = inbound.get("tag").and_then(Value::as_str).unwrap_or("");

        let Some(clients) = inbound
            .get("settings")
            .and_then(|s| s.get("clients"))
            .and_then(Value::as_array)
        else {
            continue;
        };
        extracted.inbounds_scanned += 1;

        for client in clients {
            let identifier = client
                .get(kind.identifier_field())
                .and_then(Value::as_str)
                .unwrap_or("");
            if identifier.is_empty() {
                continue;
            }

            debug!(protocol = %kind, tag = tag, identifier = identifier, "Extracted credential");
            extracted.credentials.insert(identifier.to_string(), kind);
        }
    }

    Ok(extracted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_each_protocol_field() {
        let doc = br#"{
            "inbounds": [
                {"protocol": "vmess", "settings": {"clients": [{"id": "vm-1"}]}},
                {"protocol": "vless", "settings": {"clients": [{"id": "vl-1"}, {"id": "vl-2"}]}},
                {"protocol": "trojan", "settings": {"clients": [{"password": "tj-1", "id": "ignored"}]}}
            ]
        }"#;

        let extracted = extract_credentials(doc).unwrap();
        assert_eq!(extracted.inbounds_scanned, 3);
        assert_eq!(extracted.credentials.len(), 4);
        assert_eq!(extracted.credentials["vm-1"], ProtocolKind::Vmess);
        assert_eq!(extracted.credentials["vl-2"], ProtocolKind::Vless);
        assert_eq!(extracted.credentials["tj-1"], ProtocolKind::Trojan);
        assert!(!extracted.credentials.contains_key("ignored"));
    }

    #[test]
    fn test_skips_unrecognized_protocols_and_bad_clients() {
        let doc = br#"{
            "inbounds": [
                {"protocol": "shadowsocks", "settings": {"clients": [{"id": "ss-1"}]}},
                {"protocol": "vless", "settings": {"clients": [{"id": ""}, {"email": "x"}, 7, {"id": "ok"}]}},
                {"protocol": "vmess"},
                "not-an-object"
            ]
        }"#;

        let extracted = extract_credentials(doc).unwrap();
        assert_eq!(extracted.credentials.len(), 1);
        assert!(extracted.credentials.contains_key("ok"));
    }

    #[test]
    fn test_rejects_unusable_documents() {
        assert!(matches!(
            extract_credentials(b"{not json"),
            Err(DocumentError::Parse(_))
        ));
        assert!(matches!(
            extract_credentials(b"[1, 2]"),
            Err(DocumentError::NotAnObject)
        ));
        assert!(matches!(
            extract_credentials(br#"{"outbounds": []}"#),
            Err(DocumentError::MissingInbounds)
        ));
    }

    #[test]
    fn test_protocol_kind_round_trip() {
        for kind in [ProtocolKind::Vmess, ProtocolKind::Vless, ProtocolKind::Trojan] {
            assert_eq!(ProtocolKind::from_protocol(kind.as_str()), Some(kind));
        }
        assert_eq!(ProtocolKind::from_protocol("VLESS"), None);
    }
}
