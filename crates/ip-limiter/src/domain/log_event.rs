//! Proxy log line classification
//!
//! Recognized shapes:
//!
//! - accept:   `accept a <protocol> connection from <address>:<port>`
//! - identify: `identifier: <identifier>`
//! - close:    `connection closed`
//! - session:  `[<digits>]`, the handle the proxy engine stamps on every
//!   record belonging to one connection
//!
//! Cheap substring checks gate every regex evaluation.

use regex::Regex;
use std::sync::LazyLock;

const ACCEPT_MARKER: &str = "accept";
const IDENTIFIER_MARKER: &str = "identifier:";
const CLOSED_MARKER: &str = "connection closed";

// SAFETY: .expect() on LazyLock with compile-time literal patterns.
static ACCEPT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"accept a ([a-zA-Z0-9\-]+) connection from (.+?):(\d+)")
        .expect("BUG: ACCEPT_PATTERN regex is invalid")
});

static IDENTIFIER_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"identifier: ([a-zA-Z0-9\-]+)").expect("BUG: IDENTIFIER_PATTERN regex is invalid")
});

static SESSION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[(\d+)\]").expect("BUG: SESSION_PATTERN regex is invalid")
});

/// A matched accept record
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AcceptEvent {
    pub protocol: String,
    pub address: String,
    pub port: u16,
}

/// Everything recognized in a single line
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParsedLine {
    /// Session handle, when the line carries one
    pub session: Option<u64>,
    pub accept: Option<AcceptEvent>,
    pub identifier: Option<String>,
    pub closed: bool,
}

impl ParsedLine {
    /// Nothing of interest was found
    pub fn is_empty(&self) -> bool {
        self.accept.is_none() && self.identifier.is_none() && !self.closed
    }
}

/// Match the accept shape anywhere in `line`
pub fn match_accept(line: &str) -> Option<AcceptEvent> {
    let caps = ACCEPT_PATTERN.captures(line)?;
    let port = caps.get(3)?.as_str().parse().ok()?;
    Some(AcceptEvent {
        protocol: caps.get(1)?.as_str().to_string(),
        address: caps.get(2)?.as_str().to_string(),
        port,
    })
}

/// Match the identify shape anywhere in `line`
pub fn match_identifier(line: &str) -> Option<String> {
    IDENTIFIER_PATTERN
        .captures(line)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// First session handle in `line`
pub fn match_session(line: &str) -> Option<u64> {
    SESSION_PATTERN
        .captures(line)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Classify one log line. Never fails; unrecognized input yields an empty result.
pub fn parse_line(line: &str) -> ParsedLine {
    let accept = if line.contains(ACCEPT_MARKER) {
        match_accept(line)
    } else {
        None
    };
    let identifier = if line.contains(IDENTIFIER_MARKER) {
        match_identifier(line)
    } else {
        None
    };
    let closed = line.contains(CLOSED_MARKER);

    let mut parsed = ParsedLine {
        session: None,
        accept,
        identifier,
        closed,
    };
    if !parsed.is_empty() && line.contains('[') {
        parsed.session = match_session(line);
    }
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_shape() {
        let event = match_accept("proxy: accept a vless connection from 203.0.113.7:51234").unwrap();
        assert_eq!(event.protocol, "vless");
        assert_eq!(event.address, "203.0.113.7");
        assert_eq!(event.port, 51234);
    }

    #[test]
    fn test_accept_address_is_shortest_match() {
        let event = match_accept("accept a vmess connection from 10.0.0.1:443 via 10.0.0.2:80").unwrap();
        assert_eq!(event.address, "10.0.0.1");
        assert_eq!(event.port, 443);
    }

    #[test]
    fn test_accept_rejects_out_of_range_port() {
        assert!(match_accept("accept a vless connection from 1.2.3.4:99999").is_none());
    }

    #[test]
    fn test_identifier_shape() {
        assert_eq!(
            match_identifier("user identifier: 5f3c-aa01-beef").as_deref(),
            Some("5f3c-aa01-beef")
        );
        assert!(match_identifier("identifier: ").is_none());
    }

    #[test]
    fn test_parse_line_single_line_correlation() {
        let parsed = parse_line(
            "[2817391] accept a trojan connection from 198.51.100.4:40000 identifier: tj-pass",
        );
        assert_eq!(parsed.session, Some(2817391));
        assert_eq!(parsed.identifier.as_deref(), Some("tj-pass"));
        assert_eq!(parsed.accept.unwrap().address, "198.51.100.4");
        assert!(!parsed.closed);
    }

    #[test]
    fn test_parse_line_close() {
        let parsed = parse_line("2024/01/01 [Info] [77] connection closed");
        assert!(parsed.closed);
        assert_eq!(parsed.session, Some(77));
    }

    #[test]
    fn test_parse_line_ignores_noise() {
        let parsed = parse_line("[Debug] [12] dns: resolved example.com");
        assert!(parsed.is_empty());
        assert_eq!(parsed.session, None);

        // "accept" without the full shape
        assert!(parse_line("accepted tcp:example.com:443").is_empty());
    }
}
