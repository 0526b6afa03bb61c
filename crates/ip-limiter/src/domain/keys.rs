//! Shared-store key layout
//!
//! ```text
//! <prefix>:<identifier>:ips                  SET of client addresses
//! <prefix>:<identifier>:ipcount:<address>    integer connection counter
//! ```
//!
//! Every instance pointing at the same store and prefix shares these keys;
//! that is what makes the limit hold across processes.

/// Key builder for one limiter namespace
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyNamespace {
    prefix: String,
}

impl KeyNamespace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Set of active client addresses for a credential
    pub fn address_set(&self, identifier: &str) -> String {
        format!("{}:{}:ips", self.prefix, identifier)
    }

    /// Connection counter for a (credential, address) pair
    pub fn connection_counter(&self, identifier: &str, address: &str) -> String {
        format!("{}:{}:ipcount:{}", self.prefix, identifier, address)
    }

    /// Both keys touched by one connection of `identifier` from `address`
    pub fn slot(&self, identifier: &str, address: &str) -> SlotKeys {
        SlotKeys {
            set_key: self.address_set(identifier),
            counter_key: self.connection_counter(identifier, address),
            member: address.to_string(),
        }
    }

    /// Glob matching every key in the namespace
    pub fn pattern(&self) -> String {
        format!("{}:*", self.prefix)
    }
}

impl Default for KeyNamespace {
    fn default() -> Self {
        Self::new(crate::domain::config::DEFAULT_KEY_PREFIX)
    }
}

/// Keys and set member for one (credential, address) pair
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlotKeys {
    pub set_key: String,
    pub counter_key: String,
    pub member: String,
}

/// Minimal glob match supporting `*`, used by stores without native pattern scans
pub fn glob_match(pattern: &str, key: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == key;
    }

    let (first, last) = (parts[0], parts[parts.len() - 1]);
    if !key.starts_with(first) || key.len() < first.len() + last.len() || !key.ends_with(last) {
        return false;
    }

    let mut rest = &key[first.len()..key.len() - last.len()];
    for part in &parts[1..parts.len() - 1] {
        match rest.find(part) {
            Some(pos) => rest = &rest[pos + part.len()..],
            None => return false,
        }
    }
    true
}
