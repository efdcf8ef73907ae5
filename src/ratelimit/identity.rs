//! Caller identities and the partition keys derived from them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use super::tiers::Tier;
use crate::error::{Result, TollgateError};

/// Maximum accepted API key length.
const MAX_API_KEY_LEN: usize = 256;

const API_KEY_PREFIX: &str = "key:";
const IP_PREFIX: &str = "ip:";

/// The rate-limiting partition key.
///
/// An identity belongs to exactly one tier: API-key holders are on
/// [`Tier::ApiKey`], anonymous callers identified by source address are on
/// [`Tier::Free`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Identity {
    /// An authenticated API-key holder.
    ApiKey(String),
    /// An anonymous caller identified by source IP.
    Anonymous(IpAddr),
}

impl Identity {
    /// Build an API-key identity, rejecting unusable keys.
    pub fn api_key(key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(TollgateError::InvalidIdentity("API key is empty".into()));
        }
        if key.len() > MAX_API_KEY_LEN {
            return Err(TollgateError::InvalidIdentity(format!(
                "API key exceeds {} characters",
                MAX_API_KEY_LEN
            )));
        }
        if key.chars().any(char::is_whitespace) {
            return Err(TollgateError::InvalidIdentity(
                "API key contains whitespace".into(),
            ));
        }
        Ok(Identity::ApiKey(key))
    }

    /// Build an anonymous identity from a textual source address.
    pub fn from_ip_str(addr: &str) -> Result<Self> {
        addr.trim()
            .parse::<IpAddr>()
            .map(Identity::Anonymous)
            .map_err(|_| TollgateError::InvalidIdentity(format!("'{}' is not an IP address", addr)))
    }

    /// The tier this identity is evaluated against.
    pub fn tier(&self) -> Tier {
        match self {
            Identity::ApiKey(_) => Tier::ApiKey,
            Identity::Anonymous(_) => Tier::Free,
        }
    }

    /// The stable string used to key counters in a store.
    ///
    /// Round-trips through [`FromStr`], so stored rows can be mapped back to
    /// an identity (and therefore a tier).
    pub fn partition_key(&self) -> String {
        match self {
            Identity::ApiKey(key) => format!("{}{}", API_KEY_PREFIX, key),
            Identity::Anonymous(ip) => format!("{}{}", IP_PREFIX, ip),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.partition_key())
    }
}

impl FromStr for Identity {
    type Err = TollgateError;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(key) = s.strip_prefix(API_KEY_PREFIX) {
            Identity::api_key(key)
        } else if let Some(ip) = s.strip_prefix(IP_PREFIX) {
            Identity::from_ip_str(ip)
        } else {
            Err(TollgateError::InvalidIdentity(format!(
                "'{}' must start with '{}' or '{}'",
                s, API_KEY_PREFIX, IP_PREFIX
            )))
        }
    }
}

impl TryFrom<String> for Identity {
    type Error = TollgateError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Identity> for String {
    fn from(identity: Identity) -> Self {
        identity.partition_key()
    }
}
