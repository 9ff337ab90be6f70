//! Credentials for one node session.

use std::{fmt, str::FromStr};

use k256::{PublicKey, SecretKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{config::DEFAULT_PORT, error::LnError, transport::brontide::crypto::compressed};

/// Node address, rune and session secret.
///
/// Immutable for the life of a session: re-authentication replaces the whole value. The client
/// shares it as `Arc<Auth>` and never mutates it. Persisting it is up to the caller, which is
/// why it serializes (with the field names `address`, `token`, `sessionSecret`).
///
/// # Examples
///
/// ```
/// use cln_rs::Auth;
///
/// let auth = Auth::new(
///     "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798@10.0.0.5",
///     "",
///     "correct horse battery staple",
/// );
/// let addr = auth.validate().expect("valid");
/// assert_eq!(addr.port, 9735);
/// assert!(auth.is_anonymous());
/// ```
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Auth {
    /// `<node_pubkey_hex>@<host>[:<port>]`.
    pub address: String,
    /// Rune presented with every command. Empty means an anonymous session.
    pub token: String,
    /// Seed for the local node key used in the handshake.
    pub session_secret: String,
}

impl Auth {
    pub fn new(
        address: impl Into<String>,
        token: impl Into<String>,
        session_secret: impl Into<String>,
    ) -> Self {
        Self {
            address: address.into(),
            token: token.into(),
            session_secret: session_secret.into(),
        }
    }

    /// Check that the address parses and the session secret yields a key.
    ///
    /// # Errors
    /// Returns [`LnError::InvalidAuth`] naming the offending field.
    pub fn validate(&self) -> Result<NodeAddress, LnError> {
        let address = self.node_address()?;
        self.local_secret_key()?;
        Ok(address)
    }

    /// # Errors
    /// Returns [`LnError::InvalidAuth`] when the address is empty or malformed.
    pub fn node_address(&self) -> Result<NodeAddress, LnError> {
        self.address.parse()
    }

    /// Local static key for the handshake.
    ///
    /// A 64-character hex secret is taken as the key itself; anything else is hashed with
    /// SHA-256 first.
    ///
    /// # Errors
    /// Returns [`LnError::InvalidAuth`] when the secret is empty or does not map to a valid
    /// secp256k1 scalar.
    pub fn local_secret_key(&self) -> Result<SecretKey, LnError> {
        let secret = self.session_secret.trim();
        if secret.is_empty() {
            return Err(LnError::InvalidAuth("session secret is empty".into()));
        }
        let bytes: [u8; 32] = if secret.len() == 64 && secret.bytes().all(|b| b.is_ascii_hexdigit()) {
            let mut out = [0u8; 32];
            hex::decode_to_slice(secret, &mut out)
                .map_err(|e| LnError::InvalidAuth(format!("session secret: {e}")))?;
            out
        } else {
            Sha256::digest(secret.as_bytes()).into()
        };
        SecretKey::from_slice(&bytes).map_err(|_| {
            LnError::InvalidAuth("session secret is not a valid secp256k1 key".into())
        })
    }

    /// The rune, or `None` for an anonymous session.
    #[must_use]
    pub fn rune(&self) -> Option<&str> {
        let token = self.token.trim();
        (!token.is_empty()).then_some(token)
    }

    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        self.rune().is_none()
    }
}

impl fmt::Debug for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Auth")
            .field("address", &self.address)
            .field("token", &redact(&self.token))
            .field("session_secret", &redact(&self.session_secret))
            .finish()
    }
}

fn redact(value: &str) -> &'static str {
    if value.is_empty() {
        "<empty>"
    } else {
        "<redacted>"
    }
}

/// Parsed form of [`Auth::address`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeAddress {
    pub node_id: PublicKey,
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    /// # Errors
    /// Returns [`LnError::InvalidAuth`] when any component is missing or malformed.
    pub fn parse(raw: &str) -> Result<Self, LnError> {
        let invalid = |why: &str| LnError::InvalidAuth(format!("address {raw:?}: {why}"));
        let raw_trimmed = raw.trim();
        if raw_trimmed.is_empty() {
            return Err(LnError::InvalidAuth("address is empty".into()));
        }
        let (node_hex, endpoint) = raw_trimmed
            .split_once('@')
            .ok_or_else(|| invalid("expected <node_id>@<host>[:<port>]"))?;
        if node_hex.len() != 66 {
            return Err(invalid("node id must be 33 bytes of hex"));
        }
        let node_bytes = hex::decode(node_hex).map_err(|_| invalid("node id is not hex"))?;
        let node_id = PublicKey::from_sec1_bytes(&node_bytes)
            .map_err(|_| invalid("node id is not a valid public key"))?;

        let (host, port) = split_host_port(endpoint).ok_or_else(|| invalid("bad host or port"))?;
        if host.is_empty() {
            return Err(invalid("host is empty"));
        }
        Ok(Self {
            node_id,
            host: host.to_string(),
            port,
        })
    }

    /// `host:port`, with IPv6 hosts bracketed.
    #[must_use]
    pub fn host_port(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    #[must_use]
    pub fn node_id_hex(&self) -> String {
        hex::encode(compressed(&self.node_id))
    }
}

fn split_host_port(endpoint: &str) -> Option<(&str, u16)> {
    if let Some(rest) = endpoint.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        return match tail.strip_prefix(':') {
            Some(port) => Some((host, parse_port(port)?)),
            None if tail.is_empty() => Some((host, DEFAULT_PORT)),
            None => None,
        };
    }
    match endpoint.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => Some((host, parse_port(port)?)),
        // Bare IPv6 literal without brackets.
        Some(_) => Some((endpoint, DEFAULT_PORT)),
        None => Some((endpoint, DEFAULT_PORT)),
    }
}

fn parse_port(raw: &str) -> Option<u16> {
    raw.parse::<u16>().ok().filter(|p| *p != 0)
}

impl FromStr for NodeAddress {
    type Err = LnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.node_id_hex(), self.host_port())
    }
}
