//! Request and response payloads for the [`super::LnApi`] surface.
//!
//! Response structs only name the fields callers rely on; unknown fields are ignored so newer
//! node versions keep decoding.

use std::{fmt, time::Duration};

use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Millisatoshi amount.
///
/// Core Lightning reports amounts as plain integers, older releases as `"1234msat"` strings;
/// both decode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Msat(pub u64);

impl Msat {
    #[must_use]
    pub fn to_sat(self) -> u64 {
        self.0 / 1000
    }
}

impl fmt::Display for Msat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}msat", self.0)
    }
}

impl<'de> Deserialize<'de> for Msat {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct MsatVisitor;

        impl de::Visitor<'_> for MsatVisitor {
            type Value = Msat;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an msat integer or a \"<n>msat\" string")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Msat, E> {
                Ok(Msat(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Msat, E> {
                u64::try_from(v)
                    .map(Msat)
                    .map_err(|_| E::custom("negative amount"))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Msat, E> {
                v.strip_suffix("msat")
                    .unwrap_or(v)
                    .parse()
                    .map(Msat)
                    .map_err(|_| E::custom(format!("invalid amount {v:?}")))
            }
        }

        deserializer.deserialize_any(MsatVisitor)
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct NodeInfo {
    pub id: String,
    #[serde(default)]
    pub alias: String,
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub num_peers: u32,
    #[serde(default)]
    pub num_pending_channels: u32,
    #[serde(default)]
    pub num_active_channels: u32,
    #[serde(default)]
    pub num_inactive_channels: u32,
    #[serde(default)]
    pub address: Vec<NetAddress>,
    pub version: String,
    pub blockheight: u32,
    pub network: String,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct NetAddress {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub address: Option<String>,
    pub port: u16,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct Funds {
    #[serde(default)]
    pub outputs: Vec<FundOutput>,
    #[serde(default)]
    pub channels: Vec<FundChannel>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct FundOutput {
    pub txid: String,
    pub output: u32,
    pub amount_msat: Msat,
    pub status: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub blockheight: Option<u32>,
    #[serde(default)]
    pub reserved: bool,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct FundChannel {
    pub peer_id: String,
    #[serde(default)]
    pub connected: bool,
    pub state: String,
    #[serde(default)]
    pub short_channel_id: Option<String>,
    pub our_amount_msat: Msat,
    pub amount_msat: Msat,
    pub funding_txid: String,
    pub funding_output: u32,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct PeerChannels {
    #[serde(default)]
    pub channels: Vec<PeerChannel>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct PeerChannel {
    pub peer_id: String,
    #[serde(default)]
    pub peer_connected: bool,
    pub state: String,
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub short_channel_id: Option<String>,
    #[serde(default)]
    pub private: Option<bool>,
    #[serde(default)]
    pub total_msat: Option<Msat>,
    #[serde(default)]
    pub to_us_msat: Option<Msat>,
    #[serde(default)]
    pub spendable_msat: Option<Msat>,
    #[serde(default)]
    pub receivable_msat: Option<Msat>,
}

/// Parameters for [`super::LnApi::create_invoice`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CreateInvoice {
    /// `None` creates an "any amount" invoice.
    pub amount_msat: Option<u64>,
    pub description: String,
    /// Unique label; generated when `None`.
    pub label: Option<String>,
    /// Falls back to the configured invoice expiry.
    pub expiry: Option<Duration>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct InvoiceCreated {
    pub bolt11: String,
    pub payment_hash: String,
    pub expires_at: u64,
    #[serde(default)]
    pub payment_secret: Option<String>,
    /// The label the invoice was stored under. Filled in by the client.
    #[serde(default)]
    pub label: String,
}

/// Parameters for [`super::LnApi::pay_invoice`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PayInvoice {
    pub bolt11: String,
    /// Required only for invoices without an amount.
    pub amount_msat: Option<u64>,
    /// Falls back to the configured fee limit.
    pub max_fee_percent: Option<f64>,
    /// Falls back to the configured retry window.
    pub retry_for: Option<Duration>,
}

/// Parameters for [`super::LnApi::pay_keysend`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Keysend {
    /// Compressed public key of the recipient, hex encoded.
    pub destination: String,
    pub amount_msat: u64,
    pub label: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct Payment {
    pub payment_hash: String,
    pub payment_preimage: String,
    pub status: String,
    #[serde(default)]
    pub destination: Option<String>,
    pub amount_msat: Msat,
    pub amount_sent_msat: Msat,
    #[serde(default)]
    pub parts: u32,
    #[serde(default)]
    pub created_at: f64,
}

impl Payment {
    /// Fees paid on top of the amount.
    #[must_use]
    pub fn fee_msat(&self) -> u64 {
        self.amount_sent_msat.0.saturating_sub(self.amount_msat.0)
    }
}

/// Result of `decode`. The shape depends on what was decoded, so only the discriminator is
/// typed.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct Decoded {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub valid: bool,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct Invoice {
    pub label: String,
    #[serde(default)]
    pub bolt11: Option<String>,
    #[serde(default)]
    pub bolt12: Option<String>,
    pub payment_hash: String,
    pub status: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub amount_msat: Option<Msat>,
    #[serde(default)]
    pub amount_received_msat: Option<Msat>,
    pub expires_at: u64,
    #[serde(default)]
    pub paid_at: Option<u64>,
    #[serde(default)]
    pub payment_preimage: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub(crate) struct InvoiceList {
    #[serde(default)]
    pub invoices: Vec<Invoice>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct Pay {
    pub payment_hash: String,
    pub status: String,
    #[serde(default)]
    pub destination: Option<String>,
    pub created_at: u64,
    #[serde(default)]
    pub bolt11: Option<String>,
    #[serde(default)]
    pub amount_msat: Option<Msat>,
    #[serde(default)]
    pub amount_sent_msat: Option<Msat>,
    #[serde(default)]
    pub preimage: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub(crate) struct PayList {
    #[serde(default)]
    pub pays: Vec<Pay>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct NewAddress {
    #[serde(default)]
    pub bech32: Option<String>,
    #[serde(default)]
    pub p2tr: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct SignedMessage {
    pub signature: String,
    pub recid: String,
    pub zbase: String,
}
