#![deny(unsafe_code)]

//! Core Lightning client toolkit for Rust applications.
//!
//! Talks to a Core Lightning node with commando RPC over a BOLT-8 encrypted tunnel. The
//! tunnel runs through an lnsocket websocket relay, so a node behind NAT is reachable with
//! nothing but its address, a rune and a session secret.
//!
//! Layers, bottom up:
//! - [`transport`]: the BOLT-8 handshake, the Lightning wire codec and the relay tunnel
//! - [`rpc`]: command envelopes and the correlator that matches replies to calls
//! - [`backend`]: the [`LnApi`] surface, the [`CoreLn`] client and the backend factory
//!
//! Example
//! ```no_run
//! use cln_rs::{init_backend, Auth};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let auth = Auth::new(
//!     "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798@203.0.113.7:9735",
//!     "tU-RLjMiDpY2U0o3W1oFowar36RFGpWloPbW9-RuZdo9MyZpZD0wMjRi",
//!     "a session secret kept by the app",
//! );
//! let node = init_backend("core_lightning", auth)?;
//! let info = node.get_info().await?;
//! println!("{} at block {}", info.alias, info.blockheight);
//! node.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! Example (custom configuration and raw commands)
//! ```no_run
//! use std::{sync::Arc, time::Duration};
//!
//! use cln_rs::{Auth, ClientConfig, CoreLn, LnApi};
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let auth = Arc::new(Auth::new(
//!     "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798@node.example.org",
//!     "rune",
//!     "secret",
//! ));
//! let config = ClientConfig {
//!     relay: "wss://relay.example.org".into(),
//!     call_timeout: Duration::from_secs(10),
//!     ..ClientConfig::default()
//! };
//! let node = CoreLn::new(auth, config);
//! node.open().await?;
//! let peers = node.call("listpeers", json!({}), None).await?;
//! println!("{peers}");
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod backend;
pub mod config;
pub mod error;
pub mod rpc;
pub mod transport;

pub use auth::{Auth, NodeAddress};
pub use backend::{
    init_backend, init_backend_with_config, registered_backends, BackendId, ClientState, CoreLn,
    LnApi,
};
pub use config::{ClientConfig, ReconnectPolicy};
pub use error::{LnError, Result};
