//! BOLT-8 encrypted transport: handshake machine, Lightning wire codec and the relay I/O that
//! carries both.

pub mod crypto;
pub mod noise_conn;
pub mod noise_machine;
pub mod noise_pattern;
pub mod wire;
pub mod ws;
