//! BOLT-8 Noise machine, split into focused modules.

pub mod cipher_state;
pub mod machine;
pub mod symmetric_state;

pub use machine::{
    BrontideMachine, BrontideMachineConfig, MessageOpener, MessageSealer, ENC_HEADER_SIZE,
    LENGTH_HEADER_SIZE, MAC_SIZE, MAX_MESSAGE_SIZE,
};

#[derive(thiserror::Error, Debug)]
pub enum NoiseError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("crypto error: {0}")]
    Crypto(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
}
