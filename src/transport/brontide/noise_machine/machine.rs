use std::{
    io::{Read, Write},
    sync::Arc,
};

use k256::{PublicKey, SecretKey};
use tracing::{debug, trace};

use super::{cipher_state::CipherState, symmetric_state::SymmetricState, NoiseError};
use crate::transport::brontide::{
    crypto::{compressed, ecdh, gen_ephemeral, public_from_secret},
    noise_pattern::{pattern_xk, HandshakePattern, MessagePattern, Token},
};

const PROTOCOL_NAME: &str = "Noise_XK_secp256k1_ChaChaPoly_SHA256";
const PROLOGUE: &[u8] = b"lightning";
const HANDSHAKE_VERSION: u8 = 0;

pub const MAC_SIZE: usize = 16;
pub const LENGTH_HEADER_SIZE: usize = 2;
pub const ENC_HEADER_SIZE: usize = LENGTH_HEADER_SIZE + MAC_SIZE;
pub const MAX_MESSAGE_SIZE: usize = u16::MAX as usize;

/// Inputs for one side of a BOLT-8 handshake.
pub struct BrontideMachineConfig {
    /// Whether this machine dials out (acts one and three) or answers (act two).
    pub initiator: bool,
    /// Local node key.
    pub local_static: Arc<SecretKey>,
    /// The responder's node key. Required on the initiator, ignored on the responder.
    pub remote_static: Option<PublicKey>,
    /// Fixed ephemeral key; a fresh one is generated when `None`.
    pub ephemeral: Option<SecretKey>,
}

struct HandshakeState {
    symmetric: SymmetricState,
    initiator: bool,
    local_static: Arc<SecretKey>,
    local_ephemeral: Option<SecretKey>,
    ephemeral_seed: Option<SecretKey>,
    remote_static: Option<PublicKey>,
    remote_ephemeral: Option<PublicKey>,
    pattern: HandshakePattern,
}

impl HandshakeState {
    fn new(cfg: BrontideMachineConfig) -> Result<Self, NoiseError> {
        if cfg.initiator && cfg.remote_static.is_none() {
            return Err(NoiseError::InvalidState(
                "initiator requires the remote static key".into(),
            ));
        }
        let mut state = Self {
            symmetric: SymmetricState::start(PROTOCOL_NAME, PROLOGUE),
            initiator: cfg.initiator,
            local_static: cfg.local_static,
            local_ephemeral: None,
            ephemeral_seed: cfg.ephemeral,
            remote_static: cfg.remote_static,
            remote_ephemeral: None,
            pattern: pattern_xk(),
        };

        for m in state.pattern.pre_messages {
            let key = if m.initiator == state.initiator {
                public_from_secret(state.local_static.as_ref())
            } else {
                *state.remote()?
            };
            state.symmetric.mix_hash(&compressed(&key));
        }
        Ok(state)
    }

    fn remote(&self) -> Result<&PublicKey, NoiseError> {
        self.remote_static
            .as_ref()
            .ok_or_else(|| NoiseError::InvalidState("remote static missing".into()))
    }

    fn remote_eph(&self) -> Result<&PublicKey, NoiseError> {
        self.remote_ephemeral
            .as_ref()
            .ok_or_else(|| NoiseError::InvalidState("remote ephemeral missing".into()))
    }

    fn local_eph(&self) -> Result<&SecretKey, NoiseError> {
        self.local_ephemeral
            .as_ref()
            .ok_or_else(|| NoiseError::InvalidState("local ephemeral missing".into()))
    }

    fn write_act(&mut self, mp: &MessagePattern) -> Result<Vec<u8>, NoiseError> {
        let mut buf = Vec::with_capacity(mp.wire_size());
        buf.push(HANDSHAKE_VERSION);
        for token in mp.tokens {
            match token {
                Token::E => {
                    let sk = self.ephemeral_seed.take().unwrap_or_else(gen_ephemeral);
                    let encoded = compressed(&public_from_secret(&sk));
                    self.local_ephemeral = Some(sk);
                    self.symmetric.mix_hash(&encoded);
                    buf.extend_from_slice(&encoded);
                }
                Token::S => {
                    let encoded = compressed(&public_from_secret(self.local_static.as_ref()));
                    let ciphertext = self.symmetric.encrypt_and_hash(&encoded)?;
                    buf.extend_from_slice(&ciphertext);
                }
                dh => self.mix_dh(*dh)?,
            }
        }
        let tag = self.symmetric.encrypt_and_hash(&[])?;
        buf.extend_from_slice(&tag);
        trace!(
            target: "cln_rs::noise",
            act = mp.act,
            len = buf.len(),
            "wrote handshake act"
        );
        Ok(buf)
    }

    fn read_act<R: Read>(&mut self, reader: &mut R, mp: &MessagePattern) -> Result<(), NoiseError> {
        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != HANDSHAKE_VERSION {
            return Err(NoiseError::InvalidState(format!(
                "act {}: unknown handshake version {}",
                mp.act, version[0]
            )));
        }
        for token in mp.tokens {
            match token {
                Token::E => {
                    let mut buf = [0u8; 33];
                    reader.read_exact(&mut buf)?;
                    let pk = PublicKey::from_sec1_bytes(&buf)
                        .map_err(|e| NoiseError::Crypto(format!("act {}: {e}", mp.act)))?;
                    self.symmetric.mix_hash(&buf);
                    self.remote_ephemeral = Some(pk);
                }
                Token::S => {
                    let mut buf = [0u8; 33 + MAC_SIZE];
                    reader.read_exact(&mut buf)?;
                    let plaintext = self.symmetric.decrypt_and_hash(&buf)?;
                    let pk = PublicKey::from_sec1_bytes(&plaintext)
                        .map_err(|e| NoiseError::Crypto(format!("act {}: {e}", mp.act)))?;
                    self.remote_static = Some(pk);
                }
                dh => self.mix_dh(*dh)?,
            }
        }
        let mut tag = [0u8; MAC_SIZE];
        reader.read_exact(&mut tag)?;
        self.symmetric.decrypt_and_hash(&tag)?;
        trace!(target: "cln_rs::noise", act = mp.act, "read handshake act");
        Ok(())
    }

    // Both sides compute the same secret for a DH token; only the key roles swap.
    fn mix_dh(&mut self, token: Token) -> Result<(), NoiseError> {
        let secret = match (token, self.initiator) {
            (Token::Ee, _) => ecdh(self.local_eph()?, self.remote_eph()?)?,
            (Token::Es, true) => ecdh(self.local_eph()?, self.remote()?)?,
            (Token::Es, false) => ecdh(self.local_static.as_ref(), self.remote_eph()?)?,
            (Token::Se, true) => ecdh(self.local_static.as_ref(), self.remote_eph()?)?,
            (Token::Se, false) => ecdh(self.local_eph()?, self.remote()?)?,
            (other, _) => {
                return Err(NoiseError::InvalidState(format!(
                    "{other:?} is not a DH token"
                )))
            }
        };
        self.symmetric.mix_key(&secret)
    }
}

/// Sending half of an established session.
pub struct MessageSealer {
    cipher: CipherState,
}

impl MessageSealer {
    /// Encrypt `payload` into `len || MAC || body || MAC`.
    ///
    /// # Errors
    /// Returns `NoiseError::InvalidState` when the payload exceeds [`MAX_MESSAGE_SIZE`].
    pub fn seal(&mut self, payload: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let len = u16::try_from(payload.len())
            .map_err(|_| NoiseError::InvalidState("payload exceeds max length".into()))?;
        let mut out = self.cipher.encrypt(&[], &len.to_be_bytes())?;
        out.extend_from_slice(&self.cipher.encrypt(&[], payload)?);
        Ok(out)
    }
}

/// Receiving half of an established session.
pub struct MessageOpener {
    cipher: CipherState,
}

impl MessageOpener {
    /// Decrypt a length header and return how many body bytes (MAC included) follow.
    ///
    /// # Errors
    /// Returns `NoiseError::Crypto` when the header MAC does not verify.
    pub fn open_header(&mut self, header: &[u8; ENC_HEADER_SIZE]) -> Result<usize, NoiseError> {
        let len = self.cipher.decrypt(&[], header)?;
        let len: [u8; LENGTH_HEADER_SIZE] = len
            .as_slice()
            .try_into()
            .map_err(|_| NoiseError::InvalidState("invalid length header".into()))?;
        Ok(usize::from(u16::from_be_bytes(len)) + MAC_SIZE)
    }

    /// Decrypt a message body announced by [`Self::open_header`].
    ///
    /// # Errors
    /// Returns `NoiseError::Crypto` when the body MAC does not verify.
    pub fn open_body(&mut self, body: &[u8]) -> Result<Vec<u8>, NoiseError> {
        self.cipher.decrypt(&[], body)
    }

    /// Read header and body from a blocking reader.
    ///
    /// # Errors
    /// Propagates IO and authentication failures.
    pub fn read_message<R: Read>(&mut self, reader: &mut R) -> Result<Vec<u8>, NoiseError> {
        let mut header = [0u8; ENC_HEADER_SIZE];
        reader.read_exact(&mut header)?;
        let body_len = self.open_header(&header)?;
        let mut body = vec![0u8; body_len];
        reader.read_exact(&mut body)?;
        self.open_body(&body)
    }
}

/// BOLT-8 handshake driver. After [`Self::do_handshake`] succeeds the machine can seal and
/// open transport messages, or be split into independent halves.
pub struct BrontideMachine {
    initiator: bool,
    handshake: Option<HandshakeState>,
    remote_static: Option<PublicKey>,
    sealer: Option<MessageSealer>,
    opener: Option<MessageOpener>,
}

impl BrontideMachine {
    /// Construct a machine and mix the pre-message keys into the transcript.
    ///
    /// # Errors
    /// Returns [`NoiseError::InvalidState`] when an initiator has no remote static key.
    pub fn new(cfg: BrontideMachineConfig) -> Result<Self, NoiseError> {
        let initiator = cfg.initiator;
        let remote_static = cfg.remote_static;
        let handshake = Some(HandshakeState::new(cfg)?);
        Ok(Self {
            initiator,
            handshake,
            remote_static,
            sealer: None,
            opener: None,
        })
    }

    /// Run all three acts over `rw`.
    ///
    /// # Errors
    /// Returns [`NoiseError::Io`] when the stream fails and [`NoiseError::Crypto`] when the peer
    /// does not hold the expected key.
    pub fn do_handshake<RW: Read + Write>(&mut self, rw: &mut RW) -> Result<(), NoiseError> {
        let mut handshake = self
            .handshake
            .take()
            .ok_or_else(|| NoiseError::InvalidState("handshake already completed".into()))?;
        for mp in handshake.pattern.pattern {
            if mp.initiator == handshake.initiator {
                let act = handshake.write_act(mp)?;
                rw.write_all(&act)?;
                rw.flush()?;
            } else {
                handshake.read_act(rw, mp)?;
            }
        }
        self.complete_handshake(&handshake)
    }

    fn complete_handshake(&mut self, handshake: &HandshakeState) -> Result<(), NoiseError> {
        let salt = handshake.symmetric.chaining_key;
        let (first_key, second_key) = handshake.symmetric.split()?;
        let (send_key, recv_key) = if self.initiator {
            (first_key, second_key)
        } else {
            (second_key, first_key)
        };
        let mut send = CipherState::new();
        send.initialize_key_with_salt(salt, send_key);
        let mut recv = CipherState::new();
        recv.initialize_key_with_salt(salt, recv_key);
        self.sealer = Some(MessageSealer { cipher: send });
        self.opener = Some(MessageOpener { cipher: recv });
        self.remote_static = handshake.remote_static;
        debug!(
            target: "cln_rs::noise",
            initiator = self.initiator,
            "handshake complete"
        );
        Ok(())
    }

    /// Peer node key: configured on the initiator, learned in act three on the responder.
    #[must_use]
    pub fn remote_static(&self) -> Option<&PublicKey> {
        self.remote_static.as_ref()
    }

    /// Seal `payload` and write it to `writer`.
    ///
    /// # Errors
    /// Returns a [`NoiseError`] when the handshake is incomplete, the payload is too large or
    /// the write fails.
    pub fn write_message<W: Write>(
        &mut self,
        writer: &mut W,
        payload: &[u8],
    ) -> Result<(), NoiseError> {
        let sealer = self
            .sealer
            .as_mut()
            .ok_or_else(|| NoiseError::InvalidState("handshake not complete".into()))?;
        let frame = sealer.seal(payload)?;
        writer.write_all(&frame)?;
        writer.flush()?;
        Ok(())
    }

    /// Read and open one transport message.
    ///
    /// # Errors
    /// Returns a [`NoiseError`] when the handshake is incomplete or the message is corrupt.
    pub fn read_message<R: Read>(&mut self, reader: &mut R) -> Result<Vec<u8>, NoiseError> {
        self.opener
            .as_mut()
            .ok_or_else(|| NoiseError::InvalidState("handshake not complete".into()))?
            .read_message(reader)
    }

    /// Split into sending and receiving halves so they can live on different tasks.
    ///
    /// # Errors
    /// Returns [`NoiseError::InvalidState`] if the handshake has not completed.
    pub fn into_split(self) -> Result<(MessageSealer, MessageOpener), NoiseError> {
        match (self.sealer, self.opener) {
            (Some(sealer), Some(opener)) => Ok((sealer, opener)),
            _ => Err(NoiseError::InvalidState("handshake not complete".into())),
        }
    }
}
