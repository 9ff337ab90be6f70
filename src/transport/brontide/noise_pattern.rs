//! Noise handshake pattern descriptor for BOLT-8 (`Noise_XK`).
//!
//! ```text
//! XK:
//!   <- s
//!   ...
//!   -> e, es
//!   <- e, ee
//!   -> s, se
//! ```

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Token {
    E,
    S,
    Ee,
    Es,
    Se,
}

#[derive(Clone, Copy, Debug)]
pub struct MessagePattern {
    pub tokens: &'static [Token],
    pub initiator: bool,
    pub act: u8,
}

impl MessagePattern {
    /// Serialized size of this act: version byte, one 33-byte point per `e`, a 49-byte sealed
    /// point per `s`, and the trailing 16-byte tag.
    #[must_use]
    pub fn wire_size(&self) -> usize {
        let keys: usize = self
            .tokens
            .iter()
            .map(|t| match t {
                Token::E => 33,
                Token::S => 33 + 16,
                _ => 0,
            })
            .sum();
        1 + keys + 16
    }
}

#[derive(Clone, Debug)]
pub struct HandshakePattern {
    pub name: &'static str,
    /// Pre-message tokens known out of band (the responder's static key for XK).
    pub pre_messages: &'static [MessagePattern],
    pub pattern: &'static [MessagePattern],
}

const PRE_RESPONDER_STATIC: MessagePattern = MessagePattern {
    tokens: &[Token::S],
    initiator: false,
    act: 0,
};
const ACT_ONE: MessagePattern = MessagePattern {
    tokens: &[Token::E, Token::Es],
    initiator: true,
    act: 1,
};
const ACT_TWO: MessagePattern = MessagePattern {
    tokens: &[Token::E, Token::Ee],
    initiator: false,
    act: 2,
};
const ACT_THREE: MessagePattern = MessagePattern {
    tokens: &[Token::S, Token::Se],
    initiator: true,
    act: 3,
};

#[must_use]
pub fn pattern_xk() -> HandshakePattern {
    HandshakePattern {
        name: "XK",
        pre_messages: &[PRE_RESPONDER_STATIC],
        pattern: &[ACT_ONE, ACT_TWO, ACT_THREE],
    }
}
