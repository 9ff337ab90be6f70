//! Lightning wire messages carried inside the BOLT-8 session: the BOLT-1 control set plus the
//! commando request/reply extension.

use bytes::{Buf, BufMut, Bytes, BytesMut};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    #[error("message too short for type {0}")]
    TooShort(u16),
    #[error("unknown even message type {0}")]
    UnknownEvenType(u16),
}

pub const WARNING: u16 = 1;
pub const INIT: u16 = 16;
pub const ERROR: u16 = 17;
pub const PING: u16 = 18;
pub const PONG: u16 = 19;
pub const COMMANDO_CMD: u16 = 0x4c4f;
pub const COMMANDO_REPLY_CONTINUES: u16 = 0x594b;
pub const COMMANDO_REPLY_TERM: u16 = 0x594d;

// BOLT-1: a ping asking for this many pong bytes or more must not be answered.
const MAX_PONG_BYTES: u16 = 65532;

/// A decoded Lightning message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Init {
        global_features: Bytes,
        features: Bytes,
    },
    Warning {
        channel_id: [u8; 32],
        data: Bytes,
    },
    Error {
        channel_id: [u8; 32],
        data: Bytes,
    },
    Ping {
        num_pong_bytes: u16,
        ignored_len: u16,
    },
    Pong {
        ignored_len: u16,
    },
    CommandoCmd {
        req_id: u64,
        json: Bytes,
    },
    CommandoReply {
        req_id: u64,
        terminal: bool,
        chunk: Bytes,
    },
    /// An odd message type this client does not understand. Safe to ignore.
    Unknown {
        msg_type: u16,
    },
}

impl Message {
    #[must_use]
    pub fn msg_type(&self) -> u16 {
        match self {
            Message::Init { .. } => INIT,
            Message::Warning { .. } => WARNING,
            Message::Error { .. } => ERROR,
            Message::Ping { .. } => PING,
            Message::Pong { .. } => PONG,
            Message::CommandoCmd { .. } => COMMANDO_CMD,
            Message::CommandoReply { terminal: false, .. } => COMMANDO_REPLY_CONTINUES,
            Message::CommandoReply { terminal: true, .. } => COMMANDO_REPLY_TERM,
            Message::Unknown { msg_type } => *msg_type,
        }
    }

    /// Encode into `type || payload`.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = BytesMut::new();
        out.put_u16(self.msg_type());
        match self {
            Message::Init {
                global_features,
                features,
            } => {
                put_u16_prefixed(&mut out, global_features);
                put_u16_prefixed(&mut out, features);
            }
            Message::Warning { channel_id, data } | Message::Error { channel_id, data } => {
                out.put_slice(channel_id);
                put_u16_prefixed(&mut out, data);
            }
            Message::Ping {
                num_pong_bytes,
                ignored_len,
            } => {
                out.put_u16(*num_pong_bytes);
                out.put_u16(*ignored_len);
                out.put_bytes(0, usize::from(*ignored_len));
            }
            Message::Pong { ignored_len } => {
                out.put_u16(*ignored_len);
                out.put_bytes(0, usize::from(*ignored_len));
            }
            Message::CommandoCmd { req_id, json } => {
                out.put_u64(*req_id);
                out.put_slice(json);
            }
            Message::CommandoReply { req_id, chunk, .. } => {
                out.put_u64(*req_id);
                out.put_slice(chunk);
            }
            Message::Unknown { .. } => {}
        }
        out.to_vec()
    }

    /// Decode one message. Trailing bytes (for example `init` TLVs) are ignored.
    ///
    /// # Errors
    /// Returns [`WireError::TooShort`] for truncated messages and
    /// [`WireError::UnknownEvenType`] for even types this client cannot process.
    pub fn decode(raw: &[u8]) -> Result<Message, WireError> {
        let mut buf = raw;
        if buf.remaining() < 2 {
            return Err(WireError::TooShort(0));
        }
        let msg_type = buf.get_u16();
        let short = || WireError::TooShort(msg_type);
        match msg_type {
            INIT => {
                let global_features = take_u16_prefixed(&mut buf).ok_or_else(short)?;
                let features = take_u16_prefixed(&mut buf).ok_or_else(short)?;
                Ok(Message::Init {
                    global_features,
                    features,
                })
            }
            WARNING | ERROR => {
                if buf.remaining() < 32 {
                    return Err(short());
                }
                let mut channel_id = [0u8; 32];
                buf.copy_to_slice(&mut channel_id);
                let data = take_u16_prefixed(&mut buf).ok_or_else(short)?;
                Ok(if msg_type == ERROR {
                    Message::Error { channel_id, data }
                } else {
                    Message::Warning { channel_id, data }
                })
            }
            PING => {
                if buf.remaining() < 4 {
                    return Err(short());
                }
                let num_pong_bytes = buf.get_u16();
                let ignored_len = buf.get_u16();
                Ok(Message::Ping {
                    num_pong_bytes,
                    ignored_len,
                })
            }
            PONG => {
                if buf.remaining() < 2 {
                    return Err(short());
                }
                Ok(Message::Pong {
                    ignored_len: buf.get_u16(),
                })
            }
            COMMANDO_CMD => {
                if buf.remaining() < 8 {
                    return Err(short());
                }
                let req_id = buf.get_u64();
                Ok(Message::CommandoCmd {
                    req_id,
                    json: Bytes::copy_from_slice(buf),
                })
            }
            COMMANDO_REPLY_CONTINUES | COMMANDO_REPLY_TERM => {
                if buf.remaining() < 8 {
                    return Err(short());
                }
                let req_id = buf.get_u64();
                Ok(Message::CommandoReply {
                    req_id,
                    terminal: msg_type == COMMANDO_REPLY_TERM,
                    chunk: Bytes::copy_from_slice(buf),
                })
            }
            other if other % 2 == 1 => Ok(Message::Unknown { msg_type: other }),
            other => Err(WireError::UnknownEvenType(other)),
        }
    }

    /// The `pong` owed for this message, if it is a ping that must be answered.
    #[must_use]
    pub fn pong_reply(&self) -> Option<Message> {
        match self {
            Message::Ping { num_pong_bytes, .. } if *num_pong_bytes < MAX_PONG_BYTES => {
                Some(Message::Pong {
                    ignored_len: *num_pong_bytes,
                })
            }
            _ => None,
        }
    }

    /// Human-readable text of a `warning` or `error`.
    #[must_use]
    pub fn text(&self) -> Option<String> {
        match self {
            Message::Warning { data, .. } | Message::Error { data, .. } => {
                Some(String::from_utf8_lossy(data).into_owned())
            }
            _ => None,
        }
    }
}

fn put_u16_prefixed(out: &mut BytesMut, data: &[u8]) {
    let len = u16::try_from(data.len()).unwrap_or(u16::MAX);
    out.put_u16(len);
    out.put_slice(&data[..usize::from(len)]);
}

fn take_u16_prefixed(buf: &mut &[u8]) -> Option<Bytes> {
    if buf.remaining() < 2 {
        return None;
    }
    let len = usize::from(buf.get_u16());
    if buf.remaining() < len {
        return None;
    }
    let data = Bytes::copy_from_slice(&buf[..len]);
    buf.advance(len);
    Some(data)
}
