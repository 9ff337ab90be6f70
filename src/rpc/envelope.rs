use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{error::LnError, transport::brontide::wire::Message};

/// Commando failure code for a rune that does not authorize the command.
pub const COMMANDO_RUNE_REJECTED: i64 = 0x4c51;

/// Replies larger than this are dropped as a protocol error.
pub const MAX_REPLY_SIZE: usize = 32 * 1024 * 1024;

/// One RPC command. `id` is assigned by the correlator when the call is registered.
#[derive(Clone, Debug, PartialEq)]
pub struct CommandRequest {
    pub method: String,
    pub params: Value,
    pub id: u64,
}

#[derive(Serialize)]
struct CommandoBody<'a> {
    method: &'a str,
    params: &'a Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    rune: Option<&'a str>,
    id: u64,
}

impl CommandRequest {
    /// # Errors
    /// Returns [`LnError::InvalidParams`] when the method is empty or `params` is neither an
    /// object nor an array.
    pub fn new(method: impl Into<String>, params: Value) -> Result<Self, LnError> {
        let method = method.into();
        if method.trim().is_empty() {
            return Err(LnError::InvalidParams("method is empty".into()));
        }
        let params = match params {
            Value::Null => Value::Object(serde_json::Map::new()),
            p @ (Value::Object(_) | Value::Array(_)) => p,
            other => {
                return Err(LnError::InvalidParams(format!(
                    "params must be an object or array, got {other}"
                )))
            }
        };
        Ok(Self {
            method,
            params,
            id: 0,
        })
    }

    /// Encode as a commando `cmd` message carrying `rune` when present.
    ///
    /// # Errors
    /// Returns [`LnError::Decode`] if the params cannot be serialized.
    pub fn to_frame(&self, rune: Option<&str>) -> Result<Vec<u8>, LnError> {
        let body = serde_json::to_vec(&CommandoBody {
            method: &self.method,
            params: &self.params,
            rune,
            id: self.id,
        })?;
        Ok(Message::CommandoCmd {
            req_id: self.id,
            json: Bytes::from(body),
        }
        .encode())
    }
}

/// Outcome of one command as reported by the node.
#[derive(Clone, Debug, PartialEq)]
pub enum CommandResult {
    Success(Value),
    Failure {
        code: i64,
        message: String,
        data: Option<Value>,
    },
}

impl CommandResult {
    /// Map a failure onto the error taxonomy: rune rejections become
    /// [`LnError::Authorization`], everything else [`LnError::Node`].
    ///
    /// # Errors
    /// Returns the mapped error for [`CommandResult::Failure`].
    pub fn into_value(self) -> Result<Value, LnError> {
        match self {
            CommandResult::Success(value) => Ok(value),
            CommandResult::Failure { code, message, .. }
                if code == COMMANDO_RUNE_REJECTED || message.starts_with("Not authorized") =>
            {
                Err(LnError::Authorization(message))
            }
            CommandResult::Failure { code, message, .. } => Err(LnError::Node { code, message }),
        }
    }
}

#[derive(Deserialize)]
struct RpcError {
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

/// Parse a complete JSON-RPC response body.
///
/// # Errors
/// Returns [`LnError::Protocol`] when the body is not JSON or has neither `result` nor
/// `error`.
pub fn parse_response(body: &[u8]) -> Result<CommandResult, LnError> {
    let parsed: RpcResponse = serde_json::from_slice(body)
        .map_err(|e| LnError::Protocol(format!("reply is not a JSON-RPC response: {e}")))?;
    match (parsed.error, parsed.result) {
        (Some(err), _) => Ok(CommandResult::Failure {
            code: err.code,
            message: err.message,
            data: err.data,
        }),
        (None, Some(result)) => Ok(CommandResult::Success(result)),
        (None, None) => Err(LnError::Protocol(
            "reply has neither result nor error".into(),
        )),
    }
}

/// Reassembles commando replies that the node splits into `reply_continues` chunks.
#[derive(Default)]
pub struct ReplyAssembler {
    partial: HashMap<u64, BytesMut>,
}

impl ReplyAssembler {
    /// Add a chunk. Returns the full body once the terminal chunk arrives, or an error if the
    /// reply grows past [`MAX_REPLY_SIZE`].
    pub fn push(
        &mut self,
        req_id: u64,
        terminal: bool,
        chunk: &[u8],
    ) -> Option<Result<Bytes, LnError>> {
        let buf = self.partial.entry(req_id).or_default();
        if buf.len() + chunk.len() > MAX_REPLY_SIZE {
            self.partial.remove(&req_id);
            return Some(Err(LnError::Protocol(format!(
                "reply exceeds {MAX_REPLY_SIZE} bytes"
            ))));
        }
        buf.extend_from_slice(chunk);
        if !terminal {
            return None;
        }
        self.partial
            .remove(&req_id)
            .map(|body| Ok(body.freeze()))
    }

    /// Forget the partial reply for `req_id`, if any.
    pub fn discard(&mut self, req_id: u64) -> bool {
        self.partial.remove(&req_id).is_some()
    }

    /// Drop everything buffered, e.g. when the session ends.
    pub fn clear(&mut self) {
        self.partial.clear();
    }

    #[must_use]
    pub fn in_progress(&self) -> usize {
        self.partial.len()
    }
}
