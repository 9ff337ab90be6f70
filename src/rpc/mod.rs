//! Command model and request/response correlation for commando RPC.

pub mod correlator;
pub mod envelope;

pub use correlator::{Correlator, PendingReply};
pub use envelope::{parse_response, CommandRequest, CommandResult, ReplyAssembler};
