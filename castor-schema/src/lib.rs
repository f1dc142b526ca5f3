//! Wire schemas shared by the castor broker.
//!
//! Request bodies arriving from the host are open-typed JSON; these structs
//! model the fields the broker actually reads or rewrites and preserve
//! everything else through `extra` catch-all maps, so a round-trip through
//! the broker never loses fields it does not understand.

pub mod claude;
pub mod envelope;
pub mod gemini;

pub use claude::{Message, MessageBlock, MessageContent};
pub use envelope::CodeAssistEnvelope;
pub use gemini::{
    Candidate, Content, GenerationConfig, Part, RequestPayload, ResponseBody, UsageMetadata,
};
