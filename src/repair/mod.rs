//! Conversation repair: tool-id pairing, thinking-block discipline and the
//! destructive crash-and-restart rewrite.
//!
//! Hosts abort turns, strip thinking blocks and lose tool-call ids; the
//! upstream rejects conversations in any of those states. These passes
//! rewrite the conversation into something it will accept, preferring the
//! least destructive repair that applies.

mod restart;
mod signatures;
mod tool_pairing;

pub use restart::{RestartOutcome, TurnAnalysis, analyze_turn, apply_restart};
pub use signatures::{backfill_signatures, strip_unsigned_thinking};
pub use tool_pairing::{PLACEHOLDER_RESULT, pair_claude_tool_ids, pair_gemini_tool_ids};
