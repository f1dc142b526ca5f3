//! Request shaping: the host's generative call becomes an upstream
//! project-wrapped request.

mod request;
mod thinking;
mod tools;

pub use request::{
    PrepareContext, PreparedRequest, RequestTransformer, build_warmup_envelope, parse_target,
};
pub use thinking::{ANTHROPIC_BETA_HEADER, INTERLEAVED_BETA_TAG, apply_thinking_config};
pub use tools::{harden_claude_tools, normalize_claude_tools, normalize_gemini_tools};
