//! Gemini generate-content request and response shapes.

mod content;
mod request;
mod response;

pub use content::{Content, Part};
pub use request::{GenerationConfig, RequestPayload};
pub use response::{Candidate, ResponseBody, UsageMetadata};
