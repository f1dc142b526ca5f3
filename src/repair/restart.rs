use castor_schema::{Content, Message, RequestPayload};
use castor_sigcache_core::MIN_SIGNATURE_LEN;
use tracing::info;

/// Assistant text used to close the abandoned turn.
const RESTART_ACK_TEXT: &str = "Acknowledged the tool results above; continuing in a new turn.";

/// What the conversation looks like around its newest turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnAnalysis {
    /// The conversation's last message is a tool result: the model is being
    /// asked to continue a tool loop.
    pub in_tool_loop: bool,
    /// Index of the first assistant message after the last real user
    /// message.
    pub turn_start_idx: Option<usize>,
    /// Whether that assistant message opens with a signed thought.
    pub turn_has_thinking: bool,
}

impl TurnAnalysis {
    /// The state the upstream rejects: resuming a tool loop whose thinking
    /// evaporated.
    pub fn needs_thinking_recovery(&self) -> bool {
        self.in_tool_loop && !self.turn_has_thinking
    }
}

pub fn analyze_turn(payload: &RequestPayload) -> TurnAnalysis {
    if let Some(contents) = payload.contents.as_ref() {
        return analyze_gemini(contents);
    }
    if let Some(messages) = payload.messages.as_ref() {
        return analyze_claude(messages);
    }
    TurnAnalysis {
        in_tool_loop: false,
        turn_start_idx: None,
        turn_has_thinking: false,
    }
}

fn analyze_gemini(contents: &[Content]) -> TurnAnalysis {
    let in_tool_loop = contents
        .last()
        .and_then(|c| c.parts.last())
        .is_some_and(|p| p.function_response.is_some());

    // The last user message that actually says something, as opposed to the
    // synthetic tool-result turns in between.
    let last_real_user = contents
        .iter()
        .rposition(|c| c.role.as_deref() == Some("user") && c.first_text().is_some());

    let turn_start_idx = contents
        .iter()
        .enumerate()
        .skip(last_real_user.map_or(0, |i| i + 1))
        .find(|(_, c)| c.is_model_role())
        .map(|(i, _)| i);

    let turn_has_thinking = turn_start_idx.is_some_and(|i| {
        contents[i]
            .parts
            .iter()
            .any(|p| p.is_thought() && signed(p.thought_signature.as_deref()))
    });

    TurnAnalysis {
        in_tool_loop,
        turn_start_idx,
        turn_has_thinking,
    }
}

fn analyze_claude(messages: &[Message]) -> TurnAnalysis {
    let in_tool_loop = messages.last().is_some_and(|m| {
        m.role == "user" && m.blocks().iter().any(|b| b.is_tool_result())
    });

    let last_real_user = messages
        .iter()
        .rposition(|m| m.role == "user" && m.first_text().is_some());

    let turn_start_idx = messages
        .iter()
        .enumerate()
        .skip(last_real_user.map_or(0, |i| i + 1))
        .find(|(_, m)| m.role == "assistant")
        .map(|(i, _)| i);

    let turn_has_thinking = turn_start_idx.is_some_and(|i| {
        messages[i]
            .blocks()
            .iter()
            .any(|b| b.is_thinking() && signed(b.signature.as_deref()))
    });

    TurnAnalysis {
        in_tool_loop,
        turn_start_idx,
        turn_has_thinking,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartOutcome {
    NotNeeded,
    Restarted,
}

/// Let it crash and restart: drop every thinking block, close the broken
/// turn with a synthetic assistant message and open a fresh one with the
/// continuation prompt. Destructive by design; used only when no gentler
/// repair applies.
pub fn apply_restart(payload: &mut RequestPayload, resume_text: &str) -> RestartOutcome {
    info!("thinking recovery: restarting conversation turn");

    if let Some(contents) = payload.contents.as_mut() {
        for content in contents.iter_mut() {
            content.parts.retain(|p| !p.is_thought());
        }
        contents.push(Content::with_role("model", RESTART_ACK_TEXT));
        contents.push(Content::with_role("user", resume_text));
        return RestartOutcome::Restarted;
    }

    if let Some(messages) = payload.messages.as_mut() {
        for message in messages.iter_mut() {
            if message.blocks().is_empty() {
                continue;
            }
            message.blocks_mut().retain(|b| !b.is_thinking());
        }
        messages.push(Message::from_text("assistant", RESTART_ACK_TEXT));
        messages.push(Message::from_text("user", resume_text));
        return RestartOutcome::Restarted;
    }

    RestartOutcome::NotNeeded
}

fn signed(signature: Option<&str>) -> bool {
    signature.is_some_and(|s| s.len() >= MIN_SIGNATURE_LEN)
}
