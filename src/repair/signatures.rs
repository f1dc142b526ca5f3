use crate::sigcache::SignatureCacheService;
use castor_schema::{MessageBlock, Part, RequestPayload};
use castor_sigcache_core::MIN_SIGNATURE_LEN;
use tracing::debug;

/// Restore signatures the host stripped from thinking blocks, then make the
/// tool-use discipline hold: an assistant turn that calls tools must open
/// with a signed thought.
///
/// Unsigned thinking that cannot be restored is removed afterwards by
/// [`strip_unsigned_thinking`]; the upstream rejects it outright.
pub fn backfill_signatures(
    payload: &mut RequestPayload,
    cache: &SignatureCacheService,
    session_key: &str,
) {
    let last = cache.last_thinking(session_key);

    if let Some(contents) = payload.contents.as_mut() {
        for content in contents.iter_mut().filter(|c| c.is_model_role()) {
            for part in &mut content.parts {
                if part.is_thought()
                    && part.thought_signature.is_none()
                    && let Some(text) = part.text.clone()
                    && let Some(signature) = cache.lookup(session_key, &text)
                {
                    part.thought_signature = Some(signature);
                }
            }

            let first_call = content.parts.iter().position(|p| p.function_call.is_some());
            if let Some(call_idx) = first_call {
                let has_signed_thought = content.parts[..call_idx]
                    .iter()
                    .any(|p| p.is_thought() && signature_ok(p.thought_signature.as_deref()));
                if !has_signed_thought && let Some(last) = &last {
                    debug!("fronting tool-use turn with cached last thinking");
                    content
                        .parts
                        .insert(0, Part::signed_thought(&last.text, &last.signature));
                }
            }
        }
    }

    if let Some(messages) = payload.messages.as_mut() {
        for message in messages.iter_mut().filter(|m| m.role == "assistant") {
            if message.blocks().is_empty() {
                // Bare-string content; nothing to sign.
                continue;
            }
            let blocks = message.blocks_mut();
            for block in blocks.iter_mut() {
                if block.is_thinking()
                    && block.signature.is_none()
                    && let Some(text) = block.thinking.clone()
                    && let Some(signature) = cache.lookup(session_key, &text)
                {
                    block.signature = Some(signature);
                }
            }

            let first_use = blocks.iter().position(MessageBlock::is_tool_use);
            if let Some(use_idx) = first_use {
                let has_signed_thought = blocks[..use_idx]
                    .iter()
                    .any(|b| b.is_thinking() && signature_ok(b.signature.as_deref()));
                if !has_signed_thought && let Some(last) = &last {
                    blocks.insert(0, MessageBlock::thinking(&last.text, &last.signature));
                }
            }
        }
    }
}

/// Remove thinking blocks that still lack a usable signature. The upstream
/// treats them as protocol violations, not as content.
pub fn strip_unsigned_thinking(payload: &mut RequestPayload) {
    let mut stripped = 0usize;

    if let Some(contents) = payload.contents.as_mut() {
        for content in contents.iter_mut() {
            let before = content.parts.len();
            content
                .parts
                .retain(|p| !p.is_thought() || signature_ok(p.thought_signature.as_deref()));
            stripped += before - content.parts.len();
        }
    }

    if let Some(messages) = payload.messages.as_mut() {
        for message in messages.iter_mut() {
            if message.blocks().is_empty() {
                continue;
            }
            let blocks = message.blocks_mut();
            let before = blocks.len();
            blocks.retain(|b| !b.is_thinking() || signature_ok(b.signature.as_deref()));
            stripped += before - blocks.len();
        }
    }

    if stripped > 0 {
        debug!(stripped, "removed unsigned thinking blocks");
    }
}

fn signature_ok(signature: Option<&str>) -> bool {
    signature.is_some_and(|s| s.len() >= MIN_SIGNATURE_LEN)
}
