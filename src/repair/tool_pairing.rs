use castor_schema::{Content, Message, MessageBlock, Part};
use serde_json::json;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::debug;

/// Body of a synthesized response for a call the host never answered.
pub const PLACEHOLDER_RESULT: &str = "Operation cancelled or missing";

const SYNTHETIC_ID_PREFIX: &str = "tool-call-";

/// Pair `functionCall` / `functionResponse` ids on a Gemini-wire
/// conversation.
///
/// Two deterministic passes first (synthesize missing call ids, hand ids to
/// responses FIFO per function name), then the orphan-recovery passes when
/// enabled: exact id, same name, any remaining, and finally placeholder
/// responses for calls nothing answered.
pub fn pair_gemini_tool_ids(contents: &mut Vec<Content>, recovery_enabled: bool) {
    // Pass 1: every call gets an id; remember them FIFO per function name.
    let mut queues: HashMap<String, VecDeque<String>> = HashMap::new();
    let mut next_synthetic = 0usize;
    for content in contents.iter_mut() {
        for part in &mut content.parts {
            if part.function_call.is_none() {
                continue;
            }
            let id = match part.function_id() {
                Some(id) => id.to_string(),
                None => {
                    let id = format!("{SYNTHETIC_ID_PREFIX}{next_synthetic}");
                    next_synthetic += 1;
                    part.set_function_id(&id);
                    id
                }
            };
            let name = part.function_name().unwrap_or_default().to_string();
            queues.entry(name).or_default().push_back(id);
        }
    }

    // Pass 2: responses without an id take the oldest id recorded for their
    // function name.
    for content in contents.iter_mut() {
        for part in &mut content.parts {
            if part.function_response.is_none() || part.function_id().is_some() {
                continue;
            }
            let name = part.function_name().unwrap_or_default().to_string();
            if let Some(id) = queues.get_mut(&name).and_then(VecDeque::pop_front) {
                part.set_function_id(&id);
            }
        }
    }

    if recovery_enabled {
        recover_gemini_orphans(contents);
    }
}

/// Orphan passes A-D over an id-assigned conversation.
fn recover_gemini_orphans(contents: &mut Vec<Content>) {
    let calls: Vec<(String, String)> = contents
        .iter()
        .flat_map(|c| &c.parts)
        .filter(|p| p.function_call.is_some())
        .map(|p| {
            (
                p.function_id().unwrap_or_default().to_string(),
                p.function_name().unwrap_or_default().to_string(),
            )
        })
        .collect();

    // Pass A: exact id matches consume their call.
    let mut unmatched_calls: Vec<(String, String)> = calls.clone();
    for content in contents.iter() {
        for part in &content.parts {
            if part.function_response.is_some()
                && let Some(id) = part.function_id()
                && let Some(pos) = unmatched_calls.iter().position(|(cid, _)| cid == id)
            {
                unmatched_calls.remove(pos);
            }
        }
    }

    // Passes B and C: re-point drifted responses at surviving calls, by
    // function name first, then by position.
    for content in contents.iter_mut() {
        for part in &mut content.parts {
            if part.function_response.is_none() {
                continue;
            }
            let id = part.function_id().unwrap_or_default().to_string();
            let is_orphan = id.is_empty() || !calls.iter().any(|(cid, _)| *cid == id);
            if !is_orphan || unmatched_calls.is_empty() {
                continue;
            }

            let name = part.function_name().unwrap_or_default().to_string();
            let pos = unmatched_calls
                .iter()
                .position(|(_, cname)| *cname == name)
                .unwrap_or(0);
            let (call_id, _) = unmatched_calls.remove(pos);
            debug!(response_id = %id, call_id = %call_id, "re-pointed orphan tool response");
            part.set_function_id(&call_id);
        }
    }

    // Pass D: placeholder responses for calls nothing answered, so the
    // conversation still parses upstream.
    if !unmatched_calls.is_empty() {
        let parts: Vec<Part> = unmatched_calls
            .iter()
            .map(|(id, name)| Part {
                function_response: Some(json!({
                    "name": name,
                    "id": id,
                    "response": {"result": PLACEHOLDER_RESULT},
                })),
                ..Part::default()
            })
            .collect();
        debug!(count = parts.len(), "synthesized placeholder tool responses");
        contents.push(Content {
            role: Some("user".to_string()),
            parts,
            ..Content::default()
        });
    }
}

/// Analogous pairing for the Claude messages format, plus the nuclear pass
/// when the conversation still violates tool invariants afterwards.
pub fn pair_claude_tool_ids(messages: &mut Vec<Message>, recovery_enabled: bool) {
    // Pass 1: ids for every tool_use, remembered in conversation order.
    let mut pending_ids: VecDeque<String> = VecDeque::new();
    let mut next_synthetic = 0usize;
    for message in messages.iter_mut() {
        if message.role != "assistant" || message.blocks().is_empty() {
            continue;
        }
        for block in message.blocks_mut() {
            if !block.is_tool_use() {
                continue;
            }
            let id = block.id.clone().unwrap_or_else(|| {
                let id = format!("{SYNTHETIC_ID_PREFIX}{next_synthetic}");
                next_synthetic += 1;
                block.id = Some(id.clone());
                id
            });
            pending_ids.push_back(id);
        }
    }

    // Pass 2: results without a reference take ids FIFO.
    for message in messages.iter_mut() {
        if message.role != "user" || message.blocks().is_empty() {
            continue;
        }
        for block in message.blocks_mut() {
            if block.is_tool_result() && block.tool_use_id.is_none() {
                block.tool_use_id = pending_ids.pop_front();
            }
        }
    }

    if recovery_enabled {
        recover_claude_orphans(messages);
    }

    if !claude_invariants_hold(messages) {
        nuclear_drop_orphans(messages);
    }
}

fn recover_claude_orphans(messages: &mut Vec<Message>) {
    let use_ids: Vec<String> = tool_use_ids(messages);
    let result_ids: HashSet<String> = tool_result_ids(messages);

    let mut unanswered: VecDeque<String> = use_ids
        .iter()
        .filter(|id| !result_ids.contains(*id))
        .cloned()
        .collect();

    // Re-point results that reference nothing at unanswered calls.
    let known: HashSet<String> = use_ids.iter().cloned().collect();
    for message in messages.iter_mut() {
        if message.role != "user" || message.blocks().is_empty() {
            continue;
        }
        for block in message.blocks_mut() {
            if !block.is_tool_result() {
                continue;
            }
            let dangling = block
                .tool_use_id
                .as_ref()
                .is_none_or(|id| !known.contains(id));
            if dangling && let Some(id) = unanswered.pop_front() {
                block.tool_use_id = Some(id);
            }
        }
    }

    // Synthesize results for what remains, directly after each call's
    // message so ordering invariants hold.
    let remaining: HashSet<String> = unanswered.into_iter().collect();
    if remaining.is_empty() {
        return;
    }

    let mut index = 0;
    while index < messages.len() {
        let ids_here: Vec<String> = if messages[index].role == "assistant" {
            messages[index]
                .blocks()
                .iter()
                .filter(|b| b.is_tool_use())
                .filter_map(|b| b.id.clone())
                .filter(|id| remaining.contains(id))
                .collect()
        } else {
            Vec::new()
        };

        if !ids_here.is_empty() {
            let blocks: Vec<MessageBlock> = ids_here
                .iter()
                .map(|id| {
                    MessageBlock::tool_result(
                        id.clone(),
                        json!([{"type": "text", "text": PLACEHOLDER_RESULT}]),
                    )
                })
                .collect();

            let next_is_user = messages
                .get(index + 1)
                .is_some_and(|m| m.role == "user");
            if next_is_user {
                let existing = messages[index + 1].blocks_mut();
                for (offset, block) in blocks.into_iter().enumerate() {
                    existing.insert(offset, block);
                }
            } else {
                messages.insert(index + 1, Message::from_blocks("user", blocks));
            }
        }
        index += 1;
    }
}

fn claude_invariants_hold(messages: &[Message]) -> bool {
    let use_ids: HashSet<String> = tool_use_ids(messages).into_iter().collect();
    let result_ids: HashSet<String> = tool_result_ids(messages);

    use_ids.iter().all(|id| result_ids.contains(id))
        && result_ids.iter().all(|id| use_ids.contains(id))
        && messages.iter().all(|m| {
            m.blocks()
                .iter()
                .all(|b| !b.is_tool_result() || b.tool_use_id.is_some())
        })
}

/// Last resort: drop every tool block that still lacks its counterpart.
fn nuclear_drop_orphans(messages: &mut Vec<Message>) {
    let use_ids: HashSet<String> = tool_use_ids(messages).into_iter().collect();
    let result_ids: HashSet<String> = tool_result_ids(messages);

    debug!("tool pairing failed basic invariants; dropping orphan tool blocks");
    for message in messages.iter_mut() {
        if message.blocks().is_empty() {
            continue;
        }
        message.blocks_mut().retain(|block| {
            if block.is_tool_use() {
                return block
                    .id
                    .as_ref()
                    .is_some_and(|id| result_ids.contains(id));
            }
            if block.is_tool_result() {
                return block
                    .tool_use_id
                    .as_ref()
                    .is_some_and(|id| use_ids.contains(id));
            }
            true
        });
    }
    messages.retain(|m| !m.blocks().is_empty() || m.first_text().is_some());
}

fn tool_use_ids(messages: &[Message]) -> Vec<String> {
    messages
        .iter()
        .filter(|m| m.role == "assistant")
        .flat_map(|m| m.blocks())
        .filter(|b| b.is_tool_use())
        .filter_map(|b| b.id.clone())
        .collect()
}

fn tool_result_ids(messages: &[Message]) -> HashSet<String> {
    messages
        .iter()
        .filter(|m| m.role == "user")
        .flat_map(|m| m.blocks())
        .filter(|b| b.is_tool_result())
        .filter_map(|b| b.tool_use_id.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    fn contents(value: Value) -> Vec<Content> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn fifo_hands_first_id_and_synthesizes_the_rest() {
        // Two calls with ids, one response without: the response takes "a"
        // FIFO and "b" gets a placeholder.
        let mut convo = contents(json!([
            {"role": "model", "parts": [{"functionCall": {"name": "read_file", "args": {}, "id": "a"}}]},
            {"role": "model", "parts": [{"functionCall": {"name": "read_file", "args": {}, "id": "b"}}]},
            {"role": "user", "parts": [{"functionResponse": {"name": "read_file", "response": {}}}]}
        ]));

        pair_gemini_tool_ids(&mut convo, true);

        assert_eq!(convo[2].parts[0].function_id(), Some("a"));
        let appended = convo.last().unwrap();
        assert_eq!(appended.role.as_deref(), Some("user"));
        let placeholder = appended.parts[0].function_response.as_ref().unwrap();
        assert_eq!(placeholder.get("id"), Some(&json!("b")));
        assert_eq!(
            placeholder.pointer("/response/result"),
            Some(&json!(PLACEHOLDER_RESULT))
        );
    }

    #[test]
    fn missing_call_ids_are_synthesized_in_order() {
        let mut convo = contents(json!([
            {"role": "model", "parts": [
                {"functionCall": {"name": "ls", "args": {}}},
                {"functionCall": {"name": "cat", "args": {}}}
            ]},
            {"role": "user", "parts": [
                {"functionResponse": {"name": "ls", "response": {}}},
                {"functionResponse": {"name": "cat", "response": {}}}
            ]}
        ]));

        pair_gemini_tool_ids(&mut convo, true);

        assert_eq!(convo[0].parts[0].function_id(), Some("tool-call-0"));
        assert_eq!(convo[0].parts[1].function_id(), Some("tool-call-1"));
        assert_eq!(convo[1].parts[0].function_id(), Some("tool-call-0"));
        assert_eq!(convo[1].parts[1].function_id(), Some("tool-call-1"));
        assert_eq!(convo.len(), 2);
    }

    #[test]
    fn drifted_response_id_recovers_by_name() {
        let mut convo = contents(json!([
            {"role": "model", "parts": [{"functionCall": {"name": "grep", "args": {}, "id": "call-9"}}]},
            {"role": "user", "parts": [{"functionResponse": {"name": "grep", "response": {}, "id": "stale-id"}}]}
        ]));

        pair_gemini_tool_ids(&mut convo, true);
        assert_eq!(convo[1].parts[0].function_id(), Some("call-9"));
        assert_eq!(convo.len(), 2);
    }

    #[test]
    fn pairing_invariant_holds_for_arbitrary_mixes() {
        let mut convo = contents(json!([
            {"role": "model", "parts": [{"functionCall": {"name": "a", "args": {}}}]},
            {"role": "user", "parts": [{"functionResponse": {"name": "b", "response": {}, "id": "nonsense"}}]},
            {"role": "model", "parts": [{"functionCall": {"name": "b", "args": {}, "id": "kept"}}]}
        ]));

        pair_gemini_tool_ids(&mut convo, true);

        // Every response carries an id, every call is eventually answered.
        let call_ids: Vec<&str> = convo
            .iter()
            .flat_map(|c| &c.parts)
            .filter(|p| p.function_call.is_some())
            .filter_map(Part::function_id)
            .collect();
        let response_ids: Vec<&str> = convo
            .iter()
            .flat_map(|c| &c.parts)
            .filter(|p| p.function_response.is_some())
            .filter_map(Part::function_id)
            .collect();

        assert!(response_ids.iter().all(|id| !id.is_empty()));
        for id in call_ids {
            assert!(response_ids.contains(&id), "call {id} unanswered");
        }
    }

    fn messages(value: Value) -> Vec<Message> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn claude_results_take_ids_fifo() {
        let mut convo = messages(json!([
            {"role": "assistant", "content": [
                {"type": "tool_use", "name": "read_file", "input": {}}
            ]},
            {"role": "user", "content": [
                {"type": "tool_result", "content": "data"}
            ]}
        ]));

        pair_claude_tool_ids(&mut convo, true);

        assert_eq!(convo[0].blocks()[0].id.as_deref(), Some("tool-call-0"));
        assert_eq!(
            convo[1].blocks()[0].tool_use_id.as_deref(),
            Some("tool-call-0")
        );
    }

    #[test]
    fn claude_unanswered_call_gets_result_in_next_user_message() {
        let mut convo = messages(json!([
            {"role": "assistant", "content": [
                {"type": "tool_use", "id": "toolu_1", "name": "run", "input": {}}
            ]},
            {"role": "user", "content": [
                {"type": "text", "text": "unrelated"}
            ]}
        ]));

        pair_claude_tool_ids(&mut convo, true);

        let first_user_block = &convo[1].blocks()[0];
        assert!(first_user_block.is_tool_result());
        assert_eq!(first_user_block.tool_use_id.as_deref(), Some("toolu_1"));
    }

    #[test]
    fn claude_nuclear_drops_orphans_when_recovery_disabled() {
        let mut convo = messages(json!([
            {"role": "assistant", "content": [
                {"type": "text", "text": "working"},
                {"type": "tool_use", "id": "toolu_1", "name": "run", "input": {}}
            ]},
            {"role": "user", "content": [
                {"type": "tool_result", "tool_use_id": "toolu_other", "content": "stale"}
            ]}
        ]));

        pair_claude_tool_ids(&mut convo, false);

        assert!(convo[0].blocks().iter().all(|b| !b.is_tool_use()));
        assert!(convo.iter().all(|m| {
            m.blocks()
                .iter()
                .all(|b| !b.is_tool_result() && !b.is_tool_use())
        }));
    }
}
