use crate::families::ModelFamily;
use crate::models::ResolvedModel;
use castor_schema::{GenerationConfig, RequestPayload};
use serde_json::{Value, json};

pub const ANTHROPIC_BETA_HEADER: &str = "anthropic-beta";
pub const INTERLEAVED_BETA_TAG: &str = "interleaved-thinking-2025-05-14";

/// Claude thinking output is truncated hard below this ceiling.
const CLAUDE_MIN_OUTPUT_TOKENS: u64 = 64_000;

/// Appended to the system instruction for Claude thinking models.
const INTERLEAVED_HINT: &str = "Interleaved thinking is enabled: you may think between tool \
calls and after tool results before producing the final response.";

/// Thinking knobs the host may have supplied, in any of its spellings.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct UserThinking {
    include_thoughts: Option<bool>,
    budget: Option<u64>,
    level_present: bool,
}

/// Shape the request's thinking configuration from the user-supplied config
/// and the resolver's tier output. Returns true when the interleaved
/// thinking beta header must be attached.
pub fn apply_thinking_config(
    payload: &mut RequestPayload,
    resolved: &ResolvedModel,
    family: ModelFamily,
) -> bool {
    let user = collect_user_thinking(payload);

    let tier_budget = resolved.thinking_budget.map(u64::from);
    let budget = user.budget.or(tier_budget);
    let wants_thinking = resolved.is_thinking_model || user.include_thoughts == Some(true);

    if !wants_thinking && budget.is_none() && !user.level_present {
        return false;
    }

    match family {
        ModelFamily::Claude => {
            if !resolved.is_thinking_model {
                // Thinking config on a non-thinking Claude model is rejected
                // upstream; drop whatever arrived.
                clear_thinking_config(payload);
                return false;
            }

            let include = user.include_thoughts.unwrap_or(true);
            let mut config = serde_json::Map::new();
            if let Some(budget) = budget.filter(|b| *b > 0) {
                if include {
                    config.insert("include_thoughts".to_string(), Value::Bool(true));
                }
                config.insert("thinking_budget".to_string(), json!(budget));
            }
            // includeThoughts without a positive budget is invalid; the
            // budget-less case simply omits both.

            let generation = generation_config_mut(payload);
            generation.thinking_config = if config.is_empty() {
                None
            } else {
                Some(Value::Object(config))
            };

            let current = generation.max_output_tokens.unwrap_or(0);
            if current < CLAUDE_MIN_OUTPUT_TOKENS {
                generation.max_output_tokens = Some(CLAUDE_MIN_OUTPUT_TOKENS);
            }

            payload.append_system_text(INTERLEAVED_HINT);
            true
        }

        ModelFamily::Gemini => {
            let mut config = serde_json::Map::new();
            if resolved.actual_model.starts_with("gemini-3") {
                config.insert("includeThoughts".to_string(), Value::Bool(true));
                let level = resolved
                    .thinking_level
                    .map(|l| l.as_str().to_string())
                    .or_else(|| user_level(payload));
                if let Some(level) = level {
                    config.insert("thinkingLevel".to_string(), Value::String(level));
                }
            } else if let Some(budget) = budget.filter(|b| *b > 0) {
                if user.include_thoughts.unwrap_or(true) {
                    config.insert("includeThoughts".to_string(), Value::Bool(true));
                }
                config.insert("thinkingBudget".to_string(), json!(budget));
            }

            if !config.is_empty() {
                generation_config_mut(payload).thinking_config = Some(Value::Object(config));
            } else if user.include_thoughts == Some(true) {
                // includeThoughts without a positive budget is invalid.
                drop_include_thoughts(payload);
            }
            false
        }
    }
}

fn drop_include_thoughts(payload: &mut RequestPayload) {
    if let Some(config) = payload
        .generation_config
        .as_mut()
        .and_then(|g| g.thinking_config.as_mut())
        .and_then(Value::as_object_mut)
    {
        config.remove("includeThoughts");
        config.remove("include_thoughts");
    }
}

fn generation_config_mut(payload: &mut RequestPayload) -> &mut GenerationConfig {
    payload
        .generation_config
        .get_or_insert_with(GenerationConfig::default)
}

fn clear_thinking_config(payload: &mut RequestPayload) {
    if let Some(generation) = payload.generation_config.as_mut() {
        generation.thinking_config = None;
    }
}

/// Gather the host's thinking knobs from `generationConfig.thinkingConfig`
/// and the `extra_body.thinking{,Config}` escape hatches.
fn collect_user_thinking(payload: &RequestPayload) -> UserThinking {
    let mut user = UserThinking::default();

    let sources = [
        payload
            .generation_config
            .as_ref()
            .and_then(|g| g.thinking_config.clone()),
        payload
            .extra
            .get("extra_body")
            .and_then(|eb| eb.get("thinking"))
            .cloned(),
        payload
            .extra
            .get("extra_body")
            .and_then(|eb| eb.get("thinkingConfig"))
            .cloned(),
    ];

    for source in sources.into_iter().flatten() {
        let include = source
            .get("includeThoughts")
            .or_else(|| source.get("include_thoughts"))
            .and_then(Value::as_bool);
        if include.is_some() && user.include_thoughts.is_none() {
            user.include_thoughts = include;
        }

        let budget = source
            .get("thinkingBudget")
            .or_else(|| source.get("thinking_budget"))
            .or_else(|| source.get("budget_tokens"))
            .and_then(Value::as_u64);
        if budget.is_some() && user.budget.is_none() {
            user.budget = budget;
        }

        if source.get("thinkingLevel").is_some() {
            user.level_present = true;
        }
    }

    user
}

fn user_level(payload: &RequestPayload) -> Option<String> {
    payload
        .generation_config
        .as_ref()
        .and_then(|g| g.thinking_config.as_ref())
        .and_then(|t| t.get("thinkingLevel"))
        .and_then(Value::as_str)
        .map(ToString::to_string)
}
