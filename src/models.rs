//! Model alias resolution.
//!
//! Hosts address models as `name` or `name-tier` where the tier picks a
//! thinking effort. The resolver strips the tier, chooses the actual
//! upstream model and the thinking knobs the transformer will emit.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingLevel {
    Low,
    Medium,
    High,
}

impl ThinkingLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            ThinkingLevel::Low => "low",
            ThinkingLevel::Medium => "medium",
            ThinkingLevel::High => "high",
        }
    }

    fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "low" => Some(ThinkingLevel::Low),
            "medium" => Some(ThinkingLevel::Medium),
            "high" => Some(ThinkingLevel::High),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModel {
    pub actual_model: String,
    pub thinking_budget: Option<u32>,
    pub thinking_level: Option<ThinkingLevel>,
    pub is_thinking_model: bool,
}

/// Aliases that do not follow plain tier-suffix stripping. Checked before
/// the generic path.
const ALIASES: &[(&str, &str, Option<u32>, Option<ThinkingLevel>)] = &[
    ("gemini-3-pro-high", "gemini-3-pro", None, Some(ThinkingLevel::High)),
    ("gemini-3-pro-low", "gemini-3-pro", None, Some(ThinkingLevel::Low)),
    (
        "claude-sonnet-4-5-thinking-low",
        "claude-sonnet-4-5-thinking",
        Some(8192),
        None,
    ),
    (
        "claude-sonnet-4-5-thinking-medium",
        "claude-sonnet-4-5-thinking",
        Some(16384),
        None,
    ),
    (
        "claude-sonnet-4-5-thinking-high",
        "claude-sonnet-4-5-thinking",
        Some(32768),
        None,
    ),
];

pub fn resolve(requested: &str) -> ResolvedModel {
    let requested = requested.trim();

    if let Some((_, actual, budget, level)) =
        ALIASES.iter().find(|(alias, ..)| *alias == requested)
    {
        return ResolvedModel {
            actual_model: (*actual).to_string(),
            thinking_budget: *budget,
            thinking_level: *level,
            is_thinking_model: is_thinking_model(actual),
        };
    }

    if let Some((base, suffix)) = requested.rsplit_once('-')
        && let Some(level) = ThinkingLevel::from_suffix(suffix)
        && !base.is_empty()
    {
        let is_gemini_3 = base.starts_with("gemini-3");
        return ResolvedModel {
            actual_model: base.to_string(),
            thinking_budget: if is_gemini_3 {
                None
            } else {
                Some(budget_for(base, level))
            },
            thinking_level: is_gemini_3.then_some(level),
            is_thinking_model: is_thinking_model(base),
        };
    }

    ResolvedModel {
        actual_model: requested.to_string(),
        thinking_budget: None,
        thinking_level: None,
        is_thinking_model: is_thinking_model(requested),
    }
}

fn budget_for(base: &str, level: ThinkingLevel) -> u32 {
    let table: [u32; 3] = if base.starts_with("claude") || base == "gemini-2.5-pro" {
        [8192, 16384, 32768]
    } else if base == "gemini-2.5-flash" {
        [6144, 12288, 24576]
    } else {
        [4096, 8192, 16384]
    };
    match level {
        ThinkingLevel::Low => table[0],
        ThinkingLevel::Medium => table[1],
        ThinkingLevel::High => table[2],
    }
}

fn is_thinking_model(model: &str) -> bool {
    let model = model.to_lowercase();
    model.contains("thinking") || model.contains("gemini-3") || model.contains("opus")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gemini_3_alias_emits_level_not_budget() {
        let resolved = resolve("gemini-3-pro-high");
        assert_eq!(resolved.actual_model, "gemini-3-pro");
        assert_eq!(resolved.thinking_level, Some(ThinkingLevel::High));
        assert_eq!(resolved.thinking_budget, None);
        assert!(resolved.is_thinking_model);
    }

    #[test]
    fn claude_tier_emits_budget() {
        let resolved = resolve("claude-sonnet-4-5-thinking-medium");
        assert_eq!(resolved.actual_model, "claude-sonnet-4-5-thinking");
        assert_eq!(resolved.thinking_budget, Some(16384));
        assert_eq!(resolved.thinking_level, None);
        assert!(resolved.is_thinking_model);
    }

    #[test]
    fn family_budget_tables() {
        assert_eq!(resolve("gemini-2.5-pro-low").thinking_budget, Some(8192));
        assert_eq!(resolve("gemini-2.5-flash-medium").thinking_budget, Some(12288));
        assert_eq!(resolve("some-other-model-high").thinking_budget, Some(16384));
    }

    #[test]
    fn untiered_names_pass_through() {
        let resolved = resolve("claude-sonnet-4-5");
        assert_eq!(resolved.actual_model, "claude-sonnet-4-5");
        assert_eq!(resolved.thinking_budget, None);
        assert!(!resolved.is_thinking_model);
    }

    #[test]
    fn thinking_detection_covers_all_markers() {
        assert!(resolve("claude-opus-4-5").is_thinking_model);
        assert!(resolve("gemini-3-flash").is_thinking_model);
        assert!(resolve("claude-sonnet-4-5-thinking").is_thinking_model);
        assert!(!resolve("gemini-2.5-pro").is_thinking_model);
    }

    #[test]
    fn resolution_is_idempotent() {
        for name in [
            "gemini-3-pro-high",
            "claude-sonnet-4-5-thinking-low",
            "gemini-2.5-flash-medium",
            "claude-sonnet-4-5",
        ] {
            let once = resolve(name);
            let twice = resolve(&once.actual_model);
            assert_eq!(twice.actual_model, once.actual_model, "model {name}");
        }
    }
}
