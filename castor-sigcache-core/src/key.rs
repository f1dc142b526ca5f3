use ahash::AHasher;
use sha2::{Digest, Sha256};
use std::hash::Hasher;

/// Composite cache namespace for one conversation with one model.
///
/// `plugin_session` is the per-process UUID, so keys never collide across
/// broker restarts within the disk TTL window.
pub fn session_key(plugin_session: &str, model: &str, project: &str, conversation: &str) -> String {
    format!(
        "{plugin_session}:{}:{project}:{conversation}",
        model.to_lowercase()
    )
}

/// Stable per-conversation component of the session key.
///
/// Preference order: a client-supplied conversation id, else a 16-hex SHA-256
/// prefix over `system|first-user-text`, else the literal `default`. This
/// keeps keys stable across turns of one conversation without any
/// server-issued id.
pub fn conversation_key(
    explicit: Option<&str>,
    system_text: Option<&str>,
    first_user_text: Option<&str>,
) -> String {
    if let Some(id) = explicit.map(str::trim).filter(|s| !s.is_empty()) {
        return id.to_string();
    }

    let system = system_text.unwrap_or_default();
    let user = first_user_text.unwrap_or_default();
    if system.is_empty() && user.is_empty() {
        return "default".to_string();
    }

    let digest = Sha256::digest(format!("{system}|{user}").as_bytes());
    let mut hex = String::with_capacity(16);
    for byte in &digest[..8] {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

/// 16-hex fingerprint of a thinking text. `None` for blank text, which is
/// never a valid cache key.
pub fn text_fingerprint(text: &str) -> Option<String> {
    if text.trim().is_empty() {
        return None;
    }
    let mut hasher = AHasher::default();
    hasher.write(text.as_bytes());
    Some(format!("{:016x}", hasher.finish()))
}

/// Full entry key: session namespace plus the text fingerprint.
pub fn entry_key(session_key: &str, text: &str) -> Option<String> {
    text_fingerprint(text).map(|fp| format!("{session_key}:{fp}"))
}
