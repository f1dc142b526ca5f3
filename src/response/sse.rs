use crate::sigcache::SignatureCacheService;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Line-oriented SSE rewriter.
///
/// `data:` lines carrying the upstream `{response: …}` envelope are
/// unwrapped, their thinking parts rewritten into the host's canonical
/// shape, and re-emitted; every other line passes through byte-for-byte.
/// The same walk accumulates thinking text per candidate and stores the
/// signature the moment one appears.
pub struct SseTransform {
    cache: Arc<SignatureCacheService>,
    session_key: String,
    buffer: Vec<u8>,
    debug_blob: Option<String>,
    harvest: HashMap<u64, Harvest>,
}

#[derive(Default)]
struct Harvest {
    thinking: String,
    tool_ids: Vec<String>,
}

impl SseTransform {
    pub fn new(
        cache: Arc<SignatureCacheService>,
        session_key: String,
        debug_blob: Option<String>,
    ) -> Self {
        SseTransform {
            cache,
            session_key,
            buffer: Vec::new(),
            debug_blob,
            harvest: HashMap::new(),
        }
    }

    /// Feed one network chunk; returns whatever complete lines produced.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<u8> {
        self.buffer.extend_from_slice(chunk);
        let mut output = Vec::new();

        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            self.process_line(&line, &mut output);
        }
        output
    }

    /// Flush the unterminated tail, if any.
    pub fn finish(&mut self) -> Vec<u8> {
        if self.buffer.is_empty() {
            return Vec::new();
        }
        let line: Vec<u8> = std::mem::take(&mut self.buffer);
        let mut output = Vec::new();
        self.process_line(&line, &mut output);
        output
    }

    fn process_line(&mut self, line: &[u8], output: &mut Vec<u8>) {
        let text = std::str::from_utf8(line).ok();
        let Some(payload) = text.and_then(|t| t.trim_end_matches(['\r', '\n']).strip_prefix("data:"))
        else {
            output.extend_from_slice(line);
            return;
        };

        let Ok(mut event) = serde_json::from_str::<Value>(payload.trim_start()) else {
            output.extend_from_slice(line);
            return;
        };
        let Some(mut unwrapped) = event
            .as_object_mut()
            .and_then(|obj| obj.remove("response"))
        else {
            output.extend_from_slice(line);
            return;
        };

        if let Some(blob) = self.debug_blob.take() {
            output.extend_from_slice(format!(": {blob}\n\n").as_bytes());
        }

        self.harvest_signatures(&unwrapped);
        rewrite_thinking_parts(&mut unwrapped);

        output.extend_from_slice(b"data: ");
        output.extend_from_slice(unwrapped.to_string().as_bytes());
        output.extend_from_slice(b"\n");
    }

    /// Accumulate thought text per candidate; store on signature sighting.
    fn harvest_signatures(&mut self, response: &Value) {
        let Some(candidates) = response.get("candidates").and_then(Value::as_array) else {
            return;
        };

        for candidate in candidates {
            let index = candidate.get("index").and_then(Value::as_u64).unwrap_or(0);
            let state = self.harvest.entry(index).or_default();

            let parts = candidate
                .pointer("/content/parts")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();

            for part in parts {
                if part.get("thought").and_then(Value::as_bool) == Some(true)
                    && let Some(text) = part.get("text").and_then(Value::as_str)
                {
                    state.thinking.push_str(text);
                }
                if let Some(id) = part
                    .get("functionCall")
                    .and_then(|fc| fc.get("id"))
                    .and_then(Value::as_str)
                {
                    state.tool_ids.push(id.to_string());
                }

                let signature = part
                    .get("thoughtSignature")
                    .or_else(|| part.get("signature"))
                    .and_then(Value::as_str);
                if let Some(signature) = signature
                    && !state.thinking.is_empty()
                {
                    let tool_ids = (!state.tool_ids.is_empty()).then(|| state.tool_ids.clone());
                    self.cache
                        .record(&self.session_key, &state.thinking, signature, tool_ids);
                }
            }
        }
    }
}

/// Rewrite thinking parts into the host's canonical shapes. Gemini-wire
/// `{thought: true, text}` becomes `{type: "reasoning", text}`; Anthropic
/// `{type: "thinking", thinking}` is already canonical and passes through.
fn rewrite_thinking_parts(response: &mut Value) {
    let Some(candidates) = response.get_mut("candidates").and_then(Value::as_array_mut) else {
        return;
    };
    for candidate in candidates {
        let Some(parts) = candidate
            .pointer_mut("/content/parts")
            .and_then(Value::as_array_mut)
        else {
            continue;
        };

        for part in parts.iter_mut() {
            if part.get("thought").and_then(Value::as_bool) != Some(true) {
                continue;
            }
            let text = part
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let signature = part
                .get("thoughtSignature")
                .and_then(Value::as_str)
                .map(ToString::to_string);

            let mut reasoning = serde_json::Map::new();
            reasoning.insert("type".to_string(), Value::String("reasoning".to_string()));
            reasoning.insert("text".to_string(), Value::String(text));
            if let Some(signature) = signature {
                reasoning.insert("signature".to_string(), Value::String(signature));
            }
            *part = Value::Object(reasoning);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SignatureCacheConfig;
    use serde_json::json;

    fn transform(dir: &std::path::Path) -> SseTransform {
        let cache = Arc::new(SignatureCacheService::new(
            SignatureCacheConfig::default(),
            dir.join("sig.json"),
            "plugin".to_string(),
        ));
        SseTransform::new(cache, "sk".to_string(), None)
    }

    fn long_sig() -> String {
        "g".repeat(64)
    }

    #[test]
    fn data_lines_are_unwrapped_and_thinking_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = transform(dir.path());

        let event = json!({"response": {"candidates": [{
            "index": 0,
            "content": {"role": "model", "parts": [
                {"thought": true, "text": "pondering"},
                {"text": "answer"}
            ]}
        }]}});
        let input = format!("data: {event}\n\n");

        let out = t.push_chunk(input.as_bytes());
        let out_str = String::from_utf8(out).unwrap();

        assert!(out_str.starts_with("data: "));
        let parsed: Value =
            serde_json::from_str(out_str.lines().next().unwrap().strip_prefix("data: ").unwrap())
                .unwrap();
        assert_eq!(
            parsed["candidates"][0]["content"]["parts"][0],
            json!({"type": "reasoning", "text": "pondering"})
        );
        assert_eq!(
            parsed["candidates"][0]["content"]["parts"][1],
            json!({"text": "answer"})
        );
        // The blank separator line passes through verbatim.
        assert!(out_str.ends_with("\n\n"));
    }

    #[test]
    fn partial_lines_buffer_across_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = transform(dir.path());

        let event = json!({"response": {"candidates": [{"index": 0, "content": {"parts": [{"text": "hello"}]}}]}});
        let full = format!("data: {event}\n");
        let (a, b) = full.split_at(20);

        let first = t.push_chunk(a.as_bytes());
        assert!(first.is_empty());
        let second = t.push_chunk(b.as_bytes());
        assert!(String::from_utf8(second).unwrap().starts_with("data: "));
    }

    #[test]
    fn non_data_lines_pass_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = transform(dir.path());

        let out = t.push_chunk(b"event: ping\nretry: 3000\n");
        assert_eq!(out, b"event: ping\nretry: 3000\n");
    }

    #[test]
    fn signature_is_harvested_from_accumulated_thinking() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(SignatureCacheService::new(
            SignatureCacheConfig::default(),
            dir.path().join("sig.json"),
            "plugin".to_string(),
        ));
        let mut t = SseTransform::new(cache.clone(), "sk".to_string(), None);
        let sig = long_sig();

        let chunk1 = json!({"response": {"candidates": [{
            "index": 0,
            "content": {"parts": [{"thought": true, "text": "alpha "}]}
        }]}});
        let chunk2 = json!({"response": {"candidates": [{
            "index": 0,
            "content": {"parts": [{"thought": true, "text": "beta", "thoughtSignature": sig}]}
        }]}});

        t.push_chunk(format!("data: {chunk1}\n").as_bytes());
        t.push_chunk(format!("data: {chunk2}\n").as_bytes());

        assert_eq!(cache.lookup("sk", "alpha beta"), Some(sig.clone()));
        assert_eq!(
            cache.last_thinking("sk").map(|l| l.text),
            Some("alpha beta".to_string())
        );
    }

    #[test]
    fn unterminated_tail_flushes_on_finish() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = transform(dir.path());

        let event = json!({"response": {"candidates": [{"index": 0, "content": {"parts": [{"text": "tail"}]}}]}});
        t.push_chunk(format!("data: {event}").as_bytes());

        let out = String::from_utf8(t.finish()).unwrap();
        assert!(out.starts_with("data: "));
        assert!(out.contains("tail"));
    }

    #[test]
    fn debug_blob_emitted_once_before_first_event() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(SignatureCacheService::new(
            SignatureCacheConfig::default(),
            dir.path().join("sig.json"),
            "plugin".to_string(),
        ));
        let mut t = SseTransform::new(cache, "sk".to_string(), Some("{\"model\":\"m\"}".to_string()));

        let event = json!({"response": {"candidates": []}});
        let out1 = String::from_utf8(t.push_chunk(format!("data: {event}\n").as_bytes())).unwrap();
        let out2 = String::from_utf8(t.push_chunk(format!("data: {event}\n").as_bytes())).unwrap();

        assert!(out1.starts_with(": {\"model\":\"m\"}\n\n"));
        assert!(!out2.contains("model"));
    }
}
