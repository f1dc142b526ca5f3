//! Signature cache service: the pure store plus file persistence and timers.

use crate::config::SignatureCacheConfig;
use crate::util::now_ms;
use castor_schema::RequestPayload;
use castor_sigcache_core::{
    DiskSnapshot, LastThinking, SignatureCacheEntry, SignatureStore, conversation_key, entry_key,
    session_key,
};
use serde_json::Value;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const SIGNATURE_CACHE_FILE_NAME: &str = "antigravity-signature-cache.json";

const JANITOR_INTERVAL: Duration = Duration::from_secs(30 * 60);
const MAX_ENTRIES: u64 = 100_000;

/// Client-supplied fields that identify a conversation, in lookup order.
const CONVERSATION_ID_FIELDS: &[&str] = &[
    "conversationId",
    "conversation_id",
    "threadId",
    "thread_id",
    "sessionId",
    "session_id",
];

pub struct SignatureCacheService {
    store: Arc<SignatureStore>,
    config: SignatureCacheConfig,
    path: PathBuf,
    plugin_session: String,
    dirty: Arc<AtomicBool>,
    timers: Mutex<Vec<JoinHandle<()>>>,
}

impl SignatureCacheService {
    pub fn new(config: SignatureCacheConfig, path: PathBuf, plugin_session: String) -> Self {
        let store = Arc::new(SignatureStore::new(
            config.memory_ttl_seconds,
            config.disk_ttl_seconds,
            MAX_ENTRIES,
        ));

        let service = SignatureCacheService {
            store,
            config,
            path,
            plugin_session,
            dirty: Arc::new(AtomicBool::new(false)),
            timers: Mutex::new(Vec::new()),
        };
        service.load_disk();
        service
    }

    /// Session key for a request: process UUID, model, project and the
    /// conversation identity derived from the payload.
    pub fn session_key_for(&self, model: &str, project: &str, payload: &RequestPayload) -> String {
        let explicit = CONVERSATION_ID_FIELDS
            .iter()
            .find_map(|field| payload.extra.get(*field))
            .and_then(Value::as_str)
            .map(ToString::to_string);

        // A sessionId this broker wrote on a previous pass already is the
        // full key; re-deriving from it would change the key every pass.
        if let Some(existing) = explicit
            .as_deref()
            .filter(|id| id.starts_with(&format!("{}:", self.plugin_session)))
        {
            return existing.to_string();
        }

        let conversation = conversation_key(
            explicit.as_deref(),
            payload.system_text().as_deref(),
            payload.first_user_text().as_deref(),
        );
        session_key(&self.plugin_session, model, project, &conversation)
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Remember a signature for a verbatim thought text.
    pub fn record(
        &self,
        session_key: &str,
        text: &str,
        signature: &str,
        tool_ids: Option<Vec<String>>,
    ) {
        if !self.config.enabled {
            return;
        }
        let Some(key) = entry_key(session_key, text) else {
            return;
        };

        let mut entry =
            SignatureCacheEntry::new(signature, now_ms()).with_thinking_text(text);
        if let Some(ids) = tool_ids.clone() {
            entry = entry.with_tool_ids(ids);
        }
        if self.store.put(key, entry) {
            self.store.set_last_thinking(
                session_key.to_string(),
                LastThinking {
                    text: text.to_string(),
                    signature: signature.to_string(),
                    tool_ids,
                },
            );
            self.dirty.store(true, Ordering::Relaxed);
        }
    }

    pub fn lookup(&self, session_key: &str, text: &str) -> Option<String> {
        if !self.config.enabled {
            return None;
        }
        let key = entry_key(session_key, text)?;
        self.store.get(&key).map(|entry| entry.signature)
    }

    pub fn last_thinking(&self, session_key: &str) -> Option<LastThinking> {
        if !self.config.enabled {
            return None;
        }
        self.store.last_thinking(session_key)
    }

    pub fn clear_last_thinking(&self, session_key: &str) {
        self.store.clear_last_thinking(session_key);
    }

    /// Start the flush and janitor timers. Idempotent.
    pub async fn start_timers(self: &Arc<Self>) {
        let mut timers = self.timers.lock().await;
        if !timers.is_empty() {
            return;
        }

        let flush_interval = Duration::from_secs(self.config.write_interval_seconds.max(1));
        let this = Arc::clone(self);
        timers.push(tokio::spawn(async move {
            loop {
                tokio::time::sleep(flush_interval).await;
                if this.dirty.swap(false, Ordering::Relaxed)
                    && let Err(e) = this.flush().await
                {
                    warn!("signature cache flush failed: {e}");
                    this.dirty.store(true, Ordering::Relaxed);
                }
            }
        }));

        let this = Arc::clone(self);
        timers.push(tokio::spawn(async move {
            loop {
                tokio::time::sleep(JANITOR_INTERVAL).await;
                this.store.run_pending_tasks();
            }
        }));
    }

    pub async fn stop_timers(&self) {
        for timer in self.timers.lock().await.drain(..) {
            timer.abort();
        }
    }

    /// Merge with the file on disk and rewrite it atomically. Disk entries
    /// younger than the disk TTL survive; memory wins on collision.
    pub async fn flush(&self) -> Result<(), std::io::Error> {
        let now = now_ms();

        // Pick up entries another process may have flushed meanwhile.
        if let Some(snapshot) = self.read_disk() {
            self.store
                .load_snapshot(&snapshot, now, self.config.disk_ttl_seconds);
        }

        let merged = self.store.merge_for_flush(
            self.config.memory_ttl_seconds,
            self.config.disk_ttl_seconds,
            now,
        );
        let json = serde_json::to_string_pretty(&merged)?;
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || -> Result<(), std::io::Error> {
            let dir = path.parent().map(PathBuf::from).unwrap_or_default();
            std::fs::create_dir_all(&dir)?;
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
            tmp.write_all(json.as_bytes())?;
            tmp.persist(&path).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(std::io::Error::other)??;

        debug!(entries = merged.entries.len(), "signature cache flushed");
        Ok(())
    }

    fn load_disk(&self) {
        if !self.config.enabled {
            return;
        }
        if let Some(snapshot) = self.read_disk() {
            self.store
                .load_snapshot(&snapshot, now_ms(), self.config.disk_ttl_seconds);
        }
    }

    fn read_disk(&self) -> Option<DiskSnapshot> {
        let raw = std::fs::read(&self.path).ok()?;
        match serde_json::from_slice(&raw) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(path = %self.path.display(), "signature cache file unreadable: {e}");
                None
            }
        }
    }
}
