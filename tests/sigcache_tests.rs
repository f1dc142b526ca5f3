//! Dual-TTL behavior of the signature cache across flushes and restarts.

use castor::config::SignatureCacheConfig;
use castor::sigcache::{SIGNATURE_CACHE_FILE_NAME, SignatureCacheService};
use std::time::Duration;

fn long_sig(tag: &str) -> String {
    format!("{tag}{}", "q".repeat(60))
}

fn service(
    dir: &std::path::Path,
    memory_ttl_seconds: u64,
    disk_ttl_seconds: u64,
) -> SignatureCacheService {
    SignatureCacheService::new(
        SignatureCacheConfig {
            enabled: true,
            memory_ttl_seconds,
            disk_ttl_seconds,
            write_interval_seconds: 60,
        },
        dir.join(SIGNATURE_CACHE_FILE_NAME),
        "plugin-uuid".to_string(),
    )
}

#[tokio::test]
async fn retrieval_within_memory_ttl_is_identity() {
    let dir = tempfile::tempdir().unwrap();
    let cache = service(dir.path(), 3600, 172_800);
    let sig = long_sig("mem");

    cache.record("sk", "fresh thought", &sig, Some(vec!["tool-call-0".to_string()]));

    assert_eq!(cache.lookup("sk", "fresh thought"), Some(sig.clone()));
    let last = cache.last_thinking("sk").expect("last thinking");
    assert_eq!(last.signature, sig);
    assert_eq!(last.tool_ids.as_deref(), Some(&["tool-call-0".to_string()][..]));
}

#[tokio::test]
async fn expired_memory_tier_is_answered_by_disk_after_flush() {
    let dir = tempfile::tempdir().unwrap();
    let cache = service(dir.path(), 1, 172_800);
    let sig = long_sig("disk");

    cache.record("sk", "durable thought", &sig, None);
    cache.flush().await.expect("flush");

    // Outlive the memory tier; the flushed disk tier still answers.
    tokio::time::sleep(Duration::from_millis(1300)).await;
    assert_eq!(cache.lookup("sk", "durable thought"), Some(sig));
}

#[tokio::test]
async fn flush_merges_disk_entries_with_memory_winning() {
    let dir = tempfile::tempdir().unwrap();
    let old_sig = long_sig("old");
    let new_sig = long_sig("new");

    // First process writes two entries.
    {
        let cache = service(dir.path(), 3600, 172_800);
        cache.record("sk", "shared thought", &old_sig, None);
        cache.record("sk", "only on disk", &long_sig("keep"), None);
        cache.flush().await.expect("flush");
    }

    // Second process overwrites one key and flushes; the other survives the
    // merge untouched.
    {
        let cache = service(dir.path(), 3600, 172_800);
        cache.record("sk", "shared thought", &new_sig, None);
        cache.flush().await.expect("flush");
    }

    let reloaded = service(dir.path(), 3600, 172_800);
    assert_eq!(reloaded.lookup("sk", "shared thought"), Some(new_sig));
    assert_eq!(
        reloaded.lookup("sk", "only on disk"),
        Some(long_sig("keep"))
    );
}

#[tokio::test]
async fn signature_below_floor_is_never_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let cache = service(dir.path(), 3600, 172_800);

    cache.record("sk", "thought", "short-signature", None);
    cache.flush().await.expect("flush");

    let raw = std::fs::read_to_string(dir.path().join(SIGNATURE_CACHE_FILE_NAME)).unwrap();
    let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(value["version"], serde_json::json!("1.0"));
    assert!(value["entries"].as_object().unwrap().is_empty());
}
