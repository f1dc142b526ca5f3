use crate::accounts::{Account, AccountsFile};
use crate::config::config_dir;
use crate::error::BrokerError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::io::Write;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub const ACCOUNTS_FILE_NAME: &str = "antigravity-accounts.json";

/// Persistence seam between the account manager and the outside world. The
/// OAuth login flow writes through the same interface from its own process.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(&self) -> Result<AccountsFile, BrokerError>;
    async fn save(&self, file: &AccountsFile) -> Result<(), BrokerError>;
}

/// Accounts file on disk, with forward migration on load and atomic writes.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: PathBuf) -> Self {
        JsonFileStore { path }
    }

    pub fn at_default_location() -> Self {
        Self::new(config_dir().join(ACCOUNTS_FILE_NAME))
    }
}

#[async_trait]
impl CredentialStore for JsonFileStore {
    async fn load(&self) -> Result<AccountsFile, BrokerError> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(AccountsFile::default());
            }
            Err(e) => return Err(e.into()),
        };

        // A corrupt file is ignored, never deleted: the next save rewrites it.
        let value: Value = match serde_json::from_slice(&raw) {
            Ok(value) => value,
            Err(e) => {
                warn!(path = %self.path.display(), "accounts file unreadable, starting empty: {e}");
                return Ok(AccountsFile::default());
            }
        };

        Ok(migrate(value, crate::util::now_ms()))
    }

    async fn save(&self, file: &AccountsFile) -> Result<(), BrokerError> {
        let json = serde_json::to_string_pretty(file)?;
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || -> Result<(), BrokerError> {
            let dir = path.parent().map(PathBuf::from).unwrap_or_default();
            std::fs::create_dir_all(&dir)?;
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
            tmp.write_all(json.as_bytes())?;
            tmp.write_all(b"\n")?;
            tmp.persist(&path).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(|e| BrokerError::Io(std::io::Error::other(e)))??;

        debug!(path = %self.path.display(), "accounts file saved");
        Ok(())
    }
}

/// In-memory store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<AccountsFile>,
}

impl MemoryStore {
    pub fn with_accounts(accounts: Vec<Account>) -> Self {
        MemoryStore {
            inner: Mutex::new(AccountsFile::with_accounts(accounts)),
        }
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn load(&self) -> Result<AccountsFile, BrokerError> {
        Ok(self.inner.lock().await.clone())
    }

    async fn save(&self, file: &AccountsFile) -> Result<(), BrokerError> {
        *self.inner.lock().await = file.clone();
        Ok(())
    }
}

/// Forward-migrate an accounts file of any known version to the current
/// shape, then sanitize indices and duplicate refresh tokens.
pub fn migrate(mut value: Value, now_ms: i64) -> AccountsFile {
    let version = value.get("version").and_then(Value::as_u64).unwrap_or(1);

    if version < 2 {
        migrate_v1_to_v2(&mut value);
    }
    if version < 3 {
        migrate_v2_to_v3(&mut value, now_ms);
    }

    let mut file: AccountsFile = match serde_json::from_value(value) {
        Ok(file) => file,
        Err(e) => {
            warn!("accounts file failed to parse after migration, starting empty: {e}");
            return AccountsFile::default();
        }
    };
    file.version = AccountsFile::VERSION;
    sanitize(&mut file, now_ms);
    file
}

/// v1 carried one scalar reset time per account. It predates per-family
/// buckets, so the scalar fans out to both families; this over-reports
/// limits right after an upgrade but is what the stored state meant.
fn migrate_v1_to_v2(value: &mut Value) {
    let Some(accounts) = value.get_mut("accounts").and_then(Value::as_array_mut) else {
        return;
    };
    for account in accounts {
        let Some(obj) = account.as_object_mut() else {
            continue;
        };
        if let Some(reset) = obj.remove("rateLimitResetTime")
            && reset.is_number()
        {
            obj.insert(
                "rateLimitResetTimes".to_string(),
                serde_json::json!({"claude": reset, "gemini": reset}),
            );
        }
    }
}

/// v2's single `gemini` bucket became `gemini-antigravity` when the CLI pool
/// was split off. Already-expired resets are dropped here rather than
/// carried forward.
fn migrate_v2_to_v3(value: &mut Value, now_ms: i64) {
    if let Some(accounts) = value.get_mut("accounts").and_then(Value::as_array_mut) {
        for account in accounts {
            let Some(resets) = account
                .get_mut("rateLimitResetTimes")
                .and_then(Value::as_object_mut)
            else {
                continue;
            };
            if let Some(gemini) = resets.remove("gemini") {
                resets.insert("gemini-antigravity".to_string(), gemini);
            }
            resets.retain(|_, reset| reset.as_i64().is_some_and(|ms| ms > now_ms));
        }
    }

    if let Some(obj) = value.as_object_mut() {
        obj.entry("activeIndexByFamily")
            .or_insert_with(|| serde_json::json!({"claude": -1, "gemini": -1}));
    }
}

fn sanitize(file: &mut AccountsFile, now_ms: i64) {
    let mut seen = HashSet::new();
    file.accounts
        .retain(|account| seen.insert(account.refresh_token.clone()));
    for account in &mut file.accounts {
        account.prune_expired_resets(now_ms);
    }

    let len = i64::try_from(file.accounts.len()).unwrap_or(0);
    let clamp = |index: i64| if (0..len).contains(&index) { index } else { -1 };
    file.active_index = clamp(file.active_index);
    file.active_index_by_family.claude = clamp(file.active_index_by_family.claude);
    file.active_index_by_family.gemini = clamp(file.active_index_by_family.gemini);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::families::QuotaKey;
    use serde_json::json;

    #[test]
    fn v1_scalar_fans_out_then_expired_dropped() {
        let now = 1_000_000;
        let migrated = migrate(
            json!({
                "accounts": [
                    {"refreshToken": "rt-fresh", "rateLimitResetTime": now + 60_000},
                    {"refreshToken": "rt-stale", "rateLimitResetTime": now - 1}
                ],
                "activeIndex": 0
            }),
            now,
        );

        assert_eq!(migrated.version, 3);
        let fresh = &migrated.accounts[0].rate_limit_reset_times;
        assert_eq!(fresh.get(&QuotaKey::Claude), Some(&(now + 60_000)));
        assert_eq!(fresh.get(&QuotaKey::GeminiAntigravity), Some(&(now + 60_000)));
        assert!(migrated.accounts[1].rate_limit_reset_times.is_empty());
    }

    #[test]
    fn v2_gemini_key_renamed() {
        let now = 1_000_000;
        let migrated = migrate(
            json!({
                "version": 2,
                "accounts": [{
                    "refreshToken": "rt",
                    "rateLimitResetTimes": {"gemini": now + 5000, "claude": now + 7000}
                }],
                "activeIndex": 0
            }),
            now,
        );

        let resets = &migrated.accounts[0].rate_limit_reset_times;
        assert_eq!(resets.get(&QuotaKey::GeminiAntigravity), Some(&(now + 5000)));
        assert_eq!(resets.get(&QuotaKey::Claude), Some(&(now + 7000)));
    }

    #[test]
    fn duplicate_refresh_tokens_collapse_and_indices_clamp() {
        let migrated = migrate(
            json!({
                "version": 3,
                "accounts": [
                    {"refreshToken": "rt-a"},
                    {"refreshToken": "rt-a"},
                    {"refreshToken": "rt-b"}
                ],
                "activeIndex": 5,
                "activeIndexByFamily": {"claude": 2, "gemini": -3}
            }),
            0,
        );

        assert_eq!(migrated.accounts.len(), 2);
        assert_eq!(migrated.active_index, -1);
        assert_eq!(migrated.active_index_by_family.claude, -1);
        assert_eq!(migrated.active_index_by_family.gemini, -1);
    }

    #[tokio::test]
    async fn corrupt_file_loads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(ACCOUNTS_FILE_NAME);
        std::fs::write(&path, b"{not json").unwrap();

        let store = JsonFileStore::new(path.clone());
        let file = store.load().await.unwrap();
        assert!(file.accounts.is_empty());
        // The broken file is left in place until the next save.
        assert!(path.exists());
    }

    #[tokio::test]
    async fn save_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join(ACCOUNTS_FILE_NAME));

        let mut account = Account::new("rt-1", 42);
        account.managed_project_id = Some("projects/managed".to_string());
        account
            .rate_limit_reset_times
            .insert(QuotaKey::Claude, i64::MAX);
        let mut file = AccountsFile::with_accounts(vec![account]);
        file.active_index = 0;
        file.active_index_by_family.claude = 0;

        store.save(&file).await.unwrap();
        let loaded = store.load().await.unwrap();
        assert_eq!(loaded, file);
    }
}
