use crate::accounts::{Account, AccountsFile, CredentialStore, FamilyIndices, RefreshedToken};
use crate::error::BrokerError;
use crate::families::{HeaderStyle, ModelFamily, QuotaKey, SwitchReason};
use crate::host::ToastSink;
use crate::util::now_ms;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Default minimum gap between "switched account" toasts for one account.
const TOAST_DEBOUNCE_MS: i64 = 30_000;

/// Value handed to callers: a copy of the account plus its stable index.
/// Callers never hold a reference into the pool.
#[derive(Debug, Clone)]
pub struct AccountSnapshot {
    pub index: usize,
    pub account: Account,
}

/// Pure selection state. No IO, no locks; the wrapping manager owns both.
#[derive(Debug)]
struct AccountPool {
    accounts: Vec<Account>,
    cursor: usize,
    active_index: i64,
    family_indices: FamilyIndices,
    last_toast_at: HashMap<usize, i64>,
}

/// Outcome of a selection, including whether the pool moved to a different
/// account and should announce it.
struct Selection {
    index: usize,
    account: Account,
    switched: bool,
}

impl AccountPool {
    fn from_file(file: AccountsFile) -> Self {
        AccountPool {
            accounts: file.accounts,
            cursor: 0,
            active_index: file.active_index,
            family_indices: file.active_index_by_family,
            last_toast_at: HashMap::new(),
        }
    }

    fn to_file(&self) -> AccountsFile {
        AccountsFile {
            version: AccountsFile::VERSION,
            accounts: self.accounts.clone(),
            active_index: self.active_index,
            active_index_by_family: self.family_indices,
        }
    }

    /// Sticky selection: keep the family's current account while it has a
    /// free bucket; rotate only on rate limit.
    fn get_current_or_next(&mut self, family: ModelFamily, now: i64) -> Option<Selection> {
        let current = self.family_indices.get(family);
        if current >= 0 {
            let index = current as usize;
            if let Some(account) = self.accounts.get_mut(index) {
                account.prune_expired_resets(now);
                if !account.is_rate_limited_for_family(family, now) {
                    account.last_used = now;
                    return Some(Selection {
                        index,
                        account: account.clone(),
                        switched: false,
                    });
                }
            }
        }
        self.get_next(family, now)
    }

    /// Round-robin over accounts with a free bucket for the family.
    fn get_next(&mut self, family: ModelFamily, now: i64) -> Option<Selection> {
        for account in &mut self.accounts {
            account.prune_expired_resets(now);
        }

        let candidates: Vec<usize> = (0..self.accounts.len())
            .filter(|i| !self.accounts[*i].is_rate_limited_for_family(family, now))
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let index = candidates[self.cursor % candidates.len()];
        self.cursor = self.cursor.wrapping_add(1);

        let had_selection = self.family_indices.get(family) >= 0;
        let previous = self.family_indices.get(family);
        let previous_was_limited = usize::try_from(previous).ok().is_some_and(|p| {
            self.accounts
                .get(p)
                .is_some_and(|a| a.is_rate_limited_for_family(family, now))
        });

        let account = &mut self.accounts[index];
        account.last_used = now;
        account.last_switch_reason = if !had_selection {
            SwitchReason::Initial
        } else if previous_was_limited {
            SwitchReason::RateLimit
        } else {
            SwitchReason::Rotation
        };

        let switched = previous != index as i64;
        self.family_indices.set(family, index as i64);
        self.active_index = index as i64;

        Some(Selection {
            index,
            account: account.clone(),
            switched,
        })
    }

    fn mark_rate_limited(
        &mut self,
        index: usize,
        retry_after_ms: i64,
        family: ModelFamily,
        style: HeaderStyle,
        now: i64,
    ) {
        let Some(account) = self.accounts.get_mut(index) else {
            return;
        };
        let key = QuotaKey::for_request(family, style);
        account
            .rate_limit_reset_times
            .insert(key, now + retry_after_ms.max(0));
    }

    /// 0 when anyone is free; otherwise the soonest any account frees up.
    fn min_wait_ms(&mut self, family: ModelFamily, now: i64) -> i64 {
        if self.accounts.is_empty() {
            return 0;
        }
        self.accounts
            .iter_mut()
            .map(|account| {
                account.prune_expired_resets(now);
                account.wait_ms_for_family(family, now)
            })
            .min()
            .unwrap_or(0)
    }

    /// Remove an account and re-point every index at the survivors.
    fn remove(&mut self, index: usize) -> Option<Account> {
        if index >= self.accounts.len() {
            return None;
        }
        let removed = self.accounts.remove(index);
        self.last_toast_at.remove(&index);

        let len = self.accounts.len() as i64;
        let shift = |value: i64| -> i64 {
            let next = if value == index as i64 {
                -1
            } else if value > index as i64 {
                value - 1
            } else {
                value
            };
            if (0..len).contains(&next) { next } else { -1 }
        };

        self.active_index = shift(self.active_index);
        self.family_indices.claude = shift(self.family_indices.claude);
        self.family_indices.gemini = shift(self.family_indices.gemini);
        if !self.accounts.is_empty() {
            self.cursor %= self.accounts.len();
        } else {
            self.cursor = 0;
        }
        Some(removed)
    }

    fn should_toast(&mut self, index: usize, now: i64, debounce_ms: i64) -> bool {
        let last = self.last_toast_at.get(&index).copied().unwrap_or(i64::MIN);
        if now.saturating_sub(last) < debounce_ms {
            return false;
        }
        self.last_toast_at.insert(index, now);
        true
    }
}

/// Shared account manager: one mutex around the pool, snapshot-then-act for
/// anything that leaves the process.
pub struct AccountManager {
    pool: Mutex<AccountPool>,
    store: Arc<dyn CredentialStore>,
    toasts: Arc<dyn ToastSink>,
    quiet: bool,
}

impl AccountManager {
    pub async fn load(
        store: Arc<dyn CredentialStore>,
        toasts: Arc<dyn ToastSink>,
        quiet: bool,
    ) -> Result<Self, BrokerError> {
        let file = store.load().await?;
        info!(accounts = file.accounts.len(), "account pool loaded");
        Ok(AccountManager {
            pool: Mutex::new(AccountPool::from_file(file)),
            store,
            toasts,
            quiet,
        })
    }

    /// Sticky account selection for a family. Persists on switch and posts a
    /// debounced toast.
    pub async fn get_current_or_next(&self, family: ModelFamily) -> Option<AccountSnapshot> {
        let now = now_ms();
        let (selection, file, announce) = {
            let mut pool = self.pool.lock().expect("account pool poisoned");
            let selection = pool.get_current_or_next(family, now)?;
            let announce = selection.switched
                && pool.should_toast(selection.index, now, TOAST_DEBOUNCE_MS);
            (Some(selection), pool.to_file(), announce)
        };
        let selection = selection?;

        if let Err(e) = self.store.save(&file).await {
            warn!("accounts save after selection failed: {e}");
        }
        if announce && !self.quiet {
            self.toasts.toast(&format!(
                "Antigravity: switched to account #{} for {}",
                selection.index + 1,
                family.as_str()
            ));
        }

        debug!(
            index = selection.index,
            family = family.as_str(),
            switched = selection.switched,
            "account selected"
        );
        Some(AccountSnapshot {
            index: selection.index,
            account: selection.account,
        })
    }

    pub async fn mark_rate_limited(
        &self,
        index: usize,
        retry_after_ms: i64,
        family: ModelFamily,
        style: HeaderStyle,
    ) {
        let file = {
            let mut pool = self.pool.lock().expect("account pool poisoned");
            pool.mark_rate_limited(index, retry_after_ms, family, style, now_ms());
            pool.to_file()
        };
        info!(
            index,
            family = family.as_str(),
            ?style,
            retry_after_ms,
            "account rate-limited"
        );
        if let Err(e) = self.store.save(&file).await {
            warn!("accounts save after rate-limit mark failed: {e}");
        }
    }

    /// First free header style for this account and family, preferring the
    /// IDE identity.
    pub fn available_header_style(&self, index: usize, family: ModelFamily) -> Option<HeaderStyle> {
        let pool = self.pool.lock().expect("account pool poisoned");
        pool.accounts
            .get(index)?
            .available_header_style(family, now_ms())
    }

    pub fn min_wait_ms(&self, family: ModelFamily) -> i64 {
        let mut pool = self.pool.lock().expect("account pool poisoned");
        pool.min_wait_ms(family, now_ms())
    }

    /// Write back a refreshed token and persist.
    pub async fn apply_refreshed_token(&self, index: usize, token: &RefreshedToken) {
        let file = {
            let mut pool = self.pool.lock().expect("account pool poisoned");
            if let Some(account) = pool.accounts.get_mut(index) {
                account.access_token = Some(token.access_token.clone());
                account.expires = token.expires;
            }
            pool.to_file()
        };
        if let Err(e) = self.store.save(&file).await {
            warn!("accounts save after refresh failed: {e}");
        }
    }

    /// Record a managed project discovered for the account's credential.
    pub async fn set_managed_project(&self, refresh_token: &str, project: &str) {
        let file = {
            let mut pool = self.pool.lock().expect("account pool poisoned");
            for account in &mut pool.accounts {
                if account.refresh_token == refresh_token {
                    account.managed_project_id = Some(project.to_string());
                }
            }
            pool.to_file()
        };
        if let Err(e) = self.store.save(&file).await {
            warn!("accounts save after project discovery failed: {e}");
        }
    }

    /// Permanently drop an account whose refresh token was rejected.
    pub async fn remove_account(&self, index: usize) {
        let (removed, file) = {
            let mut pool = self.pool.lock().expect("account pool poisoned");
            let removed = pool.remove(index);
            (removed, pool.to_file())
        };
        if let Some(account) = removed {
            warn!(
                index,
                email = account.email.as_deref().unwrap_or("-"),
                "account removed from pool"
            );
            self.toasts.toast(&format!(
                "Antigravity: account #{} was rejected by Google and removed; re-run login",
                index + 1
            ));
        }
        if let Err(e) = self.store.save(&file).await {
            warn!("accounts save after removal failed: {e}");
        }
    }

    pub fn index_of_refresh_token(&self, refresh_token: &str) -> Option<usize> {
        let pool = self.pool.lock().expect("account pool poisoned");
        pool.accounts
            .iter()
            .position(|account| account.refresh_token == refresh_token)
    }

    pub fn account_snapshot(&self, index: usize) -> Option<AccountSnapshot> {
        let pool = self.pool.lock().expect("account pool poisoned");
        pool.accounts.get(index).map(|account| AccountSnapshot {
            index,
            account: account.clone(),
        })
    }

    pub fn accounts_snapshot(&self) -> Vec<AccountSnapshot> {
        let pool = self.pool.lock().expect("account pool poisoned");
        pool.accounts
            .iter()
            .enumerate()
            .map(|(index, account)| AccountSnapshot {
                index,
                account: account.clone(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pool.lock().expect("account pool poisoned").accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn active_index_for(&self, family: ModelFamily) -> i64 {
        let pool = self.pool.lock().expect("account pool poisoned");
        pool.family_indices.get(family)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_of(n: usize) -> AccountPool {
        let accounts = (0..n)
            .map(|i| {
                let mut account = Account::new(format!("rt-{i}"), 0);
                account.access_token = Some(format!("at-{i}"));
                account.expires = i64::MAX;
                account
            })
            .collect();
        AccountPool::from_file(AccountsFile::with_accounts(accounts))
    }

    #[test]
    fn selection_is_sticky_across_successes() {
        let mut pool = pool_of(2);
        let now = 1000;

        let first = pool.get_current_or_next(ModelFamily::Claude, now).unwrap();
        for _ in 0..4 {
            let again = pool.get_current_or_next(ModelFamily::Claude, now).unwrap();
            assert_eq!(again.index, first.index);
            assert!(!again.switched);
        }
        assert_eq!(pool.family_indices.claude, first.index as i64);
    }

    #[test]
    fn rate_limit_rotates_and_recovers_after_reset() {
        let mut pool = pool_of(2);
        let now = 1000;

        let first = pool.get_current_or_next(ModelFamily::Claude, now).unwrap();
        pool.mark_rate_limited(
            first.index,
            30_000,
            ModelFamily::Claude,
            HeaderStyle::Antigravity,
            now,
        );

        let second = pool.get_current_or_next(ModelFamily::Claude, now).unwrap();
        assert_ne!(second.index, first.index);
        assert_eq!(
            pool.accounts[second.index].last_switch_reason,
            SwitchReason::RateLimit
        );

        // After the reset passes, the first account is selectable again.
        let later = now + 31_000;
        let candidates: Vec<usize> = (0..2)
            .filter(|i| {
                !pool.accounts[*i].is_rate_limited_for_family(ModelFamily::Claude, later)
            })
            .collect();
        assert_eq!(candidates, vec![0, 1]);
    }

    #[test]
    fn get_next_returns_none_when_all_limited() {
        let mut pool = pool_of(2);
        let now = 1000;
        for index in 0..2 {
            pool.mark_rate_limited(
                index,
                60_000,
                ModelFamily::Claude,
                HeaderStyle::Antigravity,
                now,
            );
        }

        assert!(pool.get_current_or_next(ModelFamily::Claude, now).is_none());
        assert_eq!(pool.min_wait_ms(ModelFamily::Claude, now), 60_000);
    }

    #[test]
    fn gemini_account_with_one_free_bucket_stays_selectable() {
        let mut pool = pool_of(1);
        let now = 1000;
        pool.mark_rate_limited(
            0,
            60_000,
            ModelFamily::Gemini,
            HeaderStyle::Antigravity,
            now,
        );

        let selection = pool.get_current_or_next(ModelFamily::Gemini, now).unwrap();
        assert_eq!(selection.index, 0);
        assert_eq!(
            pool.accounts[0].available_header_style(ModelFamily::Gemini, now),
            Some(HeaderStyle::GeminiCli)
        );
        assert_eq!(pool.min_wait_ms(ModelFamily::Gemini, now), 0);
    }

    #[test]
    fn rotation_distributes_over_candidates() {
        let mut pool = pool_of(3);
        let now = 1000;

        // Exhaust the sticky account, then force repeated next calls.
        let first = pool.get_next(ModelFamily::Claude, now).unwrap();
        let second = pool.get_next(ModelFamily::Claude, now).unwrap();
        let third = pool.get_next(ModelFamily::Claude, now).unwrap();
        let again = pool.get_next(ModelFamily::Claude, now).unwrap();

        assert_ne!(first.index, second.index);
        assert_ne!(second.index, third.index);
        assert_eq!(again.index, first.index);
    }

    #[test]
    fn removal_reindexes_and_resets_dangling_indices() {
        let mut pool = pool_of(3);
        pool.family_indices.claude = 1;
        pool.family_indices.gemini = 2;
        pool.active_index = 2;

        pool.remove(1);

        assert_eq!(pool.accounts.len(), 2);
        assert_eq!(pool.family_indices.claude, -1);
        assert_eq!(pool.family_indices.gemini, 1);
        assert_eq!(pool.active_index, 1);

        pool.remove(1);
        assert_eq!(pool.family_indices.gemini, -1);
        assert_eq!(pool.active_index, -1);
        assert_eq!(pool.cursor, 0);
    }

    #[test]
    fn toast_debounce_swallows_repeats() {
        let mut pool = pool_of(1);
        assert!(pool.should_toast(0, 1000, TOAST_DEBOUNCE_MS));
        assert!(!pool.should_toast(0, 1000 + TOAST_DEBOUNCE_MS - 1, TOAST_DEBOUNCE_MS));
        assert!(pool.should_toast(0, 1000 + TOAST_DEBOUNCE_MS, TOAST_DEBOUNCE_MS));
    }
}
