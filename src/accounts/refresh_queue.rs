use crate::accounts::{AccountManager, TokenRefresher};
use crate::error::OauthError;
use crate::util::now_ms;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const INITIAL_DELAY: Duration = Duration::from_secs(5);

/// Observability counters for the background queue.
#[derive(Debug, Clone, Default)]
pub struct RefreshQueueStats {
    pub refresh_count: u64,
    pub error_count: u64,
    pub last_sweep_ms: i64,
    pub last_refresh_ms: i64,
}

#[derive(Default)]
struct Counters {
    refresh_count: AtomicU64,
    error_count: AtomicU64,
    last_sweep_ms: AtomicI64,
    last_refresh_ms: AtomicI64,
}

/// Background loop that renews access tokens before they lapse, so the
/// request path rarely pays the exchange latency.
///
/// Refreshes run serially on purpose: a wide pool refreshing concurrently
/// against one OAuth endpoint is a self-inflicted thundering herd.
pub struct ProactiveRefreshQueue {
    manager: Arc<AccountManager>,
    refresher: Arc<TokenRefresher>,
    buffer_seconds: u64,
    check_interval: Duration,
    counters: Arc<Counters>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ProactiveRefreshQueue {
    pub fn new(
        manager: Arc<AccountManager>,
        refresher: Arc<TokenRefresher>,
        buffer_seconds: u64,
        check_interval_seconds: u64,
    ) -> Self {
        ProactiveRefreshQueue {
            manager,
            refresher,
            buffer_seconds,
            check_interval: Duration::from_secs(check_interval_seconds.max(1)),
            counters: Arc::new(Counters::default()),
            task: Mutex::new(None),
        }
    }

    /// Start the loop. A second call while running is a no-op.
    pub async fn start(&self) {
        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            debug!("refresh queue already running, start ignored");
            return;
        }

        let manager = Arc::clone(&self.manager);
        let refresher = Arc::clone(&self.refresher);
        let counters = Arc::clone(&self.counters);
        let buffer_seconds = self.buffer_seconds;
        let interval = self.check_interval;

        *task = Some(tokio::spawn(async move {
            info!(
                buffer_seconds,
                interval_secs = interval.as_secs(),
                "proactive refresh queue started"
            );
            tokio::time::sleep(INITIAL_DELAY).await;
            loop {
                sweep(&manager, &refresher, &counters, buffer_seconds).await;
                tokio::time::sleep(interval).await;
            }
        }));
    }

    pub async fn stop(&self) {
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
            info!("proactive refresh queue stopped");
        }
    }

    pub fn stats(&self) -> RefreshQueueStats {
        RefreshQueueStats {
            refresh_count: self.counters.refresh_count.load(Ordering::Relaxed),
            error_count: self.counters.error_count.load(Ordering::Relaxed),
            last_sweep_ms: self.counters.last_sweep_ms.load(Ordering::Relaxed),
            last_refresh_ms: self.counters.last_refresh_ms.load(Ordering::Relaxed),
        }
    }
}

/// One pass over the pool. Accounts already past expiry are left to the
/// request path; only the soon-to-expire window is renewed here.
async fn sweep(
    manager: &AccountManager,
    refresher: &TokenRefresher,
    counters: &Counters,
    buffer_seconds: u64,
) {
    let now = now_ms();
    counters.last_sweep_ms.store(now, Ordering::Relaxed);
    let buffer_ms = i64::try_from(buffer_seconds.saturating_mul(1000)).unwrap_or(i64::MAX);

    for snapshot in manager.accounts_snapshot() {
        let expires = snapshot.account.expires;
        if expires <= now || expires > now + buffer_ms {
            continue;
        }

        let refresh_token = snapshot.account.refresh_token.clone();
        match refresher.refresh(&refresh_token).await {
            Ok(token) => {
                if let Some(index) = manager.index_of_refresh_token(&refresh_token) {
                    manager.apply_refreshed_token(index, &token).await;
                }
                counters.refresh_count.fetch_add(1, Ordering::Relaxed);
                counters.last_refresh_ms.store(now_ms(), Ordering::Relaxed);
                debug!(index = snapshot.index, "proactive token refresh done");
            }
            Err(OauthError::InvalidGrant) => {
                counters.error_count.fetch_add(1, Ordering::Relaxed);
                if let Some(index) = manager.index_of_refresh_token(&refresh_token) {
                    manager.remove_account(index).await;
                }
            }
            Err(e) => {
                counters.error_count.fetch_add(1, Ordering::Relaxed);
                warn!(index = snapshot.index, "proactive refresh failed: {e}");
            }
        }
    }
}
