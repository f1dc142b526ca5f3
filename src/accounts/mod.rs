//! Account pool: persistence, selection, token refresh.

mod account;
mod manager;
mod refresh_queue;
mod refresher;
mod store;

pub use account::{Account, AccountsFile, FamilyIndices};
pub use manager::{AccountManager, AccountSnapshot};
pub use refresh_queue::{ProactiveRefreshQueue, RefreshQueueStats};
pub use refresher::{RefreshedToken, TokenRefresher};
pub use store::{CredentialStore, JsonFileStore, MemoryStore, ACCOUNTS_FILE_NAME};
