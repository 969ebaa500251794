//! The persistence contract, and an in-memory implementation.
//!
//! The services never talk to storage directly; everything goes through
//! [`AccountRepository`]. Production deployments supply their own
//! implementation over whatever store the `database-connection` string
//! names. The bundled [`MemoryRepository`] backs tests and keyless local
//! runs.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("duplicate {field}")]
    Duplicate { field: &'static str },
}

/// A persisted identity.
#[derive(Clone, Debug)]
pub struct Account {
    pub user_id: Uuid,
    pub username: String,
    pub email: String,
    /// PHC-format KDF string.
    pub password_hash: String,
    /// Opaque application metadata, JSON-encoded.
    pub metadata: String,
    /// Unix seconds.
    pub created_at: u64,
    pub last_login: Option<u64>,
}

/// One audited login attempt, successful or not.
#[derive(Clone, Debug)]
pub struct LoginAttempt {
    pub ip: IpAddr,
    pub identifier: String,
    pub success: bool,
    /// Unix seconds.
    pub at: u64,
}

/// Outcome of the per-IP limiter for one prospective attempt.
#[derive(Copy, Clone, Debug)]
pub struct RateLimitDecision {
    /// Failed attempts currently inside the window.
    pub attempts: u32,
    pub limited: bool,
    /// Seconds until the oldest counting attempt leaves the window.
    pub retry_after_secs: u32,
}

impl RateLimitDecision {
    pub fn unlimited(attempts: u32) -> Self {
        Self {
            attempts,
            limited: false,
            retry_after_secs: 0,
        }
    }
}

/// The narrow persistence interface the auth endpoints require.
///
/// Every method may suspend on I/O. Time is caller-stamped Unix seconds
/// so implementations stay clock-free and tests stay deterministic.
#[async_trait]
pub trait AccountRepository: Send + Sync + 'static {
    async fn create_account(&self, account: Account) -> Result<(), RepositoryError>;

    async fn find_by_username(&self, username: &str) -> Result<Option<Account>, RepositoryError>;

    async fn find_by_email(&self, email: &str) -> Result<Option<Account>, RepositoryError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Account>, RepositoryError>;

    async fn update_last_login(&self, id: Uuid, at: u64) -> Result<(), RepositoryError>;

    async fn record_login_attempt(&self, attempt: LoginAttempt) -> Result<(), RepositoryError>;

    /// Counts failed attempts from `ip` within `window` of `now` and
    /// decides whether another attempt is allowed.
    async fn check_rate_limit(
        &self,
        ip: IpAddr,
        now: u64,
        window: Duration,
        max_attempts: u32,
    ) -> Result<RateLimitDecision, RepositoryError>;

    /// Deletes attempts older than `older_than` before `now`. Returns
    /// how many were removed.
    async fn cleanup_attempts(&self, now: u64, older_than: Duration)
        -> Result<u64, RepositoryError>;
}

#[derive(Default)]
struct MemoryState {
    accounts: HashMap<Uuid, Account>,
    attempts: Vec<LoginAttempt>,
}

/// In-memory [`AccountRepository`].
#[derive(Default, Clone)]
pub struct MemoryRepository {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AccountRepository for MemoryRepository {
    async fn create_account(&self, account: Account) -> Result<(), RepositoryError> {
        let mut state = self.state.lock();

        if state
            .accounts
            .values()
            .any(|a| a.username.eq_ignore_ascii_case(&account.username))
        {
            return Err(RepositoryError::Duplicate { field: "username" });
        }

        if state
            .accounts
            .values()
            .any(|a| a.email.eq_ignore_ascii_case(&account.email))
        {
            return Err(RepositoryError::Duplicate { field: "email" });
        }

        state.accounts.insert(account.user_id, account);
        Ok(())
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<Account>, RepositoryError> {
        Ok(self
            .state
            .lock()
            .accounts
            .values()
            .find(|a| a.username.eq_ignore_ascii_case(username))
            .cloned())
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<Account>, RepositoryError> {
        Ok(self
            .state
            .lock()
            .accounts
            .values()
            .find(|a| a.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Account>, RepositoryError> {
        Ok(self.state.lock().accounts.get(&id).cloned())
    }

    async fn update_last_login(&self, id: Uuid, at: u64) -> Result<(), RepositoryError> {
        if let Some(account) = self.state.lock().accounts.get_mut(&id) {
            account.last_login = Some(at);
        }
        Ok(())
    }

    async fn record_login_attempt(&self, attempt: LoginAttempt) -> Result<(), RepositoryError> {
        self.state.lock().attempts.push(attempt);
        Ok(())
    }

    async fn check_rate_limit(
        &self,
        ip: IpAddr,
        now: u64,
        window: Duration,
        max_attempts: u32,
    ) -> Result<RateLimitDecision, RepositoryError> {
        let window_secs = window.as_secs();
        let state = self.state.lock();

        let mut in_window: Vec<u64> = state
            .attempts
            .iter()
            .filter(|a| a.ip == ip && !a.success && a.at + window_secs > now)
            .map(|a| a.at)
            .collect();
        in_window.sort_unstable();

        let attempts = in_window.len() as u32;

        if attempts < max_attempts {
            return Ok(RateLimitDecision::unlimited(attempts));
        }

        // The attempt whose expiry brings the count back under the
        // limit.
        let gating = in_window[in_window.len() - max_attempts as usize];
        let retry_after_secs = (gating + window_secs).saturating_sub(now) as u32;

        Ok(RateLimitDecision {
            attempts,
            limited: true,
            retry_after_secs,
        })
    }

    async fn cleanup_attempts(
        &self,
        now: u64,
        older_than: Duration,
    ) -> Result<u64, RepositoryError> {
        let cutoff = now.saturating_sub(older_than.as_secs());
        let mut state = self.state.lock();

        let before = state.attempts.len();
        state.attempts.retain(|a| a.at >= cutoff);

        Ok((before - state.attempts.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([5, 6, 7, last])
    }

    fn account(name: &str, email: &str) -> Account {
        Account {
            user_id: Uuid::new_v4(),
            username: name.to_owned(),
            email: email.to_owned(),
            password_hash: "$argon2id$stub".to_owned(),
            metadata: "{}".to_owned(),
            created_at: 0,
            last_login: None,
        }
    }

    fn failure(ip: IpAddr, at: u64) -> LoginAttempt {
        LoginAttempt {
            ip,
            identifier: "alice".to_owned(),
            success: false,
            at,
        }
    }

    #[tokio::test]
    async fn duplicate_usernames_are_refused() {
        let repo = MemoryRepository::new();

        repo.create_account(account("alice", "a@x.y")).await.unwrap();

        let err = repo
            .create_account(account("Alice", "other@x.y"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RepositoryError::Duplicate { field: "username" }
        ));

        let err = repo
            .create_account(account("bob", "A@X.Y"))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Duplicate { field: "email" }));
    }

    #[tokio::test]
    async fn rate_limit_trips_at_max_and_reports_retry_after() {
        let repo = MemoryRepository::new();
        let window = Duration::from_secs(60);

        for at in [0, 1, 2] {
            repo.record_login_attempt(failure(ip(8), at)).await.unwrap();
        }

        let decision = repo.check_rate_limit(ip(8), 3, window, 3).await.unwrap();
        assert!(decision.limited);
        assert_eq!(decision.attempts, 3);
        assert_eq!(decision.retry_after_secs, 57);

        // A different IP is unaffected.
        let other = repo.check_rate_limit(ip(9), 3, window, 3).await.unwrap();
        assert!(!other.limited);

        // After the window passes the limit releases.
        let later = repo.check_rate_limit(ip(8), 63, window, 3).await.unwrap();
        assert!(!later.limited);
        assert_eq!(later.attempts, 0);
    }

    #[tokio::test]
    async fn successes_do_not_count_toward_the_limit() {
        let repo = MemoryRepository::new();

        for at in [0, 1, 2] {
            repo.record_login_attempt(LoginAttempt {
                success: true,
                ..failure(ip(8), at)
            })
            .await
            .unwrap();
        }

        let decision = repo
            .check_rate_limit(ip(8), 3, Duration::from_secs(60), 3)
            .await
            .unwrap();
        assert!(!decision.limited);
    }

    #[tokio::test]
    async fn cleanup_drops_old_attempts() {
        let repo = MemoryRepository::new();

        repo.record_login_attempt(failure(ip(1), 0)).await.unwrap();
        repo.record_login_attempt(failure(ip(1), 500)).await.unwrap();

        let removed = repo
            .cleanup_attempts(600, Duration::from_secs(200))
            .await
            .unwrap();

        assert_eq!(removed, 1);
    }
}
