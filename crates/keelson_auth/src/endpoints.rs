//! The register, login, and validate-token endpoints.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use keelson_protocol::messages::{
    LoginRequest, LoginResponse, LoginResult, RegisterRequest, RegisterResponse, RegisterResult,
    TokenValidationRequest, TokenValidationResponse,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::password::{hash_password, verify_password};
use crate::repository::{Account, AccountRepository, LoginAttempt, RateLimitDecision};
use crate::token::TokenAuthority;

/// Account policy knobs.
#[derive(Clone, Debug)]
pub struct AccountPolicy {
    pub min_password_len: usize,
    pub rate_limit_window: Duration,
    pub rate_limit_max_attempts: u32,
}

impl Default for AccountPolicy {
    fn default() -> Self {
        Self {
            min_password_len: 8,
            rate_limit_window: Duration::from_secs(60 * 15),
            rate_limit_max_attempts: 5,
        }
    }
}

/// The auth service's request handlers, free of any transport concerns.
///
/// Every handler is asynchronous because the repository may suspend on
/// I/O; time is passed in as Unix seconds by the caller.
pub struct AuthEndpoints {
    repository: Arc<dyn AccountRepository>,
    tokens: TokenAuthority,
    policy: AccountPolicy,
}

impl AuthEndpoints {
    pub fn new(
        repository: Arc<dyn AccountRepository>,
        tokens: TokenAuthority,
        policy: AccountPolicy,
    ) -> Self {
        Self {
            repository,
            tokens,
            policy,
        }
    }

    pub async fn register(&self, req: &RegisterRequest, now: u64) -> RegisterResponse {
        let failure = |result| RegisterResponse {
            result,
            user_id: None,
            username: req.username.clone(),
        };

        if !is_valid_username(&req.username) || !req.email.contains('@') {
            return failure(RegisterResult::InvalidUsername);
        }

        if req.password != req.confirm {
            return failure(RegisterResult::PasswordMismatch);
        }

        if req.password.len() < self.policy.min_password_len {
            return failure(RegisterResult::PasswordTooShort);
        }

        match self.repository.find_by_username(&req.username).await {
            Ok(Some(_)) => return failure(RegisterResult::UsernameTaken),
            Ok(None) => {}
            Err(e) => {
                warn!("register lookup failed: {e}");
                return failure(RegisterResult::InternalError);
            }
        }

        match self.repository.find_by_email(&req.email).await {
            Ok(Some(_)) => return failure(RegisterResult::EmailTaken),
            Ok(None) => {}
            Err(e) => {
                warn!("register lookup failed: {e}");
                return failure(RegisterResult::InternalError);
            }
        }

        let password_hash = match hash_password(&req.password) {
            Ok(h) => h,
            Err(e) => {
                warn!("password hashing failed: {e}");
                return failure(RegisterResult::InternalError);
            }
        };

        let account = Account {
            user_id: Uuid::new_v4(),
            username: req.username.clone(),
            email: req.email.clone(),
            password_hash,
            metadata: "{}".to_owned(),
            created_at: now,
            last_login: None,
        };
        let user_id = account.user_id;

        match self.repository.create_account(account).await {
            Ok(()) => {
                info!(username = %req.username, %user_id, "account registered");
                RegisterResponse {
                    result: RegisterResult::Success,
                    user_id: Some(user_id),
                    username: req.username.clone(),
                }
            }
            Err(crate::repository::RepositoryError::Duplicate { field: "email" }) => {
                failure(RegisterResult::EmailTaken)
            }
            Err(crate::repository::RepositoryError::Duplicate { .. }) => {
                failure(RegisterResult::UsernameTaken)
            }
            Err(e) => {
                warn!("account creation failed: {e}");
                failure(RegisterResult::InternalError)
            }
        }
    }

    pub async fn login(&self, req: &LoginRequest, ip: IpAddr, now: u64) -> LoginResponse {
        let decision = self.consult_rate_limiter(ip, now).await;

        if decision.limited {
            warn!(%ip, attempts = decision.attempts, "login rate limited");
            return LoginResponse {
                result: LoginResult::RateLimited,
                token: String::new(),
                expires_at: 0,
                retry_after_secs: decision.retry_after_secs,
            };
        }

        let account = if req.identifier.contains('@') {
            self.repository.find_by_email(&req.identifier).await
        } else {
            self.repository.find_by_username(&req.identifier).await
        };

        let account = match account {
            Ok(account) => account,
            Err(e) => {
                warn!("login lookup failed: {e}");
                return LoginResponse {
                    result: LoginResult::InternalError,
                    token: String::new(),
                    expires_at: 0,
                    retry_after_secs: 0,
                };
            }
        };

        let verified = match &account {
            Some(account) => {
                verify_password(&req.password, &account.password_hash).unwrap_or(false)
            }
            // Unknown identifier; the KDF was skipped, and that is the
            // timing difference we accept: the comparison itself never
            // short-circuits on content.
            None => false,
        };

        self.record_attempt(ip, &req.identifier, verified, now).await;

        let Some(account) = account.filter(|_| verified) else {
            return LoginResponse {
                result: LoginResult::InvalidCredentials,
                token: String::new(),
                expires_at: 0,
                retry_after_secs: 0,
            };
        };

        if let Err(e) = self
            .repository
            .update_last_login(account.user_id, now)
            .await
        {
            warn!("failed to update last login: {e}");
        }

        let (token, expires_at) = self.tokens.issue(account.user_id, &account.username, now);
        info!(username = %account.username, %ip, "login succeeded");

        LoginResponse {
            result: LoginResult::Success,
            token,
            expires_at,
            retry_after_secs: 0,
        }
    }

    pub async fn validate_token(
        &self,
        req: &TokenValidationRequest,
        now: u64,
    ) -> TokenValidationResponse {
        match self.tokens.verify(&req.token, now) {
            Ok(claims) => TokenValidationResponse {
                valid: true,
                user_id: Some(claims.sub),
                username: claims.name,
                expires_at: claims.exp,
                error: String::new(),
            },
            Err(e) => TokenValidationResponse {
                valid: false,
                user_id: None,
                username: String::new(),
                expires_at: 0,
                error: e.to_string(),
            },
        }
    }

    /// Delegates audit-log cleanup to the repository.
    pub async fn cleanup_attempts(
        &self,
        now: u64,
        older_than: Duration,
    ) -> Result<u64, crate::repository::RepositoryError> {
        self.repository.cleanup_attempts(now, older_than).await
    }

    /// The limiter fails open: if storage cannot answer, logins proceed.
    async fn consult_rate_limiter(&self, ip: IpAddr, now: u64) -> RateLimitDecision {
        match self
            .repository
            .check_rate_limit(
                ip,
                now,
                self.policy.rate_limit_window,
                self.policy.rate_limit_max_attempts,
            )
            .await
        {
            Ok(decision) => decision,
            Err(e) => {
                warn!("rate limiter unavailable, failing open: {e}");
                RateLimitDecision::unlimited(0)
            }
        }
    }

    async fn record_attempt(&self, ip: IpAddr, identifier: &str, success: bool, now: u64) {
        let attempt = LoginAttempt {
            ip,
            identifier: identifier.to_owned(),
            success,
            at: now,
        };

        if let Err(e) = self.repository.record_login_attempt(attempt).await {
            warn!("failed to record login attempt: {e}");
        }
    }
}

fn is_valid_username(username: &str) -> bool {
    let len = username.chars().count();

    (3..=24).contains(&len)
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}
