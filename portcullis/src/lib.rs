//! # Portcullis
//!
//! Portcullis guards the login route of a Rust application. Before a password
//! is ever checked it decides whether the attempt may proceed, and after a
//! successful one it owns the session that follows.
//!
//! With Portcullis you get:
//! - Per-identifier lockout after repeated failures
//! - Per-IP blocking that aggregates failures across every identifier
//! - Progressive delays and captcha escalation
//! - New-device detection and a 0..=100 risk score
//! - Opaque sessions with remember-me tokens, IP change policy and "log out everywhere"
//!
//! Password storage, user accounts and captcha providers stay in your
//! application. Plug them in through [`CredentialVerifier`], [`UserLookup`] and
//! [`CaptchaVerifier`]. A captcha verifier is required unless captcha
//! escalation is turned off with `captcha_threshold: 0`.
//!
//! ## Storage Support
//!
//! - In-memory (single process, tests)
//! - SQLite (durable, feature `sqlite`)
//! - Redis / Dragonfly (fast primary store, feature `redis`)
//!
//! When no primary store is configured the durable store serves every request.
//!
//! ## Failing closed
//!
//! If the store cannot be read, every login is refused with
//! [`LoginError::Unavailable`]. Portcullis never checks a password while the
//! lockout state is unknown.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use portcullis::{LoginRequest, PortcullisBuilder, RequestContext};
//! # use portcullis::{CaptchaVerifier, CredentialVerifier, UserLookup};
//!
//! # async fn example(
//! #     verifier: Arc<dyn CredentialVerifier>,
//! #     users: Arc<dyn UserLookup>,
//! #     captcha: Arc<dyn CaptchaVerifier>,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let portcullis = PortcullisBuilder::new()
//!     .with_sqlite("sqlite://auth.db")
//!     .await?
//!     .apply_migrations(true)
//!     .with_captcha_verifier(captcha)
//!     .build(verifier, users)
//!     .await?;
//!
//! let context = RequestContext::new("203.0.113.7").with_user_agent("Mozilla/5.0");
//! let login = portcullis
//!     .login(LoginRequest::new("user@example.com", "hunter2", context))
//!     .await?;
//! println!("session expires at {}", login.session.expires_at);
//! # Ok(())
//! # }
//! ```
use std::sync::Arc;

use chrono::Duration;
use portcullis_core::{
    device::generate_device_fingerprint, services::login_security::NEW_DEVICE_REASON,
};
use serde::Serialize;

mod builder;

pub use builder::{NoStore, PortcullisBuilder, PortcullisBuilderError, WithStore};

/// Re-export core types from portcullis_core
///
/// These types are commonly used when working with the Portcullis API.
pub use portcullis_core::{
    CaptchaVerifier, Clock, CounterStore, CreatedSession, CredentialCheck, CredentialVerifier,
    DestroyedSessions, Error, FailureReason, IpChangePolicy, LoginSecurityConfig,
    LoginSecurityService, LoginType, ManualClock, MemoryCounterStore, RequestContext,
    SecurityContext, SecurityContextAssembler, Session, SessionConfig, SessionId, SessionManager,
    SessionOptions, SessionValidation, StoreClient, StoreConfig, StoreKind, SuspiciousActivity,
    SystemClock, UserId, UserLookup, UserRecord,
};

/// Re-export store backends
///
/// These store implementations are available when the corresponding feature is enabled.
#[cfg(feature = "sqlite")]
pub mod sqlite {
    pub use portcullis_storage_sqlite::SqliteCounterStore;
}

#[cfg(feature = "redis")]
pub mod redis {
    pub use portcullis_storage_redis::RedisCounterStore;
}

/// Errors from session and administrative operations.
#[derive(Debug, thiserror::Error)]
pub enum PortcullisError {
    /// The presented session is missing, expired or rejected
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),
    #[error(transparent)]
    Core(#[from] Error),
}

/// Why a login was refused.
///
/// Lockout variants tell the client how long to wait. Credential failures are
/// always the generic [`LoginError::InvalidCredentials`], whatever went wrong.
#[derive(Debug, thiserror::Error)]
pub enum LoginError {
    #[error("Account temporarily locked, try again in {} seconds", .remaining.num_seconds())]
    Locked { remaining: Duration },

    #[error("Too many attempts from this address, try again in {} seconds", .remaining.num_seconds())]
    IpBlocked { remaining: Duration },

    #[error("Too many attempts, try again in {} ms", .retry_after.num_milliseconds())]
    RateLimited { retry_after: Duration },

    #[error("Captcha required")]
    CaptchaRequired,

    #[error("Invalid credentials")]
    InvalidCredentials,

    /// The security state could not be read, so the login was refused
    #[error("Login temporarily unavailable")]
    Unavailable,

    #[error(transparent)]
    Internal(Error),
}

impl From<Error> for LoginError {
    fn from(error: Error) -> Self {
        if error.is_store_unavailable() {
            LoginError::Unavailable
        } else {
            LoginError::Internal(error)
        }
    }
}

/// A login attempt as received by the login route.
#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub identifier: String,
    pub password: String,
    pub context: RequestContext,
    pub captcha_token: Option<String>,
    pub remember_me: bool,
}

impl LoginRequest {
    pub fn new(
        identifier: impl Into<String>,
        password: impl Into<String>,
        context: RequestContext,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            password: password.into(),
            context,
            captcha_token: None,
            remember_me: false,
        }
    }

    pub fn with_captcha_token(mut self, token: impl Into<String>) -> Self {
        self.captcha_token = Some(token.into());
        self
    }

    pub fn with_remember_me(mut self, remember_me: bool) -> Self {
        self.remember_me = remember_me;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoginSuccess {
    pub user_id: UserId,
    pub session: CreatedSession,
    /// The context the attempt was admitted under. Absent for remember-me logins.
    pub security_context: Option<SecurityContext>,
    /// Set when the login came from a device never seen for this user.
    pub new_device: bool,
}

/// The central coordinator of login security and sessions.
///
/// Build one with [`PortcullisBuilder`] and share it across request handlers.
pub struct Portcullis {
    store: StoreClient,
    security: Arc<LoginSecurityService>,
    assembler: SecurityContextAssembler,
    sessions: Arc<SessionManager>,
    credentials: Arc<dyn CredentialVerifier>,
    users: Arc<dyn UserLookup>,
    captcha: Option<Arc<dyn CaptchaVerifier>>,
    clock: Arc<dyn Clock>,
}

impl Portcullis {
    pub(crate) fn from_builder(
        store: StoreClient,
        login_security_config: LoginSecurityConfig,
        session_config: SessionConfig,
        clock: Arc<dyn Clock>,
        credentials: Arc<dyn CredentialVerifier>,
        users: Arc<dyn UserLookup>,
        captcha: Option<Arc<dyn CaptchaVerifier>>,
    ) -> Self {
        let security = Arc::new(LoginSecurityService::new(
            store.clone(),
            login_security_config,
            clock.clone(),
        ));
        let sessions = Arc::new(SessionManager::new(
            store.clone(),
            session_config,
            clock.clone(),
        ));

        Self {
            store,
            assembler: SecurityContextAssembler::new(security.clone()),
            security,
            sessions,
            credentials,
            users,
            captcha,
            clock,
        }
    }

    /// The login security engine, for admin operations and custom flows.
    pub fn security(&self) -> &Arc<LoginSecurityService> {
        &self.security
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Which kind of store was selected at build time.
    pub fn store_kind(&self) -> StoreKind {
        self.store.kind()
    }

    /// Read the security context for an upcoming attempt without recording anything.
    pub async fn security_context(&self, identifier: &str, context: &RequestContext) -> SecurityContext {
        let fingerprint = generate_device_fingerprint(context);
        self.assembler
            .assemble(&context.ip, identifier, &fingerprint)
            .await
    }

    /// Run a password login through every gate.
    ///
    /// The order is fixed: lockout, IP block, delay, captcha, credentials.
    /// Only a verified password creates a session.
    pub async fn login(&self, request: LoginRequest) -> Result<LoginSuccess, LoginError> {
        let LoginRequest {
            identifier,
            password,
            context,
            captcha_token,
            remember_me,
        } = request;
        let ip = context.ip.as_str();
        let fingerprint = generate_device_fingerprint(&context);

        let security_context = self.assembler.assemble(ip, &identifier, &fingerprint).await;
        self.check_gates(&security_context)?;

        if security_context.requires_captcha {
            self.check_captcha(ip, &identifier, captcha_token.as_deref())
                .await?;
        }

        let reason = match self.credentials.verify(&identifier, &password).await? {
            CredentialCheck::Valid => None,
            CredentialCheck::InvalidPassword => Some(FailureReason::InvalidPassword),
            CredentialCheck::UnknownIdentifier => Some(FailureReason::InvalidIdentifier),
        };
        if let Some(reason) = reason {
            self.record_failure(ip, &identifier, reason).await?;
            return Err(LoginError::InvalidCredentials);
        }

        let Some(user) = self.users.find_user(&identifier).await? else {
            tracing::warn!(identifier = %identifier, "Credentials verified but no user found for identifier");
            self.record_failure(ip, &identifier, FailureReason::InvalidIdentifier)
                .await?;
            return Err(LoginError::InvalidCredentials);
        };

        // Novelty must be read before the success registers the device.
        let suspicious = self
            .security
            .check_suspicious_activity(ip, &identifier, &fingerprint, &user.id)
            .await?;
        let new_device = suspicious.reason.as_deref() == Some(NEW_DEVICE_REASON);

        self.security
            .record_successful_login(ip, &identifier, &user.id, Some(&fingerprint))
            .await?;

        let session = self
            .sessions
            .create_session(
                &user.id,
                &context,
                SessionOptions::default().with_remember_me(remember_me),
            )
            .await?;

        tracing::info!(
            user_id = %user.id,
            ip,
            new_device,
            remember_me,
            "Login succeeded"
        );

        Ok(LoginSuccess {
            user_id: user.id,
            session,
            security_context: Some(security_context),
            new_device,
        })
    }

    /// Start a new session from a remember-me token.
    ///
    /// The token must be presented from the device it was issued to.
    pub async fn login_with_remember_me(
        &self,
        token: &str,
        context: &RequestContext,
    ) -> Result<LoginSuccess, LoginError> {
        let ip_block = match self.security.get_ip_block_info(&context.ip).await {
            Ok(info) => info,
            Err(e) => {
                tracing::error!(ip = %context.ip, error = %e, "Could not read IP block state, failing closed");
                return Err(LoginError::Unavailable);
            }
        };
        if ip_block.is_blocked {
            return Err(LoginError::IpBlocked {
                remaining: ip_block.remaining_time,
            });
        }

        let validation = self.sessions.validate_remember_me_token(token).await?;
        let (Some(user_id), Some(device_fingerprint)) = (validation.user_id, validation.device_fingerprint)
        else {
            tracing::debug!(ip = %context.ip, reason = ?validation.reason, "Remember-me token rejected");
            return Err(LoginError::InvalidCredentials);
        };

        if device_fingerprint != generate_device_fingerprint(context) {
            tracing::warn!(
                user_id = %user_id,
                ip = %context.ip,
                "Remember-me token presented from a different device"
            );
            return Err(LoginError::InvalidCredentials);
        }

        let session = self
            .sessions
            .create_session(&user_id, context, self.sessions.remember_me_session_options())
            .await?;

        tracing::info!(user_id = %user_id, ip = %context.ip, "Login from remember-me token succeeded");

        Ok(LoginSuccess {
            user_id,
            session,
            security_context: None,
            new_device: false,
        })
    }

    /// Validate a session for a request, as authentication middleware would.
    pub async fn authenticate(
        &self,
        session_id: &SessionId,
        context: &RequestContext,
    ) -> Result<SessionValidation, PortcullisError> {
        let validation = self.sessions.validate_session(session_id, context).await?;
        if validation.valid {
            Ok(validation)
        } else {
            Err(PortcullisError::Unauthenticated(
                validation
                    .reason
                    .unwrap_or_else(|| SessionValidation::NOT_FOUND_OR_EXPIRED.to_string()),
            ))
        }
    }

    /// End one session, and revoke the remember-me token issued with it if given.
    pub async fn logout(
        &self,
        session_id: &SessionId,
        remember_me_token: Option<&str>,
    ) -> Result<DestroyedSessions, PortcullisError> {
        if let Some(token) = remember_me_token {
            self.sessions.revoke_remember_me_token(token).await?;
        }
        Ok(self.sessions.destroy_session(session_id, "logout").await?)
    }

    /// End every session of a user.
    pub async fn logout_everywhere(&self, user_id: &UserId) -> Result<DestroyedSessions, PortcullisError> {
        Ok(self
            .sessions
            .destroy_user_sessions(user_id, "logout everywhere")
            .await?)
    }

    pub async fn get_user_sessions(&self, user_id: &UserId) -> Result<Vec<Session>, PortcullisError> {
        Ok(self.sessions.get_user_sessions(user_id).await?)
    }

    /// Apply store migrations. A no-op for stores without a schema.
    pub async fn migrate(&self) -> Result<(), PortcullisError> {
        Ok(self.store.migrate().await?)
    }

    pub async fn health_check(&self) -> Result<(), PortcullisError> {
        Ok(self.store.health_check().await?)
    }

    /// Start the background session cleanup task.
    ///
    /// Every `interval` the task removes expired sessions and their index
    /// entries. It stops when `shutdown` changes.
    pub fn start_cleanup_task(
        &self,
        interval: std::time::Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let sessions = Arc::clone(&self.sessions);

        tokio::spawn(async move {
            let mut interval_timer = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    _ = interval_timer.tick() => {
                        match sessions.cleanup_expired_sessions().await {
                            Ok(count) if count > 0 => {
                                tracing::info!(count, "Cleaned up expired sessions");
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "Failed to clean up expired sessions");
                            }
                            _ => {}
                        }
                    }
                    _ = shutdown.changed() => {
                        tracing::info!("Shutting down session cleanup task");
                        break;
                    }
                }
            }
        })
    }

    fn check_gates(&self, context: &SecurityContext) -> Result<(), LoginError> {
        if context.degraded {
            return Err(LoginError::Unavailable);
        }

        let now = self.clock.now();
        let remaining_until = |until: Option<chrono::DateTime<chrono::Utc>>| {
            until.map_or(Duration::zero(), |until| (until - now).max(Duration::zero()))
        };

        if context.is_locked {
            return Err(LoginError::Locked {
                remaining: remaining_until(context.locked_until),
            });
        }
        if context.is_ip_blocked {
            return Err(LoginError::IpBlocked {
                remaining: remaining_until(context.ip_blocked_until),
            });
        }
        if context.retry_after_ms > 0 {
            return Err(LoginError::RateLimited {
                retry_after: Duration::milliseconds(
                    i64::try_from(context.retry_after_ms).unwrap_or(i64::MAX),
                ),
            });
        }
        Ok(())
    }

    async fn check_captcha(
        &self,
        ip: &str,
        identifier: &str,
        token: Option<&str>,
    ) -> Result<(), LoginError> {
        let Some(verifier) = &self.captcha else {
            tracing::error!(identifier, "Captcha due but no captcha verifier configured");
            return Err(LoginError::CaptchaRequired);
        };
        let Some(token) = token else {
            return Err(LoginError::CaptchaRequired);
        };

        if verifier.verify(token, ip).await? {
            Ok(())
        } else {
            self.record_failure(ip, identifier, FailureReason::CaptchaFailed)
                .await?;
            Err(LoginError::CaptchaRequired)
        }
    }

    /// Record a failed attempt.
    ///
    /// An attempt that cannot be counted turns the refusal into
    /// [`LoginError::Unavailable`].
    async fn record_failure(
        &self,
        ip: &str,
        identifier: &str,
        reason: FailureReason,
    ) -> Result<(), LoginError> {
        self.security
            .record_failed_attempt(ip, identifier, reason)
            .await
            .map(|_| ())
            .map_err(|e| {
                tracing::error!(
                    ip,
                    identifier,
                    reason = %reason,
                    error = %e,
                    "Failed to record failed login attempt"
                );
                LoginError::Unavailable
            })
    }
}
