//! Session lifecycle: create, validate, refresh, list and destroy.
//!
//! Sessions are JSON records under `session:<id>` with a store TTL equal to
//! their max age, plus a per-user index set used for listing and "log out
//! everywhere". Index entries may outlive the records they point to; readers
//! drop them lazily and [`SessionManager::cleanup_expired_sessions`] sweeps the
//! rest.
//!
//! Refreshing a session extends its expiry but keeps its id. Callers that want
//! id rotation should destroy and create.
//!
//! Remember-me tokens have their own lifecycle. Only a SHA256 hash of the
//! token is stored; the plaintext is returned once at creation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    Error,
    clock::Clock,
    config::{IpChangePolicy, SessionConfig},
    crypto::{generate_secure_token, hash_token, is_well_formed_token, verify_token_hash},
    device::{generate_device_fingerprint, is_same_network},
    error::{SessionError, StorageError},
    session::{
        CreatedSession, DestroyedSessions, LoginType, RefreshedSession, RememberMeToken,
        RememberMeValidation, RequestContext, Session, SessionId, SessionOptions,
        SessionValidation,
    },
    storage::StoreClient,
    user::UserId,
};

/// Stored payload of a remember-me token.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RememberMeRecord {
    token_hash: String,
    user_id: UserId,
    device_fingerprint: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

pub struct SessionManager {
    store: StoreClient,
    config: SessionConfig,
    clock: Arc<dyn Clock>,
}

impl SessionManager {
    pub fn new(store: StoreClient, config: SessionConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            config,
            clock,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn generate_session_id(&self) -> Result<SessionId, Error> {
        SessionId::generate()
    }

    pub fn generate_device_fingerprint(&self, context: &RequestContext) -> String {
        generate_device_fingerprint(context)
    }

    /// Whether moving from `old_ip` to `new_ip` stays inside the configured network segment.
    pub fn is_ip_change_allowed(&self, old_ip: &str, new_ip: &str) -> bool {
        is_same_network(
            old_ip,
            new_ip,
            self.config.ipv4_prefix,
            self.config.ipv6_prefix,
        )
    }

    /// Create a session for `user_id` bound to the device in `context`.
    pub async fn create_session(
        &self,
        user_id: &UserId,
        context: &RequestContext,
        options: SessionOptions,
    ) -> Result<CreatedSession, Error> {
        let now = self.clock.now();
        let max_age = self.config.clamp_max_age(options.max_age);
        let session = Session {
            id: self.generate_session_id()?,
            user_id: user_id.clone(),
            device_fingerprint: generate_device_fingerprint(context),
            ip_address: context.ip.clone(),
            user_agent: context.user_agent.clone(),
            login_type: options.login_type,
            security_level: options.effective_security_level(),
            remember_me: options.remember_me,
            created_at: now,
            updated_at: now,
            expires_at: now + max_age,
            max_age,
        };

        let keys = self.store.keys();
        let session_key = keys.session(session.id.as_str());
        let created = self
            .store
            .set_json_if_absent(&session_key, &session, max_age)
            .await?;
        if !created {
            return Err(StorageError::Constraint("session id already in use".to_string()).into());
        }

        let indexed = self
            .store
            .add_to_set(
                &keys.user_sessions(user_id.as_str()),
                session.id.as_str(),
                max_age,
            )
            .await;
        let remember_me_token = match indexed {
            Ok(()) if options.remember_me => self
                .create_remember_me_token(user_id, context)
                .await
                .map(Some),
            Ok(()) => Ok(None),
            Err(e) => Err(e),
        };
        let remember_me_token = match remember_me_token {
            Ok(token) => token,
            Err(e) => {
                self.discard_session(&session_key, &session).await;
                return Err(e);
            }
        };

        tracing::info!(
            user_id = %user_id,
            session = %session.id.redacted(),
            ip = %context.ip,
            login_type = ?session.login_type,
            max_age_secs = max_age.num_seconds(),
            "Session created"
        );

        Ok(CreatedSession {
            session_id: session.id,
            expires_at: session.expires_at,
            max_age,
            device_fingerprint: session.device_fingerprint,
            remember_me_token,
        })
    }

    /// Remove a session whose creation failed part way.
    async fn discard_session(&self, session_key: &str, session: &Session) {
        let index = self.store.keys().user_sessions(session.user_id.as_str());
        let removed = match self.store.delete(session_key).await {
            Ok(_) => self
                .store
                .remove_from_set(&index, session.id.as_str())
                .await
                .map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = removed {
            tracing::error!(
                user_id = %session.user_id,
                session = %session.id.redacted(),
                error = %e,
                "Failed to remove partially created session"
            );
        }
    }

    /// Read a session, treating records past `expires_at` as gone.
    ///
    /// Expired records still present in the store are deleted on the way out.
    async fn load_live_session(&self, session_id: &SessionId) -> Result<Option<Session>, Error> {
        let keys = self.store.keys();
        let Some(session) = self
            .store
            .get_json::<Session>(&keys.session(session_id.as_str()))
            .await?
        else {
            return Ok(None);
        };

        if session.is_expired(self.clock.now()) {
            self.store.delete(&keys.session(session_id.as_str())).await?;
            self.store
                .remove_from_set(
                    &keys.user_sessions(session.user_id.as_str()),
                    session_id.as_str(),
                )
                .await?;
            return Ok(None);
        }
        Ok(Some(session))
    }

    pub async fn validate_session(
        &self,
        session_id: &SessionId,
        context: &RequestContext,
    ) -> Result<SessionValidation, Error> {
        let Some(session) = self.load_live_session(session_id).await? else {
            return Ok(SessionValidation::not_found_or_expired());
        };

        let ip_changed = session.ip_address != context.ip;
        let ip_change_allowed =
            !ip_changed || self.is_ip_change_allowed(&session.ip_address, &context.ip);

        if ip_changed && !ip_change_allowed {
            match self.config.ip_change_policy {
                IpChangePolicy::Reject => {
                    tracing::warn!(
                        user_id = %session.user_id,
                        session = %session_id.redacted(),
                        old_ip = %session.ip_address,
                        new_ip = %context.ip,
                        "Rejected session presented from another network"
                    );
                    return Ok(SessionValidation::invalid(
                        SessionValidation::IP_CHANGE_REJECTED,
                    ));
                }
                IpChangePolicy::Flag => {
                    tracing::warn!(
                        user_id = %session.user_id,
                        session = %session_id.redacted(),
                        old_ip = %session.ip_address,
                        new_ip = %context.ip,
                        "Session presented from another network"
                    );
                }
                IpChangePolicy::Allow => {}
            }
        }

        let fingerprint_changed = generate_device_fingerprint(context) != session.device_fingerprint;

        Ok(SessionValidation {
            valid: true,
            user_id: Some(session.user_id.clone()),
            session: Some(session),
            reason: None,
            ip_changed,
            ip_change_allowed,
            fingerprint_changed,
        })
    }

    /// Extend a live session's expiry. The id does not change.
    ///
    /// Without a requested max age the session keeps the lifetime it was granted.
    /// The write only lands if the record still exists, so a session destroyed
    /// mid-refresh stays destroyed.
    pub async fn refresh_session(
        &self,
        session_id: &SessionId,
        context: &RequestContext,
        options: SessionOptions,
    ) -> Result<RefreshedSession, Error> {
        let Some(mut session) = self.load_live_session(session_id).await? else {
            return Err(SessionError::NotFoundOrExpired.into());
        };

        let now = self.clock.now();
        let max_age = self
            .config
            .clamp_max_age(options.max_age.or(Some(session.max_age)));
        session.max_age = max_age;
        session.updated_at = now;
        session.expires_at = now + max_age;

        let keys = self.store.keys();
        let updated = self
            .store
            .set_json_if_present(&keys.session(session_id.as_str()), &session, max_age)
            .await?;
        if !updated {
            return Err(SessionError::NotFoundOrExpired.into());
        }
        self.store
            .add_to_set(
                &keys.user_sessions(session.user_id.as_str()),
                session_id.as_str(),
                max_age,
            )
            .await?;

        tracing::debug!(
            session = %session_id.redacted(),
            ip = %context.ip,
            expires_at = %session.expires_at,
            "Session refreshed"
        );

        Ok(RefreshedSession {
            session_id: session.id,
            expires_at: session.expires_at,
            max_age,
        })
    }

    /// Destroy a session. Destroying a session that is already gone reports zero.
    pub async fn destroy_session(
        &self,
        session_id: &SessionId,
        reason: &str,
    ) -> Result<DestroyedSessions, Error> {
        let keys = self.store.keys();
        let key = keys.session(session_id.as_str());

        let owner = self
            .store
            .get_json::<Session>(&key)
            .await?
            .map(|session| session.user_id);
        let deleted = self.store.delete(&key).await?;

        if let Some(user_id) = &owner {
            self.store
                .remove_from_set(&keys.user_sessions(user_id.as_str()), session_id.as_str())
                .await?;
        }

        if deleted {
            tracing::info!(
                session = %session_id.redacted(),
                user_id = ?owner.as_ref().map(UserId::as_str),
                reason,
                "Session destroyed"
            );
        }

        Ok(DestroyedSessions {
            destroyed: u64::from(deleted),
        })
    }

    /// Destroy every session of a user.
    pub async fn destroy_user_sessions(
        &self,
        user_id: &UserId,
        reason: &str,
    ) -> Result<DestroyedSessions, Error> {
        let index = self.store.keys().user_sessions(user_id.as_str());
        let mut destroyed = 0;
        for id in self.store.set_members(&index).await? {
            destroyed += self
                .destroy_session(&SessionId::from(id), reason)
                .await?
                .destroyed;
        }
        self.store.delete(&index).await?;

        tracing::info!(user_id = %user_id, destroyed, reason, "Destroyed all sessions for user");
        Ok(DestroyedSessions { destroyed })
    }

    /// Live sessions of a user, newest first.
    pub async fn get_user_sessions(&self, user_id: &UserId) -> Result<Vec<Session>, Error> {
        let index = self.store.keys().user_sessions(user_id.as_str());
        let mut sessions = Vec::new();

        for id in self.store.set_members(&index).await? {
            match self.load_live_session(&SessionId::from(id.as_str())).await? {
                Some(session) => sessions.push(session),
                None => {
                    self.store.remove_from_set(&index, &id).await?;
                }
            }
        }

        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }

    /// Remove expired session records and index entries pointing at sessions that no longer exist.
    ///
    /// Returns the number of expired session records and index entries removed.
    /// Every step is idempotent, so concurrent runs and live traffic only ever
    /// race to remove the same things.
    pub async fn cleanup_expired_sessions(&self) -> Result<u64, Error> {
        let now = self.clock.now();
        let keys = self.store.keys();

        let mut cleaned = self.store.purge_expired(&keys.session_prefix()).await?;

        for key in self.store.scan_prefix(&keys.session_prefix()).await? {
            let expired = match self.store.get_json::<Session>(&key).await? {
                Some(session) => session.is_expired(now),
                None => false,
            };
            if expired && self.store.delete(&key).await? {
                cleaned += 1;
            }
        }

        let index_prefix = keys.user_sessions_prefix();
        for index in self.store.scan_prefix(&index_prefix).await? {
            for id in self.store.set_members(&index).await? {
                let live = match self.store.get_json::<Session>(&keys.session(&id)).await? {
                    Some(session) => !session.is_expired(now),
                    None => false,
                };
                if !live && self.store.remove_from_set(&index, &id).await? {
                    cleaned += 1;
                }
            }
        }

        if cleaned > 0 {
            tracing::info!(cleaned, "Cleaned up expired sessions");
        }
        Ok(cleaned)
    }

    /// Mint a remember-me token for the user and device in `context`.
    pub async fn create_remember_me_token(
        &self,
        user_id: &UserId,
        context: &RequestContext,
    ) -> Result<RememberMeToken, Error> {
        let now = self.clock.now();
        let lifetime = self.config.remember_me_max_age;
        let token = generate_secure_token()?;
        let token_hash = hash_token(&token);
        let record = RememberMeRecord {
            token_hash: token_hash.clone(),
            user_id: user_id.clone(),
            device_fingerprint: generate_device_fingerprint(context),
            created_at: now,
            expires_at: now + lifetime,
        };

        let created = self
            .store
            .set_json_if_absent(&self.store.keys().remember_me(&token_hash), &record, lifetime)
            .await?;
        if !created {
            return Err(StorageError::Constraint("remember-me token already in use".to_string()).into());
        }

        tracing::info!(user_id = %user_id, ip = %context.ip, "Remember-me token created");
        Ok(RememberMeToken {
            token,
            expires_at: record.expires_at,
        })
    }

    pub async fn validate_remember_me_token(&self, token: &str) -> Result<RememberMeValidation, Error> {
        if !is_well_formed_token(token) {
            return Ok(RememberMeValidation::invalid("malformed token"));
        }

        let key = self.store.keys().remember_me(&hash_token(token));
        let Some(record) = self.store.get_json::<RememberMeRecord>(&key).await? else {
            return Ok(RememberMeValidation::invalid(
                SessionValidation::NOT_FOUND_OR_EXPIRED,
            ));
        };

        if !verify_token_hash(token, &record.token_hash) {
            return Ok(RememberMeValidation::invalid(
                SessionValidation::NOT_FOUND_OR_EXPIRED,
            ));
        }
        if self.clock.now() >= record.expires_at {
            self.store.delete(&key).await?;
            return Ok(RememberMeValidation::invalid(
                SessionValidation::NOT_FOUND_OR_EXPIRED,
            ));
        }

        Ok(RememberMeValidation {
            valid: true,
            user_id: Some(record.user_id),
            device_fingerprint: Some(record.device_fingerprint),
            expires_at: Some(record.expires_at),
            reason: None,
        })
    }

    /// Revoke a remember-me token. Returns whether it existed.
    pub async fn revoke_remember_me_token(&self, token: &str) -> Result<bool, Error> {
        if !is_well_formed_token(token) {
            return Ok(false);
        }
        let revoked = self
            .store
            .delete(&self.store.keys().remember_me(&hash_token(token)))
            .await?;
        if revoked {
            tracing::info!("Remember-me token revoked");
        }
        Ok(revoked)
    }

    /// Options for a session minted from a remember-me token.
    pub fn remember_me_session_options(&self) -> SessionOptions {
        SessionOptions::default().with_login_type(LoginType::RememberMe)
    }
}
