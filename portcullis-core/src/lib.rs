//! Core functionality for the portcullis project
//!
//! This crate decides whether a login attempt may proceed and manages the
//! sessions that follow a successful one. It contains:
//!
//! - the [`CounterStore`] abstraction and an in-memory implementation;
//! - the [`LoginSecurityService`], which tracks failures per identifier and per
//!   IP and derives lockouts, IP blocks, progressive delays, captcha
//!   requirements and a risk score;
//! - the [`SecurityContextAssembler`], which turns those reads into one
//!   fail-closed [`SecurityContext`];
//! - the [`SessionManager`], which creates, validates, refreshes and destroys
//!   sessions and remember-me tokens.
//!
//! Storage backends live in their own crates and implement [`CounterStore`].
//! Applications normally use the `portcullis` crate, which wires these pieces
//! together behind a builder.
pub mod clock;
pub mod collaborators;
pub mod config;
pub mod crypto;
pub mod device;
pub mod error;
pub mod keys;
pub mod security;
pub mod services;
pub mod session;
pub mod storage;
pub mod user;

pub use clock::{Clock, ManualClock, SystemClock};
pub use collaborators::{CaptchaVerifier, CredentialCheck, CredentialVerifier, UserLookup};
pub use config::{DelayPolicy, IpChangePolicy, LoginSecurityConfig, RiskWeights, SessionConfig, StoreConfig};
pub use error::Error;
pub use security::{
    AttemptOutcome, DelayInfo, DeviceRecord, FailureReason, IpBlockInfo, LockoutInfo,
    SecurityContext, SuspiciousActivity,
};
pub use services::{LoginSecurityService, SecurityContextAssembler, SessionManager};
pub use session::{
    CreatedSession, DestroyedSessions, LoginType, RefreshedSession, RememberMeToken,
    RememberMeValidation, RequestContext, SecurityLevel, Session, SessionId, SessionOptions,
    SessionValidation,
};
pub use storage::{CounterSnapshot, CounterStore, MemoryCounterStore, StoreClient, StoreKind};
pub use user::{UserId, UserRecord};
