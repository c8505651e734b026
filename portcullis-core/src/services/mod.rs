//! Service layer
//!
//! The services hold a [`StoreClient`](crate::storage::StoreClient), their
//! configuration and a clock. They are constructed once and shared via `Arc`;
//! none of them keeps state outside the store.

pub mod login_security;
pub mod security_context;
pub mod session;

pub use login_security::LoginSecurityService;
pub use security_context::SecurityContextAssembler;
pub use session::SessionManager;
