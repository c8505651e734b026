use std::sync::Arc;

use crate::security::SecurityContext;

use super::LoginSecurityService;

/// Builds the security context handed to the login route.
///
/// Assembling only reads: it can be called any number of times for the same
/// request without changing a counter. When the store cannot be read the
/// assembler fails closed and returns [`SecurityContext::fail_closed`], trading
/// availability for the guarantee that no password is checked while the
/// lockout state is unknown.
#[derive(Clone)]
pub struct SecurityContextAssembler {
    engine: Arc<LoginSecurityService>,
}

impl SecurityContextAssembler {
    pub fn new(engine: Arc<LoginSecurityService>) -> Self {
        Self { engine }
    }

    pub async fn assemble(&self, ip: &str, identifier: &str, device_fingerprint: &str) -> SecurityContext {
        match self
            .engine
            .get_security_context(ip, identifier, device_fingerprint)
            .await
        {
            Ok(context) => context,
            Err(e) => {
                tracing::error!(
                    ip,
                    identifier,
                    error = %e,
                    "Could not read login security state, failing closed"
                );
                SecurityContext::fail_closed()
            }
        }
    }
}
