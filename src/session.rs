//! Session identity.
//!
//! A *session* binds one logical client to one transport instance,
//! starting from the `initialize` handshake. The id travels in the
//! `mcp-session-id` header on every request and response; in stateless
//! mode no id is ever assigned or advertised.

use std::sync::Arc;

pub type SessionId = Arc<str>;

/// Default generator: a fresh uuid per session.
pub fn session_id() -> SessionId {
    uuid::Uuid::new_v4().to_string().into()
}

/// Pluggable session id source, invoked once per session. Configuring
/// `None` instead of a generator puts the transport in stateless mode.
pub type SessionIdGenerator = Arc<dyn Fn() -> SessionId + Send + Sync>;
