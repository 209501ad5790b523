//! Per-connection handshake state and request-id allocation.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::error::McpError;
use crate::protocol::{Implementation, InitializeResult};

/// Lifecycle of a session. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Created,
    Initializing,
    Initialized,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Created => "created",
            SessionState::Initializing => "initializing",
            SessionState::Initialized => "initialized",
        };
        f.write_str(s)
    }
}

struct Negotiated {
    state: SessionState,
    handshake: Option<InitializeResult>,
}

/// State shared by one client/server pairing.
pub struct Session {
    id: String,
    next_id: AtomicU64,
    inner: Mutex<Negotiated>,
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            next_id: AtomicU64::new(1),
            inner: Mutex::new(Negotiated {
                state: SessionState::Created,
                handshake: None,
            }),
        }
    }

    /// Opaque unique identifier of this session.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn is_initialized(&self) -> bool {
        self.state() == SessionState::Initialized
    }

    /// Created → Initializing.
    pub fn mark_initializing(&self) -> Result<(), McpError> {
        let mut inner = self.lock();
        if inner.state != SessionState::Created {
            return Err(McpError::InvalidState {
                expected: SessionState::Created,
                found: inner.state,
            });
        }
        inner.state = SessionState::Initializing;
        Ok(())
    }

    /// Initializing → Initialized, recording what the server reported.
    pub fn mark_initialized(&self, handshake: InitializeResult) -> Result<(), McpError> {
        let mut inner = self.lock();
        if inner.state != SessionState::Initializing {
            return Err(McpError::InvalidState {
                expected: SessionState::Initializing,
                found: inner.state,
            });
        }
        inner.state = SessionState::Initialized;
        inner.handshake = Some(handshake);
        Ok(())
    }

    /// Allocate the next request id. Ids start at 1 and never repeat.
    pub fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Protocol version reported by the server, once initialized.
    pub fn protocol_version(&self) -> Option<String> {
        self.lock()
            .handshake
            .as_ref()
            .map(|h| h.protocol_version.clone())
    }

    /// Server identity reported during the handshake.
    pub fn server_info(&self) -> Option<Implementation> {
        self.lock().handshake.as_ref().map(|h| h.server_info.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Negotiated> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PROTOCOL_VERSION;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn handshake() -> InitializeResult {
        InitializeResult {
            protocol_version: PROTOCOL_VERSION.into(),
            capabilities: serde_json::json!({}),
            server_info: Implementation::new("test-server", "0.1.0"),
        }
    }

    #[test]
    fn ids_start_at_one_and_increase() {
        let session = Session::new();
        let ids: Vec<u64> = (0..5).map(|_| session.next_request_id()).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn concurrent_ids_never_repeat() {
        let session = Arc::new(Session::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let session = Arc::clone(&session);
                std::thread::spawn(move || {
                    (0..500)
                        .map(|_| session.next_request_id())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            let ids = handle.join().unwrap();
            // Each thread observes its own ids in increasing order.
            assert!(ids.windows(2).all(|w| w[0] < w[1]));
            for id in ids {
                assert!(seen.insert(id), "duplicate id {id}");
            }
        }
        assert_eq!(seen.len(), 4000);
        assert_eq!(seen.iter().min(), Some(&1));
        assert_eq!(seen.iter().max(), Some(&4000));
    }

    #[test]
    fn lifecycle_moves_forward() {
        let session = Session::new();
        assert_eq!(session.state(), SessionState::Created);
        assert!(session.protocol_version().is_none());

        session.mark_initializing().unwrap();
        assert_eq!(session.state(), SessionState::Initializing);
        assert!(!session.is_initialized());

        session.mark_initialized(handshake()).unwrap();
        assert!(session.is_initialized());
        assert_eq!(session.protocol_version().as_deref(), Some(PROTOCOL_VERSION));
        assert_eq!(session.server_info().unwrap().name, "test-server");
    }

    #[test]
    fn initialized_before_initializing_fails() {
        let session = Session::new();
        let err = session.mark_initialized(handshake()).unwrap_err();
        assert!(matches!(
            err,
            McpError::InvalidState {
                expected: SessionState::Initializing,
                found: SessionState::Created
            }
        ));
        assert_eq!(session.state(), SessionState::Created);
    }

    #[test]
    fn transitions_cannot_repeat() {
        let session = Session::new();
        session.mark_initializing().unwrap();
        assert!(session.mark_initializing().is_err());
        session.mark_initialized(handshake()).unwrap();
        assert!(session.mark_initializing().is_err());
        assert!(session.mark_initialized(handshake()).is_err());
        assert_eq!(session.state(), SessionState::Initialized);
    }

    #[test]
    fn session_ids_are_unique() {
        assert_ne!(Session::new().id(), Session::new().id());
    }
}
