//! Caller liveness signalling for streaming requests
//!
//! The HTTP layer owns a `ClientGuard` for the lifetime of the client
//! connection; the coordinator and fetch jobs poll the paired
//! `ClientHandle`s. Disconnect detection is cooperative and non-blocking,
//! never preemptive.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Owned by the caller of a streaming request for as long as the client
/// connection is open. Dropping the guard (or calling `disconnect`) marks
/// every associated handle as dead.
pub struct ClientGuard {
    connected: Arc<AtomicBool>,
}

impl ClientGuard {
    /// Creates a connected guard/handle pair.
    pub fn connected() -> (Self, ClientHandle) {
        let connected = Arc::new(AtomicBool::new(true));
        let handle = ClientHandle {
            connected: Arc::clone(&connected),
        };
        (Self { connected }, handle)
    }

    /// Explicitly marks the client as disconnected.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
    }

    /// Returns another handle polling this guard's liveness.
    pub fn handle(&self) -> ClientHandle {
        ClientHandle {
            connected: Arc::clone(&self.connected),
        }
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.connected.store(false, Ordering::Release);
    }
}

/// Cheap clonable liveness probe for one streaming client.
///
/// Registered with every chunk the client reads so an in-flight fetch can
/// wind down once nobody is listening.
#[derive(Clone)]
pub struct ClientHandle {
    connected: Arc<AtomicBool>,
}

impl ClientHandle {
    /// Whether the client is still connected. Never blocks.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drop_disconnects_all_handles() {
        let (guard, handle) = ClientGuard::connected();
        let second = guard.handle();
        assert!(handle.is_connected());
        assert!(second.is_connected());

        drop(guard);
        assert!(!handle.is_connected());
        assert!(!second.is_connected());
    }

    #[test]
    fn test_explicit_disconnect() {
        let (guard, handle) = ClientGuard::connected();
        guard.disconnect();
        assert!(!handle.is_connected());
    }
}
