//! Interactive execution session subsystem.
//!
//! Covers session readiness state, connection handles, input line assembly,
//! and the broker that arbitrates the single primary connection plus
//! per-route link connections.

pub mod broker;
pub mod control;
pub mod input;

pub use broker::SessionHub;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Readiness of the single logical session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Missing code, working-directory key, an attached primary, or the
    /// enabled flag — code may not run.
    Wait,
    /// Everything present; the runner may start.
    Ready,
}

/// Handle to one attached WebSocket connection.
///
/// Outbound frames go through an unbounded channel drained by the
/// connection's writer task; forced teardown cancels the connection token,
/// which ends both the reader and writer tasks and closes the socket.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    id: u64,
    outbound: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
}

impl ClientHandle {
    /// Build a handle from a connection's id, outbound channel, and token.
    #[must_use]
    pub fn new(id: u64, outbound: mpsc::UnboundedSender<String>, cancel: CancellationToken) -> Self {
        Self {
            id,
            outbound,
            cancel,
        }
    }

    /// Monotonic connection identifier.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue one wire frame for delivery. A closed peer is not an error;
    /// the frame is simply dropped.
    pub fn send(&self, frame: String) {
        if self.outbound.send(frame).is_err() {
            debug!(client_id = self.id, "outbound channel closed, frame dropped");
        }
    }

    /// Force the connection closed. Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Token observed by the connection's reader/writer tasks.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}
