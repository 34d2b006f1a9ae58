//! Request/response correlation over the event-driven transport.
//!
//! Each client request expects exactly one of two reply types (success or
//! error). A small table keyed by those types completes each request exactly
//! once (resolve, reject, or time out) and always clears its entry, so a
//! later request for the same pair can register again.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::domain::error::SignalingError;
use crate::domain::signaling::ServerMessage;

struct Pending {
    success: &'static str,
    error: &'static str,
    tx: oneshot::Sender<Result<ServerMessage, ServerMessage>>,
}

/// Pending-request table. At most one outstanding request per reply pair.
#[derive(Default)]
pub struct PendingRequests {
    entries: Mutex<Vec<Pending>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest, run `send`, and wait for the matching reply.
    ///
    /// Completes exactly once: with the success message, with a
    /// `REQUEST_FAILED` carrying the server's error text, or with a
    /// `TIMEOUT` naming the awaited reply after `timeout` elapses.
    pub async fn wait(
        &self,
        success: &'static str,
        error: &'static str,
        timeout: Duration,
        send: impl FnOnce(),
    ) -> Result<ServerMessage, SignalingError> {
        let rx = self.register(success, error)?;
        send();

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(msg))) => Ok(msg),
            Ok(Ok(Err(reply))) => Err(SignalingError::request_failed(
                reply.error_message().unwrap_or("request rejected").to_owned(),
            )),
            // Sender dropped: the session is shutting down.
            Ok(Err(_)) => Err(SignalingError::conn_lost()),
            Err(_) => {
                self.remove(success);
                Err(SignalingError::timeout(success))
            }
        }
    }

    /// Offer an inbound message to the table. Returns `true` when it
    /// completed a pending request (as success or error).
    pub fn offer(&self, msg: &ServerMessage) -> bool {
        let kind = msg.kind();
        let mut entries = self.entries.lock().unwrap();
        let Some(idx) = entries
            .iter()
            .position(|p| p.success == kind || p.error == kind)
        else {
            return false;
        };
        let pending = entries.swap_remove(idx);
        let outcome = if pending.success == kind {
            Ok(msg.clone())
        } else {
            Err(msg.clone())
        };
        // The receiver may already be gone (timed out); nothing to do then.
        let _ = pending.tx.send(outcome);
        true
    }

    /// Drop every entry, failing outstanding waiters.
    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    fn register(
        &self,
        success: &'static str,
        error: &'static str,
    ) -> Result<oneshot::Receiver<Result<ServerMessage, ServerMessage>>, SignalingError> {
        let mut entries = self.entries.lock().unwrap();
        if entries
            .iter()
            .any(|p| p.success == success && p.error == error)
        {
            return Err(SignalingError::request_failed(format!(
                "a request awaiting {success} is already outstanding"
            )));
        }
        let (tx, rx) = oneshot::channel();
        entries.push(Pending { success, error, tx });
        Ok(rx)
    }

    fn remove(&self, success: &'static str) {
        self.entries
            .lock()
            .unwrap()
            .retain(|p| p.success != success);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
