//! Per-session event channels: logs, status changes, and errors.
//!
//! Each channel is a bounded `broadcast` queue. Sending never waits, so
//! the reader tasks and the exit watcher cannot be stalled by a slow or
//! absent subscriber; a subscriber that falls behind loses its oldest
//! events and sees `RecvError::Lagged`. The latest status is kept in a
//! cell next to the channels and can be read synchronously at any time.

use crate::openvpn::config::SupervisorConfig;
use crate::openvpn::types::*;
use chrono::Utc;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;

struct Channels {
    logs: broadcast::Sender<LogEvent>,
    status: broadcast::Sender<StatusChangeEvent>,
    errors: broadcast::Sender<ErrorEvent>,
}

struct BusInner {
    /// `None` once closed.
    channels: Option<Channels>,
    status: ConnectionStatus,
}

/// Three independent bounded queues plus the latest-status cell.
pub struct EventBus {
    session_id: String,
    inner: Mutex<BusInner>,
}

impl EventBus {
    pub fn new(
        session_id: impl Into<String>,
        log_capacity: usize,
        status_capacity: usize,
        error_capacity: usize,
    ) -> Self {
        let (logs, _) = broadcast::channel(log_capacity.max(1));
        let (status, _) = broadcast::channel(status_capacity.max(1));
        let (errors, _) = broadcast::channel(error_capacity.max(1));
        Self {
            session_id: session_id.into(),
            inner: Mutex::new(BusInner {
                channels: Some(Channels { logs, status, errors }),
                status: ConnectionStatus::default(),
            }),
        }
    }

    pub fn from_config(session_id: impl Into<String>, cfg: &SupervisorConfig) -> Self {
        Self::new(
            session_id,
            cfg.log_capacity,
            cfg.status_capacity,
            cfg.error_capacity,
        )
    }

    /// Start from `status` instead of Disconnected. Used when a new bus
    /// takes over from a closed one and must keep reporting its final
    /// status until something is published.
    pub fn with_status(self, status: ConnectionStatus) -> Self {
        self.lock().status = status;
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn lock(&self) -> MutexGuard<'_, BusInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Publishing ───────────────────────────────────────────────

    /// Returns `false` if the bus was already closed.
    pub fn publish_log(&self, stream: OutputStream, line: impl Into<String>) -> bool {
        let inner = self.lock();
        let Some(ch) = inner.channels.as_ref() else {
            return false;
        };
        // No subscribers is not an error.
        let _ = ch.logs.send(LogEvent {
            session_id: self.session_id.clone(),
            stream,
            line: line.into(),
            timestamp: Utc::now(),
        });
        true
    }

    /// Record and announce a status change. The cell is updated even if
    /// nobody is listening; after close nothing changes.
    pub fn publish_status(&self, new_status: ConnectionStatus) -> bool {
        let mut inner = self.lock();
        if inner.channels.is_none() {
            return false;
        }
        let old_status = inner.status;
        inner.status = new_status;
        if let Some(ch) = inner.channels.as_ref() {
            let _ = ch.status.send(StatusChangeEvent {
                session_id: self.session_id.clone(),
                old_status,
                new_status,
                timestamp: Utc::now(),
            });
        }
        true
    }

    pub fn publish_error(&self, cause: ErrorCause, exit_code: Option<i32>) -> bool {
        let inner = self.lock();
        let Some(ch) = inner.channels.as_ref() else {
            return false;
        };
        let _ = ch.errors.send(ErrorEvent {
            session_id: self.session_id.clone(),
            cause,
            exit_code,
            timestamp: Utc::now(),
        });
        true
    }

    // ── Reading ──────────────────────────────────────────────────

    pub fn status(&self) -> ConnectionStatus {
        self.lock().status
    }

    pub fn is_closed(&self) -> bool {
        self.lock().channels.is_none()
    }

    pub fn subscribe_logs(&self) -> broadcast::Receiver<LogEvent> {
        match self.lock().channels.as_ref() {
            Some(ch) => ch.logs.subscribe(),
            None => closed_receiver(),
        }
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusChangeEvent> {
        match self.lock().channels.as_ref() {
            Some(ch) => ch.status.subscribe(),
            None => closed_receiver(),
        }
    }

    pub fn subscribe_errors(&self) -> broadcast::Receiver<ErrorEvent> {
        match self.lock().channels.as_ref() {
            Some(ch) => ch.errors.subscribe(),
            None => closed_receiver(),
        }
    }

    // ── Closing ──────────────────────────────────────────────────

    /// Drop all senders. Subscribers drain what is queued, then see
    /// `RecvError::Closed`. Returns `true` only for the call that closed.
    pub fn close(&self) -> bool {
        self.lock().channels.take().is_some()
    }
}

fn closed_receiver<T: Clone>() -> broadcast::Receiver<T> {
    let (tx, rx) = broadcast::channel(1);
    drop(tx);
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::{RecvError, TryRecvError};

    fn bus() -> EventBus {
        EventBus::new("test-session", 100, 10, 2)
    }

    #[test]
    fn starts_disconnected_and_open() {
        let b = bus();
        assert_eq!(b.status(), ConnectionStatus::Disconnected);
        assert!(!b.is_closed());
        assert_eq!(b.session_id(), "test-session");
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let b = bus();
        assert!(b.publish_log(OutputStream::Stdout, "hello"));
        assert!(b.publish_status(ConnectionStatus::Initializing));
        assert!(b.publish_error(ErrorCause::AuthFailure, Some(1)));
        assert_eq!(b.status(), ConnectionStatus::Initializing);
    }

    #[tokio::test]
    async fn subscriber_receives_in_order() {
        let b = bus();
        let mut rx = b.subscribe_status();
        b.publish_status(ConnectionStatus::Initializing);
        b.publish_status(ConnectionStatus::Connected);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.old_status, ConnectionStatus::Disconnected);
        assert_eq!(first.new_status, ConnectionStatus::Initializing);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.old_status, ConnectionStatus::Initializing);
        assert_eq!(second.new_status, ConnectionStatus::Connected);
        assert_eq!(second.session_id, "test-session");
    }

    #[test]
    fn full_queue_never_blocks_and_status_cell_stays_true() {
        let b = EventBus::new("s", 1, 1, 1);
        let mut status_rx = b.subscribe_status();
        let mut err_rx = b.subscribe_errors();

        for _ in 0..50 {
            b.publish_status(ConnectionStatus::Initializing);
            b.publish_error(ErrorCause::PortInUse, None);
        }
        b.publish_status(ConnectionStatus::Error);

        assert_eq!(b.status(), ConnectionStatus::Error);
        assert!(matches!(status_rx.try_recv(), Err(TryRecvError::Lagged(_))));
        let last = status_rx.try_recv().unwrap();
        assert_eq!(last.new_status, ConnectionStatus::Error);
        assert!(matches!(err_rx.try_recv(), Err(TryRecvError::Lagged(_))));
    }

    #[test]
    fn close_is_idempotent() {
        let b = bus();
        assert!(b.close());
        assert!(!b.close());
        assert!(b.is_closed());
    }

    #[test]
    fn publish_after_close_is_dropped() {
        let b = bus();
        b.publish_status(ConnectionStatus::Initializing);
        b.close();
        assert!(!b.publish_log(OutputStream::Stderr, "late"));
        assert!(!b.publish_status(ConnectionStatus::Error));
        assert!(!b.publish_error(ErrorCause::AuthFailure, None));
        assert_eq!(b.status(), ConnectionStatus::Initializing);
    }

    #[tokio::test]
    async fn subscriber_drains_then_sees_closed() {
        let b = bus();
        let mut rx = b.subscribe_logs();
        b.publish_log(OutputStream::Stdout, "one");
        b.close();

        assert_eq!(rx.recv().await.unwrap().line, "one");
        assert!(matches!(rx.recv().await, Err(RecvError::Closed)));
    }

    #[tokio::test]
    async fn subscribe_after_close_is_closed() {
        let b = bus();
        b.close();
        let mut rx = b.subscribe_errors();
        assert!(matches!(rx.recv().await, Err(RecvError::Closed)));
    }

    #[test]
    fn from_config_uses_capacities() {
        let mut cfg = SupervisorConfig::default();
        cfg.status_capacity = 1;
        let b = EventBus::from_config("s", &cfg);
        let mut rx = b.subscribe_status();
        b.publish_status(ConnectionStatus::Initializing);
        b.publish_status(ConnectionStatus::Connected);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Lagged(1))));
    }

    #[tokio::test]
    async fn with_status_seeds_the_cell_and_first_event() {
        let b = bus().with_status(ConnectionStatus::Error);
        assert_eq!(b.status(), ConnectionStatus::Error);
        assert!(!b.is_closed());

        let mut rx = b.subscribe_status();
        b.publish_status(ConnectionStatus::Initializing);
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.old_status, ConnectionStatus::Error);
        assert_eq!(ev.new_status, ConnectionStatus::Initializing);
    }
}
