//! Resolves a pending `connect` from the session's event stream.

use crate::openvpn::events::EventBus;
use crate::openvpn::types::*;
use std::future::Future;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Cause reported when the session ends without anything classified.
pub const UNEXPECTED_DISCONNECT: &str = "VPN disconnected unexpectedly";

/// How a connection attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Connected,
    Failed(ErrorCause),
    /// The deadline passed first.
    TimedOut,
    /// The caller's token fired first.
    Cancelled,
}

/// Wait until the session reports Connected, fails, or the deadline /
/// caller token fires. Resolves exactly once.
///
/// `last_cause` is consulted when the session ends through a status
/// change rather than an error event.
pub async fn wait_for_connection<F, Fut>(
    bus: &EventBus,
    mut status_rx: broadcast::Receiver<StatusChangeEvent>,
    mut errors_rx: broadcast::Receiver<ErrorEvent>,
    deadline: Instant,
    cancel: Option<&CancellationToken>,
    last_cause: F,
) -> WaitOutcome
where
    F: Fn() -> Fut,
    Fut: Future<Output = Option<ErrorCause>>,
{
    if bus.status() == ConnectionStatus::Connected {
        return WaitOutcome::Connected;
    }

    let caller_cancelled = async {
        match cancel {
            Some(token) => token.cancelled().await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(caller_cancelled);
    let expired = tokio::time::sleep_until(deadline);
    tokio::pin!(expired);

    let mut errors_open = true;
    loop {
        // Errors first: a failed exit queues its error event before the
        // terminal status.
        tokio::select! {
            biased;
            res = errors_rx.recv(), if errors_open => match res {
                Ok(ev) => return WaitOutcome::Failed(ev.cause),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => errors_open = false,
            },
            res = status_rx.recv() => match res {
                Ok(ev) => match ev.new_status {
                    ConnectionStatus::Connected => return WaitOutcome::Connected,
                    ConnectionStatus::Initializing => continue,
                    ConnectionStatus::Disconnected | ConnectionStatus::Error => {
                        return failed(last_cause().await);
                    }
                },
                Err(RecvError::Lagged(_)) => match bus.status() {
                    ConnectionStatus::Connected => return WaitOutcome::Connected,
                    ConnectionStatus::Initializing => continue,
                    _ => return failed(last_cause().await),
                },
                Err(RecvError::Closed) => {
                    return match bus.status() {
                        ConnectionStatus::Connected => WaitOutcome::Connected,
                        _ => failed(last_cause().await),
                    };
                }
            },
            _ = &mut expired => return WaitOutcome::TimedOut,
            _ = &mut caller_cancelled => return WaitOutcome::Cancelled,
        }
    }
}

fn failed(cause: Option<ErrorCause>) -> WaitOutcome {
    WaitOutcome::Failed(cause.unwrap_or_else(|| ErrorCause::generic(UNEXPECTED_DISCONNECT)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn bus() -> EventBus {
        EventBus::new("w", 100, 10, 2)
    }

    async fn run(bus: &EventBus, cause: Option<ErrorCause>, within: Duration) -> WaitOutcome {
        let status_rx = bus.subscribe_status();
        let errors_rx = bus.subscribe_errors();
        wait_for_connection(bus, status_rx, errors_rx, Instant::now() + within, None, || {
            let c = cause.clone();
            async move { c }
        })
        .await
    }

    #[tokio::test]
    async fn connected_event_resolves_ok() {
        let b = bus();
        let status_rx = b.subscribe_status();
        let errors_rx = b.subscribe_errors();
        b.publish_status(ConnectionStatus::Initializing);
        b.publish_status(ConnectionStatus::Connected);
        let out = wait_for_connection(
            &b,
            status_rx,
            errors_rx,
            Instant::now() + Duration::from_secs(5),
            None,
            || async { None },
        )
        .await;
        assert_eq!(out, WaitOutcome::Connected);
    }

    #[tokio::test]
    async fn already_connected_short_circuits() {
        let b = bus();
        b.publish_status(ConnectionStatus::Connected);
        assert_eq!(run(&b, None, Duration::from_secs(5)).await, WaitOutcome::Connected);
    }

    #[tokio::test]
    async fn error_event_wins_over_following_terminal_status() {
        let b = bus();
        let status_rx = b.subscribe_status();
        let errors_rx = b.subscribe_errors();
        b.publish_status(ConnectionStatus::Initializing);
        b.publish_error(ErrorCause::AuthFailure, Some(1));
        b.publish_status(ConnectionStatus::Error);
        b.close();
        let out = wait_for_connection(
            &b,
            status_rx,
            errors_rx,
            Instant::now() + Duration::from_secs(5),
            None,
            || async { Some(ErrorCause::DnsFailure) },
        )
        .await;
        assert_eq!(out, WaitOutcome::Failed(ErrorCause::AuthFailure));
    }

    #[tokio::test]
    async fn terminal_status_uses_last_cause() {
        let b = bus();
        let status_rx = b.subscribe_status();
        let errors_rx = b.subscribe_errors();
        b.publish_status(ConnectionStatus::Disconnected);
        let out = wait_for_connection(
            &b,
            status_rx,
            errors_rx,
            Instant::now() + Duration::from_secs(5),
            None,
            || async { Some(ErrorCause::TlsHandshakeFailure) },
        )
        .await;
        assert_eq!(out, WaitOutcome::Failed(ErrorCause::TlsHandshakeFailure));
    }

    #[tokio::test]
    async fn terminal_status_without_cause_is_unexpected_disconnect() {
        let b = bus();
        let status_rx = b.subscribe_status();
        let errors_rx = b.subscribe_errors();
        b.publish_status(ConnectionStatus::Disconnected);
        b.close();
        let out = wait_for_connection(
            &b,
            status_rx,
            errors_rx,
            Instant::now() + Duration::from_secs(5),
            None,
            || async { None },
        )
        .await;
        assert_eq!(out, WaitOutcome::Failed(ErrorCause::generic(UNEXPECTED_DISCONNECT)));
    }

    #[tokio::test]
    async fn closed_bus_resolves_from_latest_status() {
        let b = bus();
        b.publish_status(ConnectionStatus::Error);
        b.close();
        // subscriptions after close are closed receivers
        let out = run(&b, Some(ErrorCause::PortInUse), Duration::from_secs(5)).await;
        assert_eq!(out, WaitOutcome::Failed(ErrorCause::PortInUse));
    }

    #[tokio::test]
    async fn lagged_status_falls_back_to_cell() {
        let b = EventBus::new("w", 100, 1, 2);
        let status_rx = b.subscribe_status();
        let errors_rx = b.subscribe_errors();
        b.publish_status(ConnectionStatus::Initializing);
        b.publish_status(ConnectionStatus::Connected);
        b.publish_status(ConnectionStatus::Connected);
        let out = wait_for_connection(
            &b,
            status_rx,
            errors_rx,
            Instant::now() + Duration::from_secs(5),
            None,
            || async { None },
        )
        .await;
        assert_eq!(out, WaitOutcome::Connected);
    }

    #[tokio::test]
    async fn deadline_times_out() {
        let b = bus();
        b.publish_status(ConnectionStatus::Initializing);
        let out = run(&b, None, Duration::from_millis(50)).await;
        assert_eq!(out, WaitOutcome::TimedOut);
    }

    #[tokio::test]
    async fn caller_cancellation() {
        let b = bus();
        let token = CancellationToken::new();
        let status_rx = b.subscribe_status();
        let errors_rx = b.subscribe_errors();
        let t = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            t.cancel();
        });
        let out = wait_for_connection(
            &b,
            status_rx,
            errors_rx,
            Instant::now() + Duration::from_secs(30),
            Some(&token),
            || async { None },
        )
        .await;
        assert_eq!(out, WaitOutcome::Cancelled);
    }

    #[tokio::test]
    async fn event_from_another_task() {
        let b = std::sync::Arc::new(bus());
        let status_rx = b.subscribe_status();
        let errors_rx = b.subscribe_errors();
        let producer = b.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.publish_status(ConnectionStatus::Connected);
        });
        let out = wait_for_connection(
            &b,
            status_rx,
            errors_rx,
            Instant::now() + Duration::from_secs(5),
            None,
            || async { None },
        )
        .await;
        assert_eq!(out, WaitOutcome::Connected);
    }
}
