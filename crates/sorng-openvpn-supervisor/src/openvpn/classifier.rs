//! Maps one line of `openvpn` output to a status trigger or an error cause.

use crate::openvpn::types::ErrorCause;

/// What a single output line means for the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineSignal {
    /// The tunnel is up.
    Connected,
    /// The line explains (or hints at) a failure.
    Failure(ErrorCause),
}

/// Known failure substrings, matched case-sensitively in this order.
/// Specific TLS rules come before the catch-all `TLS Error`.
pub const ERROR_PATTERNS: &[(&str, ErrorCause)] = &[
    ("AUTH_FAILED", ErrorCause::AuthFailure),
    ("auth-failure", ErrorCause::AuthFailure),
    ("TLS handshake failed", ErrorCause::TlsHandshakeFailure),
    ("TLS key negotiation failed", ErrorCause::TlsHandshakeFailure),
    ("Cannot resolve host address", ErrorCause::DnsFailure),
    ("RESOLVE:", ErrorCause::DnsFailure),
    ("Connection timed out", ErrorCause::TunnelTimeout),
    ("No route to host", ErrorCause::NoRouteToHost),
    ("Inactivity timeout", ErrorCause::InactivityTimeout),
    ("Address already in use", ErrorCause::PortInUse),
    ("TLS Error", ErrorCause::GenericTlsError),
];

/// Lower-case words that mark a line as a failure when nothing more
/// specific matched.
const GENERIC_INDICATORS: &[&str] = &["error", "fatal"];

/// Classify one line. Pure and deterministic.
pub fn classify(line: &str, connected_marker: &str) -> Option<LineSignal> {
    if !connected_marker.is_empty() && line.contains(connected_marker) {
        return Some(LineSignal::Connected);
    }

    if let Some((_, cause)) = ERROR_PATTERNS.iter().find(|(pat, _)| line.contains(pat)) {
        return Some(LineSignal::Failure(cause.clone()));
    }

    let lower = line.to_lowercase();
    if GENERIC_INDICATORS.iter().any(|w| lower.contains(w)) {
        return Some(LineSignal::Failure(ErrorCause::generic(line.trim())));
    }

    None
}
