//! Transport liveness as seen by the display layer.
//!
//! The status only moves on transport lifecycle signals. It never gates a
//! control operation: an emergency stop issued while disconnected is still
//! attempted locally and handed to the transport.

use serde::Serialize;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    #[default]
    Disconnected,
}

impl ConnectionStatus {
    pub fn label(self) -> &'static str {
        match self {
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
        }
    }

    pub fn is_connected(self) -> bool {
        self == ConnectionStatus::Connected
    }
}

#[derive(Debug, Default)]
pub struct ConnectionState {
    status: ConnectionStatus,
    transitions: u64,
}

impl ConnectionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// Number of status changes observed this session (reconnects count twice).
    pub fn transitions(&self) -> u64 {
        self.transitions
    }

    /// Lifecycle signal: the transport reports an established link.
    pub(crate) fn on_connect(&mut self) -> bool {
        self.set(ConnectionStatus::Connected)
    }

    /// Lifecycle signal: the transport lost (or closed) its link.
    pub(crate) fn on_disconnect(&mut self) -> bool {
        self.set(ConnectionStatus::Disconnected)
    }

    fn set(&mut self, status: ConnectionStatus) -> bool {
        if self.status == status {
            debug!(status = status.label(), "duplicate lifecycle signal");
            return false;
        }
        self.status = status;
        self.transitions += 1;
        match status {
            ConnectionStatus::Connected => info!("backend connected"),
            ConnectionStatus::Disconnected => warn!("backend disconnected"),
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_disconnected() {
        let conn = ConnectionState::new();
        assert_eq!(conn.status(), ConnectionStatus::Disconnected);
        assert_eq!(conn.transitions(), 0);
    }

    #[test]
    fn lifecycle_toggles_status() {
        let mut conn = ConnectionState::new();
        assert!(conn.on_connect());
        assert!(conn.status().is_connected());
        assert!(conn.on_disconnect());
        assert!(conn.on_connect());
        assert_eq!(conn.transitions(), 3);
    }

    #[test]
    fn duplicate_signals_are_not_transitions() {
        let mut conn = ConnectionState::new();
        assert!(!conn.on_disconnect());
        assert!(conn.on_connect());
        assert!(!conn.on_connect());
        assert_eq!(conn.transitions(), 1);
    }
}
