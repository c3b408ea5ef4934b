//! Routes backend and local alerts into the gate's single slot and owns the
//! display timeout.
//!
//! Neither source outranks the other: whichever alert is routed last is the
//! one shown. The expiry deadline is derived from the active alert's own
//! timestamp, so a newer alert resets the timeout and dismissal cancels it.

use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::safety::{SafetyAlert, SafetyGate, Severity};

pub const ALERT_DISPLAY_TIMEOUT: Duration = Duration::from_millis(6000);

pub const CONSENT_REQUIRED_MESSAGE: &str =
    "Consent required: please provide consent before starting the experiment.";
pub const EMERGENCY_STOP_MESSAGE: &str = "Emergency stop activated. All stimulation halted.";
pub const BACKEND_ALERT_FALLBACK: &str = "Backend reported a safety condition.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertSource {
    Backend,
    Local,
}

#[derive(Debug, Clone)]
pub struct AlertRouter {
    timeout: Duration,
    backend_routed: u64,
    local_routed: u64,
}

impl Default for AlertRouter {
    fn default() -> Self {
        Self::new(ALERT_DISPLAY_TIMEOUT)
    }
}

impl AlertRouter {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            backend_routed: 0,
            local_routed: 0,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// A `safety_alert` pushed by the backend. Always `error` severity; the
    /// message is shown verbatim.
    pub fn route_backend<'g>(
        &mut self,
        gate: &'g mut SafetyGate,
        payload: &Value,
        now: Instant,
    ) -> &'g SafetyAlert {
        let message = payload
            .get("message")
            .and_then(Value::as_str)
            .filter(|m| !m.trim().is_empty())
            .unwrap_or(BACKEND_ALERT_FALLBACK);
        error!(alert = message, "backend safety alert");
        self.backend_routed += 1;
        gate.raise_alert_at(Severity::Error, message, now)
    }

    /// A policy alert generated on this side of the link.
    pub fn route_local<'g>(
        &mut self,
        gate: &'g mut SafetyGate,
        severity: Severity,
        message: impl Into<String>,
        now: Instant,
    ) -> &'g SafetyAlert {
        let message = message.into();
        match severity {
            Severity::Info => info!(alert = %message, "local alert"),
            Severity::Warning => warn!(alert = %message, "local alert"),
            Severity::Error => error!(alert = %message, "local alert"),
        }
        self.local_routed += 1;
        gate.raise_alert_at(severity, message, now)
    }

    /// Operator dismissal.
    pub fn dismiss(&mut self, gate: &mut SafetyGate) -> Option<SafetyAlert> {
        let dismissed = gate.clear_alert();
        if let Some(alert) = &dismissed {
            debug!(id = alert.id, "alert dismissed");
        }
        dismissed
    }

    /// When the active alert will clear on its own, if one is active.
    pub fn deadline(&self, gate: &SafetyGate) -> Option<Instant> {
        gate.active_alert().map(|a| a.timestamp + self.timeout)
    }

    /// Clear the active alert if its display timeout has elapsed at `now`.
    pub fn expire(&mut self, gate: &mut SafetyGate, now: Instant) -> Option<SafetyAlert> {
        let deadline = self.deadline(gate)?;
        if now < deadline {
            return None;
        }
        let expired = gate.clear_alert();
        if let Some(alert) = &expired {
            debug!(id = alert.id, "alert expired");
        }
        expired
    }

    pub fn routed(&self, source: AlertSource) -> u64 {
        match source {
            AlertSource::Backend => self.backend_routed,
            AlertSource::Local => self.local_routed,
        }
    }
}
