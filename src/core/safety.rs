//! Consent and the single active-alert slot.
//!
//! `SafetyGate` is the only owner of both. Consent is one-way for the life of
//! a session. The alert slot holds at most one alert; raising a new alert
//! always supersedes the current one, whatever either severity is.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn label(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafetyAlert {
    /// Monotonic per gate; tells a superseding alert apart from an identical one.
    pub id: u64,
    pub severity: Severity,
    pub message: String,
    pub timestamp: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConsentState {
    granted: bool,
}

impl ConsentState {
    pub fn granted(self) -> bool {
        self.granted
    }
}

#[derive(Debug, Default)]
pub struct SafetyGate {
    consent: ConsentState,
    alert: Option<SafetyAlert>,
    next_alert_id: u64,
}

impl SafetyGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn consent(&self) -> ConsentState {
        self.consent
    }

    pub fn is_consent_granted(&self) -> bool {
        self.consent.granted
    }

    /// Grant consent for this session. Returns `true` only on the first grant.
    pub fn grant_consent(&mut self) -> bool {
        if self.consent.granted {
            return false;
        }
        self.consent.granted = true;
        info!("informed consent granted");
        true
    }

    pub fn active_alert(&self) -> Option<&SafetyAlert> {
        self.alert.as_ref()
    }

    pub fn raise_alert(&mut self, severity: Severity, message: impl Into<String>) -> &SafetyAlert {
        self.raise_alert_at(severity, message, Instant::now())
    }

    pub fn raise_alert_at(
        &mut self,
        severity: Severity,
        message: impl Into<String>,
        timestamp: Instant,
    ) -> &SafetyAlert {
        self.next_alert_id += 1;
        let alert = SafetyAlert {
            id: self.next_alert_id,
            severity,
            message: message.into(),
            timestamp,
        };
        if let Some(prev) = &self.alert {
            debug!(
                superseded = prev.id,
                prev_severity = prev.severity.label(),
                "alert superseded"
            );
        }
        self.alert.insert(alert)
    }

    /// Clear the slot. Safe to call when nothing is active.
    pub fn clear_alert(&mut self) -> Option<SafetyAlert> {
        self.alert.take()
    }

    /// Total alerts raised this session.
    pub fn alerts_raised(&self) -> u64 {
        self.next_alert_id
    }
}
