use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::connection::ConnectionStatus;
use crate::control::ControlState;
use crate::protocol::CommandSink;
use crate::reconcile::{BiosignalSnapshot, Channel, NeuralSnapshot, VisualSnapshot};
use crate::safety::Severity;
use crate::session::Session;

/// A read-only snapshot of what the session is showing.
///
/// Design intent:
/// - Observers cannot mutate the session or issue commands.
/// - Telemetry snapshots are shared `Arc`s: taking a snapshot never copies
///   the sample buffers, and a held snapshot stays stable while new
///   telemetry arrives.
#[derive(Debug, Clone)]
pub struct ConsoleSnapshot {
    pub connection: ConnectionStatus,
    pub consent_granted: bool,
    pub control: ControlState,
    pub halt_latched: bool,
    pub alert: Option<AlertView>,

    pub neural: Arc<NeuralSnapshot>,
    pub biosignal: Arc<BiosignalSnapshot>,
    pub visual: Arc<VisualSnapshot>,
    /// Snapshots published per channel, in `Channel::all()` order.
    pub revisions: [u64; 3],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertView {
    pub id: u64,
    pub severity: Severity,
    pub message: String,
    pub expires_at: Option<Instant>,
}

impl AlertView {
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.expires_at.map(|t| t.saturating_duration_since(now))
    }
}

pub struct SessionAdapter<'a, S: CommandSink> {
    session: &'a Session<S>,
}

impl<'a, S: CommandSink> SessionAdapter<'a, S> {
    pub fn new(session: &'a Session<S>) -> Self {
        Self { session }
    }

    pub fn snapshot(&self) -> ConsoleSnapshot {
        let streams = self.session.streams();
        let expires_at = self.session.alert_deadline();
        let alert = self.session.active_alert().map(|a| AlertView {
            id: a.id,
            severity: a.severity,
            message: a.message.clone(),
            expires_at,
        });

        ConsoleSnapshot {
            connection: self.session.connection_status(),
            consent_granted: self.session.gate().is_consent_granted(),
            control: *self.session.control_state(),
            halt_latched: self.session.control().is_halt_latched(),
            alert,

            neural: Arc::clone(streams.neural()),
            biosignal: Arc::clone(streams.biosignal()),
            visual: Arc::clone(streams.visual()),
            revisions: [
                streams.revision(Channel::Neural),
                streams.revision(Channel::Biosignal),
                streams.revision(Channel::Visual),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::protocol::{Command, InboundEvent};
    use crate::reconcile::Channel;
    use crate::session::Session;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn held_snapshot_is_unaffected_by_later_telemetry() {
        let mut s: Session<Vec<Command>> = Session::with_defaults(Vec::new());
        s.handle_event(InboundEvent::Telemetry {
            channel: Channel::Neural,
            payload: json!({ "mean_firing_rate": 0.3 }),
        });
        let before = s.snapshot();

        s.handle_event(InboundEvent::Telemetry {
            channel: Channel::Neural,
            payload: json!({ "mean_firing_rate": 0.8 }),
        });
        let after = s.snapshot();

        assert_eq!(before.neural.firing_rate, 0.3);
        assert_eq!(after.neural.firing_rate, 0.8);
        assert_eq!(before.revisions[0], 1);
        assert_eq!(after.revisions[0], 2);
        assert!(Arc::ptr_eq(&before.biosignal, &after.biosignal));
    }

    #[test]
    fn alert_view_carries_its_deadline() {
        let mut s: Session<Vec<Command>> = Session::with_defaults(Vec::new());
        assert!(s.snapshot().alert.is_none());

        s.start_experiment();
        let snap = s.snapshot();
        let alert = snap.alert.expect("consent warning");
        assert!(alert.expires_at.is_some());
        assert!(!snap.consent_granted);
        assert!(!snap.halt_latched);
    }
}
