//! One operator session: the owners of all console state, wired together.
//!
//! A `Session` is constructed explicitly, driven by one inbound event or one
//! operator action at a time, and torn down with `close()` (or on drop).
//! Each piece of state has exactly one owner inside it; display code only
//! reads snapshots.

use std::collections::BTreeSet;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::alerts::AlertRouter;
use crate::config::ConsoleConfig;
use crate::connection::{ConnectionState, ConnectionStatus};
use crate::control::{ControlCoordinator, ControlPatch, ControlState};
use crate::observer::{ConsoleSnapshot, SessionAdapter};
use crate::protocol::{CommandSink, EventKind, InboundEvent};
use crate::reconcile::StreamReconciler;
use crate::safety::{SafetyAlert, SafetyGate};

/// The set of inbound event kinds the session currently listens for.
///
/// Acquired as a whole at session start and released as a whole at teardown.
#[derive(Debug, Default)]
pub struct Subscriptions {
    active: BTreeSet<EventKind>,
}

impl Subscriptions {
    pub fn acquire_all() -> Self {
        Self {
            active: EventKind::all().iter().copied().collect(),
        }
    }

    pub fn is_listening(&self, kind: EventKind) -> bool {
        self.active.contains(&kind)
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Returns how many listeners were released.
    pub fn release_all(&mut self) -> usize {
        let n = self.active.len();
        self.active.clear();
        n
    }
}

pub struct Session<S: CommandSink> {
    connection: ConnectionState,
    streams: StreamReconciler,
    gate: SafetyGate,
    control: ControlCoordinator,
    alerts: AlertRouter,
    subscriptions: Subscriptions,
    sink: S,
    closed: bool,
}

impl<S: CommandSink> Session<S> {
    pub fn new(config: &ConsoleConfig, sink: S) -> Self {
        let subscriptions = Subscriptions::acquire_all();
        debug!(listeners = subscriptions.len(), "session opened");
        Self {
            connection: ConnectionState::new(),
            streams: StreamReconciler::new(),
            gate: SafetyGate::new(),
            control: ControlCoordinator::new(),
            alerts: AlertRouter::new(config.alert_timeout()),
            subscriptions,
            sink,
            closed: false,
        }
    }

    pub fn with_defaults(sink: S) -> Self {
        Self::new(&ConsoleConfig::default(), sink)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Inbound
    // ─────────────────────────────────────────────────────────────────────

    /// Dispatch one inbound event to the component that owns its state.
    /// Returns `false` if nothing is listening for it.
    pub fn handle_event(&mut self, event: InboundEvent) -> bool {
        self.handle_event_at(event, Instant::now())
    }

    pub fn handle_event_at(&mut self, event: InboundEvent, now: Instant) -> bool {
        let kind = event.kind();
        if !self.subscriptions.is_listening(kind) {
            debug!(event = kind.label(), "no listener; event ignored");
            return false;
        }
        match event {
            InboundEvent::Connected => {
                self.connection.on_connect();
            }
            InboundEvent::Disconnected => {
                self.connection.on_disconnect();
            }
            InboundEvent::Telemetry { channel, payload } => self.streams.apply(channel, &payload),
            InboundEvent::SafetyAlert { payload } => {
                self.alerts.route_backend(&mut self.gate, &payload, now);
            }
            InboundEvent::ControlUpdate { payload } => {
                self.control
                    .apply_server_update(ControlPatch::from_value(&payload));
            }
        }
        true
    }

    // ─────────────────────────────────────────────────────────────────────
    // Operator actions
    // ─────────────────────────────────────────────────────────────────────

    pub fn grant_consent(&mut self) -> bool {
        self.gate.grant_consent()
    }

    pub fn start_experiment(&mut self) -> bool {
        if self.refuse_closed("start_experiment") {
            return false;
        }
        self.control
            .start_experiment(&mut self.gate, &mut self.alerts, &mut self.sink)
    }

    pub fn stop_experiment(&mut self) {
        if self.refuse_closed("stop_experiment") {
            return;
        }
        self.control.stop_experiment(&mut self.sink);
    }

    pub fn update_control_parameters(&mut self, patch: ControlPatch) {
        if self.refuse_closed("update_control_params") {
            return;
        }
        self.control.update_control_parameters(patch, &mut self.sink);
    }

    /// Never refused, not even after `close()`.
    pub fn emergency_stop(&mut self) {
        self.control
            .emergency_stop(&mut self.gate, &mut self.alerts, &mut self.sink);
    }

    pub fn dismiss_alert(&mut self) -> Option<SafetyAlert> {
        self.alerts.dismiss(&mut self.gate)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Timers
    // ─────────────────────────────────────────────────────────────────────

    pub fn alert_deadline(&self) -> Option<Instant> {
        self.alerts.deadline(&self.gate)
    }

    pub fn expire_alerts(&mut self, now: Instant) -> Option<SafetyAlert> {
        self.alerts.expire(&mut self.gate, now)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Read side
    // ─────────────────────────────────────────────────────────────────────

    pub fn snapshot(&self) -> ConsoleSnapshot {
        SessionAdapter::new(self).snapshot()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    pub fn connection(&self) -> &ConnectionState {
        &self.connection
    }

    pub fn streams(&self) -> &StreamReconciler {
        &self.streams
    }

    pub fn gate(&self) -> &SafetyGate {
        &self.gate
    }

    pub fn control(&self) -> &ControlCoordinator {
        &self.control
    }

    pub fn control_state(&self) -> &ControlState {
        self.control.state()
    }

    pub fn active_alert(&self) -> Option<&SafetyAlert> {
        self.gate.active_alert()
    }

    pub fn subscriptions(&self) -> &Subscriptions {
        &self.subscriptions
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    // ─────────────────────────────────────────────────────────────────────
    // Teardown
    // ─────────────────────────────────────────────────────────────────────

    /// Release every listener and the sink. Safe to call more than once.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        let released = self.subscriptions.release_all();
        self.sink.release();
        self.closed = true;
        info!(listeners = released, "session closed");
    }

    fn refuse_closed(&self, op: &str) -> bool {
        if self.closed {
            warn!(op, "session closed; command ignored");
        }
        self.closed
    }
}

impl<S: CommandSink> Drop for Session<S> {
    fn drop(&mut self) {
        self.close();
    }
}
