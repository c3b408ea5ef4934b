//! Authoritative control state and the only path for outbound commands.
//!
//! Every operation applies its local effect optimistically and hands the
//! command to the sink fire-and-forget; nothing waits on the backend.
//! Server `control_update` pushes are merged field by field and win over
//! older local writes, in arrival order.
//!
//! Emergency stop is never gated. After one, a halt latch keeps in-flight
//! pushes from re-raising `isRunning` or `modulationLevel` until the backend
//! has confirmed every halt sent (one push carrying both `isRunning: false`
//! and `modulationLevel: 0` per emergency stop) or the operator starts again
//! under consent. A plain stop acknowledgement does not count as a
//! confirmation.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::alerts::{AlertRouter, CONSENT_REQUIRED_MESSAGE, EMERGENCY_STOP_MESSAGE};
use crate::protocol::{Command, CommandSink};
use crate::safety::{SafetyGate, Severity};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlState {
    pub is_running: bool,
    pub modulation_level: f64,
    pub target_firing_rate: f64,
    pub stimulus_intensity: f64,
}

impl Default for ControlState {
    fn default() -> Self {
        Self {
            is_running: false,
            modulation_level: 0.0,
            target_firing_rate: 0.5,
            stimulus_intensity: 0.5,
        }
    }
}

impl ControlState {
    /// Field-level merge: only the fields present in `patch` change.
    pub fn apply(&mut self, patch: &ControlPatch) {
        if let Some(v) = patch.is_running {
            self.is_running = v;
        }
        if let Some(v) = patch.modulation_level {
            self.modulation_level = v;
        }
        if let Some(v) = patch.target_firing_rate {
            self.target_firing_rate = v;
        }
        if let Some(v) = patch.stimulus_intensity {
            self.stimulus_intensity = v;
        }
    }
}

/// A partial `ControlState`, as carried by `update_control_params` and
/// `control_update`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_running: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modulation_level: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_firing_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stimulus_intensity: Option<f64>,
}

impl ControlPatch {
    pub fn with_running(mut self, v: bool) -> Self {
        self.is_running = Some(v);
        self
    }

    pub fn with_modulation_level(mut self, v: f64) -> Self {
        self.modulation_level = Some(v);
        self
    }

    pub fn with_target_firing_rate(mut self, v: f64) -> Self {
        self.target_firing_rate = Some(v);
        self
    }

    pub fn with_stimulus_intensity(mut self, v: f64) -> Self {
        self.stimulus_intensity = Some(v);
        self
    }

    /// Drop fields that cannot be represented on the wire.
    pub fn finite(mut self) -> Self {
        self.modulation_level = self.modulation_level.filter(|v| v.is_finite());
        self.target_firing_rate = self.target_firing_rate.filter(|v| v.is_finite());
        self.stimulus_intensity = self.stimulus_intensity.filter(|v| v.is_finite());
        self
    }

    /// The backend's acknowledgement of an emergency stop.
    fn is_halt_confirmation(&self) -> bool {
        self.is_running == Some(false) && self.modulation_level == Some(0.0)
    }

    pub fn is_empty(&self) -> bool {
        self.is_running.is_none()
            && self.modulation_level.is_none()
            && self.target_firing_rate.is_none()
            && self.stimulus_intensity.is_none()
    }

    /// Lenient decode: fields of the wrong type are treated as absent.
    pub fn from_value(payload: &Value) -> Self {
        let number = |key: &str| {
            payload
                .get(key)
                .and_then(Value::as_f64)
                .filter(|v| v.is_finite())
        };
        Self {
            is_running: payload.get("isRunning").and_then(Value::as_bool),
            modulation_level: number("modulationLevel"),
            target_firing_rate: number("targetFiringRate"),
            stimulus_intensity: number("stimulusIntensity"),
        }
    }

    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        if let Some(v) = self.is_running {
            map.insert("isRunning".into(), Value::Bool(v));
        }
        let mut number = |key: &str, v: Option<f64>| {
            if let Some(n) = v.and_then(serde_json::Number::from_f64) {
                map.insert(key.into(), Value::Number(n));
            }
        };
        number("modulationLevel", self.modulation_level);
        number("targetFiringRate", self.target_firing_rate);
        number("stimulusIntensity", self.stimulus_intensity);
        Value::Object(map)
    }
}

#[derive(Debug, Default)]
pub struct ControlCoordinator {
    state: ControlState,
    /// Emergency stops not yet confirmed by the backend.
    pending_halts: u32,
}

impl ControlCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: ControlState) -> Self {
        Self {
            state,
            pending_halts: 0,
        }
    }

    pub fn state(&self) -> &ControlState {
        &self.state
    }

    pub fn is_halt_latched(&self) -> bool {
        self.pending_halts > 0
    }

    /// Start stimulation. Refused without consent: nothing is sent, state is
    /// untouched and a warning alert is raised. Returns whether the command
    /// was issued.
    pub fn start_experiment<S: CommandSink + ?Sized>(
        &mut self,
        gate: &mut SafetyGate,
        alerts: &mut AlertRouter,
        sink: &mut S,
    ) -> bool {
        if !gate.is_consent_granted() {
            warn!("start refused: consent not granted");
            alerts.route_local(gate, Severity::Warning, CONSENT_REQUIRED_MESSAGE, Instant::now());
            return false;
        }

        dispatch(
            sink,
            Command::StartExperiment {
                modulation_level: self.state.modulation_level,
                target_firing_rate: self.state.target_firing_rate,
            },
        );
        self.state.is_running = true;
        if self.is_halt_latched() {
            info!("operator restart releases emergency latch");
            self.pending_halts = 0;
        }
        true
    }

    pub fn stop_experiment<S: CommandSink + ?Sized>(&mut self, sink: &mut S) {
        dispatch(sink, Command::StopExperiment);
        self.state.is_running = false;
    }

    pub fn update_control_parameters<S: CommandSink + ?Sized>(
        &mut self,
        patch: ControlPatch,
        sink: &mut S,
    ) {
        let finite = patch.finite();
        if finite != patch {
            warn!("non-finite parameter values rejected");
        }
        let patch = finite;
        if patch.is_empty() {
            debug!("empty parameter update ignored");
            return;
        }
        self.state.apply(&patch);
        dispatch(sink, Command::UpdateControlParams(patch));
    }

    /// Unconditional halt. Safe to call repeatedly: each call re-sends the
    /// command, re-zeroes modulation and re-confirms with an info alert.
    pub fn emergency_stop<S: CommandSink + ?Sized>(
        &mut self,
        gate: &mut SafetyGate,
        alerts: &mut AlertRouter,
        sink: &mut S,
    ) {
        self.state.is_running = false;
        self.state.modulation_level = 0.0;
        self.pending_halts = self.pending_halts.saturating_add(1);
        warn!("EMERGENCY STOP");
        dispatch(sink, Command::EmergencyStop);
        alerts.route_local(gate, Severity::Info, EMERGENCY_STOP_MESSAGE, Instant::now());
    }

    /// Merge a backend `control_update`. Returns the part that was applied.
    pub fn apply_server_update(&mut self, mut patch: ControlPatch) -> ControlPatch {
        if self.is_halt_latched() {
            let confirms_halt = patch.is_halt_confirmation();
            if patch.is_running == Some(true) {
                debug!("latched: dropping isRunning=true from push");
                patch.is_running = None;
            }
            if patch.modulation_level.is_some_and(|m| m > 0.0) {
                debug!("latched: dropping non-zero modulationLevel from push");
                patch.modulation_level = None;
            }
            if confirms_halt {
                self.pending_halts -= 1;
                if self.pending_halts == 0 {
                    info!("backend confirmed halt; emergency latch released");
                } else {
                    debug!(pending = self.pending_halts, "halt confirmed; more outstanding");
                }
            }
        }
        self.state.apply(&patch);
        patch
    }
}

fn dispatch<S: CommandSink + ?Sized>(sink: &mut S, command: Command) {
    if let Err(e) = sink.send(&command) {
        warn!(event = command.event(), error = %e, "command not delivered to transport");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use serde_json::json;

    struct Rig {
        gate: SafetyGate,
        alerts: AlertRouter,
        sent: Vec<Command>,
        control: ControlCoordinator,
    }

    impl Rig {
        fn new() -> Self {
            Self {
                gate: SafetyGate::new(),
                alerts: AlertRouter::default(),
                sent: Vec::new(),
                control: ControlCoordinator::new(),
            }
        }

        fn start(&mut self) -> bool {
            self.control
                .start_experiment(&mut self.gate, &mut self.alerts, &mut self.sent)
        }

        fn estop(&mut self) {
            self.control
                .emergency_stop(&mut self.gate, &mut self.alerts, &mut self.sent);
        }
    }

    struct DeadSink;

    impl CommandSink for DeadSink {
        fn send(&mut self, _command: &Command) -> Result<(), TransportError> {
            Err(TransportError::Closed)
        }
    }

    #[test]
    fn start_without_consent_is_a_policy_rejection() {
        let mut rig = Rig::new();
        let before = *rig.control.state();

        assert!(!rig.start());

        assert!(rig.sent.is_empty());
        assert_eq!(*rig.control.state(), before);
        assert!(!rig.control.state().is_running);
        let alert = rig.gate.active_alert().expect("warning raised");
        assert_eq!(alert.severity, Severity::Warning);
        assert!(alert.message.to_lowercase().contains("consent"));
        assert_eq!(rig.gate.alerts_raised(), 1);
    }

    #[test]
    fn start_with_consent_sends_current_parameters() {
        let mut rig = Rig::new();
        rig.gate.grant_consent();
        rig.control = ControlCoordinator::with_state(ControlState {
            modulation_level: 0.5,
            target_firing_rate: 0.6,
            ..ControlState::default()
        });

        assert!(rig.start());

        assert_eq!(
            rig.sent,
            vec![Command::StartExperiment {
                modulation_level: 0.5,
                target_firing_rate: 0.6
            }]
        );
        assert!(rig.control.state().is_running);
        assert!(rig.gate.active_alert().is_none());
    }

    #[test]
    fn stop_needs_no_consent() {
        let mut rig = Rig::new();
        rig.control.stop_experiment(&mut rig.sent);
        assert_eq!(rig.sent, vec![Command::StopExperiment]);
        assert!(!rig.control.state().is_running);
    }

    #[test]
    fn partial_update_touches_only_named_fields() {
        let mut rig = Rig::new();
        let patch = ControlPatch::default().with_modulation_level(0.8);
        rig.control.update_control_parameters(patch, &mut rig.sent);

        let state = rig.control.state();
        assert_eq!(state.modulation_level, 0.8);
        assert_eq!(state.target_firing_rate, 0.5);
        assert_eq!(state.stimulus_intensity, 0.5);
        assert!(!state.is_running);
        assert_eq!(rig.sent, vec![Command::UpdateControlParams(patch)]);
    }

    #[test]
    fn emergency_stop_zeroes_and_confirms() {
        let mut rig = Rig::new();
        rig.control = ControlCoordinator::with_state(ControlState {
            is_running: true,
            modulation_level: 0.9,
            ..ControlState::default()
        });

        rig.estop();

        assert_eq!(rig.sent, vec![Command::EmergencyStop]);
        assert!(!rig.control.state().is_running);
        assert_eq!(rig.control.state().modulation_level, 0.0);
        assert_eq!(rig.gate.active_alert().unwrap().severity, Severity::Info);
    }

    #[test]
    fn emergency_stop_is_idempotent() {
        let mut rig = Rig::new();
        rig.control = ControlCoordinator::with_state(ControlState {
            is_running: true,
            modulation_level: 0.7,
            ..ControlState::default()
        });

        rig.estop();
        let first_alert = rig.gate.active_alert().unwrap().id;
        assert_eq!(rig.control.state().modulation_level, 0.0);
        rig.estop();

        assert!(!rig.control.state().is_running);
        assert_eq!(rig.control.state().modulation_level, 0.0);
        assert_eq!(rig.sent, vec![Command::EmergencyStop, Command::EmergencyStop]);
        assert_ne!(rig.gate.active_alert().unwrap().id, first_alert);
        assert_eq!(rig.gate.active_alert().unwrap().severity, Severity::Info);
    }

    #[test]
    fn emergency_stop_ignores_consent_and_active_alerts() {
        let mut rig = Rig::new();
        assert!(!rig.start());
        assert_eq!(rig.gate.active_alert().unwrap().severity, Severity::Warning);

        rig.estop();

        assert_eq!(rig.sent, vec![Command::EmergencyStop]);
        assert_eq!(rig.gate.active_alert().unwrap().severity, Severity::Info);
    }

    #[test]
    fn failed_delivery_keeps_the_local_effect() {
        let mut gate = SafetyGate::new();
        let mut alerts = AlertRouter::default();
        let mut control = ControlCoordinator::with_state(ControlState {
            is_running: true,
            modulation_level: 0.4,
            ..ControlState::default()
        });

        control.emergency_stop(&mut gate, &mut alerts, &mut DeadSink);

        assert!(!control.state().is_running);
        assert_eq!(control.state().modulation_level, 0.0);
    }

    #[test]
    fn server_push_wins_over_optimistic_start() {
        let mut rig = Rig::new();
        rig.gate.grant_consent();
        rig.start();
        assert!(rig.control.state().is_running);

        rig.control
            .apply_server_update(ControlPatch::from_value(&json!({ "isRunning": false })));

        assert!(!rig.control.state().is_running);
    }

    #[test]
    fn server_push_merges_only_present_fields() {
        let mut control = ControlCoordinator::new();
        control.apply_server_update(ControlPatch::from_value(&json!({
            "targetFiringRate": 0.7,
            "stimulusIntensity": "loud",
        })));
        let state = control.state();
        assert_eq!(state.target_firing_rate, 0.7);
        assert_eq!(state.stimulus_intensity, 0.5);
        assert_eq!(state.modulation_level, 0.0);
    }

    #[test]
    fn stale_push_cannot_undo_emergency_stop() {
        let mut rig = Rig::new();
        rig.gate.grant_consent();
        rig.start();
        rig.estop();

        // Sent by the backend before it saw the halt.
        let applied = rig.control.apply_server_update(ControlPatch::from_value(&json!({
            "isRunning": true,
            "modulationLevel": 0.6,
            "targetFiringRate": 0.55,
        })));

        assert_eq!(applied, ControlPatch::default().with_target_firing_rate(0.55));
        assert!(!rig.control.state().is_running);
        assert_eq!(rig.control.state().modulation_level, 0.0);
        assert!(rig.control.is_halt_latched());
    }

    #[test]
    fn halt_confirmation_releases_latch() {
        let mut rig = Rig::new();
        rig.estop();
        rig.control.apply_server_update(
            ControlPatch::default()
                .with_running(false)
                .with_modulation_level(0.0),
        );
        assert!(!rig.control.is_halt_latched());

        rig.control
            .apply_server_update(ControlPatch::default().with_modulation_level(0.3));
        assert_eq!(rig.control.state().modulation_level, 0.3);
    }

    #[test]
    fn stale_acks_sent_before_the_halt_keep_the_latch() {
        let mut rig = Rig::new();
        rig.gate.grant_consent();
        rig.control.stop_experiment(&mut rig.sent);
        rig.control.update_control_parameters(
            ControlPatch::default().with_modulation_level(0.5),
            &mut rig.sent,
        );
        rig.start();
        rig.estop();

        // Acks arrive in the order the backend processed the commands.
        let stop_ack = json!({ "isRunning": false, "modulationLevel": 0.5, "targetFiringRate": 0.5 });
        let start_ack = json!({ "isRunning": true, "modulationLevel": 0.5, "targetFiringRate": 0.5 });
        rig.control.apply_server_update(ControlPatch::from_value(&stop_ack));
        rig.control.apply_server_update(ControlPatch::from_value(&start_ack));

        assert!(rig.control.is_halt_latched());
        assert!(!rig.control.state().is_running);
        assert_eq!(rig.control.state().modulation_level, 0.0);

        let halt_ack = json!({ "isRunning": false, "modulationLevel": 0.0, "targetFiringRate": 0.5 });
        rig.control.apply_server_update(ControlPatch::from_value(&halt_ack));
        assert!(!rig.control.is_halt_latched());
    }

    #[test]
    fn every_emergency_stop_needs_its_own_confirmation() {
        let mut rig = Rig::new();
        rig.estop();
        rig.estop();
        let halt = ControlPatch::default()
            .with_running(false)
            .with_modulation_level(0.0);

        rig.control.apply_server_update(halt);
        assert!(rig.control.is_halt_latched());
        rig.control
            .apply_server_update(ControlPatch::default().with_running(true));
        assert!(!rig.control.state().is_running);

        rig.control.apply_server_update(halt);
        assert!(!rig.control.is_halt_latched());
    }

    #[test]
    fn non_finite_parameters_are_neither_applied_nor_sent() {
        let mut rig = Rig::new();
        let patch = ControlPatch::default()
            .with_modulation_level(f64::NAN)
            .with_stimulus_intensity(0.7);
        rig.control.update_control_parameters(patch, &mut rig.sent);

        assert_eq!(rig.control.state().modulation_level, 0.0);
        assert_eq!(rig.control.state().stimulus_intensity, 0.7);
        assert_eq!(
            rig.sent,
            vec![Command::UpdateControlParams(
                ControlPatch::default().with_stimulus_intensity(0.7)
            )]
        );

        rig.control.update_control_parameters(
            ControlPatch::default().with_target_firing_rate(f64::INFINITY),
            &mut rig.sent,
        );
        assert_eq!(rig.sent.len(), 1);
        assert_eq!(rig.control.state().target_firing_rate, 0.5);
    }

    #[test]
    fn consented_restart_releases_latch() {
        let mut rig = Rig::new();
        rig.gate.grant_consent();
        rig.estop();
        assert!(rig.start());
        assert!(!rig.control.is_halt_latched());
        assert!(rig.control.state().is_running);
    }

    #[test]
    fn patch_round_trips_through_wire_shape() {
        let patch = ControlPatch::default()
            .with_running(true)
            .with_stimulus_intensity(0.25);
        let value = patch.to_value();
        assert_eq!(value, json!({ "isRunning": true, "stimulusIntensity": 0.25 }));
        assert_eq!(ControlPatch::from_value(&value), patch);
        assert_eq!(serde_json::to_value(patch).unwrap(), value);
    }
}
