//! Wire protocol shared by the console and the backend.
//!
//! Frames are newline-delimited JSON objects `{"event": <name>, "data": <payload>}`;
//! `data` may be absent or `null`. The same framing is used in both directions.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::control::{ControlPatch, ControlState};
use crate::error::{ProtocolError, TransportError};
use crate::reconcile::{Channel, EegBands};

// ═══════════════════════════════════════════════════════════════════════════
// Framing
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Frame {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// Encode a typed payload.
    pub fn encode<T: Serialize>(event: &str, payload: &T) -> Result<Self, ProtocolError> {
        Ok(Self::new(event, serde_json::to_value(payload)?))
    }

    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(line.trim())?)
    }

    pub fn to_line(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Inbound (backend → console)
// ═══════════════════════════════════════════════════════════════════════════

/// Every kind of inbound event a session listens for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    Connect,
    Disconnect,
    NeuralUpdate,
    BiosignalUpdate,
    VisualUpdate,
    SafetyAlert,
    ControlUpdate,
}

impl EventKind {
    pub fn label(self) -> &'static str {
        match self {
            EventKind::Connect => "connect",
            EventKind::Disconnect => "disconnect",
            EventKind::NeuralUpdate => "neural_update",
            EventKind::BiosignalUpdate => "biosignal_update",
            EventKind::VisualUpdate => "visual_update",
            EventKind::SafetyAlert => "safety_alert",
            EventKind::ControlUpdate => "control_update",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        Self::all().iter().copied().find(|k| k.label() == label)
    }

    /// True for kinds produced by the transport itself rather than sent on the wire.
    pub fn is_lifecycle(self) -> bool {
        matches!(self, EventKind::Connect | EventKind::Disconnect)
    }

    pub fn all() -> &'static [EventKind] {
        &[
            EventKind::Connect,
            EventKind::Disconnect,
            EventKind::NeuralUpdate,
            EventKind::BiosignalUpdate,
            EventKind::VisualUpdate,
            EventKind::SafetyAlert,
            EventKind::ControlUpdate,
        ]
    }
}

impl From<Channel> for EventKind {
    fn from(channel: Channel) -> Self {
        match channel {
            Channel::Neural => EventKind::NeuralUpdate,
            Channel::Biosignal => EventKind::BiosignalUpdate,
            Channel::Visual => EventKind::VisualUpdate,
        }
    }
}

/// A transport-agnostic inbound event. Payloads stay raw: decoding is
/// lenient and belongs to the component that owns the state.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Connected,
    Disconnected,
    Telemetry { channel: Channel, payload: Value },
    SafetyAlert { payload: Value },
    ControlUpdate { payload: Value },
}

impl InboundEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            InboundEvent::Connected => EventKind::Connect,
            InboundEvent::Disconnected => EventKind::Disconnect,
            InboundEvent::Telemetry { channel, .. } => EventKind::from(*channel),
            InboundEvent::SafetyAlert { .. } => EventKind::SafetyAlert,
            InboundEvent::ControlUpdate { .. } => EventKind::ControlUpdate,
        }
    }

    pub fn from_frame(frame: Frame) -> Result<Self, ProtocolError> {
        let kind = EventKind::from_label(&frame.event)
            .filter(|k| !k.is_lifecycle())
            .ok_or_else(|| ProtocolError::UnknownEvent(frame.event.clone()))?;
        let payload = frame.data;
        Ok(match kind {
            EventKind::NeuralUpdate => InboundEvent::Telemetry {
                channel: Channel::Neural,
                payload,
            },
            EventKind::BiosignalUpdate => InboundEvent::Telemetry {
                channel: Channel::Biosignal,
                payload,
            },
            EventKind::VisualUpdate => InboundEvent::Telemetry {
                channel: Channel::Visual,
                payload,
            },
            EventKind::SafetyAlert => InboundEvent::SafetyAlert { payload },
            EventKind::ControlUpdate => InboundEvent::ControlUpdate { payload },
            EventKind::Connect | EventKind::Disconnect => {
                return Err(ProtocolError::UnknownEvent(frame.event))
            }
        })
    }

    pub fn from_line(line: &str) -> Result<Self, ProtocolError> {
        Self::from_frame(Frame::parse(line)?)
    }

    /// Frame form, used when recording the session.
    pub fn to_frame(&self) -> Frame {
        let label = self.kind().label();
        match self {
            InboundEvent::Connected | InboundEvent::Disconnected => Frame::new(label, Value::Null),
            InboundEvent::Telemetry { payload, .. }
            | InboundEvent::SafetyAlert { payload }
            | InboundEvent::ControlUpdate { payload } => Frame::new(label, payload.clone()),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Outbound (console → backend)
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    StartExperiment {
        modulation_level: f64,
        target_firing_rate: f64,
    },
    StopExperiment,
    UpdateControlParams(ControlPatch),
    EmergencyStop,
}

#[derive(Deserialize)]
struct StartPayload {
    modulation_level: f64,
    target_firing_rate: f64,
}

impl Command {
    pub fn event(&self) -> &'static str {
        match self {
            Command::StartExperiment { .. } => "start_experiment",
            Command::StopExperiment => "stop_experiment",
            Command::UpdateControlParams(_) => "update_control_params",
            Command::EmergencyStop => "emergency_stop",
        }
    }

    pub fn is_emergency(&self) -> bool {
        matches!(self, Command::EmergencyStop)
    }

    pub fn to_frame(&self) -> Frame {
        let data = match self {
            Command::StartExperiment {
                modulation_level,
                target_firing_rate,
            } => json!({
                "modulation_level": modulation_level,
                "target_firing_rate": target_firing_rate,
            }),
            Command::StopExperiment | Command::EmergencyStop => Value::Null,
            Command::UpdateControlParams(patch) => patch.to_value(),
        };
        Frame::new(self.event(), data)
    }

    pub fn to_line(&self) -> Result<String, ProtocolError> {
        self.to_frame().to_line()
    }

    /// Backend-side decode. `start_experiment` must carry both parameters;
    /// `update_control_params` is decoded leniently like any control patch.
    pub fn from_frame(frame: &Frame) -> Result<Self, ProtocolError> {
        match frame.event.as_str() {
            "start_experiment" => {
                let p: StartPayload = serde_json::from_value(frame.data.clone()).map_err(|e| {
                    ProtocolError::InvalidPayload {
                        event: frame.event.clone(),
                        reason: e.to_string(),
                    }
                })?;
                Ok(Command::StartExperiment {
                    modulation_level: p.modulation_level,
                    target_firing_rate: p.target_firing_rate,
                })
            }
            "stop_experiment" => Ok(Command::StopExperiment),
            "update_control_params" => Ok(Command::UpdateControlParams(ControlPatch::from_value(
                &frame.data,
            ))),
            "emergency_stop" => Ok(Command::EmergencyStop),
            other => Err(ProtocolError::UnknownEvent(other.to_string())),
        }
    }
}

/// Where the coordinator hands outbound commands.
///
/// Sends are fire-and-forget: the caller logs a failure and keeps its local
/// optimistic update.
pub trait CommandSink {
    fn send(&mut self, command: &Command) -> Result<(), TransportError>;

    /// Drop any transport resources held for the session.
    fn release(&mut self) {}
}

/// In-memory outbox.
impl CommandSink for Vec<Command> {
    fn send(&mut self, command: &Command) -> Result<(), TransportError> {
        self.push(command.clone());
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Typed payloads (backend encode side)
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NeuralUpdate {
    pub mean_firing_rate: f64,
    pub spike_times: Vec<f64>,
    pub grid_activity: Vec<Vec<f64>>,
    pub synchrony: f64,
    pub entropy: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BiosignalUpdate {
    pub eeg_bands: EegBands,
    pub heart_rate: f64,
    pub hrv: f64,
    pub gsr: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VisualUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub latent_vector: Vec<f64>,
    pub generation_time: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SafetyAlertPayload {
    pub message: String,
}

/// Full authoritative control state, pushed as `control_update`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ControlUpdate(pub ControlState);

impl NeuralUpdate {
    pub fn to_frame(&self) -> Result<Frame, ProtocolError> {
        Frame::encode(EventKind::NeuralUpdate.label(), self)
    }
}

impl BiosignalUpdate {
    pub fn to_frame(&self) -> Result<Frame, ProtocolError> {
        Frame::encode(EventKind::BiosignalUpdate.label(), self)
    }
}

impl VisualUpdate {
    pub fn to_frame(&self) -> Result<Frame, ProtocolError> {
        Frame::encode(EventKind::VisualUpdate.label(), self)
    }
}

impl SafetyAlertPayload {
    pub fn to_frame(&self) -> Result<Frame, ProtocolError> {
        Frame::encode(EventKind::SafetyAlert.label(), self)
    }
}

impl ControlUpdate {
    pub fn to_frame(&self) -> Result<Frame, ProtocolError> {
        Frame::encode(EventKind::ControlUpdate.label(), self)
    }
}
