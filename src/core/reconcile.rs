//! Telemetry reconciliation.
//!
//! Each inbound telemetry event is self-contained: it is normalized into a
//! fresh, immutable snapshot that replaces the previous one for its channel.
//! Nothing is merged across events.
//!
//! Reconciliation is total. A field that is missing, of the wrong type, or
//! outside its domain is treated as absent and its default applies; a
//! sequence containing any non-numeric element is treated as absent as a
//! whole. Malformed telemetry is routine and raises no alert.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

pub const DEFAULT_HEART_RATE: f64 = 70.0;
pub const DEFAULT_HEART_RATE_VARIABILITY: f64 = 45.0;
pub const DEFAULT_SKIN_CONDUCTANCE: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    Neural,
    Biosignal,
    Visual,
}

impl Channel {
    pub fn label(self) -> &'static str {
        match self {
            Channel::Neural => "neural",
            Channel::Biosignal => "biosignal",
            Channel::Visual => "visual",
        }
    }

    pub fn all() -> &'static [Channel] {
        &[Channel::Neural, Channel::Biosignal, Channel::Visual]
    }

    fn index(self) -> usize {
        match self {
            Channel::Neural => 0,
            Channel::Biosignal => 1,
            Channel::Visual => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct NeuralSnapshot {
    pub firing_rate: f64,
    /// Spike timestamps in arrival order.
    pub spike_data: Vec<f64>,
    /// Row-major activity levels.
    pub grid_activity: Vec<Vec<f64>>,
    /// Nominally in [0, 1]; not clamped.
    pub synchrony: f64,
    pub entropy: f64,
}

impl NeuralSnapshot {
    pub fn from_payload(payload: &Value) -> Self {
        Self {
            firing_rate: non_negative(payload, "mean_firing_rate").unwrap_or(0.0),
            spike_data: field(payload, "spike_times")
                .and_then(series)
                .unwrap_or_default(),
            grid_activity: field(payload, "grid_activity")
                .and_then(grid)
                .unwrap_or_default(),
            synchrony: field(payload, "synchrony").and_then(number).unwrap_or(0.0),
            entropy: non_negative(payload, "entropy").unwrap_or(0.0),
        }
    }
}

/// EEG band powers. Absent bands default to zero.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct EegBands {
    #[serde(default)]
    pub alpha: f64,
    #[serde(default)]
    pub beta: f64,
    #[serde(default)]
    pub theta: f64,
    #[serde(default)]
    pub gamma: f64,
}

impl EegBands {
    pub fn from_payload(payload: &Value) -> Self {
        Self {
            alpha: non_negative(payload, "alpha").unwrap_or(0.0),
            beta: non_negative(payload, "beta").unwrap_or(0.0),
            theta: non_negative(payload, "theta").unwrap_or(0.0),
            gamma: non_negative(payload, "gamma").unwrap_or(0.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BiosignalSnapshot {
    pub eeg: EegBands,
    pub heart_rate: f64,
    pub heart_rate_variability: f64,
    pub skin_conductance: f64,
}

impl Default for BiosignalSnapshot {
    fn default() -> Self {
        Self {
            eeg: EegBands::default(),
            heart_rate: DEFAULT_HEART_RATE,
            heart_rate_variability: DEFAULT_HEART_RATE_VARIABILITY,
            skin_conductance: DEFAULT_SKIN_CONDUCTANCE,
        }
    }
}

impl BiosignalSnapshot {
    pub fn from_payload(payload: &Value) -> Self {
        Self {
            eeg: field(payload, "eeg_bands")
                .map(EegBands::from_payload)
                .unwrap_or_default(),
            heart_rate: field(payload, "heart_rate")
                .and_then(number)
                .filter(|v| *v > 0.0)
                .unwrap_or(DEFAULT_HEART_RATE),
            heart_rate_variability: non_negative(payload, "hrv")
                .unwrap_or(DEFAULT_HEART_RATE_VARIABILITY),
            skin_conductance: non_negative(payload, "gsr").unwrap_or(DEFAULT_SKIN_CONDUCTANCE),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct VisualSnapshot {
    /// Opaque image reference (URL or data URI) as sent by the backend.
    pub image: Option<String>,
    pub latent_vector: Vec<f64>,
    pub generation_time_ms: f64,
}

impl VisualSnapshot {
    pub fn from_payload(payload: &Value) -> Self {
        Self {
            image: field(payload, "image")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_owned),
            latent_vector: field(payload, "latent_vector")
                .and_then(series)
                .unwrap_or_default(),
            generation_time_ms: non_negative(payload, "generation_time").unwrap_or(0.0),
        }
    }
}

/// Holds the latest published snapshot per telemetry channel.
///
/// Snapshots are handed out as `Arc`s: a reader keeps the exact snapshot it
/// took even after the channel moves on.
#[derive(Debug, Default)]
pub struct StreamReconciler {
    neural: Arc<NeuralSnapshot>,
    biosignal: Arc<BiosignalSnapshot>,
    visual: Arc<VisualSnapshot>,
    revisions: [u64; 3],
}

impl StreamReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconcile one payload and publish it as the channel's new snapshot.
    pub fn apply(&mut self, channel: Channel, payload: &Value) {
        match channel {
            Channel::Neural => self.neural = Arc::new(NeuralSnapshot::from_payload(payload)),
            Channel::Biosignal => {
                self.biosignal = Arc::new(BiosignalSnapshot::from_payload(payload))
            }
            Channel::Visual => self.visual = Arc::new(VisualSnapshot::from_payload(payload)),
        }
        let rev = &mut self.revisions[channel.index()];
        *rev += 1;
        trace!(channel = channel.label(), revision = *rev, "snapshot published");
    }

    pub fn neural(&self) -> &Arc<NeuralSnapshot> {
        &self.neural
    }

    pub fn biosignal(&self) -> &Arc<BiosignalSnapshot> {
        &self.biosignal
    }

    pub fn visual(&self) -> &Arc<VisualSnapshot> {
        &self.visual
    }

    /// Number of snapshots published on `channel` so far.
    pub fn revision(&self, channel: Channel) -> u64 {
        self.revisions[channel.index()]
    }
}

fn field<'a>(payload: &'a Value, key: &str) -> Option<&'a Value> {
    payload.as_object()?.get(key)
}

fn number(v: &Value) -> Option<f64> {
    v.as_f64().filter(|x| x.is_finite())
}

fn non_negative(payload: &Value, key: &str) -> Option<f64> {
    field(payload, key).and_then(number).filter(|v| *v >= 0.0)
}

fn series(v: &Value) -> Option<Vec<f64>> {
    v.as_array()?.iter().map(number).collect()
}

fn grid(v: &Value) -> Option<Vec<Vec<f64>>> {
    v.as_array()?.iter().map(series).collect()
}
