//! Session data log.
//!
//! One JSON object per line: `{"ts_ms", "direction", "event", "data"}` where
//! `ts_ms` is wall-clock milliseconds since the Unix epoch. Used by the
//! console to record a session and by the backend as its data log.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::error::TransportError;
use crate::protocol::{Command, CommandSink, Frame, InboundEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub ts_ms: u64,
    pub direction: Direction,
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

pub struct Recorder<W: Write = BufWriter<File>> {
    out: W,
    written: u64,
}

impl Recorder {
    /// Append to `path`, creating it (and its directory) if needed.
    pub fn create(path: &Path) -> io::Result<Self> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        info!(path = %path.display(), "recording to file");
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write> Recorder<W> {
    pub fn new(out: W) -> Self {
        Self { out, written: 0 }
    }

    pub fn record(&mut self, direction: Direction, frame: &Frame) -> io::Result<()> {
        #[derive(Serialize)]
        struct Line<'a> {
            ts_ms: u64,
            direction: Direction,
            event: &'a str,
            data: &'a Value,
        }

        let line = Line {
            ts_ms: now_ms(),
            direction,
            event: &frame.event,
            data: &frame.data,
        };
        serde_json::to_writer(&mut self.out, &line)?;
        self.out.write_all(b"\n")?;
        self.written += 1;
        Ok(())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Wraps a sink and records every outbound command before forwarding it.
/// Recording failures are logged; the command is forwarded regardless.
pub struct RecordingSink<S, W: Write = BufWriter<File>> {
    inner: S,
    recorder: Option<Recorder<W>>,
}

impl<S: CommandSink, W: Write> RecordingSink<S, W> {
    pub fn new(inner: S, recorder: Option<Recorder<W>>) -> Self {
        Self { inner, recorder }
    }

    pub fn is_recording(&self) -> bool {
        self.recorder.is_some()
    }

    /// Record an event received from the backend.
    pub fn record_inbound(&mut self, event: &InboundEvent) {
        self.write(Direction::Inbound, &event.to_frame());
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn recorder(&self) -> Option<&Recorder<W>> {
        self.recorder.as_ref()
    }

    fn write(&mut self, direction: Direction, frame: &Frame) {
        if let Some(rec) = &mut self.recorder {
            if let Err(e) = rec.record(direction, frame) {
                warn!(event = %frame.event, error = %e, "session recording failed");
            }
        }
    }
}

impl<S: CommandSink, W: Write> CommandSink for RecordingSink<S, W> {
    fn send(&mut self, command: &Command) -> Result<(), TransportError> {
        self.write(Direction::Outbound, &command.to_frame());
        self.inner.send(command)
    }

    fn release(&mut self) {
        if let Some(rec) = &mut self.recorder {
            if let Err(e) = rec.flush() {
                warn!(error = %e, "failed to flush session recording");
            }
        }
        self.inner.release();
    }
}
