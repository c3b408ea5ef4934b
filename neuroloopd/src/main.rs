//! neuroloopd - reference closed-loop stimulation backend
//!
//! Speaks the console's line-delimited JSON protocol over TCP:
//! - Streams neural, biosignal and visual telemetry while an experiment runs
//! - Closes the loop with a PID controller on the mean firing rate
//! - Acknowledges every command with the full control state
//! - Raises safety alerts on heart-rate and firing-rate excursions
//!
//! Data log: `<data dir>/neuroloop/neuroloopd.jsonl`

use std::sync::Arc;
use std::time::Duration;

use neuroloop::control::ControlState;
use neuroloop::error::ProtocolError;
use neuroloop::paths::AppPaths;
use neuroloop::protocol::{Command, ControlUpdate, Frame, SafetyAlertPayload};
use neuroloop::recorder::{Direction, Recorder};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::RwLock;
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info, warn};

mod sim;
mod stimulus;

use sim::NeuralSim;
use stimulus::StimulusController;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Telemetry ticks between PID updates.
const PID_EVERY: u64 = 10;
/// Telemetry ticks between visual frames.
const VISUAL_EVERY: u64 = 5;

const HEART_RATE_LIMIT: f64 = 120.0;
const FIRING_RATE_LIMIT: f64 = 0.95;

// ═══════════════════════════════════════════════════════════════════════════
// Arguments
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq)]
struct Args {
    addr: String,
    tick_ms: u64,
    seed: u64,
    log: bool,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8000".to_string(),
            tick_ms: 100,
            seed: 42,
            log: true,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
enum ArgsError {
    #[error("missing value for {0}")]
    MissingValue(String),
    #[error("invalid value for {flag}: {value:?}")]
    InvalidValue { flag: String, value: String },
    #[error("unknown argument {0:?}")]
    Unknown(String),
}

fn usage(code: i32) -> ! {
    eprintln!("neuroloopd (listens on 127.0.0.1:8000 by default)");
    eprintln!("Usage: neuroloopd [--addr host:port] [--tick-ms N] [--seed N] [--no-log]\n");
    eprintln!("  --addr host:port    Listen address");
    eprintln!("  --tick-ms N         Telemetry period in milliseconds (10-10000)");
    eprintln!("  --seed N            Simulation seed");
    eprintln!("  --no-log            Do not write the backend data log");
    std::process::exit(code);
}

/// `Ok(None)` means help was requested.
fn parse_args<I>(args: I) -> Result<Option<Args>, ArgsError>
where
    I: IntoIterator<Item = String>,
{
    let mut out = Args::default();
    let mut args = args.into_iter();
    while let Some(flag) = args.next() {
        match flag.as_str() {
            "-h" | "--help" => return Ok(None),
            "--no-log" => out.log = false,
            "--addr" | "--tick-ms" | "--seed" => {
                let value = args
                    .next()
                    .ok_or_else(|| ArgsError::MissingValue(flag.clone()))?;
                let invalid = || ArgsError::InvalidValue {
                    flag: flag.clone(),
                    value: value.clone(),
                };
                match flag.as_str() {
                    "--addr" => out.addr = value.clone(),
                    "--tick-ms" => {
                        let ms: u64 = value.parse().map_err(|_| invalid())?;
                        if !(10..=10_000).contains(&ms) {
                            return Err(invalid());
                        }
                        out.tick_ms = ms;
                    }
                    _ => out.seed = value.parse().map_err(|_| invalid())?,
                }
            }
            _ => return Err(ArgsError::Unknown(flag)),
        }
    }
    Ok(Some(out))
}

// ═══════════════════════════════════════════════════════════════════════════
// Daemon State
// ═══════════════════════════════════════════════════════════════════════════

struct DaemonState {
    control: ControlState,
    pid: StimulusController,
    sim: NeuralSim,
    ticks: u64,
    heart_rate_alarm: bool,
    firing_rate_alarm: bool,
    recorder: Option<Recorder>,
}

impl DaemonState {
    fn new(seed: u64, recorder: Option<Recorder>) -> Self {
        let control = ControlState::default();
        Self {
            pid: StimulusController::new(control.target_firing_rate),
            control,
            sim: NeuralSim::new(seed),
            ticks: 0,
            heart_rate_alarm: false,
            firing_rate_alarm: false,
            recorder,
        }
    }

    fn control_frame(&self) -> Result<Frame, ProtocolError> {
        ControlUpdate(self.control).to_frame()
    }

    /// Apply one operator command. Returns the acknowledgement frame.
    fn apply_command(&mut self, command: &Command) -> Result<Frame, ProtocolError> {
        self.record(Direction::Inbound, &command.to_frame());
        match command {
            Command::StartExperiment {
                modulation_level,
                target_firing_rate,
            } => {
                self.control.modulation_level = *modulation_level;
                self.control.target_firing_rate = *target_firing_rate;
                self.control.is_running = true;
                self.pid.set_setpoint(*target_firing_rate);
                self.pid.reset();
                info!(
                    "Experiment started: modulation {:.2}, target {:.2}",
                    modulation_level, target_firing_rate
                );
            }
            Command::StopExperiment => {
                self.control.is_running = false;
                info!("Experiment stopped");
            }
            Command::UpdateControlParams(patch) => {
                // The run flag is owned by start/stop/emergency commands.
                let mut patch = *patch;
                patch.is_running = None;
                self.control.apply(&patch);
                if let Some(target) = patch.target_firing_rate {
                    self.pid.set_setpoint(target);
                }
                info!("Control parameters updated: {:?}", self.control);
            }
            Command::EmergencyStop => {
                self.control.is_running = false;
                self.control.modulation_level = 0.0;
                self.pid.reset();
                warn!("EMERGENCY STOP: stimulation halted");
            }
        }
        let ack = self.control_frame()?;
        self.record(Direction::Outbound, &ack);
        Ok(ack)
    }

    /// Advance the simulation one telemetry period. Emits nothing while idle.
    fn tick(&mut self, period: Duration) -> Result<Vec<Frame>, ProtocolError> {
        if !self.control.is_running {
            return Ok(Vec::new());
        }
        self.ticks += 1;

        let dt_ms = period.as_secs_f64() * 1000.0;
        let neural = self
            .sim
            .step(self.control.modulation_level, self.control.stimulus_intensity, dt_ms);
        let biosignal = self.sim.biosignals();
        let firing_rate = neural.mean_firing_rate;
        let heart_rate = biosignal.heart_rate;

        let mut frames = vec![neural.to_frame()?, biosignal.to_frame()?];
        if self.ticks % VISUAL_EVERY == 0 {
            frames.push(self.sim.visual().to_frame()?);
        }
        if self.ticks % PID_EVERY == 0 {
            let dt = period.as_secs_f64() * PID_EVERY as f64;
            self.control.modulation_level = self.pid.update(firing_rate, dt);
            frames.push(self.control_frame()?);
        }
        for alert in self.check_safety(heart_rate, firing_rate) {
            frames.push(alert.to_frame()?);
        }

        for frame in &frames {
            self.record(Direction::Outbound, frame);
        }
        Ok(frames)
    }

    /// One alert per excursion: a limit re-arms once the value is back in range.
    fn check_safety(&mut self, heart_rate: f64, firing_rate: f64) -> Vec<SafetyAlertPayload> {
        let mut alerts = Vec::new();

        if heart_rate > HEART_RATE_LIMIT {
            if !self.heart_rate_alarm {
                self.heart_rate_alarm = true;
                warn!("Heart rate {:.0} bpm above limit", heart_rate);
                alerts.push(SafetyAlertPayload {
                    message: format!(
                        "Heart rate {:.0} bpm exceeds safe limit ({:.0} bpm)",
                        heart_rate, HEART_RATE_LIMIT
                    ),
                });
            }
        } else {
            self.heart_rate_alarm = false;
        }

        if firing_rate > FIRING_RATE_LIMIT {
            if !self.firing_rate_alarm {
                self.firing_rate_alarm = true;
                warn!("Firing rate {:.3} above limit", firing_rate);
                alerts.push(SafetyAlertPayload {
                    message: format!(
                        "Neural firing rate {:.2} exceeds safe limit ({:.2})",
                        firing_rate, FIRING_RATE_LIMIT
                    ),
                });
            }
        } else {
            self.firing_rate_alarm = false;
        }

        alerts
    }

    fn record(&mut self, direction: Direction, frame: &Frame) {
        if let Some(rec) = &mut self.recorder {
            if let Err(e) = rec.record(direction, frame) {
                error!("Data log write failed, disabling log: {}", e);
                self.recorder = None;
            }
        }
    }

    fn flush_log(&mut self) {
        if let Some(rec) = &mut self.recorder {
            if let Err(e) = rec.flush() {
                error!("Data log flush failed: {}", e);
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Client Handler
// ═══════════════════════════════════════════════════════════════════════════

fn broadcast(tx: &broadcast::Sender<String>, frame: &Frame) {
    match frame.to_line() {
        // No receivers just means no client is connected.
        Ok(line) => {
            let _ = tx.send(line);
        }
        Err(e) => error!("Failed to encode {} frame: {}", frame.event, e),
    }
}

async fn write_line(writer: &mut OwnedWriteHalf, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await
}

async fn handle_line(
    line: &str,
    state: &RwLock<DaemonState>,
    tx: &broadcast::Sender<String>,
) -> Result<(), BoxError> {
    if line.trim().is_empty() {
        return Ok(());
    }
    let command = match Frame::parse(line).and_then(|f| Command::from_frame(&f)) {
        Ok(command) => command,
        Err(e) => {
            warn!("Rejected frame: {}", e);
            return Ok(());
        }
    };
    let ack = state.write().await.apply_command(&command)?;
    broadcast(tx, &ack);
    Ok(())
}

async fn handle_client(
    stream: TcpStream,
    state: Arc<RwLock<DaemonState>>,
    tx: broadcast::Sender<String>,
) -> Result<(), BoxError> {
    let mut rx = tx.subscribe();
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    // Sync the new client to the current control state.
    let hello = state.read().await.control_frame()?;
    write_line(&mut writer, &hello.to_line()?).await?;

    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => handle_line(&line, &state, &tx).await?,
                None => break,
            },
            msg = rx.recv() => match msg {
                Ok(line) => write_line(&mut writer, &line).await?,
                Err(RecvError::Lagged(n)) => warn!("Client lagging; skipped {} frames", n),
                Err(RecvError::Closed) => break,
            },
        }
    }

    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
// Main
// ═══════════════════════════════════════════════════════════════════════════

fn open_data_log() -> Option<Recorder> {
    let paths = match AppPaths::new() {
        Ok(paths) => paths,
        Err(e) => {
            warn!("No data directory, data log disabled: {}", e);
            return None;
        }
    };
    info!("Data directory: {:?}", paths.data_dir());
    match Recorder::create(&paths.backend_log_file()) {
        Ok(rec) => Some(rec),
        Err(e) => {
            warn!("Could not open data log: {}", e);
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let args = match parse_args(std::env::args().skip(1)) {
        Ok(Some(args)) => args,
        Ok(None) => usage(0),
        Err(e) => {
            eprintln!("{e}\n");
            usage(2);
        }
    };

    let recorder = if args.log { open_data_log() } else { None };
    let state = Arc::new(RwLock::new(DaemonState::new(args.seed, recorder)));
    let (tx, _) = broadcast::channel::<String>(256);

    // Flush the data log on Ctrl-C.
    {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                state.write().await.flush_log();
                info!("Ctrl-C: data log flushed, exiting");
                std::process::exit(0);
            }
        });
    }

    let listener = TcpListener::bind(&args.addr).await?;
    info!("neuroloopd listening on {}", args.addr);

    // Telemetry loop
    {
        let state = Arc::clone(&state);
        let tx = tx.clone();
        let period = Duration::from_millis(args.tick_ms);
        tokio::spawn(async move {
            let mut interval = time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let frames = state.write().await.tick(period);
                match frames {
                    Ok(frames) => frames.iter().for_each(|f| broadcast(&tx, f)),
                    Err(e) => error!("Telemetry encode failed: {}", e),
                }
            }
        });
    }

    // Accept client connections
    loop {
        let (stream, addr) = listener.accept().await?;
        info!("Client connected: {}", addr);
        let state = Arc::clone(&state);
        let tx = tx.clone();

        tokio::spawn(async move {
            match handle_client(stream, state, tx).await {
                Ok(()) => info!("Client disconnected: {}", addr),
                Err(e) => error!("Client handler error: {}", e),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use neuroloop::control::ControlPatch;

    const PERIOD: Duration = Duration::from_millis(100);

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn running_state() -> DaemonState {
        let mut s = DaemonState::new(5, None);
        s.apply_command(&Command::StartExperiment {
            modulation_level: 0.3,
            target_firing_rate: 0.5,
        })
        .unwrap();
        s
    }

    fn events(frames: &[Frame]) -> Vec<&str> {
        frames.iter().map(|f| f.event.as_str()).collect()
    }

    #[test]
    fn parses_arguments() {
        assert_eq!(parse_args(args(&[])).unwrap(), Some(Args::default()));
        let a = parse_args(args(&["--addr", "0.0.0.0:9000", "--tick-ms", "50", "--no-log"]))
            .unwrap()
            .unwrap();
        assert_eq!(a.addr, "0.0.0.0:9000");
        assert_eq!(a.tick_ms, 50);
        assert!(!a.log);
        assert_eq!(parse_args(args(&["--help"])).unwrap(), None);
        assert!(matches!(
            parse_args(args(&["--tick-ms", "1"])),
            Err(ArgsError::InvalidValue { .. })
        ));
        assert!(matches!(parse_args(args(&["--seed"])), Err(ArgsError::MissingValue(_))));
        assert!(matches!(parse_args(args(&["serve"])), Err(ArgsError::Unknown(_))));
    }

    #[test]
    fn start_is_acknowledged_with_full_state() {
        let mut s = DaemonState::new(1, None);
        let ack = s
            .apply_command(&Command::StartExperiment {
                modulation_level: 0.5,
                target_firing_rate: 0.6,
            })
            .unwrap();
        assert_eq!(ack.event, "control_update");
        let patch = ControlPatch::from_value(&ack.data);
        assert_eq!(patch.is_running, Some(true));
        assert_eq!(patch.modulation_level, Some(0.5));
        assert_eq!(patch.target_firing_rate, Some(0.6));
        assert_eq!(s.pid.setpoint(), 0.6);
    }

    #[test]
    fn emergency_stop_halts_and_zeroes() {
        let mut s = running_state();
        let ack = s.apply_command(&Command::EmergencyStop).unwrap();
        assert!(!s.control.is_running);
        assert_eq!(s.control.modulation_level, 0.0);
        assert_eq!(ack.data["isRunning"], false);
        assert!(s.tick(PERIOD).unwrap().is_empty());
    }

    #[test]
    fn parameter_update_moves_the_setpoint_but_not_the_run_flag() {
        let mut s = DaemonState::new(1, None);
        s.apply_command(&Command::UpdateControlParams(
            ControlPatch::default()
                .with_running(true)
                .with_target_firing_rate(0.7),
        ))
        .unwrap();
        assert!(!s.control.is_running);
        assert_eq!(s.control.target_firing_rate, 0.7);
        assert_eq!(s.pid.setpoint(), 0.7);
    }

    #[test]
    fn idle_daemon_emits_no_telemetry() {
        let mut s = DaemonState::new(1, None);
        assert!(s.tick(PERIOD).unwrap().is_empty());
    }

    #[test]
    fn running_ticks_stream_telemetry_and_close_the_loop() {
        let mut s = running_state();
        for i in 1..=10u64 {
            let frames = s.tick(PERIOD).unwrap();
            let evs = events(&frames);
            assert_eq!(&evs[..2], ["neural_update", "biosignal_update"]);
            assert_eq!(evs.contains(&"visual_update"), i % VISUAL_EVERY == 0);
            assert_eq!(evs.contains(&"control_update"), i % PID_EVERY == 0);
        }
        assert!((0.0..=1.0).contains(&s.control.modulation_level));
    }

    #[test]
    fn safety_alerts_fire_once_per_excursion() {
        let mut s = DaemonState::new(1, None);
        assert_eq!(s.check_safety(130.0, 0.5).len(), 1);
        assert!(s.check_safety(135.0, 0.5).is_empty());
        assert!(s.check_safety(90.0, 0.5).is_empty());
        let again = s.check_safety(125.0, 0.97);
        assert_eq!(again.len(), 2);
        assert!(again[0].message.contains("Heart rate 125"));
        assert!(again[1].message.contains("firing rate"));
    }

    #[test]
    fn data_log_records_commands_and_acks() {
        let mut s = DaemonState::new(1, Some(Recorder::create(&log_path()).unwrap()));
        s.apply_command(&Command::StopExperiment).unwrap();
        s.flush_log();
        let text = std::fs::read_to_string(log_path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"inbound\"") && lines[0].contains("stop_experiment"));
        assert!(lines[1].contains("\"outbound\"") && lines[1].contains("control_update"));
        let _ = std::fs::remove_file(log_path());
    }

    fn log_path() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("neuroloopd-test-{}.jsonl", std::process::id()))
    }
}
