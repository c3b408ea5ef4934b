//! neuroloop - terminal operator console for a closed-loop stimulation backend.
//!
//! Connects to the backend (127.0.0.1:8000 by default), mirrors its telemetry
//! and control state, and accepts operator commands on stdin.
//!
//! Examples:
//!   neuroloop
//!   neuroloop --addr 10.0.0.5:8000 --record
//!   NEUROLOOP_ENDPOINT=rig:8000 neuroloop

use std::process;
use std::time::{Duration, Instant};

use neuroloop::config::{CliArgs, ConsoleConfig};
use neuroloop::console::{execute, status_line, OperatorCommand, Outcome, HELP};
use neuroloop::paths::AppPaths;
use neuroloop::recorder::{Recorder, RecordingSink};
use neuroloop::session::Session;
use neuroloop::transport::Link;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time;
use tracing::{debug, info, warn};

fn usage(code: i32) -> ! {
    eprintln!("neuroloop (talks to the backend @ 127.0.0.1:8000 by default)");
    eprintln!("Usage: neuroloop [--addr host:port] [--record] [--config path]\n");
    eprintln!("Options:");
    eprintln!("  --addr host:port    Backend endpoint (env: NEUROLOOP_ENDPOINT)");
    eprintln!("  --record            Record every frame to the session log (env: NEUROLOOP_RECORD)");
    eprintln!("  --config path       Config file (default: <data dir>/neuroloop/config.json)");
    process::exit(code);
}

async fn alert_expiry(deadline: Option<Instant>) {
    match deadline {
        Some(at) => time::sleep_until(time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logs go to stderr; stdout belongs to the console.
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let cli = match CliArgs::parse(std::env::args().skip(1)) {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("{e}\n");
            usage(2);
        }
    };
    if cli.help {
        usage(0);
    }

    let config = ConsoleConfig::resolve(&cli, |key| std::env::var(key).ok())?;
    let paths = match AppPaths::new() {
        Ok(paths) => Some(paths),
        Err(e) => {
            warn!("No data directory: {}", e);
            None
        }
    };
    let recorder = match config.recording_target(paths.as_ref()) {
        Some(path) => Some(Recorder::create(&path)?),
        None => None,
    };

    let (link, mut events) = Link::spawn(config.endpoint.clone(), config.reconnect_delay());
    let mut session = Session::new(&config, RecordingSink::new(link, recorder));
    info!(endpoint = %config.endpoint, "console started");
    println!("{HELP}\n");

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut status = time::interval(config.status_interval());
    let mut last_status = String::new();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        let deadline = session.alert_deadline();
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    session.sink_mut().record_inbound(&event);
                    session.handle_event(event);
                }
                None => {
                    warn!("link task ended");
                    break;
                }
            },
            line = stdin.next_line() => {
                let Some(line) = line? else { break };
                match OperatorCommand::parse(&line) {
                    Ok(cmd) => match execute(&mut session, cmd) {
                        Outcome::Quit => break,
                        Outcome::Continue(Some(reply)) => println!("{reply}"),
                        Outcome::Continue(None) => {}
                    },
                    Err(e) => println!("{e}"),
                }
            }
            _ = alert_expiry(deadline) => {
                if let Some(alert) = session.expire_alerts(Instant::now()) {
                    debug!(id = alert.id, "alert timed out");
                }
            }
            _ = status.tick() => {
                let line = status_line(&session.snapshot(), Instant::now());
                if line != last_status {
                    println!("{line}");
                    last_status = line;
                }
            }
            _ = &mut ctrl_c => {
                warn!("Interrupted");
                break;
            }
        }
    }

    // Never leave stimulation running behind a closed console.
    if session.control_state().is_running {
        session.emergency_stop();
        // Give the command a moment to reach the socket before the link is cancelled.
        time::sleep(Duration::from_millis(50)).await;
    }
    session.close();
    Ok(())
}
