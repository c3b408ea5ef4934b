//! TCP link to the backend.
//!
//! A background task owns the socket. It connects, reports `Connected`,
//! forwards every parsed inbound frame, writes queued commands, reports
//! `Disconnected` when the link drops, and retries after a fixed delay.
//! Malformed frames are logged and dropped here; they never reach the session.
//!
//! Commands queued while no link is up are stale by the time one comes back:
//! on reconnect they are discarded, except `emergency_stop`, which is always
//! delivered.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ProtocolError, TransportError};
use crate::protocol::{Command, CommandSink, InboundEvent};

pub struct Link {
    outbound: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
}

impl Link {
    /// Start the link task. Must be called from within a tokio runtime.
    pub fn spawn(
        endpoint: impl Into<String>,
        reconnect_delay: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<InboundEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        tokio::spawn(run_link(
            endpoint.into(),
            reconnect_delay,
            cmd_rx,
            event_tx,
            cancel.clone(),
        ));

        (
            Self {
                outbound: cmd_tx,
                cancel,
            },
            event_rx,
        )
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl CommandSink for Link {
    fn send(&mut self, command: &Command) -> Result<(), TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.outbound
            .send(command.clone())
            .map_err(|_| TransportError::Closed)
    }

    fn release(&mut self) {
        if !self.cancel.is_cancelled() {
            debug!("releasing backend link");
            self.cancel.cancel();
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_link(
    endpoint: String,
    reconnect_delay: Duration,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<InboundEvent>,
    cancel: CancellationToken,
) {
    loop {
        let connect = tokio::select! {
            _ = cancel.cancelled() => break,
            r = TcpStream::connect(&endpoint) => r,
        };

        match connect {
            Ok(stream) => {
                info!(endpoint = %endpoint, "link established");
                let backlog = drain_backlog(&mut commands);
                if events.send(InboundEvent::Connected).is_err() {
                    break;
                }
                match serve(stream, backlog, &mut commands, &events, &cancel).await {
                    Ok(()) => debug!("link closed locally"),
                    Err(e) => warn!(error = %e, "link lost"),
                }
                if events.send(InboundEvent::Disconnected).is_err() {
                    break;
                }
            }
            Err(e) => debug!(endpoint = %endpoint, error = %e, "connect failed"),
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = time::sleep(reconnect_delay) => {}
        }
    }
    debug!("link task finished");
}

/// Empty the queue of commands issued while the link was down. Returns the
/// emergency stop if one was among them.
pub(crate) fn drain_backlog(commands: &mut mpsc::UnboundedReceiver<Command>) -> Option<Command> {
    let mut dropped = 0usize;
    let mut emergency = None;
    while let Ok(cmd) = commands.try_recv() {
        if cmd.is_emergency() {
            emergency = Some(cmd);
        } else {
            dropped += 1;
        }
    }
    if dropped > 0 {
        warn!(dropped, "discarding commands queued while disconnected");
    }
    emergency
}

async fn serve(
    stream: TcpStream,
    backlog: Option<Command>,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    events: &mpsc::UnboundedSender<InboundEvent>,
    cancel: &CancellationToken,
) -> Result<(), TransportError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    if let Some(cmd) = backlog {
        info!("delivering queued emergency stop");
        write_command(&mut writer, &cmd).await?;
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            cmd = commands.recv() => match cmd {
                Some(cmd) => write_command(&mut writer, &cmd).await?,
                None => return Ok(()),
            },
            line = lines.next_line() => {
                let Some(line) = line? else {
                    return Err(TransportError::Closed);
                };
                if line.trim().is_empty() {
                    // keep-alive
                } else {
                    match InboundEvent::from_line(&line) {
                        Ok(event) => {
                            if events.send(event).is_err() {
                                return Ok(());
                            }
                        }
                        Err(ProtocolError::UnknownEvent(name)) => {
                            debug!(event = %name, "unknown event ignored");
                        }
                        Err(e) => warn!(error = %e, "dropping malformed frame"),
                    }
                }
            }
        }
    }
}

async fn write_command(writer: &mut OwnedWriteHalf, command: &Command) -> Result<(), TransportError> {
    let line = command.to_line()?;
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    debug!(event = command.event(), "command sent");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::ControlPatch;
    use crate::protocol::Frame;
    use tokio::net::TcpListener;

    const WAIT: Duration = Duration::from_secs(5);

    async fn next(rx: &mut mpsc::UnboundedReceiver<InboundEvent>) -> Option<InboundEvent> {
        time::timeout(WAIT, rx.recv()).await.expect("timed out")
    }

    #[test]
    fn backlog_keeps_only_the_emergency_stop() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(Command::StopExperiment).unwrap();
        tx.send(Command::EmergencyStop).unwrap();
        tx.send(Command::UpdateControlParams(
            ControlPatch::default().with_modulation_level(0.4),
        ))
        .unwrap();

        assert_eq!(drain_backlog(&mut rx), Some(Command::EmergencyStop));
        assert!(rx.try_recv().is_err());

        tx.send(Command::StopExperiment).unwrap();
        assert_eq!(drain_backlog(&mut rx), None);
    }

    #[tokio::test]
    async fn exchanges_frames_with_backend() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (mut link, mut events) = Link::spawn(addr, Duration::from_millis(50));

        let (socket, _) = listener.accept().await.unwrap();
        assert_eq!(next(&mut events).await, Some(InboundEvent::Connected));

        let (reader, mut writer) = socket.into_split();
        let mut server_lines = BufReader::new(reader).lines();

        link.send(&Command::StopExperiment).unwrap();
        let line = time::timeout(WAIT, server_lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(Frame::parse(&line).unwrap().event, "stop_experiment");

        writer.write_all(b"this is not json\n").await.unwrap();
        writer
            .write_all(b"{\"event\":\"control_update\",\"data\":{\"isRunning\":false}}\n")
            .await
            .unwrap();
        match next(&mut events).await {
            Some(InboundEvent::ControlUpdate { payload }) => assert_eq!(payload["isRunning"], false),
            other => panic!("unexpected {other:?}"),
        }

        drop(writer);
        drop(server_lines);
        assert_eq!(next(&mut events).await, Some(InboundEvent::Disconnected));
        link.release();
    }

    #[tokio::test]
    async fn release_stops_the_link_task() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (mut link, mut events) = Link::spawn(addr, Duration::from_millis(50));
        let (_socket, _) = listener.accept().await.unwrap();
        assert_eq!(next(&mut events).await, Some(InboundEvent::Connected));

        link.release();
        link.release();

        assert_eq!(next(&mut events).await, Some(InboundEvent::Disconnected));
        assert_eq!(next(&mut events).await, None);
        assert!(matches!(
            link.send(&Command::EmergencyStop),
            Err(TransportError::Closed)
        ));
    }
}
