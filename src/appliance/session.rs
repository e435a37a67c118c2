//! Plug session task: discovery, connection and command delivery
//!
//! The session runs as its own task and owns the TCP connection. The control
//! loop talks to it only through an `ApplianceHandle` (commands in) and an
//! event receiver (lifecycle notifications out).
use log::{debug, info, warn};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};

use crate::appliance::discovery::find_device;
use crate::appliance::protocol::{
    command, control_payload, decode_frame, decode_payload, encode_frame, heartbeat_payload,
    refresh_payload, Frame, ProtocolError, SessionCipher,
};
use crate::appliance::{ApplianceEvent, PowerSwitch, SessionState};
use crate::config::PlugConfig;
use crate::utils::unix_timestamp;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
const READ_BUFFER_SIZE: usize = 1024;

#[derive(Debug)]
enum Command {
    SetPower(bool),
}

/// Sending side of the plug session
#[derive(Clone)]
pub struct ApplianceHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl PowerSwitch for ApplianceHandle {
    fn set_power(&self, on: bool) {
        if self.commands.send(Command::SetPower(on)).is_err() {
            warn!("Plug session has stopped, dropping set_power({})", on);
        }
    }
}

/// Start the plug session
///
/// Discovery and connection happen in the background; progress is reported
/// on the returned event receiver.
///
/// # Returns
/// A handle for sending commands and the receiver for session events
pub fn spawn(config: PlugConfig) -> (ApplianceHandle, mpsc::UnboundedReceiver<ApplianceEvent>) {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    let session = PlugSession::new(config, event_tx);
    tokio::spawn(session.run(command_rx));

    (
        ApplianceHandle {
            commands: command_tx,
        },
        event_rx,
    )
}

enum SessionEnd {
    Closed,
    HandleDropped,
}

struct PlugSession {
    config: PlugConfig,
    cipher: SessionCipher,
    state: SessionState,
    seq: u32,
    events: mpsc::UnboundedSender<ApplianceEvent>,
}

impl PlugSession {
    fn new(config: PlugConfig, events: mpsc::UnboundedSender<ApplianceEvent>) -> Self {
        let cipher = SessionCipher::new(config.local_key);
        PlugSession {
            config,
            cipher,
            state: SessionState::Idle,
            seq: 0,
            events,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        self.transition(SessionState::Discovering);
        let discovery = find_device(
            &self.config.device_id,
            &self.config.address,
            self.config.discovery_timeout,
        );
        let Some(address) = self.while_offline(discovery, &mut commands).await else {
            return;
        };

        info!(
            "Connecting to plug {} at {}:{}",
            self.config.device_id, address, self.config.port
        );

        let connect = TcpStream::connect((address.as_str(), self.config.port));
        let Some(connected) = self.while_offline(connect, &mut commands).await else {
            return;
        };

        match connected {
            Ok(stream) => {
                self.transition(SessionState::Connected);
                self.emit(ApplianceEvent::Connected);

                let end = self.serve(stream, &mut commands).await;

                self.transition(SessionState::Disconnected);
                self.emit(ApplianceEvent::Disconnected);
                if let SessionEnd::HandleDropped = end {
                    return;
                }
            }
            Err(e) => {
                self.transition(SessionState::Disconnected);
                self.report(format!(
                    "Failed to connect to plug at {}:{}: {}",
                    address, self.config.port, e
                ));
            }
        }

        // No automatic reconnect: later commands are dropped
        while let Some(command) = commands.recv().await {
            self.drop_command(command);
        }
    }

    /// Wait for `pending` while no session is open
    ///
    /// Commands arriving in the meantime are dropped, never queued for the
    /// session. Returns None once the handle is gone.
    async fn while_offline<T>(
        &self,
        pending: impl Future<Output = T>,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> Option<T> {
        tokio::pin!(pending);
        loop {
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(command) => self.drop_command(command),
                    None => return None,
                },
                output = &mut pending => return Some(output),
            }
        }
    }

    fn drop_command(&self, command: Command) {
        match command {
            Command::SetPower(on) => self.report(format!(
                "{}, dropped set_power({})",
                ProtocolError::NotConnected,
                on
            )),
        }
    }

    async fn serve(
        &mut self,
        stream: TcpStream,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> SessionEnd {
        let (mut reader, mut writer) = stream.into_split();

        if let Err(e) = self.send_refresh(&mut writer).await {
            self.report(e);
            return SessionEnd::Closed;
        }

        let mut heartbeat = interval_at(Instant::now() + HEARTBEAT_INTERVAL, HEARTBEAT_INTERVAL);
        let mut pending = Vec::new();
        let mut chunk = [0u8; READ_BUFFER_SIZE];

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::SetPower(on)) => {
                        if let Err(e) = self.send_power(&mut writer, on).await {
                            self.report(e);
                            return SessionEnd::Closed;
                        }
                    }
                    None => return SessionEnd::HandleDropped,
                },
                _ = heartbeat.tick() => {
                    if let Err(e) = self.send_heartbeat(&mut writer).await {
                        self.report(e);
                        return SessionEnd::Closed;
                    }
                }
                read = reader.read(&mut chunk) => match read {
                    Ok(0) => {
                        info!("Plug closed the connection");
                        return SessionEnd::Closed;
                    }
                    Ok(n) => {
                        pending.extend_from_slice(&chunk[..n]);
                        self.handle_incoming(&mut pending);
                    }
                    Err(e) => {
                        self.report(ProtocolError::Io(e));
                        return SessionEnd::Closed;
                    }
                },
            }
        }
    }

    async fn send_refresh(&mut self, writer: &mut OwnedWriteHalf) -> Result<(), ProtocolError> {
        let payload = refresh_payload(&self.cipher, &self.config.device_id, unix_timestamp())?;
        self.send_frame(writer, command::DP_REFRESH, &payload).await
    }

    async fn send_heartbeat(&mut self, writer: &mut OwnedWriteHalf) -> Result<(), ProtocolError> {
        let payload = heartbeat_payload(&self.cipher, &self.config.device_id)?;
        self.send_frame(writer, command::HEART_BEAT, &payload).await
    }

    async fn send_power(&mut self, writer: &mut OwnedWriteHalf, on: bool) -> Result<(), ProtocolError> {
        let payload = control_payload(&self.cipher, &self.config.device_id, on, unix_timestamp())?;
        debug!("Sending set_power({}) to plug {}", on, self.config.device_id);
        self.send_frame(writer, command::CONTROL, &payload).await
    }

    async fn send_frame(
        &mut self,
        writer: &mut OwnedWriteHalf,
        command: u32,
        payload: &[u8],
    ) -> Result<(), ProtocolError> {
        self.seq = self.seq.wrapping_add(1);
        writer
            .write_all(&encode_frame(self.seq, command, payload))
            .await?;
        Ok(())
    }

    fn handle_incoming(&self, pending: &mut Vec<u8>) {
        loop {
            match decode_frame(pending) {
                Ok(Some((frame, used))) => {
                    pending.drain(..used);
                    self.handle_frame(frame);
                }
                Ok(None) => break,
                Err(e) => {
                    // Resynchronise on the next read
                    pending.clear();
                    self.report(e);
                    break;
                }
            }
        }
    }

    fn handle_frame(&self, frame: Frame) {
        match frame.command {
            command::HEART_BEAT => {
                debug!("Heartbeat acknowledged (seq {})", frame.seq);
                return;
            }
            command::STATUS => debug!("Status update from plug (seq {})", frame.seq),
            other => debug!("Reply to command {} (seq {})", other, frame.seq),
        }

        if let Some(code) = frame.return_code.filter(|code| *code != 0) {
            self.report(format!(
                "Plug rejected command {} (code {}): {}",
                frame.command,
                code,
                String::from_utf8_lossy(&frame.payload)
            ));
            return;
        }

        match decode_payload(&self.cipher, &frame.payload) {
            Ok(Some(value)) => self.emit(ApplianceEvent::Data(value)),
            Ok(None) => debug!("Empty reply to command {}", frame.command),
            Err(e) => self.report(e),
        }
    }

    fn transition(&mut self, next: SessionState) {
        if !self.state.can_transition_to(next) {
            warn!("Unexpected plug session transition {:?} -> {:?}", self.state, next);
        }
        debug!("Plug session {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    fn report(&self, error: impl Display) {
        self.emit(ApplianceEvent::Error(error.to_string()));
    }

    fn emit(&self, event: ApplianceEvent) {
        // The receiver only goes away on shutdown
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;

    const DEVICE_ID: &str = "bf0123456789abcdefgh";
    const KEY: [u8; 16] = *b"0123456789abcdef";

    fn test_config(port: u16) -> PlugConfig {
        PlugConfig {
            address: "127.0.0.1".into(),
            device_id: DEVICE_ID.into(),
            local_key: KEY,
            port,
            discovery_timeout: Duration::ZERO,
        }
    }

    async fn read_frame(device: &mut TcpStream, pending: &mut Vec<u8>) -> Frame {
        loop {
            if let Some((frame, used)) = decode_frame(pending).unwrap() {
                pending.drain(..used);
                return frame;
            }
            let mut chunk = [0u8; 512];
            let n = device.read(&mut chunk).await.unwrap();
            assert!(n > 0, "client closed the connection");
            pending.extend_from_slice(&chunk[..n]);
        }
    }

    fn device_reply(return_code: u32, payload: &[u8]) -> Vec<u8> {
        let mut body = return_code.to_be_bytes().to_vec();
        body.extend_from_slice(payload);
        encode_frame(1, command::STATUS, &body)
    }

    #[tokio::test]
    async fn delivers_commands_and_reports_lifecycle() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let cipher = SessionCipher::new(KEY);

        let (plug, mut events) = spawn(test_config(port));
        let (mut device, _) = listener.accept().await.unwrap();
        assert_eq!(events.recv().await, Some(ApplianceEvent::Connected));

        let mut pending = Vec::new();
        let refresh = read_frame(&mut device, &mut pending).await;
        assert_eq!(refresh.command, command::DP_REFRESH);

        plug.set_power(true);
        let control = read_frame(&mut device, &mut pending).await;
        assert_eq!(control.command, command::CONTROL);
        assert!(control.seq > refresh.seq);
        let request = decode_payload(&cipher, &control.payload).unwrap().unwrap();
        assert_eq!(request["devId"], DEVICE_ID);
        assert_eq!(request["dps"], json!({"1": true}));

        // Status push from the device
        let mut status = b"3.3".to_vec();
        status.resize(15, 0);
        status.extend(cipher.encrypt(br#"{"dps":{"1":true}}"#).unwrap());
        device.write_all(&device_reply(0, &status)).await.unwrap();
        assert_eq!(
            events.recv().await,
            Some(ApplianceEvent::Data(json!({"dps": {"1": true}})))
        );

        device
            .write_all(&device_reply(1, b"json obj data unvalid"))
            .await
            .unwrap();
        match events.recv().await {
            Some(ApplianceEvent::Error(message)) => {
                assert!(message.contains("json obj data unvalid"))
            }
            other => panic!("expected rejection, got {:?}", other),
        }

        drop(device);
        assert_eq!(events.recv().await, Some(ApplianceEvent::Disconnected));

        // Disconnected: command is dropped and reported, nothing panics
        plug.set_power(false);
        match events.recv().await {
            Some(ApplianceEvent::Error(message)) => {
                assert!(message.contains("Not connected"));
                assert!(message.contains("set_power(false)"));
            }
            other => panic!("expected error event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn commands_before_connect_are_dropped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let cipher = SessionCipher::new(KEY);

        let (plug, mut events) = spawn(test_config(port));
        plug.set_power(true);

        match events.recv().await {
            Some(ApplianceEvent::Error(message)) => {
                assert!(message.contains("Not connected"));
                assert!(message.contains("set_power(true)"));
            }
            other => panic!("expected dropped command, got {:?}", other),
        }

        let (mut device, _) = listener.accept().await.unwrap();
        assert_eq!(events.recv().await, Some(ApplianceEvent::Connected));

        let mut pending = Vec::new();
        let refresh = read_frame(&mut device, &mut pending).await;
        assert_eq!(refresh.command, command::DP_REFRESH);

        // The early command must not have been held back for the new session
        plug.set_power(false);
        let control = read_frame(&mut device, &mut pending).await;
        assert_eq!(control.command, command::CONTROL);
        let request = decode_payload(&cipher, &control.payload).unwrap().unwrap();
        assert_eq!(request["dps"], json!({"1": false}));
    }

    #[tokio::test(start_paused = true)]
    async fn sends_encrypted_heartbeat() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let cipher = SessionCipher::new(KEY);
        let started = Instant::now();

        let (_plug, mut events) = spawn(test_config(port));
        let (mut device, _) = listener.accept().await.unwrap();
        assert_eq!(events.recv().await, Some(ApplianceEvent::Connected));

        let mut pending = Vec::new();
        let refresh = read_frame(&mut device, &mut pending).await;
        assert_eq!(refresh.command, command::DP_REFRESH);

        let heartbeat = read_frame(&mut device, &mut pending).await;
        assert_eq!(heartbeat.command, command::HEART_BEAT);
        assert!(started.elapsed() >= HEARTBEAT_INTERVAL);
        assert_ne!(heartbeat.payload.first(), Some(&b'{'));
        let body = decode_payload(&cipher, &heartbeat.payload).unwrap().unwrap();
        assert_eq!(body["devId"], DEVICE_ID);
    }

    #[tokio::test]
    async fn unreachable_plug_reports_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (plug, mut events) = spawn(test_config(port));
        match events.recv().await {
            Some(ApplianceEvent::Error(message)) => assert!(message.contains("Failed to connect")),
            other => panic!("expected connect failure, got {:?}", other),
        }

        plug.set_power(true);
        match events.recv().await {
            Some(ApplianceEvent::Error(message)) => assert!(message.contains("set_power(true)")),
            other => panic!("expected error event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn garbage_from_device_is_reported_not_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (plug, mut events) = spawn(test_config(port));
        let (mut device, _) = listener.accept().await.unwrap();
        assert_eq!(events.recv().await, Some(ApplianceEvent::Connected));

        device
            .write_all(b"this is not a plug frame at all")
            .await
            .unwrap();
        assert!(matches!(
            events.recv().await,
            Some(ApplianceEvent::Error(_))
        ));

        // Session is still usable
        let mut pending = Vec::new();
        let refresh = read_frame(&mut device, &mut pending).await;
        assert_eq!(refresh.command, command::DP_REFRESH);
        plug.set_power(true);
        let control = read_frame(&mut device, &mut pending).await;
        assert_eq!(control.command, command::CONTROL);
    }
}
