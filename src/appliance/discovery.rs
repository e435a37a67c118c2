//! Locating the plug from its UDP broadcast
use log::{debug, info, warn};
use serde::Deserialize;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::appliance::protocol::{decode_frame, decode_payload, ProtocolError, SessionCipher};

// Devices announce themselves every few seconds on these ports
const PLAINTEXT_PORT: u16 = 6666;
const ENCRYPTED_PORT: u16 = 6667;

/// Announcement broadcast by a device on the local network
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Broadcast {
    pub ip: String,
    pub gw_id: String,
    #[serde(default)]
    pub version: Option<String>,
}

/// Parse one broadcast datagram
///
/// # Arguments
/// * `packet` - Raw datagram
/// * `cipher` - UDP cipher for datagrams from the encrypted port, None for plaintext
pub fn parse_broadcast(
    packet: &[u8],
    cipher: Option<&SessionCipher>,
) -> Result<Option<Broadcast>, ProtocolError> {
    let frame = match decode_frame(packet)? {
        Some((frame, _)) => frame,
        None => return Ok(None),
    };

    let value = match cipher {
        Some(cipher) => decode_payload(cipher, &frame.payload)?,
        None if frame.payload.is_empty() => None,
        None => Some(serde_json::from_slice(&frame.payload)?),
    };

    match value {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

/// Find the plug's current address
///
/// Listens for the device's broadcast for up to `wait`. When nothing is
/// heard, the sockets cannot be bound, or `wait` is zero, the configured
/// address is used.
///
/// # Arguments
/// * `device_id` - Identifier the broadcast must carry as `gwId`
/// * `fallback` - Configured address of the plug
/// * `wait` - How long to listen
pub async fn find_device(device_id: &str, fallback: &str, wait: Duration) -> String {
    if wait.is_zero() {
        debug!("Discovery disabled, using configured address {}", fallback);
        return fallback.to_string();
    }

    match timeout(wait, listen_for(device_id)).await {
        Ok(Ok(broadcast)) => {
            info!(
                "Plug {} announced address {} (configured {}, protocol {})",
                device_id,
                broadcast.ip,
                fallback,
                broadcast.version.as_deref().unwrap_or("unknown")
            );
            broadcast.ip
        }
        Ok(Err(e)) => {
            warn!("Discovery failed: {}. Using configured address {}", e, fallback);
            fallback.to_string()
        }
        Err(_) => {
            info!(
                "No broadcast from plug {} within {:?}, using configured address {}",
                device_id, wait, fallback
            );
            fallback.to_string()
        }
    }
}

async fn listen_for(device_id: &str) -> Result<Broadcast, ProtocolError> {
    let plaintext = UdpSocket::bind(("0.0.0.0", PLAINTEXT_PORT)).await?;
    let encrypted = UdpSocket::bind(("0.0.0.0", ENCRYPTED_PORT)).await?;
    let udp_cipher = SessionCipher::udp()?;

    let mut plain_buf = [0u8; 1024];
    let mut enc_buf = [0u8; 1024];

    loop {
        let parsed = tokio::select! {
            received = plaintext.recv_from(&mut plain_buf) => {
                let (len, from) = received?;
                debug!("Broadcast from {} on port {}", from, PLAINTEXT_PORT);
                parse_broadcast(&plain_buf[..len], None)
            }
            received = encrypted.recv_from(&mut enc_buf) => {
                let (len, from) = received?;
                debug!("Broadcast from {} on port {}", from, ENCRYPTED_PORT);
                parse_broadcast(&enc_buf[..len], Some(&udp_cipher))
            }
        };

        match parsed {
            Ok(Some(broadcast)) if broadcast.gw_id == device_id => return Ok(broadcast),
            Ok(Some(broadcast)) => debug!("Ignoring broadcast from device {}", broadcast.gw_id),
            Ok(None) => {}
            // Other vendors' traffic shares these ports
            Err(e) => debug!("Unreadable broadcast: {}", e),
        }
    }
}
