//! Wire format of the plug's local protocol, version 3.3
//!
//! Every message is a frame:
//! - Bytes 0-3: Prefix 0x000055AA
//! - Bytes 4-7: Sequence number
//! - Bytes 8-11: Command
//! - Bytes 12-15: Length of everything after this field (payload + 8)
//! - Payload (device replies start with a 4 byte return code)
//! - CRC32 of all preceding bytes
//! - Suffix 0x0000AA55
//!
//! All integers are big-endian. Payloads are AES-128-ECB with PKCS#7
//! padding under the device's local key.
use openssl::error::ErrorStack;
use openssl::hash::{hash, MessageDigest};
use openssl::symm::{decrypt, encrypt, Cipher};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

pub const PROTOCOL_VERSION: &str = "3.3";

const PREFIX: u32 = 0x0000_55AA;
const SUFFIX: u32 = 0x0000_AA55;
const HEADER_LEN: usize = 16;
const TRAILER_LEN: usize = 8; // CRC + suffix
const MAX_FRAME_LEN: usize = 64 * 1024;
// "3.3" followed by 12 reserved bytes
const VERSION_HEADER_LEN: usize = 15;

// Key used by every device to encrypt its UDP discovery broadcast
const UDP_KEY_SEED: &[u8] = b"yGAdlopoPVldABfn";

/// Command numbers used by this client
pub mod command {
    pub const CONTROL: u32 = 7;
    pub const STATUS: u32 = 8;
    pub const HEART_BEAT: u32 = 9;
    pub const DP_REFRESH: u32 = 18;
}

// Data point ids re-reported on a refresh request (power metering values)
const REFRESH_DPS: [u32; 6] = [4, 5, 6, 18, 19, 20];

/// Relay data point of a single-outlet plug
pub const POWER_DP: &str = "1";

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Network error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Bad frame prefix 0x{0:08x}")]
    BadPrefix(u32),
    #[error("Bad frame suffix 0x{0:08x}")]
    BadSuffix(u32),
    #[error("Frame length {0} out of range")]
    BadLength(usize),
    #[error("CRC mismatch: expected 0x{expected:08x}, got 0x{actual:08x}")]
    BadCrc { expected: u32, actual: u32 },
    #[error("Crypto error: {0}")]
    Crypto(#[from] ErrorStack),
    #[error("Payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Not connected to plug")]
    NotConnected,
}

/// A decoded frame
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub seq: u32,
    pub command: u32,
    pub return_code: Option<u32>,
    pub payload: Vec<u8>,
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

/// Encode a client frame
pub fn encode_frame(seq: u32, command: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len() + TRAILER_LEN);
    buf.extend_from_slice(&PREFIX.to_be_bytes());
    buf.extend_from_slice(&seq.to_be_bytes());
    buf.extend_from_slice(&command.to_be_bytes());
    buf.extend_from_slice(&((payload.len() + TRAILER_LEN) as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    let crc = crc32fast::hash(&buf);
    buf.extend_from_slice(&crc.to_be_bytes());
    buf.extend_from_slice(&SUFFIX.to_be_bytes());
    buf
}

/// Decode the first frame in `buf`
///
/// # Returns
/// `Ok(None)` if more bytes are needed, otherwise the frame and the number
/// of bytes it occupied
pub fn decode_frame(buf: &[u8]) -> Result<Option<(Frame, usize)>, ProtocolError> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }

    let prefix = read_u32(buf, 0);
    if prefix != PREFIX {
        return Err(ProtocolError::BadPrefix(prefix));
    }

    let declared = read_u32(buf, 12) as usize;
    if !(TRAILER_LEN..=MAX_FRAME_LEN).contains(&declared) {
        return Err(ProtocolError::BadLength(declared));
    }

    let total = HEADER_LEN + declared;
    if buf.len() < total {
        return Ok(None);
    }

    let suffix = read_u32(buf, total - 4);
    if suffix != SUFFIX {
        return Err(ProtocolError::BadSuffix(suffix));
    }

    let expected = read_u32(buf, total - TRAILER_LEN);
    let actual = crc32fast::hash(&buf[..total - TRAILER_LEN]);
    if expected != actual {
        return Err(ProtocolError::BadCrc { expected, actual });
    }

    let body = &buf[HEADER_LEN..total - TRAILER_LEN];
    // A leading return code has its upper three bytes clear
    let (return_code, payload) = if body.len() >= 4 && read_u32(body, 0) & 0xFFFF_FF00 == 0 {
        (Some(read_u32(body, 0)), &body[4..])
    } else {
        (None, body)
    };

    let frame = Frame {
        seq: read_u32(buf, 4),
        command: read_u32(buf, 8),
        return_code,
        payload: payload.to_vec(),
    };
    Ok(Some((frame, total)))
}

/// AES-128-ECB cipher bound to one key
#[derive(Clone)]
pub struct SessionCipher {
    key: [u8; 16],
}

impl SessionCipher {
    pub fn new(key: [u8; 16]) -> Self {
        SessionCipher { key }
    }

    /// Cipher for the encrypted discovery broadcast on UDP port 6667
    pub fn udp() -> Result<Self, ProtocolError> {
        let digest = hash(MessageDigest::md5(), UDP_KEY_SEED)?;
        let mut key = [0u8; 16];
        key.copy_from_slice(&digest);
        Ok(SessionCipher { key })
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        Ok(encrypt(Cipher::aes_128_ecb(), &self.key, None, plaintext)?)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        Ok(decrypt(Cipher::aes_128_ecb(), &self.key, None, ciphertext)?)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ControlRequest<'a> {
    dev_id: &'a str,
    gw_id: &'a str,
    uid: &'a str,
    t: String,
    dps: BTreeMap<&'a str, bool>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    gw_id: &'a str,
    dev_id: &'a str,
    uid: &'a str,
    t: String,
    dp_id: [u32; 6],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HeartbeatRequest<'a> {
    gw_id: &'a str,
    dev_id: &'a str,
}

/// Payload of a CONTROL frame setting the relay
///
/// # Arguments
/// * `cipher` - Cipher keyed with the device's local key
/// * `device_id` - Device identifier
/// * `power_on` - Desired relay state
/// * `timestamp` - Unix time in seconds
pub fn control_payload(
    cipher: &SessionCipher,
    device_id: &str,
    power_on: bool,
    timestamp: i64,
) -> Result<Vec<u8>, ProtocolError> {
    let request = ControlRequest {
        dev_id: device_id,
        gw_id: device_id,
        uid: "",
        t: timestamp.to_string(),
        dps: BTreeMap::from([(POWER_DP, power_on)]),
    };
    let encrypted = cipher.encrypt(&serde_json::to_vec(&request)?)?;

    let mut payload = Vec::with_capacity(VERSION_HEADER_LEN + encrypted.len());
    payload.extend_from_slice(PROTOCOL_VERSION.as_bytes());
    payload.resize(VERSION_HEADER_LEN, 0);
    payload.extend_from_slice(&encrypted);
    Ok(payload)
}

/// Payload of a DP_REFRESH frame asking the device to re-report its values
pub fn refresh_payload(
    cipher: &SessionCipher,
    device_id: &str,
    timestamp: i64,
) -> Result<Vec<u8>, ProtocolError> {
    let request = RefreshRequest {
        gw_id: device_id,
        dev_id: device_id,
        uid: "",
        t: timestamp.to_string(),
        dp_id: REFRESH_DPS,
    };
    cipher.encrypt(&serde_json::to_vec(&request)?)
}

/// Payload of a HEART_BEAT frame
///
/// Protocol 3.3 devices expect every request body encrypted, keep-alives
/// included.
pub fn heartbeat_payload(cipher: &SessionCipher, device_id: &str) -> Result<Vec<u8>, ProtocolError> {
    let request = HeartbeatRequest {
        gw_id: device_id,
        dev_id: device_id,
    };
    cipher.encrypt(&serde_json::to_vec(&request)?)
}

/// Decrypt and parse a device payload
///
/// Strips the version header when present. Devices answer some requests in
/// plaintext, so JSON that fails to decrypt is accepted as-is.
///
/// # Returns
/// `Ok(None)` for an empty payload (heartbeat and command acknowledgements)
pub fn decode_payload(cipher: &SessionCipher, payload: &[u8]) -> Result<Option<Value>, ProtocolError> {
    let body = match payload.strip_prefix(PROTOCOL_VERSION.as_bytes()) {
        Some(_) => payload.get(VERSION_HEADER_LEN..).unwrap_or_default(),
        None => payload,
    };

    if body.is_empty() {
        return Ok(None);
    }

    let plaintext = match cipher.decrypt(body) {
        Ok(plaintext) => plaintext,
        Err(_) if body.first() == Some(&b'{') => body.to_vec(),
        Err(e) => return Err(e),
    };

    Ok(Some(serde_json::from_slice(&plaintext)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const KEY: [u8; 16] = *b"0123456789abcdef";

    #[test]
    fn frame_layout() {
        let frame = encode_frame(3, command::HEART_BEAT, &[]);
        assert_eq!(frame.len(), 24);
        assert_eq!(&frame[0..4], &[0x00, 0x00, 0x55, 0xAA]);
        assert_eq!(&frame[4..8], &[0, 0, 0, 3]);
        assert_eq!(&frame[8..12], &[0, 0, 0, 9]);
        assert_eq!(&frame[12..16], &[0, 0, 0, 8]);
        assert_eq!(
            &frame[16..20],
            &crc32fast::hash(&frame[..16]).to_be_bytes()
        );
        assert_eq!(&frame[20..24], &[0x00, 0x00, 0xAA, 0x55]);
    }

    #[test]
    fn decodes_device_reply_with_return_code() {
        let mut body = 0u32.to_be_bytes().to_vec();
        body.extend_from_slice(b"{\"dps\":{}}");
        let bytes = encode_frame(42, command::STATUS, &body);

        let (frame, used) = decode_frame(&bytes).unwrap().unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(frame.seq, 42);
        assert_eq!(frame.command, command::STATUS);
        assert_eq!(frame.return_code, Some(0));
        assert_eq!(frame.payload, b"{\"dps\":{}}");
    }

    #[test]
    fn waits_for_complete_frame() {
        let bytes = encode_frame(1, command::STATUS, b"3.3 partial payload");
        assert!(decode_frame(&bytes[..10]).unwrap().is_none());
        assert!(decode_frame(&bytes[..bytes.len() - 1]).unwrap().is_none());
    }

    #[test]
    fn decodes_back_to_back_frames() {
        let mut stream = encode_frame(1, command::HEART_BEAT, &[]);
        stream.extend(encode_frame(2, command::STATUS, b"3.3abc"));

        let (first, used) = decode_frame(&stream).unwrap().unwrap();
        assert_eq!(first.seq, 1);
        let (second, rest) = decode_frame(&stream[used..]).unwrap().unwrap();
        assert_eq!(second.seq, 2);
        assert_eq!(second.return_code, None);
        assert_eq!(used + rest, stream.len());
    }

    #[test]
    fn rejects_corrupt_frames() {
        let good = encode_frame(7, command::STATUS, b"{}");

        let mut bad_prefix = good.clone();
        bad_prefix[0] = 0xFF;
        assert!(matches!(
            decode_frame(&bad_prefix),
            Err(ProtocolError::BadPrefix(_))
        ));

        let mut bad_crc = good.clone();
        bad_crc[17] ^= 0x01;
        assert!(matches!(
            decode_frame(&bad_crc),
            Err(ProtocolError::BadCrc { .. })
        ));

        let mut bad_suffix = good.clone();
        let last = bad_suffix.len() - 1;
        bad_suffix[last] = 0x00;
        assert!(matches!(
            decode_frame(&bad_suffix),
            Err(ProtocolError::BadSuffix(_))
        ));

        let mut huge = good;
        huge[12..16].copy_from_slice(&(1u32 << 30).to_be_bytes());
        assert!(matches!(
            decode_frame(&huge),
            Err(ProtocolError::BadLength(_))
        ));
    }

    #[test]
    fn control_payload_carries_version_header_and_relay_state() {
        let cipher = SessionCipher::new(KEY);
        let payload = control_payload(&cipher, "bf01", true, 1_700_000_000).unwrap();

        assert_eq!(&payload[..3], b"3.3");
        assert!(payload[3..15].iter().all(|b| *b == 0));
        // AES block aligned
        assert_eq!((payload.len() - 15) % 16, 0);

        let request: Value =
            serde_json::from_slice(&cipher.decrypt(&payload[15..]).unwrap()).unwrap();
        assert_eq!(
            request,
            json!({
                "devId": "bf01",
                "gwId": "bf01",
                "uid": "",
                "t": "1700000000",
                "dps": {"1": true}
            })
        );
    }

    #[test]
    fn refresh_payload_requests_metering_dps() {
        let cipher = SessionCipher::new(KEY);
        let payload = refresh_payload(&cipher, "bf01", 5).unwrap();
        let request: Value = serde_json::from_slice(&cipher.decrypt(&payload).unwrap()).unwrap();
        assert_eq!(request["dpId"], json!([4, 5, 6, 18, 19, 20]));
        assert_eq!(request["devId"], "bf01");
    }

    #[test]
    fn heartbeat_payload_is_encrypted() {
        let cipher = SessionCipher::new(KEY);
        let payload = heartbeat_payload(&cipher, "bf01").unwrap();
        assert_ne!(payload.first(), Some(&b'{'));
        assert_eq!(payload.len() % 16, 0);

        let request = decode_payload(&cipher, &payload).unwrap().unwrap();
        assert_eq!(request, json!({"gwId": "bf01", "devId": "bf01"}));
    }

    #[test]
    fn decodes_encrypted_status_with_version_header() {
        let cipher = SessionCipher::new(KEY);
        let mut payload = b"3.3".to_vec();
        payload.resize(15, 0);
        payload.extend(cipher.encrypt(br#"{"dps":{"1":false}}"#).unwrap());

        let value = decode_payload(&cipher, &payload).unwrap().unwrap();
        assert_eq!(value, json!({"dps": {"1": false}}));
    }

    #[test]
    fn accepts_plaintext_json_and_empty_payloads() {
        let cipher = SessionCipher::new(KEY);
        let value = decode_payload(&cipher, br#"{"devId":"bf01"}"#).unwrap().unwrap();
        assert_eq!(value["devId"], "bf01");
        assert!(decode_payload(&cipher, &[]).unwrap().is_none());
    }

    #[test]
    fn wrong_key_is_a_crypto_error() {
        let payload = SessionCipher::new(KEY).encrypt(b"{}").unwrap();
        let other = SessionCipher::new(*b"fedcba9876543210");
        assert!(decode_payload(&other, &payload).is_err());
    }

    #[test]
    fn udp_key_is_md5_of_seed() {
        let cipher = SessionCipher::udp().unwrap();
        let encrypted = cipher.encrypt(b"{\"gwId\":\"x\"}").unwrap();
        assert_eq!(
            cipher.decrypt(&encrypted).unwrap(),
            b"{\"gwId\":\"x\"}".to_vec()
        );
        assert_eq!(
            cipher.key,
            [
                0x6c, 0x1e, 0xc8, 0xe2, 0xbb, 0x9b, 0xb5, 0x9a, 0xb5, 0x0b, 0x0d, 0xaf, 0x64, 0x9b,
                0x41, 0x0a
            ]
        );
    }
}
