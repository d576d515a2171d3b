//! v3.5 session key negotiation.
//!
//! Runs on a freshly connected stream before any application frame:
//! START carries a local nonce, the device answers with its own nonce and an
//! HMAC proving it knows the local key, FINISH returns the HMAC of the remote
//! nonce. Both sides then derive the same 16-byte session key.

use crate::crypto::{GCM_NONCE_LEN, KEY_LEN, TuyaCipher};
use crate::error::{Result, TuyaError};
use crate::protocol::{CommandKind, Frame, FrameCodec, Version};
use crate::transport::{read_frame, write_frame};
use hmac::{Hmac, Mac};
use log::{debug, warn};
use rand::RngCore;
use sha2::Sha256;
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{sleep, timeout};

pub const NONCE_LEN: usize = 16;
const HMAC_LEN: usize = 32;

/// Per-connection symmetric key. Never logged.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey([u8; KEY_LEN]);

impl SessionKey {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Bounds on waiting for the device's negotiation response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeTimings {
    pub read_timeout: Duration,
    pub read_attempts: u32,
    pub retry_sleep: Duration,
}

impl Default for HandshakeTimings {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(2),
            read_attempts: 3,
            retry_sleep: Duration::from_millis(100),
        }
    }
}

pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    rand::rng().fill_bytes(&mut nonce);
    nonce
}

fn next_seqno(seqno: &mut u32) -> u32 {
    let current = *seqno;
    *seqno = seqno.wrapping_add(1);
    current
}

/// HMAC-SHA256 as used by both handshake proofs.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; HMAC_LEN]> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key)
        .map_err(|_| TuyaError::Crypto("invalid HMAC key".into()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

/// Session key = AES-GCM(local_key, local_nonce[..12]) over `local XOR remote`, first 16 bytes.
pub fn derive_session_key(
    local_key: &[u8],
    local_nonce: &[u8; NONCE_LEN],
    remote_nonce: &[u8; NONCE_LEN],
) -> Result<SessionKey> {
    let mut mixed = [0u8; NONCE_LEN];
    for (out, (l, r)) in mixed.iter_mut().zip(local_nonce.iter().zip(remote_nonce)) {
        *out = l ^ r;
    }

    let cipher = TuyaCipher::new(local_key)?;
    let sealed = cipher.encrypt_aead(&mixed, &local_nonce[..GCM_NONCE_LEN], &[])?;
    let key: [u8; KEY_LEN] = sealed[..KEY_LEN]
        .try_into()
        .map_err(|_| TuyaError::Crypto("derived key too short".into()))?;
    Ok(SessionKey(key))
}

/// Negotiate a session key over `stream`.
///
/// `seqno` is the connection's sequence counter; both handshake frames use it.
/// Any failure leaves the caller without a key and must abort the connection.
pub async fn negotiate<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    local_key: &[u8],
    seqno: &mut u32,
    local_nonce: [u8; NONCE_LEN],
    timings: &HandshakeTimings,
) -> Result<SessionKey> {
    debug!("Starting session key negotiation");
    let codec = FrameCodec::new(Version::V3_5, local_key)?;

    let start = Frame::new(CommandKind::SessKeyNegStart, next_seqno(seqno), local_nonce.to_vec());
    write_frame(stream, &codec.encode(&start)?, timings.read_timeout)
        .await
        .map_err(|e| as_handshake("sending START", e))?;

    let raw = read_response(stream, timings)
        .await
        .map_err(|e| as_handshake("reading response", e))?;
    let resp = codec
        .decode(&raw)
        .map_err(|e| TuyaError::Handshake(format!("undecodable response: {}", e)))?;

    if resp.cmd != CommandKind::SessKeyNegResp {
        return Err(TuyaError::Handshake(format!(
            "unexpected response command {:?}",
            resp.cmd
        )));
    }
    if resp.payload.len() < NONCE_LEN + HMAC_LEN {
        return Err(TuyaError::Handshake(format!(
            "response payload too short ({} bytes)",
            resp.payload.len()
        )));
    }

    let mut remote_nonce = [0u8; NONCE_LEN];
    remote_nonce.copy_from_slice(&resp.payload[..NONCE_LEN]);
    let remote_hmac = &resp.payload[NONCE_LEN..NONCE_LEN + HMAC_LEN];

    let mut mac = Hmac::<Sha256>::new_from_slice(local_key)
        .map_err(|_| TuyaError::Crypto("invalid HMAC key".into()))?;
    mac.update(&local_nonce);
    mac.verify_slice(remote_hmac)
        .map_err(|_| TuyaError::Handshake("device HMAC mismatch".into()))?;

    let finish = Frame::new(
        CommandKind::SessKeyNegFinish,
        next_seqno(seqno),
        hmac_sha256(local_key, &remote_nonce)?.to_vec(),
    );
    write_frame(stream, &codec.encode(&finish)?, timings.read_timeout)
        .await
        .map_err(|e| as_handshake("sending FINISH", e))?;

    let key = derive_session_key(local_key, &local_nonce, &remote_nonce)?;
    debug!("Session key negotiated");
    Ok(key)
}

/// Transport failures during negotiation surface as handshake failures.
fn as_handshake(stage: &str, err: TuyaError) -> TuyaError {
    match err {
        TuyaError::Handshake(_) => err,
        other => TuyaError::Handshake(format!("{}: {}", stage, other)),
    }
}

async fn read_response<S: AsyncRead + Unpin>(
    stream: &mut S,
    timings: &HandshakeTimings,
) -> Result<Vec<u8>> {
    for attempt in 1..=timings.read_attempts {
        match timeout(
            timings.read_timeout,
            read_frame(stream, Version::V3_5, timings.read_timeout),
        )
        .await
        {
            Ok(Ok(Some(raw))) => return Ok(raw),
            Ok(Ok(None)) => {
                return Err(TuyaError::Handshake(
                    "device closed the connection during negotiation".into(),
                ));
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                warn!(
                    "No negotiation response (attempt {}/{})",
                    attempt, timings.read_attempts
                );
                if attempt < timings.read_attempts {
                    sleep(timings.retry_sleep).await;
                }
            }
        }
    }
    Err(TuyaError::Handshake("no response to negotiation".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Direction;
    use tokio::io::DuplexStream;

    const KEY: &[u8] = b"0123456789abcdef";
    const LOCAL_HMAC: &str = "b0785c289e34be92fa9f340daa07c0e0839c9bb8b2fdb1d4c119d9462e8aed4c";
    const REMOTE_HMAC: &str = "65635198bf06f585e07e8c9aeaab41ead0b27ea52a8cf149d76cd900014bd54d";
    const SESSION_KEY: &str = "ed2fd40d0e642b26f836170ad08ba03d";

    fn local_nonce() -> [u8; NONCE_LEN] {
        std::array::from_fn(|i| i as u8)
    }

    fn remote_nonce() -> [u8; NONCE_LEN] {
        std::array::from_fn(|i| 0x10 + i as u8)
    }

    fn fast_timings() -> HandshakeTimings {
        HandshakeTimings {
            read_timeout: Duration::from_millis(100),
            read_attempts: 2,
            retry_sleep: Duration::from_millis(10),
        }
    }

    /// Plays the device side. Returns the FINISH payload, if one arrived.
    async fn scripted_device(mut stream: DuplexStream, proof: Vec<u8>) -> Option<Vec<u8>> {
        let codec = FrameCodec::new(Version::V3_5, KEY).unwrap();
        let timeout = Duration::from_secs(1);

        let raw = read_frame(&mut stream, Version::V3_5, timeout).await.ok()??;
        let start = codec.decode_as(&raw, Direction::ToDevice).unwrap();
        assert_eq!(start.cmd, CommandKind::SessKeyNegStart);
        assert_eq!(start.payload, local_nonce());

        let mut payload = remote_nonce().to_vec();
        payload.extend_from_slice(&proof);
        let resp = Frame::new(CommandKind::SessKeyNegResp, start.seqno, payload).with_retcode(0);
        write_frame(&mut stream, &codec.encode(&resp).unwrap(), timeout)
            .await
            .unwrap();

        let raw = read_frame(&mut stream, Version::V3_5, timeout).await.ok()??;
        let finish = codec.decode_as(&raw, Direction::ToDevice).unwrap();
        assert_eq!(finish.cmd, CommandKind::SessKeyNegFinish);
        Some(finish.payload)
    }

    #[test]
    fn test_known_answer_vectors() {
        assert_eq!(hex::encode(hmac_sha256(KEY, &local_nonce()).unwrap()), LOCAL_HMAC);
        assert_eq!(hex::encode(hmac_sha256(KEY, &remote_nonce()).unwrap()), REMOTE_HMAC);
        let key = derive_session_key(KEY, &local_nonce(), &remote_nonce()).unwrap();
        assert_eq!(hex::encode(key.as_bytes()), SESSION_KEY);
        assert_eq!(format!("{:?}", key), "SessionKey(..)");
    }

    #[tokio::test]
    async fn test_negotiation_succeeds() {
        let (client, device) = tokio::io::duplex(4096);
        let proof = hex::decode(LOCAL_HMAC).unwrap();
        let device_task = tokio::spawn(scripted_device(device, proof));

        let mut client = client;
        let mut seqno = 1;
        let key = negotiate(&mut client, KEY, &mut seqno, local_nonce(), &fast_timings())
            .await
            .unwrap();

        assert_eq!(hex::encode(key.as_bytes()), SESSION_KEY);
        assert_eq!(seqno, 3);
        let finish = device_task.await.unwrap().unwrap();
        assert_eq!(hex::encode(finish), REMOTE_HMAC);
    }

    #[tokio::test]
    async fn test_hmac_mismatch_is_handshake_error() {
        let (client, device) = tokio::io::duplex(4096);
        let device_task = tokio::spawn(scripted_device(device, vec![0u8; HMAC_LEN]));

        let mut client = client;
        let mut seqno = 1;
        let result = negotiate(&mut client, KEY, &mut seqno, local_nonce(), &fast_timings()).await;
        assert_eq!(result, Err(TuyaError::Handshake("device HMAC mismatch".into())));

        // No FINISH is sent after a failed proof.
        drop(client);
        assert_eq!(device_task.await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_silent_device_exhausts_attempts() {
        let (mut client, _device) = tokio::io::duplex(4096);
        let mut seqno = 1;
        let result = negotiate(&mut client, KEY, &mut seqno, local_nonce(), &fast_timings()).await;
        assert_eq!(result, Err(TuyaError::Handshake("no response to negotiation".into())));
    }

    #[tokio::test]
    async fn test_closed_stream_is_handshake_error() {
        let (mut client, device) = tokio::io::duplex(4096);
        drop(device);
        let mut seqno = 1;
        let result = negotiate(&mut client, KEY, &mut seqno, local_nonce(), &fast_timings()).await;
        assert!(matches!(result, Err(TuyaError::Handshake(_))));
    }

    #[tokio::test]
    async fn test_garbage_response_is_handshake_error() {
        let (mut client, mut device) = tokio::io::duplex(4096);
        let device_task = tokio::spawn(async move {
            let mut buf = [0u8; 256];
            let _ = tokio::io::AsyncReadExt::read(&mut device, &mut buf).await;
            // Plenty of bytes, none of them a frame prefix.
            tokio::io::AsyncWriteExt::write_all(&mut device, &[0x42; 2048])
                .await
                .unwrap();
            device
        });

        let mut seqno = 1;
        let result = negotiate(&mut client, KEY, &mut seqno, local_nonce(), &fast_timings()).await;
        match result {
            Err(TuyaError::Handshake(msg)) => assert!(msg.starts_with("reading response")),
            other => panic!("unexpected result: {:?}", other),
        }
        drop(device_task.await.unwrap());
    }
}
