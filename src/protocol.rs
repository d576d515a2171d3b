//! Tuya wire protocol implementation.
//! Handles frame layout for the 55AA (v3.3) and 6699 (v3.5) formats,
//! header parsing and CRC32 / AES-GCM verification.

use crate::crypto::{BLOCK_LEN, GCM_NONCE_LEN, GCM_TAG_LEN, TuyaCipher};
use crate::error::{Result, TuyaError};
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use crc::{CRC_32_ISO_HDLC, Crc};
use log::debug;
use rand::RngCore;
use serde_json::Value;

pub const PREFIX_55AA: u32 = 0x000055AA;
pub const PREFIX_6699: u32 = 0x00006699;
pub const SUFFIX_55AA: u32 = 0x0000AA55;
pub const SUFFIX_6699: u32 = 0x00009966;

pub const UNKNOWN_COMMAND_CODE: u32 = 0xff;

/// Prefix, seq, cmd, len, CRC, suffix: the smallest possible frame.
pub const MIN_FRAME_LEN: usize = 24;
pub const HEADER_LEN_55AA: usize = 16;
pub const HEADER_LEN_6699: usize = 18;
/// Largest accepted value of the length field.
pub const MAX_DECLARED_LEN: u32 = 0x10000;

const RETCODE_LEN: usize = 4;
const TRAILER_LEN_55AA: usize = 8;
const SUFFIX_LEN: usize = 4;
const VERSION_HEADER_LEN: usize = 15;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

define_version! {
    V3_3 = "3.3",
    V3_5 = "3.5",
}

impl Version {
    pub fn prefix(&self) -> u32 {
        match self {
            Version::V3_3 => PREFIX_55AA,
            Version::V3_5 => PREFIX_6699,
        }
    }

    pub fn suffix(&self) -> u32 {
        match self {
            Version::V3_3 => SUFFIX_55AA,
            Version::V3_5 => SUFFIX_6699,
        }
    }

    /// Bytes before the payload area (prefix included).
    pub fn header_len(&self) -> usize {
        match self {
            Version::V3_3 => HEADER_LEN_55AA,
            Version::V3_5 => HEADER_LEN_6699,
        }
    }

    /// Whether a session key must be negotiated after connecting.
    pub fn needs_session_key(&self) -> bool {
        matches!(self, Version::V3_5)
    }
}

define_command_kind! {
    SessKeyNegStart = { v3_3: 0x03, v3_5: 0x03 },
    SessKeyNegResp = { v3_3: 0x04, v3_5: 0x04 },
    SessKeyNegFinish = { v3_3: 0x05, v3_5: 0x05 },
    Control = { v3_3: 0x07, v3_5: 0x0d },
    Status = { v3_3: 0x08, v3_5: 0x08 },
    HeartBeat = { v3_3: 0x09, v3_5: 0x09 },
    DpQuery = { v3_3: 0x0a, v3_5: 0x10 },
}

impl CommandKind {
    /// Commands whose payload is preceded by the ASCII version and 12 zero bytes.
    pub fn carries_version_header(self) -> bool {
        !matches!(
            self,
            CommandKind::DpQuery
                | CommandKind::HeartBeat
                | CommandKind::SessKeyNegStart
                | CommandKind::SessKeyNegResp
                | CommandKind::SessKeyNegFinish
        )
    }
}

/// Which side produced a frame.
///
/// Only device-to-client frames carry a return code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ToDevice,
    FromDevice,
}

/// One decoded wire-level message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Sequence number
    pub seqno: u32,
    /// Command kind (decoded with the version in effect)
    pub cmd: CommandKind,
    /// Return code, 0 = success. Only present in device-to-client frames.
    pub retcode: Option<u32>,
    /// Decrypted payload, usually JSON text
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new<P: Into<Vec<u8>>>(cmd: CommandKind, seqno: u32, payload: P) -> Self {
        Self {
            seqno,
            cmd,
            retcode: None,
            payload: payload.into(),
        }
    }

    pub fn with_retcode(mut self, retcode: u32) -> Self {
        self.retcode = Some(retcode);
        self
    }

    /// Payload text up to the first NUL byte, if it is valid UTF-8.
    pub fn payload_str(&self) -> Option<&str> {
        let end = self
            .payload
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.payload.len());
        std::str::from_utf8(&self.payload[..end]).ok()
    }

    /// True when the payload looks like a JSON object (`{}` included).
    pub fn has_data(&self) -> bool {
        self.payload_str().is_some_and(|s| s.starts_with('{'))
    }

    pub fn payload_json(&self) -> Result<Value> {
        let text = self
            .payload_str()
            .ok_or_else(|| TuyaError::Json("payload is not UTF-8".into()))?;
        Ok(serde_json::from_str(text)?)
    }
}

/// Fixed-size fields at the start of a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: Version,
    pub seqno: u32,
    /// Raw command code
    pub cmd: u32,
    /// Value of the length field
    pub declared_len: u32,
    /// Whole frame length, prefix to suffix
    pub total_length: usize,
}

/// Parse the header of either frame format.
///
/// Needs 16 bytes for 55AA frames and 18 bytes for 6699 frames.
pub fn parse_header(data: &[u8]) -> Result<FrameHeader> {
    if data.len() < 4 {
        return Err(TuyaError::Parse("header too short".into()));
    }

    match BigEndian::read_u32(&data[..4]) {
        PREFIX_55AA => {
            // 55AA: Prefix(4), Seq(4), Cmd(4), Len(4)
            if data.len() < HEADER_LEN_55AA {
                return Err(TuyaError::Parse("header too short".into()));
            }
            let declared_len = BigEndian::read_u32(&data[12..16]);
            check_declared_len(declared_len, TRAILER_LEN_55AA)?;
            Ok(FrameHeader {
                version: Version::V3_3,
                seqno: BigEndian::read_u32(&data[4..8]),
                cmd: BigEndian::read_u32(&data[8..12]),
                declared_len,
                total_length: HEADER_LEN_55AA + declared_len as usize,
            })
        }
        PREFIX_6699 => {
            // 6699: Prefix(4), Reserved(2), Seq(4), Cmd(4), Len(4)
            if data.len() < HEADER_LEN_6699 {
                return Err(TuyaError::Parse("header too short".into()));
            }
            let declared_len = BigEndian::read_u32(&data[14..18]);
            check_declared_len(declared_len, GCM_NONCE_LEN + GCM_TAG_LEN)?;
            Ok(FrameHeader {
                version: Version::V3_5,
                seqno: BigEndian::read_u32(&data[6..10]),
                cmd: BigEndian::read_u32(&data[10..14]),
                declared_len,
                total_length: HEADER_LEN_6699 + declared_len as usize + SUFFIX_LEN,
            })
        }
        _ => Err(TuyaError::Parse("bad prefix".into())),
    }
}

fn check_declared_len(declared_len: u32, minimum: usize) -> Result<()> {
    if declared_len > MAX_DECLARED_LEN {
        return Err(TuyaError::Parse("frame length exceeds limit".into()));
    }
    if (declared_len as usize) < minimum {
        return Err(TuyaError::Parse("bad length".into()));
    }
    Ok(())
}

fn version_header(version: Version) -> [u8; VERSION_HEADER_LEN] {
    let mut header = [0u8; VERSION_HEADER_LEN];
    header[..3].copy_from_slice(version.as_bytes());
    header
}

/// Encodes and decodes frames for one protocol version and one key.
///
/// For v3.5 the key is the negotiated session key once the handshake is done.
pub struct FrameCodec {
    version: Version,
    cipher: TuyaCipher,
}

impl FrameCodec {
    pub fn new(version: Version, key: &[u8]) -> Result<Self> {
        Ok(Self {
            version,
            cipher: TuyaCipher::new(key)?,
        })
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Encode a frame. v3.5 frames get a fresh random nonce.
    pub fn encode(&self, frame: &Frame) -> Result<Vec<u8>> {
        let mut nonce = [0u8; GCM_NONCE_LEN];
        if self.version == Version::V3_5 {
            rand::rng().fill_bytes(&mut nonce);
        }
        self.encode_with_nonce(frame, &nonce)
    }

    /// Encode with a caller-chosen GCM nonce. The nonce is ignored for v3.3.
    pub fn encode_with_nonce(&self, frame: &Frame, nonce: &[u8; GCM_NONCE_LEN]) -> Result<Vec<u8>> {
        match self.version {
            Version::V3_3 => self.encode_55aa(frame),
            Version::V3_5 => self.encode_6699(frame, nonce),
        }
    }

    /// Decode a device-to-client frame.
    pub fn decode(&self, data: &[u8]) -> Result<Frame> {
        self.decode_as(data, Direction::FromDevice)
    }

    /// Decode a frame sent in `direction`. Bytes past the declared length are ignored.
    pub fn decode_as(&self, data: &[u8], direction: Direction) -> Result<Frame> {
        if data.len() < MIN_FRAME_LEN {
            return Err(TuyaError::Parse("packet too short".into()));
        }
        if BigEndian::read_u32(&data[..4]) != self.version.prefix() {
            return Err(TuyaError::Parse("bad prefix".into()));
        }

        let header = parse_header(data)?;
        if data.len() < header.total_length {
            return Err(TuyaError::Parse("packet too short".into()));
        }
        let frame = &data[..header.total_length];
        if BigEndian::read_u32(&frame[frame.len() - SUFFIX_LEN..]) != self.version.suffix() {
            return Err(TuyaError::Parse("bad suffix".into()));
        }

        let cmd = CommandKind::from_code(self.version, header.cmd);
        if cmd == CommandKind::Unknown {
            debug!("Unknown command code 0x{:02X} for v{}", header.cmd, self.version);
        }

        let (retcode, payload) = match self.version {
            Version::V3_3 => self.open_55aa(frame, direction)?,
            Version::V3_5 => self.open_6699(frame, cmd, direction)?,
        };

        Ok(Frame {
            seqno: header.seqno,
            cmd,
            retcode,
            payload,
        })
    }

    fn encode_55aa(&self, frame: &Frame) -> Result<Vec<u8>> {
        let encrypted = self.cipher.encrypt_legacy(&frame.payload);

        let mut body = Vec::with_capacity(RETCODE_LEN + VERSION_HEADER_LEN + encrypted.len());
        if let Some(rc) = frame.retcode {
            body.write_u32::<BigEndian>(rc)?;
        }
        if frame.cmd.carries_version_header() {
            body.extend_from_slice(&version_header(Version::V3_3));
        }
        body.extend_from_slice(&encrypted);

        let mut data = Vec::with_capacity(HEADER_LEN_55AA + body.len() + TRAILER_LEN_55AA);
        data.write_u32::<BigEndian>(PREFIX_55AA)?;
        data.write_u32::<BigEndian>(frame.seqno)?;
        data.write_u32::<BigEndian>(frame.cmd.code(Version::V3_3))?;
        data.write_u32::<BigEndian>((body.len() + TRAILER_LEN_55AA) as u32)?;
        data.extend_from_slice(&body);

        let crc = CRC32.checksum(&data);
        data.write_u32::<BigEndian>(crc)?;
        data.write_u32::<BigEndian>(SUFFIX_55AA)?;
        Ok(data)
    }

    fn encode_6699(&self, frame: &Frame, nonce: &[u8; GCM_NONCE_LEN]) -> Result<Vec<u8>> {
        let mut plaintext =
            Vec::with_capacity(RETCODE_LEN + VERSION_HEADER_LEN + frame.payload.len());
        if let Some(rc) = frame.retcode {
            plaintext.write_u32::<BigEndian>(rc)?;
        }
        if frame.cmd.carries_version_header() {
            plaintext.extend_from_slice(&version_header(Version::V3_5));
        }
        plaintext.extend_from_slice(&frame.payload);

        let declared_len = GCM_NONCE_LEN + plaintext.len() + GCM_TAG_LEN;

        let mut data = Vec::with_capacity(HEADER_LEN_6699 + declared_len + SUFFIX_LEN);
        data.write_u32::<BigEndian>(PREFIX_6699)?;
        data.write_u16::<BigEndian>(0)?;
        data.write_u32::<BigEndian>(frame.seqno)?;
        data.write_u32::<BigEndian>(frame.cmd.code(Version::V3_5))?;
        data.write_u32::<BigEndian>(declared_len as u32)?;

        // AAD = header after the prefix: reserved, seq, cmd, len
        let sealed = self
            .cipher
            .encrypt_aead(&plaintext, nonce, &data[4..HEADER_LEN_6699])?;

        data.extend_from_slice(nonce);
        data.extend_from_slice(&sealed);
        data.write_u32::<BigEndian>(SUFFIX_6699)?;
        Ok(data)
    }

    fn open_55aa(&self, frame: &[u8], direction: Direction) -> Result<(Option<u32>, Vec<u8>)> {
        let crc_pos = frame.len() - TRAILER_LEN_55AA;
        let expected = BigEndian::read_u32(&frame[crc_pos..crc_pos + 4]);
        if CRC32.checksum(&frame[..crc_pos]) != expected {
            return Err(TuyaError::Parse("crc mismatch".into()));
        }

        let mut body = &frame[HEADER_LEN_55AA..crc_pos];
        let mut retcode = None;
        if direction == Direction::FromDevice && has_retcode_55aa(body) {
            retcode = Some(BigEndian::read_u32(&body[..RETCODE_LEN]));
            body = &body[RETCODE_LEN..];
        }

        if body.len() > VERSION_HEADER_LEN
            && body.starts_with(Version::V3_3.as_bytes())
            && (body.len() - VERSION_HEADER_LEN) % BLOCK_LEN == 0
        {
            body = &body[VERSION_HEADER_LEN..];
        }

        if body.is_empty() {
            return Ok((retcode, Vec::new()));
        }
        Ok((retcode, self.open_legacy(body)?))
    }

    fn open_legacy(&self, body: &[u8]) -> Result<Vec<u8>> {
        let plaintext_json = body.first() == Some(&b'{');
        if body.len() % BLOCK_LEN != 0 {
            if plaintext_json {
                debug!("Unencrypted JSON payload, passing through");
                return Ok(body.to_vec());
            }
            return Err(TuyaError::Crypto("payload is not block aligned".into()));
        }
        match self.cipher.decrypt_legacy(body) {
            Ok(plaintext) => Ok(plaintext),
            Err(_) if plaintext_json => Ok(body.to_vec()),
            Err(e) => Err(e),
        }
    }

    fn open_6699(
        &self,
        frame: &[u8],
        cmd: CommandKind,
        direction: Direction,
    ) -> Result<(Option<u32>, Vec<u8>)> {
        let nonce_end = HEADER_LEN_6699 + GCM_NONCE_LEN;
        let nonce = &frame[HEADER_LEN_6699..nonce_end];
        let sealed = &frame[nonce_end..frame.len() - SUFFIX_LEN];
        let aad = &frame[4..HEADER_LEN_6699];

        let plaintext = self.cipher.decrypt_aead(sealed, nonce, aad)?;

        let mut body = plaintext.as_slice();
        let mut retcode = None;
        if direction == Direction::FromDevice && body.len() >= RETCODE_LEN {
            retcode = Some(BigEndian::read_u32(&body[..RETCODE_LEN]));
            body = &body[RETCODE_LEN..];
        }
        if cmd.carries_version_header()
            && body.len() >= VERSION_HEADER_LEN
            && body.starts_with(Version::V3_5.as_bytes())
        {
            body = &body[VERSION_HEADER_LEN..];
        }
        Ok((retcode, body.to_vec()))
    }
}

/// Device frames put a 4-byte return code before the encrypted body.
///
/// Client frames are always block aligned (optionally after the 15-byte
/// version header), so the remainder modulo 16 tells the two apart.
fn has_retcode_55aa(body: &[u8]) -> bool {
    if body.len() < RETCODE_LEN {
        return false;
    }
    match body.len() % BLOCK_LEN {
        0 | 15 => false,
        3 | 4 => body[0] != b'{',
        _ => body.get(RETCODE_LEN) == Some(&b'{'),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const KEY: &[u8] = b"0123456789abcdef";

    fn codec(version: Version) -> FrameCodec {
        FrameCodec::new(version, KEY).unwrap()
    }

    #[test]
    fn test_command_codes_depend_on_version() {
        assert_eq!(CommandKind::Control.code(Version::V3_3), 7);
        assert_eq!(CommandKind::Control.code(Version::V3_5), 13);
        assert_eq!(CommandKind::DpQuery.code(Version::V3_3), 10);
        assert_eq!(CommandKind::DpQuery.code(Version::V3_5), 16);
        assert_eq!(CommandKind::from_code(Version::V3_5, 13), CommandKind::Control);
        assert_eq!(CommandKind::from_code(Version::V3_3, 13), CommandKind::Unknown);
        assert_eq!(CommandKind::from_code(Version::V3_3, 0x40), CommandKind::Unknown);
    }

    #[test]
    fn test_version_parsing() {
        assert_eq!("3.3".parse::<Version>().unwrap(), Version::V3_3);
        assert_eq!(Version::try_from(" 3.5 ").unwrap(), Version::V3_5);
        assert_eq!(
            "3.4".parse::<Version>(),
            Err(TuyaError::UnsupportedVersion("3.4".into()))
        );
        assert_eq!(Version::V3_5.to_string(), "3.5");
    }

    #[test]
    fn test_v33_dp_query_known_frame() {
        let codec = codec(Version::V3_3);
        let packed = codec.encode(&Frame::new(CommandKind::DpQuery, 0, "{}")).unwrap();
        assert_eq!(
            hex::encode(&packed),
            "000055aa000000000000000a00000018cb70ddc25a2a2045b4c13084418a9abb962553440000aa55"
        );

        let frame = codec.decode(&packed).unwrap();
        assert_eq!(frame.cmd, CommandKind::DpQuery);
        assert_eq!(frame.seqno, 0);
        assert_eq!(frame.retcode, None);
        assert_eq!(frame.payload, b"{}");
    }

    #[test]
    fn test_v33_control_has_version_header() {
        let codec = codec(Version::V3_3);
        let packed = codec
            .encode(&Frame::new(CommandKind::Control, 5, "{\"dps\":{\"1\":true}}"))
            .unwrap();
        assert_eq!(&packed[16..19], b"3.3");
        assert_eq!(&packed[19..31], &[0u8; 12]);
        assert_eq!(BigEndian::read_u32(&packed[12..16]) as usize, packed.len() - 16);

        let frame = codec.decode_as(&packed, Direction::ToDevice).unwrap();
        assert_eq!(frame.cmd, CommandKind::Control);
        assert_eq!(frame.payload, b"{\"dps\":{\"1\":true}}");
    }

    #[test]
    fn test_v33_device_frame_with_retcode() {
        let codec = codec(Version::V3_3);
        for cmd in [CommandKind::Status, CommandKind::HeartBeat, CommandKind::Control] {
            let sent = Frame::new(cmd, 9, "{\"dps\":{\"1\":false}}").with_retcode(0);
            let frame = codec.decode(&codec.encode(&sent).unwrap()).unwrap();
            assert_eq!(frame, sent);
        }

        let empty = Frame::new(CommandKind::HeartBeat, 2, Vec::new()).with_retcode(0);
        let decoded = codec.decode(&codec.encode(&empty).unwrap()).unwrap();
        assert_eq!(decoded.retcode, Some(0));
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_v33_plaintext_device_payload() {
        // Some devices answer with unencrypted JSON after the return code.
        let mut data = Vec::new();
        let body = b"\x00\x00\x00\x00{\"dps\":{\"1\":true}}";
        data.write_u32::<BigEndian>(PREFIX_55AA).unwrap();
        data.write_u32::<BigEndian>(3).unwrap();
        data.write_u32::<BigEndian>(8).unwrap();
        data.write_u32::<BigEndian>(body.len() as u32 + 8).unwrap();
        data.extend_from_slice(body);
        let crc = CRC32.checksum(&data);
        data.write_u32::<BigEndian>(crc).unwrap();
        data.write_u32::<BigEndian>(SUFFIX_55AA).unwrap();

        let frame = codec(Version::V3_3).decode(&data).unwrap();
        assert_eq!(frame.retcode, Some(0));
        assert_eq!(frame.cmd, CommandKind::Status);
        assert_eq!(frame.payload_json().unwrap()["dps"]["1"], true);
    }

    #[test]
    fn test_v33_parse_errors() {
        let codec = codec(Version::V3_3);
        assert_eq!(
            codec.decode(&[0u8; 10]),
            Err(TuyaError::Parse("packet too short".into()))
        );

        let packed = codec.encode(&Frame::new(CommandKind::DpQuery, 1, "{}")).unwrap();

        let mut bad_prefix = packed.clone();
        bad_prefix[3] = 0xAB;
        assert_eq!(codec.decode(&bad_prefix), Err(TuyaError::Parse("bad prefix".into())));

        let mut bad_suffix = packed.clone();
        let last = bad_suffix.len() - 1;
        bad_suffix[last] = 0x56;
        assert_eq!(codec.decode(&bad_suffix), Err(TuyaError::Parse("bad suffix".into())));

        let mut bad_crc = packed.clone();
        bad_crc[20] ^= 0x40;
        assert_eq!(codec.decode(&bad_crc), Err(TuyaError::Parse("crc mismatch".into())));

        assert_eq!(
            codec.decode(&packed[..packed.len() - 1]),
            Err(TuyaError::Parse("packet too short".into()))
        );

        // A v3.5 codec refuses 55AA frames.
        assert_eq!(
            FrameCodec::new(Version::V3_5, KEY).unwrap().decode(&packed),
            Err(TuyaError::Parse("bad prefix".into()))
        );
    }

    #[test]
    fn test_v35_layout() {
        let codec = codec(Version::V3_5);
        let nonce = *b"0123456789ab";
        let frame = Frame::new(CommandKind::DpQuery, 0x01020304, "{}");
        let packed = codec.encode_with_nonce(&frame, &nonce).unwrap();

        assert_eq!(BigEndian::read_u32(&packed[..4]), PREFIX_6699);
        assert_eq!(&packed[4..6], &[0, 0]);
        assert_eq!(BigEndian::read_u32(&packed[6..10]), 0x01020304);
        assert_eq!(BigEndian::read_u32(&packed[10..14]), 16);
        assert_eq!(BigEndian::read_u32(&packed[14..18]), 12 + 2 + 16);
        assert_eq!(&packed[18..30], &nonce);
        assert_eq!(BigEndian::read_u32(&packed[packed.len() - 4..]), SUFFIX_6699);

        let header = parse_header(&packed).unwrap();
        assert_eq!(header.total_length, packed.len());
        assert_eq!(header.version, Version::V3_5);

        let decoded = codec.decode_as(&packed, Direction::ToDevice).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_v35_device_frame_splits_retcode_and_version_header() {
        let codec = codec(Version::V3_5);
        let sent = Frame::new(CommandKind::Control, 7, "{\"dps\":{\"20\":true}}").with_retcode(0);
        let packed = codec.encode(&sent).unwrap();
        let frame = codec.decode(&packed).unwrap();
        assert_eq!(frame, sent);
        assert!(frame.has_data());
    }

    #[test]
    fn test_v35_unknown_command_degrades() {
        let codec = codec(Version::V3_5);
        let frame = Frame::new(CommandKind::Unknown, 1, "{}").with_retcode(0);
        let mut packed = codec.encode(&frame).unwrap();
        assert_eq!(BigEndian::read_u32(&packed[10..14]), UNKNOWN_COMMAND_CODE);

        let decoded = codec.decode(&packed).unwrap();
        assert_eq!(decoded.cmd, CommandKind::Unknown);
        assert_eq!(decoded.payload, b"{}");

        // The command code is authenticated data.
        BigEndian::write_u32(&mut packed[10..14], 0x40);
        assert!(matches!(codec.decode(&packed), Err(TuyaError::Crypto(_))));
    }

    #[test]
    fn test_v35_wrong_key_is_crypto_error() {
        let packed = codec(Version::V3_5)
            .encode(&Frame::new(CommandKind::Status, 1, "{}").with_retcode(0))
            .unwrap();
        let other = FrameCodec::new(Version::V3_5, b"fedcba9876543210").unwrap();
        assert!(matches!(other.decode(&packed), Err(TuyaError::Crypto(_))));
    }

    #[test]
    fn test_parse_header_limits() {
        let mut data = vec![0u8; 16];
        BigEndian::write_u32(&mut data[..4], PREFIX_55AA);
        BigEndian::write_u32(&mut data[12..16], MAX_DECLARED_LEN + 1);
        assert_eq!(
            parse_header(&data),
            Err(TuyaError::Parse("frame length exceeds limit".into()))
        );
        BigEndian::write_u32(&mut data[12..16], 4);
        assert_eq!(parse_header(&data), Err(TuyaError::Parse("bad length".into())));
        BigEndian::write_u32(&mut data[12..16], 24);
        assert_eq!(parse_header(&data).unwrap().total_length, 40);
    }

    #[test]
    fn test_payload_str_stops_at_nul() {
        let frame = Frame::new(CommandKind::Status, 0, b"{\"a\":1}\0\0garbage".to_vec());
        assert_eq!(frame.payload_str(), Some("{\"a\":1}"));
        assert!(frame.has_data());
        assert!(!Frame::new(CommandKind::Status, 0, "data unvalid").has_data());
    }

    fn any_cmd() -> impl Strategy<Value = CommandKind> {
        prop_oneof![
            Just(CommandKind::Control),
            Just(CommandKind::Status),
            Just(CommandKind::HeartBeat),
            Just(CommandKind::DpQuery),
            Just(CommandKind::SessKeyNegStart),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_round_trip_to_device(
            payload in prop::collection::vec(any::<u8>(), 0..4096),
            seqno in any::<u32>(),
            cmd in any_cmd(),
        ) {
            for version in Version::ALL {
                let codec = codec(*version);
                let sent = Frame::new(cmd, seqno, payload.clone());
                let decoded = codec.decode_as(&codec.encode(&sent).unwrap(), Direction::ToDevice).unwrap();
                prop_assert_eq!(decoded, sent);
            }
        }

        #[test]
        fn prop_round_trip_from_device(
            payload in prop::collection::vec(any::<u8>(), 0..4096),
            seqno in any::<u32>(),
            cmd in any_cmd(),
        ) {
            for version in Version::ALL {
                let codec = codec(*version);
                let sent = Frame::new(cmd, seqno, payload.clone()).with_retcode(0);
                let decoded = codec.decode(&codec.encode(&sent).unwrap()).unwrap();
                prop_assert_eq!(decoded, sent);
            }
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_v33_any_bit_flip_is_parse_error(
            payload in prop::collection::vec(any::<u8>(), 0..64),
            seqno in any::<u32>(),
        ) {
            let codec = codec(Version::V3_3);
            let packed = codec.encode(&Frame::new(CommandKind::Control, seqno, payload)).unwrap();
            for bit in 0..packed.len() * 8 {
                let mut flipped = packed.clone();
                flipped[bit / 8] ^= 1 << (bit % 8);
                let result = codec.decode_as(&flipped, Direction::ToDevice);
                prop_assert!(matches!(result, Err(TuyaError::Parse(_))), "bit {} -> {:?}", bit, result);
            }
        }

        #[test]
        fn prop_v35_any_bit_flip_fails(
            payload in prop::collection::vec(any::<u8>(), 0..64),
            seqno in any::<u32>(),
        ) {
            let codec = codec(Version::V3_5);
            let packed = codec.encode(&Frame::new(CommandKind::Control, seqno, payload)).unwrap();
            let suffix_start = packed.len() - 4;
            for bit in 0..packed.len() * 8 {
                let byte = bit / 8;
                let mut flipped = packed.clone();
                flipped[byte] ^= 1 << (bit % 8);
                let result = codec.decode(&flipped);
                prop_assert!(result.is_err(), "bit {} decoded", bit);
                if (HEADER_LEN_6699..suffix_start).contains(&byte) {
                    prop_assert!(matches!(result, Err(TuyaError::Crypto(_))), "bit {} -> {:?}", bit, result);
                }
            }
        }
    }
}
