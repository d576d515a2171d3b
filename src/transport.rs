//! TCP plumbing shared by the negotiator and the client.
//! Connects with keepalive enabled and pulls whole frames off a byte stream.

use crate::error::{Result, TuyaError};
use crate::protocol::{Version, parse_header};
use log::{debug, warn};
use socket2::{SockRef, TcpKeepalive};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Bytes skipped while looking for a frame prefix before giving up.
pub const PREFIX_SCAN_LIMIT: usize = 1024;

const KEEPALIVE_IDLE: Duration = Duration::from_secs(30);

/// Open a TCP connection to a device.
pub async fn connect_stream(ip: &str, port: u16, connect_timeout: Duration) -> Result<TcpStream> {
    debug!("Connecting to {}:{}", ip, port);
    let stream = timeout(connect_timeout, TcpStream::connect((ip, port)))
        .await
        .map_err(|_| TuyaError::Timeout)??;

    stream.set_nodelay(true)?;
    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_IDLE);
    if let Err(e) = SockRef::from(&stream).set_tcp_keepalive(&keepalive) {
        warn!("Could not enable TCP keepalive for {}:{}: {}", ip, port, e);
    }
    Ok(stream)
}

/// Write one encoded frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    data: &[u8],
    io_timeout: Duration,
) -> Result<()> {
    timeout(io_timeout, writer.write_all(data))
        .await
        .map_err(|_| TuyaError::Timeout)??;
    Ok(())
}

/// Read one raw frame for `version`.
///
/// Waits indefinitely for the first byte and returns `Ok(None)` if the peer
/// closes the stream before sending one. Once a frame has started, the rest
/// must arrive within `io_timeout`.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    version: Version,
    io_timeout: Duration,
) -> Result<Option<Vec<u8>>> {
    let first = match reader.read_u8().await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    timeout(io_timeout, read_rest(reader, version, first))
        .await
        .map_err(|_| TuyaError::Timeout)?
        .map(Some)
}

async fn read_rest<R: AsyncRead + Unpin>(
    reader: &mut R,
    version: Version,
    first: u8,
) -> Result<Vec<u8>> {
    let prefix = version.prefix().to_be_bytes();
    let mut window = [first, 0, 0, 0];
    reader.read_exact(&mut window[1..]).await?;

    let mut skipped = 0;
    while window != prefix {
        if skipped == PREFIX_SCAN_LIMIT {
            return Err(TuyaError::Parse("frame prefix not found".into()));
        }
        window.rotate_left(1);
        window[3] = reader.read_u8().await?;
        skipped += 1;
    }
    if skipped > 0 {
        debug!("Skipped {} bytes before frame prefix", skipped);
    }

    let header_len = version.header_len();
    let mut frame = Vec::with_capacity(header_len + 128);
    frame.extend_from_slice(&window);
    frame.resize(header_len, 0);
    reader.read_exact(&mut frame[4..]).await?;

    let header = parse_header(&frame)?;
    frame.resize(header.total_length, 0);
    reader.read_exact(&mut frame[header_len..]).await?;
    Ok(frame)
}
