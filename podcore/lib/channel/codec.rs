use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{PodcoreError, PodcoreResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The fixed wire header size: 4-byte big-endian command code, 4-byte
/// big-endian payload length.
pub const HEADER_LEN: usize = 8;

/// The largest payload the codec will accept from the guest.
pub const MAX_PAYLOAD_LEN: u32 = 16 * 1024 * 1024;

/// Command code: start the pod; payload is the serialized guest spec.
pub const CMD_START_POD: u32 = 1;

/// Command code: execute a command in a container; payload is a JSON
/// `{cmd: [...], container: string}` object.
pub const CMD_EXEC: u32 = 2;

/// Command code: shut the guest down; empty payload.
pub const CMD_SHUTDOWN: u32 = 3;

/// Frame code used by the guest to report an init failure; payload is a
/// human-readable reason.
pub const CMD_GUEST_ERROR: u32 = 0xFFFF_FFFF;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// One frame of the init channel protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// The command code.
    pub code: u32,

    /// The payload bytes.
    pub payload: Bytes,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Encodes a frame as one contiguous buffer: header followed by payload.
pub fn encode_frame(code: u32, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u32(code);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

/// Reads one frame, accumulating across partial reads.
///
/// The length field is only trusted once all 8 header bytes have arrived;
/// the payload is then read until exactly that many bytes are satisfied.
pub async fn read_frame<R>(reader: &mut R) -> PodcoreResult<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;

    let code = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);

    if len > MAX_PAYLOAD_LEN {
        return Err(PodcoreError::ChannelProtocol(format!(
            "declared payload length {} exceeds maximum {}",
            len, MAX_PAYLOAD_LEN
        )));
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;

    crate::Ok(Frame {
        code,
        payload: Bytes::from(payload),
    })
}

/// Writes one frame as a single buffer write, so the payload follows the
/// header on the connection with no message interleaving.
pub async fn write_frame<W>(writer: &mut W, code: u32, payload: &[u8]) -> PodcoreResult<()>
where
    W: AsyncWrite + Unpin,
{
    let buf = encode_frame(code, payload);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    crate::Ok(())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    async fn round_trip(payload: Vec<u8>) -> anyhow::Result<Frame> {
        let (mut tx, mut rx) = tokio::io::duplex(4096);
        let expected_len = payload.len();

        let writer = tokio::spawn(async move {
            write_frame(&mut tx, CMD_EXEC, &payload).await.unwrap();
        });

        let frame = read_frame(&mut rx).await?;
        writer.await?;
        assert_eq!(frame.payload.len(), expected_len);
        Ok(frame)
    }

    #[test_log::test(tokio::test)]
    async fn test_codec_round_trips_empty_payload() -> anyhow::Result<()> {
        let frame = round_trip(Vec::new()).await?;
        assert_eq!(frame.code, CMD_EXEC);
        assert!(frame.payload.is_empty());
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_codec_round_trips_one_byte_payload() -> anyhow::Result<()> {
        let frame = round_trip(vec![0x42]).await?;
        assert_eq!(frame.payload.as_ref(), &[0x42]);
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_codec_round_trips_large_payload_across_chunks() -> anyhow::Result<()> {
        // A duplex buffer smaller than the message forces the reader to
        // accumulate across several partial reads.
        let payload: Vec<u8> = (0..2048u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let (mut tx, mut rx) = tokio::io::duplex(64);
        let writer = tokio::spawn(async move {
            write_frame(&mut tx, CMD_START_POD, &payload).await.unwrap();
        });

        let frame = read_frame(&mut rx).await?;
        writer.await?;
        assert_eq!(frame.code, CMD_START_POD);
        assert_eq!(frame.payload.as_ref(), expected.as_slice());
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_codec_header_split_mid_read_is_not_a_length() -> anyhow::Result<()> {
        let (mut tx, mut rx) = tokio::io::duplex(4096);
        let encoded = encode_frame(CMD_SHUTDOWN, b"xy");

        // Deliver the header in two fragments with a payload byte trailing;
        // the reader must not act on the first 4 bytes alone.
        let writer = tokio::spawn(async move {
            tx.write_all(&encoded[..5]).await.unwrap();
            tokio::task::yield_now().await;
            tx.write_all(&encoded[5..]).await.unwrap();
        });

        let frame = read_frame(&mut rx).await?;
        writer.await?;
        assert_eq!(frame.code, CMD_SHUTDOWN);
        assert_eq!(frame.payload.as_ref(), b"xy");
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_codec_rejects_oversized_declared_length() -> anyhow::Result<()> {
        let (mut tx, mut rx) = tokio::io::duplex(4096);
        let mut header = Vec::new();
        header.extend_from_slice(&CMD_EXEC.to_be_bytes());
        header.extend_from_slice(&u32::MAX.to_be_bytes());
        tx.write_all(&header).await?;

        let result = read_frame(&mut rx).await;
        assert!(matches!(result, Err(crate::PodcoreError::ChannelProtocol(_))));
        Ok(())
    }
}
