//! Length-delimited JSON frame codec shared by the async host adapter and
//! the blocking worker binary.

use crate::error::{Error, Result};
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const LENGTH_PREFIX_BYTES: usize = 4;

/// Serialize `value` as a length-delimited JSON frame, returning `None`
/// (rather than the frame bytes) if it would exceed `max_frame_bytes`, per
/// spec §4.2's "frame exceeding maxFrameBytes is not sent".
pub fn encode_frame<T: Serialize>(value: &T, max_frame_bytes: u64) -> Result<Option<Vec<u8>>> {
    let payload = serde_json::to_vec(value)?;
    if payload.len() as u64 > max_frame_bytes {
        return Ok(None);
    }
    let mut framed = Vec::with_capacity(LENGTH_PREFIX_BYTES + payload.len());
    framed.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    framed.extend_from_slice(&payload);
    Ok(Some(framed))
}

/// Write one frame to an async writer.
pub async fn write_frame_async<W: AsyncWrite + Unpin, T: Serialize>(
    writer: &mut W,
    value: &T,
    max_frame_bytes: u64,
) -> Result<bool> {
    match encode_frame(value, max_frame_bytes)? {
        Some(bytes) => {
            writer
                .write_all(&bytes)
                .await
                .map_err(|e| Error::subprocess_comm(format!("frame write failed: {e}")))?;
            writer
                .flush()
                .await
                .map_err(|e| Error::subprocess_comm(format!("frame flush failed: {e}")))?;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Read one length-delimited JSON frame from an async reader. Returns
/// `Ok(None)` on clean EOF (peer closed the stream).
pub async fn read_frame_async<R: AsyncRead + Unpin, T: DeserializeOwned>(
    reader: &mut R,
    max_frame_bytes: u64,
) -> Result<Option<T>> {
    let mut len_buf = [0u8; LENGTH_PREFIX_BYTES];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(Error::subprocess_comm(format!("frame length read failed: {e}"))),
    }
    let len = u32::from_be_bytes(len_buf) as u64;
    if len > max_frame_bytes {
        return Err(Error::subprocess_comm(format!(
            "incoming frame of {len} bytes exceeds max_frame_bytes {max_frame_bytes}"
        )));
    }
    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| Error::subprocess_comm(format!("frame payload read failed: {e}")))?;
    let value = serde_json::from_slice(&payload)?;
    Ok(Some(value))
}

/// Blocking counterparts used by the worker binary, which speaks the same
/// wire format over plain `std::io` stdin/stdout.
pub mod blocking {
    use super::*;
    use std::io::{Read, Write};

    pub fn write_frame<W: Write, T: Serialize>(
        writer: &mut W,
        value: &T,
        max_frame_bytes: u64,
    ) -> Result<bool> {
        match encode_frame(value, max_frame_bytes)? {
            Some(bytes) => {
                writer
                    .write_all(&bytes)
                    .map_err(|e| Error::subprocess_comm(format!("frame write failed: {e}")))?;
                writer
                    .flush()
                    .map_err(|e| Error::subprocess_comm(format!("frame flush failed: {e}")))?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn read_frame<R: Read, T: DeserializeOwned>(
        reader: &mut R,
        max_frame_bytes: u64,
    ) -> Result<Option<T>> {
        let mut len_buf = [0u8; LENGTH_PREFIX_BYTES];
        match reader.read_exact(&mut len_buf) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(Error::subprocess_comm(format!("frame length read failed: {e}"))),
        }
        let len = u32::from_be_bytes(len_buf) as u64;
        if len > max_frame_bytes {
            return Err(Error::subprocess_comm(format!(
                "incoming frame of {len} bytes exceeds max_frame_bytes {max_frame_bytes}"
            )));
        }
        let mut payload = vec![0u8; len as usize];
        reader
            .read_exact(&mut payload)
            .map_err(|e| Error::subprocess_comm(format!("frame payload read failed: {e}")))?;
        let value = serde_json::from_slice(&payload)?;
        Ok(Some(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::protocol::HostToWorker;

    #[tokio::test]
    async fn frame_roundtrips_through_async_pipe() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let msg = HostToWorker::ExecRequest {
            request_id: 1,
            code: "print(2+2)".into(),
        };
        write_frame_async(&mut client, &msg, 4 * 1024 * 1024).await.unwrap();
        let received: HostToWorker = read_frame_async(&mut server, 4 * 1024 * 1024)
            .await
            .unwrap()
            .expect("expected a frame");
        match received {
            HostToWorker::ExecRequest { request_id, code } => {
                assert_eq!(request_id, 1);
                assert_eq!(code, "print(2+2)");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn frame_at_exactly_max_bytes_is_accepted() {
        let payload = "x".repeat(10);
        let json_len = serde_json::to_vec(&payload).unwrap().len() as u64;
        let encoded = encode_frame(&payload, json_len).unwrap();
        assert!(encoded.is_some());
    }

    #[test]
    fn frame_one_byte_over_max_is_rejected() {
        let payload = "x".repeat(10);
        let json_len = serde_json::to_vec(&payload).unwrap().len() as u64;
        let encoded = encode_frame(&payload, json_len - 1).unwrap();
        assert!(encoded.is_none());
    }

    #[tokio::test]
    async fn reader_observes_clean_eof_as_none() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        let result: Option<HostToWorker> = read_frame_async(&mut server, 4096).await.unwrap();
        assert!(result.is_none());
    }
}
