//! Wire format of the container control channel.
//!
//! One request and one response per TCP connection, each sent as a frame:
//! `[channel: u8] [len: u16 LE] [payload]`, payload being JSON.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ComputeError, Result};

pub const CHANNEL_CONTROL: u8 = 0x03;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ControlRequest {
    LoadAssembly { path: String },
    HealthCheck,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum ControlResponse {
    Ok,
    Unhealthy { reason: String },
    Error { message: String },
}

pub async fn write_frame<W>(writer: &mut W, channel: u8, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u16::try_from(payload.len()).map_err(|_| {
        ComputeError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("control payload of {} bytes exceeds the frame limit", payload.len()),
        ))
    })?;
    writer.write_u8(channel).await?;
    writer.write_u16_le(len).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. Returns (channel, payload).
pub async fn read_frame<R>(reader: &mut R) -> Result<(u8, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let channel = reader.read_u8().await?;
    let len = reader.read_u16_le().await?;
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok((channel, buf))
}

pub async fn send_message<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(message)?;
    write_frame(writer, CHANNEL_CONTROL, &payload).await
}

pub async fn receive_message<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let (channel, payload) = read_frame(reader).await?;
    if channel != CHANNEL_CONTROL {
        return Err(ComputeError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unexpected channel {channel:#04x}"),
        )));
    }
    Ok(serde_json::from_slice(&payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_use_tagged_json() {
        let json = serde_json::to_string(&ControlRequest::LoadAssembly {
            path: "/staging/7001/App.dll".into(),
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"loadAssembly","path":"/staging/7001/App.dll"}"#);
        assert_eq!(
            serde_json::to_string(&ControlRequest::HealthCheck).unwrap(),
            r#"{"type":"healthCheck"}"#
        );
    }

    #[test]
    fn responses_use_status_tag() {
        let parsed: ControlResponse =
            serde_json::from_str(r#"{"status":"unhealthy","reason":"assembly missing"}"#).unwrap();
        assert_eq!(
            parsed,
            ControlResponse::Unhealthy {
                reason: "assembly missing".into()
            }
        );
        assert_eq!(serde_json::to_string(&ControlResponse::Ok).unwrap(), r#"{"status":"ok"}"#);
    }

    #[tokio::test]
    async fn frame_layout_is_channel_length_payload() {
        let mut buf = Vec::new();
        write_frame(&mut buf, CHANNEL_CONTROL, b"hi").await.unwrap();
        assert_eq!(buf, vec![CHANNEL_CONTROL, 2, 0, b'h', b'i']);

        let mut reader = buf.as_slice();
        let (channel, payload) = read_frame(&mut reader).await.unwrap();
        assert_eq!(channel, CHANNEL_CONTROL);
        assert_eq!(payload, b"hi");
    }

    #[tokio::test]
    async fn oversized_payload_is_rejected() {
        let mut buf = Vec::new();
        let payload = vec![0u8; usize::from(u16::MAX) + 1];
        let err = write_frame(&mut buf, CHANNEL_CONTROL, &payload)
            .await
            .unwrap_err();
        assert!(
            matches!(err, ComputeError::Io(ref e) if e.kind() == std::io::ErrorKind::InvalidData),
            "{err:?}"
        );
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn wrong_channel_is_rejected() {
        let mut buf = Vec::new();
        write_frame(&mut buf, 0x01, b"{}").await.unwrap();
        let mut reader = buf.as_slice();
        let result: Result<ControlResponse> = receive_message(&mut reader).await;
        assert!(result.is_err());
    }
}
