//! The tagged message type and the wire framing.
//!
//! A connection carries a sequence of frames, one JSON object per line.
//! Line framing means a decoder can always tell where one frame ends
//! and the next begins, and keeps the stream inspectable with
//! netcat-style tools. The reserved disconnect frame drives the
//! graceful teardown handshake and is never handed to application
//! handlers.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::NetError;

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// A self-describing unit of application data.
///
/// `kind` names the payload type; the payload itself travels as a JSON
/// string, so the wire format stays language-neutral and the core never
/// depends on the application's types. A message is immutable once
/// constructed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    kind: String,
    payload: String,
}

impl Message {
    /// Encodes `payload` under the given type tag.
    pub fn new<T: Serialize>(kind: impl Into<String>, payload: &T) -> Result<Self, NetError> {
        Ok(Self {
            kind: kind.into(),
            payload: serde_json::to_string(payload)?,
        })
    }

    /// The type tag the receiver dispatches on.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Decodes the payload back into a concrete type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, NetError> {
        Ok(serde_json::from_str(&self.payload)?)
    }
}

/// Wire envelope. `Disconnect` carries no payload and is consumed by
/// the receive loop; everything else reaches the application as a
/// [`Message`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub(crate) enum Frame {
    Disconnect,
    Message(Message),
}

/// Reads one frame. `Ok(None)` means EOF. A line that does not decode
/// is consumed and reported as [`NetError::Protocol`], leaving the
/// stream usable for the next frame.
pub(crate) async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, NetError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        let bytes = reader.read_line(&mut line).await?;
        if bytes == 0 {
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if trimmed.is_empty() {
            continue;
        }

        return Ok(Some(serde_json::from_str(trimmed)?));
    }
}

/// Encodes one frame, appends the line delimiter, writes and flushes so
/// the peer sees it immediately.
pub(crate) async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), NetError>
where
    W: AsyncWrite + Unpin,
{
    let mut encoded = serde_json::to_vec(frame)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Ping {
        seq: u32,
        note: String,
    }

    #[test]
    fn payload_round_trip() {
        let original = Ping {
            seq: 7,
            note: "hello".into(),
        };
        let message = Message::new("ping", &original).expect("encode payload");
        assert_eq!(message.kind(), "ping");
        let decoded: Ping = message.decode().expect("decode payload");
        assert_eq!(decoded, original);
    }

    #[test]
    fn mismatched_payload_type_is_protocol_error() {
        #[derive(Debug, Deserialize)]
        struct Other {
            #[allow(dead_code)]
            id: u64,
        }

        let message = Message::new("ping", &Ping {
            seq: 1,
            note: "x".into(),
        })
        .expect("encode payload");
        let result = message.decode::<Other>();
        assert!(matches!(result, Err(NetError::Protocol(_))));
    }

    #[test]
    fn disconnect_frame_has_no_payload() {
        let encoded = serde_json::to_string(&Frame::Disconnect).expect("encode frame");
        assert_eq!(encoded, r#"{"frame":"disconnect"}"#);
    }

    #[tokio::test]
    async fn frame_round_trip() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut reader = tokio::io::BufReader::new(reader);
        let message = Message::new("ping", &Ping {
            seq: 1,
            note: "over the wire".into(),
        })
        .expect("encode payload");
        let frame = Frame::Message(message);

        write_frame(&mut writer, &frame).await.expect("write frame");
        let parsed = read_frame(&mut reader)
            .await
            .expect("read frame")
            .expect("expected a frame");

        assert_eq!(parsed, frame);
    }

    #[tokio::test]
    async fn undecodable_line_is_skippable() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut reader = tokio::io::BufReader::new(reader);

        writer
            .write_all(b"not a frame\n")
            .await
            .expect("write garbage");
        write_frame(&mut writer, &Frame::Disconnect)
            .await
            .expect("write frame");

        let garbage = read_frame(&mut reader).await;
        assert!(matches!(garbage, Err(NetError::Protocol(_))));

        // The bad line was consumed; the stream carries on.
        let next = read_frame(&mut reader)
            .await
            .expect("read frame")
            .expect("expected a frame");
        assert_eq!(next, Frame::Disconnect);
    }

    #[tokio::test]
    async fn blank_lines_are_ignored() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut reader = tokio::io::BufReader::new(reader);

        writer.write_all(b"\n\r\n").await.expect("write blanks");
        write_frame(&mut writer, &Frame::Disconnect)
            .await
            .expect("write frame");

        let next = read_frame(&mut reader)
            .await
            .expect("read frame")
            .expect("expected a frame");
        assert_eq!(next, Frame::Disconnect);
    }

    #[tokio::test]
    async fn eof_reads_as_none() {
        let (writer, reader) = tokio::io::duplex(1024);
        drop(writer);
        let mut reader = tokio::io::BufReader::new(reader);

        let result = read_frame(&mut reader).await.expect("read frame");
        assert!(result.is_none());
    }
}
