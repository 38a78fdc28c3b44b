//! Wire framing. Two variants share one `Message` shape:
//!
//! - [`FramingVariant::JsonStream`]: a header `Value` followed immediately by
//!   a payload `Value`, with no delimiter between them. Boundaries are found
//!   by incremental JSON parsing rather than a length prefix.
//! - [`FramingVariant::LineDelimited`]: one JSON object per line, with header
//!   fields flattened alongside a `payload` field.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ConnectionError;
use crate::message::{Header, Message, MessageType};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FramingVariant {
    JsonStream,
    LineDelimited,
}

#[derive(Serialize, Deserialize)]
struct LineFrame {
    #[serde(flatten)]
    header: Header,
    #[serde(default)]
    payload: Value,
}

fn validate_message_type(value: &Value) -> Result<(), ConnectionError> {
    let raw = value
        .get("MessageType")
        .and_then(Value::as_str)
        .ok_or_else(|| ConnectionError::MalformedHeader("missing MessageType".to_string()))?;
    MessageType::from_wire_str(raw)
        .map(|_| ())
        .ok_or_else(|| ConnectionError::MalformedHeader(raw.to_string()))
}

/// Attempts to parse exactly one JSON value from the front of `buf`. Returns
/// `Ok(None)` when `buf` holds a valid-so-far but incomplete value (more
/// bytes are needed), and the consumed byte count alongside the value on
/// success.
fn try_parse_value(buf: &[u8]) -> Result<Option<(Value, usize)>, serde_json::Error> {
    let mut stream = serde_json::Deserializer::from_slice(buf).into_iter::<Value>();
    match stream.next() {
        Some(Ok(value)) => Ok(Some((value, stream.byte_offset()))),
        Some(Err(err)) if err.is_eof() => Ok(None),
        Some(Err(err)) => Err(err),
        None => Ok(None),
    }
}

async fn next_value<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
) -> Result<Option<Value>, ConnectionError> {
    loop {
        match try_parse_value(buf) {
            Ok(Some((value, consumed))) => {
                buf.drain(..consumed);
                return Ok(Some(value));
            }
            Ok(None) => {
                let mut chunk = [0u8; 4096];
                let n = reader.read(&mut chunk).await?;
                if n == 0 {
                    return if buf.iter().all(u8::is_ascii_whitespace) {
                        Ok(None)
                    } else {
                        Err(ConnectionError::TruncatedFrame)
                    };
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            Err(err) => return Err(ConnectionError::Decode(err)),
        }
    }
}

async fn decode_json_stream<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
) -> Result<Option<Message>, ConnectionError> {
    let Some(header_value) = next_value(reader, buf).await? else {
        return Ok(None);
    };
    validate_message_type(&header_value)?;
    let header: Header = serde_json::from_value(header_value).map_err(ConnectionError::Decode)?;
    let payload = next_value(reader, buf)
        .await?
        .ok_or(ConnectionError::TruncatedFrame)?;
    Ok(Some(Message::new(header, payload)))
}

async fn decode_line_delimited<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Message>, ConnectionError> {
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(None);
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(trimmed).map_err(ConnectionError::Decode)?;
        validate_message_type(&value)?;
        let frame: LineFrame = serde_json::from_value(value).map_err(ConnectionError::Decode)?;
        return Ok(Some(Message::new(frame.header, frame.payload)));
    }
}

/// Reads the next frame off `reader`, or `Ok(None)` on a clean end-of-stream
/// that falls exactly on a message boundary.
pub async fn decode_message<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    variant: FramingVariant,
    scratch: &mut Vec<u8>,
) -> Result<Option<Message>, ConnectionError> {
    match variant {
        FramingVariant::JsonStream => decode_json_stream(reader, scratch).await,
        FramingVariant::LineDelimited => decode_line_delimited(reader).await,
    }
}

pub fn encode_message(message: &Message, variant: FramingVariant) -> Result<Vec<u8>, ConnectionError> {
    match variant {
        FramingVariant::JsonStream => {
            let mut buf = serde_json::to_vec(&message.header).map_err(ConnectionError::Encode)?;
            let mut payload_buf =
                serde_json::to_vec(&message.payload).map_err(ConnectionError::Encode)?;
            buf.push(b'\n');
            buf.append(&mut payload_buf);
            buf.push(b'\n');
            Ok(buf)
        }
        FramingVariant::LineDelimited => {
            let frame = LineFrame { header: message.header.clone(), payload: message.payload.clone() };
            let mut buf = serde_json::to_vec(&frame).map_err(ConnectionError::Encode)?;
            buf.push(b'\n');
            Ok(buf)
        }
    }
}

pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
    variant: FramingVariant,
) -> Result<(), ConnectionError> {
    let bytes = encode_message(message, variant)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;
    use uuid::Uuid;

    #[tokio::test]
    async fn round_trips_json_stream_request() {
        let request_id = Uuid::new_v4();
        let message = Message::request(request_id, "Ping", serde_json::json!({"nonce": 7}));
        let bytes = encode_message(&message, FramingVariant::JsonStream).unwrap();

        let mut reader = BufReader::new(&bytes[..]);
        let mut scratch = Vec::new();
        let decoded = decode_message(&mut reader, FramingVariant::JsonStream, &mut scratch)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(decoded.header.request_id, request_id);
        assert_eq!(decoded.header.method.as_deref(), Some("Ping"));
        assert_eq!(decoded.payload, serde_json::json!({"nonce": 7}));
    }

    #[tokio::test]
    async fn round_trips_line_delimited_request_across_reads() {
        let request_id = Uuid::new_v4();
        let message = Message::success(request_id, serde_json::json!("ok"));
        let bytes = encode_message(&message, FramingVariant::LineDelimited).unwrap();

        let mut reader = BufReader::new(&bytes[..]);
        let mut scratch = Vec::new();
        let decoded = decode_message(&mut reader, FramingVariant::LineDelimited, &mut scratch)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(decoded.header.request_id, request_id);
        assert_eq!(decoded.payload, serde_json::json!("ok"));
    }

    #[tokio::test]
    async fn clean_eof_at_boundary_yields_none() {
        let mut reader = BufReader::new(&b""[..]);
        let mut scratch = Vec::new();
        let decoded = decode_message(&mut reader, FramingVariant::JsonStream, &mut scratch)
            .await
            .unwrap();
        assert!(decoded.is_none());
    }

    #[tokio::test]
    async fn truncated_json_stream_payload_is_an_error() {
        let header = Header::new(MessageType::Request, Uuid::new_v4()).with_method("Ping");
        let mut buf = serde_json::to_vec(&header).unwrap();
        buf.push(b'\n');
        buf.extend_from_slice(b"{\"partial\": tr");

        let mut reader = BufReader::new(&buf[..]);
        let mut scratch = Vec::new();
        let err = decode_message(&mut reader, FramingVariant::JsonStream, &mut scratch)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::TruncatedFrame));
    }

    #[tokio::test]
    async fn unknown_message_type_is_malformed_header() {
        let mut buf = br#"{"MessageType":"Bogus","RequestId":"#.to_vec();
        buf.extend_from_slice(format!("\"{}\"", Uuid::new_v4()).as_bytes());
        buf.extend_from_slice(b"}\n{}\n");

        let mut reader = BufReader::new(&buf[..]);
        let mut scratch = Vec::new();
        let err = decode_message(&mut reader, FramingVariant::JsonStream, &mut scratch)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::MalformedHeader(ref kind) if kind == "Bogus"));
    }
}
